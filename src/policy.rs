//! Negotiation policy.
//!
//! Request-time rules decide, from the request head alone, whether the
//! request body is decompressed and whether response compression is
//! tentatively enabled. Response-time rules run on the response head and
//! can still veto compression (content already encoded, incompressible
//! content type, body too small).

use crate::codec::Codec;
use crate::decompress;
use crate::error::Error;
use http::{HeaderMap, Request, StatusCode, Uri, header};
use http_body::SizeHint;
use regex::Regex;
use std::collections::HashSet;

/// File extensions excluded from compression unless configured otherwise.
pub const DEFAULT_EXCLUDED_EXTENSIONS: [&str; 4] = [".png", ".gif", ".jpeg", ".jpg"];

/// Per-request compression decision, fixed before the handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// Neither direction is touched.
    Skip,
    /// Only the request body is decompressed.
    DecompressRequest,
    /// Only the response may be compressed.
    CompressResponse,
    /// Request decompressed and response may be compressed.
    Both,
}

impl Negotiation {
    fn from_flags(decompress_request: bool, compress_response: bool) -> Self {
        match (decompress_request, compress_response) {
            (false, false) => Negotiation::Skip,
            (true, false) => Negotiation::DecompressRequest,
            (false, true) => Negotiation::CompressResponse,
            (true, true) => Negotiation::Both,
        }
    }

    /// Whether the request body is routed through the decompression gate.
    pub fn decompresses_request(self) -> bool {
        matches!(self, Negotiation::DecompressRequest | Negotiation::Both)
    }

    /// Whether response compression is tentatively enabled.
    pub fn compresses_response(self) -> bool {
        matches!(self, Negotiation::CompressResponse | Negotiation::Both)
    }
}

/// Request paths and extensions that are never compressed.
#[derive(Debug, Clone)]
pub struct Exclusions {
    extensions: HashSet<String>,
    paths: Vec<String>,
    patterns: Vec<Regex>,
}

impl Exclusions {
    /// Creates exclusions matching nothing.
    pub fn none() -> Self {
        Self {
            extensions: HashSet::new(),
            paths: Vec::new(),
            patterns: Vec::new(),
        }
    }

    /// Replaces the excluded extensions. A leading dot is optional.
    pub fn extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|ext| normalize_extension(ext.as_ref()))
            .filter(|ext| !ext.is_empty())
            .collect();
        self
    }

    /// Adds excluded path prefixes.
    pub fn paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Adds excluded path regular expressions.
    pub fn patterns<I, S>(mut self, patterns: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            self.patterns.push(Regex::new(pattern.as_ref())?);
        }
        Ok(self)
    }

    /// Returns whether the request target is excluded.
    pub fn matches(&self, uri: &Uri) -> bool {
        let path = uri.path();

        if self.paths.iter().any(|prefix| path.starts_with(prefix.as_str())) {
            return true;
        }

        if self.patterns.iter().any(|re| re.is_match(path)) {
            return true;
        }

        extension(path).is_some_and(|ext| self.extensions.contains(&ext.to_ascii_lowercase()))
    }
}

impl Default for Exclusions {
    fn default() -> Self {
        Self::none().extensions(DEFAULT_EXCLUDED_EXTENSIONS)
    }
}

fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Extension of the last path segment, without the dot.
fn extension(path: &str) -> Option<&str> {
    let segment = path.rsplit('/').next()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    (!stem.is_empty() && !ext.is_empty()).then_some(ext)
}

/// Evaluates the request-time rules.
///
/// `gate_enabled` is false when the decompression strategy never replaces
/// request bodies; flagged requests are then recorded as not decompressed.
pub(crate) fn negotiate<B>(
    request: &Request<B>,
    codec: Codec,
    exclusions: &Exclusions,
    gate_enabled: bool,
) -> Negotiation {
    let decompress_request = gate_enabled && decompress::is_flagged(request, codec);

    let compress_response = if exclusions.matches(request.uri()) {
        tracing::trace!(path = request.uri().path(), "response compression excluded");
        false
    } else {
        accepts(request.headers(), codec) && !is_upgrade(request.headers())
    };

    Negotiation::from_flags(decompress_request, compress_response)
}

fn accepts(headers: &HeaderMap, codec: Codec) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| codec.accepted_by(v))
}

/// Checks for a protocol upgrade, which has no body to compress.
fn is_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Response-time rules.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResponsePolicy {
    pub(crate) min_size: usize,
}

impl ResponsePolicy {
    /// Returns the reason compression is vetoed for this response, if any.
    pub(crate) fn veto(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        size_hint: &SizeHint,
    ) -> Option<&'static str> {
        if has_content_encoding(headers) {
            Some("content-encoding already set")
        } else if has_content_range(headers) {
            Some("range response")
        } else if !status_has_body(status) {
            Some("status has no body")
        } else if is_uncompressible_content_type(headers) {
            Some("uncompressible content type")
        } else if is_below_min_size(headers, size_hint, self.min_size) {
            Some("below minimum size")
        } else {
            None
        }
    }
}

/// Checks if Content-Encoding header is already present.
fn has_content_encoding(headers: &HeaderMap) -> bool {
    headers.contains_key(header::CONTENT_ENCODING)
}

/// Checks if Content-Range header is present (range response).
fn has_content_range(headers: &HeaderMap) -> bool {
    headers.contains_key(header::CONTENT_RANGE)
}

fn status_has_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// Checks if the content type should not be compressed.
fn is_uncompressible_content_type(headers: &HeaderMap) -> bool {
    let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let content_type = content_type.trim().to_ascii_lowercase();

    // Skip all images except SVG
    if content_type.starts_with("image/") {
        return !content_type.starts_with("image/svg+xml");
    }

    // Skip gRPC except grpc-web
    if content_type.starts_with("application/grpc") {
        return !content_type.starts_with("application/grpc-web");
    }

    content_type.starts_with("audio/")
        || content_type.starts_with("video/")
        || content_type.starts_with("font/woff")
        || [
            "application/zip",
            "application/gzip",
            "application/x-gzip",
            "application/zstd",
            "application/x-7z-compressed",
            "application/vnd.rar",
            "application/x-rar-compressed",
        ]
        .iter()
        .any(|ct| content_type.starts_with(ct))
}

/// Checks if the content type requires always flushing (e.g., streaming).
pub(crate) fn is_streaming(headers: &HeaderMap) -> bool {
    let no_buffering = headers
        .get("x-accel-buffering")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("no"));

    no_buffering
        || headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| {
                ct.starts_with("text/event-stream") || ct.starts_with("application/grpc-web")
            })
}

/// Checks if the known body size is below the minimum size.
fn is_below_min_size(headers: &HeaderMap, size_hint: &SizeHint, min_size: usize) -> bool {
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    content_length
        .or_else(|| size_hint.exact())
        .is_some_and(|len| len < min_size as u64)
}
