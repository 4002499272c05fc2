use crate::error::Error;
use crate::level::CompressionLevel;
use compression_codecs::{
    DecodeV2, EncodeV2,
    gzip::{GzipDecoder, GzipEncoder},
    zlib::{ZlibDecoder, ZlibEncoder},
    zstd::{ZstdDecoder, ZstdEncoder},
};
use compression_core::Level;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

const FLATE_LEVELS: RangeInclusive<i32> = 0..=9;
const ZSTD_LEVELS: RangeInclusive<i32> = 1..=22;

/// Supported compression codecs.
///
/// A middleware instance is configured with exactly one codec; its token is
/// both the request marker that triggers decompression and the response
/// `Content-Encoding` written when compression activates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Gzip compression.
    #[default]
    Gzip,
    /// Deflate compression, zlib-wrapped as HTTP defines it.
    Deflate,
    /// Zstd compression.
    Zstd,
}

impl Codec {
    /// Returns the Content-Encoding header value for this codec.
    pub fn content_encoding(&self) -> &'static str {
        match self {
            Codec::Gzip => "gzip",
            Codec::Deflate => "deflate",
            Codec::Zstd => "zstd",
        }
    }

    /// Parses a `Content-Encoding` value naming a single codec.
    ///
    /// Lists and unknown tokens yield `None`, which callers treat as
    /// pass-through.
    pub fn from_content_encoding(value: &str) -> Option<Codec> {
        let value = value.trim();
        [Codec::Gzip, Codec::Deflate, Codec::Zstd]
            .into_iter()
            .find(|codec| codec.matches_token(value))
    }

    /// Checks whether `level` is usable with this codec.
    pub fn validate_level(&self, level: CompressionLevel) -> Result<(), Error> {
        let valid = match (self, level) {
            (_, CompressionLevel::Default | CompressionLevel::Fastest | CompressionLevel::Best) => {
                true
            }
            (Codec::Gzip | Codec::Deflate, CompressionLevel::None) => true,
            (Codec::Zstd, CompressionLevel::None) => false,
            (Codec::Gzip | Codec::Deflate, CompressionLevel::Precise(n)) => {
                FLATE_LEVELS.contains(&n)
            }
            (Codec::Zstd, CompressionLevel::Precise(n)) => ZSTD_LEVELS.contains(&n),
        };

        if valid {
            Ok(())
        } else {
            Err(Error::InvalidLevel {
                codec: *self,
                level,
            })
        }
    }

    /// Creates a new encoder for this codec.
    ///
    /// The level must already have passed [`Codec::validate_level`].
    pub(crate) fn encoder(&self, level: CompressionLevel) -> Box<dyn EncodeV2 + Send> {
        match self {
            Codec::Gzip => Box::new(GzipEncoder::new(flate_level(level).into())),
            Codec::Deflate => Box::new(ZlibEncoder::new(flate_level(level).into())),
            Codec::Zstd => Box::new(ZstdEncoder::new(zstd_level(level))),
        }
    }

    /// Creates a new decoder for this codec.
    pub(crate) fn decoder(&self) -> Box<dyn DecodeV2 + Send> {
        match self {
            Codec::Gzip => Box::new(GzipDecoder::new()),
            Codec::Deflate => Box::new(ZlibDecoder::new()),
            Codec::Zstd => Box::new(ZstdDecoder::new()),
        }
    }

    /// Returns whether an `Accept-Encoding` header value accepts this codec.
    ///
    /// The header value is expected to be comma-separated encodings with optional
    /// quality values (e.g., "gzip, br;q=1.0, zstd;q=0.8"). An explicit entry for
    /// the codec wins over a `*` wildcard; a quality of 0 rejects.
    pub fn accepted_by(&self, accept_encoding: &str) -> bool {
        let mut wildcard = None;

        for part in accept_encoding.split(',') {
            let (encoding, quality) = parse_encoding_with_quality(part.trim());

            if encoding == "*" {
                wildcard = Some(quality > 0.0);
            } else if self.matches_token(encoding) {
                return quality > 0.0;
            }
        }

        wildcard.unwrap_or(false)
    }

    fn matches_token(&self, token: &str) -> bool {
        match self {
            Codec::Gzip => token.eq_ignore_ascii_case("gzip") || token.eq_ignore_ascii_case("x-gzip"),
            Codec::Deflate => token.eq_ignore_ascii_case("deflate"),
            Codec::Zstd => token.eq_ignore_ascii_case("zstd"),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.content_encoding())
    }
}

fn flate_level(level: CompressionLevel) -> Level {
    match level {
        CompressionLevel::Default => Level::Default,
        CompressionLevel::None => Level::Precise(0),
        CompressionLevel::Fastest => Level::Fastest,
        CompressionLevel::Best => Level::Best,
        CompressionLevel::Precise(n) => Level::Precise(n),
    }
}

fn zstd_level(level: CompressionLevel) -> i32 {
    match level {
        CompressionLevel::Default => 3, // level 3 is a good default
        CompressionLevel::None | CompressionLevel::Fastest => 1,
        // 20 and up need the ultra window sizes
        CompressionLevel::Best => 19,
        CompressionLevel::Precise(n) => n,
    }
}

/// Parses an encoding entry like "gzip" or "br;q=0.8" into (encoding, quality).
fn parse_encoding_with_quality(s: &str) -> (&str, f32) {
    let mut parts = s.splitn(2, ';');
    let encoding = parts.next().unwrap_or("").trim();

    let quality = parts
        .next()
        .and_then(|q| {
            let q = q.trim();
            if q.starts_with("q=") || q.starts_with("Q=") {
                q[2..].trim().parse::<f32>().ok()
            } else {
                None
            }
        })
        .unwrap_or(1.0);

    (encoding, quality)
}
