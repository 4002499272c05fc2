use crate::codec::Codec;
use crate::level::CompressionLevel;
use std::io;

/// Boxed error type used for errors coming out of wrapped bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by the compression middleware.
///
/// `InvalidLevel` and `InvalidPattern` are construction errors and abort
/// middleware setup. The remaining variants are per-request and surface
/// as body errors on the request or response they belong to.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The compression level is outside the codec's supported range.
    #[error("invalid {codec} compression level: {level}")]
    InvalidLevel {
        /// Codec the level was checked against.
        codec: Codec,
        /// The rejected level.
        level: CompressionLevel,
    },

    /// An excluded path pattern failed to compile.
    #[error("invalid excluded path pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// The request body is not a valid compressed stream.
    #[error("failed to decompress request body: {0}")]
    Decompression(#[source] io::Error),

    /// The encoder failed while compressing the response body.
    #[error("failed to compress response body: {0}")]
    Compression(#[source] io::Error),

    /// The wrapped request body failed while being read.
    #[error("request body read failed: {0}")]
    Read(#[source] BoxError),

    /// The wrapped response body failed while being written through.
    #[error("response body write failed: {0}")]
    Write(#[source] BoxError),
}

impl Error {
    /// Returns `true` for errors raised while decompressing a request body.
    pub fn is_decompression(&self) -> bool {
        matches!(self, Error::Decompression(_))
    }
}
