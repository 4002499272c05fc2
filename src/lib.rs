//! HTTP body compression middleware for Tower.
//!
//! This crate provides a Tower layer that compresses HTTP response bodies
//! and decompresses request bodies with a single configured codec (gzip by
//! default, deflate or zstd). Encoders and decoders
//! come from a shared [`CodecPool`] so their buffers are reused across
//! requests.
//!
//! # Example
//!
//! ```ignore
//! use http_body_compression::{Codec, CompressionLayer, CompressionLevel};
//! use tower::ServiceBuilder;
//!
//! let layer = CompressionLayer::with_codec(Codec::Gzip, CompressionLevel::Best)?
//!     .exclude_paths(["/metrics"])
//!     .decompress_requests();
//!
//! let service = ServiceBuilder::new()
//!     .layer(layer)
//!     .service(my_service);
//! ```
//!
//! # Request Decompression
//!
//! Request decompression is opt-in. With
//! [`CompressionLayer::decompress_requests`], a request whose
//! `Content-Encoding` names the configured codec gets a lazily decompressing
//! body; `Content-Encoding` and `Content-Length` are removed from its head.
//! A corrupt body surfaces as an [`Error::Decompression`] when the handler
//! reads it. Custom strategies implement [`DecompressRequest`].
//!
//! # Compression Rules
//!
//! The middleware will **not** compress responses when:
//! - The request path matches an excluded prefix, pattern or extension
//!   (`.png`, `.gif`, `.jpeg` and `.jpg` by default)
//! - The client's `Accept-Encoding` does not accept the codec
//! - The request is a protocol upgrade
//! - `Content-Encoding` header is already set
//! - `Content-Range` header is present (range responses)
//! - The status has no body (1xx, 204, 304)
//! - `Content-Type` is already compressed: `image/` (except `image/svg+xml`),
//!   `audio/`, `video/`, `font/woff*`, archives
//! - `Content-Type` starts with `application/grpc` (except `application/grpc-web`)
//! - The known body size is below the minimum size (default: 0 bytes)
//!
//! The middleware will **always flush** after each chunk when:
//! - `X-Accel-Buffering: no` header is present
//! - `Content-Type` is `text/event-stream`
//! - `Content-Type` starts with `application/grpc-web`
//!
//! # Response Modifications
//!
//! When compression is applied:
//! - `Content-Encoding` header is set to the codec used
//! - `Content-Length` header is removed (compressed size is unknown)
//! - `Accept-Ranges` header is removed
//! - `Vary` header includes `Accept-Encoding`

#![deny(missing_docs)]

mod body;
mod codec;
mod config;
mod decompress;
mod error;
mod future;
mod layer;
mod level;
mod policy;
mod pool;
mod service;

pub use body::CompressionBody;
pub use codec::Codec;
pub use config::CompressionConfig;
pub use decompress::{DecompressRequest, DecompressionBody, DefaultDecompress, NoDecompress};
pub use error::{BoxError, Error};
pub use future::ResponseFuture;
pub use layer::{CompressionLayer, DEFAULT_MIN_SIZE};
pub use level::CompressionLevel;
pub use policy::{DEFAULT_EXCLUDED_EXTENSIONS, Exclusions, Negotiation};
pub use pool::{CodecPool, DEFAULT_MAX_IDLE, Decoded, PooledDecoder, PooledEncoder};
pub use service::CompressionService;
