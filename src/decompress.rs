//! Request decompression gate.
//!
//! Requests whose `Content-Encoding` names the configured codec get their
//! body replaced through a [`DecompressRequest`] strategy. Everything else
//! passes through untouched.

use crate::codec::Codec;
use crate::error::Error;
use crate::pool::{CodecPool, PooledDecoder};
use bytes::{Buf, Bytes, BytesMut};
use http::{Request, header, request};
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Strategy used to replace the body of a compressed request.
///
/// The gate calls [`decompress`](Self::decompress) for requests flagged with
/// the configured codec and [`pass_through`](Self::pass_through) for all
/// others, so both paths produce the same body type.
pub trait DecompressRequest<B> {
    /// Body type handed to the inner service.
    type Body;

    /// Whether the gate is active at all. Disabled strategies never get a
    /// decoder.
    fn enabled(&self) -> bool {
        true
    }

    /// Replaces a compressed body. `parts` may be adjusted to describe the
    /// new body.
    fn decompress(
        &self,
        parts: &mut request::Parts,
        body: B,
        decoder: PooledDecoder,
    ) -> Self::Body;

    /// Wraps a body that is not compressed with the configured codec.
    fn pass_through(&self, body: B) -> Self::Body;
}

/// Leaves request bodies alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDecompress;

impl<B> DecompressRequest<B> for NoDecompress {
    type Body = B;

    fn enabled(&self) -> bool {
        false
    }

    fn decompress(&self, _parts: &mut request::Parts, body: B, _decoder: PooledDecoder) -> B {
        body
    }

    fn pass_through(&self, body: B) -> B {
        body
    }
}

/// Decompresses flagged request bodies on the fly.
///
/// The `Content-Encoding` and `Content-Length` headers are removed from the
/// request since they describe the compressed payload. An invalid stream is
/// reported as an [`Error::Decompression`] from the body and its decoder is
/// discarded; the handler decides what response that maps to.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDecompress;

impl<B> DecompressRequest<B> for DefaultDecompress
where
    B: Body,
{
    type Body = DecompressionBody<B>;

    fn decompress(
        &self,
        parts: &mut request::Parts,
        body: B,
        decoder: PooledDecoder,
    ) -> DecompressionBody<B> {
        parts.headers.remove(header::CONTENT_ENCODING);
        parts.headers.remove(header::CONTENT_LENGTH);
        DecompressionBody::decoding(body, decoder)
    }

    fn pass_through(&self, body: B) -> DecompressionBody<B> {
        DecompressionBody::passthrough(body)
    }
}

/// Returns whether the request is flagged as compressed with `codec`.
///
/// Missing or unparsable headers count as not flagged.
pub(crate) fn is_flagged<B>(request: &Request<B>, codec: Codec) -> bool {
    request
        .headers()
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .and_then(Codec::from_content_encoding)
        == Some(codec)
}

/// Applies the gate to `request`.
pub(crate) fn gate<B, D>(
    request: Request<B>,
    decompress: bool,
    codec: Codec,
    pool: &Arc<CodecPool>,
    strategy: &D,
) -> Request<D::Body>
where
    D: DecompressRequest<B>,
{
    let (mut parts, body) = request.into_parts();

    let body = if decompress && strategy.enabled() {
        let decoder = pool.acquire_decoder(codec);
        tracing::trace!(%codec, decoder = decoder.id(), "decompressing request body");
        strategy.decompress(&mut parts, body, decoder)
    } else {
        strategy.pass_through(body)
    };

    Request::from_parts(parts, body)
}

pin_project! {
    /// A request body that may be decompressed.
    ///
    /// Decoding is lazy: an invalid stream is only detected when the
    /// handler reads the body. The decoder goes back to the pool as soon as
    /// the stream ends, or when the body is dropped.
    #[project = DecompressionBodyProj]
    #[allow(missing_docs)]
    pub enum DecompressionBody<B> {
        /// Body being decompressed.
        Decoding {
            #[pin]
            inner: B,
            state: DecodingBody,
        },
        /// Passthrough body without decompression.
        Passthrough {
            #[pin]
            inner: B,
        },
    }
}

/// Decoder and bookkeeping for an actively decompressed body.
pub(crate) struct DecodingBody {
    decoder: Option<PooledDecoder>,
    pending: Bytes,
    member_done: bool,
    done: bool,
}

impl DecodingBody {
    fn new(decoder: PooledDecoder) -> Self {
        Self {
            decoder: Some(decoder),
            pending: Bytes::new(),
            member_done: false,
            done: false,
        }
    }

    fn poll_decoded<B>(
        &mut self,
        cx: &mut Context<'_>,
        mut inner: Pin<&mut B>,
    ) -> Poll<Option<Result<Frame<Bytes>, Error>>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        loop {
            if self.done {
                return Poll::Ready(None);
            }

            if !self.pending.is_empty() {
                let input = std::mem::take(&mut self.pending);
                match self.decode(&input) {
                    Ok(output) if output.is_empty() => continue,
                    Ok(output) => return Poll::Ready(Some(Ok(Frame::data(output)))),
                    Err(e) => return Poll::Ready(Some(Err(self.fail(Error::Decompression(e))))),
                }
            }

            match inner.as_mut().poll_frame(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    if !self.member_done {
                        let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
                        return Poll::Ready(Some(Err(self.fail(Error::Decompression(eof)))));
                    }
                    self.complete();
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(self.fail(Error::Read(e.into())))));
                }
                Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                    Ok(mut data) => {
                        self.pending = data.copy_to_bytes(data.remaining());
                    }
                    Err(frame) => {
                        let Ok(trailers) = frame.into_trailers() else {
                            continue;
                        };
                        if !self.member_done {
                            let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
                            return Poll::Ready(Some(Err(self.fail(Error::Decompression(eof)))));
                        }
                        self.complete();
                        return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
                    }
                },
            }
        }
    }

    /// Decodes a chunk, starting a new member when the previous one ended.
    fn decode(&mut self, input: &[u8]) -> io::Result<Bytes> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Err(io::Error::other("decoder already released"));
        };

        let mut all_output = BytesMut::new();
        let mut rest = input;

        while !rest.is_empty() {
            if self.member_done {
                decoder.reset()?;
                self.member_done = false;
            }

            let decoded = decoder.decode(rest)?;
            all_output.extend_from_slice(&decoded.output);
            rest = &rest[decoded.consumed..];

            if decoded.done {
                self.member_done = true;
            } else if !rest.is_empty() {
                return Err(io::Error::other("decoder made no progress"));
            }
        }

        Ok(all_output.freeze())
    }

    fn complete(&mut self) {
        self.done = true;
        // release as soon as the stream ends
        self.decoder.take();
    }

    fn fail(&mut self, error: Error) -> Error {
        tracing::debug!(error = %error, "request body decompression failed");
        self.done = true;
        if let Some(decoder) = self.decoder.take() {
            decoder.discard();
        }
        error
    }
}

impl<B> DecompressionBody<B> {
    /// Creates a body that decompresses `inner` with `decoder`.
    pub fn decoding(inner: B, decoder: PooledDecoder) -> Self {
        Self::Decoding {
            inner,
            state: DecodingBody::new(decoder),
        }
    }

    /// Creates a passthrough body without decompression.
    pub fn passthrough(inner: B) -> Self {
        Self::Passthrough { inner }
    }
}

impl<B> Body for DecompressionBody<B>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project() {
            DecompressionBodyProj::Passthrough { inner } => match inner.poll_frame(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(
                    frame.map_data(|mut data| data.copy_to_bytes(data.remaining()))
                ))),
                Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(Error::Read(e.into())))),
            },
            DecompressionBodyProj::Decoding { inner, state } => state.poll_decoded(cx, inner),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            DecompressionBody::Passthrough { inner } => inner.is_end_stream(),
            DecompressionBody::Decoding { state, .. } => state.done,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            DecompressionBody::Passthrough { inner } => inner.size_hint(),
            // Decompressed size is unknown
            DecompressionBody::Decoding { .. } => SizeHint::default(),
        }
    }
}
