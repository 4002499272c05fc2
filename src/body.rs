use crate::error::Error;
use crate::pool::PooledEncoder;
use bytes::{Buf, Bytes};
use http_body::{Body, Frame};
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

pin_project! {
    /// A response body that may be compressed.
    ///
    /// This type wraps an inner body and either compresses it using a
    /// pooled encoder or passes it through unchanged.
    #[project = CompressionBodyProj]
    #[allow(missing_docs)]
    pub enum CompressionBody<B> {
        /// Compressed body with encoder.
        Compressed {
            #[pin]
            inner: B,
            state: CompressedBody,
        },
        /// Passthrough body without compression.
        Passthrough {
            #[pin]
            inner: B,
        },
    }
}

/// State for an actively compressed body.
pub(crate) struct CompressedBody {
    encoder: Option<PooledEncoder>,
    always_flush: bool,
    state: CompressState,
    pending_trailers: Option<http::HeaderMap>,
}

/// State machine for compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompressState {
    /// Reading data from inner body and compressing.
    Reading,
    /// Finishing compression after inner body is done.
    Finishing,
    /// Emitting buffered trailers.
    Trailers,
    /// Compression is complete.
    Done,
}

impl CompressedBody {
    fn new(encoder: PooledEncoder, always_flush: bool) -> Self {
        Self {
            encoder: Some(encoder),
            always_flush,
            state: CompressState::Reading,
            pending_trailers: None,
        }
    }

    /// Returns the current compression state.
    pub(crate) fn state(&self) -> CompressState {
        self.state
    }

    /// Returns whether always flush is enabled.
    #[cfg(test)]
    pub(crate) fn always_flush(&self) -> bool {
        self.always_flush
    }

    /// Polls the inner body and compresses data.
    fn poll_compressed<B>(
        &mut self,
        cx: &mut Context<'_>,
        mut inner: Pin<&mut B>,
    ) -> Poll<Option<Result<Frame<Bytes>, Error>>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        loop {
            match self.state {
                CompressState::Done => return Poll::Ready(None),

                CompressState::Trailers => {
                    self.state = CompressState::Done;
                    if let Some(trailers) = self.pending_trailers.take() {
                        return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
                    }
                    return Poll::Ready(None);
                }

                CompressState::Finishing => {
                    let footer = match self.encoder.as_mut() {
                        Some(encoder) => encoder.finish(),
                        None => Err(io::Error::other("encoder already released")),
                    };

                    match footer {
                        Ok(data) => {
                            self.state = if self.pending_trailers.is_some() {
                                CompressState::Trailers
                            } else {
                                CompressState::Done
                            };
                            // release before handing out the last bytes
                            self.encoder.take();

                            if !data.is_empty() {
                                return Poll::Ready(Some(Ok(Frame::data(data))));
                            }
                        }
                        Err(e) => return Poll::Ready(Some(Err(self.fail(Error::Compression(e))))),
                    }
                }

                CompressState::Reading => {
                    // Poll inner body for data
                    match inner.as_mut().poll_frame(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(None) => {
                            // Inner body is done, transition to finishing
                            self.state = CompressState::Finishing;
                        }
                        Poll::Ready(Some(Err(e))) => {
                            return Poll::Ready(Some(Err(self.fail(Error::Write(e.into())))));
                        }
                        Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                            Ok(mut data) => {
                                let input = data.copy_to_bytes(data.remaining());
                                match self.compress_chunk(&input) {
                                    Ok(output) if output.is_empty() => {}
                                    Ok(output) => return Poll::Ready(Some(Ok(Frame::data(output)))),
                                    Err(e) => {
                                        return Poll::Ready(Some(Err(
                                            self.fail(Error::Compression(e))
                                        )));
                                    }
                                }
                            }
                            Err(frame) => {
                                if let Ok(trailers) = frame.into_trailers() {
                                    // Buffer trailers and finish compression first
                                    self.pending_trailers = Some(trailers);
                                    self.state = CompressState::Finishing;
                                }
                            }
                        },
                    }
                }
            }
        }
    }

    /// Compresses a chunk of input data.
    fn compress_chunk(&mut self, input: &[u8]) -> io::Result<Bytes> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(io::Error::other("encoder already released"));
        };

        let output = encoder.encode(input)?;

        // Flush if always_flush is enabled
        if self.always_flush {
            let flushed = encoder.flush()?;
            if !flushed.is_empty() {
                let mut all_output = Vec::with_capacity(output.len() + flushed.len());
                all_output.extend_from_slice(&output);
                all_output.extend_from_slice(&flushed);
                return Ok(all_output.into());
            }
        }

        Ok(output)
    }

    /// Stops the stream after an error; the encoder may be mid-frame so it
    /// is not returned to the pool.
    fn fail(&mut self, error: Error) -> Error {
        tracing::warn!(error = %error, "response compression aborted");
        self.state = CompressState::Done;
        self.pending_trailers = None;
        if let Some(encoder) = self.encoder.take() {
            encoder.discard();
        }
        error
    }
}

impl<B> CompressionBody<B> {
    /// Creates a body compressed with `encoder`.
    pub fn compressed(inner: B, encoder: PooledEncoder, always_flush: bool) -> Self {
        Self::Compressed {
            inner,
            state: CompressedBody::new(encoder, always_flush),
        }
    }

    /// Creates a passthrough body without compression.
    pub fn passthrough(inner: B) -> Self {
        Self::Passthrough { inner }
    }

    /// Returns whether this body is being compressed.
    pub fn is_compressed(&self) -> bool {
        matches!(self, CompressionBody::Compressed { .. })
    }
}

impl<B> Body for CompressionBody<B>
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
            CompressionBodyProj::Passthrough { inner } => {
                // Pass through frames, converting data to Bytes
                match inner.poll_frame(cx) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(None) => Poll::Ready(None),
                    Poll::Ready(Some(Ok(frame))) => {
                        let frame = frame.map_data(|mut data| data.copy_to_bytes(data.remaining()));
                        Poll::Ready(Some(Ok(frame)))
                    }
                    Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(Error::Write(e.into())))),
                }
            }
            CompressionBodyProj::Compressed { inner, state } => state.poll_compressed(cx, inner),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            CompressionBody::Passthrough { inner } => inner.is_end_stream(),
            CompressionBody::Compressed { state, .. } => state.state() == CompressState::Done,
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        match self {
            CompressionBody::Passthrough { inner } => inner.size_hint(),
            // Compressed size is unknown
            CompressionBody::Compressed { .. } => http_body::SizeHint::default(),
        }
    }
}
