//! Process-wide pool of reusable codec state.
//!
//! Encoders are keyed by `(Codec, CompressionLevel)`, decoders by `Codec`.
//! Handles are checked out through RAII guards ([`PooledEncoder`],
//! [`PooledDecoder`]) which reset and return the handle when dropped, so
//! every exit path of a request (completion, early drop, cancellation,
//! panic unwinding) runs the release path. A handle whose state became
//! indeterminate after an error is discarded instead.

use crate::codec::Codec;
use crate::error::Error;
use crate::level::CompressionLevel;
use bytes::{Bytes, BytesMut};
use compression_codecs::{DecodeV2, EncodeV2};
use compression_core::util::{PartialBuffer, WriteBuffer};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const OUTPUT_BUFFER_SIZE: usize = 8 * 1024; // 8KB output buffer

/// Default number of idle handles kept per pool key.
pub const DEFAULT_MAX_IDLE: usize = 64;

static GLOBAL: Lazy<Arc<CodecPool>> = Lazy::new(|| Arc::new(CodecPool::new()));

/// A concurrency-safe pool of encoders and decoders.
pub struct CodecPool {
    encoders: Mutex<HashMap<(Codec, CompressionLevel), Vec<EncoderHandle>>>,
    decoders: Mutex<HashMap<Codec, Vec<DecoderHandle>>>,
    max_idle: usize,
    next_id: AtomicU64,
    outstanding: AtomicUsize,
}

impl CodecPool {
    /// Creates an empty pool keeping up to [`DEFAULT_MAX_IDLE`] idle handles per key.
    pub fn new() -> Self {
        Self::with_max_idle(DEFAULT_MAX_IDLE)
    }

    /// Creates an empty pool keeping up to `max_idle` idle handles per key.
    pub fn with_max_idle(max_idle: usize) -> Self {
        Self {
            encoders: Mutex::new(HashMap::new()),
            decoders: Mutex::new(HashMap::new()),
            max_idle,
            next_id: AtomicU64::new(1),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Returns the process-wide pool.
    pub fn global() -> Arc<CodecPool> {
        Arc::clone(&GLOBAL)
    }

    /// Checks out an encoder for `codec` at `level`.
    ///
    /// Returns [`Error::InvalidLevel`] if the level is outside the codec's range.
    pub fn acquire_encoder(
        self: &Arc<Self>,
        codec: Codec,
        level: CompressionLevel,
    ) -> Result<PooledEncoder, Error> {
        codec.validate_level(level)?;

        let idle = self
            .encoders
            .lock()
            .get_mut(&(codec, level))
            .and_then(Vec::pop);

        let handle = match idle {
            Some(handle) => handle,
            None => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(id, %codec, %level, "creating encoder");
                EncoderHandle {
                    id,
                    codec,
                    level,
                    encoder: codec.encoder(level),
                    buffer: vec![0u8; OUTPUT_BUFFER_SIZE],
                }
            }
        };

        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(PooledEncoder {
            handle: Some(handle),
            pool: Arc::clone(self),
        })
    }

    /// Checks out a decoder for `codec`.
    pub fn acquire_decoder(self: &Arc<Self>, codec: Codec) -> PooledDecoder {
        let idle = self.decoders.lock().get_mut(&codec).and_then(Vec::pop);

        let handle = match idle {
            Some(handle) => handle,
            None => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(id, %codec, "creating decoder");
                DecoderHandle {
                    id,
                    codec,
                    decoder: codec.decoder(),
                    buffer: vec![0u8; OUTPUT_BUFFER_SIZE],
                }
            }
        };

        self.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledDecoder {
            handle: Some(handle),
            pool: Arc::clone(self),
        }
    }

    /// Number of handles currently checked out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Number of idle encoders for `codec` at `level`.
    pub fn idle_encoders(&self, codec: Codec, level: CompressionLevel) -> usize {
        self.encoders.lock().get(&(codec, level)).map_or(0, Vec::len)
    }

    /// Number of idle decoders for `codec`.
    pub fn idle_decoders(&self, codec: Codec) -> usize {
        self.decoders.lock().get(&codec).map_or(0, Vec::len)
    }

    fn release_encoder(&self, mut handle: EncoderHandle) {
        handle.reset();
        {
            let mut encoders = self.encoders.lock();
            let idle = encoders.entry((handle.codec, handle.level)).or_default();
            if idle.len() < self.max_idle {
                idle.push(handle);
            }
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    fn release_decoder(&self, mut handle: DecoderHandle) {
        if let Err(error) = handle.reset() {
            tracing::debug!(%error, "decoder reset failed");
            self.forget(handle.id);
            return;
        }
        {
            let mut decoders = self.decoders.lock();
            let idle = decoders.entry(handle.codec).or_default();
            if idle.len() < self.max_idle {
                idle.push(handle);
            }
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    fn forget(&self, id: u64) {
        tracing::debug!(id, "discarding codec handle");
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for CodecPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CodecPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecPool")
            .field("max_idle", &self.max_idle)
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

struct EncoderHandle {
    id: u64,
    codec: Codec,
    level: CompressionLevel,
    encoder: Box<dyn EncodeV2 + Send>,
    buffer: Vec<u8>,
}

impl EncoderHandle {
    fn reset(&mut self) {
        self.encoder = self.codec.encoder(self.level);
        self.buffer.fill(0);
    }

    fn encode(&mut self, input: &[u8]) -> io::Result<Bytes> {
        let mut input_buf = PartialBuffer::new(input);
        let mut all_output = BytesMut::new();

        // Keep encoding until all input is consumed
        loop {
            let mut output = WriteBuffer::new_initialized(self.buffer.as_mut_slice());
            let consumed = input_buf.written_len();

            self.encoder.encode(&mut input_buf, &mut output)?;

            let written = output.written_len();
            all_output.extend_from_slice(&self.buffer[..written]);

            if input_buf.written_len() >= input.len() {
                break;
            }
            if written == 0 && input_buf.written_len() == consumed {
                return Err(io::Error::other("encoder made no progress"));
            }
        }

        Ok(all_output.freeze())
    }

    fn drain(&mut self, finish: bool) -> io::Result<Bytes> {
        let mut all_output = BytesMut::new();

        loop {
            let mut output = WriteBuffer::new_initialized(self.buffer.as_mut_slice());

            let done = if finish {
                self.encoder.finish(&mut output)?
            } else {
                self.encoder.flush(&mut output)?
            };

            let written = output.written_len();
            all_output.extend_from_slice(&self.buffer[..written]);

            if done {
                break;
            }
            if written == 0 {
                return Err(io::Error::other("encoder made no progress"));
            }
        }

        Ok(all_output.freeze())
    }
}

struct DecoderHandle {
    id: u64,
    codec: Codec,
    decoder: Box<dyn DecodeV2 + Send>,
    buffer: Vec<u8>,
}

impl DecoderHandle {
    fn reset(&mut self) -> io::Result<()> {
        self.decoder.reinit()?;
        self.buffer.fill(0);
        Ok(())
    }

    fn decode(&mut self, input: &[u8]) -> io::Result<Decoded> {
        let mut input_buf = PartialBuffer::new(input);
        let mut all_output = BytesMut::new();

        loop {
            let mut output = WriteBuffer::new_initialized(self.buffer.as_mut_slice());
            let consumed = input_buf.written_len();

            let done = self.decoder.decode(&mut input_buf, &mut output)?;

            let written = output.written_len();
            all_output.extend_from_slice(&self.buffer[..written]);

            if done {
                self.drain_into(&mut all_output)?;
                return Ok(Decoded {
                    output: all_output.freeze(),
                    consumed: input_buf.written_len(),
                    done: true,
                });
            }

            let exhausted = input_buf.written_len() >= input.len();
            // A full output buffer may hide more pending output
            if exhausted && written < self.buffer.len() {
                break;
            }
            if written == 0 && input_buf.written_len() == consumed {
                break;
            }
        }

        Ok(Decoded {
            output: all_output.freeze(),
            consumed: input_buf.written_len(),
            done: false,
        })
    }

    fn drain_into(&mut self, all_output: &mut BytesMut) -> io::Result<()> {
        loop {
            let mut output = WriteBuffer::new_initialized(self.buffer.as_mut_slice());
            let done = self.decoder.flush(&mut output)?;
            let written = output.written_len();
            all_output.extend_from_slice(&self.buffer[..written]);

            if done {
                return Ok(());
            }
            if written == 0 {
                return Err(io::Error::other("decoder made no progress"));
            }
        }
    }
}

/// Result of feeding bytes to a [`PooledDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Decompressed bytes produced by this call.
    pub output: Bytes,
    /// Number of input bytes consumed.
    pub consumed: usize,
    /// Whether the end of a compressed member was reached.
    pub done: bool,
}

fn released() -> io::Error {
    io::Error::other("codec handle already released")
}

/// An encoder checked out of a [`CodecPool`].
///
/// Dropping the guard resets the encoder and returns it to the pool.
pub struct PooledEncoder {
    handle: Option<EncoderHandle>,
    pool: Arc<CodecPool>,
}

impl PooledEncoder {
    /// Process-unique identifier of the underlying handle.
    pub fn id(&self) -> u64 {
        self.handle.as_ref().map_or(0, |handle| handle.id)
    }

    /// Compresses `input`, returning whatever output the encoder produced so far.
    pub fn encode(&mut self, input: &[u8]) -> io::Result<Bytes> {
        self.handle.as_mut().ok_or_else(released)?.encode(input)
    }

    /// Flushes buffered input so that everything written so far can be decoded.
    pub fn flush(&mut self) -> io::Result<Bytes> {
        self.handle.as_mut().ok_or_else(released)?.drain(false)
    }

    /// Finishes the stream, returning the remaining output including the codec footer.
    pub fn finish(&mut self) -> io::Result<Bytes> {
        self.handle.as_mut().ok_or_else(released)?.drain(true)
    }

    /// Drops the handle without returning it to the pool.
    pub fn discard(mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.forget(handle.id);
        }
    }
}

impl Drop for PooledEncoder {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release_encoder(handle);
        }
    }
}

impl fmt::Debug for PooledEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledEncoder")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

/// A decoder checked out of a [`CodecPool`].
///
/// Dropping the guard resets the decoder and returns it to the pool.
pub struct PooledDecoder {
    handle: Option<DecoderHandle>,
    pool: Arc<CodecPool>,
}

impl PooledDecoder {
    /// Process-unique identifier of the underlying handle.
    pub fn id(&self) -> u64 {
        self.handle.as_ref().map_or(0, |handle| handle.id)
    }

    /// Decompresses as much of `input` as possible.
    ///
    /// Stops early when the end of a compressed member is reached; the
    /// unconsumed remainder belongs to the next member, which needs a
    /// [`reset`](Self::reset) first.
    pub fn decode(&mut self, input: &[u8]) -> io::Result<Decoded> {
        self.handle.as_mut().ok_or_else(released)?.decode(input)
    }

    /// Prepares the decoder for a new member.
    ///
    /// The decoder state is reinitialized in place. On error the decoder is
    /// unusable and should be [discarded](Self::discard).
    pub fn reset(&mut self) -> io::Result<()> {
        self.handle.as_mut().ok_or_else(released)?.reset()
    }

    /// Drops the handle without returning it to the pool.
    pub fn discard(mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.forget(handle.id);
        }
    }
}

impl Drop for PooledDecoder {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release_decoder(handle);
        }
    }
}

impl fmt::Debug for PooledDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledDecoder")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}
