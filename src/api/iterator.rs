use std::{marker::PhantomData, sync::Arc};

use thiserror::Error;

use crate::{
    buffers::{Buffer, BufferChain},
    codec::{ByteCursor, Codec, CodecError},
    net::TransportError,
};

/// Errors raised while consuming elements.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The chain is closed and every element has been consumed.
    #[error("all elements have been consumed")]
    Finished,
    /// Element bytes could not be decoded.
    #[error(transparent)]
    Decode(#[from] CodecError),
    /// The chain was failed by the dispatcher.
    #[error("channel failed: {0}")]
    Transport(Arc<TransportError>),
}

/// A byte cursor walking the buffers of a chain in order.
///
/// The cursor caches the buffer it currently reads from (a cheap
/// reference-counted clone), so no chain lock is held while bytes are
/// consumed or values are deserialized. An element whose encoding straddles
/// a buffer boundary is read seamlessly across the successive buffers.
pub(crate) struct ChainCursor {
    chain: Arc<BufferChain>,
    buffer_index: usize,
    byte_offset: usize,
    current: Option<Buffer>,
}

impl ChainCursor {
    pub(crate) fn new(chain: Arc<BufferChain>) -> Self {
        Self {
            chain,
            buffer_index: 0,
            byte_offset: 0,
            current: None,
        }
    }

    /// Returns the cursor position as `(buffer_index, byte_offset)`.
    ///
    /// After consuming bytes the position points at the buffer holding the
    /// last consumed byte (possibly at its very end), which is what the
    /// scatter path uses to attribute element boundaries to buffers.
    pub(crate) fn position(&self) -> (usize, usize) {
        (self.buffer_index, self.byte_offset)
    }

    /// Loads the buffer under the cursor, advancing past exhausted ones.
    /// Returns `false` if the cursor is at the current end of the chain.
    fn load(&mut self) -> bool {
        loop {
            if self.current.is_none() {
                self.current = self.chain.element(self.buffer_index).map(|e| e.buffer);
            }
            match &self.current {
                None => return false,
                Some(buffer) if self.byte_offset < buffer.len() => return true,
                Some(_) => {
                    self.current = None;
                    self.buffer_index += 1;
                    self.byte_offset = 0;
                }
            }
        }
    }
}

impl ByteCursor for ChainCursor {
    fn read_exact(&mut self, into: &mut [u8]) -> Result<(), CodecError> {
        let mut filled = 0;
        while filled < into.len() {
            if !self.load() {
                return Err(CodecError::ShortRead);
            }
            let buffer = self.current.as_ref().unwrap();
            let available = &buffer.as_slice()[self.byte_offset..];
            let step = available.len().min(into.len() - filled);
            into[filled..filled + step].copy_from_slice(&available[..step]);
            filled += step;
            self.byte_offset += step;
        }
        Ok(())
    }

    fn remaining(&self) -> usize {
        self.chain.bytes_from(self.buffer_index, self.byte_offset)
    }

    fn skip(&mut self, mut len: usize) -> Result<(), CodecError> {
        while len > 0 {
            if !self.load() {
                return Err(CodecError::ShortRead);
            }
            let available = self.current.as_ref().unwrap().len() - self.byte_offset;
            let step = available.min(len);
            self.byte_offset += step;
            len -= step;
        }
        Ok(())
    }
}

/// Typed consumer over a buffer chain.
///
/// The iterator deserializes elements on demand and blocks (awaits the
/// chain's signal) when no complete element is available while the chain is
/// still open. It is finished once the cursor is past the last element *and*
/// the chain is closed; for a network channel the merged chain closes only
/// after every sender - including remote peers - announced end-of-stream.
pub struct BlockIterator<T: Codec> {
    chain: Arc<BufferChain>,
    cursor: ChainCursor,
    consumed: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Codec> BlockIterator<T> {
    pub(crate) fn new(chain: Arc<BufferChain>) -> Self {
        Self {
            cursor: ChainCursor::new(chain.clone()),
            chain,
            consumed: 0,
            _marker: PhantomData,
        }
    }

    /// Returns `true` if at least one complete element is available at the
    /// cursor right now. Never blocks.
    pub fn has_next(&self) -> bool {
        self.consumed < self.chain.size()
    }

    /// Returns the next element, waiting for producers while the chain is
    /// empty at the cursor and still open.
    ///
    /// Returns [`ReadError::Finished`] once the chain is closed and
    /// exhausted, and [`ReadError::Transport`] if the chain was failed.
    pub async fn next(&mut self) -> Result<T, ReadError> {
        loop {
            let size = self.chain.size();
            if self.consumed < size {
                let value = T::deserialize(&mut self.cursor)?;
                self.consumed += 1;
                return Ok(value);
            }
            if let Some(error) = self.chain.error() {
                return Err(ReadError::Transport(error));
            }
            if self.chain.is_closed() {
                return Err(ReadError::Finished);
            }
            self.chain.wait_more(size).await;
        }
    }

    /// Waits until the chain is closed, without consuming anything.
    pub async fn wait_for_all(&self) {
        self.chain.wait_until_closed().await;
    }

    /// Returns `true` iff the cursor is past the last element and the chain
    /// is closed.
    pub fn is_finished(&self) -> bool {
        self.chain.is_closed() && self.consumed == self.chain.size()
    }

    /// Returns the transport error the chain was failed with, if any.
    pub fn error(&self) -> Option<Arc<TransportError>> {
        self.chain.error()
    }

    /// Drains every remaining element, waiting for closure.
    ///
    /// A convenience for collecting a whole channel in tests and simple
    /// pipelines.
    pub async fn collect_all(&mut self) -> Result<Vec<T>, ReadError> {
        let mut values = Vec::new();
        loop {
            match self.next().await {
                Ok(value) => values.push(value),
                Err(ReadError::Finished) => return Ok(values),
                Err(err) => return Err(err),
            }
        }
    }
}
