use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use thiserror::Error;

use super::{Buffer, BufferBuilder};
use crate::{net::TransportError, sync::Signal};

/// Error returned when appending a buffer with a non-zero element offset.
///
/// Partial-prefix trimming is not implemented; the field exists on
/// [`ChainElement`] for forward compatibility but only zero is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("non-zero element offsets are not supported")]
pub struct OffsetUnsupported;

/// One link of a [`BufferChain`]: an immutable buffer plus bookkeeping.
#[derive(Debug, Clone)]
pub struct ChainElement {
    /// The immutable bytes.
    pub buffer: Buffer,
    /// Prefix-sum of element counts up to and including this buffer.
    ///
    /// Strictly non-decreasing along the chain; enables positional lookup by
    /// binary search.
    pub cumulative: usize,
    /// Byte offset of the first whole element in the buffer.
    ///
    /// Reserved for partial-prefix trimming; always zero today.
    pub offset_of_first: usize,
}

#[derive(Default)]
struct Inner {
    elements: VecDeque<ChainElement>,
    error: Option<Arc<TransportError>>,
}

impl Inner {
    fn size(&self) -> usize {
        self.elements.back().map_or(0, |e| e.cumulative)
    }
}

/// A thread-safe, append-only sequence of immutable buffers.
///
/// The chain is the storage backing every channel endpoint and local DIA: a
/// producer appends sealed buffers in order, consumers read them through a
/// cursor and await the chain's signal while it is empty and open. Closing
/// marks the end of the stream; a producer that terminates without closing
/// leaves its consumers parked, which is a protocol error observable as a
/// stuck iterator.
///
/// Appends are totally ordered by the internal mutex; a consumer woken by a
/// notification observes every append that completed before it. Dropping the
/// last reference to the chain releases all buffer bytes.
pub struct BufferChain {
    inner: Mutex<Inner>,
    signal: Signal,
    closed: AtomicBool,
}

impl Default for BufferChain {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferChain {
    /// Creates an empty, open chain.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            signal: Signal::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Appends a sealed buffer to the chain and wakes all waiters. O(1).
    pub fn append(&self, buffer: Buffer) {
        debug_assert!(!self.is_closed(), "append on a closed chain");
        {
            let mut inner = self.inner.lock().unwrap();
            let cumulative = inner.size() + buffer.elements();
            inner.elements.push_back(ChainElement {
                buffer,
                cumulative,
                offset_of_first: 0,
            });
        }
        self.signal.notify_all();
    }

    /// Appends a buffer whose first whole element starts at `offset_of_first`.
    ///
    /// Only an offset of zero is accepted until trimming is specified.
    pub fn append_with_offset(&self, buffer: Buffer, offset_of_first: usize) -> Result<(), OffsetUnsupported> {
        if offset_of_first != 0 {
            return Err(OffsetUnsupported);
        }
        self.append(buffer);
        Ok(())
    }

    /// Seals `builder` by detaching it and appends the result.
    ///
    /// An empty builder appends nothing, so a flush of zero elements never
    /// produces a chain element.
    pub fn append_builder(&self, builder: &mut BufferBuilder) {
        if builder.is_empty() && builder.elements() == 0 {
            return;
        }
        self.append(builder.detach());
    }

    /// Returns the cumulative element count of the chain.
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().size()
    }

    /// Returns the number of buffers currently linked into the chain.
    pub fn num_buffers(&self) -> usize {
        self.inner.lock().unwrap().elements.len()
    }

    /// Returns a clone of the `index`-th chain element, if present.
    ///
    /// Cloning is cheap (the buffer bytes are shared); cursors use this to
    /// read without holding the chain lock during deserialization.
    pub fn element(&self, index: usize) -> Option<ChainElement> {
        self.inner.lock().unwrap().elements.get(index).cloned()
    }

    /// Returns the number of readable bytes from the given cursor position to
    /// the current end of the chain.
    pub(crate) fn bytes_from(&self, buffer_index: usize, byte_offset: usize) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .elements
            .iter()
            .skip(buffer_index)
            .enumerate()
            .map(|(i, e)| {
                if i == 0 {
                    e.buffer.len().saturating_sub(byte_offset)
                } else {
                    e.buffer.len()
                }
            })
            .sum()
    }

    /// Marks the chain closed and wakes all waiters. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.signal.notify_all();
    }

    /// Returns `true` once [`close`](BufferChain::close) or
    /// [`fail`](BufferChain::fail) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the chain with a transport error and wakes all waiters.
    ///
    /// Consumers observe the error through [`error`](BufferChain::error); the
    /// first recorded error wins.
    pub fn fail(&self, error: Arc<TransportError>) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.error.get_or_insert(error);
        }
        self.close();
    }

    /// Returns the transport error this chain was failed with, if any.
    pub fn error(&self) -> Option<Arc<TransportError>> {
        self.inner.lock().unwrap().error.clone()
    }

    /// Waits for one notification (append, close or failure).
    pub async fn wait(&self) {
        self.signal.wait().await;
    }

    /// Waits until the element count differs from `known_size` or the chain
    /// is closed.
    pub async fn wait_more(&self, known_size: usize) {
        self.signal
            .wait_until(|| self.is_closed() || self.size() != known_size)
            .await;
    }

    /// Waits until the chain is closed.
    pub async fn wait_until_closed(&self) {
        self.signal.wait_until(|| self.is_closed()).await;
    }
}
