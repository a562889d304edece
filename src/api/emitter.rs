use std::{marker::PhantomData, sync::Arc};

use thiserror::Error;
use tracing::warn;

use crate::{
    buffers::{BufferBuilder, BufferChain},
    channel::{ChannelId, Multiplexer},
    codec::Codec,
    net::TransportError,
};

/// Errors raised while emitting elements.
#[derive(Debug, Error)]
pub enum EmitError {
    /// The emitter was already closed.
    ///
    /// Emitting or flushing after close is a usage error; debug builds
    /// assert on it.
    #[error("emitter is closed")]
    Closed,
    /// Delivering a sealed buffer to the peer failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

enum Target {
    /// Appends into a local buffer chain.
    Local(Arc<BufferChain>),
    /// Frames buffers towards one rank of a network channel. A target equal
    /// to the local rank short-circuits inside the multiplexer.
    Channel {
        mux: Arc<Multiplexer>,
        channel: ChannelId,
        target_rank: usize,
    },
}

/// Typed producer end of a local DIA or one rank of a network channel.
///
/// Elements are serialized into an internal [`BufferBuilder`]; once the
/// builder reaches the flush threshold the accumulated bytes are sealed into
/// an immutable buffer and delivered (appended locally or framed onto the
/// wire). [`close`](Emitter::close) flushes any partial buffer and announces
/// end-of-stream exactly once.
///
/// Elements emitted through a single emitter arrive at the target chain in
/// emission order.
pub struct Emitter<T: Codec> {
    target: Target,
    builder: BufferBuilder,
    flush_threshold: usize,
    closed: bool,
    _marker: PhantomData<fn(&T)>,
}

impl<T: Codec> Emitter<T> {
    pub(crate) fn local(chain: Arc<BufferChain>, flush_threshold: usize) -> Self {
        Self {
            target: Target::Local(chain),
            builder: BufferBuilder::new(),
            flush_threshold,
            closed: false,
            _marker: PhantomData,
        }
    }

    pub(crate) fn network(mux: Arc<Multiplexer>, channel: ChannelId, target_rank: usize, flush_threshold: usize) -> Self {
        Self {
            target: Target::Channel {
                mux,
                channel,
                target_rank,
            },
            builder: BufferBuilder::new(),
            flush_threshold,
            closed: false,
            _marker: PhantomData,
        }
    }

    /// Serializes one element, flushing automatically at the threshold.
    pub async fn emit(&mut self, value: &T) -> Result<(), EmitError> {
        debug_assert!(!self.closed, "emit on a closed emitter");
        if self.closed {
            return Err(EmitError::Closed);
        }

        value.serialize(&mut self.builder);
        self.builder.record_element();

        if self.builder.len() >= self.flush_threshold {
            self.flush().await?;
        }
        Ok(())
    }

    /// Seals and delivers the pending buffer; a no-op when nothing is
    /// pending.
    pub async fn flush(&mut self) -> Result<(), EmitError> {
        debug_assert!(!self.closed, "flush on a closed emitter");
        if self.closed {
            return Err(EmitError::Closed);
        }
        if self.builder.is_empty() {
            return Ok(());
        }

        let buffer = self.builder.detach();
        match &self.target {
            Target::Local(chain) => chain.append(buffer),
            Target::Channel {
                mux,
                channel,
                target_rank,
            } => mux.send_buffer(*channel, *target_rank, buffer).await?,
        }
        Ok(())
    }

    /// Flushes and announces end-of-stream.
    ///
    /// Afterwards the emitter is closed for good; calling it twice is a
    /// usage error.
    pub async fn close(&mut self) -> Result<(), EmitError> {
        debug_assert!(!self.closed, "double close of an emitter");
        if self.closed {
            return Err(EmitError::Closed);
        }

        self.flush().await?;
        self.closed = true;

        match &self.target {
            Target::Local(chain) => chain.close(),
            Target::Channel {
                mux,
                channel,
                target_rank,
            } => mux.send_end_of_stream(*channel, *target_rank).await?,
        }
        Ok(())
    }

    /// Returns `true` once [`close`](Emitter::close) has completed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<T: Codec> Drop for Emitter<T> {
    fn drop(&mut self) {
        if !self.closed && !self.builder.is_empty() {
            warn!(
                pending_bytes = self.builder.len(),
                pending_elements = self.builder.elements(),
                "emitter dropped with unflushed elements"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_emitter_flushes_at_threshold() {
        let chain = Arc::new(BufferChain::new());
        // u32 elements are 4 bytes; a threshold of 8 flushes every 2 elements
        let mut emitter = Emitter::<u32>::local(chain.clone(), 8);

        emitter.emit(&1).await.unwrap();
        assert_eq!(chain.num_buffers(), 0);
        emitter.emit(&2).await.unwrap();
        assert_eq!(chain.num_buffers(), 1);
        assert_eq!(chain.size(), 2);

        emitter.emit(&3).await.unwrap();
        assert_eq!(chain.num_buffers(), 1);
        emitter.close().await.unwrap();
        assert_eq!(chain.num_buffers(), 2);
        assert_eq!(chain.size(), 3);
        assert!(chain.is_closed());
    }

    #[tokio::test]
    async fn explicit_flush_and_empty_flush() {
        let chain = Arc::new(BufferChain::new());
        let mut emitter = Emitter::<String>::local(chain.clone(), usize::MAX);

        // Zero-element flush produces no chain element
        emitter.flush().await.unwrap();
        assert_eq!(chain.num_buffers(), 0);

        emitter.emit(&"foo".to_string()).await.unwrap();
        emitter.flush().await.unwrap();
        assert_eq!(chain.num_buffers(), 1);

        // Flushing again with nothing pending adds nothing
        emitter.flush().await.unwrap();
        assert_eq!(chain.num_buffers(), 1);
    }

    #[tokio::test]
    async fn close_without_elements_closes_chain() {
        let chain = Arc::new(BufferChain::new());
        let mut emitter = Emitter::<u32>::local(chain.clone(), usize::MAX);
        emitter.close().await.unwrap();
        assert!(chain.is_closed());
        assert_eq!(chain.size(), 0);
    }

    #[tokio::test]
    #[cfg_attr(debug_assertions, should_panic(expected = "double close"))]
    async fn double_close_is_rejected() {
        let chain = Arc::new(BufferChain::new());
        let mut emitter = Emitter::<u32>::local(chain, usize::MAX);
        emitter.close().await.unwrap();

        // Debug builds assert; release builds report the usage error.
        match emitter.close().await {
            Err(EmitError::Closed) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
