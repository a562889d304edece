//! Braid: a multiplexed data-exchange core for distributed stream
//! processing.
//!
//! A braid job runs on a fixed group of `n` workers, all-to-all connected by
//! plain byte streams. On top of those connections the crate multiplexes any
//! number of logical **channels**, over which workers exchange typed element
//! streams with end-of-stream signalling, backpressure-free producers, and
//! blocking consumers. Operator layers (sort, window, zip, merge, ...)
//! compose on top of the emitter/iterator contracts; this crate is the part
//! that moves the bytes.
//!
//! # Overview
//!
//! ```text
//!  WORKER p                                          WORKER q
//! ┌───────────────────────────────┐   ┌───────────────────────────────┐
//! │ Emitter<T> ──► BufferBuilder  │   │        BlockIterator<T>       │
//! │                  │ flush      │   │                ▲              │
//! │                  ▼            │   │                │ merge        │
//! │              Buffer (sealed)  │   │   BufferChain (channel c,     │
//! │                  │            │   │                sender p)      │
//! │                  ▼            │   │                ▲              │
//! │   Multiplexer: frame header   │   │   Multiplexer: parse frame    │
//! │                  │            │   │                ▲              │
//! │                  ▼            │   │                │              │
//! │   Group.connection(q) ════════╪═══╪══► Dispatcher receive loop    │
//! └───────────────────────────────┘   └───────────────────────────────┘
//! ```
//!
//! An [`Emitter`] serializes elements into a [`BufferBuilder`]; at the flush
//! threshold the builder is sealed into an immutable, reference-counted
//! [`Buffer`] and either appended to a local [`BufferChain`] or framed and
//! written to the target peer's connection. On the receiving side the
//! [`Dispatcher`] parses frames and appends payloads to the
//! `(channel, sender)` chain they address; a [`BlockIterator`] deserializes
//! elements from the channel's merged view, suspending while the chain is
//! empty and open.
//!
//! A channel is finished only when **every** sender in the group - including
//! the reading worker itself - has announced end-of-stream.
//!
//! # Quick Start
//!
//! ```
//! use braid::{execute_local_mock, Manager, MergeMode};
//!
//! #[tokio::main(flavor = "multi_thread")]
//! async fn main() {
//!     execute_local_mock(2, |group| async move {
//!         let manager = Manager::connect(group);
//!         let channel = manager.allocate_network_channel(MergeMode::Arrival).unwrap();
//!         let mut emitters = manager.get_network_emitters::<u32>(channel);
//!
//!         // Send one element to each worker, then close both streams.
//!         for (rank, emitter) in emitters.iter_mut().enumerate() {
//!             emitter.emit(&(rank as u32)).await.unwrap();
//!             emitter.close().await.unwrap();
//!         }
//!
//!         // Every worker receives one element per sender.
//!         let mut iterator = manager.get_iterator::<u32>(channel);
//!         let received = iterator.collect_all().await.unwrap();
//!         assert_eq!(received.len(), 2);
//!     })
//!     .await;
//! }
//! ```
//!
//! # Scatter
//!
//! [`Manager::scatter`] redistributes a worker-local element sequence (a
//! DIA) over a channel, partitioned by caller-supplied cut points: peer `i`
//! receives the source range `[offsets[i-1], offsets[i])` as zero-copy
//! buffer views. Receivers merge the per-sender streams in rank order, so
//! the result is deterministic across workers.
//!
//! # Testing
//!
//! [`execute_local_mock`] wires a full group with in-memory pipes and runs
//! one task per worker, making every cross-worker interaction above the
//! connection layer deterministic enough for unit tests.

mod api;
mod buffers;
mod channel;
mod codec;
#[cfg(unix)]
pub mod io;
mod net;
mod sync;

pub use api::{BlockIterator, DiaId, EmitError, Emitter, Manager, ManagerConfig, ReadError};
pub use buffers::{Buffer, BufferBuilder, BufferChain, ChainElement, OffsetUnsupported};
pub use channel::{ChannelId, FrameHeader, MergeMode, Multiplexer, ProtocolError};
pub use codec::{ByteCursor, BufferReader, Codec, CodecError};
pub use net::{execute_local_mock, Connection, Dispatcher, Group, TransportError};
