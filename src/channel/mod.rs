//! Channel multiplexing over the group's connections.
//!
//! Many logical channels share the fixed set of point-to-point connections.
//! Outbound buffers are framed with a [`FrameHeader`] and written under the
//! target connection's send mutex; inbound frames are parsed by the
//! dispatcher and appended to the `(channel, sender)` receive chain they
//! address. Channels that receive frames before the local worker allocated
//! them are created lazily and adopted by the first local access.

mod frame;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::{debug, trace};

pub use frame::FrameHeader;

use crate::{
    buffers::{Buffer, BufferChain},
    codec::CodecError,
    net::{Group, TransportError},
};

/// Identifies a channel within the group.
///
/// Channel ids are allocated monotonically per worker; the collective
/// allocation discipline (every worker allocates its channels in the same
/// order) makes equal ids denote the same logical channel on every host,
/// which is what the wire header carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub(crate) u32);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel {}", self.0)
    }
}

/// How a channel's per-sender streams are merged for its iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Sender 0's elements first, then sender 1's, and so on. Senders are
    /// drained strictly in rank order as they close; this is the scatter
    /// contract.
    RankOrder,
    /// Elements become visible in the order their buffers arrive; order
    /// across senders is unspecified, order within a sender is preserved.
    Arrival,
}

/// Violations of the framing or channel protocol. Fatal to the job.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame carried flag bits this version does not understand.
    #[error("frame carries unknown flags {flags:#04x}")]
    UnknownFlags {
        /// The offending flag byte.
        flags: u8,
    },
    /// A frame arrived on a connection whose peer rank differs from the
    /// header's sender rank.
    #[error("frame from peer {peer} claims sender rank {claimed}")]
    SenderMismatch {
        /// Rank of the connection the frame arrived on.
        peer: usize,
        /// Sender rank from the frame header.
        claimed: usize,
    },
    /// A sender announced end-of-stream on the same channel twice.
    #[error("duplicate end-of-stream from sender {sender} on channel {channel}")]
    DuplicateEndOfStream {
        /// The channel id.
        channel: u32,
        /// The offending sender rank.
        sender: usize,
    },
    /// A data frame arrived after the sender's end-of-stream.
    #[error("frame after end-of-stream from sender {sender} on channel {channel}")]
    FrameAfterEndOfStream {
        /// The channel id.
        channel: u32,
        /// The offending sender rank.
        sender: usize,
    },
    /// A channel was opened twice with different merge modes.
    #[error("channel {channel} opened with conflicting merge modes")]
    MergeModeMismatch {
        /// The channel id.
        channel: u32,
    },
    /// A buffer exceeds what one frame can carry.
    #[error("buffer of {bytes} bytes exceeds the frame size limit")]
    FrameTooLarge {
        /// Size of the rejected buffer.
        bytes: usize,
    },
    /// A scatter offset vector has the wrong length.
    #[error("scatter expects {expected} offsets, got {got}")]
    OffsetCountMismatch {
        /// Group size.
        expected: usize,
        /// Length of the supplied vector.
        got: usize,
    },
    /// A scatter offset vector decreases.
    #[error("scatter offsets must be monotone non-decreasing (index {index})")]
    NonMonotoneOffsets {
        /// Index of the first decreasing offset.
        index: usize,
    },
    /// A scatter offset vector does not end at the source size.
    #[error("last scatter offset {last} does not match the source size {size}")]
    OffsetSizeMismatch {
        /// The final offset.
        last: usize,
        /// Element count of the scattered source.
        size: usize,
    },
    /// Element bytes could not be decoded while locating boundaries.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

struct ChannelState {
    mode: Option<MergeMode>,
    /// Per sender: how many chain elements were already copied to `merged`.
    pumped: Vec<usize>,
    closed: Vec<bool>,
    /// Rank-order pump frontier: all senders below it are fully drained.
    next_rank: usize,
    finished: bool,
}

/// One multi-sender channel endpoint on this worker.
///
/// Every sender rank (including the local one) has its own receive chain;
/// the iterator reads the merged chain, which is fed from the per-sender
/// chains according to the merge mode and closes exactly when all senders
/// have announced end-of-stream.
pub(crate) struct Channel {
    id: u32,
    merged: Arc<BufferChain>,
    senders: Vec<Arc<BufferChain>>,
    state: Mutex<ChannelState>,
}

impl Channel {
    fn new(id: u32, group_size: usize) -> Self {
        Self {
            id,
            merged: Arc::new(BufferChain::new()),
            senders: (0..group_size).map(|_| Arc::new(BufferChain::new())).collect(),
            state: Mutex::new(ChannelState {
                mode: None,
                pumped: vec![0; group_size],
                closed: vec![false; group_size],
                next_rank: 0,
                finished: false,
            }),
        }
    }

    /// The chain the channel's iterator consumes.
    pub(crate) fn merged(&self) -> &Arc<BufferChain> {
        &self.merged
    }

    /// Fixes the merge mode, pumping any buffers parked before adoption.
    pub(crate) fn declare_mode(&self, mode: MergeMode) -> Result<(), ProtocolError> {
        let mut state = self.state.lock().unwrap();
        match state.mode {
            None => {
                state.mode = Some(mode);
                self.pump(&mut state);
                Ok(())
            }
            Some(existing) if existing == mode => Ok(()),
            Some(_) => Err(ProtocolError::MergeModeMismatch { channel: self.id }),
        }
    }

    pub(crate) fn mode(&self) -> Option<MergeMode> {
        self.state.lock().unwrap().mode
    }

    /// Appends a received buffer to the sender's chain and advances the
    /// merge.
    pub(crate) fn deliver(&self, sender: usize, buffer: Buffer) -> Result<(), ProtocolError> {
        let mut state = self.state.lock().unwrap();
        if state.closed[sender] {
            return Err(ProtocolError::FrameAfterEndOfStream {
                channel: self.id,
                sender,
            });
        }
        self.senders[sender].append(buffer);
        self.pump(&mut state);
        Ok(())
    }

    /// Records the sender's end-of-stream; closing the last open sender
    /// finishes the merged chain.
    pub(crate) fn deliver_end_of_stream(&self, sender: usize) -> Result<(), ProtocolError> {
        let mut state = self.state.lock().unwrap();
        if state.closed[sender] {
            return Err(ProtocolError::DuplicateEndOfStream {
                channel: self.id,
                sender,
            });
        }
        state.closed[sender] = true;
        self.senders[sender].close();
        self.pump(&mut state);
        Ok(())
    }

    /// Copies newly available per-sender buffers into the merged chain.
    ///
    /// Nothing moves until the merge mode is declared by local adoption;
    /// buffers stay parked in their sender chains meanwhile.
    fn pump(&self, state: &mut ChannelState) {
        let Some(mode) = state.mode else { return };

        match mode {
            MergeMode::Arrival => {
                for rank in 0..self.senders.len() {
                    self.pump_rank(state, rank);
                }
                if !state.finished && state.closed.iter().all(|c| *c) {
                    state.finished = true;
                    self.merged.close();
                }
            }
            MergeMode::RankOrder => {
                while state.next_rank < self.senders.len() {
                    let rank = state.next_rank;
                    self.pump_rank(state, rank);
                    if state.closed[rank] {
                        state.next_rank += 1;
                    } else {
                        break;
                    }
                }
                if !state.finished && state.next_rank == self.senders.len() {
                    state.finished = true;
                    self.merged.close();
                }
            }
        }
    }

    fn pump_rank(&self, state: &mut ChannelState, rank: usize) {
        while let Some(element) = self.senders[rank].element(state.pumped[rank]) {
            self.merged.append(element.buffer);
            state.pumped[rank] += 1;
        }
    }

    fn fail(&self, error: Arc<TransportError>) {
        // Mark every sender closed first so that frames still in flight on
        // other connections are rejected instead of appended.
        {
            let mut state = self.state.lock().unwrap();
            state.closed.iter_mut().for_each(|c| *c = true);
            state.finished = true;
        }
        for chain in &self.senders {
            chain.fail(error.clone());
        }
        self.merged.fail(error);
    }
}

/// Routes framed buffers between channels and the group's connections.
pub struct Multiplexer {
    group: Arc<Group>,
    /// Map-level lock, disjoint from all per-chain locks.
    channels: Mutex<HashMap<u32, Arc<Channel>>>,
}

impl Multiplexer {
    pub(crate) fn new(group: Arc<Group>) -> Self {
        Self {
            group,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn my_rank(&self) -> usize {
        self.group.my_rank()
    }

    /// Looks up a channel, creating it lazily on first access.
    pub(crate) fn channel(&self, id: ChannelId) -> Arc<Channel> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(id.0)
            .or_insert_with(|| {
                trace!(channel = id.0, "creating channel");
                Arc::new(Channel::new(id.0, self.group.size()))
            })
            .clone()
    }

    /// Opens a channel with a fixed merge mode, adopting a lazily created
    /// one if frames arrived first.
    pub(crate) fn open_channel(&self, id: ChannelId, mode: MergeMode) -> Result<Arc<Channel>, ProtocolError> {
        let channel = self.channel(id);
        channel.declare_mode(mode)?;
        Ok(channel)
    }

    /// Handles one inbound frame on the dispatcher task.
    pub(crate) fn dispatch(&self, peer: usize, header: FrameHeader, payload: Buffer) -> Result<(), ProtocolError> {
        let sender = header.sender as usize;
        if sender != peer {
            return Err(ProtocolError::SenderMismatch { peer, claimed: sender });
        }

        let channel = self.channel(ChannelId(header.channel));
        if !payload.is_empty() || payload.elements() > 0 {
            channel.deliver(sender, payload)?;
        }
        if header.is_end_of_stream() {
            debug!(channel = header.channel, sender, "end of stream");
            channel.deliver_end_of_stream(sender)?;
        }
        Ok(())
    }

    /// Ships a sealed buffer to `target` on `id`.
    ///
    /// The local rank short-circuits into the channel's own receive chain;
    /// remote ranks get a framed write under the connection's send mutex.
    pub(crate) async fn send_buffer(&self, id: ChannelId, target: usize, buffer: Buffer) -> Result<(), TransportError> {
        if target == self.my_rank() {
            self.channel(id).deliver(target, buffer)?;
            return Ok(());
        }

        let payload_bytes = u32::try_from(buffer.len()).map_err(|_| ProtocolError::FrameTooLarge {
            bytes: buffer.len(),
        })?;
        let element_count = u32::try_from(buffer.elements()).map_err(|_| ProtocolError::FrameTooLarge {
            bytes: buffer.len(),
        })?;
        let header = FrameHeader::data(id.0, self.my_rank() as u32, payload_bytes, element_count);

        self.group
            .connection(target)?
            .send(&header.encode(), buffer.as_slice())
            .await
            .map_err(|source| TransportError::Io { peer: target, source })
    }

    /// Announces this worker's end-of-stream on `id` towards `target`.
    pub(crate) async fn send_end_of_stream(&self, id: ChannelId, target: usize) -> Result<(), TransportError> {
        if target == self.my_rank() {
            self.channel(id).deliver_end_of_stream(target)?;
            return Ok(());
        }

        let header = FrameHeader::end_of_stream(id.0, self.my_rank() as u32);
        self.group
            .connection(target)?
            .send(&header.encode(), &[])
            .await
            .map_err(|source| TransportError::Io { peer: target, source })
    }

    /// Fails every chain of every channel. Called on fatal transport errors.
    pub(crate) fn fail_all(&self, error: Arc<TransportError>) {
        let channels = self.channels.lock().unwrap();
        for channel in channels.values() {
            channel.fail(error.clone());
        }
    }
}
