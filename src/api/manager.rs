use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use tracing::debug;

use super::{emitter::Emitter, iterator::{BlockIterator, ChainCursor}};
use crate::{
    buffers::{Buffer, BufferChain},
    channel::{ChannelId, MergeMode, Multiplexer, ProtocolError},
    codec::Codec,
    net::{Dispatcher, Group, TransportError},
};

/// Identifies a local DIA (a worker-local element sequence).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiaId(u32);

/// Tunables for a [`Manager`].
///
/// # Examples
///
/// ```no_run
/// # use braid::{Group, ManagerConfig};
/// # fn example(group: Group) {
/// let manager = ManagerConfig::new().flush_threshold(4 * 1024).connect(group);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    flush_threshold: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            flush_threshold: Self::DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

impl ManagerConfig {
    /// Default emitter flush threshold in bytes.
    pub const DEFAULT_FLUSH_THRESHOLD: usize = 16 * 1024;

    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the byte threshold at which emitters seal and deliver their
    /// pending buffer.
    pub fn flush_threshold(mut self, bytes: usize) -> Self {
        self.flush_threshold = bytes.max(1);
        self
    }

    /// Binds a manager to `group` and starts its dispatcher.
    pub fn connect(self, group: Group) -> Manager {
        let group = Arc::new(group);
        let mux = Arc::new(Multiplexer::new(group.clone()));
        let dispatcher = Dispatcher::start(&group, mux.clone());
        debug!(rank = group.my_rank(), size = group.size(), "manager connected");
        Manager {
            group,
            mux,
            dispatcher: Some(dispatcher),
            dias: Mutex::new(HashMap::new()),
            next_dia: AtomicU32::new(0),
            next_channel: AtomicU32::new(0),
            flush_threshold: self.flush_threshold,
        }
    }
}

/// Top-level facade over the data-exchange core.
///
/// A manager is bound to one communication [`Group`] for its lifetime. It
/// allocates local DIAs and network channels, hands out the typed emitters
/// and iterators over them, and performs the scatter redistribution.
///
/// Id allocation is monotone per worker; workers that allocate their
/// channels in the same order address the same logical channel with the same
/// id, which is the discipline the pipeline layer above guarantees.
pub struct Manager {
    group: Arc<Group>,
    mux: Arc<Multiplexer>,
    dispatcher: Option<Dispatcher>,
    dias: Mutex<HashMap<u32, Arc<BufferChain>>>,
    next_dia: AtomicU32,
    next_channel: AtomicU32,
    flush_threshold: usize,
}

impl Manager {
    /// Binds a manager with default configuration to `group`.
    pub fn connect(group: Group) -> Self {
        ManagerConfig::default().connect(group)
    }

    /// Returns this worker's rank.
    pub fn my_rank(&self) -> usize {
        self.group.my_rank()
    }

    /// Returns the number of workers in the group.
    pub fn group_size(&self) -> usize {
        self.group.size()
    }

    /// Allocates a worker-local buffer chain.
    pub fn allocate_dia(&self) -> DiaId {
        let id = self.next_dia.fetch_add(1, Ordering::Relaxed);
        self.dias.lock().unwrap().insert(id, Arc::new(BufferChain::new()));
        DiaId(id)
    }

    /// Allocates a multi-sender network channel with the given merge mode.
    ///
    /// Adopts the channel if frames from remote senders arrived before this
    /// call; fails if it was already opened with a different merge mode.
    pub fn allocate_network_channel(&self, mode: MergeMode) -> Result<ChannelId, ProtocolError> {
        let id = ChannelId(self.next_channel.fetch_add(1, Ordering::Relaxed));
        self.mux.open_channel(id, mode)?;
        debug!(channel = %id, ?mode, "allocated network channel");
        Ok(id)
    }

    /// Returns an emitter writing into the local DIA.
    ///
    /// # Panics
    ///
    /// Panics if `dia` was not allocated by this manager.
    pub fn get_local_emitter<T: Codec>(&self, dia: DiaId) -> Emitter<T> {
        let chain = self.dia_chain(dia);
        Emitter::local(chain, self.flush_threshold)
    }

    /// Returns one emitter per rank of the group, each shipping to that rank
    /// on `channel`. The emitter for the local rank short-circuits into the
    /// local receive chain.
    pub fn get_network_emitters<T: Codec>(&self, channel: ChannelId) -> Vec<Emitter<T>> {
        // Ensure the channel exists before the first frame addresses it.
        let _ = self.mux.channel(channel);
        (0..self.group.size())
            .map(|rank| Emitter::network(self.mux.clone(), channel, rank, self.flush_threshold))
            .collect()
    }

    /// Returns an iterator over the channel's merged element stream.
    ///
    /// Adopts a lazily created channel; if no local allocation declared a
    /// merge mode yet, arrival order is assumed.
    pub fn get_iterator<T: Codec>(&self, channel: ChannelId) -> BlockIterator<T> {
        let ch = self.mux.channel(channel);
        if ch.mode().is_none() {
            debug!(channel = %channel, "iterator adopted channel without a merge mode, assuming arrival order");
            // A concurrent allocation can only race to the same outcome or
            // report the conflict at its own call site.
            let _ = ch.declare_mode(MergeMode::Arrival);
        }
        BlockIterator::new(ch.merged().clone())
    }

    /// Redistributes the local DIA `src` into `channel`, partitioned by
    /// `offsets`.
    ///
    /// `offsets[i]` is the exclusive upper bound (in source elements) of the
    /// range shipped to peer `i`, so peer `i` receives
    /// `[offsets[i-1], offsets[i])` with `offsets[-1] = 0`. The vector must
    /// be monotone non-decreasing, have one entry per rank, and end at the
    /// source's element count. Ranges are shipped as zero-copy views in
    /// source order and every per-peer emitter is closed afterwards, so the
    /// receiving iterators (merging in rank order) observe peer 0's slice
    /// first, then peer 1's, and so on.
    ///
    /// # Panics
    ///
    /// Panics if `src` was not allocated by this manager.
    pub async fn scatter<T: Codec>(
        &self,
        src: DiaId,
        channel: ChannelId,
        offsets: &[usize],
    ) -> Result<(), TransportError> {
        let chain = self.dia_chain(src);
        debug_assert!(chain.is_closed(), "scatter source must be closed");
        validate_offsets(offsets, self.group.size(), chain.size())?;

        let mut cursor = ChainCursor::new(chain.clone());
        let mut previous = 0;
        for peer in 0..self.group.size() {
            let count = offsets[peer] - previous;
            previous = offsets[peer];

            for view in split_views::<T>(&chain, &mut cursor, count)? {
                self.mux.send_buffer(channel, peer, view).await?;
            }
            self.mux.send_end_of_stream(channel, peer).await?;
        }
        Ok(())
    }

    /// Cancels the dispatcher and waits for its receive loops to stop.
    pub async fn shutdown(mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.shutdown().await;
        }
    }

    fn dia_chain(&self, dia: DiaId) -> Arc<BufferChain> {
        self.dias
            .lock()
            .unwrap()
            .get(&dia.0)
            .cloned()
            .unwrap_or_else(|| panic!("unknown DIA id {:?}", dia))
    }
}

fn validate_offsets(offsets: &[usize], group_size: usize, source_size: usize) -> Result<(), ProtocolError> {
    if offsets.len() != group_size {
        return Err(ProtocolError::OffsetCountMismatch {
            expected: group_size,
            got: offsets.len(),
        });
    }
    let mut previous = 0;
    for (index, &offset) in offsets.iter().enumerate() {
        if offset < previous {
            return Err(ProtocolError::NonMonotoneOffsets { index });
        }
        previous = offset;
    }
    if previous != source_size {
        return Err(ProtocolError::OffsetSizeMismatch {
            last: previous,
            size: source_size,
        });
    }
    Ok(())
}

/// Advances `cursor` past `count` elements and returns zero-copy views of
/// the bytes crossed, one per source buffer, each carrying the number of
/// element boundaries that fall inside it.
fn split_views<T: Codec>(
    chain: &Arc<BufferChain>,
    cursor: &mut ChainCursor,
    count: usize,
) -> Result<Vec<Buffer>, TransportError> {
    if count == 0 {
        return Ok(Vec::new());
    }

    let (start_buffer, start_byte) = cursor.position();
    // Element ends per crossed buffer, in cursor order.
    let mut ends: Vec<(usize, usize)> = Vec::new();
    for _ in 0..count {
        T::skip(cursor).map_err(ProtocolError::from)?;
        let (buffer_index, _) = cursor.position();
        match ends.last_mut() {
            Some((index, ends_here)) if *index == buffer_index => *ends_here += 1,
            _ => ends.push((buffer_index, 1)),
        }
    }
    let (end_buffer, end_byte) = cursor.position();

    let mut views = Vec::new();
    for index in start_buffer..=end_buffer {
        let element = chain.element(index).expect("source chain shrank during scatter");
        let from = if index == start_buffer { start_byte } else { 0 };
        let to = if index == end_buffer { end_byte } else { element.buffer.len() };
        if from == to {
            continue;
        }
        let elements = ends
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, n)| *n)
            .unwrap_or(0);
        let view = element
            .buffer
            .view(from..to, elements)
            .expect("element range within its buffer");
        views.push(view);
    }
    Ok(views)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferBuilder;

    #[test]
    fn offsets_are_validated() {
        assert!(validate_offsets(&[0, 2, 4], 3, 4).is_ok());
        assert!(validate_offsets(&[4, 4, 4], 3, 4).is_ok());

        assert!(matches!(
            validate_offsets(&[0, 2], 3, 4),
            Err(ProtocolError::OffsetCountMismatch { expected: 3, got: 2 })
        ));
        assert!(matches!(
            validate_offsets(&[2, 1, 4], 3, 4),
            Err(ProtocolError::NonMonotoneOffsets { index: 1 })
        ));
        assert!(matches!(
            validate_offsets(&[0, 2, 3], 3, 4),
            Err(ProtocolError::OffsetSizeMismatch { last: 3, size: 4 })
        ));
    }

    #[test]
    fn split_views_respects_buffer_boundaries() {
        // Two buffers of two strings each
        let chain = Arc::new(BufferChain::new());
        for batch in [["a", "bb"], ["ccc", "d"]] {
            let mut builder = BufferBuilder::new();
            for s in batch {
                s.to_string().serialize(&mut builder);
                builder.record_element();
            }
            chain.append_builder(&mut builder);
        }
        chain.close();

        let mut cursor = ChainCursor::new(chain.clone());

        // First range: three elements spanning both buffers -> two views
        let views = split_views::<String>(&chain, &mut cursor, 3).unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].elements(), 2);
        assert_eq!(views[1].elements(), 1);
        assert_eq!(views[0].len(), chain.element(0).unwrap().buffer.len());

        // Second range: the remaining element
        let views = split_views::<String>(&chain, &mut cursor, 1).unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].elements(), 1);

        // Nothing left
        let views = split_views::<String>(&chain, &mut cursor, 0).unwrap();
        assert!(views.is_empty());
    }

    #[test]
    fn split_views_reports_exhausted_source() {
        let chain = Arc::new(BufferChain::new());
        let mut builder = BufferBuilder::new();
        1u32.serialize(&mut builder);
        builder.record_element();
        chain.append_builder(&mut builder);
        chain.close();

        let mut cursor = ChainCursor::new(chain.clone());
        assert!(split_views::<u32>(&chain, &mut cursor, 2).is_err());
    }
}
