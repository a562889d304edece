use std::{future::Future, sync::Arc};

use async_mutex::Mutex as SendMutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::channel::ProtocolError;

/// Errors raised by connection I/O.
///
/// Transport errors are fatal to the job: the dispatcher that observes one
/// fails every receive chain so that all consumers unblock and see the error.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Reading from or writing to a peer connection failed.
    #[error("connection i/o with peer {peer} failed")]
    Io {
        /// Rank of the peer on the failing connection.
        peer: usize,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// No connection exists for the addressed rank.
    #[error("no connection to peer {peer}")]
    NotConnected {
        /// The addressed rank.
        peer: usize,
    },
    /// The peer violated the framing protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

type ReadEnd = Box<dyn AsyncRead + Send + Unpin>;
type WriteEnd = Box<dyn AsyncWrite + Send + Unpin>;

/// A bidirectional byte stream to one peer.
///
/// The write half sits behind an async mutex so that concurrent senders
/// cannot interleave their frames on the wire; the read half is taken exactly
/// once by the dispatcher's receive loop.
pub struct Connection {
    reader: std::sync::Mutex<Option<ReadEnd>>,
    writer: SendMutex<WriteEnd>,
}

impl Connection {
    /// Wraps any async byte stream into a connection.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: std::sync::Mutex::new(Some(Box::new(reader))),
            writer: SendMutex::new(Box::new(writer)),
        }
    }

    /// Hands the read half to the dispatcher. Returns `None` if already taken.
    pub(crate) fn take_reader(&self) -> Option<ReadEnd> {
        self.reader.lock().unwrap().take()
    }

    /// Writes `header` followed by `payload` as one atomic unit.
    pub(crate) async fn send(&self, header: &[u8], payload: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(header).await?;
        if !payload.is_empty() {
            writer.write_all(payload).await?;
        }
        writer.flush().await
    }
}

/// A fixed, all-to-all connected set of workers.
///
/// Connections are indexed by peer rank; the entry for the group's own rank
/// stays empty. The group is constructed once at job start and its
/// connections are assumed stable for the job's lifetime.
pub struct Group {
    my_rank: usize,
    connections: Vec<Option<Arc<Connection>>>,
}

impl Group {
    /// Builds a group from pre-established connections.
    ///
    /// `connections[peer]` must hold the stream to `peer` for every rank
    /// except `my_rank`.
    pub fn from_connections(my_rank: usize, connections: Vec<Option<Connection>>) -> Self {
        debug_assert!(my_rank < connections.len());
        debug_assert!(connections[my_rank].is_none(), "own rank must have no connection");
        Self {
            my_rank,
            connections: connections.into_iter().map(|c| c.map(Arc::new)).collect(),
        }
    }

    /// Returns this worker's rank within the group.
    pub fn my_rank(&self) -> usize {
        self.my_rank
    }

    /// Returns the number of workers in the group.
    pub fn size(&self) -> usize {
        self.connections.len()
    }

    /// Returns the connection to `peer`.
    pub(crate) fn connection(&self, peer: usize) -> Result<&Arc<Connection>, TransportError> {
        self.connections
            .get(peer)
            .and_then(|c| c.as_ref())
            .ok_or(TransportError::NotConnected { peer })
    }

    /// Iterates over all established connections with their peer ranks.
    pub(crate) fn connections(&self) -> impl Iterator<Item = (usize, &Arc<Connection>)> {
        self.connections
            .iter()
            .enumerate()
            .filter_map(|(peer, c)| c.as_ref().map(|c| (peer, c)))
    }
}

/// Per-direction capacity of the in-memory pipes used by the local mock.
const MOCK_PIPE_CAPACITY: usize = 64 * 1024;

/// Runs `worker` once per rank over an in-memory all-to-all group.
///
/// For every pair `(i, j)` with `i < j` an in-memory duplex pipe is created
/// so that `group[i].connections[j]` and `group[j].connections[i]` are the
/// two ends of the same stream, then `worker(group)` is spawned on `n`
/// tasks and awaited. A panic in any worker propagates to the caller.
///
/// This is the deterministic test harness for everything above the
/// connection layer.
pub async fn execute_local_mock<F, Fut>(num_workers: usize, worker: F)
where
    F: Fn(Group) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut slots: Vec<Vec<Option<Connection>>> = (0..num_workers)
        .map(|_| (0..num_workers).map(|_| None).collect())
        .collect();

    for i in 0..num_workers {
        for j in (i + 1)..num_workers {
            trace!(i, j, "wiring local mock pipe");
            let (a, b) = tokio::io::duplex(MOCK_PIPE_CAPACITY);
            slots[i][j] = Some(Connection::new(a));
            slots[j][i] = Some(Connection::new(b));
        }
    }

    let handles: Vec<_> = slots
        .into_iter()
        .enumerate()
        .map(|(rank, connections)| tokio::spawn(worker(Group::from_connections(rank, connections))))
        .collect();

    for handle in handles {
        handle.await.expect("local mock worker panicked");
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn mock_group_shape() {
        execute_local_mock(3, |group| async move {
            assert_eq!(group.size(), 3);
            assert!(group.connection(group.my_rank()).is_err());
            for peer in 0..3 {
                if peer != group.my_rank() {
                    assert!(group.connection(peer).is_ok());
                }
            }
            assert_eq!(group.connections().count(), 2);
        })
        .await;
    }

    #[tokio::test]
    async fn mock_pipes_are_cross_wired() {
        execute_local_mock(2, |group| async move {
            let me = group.my_rank();
            let peer = 1 - me;
            let conn = group.connection(peer).unwrap();

            conn.send(&[me as u8], b"hello").await.unwrap();

            let mut reader = conn.take_reader().unwrap();
            let mut received = [0u8; 6];
            reader.read_exact(&mut received).await.unwrap();
            assert_eq!(received[0] as usize, peer);
            assert_eq!(&received[1..], b"hello");
        })
        .await;
    }

    #[tokio::test]
    async fn reader_taken_once() {
        let (a, _b) = tokio::io::duplex(64);
        let conn = Connection::new(a);
        assert!(conn.take_reader().is_some());
        assert!(conn.take_reader().is_none());
    }
}
