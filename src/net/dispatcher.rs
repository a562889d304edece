use std::sync::Arc;

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{Group, TransportError};
use crate::{
    buffers::Buffer,
    channel::{FrameHeader, Multiplexer},
};

/// Owns the receive side of every connection in the group.
///
/// One receive loop per connection reads frames off the wire and hands them
/// to the multiplexer, so all receive-side chain appends happen on dispatcher
/// tasks while application code only ever touches the chains they feed. The
/// loops run until cancelled, until their peer closes the stream at a frame
/// boundary, or until an error occurs.
///
/// On a transport or protocol error the dispatcher fails every receive chain
/// of the multiplexer, unblocking all waiting iterators with the error.
pub struct Dispatcher {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawns the receive loops for all connections of `group`.
    pub(crate) fn start(group: &Group, mux: Arc<Multiplexer>) -> Self {
        let token = CancellationToken::new();
        let mut tasks = Vec::new();

        for (peer, connection) in group.connections() {
            match connection.take_reader() {
                Some(reader) => {
                    tasks.push(tokio::spawn(recv_loop(peer, reader, mux.clone(), token.clone())));
                }
                None => warn!(peer, "connection reader already taken, not dispatching"),
            }
        }

        Self { token, tasks }
    }

    /// Cancels all receive loops and waits for them to finish.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.token.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn recv_loop<R>(peer: usize, mut reader: R, mux: Arc<Multiplexer>, token: CancellationToken)
where
    R: AsyncRead + Send + Unpin,
{
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                trace!(peer, "receive loop cancelled");
                break;
            }
            frame = read_frame(peer, &mut reader) => match frame {
                Ok(Some((header, payload))) => {
                    trace!(peer, channel = header.channel, bytes = header.payload_bytes, "frame received");
                    if let Err(err) = mux.dispatch(peer, header, payload) {
                        warn!(peer, %err, "protocol violation, failing all channels");
                        mux.fail_all(Arc::new(TransportError::Protocol(err)));
                        break;
                    }
                }
                Ok(None) => {
                    debug!(peer, "peer closed the connection");
                    break;
                }
                Err(err) => {
                    warn!(peer, %err, "transport failure, failing all channels");
                    mux.fail_all(Arc::new(err));
                    break;
                }
            }
        }
    }
}

/// Reads one frame: the fixed-size header, then exactly `payload_bytes`.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary.
async fn read_frame<R>(peer: usize, reader: &mut R) -> Result<Option<(FrameHeader, Buffer)>, TransportError>
where
    R: AsyncRead + Send + Unpin,
{
    let mut header_bytes = [0u8; FrameHeader::WIRE_LEN];
    if let Err(source) = reader.read_exact(&mut header_bytes).await {
        if source.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(TransportError::Io { peer, source });
    }

    let header = FrameHeader::decode(&header_bytes)?;

    let mut payload = vec![0u8; header.payload_bytes as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|source| TransportError::Io { peer, source })?;

    Ok(Some((header, Buffer::from_vec(payload, header.element_count as usize))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_frame_round_trip() {
        let (client, server) = tokio::io::duplex(1024);
        let connection = crate::net::Connection::new(client);

        let header = FrameHeader::data(7, 1, 3, 2);
        connection.send(&header.encode(), &[10, 20, 30]).await.unwrap();

        let mut reader = crate::net::Connection::new(server).take_reader().unwrap();
        let (decoded, payload) = read_frame(1, &mut reader).await.unwrap().unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload.as_slice(), &[10, 20, 30]);
        assert_eq!(payload.elements(), 2);
    }

    #[tokio::test]
    async fn read_frame_clean_eof() {
        let (client, server) = tokio::io::duplex(1024);
        drop(client);

        let mut reader = crate::net::Connection::new(server).take_reader().unwrap();
        assert!(read_frame(0, &mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_frame_truncated_payload_is_transport_error() {
        let (client, server) = tokio::io::duplex(1024);
        let connection = crate::net::Connection::new(client);

        // Header promises 8 payload bytes but only 2 arrive before EOF
        let header = FrameHeader::data(0, 0, 8, 1);
        connection.send(&header.encode(), &[1, 2]).await.unwrap();
        drop(connection);

        let mut reader = crate::net::Connection::new(server).take_reader().unwrap();
        assert!(matches!(
            read_frame(0, &mut reader).await,
            Err(TransportError::Io { peer: 0, .. })
        ));
    }
}
