//! Message-oriented duplex sockets and the connectors that open them.
//!
//! A [`Socket`] is a pair of channels: frames written by the transport and
//! frames received from the relay. Dropping the socket closes it; the
//! receive side yields `None` once the remote end is gone. Connectors hide
//! where the frames actually travel, which keeps the transport testable
//! without a network.

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Frames buffered from the relay before the reader task waits.
const INCOMING_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {message}")]
    Connect { url: String, message: String },
    #[error("transport already destroyed")]
    Destroyed,
    #[error("transport task stopped")]
    Closed,
    /// The transport was created outside of a tokio runtime.
    #[error("sync transport requires a running tokio runtime")]
    NoRuntime,
}

/// Transport side of an open connection.
#[derive(Debug)]
pub struct Socket {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    incoming: mpsc::Receiver<Vec<u8>>,
}

/// Remote side of a [`Socket`] created with [`Socket::pair`].
#[derive(Debug)]
pub struct SocketPeer {
    /// Frames delivered to the transport. Dropping it closes the socket.
    pub to_client: mpsc::Sender<Vec<u8>>,
    /// Frames written by the transport; ends when the socket is dropped.
    pub from_client: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Socket {
    /// A connected socket and the handle for its other end.
    pub fn pair() -> (Socket, SocketPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(INCOMING_BUFFER);
        (
            Socket {
                outgoing: out_tx,
                incoming: in_rx,
            },
            SocketPeer {
                to_client: in_tx,
                from_client: out_rx,
            },
        )
    }

    /// Queue a frame. Returns false when the connection is already gone.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        self.outgoing.send(frame).is_ok()
    }

    /// Next frame from the relay, `None` once the connection closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.incoming.recv().await
    }
}

/// Opens sockets to a relay URL.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Socket, TransportError>>;
}

/// Binary WebSocket frames over tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Socket, TransportError>> {
        let url = url.to_owned();
        async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::Connect {
                    url: url.clone(),
                    message: e.to_string(),
                })?;
            let (mut ws_writer, mut ws_reader) = ws_stream.split();
            let (socket, peer) = Socket::pair();
            let SocketPeer {
                to_client,
                mut from_client,
            } = peer;

            // Writer task: forward outgoing frames, close when the socket drops
            tokio::spawn(async move {
                while let Some(frame) = from_client.recv().await {
                    if ws_writer.send(WsMessage::Binary(frame.into())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_writer.close().await;
            });

            // Reader task: binary frames to the transport, stop on close or error
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(WsMessage::Binary(data)) => {
                            if to_client.send(data.to_vec()).await.is_err() {
                                break;
                            }
                        }
                        Ok(WsMessage::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            log::debug!("WebSocket read error: {e}");
                            break;
                        }
                    }
                }
            });

            log::info!("WebSocket connected to {url}");
            Ok(socket)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (mut socket, mut peer) = Socket::pair();
        assert!(socket.send(vec![1]));
        assert_eq!(peer.from_client.recv().await, Some(vec![1]));

        peer.to_client.send(vec![2]).await.unwrap();
        assert_eq!(socket.recv().await, Some(vec![2]));
    }

    #[tokio::test]
    async fn test_dropping_either_end_closes() {
        let (mut socket, peer) = Socket::pair();
        drop(peer);
        assert_eq!(socket.recv().await, None);
        assert!(!socket.send(vec![0]));

        let (socket, mut peer) = Socket::pair();
        drop(socket);
        assert_eq!(peer.from_client.recv().await, None);
    }

    #[tokio::test]
    async fn test_websocket_connect_failure() {
        // Grab a free port, then release it so nothing listens there.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = WebSocketConnector.connect(&format!("ws://{addr}/room")).await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }
}
