//! A node's WebSocket connection to the relay.
//!
//! Each connection wraps a WebSocket stream, handling the split between read
//! and write halves for async operation.

use crate::message::{HandshakeMessage, MAX_MESSAGE_SIZE};
use anyhow::{Result, anyhow};
use cluster_core::NodeId;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, warn};

/// Event emitted by a connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A bus frame
    Frame { conn_id: String, data: Vec<u8> },
    /// The node identified itself
    Handshake { conn_id: String, node_id: NodeId },
    /// Connection was closed
    Closed { conn_id: String },
}

type WsWrite = SplitSink<WebSocketStream<TcpStream>, Message>;

/// A single WebSocket connection from a node.
pub struct NodeConnection {
    /// Internal ID assigned by the relay (e.g., "conn-1")
    pub conn_id: String,
    /// Known after handshake
    pub node_id: Option<NodeId>,
    write: Arc<Mutex<WsWrite>>,
    read_task: Option<JoinHandle<()>>,
}

impl NodeConnection {
    /// Spawns a read task that forwards frames to the event channel.
    pub fn new(
        conn_id: String,
        ws_stream: WebSocketStream<TcpStream>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (write, read) = ws_stream.split();
        let read_conn_id = conn_id.clone();
        let read_task = tokio::spawn(async move {
            Self::read_loop(read_conn_id, read, event_tx).await;
        });

        Self {
            conn_id,
            node_id: None,
            write: Arc::new(Mutex::new(write)),
            read_task: Some(read_task),
        }
    }

    async fn read_loop(
        conn_id: String,
        mut read: SplitStream<WebSocketStream<TcpStream>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        let mut identified = false;
        loop {
            let data = match read.next().await {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame from {}", conn_id);
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    debug!("Connection {} closed", conn_id);
                    break;
                }
                Some(Err(e)) => {
                    error!("WebSocket error on {}: {}", conn_id, e);
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", conn_id);
                    break;
                }
            };

            if data.len() > MAX_MESSAGE_SIZE {
                warn!(
                    "Frame from {} exceeds max size ({} > {}), dropping",
                    conn_id,
                    data.len(),
                    MAX_MESSAGE_SIZE
                );
                continue;
            }

            let event = match HandshakeMessage::from_binary(&data) {
                Some(handshake) if !identified => {
                    identified = true;
                    debug!("Received handshake from {} (node_id: {})", conn_id, handshake.node_id);
                    ConnectionEvent::Handshake {
                        conn_id: conn_id.clone(),
                        node_id: handshake.node_id,
                    }
                }
                Some(_) => {
                    warn!("Repeated handshake from {}, ignoring", conn_id);
                    continue;
                }
                None => ConnectionEvent::Frame {
                    conn_id: conn_id.clone(),
                    data,
                },
            };
            if event_tx.send(event).is_err() {
                break;
            }
        }

        let _ = event_tx.send(ConnectionEvent::Closed {
            conn_id: conn_id.clone(),
        });
    }

    /// Send a binary frame to the node.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| anyhow!("Failed to send frame: {}", e))
    }

    pub fn set_node_id(&mut self, node_id: NodeId) {
        self.node_id = Some(node_id);
    }

    /// Close the connection gracefully.
    pub async fn close(&mut self) {
        if let Ok(mut write) = self.write.try_lock() {
            let _ = write.send(Message::Close(None)).await;
        }
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl Drop for NodeConnection {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}
