//! Bus client: a node's connection to the relay.
//!
//! `WsBus::connect` performs the handshake and hands back a `BusEndpoint`
//! whose inbound channel closes when the relay connection ends.

use crate::message::{HandshakeMessage, MAX_MESSAGE_SIZE};
use anyhow::{Context, Result};
use async_trait::async_trait;
use cluster_core::bus::{self, BusEndpoint, BusError, MessageBus};
use cluster_core::NodeId;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsBus {
    url: String,
    write: Mutex<SplitSink<WsStream, Message>>,
    read_task: JoinHandle<()>,
}

impl WsBus {
    /// Connect to the relay at `url` and identify as `node_id`.
    pub async fn connect(url: &str, node_id: NodeId) -> Result<BusEndpoint> {
        let (ws_stream, _) = connect_async(url)
            .await
            .with_context(|| format!("Failed to connect to relay at {}", url))?;
        let (mut write, read) = ws_stream.split();

        let handshake = HandshakeMessage::new(node_id);
        write
            .send(Message::Binary(handshake.to_binary()))
            .await
            .context("Failed to send handshake")?;
        info!("Connected to relay at {} as {}", url, node_id);

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let read_url = url.to_string();
        let read_task = tokio::spawn(async move {
            Self::read_loop(read_url, read, inbound_tx).await;
        });

        let publisher = Arc::new(Self {
            url: url.to_string(),
            write: Mutex::new(write),
            read_task,
        });
        Ok(BusEndpoint { publisher, inbound })
    }

    async fn read_loop(url: String, mut read: SplitStream<WsStream>, inbound: mpsc::UnboundedSender<Vec<u8>>) {
        loop {
            let data = match read.next().await {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame from {}", url);
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => break,
                Some(Err(e)) => {
                    error!("WebSocket error on {}: {}", url, e);
                    break;
                }
                None => break,
            };

            if data.len() > MAX_MESSAGE_SIZE {
                warn!("Frame from {} exceeds max size ({} bytes), dropping", url, data.len());
                continue;
            }
            if inbound.send(data).is_err() {
                break;
            }
        }
        warn!("Relay connection {} ended", url);
    }
}

#[async_trait]
impl MessageBus for WsBus {
    /// The relay reads the recipient from the frame itself.
    async fn publish(&self, payload: Vec<u8>, _recipient: Option<NodeId>) -> bus::Result<()> {
        let mut write = self.write.lock().await;
        write.send(Message::Binary(payload)).await.map_err(|e| match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => BusError::Disconnected,
            other => BusError::PublishFailed(format!("{}: {}", self.url, other)),
        })
    }
}

impl Drop for WsBus {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}
