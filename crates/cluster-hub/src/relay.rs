//! WebSocket relay carrying the cluster bus between nodes.
//!
//! Manages connection lifecycle, node ID mapping and frame routing. The
//! handshake lifecycle is encapsulated: callers only see `RelayEvent`s with
//! resolved node IDs via `poll_event()`.
//!
//! Routing: a frame naming a connected `recipientId` goes to that node only.
//! Every other frame goes to all nodes except its sender.

use crate::connection::{ConnectionEvent, NodeConnection};
use crate::message::recipient_of;
use anyhow::Result;
use cluster_core::NodeId;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

/// Event emitted by the relay after the handshake lifecycle is resolved.
#[derive(Debug)]
pub enum RelayEvent {
    NodeConnected { node_id: NodeId },
    Frame { from: NodeId, data: Vec<u8> },
    NodeDisconnected { node_id: NodeId },
}

pub struct RelayServer {
    /// Pre-handshake connections indexed by conn_id
    pending: HashMap<String, NodeConnection>,
    /// Post-handshake connections indexed by node ID
    nodes: HashMap<NodeId, NodeConnection>,
    /// Map from conn_id to node ID (for resolving frames/closes)
    conn_id_to_node: HashMap<String, NodeId>,
    next_conn_id: u64,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayServer {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            pending: HashMap::new(),
            nodes: HashMap::new(),
            conn_id_to_node: HashMap::new(),
            next_conn_id: 1,
            event_tx,
            event_rx,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections and relay frames until the listener fails.
    pub async fn run(mut self, listener: TcpListener) -> Result<()> {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, addr) = result?;
                    self.accept_connection(stream, addr).await;
                }
                Some(event) = self.poll_event() => {
                    match event {
                        RelayEvent::NodeConnected { node_id } => {
                            info!("Node connected: {} ({} total)", node_id, self.node_count());
                        }
                        RelayEvent::Frame { from, data } => self.route(from, &data).await,
                        RelayEvent::NodeDisconnected { node_id } => {
                            info!("Node disconnected: {} ({} left)", node_id, self.node_count());
                        }
                    }
                }
            }
        }
    }

    /// Upgrade a TCP connection to WebSocket. It stays pending until the
    /// node sends its handshake.
    pub async fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                // Health checks connect and close without a WebSocket handshake
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before handshake from {}", addr);
                } else {
                    error!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return;
            }
        };

        let conn_id = format!("conn-{}", self.next_conn_id);
        self.next_conn_id += 1;
        debug!("New connection from {} (conn_id: {})", addr, conn_id);

        let conn = NodeConnection::new(conn_id.clone(), ws_stream, self.event_tx.clone());
        self.pending.insert(conn_id, conn);
    }

    /// Wait for the next relay event.
    ///
    /// Connections that close before handshake, and frames sent before it,
    /// are dropped silently.
    pub async fn poll_event(&mut self) -> Option<RelayEvent> {
        loop {
            match self.event_rx.recv().await? {
                ConnectionEvent::Handshake { conn_id, node_id } => {
                    let Some(mut conn) = self.pending.remove(&conn_id) else {
                        continue;
                    };
                    conn.set_node_id(node_id);
                    if let Some(mut previous) = self.nodes.insert(node_id, conn) {
                        warn!("Node {} reconnected, dropping {}", node_id, previous.conn_id);
                        self.conn_id_to_node.remove(&previous.conn_id);
                        previous.close().await;
                    }
                    self.conn_id_to_node.insert(conn_id, node_id);
                    return Some(RelayEvent::NodeConnected { node_id });
                }
                ConnectionEvent::Frame { conn_id, data } => match self.conn_id_to_node.get(&conn_id) {
                    Some(&from) => return Some(RelayEvent::Frame { from, data }),
                    None => {
                        debug!("Dropping frame from {} before handshake", conn_id);
                        continue;
                    }
                },
                ConnectionEvent::Closed { conn_id } => match self.conn_id_to_node.remove(&conn_id) {
                    Some(node_id) => {
                        self.nodes.remove(&node_id);
                        return Some(RelayEvent::NodeDisconnected { node_id });
                    }
                    None => {
                        self.pending.remove(&conn_id);
                        debug!("Connection closed before handshake: {}", conn_id);
                        continue;
                    }
                },
            }
        }
    }

    /// Forward one frame from `from` to its recipient, or to everyone else.
    pub async fn route(&self, from: NodeId, data: &[u8]) {
        if let Some(recipient) = recipient_of(data) {
            if let Some(conn) = self.nodes.get(&recipient) {
                if let Err(e) = conn.send(data).await {
                    warn!("Failed to relay to {}: {}", recipient, e);
                }
                return;
            }
            debug!("Recipient {} not connected, relaying to all", recipient);
        }
        self.broadcast_except(data, from).await;
    }

    /// Send a frame to every connected node except one.
    pub async fn broadcast_except(&self, data: &[u8], exclude: NodeId) {
        for (node_id, conn) in &self.nodes {
            if *node_id == exclude {
                continue;
            }
            if let Err(e) = conn.send(data).await {
                warn!("Failed to relay to {}: {}", node_id, e);
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn connected_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.nodes.keys().copied().collect();
        nodes.sort();
        nodes
    }
}
