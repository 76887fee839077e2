//! End-to-end tests for the relay.
//!
//! Tests the full path: WebSocket connections, handshakes, frame routing,
//! and cluster nodes talking through the relay.

use std::net::SocketAddr;
use std::time::Duration;

use cluster_core::protocol::{self, ClusterMessage, MessageBody};
use cluster_core::{BroadcastOptions, BroadcastPacket, ClusterConfig, ClusterNode, InMemoryAdapter, NodeId};
use cluster_hub::{HandshakeMessage, RelayServer, WsBus};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

/// Raw client speaking the relay protocol directly.
struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    node_id: NodeId,
}

impl TestClient {
    async fn connect_and_handshake(addr: SocketAddr, node_id: u64) -> Self {
        let url = format!("ws://{}", addr);
        let (ws, _) = connect_async(url.as_str()).await.expect("Failed to connect");
        let mut client = Self {
            ws,
            node_id: NodeId::from(node_id),
        };
        let handshake = HandshakeMessage::new(client.node_id);
        client.send_binary(&handshake.to_binary()).await;
        client
    }

    async fn recv_message(&mut self) -> Vec<u8> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => return data,
                Some(Ok(Message::Text(text))) => return text.into_bytes(),
                Some(Ok(Message::Close(_))) => panic!("Connection closed unexpectedly"),
                Some(Err(e)) => panic!("WebSocket error: {}", e),
                None => panic!("Stream ended unexpectedly"),
                _ => continue,
            }
        }
    }

    async fn recv_message_timeout(&mut self, duration: Duration) -> Result<Vec<u8>, &'static str> {
        match timeout(duration, self.recv_message()).await {
            Ok(msg) => Ok(msg),
            Err(_) => Err("Timeout waiting for message"),
        }
    }

    async fn send_binary(&mut self, data: &[u8]) {
        self.ws
            .send(Message::Binary(data.to_vec()))
            .await
            .expect("Failed to send message");
    }

    async fn publish(&mut self, message: &ClusterMessage) {
        self.send_binary(&protocol::encode(message)).await;
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Start a relay on a random port.
async fn start_relay() -> SocketAddr {
    let listener = RelayServer::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(RelayServer::new().run(listener));
    addr
}

/// Let the relay register handshakes before traffic starts.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

fn fast() -> ClusterConfig {
    ClusterConfig {
        heartbeat_interval_ms: 50,
        heartbeat_timeout_ms: 200,
        cleanup_interval_ms: 25,
        ..ClusterConfig::default()
    }
}

async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_broadcast_frame_reaches_everyone_but_sender() {
    let addr = start_relay().await;
    let mut a = TestClient::connect_and_handshake(addr, 1).await;
    let mut b = TestClient::connect_and_handshake(addr, 2).await;
    let mut c = TestClient::connect_and_handshake(addr, 3).await;
    settle().await;

    let message = ClusterMessage::broadcast(a.node_id, MessageBody::Heartbeat);
    a.publish(&message).await;

    for client in [&mut b, &mut c] {
        let frame = client.recv_message_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(protocol::decode(&frame), Some(message.clone()));
    }
    assert!(a.recv_message_timeout(Duration::from_millis(200)).await.is_err());
}

#[tokio::test]
async fn test_unicast_frame_reaches_only_recipient() {
    let addr = start_relay().await;
    let mut a = TestClient::connect_and_handshake(addr, 1).await;
    let mut b = TestClient::connect_and_handshake(addr, 2).await;
    let mut c = TestClient::connect_and_handshake(addr, 3).await;
    settle().await;

    let message = ClusterMessage::broadcast(a.node_id, MessageBody::Heartbeat).to(c.node_id);
    a.publish(&message).await;

    let frame = c.recv_message_timeout(Duration::from_secs(2)).await.unwrap();
    assert_eq!(protocol::decode(&frame), Some(message));
    assert!(b.recv_message_timeout(Duration::from_millis(200)).await.is_err());
}

#[tokio::test]
async fn test_unknown_recipient_falls_back_to_broadcast() {
    let addr = start_relay().await;
    let mut a = TestClient::connect_and_handshake(addr, 1).await;
    let mut b = TestClient::connect_and_handshake(addr, 2).await;
    settle().await;

    let message = ClusterMessage::broadcast(a.node_id, MessageBody::Heartbeat).to(NodeId::from(99));
    a.publish(&message).await;

    let frame = b.recv_message_timeout(Duration::from_secs(2)).await.unwrap();
    assert_eq!(protocol::decode(&frame), Some(message));
}

#[tokio::test]
async fn test_frames_before_handshake_are_dropped() {
    let addr = start_relay().await;
    let (mut anonymous, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
    let mut b = TestClient::connect_and_handshake(addr, 2).await;
    settle().await;

    let message = ClusterMessage::broadcast(NodeId::from(5), MessageBody::Heartbeat);
    anonymous
        .send(Message::Binary(protocol::encode(&message)))
        .await
        .unwrap();

    assert!(b.recv_message_timeout(Duration::from_millis(300)).await.is_err());
}

// ============================================================================
// Cluster nodes over the relay
// ============================================================================

#[tokio::test]
async fn test_nodes_discover_each_other_and_share_broadcasts() {
    let addr = start_relay().await;
    let url = format!("ws://{}", addr);

    let a_bus = WsBus::connect(&url, NodeId::from(0xa)).await.unwrap();
    let b_bus = WsBus::connect(&url, NodeId::from(0xb)).await.unwrap();
    let (a, _a_events) = ClusterNode::start_with_id(NodeId::from(0xa), fast(), a_bus).unwrap();
    let (b, _b_events) = ClusterNode::start_with_id(NodeId::from(0xb), fast(), b_bus).unwrap();

    assert!(wait_for(|| a.server_count() == 2 && b.server_count() == 2).await);
    assert_eq!(a.peers(), vec![NodeId::from(0xb)]);

    let a_local = InMemoryAdapter::new();
    let b_local = InMemoryAdapter::new();
    let a_adapter = a.adapter("/", a_local.clone());
    let _b_adapter = b.adapter("/", b_local.clone());
    b_local.add_socket("b1", ["room1"]);

    a_adapter.broadcast(
        BroadcastPacket::event(vec![json!("over the wire")]),
        BroadcastOptions::to_rooms(["room1"]),
    );
    assert!(wait_for(|| b_local.received("b1").len() == 1).await);
    assert_eq!(b_local.received("b1")[0].data, vec![json!("over the wire")]);

    let sockets = a_adapter.fetch_sockets(BroadcastOptions::all()).await.unwrap();
    assert_eq!(sockets.len(), 1);
    assert_eq!(sockets[0].id, "b1");
}

#[tokio::test]
async fn test_node_leaving_is_noticed_through_relay() {
    let addr = start_relay().await;
    let url = format!("ws://{}", addr);

    let a_bus = WsBus::connect(&url, NodeId::from(0xa)).await.unwrap();
    let b_bus = WsBus::connect(&url, NodeId::from(0xb)).await.unwrap();
    let (a, _a_events) = ClusterNode::start_with_id(NodeId::from(0xa), fast(), a_bus).unwrap();
    let (b, _b_events) = ClusterNode::start_with_id(NodeId::from(0xb), fast(), b_bus).unwrap();
    assert!(wait_for(|| a.server_count() == 2).await);

    b.shutdown().await;
    drop(b);
    assert!(wait_for(|| a.server_count() == 1).await);
}
