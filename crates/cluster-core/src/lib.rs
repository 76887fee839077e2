//! cluster-core: coordination layer for a cluster of real-time connection
//! servers sharing one message bus.
//!
//! This crate provides:
//! - Membership tracking through heartbeats and leave notices
//! - Request/response correlation across nodes with timeouts
//! - Session ownership and handoff between nodes (polling, upgrades, proxying)
//! - Cluster-wide broadcast and aggregation for namespaced room adapters
//! - A connection-state recovery store for reconnecting clients
//! - The `MessageBus` trait abstraction and an in-memory bus

pub mod adapter;
pub mod bus;
pub mod config;
mod context;
pub mod correlator;
pub mod engine;
pub mod events;
pub mod membership;
pub mod node;
pub mod node_id;
pub mod packet;
pub mod protocol;
pub mod recovery;

pub use adapter::local::{InMemoryAdapter, LocalAdapter};
pub use adapter::options::{BroadcastFlags, BroadcastOptions, BroadcastPacket, SocketDetails};
pub use adapter::{AdapterError, ClusterAdapter, EmitReplies};
pub use bus::{BusEndpoint, BusError, InMemoryBus, MessageBus};
pub use config::{AggregationPolicy, ClusterConfig, ConfigError, RecoveryConfig};
pub use context::now_ms;
pub use correlator::{Expectation, RequestCorrelator, RequestError, Resolution};
pub use engine::stream::StreamTransport;
pub use engine::{ClusterEngine, EngineError, EngineEvent, PollOutcome, UpgradeOutcome};
pub use events::{ClusterEvent, EventBus, LeaveReason, Subscription};
pub use membership::MembershipTracker;
pub use node::ClusterNode;
pub use node_id::{NodeId, NodeIdError, RequestId, SessionId};
pub use packet::{ChannelSink, Packet, PacketKind, PacketSink, SinkFrame, TransportEvent, TransportKind};
pub use protocol::{ClusterMessage, MessageBody};
pub use recovery::{RecoveryStore, RestoredSession, SessionToPersist};
