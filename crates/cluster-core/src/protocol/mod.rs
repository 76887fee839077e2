//! Cluster bus protocol.
//!
//! - `message`: the envelope and its tagged message kinds
//! - `codec`: JSON encoding and filtering of foreign or malformed payloads

pub mod codec;
pub mod message;

pub use codec::{decode, encode};
pub use message::{ClusterMessage, DEFAULT_NAMESPACE, MESSAGE_SOURCE, MessageBody};
