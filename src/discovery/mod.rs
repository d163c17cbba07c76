//! Registry-based autodiscovery.
//!
//! This module provides:
//! - JSON-RPC 2.0 protocol types for registration, discovery and negotiation
//! - Length-prefixed message framing
//! - The registry server and a multiplexed client
//!
//! # Protocol
//!
//! Messages are framed with a 4-byte big-endian length prefix followed by JSON-RPC 2.0 content.
//!
//! ## Methods
//!
//! - `register` - Publish a ping-pong server (URL, certificate hash, capabilities)
//! - `heartbeat` - Keep the lease alive, report load and RTT
//! - `unregister` - Withdraw the registration
//! - `discover` - List live servers matching capabilities, best first
//! - `negotiate` - Obtain a single-use ticket for a server
//! - `report` - Report a connection outcome
//!
//! ## Notifications (registry → server)
//!
//! - `session_offer` - A ticket the server should accept

pub mod client;
pub mod framing;
pub mod protocol;
pub mod registry;

pub use client::{DiscoveryClient, RegistryEvent, RpcFailure};
pub use framing::{read_message, write_message};
pub use protocol::{
    DiscoverParams, HeartbeatParams, JsonRpcError, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, NegotiateResult, RegisterParams, RegisterResult, ServerRecord,
    SessionOfferParams, DISCOVERY_PROTOCOL_VERSION, JSONRPC_VERSION,
};
pub use registry::{run_registry, RegistryOptions, RegistryServer};
