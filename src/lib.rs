//! pingpong-rs library
//!
//! WebTransport ping-pong server and client with registry-based autodiscovery.

pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod negotiate;
pub mod pingpong;
pub mod registrar;
pub mod tickets;
