//! WebTransport ping-pong: server, client and the shared message rules.

pub mod client;
pub mod server;

pub use client::{PingPongClient, Target};
pub use server::{PingPongServer, ServerOptions, ServerStats};

pub const PING: &[u8] = b"ping";
pub const PONG: &[u8] = b"pong";
pub const QUACK: &[u8] = b"quack";
pub const QUACK_ACK: &[u8] = b"quack-ack";

/// Upper bound on a single stream request.
pub const MAX_REQUEST_BYTES: usize = 64;

/// Reply for a bidirectional stream payload, if any.
pub fn pong_for(request: &[u8]) -> Option<&'static [u8]> {
    (request == PING).then_some(PONG)
}

/// Reply for a datagram: `quack` is acknowledged, anything else echoed.
pub fn datagram_reply(payload: &[u8]) -> Vec<u8> {
    if payload == QUACK {
        QUACK_ACK.to_vec()
    } else {
        payload.to_vec()
    }
}
