//! Single-use session tickets handed out during connection negotiation.
//!
//! The registry mints a ticket for every successful `negotiate` call and
//! pushes it to the chosen server as a `session_offer`. The client then
//! presents the same ticket in the WebTransport URL query. A ticket:
//! - is `t` followed by base64url (no padding) of 24 random bytes
//! - redeems at most once
//! - stops redeeming once its TTL has elapsed

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use log::debug;
use rand::RngCore;
use tokio::sync::{Mutex, Notify};

/// Required prefix character for tickets.
pub const TICKET_PREFIX: char = 't';

/// Number of random bytes in a ticket.
const TICKET_RANDOM_BYTES: usize = 24;

/// Encoded ticket length (prefix + 32 base64url chars).
pub const TICKET_LENGTH: usize = 33;

/// Default lifetime of an issued ticket.
pub const DEFAULT_TICKET_TTL: Duration = Duration::from_secs(15);

/// Generate a fresh random ticket.
pub fn generate_ticket() -> String {
    let mut random = [0u8; TICKET_RANDOM_BYTES];
    rand::rng().fill_bytes(&mut random);
    format!("{}{}", TICKET_PREFIX, URL_SAFE_NO_PAD.encode(random))
}

/// Cheap shape check done before touching the store.
pub fn is_well_formed(ticket: &str) -> bool {
    ticket.len() == TICKET_LENGTH
        && ticket.starts_with(TICKET_PREFIX)
        && URL_SAFE_NO_PAD
            .decode(&ticket[TICKET_PREFIX.len_utf8()..])
            .map(|b| b.len() == TICKET_RANDOM_BYTES)
            .unwrap_or(false)
}

/// In-memory store of tickets a server is willing to accept.
#[derive(Default)]
pub struct TicketStore {
    tickets: Mutex<HashMap<String, Instant>>,
    added: Notify,
}

impl TicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `ticket` for the next `ttl`. Re-adding refreshes the expiry.
    pub async fn add(&self, ticket: impl Into<String>, ttl: Duration) {
        let ticket = ticket.into();
        debug!("Ticket {} added (ttl {:?})", short_ticket(&ticket), ttl);
        self.tickets
            .lock()
            .await
            .insert(ticket, Instant::now() + ttl);
        self.added.notify_waiters();
    }

    /// Remove and validate `ticket`. Returns true only for a live ticket.
    pub async fn redeem(&self, ticket: &str) -> bool {
        if !is_well_formed(ticket) {
            return false;
        }
        match self.tickets.lock().await.remove(ticket) {
            Some(expires_at) => expires_at > Instant::now(),
            None => false,
        }
    }

    /// Like [`redeem`](Self::redeem), but waits up to `wait` for the ticket
    /// to be added. Covers a client that connects before the registry's
    /// offer reaches this server.
    pub async fn redeem_within(&self, ticket: &str, wait: Duration) -> bool {
        if !is_well_formed(ticket) {
            return false;
        }
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.added.notified();
            tokio::pin!(notified);
            // Register interest before checking so an add in between is not missed
            notified.as_mut().enable();

            if self.redeem(ticket).await {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    /// Drop expired tickets. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut tickets = self.tickets.lock().await;
        let before = tickets.len();
        tickets.retain(|_, expires_at| *expires_at > now);
        before - tickets.len()
    }

    pub async fn len(&self) -> usize {
        self.tickets.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tickets.lock().await.is_empty()
    }
}

/// First eight characters of a ticket for logging. Safe on untrusted input.
pub fn short_ticket(ticket: &str) -> &str {
    ticket
        .char_indices()
        .nth(8)
        .map_or(ticket, |(end, _)| &ticket[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_short_ticket_respects_char_boundaries() {
        assert_eq!(short_ticket("tABCDEFGHIJ"), "tABCDEFG");
        assert_eq!(short_ticket("tab"), "tab");
        assert_eq!(short_ticket(""), "");
        // 9 bytes, byte 8 falls inside the last 'é'
        assert_eq!(short_ticket("aéééé"), "aéééé");
        assert_eq!(short_ticket("ééééééééé"), "éééééééé");
    }

    #[test]
    fn test_generate_ticket_format() {
        let ticket = generate_ticket();
        assert_eq!(ticket.len(), TICKET_LENGTH);
        assert!(ticket.starts_with(TICKET_PREFIX));
        assert!(is_well_formed(&ticket));
        assert_ne!(ticket, generate_ticket());
    }

    #[test]
    fn test_malformed_tickets() {
        assert!(!is_well_formed(""));
        assert!(!is_well_formed("tshort"));
        let mut wrong_prefix = generate_ticket();
        wrong_prefix.replace_range(0..1, "x");
        assert!(!is_well_formed(&wrong_prefix));
        let bad_chars = format!("{}{}", TICKET_PREFIX, "!".repeat(TICKET_LENGTH - 1));
        assert!(!is_well_formed(&bad_chars));
    }

    #[tokio::test]
    async fn test_add_then_redeem_once() {
        let store = TicketStore::new();
        let ticket = generate_ticket();
        store.add(ticket.clone(), Duration::from_secs(5)).await;
        assert_eq!(store.len().await, 1);

        assert!(store.redeem(&ticket).await);
        assert!(!store.redeem(&ticket).await);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_ticket_does_not_redeem() {
        let store = TicketStore::new();
        assert!(!store.redeem(&generate_ticket()).await);
    }

    #[tokio::test]
    async fn test_expired_ticket_does_not_redeem() {
        let store = TicketStore::new();
        let ticket = generate_ticket();
        store.add(ticket.clone(), Duration::ZERO).await;
        assert!(!store.redeem(&ticket).await);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = TicketStore::new();
        store.add(generate_ticket(), Duration::ZERO).await;
        store.add(generate_ticket(), Duration::from_secs(60)).await;
        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_redeem_within_waits_for_late_offer() {
        let store = Arc::new(TicketStore::new());
        let ticket = generate_ticket();

        let adder = {
            let store = store.clone();
            let ticket = ticket.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                store.add(ticket, Duration::from_secs(5)).await;
            })
        };

        assert!(store.redeem_within(&ticket, Duration::from_secs(2)).await);
        adder.await.unwrap();
    }

    #[tokio::test]
    async fn test_redeem_within_gives_up() {
        let store = TicketStore::new();
        let started = Instant::now();
        assert!(
            !store
                .redeem_within(&generate_ticket(), Duration::from_millis(100))
                .await
        );
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
