//! Client connection state
use crate::close::Close;
use crate::error::Error;
use crate::error::Result;
use crate::event::Event;
use crate::notice::Notice;
use crate::subscription::Subscription;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

/// A subscription identifier has a maximum length
const MAX_SUBSCRIPTION_ID_LEN: usize = 64;

/// Outbound message queued for delivery on a single connection.  All
/// relay-generated traffic for a connection flows through one channel
/// of these, which is what preserves per-connection ordering.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// An event matching one of the connection's subscriptions.
    Event { sub_id: String, event: Arc<Event> },
    /// End-of-stored-events marker for a subscription.
    Eose { sub_id: String },
    /// An OK result or NOTICE.
    Notice(Notice),
    /// A negentropy protocol message (hex encoded).
    NegMsg { sub_id: String, message: String },
    /// A negentropy protocol error.
    NegErr { sub_id: String, reason: String },
}

/// Check a client-provided subscription identifier: 1..=64 bytes of
/// printable ASCII, excluding the quote and backslash characters.
#[must_use]
pub fn is_valid_sub_id(id: &str) -> bool {
    if id.is_empty() || id.len() > MAX_SUBSCRIPTION_ID_LEN {
        return false;
    }
    id.bytes()
        .all(|b| (0x20..=0x7e).contains(&b) && b != b'"' && b != b'\\')
}

/// State for a client connection
pub struct ClientConn {
    /// Client IP (either from socket, or configured proxy header
    client_ip_addr: String,
    /// Unique client identifier generated at connection time
    client_id: Uuid,
    /// The current set of active client subscriptions
    subscriptions: HashMap<String, Subscription>,
    /// Per-connection maximum concurrent subscriptions
    max_subs: usize,
}

impl ClientConn {
    /// Create a new, empty connection state.
    #[must_use]
    pub fn new(client_ip_addr: String, max_subs: usize) -> Self {
        let client_id = Uuid::new_v4();
        ClientConn {
            client_ip_addr,
            client_id,
            subscriptions: HashMap::new(),
            max_subs,
        }
    }

    #[must_use]
    pub fn subscriptions(&self) -> &HashMap<String, Subscription> {
        &self.subscriptions
    }

    /// Check if the given subscription already exists
    #[must_use]
    pub fn has_subscription(&self, sub: &Subscription) -> bool {
        self.subscriptions.values().any(|x| x == sub)
    }

    /// Get a short prefix of the client's unique identifier, suitable
    /// for logging.
    #[must_use]
    pub fn get_client_prefix(&self) -> String {
        self.client_id.to_string().chars().take(8).collect()
    }

    #[must_use]
    pub fn ip(&self) -> &str {
        &self.client_ip_addr
    }

    #[must_use]
    pub fn connection_id(&self) -> Uuid {
        self.client_id
    }

    /// Add a new subscription for this connection.  A subscription
    /// reusing an existing identifier replaces it.
    pub fn subscribe(&mut self, s: Subscription) -> Result<()> {
        let k = s.get_id();
        // prevent arbitrary and excessive sub IDs from being used.
        if !is_valid_sub_id(&k) {
            return Err(Error::SubIdInvalidError);
        }
        // check if an existing subscription exists, and replace if so
        if self.subscriptions.contains_key(&k) {
            self.subscriptions.remove(&k);
            self.subscriptions.insert(k, s);
            trace!(
                "replaced existing subscription (cid: {})",
                self.get_client_prefix()
            );
            return Ok(());
        }

        // check if there is room for another subscription.
        if self.subscriptions.len() >= self.max_subs {
            return Err(Error::SubMaxExceededError);
        }
        // add subscription
        self.subscriptions.insert(k, s);
        trace!(
            "registered new subscription, currently have {} active subs (cid: {})",
            self.subscriptions.len(),
            self.get_client_prefix(),
        );
        Ok(())
    }

    /// Remove the subscription for this connection.
    pub fn unsubscribe(&mut self, c: &Close) {
        // TODO: return notice if subscription did not exist.
        self.subscriptions.remove(&c.id);
        debug!(
            "removed subscription, currently have {} active subs (cid: {})",
            self.subscriptions.len(),
            self.get_client_prefix(),
        );
    }
}
