//! Control channel protocol and the connected-client registry.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Tag carried by the platform background-retry signal.
pub const RETRY_SYNC_TAG: &str = "retry-request";

/// Messages exchanged between the page and the worker.
///
/// Wire format is a tagged JSON object: `{"type": "SKIP_WAITING"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Force activation if at most one client is connected.
    #[serde(rename = "SKIP_WAITING")]
    SkipWaiting,

    /// Run the migration engine now.
    #[serde(rename = "PREPARE_CACHES_FOR_UPDATE")]
    PrepareCachesForUpdate,

    /// Drain the queue when the platform has no background-retry support.
    #[serde(rename = "retry-requests")]
    RetryRequests,

    /// Generic worker → page notification relay.
    #[serde(rename = "message")]
    Notify { payload: serde_json::Value },
}

impl ControlMessage {
    /// Decode a message from its wire form.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Encode a message to its wire form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ==================== Clients ====================

/// Identifier for a connected page instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

#[derive(Debug)]
struct Client {
    controlled: bool,
    tx: mpsc::UnboundedSender<ControlMessage>,
}

/// The set of currently connected page instances.
///
/// Client count gates skip-wait safety; the senders carry worker → page
/// notifications.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientId, Client>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly connected page; returns its id and the receiver
    /// for worker → page messages.
    pub fn connect(&mut self) -> (ClientId, mpsc::UnboundedReceiver<ControlMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ClientId::new();
        self.clients.insert(
            id,
            Client {
                controlled: false,
                tx,
            },
        );
        debug!(client = id.raw(), connected = self.clients.len(), "client connected");
        (id, rx)
    }

    /// Remove a disconnected page.
    pub fn disconnect(&mut self, id: ClientId) -> bool {
        let removed = self.clients.remove(&id).is_some();
        if removed {
            debug!(client = id.raw(), connected = self.clients.len(), "client disconnected");
        }
        removed
    }

    /// Number of connected clients.
    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Take control of every connected client; returns how many.
    pub fn claim(&mut self) -> usize {
        for client in self.clients.values_mut() {
            client.controlled = true;
        }
        self.clients.len()
    }

    /// Number of clients controlled by this worker.
    pub fn controlled_count(&self) -> usize {
        self.clients.values().filter(|c| c.controlled).count()
    }

    /// Deliver a message to every connected client.
    ///
    /// Clients whose receiver has gone away are dropped from the registry.
    pub fn broadcast(&mut self, message: &ControlMessage) -> usize {
        let mut delivered = 0;
        self.clients.retain(|id, client| {
            match client.tx.send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    trace!(client = id.raw(), "dropping client with closed channel");
                    false
                }
            }
        });
        delivered
    }
}
