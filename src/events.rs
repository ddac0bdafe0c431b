//! In-process event bus.
//!
//! Every connected UI session registers a bounded outbound channel. Publish
//! serializes the event once and hands it to each channel without blocking;
//! a client whose buffer is full is evicted so one stalled browser cannot
//! back-pressure the rest.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::driver::VmSample;

/// Outbound buffer per client, in messages.
pub const CLIENT_BUFFER: usize = 32;

pub type ClientId = u64;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Event {
    HostsChanged,
    VmsChanged {
        #[serde(rename = "hostId")]
        host_id: String,
    },
    VmStatsUpdated {
        #[serde(rename = "hostId")]
        host_id: String,
        #[serde(rename = "vmName")]
        vm_name: String,
        stats: VmSample,
    },
}

#[derive(Default)]
pub struct EventBus {
    clients: Mutex<HashMap<ClientId, mpsc::Sender<String>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        self.clients.lock().unwrap().insert(id, tx);
        debug!(client = id, "event bus client registered");
        (id, rx)
    }

    pub fn unregister(&self, id: ClientId) {
        if self.clients.lock().unwrap().remove(&id).is_some() {
            debug!(client = id, "event bus client unregistered");
        }
    }

    /// Best-effort delivery: no retries, no backfill. Slow clients are
    /// evicted and expected to refetch over HTTP when they reconnect.
    pub fn publish(&self, event: &Event) {
        let message = match serde_json::to_string(event) {
            Ok(message) => message,
            Err(err) => {
                error!(%err, "failed to serialize event");
                return;
            }
        };

        let clients: Vec<(ClientId, mpsc::Sender<String>)> = {
            let clients = self.clients.lock().unwrap();
            clients
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        let mut evicted = Vec::new();
        for (id, tx) in clients {
            match tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client = id, "client too slow, evicting");
                    evicted.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => evicted.push(id),
            }
        }

        if !evicted.is_empty() {
            let mut clients = self.clients.lock().unwrap();
            for id in evicted {
                clients.remove(&id);
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }
}
