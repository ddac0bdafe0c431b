//! The connection pool: one live driver handle per host id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::driver::{Connector, DriverError, Hypervisor};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("host '{0}' is already connected")]
    AlreadyConnected(String),

    #[error("not connected to host '{0}'")]
    NotConnected(String),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    connections: RwLock<HashMap<String, Arc<dyn Hypervisor>>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        ConnectionPool {
            connector,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Dials the host and registers the handle. Fails without side effects
    /// when the id is already connected or the dial fails. The lock is not
    /// held across the dial.
    pub async fn add(&self, host_id: &str, uri: &str) -> Result<(), PoolError> {
        if self.connections.read().await.contains_key(host_id) {
            return Err(PoolError::AlreadyConnected(host_id.to_string()));
        }

        let handle = self.connector.connect(uri).await?;

        {
            let mut connections = self.connections.write().await;
            if connections.contains_key(host_id) {
                // Lost a connect race; discard the spare handle.
                let spare = handle;
                tokio::spawn(async move {
                    let _ = spare.disconnect().await;
                });
                return Err(PoolError::AlreadyConnected(host_id.to_string()));
            }
            connections.insert(host_id.to_string(), handle);
        }

        info!(host_id, "connected to host");
        Ok(())
    }

    /// Removes the entry and disconnects best-effort; a failed disconnect is
    /// logged, never surfaced.
    pub async fn remove(&self, host_id: &str) -> Result<(), PoolError> {
        let handle = self.connections.write().await.remove(host_id);
        match handle {
            Some(handle) => {
                if let Err(error) = handle.disconnect().await {
                    warn!(host_id, %error, "error disconnecting from host");
                }
                info!(host_id, "disconnected from host");
                Ok(())
            }
            None => Err(PoolError::NotConnected(host_id.to_string())),
        }
    }

    pub async fn get(&self, host_id: &str) -> Result<Arc<dyn Hypervisor>, PoolError> {
        self.connections
            .read()
            .await
            .get(host_id)
            .cloned()
            .ok_or_else(|| PoolError::NotConnected(host_id.to_string()))
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }
}
