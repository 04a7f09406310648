//! Bounded cache of live transport handles
//!
//! Entries are keyed by `(endpoint, client id)`. A live entry is returned as
//! is; a dead one is evicted and replaced. When a new entry would exceed the
//! capacity, the oldest-inserted entry is evicted and shut down. Eviction is
//! by insertion order, not by last use.
//!
//! The lock is never held across a connect or a shutdown.

use super::{Connector, EventSender, SharedTransport, TransportId};
use crate::config::PoolSection;
use crate::error::{GateError, GateResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub endpoint: String,
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub struct PooledConnection {
    pub key: PoolKey,
    pub handle: SharedTransport,
}

/// True when both handles point at the same transport instance
pub fn same_handle(a: &SharedTransport, b: &SharedTransport) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[derive(Debug)]
pub struct ConnectionPool {
    capacity: usize,
    connect_timeout: Duration,
    entries: Mutex<VecDeque<PooledConnection>>,
}

impl ConnectionPool {
    pub fn new(capacity: usize, connect_timeout: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            connect_timeout,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn from_config(section: &PoolSection) -> Self {
        Self::new(
            section.capacity,
            Duration::from_millis(section.connect_timeout_ms),
        )
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, VecDeque<PooledConnection>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys in insertion order, oldest first
    pub fn keys(&self) -> Vec<PoolKey> {
        self.entries().iter().map(|e| e.key.clone()).collect()
    }

    /// Return a live handle for the connector's endpoint, connecting if needed
    pub async fn get_connection(
        &self,
        connector: &dyn Connector,
        client_id: &str,
        events: EventSender,
    ) -> GateResult<SharedTransport> {
        let key = PoolKey {
            endpoint: connector.endpoint(),
            client_id: client_id.to_string(),
        };

        let dead = {
            let mut entries = self.entries();
            match entries.iter().position(|e| e.key == key) {
                Some(index) if entries[index].handle.is_alive() => {
                    debug!(endpoint = %key.endpoint, client_id, "Reusing pooled connection");
                    return Ok(entries[index].handle.clone());
                }
                Some(index) => entries.remove(index),
                None => None,
            }
        };
        if let Some(dead) = dead {
            debug!(endpoint = %key.endpoint, "Evicting dead pooled connection");
            dead.handle.shutdown().await;
        }

        let id = TransportId::next();
        let handle = match tokio::time::timeout(self.connect_timeout, connector.connect(id, events))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(GateError::connect_timeout(
                    key.endpoint,
                    self.connect_timeout.as_millis() as u64,
                ))
            }
        };

        let (winner, discarded) = self.insert(key.clone(), handle);
        for stale in discarded {
            info!(endpoint = %stale.key.endpoint, "Shutting down evicted connection");
            stale.handle.shutdown().await;
        }
        Ok(winner)
    }

    /// Insert a freshly connected handle. If a live handle for the same key
    /// appeared while we were connecting, keep that one and discard ours.
    fn insert(
        &self,
        key: PoolKey,
        handle: SharedTransport,
    ) -> (SharedTransport, Vec<PooledConnection>) {
        let mut entries = self.entries();
        let mut discarded = Vec::new();

        if let Some(index) = entries.iter().position(|e| e.key == key) {
            if entries[index].handle.is_alive() {
                debug!(endpoint = %key.endpoint, "Concurrent connect won the race, discarding ours");
                let existing = entries[index].handle.clone();
                discarded.push(PooledConnection { key, handle });
                return (existing, discarded);
            }
            if let Some(dead) = entries.remove(index) {
                discarded.push(dead);
            }
        }

        while entries.len() >= self.capacity {
            match entries.pop_front() {
                Some(oldest) => {
                    debug!(endpoint = %oldest.key.endpoint, "Pool full, evicting oldest entry");
                    discarded.push(oldest);
                }
                None => break,
            }
        }

        entries.push_back(PooledConnection {
            key,
            handle: handle.clone(),
        });
        (handle, discarded)
    }

    /// Drop one handle from the pool and shut it down
    pub async fn release(&self, handle: &SharedTransport) {
        let removed = {
            let mut entries = self.entries();
            entries
                .iter()
                .position(|e| same_handle(&e.handle, handle))
                .and_then(|index| entries.remove(index))
        };
        if let Some(entry) = removed {
            entry.handle.shutdown().await;
        }
    }

    /// Shut down and forget every pooled handle
    pub async fn release_all(&self) {
        let drained: Vec<PooledConnection> = self.entries().drain(..).collect();
        for entry in drained {
            entry.handle.shutdown().await;
        }
    }
}
