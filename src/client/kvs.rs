//! Key-value store access.
//!
//! The client reads results through [`KvsClient`], whose only operation is a
//! lattice-returning `get`. Talking to a real store is the job of a
//! [`KvsConnector`], which turns the address learned during the handshake
//! into a client. [`MemoryKvs`] is an in-process store for co-located
//! deployments and tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::config::ClientConfig;
use crate::error::{KvsError, Result};
use crate::types::Lattice;

/// Read access to the key-value store.
#[async_trait]
pub trait KvsClient: Send + Sync {
    /// Reads the lattice stored under `key`, or `None` if nothing is
    /// visible yet.
    async fn get(&self, key: &str) -> std::result::Result<Option<Lattice>, KvsError>;
}

/// Opens a [`KvsClient`] for the address returned by the handshake.
#[async_trait]
pub trait KvsConnector: Send + Sync {
    /// Connects to the store at `store_address`.
    async fn connect(
        &self,
        store_address: &str,
        config: &ClientConfig,
    ) -> Result<Arc<dyn KvsClient>>;
}

/// Connector that ignores the address and hands out an existing client.
#[derive(Clone)]
pub struct LocalConnector(Arc<dyn KvsClient>);

impl LocalConnector {
    /// Wraps `store`.
    pub fn new(store: Arc<dyn KvsClient>) -> Self {
        Self(store)
    }
}

impl std::fmt::Debug for LocalConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("LocalConnector").finish()
    }
}

#[async_trait]
impl KvsConnector for LocalConnector {
    async fn connect(
        &self,
        store_address: &str,
        config: &ClientConfig,
    ) -> Result<Arc<dyn KvsClient>> {
        tracing::debug!(store_address, local_mode = config.local_mode, "using local store");
        Ok(self.0.clone())
    }
}

/// In-process store.
///
/// Writes merge into the stored lattice, so concurrent LWW puts converge to
/// the same value regardless of arrival order.
#[derive(Debug, Default)]
pub struct MemoryKvs {
    entries: DashMap<String, Lattice>,
    reads: AtomicU64,
}

impl MemoryKvs {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `lattice` into the value under `key`, returning `true` if the
    /// stored value changed.
    pub fn put(&self, key: impl Into<String>, lattice: Lattice) -> std::result::Result<bool, KvsError> {
        let key = key.into();
        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let key = entry.key().clone();
                entry.get_mut().merge(&key, &lattice)
            },
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(lattice);
                Ok(true)
            },
        }
    }

    /// Writes an LWW value.
    pub fn put_lww(
        &self,
        key: impl Into<String>,
        timestamp: u64,
        value: impl Into<bytes::Bytes>,
    ) -> std::result::Result<bool, KvsError> {
        self.put(key, Lattice::lww(timestamp, value))
    }

    /// Removes and returns the value under `key`.
    pub fn remove(&self, key: &str) -> Option<Lattice> {
        self.entries.remove(key).map(|(_, lattice)| lattice)
    }

    /// Number of `get` calls served so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of keys stored.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvsClient for MemoryKvs {
    async fn get(&self, key: &str) -> std::result::Result<Option<Lattice>, KvsError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }
}
