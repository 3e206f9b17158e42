//! In-process counting store.
//!
//! Useful for tests and single-node deployments. Atomicity per key comes from
//! the shard lock `DashMap` holds while an entry is being updated. Expired
//! windows are swept every `PURGE_INTERVAL` consumptions.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use super::store::{CountingStore, StoreError, WindowSnapshot};

/// Consumptions between sweeps of expired windows.
const PURGE_INTERVAL: u64 = 1024;

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    points: u64,
    expires_at: Instant,
}

/// A counting store held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    windows: DashMap<String, WindowEntry>,
    consumptions: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop windows whose expiry has passed.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.windows.retain(|_, entry| entry.expires_at > now);
    }

    /// Get the number of tracked windows, live or not yet purged.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl CountingStore for InMemoryStore {
    async fn consume(
        &self,
        key: &str,
        capacity: u64,
        window: Duration,
    ) -> Result<WindowSnapshot, StoreError> {
        // Sweep before taking the entry: retain locks every shard.
        if self.consumptions.fetch_add(1, Ordering::Relaxed) % PURGE_INTERVAL == PURGE_INTERVAL - 1 {
            self.purge_expired();
        }

        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry {
                points: 0,
                expires_at: now + window,
            });

        if entry.expires_at <= now {
            trace!(key = %key, "Window expired, starting a new one");
            *entry = WindowEntry {
                points: 0,
                expires_at: now + window,
            };
        }

        let admitted = entry.points < capacity;
        if admitted {
            entry.points += 1;
        }

        Ok(WindowSnapshot {
            admitted,
            points_consumed: entry.points,
            expires_in: entry.expires_at - now,
        })
    }

    async fn points(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let now = Instant::now();
        Ok(self
            .windows
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.points))
    }
}
