// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Cross-chain TTL cache of indexer call data.
//!
//! Shared by every orchestrator of the service so that a call already fetched
//! for one chain is not requested again for another. Only rows that carry a
//! verified call payload are cached; timestamp-only rows may still change.

use crate::types::{CallHash, CallRecord};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct CachedCall {
    record: CallRecord,
    inserted_at: Instant,
}

#[derive(Debug)]
pub struct CallDataCache {
    entries: RwLock<HashMap<CallHash, CachedCall>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CallDataCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Split `call_hashes` into cached rows and hashes that still need a lookup
    pub async fn lookup(
        &self,
        call_hashes: &HashSet<CallHash>,
    ) -> (HashMap<CallHash, CallRecord>, HashSet<CallHash>) {
        let entries = self.entries.read().await;
        let mut found = HashMap::new();
        let mut missing = HashSet::new();

        for call_hash in call_hashes {
            match entries.get(call_hash) {
                Some(cached) if cached.inserted_at.elapsed() < self.ttl => {
                    found.insert(*call_hash, cached.record.clone());
                }
                _ => {
                    missing.insert(*call_hash);
                }
            }
        }

        self.hits.fetch_add(found.len() as u64, Ordering::Relaxed);
        self.misses.fetch_add(missing.len() as u64, Ordering::Relaxed);
        (found, missing)
    }

    pub async fn get(&self, call_hash: &CallHash) -> Option<CallRecord> {
        let (mut found, _) = self.lookup(&HashSet::from([*call_hash])).await;
        found.remove(call_hash)
    }

    /// Cache every row that has a call payload, evicting expired rows first.
    /// Returns the number cached.
    pub async fn insert_many(&self, records: &HashMap<CallHash, CallRecord>) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        self.evict_expired(&mut entries);
        let mut inserted = 0;
        for (call_hash, record) in records {
            if record.call.is_none() {
                continue;
            }
            entries.insert(
                *call_hash,
                CachedCall {
                    record: record.clone(),
                    inserted_at: now,
                },
            );
            inserted += 1;
        }
        inserted
    }

    /// Drop expired rows, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        self.evict_expired(&mut entries)
    }

    fn evict_expired(&self, entries: &mut HashMap<CallHash, CachedCall>) -> usize {
        let before = entries.len();
        entries.retain(|_, cached| cached.inserted_at.elapsed() < self.ttl);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Hit rate between 0.0 and 1.0
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
