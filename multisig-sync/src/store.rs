// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Pending operation store
//!
//! Owns every `PendingOperation` record. Deltas are applied atomically under
//! a single write lock, so readers never observe a half-applied pass. After
//! each commit the observers of every affected scope receive the full list of
//! that scope, outside the lock.

use crate::client::{PendingOperationObserver, SubscriberId};
use crate::error::SyncResult;
use crate::metrics::SyncMetrics;
use crate::types::{
    CallHash, PendingOperation, PendingOperationDelta, PendingOperationKey, ScopeKey,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub type ScopedOperations = BTreeMap<PendingOperationKey, PendingOperation>;

struct ObserverEntry {
    scope: ScopeKey,
    observer: Arc<dyn PendingOperationObserver>,
}

pub struct PendingOperationStore {
    operations: RwLock<BTreeMap<PendingOperationKey, PendingOperation>>,
    observers: RwLock<BTreeMap<SubscriberId, ObserverEntry>>,
    next_subscriber_id: AtomicU64,
    /// JSON snapshot location, `None` for a purely in-memory store
    snapshot_path: Option<PathBuf>,
    metrics: Option<Arc<SyncMetrics>>,
}

impl PendingOperationStore {
    pub fn in_memory() -> Self {
        Self {
            operations: RwLock::new(BTreeMap::new()),
            observers: RwLock::new(BTreeMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            snapshot_path: None,
            metrics: None,
        }
    }

    /// Open a store backed by a JSON snapshot, loading it if present
    pub async fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut operations = BTreeMap::new();

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let rows: Vec<PendingOperation> = serde_json::from_slice(&bytes)?;
                for op in rows {
                    operations.insert(op.key(), op);
                }
                info!(
                    "PendingOperationStore loaded {} operations from {}",
                    operations.len(),
                    path.display()
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(
                    "PendingOperationStore snapshot {} not found, starting empty",
                    path.display()
                );
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            operations: RwLock::new(operations),
            snapshot_path: Some(path),
            ..Self::in_memory()
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Every record of a scope
    pub async fn fetch(&self, scope: &ScopeKey) -> Vec<PendingOperation> {
        let operations = self.operations.read().await;
        Self::scoped(&operations, scope).into_values().collect()
    }

    pub async fn get(&self, key: &PendingOperationKey) -> Option<PendingOperation> {
        self.operations.read().await.get(key).cloned()
    }

    pub async fn contains_call_hash(&self, scope: &ScopeKey, call_hash: &CallHash) -> bool {
        let operations = self.operations.read().await;
        operations
            .values()
            .any(|op| op.call_hash == *call_hash && op.scope_key() == *scope)
    }

    pub async fn len(&self) -> usize {
        self.operations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.operations.read().await.is_empty()
    }

    /// Apply a precomputed delta as one transaction
    pub async fn apply(&self, delta: PendingOperationDelta) -> SyncResult<PendingOperationDelta> {
        let scopes = delta_scopes(&delta);
        let mut committed = PendingOperationDelta::default();
        for scope in scopes {
            let part = PendingOperationDelta {
                new: delta.new.iter().filter(|op| op.scope_key() == scope).cloned().collect(),
                updated: delta
                    .updated
                    .iter()
                    .filter(|op| op.scope_key() == scope)
                    .cloned()
                    .collect(),
                removed: delta
                    .removed
                    .iter()
                    .filter(|key| key.scope_key() == scope)
                    .cloned()
                    .collect(),
            };
            let part = self.commit_with(&scope, |_| Ok(part)).await?;
            committed.new.extend(part.new);
            committed.updated.extend(part.updated);
            committed.removed.extend(part.removed);
        }
        Ok(committed)
    }

    /// Compute a delta from the scope's current records and apply it, all
    /// under the write lock. If `compute` fails nothing is written.
    pub async fn commit_with<F>(
        &self,
        scope: &ScopeKey,
        compute: F,
    ) -> SyncResult<PendingOperationDelta>
    where
        F: FnOnce(&ScopedOperations) -> SyncResult<PendingOperationDelta>,
    {
        let (delta, scope_operations) = {
            let mut operations = self.operations.write().await;
            let local = Self::scoped(&operations, scope);
            let delta = compute(&local)?;
            if delta.is_empty() {
                return Ok(delta);
            }

            for op in delta.changed() {
                operations.insert(op.key(), op.clone());
            }
            for key in &delta.removed {
                operations.remove(key);
            }

            debug!(
                "[{}] Store commit for {}: new={}, updated={}, removed={}, total={}",
                scope.chain_id,
                scope.multisig_account_id,
                delta.new.len(),
                delta.updated.len(),
                delta.removed.len(),
                operations.len()
            );

            // Snapshot writes stay under the write lock so they land in commit order
            if let Some(path) = &self.snapshot_path {
                let rows: Vec<PendingOperation> = operations.values().cloned().collect();
                if let Err(e) = write_snapshot(path, &rows).await {
                    warn!(
                        "Failed to persist pending operation snapshot to {}: {}",
                        path.display(),
                        e
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.store_persist_errors.inc();
                    }
                }
            }

            let scope_operations: Vec<PendingOperation> =
                Self::scoped(&operations, scope).into_values().collect();
            (delta, scope_operations)
        };

        self.notify(scope, &scope_operations).await;
        Ok(delta)
    }

    pub async fn subscribe(
        &self,
        scope: ScopeKey,
        observer: Arc<dyn PendingOperationObserver>,
    ) -> SubscriberId {
        let id = SubscriberId(self.next_subscriber_id.fetch_add(1, Ordering::Relaxed));
        self.observers
            .write()
            .await
            .insert(id, ObserverEntry { scope, observer });
        id
    }

    /// Returns false if the id was unknown
    pub async fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.observers.write().await.remove(&id).is_some()
    }

    async fn notify(&self, scope: &ScopeKey, operations: &[PendingOperation]) {
        let targets: Vec<Arc<dyn PendingOperationObserver>> = {
            let observers = self.observers.read().await;
            observers
                .values()
                .filter(|entry| entry.scope == *scope)
                .map(|entry| entry.observer.clone())
                .collect()
        };
        for observer in targets {
            observer.on_update(scope, operations);
        }
    }

    fn scoped(
        operations: &BTreeMap<PendingOperationKey, PendingOperation>,
        scope: &ScopeKey,
    ) -> ScopedOperations {
        operations
            .iter()
            .filter(|(key, _)| {
                key.chain_id == scope.chain_id
                    && key.multisig_account_id == scope.multisig_account_id
            })
            .map(|(key, op)| (key.clone(), op.clone()))
            .collect()
    }
}

fn delta_scopes(delta: &PendingOperationDelta) -> BTreeSet<ScopeKey> {
    delta
        .changed()
        .map(|op| op.scope_key())
        .chain(delta.removed.iter().map(|key| key.scope_key()))
        .collect()
}

async fn write_snapshot(path: &Path, rows: &[PendingOperation]) -> SyncResult<()> {
    let content = serde_json::to_vec_pretty(rows)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
