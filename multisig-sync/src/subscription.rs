// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Live storage subscription over the tracked call hashes of one scope
//!
//! At most one subscription is live per scope. A replacement is installed
//! first and the old one cancelled right after; deliveries from a replaced
//! subscription are dropped by generation.

use crate::client::{ChainConnection, RuntimeDecoder, StorageChangeSet};
use crate::error::{SyncError, SyncResult};
use crate::fetcher::onchain::decode_definition;
use crate::metrics::SyncMetrics;
use crate::store::{PendingOperationStore, ScopedOperations};
use crate::types::{
    CallHash, Chain, MultisigAccount, MultisigDefinition, PendingOperation, PendingOperationDelta,
    PendingOperationKey, ScopeKey, Timestamp,
};
use crate::utils::Clock;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How definition changes are observed on a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// `Multisigs` double map keyed by (multisig account, call hash)
    DoubleMapMultisig,
    None,
}

impl SubscriptionKind {
    pub fn for_chain(chain: &Chain) -> Self {
        if chain.supports_multisig() {
            SubscriptionKind::DoubleMapMultisig
        } else {
            SubscriptionKind::None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Subscribed,
}

struct ActiveSubscription {
    call_hashes: BTreeSet<CallHash>,
    cancel: CancellationToken,
}

pub struct DefinitionSubscriptionManager {
    scope: ScopeKey,
    multisig: MultisigAccount,
    kind: SubscriptionKind,
    connection: Arc<dyn ChainConnection>,
    decoder: Arc<dyn RuntimeDecoder>,
    store: Arc<PendingOperationStore>,
    clock: Arc<dyn Clock>,
    expiration_timeout: Duration,
    active: Mutex<Option<ActiveSubscription>>,
    generation: AtomicU64,
    metrics: Option<Arc<SyncMetrics>>,
}

impl DefinitionSubscriptionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scope: ScopeKey,
        multisig: MultisigAccount,
        kind: SubscriptionKind,
        connection: Arc<dyn ChainConnection>,
        decoder: Arc<dyn RuntimeDecoder>,
        store: Arc<PendingOperationStore>,
        clock: Arc<dyn Clock>,
        expiration_timeout: Duration,
    ) -> Self {
        Self {
            scope,
            multisig,
            kind,
            connection,
            decoder,
            store,
            clock,
            expiration_timeout,
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    pub async fn state(&self) -> SubscriptionState {
        match *self.active.lock().await {
            Some(_) => SubscriptionState::Subscribed,
            None => SubscriptionState::Idle,
        }
    }

    pub async fn tracked_call_hashes(&self) -> BTreeSet<CallHash> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| active.call_hashes.clone())
            .unwrap_or_default()
    }

    /// Replace the live subscription with one covering exactly `call_hashes`.
    /// An empty set leaves the scope without a subscription.
    pub async fn setup_subscription(
        self: &Arc<Self>,
        call_hashes: BTreeSet<CallHash>,
        parent: &CancellationToken,
    ) -> SyncResult<()> {
        let chain = &self.scope.chain_id;
        if self.kind == SubscriptionKind::None {
            debug!("[{}] Chain has no multisig storage, not subscribing", chain);
            return Ok(());
        }

        let mut active = self.active.lock().await;
        if call_hashes.is_empty() {
            self.cancel_active(&mut active);
            debug!(
                "[{}] No call hashes to watch for {}",
                chain, self.multisig.account_id
            );
            return Ok(());
        }

        let hashes: Vec<CallHash> = call_hashes.iter().copied().collect();
        let subscribe = self
            .connection
            .subscribe_multisig_entries(&self.multisig.account_id, &hashes);
        let receiver = tokio::select! {
            _ = parent.cancelled() => return Err(SyncError::Cancelled),
            receiver = subscribe => receiver?,
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = parent.child_token();
        if let Some(previous) = active.replace(ActiveSubscription {
            call_hashes,
            cancel: cancel.clone(),
        }) {
            previous.cancel.cancel();
        }
        self.set_active_gauge(hashes.len());
        info!(
            "[{}] Subscribed to {} call hashes of {} (generation {})",
            chain,
            hashes.len(),
            self.multisig.account_id,
            generation
        );

        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_subscription(receiver, cancel, generation).await;
        });
        Ok(())
    }

    /// Add one call hash to the live set. Returns false if it was already tracked.
    pub async fn extend_subscription(
        self: &Arc<Self>,
        call_hash: CallHash,
        parent: &CancellationToken,
    ) -> SyncResult<bool> {
        let mut call_hashes = self.tracked_call_hashes().await;
        if !call_hashes.insert(call_hash) {
            return Ok(false);
        }
        self.setup_subscription(call_hashes, parent).await?;
        Ok(true)
    }

    /// Idempotent
    pub async fn clear_subscription(&self) {
        let mut active = self.active.lock().await;
        if active.is_some() {
            self.cancel_active(&mut active);
            debug!(
                "[{}] Cleared definition subscription of {}",
                self.scope.chain_id, self.multisig.account_id
            );
        }
    }

    fn cancel_active(&self, active: &mut Option<ActiveSubscription>) {
        if let Some(previous) = active.take() {
            self.generation.fetch_add(1, Ordering::SeqCst);
            previous.cancel.cancel();
        }
        self.set_active_gauge(0);
    }

    async fn run_subscription(
        self: Arc<Self>,
        mut receiver: tokio::sync::mpsc::Receiver<StorageChangeSet>,
        cancel: CancellationToken,
        generation: u64,
    ) {
        loop {
            let changes = tokio::select! {
                _ = cancel.cancelled() => break,
                changes = receiver.recv() => match changes {
                    Some(changes) => changes,
                    None => {
                        warn!(
                            "[{}] Definition subscription of {} closed by the connection",
                            self.scope.chain_id, self.multisig.account_id
                        );
                        break;
                    }
                },
            };
            if self.generation.load(Ordering::SeqCst) != generation {
                break;
            }

            match self.apply_storage_change(changes).await {
                Ok(delta) => {
                    if delta.updated.iter().any(|op| op.definition.is_none()) {
                        self.schedule_expiry_sweep(cancel.clone());
                    }
                }
                Err(e) => warn!(
                    "[{}] Failed to apply definition update for {}: {}",
                    self.scope.chain_id, self.multisig.account_id, e
                ),
            }
        }
        debug!(
            "[{}] Definition subscription task {} exited",
            self.scope.chain_id, generation
        );
    }

    /// Remove pending-discard records once their grace window has passed,
    /// unless the subscription is torn down first.
    fn schedule_expiry_sweep(self: &Arc<Self>, cancel: CancellationToken) {
        let manager = self.clone();
        let delay = self.expiration_timeout + Duration::from_secs(1);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = manager.expire_stale().await {
                        warn!("[{}] Expiry sweep failed: {}", manager.scope.chain_id, e);
                    }
                }
            }
        });
    }

    /// Apply one storage notification to the store.
    ///
    /// Undecodable values are skipped; the rest of the batch is applied.
    pub async fn apply_storage_change(
        &self,
        changes: StorageChangeSet,
    ) -> SyncResult<PendingOperationDelta> {
        let chain = self.scope.chain_id.as_str();
        let mut updates: BTreeMap<CallHash, Option<MultisigDefinition>> = BTreeMap::new();
        for (call_hash, value) in changes.changes {
            let definition = match value {
                None => None,
                Some(bytes) => {
                    let threshold = self.multisig.threshold;
                    match decode_definition(self.decoder.as_ref(), &bytes, threshold) {
                        Ok(definition) => Some(definition),
                        Err(e) => {
                            warn!(
                                "[{}] Skipping undecodable definition update for {}: {}",
                                chain, call_hash, e
                            );
                            if let Some(metrics) = &self.metrics {
                                metrics
                                    .decode_errors
                                    .with_label_values(&[chain, "storage"])
                                    .inc();
                            }
                            continue;
                        }
                    }
                }
            };
            updates.insert(call_hash, definition);
        }
        if updates.is_empty() {
            return Ok(PendingOperationDelta::default());
        }

        let now = self.clock.now_ms();
        let timeout = self.expiration_timeout;
        let delta = self
            .store
            .commit_with(&self.scope, |local| {
                Ok(storage_change_delta(
                    &self.scope,
                    &self.multisig,
                    &updates,
                    local,
                    now,
                    timeout,
                ))
            })
            .await?;

        if let Some(metrics) = &self.metrics {
            let cleared = delta.updated.iter().filter(|op| op.definition.is_none()).count();
            for (kind, count) in [
                ("synthesized", delta.new.len()),
                ("definition", delta.updated.len() - cleared),
                ("cleared", cleared),
                ("removed", delta.removed.len()),
            ] {
                metrics
                    .subscription_updates
                    .with_label_values(&[chain, kind])
                    .inc_by(count as u64);
            }
        }
        Ok(delta)
    }

    /// Drop every definition-less record of the scope whose grace window elapsed
    pub async fn expire_stale(&self) -> SyncResult<PendingOperationDelta> {
        let now = self.clock.now_ms();
        let timeout = self.expiration_timeout;
        self.store
            .commit_with(&self.scope, |local| {
                Ok(PendingOperationDelta {
                    removed: local
                        .values()
                        .filter(|op| {
                            op.definition.is_none()
                                && !op.is_discovered_but_pending_onchain(now, timeout)
                        })
                        .map(PendingOperation::key)
                        .collect(),
                    ..Default::default()
                })
            })
            .await
    }

    fn set_active_gauge(&self, count: usize) {
        if let Some(metrics) = &self.metrics {
            metrics
                .active_subscriptions
                .with_label_values(&[self.scope.chain_id.as_str()])
                .set(count as i64);
        }
    }
}

/// Delta for a batch of definition updates.
///
/// A definition for an unknown call hash synthesizes a record without call
/// data. A removal clears the definition of a known record and starts its
/// grace window; a record already without definition is removed once expired.
pub fn storage_change_delta(
    scope: &ScopeKey,
    multisig: &MultisigAccount,
    updates: &BTreeMap<CallHash, Option<MultisigDefinition>>,
    local: &ScopedOperations,
    now: Timestamp,
    expiration_timeout: Duration,
) -> PendingOperationDelta {
    let mut delta = PendingOperationDelta::default();

    for (call_hash, definition) in updates {
        let key = PendingOperationKey {
            chain_id: scope.chain_id.clone(),
            multisig_account_id: scope.multisig_account_id,
            signatory_account_id: multisig.signatory,
            call_hash: *call_hash,
        };

        match (local.get(&key), definition) {
            (Some(existing), Some(definition)) => {
                if existing.definition.as_ref() != Some(definition) {
                    delta
                        .updated
                        .push(existing.clone().replacing_definition(Some(definition.clone())));
                }
            }
            (None, Some(definition)) => delta.new.push(PendingOperation {
                call_hash: *call_hash,
                chain_id: scope.chain_id.clone(),
                multisig_account_id: scope.multisig_account_id,
                signatory_account_id: multisig.signatory,
                call: None,
                definition: Some(definition.clone()),
                timestamp: now,
                cleared_at: None,
            }),
            (Some(existing), None) => {
                if existing.definition.is_some() {
                    delta.updated.push(existing.clone().clearing_definition(now));
                } else if !existing.is_discovered_but_pending_onchain(now, expiration_timeout) {
                    delta.removed.push(key);
                }
            }
            (None, None) => {}
        }
    }

    delta
}
