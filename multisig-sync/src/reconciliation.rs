// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Reconciliation of remote multisig state against the local store
//!
//! One pass fetches the on-chain definitions of a multisig account, enriches
//! them with indexer call data and timestamps, and commits the difference to
//! the `PendingOperationStore` as a single transaction.

use crate::error::{SyncError, SyncResult};
use crate::fetcher::{
    BlockTimeEstimator, BlockTimeSnapshot, OffchainCallDataFetcher, OnchainDefinitionFetcher,
};
use crate::metrics::SyncMetrics;
use crate::store::{PendingOperationStore, ScopedOperations};
use crate::types::{
    AccountId, CallHash, CallRecord, ChainId, MultisigAccount, MultisigDefinition, PendingOperation,
    PendingOperationDelta, PendingOperationKey, ScopeKey, Timestamp,
};
use crate::utils::Clock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_EXPIRATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of a committed pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationOutcome {
    pub delta: PendingOperationDelta,
    /// Every call hash currently recorded on-chain for the scope
    pub tracked_call_hashes: BTreeSet<CallHash>,
}

impl ReconciliationOutcome {
    /// `new ∪ updated`, the hashes the UI has to refresh
    pub fn changed_call_hashes(&self) -> BTreeSet<CallHash> {
        self.delta.changed_call_hashes()
    }
}

pub struct ReconciliationEngine {
    scope: ScopeKey,
    multisig: MultisigAccount,
    onchain: OnchainDefinitionFetcher,
    offchain: OffchainCallDataFetcher,
    block_time: BlockTimeEstimator,
    store: Arc<PendingOperationStore>,
    clock: Arc<dyn Clock>,
    expiration_timeout: Duration,
    /// Serializes passes of this scope
    pass_lock: tokio::sync::Mutex<()>,
    /// Token of the latest pass; a new pass cancels it
    current_pass: Mutex<Option<CancellationToken>>,
    metrics: Option<Arc<SyncMetrics>>,
}

impl ReconciliationEngine {
    pub fn new(
        chain_id: ChainId,
        multisig: MultisigAccount,
        onchain: OnchainDefinitionFetcher,
        offchain: OffchainCallDataFetcher,
        block_time: BlockTimeEstimator,
        store: Arc<PendingOperationStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            scope: ScopeKey::new(chain_id, multisig.account_id),
            multisig,
            onchain,
            offchain,
            block_time,
            store,
            clock,
            expiration_timeout: DEFAULT_EXPIRATION_TIMEOUT,
            pass_lock: tokio::sync::Mutex::new(()),
            current_pass: Mutex::new(None),
            metrics: None,
        }
    }

    pub fn with_expiration_timeout(mut self, timeout: Duration) -> Self {
        self.expiration_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    /// Run one pass. A pass started later supersedes this one: it is
    /// cancelled and its result is never committed.
    pub async fn reconcile(&self, cancel: &CancellationToken) -> SyncResult<ReconciliationOutcome> {
        let pass = cancel.child_token();
        if let Ok(mut current) = self.current_pass.lock() {
            if let Some(previous) = current.replace(pass.clone()) {
                previous.cancel();
            }
        }

        let _guard = tokio::select! {
            _ = pass.cancelled() => return Err(SyncError::Cancelled),
            guard = self.pass_lock.lock() => guard,
        };

        let started = Instant::now();
        let result = self.run_pass(&pass).await;
        self.record_pass(&result, started);
        result
    }

    async fn run_pass(&self, cancel: &CancellationToken) -> SyncResult<ReconciliationOutcome> {
        let chain = &self.scope.chain_id;

        let definitions = cancellable(cancel, self.onchain.fetch(&self.multisig)).await?;
        let call_hashes: HashSet<CallHash> = definitions.keys().copied().collect();
        let records =
            cancellable(cancel, async { Ok(self.offchain.fetch(&call_hashes).await) }).await?;

        let now = self.clock.now_ms();
        let needs_estimate = definitions
            .keys()
            .any(|call_hash| records.get(call_hash).and_then(|r| r.timestamp).is_none());
        let block_time = if needs_estimate {
            match cancellable(cancel, self.block_time.snapshot(now)).await {
                Ok(snapshot) => Some(snapshot),
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(e) => {
                    warn!(
                        "[{}] Block number unavailable, undated operations use now: {}",
                        chain, e
                    );
                    None
                }
            }
        } else {
            None
        };

        let remote = build_remote_set(
            &self.scope,
            &self.multisig,
            definitions,
            &records,
            block_time,
            now,
        );
        let tracked_call_hashes: BTreeSet<CallHash> =
            remote.keys().map(|key| key.call_hash).collect();

        let timeout = self.expiration_timeout;
        let signatory = self.multisig.signatory;
        let delta = self
            .store
            .commit_with(&self.scope, |local| {
                if cancel.is_cancelled() {
                    return Err(SyncError::Cancelled);
                }
                Ok(compute_delta(&remote, local, &signatory, now, timeout))
            })
            .await?;

        if delta.is_empty() {
            debug!(
                "[{}] Reconciled {}: no changes, tracking {} call hashes",
                chain,
                self.multisig.account_id,
                tracked_call_hashes.len()
            );
        } else {
            info!(
                "[{}] Reconciled {}: new={}, updated={}, removed={}, tracking {} call hashes",
                chain,
                self.multisig.account_id,
                delta.new.len(),
                delta.updated.len(),
                delta.removed.len(),
                tracked_call_hashes.len()
            );
        }

        if let Some(metrics) = &self.metrics {
            let label = chain.as_str();
            for (kind, count) in [
                ("new", delta.new.len()),
                ("updated", delta.updated.len()),
                ("removed", delta.removed.len()),
            ] {
                metrics
                    .reconciliation_delta
                    .with_label_values(&[label, kind])
                    .inc_by(count as u64);
            }
            let total = self.store.fetch(&self.scope).await.len();
            metrics
                .pending_operations
                .with_label_values(&[label])
                .set(total as i64);
        }

        Ok(ReconciliationOutcome {
            delta,
            tracked_call_hashes,
        })
    }

    fn record_pass(&self, result: &SyncResult<ReconciliationOutcome>, started: Instant) {
        let chain = self.scope.chain_id.as_str();
        let label = match result {
            Ok(_) => "ok",
            Err(SyncError::Cancelled) => {
                debug!("[{}] Reconciliation pass superseded or cancelled", chain);
                "cancelled"
            }
            Err(e) => {
                error!(
                    "[{}] Reconciliation pass for {} failed, local state kept: {}",
                    chain, self.multisig.account_id, e
                );
                e.error_type()
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics
                .reconciliation_passes
                .with_label_values(&[chain, label])
                .inc();
            metrics
                .reconciliation_latency
                .with_label_values(&[chain])
                .observe(started.elapsed().as_secs_f64());
        }
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = SyncResult<T>>,
) -> SyncResult<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        result = fut => result,
    }
}

/// Where the timestamp of a remote operation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampSource {
    Indexer,
    BlockEstimate,
    LocalClock,
}

/// One on-chain operation of a pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOperation {
    pub operation: PendingOperation,
    pub timestamp_source: TimestampSource,
}

pub type RemoteOperations = BTreeMap<PendingOperationKey, RemoteOperation>;

/// One operation per on-chain call hash, with call data and the best known
/// timestamp: indexer first, then block-time estimation, then `now`.
pub fn build_remote_set(
    scope: &ScopeKey,
    multisig: &MultisigAccount,
    definitions: BTreeMap<CallHash, MultisigDefinition>,
    records: &HashMap<CallHash, CallRecord>,
    block_time: Option<BlockTimeSnapshot>,
    now: Timestamp,
) -> RemoteOperations {
    definitions
        .into_iter()
        .map(|(call_hash, definition)| {
            let record = records.get(&call_hash);
            let indexed = record.and_then(|r| r.timestamp);
            let (timestamp, timestamp_source) = match (indexed, block_time) {
                (Some(timestamp), _) => (timestamp, TimestampSource::Indexer),
                (None, Some(block_time)) => (
                    block_time.estimate(definition.timepoint.height),
                    TimestampSource::BlockEstimate,
                ),
                (None, None) => (now, TimestampSource::LocalClock),
            };
            let operation = PendingOperation {
                call_hash,
                chain_id: scope.chain_id.clone(),
                multisig_account_id: scope.multisig_account_id,
                signatory_account_id: multisig.signatory,
                call: record.and_then(|r| r.call.clone()),
                definition: Some(definition),
                timestamp,
                cleared_at: None,
            };
            (
                operation.key(),
                RemoteOperation {
                    operation,
                    timestamp_source,
                },
            )
        })
        .collect()
}

/// Pure diff of a remote snapshot against the local records of one scope.
///
/// - `new`: remote keys missing locally.
/// - `updated`: shared keys whose definition, call or timestamp changed. The
///   local call is kept unless it is missing. An indexer timestamp replaces
///   the local one; estimates never override an existing record.
/// - a local record of `signatory` missing remotely that still has a
///   definition loses it and starts its grace window at `now`.
/// - a local record of `signatory` without a definition is removed once its
///   grace window has elapsed and left untouched before that.
/// - records of any other signatory of the scope are removed.
pub fn compute_delta(
    remote: &RemoteOperations,
    local: &ScopedOperations,
    signatory: &AccountId,
    now: Timestamp,
    expiration_timeout: Duration,
) -> PendingOperationDelta {
    let mut delta = PendingOperationDelta::default();

    for (key, entry) in remote {
        let remote_op = &entry.operation;
        let Some(local_op) = local.get(key) else {
            delta.new.push(remote_op.clone());
            continue;
        };

        let mut merged = local_op.clone().replacing_definition(remote_op.definition.clone());
        if merged.call.is_none() {
            merged.call = remote_op.call.clone();
        }
        if entry.timestamp_source == TimestampSource::Indexer {
            merged.timestamp = remote_op.timestamp;
        }
        if merged != *local_op {
            delta.updated.push(merged);
        }
    }

    for (key, local_op) in local {
        if remote.contains_key(key) {
            continue;
        }
        if key.signatory_account_id != *signatory {
            delta.removed.push(key.clone());
        } else if local_op.definition.is_some() {
            delta.updated.push(local_op.clone().clearing_definition(now));
        } else if !local_op.is_discovered_but_pending_onchain(now, expiration_timeout) {
            delta.removed.push(key.clone());
        }
    }

    delta
}
