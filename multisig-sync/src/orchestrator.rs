// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per (chain, multisig account) coordinator
//!
//! `Stopped -> Syncing -> Watching -> Stopped`. `start` runs one
//! reconciliation pass, installs the definition subscription over the tracked
//! call hashes and starts the proposal event watcher. A failed start leaves
//! the orchestrator `Stopped`; retrying is up to the caller.

use crate::call_data_cache::CallDataCache;
use crate::client::{ChainRegistry, IndexerClient};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::event_watcher::{ProposalEventWatcher, ProposalSignal};
use crate::fetcher::{BlockTimeEstimator, OffchainCallDataFetcher, OnchainDefinitionFetcher};
use crate::metrics::SyncMetrics;
use crate::reconciliation::ReconciliationEngine;
use crate::store::PendingOperationStore;
use crate::subscription::{DefinitionSubscriptionManager, SubscriptionKind};
use crate::types::{CallHash, Chain, ChainId, MultisigAccount, ScopeKey};
use crate::utils::{Clock, SystemClock};
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared collaborators of every orchestrator of a service
#[derive(Clone)]
pub struct SyncDependencies {
    pub registry: Arc<dyn ChainRegistry>,
    pub indexer: Arc<dyn IndexerClient>,
    pub store: Arc<PendingOperationStore>,
    pub call_data_cache: Arc<CallDataCache>,
    pub clock: Arc<dyn Clock>,
    pub config: SyncConfig,
    pub metrics: Option<Arc<SyncMetrics>>,
}

impl SyncDependencies {
    pub fn new(
        registry: Arc<dyn ChainRegistry>,
        indexer: Arc<dyn IndexerClient>,
        store: Arc<PendingOperationStore>,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        config.validate()?;
        Ok(Self {
            registry,
            indexer,
            store,
            call_data_cache: Arc::new(CallDataCache::new(config.call_data_cache_ttl())),
            clock: Arc::new(SystemClock),
            config,
            metrics: None,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Stopped,
    Syncing,
    Watching,
}

/// Components resolved against the chain connection on each start
struct Pipeline {
    engine: ReconciliationEngine,
    subscriptions: Arc<DefinitionSubscriptionManager>,
    watcher: ProposalEventWatcher,
}

struct Lifecycle {
    state: OrchestratorState,
    cancel: Option<CancellationToken>,
    pipeline: Option<Arc<Pipeline>>,
}

pub struct ChainSyncOrchestrator {
    chain: Chain,
    multisig: MultisigAccount,
    scope: ScopeKey,
    deps: SyncDependencies,
    lifecycle: Mutex<Lifecycle>,
}

impl ChainSyncOrchestrator {
    pub fn new(chain: Chain, multisig: MultisigAccount, deps: SyncDependencies) -> Arc<Self> {
        let scope = ScopeKey::new(chain.chain_id.clone(), multisig.account_id);
        Arc::new(Self {
            chain,
            multisig,
            scope,
            deps,
            lifecycle: Mutex::new(Lifecycle {
                state: OrchestratorState::Stopped,
                cancel: None,
                pipeline: None,
            }),
        })
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn chain_id(&self) -> &ChainId {
        &self.chain.chain_id
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    pub async fn state(&self) -> OrchestratorState {
        self.lifecycle.lock().await.state
    }

    /// Call hashes covered by the live definition subscription
    pub async fn tracked_call_hashes(&self) -> BTreeSet<CallHash> {
        let pipeline = self.lifecycle.lock().await.pipeline.clone();
        match pipeline {
            Some(pipeline) => pipeline.subscriptions.tracked_call_hashes().await,
            None => Default::default(),
        }
    }

    /// No-op unless `Stopped`
    pub async fn start(self: &Arc<Self>) -> SyncResult<()> {
        let chain = self.chain.chain_id.clone();
        let (cancel, pipeline) = {
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.state != OrchestratorState::Stopped {
                debug!("[{}] Orchestrator already {:?}", chain, lifecycle.state);
                return Ok(());
            }
            let pipeline = match self.build_pipeline() {
                Ok(pipeline) => Arc::new(pipeline),
                Err(e) => {
                    error!("[{}] Cannot start multisig sync: {}", chain, e);
                    return Err(e);
                }
            };
            let cancel = CancellationToken::new();
            lifecycle.state = OrchestratorState::Syncing;
            lifecycle.cancel = Some(cancel.clone());
            lifecycle.pipeline = Some(pipeline.clone());
            (cancel, pipeline)
        };
        info!(
            "[{}] Starting multisig sync for {}",
            chain, self.multisig.account_id
        );

        let result = self.bring_up(&cancel, &pipeline).await;

        let mut lifecycle = self.lifecycle.lock().await;
        if cancel.is_cancelled() {
            // stopped while syncing
            pipeline.subscriptions.clear_subscription().await;
            return Err(SyncError::Cancelled);
        }
        match result {
            Ok(()) => {
                lifecycle.state = OrchestratorState::Watching;
                info!("[{}] Multisig sync watching {}", chain, self.multisig.account_id);
                Ok(())
            }
            Err(e) => {
                cancel.cancel();
                pipeline.subscriptions.clear_subscription().await;
                lifecycle.state = OrchestratorState::Stopped;
                lifecycle.cancel = None;
                lifecycle.pipeline = None;
                error!("[{}] Multisig sync start failed: {}", chain, e);
                Err(e)
            }
        }
    }

    /// Cancel the pass in flight, the subscription and the watcher. Idempotent.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(cancel) = lifecycle.cancel.take() {
            cancel.cancel();
        }
        if let Some(pipeline) = lifecycle.pipeline.take() {
            pipeline.subscriptions.clear_subscription().await;
        }
        if lifecycle.state != OrchestratorState::Stopped {
            info!(
                "[{}] Stopped multisig sync for {}",
                self.chain.chain_id, self.multisig.account_id
            );
        }
        lifecycle.state = OrchestratorState::Stopped;
    }

    /// Fast path for a proposal seen on the event stream. A known call hash
    /// only extends the subscription; an unknown one triggers a full pass.
    pub async fn handle_proposal(&self, call_hash: CallHash) -> SyncResult<()> {
        let (cancel, pipeline) = {
            let lifecycle = self.lifecycle.lock().await;
            match (&lifecycle.state, &lifecycle.cancel, &lifecycle.pipeline) {
                (OrchestratorState::Watching, Some(cancel), Some(pipeline)) => {
                    (cancel.clone(), pipeline.clone())
                }
                _ => return Ok(()),
            }
        };

        if self.deps.store.contains_call_hash(&self.scope, &call_hash).await {
            let added = pipeline
                .subscriptions
                .extend_subscription(call_hash, &cancel)
                .await?;
            debug!(
                "[{}] Proposal for known {}: subscription extended={}",
                self.chain.chain_id, call_hash, added
            );
            return Ok(());
        }

        debug!(
            "[{}] Proposal for unknown {}, running reconciliation",
            self.chain.chain_id, call_hash
        );
        let outcome = pipeline.engine.reconcile(&cancel).await?;
        let mut call_hashes = outcome.tracked_call_hashes;
        call_hashes.insert(call_hash);
        pipeline
            .subscriptions
            .setup_subscription(call_hashes, &cancel)
            .await
    }

    async fn bring_up(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        pipeline: &Pipeline,
    ) -> SyncResult<()> {
        let outcome = pipeline.engine.reconcile(cancel).await?;
        pipeline
            .subscriptions
            .setup_subscription(outcome.tracked_call_hashes, cancel)
            .await?;

        match pipeline.watcher.start(cancel.child_token()).await {
            Ok(signals) => self.spawn_proposal_loop(signals, cancel.clone()),
            Err(e) => warn!(
                "[{}] Event stream unavailable, relying on storage subscription only: {}",
                self.chain.chain_id, e
            ),
        }
        Ok(())
    }

    fn spawn_proposal_loop(
        self: &Arc<Self>,
        mut signals: mpsc::Receiver<ProposalSignal>,
        cancel: CancellationToken,
    ) {
        let orchestrator: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    _ = cancel.cancelled() => break,
                    signal = signals.recv() => match signal {
                        Some(signal) => signal,
                        None => break,
                    },
                };
                let Some(orchestrator) = orchestrator.upgrade() else {
                    break;
                };
                if let Err(e) = orchestrator.handle_proposal(signal.call_hash).await {
                    if e != SyncError::Cancelled {
                        warn!(
                            "[{}] Failed to handle proposal {}: {}",
                            orchestrator.chain.chain_id, signal.call_hash, e
                        );
                    }
                }
            }
        });
    }

    fn build_pipeline(&self) -> SyncResult<Pipeline> {
        let chain_id = self.chain.chain_id.clone();
        let deps = &self.deps;
        let connection = deps.registry.connection(&chain_id)?;
        let decoder = deps.registry.decoder(&chain_id)?;
        let timeout = deps.config.expiration_timeout();

        let mut onchain =
            OnchainDefinitionFetcher::new(chain_id.clone(), connection.clone(), decoder.clone());
        let mut offchain = OffchainCallDataFetcher::new(
            chain_id.clone(),
            self.chain.multisig_indexer_url.clone(),
            deps.indexer.clone(),
            deps.call_data_cache.clone(),
        );
        let block_time = BlockTimeEstimator::new(
            chain_id.clone(),
            connection.clone(),
            self.chain.block_time_ms,
            deps.config.default_block_time_ms,
        );
        let mut subscriptions = DefinitionSubscriptionManager::new(
            self.scope.clone(),
            self.multisig.clone(),
            SubscriptionKind::for_chain(&self.chain),
            connection.clone(),
            decoder.clone(),
            deps.store.clone(),
            deps.clock.clone(),
            timeout,
        );
        let mut watcher = ProposalEventWatcher::new(
            chain_id.clone(),
            self.multisig.account_id,
            connection,
            decoder,
            deps.config.event_channel_size,
        );

        if let Some(metrics) = &deps.metrics {
            onchain = onchain.with_metrics(metrics.clone());
            offchain = offchain.with_metrics(metrics.clone());
            subscriptions = subscriptions.with_metrics(metrics.clone());
            watcher = watcher.with_metrics(metrics.clone());
        }

        let mut engine = ReconciliationEngine::new(
            chain_id,
            self.multisig.clone(),
            onchain,
            offchain,
            block_time,
            deps.store.clone(),
            deps.clock.clone(),
        )
        .with_expiration_timeout(timeout);
        if let Some(metrics) = &deps.metrics {
            engine = engine.with_metrics(metrics.clone());
        }

        Ok(Pipeline {
            engine,
            subscriptions: Arc::new(subscriptions),
            watcher,
        })
    }
}

impl Drop for ChainSyncOrchestrator {
    fn drop(&mut self) {
        // spawned subscription and watcher tasks hang off this token
        if let Some(cancel) = self.lifecycle.get_mut().cancel.take() {
            cancel.cancel();
        }
    }
}
