// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Top level fan-out service
//!
//! Follows the selected wallet and the chain list, and keeps exactly one
//! `ChainSyncOrchestrator` per multisig-capable chain the wallet's multisig
//! lives on.

use crate::client::{ChainListStore, PendingOperationObserver, SubscriberId, WalletStore};
use crate::orchestrator::{ChainSyncOrchestrator, OrchestratorState, SyncDependencies};
use crate::types::{AccountId, Chain, ChainChange, ChainId, PendingOperation, ScopeKey, Wallet};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Orchestrator changes needed to go from `live` to `target`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutPlan {
    pub create: Vec<Chain>,
    pub remove: Vec<ChainId>,
    /// Live chains whose model changed
    pub restart: Vec<Chain>,
}

impl FanoutPlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.remove.is_empty() && self.restart.is_empty()
    }
}

pub fn plan_fanout(
    live: &BTreeMap<ChainId, Chain>,
    target: &BTreeMap<ChainId, Chain>,
) -> FanoutPlan {
    let mut plan = FanoutPlan::default();
    for (chain_id, chain) in target {
        match live.get(chain_id) {
            None => plan.create.push(chain.clone()),
            Some(current) if current != chain => plan.restart.push(chain.clone()),
            Some(_) => {}
        }
    }
    plan.remove = live
        .keys()
        .filter(|chain_id| !target.contains_key(*chain_id))
        .cloned()
        .collect();
    plan
}

/// Multisig-capable chains the wallet's multisig exists on
pub fn target_chains(
    wallet: Option<&Wallet>,
    chains: &BTreeMap<ChainId, Chain>,
) -> BTreeMap<ChainId, Chain> {
    let Some(multisig) = wallet.and_then(|w| w.multisig.as_ref()) else {
        return BTreeMap::new();
    };
    chains
        .iter()
        .filter(|(chain_id, chain)| chain.supports_multisig() && multisig.applies_to(chain_id))
        .map(|(chain_id, chain)| (chain_id.clone(), chain.clone()))
        .collect()
}

#[derive(Default)]
struct FanoutState {
    wallet: Option<Wallet>,
    chains: BTreeMap<ChainId, Chain>,
    orchestrators: BTreeMap<ChainId, Arc<ChainSyncOrchestrator>>,
    /// Initial start of each orchestrator, still running or finished
    starts: BTreeMap<ChainId, JoinHandle<()>>,
}

impl FanoutState {
    /// Abort the pending start (so it cannot revive the orchestrator), then stop it
    async fn retire(&mut self, chain_id: &ChainId) {
        if let Some(start) = self.starts.remove(chain_id) {
            start.abort();
            let _ = start.await;
        }
        if let Some(orchestrator) = self.orchestrators.remove(chain_id) {
            orchestrator.stop().await;
        }
    }

    async fn retire_all(&mut self) {
        for start in self.starts.values() {
            start.abort();
        }
        join_all(std::mem::take(&mut self.starts).into_values()).await;
        let orchestrators = std::mem::take(&mut self.orchestrators);
        join_all(orchestrators.values().map(|orchestrator| orchestrator.stop())).await;
    }
}

#[derive(Clone)]
struct Fanout {
    deps: SyncDependencies,
    state: Arc<Mutex<FanoutState>>,
}

impl Fanout {
    async fn on_wallet_changed(&self, wallet: Option<Wallet>) {
        let mut state = self.state.lock().await;
        if !same_multisig_identity(state.wallet.as_ref(), wallet.as_ref()) {
            if !state.orchestrators.is_empty() {
                info!(
                    "Selected wallet changed to {:?}, stopping {} orchestrators",
                    wallet.as_ref().map(|w| w.id.as_str()),
                    state.orchestrators.len()
                );
            }
            state.retire_all().await;
        }
        state.wallet = wallet;
        self.refresh(&mut state).await;
    }

    async fn on_chains_changed(&self, changes: Vec<ChainChange>) {
        let mut state = self.state.lock().await;
        for change in changes {
            match change {
                ChainChange::Insert(chain) | ChainChange::Update(chain) => {
                    state.chains.insert(chain.chain_id.clone(), chain);
                }
                ChainChange::Delete(chain_id) => {
                    state.chains.remove(&chain_id);
                }
            }
        }
        self.refresh(&mut state).await;
    }

    async fn refresh(&self, state: &mut FanoutState) {
        let target = target_chains(state.wallet.as_ref(), &state.chains);
        let live: BTreeMap<ChainId, Chain> = state
            .orchestrators
            .iter()
            .map(|(chain_id, orchestrator)| (chain_id.clone(), orchestrator.chain().clone()))
            .collect();
        let plan = plan_fanout(&live, &target);
        if plan.is_empty() {
            return;
        }

        for chain_id in plan.remove.iter().chain(plan.restart.iter().map(|c| &c.chain_id)) {
            state.retire(chain_id).await;
        }

        let multisig = state.wallet.as_ref().and_then(|w| w.multisig.clone());
        if let Some(multisig) = multisig {
            for chain in plan.create.iter().chain(plan.restart.iter()) {
                let orchestrator =
                    ChainSyncOrchestrator::new(chain.clone(), multisig.clone(), self.deps.clone());
                state
                    .orchestrators
                    .insert(chain.chain_id.clone(), orchestrator.clone());
                let start = tokio::spawn(async move {
                    if let Err(e) = orchestrator.start().await {
                        debug!(
                            "[{}] Initial sync failed, waiting for sync_up: {}",
                            orchestrator.chain_id(),
                            e
                        );
                    }
                });
                state.starts.insert(chain.chain_id.clone(), start);
            }
        }

        info!(
            "Multisig fan-out: created={}, restarted={}, removed={}, live={}",
            plan.create.len(),
            plan.restart.len(),
            plan.remove.len(),
            state.orchestrators.len()
        );
        if let Some(metrics) = &self.deps.metrics {
            metrics
                .live_orchestrators
                .set(state.orchestrators.len() as i64);
        }
    }

    async fn stop_all(&self) {
        let mut state = self.state.lock().await;
        state.retire_all().await;
        *state = FanoutState::default();
        if let Some(metrics) = &self.deps.metrics {
            metrics.live_orchestrators.set(0);
        }
    }

    async fn run(
        self,
        mut wallets: watch::Receiver<Option<Wallet>>,
        mut chains: mpsc::Receiver<Vec<ChainChange>>,
        cancel: CancellationToken,
    ) {
        let initial = wallets.borrow_and_update().clone();
        self.on_wallet_changed(initial).await;

        let mut wallets_open = true;
        let mut chains_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = wallets.changed(), if wallets_open => {
                    if changed.is_err() {
                        warn!("Wallet selection stream closed");
                        wallets_open = false;
                        continue;
                    }
                    let wallet = wallets.borrow_and_update().clone();
                    self.on_wallet_changed(wallet).await;
                }
                batch = chains.recv(), if chains_open => match batch {
                    Some(changes) => self.on_chains_changed(changes).await,
                    None => {
                        warn!("Chain list stream closed");
                        chains_open = false;
                    }
                },
            }
        }
        debug!("Multisig fan-out loop exited");
    }
}

/// Wallet switches keep running orchestrators only when the multisig they
/// were built for is unchanged
fn same_multisig_identity(current: Option<&Wallet>, next: Option<&Wallet>) -> bool {
    match (current, next) {
        (Some(current), Some(next)) => current.id == next.id && current.multisig == next.multisig,
        (None, None) => true,
        _ => false,
    }
}

pub struct MultisigSyncService {
    fanout: Fanout,
    wallet_store: Arc<dyn WalletStore>,
    chain_store: Arc<dyn ChainListStore>,
    running: std::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl MultisigSyncService {
    pub fn new(
        deps: SyncDependencies,
        wallet_store: Arc<dyn WalletStore>,
        chain_store: Arc<dyn ChainListStore>,
    ) -> Self {
        Self {
            fanout: Fanout {
                deps,
                state: Arc::new(Mutex::new(FanoutState::default())),
            },
            wallet_store,
            chain_store,
            running: std::sync::Mutex::new(None),
        }
    }

    /// Begin following the wallet and chain list. Idempotent.
    pub fn start(&self) {
        let Ok(mut running) = self.running.lock() else {
            warn!("Multisig sync service lock poisoned, not starting");
            return;
        };
        if running.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let wallets = self.wallet_store.observe_selected_wallet();
        let chains = self.chain_store.observe_chains();
        let handle = tokio::spawn(self.fanout.clone().run(wallets, chains, cancel.clone()));
        *running = Some((cancel, handle));
        info!("Multisig sync service started");
    }

    /// Stop the fan-out loop and every orchestrator. Idempotent.
    pub async fn stop(&self) {
        let running = match self.running.lock() {
            Ok(mut running) => running.take(),
            Err(_) => None,
        };
        let Some((cancel, handle)) = running else {
            return;
        };

        cancel.cancel();
        if let Err(e) = handle.await {
            warn!("Multisig fan-out task ended abnormally: {}", e);
        }
        self.fanout.stop_all().await;
        info!("Multisig sync service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|running| running.is_some())
            .unwrap_or(false)
    }

    /// Retry every orchestrator whose start failed. Returns how many are
    /// watching afterwards among the retried ones.
    pub async fn sync_up(&self) -> usize {
        // held across the retries so the fan-out cannot retire an orchestrator
        // that is about to be restarted
        let state = self.fanout.state.lock().await;
        let mut stopped = Vec::new();
        for orchestrator in state.orchestrators.values() {
            if orchestrator.state().await == OrchestratorState::Stopped {
                stopped.push(orchestrator.clone());
            }
        }
        if stopped.is_empty() {
            return 0;
        }

        info!("Retrying multisig sync on {} chains", stopped.len());
        let results = join_all(stopped.iter().map(|orchestrator| orchestrator.start())).await;
        results.iter().filter(|result| result.is_ok()).count()
    }

    pub async fn fetch_pending_operations(
        &self,
        multisig: &AccountId,
        chain_id: &ChainId,
    ) -> Vec<PendingOperation> {
        self.fanout
            .deps
            .store
            .fetch(&ScopeKey::new(chain_id.clone(), *multisig))
            .await
    }

    pub async fn subscribe(
        &self,
        scope: ScopeKey,
        observer: Arc<dyn PendingOperationObserver>,
    ) -> SubscriberId {
        self.fanout.deps.store.subscribe(scope, observer).await
    }

    pub async fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.fanout.deps.store.unsubscribe(id).await
    }

    pub async fn live_chains(&self) -> Vec<ChainId> {
        let state = self.fanout.state.lock().await;
        state.orchestrators.keys().cloned().collect()
    }

    pub async fn orchestrator(&self, chain_id: &ChainId) -> Option<Arc<ChainSyncOrchestrator>> {
        let state = self.fanout.state.lock().await;
        state.orchestrators.get(chain_id).cloned()
    }
}
