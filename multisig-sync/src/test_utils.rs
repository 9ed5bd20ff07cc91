// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory collaborators and fixtures for tests

use crate::call_data_cache::CallDataCache;
use crate::client::{
    ChainConnection, ChainListStore, ChainRegistry, EventBatch, IndexerClient,
    PendingOperationObserver, RuntimeDecoder, StorageChangeSet, StorageEntry, WalletStore,
};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::orchestrator::SyncDependencies;
use crate::store::PendingOperationStore;
use crate::types::{
    AccountId, BlockNumber, CallHash, CallRecord, Chain, ChainChange, ChainId, MultisigAccount,
    MultisigDefinition, MultisigEvent, MultisigEventKind, OnchainMultisig, PendingOperation,
    ScopeKey, Timepoint, Timestamp, Wallet,
};
use crate::utils::Clock;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub const TEST_NOW: Timestamp = 1_700_000_000_000;

/// Encoded event the mock decoder treats as belonging to another pallet
pub const FOREIGN_EVENT: &[u8] = b"foreign";

pub fn init_for_testing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn account(n: u8) -> AccountId {
    AccountId::new([n; 32])
}

pub fn hash(n: u8) -> CallHash {
    CallHash::new([n; 32])
}

pub fn scope(chain_id: &str, multisig: u8) -> ScopeKey {
    ScopeKey::new(ChainId::new(chain_id), account(multisig))
}

/// Call payload and its real hash
pub fn sample_call(n: u8) -> (Vec<u8>, CallHash) {
    let call = vec![0x05, 0x03, n, n.wrapping_add(1)];
    let call_hash = CallHash::of_call(&call);
    (call, call_hash)
}

/// 2-of-3 multisig whose signatory is `account(0xff)`
pub fn multisig_account(n: u8, chain_id: Option<&str>) -> MultisigAccount {
    MultisigAccount {
        account_id: account(n),
        signatory: account(0xff),
        other_signatories: vec![account(0xfe), account(0xfd)],
        threshold: 2,
        chain: chain_id.map(ChainId::new),
    }
}

pub fn operation(
    scope: &ScopeKey,
    call_hash: CallHash,
    timestamp: Timestamp,
    definition: Option<MultisigDefinition>,
) -> PendingOperation {
    PendingOperation {
        call_hash,
        chain_id: scope.chain_id.clone(),
        multisig_account_id: scope.multisig_account_id,
        signatory_account_id: account(0xff),
        call: None,
        definition,
        timestamp,
        cleared_at: None,
    }
}

pub fn onchain_multisig(height: BlockNumber, approvals: &[u8]) -> OnchainMultisig {
    OnchainMultisig {
        timepoint: Timepoint::new(height, 1),
        deposit: 1_000_000,
        depositor: account(approvals.first().copied().unwrap_or(0xff)),
        approvals: approvals.iter().copied().map(account).collect(),
    }
}

/// Definition as produced for `multisig_account`
pub fn definition(height: BlockNumber, approvals: &[u8]) -> MultisigDefinition {
    onchain_multisig(height, approvals).into_definition(2)
}

pub fn encode_definition(multisig: &OnchainMultisig) -> Vec<u8> {
    serde_json::to_vec(multisig).unwrap()
}

pub fn encode_event(event: &MultisigEvent) -> Vec<u8> {
    serde_json::to_vec(event).unwrap()
}

pub fn proposal_event(
    kind: MultisigEventKind,
    multisig: AccountId,
    call_hash: CallHash,
) -> MultisigEvent {
    MultisigEvent {
        kind,
        multisig,
        approving: account(0xff),
        call_hash,
        timepoint: None,
    }
}

pub fn chain(chain_id: &str, multisig_supported: bool, indexer: Option<&str>) -> Chain {
    Chain {
        chain_id: ChainId::new(chain_id),
        name: chain_id.to_uppercase(),
        multisig_supported,
        multisig_indexer_url: indexer.map(str::to_string),
        block_time_ms: Some(6_000),
    }
}

pub fn plain_wallet(id: &str) -> Wallet {
    Wallet {
        id: id.to_string(),
        name: id.to_string(),
        multisig: None,
    }
}

pub fn multisig_wallet(id: &str, multisig: MultisigAccount) -> Wallet {
    Wallet {
        id: id.to_string(),
        name: id.to_string(),
        multisig: Some(multisig),
    }
}

pub fn test_dependencies(registry: Arc<MockChainRegistry>) -> SyncDependencies {
    SyncDependencies::new(
        registry,
        Arc::new(MockIndexerClient::default()),
        Arc::new(PendingOperationStore::in_memory()),
        SyncConfig::default(),
    )
    .unwrap()
    .with_clock(Arc::new(ManualClock::new(TEST_NOW)))
}

/// Poll `predicate` every 10ms until it holds or `timeout` elapses
pub async fn wait_until<F, Fut>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Mock chain: multisig storage entries, subscriptions, and the event stream
pub struct MockChainConnection {
    entries: Mutex<BTreeMap<CallHash, Vec<u8>>>,
    fetch_error: Mutex<Option<SyncError>>,
    fetch_delay: Mutex<Duration>,
    fetch_count: AtomicUsize,
    block_number: AtomicU64,
    block_time: Mutex<Option<u64>>,
    block_number_fails: AtomicBool,
    storage_subscription_fails: AtomicBool,
    event_subscription_fails: AtomicBool,
    storage_subscribers: Mutex<Vec<(BTreeSet<CallHash>, mpsc::Sender<StorageChangeSet>)>>,
    event_subscribers: Mutex<Vec<mpsc::Sender<EventBatch>>>,
    subscription_history: Mutex<Vec<BTreeSet<CallHash>>>,
}

impl Default for MockChainConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChainConnection {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            fetch_error: Mutex::new(None),
            fetch_delay: Mutex::new(Duration::ZERO),
            fetch_count: AtomicUsize::new(0),
            block_number: AtomicU64::new(1_000),
            block_time: Mutex::new(None),
            block_number_fails: AtomicBool::new(false),
            storage_subscription_fails: AtomicBool::new(false),
            event_subscription_fails: AtomicBool::new(false),
            storage_subscribers: Mutex::new(Vec::new()),
            event_subscribers: Mutex::new(Vec::new()),
            subscription_history: Mutex::new(Vec::new()),
        }
    }

    pub fn set_entry(&self, call_hash: CallHash, value: Vec<u8>) {
        self.entries.lock().unwrap().insert(call_hash, value);
    }

    pub fn remove_entry(&self, call_hash: &CallHash) {
        self.entries.lock().unwrap().remove(call_hash);
    }

    pub fn fail_fetch(&self, error: Option<SyncError>) {
        *self.fetch_error.lock().unwrap() = error;
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = delay;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    pub fn set_block_number(&self, block_number: BlockNumber) {
        self.block_number.store(block_number, Ordering::SeqCst);
    }

    pub fn set_block_time(&self, block_time_ms: Option<u64>) {
        *self.block_time.lock().unwrap() = block_time_ms;
    }

    pub fn fail_block_number(&self, fail: bool) {
        self.block_number_fails.store(fail, Ordering::SeqCst);
    }

    pub fn fail_storage_subscription(&self, fail: bool) {
        self.storage_subscription_fails.store(fail, Ordering::SeqCst);
    }

    pub fn fail_event_subscription(&self, fail: bool) {
        self.event_subscription_fails.store(fail, Ordering::SeqCst);
    }

    /// Deliver to every live subscription covering at least one changed hash,
    /// restricted to the hashes it covers. Returns the number of deliveries.
    pub fn push_storage_change(&self, changes: StorageChangeSet) -> usize {
        let subscribers = self.storage_subscribers.lock().unwrap();
        let mut delivered = 0;
        for (call_hashes, tx) in subscribers.iter() {
            let covered: Vec<_> = changes
                .changes
                .iter()
                .filter(|(call_hash, _)| call_hashes.contains(call_hash))
                .cloned()
                .collect();
            if covered.is_empty() {
                continue;
            }
            if tx.try_send(StorageChangeSet { changes: covered }).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn push_events(&self, batch: EventBatch) -> usize {
        let subscribers = self.event_subscribers.lock().unwrap();
        subscribers
            .iter()
            .filter(|tx| tx.try_send(batch.clone()).is_ok())
            .count()
    }

    /// Call hash sets of every storage subscription ever installed
    pub fn subscription_history(&self) -> Vec<BTreeSet<CallHash>> {
        self.subscription_history.lock().unwrap().clone()
    }

    pub fn live_storage_subscriptions(&self) -> usize {
        self.storage_subscribers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .count()
    }

    pub fn live_event_subscriptions(&self) -> usize {
        self.event_subscribers
            .lock()
            .unwrap()
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

#[async_trait]
impl ChainConnection for MockChainConnection {
    async fn fetch_multisig_entries(&self, _multisig: &AccountId) -> SyncResult<Vec<StorageEntry>> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.fetch_error.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|(call_hash, value)| StorageEntry {
                call_hash: *call_hash,
                value: value.clone(),
            })
            .collect())
    }

    async fn subscribe_multisig_entries(
        &self,
        _multisig: &AccountId,
        call_hashes: &[CallHash],
    ) -> SyncResult<mpsc::Receiver<StorageChangeSet>> {
        if self.storage_subscription_fails.load(Ordering::SeqCst) {
            return Err(SyncError::Rpc("storage subscription refused".into()));
        }
        let call_hashes: BTreeSet<CallHash> = call_hashes.iter().copied().collect();
        let (tx, rx) = mpsc::channel(64);
        self.subscription_history
            .lock()
            .unwrap()
            .push(call_hashes.clone());
        self.storage_subscribers
            .lock()
            .unwrap()
            .push((call_hashes, tx));
        Ok(rx)
    }

    async fn subscribe_events(&self) -> SyncResult<mpsc::Receiver<EventBatch>> {
        if self.event_subscription_fails.load(Ordering::SeqCst) {
            return Err(SyncError::Rpc("event subscription refused".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        self.event_subscribers.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn current_block_number(&self) -> SyncResult<BlockNumber> {
        if self.block_number_fails.load(Ordering::SeqCst) {
            return Err(SyncError::Rpc("chain_getHeader failed".into()));
        }
        Ok(self.block_number.load(Ordering::SeqCst))
    }

    async fn expected_block_time_ms(&self) -> SyncResult<Option<u64>> {
        Ok(*self.block_time.lock().unwrap())
    }
}

/// Decodes JSON-encoded pallet records and events
#[derive(Default)]
pub struct MockDecoder;

impl RuntimeDecoder for MockDecoder {
    fn decode_definition(&self, value: &[u8]) -> SyncResult<OnchainMultisig> {
        serde_json::from_slice(value).map_err(|e| SyncError::Decode(e.to_string()))
    }

    fn decode_event(&self, event: &[u8]) -> SyncResult<Option<MultisigEvent>> {
        if event == FOREIGN_EVENT {
            return Ok(None);
        }
        serde_json::from_slice(event)
            .map(Some)
            .map_err(|e| SyncError::Decode(e.to_string()))
    }
}

#[derive(Default)]
pub struct MockChainRegistry {
    connections: Mutex<HashMap<ChainId, Arc<MockChainConnection>>>,
    missing_runtimes: Mutex<HashSet<ChainId>>,
}

impl MockChainRegistry {
    pub fn add_chain(&self, chain_id: &str) -> Arc<MockChainConnection> {
        let connection = Arc::new(MockChainConnection::new());
        self.connections
            .lock()
            .unwrap()
            .insert(ChainId::new(chain_id), connection.clone());
        connection
    }

    pub fn connection_for(&self, chain_id: &str) -> Option<Arc<MockChainConnection>> {
        self.connections
            .lock()
            .unwrap()
            .get(&ChainId::new(chain_id))
            .cloned()
    }

    pub fn remove_runtime(&self, chain_id: &str) {
        self.missing_runtimes
            .lock()
            .unwrap()
            .insert(ChainId::new(chain_id));
    }
}

impl ChainRegistry for MockChainRegistry {
    fn connection(&self, chain_id: &ChainId) -> SyncResult<Arc<dyn ChainConnection>> {
        self.connections
            .lock()
            .unwrap()
            .get(chain_id)
            .cloned()
            .map(|connection| connection as Arc<dyn ChainConnection>)
            .ok_or_else(|| SyncError::NoConnection(chain_id.clone()))
    }

    fn decoder(&self, chain_id: &ChainId) -> SyncResult<Arc<dyn RuntimeDecoder>> {
        if self.missing_runtimes.lock().unwrap().contains(chain_id) {
            return Err(SyncError::NoRuntime(chain_id.clone()));
        }
        Ok(Arc::new(MockDecoder))
    }
}

pub struct MockIndexerClient {
    records: Mutex<HashMap<CallHash, CallRecord>>,
    available: AtomicBool,
    requests: Mutex<Vec<(ChainId, String, HashSet<CallHash>)>>,
}

impl Default for MockIndexerClient {
    fn default() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl MockIndexerClient {
    pub fn set_record(
        &self,
        call_hash: CallHash,
        call: Option<Vec<u8>>,
        timestamp: Option<Timestamp>,
    ) {
        self.records
            .lock()
            .unwrap()
            .insert(call_hash, CallRecord { call, timestamp });
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl IndexerClient for MockIndexerClient {
    async fn fetch_call_data(
        &self,
        chain_id: &ChainId,
        endpoint: &str,
        call_hashes: &HashSet<CallHash>,
    ) -> anyhow::Result<HashMap<CallHash, CallRecord>> {
        self.requests
            .lock()
            .unwrap()
            .push((chain_id.clone(), endpoint.to_string(), call_hashes.clone()));
        if !self.available.load(Ordering::SeqCst) {
            anyhow::bail!("indexer {} returned 503", endpoint);
        }
        let records = self.records.lock().unwrap();
        Ok(call_hashes
            .iter()
            .filter_map(|call_hash| records.get(call_hash).map(|r| (*call_hash, r.clone())))
            .collect())
    }
}

pub struct InMemoryWalletStore {
    selected: watch::Sender<Option<Wallet>>,
}

impl InMemoryWalletStore {
    pub fn new(initial: Option<Wallet>) -> Self {
        let (selected, _) = watch::channel(initial);
        Self { selected }
    }

    pub fn select(&self, wallet: Option<Wallet>) {
        self.selected.send_replace(wallet);
    }
}

impl WalletStore for InMemoryWalletStore {
    fn observe_selected_wallet(&self) -> watch::Receiver<Option<Wallet>> {
        self.selected.subscribe()
    }
}

#[derive(Default)]
pub struct InMemoryChainListStore {
    chains: Mutex<BTreeMap<ChainId, Chain>>,
    subscribers: Mutex<Vec<mpsc::Sender<Vec<ChainChange>>>>,
}

impl InMemoryChainListStore {
    pub fn new(chains: Vec<Chain>) -> Self {
        let store = Self::default();
        {
            let mut map = store.chains.lock().unwrap();
            for chain in chains {
                map.insert(chain.chain_id.clone(), chain);
            }
        }
        store
    }

    pub fn apply(&self, changes: Vec<ChainChange>) {
        {
            let mut map = self.chains.lock().unwrap();
            for change in &changes {
                match change {
                    ChainChange::Insert(chain) | ChainChange::Update(chain) => {
                        map.insert(chain.chain_id.clone(), chain.clone());
                    }
                    ChainChange::Delete(chain_id) => {
                        map.remove(chain_id);
                    }
                }
            }
        }
        let subscribers = self.subscribers.lock().unwrap();
        for tx in subscribers.iter() {
            let _ = tx.try_send(changes.clone());
        }
    }
}

impl ChainListStore for InMemoryChainListStore {
    fn observe_chains(&self) -> mpsc::Receiver<Vec<ChainChange>> {
        let (tx, rx) = mpsc::channel(64);
        let initial: Vec<ChainChange> = self
            .chains
            .lock()
            .unwrap()
            .values()
            .cloned()
            .map(ChainChange::Insert)
            .collect();
        if !initial.is_empty() {
            let _ = tx.try_send(initial);
        }
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

/// Records every store notification
#[derive(Default)]
pub struct RecordingObserver {
    updates: Mutex<Vec<(ScopeKey, Vec<PendingOperation>)>>,
}

impl RecordingObserver {
    pub fn updates(&self) -> Vec<(ScopeKey, Vec<PendingOperation>)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<Vec<PendingOperation>> {
        self.updates.lock().unwrap().last().map(|(_, ops)| ops.clone())
    }
}

impl PendingOperationObserver for RecordingObserver {
    fn on_update(&self, scope: &ScopeKey, operations: &[PendingOperation]) {
        self.updates
            .lock()
            .unwrap()
            .push((scope.clone(), operations.to_vec()));
    }
}

/// Fresh dependencies plus handles to their mocks
pub struct TestContext {
    pub registry: Arc<MockChainRegistry>,
    pub indexer: Arc<MockIndexerClient>,
    pub store: Arc<PendingOperationStore>,
    pub clock: Arc<ManualClock>,
    pub deps: SyncDependencies,
}

impl TestContext {
    pub fn new() -> Self {
        init_for_testing();
        let registry = Arc::new(MockChainRegistry::default());
        let indexer = Arc::new(MockIndexerClient::default());
        let store = Arc::new(PendingOperationStore::in_memory());
        let clock = Arc::new(ManualClock::new(TEST_NOW));
        let mut deps = SyncDependencies::new(
            registry.clone(),
            indexer.clone(),
            store.clone(),
            SyncConfig::default(),
        )
        .unwrap()
        .with_clock(clock.clone());
        deps.call_data_cache = Arc::new(CallDataCache::with_secs(3600));
        Self {
            registry,
            indexer,
            store,
            clock,
            deps,
        }
    }
}
