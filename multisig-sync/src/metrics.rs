// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Registry,
};

const PASS_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 0.75, 1.0, 1.5, 2.0, 3.0, 5.0, 7.5, 10., 15., 20., 30., 60.,
];

#[derive(Clone, Debug)]
pub struct SyncMetrics {
    pub(crate) reconciliation_passes: IntCounterVec,
    pub(crate) reconciliation_latency: HistogramVec,
    pub(crate) reconciliation_delta: IntCounterVec,
    pub(crate) pending_operations: IntGaugeVec,

    pub(crate) subscription_updates: IntCounterVec,
    pub(crate) active_subscriptions: IntGaugeVec,
    pub(crate) decode_errors: IntCounterVec,
    pub(crate) proposal_events: IntCounterVec,

    pub(crate) indexer_requests: IntCounterVec,
    pub(crate) call_data_cache_hits: IntCounter,
    pub(crate) call_data_cache_misses: IntCounter,

    pub(crate) store_persist_errors: IntCounter,
    pub(crate) live_orchestrators: IntGauge,
}

impl SyncMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            reconciliation_passes: register_int_counter_vec_with_registry!(
                "multisig_sync_reconciliation_passes",
                "Total number of reconciliation passes, by chain and result",
                &["chain", "result"],
                registry,
            )
            .unwrap(),
            reconciliation_latency: register_histogram_vec_with_registry!(
                "multisig_sync_reconciliation_latency",
                "Latency of reconciliation passes in seconds, by chain",
                &["chain"],
                PASS_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            reconciliation_delta: register_int_counter_vec_with_registry!(
                "multisig_sync_reconciliation_delta",
                "Pending operations changed by reconciliation, by chain and kind",
                &["chain", "kind"],
                registry,
            )
            .unwrap(),
            pending_operations: register_int_gauge_vec_with_registry!(
                "multisig_sync_pending_operations",
                "Pending operations tracked after the last pass, by chain",
                &["chain"],
                registry,
            )
            .unwrap(),
            subscription_updates: register_int_counter_vec_with_registry!(
                "multisig_sync_subscription_updates",
                "Storage subscription updates applied, by chain and kind",
                &["chain", "kind"],
                registry,
            )
            .unwrap(),
            active_subscriptions: register_int_gauge_vec_with_registry!(
                "multisig_sync_active_subscription_call_hashes",
                "Call hashes covered by the live storage subscription, by chain",
                &["chain"],
                registry,
            )
            .unwrap(),
            decode_errors: register_int_counter_vec_with_registry!(
                "multisig_sync_decode_errors",
                "Items skipped because they could not be decoded, by chain and source",
                &["chain", "source"],
                registry,
            )
            .unwrap(),
            proposal_events: register_int_counter_vec_with_registry!(
                "multisig_sync_proposal_events",
                "Multisig proposal/approval events matching a tracked account, by chain",
                &["chain"],
                registry,
            )
            .unwrap(),
            indexer_requests: register_int_counter_vec_with_registry!(
                "multisig_sync_indexer_requests",
                "Call data requests sent to the off-chain indexer, by chain and result",
                &["chain", "result"],
                registry,
            )
            .unwrap(),
            call_data_cache_hits: register_int_counter_with_registry!(
                "multisig_sync_call_data_cache_hits",
                "Total number of call data cache hits",
                registry,
            )
            .unwrap(),
            call_data_cache_misses: register_int_counter_with_registry!(
                "multisig_sync_call_data_cache_misses",
                "Total number of call data cache misses",
                registry,
            )
            .unwrap(),
            store_persist_errors: register_int_counter_with_registry!(
                "multisig_sync_store_persist_errors",
                "Failures writing the pending operation snapshot to disk",
                registry,
            )
            .unwrap(),
            live_orchestrators: register_int_gauge_with_registry!(
                "multisig_sync_live_orchestrators",
                "Number of running per-chain sync orchestrators",
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}
