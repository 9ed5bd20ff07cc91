// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::call_data_cache::CallDataCache;
use crate::client::IndexerClient;
use crate::metrics::SyncMetrics;
use crate::types::{CallHash, CallRecord, ChainId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Best-effort lookup of call payloads and discovery times from the indexer.
///
/// Never fails: an unconfigured or unavailable indexer yields fewer rows,
/// and the pass continues with on-chain data only.
pub struct OffchainCallDataFetcher {
    chain_id: ChainId,
    endpoint: Option<String>,
    client: Arc<dyn IndexerClient>,
    cache: Arc<CallDataCache>,
    metrics: Option<Arc<SyncMetrics>>,
}

impl OffchainCallDataFetcher {
    pub fn new(
        chain_id: ChainId,
        endpoint: Option<String>,
        client: Arc<dyn IndexerClient>,
        cache: Arc<CallDataCache>,
    ) -> Self {
        Self {
            chain_id,
            endpoint,
            client,
            cache,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn fetch(&self, call_hashes: &HashSet<CallHash>) -> HashMap<CallHash, CallRecord> {
        if call_hashes.is_empty() {
            return HashMap::new();
        }

        let (mut records, missing) = self.cache.lookup(call_hashes).await;
        if let Some(metrics) = &self.metrics {
            metrics.call_data_cache_hits.inc_by(records.len() as u64);
            metrics.call_data_cache_misses.inc_by(missing.len() as u64);
        }
        if missing.is_empty() {
            return records;
        }

        let Some(endpoint) = self.endpoint.as_deref() else {
            debug!(
                "[{}] No multisig indexer configured, {} call hashes stay without call data",
                self.chain_id,
                missing.len()
            );
            return records;
        };

        let fetched = match self
            .client
            .fetch_call_data(&self.chain_id, endpoint, &missing)
            .await
        {
            Ok(fetched) => {
                self.record_request("ok");
                fetched
            }
            Err(e) => {
                warn!(
                    "[{}] Indexer {} unavailable, continuing with on-chain data only: {:?}",
                    self.chain_id, endpoint, e
                );
                self.record_request("error");
                return records;
            }
        };

        let mut verified = HashMap::new();
        for (call_hash, record) in fetched {
            if !missing.contains(&call_hash) {
                continue;
            }
            verified.insert(call_hash, self.verify(call_hash, record));
        }

        let cached = self.cache.insert_many(&verified).await;
        debug!(
            "[{}] Indexer returned {}/{} call records ({} cached)",
            self.chain_id,
            verified.len(),
            missing.len(),
            cached
        );

        records.extend(verified);
        records
    }

    /// Drop a payload whose hash does not match the requested call hash
    fn verify(&self, call_hash: CallHash, mut record: CallRecord) -> CallRecord {
        if let Some(call) = &record.call {
            if !call_hash.matches_call(call) {
                warn!(
                    "[{}] Indexer call payload does not hash to {}, dropping it",
                    self.chain_id, call_hash
                );
                if let Some(metrics) = &self.metrics {
                    metrics
                        .decode_errors
                        .with_label_values(&[self.chain_id.as_str(), "indexer"])
                        .inc();
                }
                record.call = None;
            }
        }
        record
    }

    fn record_request(&self, result: &str) {
        if let Some(metrics) = &self.metrics {
            metrics
                .indexer_requests
                .with_label_values(&[self.chain_id.as_str(), result])
                .inc();
        }
    }
}
