// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Remote data sources of a reconciliation pass

pub mod block_time;
pub mod offchain;
pub mod onchain;

pub use block_time::{estimate_timestamp, BlockTimeEstimator, BlockTimeSnapshot};
pub use offchain::OffchainCallDataFetcher;
pub use onchain::OnchainDefinitionFetcher;
