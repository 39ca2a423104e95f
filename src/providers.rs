//! Provider contracts the pipeline consumes (§6), plus in-process reference
//! implementations used by the integration tests and the demonstration binary.
//!
//! `execute`/`executeStreaming` in §6 is async in the distilled spec; per Design Notes §9
//! ("Async iterators → pull-based streams... model it with whatever native abstraction the
//! target language offers"), this crate models `executeStreaming` as a plain pull-based
//! `Iterator`, the same "yield between batches, nothing held across suspension" shape the
//! teacher's `State::resolve` timeslice scheduler (`basis/split.rs`) uses for its own
//! cooperative multi-source loop, generalized here to a provider-facing contract instead of a
//! Kraken-ledger-specific one.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::domain::{AssetId, CursorState, CursorType, CursorValue, Currency, Amount, PriceGranularity, PriceSource};
use crate::staging::{RawEvent, StreamType};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProviderKind {
    Blockchain,
    Exchange,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProviderOperation {
    GetAddressTransactions,
    GetAddressBalances,
    GetAddressTokenTransactions,
    GetAddressInternalTransactions,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ReplayWindow {
    pub blocks: u64,
}

#[derive(Clone, Debug)]
pub struct ProviderCapabilities {
    pub supported_operations: Vec<ProviderOperation>,
    pub supported_stream_types: Vec<StreamType>,
    pub supported_cursor_types: Vec<CursorType>,
    pub preferred_cursor_type: CursorType,
    pub replay_window: Option<ReplayWindow>,
}

#[derive(Clone, Copy, Debug)]
pub struct RateLimitConfig {
    pub requests_per_second: u32,
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub burst_limit: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct ProviderDefaultConfig {
    pub rate_limit: RateLimitConfig,
    pub retries: u32,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct ProviderMetadata {
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: String,
    pub capabilities: ProviderCapabilities,
    pub default_config: ProviderDefaultConfig,
    pub requires_api_key: bool,
    pub supported_chains: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider transient error: {0}")]
    Transient(String),
    #[error("provider fatal error: {0}")]
    Fatal(String),
    #[error("unknown blockchain or exchange: {0}")]
    UnknownSource(String),
}

impl ProviderError {
    /// Transient errors are retried with backoff (§7); fatal ones are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// One batch yielded by a provider's streaming fetch, after the provider's own `StreamingBatch`
/// has been mapped into the core's raw-event shape (§6's `StreamingBatchResult<Tx>`).
#[derive(Clone, Debug)]
pub struct StreamingBatch {
    pub raw_transactions: Vec<RawEvent>,
    pub stream_type: StreamType,
    pub cursor: CursorState,
    pub is_complete: bool,
    pub provider_stats: Option<Value>,
    pub warnings: Vec<String>,
}

/// The provider contract (§6). `stream` returns a pull-based iterator rather than an async
/// stream (§9 Design Notes); cancellation is simply dropping the iterator.
pub trait Provider: Send + Sync {
    fn metadata(&self) -> &ProviderMetadata;

    fn execute(&self, operation: ProviderOperation, address: &str) -> Result<Value, ProviderError>;

    fn stream<'a>(
        &'a self,
        address: &'a str,
        stream_type: &'a StreamType,
        resume_cursor: Option<CursorState>,
    ) -> Box<dyn Iterator<Item = Result<StreamingBatch, ProviderError>> + 'a>;

    /// Produces valid resume points from a persisted raw event.
    fn extract_cursors(&self, event: &RawEvent) -> Vec<CursorValue>;

    /// Adjusts a cursor backward by the provider's `replayWindow`, to tolerate chain reorgs
    /// (§4.B step 4).
    fn apply_replay_window(&self, cursor: CursorState) -> CursorState {
        let Some(window) = self.metadata().capabilities.replay_window else {
            return cursor;
        };
        let mut adjusted = cursor;
        if let Some(primary) = &adjusted.primary {
            if primary.kind == CursorType::BlockNumber {
                let current = primary.as_block_number();
                let rewound = current.saturating_sub(window.blocks);
                adjusted.primary = Some(CursorValue::block_number(rewound));
            }
        }
        adjusted
    }
}

#[derive(Debug, Error)]
pub enum PriceProviderError {
    #[error("no price data for {asset}/{currency} at {timestamp}")]
    NoData {
        asset: AssetId,
        currency: Currency,
        timestamp: DateTime<Utc>,
    },
    #[error("price provider transient failure: {0}")]
    Transient(String),
}

#[derive(Clone, Debug)]
pub struct PriceRequest {
    pub asset: AssetId,
    pub currency: Currency,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct PriceData {
    pub amount: Amount,
    pub source: PriceSource,
    pub fetched_at: DateTime<Utc>,
    pub granularity: PriceGranularity,
}

/// §6 price-provider contract, shared between crypto spot-price providers (CoinGecko,
/// CryptoCompare, Binance) and FX providers (ECB, Bank of Canada) per §4.D's FX normalization
/// sub-stage.
pub trait PriceProvider: Send + Sync {
    fn name(&self) -> &str;

    fn fetch_price(&self, request: &PriceRequest) -> Result<PriceData, PriceProviderError>;
}

pub mod reference {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration as StdDuration;

    /// A provider whose entire stream is canned ahead of time — enough to drive the Runner's
    /// batch loop, cursor advancement, and replay-window behavior in tests without real I/O.
    pub struct ScriptedProvider {
        metadata: ProviderMetadata,
        batches: Vec<StreamingBatch>,
    }

    impl ScriptedProvider {
        pub fn new(name: impl Into<String>, kind: ProviderKind, batches: Vec<StreamingBatch>) -> Self {
            Self {
                metadata: ProviderMetadata {
                    name: name.into(),
                    kind,
                    base_url: "scripted://local".to_string(),
                    capabilities: ProviderCapabilities {
                        supported_operations: vec![ProviderOperation::GetAddressTransactions],
                        supported_stream_types: vec![StreamType::from(StreamType::NORMAL)],
                        supported_cursor_types: vec![CursorType::BlockNumber],
                        preferred_cursor_type: CursorType::BlockNumber,
                        replay_window: Some(ReplayWindow { blocks: 6 }),
                    },
                    default_config: ProviderDefaultConfig {
                        rate_limit: RateLimitConfig {
                            requests_per_second: 5,
                            requests_per_minute: 100,
                            requests_per_hour: 2000,
                            burst_limit: 10,
                        },
                        retries: 3,
                        timeout: StdDuration::from_secs(30),
                    },
                    requires_api_key: false,
                    supported_chains: vec!["bitcoin".to_string()],
                },
                batches,
            }
        }
    }

    impl Provider for ScriptedProvider {
        fn metadata(&self) -> &ProviderMetadata {
            &self.metadata
        }

        fn execute(&self, _operation: ProviderOperation, _address: &str) -> Result<Value, ProviderError> {
            Ok(Value::Null)
        }

        fn stream<'a>(
            &'a self,
            _address: &'a str,
            _stream_type: &'a StreamType,
            resume_cursor: Option<CursorState>,
        ) -> Box<dyn Iterator<Item = Result<StreamingBatch, ProviderError>> + 'a> {
            let already_fetched = resume_cursor.map(|c| c.total_fetched).unwrap_or(0);
            Box::new(
                self.batches
                    .iter()
                    .cloned()
                    .skip(already_fetched as usize)
                    .map(Ok),
            )
        }

        fn extract_cursors(&self, _event: &RawEvent) -> Vec<CursorValue> {
            Vec::new()
        }
    }

    /// A price provider backed by a fixed lookup table, keyed by `(assetSymbol, currency,
    /// timestamp_bucket)` the way §4.D Pass 4 specifies the shared price cache's key.
    #[derive(Default)]
    pub struct TablePriceProvider {
        name: String,
        table: HashMap<(String, String, i64), Amount>,
    }

    impl TablePriceProvider {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                table: HashMap::new(),
            }
        }

        pub fn with_price(mut self, asset: &str, currency: &str, day_bucket: i64, amount: Amount) -> Self {
            self.table.insert((asset.to_string(), currency.to_string(), day_bucket), amount);
            self
        }

        fn bucket(timestamp: DateTime<Utc>) -> i64 {
            timestamp.timestamp() / 86_400
        }
    }

    impl PriceProvider for TablePriceProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn fetch_price(&self, request: &PriceRequest) -> Result<PriceData, PriceProviderError> {
            let bucket = Self::bucket(request.timestamp);
            let key = (
                request.asset.as_str().to_string(),
                request.currency.code().to_string(),
                bucket,
            );
            self.table
                .get(&key)
                .copied()
                .map(|amount| PriceData {
                    amount,
                    source: PriceSource::ExternalFetch(self.name.clone()),
                    fetched_at: Utc::now(),
                    granularity: PriceGranularity::Day,
                })
                .ok_or_else(|| PriceProviderError::NoData {
                    asset: request.asset.clone(),
                    currency: request.currency.clone(),
                    timestamp: request.timestamp,
                })
        }
    }
}
