//! Module A: Staging Store (§4.A).
//!
//! An append-only per-account raw-event log with a dedup key, a processing status, and a
//! hash-grouped read path for the Process Service. Database migration mechanics are an
//! external collaborator (§1 Non-goals), so this module defines the contract as a trait
//! ([`StagingStore`]) and ships one in-process reference implementation
//! ([`reference::InMemoryStagingStore`]), `parking_lot`-guarded the way the teacher guards
//! shared client state in `client.rs`, sufficient to drive the whole pipeline and the test
//! suite end-to-end.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// An open-ended, but well-known-valued, stream substream name (§3: "normal, internal, token,
/// ledger, trade, deposit, withdrawal, …"). Modeled as a validated string rather than a closed
/// enum, the same way `AssetId` generalizes the teacher's closed `AssetName`: new providers
/// bring new stream types the core can't enumerate up front.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct StreamType(String);

impl StreamType {
    pub const NORMAL: &'static str = "normal";
    pub const INTERNAL: &'static str = "internal";
    pub const TOKEN: &'static str = "token";
    pub const LEDGER: &'static str = "ledger";
    pub const TRADE: &'static str = "trade";
    pub const DEPOSIT: &'static str = "deposit";
    pub const WITHDRAWAL: &'static str = "withdrawal";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StreamType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessingStatus {
    Pending,
    Processed,
    Failed,
    Skipped,
}

/// §3 `RawEvent`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RawEvent {
    pub id: u64,
    pub account_id: String,
    pub provider_name: String,
    pub external_id: String,
    pub blockchain_tx_hash: Option<String>,
    /// Dedup key; uniqueness is `(accountId, eventId)`.
    pub event_id: String,
    pub provider_data: Value,
    pub normalized_data: Value,
    pub timestamp: DateTime<Utc>,
    pub stream_type: StreamType,
    pub processing_status: ProcessingStatus,
    pub import_session_id: String,
}

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("raw event {0} is not pending (status-conditional update refused)")]
    NotPending(u64),
    #[error("unknown raw event id {0}")]
    UnknownId(u64),
}

/// Result of a [`StagingStore::save_batch`] call.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SaveBatchResult {
    pub inserted: usize,
    pub skipped: usize,
}

/// §4.A's contract. Implementors must guarantee: the `(accountId, eventId)` unique constraint
/// (collisions are silent skips, not errors); order preservation within a batch; atomicity per
/// batch; and that writes from the Runner and status flips from Process never interleave on the
/// same row (status-conditional updates).
pub trait StagingStore: Send + Sync {
    fn save_batch(&self, account_id: &str, events: Vec<RawEvent>) -> SaveBatchResult;

    /// All pending rows for the first `hash_limit` distinct `blockchainTxHash` values, in
    /// ascending hash order, then `id` ascending within each group. Rows with no hash (exchange
    /// ledger entries) are each their own one-row "hash group".
    fn load_pending_by_hash_batch(&self, account_id: &str, hash_limit: usize) -> Vec<RawEvent>;

    fn mark_processed(&self, ids: &[u64]) -> Result<(), StagingError>;

    fn mark_failed(&self, ids: &[u64], error: &str) -> Result<(), StagingError>;

    fn count_by_stream_type(&self, account_id: &str) -> std::collections::HashMap<StreamType, usize>;
}

pub mod reference {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashMap};

    /// In-process reference implementation of [`StagingStore`], `Mutex`-guarded so it is safe
    /// to share across the `rayon` pool that drives parallel per-account runs (§5).
    #[derive(Default)]
    pub struct InMemoryStagingStore {
        inner: Mutex<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        rows: Vec<RawEvent>,
        next_id: u64,
        /// (accountId, eventId) -> row index, for the unique-constraint check.
        dedup: HashMap<(String, String), usize>,
    }

    impl InMemoryStagingStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn all_rows(&self, account_id: &str) -> Vec<RawEvent> {
            let inner = self.inner.lock();
            inner
                .rows
                .iter()
                .filter(|r| r.account_id == account_id)
                .cloned()
                .collect()
        }
    }

    impl StagingStore for InMemoryStagingStore {
        fn save_batch(&self, account_id: &str, events: Vec<RawEvent>) -> SaveBatchResult {
            let mut inner = self.inner.lock();
            let mut result = SaveBatchResult::default();

            for mut event in events {
                let key = (account_id.to_string(), event.event_id.clone());
                if inner.dedup.contains_key(&key) {
                    result.skipped += 1;
                    continue;
                }

                event.id = inner.next_id;
                inner.next_id += 1;
                let idx = inner.rows.len();
                inner.dedup.insert(key, idx);
                inner.rows.push(event);
                result.inserted += 1;
            }

            result
        }

        fn load_pending_by_hash_batch(&self, account_id: &str, hash_limit: usize) -> Vec<RawEvent> {
            let inner = self.inner.lock();

            // Group pending rows for this account by hash (None means "own one-row group", using
            // a synthetic per-row key so each ungrouped row sorts independently).
            let mut groups: BTreeMap<String, Vec<&RawEvent>> = BTreeMap::new();
            for row in inner.rows.iter() {
                if row.account_id != account_id || row.processing_status != ProcessingStatus::Pending {
                    continue;
                }
                let key = match &row.blockchain_tx_hash {
                    Some(hash) => hash.clone(),
                    // Prefix so ungrouped rows never collide with a real hash, and sort after id.
                    None => format!("\u{0}row:{:020}", row.id),
                };
                groups.entry(key).or_default().push(row);
            }

            let mut out = Vec::new();
            for (_, mut rows) in groups.into_iter().take(hash_limit) {
                rows.sort_by_key(|r| r.id);
                out.extend(rows.into_iter().cloned());
            }
            out
        }

        fn mark_processed(&self, ids: &[u64]) -> Result<(), StagingError> {
            let mut inner = self.inner.lock();
            for &id in ids {
                let row = inner
                    .rows
                    .iter_mut()
                    .find(|r| r.id == id)
                    .ok_or(StagingError::UnknownId(id))?;
                if row.processing_status != ProcessingStatus::Pending {
                    return Err(StagingError::NotPending(id));
                }
                row.processing_status = ProcessingStatus::Processed;
            }
            Ok(())
        }

        fn mark_failed(&self, ids: &[u64], _error: &str) -> Result<(), StagingError> {
            let mut inner = self.inner.lock();
            for &id in ids {
                let row = inner
                    .rows
                    .iter_mut()
                    .find(|r| r.id == id)
                    .ok_or(StagingError::UnknownId(id))?;
                if row.processing_status != ProcessingStatus::Pending {
                    return Err(StagingError::NotPending(id));
                }
                row.processing_status = ProcessingStatus::Failed;
            }
            Ok(())
        }

        fn count_by_stream_type(&self, account_id: &str) -> HashMap<StreamType, usize> {
            let inner = self.inner.lock();
            let mut counts = HashMap::new();
            for row in inner.rows.iter().filter(|r| r.account_id == account_id) {
                *counts.entry(row.stream_type.clone()).or_insert(0) += 1;
            }
            counts
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use serde_json::json;

        fn event(account: &str, event_id: &str, hash: Option<&str>) -> RawEvent {
            RawEvent {
                id: 0,
                account_id: account.to_string(),
                provider_name: "test-provider".to_string(),
                external_id: event_id.to_string(),
                blockchain_tx_hash: hash.map(str::to_string),
                event_id: event_id.to_string(),
                provider_data: json!({}),
                normalized_data: json!({}),
                timestamp: Utc::now(),
                stream_type: StreamType::from(StreamType::NORMAL),
                processing_status: ProcessingStatus::Pending,
                import_session_id: "session-1".to_string(),
            }
        }

        #[test]
        fn save_batch_is_idempotent() {
            let store = InMemoryStagingStore::new();
            let events = vec![event("a1", "e1", None), event("a1", "e2", None)];

            let first = store.save_batch("a1", events.clone());
            assert_eq!(first, SaveBatchResult { inserted: 2, skipped: 0 });

            let second = store.save_batch("a1", events);
            assert_eq!(second, SaveBatchResult { inserted: 0, skipped: 2 });
            assert_eq!(store.all_rows("a1").len(), 2);
        }

        #[test]
        fn same_event_on_two_accounts_yields_two_rows() {
            let store = InMemoryStagingStore::new();
            store.save_batch("a1", vec![event("a1", "shared", None)]);
            store.save_batch("a2", vec![event("a2", "shared", None)]);
            assert_eq!(store.all_rows("a1").len(), 1);
            assert_eq!(store.all_rows("a2").len(), 1);
        }

        #[test]
        fn hash_grouping_keeps_multi_row_groups_atomic_and_ordered() {
            let store = InMemoryStagingStore::new();
            store.save_batch(
                "a1",
                vec![
                    event("a1", "e1", Some("0xhash1")),
                    event("a1", "e2", Some("0xhash1")),
                    event("a1", "e3", None),
                ],
            );

            let batch = store.load_pending_by_hash_batch("a1", 100);
            assert_eq!(batch.len(), 3);
            // Both rows of hash1's group are present and ordered by id ascending.
            let hash1_rows: Vec<_> = batch.iter().filter(|r| r.blockchain_tx_hash.as_deref() == Some("0xhash1")).collect();
            assert_eq!(hash1_rows.len(), 2);
            assert!(hash1_rows[0].id < hash1_rows[1].id);
        }

        #[test]
        fn mark_processed_flips_status_terminally() {
            let store = InMemoryStagingStore::new();
            store.save_batch("a1", vec![event("a1", "e1", None)]);
            let rows = store.load_pending_by_hash_batch("a1", 100);
            store.mark_processed(&[rows[0].id]).unwrap();
            assert!(store.load_pending_by_hash_batch("a1", 100).is_empty());
            // Re-marking a non-pending row is refused, not silently re-applied.
            assert!(store.mark_processed(&[rows[0].id]).is_err());
        }
    }
}
