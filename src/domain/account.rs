//! Accounts, cursors, and import sessions (§3, §4.B).
//!
//! Grounded on the teacher's `model/checkpoint.rs::State`/`CheckpointHeader`: there, resumable
//! progress was a single flat struct serialized whole via RON. Here it's split into the
//! relational shape §3 actually specifies (`Account.lastCursor: Map<streamType, CursorState>`,
//! a standalone `ImportSession` with its own lifecycle) because a streaming multi-provider
//! runner needs per-stream-type, per-account resumability rather than one global snapshot. The
//! RON-snapshot idiom itself isn't carried over; [`crate::staging::reference::InMemoryStagingStore`]
//! is the only `StagingStore` this crate ships, and it doesn't persist to disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CursorType {
    BlockNumber,
    Timestamp,
    TxHash,
    Offset,
    PageToken,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CursorValue {
    #[serde(rename = "type")]
    pub kind: CursorType,
    pub value: String,
}

impl CursorValue {
    pub fn block_number(n: u64) -> Self {
        Self {
            kind: CursorType::BlockNumber,
            value: n.to_string(),
        }
    }

    /// Parses `value` as a block number. Panics if this cursor isn't block-number-typed; callers
    /// must check `kind` first, matching the "panics are for programmer errors" design note.
    pub fn as_block_number(&self) -> u64 {
        assert_eq!(self.kind, CursorType::BlockNumber);
        self.value.parse().expect("cursor value is not a valid u64")
    }
}

/// Per-stream-type resume state (§3 `CursorState`).
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct CursorState {
    pub primary: Option<CursorValue>,
    pub alternatives: Vec<CursorValue>,
    pub last_transaction_id: Option<String>,
    pub total_fetched: u64,
}

impl CursorState {
    /// Advance by `n` newly fetched items, to a new `primary` cursor. `total_fetched` is
    /// monotonically non-decreasing, per the §3 invariant.
    pub fn advance(&mut self, primary: CursorValue, last_transaction_id: Option<String>, n: u64) {
        self.primary = Some(primary);
        self.last_transaction_id = last_transaction_id.or(self.last_transaction_id.take());
        self.total_fetched += n;
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountType {
    Blockchain,
    ExchangeApi,
    ExchangeCsv,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Account {
    pub id: String,
    pub user_id: Option<String>,
    pub parent_account_id: Option<String>,
    pub account_type: AccountType,
    pub source_name: String,
    pub identifier: String,
    pub provider_name: Option<String>,
    pub credentials: Option<Value>,
    pub last_cursor: HashMap<String, CursorState>,
    pub last_balance_check_at: Option<DateTime<Utc>>,
    pub verification_metadata: Option<Value>,
}

impl Account {
    pub fn new(id: impl Into<String>, account_type: AccountType, source_name: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: None,
            parent_account_id: None,
            account_type,
            source_name: source_name.into(),
            identifier: identifier.into(),
            provider_name: None,
            credentials: None,
            last_cursor: HashMap::new(),
            last_balance_check_at: None,
            verification_metadata: None,
        }
    }

    pub fn child(&self, id: impl Into<String>, identifier: impl Into<String>) -> Self {
        let mut child = Self::new(id, self.account_type, self.source_name.clone(), identifier);
        child.parent_account_id = Some(self.id.clone());
        child.provider_name = self.provider_name.clone();
        child
    }

    pub fn is_xpub_style(&self) -> bool {
        self.account_type == AccountType::Blockchain && self.parent_account_id.is_none()
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImportSessionStatus {
    Started,
    Completed,
    Failed,
}

/// §3 `ImportSession`. At most one non-terminal (`Started`) session per account is a caller
/// invariant enforced by [`crate::runner::ImportRunner`], not by this type.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ImportSession {
    pub id: String,
    pub account_id: String,
    pub status: ImportSessionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub transactions_imported: u64,
    pub transactions_skipped: u64,
    pub error_message: Option<String>,
    pub error_details: Option<Value>,
}

impl ImportSession {
    pub fn start(id: impl Into<String>, account_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            account_id: account_id.into(),
            status: ImportSessionStatus::Started,
            started_at,
            completed_at: None,
            transactions_imported: 0,
            transactions_skipped: 0,
            error_message: None,
            error_details: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != ImportSessionStatus::Started
    }

    pub fn complete(&mut self, at: DateTime<Utc>, imported: u64, skipped: u64) {
        self.status = ImportSessionStatus::Completed;
        self.completed_at = Some(at);
        self.transactions_imported = imported;
        self.transactions_skipped = skipped;
    }

    pub fn fail(&mut self, at: DateTime<Utc>, error_message: impl Into<String>) {
        self.status = ImportSessionStatus::Failed;
        self.completed_at = Some(at);
        self.error_message = Some(error_message.into());
    }
}
