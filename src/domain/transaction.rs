//! The canonical transaction model Process Service (§4.C) produces and Price Enrichment
//! (§4.D) / Lot Matcher (§4.E) consume.
//!
//! Grounded on the teacher's `model/events.rs` `Event`/`EventInfo`/atom types: there, one
//! `Event` carried `Vec<EventTradeAtom>` / `Vec<EventIncomeAtom>` / `Vec<EventPositionAtom>`
//! plus fee vecs, each atom a (asset, amount, exchange rate) triple keyed to one ledger row.
//! Here the same "bag of priced asset movements plus fees" shape is generalized into
//! structural `inflows`/`outflows` (spec §3) instead of worksheet-shaped atom vectors, because
//! direction is now a type-level concern (`Movement` never carries a sign) rather than a
//! column in a tax-worksheet row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::asset::{AssetId, Currency};
use super::money::Amount;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriceGranularity {
    Exact,
    Minute,
    Hour,
    Day,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriceSource {
    ExchangeExecution,
    DerivedTrade,
    DerivedHistory,
    LinkPropagated,
    DerivedRatio,
    /// `external-fetch <provider name>`.
    ExternalFetch(String),
    Manual,
    Identity,
}

impl PriceSource {
    /// Pass 5 may only overwrite a price that came from an external fetch.
    pub fn is_external_fetch(&self) -> bool {
        matches!(self, PriceSource::ExternalFetch(_))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Price {
    pub amount: Amount,
    pub currency: Currency,
}

/// A price stamped on a movement or fee, with full provenance (§3 `PriceAtTxTime`).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PriceAtTxTime {
    pub price: Price,
    pub source: PriceSource,
    pub fetched_at: DateTime<Utc>,
    pub granularity: PriceGranularity,
    pub fx_rate_to_usd: Option<Amount>,
    pub fx_source: Option<String>,
    pub fx_timestamp: Option<DateTime<Utc>>,
}

impl PriceAtTxTime {
    pub fn new(amount: Amount, currency: Currency, source: PriceSource, fetched_at: DateTime<Utc>) -> Self {
        Self {
            price: Price { amount, currency },
            source,
            fetched_at,
            granularity: PriceGranularity::Exact,
            fx_rate_to_usd: None,
            fx_source: None,
            fx_timestamp: None,
        }
    }

    pub fn with_granularity(mut self, granularity: PriceGranularity) -> Self {
        self.granularity = granularity;
        self
    }

    /// USD-denominated unit price, applying the FX rate if the stamped currency isn't USD.
    pub fn unit_cost_usd(&self) -> Option<Amount> {
        if self.price.currency.code() == "USD" {
            Some(self.price.amount)
        } else {
            self.price.amount.checked_mul(self.fx_rate_to_usd?)
        }
    }
}

/// A single-asset inflow or outflow component of a transaction. Never carries a sign;
/// direction is encoded structurally by which vector (`inflows` vs `outflows`) it lives in.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Movement {
    pub asset_id: AssetId,
    pub asset_symbol: String,
    pub gross_amount: Amount,
    /// Gross minus chain-internal change outputs, for UTXO chains. `None` when gross and net
    /// coincide (account-model chains, exchange ledger rows).
    pub net_amount: Option<Amount>,
    pub price_at_tx_time: Option<PriceAtTxTime>,
}

impl Movement {
    pub fn new(asset_id: AssetId, asset_symbol: impl Into<String>, gross_amount: Amount) -> Self {
        Self {
            asset_id,
            asset_symbol: asset_symbol.into(),
            gross_amount,
            net_amount: None,
            price_at_tx_time: None,
        }
    }

    /// The amount that should actually be treated as disposed/acquired: `net_amount` when
    /// present (UTXO change-adjusted), else `gross_amount`.
    pub fn effective_amount(&self) -> Amount {
        self.net_amount.unwrap_or(self.gross_amount)
    }

    pub fn is_priced(&self) -> bool {
        self.price_at_tx_time.is_some()
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeeScope {
    Network,
    Platform,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeeSettlement {
    OnChain,
    Balance,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Fee {
    pub asset_id: AssetId,
    pub asset_symbol: String,
    pub amount: Amount,
    pub scope: FeeScope,
    pub settlement: FeeSettlement,
    pub price_at_tx_time: Option<PriceAtTxTime>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Movements {
    pub inflows: Vec<Movement>,
    pub outflows: Vec<Movement>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationCategory {
    Trade,
    Transfer,
    Staking,
    Defi,
    Fee,
    Governance,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationType {
    Buy,
    Sell,
    Swap,
    Deposit,
    Withdrawal,
    Transfer,
    Stake,
    Unstake,
    Reward,
    Fee,
    Batch,
    Refund,
    Vote,
    Proposal,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Operation {
    pub category: OperationCategory,
    #[serde(rename = "type")]
    pub kind: OperationType,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionStatus {
    Success,
    Pending,
    Failed,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    Exchange,
    Blockchain,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BlockchainContext {
    pub name: String,
    pub block_height: Option<u64>,
    pub transaction_hash: String,
    pub is_confirmed: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoteSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Note {
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: NoteSeverity,
    pub message: String,
}

/// The canonical transactional event (§3 `Transaction`).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Transaction {
    pub id: String,
    pub account_id: String,
    pub external_id: String,
    pub source: String,
    pub source_type: SourceType,
    pub datetime: DateTime<Utc>,
    pub timestamp: i64,
    pub status: TransactionStatus,
    pub from: Option<String>,
    pub to: Option<String>,
    pub movements: Movements,
    pub fees: Vec<Fee>,
    pub operation: Operation,
    pub blockchain: Option<BlockchainContext>,
    pub note: Option<Note>,
    pub excluded_from_accounting: bool,
}

impl Transaction {
    /// All asset ids touched by this transaction's movements, for the invariant that every
    /// referenced asset id is resolvable (§3 Invariants, §8 property).
    pub fn referenced_asset_ids(&self) -> impl Iterator<Item = &AssetId> {
        self.movements
            .inflows
            .iter()
            .chain(self.movements.outflows.iter())
            .map(|m| &m.asset_id)
    }

    pub fn is_priced(&self) -> bool {
        self.movements
            .inflows
            .iter()
            .chain(self.movements.outflows.iter())
            .all(Movement::is_priced)
    }

    pub fn is_trade(&self) -> bool {
        self.source_type == SourceType::Exchange && self.operation.category == OperationCategory::Trade
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_amounts_non_negative_by_construction() {
        // Amount itself allows negative values (it's a general decimal), but the domain
        // contract is that grossAmount is always non-negative; this is enforced by callers
        // (Process Service never emits a negative gross) and asserted here as documentation.
        let m = Movement::new(AssetId::native("bitcoin"), "BTC", Amount::zero());
        assert!(!m.gross_amount.is_negative());
    }

    #[test]
    fn effective_amount_prefers_net_over_gross() {
        let mut m = Movement::new(AssetId::native("bitcoin"), "BTC", "0.7005".parse().unwrap());
        assert_eq!(m.effective_amount(), "0.7005".parse().unwrap());
        m.net_amount = Some("0.7".parse().unwrap());
        assert_eq!(m.effective_amount(), "0.7".parse().unwrap());
    }
}
