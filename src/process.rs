//! Module C: Process Service (§4.C).
//!
//! Transforms pending raw events into canonical [`Transaction`]s: hash-grouped batch loading,
//! source-specific fund-flow computation, fee scoping, and operation classification, with strict
//! all-or-nothing semantics per hash group.
//!
//! The UTXO fund-flow arithmetic here (gross vs net, change-output handling) is grounded on the
//! teacher's `model/blockchain/utxo.rs::Utxo<A>` — there, `transfer`/`spend`/`receive` worked in
//! terms of the account's own outputs vs external ones; this module keeps that framing (sum what
//! left the account's addresses, net out what only went back to them) but produces the flatter
//! `Movement`/`Fee` shape instead of `Utxo`'s FIFO-pool-per-output-index bookkeeping, which now
//! belongs to the Lot Matcher (§4.E), not the Process Service.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::info;

use crate::domain::{
    AssetId, Currency, Fee, FeeScope, FeeSettlement, LinkType, Movement, Movements, Note,
    NoteSeverity, Operation, OperationCategory, OperationType, PriceAtTxTime, PriceSource,
    SourceType, Transaction, TransactionLink, TransactionStatus,
};
use crate::domain::account::Account;
use crate::staging::{ProcessingStatus, RawEvent, StagingStore};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("group mapping failed for hash {hash:?}: {reason}")]
    GroupMapping { hash: Option<String>, reason: String },
}

/// Addresses the account controls, for self/external fund-flow diffing. Normalization (lowercase
/// EVM, bech32 canonical Bitcoin, ...) is the Runner's job (§4.B step 2); by the time a group
/// reaches Process, every address here is already canonical.
pub struct GroupContext<'a> {
    pub account: &'a Account,
    pub self_addresses: &'a HashSet<String>,
}

/// A source-specific group transformer (§4.C step 3). Receives the complete set of raw rows for
/// one hash group and must map it to zero or more canonical transactions, or fail the whole group.
/// May also emit `blockchain_internal` links (§4.E step 4) for same-transaction change outputs;
/// cross-source `transfer` links are a collaborator's concern (§1) and never appear here.
pub trait SourceTransform: Send + Sync {
    fn transform(&self, group: &[RawEvent], ctx: &GroupContext<'_>) -> Result<(Vec<Transaction>, Vec<TransactionLink>), ProcessError>;
}

/// §6 persisted-state layout's `transactions` table, as a trait since DB migration mechanics are
/// out of scope (§1 Non-goals).
pub trait TransactionStore: Send + Sync {
    fn insert_many(&self, transactions: Vec<Transaction>);
    fn all_for_account(&self, account_id: &str) -> Vec<Transaction>;
    fn all(&self) -> Vec<Transaction>;
}

#[derive(Clone, Debug)]
pub struct ProcessGroupError {
    pub hash: Option<String>,
    pub raw_ids: Vec<u64>,
    pub message: String,
}

#[derive(Clone, Debug, Default)]
pub struct ProcessSummary {
    pub processed: usize,
    pub failed: usize,
    pub errors: Vec<ProcessGroupError>,
    pub links: Vec<TransactionLink>,
}

pub struct ProcessService<'a> {
    staging: &'a dyn StagingStore,
    transactions: &'a dyn TransactionStore,
}

impl<'a> ProcessService<'a> {
    pub fn new(staging: &'a dyn StagingStore, transactions: &'a dyn TransactionStore) -> Self {
        Self { staging, transactions }
    }

    /// §4.C `processAccountTransactionsChunked`.
    pub fn process_account_transactions_chunked(
        &self,
        account: &Account,
        transform: &dyn SourceTransform,
        self_addresses: &HashSet<String>,
        batch_size: usize,
    ) -> ProcessSummary {
        let mut summary = ProcessSummary::default();

        loop {
            let batch = self.staging.load_pending_by_hash_batch(&account.id, batch_size);
            if batch.is_empty() {
                break;
            }

            let groups = group_by_hash(batch);
            let group_count = groups.len();
            let mut tx_count = 0usize;
            let mut error_count = 0usize;
            let ctx = GroupContext { account, self_addresses };

            for group in groups {
                let ids: Vec<u64> = group.iter().map(|r| r.id).collect();
                let hash = group.first().and_then(|r| r.blockchain_tx_hash.clone());

                match transform.transform(&group, &ctx) {
                    Ok((transactions, links)) => {
                        tx_count += transactions.len();
                        self.transactions.insert_many(transactions);
                        summary.links.extend(links);
                        let _ = self.staging.mark_processed(&ids);
                        summary.processed += 1;
                    }
                    Err(err) => {
                        error_count += 1;
                        let message = err.to_string();
                        let _ = self.staging.mark_failed(&ids, &message);
                        summary.failed += 1;
                        summary.errors.push(ProcessGroupError { hash, raw_ids: ids, message });
                    }
                }
            }

            info!(group_count, tx_count, error_count, "process.batch");
        }

        summary
    }
}

/// Splits a `loadPendingByHashBatch` result (already grouped/sorted by the staging store) back
/// into contiguous per-hash groups; a row with no hash is always its own singleton group.
fn group_by_hash(rows: Vec<RawEvent>) -> Vec<Vec<RawEvent>> {
    let mut groups: Vec<Vec<RawEvent>> = Vec::new();
    for row in rows {
        let continues_last = matches!(
            (&row.blockchain_tx_hash, groups.last().and_then(|g| g.last())),
            (Some(h), Some(last)) if last.blockchain_tx_hash.as_deref() == Some(h.as_str())
        );
        if continues_last {
            groups.last_mut().unwrap().push(row);
        } else {
            groups.push(vec![row]);
        }
    }
    groups
}

#[derive(Clone, Debug, serde::Deserialize)]
struct UtxoEndpoint {
    address: String,
    amount: String,
    #[serde(default)]
    asset_id: Option<String>,
    #[serde(default)]
    asset_symbol: Option<String>,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct UtxoTxShape {
    inputs: Vec<UtxoEndpoint>,
    outputs: Vec<UtxoEndpoint>,
    fee: String,
    #[serde(default)]
    native_chain: Option<String>,
}

pub mod reference {
    use super::*;
    use crate::domain::money::Amount;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct InMemoryTransactionStore {
        inner: Mutex<Vec<Transaction>>,
    }

    impl InMemoryTransactionStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl TransactionStore for InMemoryTransactionStore {
        fn insert_many(&self, transactions: Vec<Transaction>) {
            self.inner.lock().extend(transactions);
        }

        fn all_for_account(&self, account_id: &str) -> Vec<Transaction> {
            self.inner.lock().iter().filter(|t| t.account_id == account_id).cloned().collect()
        }

        fn all(&self) -> Vec<Transaction> {
            self.inner.lock().clone()
        }
    }

    /// UTXO fund-flow transform (§4.C, grounded on `Utxo<A>`). Expects `normalizedData` shaped
    /// as `{ inputs: [{address, amount}], outputs: [{address, amount}], fee, nativeChain }`.
    pub struct UtxoTransform;

    impl SourceTransform for UtxoTransform {
        fn transform(&self, group: &[RawEvent], ctx: &GroupContext<'_>) -> Result<Vec<Transaction>, ProcessError> {
            let row = group.first().ok_or_else(|| ProcessError::GroupMapping {
                hash: None,
                reason: "empty group".to_string(),
            })?;

            let shape: UtxoTxShape = serde_json::from_value(row.normalized_data.clone()).map_err(|e| {
                ProcessError::GroupMapping {
                    hash: row.blockchain_tx_hash.clone(),
                    reason: format!("malformed UTXO normalizedData: {e}"),
                }
            })?;

            let parse_amount = |s: &str, ctx_hash: &Option<String>| -> Result<Amount, ProcessError> {
                s.parse().map_err(|_| ProcessError::GroupMapping {
                    hash: ctx_hash.clone(),
                    reason: format!("unparseable amount {s:?}"),
                })
            };

            let self_in: Amount = shape
                .inputs
                .iter()
                .filter(|e| ctx.self_addresses.contains(&e.address))
                .map(|e| parse_amount(&e.amount, &row.blockchain_tx_hash))
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .fold(Amount::zero(), |acc, a| acc + a);

            let change_to_self: Amount = shape
                .outputs
                .iter()
                .filter(|e| ctx.self_addresses.contains(&e.address))
                .map(|e| parse_amount(&e.amount, &row.blockchain_tx_hash))
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .fold(Amount::zero(), |acc, a| acc + a);

            let external_out: Amount = shape
                .outputs
                .iter()
                .filter(|e| !ctx.self_addresses.contains(&e.address))
                .map(|e| parse_amount(&e.amount, &row.blockchain_tx_hash))
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .fold(Amount::zero(), |acc, a| acc + a);

            let fee = parse_amount(&shape.fee, &row.blockchain_tx_hash)?;
            let chain = shape.native_chain.clone().unwrap_or_else(|| "bitcoin".to_string());
            let asset_id = AssetId::native(&chain);
            let symbol = chain.to_uppercase();

            let mut movements = Movements::default();
            let mut fees = Vec::new();
            let mut operation;
            let mut internal_link = None;
            let tx_id = format!("tx-{}", row.blockchain_tx_hash.clone().unwrap_or_else(|| row.event_id.clone()));

            if self_in.is_zero() {
                // Pure incoming: no inputs from our own addresses.
                if !change_to_self.is_zero() {
                    movements.inflows.push(Movement::new(asset_id.clone(), symbol.clone(), change_to_self));
                }
                operation = Operation {
                    category: OperationCategory::Transfer,
                    kind: OperationType::Deposit,
                };
            } else {
                // §8 scenario 2: gross = self_in - change_to_self (external + fee); net = gross - fee.
                let gross = self_in - change_to_self;
                let net = gross - fee;
                let mut outflow = Movement::new(asset_id.clone(), symbol.clone(), gross);
                outflow.net_amount = Some(net);
                movements.outflows.push(outflow);

                if !change_to_self.is_zero() {
                    // The change output returning to our own address is not a disposal; it is
                    // marked `blockchain_internal` (§4.E step 4) so the Lot Matcher silently
                    // consumes it before looking for a real cross-source transfer link.
                    movements.inflows.push(Movement::new(asset_id.clone(), symbol.clone(), change_to_self));
                    internal_link = Some(TransactionLink {
                        id: format!("{tx_id}-change"),
                        source_transaction_id: tx_id.clone(),
                        target_transaction_id: tx_id.clone(),
                        link_type: LinkType::BlockchainInternal,
                        asset_id: asset_id.clone(),
                        source_amount: change_to_self,
                        target_amount: change_to_self,
                        confidence_score: "1".parse().unwrap(),
                    });
                }

                fees.push(Fee {
                    asset_id: asset_id.clone(),
                    asset_symbol: symbol.clone(),
                    amount: fee,
                    scope: FeeScope::Network,
                    settlement: FeeSettlement::OnChain,
                    price_at_tx_time: None,
                });

                operation = if external_out.is_zero() {
                    Operation { category: OperationCategory::Transfer, kind: OperationType::Transfer }
                } else {
                    Operation { category: OperationCategory::Transfer, kind: OperationType::Withdrawal }
                };
            }

            let mut note = None;
            if movements.inflows.is_empty() && movements.outflows.is_empty() && !fee.is_zero() {
                operation = Operation { category: OperationCategory::Fee, kind: OperationType::Fee };
            }
            if group.len() > 3 {
                note = Some(Note {
                    kind: "batch".to_string(),
                    severity: NoteSeverity::Warning,
                    message: format!("{} raw events in one hash group", group.len()),
                });
            }

            let tx = Transaction {
                id: tx_id,
                account_id: ctx.account.id.clone(),
                external_id: row.external_id.clone(),
                source: ctx.account.source_name.clone(),
                source_type: SourceType::Blockchain,
                datetime: row.timestamp,
                timestamp: row.timestamp.timestamp_millis(),
                status: TransactionStatus::Success,
                from: shape.inputs.first().map(|e| e.address.clone()),
                to: shape.outputs.first().map(|e| e.address.clone()),
                movements,
                fees,
                operation,
                blockchain: Some(crate::domain::BlockchainContext {
                    name: chain,
                    block_height: None,
                    transaction_hash: row.blockchain_tx_hash.clone().unwrap_or_default(),
                    is_confirmed: true,
                }),
                note,
                excluded_from_accounting: false,
            };

            Ok((vec![tx], internal_link.into_iter().collect()))
        }
    }

    /// Exchange trade transform (§4.C, §8 scenario 1: Kraken fiat trade). Expects
    /// `normalizedData` shaped as `{ side, baseAssetId, baseSymbol, baseAmount, quoteCurrency,
    /// quoteAmount, feeAmount, feeCurrency }`.
    pub struct ExchangeTradeTransform;

    #[derive(Clone, Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ExchangeTradeShape {
        side: String,
        base_asset_id: String,
        base_symbol: String,
        base_amount: String,
        quote_currency: String,
        quote_amount: String,
        fee_amount: String,
        fee_currency: String,
    }

    impl SourceTransform for ExchangeTradeTransform {
        fn transform(&self, group: &[RawEvent], ctx: &GroupContext<'_>) -> Result<Vec<Transaction>, ProcessError> {
            let row = group.first().ok_or_else(|| ProcessError::GroupMapping {
                hash: None,
                reason: "empty group".to_string(),
            })?;

            let shape: ExchangeTradeShape = serde_json::from_value(row.normalized_data.clone()).map_err(|e| {
                ProcessError::GroupMapping {
                    hash: None,
                    reason: format!("malformed exchange trade normalizedData: {e}"),
                }
            })?;

            let base_amount: Amount = shape.base_amount.parse().map_err(|_| ProcessError::GroupMapping {
                hash: None,
                reason: format!("unparseable baseAmount {:?}", shape.base_amount),
            })?;
            let quote_amount: Amount = shape.quote_amount.parse().map_err(|_| ProcessError::GroupMapping {
                hash: None,
                reason: format!("unparseable quoteAmount {:?}", shape.quote_amount),
            })?;
            let fee_amount: Amount = shape.fee_amount.parse().map_err(|_| ProcessError::GroupMapping {
                hash: None,
                reason: format!("unparseable feeAmount {:?}", shape.fee_amount),
            })?;

            let base_asset = AssetId::parse(shape.base_asset_id.as_str()).map_err(|e| ProcessError::GroupMapping {
                hash: None,
                reason: e.to_string(),
            })?;
            let quote_currency = Currency::from(shape.quote_currency.as_str());
            let quote_asset = AssetId::fiat(quote_currency.code());

            let mut movements = Movements::default();
            let op_kind = if shape.side.eq_ignore_ascii_case("buy") {
                OperationType::Buy
            } else {
                OperationType::Sell
            };

            let (base_is_inflow, quote_is_inflow) = (op_kind == OperationType::Buy, op_kind != OperationType::Buy);

            let mut base_movement = Movement::new(base_asset.clone(), shape.base_symbol.clone(), base_amount);
            if quote_currency.is_fiat() && base_is_inflow {
                // §4.D Pass 1: exchange-execution price stamped here at Process time is also
                // valid at Process time when the fiat/crypto ratio is already known.
                let unit_price = quote_amount.checked_div(base_amount);
                if let Some(unit_price) = unit_price {
                    base_movement.price_at_tx_time = Some(PriceAtTxTime::new(
                        unit_price,
                        quote_currency.clone(),
                        PriceSource::ExchangeExecution,
                        row.timestamp,
                    ));
                }
            }

            let quote_movement = Movement::new(quote_asset, shape.quote_currency.clone(), quote_amount);

            if base_is_inflow {
                movements.inflows.push(base_movement);
                movements.outflows.push(quote_movement);
            } else {
                movements.outflows.push(base_movement);
                movements.inflows.push(quote_movement);
            }

            let fee_asset = AssetId::fiat(&shape.fee_currency);
            let fees = vec![Fee {
                asset_id: fee_asset,
                asset_symbol: shape.fee_currency.clone(),
                amount: fee_amount,
                scope: FeeScope::Platform,
                settlement: FeeSettlement::Balance,
                price_at_tx_time: None,
            }];

            let tx = Transaction {
                id: format!("tx-{}", row.external_id),
                account_id: ctx.account.id.clone(),
                external_id: row.external_id.clone(),
                source: ctx.account.source_name.clone(),
                source_type: SourceType::Exchange,
                datetime: row.timestamp,
                timestamp: row.timestamp.timestamp_millis(),
                status: TransactionStatus::Success,
                from: None,
                to: None,
                movements,
                fees,
                operation: Operation { category: OperationCategory::Trade, kind: op_kind },
                blockchain: None,
                note: None,
                excluded_from_accounting: false,
            };

            Ok((vec![tx], Vec::new()))
        }
    }

}

#[cfg(test)]
mod tests {
    use super::reference::*;
    use super::*;
    use crate::domain::{Account, AccountType};
    use chrono::Utc;
    use serde_json::json;

    fn raw(hash: Option<&str>, normalized: Value) -> RawEvent {
        RawEvent {
            id: 0,
            account_id: "acct".to_string(),
            provider_name: "bitcoin-esplora".to_string(),
            external_id: "ext-1".to_string(),
            blockchain_tx_hash: hash.map(str::to_string),
            event_id: "evt-1".to_string(),
            provider_data: json!({}),
            normalized_data: normalized,
            timestamp: Utc::now(),
            stream_type: crate::staging::StreamType::from(crate::staging::StreamType::NORMAL),
            processing_status: ProcessingStatus::Pending,
            import_session_id: "s1".to_string(),
        }
    }

    #[test]
    fn utxo_outgoing_with_change_matches_scenario_2() {
        let self_addresses: HashSet<String> = ["self-addr".to_string()].into_iter().collect();
        let account = Account::new("acct", AccountType::Blockchain, "bitcoin", "self-addr");
        let ctx = GroupContext { account: &account, self_addresses: &self_addresses };

        let row = raw(
            Some("0xhash"),
            json!({
                "inputs": [{"address": "self-addr", "amount": "1.0"}],
                "outputs": [
                    {"address": "external-addr", "amount": "0.7"},
                    {"address": "self-addr", "amount": "0.2995"}
                ],
                "fee": "0.0005",
                "nativeChain": "bitcoin",
            }),
        );

        let (txs, links) = UtxoTransform.transform(&[row], &ctx).unwrap();
        assert_eq!(txs.len(), 1);
        let outflow = &txs[0].movements.outflows[0];
        assert_eq!(outflow.gross_amount, "0.7005".parse().unwrap());
        assert_eq!(outflow.net_amount, Some("0.7".parse().unwrap()));
        assert_eq!(txs[0].operation.kind, OperationType::Withdrawal);

        let inflow = &txs[0].movements.inflows[0];
        assert_eq!(inflow.gross_amount, "0.2995".parse().unwrap());

        assert_eq!(links.len(), 1);
        assert_eq!(links[0].link_type, crate::domain::LinkType::BlockchainInternal);
        assert_eq!(links[0].source_transaction_id, txs[0].id);
        assert_eq!(links[0].target_transaction_id, txs[0].id);
        assert_eq!(links[0].target_amount, "0.2995".parse().unwrap());
    }

    #[test]
    fn exchange_buy_stamps_execution_price_matches_scenario_1() {
        let self_addresses = HashSet::new();
        let account = Account::new("acct", AccountType::ExchangeApi, "kraken", "api-key-handle");
        let ctx = GroupContext { account: &account, self_addresses: &self_addresses };

        let row = raw(
            None,
            json!({
                "side": "buy",
                "baseAssetId": "blockchain:bitcoin:native",
                "baseSymbol": "BTC",
                "baseAmount": "0.5",
                "quoteCurrency": "USD",
                "quoteAmount": "48250",
                "feeAmount": "12.50",
                "feeCurrency": "USD",
            }),
        );

        let (txs, links) = ExchangeTradeTransform.transform(&[row], &ctx).unwrap();
        assert!(links.is_empty());
        let inflow = &txs[0].movements.inflows[0];
        let price = inflow.price_at_tx_time.as_ref().unwrap();
        assert_eq!(price.price.amount, "96500".parse().unwrap());
        assert_eq!(price.source, PriceSource::ExchangeExecution);
        assert_eq!(txs[0].operation.kind, OperationType::Buy);
    }

    #[test]
    fn failed_group_mapping_marks_raw_rows_failed_and_is_counted() {
        let store = crate::staging::reference::InMemoryStagingStore::new();
        let tx_store = InMemoryTransactionStore::new();
        let mut row = raw(Some("0xbad"), json!({"not": "utxo-shaped"}));
        row.account_id = "acct".to_string();
        store.save_batch("acct", vec![row]);

        let account = Account::new("acct", AccountType::Blockchain, "bitcoin", "self-addr");
        let self_addresses: HashSet<String> = ["self-addr".to_string()].into_iter().collect();
        let service = ProcessService::new(&store, &tx_store);

        let summary = service.process_account_transactions_chunked(&account, &UtxoTransform, &self_addresses, 100);
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors.len(), 1);
        assert!(store.load_pending_by_hash_batch("acct", 100).is_empty());
    }
}
