//! End-to-end scenario coverage (§8) that exercises real module boundaries together rather than
//! one module's own `#[cfg(test)]` fixtures in isolation: Staging Store + Process Service wiring,
//! and Price Enrichment's link-propagation pass feeding straight into the Lot Matcher.

use std::collections::HashSet;

use chrono::{TimeZone, Utc};
use serde_json::json;
use similar_asserts::assert_eq;

use taxcount::domain::account::{Account, AccountType};
use taxcount::domain::{
    AssetId, Currency, LinkType, Movement, Movements, Operation, OperationCategory,
    OperationType, PriceAtTxTime, PriceSource, SourceType, Transaction, TransactionLink,
    TransactionStatus,
};
use taxcount::lotmatch::{LotMatchConfig, LotMatcher};
use taxcount::process::reference::{ExchangeTradeTransform, InMemoryTransactionStore, UtxoTransform};
use taxcount::process::{ProcessService, SourceTransform, TransactionStore};
use taxcount::staging::reference::InMemoryStagingStore;
use taxcount::staging::{ProcessingStatus, RawEvent, StagingStore, StreamType};

fn raw_event(account_id: &str, event_id: &str, hash: Option<&str>, normalized: serde_json::Value) -> RawEvent {
    RawEvent {
        id: 0,
        account_id: account_id.to_string(),
        provider_name: "test-provider".to_string(),
        external_id: event_id.to_string(),
        blockchain_tx_hash: hash.map(str::to_string),
        event_id: event_id.to_string(),
        provider_data: json!({}),
        normalized_data: normalized,
        timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        stream_type: StreamType::from(StreamType::NORMAL),
        processing_status: ProcessingStatus::Pending,
        import_session_id: "session-1".to_string(),
    }
}

/// §8 scenario 1, driven through the real Staging Store -> Process Service pipeline instead of
/// calling `ExchangeTradeTransform::transform` directly.
#[test]
fn scenario_1_kraken_fiat_trade_through_staging_and_process() {
    let staging = InMemoryStagingStore::new();
    let transactions = InMemoryTransactionStore::new();
    let account = Account::new("acct-1", AccountType::ExchangeApi, "kraken", "api-key-handle");
    let self_addresses = HashSet::new();

    let row = raw_event(
        "acct-1",
        "kraken-trade-1",
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
    assert_eq!(staging.save_batch("acct-1", vec![row]).inserted, 1);

    let service = ProcessService::new(&staging, &transactions);
    let summary = service.process_account_transactions_chunked(&account, &ExchangeTradeTransform, &self_addresses, 50);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 0);
    assert!(staging.load_pending_by_hash_batch("acct-1", 50).is_empty(), "the row must be marked processed");

    let stored = transactions.all_for_account("acct-1");
    assert_eq!(stored.len(), 1);
    let price = stored[0].movements.inflows[0].price_at_tx_time.as_ref().unwrap();
    assert_eq!(price.price.amount, "96500".parse().unwrap());
    assert_eq!(price.source, PriceSource::ExchangeExecution);
}

/// §8 scenario 2, driven through the real Staging Store -> Process Service pipeline.
#[test]
fn scenario_2_utxo_withdrawal_with_change_through_staging_and_process() {
    let staging = InMemoryStagingStore::new();
    let transactions = InMemoryTransactionStore::new();
    let account = Account::new("acct-2", AccountType::Blockchain, "bitcoin", "self-addr");
    let self_addresses: HashSet<String> = ["self-addr".to_string()].into_iter().collect();

    let row = raw_event(
        "acct-2",
        "btc-spend-1",
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
    staging.save_batch("acct-2", vec![row]);

    let service = ProcessService::new(&staging, &transactions);
    let summary = service.process_account_transactions_chunked(&account, &UtxoTransform, &self_addresses, 50);
    assert_eq!(summary.processed, 1);

    let stored = transactions.all_for_account("acct-2");
    let outflow = &stored[0].movements.outflows[0];
    assert_eq!(outflow.gross_amount, "0.7005".parse().unwrap());
    assert_eq!(outflow.net_amount, Some("0.7".parse().unwrap()));
    assert_eq!(stored[0].operation.kind, OperationType::Withdrawal);

    let inflow = &stored[0].movements.inflows[0];
    assert_eq!(inflow.gross_amount, "0.2995".parse().unwrap());

    assert_eq!(summary.links.len(), 1);
    assert_eq!(summary.links[0].link_type, LinkType::BlockchainInternal);
    assert_eq!(summary.links[0].source_transaction_id, stored[0].id);
    assert_eq!(summary.links[0].target_transaction_id, stored[0].id);
}

fn bare_transaction(id: &str, source: &str, source_type: SourceType, when: chrono::DateTime<Utc>) -> Transaction {
    Transaction {
        id: id.to_string(),
        account_id: "acct".to_string(),
        external_id: id.to_string(),
        source: source.to_string(),
        source_type,
        datetime: when,
        timestamp: when.timestamp_millis(),
        status: TransactionStatus::Success,
        from: None,
        to: None,
        movements: Movements::default(),
        fees: Vec::new(),
        operation: Operation { category: OperationCategory::Transfer, kind: OperationType::Transfer },
        blockchain: None,
        note: None,
        excluded_from_accounting: false,
    }
}

/// §8 scenario 6: a Kraken ETH withdrawal linked to a blockchain-side deposit of 0.998 ETH (0.2%
/// under what was sent, below Kraken's 0.5% warning threshold). The deposit movement starts out
/// unpriced; Price Enrichment's link-propagation pass (§4.D Pass 3) is what gives it a price
/// before the Lot Matcher ever sees it, exactly as the pipeline would run the two modules back to
/// back.
#[test]
fn scenario_6_cross_source_transfer_propagates_price_then_carries_basis() {
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
    let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 10, 45, 0).unwrap();
    let eth = AssetId::native("ethereum");

    let mut withdraw = bare_transaction("withdraw", "kraken", SourceType::Exchange, t0);
    let mut source_movement = Movement::new(eth.clone(), "ETH", "1".parse().unwrap());
    source_movement.price_at_tx_time = Some(PriceAtTxTime::new(
        "3000".parse().unwrap(),
        Currency::new("USD"),
        PriceSource::ExchangeExecution,
        t0,
    ));
    withdraw.movements.outflows.push(source_movement);

    let mut deposit = bare_transaction("deposit", "ethereum", SourceType::Blockchain, t1);
    deposit.movements.inflows.push(Movement::new(eth.clone(), "ETH", "0.998".parse().unwrap())); // unpriced

    let link = TransactionLink {
        id: "transfer-1".to_string(),
        source_transaction_id: "withdraw".to_string(),
        target_transaction_id: "deposit".to_string(),
        link_type: LinkType::Transfer,
        asset_id: eth,
        source_amount: "1".parse().unwrap(),
        target_amount: "1".parse().unwrap(),
        confidence_score: "0.99".parse().unwrap(),
    };

    let provider = taxcount::providers::reference::TablePriceProvider::new("empty");
    let cache = taxcount::cache::PriceCache::new(&provider);
    let links = vec![link.clone()];
    let engine = taxcount::enrichment::EnrichmentEngine::new(&links, &cache, taxcount::enrichment::EnrichmentConfig::default());

    let mut transactions = vec![withdraw, deposit];
    let enrich_report = engine.run(&mut transactions).unwrap();
    assert!(enrich_report.prices_added >= 1);

    let deposit_price = transactions[1].movements.inflows[0].price_at_tx_time.as_ref().unwrap();
    assert_eq!(deposit_price.price.amount, "3000".parse().unwrap());
    assert_eq!(deposit_price.source, PriceSource::LinkPropagated);

    let matcher = LotMatcher::new(LotMatchConfig::default());
    let report = matcher.run("calc-scenario-6", &transactions, vec![link]).unwrap();

    assert!(report.errors.is_empty());
    assert!(report.warnings.is_empty(), "0.2% variance is below the 0.5% Kraken warning threshold");
    assert!(report.disposals.is_empty(), "the whole outflow is a transfer, not a sale");

    let target_transfer = report.transfers.iter().find(|t| t.target_lot_id.is_some()).expect("target-side transfer");
    assert_eq!(target_transfer.qty, "0.998".parse().unwrap());
    assert_eq!(target_transfer.carried_cost_usd, "2994".parse().unwrap());

    let source_transfer = report.transfers.iter().find(|t| t.target_lot_id.is_none()).expect("source-side transfer");
    assert_eq!(source_transfer.qty, "1".parse().unwrap());
}
