//! Module D: Price Enrichment (§4.D).
//!
//! A multi-pass, idempotent price-inference engine: exchange-execution extraction, trade-ratio
//! derivation, link propagation, external fetch, and crypto/crypto ratio recalculation, run to
//! fixpoint or `maxIterations`.
//!
//! Grounded on the teacher's `basis.rs::CheckList::execute` shape — there a flat list of
//! `Event`s was walked once, accumulating `Ok`/`Err` into a `CheckList`; here the walk repeats
//! pass-over-pass until nothing changes, but the "accumulate, don't fail the whole run over one
//! bad row" posture is the same: an un-priceable movement just stays unpriced and is caught by
//! the Lot Matcher's precondition scan (§4.E), not by this module.

use std::collections::HashMap;
use thiserror::Error;

use crate::cache::PriceCache;
use crate::domain::{
    AssetId, Currency, Movement, OperationCategory, PriceAtTxTime, PriceGranularity, PriceSource,
    SourceType, Transaction, TransactionLink,
};

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("price enrichment did not converge within {0} iterations")]
    NotConverged(u32),
}

#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct EnrichmentReport {
    pub iterations: u32,
    pub prices_added: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct EnrichmentConfig {
    pub max_iterations: u32,
    pub fx_normalization_enabled: bool,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            fx_normalization_enabled: false,
        }
    }
}

pub struct EnrichmentEngine<'a> {
    links: &'a [TransactionLink],
    crypto_cache: &'a PriceCache<'a>,
    fx_cache: Option<&'a PriceCache<'a>>,
    config: EnrichmentConfig,
}

impl<'a> EnrichmentEngine<'a> {
    pub fn new(links: &'a [TransactionLink], crypto_cache: &'a PriceCache<'a>, config: EnrichmentConfig) -> Self {
        Self { links, crypto_cache, fx_cache: None, config }
    }

    pub fn with_fx_cache(mut self, fx_cache: &'a PriceCache<'a>) -> Self {
        self.fx_cache = Some(fx_cache);
        self
    }

    /// Runs every pass to fixpoint (or `maxIterations`), mutating `transactions` in place.
    pub fn run(&self, transactions: &mut [Transaction]) -> Result<EnrichmentReport, EnrichmentError> {
        let mut report = EnrichmentReport::default();

        loop {
            let mut changed = 0usize;

            if self.config.fx_normalization_enabled {
                changed += self.pass_fx_normalize(transactions);
            }
            changed += pass1_exchange_execution(transactions);
            changed += pass2_trade_ratio(transactions);
            changed += self.pass3_link_propagation(transactions);
            changed += self.pass4_external_fetch(transactions);
            changed += pass5_crypto_ratio_recalc(transactions);

            report.prices_added += changed;
            report.iterations += 1;

            if changed == 0 {
                tracing::info!(
                    iterations = report.iterations,
                    prices_added = report.prices_added,
                    "enrichment.summary"
                );
                return Ok(report);
            }
            if report.iterations >= self.config.max_iterations {
                tracing::warn!(
                    iterations = report.iterations,
                    prices_added = report.prices_added,
                    "enrichment.not_converged"
                );
                return Err(EnrichmentError::NotConverged(self.config.max_iterations));
            }
        }
    }

    fn pass3_link_propagation(&self, transactions: &mut [Transaction]) -> usize {
        let index_by_id: HashMap<String, usize> =
            transactions.iter().enumerate().map(|(i, t)| (t.id.clone(), i)).collect();
        let mut changed = 0usize;

        for link in self.links {
            if !link.is_eligible_for_propagation() {
                continue;
            }
            let (Some(&src_idx), Some(&tgt_idx)) =
                (index_by_id.get(&link.source_transaction_id), index_by_id.get(&link.target_transaction_id))
            else {
                continue;
            };
            if src_idx == tgt_idx {
                continue;
            }

            let (lo, hi, src_is_lo) = if src_idx < tgt_idx { (src_idx, tgt_idx, true) } else { (tgt_idx, src_idx, false) };
            let (left, right) = transactions.split_at_mut(hi);
            let (src_tx, tgt_tx) = if src_is_lo { (&mut left[lo], &mut right[0]) } else { (&mut right[0], &mut left[lo]) };

            if let Some(src_movement) = find_outflow_mut(src_tx, &link.asset_id) {
                if let Some(price) = src_movement.price_at_tx_time.clone() {
                    if let Some(tgt_movement) = find_inflow_mut(tgt_tx, &link.asset_id) {
                        if tgt_movement.price_at_tx_time.is_none() {
                            let mut propagated = price.clone();
                            propagated.source = PriceSource::LinkPropagated;
                            tgt_movement.price_at_tx_time = Some(propagated);
                            changed += 1;
                        }
                    }
                }
            }
            if let Some(tgt_movement) = find_inflow_mut(tgt_tx, &link.asset_id) {
                if let Some(price) = tgt_movement.price_at_tx_time.clone() {
                    if let Some(src_movement) = find_outflow_mut(src_tx, &link.asset_id) {
                        if src_movement.price_at_tx_time.is_none() {
                            let mut propagated = price;
                            propagated.source = PriceSource::LinkPropagated;
                            src_movement.price_at_tx_time = Some(propagated);
                            changed += 1;
                        }
                    }
                }
            }
        }

        changed
    }

    fn pass4_external_fetch(&self, transactions: &mut [Transaction]) -> usize {
        let mut changed = 0usize;
        let usd = Currency::new("USD");

        for tx in transactions.iter_mut() {
            let datetime = tx.datetime;
            for movement in tx.movements.inflows.iter_mut().chain(tx.movements.outflows.iter_mut()) {
                if movement.price_at_tx_time.is_some() || movement.asset_id.is_fiat() {
                    continue;
                }
                if let Some(price_data) = self.crypto_cache.get(&movement.asset_id, &usd, datetime) {
                    movement.price_at_tx_time = Some(
                        PriceAtTxTime::new(price_data.amount, usd.clone(), price_data.source, price_data.fetched_at)
                            .with_granularity(price_data.granularity),
                    );
                    changed += 1;
                }
            }
        }

        changed
    }

    /// Optional Stage 1 sub-stage: fetches FX rates for non-USD fiat movements and stamps
    /// `fxRateToUSD`/`fxSource`/`fxTimestamp` (§4.D "FX normalization").
    fn pass_fx_normalize(&self, transactions: &mut [Transaction]) -> usize {
        let Some(fx_cache) = self.fx_cache else { return 0 };
        let mut changed = 0usize;
        let usd = Currency::new("USD");

        for tx in transactions.iter_mut() {
            let datetime = tx.datetime;
            for movement in tx.movements.inflows.iter_mut().chain(tx.movements.outflows.iter_mut()) {
                let Some(price) = movement.price_at_tx_time.as_mut() else { continue };
                if price.fx_rate_to_usd.is_some() || price.price.currency.code() == "USD" {
                    continue;
                }
                if let Some(fx) = fx_cache.get(&fx_pair_asset(&price.price.currency), &usd, datetime) {
                    price.fx_rate_to_usd = Some(fx.amount);
                    price.fx_source = Some(fx.source.to_string_for_fx());
                    price.fx_timestamp = Some(fx.fetched_at);
                    changed += 1;
                }
            }
        }

        changed
    }
}

fn fiat_currency_of(asset_id: &AssetId) -> Option<Currency> {
    asset_id.as_str().strip_prefix("fiat:").map(Currency::new)
}

fn fx_pair_asset(currency: &Currency) -> AssetId {
    AssetId::fiat(currency.code())
}

trait PriceSourceExt {
    fn to_string_for_fx(&self) -> String;
}

impl PriceSourceExt for PriceSource {
    fn to_string_for_fx(&self) -> String {
        match self {
            PriceSource::ExternalFetch(name) => name.clone(),
            other => format!("{other:?}"),
        }
    }
}

fn find_outflow_mut<'t>(tx: &'t mut Transaction, asset_id: &AssetId) -> Option<&'t mut Movement> {
    tx.movements.outflows.iter_mut().find(|m| &m.asset_id == asset_id)
}

fn find_inflow_mut<'t>(tx: &'t mut Transaction, asset_id: &AssetId) -> Option<&'t mut Movement> {
    tx.movements.inflows.iter_mut().find(|m| &m.asset_id == asset_id)
}

fn is_fiat_or_stablecoin_movement(m: &Movement) -> bool {
    m.asset_id.is_fiat() || Currency::new(&m.asset_symbol).is_fiat_or_stablecoin()
}

/// §4.D Pass 1: exchange-execution extraction.
fn pass1_exchange_execution(transactions: &mut [Transaction]) -> usize {
    let mut changed = 0usize;

    for tx in transactions.iter_mut() {
        if tx.source_type != SourceType::Exchange || tx.operation.category != OperationCategory::Trade {
            continue;
        }
        if tx.movements.inflows.len() != 1 || tx.movements.outflows.len() != 1 {
            continue;
        }
        let datetime = tx.datetime;

        let inflow_is_fiat = tx.movements.inflows[0].asset_id.is_fiat();
        let outflow_is_fiat = tx.movements.outflows[0].asset_id.is_fiat();
        if inflow_is_fiat == outflow_is_fiat {
            continue; // need exactly one fiat leg
        }

        let (fiat_amount, fiat_asset, crypto_idx_is_inflow) = if inflow_is_fiat {
            (tx.movements.inflows[0].gross_amount, tx.movements.inflows[0].asset_id.clone(), false)
        } else {
            (tx.movements.outflows[0].gross_amount, tx.movements.outflows[0].asset_id.clone(), true)
        };
        let Some(currency) = fiat_currency_of(&fiat_asset) else { continue };

        let crypto_movement = if crypto_idx_is_inflow {
            &mut tx.movements.inflows[0]
        } else {
            &mut tx.movements.outflows[0]
        };
        if crypto_movement.price_at_tx_time.is_some() {
            continue;
        }
        let Some(unit_price) = fiat_amount.checked_div(crypto_movement.gross_amount) else { continue };

        crypto_movement.price_at_tx_time = Some(
            PriceAtTxTime::new(unit_price, currency, PriceSource::ExchangeExecution, datetime)
                .with_granularity(PriceGranularity::Exact),
        );
        changed += 1;
    }

    changed
}

/// §4.D Pass 2: trade-ratio derivation. Works for any trade-classified transaction (exchange or
/// on-chain swap) with exactly one priced leg and one unpriced leg.
fn pass2_trade_ratio(transactions: &mut [Transaction]) -> usize {
    let mut changed = 0usize;

    for tx in transactions.iter_mut() {
        if tx.operation.category != OperationCategory::Trade {
            continue;
        }
        if tx.movements.inflows.len() != 1 || tx.movements.outflows.len() != 1 {
            continue;
        }

        let inflow_priced = tx.movements.inflows[0].price_at_tx_time.is_some();
        let outflow_priced = tx.movements.outflows[0].price_at_tx_time.is_some();
        if inflow_priced == outflow_priced {
            continue; // need exactly one priced leg
        }

        if outflow_priced {
            let outflow_amount = tx.movements.outflows[0].gross_amount;
            let inflow_amount = tx.movements.inflows[0].gross_amount;
            let price = tx.movements.outflows[0].price_at_tx_time.clone().unwrap();
            let Some(derived) = price.price.amount.checked_mul(outflow_amount).and_then(|v| v.checked_div(inflow_amount)) else {
                continue;
            };
            tx.movements.inflows[0].price_at_tx_time = Some(
                PriceAtTxTime::new(derived, price.price.currency, PriceSource::DerivedTrade, price.fetched_at)
                    .with_granularity(price.granularity),
            );
        } else {
            let inflow_amount = tx.movements.inflows[0].gross_amount;
            let outflow_amount = tx.movements.outflows[0].gross_amount;
            let price = tx.movements.inflows[0].price_at_tx_time.clone().unwrap();
            let Some(derived) = price.price.amount.checked_mul(inflow_amount).and_then(|v| v.checked_div(outflow_amount)) else {
                continue;
            };
            tx.movements.outflows[0].price_at_tx_time = Some(
                PriceAtTxTime::new(derived, price.price.currency, PriceSource::DerivedTrade, price.fetched_at)
                    .with_granularity(price.granularity),
            );
        }
        changed += 1;
    }

    changed
}

/// §4.D Pass 5: crypto/crypto ratio recalculation. Overwrites only an `external-fetch`-sourced
/// inflow price; never downgrades anything else (§4.D semantics).
fn pass5_crypto_ratio_recalc(transactions: &mut [Transaction]) -> usize {
    let mut changed = 0usize;

    for tx in transactions.iter_mut() {
        if tx.operation.category != OperationCategory::Trade {
            continue;
        }
        if tx.movements.inflows.len() != 1 || tx.movements.outflows.len() != 1 {
            continue;
        }
        if is_fiat_or_stablecoin_movement(&tx.movements.inflows[0]) || is_fiat_or_stablecoin_movement(&tx.movements.outflows[0]) {
            continue;
        }

        let inflow_is_external_fetch = tx
            .movements
            .inflows[0]
            .price_at_tx_time
            .as_ref()
            .map(|p| p.source.is_external_fetch())
            .unwrap_or(false);
        if !inflow_is_external_fetch {
            continue;
        }
        let Some(outflow_price) = tx.movements.outflows[0].price_at_tx_time.clone() else { continue };

        let outflow_amount = tx.movements.outflows[0].gross_amount;
        let inflow_amount = tx.movements.inflows[0].gross_amount;
        let Some(ratio_price) = outflow_price
            .price
            .amount
            .checked_mul(outflow_amount)
            .and_then(|v| v.checked_div(inflow_amount))
        else {
            continue;
        };

        let inflow_movement = &mut tx.movements.inflows[0];
        let new_price = PriceAtTxTime::new(ratio_price, outflow_price.price.currency, PriceSource::DerivedRatio, outflow_price.fetched_at)
            .with_granularity(outflow_price.granularity);

        let old_amount = inflow_movement.price_at_tx_time.as_ref().map(|p| p.price.amount);
        inflow_movement.price_at_tx_time = Some(new_price);
        if old_amount != Some(ratio_price) {
            changed += 1;
        }
    }

    changed
}
