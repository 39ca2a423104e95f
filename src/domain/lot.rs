//! Cost-basis lots, disposals, and cross-transfer basis carries (§3 "Lots & Disposals").
//!
//! Grounded on the teacher's `basis/poolasset.rs::PoolAsset`: there a lot was deliberately
//! **not** `Clone`, so that consuming it (a disposal) could never accidentally duplicate basis.
//! [`AcquisitionLot`] keeps that discipline structurally instead: disposing from a lot goes
//! through [`AcquisitionLot::dispose`], which mutates `remaining_qty` in place rather than
//! handing out a copy, so the "double spend a lifecycle" failure mode the teacher's doc comment
//! warns about has no equivalent call path here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::asset::AssetId;
use super::money::Amount;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Strategy {
    Fifo,
    Lifo,
    Hifo,
}

#[derive(Debug, Error)]
pub enum LotError {
    #[error("disposal of {requested} exceeds lot {lot_id}'s remaining quantity {remaining}")]
    Overdraw {
        lot_id: String,
        requested: Amount,
        remaining: Amount,
    },
}

/// §3 `AcquisitionLot`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AcquisitionLot {
    pub id: String,
    pub calculation_id: String,
    pub asset_id: AssetId,
    pub acquired_at: DateTime<Utc>,
    pub original_qty: Amount,
    pub remaining_qty: Amount,
    pub unit_cost_usd: Amount,
    pub method: Strategy,
    pub origin_tx_id: String,
}

impl AcquisitionLot {
    pub fn new(
        id: impl Into<String>,
        calculation_id: impl Into<String>,
        asset_id: AssetId,
        acquired_at: DateTime<Utc>,
        qty: Amount,
        unit_cost_usd: Amount,
        method: Strategy,
        origin_tx_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            calculation_id: calculation_id.into(),
            asset_id,
            acquired_at,
            original_qty: qty,
            remaining_qty: qty,
            unit_cost_usd,
            method,
            origin_tx_id: origin_tx_id.into(),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining_qty.is_zero()
    }

    /// Consume up to `remaining_qty` (whichever is smaller) of this lot. Returns the quantity
    /// actually disposed. Never overdraws: `remaining_qty` never goes negative (§3 Invariants).
    pub fn dispose_up_to(&mut self, qty: Amount) -> Amount {
        let disposed = if qty <= self.remaining_qty {
            qty
        } else {
            self.remaining_qty
        };
        self.remaining_qty -= disposed;
        disposed
    }

    /// Consume exactly `qty`. Errors (rather than partially consuming) if the lot can't cover
    /// it; callers that want partial consumption should use [`Self::dispose_up_to`] directly.
    pub fn dispose_exact(&mut self, qty: Amount) -> Result<(), LotError> {
        if qty > self.remaining_qty {
            return Err(LotError::Overdraw {
                lot_id: self.id.clone(),
                requested: qty,
                remaining: self.remaining_qty,
            });
        }
        self.remaining_qty -= qty;
        Ok(())
    }
}

/// §3 `LotDisposal`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LotDisposal {
    pub lot_id: String,
    pub tx_id: String,
    pub qty: Amount,
    pub proceeds_usd: Amount,
    pub gain_usd: Amount,
}

impl LotDisposal {
    pub fn new(lot: &AcquisitionLot, tx_id: impl Into<String>, qty: Amount, proceeds_usd: Amount) -> Self {
        let cost_basis = lot.unit_cost_usd.checked_mul(qty).unwrap_or(Amount::zero());
        Self {
            lot_id: lot.id.clone(),
            tx_id: tx_id.into(),
            qty,
            proceeds_usd,
            gain_usd: proceeds_usd - cost_basis,
        }
    }
}

/// §3 `LotTransfer`: carries cost basis from a source lot across a linked transfer to whatever
/// lot is created (or inherited into) on the target side.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LotTransfer {
    pub link_id: String,
    pub source_lot_id: String,
    pub target_lot_id: Option<String>,
    pub qty: Amount,
    pub carried_cost_usd: Amount,
    pub fee_adjustment_usd: Option<Amount>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn lot(qty: &str, unit_cost: &str) -> AcquisitionLot {
        AcquisitionLot::new(
            "lot-1",
            "calc-1",
            AssetId::native("bitcoin"),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            qty.parse().unwrap(),
            unit_cost.parse().unwrap(),
            Strategy::Fifo,
            "tx-1",
        )
    }

    #[test]
    fn dispose_up_to_never_goes_negative() {
        let mut l = lot("0.5", "96500");
        let disposed = l.dispose_up_to("0.7".parse().unwrap());
        assert_eq!(disposed, "0.5".parse().unwrap());
        assert!(l.remaining_qty.is_zero());
        assert!(l.is_exhausted());
    }

    #[test]
    fn dispose_exact_errors_on_overdraw() {
        let mut l = lot("0.5", "96500");
        assert!(l.dispose_exact("0.6".parse().unwrap()).is_err());
        assert!(l.dispose_exact("0.5".parse().unwrap()).is_ok());
    }

    #[test]
    fn disposal_gain_is_proceeds_minus_cost_basis() {
        let l = lot("0.5", "96500");
        let disposal = LotDisposal::new(&l, "tx-2", "0.5".parse().unwrap(), "50000".parse().unwrap());
        // cost basis = 0.5 * 96500 = 48250; gain = 50000 - 48250 = 1750
        assert_eq!(disposal.gain_usd, "1750".parse().unwrap());
    }
}
