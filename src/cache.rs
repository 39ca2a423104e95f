//! The shared price cache (§5 "Price cache DB... read-mostly; writes are idempotent"), keyed by
//! `(assetId, currency, timestampBucket)` per §4.D Pass 4 — using the canonical `AssetId` rather
//! than the spec's literal `assetSymbol` wording, since symbol is explicitly display-only (§3)
//! and two different chains can share a symbol; `DESIGN.md` records this as an Open Question
//! resolution.
//!
//! Grounded on `fett::Fett`, the teacher's own concurrent memoizing map (`crates/fett`), never
//! wired into the original Kraken/Bitcoin-only pipeline but an exact fit here: by the time a
//! lookup reaches this cache, the provider adapter's own retry-with-backoff (§5) has already
//! resolved any transient failure, so `None` (no data for that bucket) is as durable an answer as
//! `Some(price)` and is safe to memoize forever, same as a successful fetch.

use chrono::{DateTime, TimeZone, Utc};
use fett::Fett;

use crate::domain::{AssetId, Currency};
use crate::providers::{PriceData, PriceProvider, PriceRequest};

pub type CacheKey = (String, String, i64);

pub fn bucket(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp() / 86_400
}

/// A read-through cache in front of one [`PriceProvider`]. `fett::Fett`'s single-shot value
/// constructor means each `(asset, currency, day)` triple is fetched at most once for the
/// lifetime of this cache.
pub struct PriceCache<'a> {
    fett: Fett<CacheKey, Option<PriceData>, Box<dyn Fn(&CacheKey) -> Option<PriceData> + 'a>>,
}

impl<'a> PriceCache<'a> {
    pub fn new(provider: &'a dyn PriceProvider) -> Self {
        let create: Box<dyn Fn(&CacheKey) -> Option<PriceData> + 'a> = Box::new(move |key: &CacheKey| {
            let (asset, currency, day) = key.clone();
            let timestamp = Utc.timestamp_opt(day * 86_400, 0).single()?;
            let request = PriceRequest {
                asset: AssetId::parse(asset).ok()?,
                currency: Currency::from(currency.as_str()),
                timestamp,
            };
            provider.fetch_price(&request).ok()
        });
        Self { fett: Fett::new(create) }
    }

    pub fn get(&self, asset: &AssetId, currency: &Currency, timestamp: DateTime<Utc>) -> Option<PriceData> {
        let key = (asset.as_str().to_string(), currency.code().to_string(), bucket(timestamp));
        self.fett.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::reference::TablePriceProvider;
    use crate::providers::PriceSource;
    use chrono::TimeZone;

    #[test]
    fn repeated_lookups_hit_the_same_bucket() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 23, 0, 0).unwrap();
        let day_bucket = bucket(t0);

        let provider = TablePriceProvider::new("table").with_price(
            "blockchain:bitcoin:native",
            "USD",
            day_bucket,
            "60000".parse().unwrap(),
        );
        let cache = PriceCache::new(&provider);
        let asset = AssetId::native("bitcoin");
        let currency = Currency::new("USD");

        let first = cache.get(&asset, &currency, t0).unwrap();
        let second = cache.get(&asset, &currency, t1).unwrap();
        assert_eq!(first.amount, second.amount);
        assert!(matches!(first.source, PriceSource::ExternalFetch(_)));
    }

    #[test]
    fn missing_data_is_a_durable_none() {
        let provider = TablePriceProvider::new("table");
        let cache = PriceCache::new(&provider);
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap();
        assert!(cache.get(&AssetId::native("bitcoin"), &Currency::new("USD"), t0).is_none());
    }
}
