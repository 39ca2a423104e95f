//! Asset and currency identity.
//!
//! The teacher's `AssetName`/`KrakenAmount` pairing hardcodes one enum variant per currency it
//! knows about (`Usd`, `Chf`, `Eur`, `Jpy`, `Btc`, `Eth`, `EthW`, `Usdc`, `Usdt`) because it only
//! ever has to speak to one exchange and one chain. An ingestion pipeline that pulls from many
//! exchanges and many chains can't enumerate assets up front, so [`AssetId`] is a validated
//! string scheme instead of a closed enum; only the fiat/stablecoin *predicates* stay closed
//! sets, because those really are fixed vocabularies a jurisdiction's tax code cares about.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssetIdError {
    #[error("asset id {0:?} does not match blockchain:{{chain}}:native, blockchain:{{chain}}:{{contract}}, or fiat:{{code}}")]
    Malformed(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AssetKind {
    BlockchainNative,
    BlockchainToken,
    Fiat,
}

/// Canonical cross-source identifier of an asset. Equality is exact string match; the
/// `assetSymbol` carried alongside on [`crate::domain::transaction::Movement`] is display-only.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    pub fn native(chain: impl AsRef<str>) -> Self {
        Self(format!("blockchain:{}:native", chain.as_ref()))
    }

    pub fn token(chain: impl AsRef<str>, contract: impl AsRef<str>) -> Self {
        Self(format!(
            "blockchain:{}:{}",
            chain.as_ref(),
            contract.as_ref()
        ))
    }

    pub fn fiat(code: impl AsRef<str>) -> Self {
        Self(format!("fiat:{}", code.as_ref().to_uppercase()))
    }

    pub fn parse(s: impl Into<String>) -> Result<Self, AssetIdError> {
        let s = s.into();
        let parts: Vec<&str> = s.splitn(3, ':').collect();
        let valid = match parts.as_slice() {
            ["fiat", code] => !code.is_empty(),
            ["blockchain", chain, rest] => !chain.is_empty() && !rest.is_empty(),
            _ => false,
        };
        if valid {
            Ok(Self(s))
        } else {
            Err(AssetIdError::Malformed(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> AssetKind {
        if self.0.starts_with("fiat:") {
            AssetKind::Fiat
        } else if self.0.ends_with(":native") {
            AssetKind::BlockchainNative
        } else {
            AssetKind::BlockchainToken
        }
    }

    pub fn is_fiat(&self) -> bool {
        matches!(self.kind(), AssetKind::Fiat)
    }

    /// The chain name, for blockchain-scheme asset ids.
    pub fn chain(&self) -> Option<&str> {
        self.0.strip_prefix("blockchain:")?.split(':').next()
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

const CLOSED_FIAT_SET: &[&str] = &[
    "USD", "EUR", "GBP", "CAD", "JPY", "CHF", "AUD", "NZD", "SEK", "NOK", "DKK",
];

const STABLECOIN_SYMBOLS: &[&str] = &["USDC", "USDT", "DAI", "BUSD", "TUSD", "GUSD", "PYUSD"];

/// A symbolic, display-only currency code (e.g. `BTC`, `USD`), distinct from [`AssetId`].
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().to_uppercase())
    }

    pub fn code(&self) -> &str {
        &self.0
    }

    pub fn is_fiat(&self) -> bool {
        CLOSED_FIAT_SET.contains(&self.0.as_str())
    }

    pub fn is_fiat_or_stablecoin(&self) -> bool {
        self.is_fiat() || STABLECOIN_SYMBOLS.contains(&self.0.as_str())
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Currency {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
