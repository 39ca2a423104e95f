//! Error aggregation. The teacher kept one `thiserror` enum per concern (`UtxoError`,
//! `CheckListError`, ...) and printed causal chains with `error_iter::ErrorIter` at the call site
//! (`basis.rs::CheckList`'s `Display` impl) rather than flattening everything into one giant
//! top-level enum. This module keeps that shape: it re-exports the per-module error types so
//! callers needing "any pipeline error" have one place to look, without collapsing their
//! distinct `Display` messages into a single generic wrapper.

pub use crate::domain::lot::LotError;
pub use crate::domain::money::MoneyError;
pub use crate::domain::asset::AssetIdError;
pub use crate::enrichment::EnrichmentError;
pub use crate::lotmatch::LotMatchError;
pub use crate::process::ProcessError;
pub use crate::providers::{PriceProviderError, ProviderError};
pub use crate::runner::RunnerError;
pub use crate::staging::StagingError;

use error_iter::ErrorIter;

/// Formats `err` and its full causal chain, one `error_iter::ErrorIter::sources()` line per
/// cause, the way the teacher's `CheckList::fmt` prints a failed price lookup. Used by the
/// demonstration binary's top-level error printer.
pub fn format_chain(err: &(dyn std::error::Error + 'static)) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    let _ = write!(out, "{err}");
    for cause in err.sources().skip(1) {
        let _ = write!(out, "\n  caused by: {cause}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("outer")]
    struct Outer(#[source] io::Error);

    #[test]
    fn format_chain_includes_every_cause() {
        let err = Outer(io::Error::new(io::ErrorKind::Other, "disk full"));
        let rendered = format_chain(&err);
        assert!(rendered.starts_with("outer"));
        assert!(rendered.contains("caused by: disk full"));
    }
}
