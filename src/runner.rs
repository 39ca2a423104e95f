//! Module B: Streaming Import Runner (§4.B).
//!
//! Drives one account at a time: session lifecycle, address handling (including xpub gap-limit
//! child derivation), the cursor-driven fetch loop, replay-window application, and dedup-on-resume.
//!
//! The teacher's adapters lived behind a module-level `Client` enum (`client.rs`) constructed
//! once in `main.rs` and threaded explicitly into callers — already the "injected registry"
//! shape Design Notes §9 asks for, just sized for exactly two blockchain backends. here
//! [`AdapterRegistry`] generalizes that to an arbitrary, name-keyed set of [`Provider`]s handed
//! to the runner at construction time, same idea, open cardinality.

use chrono::Utc;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

use crate::domain::{Account, AccountType, CursorState, DedupRing, ImportSession, ImportSessionStatus};
use crate::providers::{Provider, ProviderError};
use crate::staging::{RawEvent, SaveBatchResult, StagingError, StagingStore, StreamType};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("account {0} already has an import in progress")]
    AlreadyRunning(String),
    #[error("unknown blockchain/exchange provider: {0}")]
    UnknownSource(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Staging(#[from] StagingError),
}

/// An explicitly constructed, injected registry of providers (§9 "Global registries → injected
/// registry"), keyed by provider name.
#[derive(Default)]
pub struct AdapterRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) -> &mut Self {
        let name = provider.metadata().name.clone();
        self.providers.insert(name, provider);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>, RunnerError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| RunnerError::UnknownSource(name.to_string()))
    }
}

/// Normalizes addresses per chain and derives xpub/extended-key child addresses under a
/// gap-limit scan (§4.B step 2). Concrete key derivation is a provider/collaborator concern
/// (no cryptographic wallet library is carried by the core); this trait is the seam.
pub trait AddressDeriver: Send + Sync {
    fn normalize(&self, chain: &str, address: &str) -> String;

    /// Derives the `index`-th child address under `xpub` for `chain`.
    fn derive_child(&self, chain: &str, xpub: &str, index: u32) -> String;

    /// Default gap limit per chain (20 Bitcoin, 10 Cardano, per §4.B step 2).
    fn gap_limit(&self, chain: &str) -> u32 {
        match chain {
            "cardano" => 10,
            _ => 20,
        }
    }
}

/// A reference deriver sufficient for tests and the demonstration binary: EVM-style chains
/// lowercase, everything else passes through unchanged (Bitcoin bech32 canonicalization and
/// Substrate SS58 re-encoding are providers' concern in a full deployment, out of scope per
/// §1's "concrete exchange API wire formats").
pub struct DefaultAddressDeriver;

impl AddressDeriver for DefaultAddressDeriver {
    fn normalize(&self, chain: &str, address: &str) -> String {
        match chain {
            "ethereum" | "polygon" | "arbitrum" | "optimism" | "bsc" => address.to_lowercase(),
            _ => address.to_string(),
        }
    }

    fn derive_child(&self, _chain: &str, xpub: &str, index: u32) -> String {
        format!("{xpub}/{index}")
    }
}

pub struct ImportRunner<'a> {
    staging: &'a dyn StagingStore,
    registry: &'a AdapterRegistry,
    deriver: &'a dyn AddressDeriver,
    sessions: Mutex<HashMap<String, ImportSession>>,
    running: Mutex<HashSet<String>>,
    dedup_rings: Mutex<HashMap<(String, String), DedupRing>>,
}

struct RunGuard<'a> {
    running: &'a Mutex<HashSet<String>>,
    account_id: String,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.lock().remove(&self.account_id);
    }
}

impl<'a> ImportRunner<'a> {
    pub fn new(staging: &'a dyn StagingStore, registry: &'a AdapterRegistry, deriver: &'a dyn AddressDeriver) -> Self {
        Self {
            staging,
            registry,
            deriver,
            sessions: Mutex::new(HashMap::new()),
            running: Mutex::new(HashSet::new()),
            dedup_rings: Mutex::new(HashMap::new()),
        }
    }

    /// §4.B `importFromSource`.
    pub fn import_from_source(&self, account: &mut Account) -> Result<ImportSession, RunnerError> {
        let _guard = self.acquire_advisory_lock(&account.id)?;

        let provider_name = account
            .provider_name
            .clone()
            .ok_or_else(|| RunnerError::UnknownSource("(no provider configured)".to_string()))?;
        let provider = self.registry.get(&provider_name)?;

        let mut session = self.acquire_or_create_session(&account.id);

        if account.account_type == AccountType::Blockchain && account.is_xpub_style() {
            self.import_xpub_children(account, &provider, &mut session)?;
        } else {
            let address = self.deriver.normalize(
                provider.metadata().supported_chains.first().map(String::as_str).unwrap_or(""),
                &account.identifier,
            );
            self.import_one_address(account, &address, &provider, &mut session)?;
        }

        self.sessions.lock().insert(account.id.clone(), session.clone());
        Ok(session)
    }

    /// Runs `import_from_source` for every account concurrently (§5 "multiple accounts may run
    /// in parallel"); the per-account advisory lock still refuses two imports of the same
    /// account, whether attempted from this call or a separate one.
    pub fn import_many(&self, accounts: &mut [Account]) -> Vec<Result<ImportSession, RunnerError>> {
        accounts.par_iter_mut().map(|account| self.import_from_source(account)).collect()
    }

    fn acquire_advisory_lock(&self, account_id: &str) -> Result<RunGuard<'_>, RunnerError> {
        let mut running = self.running.lock();
        if !running.insert(account_id.to_string()) {
            return Err(RunnerError::AlreadyRunning(account_id.to_string()));
        }
        Ok(RunGuard {
            running: &self.running,
            account_id: account_id.to_string(),
        })
    }

    fn acquire_or_create_session(&self, account_id: &str) -> ImportSession {
        let mut sessions = self.sessions.lock();
        match sessions.get(account_id) {
            Some(existing) if !existing.is_terminal() => existing.clone(),
            _ => {
                let session = ImportSession::start(
                    format!("session-{account_id}-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default()),
                    account_id,
                    Utc::now(),
                );
                sessions.insert(account_id.to_string(), session.clone());
                session
            }
        }
    }

    fn import_xpub_children(
        &self,
        account: &mut Account,
        provider: &Arc<dyn Provider>,
        session: &mut ImportSession,
    ) -> Result<(), RunnerError> {
        let chain = provider.metadata().supported_chains.first().cloned().unwrap_or_default();
        let gap_limit = self.deriver.gap_limit(&chain);
        let mut consecutive_inactive = 0u32;
        let mut index = 0u32;

        while consecutive_inactive < gap_limit {
            let child_address = self.deriver.derive_child(&chain, &account.identifier, index);
            let mut child = account.child(format!("{}-child-{index}", account.id), child_address.clone());

            let imported_before = self.import_one_address(&mut child, &child_address, provider, session)?;
            if imported_before == 0 {
                consecutive_inactive += 1;
            } else {
                consecutive_inactive = 0;
            }
            index += 1;
        }

        Ok(())
    }

    /// Imports every stream type the provider advertises for one address, returning the count of
    /// newly inserted raw rows this call contributed (used by the gap-limit scan to decide
    /// whether a derived child is "active").
    fn import_one_address(
        &self,
        account: &mut Account,
        address: &str,
        provider: &Arc<dyn Provider>,
        session: &mut ImportSession,
    ) -> Result<u64, RunnerError> {
        let mut total_inserted = 0u64;
        let mut total_skipped = 0u64;

        for stream_type in provider.metadata().capabilities.supported_stream_types.clone() {
            let resume_cursor = account.last_cursor.get(stream_type.as_str()).cloned();
            let effective_cursor = resume_cursor.clone().map(|c| provider.apply_replay_window(c));

            let mut ring_key = self.dedup_rings.lock();
            let ring = ring_key
                .entry((account.id.clone(), stream_type.as_str().to_string()))
                .or_default();

            for batch in provider.stream(address, &stream_type, effective_cursor) {
                match batch {
                    Ok(batch) => {
                        let deduped: Vec<RawEvent> = batch
                            .raw_transactions
                            .into_iter()
                            .filter(|event| !ring.seen_or_insert(&event.event_id))
                            .collect();

                        let SaveBatchResult { inserted, skipped } =
                            self.staging.save_batch(&account.id, deduped);
                        total_inserted += inserted as u64;
                        total_skipped += skipped as u64;

                        tracing::info!(
                            account_id = %account.id,
                            stream_type = stream_type.as_str(),
                            inserted,
                            skipped,
                            "import.batch"
                        );

                        account
                            .last_cursor
                            .entry(stream_type.as_str().to_string())
                            .or_default()
                            .clone_from(&batch.cursor);

                        if !batch.warnings.is_empty() {
                            tracing::warn!(
                                account_id = %account.id,
                                stream_type = stream_type.as_str(),
                                warnings = ?batch.warnings,
                                "import.warning"
                            );
                            session.fail(Utc::now(), format!("provider warnings: {:?}", batch.warnings));
                            return Ok(total_inserted);
                        }
                        if batch.is_complete {
                            break;
                        }
                    }
                    Err(err) => {
                        session.fail(Utc::now(), err.to_string());
                        return Err(RunnerError::Provider(err));
                    }
                }
            }
        }

        let previous_imported = session.transactions_imported;
        let previous_skipped = session.transactions_skipped;
        session.complete(Utc::now(), previous_imported + total_inserted, previous_skipped + total_skipped);

        Ok(total_inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountType, CursorValue};
    use crate::providers::reference::ScriptedProvider;
    use crate::providers::{ProviderKind, StreamingBatch};
    use crate::staging::reference::InMemoryStagingStore;
    use serde_json::json;

    fn raw_event(account_id: &str, event_id: &str) -> RawEvent {
        RawEvent {
            id: 0,
            account_id: account_id.to_string(),
            provider_name: "bitcoin-esplora".to_string(),
            external_id: event_id.to_string(),
            blockchain_tx_hash: Some(event_id.to_string()),
            event_id: event_id.to_string(),
            provider_data: json!({}),
            normalized_data: json!({}),
            timestamp: Utc::now(),
            stream_type: StreamType::from(StreamType::NORMAL),
            processing_status: crate::staging::ProcessingStatus::Pending,
            import_session_id: String::new(),
        }
    }

    fn scripted_batches(n: usize) -> Vec<StreamingBatch> {
        (0..n)
            .map(|i| StreamingBatch {
                raw_transactions: vec![raw_event("acct", &format!("tx{i}"))],
                stream_type: StreamType::from(StreamType::NORMAL),
                cursor: CursorState {
                    primary: Some(CursorValue::block_number(100 + i as u64)),
                    alternatives: vec![],
                    last_transaction_id: None,
                    total_fetched: i as u64 + 1,
                },
                is_complete: i + 1 == n,
                provider_stats: None,
                warnings: vec![],
            })
            .collect()
    }

    #[test]
    fn imports_all_batches_and_completes_session() {
        let staging = InMemoryStagingStore::new();
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(ScriptedProvider::new(
            "bitcoin-esplora",
            ProviderKind::Blockchain,
            scripted_batches(3),
        )));
        let deriver = DefaultAddressDeriver;
        let runner = ImportRunner::new(&staging, &registry, &deriver);

        let mut account = Account::new("acct", AccountType::Blockchain, "bitcoin", "bc1qxyz");
        account.parent_account_id = Some("parent".to_string()); // not xpub-style, single address
        account.provider_name = Some("bitcoin-esplora".to_string());

        let session = runner.import_from_source(&mut account).unwrap();
        assert_eq!(session.status, ImportSessionStatus::Completed);
        assert_eq!(session.transactions_imported, 3);
        assert_eq!(staging.all_rows("acct").len(), 3);
    }

    #[test]
    fn resuming_with_saved_cursor_imports_zero_new_and_leaves_count_unchanged() {
        let staging = InMemoryStagingStore::new();
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(ScriptedProvider::new(
            "bitcoin-esplora",
            ProviderKind::Blockchain,
            scripted_batches(3),
        )));
        let deriver = DefaultAddressDeriver;
        let runner = ImportRunner::new(&staging, &registry, &deriver);

        let mut account = Account::new("acct", AccountType::Blockchain, "bitcoin", "bc1qxyz");
        account.parent_account_id = Some("parent".to_string());
        account.provider_name = Some("bitcoin-esplora".to_string());

        runner.import_from_source(&mut account).unwrap();
        let rows_after_first = staging.all_rows("acct").len();

        // A fresh runner simulates a new process picking up the persisted account + staging.
        let runner2 = ImportRunner::new(&staging, &registry, &deriver);
        let session2 = runner2.import_from_source(&mut account).unwrap();

        assert_eq!(staging.all_rows("acct").len(), rows_after_first);
        assert_eq!(session2.transactions_imported, 0);
    }

    #[test]
    fn concurrent_import_on_same_account_is_refused() {
        let staging = InMemoryStagingStore::new();
        let registry = AdapterRegistry::new();
        let deriver = DefaultAddressDeriver;
        let runner = ImportRunner::new(&staging, &registry, &deriver);

        let _guard = runner.acquire_advisory_lock("acct").unwrap();
        let result = runner.acquire_advisory_lock("acct");
        assert!(matches!(result, Err(RunnerError::AlreadyRunning(_))));
    }
}
