#![forbid(unsafe_code)]

use is_terminal::IsTerminal as _;
use onlyargs::CliError;
use onlyargs_derive::OnlyArgs;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::{env, process::ExitCode};
use thiserror::Error;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

use taxcount::domain::account::{Account, AccountType};
use taxcount::domain::{Amount, Transaction, TransactionLink};
use taxcount::enrichment::{EnrichmentConfig, EnrichmentEngine};
use taxcount::errors::{EnrichmentError, LotMatchError, ProcessError, StagingError};
use taxcount::lotmatch::{LotMatchConfig, LotMatcher, SameAssetTransferFeePolicy};
use taxcount::cache::PriceCache;
use taxcount::domain::lot::Strategy;
use taxcount::process::reference::{ExchangeTradeTransform, InMemoryTransactionStore, UtxoTransform};
use taxcount::process::{ProcessService, SourceTransform};
use taxcount::providers::reference::TablePriceProvider;
use taxcount::staging::reference::InMemoryStagingStore;
use taxcount::staging::{RawEvent, StagingStore};

#[derive(Debug, OnlyArgs)]
#[footer = "Commands (--command):"]
#[footer = "  process   stage raw events from --scenario, run the Process Service, write transactions"]
#[footer = "  enrich    read transactions (+ a price table) from --scenario, run Price Enrichment"]
#[footer = "  lots      read transactions + links from --scenario, run the Lot Matcher"]
#[footer = "  view      pretty-print the transactions in --scenario as JSON (the TUI's data source)"]
struct Args {
    /// Which pipeline stage to run: process, enrich, lots, or view.
    #[default("view")]
    command: String,

    /// Scenario file: JSON describing an account, raw events, transactions, links, and/or a
    /// price table, per the fields the chosen --command consumes.
    #[long]
    scenario: Option<PathBuf>,

    /// Where to write the command's JSON output. Defaults to stdout.
    #[long]
    output: Option<PathBuf>,

    /// Lot-matching disposal strategy: fifo, lifo, or hifo.
    #[long]
    #[default("fifo")]
    strategy: String,

    /// Same-asset transfer fee policy: disposal or add-to-basis.
    #[long]
    #[default("disposal")]
    fee_policy: String,

    /// Maximum Price Enrichment convergence iterations.
    #[long]
    #[default(10)]
    max_iterations: u32,

    /// Enable the FX normalization sub-pass.
    #[long]
    fx_normalize: bool,

    /// Enable verbose output (raises the default log level from info to debug).
    #[long]
    verbose: bool,
}

#[derive(Debug, Error)]
enum Error {
    #[error("argument parsing error")]
    Args(#[from] CliError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("JSON error")]
    Json(#[from] serde_json::Error),

    #[error("unrecognized --command {0:?} (expected process, enrich, lots, or view)")]
    UnknownCommand(String),

    #[error("unrecognized --strategy {0:?} (expected fifo, lifo, or hifo)")]
    UnknownStrategy(String),

    #[error("unrecognized --fee-policy {0:?} (expected disposal or add-to-basis)")]
    UnknownFeePolicy(String),

    #[error("--scenario is required for --command {0}")]
    MissingScenario(String),

    #[error("unrecognized --transform {0:?} in scenario (expected utxo or exchange)")]
    UnknownTransform(String),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Enrichment(#[from] EnrichmentError),

    #[error(transparent)]
    LotMatch(#[from] LotMatchError),
}

/// Everything one CLI invocation might need, loaded from a single JSON file so the demonstration
/// binary doesn't need a real database. §6's "JSON output is the contract" extends naturally to
/// JSON input here, since no concrete exchange/blockchain wire format is in scope (§1 Non-goals).
#[derive(Debug, Default, Deserialize)]
struct Scenario {
    account: Option<Account>,
    #[serde(default)]
    self_addresses: Vec<String>,
    #[serde(default = "default_transform")]
    transform: String,
    #[serde(default)]
    raw_events: Vec<RawEvent>,
    #[serde(default)]
    transactions: Vec<Transaction>,
    #[serde(default)]
    links: Vec<TransactionLink>,
    #[serde(default)]
    prices: Vec<ScenarioPrice>,
    #[serde(default)]
    fx_rates: Vec<ScenarioPrice>,
}

fn default_transform() -> String {
    "utxo".to_string()
}

#[derive(Clone, Debug, Deserialize)]
struct ScenarioPrice {
    asset: String,
    currency: String,
    day_bucket: i64,
    amount: Amount,
}

fn load_table_provider(name: &str, prices: &[ScenarioPrice]) -> TablePriceProvider {
    prices.iter().fold(TablePriceProvider::new(name), |provider, p| {
        provider.with_price(&p.asset, &p.currency, p.day_bucket, p.amount)
    })
}

fn load_scenario(path: &Option<PathBuf>, command: &str) -> Result<Scenario, Error> {
    match path {
        Some(path) => Ok(serde_json::from_str(&fs::read_to_string(path)?)?),
        None => Err(Error::MissingScenario(command.to_string())),
    }
}

fn write_json<T: Serialize>(output: &Option<PathBuf>, value: &T) -> Result<(), Error> {
    let rendered = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => fs::write(path, rendered)?,
        None => {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            writeln!(lock, "{rendered}")?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = onlyargs::parse();
    let verbose = args.as_ref().map(|a| a.verbose).unwrap_or(false);
    let default_level = if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };

    let env_filter = EnvFilter::builder().with_default_directive(default_level.into()).from_env_lossy();
    let term_color = env::var("TERM_COLOR")
        .map(|color| color == "always")
        .unwrap_or_else(|_| std::io::stdout().is_terminal());
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_ansi(term_color))
        .with(env_filter)
        .init();

    match run(args) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", taxcount::errors::format_chain(&err));
            ExitCode::FAILURE
        }
    }
}

fn run(args: Result<Args, CliError>) -> Result<(), Error> {
    let args = args?;

    match args.command.as_str() {
        "process" => run_process(&args),
        "enrich" => run_enrich(&args),
        "lots" => run_lots(&args),
        "view" => run_view(&args),
        other => Err(Error::UnknownCommand(other.to_string())),
    }
}

/// §4.C: stage raw events, then run the Process Service's hash-grouped transform over them.
fn run_process(args: &Args) -> Result<(), Error> {
    let scenario = load_scenario(&args.scenario, "process")?;
    let account = scenario.account.clone().unwrap_or_else(|| {
        Account::new("demo-account", AccountType::Blockchain, "demo", "demo-identifier")
    });

    let staging = InMemoryStagingStore::new();
    staging.save_batch(&account.id, scenario.raw_events);

    let transactions_store = InMemoryTransactionStore::new();
    let service = ProcessService::new(&staging, &transactions_store);

    let transform: Box<dyn SourceTransform> = match scenario.transform.as_str() {
        "utxo" => Box::new(UtxoTransform),
        "exchange" => Box::new(ExchangeTradeTransform),
        other => return Err(Error::UnknownTransform(other.to_string())),
    };

    let self_addresses: HashSet<String> = scenario.self_addresses.into_iter().collect();
    let summary = service.process_account_transactions_chunked(&account, transform.as_ref(), &self_addresses, 500);

    #[derive(Serialize)]
    struct ProcessOutput {
        processed_groups: usize,
        failed_groups: usize,
        errors: Vec<String>,
        transactions: Vec<Transaction>,
        links: Vec<TransactionLink>,
    }

    write_json(
        &args.output,
        &ProcessOutput {
            processed_groups: summary.processed,
            failed_groups: summary.failed,
            errors: summary.errors.iter().map(|e| e.message.clone()).collect(),
            transactions: transactions_store.all(),
            links: summary.links,
        },
    )
}

/// §4.D: run the 5-pass Price Enrichment engine to convergence over the scenario's transactions.
fn run_enrich(args: &Args) -> Result<(), Error> {
    let scenario = load_scenario(&args.scenario, "enrich")?;
    let mut transactions = scenario.transactions;

    let crypto_provider = load_table_provider("scenario-crypto", &scenario.prices);
    let crypto_cache = PriceCache::new(&crypto_provider);
    let fx_provider = load_table_provider("scenario-fx", &scenario.fx_rates);
    let fx_cache = PriceCache::new(&fx_provider);

    let config = EnrichmentConfig {
        max_iterations: args.max_iterations,
        fx_normalization_enabled: args.fx_normalize,
    };

    let mut engine = EnrichmentEngine::new(&scenario.links, &crypto_cache, config);
    if args.fx_normalize {
        engine = engine.with_fx_cache(&fx_cache);
    }
    let report = engine.run(&mut transactions)?;

    #[derive(Serialize)]
    struct EnrichOutput {
        iterations: u32,
        prices_added: usize,
        transactions: Vec<Transaction>,
    }

    write_json(
        &args.output,
        &EnrichOutput {
            iterations: report.iterations,
            prices_added: report.prices_added,
            transactions,
        },
    )
}

fn parse_strategy(s: &str) -> Result<Strategy, Error> {
    match s {
        "fifo" => Ok(Strategy::Fifo),
        "lifo" => Ok(Strategy::Lifo),
        "hifo" => Ok(Strategy::Hifo),
        other => Err(Error::UnknownStrategy(other.to_string())),
    }
}

fn parse_fee_policy(s: &str) -> Result<SameAssetTransferFeePolicy, Error> {
    match s {
        "disposal" => Ok(SameAssetTransferFeePolicy::Disposal),
        "add-to-basis" => Ok(SameAssetTransferFeePolicy::AddToBasis),
        other => Err(Error::UnknownFeePolicy(other.to_string())),
    }
}

/// §4.E: compute the topological order and run the FIFO/LIFO/HIFO lot matcher.
fn run_lots(args: &Args) -> Result<(), Error> {
    let scenario = load_scenario(&args.scenario, "lots")?;

    let config = LotMatchConfig {
        strategy: parse_strategy(&args.strategy)?,
        fee_policy: parse_fee_policy(&args.fee_policy)?,
        ..LotMatchConfig::default()
    };

    let matcher = LotMatcher::new(config);
    let report = matcher.run("cli-calculation", &scenario.transactions, scenario.links)?;

    write_json(&args.output, &report)
}

/// §6 `transactions view --json`: the TUI is purely a renderer over this JSON.
fn run_view(args: &Args) -> Result<(), Error> {
    let scenario = load_scenario(&args.scenario, "view")?;
    write_json(&args.output, &scenario.transactions)
}
