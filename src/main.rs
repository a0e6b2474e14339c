use clap::{Parser, ValueEnum};
use miette::{IntoDiagnostic, Result, miette};
use payment_process::application::context::RunContext;
use payment_process::application::orchestrator::Orchestrator;
use payment_process::application::retry::RetryConfig;
use payment_process::config::{PoolConfig, RunConfig};
use payment_process::domain::claim::Claim;
use payment_process::domain::event::{PayeeType, RunMode};
use payment_process::domain::ports::Repositories;
use payment_process::domain::stats::RunStatus;
use payment_process::infrastructure::in_memory::InMemoryStore;
use payment_process::infrastructure::seed::Seed;
use payment_process::interfaces::csv::claim_reader::ClaimReader;
use payment_process::interfaces::json::seed_reader::SeedReader;
use payment_process::interfaces::json::stats_writer::StatsWriter;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input claims CSV file, one row per service line
    input: PathBuf,

    /// JSON seed with the payment event, existing payment centers, ledger and counters
    #[arg(long, env = "PAYMENT_SEED")]
    seed: Option<PathBuf>,

    /// Payment event to run. Defaults to the seed's event.
    #[arg(long, env = "PAYMENT_EVENT_ID")]
    event_id: Option<String>,

    /// `dry-run` or `final`
    #[arg(long, env = "PAYMENT_MODE", default_value = "dry-run")]
    mode: RunMode,

    /// Workers for every pool tier unless overridden below
    #[arg(long, env = "PAYMENT_WORKERS", default_value_t = 4)]
    workers: usize,

    #[arg(long, env = "PAYMENT_PC_WORKERS")]
    pc_workers: Option<usize>,

    #[arg(long, env = "PAYMENT_BATCH_WORKERS")]
    batch_workers: Option<usize>,

    #[arg(long, env = "PAYMENT_LINE_WORKERS")]
    line_workers: Option<usize>,

    #[arg(long, env = "PAYMENT_BATCH_SIZE", default_value_t = 1000)]
    batch_size: usize,

    /// Ids reserved per sequence chunk
    #[arg(long, env = "PAYMENT_CHUNK_SIZE", default_value_t = 1000)]
    chunk_size: u64,

    #[arg(long, env = "PAYMENT_MAX_IN_FLIGHT", default_value_t = 4)]
    max_in_flight: usize,

    #[arg(long, env = "PAYMENT_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Overrides the event's payee type (`provider` or `member`)
    #[arg(long, env = "PAYMENT_PAYEE_TYPE")]
    payee_type: Option<PayeeType>,

    /// Stop after initial validation
    #[arg(long, env = "PAYMENT_VALIDATE_ONLY")]
    validate_only: bool,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, env = "PAYMENT_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Convert legacy over/under documents in the database before running
    #[arg(long)]
    migrate_ledger: bool,

    #[arg(long, env = "PAYMENT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "PAYMENT_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

impl Cli {
    fn run_config(&self, event_id: String) -> RunConfig {
        let mut config = RunConfig::new(event_id, self.mode);
        config.pools = PoolConfig {
            payment_center_workers: self.pc_workers.unwrap_or(self.workers),
            claim_batch_workers: self.batch_workers.unwrap_or(self.workers),
            service_line_workers: self.line_workers.unwrap_or(self.workers),
        };
        config.batch_size = self.batch_size;
        config.sequence_chunk_size = self.chunk_size;
        config.max_in_flight = self.max_in_flight;
        config.retry = RetryConfig {
            max_retries: self.max_retries,
            ..RetryConfig::default()
        };
        config.payee_type = self.payee_type;
        config.validate_only = self.validate_only;
        config
    }
}

fn init_tracing(level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_new(level).into_diagnostic()?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

fn read_claims(cli: &Cli) -> Result<Vec<Claim>> {
    let file = File::open(&cli.input).into_diagnostic()?;
    let mut claims = Vec::new();
    for claim in ClaimReader::new(file).claims() {
        match claim {
            Ok(claim) => claims.push(claim),
            Err(e) => warn!(error = %e, "skipping malformed claim row"),
        }
    }
    Ok(claims)
}

#[cfg(feature = "storage-rocksdb")]
fn persistent_repositories(
    cli: &Cli,
    db_path: &std::path::Path,
    seed: Option<&Seed>,
    event_id: &str,
    claims: &[Claim],
) -> Result<Repositories> {
    use payment_process::infrastructure::rocksdb::RocksDBStore;

    let store = RocksDBStore::open(db_path).into_diagnostic()?;
    if cli.migrate_ledger {
        let migrated = store.migrate_legacy_over_under().into_diagnostic()?;
        info!(migrated, "legacy over/under documents migrated");
    }
    if let Some(seed) = seed {
        store.apply_seed(seed).into_diagnostic()?;
    }
    store.load_claims(event_id, claims).into_diagnostic()?;
    Ok(Repositories::from_store(store))
}

async fn in_memory_repositories(seed: Option<Seed>, event_id: &str, claims: Vec<Claim>) -> Repositories {
    let store = match seed {
        Some(seed) => InMemoryStore::from_seed(seed),
        None => InMemoryStore::new(),
    };
    store.load_claims(event_id, claims).await;
    Repositories::from_store(store)
}

async fn run(cli: Cli) -> Result<RunStatus> {
    init_tracing(&cli.log_level, cli.log_format)?;

    let seed = match &cli.seed {
        Some(path) => {
            let file = File::open(path).into_diagnostic()?;
            Some(SeedReader::new(file).read().into_diagnostic()?)
        }
        None => None,
    };
    let event_id = cli
        .event_id
        .clone()
        .or_else(|| seed.as_ref().map(|s| s.event.event_id.clone()))
        .ok_or_else(|| miette!("no payment event given: pass --event-id or --seed"))?;
    let claims = read_claims(&cli)?;
    info!(claims = claims.len(), event_id = %event_id, "claims loaded");

    let repos = match &cli.db_path {
        #[cfg(feature = "storage-rocksdb")]
        Some(db_path) => persistent_repositories(&cli, db_path, seed.as_ref(), &event_id, &claims)?,
        #[cfg(not(feature = "storage-rocksdb"))]
        Some(_) => {
            eprintln!(
                "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
            );
            in_memory_repositories(seed, &event_id, claims).await
        }
        None => {
            if cli.migrate_ledger {
                warn!("--migrate-ledger only applies to persistent storage; ignoring");
            }
            in_memory_repositories(seed, &event_id, claims).await
        }
    };

    let ctx = RunContext::new(repos, cli.run_config(event_id)).into_diagnostic()?;
    let stats = Orchestrator::new(ctx).run().await;

    let stdout = io::stdout();
    let mut writer = StatsWriter::new(stdout.lock());
    writer.write_stats(&stats).into_diagnostic()?;

    Ok(stats.status())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(RunStatus::Completed) => ExitCode::SUCCESS,
        Ok(RunStatus::Blocked) => ExitCode::from(1),
        Ok(_) => ExitCode::from(2),
        Err(report) => {
            eprintln!("{report:?}");
            ExitCode::from(2)
        }
    }
}
