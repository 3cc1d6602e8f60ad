//! CLI definition and dispatch.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::adapters::cached_portfolio::{CachedPositionSource, DEFAULT_CACHE_TTL_SECS};
use crate::adapters::csv_adapter::{CsvAdapter, read_bars};
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::file_evaluator::FileEvaluator;
use crate::adapters::log_audit::LogAuditSink;
use crate::adapters::memory_lock::MemoryLockRegistry;
use crate::adapters::paper_broker::{MarkingBarSource, PaperBroker, PaperSettings};
use crate::domain::config_validation::{
    DatabaseBackend, build_lifecycle_settings, build_orchestrator_settings, build_queue_settings,
    build_risk_limits, data_dir, database_backend, evaluations_dir, log_level, max_history_limit,
    trading_env, validate_config,
};
use crate::domain::engine::{EngineContext, StrategyEngine};
use crate::domain::error::LifecycleError;
use crate::domain::lifecycle::{
    CLOSE_PRIORITY, LifecycleDeps, LifecycleManager, LifecycleOutcome, close_key,
};
use crate::domain::lock::LockService;
use crate::domain::operation::{EnqueueRequest, OperationPayload, OperationStatus};
use crate::domain::orchestrator::{InstanceSet, Orchestrator};
use crate::domain::order::TradingEnv;
use crate::domain::program::{check_history_limit, compile, load_program};
use crate::domain::queue::OperationQueue;
use crate::domain::risk::{KillSwitch, RiskLimits};
use crate::domain::strategy::{NewStrategy, Strategy, StrategyStatus};
use crate::ports::audit_port::AuditSink;
use crate::ports::clock_port::{Clock, SystemClock};
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::BarSource;
use crate::ports::lock_port::AdvisoryLockPort;
use crate::ports::operation_store_port::OperationStore;
use crate::ports::portfolio_port::PositionSource;
use crate::ports::strategy_store_port::StrategyStore;

#[cfg(not(any(feature = "sqlite", feature = "postgres")))]
compile_error!("enable the sqlite or postgres feature");

#[derive(Parser, Debug)]
#[command(name = "stratlife", about = "Strategy lifecycle orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the database schema
    InitDb {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Validate a config file and/or a strategy program
    Validate {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long)]
        strategy: Option<PathBuf>,
    },
    /// Register a strategy program; the orchestrator starts it on its next cycle
    Register {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        strategy: PathBuf,
        #[arg(long, default_value = "operator")]
        owner: String,
    },
    /// Load bars from a CSV file into the database
    ImportBars {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        timeframe: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Run a strategy program over CSV bars
    Replay {
        #[arg(short, long)]
        strategy: PathBuf,
        #[arg(long)]
        bars: PathBuf,
        /// Execute actions against a paper broker instead of suppressing them
        #[arg(long)]
        execute: bool,
    },
    /// Run the orchestrator loop
    Run {
        #[arg(short, long)]
        config: PathBuf,
        /// Stop after this many cycles
        #[arg(long)]
        cycles: Option<u64>,
    },
    /// Close a strategy
    Close {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        id: i64,
        #[arg(long, default_value = "operator close")]
        reason: String,
        /// Execute in this process instead of queueing for the orchestrator
        #[arg(long)]
        now: bool,
    },
    /// Show a strategy and its versions
    Status {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        id: i64,
    },
    /// Inspect and repair the operation queue
    Queue {
        #[command(subcommand)]
        action: QueueCommand,
    },
    /// Report whether a strategy's lifecycle lock is held
    LockStatus {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        id: i64,
    },
}

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
    /// List operations, optionally filtered by status
    List {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        status: Option<String>,
    },
    /// Return operations with expired leases to pending
    Recover {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Cancel a pending operation
    Cancel {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        id: i64,
    },
}

impl Cli {
    /// Path of the process config file, when the command takes one.
    pub fn config_path(&self) -> Option<&Path> {
        match &self.command {
            Command::InitDb { config }
            | Command::Register { config, .. }
            | Command::ImportBars { config, .. }
            | Command::Run { config, .. }
            | Command::Close { config, .. }
            | Command::Status { config, .. }
            | Command::LockStatus { config, .. } => Some(config),
            Command::Validate { config, .. } => config.as_deref(),
            Command::Replay { .. } => None,
            Command::Queue { action } => match action {
                QueueCommand::List { config, .. }
                | QueueCommand::Recover { config }
                | QueueCommand::Cancel { config, .. } => Some(config),
            },
        }
    }
}

/// Install the process logger. `RUST_LOG` wins over `[logging] level`.
pub fn init_logging(cli: &Cli) {
    let level = cli
        .config_path()
        .and_then(|path| FileConfigAdapter::from_file(path).ok())
        .and_then(|config| log_level(&config))
        .unwrap_or_else(|| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

pub fn run(cli: Cli) -> ExitCode {
    let result = match cli.command {
        Command::InitDb { config } => run_init_db(&config),
        Command::Validate { config, strategy } => run_validate(config.as_deref(), strategy.as_deref()),
        Command::Register {
            config,
            strategy,
            owner,
        } => run_register(&config, &strategy, &owner),
        Command::ImportBars {
            config,
            symbol,
            timeframe,
            file,
        } => run_import_bars(&config, &symbol, &timeframe, &file),
        Command::Replay {
            strategy,
            bars,
            execute,
        } => run_replay(&strategy, &bars, execute),
        Command::Run { config, cycles } => run_orchestrator(&config, cycles),
        Command::Close {
            config,
            id,
            reason,
            now,
        } => run_close(&config, id, &reason, now),
        Command::Status { config, id } => run_status(&config, id),
        Command::Queue { action } => match action {
            QueueCommand::List { config, status } => run_queue_list(&config, status.as_deref()),
            QueueCommand::Recover { config } => run_queue_recover(&config),
            QueueCommand::Cancel { config, id } => run_queue_cancel(&config, id),
        },
        Command::LockStatus { config, id } => run_lock_status(&config, id),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

pub fn load_config(path: &Path) -> Result<FileConfigAdapter, LifecycleError> {
    FileConfigAdapter::from_file(path)
}

pub fn build_paper_settings(config: &dyn ConfigPort) -> PaperSettings {
    PaperSettings {
        slippage_pct: config.get_double("broker", "slippage_pct", 0.0),
        commission_per_trade: config.get_double("broker", "commission_per_trade", 0.0),
    }
}

/// Load a strategy program and check it against the process history cap.
pub fn load_checked_program(
    strategy_path: &Path,
    owner: &str,
    max_history: usize,
) -> Result<NewStrategy, LifecycleError> {
    let program_config = load_config(strategy_path)?;
    let strategy = load_program(&program_config, owner)?;
    check_history_limit(&strategy.program, max_history)?;
    Ok(strategy)
}

struct Stores {
    strategies: Arc<dyn StrategyStore>,
    operations: Arc<dyn OperationStore>,
    audit: Arc<dyn AuditSink>,
}

enum Database {
    #[cfg(feature = "sqlite")]
    Sqlite(Arc<crate::adapters::sqlite::SqliteAdapter>),
    #[cfg(feature = "postgres")]
    Postgres(Arc<crate::adapters::postgres_adapter::PostgresAdapter>),
}

#[cfg(not(all(feature = "sqlite", feature = "postgres")))]
fn backend_missing(name: &str) -> LifecycleError {
    LifecycleError::ConfigInvalid {
        section: "database".into(),
        key: "backend".into(),
        reason: format!("{name} support is not compiled in"),
    }
}

impl Database {
    fn open(config: &dyn ConfigPort) -> Result<Self, LifecycleError> {
        match database_backend(config)? {
            #[cfg(feature = "sqlite")]
            DatabaseBackend::Sqlite => Ok(Database::Sqlite(Arc::new(
                crate::adapters::sqlite::SqliteAdapter::from_config(config)?,
            ))),
            #[cfg(not(feature = "sqlite"))]
            DatabaseBackend::Sqlite => Err(backend_missing("sqlite")),
            #[cfg(feature = "postgres")]
            DatabaseBackend::Postgres => Ok(Database::Postgres(Arc::new(
                crate::adapters::postgres_adapter::PostgresAdapter::from_config(config)?,
            ))),
            #[cfg(not(feature = "postgres"))]
            DatabaseBackend::Postgres => Err(backend_missing("postgres")),
        }
    }

    fn initialize_schema(&self) -> Result<(), LifecycleError> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::Sqlite(db) => db.initialize_schema(),
            #[cfg(feature = "postgres")]
            Database::Postgres(db) => db.initialize_schema(),
        }
    }

    fn stores(&self) -> Stores {
        match self {
            #[cfg(feature = "sqlite")]
            Database::Sqlite(db) => Stores {
                strategies: db.clone(),
                operations: db.clone(),
                audit: db.clone(),
            },
            #[cfg(feature = "postgres")]
            Database::Postgres(db) => Stores {
                strategies: db.clone(),
                operations: db.clone(),
                audit: db.clone(),
            },
        }
    }

    fn insert_bars(&self, timeframe: &str, bars: &[crate::domain::bar::Bar]) -> Result<usize, LifecycleError> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::Sqlite(db) => db.insert_bars(timeframe, bars).map(|()| bars.len()),
            #[cfg(feature = "postgres")]
            Database::Postgres(db) => db.insert_bars(timeframe, bars),
        }
    }

    /// Stored bars, read through a second pool so the orchestrator owns it.
    fn bar_source(&self, config: &dyn ConfigPort) -> Result<Box<dyn BarSource>, LifecycleError> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::Sqlite(_) => Ok(Box::new(
                crate::adapters::sqlite::SqliteAdapter::from_config(config)?,
            )),
            #[cfg(feature = "postgres")]
            Database::Postgres(_) => Ok(Box::new(
                crate::adapters::postgres_adapter::PostgresAdapter::from_config(config)?,
            )),
        }
    }

    /// SQLite deployments coordinate within one process only.
    fn lock_backend(&self, config: &dyn ConfigPort) -> Result<Arc<dyn AdvisoryLockPort>, LifecycleError> {
        let _ = config;
        match self {
            #[cfg(feature = "sqlite")]
            Database::Sqlite(_) => Ok(Arc::new(MemoryLockRegistry::new().session())),
            #[cfg(feature = "postgres")]
            Database::Postgres(_) => Ok(Arc::new(
                crate::adapters::postgres_adapter::PgAdvisoryLock::from_config(config)?,
            )),
        }
    }
}

struct Services {
    db: Database,
    strategies: Arc<dyn StrategyStore>,
    queue: Arc<OperationQueue>,
    broker: Arc<PaperBroker>,
    ctx: EngineContext,
    lifecycle: LifecycleManager,
}

fn build_services(config: &dyn ConfigPort) -> Result<Services, LifecycleError> {
    validate_config(config)?;
    let env = trading_env(config)?;
    if env == TradingEnv::Live {
        return Err(LifecycleError::ConfigInvalid {
            section: "broker".into(),
            key: "env".into(),
            reason: "only the paper broker is built in; live needs a broker adapter".into(),
        });
    }

    let db = Database::open(config)?;
    db.initialize_schema()?;
    let stores = db.stores();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let broker = Arc::new(PaperBroker::new(build_paper_settings(config)));
    let cache_ttl = config.get_int("broker", "position_cache_secs", DEFAULT_CACHE_TTL_SECS);
    let positions: Arc<dyn PositionSource> = Arc::new(CachedPositionSource::new(
        broker.clone(),
        clock.clone(),
        chrono::Duration::seconds(cache_ttl.max(0)),
    ));

    let queue = Arc::new(OperationQueue::new(
        stores.operations.clone(),
        clock.clone(),
        build_queue_settings(config)?,
    ));
    let locks = Arc::new(LockService::new(db.lock_backend(config)?));
    let (limits, kill_switch) = build_risk_limits(config)?;

    let lifecycle = LifecycleManager::new(
        LifecycleDeps {
            strategies: stores.strategies.clone(),
            queue: queue.clone(),
            locks,
            broker: broker.clone(),
            positions: positions.clone(),
            evaluator: Arc::new(FileEvaluator::new(evaluations_dir(config), true)),
            audit: stores.audit.clone(),
            clock: clock.clone(),
            env,
        },
        build_lifecycle_settings(config)?,
    );
    let ctx = EngineContext {
        broker: broker.clone(),
        positions,
        audit: stores.audit.clone(),
        clock,
        env,
        limits,
        kill_switch: KillSwitch::new(kill_switch),
    };

    Ok(Services {
        db,
        strategies: stores.strategies,
        queue,
        broker,
        ctx,
        lifecycle,
    })
}

fn run_init_db(config_path: &Path) -> Result<(), LifecycleError> {
    let config = load_config(config_path)?;
    validate_config(&config)?;
    Database::open(&config)?.initialize_schema()?;
    eprintln!("Database schema initialized");
    Ok(())
}

fn run_validate(config_path: Option<&Path>, strategy_path: Option<&Path>) -> Result<(), LifecycleError> {
    if config_path.is_none() && strategy_path.is_none() {
        return Err(LifecycleError::ConfigMissing {
            section: "cli".into(),
            key: "--config or --strategy".into(),
        });
    }

    let mut max_history = crate::domain::config_validation::DEFAULT_MAX_HISTORY_LIMIT;
    if let Some(path) = config_path {
        eprintln!("Validating config: {}", path.display());
        let config = load_config(path)?;
        validate_config(&config)?;
        max_history = max_history_limit(&config)?;
        eprintln!("  backend: {:?}", database_backend(&config)?);
        eprintln!("  env:     {:?}", trading_env(&config)?);
        eprintln!("Config is valid.");
    }

    if let Some(path) = strategy_path {
        eprintln!("\nValidating strategy: {}", path.display());
        let strategy = load_checked_program(path, "operator", max_history)?;
        let compiled = compile(&strategy.program)?;
        eprintln!("  name:      {}", strategy.name);
        eprintln!("  symbol:    {} ({})", strategy.symbol, strategy.timeframe);
        eprintln!("  states:    {}", strategy.program.states.join(", "));
        eprintln!("  initial:   {}", compiled.initial_state());
        eprintln!("  history:   {} bars", compiled.history_limit());
        for feature in &strategy.program.features {
            eprintln!("  feature    {}", feature.name);
        }
        for transition in &compiled.transitions {
            eprintln!(
                "  transition {}: {} -> {} when {}",
                transition.name, transition.from, transition.to, transition.guard
            );
        }
        eprintln!("Strategy program is valid.");
    }
    Ok(())
}

fn run_register(config_path: &Path, strategy_path: &Path, owner: &str) -> Result<(), LifecycleError> {
    let config = load_config(config_path)?;
    validate_config(&config)?;
    let new = load_checked_program(strategy_path, owner, max_history_limit(&config)?)?;

    let db = Database::open(&config)?;
    db.initialize_schema()?;
    let strategies = db.stores().strategies;
    let now = SystemClock.now();
    let strategy = strategies.insert(&new, None, now)?;
    strategies.set_status(strategy.id, StrategyStatus::Pending, now)?;

    eprintln!(
        "Registered strategy {} '{}' on {} ({}), pending activation",
        strategy.id, strategy.name, strategy.symbol, strategy.timeframe
    );
    println!("{}", strategy.id);
    Ok(())
}

fn run_import_bars(config_path: &Path, symbol: &str, timeframe: &str, file: &Path) -> Result<(), LifecycleError> {
    let config = load_config(config_path)?;
    let db = Database::open(&config)?;
    db.initialize_schema()?;
    let bars = read_bars(file, symbol)?;
    let written = db.insert_bars(timeframe, &bars)?;
    eprintln!("Imported {written} of {} bars for {symbol} ({timeframe})", bars.len());
    Ok(())
}

fn run_replay(strategy_path: &Path, bars_path: &Path, execute: bool) -> Result<(), LifecycleError> {
    let new = load_checked_program(
        strategy_path,
        "replay",
        crate::domain::config_validation::DEFAULT_MAX_HISTORY_LIMIT,
    )?;
    let bars = read_bars(bars_path, &new.symbol)?;
    eprintln!(
        "Replaying {} bars of {} through '{}' ({})",
        bars.len(),
        new.symbol,
        new.name,
        if execute { "paper execution" } else { "actions suppressed" }
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let broker = Arc::new(PaperBroker::new(PaperSettings::default()));
    let audit = Arc::new(LogAuditSink::new());
    let ctx = EngineContext {
        broker: broker.clone(),
        positions: broker.clone(),
        audit: audit.clone(),
        clock: clock.clone(),
        env: TradingEnv::Paper,
        limits: RiskLimits::default(),
        kill_switch: KillSwitch::new(false),
    };
    let strategy = Strategy {
        id: 0,
        lineage_id: 0,
        version: 1,
        name: new.name,
        owner: new.owner,
        symbol: new.symbol,
        timeframe: new.timeframe,
        status: StrategyStatus::Active,
        program: new.program,
        activated_at: None,
        closed_at: None,
        close_reason: None,
        runtime_snapshot: None,
        created_at: clock.now(),
    };
    let mut engine = StrategyEngine::new(strategy, ctx)?;

    let mut transitions = 0;
    for bar in &bars {
        if execute {
            broker.mark(bar);
        }
        let outcome = engine.process_bar(bar, !execute);
        if let Some(fired) = outcome.transition {
            transitions += 1;
            println!(
                "{}  {} -> {}  ({})",
                bar.timestamp.to_rfc3339(),
                fired.from,
                fired.to,
                fired.name
            );
        }
    }

    eprintln!("\n=== Replay Summary ===");
    eprintln!("Bars:          {}", engine.bar_count());
    eprintln!("Transitions:   {transitions}");
    eprintln!("Final state:   {}", engine.state());
    for (kind, count) in audit.counts() {
        eprintln!("  {kind:<20} {count}");
    }
    if execute {
        let symbol = engine.symbol().to_string();
        eprintln!("Net position:  {}", broker.net_quantity(&symbol, true)?);
        eprintln!("P&L:           {:.2}", broker.daily_pnl()?);
    }
    Ok(())
}

fn run_orchestrator(config_path: &Path, cycles: Option<u64>) -> Result<(), LifecycleError> {
    eprintln!("Loading config from {}", config_path.display());
    let config = load_config(config_path)?;
    let services = build_services(&config)?;

    let bar_source = config
        .get_string("orchestrator", "bar_source")
        .unwrap_or_else(|| "csv".to_string());
    let inner: Box<dyn BarSource> = match bar_source.trim().to_lowercase().as_str() {
        "csv" => Box::new(CsvAdapter::new(data_dir(&config))),
        "database" => services.db.bar_source(&config)?,
        other => {
            return Err(LifecycleError::ConfigInvalid {
                section: "orchestrator".into(),
                key: "bar_source".into(),
                reason: format!("unknown bar source '{other}', expected csv or database"),
            });
        }
    };
    let bars = Box::new(MarkingBarSource::new(inner, services.broker.clone()));

    let mut orchestrator = Orchestrator::new(
        services.strategies,
        bars,
        services.queue,
        services.lifecycle,
        services.ctx,
        build_orchestrator_settings(&config)?,
    );
    let stop = AtomicBool::new(false);
    let ran = orchestrator.run(&stop, cycles)?;
    eprintln!(
        "Orchestrator ran {ran} cycle(s); {} instance(s) running at exit",
        orchestrator.instances().len()
    );
    Ok(())
}

fn run_close(config_path: &Path, id: i64, reason: &str, now: bool) -> Result<(), LifecycleError> {
    let config = load_config(config_path)?;
    let services = build_services(&config)?;
    let lock_timeout = build_lifecycle_settings(&config)?.lock_timeout;
    let strategy = services
        .strategies
        .get(id)?
        .ok_or(LifecycleError::StrategyNotFound { id })?;

    if !now {
        let request = EnqueueRequest::new(
            close_key(id, &strategy.symbol),
            OperationPayload::Close {
                strategy_id: id,
                reason: reason.to_string(),
            },
        )
        .with_symbol(strategy.symbol.clone())
        .with_priority(CLOSE_PRIORITY);
        let operation_id = services.queue.enqueue(&request)?;
        eprintln!("Queued close of strategy {id} as operation {operation_id}");
        println!("{operation_id}");
        return Ok(());
    }

    let mut runtime = InstanceSet::new(services.ctx);
    match services.lifecycle.close(&mut runtime, id, reason)? {
        LifecycleOutcome::Applied { operation_id, .. } => {
            eprintln!("Closed strategy {id} (operation {operation_id})");
        }
        LifecycleOutcome::AlreadyCompleted { operation_id, .. } => {
            eprintln!("Strategy {id} was already closed by operation {operation_id}");
        }
        LifecycleOutcome::LockContended { operation_id } => {
            eprintln!("Strategy {id} is locked by another lifecycle operation; operation {operation_id} will retry");
            return Err(LifecycleError::LockContention {
                key: crate::domain::lock::strategy_lock_key(id),
                timeout_ms: lock_timeout.as_millis() as u64,
            });
        }
        LifecycleOutcome::NotClaimed { operation_id, status } => {
            let status = status.map(|s| s.to_string()).unwrap_or_else(|| "missing".into());
            eprintln!("Operation {operation_id} is {status}; nothing was run");
        }
        LifecycleOutcome::Kept { reason } => eprintln!("Kept: {reason}"),
    }
    Ok(())
}

fn run_status(config_path: &Path, id: i64) -> Result<(), LifecycleError> {
    let config = load_config(config_path)?;
    let db = Database::open(&config)?;
    let strategies = db.stores().strategies;
    let strategy = strategies
        .get(id)?
        .ok_or(LifecycleError::StrategyNotFound { id })?;

    println!("Strategy {} v{}: {}", strategy.id, strategy.version, strategy.name);
    println!("  symbol:    {} ({})", strategy.symbol, strategy.timeframe);
    println!("  status:    {}", strategy.status);
    if let Some(at) = strategy.activated_at {
        println!("  activated: {}", at.to_rfc3339());
    }
    if let Some(at) = strategy.closed_at {
        println!(
            "  closed:    {} ({})",
            at.to_rfc3339(),
            strategy.close_reason.as_deref().unwrap_or("")
        );
    }
    if let Some(snapshot) = &strategy.runtime_snapshot {
        if let Some(state) = snapshot.get("state").and_then(|s| s.as_str()) {
            println!("  state:     {state}");
        }
    }

    println!("\nVersions:");
    for version in strategies.versions(strategy.lineage_id)? {
        let marker = if version.id == strategy.id { "*" } else { " " };
        println!(
            " {marker} v{:<3} id {:<6} {}",
            version.version, version.id, version.status
        );
    }
    Ok(())
}

fn open_queue(config: &dyn ConfigPort) -> Result<OperationQueue, LifecycleError> {
    let db = Database::open(config)?;
    Ok(OperationQueue::new(
        db.stores().operations,
        Arc::new(SystemClock),
        build_queue_settings(config)?,
    ))
}

fn run_queue_list(config_path: &Path, status: Option<&str>) -> Result<(), LifecycleError> {
    let config = load_config(config_path)?;
    let filter = status
        .map(|s| {
            OperationStatus::parse(&s.to_lowercase()).ok_or_else(|| LifecycleError::ConfigInvalid {
                section: "cli".into(),
                key: "--status".into(),
                reason: format!("unknown status '{s}'"),
            })
        })
        .transpose()?;
    let operations = open_queue(&config)?.list(filter)?;

    if operations.is_empty() {
        eprintln!("No operations");
        return Ok(());
    }
    println!(
        "{:<6} {:<10} {:<8} {:<8} {:<4} {:<7} key",
        "id", "status", "type", "strategy", "pri", "retries"
    );
    for op in &operations {
        println!(
            "{:<6} {:<10} {:<8} {:<8} {:<4} {:<7} {}{}",
            op.id,
            op.status,
            op.op_type,
            op.strategy_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into()),
            op.priority,
            format!("{}/{}", op.retry_count, op.max_retries),
            op.idempotency_key,
            op.error
                .as_deref()
                .map(|e| format!("  ({e})"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn run_queue_recover(config_path: &Path) -> Result<(), LifecycleError> {
    let config = load_config(config_path)?;
    let released = open_queue(&config)?.release_stuck_locks()?;
    eprintln!("Returned {released} operation(s) with expired leases to pending");
    Ok(())
}

fn run_queue_cancel(config_path: &Path, id: i64) -> Result<(), LifecycleError> {
    let config = load_config(config_path)?;
    let queue = open_queue(&config)?;
    if queue.cancel(id)? {
        eprintln!("Cancelled operation {id}");
        return Ok(());
    }
    match queue.get(id)? {
        Some(op) => {
            eprintln!("Operation {id} is {}; only pending operations can be cancelled", op.status);
            Ok(())
        }
        None => Err(LifecycleError::OperationNotFound { id }),
    }
}

fn run_lock_status(config_path: &Path, id: i64) -> Result<(), LifecycleError> {
    let config = load_config(config_path)?;
    let services = build_services(&config)?;
    let locked = services.lifecycle.is_strategy_locked(id)?;
    println!(
        "strategy {id}: {}",
        if locked { "locked" } else { "unlocked" }
    );
    Ok(())
}
