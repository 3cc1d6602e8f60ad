//! CLI integration tests against real INI, CSV and SQLite files on disk.
//!
//! Tests cover:
//! - Config and strategy helpers (load_checked_program, build_paper_settings)
//! - validate / register / status
//! - run: activation of registered strategies, queued closes
//! - queue list / recover / cancel and lock-status
//! - replay over a CSV file
//! - Exit codes for missing and invalid inputs

use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use stratlife::adapters::file_config_adapter::FileConfigAdapter;
use stratlife::adapters::sqlite::SqliteAdapter;
use stratlife::cli::{self, Cli};
use stratlife::domain::error::LifecycleError;
use stratlife::domain::operation::{Operation, OperationStatus};
use stratlife::domain::strategy::{Strategy, StrategyStatus};
use stratlife::ports::operation_store_port::OperationStore;
use stratlife::ports::strategy_store_port::StrategyStore;
use tempfile::TempDir;

const STRATEGY_INI: &str = r#"
[strategy]
name = Opening Breakout
symbol = spy
timeframe = 1m
states = WAITING, ARMED
initial = WAITING
transitions = arm
history_limit = 50

[transition.arm]
from = WAITING
to = ARMED
guard = close > 100
actions = submit_order_plan
side = buy
quantity = 10
"#;

const BARS_CSV: &str = "timestamp,open,high,low,close,volume\n\
    2024-01-02 09:30:00,98.0,99.5,97.5,99.0,1000\n\
    2024-01-02 09:31:00,99.0,101.5,98.5,101.0,1500\n\
    2024-01-02 09:32:00,101.0,102.0,100.5,101.5,1200\n";

/// A deployment directory: config, database, data and evaluation folders.
struct Deployment {
    dir: TempDir,
}

impl Deployment {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("data")).unwrap();
        fs::create_dir_all(root.join("evaluations")).unwrap();
        fs::write(root.join("data").join("SPY_1m.csv"), BARS_CSV).unwrap();
        fs::write(root.join("strategy.ini"), STRATEGY_INI).unwrap();
        let config = format!(
            r#"
[database]
backend = sqlite

[sqlite]
path = {db}
pool_size = 2

[broker]
env = paper
slippage_pct = 0.001
commission_per_trade = 1.5

[queue]
max_retries = 3

[lifecycle]
lock_timeout_ms = 100
flatten_timeout_ms = 200
flatten_poll_ms = 10

[orchestrator]
data_dir = {data}
evaluations_dir = {evals}
poll_interval_ms = 1
"#,
            db = root.join("stratlife.db").display(),
            data = root.join("data").display(),
            evals = root.join("evaluations").display(),
        );
        fs::write(root.join("config.ini"), config).unwrap();
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn config(&self) -> String {
        self.path("config.ini").display().to_string()
    }

    fn strategy_file(&self) -> String {
        self.path("strategy.ini").display().to_string()
    }

    fn run(&self, args: &[&str]) -> ExitCode {
        let mut argv = vec!["stratlife"];
        argv.extend_from_slice(args);
        cli::run(Cli::parse_from(argv))
    }

    fn db(&self) -> SqliteAdapter {
        SqliteAdapter::open(self.path("stratlife.db").to_str().unwrap(), 1).unwrap()
    }

    fn stored(&self, id: i64) -> Strategy {
        StrategyStore::get(&self.db(), id).unwrap().unwrap()
    }

    fn operations(&self, status: Option<OperationStatus>) -> Vec<Operation> {
        OperationStore::list(&self.db(), status).unwrap()
    }

    fn register(&self) -> i64 {
        assert_ok(self.run(&["register", "-c", &self.config(), "-s", &self.strategy_file()]));
        let pending = self.db().list_by_status(StrategyStatus::Pending).unwrap();
        pending.last().unwrap().id
    }
}

fn code(exit: ExitCode) -> String {
    format!("{exit:?}")
}

fn assert_ok(exit: ExitCode) {
    assert_eq!(code(exit), code(ExitCode::SUCCESS));
}

fn assert_exit(exit: ExitCode, expected: u8) {
    assert_eq!(code(exit), code(ExitCode::from(expected)));
}

mod helpers {
    use super::*;

    #[test]
    fn load_checked_program_accepts_valid_file() {
        let deployment = Deployment::new();
        let strategy =
            cli::load_checked_program(&deployment.path("strategy.ini"), "ops", 100).unwrap();
        assert_eq!(strategy.name, "Opening Breakout");
        assert_eq!(strategy.symbol, "SPY");
        assert_eq!(strategy.owner, "ops");
        assert_eq!(strategy.program.transitions.len(), 1);
    }

    #[test]
    fn load_checked_program_enforces_history_cap() {
        let deployment = Deployment::new();
        match cli::load_checked_program(&deployment.path("strategy.ini"), "ops", 10) {
            Err(LifecycleError::ProgramInvalid { reason }) => {
                assert!(reason.contains("history_limit 50"))
            }
            other => panic!("expected ProgramInvalid, got {other:?}"),
        }
    }

    #[test]
    fn paper_settings_from_config() {
        let deployment = Deployment::new();
        let config = cli::load_config(&deployment.path("config.ini")).unwrap();
        let settings = cli::build_paper_settings(&config);
        assert!((settings.slippage_pct - 0.001).abs() < f64::EPSILON);
        assert!((settings.commission_per_trade - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn paper_settings_default_to_zero() {
        let config = FileConfigAdapter::from_string("[broker]\nenv = paper\n").unwrap();
        let settings = cli::build_paper_settings(&config);
        assert_eq!(settings.slippage_pct, 0.0);
        assert_eq!(settings.commission_per_trade, 0.0);
    }

    #[test]
    fn config_path_follows_command() {
        let cli = Cli::parse_from(["stratlife", "queue", "list", "-c", "x.ini"]);
        assert_eq!(cli.config_path(), Some(Path::new("x.ini")));
        let cli = Cli::parse_from(["stratlife", "replay", "-s", "s.ini", "--bars", "b.csv"]);
        assert_eq!(cli.config_path(), None);
    }
}

mod commands {
    use super::*;

    #[test]
    fn validate_config_and_strategy() {
        let deployment = Deployment::new();
        assert_ok(deployment.run(&[
            "validate",
            "-c",
            &deployment.config(),
            "-s",
            &deployment.strategy_file(),
        ]));
    }

    #[test]
    fn validate_requires_an_input() {
        assert_exit(Deployment::new().run(&["validate"]), 2);
    }

    #[test]
    fn missing_config_file_is_a_config_error() {
        let deployment = Deployment::new();
        let missing = deployment.path("nope.ini").display().to_string();
        assert_exit(deployment.run(&["init-db", "-c", &missing]), 2);
    }

    #[test]
    fn invalid_strategy_is_a_program_error() {
        let deployment = Deployment::new();
        fs::write(
            deployment.path("broken.ini"),
            STRATEGY_INI.replace("close > 100", "close >"),
        )
        .unwrap();
        let broken = deployment.path("broken.ini").display().to_string();
        assert_exit(deployment.run(&["validate", "-s", &broken]), 4);
    }

    #[test]
    fn live_env_is_refused() {
        let deployment = Deployment::new();
        let config = fs::read_to_string(deployment.path("config.ini"))
            .unwrap()
            .replace("env = paper", "env = live");
        fs::write(deployment.path("config.ini"), config).unwrap();
        assert_exit(deployment.run(&["run", "-c", &deployment.config(), "--cycles", "1"]), 2);
    }

    #[test]
    fn register_creates_pending_strategy() {
        let deployment = Deployment::new();
        assert_ok(deployment.run(&["init-db", "-c", &deployment.config()]));
        let id = deployment.register();

        let stored = deployment.stored(id);
        assert_eq!(stored.status, StrategyStatus::Pending);
        assert_eq!(stored.version, 1);
        assert_eq!(stored.owner, "operator");
        assert_ok(deployment.run(&["status", "-c", &deployment.config(), "--id", &id.to_string()]));
    }

    #[test]
    fn status_of_unknown_strategy_fails() {
        let deployment = Deployment::new();
        assert_ok(deployment.run(&["init-db", "-c", &deployment.config()]));
        assert_exit(
            deployment.run(&["status", "-c", &deployment.config(), "--id", "99"]),
            7,
        );
    }

    #[test]
    fn run_activates_then_queued_close_closes() {
        let deployment = Deployment::new();
        let id = deployment.register();
        let id_arg = id.to_string();

        assert_ok(deployment.run(&["run", "-c", &deployment.config(), "--cycles", "1"]));
        let active = deployment.stored(id);
        assert_eq!(active.status, StrategyStatus::Active);

        assert_ok(deployment.run(&["close", "-c", &deployment.config(), "--id", &id_arg]));
        let queued = deployment.operations(Some(OperationStatus::Pending));
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].op_type, "close");

        assert_ok(deployment.run(&["run", "-c", &deployment.config(), "--cycles", "1"]));
        let closed = deployment.stored(id);
        assert_eq!(closed.status, StrategyStatus::Closed);
        assert_eq!(closed.close_reason.as_deref(), Some("operator close"));
        assert_eq!(deployment.operations(Some(OperationStatus::Completed)).len(), 1);
    }

    #[test]
    fn close_now_runs_in_process() {
        let deployment = Deployment::new();
        let id = deployment.register();
        assert_ok(deployment.run(&["run", "-c", &deployment.config(), "--cycles", "1"]));

        assert_ok(deployment.run(&[
            "close",
            "-c",
            &deployment.config(),
            "--id",
            &id.to_string(),
            "--reason",
            "manual",
            "--now",
        ]));
        let closed = deployment.stored(id);
        assert_eq!(closed.status, StrategyStatus::Closed);
        assert_eq!(closed.close_reason.as_deref(), Some("manual"));
    }

    #[test]
    fn queue_maintenance() {
        let deployment = Deployment::new();
        let id = deployment.register();
        let config = deployment.config();
        assert_ok(deployment.run(&["run", "-c", &config, "--cycles", "1"]));
        assert_ok(deployment.run(&["close", "-c", &config, "--id", &id.to_string()]));
        let op_id = deployment.operations(None)[0].id.to_string();

        assert_ok(deployment.run(&["queue", "list", "-c", &config]));
        assert_ok(deployment.run(&["queue", "list", "-c", &config, "--status", "pending"]));
        assert_exit(
            deployment.run(&["queue", "list", "-c", &config, "--status", "stuck"]),
            2,
        );
        assert_ok(deployment.run(&["queue", "recover", "-c", &config]));
        assert_ok(deployment.run(&["queue", "cancel", "-c", &config, "--id", &op_id]));
        assert_eq!(
            deployment.operations(Some(OperationStatus::Cancelled)).len(),
            1
        );
        assert_exit(
            deployment.run(&["queue", "cancel", "-c", &config, "--id", "999"]),
            7,
        );
    }

    #[test]
    fn lock_status_reports_unlocked() {
        let deployment = Deployment::new();
        assert_ok(deployment.run(&["lock-status", "-c", &deployment.config(), "--id", "1"]));
    }

    #[test]
    fn import_bars_then_run_from_database() {
        let deployment = Deployment::new();
        let config = fs::read_to_string(deployment.path("config.ini")).unwrap()
            + "bar_source = database\n";
        fs::write(deployment.path("config.ini"), config).unwrap();
        let csv = deployment.path("data/SPY_1m.csv").display().to_string();

        assert_ok(deployment.run(&[
            "import-bars",
            "-c",
            &deployment.config(),
            "--symbol",
            "SPY",
            "--timeframe",
            "1m",
            "--file",
            &csv,
        ]));
        let id = deployment.register();
        assert_ok(deployment.run(&["run", "-c", &deployment.config(), "--cycles", "1"]));

        let stored = deployment.stored(id);
        assert_eq!(stored.status, StrategyStatus::Active);
    }

    #[test]
    fn replay_suppressed_and_executed() {
        let deployment = Deployment::new();
        let bars = deployment.path("data/SPY_1m.csv").display().to_string();
        assert_ok(deployment.run(&["replay", "-s", &deployment.strategy_file(), "--bars", &bars]));
        assert_ok(deployment.run(&[
            "replay",
            "-s",
            &deployment.strategy_file(),
            "--bars",
            &bars,
            "--execute",
        ]));
    }

    #[test]
    fn replay_of_missing_bars_is_a_data_error() {
        let deployment = Deployment::new();
        let missing = deployment.path("data/NONE_1m.csv").display().to_string();
        assert_exit(
            deployment.run(&["replay", "-s", &deployment.strategy_file(), "--bars", &missing]),
            3,
        );
    }
}
