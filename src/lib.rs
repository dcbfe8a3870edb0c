// Clinic Migrate library entry
// 提供 run() 供 bin 目标调用。

pub mod config;
pub mod data_governance;
pub mod database;
pub mod invocation;
pub mod test_utils;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::data_governance::migration::{MigrationCoordinator, MigrationError, MigrationOutcome};
use crate::database::MigrationSession;
use crate::invocation::{Cli, MigrationRequest, OutputFormat};

/// Exit status for a request that never reached the engine.
const EXIT_USAGE: u8 = 2;

/// Run one request against the configured database.
///
/// The session is opened here and closed on every path, including errors.
pub fn execute_request(
    config: &AppConfig,
    request: &MigrationRequest,
) -> Result<MigrationOutcome, MigrationError> {
    let config = config.clone().with_overrides(
        request.options.db.as_deref(),
        request.options.backup_dir.as_deref(),
    );
    let settings = config.engine_settings();
    let mut session = MigrationSession::open(config.database_path()?)?;

    let outcome = MigrationCoordinator::new(&mut session, &settings).run(&request.task);
    let closed = session.close();
    let outcome = outcome?;
    closed?;
    Ok(outcome)
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn print_outcome(outcome: &MigrationOutcome, output: OutputFormat) {
    match output {
        OutputFormat::Text => println!("{}", outcome.to_string().trim_end()),
        OutputFormat::Json => match serde_json::to_string_pretty(outcome) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("cannot encode report: {}", e),
        },
    }
}

fn print_error(request: &MigrationRequest, error: &MigrationError) {
    match request.options.output {
        OutputFormat::Text => eprintln!("{} failed: {}", request.task.migration, error),
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "kind": "error",
                "migration": request.task.migration,
                "error": error.to_string(),
            })
        ),
    }
}

/// Binary entry point: parse, configure, run, report.
pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {:#}", e);
            return ExitCode::from(EXIT_USAGE);
        }
    };
    init_tracing(&config.log_filter);

    let request = match MigrationRequest::from_cli(&cli) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let run_id = Uuid::new_v4();
    let span = tracing::info_span!(
        "migration",
        run_id = %run_id,
        migration = %request.task.migration
    );
    let _guard = span.enter();

    match execute_request(&config, &request) {
        Ok(outcome) => {
            print_outcome(&outcome, request.options.output);
            if outcome.is_success() {
                tracing::info!("[ClinicMigrate] {} finished", request.task.migration);
                ExitCode::SUCCESS
            } else {
                tracing::warn!(
                    "[ClinicMigrate] {} finished with failures",
                    request.task.migration
                );
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            tracing::error!("[ClinicMigrate] {} failed: {}", request.task.migration, e);
            print_error(&request, &e);
            ExitCode::FAILURE
        }
    }
}
