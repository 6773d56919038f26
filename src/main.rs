use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;
use log::{error, info};
use targetbot_schema::{
    Bootstrap, BootstrapError, BoxedDatabase, DatabaseError, MemoryDatabase, MongoDatabase, Report,
    Secret,
};
use thiserror::Error;
use tokio::runtime;

use crate::config::{Command, Config, ConfigError};

mod config;
mod logging;

#[derive(Debug, Error)]
enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Could not set up the database client: {0}")]
    Client(DatabaseError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl InitError {
    fn hint(&self) -> String {
        match self {
            InitError::Config(_) => "Check the flags and TARGETBOT_* environment variables. The principal secret must come from TARGETBOT_PRINCIPAL_SECRET or a secret file.".to_string(),
            InitError::Client(_) => "Make sure the connection string is a valid MongoDB URI.".to_string(),
            InitError::Bootstrap(error) => match &error.source {
                DatabaseError::Connection(_) => "Make sure the MongoDB instance is running and reachable at the configured URI, and that the connecting user may create users and indexes.".to_string(),
                DatabaseError::DuplicateKeyViolation { .. } => "Documents already in the collection share a key the unique index forbids. Remove or merge the duplicates, then run again.".to_string(),
                DatabaseError::IndexConflict { .. } => "An index with the same name or keys exists with different options. Reconcile or drop it by hand, then run again.".to_string(),
                DatabaseError::NotFound { .. } => "Run apply to create what is missing.".to_string(),
                DatabaseError::Mismatch { .. } => "Something was changed by hand after the bootstrap. An administrator has to reconcile it.".to_string(),
                _ => "This is a database error. Make sure the MongoDB instance is properly installed and running, then try again.".to_string(),
            },
            InitError::Fatal(_) => "This error is fatal, and should not happen.".to_string(),
        }
    }
}

async fn connect(config: &Config) -> Result<BoxedDatabase, InitError> {
    info!("Connecting to database...");

    let database = MongoDatabase::connect(&config.uri, config.server_selection_timeout())
        .await
        .map_err(InitError::Client)?;

    Ok(Box::new(database))
}

async fn execute(config: &Config) -> Result<Report, InitError> {
    let schema = config.schema()?;

    let report = match config.command() {
        Command::Apply => {
            let secret = config.secret()?;
            let database = connect(config).await?;

            Bootstrap::new(database.as_ref(), &schema)
                .apply(&secret)
                .await?
        }
        Command::Verify => {
            let database = connect(config).await?;

            Bootstrap::new(database.as_ref(), &schema).verify().await?
        }
        Command::Plan => {
            info!("Planning against an empty database...");

            // The in-memory database never checks the secret
            let secret = match config.secret() {
                Ok(secret) => secret,
                Err(_) => Secret::new("unused".to_string()).map_err(ConfigError::from)?,
            };
            let database: BoxedDatabase = Box::new(MemoryDatabase::new());

            Bootstrap::new(database.as_ref(), &schema)
                .apply(&secret)
                .await?
        }
    };

    Ok(report)
}

fn run(config: &Config) -> Result<Report, InitError> {
    let runtime = runtime::Builder::new_current_thread()
        .enable_all()
        .thread_name("targetbot-init")
        .build()
        .map_err(|e| InitError::Fatal(e.to_string()))?;

    runtime.block_on(execute(config))
}

fn main() -> ExitCode {
    let config = Config::parse();
    logging::init_logger(config.verbose);

    match run(&config) {
        Ok(report) => {
            let message = match config.command() {
                Command::Apply if report.applied_count() == 0 => {
                    "MongoDB was already initialized, nothing changed.".to_string()
                }
                Command::Apply => format!(
                    "MongoDB initialized successfully! {} of {} steps applied.",
                    report.applied_count(),
                    report.entries.len()
                ),
                Command::Verify => "MongoDB matches its declaration.".to_string(),
                Command::Plan => format!(
                    "Apply would run {} steps against an empty database.",
                    report.entries.len()
                ),
            };

            info!("{}", message.bold().green());
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!(
                "{} Read the error below to troubleshoot the issue.",
                "targetbot-init failed!".bold().red()
            );
            error!("{}", error);
            error!("{}", format!("Hint: {}", error.hint()).dimmed().italic());

            ExitCode::FAILURE
        }
    }
}
