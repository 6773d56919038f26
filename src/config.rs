use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{Parser, Subcommand};
use targetbot_schema::{
    DeclarationError, Schema, Secret, DEFAULT_AUTH_DATABASE, DEFAULT_DATABASE, DEFAULT_PRINCIPAL,
};
use thiserror::Error;

pub const DEFAULT_URI: &str = "mongodb://localhost:27017/";
/// How long to wait for a reachable server
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No principal secret was given, set TARGETBOT_PRINCIPAL_SECRET or TARGETBOT_PRINCIPAL_SECRET_FILE")]
    MissingSecret,
    #[error("Could not read the secret file {path}: {source}")]
    SecretFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Declaration(#[from] DeclarationError),
}

/// Bootstraps the target bot's MongoDB database
#[derive(Debug, Parser)]
#[command(name = "targetbot-init", version)]
pub struct Config {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Connection string of the MongoDB server
    #[arg(long, env = "TARGETBOT_MONGODB_URI", default_value = DEFAULT_URI, global = true)]
    pub uri: String,

    /// The database the bot stores its data in
    #[arg(long, env = "TARGETBOT_DATABASE", default_value = DEFAULT_DATABASE, global = true)]
    pub database: String,

    /// The database the principal is created in
    #[arg(
        long,
        env = "TARGETBOT_AUTH_DATABASE",
        default_value = DEFAULT_AUTH_DATABASE,
        global = true
    )]
    pub auth_database: String,

    /// Name of the principal to create
    #[arg(long, env = "TARGETBOT_PRINCIPAL", default_value = DEFAULT_PRINCIPAL, global = true)]
    pub principal: String,

    /// Password of the principal
    #[arg(
        long,
        env = "TARGETBOT_PRINCIPAL_SECRET",
        hide_env_values = true,
        conflicts_with = "secret_file",
        global = true
    )]
    pub secret: Option<String>,

    /// File holding the password of the principal, such as a mounted secret
    #[arg(long, env = "TARGETBOT_PRINCIPAL_SECRET_FILE", global = true)]
    pub secret_file: Option<PathBuf>,

    /// Milliseconds to wait for a reachable server
    #[arg(
        long = "timeout-ms",
        env = "TARGETBOT_SERVER_SELECTION_TIMEOUT_MS",
        default_value_t = DEFAULT_TIMEOUT_MS,
        global = true
    )]
    pub timeout_ms: u64,

    /// Also declare the secondary indexes the bot uses
    #[arg(long, env = "TARGETBOT_APP_INDEXES", global = true)]
    pub app_indexes: bool,

    /// Log debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Create the principal and the indexes (the default)
    Apply,
    /// Check that the principal and the indexes are in place as declared
    Verify,
    /// Show what apply would do, without connecting
    Plan,
}

impl Config {
    pub fn command(&self) -> Command {
        self.command.unwrap_or(Command::Apply)
    }

    pub fn schema(&self) -> Result<Schema, ConfigError> {
        let schema = Schema::target_bot(&self.principal, &self.auth_database, &self.database)?;
        let schema = if self.app_indexes {
            schema.with_app_indexes()
        } else {
            schema
        };

        schema.validate()?;
        Ok(schema)
    }

    /// The principal secret, from the command line, the environment or a file
    pub fn secret(&self) -> Result<Secret, ConfigError> {
        let secret = match (&self.secret, &self.secret_file) {
            (Some(secret), _) => secret.clone(),
            (None, Some(path)) => read_secret_file(path)?,
            (None, None) => return Err(ConfigError::MissingSecret),
        };

        Ok(Secret::new(secret)?)
    }

    pub fn server_selection_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn read_secret_file(path: &Path) -> Result<String, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::SecretFile {
        path: path.to_path_buf(),
        source,
    })?;

    // Secret files usually end with a newline
    Ok(contents.trim_end_matches(['\n', '\r']).to_string())
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut all = vec!["targetbot-init"];
        all.extend_from_slice(args);

        Config::try_parse_from(all).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["--secret", "s3cret"]);

        assert_eq!(config.command(), Command::Apply);
        assert_eq!(config.database, "telegram_target_bot");
        assert_eq!(config.principal, "admin");
        assert_eq!(config.server_selection_timeout(), Duration::from_millis(5000));

        let schema = config.schema().unwrap();
        assert_eq!(schema.indexes.len(), 3);
        assert_eq!(config.secret().unwrap().expose(), "s3cret");
    }

    #[test]
    fn test_subcommands_take_global_flags() {
        let config = parse(&["verify", "--database", "staging", "--app-indexes"]);

        assert_eq!(config.command(), Command::Verify);
        assert_eq!(config.database, "staging");

        let schema = config.schema().unwrap();
        assert_eq!(schema.indexes.len(), 8);
        assert!(schema.principal.grants.iter().all(|g| g.database == "staging"));
    }

    #[test]
    fn test_secret_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "from-a-file").unwrap();

        let path = file.path().to_str().unwrap();
        let config = parse(&["--secret-file", path]);

        assert_eq!(config.secret().unwrap().expose(), "from-a-file");
    }

    #[test]
    fn test_secret_sources_conflict() {
        let result = Config::try_parse_from([
            "targetbot-init",
            "--secret",
            "a",
            "--secret-file",
            "/run/secrets/b",
        ]);

        assert!(result.is_err());
    }

    #[test]
    fn test_empty_secret_is_rejected() {
        let config = parse(&["--secret", ""]);

        assert!(matches!(
            config.secret(),
            Err(ConfigError::Declaration(DeclarationError::EmptySecret))
        ));
    }
}
