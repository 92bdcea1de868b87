//! Configuration for the registry

use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::store::StoreOptions;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "ACCOUNTS";
/// Environment variable enabling verbose logging when set.
pub const DEBUG_ENV: &str = "AG_DEBUG";
/// Name of the data directory below the user's config directory.
pub const DATA_DIR_NAME: &str = "libaccounts-glib";
/// File name of the database inside the data directory.
pub const DATABASE_FILE_NAME: &str = "accounts.db";

/// Errors loading the configuration.
#[common_fields({
    backtrace: Option<Backtrace>,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("Failed to read {}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to parse config"))]
    Parse { source: toml::de::Error },
    #[snafu(display("Operating environment provides no directory for configuration"))]
    NoDataDir {},
}

/// Registry configuration
///
/// The config is usually loaded from a file with [`Self::load`]. [`Default`] gives the values
/// used by desktop sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the database. See [`Self::data_dir`] for the fallbacks.
    pub data_dir: Option<PathBuf>,
    /// Restricts the manager to accounts and services of this type.
    pub service_type: Option<String>,
    /// How long to retry on a busy database before giving up.
    #[serde(with = "humantime_serde")]
    pub db_timeout: Duration,
    /// Abort the process instead of returning an error when the database stays locked.
    pub abort_on_db_timeout: bool,
    /// Upper bound on the total time a blocking store waits for the database lock.
    #[serde(with = "humantime_serde")]
    pub blocking_timeout: Duration,
    /// How long accounts created by other processes are kept in memory after notification.
    #[serde(with = "humantime_serde")]
    pub foreign_account_hold: Duration,
    /// Logging options.
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            service_type: None,
            db_timeout: Duration::from_secs(5),
            abort_on_db_timeout: false,
            blocking_timeout: Duration::from_secs(30),
            foreign_account_hold: Duration::from_secs(2),
            log: LogConfig::from_env(),
        }
    }
}

impl Config {
    /// Load the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let s = tokio::fs::read_to_string(path)
            .await
            .context(ReadSnafu { path })?;
        let config: Config = toml::from_str(&s).context(ParseSnafu)?;
        Ok(config)
    }

    /// A config restricted to one service type.
    pub fn with_service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = Some(service_type.into());
        self
    }

    /// A config using the given data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Get the data directory.
    ///
    /// This is the configured directory, else the value of `ACCOUNTS`, else
    /// `libaccounts-glib` below the user's config directory.
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        if let Some(val) = env::var_os(DATA_DIR_ENV) {
            return Ok(PathBuf::from(val));
        }
        let path = dirs_next::config_dir().context(NoDataDirSnafu)?;
        Ok(path.join(DATA_DIR_NAME))
    }

    /// Get the path to the database file.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join(DATABASE_FILE_NAME))
    }

    pub(crate) fn store_options(&self) -> StoreOptions {
        StoreOptions {
            db_timeout: self.db_timeout,
            abort_on_db_timeout: self.abort_on_db_timeout,
            verbose: self.log.verbose,
        }
    }
}

/// Logging options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Trace every SQL statement and every change notification.
    pub verbose: bool,
}

impl LogConfig {
    /// Verbose if `AG_DEBUG` is set.
    pub fn from_env() -> Self {
        Self {
            verbose: env::var_os(DEBUG_ENV).is_some(),
        }
    }

    /// Installs a global fmt subscriber filtered by `RUST_LOG`, defaulting to `debug` for
    /// this crate when verbose.
    ///
    /// Fails if a global subscriber is already installed.
    pub fn try_init_tracing(&self) -> Result<(), tracing_subscriber::util::TryInitError> {
        let default = match self.verbose {
            true => "account_registry=debug",
            false => "account_registry=info",
        };
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(filter)
            .try_init()
    }
}
