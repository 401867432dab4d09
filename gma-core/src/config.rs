//! Configuration types

use crate::{ConfigError, GmaResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// What an offset page reports as `total_count` when the window is empty.
///
/// Offset queries take their total from a windowed count over the returned
/// rows, so a window past the last match sees no rows and reports zero.
/// That behavior is kept as the default; `CountAll` runs a separate count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyPageCount {
    /// Empty pages report `total_count = 0`.
    #[default]
    ReportZero,
    /// Empty pages report the real number of matching rows.
    CountAll,
}

impl std::str::FromStr for EmptyPageCount {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "report_zero" => Ok(EmptyPageCount::ReportZero),
            "count_all" => Ok(EmptyPageCount::CountAll),
            other => Err(ConfigError::InvalidValue {
                field: "empty_page_count".to_string(),
                value: other.to_string(),
                reason: "expected report_zero or count_all".to_string(),
            }),
        }
    }
}

/// Local store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file; `None` opens a private in-memory database.
    pub database_path: Option<PathBuf>,
    /// How long a writer waits for a competing writer before a conflict is reported.
    pub busy_timeout: Duration,
    pub empty_page_count: EmptyPageCount,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            busy_timeout: Duration::from_secs(5),
            empty_page_count: EmptyPageCount::ReportZero,
        }
    }
}

impl StoreConfig {
    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `GMA_DB_PATH`: database file (default: in-memory)
    /// - `GMA_DB_BUSY_TIMEOUT_MS`: writer busy timeout (default: 5000)
    /// - `GMA_EMPTY_PAGE_COUNT`: `report_zero` or `count_all` (default: report_zero)
    pub fn from_env() -> GmaResult<Self> {
        let defaults = Self::default();

        let busy_timeout = match std::env::var("GMA_DB_BUSY_TIMEOUT_MS") {
            Ok(raw) => Duration::from_millis(raw.parse().map_err(|_| ConfigError::InvalidValue {
                field: "busy_timeout".to_string(),
                value: raw.clone(),
                reason: "must be an integer number of milliseconds".to_string(),
            })?),
            Err(_) => defaults.busy_timeout,
        };

        let empty_page_count = match std::env::var("GMA_EMPTY_PAGE_COUNT") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.empty_page_count,
        };

        let config = Self {
            database_path: std::env::var("GMA_DB_PATH").ok().map(PathBuf::from),
            busy_timeout,
            empty_page_count,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - busy_timeout is positive
    /// - database_path, when set, is not empty
    pub fn validate(&self) -> GmaResult<()> {
        if self.busy_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "busy_timeout".to_string(),
                value: format!("{:?}", self.busy_timeout),
                reason: "busy_timeout must be positive".to_string(),
            }
            .into());
        }

        if let Some(path) = &self.database_path {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "database_path".to_string(),
                    value: String::new(),
                    reason: "database_path must not be empty".to_string(),
                }
                .into());
            }
        }

        Ok(())
    }
}
