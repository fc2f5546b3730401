use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Used when no path is given on the command line
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to open config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("check_interval_secs must be greater than zero")]
    InvalidInterval,
}

/// Written next to the executable when running as a service without `log_path`
pub const SERVICE_LOG_FILE: &str = "sheetsync.log";

/// Service configuration, read from a JSON file.
///
/// The PascalCase keys of older config files are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Workbook whose changes trigger a sync
    #[serde(alias = "LiveSplitExportPath")]
    pub watch_path: PathBuf,
    /// Poll cadence for backends without native change events
    pub check_interval_secs: u64,
    /// Older spelling of the poll cadence, in nanoseconds
    #[serde(rename = "FileCheckInterval")]
    legacy_check_interval_nanos: Option<u64>,
    /// Quiet period that collapses a burst of writes into one sync
    pub debounce_ms: u64,
    /// Only sync when the file's content hash changed
    pub skip_unchanged_content: bool,

    /// Service account key file
    #[serde(alias = "GoogleSheetsCredentialsPath")]
    pub credentials_path: PathBuf,
    #[serde(alias = "GoogleSheetID")]
    pub spreadsheet_id: String,
    #[serde(alias = "RawDataSheet1Name")]
    pub first_table: String,
    #[serde(alias = "RawDataSheet2Name")]
    pub second_table: String,
    /// Override for the Sheets API endpoint
    pub sheets_api_base: Option<String>,

    /// Append logs here instead of stderr
    #[serde(alias = "LogPath")]
    pub log_path: Option<PathBuf>,
    #[serde(alias = "LogLevel")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            watch_path: PathBuf::new(),
            check_interval_secs: 5,
            legacy_check_interval_nanos: None,
            debounce_ms: 250,
            skip_unchanged_content: false,
            credentials_path: PathBuf::new(),
            spreadsheet_id: String::new(),
            first_table: String::new(),
            second_table: String::new(),
            sheets_api_base: None,
            log_path: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_json::from_str(raw)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Fold older key spellings into the current fields
    fn normalize(&mut self) {
        if let Some(nanos) = self.legacy_check_interval_nanos.take() {
            self.check_interval_secs = nanos.div_ceil(1_000_000_000);
        }
        if self.log_path.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
            self.log_path = None;
        }
    }

    /// Log to `dir/sheetsync.log` unless a log path is already set.
    ///
    /// A service has no console, so stderr output would be lost.
    pub fn with_default_log_path(mut self, dir: &Path) -> Self {
        if self.log_path.is_none() {
            self.log_path = Some(dir.join(SERVICE_LOG_FILE));
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watch_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("watch_path"));
        }
        if self.credentials_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("credentials_path"));
        }
        if self.spreadsheet_id.is_empty() {
            return Err(ConfigError::Missing("spreadsheet_id"));
        }
        if self.first_table.is_empty() {
            return Err(ConfigError::Missing("first_table"));
        }
        if self.second_table.is_empty() {
            return Err(ConfigError::Missing("second_table"));
        }
        if self.check_interval_secs == 0 {
            return Err(ConfigError::InvalidInterval);
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn tables(&self) -> [String; 2] {
        [self.first_table.clone(), self.second_table.clone()]
    }
}
