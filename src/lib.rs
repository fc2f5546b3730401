//! Keeps two sheets of a Google spreadsheet in step with a workbook on disk.
//!
//! Every time the watched workbook is written, both configured sheets are
//! read from it and pushed to the spreadsheet as a full replace.

pub mod config;
pub mod excel;
pub mod logging;
pub mod service;
pub mod sheets;
pub mod sync;

use config::Config;
use excel::{ExcelSource, ExcelWatcher, WatchError, WatchTarget};
use sheets::GoogleSheetsClient;
use sync::{Orchestrator, SyncSettings};

/// The production wiring: workbook on disk to Google Sheets
pub type SheetSync = Orchestrator<ExcelWatcher, ExcelSource, GoogleSheetsClient>;

/// Build the orchestrator described by `config`
pub fn build_orchestrator(config: &Config) -> Result<SheetSync, WatchError> {
    let target = WatchTarget::new(&config.watch_path, config.check_interval())?
        .with_debounce(config.debounce());

    let watcher = ExcelWatcher::new(target.clone(), tracing::info_span!("watcher"))
        .skip_unchanged_content(config.skip_unchanged_content);

    let sink = match &config.sheets_api_base {
        Some(base) => GoogleSheetsClient::with_api_base(base.clone()),
        None => GoogleSheetsClient::new(),
    };

    let settings = SyncSettings {
        target,
        credentials_path: config.credentials_path.clone(),
        spreadsheet_id: config.spreadsheet_id.clone(),
        tables: config.tables(),
    };

    Ok(Orchestrator::new(
        settings,
        watcher,
        ExcelSource::new(),
        sink,
        tracing::info_span!("sync", spreadsheet = %config.spreadsheet_id),
    ))
}
