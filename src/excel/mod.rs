//! Excel module for reading and watching the source workbook.
//!
//! This module provides:
//! - Reading a named sheet as text rows
//! - File change detection for a single workbook

pub mod types;
pub mod reader;
pub mod watcher;

// Re-export commonly used types and functions
pub use types::*;
pub use reader::{read_sheet, compute_checksum, ExcelSource};
pub use watcher::{ExcelWatcher, WatchError, WatchTarget};
