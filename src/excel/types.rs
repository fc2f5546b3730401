use std::path::PathBuf;

/// One row of a sheet, cells in column order
pub type Row = Vec<String>;

/// Rows of a sheet in on-file order; cell values are carried as text
pub type RowSet = Vec<Row>;

/// Excel-specific errors
#[derive(Debug, Clone)]
pub struct ExcelError {
    pub message: String,
    pub error_type: ExcelErrorType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcelErrorType {
    FileNotFound,
    InvalidFormat,
    SheetNotFound,
    ReadError,
}

impl std::fmt::Display for ExcelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ExcelError {}

impl ExcelError {
    pub fn new(message: impl Into<String>, error_type: ExcelErrorType) -> Self {
        ExcelError {
            message: message.into(),
            error_type,
        }
    }

    pub fn file_not_found(path: impl AsRef<std::path::Path>) -> Self {
        ExcelError::new(
            format!("File not found: {}", path.as_ref().display()),
            ExcelErrorType::FileNotFound,
        )
    }

    pub fn invalid_format(message: impl Into<String>) -> Self {
        ExcelError::new(message, ExcelErrorType::InvalidFormat)
    }

    pub fn sheet_not_found(sheet: &str) -> Self {
        ExcelError::new(format!("Sheet not found: {}", sheet), ExcelErrorType::SheetNotFound)
    }

    pub fn read_error(message: impl Into<String>) -> Self {
        ExcelError::new(message, ExcelErrorType::ReadError)
    }
}

/// Emitted by the watcher each time the watched file is written or recreated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub path: PathBuf,
    /// SHA-256 of the file at notification time, when content de-duplication is on
    pub checksum: Option<String>,
}

impl ChangeNotification {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ChangeNotification {
            path: path.into(),
            checksum: None,
        }
    }
}
