//! Spreadsheet adapter: conditional range reads, batch updates, appends and
//! range clears against the remote values API.
//!
//! Row deletion is emulated by clearing the row's cells; the platform offers
//! no row removal through the values surface. The token-bucket rate limiter
//! and circuit breaker wrap the HTTP client outside the core.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::value::CellValue;

#[derive(Error, Debug)]
pub enum SheetError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited by the spreadsheet API")]
    RateLimited,
    #[error("spreadsheet API returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("unexpected response format: {0}")]
    Parse(String),
}

impl SheetError {
    /// Transient network problems, 429 and 5xx are worth retrying; any other
    /// 4xx is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            SheetError::Transport(_) | SheetError::RateLimited => true,
            SheetError::Status { status, .. } => *status == 429 || *status >= 500,
            SheetError::Parse(_) => false,
        }
    }
}

impl From<reqwest::Error> for SheetError {
    fn from(err: reqwest::Error) -> Self {
        SheetError::Transport(err.to_string())
    }
}

/// Result of a conditional range read.
#[derive(Debug, Clone)]
pub struct SheetRead {
    /// None when the server answered "not modified".
    pub grid: Option<Vec<Vec<CellValue>>>,
    /// The sheet's version marker after the read. On a 304 this carries the
    /// ETag the caller sent.
    pub etag: Option<String>,
    /// Remote modification time, when the API exposes one. Feeds the
    /// spreadsheet-side conflict timestamp.
    pub last_modified: Option<DateTime<Utc>>,
    pub not_modified: bool,
}

/// One `{range, values}` tuple of a batch update.
#[derive(Debug, Clone)]
pub struct RangeUpdate {
    pub range: String,
    pub values: Vec<Vec<CellValue>>,
}

#[async_trait]
pub trait SheetClient: Send + Sync {
    /// Read a range, passing `if_none_match` as the prior ETag for a
    /// conditional fetch.
    async fn read_range(
        &self,
        spreadsheet_id: &str,
        range: &str,
        if_none_match: Option<&str>,
    ) -> Result<SheetRead, SheetError>;

    /// Overwrite several ranges in one call. Returns the new ETag when the
    /// API reports one.
    async fn batch_update(
        &self,
        spreadsheet_id: &str,
        updates: &[RangeUpdate],
    ) -> Result<Option<String>, SheetError>;

    /// Append rows after the last data row of the range.
    async fn append_rows(
        &self,
        spreadsheet_id: &str,
        range: &str,
        rows: &[Vec<CellValue>],
    ) -> Result<Option<String>, SheetError>;

    /// Clear the cells of a range, leaving the rows in place.
    async fn clear_range(
        &self,
        spreadsheet_id: &str,
        range: &str,
    ) -> Result<Option<String>, SheetError>;
}

/// The sheet-name part of an A1 range (`"Sheet1!A2:C9"` → `"Sheet1"`).
pub fn sheet_name(range: &str) -> &str {
    match range.split_once('!') {
        Some((name, _)) => name,
        None => range,
    }
}

/// Column letter for a 0-based index. Mappings are bounded at 26 columns
/// (letters A through Z), so one letter always suffices.
pub fn column_letter(index: usize) -> char {
    debug_assert!(index < 26);
    (b'A' + index as u8) as char
}

/// A1 range covering the cells of one data row: row 5, width 3 →
/// `"Sheet1!A5:C5"`.
pub fn row_range(range: &str, row: usize, width: usize) -> String {
    let name = sheet_name(range);
    let last = column_letter(width.saturating_sub(1));
    format!("{name}!A{row}:{last}{row}")
}

/// Extract the 1-based row number from a single-row A1 range
/// (`"Sheet1!A5:C5"` → 5).
pub fn parse_row_number(range: &str) -> Option<usize> {
    let cells = match range.split_once('!') {
        Some((_, rest)) => rest,
        None => range,
    };
    let first = cells.split(':').next()?;
    let digits: String = first.chars().skip_while(|c| c.is_ascii_alphabetic()).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a1_helpers() {
        assert_eq!(sheet_name("Sheet1!A2:C9"), "Sheet1");
        assert_eq!(sheet_name("Sheet1"), "Sheet1");
        assert_eq!(column_letter(0), 'A');
        assert_eq!(column_letter(2), 'C');
        assert_eq!(row_range("Sheet1", 5, 3), "Sheet1!A5:C5");
        assert_eq!(row_range("Data!A1:Z99", 2, 1), "Data!A2:A2");
        assert_eq!(parse_row_number("Sheet1!A5:C5"), Some(5));
        assert_eq!(parse_row_number("B12:C12"), Some(12));
        assert_eq!(parse_row_number("Sheet1"), None);
    }

    #[test]
    fn retryability() {
        assert!(SheetError::Transport("connection refused".into()).is_retryable());
        assert!(SheetError::RateLimited.is_retryable());
        assert!(SheetError::Status {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(!SheetError::Status {
            status: 404,
            message: "missing".into()
        }
        .is_retryable());
        assert!(!SheetError::Parse("bad json".into()).is_retryable());
    }
}
