//! In-memory spreadsheet.
//!
//! A mutex-guarded grid with a version counter standing in for the remote
//! ETag. Backs the engine tests and local dry runs; every mutation bumps the
//! version the way a real edit would.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{parse_row_number, RangeUpdate, SheetClient, SheetError, SheetRead};
use crate::value::CellValue;

#[derive(Debug, Default)]
struct Inner {
    grid: Vec<Vec<CellValue>>,
    version: u64,
    last_modified: Option<DateTime<Utc>>,
    fail_status: Option<u16>,
}

#[derive(Debug, Default)]
pub struct InMemorySheet {
    inner: Mutex<Inner>,
}

impl InMemorySheet {
    pub fn new() -> Self {
        InMemorySheet::default()
    }

    pub fn with_grid(grid: Vec<Vec<CellValue>>) -> Self {
        let sheet = InMemorySheet::new();
        {
            let mut inner = sheet.inner.lock().expect("sheet lock");
            inner.grid = grid;
            inner.version = 1;
            inner.last_modified = Some(Utc::now());
        }
        sheet
    }

    /// Simulate an external edit to one cell (1-based row, 0-based column).
    pub fn set_cell(&self, row: usize, column: usize, value: CellValue) {
        let mut inner = self.inner.lock().expect("sheet lock");
        while inner.grid.len() < row {
            inner.grid.push(Vec::new());
        }
        let cells = &mut inner.grid[row - 1];
        while cells.len() <= column {
            cells.push(CellValue::Null);
        }
        cells[column] = value;
        Self::touch(&mut inner);
    }

    /// Simulate an externally appended row.
    pub fn push_row(&self, cells: Vec<CellValue>) {
        let mut inner = self.inner.lock().expect("sheet lock");
        inner.grid.push(cells);
        Self::touch(&mut inner);
    }

    pub fn grid(&self) -> Vec<Vec<CellValue>> {
        self.inner.lock().expect("sheet lock").grid.clone()
    }

    pub fn etag(&self) -> String {
        format!("v{}", self.inner.lock().expect("sheet lock").version)
    }

    /// Pin the modification timestamp (conflict-timing tests).
    pub fn set_last_modified(&self, at: DateTime<Utc>) {
        self.inner.lock().expect("sheet lock").last_modified = Some(at);
    }

    /// Make every subsequent call fail with the given HTTP status. `None`
    /// restores normal behavior.
    pub fn set_fail_status(&self, status: Option<u16>) {
        self.inner.lock().expect("sheet lock").fail_status = status;
    }

    fn touch(inner: &mut Inner) {
        inner.version += 1;
        inner.last_modified = Some(Utc::now());
    }

    fn check_failure(inner: &Inner) -> Result<(), SheetError> {
        match inner.fail_status {
            Some(429) => Err(SheetError::RateLimited),
            Some(status) => Err(SheetError::Status {
                status,
                message: "injected failure".into(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SheetClient for InMemorySheet {
    async fn read_range(
        &self,
        _spreadsheet_id: &str,
        _range: &str,
        if_none_match: Option<&str>,
    ) -> Result<SheetRead, SheetError> {
        let inner = self.inner.lock().expect("sheet lock");
        Self::check_failure(&inner)?;

        let etag = format!("v{}", inner.version);
        if if_none_match == Some(etag.as_str()) {
            return Ok(SheetRead {
                grid: None,
                etag: Some(etag),
                last_modified: None,
                not_modified: true,
            });
        }
        Ok(SheetRead {
            grid: Some(inner.grid.clone()),
            etag: Some(etag),
            last_modified: inner.last_modified,
            not_modified: false,
        })
    }

    async fn batch_update(
        &self,
        _spreadsheet_id: &str,
        updates: &[RangeUpdate],
    ) -> Result<Option<String>, SheetError> {
        let mut inner = self.inner.lock().expect("sheet lock");
        Self::check_failure(&inner)?;

        for update in updates {
            let row = parse_row_number(&update.range).ok_or_else(|| {
                SheetError::Parse(format!("unsupported range '{}'", update.range))
            })?;
            for (offset, cells) in update.values.iter().enumerate() {
                let target = row + offset;
                while inner.grid.len() < target {
                    inner.grid.push(Vec::new());
                }
                inner.grid[target - 1] = cells.clone();
            }
        }
        Self::touch(&mut inner);
        Ok(Some(format!("v{}", inner.version)))
    }

    async fn append_rows(
        &self,
        _spreadsheet_id: &str,
        _range: &str,
        rows: &[Vec<CellValue>],
    ) -> Result<Option<String>, SheetError> {
        let mut inner = self.inner.lock().expect("sheet lock");
        Self::check_failure(&inner)?;

        for row in rows {
            inner.grid.push(row.clone());
        }
        Self::touch(&mut inner);
        Ok(Some(format!("v{}", inner.version)))
    }

    async fn clear_range(
        &self,
        _spreadsheet_id: &str,
        range: &str,
    ) -> Result<Option<String>, SheetError> {
        let mut inner = self.inner.lock().expect("sheet lock");
        Self::check_failure(&inner)?;

        let row = parse_row_number(range)
            .ok_or_else(|| SheetError::Parse(format!("unsupported range '{range}'")))?;
        if row <= inner.grid.len() {
            let width = inner.grid[row - 1].len();
            inner.grid[row - 1] = vec![CellValue::Null; width];
        }
        Self::touch(&mut inner);
        Ok(Some(format!("v{}", inner.version)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> CellValue {
        CellValue::Text(s.into())
    }

    #[tokio::test]
    async fn conditional_read_uses_version_as_etag() {
        let sheet = InMemorySheet::with_grid(vec![vec![text("id")], vec![text("1")]]);

        let first = sheet.read_range("s", "Sheet1", None).await.unwrap();
        assert!(!first.not_modified);
        let etag = first.etag.clone().unwrap();

        let second = sheet
            .read_range("s", "Sheet1", Some(etag.as_str()))
            .await
            .unwrap();
        assert!(second.not_modified);
        assert!(second.grid.is_none());

        sheet.set_cell(2, 0, text("2"));
        let third = sheet
            .read_range("s", "Sheet1", Some(etag.as_str()))
            .await
            .unwrap();
        assert!(!third.not_modified);
        assert_eq!(third.grid.unwrap()[1][0], text("2"));
    }

    #[tokio::test]
    async fn batch_update_overwrites_rows() {
        let sheet = InMemorySheet::with_grid(vec![vec![text("id")], vec![text("1")]]);
        sheet
            .batch_update(
                "s",
                &[RangeUpdate {
                    range: "Sheet1!A2:A2".into(),
                    values: vec![vec![text("9")]],
                }],
            )
            .await
            .unwrap();
        assert_eq!(sheet.grid()[1][0], text("9"));
    }

    #[tokio::test]
    async fn clear_blanks_cells_but_keeps_row() {
        let sheet =
            InMemorySheet::with_grid(vec![vec![text("id")], vec![text("1"), text("Alice")]]);
        sheet.clear_range("s", "Sheet1!A2:B2").await.unwrap();
        let grid = sheet.grid();
        assert_eq!(grid.len(), 2);
        assert!(grid[1].iter().all(|c| c.is_empty()));
    }

    #[tokio::test]
    async fn injected_failures_surface() {
        let sheet = InMemorySheet::new();
        sheet.set_fail_status(Some(503));
        let err = sheet.read_range("s", "Sheet1", None).await.unwrap_err();
        assert!(err.is_retryable());

        sheet.set_fail_status(Some(429));
        assert!(matches!(
            sheet.append_rows("s", "Sheet1", &[]).await.unwrap_err(),
            SheetError::RateLimited
        ));
    }
}
