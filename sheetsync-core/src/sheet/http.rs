//! HTTP implementation of the spreadsheet adapter.
//!
//! Speaks a Sheets-style values API: `GET .../values/{range}` with
//! `If-None-Match`, `POST .../values:batchUpdate`, `:append` and `:clear`.
//! Authentication is a bearer token; credential refresh happens outside the
//! core.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ETAG, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::{RangeUpdate, SheetClient, SheetError, SheetRead};
use crate::value::CellValue;

pub struct HttpSheetClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ValuesResponse {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

impl HttpSheetClient {
    pub fn new(base_url: String, token: Option<String>) -> Self {
        HttpSheetClient {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn values_url(&self, spreadsheet_id: &str, range: &str) -> String {
        format!(
            "{}/spreadsheets/{}/values/{}",
            self.base_url, spreadsheet_id, range
        )
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Map a non-2xx response to an error, consuming the body for context.
    async fn status_error(response: Response) -> SheetError {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return SheetError::RateLimited;
        }
        let message = response.text().await.unwrap_or_default();
        SheetError::Status {
            status: status.as_u16(),
            message: message.chars().take(500).collect(),
        }
    }

    fn etag_of(response: &Response) -> Option<String> {
        response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    fn last_modified_of(response: &Response) -> Option<DateTime<Utc>> {
        response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| DateTime::parse_from_rfc2822(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[async_trait]
impl SheetClient for HttpSheetClient {
    async fn read_range(
        &self,
        spreadsheet_id: &str,
        range: &str,
        if_none_match: Option<&str>,
    ) -> Result<SheetRead, SheetError> {
        let mut req = self
            .authed(self.http.get(self.values_url(spreadsheet_id, range)));
        if let Some(etag) = if_none_match {
            req = req.header(IF_NONE_MATCH, etag);
        }

        let response = req.send().await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            debug!(spreadsheet_id, range, "sheet not modified");
            return Ok(SheetRead {
                grid: None,
                etag: if_none_match.map(|s| s.to_string()),
                last_modified: None,
                not_modified: true,
            });
        }
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let etag = Self::etag_of(&response);
        let last_modified = Self::last_modified_of(&response);
        let body: ValuesResponse = response
            .json()
            .await
            .map_err(|e| SheetError::Parse(e.to_string()))?;

        let grid = body
            .values
            .into_iter()
            .map(|row| row.into_iter().map(CellValue::from_json).collect())
            .collect();

        Ok(SheetRead {
            grid: Some(grid),
            etag,
            last_modified,
            not_modified: false,
        })
    }

    async fn batch_update(
        &self,
        spreadsheet_id: &str,
        updates: &[RangeUpdate],
    ) -> Result<Option<String>, SheetError> {
        let data: Vec<serde_json::Value> = updates
            .iter()
            .map(|u| {
                serde_json::json!({
                    "range": u.range,
                    "values": grid_to_json(&u.values),
                })
            })
            .collect();

        let url = format!(
            "{}/spreadsheets/{}/values:batchUpdate",
            self.base_url, spreadsheet_id
        );
        let response = self
            .authed(self.http.post(url))
            .json(&serde_json::json!({
                "valueInputOption": "RAW",
                "data": data,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Ok(Self::etag_of(&response))
    }

    async fn append_rows(
        &self,
        spreadsheet_id: &str,
        range: &str,
        rows: &[Vec<CellValue>],
    ) -> Result<Option<String>, SheetError> {
        let url = format!("{}:append", self.values_url(spreadsheet_id, range));
        let response = self
            .authed(self.http.post(url))
            .query(&[("valueInputOption", "RAW")])
            .json(&serde_json::json!({ "values": grid_to_json(rows) }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Ok(Self::etag_of(&response))
    }

    async fn clear_range(
        &self,
        spreadsheet_id: &str,
        range: &str,
    ) -> Result<Option<String>, SheetError> {
        let url = format!("{}:clear", self.values_url(spreadsheet_id, range));
        let response = self.authed(self.http.post(url)).send().await?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Ok(Self::etag_of(&response))
    }
}

fn grid_to_json(rows: &[Vec<CellValue>]) -> Vec<Vec<serde_json::Value>> {
    rows.iter()
        .map(|row| row.iter().map(|c| c.to_json()).collect())
        .collect()
}
