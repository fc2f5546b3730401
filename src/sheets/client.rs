use async_trait::async_trait;
use reqwest::{Response, Url};
use std::path::Path;
use std::time::Duration;

use super::auth::{fetch_token, AccessToken, ServiceAccountKey};
use super::types::*;
use crate::excel::RowSet;
use crate::sync::TableSink;

pub const DEFAULT_API_BASE: &str = "https://sheets.googleapis.com/v4";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Values are parsed as if a user typed them into the sheet
const VALUE_INPUT_OPTION: &str = "USER_ENTERED";

/// Google Sheets destination
#[derive(Debug, Clone)]
pub struct GoogleSheetsClient {
    api_base: String,
}

/// Authenticated state for one run of the process
#[derive(Debug)]
pub struct SheetsSession {
    http: reqwest::Client,
    key: ServiceAccountKey,
    token: AccessToken,
}

impl SheetsSession {
    /// Current bearer token, renewed first if it is about to expire
    async fn bearer(&mut self) -> Result<String, SheetsError> {
        if self.token.needs_refresh() {
            tracing::debug!("refreshing access token");
            self.token = fetch_token(&self.http, &self.key).await?;
        }
        Ok(self.token.value().to_string())
    }
}

impl Default for GoogleSheetsClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GoogleSheetsClient {
    pub fn new() -> Self {
        GoogleSheetsClient {
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        GoogleSheetsClient {
            api_base: api_base.into(),
        }
    }

    /// `{base}/spreadsheets/{id}/...`
    fn spreadsheet_url(&self, spreadsheet_id: &str, rest: &[&str]) -> Result<Url, SheetsError> {
        let mut url =
            Url::parse(&self.api_base).map_err(|e| SheetsError::InvalidUrl(e.to_string()))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| SheetsError::InvalidUrl(self.api_base.clone()))?;
            segments.pop_if_empty().push("spreadsheets").push(spreadsheet_id);
            segments.extend(rest);
        }
        Ok(url)
    }

    async fn ensure_sheet(
        &self,
        session: &mut SheetsSession,
        spreadsheet_id: &str,
        sheet: &str,
    ) -> Result<(), SheetsError> {
        let url = self.spreadsheet_url(spreadsheet_id, &[])?;
        let token = session.bearer().await?;
        let response = session
            .http
            .get(url)
            .query(&[("fields", "sheets.properties.title")])
            .bearer_auth(token)
            .send()
            .await?;

        let meta: SpreadsheetMeta = check(response).await?.json().await?;
        if meta.has_sheet(sheet) {
            Ok(())
        } else {
            Err(SheetsError::SheetNotFound {
                sheet: sheet.to_string(),
                spreadsheet: spreadsheet_id.to_string(),
            })
        }
    }

    async fn clear(
        &self,
        session: &mut SheetsSession,
        spreadsheet_id: &str,
        range: &str,
    ) -> Result<(), SheetsError> {
        let url = self.spreadsheet_url(spreadsheet_id, &["values", &format!("{}:clear", range)])?;
        let token = session.bearer().await?;
        let response = session
            .http
            .post(url)
            .bearer_auth(token)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn update(
        &self,
        session: &mut SheetsSession,
        spreadsheet_id: &str,
        range: &str,
        rows: &RowSet,
    ) -> Result<(), SheetsError> {
        let url = self.spreadsheet_url(spreadsheet_id, &["values", range])?;
        let token = session.bearer().await?;
        let body = ValueRange {
            range,
            major_dimension: "ROWS",
            values: rows,
        };
        let response = session
            .http
            .put(url)
            .query(&[("valueInputOption", VALUE_INPUT_OPTION)])
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl TableSink for GoogleSheetsClient {
    type Session = SheetsSession;
    type Error = SheetsError;

    async fn connect(&self, credentials: &Path) -> Result<SheetsSession, SheetsError> {
        tracing::info!(credentials = %credentials.display(), "connecting to Google Sheets API");

        let key = ServiceAccountKey::from_file(credentials)?;
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let token = fetch_token(&http, &key).await?;

        tracing::info!(account = %key.client_email, "connected to Google Sheets API");
        Ok(SheetsSession { http, key, token })
    }

    async fn replace(
        &self,
        session: &mut SheetsSession,
        spreadsheet_id: &str,
        sheet: &str,
        rows: &RowSet,
    ) -> Result<(), SheetsError> {
        tracing::info!(sheet, spreadsheet_id, "updating sheet");

        self.ensure_sheet(session, spreadsheet_id, sheet).await?;

        let range = sheet_range(sheet);
        self.clear(session, spreadsheet_id, &range).await?;
        if !rows.is_empty() {
            self.update(session, spreadsheet_id, &range, rows).await?;
        }

        tracing::info!(sheet, rows = rows.len(), "updated sheet");
        Ok(())
    }
}

/// A1 notation for every cell of a sheet: the quoted title
fn sheet_range(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}

/// Turn a non-success response into `SheetsError::Api`
async fn check(response: Response) -> Result<Response, SheetsError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ApiErrorBody>(&body) {
        Ok(err) => match err.error.status {
            Some(code) => format!("{} ({})", err.error.message, code),
            None => err.error.message,
        },
        Err(_) => body,
    };

    Err(SheetsError::Api {
        status: status.as_u16(),
        message,
    })
}
