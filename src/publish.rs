use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::google_auth::{AuthError, TokenSource};
use crate::metrics::MetricRow;

pub const HEADERS: [&str; 3] = ["Report date", "Metric", "Value"];
pub const APPEND_PAGE_ROWS: usize = 500;
const SPREADSHEET_MIME: &str = "application/vnd.google-apps.spreadsheet";

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("spreadsheet {0:?} not found")]
    SpreadsheetNotFound(String),
    #[error("worksheet {worksheet:?} not found in {spreadsheet:?}")]
    WorksheetNotFound { spreadsheet: String, worksheet: String },
    #[error("authorization failed: {0}")]
    Auth(#[from] AuthError),
    #[error("report request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid API base url: {0}")]
    Url(String),
}

/// Destination for the daily metrics.
#[async_trait]
pub trait ReportPublisher: Send + Sync {
    async fn publish(&self, date: NaiveDate, metrics: &[MetricRow]) -> Result<(), PublishError>;
}

/// Rows written to the report: the header, then `(date, metric, value)`.
pub fn report_rows(date: NaiveDate, metrics: &[MetricRow]) -> Vec<Value> {
    let day = date.format("%Y-%m-%d").to_string();
    std::iter::once(json!(HEADERS))
        .chain(metrics.iter().map(|m| json!([day, m.name(), m.value])))
        .collect()
}

#[derive(Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Deserialize)]
struct DriveFile {
    id: String,
}

#[derive(Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<Sheet>,
}

#[derive(Deserialize)]
struct Sheet {
    properties: SheetProperties,
}

#[derive(Deserialize)]
struct SheetProperties {
    title: String,
}

pub struct SheetsPublisher {
    http: Client,
    tokens: TokenSource,
    spreadsheet: String,
    worksheet: String,
    sheets_base: String,
    drive_base: String,
}

impl SheetsPublisher {
    pub fn new(tokens: TokenSource, spreadsheet: impl Into<String>, worksheet: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            tokens,
            spreadsheet: spreadsheet.into(),
            worksheet: worksheet.into(),
            sheets_base: "https://sheets.googleapis.com".into(),
            drive_base: "https://www.googleapis.com".into(),
        }
    }

    /// Point both APIs at another host.
    pub fn with_base_urls(mut self, sheets: impl Into<String>, drive: impl Into<String>) -> Self {
        self.sheets_base = sheets.into();
        self.drive_base = drive.into();
        self
    }

    fn url(base: &str, segments: &[&str]) -> Result<Url, PublishError> {
        let mut url = Url::parse(base).map_err(|e| PublishError::Url(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| PublishError::Url(base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn range(&self) -> String {
        format!("'{}'", self.worksheet.replace('\'', "''"))
    }

    async fn find_spreadsheet(&self, token: &str) -> Result<String, PublishError> {
        let q = format!(
            "name = '{}' and mimeType = '{SPREADSHEET_MIME}' and trashed = false",
            self.spreadsheet.replace('\\', "\\\\").replace('\'', "\\'")
        );
        let list: FileList = self
            .http
            .get(Self::url(&self.drive_base, &["drive", "v3", "files"])?)
            .bearer_auth(token)
            .query(&[("q", q.as_str()), ("fields", "files(id)")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        list.files
            .into_iter()
            .next()
            .map(|f| f.id)
            .ok_or_else(|| PublishError::SpreadsheetNotFound(self.spreadsheet.clone()))
    }

    async fn check_worksheet(&self, token: &str, id: &str) -> Result<(), PublishError> {
        let meta: SpreadsheetMeta = self
            .http
            .get(Self::url(&self.sheets_base, &["v4", "spreadsheets", id])?)
            .bearer_auth(token)
            .query(&[("fields", "sheets.properties.title")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if meta.sheets.iter().any(|s| s.properties.title == self.worksheet) {
            Ok(())
        } else {
            Err(PublishError::WorksheetNotFound {
                spreadsheet: self.spreadsheet.clone(),
                worksheet: self.worksheet.clone(),
            })
        }
    }

    async fn clear(&self, token: &str, id: &str) -> Result<(), PublishError> {
        let op = format!("{}:clear", self.range());
        self.http
            .post(Self::url(&self.sheets_base, &["v4", "spreadsheets", id, "values", op.as_str()])?)
            .bearer_auth(token)
            .json(&json!({}))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn append(&self, token: &str, id: &str, rows: &[Value]) -> Result<(), PublishError> {
        let op = format!("{}:append", self.range());
        let url = Self::url(&self.sheets_base, &["v4", "spreadsheets", id, "values", op.as_str()])?;
        for page in rows.chunks(APPEND_PAGE_ROWS) {
            self.http
                .post(url.clone())
                .bearer_auth(token)
                .query(&[("valueInputOption", "RAW"), ("insertDataOption", "INSERT_ROWS")])
                .json(&json!({ "values": page }))
                .send()
                .await?
                .error_for_status()?;
        }
        Ok(())
    }
}

#[async_trait]
impl ReportPublisher for SheetsPublisher {
    async fn publish(&self, date: NaiveDate, metrics: &[MetricRow]) -> Result<(), PublishError> {
        let token = self.tokens.access_token(&self.http).await?;
        let id = self.find_spreadsheet(&token).await?;
        self.check_worksheet(&token, &id).await?;
        self.clear(&token, &id).await?;
        self.append(&token, &id, &report_rows(date, metrics)).await?;
        tracing::info!(
            spreadsheet = %self.spreadsheet,
            worksheet = %self.worksheet,
            rows = metrics.len(),
            "report published"
        );
        Ok(())
    }
}
