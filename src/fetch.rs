use async_trait::async_trait;
use chrono::{Duration, Local, NaiveDate, NaiveDateTime, NaiveTime};
use reqwest::{Client, StatusCode};
use thiserror::Error;

use crate::models::RawAttempt;

pub const DEFAULT_STATS_URL: &str = "https://b2b.itresume.ru/api/statistics";
pub const WINDOW_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request to statistics API failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("statistics API {url} answered {status}")]
    Status { url: String, status: StatusCode },
    #[error("statistics API body is not a list of attempts: {0}")]
    Decode(#[from] serde_json::Error),
}

/// One reporting day and the upstream time range that covers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportWindow {
    pub day: NaiveDate,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl ReportWindow {
    /// Whole calendar `day`, shifted by `shift` into upstream time.
    pub fn for_day(day: NaiveDate, shift: Duration) -> Self {
        let midnight = day.and_time(NaiveTime::MIN);
        Self {
            day,
            start: midnight + shift,
            end: midnight + Duration::days(1) - Duration::microseconds(1) + shift,
        }
    }

    pub fn yesterday(shift: Duration) -> Self {
        Self::for_day(Local::now().date_naive() - Duration::days(1), shift)
    }

    pub fn start_param(&self) -> String {
        self.start.format(WINDOW_FORMAT).to_string()
    }

    pub fn end_param(&self) -> String {
        self.end.format(WINDOW_FORMAT).to_string()
    }
}

/// Where a day's raw attempts come from.
#[async_trait]
pub trait AttemptSource: Send + Sync {
    async fn fetch(&self, window: &ReportWindow) -> Result<Vec<RawAttempt>, FetchError>;
}

pub struct StatsClient {
    http: Client,
    url: String,
    client: String,
    client_key: String,
}

impl StatsClient {
    pub fn new(url: impl Into<String>, client: impl Into<String>, client_key: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            url: url.into(),
            client: client.into(),
            client_key: client_key.into(),
        }
    }
}

#[async_trait]
impl AttemptSource for StatsClient {
    async fn fetch(&self, window: &ReportWindow) -> Result<Vec<RawAttempt>, FetchError> {
        tracing::info!(day = %window.day, "downloading attempts");
        let res = self
            .http
            .get(&self.url)
            .query(&[
                ("client", self.client.as_str()),
                ("client_key", self.client_key.as_str()),
                ("start", window.start_param().as_str()),
                ("end", window.end_param().as_str()),
            ])
            .send()
            .await?;

        let status = res.status();
        if status != StatusCode::OK {
            tracing::error!(url = %self.url, %status, "statistics API refused the request");
            return Err(FetchError::Status { url: self.url.clone(), status });
        }

        let body = res.text().await?;
        let attempts: Vec<RawAttempt> = serde_json::from_str(&body)?;
        tracing::info!(count = attempts.len(), "download finished");
        Ok(attempts)
    }
}
