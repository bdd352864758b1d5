use chrono::NaiveDate;
use std::fmt;

use crate::fetch::{AttemptSource, ReportWindow};
use crate::metrics::MetricRow;
use crate::notify::Notifier;
use crate::prepare::prepare_batch;
use crate::publish::ReportPublisher;
use crate::store::{AttemptStore, LoadReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Schema,
    Load,
    Aggregate,
    Publish,
    Notify,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Fetch => "fetch",
            Stage::Schema => "schema",
            Stage::Load => "load",
            Stage::Aggregate => "aggregate",
            Stage::Publish => "publish",
            Stage::Notify => "notify",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: Stage,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub report_date: NaiveDate,
    pub fetched: usize,
    pub accepted: usize,
    pub rejected: usize,
    /// Field errors across all rejected records.
    pub field_errors: usize,
    /// Rejected records whose embedded parameters were unusable.
    pub decode_errors: usize,
    pub load: Option<LoadReport>,
    pub metrics: Vec<MetricRow>,
    pub published: bool,
    pub notified: bool,
    pub failures: Vec<StageFailure>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed(&self, stage: Stage) -> bool {
        self.failures.iter().any(|f| f.stage == stage)
    }

    fn record(&mut self, stage: Stage, err: impl fmt::Display) {
        tracing::error!(%stage, error = %err, "stage failed");
        self.failures.push(StageFailure { stage, message: err.to_string() });
    }
}

/// One daily run: fetch, prepare, load, aggregate, publish, notify.
pub struct Pipeline<'a> {
    source: &'a dyn AttemptSource,
    store: &'a mut dyn AttemptStore,
    publisher: Option<&'a dyn ReportPublisher>,
    notifier: Option<&'a dyn Notifier>,
}

impl<'a> Pipeline<'a> {
    pub fn new(source: &'a dyn AttemptSource, store: &'a mut dyn AttemptStore) -> Self {
        Self { source, store, publisher: None, notifier: None }
    }

    pub fn with_publisher(mut self, publisher: &'a dyn ReportPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_notifier(mut self, notifier: &'a dyn Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Run every stage as far as it can go. The store is closed on every path.
    pub async fn run(mut self, window: &ReportWindow) -> RunReport {
        let mut report = RunReport { report_date: window.day, ..RunReport::default() };
        self.load_and_report(window, &mut report).await;

        self.store.close().await;

        if let Some(notifier) = self.notifier.filter(|_| report.load.is_some()) {
            match notifier.notify(&report).await {
                Ok(()) => report.notified = true,
                Err(e) => report.record(Stage::Notify, e),
            }
        }

        tracing::info!(
            day = %report.report_date,
            fetched = report.fetched,
            accepted = report.accepted,
            rejected = report.rejected,
            undecodable = report.decode_errors,
            failures = report.failures.len(),
            "run finished"
        );
        report
    }

    async fn load_and_report(&mut self, window: &ReportWindow, report: &mut RunReport) {
        // a failed download must not wipe the previous batch
        let raw = match self.source.fetch(window).await {
            Ok(raw) => raw,
            Err(e) => return report.record(Stage::Fetch, e),
        };
        report.fetched = raw.len();

        let batch = prepare_batch(&raw);
        report.accepted = batch.accepted.len();
        report.rejected = batch.rejected.len();
        report.field_errors = batch.failure_count();
        report.decode_errors = batch.decode_failure_count();

        let table = self.store.table().clone();
        if let Err(e) = self.store.ensure_schema().await {
            return report.record(Stage::Schema, e);
        }
        match self.store.replace_batch(&batch.accepted).await {
            Ok(load) => report.load = Some(load),
            Err(e) => return report.record(Stage::Load, e),
        }
        match self.store.daily_metrics().await {
            Ok(metrics) => report.metrics = metrics,
            Err(e) => return report.record(Stage::Aggregate, e),
        }
        tracing::info!(table = %table, metrics = ?report.metrics, "metrics computed");

        if let Some(publisher) = self.publisher {
            match publisher.publish(window.day, &report.metrics).await {
                Ok(()) => report.published = true,
                Err(e) => report.record(Stage::Publish, e),
            }
        }
    }
}
