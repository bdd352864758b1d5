use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::fmt::Write;
use thiserror::Error;

use crate::pipeline::RunReport;

pub const SUBJECT: &str = "Grader load completed";

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("invalid mailbox: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("cannot build message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("smtp delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, report: &RunReport) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    pub to: String,
    pub report_link: Option<String>,
}

pub struct SmtpNotifier {
    settings: SmtpSettings,
}

impl SmtpNotifier {
    pub fn new(settings: SmtpSettings) -> Self {
        Self { settings }
    }

    pub fn message(&self, report: &RunReport) -> Result<Message, NotifyError> {
        let from: Mailbox = self.settings.from.parse()?;
        let to: Mailbox = self.settings.to.parse()?;
        Ok(Message::builder()
            .from(from)
            .to(to)
            .subject(SUBJECT)
            .header(ContentType::TEXT_PLAIN)
            .body(summary(report, self.settings.report_link.as_deref()))?)
    }
}

/// Plain-text body of the completion email.
pub fn summary(report: &RunReport, link: Option<&str>) -> String {
    let mut body = format!(
        "Hello,\n\nAttempts for {} have been loaded into the database.\n\n",
        report.report_date
    );
    let loaded = report.load.map(|l| l.inserted).unwrap_or(0);
    let _ = writeln!(body, "Rows loaded: {loaded}");
    let _ = writeln!(body, "Records rejected: {}", report.rejected);
    if report.decode_errors > 0 {
        let _ = writeln!(body, "  with unreadable passback_params: {}", report.decode_errors);
    }
    for m in &report.metrics {
        let _ = writeln!(body, "{}: {}", m.name(), m.value);
    }
    if let Some(link) = link {
        let _ = write!(body, "\nThe report is available at {link}\n");
    }
    body
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(&self, report: &RunReport) -> Result<(), NotifyError> {
        let email = self.message(report)?;
        // relay() speaks implicit TLS
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&self.settings.host)?
            .port(self.settings.port)
            .credentials(Credentials::new(
                self.settings.username.clone(),
                self.settings.password.clone(),
            ))
            .build();
        mailer.send(email).await?;
        tracing::info!(to = %self.settings.to, "completion email sent");
        Ok(())
    }
}
