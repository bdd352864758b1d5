use chrono::Duration;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

use crate::fetch::DEFAULT_STATS_URL;
use crate::notify::SmtpSettings;
use crate::store::{StoreError, TableName, DEFAULT_TABLE};

pub const DEFAULT_SHIFT_HOURS: i64 = 3;
pub const DEFAULT_WORKSHEET: &str = "Sheet1";
pub const DEFAULT_SMTP_PORT: u16 = 465;
pub const DEFAULT_LOG_DIR: &str = "logs";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),
    #[error("environment variable {var} has invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error(transparent)]
    Table(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct SheetsSettings {
    pub spreadsheet: String,
    pub worksheet: String,
    pub credentials: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub stats_url: String,
    pub stats_client: String,
    pub stats_client_key: String,
    pub tz_shift: Duration,
    pub database_url: String,
    pub table: TableName,
    pub sheets: Option<SheetsSettings>,
    pub smtp: Option<SmtpSettings>,
    pub log_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any variable lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let shift_hours: i64 = parse_or(get("STATS_TZ_SHIFT_HOURS"), "STATS_TZ_SHIFT_HOURS", DEFAULT_SHIFT_HOURS)?;
        let table = TableName::new(&get("GRADER_TABLE").unwrap_or_else(|| DEFAULT_TABLE.into()))?;

        let sheets = match get("SHEETS_SPREADSHEET") {
            Some(spreadsheet) => Some(SheetsSettings {
                spreadsheet,
                worksheet: get("SHEETS_WORKSHEET").unwrap_or_else(|| DEFAULT_WORKSHEET.into()),
                credentials: PathBuf::from(require("GOOGLE_APPLICATION_CREDENTIALS")?),
            }),
            None => None,
        };

        let smtp = match get("SMTP_HOST") {
            Some(host) => {
                let username = require("SMTP_USERNAME")?;
                let from = get("NOTIFY_FROM").unwrap_or_else(|| username.clone());
                Some(SmtpSettings {
                    host,
                    port: parse_or(get("SMTP_PORT"), "SMTP_PORT", DEFAULT_SMTP_PORT)?,
                    password: require("SMTP_PASSWORD")?,
                    to: get("NOTIFY_TO").unwrap_or_else(|| from.clone()),
                    from,
                    username,
                    report_link: get("REPORT_LINK"),
                })
            }
            None => None,
        };

        Ok(Self {
            stats_url: get("STATS_API_URL").unwrap_or_else(|| DEFAULT_STATS_URL.into()),
            stats_client: require("STATS_CLIENT")?,
            stats_client_key: require("STATS_CLIENT_KEY")?,
            tz_shift: Duration::hours(shift_hours),
            database_url: require("DATABASE_URL")?,
            table,
            sheets,
            smtp,
            log_dir: log_dir_from_lookup(&lookup),
        })
    }
}

/// Log directory alone, usable before the rest of the configuration is known.
pub fn log_dir_from_lookup<F>(lookup: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    lookup("LOG_DIR")
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| DEFAULT_LOG_DIR.into())
}

fn parse_or<T: FromStr>(raw: Option<String>, var: &'static str, default: T) -> Result<T, ConfigError> {
    match raw {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    const BASE: [(&str, &str); 3] = [
        ("STATS_CLIENT", "acme"),
        ("STATS_CLIENT_KEY", "k3y"),
        ("DATABASE_URL", "postgres://localhost/grades"),
    ];

    #[test]
    fn test_defaults_with_minimal_env() {
        let cfg = Config::from_lookup(lookup(&BASE)).unwrap();
        assert_eq!(cfg.stats_url, DEFAULT_STATS_URL);
        assert_eq!(cfg.tz_shift, Duration::hours(3));
        assert_eq!(cfg.table.as_str(), "grader");
        assert!(cfg.sheets.is_none());
        assert!(cfg.smtp.is_none());
        assert_eq!(cfg.log_dir, PathBuf::from("logs"));
    }

    #[test]
    fn test_missing_required_variable() {
        let err = Config::from_lookup(lookup(&BASE[..2])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn test_invalid_shift_and_table() {
        let mut pairs = BASE.to_vec();
        pairs.push(("STATS_TZ_SHIFT_HOURS", "three"));
        let err = Config::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "STATS_TZ_SHIFT_HOURS", .. }));

        let mut pairs = BASE.to_vec();
        pairs.push(("GRADER_TABLE", "grader; drop"));
        assert!(matches!(
            Config::from_lookup(lookup(&pairs)).unwrap_err(),
            ConfigError::Table(StoreError::InvalidTable(_))
        ));
    }

    #[test]
    fn test_smtp_settings_fall_back_to_username() {
        let mut pairs = BASE.to_vec();
        pairs.extend([
            ("SMTP_HOST", "smtp.example.com"),
            ("SMTP_USERNAME", "etl@example.com"),
            ("SMTP_PASSWORD", "secret"),
        ]);
        let smtp = Config::from_lookup(lookup(&pairs)).unwrap().smtp.unwrap();
        assert_eq!(smtp.port, 465);
        assert_eq!(smtp.from, "etl@example.com");
        assert_eq!(smtp.to, "etl@example.com");
    }

    #[test]
    fn test_smtp_requires_password() {
        let mut pairs = BASE.to_vec();
        pairs.extend([("SMTP_HOST", "smtp.example.com"), ("SMTP_USERNAME", "etl@example.com")]);
        let err = Config::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SMTP_PASSWORD")));
    }

    #[test]
    fn test_sheets_need_credentials() {
        let mut pairs = BASE.to_vec();
        pairs.push(("SHEETS_SPREADSHEET", "Daily aggregates"));
        assert!(matches!(
            Config::from_lookup(lookup(&pairs)).unwrap_err(),
            ConfigError::Missing("GOOGLE_APPLICATION_CREDENTIALS")
        ));

        pairs.push(("GOOGLE_APPLICATION_CREDENTIALS", "/etc/etl/key.json"));
        let sheets = Config::from_lookup(lookup(&pairs)).unwrap().sheets.unwrap();
        assert_eq!(sheets.worksheet, "Sheet1");
    }

    #[test]
    fn test_log_dir_resolves_without_full_config() {
        let empty = |_: &str| None;
        assert_eq!(log_dir_from_lookup(empty), PathBuf::from(DEFAULT_LOG_DIR));

        let pairs = [("LOG_DIR", "/var/log/grader")];
        assert_eq!(log_dir_from_lookup(lookup(&pairs)), PathBuf::from("/var/log/grader"));
        assert!(Config::from_lookup(lookup(&pairs)).is_err());
    }
}
