use grader_etl::{
    config::{log_dir_from_lookup, Config},
    db::PgStore,
    fetch::{ReportWindow, StatsClient},
    google_auth::{ServiceAccountKey, TokenSource},
    logging,
    notify::SmtpNotifier,
    pipeline::Pipeline,
    publish::SheetsPublisher,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            let _guard = logging::init(&log_dir_from_lookup(|key| std::env::var(key).ok()))?;
            tracing::error!(error = %e, "invalid configuration, nothing was run");
            return Err(e.into());
        }
    };
    let _guard = logging::init(&config.log_dir)?;

    let window = ReportWindow::yesterday(config.tz_shift);
    tracing::info!(day = %window.day, start = %window.start_param(), end = %window.end_param(), "daily run starting");

    let source = StatsClient::new(&config.stats_url, &config.stats_client, &config.stats_client_key);

    let publisher = match &config.sheets {
        Some(s) => match ServiceAccountKey::from_file(&s.credentials) {
            Ok(key) => Some(SheetsPublisher::new(
                TokenSource::ServiceAccount(key),
                &s.spreadsheet,
                &s.worksheet,
            )),
            Err(e) => {
                tracing::error!(error = %e, "report publishing disabled");
                None
            }
        },
        None => {
            tracing::warn!("SHEETS_SPREADSHEET not set, report publishing disabled");
            None
        }
    };
    let notifier = config.smtp.clone().map(SmtpNotifier::new);

    let mut store = PgStore::open(&config.database_url, config.table.clone()).await;

    let mut pipeline = Pipeline::new(&source, &mut store);
    if let Some(p) = &publisher {
        pipeline = pipeline.with_publisher(p);
    }
    if let Some(n) = &notifier {
        pipeline = pipeline.with_notifier(n);
    }
    let report = pipeline.run(&window).await;

    if report.is_success() {
        tracing::info!(rejected = report.rejected, "daily run completed");
    } else {
        for f in &report.failures {
            tracing::error!(stage = %f.stage, error = %f.message, "daily run incomplete");
        }
    }
    Ok(())
}
