//! Report synchronization: configuration, the per-cycle reconciliation
//! service, and the fixed-interval polling loop.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use repwatch_core::Report;
use repwatch_notify::ReportNotifier;
use repwatch_storage::{BackoffPolicy, FetchConfig, ReportFetcher, ReportStore};
use serde::Serialize;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "repwatch-sync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("environment variable {key} must be a positive integer, got: {value}")]
    InvalidNumber { key: &'static str, value: String },
}

/// Immutable process configuration, resolved once at startup. Required
/// values fail fast; polling and retry parameters have defaults.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub base_url: String,
    pub report_api_url: String,
    pub report_url: String,
    pub report_api_key: String,
    pub webhook_url: String,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub http_timeout: Duration,
    pub db_path: PathBuf,
}

impl BotConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration through an injected lookup, so tests never have
    /// to mutate the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let base_url = required(&lookup, "BASE_URL")?;
        let report_api_key = required(&lookup, "REPORT_API_KEY")?;
        let webhook_url = required(&lookup, "DISCORD_WEBHOOK_URL")?;
        let poll_seconds = positive(&lookup, "REPORT_POLL_SECONDS", 60)?;
        let max_retries = positive(&lookup, "REPORT_MAX_RETRIES", 3)?;
        let retry_delay_ms = positive(&lookup, "REPORT_RETRY_DELAY_MS", 1000)?;
        let timeout_secs = positive(&lookup, "REPORT_HTTP_TIMEOUT_SECS", 10)?;
        let db_path = lookup("REPORT_DB_PATH")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "reports.json".to_string());

        Ok(Self {
            report_api_url: format!("{base_url}api/reports/"),
            report_url: format!("{base_url}forums/reports/"),
            base_url,
            report_api_key,
            webhook_url,
            poll_interval: Duration::from_secs(poll_seconds),
            max_retries: max_retries as u32,
            retry_base_delay: Duration::from_millis(retry_delay_ms),
            http_timeout: Duration::from_secs(timeout_secs),
            db_path: PathBuf::from(db_path),
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_retries,
            base_delay: self.retry_base_delay,
        }
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            api_url: self.report_api_url.clone(),
            api_key: self.report_api_key.clone(),
            timeout: self.http_timeout,
            backoff: self.backoff(),
        }
    }
}

fn required(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<String, ConfigError> {
    lookup(key)
        .filter(|value| !value.trim().is_empty())
        .ok_or(ConfigError::MissingVar(key))
}

fn positive(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match lookup(key).filter(|value| !value.trim().is_empty()) {
        None => Ok(default),
        Some(value) => match value.parse::<u64>() {
            Ok(parsed) if parsed > 0 => Ok(parsed),
            _ => Err(ConfigError::InvalidNumber { key, value }),
        },
    }
}

/// What one reconciliation cycle did to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub new_reports: usize,
    pub updated_reports: usize,
    pub removed_reports: usize,
}

enum Disposition {
    New,
    Updated,
    Unchanged,
}

/// Reconciles the remote report collection against the local store once per
/// cycle and emits notifications for new or updated reports.
pub struct ReportService {
    fetcher: ReportFetcher,
    store: ReportStore,
    notifier: Box<dyn ReportNotifier>,
    report_url: String,
}

impl ReportService {
    pub fn new(
        fetcher: ReportFetcher,
        store: ReportStore,
        notifier: Box<dyn ReportNotifier>,
        report_url: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            store,
            notifier,
            report_url: report_url.into(),
        }
    }

    pub fn store(&self) -> &ReportStore {
        &self.store
    }

    /// Run one cycle: fetch, map, diff against the store, persist changes,
    /// garbage-collect stale records.
    ///
    /// `notify` is false for the initial pass after startup so the channel is
    /// not flooded with every currently open report.
    pub async fn process_reports(&mut self, notify: bool) -> Result<CycleSummary> {
        info!("polling report API");

        let wire_reports = self.fetcher.fetch().await;
        let mut active_ids = HashSet::with_capacity(wire_reports.len());
        let mut summary = CycleSummary::default();

        for wire in wire_reports {
            let report = Report::from_wire(wire, &self.report_url);
            active_ids.insert(report.report_id);

            let disposition = match self.store.get(report.report_id) {
                None => Disposition::New,
                Some(existing) if existing.has_new_comment(&report) => Disposition::Updated,
                Some(_) => Disposition::Unchanged,
            };

            match disposition {
                Disposition::New => {
                    self.store.save(report.clone());
                    summary.new_reports += 1;
                    if notify {
                        self.notify(&report).await;
                    }
                }
                Disposition::Updated => {
                    self.store
                        .update_comments(&report)
                        .context("updating report comments")?;
                    summary.updated_reports += 1;
                    if notify {
                        self.notify(&report).await;
                    }
                }
                Disposition::Unchanged => {}
            }
        }

        if summary.new_reports > 0 || summary.updated_reports > 0 {
            self.store.flush().await.context("flushing report store")?;
            info!(
                new = summary.new_reports,
                updated = summary.updated_reports,
                "saved report changes"
            );
        }

        summary.removed_reports = self
            .store
            .remove_stale(&active_ids)
            .await
            .context("removing stale reports")?;
        if summary.removed_reports > 0 {
            info!(removed = summary.removed_reports, "deleted stale reports");
        }

        Ok(summary)
    }

    /// Notification failures are logged and swallowed; they never block
    /// persistence or stale cleanup.
    async fn notify(&self, report: &Report) {
        if let Err(err) = self.notifier.send_report(report).await {
            warn!(
                report_id = report.report_id,
                error = %err,
                "failed to send report notification"
            );
        }
    }
}

/// Poll on a fixed interval until a shutdown signal arrives. A cycle that
/// overruns the interval delays the next one; cycles never overlap. The
/// shutdown signal is only observed between cycles, so an in-flight flush
/// always completes.
pub async fn run(mut service: ReportService, poll_interval: Duration) -> Result<()> {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; consume it so the loop waits a full
    // interval after the initial pass.
    ticker.tick().await;

    info!(
        interval_secs = poll_interval.as_secs(),
        "starting report poll schedule"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            result = tokio::signal::ctrl_c() => {
                result.context("listening for shutdown signal")?;
                info!("shutdown signal received, stopping poll schedule");
                return Ok(());
            }
        }

        match service.process_reports(true).await {
            Ok(summary) => debug!(?summary, "report cycle complete"),
            Err(err) => error!(error = %err, "report cycle failed"),
        }
    }
}
