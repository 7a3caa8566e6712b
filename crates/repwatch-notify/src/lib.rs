//! Report notification capability + Discord webhook implementation.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repwatch_core::Report;
use serde_json::{json, Value};
use tracing::debug;

pub const CRATE_NAME: &str = "repwatch-notify";

/// The one capability the synchronizer depends on: push a human-readable
/// alert for a new or updated report to the operator channel.
#[async_trait]
pub trait ReportNotifier: Send + Sync {
    async fn send_report(&self, report: &Report) -> anyhow::Result<()>;
}

/// Posts report embeds to a Discord-compatible webhook URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl WebhookNotifier {
    pub fn new(webhook_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building webhook client")?;
        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
        })
    }
}

#[async_trait]
impl ReportNotifier for WebhookNotifier {
    async fn send_report(&self, report: &Report) -> anyhow::Result<()> {
        let payload = json!({ "embeds": [report_embed(report)] });
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .context("posting report notification webhook")?;
        response
            .error_for_status()
            .context("report notification webhook rejected")?;
        debug!(report_id = report.report_id, "sent report notification");
        Ok(())
    }
}

/// Build the embed object for a report. A report without a latest comment is
/// rendered with placeholder text rather than dropped.
pub fn report_embed(report: &Report) -> Value {
    let report_date = DateTime::<Utc>::from_timestamp(report.first_report_date, 0)
        .map(|date| date.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let (reported_by, description) = match &report.latest_report_comment {
        Some(comment) => (comment.username.clone(), comment.message.clone()),
        None => ("unknown".to_string(), "(no comment)".to_string()),
    };
    let thread_title = if report.content_info.thread_title.is_empty() {
        "No thread title"
    } else {
        report.content_info.thread_title.as_str()
    };

    json!({
        "title": format!("{} - [{}]", report.content_info.username, report.report_id),
        "url": report.report_url,
        "description": description,
        "fields": [
            { "name": "Report date", "value": report_date },
            { "name": "Reported by", "value": reported_by },
            { "name": "Thread title", "value": thread_title },
            { "name": "Report count", "value": report.report_count.to_string() },
        ],
        "timestamp": Utc::now().to_rfc3339(),
    })
}
