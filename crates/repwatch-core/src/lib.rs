//! Core domain model for repwatch: moderation reports as the forum API
//! returns them, plus the canonical persisted representation.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "repwatch-core";

/// One moderation remark attached to a report. `report_comment_id` is
/// assigned monotonically by the forum within its parent report; it is not
/// globally unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportComment {
    pub report_id: u64,
    pub report_comment_id: u64,
    pub comment_date: i64,
    pub message: String,
    pub username: String,
    pub state: String,
}

/// The reported content as the forum describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentInfo {
    pub message: String,
    pub node_id: u64,
    pub node_name: String,
    pub post_id: u64,
    pub thread_id: u64,
    pub thread_title: String,
    pub user_id: u64,
    pub username: String,
    pub post_date: i64,
}

/// Moderation report exactly as returned by the report API. Comment order is
/// the chronological order of moderation commentary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireReport {
    pub report_id: u64,
    pub report_count: u32,
    pub last_modified_date: i64,
    pub first_report_date: i64,
    pub content_info: ContentInfo,
    #[serde(default)]
    pub report_comment: Vec<ReportComment>,
}

/// Canonical persisted report: the wire fields plus the derived permalink and
/// latest-comment pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub report_id: u64,
    pub report_count: u32,
    pub last_modified_date: i64,
    pub first_report_date: i64,
    pub content_info: ContentInfo,
    pub report_comment: Vec<ReportComment>,
    pub report_url: String,
    pub latest_report_comment: Option<ReportComment>,
}

impl Report {
    /// Derive the canonical representation from a wire record.
    ///
    /// `latest_report_comment` is the last element of the comment sequence in
    /// the order the API returned it. The API does not return reports without
    /// comments, so `None` marks an anomalous record, not a normal one.
    pub fn from_wire(wire: WireReport, report_url_base: &str) -> Self {
        let report_url = format!("{report_url_base}{}", wire.report_id);
        let latest_report_comment = wire.report_comment.last().cloned();
        Self {
            report_id: wire.report_id,
            report_count: wire.report_count,
            last_modified_date: wire.last_modified_date,
            first_report_date: wire.first_report_date,
            content_info: wire.content_info,
            report_comment: wire.report_comment,
            report_url,
            latest_report_comment,
        }
    }

    /// Freshness marker: the id of the latest moderation comment, if any.
    pub fn latest_comment_id(&self) -> Option<u64> {
        self.latest_report_comment
            .as_ref()
            .map(|comment| comment.report_comment_id)
    }

    /// Whether `newer` carries a different comment state than `self`.
    /// Both-absent counts as unchanged.
    pub fn has_new_comment(&self, newer: &Report) -> bool {
        self.latest_comment_id() != newer.latest_comment_id()
    }
}
