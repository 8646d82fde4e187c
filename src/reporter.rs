//! JSON-line reporting to stdout. Logs go to stderr, so stdout carries
//! nothing but machine-readable feed output.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::session::{FeedEvent, SessionSummary};

#[derive(Serialize)]
struct FeedReport<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a FeedEvent,
}

/// Emit a feed event as a single JSON line to stdout, stamped with the
/// emission time.
pub fn report_event(event: &FeedEvent) {
    let report = FeedReport {
        timestamp: Utc::now(),
        event,
    };
    if let Ok(json) = serde_json::to_string(&report) {
        println!("{json}");
    }
}

/// Emit the exit summary as pretty-printed JSON to stdout.
pub fn report_exit_summary(summary: &SessionSummary) {
    if let Ok(json) = serde_json::to_string_pretty(summary) {
        println!("{json}");
    }
}
