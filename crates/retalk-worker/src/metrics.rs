//! Pipeline metrics.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! embedding process installs a recorder.

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    pub const RUNS_STARTED_TOTAL: &str = "retalk_runs_started_total";
    pub const RUNS_COMPLETED_TOTAL: &str = "retalk_runs_completed_total";
    pub const RUNS_FAILED_TOTAL: &str = "retalk_runs_failed_total";
    pub const RUN_DURATION_SECONDS: &str = "retalk_run_duration_seconds";

    pub const SEGMENTS_SYNTHESIZED_TOTAL: &str = "retalk_segments_synthesized_total";
    pub const SYNTHESIS_DURATION_SECONDS: &str = "retalk_synthesis_duration_seconds";

    pub const CLEANUP_WARNINGS_TOTAL: &str = "retalk_cleanup_warnings_total";
}

pub fn record_run_started(segmented: bool) {
    let labels = [("segmented", segmented.to_string())];
    counter!(names::RUNS_STARTED_TOTAL, &labels).increment(1);
}

pub fn record_run_completed(duration_secs: f64) {
    counter!(names::RUNS_COMPLETED_TOTAL).increment(1);
    histogram!(names::RUN_DURATION_SECONDS).record(duration_secs);
}

/// `stage` is where the run failed.
pub fn record_run_failed(stage: &str) {
    let labels = [("stage", stage.to_string())];
    counter!(names::RUNS_FAILED_TOTAL, &labels).increment(1);
}

pub fn record_segment_synthesized(success: bool, duration_secs: f64) {
    let labels = [(
        "outcome",
        if success { "success" } else { "failure" }.to_string(),
    )];
    counter!(names::SEGMENTS_SYNTHESIZED_TOTAL, &labels).increment(1);
    histogram!(names::SYNTHESIS_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_cleanup_warnings(count: usize) {
    if count > 0 {
        counter!(names::CLEANUP_WARNINGS_TOTAL).increment(count as u64);
    }
}
