//! Per-action request telemetry.
//!
//! Purely observational: records start times by request id and aggregates
//! outcomes under the lower-cased action name. Nothing here affects control
//! flow.

// ============================================================================
// Imports
// ============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::identifiers::RequestId;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Default, Clone)]
struct ActionStats {
    success_count: u64,
    failure_count: u64,
    total_success: Duration,
    total_failure: Duration,
    last_duration: Duration,
}

/// Aggregated numbers for one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSummary {
    /// Lower-cased action name.
    pub action: String,
    /// Successful completions.
    pub success_count: u64,
    /// Failed completions.
    pub failure_count: u64,
    /// Duration of the most recent completion.
    pub last_duration: Duration,
    /// Mean successful duration.
    pub average_success: Duration,
    /// Mean failed duration.
    pub average_failure: Duration,
}

// ============================================================================
// Telemetry
// ============================================================================

/// Request timing aggregator.
#[derive(Debug, Default)]
pub struct Telemetry {
    started: Mutex<FxHashMap<RequestId, (String, Instant)>>,
    stats: Mutex<FxHashMap<String, ActionStats>>,
}

impl Telemetry {
    /// Creates an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `request_id` started now.
    pub fn start(&self, request_id: &RequestId, action: &str) {
        self.start_at(request_id, action, Instant::now());
    }

    /// Records that `request_id` started at `at`.
    pub fn start_at(&self, request_id: &RequestId, action: &str, at: Instant) {
        self.started
            .lock()
            .insert(request_id.clone(), (action.to_lowercase(), at));
    }

    /// Completes `request_id` now. Returns its duration if it was started.
    pub fn record(
        &self,
        request_id: &RequestId,
        success: bool,
        message: Option<&str>,
        error_code: Option<&str>,
    ) -> Option<Duration> {
        self.record_at(request_id, success, message, error_code, Instant::now())
    }

    /// Completes `request_id` at `at`.
    pub fn record_at(
        &self,
        request_id: &RequestId,
        success: bool,
        message: Option<&str>,
        error_code: Option<&str>,
        at: Instant,
    ) -> Option<Duration> {
        let (action, started_at) = self.started.lock().remove(request_id)?;
        let elapsed = at.saturating_duration_since(started_at);

        {
            let mut stats = self.stats.lock();
            let entry = stats.entry(action.clone()).or_default();
            if success {
                entry.success_count += 1;
                entry.total_success += elapsed;
            } else {
                entry.failure_count += 1;
                entry.total_failure += elapsed;
            }
            entry.last_duration = elapsed;
        }

        debug!(
            %request_id,
            action,
            success,
            elapsed_ms = elapsed.as_millis() as u64,
            message = message.unwrap_or_default(),
            error_code = error_code.unwrap_or_default(),
            "Automation request completed"
        );
        Some(elapsed)
    }

    /// Forgets a started request without recording an outcome.
    pub fn discard(&self, request_id: &RequestId) -> bool {
        self.started.lock().remove(request_id).is_some()
    }

    /// Returns the number of started, not yet recorded requests.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.started.lock().len()
    }

    /// Returns one summary per action, sorted by name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ActionSummary> {
        let stats = self.stats.lock();
        let mut summaries: Vec<_> = stats
            .iter()
            .map(|(action, s)| ActionSummary {
                action: action.clone(),
                success_count: s.success_count,
                failure_count: s.failure_count,
                last_duration: s.last_duration,
                average_success: average(s.total_success, s.success_count),
                average_failure: average(s.total_failure, s.failure_count),
            })
            .collect();
        summaries.sort_by(|a, b| a.action.cmp(&b.action));
        summaries
    }

    /// Logs one line per action.
    pub fn log_summary(&self) {
        for summary in self.snapshot() {
            info!(
                action = %summary.action,
                success = summary.success_count,
                failure = summary.failure_count,
                last_ms = summary.last_duration.as_millis() as u64,
                avg_success_ms = summary.average_success.as_millis() as u64,
                avg_failure_ms = summary.average_failure.as_millis() as u64,
                "Automation telemetry"
            );
        }
    }

    /// Drops all state.
    pub fn clear(&self) {
        self.started.lock().clear();
        self.stats.lock().clear();
    }
}

fn average(total: Duration, count: u64) -> Duration {
    match u32::try_from(count) {
        Ok(0) => Duration::ZERO,
        Ok(n) => total / n,
        Err(_) => Duration::from_secs_f64(total.as_secs_f64() / count as f64),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregates_by_lowercased_action() {
        let telemetry = Telemetry::new();
        let t0 = Instant::now();

        let a = RequestId::from("a");
        let b = RequestId::from("b");
        let c = RequestId::from("c");
        telemetry.start_at(&a, "Create_Asset", t0);
        telemetry.start_at(&b, "create_asset", t0);
        telemetry.start_at(&c, "CREATE_ASSET", t0);
        assert_eq!(telemetry.in_flight(), 3);

        telemetry.record_at(&a, true, Some("ok"), None, t0 + Duration::from_millis(10));
        telemetry.record_at(&b, true, None, None, t0 + Duration::from_millis(30));
        telemetry.record_at(&c, false, None, Some("E"), t0 + Duration::from_millis(50));

        let summary = telemetry.snapshot();
        assert_eq!(summary.len(), 1);
        let s = &summary[0];
        assert_eq!(s.action, "create_asset");
        assert_eq!(s.success_count, 2);
        assert_eq!(s.failure_count, 1);
        assert_eq!(s.last_duration, Duration::from_millis(50));
        assert_eq!(s.average_success, Duration::from_millis(20));
        assert_eq!(s.average_failure, Duration::from_millis(50));
        assert_eq!(telemetry.in_flight(), 0);
    }

    #[test]
    fn test_unknown_request_ignored() {
        let telemetry = Telemetry::new();
        assert!(telemetry.record(&RequestId::from("x"), true, None, None).is_none());
        assert!(telemetry.snapshot().is_empty());
    }

    #[test]
    fn test_record_removes_entry() {
        let telemetry = Telemetry::new();
        let id = RequestId::from("once");
        telemetry.start(&id, "ping");
        assert!(telemetry.record(&id, true, None, None).is_some());
        assert!(telemetry.record(&id, true, None, None).is_none());

        telemetry.log_summary();
        telemetry.clear();
        assert!(telemetry.snapshot().is_empty());
    }

    #[test]
    fn test_discard_leaves_stats_untouched() {
        let telemetry = Telemetry::new();
        let id = RequestId::from("abandoned");
        telemetry.start(&id, "bake");
        assert_eq!(telemetry.in_flight(), 1);

        assert!(telemetry.discard(&id));
        assert!(!telemetry.discard(&id));
        assert_eq!(telemetry.in_flight(), 0);
        assert!(telemetry.snapshot().is_empty());
        assert!(telemetry.record(&id, true, None, None).is_none());
    }
}
