//! Multi-window, multi-burn-rate SLO error budget tracking.
//!
//! Feeds `error_budget_burn_ratio_{5m,30m,1h,6h}` and the fast/slow burn
//! alert thresholds from spec.md §4.L: a fast burn (1h window and its 5m
//! short window both over 14.4x the budget) is critical; a slow burn (6h
//! and its 30m short window both over 6x) is a warning. Google's SRE
//! workbook multi-window approach, applied to gate decisions instead of
//! HTTP request error rates.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BudgetWindow {
    FiveMinutes,
    ThirtyMinutes,
    OneHour,
    SixHours,
}

pub const ALL_BUDGET_WINDOWS: [BudgetWindow; 4] =
    [BudgetWindow::FiveMinutes, BudgetWindow::ThirtyMinutes, BudgetWindow::OneHour, BudgetWindow::SixHours];

impl BudgetWindow {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FiveMinutes => "5m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::SixHours => "6h",
        }
    }

    fn duration(self) -> Duration {
        match self {
            Self::FiveMinutes => Duration::from_secs(5 * 60),
            Self::ThirtyMinutes => Duration::from_secs(30 * 60),
            Self::OneHour => Duration::from_secs(60 * 60),
            Self::SixHours => Duration::from_secs(6 * 60 * 60),
        }
    }
}

struct Event {
    at: Instant,
    is_error: bool,
}

/// A single ring buffer of gate outcomes backs all four windows; each
/// query trims (conceptually) to its own window by scanning from the most
/// recent event backwards, and the longest window (6h) bounds retention.
pub struct ErrorBudgetTracker {
    events: Mutex<VecDeque<Event>>,
}

impl Default for ErrorBudgetTracker {
    fn default() -> Self {
        Self { events: Mutex::new(VecDeque::new()) }
    }
}

impl ErrorBudgetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one gate outcome. `is_error` means the decision consumed
    /// error budget — a FAIL_SAFE_* result (the engine could not complete
    /// a normal evaluation), not a plain DENY/REQUIRE_APPROVAL, which are
    /// the system behaving as designed.
    pub fn record(&self, is_error: bool) {
        self.record_at(is_error, Instant::now());
    }

    fn record_at(&self, is_error: bool, at: Instant) {
        let mut events = self.events.lock().unwrap();
        events.push_back(Event { at, is_error });
        let retention = BudgetWindow::SixHours.duration();
        while events.front().map(|e| at.duration_since(e.at) > retention).unwrap_or(false) {
            events.pop_front();
        }
    }

    fn counts(&self, window: BudgetWindow, now: Instant) -> (u64, u64) {
        let events = self.events.lock().unwrap();
        let cutoff = window.duration();
        let mut errors = 0u64;
        let mut total = 0u64;
        for e in events.iter().rev() {
            if now.duration_since(e.at) > cutoff {
                break;
            }
            total += 1;
            if e.is_error {
                errors += 1;
            }
        }
        (errors, total)
    }

    /// `(observed error rate in window) / slo_error_budget`. `slo_error_budget`
    /// is `1 - target_availability` (e.g. `0.001` for a 99.9% SLO). A window
    /// with no traffic reports `0.0` — nothing is burning the budget.
    pub fn burn_ratio(&self, window: BudgetWindow, slo_error_budget: f64) -> f64 {
        self.burn_ratio_at(window, slo_error_budget, Instant::now())
    }

    fn burn_ratio_at(&self, window: BudgetWindow, slo_error_budget: f64, now: Instant) -> f64 {
        let (errors, total) = self.counts(window, now);
        if total == 0 || slo_error_budget <= 0.0 {
            return 0.0;
        }
        (errors as f64 / total as f64) / slo_error_budget
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurnAlert {
    None,
    Warning,
    Critical,
}

const FAST_BURN_THRESHOLD: f64 = 14.4;
const SLOW_BURN_THRESHOLD: f64 = 6.0;

/// Fast burn (1h + its 5m short window both ≥ 14.4x) pages immediately;
/// slow burn (6h + its 30m short window both ≥ 6x) is a warning. Fast
/// takes priority when both fire at once.
pub fn classify_burn_rate(ratio_1h: f64, ratio_5m: f64, ratio_6h: f64, ratio_30m: f64) -> BurnAlert {
    if ratio_1h >= FAST_BURN_THRESHOLD && ratio_5m >= FAST_BURN_THRESHOLD {
        BurnAlert::Critical
    } else if ratio_6h >= SLOW_BURN_THRESHOLD && ratio_30m >= SLOW_BURN_THRESHOLD {
        BurnAlert::Warning
    } else {
        BurnAlert::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn no_traffic_reports_zero_ratio() {
        let tracker = ErrorBudgetTracker::new();
        assert_eq!(tracker.burn_ratio(BudgetWindow::FiveMinutes, 0.001), 0.0);
    }

    #[test]
    fn all_errors_burns_at_full_rate_over_budget() {
        let tracker = ErrorBudgetTracker::new();
        for _ in 0..10 {
            tracker.record(true);
        }
        // 100% observed error rate / 0.1% budget = 1000x burn.
        assert_eq!(tracker.burn_ratio(BudgetWindow::OneHour, 0.001), 1000.0);
    }

    #[test]
    fn mixed_outcomes_produce_partial_burn_ratio() {
        let tracker = ErrorBudgetTracker::new();
        for _ in 0..9 {
            tracker.record(false);
        }
        tracker.record(true);
        // 1/10 = 10% observed error rate / 1% budget = 10x burn.
        assert_eq!(tracker.burn_ratio(BudgetWindow::OneHour, 0.01), 10.0);
    }

    #[test]
    fn events_older_than_window_are_excluded() {
        let tracker = ErrorBudgetTracker::new();
        tracker.record_at(true, Instant::now() - Duration::from_secs(10 * 60));
        tracker.record_at(false, Instant::now());
        // the error is outside the 5m window; only the healthy event counts.
        assert_eq!(tracker.burn_ratio(BudgetWindow::FiveMinutes, 0.001), 0.0);
    }

    #[test]
    fn classify_fast_burn_is_critical() {
        assert_eq!(classify_burn_rate(20.0, 20.0, 0.0, 0.0), BurnAlert::Critical);
    }

    #[test]
    fn classify_requires_both_fast_windows_over_threshold() {
        // 1h over threshold but 5m short window isn't corroborating yet.
        assert_eq!(classify_burn_rate(20.0, 1.0, 0.0, 0.0), BurnAlert::None);
    }

    #[test]
    fn classify_slow_burn_is_warning() {
        assert_eq!(classify_burn_rate(1.0, 1.0, 7.0, 7.0), BurnAlert::Warning);
    }

    #[test]
    fn classify_fast_takes_priority_over_slow() {
        assert_eq!(classify_burn_rate(20.0, 20.0, 7.0, 7.0), BurnAlert::Critical);
    }

    #[test]
    fn classify_below_both_thresholds_is_none() {
        assert_eq!(classify_burn_rate(1.0, 1.0, 1.0, 1.0), BurnAlert::None);
    }

    #[test]
    fn real_time_retention_drops_events_past_six_hours() {
        let tracker = ErrorBudgetTracker::new();
        tracker.record(true);
        sleep(Duration::from_millis(5));
        let (_, total) = tracker.counts(BudgetWindow::FiveMinutes, Instant::now());
        assert_eq!(total, 1);
    }
}
