//! Computed context builder.
//!
//! Produces a deterministic spend/risk snapshot for `(tenant, decision_time)`.
//! All randomness and wall-clock reads happen outside this module — callers
//! pass `decision_time` in explicitly so the snapshot is reproducible.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Current computation ruleset version. Bump whenever a formula below changes.
pub const CONTEXT_VERSION: i32 = 1;

/// Reads precomputed daily cost totals for a tenant. Implemented by an
/// external collaborator (cloud cost adapter); this core never computes cost
/// from raw telemetry itself.
#[async_trait]
pub trait CostHistoryReader: Send + Sync {
    /// Returns `(day, total_usd)` pairs for days with a recorded cost, within
    /// `[month_start, through]` inclusive. Days with no activity are simply
    /// absent from the result rather than zero-valued.
    async fn daily_costs(
        &self,
        tenant_id: &str,
        month_start: NaiveDate,
        through: NaiveDate,
    ) -> anyhow::Result<Vec<(NaiveDate, Decimal)>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyKind {
    None,
    Spike,
    Drop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub delta_usd: Decimal,
    pub percent: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskClass {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceMode {
    None,
    Partial,
    AllStatus,
    Unavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputedContext {
    pub month_start: NaiveDate,
    pub month_end: NaiveDate,
    pub month_elapsed_days: u32,
    pub month_total_days: u32,
    pub mtd_spend_usd: Decimal,
    pub burn_rate_daily_usd: Decimal,
    pub forecast_eom_usd: Decimal,
    pub anomaly: Anomaly,
    pub risk_class: RiskClass,
    pub risk_score: f64,
    pub data_source_mode: DataSourceMode,
    pub context_version: i32,
    pub generated_at: DateTime<Utc>,
}

impl ComputedContext {
    /// Placeholder snapshot for FAIL_SAFE decisions emitted before (or
    /// instead of) a real context build, e.g. on gate timeout.
    pub fn unavailable() -> Self {
        let today = Utc::now().date_naive();
        ComputedContext {
            month_start: today,
            month_end: today,
            month_elapsed_days: 0,
            month_total_days: 0,
            mtd_spend_usd: Decimal::ZERO,
            burn_rate_daily_usd: Decimal::ZERO,
            forecast_eom_usd: Decimal::ZERO,
            anomaly: Anomaly {
                kind: AnomalyKind::None,
                delta_usd: Decimal::ZERO,
                percent: Decimal::ZERO,
            },
            risk_class: RiskClass::Low,
            risk_score: 0.0,
            data_source_mode: DataSourceMode::Unavailable,
            context_version: CONTEXT_VERSION,
            generated_at: Utc::now(),
        }
    }
}

pub struct ComputedContextBuilder<'a> {
    reader: &'a dyn CostHistoryReader,
}

impl<'a> ComputedContextBuilder<'a> {
    pub fn new(reader: &'a dyn CostHistoryReader) -> Self {
        Self { reader }
    }

    /// Builds the deterministic snapshot. `plan_ceiling_usd` and
    /// `requested_monthly_delta_usd` feed the risk-score formula; they do not
    /// affect the spend/forecast fields themselves.
    pub async fn build(
        &self,
        tenant_id: &str,
        decision_time: DateTime<Utc>,
        plan_ceiling_usd: Decimal,
        requested_monthly_delta_usd: Decimal,
    ) -> ComputedContext {
        let month_start = NaiveDate::from_ymd_opt(decision_time.year(), decision_time.month(), 1)
            .expect("valid first-of-month date");
        let month_total_days = days_in_month(decision_time.year(), decision_time.month());
        let month_end = month_start + chrono::Duration::days(i64::from(month_total_days) - 1);
        let month_elapsed_days = decision_time.day();
        let through = decision_time.date_naive();

        let (daily, mode) = match self.reader.daily_costs(tenant_id, month_start, through).await {
            Ok(days) if days.is_empty() => (Vec::new(), DataSourceMode::None),
            Ok(days) => {
                let mode = if (days.len() as u32) < month_elapsed_days {
                    DataSourceMode::Partial
                } else {
                    DataSourceMode::AllStatus
                };
                (days, mode)
            }
            Err(_) => (Vec::new(), DataSourceMode::Unavailable),
        };

        let observed_cost_days = daily.len() as u64;
        let mtd_spend_usd = crate::money::normalize(daily.iter().map(|(_, c)| *c).sum());
        let burn_rate_daily_usd = if observed_cost_days > 0 {
            crate::money::normalize(mtd_spend_usd / Decimal::from(observed_cost_days))
        } else {
            Decimal::ZERO
        };
        let remaining_days = Decimal::from(month_total_days.saturating_sub(month_elapsed_days));
        let forecast_eom_usd =
            crate::money::normalize(mtd_spend_usd + burn_rate_daily_usd * remaining_days);

        let anomaly = compute_anomaly(&daily);
        let (risk_class, risk_score) = compute_risk(
            forecast_eom_usd,
            plan_ceiling_usd,
            &anomaly,
            requested_monthly_delta_usd,
            burn_rate_daily_usd,
        );

        ComputedContext {
            month_start,
            month_end,
            month_elapsed_days,
            month_total_days,
            mtd_spend_usd,
            burn_rate_daily_usd,
            forecast_eom_usd,
            anomaly,
            risk_class,
            risk_score,
            data_source_mode: mode,
            context_version: CONTEXT_VERSION,
            generated_at: decision_time,
        }
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let next_first = NaiveDate::from_ymd_opt(next_year, next_month, 1).expect("valid date");
    let this_first = NaiveDate::from_ymd_opt(year, month, 1).expect("valid date");
    (next_first - this_first).num_days() as u32
}

/// Compares the latest day against a trimmed mean (drop the single highest
/// and lowest) of the preceding up-to-7 days. Ties on equal delta resolve to
/// `AnomalyKind::None`.
fn compute_anomaly(daily: &[(NaiveDate, Decimal)]) -> Anomaly {
    if daily.len() < 2 {
        return Anomaly {
            kind: AnomalyKind::None,
            delta_usd: Decimal::ZERO,
            percent: Decimal::ZERO,
        };
    }
    let mut sorted = daily.to_vec();
    sorted.sort_by_key(|(day, _)| *day);
    let (_, latest_cost) = *sorted.last().unwrap();
    let window_start = sorted.len().saturating_sub(8);
    let preceding: Vec<Decimal> = sorted[window_start..sorted.len() - 1]
        .iter()
        .map(|(_, c)| *c)
        .collect();

    let trimmed_mean = trimmed_mean(&preceding);
    let delta = crate::money::normalize(latest_cost - trimmed_mean);
    let percent = if trimmed_mean.is_zero() {
        if delta.is_zero() { Decimal::ZERO } else { Decimal::from(100) }
    } else {
        crate::money::normalize(delta / trimmed_mean * Decimal::from(100))
    };

    let kind = if delta.is_zero() {
        AnomalyKind::None
    } else if delta.is_sign_positive() {
        AnomalyKind::Spike
    } else {
        AnomalyKind::Drop
    };

    Anomaly { kind, delta_usd: delta, percent: percent.abs() }
}

fn trimmed_mean(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    if values.len() < 3 {
        return crate::money::normalize(values.iter().sum::<Decimal>() / Decimal::from(values.len() as u64));
    }
    let mut sorted = values.to_vec();
    sorted.sort();
    let trimmed = &sorted[1..sorted.len() - 1];
    crate::money::normalize(trimmed.iter().sum::<Decimal>() / Decimal::from(trimmed.len() as u64))
}

fn compute_risk(
    forecast_eom_usd: Decimal,
    plan_ceiling_usd: Decimal,
    anomaly: &Anomaly,
    requested_monthly_delta_usd: Decimal,
    burn_rate_daily_usd: Decimal,
) -> (RiskClass, f64) {
    let forecast_ratio = if plan_ceiling_usd.is_zero() {
        if forecast_eom_usd.is_zero() { 0.0 } else { 1.0 }
    } else {
        (forecast_eom_usd / plan_ceiling_usd).to_string().parse::<f64>().unwrap_or(1.0)
    };
    let anomaly_pct = anomaly.percent.to_string().parse::<f64>().unwrap_or(0.0) / 100.0;
    let request_ratio = if burn_rate_daily_usd.is_zero() {
        if requested_monthly_delta_usd.is_zero() { 0.0 } else { 1.0 }
    } else {
        (requested_monthly_delta_usd / burn_rate_daily_usd).to_string().parse::<f64>().unwrap_or(1.0)
    };

    let risk_class = if forecast_ratio >= 1.0 || anomaly_pct >= 1.0 {
        RiskClass::Critical
    } else if forecast_ratio >= 0.9 || anomaly_pct >= 0.5 {
        RiskClass::High
    } else if forecast_ratio >= 0.6 || anomaly_pct >= 0.25 {
        RiskClass::Medium
    } else {
        RiskClass::Low
    };

    let score = (0.5 * forecast_ratio.min(1.5) / 1.5
        + 0.3 * anomaly_pct.min(1.0)
        + 0.2 * request_ratio.min(1.0))
    .clamp(0.0, 1.0);

    (risk_class, score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct FixedReader {
        days: Vec<(NaiveDate, Decimal)>,
    }

    #[async_trait]
    impl CostHistoryReader for FixedReader {
        async fn daily_costs(
            &self,
            _tenant_id: &str,
            _month_start: NaiveDate,
            _through: NaiveDate,
        ) -> anyhow::Result<Vec<(NaiveDate, Decimal)>> {
            Ok(self.days.clone())
        }
    }

    struct FailingReader;

    #[async_trait]
    impl CostHistoryReader for FailingReader {
        async fn daily_costs(
            &self,
            _tenant_id: &str,
            _month_start: NaiveDate,
            _through: NaiveDate,
        ) -> anyhow::Result<Vec<(NaiveDate, Decimal)>> {
            Err(anyhow::anyhow!("cost reader unavailable"))
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn empty_history_yields_zero_context() {
        let reader = FixedReader { days: vec![] };
        let builder = ComputedContextBuilder::new(&reader);
        let t = Utc.with_ymd_and_hms(2026, 6, 15, 0, 0, 0).unwrap();
        let ctx = builder.build("t1", t, Decimal::from(1000), Decimal::ZERO).await;
        assert_eq!(ctx.mtd_spend_usd, Decimal::ZERO);
        assert_eq!(ctx.data_source_mode, DataSourceMode::None);
        assert_eq!(ctx.risk_class, RiskClass::Low);
    }

    #[tokio::test]
    async fn dependency_failure_marks_unavailable() {
        let reader = FailingReader;
        let builder = ComputedContextBuilder::new(&reader);
        let t = Utc.with_ymd_and_hms(2026, 6, 15, 0, 0, 0).unwrap();
        let ctx = builder.build("t1", t, Decimal::from(1000), Decimal::ZERO).await;
        assert_eq!(ctx.data_source_mode, DataSourceMode::Unavailable);
    }

    #[tokio::test]
    async fn forecast_and_burn_rate_are_computed() {
        let days = vec![
            (day(2026, 6, 1), Decimal::from(100)),
            (day(2026, 6, 2), Decimal::from(100)),
        ];
        let reader = FixedReader { days };
        let builder = ComputedContextBuilder::new(&reader);
        let t = Utc.with_ymd_and_hms(2026, 6, 2, 0, 0, 0).unwrap();
        let ctx = builder.build("t1", t, Decimal::from(6000), Decimal::ZERO).await;
        assert_eq!(ctx.mtd_spend_usd, Decimal::new(200_000_000, 6));
        assert_eq!(ctx.burn_rate_daily_usd, Decimal::new(100_000_000, 6));
        assert_eq!(ctx.month_total_days, 30);
        assert_eq!(ctx.data_source_mode, DataSourceMode::AllStatus);
    }

    #[tokio::test]
    async fn high_risk_when_forecast_near_ceiling() {
        let days: Vec<(NaiveDate, Decimal)> = (1..=10)
            .map(|d| (day(2026, 6, d), Decimal::from(1000)))
            .collect();
        let reader = FixedReader { days };
        let builder = ComputedContextBuilder::new(&reader);
        let t = Utc.with_ymd_and_hms(2026, 6, 10, 0, 0, 0).unwrap();
        // mtd = 10_000, burn = 1000/day, 20 remaining days -> forecast 30_000 vs ceiling 30_000 => ratio 1.0
        let ctx = builder.build("t1", t, Decimal::from(30_000), Decimal::ZERO).await;
        assert_eq!(ctx.risk_class, RiskClass::Critical);
    }

    #[test]
    fn anomaly_tie_breaks_to_none() {
        let daily = vec![
            (day(2026, 6, 1), Decimal::from(100)),
            (day(2026, 6, 2), Decimal::from(100)),
            (day(2026, 6, 3), Decimal::from(100)),
            (day(2026, 6, 4), Decimal::from(100)),
        ];
        let anomaly = compute_anomaly(&daily);
        assert_eq!(anomaly.kind, AnomalyKind::None);
    }

    #[test]
    fn anomaly_detects_spike() {
        let daily = vec![
            (day(2026, 6, 1), Decimal::from(100)),
            (day(2026, 6, 2), Decimal::from(100)),
            (day(2026, 6, 3), Decimal::from(100)),
            (day(2026, 6, 4), Decimal::from(500)),
        ];
        let anomaly = compute_anomaly(&daily);
        assert_eq!(anomaly.kind, AnomalyKind::Spike);
    }
}
