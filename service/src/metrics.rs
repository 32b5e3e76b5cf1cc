use serde::Deserialize;
use thiserror::Error;

use crate::store::{MetricsDailyRecord, MetricsDailyUpsert, Store, StoreError};

/// One day of raw counters for an (experiment, source) pair, as posted
/// by the metrics importer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsImport {
    pub date: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub impressions: i64,
    #[serde(default)]
    pub clicks: i64,
    #[serde(default)]
    pub sessions: i64,
    #[serde(default)]
    pub conversions: i64,
    #[serde(default)]
    pub spend_cents: i64,
    #[serde(default)]
    pub revenue_cents: i64,
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("{field} must not be negative")]
    NegativeCounter { field: &'static str },
    #[error("date must be formatted YYYY-MM-DD")]
    BadDate,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Rates in basis points, computed from raw counters. Zero denominator
/// yields None rather than zero so an absent rate is distinguishable
/// from a measured zero.
pub fn ctr_bp(clicks: i64, impressions: i64) -> Option<i64> {
    (impressions > 0).then(|| clicks * 10_000 / impressions)
}

pub fn cvr_bp(conversions: i64, clicks: i64) -> Option<i64> {
    (clicks > 0).then(|| conversions * 10_000 / clicks)
}

pub fn cpl_cents(spend_cents: i64, conversions: i64) -> Option<i64> {
    (conversions > 0).then(|| spend_cents / conversions)
}

pub fn roas_bp(revenue_cents: i64, spend_cents: i64) -> Option<i64> {
    (spend_cents > 0).then(|| revenue_cents * 10_000 / spend_cents)
}

fn validate(import: &MetricsImport) -> Result<(), MetricsError> {
    let counters = [
        ("impressions", import.impressions),
        ("clicks", import.clicks),
        ("sessions", import.sessions),
        ("conversions", import.conversions),
        ("spend_cents", import.spend_cents),
        ("revenue_cents", import.revenue_cents),
    ];
    for (field, value) in counters {
        if value < 0 {
            return Err(MetricsError::NegativeCounter { field });
        }
    }
    let bytes = import.date.as_bytes();
    let shape_ok = bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && import
            .date
            .chars()
            .enumerate()
            .all(|(index, c)| matches!(index, 4 | 7) || c.is_ascii_digit());
    if !shape_ok {
        return Err(MetricsError::BadDate);
    }
    Ok(())
}

/// Store one daily snapshot, recomputing derived rates from the raw
/// counters. Re-importing the same (experiment, date, source) replaces
/// the previous snapshot.
pub fn import_daily(
    store: &Store,
    experiment_id: &str,
    import: MetricsImport,
) -> Result<MetricsDailyRecord, MetricsError> {
    validate(&import)?;
    let record = store.upsert_metrics_daily(MetricsDailyUpsert {
        experiment_id: experiment_id.to_string(),
        date: import.date,
        source: import.source,
        impressions: import.impressions,
        clicks: import.clicks,
        sessions: import.sessions,
        conversions: import.conversions,
        spend_cents: import.spend_cents,
        revenue_cents: import.revenue_cents,
        ctr_bp: ctr_bp(import.clicks, import.impressions),
        cvr_bp: cvr_bp(import.conversions, import.clicks),
        cpl_cents: cpl_cents(import.spend_cents, import.conversions),
        roas_bp: roas_bp(import.revenue_cents, import.spend_cents),
    })?;
    Ok(record)
}
