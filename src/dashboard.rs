//! Dashboard aggregator (C8): fans out four sub-queries and assembles one
//! consistent snapshot.
//!
//! Same concurrent-futures-joined-with-`tokio::join!` style used by the
//! batch loader, generalized from an N+1 batching problem to a fixed
//! four-way aggregation, each leg wrapped in its own deadline per §4.8/§5.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use crate::config::DashboardConfig;
use crate::db::pool::DbPool;
use crate::error::DashboardError;
use crate::models::{Alert, AlertSeverity, AlertStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardMetrics {
    pub total_validators: i64,
    pub active_validators: i64,
    pub avg_effectiveness: f64,
    pub total_balance_gwei: i64,
    pub slashed_validators: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopValidator {
    pub validator_index: u64,
    pub effectiveness: f64,
    pub balance_gwei: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFreshness {
    Fresh,
    Degraded,
    Stale,
    NoData,
    Error,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub database_status: DatabaseStatus,
    pub data_freshness: DataFreshness,
    pub last_snapshot_time: Option<DateTime<Utc>>,
    pub monitored_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub metrics: DashboardMetrics,
    pub recent_alerts: Vec<Alert>,
    pub top_validators: Vec<TopValidator>,
    pub system_health: SystemHealth,
    pub last_updated: DateTime<Utc>,
}

pub struct DashboardAggregator {
    pool: DbPool,
    config: DashboardConfig,
}

impl DashboardAggregator {
    pub fn new(pool: DbPool, config: DashboardConfig) -> Self {
        Self { pool, config }
    }

    async fn with_deadline<T, F>(&self, label: &'static str, deadline: Duration, fut: F) -> Result<T, DashboardError>
    where
        F: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        let started = Instant::now();
        let result = tokio::time::timeout(deadline, fut).await;
        self.pool.record_query(started.elapsed());
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.pool.record_error();
                Err(DashboardError::SubQueryFailed(label, e.to_string()))
            }
            Err(_) => {
                self.pool.record_error();
                Err(DashboardError::SubQueryTimedOut(label))
            }
        }
    }

    async fn metrics(&self) -> Result<DashboardMetrics, DashboardError> {
        let row = self
            .with_deadline(
                "metrics",
                self.config.query_deadline,
                sqlx::query(
                    "WITH latest AS (
                        SELECT DISTINCT ON (validator_index) *
                        FROM validator_snapshots
                        WHERE time >= now() - interval '1 hour'
                        ORDER BY validator_index, time DESC
                    )
                    SELECT
                        (SELECT COUNT(*) FROM validators) AS total_validators,
                        COUNT(*) FILTER (WHERE latest.is_online) AS active_validators,
                        COALESCE(AVG(latest.att_effectiveness), 0.0) AS avg_effectiveness,
                        COALESCE(SUM(latest.balance), 0) AS total_balance_gwei,
                        (SELECT COUNT(*) FROM validators WHERE slashed) AS slashed_validators
                    FROM latest",
                )
                .fetch_one(self.pool.inner()),
            )
            .await?;

        Ok(DashboardMetrics {
            total_validators: row.try_get("total_validators").map_err(|e| {
                DashboardError::SubQueryFailed("metrics", e.to_string())
            })?,
            active_validators: row
                .try_get("active_validators")
                .map_err(|e| DashboardError::SubQueryFailed("metrics", e.to_string()))?,
            avg_effectiveness: row
                .try_get("avg_effectiveness")
                .map_err(|e| DashboardError::SubQueryFailed("metrics", e.to_string()))?,
            total_balance_gwei: row
                .try_get("total_balance_gwei")
                .map_err(|e| DashboardError::SubQueryFailed("metrics", e.to_string()))?,
            slashed_validators: row
                .try_get("slashed_validators")
                .map_err(|e| DashboardError::SubQueryFailed("metrics", e.to_string()))?,
        })
    }

    async fn top_validators(&self) -> Result<Vec<TopValidator>, DashboardError> {
        let n = self.config.top_validators_n as i64;
        let rows = self
            .with_deadline(
                "top_validators",
                self.config.query_deadline,
                sqlx::query(
                    "WITH latest AS (
                        SELECT DISTINCT ON (s.validator_index) s.*
                        FROM validator_snapshots s
                        WHERE s.time >= now() - interval '1 hour'
                        ORDER BY s.validator_index, s.time DESC
                    )
                    SELECT latest.validator_index, latest.att_effectiveness, latest.balance
                    FROM latest
                    JOIN validators v ON v.validator_index = latest.validator_index
                    WHERE NOT v.slashed
                    ORDER BY latest.att_effectiveness DESC NULLS LAST
                    LIMIT $1",
                )
                .bind(n)
                .fetch_all(self.pool.inner()),
            )
            .await?;

        rows.iter()
            .map(|row| {
                Ok(TopValidator {
                    validator_index: row
                        .try_get::<i64, _>("validator_index")
                        .map_err(|e| DashboardError::SubQueryFailed("top_validators", e.to_string()))?
                        as u64,
                    effectiveness: row
                        .try_get::<Option<f64>, _>("att_effectiveness")
                        .map_err(|e| DashboardError::SubQueryFailed("top_validators", e.to_string()))?
                        .unwrap_or(0.0),
                    balance_gwei: row
                        .try_get("balance")
                        .map_err(|e| DashboardError::SubQueryFailed("top_validators", e.to_string()))?,
                })
            })
            .collect()
    }

    async fn recent_alerts(&self) -> Result<Vec<Alert>, DashboardError> {
        let n = self.config.recent_alerts_n as i64;
        let rows = self
            .with_deadline(
                "recent_alerts",
                self.config.query_deadline,
                sqlx::query(
                    "SELECT id, validator_index, alert_type, severity, title, message, details,
                            status, acknowledged_at, resolved_at, created_at, updated_at
                     FROM alerts
                     WHERE status = 'active'
                     ORDER BY created_at DESC
                     LIMIT $1",
                )
                .bind(n)
                .fetch_all(self.pool.inner()),
            )
            .await?;

        rows.iter()
            .map(|row| {
                let severity_str: String = row
                    .try_get("severity")
                    .map_err(|e| DashboardError::SubQueryFailed("recent_alerts", e.to_string()))?;
                let status_str: String = row
                    .try_get("status")
                    .map_err(|e| DashboardError::SubQueryFailed("recent_alerts", e.to_string()))?;
                Ok(Alert {
                    id: row.try_get("id").map_err(|e| DashboardError::SubQueryFailed("recent_alerts", e.to_string()))?,
                    validator_index: row
                        .try_get::<Option<i64>, _>("validator_index")
                        .map_err(|e| DashboardError::SubQueryFailed("recent_alerts", e.to_string()))?
                        .map(|v| v as u64),
                    alert_type: row
                        .try_get("alert_type")
                        .map_err(|e| DashboardError::SubQueryFailed("recent_alerts", e.to_string()))?,
                    severity: parse_severity(&severity_str),
                    title: row.try_get("title").map_err(|e| DashboardError::SubQueryFailed("recent_alerts", e.to_string()))?,
                    message: row
                        .try_get("message")
                        .map_err(|e| DashboardError::SubQueryFailed("recent_alerts", e.to_string()))?,
                    details: row
                        .try_get::<Option<serde_json::Value>, _>("details")
                        .map_err(|e| DashboardError::SubQueryFailed("recent_alerts", e.to_string()))?
                        .and_then(|v| v.as_object().cloned())
                        .map(|m| m.into_iter().collect())
                        .unwrap_or_default(),
                    status: parse_status(&status_str),
                    created_at: row
                        .try_get("created_at")
                        .map_err(|e| DashboardError::SubQueryFailed("recent_alerts", e.to_string()))?,
                    updated_at: row
                        .try_get("updated_at")
                        .map_err(|e| DashboardError::SubQueryFailed("recent_alerts", e.to_string()))?,
                    acknowledged_at: row
                        .try_get("acknowledged_at")
                        .map_err(|e| DashboardError::SubQueryFailed("recent_alerts", e.to_string()))?,
                    resolved_at: row
                        .try_get("resolved_at")
                        .map_err(|e| DashboardError::SubQueryFailed("recent_alerts", e.to_string()))?,
                })
            })
            .collect()
    }

    async fn system_health(&self) -> Result<SystemHealth, DashboardError> {
        let row_result = self
            .with_deadline(
                "system_health",
                self.config.health_deadline,
                sqlx::query(
                    "SELECT
                        (SELECT MAX(time) FROM validator_snapshots) AS last_snapshot_time,
                        (SELECT COUNT(*) FROM validators WHERE monitored) AS monitored_count",
                )
                .fetch_one(self.pool.inner()),
            )
            .await;

        let row = match row_result {
            Ok(row) => row,
            Err(_) => {
                return Ok(SystemHealth {
                    database_status: DatabaseStatus::Unhealthy,
                    data_freshness: DataFreshness::Error,
                    last_snapshot_time: None,
                    monitored_count: 0,
                });
            }
        };

        let last_snapshot_time: Option<DateTime<Utc>> = row
            .try_get("last_snapshot_time")
            .map_err(|e| DashboardError::SubQueryFailed("system_health", e.to_string()))?;
        let monitored_count: i64 = row
            .try_get("monitored_count")
            .map_err(|e| DashboardError::SubQueryFailed("system_health", e.to_string()))?;

        let data_freshness = match last_snapshot_time {
            None => DataFreshness::NoData,
            Some(t) => {
                let age = Utc::now().signed_duration_since(t);
                if age < chrono::Duration::minutes(5) {
                    DataFreshness::Fresh
                } else if age < chrono::Duration::minutes(15) {
                    DataFreshness::Degraded
                } else {
                    DataFreshness::Stale
                }
            }
        };

        Ok(SystemHealth {
            database_status: DatabaseStatus::Healthy,
            data_freshness,
            last_snapshot_time,
            monitored_count,
        })
    }

    /// Assembles the dashboard snapshot. Fails the whole call if `metrics` or
    /// `system_health` could not be produced. `recent_alerts`/`top_validators`
    /// degrade to an empty sequence only when the failure is specifically a
    /// deadline miss and `self.config.best_effort` is set; any other failure
    /// (a real query error, or a timeout without best-effort) propagates.
    pub async fn snapshot(&self) -> Result<DashboardSnapshot, DashboardError> {
        let (metrics, alerts, top, health) =
            tokio::join!(self.metrics(), self.recent_alerts(), self.top_validators(), self.system_health());

        let metrics = metrics?;
        let system_health = health?;
        let recent_alerts = degrade_or_propagate(alerts, self.config.best_effort)?;
        let top_validators = degrade_or_propagate(top, self.config.best_effort)?;

        Ok(DashboardSnapshot {
            metrics,
            recent_alerts,
            top_validators,
            system_health,
            last_updated: Utc::now(),
        })
    }
}

/// Only a timed-out optional leg degrades to an empty default, and only
/// when the caller requested best-effort mode; any other failure propagates.
fn degrade_or_propagate<T: Default>(result: Result<T, DashboardError>, best_effort: bool) -> Result<T, DashboardError> {
    match result {
        Ok(value) => Ok(value),
        Err(DashboardError::SubQueryTimedOut(_)) if best_effort => Ok(T::default()),
        Err(e) => Err(e),
    }
}

fn parse_severity(s: &str) -> AlertSeverity {
    match s {
        "warning" => AlertSeverity::Warning,
        "error" => AlertSeverity::Error,
        "critical" => AlertSeverity::Critical,
        _ => AlertSeverity::Info,
    }
}

fn parse_status(s: &str) -> AlertStatus {
    match s {
        "read" => AlertStatus::Read,
        "dismissed" => AlertStatus::Dismissed,
        "active" => AlertStatus::Active,
        "acknowledged" => AlertStatus::Acknowledged,
        "resolved" => AlertStatus::Resolved,
        "ignored" => AlertStatus::Ignored,
        _ => AlertStatus::New,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_degrades_to_default_only_in_best_effort_mode() {
        let result: Result<Vec<Alert>, DashboardError> = Err(DashboardError::SubQueryTimedOut("recent_alerts"));
        assert!(degrade_or_propagate(result, true).unwrap().is_empty());

        let result: Result<Vec<Alert>, DashboardError> = Err(DashboardError::SubQueryTimedOut("recent_alerts"));
        assert!(matches!(degrade_or_propagate(result, false), Err(DashboardError::SubQueryTimedOut(_))));
    }

    #[test]
    fn query_error_always_propagates_even_in_best_effort_mode() {
        let result: Result<Vec<Alert>, DashboardError> =
            Err(DashboardError::SubQueryFailed("recent_alerts", "connection reset".to_string()));
        assert!(matches!(degrade_or_propagate(result, true), Err(DashboardError::SubQueryFailed(..))));
    }

    #[test]
    fn ok_value_passes_through_unchanged() {
        let result: Result<Vec<Alert>, DashboardError> = Ok(vec![]);
        assert!(degrade_or_propagate(result, true).unwrap().is_empty());
    }
}
