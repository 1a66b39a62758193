//! Connection pool for the time-series store (C5/C6 share one pool).
//!
//! Same shape as a typical connection-pool wrapper (config struct,
//! `PoolStats` with an exponential moving average of query time, a
//! background health-check task), built on `PgPool` rather than `SqlitePool`
//! since hypertables and `time_bucket` are TimescaleDB/Postgres-only.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::time::interval;

use crate::config::DbConfig;
use crate::error::DbError;

/// Pool statistics, refreshed on every query.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub total_queries: u64,
    pub total_errors: u64,
    pub avg_query_time_us: u64,
    pub last_health_check: Option<Instant>,
    pub is_healthy: bool,
}

/// Thin wrapper over `sqlx::PgPool` tracking query statistics and running a
/// background health check. Cloning is cheap (the inner pool is itself
/// reference-counted).
#[derive(Clone)]
pub struct DbPool {
    pool: PgPool,
    stats: Arc<RwLock<PoolStats>>,
}

impl DbPool {
    /// Connects to Postgres using the individual `DbConfig` fields. The
    /// production SSL minimum (`require` or stronger) is not enforced here;
    /// it is the outer process's responsibility to reject a non-compliant
    /// config before calling this.
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(config.connection_timeout)
            .connect(&config.connection_url())
            .await?;

        let instance = Self {
            pool,
            stats: Arc::new(RwLock::new(PoolStats { is_healthy: true, ..Default::default() })),
        };
        instance.start_health_check_task();
        Ok(instance)
    }

    pub fn inner(&self) -> &PgPool {
        &self.pool
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.read().clone()
    }

    pub(crate) fn record_query(&self, elapsed: Duration) {
        let mut stats = self.stats.write();
        stats.total_queries += 1;
        let sample = elapsed.as_micros() as u64;
        stats.avg_query_time_us = if stats.total_queries == 1 {
            sample
        } else {
            (stats.avg_query_time_us * 9 + sample) / 10
        };
    }

    pub(crate) fn record_error(&self) {
        self.stats.write().total_errors += 1;
    }

    pub async fn health_check(&self) -> bool {
        let started = Instant::now();
        let healthy = sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok();
        self.record_query(started.elapsed());
        let mut stats = self.stats.write();
        stats.last_health_check = Some(Instant::now());
        stats.is_healthy = healthy;
        healthy
    }

    fn start_health_check_task(&self) {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                if !pool.health_check().await {
                    log::warn!("db pool health check failed");
                }
            }
        });
    }
}
