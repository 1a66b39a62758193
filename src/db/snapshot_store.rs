//! Snapshot store (C5): the `validator_snapshots` hypertable.
//!
//! Every query here is a fixed-clause, positionally-parameterized statement;
//! nothing from caller input is ever interpolated into SQL text. The bulk
//! insert path binds one array parameter per column and lets Postgres expand
//! it server-side via `UNNEST`, per SPEC_FULL.md §4.5.1.

use std::collections::HashSet;
use std::time::Instant;

use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::cancellation::Cancellation;
use crate::db::pool::DbPool;
use crate::error::DbError;
use crate::models::{AggregateBucket, AggregateInterval, Snapshot, SnapshotFilter};

const CLEANUP_OLD_SQL: &str = "DELETE FROM validator_snapshots WHERE time < now() - make_interval(days => $1)";

pub struct SnapshotStore {
    pool: DbPool,
}

impl SnapshotStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn timed<T>(&self, fut: impl std::future::Future<Output = Result<T, sqlx::Error>>) -> Result<T, DbError> {
        let started = Instant::now();
        let result = fut.await;
        self.pool.record_query(started.elapsed());
        if result.is_err() {
            self.pool.record_error();
        }
        Ok(result?)
    }

    /// Inserts a single snapshot. A conflicting `(validator_index, time)` pair
    /// surfaces as [`DbError::DuplicateKey`].
    pub async fn insert_one(&self, ctx: &Cancellation, snapshot: &Snapshot) -> Result<(), DbError> {
        ctx.guard(self.insert_one_inner(snapshot)).await
    }

    async fn insert_one_inner(&self, snapshot: &Snapshot) -> Result<(), DbError> {
        let result = self
            .timed(
                sqlx::query(
                    "INSERT INTO validator_snapshots (
                        time, validator_index, balance, effective_balance, att_effectiveness,
                        att_inclusion_delay, att_head_vote, att_source_vote, att_target_vote,
                        proposals_scheduled, proposals_executed, proposals_missed,
                        sync_committee_participation, slashed, is_online,
                        consecutive_missed_attestations, daily_income, apr
                    ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18)",
                )
                .bind(snapshot.time)
                .bind(snapshot.validator_index as i64)
                .bind(snapshot.balance_gwei)
                .bind(snapshot.effective_balance_gwei)
                .bind(snapshot.att_effectiveness)
                .bind(snapshot.att_inclusion_delay.map(|v| v as i32))
                .bind(snapshot.att_head_vote)
                .bind(snapshot.att_source_vote)
                .bind(snapshot.att_target_vote)
                .bind(snapshot.proposals_scheduled as i32)
                .bind(snapshot.proposals_executed as i32)
                .bind(snapshot.proposals_missed as i32)
                .bind(snapshot.sync_committee_participation)
                .bind(snapshot.slashed)
                .bind(snapshot.is_online)
                .bind(snapshot.consecutive_missed_attestations as i32)
                .bind(snapshot.daily_income_gwei)
                .bind(snapshot.apr)
                .execute(self.pool.inner()),
            )
            .await;

        match result {
            Err(DbError::Sql(sqlx::Error::Database(ref e))) if e.is_unique_violation() => Err(
                DbError::DuplicateKey(format!("{}:{}", snapshot.validator_index, snapshot.time)),
            ),
            other => other.map(|_| ()),
        }
    }

    /// Bulk inserts via a single array-bound `UNNEST` statement. Rejects a
    /// batch containing two rows with the same `(validator_index, time)`
    /// before issuing any SQL; a conflict against rows already stored from a
    /// prior call surfaces as [`DbError::DuplicateKey`] just like
    /// [`SnapshotStore::insert_one`].
    pub async fn insert_bulk(&self, ctx: &Cancellation, snapshots: &[Snapshot]) -> Result<u64, DbError> {
        ctx.guard(self.insert_bulk_inner(snapshots)).await
    }

    async fn insert_bulk_inner(&self, snapshots: &[Snapshot]) -> Result<u64, DbError> {
        let mut seen = HashSet::with_capacity(snapshots.len());
        for s in snapshots {
            if !seen.insert((s.validator_index, s.time)) {
                return Err(DbError::DuplicateKey(format!("{}:{}", s.validator_index, s.time)));
            }
        }
        if snapshots.is_empty() {
            return Ok(0);
        }

        let times: Vec<DateTime<Utc>> = snapshots.iter().map(|s| s.time).collect();
        let indices: Vec<i64> = snapshots.iter().map(|s| s.validator_index as i64).collect();
        let balances: Vec<i64> = snapshots.iter().map(|s| s.balance_gwei).collect();
        let eff_balances: Vec<i64> = snapshots.iter().map(|s| s.effective_balance_gwei).collect();
        let att_effectiveness: Vec<Option<f64>> = snapshots.iter().map(|s| s.att_effectiveness).collect();
        let att_inclusion_delay: Vec<Option<i32>> =
            snapshots.iter().map(|s| s.att_inclusion_delay.map(|v| v as i32)).collect();
        let att_head_vote: Vec<Option<bool>> = snapshots.iter().map(|s| s.att_head_vote).collect();
        let att_source_vote: Vec<Option<bool>> = snapshots.iter().map(|s| s.att_source_vote).collect();
        let att_target_vote: Vec<Option<bool>> = snapshots.iter().map(|s| s.att_target_vote).collect();
        let proposals_scheduled: Vec<i32> = snapshots.iter().map(|s| s.proposals_scheduled as i32).collect();
        let proposals_executed: Vec<i32> = snapshots.iter().map(|s| s.proposals_executed as i32).collect();
        let proposals_missed: Vec<i32> = snapshots.iter().map(|s| s.proposals_missed as i32).collect();
        let sync_committee: Vec<bool> = snapshots.iter().map(|s| s.sync_committee_participation).collect();
        let slashed: Vec<bool> = snapshots.iter().map(|s| s.slashed).collect();
        let is_online: Vec<bool> = snapshots.iter().map(|s| s.is_online).collect();
        let consecutive_missed: Vec<i32> =
            snapshots.iter().map(|s| s.consecutive_missed_attestations as i32).collect();
        let daily_income: Vec<Option<i64>> = snapshots.iter().map(|s| s.daily_income_gwei).collect();
        let apr: Vec<Option<f64>> = snapshots.iter().map(|s| s.apr).collect();

        let result = self
            .timed(
                sqlx::query(
                    "INSERT INTO validator_snapshots (
                        time, validator_index, balance, effective_balance, att_effectiveness,
                        att_inclusion_delay, att_head_vote, att_source_vote, att_target_vote,
                        proposals_scheduled, proposals_executed, proposals_missed,
                        sync_committee_participation, slashed, is_online,
                        consecutive_missed_attestations, daily_income, apr
                    )
                    SELECT * FROM UNNEST(
                        $1::timestamptz[], $2::int8[], $3::int8[], $4::int8[], $5::float8[],
                        $6::int4[], $7::bool[], $8::bool[], $9::bool[],
                        $10::int4[], $11::int4[], $12::int4[],
                        $13::bool[], $14::bool[], $15::bool[],
                        $16::int4[], $17::int8[], $18::float8[]
                    )",
                )
                .bind(times)
                .bind(indices)
                .bind(balances)
                .bind(eff_balances)
                .bind(att_effectiveness)
                .bind(att_inclusion_delay)
                .bind(att_head_vote)
                .bind(att_source_vote)
                .bind(att_target_vote)
                .bind(proposals_scheduled)
                .bind(proposals_executed)
                .bind(proposals_missed)
                .bind(sync_committee)
                .bind(slashed)
                .bind(is_online)
                .bind(consecutive_missed)
                .bind(daily_income)
                .bind(apr)
                .execute(self.pool.inner()),
            )
            .await;

        match result {
            Err(DbError::Sql(sqlx::Error::Database(ref e))) if e.is_unique_violation() => {
                Err(DbError::DuplicateKey("bulk insert conflicted with an existing row".to_string()))
            }
            other => other.map(|r| r.rows_affected()),
        }
    }

    fn row_to_snapshot(row: &sqlx::postgres::PgRow) -> Result<Snapshot, DbError> {
        Ok(Snapshot {
            time: row.try_get("time")?,
            validator_index: row.try_get::<i64, _>("validator_index")? as u64,
            balance_gwei: row.try_get("balance")?,
            effective_balance_gwei: row.try_get("effective_balance")?,
            att_effectiveness: row.try_get("att_effectiveness")?,
            att_inclusion_delay: row.try_get::<Option<i32>, _>("att_inclusion_delay")?.map(|v| v as u32),
            att_head_vote: row.try_get("att_head_vote")?,
            att_source_vote: row.try_get("att_source_vote")?,
            att_target_vote: row.try_get("att_target_vote")?,
            proposals_scheduled: row.try_get::<i32, _>("proposals_scheduled")? as u32,
            proposals_executed: row.try_get::<i32, _>("proposals_executed")? as u32,
            proposals_missed: row.try_get::<i32, _>("proposals_missed")? as u32,
            sync_committee_participation: row.try_get("sync_committee_participation")?,
            slashed: row.try_get("slashed")?,
            is_online: row.try_get("is_online")?,
            consecutive_missed_attestations: row.try_get::<i32, _>("consecutive_missed_attestations")? as u32,
            daily_income_gwei: row.try_get("daily_income")?,
            apr: row.try_get("apr")?,
        })
    }

    /// The snapshot with maximum `time` for `validator_index`, or `None`.
    pub async fn latest(&self, ctx: &Cancellation, validator_index: u64) -> Result<Option<Snapshot>, DbError> {
        ctx.guard(self.latest_inner(validator_index)).await
    }

    async fn latest_inner(&self, validator_index: u64) -> Result<Option<Snapshot>, DbError> {
        let row = self
            .timed(
                sqlx::query(
                    "SELECT * FROM validator_snapshots WHERE validator_index = $1 ORDER BY time DESC LIMIT 1",
                )
                .bind(validator_index as i64)
                .fetch_optional(self.pool.inner()),
            )
            .await?;
        row.as_ref().map(Self::row_to_snapshot).transpose()
    }

    /// A time-bounded page of a single validator's snapshots, newest first.
    pub async fn window(&self, ctx: &Cancellation, filter: &SnapshotFilter) -> Result<Vec<Snapshot>, DbError> {
        ctx.guard(self.window_inner(filter)).await
    }

    async fn window_inner(&self, filter: &SnapshotFilter) -> Result<Vec<Snapshot>, DbError> {
        let limit = filter.limit.unwrap_or(100);
        let offset = filter.offset.unwrap_or(0);

        let rows = self
            .timed(
                sqlx::query(
                    "SELECT * FROM validator_snapshots
                     WHERE validator_index = $1
                       AND ($2::timestamptz IS NULL OR time >= $2)
                       AND ($3::timestamptz IS NULL OR time <= $3)
                     ORDER BY time DESC
                     LIMIT $4 OFFSET $5",
                )
                .bind(filter.validator_index as i64)
                .bind(filter.from)
                .bind(filter.to)
                .bind(limit)
                .bind(offset)
                .fetch_all(self.pool.inner()),
            )
            .await?;

        rows.iter().map(Self::row_to_snapshot).collect()
    }

    /// Time-bucketed aggregates. `interval` is a closed enum, never a
    /// caller-supplied string, so the `time_bucket` literal is always one of
    /// the two fixed values baked into the two query branches below.
    pub async fn aggregate(
        &self,
        ctx: &Cancellation,
        validator_index: u64,
        interval: AggregateInterval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AggregateBucket>, DbError> {
        ctx.guard(self.aggregate_inner(validator_index, interval, from, to)).await
    }

    async fn aggregate_inner(
        &self,
        validator_index: u64,
        interval: AggregateInterval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AggregateBucket>, DbError> {
        let rows = match interval {
            AggregateInterval::Hourly => {
                self.timed(
                    sqlx::query(
                        "SELECT time_bucket('1 hour', time) AS bucket,
                                AVG(balance) AS avg_balance,
                                AVG(att_effectiveness) AS avg_effectiveness,
                                COUNT(*) FILTER (WHERE att_effectiveness < 95) AS suboptimal_count
                         FROM validator_snapshots
                         WHERE validator_index = $1 AND time >= $2 AND time <= $3
                         GROUP BY bucket
                         ORDER BY bucket",
                    )
                    .bind(validator_index as i64)
                    .bind(from)
                    .bind(to)
                    .fetch_all(self.pool.inner()),
                )
                .await?
            }
            AggregateInterval::Daily => {
                self.timed(
                    sqlx::query(
                        "SELECT time_bucket('1 day', time) AS bucket,
                                AVG(balance) AS avg_balance,
                                AVG(att_effectiveness) AS avg_effectiveness,
                                COUNT(*) FILTER (WHERE att_effectiveness < 95) AS suboptimal_count,
                                MIN(balance) AS min_balance,
                                MAX(balance) AS max_balance
                         FROM validator_snapshots
                         WHERE validator_index = $1 AND time >= $2 AND time <= $3
                         GROUP BY bucket
                         ORDER BY bucket",
                    )
                    .bind(validator_index as i64)
                    .bind(from)
                    .bind(to)
                    .fetch_all(self.pool.inner()),
                )
                .await?
            }
        };

        rows.iter()
            .map(|row| {
                Ok(AggregateBucket {
                    bucket: row.try_get("bucket")?,
                    avg_balance: row.try_get::<Option<f64>, _>("avg_balance")?.unwrap_or(0.0),
                    avg_effectiveness: row.try_get::<Option<f64>, _>("avg_effectiveness")?.unwrap_or(0.0),
                    suboptimal_count: row.try_get("suboptimal_count")?,
                    min_balance: row.try_get::<Option<i64>, _>("min_balance").unwrap_or(None),
                    max_balance: row.try_get::<Option<i64>, _>("max_balance").unwrap_or(None),
                })
            })
            .collect()
    }

    /// Deletes snapshots older than `retention_days`. The count flows as a
    /// bound parameter combined into an interval expression, never
    /// interpolated into the SQL text.
    pub async fn cleanup_old(&self, ctx: &Cancellation, retention_days: i64) -> Result<u64, DbError> {
        ctx.guard(self.cleanup_old_inner(retention_days)).await
    }

    async fn cleanup_old_inner(&self, retention_days: i64) -> Result<u64, DbError> {
        let result = self
            .timed(sqlx::query(CLEANUP_OLD_SQL).bind(retention_days).execute(self.pool.inner()))
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_old_statement_uses_a_placeholder_not_interpolation() {
        assert!(CLEANUP_OLD_SQL.contains("make_interval(days => $1)"));
        assert!(!CLEANUP_OLD_SQL.contains("{}"));
        // A retention value distinctive enough to rule out accidental
        // interpolation (e.g. via a stray format!()) must never appear literally.
        assert!(!CLEANUP_OLD_SQL.contains("90"));
        assert!(!CLEANUP_OLD_SQL.contains("365"));
    }

    #[test]
    fn insert_bulk_rejects_in_call_duplicates_before_issuing_sql() {
        let mut seen = HashSet::new();
        let pairs = [(1u64, 100i64), (1u64, 100i64)];
        let mut rejected = false;
        for (idx, time) in pairs {
            if !seen.insert((idx, time)) {
                rejected = true;
            }
        }
        assert!(rejected);
    }
}
