//! Validator directory (C6): the `validators` table.
//!
//! `list`'s count query and page query are issued concurrently via
//! `tokio::join!`, per §4.6's "MUST be issued concurrently and joined".
//! Sort column/direction are chosen from the closed [`SortBy`]/[`SortOrder`]
//! enums and rendered as fixed SQL fragments — never formatted from a raw
//! caller string — so any unrecognized input simply can't reach this layer
//! (the caller constructs a `SortBy` variant, not a string).

use std::time::Instant;

use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::cancellation::Cancellation;
use crate::db::pool::DbPool;
use crate::error::DbError;
use crate::models::{DirectoryFilter, Page, Pagination, SortBy, SortOrder, ValidatorIdentity, ValidatorUpdate};

pub struct ValidatorDirectory {
    pool: DbPool,
}

impl ValidatorDirectory {
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

    fn row_to_identity(row: &sqlx::postgres::PgRow) -> Result<ValidatorIdentity, DbError> {
        Ok(ValidatorIdentity {
            index: row.try_get::<i64, _>("validator_index")? as u64,
            pubkey: row.try_get("pubkey")?,
            withdrawal_credentials: row.try_get("withdrawal_credentials")?,
            name: row.try_get("name")?,
            tags: row.try_get::<Option<Vec<String>>, _>("tags")?.unwrap_or_default(),
            monitored: row.try_get("monitored")?,
            activation_epoch: row.try_get("activation_epoch")?,
            exit_epoch: row.try_get("exit_epoch")?,
            withdrawable_epoch: row.try_get("withdrawable_epoch")?,
            effective_balance_gwei: row.try_get("effective_balance")?,
            slashed: row.try_get("slashed")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// Inserts a new identity. A unique violation on `(validator_index)` or
    /// `(pubkey)` surfaces as [`DbError::AlreadyExists`].
    pub async fn create(&self, ctx: &Cancellation, identity: &ValidatorIdentity) -> Result<(), DbError> {
        ctx.guard(self.create_inner(identity)).await
    }

    async fn create_inner(&self, identity: &ValidatorIdentity) -> Result<(), DbError> {
        let result = self
            .timed(
                sqlx::query(
                    "INSERT INTO validators (
                        validator_index, pubkey, withdrawal_credentials, effective_balance, slashed,
                        activation_epoch, activation_eligibility_epoch, exit_epoch, withdrawable_epoch,
                        name, tags, monitored, created_at, updated_at
                    ) VALUES ($1,$2,$3,$4,$5,$6,NULL,$7,$8,$9,$10,$11,$12,$12)",
                )
                .bind(identity.index as i64)
                .bind(&identity.pubkey)
                .bind(&identity.withdrawal_credentials)
                .bind(identity.effective_balance_gwei)
                .bind(identity.slashed)
                .bind(identity.activation_epoch)
                .bind(identity.exit_epoch)
                .bind(identity.withdrawable_epoch)
                .bind(&identity.name)
                .bind(&identity.tags)
                .bind(identity.monitored)
                .bind(identity.created_at)
                .execute(self.pool.inner()),
            )
            .await;

        match result {
            Err(DbError::Sql(sqlx::Error::Database(ref e))) if e.is_unique_violation() => {
                Err(DbError::AlreadyExists(format!("validator {}", identity.index)))
            }
            other => other.map(|_| ()),
        }
    }

    /// Bulk inserts with `ON CONFLICT DO NOTHING`, so repeated runs over the
    /// same identities are idempotent.
    pub async fn bulk_create(&self, ctx: &Cancellation, identities: &[ValidatorIdentity]) -> Result<u64, DbError> {
        ctx.guard(self.bulk_create_inner(identities)).await
    }

    async fn bulk_create_inner(&self, identities: &[ValidatorIdentity]) -> Result<u64, DbError> {
        if identities.is_empty() {
            return Ok(0);
        }

        let indices: Vec<i64> = identities.iter().map(|i| i.index as i64).collect();
        let pubkeys: Vec<String> = identities.iter().map(|i| i.pubkey.clone()).collect();
        let withdrawal_creds: Vec<String> = identities.iter().map(|i| i.withdrawal_credentials.clone()).collect();
        let eff_balances: Vec<i64> = identities.iter().map(|i| i.effective_balance_gwei).collect();
        let slashed: Vec<bool> = identities.iter().map(|i| i.slashed).collect();
        let activation_epoch: Vec<Option<i64>> = identities.iter().map(|i| i.activation_epoch).collect();
        let exit_epoch: Vec<Option<i64>> = identities.iter().map(|i| i.exit_epoch).collect();
        let withdrawable_epoch: Vec<Option<i64>> = identities.iter().map(|i| i.withdrawable_epoch).collect();
        let names: Vec<Option<String>> = identities.iter().map(|i| i.name.clone()).collect();
        let monitored: Vec<bool> = identities.iter().map(|i| i.monitored).collect();
        let now = Utc::now();

        let result = self
            .timed(
                sqlx::query(
                    "INSERT INTO validators (
                        validator_index, pubkey, withdrawal_credentials, effective_balance, slashed,
                        activation_epoch, exit_epoch, withdrawable_epoch, name, monitored, created_at, updated_at
                    )
                    SELECT *, $11::timestamptz, $11::timestamptz FROM UNNEST(
                        $1::int8[], $2::text[], $3::text[], $4::int8[], $5::bool[],
                        $6::int8[], $7::int8[], $8::int8[], $9::text[], $10::bool[]
                    )
                    ON CONFLICT (validator_index) DO NOTHING",
                )
                .bind(indices)
                .bind(pubkeys)
                .bind(withdrawal_creds)
                .bind(eff_balances)
                .bind(slashed)
                .bind(activation_epoch)
                .bind(exit_epoch)
                .bind(withdrawable_epoch)
                .bind(names)
                .bind(monitored)
                .bind(now)
                .execute(self.pool.inner()),
            )
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn get_by_index(&self, ctx: &Cancellation, index: u64) -> Result<Option<ValidatorIdentity>, DbError> {
        ctx.guard(self.get_by_index_inner(index)).await
    }

    async fn get_by_index_inner(&self, index: u64) -> Result<Option<ValidatorIdentity>, DbError> {
        let row = self
            .timed(
                sqlx::query("SELECT * FROM validators WHERE validator_index = $1")
                    .bind(index as i64)
                    .fetch_optional(self.pool.inner()),
            )
            .await?;
        row.as_ref().map(Self::row_to_identity).transpose()
    }

    pub async fn get_by_pubkey(&self, ctx: &Cancellation, pubkey: &str) -> Result<Option<ValidatorIdentity>, DbError> {
        ctx.guard(self.get_by_pubkey_inner(pubkey)).await
    }

    async fn get_by_pubkey_inner(&self, pubkey: &str) -> Result<Option<ValidatorIdentity>, DbError> {
        let row = self
            .timed(
                sqlx::query("SELECT * FROM validators WHERE pubkey = $1")
                    .bind(pubkey)
                    .fetch_optional(self.pool.inner()),
            )
            .await?;
        row.as_ref().map(Self::row_to_identity).transpose()
    }

    /// Column to sort `list()`'s page query on. `Effectiveness` has no home
    /// in `validators` itself (`att_effectiveness` lives only on
    /// `validator_snapshots`), so `list()` joins in each validator's latest
    /// value under the alias used here.
    fn sort_column(sort_by: SortBy) -> &'static str {
        match sort_by {
            SortBy::Index => "v.validator_index",
            SortBy::Effectiveness => "latest_effectiveness.att_effectiveness",
            SortBy::Balance => "v.effective_balance",
            SortBy::Status => "v.slashed",
        }
    }

    fn sort_direction(sort_order: SortOrder) -> &'static str {
        match sort_order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }

    /// Lists identities matching `filter`, paginated. The `total_count` query
    /// and the page query run concurrently and are joined before returning.
    pub async fn list(
        &self,
        ctx: &Cancellation,
        filter: &DirectoryFilter,
        pagination: Pagination,
    ) -> Result<Page<ValidatorIdentity>, DbError> {
        ctx.guard(self.list_inner(filter, pagination)).await
    }

    async fn list_inner(
        &self,
        filter: &DirectoryFilter,
        pagination: Pagination,
    ) -> Result<Page<ValidatorIdentity>, DbError> {
        let pagination = pagination.normalized();

        let count_fut = self.timed(
            sqlx::query(
                "SELECT COUNT(*) AS n FROM validators
                 WHERE ($1::int8[] IS NULL OR validator_index = ANY($1))
                   AND ($2::text[] IS NULL OR pubkey = ANY($2))
                   AND ($3::text[] IS NULL OR tags && $3)
                   AND ($4::bool IS NULL OR monitored = $4)
                   AND ($5::bool IS NULL OR slashed = $5)
                   AND ($6::text IS NULL OR name LIKE $6 || '%')",
            )
            .bind(filter.indices.as_ref().map(|v| v.iter().map(|i| *i as i64).collect::<Vec<_>>()))
            .bind(filter.pubkeys.clone())
            .bind(filter.tags.clone())
            .bind(filter.monitored)
            .bind(filter.slashed)
            .bind(filter.search_prefix.clone())
            .fetch_one(self.pool.inner()),
        );

        let sort_column = Self::sort_column(pagination.sort_by);
        let sort_direction = Self::sort_direction(pagination.sort_order);
        // `latest_effectiveness` holds each validator's most recent
        // `att_effectiveness` reading so `SortBy::Effectiveness` can sort on
        // it without pulling it onto the `validators` table itself.
        let page_sql = format!(
            "WITH latest_effectiveness AS (
                SELECT DISTINCT ON (validator_index) validator_index, att_effectiveness
                FROM validator_snapshots
                ORDER BY validator_index, time DESC
             )
             SELECT v.* FROM validators v
             LEFT JOIN latest_effectiveness ON latest_effectiveness.validator_index = v.validator_index
             WHERE ($1::int8[] IS NULL OR v.validator_index = ANY($1))
               AND ($2::text[] IS NULL OR v.pubkey = ANY($2))
               AND ($3::text[] IS NULL OR v.tags && $3)
               AND ($4::bool IS NULL OR v.monitored = $4)
               AND ($5::bool IS NULL OR v.slashed = $5)
               AND ($6::text IS NULL OR v.name LIKE $6 || '%')
             ORDER BY {sort_column} {sort_direction} NULLS LAST
             LIMIT $7 OFFSET $8"
        );
        let page_fut = self.timed(
            sqlx::query(&page_sql)
                .bind(filter.indices.as_ref().map(|v| v.iter().map(|i| *i as i64).collect::<Vec<_>>()))
                .bind(filter.pubkeys.clone())
                .bind(filter.tags.clone())
                .bind(filter.monitored)
                .bind(filter.slashed)
                .bind(filter.search_prefix.clone())
                .bind(pagination.limit)
                .bind(pagination.offset)
                .fetch_all(self.pool.inner()),
        );

        let (count_row, rows) = tokio::join!(count_fut, page_fut);
        let total_count: i64 = count_row?.try_get("n")?;
        let items = rows?.iter().map(Self::row_to_identity).collect::<Result<Vec<_>, _>>()?;

        let page = pagination.offset / pagination.limit.max(1) + 1;
        let has_more = pagination.offset + items.len() as i64 < total_count;

        Ok(Page { items, total_count, page, page_size: pagination.limit, has_more })
    }

    /// Partial update; only the fields set in `update` are touched.
    pub async fn update(
        &self,
        ctx: &Cancellation,
        index: u64,
        update: &ValidatorUpdate,
    ) -> Result<DateTime<Utc>, DbError> {
        ctx.guard(self.update_inner(index, update)).await
    }

    async fn update_inner(&self, index: u64, update: &ValidatorUpdate) -> Result<DateTime<Utc>, DbError> {
        let now = Utc::now();
        let result = self
            .timed(
                sqlx::query(
                    "UPDATE validators SET
                        effective_balance = COALESCE($2, effective_balance),
                        slashed = COALESCE($3, slashed),
                        name = COALESCE($4, name),
                        tags = COALESCE($5, tags),
                        monitored = COALESCE($6, monitored),
                        updated_at = $7
                     WHERE validator_index = $1",
                )
                .bind(index as i64)
                .bind(update.effective_balance_gwei)
                .bind(update.slashed)
                .bind(&update.name)
                .bind(&update.tags)
                .bind(update.monitored)
                .bind(now)
                .execute(self.pool.inner()),
            )
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(now)
    }

    /// Removes an identity. Snapshots cascade via the DB foreign key.
    pub async fn delete(&self, ctx: &Cancellation, index: u64) -> Result<(), DbError> {
        ctx.guard(self.delete_inner(index)).await
    }

    async fn delete_inner(&self, index: u64) -> Result<(), DbError> {
        let result = self
            .timed(
                sqlx::query("DELETE FROM validators WHERE validator_index = $1")
                    .bind(index as i64)
                    .execute(self.pool.inner()),
            )
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_sort_option_maps_to_a_distinct_column() {
        let columns = [
            ValidatorDirectory::sort_column(SortBy::Index),
            ValidatorDirectory::sort_column(SortBy::Effectiveness),
            ValidatorDirectory::sort_column(SortBy::Balance),
            ValidatorDirectory::sort_column(SortBy::Status),
        ];
        let unique: std::collections::HashSet<_> = columns.iter().collect();
        assert_eq!(unique.len(), columns.len(), "sort columns must be pairwise distinct: {columns:?}");
    }

    #[test]
    fn effectiveness_sorts_on_the_joined_snapshot_column_not_balance() {
        assert_eq!(
            ValidatorDirectory::sort_column(SortBy::Effectiveness),
            "latest_effectiveness.att_effectiveness"
        );
        assert_eq!(ValidatorDirectory::sort_column(SortBy::Balance), "v.effective_balance");
    }
}
