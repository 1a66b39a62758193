//! Shared data types (§3). Representation here is JSON- and sqlx-friendly;
//! neither the cache nor the database layer need a second parallel type.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A validator's identity and slowly-changing metadata.
///
/// `index` and `pubkey` are immutable after creation (enforced by the
/// directory layer never including them in its `UPDATE` column list).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidatorIdentity {
    /// Beacon-chain validator index. Immutable after creation.
    pub index: u64,
    /// BLS public key, hex-encoded. Immutable after creation.
    pub pubkey: String,
    /// Withdrawal credentials, hex-encoded.
    pub withdrawal_credentials: String,
    /// Operator-assigned display name.
    pub name: Option<String>,
    /// Free-form labels used by directory filtering.
    pub tags: Vec<String>,
    /// Whether this validator is actively tracked for alerting.
    pub monitored: bool,
    /// Epoch the validator became active, if known.
    pub activation_epoch: Option<i64>,
    /// Epoch the validator exited, if it has.
    pub exit_epoch: Option<i64>,
    /// Epoch withdrawal becomes possible, if known.
    pub withdrawable_epoch: Option<i64>,
    /// Cached projection; see DESIGN.md open-question 2 for the authority rule.
    pub effective_balance_gwei: i64,
    /// Whether this validator has been slashed.
    pub slashed: bool,
    /// When this identity row was first created.
    pub created_at: DateTime<Utc>,
    /// When this identity row was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Fields a caller may change via [`crate::db::directory::ValidatorDirectory::update`].
#[derive(Debug, Clone, Default)]
pub struct ValidatorUpdate {
    /// New effective balance, if changed.
    pub effective_balance_gwei: Option<i64>,
    /// New slashed status, if changed.
    pub slashed: Option<bool>,
    /// New display name, if changed.
    pub name: Option<String>,
    /// New tag set, if changed (replaces, does not merge).
    pub tags: Option<Vec<String>>,
    /// New monitored flag, if changed.
    pub monitored: Option<bool>,
}

/// One append-only per-slot observation for a validator. Never mutated after
/// insertion; ordering and uniqueness are keyed by `(validator_index, time)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    /// Slot time this observation was taken at.
    pub time: DateTime<Utc>,
    pub validator_index: u64,
    pub balance_gwei: i64,
    pub effective_balance_gwei: i64,
    /// Rolling attestation effectiveness, percent; `None` before enough history exists.
    pub att_effectiveness: Option<f64>,
    /// Slots between the attested slot and its inclusion.
    pub att_inclusion_delay: Option<u32>,
    pub att_head_vote: Option<bool>,
    pub att_source_vote: Option<bool>,
    pub att_target_vote: Option<bool>,
    pub proposals_scheduled: u32,
    pub proposals_executed: u32,
    pub proposals_missed: u32,
    pub sync_committee_participation: bool,
    pub slashed: bool,
    pub is_online: bool,
    /// Current streak of missed attestations, reset to 0 on a hit.
    pub consecutive_missed_attestations: u32,
    /// Estimated income for this slot, gwei.
    pub daily_income_gwei: Option<i64>,
    /// Annualized return estimate, percent.
    pub apr: Option<f64>,
}

/// Alert severity levels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Alert lifecycle state. See DESIGN.md open-question 1 for why both
/// vocabularies (`new/read/dismissed` and `active/acknowledged/resolved`)
/// coexist in one enum rather than being reconciled into a smaller one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    New,
    Read,
    Dismissed,
    Active,
    Acknowledged,
    Resolved,
    Ignored,
}

impl AlertStatus {
    /// Terminal states never transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AlertStatus::Dismissed | AlertStatus::Resolved | AlertStatus::Ignored
        )
    }
}

/// One alert raised for a validator (or system-wide, when `validator_index` is `None`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub id: i64,
    /// The validator this alert concerns, or `None` for a system-wide alert.
    pub validator_index: Option<u64>,
    /// Machine-readable category, e.g. `"missed_attestation"`.
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    /// Arbitrary structured context attached at creation time.
    pub details: HashMap<String, serde_json::Value>,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// Applies a status transition, rejecting moves out of a terminal state.
    pub fn transition_to(&mut self, target: AlertStatus, now: DateTime<Utc>) -> Result<(), String> {
        if self.status.is_terminal() {
            return Err(format!(
                "cannot transition out of terminal status {:?}",
                self.status
            ));
        }
        match target {
            AlertStatus::Acknowledged => self.acknowledged_at = Some(now),
            AlertStatus::Resolved => self.resolved_at = Some(now),
            _ => {}
        }
        self.status = target;
        self.updated_at = now;
        Ok(())
    }
}

/// A window/time-range query over a single validator's snapshots (§4.5).
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    pub validator_index: u64,
    /// Inclusive lower time bound; unbounded when `None`.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper time bound; unbounded when `None`.
    pub to: Option<DateTime<Utc>>,
    /// Row cap; defaults to 100 when `None`.
    pub limit: Option<i64>,
    /// Rows to skip; defaults to 0 when `None`.
    pub offset: Option<i64>,
}

/// Aggregation bucket width for [`crate::db::snapshot_store::SnapshotStore::aggregate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateInterval {
    Hourly,
    Daily,
}

impl AggregateInterval {
    /// The fixed `time_bucket` interval literal for this variant. A closed
    /// enumeration, never a caller-supplied string, per §9's SQL composition rule.
    pub fn as_sql_interval(&self) -> &'static str {
        match self {
            AggregateInterval::Hourly => "1 hour",
            AggregateInterval::Daily => "1 day",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hourly" => Some(AggregateInterval::Hourly),
            "daily" => Some(AggregateInterval::Daily),
            _ => None,
        }
    }
}

/// One bucketed aggregate row. `min_balance`/`max_balance` are populated only
/// for [`AggregateInterval::Daily`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateBucket {
    /// Start of this bucket's time window.
    pub bucket: DateTime<Utc>,
    pub avg_balance: f64,
    pub avg_effectiveness: f64,
    /// Count of snapshots in this bucket with `att_effectiveness < 95`.
    pub suboptimal_count: i64,
    pub min_balance: Option<i64>,
    pub max_balance: Option<i64>,
}

/// Directory filter fields (§4.6).
#[derive(Debug, Clone, Default)]
pub struct DirectoryFilter {
    /// Restrict to these validator indices; no restriction when `None`.
    pub indices: Option<Vec<u64>>,
    /// Restrict to these pubkeys; no restriction when `None`.
    pub pubkeys: Option<Vec<String>>,
    /// Restrict to validators carrying any of these tags; no restriction when `None`.
    pub tags: Option<Vec<String>>,
    pub monitored: Option<bool>,
    pub slashed: Option<bool>,
    /// Restrict to validators whose name starts with this prefix.
    pub search_prefix: Option<String>,
}

/// Closed sort-column enumeration (§4.6/§4.5/§9 — never a raw caller string).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Index,
    Effectiveness,
    Balance,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct Pagination {
    /// Page size; clamped into `[1,100]` by [`Pagination::normalized`].
    pub limit: i64,
    /// Rows to skip before the page starts.
    pub offset: i64,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 20,
            offset: 0,
            sort_by: SortBy::Index,
            sort_order: SortOrder::Asc,
        }
    }
}

impl Pagination {
    /// Clamps `limit` into `[1,100]`, falling back to the default (20) when
    /// it is outside that range (per the boundary behavior in §8).
    pub fn normalized(mut self) -> Self {
        if self.limit < 1 || self.limit > 100 {
            self.limit = 20;
        }
        if self.offset < 0 {
            self.offset = 0;
        }
        self
    }
}

/// Paginated result envelope (§4.6).
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Total rows matching the filter, across all pages.
    pub total_count: i64,
    /// 1-indexed page number this result represents.
    pub page: i64,
    pub page_size: i64,
    /// Whether a subsequent page would return further rows.
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_clamps_out_of_range_limit() {
        let p = Pagination {
            limit: 0,
            ..Pagination::default()
        }
        .normalized();
        assert_eq!(p.limit, 20);

        let p = Pagination {
            limit: 500,
            ..Pagination::default()
        }
        .normalized();
        assert_eq!(p.limit, 20);

        let p = Pagination {
            limit: 50,
            ..Pagination::default()
        }
        .normalized();
        assert_eq!(p.limit, 50);
    }

    #[test]
    fn alert_transition_rejects_leaving_terminal_state() {
        let now = Utc::now();
        let mut alert = Alert {
            id: 1,
            validator_index: Some(7),
            alert_type: "missed_attestation".to_string(),
            severity: AlertSeverity::Warning,
            title: "t".to_string(),
            message: "m".to_string(),
            details: HashMap::new(),
            status: AlertStatus::Resolved,
            created_at: now,
            updated_at: now,
            acknowledged_at: None,
            resolved_at: Some(now),
        };
        assert!(alert.transition_to(AlertStatus::Active, now).is_err());
    }

    #[test]
    fn alert_transition_sets_acknowledged_timestamp() {
        let now = Utc::now();
        let mut alert = Alert {
            id: 1,
            validator_index: None,
            alert_type: "t".to_string(),
            severity: AlertSeverity::Info,
            title: "t".to_string(),
            message: "m".to_string(),
            details: HashMap::new(),
            status: AlertStatus::New,
            created_at: now,
            updated_at: now,
            acknowledged_at: None,
            resolved_at: None,
        };
        alert.transition_to(AlertStatus::Acknowledged, now).unwrap();
        assert!(alert.acknowledged_at.is_some());
        assert_eq!(alert.status, AlertStatus::Acknowledged);
    }

    #[test]
    fn aggregate_interval_parse_rejects_unknown() {
        assert!(AggregateInterval::parse("weekly").is_none());
        assert_eq!(AggregateInterval::parse("hourly"), Some(AggregateInterval::Hourly));
    }
}
