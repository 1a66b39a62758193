//! Configuration structs for every tunable the core components need.
//!
//! Everything here has a [`Default`]; reading environment variables is an
//! explicit, optional convenience (`CoreConfig::from_env`) rather than a
//! requirement for constructing any component. The outer process owns real
//! environment/config loading.

use std::time::Duration;

use crate::key::TtlStrategy;

/// Redis connection settings for the tiered cache and invalidation bus.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Redis hostname or IP.
    pub host: String,

    /// Redis port.
    pub port: u16,

    /// Redis AUTH password, if the deployment requires one.
    pub password: Option<String>,

    /// Redis logical database index.
    pub db: u8,

    /// Namespace prefix applied to every key this cache touches.
    pub key_prefix: String,

    /// TTL profile applied to newly written entries.
    pub ttl_strategy: TtlStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            db: 0,
            key_prefix: "vtc".to_string(),
            ttl_strategy: TtlStrategy::Default,
        }
    }
}

impl CacheConfig {
    /// Redis connection URL built from the individual fields.
    pub fn connection_url(&self) -> String {
        match &self.password {
            Some(pw) => format!("redis://:{}@{}:{}/{}", pw, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// SSL mode for the time-series database connection, per §6's production minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    Disable,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "disable" => Some(SslMode::Disable),
            "require" => Some(SslMode::Require),
            "verify-ca" => Some(SslMode::VerifyCa),
            "verify-full" => Some(SslMode::VerifyFull),
            _ => None,
        }
    }

    /// Whether this mode satisfies the production minimum (require or stronger).
    pub fn meets_production_minimum(&self) -> bool {
        !matches!(self, SslMode::Disable)
    }
}

/// Postgres/TimescaleDB connection settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Postgres/TimescaleDB hostname or IP.
    pub host: String,

    /// Postgres port.
    pub port: u16,

    pub user: String,

    pub password: String,

    /// Database name.
    pub name: String,

    pub ssl_mode: SslMode,

    /// Upper bound on pooled connections.
    pub max_connections: u32,

    /// Connections the pool keeps warm even when idle.
    pub min_connections: u32,

    /// How long to wait for a pooled connection before giving up.
    pub connection_timeout: Duration,

    /// How long snapshot rows are kept before `cleanup_old` may remove them.
    pub snapshot_retention_days: i64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            name: "validator_telemetry".to_string(),
            ssl_mode: SslMode::Disable,
            max_connections: 10,
            min_connections: 2,
            connection_timeout: Duration::from_secs(30),
            snapshot_retention_days: 90,
        }
    }
}

impl DbConfig {
    pub fn connection_url(&self) -> String {
        let ssl = match self.ssl_mode {
            SslMode::Disable => "disable",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        };
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.user, self.password, self.host, self.port, self.name, ssl
        )
    }
}

/// Batch loader tunables (C4).
#[derive(Debug, Clone, Copy)]
pub struct LoaderConfig {
    /// How long the dispatch loop waits for more requests before flushing a batch.
    pub batch_window: Duration,

    /// Queue depth that triggers an early flush, ahead of `batch_window`.
    pub max_batch_size: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(16),
            max_batch_size: 100,
        }
    }
}

/// Invalidation sweeper tunables (C3).
#[derive(Debug, Clone, Copy)]
pub struct SweeperConfig {
    /// How often the sweeper scans for stale keys.
    pub interval: Duration,

    /// Age past which a key with no remaining TTL is swept.
    pub max_age: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_age: Duration::from_secs(3600),
        }
    }
}

/// Dashboard aggregator deadlines (C8).
#[derive(Debug, Clone, Copy)]
pub struct DashboardConfig {
    /// Per-query deadline for the metrics, top-validators and recent-alerts legs.
    pub query_deadline: Duration,

    /// Deadline for the system-health leg, tighter than `query_deadline` by default.
    pub health_deadline: Duration,

    /// When set, a timed-out optional leg (alerts/top validators) degrades to
    /// empty instead of failing the whole snapshot.
    pub best_effort: bool,

    /// Row cap for the top-validators leg.
    pub top_validators_n: usize,

    /// Row cap for the recent-alerts leg.
    pub recent_alerts_n: usize,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            query_deadline: Duration::from_secs(5),
            health_deadline: Duration::from_secs(3),
            best_effort: false,
            top_validators_n: 10,
            recent_alerts_n: 20,
        }
    }
}

/// Top-level configuration bundle for the whole core.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub cache: CacheConfig,
    pub db: DbConfig,
    pub loader: LoaderConfig,
    pub sweeper: SweeperConfig,
    pub dashboard: DashboardConfig,
}

impl CoreConfig {
    /// Reads well-known environment variable names, falling back to
    /// [`Default`] for anything absent. Never called implicitly; the
    /// outer process decides whether and when to invoke this.
    pub fn from_env() -> Self {
        let mut cfg = CoreConfig::default();

        if let Ok(v) = std::env::var("CACHE_HOST") {
            cfg.cache.host = v;
        }
        if let Ok(v) = std::env::var("CACHE_PORT") {
            if let Ok(p) = v.parse() {
                cfg.cache.port = p;
            }
        }
        if let Ok(v) = std::env::var("CACHE_PASSWORD") {
            cfg.cache.password = Some(v);
        }
        if let Ok(v) = std::env::var("CACHE_DB") {
            if let Ok(d) = v.parse() {
                cfg.cache.db = d;
            }
        }
        if let Ok(v) = std::env::var("CACHE_KEY_PREFIX") {
            cfg.cache.key_prefix = v;
        }

        if let Ok(v) = std::env::var("DB_HOST") {
            cfg.db.host = v;
        }
        if let Ok(v) = std::env::var("DB_PORT") {
            if let Ok(p) = v.parse() {
                cfg.db.port = p;
            }
        }
        if let Ok(v) = std::env::var("DB_USER") {
            cfg.db.user = v;
        }
        if let Ok(v) = std::env::var("DB_PASSWORD") {
            cfg.db.password = v;
        }
        if let Ok(v) = std::env::var("DB_NAME") {
            cfg.db.name = v;
        }
        if let Ok(v) = std::env::var("DB_SSL_MODE") {
            if let Some(mode) = SslMode::from_str_opt(&v) {
                cfg.db.ssl_mode = mode;
            }
        }
        if let Ok(v) = std::env::var("SNAPSHOT_RETENTION_DAYS") {
            if let Ok(d) = v.parse() {
                cfg.db.snapshot_retention_days = d;
            }
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_non_production_ssl() {
        let cfg = CoreConfig::default();
        assert!(!cfg.db.ssl_mode.meets_production_minimum());
    }

    #[test]
    fn cache_connection_url_includes_password_when_set() {
        let mut cfg = CacheConfig::default();
        cfg.password = Some("secret".to_string());
        assert!(cfg.connection_url().contains("secret"));
    }

    #[test]
    fn ssl_mode_parsing() {
        assert_eq!(SslMode::from_str_opt("require"), Some(SslMode::Require));
        assert_eq!(SslMode::from_str_opt("bogus"), None);
    }
}
