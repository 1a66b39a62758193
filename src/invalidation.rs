//! Invalidation bus (C3): pub/sub invalidation events, versioned atomic
//! writes, cleanup sweeper.
//!
//! This bus fans out *across* processes: publishing goes over a real Redis
//! channel (`cache:invalidation`), and an in-process `broadcast::Sender` is
//! what local subscribers (this process's own handlers) listen on after a
//! background task relays inbound Redis messages onto it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex as AsyncMutex};

use crate::cache::TieredCache;
use crate::error::InvalidationError;
use crate::key::Key;

pub const INVALIDATION_CHANNEL: &str = "cache:invalidation";

/// Event kinds published on the invalidation channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Validator,
    Snapshot,
    Performance,
    NetworkStats,
    Alert,
    Bulk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub kind: EventKind,
    pub entity_id: String,
    pub published_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

/// A handler for one event kind. Errors are logged, never propagated to the
/// dispatch loop (§4.3: "handler errors are logged but never crash the
/// dispatch loop").
pub trait InvalidationHandler: Send + Sync {
    fn handle(&self, event: &InvalidationEvent) -> Result<(), String>;
}

/// Pub/sub invalidation bus plus the optimistic-concurrency / versioned-write
/// helpers that share its Redis connection.
pub struct InvalidationBus {
    cache: Arc<TieredCache>,
    client: redis::Client,
    local_tx: broadcast::Sender<InvalidationEvent>,
    handlers: DashMap<EventKind, Vec<Arc<dyn InvalidationHandler>>>,
}

impl InvalidationBus {
    pub fn new(cache: Arc<TieredCache>, redis_url: &str) -> Result<Self, InvalidationError> {
        let client = redis::Client::open(redis_url)
            .map_err(InvalidationError::PublishFailed)?;
        let (local_tx, _rx) = broadcast::channel(1024);
        Ok(Self {
            cache,
            client,
            local_tx,
            handlers: DashMap::new(),
        })
    }

    /// Registers a handler for one event kind, in call order.
    pub fn register(&self, kind: EventKind, handler: Arc<dyn InvalidationHandler>) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    /// A local subscription handle for processes that want to observe events
    /// without going through the handler registry (e.g. tests, scenario 2).
    pub fn subscribe_local(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.local_tx.subscribe()
    }

    /// Runs until the Redis subscription ends: relays inbound messages on
    /// [`INVALIDATION_CHANNEL`] into the local broadcast channel and runs
    /// registered handlers sequentially, best-effort.
    pub async fn run_dispatch_loop(self: Arc<Self>) -> Result<(), InvalidationError> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(InvalidationError::SubscribeFailed)?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(INVALIDATION_CHANNEL)
            .await
            .map_err(InvalidationError::SubscribeFailed)?;

        let mut stream = pubsub.into_on_message();
        use futures::StreamExt;
        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("invalidation dispatch: bad payload: {e}");
                    continue;
                }
            };
            let event: InvalidationEvent = match serde_json::from_str(&payload) {
                Ok(e) => e,
                Err(e) => {
                    log::warn!("invalidation dispatch: bad event json: {e}");
                    continue;
                }
            };

            let _ = self.local_tx.send(event.clone());

            if let Some(handlers) = self.handlers.get(&event.kind) {
                for handler in handlers.iter() {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler.handle(&event)));
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => log::warn!("invalidation handler failed for {:?}: {e}", event.kind),
                        Err(panic) => {
                            let message = panic_message(&panic);
                            log::error!("invalidation handler panicked for {:?}: {message}", event.kind);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn publish(&self, kind: EventKind, entity_id: impl Into<String>) -> Result<(), InvalidationError> {
        let event = InvalidationEvent {
            kind,
            entity_id: entity_id.into(),
            published_at: Utc::now(),
            metadata: HashMap::new(),
        };
        let payload = serde_json::to_string(&event).expect("InvalidationEvent always serializes");

        let raw = self.cache.raw_connection();
        let mut conn = raw.lock().await;
        let _: () = conn
            .publish(INVALIDATION_CHANNEL, payload)
            .await
            .map_err(InvalidationError::PublishFailed)?;
        Ok(())
    }

    /// Deletes `validator:{index}`, `snapshot:{index}:latest`,
    /// `alerts:validator:{index}:active`, then publishes. Publish
    /// happens-after the deletes (§5 ordering).
    pub async fn invalidate_validator(&self, index: u64) -> Result<(), InvalidationError> {
        self.delete_keys(&[
            Key::Validator(index).render(),
            Key::SnapshotLatest(index).render(),
            Key::AlertsActive(index).render(),
        ])
        .await?;
        self.publish(EventKind::Validator, index.to_string()).await
    }

    pub async fn invalidate_snapshot(&self, index: u64) -> Result<(), InvalidationError> {
        self.delete_keys(&[Key::SnapshotLatest(index).render(), Key::SnapshotRecent(index).render()])
            .await?;
        self.publish(EventKind::Snapshot, index.to_string()).await
    }

    pub async fn invalidate_performance(&self, index: u64, epoch: u64) -> Result<(), InvalidationError> {
        self.delete_keys(&[format!("performance:{index}:*{epoch}*")]).await?;
        self.publish(EventKind::Performance, format!("{index}:{epoch}")).await
    }

    pub async fn invalidate_network_stats(&self) -> Result<(), InvalidationError> {
        self.delete_keys(&[Key::NetworkStats.render()]).await?;
        self.publish(EventKind::NetworkStats, "network").await
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<(), InvalidationError> {
        let raw = self.cache.raw_connection();
        let mut conn = raw.lock().await;
        let namespaced: Vec<String> = keys.iter().map(|k| format!("{}:{}", self.cache.prefix(), k)).collect();
        if !namespaced.is_empty() {
            let _: u64 = conn
                .del(&namespaced)
                .await
                .map_err(|e| InvalidationError::Cache(crate::error::CacheError::Backend {
                    op: "invalidate.del",
                    source: e,
                }))?;
        }
        Ok(())
    }

    /// Cursor-scans keys matching a shell-style pattern, deletes in chunks of
    /// 100, publishes one `bulk` event carrying the total deleted count.
    pub async fn bulk_invalidate(&self, pattern: &str) -> Result<u64, InvalidationError> {
        let raw = self.cache.raw_connection();
        let full_pattern = format!("{}:{}", self.cache.prefix(), pattern);
        let mut cursor: u64 = 0;
        let mut total = 0u64;

        loop {
            let mut conn = raw.lock().await;
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&full_pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut *conn)
                .await
                .map_err(|e| InvalidationError::Cache(crate::error::CacheError::Backend {
                    op: "bulk_invalidate.scan",
                    source: e,
                }))?;

            for chunk in keys.chunks(100) {
                if !chunk.is_empty() {
                    let removed: u64 = conn
                        .del(chunk)
                        .await
                        .map_err(|e| InvalidationError::Cache(crate::error::CacheError::Backend {
                            op: "bulk_invalidate.del",
                            source: e,
                        }))?;
                    total += removed;
                }
            }
            drop(conn);

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        self.publish(EventKind::Bulk, total.to_string()).await?;
        Ok(total)
    }

    /// Optimistic-concurrency read-modify-write. Reads the current value
    /// under a `WATCH`, calls `update_fn`, writes the result in a `MULTI`/
    /// `EXEC` transaction; retries up to 5 times on a watch conflict.
    pub async fn atomic_update<T, F>(&self, key: &str, ttl: Duration, mut update_fn: F) -> Result<T, InvalidationError>
    where
        T: Serialize + for<'de> Deserialize<'de> + Clone,
        F: FnMut(Option<T>) -> T,
    {
        const MAX_ATTEMPTS: u32 = 5;
        let full_key = format!("{}:{}", self.cache.prefix(), key);
        let raw = self.cache.raw_connection();

        for attempt in 0..MAX_ATTEMPTS {
            let mut conn = raw.lock().await;

            let _: () = redis::cmd("WATCH")
                .arg(&full_key)
                .query_async(&mut *conn)
                .await
                .map_err(|e| InvalidationError::Cache(crate::error::CacheError::Backend {
                    op: "atomic_update.watch",
                    source: e,
                }))?;

            let current: Option<Vec<u8>> = conn
                .get(&full_key)
                .await
                .map_err(|e| InvalidationError::Cache(crate::error::CacheError::Backend {
                    op: "atomic_update.get",
                    source: e,
                }))?;
            let current_val: Option<T> = current.and_then(|bytes| crate::cache::codec::decode(key, &bytes).ok());

            let new_val = update_fn(current_val);
            let encoded = crate::cache::codec::encode(key, &new_val)
                .map_err(InvalidationError::Cache)?;

            let mut pipe = redis::pipe();
            pipe.atomic().set_ex(&full_key, encoded, ttl.as_secs().max(1));
            let result: Option<()> = pipe
                .query_async(&mut *conn)
                .await
                .map_err(|e| InvalidationError::Cache(crate::error::CacheError::Backend {
                    op: "atomic_update.exec",
                    source: e,
                }))?;

            if result.is_some() {
                return Ok(new_val);
            }

            log::warn!("atomic_update: watch conflict on {key}, attempt {attempt}");
        }

        Err(InvalidationError::AtomicUpdateExhausted(key.to_string()))
    }

    /// Increments `version:{key}` and stores `value` under the namespaced
    /// key, returning the new version number (I3: non-decreasing).
    pub async fn set_with_version<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<u64, InvalidationError> {
        let version_key = format!("{}:{}", self.cache.prefix(), Key::Version(key.to_string()).render());
        let full_key = format!("{}:{}", self.cache.prefix(), key);

        let raw = self.cache.raw_connection();
        let mut conn = raw.lock().await;

        let version: u64 = conn
            .incr(&version_key, 1u64)
            .await
            .map_err(|e| InvalidationError::Cache(crate::error::CacheError::Backend {
                op: "set_with_version.incr",
                source: e,
            }))?;

        let encoded = crate::cache::codec::encode(key, value).map_err(InvalidationError::Cache)?;
        let _: () = conn
            .set_ex(&full_key, encoded, ttl.as_secs().max(1))
            .await
            .map_err(|e| InvalidationError::Cache(crate::error::CacheError::Backend {
                op: "set_with_version.set",
                source: e,
            }))?;

        Ok(version)
    }

    /// Returns `(value, version)`, or a cache miss if either is absent.
    pub async fn get_with_version<T: for<'de> Deserialize<'de>>(
        &self,
        key: &str,
    ) -> Result<(T, u64), InvalidationError> {
        let version_key = format!("{}:{}", self.cache.prefix(), Key::Version(key.to_string()).render());
        let full_key = format!("{}:{}", self.cache.prefix(), key);

        let raw = self.cache.raw_connection();
        let mut conn = raw.lock().await;

        let version: Option<u64> = conn
            .get(&version_key)
            .await
            .map_err(|e| InvalidationError::Cache(crate::error::CacheError::Backend {
                op: "get_with_version.version",
                source: e,
            }))?;
        let version = version.ok_or_else(|| {
            InvalidationError::Cache(crate::error::CacheError::Miss(key.to_string()))
        })?;

        let bytes: Option<Vec<u8>> = conn
            .get(&full_key)
            .await
            .map_err(|e| InvalidationError::Cache(crate::error::CacheError::Backend {
                op: "get_with_version.value",
                source: e,
            }))?;
        let bytes = bytes.ok_or_else(|| {
            InvalidationError::Cache(crate::error::CacheError::Miss(key.to_string()))
        })?;

        let value = crate::cache::codec::decode(key, &bytes).map_err(InvalidationError::Cache)?;
        Ok((value, version))
    }
}

/// Periodically scans the namespace and deletes any key with no remaining
/// TTL (expired or never given one). Runs until `cancelled` resolves.
pub async fn run_cleanup_sweeper(
    cache: Arc<TieredCache>,
    interval: Duration,
    cancelled: Arc<AsyncMutex<bool>>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if *cancelled.lock().await {
            log::info!("cleanup sweeper stopping on cancellation");
            return;
        }

        let pattern = format!("{}:*", cache.prefix());
        let raw = cache.raw_connection();
        let mut conn = raw.lock().await;
        let mut cursor: u64 = 0;
        let mut swept = 0u64;

        loop {
            let scan_result: Result<(u64, Vec<String>), redis::RedisError> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut *conn)
                .await;

            let (next_cursor, keys) = match scan_result {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("cleanup sweeper scan failed: {e}");
                    break;
                }
            };

            for key in &keys {
                let ttl: i64 = redis::cmd("TTL")
                    .arg(key)
                    .query_async(&mut *conn)
                    .await
                    .unwrap_or(-2);
                if ttl <= 0 {
                    let _: Result<u64, _> = conn.del(key).await;
                    swept += 1;
                }
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        if swept > 0 {
            log::debug!("cleanup sweeper removed {swept} keys with no remaining TTL");
        }
    }
}

/// Best-effort extraction of a panic payload as a displayable string.
fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PanickingHandler;

    impl InvalidationHandler for PanickingHandler {
        fn handle(&self, _event: &InvalidationEvent) -> Result<(), String> {
            panic!("handler exploded");
        }
    }

    #[test]
    fn handler_panic_is_caught_and_does_not_propagate() {
        let handler = PanickingHandler;
        let event = InvalidationEvent {
            kind: EventKind::Snapshot,
            entity_id: "1".to_string(),
            published_at: Utc::now(),
            metadata: HashMap::new(),
        };
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler.handle(&event)));
        assert!(outcome.is_err());
        // The dispatch loop itself must survive this exact shape of failure;
        // asserting catch_unwind().is_err() here mirrors what run_dispatch_loop does.
    }

    #[test]
    fn event_kind_round_trips_through_json() {
        let event = InvalidationEvent {
            kind: EventKind::Snapshot,
            entity_id: "42".to_string(),
            published_at: Utc::now(),
            metadata: HashMap::new(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"snapshot\""));
        let back: InvalidationEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.entity_id, "42");
    }

    #[test]
    fn panic_message_extracts_str_and_string_payloads() {
        let outcome = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(&*outcome), "boom");

        let outcome = std::panic::catch_unwind(|| panic!("{}", "dynamic".to_string())).unwrap_err();
        assert_eq!(panic_message(&*outcome), "dynamic");
    }
}
