//! Canonical key shapes and TTL profiles (C1).
//!
//! Keys are rendered without the namespace prefix; [`crate::cache::TieredCache`]
//! prepends `{prefix}:` once, at the point of talking to Redis, so this module
//! stays free of any cache-backend concern.

use std::time::Duration;

use blake3::Hasher;

/// Data classes that each carry their own TTL row in the profile table (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataClass {
    ValidatorMetadata,
    ValidatorSnapshot,
    Performance,
    NetworkStats,
    Alerts,
    HeadEvent,
}

/// Named TTL strategies; swapping the active one never rewrites existing entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlStrategy {
    Default,
    Aggressive,
    Conservative,
}

impl DataClass {
    /// Seconds to live under a given strategy, per the §4.1 table.
    pub fn ttl_seconds(&self, strategy: TtlStrategy) -> u64 {
        match (self, strategy) {
            (DataClass::ValidatorMetadata, TtlStrategy::Default) => 3600,
            (DataClass::ValidatorMetadata, TtlStrategy::Aggressive) => 1800,
            (DataClass::ValidatorMetadata, TtlStrategy::Conservative) => 7200,

            (DataClass::ValidatorSnapshot, TtlStrategy::Default) => 900,
            (DataClass::ValidatorSnapshot, TtlStrategy::Aggressive) => 300,
            (DataClass::ValidatorSnapshot, TtlStrategy::Conservative) => 1800,

            (DataClass::Performance, TtlStrategy::Default) => 1800,
            (DataClass::Performance, TtlStrategy::Aggressive) => 600,
            (DataClass::Performance, TtlStrategy::Conservative) => 3600,

            (DataClass::NetworkStats, TtlStrategy::Default) => 300,
            (DataClass::NetworkStats, TtlStrategy::Aggressive) => 60,
            (DataClass::NetworkStats, TtlStrategy::Conservative) => 600,

            (DataClass::Alerts, TtlStrategy::Default) => 120,
            (DataClass::Alerts, TtlStrategy::Aggressive) => 60,
            (DataClass::Alerts, TtlStrategy::Conservative) => 300,

            (DataClass::HeadEvent, TtlStrategy::Default) => 30,
            (DataClass::HeadEvent, TtlStrategy::Aggressive) => 10,
            (DataClass::HeadEvent, TtlStrategy::Conservative) => 60,
        }
    }

    pub fn ttl(&self, strategy: TtlStrategy) -> Duration {
        Duration::from_secs(self.ttl_seconds(strategy))
    }
}

/// Canonical key shapes. Rendering is centralized here so C2/C3/C4 never
/// hand-build a key string.
pub enum Key {
    Validator(u64),
    ValidatorByPubkey(String),
    SnapshotLatest(u64),
    SnapshotRecent(u64),
    AlertsActive(u64),
    Performance { index: u64, epoch_from: u64, epoch_to: u64 },
    NetworkStats,
    HeadEvent,
    Version(String),
}

impl Key {
    pub fn render(&self) -> String {
        match self {
            Key::Validator(idx) => format!("validator:{idx}"),
            Key::ValidatorByPubkey(hex) => format!("validator:pubkey:{hex}"),
            Key::SnapshotLatest(idx) => format!("snapshot:{idx}:latest"),
            Key::SnapshotRecent(idx) => format!("snapshot:{idx}:recent"),
            Key::AlertsActive(idx) => format!("alerts:validator:{idx}:active"),
            Key::Performance { index, epoch_from, epoch_to } => {
                format!("performance:{index}:{epoch_from}:{epoch_to}")
            }
            Key::NetworkStats => "network:stats".to_string(),
            Key::HeadEvent => "head:event".to_string(),
            Key::Version(key) => format!("version:{key}"),
        }
    }

    /// The data class this key falls under, for TTL lookup and metrics labeling.
    pub fn data_class(&self) -> DataClass {
        match self {
            Key::Validator(_) | Key::ValidatorByPubkey(_) => DataClass::ValidatorMetadata,
            Key::SnapshotLatest(_) | Key::SnapshotRecent(_) => DataClass::ValidatorSnapshot,
            Key::AlertsActive(_) => DataClass::Alerts,
            Key::Performance { .. } => DataClass::Performance,
            Key::NetworkStats => DataClass::NetworkStats,
            Key::HeadEvent => DataClass::HeadEvent,
            Key::Version(_) => DataClass::ValidatorMetadata,
        }
    }
}

/// Renders a compound filter key: the first 8 bytes of a blake3 hash of a
/// canonical serialization of the filter, hex-encoded.
pub fn filter_key(canonical_repr: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(canonical_repr.as_bytes());
    let hash = hasher.finalize();
    hex::encode_truncated(hash.as_bytes(), 8)
}

mod hex {
    /// Minimal truncated hex encoder so this module does not need the `hex`
    /// crate solely for an 8-byte prefix.
    pub fn encode_truncated(bytes: &[u8], n: usize) -> String {
        bytes[..n.min(bytes.len())]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes_match_spec() {
        assert_eq!(Key::Validator(42).render(), "validator:42");
        assert_eq!(Key::SnapshotLatest(42).render(), "snapshot:42:latest");
        assert_eq!(Key::AlertsActive(7).render(), "alerts:validator:7:active");
        assert_eq!(
            Key::Performance { index: 1, epoch_from: 10, epoch_to: 20 }.render(),
            "performance:1:10:20"
        );
        assert_eq!(Key::NetworkStats.render(), "network:stats");
        assert_eq!(Key::HeadEvent.render(), "head:event");
        assert_eq!(Key::Version("validator:42".to_string()).render(), "version:validator:42");
    }

    #[test]
    fn ttl_table_matches_spec_seconds() {
        assert_eq!(DataClass::ValidatorMetadata.ttl_seconds(TtlStrategy::Default), 3600);
        assert_eq!(DataClass::ValidatorMetadata.ttl_seconds(TtlStrategy::Aggressive), 1800);
        assert_eq!(DataClass::ValidatorMetadata.ttl_seconds(TtlStrategy::Conservative), 7200);
        assert_eq!(DataClass::ValidatorSnapshot.ttl_seconds(TtlStrategy::Default), 900);
        assert_eq!(DataClass::Performance.ttl_seconds(TtlStrategy::Aggressive), 600);
        assert_eq!(DataClass::NetworkStats.ttl_seconds(TtlStrategy::Conservative), 600);
        assert_eq!(DataClass::Alerts.ttl_seconds(TtlStrategy::Default), 120);
        assert_eq!(DataClass::HeadEvent.ttl_seconds(TtlStrategy::Aggressive), 10);
    }

    #[test]
    fn filter_key_is_deterministic_and_truncated() {
        let a = filter_key("monitored=true&tags=foo");
        let b = filter_key("monitored=true&tags=foo");
        let c = filter_key("monitored=false");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16); // 8 bytes hex-encoded
    }
}
