//! Core ingestion, storage and serving pipeline for beacon-chain validator telemetry.
//!
//! The crate is library-only: the HTTP/GraphQL surface, authentication, CLI
//! argument parsing, environment loading and logging setup all live in an outer
//! collaborator and are not provided here. What this crate exposes is the hard
//! core: a tiered cache fronting a time-series store, a batched loader that
//! coalesces repeated lookups, bulk snapshot ingestion with derived scoring,
//! and the pub/sub invalidation protocol that keeps the cache coherent with
//! writes across processes.
//!
//! ## Modules
//!
//! - `key`: canonical key shapes and TTL profiles
//! - `cache`: typed, tiered cache over the KV store
//! - `invalidation`: pub/sub invalidation bus and optimistic-concurrency writes
//! - `loader`: per-request batch loader
//! - `db`: snapshot store and validator directory over the time-series database
//! - `scoring`: deterministic effectiveness scoring
//! - `dashboard`: fan-out aggregator for the dashboard snapshot
//! - `metrics`: hit/miss counters and latency tracking
//! - `cancellation`: cooperative cancellation context shared by cache/DB calls

pub mod cache;
pub mod cancellation;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod error;
pub mod invalidation;
pub mod key;
pub mod loader;
pub mod metrics;
pub mod models;
pub mod scoring;

pub use config::CoreConfig;
pub use error::{CoreError, CoreResult};

/// Crate version, mirrored from `Cargo.toml` for diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
