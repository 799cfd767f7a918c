//! tendersync: run/job orchestration and incremental-sync engine for
//! crawling government procurement portals.
//!
//! The library supervises external worker processes (the actual scrapers),
//! consumes their structured event stream, and owns the durable state:
//! the run ledger and dedup store (SQLite), the known-item manifest, the
//! per-portal checkpoint artifact, and the department snapshot used for
//! delta planning.

pub mod captcha;
pub mod checkpoint;
pub mod config;
pub mod delta;
pub mod errors;
pub mod events;
pub mod manifest;
pub mod runner;
pub mod store;
pub mod supervisor;
pub mod sync;
