// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod api;
pub mod canonical;
pub mod catalog;
pub mod config;
pub mod dedup;
pub mod fallback;
pub mod ingest;
pub mod matcher;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::api::create_router;
pub use crate::config::Settings;
pub use crate::ingest::cycle::{CycleSummary, Orchestrator, RemapSummary};
pub use crate::ingest::scheduler::{spawn_scheduler, SchedulerCfg};
pub use crate::matcher::{MatchKind, TickerHit, TickerHits};
pub use crate::store::{MemoryStore, PgStore, Store};
