//! Session state management: a TTL-bound cache tier mirrored into a durable
//! SQLite record, reconciled by a coordinator with an explicit restore path,
//! plus a maintenance loop that clears abandoned sessions.

pub mod cache;
pub mod coordinator;
pub mod durable;
pub mod maintenance;

pub use cache::{CacheMode, CacheStore, MemoryCacheStore, RedisCacheStore, SessionSummary};
pub use coordinator::{RestoreOutcome, SessionCoordinator};
pub use durable::{SqliteDurableStore, StoreStats, Transcript, TranscriptSummary};
pub use maintenance::{CleanupReport, MaintenanceScheduler};
