//! velo-sync: sync coordination and multi-source reconciliation engine
//!
//! Pulls rider, event, and race-result data from several rate-limited
//! providers, reconciles the overlapping answers into one record with
//! field-level provenance, and keeps the roster fresh on per-job cadences
//! without ever duplicating in-flight work.

pub mod api;
pub mod cache;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod history;
pub mod merger;
pub mod runner;
pub mod scheduler;
pub mod sink;
pub mod sources;
pub mod types;

pub use api::{build_router, AppState};
pub use error::{SyncError, SyncResult};
