//! Durable, crash-consistent state store: sessions, hosts, iterations,
//! per-host results, compressed log blobs, and metadata.

mod compression;
pub mod schema;
mod store;
pub mod types;

pub use store::{SharedStateStore, StateStore, StoreError, StoreResult};
pub use types::{
    BootResult, BuildLog, BuildResult, Host, Iteration, IterationResult, LogKind, Metadata,
    Session, SessionStatus, TestResult, Verdict,
};
