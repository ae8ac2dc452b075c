//! Column family definitions and key-prefix scheme for the state store.
//!
//! Each column family provides logical separation of one record kind while
//! sharing the same RocksDB instance. Lookups that are not by primary key
//! (build logs by iteration, metadata by session) list the full column
//! family prefix and filter in memory, mirroring the teacher's
//! `get_session_tasks` pattern; record counts per iteration are small enough
//! (one per host) that this is simple and correct rather than a scalability
//! concern.

pub const CF_SESSIONS: &str = "sessions";
pub const CF_HOSTS: &str = "hosts";
pub const CF_ITERATIONS: &str = "iterations";
pub const CF_ITERATION_RESULTS: &str = "iteration_results";
pub const CF_BUILD_LOGS: &str = "build_logs";
pub const CF_METADATA: &str = "metadata";

pub const ALL_CFS: &[&str] = &[
    CF_SESSIONS,
    CF_HOSTS,
    CF_ITERATIONS,
    CF_ITERATION_RESULTS,
    CF_BUILD_LOGS,
    CF_METADATA,
];

/// Key prefixes for compound keys. Iteration numbers are zero-padded so
/// prefix-ordered RocksDB iteration yields them in ascending order.
pub mod keys {
    pub fn session(session_id: &str) -> String {
        format!("sess:{}", session_id)
    }

    pub fn session_prefix() -> &'static str {
        "sess:"
    }

    pub fn host(host_id: &str) -> String {
        format!("host:{}", host_id)
    }

    pub fn host_prefix() -> &'static str {
        "host:"
    }

    /// Iterations are keyed by `iter:{session}:{number:010}` so a prefix scan
    /// over one session returns them in iteration order.
    pub fn iteration(session_id: &str, number: u32) -> String {
        format!("iter:{}:{:010}", session_id, number)
    }

    pub fn iteration_prefix(session_id: &str) -> String {
        format!("iter:{}:", session_id)
    }

    pub fn iteration_result(iteration_id: &str, host_id: &str) -> String {
        format!("ires:{}:{}", iteration_id, host_id)
    }

    pub fn iteration_result_prefix(iteration_id: &str) -> String {
        format!("ires:{}:", iteration_id)
    }

    pub fn build_log(log_id: &str) -> String {
        format!("blog:{}", log_id)
    }

    pub fn build_log_prefix() -> &'static str {
        "blog:"
    }

    pub fn metadata(meta_id: &str) -> String {
        format!("meta:{}", meta_id)
    }

    pub fn metadata_prefix() -> &'static str {
        "meta:"
    }
}
