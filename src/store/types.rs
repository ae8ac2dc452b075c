//! Record types persisted by the state store, per the data model: Session,
//! Host, Iteration, IterationResult, BuildLog, Metadata.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Halted,
    Completed,
    Failed,
}

/// One end-to-end bisection run. `good`/`bad` are immutable once created;
/// `result_commit` is set only on the transition to `Completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub good_commit: String,
    pub bad_commit: String,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub status: SessionStatus,
    pub result_commit: Option<String>,
    /// Opaque serialized `Config`, stored so a resumed session does not
    /// require the caller to re-supply it.
    pub config_blob: Vec<u8>,
    /// Opaque in-flight state (current iteration number, stuck-detector
    /// counter, last commit seen) so resume can reconstruct loop state.
    pub state_blob: Vec<u8>,
    pub error: Option<String>,
}

/// A target machine bound to a session. Created at session init, never
/// mutated, destroyed with the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub session_id: String,
    pub hostname: String,
    pub ssh_user: String,
    pub kernel_path: String,
    pub bisect_path: String,
    pub test_script: Option<String>,
    pub power_control_type: Option<String>,
    pub power_credentials: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Good,
    Bad,
    Skip,
}

/// One candidate commit under evaluation. Created before phase 0 begins;
/// `verdict` is written exactly once, when the iteration terminates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub id: String,
    pub session_id: String,
    pub number: u32,
    pub commit_sha: String,
    pub commit_message: String,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub duration_secs: Option<f64>,
    pub verdict: Option<Verdict>,
    pub error: Option<String>,
    /// The `make kernelrelease` string this iteration built, used by phase 2
    /// boot verification.
    pub kernel_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildResult {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootResult {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestResult {
    Pass,
    Fail,
}

/// The outcome of one iteration on one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationResult {
    pub id: String,
    pub iteration_id: String,
    pub host_id: String,
    pub build_result: Option<BuildResult>,
    pub boot_result: Option<BootResult>,
    pub test_result: Option<TestResult>,
    pub r#final: Verdict,
    pub error: Option<String>,
    pub test_output: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Build,
    Boot,
    Test,
    Console,
}

/// A streamed log blob. Created empty at phase start, grown by append
/// chunks, finalized with an exit code. Content is always stored compressed;
/// this type never exposes the algorithm to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildLog {
    pub id: String,
    pub iteration_id: String,
    pub host_id: String,
    pub kind: LogKind,
    pub created_at: i64,
    pub compressed_content: Vec<u8>,
    pub uncompressed_size: u64,
    pub exit_code: Option<i32>,
}

/// A key/value or text artifact collected out-of-band (kernel `.config`,
/// `uname -a`, package list). Treated as opaque by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub id: String,
    pub session_id: String,
    pub iteration_id: Option<String>,
    pub host_id: Option<String>,
    pub kind: String,
    pub collected_at: i64,
    pub payload: String,
}
