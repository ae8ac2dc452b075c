//! Crate-wide error type.
//!
//! Every failure kind a caller can match on is a distinct variant rather than
//! a string; recovery text is attached at the type level so a halted or
//! failed session can tell an operator what to do next, not just what broke.

use std::path::PathBuf;
use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("transport timeout talking to {host}")]
    TransportTimeout { host: String },

    #[error("transport error talking to {host}: {message}")]
    Transport { host: String, message: String },

    #[error("build failed on {host}: {message}")]
    BuildFailed { host: String, message: String },

    #[error("boot timeout on {host} after {timeout_secs}s")]
    BootTimeout { host: String, timeout_secs: u64 },

    #[error("wrong kernel booted on {host}: expected {expected}, got {actual}")]
    WrongKernelBooted {
        host: String,
        expected: String,
        actual: String,
    },

    #[error("host {host} unreachable while deferring mark for commit {commit}")]
    HostUnreachableAtMark { host: String, commit: String },

    #[error("commit {commit} missing on {host}")]
    CommitMissing { host: String, commit: String },

    #[error(
        "inverted bisect range: merge-base between {good} and {bad} is already bad \
         (stderr indicated good/bad were swapped)"
    )]
    InvertedRange { good: String, bad: String },

    #[error("commits swapped: {good} is newer than {bad}; try swapping good and bad")]
    CommitsSwapped { good: String, bad: String },

    #[error("{good} and {bad} are on unrelated branches (neither is an ancestor of the other)")]
    UnrelatedBranches { good: String, bad: String },

    #[error("{sha} is not a valid 40-character hex commit sha")]
    InvalidSha { sha: String },

    #[error("commit missing: {which} ({sha}) could not be resolved on {host}: {message}")]
    CommitUnresolvable {
        which: &'static str,
        sha: String,
        host: String,
        message: String,
    },

    #[error("good == bad ({sha}); nothing to bisect")]
    GoodEqualsBad { sha: String },

    #[error("bisection tool returned identical commit {sha} for {count} consecutive iterations")]
    StuckOnSameCommit { sha: String, count: u32 },

    #[error("safety cap of {max} iterations exceeded")]
    SafetyCapExceeded { max: u32 },

    #[error("power controller unavailable on {host}; cannot recover from boot failure")]
    PowerControllerUnavailable { host: String },

    #[error("metadata collection failed on {host}: {message}")]
    MetadataCollection { host: String, message: String },

    #[error("no running or halted session found")]
    NoSessionToResume,

    #[error("config error: {message}")]
    Config { message: String },

    #[error("config file not found at {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Text shown to an operator alongside the error, mirroring the table in
    /// the error-handling design: every halt/failure names what to do next.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Self::TransportTimeout { .. } | Self::Transport { .. } => {
                Some("Check network connectivity and SSH credentials to the host, then retry.")
            }
            Self::BuildFailed { .. } => {
                Some("Inspect the build log for this host; the commit will be marked skip.")
            }
            Self::BootTimeout { .. } | Self::WrongKernelBooted { .. } => Some(
                "The host likely fell back to its protected kernel. Check console logs; \
                 if a power controller is configured recovery was already attempted.",
            ),
            Self::HostUnreachableAtMark { .. } => Some(
                "Manually power-cycle or reboot the host, confirm it answers SSH, then re-run \
                 with --resume <session-id> to perform the deferred mark.",
            ),
            Self::CommitMissing { .. } => {
                Some("This commit does not exist in the host's checkout; it will be skipped.")
            }
            Self::InvertedRange { .. } => Some(
                "The bisect tool reports the merge base is already bad. Verify the good/bad \
                 endpoints are correct and restart the session with corrected commits.",
            ),
            Self::CommitsSwapped { .. } => Some("Swap the good and bad commit arguments and retry."),
            Self::UnrelatedBranches { .. } => {
                Some("Choose good/bad commits that share ancestry on the same branch.")
            }
            Self::InvalidSha { .. } => {
                Some("Provide a full 40-character hexadecimal commit sha.")
            }
            Self::CommitUnresolvable { .. } => {
                Some("Confirm the commit exists and the host's kernel-path repository is intact.")
            }
            Self::GoodEqualsBad { .. } => {
                Some("Choose two distinct commits for good and bad.")
            }
            Self::StuckOnSameCommit { .. } => Some(
                "The bisect tool is not advancing. Inspect its internal state on the designated \
                 host; this session cannot continue automatically.",
            ),
            Self::SafetyCapExceeded { .. } => Some(
                "The iteration cap was reached without the bisect tool declaring completion. \
                 Investigate for a bisection-tool bug before restarting.",
            ),
            Self::PowerControllerUnavailable { .. } => Some(
                "No automatic recovery is configured for this host. Power-cycle it manually, \
                 then resume the session.",
            ),
            Self::MetadataCollection { .. } => {
                Some("Non-fatal; metadata collection will be retried on the next iteration.")
            }
            Self::NoSessionToResume => {
                Some("Start a new session with --good/--bad instead of --resume.")
            }
            Self::Config { .. } | Self::ConfigNotFound { .. } => {
                Some("Check the configuration file path and YAML syntax.")
            }
            Self::Store(_) | Self::Io(_) => None,
        }
    }

    /// True when the failure is expected to resolve itself without operator
    /// action — used only to decide log level, never to suppress a halt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransportTimeout { .. } | Self::Transport { .. })
    }

    /// Whether this error requires the session to halt (awaiting a deferred
    /// mark) rather than simply marking the current iteration `skip`.
    pub fn is_halting(&self) -> bool {
        matches!(
            self,
            Self::HostUnreachableAtMark { .. }
                | Self::PowerControllerUnavailable { .. }
                | Self::BootTimeout { .. }
                | Self::StuckOnSameCommit { .. }
                | Self::SafetyCapExceeded { .. }
        )
    }

    /// Render the banner/cause/remediation/session-id/banner block mandated
    /// for halts and failures; this text is also persisted on `Session.error`.
    pub fn diagnostic_banner(&self, session_id: &str) -> String {
        let banner = "=".repeat(72);
        let mut out = format!("{banner}\nBISECTION HALTED\n{banner}\n\ncause: {self}\n");
        if let Some(suggestion) = self.recovery_suggestion() {
            out.push_str(&format!("\nremediation: {suggestion}\n"));
        }
        out.push_str(&format!("\nsession: {session_id}\n{banner}\n"));
        out
    }
}
