//! Bisection Driver: treats `git bisect` as an external process run on one
//! designated host (the first host of the session — all hosts share the
//! same source tree, but only the designated host keeps bisect state).
//! Never issue bisect commands to a non-designated host; they will diverge.

use regex::Regex;
use tracing::{debug, error, info};

use crate::error::{CoreError, CoreResult};
use crate::remote::RemoteChannel;
use crate::shell_safety::escape_for_ssh;
use crate::store::Verdict;

const COMMIT_HASH_LENGTH: usize = 40;

fn is_valid_sha(sha: &str) -> bool {
    sha.len() == COMMIT_HASH_LENGTH && sha.chars().all(|c| c.is_ascii_hexdigit())
}

pub struct Driver<'a> {
    channel: &'a dyn RemoteChannel,
    designated_host: String,
    kernel_path: String,
    connect_timeout_secs: u64,
    good: String,
    bad: String,
}

impl<'a> Driver<'a> {
    pub fn new(
        channel: &'a dyn RemoteChannel,
        designated_host: impl Into<String>,
        kernel_path: impl Into<String>,
        connect_timeout_secs: u64,
        good: impl Into<String>,
        bad: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            designated_host: designated_host.into(),
            kernel_path: kernel_path.into(),
            connect_timeout_secs,
            good: good.into(),
            bad: bad.into(),
        }
    }

    async fn run_in_repo(&self, command: &str) -> crate::remote::CommandOutput {
        let full = format!("cd {} && {}", escape_for_ssh(&self.kernel_path), command);
        self.channel.run(&full, self.connect_timeout_secs).await
    }

    /// Resolve both endpoints to full SHAs, distinguishing "directory
    /// missing" from "commit missing" by inspecting stderr; fail if
    /// good == bad; then check ancestry, detecting a swapped-endpoints
    /// operator error versus genuinely unrelated branches.
    pub async fn validate(&self, good: &str, bad: &str) -> CoreResult<()> {
        let good_full = self.resolve_commit("good", good).await?;
        let bad_full = self.resolve_commit("bad", bad).await?;

        if good_full == bad_full {
            return Err(CoreError::GoodEqualsBad {
                sha: good_full.clone(),
            });
        }

        let forward = self
            .run_in_repo(&format!(
                "git merge-base --is-ancestor {} {}",
                escape_for_ssh(&good_full),
                escape_for_ssh(&bad_full)
            ))
            .await;
        if forward.ok() {
            debug!("commit validation passed: good is ancestor of bad");
            return Ok(());
        }

        let reverse = self
            .run_in_repo(&format!(
                "git merge-base --is-ancestor {} {}",
                escape_for_ssh(&bad_full),
                escape_for_ssh(&good_full)
            ))
            .await;
        if reverse.ok() {
            return Err(CoreError::CommitsSwapped {
                good: good.to_string(),
                bad: bad.to_string(),
            });
        }

        Err(CoreError::UnrelatedBranches {
            good: good.to_string(),
            bad: bad.to_string(),
        })
    }

    async fn resolve_commit(&self, which: &'static str, sha: &str) -> CoreResult<String> {
        let output = self
            .run_in_repo(&format!(
                "git rev-parse --verify {}^{{commit}}",
                escape_for_ssh(sha)
            ))
            .await;

        if output.ok() {
            return Ok(output.stdout.trim().to_string());
        }

        let directory_missing = output.stderr.contains("No such file or directory")
            && (output.stderr.contains("cd:") || output.stderr.contains(&self.kernel_path));
        if directory_missing {
            return Err(CoreError::CommitUnresolvable {
                which,
                sha: sha.to_string(),
                host: self.designated_host.clone(),
                message: format!("kernel directory does not exist: {}", self.kernel_path),
            });
        }

        Err(CoreError::CommitUnresolvable {
            which,
            sha: sha.to_string(),
            host: self.designated_host.clone(),
            message: output.stderr.trim().to_string(),
        })
    }

    /// Runs `bisect reset` (ignoring failure) then `bisect start bad good`.
    pub async fn initialize(&self, good: &str, bad: &str) -> CoreResult<()> {
        let _ = self.run_in_repo("git bisect reset").await;
        let output = self
            .run_in_repo(&format!(
                "git bisect start {} {}",
                escape_for_ssh(bad),
                escape_for_ssh(good)
            ))
            .await;
        if !output.ok() {
            return Err(CoreError::Config {
                message: format!("git bisect start failed: {}", output.stderr),
            });
        }
        Ok(())
    }

    /// Returns the commit currently checked out by bisect (the current
    /// HEAD). Rejects anything that is not exactly 40 hex characters.
    pub async fn next_commit(&self) -> CoreResult<Option<String>> {
        let output = self.run_in_repo("git rev-parse HEAD").await;
        if !output.ok() {
            error!(stderr = %output.stderr, "failed to get current commit");
            return Ok(None);
        }

        let commit = output.stdout.trim().to_string();
        if !is_valid_sha(&commit) {
            return Err(CoreError::InvalidSha { sha: commit });
        }
        Ok(Some(commit))
    }

    /// Maps `verdict` to the corresponding bisect command. Returns
    /// `completed = true` when the tool declares a first-bad-commit. On the
    /// stderr fragment pair indicating "merge base is bad," returns the
    /// inverted-range error and the caller must abort the session.
    pub async fn mark(&self, commit_sha: &str, verdict: Verdict) -> CoreResult<bool> {
        let bisect_cmd = match verdict {
            Verdict::Good => "git bisect good",
            Verdict::Bad => "git bisect bad",
            Verdict::Skip => "git bisect skip",
        };

        let output = self.run_in_repo(bisect_cmd).await;

        if !output.ok() {
            if output.stderr.contains("merge base") && output.stderr.contains("is bad") {
                error!(stderr = %output.stderr, "bisect range error detected");
                return Err(CoreError::InvertedRange {
                    good: self.good.clone(),
                    bad: self.bad.clone(),
                });
            }
            return Err(CoreError::Config {
                message: format!("failed to mark commit: {}", output.stderr),
            });
        }

        let completed =
            output.stdout.contains("first bad commit") || output.stderr.contains("first bad commit");
        info!(commit = %commit_sha, verdict = ?verdict, completed, "marked commit");
        Ok(completed)
    }

    /// Extracts the first-bad-commit sha from `git bisect log` output via a
    /// regex scan, equivalent to
    /// `bisect log | grep 'first bad commit' -A 1 | ... awk '{print $2}'`
    /// but over content already in process memory.
    pub async fn extract_first_bad_commit(&self) -> CoreResult<Option<String>> {
        let output = self.run_in_repo("git bisect log").await;
        if !output.ok() {
            return Ok(None);
        }
        Ok(Self::parse_first_bad_commit(&output.stdout))
    }

    fn parse_first_bad_commit(bisect_log: &str) -> Option<String> {
        let re = Regex::new(r"(?m)^# first bad commit: \[([0-9a-f]{40})\]").unwrap();
        re.captures(bisect_log)
            .map(|caps| caps[1].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_hex_sha() {
        assert!(!is_valid_sha("not-a-sha"));
    }

    #[test]
    fn rejects_wrong_length_sha() {
        assert!(!is_valid_sha(&"a".repeat(39)));
        assert!(!is_valid_sha(&"a".repeat(41)));
    }

    #[test]
    fn accepts_valid_40_char_hex_sha() {
        assert!(is_valid_sha(&"a1b2c3d4e5".repeat(4)));
    }

    #[test]
    fn parses_first_bad_commit_from_bisect_log() {
        let log = "git bisect start\n\
                    # bad: [bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb] bad commit\n\
                    # good: [aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa] good commit\n\
                    # first bad commit: [cccccccccccccccccccccccccccccccccccccccc] regression\n";
        let sha = Driver::parse_first_bad_commit(log);
        assert_eq!(sha.as_deref(), Some("cccccccccccccccccccccccccccccccccccccccc"));
    }

    #[test]
    fn no_match_when_bisection_incomplete() {
        let log = "git bisect start\n# bad: [bbb] bad commit\n";
        assert_eq!(Driver::parse_first_bad_commit(log), None);
    }
}
