//! Phase Engine: for one commit and one iteration, run four phases —
//! validate, build, reboot+verify, test — then aggregate. The hardest
//! component: fans every per-host step out in parallel, enforces an
//! overall-phase deadline on top of each host's own timeout, and bulk-writes
//! every outcome atomically.

use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::host::HostManager;
use crate::remote::StreamChunk;
use crate::store::{
    BootResult, BuildResult, Iteration, IterationResult, LogKind, SharedStateStore, TestResult, Verdict,
};

/// Scheduling margin applied to every configured per-phase timeout: 10% of
/// the configured value, added on top, to absorb scheduling overhead.
const PHASE_TIMEOUT_MARGIN: f64 = 1.1;

const REBOOT_SETTLE_SECS: u64 = 10;
const POST_BOOT_SETTLE_SECS: u64 = 10;
const BOOT_POLL_INTERVAL_SECS: u64 = 5;
const SSH_REBOOT_TIMEOUT_SECS: u64 = 5;
const LOG_FLUSH_THRESHOLD_BYTES: usize = 10 * 1024;

fn phase_deadline(configured_secs: u64) -> Duration {
    Duration::from_secs_f64(configured_secs as f64 * PHASE_TIMEOUT_MARGIN)
}

/// Outcome of one phase across all hosts: either the iteration should stop
/// here with the given verdict (`skip` in most cases, `bad` under boot-test
/// policy when boot fails), or the engine should proceed to the next phase.
pub enum PhaseOutcome {
    Continue,
    Terminate(Verdict),
}

/// Per-host outcome of phase 2. `Recoverable` means the host answered again
/// (possibly on its protected fallback kernel) and the iteration can simply
/// be marked; `Unrecoverable` means the host never answered and the session
/// cannot safely decide a verdict, so it must halt instead.
enum RebootOutcome {
    Ok,
    Recoverable(String),
    Unrecoverable(CoreError),
}

pub struct PhaseEngine<'a> {
    store: &'a SharedStateStore,
}

impl<'a> PhaseEngine<'a> {
    pub fn new(store: &'a SharedStateStore) -> Self {
        Self { store }
    }

    /// Phase 0 — for each host in parallel, run `git cat-file -t <sha>`. Any
    /// host where the commit is absent yields `skip` for the whole
    /// iteration.
    pub async fn validate_commit(
        &self,
        hosts: &[HostManager],
        commit_sha: &str,
    ) -> CoreResult<PhaseOutcome> {
        let span = info_span!("phase", phase = "validate", commit = commit_sha);
        async {
            let checks = hosts.iter().map(|host| {
                let command = format!(
                    "cd {} && git cat-file -t {}",
                    crate::shell_safety::escape_for_ssh(&host.record.kernel_path),
                    crate::shell_safety::escape_for_ssh(commit_sha)
                );
                async move {
                    let output = host
                        .channel
                        .run(&command, host.timeouts.connect_secs)
                        .await;
                    (host.hostname().to_string(), output.ok())
                }
            });

            let results = join_all(checks).await;
            let missing: Vec<&str> = results
                .iter()
                .filter(|(_, present)| !present)
                .map(|(hostname, _)| hostname.as_str())
                .collect();

            if !missing.is_empty() {
                warn!(?missing, "commit missing on one or more hosts");
                return Ok(PhaseOutcome::Terminate(Verdict::Skip));
            }
            Ok(PhaseOutcome::Continue)
        }
        .instrument(span)
        .await
    }

    /// Phase 1 — parallel build with streaming log capture. Returns the
    /// expected kernel-release string (the last stdout line of
    /// `build_kernel`) on success.
    pub async fn build(
        &self,
        hosts: &[HostManager],
        iteration_id: &str,
        commit_sha: &str,
        kernel_config_path: Option<&str>,
    ) -> CoreResult<(PhaseOutcome, Option<String>)> {
        let span = info_span!("phase", phase = "build", commit = commit_sha);
        async {
            let build_futs = hosts.iter().map(|host| {
                self.build_on_host(host, iteration_id, commit_sha, kernel_config_path)
            });

            let overall_timeout = hosts
                .iter()
                .map(|h| h.timeouts.build_secs)
                .max()
                .unwrap_or(0);

            let results = match tokio::time::timeout(phase_deadline(overall_timeout), join_all(build_futs)).await
            {
                Ok(results) => results,
                Err(_) => {
                    error!("build phase deadline exceeded before all hosts finished");
                    hosts
                        .iter()
                        .map(|h| {
                            (
                                h.id().to_string(),
                                Err("build phase timed out".to_string()),
                                None,
                            )
                        })
                        .collect()
                }
            };

            let mut iteration_results = Vec::with_capacity(results.len());
            let mut any_failed = false;
            let mut kernel_release = None;

            for (host_id, outcome, release) in results {
                let build_result = match &outcome {
                    Ok(_) => BuildResult::Success,
                    Err(_) => {
                        any_failed = true;
                        BuildResult::Failure
                    }
                };
                if build_result == BuildResult::Success && kernel_release.is_none() {
                    kernel_release = release;
                }
                iteration_results.push(IterationResult {
                    id: Uuid::new_v4().to_string(),
                    iteration_id: iteration_id.to_string(),
                    host_id,
                    build_result: Some(build_result),
                    boot_result: None,
                    test_result: None,
                    r#final: Verdict::Skip,
                    error: outcome.err(),
                    test_output: None,
                    timestamp: Utc::now().timestamp(),
                });
            }

            if any_failed {
                self.store.create_iteration_results_bulk(iteration_results)?;
                return Ok((PhaseOutcome::Terminate(Verdict::Skip), None));
            }

            Ok((PhaseOutcome::Continue, kernel_release))
        }
        .instrument(span)
        .await
    }

    async fn build_on_host(
        &self,
        host: &HostManager,
        iteration_id: &str,
        commit_sha: &str,
        kernel_config_path: Option<&str>,
    ) -> (String, Result<(), String>, Option<String>) {
        let hostname = host.hostname().to_string();
        let header = format!(
            "=== Build on {} ===\ncommit: {}\n\n=== BUILD OUTPUT ===\n",
            hostname, commit_sha
        );
        let log_id = match self.store.create_build_log(
            iteration_id,
            host.id(),
            LogKind::Build,
            header.as_bytes(),
        ) {
            Ok(id) => id,
            Err(e) => {
                error!(host = %hostname, error = %e, "failed to open build log");
                return (host.id().to_string(), Err(e.to_string()), None);
            }
        };

        let mut buffer: Vec<u8> = Vec::new();
        let store = self.store;
        let log_id_for_flush = log_id.clone();
        let mut on_chunk = move |chunk: StreamChunk| {
            let bytes = match &chunk {
                StreamChunk::Stdout(line) | StreamChunk::Stderr(line) => line.as_bytes(),
            };
            buffer.extend_from_slice(bytes);
            buffer.push(b'\n');
            if buffer.len() >= LOG_FLUSH_THRESHOLD_BYTES {
                if let Err(e) = store.append_build_log_chunk(&log_id_for_flush, &buffer) {
                    warn!(host = %hostname, error = %e, "failed to append build log chunk");
                }
                buffer.clear();
            }
        };

        let args = vec![
            commit_sha.to_string(),
            host.record.kernel_path.clone(),
            kernel_config_path.unwrap_or("").to_string(),
        ];
        let output = host
            .channel
            .call_streaming("build_kernel", &args, host.timeouts.build_secs, &mut on_chunk)
            .await;

        let footer = format!("\n\n=== EXIT CODE: {} ===\n", output.code);
        if let Err(e) = self.store.append_build_log_chunk(&log_id, footer.as_bytes()) {
            warn!(host = %host.hostname(), error = %e, "failed to append build log footer");
        }
        if let Err(e) = self.store.finalize_build_log(&log_id, output.code) {
            warn!(host = %host.hostname(), error = %e, "failed to finalize build log");
        }

        if output.code != 0 {
            return (
                host.id().to_string(),
                Err(format!("build failed with exit code {}", output.code)),
                None,
            );
        }

        let kernel_release = output
            .stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string());

        (host.id().to_string(), Ok(()), kernel_release)
    }

    /// Phase 2 — parallel reboot with boot verification. A boot is accepted
    /// only when the actual `uname -r` equals the expected kernel-release
    /// string from phase 1; an empty comparison on either side vacuously
    /// passes (original-source behavior, not a meaningful "wrong kernel"
    /// signal).
    pub async fn reboot_and_verify(
        &self,
        hosts: &[HostManager],
        iteration_id: &str,
        expected_kernel_version: Option<&str>,
    ) -> CoreResult<(PhaseOutcome, Option<String>)> {
        let span = info_span!("phase", phase = "reboot", iteration = iteration_id);
        async {
            let reboot_futs = hosts
                .iter()
                .map(|host| self.reboot_host(host, expected_kernel_version));

            let overall_timeout = hosts.iter().map(|h| h.timeouts.boot_secs).max().unwrap_or(0);
            let results = match tokio::time::timeout(phase_deadline(overall_timeout), join_all(reboot_futs)).await {
                Ok(results) => results,
                Err(_) => hosts
                    .iter()
                    .map(|h| {
                        (
                            h.id().to_string(),
                            RebootOutcome::Unrecoverable(CoreError::BootTimeout {
                                host: h.hostname().to_string(),
                                timeout_secs: h.timeouts.boot_secs,
                            }),
                        )
                    })
                    .collect(),
            };

            let mut iteration_results = Vec::with_capacity(results.len());
            let mut errors = Vec::new();
            let mut any_failed = false;
            let mut halting_error: Option<CoreError> = None;

            for (host_id, outcome) in results {
                let (boot_result, error_message) = match outcome {
                    RebootOutcome::Ok => (BootResult::Success, None),
                    RebootOutcome::Recoverable(message) => {
                        any_failed = true;
                        errors.push(format!("{host_id}: {message}"));
                        (BootResult::Failure, Some(message))
                    }
                    RebootOutcome::Unrecoverable(err) => {
                        any_failed = true;
                        let message = err.to_string();
                        errors.push(format!("{host_id}: {message}"));
                        if halting_error.is_none() {
                            halting_error = Some(err);
                        }
                        (BootResult::Failure, Some(message))
                    }
                };
                iteration_results.push(IterationResult {
                    id: Uuid::new_v4().to_string(),
                    iteration_id: iteration_id.to_string(),
                    host_id,
                    build_result: Some(BuildResult::Success),
                    boot_result: Some(boot_result),
                    test_result: None,
                    r#final: Verdict::Skip,
                    error: error_message,
                    test_output: None,
                    timestamp: Utc::now().timestamp(),
                });
            }

            if any_failed {
                self.store.create_iteration_results_bulk(iteration_results)?;
                if let Some(err) = halting_error {
                    warn!(error = %err, "boot failure unrecoverable; session will halt");
                    return Err(err);
                }
                let combined = errors.join("; ");
                return Ok((PhaseOutcome::Terminate(Verdict::Skip), Some(combined)));
            }

            Ok((PhaseOutcome::Continue, None))
        }
        .instrument(span)
        .await
    }

    /// Reboots one host and verifies the booted kernel. A host that never
    /// answers again (no power controller, or the controller's reset could
    /// not be confirmed) is `Unrecoverable` — the session loop halts rather
    /// than marking the commit, since the designated host's bisect state
    /// can't safely advance without knowing this host's true result. A host
    /// that comes back up but on its protected fallback kernel (the
    /// version-mismatch case) is `Recoverable` — the test kernel is known to
    /// have failed, so the iteration is simply marked accordingly.
    async fn reboot_host(
        &self,
        host: &HostManager,
        expected_kernel_version: Option<&str>,
    ) -> (String, RebootOutcome) {
        let hostname = host.hostname();
        info!(hostname, "rebooting");

        if host.power.is_none() {
            let _ = host.channel.run("reboot", SSH_REBOOT_TIMEOUT_SECS).await;
        } else if !host.power.reset(Some(host.channel.as_ref())).await {
            return (
                host.id().to_string(),
                RebootOutcome::Unrecoverable(CoreError::PowerControllerUnavailable {
                    host: hostname.to_string(),
                }),
            );
        }

        tokio::time::sleep(Duration::from_secs(REBOOT_SETTLE_SECS)).await;

        let deadline = Instant::now() + Duration::from_secs(host.timeouts.boot_secs);
        loop {
            if host.channel.is_alive().await {
                break;
            }
            if Instant::now() >= deadline {
                let err = if host.power.is_none() {
                    CoreError::PowerControllerUnavailable {
                        host: hostname.to_string(),
                    }
                } else {
                    CoreError::BootTimeout {
                        host: hostname.to_string(),
                        timeout_secs: host.timeouts.boot_secs,
                    }
                };
                return (host.id().to_string(), RebootOutcome::Unrecoverable(err));
            }
            tokio::time::sleep(Duration::from_secs(BOOT_POLL_INTERVAL_SECS)).await;
        }

        tokio::time::sleep(Duration::from_secs(POST_BOOT_SETTLE_SECS)).await;

        let uname = host.channel.run("uname -r", host.timeouts.connect_secs).await;
        if !uname.ok() {
            warn!(hostname, "could not determine booted kernel version");
            return (host.id().to_string(), RebootOutcome::Ok);
        }
        let actual = uname.stdout.trim().to_string();

        if let Some(expected) = expected_kernel_version {
            if !expected.is_empty() && !actual.is_empty() && expected != actual {
                return (
                    host.id().to_string(),
                    RebootOutcome::Recoverable(format!(
                        "wrong kernel booted: expected {expected}, got {actual}"
                    )),
                );
            }
        }

        (host.id().to_string(), RebootOutcome::Ok)
    }

    /// Phase 3 — parallel test with streaming log capture. Exit code 0 →
    /// `good`; non-zero → `bad`; a host whose result is missing when the
    /// phase deadline expires is recorded as `skip`.
    pub async fn test(
        &self,
        hosts: &[HostManager],
        iteration_id: &str,
        test_type: &str,
    ) -> CoreResult<Vec<(String, Verdict, Option<String>, Option<String>)>> {
        let span = info_span!("phase", phase = "test", iteration = iteration_id);
        async {
            let test_futs = hosts
                .iter()
                .map(|host| self.test_on_host(host, iteration_id, test_type));

            let overall_timeout = hosts.iter().map(|h| h.timeouts.test_secs).max().unwrap_or(0);
            let results = match tokio::time::timeout(phase_deadline(overall_timeout), join_all(test_futs)).await {
                Ok(results) => results,
                Err(_) => hosts
                    .iter()
                    .map(|h| (h.id().to_string(), Verdict::Skip, None, Some("test phase timed out".to_string())))
                    .collect(),
            };

            Ok(results)
        }
        .instrument(span)
        .await
    }

    async fn test_on_host(
        &self,
        host: &HostManager,
        iteration_id: &str,
        test_type: &str,
    ) -> (String, Verdict, Option<String>, Option<String>) {
        let hostname = host.hostname().to_string();
        let test_script = host.record.test_script.clone().unwrap_or_default();
        let header = format!(
            "=== Test Execution on {} ===\ntest type: {}\ntest script: {}\n\n=== TEST OUTPUT ===\n",
            hostname, test_type, test_script
        );

        let log_id = match self.store.create_build_log(
            iteration_id,
            host.id(),
            LogKind::Test,
            header.as_bytes(),
        ) {
            Ok(id) => id,
            Err(e) => {
                error!(hostname, error = %e, "failed to open test log");
                return (host.id().to_string(), Verdict::Skip, None, Some(e.to_string()));
            }
        };

        let mut buffer: Vec<u8> = Vec::new();
        let store = self.store;
        let log_id_for_flush = log_id.clone();
        let mut on_chunk = move |chunk: StreamChunk| {
            let bytes = match &chunk {
                StreamChunk::Stdout(line) | StreamChunk::Stderr(line) => line.as_bytes(),
            };
            buffer.extend_from_slice(bytes);
            buffer.push(b'\n');
            if buffer.len() >= LOG_FLUSH_THRESHOLD_BYTES {
                if let Err(e) = store.append_build_log_chunk(&log_id_for_flush, &buffer) {
                    warn!(hostname = %hostname, error = %e, "failed to append test log chunk");
                }
                buffer.clear();
            }
        };

        let args = vec![test_type.to_string(), test_script];
        let output = host
            .channel
            .call_streaming("run_test", &args, host.timeouts.test_secs, &mut on_chunk)
            .await;

        let footer = format!("\n\n=== EXIT CODE: {} ===\n", output.code);
        let _ = self.store.append_build_log_chunk(&log_id, footer.as_bytes());
        let _ = self.store.finalize_build_log(&log_id, output.code);

        let combined_output = format!("{}{}", output.stdout, output.stderr);
        let verdict = if output.code == 0 { Verdict::Good } else { Verdict::Bad };
        (host.id().to_string(), verdict, Some(combined_output), None)
    }

    /// Phase 4 — aggregation rule: all good → good; any bad → bad; else
    /// skip. A single bulk write commits every per-host result.
    pub fn aggregate(
        &self,
        iteration_id: &str,
        test_results: Vec<(String, Verdict, Option<String>, Option<String>)>,
    ) -> CoreResult<Verdict> {
        let verdict = if test_results.iter().all(|(_, v, _, _)| *v == Verdict::Good) {
            Verdict::Good
        } else if test_results.iter().any(|(_, v, _, _)| *v == Verdict::Bad) {
            Verdict::Bad
        } else {
            Verdict::Skip
        };

        let iteration_results: Vec<IterationResult> = test_results
            .into_iter()
            .map(|(host_id, v, output, error)| IterationResult {
                id: Uuid::new_v4().to_string(),
                iteration_id: iteration_id.to_string(),
                host_id,
                build_result: Some(BuildResult::Success),
                boot_result: Some(BootResult::Success),
                test_result: match v {
                    Verdict::Good => Some(TestResult::Pass),
                    Verdict::Bad => Some(TestResult::Fail),
                    Verdict::Skip => None,
                },
                r#final: v,
                error,
                test_output: output,
                timestamp: Utc::now().timestamp(),
            })
            .collect();

        self.store.create_iteration_results_bulk(iteration_results)?;
        Ok(verdict)
    }
}

/// Mark an iteration terminated with a verdict and persist timing.
pub fn finalize_iteration(
    store: &SharedStateStore,
    iteration: &Iteration,
    verdict: Verdict,
    error: Option<String>,
) -> CoreResult<()> {
    let ended_at = Utc::now().timestamp();
    let duration = (ended_at - iteration.started_at) as f64;
    store
        .update_iteration(
            &iteration.session_id,
            iteration.number,
            Some(ended_at),
            Some(duration),
            Some(verdict),
            error,
            None,
        )
        .map_err(CoreError::from)
}
