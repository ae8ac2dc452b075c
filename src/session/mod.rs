//! Session Loop: the top-level resumable loop that drives iterations until
//! termination. Guards against infinite loops (iteration cap), a bisection
//! tool that has stopped advancing (stuck detector), and implements the
//! halt/resume protocol for boot failures that cannot be recovered
//! automatically.

use chrono::Utc;
use tracing::{error, info, warn};

use crate::bisect::Driver;
use crate::config::MetadataConfig;
use crate::error::{CoreError, CoreResult};
use crate::host::HostManager;
use crate::metadata::{self, BASELINE_KINDS, PER_ITERATION_KINDS};
use crate::phase::{finalize_iteration, PhaseEngine, PhaseOutcome};
use crate::shell_safety::escape_for_ssh;
use crate::store::{SessionStatus, SharedStateStore, Verdict};

/// Hard limit on iterations: defense in depth against a bisection-tool bug
/// that never declares completion.
const MAX_ITERATIONS: u32 = 1000;

/// If `next_commit()` returns the same sha for this many consecutive
/// iterations, the session is marked failed — the tree has no more viable
/// commits but the tool hasn't declared completion.
const MAX_SAME_COMMIT: u32 = 3;

pub struct SessionLoop {
    store: SharedStateStore,
    metadata_config: MetadataConfig,
}

impl SessionLoop {
    pub fn new(store: SharedStateStore) -> Self {
        Self {
            store,
            metadata_config: MetadataConfig::default(),
        }
    }

    /// Overrides the default (collect-everything) metadata policy, e.g. with
    /// the document's `metadata:` section.
    pub fn with_metadata_config(mut self, config: MetadataConfig) -> Self {
        self.metadata_config = config;
        self
    }

    /// Starts a new session (or attaches to an already-running one, via
    /// `get_or_create_session`'s atomic semantics) and drives it to
    /// completion, failure, or halt.
    pub async fn start(
        &self,
        hosts: &[HostManager],
        good: &str,
        bad: &str,
        test_type: &str,
        kernel_config_path: Option<&str>,
        config_blob: Vec<u8>,
    ) -> CoreResult<String> {
        let designated = &hosts[0];
        let driver = Driver::new(
            designated.channel.as_ref(),
            designated.hostname(),
            designated.record.kernel_path.as_str(),
            designated.timeouts.connect_secs,
            good,
            bad,
        );

        driver.validate(good, bad).await?;

        let session_id = self.store.get_or_create_session(good, bad, config_blob)?;
        let session = self
            .store
            .get_session(&session_id)?
            .ok_or(CoreError::NoSessionToResume)?;

        if session.status == SessionStatus::Running && session.result_commit.is_none() {
            driver.initialize(good, bad).await?;
        }

        for host in hosts {
            self.store.create_host(&session_id, host.record.clone())?;
        }

        if self.metadata_config.collect_baseline {
            for host in hosts {
                metadata::collect_many(
                    &self.store,
                    host.channel.as_ref(),
                    host.hostname(),
                    &session_id,
                    None,
                    BASELINE_KINDS,
                    host.timeouts.connect_secs,
                )
                .await;
            }
        }

        self.run_loop(&session_id, hosts, &driver, test_type, kernel_config_path, 0, None)
            .await
    }

    /// Resumes a halted session: re-verifies connectivity to every host,
    /// determines the deferred verdict for the unmarked commit from the last
    /// iteration's error, performs the deferred mark, flips status back to
    /// `running`, and continues. The stuck-detector counter resets at
    /// resume.
    pub async fn resume(
        &self,
        hosts: &[HostManager],
        test_type: &str,
        kernel_config_path: Option<&str>,
    ) -> CoreResult<String> {
        let session = self
            .store
            .get_halted_session()?
            .ok_or(CoreError::NoSessionToResume)?;

        let iterations = self.store.list_session_iterations(&session.id)?;
        let pending_commit = iterations
            .iter()
            .rev()
            .find(|it| it.verdict.is_none())
            .map(|it| it.commit_sha.clone());

        for host in hosts {
            if !host.channel.is_alive().await {
                return Err(CoreError::HostUnreachableAtMark {
                    host: host.hostname().to_string(),
                    commit: pending_commit.clone().unwrap_or_default(),
                });
            }
        }

        let designated = &hosts[0];
        let driver = Driver::new(
            designated.channel.as_ref(),
            designated.hostname(),
            designated.record.kernel_path.as_str(),
            designated.timeouts.connect_secs,
            session.good_commit.as_str(),
            session.bad_commit.as_str(),
        );

        if let Some(last) = iterations.iter().rev().find(|it| it.verdict.is_none()) {
            // Boot-test policy under `test.type = boot` maps an unresolved
            // boot failure to `bad`; a custom test's undecidable failure
            // maps to `skip`.
            let deferred_verdict = if test_type == "boot" { Verdict::Bad } else { Verdict::Skip };
            let completed = driver.mark(&last.commit_sha, deferred_verdict).await?;
            finalize_iteration(&self.store, last, deferred_verdict, last.error.clone())?;
            if completed {
                self.complete_session(&session.id, &driver).await?;
                return Ok(session.id.clone());
            }
        }

        self.store.update_session(
            &session.id,
            Some(SessionStatus::Running),
            None,
            None,
            None,
            None,
        )?;

        self.run_loop(&session.id, hosts, &driver, test_type, kernel_config_path, 0, None)
            .await
    }

    async fn run_loop(
        &self,
        session_id: &str,
        hosts: &[HostManager],
        driver: &Driver<'_>,
        test_type: &str,
        kernel_config_path: Option<&str>,
        mut iteration_count: u32,
        mut stuck_state: Option<(String, u32)>,
    ) -> CoreResult<String> {
        let phase_engine = PhaseEngine::new(&self.store);

        loop {
            iteration_count += 1;
            if iteration_count > MAX_ITERATIONS {
                error!(session_id, MAX_ITERATIONS, "safety cap exceeded");
                self.fail_session(session_id, &CoreError::SafetyCapExceeded { max: MAX_ITERATIONS })?;
                return Err(CoreError::SafetyCapExceeded { max: MAX_ITERATIONS });
            }

            let Some(commit) = driver.next_commit().await? else {
                info!(session_id, "no more commits to test — bisection complete");
                self.complete_session(session_id, driver).await?;
                return Ok(session_id.to_string());
            };

            stuck_state = match stuck_state {
                Some((ref previous, count)) if *previous == commit => {
                    let count = count + 1;
                    warn!(session_id, %commit, count, MAX_SAME_COMMIT, "stuck detector: same commit again");
                    if count >= MAX_SAME_COMMIT {
                        let err = CoreError::StuckOnSameCommit { sha: commit.clone(), count };
                        self.fail_session(session_id, &err)?;
                        return Err(err);
                    }
                    Some((commit.clone(), count))
                }
                _ => Some((commit.clone(), 0)),
            };

            let message = self.commit_message(hosts, &commit).await;
            let iteration_id =
                self.store
                    .create_iteration(session_id, iteration_count, &commit, &message)?;

            match self
                .run_iteration(
                    session_id,
                    hosts,
                    &phase_engine,
                    driver,
                    &iteration_id,
                    &commit,
                    test_type,
                    kernel_config_path,
                )
                .await
            {
                Ok(IterationOutcome::Marked { verdict, completed }) => {
                    let iteration = self
                        .store
                        .get_iteration(session_id, iteration_count)?
                        .ok_or_else(|| CoreError::Config {
                            message: "iteration vanished after creation".to_string(),
                        })?;
                    finalize_iteration(&self.store, &iteration, verdict, None)?;
                    info!(session_id, %commit, verdict = ?verdict, "iteration marked");
                    if completed {
                        self.complete_session(session_id, driver).await?;
                        return Ok(session_id.to_string());
                    }
                }
                Err(err @ CoreError::InvertedRange { .. }) => {
                    error!(session_id, %commit, error = %err, "aborting session; range is inverted");
                    self.fail_session(session_id, &err)?;
                    return Err(err);
                }
                Err(err) if err.is_halting() => {
                    warn!(session_id, %commit, error = %err, "halting session; mark deferred");
                    self.halt_session(session_id, &err)?;
                    return Err(err);
                }
                Err(err) => {
                    self.fail_session(session_id, &err)?;
                    return Err(err);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_iteration(
        &self,
        session_id: &str,
        hosts: &[HostManager],
        phase_engine: &PhaseEngine<'_>,
        driver: &Driver<'_>,
        iteration_id: &str,
        commit: &str,
        test_type: &str,
        kernel_config_path: Option<&str>,
    ) -> CoreResult<IterationOutcome> {
        if let PhaseOutcome::Terminate(verdict) = phase_engine.validate_commit(hosts, commit).await? {
            return self.mark(driver, commit, verdict).await;
        }

        let (build_outcome, expected_kernel_version) = phase_engine
            .build(hosts, iteration_id, commit, kernel_config_path)
            .await?;
        if let PhaseOutcome::Terminate(verdict) = build_outcome {
            return self.mark(driver, commit, verdict).await;
        }

        if self.metadata_config.collect_kernel_config {
            for host in hosts {
                metadata::capture_kernel_config(
                    &self.store,
                    host.channel.as_ref(),
                    host.hostname(),
                    session_id,
                    iteration_id,
                    &host.record.kernel_path,
                    host.timeouts.connect_secs,
                )
                .await;
            }
        }

        let (reboot_outcome, boot_error) = phase_engine
            .reboot_and_verify(hosts, iteration_id, expected_kernel_version.as_deref())
            .await?;
        if let PhaseOutcome::Terminate(_) = reboot_outcome {
            // Boot-test policy: an unresolved boot failure is `bad`; a
            // custom test's undecidable failure is `skip`.
            let verdict = if test_type == "boot" { Verdict::Bad } else { Verdict::Skip };
            if let Some(message) = boot_error {
                warn!(commit, error = %message, "boot phase failed");
            }
            return self.mark(driver, commit, verdict).await;
        }

        let test_results = phase_engine.test(hosts, iteration_id, test_type).await?;
        let verdict = phase_engine.aggregate(iteration_id, test_results)?;

        if self.metadata_config.collect_per_iteration {
            for host in hosts {
                metadata::collect_many(
                    &self.store,
                    host.channel.as_ref(),
                    host.hostname(),
                    session_id,
                    Some(iteration_id),
                    PER_ITERATION_KINDS,
                    host.timeouts.connect_secs,
                )
                .await;
            }
        }

        self.mark(driver, commit, verdict).await
    }

    async fn mark(&self, driver: &Driver<'_>, commit: &str, verdict: Verdict) -> CoreResult<IterationOutcome> {
        let completed = driver.mark(commit, verdict).await?;
        Ok(IterationOutcome::Marked { verdict, completed })
    }

    async fn commit_message(&self, hosts: &[HostManager], commit: &str) -> String {
        let designated = &hosts[0];
        let command = format!(
            "cd {} && git log -1 --format=%s {}",
            escape_for_ssh(&designated.record.kernel_path),
            escape_for_ssh(commit)
        );
        let output = designated
            .channel
            .run(&command, designated.timeouts.connect_secs)
            .await;
        if output.ok() {
            output.stdout.trim().to_string()
        } else {
            String::new()
        }
    }

    async fn complete_session(&self, session_id: &str, driver: &Driver<'_>) -> CoreResult<()> {
        let result_commit = driver.extract_first_bad_commit().await?;
        self.store.update_session(
            session_id,
            Some(SessionStatus::Completed),
            Some(Some(Utc::now().timestamp())),
            Some(result_commit),
            None,
            None,
        )?;
        Ok(())
    }

    fn fail_session(&self, session_id: &str, err: &CoreError) -> CoreResult<()> {
        self.store.update_session(
            session_id,
            Some(SessionStatus::Failed),
            Some(Some(Utc::now().timestamp())),
            None,
            None,
            Some(Some(err.diagnostic_banner(session_id))),
        )?;
        Ok(())
    }

    /// Leaves the current iteration's commit unmarked — its verdict is
    /// deferred until `resume()` re-establishes connectivity and determines
    /// the verdict from `err` under the boot-test policy.
    fn halt_session(&self, session_id: &str, err: &CoreError) -> CoreResult<()> {
        self.store.update_session(
            session_id,
            Some(SessionStatus::Halted),
            None,
            None,
            None,
            Some(Some(err.diagnostic_banner(session_id))),
        )?;
        Ok(())
    }
}

enum IterationOutcome {
    Marked { verdict: Verdict, completed: bool },
}
