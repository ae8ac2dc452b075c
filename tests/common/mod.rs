//! In-memory fakes for the session-loop scenario tests: a `RemoteChannel`
//! that simulates a shared linear commit history plus a designated host's
//! `git bisect` bookkeeping, and a `PowerControllerImpl` whose reset just
//! flips the same boot-liveness state the channel reads.
//!
//! None of this talks to a real shell, real git, or real hardware — it only
//! has to answer the exact command strings `bisect::Driver` and
//! `phase::PhaseEngine` actually send.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use kbisect_rs::power::{BootDevice, HealthCheck, PowerControllerImpl, PowerState};
use kbisect_rs::remote::{ChunkCallback, CommandOutput, RemoteChannel, StreamChunk};
use kbisect_rs::store::Verdict;

/// Deterministic 40-hex-char commit sha for a linear history of `n` commits.
pub fn sha(idx: usize) -> String {
    format!("{idx:040x}")
}

/// The kernel-release string a successful build at `idx` reports.
pub fn release_for(idx: usize) -> String {
    format!("release-{idx:04}")
}

/// What a host that fails to boot the test kernel comes back up on instead.
pub const FALLBACK_RELEASE: &str = "fallback-protected-kernel";

fn index_of(commits: &[String], candidate: &str) -> Option<usize> {
    commits.iter().position(|c| c == candidate)
}

/// Pulls the first single-quoted token out of a shell command string, e.g.
/// extracting `aaaa` from `git cat-file -t 'aaaa'`. Every argument this
/// harness's commands pass is produced by `shell_safety::escape_for_ssh`,
/// which always wraps in single quotes.
fn quoted_tokens(command: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = command.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\'' {
            let mut tok = String::new();
            for c2 in chars.by_ref() {
                if c2 == '\'' {
                    break;
                }
                tok.push(c2);
            }
            out.push(tok);
        }
    }
    out
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        code: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn fail(stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        code: 1,
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

/// Mechanical stand-in for `git bisect`: tracks the open `(good, bad)` range
/// as indices into a shared commit list, the currently checked-out
/// candidate, and skipped indices — same bookkeeping a real bisect does,
/// minus the working tree.
pub struct BisectState {
    commits: Vec<String>,
    good_idx: usize,
    bad_idx: usize,
    skipped: HashSet<usize>,
    current: Option<usize>,
    log: Vec<String>,
    done: bool,
    /// When true, `mark` never narrows the range — simulates a bisection
    /// tool that keeps handing back the same candidate.
    stuck: bool,
}

impl BisectState {
    pub fn new(commits: Vec<String>, stuck: bool) -> Self {
        let bad_idx = commits.len() - 1;
        let mut state = Self {
            commits,
            good_idx: 0,
            bad_idx,
            skipped: HashSet::new(),
            current: None,
            log: vec!["git bisect start".to_string()],
            done: false,
            stuck,
        };
        state.pick_next();
        state
    }

    fn pick_next(&mut self) {
        if self.done {
            self.current = None;
            return;
        }
        if self.good_idx + 1 >= self.bad_idx {
            self.current = Some(self.bad_idx);
            return;
        }
        let candidates: Vec<usize> = (self.good_idx + 1..self.bad_idx)
            .filter(|i| !self.skipped.contains(i))
            .collect();
        if candidates.is_empty() {
            self.current = None;
            self.done = true;
            return;
        }
        self.current = Some(candidates[candidates.len() / 2]);
    }

    fn head(&self) -> Option<String> {
        self.current.map(|i| self.commits[i].clone())
    }

    /// Marks whatever is currently checked out. Returns true when the range
    /// has collapsed to an adjacent pair (bisection complete).
    fn mark_current(&mut self, verdict: Verdict) -> bool {
        let Some(idx) = self.current else { return false };
        if self.stuck {
            self.log.push(format!("# stuck: repeated candidate {}", self.commits[idx]));
            return false;
        }
        match verdict {
            Verdict::Good => {
                if idx > self.good_idx {
                    self.good_idx = idx;
                }
            }
            Verdict::Bad => {
                if idx < self.bad_idx {
                    self.bad_idx = idx;
                }
            }
            Verdict::Skip => {
                self.skipped.insert(idx);
            }
        }
        if self.good_idx + 1 == self.bad_idx {
            self.done = true;
            self.current = None;
            self.log.push(format!(
                "# first bad commit: [{}] regression",
                self.commits[self.bad_idx]
            ));
            return true;
        }
        self.pick_next();
        false
    }

    fn log_text(&self) -> String {
        let mut text = self.log.join("\n");
        text.push('\n');
        text
    }
}

/// What happens when a host reboots after having been told to build/test a
/// given commit index.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BootBehavior {
    /// Comes back up on the kernel it was told to boot.
    Ok,
    /// Comes back up, but on its protected fallback kernel — a recoverable
    /// failure (`uname -r` mismatch).
    WrongKernel,
    /// Never answers again — unrecoverable.
    NeverComesBack,
}

struct BootSimInner {
    last_idx: usize,
    calls_since_reset: u32,
    forced_alive: bool,
}

/// Shared liveness state for one host, read by the channel's `is_alive`/
/// `uname -r` handling and reset by both a plain `reboot` command and a
/// power controller's `reset_command`.
pub struct BootSim {
    inner: Mutex<BootSimInner>,
    policy: Box<dyn Fn(usize) -> BootBehavior + Send + Sync>,
}

impl BootSim {
    pub fn new(policy: impl Fn(usize) -> BootBehavior + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BootSimInner {
                last_idx: 0,
                calls_since_reset: 0,
                forced_alive: false,
            }),
            policy: Box::new(policy),
        })
    }

    fn set_last_idx(&self, idx: usize) {
        self.inner.lock().unwrap().last_idx = idx;
    }

    fn trigger_reboot(&self) {
        self.inner.lock().unwrap().calls_since_reset = 0;
    }

    fn is_alive(&self) -> bool {
        let mut st = self.inner.lock().unwrap();
        if st.forced_alive {
            return true;
        }
        st.calls_since_reset += 1;
        if (self.policy)(st.last_idx) == BootBehavior::NeverComesBack {
            return false;
        }
        st.calls_since_reset >= 2
    }

    fn uname_release(&self) -> String {
        let st = self.inner.lock().unwrap();
        match (self.policy)(st.last_idx) {
            BootBehavior::Ok => release_for(st.last_idx),
            BootBehavior::WrongKernel => FALLBACK_RELEASE.to_string(),
            BootBehavior::NeverComesBack => release_for(st.last_idx),
        }
    }

    /// Simulates an operator manually power-cycling a wedged host — used
    /// between a halt and a `resume()` call in the halted-session scenario.
    pub fn force_alive(&self) {
        self.inner.lock().unwrap().forced_alive = true;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BuildBehavior {
    AlwaysOk,
    AlwaysFail,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TestBehavior {
    AlwaysPass,
    AlwaysFail,
}

/// One host's fake remote channel. `bisect` is `Some` only on the
/// designated (first) host; every host answers `git cat-file -t` since
/// phase 0 validates the commit on all of them.
pub struct FakeChannel {
    commits: Arc<Vec<String>>,
    bisect: Option<Arc<Mutex<BisectState>>>,
    build: BuildBehavior,
    boot: Arc<BootSim>,
    test: TestBehavior,
}

impl FakeChannel {
    pub fn new(
        commits: Arc<Vec<String>>,
        bisect: Option<Arc<Mutex<BisectState>>>,
        build: BuildBehavior,
        boot: Arc<BootSim>,
        test: TestBehavior,
    ) -> Self {
        Self {
            commits,
            bisect,
            build,
            boot,
            test,
        }
    }

    fn dispatch(&self, command: &str) -> CommandOutput {
        if command == "reboot" {
            self.boot.trigger_reboot();
            return ok("");
        }
        if command == "uname -r" {
            return ok(self.boot.uname_release());
        }
        // Every `Driver`/`PhaseEngine` command is sent as `cd '<path>' && <rest>`
        // (see `Driver::run_in_repo`), so the kernel-path is always the first
        // quoted token; skip it before reading a command's own arguments.
        let body = command.split_once(" && ").map(|(_, rest)| rest).unwrap_or(command);

        if body.contains("git bisect start") || body.contains("git bisect reset") {
            return ok("");
        }
        if body.contains("git rev-parse --verify") {
            let tokens = quoted_tokens(body);
            return match tokens.first().and_then(|t| index_of(&self.commits, t)) {
                Some(idx) => ok(self.commits[idx].clone()),
                None => fail("fatal: Needed a single revision"),
            };
        }
        if body.contains("git merge-base --is-ancestor") {
            let tokens = quoted_tokens(body);
            let (Some(a), Some(b)) = (tokens.first(), tokens.get(1)) else {
                return fail("fatal: bad revision");
            };
            return match (index_of(&self.commits, a), index_of(&self.commits, b)) {
                (Some(ia), Some(ib)) if ia <= ib => ok(""),
                _ => fail(""),
            };
        }
        if body.contains("git cat-file -t") {
            let tokens = quoted_tokens(body);
            return match tokens.first().and_then(|t| index_of(&self.commits, t)) {
                Some(_) => ok("commit"),
                None => fail("fatal: Not a valid object name"),
            };
        }
        if command.contains("git rev-parse HEAD") {
            let Some(bisect) = &self.bisect else {
                return fail("fatal: ambiguous argument 'HEAD'");
            };
            return match bisect.lock().unwrap().head() {
                Some(sha) => ok(sha),
                None => fail("fatal: ambiguous argument 'HEAD'"),
            };
        }
        if command.contains("git bisect good") {
            let completed = self.bisect.as_ref().unwrap().lock().unwrap().mark_current(Verdict::Good);
            return if completed {
                ok("Bisecting: 0 revisions left to test after this (roughly 0 steps)\nfirst bad commit")
            } else {
                ok("")
            };
        }
        if command.contains("git bisect bad") {
            let completed = self.bisect.as_ref().unwrap().lock().unwrap().mark_current(Verdict::Bad);
            return if completed {
                ok("Bisecting: 0 revisions left to test after this (roughly 0 steps)\nfirst bad commit")
            } else {
                ok("")
            };
        }
        if command.contains("git bisect skip") {
            self.bisect.as_ref().unwrap().lock().unwrap().mark_current(Verdict::Skip);
            return ok("");
        }
        if command.contains("git bisect log") {
            let text = self
                .bisect
                .as_ref()
                .map(|b| b.lock().unwrap().log_text())
                .unwrap_or_default();
            return ok(text);
        }
        if command.contains("git log -1 --format=%s") {
            return ok("a commit message");
        }
        fail(format!("unrecognized fake command: {command}"))
    }
}

#[async_trait]
impl RemoteChannel for FakeChannel {
    async fn run(&self, command: &str, _timeout_secs: u64) -> CommandOutput {
        self.dispatch(command)
    }

    async fn call(&self, function_name: &str, args: &[String], timeout_secs: u64) -> CommandOutput {
        let mut noop = |_: StreamChunk| {};
        self.call_streaming(function_name, args, timeout_secs, &mut noop).await
    }

    async fn call_streaming(
        &self,
        function_name: &str,
        args: &[String],
        _timeout_secs: u64,
        on_chunk: &mut ChunkCallback<'_>,
    ) -> CommandOutput {
        match function_name {
            "build_kernel" => {
                let commit_sha = args.first().cloned().unwrap_or_default();
                let idx = index_of(&self.commits, &commit_sha).unwrap_or(0);
                self.boot.set_last_idx(idx);
                on_chunk(StreamChunk::Stdout(format!("building {commit_sha}")));
                match self.build {
                    BuildBehavior::AlwaysOk => {
                        ok(format!("building {commit_sha}\n{}", release_for(idx)))
                    }
                    BuildBehavior::AlwaysFail => fail("make: toolchain not found"),
                }
            }
            "run_test" => {
                on_chunk(StreamChunk::Stdout("running test".to_string()));
                match self.test {
                    TestBehavior::AlwaysPass => ok("PASS"),
                    TestBehavior::AlwaysFail => fail("FAIL"),
                }
            }
            other => fail(format!("unrecognized fake function: {other}")),
        }
    }

    async fn copy_file(&self, _local_path: &str, _remote_path: &str) -> bool {
        true
    }

    async fn is_alive(&self) -> bool {
        self.boot.is_alive()
    }
}

/// Power controller whose `reset_command` just resets the same `BootSim`
/// state a plain `reboot` command would, and counts how many times it was
/// invoked so tests can assert recovery was actually attempted.
pub struct FakePower {
    boot: Arc<BootSim>,
    reset_calls: Arc<AtomicU32>,
    succeeds: bool,
}

impl FakePower {
    pub fn new(boot: Arc<BootSim>, succeeds: bool) -> (Self, Arc<AtomicU32>) {
        let reset_calls = Arc::new(AtomicU32::new(0));
        (
            Self {
                boot,
                reset_calls: reset_calls.clone(),
                succeeds,
            },
            reset_calls,
        )
    }
}

#[async_trait]
impl PowerControllerImpl for FakePower {
    async fn status(&self) -> PowerState {
        PowerState::On
    }

    async fn power_on(&self) -> bool {
        true
    }

    async fn power_off(&self, _force: bool) -> bool {
        true
    }

    async fn power_cycle(&self, _wait_secs: u64) -> bool {
        true
    }

    async fn reset_command(&self) -> bool {
        self.reset_calls.fetch_add(1, Ordering::SeqCst);
        if self.succeeds {
            self.boot.trigger_reboot();
        }
        self.succeeds
    }

    async fn set_boot_device(&self, _device: BootDevice, _persistent: bool) -> bool {
        true
    }

    async fn get_boot_device(&self) -> Option<String> {
        None
    }

    async fn health_check(&self) -> HealthCheck {
        HealthCheck {
            healthy: true,
            tool_path: None,
            power_status: Some(PowerState::On),
            error: None,
        }
    }
}
