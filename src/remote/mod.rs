//! Remote execution channel: run commands and shell-library functions on one
//! host, stream output, copy files, check liveness.

mod channel;

pub use channel::SshChannel;

use async_trait::async_trait;

/// Outcome of any remote invocation. `(code, stdout, stderr)`.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn timeout() -> Self {
        Self {
            code: -1,
            stdout: String::new(),
            stderr: "Timeout".to_string(),
        }
    }

    pub fn transport_error(message: impl Into<String>) -> Self {
        Self {
            code: -1,
            stdout: String::new(),
            stderr: message.into(),
        }
    }

    pub fn ok(&self) -> bool {
        self.code == 0
    }
}

/// A chunk of streamed output, tagged by which stream it came from.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Stdout(String),
    Stderr(String),
}

/// Callback invoked for each chunk of streamed output, in arrival order.
pub type ChunkCallback<'a> = dyn FnMut(StreamChunk) + Send + 'a;

/// Given (hostname, user, connect-timeout), executes a shell command or a
/// named function loaded from a shell library path, returning (exit-code,
/// stdout, stderr). Every transport failure produces an unambiguous error;
/// no silent retries at this layer.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Runs `command` with an overall timeout. On transport timeout,
    /// `code = -1` and `stderr = "Timeout"`. On transport error, `code = -1`
    /// and `stderr` carries the cause.
    async fn run(&self, command: &str, timeout_secs: u64) -> CommandOutput;

    /// Sources the shell library at a well-known remote path and invokes
    /// `function_name` with `args`. Arguments are plain, unescaped strings —
    /// the implementation is the sole injection boundary and must shell-quote
    /// each one before it reaches the remote shell.
    async fn call(&self, function_name: &str, args: &[String], timeout_secs: u64) -> CommandOutput;

    /// Same as `call`, but invokes `on_chunk` with each incoming stdout/stderr
    /// chunk as the remote process runs. Chunks arrive in order.
    async fn call_streaming(
        &self,
        function_name: &str,
        args: &[String],
        timeout_secs: u64,
        on_chunk: &mut ChunkCallback<'_>,
    ) -> CommandOutput;

    /// Copies a local file to a remote path. Atomicity at the destination is
    /// not required; callers overwrite.
    async fn copy_file(&self, local_path: &str, remote_path: &str) -> bool;

    /// Liveness probe: true only if a trivial command completes within the
    /// configured connect-timeout.
    async fn is_alive(&self) -> bool;
}
