//! SSH-backed `RemoteChannel` implementation.
//!
//! Grounded on the shape of a plain `ssh`/`scp` subprocess client: build an
//! argv, run it with a timeout, capture stdout/stderr. The streaming variant
//! additionally tees each line to a caller-supplied callback as it arrives.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error};

use super::{ChunkCallback, CommandOutput, RemoteChannel, StreamChunk};
use crate::shell_safety::escape_for_ssh;

/// One SSH-reachable host. `connect_timeout` bounds both connection setup
/// and the `is_alive` liveness probe.
pub struct SshChannel {
    host: String,
    user: String,
    connect_timeout_secs: u64,
    library_path: String,
}

impl SshChannel {
    pub fn new(host: impl Into<String>, user: impl Into<String>, connect_timeout_secs: u64) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            connect_timeout_secs,
            library_path: "/root/kernel-bisect/lib/bisect-functions.sh".to_string(),
        }
    }

    pub fn with_library_path(mut self, path: impl Into<String>) -> Self {
        self.library_path = path.into();
        self
    }

    fn ssh_argv(&self, remote_command: &str) -> Vec<String> {
        vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            format!("{}@{}", self.user, self.host),
            remote_command.to_string(),
        ]
    }

    fn function_command(&self, function_name: &str, args: &[String]) -> String {
        let args_str = args
            .iter()
            .map(|a| escape_for_ssh(a))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "source {} && {} {}",
            escape_for_ssh(&self.library_path),
            function_name,
            args_str
        )
    }

    async fn run_blocking(&self, remote_command: &str, timeout_secs: u64) -> CommandOutput {
        let argv = self.ssh_argv(remote_command);
        let fut = Command::new("ssh")
            .args(&argv)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        match tokio::time::timeout(Duration::from_secs(timeout_secs), fut).await {
            Ok(Ok(output)) => CommandOutput {
                code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Ok(Err(e)) => {
                error!(host = %self.host, error = %e, "ssh command failed to spawn");
                CommandOutput::transport_error(e.to_string())
            }
            Err(_) => {
                error!(host = %self.host, timeout_secs, "ssh command timed out");
                CommandOutput::timeout()
            }
        }
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn run(&self, command: &str, timeout_secs: u64) -> CommandOutput {
        self.run_blocking(command, timeout_secs).await
    }

    async fn call(&self, function_name: &str, args: &[String], timeout_secs: u64) -> CommandOutput {
        let command = self.function_command(function_name, args);
        self.run_blocking(&command, timeout_secs).await
    }

    async fn call_streaming(
        &self,
        function_name: &str,
        args: &[String],
        timeout_secs: u64,
        on_chunk: &mut ChunkCallback<'_>,
    ) -> CommandOutput {
        let command = self.function_command(function_name, args);
        let argv = self.ssh_argv(&command);

        let mut child = match Command::new("ssh")
            .args(&argv)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!(host = %self.host, error = %e, "ssh streaming command failed to spawn");
                return CommandOutput::transport_error(e.to_string());
            }
        };

        let mut stdout = BufReader::new(child.stdout.take().expect("piped stdout")).lines();
        let mut stderr = BufReader::new(child.stderr.take().expect("piped stderr")).lines();

        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();
        let mut stdout_done = false;
        let mut stderr_done = false;

        let deadline = tokio::time::sleep(Duration::from_secs(timeout_secs));
        tokio::pin!(deadline);

        loop {
            if stdout_done && stderr_done {
                break;
            }
            tokio::select! {
                line = stdout.next_line(), if !stdout_done => {
                    match line {
                        Ok(Some(line)) => {
                            stdout_buf.push_str(&line);
                            stdout_buf.push('\n');
                            on_chunk(StreamChunk::Stdout(line));
                        }
                        Ok(None) => stdout_done = true,
                        Err(_) => stdout_done = true,
                    }
                }
                line = stderr.next_line(), if !stderr_done => {
                    match line {
                        Ok(Some(line)) => {
                            stderr_buf.push_str(&line);
                            stderr_buf.push('\n');
                            on_chunk(StreamChunk::Stderr(line));
                        }
                        Ok(None) => stderr_done = true,
                        Err(_) => stderr_done = true,
                    }
                }
                _ = &mut deadline => {
                    let _ = child.kill().await;
                    error!(host = %self.host, timeout_secs, "ssh streaming command timed out");
                    return CommandOutput::timeout();
                }
            }
        }

        let status = match child.wait().await {
            Ok(status) => status,
            Err(e) => {
                error!(host = %self.host, error = %e, "failed to wait on ssh child");
                return CommandOutput::transport_error(e.to_string());
            }
        };

        debug!(host = %self.host, code = ?status.code(), "streaming command finished");
        CommandOutput {
            code: status.code().unwrap_or(-1),
            stdout: stdout_buf,
            stderr: stderr_buf,
        }
    }

    async fn copy_file(&self, local_path: &str, remote_path: &str) -> bool {
        let destination = format!("{}@{}:{}", self.user, self.host, remote_path);
        let fut = Command::new("scp")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs))
            .arg(local_path)
            .arg(&destination)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();

        match tokio::time::timeout(Duration::from_secs(self.connect_timeout_secs + 30), fut).await {
            Ok(Ok(output)) => output.status.success(),
            Ok(Err(e)) => {
                error!(host = %self.host, error = %e, "scp failed");
                false
            }
            Err(_) => {
                error!(host = %self.host, "scp timed out");
                false
            }
        }
    }

    async fn is_alive(&self) -> bool {
        let result = self.run("echo alive", self.connect_timeout_secs).await;
        result.code == 0
    }
}
