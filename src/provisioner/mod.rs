//! Repository Provisioner: a one-shot subsystem invoked at session init, only
//! when the configuration names a kernel-repository source. Clones or copies
//! the tree once into a staging directory on the controller, then rsyncs it
//! out to every host and regenerates each host's git index.
//!
//! Runs entirely as controller-local subprocesses (`git`, `rsync`) plus one
//! remote command per host over the host's `RemoteChannel` — it never reuses
//! `RemoteChannel::copy_file`, since rsync of a whole tree is a different
//! operation than copying a single file.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::remote::RemoteChannel;
use crate::shell_safety::escape_for_ssh;

pub struct ProvisionTarget<'a> {
    pub hostname: &'a str,
    pub ssh_user: &'a str,
    pub kernel_path: &'a str,
    pub channel: &'a dyn RemoteChannel,
    pub connect_timeout_secs: u64,
}

pub struct Provisioner {
    source: String,
    branch: Option<String>,
}

impl Provisioner {
    pub fn new(source: impl Into<String>, branch: Option<String>) -> Self {
        Self {
            source: source.into(),
            branch,
        }
    }

    /// Clones/copies into a fresh staging directory, rsyncs to every target,
    /// then deletes the staging directory regardless of per-host outcome.
    /// Returns the per-host rsync/index-regeneration failures, if any — a
    /// partial failure does not abort provisioning for the remaining hosts.
    pub async fn provision(&self, targets: &[ProvisionTarget<'_>]) -> CoreResult<Vec<(String, String)>> {
        let staging = std::env::temp_dir().join(format!("kbisect-provision-{}", uuid::Uuid::new_v4()));
        self.stage(&staging).await?;

        let mut failures = Vec::new();
        for target in targets {
            if let Err(message) = self.deploy_to_host(&staging, target).await {
                warn!(host = target.hostname, error = %message, "provisioning failed for host");
                failures.push((target.hostname.to_string(), message));
            } else {
                info!(host = target.hostname, "kernel tree provisioned");
            }
        }

        let _ = tokio::fs::remove_dir_all(&staging).await;
        Ok(failures)
    }

    async fn stage(&self, staging: &Path) -> CoreResult<()> {
        if self.source.starts_with("http://")
            || self.source.starts_with("https://")
            || self.source.starts_with("git@")
            || self.source.starts_with("ssh://")
        {
            self.clone_into(staging).await
        } else {
            self.copy_into(staging).await
        }
    }

    async fn clone_into(&self, staging: &Path) -> CoreResult<()> {
        let output = Command::new("git")
            .arg("clone")
            .arg(&self.source)
            .arg(staging)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| CoreError::Config {
                message: format!("failed to spawn git clone: {e}"),
            })?;
        if !output.status.success() {
            return Err(CoreError::Config {
                message: format!(
                    "git clone of {} failed: {}",
                    self.source,
                    String::from_utf8_lossy(&output.stderr)
                ),
            });
        }
        self.checkout_branch(staging).await
    }

    /// Copies a local path into the staging directory, preserving symlinks
    /// and never following a dangling one (`cp -a` semantics).
    async fn copy_into(&self, staging: &Path) -> CoreResult<()> {
        let output = Command::new("cp")
            .arg("-a")
            .arg(format!("{}/.", self.source))
            .arg(staging)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| CoreError::Config {
                message: format!("failed to spawn cp: {e}"),
            })?;
        tokio::fs::create_dir_all(staging).await.ok();
        if !output.status.success() {
            return Err(CoreError::Config {
                message: format!(
                    "copy of {} failed: {}",
                    self.source,
                    String::from_utf8_lossy(&output.stderr)
                ),
            });
        }
        self.checkout_branch(staging).await
    }

    async fn checkout_branch(&self, staging: &Path) -> CoreResult<()> {
        let Some(branch) = &self.branch else {
            return Ok(());
        };
        let output = Command::new("git")
            .arg("-C")
            .arg(staging)
            .arg("checkout")
            .arg(branch)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| CoreError::Config {
                message: format!("failed to spawn git checkout: {e}"),
            })?;
        if !output.status.success() {
            return Err(CoreError::Config {
                message: format!(
                    "checkout of branch {branch} failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                ),
            });
        }
        Ok(())
    }

    async fn deploy_to_host(&self, staging: &Path, target: &ProvisionTarget<'_>) -> Result<(), String> {
        let remove = target
            .channel
            .run(
                &format!(
                    "rm -rf {} && mkdir -p {}",
                    escape_for_ssh(target.kernel_path),
                    escape_for_ssh(target.kernel_path)
                ),
                target.connect_timeout_secs,
            )
            .await;
        if !remove.ok() {
            return Err(format!("failed to recreate kernel path: {}", remove.stderr));
        }

        let destination = format!("{}@{}:{}/", target.ssh_user, target.hostname, target.kernel_path);
        let output = Command::new("rsync")
            .arg("-a")
            .arg("--delete")
            .arg("--exclude=.git/index")
            .arg("--exclude=.git/index.lock")
            .arg("-e")
            .arg(format!(
                "ssh -o StrictHostKeyChecking=no -o ConnectTimeout={}",
                target.connect_timeout_secs
            ))
            .arg(format!("{}/", staging.display()))
            .arg(&destination)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| format!("failed to spawn rsync: {e}"))?;
        if !output.status.success() {
            return Err(format!("rsync failed: {}", String::from_utf8_lossy(&output.stderr)));
        }

        let verify_git = target
            .channel
            .run(
                &format!("test -d {}/.git", escape_for_ssh(target.kernel_path)),
                target.connect_timeout_secs,
            )
            .await;
        if !verify_git.ok() {
            return Err(".git did not arrive intact".to_string());
        }

        let reset_command = format!(
            "cd {kp} && git config --global --add safe.directory {kp} && \
             rm -f .git/index* && git reset --hard HEAD && git status",
            kp = escape_for_ssh(target.kernel_path)
        );
        let reset = target.channel.run(&reset_command, target.connect_timeout_secs).await;
        if !reset.ok() {
            return Err(format!("index regeneration failed: {}", reset.stderr));
        }

        Ok(())
    }
}

/// Runs the opaque remote `install_build_deps` shell function. Failure is
/// logged but never propagated — the ensuing build attempt produces a more
/// actionable error if dependencies are actually missing.
pub async fn install_build_deps(channel: &dyn RemoteChannel, hostname: &str, timeout_secs: u64) {
    let output = channel.call("install_build_deps", &[], timeout_secs).await;
    if !output.ok() {
        warn!(
            host = hostname,
            stderr = %output.stderr,
            "install_build_deps failed; continuing, build will surface a concrete error if deps are missing"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_source_detection() {
        let p = Provisioner::new("https://example.com/linux.git", None);
        assert!(p.source.starts_with("https://"));
        let p = Provisioner::new("/local/path/linux", None);
        assert!(!p.source.starts_with("http"));
    }
}
