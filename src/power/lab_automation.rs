//! Lab-automation CLI power control, grounded on a Beaker-style
//! `<tool> system-power --action <action> --force --clear-netboot <host>`
//! front-end. Does not support querying power status — `status()` always
//! returns `Unknown`, which is acceptable and documented.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{error, warn};

use super::{BootDevice, HealthCheck, PowerControllerImpl, PowerState};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct LabAutomationController {
    hostname: String,
    tool_path: String,
}

impl LabAutomationController {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            tool_path: "bkr".to_string(),
        }
    }

    async fn run_action(&self, action: &str) -> Result<(i32, String, String), String> {
        let fut = Command::new(&self.tool_path)
            .arg("system-power")
            .arg("--action")
            .arg(action)
            .arg("--force")
            .arg("--clear-netboot")
            .arg(&self.hostname)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        match tokio::time::timeout(DEFAULT_TIMEOUT, fut).await {
            Ok(Ok(output)) => Ok((
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stdout).into_owned(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            )),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("lab-automation command timed out after {:?}", DEFAULT_TIMEOUT)),
        }
    }
}

#[async_trait]
impl PowerControllerImpl for LabAutomationController {
    async fn status(&self) -> PowerState {
        PowerState::Unknown
    }

    async fn power_on(&self) -> bool {
        matches!(self.run_action("on").await, Ok((0, _, _)))
    }

    async fn power_off(&self, _force: bool) -> bool {
        matches!(self.run_action("off").await, Ok((0, _, _)))
    }

    async fn power_cycle(&self, wait_secs: u64) -> bool {
        if !self.power_off(true).await {
            return false;
        }
        tokio::time::sleep(Duration::from_secs(wait_secs)).await;
        self.power_on().await
    }

    async fn reset_command(&self) -> bool {
        matches!(self.run_action("reboot").await, Ok((0, _, _)))
    }

    async fn set_boot_device(&self, _device: BootDevice, _persistent: bool) -> bool {
        // Beaker-style lab automation has no boot-device override; refusal
        // is the honest response, not an error.
        false
    }

    async fn get_boot_device(&self) -> Option<String> {
        None
    }

    async fn health_check(&self) -> HealthCheck {
        // Beaker has no power-status query; health here only confirms the
        // `bkr` client is installed and runnable (credentials are Kerberos
        // tickets managed outside this process).
        let fut = Command::new(&self.tool_path).arg("--version").output();
        match tokio::time::timeout(DEFAULT_TIMEOUT, fut).await {
            Ok(Ok(output)) if output.status.success() => HealthCheck {
                healthy: true,
                tool_path: Some(self.tool_path.clone()),
                power_status: Some(PowerState::Unknown),
                error: None,
            },
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                warn!(stderr, "bkr client unhealthy");
                HealthCheck {
                    healthy: false,
                    tool_path: Some(self.tool_path.clone()),
                    power_status: None,
                    error: Some(stderr),
                }
            }
            Ok(Err(_)) | Err(_) => {
                let message = "bkr client not found or unresponsive".to_string();
                error!(tool = %self.tool_path, "{}", message);
                HealthCheck {
                    healthy: false,
                    tool_path: Some(self.tool_path.clone()),
                    power_status: None,
                    error: Some(message),
                }
            }
        }
    }
}
