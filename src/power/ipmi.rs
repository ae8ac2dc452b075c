//! Out-of-band (IPMI) power control via the `ipmitool` CLI.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{error, warn};

use super::{BootDevice, HealthCheck, PowerControllerImpl, PowerState};

pub struct IpmiController {
    bmc_address: String,
    username: String,
    password: String,
    tool_path: String,
}

impl IpmiController {
    pub fn new(bmc_address: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            bmc_address: bmc_address.into(),
            username: username.into(),
            password: password.into(),
            tool_path: "ipmitool".to_string(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<(i32, String, String), String> {
        let mut full_args = vec![
            "-I".to_string(),
            "lanplus".to_string(),
            "-H".to_string(),
            self.bmc_address.clone(),
            "-U".to_string(),
            self.username.clone(),
            "-P".to_string(),
            self.password.clone(),
        ];
        full_args.extend(args.iter().map(|a| a.to_string()));

        let output = Command::new(&self.tool_path)
            .args(&full_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| e.to_string())?;

        Ok((
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }
}

#[async_trait]
impl PowerControllerImpl for IpmiController {
    async fn status(&self) -> PowerState {
        match self.run(&["chassis", "power", "status"]).await {
            Ok((0, stdout, _)) if stdout.contains("is on") => PowerState::On,
            Ok((0, stdout, _)) if stdout.contains("is off") => PowerState::Off,
            _ => PowerState::Unknown,
        }
    }

    async fn power_on(&self) -> bool {
        matches!(self.run(&["chassis", "power", "on"]).await, Ok((0, _, _)))
    }

    async fn power_off(&self, force: bool) -> bool {
        let action = if force { "off" } else { "soft" };
        matches!(
            self.run(&["chassis", "power", action]).await,
            Ok((0, _, _))
        )
    }

    async fn power_cycle(&self, wait_secs: u64) -> bool {
        if !self.power_off(true).await {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_secs(wait_secs)).await;
        self.power_on().await
    }

    async fn reset_command(&self) -> bool {
        matches!(self.run(&["chassis", "power", "reset"]).await, Ok((0, _, _)))
    }

    async fn set_boot_device(&self, device: BootDevice, persistent: bool) -> bool {
        let device_arg = match device {
            BootDevice::None => return false,
            BootDevice::Pxe => "pxe",
            BootDevice::Disk => "disk",
            BootDevice::Cdrom => "cdrom",
            BootDevice::Bios => "bios",
        };
        let mut args = vec!["chassis", "bootdev", device_arg];
        if persistent {
            args.push("options=persistent");
        }
        matches!(self.run(&args).await, Ok((0, _, _)))
    }

    async fn get_boot_device(&self) -> Option<String> {
        match self.run(&["chassis", "bootparam", "get", "5"]).await {
            Ok((0, stdout, _)) => Some(stdout.trim().to_string()),
            Ok((_, _, stderr)) => {
                warn!(stderr, "ipmitool bootparam query failed");
                None
            }
            Err(e) => {
                error!(error = %e, "ipmitool bootparam query errored");
                None
            }
        }
    }

    async fn health_check(&self) -> HealthCheck {
        match self.run(&["chassis", "power", "status"]).await {
            Ok((0, stdout, _)) => HealthCheck {
                healthy: true,
                tool_path: Some(self.tool_path.clone()),
                power_status: Some(if stdout.contains("is on") {
                    PowerState::On
                } else if stdout.contains("is off") {
                    PowerState::Off
                } else {
                    PowerState::Unknown
                }),
                error: None,
            },
            Ok((_, _, stderr)) => HealthCheck {
                healthy: false,
                tool_path: Some(self.tool_path.clone()),
                power_status: None,
                error: Some(stderr),
            },
            Err(e) => HealthCheck {
                healthy: false,
                tool_path: Some(self.tool_path.clone()),
                power_status: None,
                error: Some(e),
            },
        }
    }
}
