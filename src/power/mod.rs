//! Power control abstraction: the only way to recover a wedged host.
//!
//! Realized as an enum over concrete backends rather than the source's
//! inheritance hierarchy — `None` is the honest representation of "no
//! automatic recovery" and is checked explicitly at the one site that needs
//! it (phase 2's reboot step).

mod ipmi;
mod lab_automation;

pub use ipmi::IpmiController;
pub use lab_automation::LabAutomationController;

use async_trait::async_trait;
use std::time::Duration;

use crate::remote::RemoteChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDevice {
    None,
    Pxe,
    Disk,
    Cdrom,
    Bios,
}

#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub healthy: bool,
    pub tool_path: Option<String>,
    pub power_status: Option<PowerState>,
    pub error: Option<String>,
}

/// Shutdown-confirm deadline used by the default `reset` implementation: how
/// long to poll the liveness probe before giving up on a confirmed shutdown.
const RESET_CONFIRM_DEADLINE: Duration = Duration::from_secs(120);
const RESET_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[async_trait]
pub trait PowerControllerImpl: Send + Sync {
    async fn status(&self) -> PowerState;
    async fn power_on(&self) -> bool;
    async fn power_off(&self, force: bool) -> bool;
    async fn power_cycle(&self, wait_secs: u64) -> bool;
    /// Send the underlying reset command only — liveness confirmation is
    /// layered on top by [`PowerController::reset`].
    async fn reset_command(&self) -> bool;
    async fn set_boot_device(&self, device: BootDevice, persistent: bool) -> bool;
    async fn get_boot_device(&self) -> Option<String>;
    async fn health_check(&self) -> HealthCheck;
}

/// Polymorphic over variants {out-of-band-management, lab-automation, none}.
/// `None` makes every mutating operation return `false` — the orchestrator
/// treats this as a hard constraint: on boot failure with `None`, the
/// iteration halts the session.
///
/// `Custom` wraps any `PowerControllerImpl`, letting integration tests and
/// future backends plug in without widening the enum's match arms beyond
/// `status`/`power_on`/etc. dispatch.
pub enum PowerController {
    Ipmi(IpmiController),
    LabAutomation(LabAutomationController),
    Custom(Box<dyn PowerControllerImpl>),
    None,
}

impl PowerController {
    pub async fn status(&self) -> PowerState {
        match self {
            Self::Ipmi(c) => c.status().await,
            Self::LabAutomation(c) => c.status().await,
            Self::Custom(c) => c.status().await,
            Self::None => PowerState::Unknown,
        }
    }

    pub async fn power_on(&self) -> bool {
        match self {
            Self::Ipmi(c) => c.power_on().await,
            Self::LabAutomation(c) => c.power_on().await,
            Self::Custom(c) => c.power_on().await,
            Self::None => false,
        }
    }

    pub async fn power_off(&self, force: bool) -> bool {
        match self {
            Self::Ipmi(c) => c.power_off(force).await,
            Self::LabAutomation(c) => c.power_off(force).await,
            Self::Custom(c) => c.power_off(force).await,
            Self::None => false,
        }
    }

    pub async fn power_cycle(&self, wait_secs: u64) -> bool {
        match self {
            Self::Ipmi(c) => c.power_cycle(wait_secs).await,
            Self::LabAutomation(c) => c.power_cycle(wait_secs).await,
            Self::Custom(c) => c.power_cycle(wait_secs).await,
            Self::None => false,
        }
    }

    pub async fn set_boot_device(&self, device: BootDevice, persistent: bool) -> bool {
        match self {
            Self::Ipmi(c) => c.set_boot_device(device, persistent).await,
            Self::LabAutomation(c) => c.set_boot_device(device, persistent).await,
            Self::Custom(c) => c.set_boot_device(device, persistent).await,
            Self::None => false,
        }
    }

    pub async fn get_boot_device(&self) -> Option<String> {
        match self {
            Self::Ipmi(c) => c.get_boot_device().await,
            Self::LabAutomation(c) => c.get_boot_device().await,
            Self::Custom(c) => c.get_boot_device().await,
            Self::None => None,
        }
    }

    pub async fn health_check(&self) -> HealthCheck {
        match self {
            Self::Ipmi(c) => c.health_check().await,
            Self::LabAutomation(c) => c.health_check().await,
            Self::Custom(c) => c.health_check().await,
            Self::None => HealthCheck {
                healthy: true,
                tool_path: None,
                power_status: Some(PowerState::Unknown),
                error: None,
            },
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Send reset; if a liveness probe is supplied, poll it until the host
    /// reports unreachable (confirming shutdown) or the 120-second
    /// shutdown-confirm deadline elapses. Returns true only on confirmed
    /// shutdown when a probe is given; otherwise returns the raw reset
    /// command's result.
    pub async fn reset(&self, liveness_probe: Option<&dyn RemoteChannel>) -> bool {
        let sent = match self {
            Self::Ipmi(c) => c.reset_command().await,
            Self::LabAutomation(c) => c.reset_command().await,
            Self::Custom(c) => c.reset_command().await,
            Self::None => return false,
        };
        if !sent {
            return false;
        }

        let Some(probe) = liveness_probe else {
            return true;
        };

        let deadline = tokio::time::Instant::now() + RESET_CONFIRM_DEADLINE;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            if !probe.is_alive().await {
                return true;
            }
            tokio::time::sleep(RESET_POLL_INTERVAL).await;
        }
    }
}
