//! `kbisectd` — thin CLI entrypoint. Parses arguments, loads configuration,
//! opens the state store, wires one `HostManager` per configured host, then
//! drives a `SessionLoop::start` or `::resume`. All orchestration logic lives
//! in the library; this binary only assembles dependencies and maps outcomes
//! to the three documented exit codes.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use kbisect_rs::config::{Config, HostSpec, PowerControlType};
use kbisect_rs::host::{HostManager, HostTimeouts};
use kbisect_rs::power::{IpmiController, LabAutomationController, PowerController};
use kbisect_rs::provisioner::{self, ProvisionTarget};
use kbisect_rs::remote::SshChannel;
use kbisect_rs::store::{Host as HostRecord, StateStore};
use kbisect_rs::{diagnostics, CoreResult, SessionLoop};

#[derive(Parser, Debug)]
#[command(name = "kbisectd", about = "Multi-host kernel bisection orchestrator")]
struct Args {
    /// Path to the YAML configuration document.
    #[arg(long)]
    config: String,

    /// Starting good commit sha. Required unless --resume is given.
    #[arg(long)]
    good: Option<String>,

    /// Starting bad commit sha. Required unless --resume is given.
    #[arg(long)]
    bad: Option<String>,

    /// Resume the most recently halted session instead of starting a new one.
    #[arg(long)]
    resume: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tokio::select! {
        result = run() => match result {
            Ok(()) => ExitCode::from(0),
            Err(err) => {
                eprintln!("{err}");
                ExitCode::from(1)
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            ExitCode::from(130)
        }
    }
}

async fn run() -> CoreResult<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;

    let state_path = std::path::Path::new(&config.state_dir).join(&config.database_path);
    let store = StateStore::open(state_path).map_err(kbisect_rs::CoreError::from)?.shared();
    let store_handle = store.clone();

    if let Some(source) = config.kernel_repo.source.clone() {
        provision_hosts(&config, &source).await?;
    }

    let hosts = build_host_managers(&config);
    let session_loop = SessionLoop::new(store).with_metadata_config(config.metadata.clone());

    let test_type = match config.test.r#type {
        kbisect_rs::config::TestType::Boot => "boot",
        kbisect_rs::config::TestType::Custom => "custom",
    };
    let kernel_config_path = config.kernel_config.config_file.as_deref();

    let session_id = if args.resume {
        session_loop.resume(&hosts, test_type, kernel_config_path).await?
    } else {
        let good = args.good.ok_or_else(|| kbisect_rs::CoreError::Config {
            message: "--good is required unless --resume is given".to_string(),
        })?;
        let bad = args.bad.ok_or_else(|| kbisect_rs::CoreError::Config {
            message: "--bad is required unless --resume is given".to_string(),
        })?;
        let config_blob = serde_yaml::to_string(&config)
            .map(|s| s.into_bytes())
            .unwrap_or_default();
        session_loop
            .start(&hosts, &good, &bad, test_type, kernel_config_path, config_blob)
            .await?
    };

    if let Some(session) = store_handle.get_session(&session_id).map_err(kbisect_rs::CoreError::from)? {
        let iteration_count = store_handle
            .list_session_iterations(&session_id)
            .map_err(kbisect_rs::CoreError::from)?
            .len() as u32;
        println!("{}", diagnostics::render_completion_report(&session, iteration_count));
    }

    Ok(())
}

async fn provision_hosts(config: &Config, source: &str) -> CoreResult<()> {
    let provisioner = provisioner::Provisioner::new(source.to_string(), config.kernel_repo.branch.clone());

    let channels: Vec<SshChannel> = config
        .hosts
        .iter()
        .map(|h| {
            let user = h.ssh_user.clone().unwrap_or_else(|| "root".to_string());
            SshChannel::new(h.hostname.clone(), user, config.timeouts.ssh_connect)
        })
        .collect();

    let targets: Vec<ProvisionTarget<'_>> = config
        .hosts
        .iter()
        .zip(channels.iter())
        .map(|(spec, channel)| ProvisionTarget {
            hostname: &spec.hostname,
            ssh_user: spec.ssh_user.as_deref().unwrap_or("root"),
            kernel_path: spec.kernel_path.as_deref().unwrap_or("/root/linux"),
            channel,
            connect_timeout_secs: config.timeouts.ssh_connect,
        })
        .collect();

    let failures = provisioner.provision(&targets).await?;
    for (hostname, message) in &failures {
        tracing::warn!(hostname = %hostname, message = %message, "host provisioning failed");
    }

    for (spec, channel) in config.hosts.iter().zip(channels.iter()) {
        provisioner::install_build_deps(channel, &spec.hostname, config.timeouts.ssh_connect).await;
    }

    Ok(())
}

fn build_host_managers(config: &Config) -> Vec<HostManager> {
    config
        .hosts
        .iter()
        .map(|spec| build_host_manager(config, spec))
        .collect()
}

fn build_host_manager(config: &Config, spec: &HostSpec) -> HostManager {
    let user = spec.ssh_user.clone().unwrap_or_else(|| "root".to_string());
    let channel = Box::new(SshChannel::new(spec.hostname.clone(), user.clone(), config.timeouts.ssh_connect));

    let power = match spec.power_control_type {
        Some(PowerControlType::Ipmi) => {
            let bmc = spec.power_credentials.get("bmc_address").cloned().unwrap_or_default();
            let ipmi_user = spec.power_credentials.get("username").cloned().unwrap_or_default();
            let password = spec.power_credentials.get("password").cloned().unwrap_or_default();
            PowerController::Ipmi(IpmiController::new(bmc, ipmi_user, password))
        }
        Some(PowerControlType::Beaker) => {
            PowerController::LabAutomation(LabAutomationController::new(spec.hostname.clone()))
        }
        None => PowerController::None,
    };

    let record = HostRecord {
        id: uuid::Uuid::new_v4().to_string(),
        session_id: String::new(),
        hostname: spec.hostname.clone(),
        ssh_user: user,
        kernel_path: spec.kernel_path.clone().unwrap_or_else(|| "/root/linux".to_string()),
        bisect_path: spec.bisect_path.clone().unwrap_or_else(|| "/root/linux".to_string()),
        test_script: spec.test_script.clone(),
        power_control_type: spec.power_control_type.map(|t| match t {
            PowerControlType::Ipmi => "ipmi".to_string(),
            PowerControlType::Beaker => "beaker".to_string(),
        }),
        power_credentials: spec.power_credentials.clone(),
    };

    let timeouts = HostTimeouts {
        build_secs: config.timeouts.build,
        boot_secs: config.timeouts.boot,
        test_secs: config.timeouts.test,
        connect_secs: config.timeouts.ssh_connect,
    };

    HostManager::new(record, channel, power, timeouts)
}
