//! Metadata collection: a best-effort sidecar invoking the opaque remote
//! `collect_metadata(kind)` shell function and storing whatever JSON it
//! prints. A collector failure never aborts an iteration — warn and
//! continue, per the error-handling table's "Metadata collection error" row.

use tracing::warn;

use crate::remote::RemoteChannel;
use crate::store::SharedStateStore;

/// Baseline collection kinds, gathered once at session start when
/// `metadata.collect_baseline` is set.
pub const BASELINE_KINDS: &[&str] = &["uname", "lsmod", "packages"];

/// Per-iteration collection kinds, gathered after each test phase when
/// `metadata.collect_per_iteration` is set.
pub const PER_ITERATION_KINDS: &[&str] = &["uname", "dmesg"];

/// Collects one `kind` from `host` and stores it, logging and returning
/// `false` on any failure instead of propagating an error.
pub async fn collect(
    store: &SharedStateStore,
    channel: &dyn RemoteChannel,
    hostname: &str,
    session_id: &str,
    iteration_id: Option<&str>,
    kind: &str,
    timeout_secs: u64,
) -> bool {
    let args = vec![kind.to_string()];
    let output = channel.call("collect_metadata", &args, timeout_secs).await;
    if !output.ok() {
        warn!(
            host = hostname,
            kind,
            stderr = %output.stderr,
            "metadata collection failed; continuing"
        );
        return false;
    }

    let result = store.store_metadata(session_id, kind, &output.stdout, iteration_id, None);
    if let Err(e) = result {
        warn!(host = hostname, kind, error = %e, "failed to persist collected metadata");
        return false;
    }
    true
}

/// Collects every kind in `kinds` from `host`, ignoring individual failures.
pub async fn collect_many(
    store: &SharedStateStore,
    channel: &dyn RemoteChannel,
    hostname: &str,
    session_id: &str,
    iteration_id: Option<&str>,
    kinds: &[&str],
    timeout_secs: u64,
) {
    for kind in kinds {
        collect(store, channel, hostname, session_id, iteration_id, kind, timeout_secs).await;
    }
}

/// Pushes the shared kernel `.config` file to `host` and stores its content
/// as file-shaped metadata (kernel_config kind), when
/// `metadata.collect_kernel_config` is set.
pub async fn capture_kernel_config(
    store: &SharedStateStore,
    channel: &dyn RemoteChannel,
    hostname: &str,
    session_id: &str,
    iteration_id: &str,
    kernel_path: &str,
    timeout_secs: u64,
) -> bool {
    let command = format!("cat {}/.config", crate::shell_safety::escape_for_ssh(kernel_path));
    let output = channel.run(&command, timeout_secs).await;
    if !output.ok() {
        warn!(
            host = hostname,
            stderr = %output.stderr,
            "kernel config capture failed; continuing"
        );
        return false;
    }

    if let Err(e) = store.store_file_metadata(session_id, iteration_id, "kernel_config", &output.stdout) {
        warn!(host = hostname, error = %e, "failed to persist kernel config metadata");
        return false;
    }
    true
}
