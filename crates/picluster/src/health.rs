//! Remote node health over SSH.
//!
//! Runs `vcgencmd measure_temp` and a `psutil` one-liner on the node and
//! parses the two-line reply.

use std::process::Command;

use thiserror::Error;
use tracing::debug;

use crate::gateway::{run_captured, CommandOutput};
use crate::provision::NodeConnectionSpec;

/// Connect timeout for health queries, in seconds.
pub const HEALTH_CONNECT_TIMEOUT_SECS: u64 = 2;

const REMOTE_PY: &str = "import psutil;\
cpu=psutil.cpu_percent(interval=0.1);\
ram=psutil.virtual_memory().percent;\
net=psutil.net_io_counters();\
print(f'{cpu:.1f},{ram:.1f},{net.bytes_sent//(1024*1024)},{net.bytes_recv//(1024*1024)}')";

/// Errors from remote health queries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HealthError {
    /// SSH failed or the remote command exited non-zero.
    #[error("{label}: Unreachable / Error ({detail})")]
    Unreachable { label: String, detail: String },
}

/// Health figures reported by one node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeHealth {
    /// Node label.
    pub label: String,
    /// SoC temperature in °C.
    pub temperature_c: Option<f64>,
    /// CPU usage percentage.
    pub cpu_percent: Option<f64>,
    /// RAM usage percentage.
    pub ram_percent: Option<f64>,
    /// MiB sent since boot.
    pub sent_mib: u64,
    /// MiB received since boot.
    pub recv_mib: u64,
}

impl std::fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let or_na = |v: Option<f64>| v.map_or_else(|| "N/A".to_string(), |v| format!("{v:.1}"));
        write!(
            f,
            "{}: CPU {}% | RAM {}% | Temp {}°C | Net ↑{}MiB ↓{}MiB",
            self.label.to_uppercase(),
            or_na(self.cpu_percent),
            or_na(self.ram_percent),
            or_na(self.temperature_c),
            self.sent_mib,
            self.recv_mib
        )
    }
}

/// Parse the reply of the remote health command.
///
/// Line one is `temp=48.3'C`; line two is `cpu,ram,sent,recv`. Missing or
/// malformed parts become `None` / `0`.
#[must_use]
pub fn parse_health(label: &str, stdout: &str) -> NodeHealth {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let temp_line = lines.next().unwrap_or_default();
    let stats_line = lines.next().unwrap_or_default();

    let temperature_c = temp_line
        .strip_prefix("temp=")
        .and_then(|rest| rest.split_once('\''))
        .and_then(|(value, _)| value.parse().ok());

    let mut health = NodeHealth {
        label: label.to_string(),
        temperature_c,
        ..NodeHealth::default()
    };

    let fields: Vec<&str> = stats_line.split(',').map(str::trim).collect();
    if let [cpu, ram, sent, recv] = fields.as_slice() {
        health.cpu_percent = cpu.parse().ok();
        health.ram_percent = ram.parse().ok();
        health.sent_mib = sent.parse().unwrap_or(0);
        health.recv_mib = recv.parse().unwrap_or(0);
    }

    health
}

/// Runs the health command on a node.
pub trait HealthProbe {
    /// Execute the remote health command for `node`.
    fn run(&self, node: &NodeConnectionSpec) -> CommandOutput;
}

/// [`HealthProbe`] over `ssh`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshHealthProbe;

impl HealthProbe for SshHealthProbe {
    fn run(&self, node: &NodeConnectionSpec) -> CommandOutput {
        let remote = format!("/usr/bin/vcgencmd measure_temp && python3 -c \"{REMOTE_PY}\"");
        let mut cmd = Command::new("ssh");
        cmd.arg("-i")
            .arg(&node.keyfile)
            .args(["-o", "BatchMode=yes", "-o"])
            .arg(format!("ConnectTimeout={HEALTH_CONNECT_TIMEOUT_SECS}"))
            .arg(&node.user_host)
            .arg(remote);

        run_captured("ssh", &mut cmd)
    }
}

/// Query one node's health.
///
/// # Errors
/// Returns [`HealthError::Unreachable`] when the command fails.
pub fn query_health<P: HealthProbe + ?Sized>(
    probe: &P,
    node: &NodeConnectionSpec,
) -> Result<NodeHealth, HealthError> {
    let out = probe.run(node);
    if !out.success() {
        debug!(node = %node.label, exit_code = out.exit_code, "Health query failed");
        return Err(HealthError::Unreachable {
            label: node.label.to_uppercase(),
            detail: out.stderr,
        });
    }
    Ok(parse_health(&node.label, &out.stdout))
}
