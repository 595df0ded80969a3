//! SSH key distribution for a single node.
//!
//! The workflow powers a node on, waits for its SSH daemon, installs the
//! caller's public key with `sshpass` + `ssh-copy-id`, then powers the node
//! off again:
//!
//! ```text
//! PrereqCheck -> PowerOn -> WaitReachable -> InstallKey -> PowerOff -> Done
//! ```
//!
//! Every stage failure ends the run and is returned as a
//! [`DistributionOutcome`]. Only the reachability wait retries. A node is
//! left powered on after a timeout or a failed install so the operator can
//! continue by hand.
//!
//! External tools sit behind [`ReachabilityProbe`], [`KeyInstaller`],
//! [`ToolLocator`] and [`Sleeper`], so the sequence can be driven without
//! spawning processes.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::gateway::{run_captured, BoardControl, CommandOutput};

/// Helper used to feed the password to `ssh-copy-id`.
pub const COPY_HELPER: &str = "sshpass";

/// Token the reachability probe echoes back.
pub const PROBE_MARKER: &str = "up";

/// Default total wait for a node to answer SSH.
pub const DEFAULT_WAIT_BUDGET_SECS: u64 = 120;

/// Default delay between reachability probes.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Connection parameters for one node.
///
/// The password is only held until a key has been installed successfully.
#[derive(Clone, Default)]
pub struct NodeConnectionSpec {
    /// Node label (`p1`..`pN`).
    pub label: String,
    /// SSH destination, e.g. `pi@p1.local`.
    pub user_host: String,
    /// Private key file; `ssh-copy-id` installs the matching `.pub`.
    pub keyfile: PathBuf,
    /// Login password for the initial copy.
    pub password: Option<String>,
}

impl NodeConnectionSpec {
    /// Create a spec without a password.
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        user_host: impl Into<String>,
        keyfile: impl Into<PathBuf>,
    ) -> Self {
        Self {
            label: label.into(),
            user_host: user_host.into(),
            keyfile: keyfile.into(),
            password: None,
        }
    }

    /// Attach the password used for the key copy.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

impl std::fmt::Debug for NodeConnectionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnectionSpec")
            .field("label", &self.label)
            .field("user_host", &self.user_host)
            .field("keyfile", &self.keyfile)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Reachability wait settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Total time to wait for the node.
    pub wait_budget: Duration,
    /// Delay between probes; also the per-probe connect timeout.
    pub poll_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            wait_budget: Duration::from_secs(DEFAULT_WAIT_BUDGET_SECS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
        }
    }
}

impl PollConfig {
    /// Build from whole seconds.
    #[must_use]
    pub fn from_secs(wait_budget_secs: u64, poll_interval_secs: u64) -> Self {
        Self {
            wait_budget: Duration::from_secs(wait_budget_secs),
            poll_interval: Duration::from_secs(poll_interval_secs),
        }
    }

    /// Poll interval, never shorter than one second.
    #[must_use]
    pub fn effective_interval(&self) -> Duration {
        self.poll_interval.max(Duration::from_secs(1))
    }

    /// Number of probes made before giving up (`ceil(budget / interval)`).
    #[must_use]
    pub fn max_attempts(&self) -> u64 {
        let interval = self.effective_interval().as_millis();
        let budget = self.wait_budget.as_millis();
        u64::try_from(budget.div_ceil(interval)).unwrap_or(u64::MAX)
    }
}

/// Workflow stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DistributionStage {
    /// Locating the copy helper.
    PrereqCheck,
    /// Powering the node on.
    PowerOn,
    /// Polling SSH until the node answers.
    WaitReachable,
    /// Copying the public key.
    InstallKey,
    /// Powering the node off.
    PowerOff,
    /// Finished.
    Done,
}

impl std::fmt::Display for DistributionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PrereqCheck => write!(f, "prereq_check"),
            Self::PowerOn => write!(f, "power_on"),
            Self::WaitReachable => write!(f, "wait_reachable"),
            Self::InstallKey => write!(f, "install_key"),
            Self::PowerOff => write!(f, "power_off"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Result of one distribution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum DistributionOutcome {
    /// Key installed and node powered off.
    Succeeded,
    /// A local tool is missing; no power change was made.
    MissingPrerequisite(String),
    /// `on <label>` failed.
    PowerOnFailed(String),
    /// The node never answered SSH; it is still powered on.
    Timeout(u64),
    /// `ssh-copy-id` failed; the node is still powered on.
    KeyInstallFailed(String),
    /// Key installed but `off <label>` failed; the node is still powered on.
    PowerOffFailed(String),
}

impl DistributionOutcome {
    /// Whether the run completed cleanly.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Whether the key reached the node.
    #[must_use]
    pub fn key_installed(&self) -> bool {
        matches!(self, Self::Succeeded | Self::PowerOffFailed(_))
    }

    /// Whether the node was knowingly left powered on.
    #[must_use]
    pub fn node_left_on(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::KeyInstallFailed(_) | Self::PowerOffFailed(_)
        )
    }

    /// Stage that ended the run.
    #[must_use]
    pub fn stage(&self) -> DistributionStage {
        match self {
            Self::Succeeded => DistributionStage::Done,
            Self::MissingPrerequisite(_) => DistributionStage::PrereqCheck,
            Self::PowerOnFailed(_) => DistributionStage::PowerOn,
            Self::Timeout(_) => DistributionStage::WaitReachable,
            Self::KeyInstallFailed(_) => DistributionStage::InstallKey,
            Self::PowerOffFailed(_) => DistributionStage::PowerOff,
        }
    }
}

impl std::fmt::Display for DistributionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "SSH key copied and node powered OFF"),
            Self::MissingPrerequisite(tool) => write!(
                f,
                "{tool} is required to distribute SSH keys. Please install it (`sudo apt install {tool}`) first"
            ),
            Self::PowerOnFailed(detail) => write!(f, "Failed to power ON node: {detail}"),
            Self::Timeout(secs) => write!(f, "Node did not respond within {secs} seconds"),
            Self::KeyInstallFailed(detail) => write!(f, "Failed to copy SSH key: {detail}"),
            Self::PowerOffFailed(detail) => {
                write!(f, "Key copied, but failed to power OFF node: {detail}")
            }
        }
    }
}

/// Looks up local executables.
pub trait ToolLocator {
    /// Whether `tool` can be found.
    fn locate(&self, tool: &str) -> bool;
}

/// [`ToolLocator`] backed by a `PATH` search.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathLocator;

impl ToolLocator for PathLocator {
    fn locate(&self, tool: &str) -> bool {
        which::which(tool).is_ok()
    }
}

/// One non-interactive "are you up" check against a node.
pub trait ReachabilityProbe {
    /// Run a single probe with the given connect timeout.
    fn probe(&self, node: &NodeConnectionSpec, connect_timeout: Duration) -> CommandOutput;
}

/// `ssh -o BatchMode=yes ... echo up`
#[derive(Debug, Clone)]
pub struct SshProbe {
    program: String,
}

impl SshProbe {
    /// Probe using `program` in place of `ssh`.
    #[must_use]
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SshProbe {
    fn default() -> Self {
        Self::with_program("ssh")
    }
}

impl ReachabilityProbe for SshProbe {
    fn probe(&self, node: &NodeConnectionSpec, connect_timeout: Duration) -> CommandOutput {
        let timeout_secs = connect_timeout.as_secs().max(1);
        let mut cmd = Command::new(&self.program);
        cmd.args(["-o", "BatchMode=yes", "-o"])
            .arg(format!("ConnectTimeout={timeout_secs}"))
            .arg("-i")
            .arg(&node.keyfile)
            .arg(&node.user_host)
            .args(["echo", PROBE_MARKER]);

        run_captured(&self.program, &mut cmd)
    }
}

/// Installs a public key on a node using password authentication.
pub trait KeyInstaller {
    /// Copy the key for `node` using `password`.
    fn install(&self, node: &NodeConnectionSpec, password: &str) -> CommandOutput;
}

/// `sshpass -e ssh-copy-id -o StrictHostKeyChecking=no -i <key> <user@host>`
///
/// The password travels in the `SSHPASS` environment variable, never on the
/// command line.
#[derive(Debug, Clone)]
pub struct SshCopyId {
    program: String,
}

impl SshCopyId {
    /// Installer using `program` in place of `sshpass`.
    #[must_use]
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SshCopyId {
    fn default() -> Self {
        Self::with_program(COPY_HELPER)
    }
}

impl KeyInstaller for SshCopyId {
    fn install(&self, node: &NodeConnectionSpec, password: &str) -> CommandOutput {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-e", "ssh-copy-id", "-o", "StrictHostKeyChecking=no", "-i"])
            .arg(&node.keyfile)
            .arg(&node.user_host)
            .env("SSHPASS", password);

        run_captured(&self.program, &mut cmd)
    }
}

/// Blocking pause between probes.
pub trait Sleeper {
    /// Block for `duration`.
    fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] using `std::thread::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Runs the distribution sequence against one board.
pub struct KeyDistributor<G, P = SshProbe, K = SshCopyId, L = PathLocator, S = ThreadSleeper> {
    gateway: G,
    probe: P,
    installer: K,
    locator: L,
    sleeper: S,
}

impl<G: BoardControl> KeyDistributor<G> {
    /// Distributor using the real `ssh`, `sshpass` and thread sleep.
    #[must_use]
    pub fn new(gateway: G) -> Self {
        Self {
            gateway,
            probe: SshProbe::default(),
            installer: SshCopyId::default(),
            locator: PathLocator,
            sleeper: ThreadSleeper,
        }
    }
}

impl<G, P, K, L, S> KeyDistributor<G, P, K, L, S>
where
    G: BoardControl,
    P: ReachabilityProbe,
    K: KeyInstaller,
    L: ToolLocator,
    S: Sleeper,
{
    /// Replace the reachability probe.
    #[must_use]
    pub fn with_probe<P2: ReachabilityProbe>(self, probe: P2) -> KeyDistributor<G, P2, K, L, S> {
        KeyDistributor {
            gateway: self.gateway,
            probe,
            installer: self.installer,
            locator: self.locator,
            sleeper: self.sleeper,
        }
    }

    /// Replace the key installer.
    #[must_use]
    pub fn with_installer<K2: KeyInstaller>(self, installer: K2) -> KeyDistributor<G, P, K2, L, S> {
        KeyDistributor {
            gateway: self.gateway,
            probe: self.probe,
            installer,
            locator: self.locator,
            sleeper: self.sleeper,
        }
    }

    /// Replace the tool locator.
    #[must_use]
    pub fn with_locator<L2: ToolLocator>(self, locator: L2) -> KeyDistributor<G, P, K, L2, S> {
        KeyDistributor {
            gateway: self.gateway,
            probe: self.probe,
            installer: self.installer,
            locator,
            sleeper: self.sleeper,
        }
    }

    /// Replace the sleeper.
    #[must_use]
    pub fn with_sleeper<S2: Sleeper>(self, sleeper: S2) -> KeyDistributor<G, P, K, L, S2> {
        KeyDistributor {
            gateway: self.gateway,
            probe: self.probe,
            installer: self.installer,
            locator: self.locator,
            sleeper,
        }
    }

    /// Reachability probe in use.
    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// Key installer in use.
    pub fn installer(&self) -> &K {
        &self.installer
    }

    /// Sleeper in use.
    pub fn sleeper(&self) -> &S {
        &self.sleeper
    }

    /// Power on, wait for SSH, copy the key, power off.
    ///
    /// The password is removed from `node` once the key has been copied. A
    /// failed run keeps it so the caller can retry.
    pub fn distribute_key(
        &self,
        node: &mut NodeConnectionSpec,
        poll: &PollConfig,
    ) -> DistributionOutcome {
        let label = node.label.clone();
        info!(node = %label, user_host = %node.user_host, "Distributing SSH key");

        // PrereqCheck: before any power change.
        if !self.locator.locate(COPY_HELPER) {
            warn!(node = %label, tool = COPY_HELPER, "Copy helper not found");
            return DistributionOutcome::MissingPrerequisite(COPY_HELPER.to_string());
        }

        // PowerOn
        let on = self.gateway.power_on(&label);
        if !on.success() {
            warn!(node = %label, exit_code = on.exit_code, "Power on failed");
            return DistributionOutcome::PowerOnFailed(on.stderr);
        }
        info!(node = %label, stage = %DistributionStage::PowerOn, "Node powered on");

        // WaitReachable
        if let Err(elapsed_secs) = self.wait_reachable(node, poll) {
            warn!(
                node = %label,
                elapsed_secs,
                "Node did not respond, leaving it powered on"
            );
            return DistributionOutcome::Timeout(elapsed_secs);
        }

        // InstallKey
        let copied = self
            .installer
            .install(node, node.password.as_deref().unwrap_or(""));
        if !copied.success() {
            warn!(
                node = %label,
                exit_code = copied.exit_code,
                "Key copy failed, leaving node powered on"
            );
            return DistributionOutcome::KeyInstallFailed(copied.stderr);
        }
        node.password = None;
        info!(node = %label, stage = %DistributionStage::InstallKey, "SSH key copied");

        // PowerOff
        let off = self.gateway.power_off(&label);
        if !off.success() {
            warn!(
                node = %label,
                exit_code = off.exit_code,
                "Key copied but power off failed, node left on"
            );
            return DistributionOutcome::PowerOffFailed(off.stderr);
        }

        info!(node = %label, stage = %DistributionStage::Done, "Node powered off");
        DistributionOutcome::Succeeded
    }

    /// Probe until the node answers or the budget runs out.
    ///
    /// Returns the seconds waited on timeout.
    fn wait_reachable(&self, node: &NodeConnectionSpec, poll: &PollConfig) -> Result<(), u64> {
        let interval = poll.effective_interval();
        let mut elapsed = Duration::ZERO;
        let mut attempt: u64 = 0;

        info!(
            node = %node.label,
            budget_secs = poll.wait_budget.as_secs(),
            interval_secs = interval.as_secs(),
            "Waiting for SSH"
        );

        while elapsed < poll.wait_budget {
            attempt += 1;
            let out = self.probe.probe(node, interval);

            // Exit status and marker are both required.
            if out.success() && out.stdout.contains(PROBE_MARKER) {
                info!(node = %node.label, attempt, "Node is reachable");
                return Ok(());
            }

            debug!(
                node = %node.label,
                attempt,
                exit_code = out.exit_code,
                stderr = %out.stderr,
                "Probe failed"
            );

            self.sleeper.sleep(interval);
            elapsed += interval;
        }

        Err(elapsed.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_config_defaults() {
        let poll = PollConfig::default();
        assert_eq!(poll.wait_budget, Duration::from_secs(120));
        assert_eq!(poll.poll_interval, Duration::from_secs(5));
        assert_eq!(poll.max_attempts(), 24);
    }

    #[test]
    fn test_max_attempts_rounds_up() {
        assert_eq!(PollConfig::from_secs(10, 3).max_attempts(), 4);
        assert_eq!(PollConfig::from_secs(0, 5).max_attempts(), 0);
        assert_eq!(PollConfig::from_secs(10, 0).max_attempts(), 10);
    }

    #[test]
    fn test_outcome_left_on_semantics() {
        assert!(!DistributionOutcome::Succeeded.node_left_on());
        assert!(!DistributionOutcome::MissingPrerequisite("sshpass".into()).node_left_on());
        assert!(!DistributionOutcome::PowerOnFailed(String::new()).node_left_on());
        assert!(DistributionOutcome::Timeout(120).node_left_on());
        assert!(DistributionOutcome::KeyInstallFailed(String::new()).node_left_on());
        assert!(DistributionOutcome::PowerOffFailed(String::new()).node_left_on());

        assert!(DistributionOutcome::PowerOffFailed(String::new()).key_installed());
        assert!(!DistributionOutcome::KeyInstallFailed(String::new()).key_installed());
    }

    #[test]
    fn test_outcome_stage() {
        assert_eq!(
            DistributionOutcome::Timeout(5).stage(),
            DistributionStage::WaitReachable
        );
        assert_eq!(DistributionOutcome::Succeeded.stage(), DistributionStage::Done);
        assert!(DistributionStage::PrereqCheck < DistributionStage::PowerOff);
    }

    #[test]
    fn test_debug_redacts_password() {
        let spec = NodeConnectionSpec::new("p1", "pi@p1.local", "/home/pi/.ssh/id_rsa")
            .with_password("hunter2");
        let rendered = format!("{spec:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let json = serde_json::to_string(&DistributionOutcome::Timeout(120)).unwrap();
        assert_eq!(json, r#"{"outcome":"timeout","detail":120}"#);
    }

    /// Writes an executable script that prints its argv and `SSHPASS`.
    #[cfg(unix)]
    fn echo_script(dir: &std::path::Path, name: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\necho \"$*\"\necho \"SSHPASS=$SSHPASS\"\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[test]
    fn test_ssh_probe_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let probe = SshProbe::with_program(echo_script(dir.path(), "ssh"));
        let node = NodeConnectionSpec::new("p1", "pi@p1.local", "/k/id").with_password("s3cret");

        let out = probe.probe(&node, Duration::from_secs(5));

        assert!(out.success(), "{}", out.stderr);
        let mut lines = out.stdout.lines();
        assert_eq!(
            lines.next(),
            Some("-o BatchMode=yes -o ConnectTimeout=5 -i /k/id pi@p1.local echo up")
        );
        assert!(!out.stdout.contains("s3cret"));
    }

    #[cfg(unix)]
    #[test]
    fn test_ssh_copy_id_passes_password_in_env() {
        let dir = tempfile::tempdir().unwrap();
        let installer = SshCopyId::with_program(echo_script(dir.path(), "sshpass"));
        let node = NodeConnectionSpec::new("p1", "pi@p1.local", "/k/id");

        let out = installer.install(&node, "s3cret");

        assert!(out.success(), "{}", out.stderr);
        let lines: Vec<&str> = out.stdout.lines().collect();
        assert_eq!(
            lines,
            vec![
                "-e ssh-copy-id -o StrictHostKeyChecking=no -i /k/id pi@p1.local",
                "SSHPASS=s3cret",
            ]
        );
    }
}
