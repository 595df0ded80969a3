//! Board command gateway.
//!
//! Runs the board control program (`clusterctrl`) and hands back its exit
//! code and captured output. Failures are reported through the returned
//! [`CommandOutput`], never as errors.

use std::process::{Command, Output};

use tracing::debug;

use crate::board::Feature;

/// Default name of the board control program.
pub const DEFAULT_PROGRAM: &str = "clusterctrl";

/// Exit code reported when the program could not be started.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = -1;

/// Captured result of one external command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Process exit code, `-1` when it could not be started or was killed.
    pub exit_code: i32,
    /// Trimmed standard output.
    pub stdout: String,
    /// Trimmed standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Build from a finished process.
    #[must_use]
    pub fn from_output(output: &Output) -> Self {
        Self {
            exit_code: output.status.code().unwrap_or(SPAWN_FAILURE_EXIT_CODE),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }

    /// Failure result carrying a diagnostic in stderr.
    #[must_use]
    pub fn spawn_failure(diagnostic: impl Into<String>) -> Self {
        Self {
            exit_code: SPAWN_FAILURE_EXIT_CODE,
            stdout: String::new(),
            stderr: diagnostic.into(),
        }
    }

    /// Whether the command exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `cmd` to completion, mapping spawn errors to a `-1` result.
pub(crate) fn run_captured(program: &str, cmd: &mut Command) -> CommandOutput {
    match cmd.output() {
        Ok(output) => CommandOutput::from_output(&output),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => CommandOutput::spawn_failure(
            format!("{program} not found; ensure it's installed and in PATH."),
        ),
        Err(e) => CommandOutput::spawn_failure(format!("Failed to execute {program}: {e}")),
    }
}

/// Access to the board control program.
pub trait BoardControl {
    /// Run the control program with `args`.
    fn execute(&self, args: &[&str]) -> CommandOutput;

    /// `on <label>`
    fn power_on(&self, label: &str) -> CommandOutput {
        self.execute(&["on", label])
    }

    /// `off <label>`
    fn power_off(&self, label: &str) -> CommandOutput {
        self.execute(&["off", label])
    }

    /// `on all`
    fn all_on(&self) -> CommandOutput {
        self.execute(&["on", "all"])
    }

    /// `off all`
    fn all_off(&self) -> CommandOutput {
        self.execute(&["off", "all"])
    }

    /// `<feature> on|off`
    fn set_feature(&self, feature: Feature, on: bool) -> CommandOutput {
        self.execute(&[feature.command_word(), if on { "on" } else { "off" }])
    }

    /// `status`
    fn status(&self) -> CommandOutput {
        self.execute(&["status"])
    }
}

impl<T: BoardControl + ?Sized> BoardControl for &T {
    fn execute(&self, args: &[&str]) -> CommandOutput {
        (**self).execute(args)
    }
}

/// Process-backed [`BoardControl`].
#[derive(Debug, Clone)]
pub struct ClusterCtrl {
    program: String,
}

impl ClusterCtrl {
    /// Gateway for a control program name or path.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Program this gateway invokes.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Default for ClusterCtrl {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM)
    }
}

impl BoardControl for ClusterCtrl {
    fn execute(&self, args: &[&str]) -> CommandOutput {
        debug!(program = %self.program, args = ?args, "Executing board command");

        let result = run_captured(&self.program, Command::new(&self.program).args(args));

        if !result.success() {
            debug!(
                program = %self.program,
                exit_code = result.exit_code,
                stderr = %result.stderr,
                "Board command failed"
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_program_reports_sentinel() {
        let gateway = ClusterCtrl::new("picluster-test-definitely-missing-program");
        let out = gateway.status();
        assert_eq!(out.exit_code, SPAWN_FAILURE_EXIT_CODE);
        assert!(out.stdout.is_empty());
        assert_eq!(
            out.stderr,
            "picluster-test-definitely-missing-program not found; ensure it's installed and in PATH."
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_passes_through() {
        let gateway = ClusterCtrl::new("sh");
        let out = gateway.execute(&["-c", "echo out; echo err >&2; exit 3"]);
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout, "out");
        assert_eq!(out.stderr, "err");
        assert!(!out.success());
    }

    struct Echo;

    impl BoardControl for Echo {
        fn execute(&self, args: &[&str]) -> CommandOutput {
            CommandOutput {
                exit_code: 0,
                stdout: args.join(" "),
                stderr: String::new(),
            }
        }
    }

    #[test]
    fn test_convenience_commands() {
        assert_eq!(Echo.power_on("p2").stdout, "on p2");
        assert_eq!(Echo.power_off("p2").stdout, "off p2");
        assert_eq!(Echo.all_on().stdout, "on all");
        assert_eq!(Echo.all_off().stdout, "off all");
        assert_eq!(Echo.set_feature(Feature::WriteProtect, true).stdout, "wp on");
        assert_eq!(Echo.set_feature(Feature::Fan, false).stdout, "fan off");
        assert_eq!(Echo.status().stdout, "status");
    }
}
