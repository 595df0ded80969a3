//! Status snapshot parsing.
//!
//! `clusterctrl status` prints `key: value` lines. They are collected into a
//! [`StatusSnapshot`] on every query; nothing is cached.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, info};

use crate::board::{BoardDefinition, BoardKind, Feature};
use crate::gateway::BoardControl;

/// Errors from status queries and status-driven commands.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatusError {
    /// `status` exited non-zero.
    #[error("status command failed: {0}")]
    CommandFailed(String),

    /// A power command issued after reading the status failed.
    #[error("Failed to power {action} {label}: {stderr}")]
    PowerFailed {
        action: &'static str,
        label: String,
        stderr: String,
    },
}

/// Point-in-time key/value view of the board.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusSnapshot {
    entries: BTreeMap<String, String>,
}

impl StatusSnapshot {
    /// Parse `status` output.
    ///
    /// Lines without a colon are skipped. Each remaining line is split on the
    /// first colon and both halves trimmed; later keys overwrite earlier ones.
    #[must_use]
    pub fn parse(stdout: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in stdout.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            entries.insert(key.trim().to_string(), value.trim().to_string());
        }
        Self { entries }
    }

    /// Raw value, `None` when the key was not reported.
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Value for `key`; absent keys read as `"0"`.
    #[must_use]
    pub fn get(&self, key: &str) -> &str {
        self.raw(key).unwrap_or("0")
    }

    /// Whether `key` reads `"1"`.
    #[must_use]
    pub fn is_on(&self, key: &str) -> bool {
        self.get(key) == "1"
    }

    /// Alert LED state, from `hat_alert` with `alert` as fallback.
    #[must_use]
    pub fn alert_on(&self) -> bool {
        self.raw("hat_alert").or_else(|| self.raw("alert")) == Some("1")
    }

    /// Fan state, `None` when the board does not report one.
    #[must_use]
    pub fn fan(&self) -> Option<bool> {
        self.raw("fan").map(|v| v == "1")
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was parsed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Identify the board from its identification keys.
    ///
    /// `hat_version_major` selects a ClusterHAT revision; otherwise `maxpi`
    /// selects a ClusterCTRL variant by node count.
    #[must_use]
    pub fn detect_board(&self) -> Option<BoardKind> {
        match self.raw("hat_version_major") {
            Some("1") => return Some(BoardKind::HatV1),
            Some("2") => return Some(BoardKind::HatV2),
            _ => {}
        }
        match self.raw("maxpi") {
            Some("1") => Some(BoardKind::Single),
            Some("3") => Some(BoardKind::Triple),
            Some("6") => Some(BoardKind::A6),
            _ => None,
        }
    }

    /// One-line summary of node and feature states for `board`.
    #[must_use]
    pub fn summary(&self, board: &BoardDefinition) -> String {
        let on_off = |on: bool| if on { "ON" } else { "OFF" };

        let mut parts: Vec<String> = board
            .valid_node_labels()
            .iter()
            .map(|label| format!("{}={}", label.to_uppercase(), on_off(self.is_on(label))))
            .collect();

        if board.supports(Feature::Hub) {
            parts.push(format!("HUB={}", on_off(self.is_on("hub"))));
            parts.push(format!("LED={}", on_off(self.is_on("led"))));
        }
        if board.supports(Feature::Alert) {
            parts.push(format!("ALERT={}", on_off(self.alert_on())));
        }
        if board.supports(Feature::WriteProtect) {
            parts.push(format!("WP={}", on_off(self.is_on("wp"))));
        }
        if let Some(fan) = self.fan() {
            parts.push(format!("FAN={}", on_off(fan)));
        }

        parts.join(" | ")
    }
}

/// Run `status` through `gateway` and parse the result.
///
/// # Errors
/// Returns [`StatusError::CommandFailed`] with the captured stderr when the
/// command exits non-zero.
pub fn query_status<G: BoardControl + ?Sized>(gateway: &G) -> Result<StatusSnapshot, StatusError> {
    let out = gateway.status();
    if !out.success() {
        return Err(StatusError::CommandFailed(out.stderr));
    }

    let snapshot = StatusSnapshot::parse(&out.stdout);
    debug!(entries = snapshot.len(), "Parsed board status");
    Ok(snapshot)
}

/// Flip one node's power based on its current status.
///
/// Returns `true` when the node was switched on, `false` when switched off.
///
/// # Errors
/// Returns an error if the status query or the power command fails.
pub fn toggle_node<G: BoardControl + ?Sized>(
    gateway: &G,
    label: &str,
) -> Result<bool, StatusError> {
    let snapshot = query_status(gateway)?;
    let turn_on = !snapshot.is_on(label);

    let (action, out) = if turn_on {
        ("ON", gateway.power_on(label))
    } else {
        ("OFF", gateway.power_off(label))
    };

    if !out.success() {
        return Err(StatusError::PowerFailed {
            action,
            label: label.to_uppercase(),
            stderr: out.stderr,
        });
    }

    info!(node = %label, state = action, "Node toggled");
    Ok(turn_on)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::gateway::CommandOutput;

    struct Scripted {
        status: CommandOutput,
        power: CommandOutput,
        calls: RefCell<Vec<String>>,
    }

    impl Scripted {
        fn new(status: CommandOutput) -> Self {
            Self {
                status,
                power: CommandOutput::default(),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl BoardControl for Scripted {
        fn execute(&self, args: &[&str]) -> CommandOutput {
            self.calls.borrow_mut().push(args.join(" "));
            if args == ["status"] {
                self.status.clone()
            } else {
                self.power.clone()
            }
        }
    }

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[test]
    fn test_query_status_parses_lines() {
        let gateway = Scripted::new(ok("p1: 1\nhub:0\nnot-a-line\nfan : 1"));
        let snapshot = query_status(&gateway).unwrap();

        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.raw("p1"), Some("1"));
        assert_eq!(snapshot.raw("hub"), Some("0"));
        assert_eq!(snapshot.raw("fan"), Some("1"));
        assert_eq!(*gateway.calls.borrow(), vec!["status".to_string()]);
    }

    #[test]
    fn test_query_status_failure_carries_stderr() {
        let gateway = Scripted::new(CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "I2C error".to_string(),
        });
        let err = query_status(&gateway).unwrap_err();
        assert_eq!(err.to_string(), "status command failed: I2C error");
    }

    #[test]
    fn test_parse_splits_on_first_colon_and_overwrites() {
        let snapshot = StatusSnapshot::parse("clusterhat:2.3: extra\np1:0\np1:1\nmode: xyz");
        assert_eq!(snapshot.raw("clusterhat"), Some("2.3: extra"));
        assert_eq!(snapshot.raw("p1"), Some("1"));
        assert_eq!(snapshot.raw("mode"), Some("xyz"));
    }

    #[test]
    fn test_absent_keys_read_as_off() {
        let snapshot = StatusSnapshot::parse("p1:1");
        assert_eq!(snapshot.get("p4"), "0");
        assert!(!snapshot.is_on("p4"));
        assert!(snapshot.is_on("p1"));
        assert_eq!(snapshot.fan(), None);
    }

    #[test]
    fn test_alert_prefers_hat_alert() {
        assert!(StatusSnapshot::parse("hat_alert:1\nalert:0").alert_on());
        assert!(StatusSnapshot::parse("alert:1").alert_on());
        assert!(!StatusSnapshot::parse("").alert_on());
    }

    #[test]
    fn test_detect_board() {
        assert_eq!(
            StatusSnapshot::parse("hat_version_major:2\nmaxpi:4").detect_board(),
            Some(BoardKind::HatV2)
        );
        assert_eq!(
            StatusSnapshot::parse("hat_version_major: 1").detect_board(),
            Some(BoardKind::HatV1)
        );
        assert_eq!(
            StatusSnapshot::parse("maxpi:6").detect_board(),
            Some(BoardKind::A6)
        );
        assert_eq!(
            StatusSnapshot::parse("maxpi:3").detect_board(),
            Some(BoardKind::Triple)
        );
        assert_eq!(StatusSnapshot::parse("maxpi:5").detect_board(), None);
    }

    #[test]
    fn test_summary_respects_board_features() {
        let snapshot = StatusSnapshot::parse("p1:1\np2:0\nhub:1\nhat_alert:1\nfan:0");

        let v1 = BoardKind::HatV1.definition();
        assert_eq!(
            snapshot.summary(v1),
            "P1=ON | P2=OFF | P3=OFF | P4=OFF | ALERT=ON | FAN=OFF"
        );

        let single = BoardKind::Single.definition();
        assert_eq!(
            StatusSnapshot::parse("p1:1").summary(single),
            "P1=ON"
        );
    }

    #[test]
    fn test_toggle_node_turns_off_running_node() {
        let gateway = Scripted::new(ok("p2:1"));
        let turned_on = toggle_node(&gateway, "p2").unwrap();
        assert!(!turned_on);
        assert_eq!(
            *gateway.calls.borrow(),
            vec!["status".to_string(), "off p2".to_string()]
        );
    }

    #[test]
    fn test_toggle_node_reports_power_failure() {
        let mut gateway = Scripted::new(ok("p2:0"));
        gateway.power = CommandOutput::spawn_failure("busy");
        let err = toggle_node(&gateway, "p2").unwrap_err();
        assert_eq!(err.to_string(), "Failed to power ON P2: busy");
    }
}
