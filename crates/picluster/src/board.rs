//! Board capability catalog.
//!
//! Every supported controller is described by a plain [`BoardDefinition`]
//! record. Records are looked up by [`BoardKind`] and never mutated.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when resolving boards, features or node labels.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BoardError {
    /// Unknown board slug.
    #[error("Unknown board: {0}. Supported: hat-v2, hat-v1, single, triple, a6")]
    UnknownBoard(String),

    /// Unknown auxiliary feature name.
    #[error("Unknown feature: {0}. Supported: hub, led, alert, wp, fan")]
    UnknownFeature(String),

    /// Feature not present on the selected board.
    #[error("{board} does not support '{feature}' control")]
    Unsupported { board: String, feature: String },

    /// Node label out of range for the selected board.
    #[error("Invalid node '{label}' for {board} (valid: {valid})")]
    InvalidNode {
        label: String,
        board: String,
        valid: String,
    },
}

/// Controller hardware variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BoardKind {
    /// ClusterHAT v2.x.
    #[default]
    HatV2,
    /// ClusterHAT v1.x.
    HatV1,
    /// ClusterCTRL Single.
    Single,
    /// ClusterCTRL Triple.
    Triple,
    /// ClusterCTRL A+6.
    A6,
}

impl BoardKind {
    /// All variants in catalog order.
    pub const ALL: [Self; 5] = [Self::HatV2, Self::HatV1, Self::Single, Self::Triple, Self::A6];

    /// The capability record for this variant.
    #[must_use]
    pub fn definition(self) -> &'static BoardDefinition {
        match self {
            Self::HatV2 => &BOARDS[0],
            Self::HatV1 => &BOARDS[1],
            Self::Single => &BOARDS[2],
            Self::Triple => &BOARDS[3],
            Self::A6 => &BOARDS[4],
        }
    }

    /// CLI / settings slug.
    #[must_use]
    pub fn slug(self) -> &'static str {
        match self {
            Self::HatV2 => "hat-v2",
            Self::HatV1 => "hat-v1",
            Self::Single => "single",
            Self::Triple => "triple",
            Self::A6 => "a6",
        }
    }
}

impl std::fmt::Display for BoardKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.definition().name)
    }
}

impl std::str::FromStr for BoardKind {
    type Err = BoardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hat-v2" | "hatv2" | "clusterhat-v2" => Ok(Self::HatV2),
            "hat-v1" | "hatv1" | "clusterhat-v1" => Ok(Self::HatV1),
            "single" => Ok(Self::Single),
            "triple" => Ok(Self::Triple),
            "a6" | "a+6" => Ok(Self::A6),
            _ => Err(BoardError::UnknownBoard(s.to_string())),
        }
    }
}

/// Auxiliary board feature that can be toggled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// USB hub power.
    Hub,
    /// Status LEDs.
    Led,
    /// Alert LED.
    Alert,
    /// EEPROM write protect.
    WriteProtect,
    /// Fan.
    Fan,
}

impl Feature {
    /// Word used by the control program (`clusterctrl <word> on`).
    #[must_use]
    pub fn command_word(self) -> &'static str {
        match self {
            Self::Hub => "hub",
            Self::Led => "led",
            Self::Alert => "alert",
            Self::WriteProtect => "wp",
            Self::Fan => "fan",
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.command_word())
    }
}

impl std::str::FromStr for Feature {
    type Err = BoardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hub" => Ok(Self::Hub),
            "led" => Ok(Self::Led),
            "alert" => Ok(Self::Alert),
            "wp" | "write-protect" | "write_protect" => Ok(Self::WriteProtect),
            "fan" => Ok(Self::Fan),
            _ => Err(BoardError::UnknownFeature(s.to_string())),
        }
    }
}

/// Static description of a board variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardDefinition {
    /// Variant this record describes.
    pub kind: BoardKind,
    /// Display name.
    pub name: &'static str,
    /// Number of attached nodes.
    pub node_count: usize,
    /// Hub power and LED control.
    pub supports_hub_led: bool,
    /// Alert LED control.
    pub supports_alert: bool,
    /// EEPROM write protect control.
    pub supports_write_protect: bool,
}

/// The board catalog.
pub static BOARDS: [BoardDefinition; 5] = [
    BoardDefinition {
        kind: BoardKind::HatV2,
        name: "ClusterHAT v2.x",
        node_count: 4,
        supports_hub_led: true,
        supports_alert: true,
        supports_write_protect: true,
    },
    BoardDefinition {
        kind: BoardKind::HatV1,
        name: "ClusterHAT v1.x",
        node_count: 4,
        supports_hub_led: false,
        supports_alert: true,
        supports_write_protect: false,
    },
    BoardDefinition {
        kind: BoardKind::Single,
        name: "ClusterCTRL Single",
        node_count: 1,
        supports_hub_led: false,
        supports_alert: false,
        supports_write_protect: false,
    },
    BoardDefinition {
        kind: BoardKind::Triple,
        name: "ClusterCTRL Triple",
        node_count: 3,
        supports_hub_led: true,
        supports_alert: true,
        supports_write_protect: false,
    },
    BoardDefinition {
        kind: BoardKind::A6,
        name: "ClusterCTRL A+6",
        node_count: 6,
        supports_hub_led: true,
        supports_alert: true,
        supports_write_protect: false,
    },
];

impl BoardDefinition {
    /// Node labels `p1..pN` in order.
    #[must_use]
    pub fn valid_node_labels(&self) -> Vec<String> {
        (1..=self.node_count).map(|i| format!("p{i}")).collect()
    }

    /// Whether `label` names a node on this board.
    #[must_use]
    pub fn is_valid_node(&self, label: &str) -> bool {
        label
            .strip_prefix('p')
            .and_then(|n| n.parse::<usize>().ok())
            .is_some_and(|n| (1..=self.node_count).contains(&n) && label == format!("p{n}"))
    }

    /// Check `label` against this board.
    ///
    /// # Errors
    /// Returns [`BoardError::InvalidNode`] when the label is out of range.
    pub fn validate_node(&self, label: &str) -> Result<(), BoardError> {
        if self.is_valid_node(label) {
            Ok(())
        } else {
            Err(BoardError::InvalidNode {
                label: label.to_string(),
                board: self.name.to_string(),
                valid: self.valid_node_labels().join(", "),
            })
        }
    }

    /// Whether the board exposes `feature`. The fan is always available.
    #[must_use]
    pub fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::Hub | Feature::Led => self.supports_hub_led,
            Feature::Alert => self.supports_alert,
            Feature::WriteProtect => self.supports_write_protect,
            Feature::Fan => true,
        }
    }

    /// Check `feature` against this board.
    ///
    /// # Errors
    /// Returns [`BoardError::Unsupported`] when the board lacks the feature.
    pub fn require(&self, feature: Feature) -> Result<(), BoardError> {
        if self.supports(feature) {
            Ok(())
        } else {
            Err(BoardError::Unsupported {
                board: self.name.to_string(),
                feature: feature.to_string(),
            })
        }
    }
}

/// Highest node count across the catalog.
#[must_use]
pub fn max_node_count() -> usize {
    BOARDS.iter().map(|b| b.node_count).max().unwrap_or(0)
}
