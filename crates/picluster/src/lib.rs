//! ClusterHAT / ClusterCTRL node control.
//!
//! This crate drives a Raspberry Pi cluster board through its control
//! program (`clusterctrl`) and distributes SSH keys to the attached nodes.
//!
//! # Example
//!
//! ```rust,ignore
//! use picluster::gateway::ClusterCtrl;
//! use picluster::provision::{KeyDistributor, NodeConnectionSpec, PollConfig};
//!
//! let distributor = KeyDistributor::new(ClusterCtrl::default());
//! let mut node = NodeConnectionSpec::new("p1", "pi@p1.local", "/home/pi/.ssh/id_rsa")
//!     .with_password("raspberry");
//!
//! let outcome = distributor.distribute_key(&mut node, &PollConfig::default());
//! if outcome.node_left_on() {
//!     eprintln!("p1 was left powered ON: {outcome}");
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod board;
pub mod config;
pub mod gateway;
pub mod health;
pub mod provision;
pub mod status;

pub use board::{BoardDefinition, BoardError, BoardKind, Feature, BOARDS};
pub use config::{ConfigError, Settings};
pub use gateway::{BoardControl, ClusterCtrl, CommandOutput};
pub use provision::{DistributionOutcome, KeyDistributor, NodeConnectionSpec, PollConfig};
pub use status::{query_status, StatusError, StatusSnapshot};
