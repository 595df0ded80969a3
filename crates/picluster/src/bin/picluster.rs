//! picluster CLI - ClusterHAT / ClusterCTRL control and SSH key distribution.

use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use picluster::board::{BoardDefinition, BoardKind, Feature, BOARDS};
use picluster::config::{self, NodeSsh, Settings, CONFIG_ENV};
use picluster::gateway::{BoardControl, ClusterCtrl};
use picluster::health::{query_health, SshHealthProbe};
use picluster::provision::{KeyDistributor, PollConfig};
use picluster::status::{query_status, toggle_node};

/// picluster - control a ClusterHAT / ClusterCTRL board and its nodes.
#[derive(Parser)]
#[command(name = "picluster")]
#[command(about = "Control ClusterHAT / ClusterCTRL boards and distribute SSH keys to nodes")]
#[command(version)]
struct Cli {
    /// Settings file (default: ~/.config/picluster/config.json).
    #[arg(long, env = CONFIG_ENV, global = true)]
    config: Option<PathBuf>,

    /// Board control program (overrides settings).
    #[arg(long, global = true)]
    program: Option<String>,

    /// Board variant: hat-v2, hat-v1, single, triple, a6 (overrides settings).
    #[arg(long, global = true)]
    board: Option<BoardKind>,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

#[derive(Subcommand)]
enum Commands {
    /// List supported boards.
    Boards,

    /// Show node and feature status.
    Status,

    /// Power on a node, or `all`.
    On {
        /// Node label (p1..pN) or `all`.
        target: String,
    },

    /// Power off a node, or `all`.
    Off {
        /// Node label (p1..pN) or `all`.
        target: String,
    },

    /// Flip a node's power state.
    Toggle {
        /// Node label (p1..pN).
        label: String,
    },

    /// Switch an auxiliary feature (hub, led, alert, wp, fan).
    Feature {
        /// Feature name.
        feature: Feature,

        /// Desired state.
        #[arg(value_enum)]
        state: Switch,
    },

    /// Install your public key on a node.
    ///
    /// Powers the node on, waits for SSH, copies the key with sshpass +
    /// ssh-copy-id, then powers the node off.
    Distribute {
        /// Node label (p1..pN).
        label: String,

        /// SSH destination (overrides settings).
        #[arg(long)]
        user_host: Option<String>,

        /// Private key file (overrides settings).
        #[arg(long)]
        keyfile: Option<PathBuf>,

        /// Read the password from the first line of stdin instead of prompting.
        #[arg(long, default_value = "false")]
        password_stdin: bool,

        /// Seconds to wait for SSH (overrides settings).
        #[arg(long)]
        wait_budget: Option<u64>,

        /// Seconds between SSH probes (overrides settings).
        #[arg(long)]
        poll_interval: Option<u64>,
    },

    /// Query CPU, RAM, temperature and network of nodes over SSH.
    Health {
        /// Node labels (default: every node of the board).
        labels: Vec<String>,
    },

    /// Inspect or edit settings.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the settings file path.
    Path,

    /// Print the effective settings.
    Show,

    /// Store SSH parameters for a node.
    SetNode {
        /// Node label (p1..pN).
        label: String,

        /// SSH destination.
        #[arg(long)]
        user_host: Option<String>,

        /// Private key file.
        #[arg(long)]
        keyfile: Option<PathBuf>,
    },

    /// Store the board variant.
    SetBoard {
        /// Board variant.
        board: BoardKind,
    },
}

#[allow(clippy::too_many_lines)]
fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => Settings::default_path().context("Failed to resolve settings path")?,
    };
    let mut settings = Settings::load(&config_path).context("Failed to load settings")?;
    if let Some(program) = cli.program {
        settings.program = program;
    }

    let gateway = ClusterCtrl::new(settings.program.clone());

    match cli.command {
        Commands::Boards => {
            println!(
                "\n{:<8} {:<20} {:<6} {:<8} {:<6} {:<4}",
                "SLUG", "NAME", "NODES", "HUB/LED", "ALERT", "WP"
            );
            println!("{}", "-".repeat(56));
            let yes_no = |b: bool| if b { "yes" } else { "no" };
            for board in &BOARDS {
                println!(
                    "{:<8} {:<20} {:<6} {:<8} {:<6} {:<4}",
                    board.kind.slug(),
                    board.name,
                    board.node_count,
                    yes_no(board.supports_hub_led),
                    yes_no(board.supports_alert),
                    yes_no(board.supports_write_protect)
                );
            }
        }

        Commands::Status => {
            let snapshot = query_status(&gateway)?;
            let board = resolve_board(cli.board, &settings, || snapshot.detect_board());
            println!("\nBoard: {}", board.name);
            if let Some(detected) = snapshot.detect_board() {
                println!("Detected: {detected}");
            }
            println!("{}", snapshot.summary(board).bold());
        }

        Commands::On { target } => power(&gateway, cli.board, &settings, &target, true)?,

        Commands::Off { target } => power(&gateway, cli.board, &settings, &target, false)?,

        Commands::Toggle { label } => {
            let board = resolve_board(cli.board, &settings, || detect_board(&gateway));
            board.validate_node(&label)?;
            let now_on = toggle_node(&gateway, &label)?;
            println!(
                "✅ {} powered {}",
                label.to_uppercase(),
                if now_on { "ON" } else { "OFF" }
            );
        }

        Commands::Feature { feature, state } => {
            let board = resolve_board(cli.board, &settings, || detect_board(&gateway));
            board.require(feature)?;
            let on = matches!(state, Switch::On);
            let out = gateway.set_feature(feature, on);
            let word = if on { "on" } else { "off" };
            if !out.success() {
                bail!("Failed to run '{} {feature} {word}': {}", gateway.program(), out.stderr);
            }
            println!("✅ {feature} {word}");
        }

        Commands::Distribute {
            label,
            user_host,
            keyfile,
            password_stdin,
            wait_budget,
            poll_interval,
        } => {
            let board = resolve_board(cli.board, &settings, || detect_board(&gateway));
            board.validate_node(&label)?;

            if let Err(e) = config::ensure_ssh_dir() {
                warn!("Could not prepare ~/.ssh: {e}");
            }

            if let Some(secs) = wait_budget {
                settings.wait_budget_secs = secs;
            }
            if let Some(secs) = poll_interval {
                settings.poll_interval_secs = secs;
            }
            settings.validate()?;

            let mut node = settings.connection(&label);
            if let Some(user_host) = user_host {
                node.user_host = user_host;
            }
            if let Some(keyfile) = keyfile {
                node.keyfile = keyfile;
            }
            if node.user_host.trim().is_empty() || node.keyfile.as_os_str().is_empty() {
                bail!(
                    "Please specify User@Host and Keyfile for {}",
                    label.to_uppercase()
                );
            }

            node.password = Some(if password_stdin {
                read_password_line()?
            } else {
                dialoguer::Password::new()
                    .with_prompt(format!("Password for {}", node.user_host))
                    .allow_empty_password(true)
                    .interact()
                    .context("Failed to read password")?
            });

            let poll: PollConfig = settings.poll_config();
            println!(
                "⏳ Waiting for {} to respond (up to {} s)…",
                node.user_host,
                poll.wait_budget.as_secs()
            );

            let distributor = KeyDistributor::new(&gateway);
            let outcome = distributor.distribute_key(&mut node, &poll);

            if outcome.is_success() {
                println!(
                    "✅ SSH key copied to {} and {} powered OFF.",
                    node.user_host,
                    label.to_uppercase()
                );
                return Ok(());
            }

            eprintln!("{} {outcome}", "❌".red());
            if outcome.node_left_on() {
                eprintln!(
                    "{}",
                    format!("{} remains powered ON for manual setup.", label.to_uppercase())
                        .yellow()
                );
            }
            bail!(
                "Key distribution for {} stopped at {}",
                label.to_uppercase(),
                outcome.stage()
            );
        }

        Commands::Health { labels } => {
            let board = resolve_board(cli.board, &settings, || detect_board(&gateway));
            let labels = if labels.is_empty() {
                board.valid_node_labels()
            } else {
                validate_labels(board, &labels)?;
                labels
            };

            for label in labels {
                let node = settings.connection(&label);
                match query_health(&SshHealthProbe, &node) {
                    Ok(health) => println!("{health}"),
                    Err(e) => println!("{}", e.to_string().dimmed()),
                }
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Path => println!("{}", config_path.display()),

            ConfigAction::Show => {
                let rendered = serde_json::to_string_pretty(&settings)
                    .context("Failed to serialize settings")?;
                println!("{rendered}");
            }

            ConfigAction::SetNode {
                label,
                user_host,
                keyfile,
            } => {
                if !BOARDS.iter().any(|b| b.is_valid_node(&label)) {
                    bail!("Unknown node label: {label}");
                }
                let current = settings.node_ssh(&label);
                settings.set_node_ssh(
                    label.clone(),
                    NodeSsh {
                        user_host: user_host.unwrap_or(current.user_host),
                        keyfile: keyfile.unwrap_or(current.keyfile),
                    },
                );
                settings.save(&config_path)?;
                println!("✅ Saved SSH settings for {}", label.to_uppercase());
            }

            ConfigAction::SetBoard { board } => {
                settings.board = Some(board);
                settings.save(&config_path)?;
                println!("✅ Board set to {board}");
            }
        },
    }

    Ok(())
}

/// Pick the board: flag, then settings, then status detection, then HAT v2.
/// Flag, then settings, then `detect`, then the HAT v2 default.
fn resolve_board(
    flag: Option<BoardKind>,
    settings: &Settings,
    detect: impl FnOnce() -> Option<BoardKind>,
) -> &'static BoardDefinition {
    flag.or(settings.board)
        .or_else(detect)
        .unwrap_or_default()
        .definition()
}

fn detect_board(gateway: &ClusterCtrl) -> Option<BoardKind> {
    match query_status(gateway) {
        Ok(snapshot) => {
            let kind = snapshot.detect_board();
            if let Some(kind) = kind {
                info!(board = %kind, "Detected board");
            }
            kind
        }
        Err(e) => {
            warn!("Board detection failed: {e}");
            None
        }
    }
}

fn power(
    gateway: &ClusterCtrl,
    flag: Option<BoardKind>,
    settings: &Settings,
    target: &str,
    on: bool,
) -> Result<()> {
    let word = if on { "ON" } else { "OFF" };

    let out = if target == "all" {
        if on {
            gateway.all_on()
        } else {
            gateway.all_off()
        }
    } else {
        resolve_board(flag, settings, || detect_board(gateway)).validate_node(target)?;
        if on {
            gateway.power_on(target)
        } else {
            gateway.power_off(target)
        }
    };

    if !out.success() {
        bail!("Failed to power {word} {}: {}", target.to_uppercase(), out.stderr);
    }

    println!("✅ {} powered {word}", target.to_uppercase());
    Ok(())
}

fn validate_labels(board: &BoardDefinition, labels: &[String]) -> Result<()> {
    for label in labels {
        board.validate_node(label)?;
    }
    Ok(())
}

fn read_password_line() -> Result<String> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_distribute() {
        let cli = Cli::try_parse_from([
            "picluster",
            "--board",
            "triple",
            "distribute",
            "p3",
            "--user-host",
            "pi@10.0.0.13",
            "--poll-interval",
            "2",
        ])
        .unwrap();

        assert_eq!(cli.board, Some(BoardKind::Triple));
        match cli.command {
            Commands::Distribute {
                label,
                user_host,
                poll_interval,
                password_stdin,
                ..
            } => {
                assert_eq!(label, "p3");
                assert_eq!(user_host.as_deref(), Some("pi@10.0.0.13"));
                assert_eq!(poll_interval, Some(2));
                assert!(!password_stdin);
            }
            _ => panic!("expected distribute"),
        }
    }

    #[test]
    fn test_cli_parses_feature() {
        let cli = Cli::try_parse_from(["picluster", "feature", "wp", "off"]).unwrap();
        match cli.command {
            Commands::Feature { feature, state } => {
                assert_eq!(feature, Feature::WriteProtect);
                assert!(matches!(state, Switch::Off));
            }
            _ => panic!("expected feature"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_board() {
        assert!(Cli::try_parse_from(["picluster", "--board", "quad", "status"]).is_err());
    }

    #[test]
    fn test_resolve_board_prefers_flag_over_settings() {
        let mut settings = Settings::default();
        settings.board = Some(BoardKind::Single);
        let gateway = ClusterCtrl::new("picluster-test-missing-program");

        assert_eq!(
            resolve_board(Some(BoardKind::A6), &settings, || detect_board(&gateway)).kind,
            BoardKind::A6
        );
        assert_eq!(
            resolve_board(None, &settings, || detect_board(&gateway)).kind,
            BoardKind::Single
        );
        assert_eq!(
            resolve_board(None, &Settings::default(), || detect_board(&gateway)).kind,
            BoardKind::HatV2
        );
    }

    #[test]
    fn test_resolve_board_detects_only_when_unconfigured() {
        let mut settings = Settings::default();
        settings.board = Some(BoardKind::Triple);
        let calls = std::cell::Cell::new(0);
        let detect = || {
            calls.set(calls.get() + 1);
            Some(BoardKind::HatV1)
        };

        assert_eq!(resolve_board(None, &settings, detect).kind, BoardKind::Triple);
        assert_eq!(calls.get(), 0);

        assert_eq!(
            resolve_board(None, &Settings::default(), detect).kind,
            BoardKind::HatV1
        );
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_validate_health_labels() {
        let board = BoardKind::Single.definition();
        assert!(validate_labels(board, &["p1".to_string()]).is_ok());
        assert!(validate_labels(board, &["p1".to_string(), "p2".to_string()]).is_err());
    }
}
