//! ovctl - operator CLI for an OpenVPN gateway node
//!
//! Talks to the local system directly, no daemon required.
//!
//! ```bash
//! sudo ovctl status
//! sudo ovctl health -o json
//! sudo ovctl fix
//! sudo ovctl user add alice
//! sudo ovctl settings set --port 443 --proto tcp
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use libovnode::{CreateOutcome, DeleteOutcome, Node, NodeConfig, TunnelSettings};
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "ovctl")]
#[command(version)]
#[command(about = "OpenVPN node control - status, health, repairs and tunnel users", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to $OVNODE_CONFIG or /etc/ovnode/ovnode.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    output: OutputFormat,

    /// Verbose logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Show service status and port
    Status,
    /// Run a health check
    Health,
    /// Detect and repair problems, then restart the service
    Fix,
    /// Restart the service
    Restart,
    /// Show recent service journal lines
    Logs {
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },
    /// Scan the journal for configuration errors
    Errors,
    /// Tunnel user management
    #[command(subcommand)]
    User(UserCommands),
    /// Tunnel settings
    #[command(subcommand)]
    Settings(SettingsCommands),
}

#[derive(Subcommand)]
enum UserCommands {
    /// Create a user through the installer
    Add { name: String },
    /// Revoke a user and delete its profile
    Remove { name: String },
    /// Print the path of a user's profile, creating the user if needed
    Profile { name: String },
}

#[derive(Subcommand)]
enum SettingsCommands {
    /// Change port and protocol, optionally the public address, then restart
    Set {
        #[arg(long)]
        port: u32,
        #[arg(long)]
        proto: String,
        /// Address clients connect to
        #[arg(long)]
        address: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ovctl={},libovnode={}", level, level)));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("JSON serialization error")?);
    Ok(())
}

fn banner(title: &str) {
    println!("{}", "=".repeat(50));
    println!("{}", title);
    println!("{}", "=".repeat(50));
}

fn mark(ok: bool) -> &'static str {
    if ok {
        "✓"
    } else {
        "✗"
    }
}

/// Returns false when the command ran but the node is not in the wanted state
async fn run(cli: &Cli) -> anyhow::Result<bool> {
    let path = NodeConfig::resolve_path(cli.config.as_deref());
    let config = NodeConfig::load_or_default(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    let node = Node::new(config)?;
    let json = cli.output == OutputFormat::Json;

    match &cli.command {
        Commands::Status => {
            let status = node.probe().check_service_status().await;
            let (port, protocol) = node.probe().get_config_port_protocol().await;
            let port_open = node.probe().check_port_listening(port, &protocol).await;

            if json {
                print_json(&serde_json::json!({
                    "status": status,
                    "port": port,
                    "protocol": protocol,
                    "port_open": port_open,
                }))?;
            } else {
                banner("OpenVPN Service Status");
                println!("Running:      {}", status.running);
                println!("Enabled:      {}", status.enabled);
                println!("Active State: {}", status.active_state);
                if let Some(error) = &status.error {
                    println!("Error:        {}", error);
                }
                println!();
                println!("Port:         {}", port);
                println!("Protocol:     {}", protocol);
                println!("Port Open:    {}", port_open);
            }
            Ok(true)
        }
        Commands::Health => {
            let report = node.monitor().health_check().await;
            if json {
                print_json(&report)?;
            } else {
                banner("OpenVPN Health Check");
                println!(
                    "Overall Health: {}",
                    if report.healthy { "✓ HEALTHY" } else { "✗ UNHEALTHY" }
                );
                println!();
                println!("Service Running:   {}", mark(report.service_running));
                println!("Port Listening:    {}", mark(report.port_listening));
                println!("Config Valid:      {}", mark(report.config_valid));
                if report.issues.is_empty() {
                    println!("\nNo issues found!");
                } else {
                    println!("\nIssues Found: {}", report.issues.len());
                    for (i, issue) in report.issues.iter().enumerate() {
                        println!("  {}. {}", i + 1, issue);
                    }
                }
            }
            Ok(report.healthy)
        }
        Commands::Fix => {
            let result = node.monitor().auto_fix_and_restart().await;
            if json {
                print_json(&result)?;
            } else {
                banner("OpenVPN Auto-Fix");
                if !result.errors_detected.is_empty() {
                    println!("Errors Detected: {}", result.errors_detected.len());
                    for defect in &result.errors_detected {
                        println!("  - {}", defect.message);
                    }
                    println!();
                }
                if !result.fixes_applied.is_empty() {
                    println!("Fixes Applied: {}", result.fixes_applied.len());
                    for fix in &result.fixes_applied {
                        println!("  - {}", fix);
                    }
                    println!();
                }
                println!("Service Running: {}", mark(result.service_running));
                println!("Port Open:       {}", mark(result.port_open));
                println!();
                if result.success {
                    println!("✓ SUCCESS: OpenVPN is now running correctly!");
                } else {
                    println!("✗ FAILED: OpenVPN still has issues");
                    println!(
                        "Check logs for more details: journalctl -u {} -n 50",
                        node.probe().service_name()
                    );
                }
            }
            Ok(result.success)
        }
        Commands::Restart => {
            let restarted = node.probe().restart_service().await;
            if json {
                print_json(&serde_json::json!({ "restarted": restarted }))?;
            } else if restarted {
                println!("✓ Service restarted");
            } else {
                println!("✗ Service restart failed");
            }
            Ok(restarted)
        }
        Commands::Logs { lines } => {
            let logs = node.probe().get_service_logs(*lines).await?;
            if json {
                let lines: Vec<&str> = logs.lines().collect();
                print_json(&lines)?;
            } else {
                print!("{}", logs);
            }
            Ok(true)
        }
        Commands::Errors => {
            let defects = node.monitor().config_defects().await;
            if json {
                print_json(&defects)?;
            } else if defects.is_empty() {
                println!("No configuration errors detected!");
            } else {
                banner("Detected Configuration Errors");
                for (i, defect) in defects.iter().enumerate() {
                    println!("{}. [{:?}] {}", i + 1, defect.severity, defect.message);
                    if let Some(log) = &defect.evidence {
                        let excerpt: String = log.chars().take(100).collect();
                        println!("   Log: {}", excerpt);
                    }
                }
            }
            Ok(defects.is_empty())
        }
        Commands::User(cmd) => run_user(&node, cmd, json).await,
        Commands::Settings(SettingsCommands::Set { port, proto, address }) => {
            let change = TunnelSettings {
                tunnel_address: address.clone(),
                protocol: proto.clone(),
                port: *port,
            };
            node.change_config(&change).await?;
            if json {
                print_json(&change)?;
            } else {
                println!("✓ Settings applied and service restarted");
            }
            Ok(true)
        }
    }
}

async fn run_user(node: &Node, cmd: &UserCommands, json: bool) -> anyhow::Result<bool> {
    match cmd {
        UserCommands::Add { name } => {
            let outcome = node.users().create_user(name).await?;
            if json {
                print_json(&serde_json::json!({ "name": name, "outcome": outcome }))?;
            } else {
                match outcome {
                    CreateOutcome::Created => println!("✓ User '{}' created", name),
                    CreateOutcome::AlreadyExists => println!("User '{}' already exists", name),
                }
            }
            Ok(true)
        }
        UserCommands::Remove { name } => {
            let outcome = node.users().delete_user(name).await?;
            let deleted = outcome == DeleteOutcome::Deleted;
            if json {
                print_json(&serde_json::json!({ "name": name, "deleted": deleted }))?;
            } else if deleted {
                println!("✓ User '{}' revoked", name);
            } else {
                println!("✗ User '{}' not found", name);
            }
            Ok(deleted)
        }
        UserCommands::Profile { name } => {
            let path = node.users().download_profile(name).await?;
            if json {
                print_json(&serde_json::json!({ "name": name, "profile": path }))?;
            } else {
                println!("{}", path.display());
            }
            Ok(true)
        }
    }
}
