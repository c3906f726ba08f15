//! CLI module for podweave
//!
//! Provides kubectl-like subcommands:
//! - `podweave plan` - Show the units a flow manifest expands to
//! - `podweave deploy` - Deploy a flow to the current context
//! - `podweave teardown` - Delete every unit of a flow
//! - `podweave routes` - Print the routing table of a flow
//! - `podweave context` - Manage cluster contexts

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

#[derive(Parser, Debug)]
#[command(name = "podweave")]
#[command(about = "Deploy sharded processing pods as ordered Kubernetes topologies")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to config file (default: ~/.podweave/config)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to a .env file providing variables for manifest expansion
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the units a flow expands to, without cluster access
    Plan(ManifestArgs),

    /// Deploy a flow to the current context
    Deploy(DeployArgs),

    /// Delete every unit of a flow, in reverse start order
    Teardown(TeardownArgs),

    /// Print the routing table of a flow as JSON
    Routes(ManifestArgs),

    /// Manage cluster contexts
    Context(ContextArgs),
}

/// A command that only reads a manifest
#[derive(Parser, Debug)]
pub struct ManifestArgs {
    /// Path to the flow manifest (JSON or YAML)
    pub file: PathBuf,
}

/// Arguments for the deploy command
#[derive(Parser, Debug)]
pub struct DeployArgs {
    /// Path to the flow manifest (JSON or YAML)
    pub file: PathBuf,

    /// Create every unit first and wait for readiness afterwards
    #[arg(long)]
    pub noblock: bool,

    /// Readiness deadline per unit, in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Start the shards of a pod concurrently
    #[arg(long)]
    pub parallel_shards: bool,

    /// Run against an in-memory cluster instead of the current context
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the teardown command
#[derive(Parser, Debug)]
pub struct TeardownArgs {
    /// Path to the flow manifest (JSON or YAML)
    pub file: PathBuf,

    /// Show what would be deleted without contacting the cluster
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the context command
#[derive(Parser, Debug)]
pub struct ContextArgs {
    #[command(subcommand)]
    pub action: ContextAction,
}

#[derive(Subcommand, Debug)]
pub enum ContextAction {
    /// List all contexts
    List,

    /// Show current context
    Current,

    /// Switch to a context
    Use {
        /// Context name
        name: String,
    },

    /// Add or replace a context
    Set {
        /// Context name
        name: String,

        /// API server URL
        #[arg(long)]
        server: String,

        /// Bearer token
        #[arg(long, env = "PODWEAVE_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// File holding the bearer token
        #[arg(long, conflicts_with = "token")]
        token_file: Option<PathBuf>,

        /// PEM CA bundle of the API server
        #[arg(long)]
        ca_file: Option<PathBuf>,

        /// Skip server certificate verification
        #[arg(long)]
        insecure_skip_tls_verify: bool,
    },

    /// Delete a context
    Delete {
        /// Context name
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_deploy() {
        let cli = Cli::parse_from(["podweave", "deploy", "flow.yml"]);
        match cli.command {
            Commands::Deploy(args) => {
                assert_eq!(args.file, PathBuf::from("flow.yml"));
                assert!(!args.noblock);
                assert!(args.timeout.is_none());
                assert!(!args.dry_run);
            }
            _ => panic!("Expected Deploy command"),
        }
    }

    #[test]
    fn test_parse_deploy_flags() {
        let cli = Cli::parse_from([
            "podweave",
            "deploy",
            "flow.json",
            "--noblock",
            "--timeout",
            "120",
            "--parallel-shards",
            "--dry-run",
        ]);
        match cli.command {
            Commands::Deploy(args) => {
                assert!(args.noblock);
                assert_eq!(args.timeout, Some(120));
                assert!(args.parallel_shards);
                assert!(args.dry_run);
            }
            _ => panic!("Expected Deploy command"),
        }
    }

    #[test]
    fn test_parse_plan_and_routes() {
        let cli = Cli::parse_from(["podweave", "plan", "flow.yml"]);
        assert!(matches!(cli.command, Commands::Plan(_)));
        let cli = Cli::parse_from(["podweave", "routes", "flow.yml"]);
        assert!(matches!(cli.command, Commands::Routes(_)));
    }

    #[test]
    fn test_parse_context_use() {
        let cli = Cli::parse_from(["podweave", "context", "use", "staging"]);
        match cli.command {
            Commands::Context(args) => match args.action {
                ContextAction::Use { name } => {
                    assert_eq!(name, "staging");
                }
                _ => panic!("Expected Use action"),
            },
            _ => panic!("Expected Context command"),
        }
    }

    #[test]
    fn test_parse_context_set() {
        let cli = Cli::parse_from([
            "podweave",
            "context",
            "set",
            "staging",
            "--server",
            "https://10.0.0.1:6443",
            "--ca-file",
            "/etc/ca.crt",
        ]);
        match cli.command {
            Commands::Context(args) => match args.action {
                ContextAction::Set {
                    name,
                    server,
                    ca_file,
                    ..
                } => {
                    assert_eq!(name, "staging");
                    assert_eq!(server, "https://10.0.0.1:6443");
                    assert_eq!(ca_file, Some(PathBuf::from("/etc/ca.crt")));
                }
                _ => panic!("Expected Set action"),
            },
            _ => panic!("Expected Context command"),
        }
    }

    #[test]
    fn test_verbose_global() {
        let cli = Cli::parse_from(["podweave", "-vvv", "context", "list"]);
        assert_eq!(cli.verbose, 3);
    }
}
