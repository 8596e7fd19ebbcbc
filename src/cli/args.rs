//! CLI argument definitions using clap derive

use crate::cache::ScopeKind;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

/// kcache - GPU kernel cache node agent
///
/// Extracts kernel caches declared for the cluster into node-local
/// storage, tracks their mounts and reports per-node status.
#[derive(Parser, Debug)]
#[command(name = "kcache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "KCACHE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the reconcile loops until interrupted
    Agent(AgentArgs),

    /// Run a single reconcile pass and print its outcome
    Reconcile(ReconcileArgs),

    /// Inspect the cache database
    Cache(CacheArgs),

    /// Record or release mounts (the mount-server contract)
    Usage(UsageArgs),

    /// Manage cache declarations in the local cluster state
    Declare(DeclareArgs),

    /// Show node status records
    Status(StatusArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions {
        /// Target shell
        shell: Shell,
    },
}

/// Scope kind selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScopeArg {
    /// Namespace-bound caches
    Namespaced,
    /// Cluster-wide caches
    Cluster,
}

impl From<ScopeArg> for ScopeKind {
    fn from(arg: ScopeArg) -> Self {
        match arg {
            ScopeArg::Namespaced => ScopeKind::Namespaced,
            ScopeArg::Cluster => ScopeKind::Cluster,
        }
    }
}

/// Arguments for the agent command
#[derive(Parser, Debug)]
pub struct AgentArgs {
    /// Reconcile every scope until settled, then exit
    #[arg(long)]
    pub once: bool,
}

/// Arguments for the reconcile command
#[derive(Parser, Debug)]
pub struct ReconcileArgs {
    /// Only this scope kind (default: all configured)
    #[arg(short, long, value_enum)]
    pub scope: Option<ScopeArg>,
}

/// Output format for listings
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List extracted caches
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },
}

/// Arguments for the usage command
#[derive(Parser, Debug)]
pub struct UsageArgs {
    /// Subcommand for usage
    #[command(subcommand)]
    pub action: UsageAction,
}

/// Usage subcommands
#[derive(Subcommand, Debug)]
pub enum UsageAction {
    /// Record that a mount handle uses a cache
    Add {
        /// Cache name
        name: String,

        /// Content digest (algo:hex)
        digest: String,

        /// Mount handle
        handle: String,

        /// Namespace (omit for cluster scope)
        #[arg(short, long)]
        namespace: Option<String>,

        /// Size of the mounted volume in bytes
        #[arg(long, default_value_t = 0)]
        size: u64,
    },

    /// Release a mount handle
    Delete {
        /// Mount handle
        handle: String,
    },

    /// Show usage records
    Show {
        /// Only the record holding this handle
        handle: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },
}

/// Arguments for the declare command
#[derive(Parser, Debug)]
pub struct DeclareArgs {
    /// Subcommand for declare
    #[command(subcommand)]
    pub action: DeclareAction,
}

/// Declare subcommands
#[derive(Subcommand, Debug)]
pub enum DeclareAction {
    /// Create or update a declaration
    Apply {
        /// Cache name
        name: String,

        /// Image reference
        image: String,

        /// Namespace (omit for cluster scope)
        #[arg(short, long)]
        namespace: Option<String>,

        /// Admitted content digest
        #[arg(short, long)]
        digest: Option<String>,
    },

    /// Request deletion of a declaration
    Delete {
        /// Cache name
        name: String,

        /// Namespace (omit for cluster scope)
        #[arg(short, long)]
        namespace: Option<String>,
    },

    /// Drop deleted declarations no node still holds
    Prune,

    /// List declarations
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },
}

/// Arguments for the status command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Show records of every node
    #[arg(short, long)]
    pub all: bool,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_usage_add() {
        let cli = Cli::try_parse_from([
            "kcache", "usage", "add", "yellow", "sha256:aa", "vol-1", "-n", "ml", "--size", "10",
        ])
        .unwrap();
        match cli.command {
            Commands::Usage(UsageArgs {
                action: UsageAction::Add { namespace, size, .. },
            }) => {
                assert_eq!(namespace.as_deref(), Some("ml"));
                assert_eq!(size, 10);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn scope_arg_maps_to_kind() {
        let cli = Cli::try_parse_from(["kcache", "reconcile", "--scope", "cluster"]).unwrap();
        match cli.command {
            Commands::Reconcile(args) => {
                assert_eq!(args.scope.map(ScopeKind::from), Some(ScopeKind::Cluster))
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
