//! Command-line surface for the router binary.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Hierarchical MCP router.
///
/// Exposes two meta-tools (`get_tools_in_category`, `execute_tool`) over a
/// browsable tree of categories, and lazily connects downstream MCP servers
/// the first time one of their tools is executed.
#[derive(Parser, Debug)]
#[command(name = "canopy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to the JSON config file.
    #[arg(long, value_name = "PATH", default_value = "config.json", env = "CANOPY_CONFIG")]
    pub config: PathBuf,

    /// Hierarchy directory; overrides the config file's `router.hierarchy`.
    #[arg(long, value_name = "DIR")]
    pub hierarchy: Option<PathBuf>,

    /// Serve over streamable HTTP at this address instead of stdio.
    ///
    /// Example: --http 127.0.0.1:30437
    #[arg(long, value_name = "ADDR")]
    pub http: Option<SocketAddr>,

    /// Disable `${VAR}` environment expansion in the config file.
    #[arg(long)]
    pub no_expand_env: bool,

    /// List hierarchy node paths and exit.
    #[arg(long)]
    pub list_paths: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Introspect configured MCP servers and write a hierarchy directory.
    Generate {
        /// Output directory for the generated hierarchy.
        #[arg(long, value_name = "DIR", default_value = "mcp_hierarchy")]
        output: PathBuf,
    },
    /// Rebuild branch and root files from an existing hierarchy directory.
    Regenerate {
        /// Hierarchy directory to re-index.
        #[arg(long, value_name = "DIR", default_value = "mcp_hierarchy")]
        dir: PathBuf,
    },
}
