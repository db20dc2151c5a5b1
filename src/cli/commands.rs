//! CLI command definitions using clap.
//!
//! One subcommand per XenStore operation exposed on the command line, plus
//! `ls` (tree listing) and `watch` (event stream).

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// xenstore-client - talk to a XenStore daemon
#[derive(Parser, Debug)]
#[command(name = "xenstore-client")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the value stored at a path
    Read {
        path: String,
    },

    /// Store a value at a path
    Write {
        path: String,
        value: String,
    },

    /// Create a path and any missing parents
    Mkdir {
        path: String,
    },

    /// Remove a path and everything below it
    Rm {
        path: String,
    },

    /// Recursively list the tree below a path
    Ls {
        #[arg(default_value = "/")]
        path: String,

        /// Print nodes as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the permissions of a path
    Perms {
        path: String,
    },

    /// Replace the permissions of a path (owner entry first)
    SetPerms {
        path: String,

        /// Entries of the form [wrbn]<domid>
        #[arg(required = true)]
        perms: Vec<String>,
    },

    /// Print the base path of a domain
    DomainPath {
        domid: u32,
    },

    /// Print events for the given paths until the connection closes
    Watch {
        /// Paths to watch (including @introduceDomain and @releaseDomain)
        #[arg(required = true)]
        paths: Vec<String>,

        /// Token attached to every watch
        #[arg(short, long, default_value = "xenstore-client")]
        token: String,
    },
}
