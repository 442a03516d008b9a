//! # Toolsmith CLI Module
//!
//! ## Available Commands
//!
//! - `compose` - Validate, compile (or reuse) and record a manifest
//! - `check` - Validate a manifest and show its hash and IO contract
//! - `expand` - Print the generated program for a manifest
//! - `primitives` - List the primitive catalog
//! - `grammar` - Print a GBNF grammar for manifests over the catalog
//! - `tools` - Inspect and prune the build cache
//! - `inspect` - Read the metadata trailer of a compiled tool
//! - `memory` - Search, show, relate and sync recorded tools; record and
//!   resolve notes
//! - `serve` - Run the memory server
//!
//! `--machine` switches every command to JSON on stdout:
//! `{"status": "ok", ...}` or `{"status": "error", "error": {...}}`.

mod commands;

use crate::config::Config;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use toolsmith_core::ToolsmithError;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Toolsmith - compose primitive graphs into native tools
///
/// Manifests are compiled once per content hash and remembered with the
/// goal and tags they were built for.
#[derive(Parser, Debug)]
#[command(name = "toolsmith")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Root directory for the build cache and tool memory
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    /// JSON output on stdout (for programmatic access)
    #[arg(long, global = true)]
    pub machine: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile a manifest, reusing the cached binary when it exists
    Compose {
        /// Manifest file, or "-" for stdin
        manifest: PathBuf,

        /// What the tool is for (recorded in memory)
        #[arg(short, long)]
        goal: Option<String>,

        /// Comma-separated tags
        #[arg(short, long, value_delimiter = ',')]
        tags: Vec<String>,

        /// Do not write to tool memory
        #[arg(long)]
        no_record: bool,

        /// Also copy the binary here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a manifest without compiling it
    Check {
        /// Manifest file, or "-" for stdin
        manifest: PathBuf,
    },

    /// Print the program generated for a manifest
    Expand {
        /// Manifest file, or "-" for stdin
        manifest: PathBuf,
    },

    /// List the primitive catalog
    Primitives,

    /// Print a GBNF grammar that only admits manifests over the catalog
    Grammar,

    /// Manage the build cache
    Tools {
        #[command(subcommand)]
        action: ToolsAction,
    },

    /// Show the metadata embedded in a compiled tool
    Inspect {
        binary: PathBuf,
    },

    /// Query and maintain tool memory
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },

    /// Run the memory server
    Serve {
        /// Host to bind to
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to
        #[arg(short, long, default_value = "7878")]
        port: u16,

        /// Server database (default: <home>/server.redb)
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

/// `toolsmith tools ...`
#[derive(Subcommand, Debug)]
pub enum ToolsAction {
    /// List cached tools
    List,
    /// Show one cached tool by app name or hash prefix
    Info { key: String },
    /// Remove cached tools by app name or hash prefix
    Forget { key: String },
    /// Remove every cached tool
    Clear,
}

/// `toolsmith memory ...`
#[derive(Subcommand, Debug)]
pub enum MemoryAction {
    /// Keyword search over goals, tags, app names and patterns
    Search {
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,

        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Show a record and its manifest
    Show { prefix: String },
    /// Tools related to one record
    Related {
        prefix: String,

        #[arg(short, long, default_value = "1")]
        depth: usize,
    },
    /// Relate two tools: variant_of, pipes_to, supersedes, ...
    Relate {
        from: String,
        to: String,
        label: String,

        /// Free text kept on the relation
        #[arg(long, default_value = "")]
        note: String,
    },
    /// Attach a goal and tags to a cached tool
    Record {
        /// App name or hash prefix
        key: String,

        #[arg(short, long)]
        goal: Option<String>,

        #[arg(short, long, value_delimiter = ',')]
        tags: Vec<String>,
    },
    /// Most recently used tools
    Log {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Record a note; the same kind and summary update one note
    Note {
        summary: String,

        #[arg(default_value = "")]
        detail: String,

        /// discovery, decision, pattern or issue
        #[arg(short, long, default_value = "discovery")]
        kind: String,

        /// Where the note applies (a project, a tool, a task)
        #[arg(short, long, default_value = "")]
        context: String,

        #[arg(short, long, value_delimiter = ',')]
        tags: Vec<String>,
    },
    /// List notes, newest first, or rank them with --query
    Notes {
        #[arg(short, long)]
        kind: Option<String>,

        #[arg(short, long)]
        context: Option<String>,

        #[arg(short, long)]
        query: Option<String>,

        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Change a note's status: active, resolved or superseded
    Resolve {
        /// Note hash prefix
        hash: String,

        #[arg(short, long, default_value = "resolved")]
        status: String,
    },
    /// Re-publish all local records, relations and notes to the remote memory
    Sync,
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), ToolsmithError> {
    let config = Config::load(cli.config.as_deref(), cli.home.as_deref())?;
    let out = Output::new(cli.machine);

    match cli.command {
        Commands::Compose {
            manifest,
            goal,
            tags,
            no_record,
            output,
        } => {
            with_session(config, move |s| {
                cmd_compose(s, &manifest, goal, tags, !no_record, output.as_deref(), out)
            })
            .await
        }
        Commands::Check { manifest } => {
            with_session(config, move |s| cmd_check(s, &manifest, out)).await
        }
        Commands::Expand { manifest } => {
            with_session(config, move |s| cmd_expand(s, &manifest, out)).await
        }
        Commands::Primitives => cmd_primitives(out),
        Commands::Grammar => cmd_grammar(out),
        Commands::Tools { action } => {
            with_session(config, move |s| cmd_tools(s, action, out)).await
        }
        Commands::Inspect { binary } => cmd_inspect(&binary, out),
        Commands::Memory { action } => {
            let timeout = config.remote_timeout();
            with_session(config, move |s| cmd_memory(s, action, timeout, out)).await
        }
        Commands::Serve { host, port, db } => {
            let db = db.unwrap_or_else(|| config.home().join("server.redb"));
            cmd_serve(&host, port, &db, out).await
        }
    }
}
