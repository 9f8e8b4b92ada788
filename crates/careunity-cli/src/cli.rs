use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "careunity")]
#[command(about = "Record care data offline and sync it with the CareUnity API")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local store file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional path to sync config JSON
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Record and inspect queued changes
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Push queued changes to the server now
    Sync,
    /// Keep syncing in the foreground until interrupted
    Watch,
    /// Show queue, conflict and connectivity status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and resolve sync conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Inspect the local entity cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Show effective sync configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum QueueAction {
    Create,
    Update,
    Delete,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ConflictChoice {
    UseClient,
    UseServer,
    Merge,
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Record a local change (e.g. `queue add update visit v1 '{"status":"started"}'`)
    Add {
        #[arg(value_enum)]
        action: QueueAction,
        /// Entity type (visit, care-plan, note, check-in, incident, task)
        entity_type: String,
        /// Entity id; required for update and delete
        id: Option<String>,
        /// Fields as a JSON object
        #[arg(long, value_name = "JSON")]
        fields: Option<String>,
    },
    /// List queued operations
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Give failed operations another retry budget
    Retry,
    /// Drop a queued operation
    Discard {
        /// Operation id
        id: String,
    },
}

#[derive(Subcommand)]
pub enum ConflictCommands {
    /// List conflicts awaiting a decision
    List {
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a pending conflict
    Resolve {
        /// Conflict id
        id: String,
        #[arg(value_enum)]
        choice: ConflictChoice,
        /// Merged fields as a JSON object (with `merge`)
        #[arg(long, value_name = "JSON")]
        fields: Option<String>,
    },
    /// Delete resolved conflicts
    Prune {
        /// Age in days (configured retention when omitted)
        #[arg(long, value_name = "DAYS")]
        older_than_days: Option<u64>,
    },
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Show cached entities of a type
    Show {
        /// Entity type
        entity_type: String,
        /// Only this entity
        id: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Drop cached entities of a type
    Clear {
        /// Entity type
        entity_type: String,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration as JSON
    Show,
    /// Print the config file location
    Path,
}
