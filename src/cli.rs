use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::operation::OperationKind;

#[derive(Parser, Debug)]
#[command(name = "vms", version, about = "Bulk lifecycle and snapshot operations on libvirt domains")]
pub struct Cli {
    /// libvirt connection URI (e.g. qemu:///system)
    #[arg(short = 'c', long = "connect", global = true)]
    pub connect: Option<String>,

    /// Path to config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Maximum number of domains operated on concurrently
    #[arg(short = 'j', long, global = true)]
    pub workers: Option<usize>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Table, global = true)]
    pub format: OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only print the final result
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Append debug logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Defaults to `list`
    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    /// The action asked for; a bare `vms` lists every domain.
    pub fn action(&self, description: &str) -> Action<'_> {
        match &self.command {
            Some(command) => command.action(description),
            None => Action::ListDomains(&[]),
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List domains, their state and guest time (default command)
    List {
        /// Domain names or glob patterns; none or `all` selects every domain
        patterns: Vec<String>,
    },

    /// Start domains (resumes paused ones)
    Start { patterns: Vec<String> },

    /// Shut domains down
    Stop {
        /// Power off immediately instead of requesting a guest shutdown
        #[arg(long)]
        force: bool,

        patterns: Vec<String>,
    },

    /// Pause running domains
    Pause { patterns: Vec<String> },

    /// Resume paused domains
    Resume { patterns: Vec<String> },

    /// Set the guest clock of running domains to the host time
    Synctime { patterns: Vec<String> },

    /// Delete domains with their snapshots and storage volumes
    Delete {
        /// Domain names or glob patterns; pass `all` to delete every domain
        #[arg(required = true)]
        patterns: Vec<String>,
    },

    /// Show the IP addresses of running domains
    Addresses { patterns: Vec<String> },

    /// Manage snapshots (lists them by default)
    Snapshot {
        #[command(subcommand)]
        action: Option<SnapshotCommand>,
    },
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommand {
    /// List snapshots of the selected domains
    List { patterns: Vec<String> },

    /// Create a snapshot named NAME on each domain
    Create { name: String, patterns: Vec<String> },

    /// Revert each domain to snapshot NAME
    Revert { name: String, patterns: Vec<String> },

    /// Delete snapshot NAME from each domain; a glob deletes every match
    Delete { name: String, patterns: Vec<String> },
}

/// What a parsed command asks for.
#[derive(Debug)]
pub enum Action<'a> {
    ListDomains(&'a [String]),
    ListSnapshots(&'a [String]),
    ListAddresses(&'a [String]),
    Batch(OperationKind, &'a [String]),
}

impl Command {
    /// Map the command onto an action. `description` is stored in snapshots
    /// created by `snapshot create`.
    pub fn action(&self, description: &str) -> Action<'_> {
        match self {
            Command::List { patterns } => Action::ListDomains(patterns),
            Command::Start { patterns } => Action::Batch(OperationKind::Start, patterns),
            Command::Stop { force, patterns } => {
                Action::Batch(OperationKind::Stop { force: *force }, patterns)
            }
            Command::Pause { patterns } => Action::Batch(OperationKind::Pause, patterns),
            Command::Resume { patterns } => Action::Batch(OperationKind::Resume, patterns),
            Command::Synctime { patterns } => Action::Batch(OperationKind::SyncTime, patterns),
            Command::Delete { patterns } => Action::Batch(OperationKind::Delete, patterns),
            Command::Addresses { patterns } => Action::ListAddresses(patterns),
            Command::Snapshot { action } => match action {
                None => Action::ListSnapshots(&[]),
                Some(SnapshotCommand::List { patterns }) => Action::ListSnapshots(patterns),
                Some(SnapshotCommand::Create { name, patterns }) => Action::Batch(
                    OperationKind::SnapshotCreate {
                        name: name.clone(),
                        description: description.to_string(),
                    },
                    patterns,
                ),
                Some(SnapshotCommand::Revert { name, patterns }) => Action::Batch(
                    OperationKind::SnapshotRevert { name: name.clone() },
                    patterns,
                ),
                Some(SnapshotCommand::Delete { name, patterns }) => Action::Batch(
                    OperationKind::SnapshotDelete { name: name.clone() },
                    patterns,
                ),
            },
        }
    }
}
