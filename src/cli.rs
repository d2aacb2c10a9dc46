use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::logging::LogFormat;

#[derive(Parser)]
#[command(name = "panelvault")]
#[command(about = "Local-first comic project store: manifest, search index, preview cache and sync", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    /// Project root (directory holding manifest.json)
    #[arg(short, long, global = true, default_value = ".")]
    pub(crate) root: PathBuf,

    /// Config file (default: <root>/panelvault.json)
    #[arg(long, global = true)]
    pub(crate) config: Option<PathBuf>,

    /// Raise log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub(crate) log_format: LogFormat,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub(crate) json: bool,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Create a new project at --root.
    Init {
        #[arg(long)]
        name: String,
    },

    /// Print the project summary (or the whole document with --json).
    Show,

    /// Save the manifest, backing up the previous version.
    Save {
        /// Replace the document with this JSON file before saving
        #[arg(long)]
        from: Option<PathBuf>,
    },

    /// Save the project under a new root.
    SaveAs { new_root: PathBuf },

    /// Write a crash-recovery copy of the current document.
    Autosave,

    /// List manifest backups and crash snapshots.
    Backups {
        /// Keep only the newest N backups
        #[arg(long)]
        prune: Option<usize>,
    },

    #[command(subcommand)]
    Index(IndexCommand),

    /// Full-text search with filters.
    Search {
        #[command(flatten)]
        query: SearchArgs,
        /// Query the sync server's published index instead of the local one
        #[arg(long)]
        remote: bool,
        #[arg(long)]
        project: Option<String>,
    },

    /// Documents referencing a doc id (or a path with --path).
    WhereUsed {
        target: String,
        #[arg(long)]
        path: bool,
    },

    #[command(subcommand)]
    Preview(PreviewCommand),

    #[command(subcommand)]
    Snapshot(SnapshotCommand),

    #[command(subcommand)]
    Sync(SyncCommand),

    /// Run the sync server.
    Serve {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        workers: Option<usize>,
    },

    #[command(subcommand)]
    Admin(AdminCommand),
}

#[derive(Subcommand)]
pub(crate) enum IndexCommand {
    /// Drop and re-derive every search row from the manifest.
    Rebuild,
    /// Schema version, row counts and freshness.
    Status,
    /// Integrity check; quarantines and rebuilds a damaged index.
    Check,
}

#[derive(Args, Debug, Default)]
pub(crate) struct SearchArgs {
    pub(crate) text: Option<String>,
    #[arg(long)]
    pub(crate) character: Option<String>,
    #[arg(long)]
    pub(crate) scene: Option<String>,
    /// Required tag (repeatable; all must match)
    #[arg(long = "tag")]
    pub(crate) tags: Vec<String>,
    /// Allowed document type (repeatable)
    #[arg(long = "type")]
    pub(crate) types: Vec<String>,
    #[arg(long)]
    pub(crate) page_from: Option<i64>,
    #[arg(long)]
    pub(crate) page_to: Option<i64>,
    #[arg(short = 'n', long)]
    pub(crate) limit: Option<usize>,
    #[arg(long)]
    pub(crate) offset: Option<usize>,
}

#[derive(Args, Debug)]
pub(crate) struct PreviewKeyArgs {
    #[arg(long)]
    pub(crate) page: String,
    #[arg(long)]
    pub(crate) panel: Option<String>,
    /// thumbnail or geometry-cache
    #[arg(long, default_value = "thumbnail")]
    pub(crate) kind: String,
    #[arg(long)]
    pub(crate) width: u32,
    #[arg(long)]
    pub(crate) height: u32,
}

#[derive(Subcommand)]
pub(crate) enum PreviewCommand {
    /// Write a cached blob to --out.
    Get {
        #[command(flatten)]
        key: PreviewKeyArgs,
        #[arg(long)]
        out: PathBuf,
        /// On a miss, cache this file's bytes and return them
        #[arg(long)]
        fill_from: Option<PathBuf>,
    },
    /// Store --file under the key.
    Put {
        #[command(flatten)]
        key: PreviewKeyArgs,
        #[arg(long)]
        file: PathBuf,
    },
    /// Drop every cached entry of a page.
    Invalidate {
        #[arg(long)]
        page: String,
    },
    Stats,
}

#[derive(Args, Debug)]
pub(crate) struct SubjectArgs {
    #[arg(long, conflicts_with = "script", required_unless_present = "script")]
    pub(crate) page: Option<String>,
    #[arg(long)]
    pub(crate) script: Option<String>,
}

#[derive(Subcommand)]
pub(crate) enum SnapshotCommand {
    /// Append a snapshot; the payload defaults to the subject's current JSON.
    Record {
        #[command(flatten)]
        subject: SubjectArgs,
        #[arg(long)]
        file: Option<PathBuf>,
    },
    List {
        #[command(flatten)]
        subject: SubjectArgs,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Newest snapshot of a subject.
    Latest {
        #[command(flatten)]
        subject: SubjectArgs,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Show {
        id: i64,
        /// Write the payload here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Prune {
        #[command(flatten)]
        subject: SubjectArgs,
        #[arg(long)]
        keep: usize,
    },
}

#[derive(Subcommand)]
pub(crate) enum SyncCommand {
    /// Queue a local mutation for the next push.
    Record {
        #[arg(long)]
        op_type: String,
        #[arg(long)]
        entity_type: String,
        #[arg(long)]
        entity_id: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        #[arg(long)]
        project: Option<String>,
    },
    /// Push pending ops, then pull until caught up.
    Reconcile {
        #[arg(long)]
        project: Option<String>,
    },
    /// Push pending ops only.
    Push {
        #[arg(long)]
        project: Option<String>,
    },
    /// Fetch ops after a version without touching local state.
    Pull {
        #[arg(long)]
        project: Option<String>,
        #[arg(long, default_value_t = 0)]
        since: i64,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Projects visible to the configured token.
    Projects,
    /// Upload the local projection as the project's derived index.
    PublishIndex {
        #[arg(long)]
        project: Option<String>,
    },
    /// Download the latest derived index snapshot.
    FetchIndex {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub(crate) enum AdminCommand {
    /// Create a project in the server database.
    CreateProject {
        #[arg(long)]
        name: String,
        #[arg(long)]
        id: Option<String>,
        /// Actor allowed to sync the project (repeatable)
        #[arg(long = "member")]
        members: Vec<String>,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Mint a bearer token for an actor.
    IssueToken {
        #[arg(long)]
        actor: String,
        /// Register this token instead of generating one
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Let an actor see and sync a project.
    AddMember {
        #[arg(long)]
        project: String,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        db: Option<PathBuf>,
    },
}
