//! tablet-sync: offline mirror of a tablet's documents.
//!
//! Talks to the tablet over its USB web interface, keeps a named session of
//! snapshots on disk and downloads what changed since the last sync.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tablet_sync::config::{validate_url, Config};
use tablet_sync::{HttpRemote, NativeFs};
use tablet_sync_core::download::{DownloadOptions, EntryStatus, Outcome};
use tablet_sync_core::filter::{self, And, Filter};
use tablet_sync_core::{ChangeKind, ChangeSet, NodeKind, Session, SessionStore, SyncOptions, TabletSync};

type Client = TabletSync<HttpRemote, NativeFs>;

#[derive(Parser, Debug)]
#[command(name = "tablet-sync")]
#[command(about = "Offline sync of a tablet's documents over its USB web interface")]
struct Args {
    /// Session name; state is kept in <workdir>/<name>.session
    #[arg(long, global = true, default_value = "default")]
    session: String,

    /// Directory holding session files (overrides TABLET_SYNC_DIR)
    #[arg(long, global = true)]
    workdir: Option<PathBuf>,

    /// Device base URL (overrides TABLET_SYNC_URL)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Probe timeout in milliseconds (overrides TABLET_SYNC_TIMEOUT_MS)
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check whether the device answers
    Status,
    /// Wait until the device answers
    Wait {
        /// Give up after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
    /// Capture the device tree and report what changed
    Sync,
    /// Show changes between the last two syncs without contacting the device
    Changes,
    /// Print the stored tree
    Ls {
        /// Only bookmarked nodes and their ancestors
        #[arg(long)]
        bookmarked: bool,
    },
    /// Download documents into DEST
    Download(DownloadArgs),
}

#[derive(clap::Args, Debug)]
struct DownloadArgs {
    /// Destination directory
    dest: PathBuf,

    /// Only what changed between the last two syncs
    #[arg(long)]
    changes: bool,

    /// Only bookmarked documents
    #[arg(long)]
    bookmarked: bool,

    /// Glob over the device path (`*`, `**`, `?`)
    #[arg(long)]
    path: Option<String>,

    /// Only nodes of this kind
    #[arg(long, value_enum)]
    kind: Option<KindArg>,

    /// Skip unchanged nodes
    #[arg(long)]
    changed_only: bool,

    /// Delete local copies of documents removed from the device
    #[arg(long)]
    prune: bool,

    /// Simultaneous downloads (1-4)
    #[arg(long, default_value_t = 2)]
    concurrency: usize,

    /// A matching collection brings everything below it
    #[arg(long)]
    include_descendants: bool,

    /// Do not append .pdf to file names
    #[arg(long)]
    no_extension: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Document,
    Collection,
}

impl From<KindArg> for NodeKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Document => NodeKind::Document,
            KindArg::Collection => NodeKind::Collection,
        }
    }
}

impl DownloadArgs {
    fn filter(&self) -> Result<And> {
        let mut filters: Vec<Box<dyn Filter>> = Vec::new();
        if self.bookmarked {
            filters.push(Box::new(filter::bookmarked()));
        }
        if let Some(pattern) = &self.path {
            filters.push(Box::new(filter::path_matches(pattern)?));
        }
        if let Some(kind) = self.kind {
            filters.push(Box::new(filter::kind_is(kind.into())));
        }
        if self.changed_only {
            filters.push(Box::new(filter::changed_only()));
        }
        Ok(And::new(filters))
    }

    fn options(&self) -> DownloadOptions {
        DownloadOptions {
            concurrency: self.concurrency,
            prune: self.prune,
            extension: (!self.no_extension).then(|| "pdf".to_string()),
            include_descendants: self.include_descendants,
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = Config::from_env().context("Invalid environment configuration")?;
    if let Some(url) = &args.url {
        config.base_url = validate_url(url)?;
    }
    if let Some(workdir) = &args.workdir {
        config.workdir = workdir.clone();
    }
    if let Some(ms) = args.timeout_ms {
        config.probe_timeout = Duration::from_millis(ms.max(1));
    }
    Ok(config)
}

fn print_changes(changes: &ChangeSet, session: &Session) {
    for entry in changes.entries() {
        if entry.kind == ChangeKind::Unchanged && !entry.moved && !entry.renamed {
            continue;
        }
        let snapshot = match entry.kind {
            ChangeKind::Removed => session.previous.as_ref(),
            _ => session.current.as_ref(),
        };
        let path = snapshot
            .and_then(|s| s.resolve_path(&entry.id).ok())
            .map(|names| names.join("/"))
            .unwrap_or_else(|| entry.id.to_string());
        let moved = if entry.moved { " (moved)" } else { "" };
        let renamed = if entry.renamed { " (renamed)" } else { "" };
        println!("{:<9} {}{}{}", entry.kind, path, moved, renamed);
    }
    println!("{}", changes.summary());
}

/// Absolute form of `dest`. Nothing is created here; the download engine
/// makes the directory and reports when it cannot.
fn resolve_destination(dest: &Path) -> Result<String> {
    let absolute = std::path::absolute(dest)
        .with_context(|| format!("Cannot resolve {}", dest.display()))?;
    Ok(absolute.to_string_lossy().to_string())
}

async fn download(client: &mut Client, args: &DownloadArgs) -> Result<ExitCode> {
    let filter = args.filter()?;
    let options = args.options();

    let destination = resolve_destination(&args.dest)?;

    let report = if args.changes {
        client.download_changes(&destination, &filter, &options).await?
    } else {
        client.download_tree(&destination, &filter, &options).await?
    };

    for entry in &report.entries {
        match &entry.status {
            EntryStatus::Downloaded { bytes } => println!("downloaded {} ({} bytes)", entry.path, bytes),
            EntryStatus::Failed { error } => println!("failed     {}: {}", entry.path, error),
            EntryStatus::Cancelled => println!("cancelled  {}", entry.path),
            EntryStatus::Removed { pruned: true } => println!("pruned     {}", entry.path),
            EntryStatus::Removed { pruned: false } => println!("removed    {}", entry.path),
            EntryStatus::Skipped(_) => {}
        }
    }
    println!("{} ({} bytes)", report.counts(), report.bytes);

    Ok(match report.outcome() {
        Outcome::Completed => ExitCode::SUCCESS,
        Outcome::PartialFailure { failed } => {
            warn!("{} document(s) were not downloaded", failed);
            ExitCode::from(2)
        }
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,tablet_sync=debug,tablet_sync_core=debug"
    } else {
        "info,tablet_sync=info,tablet_sync_core=info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&args)?;
    info!("Device: {}", config.base_url);
    info!("Sessions: {}", config.workdir.display());

    let remote = HttpRemote::new(&config.base_url, config.probe_timeout)?;
    let mut options = SyncOptions::default();
    if let Command::Wait { timeout_secs } = &args.command {
        options.wait.timeout = Duration::from_secs(*timeout_secs);
    }

    let store = SessionStore::new(NativeFs::new(&config.workdir));
    let mut client = TabletSync::open(remote, NativeFs::new("/"), store, &args.session, options)
        .await
        .with_context(|| format!("Cannot open session {:?}", args.session))?;

    match &args.command {
        Command::Status => {
            if client.is_device_connected().await {
                println!("connected ({})", config.base_url);
            } else {
                println!("not connected ({})", config.base_url);
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Wait { .. } => {
            client.wait_device_connection().await?;
            println!("connected ({})", config.base_url);
        }
        Command::Sync => {
            let changes = client.get_changes().await?;
            print_changes(&changes, client.session());
        }
        Command::Changes => {
            let changes = client.changes()?;
            print_changes(&changes, client.session());
        }
        Command::Ls { bookmarked } => {
            if client.current().is_none() {
                client.sync_file_system().await?;
            }
            let Some(current) = client.current() else {
                anyhow::bail!("No snapshot available");
            };
            if *bookmarked {
                print!("{}", current.bookmarked_view()?.display_tree());
            } else {
                print!("{}", current.display_tree());
            }
        }
        Command::Download(download_args) => {
            return download(&mut client, download_args).await;
        }
    }

    Ok(ExitCode::SUCCESS)
}
