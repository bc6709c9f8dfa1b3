//! swarmsync: keep a directory identical across a user's devices
//!
//! - Fixed-size block chunking with BLAKE3 hashes
//! - Rolling-hash deltas for incremental edits
//! - Manifests published through a swarm, not pushed peer to peer
//! - Transfer/Overwrite choice when a device rejoins

mod debug_log;
mod progress;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use clap::builder::styling::{AnsiColor, Effects};
use clap::{Parser, Subcommand, ValueEnum, builder::Styles};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, bail};
use tracing::{debug, info, warn};

use swarmsync_coordinator::Coordinator;
use swarmsync_core::config::CONFIG_FILE;
use swarmsync_core::{
    Applier, BlockManifest, Chunker, Manifest, Snapshot, SyncConfig, detect, reconcile,
};
use swarmsync_node::{DecisionProvider, FixedDecision, JoinDecision, Node, SyncStatus};
use swarmsync_transport::{Coordination, DirectorySwarm, InboundListener, TcpRelay};

use crate::progress::{Status, Stopwatch, format_size, print_status, print_warning};

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "swarmsync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Keep a directory identical across your devices")]
#[command(long_about = r#"
swarmsync keeps one directory in sync across every device of a user.

Local edits are broadcast as compressed deltas. A device that comes back online
sends its block manifest to the most recently synchronized peer and receives only
the blocks that differ.

Examples:
  swarmsync local ./desktop ./laptop        Sync two directories on localhost
  swarmsync chunk ./project -o blocks.bin   Write a block manifest
  swarmsync detect ./before ./after -o p    Write a patch manifest
  swarmsync apply p ./replica               Apply a manifest
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a local swarm of devices, one per directory, until Ctrl+C
    Local {
        /// Device root directories; the directory name becomes the device id
        #[arg(required = true)]
        devices: Vec<PathBuf>,

        /// Config file supplying defaults for every device
        #[arg(short, long, default_value = CONFIG_FILE)]
        config: PathBuf,

        /// What a device does with its local state when it joins a live swarm
        #[arg(long, value_enum, default_value = "ask")]
        on_join: OnJoin,

        /// Directory the swarm stores published manifests in
        #[arg(long)]
        swarm_dir: Option<PathBuf>,

        /// Seconds between change-detection ticks
        #[arg(short, long)]
        interval: Option<u64>,

        #[arg(short, long)]
        block_size: Option<u64>,
    },

    /// Chunk a directory into a block manifest
    Chunk {
        root: PathBuf,

        #[arg(short, long)]
        block_size: Option<u64>,

        /// Write the encoded manifest here instead of printing a summary
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output format (json, summary)
        #[arg(short, long, default_value = "summary")]
        format: String,
    },

    /// Compare two directories and write the patch manifest turning one into the other
    Detect {
        before: PathBuf,
        after: PathBuf,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Write the block manifest that brings a remote chunk manifest up to a local root
    Reconcile {
        root: PathBuf,

        /// Encoded chunk manifest, as written by `chunk --output`
        remote: PathBuf,

        #[arg(short, long)]
        block_size: Option<u64>,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Apply a patch or block manifest to a directory
    Apply { manifest: PathBuf, root: PathBuf },

    /// Write a default config file
    Init {
        #[arg(default_value = CONFIG_FILE)]
        path: PathBuf,
    },

    /// Show version and build info
    Version,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OnJoin {
    Ask,
    Transfer,
    Overwrite,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let session = debug_log::init(cli.verbose);
    debug!(
        "Session {} logging to {}",
        session.session_id,
        session.log_path.display()
    );

    match cli.command {
        Commands::Version => {
            eprintln!("swarmsync {}", env!("CARGO_PKG_VERSION"));
            eprintln!("Built with Rust {}", env!("CARGO_PKG_RUST_VERSION"));
        }
        Commands::Init { path } => init_command(&path)?,
        Commands::Chunk {
            root,
            block_size,
            output,
            format,
        } => chunk_command(&root, block_size, output.as_deref(), &format)?,
        Commands::Detect {
            before,
            after,
            output,
        } => detect_command(&before, &after, &output)?,
        Commands::Reconcile {
            root,
            remote,
            block_size,
            output,
        } => reconcile_command(&root, &remote, block_size, &output)?,
        Commands::Apply { manifest, root } => apply_command(&manifest, &root)?,
        Commands::Local {
            devices,
            config,
            on_join,
            swarm_dir,
            interval,
            block_size,
        } => {
            let mut base = SyncConfig::load(&config)?;
            if let Some(interval) = interval {
                base.interval_in_seconds_check = interval;
            }
            if let Some(block_size) = block_size {
                base.block_size_in_bytes = block_size;
            }
            let swarm_dir =
                swarm_dir.unwrap_or_else(|| std::env::temp_dir().join("swarmsync-swarm"));
            local_command(base, &devices, on_join, &swarm_dir).await?;
        }
    }

    drop(session);
    Ok(())
}

fn block_size_or_default(block_size: Option<u64>) -> u64 {
    block_size.unwrap_or_else(|| SyncConfig::default().block_size_in_bytes)
}

fn init_command(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    SyncConfig::default().save(path)?;
    print_status(Status::WROTE, &path.display().to_string());
    Ok(())
}

fn chunk_command(
    root: &Path,
    block_size: Option<u64>,
    output: Option<&Path>,
    format: &str,
) -> Result<()> {
    let timer = Stopwatch::start();
    let manifest = Chunker::new(root, block_size_or_default(block_size))?.chunk()?;

    if let Some(output) = output {
        let encoded = manifest.encode()?;
        std::fs::write(output, &encoded)
            .wrap_err_with(|| format!("failed to write {}", output.display()))?;
        print_status(
            Status::WROTE,
            &format!("{} ({})", output.display(), format_size(encoded.len() as u64)),
        );
    } else if format == "json" {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
    }

    let total: u64 = manifest
        .files
        .values()
        .flatten()
        .filter(|block| !block.is_dir())
        .map(|block| block.length)
        .sum();
    timer.finish(
        Status::CHUNKED,
        &format!(
            "{} entries into {} blocks ({})",
            manifest.len(),
            manifest.block_count(),
            format_size(total)
        ),
    );
    Ok(())
}

fn detect_command(before: &Path, after: &Path, output: &Path) -> Result<()> {
    let timer = Stopwatch::start();
    let previous = Snapshot::capture(before)?;
    let current = Snapshot::capture(after)?;

    let Some(changes) = detect(&previous, &current)? else {
        print_status(Status::UNCHANGED, "no differences");
        return Ok(());
    };

    let summary = format!(
        "{} added, {} deleted, {} modified",
        changes.added.len(),
        changes.deleted.len(),
        changes.modified.len()
    );
    let encoded = Manifest::new(changes).encode()?;
    std::fs::write(output, &encoded)
        .wrap_err_with(|| format!("failed to write {}", output.display()))?;
    print_status(
        Status::WROTE,
        &format!("{} ({})", output.display(), format_size(encoded.len() as u64)),
    );
    timer.finish(Status::DETECTED, &summary);
    Ok(())
}

fn reconcile_command(
    root: &Path,
    remote: &Path,
    block_size: Option<u64>,
    output: &Path,
) -> Result<()> {
    let timer = Stopwatch::start();
    let encoded = std::fs::read(remote)
        .wrap_err_with(|| format!("failed to read {}", remote.display()))?;
    let remote = BlockManifest::decode(&encoded)?;
    let local = Chunker::new(root, block_size_or_default(block_size))?.chunk()?;

    let changes = reconcile(root, &local, &remote)?;
    let summary = format!(
        "{} added, {} deleted, {} blocks",
        changes.added.len(),
        changes.deleted.len(),
        changes.modified.len()
    );
    let document = Manifest::new(changes).encode()?;
    std::fs::write(output, &document)
        .wrap_err_with(|| format!("failed to write {}", output.display()))?;
    print_status(
        Status::WROTE,
        &format!("{} ({})", output.display(), format_size(document.len() as u64)),
    );
    timer.finish(Status::RECONCILED, &summary);
    Ok(())
}

fn apply_command(manifest: &Path, root: &Path) -> Result<()> {
    let timer = Stopwatch::start();
    let encoded = std::fs::read(manifest)
        .wrap_err_with(|| format!("failed to read {}", manifest.display()))?;
    let manifest = Manifest::decode(&encoded)?;
    std::fs::create_dir_all(root)?;

    let report = Applier::new(root).apply(&manifest.changes)?;
    for path in &report.skipped {
        print_warning("Skipped", path);
    }
    timer.finish(
        Status::APPLIED,
        &format!(
            "{} changes ({} added, {} deleted, {} modified)",
            manifest.kind, report.added, report.deleted, report.modified
        ),
    );
    Ok(())
}

/// Asks on the terminal whether to keep local changes
struct PromptDecision {
    device_id: String,
}

#[async_trait]
impl DecisionProvider for PromptDecision {
    async fn decide(&self, online_peers: usize) -> JoinDecision {
        let question = format!(
            "{} is joining {online_peers} online device(s). Keep local changes (transfer) \
             or take the swarm's state (overwrite)? [transfer/overwrite] ",
            self.device_id
        );
        let answer = tokio::task::spawn_blocking(move || {
            let term = console::Term::stderr();
            loop {
                let _ = term.write_str(&question);
                match term.read_line() {
                    Ok(line) => match line.trim().parse::<JoinDecision>() {
                        Ok(decision) => return decision,
                        Err(e) => {
                            let _ = term.write_line(&e.to_string());
                        }
                    },
                    Err(_) => return JoinDecision::Transfer,
                }
            }
        })
        .await;
        answer.unwrap_or(JoinDecision::Transfer)
    }
}

fn decision_provider(on_join: OnJoin, device_id: &str) -> Arc<dyn DecisionProvider> {
    match on_join {
        OnJoin::Ask => Arc::new(PromptDecision {
            device_id: device_id.to_string(),
        }),
        OnJoin::Transfer => Arc::new(FixedDecision(JoinDecision::Transfer)),
        OnJoin::Overwrite => Arc::new(FixedDecision(JoinDecision::Overwrite)),
    }
}

fn device_id_for(root: &Path, index: usize) -> String {
    root.file_name()
        .and_then(|name| name.to_str())
        .map_or_else(|| format!("device-{index}"), str::to_string)
}

async fn local_command(
    base: SyncConfig,
    roots: &[PathBuf],
    on_join: OnJoin,
    swarm_dir: &Path,
) -> Result<()> {
    let relay = Arc::new(TcpRelay::new());
    let coordinator = Arc::new(Coordinator::new(relay.clone()));
    let sweeper = coordinator.spawn_sweeper();
    info!("Swarm documents in {}", swarm_dir.display());

    let mut nodes = Vec::new();
    for (index, root) in roots.iter().enumerate() {
        let device_id = device_id_for(root, index);
        if nodes.iter().any(|node: &Arc<Node>| node.id() == device_id) {
            bail!("duplicate device id {device_id}");
        }
        let config = SyncConfig {
            root: root.clone(),
            device_id: device_id.clone(),
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..base.clone()
        };

        let listener = InboundListener::bind(config.listen).await?;
        let addr = listener.local_addr()?;
        relay.register(&device_id, addr);
        coordinator.register_device(&device_id, &config.user_id);

        let swarm = Arc::new(DirectorySwarm::new(swarm_dir)?);
        let node = Node::new(
            config,
            coordinator.clone(),
            swarm,
            decision_provider(on_join, &device_id),
        )?;
        listener.spawn(node.clone());
        watch_status(&node);

        node.start()?;
        print_status(Status::ONLINE, &format!("{device_id} at {addr}"));
        wait_until_settled(&node).await;
        nodes.push(node);
    }

    for device in coordinator.devices(&base.user_id).await? {
        let flags = match (device.online, device.away) {
            (true, true) => "online, away",
            (true, false) => "online",
            (false, _) => "offline",
        };
        print_status(Status::DEVICE, &format!("{} ({flags})", device.device_id));
    }

    info!("Syncing {} devices (Ctrl+C to stop)...", nodes.len());
    tokio::signal::ctrl_c().await?;

    for node in &nodes {
        node.shutdown().await;
    }
    sweeper.abort();
    Ok(())
}

/// Print every status change of `node` and log its state transitions
fn watch_status(node: &Arc<Node>) {
    let mut state = node.subscribe_state();
    let device_id = node.id().to_string();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            debug!("{device_id} entered {current:?}");
        }
    });

    let mut status = node.subscribe_status();
    let device_id = node.id().to_string();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            let line = format!("{device_id}: {current}");
            match current {
                SyncStatus::ErrorApplying | SyncStatus::RoundIncomplete => {
                    print_warning(Status::STATUS, &line);
                }
                _ => print_status(Status::STATUS, &line),
            }
        }
    });
}

/// Let a device finish its join round before the next one comes online
async fn wait_until_settled(node: &Node) {
    let mut status = node.subscribe_status();
    let settled = status.wait_for(|s| {
        matches!(s, SyncStatus::Synchronized | SyncStatus::RoundIncomplete)
    });
    let limit = node.interval().max(std::time::Duration::from_secs(1)) * 4;
    if tokio::time::timeout(limit, settled).await.is_err() {
        warn!("{} has not settled yet, continuing", node.id());
    }
}
