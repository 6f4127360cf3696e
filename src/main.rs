use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;

use sakaban::broker::ROSTER_FILE;
use sakaban::scanner::INDEX_DIR;
use sakaban::{Peer, Roster, Scanner};

#[derive(Parser)]
#[command(name = "skb", version, about = "Peer-to-peer directory sync")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Root directory to sync
    #[arg(short, long, global = true, default_value = ".")]
    root: PathBuf,

    /// This peer's identifier
    #[arg(short, long, global = true, default_value = "local")]
    peer_id: String,

    /// Number of hashing threads (default: CPU count)
    #[arg(short = 'j', long, global = true, value_name = "THREADS")]
    threads: Option<usize>,

    /// Quiet mode (no progress)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Rescan the root and persist the updated index
    Scan,
    /// Serve the root's blocks and index to other peers
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:7878")]
        listen: String,
    },
    /// Pull changes from a peer in the contacts roster
    Sync {
        /// Peer identifier to sync with
        peer: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("{} {e:#}", "Error:".red());
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Some(t) = cli.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(t)
            .build_global()
            .map_err(|e| anyhow::anyhow!("Failed to configure thread pool: {e}"))?;
    }

    if !cli.root.is_dir() {
        anyhow::bail!("Root is not a directory: {}", cli.root.display());
    }
    let root = cli.root.canonicalize().context("Can't resolve root")?;

    match cli.command {
        Command::Scan => {
            let start = Instant::now();
            let scanner = Scanner::new(&root)?;
            let index = scanner.commit()?;
            if !cli.quiet {
                println!(
                    "{} {} files, {} parents, {} tombstones ({:.1?})",
                    "Indexed:".green(),
                    index.files.len(),
                    index.parents.len(),
                    index.deletions.len(),
                    start.elapsed(),
                );
            }
        }
        Command::Serve { listen } => {
            let index = Scanner::new(&root)?.commit()?;
            let roster = Roster::load(&root.join(INDEX_DIR).join(ROSTER_FILE))?;
            let peer = Arc::new(Peer::new(root, cli.peer_id, roster, index));
            if !cli.quiet {
                println!("{} {} on {listen}", "Serving:".green(), peer.root().display());
            }
            runtime()?.block_on(async {
                let listener = TcpListener::bind(&listen)
                    .await
                    .with_context(|| format!("Can't listen on {listen}"))?;
                peer.serve(listener).await?;
                Ok::<_, anyhow::Error>(())
            })?;
        }
        Command::Sync { peer: remote_id } => {
            let index = Scanner::new(&root)?.commit()?;
            let roster = Roster::load(&root.join(INDEX_DIR).join(ROSTER_FILE))?;
            let contact = roster
                .lookup(&remote_id)
                .with_context(|| format!("No contact '{remote_id}' in the roster"))?
                .clone();

            let peer = Peer::new(root.clone(), cli.peer_id, roster, index);
            let start = Instant::now();
            runtime()?.block_on(peer.sync_with(&contact))?;

            // Fold the fetched files into the persisted index
            let index = Scanner::new(&root)?.commit()?;
            if !cli.quiet {
                println!(
                    "{} {} with {remote_id}: {} files ({:.1?})",
                    "Synced:".green(),
                    root.display(),
                    index.files.len(),
                    start.elapsed(),
                );
            }
        }
    }

    Ok(())
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Can't start async runtime")
}
