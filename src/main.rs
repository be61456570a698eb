// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use tvtrack::api::{HttpApi, SetWatchRequest, WatchStatus};
use tvtrack::assets::ImageCache;
use tvtrack::config::ClientConfig;
use tvtrack::download::{EnqueueOutcome, ItemKey, QueueOptions, TransferItem, TransferQueue, TransferStatus};
use tvtrack::library::attach_local_media;
use tvtrack::offline::OfflineReconciler;
use tvtrack::store::FileStore;
use tvtrack::transfer::HttpTransport;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// General error
    pub const ERROR: i32 = 1;
    /// Service unavailable - the server could not be reached
    pub const SERVICE_UNAVAILABLE: i32 = 69;
    /// Configuration error - invalid config file
    pub const CONFIG: i32 = 78;
}

use exit_codes::*;

/// tvtrack - episode tracking client with offline downloads.
#[derive(Parser)]
#[command(name = "tvtrack")]
#[command(version = VERSION)]
#[command(about = "Episode tracking client: download queue and offline sync.")]
#[command(long_about = "tvtrack - episode tracking client\n\n\
    Queue an episode:    tvtrack downloads add /media/12/3.mp4 --file ep3.mp4 --show 12 --episode 3\n\
    Drain the queue:     tvtrack downloads run\n\
    Go offline:          tvtrack offline enter\n\
    Come back online:    tvtrack offline leave")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose mode: debug logging on stderr
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the download queue
    #[command(alias = "dl")]
    Downloads {
        #[command(subcommand)]
        command: DownloadCommands,
    },
    /// Offline mode and sync
    Offline {
        #[command(subcommand)]
        command: OfflineCommands,
    },
    /// List tracked shows
    Monitor,
    /// Show one show's episodes and watch position
    Show {
        id: u64,
    },
    /// Record the episode being watched
    Watch {
        id: u64,
        episode: u32,
        /// Playback position in seconds
        #[arg(long, default_value_t = 0.0)]
        time: f64,
    },
    /// Search sources for a show
    Search {
        keyword: String,
    },
    /// Cache an image and print its local path
    Image {
        url: String,
    },
}

#[derive(Subcommand)]
enum DownloadCommands {
    /// List queued and finished downloads
    List,
    /// Queue an episode and wait for the queue to drain
    Add {
        /// Episode URL, absolute or relative to the server
        url: String,
        /// File name to save as
        #[arg(short, long)]
        file: String,
        #[arg(long)]
        show: u64,
        #[arg(long)]
        episode: u32,
        /// Queue only; the item stays paused until `downloads run`
        #[arg(long)]
        detach: bool,
    },
    /// Pause a download (key: tv<show>-ep<episode>)
    Pause { key: ItemKey },
    /// Resume a paused download
    Resume { key: ItemKey },
    /// Delete a download and its file
    Delete { key: ItemKey },
    /// Resume every paused download and wait until the queue is idle
    Run,
}

#[derive(Subcommand)]
enum OfflineCommands {
    /// Show the current mode
    Status,
    /// Snapshot shows with finished downloads and go offline
    Enter,
    /// Sync offline changes and go online
    Leave,
    /// Switch mode
    Toggle,
}

/// Services wired together the way a UI layer would hold them.
struct App {
    config: ClientConfig,
    queue: TransferQueue,
    reconciler: OfflineReconciler,
    images: ImageCache,
}

impl App {
    fn open(config: ClientConfig) -> Result<Self> {
        let store = Arc::new(FileStore::new(config.state_dir()));
        let transport = Arc::new(HttpTransport::new(&config)?);
        let api = Arc::new(HttpApi::new(&config)?);

        let queue = TransferQueue::open(QueueOptions::from_config(&config), store.clone(), transport.clone());
        let reconciler = OfflineReconciler::open(api, store);
        let images = ImageCache::new(config.image_cache_dir(), transport);

        Ok(Self {
            config,
            queue,
            reconciler,
            images,
        })
    }
}

fn status_label(status: TransferStatus) -> colored::ColoredString {
    match status {
        TransferStatus::Pending => "pending".yellow(),
        TransferStatus::Downloading => "downloading".cyan(),
        TransferStatus::Paused => "paused".dimmed(),
        TransferStatus::Finished => "finished".green(),
        TransferStatus::Error => "error".red(),
    }
}

fn print_items(items: &[TransferItem]) {
    if items.is_empty() {
        println!("No downloads.");
        return;
    }
    for item in items {
        let progress = if item.status == TransferStatus::Downloading {
            format!(" {:>3.0}%", item.progress * 100.0)
        } else {
            String::new()
        };
        println!(
            "  {:<14} {:<12}{} {}",
            item.key.to_string().bold(),
            status_label(item.status),
            progress,
            item.destination_name
        );
        if let Some(error) = &item.last_error {
            println!("  {:<14} {}", "", error.red());
        }
    }
}

/// Wait for the queue to go idle with a progress bar; Ctrl+C shuts it down early.
async fn drain(queue: &TransferQueue) {
    let counts = queue.counts();
    let total = (counts.pending + counts.downloading) as u64;
    if total == 0 {
        println!("Nothing to download.");
        return;
    }

    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} | {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░"),
    );
    pb.enable_steady_tick(Duration::from_millis(100));

    let bar = pb.clone();
    let subscription = queue.subscribe(move |items| {
        let active: Vec<&TransferItem> = items.iter().filter(|i| i.status.is_active()).collect();
        bar.set_position(total.saturating_sub(active.len() as u64));
        let running: Vec<String> = active
            .iter()
            .filter(|i| i.status == TransferStatus::Downloading)
            .map(|i| format!("{} {:.0}%", i.key, i.progress * 100.0))
            .collect();
        bar.set_message(running.join(", "));
    });

    tokio::select! {
        _ = queue.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            pb.println(format!("{} Interrupted, pausing transfers...", "[!]".yellow()));
        }
    }
    subscription.unsubscribe();
    pb.finish_and_clear();
    queue.shutdown().await;

    let counts = queue.counts();
    println!(
        "{} {} finished, {} failed, {} paused",
        "[OK]".green(),
        counts.finished,
        counts.error,
        counts.paused
    );
}

async fn handle_downloads(app: &App, command: DownloadCommands) -> Result<()> {
    let queue = &app.queue;
    match command {
        DownloadCommands::List => {
            print_items(&queue.get_all());
            return Ok(());
        }
        DownloadCommands::Add {
            url,
            file,
            show,
            episode,
            detach,
        } => {
            match queue.enqueue(&url, &file, show, episode).await {
                EnqueueOutcome::Queued => println!("{} Queued tv{}-ep{}", "[+]".green(), show, episode),
                EnqueueOutcome::AlreadyQueued => {
                    println!("{} tv{}-ep{} is already in the queue", "[!]".yellow(), show, episode)
                }
            }
            if detach {
                queue.shutdown().await;
                return Ok(());
            }
            drain(queue).await;
        }
        DownloadCommands::Pause { key } => {
            if !queue.pause(key).await {
                println!("{} {} is not pending or downloading", "[!]".yellow(), key);
            }
            queue.shutdown().await;
        }
        DownloadCommands::Resume { key } => {
            if queue.resume(key).await {
                drain(queue).await;
            } else {
                println!("{} {} is not paused", "[!]".yellow(), key);
            }
        }
        DownloadCommands::Delete { key } => {
            if queue.delete(key).await {
                println!("{} Deleted {}", "[OK]".green(), key);
            } else {
                println!("{} No download {}", "[!]".yellow(), key);
            }
        }
        DownloadCommands::Run => {
            for item in queue.get_all() {
                if item.status == TransferStatus::Paused {
                    queue.resume(item.key).await;
                }
            }
            drain(queue).await;
        }
    }
    Ok(())
}

async fn handle_offline(app: &App, command: OfflineCommands) -> Result<()> {
    let reconciler = &app.reconciler;
    match command {
        OfflineCommands::Status => {}
        OfflineCommands::Enter => reconciler.enter_offline_mode(&app.queue.get_all()).await,
        OfflineCommands::Leave => {
            let report = reconciler.leave_offline_mode().await;
            print_sync_report(&report);
        }
        OfflineCommands::Toggle => {
            if let Some(report) = reconciler.toggle_offline_mode(&app.queue.get_all()).await {
                print_sync_report(&report);
            }
        }
    }

    if let Some(snapshot) = reconciler.snapshot() {
        println!(
            "Mode: {} ({} shows cached, {} changes pending sync)",
            "offline".yellow(),
            snapshot.details.len(),
            snapshot.pending_sync.len()
        );
    } else {
        println!("Mode: {} ({})", "online".green(), app.config.base_url);
    }
    Ok(())
}

fn print_sync_report(report: &tvtrack::offline::SyncReport) {
    println!("{} Synced {} show(s)", "[OK]".green(), report.pushed.len());
    if !report.is_clean() {
        println!(
            "{} Could not sync {:?}; those changes were discarded",
            "[!]".yellow(),
            report.failed
        );
    }
}

async fn run(cli: Cli, config: ClientConfig) -> Result<()> {
    let app = App::open(config)?;

    match cli.command {
        Commands::Downloads { command } => handle_downloads(&app, command).await?,
        Commands::Offline { command } => handle_offline(&app, command).await?,
        Commands::Monitor => {
            let monitor = app.reconciler.fetch_monitor("").await?;
            if monitor.tvs.is_empty() {
                println!("No shows.");
            }
            for tv in &monitor.tvs {
                println!(
                    "  {:>6}  {:<40} {:<10} ep {}/{}",
                    tv.id,
                    tv.name.bold(),
                    tv.tag,
                    tv.watch.watched_episode + 1,
                    tv.total_episodes
                );
            }
        }
        Commands::Show { id } => {
            let mut detail = app.reconciler.fetch_tv(id).await?;
            let local = attach_local_media(&mut detail, id, &app.queue.get_all());
            println!("{} [{}]", detail.name.bold(), detail.tag);
            for (index, episode) in detail.episodes.iter().enumerate() {
                let marker = if index as u32 == detail.watch.watched_episode { ">" } else { " " };
                println!("  {} {:>3}  {:<30} {}", marker, index, episode.name, episode.url.dimmed());
            }
            if local > 0 {
                println!("{} episode(s) available offline", local);
            }
        }
        Commands::Watch { id, episode, time } => {
            let request = SetWatchRequest {
                id,
                watch: WatchStatus {
                    watched_episode: episode,
                    watched_episode_time: time,
                    watched_episode_time_ratio: 0.0,
                },
            };
            app.reconciler.set_watch(&request).await?;
            let suffix = if app.reconciler.is_offline() { " (will sync when online)" } else { "" };
            println!("{} Watching episode {} of {}{}", "[OK]".green(), episode, id, suffix);
        }
        Commands::Search { keyword } => {
            let results = app.reconciler.search_tv(&keyword).await?;
            for source in &results.source {
                println!(
                    "  {:<40} {:<16} {} episodes",
                    source.name.bold(),
                    source.channel_name,
                    source.episodes.len()
                );
            }
        }
        Commands::Image { url } => match app.images.fetch(&app.config.resolve_url(&url)).await {
            Some(path) => println!("{}", path.display()),
            None => anyhow::bail!("Could not cache image {}", url),
        },
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let config = match ClientConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} Failed to load config: {:#}", "[!]".red(), e);
            std::process::exit(CONFIG);
        }
    };

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    if let Err(e) = runtime.block_on(run(cli, config)) {
        eprintln!("{} {:#}", "[X]".red(), e);
        let unreachable = e
            .downcast_ref::<tvtrack::api::ApiError>()
            .is_some_and(|api| matches!(api, tvtrack::api::ApiError::Network(_)));
        std::process::exit(if unreachable { SERVICE_UNAVAILABLE } else { ERROR });
    }
    Ok(())
}
