//! fieldsync CLI
//!
//! Synchronizes a local project directory with its remote project store.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing_subscriber::EnvFilter;

use fieldsync::api::HttpCloudApi;
use fieldsync::config::Config;
use fieldsync::fs::{scan_project, FileRecord};
use fieldsync::sync::{driver, QueueEntry, QueueEvent, SyncEngine, SyncNotification, TransferQueue};

/// Resolution of the fraction bars.
const PROGRESS_STEPS: u64 = 1000;

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "Synchronize a local project with its remote project store")]
#[command(version)]
struct Cli {
    /// Config file (defaults to <config dir>/fieldsync/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// API token, overrides the config file
    #[arg(long, env = "FIELDSYNC_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    /// API root, overrides the config file
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// More logging (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload, delete and download project files
    Sync {
        /// Remote project id
        project_id: String,
        /// Local project directory
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
        /// File to upload (repeatable)
        #[arg(long = "upload", value_name = "NAME")]
        uploads: Vec<String>,
        /// File to download (repeatable)
        #[arg(long = "download", value_name = "NAME")]
        downloads: Vec<String>,
        /// File to delete locally and remotely (repeatable)
        #[arg(long = "delete", value_name = "NAME")]
        deletes: Vec<String>,
        /// Upload every local-only file and download every cloud-only file
        #[arg(long)]
        all: bool,
        /// Maximum number of parallel downloads
        #[arg(short, long)]
        jobs: Option<usize>,
    },
    /// List the files of a remote project
    Files {
        /// Remote project id
        project_id: String,
        /// Show every stored version
        #[arg(long)]
        versions: bool,
    },
    /// Download one version of a file to an arbitrary path
    DownloadVersion {
        /// Remote project id
        project_id: String,
        /// File name inside the project
        name: String,
        /// Version id, as listed by `files --versions`
        version: String,
        /// Where to write the file
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(token) = cli.token {
        config.token = Some(token);
    }
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url;
    }

    let result = match cli.command {
        Commands::Sync {
            project_id,
            dir,
            uploads,
            downloads,
            deletes,
            all,
            jobs,
        } => {
            if let Some(jobs) = jobs {
                if jobs == 0 {
                    bail!("--jobs must be at least 1");
                }
                config.max_parallel_downloads = jobs;
            }
            let selection = Selection {
                uploads,
                downloads,
                deletes,
                all,
            };
            run_sync(&config, &project_id, dir, selection).await
        }
        Commands::Files { project_id, versions } => list_files(&config, &project_id, versions).await,
        Commands::DownloadVersion {
            project_id,
            name,
            version,
            output,
        } => download_version(&config, &project_id, &name, &version, output).await,
    };

    if let Err(err) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), err);
        std::process::exit(1);
    }
    Ok(())
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "fieldsync=warn",
        1 => "fieldsync=info",
        _ => "fieldsync=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Names picked on the command line.
struct Selection {
    uploads: Vec<String>,
    downloads: Vec<String>,
    deletes: Vec<String>,
    all: bool,
}

type Plan = (Vec<FileRecord>, Vec<FileRecord>, Vec<FileRecord>);

/// Turn the selected names into (uploads, downloads, deletes).
fn plan_sync(records: Vec<FileRecord>, selection: Selection) -> Result<Plan> {
    let mut by_name: BTreeMap<String, FileRecord> = records.into_iter().map(|r| (r.name.clone(), r)).collect();

    let mut upload_names = selection.uploads;
    let mut download_names = selection.downloads;
    if selection.all {
        for record in by_name.values() {
            if record.checkout.is_local_only() {
                upload_names.push(record.name.clone());
            } else if record.checkout.is_cloud_only() {
                download_names.push(record.name.clone());
            }
        }
    }

    let mut seen = BTreeSet::new();
    for name in upload_names.iter().chain(&download_names).chain(&selection.deletes) {
        if !seen.insert(name.as_str()) {
            bail!("\"{}\" is selected more than once", name);
        }
    }

    let mut take = |name: &str| {
        by_name
            .remove(name)
            .with_context(|| format!("\"{}\" is neither in the project directory nor in the remote project", name))
    };

    let mut uploads = Vec::new();
    for name in &upload_names {
        let record = take(name)?;
        if !record.checkout.local {
            bail!("Cannot upload \"{}\": it only exists remotely", name);
        }
        uploads.push(record);
    }

    let mut downloads = Vec::new();
    for name in &download_names {
        let record = take(name)?;
        if !record.checkout.cloud {
            bail!("Cannot download \"{}\": it only exists locally", name);
        }
        downloads.push(record);
    }

    let mut deletes = Vec::new();
    for name in &selection.deletes {
        deletes.push(take(name)?);
    }

    Ok((uploads, downloads, deletes))
}

async fn run_sync(config: &Config, project_id: &str, dir: PathBuf, selection: Selection) -> Result<()> {
    let dir = dir
        .canonicalize()
        .with_context(|| format!("Failed to open project directory: {}", dir.display()))?;

    let (events_tx, mut events_rx) = unbounded_channel();
    let api = HttpCloudApi::new(config, events_tx)?;

    let remote = api
        .fetch_file_list(project_id)
        .await
        .with_context(|| format!("Failed to list files of project {}", project_id))?;
    let records = scan_project(&dir, &config.control_dir, &remote)?;
    let (uploads, downloads, deletes) = plan_sync(records, selection)?;

    if uploads.is_empty() && downloads.is_empty() && deletes.is_empty() {
        println!("Nothing to sync");
        return Ok(());
    }
    println!(
        "Syncing {}: {} to upload, {} to download, {} to delete",
        dir.display(),
        uploads.len(),
        downloads.len(),
        deletes.len()
    );

    let (notify_tx, notify_rx) = unbounded_channel();
    let mut engine = SyncEngine::new(api, project_id, &dir, config, notify_tx);
    engine.sync(uploads, downloads, deletes)?;

    let renderer = tokio::spawn(render_notifications(notify_rx));
    let abort_signal = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let result = driver::run_until(&mut engine, &mut events_rx, abort_signal).await;
    drop(engine);

    let outcome = renderer.await.context("Progress display failed")?;
    result?;

    if outcome.aborted {
        bail!("Sync aborted after {} error(s)", outcome.errors);
    }
    if outcome.errors > 0 {
        bail!("Sync finished with {} error(s)", outcome.errors);
    }
    println!("{}", "Sync complete".green());
    Ok(())
}

#[derive(Default)]
struct Outcome {
    errors: usize,
    aborted: bool,
}

fn fraction_bar(multi: &MultiProgress, prefix: &'static str) -> ProgressBar {
    let pb = multi.add(ProgressBar::new(PROGRESS_STEPS));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{prefix:>9} [{bar:40.cyan/blue}] {percent:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb.set_prefix(prefix);
    pb
}

async fn render_notifications(mut notifications: UnboundedReceiver<SyncNotification>) -> Outcome {
    let multi = MultiProgress::new();
    let upload = fraction_bar(&multi, "upload");
    let download = fraction_bar(&multi, "download");
    let mut outcome = Outcome::default();

    while let Some(notification) = notifications.recv().await {
        match notification {
            SyncNotification::UploadProgress(f) => upload.set_position((f * PROGRESS_STEPS as f64) as u64),
            SyncNotification::DownloadProgress(f) => download.set_position((f * PROGRESS_STEPS as f64) as u64),
            SyncNotification::UploadFinished => upload.finish_with_message("done"),
            SyncNotification::DeleteFinished => {
                let _ = multi.println("Deletes done");
            }
            SyncNotification::DownloadFinished => download.finish_with_message("done"),
            SyncNotification::FileDownloaded { name } => download.set_message(name),
            SyncNotification::RolledBack => {
                let _ = multi.println(format!("{}", "Project restored from the backup".yellow()));
            }
            SyncNotification::Error { message, cause } => {
                outcome.errors += 1;
                let label = if cause.is_fatal() { "Fatal:".red().bold() } else { "Error:".red() };
                let _ = multi.println(format!("{} {}", label, message));
                tracing::debug!("{:?}", cause);
            }
            SyncNotification::Aborted => {
                outcome.aborted = true;
                upload.abandon();
                download.abandon();
                let _ = multi.println(format!("{}", "Sync aborted".yellow().bold()));
            }
            SyncNotification::Finished => {}
        }
    }

    outcome
}

async fn list_files(config: &Config, project_id: &str, show_versions: bool) -> Result<()> {
    let (events_tx, _events_rx) = unbounded_channel();
    let api = HttpCloudApi::new(config, events_tx)?;

    let files = api
        .fetch_file_list(project_id)
        .await
        .with_context(|| format!("Failed to list files of project {}", project_id))?;

    for file in &files {
        let modified = file
            .last_modified
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "{:>10}  {:16}  {}",
            humansize::format_size(file.size, humansize::BINARY),
            modified,
            file.name.bold()
        );

        if show_versions {
            for version in &file.versions {
                let marker = if version.is_latest { "*" } else { " " };
                let modified = version
                    .last_modified
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!(
                    "    {} {}  {:>10}  {}",
                    marker,
                    version.version_id.dimmed(),
                    humansize::format_size(version.size, humansize::BINARY),
                    modified
                );
            }
        }
    }

    let total: u64 = files.iter().map(|f| f.size).sum();
    println!("{} files, {}", files.len(), humansize::format_size(total, humansize::BINARY));
    Ok(())
}

async fn download_version(config: &Config, project_id: &str, name: &str, version: &str, output: PathBuf) -> Result<()> {
    let (events_tx, mut events_rx) = unbounded_channel();
    let mut api = HttpCloudApi::new(config, events_tx)?;

    let entry = QueueEntry::new(name, &output).with_version(version);
    let mut queue = TransferQueue::new(project_id, vec![entry], 1);

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );

    driver::run_queue(&mut queue, &mut api, &mut events_rx, |event| {
        if let QueueEvent::Progress { transferred, total, .. } = event {
            pb.set_length(*total);
            pb.set_position(*transferred);
        }
    })
    .await
    .with_context(|| format!("Failed to download version {} of \"{}\"", version, name))?;

    pb.finish_and_clear();
    println!("Saved {} ({}) to {}", name.bold(), version, output.display());
    Ok(())
}
