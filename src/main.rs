use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{info, warn};

use offsync::config::Config;
use offsync::event::ConnectivityMonitor;
use offsync::queue::{FileBlob, RemoveOutcome};
use offsync::remote::{resolve_url, Headers, Request};
use offsync::{logging, OfflineWorker, UploadOutcome};

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "Offline cache and upload retry queue for a file server")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./offsync.yaml or $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Warm the static cache and evict stale cache generations
  Install,
  /// Fetch a URL or path through the cache
  Fetch {
    url: String,
    /// Extra request header, as name:value
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Bypass the cache
    #[arg(long)]
    no_cache: bool,
  },
  /// Upload a file, queueing it if the server is unreachable
  Upload { file: PathBuf, url: String },
  /// Inspect or edit the upload queue
  Queue {
    #[command(subcommand)]
    action: QueueAction,
  },
  /// Replay queued uploads now
  Drain,
  /// Watch connectivity and sync queued uploads when it returns
  Watch,
}

#[derive(Subcommand, Debug)]
enum QueueAction {
  List,
  Count,
  Remove { id: i64 },
}

fn parse_headers(raw: &[String]) -> Result<Headers> {
  raw
    .iter()
    .map(|h| -> Result<(String, String)> {
      let (name, value) = h
        .split_once(':')
        .ok_or_else(|| eyre!("Header must be name:value, got '{}'", h))?;
      Ok((name.trim().to_ascii_lowercase(), value.trim().to_string()))
    })
    .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  let worker = OfflineWorker::open(&config).await?;
  let base = config.base_url()?;

  match args.command {
    Command::Install => {
      worker.install().await?;
      let report = worker.activate().await?;
      println!(
        "installed; deleted {} stale generation(s){}",
        report.deleted.len(),
        if report.failed.is_empty() {
          String::new()
        } else {
          format!(", {} could not be deleted", report.failed.len())
        }
      );
    }
    Command::Fetch {
      url,
      headers,
      no_cache,
    } => {
      if !worker.lifecycle().is_controlling() {
        warn!("not installed yet, request bypasses the cache; run `offsync install`");
      }

      let mut request = Request::get(resolve_url(&base, &url)?).with_headers(&parse_headers(&headers)?);
      if no_cache {
        request = request.with_header("cache-control", "no-cache");
      }

      let response = worker.fetch(request).await;
      worker.settle().await;

      println!(
        "{} ({} bytes){}",
        response.status,
        response.body.len(),
        if response.synthetic { " [offline]" } else { "" }
      );
    }
    Command::Upload { file, url } => {
      let bytes = std::fs::read(&file)
        .map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?;
      let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
      let target = resolve_url(&base, &url)?;

      match worker
        .upload(FileBlob::new(name, bytes), &target, Headers::new())
        .await?
      {
        UploadOutcome::Delivered(response) => println!("uploaded ({})", response.status),
        UploadOutcome::Rejected(response) => {
          return Err(eyre!("server rejected upload: {} {}", response.status, response.text()))
        }
        UploadOutcome::Queued(id) => println!("offline; queued as #{}", id),
      }
    }
    Command::Queue { action } => match action {
      QueueAction::List => {
        for upload in worker.queue().list_all().await? {
          println!(
            "#{}\t{}\t{} bytes\t{}\t{}",
            upload.id,
            upload.file_name,
            upload.file_blob.len(),
            upload.target_url,
            upload.enqueued_at.to_rfc3339()
          );
        }
      }
      QueueAction::Count => println!("{}", worker.queued_upload_count().await?),
      QueueAction::Remove { id } => match worker.queue().remove(id).await? {
        RemoveOutcome::Removed => println!("removed #{}", id),
        RemoveOutcome::NotFound => return Err(eyre!("no queued upload #{}", id)),
      },
    },
    Command::Drain => {
      let report = worker.drain().await?;
      println!(
        "delivered {}, failed {}, skipped {}",
        report.delivered.len(),
        report.failed.len(),
        report.skipped.len()
      );
    }
    Command::Watch => watch(&config, worker).await?,
  }

  Ok(())
}

async fn watch(config: &Config, worker: OfflineWorker) -> Result<()> {
  let (tx, rx) = mpsc::unbounded_channel();
  let monitor = ConnectivityMonitor::new(worker.transport(), config.probe_url()?, config.probe_interval());
  let probe = monitor.spawn(tx);
  let trigger = tokio::spawn(worker.sync_trigger().run(rx));

  let mut status = tokio::time::interval(config.status_poll_interval());
  info!("watching connectivity, Ctrl-C to stop");

  loop {
    tokio::select! {
      _ = status.tick() => {
        let count = worker.queued_upload_count_or_zero().await;
        info!(queued = count, online = worker.is_online(), "queue status");
      }
      _ = tokio::signal::ctrl_c() => break,
    }
  }

  probe.abort();
  trigger.abort();
  Ok(())
}
