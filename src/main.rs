mod config;
mod logging;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use hubsync::cache::{Collection, SystemClock};
use hubsync::remote::HttpExecutor;
use hubsync::server::{self, GithubUpstream};
use hubsync::sync::SyncEvent;
use hubsync::{CacheEngine, EngineOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "hubsync")]
#[command(about = "Offline-first cache and replay queue for a GitHub dashboard")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/hubsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Log at debug level
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the replay endpoint that forwards calls to GitHub
  Serve,
  /// Replay every queued operation once
  Sync,
  /// Keep the client running: probe connectivity and replay when it returns
  Watch,
  /// List queued operations
  Queue,
  /// Cancel a queued operation
  Drop { id: String },
  /// Remove expired records
  Sweep,
  /// Remove every record of a collection
  Clear { collection: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;

  let log_dir = dirs::data_dir()
    .unwrap_or_else(std::env::temp_dir)
    .join("hubsync")
    .join("logs");
  let stderr = matches!(args.command, Command::Serve | Command::Watch);
  let _guard = logging::init(&log_dir, args.verbose, stderr)?;

  match args.command {
    Command::Serve => serve(&config).await,
    Command::Sync => sync(&config).await,
    Command::Watch => watch(&config).await,
    Command::Queue => queue(&config).await,
    Command::Drop { id } => {
      let engine = open_engine(&config).await?;
      if engine.remove_pending_operation(&id).await? {
        println!("dropped {}", id);
      } else {
        println!("no queued operation {}", id);
      }
      Ok(())
    }
    Command::Sweep => {
      let engine = open_engine(&config).await?;
      println!("removed {} expired records", engine.sweep_expired().await?);
      Ok(())
    }
    Command::Clear { collection } => {
      let collection: Collection = collection.parse()?;
      let engine = open_engine(&config).await?;
      println!("removed {} records from {}", engine.clear_store(collection).await?, collection);
      Ok(())
    }
  }
}

async fn serve(config: &config::Config) -> Result<()> {
  let token = match config::Config::get_github_token() {
    Ok(token) => Some(token),
    Err(e) => {
      tracing::warn!("{}; calling GitHub unauthenticated", e);
      None
    }
  };
  let upstream = GithubUpstream::new(&config.github_api_url()?, token.as_deref(), REQUEST_TIMEOUT)?;
  let listener = tokio::net::TcpListener::bind(&config.server.listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", config.server.listen, e))?;

  server::serve(listener, Arc::new(upstream), async {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
  })
  .await?;
  Ok(())
}

async fn sync(config: &config::Config) -> Result<()> {
  let engine = open_engine(config).await?;
  if !engine.connectivity().is_online() {
    return Err(eyre!("Server {} is unreachable; operations stay queued", config.server.url));
  }

  let report = engine.sync_now().await?;
  for op in &report.synced {
    println!("synced    {} {} {}", op.id, op.method, op.endpoint);
  }
  for rejected in &report.rejected {
    println!(
      "rejected  {} {} {} ({}: {})",
      rejected.operation.id,
      rejected.operation.method,
      rejected.operation.endpoint,
      rejected.status,
      rejected.message
    );
  }
  for op in &report.deferred {
    println!("deferred  {} {} {}", op.id, op.method, op.endpoint);
  }
  Ok(())
}

async fn watch(config: &config::Config) -> Result<()> {
  let executor = HttpExecutor::new(&config.server_url()?, REQUEST_TIMEOUT)?;
  let engine = open_engine_with(
    config,
    executor.clone(),
    config.cache.background_sync,
    config.sweep_interval(),
  )
  .await?;
  let probe = engine
    .connectivity()
    .spawn_probe(config.probe_interval(), move || {
      let executor = executor.clone();
      async move { executor.probe().await }
    });

  let mut events = engine.subscribe();
  loop {
    tokio::select! {
      event = events.recv() => match event {
        Ok(SyncEvent::SyncComplete { items }) => {
          tracing::info!(count = items.len(), "queued operations synced");
        }
        Ok(SyncEvent::OperationRejected { operation, status, message }) => {
          tracing::warn!(op_id = %operation.id, status, %message, "queued operation rejected");
        }
        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
          tracing::warn!(skipped, "missed sync events");
        }
        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
      },
      _ = tokio::signal::ctrl_c() => break,
    }
  }

  probe.abort();
  engine.shutdown();
  Ok(())
}

async fn queue(config: &config::Config) -> Result<()> {
  let engine = open_engine(config).await?;
  let pending = engine.get_pending_operations().await?;
  if pending.is_empty() {
    println!("queue is empty");
  }
  for op in pending {
    println!(
      "{}  {}  {:<6} {}",
      op.id,
      op.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
      op.method.as_str(),
      op.endpoint
    );
  }
  Ok(())
}

/// Engine for one-shot commands: no background task, no periodic sweep.
async fn open_engine(config: &config::Config) -> Result<CacheEngine> {
  let executor = HttpExecutor::new(&config.server_url()?, REQUEST_TIMEOUT)?;
  open_engine_with(config, executor, false, None).await
}

async fn open_engine_with(
  config: &config::Config,
  executor: HttpExecutor,
  background_sync: bool,
  sweep_interval: Option<Duration>,
) -> Result<CacheEngine> {
  let start_online = executor.probe().await;
  let options = EngineOptions {
    db_path: Some(config.db_path()?),
    expiry: config.expiry_policy(),
    background_sync,
    start_online,
    sweep_interval,
    clock: Arc::new(SystemClock),
  };
  Ok(CacheEngine::init(options, Arc::new(executor)).await?)
}
