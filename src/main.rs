use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use shelfsync::backend::HttpBackend;
use shelfsync::cache::{CacheKey, ResultCache};
use shelfsync::client::{MutationOutcome, ResilientClient};
use shelfsync::config::Config;
use shelfsync::logging;
use shelfsync::network::{ConnectivityProbe, NetworkMonitor};
use shelfsync::queue::{ActionKind, NewAction, OfflineActionQueue, SyncOutcome};
use shelfsync::storage::SqliteKv;

#[derive(Parser, Debug)]
#[command(name = "shelfsync")]
#[command(about = "Offline mutation queue and read cache for the book-tracking backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shelfsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show connectivity and the pending actions
  Status,
  /// Apply a mutation, queueing it if the backend is unreachable
  Enqueue {
    /// create, update, delete or custom:<name>
    kind: ActionKind,
    /// Resource scope, e.g. books_user1
    target: String,
    /// JSON payload
    #[arg(default_value = "{}")]
    payload: String,
  },
  /// Replay the queue now
  Sync,
  /// Fetch one page of a resource scope, e.g. `get books user1 --page 2`
  Get {
    resource_type: String,
    scope_id: String,
    #[arg(long, default_value_t = 0)]
    page: u32,
  },
  /// Keep probing the backend and replay the queue on reconnect
  Watch,
  /// Drop a pending action without sending it
  Discard { id: Uuid },
  /// Drop every pending action
  Clear,
}

/// Everything a command needs, built from the configuration.
struct App {
  config: Config,
  backend: HttpBackend,
  client: ResilientClient,
}

impl App {
  async fn new(config: Config) -> Result<Self> {
    let backend = HttpBackend::new(
      &config.backend.url,
      config.backend.timeout(),
      Config::api_token(),
    )?;

    let store = match &config.queue.database {
      Some(path) => SqliteKv::open(path)?,
      None => SqliteKv::open_default()?,
    };
    let sender = Arc::new(backend.clone());
    let queue = OfflineActionQueue::open(Arc::new(store), sender.clone(), config.queue_options());
    if let Some(warning) = queue.load_warning() {
      eprintln!("warning: {}", warning);
    }

    let mut network = config.network_options();
    network.initially_online = backend.is_online().await;
    let monitor = NetworkMonitor::new(queue.clone(), network);

    let cache = ResultCache::new().with_max_entries(config.cache.max_entries);
    let client = ResilientClient::new(cache, queue, monitor, sender, config.retry_policy())
      .with_default_ttl(config.cache.default_ttl());

    Ok(Self {
      config,
      backend,
      client,
    })
  }

  fn queue(&self) -> &OfflineActionQueue {
    self.client.queue()
  }

  fn monitor(&self) -> &NetworkMonitor {
    self.client.monitor()
  }

  async fn run(&self, command: Command) -> Result<()> {
    match command {
      Command::Status => self.status(),
      Command::Enqueue {
        kind,
        target,
        payload,
      } => self.enqueue(kind, target, &payload).await,
      Command::Sync => self.sync().await,
      Command::Get {
        resource_type,
        scope_id,
        page,
      } => {
        let path = format!("{}/{}?page={}", resource_type, scope_id, page);
        self.get(&CacheKey::new(resource_type, scope_id).page(page), &path).await
      }
      Command::Watch => self.watch().await,
      Command::Discard { id } => {
        if self.queue().discard(id)? {
          println!("Discarded {}", id);
          Ok(())
        } else {
          Err(eyre!("No pending action with id {}", id))
        }
      }
      Command::Clear => {
        let dropped = self.queue().len();
        self.queue().clear()?;
        println!("Dropped {} pending action(s)", dropped);
        Ok(())
      }
    }
  }

  fn status(&self) -> Result<()> {
    let state = self.monitor().state();
    println!(
      "backend: {} ({})",
      self.backend.base_url(),
      if state.online { "online" } else { "offline" }
    );

    let actions = self.queue().snapshot();
    println!("pending: {}", actions.len());
    for action in actions {
      print!(
        "  {}  {:<16} {:<24} queued {}",
        action.id,
        action.kind.to_string(),
        action.target_resource,
        action.created_at.format("%Y-%m-%d %H:%M:%S")
      );
      if action.attempts > 0 {
        print!("  attempts={}", action.attempts);
      }
      if let Some(error) = &action.last_error {
        print!("  last error: {}", error);
      }
      println!();
    }
    Ok(())
  }

  async fn enqueue(&self, kind: ActionKind, target: String, payload: &str) -> Result<()> {
    let payload: Value =
      serde_json::from_str(payload).map_err(|e| eyre!("Invalid JSON payload: {}", e))?;

    match self.client.mutate(NewAction::new(kind, target, payload)).await? {
      MutationOutcome::Applied => println!("Applied"),
      MutationOutcome::Queued(id) => println!(
        "Queued {} ({} pending, backend unreachable or queue not empty)",
        id,
        self.queue().len()
      ),
    }
    Ok(())
  }

  async fn sync(&self) -> Result<()> {
    let report = self.monitor().retry_now().await;

    match &report.outcome {
      SyncOutcome::Completed => println!("Synced {} action(s)", report.committed),
      SyncOutcome::Idle => println!("Nothing to sync"),
      SyncOutcome::Offline => println!("Backend unreachable, {} action(s) pending", report.remaining),
      SyncOutcome::AlreadyRunning => println!("A sync is already running"),
      SyncOutcome::Paused { action_id, error } => {
        println!(
          "Synced {} of {}; paused at {}: {}",
          report.committed, report.total, action_id, error
        );
        return Err(eyre!("{} action(s) still pending", report.remaining));
      }
    }
    Ok(())
  }

  async fn get(&self, key: &CacheKey, path: &str) -> Result<()> {
    let backend = &self.backend;
    let result = self
      .client
      .read(key, None, || backend.fetch_json(path))
      .await
      .map_err(|e| eyre!("Failed to read {}: {}", path, e))?;

    let pretty = serde_json::to_string_pretty(&result.data)
      .map_err(|e| eyre!("Failed to format response: {}", e))?;
    println!("{}", pretty);
    Ok(())
  }

  async fn watch(&self) -> Result<()> {
    let mut queue_events = self.queue().subscribe();
    let mut network_events = self.monitor().subscribe();

    self.monitor().spawn_probe(
      Arc::new(self.backend.clone()) as Arc<dyn ConnectivityProbe>,
      self.config.network.probe_interval(),
    );
    let cleanup = self
      .client
      .cache()
      .spawn_cleanup(self.config.cache.cleanup_interval());
    println!(
      "Watching {} ({} pending), Ctrl-C to stop",
      self.backend.base_url(),
      self.queue().len()
    );

    // Pick up anything left over from a previous run
    if self.monitor().is_online() && !self.queue().is_empty() {
      let queue = self.queue().clone();
      tokio::spawn(async move {
        queue.sync().await;
      });
    }

    loop {
      tokio::select! {
        _ = tokio::signal::ctrl_c() => break,
        event = queue_events.recv() => match event {
          Ok(event) => println!("{:?}", event),
          Err(RecvError::Lagged(_)) => continue,
          Err(RecvError::Closed) => break,
        },
        event = network_events.recv() => match event {
          Ok(event) => println!("{:?}", event),
          Err(RecvError::Lagged(_)) => continue,
          Err(RecvError::Closed) => break,
        },
      }
    }

    cleanup.abort();
    self.monitor().shutdown();
    Ok(())
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&logging::default_log_dir()?, args.verbose)?;

  let app = App::new(config).await?;
  app.run(args.command).await
}
