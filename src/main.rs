mod cache;
mod config;
mod db;
mod logging;
mod network;
mod query;
mod resource;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::{
  eyre::{eyre, WrapErr},
  Result,
};
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use cache::{CacheResult, CacheSource, KeyValueStore, MemoryStorage, QueryCache, QueryKey, QueryState, SqliteStorage};
use config::Config;
use db::Database;
use network::NetworkMonitor;
use query::Query;
use resource::{HttpFetcher, Method, Request, ResourceCache, ResourceStore};

#[derive(Parser, Debug)]
#[command(name = "tcache")]
#[command(about = "Offline-aware query and resource cache for TopCenter")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Treat the network as unavailable
  #[arg(long)]
  offline: bool,

  /// Cache database path (default: data dir)
  #[arg(long, conflicts_with = "ephemeral")]
  db: Option<PathBuf>,

  /// Keep everything in memory for this run
  #[arg(long)]
  ephemeral: bool,

  /// Mirror logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Resolve a JSON endpoint through the query cache
  Query {
    path: String,

    /// Query key part; defaults to the path
    #[arg(long = "key")]
    key: Vec<String>,

    #[arg(long)]
    stale_time_ms: Option<u64>,

    #[arg(long)]
    retry: Option<u32>,

    #[arg(long)]
    timeout_ms: Option<u64>,

    /// JSON value served when nothing else is available
    #[arg(long)]
    fallback: Option<String>,
  },
  /// Send one request through the resource cache
  Fetch {
    path: String,

    #[arg(long, default_value = "GET")]
    method: Method,
  },
  /// Pre-cache the manifest into the current generation
  Install,
  /// Purge every generation but the current one
  Activate,
  /// Drop one stored response from the current generation
  Evict { path: String },
  /// Show generations and stored query records
  Status,
  /// Drop every stored query record
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = logging::init(&db::data_dir()?.join("logs"), args.verbose)?;

  let config = Config::load(args.config.as_deref())?;
  debug!(origin = %config.origin, version = %config.cache.version, "configuration loaded");

  if args.ephemeral {
    return run(Arc::new(MemoryStorage::new()), config, args).await;
  }

  let storage = match &args.db {
    Some(path) => SqliteStorage::new(Database::open(path)?),
    None => SqliteStorage::open()?,
  };
  run(Arc::new(storage), config, args).await
}

async fn run<S>(storage: Arc<S>, config: Config, args: Args) -> Result<()>
where
  S: KeyValueStore + ResourceStore + 'static,
{
  let http = HttpFetcher::new(config.origin_url()?, config.http_timeout())?;
  let network = NetworkMonitor::new(!args.offline);

  let _probe = match (&config.network.probe_url, args.offline) {
    (Some(path), false) => {
      let url = http.resolve(path)?;
      info!(%url, "starting connectivity probe");
      Some(network.spawn_probe(http.client().clone(), url, config.probe_interval()))
    }
    _ => None,
  };

  match args.command {
    Command::Query {
      path,
      key,
      stale_time_ms,
      retry,
      timeout_ms,
      fallback,
    } => {
      let cache = QueryCache::new(storage, network).with_config(config.query_config());
      let key = if key.is_empty() {
        QueryKey::new([path.as_str()])
      } else {
        QueryKey::new(key)
      };

      let mut options = cache.options::<Value>();
      if let Some(ms) = stale_time_ms {
        options = options.with_stale_time(Duration::from_millis(ms));
      }
      if let Some(retry) = retry {
        options = options.with_retry(retry);
      }
      if let Some(ms) = timeout_ms {
        options = options.with_timeout(Duration::from_millis(ms));
      }
      if let Some(raw) = fallback {
        let value = serde_json::from_str(&raw).wrap_err("--fallback is not valid JSON")?;
        options = options.with_offline_fallback(value);
      }

      let fetcher = move || {
        let http = http.clone();
        let path = path.clone();
        async move { http.get_json::<Value>(&path).await }
      };

      let mut query = Query::new(cache, key, fetcher, options);
      query.fetch();
      wait_for(&mut query).await?;

      match query.state() {
        QueryState::Success(result) => {
          println!("{}", serde_json::to_string_pretty(&result.data)?);
          println!("{}", status_line(result));
          Ok(())
        }
        QueryState::Error(e) => Err(e.clone().into()),
        QueryState::Idle | QueryState::Loading => Err(eyre!("query did not resolve")),
      }
    }

    Command::Fetch { path, method } => {
      let url = http.resolve(&path)?;
      let worker = resource_cache(storage, http, &config)?;
      worker.start().await?;

      let response = worker.handle(&Request::new(method, url)).await?;
      println!("{} {}", response.status, response.url);
      for (name, value) in &response.headers {
        println!("{}: {}", name, value);
      }
      println!();

      let mut stdout = std::io::stdout().lock();
      stdout.write_all(&response.body)?;
      stdout.flush()?;
      Ok(())
    }

    Command::Install => {
      let worker = resource_cache(storage, http, &config)?;
      let count = worker.install().await?;
      println!("installed {} assets into {}", count, worker.version());
      Ok(())
    }

    Command::Activate => {
      let worker = resource_cache(storage, http, &config)?;
      let purged = worker.activate()?;
      if purged.is_empty() {
        println!("{} active, nothing to purge", worker.version());
      } else {
        println!("{} active, purged {}", worker.version(), purged.join(", "));
      }
      Ok(())
    }

    Command::Evict { path } => {
      let request = Request::get(http.resolve(&path)?);
      let worker = resource_cache(storage, http, &config)?;
      if worker.evict(&request)? {
        println!("evicted {}", request.cache_key());
      } else {
        println!("not cached: {}", request.cache_key());
      }
      Ok(())
    }

    Command::Status => {
      let worker = resource_cache(Arc::clone(&storage), http, &config)?;
      let cache = QueryCache::new(storage, network.clone());

      println!("network: {}", if network.is_online() { "online" } else { "offline" });
      println!("current generation: {}", worker.version());
      for (name, count) in worker.generations()? {
        let marker = if name == worker.version() { "*" } else { " " };
        println!("  {} {} ({} entries)", marker, name, count);
      }

      let records = cache.records()?;
      println!("query records: {}", records.len());
      let now = Utc::now();
      for (_, record) in records {
        let age = (now - record.cached_at).num_seconds();
        println!("  {} (cached {}s ago)", record.description, age);
      }
      Ok(())
    }

    Command::Clear => {
      let removed = QueryCache::new(storage, network).clear()?;
      println!("removed {} query records", removed);
      Ok(())
    }
  }
}

fn resource_cache<S: ResourceStore>(
  store: Arc<S>,
  http: HttpFetcher,
  config: &Config,
) -> Result<ResourceCache<S, HttpFetcher>> {
  Ok(ResourceCache::new(
    store,
    Arc::new(http),
    config.cache.version.clone(),
    config.manifest_urls()?,
  ))
}

/// Poll until the query settles. Ctrl-C drops the query, cancelling it.
async fn wait_for(query: &mut Query<Value>) -> Result<()> {
  let interrupt = tokio::signal::ctrl_c();
  tokio::pin!(interrupt);
  let mut ticker = tokio::time::interval(Duration::from_millis(25));

  loop {
    tokio::select! {
      _ = &mut interrupt => return Err(eyre!("interrupted")),
      _ = ticker.tick() => {
        if query.poll() {
          return Ok(());
        }
      }
    }
  }
}

fn status_line<T>(result: &CacheResult<T>) -> String {
  let freshness = match result.source {
    CacheSource::Network => "network",
    _ if result.is_stale() => "stale",
    _ => "fresh",
  };
  format!("[{}] source={}", freshness, result.source.label())
}
