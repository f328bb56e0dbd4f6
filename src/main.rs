use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hyper::{Body, Client, Method, Request};
use log::{info, warn};
use serde_json::Value;
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tally::config::Config;
use tally::network::{
    run_http_admin, ConnectivityMonitor, HttpMutationClient, NetworkSignal, SwitchSignal,
};
use tally::storage::{
    MutationId, MutationKind, MutationState, NewMutation, QueueStore, ReadCache, SledQueueStore,
};
use tally::sync::{CycleOutcome, SyncOrchestrator, SyncWorker};

/// Plain-text logging to `TALLY_LOG_FILE` when set, structured logging to
/// stderr otherwise.
fn init_logging() {
    if let Ok(path) = std::env::var("TALLY_LOG_FILE") {
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                let mut builder = env_logger::Builder::from_env(
                    env_logger::Env::default().default_filter_or("info"),
                );
                builder.target(env_logger::Target::Pipe(Box::new(file)));
                if builder.try_init().is_ok() {
                    return;
                }
            }
            Err(e) => eprintln!("Cannot open log file {path}: {e}; logging to stderr"),
        }
    }

    let _ = LogTracer::init();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Offline-first mutation queue and sync engine for stock counts")]
struct Cli {
    /// JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the queue database (overrides the config)
    #[arg(short, long, global = true)]
    data_dir: Option<String>,

    /// Base URL of the remote service (overrides the config)
    #[arg(short, long, global = true)]
    remote: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Queue a mutation for delivery
    Enqueue {
        /// Mutation kind, e.g. create_count_line
        #[arg(short, long)]
        kind: String,

        /// JSON payload, or @path to read it from a file
        #[arg(short, long)]
        payload: String,
    },

    /// List queued mutations, oldest first
    List {
        #[arg(short, long, value_enum)]
        state: Option<StateFilter>,

        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show queue counts
    Stats,

    /// Remove mutations from the queue, whatever their state
    Discard {
        #[arg(required = true)]
        ids: Vec<u64>,
    },

    /// Run one full sync cycle (upload, then refresh reads)
    Sync {
        /// Skip the health probe and treat the remote as reachable
        #[arg(long)]
        assume_online: bool,
    },

    /// Upload pending mutations without refreshing reads
    Flush {
        #[arg(long)]
        assume_online: bool,
    },

    /// Show a cached read refreshed by an earlier cycle
    Cache {
        /// Cache entry; lists entries when omitted
        name: Option<String>,
    },

    /// Keep syncing in the background until interrupted
    Run,

    /// Talk to a running instance's admin API
    Admin {
        #[command(subcommand)]
        cmd: AdminCmd,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StateFilter {
    Pending,
    Conflict,
    Failed,
}

impl From<StateFilter> for MutationState {
    fn from(filter: StateFilter) -> Self {
        match filter {
            StateFilter::Pending => MutationState::Pending,
            StateFilter::Conflict => MutationState::Conflict,
            StateFilter::Failed => MutationState::Failed,
        }
    }
}

#[derive(Subcommand)]
enum AdminCmd {
    /// Show the sync snapshot
    Status {
        /// Admin HTTP address, e.g. 127.0.0.1:9000
        #[arg(long)]
        http: String,
    },
    /// Dump Prometheus metrics
    Metrics {
        #[arg(long)]
        http: String,
    },
    /// Trigger a full cycle on the running instance
    Sync {
        #[arg(long)]
        http: String,
    },
}

/// Sends one request to an admin API and returns the body. Uses
/// `TALLY_ADMIN_TOKEN` as bearer token when set.
async fn admin_request(host_port: &str, method: Method, path: &str) -> Result<String> {
    let mut builder = Request::builder()
        .method(method)
        .uri(format!("http://{host_port}{path}"));
    if let Ok(token) = std::env::var("TALLY_ADMIN_TOKEN") {
        builder = builder.header(hyper::header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = builder.body(Body::empty())?;

    let response = Client::new()
        .request(request)
        .await
        .with_context(|| format!("admin API at {host_port} unreachable"))?;
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await?;
    let body = String::from_utf8_lossy(&bytes).into_owned();
    if !status.is_success() && status != hyper::StatusCode::CONFLICT {
        bail!("admin API returned {status}: {body}");
    }
    Ok(body)
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(url) = &cli.remote {
        config.remote.base_url = url.clone();
    }
    config.validate()?;
    Ok(config)
}

struct Local {
    db: sled::Db,
    store: Arc<SledQueueStore>,
}

fn open_local(config: &Config) -> Result<Local> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir))?;
    let db = sled::open(&config.data_dir)
        .with_context(|| format!("opening queue database in {}", config.data_dir))?;
    let store = Arc::new(SledQueueStore::new(&db, config.sync.max_retries)?);
    Ok(Local { db, store })
}

fn remote_client(config: &Config) -> HttpMutationClient {
    let client = HttpMutationClient::new(&config.remote.base_url, config.remote.request_timeout());
    match std::env::var("TALLY_AUTH_TOKEN") {
        Ok(token) => client.with_auth_token(token),
        Err(_) => client,
    }
}

fn build_orchestrator(
    config: &Config,
    local: &Local,
    signal: Arc<dyn NetworkSignal>,
) -> Result<SyncOrchestrator> {
    let client = remote_client(config);
    let refreshers = client.refreshers();
    Ok(SyncOrchestrator::new(local.store.clone(), Arc::new(client), signal)
        .with_refreshers(refreshers)
        .with_read_cache(ReadCache::new(&local.db)?)
        .with_batch_size(config.sync.batch_size))
}

/// One-shot signal for CLI cycles: probe the health endpoint once.
async fn probe_signal(config: &Config, assume_online: bool) -> Arc<dyn NetworkSignal> {
    let usable = assume_online
        || ConnectivityMonitor::check_once(
            &config.remote.health_url(),
            config.remote.request_timeout(),
        )
        .await;
    if !usable {
        warn!("Remote at {} is unreachable", config.remote.base_url);
    }
    Arc::new(SwitchSignal::new(usable))
}

fn read_payload(arg: &str) -> Result<Value> {
    let text = match arg.strip_prefix('@') {
        Some(path) => {
            std::fs::read_to_string(path).with_context(|| format!("reading payload {path}"))?
        }
        None => arg.to_string(),
    };
    serde_json::from_str(&text).context("payload is not valid JSON")
}

fn print_outcome(outcome: &CycleOutcome) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Enqueue { kind, payload } => {
            let kind = MutationKind::from(kind);
            if !kind.is_recognized() {
                bail!("unknown mutation kind '{kind}'");
            }
            let local = open_local(&config)?;
            let id = local
                .store
                .append(NewMutation::now(kind, read_payload(&payload)?))
                .await?;
            println!("{id}");
        }
        Command::List { state, json } => {
            let local = open_local(&config)?;
            let mut entries = local.store.list().await?;
            if let Some(state) = state {
                let state = MutationState::from(state);
                entries.retain(|m| m.state == state);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for m in entries {
                    println!(
                        "{}\t{}\t{}\tretries={}\t{}",
                        m.id,
                        m.state,
                        m.kind,
                        m.retry_count,
                        m.last_error.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Command::Stats => {
            let local = open_local(&config)?;
            let stats = local.store.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Discard { ids } => {
            let local = open_local(&config)?;
            let ids: Vec<MutationId> = ids.into_iter().map(MutationId).collect();
            let removed = local.store.remove_many(&ids).await?;
            info!("Discarded {removed} of {} mutations", ids.len());
            println!("{removed}");
        }
        Command::Sync { assume_online } => {
            let local = open_local(&config)?;
            let signal = probe_signal(&config, assume_online).await;
            let orchestrator = build_orchestrator(&config, &local, signal)?;
            print_outcome(&orchestrator.sync_all().await?)?;
        }
        Command::Flush { assume_online } => {
            let local = open_local(&config)?;
            let signal = probe_signal(&config, assume_online).await;
            let orchestrator = build_orchestrator(&config, &local, signal)?;
            print_outcome(&orchestrator.process_queue().await?)?;
        }
        Command::Cache { name } => {
            let local = open_local(&config)?;
            let cache = ReadCache::new(&local.db)?;
            match name {
                Some(name) => match cache.get(&name)? {
                    Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
                    None => bail!("no cached read named '{name}'"),
                },
                None => {
                    for key in cache.keys()? {
                        println!("{key}");
                    }
                }
            }
        }
        Command::Run => {
            let local = open_local(&config)?;

            let monitor = ConnectivityMonitor::new(
                config.remote.health_url(),
                config.remote.health_interval(),
            )
            .with_timeout(config.remote.request_timeout());
            tokio::spawn(monitor.clone().run());

            let orchestrator = Arc::new(build_orchestrator(
                &config,
                &local,
                Arc::new(monitor),
            )?);

            let _status_log = orchestrator.subscribe(|snapshot| {
                if !snapshot.is_syncing {
                    log::debug!(
                        "Queue: {} pending, {} conflicts, {} failed",
                        snapshot.pending_count,
                        snapshot.conflict_count,
                        snapshot.failed_count
                    );
                }
            });

            if let Some(addr) = config.admin_addr {
                let admin = Arc::clone(&orchestrator);
                tokio::spawn(async move {
                    if let Err(e) = run_http_admin(addr, admin).await {
                        log::error!("HTTP admin server error: {e}");
                    }
                });
            }

            let worker = SyncWorker::new(Arc::clone(&orchestrator))
                .with_debounce(config.sync.reconnect_debounce())
                .with_interval(config.sync.interval())
                .spawn();

            info!(
                "Syncing {} against {}",
                config.data_dir, config.remote.base_url
            );
            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            worker.shutdown().await;
            local.db.flush_async().await?;
        }
        Command::Admin { cmd } => match cmd {
            AdminCmd::Status { http } => {
                println!("{}", admin_request(&http, Method::GET, "/status").await?);
            }
            AdminCmd::Metrics { http } => {
                println!("{}", admin_request(&http, Method::GET, "/metrics").await?);
            }
            AdminCmd::Sync { http } => {
                println!("{}", admin_request(&http, Method::POST, "/sync").await?);
            }
        },
    }

    Ok(())
}
