use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_api::{ApiError, Distribution, NodeCreateOptions};
use keel_cache::{spawn_resync, Cache};
use keel_controller::{Controller, DeploymentReconciler};
use keel_converge::{DeploymentManifest, Manifest, ManifestMeta, NamespaceManifest, PodManifest};
use keel_core::{Action, Deployment, Kind, Meta, Object};
use keel_persist::SqliteBackend;
use keel_storage::{MemoryBackend, Storage};
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Pause before re-listing after the cache's watch stream ends.
const RESYNC_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel control plane")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for namespaced kinds
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Store backend
    #[arg(long, value_enum, global = true, env = "KEEL_BACKEND", default_value_t = BackendKind::Sqlite)]
    backend: BackendKind,

    /// SQLite database path (default ~/.keel/keel.db)
    #[arg(long = "db", global = true, env = "KEEL_DB_PATH")]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum BackendKind { Memory, Sqlite }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ResourceKind { Namespace, Node, Deployment, Pod }

impl ResourceKind {
    fn kind(self) -> Kind {
        match self {
            ResourceKind::Namespace => Kind::Namespace,
            ResourceKind::Node => Kind::Node,
            ResourceKind::Deployment => Kind::Deployment,
            ResourceKind::Pod => Kind::Pod,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ManifestKind { Namespace, Deployment, Pod }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the deployment controller until Ctrl-C
    Serve {
        /// Start paused; catch-up runs on the first resume
        #[arg(long, action = ArgAction::SetTrue)]
        standby: bool,
    },
    /// Apply a YAML or JSON manifest
    Apply {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        #[arg(long, value_enum)]
        kind: ManifestKind,
    },
    /// List objects of a kind, or show one by name
    Get {
        #[arg(value_enum)]
        kind: ResourceKind,
        name: Option<String>,
    },
    /// Remove an object
    Rm {
        #[arg(value_enum)]
        kind: ResourceKind,
        name: String,
    },
    /// Stream store events for a kind and print +/~/- lines
    Watch {
        #[arg(value_enum)]
        kind: ResourceKind,
    },
    /// Namespace shortcuts
    Ns {
        #[command(subcommand)]
        command: NsCommand,
    },
    /// Node registration
    Node {
        #[command(subcommand)]
        command: NodeCommand,
    },
}

#[derive(Subcommand, Debug)]
enum NsCommand {
    Create { name: String },
    Ls,
}

#[derive(Subcommand, Debug)]
enum NodeCommand {
    Register {
        name: String,
        #[arg(long, default_value = "")]
        region: String,
        #[arg(long, default_value = "")]
        provider: String,
        /// Generated when omitted
        #[arg(long)]
        token: Option<String>,
    },
    Online { name: String },
    Offline { name: String },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

fn open_storage(cli: &Cli) -> Result<Storage> {
    let t0 = Instant::now();
    let storage = match cli.backend {
        BackendKind::Memory => Storage::new(Arc::new(MemoryBackend::new())),
        BackendKind::Sqlite => {
            let backend = match &cli.db_path {
                Some(p) => SqliteBackend::open(&p.to_string_lossy())?,
                None => SqliteBackend::open_default()?,
            };
            Storage::new(Arc::new(backend))
        }
    };
    info!(backend = ?cli.backend, took_ms = %t0.elapsed().as_millis(), "storage opened");
    Ok(storage)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let storage = open_storage(&cli)?;

    let t0 = Instant::now();
    let command = command_name(&cli.command);
    let res = match &cli.command {
        Commands::Serve { standby } => serve(storage, *standby).await,
        Commands::Watch { kind } => watch(storage, kind.kind()).await,
        other => {
            let api = Distribution::new(storage);
            run(&api, &cli, other).await
        }
    };
    histogram!("keelctl_command_ms", t0.elapsed().as_secs_f64() * 1000.0, "command" => command);
    if res.is_err() {
        counter!("keelctl_command_failed_total", 1u64, "command" => command);
    }
    if let Err(e) = &res {
        if let Some(api) = e.downcast_ref::<ApiError>() {
            error!(error = %api, "request failed");
        }
    }
    res
}

async fn serve(storage: Storage, standby: bool) -> Result<()> {
    let cancel = CancellationToken::new();
    let cache = Arc::new(Cache::<Deployment>::new());
    let sync = spawn_resync(cache.clone(), storage.clone(), cancel.clone(), RESYNC_BACKOFF);
    let reconciler = Arc::new(DeploymentReconciler::new(storage.clone()));
    let ctrl = Arc::new(Controller::new(storage, cache, reconciler));

    if standby {
        info!("serve: standing by (paused)");
    } else {
        let queued = ctrl.resume(&cancel).await;
        info!(queued, "serve: controller active");
    }
    let observe = tokio::spawn({
        let ctrl = ctrl.clone();
        let cancel = cancel.clone();
        async move { ctrl.observe(cancel).await }
    });

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Ctrl-C received; shutting down");
    cancel.cancel();
    observe.await?.map_err(anyhow::Error::from)?;
    sync.await?;
    Ok(())
}

async fn watch(storage: Storage, kind: Kind) -> Result<()> {
    info!(kind = %kind.as_str(), "watch invoked");
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(256);
    let pump = tokio::spawn({
        let cancel = cancel.clone();
        async move { storage.watch(cancel, kind, tx).await }
    });
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(ev) => match ev.action {
                    Action::Create => println!("+ {}", ev.self_link),
                    Action::Update => println!("~ {}", ev.self_link),
                    Action::Delete => println!("- {}", ev.self_link),
                    Action::Error => {
                        warn!(link = %ev.self_link, "watch error event");
                    }
                },
                None => {
                    warn!("watch channel closed; exiting watch loop");
                    break;
                }
            },
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down watch loop");
                break;
            }
        }
    }
    cancel.cancel();
    pump.await??;
    Ok(())
}

async fn run(api: &Distribution, cli: &Cli, command: &Commands) -> Result<()> {
    let ns = cli.namespace.as_deref().unwrap_or("default");
    match command {
        Commands::Apply { file, kind } => {
            let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
            match kind {
                ManifestKind::Namespace => {
                    let m = NamespaceManifest::decode(&data)?;
                    print_one(cli.output, &api.namespace_create(&m).await?)?;
                }
                ManifestKind::Deployment => {
                    let m = DeploymentManifest::decode(&data)?;
                    let applied = api.deployment_apply(ns, &m).await?;
                    match cli.output {
                        Output::Human => println!(
                            "deployment {} {} (+{} ~{} -{})",
                            applied.value.self_link(),
                            verb(applied.created, applied.changed),
                            applied.summary.adds,
                            applied.summary.updates,
                            applied.summary.removes
                        ),
                        Output::Json => println!("{}", serde_json::to_string_pretty(&applied)?),
                    }
                }
                ManifestKind::Pod => {
                    let m = PodManifest::decode(&data)?;
                    let applied = api.pod_apply(ns, &m).await?;
                    match cli.output {
                        Output::Human => println!(
                            "pod {} {} (+{} ~{} -{})",
                            applied.value.self_link(),
                            verb(applied.created, applied.changed),
                            applied.summary.adds,
                            applied.summary.updates,
                            applied.summary.removes
                        ),
                        Output::Json => println!("{}", serde_json::to_string_pretty(&applied)?),
                    }
                }
            }
        }
        Commands::Get { kind, name } => {
            let name = name.as_deref();
            match kind {
                ResourceKind::Namespace => match name {
                    Some(n) => print_one(cli.output, &found(api.namespace_get(n).await?, *kind, n)?)?,
                    None => print_list(cli.output, &api.namespace_list().await?, |_| String::new())?,
                },
                ResourceKind::Node => match name {
                    Some(n) => print_one(cli.output, &found(api.node_get(n).await?, *kind, n)?)?,
                    None => {
                        let nodes: Vec<_> = api.node_list().await?.into_values().collect();
                        print_list(cli.output, &nodes, |n| if n.online { "online".into() } else { "offline".into() })?
                    }
                },
                ResourceKind::Deployment => match name {
                    Some(n) => print_one(cli.output, &found(api.deployment_get(ns, n).await?, *kind, n)?)?,
                    None => print_list(cli.output, &api.deployment_list(scope(cli)).await?, |d| {
                        format!("{:?} {}/{}", d.status.state, d.status.provisioned, d.spec.replicas).to_lowercase()
                    })?,
                },
                ResourceKind::Pod => match name {
                    Some(n) => print_one(cli.output, &found(api.pod_get(ns, n).await?, *kind, n)?)?,
                    None => print_list(cli.output, &api.pod_list(scope(cli)).await?, |p| {
                        format!("{:?}", p.status.state).to_lowercase()
                    })?,
                },
            }
        }
        Commands::Rm { kind, name } => {
            match kind {
                ResourceKind::Namespace => api.namespace_remove(name).await?,
                ResourceKind::Node => api.node_remove(name).await?,
                ResourceKind::Deployment => api.deployment_remove(ns, name).await?,
                ResourceKind::Pod => api.pod_remove(ns, name).await?,
            }
            if cli.output == Output::Human {
                println!("{} {} removed", kind.kind().as_str(), name);
            }
        }
        Commands::Ns { command } => match command {
            NsCommand::Create { name } => {
                let m = NamespaceManifest { meta: ManifestMeta { name: Some(name.clone()), ..Default::default() } };
                m.validate()?;
                print_one(cli.output, &api.namespace_create(&m).await?)?;
            }
            NsCommand::Ls => print_list(cli.output, &api.namespace_list().await?, |_| String::new())?,
        },
        Commands::Node { command } => {
            let node = match command {
                NodeCommand::Register { name, region, provider, token } => {
                    let opts = NodeCreateOptions {
                        name: name.clone(),
                        token: token.clone(),
                        region: region.clone(),
                        provider: provider.clone(),
                        ..Default::default()
                    };
                    api.node_create(opts).await?
                }
                NodeCommand::Online { name } => api.node_set_online(name).await?,
                NodeCommand::Offline { name } => api.node_set_offline(name).await?,
            };
            print_one(cli.output, &node)?;
        }
        Commands::Serve { .. } | Commands::Watch { .. } => bail!("handled before dispatch"),
    }
    Ok(())
}

fn command_name(c: &Commands) -> &'static str {
    match c {
        Commands::Serve { .. } => "serve",
        Commands::Apply { .. } => "apply",
        Commands::Get { .. } => "get",
        Commands::Rm { .. } => "rm",
        Commands::Watch { .. } => "watch",
        Commands::Ns { .. } => "ns",
        Commands::Node { .. } => "node",
    }
}

/// Listing without `--ns` spans every namespace.
fn scope(cli: &Cli) -> &str {
    cli.namespace.as_deref().unwrap_or("")
}

fn found<T>(v: Option<T>, kind: ResourceKind, name: &str) -> Result<T> {
    v.ok_or_else(|| ApiError::NotFound(format!("{} {}", kind.kind().as_str(), name)).into())
}

fn verb(created: bool, changed: bool) -> &'static str {
    match (created, changed) {
        (true, _) => "created",
        (false, true) => "configured",
        (false, false) => "unchanged",
    }
}

fn print_one<T: Serialize + Object>(output: Output, item: &T) -> Result<()> {
    match output {
        Output::Human => print!("{}", serde_yaml::to_string(item)?),
        Output::Json => println!("{}", serde_json::to_string_pretty(item)?),
    }
    Ok(())
}

fn print_list<T: Object>(output: Output, items: &[T], detail: impl Fn(&T) -> String) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<11} {:<28} {:<8} STATUS", "NAMESPACE", "NAME", "AGE");
            for item in items {
                let meta: &Meta = item.meta();
                let ns_col = meta.namespace.clone().unwrap_or_else(|| "-".to_string());
                println!("{:<11} {:<28} {:<8} {}", ns_col, meta.name, render_age(meta.created.timestamp()), detail(item));
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(items)?),
    }
    Ok(())
}

fn render_age(creation_ts: i64) -> String {
    if creation_ts <= 0 { return "-".to_string(); }
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
    let mut secs = (now - creation_ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
