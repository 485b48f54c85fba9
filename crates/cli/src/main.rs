use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tokio::signal;
use tracing::{error, info, warn};

use speil_bridge::KubeStore;
use speil_core::{KindId, NamespaceMapping};
use speil_engine::{EngineConfig, FallbackPolicy, KindRegistry, ReflectionManager};
use speil_store::{MutableStore, ObjectStore};

#[derive(Parser, Debug)]
#[command(name = "speilctl", version, about = "Speil namespace reflection CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reflect the mappings in a config file until Ctrl-C
    Run {
        /// Path to the reflection config (YAML)
        #[arg(short = 'f', long = "config")]
        config: PathBuf,
        /// Workers per kind reflector
        #[arg(long = "workers", env = "SPEIL_WORKERS")]
        workers: Option<usize>,
        /// Retry attempts before a failing key is dropped
        #[arg(long = "max-retries", env = "SPEIL_MAX_RETRIES")]
        max_retries: Option<u32>,
        /// First retry delay in milliseconds
        #[arg(long = "backoff-base-ms", env = "SPEIL_BACKOFF_BASE_MS")]
        backoff_base_ms: Option<u64>,
        /// Retry delay ceiling in milliseconds
        #[arg(long = "backoff-max-ms", env = "SPEIL_BACKOFF_MAX_MS")]
        backoff_max_ms: Option<u64>,
        /// How long a stopping mapping waits for in-flight keys
        #[arg(long = "stop-grace-secs", env = "SPEIL_STOP_GRACE_SECS")]
        stop_grace_secs: Option<u64>,
    },
    /// List the kinds this build knows how to reflect
    Kinds,
    /// Validate a config file without touching any cluster
    Check {
        /// Path to the reflection config (YAML)
        #[arg(short = 'f', long = "config")]
        config: PathBuf,
    },
}

/// On-disk reflection config.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReflectionConfig {
    /// Kind keys, e.g. "v1/ConfigMap" or "networking.k8s.io/v1/Ingress".
    kinds: Vec<String>,
    /// Namespace pairs, local side first.
    mappings: Vec<MappingEntry>,
    /// Kubeconfig context for the local cluster; current context when unset.
    #[serde(default)]
    local_context: Option<String>,
    /// Kubeconfig context for the remote cluster; current context when unset.
    #[serde(default)]
    remote_context: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MappingEntry {
    local: String,
    remote: String,
}

fn init_tracing() {
    let env = std::env::var("SPEIL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SPEIL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SPEIL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Engine tuning from the `run` flags (or their `SPEIL_*` env fallbacks),
/// defaults otherwise.
fn engine_config(
    workers: Option<usize>,
    max_retries: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    stop_grace_secs: Option<u64>,
) -> EngineConfig {
    let mut config = EngineConfig::default();
    if let Some(workers) = workers {
        config.workers = workers.max(1);
    }
    if let Some(attempts) = max_retries {
        config.retry.max_attempts = attempts;
    }
    if let Some(ms) = backoff_base_ms {
        config.retry.base = Duration::from_millis(ms);
    }
    if let Some(ms) = backoff_max_ms {
        config.retry.max = Duration::from_millis(ms);
    }
    if let Some(secs) = stop_grace_secs {
        config.stop_grace = Duration::from_secs(secs);
    }
    config
}

fn load_config(path: &PathBuf) -> Result<ReflectionConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: ReflectionConfig =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    if config.mappings.is_empty() {
        bail!("config has no namespace mappings");
    }
    Ok(config)
}

/// Resolve configured kind keys against the built-in set.
fn resolve_kinds(config: &ReflectionConfig) -> Result<KindRegistry> {
    let builtins = KindRegistry::with_builtins();
    let mut registry = KindRegistry::new();
    for key in &config.kinds {
        let id: KindId = key.parse().with_context(|| format!("kind key {key:?}"))?;
        let Some(kind) = builtins.get(&id) else {
            let known: Vec<String> = builtins.ids().iter().map(|k| k.to_string()).collect();
            bail!("kind {id} is not reflectable; known kinds: {}", known.join(", "));
        };
        registry
            .register(kind)
            .with_context(|| format!("kind key {key:?}"))?;
    }
    if registry.is_empty() {
        bail!("config selects no kinds");
    }
    Ok(registry)
}

fn mapping_plan(config: &ReflectionConfig) -> Result<Vec<NamespaceMapping>> {
    let mut seen = std::collections::HashSet::new();
    let mut mappings = Vec::new();
    for entry in &config.mappings {
        if entry.local.is_empty() || entry.remote.is_empty() {
            bail!("a mapping needs both a local and a remote namespace");
        }
        if !seen.insert(entry.local.clone()) {
            bail!("namespace {} appears in more than one mapping", entry.local);
        }
        mappings.push(NamespaceMapping::new(entry.local.clone(), entry.remote.clone()));
    }
    Ok(mappings)
}

async fn connect(context: Option<&str>) -> Result<Arc<KubeStore>> {
    let store = match context {
        Some(ctx) => KubeStore::connect_to_context(ctx).await?,
        None => KubeStore::connect().await?,
    };
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            workers,
            max_retries,
            backoff_base_ms,
            backoff_max_ms,
            stop_grace_secs,
        } => {
            let config = load_config(&config)?;
            let registry = resolve_kinds(&config)?;
            let mappings = mapping_plan(&config)?;
            let tuning =
                engine_config(workers, max_retries, backoff_base_ms, backoff_max_ms, stop_grace_secs);

            let local: Arc<dyn ObjectStore> = connect(config.local_context.as_deref())
                .await
                .context("connecting to the local cluster")?;
            let remote: Arc<dyn MutableStore> = connect(config.remote_context.as_deref())
                .await
                .context("connecting to the remote cluster")?;
            info!(kinds = registry.ids().len(), mappings = mappings.len(), "starting reflection");

            let manager = ReflectionManager::new(registry, local, remote, tuning);
            let mut failures = 0usize;
            for mapping in &mappings {
                let report = manager.start_mapping(mapping).await;
                for (kind, e) in &report.failed {
                    error!(kind = %kind, mapping = %mapping, error = %e, "kind failed to start");
                    failures += 1;
                }
            }
            if failures > 0 {
                warn!(failures, "some kinds are not reflecting; the rest run anyway");
            }
            metrics::gauge!("reflect_active_mappings", mappings.len() as f64);

            signal::ctrl_c().await?;
            info!("Ctrl-C received; shutting down");
            manager.shutdown().await;
        }
        Commands::Kinds => {
            let registry = KindRegistry::with_builtins();
            match cli.output {
                Output::Human => {
                    for kind in registry.iter() {
                        let policy = match kind.fallback() {
                            FallbackPolicy::Tolerant => "tolerant",
                            FallbackPolicy::RequireMapping => "require-mapping",
                        };
                        println!("{} • {}", kind.id(), policy);
                    }
                }
                Output::Json => {
                    let keys: Vec<String> =
                        registry.ids().iter().map(|k| k.to_string()).collect();
                    println!("{}", serde_json::to_string_pretty(&keys)?);
                }
            }
        }
        Commands::Check { config } => {
            let config = load_config(&config)?;
            let registry = resolve_kinds(&config)?;
            let mappings = mapping_plan(&config)?;
            match cli.output {
                Output::Human => {
                    println!("kinds:");
                    for id in registry.ids() {
                        println!("  {}", id);
                    }
                    println!("mappings:");
                    for mapping in &mappings {
                        println!("  {}", mapping);
                    }
                    println!("config ok");
                }
                Output::Json => {
                    #[derive(serde::Serialize)]
                    struct Plan {
                        kinds: Vec<String>,
                        mappings: Vec<String>,
                    }
                    let plan = Plan {
                        kinds: registry.ids().iter().map(|k| k.to_string()).collect(),
                        mappings: mappings.iter().map(|m| m.to_string()).collect(),
                    };
                    println!("{}", serde_json::to_string_pretty(&plan)?);
                }
            }
        }
    }

    Ok(())
}
