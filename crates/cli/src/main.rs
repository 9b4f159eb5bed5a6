use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_apply::membership::{load_snapshot, plan_membership, LoggingSink};
use keel_apply::{ErrorMode, LabelReconciler, ReconcileOutcome, ReconcileSettings, DEFAULT_THREAD_POOL_SIZE};
use keel_core::ShardPlanner;
use keel_inventory::DesiredNamespace;
use keel_kubehub::{ClusterSpec, KubeClusters};
use keel_persist::{default_db_path, MemoryStateStore, SqliteStateStore, StateStore};
use serde::Deserialize;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel namespace label reconciler")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// State database path (default: ~/.keel/state.db)
    #[arg(long = "state-db", env = "KEEL_STATE_DB", global = true)]
    state_db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile namespace labels declared in a config file
    Labels {
        /// YAML file with `clusters` and `namespaces`
        #[arg(long = "config")]
        config: PathBuf,
        /// Log planned changes without patching or persisting anything
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Concurrent cluster reads and label patches
        #[arg(long = "thread-pool-size", env = "KEEL_THREAD_POOL_SIZE", default_value_t = DEFAULT_THREAD_POOL_SIZE)]
        thread_pool_size: usize,
        /// Return unit errors as an error instead of exiting with status 1
        #[arg(long = "raise-errors", env = "KEEL_RAISE_ERRORS", action = ArgAction::SetTrue)]
        raise_errors: bool,
        #[arg(long = "shards", env = "KEEL_SHARDS", default_value_t = 1)]
        shards: u32,
        #[arg(long = "shard-id", env = "KEEL_SHARD_ID", default_value_t = 0)]
        shard_id: u32,
    },
    /// Plan org/team membership changes between two snapshots
    Membership {
        #[arg(long = "current")]
        current: PathBuf,
        #[arg(long = "desired")]
        desired: PathBuf,
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Inspect stored reconciler state
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
}

#[derive(Subcommand, Debug)]
enum StateCommands {
    /// List stored keys
    Ls,
    /// Print the stored value of a key
    Get { key: String },
}

#[derive(Debug, Default, Deserialize)]
struct LabelsConfig {
    #[serde(default)]
    clusters: Vec<ClusterSpec>,
    #[serde(default)]
    namespaces: Vec<DesiredNamespace>,
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Read-only callers never create the database: an existing file is opened
/// read-only and a missing one reads as empty.
fn open_state(path: Option<&Path>, read_only: bool) -> Result<Arc<dyn StateStore>> {
    if read_only {
        let path = path.map_or_else(default_db_path, |p| p.to_string_lossy().to_string());
        if !Path::new(&path).exists() {
            info!(path = %path, "state db not found; starting from empty state");
            return Ok(Arc::new(MemoryStateStore::new()));
        }
        return Ok(Arc::new(SqliteStateStore::open_read_only(&path)?));
    }
    let store = match path {
        Some(p) => SqliteStateStore::open(&p.to_string_lossy())?,
        None => SqliteStateStore::open_default()?,
    };
    Ok(Arc::new(store))
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn print_outcome(outcome: &ReconcileOutcome) {
    let prefix = if outcome.dry_run { "[dry-run] " } else { "" };
    for u in &outcome.units {
        if !u.changed.is_empty() {
            let parts: Vec<String> = u
                .changed
                .iter()
                .map(|(k, v)| match v {
                    Some(v) => format!("{}={}", k, v),
                    None => format!("-{}", k),
                })
                .collect();
            println!("{}{}: {}", prefix, u.unit, parts.join(", "));
        }
        if let Some(keys) = &u.updated_managed {
            let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
            println!("{}{}: managed [{}]", prefix, u.unit, keys.join(", "));
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Labels { config, dry_run, thread_pool_size, raise_errors, shards, shard_id } => {
            let cfg: LabelsConfig = serde_yaml::from_str(&read_file(&config)?)
                .with_context(|| format!("parsing {}", config.display()))?;
            info!(clusters = cfg.clusters.len(), namespaces = cfg.namespaces.len(), dry_run, "labels invoked");

            let settings = ReconcileSettings {
                thread_pool_size,
                error_mode: if raise_errors { ErrorMode::Raise } else { ErrorMode::Exit },
                shard: ShardPlanner::new(shards, shard_id).context("invalid shard configuration")?,
            };
            let clusters = Arc::new(KubeClusters::connect(&cfg.clusters).await);
            let state = open_state(cli.state_db.as_deref(), dry_run)?;
            let reconciler = LabelReconciler::new(settings, cfg.namespaces, clusters.clone(), state, clusters);

            let outcome = reconciler.reconcile(dry_run).await?;
            match cli.output {
                Output::Human => print_outcome(&outcome),
                Output::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
            }

            match reconciler.settings().error_mode {
                ErrorMode::Raise => {
                    outcome.into_result()?;
                }
                ErrorMode::Exit => {
                    let lines = outcome.error_lines();
                    if !lines.is_empty() {
                        for line in &lines {
                            error!("{}", line);
                        }
                        std::process::exit(1);
                    }
                }
            }
        }
        Commands::Membership { current, desired, dry_run } => {
            let cur = load_snapshot(&read_file(&current)?)?;
            let des = load_snapshot(&read_file(&desired)?)?;
            let report = plan_membership(&cur, &des, Arc::new(LoggingSink), dry_run)?;
            match cli.output {
                Output::Human => {
                    let s = report.summary;
                    println!(
                        "inserts: {}  deletes: {}  member adds: {}  member removes: {}  actions: {}",
                        s.inserts, s.deletes, s.member_adds, s.member_removes, report.actions
                    );
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
        Commands::State { command } => {
            let store = open_state(cli.state_db.as_deref(), true)?;
            match command {
                StateCommands::Ls => {
                    let keys = store.list_keys()?;
                    match cli.output {
                        Output::Human => {
                            for k in keys {
                                println!("{}", k);
                            }
                        }
                        Output::Json => println!("{}", serde_json::to_string_pretty(&keys)?),
                    }
                }
                StateCommands::Get { key } => match store.get(&key)? {
                    Some(v) => println!("{}", serde_json::to_string_pretty(&v)?),
                    None => {
                        error!(key = %key, "state key not found");
                        std::process::exit(1);
                    }
                },
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_config_parses() {
        let yaml = r#"
clusters:
  - name: prod-1
    context: prod-1-admin
  - name: dev-1
namespaces:
  - cluster: prod-1
    name: billing
    labels: {env: prod, team: payments}
  - cluster: dev-1
    name: scratch
    delete: true
"#;
        let cfg: LabelsConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.clusters.len(), 2);
        assert_eq!(cfg.clusters[1].context, None);
        assert_eq!(cfg.namespaces[0].labels.as_ref().unwrap()["team"], "payments");
        assert!(cfg.namespaces[1].delete);
        assert!(cfg.namespaces[1].labels.is_none());
    }

    #[test]
    fn read_only_state_never_creates_the_db() {
        let path = std::env::temp_dir().join(format!(
            "keel-cli-{}.db",
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        ));
        let store = open_state(Some(&path), true).unwrap();
        assert!(store.list_keys().unwrap().is_empty());
        assert!(!path.exists());

        let rw = open_state(Some(&path), false).unwrap();
        rw.set("c1/ns1-managed-labels", &serde_json::json!(["env"]), true).unwrap();
        drop(rw);
        let ro = open_state(Some(&path), true).unwrap();
        assert_eq!(ro.list_keys().unwrap().len(), 1);
        assert!(ro.set("c1/ns1-managed-labels", &serde_json::json!([]), true).is_err());
    }

    #[test]
    fn cli_reads_labels_flags() {
        let cli = Cli::try_parse_from([
            "keelctl", "-o", "json", "labels", "--config", "ns.yaml", "--dry-run", "--thread-pool-size", "4", "--shards", "3",
            "--shard-id", "2",
        ])
        .unwrap();
        assert_eq!(cli.output, Output::Json);
        match cli.command {
            Commands::Labels { dry_run, thread_pool_size, shards, shard_id, .. } => {
                assert!(dry_run);
                assert_eq!((thread_pool_size, shards, shard_id), (4, 3, 2));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
