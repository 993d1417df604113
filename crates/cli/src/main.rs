use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use berth_api::HarborConnector;
use berth_apply::spec_hash;
use berth_core::prelude::*;
use berth_engine::kinds::instance::{instance_hash, resolve_release};
use berth_engine::{machine, policy_for, Context, Dispatcher, Engine, EngineConfig, NamedLocks};
use berth_kubehub::{start_watchers, KubeStore};
use berth_ops::{HelmCli, HelmConfig};
use berth_store::MemoryStore;
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "berthctl", version, about = "Berth: declarative registry-platform controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to watch (default: all namespaces)
    #[arg(long = "namespace", alias = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller against the current cluster until Ctrl-C
    Run {
        /// Concurrent reconcile workers
        #[arg(long = "workers", env = "BERTH_WORKERS")]
        workers: Option<usize>,
        /// Per-request timeout for registry-platform calls, in seconds
        #[arg(long = "remote-timeout", env = "BERTH_REMOTE_TIMEOUT_SECS", default_value_t = 30)]
        remote_timeout: u64,
        /// helm binary to invoke
        #[arg(long = "helm-bin", env = "BERTH_HELM_BIN")]
        helm_bin: Option<PathBuf>,
        /// kube context passed to helm
        #[arg(long = "helm-kube-context", env = "BERTH_HELM_KUBE_CONTEXT")]
        helm_kube_context: Option<String>,
    },
    /// Print the per-kind policy table
    Kinds,
    /// Validate manifests without touching the cluster
    Check {
        /// YAML files, each holding one or more documents
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print the SpecHash of each manifest's resolved configuration
    Hash {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn init_tracing() {
    let env = std::env::var("BERTH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("BERTH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid BERTH_METRICS_ADDR; expected host:port");
        }
    }
}

/// Records parsed from every YAML document in `path`.
fn load_manifests(path: &Path) -> Result<Vec<EngineResult<Record>>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(&text) {
        let v = serde_json::Value::deserialize(doc).with_context(|| format!("parsing {}", path.display()))?;
        if v.is_null() {
            continue;
        }
        out.push(record_from_manifest(&v));
    }
    Ok(out)
}

fn record_from_manifest(v: &serde_json::Value) -> EngineResult<Record> {
    let kind: Kind = v.get("kind").and_then(|k| k.as_str()).unwrap_or_default().parse()?;
    let meta = v.get("metadata");
    let field = |k: &str| meta.and_then(|m| m.get(k)).and_then(|s| s.as_str()).unwrap_or_default().to_string();
    let name = field("name");
    if name.is_empty() {
        return Err(EngineError::Validation(format!("{}: metadata.name is required", kind)));
    }
    let ns = Some(field("namespace")).filter(|n| !n.is_empty()).unwrap_or_else(|| "default".into());
    let spec = v.get("spec").cloned().unwrap_or(serde_json::Value::Null);
    let rec = Record::from_parts(kind, RecordMeta::new(ns, name), spec, None)?;
    rec.spec.validate(rec.name())?;
    Ok(rec)
}

#[derive(Serialize)]
struct KindRow {
    kind: &'static str,
    settled: &'static str,
    phases: Vec<&'static str>,
    exclusive: Option<&'static str>,
    dependents: Vec<&'static str>,
}

fn kind_rows() -> Vec<KindRow> {
    Kind::ALL
        .iter()
        .map(|&k| {
            let p = policy_for(k);
            KindRow {
                kind: k.as_str(),
                settled: p.settled().as_str(),
                phases: machine::reachable(p).iter().map(|ph| ph.as_str()).collect(),
                exclusive: p.exclusive(),
                dependents: p.dependents().iter().map(|d| d.as_str()).collect(),
            }
        })
        .collect()
}

#[derive(Serialize)]
struct CheckRow {
    file: String,
    target: Option<String>,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
}

impl CheckRow {
    fn ok(file: &str, rec: &Record) -> Self {
        Self { file: file.to_string(), target: Some(rec.object_ref().to_string()), ok: true, error: None, hash: None }
    }

    fn failed(file: &str, target: Option<&Record>, e: impl std::fmt::Display) -> Self {
        Self {
            file: file.to_string(),
            target: target.map(|r| r.object_ref().to_string()),
            ok: false,
            error: Some(e.to_string()),
            hash: None,
        }
    }
}

fn load_all(files: &[PathBuf]) -> Result<Vec<(String, EngineResult<Record>)>> {
    let mut out = Vec::new();
    for f in files {
        let file = f.display().to_string();
        out.extend(load_manifests(f)?.into_iter().map(|r| (file.clone(), r)));
    }
    Ok(out)
}

fn check_rows(files: &[PathBuf]) -> Result<Vec<CheckRow>> {
    Ok(load_all(files)?
        .into_iter()
        .map(|(file, res)| match res {
            Ok(rec) => CheckRow::ok(&file, &rec),
            Err(e) => CheckRow::failed(&file, None, e),
        })
        .collect())
}

/// SpecHash as the engine computes it. Instance values documents are read
/// from cluster secrets; the cluster is only contacted when one is named.
async fn resolved_hash(rec: &Record, cluster: &mut Option<KubeStore>) -> Result<String> {
    let Spec::Instance(spec) = &rec.spec else {
        return Ok(spec_hash(&rec.spec.to_json())?);
    };
    let release = if spec.chart.values_from.is_empty() {
        resolve_release(&MemoryStore::new(), rec, spec).await?
    } else {
        let store = match cluster.take() {
            Some(s) => s,
            None => KubeStore::new(berth_kubehub::connect().await.context("connecting to the cluster")?),
        };
        let release = resolve_release(&store, rec, spec).await;
        *cluster = Some(store);
        release?
    };
    Ok(instance_hash(spec, &release)?)
}

async fn hash_rows(files: &[PathBuf]) -> Result<Vec<CheckRow>> {
    let mut cluster = None;
    let mut rows = Vec::new();
    for (file, res) in load_all(files)? {
        rows.push(match res {
            Ok(rec) => match resolved_hash(&rec, &mut cluster).await {
                Ok(h) => CheckRow { hash: Some(h), ..CheckRow::ok(&file, &rec) },
                Err(e) => CheckRow::failed(&file, Some(&rec), format!("{:#}", e)),
            },
            Err(e) => CheckRow::failed(&file, None, e),
        });
    }
    Ok(rows)
}

struct RunArgs {
    namespace: Option<String>,
    workers: Option<usize>,
    remote_timeout: u64,
    helm: HelmConfig,
}

async fn run_controller(args: RunArgs) -> Result<()> {
    let RunArgs { namespace, workers, remote_timeout, helm } = args;
    let mut config = EngineConfig::from_env();
    if let Some(w) = workers.filter(|w| *w > 0) {
        config.workers = w;
    }
    let client = berth_kubehub::connect().await.context("connecting to the cluster")?;
    let store = Arc::new(KubeStore::new(client.clone()));
    let registries = HarborConnector::new(Duration::from_secs(remote_timeout))?;
    let charts = HelmCli::new(helm);
    info!(
        workers = config.workers,
        ns = ?namespace,
        finalizer = %config.finalizer,
        resync_secs = config.resync.as_secs(),
        "controller starting"
    );
    let engine = Arc::new(Engine::new(Context {
        store: store.clone(),
        credentials: store,
        registries: Arc::new(registries),
        charts: Arc::new(charts),
        config,
        locks: NamedLocks::default(),
    }));

    let (tx, rx) = mpsc::unbounded_channel();
    let watchers = start_watchers(client, namespace.as_deref(), tx);
    let shutdown = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received; draining in-flight runs"),
            Err(e) => error!(error = %e, "waiting for Ctrl-C failed; stopping"),
        }
    };
    let stats = Dispatcher::new(engine).run(rx, shutdown).await;
    for w in watchers {
        w.abort();
    }
    info!(runs = stats.runs, errors = stats.errors, "controller stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { workers, remote_timeout, helm_bin, helm_kube_context } => {
            let mut helm = HelmConfig::from_env();
            if let Some(bin) = helm_bin {
                helm.binary = bin;
            }
            if helm_kube_context.is_some() {
                helm.kube_context = helm_kube_context;
            }
            run_controller(RunArgs { namespace: cli.namespace, workers, remote_timeout, helm }).await?
        }
        Commands::Kinds => {
            let rows = kind_rows();
            match cli.output {
                Output::Human => {
                    println!("{:<16} {:<10} {:<22} DEPENDENTS", "KIND", "SETTLED", "EXCLUSIVE");
                    for r in rows {
                        let deps = if r.dependents.is_empty() { "-".to_string() } else { r.dependents.join(",") };
                        println!("{:<16} {:<10} {:<22} {}", r.kind, r.settled, r.exclusive.unwrap_or("-"), deps);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
        Commands::Check { files } => {
            let rows = check_rows(&files)?;
            let failed = rows.iter().filter(|r| !r.ok).count();
            match cli.output {
                Output::Human => {
                    for r in &rows {
                        match (&r.target, &r.error) {
                            (Some(t), None) => println!("ok      {}  ({})", t, r.file),
                            (_, Some(e)) => println!("invalid {}  {}", r.file, e),
                            _ => {}
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
            if failed > 0 {
                anyhow::bail!("{} of {} manifests invalid", failed, rows.len());
            }
        }
        Commands::Hash { files } => {
            let rows = hash_rows(&files).await?;
            match cli.output {
                Output::Human => {
                    for r in &rows {
                        match (&r.target, &r.hash, &r.error) {
                            (Some(t), Some(h), _) => println!("{}  {}", h, t),
                            (t, _, Some(e)) => eprintln!("skipped {} {}: {}", r.file, t.as_deref().unwrap_or(""), e),
                            _ => {}
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifests_parse_into_records() {
        let v = serde_json::json!({
            "apiVersion": "registries.berth.dev/v1alpha1",
            "kind": "Registry",
            "metadata": {"name": "hub", "namespace": "infra"},
            "spec": {"parent": "inst1", "url": "https://hub.docker.com", "type": "docker-hub"}
        });
        let rec = record_from_manifest(&v).unwrap();
        assert_eq!(rec.object_ref(), ObjectRef::new(Kind::Registry, "infra", "hub"));
    }

    #[test]
    fn manifests_are_validated() {
        let v = serde_json::json!({
            "kind": "Replication",
            "metadata": {"name": "rep"},
            "spec": {"parent": "inst1", "srcRegistry": "a", "destRegistry": "b"}
        });
        let err = record_from_manifest(&v).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
        let unknown = serde_json::json!({"kind": "Pod", "metadata": {"name": "x"}});
        assert!(record_from_manifest(&unknown).is_err());
    }

    #[tokio::test]
    async fn instance_hash_matches_the_resolved_release() {
        let v = serde_json::json!({
            "kind": "Instance",
            "metadata": {"name": "inst1", "namespace": "ns"},
            "spec": {
                "instanceUrl": "https://harbor.example.com",
                "adminSecret": {"name": "admin", "key": "password"},
                "chart": {"repository": "harbor", "chart": "harbor", "values": {"b": 1, "a": 2}}
            }
        });
        let rec = record_from_manifest(&v).unwrap();
        let mut cluster = None;
        let h1 = resolved_hash(&rec, &mut cluster).await.unwrap();
        let Spec::Instance(spec) = &rec.spec else { panic!("not an instance") };
        let release = resolve_release(&MemoryStore::new(), &rec, spec).await.unwrap();
        assert_eq!(h1, instance_hash(spec, &release).unwrap());
        assert_eq!(h1, spec_hash(&release).unwrap());
        assert!(cluster.is_none());
    }

    #[test]
    fn kind_table_lists_every_kind() {
        let rows = kind_rows();
        assert_eq!(rows.len(), Kind::ALL.len());
        let rep = rows.iter().find(|r| r.kind == "Replication").unwrap();
        assert_eq!(rep.settled, "Completed");
        assert!(rep.phases.contains(&"ExecutionRunning"));
    }
}
