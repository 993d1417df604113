//! helm CLI implementation of `ChartOps`.

use std::process::Stdio;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{ChartOps, HelmConfig, ListedRepository, OpsError, OpsResult, Release, ReleaseSpec, RepositoryEntry};

/// Extra time granted to the process beyond helm's own `--timeout`.
const KILL_GRACE: Duration = Duration::from_secs(15);
/// Bound for commands that do not take a caller timeout.
const SHORT_LIMIT: Duration = Duration::from_secs(120);

pub struct HelmCli {
    config: HelmConfig,
}

#[derive(Deserialize)]
struct WireInfo {
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
struct WireRelease {
    name: String,
    #[serde(default)]
    namespace: String,
    version: u32,
    info: WireInfo,
}

fn parse_release(raw: &[u8]) -> OpsResult<Release> {
    let w: WireRelease =
        serde_json::from_slice(raw).map_err(|e| OpsError::Failed(format!("decoding helm release json: {}", e)))?;
    Ok(Release { name: w.name, namespace: w.namespace, revision: w.version, status: w.info.status })
}

fn parse_repositories(raw: &[u8]) -> OpsResult<Vec<ListedRepository>> {
    serde_json::from_slice(raw).map_err(|e| OpsError::Failed(format!("decoding helm repo list json: {}", e)))
}

/// Turn helm's stderr into an error kind.
fn classify(op: &str, stderr: &str) -> OpsError {
    let lower = stderr.to_ascii_lowercase();
    let line = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim().to_string();
    if lower.contains("not found") || lower.contains("no repo named") {
        OpsError::NotFound(format!("{}: {}", op, line))
    } else if lower.contains("timed out") || lower.contains("deadline exceeded") {
        OpsError::Timeout(format!("{}: {}", op, line))
    } else {
        OpsError::Failed(format!("{}: {}", op, line))
    }
}

fn upgrade_args(spec: &ReleaseSpec, limit: Duration) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "upgrade".into(),
        "--install".into(),
        spec.name.clone(),
        spec.chart.clone(),
        "--namespace".into(),
        spec.namespace.clone(),
        "--create-namespace".into(),
        "--values".into(),
        "-".into(),
        "--wait".into(),
        "--timeout".into(),
        format!("{}s", limit.as_secs()),
        "--output".into(),
        "json".into(),
    ];
    if let Some(v) = &spec.version {
        args.push("--version".into());
        args.push(v.clone());
    }
    args
}

fn repo_add_args(entry: &RepositoryEntry) -> Vec<String> {
    let mut args: Vec<String> =
        vec!["repo".into(), "add".into(), entry.name.clone(), entry.url.clone(), "--force-update".into()];
    if let Some(u) = &entry.username {
        args.push("--username".into());
        args.push(u.clone());
        args.push("--password-stdin".into());
    }
    args
}

impl HelmCli {
    pub fn new(config: HelmConfig) -> Self { Self { config } }

    fn global_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(p) = &self.config.repository_cache {
            args.push("--repository-cache".to_string());
            args.push(p.display().to_string());
        }
        if let Some(p) = &self.config.repository_config {
            args.push("--repository-config".to_string());
            args.push(p.display().to_string());
        }
        if let Some(c) = &self.config.kube_context {
            args.push("--kube-context".to_string());
            args.push(c.clone());
        }
        args
    }

    /// Run one helm command; the child is killed if `limit` elapses.
    async fn run(&self, op: &'static str, args: Vec<String>, input: Option<Vec<u8>>, limit: Duration) -> OpsResult<Vec<u8>> {
        let t0 = Instant::now();
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(self.global_args())
            .args(&args)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(op, args = ?args, "helm: exec");
        let mut child = cmd
            .spawn()
            .map_err(|e| OpsError::Failed(format!("spawning {}: {}", self.config.binary.display(), e)))?;
        let stdin = child.stdin.take();
        let work = async move {
            if let (Some(mut pipe), Some(bytes)) = (stdin, input) {
                pipe.write_all(&bytes).await?;
                pipe.shutdown().await?;
            }
            child.wait_with_output().await
        };
        let output = match timeout(limit, work).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                counter!("helm_ops_total", 1u64, "op" => op, "outcome" => "error");
                return Err(OpsError::Failed(format!("{}: {}", op, e)));
            }
            Err(_) => {
                counter!("helm_ops_total", 1u64, "op" => op, "outcome" => "timeout");
                warn!(op, limit_s = limit.as_secs(), "helm: command timed out");
                return Err(OpsError::Timeout(format!("{} exceeded {}s", op, limit.as_secs())));
            }
        };
        histogram!("helm_op_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
        if output.status.success() {
            counter!("helm_ops_total", 1u64, "op" => op, "outcome" => "ok");
            info!(op, took_ms = %t0.elapsed().as_millis(), "helm: ok");
            Ok(output.stdout)
        } else {
            counter!("helm_ops_total", 1u64, "op" => op, "outcome" => "error");
            Err(classify(op, &String::from_utf8_lossy(&output.stderr)))
        }
    }
}

#[async_trait::async_trait]
impl ChartOps for HelmCli {
    async fn update_repository_index(&self) -> OpsResult<()> {
        match self.run("repo_update", vec!["repo".into(), "update".into()], None, SHORT_LIMIT).await {
            // nothing configured yet
            Err(OpsError::Failed(m)) if m.contains("no repositories") => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn add_repository(&self, entry: &RepositoryEntry) -> OpsResult<()> {
        let input = entry.username.as_ref().map(|_| entry.password.clone().unwrap_or_default().into_bytes());
        self.run("repo_add", repo_add_args(entry), input, SHORT_LIMIT).await.map(|_| ())
    }

    async fn remove_repository(&self, name: &str) -> OpsResult<()> {
        self.run("repo_remove", vec!["repo".into(), "remove".into(), name.into()], None, SHORT_LIMIT).await.map(|_| ())
    }

    async fn list_repositories(&self) -> OpsResult<Vec<ListedRepository>> {
        let args = vec!["repo".into(), "list".into(), "--output".into(), "json".into()];
        match self.run("repo_list", args, None, SHORT_LIMIT).await {
            Ok(raw) => parse_repositories(&raw),
            Err(OpsError::Failed(m)) if m.contains("no repositories") => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn status(&self, release: &str, namespace: &str) -> OpsResult<Option<Release>> {
        let args = vec!["status".into(), release.into(), "--namespace".into(), namespace.into(), "--output".into(), "json".into()];
        match self.run("status", args, None, SHORT_LIMIT).await {
            Ok(raw) => parse_release(&raw).map(Some),
            Err(OpsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn install_or_upgrade(&self, spec: &ReleaseSpec, limit: Duration) -> OpsResult<Release> {
        let values = serde_json::to_vec(&spec.values).map_err(|e| OpsError::Failed(format!("encoding values: {}", e)))?;
        let raw = self.run("upgrade", upgrade_args(spec, limit), Some(values), limit + KILL_GRACE).await?;
        parse_release(&raw)
    }

    async fn rollback(&self, release: &str, namespace: &str, revision: u32, limit: Duration) -> OpsResult<()> {
        let args = vec![
            "rollback".into(),
            release.into(),
            revision.to_string(),
            "--namespace".into(),
            namespace.into(),
            "--wait".into(),
            "--timeout".into(),
            format!("{}s", limit.as_secs()),
        ];
        self.run("rollback", args, None, limit + KILL_GRACE).await.map(|_| ())
    }

    async fn uninstall(&self, release: &str, namespace: &str) -> OpsResult<()> {
        let args = vec!["uninstall".into(), release.into(), "--namespace".into(), namespace.into()];
        self.run("uninstall", args, None, SHORT_LIMIT).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn upgrade_args_pin_version_and_read_values_from_stdin() {
        let spec = ReleaseSpec {
            name: "inst1".into(),
            namespace: "registry".into(),
            chart: "harbor/harbor".into(),
            version: Some("1.14.0".into()),
            values: serde_json::json!({}),
        };
        let args = upgrade_args(&spec, Duration::from_secs(300));
        assert_eq!(&args[..4], &["upgrade", "--install", "inst1", "harbor/harbor"]);
        assert!(args.windows(2).any(|w| w == ["--values", "-"]));
        assert!(args.windows(2).any(|w| w == ["--timeout", "300s"]));
        assert!(args.windows(2).any(|w| w == ["--version", "1.14.0"]));
    }

    #[test]
    fn repo_add_passes_password_on_stdin_only() {
        let e = RepositoryEntry {
            name: "harbor".into(),
            url: "https://helm.goharbor.io".into(),
            username: Some("robot".into()),
            password: Some("pw".into()),
        };
        let args = repo_add_args(&e);
        assert!(args.contains(&"--password-stdin".to_string()));
        assert!(!args.contains(&"pw".to_string()));
        let anon = RepositoryEntry { username: None, password: None, ..e };
        assert!(!repo_add_args(&anon).contains(&"--username".to_string()));
    }

    #[test]
    fn global_args_come_from_config() {
        let cli = HelmCli::new(HelmConfig {
            binary: PathBuf::from("helm"),
            repository_cache: Some(PathBuf::from("/var/cache/helm")),
            repository_config: Some(PathBuf::from("/etc/helm/repositories.yaml")),
            kube_context: None,
        });
        assert_eq!(
            cli.global_args(),
            vec!["--repository-cache", "/var/cache/helm", "--repository-config", "/etc/helm/repositories.yaml"]
        );
    }

    #[test]
    fn stderr_is_classified() {
        assert!(matches!(classify("status", "Error: release: not found\n"), OpsError::NotFound(_)));
        assert!(matches!(classify("repo_remove", "Error: no repo named \"x\" found"), OpsError::NotFound(_)));
        assert!(matches!(classify("upgrade", "Error: UPGRADE FAILED: timed out waiting for the condition"), OpsError::Timeout(_)));
        assert!(matches!(classify("upgrade", "Error: UPGRADE FAILED: template: bad"), OpsError::Failed(_)));
    }

    #[test]
    fn release_json_is_decoded() {
        let raw = br#"{"name":"inst1","namespace":"registry","version":3,"info":{"status":"deployed"},"chart":{}}"#;
        let r = parse_release(raw).unwrap();
        assert_eq!(r.revision, 3);
        assert!(r.is_deployed());
    }

    #[test]
    fn repo_list_json_is_decoded() {
        let raw = br#"[{"name":"harbor","url":"https://helm.goharbor.io"},{"name":"bitnami","url":"https://charts.bitnami.com/bitnami"}]"#;
        let repos = parse_repositories(raw).unwrap();
        assert_eq!(repos.len(), 2);
        assert_eq!(repos[0], ListedRepository { name: "harbor".into(), url: "https://helm.goharbor.io".into() });
        assert!(parse_repositories(b"not json").is_err());
    }

    #[tokio::test]
    async fn missing_binary_is_a_failure_not_a_panic() {
        let cli = HelmCli::new(HelmConfig { binary: PathBuf::from("/nonexistent/helm-binary"), ..Default::default() });
        let err = cli.update_repository_index().await.unwrap_err();
        assert!(matches!(err, OpsError::Failed(_)));
    }
}
