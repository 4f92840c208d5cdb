//! Configuration tree, defaults, and hot reload.
//!
//! The agent reads a YAML file named `config` (with or without extension)
//! from the working directory, overrides the webhook URL from the
//! environment, and re-reads the file whenever it changes on disk. A failed
//! reload keeps the previous configuration in force.

use anyhow::{Context, Result};
use notify::{
    event::{DataChange, EventKind, ModifyKind},
    RecursiveMode, Watcher,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Handle used to re-apply the log level after a config reload.
pub type LogReloadHandle = reload::Handle<EnvFilter, Registry>;

/// Coalesce editor save bursts (write temp, rename, chmod) into one reload.
const FILE_CHANGE_DEBOUNCE_MS: u64 = 1000;

const WEBHOOK_URL_ENV: &str = "WEBHOOK_URL";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub webhook_url: String,
    pub namespace: String,
    pub log_level: String,
    /// Minimum dwell time in minutes before the first alert; 0 fires
    /// immediately.
    pub interval: u64,
    pub resource_monitoring: ResourceMonitoringConfig,
    pub node_monitoring: NodeMonitoringConfig,
    pub longhorn: LonghornConfig,
    pub gitops: GitOpsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            namespace: String::new(),
            log_level: "info".to_string(),
            interval: 3,
            resource_monitoring: ResourceMonitoringConfig::default(),
            node_monitoring: NodeMonitoringConfig::default(),
            longhorn: LonghornConfig::default(),
            gitops: GitOpsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResourceMonitoringConfig {
    pub enabled: bool,
    pub denylist: KindDenylist,
}

impl Default for ResourceMonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            denylist: KindDenylist::default(),
        }
    }
}

/// Reserved for future per-kind filtering.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KindDenylist {
    pub kinds: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeMonitoringConfig {
    pub enabled: bool,
    pub cpu_threshold_percent: f64,
}

impl Default for NodeMonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cpu_threshold_percent: 80.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LonghornConfig {
    pub enabled: bool,
    pub namespace: String,
    pub monitor: LonghornMonitor,
    pub alert_thresholds: LonghornThresholds,
}

impl Default for LonghornConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            namespace: "longhorn-system".to_string(),
            monitor: LonghornMonitor::default(),
            alert_thresholds: LonghornThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LonghornMonitor {
    pub volumes: bool,
    pub replicas: bool,
    pub engines: bool,
    pub nodes: bool,
    pub backups: bool,
}

impl Default for LonghornMonitor {
    fn default() -> Self {
        Self {
            volumes: true,
            replicas: true,
            engines: true,
            nodes: true,
            backups: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LonghornThresholds {
    pub volume_usage_percent: f64,
    /// Bytes of remaining capacity below which a volume alerts.
    pub volume_capacity_critical: i64,
    pub replica_failure_count: u32,
}

impl Default for LonghornThresholds {
    fn default() -> Self {
        Self {
            volume_usage_percent: 85.0,
            volume_capacity_critical: 1_073_741_824,
            replica_failure_count: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitOpsConfig {
    pub enabled: bool,
    pub alert_on_mismatch: bool,
    pub sync_interval_minutes: u64,
    pub auto_fix: GitOpsAutoFix,
    pub allowlist: GitOpsFilter,
    pub denylist: GitOpsFilter,
    pub repositories: Vec<GitRepositoryConfig>,
}

impl Default for GitOpsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            alert_on_mismatch: true,
            sync_interval_minutes: 5,
            auto_fix: GitOpsAutoFix::default(),
            allowlist: GitOpsFilter::default(),
            denylist: GitOpsFilter::default(),
            repositories: Vec::new(),
        }
    }
}

/// Parsed but inert: no reverse-apply path exists yet.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GitOpsAutoFix {
    pub enabled: bool,
    pub kinds: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GitOpsFilter {
    pub kinds: Vec<String>,
    pub namespaces: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GitRepositoryConfig {
    pub name: String,
    pub url: String,
    /// Path to the kustomization root within the repository. Empty means
    /// the repository root.
    pub path: String,
    /// Empty means `main`.
    pub branch: String,
    /// `None` inherits the global `gitops.alert_on_mismatch`.
    pub alert_on_mismatch: Option<bool>,
    /// `None` inherits the global `gitops.sync_interval_minutes`.
    pub sync_interval_minutes: Option<u64>,
    pub kustomize: KustomizeConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KustomizeConfig {
    #[serde(rename = "helmCommand")]
    pub helm_command: String,
    #[serde(rename = "copyEnvExample")]
    pub copy_env_example: bool,
}

impl Config {
    /// Read and parse the file at `path`, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Config =
            serde_yaml::from_str(&raw).context("failed to parse config YAML")?;

        if let Ok(url) = std::env::var(WEBHOOK_URL_ENV) {
            if !url.is_empty() {
                config.webhook_url = url;
                info!("using webhook URL from environment variable");
            }
        }

        Ok(config)
    }

    /// Whether mismatch alerts are enabled for the named repository:
    /// the global flag must be on, and the per-repo flag (inheriting the
    /// global when not explicitly set) must not switch it off.
    pub fn gitops_alerts_enabled(&self, repository: &str) -> bool {
        if !self.gitops.alert_on_mismatch {
            return false;
        }
        self.gitops
            .repositories
            .iter()
            .find(|r| r.name == repository)
            .and_then(|r| r.alert_on_mismatch)
            .unwrap_or(true)
    }

    /// One-line summary of the effective tree, logged on every (re)load.
    pub fn log_summary(&self, action: &str) {
        info!(
            namespace = %self.namespace,
            log_level = %self.log_level,
            interval = self.interval,
            resource_monitoring_enabled = self.resource_monitoring.enabled,
            node_monitoring_enabled = self.node_monitoring.enabled,
            cpu_threshold_percent = self.node_monitoring.cpu_threshold_percent,
            longhorn_enabled = self.longhorn.enabled,
            longhorn_namespace = %self.longhorn.namespace,
            gitops_enabled = self.gitops.enabled,
            gitops_alert_on_mismatch = self.gitops.alert_on_mismatch,
            gitops_sync_interval_minutes = self.gitops.sync_interval_minutes,
            gitops_auto_fix_enabled = self.gitops.auto_fix.enabled,
            gitops_repositories = self.gitops.repositories.len(),
            "configuration {action}"
        );
    }
}

/// Locate the config file in the working directory.
pub fn find_config_file() -> Option<PathBuf> {
    ["config.yaml", "config.yml", "config"]
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
}

/// Re-read the config whenever the file changes and push the result into
/// the shared handle. The log level is re-applied on every successful
/// reload unless `RUST_LOG` is set.
pub async fn watch_and_reload(
    ctx: Arc<crate::context::AppContext>,
    path: PathBuf,
    log_handle: LogReloadHandle,
) {
    let (tx, mut rx) = mpsc::channel::<()>(4);

    let _watcher = match start_file_watcher(&path, tx) {
        Ok(w) => w,
        Err(err) => {
            error!(error = %err, path = %path.display(), "failed to start config file watcher");
            return;
        }
    };

    while rx.recv().await.is_some() {
        info!(path = %path.display(), "config file changed");
        match Config::load(&path) {
            Ok(config) => {
                config.log_summary("reloaded");
                if std::env::var("RUST_LOG").is_err() {
                    match EnvFilter::try_new(&config.log_level) {
                        Ok(filter) => {
                            if let Err(err) = log_handle.reload(filter) {
                                warn!(error = %err, "failed to apply reloaded log level");
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, level = %config.log_level, "invalid log level in config");
                        }
                    }
                }
                *ctx.config.write().await = config;
            }
            Err(err) => {
                error!(error = %err, "config reload failed, keeping previous configuration");
            }
        }
    }
}

/// Watch the config file's parent directory; editors often replace files
/// instead of modifying them in place, so a directory watch is the
/// reliable option.
fn start_file_watcher(
    config_path: &Path,
    tx: mpsc::Sender<()>,
) -> Result<notify::RecommendedWatcher> {
    let filename = config_path
        .file_name()
        .context("config path has no filename")?
        .to_os_string();
    let parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let last_trigger_ms = Arc::new(AtomicU64::new(0));

    let mut watcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            let event = match res {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = %err, "config file watcher error");
                    return;
                }
            };

            let is_write = matches!(
                event.kind,
                EventKind::Modify(ModifyKind::Data(DataChange::Any | DataChange::Content))
                    | EventKind::Create(_)
            );
            if !is_write {
                return;
            }
            let is_our_file = event
                .paths
                .iter()
                .any(|p| p.file_name().is_some_and(|f| f == filename));
            if !is_our_file {
                return;
            }

            let now_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64;
            let prev_ms = last_trigger_ms.swap(now_ms, Ordering::Relaxed);
            if now_ms.saturating_sub(prev_ms) < FILE_CHANGE_DEBOUNCE_MS {
                return;
            }

            let _ = tx.blocking_send(());
        })?;

    watcher.watch(&parent, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.interval, 3);
        assert!(config.resource_monitoring.enabled);
        assert!(config.node_monitoring.enabled);
        assert!((config.node_monitoring.cpu_threshold_percent - 80.0).abs() < f64::EPSILON);
        assert!(!config.longhorn.enabled);
        assert_eq!(config.longhorn.namespace, "longhorn-system");
        assert!(config.longhorn.monitor.volumes);
        assert!(config.longhorn.monitor.backups);
        assert!((config.longhorn.alert_thresholds.volume_usage_percent - 85.0).abs() < f64::EPSILON);
        assert_eq!(config.longhorn.alert_thresholds.volume_capacity_critical, 1_073_741_824);
        assert!(!config.gitops.enabled);
        assert!(config.gitops.alert_on_mismatch);
        assert_eq!(config.gitops.sync_interval_minutes, 5);
        assert!(!config.gitops.auto_fix.enabled);
    }

    #[test]
    fn test_repository_inheritance() {
        let yaml = r#"
gitops:
  enabled: true
  alert_on_mismatch: true
  repositories:
    - name: infra
      url: https://example.com/infra.git
    - name: apps
      url: https://example.com/apps.git
      alert_on_mismatch: false
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        // Not explicitly set: inherits the global value
        assert!(config.gitops_alerts_enabled("infra"));
        // Explicitly off stays off
        assert!(!config.gitops_alerts_enabled("apps"));
        // Unknown repositories fall back to the global flag
        assert!(config.gitops_alerts_enabled("unknown"));
    }

    #[test]
    fn test_global_alert_flag_wins() {
        let yaml = r#"
gitops:
  alert_on_mismatch: false
  repositories:
    - name: infra
      url: https://example.com/infra.git
      alert_on_mismatch: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(!config.gitops_alerts_enabled("infra"));
    }

    #[test]
    fn test_repository_parse() {
        let yaml = r#"
gitops:
  repositories:
    - name: infra
      url: https://example.com/infra.git
      path: apps/web
      branch: release
      sync_interval_minutes: 10
      kustomize:
        helmCommand: helm3
        copyEnvExample: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let repo = &config.gitops.repositories[0];
        assert_eq!(repo.path, "apps/web");
        assert_eq!(repo.branch, "release");
        assert_eq!(repo.sync_interval_minutes, Some(10));
        assert_eq!(repo.kustomize.helm_command, "helm3");
        assert!(repo.kustomize.copy_env_example);
    }

    #[test]
    fn test_full_tree_parse() {
        let yaml = r#"
webhook_url: https://discord.com/api/webhooks/x/y
namespace: production
log_level: debug
interval: 0
node_monitoring:
  enabled: true
  cpu_threshold_percent: 90
longhorn:
  enabled: true
  monitor:
    backups: false
  alert_thresholds:
    volume_usage_percent: 75
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.namespace, "production");
        assert_eq!(config.interval, 0);
        assert!((config.node_monitoring.cpu_threshold_percent - 90.0).abs() < f64::EPSILON);
        assert!(config.longhorn.enabled);
        assert!(!config.longhorn.monitor.backups);
        assert!(config.longhorn.monitor.volumes);
        assert!((config.longhorn.alert_thresholds.volume_usage_percent - 75.0).abs() < f64::EPSILON);
    }
}
