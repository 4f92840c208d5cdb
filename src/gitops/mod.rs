//! GitOps drift detection.
//!
//! Each configured repository gets one background worker that keeps a
//! shallow clone fresh, renders its kustomization into manifests, and
//! compares every rendered resource against the live cluster through a
//! server-side-apply dry-run. Periodic ticks are leader-gated; the sink's
//! own leader check covers the initial comparison at worker start.

pub mod compare;
pub mod render;
pub mod repo;

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::context::AppContext;

const DEFAULT_BRANCH: &str = "main";
const DEFAULT_SUB_PATH: &str = ".";
const DEFAULT_HELM_COMMAND: &str = "helm";
const FALLBACK_SYNC_INTERVAL_MINUTES: u64 = 5;

/// Extra state carried for every tracked GitOps resource.
#[derive(Debug, Clone, Default)]
pub struct GitOpsInfo {
    pub repository_name: String,
    pub resource_kind: String,
    pub resource_name: String,
    pub namespace: String,
    pub mismatch_type: String,
    pub expected_hash: String,
    pub actual_hash: String,
}

/// Mutable sync bookkeeping for a repository.
#[derive(Debug, Default)]
pub struct SyncState {
    pub last_commit: String,
    pub last_sync: Option<DateTime<Utc>>,
}

/// One monitored Git repository and its local working tree.
pub struct RepoWorker {
    pub name: String,
    pub url: String,
    pub branch: String,
    pub sub_path: String,
    pub local_path: PathBuf,
    pub helm_command: String,
    pub copy_env_example: bool,
    pub sync_interval: Duration,
    /// Guards the on-disk working tree: sync holds it exclusively,
    /// rendering holds it shared.
    pub tree_lock: RwLock<()>,
    pub sync_state: Mutex<SyncState>,
}

/// Build the repository registry and spawn one worker per repository.
///
/// The only error returned is a discovery failure: without the
/// kind→resource mapping every comparison would silently skip. Anything
/// else disables GitOps monitoring and lets the rest of the agent run.
pub async fn setup(ctx: Arc<AppContext>, shutdown: watch::Receiver<bool>) -> Result<()> {
    let config = ctx.config().await;

    if config.gitops.repositories.is_empty() {
        info!("no GitOps repositories configured");
        return Ok(());
    }

    info!(
        repositories = config.gitops.repositories.len(),
        "setting up GitOps monitoring"
    );

    compare::init_discovery(&ctx).await?;

    let temp_dir = match tempfile::Builder::new().prefix("sun-gitops-").tempdir() {
        Ok(dir) => dir.keep(),
        Err(err) => {
            error!(error = %err, "failed to create temp directory, GitOps monitoring disabled");
            return Ok(());
        }
    };

    for repo in &config.gitops.repositories {
        if repo.name.is_empty() || repo.url.is_empty() {
            warn!(name = %repo.name, url = %repo.url, "skipping repository with missing name or URL");
            continue;
        }

        let sub_path = if repo.path.is_empty() {
            DEFAULT_SUB_PATH.to_string()
        } else {
            repo.path.clone()
        };
        let branch = if repo.branch.is_empty() {
            DEFAULT_BRANCH.to_string()
        } else {
            repo.branch.clone()
        };
        let helm_command = if repo.kustomize.helm_command.is_empty() {
            DEFAULT_HELM_COMMAND.to_string()
        } else {
            repo.kustomize.helm_command.clone()
        };
        let sync_interval_minutes = repo
            .sync_interval_minutes
            .filter(|m| *m > 0)
            .or(Some(config.gitops.sync_interval_minutes))
            .filter(|m| *m > 0)
            .unwrap_or(FALLBACK_SYNC_INTERVAL_MINUTES);

        let worker = Arc::new(RepoWorker {
            name: repo.name.clone(),
            url: repo.url.clone(),
            branch,
            sub_path,
            local_path: temp_dir.join(&repo.name),
            helm_command,
            copy_env_example: repo.kustomize.copy_env_example,
            sync_interval: Duration::from_secs(sync_interval_minutes * 60),
            tree_lock: RwLock::new(()),
            sync_state: Mutex::new(SyncState::default()),
        });

        debug!(
            name = %worker.name,
            url = %worker.url,
            path = %worker.sub_path,
            branch = %worker.branch,
            local_path = %worker.local_path.display(),
            sync_interval_minutes,
            "GitOps repository configured"
        );

        tokio::spawn(run_worker(ctx.clone(), worker, shutdown.clone()));
    }

    info!("GitOps monitoring started");
    Ok(())
}

async fn run_worker(
    ctx: Arc<AppContext>,
    worker: Arc<RepoWorker>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(repository = %worker.name, "starting GitOps repository monitoring");

    if let Err(err) = worker.sync().await {
        error!(repository = %worker.name, error = %err, "failed initial repository sync");
        return;
    }

    if let Err(err) = compare::compare_repository(&ctx, &worker).await {
        error!(repository = %worker.name, error = %err, "failed initial manifest comparison");
    }

    let mut ticker = tokio::time::interval(worker.sync_interval);
    ticker.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!(repository = %worker.name, "stopping GitOps repository monitoring");
                return;
            }
            _ = ticker.tick() => {}
        }

        if !ctx.is_leader() {
            continue;
        }

        debug!(repository = %worker.name, "syncing GitOps repository");

        if let Err(err) = worker.sync().await {
            error!(repository = %worker.name, error = %err, "failed to sync repository");
            continue;
        }

        if let Err(err) = compare::compare_repository(&ctx, &worker).await {
            error!(repository = %worker.name, error = %err, "failed to compare manifests");
        }
    }
}
