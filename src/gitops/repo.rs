//! Git synchronization for repository workers.
//!
//! Shallow single-branch clones kept fresh by fast-forward pulls; any pull
//! failure throws the local tree away and re-clones. All git work happens
//! under the worker's exclusive tree lock.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::RepoWorker;

impl RepoWorker {
    /// Bring the local working tree up to date with the remote branch and
    /// record the resulting HEAD commit.
    pub async fn sync(&self) -> Result<()> {
        let _guard = self.tree_lock.write().await;

        debug!(repository = %self.name, url = %self.url, "syncing repository");

        if !self.local_path.join(".git").is_dir() {
            debug!(
                repository = %self.name,
                local_path = %self.local_path.display(),
                "cloning repository"
            );
            self.clone_repository()
                .await
                .with_context(|| format!("failed to clone repository {}", self.name))?;
            info!(repository = %self.name, "repository cloned successfully");
        } else if let Err(err) = self.pull().await {
            warn!(
                repository = %self.name,
                error = %err,
                "failed to pull repository, attempting to re-clone"
            );

            if let Err(err) = tokio::fs::remove_dir_all(&self.local_path).await {
                warn!(
                    repository = %self.name,
                    local_path = %self.local_path.display(),
                    error = %err,
                    "failed to remove corrupted repository directory"
                );
            }

            self.clone_repository().await.with_context(|| {
                format!("failed to re-clone repository {} after pull failure", self.name)
            })?;
            info!(repository = %self.name, "repository re-cloned successfully after pull failure");
        } else {
            debug!(repository = %self.name, "repository updated");
        }

        let head = self
            .head_commit()
            .await
            .with_context(|| format!("failed to get HEAD for repository {}", self.name))?;

        let mut sync_state = self.sync_state.lock().await;
        if head != sync_state.last_commit {
            info!(
                repository = %self.name,
                commit = &head[..head.len().min(8)],
                "repository updated to new commit"
            );
            sync_state.last_commit = head;
        }
        sync_state.last_sync = Some(Utc::now());

        Ok(())
    }

    async fn clone_repository(&self) -> Result<()> {
        let output = Command::new("git")
            .args(["clone", "--depth", "1", "--single-branch", "--branch"])
            .arg(&self.branch)
            .arg(&self.url)
            .arg(&self.local_path)
            .output()
            .await
            .context("failed to execute git")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git clone failed: {}", stderr.trim());
        }
        Ok(())
    }

    async fn pull(&self) -> Result<()> {
        // "Already up to date" exits zero, so it needs no special casing.
        run_git(
            Some(&self.local_path),
            &["pull", "--ff-only", "origin", &self.branch],
        )
        .await?;
        Ok(())
    }

    async fn head_commit(&self) -> Result<String> {
        let stdout = run_git(Some(&self.local_path), &["rev-parse", "HEAD"]).await?;
        Ok(stdout.trim().to_string())
    }
}

async fn run_git(workdir: Option<&Path>, args: &[&str]) -> Result<String> {
    let mut command = Command::new("git");
    if let Some(dir) = workdir {
        command.arg("-C").arg(dir);
    }
    let output = command
        .args(args)
        .output()
        .await
        .context("failed to execute git")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {} failed: {}", args.first().unwrap_or(&""), stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
