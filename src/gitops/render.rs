//! Manifest rendering for repository workers.
//!
//! Runs `kustomize build` over the repository's overlay root with load
//! restrictions disabled and helm chart inflation enabled, then parses the
//! multi-document YAML output into untyped object trees and applies the
//! configured allowlist/denylist filters.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::RepoWorker;
use crate::config::GitOpsConfig;
use crate::objects::nested_str;

const KUSTOMIZATION_FILENAMES: [&str; 3] = ["kustomization.yaml", "kustomization.yml", "Kustomization"];

/// Render the worker's kustomization into filtered manifest trees. Holds
/// the tree lock shared so a concurrent sync cannot swap the tree away
/// mid-render.
pub async fn render_manifests(worker: &RepoWorker, gitops: &GitOpsConfig) -> Result<Vec<Value>> {
    let _guard = worker.tree_lock.read().await;

    let overlay_root = worker.local_path.join(&worker.sub_path);

    debug!(
        repository = %worker.name,
        path = %overlay_root.display(),
        helm_command = %worker.helm_command,
        "generating kustomize manifests"
    );

    if find_kustomization_file(&overlay_root).is_none() {
        bail!("no kustomization file found in {}", overlay_root.display());
    }

    // Overlays with env-file generators need a .env next to the committed
    // .env.example before the build can succeed.
    if worker.copy_env_example {
        if let Err(err) = copy_env_example_files(&overlay_root, &worker.name) {
            warn!(repository = %worker.name, error = %err, "failed to copy .env.example files");
        }
    }

    let output = Command::new("kustomize")
        .arg("build")
        .arg(&overlay_root)
        .args(["--load-restrictor", "LoadRestrictionsNone"])
        .arg("--enable-helm")
        .args(["--helm-command", &worker.helm_command])
        .output()
        .await
        .context("failed to execute kustomize")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "kustomize build failed for repository {}: {}",
            worker.name,
            stderr.trim()
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let manifests = parse_manifests(&stdout, gitops, &worker.name)?;

    info!(
        repository = %worker.name,
        manifests = manifests.len(),
        "generated kustomize manifests"
    );

    Ok(manifests)
}

fn find_kustomization_file(overlay_root: &Path) -> Option<PathBuf> {
    KUSTOMIZATION_FILENAMES
        .iter()
        .map(|name| overlay_root.join(name))
        .find(|path| path.is_file())
}

/// Parse multi-document YAML into object trees, dropping filtered
/// resources.
fn parse_manifests(rendered: &str, gitops: &GitOpsConfig, repository: &str) -> Result<Vec<Value>> {
    let mut manifests = Vec::new();

    for document in serde_yaml::Deserializer::from_str(rendered) {
        let value = Value::deserialize(document).context("failed to parse rendered manifest")?;
        if !value.is_object() {
            continue;
        }

        if should_filter_resource(&value, gitops) {
            debug!(
                repository = %repository,
                kind = nested_str(&value, &["kind"]).unwrap_or_default(),
                name = nested_str(&value, &["metadata", "name"]).unwrap_or_default(),
                "resource filtered out by allowlist/denylist"
            );
            continue;
        }

        manifests.push(value);
    }

    Ok(manifests)
}

/// Denylist wins over allowlist; a non-empty allowlist requires
/// membership.
pub fn should_filter_resource(obj: &Value, gitops: &GitOpsConfig) -> bool {
    let kind = nested_str(obj, &["kind"]).unwrap_or_default();
    let namespace = nested_str(obj, &["metadata", "namespace"]).unwrap_or_default();

    if gitops.denylist.kinds.iter().any(|k| k == kind) {
        return true;
    }
    if gitops.denylist.namespaces.iter().any(|ns| ns == namespace) {
        return true;
    }

    if !gitops.allowlist.kinds.is_empty() && !gitops.allowlist.kinds.iter().any(|k| k == kind) {
        return true;
    }
    if !gitops.allowlist.namespaces.is_empty()
        && !gitops.allowlist.namespaces.iter().any(|ns| ns == namespace)
    {
        return true;
    }

    false
}

/// For every `.env.example` under `root`, create a sibling `.env` with the
/// same contents unless one already exists. Idempotent by construction.
pub fn copy_env_example_files(root: &Path, repository: &str) -> Result<(usize, usize)> {
    let mut copied = 0;
    let mut skipped = 0;

    walk_env_examples(root, &mut |example: &Path| {
        let env_path = example.with_file_name(".env");

        if env_path.exists() {
            skipped += 1;
            debug!(
                repository = %repository,
                env_path = %env_path.display(),
                ".env file already exists, skipping copy"
            );
            return Ok(());
        }

        debug!(
            repository = %repository,
            source = %example.display(),
            target = %env_path.display(),
            "copying .env.example to .env"
        );
        let contents = std::fs::read(example)
            .with_context(|| format!("failed to read {}", example.display()))?;
        std::fs::write(&env_path, contents)
            .with_context(|| format!("failed to write {}", env_path.display()))?;
        copied += 1;
        Ok(())
    })?;

    if copied > 0 || skipped > 0 {
        info!(repository = %repository, copied, skipped, "processed .env.example files");
    }

    Ok((copied, skipped))
}

fn walk_env_examples(dir: &Path, visit: &mut dyn FnMut(&Path) -> Result<()>) -> Result<()> {
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_env_examples(&path, visit)?;
        } else if entry.file_name() == ".env.example" {
            visit(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GitOpsFilter;
    use serde_json::json;

    fn deployment(namespace: &str) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": namespace},
        })
    }

    #[test]
    fn test_no_filters_keeps_everything() {
        let gitops = GitOpsConfig::default();
        assert!(!should_filter_resource(&deployment("default"), &gitops));
    }

    #[test]
    fn test_denylist_kind() {
        let gitops = GitOpsConfig {
            denylist: GitOpsFilter {
                kinds: vec!["Deployment".to_string()],
                namespaces: vec![],
            },
            ..Default::default()
        };
        assert!(should_filter_resource(&deployment("default"), &gitops));
    }

    #[test]
    fn test_denylist_namespace() {
        let gitops = GitOpsConfig {
            denylist: GitOpsFilter {
                kinds: vec![],
                namespaces: vec!["kube-system".to_string()],
            },
            ..Default::default()
        };
        assert!(should_filter_resource(&deployment("kube-system"), &gitops));
        assert!(!should_filter_resource(&deployment("default"), &gitops));
    }

    #[test]
    fn test_allowlist_requires_membership() {
        let gitops = GitOpsConfig {
            allowlist: GitOpsFilter {
                kinds: vec!["ConfigMap".to_string()],
                namespaces: vec![],
            },
            ..Default::default()
        };
        assert!(should_filter_resource(&deployment("default"), &gitops));

        let configmap = json!({
            "kind": "ConfigMap",
            "metadata": {"name": "settings", "namespace": "default"},
        });
        assert!(!should_filter_resource(&configmap, &gitops));
    }

    #[test]
    fn test_denylist_wins_over_allowlist() {
        let gitops = GitOpsConfig {
            allowlist: GitOpsFilter {
                kinds: vec!["Deployment".to_string()],
                namespaces: vec![],
            },
            denylist: GitOpsFilter {
                kinds: vec!["Deployment".to_string()],
                namespaces: vec![],
            },
            ..Default::default()
        };
        assert!(should_filter_resource(&deployment("default"), &gitops));
    }

    #[test]
    fn test_parse_multi_document_yaml() {
        let rendered = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: default
";
        let gitops = GitOpsConfig::default();
        let manifests = parse_manifests(rendered, &gitops, "infra").unwrap();
        assert_eq!(manifests.len(), 2);
        assert_eq!(nested_str(&manifests[1], &["kind"]), Some("Deployment"));
    }

    #[test]
    fn test_parse_skips_filtered_documents() {
        let rendered = "\
apiVersion: v1
kind: Secret
metadata:
  name: credentials
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
";
        let gitops = GitOpsConfig {
            denylist: GitOpsFilter {
                kinds: vec!["Secret".to_string()],
                namespaces: vec![],
            },
            ..Default::default()
        };
        let manifests = parse_manifests(rendered, &gitops, "infra").unwrap();
        assert_eq!(manifests.len(), 1);
        assert_eq!(nested_str(&manifests[0], &["kind"]), Some("ConfigMap"));
    }

    #[test]
    fn test_copy_env_example_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("apps").join("web");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join(".env.example"), "KEY=value\n").unwrap();

        let (copied, skipped) = copy_env_example_files(dir.path(), "infra").unwrap();
        assert_eq!((copied, skipped), (1, 0));
        assert_eq!(
            std::fs::read_to_string(nested.join(".env")).unwrap(),
            "KEY=value\n"
        );

        // A second pass must not overwrite the existing .env
        std::fs::write(nested.join(".env"), "KEY=changed\n").unwrap();
        let (copied, skipped) = copy_env_example_files(dir.path(), "infra").unwrap();
        assert_eq!((copied, skipped), (0, 1));
        assert_eq!(
            std::fs::read_to_string(nested.join(".env")).unwrap(),
            "KEY=changed\n"
        );
    }

    #[test]
    fn test_find_kustomization_file_variants() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_kustomization_file(dir.path()).is_none());

        std::fs::write(dir.path().join("kustomization.yml"), "resources: []\n").unwrap();
        let found = find_kustomization_file(dir.path()).unwrap();
        assert!(found.ends_with("kustomization.yml"));
    }
}
