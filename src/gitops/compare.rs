//! Drift comparison between rendered manifests and the live cluster.
//!
//! Every rendered resource is fetched by name and then put through a
//! server-side-apply dry-run under the `sun-gitops` field manager. The
//! dry-run result is what the cluster would look like after applying the
//! manifest; comparing it to the live object (spec plus user-owned labels
//! and annotations) detects drift without tripping over server-defaulted
//! fields.

use anyhow::{bail, Context, Result};
use kube::api::{DynamicObject, Patch, PatchParams};
use kube::discovery::{ApiResource, Scope};
use kube::{Api, Discovery};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info};

use super::{GitOpsInfo, RepoWorker};
use crate::alerts::{Alert, AlertField};
use crate::config::Config;
use crate::context::AppContext;
use crate::objects::nested_str;
use crate::state::recovered;

const FIELD_MANAGER: &str = "sun-gitops";

const IGNORED_LABELS: [&str; 4] = [
    "app.kubernetes.io/managed-by",
    "helm.sh/chart",
    "app.kubernetes.io/instance",
    "app.kubernetes.io/version",
];

const IGNORED_ANNOTATIONS: [&str; 4] = [
    "kubectl.kubernetes.io/last-applied-configuration",
    "deployment.kubernetes.io/revision",
    "meta.helm.sh/release-name",
    "meta.helm.sh/release-namespace",
];

/// A kind's preferred API resource and scope, as reported by discovery.
#[derive(Debug, Clone)]
pub struct DiscoveredResource {
    pub resource: ApiResource,
    pub namespaced: bool,
}

/// How a rendered resource diverges from the cluster.
///
/// `Extra` is part of the data model and alert path but is never produced:
/// the comparison only walks expected manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mismatch {
    Missing,
    Different,
    Extra,
}

impl Mismatch {
    pub fn label(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Different => "different",
            Self::Extra => "extra",
        }
    }

    fn description(self, kind: &str, name: &str) -> String {
        match self {
            Self::Missing => format!("{kind}/{name} is missing from cluster"),
            Self::Different => format!("{kind}/{name} differs between Git and cluster"),
            Self::Extra => format!("{kind}/{name} exists in cluster but not in Git"),
        }
    }

    fn alert_title(self, repository: &str) -> String {
        match self {
            Self::Missing => format!("GitOps Alert: Missing Resource in {repository}"),
            Self::Different => format!("GitOps Alert: Resource Drift in {repository}"),
            Self::Extra => format!("GitOps Alert: Extra Resource in {repository}"),
        }
    }

    fn alert_description(self, kind: &str, name: &str) -> String {
        match self {
            Self::Missing => {
                format!("Resource {kind}/{name} is defined in Git but missing from cluster")
            }
            Self::Different => format!("Resource {kind}/{name} differs between Git and cluster"),
            Self::Extra => format!("Resource {kind}/{name} exists in cluster but not in Git"),
        }
    }

    fn action_required(self) -> &'static str {
        match self {
            Self::Missing => "Apply the resource to the cluster or remove from Git",
            Self::Different => "Review differences and either update Git or apply changes to cluster",
            Self::Extra => "Remove resource from cluster or add to Git repository",
        }
    }
}

/// Build the kind → API resource cache from server discovery, once.
///
/// Discovery hands back one preferred version per kind; duplicate kinds
/// across groups keep the first mapping seen.
pub async fn init_discovery(ctx: &Arc<AppContext>) -> Result<()> {
    ctx.api_resources
        .get_or_try_init(|| async {
            debug!("initializing API resource cache from discovery");

            let discovery = Discovery::new(ctx.client.clone())
                .run()
                .await
                .context("failed to discover server resources")?;

            let mut resources: HashMap<String, DiscoveredResource> = HashMap::new();
            for group in discovery.groups() {
                for (resource, capabilities) in group.recommended_resources() {
                    resources
                        .entry(resource.kind.clone())
                        .or_insert(DiscoveredResource {
                            namespaced: matches!(capabilities.scope, Scope::Namespaced),
                            resource,
                        });
                }
            }

            info!(resource_count = resources.len(), "initialized API resource cache from discovery");
            Ok::<_, anyhow::Error>(resources)
        })
        .await?;

    Ok(())
}

/// Render the worker's manifests and compare each against the cluster.
pub async fn compare_repository(ctx: &Arc<AppContext>, worker: &Arc<RepoWorker>) -> Result<()> {
    debug!(repository = %worker.name, "comparing manifests with cluster state");

    let config = ctx.config().await;
    let manifests = super::render::render_manifests(worker, &config.gitops).await?;

    debug!(
        repository = %worker.name,
        manifests = manifests.len(),
        "generated manifests from repository"
    );

    for manifest in &manifests {
        if let Err(err) = compare_manifest(ctx, worker, manifest, &config).await {
            let resource = format!(
                "{}/{}",
                nested_str(manifest, &["kind"]).unwrap_or_default(),
                nested_str(manifest, &["metadata", "name"]).unwrap_or_default()
            );
            error!(
                repository = %worker.name,
                resource = %resource,
                error = %err,
                "failed to compare manifest with cluster"
            );
        }
    }

    Ok(())
}

async fn compare_manifest(
    ctx: &Arc<AppContext>,
    worker: &Arc<RepoWorker>,
    manifest: &Value,
    config: &Config,
) -> Result<()> {
    let kind = nested_str(manifest, &["kind"]).unwrap_or_default().to_string();
    let name = nested_str(manifest, &["metadata", "name"])
        .unwrap_or_default()
        .to_string();
    let namespace = nested_str(manifest, &["metadata", "namespace"])
        .unwrap_or_default()
        .to_string();

    debug!(
        repository = %worker.name,
        kind = %kind,
        name = %name,
        namespace = %namespace,
        "comparing manifest with cluster"
    );

    let Some(discovered) = ctx.api_resources.get().and_then(|m| m.get(&kind)) else {
        bail!("unknown kind: {kind}");
    };

    let api: Api<DynamicObject> = if discovered.namespaced && !namespace.is_empty() {
        Api::namespaced_with(ctx.client.clone(), &namespace, &discovered.resource)
    } else {
        Api::all_with(ctx.client.clone(), &discovered.resource)
    };

    let Some(actual) = api
        .get_opt(&name)
        .await
        .with_context(|| format!("failed to get resource {kind}/{name} from cluster"))?
    else {
        process_mismatch(ctx, worker, &kind, &name, &namespace, Mismatch::Missing, config).await;
        return Ok(());
    };

    match dry_run_apply(&api, &name, manifest).await {
        Ok(dry_run) => {
            if resources_equal(&dry_run, &actual) {
                process_match(ctx, worker, &kind, &name, &namespace).await;
            } else {
                debug!(
                    kind = %kind,
                    name = %name,
                    namespace = %namespace,
                    "server-side apply dry-run detected differences"
                );
                process_mismatch(ctx, worker, &kind, &name, &namespace, Mismatch::Different, config)
                    .await;
            }
        }
        Err(err) => {
            // Without a trustworthy dry-run there is no way to tell drift
            // from server defaulting; treat the resource as in sync.
            error!(
                kind = %kind,
                name = %name,
                namespace = %namespace,
                error = %err,
                "failed to perform server-side apply dry-run"
            );
            process_match(ctx, worker, &kind, &name, &namespace).await;
        }
    }

    Ok(())
}

async fn dry_run_apply(
    api: &Api<DynamicObject>,
    name: &str,
    manifest: &Value,
) -> kube::Result<DynamicObject> {
    let mut params = PatchParams::apply(FIELD_MANAGER).force();
    params.dry_run = true;
    api.patch(name, &params, &Patch::Apply(manifest)).await
}

fn cleaned_string_map(
    map: Option<&BTreeMap<String, String>>,
    ignored: &[&str],
) -> BTreeMap<String, String> {
    map.map(|m| {
        m.iter()
            .filter(|(k, _)| !ignored.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    })
    .unwrap_or_default()
}

/// Compare the meaningful parts of the dry-run result and the live
/// object: the `spec` subtree plus labels and annotations with
/// system-managed keys stripped. Everything else is server territory.
pub fn resources_equal(dry_run: &DynamicObject, actual: &DynamicObject) -> bool {
    let dry_spec = dry_run.data.get("spec");
    let actual_spec = actual.data.get("spec");
    match (dry_spec, actual_spec) {
        (None, None) => {}
        (Some(a), Some(b)) => {
            if a != b {
                return false;
            }
        }
        _ => return false,
    }

    let dry_labels = cleaned_string_map(dry_run.metadata.labels.as_ref(), &IGNORED_LABELS);
    let actual_labels = cleaned_string_map(actual.metadata.labels.as_ref(), &IGNORED_LABELS);
    if dry_labels != actual_labels {
        return false;
    }

    let dry_annotations =
        cleaned_string_map(dry_run.metadata.annotations.as_ref(), &IGNORED_ANNOTATIONS);
    let actual_annotations =
        cleaned_string_map(actual.metadata.annotations.as_ref(), &IGNORED_ANNOTATIONS);
    if dry_annotations != actual_annotations {
        return false;
    }

    true
}

fn resource_key(repository: &str, namespace: &str, kind: &str, name: &str) -> String {
    format!("{repository}/{namespace}/{kind}/{name}")
}

async fn process_mismatch(
    ctx: &Arc<AppContext>,
    worker: &Arc<RepoWorker>,
    kind: &str,
    name: &str,
    namespace: &str,
    mismatch: Mismatch,
    config: &Config,
) {
    let key = resource_key(&worker.name, namespace, kind, name);

    error!(
        repository = %worker.name,
        kind = %kind,
        name = %name,
        namespace = %namespace,
        mismatch_type = mismatch.label(),
        "GitOps mismatch detected"
    );

    let message = format!(
        "Resource {}: {}",
        mismatch.label(),
        mismatch.description(kind, name)
    );
    ctx.stores
        .gitops
        .upsert(
            &key,
            true,
            &message,
            GitOpsInfo {
                repository_name: worker.name.clone(),
                resource_kind: kind.to_string(),
                resource_name: name.to_string(),
                namespace: namespace.to_string(),
                mismatch_type: mismatch.label().to_string(),
                ..Default::default()
            },
        )
        .await;

    let gate_open = ctx.stores.gitops.should_alert(&key, config.interval).await
        && config.gitops_alerts_enabled(&worker.name);
    if gate_open {
        send_mismatch_alert(ctx, &worker.name, kind, name, namespace, mismatch).await;
        ctx.stores.gitops.mark_sent(&key).await;
    }
}

async fn process_match(
    ctx: &Arc<AppContext>,
    worker: &Arc<RepoWorker>,
    kind: &str,
    name: &str,
    namespace: &str,
) {
    let key = resource_key(&worker.name, namespace, kind, name);

    let prev = ctx
        .stores
        .gitops
        .upsert(
            &key,
            false,
            "",
            GitOpsInfo {
                repository_name: worker.name.clone(),
                resource_kind: kind.to_string(),
                resource_name: name.to_string(),
                namespace: namespace.to_string(),
                ..Default::default()
            },
        )
        .await;

    if recovered(&prev) {
        send_recovery_alert(ctx, &worker.name, kind, name, namespace).await;
    }
}

async fn send_mismatch_alert(
    ctx: &Arc<AppContext>,
    repository: &str,
    kind: &str,
    name: &str,
    namespace: &str,
    mismatch: Mismatch,
) {
    let mut alert = Alert::new(
        mismatch.alert_title(repository),
        mismatch.alert_description(kind, name),
    )
    .field(AlertField::inline("Repository", repository))
    .field(AlertField::inline("Resource Kind", kind))
    .field(AlertField::inline("Resource Name", name));

    if !namespace.is_empty() {
        alert = alert.field(AlertField::inline("Namespace", namespace));
    }

    alert = alert
        .field(AlertField::inline("Mismatch Type", mismatch.label()))
        .field(AlertField::block("Action Required", mismatch.action_required()));

    ctx.send_alert(alert).await;
    error!(
        repository = %repository,
        kind = %kind,
        name = %name,
        namespace = %namespace,
        mismatch_type = mismatch.label(),
        "GitOps mismatch alert sent"
    );
}

async fn send_recovery_alert(
    ctx: &Arc<AppContext>,
    repository: &str,
    kind: &str,
    name: &str,
    namespace: &str,
) {
    let mut alert = Alert::new(
        format!("GitOps Recovery: {repository}"),
        format!("Resource {kind}/{name} is now in sync between Git and cluster"),
    )
    .field(AlertField::inline("Repository", repository))
    .field(AlertField::inline("Resource Kind", kind))
    .field(AlertField::inline("Resource Name", name));

    if !namespace.is_empty() {
        alert = alert.field(AlertField::inline("Namespace", namespace));
    }

    alert = alert.field(AlertField::inline("Status", "✅ In Sync"));

    ctx.send_alert(alert).await;
    info!(
        repository = %repository,
        kind = %kind,
        name = %name,
        namespace = %namespace,
        "GitOps resource has recovered"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use serde_json::json;

    fn object(
        spec: Option<Value>,
        labels: Option<BTreeMap<String, String>>,
        annotations: Option<BTreeMap<String, String>>,
    ) -> DynamicObject {
        let data = match spec {
            Some(spec) => json!({ "spec": spec }),
            None => json!({}),
        };
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                labels,
                annotations,
                ..Default::default()
            },
            data,
        }
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_equal_specs() {
        let a = object(Some(json!({"replicas": 3})), None, None);
        let b = object(Some(json!({"replicas": 3})), None, None);
        assert!(resources_equal(&a, &b));
    }

    #[test]
    fn test_different_specs() {
        let a = object(Some(json!({"replicas": 3})), None, None);
        let b = object(Some(json!({"replicas": 5})), None, None);
        assert!(!resources_equal(&a, &b));
    }

    #[test]
    fn test_spec_presence_mismatch() {
        let a = object(Some(json!({"replicas": 3})), None, None);
        let b = object(None, None, None);
        assert!(!resources_equal(&a, &b));
        assert!(resources_equal(&object(None, None, None), &object(None, None, None)));
    }

    #[test]
    fn test_system_managed_labels_ignored() {
        let a = object(
            Some(json!({"replicas": 3})),
            Some(labels(&[("app", "web"), ("app.kubernetes.io/managed-by", "Helm")])),
            None,
        );
        let b = object(
            Some(json!({"replicas": 3})),
            Some(labels(&[("app", "web"), ("helm.sh/chart", "web-1.0.0")])),
            None,
        );
        assert!(resources_equal(&a, &b));
    }

    #[test]
    fn test_user_label_difference_detected() {
        let a = object(
            Some(json!({"replicas": 3})),
            Some(labels(&[("app", "web")])),
            None,
        );
        let b = object(
            Some(json!({"replicas": 3})),
            Some(labels(&[("app", "api")])),
            None,
        );
        assert!(!resources_equal(&a, &b));
    }

    #[test]
    fn test_system_managed_annotations_ignored() {
        let a = object(
            Some(json!({"replicas": 3})),
            None,
            Some(labels(&[(
                "kubectl.kubernetes.io/last-applied-configuration",
                "{}",
            )])),
        );
        let b = object(
            Some(json!({"replicas": 3})),
            None,
            Some(labels(&[("deployment.kubernetes.io/revision", "4")])),
        );
        assert!(resources_equal(&a, &b));
    }

    #[test]
    fn test_user_annotation_difference_detected() {
        let a = object(
            Some(json!({"replicas": 3})),
            None,
            Some(labels(&[("team", "platform")])),
        );
        let b = object(Some(json!({"replicas": 3})), None, None);
        assert!(!resources_equal(&a, &b));
    }

    #[test]
    fn test_absent_and_empty_maps_equal() {
        let a = object(Some(json!({"replicas": 3})), Some(BTreeMap::new()), None);
        let b = object(Some(json!({"replicas": 3})), None, None);
        assert!(resources_equal(&a, &b));
    }

    #[test]
    fn test_mismatch_strings() {
        assert_eq!(Mismatch::Missing.label(), "missing");
        assert_eq!(
            Mismatch::Missing.alert_title("infra"),
            "GitOps Alert: Missing Resource in infra"
        );
        assert_eq!(
            Mismatch::Missing.action_required(),
            "Apply the resource to the cluster or remove from Git"
        );
        assert_eq!(
            Mismatch::Different.alert_title("infra"),
            "GitOps Alert: Resource Drift in infra"
        );
        assert_eq!(
            Mismatch::Different.description("Deployment", "web"),
            "Deployment/web differs between Git and cluster"
        );
        assert_eq!(Mismatch::Extra.label(), "extra");
    }

    #[test]
    fn test_resource_key_shape() {
        assert_eq!(
            resource_key("infra", "default", "Deployment", "web"),
            "infra/default/Deployment/web"
        );
        // Cluster-scoped resources keep an empty namespace segment
        assert_eq!(
            resource_key("infra", "", "ClusterRole", "admin"),
            "infra//ClusterRole/admin"
        );
    }
}
