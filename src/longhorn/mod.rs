//! Dynamic watchers over the Longhorn storage CRDs.
//!
//! Five informer streams (volumes, replicas, engines, nodes, backups) under
//! `longhorn.io/v1beta2`, each individually toggleable and scoped to the
//! configured Longhorn namespace. Objects arrive untyped; classification
//! lives in [`classify`].

pub mod classify;

use anyhow::Result;
use futures::{StreamExt, TryStreamExt};
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::runtime::watcher::{self, Event};
use kube::{Api, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::state::StateStore;

const LONGHORN_GROUP: &str = "longhorn.io";
const LONGHORN_VERSION: &str = "v1beta2";

/// Extra state carried for every Longhorn object family.
#[derive(Debug, Clone, Default)]
pub struct LonghornInfo {
    pub resource_type: &'static str,
    pub namespace: String,
    pub capacity: i64,
    pub usage: i64,
    pub robustness: String,
    pub node: String,
}

/// The five watched Longhorn CRD kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LonghornKind {
    Volume,
    Replica,
    Engine,
    Node,
    Backup,
}

impl LonghornKind {
    pub fn kind(self) -> &'static str {
        match self {
            Self::Volume => "Volume",
            Self::Replica => "Replica",
            Self::Engine => "Engine",
            Self::Node => "Node",
            Self::Backup => "Backup",
        }
    }

    pub fn plural(self) -> &'static str {
        match self {
            Self::Volume => "volumes",
            Self::Replica => "replicas",
            Self::Engine => "engines",
            Self::Node => "nodes",
            Self::Backup => "backups",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Volume => "volume",
            Self::Replica => "replica",
            Self::Engine => "engine",
            Self::Node => "node",
            Self::Backup => "backup",
        }
    }

    fn api_resource(self) -> ApiResource {
        ApiResource {
            group: LONGHORN_GROUP.to_string(),
            version: LONGHORN_VERSION.to_string(),
            api_version: format!("{LONGHORN_GROUP}/{LONGHORN_VERSION}"),
            kind: self.kind().to_string(),
            plural: self.plural().to_string(),
        }
    }

    pub fn store(self, ctx: &AppContext) -> &StateStore<LonghornInfo> {
        match self {
            Self::Volume => &ctx.stores.longhorn_volumes,
            Self::Replica => &ctx.stores.longhorn_replicas,
            Self::Engine => &ctx.stores.longhorn_engines,
            Self::Node => &ctx.stores.longhorn_nodes,
            Self::Backup => &ctx.stores.longhorn_backups,
        }
    }

    /// Longhorn nodes are keyed by bare name, everything else by
    /// `namespace/name`.
    pub fn key(self, obj: &DynamicObject) -> String {
        match self {
            Self::Node => obj.name_any(),
            _ => format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any()),
        }
    }
}

/// Spawn one watcher task per enabled Longhorn kind.
pub async fn setup(ctx: Arc<AppContext>, shutdown: watch::Receiver<bool>) {
    let config = ctx.config().await;
    let namespace = if config.longhorn.namespace.is_empty() {
        "longhorn-system".to_string()
    } else {
        config.longhorn.namespace.clone()
    };
    info!(namespace = %namespace, "setting up Longhorn monitoring");

    let kinds = [
        (LonghornKind::Volume, config.longhorn.monitor.volumes),
        (LonghornKind::Replica, config.longhorn.monitor.replicas),
        (LonghornKind::Engine, config.longhorn.monitor.engines),
        (LonghornKind::Node, config.longhorn.monitor.nodes),
        (LonghornKind::Backup, config.longhorn.monitor.backups),
    ];

    for (kind, enabled) in kinds {
        if !enabled {
            continue;
        }
        debug!(kind = kind.kind(), "Longhorn informer configured");
        tokio::spawn(run_kind(
            ctx.clone(),
            kind,
            namespace.clone(),
            shutdown.clone(),
        ));
    }

    info!("Longhorn informers started");
}

async fn run_kind(
    ctx: Arc<AppContext>,
    kind: LonghornKind,
    namespace: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let api: Api<DynamicObject> =
        Api::namespaced_with(ctx.client.clone(), &namespace, &kind.api_resource());

    let mut backoff = Duration::from_secs(1);
    let max_backoff = Duration::from_secs(30);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!(kind = kind.kind(), "stopping Longhorn watcher");
                return;
            }
            result = watch_kind(&ctx, kind, &api) => match result {
                Ok(()) => {
                    warn!(kind = kind.kind(), "Longhorn watch stream ended, reconnecting");
                    backoff = Duration::from_secs(1);
                }
                Err(err) => {
                    error!(kind = kind.kind(), error = %err, "Longhorn watch failed, reconnecting in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, max_backoff);
                }
            }
        }
    }
}

async fn watch_kind(
    ctx: &Arc<AppContext>,
    kind: LonghornKind,
    api: &Api<DynamicObject>,
) -> Result<()> {
    let mut stream = watcher::watcher(api.clone(), watcher::Config::default()).boxed();

    while let Some(event) = stream.try_next().await? {
        match event {
            Event::Apply(obj) | Event::InitApply(obj) => {
                classify::handle(ctx, kind, &obj).await;
            }
            Event::Delete(obj) => {
                // A later add for the same identity is first-seen again.
                kind.store(ctx).remove(&kind.key(&obj)).await;
            }
            Event::Init => debug!(kind = kind.kind(), "Longhorn watcher initializing"),
            Event::InitDone => {
                info!(kind = kind.kind(), "Longhorn watcher initial sync complete");
            }
        }
    }

    Ok(())
}
