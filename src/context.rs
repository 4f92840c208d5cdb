//! Shared process context.
//!
//! One [`AppContext`] is built at startup and handed to every component as
//! an `Arc`. It owns the cluster client, the live configuration, the
//! leadership flag, the webhook sink, and the per-family health state
//! stores, so no component reaches for process globals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{OnceCell, RwLock};

use crate::alerts::WebhookSink;
use crate::config::Config;
use crate::gitops::compare::DiscoveredResource;
use crate::gitops::GitOpsInfo;
use crate::longhorn::LonghornInfo;
use crate::nodes::NodeResourceInfo;
use crate::state::{RearmPolicy, StateStore};

/// Per-family health state stores. Separate stores keep identity keys
/// collision-free across kinds.
pub struct Stores {
    pub pods: StateStore,
    pub nodes: StateStore,
    pub node_resources: StateStore<NodeResourceInfo>,
    pub longhorn_volumes: StateStore<LonghornInfo>,
    pub longhorn_replicas: StateStore<LonghornInfo>,
    pub longhorn_engines: StateStore<LonghornInfo>,
    pub longhorn_nodes: StateStore<LonghornInfo>,
    pub longhorn_backups: StateStore<LonghornInfo>,
    pub gitops: StateStore<GitOpsInfo>,
}

impl Default for Stores {
    fn default() -> Self {
        Self {
            pods: StateStore::new(RearmPolicy::KeepOnMessageChange),
            nodes: StateStore::new(RearmPolicy::KeepOnMessageChange),
            node_resources: StateStore::new(RearmPolicy::KeepOnMessageChange),
            longhorn_volumes: StateStore::new(RearmPolicy::KeepOnMessageChange),
            longhorn_replicas: StateStore::new(RearmPolicy::KeepOnMessageChange),
            longhorn_engines: StateStore::new(RearmPolicy::KeepOnMessageChange),
            longhorn_nodes: StateStore::new(RearmPolicy::KeepOnMessageChange),
            longhorn_backups: StateStore::new(RearmPolicy::KeepOnMessageChange),
            // GitOps re-arms on message change: a new drift kind on the
            // same resource alerts again.
            gitops: StateStore::new(RearmPolicy::RearmOnMessageChange),
        }
    }
}

pub struct AppContext {
    pub client: kube::Client,
    pub in_cluster: bool,
    pub config: RwLock<Config>,
    pub sink: WebhookSink,
    pub stores: Stores,
    /// Kind → API resource mappings from discovery, built once when GitOps
    /// monitoring starts.
    pub api_resources: OnceCell<HashMap<String, DiscoveredResource>>,
    leader: AtomicBool,
}

impl AppContext {
    pub fn new(client: kube::Client, in_cluster: bool, config: Config) -> Self {
        Self {
            client,
            in_cluster,
            config: RwLock::new(config),
            sink: WebhookSink::new(),
            stores: Stores::default(),
            api_resources: OnceCell::new(),
            leader: AtomicBool::new(false),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    pub fn set_leader(&self, is_leader: bool) {
        self.leader.store(is_leader, Ordering::SeqCst);
    }

    /// Snapshot of the current configuration.
    pub async fn config(&self) -> Config {
        self.config.read().await.clone()
    }
}
