//! Per-object health state tracking and alert gating.
//!
//! Every monitored family (pods, nodes, node resources, the five Longhorn
//! kinds, GitOps resources) keeps one [`StateStore`] mapping a stable
//! identity key to a [`UnitState`] plus family-specific extras. The store
//! owns the onset/recovery transition rules and the dwell-interval gate
//! that keeps a single error episode down to one alert.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// How a family reacts when the error message changes while the object is
/// still in error.
///
/// Pods, nodes, and Longhorn objects keep the original onset time so pure
/// message churn never re-alerts. GitOps resources re-arm: a new kind of
/// drift on the same resource resets the dwell clock and allows a fresh
/// alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RearmPolicy {
    KeepOnMessageChange,
    RearmOnMessageChange,
}

/// Universal health record for one monitored object.
#[derive(Debug, Clone)]
pub struct UnitState {
    pub has_error: bool,
    pub last_seen: DateTime<Utc>,
    pub last_message: String,
    /// Onset of the current error episode. `None` while healthy.
    pub first_error: Option<DateTime<Utc>>,
    pub alert_sent: bool,
}

/// A store entry: the universal record plus family extras.
#[derive(Debug, Clone)]
pub struct Entry<E> {
    pub unit: UnitState,
    pub info: E,
}

/// In-memory health state for one object family.
pub struct StateStore<E = ()> {
    entries: RwLock<HashMap<String, Entry<E>>>,
    rearm: RearmPolicy,
}

impl<E: Clone + Send + Sync> StateStore<E> {
    pub fn new(rearm: RearmPolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            rearm,
        }
    }

    /// Apply an observation for `key` and return the previous entry.
    ///
    /// Transition rules:
    /// - first observation: `first_error` set iff in error, alert unarmed
    /// - healthy → error: onset, dwell clock starts, alert unarmed
    /// - error → healthy: flags cleared (callers use the returned previous
    ///   entry to decide whether a recovery alert is due)
    /// - error → error: onset time and sent flag carry over, unless the
    ///   family re-arms on message change and the message differs
    pub async fn upsert(&self, key: &str, has_error: bool, message: &str, info: E) -> Option<Entry<E>> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let prev = entries.get(key).cloned();

        let (first_error, alert_sent) = match &prev {
            None => (has_error.then_some(now), false),
            Some(p) => {
                if has_error && !p.unit.has_error {
                    (Some(now), false)
                } else if !has_error {
                    (None, false)
                } else if self.rearm == RearmPolicy::RearmOnMessageChange
                    && message != p.unit.last_message
                {
                    (Some(now), false)
                } else {
                    (p.unit.first_error, p.unit.alert_sent)
                }
            }
        };

        entries.insert(
            key.to_string(),
            Entry {
                unit: UnitState {
                    has_error,
                    last_seen: now,
                    last_message: message.to_string(),
                    first_error,
                    alert_sent,
                },
                info,
            },
        );

        prev
    }

    /// Whether an alert is due for `key`: it exists, is in error, has not
    /// alerted for this episode, and the dwell interval has elapsed
    /// (`interval_minutes == 0` fires immediately).
    pub async fn should_alert(&self, key: &str, interval_minutes: u64) -> bool {
        let entries = self.entries.read().await;
        let Some(entry) = entries.get(key) else {
            return false;
        };
        if !entry.unit.has_error || entry.unit.alert_sent {
            return false;
        }
        if interval_minutes == 0 {
            return true;
        }
        let Some(first_error) = entry.unit.first_error else {
            return false;
        };
        Utc::now() - first_error >= Duration::minutes(interval_minutes as i64)
    }

    /// Record that the alert for the current episode went out.
    pub async fn mark_sent(&self, key: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.unit.alert_sent = true;
        }
    }

    /// Whether a healthy observation for `key` should emit a recovery
    /// alert: the stored state is still in error and its alert went out.
    pub async fn recovery_pending(&self, key: &str) -> bool {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .is_some_and(|e| e.unit.has_error && e.unit.alert_sent)
    }

    pub async fn get(&self, key: &str) -> Option<Entry<E>> {
        self.entries.read().await.get(key).cloned()
    }

    /// Drop the key entirely; a later observation is treated as first-seen.
    pub async fn remove(&self, key: &str) {
        self.entries.write().await.remove(key);
    }
}

/// Whether a previous entry (as returned by [`StateStore::upsert`])
/// warrants a recovery alert after a healthy observation replaced it.
pub fn recovered<E>(prev: &Option<Entry<E>>) -> bool {
    prev.as_ref()
        .is_some_and(|p| p.unit.has_error && p.unit.alert_sent)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backdate_first_error(store: &StateStore, key: &str, minutes: i64) {
        let mut entries = store.entries.write().await;
        let entry = entries.get_mut(key).unwrap();
        entry.unit.first_error = entry
            .unit
            .first_error
            .map(|t| t - Duration::minutes(minutes));
    }

    #[tokio::test]
    async fn test_first_observation_healthy() {
        let store = StateStore::new(RearmPolicy::KeepOnMessageChange);
        let prev = store.upsert("ns/pod", false, "", ()).await;
        assert!(prev.is_none());

        let entry = store.get("ns/pod").await.unwrap();
        assert!(!entry.unit.has_error);
        assert!(entry.unit.first_error.is_none());
        assert!(!entry.unit.alert_sent);
    }

    #[tokio::test]
    async fn test_error_onset_and_immediate_gate() {
        let store = StateStore::new(RearmPolicy::KeepOnMessageChange);
        store.upsert("ns/pod", true, "Container app has failed", ()).await;

        let entry = store.get("ns/pod").await.unwrap();
        assert!(entry.unit.has_error);
        assert!(entry.unit.first_error.is_some());

        // interval 0 fires on the first in-error observation
        assert!(store.should_alert("ns/pod", 0).await);
        store.mark_sent("ns/pod").await;
        assert!(!store.should_alert("ns/pod", 0).await);
    }

    #[tokio::test]
    async fn test_dwell_interval_suppresses_until_elapsed() {
        let store = StateStore::new(RearmPolicy::KeepOnMessageChange);
        store.upsert("node-a", true, "Node under DiskPressure", ()).await;

        assert!(!store.should_alert("node-a", 3).await);

        // Repeated in-error observations keep the onset time
        store.upsert("node-a", true, "Node under DiskPressure", ()).await;
        assert!(!store.should_alert("node-a", 3).await);

        backdate_first_error(&store, "node-a", 3).await;
        assert!(store.should_alert("node-a", 3).await);
    }

    #[tokio::test]
    async fn test_single_alert_per_episode() {
        let store = StateStore::new(RearmPolicy::KeepOnMessageChange);
        store.upsert("ns/pod", true, "Container app has failed", ()).await;
        assert!(store.should_alert("ns/pod", 0).await);
        store.mark_sent("ns/pod").await;

        // Message churn within the same episode does not re-arm
        store.upsert("ns/pod", true, "Container app is waiting", ()).await;
        assert!(!store.should_alert("ns/pod", 0).await);

        let entry = store.get("ns/pod").await.unwrap();
        assert!(entry.unit.alert_sent);
    }

    #[tokio::test]
    async fn test_recovery_clears_and_rearms() {
        let store = StateStore::new(RearmPolicy::KeepOnMessageChange);
        store.upsert("ns/pod", true, "Container app has failed", ()).await;
        store.mark_sent("ns/pod").await;
        assert!(store.recovery_pending("ns/pod").await);

        let prev = store.upsert("ns/pod", false, "", ()).await;
        assert!(recovered(&prev));

        let entry = store.get("ns/pod").await.unwrap();
        assert!(entry.unit.first_error.is_none());
        assert!(!entry.unit.alert_sent);

        // The healthy upsert consumed the transition: a second healthy
        // observation must not produce another recovery
        let prev = store.upsert("ns/pod", false, "", ()).await;
        assert!(!recovered(&prev));

        // A fresh error is a new episode
        store.upsert("ns/pod", true, "Container app has failed", ()).await;
        assert!(store.should_alert("ns/pod", 0).await);
    }

    #[tokio::test]
    async fn test_no_recovery_without_sent_alert() {
        let store = StateStore::new(RearmPolicy::KeepOnMessageChange);
        store.upsert("ns/pod", true, "Container app has failed", ()).await;
        // Alert never went out (e.g. dwell not elapsed)
        let prev = store.upsert("ns/pod", false, "", ()).await;
        assert!(!recovered(&prev));
    }

    #[tokio::test]
    async fn test_gitops_rearm_on_message_change() {
        let store: StateStore<()> = StateStore::new(RearmPolicy::RearmOnMessageChange);
        store
            .upsert("infra/default/Deployment/web", true, "Resource missing", ())
            .await;
        store.mark_sent("infra/default/Deployment/web").await;
        assert!(!store.should_alert("infra/default/Deployment/web", 0).await);

        // A different drift message re-arms the gate and resets onset
        store
            .upsert("infra/default/Deployment/web", true, "Resource different", ())
            .await;
        let entry = store.get("infra/default/Deployment/web").await.unwrap();
        assert!(!entry.unit.alert_sent);
        assert!(store.should_alert("infra/default/Deployment/web", 0).await);

        // Same message again keeps state
        store.mark_sent("infra/default/Deployment/web").await;
        store
            .upsert("infra/default/Deployment/web", true, "Resource different", ())
            .await;
        assert!(!store.should_alert("infra/default/Deployment/web", 0).await);
    }

    #[tokio::test]
    async fn test_remove_resets_to_first_seen() {
        let store = StateStore::new(RearmPolicy::KeepOnMessageChange);
        store.upsert("ns/vol", true, "Volume is degraded", ()).await;
        store.mark_sent("ns/vol").await;
        store.remove("ns/vol").await;
        assert!(store.get("ns/vol").await.is_none());

        let prev = store.upsert("ns/vol", false, "", ()).await;
        assert!(prev.is_none());
        assert!(!recovered(&prev));
    }

    #[tokio::test]
    async fn test_unknown_key_never_alerts() {
        let store: StateStore<()> = StateStore::new(RearmPolicy::KeepOnMessageChange);
        assert!(!store.should_alert("nope", 0).await);
        assert!(!store.recovery_pending("nope").await);
    }
}
