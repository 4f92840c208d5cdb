//! Classification and alerting for Longhorn objects.
//!
//! Volumes are judged on attachment state, robustness, and capacity
//! headroom; replicas and engines on their current state; nodes on their
//! Ready/Schedulable conditions; backups on completion state. Unknown
//! states are treated as errors rather than silently passed.

use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::{LonghornInfo, LonghornKind};
use crate::alerts::{Alert, AlertField};
use crate::context::AppContext;
use crate::objects::{nested_i64, nested_slice, nested_str, parse_byte_size};
use crate::state::recovered;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

pub async fn handle(ctx: &Arc<AppContext>, kind: LonghornKind, obj: &DynamicObject) {
    match kind {
        LonghornKind::Volume => handle_volume(ctx, obj).await,
        LonghornKind::Replica | LonghornKind::Engine => handle_workload(ctx, kind, obj).await,
        LonghornKind::Node => handle_node(ctx, obj).await,
        LonghornKind::Backup => handle_backup(ctx, obj).await,
    }
}

#[derive(Debug, Default, PartialEq)]
struct VolumeVerdict {
    has_error: bool,
    message: String,
    alert_type: &'static str,
}

fn volume_verdict(
    state: &str,
    robustness: &str,
    capacity: i64,
    actual_size: i64,
    usage_threshold_percent: f64,
    capacity_critical_bytes: i64,
) -> VolumeVerdict {
    let mut verdict = VolumeVerdict::default();

    match state {
        "detached" | "attached" => match robustness {
            "degraded" => {
                verdict.has_error = true;
                verdict.message = "Volume is degraded".to_string();
                verdict.alert_type = "degraded";
            }
            "faulted" => {
                verdict.has_error = true;
                verdict.message = "Volume is faulted".to_string();
                verdict.alert_type = "faulted";
            }
            _ => {}
        },
        "creating" | "attaching" | "detaching" => {
            debug!(state = %state, "volume in transitional state");
        }
        other => {
            verdict.has_error = true;
            verdict.message = format!("Volume in unknown state: {other}");
            verdict.alert_type = "unknown_state";
        }
    }

    if capacity > 0 && actual_size > 0 {
        let usage_percent = actual_size as f64 / capacity as f64 * 100.0;
        let remaining = capacity - actual_size;

        if usage_percent > usage_threshold_percent {
            verdict.has_error = true;
            verdict.message = format!("Volume usage critical: {usage_percent:.1}% used");
            verdict.alert_type = "usage_critical";
        } else if remaining < capacity_critical_bytes {
            verdict.has_error = true;
            verdict.message = format!("Volume capacity critical: {remaining} bytes remaining");
            verdict.alert_type = "capacity_critical";
        }
    }

    verdict
}

async fn handle_volume(ctx: &Arc<AppContext>, obj: &DynamicObject) {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();

    if obj.data.get("status").is_none() {
        debug!(volume = %name, "no status found for volume");
        return;
    }
    if obj.data.get("spec").is_none() {
        debug!(volume = %name, "no spec found for volume");
        return;
    }

    let state = nested_str(&obj.data, &["status", "state"]).unwrap_or_default();
    let robustness = nested_str(&obj.data, &["status", "robustness"]).unwrap_or_default();
    let capacity = parse_byte_size(nested_str(&obj.data, &["spec", "size"]).unwrap_or_default());
    let actual_size = nested_i64(&obj.data, &["status", "actualSize"]).unwrap_or(0);

    debug!(
        volume = %name,
        namespace = %namespace,
        state = %state,
        robustness = %robustness,
        capacity,
        actual_size,
        "processing volume status"
    );

    let config = ctx.config().await;
    let verdict = volume_verdict(
        state,
        robustness,
        capacity,
        actual_size,
        config.longhorn.alert_thresholds.volume_usage_percent,
        config.longhorn.alert_thresholds.volume_capacity_critical,
    );

    let key = format!("{namespace}/{name}");
    let store = &ctx.stores.longhorn_volumes;
    let prev = store
        .upsert(
            &key,
            verdict.has_error,
            &verdict.message,
            LonghornInfo {
                resource_type: "volume",
                namespace: namespace.clone(),
                capacity,
                usage: actual_size,
                robustness: robustness.to_string(),
                ..Default::default()
            },
        )
        .await;

    if verdict.has_error {
        if store.should_alert(&key, config.interval).await {
            send_volume_alert(ctx, &name, &namespace, state, robustness, capacity, actual_size, &verdict).await;
            store.mark_sent(&key).await;
        }
    } else if recovered(&prev) {
        let alert = Alert::new(
            "Longhorn Volume Recovery",
            format!("Volume {name} in namespace {namespace} has recovered"),
        )
        .field(AlertField::inline("Volume", &name))
        .field(AlertField::inline("Namespace", &namespace))
        .field(AlertField::inline("State", "Healthy"));

        ctx.send_alert(alert).await;
        info!(volume = %name, namespace = %namespace, "Longhorn volume has recovered");
    }
}

#[allow(clippy::too_many_arguments)]
async fn send_volume_alert(
    ctx: &Arc<AppContext>,
    name: &str,
    namespace: &str,
    state: &str,
    robustness: &str,
    capacity: i64,
    actual_size: i64,
    verdict: &VolumeVerdict,
) {
    let usage_percent = if capacity > 0 && actual_size > 0 {
        actual_size as f64 / capacity as f64 * 100.0
    } else {
        0.0
    };

    let mut alert = Alert::new(
        format!("Longhorn Volume Alert on {namespace}"),
        format!("Volume {name}: {}", verdict.message),
    )
    .field(AlertField::inline("Volume", name))
    .field(AlertField::inline("Namespace", namespace))
    .field(AlertField::inline("State", state))
    .field(AlertField::inline("Robustness", robustness))
    .field(AlertField::inline("Alert Type", verdict.alert_type));

    if capacity > 0 {
        alert = alert.field(AlertField::inline(
            "Capacity",
            format!("{:.2} GB", capacity as f64 / BYTES_PER_GB),
        ));
    }
    if actual_size > 0 {
        alert = alert.field(AlertField::inline(
            "Usage",
            format!("{:.2} GB ({usage_percent:.1}%)", actual_size as f64 / BYTES_PER_GB),
        ));
    }

    ctx.send_alert(alert).await;
    error!(
        volume = %name,
        namespace = %namespace,
        state = %state,
        robustness = %robustness,
        alert_type = verdict.alert_type,
        "Longhorn volume alert sent"
    );
}

fn workload_verdict(kind: LonghornKind, current_state: &str) -> (bool, String) {
    let label = kind.kind();
    match current_state {
        "running" => (false, String::new()),
        "stopped" | "error" => (true, format!("{label} in {current_state} state")),
        "starting" | "stopping" => {
            debug!(state = %current_state, "{label} in transitional state");
            (false, String::new())
        }
        other => (true, format!("{label} in unknown state: {other}")),
    }
}

/// Replicas and engines share the `status.currentState` classification.
async fn handle_workload(ctx: &Arc<AppContext>, kind: LonghornKind, obj: &DynamicObject) {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();

    if obj.data.get("status").is_none() {
        return;
    }
    let current_state = nested_str(&obj.data, &["status", "currentState"]).unwrap_or_default();

    debug!(
        resource = %name,
        kind = kind.kind(),
        namespace = %namespace,
        state = %current_state,
        "processing status"
    );

    let (has_error, message) = workload_verdict(kind, current_state);

    let key = format!("{namespace}/{name}");
    let store = kind.store(ctx);
    let prev = store
        .upsert(
            &key,
            has_error,
            &message,
            LonghornInfo {
                resource_type: kind.label(),
                namespace: namespace.clone(),
                ..Default::default()
            },
        )
        .await;

    let config = ctx.config().await;
    if has_error {
        if store.should_alert(&key, config.interval).await {
            let alert = Alert::new(
                format!("Longhorn {} Alert on {namespace}", kind.kind()),
                format!("{} {name}: {message}", kind.kind()),
            )
            .field(AlertField::inline(kind.kind(), &name))
            .field(AlertField::inline("Namespace", &namespace))
            .field(AlertField::inline("State", current_state));

            ctx.send_alert(alert).await;
            store.mark_sent(&key).await;
            error!(
                resource = %name,
                kind = kind.kind(),
                namespace = %namespace,
                state = %current_state,
                "Longhorn alert sent"
            );
        }
    } else if recovered(&prev) {
        let alert = Alert::new(
            format!("Longhorn {} Recovery", kind.kind()),
            format!("{} {name} in namespace {namespace} has recovered", kind.kind()),
        )
        .field(AlertField::inline(kind.kind(), &name))
        .field(AlertField::inline("Namespace", &namespace))
        .field(AlertField::inline("State", "Running"));

        ctx.send_alert(alert).await;
        info!(resource = %name, kind = kind.kind(), "Longhorn resource has recovered");
    }
}

fn node_verdict(conditions: &[Value]) -> (bool, String) {
    let mut has_error = false;
    let mut message = String::new();

    for condition in conditions {
        let cond_type = nested_str(condition, &["type"]).unwrap_or_default();
        let status = nested_str(condition, &["status"]).unwrap_or_default();
        let reason = nested_str(condition, &["reason"]).unwrap_or_default();

        match cond_type {
            "Ready" if status != "True" => {
                has_error = true;
                message = format!("Node not ready: {reason}");
            }
            "Schedulable" if status != "True" => {
                has_error = true;
                message = format!("Node not schedulable: {reason}");
            }
            _ => {}
        }
    }

    (has_error, message)
}

async fn handle_node(ctx: &Arc<AppContext>, obj: &DynamicObject) {
    let name = obj.name_any();

    let Some(conditions) = nested_slice(&obj.data, &["status", "conditions"]) else {
        return;
    };

    debug!(node = %name, conditions = conditions.len(), "processing Longhorn node status");

    let (has_error, message) = node_verdict(conditions);

    let store = &ctx.stores.longhorn_nodes;
    let prev = store
        .upsert(
            &name,
            has_error,
            &message,
            LonghornInfo {
                resource_type: "node",
                ..Default::default()
            },
        )
        .await;

    let config = ctx.config().await;
    if has_error {
        if store.should_alert(&name, config.interval).await {
            let mut alert = Alert::new("Longhorn Node Alert", format!("Node {name}: {message}"))
                .field(AlertField::inline("Node", &name))
                .field(AlertField::block("Issue", &message));

            let details: Vec<String> = conditions
                .iter()
                .filter_map(|c| {
                    let cond_type = nested_str(c, &["type"])?;
                    let status = nested_str(c, &["status"])?;
                    Some(format!("{cond_type}={status}"))
                })
                .collect();
            if !details.is_empty() {
                alert = alert.field(AlertField::block("Conditions", details.join(", ")));
            }

            ctx.send_alert(alert).await;
            store.mark_sent(&name).await;
            error!(node = %name, error = %message, "Longhorn node alert sent");
        }
    } else if recovered(&prev) {
        let alert = Alert::new(
            "Longhorn Node Recovery",
            format!("Node {name} has recovered"),
        )
        .field(AlertField::inline("Node", &name))
        .field(AlertField::inline("State", "Ready"));

        ctx.send_alert(alert).await;
        info!(node = %name, "Longhorn node has recovered");
    }
}

fn backup_verdict(state: &str) -> (bool, String) {
    match state {
        "Completed" => (false, String::new()),
        "Error" => (true, "Backup failed".to_string()),
        "InProgress" | "Pending" => {
            debug!(state = %state, "backup in progress");
            (false, String::new())
        }
        other => (true, format!("Backup in unknown state: {other}")),
    }
}

async fn handle_backup(ctx: &Arc<AppContext>, obj: &DynamicObject) {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();

    if obj.data.get("status").is_none() {
        return;
    }
    let state = nested_str(&obj.data, &["status", "state"]).unwrap_or_default();

    debug!(backup = %name, namespace = %namespace, state = %state, "processing backup status");

    let (has_error, message) = backup_verdict(state);

    let key = format!("{namespace}/{name}");
    let store = &ctx.stores.longhorn_backups;
    let prev = store
        .upsert(
            &key,
            has_error,
            &message,
            LonghornInfo {
                resource_type: "backup",
                namespace: namespace.clone(),
                ..Default::default()
            },
        )
        .await;

    let config = ctx.config().await;
    if has_error {
        if store.should_alert(&key, config.interval).await {
            let alert = Alert::new(
                format!("Longhorn Backup Alert on {namespace}"),
                format!("Backup {name}: {message}"),
            )
            .field(AlertField::inline("Backup", &name))
            .field(AlertField::inline("Namespace", &namespace))
            .field(AlertField::inline("State", state));

            ctx.send_alert(alert).await;
            store.mark_sent(&key).await;
            error!(backup = %name, namespace = %namespace, state = %state, "Longhorn backup alert sent");
        }
    } else if state == "Completed" && recovered(&prev) {
        let alert = Alert::new(
            "Longhorn Backup Recovery",
            format!("Backup {name} in namespace {namespace} has completed successfully"),
        )
        .field(AlertField::inline("Backup", &name))
        .field(AlertField::inline("Namespace", &namespace))
        .field(AlertField::inline("State", "Completed"));

        ctx.send_alert(alert).await;
        info!(backup = %name, namespace = %namespace, "Longhorn backup has completed successfully");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const GIB: i64 = 1_073_741_824;

    #[test]
    fn test_healthy_attached_volume() {
        let verdict = volume_verdict("attached", "healthy", 10 * GIB, GIB, 85.0, GIB);
        assert!(!verdict.has_error);
    }

    #[test]
    fn test_degraded_volume() {
        let verdict = volume_verdict("attached", "degraded", 0, 0, 85.0, GIB);
        assert!(verdict.has_error);
        assert_eq!(verdict.message, "Volume is degraded");
        assert_eq!(verdict.alert_type, "degraded");
    }

    #[test]
    fn test_faulted_detached_volume() {
        let verdict = volume_verdict("detached", "faulted", 0, 0, 85.0, GIB);
        assert!(verdict.has_error);
        assert_eq!(verdict.alert_type, "faulted");
    }

    #[test]
    fn test_transitional_volume_states_ok() {
        for state in ["creating", "attaching", "detaching"] {
            let verdict = volume_verdict(state, "", 0, 0, 85.0, GIB);
            assert!(!verdict.has_error, "state {state} should be transitional");
        }
    }

    #[test]
    fn test_unknown_volume_state() {
        let verdict = volume_verdict("exploded", "", 0, 0, 85.0, GIB);
        assert!(verdict.has_error);
        assert_eq!(verdict.alert_type, "unknown_state");
    }

    #[test]
    fn test_volume_usage_over_threshold() {
        let verdict = volume_verdict("attached", "healthy", 10 * GIB, 9 * GIB, 85.0, GIB / 2);
        assert!(verdict.has_error);
        assert_eq!(verdict.alert_type, "usage_critical");
    }

    #[test]
    fn test_volume_capacity_critical() {
        // 50% used but less than the critical byte margin remains
        let verdict = volume_verdict("attached", "healthy", GIB, GIB / 2, 85.0, GIB);
        assert!(verdict.has_error);
        assert_eq!(verdict.alert_type, "capacity_critical");
    }

    #[test]
    fn test_zero_sizes_skip_capacity_checks() {
        let verdict = volume_verdict("attached", "healthy", 0, 0, 85.0, GIB);
        assert!(!verdict.has_error);
        let verdict = volume_verdict("attached", "healthy", 10 * GIB, 0, 85.0, GIB);
        assert!(!verdict.has_error);
    }

    #[test]
    fn test_workload_states() {
        let (err, _) = workload_verdict(LonghornKind::Replica, "running");
        assert!(!err);
        let (err, msg) = workload_verdict(LonghornKind::Replica, "stopped");
        assert!(err);
        assert_eq!(msg, "Replica in stopped state");
        let (err, msg) = workload_verdict(LonghornKind::Engine, "error");
        assert!(err);
        assert_eq!(msg, "Engine in error state");
        let (err, _) = workload_verdict(LonghornKind::Engine, "starting");
        assert!(!err);
        let (err, msg) = workload_verdict(LonghornKind::Replica, "weird");
        assert!(err);
        assert_eq!(msg, "Replica in unknown state: weird");
    }

    #[test]
    fn test_node_conditions() {
        let conditions = vec![
            json!({"type": "Ready", "status": "True"}),
            json!({"type": "Schedulable", "status": "True"}),
        ];
        let (err, _) = node_verdict(&conditions);
        assert!(!err);

        let conditions = vec![
            json!({"type": "Ready", "status": "False", "reason": "KubeletDown"}),
            json!({"type": "Schedulable", "status": "True"}),
        ];
        let (err, msg) = node_verdict(&conditions);
        assert!(err);
        assert_eq!(msg, "Node not ready: KubeletDown");

        let conditions = vec![json!({"type": "Schedulable", "status": "False", "reason": "Cordoned"})];
        let (err, msg) = node_verdict(&conditions);
        assert!(err);
        assert_eq!(msg, "Node not schedulable: Cordoned");
    }

    #[test]
    fn test_backup_states() {
        assert!(!backup_verdict("Completed").0);
        assert!(!backup_verdict("InProgress").0);
        assert!(!backup_verdict("Pending").0);
        let (err, msg) = backup_verdict("Error");
        assert!(err);
        assert_eq!(msg, "Backup failed");
        assert!(backup_verdict("Corrupt").0);
    }
}
