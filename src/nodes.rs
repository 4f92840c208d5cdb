//! Node condition watcher and CPU-request pressure calculator.
//!
//! Every node event is classified twice: once against the `Ready`,
//! `MemoryPressure`, and `DiskPressure` conditions, and once against the
//! ratio of summed container CPU requests to allocatable CPU.

use anyhow::Result;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Node, NodeCondition, Pod};
use kube::api::ListParams;
use kube::runtime::watcher::{self, Event};
use kube::{Api, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::alerts::{Alert, AlertField};
use crate::context::AppContext;
use crate::objects::parse_cpu_millis;

/// Extra state carried for node resource monitoring.
#[derive(Debug, Clone, Default)]
pub struct NodeResourceInfo {
    pub cpu_capacity_milli: i64,
    pub cpu_requests_milli: i64,
    pub cpu_usage_percent: f64,
}

/// Watch nodes cluster-wide until shutdown.
pub async fn run(ctx: Arc<AppContext>, mut shutdown: watch::Receiver<bool>) {
    let nodes: Api<Node> = Api::all(ctx.client.clone());

    info!("starting node watcher");

    let mut backoff = Duration::from_secs(1);
    let max_backoff = Duration::from_secs(30);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("stopping node watcher");
                return;
            }
            result = watch_nodes(&ctx, &nodes) => match result {
                Ok(()) => {
                    warn!("node watch stream ended, reconnecting");
                    backoff = Duration::from_secs(1);
                }
                Err(err) => {
                    error!(error = %err, "node watch failed, reconnecting in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, max_backoff);
                }
            }
        }
    }
}

async fn watch_nodes(ctx: &Arc<AppContext>, nodes: &Api<Node>) -> Result<()> {
    let mut stream = watcher::watcher(nodes.clone(), watcher::Config::default()).boxed();

    while let Some(event) = stream.try_next().await? {
        match event {
            Event::Apply(node) | Event::InitApply(node) => handle_node(ctx, &node).await,
            Event::Delete(_) => {}
            Event::Init => debug!("node watcher initializing"),
            Event::InitDone => info!("node watcher initial sync complete"),
        }
    }

    Ok(())
}

async fn handle_node(ctx: &Arc<AppContext>, node: &Node) {
    let name = node.name_any();
    debug!(node = %name, "processing node status");

    let verdict = classify_conditions(node);
    let interval = { ctx.config.read().await.interval };

    for condition in &verdict.triggered {
        if ctx.stores.nodes.should_alert(&name, interval).await {
            send_condition_alert(ctx, &name, condition).await;
            ctx.stores.nodes.mark_sent(&name).await;
        }
    }

    if verdict.healthy && ctx.stores.nodes.recovery_pending(&name).await {
        send_node_recovery(ctx, &name).await;
    }

    ctx.stores
        .nodes
        .upsert(&name, verdict.has_error, &verdict.message, ())
        .await;

    process_node_resource_usage(ctx, node).await;
}

struct ConditionVerdict<'a> {
    has_error: bool,
    message: String,
    /// Conditions that independently warrant an alert.
    triggered: Vec<&'a NodeCondition>,
    /// Ready is True and neither pressure condition is set.
    healthy: bool,
}

fn find_condition<'a>(node: &'a Node, cond_type: &str) -> Option<&'a NodeCondition> {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == cond_type))
}

fn classify_conditions(node: &Node) -> ConditionVerdict<'_> {
    let ready = find_condition(node, "Ready");
    let memory = find_condition(node, "MemoryPressure");
    let disk = find_condition(node, "DiskPressure");

    let mut verdict = ConditionVerdict {
        has_error: false,
        message: String::new(),
        triggered: Vec::new(),
        healthy: false,
    };

    if let Some(cond) = ready {
        if cond.status == "False" || cond.status == "Unknown" {
            verdict.has_error = true;
            verdict.message = "Node not Ready".to_string();
            verdict.triggered.push(cond);
        }
    }
    if let Some(cond) = memory {
        if cond.status == "True" {
            verdict.has_error = true;
            verdict.message = "Node under MemoryPressure".to_string();
            verdict.triggered.push(cond);
        }
    }
    if let Some(cond) = disk {
        if cond.status == "True" {
            verdict.has_error = true;
            verdict.message = "Node under DiskPressure".to_string();
            verdict.triggered.push(cond);
        }
    }

    verdict.healthy = ready.is_some_and(|c| c.status == "True")
        && memory.is_none_or(|c| c.status == "False")
        && disk.is_none_or(|c| c.status == "False");

    verdict
}

async fn send_condition_alert(ctx: &Arc<AppContext>, name: &str, condition: &NodeCondition) {
    let alert = Alert::new(
        format!("Node {name}: {}", condition.type_),
        format!(
            "Node {name} has condition {} = {}",
            condition.type_, condition.status
        ),
    )
    .field(AlertField::inline("Node", name))
    .field(AlertField::inline("Condition", &condition.type_))
    .field(AlertField::inline("Status", &condition.status))
    .field(AlertField::block(
        "Reason",
        condition.reason.clone().unwrap_or_default(),
    ))
    .field(AlertField::block(
        "Message",
        condition.message.clone().unwrap_or_default(),
    ));

    ctx.send_alert(alert).await;
    error!(
        node = %name,
        condition = %condition.type_,
        status = %condition.status,
        "node condition alert sent"
    );
}

async fn send_node_recovery(ctx: &Arc<AppContext>, name: &str) {
    let alert = Alert::new(
        format!("Node {name} Recovery"),
        format!("Node {name} has recovered all conditions"),
    )
    .field(AlertField::inline("Node", name))
    .field(AlertField::inline("State", "Ready"));

    ctx.send_alert(alert).await;
    info!(node = %name, "node has recovered");
}

/// Sum CPU requests (millicores) across containers of running and pending
/// pods.
fn sum_cpu_requests(pods: &[Pod]) -> i64 {
    pods.iter()
        .filter(|pod| {
            matches!(
                pod.status.as_ref().and_then(|s| s.phase.as_deref()),
                Some("Running" | "Pending")
            )
        })
        .flat_map(|pod| pod.spec.iter().flat_map(|s| s.containers.iter()))
        .filter_map(|container| {
            container
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref())
                .and_then(|requests| requests.get("cpu"))
                .and_then(|q| parse_cpu_millis(&q.0))
        })
        .sum()
}

/// Compare summed pod CPU requests on the node against its allocatable
/// CPU and alert when the configured threshold is exceeded.
async fn process_node_resource_usage(ctx: &Arc<AppContext>, node: &Node) {
    let config = ctx.config().await;
    if !config.node_monitoring.enabled {
        return;
    }

    let name = node.name_any();

    let cpu_capacity = node
        .status
        .as_ref()
        .and_then(|s| s.allocatable.as_ref())
        .and_then(|a| a.get("cpu"))
        .and_then(|q| parse_cpu_millis(&q.0))
        .unwrap_or(0);

    let pods: Api<Pod> = Api::all(ctx.client.clone());
    let params = ListParams::default().fields(&format!("spec.nodeName={name}"));
    let pod_list = match pods.list(&params).await {
        Ok(list) => list,
        Err(err) => {
            error!(node = %name, error = %err, "failed to list pods for node resource usage");
            return;
        }
    };

    let cpu_requests = sum_cpu_requests(&pod_list.items);

    let cpu_usage_percent = if cpu_capacity > 0 {
        cpu_requests as f64 / cpu_capacity as f64 * 100.0
    } else {
        0.0
    };

    debug!(
        node = %name,
        cpu_usage_percent,
        cpu_capacity_millicores = cpu_capacity,
        cpu_requests_millicores = cpu_requests,
        "node resource usage calculated"
    );

    let threshold = config.node_monitoring.cpu_threshold_percent;
    let mut has_error = false;
    let mut message = String::new();

    if cpu_usage_percent > threshold {
        has_error = true;
        message = format!("CPU usage {cpu_usage_percent:.1}% exceeds threshold {threshold:.1}%");

        if ctx.stores.node_resources.should_alert(&name, config.interval).await {
            let alert = Alert::new(
                format!("Node {name} CPU Alert"),
                format!("Node {name} CPU usage is above threshold"),
            )
            .field(AlertField::inline("Node", &name))
            .field(AlertField::inline("CPU Usage", format!("{cpu_usage_percent:.1}%")))
            .field(AlertField::inline("Threshold", format!("{threshold:.1}%")));

            ctx.send_alert(alert).await;
            ctx.stores.node_resources.mark_sent(&name).await;
            error!(
                node = %name,
                cpu_usage_percent,
                threshold,
                "node CPU usage alert sent"
            );
        }
    }

    if !has_error {
        if let Some(prev) = ctx.stores.node_resources.get(&name).await {
            // Recovery only fires when the previous sample was over the
            // threshold; a restart in between loses the transition.
            if prev.unit.has_error
                && prev.unit.alert_sent
                && prev.info.cpu_usage_percent > threshold
            {
                let alert = Alert::new(
                    format!("Node {name} CPU Recovery"),
                    format!("Node {name} CPU usage has returned to normal levels"),
                )
                .field(AlertField::inline("Node", &name))
                .field(AlertField::inline(
                    "Current CPU Usage",
                    format!("{cpu_usage_percent:.1}%"),
                ));

                ctx.send_alert(alert).await;
                info!(node = %name, cpu_usage_percent, "node CPU usage recovery alert sent");
            }
        }
    }

    ctx.stores
        .node_resources
        .upsert(
            &name,
            has_error,
            &message,
            NodeResourceInfo {
                cpu_capacity_milli: cpu_capacity,
                cpu_requests_milli: cpu_requests,
                cpu_usage_percent,
            },
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        Container, NodeStatus, PodSpec, PodStatus, ResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    fn condition(cond_type: &str, status: &str) -> NodeCondition {
        NodeCondition {
            type_: cond_type.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    fn node_with(conditions: Vec<NodeCondition>) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(conditions),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod_with_cpu(phase: &str, cpu: &str) -> Pod {
        let mut requests = BTreeMap::new();
        requests.insert("cpu".to_string(), Quantity(cpu.to_string()));
        Pod {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    resources: Some(ResourceRequirements {
                        requests: Some(requests),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_healthy_node() {
        let node = node_with(vec![
            condition("Ready", "True"),
            condition("MemoryPressure", "False"),
            condition("DiskPressure", "False"),
        ]);
        let verdict = classify_conditions(&node);
        assert!(!verdict.has_error);
        assert!(verdict.healthy);
        assert!(verdict.triggered.is_empty());
    }

    #[test]
    fn test_not_ready_node() {
        let node = node_with(vec![condition("Ready", "False")]);
        let verdict = classify_conditions(&node);
        assert!(verdict.has_error);
        assert!(!verdict.healthy);
        assert_eq!(verdict.message, "Node not Ready");
        assert_eq!(verdict.triggered.len(), 1);
    }

    #[test]
    fn test_unknown_ready_is_error() {
        let node = node_with(vec![condition("Ready", "Unknown")]);
        let verdict = classify_conditions(&node);
        assert!(verdict.has_error);
    }

    #[test]
    fn test_disk_pressure() {
        let node = node_with(vec![
            condition("Ready", "True"),
            condition("DiskPressure", "True"),
        ]);
        let verdict = classify_conditions(&node);
        assert!(verdict.has_error);
        assert!(!verdict.healthy);
        assert_eq!(verdict.message, "Node under DiskPressure");
    }

    #[test]
    fn test_multiple_pressures_trigger_independently() {
        let node = node_with(vec![
            condition("Ready", "False"),
            condition("MemoryPressure", "True"),
            condition("DiskPressure", "True"),
        ]);
        let verdict = classify_conditions(&node);
        assert_eq!(verdict.triggered.len(), 3);
    }

    #[test]
    fn test_absent_pressures_still_healthy() {
        let node = node_with(vec![condition("Ready", "True")]);
        let verdict = classify_conditions(&node);
        assert!(verdict.healthy);
    }

    #[test]
    fn test_sum_cpu_requests_filters_phases() {
        let pods = vec![
            pod_with_cpu("Running", "500m"),
            pod_with_cpu("Pending", "1"),
            pod_with_cpu("Succeeded", "2"),
            pod_with_cpu("Failed", "250m"),
        ];
        // Succeeded and Failed pods no longer consume requests
        assert_eq!(sum_cpu_requests(&pods), 1500);
    }

    #[test]
    fn test_sum_cpu_requests_without_requests() {
        let pod = Pod {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(sum_cpu_requests(&[pod]), 0);
    }
}
