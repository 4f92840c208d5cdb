//! Pod watcher and container-status classifier.
//!
//! Consumes the pod event stream for the configured namespace, derives a
//! per-pod verdict from container statuses, and emits failure alerts with
//! tail logs plus recovery alerts once a previously-alerted pod is running
//! again.

use anyhow::Result;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::api::LogParams;
use kube::runtime::watcher::{self, Event};
use kube::{Api, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::alerts::{Alert, AlertField};
use crate::context::AppContext;

const LOG_TAIL_LINES: i64 = 50;

/// Watch pods until shutdown, reconnecting with backoff on stream errors.
pub async fn run(ctx: Arc<AppContext>, mut shutdown: watch::Receiver<bool>) {
    let namespace = { ctx.config.read().await.namespace.clone() };
    let pods: Api<Pod> = if namespace.is_empty() {
        Api::all(ctx.client.clone())
    } else {
        Api::namespaced(ctx.client.clone(), &namespace)
    };

    info!(namespace = %namespace, "starting pod watcher");

    let mut backoff = Duration::from_secs(1);
    let max_backoff = Duration::from_secs(30);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("stopping pod watcher");
                return;
            }
            result = watch_pods(&ctx, &pods) => match result {
                Ok(()) => {
                    warn!("pod watch stream ended, reconnecting");
                    backoff = Duration::from_secs(1);
                }
                Err(err) => {
                    error!(error = %err, "pod watch failed, reconnecting in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, max_backoff);
                }
            }
        }
    }
}

async fn watch_pods(ctx: &Arc<AppContext>, pods: &Api<Pod>) -> Result<()> {
    let mut stream = watcher::watcher(pods.clone(), watcher::Config::default()).boxed();

    while let Some(event) = stream.try_next().await? {
        match event {
            Event::Apply(pod) | Event::InitApply(pod) => handle_pod(ctx, &pod).await,
            Event::Delete(_) => {}
            Event::Init => debug!("pod watcher initializing"),
            Event::InitDone => info!("pod watcher initial sync complete"),
        }
    }

    Ok(())
}

/// Classify every container status and fold the verdicts into the pod's
/// health record.
async fn handle_pod(ctx: &Arc<AppContext>, pod: &Pod) {
    let name = pod.name_any();
    let namespace = pod.namespace().unwrap_or_default();

    debug!(pod = %name, namespace = %namespace, "processing pod status");

    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or_default();

    let mut has_error = false;
    let mut error_message = String::new();

    for container in statuses {
        let (container_error, message) = process_container(ctx, pod, container).await;
        if container_error {
            has_error = true;
            error_message = message;
        }
    }

    let key = format!("{namespace}/{name}");
    ctx.stores.pods.upsert(&key, has_error, &error_message, ()).await;
}

/// Derive the verdict for one container and emit any due alert.
async fn process_container(
    ctx: &Arc<AppContext>,
    pod: &Pod,
    container: &ContainerStatus,
) -> (bool, String) {
    let namespace = pod.namespace().unwrap_or_default();
    let key = format!("{namespace}/{}", pod.name_any());
    let interval = { ctx.config.read().await.interval };

    let mut has_error = false;
    let mut error_message = String::new();

    let state = container.state.as_ref();

    if let Some(terminated) = state.and_then(|s| s.terminated.as_ref()) {
        if terminated.exit_code != 0 {
            has_error = true;
            error_message = format!("Container {} has failed", container.name);
            if ctx.stores.pods.should_alert(&key, interval).await {
                send_terminated_alert(ctx, pod, container, terminated.exit_code).await;
                ctx.stores.pods.mark_sent(&key).await;
            }
        }
    }

    if let Some(waiting) = state.and_then(|s| s.waiting.as_ref()) {
        has_error = true;
        error_message = format!("Container {} is waiting", container.name);
        if ctx.stores.pods.should_alert(&key, interval).await {
            let reason = waiting.reason.clone().unwrap_or_default();
            send_waiting_alert(ctx, pod, container, &reason).await;
            ctx.stores.pods.mark_sent(&key).await;
        }
    }

    if state.is_some_and(|s| s.running.is_some()) && ctx.stores.pods.recovery_pending(&key).await {
        send_recovery_alert(ctx, pod, container).await;
    }

    (has_error, error_message)
}

async fn send_terminated_alert(
    ctx: &Arc<AppContext>,
    pod: &Pod,
    container: &ContainerStatus,
    exit_code: i32,
) {
    let name = pod.name_any();
    let namespace = pod.namespace().unwrap_or_default();
    let reason = container
        .state
        .as_ref()
        .and_then(|s| s.terminated.as_ref())
        .and_then(|t| t.reason.clone())
        .unwrap_or_default();

    let logs = fetch_container_logs(ctx, pod, &container.name).await;

    let alert = Alert::new(
        format!("Pod Failure on {namespace}"),
        format!("Pod {name} in namespace {namespace} has failed"),
    )
    .field(AlertField::inline("Container", &container.name))
    .field(AlertField::inline("State", "Terminated"))
    .field(AlertField::inline("Exit Code", exit_code.to_string()))
    .field(AlertField::inline("Reason", &reason))
    .logs(logs);

    ctx.send_alert(alert).await;
    error!(
        pod = %name,
        namespace = %namespace,
        container = %container.name,
        exit_code,
        reason = %reason,
        "pod has failed"
    );
}

async fn send_waiting_alert(
    ctx: &Arc<AppContext>,
    pod: &Pod,
    container: &ContainerStatus,
    reason: &str,
) {
    let name = pod.name_any();
    let namespace = pod.namespace().unwrap_or_default();

    // During init the kubelet has no logs to hand out yet.
    let logs = if reason == "PodInitializing" {
        "Pod is initializing - logs not available yet".to_string()
    } else {
        fetch_container_logs(ctx, pod, &container.name).await
    };

    let alert = Alert::new(
        format!("Pod Waiting on {namespace}"),
        format!("Pod {name} in namespace {namespace} is waiting"),
    )
    .field(AlertField::inline("Container", &container.name))
    .field(AlertField::inline("State", reason))
    .field(AlertField::inline("Reason", reason))
    .logs(logs);

    ctx.send_alert(alert).await;
    error!(
        pod = %name,
        namespace = %namespace,
        container = %container.name,
        reason = %reason,
        "pod is waiting"
    );
}

async fn send_recovery_alert(ctx: &Arc<AppContext>, pod: &Pod, container: &ContainerStatus) {
    let name = pod.name_any();
    let namespace = pod.namespace().unwrap_or_default();

    let alert = Alert::new(
        "Pod Recovery Alert",
        format!("Pod {name} in namespace {namespace} has recovered"),
    )
    .field(AlertField::inline("Container", &container.name))
    .field(AlertField::inline("State", "Running"));

    ctx.send_alert(alert).await;
    info!(pod = %name, namespace = %namespace, "pod has recovered");
}

/// Tail the container's logs for alert context. Failures degrade to an
/// explanatory string inside the alert rather than suppressing it.
async fn fetch_container_logs(ctx: &Arc<AppContext>, pod: &Pod, container: &str) -> String {
    let namespace = pod.namespace().unwrap_or_default();
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let params = LogParams {
        container: Some(container.to_string()),
        tail_lines: Some(LOG_TAIL_LINES),
        ..Default::default()
    };

    match pods.logs(&pod.name_any(), &params).await {
        Ok(logs) => logs,
        Err(err) => {
            error!(
                pod = %pod.name_any(),
                container = %container,
                error = %err,
                "failed to fetch container logs"
            );
            format!("Failed to fetch logs, error: {err}")
        }
    }
}
