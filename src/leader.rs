//! Lease-based leader election.
//!
//! All replicas contend for a single `coordination.k8s.io/v1` Lease in the
//! agent's own namespace. Whoever holds it flips the context-wide
//! leadership flag; everything that posts to the webhook checks that flag
//! first. The lease is released on shutdown so a peer can take over
//! without waiting for expiry.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::context::AppContext;

const LEASE_NAME: &str = "sun-leader";
const LEASE_DURATION_SECS: i64 = 15;
const RENEW_DEADLINE: Duration = Duration::from_secs(10);
const RETRY_PERIOD: Duration = Duration::from_secs(2);

const NAMESPACE_ENV: &str = "POD_NAMESPACE";
const IDENTITY_ENV: &str = "POD_NAME";
const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Resolve the namespace the lease lives in: `POD_NAMESPACE`, then the
/// in-pod serviceaccount file, then `default`.
pub fn detect_namespace() -> String {
    if let Ok(ns) = std::env::var(NAMESPACE_ENV) {
        if !ns.is_empty() {
            return ns;
        }
    }
    if let Ok(data) = std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_FILE) {
        let ns = data.trim();
        if !ns.is_empty() {
            return ns.to_string();
        }
    }
    "default".to_string()
}

/// Run the election loop until shutdown. Never returns early except when
/// `POD_NAME` is unset, which makes election impossible.
pub async fn run(ctx: Arc<AppContext>, mut shutdown: watch::Receiver<bool>) {
    let namespace = detect_namespace();
    info!(namespace = %namespace, "leader election namespace resolved");

    let identity = match std::env::var(IDENTITY_ENV) {
        Ok(name) if !name.is_empty() => name,
        _ => {
            error!("POD_NAME environment variable not set");
            return;
        }
    };

    let leases: Api<Lease> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut last_renewed = Instant::now();
    let mut observed_holder = String::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            () = tokio::time::sleep(RETRY_PERIOD) => {}
        }

        match try_acquire_or_renew(&leases, &identity, &mut observed_holder).await {
            Ok(true) => {
                last_renewed = Instant::now();
                if !ctx.is_leader() {
                    ctx.set_leader(true);
                    info!("started leading");
                }
            }
            Ok(false) => {
                if ctx.is_leader() {
                    ctx.set_leader(false);
                    info!("stopped leading");
                }
            }
            Err(err) => {
                debug!(error = %err, "lease update attempt failed");
                if ctx.is_leader() && last_renewed.elapsed() > RENEW_DEADLINE {
                    ctx.set_leader(false);
                    warn!("renew deadline exceeded, stopped leading");
                }
            }
        }
    }

    if ctx.is_leader() {
        if let Err(err) = release(&leases, &identity).await {
            warn!(error = %err, "failed to release lease on shutdown");
        }
        ctx.set_leader(false);
        info!("released leadership on shutdown");
    }
}

/// One election round. Returns whether this replica holds the lease.
async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    identity: &str,
    observed_holder: &mut String,
) -> Result<bool> {
    let now = MicroTime(Utc::now());

    let Some(mut lease) = leases
        .get_opt(LEASE_NAME)
        .await
        .context("failed to read lease")?
    else {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(identity.to_string()),
                lease_duration_seconds: Some(LEASE_DURATION_SECS as i32),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };
        leases
            .create(&PostParams::default(), &lease)
            .await
            .context("failed to create lease")?;
        return Ok(true);
    };

    let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
    let holder = spec.holder_identity.clone().unwrap_or_default();

    if holder == identity {
        spec.renew_time = Some(now);
        leases
            .replace(LEASE_NAME, &PostParams::default(), &lease)
            .await
            .context("failed to renew lease")?;
        return Ok(true);
    }

    if holder != *observed_holder {
        info!(leader = %holder, "new leader elected");
        observed_holder.clone_from(&holder);
    }

    let duration = ChronoDuration::seconds(
        spec.lease_duration_seconds
            .map_or(LEASE_DURATION_SECS, i64::from),
    );
    let expired = spec
        .renew_time
        .as_ref()
        .is_none_or(|t| Utc::now() - t.0 > duration);
    if !expired {
        return Ok(false);
    }

    // The holder stopped renewing; take the lease over.
    spec.holder_identity = Some(identity.to_string());
    spec.acquire_time = Some(now.clone());
    spec.renew_time = Some(now);
    spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
    leases
        .replace(LEASE_NAME, &PostParams::default(), &lease)
        .await
        .context("failed to take over expired lease")?;
    Ok(true)
}

/// Clear the holder so a peer can acquire without waiting for expiry.
async fn release(leases: &Api<Lease>, identity: &str) -> Result<()> {
    let Some(mut lease) = leases.get_opt(LEASE_NAME).await? else {
        return Ok(());
    };
    let Some(spec) = lease.spec.as_mut() else {
        return Ok(());
    };
    if spec.holder_identity.as_deref() != Some(identity) {
        return Ok(());
    }
    spec.holder_identity = None;
    spec.renew_time = None;
    leases.replace(LEASE_NAME, &PostParams::default(), &lease).await?;
    Ok(())
}
