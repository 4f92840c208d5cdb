//! sun - Kubernetes monitoring and GitOps drift-detection agent.
//!
//! Watches pods, nodes, Longhorn storage objects, and GitOps repositories
//! for a single cluster, derives per-object health verdicts, and emits
//! deduplicated alert and recovery notifications to a chat webhook. Runs
//! as multiple replicas with lease-based leader election so only one
//! replica posts.

mod alerts;
mod config;
mod context;
mod gitops;
mod leader;
mod longhorn;
mod nodes;
mod objects;
mod pods;
mod state;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::context::AppContext;

const BANNER: &str = r"
  ________ __  ____
 /  ___/  |  \/    \
 \___ \|  |  /   |  \
/____  >____/|___|  /
     \/           \/";

#[tokio::main]
async fn main() -> Result<()> {
    println!("{BANNER}");

    let config_path = config::find_config_file();
    let initial_config = match &config_path {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("error reading config file: {err:#}");
                Config::default()
            }
        },
        None => Config::default(),
    };

    // RUST_LOG wins over the configured level; the reload handle lets a
    // config change re-apply the level at runtime.
    let initial_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(&initial_config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    });
    let (filter_layer, log_handle) = tracing_subscriber::reload::Layer::new(initial_filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting sun");
    initial_config.log_summary("loaded");

    let (kube_config, in_cluster) = match kube::Config::incluster() {
        Ok(config) => (config, true),
        Err(_) => {
            let config = kube::Config::infer()
                .await
                .context("failed to build kubeconfig")?;
            (config, false)
        }
    };
    let client = kube::Client::try_from(kube_config).context("failed to create Kubernetes client")?;
    info!(in_cluster, "connected to Kubernetes cluster");

    let ctx = Arc::new(AppContext::new(client, in_cluster, initial_config));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if in_cluster {
        info!("running in cluster, starting leader election");
        tokio::spawn(leader::run(ctx.clone(), shutdown_rx.clone()));
    } else {
        info!("running outside cluster, skipping leader election and assuming leadership");
        ctx.set_leader(true);
    }

    tokio::spawn(pods::run(ctx.clone(), shutdown_rx.clone()));
    tokio::spawn(nodes::run(ctx.clone(), shutdown_rx.clone()));

    {
        let config = ctx.config().await;

        if config.longhorn.enabled {
            longhorn::setup(ctx.clone(), shutdown_rx.clone()).await;
        } else {
            info!("Longhorn monitoring is disabled");
        }

        if config.gitops.enabled {
            // setup only errors on discovery failure, which is fatal
            if let Err(err) = gitops::setup(ctx.clone(), shutdown_rx.clone()).await {
                error!(error = %err, "failed to initialize GitOps resource discovery");
                return Err(err);
            }
        } else {
            info!("GitOps monitoring is disabled");
        }
    }

    if let Some(path) = config_path {
        tokio::spawn(config::watch_and_reload(ctx.clone(), path, log_handle));
    }

    shutdown_signal().await;
    info!("shutting down sun");
    let _ = shutdown_tx.send(true);

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("received SIGTERM, shutting down gracefully");
        },
    }
}
