mod api;
mod config;
mod metrics;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use topom_core::Topom;
use topom_models::Store;
use tracing::{error, info};

use crate::config::TopomConfig;

#[derive(Parser)]
#[command(name = "topom-server", about = "cluster controller for codis-style proxies")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "TOPOM_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// address of the admin HTTP API
    #[arg(long, env = "TOPOM_ADMIN_ADDR")]
    admin_addr: Option<String>,

    /// product this controller manages
    #[arg(long, env = "TOPOM_PRODUCT_NAME")]
    product_name: Option<String>,

    /// product password, used for backend AUTH and xauth tokens
    #[arg(long, env = "TOPOM_PRODUCT_AUTH")]
    product_auth: Option<String>,

    /// coordinator backend: memory or filesystem
    #[arg(long, env = "TOPOM_COORDINATOR_NAME")]
    coordinator_name: Option<String>,

    /// coordinator address (root directory for the filesystem backend)
    #[arg(long, env = "TOPOM_COORDINATOR_ADDR")]
    coordinator_addr: Option<String>,

    /// delete the product's lock cell and exit
    #[arg(long)]
    remove_lock: bool,

    /// start with the slot action dispatcher paused
    #[arg(long, env = "TOPOM_SLOT_ACTION_DISABLED")]
    slot_action_disabled: bool,
}

/// Applies CLI overrides to a `TopomConfig`. Only values given on the
/// command line or in the environment take effect.
fn apply_args(cfg: &mut TopomConfig, args: &Args) {
    if let Some(ref v) = args.admin_addr {
        cfg.admin_addr = v.clone();
    }
    if let Some(ref v) = args.product_name {
        cfg.product_name = v.clone();
    }
    if let Some(ref v) = args.product_auth {
        cfg.product_auth = v.clone();
    }
    if let Some(ref v) = args.coordinator_name {
        cfg.coordinator_name = v.clone();
    }
    if let Some(ref v) = args.coordinator_addr {
        cfg.coordinator_addr = v.clone();
    }
    if args.slot_action_disabled {
        cfg.slot_action_disabled = true;
    }
}

/// Prints `msg` to stderr and exits with code 1.
fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

async fn remove_lock(cfg: &TopomConfig) {
    let client = topom_models::new_client(&cfg.coordinator_name, &cfg.coordinator_addr)
        .unwrap_or_else(|e| exit_err(format!("failed to create coordinator client: {e}")));
    let store = Store::new(client, cfg.product_name.clone());
    match store.force_remove_lock().await {
        Ok(Some(holder)) => info!(
            "removed lock of product '{}' held by topom-[{}]",
            cfg.product_name, holder.admin_addr
        ),
        Ok(None) => info!("product '{}' was not locked", cfg.product_name),
        Err(e) => exit_err(format!("failed to remove lock: {e}")),
    }
    if let Err(e) = store.close().await {
        error!("close coordinator client failed: {e}");
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "topom_core=info,topom_models=info,topom_server=info".into()),
        )
        .init();

    let args = Args::parse();

    if args.config_template {
        match TopomConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    // defaults -> TOML file -> CLI/env overrides
    let mut cfg = match &args.config {
        Some(path) => TopomConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => TopomConfig::default(),
    };
    apply_args(&mut cfg, &args);
    cfg.validate().unwrap_or_else(|e| exit_err(format!("invalid config: {e}")));

    if args.remove_lock {
        remove_lock(&cfg).await;
        return;
    }

    let listener = TcpListener::bind(&cfg.admin_addr)
        .await
        .unwrap_or_else(|e| exit_err(format!("failed to bind admin address '{}': {e}", cfg.admin_addr)));

    let metrics = if cfg.metrics_enabled {
        let handle = metrics::install_recorder()
            .unwrap_or_else(|e| exit_err(format!("failed to install metrics recorder: {e}")));
        metrics::spawn_upkeep(handle.clone());
        Some(handle)
    } else {
        None
    };

    let client = topom_models::new_client(&cfg.coordinator_name, &cfg.coordinator_addr)
        .unwrap_or_else(|e| exit_err(format!("failed to create coordinator client: {e}")));
    let topom = Topom::new(client, cfg.to_core())
        .await
        .unwrap_or_else(|e| exit_err(format!("failed to start topom: {e}")));

    info!(
        product = %cfg.product_name,
        coordinator = %cfg.coordinator_name,
        admin = %cfg.admin_addr,
        "topom server starting..."
    );

    if let Err(e) = topom.start() {
        exit_err(format!("failed to start background routines: {e}"));
    }

    let state = Arc::new(api::ApiState {
        topom: Arc::clone(&topom),
        metrics,
    });
    let server = tokio::spawn(api::serve(listener, state));

    tokio::select! {
        _ = topom.closed() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
            if let Err(e) = topom.close().await {
                error!("close topom failed: {e}");
            }
        }
    }
    let _ = server.await;

    if topom.lock_lost() {
        exit_err("topom lost the product lock");
    }
    info!("topom server exited");
}
