//! CoScale Autoscaler
//!
//! Scales Kubernetes workloads on CoScale metrics.
//!
//! ## Usage
//!
//! ```bash
//! # Run the autoscaler (requires in-cluster config or a kubeconfig)
//! APP_ID=... ACCESS_TOKEN=... SCALER_CONFIG='[...]' coscale-autoscaler
//!
//! # Run with custom log level
//! RUST_LOG=debug coscale-autoscaler
//!
//! # Print the JSON Schema of SCALER_CONFIG
//! coscale-autoscaler --print-config-schema
//! ```

use clap::Parser;
use coscale_autoscaler::config::{
    self, Settings, DEFAULT_API_URL, DEFAULT_CALL_TIMEOUT_SECS, DEFAULT_CHECK_INTERVAL_SECS,
};
use coscale_autoscaler::{CoScaleClient, KubeWorkloadScaler, ScalerController, TargetState};
use kube::Client;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// CoScale Autoscaler
#[derive(Parser, Debug)]
#[command(name = "coscale-autoscaler")]
#[command(version, about = "Scales Kubernetes workloads on CoScale metrics")]
struct Args {
    /// CoScale API base URL
    #[arg(long, env = "API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    /// CoScale application id
    #[arg(long, env = "APP_ID")]
    app_id: Option<String>,

    /// CoScale access token
    #[arg(long, env = "ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// JSON array of scaler targets
    #[arg(long, env = "SCALER_CONFIG")]
    scaler_config: Option<String>,

    /// Seconds between two checks
    #[arg(long, env = "CHECK_INTERVAL", default_value_t = DEFAULT_CHECK_INTERVAL_SECS)]
    check_interval: u64,

    /// Seconds before a single CoScale or Kubernetes call is given up
    #[arg(long, env = "CALL_TIMEOUT_SEC", default_value_t = DEFAULT_CALL_TIMEOUT_SECS)]
    call_timeout: u64,

    /// Print the JSON Schema of SCALER_CONFIG and exit
    #[arg(long, default_value = "false")]
    print_config_schema: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();

    if args.print_config_schema {
        println!("{}", serde_json::to_string_pretty(&config::config_schema())?);
        return Ok(());
    }

    let settings = Settings::new(
        args.api_url,
        args.app_id,
        args.access_token,
        args.scaler_config,
        args.check_interval,
        args.call_timeout,
    )
    .inspect_err(|e| error!("{}", e))?;

    info!(
        "Configuration: {}",
        serde_json::to_string_pretty(&settings.targets)?
    );

    let client = Client::try_default().await.inspect_err(|e| {
        error!("Creating Kubernetes configuration failed: {}", e);
        error!("Is the container running in a Kubernetes cluster?");
    })?;
    info!("Connected to Kubernetes API server");

    let metrics = Arc::new(CoScaleClient::new(settings.coscale, settings.call_timeout)?);
    let workloads = Arc::new(KubeWorkloadScaler::new(client));

    let controller = ScalerController::new(metrics, workloads)
        .with_check_interval(settings.check_interval)
        .with_call_timeout(settings.call_timeout);

    let states: Vec<TargetState> = settings
        .targets
        .into_iter()
        .map(|target| {
            info!(
                namespace = %target.namespace,
                workload = %target.workload(),
                metric = %target.metric.name,
                "Starting scaler"
            );
            TargetState::new(target)
        })
        .collect();

    controller.run(states, shutdown_signal()).await;

    info!("CoScale autoscaler shutting down");
    Ok(())
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Received shutdown signal");
}
