//! Consist Operator - keeps Services and their Pods consistent with a backend

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{info, warn};

use consist_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use consist_controller::cluster::{ClusterClients, EmployeeRouting};
use consist_controller::{build_controller, Context};
use consist_operator::demo::{DemoAdapter, DemoWebhookAdapter};
use consist_operator::webhook::{serve, webhook_router, WebhookState};

/// Consist operator - mirrors Services and their Pods into a load balancer
#[derive(Parser, Debug)]
#[command(name = "consist-operator", version, about, long_about = None)]
struct Cli {
    /// Address the admission webhook listens on
    #[arg(long, env = "WEBHOOK_BIND_ADDRESS", default_value = "0.0.0.0:9443")]
    webhook_bind_address: SocketAddr,

    /// Directory holding tls.crt and tls.key; plain HTTP when unset
    #[arg(long, env = "CERT_DIR")]
    cert_dir: Option<PathBuf>,

    /// Member cluster as NAME=CONTEXT (kubeconfig context), repeatable
    #[arg(long = "member-cluster", value_parser = parse_member)]
    member_clusters: Vec<(String, String)>,

    /// How employee names map to clusters: single, federated or local
    #[arg(long, default_value = "single")]
    employee_routing: EmployeeRouting,

    /// Log output format: text or json
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Run only the controller
    #[arg(long)]
    disable_webhook: bool,
}

fn parse_member(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, context)) if !name.is_empty() && !context.is_empty() => {
            Ok((name.to_string(), context.to_string()))
        }
        _ => Err(format!("expected NAME=CONTEXT, got '{raw}'")),
    }
}

/// Client for one kubeconfig context
async fn client_for_context(context: &str) -> anyhow::Result<Client> {
    let options = KubeConfigOptions {
        context: Some(context.to_string()),
        ..Default::default()
    };
    let kubeconfig = Kubeconfig::read().context("failed to read kubeconfig")?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .with_context(|| format!("failed to load kubeconfig context {context}"))?;
    Client::try_from(config).with_context(|| format!("failed to create client for {context}"))
}

async fn cluster_clients(cli: &Cli) -> anyhow::Result<ClusterClients> {
    let hub = Client::try_default()
        .await
        .context("failed to create hub client")?;
    let mut clusters = ClusterClients::single(hub);
    for (name, context) in &cli.member_clusters {
        info!(cluster = %name, context = %context, "Adding member cluster");
        clusters = clusters.with_member(name.clone(), client_for_context(context).await?);
    }
    if cli.employee_routing == EmployeeRouting::Local && cli.member_clusters.is_empty() {
        warn!("Local employee routing without member clusters selects no pods");
    }
    Ok(clusters)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // kube and axum-server both enable rustls; pick one provider up front
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_telemetry(TelemetryConfig {
        format: cli.log_format,
        ..Default::default()
    })?;

    let clusters = cluster_clients(&cli).await?;
    let adapter = Arc::new(DemoAdapter::new(clusters.clone(), cli.employee_routing));
    let ctx = Arc::new(Context::from_client(adapter, clusters.clone())?);
    let controller = build_controller(ctx, &clusters);

    if cli.disable_webhook {
        info!("Webhook disabled, running controller only");
        controller.await;
        return Ok(());
    }

    let state = WebhookState::new()
        .with_adapter(Arc::new(DemoWebhookAdapter::new(clusters.hub().clone())));
    let router = webhook_router(Arc::new(state));
    let webhook = serve(router, cli.webhook_bind_address, cli.cert_dir.as_deref());

    tokio::select! {
        _ = controller => {
            info!("Controller stopped, shutting down");
        }
        served = webhook => {
            served.context("webhook server failed")?;
        }
    }
    Ok(())
}
