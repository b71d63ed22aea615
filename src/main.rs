use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info};

use ddc::cluster::{ClusterBackend, KubeBackend};
use ddc::controller::Controller;
use ddc::engine::{EngineContext, EngineProfile, EngineSettings, NodeLabelLock};
use ddc::exec::KubeExec;
use ddc::helm::HelmCli;
use ddc::retry::RetryPolicy;
use ddc::settings::AppConfig;
use ddc::{metrics, port_allocator, trace};

#[derive(Parser, Debug)]
#[clap(version, about)]
/// Lifecycle controller for cache runtimes
struct Args {
    /// whether to be verbose
    #[arg(short = 'v')]
    verbose: bool,

    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// run a single pass and exit
    #[arg(long)]
    once: bool,

    /// use the legacy engine behavior (no tiered-store checks, no deprecated labels)
    #[arg(long)]
    legacy: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = AppConfig::load(args.config.as_deref())?;
    trace::init(cfg.controller.log_format);
    if args.verbose {
        info!(config = ?cfg, "loaded configuration");
    }

    let runtime_type = cfg.controller.runtime_type.clone();
    let client = kube::Client::try_default().await?;
    let cluster: Arc<dyn ClusterBackend> = Arc::new(KubeBackend::new(client.clone(), &runtime_type));

    let ports = port_allocator::global(
        cluster.as_ref(),
        cfg.port_range()?,
        &runtime_type,
    )
    .await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let metrics = match &cfg.controller.metrics_addr {
        Some(addr) => {
            let addr: SocketAddr = addr.parse()?;
            let m = metrics::init()?;
            m.set_ports_reserved(ports.reserved_count());
            let server_metrics = m.clone();
            let rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                if let Err(e) = metrics::run_metrics_server(addr, server_metrics, rx).await {
                    error!(error = %e, "metrics server failed");
                }
            });
            info!(addr = %addr, "serving metrics");
            Some(m)
        }
        None => None,
    };

    let ctx = EngineContext {
        cluster,
        releases: Arc::new(HelmCli::new("helm")),
        exec: Arc::new(KubeExec::new(client)),
        ports,
        node_lock: NodeLabelLock::new(),
        settings: EngineSettings::from_config(&cfg),
        retry: RetryPolicy::default(),
        metrics,
    };
    let profile = if args.legacy {
        EngineProfile::legacy()
    } else {
        EngineProfile::hardened()
    };
    let mut controller = Controller::new(ctx, profile, cfg.controller.namespace.clone());

    if args.once {
        let summary = controller.run_once().await?;
        info!(?summary, "single pass finished");
        let _ = shutdown_tx.send(());
        return Ok(());
    }

    let period = Duration::from_secs(cfg.controller.resync_period_secs.max(1));
    let loop_rx = shutdown_tx.subscribe();
    let driver = tokio::spawn(controller.run(period, loop_rx));
    info!(runtime_type = %runtime_type, period_secs = period.as_secs(), "controller started");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(());
    driver.await?;
    Ok(())
}
