//! bosun manager binary.
//!
//! Wires the store, broker connector, scheduler loop, event subscribers
//! and the HTTP API together, then runs until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bosun_events::EventBus;
use bosun_manager::api::{self, ApiState};
use bosun_manager::broker::{BrokerConnector, FrameworkInfo, HttpTransport};
use bosun_manager::config::ManagerConfig;
use bosun_manager::ipam::IpamStore;
use bosun_manager::scheduler::{Scheduler, SchedulerConfig};
use bosun_manager::state::SchedCtx;
use bosun_manager::store::{AppStore, Kv, LocalLog, ReplicatedLog};
use bosun_manager::subscribers::{DnsSubscriber, ProxySubscriber};

#[derive(Debug, Parser)]
#[command(name = "bosun-manager", about = "bosun orchestrator manager")]
struct Args {
    /// API listen address (overrides BOSUN_LISTEN_ADDR).
    #[arg(long)]
    listen: Option<std::net::SocketAddr>,

    /// Resource broker endpoint (overrides BOSUN_BROKER_ENDPOINT).
    #[arg(long)]
    broker: Option<String>,

    /// Manager KV store path (overrides BOSUN_STORE_PATH).
    #[arg(long)]
    store_path: Option<String>,

    /// Skip state reload on startup.
    #[arg(long)]
    no_recover: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting bosun manager");

    let args = Args::parse();
    let mut config = ManagerConfig::from_env()?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(broker) = args.broker {
        config.scheduler.broker_endpoint = broker;
    }
    if let Some(store_path) = args.store_path {
        config.store_path = store_path;
    }
    config.no_recover |= args.no_recover;
    info!(
        listen_addr = %config.listen_addr,
        broker = %config.scheduler.broker_endpoint,
        cluster_id = %config.cluster_id,
        "Configuration loaded"
    );

    // Store: local KV behind the replicated log.
    let kv = Arc::new(Kv::open(&config.store_path).context("opening manager store")?);
    let log = Arc::new(LocalLog::spawn(Arc::clone(&kv)));
    let store = Arc::new(AppStore::new(
        Arc::clone(&log) as Arc<dyn ReplicatedLog>,
        kv,
    ));

    let ipam = Arc::new(IpamStore::open(&config.ipam.store_path).context("opening ipam store")?);

    // Event bus and downstream subscribers.
    let bus = EventBus::new();
    if config.dns.enable {
        let (_table, _task) = DnsSubscriber::spawn(&bus, config.dns.domain.clone());
    }
    if config.proxy.enable {
        let (_table, _task) = ProxySubscriber::spawn(&bus);
    }

    // Broker connector; re-register with the persisted framework id.
    let framework = FrameworkInfo {
        id: store.framework_id().context("reading framework id")?,
        name: config.scheduler.framework_name.clone(),
        user: config.scheduler.user.clone(),
        failover_timeout_secs: config.scheduler.failover_timeout_secs,
    };
    let transport = Arc::new(HttpTransport::new(&config.scheduler.broker_endpoint));
    let (connector, broker_handle, broker_channels) = BrokerConnector::new(transport, framework);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let connector_task = tokio::spawn(connector.run(shutdown_rx.clone()));

    // Scheduler loop.
    let ctx = SchedCtx {
        store,
        bus,
        broker: broker_handle,
        ipam,
        cluster_id: config.cluster_id.clone(),
        max_restarts: config.scheduler.max_restarts,
    };
    let (scheduler, handle, metrics) = Scheduler::new(
        ctx,
        broker_channels,
        SchedulerConfig {
            no_recover: config.no_recover,
            heartbeat_interval: Duration::from_secs(config.scheduler.heartbeat_interval_secs),
        },
    );
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    // HTTP API.
    let router = api::create_router(ApiState {
        scheduler: handle,
        metrics,
    });
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .context("binding api listener")?;
    info!(addr = %config.listen_addr, "API listening");

    tokio::select! {
        result = axum::serve(listener, router) => {
            if let Err(e) = result {
                error!(error = %e, "API server failed");
            }
        }
        result = scheduler_task => {
            match result {
                Ok(Ok(())) => info!("Scheduler loop exited"),
                Ok(Err(e)) => error!(error = %e, "Scheduler loop failed"),
                Err(e) => error!(error = %e, "Scheduler task panicked"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = connector_task.await;
    Ok(())
}
