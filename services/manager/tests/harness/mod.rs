//! Shared harness for scheduler integration tests.
//!
//! Stands up a real store (in-memory KV behind the local log), a real
//! scheduler loop, and a channel-backed broker transport so tests can
//! inject broker events and observe the calls the scheduler issues.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use bosun_events::EventBus;
use bosun_id::{AgentId, FrameworkId, OfferId, TaskId};
use bosun_manager::broker::{
    BrokerCall, BrokerConnector, BrokerError, BrokerEvent, BrokerTransport, FrameworkInfo, Offer,
    PortRange, TaskState, TaskStatus,
};
use bosun_manager::ipam::IpamStore;
use bosun_manager::scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
use bosun_manager::state::version::{ContainerSpec, PortMapping, Resources};
use bosun_manager::state::{AppMode, SchedCtx, Version, RESERVED_NETWORK};
use bosun_manager::store::{AppStore, Kv, LocalLog, ReplicatedLog};

// =============================================================================
// Channel transport
// =============================================================================

/// Broker transport backed by channels. Each subscribe opens a fresh
/// event stream and immediately delivers `SUBSCRIBED`.
pub struct ChannelTransport {
    event_tx: Arc<Mutex<Option<mpsc::UnboundedSender<BrokerEvent>>>>,
    calls_tx: mpsc::UnboundedSender<BrokerCall>,
}

#[async_trait]
impl BrokerTransport for ChannelTransport {
    async fn subscribe(
        &self,
        framework: &FrameworkInfo,
    ) -> Result<mpsc::UnboundedReceiver<BrokerEvent>, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let framework_id = framework
            .id
            .clone()
            .unwrap_or_else(|| FrameworkId::parse("fw-test").unwrap());
        let _ = tx.send(BrokerEvent::Subscribed { framework_id });
        *self.event_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn call(&self, call: &BrokerCall) -> Result<(), BrokerError> {
        self.calls_tx
            .send(call.clone())
            .map_err(|_| BrokerError::StreamClosed)
    }
}

// =============================================================================
// Cluster
// =============================================================================

pub struct ClusterOptions {
    pub heartbeat_interval: Duration,
    pub max_restarts: Option<u32>,
    pub no_recover: bool,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            max_restarts: None,
            no_recover: false,
        }
    }
}

/// One running manager: scheduler loop + store + fake broker.
pub struct TestCluster {
    pub handle: SchedulerHandle,
    pub bus: EventBus,
    pub store: Arc<AppStore>,
    pub kv: Arc<Kv>,
    pub ipam: Arc<IpamStore>,
    pub log: Arc<LocalLog>,
    event_tx: Arc<Mutex<Option<mpsc::UnboundedSender<BrokerEvent>>>>,
    calls_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<BrokerCall>>,
    shutdown_tx: watch::Sender<bool>,
}

impl TestCluster {
    pub async fn start() -> Self {
        let kv = Arc::new(Kv::open_in_memory().unwrap());
        let ipam = Arc::new(IpamStore::open_in_memory().unwrap());
        Self::start_on(kv, ipam, ClusterOptions::default()).await
    }

    pub async fn start_with(options: ClusterOptions) -> Self {
        let kv = Arc::new(Kv::open_in_memory().unwrap());
        let ipam = Arc::new(IpamStore::open_in_memory().unwrap());
        Self::start_on(kv, ipam, options).await
    }

    /// Starts a manager over an existing KV + IPAM store; this is how the
    /// failover tests hand state to a "new leader".
    pub async fn start_on(kv: Arc<Kv>, ipam: Arc<IpamStore>, options: ClusterOptions) -> Self {
        let log = Arc::new(LocalLog::spawn(Arc::clone(&kv)));
        let store = Arc::new(AppStore::new(
            Arc::clone(&log) as Arc<dyn ReplicatedLog>,
            Arc::clone(&kv),
        ));
        let bus = EventBus::new();

        let event_tx = Arc::new(Mutex::new(None));
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(ChannelTransport {
            event_tx: Arc::clone(&event_tx),
            calls_tx,
        });

        let framework = FrameworkInfo {
            id: store.framework_id().unwrap(),
            name: "bosun-test".to_string(),
            user: "root".to_string(),
            failover_timeout_secs: 60,
        };
        let (connector, broker_handle, broker_channels) =
            BrokerConnector::new(transport, framework);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(connector.run(shutdown_rx.clone()));

        let ctx = SchedCtx {
            store: Arc::clone(&store),
            bus: bus.clone(),
            broker: broker_handle,
            ipam: Arc::clone(&ipam),
            cluster_id: "c1".to_string(),
            max_restarts: options.max_restarts,
        };
        let (scheduler, handle, _metrics) = Scheduler::new(
            ctx,
            broker_channels,
            SchedulerConfig {
                no_recover: options.no_recover,
                heartbeat_interval: options.heartbeat_interval,
            },
        );
        tokio::spawn(scheduler.run(shutdown_rx));

        let cluster = Self {
            handle,
            bus,
            store,
            kv,
            ipam,
            log,
            event_tx,
            calls_rx: tokio::sync::Mutex::new(calls_rx),
            shutdown_tx,
        };
        // Let the connector subscribe before tests inject events.
        cluster
            .wait_until(|| cluster.event_tx.lock().unwrap().is_some(), "subscribe")
            .await;
        cluster
    }

    /// Simulates leader loss: the log refuses writes and the loop stops.
    pub fn kill_leader(&self) {
        self.log.set_leader(false);
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Injects a broker event into the scheduler's stream.
    pub fn inject(&self, event: BrokerEvent) {
        let guard = self.event_tx.lock().unwrap();
        let tx = guard.as_ref().expect("broker not subscribed");
        tx.send(event).expect("event stream closed");
    }

    pub fn inject_offer(&self, offer: Offer) {
        self.inject(BrokerEvent::Offers {
            offers: vec![offer],
        });
    }

    pub fn inject_status(&self, task_id: TaskId, state: TaskState) {
        self.inject(BrokerEvent::Update {
            status: TaskStatus {
                task_id,
                state,
                agent_id: Some(AgentId::parse("agent-1").unwrap()),
                message: None,
            },
        });
    }

    /// Next broker call, waiting up to two seconds.
    pub async fn next_call(&self) -> Option<BrokerCall> {
        let mut rx = self.calls_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Drains currently queued broker calls without waiting.
    pub async fn drain_calls(&self) -> Vec<BrokerCall> {
        let mut rx = self.calls_rx.lock().await;
        let mut calls = Vec::new();
        while let Ok(call) = rx.try_recv() {
            calls.push(call);
        }
        calls
    }

    /// Polls until `condition` holds; panics after five seconds.
    pub async fn wait_until<F: Fn() -> bool>(&self, condition: F, what: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if condition() {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Drives every assigned slot of an app to RUNNING by replaying the
    /// broker's happy path.
    pub async fn run_assigned_slots(&self, app_id: &bosun_id::AppId) {
        let view = self.handle.get_app(app_id).expect("app view");
        for slot in view.slots {
            if slot.state == bosun_manager::state::SlotState::Assigned {
                self.inject_status(slot.task_id.clone(), TaskState::TaskStaging);
                self.inject_status(slot.task_id, TaskState::TaskRunning);
            }
        }
    }
}

/// Creates an app and drives every slot to RUNNING through the fake
/// broker, returning its id once the app is `normal`.
pub async fn create_running_app(
    cluster: &TestCluster,
    name: &str,
    instances: u32,
) -> bosun_id::AppId {
    use bosun_manager::state::{AppRunState, SlotState};

    let view = cluster
        .handle
        .create_app(replicates_version(name, instances))
        .await
        .unwrap();
    let app_id = view.app_id;

    cluster.inject_offer(big_offer(&format!("offer-{name}-create")));
    cluster
        .wait_until(
            || {
                cluster
                    .handle
                    .get_app(&app_id)
                    .map(|v| v.slots.iter().all(|s| s.state == SlotState::Assigned))
                    .unwrap_or(false)
            },
            "slots assigned",
        )
        .await;
    cluster.run_assigned_slots(&app_id).await;
    cluster
        .wait_until(
            || {
                cluster
                    .handle
                    .get_app(&app_id)
                    .map(|v| v.state == AppRunState::Normal)
                    .unwrap_or(false)
            },
            "app normal",
        )
        .await;
    app_id
}

/// Confirms kills for every `killing` slot, feeds an offer for the
/// replacements, and drives them to RUNNING.
pub async fn drive_replacements(cluster: &TestCluster, app_id: &bosun_id::AppId, offer_id: &str) {
    use bosun_manager::state::SlotState;

    let view = cluster.handle.get_app(app_id).expect("app view");
    for slot in view.slots.iter().filter(|s| s.state == SlotState::Killing) {
        cluster.inject_status(slot.task_id.clone(), TaskState::TaskKilled);
    }

    cluster
        .wait_until(
            || {
                cluster
                    .handle
                    .get_app(app_id)
                    .map(|v| {
                        v.slots.iter().all(|s| s.state != SlotState::Killing)
                            && v.slots.iter().any(|s| s.state == SlotState::PendingOffer)
                    })
                    .unwrap_or(false)
            },
            "replacements pending",
        )
        .await;

    cluster.inject_offer(big_offer(offer_id));
    cluster
        .wait_until(
            || {
                cluster
                    .handle
                    .get_app(app_id)
                    .map(|v| v.slots.iter().all(|s| s.state != SlotState::PendingOffer))
                    .unwrap_or(false)
            },
            "replacements assigned",
        )
        .await;
    cluster.run_assigned_slots(app_id).await;
    cluster
        .wait_until(
            || {
                cluster
                    .handle
                    .get_app(app_id)
                    .map(|v| {
                        v.slots
                            .iter()
                            .all(|s| s.state == SlotState::Running)
                    })
                    .unwrap_or(false)
            },
            "replacements running",
        )
        .await;
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn replicates_version(name: &str, instances: u32) -> Version {
    Version {
        id: bosun_id::VersionId::from_millis(0),
        previous_id: None,
        name: name.to_string(),
        run_as: "ops".to_string(),
        mode: AppMode::Replicates,
        instances,
        container: ContainerSpec {
            image: "nginx:1.25".to_string(),
            network: "bridge".to_string(),
            port_mappings: vec![PortMapping {
                name: "web".to_string(),
                container_port: 80,
                protocol: "tcp".to_string(),
            }],
        },
        ip: Vec::new(),
        health_checks: Vec::new(),
        resources: Resources {
            cpus: 0.1,
            mem: 64.0,
            disk: 0.0,
        },
        constraints: Vec::new(),
    }
}

pub fn fixed_version(name: &str, instances: u32, ips: &[&str]) -> Version {
    let mut version = replicates_version(name, instances);
    version.mode = AppMode::Fixed;
    version.container.network = RESERVED_NETWORK.to_string();
    version.container.port_mappings.clear();
    version.ip = ips.iter().map(|s| s.to_string()).collect();
    version
}

pub fn big_offer(id: &str) -> Offer {
    offer_with(id, "agent-1", "agent-1.dc1", 16.0, 16384.0)
}

pub fn offer_with(id: &str, agent: &str, host: &str, cpus: f64, mem: f64) -> Offer {
    Offer {
        id: OfferId::parse(id).unwrap(),
        agent_id: AgentId::parse(agent).unwrap(),
        hostname: host.to_string(),
        cpus,
        mem,
        disk: 10_000.0,
        ports: vec![PortRange {
            begin: 31000,
            end: 31999,
        }],
        attributes: HashMap::new(),
    }
}
