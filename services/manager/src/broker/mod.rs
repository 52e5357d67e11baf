//! Resource broker connector.
//!
//! The broker is the external two-level resource manager: it advertises
//! offers, launches tasks on agents, and streams task status updates. The
//! wire protocol lives behind [`BrokerTransport`]; this module owns the
//! typed event/call vocabulary and the reconnect loop.

mod transport;

pub use transport::{BrokerTransport, HttpTransport};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bosun_id::{AgentId, FrameworkId, OfferId, TaskId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

// =============================================================================
// Errors
// =============================================================================

/// Errors from the broker transport.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("broker rejected call with status {0}")]
    Rejected(u16),

    #[error("event stream closed")]
    StreamClosed,
}

// =============================================================================
// Framework session
// =============================================================================

/// Identity under which the manager registers with the broker.
///
/// The framework id is assigned by the broker on first subscribe and
/// persisted so a restarted leader re-registers instead of registering
/// fresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<FrameworkId>,
    pub name: String,
    pub user: String,
    pub failover_timeout_secs: u64,
}

// =============================================================================
// Offers
// =============================================================================

/// A contiguous range of host ports offered by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub begin: u16,
    pub end: u16,
}

/// A resource advertisement from the broker. Ephemeral: consumed,
/// declined, or rescinded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub agent_id: AgentId,
    pub hostname: String,
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
    #[serde(default)]
    pub ports: Vec<PortRange>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl Offer {
    /// CIDR subnets routable from the offering agent, from the `subnets`
    /// attribute.
    pub fn subnets(&self) -> Vec<&str> {
        self.attributes
            .get("subnets")
            .map(|s| s.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }
}

// =============================================================================
// Task status
// =============================================================================

/// Broker-reported task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    TaskStaging,
    TaskStarting,
    TaskRunning,
    TaskFinished,
    TaskFailed,
    TaskKilled,
    TaskLost,
    TaskError,
}

/// One status update for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// =============================================================================
// Events
// =============================================================================

/// Typed events read from the broker's event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerEvent {
    Subscribed { framework_id: FrameworkId },
    Offers { offers: Vec<Offer> },
    Update { status: TaskStatus },
    Rescind { offer_id: OfferId },
    Heartbeat,
    Failure { message: String },
    Error { message: String },
}

/// Event discriminant, used as the handler-table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerEventKind {
    Subscribed,
    Offers,
    Update,
    Rescind,
    Heartbeat,
    Failure,
    Error,
}

impl BrokerEvent {
    pub fn kind(&self) -> BrokerEventKind {
        match self {
            BrokerEvent::Subscribed { .. } => BrokerEventKind::Subscribed,
            BrokerEvent::Offers { .. } => BrokerEventKind::Offers,
            BrokerEvent::Update { .. } => BrokerEventKind::Update,
            BrokerEvent::Rescind { .. } => BrokerEventKind::Rescind,
            BrokerEvent::Heartbeat => BrokerEventKind::Heartbeat,
            BrokerEvent::Failure { .. } => BrokerEventKind::Failure,
            BrokerEvent::Error { .. } => BrokerEventKind::Error,
        }
    }
}

impl std::fmt::Display for BrokerEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BrokerEventKind::Subscribed => "SUBSCRIBED",
            BrokerEventKind::Offers => "OFFERS",
            BrokerEventKind::Update => "UPDATE",
            BrokerEventKind::Rescind => "RESCIND",
            BrokerEventKind::Heartbeat => "HEARTBEAT",
            BrokerEventKind::Failure => "FAILURE",
            BrokerEventKind::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// Calls
// =============================================================================

/// A host port assignment for one container port, taken from the offer's
/// port ranges at launch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedPort {
    pub name: String,
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: String,
}

/// Everything the broker needs to launch one task on an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub image: String,
    pub network: String,
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<AssignedPort>,
}

/// Calls the manager issues to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerCall {
    Launch {
        offer_id: OfferId,
        agent_id: AgentId,
        tasks: Vec<TaskInfo>,
    },
    Decline {
        offer_ids: Vec<OfferId>,
    },
    Kill {
        task_id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<AgentId>,
    },
    Reconcile {
        task_ids: Vec<TaskId>,
    },
    Teardown,
}

// =============================================================================
// Backoff
// =============================================================================

/// Reconnect delay generator using decorrelated jitter.
///
/// Each failed attempt draws the next sleep uniformly from
/// `[floor, 3 * previous]`, clamped to the ceiling, so the retry window
/// still widens exponentially but consecutive managers reconnecting at
/// the same moment do not stampede the broker in lockstep. A healthy
/// session resets the window to the floor.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    floor: Duration,
    ceiling: Duration,
    prev: Duration,
    rng_state: u64,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl ReconnectBackoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self {
            floor,
            ceiling: ceiling.max(floor),
            prev: floor,
            // xorshift state must be nonzero.
            rng_state: seed | 1,
        }
    }

    /// Delay before the next reconnect attempt.
    pub fn next_delay(&mut self) -> Duration {
        let floor = self.floor.as_millis() as u64;
        let ceiling = self.ceiling.as_millis() as u64;
        let span = (self.prev.as_millis() as u64)
            .saturating_mul(3)
            .clamp(floor, ceiling);
        let ms = if span > floor {
            floor + self.next_u64() % (span - floor + 1)
        } else {
            floor
        };
        self.prev = Duration::from_millis(ms.min(ceiling));
        self.prev
    }

    /// Shrinks the window back to the floor after a healthy session.
    pub fn reset(&mut self) {
        self.prev = self.floor;
    }

    // Marsaglia xorshift64*; a clock-seeded generator is plenty for
    // spreading reconnects, no RNG crate needed.
    fn next_u64(&mut self) -> u64 {
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Clonable handle for issuing broker calls without blocking the
/// scheduler loop; calls are queued to the connector task.
#[derive(Clone)]
pub struct BrokerHandle {
    call_tx: mpsc::UnboundedSender<BrokerCall>,
}

impl BrokerHandle {
    pub fn launch(&self, offer_id: OfferId, agent_id: AgentId, tasks: Vec<TaskInfo>) {
        self.send(BrokerCall::Launch {
            offer_id,
            agent_id,
            tasks,
        });
    }

    pub fn kill(&self, task_id: TaskId, agent_id: Option<AgentId>) {
        self.send(BrokerCall::Kill { task_id, agent_id });
    }

    pub fn decline(&self, offer_ids: Vec<OfferId>) {
        if !offer_ids.is_empty() {
            self.send(BrokerCall::Decline { offer_ids });
        }
    }

    pub fn reconcile(&self, task_ids: Vec<TaskId>) {
        self.send(BrokerCall::Reconcile { task_ids });
    }

    fn send(&self, call: BrokerCall) {
        if self.call_tx.send(call).is_err() {
            warn!("Broker connector is gone, dropping call");
        }
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Channels the connector feeds: typed events for the scheduler's main
/// select, transport failures on their own channel.
pub struct BrokerChannels {
    pub events: mpsc::UnboundedReceiver<BrokerEvent>,
    pub failures: mpsc::UnboundedReceiver<String>,
}

/// Reconnecting client session against the resource broker.
///
/// On transport failure the connector emits on the failure channel, backs
/// off with jitter, and resubscribes, re-registering with the framework
/// id learned from the first `SUBSCRIBED` event.
pub struct BrokerConnector {
    transport: Arc<dyn BrokerTransport>,
    framework: FrameworkInfo,
    call_rx: mpsc::UnboundedReceiver<BrokerCall>,
    event_tx: mpsc::UnboundedSender<BrokerEvent>,
    failure_tx: mpsc::UnboundedSender<String>,
    backoff: ReconnectBackoff,
}

impl BrokerConnector {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        framework: FrameworkInfo,
    ) -> (Self, BrokerHandle, BrokerChannels) {
        let (call_tx, call_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        (
            Self {
                transport,
                framework,
                call_rx,
                event_tx,
                failure_tx,
                backoff: ReconnectBackoff::default(),
            },
            BrokerHandle { call_tx },
            BrokerChannels {
                events: event_rx,
                failures: failure_rx,
            },
        )
    }

    /// Runs the session until shutdown is signalled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        'session: loop {
            if *shutdown.borrow() {
                break;
            }

            let mut events = match self.transport.subscribe(&self.framework).await {
                Ok(events) => {
                    info!(
                        framework = %self.framework.name,
                        resubscribe = self.framework.id.is_some(),
                        "Broker session established"
                    );
                    self.backoff.reset();
                    events
                }
                Err(e) => {
                    let _ = self.failure_tx.send(e.to_string());
                    let delay = self.backoff.next_delay();
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "Broker subscribe failed");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break 'session;
                        }
                    }

                    call = self.call_rx.recv() => {
                        match call {
                            Some(call) => {
                                if let Err(e) = self.transport.call(&call).await {
                                    // A refused launch surfaces as TASK_LOST on
                                    // the next status update; nothing to retry
                                    // here.
                                    warn!(error = %e, "Broker call failed");
                                }
                            }
                            None => break 'session,
                        }
                    }

                    event = events.recv() => {
                        match event {
                            Some(event) => {
                                if let BrokerEvent::Subscribed { framework_id } = &event {
                                    self.framework.id = Some(framework_id.clone());
                                }
                                debug!(kind = %event.kind(), "Broker event");
                                if self.event_tx.send(event).is_err() {
                                    break 'session;
                                }
                            }
                            None => {
                                let _ = self.failure_tx.send("event stream closed".to_string());
                                let delay = self.backoff.next_delay();
                                warn!(delay_ms = delay.as_millis() as u64, "Broker stream closed, reconnecting");
                                tokio::time::sleep(delay).await;
                                continue 'session;
                            }
                        }
                    }
                }
            }
        }

        info!("Broker connector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_within_floor_and_ceiling() {
        let floor = Duration::from_millis(100);
        let ceiling = Duration::from_secs(5);
        let mut backoff = ReconnectBackoff::new(floor, ceiling);

        // First draw comes from [floor, 3 * floor].
        let first = backoff.next_delay();
        assert!(first >= floor && first <= 3 * floor);

        for _ in 0..32 {
            let delay = backoff.next_delay();
            assert!(delay >= floor && delay <= ceiling);
        }
    }

    #[test]
    fn backoff_reset_shrinks_the_window() {
        let floor = Duration::from_millis(100);
        let mut backoff = ReconnectBackoff::new(floor, Duration::from_secs(5));
        for _ in 0..16 {
            backoff.next_delay();
        }

        backoff.reset();
        let delay = backoff.next_delay();
        assert!(delay >= floor && delay <= 3 * floor);
    }

    #[test]
    fn offer_subnets_parse_attribute() {
        let mut attributes = HashMap::new();
        attributes.insert("subnets".to_string(), "10.0.1.0/24, 10.0.2.0/24".to_string());
        let offer = Offer {
            id: OfferId::parse("o1").unwrap(),
            agent_id: AgentId::parse("a1").unwrap(),
            hostname: "agent-1".to_string(),
            cpus: 4.0,
            mem: 4096.0,
            disk: 0.0,
            ports: vec![],
            attributes,
        };
        assert_eq!(offer.subnets(), vec!["10.0.1.0/24", "10.0.2.0/24"]);
    }

    #[test]
    fn broker_event_wire_shape() {
        let json = r#"{"type":"RESCIND","offer_id":"o1"}"#;
        let event: BrokerEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind(), BrokerEventKind::Rescind);

        let json = r#"{"type":"UPDATE","status":{"task_id":"0-web-ops-c1-01HV4Z2WQXKJNM8GPQY6VBKC3D","state":"TASK_RUNNING"}}"#;
        let event: BrokerEvent = serde_json::from_str(json).unwrap();
        match event {
            BrokerEvent::Update { status } => assert_eq!(status.state, TaskState::TaskRunning),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
