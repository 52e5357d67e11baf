//! Per-task slot state machine.
//!
//! A slot is one replica of an app, identified by `(app id, index)`. It
//! owns the lifetime of its current task: every (re)dispatch mints a new
//! task id, and every transition is persisted before the next event is
//! processed.
//!
//! ```text
//! pending_offer -> assigned -> starting -> running -> killing -> killed
//!       |             |           |           |
//!       +---------> failed / lost <-----------+   (restart policy applies)
//! ```

use std::sync::Arc;

use bosun_id::{AgentId, AppId, OfferId, SlotRef, TaskId};
use bosun_events::{DomainEvent, SlotEndpoint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::broker::{AssignedPort, Offer, TaskInfo};
use crate::state::allocator::{OfferAllocator, PendingSlot};
use crate::state::version::Version;
use crate::state::{AppError, SchedCtx};
use crate::store::SlotMeta;

/// Slot lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Waiting in the allocator queue for a fitting offer.
    PendingOffer,
    /// Offer accepted, launch issued, no status update seen yet.
    Assigned,
    /// Broker reported the task staging or starting.
    Starting,
    /// Task is running.
    Running,
    /// Kill issued, waiting for the terminal status.
    Killing,
    /// Task killed on request.
    Killed,
    /// Task failed and the restart policy is exhausted.
    Failed,
    /// Task lost and the restart policy is exhausted.
    Lost,
}

impl SlotState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SlotState::Killed | SlotState::Failed | SlotState::Lost)
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SlotState::PendingOffer => "pending_offer",
            SlotState::Assigned => "assigned",
            SlotState::Starting => "starting",
            SlotState::Running => "running",
            SlotState::Killing => "killing",
            SlotState::Killed => "killed",
            SlotState::Failed => "failed",
            SlotState::Lost => "lost",
        };
        write!(f, "{s}")
    }
}

/// What the app must do with a slot after a terminal status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotFollowUp {
    /// Nothing; the slot was re-dispatched or parked.
    None,
    /// The slot was marked for deletion and must be removed from the app.
    Remove,
}

pub struct Slot {
    app_id: AppId,
    index: u32,
    version: Arc<Version>,
    task_id: TaskId,
    state: SlotState,

    // Offer identity is ephemeral and never persisted; agent identity
    // survives restarts so running tasks stay addressable.
    offer_id: Option<OfferId>,
    agent_id: Option<AgentId>,
    agent_host: Option<String>,
    host_ports: Vec<u16>,

    /// Version to dispatch once the current task reaches a terminal
    /// state; set by rolling update and cancel.
    pending_version: Option<Arc<Version>>,

    pub mark_for_rolling_update: bool,
    pub mark_for_deletion: bool,

    restarts: u32,
    updated: DateTime<Utc>,
}

impl Slot {
    pub fn new(app_id: AppId, index: u32, version: Arc<Version>) -> Self {
        let task_id = TaskId::generate(&SlotRef::new(app_id.clone(), index));
        Self {
            app_id,
            index,
            version,
            task_id,
            state: SlotState::PendingOffer,
            offer_id: None,
            agent_id: None,
            agent_host: None,
            host_ports: Vec::new(),
            pending_version: None,
            mark_for_rolling_update: false,
            mark_for_deletion: false,
            restarts: 0,
            updated: Utc::now(),
        }
    }

    /// Rebuilds a slot from its persisted meta on leader takeover. The
    /// offer binding is gone (offers are ephemeral); agent identity and
    /// ports survive.
    pub fn from_meta(meta: SlotMeta, version: Arc<Version>) -> Self {
        Self {
            app_id: meta.app_id,
            index: meta.index,
            version,
            task_id: meta.task_id,
            state: meta.state,
            offer_id: None,
            agent_id: meta.agent_id,
            agent_host: meta.agent_host,
            host_ports: meta.host_ports,
            pending_version: None,
            mark_for_rolling_update: meta.mark_for_rolling_update,
            mark_for_deletion: meta.mark_for_deletion,
            restarts: meta.restarts,
            updated: meta.updated,
        }
    }

    pub fn meta(&self) -> SlotMeta {
        SlotMeta {
            app_id: self.app_id.clone(),
            index: self.index,
            state: self.state,
            task_id: self.task_id.clone(),
            version_id: self.version.id,
            agent_id: self.agent_id.clone(),
            agent_host: self.agent_host.clone(),
            host_ports: self.host_ports.clone(),
            mark_for_rolling_update: self.mark_for_rolling_update,
            mark_for_deletion: self.mark_for_deletion,
            restarts: self.restarts,
            updated: self.updated,
        }
    }

    pub fn slot_ref(&self) -> SlotRef {
        SlotRef::new(self.app_id.clone(), self.index)
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn version(&self) -> &Arc<Version> {
        &self.version
    }

    pub fn offer_id(&self) -> Option<&OfferId> {
        self.offer_id.as_ref()
    }

    pub fn agent_host(&self) -> Option<&str> {
        self.agent_host.as_deref()
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn host_ports(&self) -> &[u16] {
        &self.host_ports
    }

    /// Static IP this slot is bound to, fixed mode only.
    pub fn ip(&self) -> Option<&str> {
        self.version.ip_for_index(self.index)
    }

    fn set_state(&mut self, state: SlotState) {
        info!(slot = %self.slot_ref(), from = %self.state, to = %state, "Slot transition");
        self.state = state;
        self.updated = Utc::now();
    }

    async fn persist(&self, ctx: &SchedCtx) -> Result<(), AppError> {
        ctx.store.put_slot(&self.meta()).await?;
        Ok(())
    }

    pub(crate) fn pending_entry(&self) -> PendingSlot {
        PendingSlot {
            slot_ref: self.slot_ref(),
            resources: self.version.resources,
            ip: self.ip().map(str::to_string),
            ports: self.version.container.port_mappings.len() as u32,
        }
    }

    /// Binds the slot to a version, mints a fresh task id and queues it
    /// for offers.
    pub async fn dispatch(
        &mut self,
        version: Arc<Version>,
        alloc: &mut OfferAllocator,
        ctx: &SchedCtx,
    ) -> Result<(), AppError> {
        self.version = version;
        self.task_id = TaskId::generate(&self.slot_ref());
        self.offer_id = None;
        self.agent_id = None;
        self.agent_host = None;
        self.host_ports.clear();
        self.pending_version = None;
        self.set_state(SlotState::PendingOffer);
        alloc.enqueue(self.pending_entry());
        self.persist(ctx).await
    }

    /// Accepts an offer: records the binding and returns the launch spec.
    pub async fn assign(
        &mut self,
        offer: &Offer,
        host_ports: Vec<u16>,
        ctx: &SchedCtx,
    ) -> Result<TaskInfo, AppError> {
        self.offer_id = Some(offer.id.clone());
        self.agent_id = Some(offer.agent_id.clone());
        self.agent_host = Some(offer.hostname.clone());
        self.host_ports = host_ports;
        self.set_state(SlotState::Assigned);
        self.persist(ctx).await?;

        let ports = self
            .version
            .container
            .port_mappings
            .iter()
            .zip(self.host_ports.iter())
            .map(|(mapping, host_port)| AssignedPort {
                name: mapping.name.clone(),
                container_port: mapping.container_port,
                host_port: *host_port,
                protocol: mapping.protocol.clone(),
            })
            .collect();

        Ok(TaskInfo {
            task_id: self.task_id.clone(),
            image: self.version.container.image.clone(),
            network: self.version.container.network.clone(),
            cpus: self.version.resources.cpus,
            mem: self.version.resources.mem,
            disk: self.version.resources.disk,
            ip: self.ip().map(str::to_string),
            ports,
        })
    }

    /// Reverts an assigned-but-unlaunched slot after its offer was
    /// rescinded; the slot re-enters the allocator queue.
    pub async fn revert_to_pending(
        &mut self,
        alloc: &mut OfferAllocator,
        ctx: &SchedCtx,
    ) -> Result<(), AppError> {
        if self.state != SlotState::Assigned {
            return Ok(());
        }
        self.offer_id = None;
        self.agent_id = None;
        self.agent_host = None;
        self.host_ports.clear();
        self.set_state(SlotState::PendingOffer);
        alloc.enqueue(self.pending_entry());
        self.persist(ctx).await
    }

    /// Kill intent. A slot that never launched goes straight to `killed`;
    /// a live one transitions to `killing` and waits for the broker.
    pub async fn kill(
        &mut self,
        alloc: &mut OfferAllocator,
        ctx: &SchedCtx,
    ) -> Result<(), AppError> {
        match self.state {
            SlotState::PendingOffer => {
                alloc.remove(&self.slot_ref());
                self.set_state(SlotState::Killed);
                self.persist(ctx).await?;
                ctx.bus.publish(DomainEvent::slot_killed(
                    self.app_id.clone(),
                    self.index,
                    self.task_id.clone(),
                ));
                Ok(())
            }
            SlotState::Assigned | SlotState::Starting | SlotState::Running => {
                self.set_state(SlotState::Killing);
                self.persist(ctx).await?;
                ctx.broker.kill(self.task_id.clone(), self.agent_id.clone());
                Ok(())
            }
            SlotState::Killing | SlotState::Killed | SlotState::Failed | SlotState::Lost => Ok(()),
        }
    }

    /// Replaces this slot's task with one running `target`, as one step of
    /// a rolling update (or its cancellation).
    pub async fn update_task(
        &mut self,
        target: Arc<Version>,
        alloc: &mut OfferAllocator,
        ctx: &SchedCtx,
    ) -> Result<(), AppError> {
        self.mark_for_rolling_update = true;
        match self.state {
            SlotState::PendingOffer => {
                alloc.remove(&self.slot_ref());
                self.dispatch(target, alloc, ctx).await
            }
            SlotState::Killed | SlotState::Failed | SlotState::Lost => {
                self.dispatch(target, alloc, ctx).await
            }
            SlotState::Assigned | SlotState::Starting | SlotState::Running => {
                self.pending_version = Some(target);
                self.kill(alloc, ctx).await
            }
            SlotState::Killing => {
                self.pending_version = Some(target);
                self.persist(ctx).await
            }
        }
    }

    /// Broker reported the task staging/starting on the agent.
    pub async fn on_task_staging(&mut self, ctx: &SchedCtx) -> Result<(), AppError> {
        if self.state == SlotState::Assigned {
            self.set_state(SlotState::Starting);
            self.persist(ctx).await?;
        }
        Ok(())
    }

    /// Broker reported the task running.
    pub async fn on_task_running(&mut self, ctx: &SchedCtx) -> Result<(), AppError> {
        if matches!(self.state, SlotState::Assigned | SlotState::Starting) {
            self.set_state(SlotState::Running);
            self.persist(ctx).await?;
            ctx.bus.publish(DomainEvent::slot_running(
                self.app_id.clone(),
                self.index,
                self.task_id.clone(),
                SlotEndpoint {
                    host: self.agent_host.clone().unwrap_or_default(),
                    ip: self.ip().map(str::to_string),
                    ports: self.host_ports.clone(),
                },
            ));
        }
        Ok(())
    }

    /// Broker confirmed the kill.
    pub async fn on_task_killed(
        &mut self,
        alloc: &mut OfferAllocator,
        ctx: &SchedCtx,
    ) -> Result<SlotFollowUp, AppError> {
        self.set_state(SlotState::Killed);
        self.persist(ctx).await?;
        ctx.bus.publish(DomainEvent::slot_killed(
            self.app_id.clone(),
            self.index,
            self.task_id.clone(),
        ));

        if self.mark_for_deletion {
            return Ok(SlotFollowUp::Remove);
        }
        if let Some(target) = self.pending_version.take() {
            self.dispatch(target, alloc, ctx).await?;
        }
        Ok(SlotFollowUp::None)
    }

    /// Task failed or was lost without a kill intent completing the
    /// normal way. Applies the restart policy, or honors a pending
    /// deletion/update the same way a confirmed kill would.
    pub async fn on_task_gone(
        &mut self,
        terminal: SlotState,
        alloc: &mut OfferAllocator,
        ctx: &SchedCtx,
    ) -> Result<SlotFollowUp, AppError> {
        debug_assert!(matches!(terminal, SlotState::Failed | SlotState::Lost));

        if self.mark_for_deletion {
            return self.on_task_killed(alloc, ctx).await;
        }
        if self.pending_version.is_some() {
            // The replacement dispatch happens regardless of how the old
            // task died.
            return self.on_task_killed(alloc, ctx).await;
        }

        let may_restart = ctx.max_restarts.map_or(true, |max| self.restarts < max);
        if may_restart {
            self.restarts += 1;
            let version = Arc::clone(&self.version);
            self.dispatch(version, alloc, ctx).await?;
        } else {
            self.set_state(terminal);
            self.persist(ctx).await?;
        }
        Ok(SlotFollowUp::None)
    }
}
