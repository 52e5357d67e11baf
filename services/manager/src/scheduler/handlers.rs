//! Event handler chains.
//!
//! Each broker event kind dispatches through an explicitly enumerated
//! chain of handlers; a handler may short-circuit the rest of its chain.
//! Business handlers mutate apps and slots through the scheduler core
//! and record which apps were touched so reevaluation runs afterwards.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tracing::{debug, info, warn};

use crate::broker::{BrokerEvent, BrokerEventKind, TaskState};
use crate::scheduler::SchedulerCore;
use crate::state::{AppError, SlotFollowUp, SlotState};

/// Whether the rest of the chain runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<Flow, AppError>> + Send + 'a>>;

/// One link in a handler chain.
pub type Handler = for<'a> fn(&'a mut SchedulerCore, &'a BrokerEvent) -> HandlerFuture<'a>;

/// Dispatch table: event kind → handler chain.
pub struct HandlerTable {
    chains: HashMap<BrokerEventKind, Vec<Handler>>,
}

impl HandlerTable {
    /// The standard chains. Every kind starts with the logger; business
    /// handlers follow.
    pub fn standard() -> Self {
        let mut chains: HashMap<BrokerEventKind, Vec<Handler>> = HashMap::new();
        chains.insert(BrokerEventKind::Subscribed, vec![logger, subscribed]);
        chains.insert(BrokerEventKind::Offers, vec![logger, offers]);
        chains.insert(BrokerEventKind::Update, vec![logger, update]);
        chains.insert(BrokerEventKind::Rescind, vec![logger, rescind]);
        chains.insert(BrokerEventKind::Heartbeat, vec![logger]);
        chains.insert(BrokerEventKind::Failure, vec![logger, failure]);
        chains.insert(BrokerEventKind::Error, vec![logger, broker_error]);
        Self { chains }
    }

    pub fn chain(&self, kind: BrokerEventKind) -> Vec<Handler> {
        self.chains.get(&kind).cloned().unwrap_or_default()
    }
}

// =============================================================================
// Handlers
// =============================================================================

fn logger<'a>(_core: &'a mut SchedulerCore, event: &'a BrokerEvent) -> HandlerFuture<'a> {
    Box::pin(async move {
        debug!(kind = %event.kind(), "Handling broker event");
        Ok(Flow::Continue)
    })
}

/// Persists the framework id assigned on (re)subscription.
fn subscribed<'a>(core: &'a mut SchedulerCore, event: &'a BrokerEvent) -> HandlerFuture<'a> {
    Box::pin(async move {
        let BrokerEvent::Subscribed { framework_id } = event else {
            return Ok(Flow::Continue);
        };
        let known = core.ctx.store.framework_id()?;
        if known.as_ref() != Some(framework_id) {
            core.ctx.store.put_framework_id(framework_id).await?;
            info!(framework_id = %framework_id, "Framework registered");
        } else {
            info!(framework_id = %framework_id, "Framework re-registered");
        }
        Ok(Flow::Continue)
    })
}

/// Matches each offer against the pending queue; launches what fits,
/// declines the rest.
fn offers<'a>(core: &'a mut SchedulerCore, event: &'a BrokerEvent) -> HandlerFuture<'a> {
    Box::pin(async move {
        let BrokerEvent::Offers { offers } = event else {
            return Ok(Flow::Continue);
        };
        let ctx = core.ctx.clone();

        for offer in offers {
            let matched = core.allocator.match_offer(offer);
            if matched.is_empty() {
                core.ctx.broker.decline(vec![offer.id.clone()]);
                continue;
            }

            let mut host_ports = offer
                .ports
                .iter()
                .flat_map(|range| range.begin..=range.end);
            let mut tasks = Vec::new();

            for slot_ref in &matched {
                let known = core
                    .apps
                    .get(&slot_ref.app_id)
                    .and_then(|app| app.slot(slot_ref.index))
                    .is_some();
                if !known {
                    // The slot vanished between enqueue and match; free
                    // its claim so the offer is not pinned forever.
                    core.allocator.confirm(&offer.id, slot_ref);
                    continue;
                }
                let Some(slot) = core
                    .apps
                    .get_mut(&slot_ref.app_id)
                    .and_then(|app| app.slot_mut(slot_ref.index))
                else {
                    continue;
                };

                let wanted = slot.version().container.port_mappings.len();
                let ports: Vec<u16> = host_ports.by_ref().take(wanted).collect();
                let task = slot.assign(offer, ports, &ctx).await?;
                tasks.push(task);
                core.touched.push(slot_ref.app_id.clone());
            }

            if tasks.is_empty() {
                core.ctx.broker.decline(vec![offer.id.clone()]);
            } else {
                core.ctx
                    .broker
                    .launch(offer.id.clone(), offer.agent_id.clone(), tasks);
            }
        }
        Ok(Flow::Continue)
    })
}

/// Routes a task status update to its slot and drives the slot state
/// machine.
fn update<'a>(core: &'a mut SchedulerCore, event: &'a BrokerEvent) -> HandlerFuture<'a> {
    Box::pin(async move {
        let BrokerEvent::Update { status } = event else {
            return Ok(Flow::Continue);
        };
        let slot_ref = match status.task_id.slot_ref() {
            Ok(slot_ref) => slot_ref,
            Err(e) => {
                warn!(task_id = %status.task_id, error = %e, "Status update with unroutable task id");
                return Ok(Flow::Stop);
            }
        };
        let ctx = core.ctx.clone();

        let Some(app) = core.apps.get_mut(&slot_ref.app_id) else {
            debug!(task_id = %status.task_id, "Status update for unknown app");
            return Ok(Flow::Stop);
        };
        let Some(slot) = app.slot_mut(slot_ref.index) else {
            debug!(task_id = %status.task_id, "Status update for removed slot");
            return Ok(Flow::Stop);
        };
        if slot.task_id() != &status.task_id {
            debug!(
                task_id = %status.task_id,
                current = %slot.task_id(),
                "Ignoring status for a superseded task"
            );
            return Ok(Flow::Stop);
        }

        // First broker signal for the task confirms the launch; the
        // offer reservation can go.
        if let Some(offer_id) = slot.offer_id().cloned() {
            core.allocator.confirm(&offer_id, &slot_ref);
        }

        let follow_up = match status.state {
            TaskState::TaskStaging | TaskState::TaskStarting => {
                slot.on_task_staging(&ctx).await?;
                SlotFollowUp::None
            }
            TaskState::TaskRunning => {
                slot.on_task_running(&ctx).await?;
                SlotFollowUp::None
            }
            TaskState::TaskKilled => slot.on_task_killed(&mut core.allocator, &ctx).await?,
            TaskState::TaskFailed | TaskState::TaskFinished | TaskState::TaskError => {
                slot.on_task_gone(SlotState::Failed, &mut core.allocator, &ctx)
                    .await?
            }
            TaskState::TaskLost => {
                slot.on_task_gone(SlotState::Lost, &mut core.allocator, &ctx)
                    .await?
            }
        };

        if follow_up == SlotFollowUp::Remove {
            app.remove_slot(slot_ref.index, &ctx).await?;
        }

        core.touched.push(slot_ref.app_id.clone());
        Ok(Flow::Continue)
    })
}

/// Reverts slots assigned against a rescinded offer back into the queue.
fn rescind<'a>(core: &'a mut SchedulerCore, event: &'a BrokerEvent) -> HandlerFuture<'a> {
    Box::pin(async move {
        let BrokerEvent::Rescind { offer_id } = event else {
            return Ok(Flow::Continue);
        };
        let ctx = core.ctx.clone();

        let reverted = core.allocator.rescind(offer_id);
        if reverted.is_empty() {
            return Ok(Flow::Continue);
        }
        info!(offer_id = %offer_id, slots = reverted.len(), "Offer rescinded");

        for slot_ref in reverted {
            let Some(app) = core.apps.get_mut(&slot_ref.app_id) else {
                continue;
            };
            let Some(slot) = app.slot_mut(slot_ref.index) else {
                continue;
            };
            slot.revert_to_pending(&mut core.allocator, &ctx).await?;
            core.touched.push(slot_ref.app_id);
        }
        Ok(Flow::Continue)
    })
}

fn failure<'a>(_core: &'a mut SchedulerCore, event: &'a BrokerEvent) -> HandlerFuture<'a> {
    Box::pin(async move {
        if let BrokerEvent::Failure { message } = event {
            warn!(message = %message, "Broker reported a failure");
        }
        Ok(Flow::Continue)
    })
}

fn broker_error<'a>(_core: &'a mut SchedulerCore, event: &'a BrokerEvent) -> HandlerFuture<'a> {
    Box::pin(async move {
        if let BrokerEvent::Error { message } = event {
            warn!(message = %message, "Broker rejected the session");
        }
        Ok(Flow::Continue)
    })
}
