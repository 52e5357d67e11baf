//! The scheduler loop: one cooperative task owning all app and slot
//! state on the leader.
//!
//! The loop selects over the broker event stream, the broker failure
//! channel, the API command channel, a heartbeat tick (periodic task
//! reconciliation plus the janitor sweep) and the shutdown signal. All
//! state mutation happens here; the API thread only ever sees snapshot
//! views.

mod commands;
mod handlers;

pub use commands::{Command, SchedulerHandle};
pub use handlers::{Flow, Handler, HandlerTable};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bosun_id::AppId;
use bosun_events::DomainEvent;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::broker::BrokerChannels;
use crate::state::{App, AppError, AppView, OfferAllocator, SchedCtx, SlotState, Version};

/// Read-side snapshots shared with the API server. Writers (the loop)
/// hold the lock to swap snapshots in; readers clone out.
pub type SharedViews = Arc<RwLock<HashMap<AppId, AppView>>>;

/// Process counters surfaced on `/metrics`.
#[derive(Default)]
pub struct Metrics {
    pub events_handled: AtomicU64,
    pub commands_handled: AtomicU64,
    pub tasks_reconciled: AtomicU64,
    pub apps_reaped: AtomicU64,
}

/// Scheduler loop configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Skip state reload on startup.
    pub no_recover: bool,
    /// Heartbeat tick driving reconcile and the janitor sweep.
    pub heartbeat_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            no_recover: false,
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// One app operation carried by a command.
enum AppOp {
    Delete,
    ScaleUp { instances: u32, ips: Vec<String> },
    ScaleDown { instances: u32 },
    Update { version: Version },
    Proceed { instances: u32 },
    Cancel,
}

/// What a command's outcome means for the loop.
#[derive(Debug, Clone, Copy, Default)]
struct CommandDisposition {
    not_leader: bool,
    storage_failed: bool,
}

impl CommandDisposition {
    fn of_result<T>(result: &Result<T, AppError>) -> Self {
        match result {
            Err(e) if e.is_not_leader() => Self {
                not_leader: true,
                storage_failed: false,
            },
            Err(AppError::Store(_)) => Self {
                not_leader: false,
                storage_failed: true,
            },
            _ => Self::default(),
        }
    }
}

/// Mutable heart of the scheduler; owned by the loop task, handed to
/// handler chains.
pub struct SchedulerCore {
    pub(crate) apps: HashMap<AppId, App>,
    pub(crate) allocator: OfferAllocator,
    pub(crate) ctx: SchedCtx,
    pub(crate) views: SharedViews,
    pub(crate) handlers: HandlerTable,
    /// Apps touched by the current event; reevaluated after the chain.
    pub(crate) touched: Vec<AppId>,
    pub(crate) metrics: Arc<Metrics>,
}

impl SchedulerCore {
    /// Reloads all apps from the store on leader assumption and re-enters
    /// the allocator queue for slots still waiting on an offer. In-flight
    /// offers from the previous leader are gone (offers are ephemeral);
    /// running tasks are reconciled with the broker instead.
    pub fn recover(&mut self) -> Result<(), AppError> {
        let stored = self.ctx.store.list_apps()?;
        let count = stored.len();
        for record in stored {
            let app = App::from_stored(record)?;
            for slot in app.slots() {
                if slot.state() == SlotState::PendingOffer {
                    self.allocator.enqueue(slot.pending_entry());
                }
            }
            self.apps.insert(app.app_id().clone(), app);
        }
        info!(
            apps = count,
            pending_slots = self.allocator.pending_len(),
            "State recovered from store"
        );
        self.reconcile_tasks();
        self.refresh_views();
        Ok(())
    }

    /// Runs one broker event through its handler chain, then reevaluates
    /// every app the chain touched. A storage failure (other than lost
    /// leadership) rolls the touched apps back to their persisted state.
    pub async fn handle_event(&mut self, event: crate::broker::BrokerEvent) -> Result<(), AppError> {
        self.metrics.events_handled.fetch_add(1, Ordering::Relaxed);
        self.touched.clear();

        let result = self.dispatch_event(&event).await;
        if let Err(e) = &result {
            if matches!(e, AppError::Store(_)) && !e.is_not_leader() {
                self.rollback_touched();
            }
        }
        self.refresh_views();
        result
    }

    async fn dispatch_event(&mut self, event: &crate::broker::BrokerEvent) -> Result<(), AppError> {
        let chain = self.handlers.chain(event.kind());
        for handler in chain {
            match handler(self, event).await? {
                Flow::Continue => {}
                Flow::Stop => break,
            }
        }
        self.reevaluate_touched().await
    }

    /// Executes one API command, replying through its oneshot. Returns an
    /// error only when the loop itself must stop (lost leadership).
    pub async fn handle_command(&mut self, command: Command) -> Result<(), AppError> {
        self.metrics.commands_handled.fetch_add(1, Ordering::Relaxed);
        self.touched.clear();

        let disposition = self.execute_command(command).await;
        if disposition.not_leader {
            self.refresh_views();
            return Err(AppError::Store(crate::store::StoreError::NotLeader));
        }
        if disposition.storage_failed {
            // The command's store write failed mid-way: drop the partial
            // in-memory mutation and re-materialise from the store.
            self.rollback_touched();
            self.refresh_views();
            return Ok(());
        }

        let result = self.reevaluate_touched().await;
        if let Err(e) = &result {
            if matches!(e, AppError::Store(_)) && !e.is_not_leader() {
                self.rollback_touched();
            }
        }
        self.refresh_views();
        result
    }

    async fn execute_command(&mut self, command: Command) -> CommandDisposition {
        match command {
            Command::CreateApp { version, reply } => {
                let result = self.create_app(version).await;
                let disposition = CommandDisposition::of_result(&result);
                let _ = reply.send(result);
                disposition
            }
            Command::DeleteApp { app_id, reply } => {
                let result = self.with_app(&app_id, AppOp::Delete).await;
                let disposition = CommandDisposition::of_result(&result);
                let _ = reply.send(result);
                disposition
            }
            Command::ScaleUp {
                app_id,
                instances,
                ips,
                reply,
            } => {
                let result = self.with_app(&app_id, AppOp::ScaleUp { instances, ips }).await;
                let disposition = CommandDisposition::of_result(&result);
                let _ = reply.send(result);
                disposition
            }
            Command::ScaleDown {
                app_id,
                instances,
                reply,
            } => {
                let result = self.with_app(&app_id, AppOp::ScaleDown { instances }).await;
                let disposition = CommandDisposition::of_result(&result);
                let _ = reply.send(result);
                disposition
            }
            Command::UpdateApp {
                app_id,
                version,
                reply,
            } => {
                let result = self.with_app(&app_id, AppOp::Update { version }).await;
                let disposition = CommandDisposition::of_result(&result);
                let _ = reply.send(result);
                disposition
            }
            Command::ProceedUpdate {
                app_id,
                instances,
                reply,
            } => {
                let result = self.with_app(&app_id, AppOp::Proceed { instances }).await;
                let disposition = CommandDisposition::of_result(&result);
                let _ = reply.send(result);
                disposition
            }
            Command::CancelUpdate { app_id, reply } => {
                let result = self.with_app(&app_id, AppOp::Cancel).await;
                let disposition = CommandDisposition::of_result(&result);
                let _ = reply.send(result);
                disposition
            }
        }
    }

    async fn create_app(&mut self, version: Version) -> Result<AppView, AppError> {
        let app_id = AppId::from_parts(&version.name, &version.run_as, &self.ctx.cluster_id)?;
        if self.apps.contains_key(&app_id) {
            return Err(AppError::AlreadyExists(app_id));
        }
        let ctx = self.ctx.clone();
        self.touched.push(app_id.clone());
        let app = App::create(version, &mut self.allocator, &ctx).await?;
        let view = app.view();
        self.apps.insert(app_id, app);
        Ok(view)
    }

    /// Runs one app operation against the named app.
    async fn with_app(&mut self, app_id: &AppId, op: AppOp) -> Result<(), AppError> {
        let ctx = self.ctx.clone();
        let Some(app) = self.apps.get_mut(app_id) else {
            return Err(AppError::NotFound(app_id.clone()));
        };
        self.touched.push(app_id.clone());
        match op {
            AppOp::Delete => app.delete(&mut self.allocator, &ctx).await,
            AppOp::ScaleUp { instances, ips } => {
                app.scale_up(instances, ips, &mut self.allocator, &ctx).await
            }
            AppOp::ScaleDown { instances } => {
                app.scale_down(instances, &mut self.allocator, &ctx).await
            }
            AppOp::Update { version } => app.update(version, &mut self.allocator, &ctx).await,
            AppOp::Proceed { instances } => {
                app.proceed_rolling_update(instances, &mut self.allocator, &ctx)
                    .await
            }
            AppOp::Cancel => app.cancel_update(&mut self.allocator, &ctx).await,
        }
    }

    async fn reevaluate_touched(&mut self) -> Result<(), AppError> {
        let touched = self.touched_apps();
        let ctx = self.ctx.clone();
        for app_id in touched {
            if let Some(app) = self.apps.get_mut(&app_id) {
                app.reevaluate(&ctx).await?;
            }
        }
        Ok(())
    }

    /// Restores every touched app to its last persisted state, dropping
    /// the partial in-memory mutation of a failed write.
    fn rollback_touched(&mut self) {
        for app_id in self.touched_apps() {
            if let Err(e) = self.rollback_app(&app_id) {
                warn!(app_id = %app_id, error = %e, "State rollback failed");
            }
        }
    }

    fn rollback_app(&mut self, app_id: &AppId) -> Result<(), AppError> {
        warn!(app_id = %app_id, "Rolling app back to persisted state");
        self.allocator.remove_app(app_id);
        match self.ctx.store.load_app(app_id)? {
            Some(stored) => {
                let app = App::from_stored(stored)?;
                for slot in app.slots() {
                    if slot.state() == SlotState::PendingOffer {
                        self.allocator.enqueue(slot.pending_entry());
                    }
                }
                self.apps.insert(app_id.clone(), app);
            }
            None => {
                self.apps.remove(app_id);
            }
        }
        Ok(())
    }

    fn touched_apps(&mut self) -> Vec<AppId> {
        self.touched.sort();
        self.touched.dedup();
        self.touched.clone()
    }

    /// Removes apps that finished deleting (state `deleting`, no slots
    /// left) from the store and the in-memory model.
    pub async fn janitor_sweep(&mut self) -> Result<(), AppError> {
        let dead: Vec<AppId> = self
            .apps
            .values()
            .filter(|app| app.can_be_cleaned())
            .map(|app| app.app_id().clone())
            .collect();

        for app_id in &dead {
            self.ctx.store.remove_app(app_id).await?;
            self.ctx.ipam.release_app(app_id)?;
            self.apps.remove(app_id);
            self.metrics.apps_reaped.fetch_add(1, Ordering::Relaxed);
            info!(app_id = %app_id, "App reaped after deletion");
            self.ctx.bus.publish(DomainEvent::app_deleted(app_id.clone()));
        }

        if !dead.is_empty() {
            self.refresh_views();
        }
        Ok(())
    }

    /// Asks the broker for the latest status of every live task.
    pub fn reconcile_tasks(&self) {
        let task_ids: Vec<_> = self
            .apps
            .values()
            .flat_map(|app| app.slots())
            .filter(|slot| !slot.state().is_terminal() && slot.state() != SlotState::PendingOffer)
            .map(|slot| slot.task_id().clone())
            .collect();
        if !task_ids.is_empty() {
            self.metrics
                .tasks_reconciled
                .fetch_add(task_ids.len() as u64, Ordering::Relaxed);
            self.ctx.broker.reconcile(task_ids);
        }
    }

    /// Publishes fresh read-side snapshots.
    pub fn refresh_views(&self) {
        let mut views = self.views.write().unwrap_or_else(|e| e.into_inner());
        views.clear();
        for (app_id, app) in &self.apps {
            views.insert(app_id.clone(), app.view());
        }
    }

    /// Declines any offers still carrying reservations; called when the
    /// leader steps down so nothing stays pinned at the broker.
    pub fn step_down(&mut self) {
        let offers = self.allocator.reserved_offers();
        if !offers.is_empty() {
            info!(offers = offers.len(), "Declining reserved offers on step-down");
            self.ctx.broker.decline(offers);
        }
    }
}

/// The scheduler loop plus its input channels.
pub struct Scheduler {
    core: SchedulerCore,
    events: mpsc::UnboundedReceiver<crate::broker::BrokerEvent>,
    failures: mpsc::UnboundedReceiver<String>,
    commands: mpsc::UnboundedReceiver<Command>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        ctx: SchedCtx,
        broker_channels: BrokerChannels,
        config: SchedulerConfig,
    ) -> (Self, SchedulerHandle, Arc<Metrics>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let views: SharedViews = Arc::new(RwLock::new(HashMap::new()));
        let metrics = Arc::new(Metrics::default());

        let core = SchedulerCore {
            apps: HashMap::new(),
            allocator: OfferAllocator::new(),
            ctx,
            views: Arc::clone(&views),
            handlers: HandlerTable::standard(),
            touched: Vec::new(),
            metrics: Arc::clone(&metrics),
        };

        let handle = SchedulerHandle {
            cmd_tx,
            views,
        };

        (
            Self {
                core,
                events: broker_channels.events,
                failures: broker_channels.failures,
                commands: cmd_rx,
                config,
            },
            handle,
            metrics,
        )
    }

    /// Runs until shutdown or lost leadership.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), AppError> {
        if !self.config.no_recover {
            self.core.recover()?;
        } else {
            info!("Skipping state recovery (no_recover)");
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup is quiet.
        heartbeat.tick().await;

        info!("Scheduler loop running");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler loop shutting down");
                        self.core.step_down();
                        return Ok(());
                    }
                }

                event = self.events.recv() => {
                    let Some(event) = event else {
                        warn!("Broker event channel closed, stopping scheduler");
                        self.core.step_down();
                        return Ok(());
                    };
                    if let Err(e) = self.core.handle_event(event).await {
                        if e.is_not_leader() {
                            error!("Lost leadership, stopping scheduler");
                            self.core.step_down();
                            return Err(e);
                        }
                        warn!(error = %e, "Event handling failed");
                    }
                }

                failure = self.failures.recv() => {
                    match failure {
                        Some(message) => warn!(message = %message, "Broker transport failure"),
                        None => {
                            warn!("Broker failure channel closed, stopping scheduler");
                            self.core.step_down();
                            return Ok(());
                        }
                    }
                }

                command = self.commands.recv() => {
                    let Some(command) = command else {
                        info!("Command channel closed, stopping scheduler");
                        self.core.step_down();
                        return Ok(());
                    };
                    if let Err(e) = self.core.handle_command(command).await {
                        if e.is_not_leader() {
                            error!("Lost leadership, stopping scheduler");
                            self.core.step_down();
                            return Err(e);
                        }
                        warn!(error = %e, "Command handling failed");
                    }
                }

                _ = heartbeat.tick() => {
                    self.core.reconcile_tasks();
                    if let Err(e) = self.core.janitor_sweep().await {
                        if e.is_not_leader() {
                            error!("Lost leadership, stopping scheduler");
                            self.core.step_down();
                            return Err(e);
                        }
                        warn!(error = %e, "Janitor sweep failed");
                    }
                }
            }
        }
    }
}
