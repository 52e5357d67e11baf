//! Per-application state machine over a collection of slots.
//!
//! An app owns its slots exclusively. Operations mutate the app inside a
//! write transaction (a write-coalescing facade: deferred meta writes,
//! one commit at the end, and the commit always persists); reevaluation
//! recomputes the lifecycle state from the slots after every handled
//! event.

use std::collections::BTreeMap;
use std::sync::Arc;

use bosun_id::{AppId, VersionId};
use bosun_events::DomainEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::state::allocator::OfferAllocator;
use crate::state::slot::{Slot, SlotState};
use crate::state::version::{validate_version, AppMode, ValidationError, Version};
use crate::state::{AppError, SchedCtx};
use crate::store::{AppMeta, StoredApp};

/// App lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppRunState {
    Normal,
    Creating,
    Deleting,
    Updating,
    CancelUpdate,
    ScaleUp,
    ScaleDown,
}

impl std::fmt::Display for AppRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AppRunState::Normal => "normal",
            AppRunState::Creating => "creating",
            AppRunState::Deleting => "deleting",
            AppRunState::Updating => "updating",
            AppRunState::CancelUpdate => "cancel_update",
            AppRunState::ScaleUp => "scale_up",
            AppRunState::ScaleDown => "scale_down",
        };
        write!(f, "{s}")
    }
}

pub struct App {
    app_id: AppId,
    mode: AppMode,
    cluster_id: String,
    state: AppRunState,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,

    current_version: Arc<Version>,
    /// Non-nil only while a rolling update is in flight.
    proposed_version: Option<Arc<Version>>,
    /// Append-only history, oldest first; includes the current version.
    versions: Vec<Arc<Version>>,

    slots: BTreeMap<u32, Slot>,

    in_transaction: bool,
    touched: bool,
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

impl App {
    /// Creates the app: validates the version, persists it, and dispatches
    /// one slot per requested instance.
    pub async fn create(
        mut version: Version,
        alloc: &mut OfferAllocator,
        ctx: &SchedCtx,
    ) -> Result<App, AppError> {
        validate_version(&version)?;

        let app_id = AppId::from_parts(&version.name, &version.run_as, &ctx.cluster_id)?;
        version.id = VersionId::after(None, now_ms());
        version.previous_id = None;

        let current = Arc::new(version);
        let mut app = App {
            app_id: app_id.clone(),
            mode: current.mode,
            cluster_id: ctx.cluster_id.clone(),
            state: AppRunState::Creating,
            created: Utc::now(),
            updated: Utc::now(),
            current_version: Arc::clone(&current),
            proposed_version: None,
            versions: vec![Arc::clone(&current)],
            slots: BTreeMap::new(),
            in_transaction: false,
            touched: false,
        };

        ctx.store.create_app(&app.meta(), &current).await?;
        info!(app_id = %app_id, instances = current.instances, mode = %app.mode, "App created");
        ctx.bus.publish(DomainEvent::app_created(app_id));

        app.begin_tx();
        for index in 0..current.instances {
            app.new_slot(index, Arc::clone(&current), alloc, ctx).await?;
        }
        app.commit(ctx).await?;

        Ok(app)
    }

    /// Grows the app by `delta` instances. Fixed mode requires exactly
    /// `delta` fresh IPs.
    pub async fn scale_up(
        &mut self,
        delta: u32,
        new_ips: Vec<String>,
        alloc: &mut OfferAllocator,
        ctx: &SchedCtx,
    ) -> Result<(), AppError> {
        self.require_state(AppRunState::Normal, "scale up")?;
        if delta == 0 {
            return Err(AppError::InvalidState(
                "scale up requires a positive instance delta".to_string(),
            ));
        }
        if self.mode == AppMode::Fixed && new_ips.len() != delta as usize {
            return Err(AppError::Validation(ValidationError::IpCountMismatch {
                instances: delta,
                got: new_ips.len(),
            }));
        }

        self.begin_tx();

        let old_instances = self.current_version.instances;
        let mut version = (*self.current_version).clone();
        version.ip.extend(new_ips);
        version.instances += delta;
        self.current_version = Arc::new(version);
        self.replace_version(Arc::clone(&self.current_version));
        ctx.store
            .put_version(&self.app_id, &self.current_version)
            .await?;

        self.set_state(AppRunState::ScaleUp);
        for index in old_instances..old_instances + delta {
            self.new_slot(index, Arc::clone(&self.current_version), alloc, ctx)
                .await?;
        }

        self.commit(ctx).await
    }

    /// Shrinks the app by `delta` instances, killing the highest-indexed
    /// slots first. Slots leave the app only once the broker confirms the
    /// kill.
    pub async fn scale_down(
        &mut self,
        delta: u32,
        alloc: &mut OfferAllocator,
        ctx: &SchedCtx,
    ) -> Result<(), AppError> {
        self.require_state(AppRunState::Normal, "scale down")?;
        let old_instances = self.current_version.instances;
        if delta == 0 || delta >= old_instances {
            return Err(AppError::InvalidState(format!(
                "scale down delta must be within 1..{old_instances}"
            )));
        }

        self.begin_tx();

        let new_instances = old_instances - delta;
        let mut version = (*self.current_version).clone();
        version.instances = new_instances;
        version.ip.truncate(new_instances as usize);
        self.current_version = Arc::new(version);
        self.replace_version(Arc::clone(&self.current_version));
        ctx.store
            .put_version(&self.app_id, &self.current_version)
            .await?;

        self.set_state(AppRunState::ScaleDown);
        for index in (new_instances..old_instances).rev() {
            self.kill_slot_for_removal(index, alloc, ctx).await?;
        }

        self.commit(ctx).await
    }

    /// Begins a rolling update to `version` by replacing slot 0 only;
    /// [`App::proceed_rolling_update`] advances it.
    pub async fn update(
        &mut self,
        mut version: Version,
        alloc: &mut OfferAllocator,
        ctx: &SchedCtx,
    ) -> Result<(), AppError> {
        if self.state != AppRunState::Normal || self.proposed_version.is_some() {
            return Err(AppError::InvalidState(format!(
                "app {} cannot update while {}",
                self.app_id, self.state
            )));
        }
        validate_version(&version)?;
        self.check_proposed_version(&version)?;

        self.begin_tx();

        version.id = VersionId::after(Some(self.current_version.id), now_ms());
        version.previous_id = Some(self.current_version.id);
        let proposed = Arc::new(version);
        self.proposed_version = Some(Arc::clone(&proposed));
        self.set_state(AppRunState::Updating);

        if let Some(slot) = self.slots.get_mut(&0) {
            slot.update_task(proposed, alloc, ctx).await?;
        }

        self.commit(ctx).await?;
        ctx.bus.publish(DomainEvent::app_updated(self.app_id.clone()));
        Ok(())
    }

    /// Advances the rolling update by `count` more slots.
    pub async fn proceed_rolling_update(
        &mut self,
        count: u32,
        alloc: &mut OfferAllocator,
        ctx: &SchedCtx,
    ) -> Result<(), AppError> {
        let Some(proposed) = self.proposed_version.clone() else {
            return Err(AppError::InvalidState(format!(
                "app {} has no rolling update in flight",
                self.app_id
            )));
        };
        self.require_state(AppRunState::Updating, "proceed rolling update")?;
        if count == 0 {
            return Err(AppError::InvalidState(
                "proceed requires a positive instance count".to_string(),
            ));
        }

        // Snapshot before dispatching: update_task flips the counted flag.
        let already = self.rolling_update_instances();
        if already + count > self.current_version.instances {
            return Err(AppError::InvalidState(format!(
                "cannot update {count} more slots, {already} of {} already updated",
                self.current_version.instances
            )));
        }

        self.begin_tx();
        for index in already..already + count {
            if let Some(slot) = self.slots.get_mut(&index) {
                slot.update_task(Arc::clone(&proposed), alloc, ctx).await?;
            }
        }
        self.commit(ctx).await
    }

    /// Rolls already-updated slots back to the current version, highest
    /// index first; the proposed version is discarded once slot 0 is back.
    pub async fn cancel_update(
        &mut self,
        alloc: &mut OfferAllocator,
        ctx: &SchedCtx,
    ) -> Result<(), AppError> {
        if self.state != AppRunState::Updating || self.proposed_version.is_none() {
            return Err(AppError::InvalidState(format!(
                "app {} has no rolling update to cancel",
                self.app_id
            )));
        }

        self.begin_tx();
        self.set_state(AppRunState::CancelUpdate);

        let updated = self.rolling_update_instances();
        let current = Arc::clone(&self.current_version);
        for index in (0..updated).rev() {
            if let Some(slot) = self.slots.get_mut(&index) {
                slot.update_task(Arc::clone(&current), alloc, ctx).await?;
            }
        }

        self.commit(ctx).await
    }

    /// Kills every slot; the app itself is reaped by the janitor sweep
    /// once no slots remain.
    pub async fn delete(
        &mut self,
        alloc: &mut OfferAllocator,
        ctx: &SchedCtx,
    ) -> Result<(), AppError> {
        self.begin_tx();
        self.set_state(AppRunState::Deleting);

        let indices: Vec<u32> = self.slots.keys().rev().copied().collect();
        for index in indices {
            self.kill_slot_for_removal(index, alloc, ctx).await?;
        }

        self.commit(ctx).await
    }

    /// Marks a slot for deletion and kills it. A slot that never launched
    /// dies synchronously and is removed here; a live one is removed when
    /// its TASK_KILLED arrives.
    async fn kill_slot_for_removal(
        &mut self,
        index: u32,
        alloc: &mut OfferAllocator,
        ctx: &SchedCtx,
    ) -> Result<(), AppError> {
        let Some(slot) = self.slots.get_mut(&index) else {
            return Ok(());
        };
        slot.mark_for_deletion = true;
        slot.kill(alloc, ctx).await?;
        if slot.state() == SlotState::Killed {
            self.remove_slot(index, ctx).await?;
        }
        Ok(())
    }

    /// Removes a slot from the app and the store, releasing its static IP.
    pub async fn remove_slot(&mut self, index: u32, ctx: &SchedCtx) -> Result<(), AppError> {
        let Some(slot) = self.slots.get(&index) else {
            return Ok(());
        };
        ctx.store.remove_slot(&self.app_id, index).await?;
        if let Some(ip) = slot.ip() {
            ctx.ipam.release(ip)?;
        }
        self.slots.remove(&index);
        self.touch();
        Ok(())
    }

    async fn new_slot(
        &mut self,
        index: u32,
        version: Arc<Version>,
        alloc: &mut OfferAllocator,
        ctx: &SchedCtx,
    ) -> Result<(), AppError> {
        if let Some(ip) = version.ip_for_index(index) {
            ctx.ipam.reserve(&self.app_id, ip)?;
        }
        let mut slot = Slot::new(self.app_id.clone(), index, Arc::clone(&version));
        slot.dispatch(version, alloc, ctx).await?;
        self.slots.insert(index, slot);
        self.touch();
        Ok(())
    }

    /// Recomputes the lifecycle state from the slots. Idempotent; runs
    /// after every handled event that touched this app.
    pub async fn reevaluate(&mut self, ctx: &SchedCtx) -> Result<(), AppError> {
        let instances = self.current_version.instances;
        match self.state {
            AppRunState::Updating => {
                let proposed = self
                    .proposed_version
                    .clone()
                    .unwrap_or_else(|| panic!("app {} updating without proposed version", self.app_id));
                let all_on_proposed = self
                    .slots
                    .values()
                    .all(|s| s.version().id == proposed.id);
                if all_on_proposed && self.running_instances() == instances {
                    self.set_state(AppRunState::Normal);
                    self.current_version = Arc::clone(&proposed);
                    self.versions.push(Arc::clone(&proposed));
                    self.proposed_version = None;
                    for slot in self.slots.values_mut() {
                        slot.mark_for_rolling_update = false;
                    }
                    ctx.store
                        .commit_proposed_version(&self.app_id, &proposed)
                        .await?;
                    self.touch_now(ctx).await?;
                    info!(app_id = %self.app_id, version = %proposed.id, "Rolling update complete");
                    ctx.bus.publish(DomainEvent::app_updated(self.app_id.clone()));
                }
            }

            AppRunState::CancelUpdate => {
                let slot0_on_current = self
                    .slots
                    .get(&0)
                    .map(|s| s.version().id == self.current_version.id)
                    .unwrap_or(false);
                if slot0_on_current && self.running_instances() == instances {
                    self.set_state(AppRunState::Normal);
                    self.proposed_version = None;
                    for slot in self.slots.values_mut() {
                        slot.mark_for_rolling_update = false;
                    }
                    self.touch_now(ctx).await?;
                    info!(app_id = %self.app_id, "Rolling update cancelled");
                }
            }

            AppRunState::Creating | AppRunState::ScaleUp => {
                if self.running_instances() == instances {
                    self.set_state(AppRunState::Normal);
                    self.touch_now(ctx).await?;
                }
            }

            AppRunState::ScaleDown => {
                if self.slots.len() == instances as usize
                    && self.mark_for_deletion_instances() == 0
                {
                    self.set_state(AppRunState::Normal);
                    self.touch_now(ctx).await?;
                }
            }

            // Normal needs nothing; Deleting resolves via the janitor
            // sweep once the slot map is empty.
            AppRunState::Normal | AppRunState::Deleting => {}
        }
        Ok(())
    }

    /// Rejects proposed versions that change immutable properties.
    fn check_proposed_version(&self, version: &Version) -> Result<(), AppError> {
        if version.mode != self.mode {
            return Err(AppError::InvalidState(format!(
                "mode is immutable, app {} is {}",
                self.app_id, self.mode
            )));
        }
        if version.run_as != self.current_version.run_as {
            return Err(AppError::InvalidState(
                "runAs is immutable across updates".to_string(),
            ));
        }
        if version.instances != self.current_version.instances {
            return Err(AppError::InvalidState(format!(
                "instances is immutable across updates, expected {}",
                self.current_version.instances
            )));
        }
        Ok(())
    }

    fn require_state(&self, wanted: AppRunState, op: &str) -> Result<(), AppError> {
        if self.state != wanted {
            return Err(AppError::InvalidState(format!(
                "app {} cannot {op} while {}",
                self.app_id, self.state
            )));
        }
        Ok(())
    }

    fn replace_version(&mut self, version: Arc<Version>) {
        if let Some(existing) = self.versions.iter_mut().find(|v| v.id == version.id) {
            *existing = version;
        } else {
            self.versions.push(version);
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    pub fn state(&self) -> AppRunState {
        self.state
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    pub fn current_version(&self) -> &Arc<Version> {
        &self.current_version
    }

    pub fn proposed_version(&self) -> Option<&Arc<Version>> {
        self.proposed_version.as_ref()
    }

    pub fn versions(&self) -> &[Arc<Version>] {
        &self.versions
    }

    pub fn slot(&self, index: u32) -> Option<&Slot> {
        self.slots.get(&index)
    }

    pub fn slot_mut(&mut self, index: u32) -> Option<&mut Slot> {
        self.slots.get_mut(&index)
    }

    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.values()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn running_instances(&self) -> u32 {
        self.slots
            .values()
            .filter(|s| s.state() == SlotState::Running)
            .count() as u32
    }

    pub fn rolling_update_instances(&self) -> u32 {
        self.slots
            .values()
            .filter(|s| s.mark_for_rolling_update)
            .count() as u32
    }

    pub fn mark_for_deletion_instances(&self) -> u32 {
        self.slots
            .values()
            .filter(|s| s.mark_for_deletion)
            .count() as u32
    }

    /// Ready for the janitor: deleting and drained of slots.
    pub fn can_be_cleaned(&self) -> bool {
        self.state == AppRunState::Deleting && self.slots.is_empty()
    }

    // =========================================================================
    // Persistence plumbing
    // =========================================================================

    fn set_state(&mut self, state: AppRunState) {
        info!(app_id = %self.app_id, from = %self.state, to = %state, "App transition");
        self.state = state;
        self.updated = Utc::now();
        self.touch();
    }

    /// Marks the app dirty; the write happens at commit (or at the next
    /// `touch_now` outside a transaction).
    fn touch(&mut self) {
        self.touched = true;
    }

    async fn touch_now(&mut self, ctx: &SchedCtx) -> Result<(), AppError> {
        if self.in_transaction {
            self.touched = true;
            debug!(app_id = %self.app_id, "Deferring app write to commit");
            return Ok(());
        }
        ctx.store.update_app(&self.meta()).await?;
        self.touched = false;
        Ok(())
    }

    pub fn begin_tx(&mut self) {
        self.in_transaction = true;
    }

    /// Ends the transaction and persists the app meta unconditionally,
    /// touched or not.
    pub async fn commit(&mut self, ctx: &SchedCtx) -> Result<(), AppError> {
        self.in_transaction = false;
        self.touched = false;
        ctx.store.update_app(&self.meta()).await?;
        Ok(())
    }

    pub fn meta(&self) -> AppMeta {
        AppMeta {
            app_id: self.app_id.clone(),
            state: self.state,
            mode: self.mode,
            cluster_id: self.cluster_id.clone(),
            created: self.created,
            updated: self.updated,
            current_version_id: self.current_version.id,
            proposed_version: self.proposed_version.as_deref().cloned(),
        }
    }

    /// Rebuilds an app from its persisted form on leader takeover.
    pub fn from_stored(stored: StoredApp) -> Result<App, AppError> {
        let StoredApp {
            meta,
            mut versions,
            slots,
        } = stored;

        versions.sort_by_key(|v| v.id);
        let versions: Vec<Arc<Version>> = versions.into_iter().map(Arc::new).collect();
        let current = versions
            .iter()
            .find(|v| v.id == meta.current_version_id)
            .cloned()
            .ok_or_else(|| {
                crate::store::StoreError::Conflict(format!(
                    "app {} misses current version {}",
                    meta.app_id, meta.current_version_id
                ))
            })?;
        let proposed = meta.proposed_version.map(Arc::new);

        let mut slot_map = BTreeMap::new();
        for slot_meta in slots {
            let version = versions
                .iter()
                .find(|v| v.id == slot_meta.version_id)
                .cloned()
                .or_else(|| {
                    proposed
                        .as_ref()
                        .filter(|p| p.id == slot_meta.version_id)
                        .cloned()
                })
                .unwrap_or_else(|| Arc::clone(&current));
            slot_map.insert(slot_meta.index, Slot::from_meta(slot_meta, version));
        }

        Ok(App {
            app_id: meta.app_id,
            mode: meta.mode,
            cluster_id: meta.cluster_id,
            state: meta.state,
            created: meta.created,
            updated: meta.updated,
            current_version: current,
            proposed_version: proposed,
            versions,
            slots: slot_map,
            in_transaction: false,
            touched: false,
        })
    }

    /// Read-only snapshot for the API thread.
    pub fn view(&self) -> AppView {
        AppView {
            app_id: self.app_id.clone(),
            name: self.current_version.name.clone(),
            run_as: self.current_version.run_as.clone(),
            mode: self.mode,
            state: self.state,
            cluster_id: self.cluster_id.clone(),
            created: self.created,
            updated: self.updated,
            instances: self.current_version.instances,
            running_instances: self.running_instances(),
            current_version_id: self.current_version.id,
            proposed_version_id: self.proposed_version.as_ref().map(|v| v.id),
            version_ids: self.versions.iter().map(|v| v.id).collect(),
            slots: self
                .slots
                .values()
                .map(|slot| SlotView {
                    index: slot.index(),
                    state: slot.state(),
                    task_id: slot.task_id().clone(),
                    version_id: slot.version().id,
                    agent_host: slot.agent_host().map(str::to_string),
                    ip: slot.ip().map(str::to_string),
                    host_ports: slot.host_ports().to_vec(),
                    restarts: slot.restarts(),
                    mark_for_rolling_update: slot.mark_for_rolling_update,
                    mark_for_deletion: slot.mark_for_deletion,
                })
                .collect(),
        }
    }
}

/// Read-only app snapshot shared with the API server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppView {
    pub app_id: AppId,
    pub name: String,
    pub run_as: String,
    pub mode: AppMode,
    pub state: AppRunState,
    pub cluster_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub instances: u32,
    pub running_instances: u32,
    pub current_version_id: VersionId,
    pub proposed_version_id: Option<VersionId>,
    pub version_ids: Vec<VersionId>,
    pub slots: Vec<SlotView>,
}

/// Read-only slot snapshot inside an [`AppView`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotView {
    pub index: u32,
    pub state: SlotState,
    pub task_id: bosun_id::TaskId,
    pub version_id: VersionId,
    pub agent_host: Option<String>,
    pub ip: Option<String>,
    pub host_ports: Vec<u16>,
    pub restarts: u32,
    pub mark_for_rolling_update: bool,
    pub mark_for_deletion: bool,
}
