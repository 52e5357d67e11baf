//! In-memory model of the scheduling engine: apps, slots, versions and
//! the offer allocator.
//!
//! All mutation happens on the scheduler loop; no other task holds a
//! reference into these structures. The loop shares read-only snapshots
//! ([`app::AppView`]) with the API instead.

pub mod allocator;
pub mod app;
pub mod slot;
pub mod version;

use std::sync::Arc;

use bosun_events::EventBus;
use bosun_id::AppId;
use thiserror::Error;

use crate::broker::BrokerHandle;
use crate::ipam::{IpamError, IpamStore};
use crate::store::{AppStore, StoreError};

pub use allocator::{OfferAllocator, PendingSlot};
pub use app::{App, AppRunState, AppView, SlotView};
pub use slot::{Slot, SlotFollowUp, SlotState};
pub use version::{validate_version, AppMode, ValidationError, Version, RESERVED_NETWORK};

/// Everything app/slot operations need to act on the outside world.
/// Injected by the scheduler into every operation; there is no global
/// store reference.
#[derive(Clone)]
pub struct SchedCtx {
    pub store: Arc<AppStore>,
    pub bus: EventBus,
    pub broker: BrokerHandle,
    pub ipam: Arc<IpamStore>,
    pub cluster_id: String,
    /// Restarts allowed per slot on TASK_FAILED / TASK_LOST before the
    /// slot parks in a terminal state; `None` means unbounded.
    pub max_restarts: Option<u32>,
}

/// Errors surfaced by app and slot operations.
#[derive(Debug, Error)]
pub enum AppError {
    /// Rejected input; nothing was mutated.
    #[error("invalid version: {0}")]
    Validation(#[from] ValidationError),

    /// Malformed identifier in the input.
    #[error("invalid id: {0}")]
    Id(#[from] bosun_id::IdError),

    /// Operation not allowed in the app's current state.
    #[error("{0}")]
    InvalidState(String),

    #[error("app {0} not found")]
    NotFound(AppId),

    #[error("app {0} already exists")]
    AlreadyExists(AppId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("ipam: {0}")]
    Ipam(#[from] IpamError),

    /// The scheduler loop is gone (leader stepped down mid-call).
    #[error("scheduler unavailable")]
    SchedulerUnavailable,
}

impl AppError {
    /// True when the underlying failure is a lost leadership, which must
    /// tear the scheduler loop down.
    pub fn is_not_leader(&self) -> bool {
        matches!(self, AppError::Store(StoreError::NotLeader))
    }
}
