//! # bosun-events
//!
//! Domain event definitions and the in-process event bus for bosun.
//!
//! ## Design Principles
//!
//! - Events are immutable records of committed state transitions
//! - Every event names the app it belongs to; slot-scoped events also
//!   carry the slot index and task id
//! - The bus is fire-and-forget: publishers never block on subscribers,
//!   and the bus is not a source of truth; subscribers reconcile from
//!   the store on restart
//!
//! ## Event Kinds
//!
//! - `app.created` / `app.updated` / `app.deleted`
//! - `slot.running` / `slot.killed`

mod bus;
mod types;

pub use bus::EventBus;
pub use types::*;
