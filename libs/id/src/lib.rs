//! # bosun-id
//!
//! Typed identifiers for the bosun orchestrator.
//!
//! ## Design Principles
//!
//! - Ids are typed to prevent mixing different resource kinds
//! - All ids have a canonical string representation with strict parsing
//! - Ids round-trip through serde (parse → format → parse)
//! - Broker-supplied ids (offers, agents) are opaque and never interpreted
//!
//! ## Id Shapes
//!
//! - `AppId`: user-derived, globally unique, `name-runas-cluster`
//! - `VersionId`: monotonic millisecond timestamp, orderable
//! - `TaskId`: `{slot index}-{app id}-{ulid}`; the slot address is
//!   recoverable from the id, the ulid tail makes every dispatch unique
//! - `OfferId`, `AgentId`: opaque handles minted by the resource broker

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
