//! Id definitions for the orchestrator's resources.

use crate::{define_opaque_id, IdError};
use ulid::Ulid;

// =============================================================================
// Broker-minted handles
// =============================================================================

define_opaque_id!(OfferId);
define_opaque_id!(AgentId);
define_opaque_id!(FrameworkId);

// =============================================================================
// AppId
// =============================================================================

/// Globally unique application identifier.
///
/// Derived from the user-facing name, the submitting user, and the cluster
/// id, joined with dashes: `web-ops-beijing`. Lowercase ascii alphanumerics
/// and inner dashes only, so the id is safe as a DNS label prefix and as a
/// store key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppId(String);

impl AppId {
    /// Builds an app id from its three segments.
    pub fn from_parts(name: &str, run_as: &str, cluster: &str) -> Result<Self, IdError> {
        for (label, segment) in [("name", name), ("runAs", run_as), ("cluster", cluster)] {
            validate_segment(label, segment)?;
        }
        Ok(Self(format!("{name}-{run_as}-{cluster}")))
    }

    /// Parses an already-joined app id.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        validate_segment("appId", s)?;
        Ok(Self(s.to_string()))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate_segment(label: &str, s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(IdError::format(format!(
            "{label} '{s}' may only contain lowercase ascii, digits and dashes"
        )));
    }
    if s.starts_with('-') || s.ends_with('-') {
        return Err(IdError::format(format!(
            "{label} '{s}' must not start or end with a dash"
        )));
    }
    Ok(())
}

impl std::fmt::Display for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AppId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AppId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<AppId> for String {
    fn from(id: AppId) -> String {
        id.0
    }
}

// =============================================================================
// VersionId
// =============================================================================

/// Identifier of one immutable app version.
///
/// A millisecond unix timestamp. Version ids within one app are strictly
/// monotonic; [`VersionId::after`] bumps the clock value when two versions
/// land in the same millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionId(u64);

impl VersionId {
    /// Wraps a raw millisecond timestamp.
    #[must_use]
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    /// Returns a version id for `now_ms` that is strictly greater than
    /// `prev`, bumping by one when the clock has not advanced.
    #[must_use]
    pub fn after(prev: Option<VersionId>, now_ms: u64) -> Self {
        match prev {
            Some(VersionId(p)) if now_ms <= p => Self(p + 1),
            _ => Self(now_ms),
        }
    }

    /// Returns the raw millisecond value.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Parses the decimal string form.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        s.parse::<u64>()
            .map(Self)
            .map_err(|e| IdError::InvalidNumber(e.to_string()))
    }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for VersionId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for VersionId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<VersionId> for String {
    fn from(id: VersionId) -> String {
        id.0.to_string()
    }
}

// =============================================================================
// SlotRef
// =============================================================================

/// Address of one slot: `(app id, slot index)`.
///
/// Orders by app id first, then index, which is the tie-break order the
/// offer allocator relies on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct SlotRef {
    pub app_id: AppId,
    pub index: u32,
}

impl SlotRef {
    #[must_use]
    pub fn new(app_id: AppId, index: u32) -> Self {
        Self { app_id, index }
    }
}

impl std::fmt::Display for SlotRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.index, self.app_id)
    }
}

// =============================================================================
// TaskId
// =============================================================================

/// Identifier of one task dispatch: `{index}-{app id}-{ulid}`.
///
/// The slot address is embedded so a broker status update can be routed
/// back to its slot without a side table; the ulid tail guarantees that
/// every (re)dispatch is unique across the broker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    /// Mints a fresh task id for a slot.
    #[must_use]
    pub fn generate(slot: &SlotRef) -> Self {
        Self(format!("{}-{}-{}", slot.index, slot.app_id, Ulid::new()))
    }

    /// Parses a task id, checking that the slot address and ulid tail are
    /// both recoverable.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let id = Self(s.to_string());
        id.slot_ref()?;
        Ok(id)
    }

    /// Recovers the slot address embedded in the id.
    pub fn slot_ref(&self) -> Result<SlotRef, IdError> {
        let (index, rest) = self
            .0
            .split_once('-')
            .ok_or(IdError::MissingSeparator { separator: '-' })?;
        let (app, ulid) = rest
            .rsplit_once('-')
            .ok_or(IdError::MissingSeparator { separator: '-' })?;
        let index: u32 = index
            .parse()
            .map_err(|e: std::num::ParseIntError| IdError::InvalidNumber(e.to_string()))?;
        ulid.parse::<Ulid>()
            .map_err(|e| IdError::InvalidUlid(e.to_string()))?;
        Ok(SlotRef::new(AppId::parse(app)?, index))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TaskId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> String {
        id.0
    }
}

// =============================================================================
// Tests
// =============================================================================
