//! Application versions: the immutable declarative spec of an app.

use bosun_id::VersionId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Network name reserved for fixed-mode (static IP) apps.
pub const RESERVED_NETWORK: &str = "bosun";

/// How an app's instances are addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppMode {
    /// Dynamically addressed, port-mapped, health-checked instances.
    #[default]
    Replicates,
    /// One static IP per instance, no port mappings, no health checks.
    Fixed,
}

impl std::fmt::Display for AppMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppMode::Replicates => write!(f, "replicates"),
            AppMode::Fixed => write!(f, "fixed"),
        }
    }
}

/// Container port exposed by a version. The host port is assigned from the
/// offer's port ranges at launch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortMapping {
    pub name: String,
    pub container_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// Container spec for a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    pub network: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_mappings: Vec<PortMapping>,
}

/// Health check declared on a replicates-mode version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub port_name: String,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u32,
}

fn default_interval_secs() -> u32 {
    30
}

fn default_timeout_secs() -> u32 {
    10
}

/// Resource requirements of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
}

/// An immutable declarative specification of an application.
///
/// Versions are append-only per app; a rolling update proposes a new
/// version and promotes it to current only once every slot runs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    /// Monotonic timestamp id, assigned by the manager when the version
    /// is accepted.
    #[serde(default = "zero_version_id")]
    pub id: VersionId,

    /// Id of the version this one replaced, set for update versions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<VersionId>,

    /// User-facing application name.
    pub name: String,

    /// Submitting user; immutable across updates.
    pub run_as: String,

    #[serde(default)]
    pub mode: AppMode,

    pub instances: u32,

    pub container: ContainerSpec,

    /// Static IPs, fixed mode only; exactly `instances` entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub health_checks: Vec<HealthCheck>,

    pub resources: Resources,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
}

fn zero_version_id() -> VersionId {
    VersionId::from_millis(0)
}

impl Version {
    /// The static IP preassigned to a slot index, fixed mode only.
    pub fn ip_for_index(&self, index: u32) -> Option<&str> {
        if self.mode == AppMode::Fixed {
            self.ip.get(index as usize).map(String::as_str)
        } else {
            None
        }
    }
}

/// Rejection reasons from version validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("container image must not be empty")]
    MissingImage,

    #[error("instances must be at least 1")]
    NoInstances,

    #[error("fixed mode requires exactly {instances} ip(s), got {got}")]
    IpCountMismatch { instances: u32, got: usize },

    #[error("fixed mode does not support port mappings")]
    FixedWithPortMappings,

    #[error("fixed mode does not support health checks")]
    FixedWithHealthChecks,

    #[error("fixed mode requires the reserved '{RESERVED_NETWORK}' network, got '{0}'")]
    FixedBadNetwork(String),

    #[error("replicates mode requires the bridge network, got '{0}'")]
    ReplicatesBadNetwork(String),

    #[error("every port mapping needs a unique, non-empty name")]
    BadPortMappingName,

    #[error("health check references unknown port name '{0}'")]
    UnknownHealthCheckPort(String),

    #[error("unsupported health check protocol '{0}', must be tcp or http")]
    UnsupportedHealthCheckProtocol(String),

    #[error("http health check requires a path")]
    HttpHealthCheckWithoutPath,
}

/// Validates a version at create or update time.
///
/// Pure: the same version always yields the same result, and no state is
/// touched on rejection.
pub fn validate_version(version: &Version) -> Result<(), ValidationError> {
    if version.container.image.trim().is_empty() {
        return Err(ValidationError::MissingImage);
    }
    if version.instances == 0 {
        return Err(ValidationError::NoInstances);
    }

    match version.mode {
        AppMode::Fixed => validate_fixed(version),
        AppMode::Replicates => validate_replicates(version),
    }
}

fn validate_fixed(version: &Version) -> Result<(), ValidationError> {
    if version.ip.len() != version.instances as usize {
        return Err(ValidationError::IpCountMismatch {
            instances: version.instances,
            got: version.ip.len(),
        });
    }
    if !version.container.port_mappings.is_empty() {
        return Err(ValidationError::FixedWithPortMappings);
    }
    if !version.health_checks.is_empty() {
        return Err(ValidationError::FixedWithHealthChecks);
    }
    if !version.container.network.eq_ignore_ascii_case(RESERVED_NETWORK) {
        return Err(ValidationError::FixedBadNetwork(
            version.container.network.clone(),
        ));
    }
    Ok(())
}

fn validate_replicates(version: &Version) -> Result<(), ValidationError> {
    if !version.container.network.eq_ignore_ascii_case("bridge") {
        return Err(ValidationError::ReplicatesBadNetwork(
            version.container.network.clone(),
        ));
    }

    let mut port_names = Vec::with_capacity(version.container.port_mappings.len());
    for mapping in &version.container.port_mappings {
        let name = mapping.name.trim();
        if name.is_empty() || port_names.contains(&name) {
            return Err(ValidationError::BadPortMappingName);
        }
        port_names.push(name);
    }

    for check in &version.health_checks {
        let port_name = check.port_name.trim();
        if port_name.is_empty() || !port_names.contains(&port_name) {
            return Err(ValidationError::UnknownHealthCheckPort(
                check.port_name.clone(),
            ));
        }
        if !check.protocol.eq_ignore_ascii_case("tcp") && !check.protocol.eq_ignore_ascii_case("http")
        {
            return Err(ValidationError::UnsupportedHealthCheckProtocol(
                check.protocol.clone(),
            ));
        }
        if check.protocol.eq_ignore_ascii_case("http")
            && check.path.as_deref().map_or(true, |p| p.is_empty())
        {
            return Err(ValidationError::HttpHealthCheckWithoutPath);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn replicates_version(instances: u32) -> Version {
        Version {
            id: VersionId::from_millis(0),
            previous_id: None,
            name: "web".to_string(),
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

    fn fixed_version(instances: u32, ips: &[&str]) -> Version {
        let mut version = replicates_version(instances);
        version.mode = AppMode::Fixed;
        version.container.network = RESERVED_NETWORK.to_string();
        version.container.port_mappings.clear();
        version.ip = ips.iter().map(|s| s.to_string()).collect();
        version
    }

    #[test]
    fn accepts_well_formed_replicates() {
        assert_eq!(validate_version(&replicates_version(3)), Ok(()));
    }

    #[test]
    fn rejects_missing_image() {
        let mut version = replicates_version(1);
        version.container.image = "  ".to_string();
        assert_eq!(
            validate_version(&version),
            Err(ValidationError::MissingImage)
        );
    }

    #[test]
    fn rejects_fixed_ip_count_mismatch() {
        let version = fixed_version(3, &["10.0.1.10", "10.0.1.11"]);
        assert_eq!(
            validate_version(&version),
            Err(ValidationError::IpCountMismatch {
                instances: 3,
                got: 2
            })
        );
    }

    #[test]
    fn rejects_fixed_with_port_mappings() {
        let mut version = fixed_version(1, &["10.0.1.10"]);
        version.container.port_mappings.push(PortMapping {
            name: "web".to_string(),
            container_port: 80,
            protocol: "tcp".to_string(),
        });
        assert_eq!(
            validate_version(&version),
            Err(ValidationError::FixedWithPortMappings)
        );
    }

    #[test]
    fn rejects_fixed_on_wrong_network() {
        let mut version = fixed_version(1, &["10.0.1.10"]);
        version.container.network = "bridge".to_string();
        assert!(matches!(
            validate_version(&version),
            Err(ValidationError::FixedBadNetwork(_))
        ));
    }

    #[test]
    fn rejects_replicates_on_wrong_network() {
        let mut version = replicates_version(1);
        version.container.network = "host".to_string();
        assert!(matches!(
            validate_version(&version),
            Err(ValidationError::ReplicatesBadNetwork(_))
        ));
    }

    #[test]
    fn rejects_duplicate_port_names() {
        let mut version = replicates_version(1);
        let dup = version.container.port_mappings[0].clone();
        version.container.port_mappings.push(dup);
        assert_eq!(
            validate_version(&version),
            Err(ValidationError::BadPortMappingName)
        );
    }

    #[test]
    fn rejects_health_check_on_unknown_port() {
        let mut version = replicates_version(1);
        version.health_checks.push(HealthCheck {
            port_name: "admin".to_string(),
            protocol: "tcp".to_string(),
            path: None,
            interval_secs: 30,
            timeout_secs: 10,
        });
        assert!(matches!(
            validate_version(&version),
            Err(ValidationError::UnknownHealthCheckPort(_))
        ));
    }

    #[test]
    fn rejects_http_check_without_path() {
        let mut version = replicates_version(1);
        version.health_checks.push(HealthCheck {
            port_name: "web".to_string(),
            protocol: "HTTP".to_string(),
            path: None,
            interval_secs: 30,
            timeout_secs: 10,
        });
        assert_eq!(
            validate_version(&version),
            Err(ValidationError::HttpHealthCheckWithoutPath)
        );
    }

    #[test]
    fn validation_is_idempotent() {
        let version = replicates_version(2);
        assert_eq!(validate_version(&version), validate_version(&version));
    }

    #[test]
    fn version_round_trips_serde() {
        let version = replicates_version(2);
        let json = serde_json::to_string(&version).unwrap();
        let back: Version = serde_json::from_str(&json).unwrap();
        assert_eq!(back, version);
    }
}
