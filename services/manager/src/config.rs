//! Manager configuration, loaded from the environment with `BOSUN_*`
//! variables; the binary layers clap flags on top.

use std::net::SocketAddr;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// API listen address.
    pub listen_addr: SocketAddr,
    /// Path of the manager's KV store.
    pub store_path: String,
    /// Cluster this manager schedules for; part of every app id.
    pub cluster_id: String,
    /// Skip state reload on leader assumption.
    pub no_recover: bool,
    /// Manager replica peers (consensus endpoints).
    pub cluster: Vec<String>,
    pub scheduler: SchedulerSection,
    pub dns: DnsSection,
    pub proxy: ProxySection,
    pub ipam: IpamSection,
}

#[derive(Debug, Clone)]
pub struct SchedulerSection {
    /// Resource broker endpoint.
    pub broker_endpoint: String,
    /// User tasks run as by default.
    pub user: String,
    /// Framework name registered with the broker.
    pub framework_name: String,
    /// How long the broker keeps our tasks after a disconnect.
    pub failover_timeout_secs: u64,
    /// Scheduler heartbeat tick (reconcile + janitor).
    pub heartbeat_interval_secs: u64,
    /// Restarts allowed per slot on task failure; unset means unbounded.
    pub max_restarts: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct DnsSection {
    pub enable: bool,
    pub domain: String,
    pub listener: String,
    pub port: u16,
    pub resolvers: Vec<String>,
    pub ttl: u32,
    pub soa_serial: u32,
    pub soa_refresh: u32,
    pub soa_retry: u32,
    pub soa_expire: u32,
}

#[derive(Debug, Clone)]
pub struct ProxySection {
    pub enable: bool,
    pub listener: String,
    pub domain: String,
}

#[derive(Debug, Clone)]
pub struct IpamSection {
    pub store_path: String,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl ManagerConfig {
    pub fn from_env() -> Result<Self> {
        let listen_addr = env_or("BOSUN_LISTEN_ADDR", "0.0.0.0:9999")
            .parse()
            .context("invalid BOSUN_LISTEN_ADDR")?;

        Ok(Self {
            listen_addr,
            store_path: env_or("BOSUN_STORE_PATH", "/var/lib/bosun/manager.db"),
            cluster_id: env_or("BOSUN_CLUSTER_ID", "default"),
            no_recover: env_flag("BOSUN_NO_RECOVER"),
            cluster: env_list("BOSUN_CLUSTER"),
            scheduler: SchedulerSection {
                broker_endpoint: env_or("BOSUN_BROKER_ENDPOINT", "http://127.0.0.1:5050"),
                user: env_or("BOSUN_BROKER_USER", "root"),
                framework_name: env_or("BOSUN_FRAMEWORK_NAME", "bosun"),
                failover_timeout_secs: env_parse("BOSUN_FAILOVER_TIMEOUT_SECS", 604_800),
                heartbeat_interval_secs: env_parse("BOSUN_HEARTBEAT_INTERVAL_SECS", 10),
                max_restarts: std::env::var("BOSUN_MAX_RESTARTS")
                    .ok()
                    .and_then(|s| s.parse().ok()),
            },
            dns: DnsSection {
                enable: env_flag("BOSUN_DNS_ENABLE"),
                domain: env_or("BOSUN_DNS_DOMAIN", "bosun.local"),
                listener: env_or("BOSUN_DNS_LISTENER", "0.0.0.0"),
                port: env_parse("BOSUN_DNS_PORT", 53),
                resolvers: env_list("BOSUN_DNS_RESOLVERS"),
                ttl: env_parse("BOSUN_DNS_TTL", 3),
                soa_serial: env_parse("BOSUN_DNS_SOA_SERIAL", 1),
                soa_refresh: env_parse("BOSUN_DNS_SOA_REFRESH", 3600),
                soa_retry: env_parse("BOSUN_DNS_SOA_RETRY", 600),
                soa_expire: env_parse("BOSUN_DNS_SOA_EXPIRE", 86_400),
            },
            proxy: ProxySection {
                enable: env_flag("BOSUN_PROXY_ENABLE"),
                listener: env_or("BOSUN_PROXY_LISTENER", "0.0.0.0:80"),
                domain: env_or("BOSUN_PROXY_DOMAIN", "bosun.local"),
            },
            ipam: IpamSection {
                store_path: env_or("BOSUN_IPAM_STORE_PATH", "/var/lib/bosun/ipam.db"),
            },
        })
    }
}
