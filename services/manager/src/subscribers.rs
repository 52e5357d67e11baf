//! Downstream event consumers: DNS records and proxy backends.
//!
//! Both subscribers tail the event bus and maintain an in-memory table
//! for their server to serve from. Neither is a source of truth; on
//! restart they rebuild from scratch as slots re-announce.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bosun_events::{DomainEvent, EventBus, EventKind};
use bosun_id::AppId;
use tokio::task::JoinHandle;
use tracing::{debug, info};

// =============================================================================
// DNS
// =============================================================================

/// One A-record published for a running slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub host: String,
    pub ip: Option<String>,
}

/// Record table keyed by fqdn `<index>.<app_id>.<domain>`.
#[derive(Clone, Default)]
pub struct DnsTable {
    records: Arc<RwLock<HashMap<String, DnsRecord>>>,
}

impl DnsTable {
    pub fn lookup(&self, name: &str) -> Option<DnsRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, name: String, record: DnsRecord) {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, record);
    }

    fn remove(&self, name: &str) {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    fn remove_app(&self, suffix: &str) {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|name, _| !name.ends_with(suffix));
    }
}

/// Subscribes to the bus and projects slot lifecycle events into A
/// records for the name server.
pub struct DnsSubscriber;

impl DnsSubscriber {
    pub fn spawn(bus: &EventBus, domain: String) -> (DnsTable, JoinHandle<()>) {
        let mut events = bus.subscribe("dns");
        let table = DnsTable::default();
        let handle = {
            let table = table.clone();
            tokio::spawn(async move {
                info!(domain, "DNS subscriber started");
                while let Some(event) = events.recv().await {
                    apply_dns_event(&table, &domain, &event);
                }
                debug!("DNS subscriber stopped");
            })
        };
        (table, handle)
    }
}

fn record_name(domain: &str, app_id: &AppId, index: u32) -> String {
    format!("{index}.{app_id}.{domain}")
}

fn apply_dns_event(table: &DnsTable, domain: &str, event: &DomainEvent) {
    match event.kind {
        EventKind::SlotRunning => {
            let (Some(index), Some(endpoint)) = (event.slot_index, event.endpoint()) else {
                return;
            };
            let name = record_name(domain, &event.app_id, index);
            debug!(name = %name, host = %endpoint.host, "DNS record published");
            table.insert(
                name,
                DnsRecord {
                    host: endpoint.host,
                    ip: endpoint.ip,
                },
            );
        }
        EventKind::SlotKilled => {
            if let Some(index) = event.slot_index {
                let name = record_name(domain, &event.app_id, index);
                debug!(name = %name, "DNS record retracted");
                table.remove(&name);
            }
        }
        EventKind::AppDeleted => {
            table.remove_app(&format!(".{}.{domain}", event.app_id));
        }
        EventKind::AppCreated | EventKind::AppUpdated => {}
    }
}

// =============================================================================
// Proxy
// =============================================================================

/// One reachable backend for an app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub index: u32,
    pub host: String,
    pub port: Option<u16>,
}

/// Upstream table keyed by app id.
#[derive(Clone, Default)]
pub struct ProxyTable {
    upstreams: Arc<RwLock<HashMap<AppId, Vec<Backend>>>>,
}

impl ProxyTable {
    pub fn backends(&self, app_id: &AppId) -> Vec<Backend> {
        self.upstreams
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(app_id)
            .cloned()
            .unwrap_or_default()
    }

    fn upsert(&self, app_id: AppId, backend: Backend) {
        let mut upstreams = self.upstreams.write().unwrap_or_else(|e| e.into_inner());
        let backends = upstreams.entry(app_id).or_default();
        backends.retain(|b| b.index != backend.index);
        backends.push(backend);
        backends.sort_by_key(|b| b.index);
    }

    fn remove(&self, app_id: &AppId, index: u32) {
        let mut upstreams = self.upstreams.write().unwrap_or_else(|e| e.into_inner());
        if let Some(backends) = upstreams.get_mut(app_id) {
            backends.retain(|b| b.index != index);
            if backends.is_empty() {
                upstreams.remove(app_id);
            }
        }
    }

    fn remove_app(&self, app_id: &AppId) {
        self.upstreams
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(app_id);
    }
}

/// Subscribes to the bus and maintains per-app backend lists for the L7
/// proxy.
pub struct ProxySubscriber;

impl ProxySubscriber {
    pub fn spawn(bus: &EventBus) -> (ProxyTable, JoinHandle<()>) {
        let mut events = bus.subscribe("proxy");
        let table = ProxyTable::default();
        let handle = {
            let table = table.clone();
            tokio::spawn(async move {
                info!("Proxy subscriber started");
                while let Some(event) = events.recv().await {
                    apply_proxy_event(&table, &event);
                }
                debug!("Proxy subscriber stopped");
            })
        };
        (table, handle)
    }
}

fn apply_proxy_event(table: &ProxyTable, event: &DomainEvent) {
    match event.kind {
        EventKind::SlotRunning => {
            let (Some(index), Some(endpoint)) = (event.slot_index, event.endpoint()) else {
                return;
            };
            table.upsert(
                event.app_id.clone(),
                Backend {
                    index,
                    host: endpoint.host,
                    port: endpoint.ports.first().copied(),
                },
            );
        }
        EventKind::SlotKilled => {
            if let Some(index) = event.slot_index {
                table.remove(&event.app_id, index);
            }
        }
        EventKind::AppDeleted => table.remove_app(&event.app_id),
        EventKind::AppCreated | EventKind::AppUpdated => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosun_events::SlotEndpoint;
    use bosun_id::{SlotRef, TaskId};
    use std::time::Duration;

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !condition() {
            if tokio::time::Instant::now() > deadline {
                panic!("subscriber never converged");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn running(app: &AppId, index: u32, host: &str, port: u16) -> DomainEvent {
        DomainEvent::slot_running(
            app.clone(),
            index,
            TaskId::generate(&SlotRef::new(app.clone(), index)),
            SlotEndpoint {
                host: host.to_string(),
                ip: None,
                ports: vec![port],
            },
        )
    }

    #[tokio::test]
    async fn dns_records_follow_slot_lifecycle() {
        let bus = EventBus::new();
        let (table, _handle) = DnsSubscriber::spawn(&bus, "bosun.local".to_string());
        let app = AppId::parse("web-ops-c1").unwrap();

        bus.publish(running(&app, 0, "agent-1.dc1", 31000));
        bus.publish(running(&app, 1, "agent-2.dc1", 31000));
        wait_for(|| table.len() == 2).await;
        let record = table.lookup("0.web-ops-c1.bosun.local").unwrap();
        assert_eq!(record.host, "agent-1.dc1");

        bus.publish(DomainEvent::slot_killed(
            app.clone(),
            0,
            TaskId::generate(&SlotRef::new(app.clone(), 0)),
        ));
        wait_for(|| table.lookup("0.web-ops-c1.bosun.local").is_none()).await;

        bus.publish(DomainEvent::app_deleted(app));
        wait_for(|| table.is_empty()).await;
    }

    #[tokio::test]
    async fn proxy_backends_follow_slot_lifecycle() {
        let bus = EventBus::new();
        let (table, _handle) = ProxySubscriber::spawn(&bus);
        let app = AppId::parse("web-ops-c1").unwrap();

        bus.publish(running(&app, 0, "agent-1.dc1", 31000));
        bus.publish(running(&app, 1, "agent-2.dc1", 31004));
        wait_for(|| table.backends(&app).len() == 2).await;
        assert_eq!(table.backends(&app)[1].port, Some(31004));

        bus.publish(DomainEvent::app_deleted(app.clone()));
        wait_for(|| table.backends(&app).is_empty()).await;
    }
}
