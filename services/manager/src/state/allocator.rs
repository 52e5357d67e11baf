//! Offer allocator: matches broker offers against slots awaiting one.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use bosun_id::{OfferId, SlotRef};
use tracing::debug;

use crate::broker::Offer;
use crate::state::version::Resources;

/// One slot waiting for resources, with the requirements captured at
/// dispatch time (the version the slot is bound to cannot change while
/// it sits in the queue).
#[derive(Debug, Clone)]
pub struct PendingSlot {
    pub slot_ref: SlotRef,
    pub resources: Resources,
    /// Preassigned static IP, fixed mode only; the offer's agent must
    /// advertise a containing subnet.
    pub ip: Option<String>,
    /// Host ports the launch will draw from the offer's port ranges
    /// (one per port mapping, replicates mode only).
    pub ports: u32,
}

/// First-fit offer allocator.
///
/// The pending queue is FIFO in slot insertion order; slots are inserted
/// in `(app id, index)` ascending order by every app operation, which is
/// the tie-break the determinism rules ask for. Reservations pin an offer
/// to the slots launched against it until the broker confirms (first
/// status update) or rescinds.
#[derive(Default)]
pub struct OfferAllocator {
    pending: VecDeque<PendingSlot>,
    reservations: HashMap<OfferId, Vec<SlotRef>>,
}

impl OfferAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a slot to the pending queue; re-enqueueing an already
    /// pending slot is a no-op.
    pub fn enqueue(&mut self, slot: PendingSlot) {
        if self.pending.iter().any(|p| p.slot_ref == slot.slot_ref) {
            return;
        }
        debug!(slot = %slot.slot_ref, "Slot enqueued for offers");
        self.pending.push_back(slot);
    }

    /// Drops a slot from the pending queue (killed or re-dispatched while
    /// waiting).
    pub fn remove(&mut self, slot_ref: &SlotRef) {
        self.pending.retain(|p| &p.slot_ref != slot_ref);
    }

    /// Forgets every queue entry and reservation belonging to an app;
    /// used when an app's in-memory state is rolled back or dropped.
    pub fn remove_app(&mut self, app_id: &bosun_id::AppId) {
        self.pending.retain(|p| &p.slot_ref.app_id != app_id);
        self.reservations.retain(|_, slots| {
            slots.retain(|s| &s.app_id != app_id);
            !slots.is_empty()
        });
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, slot_ref: &SlotRef) -> bool {
        self.pending.iter().any(|p| &p.slot_ref == slot_ref)
    }

    /// First-fit match of one offer against the queue.
    ///
    /// Walks the queue in order, accepting every slot that still fits the
    /// offer's remaining resources (and, for fixed mode, whose IP is
    /// routable from the agent). Matched slots leave the queue and are
    /// recorded as reservations against the offer.
    pub fn match_offer(&mut self, offer: &Offer) -> Vec<SlotRef> {
        let mut remaining = (offer.cpus, offer.mem, offer.disk);
        let mut remaining_ports: u32 = offer
            .ports
            .iter()
            .map(|r| (r.end - r.begin) as u32 + 1)
            .sum();
        let mut matched = Vec::new();

        self.pending.retain(|slot| {
            if !fits(remaining, &slot.resources) || slot.ports > remaining_ports {
                return true;
            }
            if let Some(ip) = &slot.ip {
                if !routable_from(ip, offer) {
                    return true;
                }
            }

            remaining.0 -= slot.resources.cpus;
            remaining.1 -= slot.resources.mem;
            remaining.2 -= slot.resources.disk;
            remaining_ports -= slot.ports;
            matched.push(slot.slot_ref.clone());
            false
        });

        if !matched.is_empty() {
            self.reservations.insert(offer.id.clone(), matched.clone());
            debug!(offer = %offer.id, slots = matched.len(), "Offer matched");
        }
        matched
    }

    /// Clears a slot's claim on an offer once the broker has confirmed the
    /// launch (first status update for the task).
    pub fn confirm(&mut self, offer_id: &OfferId, slot_ref: &SlotRef) {
        if let Some(slots) = self.reservations.get_mut(offer_id) {
            slots.retain(|s| s != slot_ref);
            if slots.is_empty() {
                self.reservations.remove(offer_id);
            }
        }
    }

    /// Drops all reservations against a rescinded offer, returning the
    /// slots that must fall back to waiting.
    pub fn rescind(&mut self, offer_id: &OfferId) -> Vec<SlotRef> {
        self.reservations.remove(offer_id).unwrap_or_default()
    }

    /// Offers still carrying unconfirmed reservations; declined when the
    /// leader steps down.
    pub fn reserved_offers(&self) -> Vec<OfferId> {
        self.reservations.keys().cloned().collect()
    }
}

fn fits(remaining: (f64, f64, f64), want: &Resources) -> bool {
    remaining.0 >= want.cpus && remaining.1 >= want.mem && remaining.2 >= want.disk
}

/// True when the agent behind the offer advertises a subnet containing
/// the ip.
fn routable_from(ip: &str, offer: &Offer) -> bool {
    let Ok(ip) = ip.parse::<IpAddr>() else {
        return false;
    };
    offer.subnets().iter().any(|cidr| cidr_contains(cidr, ip))
}

fn cidr_contains(cidr: &str, ip: IpAddr) -> bool {
    let Some((base, len)) = cidr.split_once('/') else {
        return false;
    };
    let (Ok(base), Ok(len)) = (base.parse::<IpAddr>(), len.parse::<u32>()) else {
        return false;
    };
    match (base, ip) {
        (IpAddr::V4(base), IpAddr::V4(ip)) => {
            if len > 32 {
                return false;
            }
            let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
            u32::from(base) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(base), IpAddr::V6(ip)) => {
            if len > 128 {
                return false;
            }
            let mask = if len == 0 {
                0
            } else {
                u128::MAX << (128 - len)
            };
            u128::from(base) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosun_id::{AgentId, AppId};
    use std::collections::HashMap;

    fn slot(app: &str, index: u32, cpus: f64, mem: f64) -> PendingSlot {
        PendingSlot {
            slot_ref: SlotRef::new(AppId::parse(app).unwrap(), index),
            resources: Resources {
                cpus,
                mem,
                disk: 0.0,
            },
            ip: None,
            ports: 1,
        }
    }

    fn offer(id: &str, cpus: f64, mem: f64) -> Offer {
        Offer {
            id: OfferId::parse(id).unwrap(),
            agent_id: AgentId::parse("agent-1").unwrap(),
            hostname: "agent-1.dc1".to_string(),
            cpus,
            mem,
            disk: 100.0,
            ports: vec![crate::broker::PortRange {
                begin: 31000,
                end: 31009,
            }],
            attributes: HashMap::new(),
        }
    }

    #[test]
    fn one_offer_feeds_multiple_slots_until_exhausted() {
        let mut alloc = OfferAllocator::new();
        alloc.enqueue(slot("web-ops-c1", 0, 1.0, 512.0));
        alloc.enqueue(slot("web-ops-c1", 1, 1.0, 512.0));
        alloc.enqueue(slot("web-ops-c1", 2, 1.0, 512.0));

        let matched = alloc.match_offer(&offer("o1", 2.5, 4096.0));
        assert_eq!(
            matched.iter().map(|s| s.index).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(alloc.pending_len(), 1);
    }

    #[test]
    fn first_fit_skips_too_big_but_takes_later_fit() {
        let mut alloc = OfferAllocator::new();
        alloc.enqueue(slot("big-ops-c1", 0, 8.0, 8192.0));
        alloc.enqueue(slot("web-ops-c1", 0, 0.5, 256.0));

        let matched = alloc.match_offer(&offer("o1", 1.0, 1024.0));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].app_id.as_str(), "web-ops-c1");
        assert!(alloc.is_pending(&SlotRef::new(AppId::parse("big-ops-c1").unwrap(), 0)));
    }

    #[test]
    fn rescind_returns_reserved_slots() {
        let mut alloc = OfferAllocator::new();
        alloc.enqueue(slot("web-ops-c1", 0, 1.0, 512.0));
        let matched = alloc.match_offer(&offer("o1", 4.0, 4096.0));
        assert_eq!(matched.len(), 1);

        let reverted = alloc.rescind(&OfferId::parse("o1").unwrap());
        assert_eq!(reverted, matched);
        assert!(alloc.rescind(&OfferId::parse("o1").unwrap()).is_empty());
    }

    #[test]
    fn confirm_releases_reservation_per_slot() {
        let mut alloc = OfferAllocator::new();
        alloc.enqueue(slot("web-ops-c1", 0, 1.0, 512.0));
        alloc.enqueue(slot("web-ops-c1", 1, 1.0, 512.0));
        let matched = alloc.match_offer(&offer("o1", 4.0, 4096.0));
        assert_eq!(matched.len(), 2);

        let offer_id = OfferId::parse("o1").unwrap();
        alloc.confirm(&offer_id, &matched[0]);
        assert_eq!(alloc.reserved_offers(), vec![offer_id.clone()]);
        alloc.confirm(&offer_id, &matched[1]);
        assert!(alloc.reserved_offers().is_empty());
    }

    #[test]
    fn fixed_slot_requires_routable_subnet() {
        let mut alloc = OfferAllocator::new();
        let mut pending = slot("db-ops-c1", 0, 1.0, 512.0);
        pending.ip = Some("10.0.5.20".to_string());
        alloc.enqueue(pending);

        let mut wrong = offer("o1", 4.0, 4096.0);
        wrong
            .attributes
            .insert("subnets".to_string(), "10.0.1.0/24".to_string());
        assert!(alloc.match_offer(&wrong).is_empty());

        let mut right = offer("o2", 4.0, 4096.0);
        right
            .attributes
            .insert("subnets".to_string(), "10.0.1.0/24,10.0.5.0/24".to_string());
        assert_eq!(alloc.match_offer(&right).len(), 1);
    }

    #[test]
    fn cidr_matching() {
        assert!(cidr_contains("10.0.0.0/8", "10.200.3.4".parse().unwrap()));
        assert!(!cidr_contains("10.0.1.0/24", "10.0.2.1".parse().unwrap()));
        assert!(cidr_contains("0.0.0.0/0", "192.168.1.1".parse().unwrap()));
        assert!(cidr_contains("fd00::/8", "fd00::1".parse().unwrap()));
        assert!(!cidr_contains("10.0.0.0/8", "fd00::1".parse().unwrap()));
        assert!(!cidr_contains("garbage", "10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn duplicate_enqueue_is_ignored() {
        let mut alloc = OfferAllocator::new();
        alloc.enqueue(slot("web-ops-c1", 0, 1.0, 512.0));
        alloc.enqueue(slot("web-ops-c1", 0, 1.0, 512.0));
        assert_eq!(alloc.pending_len(), 1);
    }
}
