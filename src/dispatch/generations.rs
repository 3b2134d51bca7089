//! Multimap of live principal generations.
//!
//! Ranges whose registration is still outstanding are held as pending
//! reservations so overlapping requests are refused before the remote call
//! completes.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::ports::PortRange;
use crate::registry::Principal;

/// A live principal plus where its ports came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivePrincipal {
    /// The principal.
    pub principal: Principal,
    /// Ports were allocated from the daemon pool and must be returned.
    pub pooled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reservation {
    id: u64,
    ip: Ipv4Addr,
    range: PortRange,
}

/// Every live generation, grouped by principal id.
#[derive(Debug, Default)]
pub struct GenerationTable {
    entries: HashMap<u64, Vec<LivePrincipal>>,
    pending: Vec<Reservation>,
}

impl GenerationTable {
    /// Add a generation.
    pub fn insert(&mut self, live: LivePrincipal) {
        self.entries
            .entry(live.principal.id)
            .or_default()
            .push(live);
    }

    /// Highest generation for `id`; the later insert wins a tie.
    pub fn latest(&self, id: u64) -> Option<&LivePrincipal> {
        self.entries
            .get(&id)?
            .iter()
            .max_by_key(|live| live.principal.generation)
    }

    /// A specific generation.
    pub fn get(&self, id: u64, generation: u64) -> Option<&LivePrincipal> {
        self.entries
            .get(&id)?
            .iter()
            .find(|live| live.principal.generation == generation)
    }

    /// Drop every generation of `id`.
    pub fn remove_all(&mut self, id: u64) -> Vec<LivePrincipal> {
        self.entries.remove(&id).unwrap_or_default()
    }

    /// Principal owning `ip:port`, preferring the highest generation.
    pub fn find_at(&self, ip: Ipv4Addr, port: u32) -> Option<&LivePrincipal> {
        self.entries
            .values()
            .flatten()
            .filter(|live| live.principal.owns(ip, port))
            .max_by_key(|live| live.principal.generation)
    }

    /// Live principal on `ip` whose ports overlap `range`.
    pub fn overlapping(&self, ip: Ipv4Addr, range: PortRange) -> Option<&LivePrincipal> {
        self.entries
            .values()
            .flatten()
            .find(|live| live.principal.ip == ip && live.principal.ports.overlaps(&range))
    }

    /// Who holds ports overlapping `range` on `ip`, live or pending.
    pub fn conflict(&self, ip: Ipv4Addr, range: PortRange) -> Option<String> {
        if let Some(live) = self.overlapping(ip, range) {
            return Some(format!("principal {}", live.principal.name()));
        }
        self.pending
            .iter()
            .find(|r| r.ip == ip && r.range.overlaps(&range))
            .map(|r| format!("pending principal {}", r.id))
    }

    /// Hold `range` on `ip` for `id` until [`GenerationTable::unreserve`].
    pub fn reserve(&mut self, id: u64, ip: Ipv4Addr, range: PortRange) {
        self.pending.push(Reservation { id, ip, range });
    }

    /// Drop a hold taken by [`GenerationTable::reserve`].
    pub fn unreserve(&mut self, id: u64, ip: Ipv4Addr, range: PortRange) {
        let wanted = Reservation { id, ip, range };
        if let Some(pos) = self.pending.iter().position(|r| *r == wanted) {
            self.pending.swap_remove(pos);
        }
    }

    /// Number of outstanding holds.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Generations of `id`, oldest first.
    pub fn generations(&self, id: u64) -> Vec<Principal> {
        let mut out: Vec<Principal> = self
            .entries
            .get(&id)
            .map(|all| all.iter().map(|live| live.principal.clone()).collect())
            .unwrap_or_default();
        out.sort_by_key(|p| p.generation);
        out
    }

    /// Whether any generation of `id` is live.
    pub fn contains(&self, id: u64) -> bool {
        self.entries.get(&id).is_some_and(|all| !all.is_empty())
    }

    /// Total live generations.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Whether nothing is live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
