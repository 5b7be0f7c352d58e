use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Mutex;
use tracing::{debug, trace};

/// A Link-State Advertisement as stored in the LSDB: the owner's current
/// sequence number and its direct neighbors.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LsaEntry {
    pub seq_num: u32,
    pub neighbors: Vec<Ipv4Addr>,
}

struct RouterState {
    /// LSAs of every known host, including the local one.
    lsdb: FxHashMap<Ipv4Addr, LsaEntry>,
    /// Direct neighbors and the address/port they are reached at.
    neighbor_table: FxHashMap<Ipv4Addr, SocketAddrV4>,
    /// Destination to next hop, derived from LSDB + neighbor table.
    routing_table: FxHashMap<Ipv4Addr, SocketAddrV4>,
}

/// Link-state routing engine. A single mutex covers the neighbor table, the
/// LSDB and the routing table; every operation takes it once.
pub struct Router {
    local_addr: Ipv4Addr,
    state: Mutex<RouterState>,
}

impl Router {
    pub fn new(local_addr: Ipv4Addr) -> Router {
        Router {
            local_addr,
            state: Mutex::new(RouterState {
                lsdb: FxHashMap::default(),
                neighbor_table: FxHashMap::default(),
                routing_table: FxHashMap::default(),
            }),
        }
    }

    pub fn local_address(&self) -> Ipv4Addr {
        self.local_addr
    }

    /// Add a direct neighbor, recompute the local LSA (incrementing its
    /// sequence number) and rebuild the routing table.
    ///
    /// Panics if the neighbor is already present; callers check
    /// [`Router::is_neighbor`] first.
    pub fn add_neighbor(&self, next_hop: SocketAddrV4) {
        let mut state = self.state.lock().unwrap();

        let prev = state.neighbor_table.insert(*next_hop.ip(), next_hop);
        assert!(
            prev.is_none(),
            "neighbor {} is already in the neighbor table",
            next_hop.ip()
        );

        let old_local_lsa = state.lsdb.get(&self.local_addr).cloned().unwrap_or_default();
        recompute_local_lsa(&mut state, self.local_addr);
        build_routing_table(&mut state, self.local_addr);

        let unreachable =
            unreachable_hosts(&state, self.local_addr, self.local_addr, &old_local_lsa);
        debug_assert!(
            unreachable.is_empty(),
            "adding a neighbor must not make hosts unreachable"
        );
    }

    /// Remove a direct neighbor, recompute the local LSA, rebuild the routing
    /// table, and return the hosts that became unreachable and whose state is
    /// safe to clear.
    pub fn remove_neighbor(&self, addr: Ipv4Addr) -> Vec<Ipv4Addr> {
        let mut state = self.state.lock().unwrap();

        let removed = state.neighbor_table.remove(&addr);
        assert!(removed.is_some(), "{addr} is not in the neighbor table");

        let old_local_lsa = state.lsdb.get(&self.local_addr).cloned().unwrap_or_default();
        recompute_local_lsa(&mut state, self.local_addr);
        build_routing_table(&mut state, self.local_addr);

        unreachable_hosts(&state, self.local_addr, self.local_addr, &old_local_lsa)
    }

    /// Store a newer LSA for `owner`, rebuild the routing table and return the
    /// hosts cut off by the update. A sequence number not newer than the
    /// stored one makes this a no-op; the dispatcher filters those, so hitting
    /// the branch concurrently is only worth a debug line.
    pub fn update_lsa(
        &self,
        owner: Ipv4Addr,
        seq_num: u32,
        neighbors: Vec<Ipv4Addr>,
    ) -> Vec<Ipv4Addr> {
        let mut state = self.state.lock().unwrap();

        let old_lsa = state.lsdb.get(&owner).cloned().unwrap_or_default();
        if state.lsdb.contains_key(&owner) && old_lsa.seq_num >= seq_num {
            debug!(
                "ignoring LSA of {} with sequence {} (stored sequence is {})",
                owner, seq_num, old_lsa.seq_num
            );
            return Vec::new();
        }

        state.lsdb.insert(owner, LsaEntry { seq_num, neighbors });
        build_routing_table(&mut state, self.local_addr);

        unreachable_hosts(&state, self.local_addr, owner, &old_lsa)
    }

    /// Drop a host's LSA without rebuilding: used while clearing state for
    /// hosts already reported unreachable, which are not in the routing table.
    pub fn remove_lsa(&self, addr: Ipv4Addr) {
        let mut state = self.state.lock().unwrap();
        state.lsdb.remove(&addr);
        state.routing_table.remove(&addr);
    }

    pub fn get_next_hop(&self, dest: Ipv4Addr) -> Option<SocketAddrV4> {
        self.state.lock().unwrap().routing_table.get(&dest).copied()
    }

    pub fn get_lsa(&self, addr: Ipv4Addr) -> Option<LsaEntry> {
        self.state.lock().unwrap().lsdb.get(&addr).cloned()
    }

    /// Addresses whose LSA is present locally, for Database Descriptions.
    pub fn get_available_lsas(&self) -> Vec<Ipv4Addr> {
        self.state.lock().unwrap().lsdb.keys().copied().collect()
    }

    pub fn get_lsdb(&self) -> Vec<(Ipv4Addr, LsaEntry)> {
        self.state
            .lock()
            .unwrap()
            .lsdb
            .iter()
            .map(|(addr, lsa)| (*addr, lsa.clone()))
            .collect()
    }

    pub fn get_neighbors(&self) -> Vec<(Ipv4Addr, SocketAddrV4)> {
        self.state
            .lock()
            .unwrap()
            .neighbor_table
            .iter()
            .map(|(addr, next_hop)| (*addr, *next_hop))
            .collect()
    }

    pub fn is_neighbor(&self, addr: Ipv4Addr) -> Option<SocketAddrV4> {
        self.state.lock().unwrap().neighbor_table.get(&addr).copied()
    }

    pub fn get_routing_table(&self) -> Vec<(Ipv4Addr, SocketAddrV4)> {
        self.state
            .lock()
            .unwrap()
            .routing_table
            .iter()
            .map(|(addr, next_hop)| (*addr, *next_hop))
            .collect()
    }
}

/// Replace the local LSA with one listing the current neighbor table, its
/// sequence number one above the previous local LSA's.
fn recompute_local_lsa(state: &mut RouterState, local_addr: Ipv4Addr) {
    let seq_num = state
        .lsdb
        .get(&local_addr)
        .map(|lsa| lsa.seq_num + 1)
        .unwrap_or(0);

    let mut neighbors: Vec<Ipv4Addr> = state.neighbor_table.keys().copied().collect();
    neighbors.sort_unstable();

    state.lsdb.insert(local_addr, LsaEntry { seq_num, neighbors });
}

/// Dijkstra over the LSDB with unit edge weights. Every LSDB address except
/// the local one is a candidate; direct neighbors start settled-adjacent at
/// distance 1 carrying their own next hop, which all their descendants
/// inherit. Neighbors without an LSA yet are candidates too, so a freshly
/// connected peer is immediately routable. Adjacent addresses with no LSA and
/// no neighbor entry stay out of the tree.
fn build_routing_table(state: &mut RouterState, local_addr: Ipv4Addr) {
    const INFINITE: u32 = u32::MAX;

    let mut best: FxHashMap<Ipv4Addr, (u32, Option<SocketAddrV4>)> = FxHashMap::default();
    for addr in state.lsdb.keys() {
        if *addr == local_addr {
            continue;
        }
        match state.neighbor_table.get(addr) {
            Some(next_hop) => best.insert(*addr, (1, Some(*next_hop))),
            None => best.insert(*addr, (INFINITE, None)),
        };
    }
    for (addr, next_hop) in &state.neighbor_table {
        best.entry(*addr).or_insert((1, Some(*next_hop)));
    }

    let mut heap: BinaryHeap<Reverse<(u32, Ipv4Addr)>> = best
        .iter()
        .filter(|(_, (dist, _))| *dist != INFINITE)
        .map(|(addr, (dist, _))| Reverse((*dist, *addr)))
        .collect();

    let mut settled: FxHashSet<Ipv4Addr> = FxHashSet::default();
    state.routing_table.clear();

    while let Some(Reverse((dist, addr))) = heap.pop() {
        if settled.contains(&addr) {
            continue;
        }
        let (best_dist, next_hop) = best[&addr];
        if dist > best_dist {
            continue; // stale heap entry, superseded by a relaxation
        }

        settled.insert(addr);
        let next_hop = next_hop.expect("a finite-distance node always carries a next hop");
        state.routing_table.insert(addr, next_hop);

        let Some(lsa) = state.lsdb.get(&addr) else {
            continue;
        };
        for adjacent in lsa.neighbors.clone() {
            if adjacent == local_addr || settled.contains(&adjacent) {
                continue;
            }
            let Some(entry) = best.get_mut(&adjacent) else {
                // no LSA for this address yet: not routable until one arrives
                continue;
            };
            if dist + 1 < entry.0 {
                *entry = (dist + 1, Some(next_hop));
                heap.push(Reverse((dist + 1, adjacent)));
            }
        }
    }

    trace!(
        "rebuilt routing table with {} entries",
        state.routing_table.len()
    );
}

/// After an LSA update by `lsa_owner` whose previous LSA was `old_lsa`,
/// determine which hosts are demonstrably cut off.
///
/// If the update removed exactly one neighbor relationship and the removed
/// neighbor is no longer routable (and is not the local host), a BFS over the
/// LSDB rooted at the removed neighbor, never crossing back through
/// `lsa_owner`, collects the unreachable hosts. Hosts whose LSA is absent are
/// never reported: a missing LSA is no evidence the host went away.
fn unreachable_hosts(
    state: &RouterState,
    local_addr: Ipv4Addr,
    lsa_owner: Ipv4Addr,
    old_lsa: &LsaEntry,
) -> Vec<Ipv4Addr> {
    let current_lsa = state
        .lsdb
        .get(&lsa_owner)
        .expect("LSA of the updating owner must be stored");

    if current_lsa.neighbors.len() >= old_lsa.neighbors.len() {
        return Vec::new();
    }

    let Some(&removed) = old_lsa
        .neighbors
        .iter()
        .find(|n| !current_lsa.neighbors.contains(n))
    else {
        return Vec::new();
    };

    if state.routing_table.contains_key(&removed) || removed == local_addr {
        // still reachable through some other path
        return Vec::new();
    }

    let Some(removed_lsa) = state.lsdb.get(&removed) else {
        return Vec::new();
    };

    let mut visited: FxHashSet<Ipv4Addr> = FxHashSet::default();
    let mut unreachable = Vec::new();
    let mut queue: VecDeque<Ipv4Addr> = VecDeque::new();

    visited.insert(removed);
    unreachable.push(removed);
    queue.extend(removed_lsa.neighbors.iter().filter(|n| **n != lsa_owner));

    while let Some(node) = queue.pop_front() {
        if visited.contains(&node) {
            continue;
        }
        let Some(lsa) = state.lsdb.get(&node) else {
            // only known through someone else's LSA, no claim on this host
            continue;
        };

        visited.insert(node);
        unreachable.push(node);
        queue.extend(lsa.neighbors.iter().filter(|n| !visited.contains(n)));
    }

    unreachable
}
