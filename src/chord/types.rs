use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::{ConfigError, MessageError};

/*
Identifiers live in a ring of 2^m positions. Nodes and keys are hashed into the
same space, so a key is owned by the first node reached walking clockwise from
the key's identifier.
*/

/// The identifier space `[0, 2^m)` shared by every node of a ring
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdSpace {
    bits: u8,
}

impl IdSpace {
    pub fn new(bits: u8) -> Result<Self, ConfigError> {
        if bits == 0 || bits > 63 {
            return Err(ConfigError::InvalidRingBits(bits));
        }
        Ok(Self { bits })
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// Number of positions on the ring, `2^m`
    pub fn size(&self) -> u64 {
        1u64 << self.bits
    }

    fn mask(&self) -> u64 {
        self.size() - 1
    }

    /// Hashes an address (or any key) into the ring.
    /// Taking the low `m` bits of the trailing digest bytes is the same as
    /// reducing the whole digest modulo `2^m`.
    pub fn identifier(&self, key: &str) -> NodeId {
        let digest = Sha256::digest(key.as_bytes());
        let mut tail = [0u8; 8];
        tail.copy_from_slice(&digest[digest.len() - 8..]);
        NodeId(u64::from_be_bytes(tail) & self.mask())
    }

    /// Start of the i-th finger interval: `(id + 2^i) mod 2^m`
    pub fn finger_start(&self, id: NodeId, i: u8) -> NodeId {
        NodeId(id.0.wrapping_add(1u64 << i) & self.mask())
    }

    /// Clockwise distance from `from` to `to`
    pub fn distance(&self, from: NodeId, to: NodeId) -> u64 {
        to.0.wrapping_sub(from.0) & self.mask()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id.0 <= self.mask()
    }
}

/// NodeId represents a position in the ring, for a node or for a key
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u64);

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(NodeId)
            .map_err(|_| MessageError::InvalidField {
                field: "identifier",
                value: s.to_string(),
            })
    }
}

/// A node descriptor: its ring position and where to reach it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl NodeInfo {
    pub fn new(space: &IdSpace, addr: SocketAddr) -> Self {
        Self {
            id: space.identifier(&addr.to_string()),
            addr,
        }
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// Which neighbour pointer a probe or proposal is about
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Successor,
    Predecessor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Successor => "successor",
            Role::Predecessor => "predecessor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "successor" => Ok(Role::Successor),
            "predecessor" => Ok(Role::Predecessor),
            other => Err(MessageError::InvalidField {
                field: "role",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingPhase {
    /// No neighbours known, not joining
    Detached,
    /// Join handshake in flight
    Seeking,
    /// Has, or has had, a successor. Pointers may be unset after a failure.
    Active,
}

/// Everything a node knows about the ring. Owned by the chord actor only.
pub struct RingState {
    pub space: IdSpace,
    pub node: NodeInfo,
    pub phase: RingPhase,
    pub successor: Option<NodeInfo>,
    pub predecessor: Option<NodeInfo>,
    pub successor_seen: Option<DateTime<Utc>>,
    pub predecessor_seen: Option<DateTime<Utc>>,
    pub routing_cache: BTreeMap<NodeId, SocketAddr>,
    pub storage: HashMap<String, String>,
}

impl RingState {
    pub fn new(space: IdSpace, node: NodeInfo) -> Self {
        Self {
            space,
            node,
            phase: RingPhase::Detached,
            successor: None,
            predecessor: None,
            successor_seen: None,
            predecessor_seen: None,
            routing_cache: BTreeMap::new(),
            storage: HashMap::new(),
        }
    }

    /// True when this node is the only member it knows of
    pub fn is_alone(&self) -> bool {
        match self.successor {
            None => true,
            Some(successor) => successor.addr == self.node.addr,
        }
    }

    pub fn neighbour(&self, role: Role) -> Option<NodeInfo> {
        match role {
            Role::Successor => self.successor,
            Role::Predecessor => self.predecessor,
        }
    }

    /// Sets a neighbour pointer, returning whether it changed
    pub fn set_neighbour(&mut self, role: Role, node: Option<NodeInfo>) -> bool {
        let (slot, seen) = match role {
            Role::Successor => (&mut self.successor, &mut self.successor_seen),
            Role::Predecessor => (&mut self.predecessor, &mut self.predecessor_seen),
        };
        if *slot == node {
            return false;
        }
        *slot = node;
        *seen = node.map(|_| Utc::now());
        true
    }

    pub fn mark_seen(&mut self, addr: SocketAddr) {
        let now = Utc::now();
        if self.successor.map(|s| s.addr) == Some(addr) {
            self.successor_seen = Some(now);
        }
        if self.predecessor.map(|p| p.addr) == Some(addr) {
            self.predecessor_seen = Some(now);
        }
    }

    /// Records a node in the routing cache. Self is never cached.
    pub fn remember(&mut self, node: NodeInfo) -> bool {
        if node.addr == self.node.addr {
            return false;
        }
        self.routing_cache.insert(node.id, node.addr) != Some(node.addr)
    }

    /// Drops a cache entry if it still maps `node.id` to `node.addr`
    pub fn forget(&mut self, node: &NodeInfo) -> bool {
        if self.routing_cache.get(&node.id) == Some(&node.addr) {
            self.routing_cache.remove(&node.id);
            return true;
        }
        false
    }

    pub fn snapshot(&self) -> RingSnapshot {
        RingSnapshot {
            node: self.node,
            phase: self.phase,
            successor: self.successor,
            predecessor: self.predecessor,
            successor_seen: self.successor_seen,
            predecessor_seen: self.predecessor_seen,
            routing_cache: self.routing_cache.clone(),
            stored_keys: self.storage.len(),
        }
    }
}

/// Point-in-time copy of a node's ring state
#[derive(Clone, Debug)]
pub struct RingSnapshot {
    pub node: NodeInfo,
    pub phase: RingPhase,
    pub successor: Option<NodeInfo>,
    pub predecessor: Option<NodeInfo>,
    pub successor_seen: Option<DateTime<Utc>>,
    pub predecessor_seen: Option<DateTime<Utc>>,
    pub routing_cache: BTreeMap<NodeId, SocketAddr>,
    pub stored_keys: usize,
}

/// Notifications published by the chord actor whenever ring state moves
#[derive(Clone, Debug, PartialEq)]
pub enum RingEvent {
    PhaseChanged(RingPhase),
    SuccessorChanged(Option<NodeInfo>),
    PredecessorChanged(Option<NodeInfo>),
    PeerTimedOut { role: Role, peer: NodeInfo },
    ProposalSent { role: Role, recipients: usize },
    CacheUpdated(NodeInfo),
    CacheEvicted(NodeInfo),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn identifiers_are_deterministic_and_in_range() {
        for bits in [1u8, 3, 16, 32, 63] {
            let space = IdSpace::new(bits).unwrap();
            for port in 6000..6100 {
                let key = addr(port).to_string();
                let id = space.identifier(&key);
                assert_eq!(id, space.identifier(&key));
                assert!(space.contains(id), "{id} out of range for m={bits}");
                assert!(id.0 < space.size());
            }
        }
    }

    #[test]
    fn smaller_spaces_keep_the_low_bits() {
        let wide = IdSpace::new(32).unwrap();
        let narrow = IdSpace::new(8).unwrap();
        let key = "127.0.0.1:6666";
        assert_eq!(wide.identifier(key).0 & 0xff, narrow.identifier(key).0);
    }

    #[test]
    fn rejects_out_of_range_ring_bits() {
        assert!(IdSpace::new(0).is_err());
        assert!(IdSpace::new(64).is_err());
        assert!(IdSpace::new(63).is_ok());
    }

    #[test]
    fn finger_starts_wrap_around() {
        let space = IdSpace::new(3).unwrap();
        let starts: Vec<u64> = (0..3).map(|i| space.finger_start(NodeId(6), i).0).collect();
        assert_eq!(starts, vec![7, 0, 2]);
    }

    #[test]
    fn distance_is_clockwise() {
        let space = IdSpace::new(3).unwrap();
        assert_eq!(space.distance(NodeId(2), NodeId(5)), 3);
        assert_eq!(space.distance(NodeId(5), NodeId(2)), 5);
        assert_eq!(space.distance(NodeId(4), NodeId(4)), 0);
    }

    #[test]
    fn role_round_trips_through_its_wire_name() {
        assert_eq!("successor".parse::<Role>().unwrap(), Role::Successor);
        assert_eq!(Role::Predecessor.as_str(), "predecessor");
        assert!("sideways".parse::<Role>().is_err());
    }

    #[test]
    fn cache_never_holds_self_and_forgets_only_matching_entries() {
        let space = IdSpace::new(16).unwrap();
        let me = NodeInfo::new(&space, addr(7000));
        let mut state = RingState::new(space, me);

        assert!(!state.remember(me));
        assert!(state.routing_cache.is_empty());

        let peer = NodeInfo::new(&space, addr(7001));
        assert!(state.remember(peer));
        assert!(!state.remember(peer));

        let impostor = NodeInfo { id: peer.id, addr: addr(7002) };
        assert!(!state.forget(&impostor));
        assert!(state.forget(&peer));
        assert!(state.routing_cache.is_empty());
    }

    #[test]
    fn neighbour_updates_report_changes() {
        let space = IdSpace::new(16).unwrap();
        let me = NodeInfo::new(&space, addr(7100));
        let peer = NodeInfo::new(&space, addr(7101));
        let mut state = RingState::new(space, me);

        assert!(state.is_alone());
        assert!(state.set_neighbour(Role::Successor, Some(peer)));
        assert!(!state.set_neighbour(Role::Successor, Some(peer)));
        assert!(state.successor_seen.is_some());
        assert!(!state.is_alone());

        assert!(state.set_neighbour(Role::Successor, None));
        assert!(state.successor_seen.is_none());
    }
}
