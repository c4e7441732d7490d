use crate::chord::types::{IdSpace, NodeId, NodeInfo, RingState};
use std::net::SocketAddr;

/// Circular ownership test: is `target` strictly inside the clockwise arc
/// `(me, suc)`? When `suc == me` the arc covers the whole ring except `me`.
pub fn between(suc: NodeId, me: NodeId, target: NodeId) -> bool {
    if suc == me {
        return target != me;
    }
    if me < suc {
        target > me && target < suc
    } else {
        // arc wraps past zero
        target > me || target < suc
    }
}

/// Who answers for `target` from this node's point of view
#[derive(Debug, PartialEq, Eq)]
pub enum Resolution {
    /// This node owns the identifier
    Local,
    /// The successor owns it
    Successor(NodeInfo),
    /// The routing cache holds the exact identifier
    Cached(SocketAddr),
    /// Somebody further along; forward to this hop
    Forward(SocketAddr),
    /// No candidate is closer to the target than this node
    Unroutable,
}

/// Picks the cached node (or successor) that gets a request closest to
/// `target` without passing it. Only hops strictly closer than this node
/// qualify, so every forward makes clockwise progress.
pub fn closest_preceding(state: &RingState, target: NodeId) -> Option<SocketAddr> {
    let space = &state.space;
    let own_distance = space.distance(state.node.id, target);

    let successor = state.successor.map(|s| (s.id, s.addr));
    state
        .routing_cache
        .iter()
        .map(|(id, addr)| (*id, *addr))
        .chain(successor)
        .filter(|(_, addr)| *addr != state.node.addr)
        .map(|(id, addr)| (space.distance(id, target), addr))
        .filter(|(distance, _)| *distance < own_distance)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, addr)| addr)
}

/// Resolution used by `get-info`: the successor answers for everything in
/// `(me, suc]`, and an exact cache hit short-circuits the walk.
pub fn resolve_owner(state: &RingState, target: NodeId) -> Resolution {
    if target == state.node.id || state.is_alone() {
        return Resolution::Local;
    }
    if let Some(successor) = state.successor {
        if between(successor.id, state.node.id, target) || target == successor.id {
            return Resolution::Successor(successor);
        }
    }
    if let Some(addr) = state.routing_cache.get(&target) {
        return Resolution::Cached(*addr);
    }
    match closest_preceding(state, target) {
        Some(addr) => Resolution::Forward(addr),
        None => Resolution::Unroutable,
    }
}

/// Does this node hold the store entry for `key_id`?
pub fn owns(state: &RingState, key_id: NodeId) -> bool {
    if state.is_alone() || key_id == state.node.id {
        return true;
    }
    match state.predecessor {
        Some(predecessor) => between(state.node.id, predecessor.id, key_id),
        None => false,
    }
}

/// Identifiers probed to fill the routing cache after a join
pub fn finger_targets(space: &IdSpace, id: NodeId) -> Vec<NodeId> {
    (0..space.bits()).map(|i| space.finger_start(id, i)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chord::types::Role;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn node(id: u64, port: u16) -> NodeInfo {
        NodeInfo { id: NodeId(id), addr: addr(port) }
    }

    fn state_at(id: u64, bits: u8) -> RingState {
        RingState::new(IdSpace::new(bits).unwrap(), node(id, 9000))
    }

    #[test]
    fn between_without_wraparound() {
        let (me, suc) = (NodeId(2), NodeId(6));
        let inside: Vec<u64> = (0..8).filter(|t| between(suc, me, NodeId(*t))).collect();
        assert_eq!(inside, vec![3, 4, 5]);
    }

    #[test]
    fn between_with_wraparound() {
        let (me, suc) = (NodeId(6), NodeId(2));
        let inside: Vec<u64> = (0..8).filter(|t| between(suc, me, NodeId(*t))).collect();
        assert_eq!(inside, vec![0, 1, 7]);
    }

    #[test]
    fn between_adjacent_nodes_is_empty() {
        assert!(!(0..8).any(|t| between(NodeId(4), NodeId(3), NodeId(t))));
        assert!(!(0..8).any(|t| between(NodeId(0), NodeId(7), NodeId(t))));
    }

    #[test]
    fn between_self_successor_covers_everything_else() {
        let me = NodeId(5);
        let inside: Vec<u64> = (0..8).filter(|t| between(me, me, NodeId(*t))).collect();
        assert_eq!(inside, vec![0, 1, 2, 3, 4, 6, 7]);
    }

    #[test]
    fn closest_uses_circular_distance_across_zero() {
        // ring of 64, we sit at 10, target is 2 (wrapped around)
        let mut state = state_at(10, 6);
        state.set_neighbour(Role::Successor, Some(node(20, 9020)));
        state.remember(node(40, 9040));
        state.remember(node(60, 9060));
        state.remember(node(1, 9001));

        // 1 precedes 2 by one step; a signed difference would prefer 60 or 40
        assert_eq!(closest_preceding(&state, NodeId(2)), Some(addr(9001)));
        // 63 is reached from 60 in three steps
        assert_eq!(closest_preceding(&state, NodeId(63)), Some(addr(9060)));
    }

    #[test]
    fn closest_never_moves_away_from_the_target() {
        let mut state = state_at(10, 6);
        state.set_neighbour(Role::Successor, Some(node(20, 9020)));
        state.remember(node(30, 9030));
        // target 12 sits just past us; every known node overshoots it
        assert_eq!(closest_preceding(&state, NodeId(12)), None);
    }

    #[test]
    fn resolve_owner_prefers_successor_range() {
        let mut state = state_at(10, 6);
        state.set_neighbour(Role::Successor, Some(node(20, 9020)));
        state.remember(node(40, 9040));

        assert_eq!(resolve_owner(&state, NodeId(10)), Resolution::Local);
        assert_eq!(resolve_owner(&state, NodeId(15)), Resolution::Successor(node(20, 9020)));
        assert_eq!(resolve_owner(&state, NodeId(20)), Resolution::Successor(node(20, 9020)));
        assert_eq!(resolve_owner(&state, NodeId(40)), Resolution::Cached(addr(9040)));
        assert_eq!(resolve_owner(&state, NodeId(50)), Resolution::Forward(addr(9040)));
        assert_eq!(resolve_owner(&state, NodeId(30)), Resolution::Forward(addr(9020)));
    }

    #[test]
    fn lone_node_owns_everything() {
        let mut state = state_at(10, 6);
        assert!(owns(&state, NodeId(33)));
        let me = state.node;
        state.set_neighbour(Role::Successor, Some(me));
        state.set_neighbour(Role::Predecessor, Some(me));
        assert!(owns(&state, NodeId(0)));
        assert_eq!(resolve_owner(&state, NodeId(63)), Resolution::Local);
    }

    #[test]
    fn ownership_follows_predecessor_arc() {
        let mut state = state_at(10, 6);
        state.set_neighbour(Role::Successor, Some(node(20, 9020)));
        state.set_neighbour(Role::Predecessor, Some(node(50, 9050)));
        assert!(owns(&state, NodeId(55)));
        assert!(owns(&state, NodeId(3)));
        assert!(owns(&state, NodeId(10)));
        assert!(!owns(&state, NodeId(50)));
        assert!(!owns(&state, NodeId(15)));

        state.set_neighbour(Role::Predecessor, None);
        assert!(!owns(&state, NodeId(3)));
    }

    #[test]
    fn finger_targets_double_around_the_ring() {
        let space = IdSpace::new(4).unwrap();
        let targets: Vec<u64> = finger_targets(&space, NodeId(13)).iter().map(|t| t.0).collect();
        assert_eq!(targets, vec![14, 15, 1, 5]);
    }
}
