use crate::chord::routing::{between, closest_preceding, finger_targets, owns, resolve_owner, Resolution};
use crate::chord::types::{NodeId, NodeInfo, RingEvent, RingPhase, RingSnapshot, RingState, Role};
use crate::chord::{ACTOR_QUEUE_SIZE, EVENT_CAPACITY};
use crate::error::{ChordError, JoinStage};
use crate::network::messages::{Command, Datagram};
use crate::network::transport::{receive_buffer, Inbound, UdpTransport};
use log::{debug, info, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Actor Messages
/// Requests from the node facade and the heartbeat workers. Each one that
/// needs an answer carries a oneshot sender the actor replies through.
#[derive(Debug)]
pub enum ChordMessage {
    Create {
        respond_to: oneshot::Sender<()>,
    },
    Join {
        bootstrap: SocketAddr,
        respond_to: oneshot::Sender<Result<(), ChordError>>,
    },
    /// Give up on the join in flight. Answers with what was still missing,
    /// or `None` when the join finished in the meantime.
    AbortJoin {
        respond_to: oneshot::Sender<Option<JoinStage>>,
    },
    Get {
        key: String,
        respond_to: oneshot::Sender<Option<String>>,
    },
    Put {
        key: String,
        value: String,
        respond_to: oneshot::Sender<()>,
    },
    Lookup {
        key: String,
        respond_to: oneshot::Sender<SocketAddr>,
    },
    StartProbe {
        role: Role,
        respond_to: oneshot::Sender<Option<Probe>>,
    },
    ProbeExpired {
        role: Role,
        peer: NodeInfo,
    },
    Snapshot {
        respond_to: oneshot::Sender<RingSnapshot>,
    },
}

/// An `alive?` in flight. `ack` fires when the peer answers.
#[derive(Debug)]
pub struct Probe {
    pub peer: NodeInfo,
    pub ack: oneshot::Receiver<()>,
}

struct PendingProbe {
    peer: NodeInfo,
    respond_to: oneshot::Sender<()>,
}

struct PendingJoin {
    has_successor: bool,
    has_predecessor: bool,
    respond_to: oneshot::Sender<Result<(), ChordError>>,
}

impl PendingJoin {
    fn missing(&self) -> Option<JoinStage> {
        match (self.has_successor, self.has_predecessor) {
            (true, true) => None,
            (false, true) => Some(JoinStage::Successor),
            (true, false) => Some(JoinStage::Predecessor),
            (false, false) => Some(JoinStage::Both),
        }
    }
}

type Waiters<K, T> = HashMap<K, Vec<oneshot::Sender<T>>>;

fn register<K: Hash + Eq, T>(waiters: &mut Waiters<K, T>, key: K, respond_to: oneshot::Sender<T>) {
    // callers that timed out have dropped their receivers
    waiters.retain(|_, senders| {
        senders.retain(|s| !s.is_closed());
        !senders.is_empty()
    });
    waiters.entry(key).or_default().push(respond_to);
}

fn resolve<K: Hash + Eq, T: Clone>(waiters: &mut Waiters<K, T>, key: &K, value: T) {
    for sender in waiters.remove(key).unwrap_or_default() {
        let _ = sender.send(value.clone());
    }
}

/// Store requests in flight by request id, with the key each one was for
type StoreWaiters<T> = HashMap<u64, (String, oneshot::Sender<T>)>;

fn track<T>(waiters: &mut StoreWaiters<T>, id: u64, key: String, respond_to: oneshot::Sender<T>) {
    waiters.retain(|_, (_, sender)| !sender.is_closed());
    waiters.insert(id, (key, respond_to));
}

/// Completes the request a reply belongs to. Replies without an id, for an
/// unknown id, or for another key settle nothing.
fn settle<T>(waiters: &mut StoreWaiters<T>, request_id: Option<u64>, key: &str, value: T) -> bool {
    let Some(id) = request_id else {
        return false;
    };
    match waiters.remove(&id) {
        Some((expected, sender)) if expected == key => {
            let _ = sender.send(value);
            true
        }
        Some(entry) => {
            waiters.insert(id, entry);
            false
        }
        None => false,
    }
}

/// The Actor that owns the ring state.
/// It is the node's dispatch loop: one datagram or request at a time, so no
/// ring mutation ever races another.
pub struct ChordActor {
    state: RingState,
    transport: UdpTransport,
    receiver: mpsc::Receiver<ChordMessage>,
    events: broadcast::Sender<RingEvent>,
    shutdown: watch::Receiver<bool>,
    loopback: VecDeque<Datagram>,
    pending_join: Option<PendingJoin>,
    pending_probes: HashMap<Role, PendingProbe>,
    next_request_id: u64,
    pending_gets: StoreWaiters<Option<String>>,
    pending_sets: StoreWaiters<()>,
    pending_lookups: Waiters<NodeId, SocketAddr>,
}

impl ChordActor {
    pub fn new(
        state: RingState,
        transport: UdpTransport,
        receiver: mpsc::Receiver<ChordMessage>,
        events: broadcast::Sender<RingEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            state,
            transport,
            receiver,
            events,
            shutdown,
            loopback: VecDeque::new(),
            pending_join: None,
            pending_probes: HashMap::new(),
            next_request_id: rand::random(),
            pending_gets: HashMap::new(),
            pending_sets: HashMap::new(),
            pending_lookups: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        info!("Node {} dispatching on {}", self.state.node.id, self.transport.local_addr());
        let mut buf = receive_buffer();

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    info!("Node {} dispatch loop stopping", self.state.node.id);
                    break;
                }
                msg = self.receiver.recv() => match msg {
                    Some(msg) => self.handle_message(msg).await,
                    None => {
                        debug!("All chord handles dropped, stopping");
                        break;
                    }
                },
                inbound = self.transport.recv(&mut buf) => match inbound {
                    Ok(Inbound::Datagram(datagram)) => self.dispatch(datagram).await,
                    // logged by the transport; nothing to undo
                    Ok(Inbound::Malformed { .. }) => {}
                    Err(e) => warn!("Receive error: {}", e),
                },
            }

            while let Some(datagram) = self.loopback.pop_front() {
                self.dispatch(datagram).await;
            }
        }
    }

    async fn handle_message(&mut self, msg: ChordMessage) {
        match msg {
            ChordMessage::Create { respond_to } => {
                self.create();
                let _ = respond_to.send(());
            }
            ChordMessage::Join { bootstrap, respond_to } => {
                self.join(bootstrap, respond_to).await;
            }
            ChordMessage::AbortJoin { respond_to } => {
                let _ = respond_to.send(self.abort_join());
            }
            ChordMessage::Get { key, respond_to } => {
                let id = self.next_request_id();
                track(&mut self.pending_gets, id, key.clone(), respond_to);
                let datagram = Datagram::new(self.state.node.addr, Command::GetValue { key })
                    .with_request_id(Some(id));
                self.route_store_request(datagram).await;
            }
            ChordMessage::Put { key, value, respond_to } => {
                let id = self.next_request_id();
                track(&mut self.pending_sets, id, key.clone(), respond_to);
                let datagram = Datagram::new(self.state.node.addr, Command::SetValue { key, value })
                    .with_request_id(Some(id));
                self.route_store_request(datagram).await;
            }
            ChordMessage::Lookup { key, respond_to } => {
                let target = self.state.space.identifier(&key);
                register(&mut self.pending_lookups, target, respond_to);
                let datagram = Datagram::new(self.state.node.addr, Command::GetInfo { target });
                self.provide_info(datagram, target).await;
            }
            ChordMessage::StartProbe { role, respond_to } => {
                let probe = self.start_probe(role).await;
                let _ = respond_to.send(probe);
            }
            ChordMessage::ProbeExpired { role, peer } => {
                self.probe_expired(role, peer).await;
            }
            ChordMessage::Snapshot { respond_to } => {
                let _ = respond_to.send(self.state.snapshot());
            }
        }
    }

    async fn dispatch(&mut self, datagram: Datagram) {
        let source = datagram.source;
        let request_id = datagram.request_id;
        match datagram.command.clone() {
            Command::Discover { joiner } => self.handle_discover(datagram, joiner).await,
            Command::DiscoverAck { successor } => {
                self.handle_discover_ack(source, successor).await
            }
            Command::LocatePredecessor { requester } => {
                self.handle_locate_predecessor(source, requester).await
            }
            Command::PredecessorAck { predecessor } => {
                self.handle_predecessor_ack(predecessor).await
            }
            Command::Proposal { role, proposer } => {
                self.handle_proposal(datagram, role, proposer).await
            }
            Command::ProposalAck { role, candidate } => {
                self.handle_proposal_ack(source, role, candidate).await
            }
            Command::Heartbeat { .. } | Command::AliveAck { .. } => self.handle_alive_signal(source),
            Command::Alive { sender } => self.handle_alive_query(source, sender).await,
            Command::GetInfo { target } => self.provide_info(datagram, target).await,
            Command::InfoAck { target, owner } => self.handle_info_ack(target, owner),
            Command::GetValue { .. } | Command::SetValue { .. } => {
                self.route_store_request(datagram).await
            }
            Command::ValueAck { key, value } => {
                if !settle(&mut self.pending_gets, request_id, &key, Some(value)) {
                    debug!("Discarding value-ack for {} from {}: no matching get", key, source);
                }
            }
            Command::ValueMissing { key } => {
                if !settle(&mut self.pending_gets, request_id, &key, None) {
                    debug!("Discarding value-missing for {} from {}: no matching get", key, source);
                }
            }
            Command::Ack { key } => {
                if !settle(&mut self.pending_sets, request_id, &key, ()) {
                    debug!("Discarding ack for {} from {}: no matching set", key, source);
                }
            }
            Command::Evict { node, addr } => {
                let evicted = NodeInfo { id: node, addr };
                if self.state.forget(&evicted) {
                    debug!("Evicted {} from routing cache at {}'s request", evicted, source);
                    self.emit(RingEvent::CacheEvicted(evicted));
                }
            }
        }
    }

    // Outbound

    async fn send(&mut self, to: SocketAddr, datagram: Datagram) {
        if to == self.state.node.addr {
            self.loopback.push_back(datagram);
        } else {
            self.transport.send_or_log(to, &datagram).await;
        }
    }

    async fn reply(&mut self, to: SocketAddr, command: Command) {
        let datagram = Datagram::new(self.state.node.addr, command);
        self.send(to, datagram).await;
    }

    /// Greedy hop toward `target`; the datagram is re-sent unchanged
    async fn forward_to_closest(&mut self, target: NodeId, datagram: Datagram) {
        match closest_preceding(&self.state, target) {
            Some(next_hop) => {
                debug!("Forwarding {} for {} to {}", datagram.command.tag(), target, next_hop);
                self.send(next_hop, datagram).await;
            }
            None => warn!(
                "No route toward {} for {} from {}, dropping",
                target,
                datagram.command.tag(),
                datagram.source
            ),
        }
    }

    fn emit(&self, event: RingEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    // State transitions

    fn set_phase(&mut self, phase: RingPhase) {
        if self.state.phase != phase {
            info!("Node {} is now {:?}", self.state.node.id, phase);
            self.state.phase = phase;
            self.emit(RingEvent::PhaseChanged(phase));
        }
    }

    fn adopt(&mut self, role: Role, node: Option<NodeInfo>) {
        if let Some(node) = node {
            self.remember(node);
        }
        if self.state.set_neighbour(role, node) {
            match node {
                Some(node) => info!("Node {} {} is now {}", self.state.node.id, role, node),
                None => info!("Node {} {} cleared", self.state.node.id, role),
            }
            self.emit(match role {
                Role::Successor => RingEvent::SuccessorChanged(node),
                Role::Predecessor => RingEvent::PredecessorChanged(node),
            });
        }
    }

    fn remember(&mut self, node: NodeInfo) {
        if self.state.remember(node) {
            debug!("Routing cache: {} -> {}", node.id, node.addr);
            self.emit(RingEvent::CacheUpdated(node));
        }
    }

    fn next_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id = id.wrapping_add(1);
        id
    }

    fn peer(&self, addr: SocketAddr) -> NodeInfo {
        NodeInfo::new(&self.state.space, addr)
    }

    // Bootstrap and join

    fn create(&mut self) {
        let me = self.state.node;
        self.adopt(Role::Successor, Some(me));
        self.adopt(Role::Predecessor, Some(me));
        self.set_phase(RingPhase::Active);
        info!("Node {} started a new ring", me);
    }

    async fn join(&mut self, bootstrap: SocketAddr, respond_to: oneshot::Sender<Result<(), ChordError>>) {
        if self.state.phase != RingPhase::Detached {
            let _ = respond_to.send(Err(ChordError::AlreadyJoined));
            return;
        }
        if bootstrap == self.state.node.addr {
            let _ = respond_to.send(Err(ChordError::InvalidRequest(
                "cannot join through our own address".into(),
            )));
            return;
        }

        info!("Node {} joining through {}", self.state.node, bootstrap);
        self.set_phase(RingPhase::Seeking);
        self.pending_join = Some(PendingJoin {
            has_successor: false,
            has_predecessor: false,
            respond_to,
        });

        let id = self.state.node.id;
        self.reply(bootstrap, Command::Discover { joiner: id }).await;
        self.reply(bootstrap, Command::LocatePredecessor { requester: id }).await;
    }

    fn abort_join(&mut self) -> Option<JoinStage> {
        let pending = self.pending_join.take()?;
        let missing = pending.missing();
        warn!("Join abandoned, still waiting for {:?}", missing);
        self.adopt(Role::Successor, None);
        self.adopt(Role::Predecessor, None);
        self.set_phase(RingPhase::Detached);
        missing
    }

    async fn maybe_complete_join(&mut self) {
        let done = matches!(&self.pending_join, Some(p) if p.missing().is_none());
        if !done {
            return;
        }
        if let Some(pending) = self.pending_join.take() {
            self.set_phase(RingPhase::Active);
            let _ = pending.respond_to.send(Ok(()));
        }
        self.fill_routing_cache().await;
    }

    /// One get-info per finger start, sent to the successor
    async fn fill_routing_cache(&mut self) {
        let Some(successor) = self.state.successor else {
            return;
        };
        let targets = finger_targets(&self.state.space, self.state.node.id);
        debug!("Probing {} finger starts through {}", targets.len(), successor);
        for target in targets {
            self.reply(successor.addr, Command::GetInfo { target }).await;
        }
    }

    async fn handle_discover(&mut self, datagram: Datagram, joiner_id: NodeId) {
        let joiner = NodeInfo { id: joiner_id, addr: datagram.source };
        if joiner.addr == self.state.node.addr {
            return;
        }
        if self.state.phase == RingPhase::Seeking {
            debug!("Ignoring discover from {} while joining ourselves", joiner);
            return;
        }

        let me = self.state.node;
        match self.state.successor {
            None => {
                info!("No successor yet, adopting joiner {}", joiner);
                self.adopt(Role::Successor, Some(joiner));
                self.adopt(Role::Predecessor, Some(joiner));
                self.set_phase(RingPhase::Active);
                self.reply(joiner.addr, Command::DiscoverAck { successor: me.addr }).await;
            }
            Some(old_successor) if between(old_successor.id, me.id, joiner.id) => {
                info!("Joiner {} fits between {} and {}", joiner, me, old_successor);
                if old_successor.addr == me.addr {
                    self.adopt(Role::Predecessor, Some(joiner));
                } else {
                    self.reply(old_successor.addr, Command::PredecessorAck { predecessor: joiner.addr })
                        .await;
                }
                self.reply(joiner.addr, Command::PredecessorAck { predecessor: me.addr }).await;
                self.adopt(Role::Successor, Some(joiner));
                self.reply(joiner.addr, Command::DiscoverAck { successor: old_successor.addr })
                    .await;
            }
            Some(_) => {
                // cache after routing, or the joiner is the closest hop for its own discover
                self.forward_to_closest(joiner.id, datagram).await;
                self.remember(joiner);
            }
        }
    }

    async fn handle_discover_ack(&mut self, source: SocketAddr, successor: SocketAddr) {
        if self.state.phase != RingPhase::Seeking {
            debug!("Discarding discover-ack from {}: not joining", source);
            return;
        }
        let successor = self.peer(successor);
        self.adopt(Role::Successor, Some(successor));
        if let Some(pending) = self.pending_join.as_mut() {
            pending.has_successor = true;
        }
        self.maybe_complete_join().await;
    }

    async fn handle_locate_predecessor(&mut self, source: SocketAddr, requester: NodeId) {
        match self.state.successor {
            Some(successor) if successor.addr == source => {
                let me = self.state.node.addr;
                self.reply(source, Command::PredecessorAck { predecessor: me }).await;
            }
            _ => debug!(
                "locate-predecessor from {} ({}) who is not our successor, dropping",
                source, requester
            ),
        }
    }

    async fn handle_predecessor_ack(&mut self, predecessor: SocketAddr) {
        if self.state.phase == RingPhase::Detached && self.pending_join.is_none() {
            debug!("Discarding predecessor-ack naming {}: not in a ring", predecessor);
            return;
        }
        let predecessor = self.peer(predecessor);
        self.adopt(Role::Predecessor, Some(predecessor));
        if let Some(pending) = self.pending_join.as_mut() {
            pending.has_predecessor = true;
        }
        self.maybe_complete_join().await;
    }

    // Failure detection and re-election

    async fn start_probe(&mut self, role: Role) -> Option<Probe> {
        match self.state.neighbour(role) {
            Some(peer) if peer.addr != self.state.node.addr => {
                let (respond_to, ack) = oneshot::channel();
                self.pending_probes.insert(role, PendingProbe { peer, respond_to });
                let me = self.state.node.id;
                self.reply(peer.addr, Command::Alive { sender: me }).await;
                Some(Probe { peer, ack })
            }
            None if role == Role::Successor && self.state.phase == RingPhase::Active => {
                debug!("Still without a successor, proposing again");
                self.elect_successor().await;
                None
            }
            _ => None,
        }
    }

    async fn probe_expired(&mut self, role: Role, peer: NodeInfo) {
        if matches!(self.pending_probes.get(&role), Some(p) if p.peer == peer) {
            self.pending_probes.remove(&role);
        }
        if self.state.neighbour(role) != Some(peer) {
            // pointer moved on while the probe was out
            return;
        }

        warn!("Node {} lost its {} {}", self.state.node.id, role, peer);
        self.emit(RingEvent::PeerTimedOut { role, peer });
        self.adopt(role, None);

        if role == Role::Successor {
            self.evict_everywhere(peer).await;
            self.elect_successor().await;
        }
    }

    async fn evict_everywhere(&mut self, dead: NodeInfo) {
        if self.state.forget(&dead) {
            self.emit(RingEvent::CacheEvicted(dead));
        }
        let peers: Vec<SocketAddr> = self.state.routing_cache.values().copied().collect();
        for addr in peers {
            self.reply(addr, Command::Evict { node: dead.id, addr: dead.addr }).await;
        }
    }

    /// Asks every cached node and the predecessor for a new successor
    async fn elect_successor(&mut self) {
        let me = self.state.node;
        let mut recipients: Vec<SocketAddr> = self.state.routing_cache.values().copied().collect();
        if let Some(predecessor) = self.state.predecessor {
            recipients.push(predecessor.addr);
        }
        recipients.retain(|addr| *addr != me.addr);
        recipients.sort();
        recipients.dedup();

        if recipients.is_empty() {
            debug!("Node {} has nobody to ask for a new successor", me.id);
        } else {
            info!("Node {} proposing to {} peers for a new successor", me.id, recipients.len());
        }
        for addr in &recipients {
            self.reply(*addr, Command::Proposal { role: Role::Successor, proposer: me.id })
                .await;
        }
        self.emit(RingEvent::ProposalSent {
            role: Role::Successor,
            recipients: recipients.len(),
        });
    }

    async fn handle_proposal(&mut self, datagram: Datagram, role: Role, proposer: NodeId) {
        let source = datagram.source;
        if source == self.state.node.addr {
            return;
        }
        if role != Role::Successor {
            debug!("Discarding {} proposal from {}: only successors are re-elected", role, source);
            return;
        }

        match self.state.predecessor {
            None => {
                info!("Offering ourselves as successor to {} ({})", proposer, source);
                let me = self.state.node.id;
                self.reply(source, Command::ProposalAck { role: Role::Successor, candidate: me })
                    .await;
            }
            Some(predecessor) => {
                trace!("Passing proposal from {} back to {}", source, predecessor);
                self.send(predecessor.addr, datagram).await;
            }
        }
    }

    async fn handle_proposal_ack(&mut self, source: SocketAddr, role: Role, candidate: NodeId) {
        let offered = NodeInfo { id: candidate, addr: source };
        let me = self.state.node.id;
        match role {
            Role::Successor if self.state.successor.is_none() => {
                info!("Accepting {} as new successor", offered);
                self.adopt(Role::Successor, Some(offered));
                self.reply(source, Command::ProposalAck { role: Role::Predecessor, candidate: me })
                    .await;
            }
            Role::Predecessor if self.state.predecessor.is_none() => {
                info!("Accepting {} as new predecessor", offered);
                self.adopt(Role::Predecessor, Some(offered));
                self.reply(source, Command::ProposalAck { role: Role::Successor, candidate: me })
                    .await;
            }
            _ => debug!("Discarding {} proposal-ack from {}: slot already filled", role, source),
        }
    }

    fn handle_alive_signal(&mut self, source: SocketAddr) {
        self.state.mark_seen(source);
        for role in [Role::Successor, Role::Predecessor] {
            if matches!(self.pending_probes.get(&role), Some(p) if p.peer.addr == source) {
                if let Some(probe) = self.pending_probes.remove(&role) {
                    trace!("{} {} answered", role, probe.peer);
                    let _ = probe.respond_to.send(());
                }
            }
        }
    }

    async fn handle_alive_query(&mut self, source: SocketAddr, sender: NodeId) {
        let me = self.state.node.id;
        let is_neighbour = [self.state.successor, self.state.predecessor]
            .iter()
            .flatten()
            .any(|n| n.addr == source);
        if is_neighbour {
            self.reply(source, Command::AliveAck { sender: me }).await;
        } else {
            debug!("alive? from non-neighbour {} ({}), answering with a heartbeat", source, sender);
            self.reply(source, Command::Heartbeat { sender: me }).await;
        }
    }

    // Routing-cache fill and lookups

    async fn provide_info(&mut self, datagram: Datagram, target: NodeId) {
        let requester = datagram.source;
        match resolve_owner(&self.state, target) {
            Resolution::Local => {
                let owner = self.state.node.addr;
                self.reply(requester, Command::InfoAck { target, owner }).await;
            }
            Resolution::Successor(successor) => {
                self.reply(requester, Command::InfoAck { target, owner: successor.addr }).await;
            }
            Resolution::Cached(owner) => {
                self.reply(requester, Command::InfoAck { target, owner }).await;
            }
            Resolution::Forward(next_hop) => {
                debug!("Can't answer get-info for {}, forwarding to {}", target, next_hop);
                self.send(next_hop, datagram).await;
            }
            Resolution::Unroutable => {
                warn!("No route toward {} for get-info from {}", target, requester)
            }
        }
    }

    fn handle_info_ack(&mut self, target: NodeId, owner: SocketAddr) {
        let owner_info = self.peer(owner);
        self.remember(owner_info);
        resolve(&mut self.pending_lookups, &target, owner);
    }

    // Key-value store

    async fn route_store_request(&mut self, datagram: Datagram) {
        let key = match &datagram.command {
            Command::GetValue { key } | Command::SetValue { key, .. } => key.clone(),
            other => {
                warn!("{} is not a store request", other.tag());
                return;
            }
        };
        let key_id = self.state.space.identifier(&key);
        let me = self.state.node;

        if owns(&self.state, key_id) || datagram.dest == Some(me.addr) {
            self.serve_store_request(datagram).await;
            return;
        }

        if let Some(successor) = self.state.successor {
            if between(successor.id, me.id, key_id) || key_id == successor.id {
                trace!("{} ({}) belongs to successor {}", key, key_id, successor);
                self.send(successor.addr, datagram.addressed_to(successor.addr)).await;
                return;
            }
        }
        self.forward_to_closest(key_id, datagram).await;
    }

    async fn serve_store_request(&mut self, datagram: Datagram) {
        let requester = datagram.source;
        let request_id = datagram.request_id;
        let reply = match datagram.command {
            Command::GetValue { key } => match self.state.storage.get(&key) {
                Some(value) => Command::ValueAck { key, value: value.clone() },
                None => Command::ValueMissing { key },
            },
            Command::SetValue { key, value } => {
                debug!("Storing {} for {}", key, requester);
                self.state.storage.insert(key.clone(), value);
                Command::Ack { key }
            }
            other => {
                warn!("{} is not a store request", other.tag());
                return;
            }
        };
        let reply = Datagram::new(self.state.node.addr, reply).with_request_id(request_id);
        self.send(requester, reply).await;
    }
}

/// Actor handle for interacting with the ChordActor
#[derive(Clone, Debug)]
pub struct ChordHandle {
    sender: mpsc::Sender<ChordMessage>,
    events: broadcast::Sender<RingEvent>,
    join_timeout: Duration,
    request_timeout: Duration,
}

impl ChordHandle {
    pub fn new(
        state: RingState,
        transport: UdpTransport,
        shutdown: watch::Receiver<bool>,
        join_timeout: Duration,
        request_timeout: Duration,
    ) -> (Self, ChordActor) {
        let (sender, receiver) = mpsc::channel(ACTOR_QUEUE_SIZE);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let actor = ChordActor::new(state, transport, receiver, events.clone(), shutdown);
        let handle = Self {
            sender,
            events,
            join_timeout,
            request_timeout,
        };
        (handle, actor)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RingEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ChordMessage,
    ) -> Result<oneshot::Receiver<T>, ChordError> {
        let (send, recv) = oneshot::channel();
        self.sender
            .send(make(send))
            .await
            .map_err(|_| ChordError::ActorStopped)?;
        Ok(recv)
    }

    pub async fn create(&self) -> Result<(), ChordError> {
        let recv = self.request(|respond_to| ChordMessage::Create { respond_to }).await?;
        recv.await.map_err(|_| ChordError::ActorStopped)
    }

    /// Runs the join handshake, giving up after the join timeout
    pub async fn join(&self, bootstrap: SocketAddr) -> Result<(), ChordError> {
        let recv = self
            .request(|respond_to| ChordMessage::Join { bootstrap, respond_to })
            .await?;

        match tokio::time::timeout(self.join_timeout, recv).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChordError::ActorStopped),
            Err(_) => {
                let abort = self
                    .request(|respond_to| ChordMessage::AbortJoin { respond_to })
                    .await?;
                match abort.await.map_err(|_| ChordError::ActorStopped)? {
                    Some(missing) => Err(ChordError::JoinTimedOut { missing }),
                    // completed just as we gave up
                    None => Ok(()),
                }
            }
        }
    }

    async fn await_reply<T>(&self, key: &str, recv: oneshot::Receiver<T>) -> Result<T, ChordError> {
        match tokio::time::timeout(self.request_timeout, recv).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(ChordError::ActorStopped),
            Err(_) => Err(ChordError::RequestTimedOut(key.to_string())),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, ChordError> {
        let recv = self
            .request(|respond_to| ChordMessage::Get { key: key.to_string(), respond_to })
            .await?;
        self.await_reply(key, recv).await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), ChordError> {
        let recv = self
            .request(|respond_to| ChordMessage::Put {
                key: key.to_string(),
                value: value.to_string(),
                respond_to,
            })
            .await?;
        self.await_reply(key, recv).await
    }

    /// Address of the node responsible for `key`
    pub async fn lookup(&self, key: &str) -> Result<SocketAddr, ChordError> {
        let recv = self
            .request(|respond_to| ChordMessage::Lookup { key: key.to_string(), respond_to })
            .await?;
        self.await_reply(key, recv).await
    }

    pub async fn start_probe(&self, role: Role) -> Result<Option<Probe>, ChordError> {
        let recv = self
            .request(|respond_to| ChordMessage::StartProbe { role, respond_to })
            .await?;
        recv.await.map_err(|_| ChordError::ActorStopped)
    }

    pub async fn probe_expired(&self, role: Role, peer: NodeInfo) -> Result<(), ChordError> {
        self.sender
            .send(ChordMessage::ProbeExpired { role, peer })
            .await
            .map_err(|_| ChordError::ActorStopped)
    }

    pub async fn snapshot(&self) -> Result<RingSnapshot, ChordError> {
        let recv = self
            .request(|respond_to| ChordMessage::Snapshot { respond_to })
            .await?;
        recv.await.map_err(|_| ChordError::ActorStopped)
    }
}
