pub mod conversions;

use crate::chord::types::{NodeId, Role};
use crate::error::MessageError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Largest payload a single UDP datagram can carry over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// The wire form of every message: one JSON object per datagram
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub tag: String,
    #[serde(default)]
    pub source_address: String,
    #[serde(default)]
    pub dest_address: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
    /// Set on store requests and echoed by their replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| MessageError::SerializationFailed(e.to_string()))?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(MessageError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(|e| MessageError::DeserializationFailed(e.to_string()))
    }
}

/// Every command a node understands. Conversions to and from [`Envelope`]
/// are exhaustive, so an unknown tag is a decode error rather than a no-op.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// A joining node asks where it belongs
    Discover { joiner: NodeId },
    /// Names the joiner's successor
    DiscoverAck { successor: SocketAddr },
    /// A joining node asks for its predecessor
    LocatePredecessor { requester: NodeId },
    /// Tells the recipient to adopt `predecessor`
    PredecessorAck { predecessor: SocketAddr },
    /// Re-election request after a neighbour failed
    Proposal { role: Role, proposer: NodeId },
    /// Sender offers itself for `role` relative to the recipient
    ProposalAck { role: Role, candidate: NodeId },
    /// Unsolicited liveness signal
    Heartbeat { sender: NodeId },
    /// `alive?` probe
    Alive { sender: NodeId },
    AliveAck { sender: NodeId },
    /// Which node owns `target`?
    GetInfo { target: NodeId },
    InfoAck { target: NodeId, owner: SocketAddr },
    GetValue { key: String },
    ValueAck { key: String, value: String },
    ValueMissing { key: String },
    SetValue { key: String, value: String },
    Ack { key: String },
    /// Drop `node` from the routing cache
    Evict { node: NodeId, addr: SocketAddr },
}

impl Command {
    pub fn tag(&self) -> &'static str {
        match self {
            Command::Discover { .. } => "discover",
            Command::DiscoverAck { .. } => "discover-ack",
            Command::LocatePredecessor { .. } => "locate-predecessor",
            Command::PredecessorAck { .. } => "predecessor-ack",
            Command::Proposal { .. } => "proposal",
            Command::ProposalAck { .. } => "proposal-ack",
            Command::Heartbeat { .. } => "heartbeat",
            Command::Alive { .. } => "alive?",
            Command::AliveAck { .. } => "alive-ack",
            Command::GetInfo { .. } => "get-info",
            Command::InfoAck { .. } => "info-ack",
            Command::GetValue { .. } => "get-value",
            Command::ValueAck { .. } => "value-ack",
            Command::ValueMissing { .. } => "value-missing",
            Command::SetValue { .. } => "set-value",
            Command::Ack { .. } => "ack",
            Command::Evict { .. } => "evict",
        }
    }
}

/// A decoded envelope.
///
/// `source` is the node replies go to. Forwarded requests keep the
/// originator here. `dest` is set once a hop has resolved the owner of a
/// routed request. `request_id` pairs a store reply with the request that
/// caused it and survives forwarding unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    pub source: SocketAddr,
    pub dest: Option<SocketAddr>,
    pub request_id: Option<u64>,
    pub command: Command,
}

impl Datagram {
    pub fn new(source: SocketAddr, command: Command) -> Self {
        Self {
            source,
            dest: None,
            request_id: None,
            command,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<u64>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn addressed_to(mut self, dest: SocketAddr) -> Self {
        self.dest = Some(dest);
        self
    }
}
