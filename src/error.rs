use thiserror::Error;

#[derive(Error, Debug)]
pub enum RingletError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Chord protocol error: {0}")]
    Chord(#[from] ChordError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Send to {addr} failed: {reason}")]
    SendFailed { addr: String, reason: String },

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

/// Which part of the join handshake never arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStage {
    Successor,
    Predecessor,
    Both,
}

impl std::fmt::Display for JoinStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinStage::Successor => write!(f, "discover-ack"),
            JoinStage::Predecessor => write!(f, "predecessor-ack"),
            JoinStage::Both => write!(f, "discover-ack and predecessor-ack"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ChordError {
    #[error("Join timed out waiting for {missing}")]
    JoinTimedOut { missing: JoinStage },

    #[error("Join already in progress or node is already a ring member")]
    AlreadyJoined,

    #[error("Request for key {0} timed out")]
    RequestTimedOut(String),

    #[error("Chord actor is not running")]
    ActorStopped,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Failed to serialize message: {0}")]
    SerializationFailed(String),

    #[error("Failed to deserialize message: {0}")]
    DeserializationFailed(String),

    #[error("Unknown command tag: {0}")]
    UnknownTag(String),

    #[error("Invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("Datagram of {0} bytes exceeds the UDP payload limit")]
    TooLarge(usize),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Ring size exponent must be within 1..=63, got {0}")]
    InvalidRingBits(u8),

    #[error("{0} must be greater than zero")]
    InvalidDuration(&'static str),
}
