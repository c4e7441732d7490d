pub mod messages;
pub mod node;
pub mod transport;

use crate::chord::{
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_JOIN_TIMEOUT, DEFAULT_REPLICATION_FACTOR,
    DEFAULT_REQUEST_TIMEOUT, DEFAULT_RING_BITS,
};
use crate::error::ConfigError;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct PeerConfig {
    /// Address to bind; port 0 picks a free port and the identity follows it
    pub bind_addr: SocketAddr,
    /// Ring size exponent `m`; every node of a ring must agree on it
    pub ring_bits: u8,
    /// Period of both heartbeat tasks and the wait for each probe
    pub heartbeat_interval: Duration,
    pub join_timeout: Duration,
    pub request_timeout: Duration,
    /// Accepted for command-line compatibility; keys are not replicated
    pub replication_factor: u32,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ring_bits: DEFAULT_RING_BITS,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            replication_factor: DEFAULT_REPLICATION_FACTOR,
        }
    }
}

impl PeerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_bits == 0 || self.ring_bits > 63 {
            return Err(ConfigError::InvalidRingBits(self.ring_bits));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidDuration("heartbeat interval"));
        }
        if self.join_timeout.is_zero() {
            return Err(ConfigError::InvalidDuration("join timeout"));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidDuration("request timeout"));
        }
        Ok(())
    }
}
