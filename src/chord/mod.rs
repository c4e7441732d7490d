pub mod actor;
pub mod routing;
pub mod types;
pub mod workers;

use std::time::Duration;

// Ring configuration defaults
pub const DEFAULT_RING_BITS: u8 = 16;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_REPLICATION_FACTOR: u32 = 2;

/// Depth of the actor's request queue
pub const ACTOR_QUEUE_SIZE: usize = 64;
/// Buffered ring events per subscriber before the slowest one lags
pub const EVENT_CAPACITY: usize = 256;
