//! Defaults for the fetch module (timeouts, chunking, checkpoints).

use std::time::Duration;

/// Default HTTP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default idle time after which a connection counts as stalled.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default size of a disk write.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default maximum time between progress checkpoints.
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(1);

/// Default maximum bytes written between progress checkpoints.
pub const DEFAULT_CHECKPOINT_BYTES: u64 = 1024 * 1024;

/// Extra tries for a checkpoint whose store write hit a lock or a full pool.
pub const CHECKPOINT_STORE_RETRIES: u32 = 3;

/// Wait before the first extra checkpoint try; doubles on each further try.
pub const CHECKPOINT_STORE_BACKOFF: Duration = Duration::from_millis(50);

/// Maximum honoured `Retry-After` value.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);
