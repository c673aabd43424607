// connections

/// Standard TCP port volume servers listen on.
pub const STANDARD_TCP_PORT: u16 = 9140;
pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
/// How long a server connection waits for a queued volume before idling.
pub const DEFAULT_IDLE_WAIT_MS: u64 = 20;
pub const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 1 << 30;
pub const KEEPALIVE_SECS: u64 = 20;

// buffers
pub const DEFAULT_POOL_CAPACITY: usize = 20;
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 10;

// time-shift horizons, in time points
pub const DEFAULT_SOFT_HORIZON: i64 = 100;
pub const DEFAULT_HARD_HORIZON: i64 = 400;
pub const DEFAULT_CLEANUP_FRACTION: f64 = 0.25;
