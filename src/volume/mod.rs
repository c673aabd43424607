//! Volumes, the buffer pool that recycles them, and the sinks they flow into.

pub mod pool;
pub mod sink;
pub mod types;

pub use pool::BufferPool;
pub use sink::{DiscardSink, QueueSink, RelaySink, VolumeSink};
pub use types::{ElementType, Shape, SharedVolume, Volume, recycle_shared};
