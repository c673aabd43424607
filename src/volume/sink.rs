//! Push-style volume sinks
//!
//! A sink receives volumes and names the pool that owns the buffers flowing
//! through it, so upstream producers can acquire compatible buffers. Sinks
//! compose into chains: client → timeline store → renderer.

use log::{trace, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::pool::BufferPool;
use super::types::{SharedVolume, recycle_shared};
use crate::error::Result;

pub trait VolumeSink: Send + Sync {
    /// Push a volume downstream
    fn accept(&self, volume: SharedVolume) -> Result<()>;

    /// Pool owning the buffers that flow through this sink
    fn pool(&self) -> BufferPool;
}

/// Forwards every volume to the next sink unchanged.
pub struct RelaySink {
    next: Arc<dyn VolumeSink>,
}

impl RelaySink {
    pub fn new(next: Arc<dyn VolumeSink>) -> Self {
        Self { next }
    }
}

impl VolumeSink for RelaySink {
    fn accept(&self, volume: SharedVolume) -> Result<()> {
        self.next.accept(volume)
    }

    fn pool(&self) -> BufferPool {
        self.next.pool()
    }
}

/// Terminal sink that lets go of every volume it receives.
pub struct DiscardSink {
    pool: BufferPool,
}

impl DiscardSink {
    pub fn new(pool: BufferPool) -> Self {
        Self { pool }
    }
}

impl VolumeSink for DiscardSink {
    fn accept(&self, volume: SharedVolume) -> Result<()> {
        trace!(
            "DiscardSink: channel {} time index {}",
            volume.channel, volume.time_index
        );
        recycle_shared(volume)
    }

    fn pool(&self) -> BufferPool {
        self.pool.clone()
    }
}

/// Terminal sink handing volumes to another thread (typically a renderer)
/// through a bounded channel. When the consumer falls behind, volumes are
/// skipped rather than queued without bound.
pub struct QueueSink {
    pool: BufferPool,
    tx: mpsc::Sender<SharedVolume>,
}

impl QueueSink {
    pub fn new(pool: BufferPool, capacity: usize) -> (Self, mpsc::Receiver<SharedVolume>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { pool, tx }, rx)
    }
}

impl VolumeSink for QueueSink {
    fn accept(&self, volume: SharedVolume) -> Result<()> {
        match self.tx.try_send(volume) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(volume)) => {
                warn!(
                    "QueueSink: consumer behind, skipping channel {} time index {}",
                    volume.channel, volume.time_index
                );
                recycle_shared(volume)
            }
            Err(mpsc::error::TrySendError::Closed(volume)) => {
                trace!("QueueSink: consumer gone");
                recycle_shared(volume)
            }
        }
    }

    fn pool(&self) -> BufferPool {
        self.pool.clone()
    }
}
