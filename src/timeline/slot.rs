//! Retention slot wrapping one timeline volume

use log::warn;

use crate::volume::{SharedVolume, recycle_shared};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Strong hold, the volume is guaranteed present
    Retained,
    /// The volume may be reclaimed under memory pressure at any time
    Reclaimable,
    /// The volume went back to its pool; the entry is stale
    Evicted,
}

/// Holds a volume and returns it to its pool exactly once, on eviction.
pub struct ReclaimableSlot {
    volume: Option<SharedVolume>,
    state: SlotState,
}

impl ReclaimableSlot {
    pub fn retained(volume: SharedVolume) -> Self {
        Self {
            volume: Some(volume),
            state: SlotState::Retained,
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    /// The volume, unless it was evicted or reclaimed
    pub fn get(&self) -> Option<&SharedVolume> {
        self.volume.as_ref()
    }

    pub fn is_gone(&self) -> bool {
        self.volume.is_none()
    }

    /// Make the volume eligible for reclamation.
    pub fn soften(&mut self) {
        if self.state == SlotState::Retained {
            self.state = SlotState::Reclaimable;
        }
    }

    /// Memory-pressure hook: evict the volume if it is reclaimable.
    pub fn reclaim(&mut self) -> bool {
        if self.state != SlotState::Reclaimable {
            return false;
        }
        self.evict();
        true
    }

    pub fn evict(&mut self) {
        if let Some(volume) = self.volume.take() {
            let (channel, index) = (volume.channel, volume.time_index);
            if let Err(e) = recycle_shared(volume) {
                warn!(
                    "ReclaimableSlot: releasing channel {} time index {} failed: {}",
                    channel, index, e
                );
            }
        }
        self.state = SlotState::Evicted;
    }
}

impl Drop for ReclaimableSlot {
    fn drop(&mut self) {
        self.evict();
    }
}

impl std::fmt::Debug for ReclaimableSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReclaimableSlot")
            .field("state", &self.state)
            .field("present", &self.volume.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{BufferPool, ElementType, Shape};
    use std::sync::Arc;
    use std::time::Duration;

    fn slot(pool: &BufferPool) -> ReclaimableSlot {
        let shape = Shape::new(ElementType::U8, 1, 2, 2, 2);
        let volume = pool.acquire(Duration::from_millis(10), shape).unwrap();
        ReclaimableSlot::retained(Arc::new(volume))
    }

    #[test]
    fn test_retained_slot_ignores_reclaim() {
        let pool = BufferPool::new(1);
        let mut slot = slot(&pool);

        assert!(!slot.reclaim());
        assert_eq!(slot.state(), SlotState::Retained);
        assert!(slot.get().is_some());
    }

    #[test]
    fn test_reclaim_releases_once() {
        let pool = BufferPool::new(1);
        let mut slot = slot(&pool);

        slot.soften();
        assert_eq!(slot.state(), SlotState::Reclaimable);
        assert!(slot.reclaim());
        assert_eq!(slot.state(), SlotState::Evicted);
        assert!(slot.is_gone());
        assert_eq!(pool.checked_out(), 0);
        assert_eq!(pool.free(), 1);

        // evicted slots stay evicted
        assert!(!slot.reclaim());
        slot.soften();
        assert_eq!(slot.state(), SlotState::Evicted);
        drop(slot);
        assert_eq!(pool.free(), 1);
    }

    #[test]
    fn test_eviction_waits_for_downstream_holder() {
        let pool = BufferPool::new(1);
        let mut slot = slot(&pool);
        let downstream = slot.get().cloned().unwrap();

        slot.evict();
        assert_eq!(pool.checked_out(), 1);
        drop(downstream);
        assert_eq!(pool.checked_out(), 0);
    }
}
