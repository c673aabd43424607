//! Per-channel time-indexed volume timeline

use log::{debug, trace};
use std::collections::BTreeMap;

use super::horizon::{MemoryHorizon, Retention};
use super::slot::{ReclaimableSlot, SlotState};
use crate::volume::SharedVolume;

/// Counts from one eviction pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvictionReport {
    pub softened: usize,
    pub dropped: usize,
    pub stale_removed: usize,
}

impl EvictionReport {
    fn merge(&mut self, other: EvictionReport) {
        self.softened += other.softened;
        self.dropped += other.dropped;
        self.stale_removed += other.stale_removed;
    }
}

/// Ordered map from time index to retention slot for one channel.
pub struct ChannelTimeline {
    channel: i32,
    slots: BTreeMap<i64, ReclaimableSlot>,
}

impl ChannelTimeline {
    pub fn new(channel: i32) -> Self {
        Self {
            channel,
            slots: BTreeMap::new(),
        }
    }

    pub fn channel(&self) -> i32 {
        self.channel
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn newest(&self) -> Option<i64> {
        self.slots.keys().next_back().copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = i64> + '_ {
        self.slots.keys().copied()
    }

    pub fn state_of(&self, time_index: i64) -> Option<SlotState> {
        self.slots.get(&time_index).map(ReclaimableSlot::state)
    }

    /// Insert a volume, releasing whatever previously sat at the same index.
    pub fn insert(&mut self, time_index: i64, volume: SharedVolume) {
        if let Some(mut previous) = self
            .slots
            .insert(time_index, ReclaimableSlot::retained(volume))
        {
            trace!(
                "ChannelTimeline {}: replacing time index {}",
                self.channel, time_index
            );
            previous.evict();
        }
    }

    /// Pick the volume at `floor(target)`, else `ceiling(target)`.
    ///
    /// Entries whose volume is gone are removed and the lookup repeats; every
    /// retry shrinks the map, so at most `len()` rounds run.
    pub fn select_for_playback(&mut self, target: i64) -> Option<SharedVolume> {
        for _ in 0..self.slots.len() {
            let key = self
                .slots
                .range(..=target)
                .next_back()
                .or_else(|| self.slots.range(target..).next())
                .map(|(key, _)| *key)?;

            if let Some(volume) = self.slots.get(&key).and_then(ReclaimableSlot::get) {
                return Some(volume.clone());
            }

            debug!(
                "ChannelTimeline {}: dropping stale entry at time index {}",
                self.channel, key
            );
            self.slots.remove(&key);
        }
        None
    }

    /// Apply the two-tier horizon relative to this channel's newest entry.
    pub fn evict(&mut self, horizon: &MemoryHorizon) -> EvictionReport {
        let mut report = EvictionReport::default();
        let Some(newest) = self.newest() else {
            return report;
        };

        let first_kept = newest.saturating_sub(horizon.hard()).saturating_add(1);
        let kept = self.slots.split_off(&first_kept);
        let expired = std::mem::replace(&mut self.slots, kept);
        for (_, mut slot) in expired {
            slot.evict();
            report.dropped += 1;
        }

        let mut stale = Vec::new();
        for (key, slot) in self.slots.iter_mut() {
            // everything past the hard horizon was split off above
            if horizon.classify(newest, *key) == Retention::Retain {
                break;
            }
            if slot.is_gone() {
                stale.push(*key);
            } else if slot.state() == SlotState::Retained {
                slot.soften();
                report.softened += 1;
            }
        }
        for key in stale {
            self.slots.remove(&key);
            report.stale_removed += 1;
        }

        report
    }

    /// Reclaim the volume at `time_index` if it is reclaimable.
    pub fn reclaim(&mut self, time_index: i64) -> bool {
        self.slots
            .get_mut(&time_index)
            .is_some_and(ReclaimableSlot::reclaim)
    }

    /// Time indices of reclaimable slots, oldest first
    pub fn reclaimable(&self) -> Vec<i64> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.state() == SlotState::Reclaimable)
            .map(|(key, _)| *key)
            .collect()
    }

    /// Release every volume and forget all entries.
    pub fn clear(&mut self) {
        for (_, mut slot) in std::mem::take(&mut self.slots) {
            slot.evict();
        }
    }
}

/// Channel id → timeline, created on first sight of a channel.
#[derive(Default)]
pub struct ChannelRegistry {
    timelines: BTreeMap<i32, ChannelTimeline>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, channel: i32) -> &mut ChannelTimeline {
        self.timelines.entry(channel).or_insert_with(|| {
            debug!("ChannelRegistry: new channel {}", channel);
            ChannelTimeline::new(channel)
        })
    }

    pub fn get(&self, channel: i32) -> Option<&ChannelTimeline> {
        self.timelines.get(&channel)
    }

    pub fn get_mut(&mut self, channel: i32) -> Option<&mut ChannelTimeline> {
        self.timelines.get_mut(&channel)
    }

    pub fn len(&self) -> usize {
        self.timelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timelines.is_empty()
    }

    pub fn channels(&self) -> impl Iterator<Item = i32> + '_ {
        self.timelines.keys().copied()
    }

    /// Run eviction on every channel and drop channels left empty.
    pub fn evict_all(&mut self, horizon: &MemoryHorizon) -> EvictionReport {
        let mut report = EvictionReport::default();
        for timeline in self.timelines.values_mut() {
            report.merge(timeline.evict(horizon));
        }
        self.timelines.retain(|channel, timeline| {
            if timeline.is_empty() {
                debug!("ChannelRegistry: channel {} emptied, removing", channel);
            }
            !timeline.is_empty()
        });
        report
    }

    pub fn clear(&mut self) {
        for timeline in self.timelines.values_mut() {
            timeline.clear();
        }
        self.timelines.clear();
    }
}
