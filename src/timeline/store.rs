//! Time-shifting volume store
//!
//! Routes inbound volumes into per-channel timelines, keeps them within the
//! memory horizon and forwards the volume selected for playback downstream.
//!
//! # Locking
//!
//! Every mutation (insert, eviction, selection, downstream push) runs under a
//! single store mutex. The downstream `accept` is invoked while that mutex is
//! held, so a slow downstream sink stalls further timeline mutation. The time
//! shift and the play/pause flag are atomics so they can be flipped without
//! waiting on the lock.

use log::{debug, trace, warn};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::channel::ChannelRegistry;
use super::horizon::MemoryHorizon;
use super::seek::SeekOutcome;
use super::slot::SlotState;
use crate::error::Result;
use crate::volume::{BufferPool, SharedVolume, VolumeSink};

struct StoreState {
    registry: ChannelRegistry,
    /// Every channel id seen since creation (or the last `close`)
    known_channels: BTreeSet<i32>,
    highest_seen: i64,
}

pub struct TimelineStore {
    state: Mutex<StoreState>,
    downstream: Arc<dyn VolumeSink>,
    horizon: MemoryHorizon,
    time_shift: AtomicI64,
    playing: AtomicBool,
}

impl TimelineStore {
    pub fn new(horizon: MemoryHorizon, downstream: Arc<dyn VolumeSink>) -> Self {
        Self {
            state: Mutex::new(StoreState {
                registry: ChannelRegistry::new(),
                known_channels: BTreeSet::new(),
                highest_seen: 0,
            }),
            downstream,
            horizon,
            time_shift: AtomicI64::new(0),
            playing: AtomicBool::new(true),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn soft_horizon(&self) -> i64 {
        self.horizon.soft()
    }

    pub fn hard_horizon(&self) -> i64 {
        self.horizon.hard()
    }

    /// Set the playback offset directly; picked up by the next selection.
    pub fn set_time_shift(&self, offset: i64) {
        self.time_shift.store(offset, Ordering::SeqCst);
    }

    pub fn time_shift(&self) -> i64 {
        self.time_shift.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.playing.store(false, Ordering::SeqCst);
    }

    pub fn play(&self) {
        self.playing.store(true, Ordering::SeqCst);
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    /// Highest time index seen on any channel
    pub fn highest_time_index_seen(&self) -> i64 {
        self.lock().highest_seen
    }

    pub fn available_channels(&self) -> Vec<i32> {
        self.lock().known_channels.iter().copied().collect()
    }

    /// Number of entries (including stale ones) held for `channel`
    pub fn channel_len(&self, channel: i32) -> usize {
        self.lock()
            .registry
            .get(channel)
            .map_or(0, |timeline| timeline.len())
    }

    pub fn slot_state(&self, channel: i32, time_index: i64) -> Option<SlotState> {
        self.lock()
            .registry
            .get(channel)
            .and_then(|timeline| timeline.state_of(time_index))
    }

    /// Volume that playback currently shows for `channel`
    pub fn select_for_playback(&self, channel: i32) -> Option<SharedVolume> {
        let mut state = self.lock();
        let target = state.highest_seen + self.time_shift();
        state
            .registry
            .get_mut(channel)
            .and_then(|timeline| timeline.select_for_playback(target))
    }

    /// Recompute the time shift from a ratio in `[-1, 1]` of the retained window.
    ///
    /// A positive ratio moves backward in time. When paused and the shift
    /// changed, the newly selected volume of every known channel is pushed
    /// downstream right away.
    pub fn apply_normalized_shift(&self, ratio: f64) -> SeekOutcome {
        let ratio = ratio.clamp(-1.0, 1.0);
        let mut state = self.lock();

        let previous = self.time_shift();
        let start = (state.highest_seen - self.horizon.hard()).max(0);
        let interval = state.highest_seen - start;
        let time_shift = -((interval as f64 * ratio + 0.5).floor() as i64);
        self.time_shift.store(time_shift, Ordering::SeqCst);
        debug!(
            "TimelineStore: seek ratio {:.3} over [{}, {}] -> time shift {}",
            ratio, start, state.highest_seen, time_shift
        );

        let mut pushed = 0;
        if !self.is_playing() && previous != time_shift {
            let channels: Vec<i32> = state.known_channels.iter().copied().collect();
            for channel in channels {
                match self.push_selected(&mut state, channel) {
                    Ok(true) => pushed += 1,
                    Ok(false) => {}
                    Err(e) => warn!(
                        "TimelineStore: pushing channel {} after seek failed: {}",
                        channel, e
                    ),
                }
                self.run_eviction(&mut state);
            }
        }

        SeekOutcome {
            sequence: 0,
            ratio,
            previous,
            time_shift,
            pushed,
        }
    }

    /// Memory-pressure hook: reclaim one reclaimable entry.
    pub fn reclaim(&self, channel: i32, time_index: i64) -> bool {
        self.lock()
            .registry
            .get_mut(channel)
            .is_some_and(|timeline| timeline.reclaim(time_index))
    }

    /// Memory-pressure hook: reclaim up to `budget` reclaimable entries, oldest first.
    pub fn reclaim_oldest(&self, budget: usize) -> usize {
        let mut state = self.lock();
        let mut candidates: Vec<(i64, i32)> = Vec::new();
        for channel in state.registry.channels().collect::<Vec<_>>() {
            if let Some(timeline) = state.registry.get(channel) {
                candidates.extend(timeline.reclaimable().into_iter().map(|key| (key, channel)));
            }
        }
        candidates.sort_unstable();

        let mut reclaimed = 0;
        for (time_index, channel) in candidates.into_iter().take(budget) {
            if let Some(timeline) = state.registry.get_mut(channel) {
                if timeline.reclaim(time_index) {
                    reclaimed += 1;
                }
            }
        }
        if reclaimed > 0 {
            debug!("TimelineStore: reclaimed {} volumes", reclaimed);
        }
        reclaimed
    }

    /// Release every held volume and forget all channels.
    pub fn close(&self) {
        let mut state = self.lock();
        state.registry.clear();
        state.known_channels.clear();
        debug!("TimelineStore: closed");
    }

    fn push_selected(&self, state: &mut StoreState, channel: i32) -> Result<bool> {
        let target = state.highest_seen + self.time_shift();
        let selected = state
            .registry
            .get_mut(channel)
            .and_then(|timeline| timeline.select_for_playback(target));

        match selected {
            Some(volume) => {
                trace!(
                    "TimelineStore: channel {} -> time index {}",
                    channel, volume.time_index
                );
                self.downstream.accept(volume)?;
                Ok(true)
            }
            None => {
                debug!("TimelineStore: nothing to send for channel {}", channel);
                Ok(false)
            }
        }
    }

    fn run_eviction(&self, state: &mut StoreState) {
        if !self.horizon.is_cleanup_due(state.highest_seen) {
            return;
        }
        let report = state.registry.evict_all(&self.horizon);
        if report.dropped + report.softened + report.stale_removed > 0 {
            debug!(
                "TimelineStore: eviction at {}: {} softened, {} dropped, {} stale",
                state.highest_seen, report.softened, report.dropped, report.stale_removed
            );
        }
    }
}

impl VolumeSink for TimelineStore {
    fn accept(&self, volume: SharedVolume) -> Result<()> {
        let mut state = self.lock();
        let channel = volume.channel;
        let time_index = volume.time_index;

        state.known_channels.insert(channel);
        state.registry.get_or_create(channel).insert(time_index, volume);
        state.highest_seen = state.highest_seen.max(time_index);

        let pushed = if self.is_playing() {
            self.push_selected(&mut state, channel).map(|_| ())
        } else {
            Ok(())
        };
        self.run_eviction(&mut state);
        pushed
    }

    fn pool(&self) -> BufferPool {
        self.downstream.pool()
    }
}

impl Drop for TimelineStore {
    fn drop(&mut self) {
        self.close();
    }
}
