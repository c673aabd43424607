//! Time-shifting cache of recently seen volumes
//!
//! Volumes are kept per channel in time-index order. The newest `soft`
//! time points are always retained, older ones up to `hard` become
//! reclaimable, and anything older is returned to its pool. A
//! [`SeekController`] moves the playback position inside that window.

pub mod channel;
pub mod horizon;
pub mod seek;
pub mod slot;
pub mod store;

pub use channel::{ChannelRegistry, ChannelTimeline, EvictionReport};
pub use horizon::{MemoryHorizon, Retention};
pub use seek::{SeekController, SeekOutcome};
pub use slot::{ReclaimableSlot, SlotState};
pub use store::TimelineStore;
