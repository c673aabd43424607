//! Volumetric frame streaming with time-shift playback.
//!
//! Volumes travel from a producer's [`BufferPool`] over TCP
//! ([`VolumeServer`] → [`VolumeClient`]) into a [`TimelineStore`], which keeps
//! a bounded history per channel and forwards the volume selected for
//! playback to a downstream [`VolumeSink`]. A [`SeekController`] moves the
//! playback position inside that history.

pub mod assets;
pub mod config;
pub mod error;
pub mod net;
pub mod timeline;
pub mod utils;
pub mod volume;

pub use config::Config;
pub use error::{Error, Result};
pub use net::{HealthMonitor, TransportHealth, VolumeClient, VolumeCodec, VolumeServer};
pub use timeline::{MemoryHorizon, SeekController, SeekOutcome, SlotState, TimelineStore};
pub use volume::{
    BufferPool, DiscardSink, ElementType, QueueSink, RelaySink, Shape, SharedVolume, Volume,
    VolumeSink,
};
