//! TCP transport for volumes: wire codec, server, client and health tracking.

pub mod client;
pub mod codec;
pub mod health;
pub mod server;

pub use client::VolumeClient;
pub use codec::{FrameHeader, HEADER_LEN, VolumeCodec, WireFrame};
pub use health::{HealthAlert, HealthMonitor, HealthSummary, TransportHealth};
pub use server::VolumeServer;
