//! Wire codec for volume frames
//!
//! Each frame is a fixed 40-byte big-endian header followed by the raw
//! payload:
//!
//! ```text
//! i32 channel | i64 time index | f64 timestamp (s) | i32 dim x | i32 dim y
//! | i32 dim z | i64 payload length | payload bytes
//! ```
//!
//! The payload length must equal `x * y * z * voxel bytes` for the element
//! layout the receiver is configured with. Frames that disagree are rejected
//! and the connection is expected to close; there is no resynchronization.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio_util::codec::{Decoder, Encoder};

use crate::assets::DEFAULT_MAX_PAYLOAD_BYTES;
use crate::error::{Error, Result};
use crate::volume::{BufferPool, ElementType, Shape, SharedVolume, Volume};

/// Size of the fixed frame header in bytes
pub const HEADER_LEN: usize = 4 + 8 + 8 + 3 * 4 + 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    pub channel: i32,
    pub time_index: i64,
    pub timestamp: f64,
    pub dims: [i32; 3],
    pub payload_len: i64,
}

impl FrameHeader {
    /// Header describing `volume`.
    pub fn for_volume(volume: &Volume) -> Result<Self> {
        let payload_len = i64::try_from(volume.byte_len())
            .map_err(|_| Error::MalformedFrame(format!("{} payload too long", volume.shape())))?;

        Ok(Self {
            channel: volume.channel,
            time_index: volume.time_index,
            timestamp: volume.timestamp,
            dims: Self::wire_dims(volume.shape())?,
            payload_len,
        })
    }

    /// Signed wire extents of `shape`; extents above `i32::MAX` have no wire form.
    pub fn wire_dims(shape: Shape) -> Result<[i32; 3]> {
        let [x, y, z] = shape.dims().map(i32::try_from);
        match (x, y, z) {
            (Ok(x), Ok(y), Ok(z)) => Ok([x, y, z]),
            _ => Err(Error::MalformedFrame(format!(
                "{} does not fit the wire header",
                shape
            ))),
        }
    }

    pub fn write(&self, dst: &mut impl BufMut) {
        dst.put_i32(self.channel);
        dst.put_i64(self.time_index);
        dst.put_f64(self.timestamp);
        for dim in self.dims {
            dst.put_i32(dim);
        }
        dst.put_i64(self.payload_len);
    }

    /// Read a header; `src` must hold at least [`HEADER_LEN`] bytes.
    pub fn read(src: &mut impl Buf) -> Self {
        Self {
            channel: src.get_i32(),
            time_index: src.get_i64(),
            timestamp: src.get_f64(),
            dims: [src.get_i32(), src.get_i32(), src.get_i32()],
            payload_len: src.get_i64(),
        }
    }

    /// Check the header against the receiver's element layout.
    pub fn validate(&self, element_type: ElementType, components: u32, max_payload: u64) -> Result<Shape> {
        let shape = Shape::from_dims(element_type, components, self.dims)?;
        let expected = shape.byte_len().ok_or_else(|| {
            Error::MalformedFrame(format!("{} exceeds addressable memory", shape))
        })?;

        if u64::try_from(self.payload_len).ok() != u64::try_from(expected).ok() {
            return Err(Error::MalformedFrame(format!(
                "payload length {} does not match {} ({} bytes expected)",
                self.payload_len, shape, expected
            )));
        }
        if expected as u64 > max_payload {
            return Err(Error::MalformedFrame(format!(
                "payload length {} exceeds limit of {} bytes",
                self.payload_len, max_payload
            )));
        }
        Ok(shape)
    }
}

/// A decoded frame whose payload still lives in the network buffer.
#[derive(Debug, Clone)]
pub struct WireFrame {
    pub header: FrameHeader,
    pub shape: Shape,
    pub payload: Bytes,
}

impl WireFrame {
    /// Copy the frame into a volume acquired from `pool`.
    pub fn materialize(&self, pool: &BufferPool, timeout: Duration) -> Result<Volume> {
        let mut volume = pool.acquire(timeout, self.shape)?;
        volume.data_mut().copy_from_slice(&self.payload);
        volume.stamp(
            self.header.channel,
            self.header.time_index,
            self.header.timestamp,
        );
        Ok(volume)
    }
}

/// Framing for volume streams, usable with `FramedRead` / `FramedWrite`.
#[derive(Debug, Clone)]
pub struct VolumeCodec {
    element_type: ElementType,
    components: u32,
    max_payload: u64,
    /// Header already consumed while waiting for the rest of the payload
    pending: Option<(FrameHeader, Shape)>,
}

impl VolumeCodec {
    pub fn new(element_type: ElementType, components: u32) -> Self {
        Self {
            element_type,
            components,
            max_payload: DEFAULT_MAX_PAYLOAD_BYTES,
            pending: None,
        }
    }

    pub fn with_max_payload(mut self, max_payload: u64) -> Self {
        self.max_payload = max_payload;
        self
    }
}

impl Default for VolumeCodec {
    fn default() -> Self {
        Self::new(ElementType::U8, 1)
    }
}

impl Decoder for VolumeCodec {
    type Item = WireFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WireFrame>> {
        let (header, shape) = match self.pending {
            Some(pending) => pending,
            None => {
                if src.len() < HEADER_LEN {
                    src.reserve(HEADER_LEN - src.len());
                    return Ok(None);
                }
                let header = FrameHeader::read(src);
                let shape = header.validate(self.element_type, self.components, self.max_payload)?;
                self.pending = Some((header, shape));
                (header, shape)
            }
        };

        let len = header.payload_len as usize;
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        self.pending = None;
        let payload = src.split_to(len).freeze();
        Ok(Some(WireFrame {
            header,
            shape,
            payload,
        }))
    }
}

impl Encoder<SharedVolume> for VolumeCodec {
    type Error = Error;

    fn encode(&mut self, volume: SharedVolume, dst: &mut BytesMut) -> Result<()> {
        let header = FrameHeader::for_volume(&volume)?;
        dst.reserve(HEADER_LEN + volume.byte_len());
        header.write(dst);
        dst.extend_from_slice(volume.data());
        Ok(())
    }
}
