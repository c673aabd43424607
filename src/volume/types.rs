//! Core types for volumetric frames

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::pool::Lease;
use crate::error::{Error, Result};

/// Voxel element type
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    #[default]
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl ElementType {
    /// Size of one element in bytes
    pub fn size(&self) -> usize {
        match self {
            ElementType::U8 | ElementType::I8 => 1,
            ElementType::U16 | ElementType::I16 => 2,
            ElementType::U32 | ElementType::I32 | ElementType::F32 => 4,
            ElementType::F64 => 8,
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ElementType::U8 => "u8",
            ElementType::I8 => "i8",
            ElementType::U16 => "u16",
            ElementType::I16 => "i16",
            ElementType::U32 => "u32",
            ElementType::I32 => "i32",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// Layout of a volume buffer: element type, components per voxel and extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub element_type: ElementType,
    /// Number of components per voxel (e.g. 1 for grey levels)
    pub components: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Shape {
    pub fn new(
        element_type: ElementType,
        components: u32,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Self {
        Self {
            element_type,
            components,
            width,
            height,
            depth,
        }
    }

    /// Build a shape from signed wire dimensions, rejecting non-positive extents.
    pub fn from_dims(element_type: ElementType, components: u32, dims: [i32; 3]) -> Result<Self> {
        let [x, y, z] = dims;
        if x <= 0 || y <= 0 || z <= 0 {
            return Err(Error::MalformedFrame(format!(
                "non-positive dimensions {x}x{y}x{z}"
            )));
        }
        Ok(Self::new(
            element_type,
            components,
            x as u32,
            y as u32,
            z as u32,
        ))
    }

    /// Bytes per voxel (element size times components)
    pub fn voxel_bytes(&self) -> usize {
        self.element_type.size() * self.components as usize
    }

    /// Number of voxels, `None` if it does not fit in a `u64`
    pub fn voxel_count(&self) -> Option<u64> {
        u64::from(self.width)
            .checked_mul(u64::from(self.height))?
            .checked_mul(u64::from(self.depth))
    }

    /// Size in bytes of a buffer holding this shape, `None` if not addressable
    pub fn byte_len(&self) -> Option<usize> {
        let voxels = usize::try_from(self.voxel_count()?).ok()?;
        let voxel_bytes = self
            .element_type
            .size()
            .checked_mul(usize::try_from(self.components).ok()?)?;
        voxels.checked_mul(voxel_bytes)
    }

    /// Like [`byte_len`](Self::byte_len), reporting an unaddressable shape as an error
    pub fn checked_byte_len(&self) -> Result<usize> {
        self.byte_len().ok_or(Error::Oversized(*self))
    }

    pub fn dims(&self) -> [u32; 3] {
        [self.width, self.height, self.depth]
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{}x{} {}x{}",
            self.width, self.height, self.depth, self.element_type, self.components
        )
    }
}

/// Volume shared between the timeline, the network layer and downstream sinks
pub type SharedVolume = Arc<Volume>;

/// A single timestamped, channel-tagged 3D sample buffer.
///
/// Volumes handed out by a [`BufferPool`](super::BufferPool) carry a lease and
/// return their buffer to that pool when released or dropped. A volume is not
/// `Clone`; sharing goes through [`SharedVolume`].
pub struct Volume {
    /// Logical stream this volume belongs to
    pub channel: i32,

    /// Monotonic index of this volume within its channel
    pub time_index: i64,

    /// Acquisition time in seconds
    pub timestamp: f64,

    shape: Shape,
    data: Vec<u8>,
    lease: Option<Lease>,
}

impl Volume {
    /// Allocate a volume outside of any pool, zero-filled.
    pub fn unpooled(shape: Shape) -> Result<Self> {
        Ok(Self {
            channel: 0,
            time_index: 0,
            timestamp: 0.0,
            shape,
            data: vec![0; shape.checked_byte_len()?],
            lease: None,
        })
    }

    pub(crate) fn leased(shape: Shape, data: Vec<u8>, lease: Lease) -> Self {
        debug_assert_eq!(Some(data.len()), shape.byte_len());
        Self {
            channel: 0,
            time_index: 0,
            timestamp: 0.0,
            shape,
            data,
            lease: Some(lease),
        }
    }

    /// Set channel, time index and timestamp in one go
    pub fn stamp(&mut self, channel: i32, time_index: i64, timestamp: f64) {
        self.channel = channel;
        self.time_index = time_index;
        self.timestamp = timestamp;
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn dims(&self) -> [u32; 3] {
        self.shape.dims()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Identifier of the pool buffer backing this volume, if pooled
    pub fn buffer_id(&self) -> Option<u64> {
        self.lease.as_ref().map(|lease| lease.id)
    }

    pub fn is_pooled(&self) -> bool {
        self.lease.is_some()
    }

    /// Return the buffer to the pool that lent it.
    pub fn recycle(self) -> Result<()> {
        let origin = self.lease.as_ref().and_then(Lease::pool);
        match origin {
            Some(pool) => pool.release(self),
            None => Ok(()),
        }
    }

    pub(crate) fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    pub(crate) fn take_lease(&mut self) -> Option<Lease> {
        self.lease.take()
    }

    pub(crate) fn take_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    #[cfg(test)]
    pub(crate) fn counterfeit(shape: Shape, lease: Lease) -> Self {
        Self::leased(shape, vec![0; shape.checked_byte_len().unwrap()], lease)
    }
}

/// Release a shared volume.
///
/// If this is the last reference the buffer goes straight back to its pool,
/// otherwise it returns when the last holder drops it.
pub fn recycle_shared(volume: SharedVolume) -> Result<()> {
    match Arc::try_unwrap(volume) {
        Ok(volume) => volume.recycle(),
        Err(_still_shared) => Ok(()),
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            let data = self.take_data();
            lease.give_back(self.shape, data);
        }
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("Volume");
        debug
            .field("channel", &self.channel)
            .field("time_index", &self.time_index)
            .field("timestamp", &self.timestamp)
            .field("shape", &self.shape)
            .field("size", &self.byte_len());

        if let Some(id) = self.buffer_id() {
            debug.field("buffer_id", &id);
        }

        debug.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_sizes() {
        let shape = Shape::new(ElementType::U16, 2, 8, 9, 10);
        assert_eq!(shape.voxel_bytes(), 4);
        assert_eq!(shape.voxel_count(), Some(720));
        assert_eq!(shape.byte_len(), Some(2880));
    }

    #[test]
    fn test_shape_size_overflow() {
        // 2^21 * 2^21 * 2^22 voxels wraps a u64 to zero
        let shape = Shape::new(ElementType::U8, 1, 1 << 21, 1 << 21, 1 << 22);
        assert_eq!(shape.voxel_count(), None);
        assert_eq!(shape.byte_len(), None);
        assert!(matches!(shape.checked_byte_len(), Err(Error::Oversized(_))));
        assert!(Volume::unpooled(shape).is_err());

        let wide = Shape::new(ElementType::F64, u32::MAX, u32::MAX, u32::MAX, 1);
        assert!(wide.voxel_count().is_some());
        assert_eq!(wide.byte_len(), None);
    }

    #[test]
    fn test_shape_from_dims_rejects_non_positive() {
        assert!(Shape::from_dims(ElementType::U8, 1, [4, 0, 4]).is_err());
        assert!(Shape::from_dims(ElementType::U8, 1, [-1, 4, 4]).is_err());
        let shape = Shape::from_dims(ElementType::F32, 1, [2, 3, 4]).unwrap();
        assert_eq!(shape.byte_len(), Some(96));
    }

    #[test]
    fn test_unpooled_volume() {
        let mut volume = Volume::unpooled(Shape::new(ElementType::U8, 1, 2, 2, 2)).unwrap();
        volume.stamp(3, 42, 4.2);
        volume.data_mut()[7] = 9;

        assert_eq!(volume.channel, 3);
        assert_eq!(volume.time_index, 42);
        assert_eq!(volume.data()[7], 9);
        assert!(!volume.is_pooled());
        assert!(volume.recycle().is_ok());
    }
}
