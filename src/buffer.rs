//! Frame buffer descriptors.
//!
//! A [`Buffer`] describes one piece of frame memory plus the identity and
//! capture metadata that travel with it through a stream's pipeline. The
//! descriptor itself is moved by value: at any moment exactly one owner
//! (a pool's idle list, a caller between acquire and return, a pipeline
//! node, a tunnel) holds it. The backing memory is reference counted so
//! the allocation outlives descriptor moves.

use crate::clock::ClockTime;
use crate::memory::MemorySegment;
use std::fmt;
use std::ops::BitOr;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Identifier of a buffer pool, generated by the buffer manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(pub u64);

/// Identifier of a capture request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CaptureId(pub u64);

/// Identifier of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool#{}", self.0)
    }
}

impl fmt::Display for CaptureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "capture#{}", self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Outcome carried by a buffer coming back from the pipeline.
///
/// This is data, not an error channel: a `Drop` or `Invalid` buffer is
/// still returned to its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferStatus {
    /// Frame content is valid.
    #[default]
    Ok,
    /// Frame was dropped (flushed or cancelled).
    Drop,
    /// Buffer could not be correlated with any request.
    Invalid,
}

/// Pixel layout of a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
    /// YUV 4:2:0, interleaved UV plane.
    #[default]
    Nv12,
    /// YUV 4:2:0, interleaved VU plane.
    Nv21,
    /// YUV 4:2:2 packed.
    Yuyv,
    /// 32-bit RGBA.
    Rgba8888,
    /// 10-bit packed Bayer raw.
    Raw10,
    /// Compressed JPEG blob.
    Jpeg,
    /// H.264 elementary stream.
    H264,
    /// H.265 elementary stream.
    H265,
}

impl PixelFormat {
    /// Bytes needed for one frame with the given dimensions.
    ///
    /// Compressed formats reserve the uncompressed NV12 size.
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Nv12 | PixelFormat::Nv21 => pixels * 3 / 2,
            PixelFormat::Yuyv => pixels * 2,
            PixelFormat::Rgba8888 => pixels * 4,
            PixelFormat::Raw10 => pixels * 5 / 4,
            PixelFormat::Jpeg | PixelFormat::H264 | PixelFormat::H265 => pixels * 3 / 2,
        }
    }

    /// Row stride in bytes for the first plane.
    pub fn stride(&self, width: u32) -> u32 {
        match self {
            PixelFormat::Yuyv => width * 2,
            PixelFormat::Rgba8888 => width * 4,
            PixelFormat::Raw10 => width * 5 / 4,
            _ => width,
        }
    }

    /// Encode-type tag implied by this format.
    pub fn encode_type(&self) -> EncodeType {
        match self {
            PixelFormat::Jpeg => EncodeType::Jpeg,
            PixelFormat::H264 => EncodeType::H264,
            PixelFormat::H265 => EncodeType::H265,
            _ => EncodeType::None,
        }
    }
}

/// Encoding tag of a buffer's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EncodeType {
    /// Raw pixels.
    #[default]
    None,
    /// JPEG.
    Jpeg,
    /// H.264.
    H264,
    /// H.265.
    H265,
}

/// Usage flags requested for a buffer's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct BufferUsage(u64);

impl BufferUsage {
    /// No usage declared.
    pub const NONE: Self = Self(0);
    /// Read by the CPU.
    pub const CPU_READ: Self = Self(1 << 0);
    /// Written by the CPU.
    pub const CPU_WRITE: Self = Self(1 << 1);
    /// Written by the camera sensor/ISP.
    pub const CAMERA_WRITE: Self = Self(1 << 2);
    /// Read by a hardware video encoder.
    pub const VIDEO_ENCODER: Self = Self(1 << 3);
    /// Read by the display compositor.
    pub const COMPOSER: Self = Self(1 << 4);

    /// Raw bit value.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Whether all bits of `other` are set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for BufferUsage {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Dimensions and layout of the memory behind a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferLayout {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Row stride in bytes.
    pub stride: u32,
    /// Pixel format.
    pub format: PixelFormat,
    /// Allocation size in bytes.
    pub size: usize,
    /// Usage flags.
    pub usage: BufferUsage,
}

impl BufferLayout {
    /// Layout for a frame with the given geometry.
    pub fn new(width: u32, height: u32, format: PixelFormat, usage: BufferUsage) -> Self {
        Self {
            width,
            height,
            stride: format.stride(width),
            format,
            size: format.frame_size(width, height),
            usage,
        }
    }
}

/// Side information for an encoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompressedFrameInfo {
    /// Encoded payload size in bytes.
    pub size: usize,
    /// Presentation timestamp.
    pub timestamp: ClockTime,
    /// Whether this is a key frame.
    pub key_frame: bool,
    /// Encoder frame number.
    pub frame_number: u64,
}

/// Descriptor for one piece of frame memory.
pub struct Buffer {
    pool_id: PoolId,
    index: u32,
    capture_id: Option<CaptureId>,
    stream_id: Option<StreamId>,
    sequence: u64,
    frame_number: u64,
    fence: Option<i32>,
    layout: BufferLayout,
    memory: Option<Arc<dyn MemorySegment>>,
    mapped: bool,
    encode: EncodeType,
    compressed: Option<CompressedFrameInfo>,
    status: BufferStatus,
    timestamp: ClockTime,
}

impl Buffer {
    /// Create a descriptor over `memory` (or none, for pure descriptors).
    ///
    /// The buffer starts unmapped; allocators map it before handing it out.
    pub fn new(layout: BufferLayout, memory: Option<Arc<dyn MemorySegment>>) -> Self {
        Self {
            pool_id: PoolId(0),
            index: 0,
            capture_id: None,
            stream_id: None,
            sequence: 0,
            frame_number: 0,
            fence: None,
            encode: layout.format.encode_type(),
            layout,
            memory,
            mapped: false,
            compressed: None,
            status: BufferStatus::Ok,
            timestamp: ClockTime::NONE,
        }
    }

    /// Pool this buffer belongs to.
    #[inline]
    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    /// Index within its pool.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn set_identity(&mut self, pool_id: PoolId, index: u32) {
        self.pool_id = pool_id;
        self.index = index;
    }

    /// Capture this buffer was produced for.
    #[inline]
    pub fn capture_id(&self) -> Option<CaptureId> {
        self.capture_id
    }

    /// Set the capture id.
    pub fn set_capture_id(&mut self, id: Option<CaptureId>) {
        self.capture_id = id;
    }

    /// Stream that owns this buffer.
    #[inline]
    pub fn stream_id(&self) -> Option<StreamId> {
        self.stream_id
    }

    /// Set the owning stream.
    pub fn set_stream_id(&mut self, id: Option<StreamId>) {
        self.stream_id = id;
    }

    /// Sequence number assigned by the pipeline source.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Set the sequence number.
    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Sensor frame number.
    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Set the frame number.
    pub fn set_frame_number(&mut self, frame_number: u64) {
        self.frame_number = frame_number;
    }

    /// Acquire fence, if any.
    #[inline]
    pub fn fence(&self) -> Option<i32> {
        self.fence
    }

    /// Set the acquire fence.
    pub fn set_fence(&mut self, fence: Option<i32>) {
        self.fence = fence;
    }

    /// Memory layout.
    #[inline]
    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    /// Width in pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.layout.width
    }

    /// Height in pixels.
    #[inline]
    pub fn height(&self) -> u32 {
        self.layout.height
    }

    /// Allocation size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.layout.size
    }

    /// Backing memory, if any.
    pub fn memory(&self) -> Option<&Arc<dyn MemorySegment>> {
        self.memory.as_ref()
    }

    pub(crate) fn take_memory(&mut self) -> Option<Arc<dyn MemorySegment>> {
        self.mapped = false;
        self.memory.take()
    }

    /// Whether the memory is currently CPU-mapped.
    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    pub(crate) fn set_mapped(&mut self, mapped: bool) {
        self.mapped = mapped && self.memory.is_some();
    }

    /// CPU virtual address; `None` while unmapped.
    pub fn virt_addr(&self) -> Option<usize> {
        if !self.mapped {
            return None;
        }
        self.memory.as_ref().map(|m| m.as_ptr() as usize)
    }

    /// Physical (device) address; zero when the backend has none.
    pub fn phys_addr(&self) -> u64 {
        self.memory.as_ref().map(|m| m.phys_addr()).unwrap_or(0)
    }

    /// File handle of the backing memory, when shareable.
    pub fn fd(&self) -> Option<RawFd> {
        self.memory.as_ref().and_then(|m| m.fd())
    }

    /// Mapped frame bytes.
    pub fn data(&self) -> Option<&[u8]> {
        let memory = self.memory.as_ref().filter(|_| self.mapped)?;
        let len = self.layout.size.min(memory.len());
        // SAFETY: each segment backs exactly one Buffer and Buffer is not
        // Clone, so no `&mut` alias can exist while `&self` is held.
        Some(unsafe { &memory.as_slice()[..len] })
    }

    /// Mapped frame bytes, mutable.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        let memory = self.memory.as_ref().filter(|_| self.mapped)?;
        let ptr = memory.as_mut_ptr()?;
        let len = self.layout.size.min(memory.len());
        // SAFETY: exclusive descriptor ownership (see `data`) plus `&mut self`.
        Some(unsafe { std::slice::from_raw_parts_mut(ptr, len) })
    }

    /// Encoding tag.
    #[inline]
    pub fn encode_type(&self) -> EncodeType {
        self.encode
    }

    /// Set the encoding tag.
    pub fn set_encode_type(&mut self, encode: EncodeType) {
        self.encode = encode;
    }

    /// Compressed-frame info.
    pub fn compressed(&self) -> Option<&CompressedFrameInfo> {
        self.compressed.as_ref()
    }

    /// Attach compressed-frame info.
    pub fn set_compressed(&mut self, info: Option<CompressedFrameInfo>) {
        self.compressed = info;
    }

    /// Current status.
    #[inline]
    pub fn status(&self) -> BufferStatus {
        self.status
    }

    /// Set the status.
    pub fn set_status(&mut self, status: BufferStatus) {
        self.status = status;
    }

    /// Capture timestamp.
    #[inline]
    pub fn timestamp(&self) -> ClockTime {
        self.timestamp
    }

    /// Set the capture timestamp.
    pub fn set_timestamp(&mut self, timestamp: ClockTime) {
        self.timestamp = timestamp;
    }

    /// Clear per-capture identity before the buffer is reused.
    ///
    /// Pool identity, layout and memory are kept.
    pub fn reset_for_reuse(&mut self) {
        self.capture_id = None;
        self.sequence = 0;
        self.frame_number = 0;
        self.fence = None;
        self.compressed = None;
        self.status = BufferStatus::Ok;
        self.timestamp = ClockTime::NONE;
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("pool", &self.pool_id)
            .field("index", &self.index)
            .field("capture", &self.capture_id)
            .field("stream", &self.stream_id)
            .field("frame", &self.frame_number)
            .field("status", &self.status)
            .field("size", &self.layout.size)
            .field("mapped", &self.mapped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HeapSegment;

    fn heap_buffer(width: u32, height: u32) -> Buffer {
        let layout = BufferLayout::new(width, height, PixelFormat::Nv12, BufferUsage::CPU_WRITE);
        let segment = HeapSegment::new(layout.size).unwrap();
        let mut buffer = Buffer::new(layout, Some(Arc::new(segment)));
        buffer.set_mapped(true);
        buffer
    }

    #[test]
    fn test_layout_sizes() {
        let layout = BufferLayout::new(640, 480, PixelFormat::Nv12, BufferUsage::NONE);
        assert_eq!(layout.size, 640 * 480 * 3 / 2);
        assert_eq!(layout.stride, 640);

        let rgba = BufferLayout::new(16, 16, PixelFormat::Rgba8888, BufferUsage::NONE);
        assert_eq!(rgba.size, 16 * 16 * 4);
        assert_eq!(rgba.stride, 64);
    }

    #[test]
    fn test_usage_flags() {
        let usage = BufferUsage::CPU_READ | BufferUsage::CAMERA_WRITE;
        assert!(usage.contains(BufferUsage::CPU_READ));
        assert!(!usage.contains(BufferUsage::COMPOSER));
    }

    #[test]
    fn test_data_requires_mapping() {
        let mut buffer = heap_buffer(4, 4);
        assert!(buffer.virt_addr().is_some());

        buffer.data_mut().unwrap()[..3].copy_from_slice(b"abc");
        assert_eq!(&buffer.data().unwrap()[..3], b"abc");

        buffer.set_mapped(false);
        assert!(buffer.data().is_none());
        assert!(buffer.virt_addr().is_none());
    }

    #[test]
    fn test_reset_for_reuse_keeps_identity() {
        let mut buffer = heap_buffer(4, 4);
        buffer.set_identity(PoolId(9), 3);
        buffer.set_capture_id(Some(CaptureId(7)));
        buffer.set_status(BufferStatus::Drop);
        buffer.set_frame_number(12);

        buffer.reset_for_reuse();

        assert_eq!(buffer.pool_id(), PoolId(9));
        assert_eq!(buffer.index(), 3);
        assert_eq!(buffer.capture_id(), None);
        assert_eq!(buffer.status(), BufferStatus::Ok);
        assert_eq!(buffer.frame_number(), 0);
    }

    #[test]
    fn test_encode_type_follows_format() {
        let layout = BufferLayout::new(8, 8, PixelFormat::Jpeg, BufferUsage::NONE);
        let buffer = Buffer::new(layout, None);
        assert_eq!(buffer.encode_type(), EncodeType::Jpeg);
        assert_eq!(buffer.phys_addr(), 0);
        assert!(buffer.fd().is_none());
    }
}
