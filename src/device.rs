use std::os::fd::{OwnedFd, RawFd};
use std::time::Duration;

use arrayvec::ArrayVec;
use bitflags::bitflags;

use crate::error::Error;
use crate::pts::DeviceTimestamp;
use crate::types::{Direction, Field, MemoryKind, QueueSpec, Rect, MAX_PLANES};

bitflags! {
    /// Device capability bits, with the kernel's values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceCaps: u32 {
        const VIDEO_M2M_MPLANE = 0x0000_4000;
        const VIDEO_M2M        = 0x0000_8000;
        const STREAMING        = 0x0400_0000;
    }
}

/// Per-plane geometry within a multi-planar format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneFormat {
    pub size_image: u32,
    pub bytes_per_line: u32,
}

/// Single-planar pixel format: one contiguous allocation per buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    pub field: Field,
    pub bytes_per_line: u32,
    pub size_image: u32,
}

/// Multi-planar pixel format: one allocation per plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixFormatMplane {
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    pub field: Field,
    pub planes: ArrayVec<PlaneFormat, MAX_PLANES>,
}

/// A queue's negotiated format, tagged by API variant.
///
/// The variant is fixed at capability-probe time; the device never sees a
/// mix of the two on one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueFormat {
    SinglePlanar(PixFormat),
    MultiPlanar(PixFormatMplane),
}

impl QueueFormat {
    pub fn size(&self) -> (u32, u32) {
        match self {
            QueueFormat::SinglePlanar(f) => (f.width, f.height),
            QueueFormat::MultiPlanar(f) => (f.width, f.height),
        }
    }

    pub fn pixel_format(&self) -> u32 {
        match self {
            QueueFormat::SinglePlanar(f) => f.pixel_format,
            QueueFormat::MultiPlanar(f) => f.pixel_format,
        }
    }

    pub fn field(&self) -> Field {
        match self {
            QueueFormat::SinglePlanar(f) => f.field,
            QueueFormat::MultiPlanar(f) => f.field,
        }
    }

    /// Stride of the first plane, as negotiated with the device.
    pub fn bytes_per_line(&self) -> u32 {
        match self {
            QueueFormat::SinglePlanar(f) => f.bytes_per_line,
            QueueFormat::MultiPlanar(f) => {
                f.planes.first().map(|p| p.bytes_per_line).unwrap_or(0)
            }
        }
    }
}

/// Reported length of one allocated plane of a buffer slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaneLength {
    pub length: u32,
}

/// What the device reports about one requested buffer slot.
#[derive(Debug, Clone, Default)]
pub struct SlotInfo {
    pub planes: ArrayVec<PlaneLength, MAX_PLANES>,
}

/// One plane of an enqueue request. `fd` is set for caller-supplied
/// DMABUF memory and absent for device-allocated memory.
#[derive(Debug, Clone, Copy)]
pub struct EnqueuePlane {
    pub fd: Option<RawFd>,
    pub length: u32,
}

/// A buffer submission to the device.
#[derive(Debug)]
pub struct EnqueueRequest<'a> {
    pub queue: QueueSpec,
    pub index: u32,
    pub memory: MemoryKind,
    pub field: Field,
    pub timestamp: DeviceTimestamp,
    pub planes: &'a [EnqueuePlane],
}

/// A completed buffer handed back by the device.
///
/// Completions arrive in device-completion order, which is not guaranteed
/// to match submission order; the index is the only link back to the
/// earlier submission.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub index: u32,
    pub timestamp: DeviceTimestamp,
    /// The device flagged this buffer as corrupted.
    pub error: bool,
}

/// The kernel device-node protocol of a memory-to-memory video device.
///
/// All calls are synchronous; the only blocking operation is
/// [`wait_ready`](M2mDevice::wait_ready), bounded by its timeout.
/// Implementations must retry waits interrupted by a signal indefinitely
/// and propagate any other failure.
pub trait M2mDevice {
    /// Query the device's capability bits.
    fn capabilities(&self) -> Result<DeviceCaps, Error>;

    /// Trial (non-committing) format negotiation. The device adjusts
    /// `format` in place to what it would actually accept.
    fn try_format(&self, direction: Direction, format: &mut QueueFormat) -> Result<(), Error>;

    /// Commit a format. The device may round geometry up for hardware
    /// alignment; the adjusted values are written back to `format`.
    fn commit_format(&self, direction: Direction, format: &mut QueueFormat) -> Result<(), Error>;

    /// The device-reported bounds of the crop (output) or compose
    /// (capture) rectangle.
    fn selection_bounds(&self, queue: QueueSpec) -> Result<Rect, Error>;

    /// Set the crop/compose rectangle, clamped less-than-or-equal to the
    /// device bounds. Returns the rectangle actually applied.
    fn set_selection(&self, queue: QueueSpec, rect: Rect) -> Result<Rect, Error>;

    /// Request `count` buffer slots; the device may grant fewer. The
    /// granted count is authoritative.
    fn request_buffers(
        &self,
        queue: QueueSpec,
        memory: MemoryKind,
        count: u32,
    ) -> Result<u32, Error>;

    /// Learn the real per-plane lengths of one granted slot.
    fn query_buffer(
        &self,
        queue: QueueSpec,
        memory: MemoryKind,
        index: u32,
    ) -> Result<SlotInfo, Error>;

    /// Export one plane of a device-allocated slot as a DMABUF handle.
    fn export_buffer(&self, queue: QueueSpec, index: u32, plane: u32) -> Result<OwnedFd, Error>;

    /// Submit a buffer to the device.
    fn enqueue(&self, request: &EnqueueRequest<'_>) -> Result<(), Error>;

    /// Reap one completed buffer, without waiting. `Error::WouldBlock`
    /// when none is ready.
    fn dequeue(&self, queue: QueueSpec, memory: MemoryKind) -> Result<Completion, Error>;

    /// Wait until the queue has a completion ready, up to `timeout`
    /// (`None` polls without blocking). Returns false on timeout.
    fn wait_ready(&self, direction: Direction, timeout: Option<Duration>) -> Result<bool, Error>;

    fn stream_on(&self, queue: QueueSpec) -> Result<(), Error>;

    fn stream_off(&self, queue: QueueSpec) -> Result<(), Error>;
}
