use arrayvec::ArrayVec;
use std::os::fd::RawFd;

/// Maximum number of planes a queue buffer can carry, mirroring the
/// kernel's `VIDEO_MAX_PLANES`.
pub const MAX_PLANES: usize = 8;

/// Maximum number of memory objects / logical planes in a DMABUF
/// frame descriptor.
pub const MAX_DMABUF_PLANES: usize = 4;

/// Planar YUV 4:2:0, the only pixel format the deinterlacer negotiates.
pub const FOURCC_YUV420: u32 = fourcc(b"YU12");

/// Linear (untiled) DMABUF layout.
pub const FORMAT_MOD_LINEAR: u64 = 0;

pub const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

/// Pixel dimensions of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

/// A rational number (numerator / denominator).
///
/// Used to represent frame rates (e.g. 30000/1000 = 30 fps) and
/// sample aspect ratios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ratio {
    pub numerator: u32,
    pub denominator: u32,
}

impl Ratio {
    pub fn as_f64(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }
}

/// A selection rectangle (crop or compose region).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

/// The two directions of a memory-to-memory device.
///
/// `Output` is the queue of buffers fed *into* the device, `Capture` the
/// queue of buffers the device produces. The naming is the device
/// protocol's, not ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Output,
    Capture,
}

/// Which of the two device-API variants the opened node speaks.
///
/// Selected once at capability-probe time and immutable for the rest of
/// the session; both queues use the same variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanarApi {
    SinglePlanar,
    MultiPlanar,
}

/// Identifies one device queue: a direction plus the session's API variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSpec {
    pub direction: Direction,
    pub planar: PlanarApi,
}

/// Scan ordering of a frame as understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Any,
    Progressive,
    InterlacedTopFirst,
    InterlacedBottomFirst,
}

/// Interlaced field order negotiated once per session, from the first
/// input frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOrder {
    TopFirst,
    BottomFirst,
}

impl From<FieldOrder> for Field {
    fn from(order: FieldOrder) -> Self {
        match order {
            FieldOrder::TopFirst => Field::InterlacedTopFirst,
            FieldOrder::BottomFirst => Field::InterlacedBottomFirst,
        }
    }
}

/// How buffer memory for a queue is provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Device-allocated memory, later exported as DMABUF handles.
    Mmap,
    /// Caller-supplied DMABUF handles.
    DmaBuf,
}

/// One shared-memory object backing a DMABUF frame.
///
/// The descriptor does not own the file descriptor; ownership stays with
/// whoever produced the frame (the caller for input frames, the session's
/// buffer pool for output frames).
#[derive(Debug, Clone, Copy)]
pub struct DmabufObject {
    pub fd: RawFd,
    pub size: usize,
    pub format_modifier: u64,
}

/// One logical plane within a DMABUF layer.
#[derive(Debug, Clone, Copy)]
pub struct DmabufPlane {
    pub object_index: usize,
    pub offset: usize,
    pub pitch: usize,
}

/// A pixel layer: a fourcc plus the planes composing it.
#[derive(Debug, Clone)]
pub struct DmabufLayer {
    pub format: u32,
    pub planes: ArrayVec<DmabufPlane, MAX_DMABUF_PLANES>,
}

/// Zero-copy frame descriptor: memory objects plus their pixel layout.
///
/// A planar YUV 4:2:0 frame is described either as three objects with one
/// plane each, or as a single contiguous object expanded into three
/// logical planes.
#[derive(Debug, Clone, Default)]
pub struct DmabufDesc {
    pub objects: ArrayVec<DmabufObject, MAX_DMABUF_PLANES>,
    pub layers: ArrayVec<DmabufLayer, MAX_DMABUF_PLANES>,
}
