use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::warn;

use crate::device::M2mDevice;
use crate::pts::DeviceTimestamp;
use crate::session::SessionShared;
use crate::types::{DmabufDesc, Field, Ratio, Size};

/// An input frame handed to the pump.
///
/// Carries a caller-owned zero-copy descriptor; the pump takes ownership
/// of the frame on a successful push (move, not copy) and releases it
/// when the device has consumed the buffer or at session teardown.
pub trait SourceFrame {
    /// The caller's zero-copy handle for this frame's pixel data.
    fn dmabuf(&self) -> &DmabufDesc;

    /// Presentation timestamp in microseconds, if known.
    fn pts(&self) -> Option<i64>;

    fn interlaced(&self) -> bool;

    fn top_field_first(&self) -> bool;

    fn sample_aspect_ratio(&self) -> Ratio;
}

/// Keeps a capture slot (and the session behind it) alive while a
/// downstream consumer holds the exported frame.
///
/// Dropping the guard re-arms the slot for the device unless the session
/// is already done, then releases its session reference. The session is
/// torn down only when the last reference goes away, whether that is the
/// owning pump or the last outstanding frame.
#[derive(Debug)]
pub(crate) struct BufferGuard<D: M2mDevice, F> {
    shared: Arc<SessionShared<D, F>>,
    index: u32,
}

impl<D: M2mDevice, F> BufferGuard<D, F> {
    pub(crate) fn new(shared: Arc<SessionShared<D, F>>, index: u32) -> Self {
        BufferGuard { shared, index }
    }
}

impl<D: M2mDevice, F> Drop for BufferGuard<D, F> {
    fn drop(&mut self) {
        if self.shared.done.load(Ordering::Acquire) {
            return;
        }
        let Ok(mut state) = self.shared.state.lock() else {
            return;
        };
        if let Err(e) = state.capture.enqueue_slot(
            &self.shared.device,
            self.index,
            Field::Progressive,
            DeviceTimestamp::NONE,
            &[],
        ) {
            // Cannot be surfaced to any caller; the device simply keeps
            // one fewer buffer in rotation.
            warn!(index = self.index, error = %e, "failed to re-queue capture slot");
        }
    }
}

/// A deinterlaced frame produced by the device, exported zero-copy.
///
/// The descriptor's file handles stay valid for as long as this frame
/// exists, even if the pump that produced it has been dropped. Release
/// happens exactly once, on drop.
#[derive(Debug)]
pub struct DeintFrame<D: M2mDevice, F> {
    desc: DmabufDesc,
    size: Size,
    sample_aspect_ratio: Ratio,
    pts: i64,
    corrupt: bool,
    _guard: BufferGuard<D, F>,
}

impl<D: M2mDevice, F> DeintFrame<D, F> {
    pub(crate) fn new(
        desc: DmabufDesc,
        size: Size,
        sample_aspect_ratio: Ratio,
        pts: i64,
        corrupt: bool,
        guard: BufferGuard<D, F>,
    ) -> Self {
        DeintFrame {
            desc,
            size,
            sample_aspect_ratio,
            pts,
            corrupt,
            _guard: guard,
        }
    }

    /// The zero-copy descriptor of the frame's pixel data. Always
    /// progressive planar YUV 4:2:0.
    pub fn dmabuf(&self) -> &DmabufDesc {
        &self.desc
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn sample_aspect_ratio(&self) -> Ratio {
        self.sample_aspect_ratio
    }

    /// Emitted presentation timestamp in microseconds. Strictly greater
    /// than that of every frame emitted before it.
    pub fn pts(&self) -> i64 {
        self.pts
    }

    /// True when the device flagged the buffer as corrupted.
    pub fn corrupt(&self) -> bool {
        self.corrupt
    }
}
