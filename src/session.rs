use std::sync::atomic::AtomicBool;
use std::sync::Mutex;

use arrayvec::ArrayVec;
use tracing::{debug, trace};

use crate::device::{
    DeviceCaps, M2mDevice, PixFormat, PixFormatMplane, PlaneFormat, QueueFormat,
};
use crate::error::Error;
use crate::queue::Queue;
use crate::types::{
    Direction, Field, FieldOrder, MemoryKind, PlanarApi, QueueSpec, Ratio, Rect, Size,
    FOURCC_YUV420,
};

/// Configuration for opening a deinterlacing session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub size: Size,
    /// Output frame rate; fixes the frame-interval estimate used to
    /// synthesize timestamps for the session's lifetime.
    pub frame_rate: Ratio,
    pub output_depth: u32,
    pub capture_depth: u32,
}

impl SessionConfig {
    /// Defaults: 60 fps interval estimate, 10 output and 8 capture
    /// buffers (the device may grant fewer).
    pub fn new(width: u32, height: u32) -> Self {
        SessionConfig {
            size: Size { width, height },
            frame_rate: Ratio {
                numerator: 60,
                denominator: 1,
            },
            output_depth: 10,
            capture_depth: 8,
        }
    }
}

/// Verify that an opened node is a usable deinterlacer and select the
/// API variant for the session.
///
/// Requires the streaming and memory-to-memory capability bits, then
/// checks via trial (non-committing) negotiation that both directions
/// accept planar YUV 4:2:0 at the configured geometry.
pub fn probe_device<D: M2mDevice>(device: &D, size: Size) -> Result<PlanarApi, Error> {
    let caps = device.capabilities().map_err(|e| {
        trace!(?e, "capability query failed");
        Error::UnsupportedDevice
    })?;

    if !caps.contains(DeviceCaps::STREAMING) {
        return Err(Error::UnsupportedDevice);
    }
    let planar = if caps.contains(DeviceCaps::VIDEO_M2M) {
        PlanarApi::SinglePlanar
    } else if caps.contains(DeviceCaps::VIDEO_M2M_MPLANE) {
        PlanarApi::MultiPlanar
    } else {
        return Err(Error::UnsupportedDevice);
    };

    try_format(device, Direction::Capture, planar, size, Field::Progressive)?;
    try_format(device, Direction::Output, planar, size, Field::InterlacedTopFirst)?;

    Ok(planar)
}

fn try_format<D: M2mDevice>(
    device: &D,
    direction: Direction,
    planar: PlanarApi,
    size: Size,
    field: Field,
) -> Result<(), Error> {
    let mut format = blank_format(planar, size, field);
    device
        .try_format(direction, &mut format)
        .map_err(|_| Error::FormatUnsupported)?;

    // The device is free to adjust the trial format; anything but the
    // requested pixel format and field means it cannot do the job.
    if format.pixel_format() != FOURCC_YUV420 || format.field() != field {
        debug!(?direction, "format not supported");
        return Err(Error::FormatUnsupported);
    }
    Ok(())
}

fn blank_format(planar: PlanarApi, size: Size, field: Field) -> QueueFormat {
    match planar {
        PlanarApi::SinglePlanar => QueueFormat::SinglePlanar(PixFormat {
            width: size.width,
            height: size.height,
            pixel_format: FOURCC_YUV420,
            field,
            bytes_per_line: 0,
            size_image: 0,
        }),
        PlanarApi::MultiPlanar => {
            let mut planes = ArrayVec::new();
            planes.push(PlaneFormat::default());
            QueueFormat::MultiPlanar(PixFormatMplane {
                width: size.width,
                height: size.height,
                pixel_format: FOURCC_YUV420,
                field,
                planes,
            })
        }
    }
}

/// Commit a queue's format and selection rectangle.
///
/// Two steps: the format commit, where the device may round geometry up
/// for hardware alignment (`pitch` and `luma_size` describe the caller's
/// padded storage), then the crop/compose rectangle, clamped
/// less-than-or-equal to the device bounds, which recovers the caller's
/// exact visible area.
pub fn negotiate_format<D: M2mDevice>(
    device: &D,
    queue: QueueSpec,
    field: Field,
    size: Size,
    pitch: u32,
    luma_size: u32,
) -> Result<QueueFormat, Error> {
    let mut format = match queue.planar {
        PlanarApi::SinglePlanar => QueueFormat::SinglePlanar(PixFormat {
            width: size.width,
            height: size.height,
            pixel_format: FOURCC_YUV420,
            field,
            // Left zero: the driver fills in its own stride.
            bytes_per_line: 0,
            size_image: 0,
        }),
        PlanarApi::MultiPlanar => {
            let mut planes = ArrayVec::new();
            planes.push(PlaneFormat {
                bytes_per_line: pitch,
                size_image: luma_size + (luma_size >> 1),
            });
            QueueFormat::MultiPlanar(PixFormatMplane {
                width: size.width,
                // Storage height recovered from the padded layout.
                height: if pitch > 0 { luma_size / pitch } else { size.height },
                pixel_format: FOURCC_YUV420,
                field,
                planes,
            })
        }
    };

    device.commit_format(queue.direction, &mut format)?;

    let bounds = device.selection_bounds(queue)?;
    trace!(?queue.direction, ?bounds, "selection bounds");

    let applied = device.set_selection(
        queue,
        Rect {
            left: 0,
            top: 0,
            width: size.width,
            height: size.height,
        },
    )?;
    if applied.width != size.width || applied.height != size.height {
        debug!(?queue.direction, ?applied, "selection adjusted by device");
    }

    Ok(format)
}

/// State mutated only by the driving thread (or a release guard, under
/// the mutex).
#[derive(Debug)]
pub(crate) struct SessionState<F> {
    pub size: Size,
    /// Pre-padding geometry recovered from the first input frame's
    /// layout metadata.
    pub orig_width: u32,
    pub orig_height: u32,
    pub sample_aspect_ratio: Ratio,
    /// Frozen on the first input frame; never re-probed.
    pub field_order: Option<FieldOrder>,
    pub last_pts: i64,
    pub frame_interval: i64,
    pub streaming: bool,
    pub output: Queue<F>,
    pub capture: Queue<F>,
}

/// The shared core of a session, kept behind an `Arc`.
///
/// One reference is held by the owning pump and one by every outstanding
/// exported frame; the device handle, queues and exported descriptors
/// live until the last reference goes away, whichever side that is.
#[derive(Debug)]
pub struct SessionShared<D: M2mDevice, F> {
    pub(crate) done: AtomicBool,
    // Field order is load-bearing: `state` must drop before `device` so
    // every exported descriptor closes while the device handle is open.
    pub(crate) state: Mutex<SessionState<F>>,
    pub(crate) device: D,
}

impl<D: M2mDevice, F> SessionShared<D, F> {
    pub(crate) fn new(device: D, planar: PlanarApi, config: &SessionConfig) -> Self {
        let interval = crate::pts::USEC_PER_SEC * config.frame_rate.denominator as i64
            / config.frame_rate.numerator.max(1) as i64;

        SessionShared {
            done: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                size: config.size,
                orig_width: 0,
                orig_height: 0,
                sample_aspect_ratio: Ratio {
                    numerator: 1,
                    denominator: 1,
                },
                field_order: None,
                last_pts: 0,
                frame_interval: interval,
                streaming: false,
                output: Queue::new(
                    QueueSpec {
                        direction: Direction::Output,
                        planar,
                    },
                    MemoryKind::DmaBuf,
                    config.output_depth,
                ),
                capture: Queue::new(
                    QueueSpec {
                        direction: Direction::Capture,
                        planar,
                    },
                    MemoryKind::Mmap,
                    config.capture_depth,
                ),
            }),
            device,
        }
    }
}

impl<D: M2mDevice, F> Drop for SessionShared<D, F> {
    fn drop(&mut self) {
        debug!("destroying session");

        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        if state.streaming {
            if let Err(e) = self.device.stream_off(state.capture.spec()) {
                debug!(error = %e, "capture stream off failed");
            }
            if let Err(e) = self.device.stream_off(state.output.spec()) {
                debug!(error = %e, "output stream off failed");
            }
        }

        // Input frames still sitting in the kernel queue are released
        // here; exported capture descriptors close when the queues drop,
        // and the device handle last of all.
        state.output.release_queued_frames();
    }
}
