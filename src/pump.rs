use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use arrayvec::ArrayVec;
use tracing::{debug, error, trace};

use crate::device::M2mDevice;
use crate::error::Error;
use crate::frame::{BufferGuard, DeintFrame, SourceFrame};
use crate::pts::{next_pts, DeviceTimestamp};
use crate::session::{negotiate_format, SessionConfig, SessionShared, SessionState};
use crate::types::{Field, FieldOrder, PlanarApi, MAX_DMABUF_PLANES};

/// Below this many in-flight output buffers the pump polls without
/// blocking and asks upstream for more input instead.
const LOW_WATER: usize = 5;

/// A rejected push. `Full` hands the frame back so the caller can hold
/// it and retry once a completion has freed a slot.
pub enum PushError<F> {
    /// Every output slot is in flight. Expected under load, not a fault.
    Full(F),
    /// Fatal session error.
    Fatal(Error),
}

impl<F> fmt::Debug for PushError<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => f.write_str("Full(..)"),
            PushError::Fatal(e) => write!(f, "Fatal({e:?})"),
        }
    }
}

impl<F> From<PushError<F>> for Error {
    fn from(e: PushError<F>) -> Self {
        match e {
            PushError::Full(_) => Error::QueueFull,
            PushError::Fatal(e) => e,
        }
    }
}

/// Bridges the device's asynchronous completion model into a synchronous
/// push/pull protocol.
///
/// One driving thread calls [`push`](DeintPump::push) and
/// [`pull`](DeintPump::pull); format negotiation and buffer allocation
/// happen lazily on the first pushed frame. Frames returned by `pull`
/// may outlive the pump itself; the session is torn down when the last
/// of {pump, outstanding frames} is dropped.
pub struct DeintPump<D: M2mDevice, F: SourceFrame> {
    shared: Arc<SessionShared<D, F>>,
    eos: bool,
    need_input: Option<Box<dyn FnMut() + Send>>,
}

impl<D: M2mDevice, F: SourceFrame> DeintPump<D, F> {
    /// Wrap an already-probed device. `planar` must be the variant
    /// selected by [`probe_device`](crate::session::probe_device).
    pub fn new(device: D, planar: PlanarApi, config: &SessionConfig) -> Self {
        DeintPump {
            shared: Arc::new(SessionShared::new(device, planar, config)),
            eos: false,
            need_input: None,
        }
    }

    /// Probe `device` and wrap it on success.
    pub fn open(device: D, config: &SessionConfig) -> Result<Self, Error> {
        let planar = crate::session::probe_device(&device, config.size)?;
        Ok(Self::new(device, planar, config))
    }

    /// Install the side-effect invoked when the pump wants another input
    /// frame to keep the pipe full.
    pub fn on_need_input(&mut self, callback: impl FnMut() + Send + 'static) {
        self.need_input = Some(Box::new(callback));
    }

    /// Upstream will supply no more frames; subsequent pulls report
    /// end of stream without touching the device.
    pub fn end_of_stream(&mut self) {
        self.eos = true;
    }

    /// Submit one input frame to the device.
    ///
    /// The first frame freezes the session's field order and triggers
    /// format negotiation and buffer allocation for both queues. The
    /// frame is moved into the chosen slot and released when the device
    /// completes it or the session tears down.
    pub fn push(&mut self, frame: F) -> Result<(), PushError<F>> {
        let shared = self.shared.clone();
        let mut state = match shared.state.lock() {
            Ok(state) => state,
            Err(_) => return Err(PushError::Fatal(Error::Device(0))),
        };

        state.sample_aspect_ratio = frame.sample_aspect_ratio();

        if state.field_order.is_none() {
            if let Err(e) = self.configure(&mut state, &frame) {
                error!(%e, "session configuration failed");
                return Err(PushError::Fatal(e));
            }
        }

        // Reclaiming completed buffers first keeps the queue from
        // appearing full under steady throughput.
        state.output.recycle(&shared.device);

        let Some(index) = state.output.find_free() else {
            trace!("output queue full");
            return Err(PushError::Full(frame));
        };

        let fds: ArrayVec<RawFd, MAX_DMABUF_PLANES> =
            frame.dmabuf().objects.iter().map(|o| o.fd).collect();
        let field = if frame.interlaced() {
            if frame.top_field_first() {
                Field::InterlacedTopFirst
            } else {
                Field::InterlacedBottomFirst
            }
        } else {
            Field::Progressive
        };
        let timestamp = DeviceTimestamp::from_pts(frame.pts());

        if let Err(e) = state
            .output
            .enqueue_slot(&shared.device, index, field, timestamp, &fds)
        {
            return Err(PushError::Fatal(e));
        }

        // The slot owns the frame until dequeue or teardown.
        if let Some(buf) = state.output.buffer_mut(index) {
            buf.frame = Some(frame);
        }
        Ok(())
    }

    /// Wait for and return one deinterlaced frame.
    ///
    /// With fewer than the low-water mark of output buffers in flight
    /// the call polls without blocking and signals upstream for more
    /// input; otherwise it blocks up to `timeout`. `WouldBlock` is
    /// expected pacing, not a fault.
    pub fn pull(&mut self, timeout: Duration) -> Result<DeintFrame<D, F>, Error> {
        if self.eos {
            return Err(Error::EndOfStream);
        }

        let shared = self.shared.clone();
        let mut state = shared.state.lock().map_err(|_| Error::Device(0))?;

        state.output.recycle(&shared.device);
        let in_flight = state.output.count_enqueued();
        let wait = if in_flight < LOW_WATER {
            None
        } else {
            Some(timeout)
        };
        trace!(in_flight, ?wait, "pulling");

        match state.capture.dequeue(&shared.device, wait) {
            Ok(completion) => {
                let pts = next_pts(
                    state.last_pts,
                    completion.timestamp.to_pts(),
                    state.frame_interval,
                );
                state.last_pts = pts;

                let desc = state
                    .capture
                    .buffer(completion.index)
                    .map(|buf| buf.dmabuf_desc(state.orig_height))
                    .ok_or(Error::Device(0))?;

                Ok(DeintFrame::new(
                    desc,
                    state.size,
                    state.sample_aspect_ratio,
                    pts,
                    completion.error,
                    BufferGuard::new(self.shared.clone(), completion.index),
                ))
            }
            Err(Error::WouldBlock) => {
                drop(state);
                if in_flight < LOW_WATER {
                    if let Some(callback) = &mut self.need_input {
                        callback();
                    }
                }
                Err(Error::WouldBlock)
            }
            Err(e) => {
                error!(%e, "capture dequeue failed");
                Err(e)
            }
        }
    }

    /// First-frame transition from unconfigured to streaming.
    ///
    /// The capture side is allocated and started before the output side
    /// so the device has somewhere to write from the first submission.
    fn configure(&self, state: &mut SessionState<F>, frame: &F) -> Result<(), Error> {
        let desc = frame.dmabuf();
        let layer = desc.layers.first().ok_or(Error::FormatUnsupported)?;
        let luma = layer.planes.first().ok_or(Error::FormatUnsupported)?;
        let chroma = layer.planes.get(1).ok_or(Error::FormatUnsupported)?;

        // The padded storage geometry lives in the handle's own layout:
        // the luma pitch, and the chroma offset (= pitch * padded height).
        let pitch = luma.pitch as u32;
        let luma_size = chroma.offset as u32;
        if pitch == 0 || luma_size == 0 {
            return Err(Error::FormatUnsupported);
        }
        state.orig_width = pitch;
        state.orig_height = luma_size / pitch;

        let order = if frame.top_field_first() {
            FieldOrder::TopFirst
        } else {
            FieldOrder::BottomFirst
        };
        state.field_order = Some(order);
        debug!(
            ?order,
            width = state.size.width,
            height = state.size.height,
            orig_width = state.orig_width,
            orig_height = state.orig_height,
            "configuring session"
        );

        let device = &self.shared.device;
        let size = state.size;

        let output_format = negotiate_format(
            device,
            state.output.spec(),
            order.into(),
            size,
            pitch,
            luma_size,
        )?;
        state.output.set_format(output_format);

        let capture_format = negotiate_format(
            device,
            state.capture.spec(),
            Field::Progressive,
            size,
            pitch,
            luma_size,
        )?;
        state.capture.set_format(capture_format);

        state.capture.allocate(device)?;
        state.capture.stream_on(device)?;
        // From here teardown must stream off, even if the output side
        // fails below and leaves the session unusable.
        state.streaming = true;
        state.output.allocate(device)?;
        state.output.stream_on(device)?;

        Ok(())
    }
}

impl<D: M2mDevice, F: SourceFrame> Drop for DeintPump<D, F> {
    fn drop(&mut self) {
        // Outstanding exported frames must not re-queue into a session
        // that is going away; they only release their reference.
        self.shared.done.store(true, Ordering::Release);
    }
}
