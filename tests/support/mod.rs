//! Shared test doubles: a scripted in-memory device and a counting
//! source frame.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arrayvec::ArrayVec;

use deint_stream::device::{
    Completion, DeviceCaps, EnqueueRequest, M2mDevice, PlaneLength, QueueFormat, SlotInfo,
};
use deint_stream::error::Error;
use deint_stream::frame::SourceFrame;
use deint_stream::pts::DeviceTimestamp;
use deint_stream::types::{
    Direction, DmabufDesc, DmabufLayer, DmabufObject, DmabufPlane, Field, MemoryKind, QueueSpec,
    Ratio, Rect, FORMAT_MOD_LINEAR, FOURCC_YUV420,
};

pub fn stub_fd() -> OwnedFd {
    File::open("/dev/null").expect("open /dev/null").into()
}

static TRACING: std::sync::Once = std::sync::Once::new();

/// Route crate logs through the test harness capture.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// One recorded buffer submission.
#[derive(Debug, Clone)]
pub struct EnqueueRecord {
    pub direction: Direction,
    pub index: u32,
    pub field: Field,
    pub timestamp: DeviceTimestamp,
    pub fd_count: usize,
}

#[derive(Debug)]
pub struct MockState {
    pub caps: DeviceCaps,
    /// Adjust the pixel format away from the request during trial
    /// negotiation, the way a device that cannot do the job would.
    pub reject_output_format: bool,
    pub reject_capture_format: bool,
    /// Grant fewer slots than requested, when set.
    pub grant_output: Option<u32>,
    pub grant_capture: Option<u32>,
    /// Reject the output-side buffer request outright.
    pub fail_output_request: bool,
    pub plane_length: u32,
    /// Scripted completions, reaped in order by `dequeue`.
    pub capture_ready: VecDeque<Completion>,
    pub output_done: VecDeque<Completion>,
    /// Flat call log for ordering assertions.
    pub log: Vec<String>,
    pub polls: Vec<(Direction, Option<Duration>)>,
    pub enqueues: Vec<EnqueueRecord>,
    pub selections: Vec<(Direction, Rect)>,
}

impl Default for MockState {
    fn default() -> Self {
        MockState {
            caps: DeviceCaps::empty(),
            reject_output_format: false,
            reject_capture_format: false,
            grant_output: None,
            grant_capture: None,
            fail_output_request: false,
            plane_length: 0,
            capture_ready: VecDeque::new(),
            output_done: VecDeque::new(),
            log: Vec::new(),
            polls: Vec::new(),
            enqueues: Vec::new(),
            selections: Vec::new(),
        }
    }
}

/// A scripted `M2mDevice`. Clones share state, so tests can keep a
/// handle for inspection after the session has consumed the device.
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    /// A multi-planar memory-to-memory device that accepts everything.
    pub fn mplane() -> Self {
        let device = MockDevice::default();
        {
            let mut state = device.lock();
            state.caps = DeviceCaps::STREAMING | DeviceCaps::VIDEO_M2M_MPLANE;
            state.plane_length = 1920 * 1088 * 3 / 2;
        }
        device
    }

    /// Same, speaking the single-planar API variant.
    pub fn single_planar() -> Self {
        let device = MockDevice::mplane();
        device.lock().caps = DeviceCaps::STREAMING | DeviceCaps::VIDEO_M2M;
        device
    }

    pub fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    /// Script one capture completion.
    pub fn complete_capture(&self, index: u32, timestamp: DeviceTimestamp, error: bool) {
        self.lock().capture_ready.push_back(Completion {
            index,
            timestamp,
            error,
        });
    }

    /// Script one output (input-consumed) completion.
    pub fn complete_output(&self, index: u32) {
        self.lock().output_done.push_back(Completion {
            index,
            timestamp: DeviceTimestamp::NONE,
            error: false,
        });
    }

    /// Position of the first log entry containing `needle`.
    pub fn log_position(&self, needle: &str) -> Option<usize> {
        self.lock().log.iter().position(|entry| entry.contains(needle))
    }

    pub fn log_count(&self, needle: &str) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|entry| entry.contains(needle))
            .count()
    }
}

impl M2mDevice for MockDevice {
    fn capabilities(&self) -> Result<DeviceCaps, Error> {
        Ok(self.lock().caps)
    }

    fn try_format(&self, direction: Direction, format: &mut QueueFormat) -> Result<(), Error> {
        let mut state = self.lock();
        state.log.push(format!("try_fmt {direction:?}"));
        let reject = match direction {
            Direction::Output => state.reject_output_format,
            Direction::Capture => state.reject_capture_format,
        };
        if reject {
            match format {
                QueueFormat::SinglePlanar(f) => f.pixel_format = 0,
                QueueFormat::MultiPlanar(f) => f.pixel_format = 0,
            }
        }
        Ok(())
    }

    fn commit_format(&self, direction: Direction, _format: &mut QueueFormat) -> Result<(), Error> {
        self.lock().log.push(format!("s_fmt {direction:?}"));
        Ok(())
    }

    fn selection_bounds(&self, queue: QueueSpec) -> Result<Rect, Error> {
        self.lock()
            .log
            .push(format!("g_selection {:?}", queue.direction));
        Ok(Rect {
            left: 0,
            top: 0,
            width: 4096,
            height: 4096,
        })
    }

    fn set_selection(&self, queue: QueueSpec, rect: Rect) -> Result<Rect, Error> {
        let mut state = self.lock();
        state.log.push(format!("s_selection {:?}", queue.direction));
        state.selections.push((queue.direction, rect));
        Ok(rect)
    }

    fn request_buffers(
        &self,
        queue: QueueSpec,
        _memory: MemoryKind,
        count: u32,
    ) -> Result<u32, Error> {
        let mut state = self.lock();
        if queue.direction == Direction::Output && state.fail_output_request {
            return Err(Error::DeviceRejected(22));
        }
        let granted = match queue.direction {
            Direction::Output => state.grant_output.unwrap_or(count),
            Direction::Capture => state.grant_capture.unwrap_or(count),
        };
        state
            .log
            .push(format!("reqbufs {:?} {granted}", queue.direction));
        Ok(granted)
    }

    fn query_buffer(
        &self,
        queue: QueueSpec,
        _memory: MemoryKind,
        index: u32,
    ) -> Result<SlotInfo, Error> {
        let mut state = self.lock();
        state
            .log
            .push(format!("querybuf {:?} {index}", queue.direction));
        let mut info = SlotInfo::default();
        info.planes.push(PlaneLength {
            length: state.plane_length,
        });
        Ok(info)
    }

    fn export_buffer(&self, queue: QueueSpec, index: u32, plane: u32) -> Result<OwnedFd, Error> {
        self.lock()
            .log
            .push(format!("expbuf {:?} {index}.{plane}", queue.direction));
        Ok(stub_fd())
    }

    fn enqueue(&self, request: &EnqueueRequest<'_>) -> Result<(), Error> {
        let mut state = self.lock();
        state.log.push(format!(
            "qbuf {:?} {}",
            request.queue.direction, request.index
        ));
        state.enqueues.push(EnqueueRecord {
            direction: request.queue.direction,
            index: request.index,
            field: request.field,
            timestamp: request.timestamp,
            fd_count: request.planes.iter().filter(|p| p.fd.is_some()).count(),
        });
        Ok(())
    }

    fn dequeue(&self, queue: QueueSpec, _memory: MemoryKind) -> Result<Completion, Error> {
        let mut state = self.lock();
        let ready = match queue.direction {
            Direction::Capture => state.capture_ready.pop_front(),
            Direction::Output => state.output_done.pop_front(),
        };
        match ready {
            Some(completion) => {
                state
                    .log
                    .push(format!("dqbuf {:?} {}", queue.direction, completion.index));
                Ok(completion)
            }
            None => Err(Error::WouldBlock),
        }
    }

    fn wait_ready(&self, direction: Direction, timeout: Option<Duration>) -> Result<bool, Error> {
        let mut state = self.lock();
        state.polls.push((direction, timeout));
        let ready = match direction {
            Direction::Capture => !state.capture_ready.is_empty(),
            Direction::Output => !state.output_done.is_empty(),
        };
        Ok(ready)
    }

    fn stream_on(&self, queue: QueueSpec) -> Result<(), Error> {
        self.lock()
            .log
            .push(format!("streamon {:?}", queue.direction));
        Ok(())
    }

    fn stream_off(&self, queue: QueueSpec) -> Result<(), Error> {
        self.lock()
            .log
            .push(format!("streamoff {:?}", queue.direction));
        Ok(())
    }
}

/// Wraps a `MockDevice`, exporting real descriptors (dups of an internal
/// pipe) and recording at drop time whether any of them is still open.
/// Lets a test pin the order in which a dying session closes its
/// exported descriptors relative to the device handle.
#[derive(Debug)]
pub struct FdLifetimeDevice {
    inner: MockDevice,
    pipe_read: OwnedFd,
    _pipe_write: OwnedFd,
    exported: Mutex<Vec<RawFd>>,
    pub open_at_drop: Arc<AtomicBool>,
}

impl FdLifetimeDevice {
    pub fn new(inner: MockDevice) -> Self {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "pipe");
        FdLifetimeDevice {
            inner,
            pipe_read: unsafe { OwnedFd::from_raw_fd(fds[0]) },
            _pipe_write: unsafe { OwnedFd::from_raw_fd(fds[1]) },
            exported: Mutex::new(Vec::new()),
            open_at_drop: Arc::new(AtomicBool::new(false)),
        }
    }

    fn identity(fd: RawFd) -> Option<(u64, u64)> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } == 0 {
            Some((st.st_dev as u64, st.st_ino as u64))
        } else {
            None
        }
    }
}

impl Drop for FdLifetimeDevice {
    fn drop(&mut self) {
        // A closed fd number may have been reused by an unrelated open
        // in a parallel test; only a descriptor still naming our pipe
        // counts as leaked.
        let pipe = Self::identity(self.pipe_read.as_raw_fd());
        let exported = self.exported.lock().expect("exported list");
        for fd in exported.iter() {
            if pipe.is_some() && Self::identity(*fd) == pipe {
                self.open_at_drop.store(true, Ordering::SeqCst);
            }
        }
    }
}

impl M2mDevice for FdLifetimeDevice {
    fn capabilities(&self) -> Result<DeviceCaps, Error> {
        self.inner.capabilities()
    }

    fn try_format(&self, direction: Direction, format: &mut QueueFormat) -> Result<(), Error> {
        self.inner.try_format(direction, format)
    }

    fn commit_format(&self, direction: Direction, format: &mut QueueFormat) -> Result<(), Error> {
        self.inner.commit_format(direction, format)
    }

    fn selection_bounds(&self, queue: QueueSpec) -> Result<Rect, Error> {
        self.inner.selection_bounds(queue)
    }

    fn set_selection(&self, queue: QueueSpec, rect: Rect) -> Result<Rect, Error> {
        self.inner.set_selection(queue, rect)
    }

    fn request_buffers(
        &self,
        queue: QueueSpec,
        memory: MemoryKind,
        count: u32,
    ) -> Result<u32, Error> {
        self.inner.request_buffers(queue, memory, count)
    }

    fn query_buffer(
        &self,
        queue: QueueSpec,
        memory: MemoryKind,
        index: u32,
    ) -> Result<SlotInfo, Error> {
        self.inner.query_buffer(queue, memory, index)
    }

    fn export_buffer(&self, queue: QueueSpec, index: u32, plane: u32) -> Result<OwnedFd, Error> {
        // Delegate for the log, but hand out a dup of the pipe so the
        // descriptor's fate is observable.
        let _ = self.inner.export_buffer(queue, index, plane)?;
        let fd = unsafe { libc::dup(self.pipe_read.as_raw_fd()) };
        assert!(fd >= 0, "dup");
        self.exported.lock().expect("exported list").push(fd);
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn enqueue(&self, request: &EnqueueRequest<'_>) -> Result<(), Error> {
        self.inner.enqueue(request)
    }

    fn dequeue(&self, queue: QueueSpec, memory: MemoryKind) -> Result<Completion, Error> {
        self.inner.dequeue(queue, memory)
    }

    fn wait_ready(&self, direction: Direction, timeout: Option<Duration>) -> Result<bool, Error> {
        self.inner.wait_ready(direction, timeout)
    }

    fn stream_on(&self, queue: QueueSpec) -> Result<(), Error> {
        self.inner.stream_on(queue)
    }

    fn stream_off(&self, queue: QueueSpec) -> Result<(), Error> {
        self.inner.stream_off(queue)
    }
}

/// A source frame over a fake contiguous 1920x1088-padded YUV 4:2:0
/// allocation, counting its drops.
#[derive(Debug)]
pub struct MockFrame {
    desc: DmabufDesc,
    pts: Option<i64>,
    interlaced: bool,
    top_field_first: bool,
    drops: Arc<AtomicUsize>,
}

pub const PITCH: usize = 1920;
pub const PADDED_HEIGHT: usize = 1088;

impl MockFrame {
    pub fn new(
        pts: Option<i64>,
        interlaced: bool,
        top_field_first: bool,
        drops: Arc<AtomicUsize>,
    ) -> Self {
        let luma = PITCH * PADDED_HEIGHT;
        let mut objects = ArrayVec::new();
        objects.push(DmabufObject {
            fd: 3,
            size: luma * 3 / 2,
            format_modifier: FORMAT_MOD_LINEAR,
        });
        let mut planes = ArrayVec::new();
        planes.push(DmabufPlane {
            object_index: 0,
            offset: 0,
            pitch: PITCH,
        });
        planes.push(DmabufPlane {
            object_index: 0,
            offset: luma,
            pitch: PITCH / 2,
        });
        planes.push(DmabufPlane {
            object_index: 0,
            offset: luma + luma / 4,
            pitch: PITCH / 2,
        });
        let mut layers = ArrayVec::new();
        layers.push(DmabufLayer {
            format: FOURCC_YUV420,
            planes,
        });

        MockFrame {
            desc: DmabufDesc { objects, layers },
            pts,
            interlaced,
            top_field_first,
            drops,
        }
    }

    pub fn interlaced_tff(pts: Option<i64>, drops: Arc<AtomicUsize>) -> Self {
        MockFrame::new(pts, true, true, drops)
    }
}

impl SourceFrame for MockFrame {
    fn dmabuf(&self) -> &DmabufDesc {
        &self.desc
    }

    fn pts(&self) -> Option<i64> {
        self.pts
    }

    fn interlaced(&self) -> bool {
        self.interlaced
    }

    fn top_field_first(&self) -> bool {
        self.top_field_first
    }

    fn sample_aspect_ratio(&self) -> Ratio {
        Ratio {
            numerator: 1,
            denominator: 1,
        }
    }
}

impl Drop for MockFrame {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}
