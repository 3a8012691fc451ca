use std::fs::OpenOptions;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{error, trace};

use crate::device::{
    Completion, DeviceCaps, EnqueueRequest, M2mDevice, PlaneLength, QueueFormat, SlotInfo,
};
use crate::error::Error;
use crate::pts::DeviceTimestamp;
use crate::types::{Direction, Field, MemoryKind, PlanarApi, QueueSpec, Rect};

use super::sys;

/// A memory-to-memory device node, owning its file descriptor.
#[derive(Debug)]
pub struct V4l2M2m {
    fd: OwnedFd,
}

impl V4l2M2m {
    /// Open a device node, non-blocking. The capability check happens
    /// separately via [`probe_device`](crate::session::probe_device).
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| Error::Device(e.raw_os_error().unwrap_or(0)))?;
        Ok(V4l2M2m { fd: file.into() })
    }

    fn raw(&self) -> libc::c_int {
        self.fd.as_raw_fd()
    }
}

fn device_error(e: Errno) -> Error {
    Error::Device(e as i32)
}

fn rejected(e: Errno) -> Error {
    Error::DeviceRejected(e as i32)
}

fn buf_type(direction: Direction, planar: PlanarApi) -> u32 {
    match (direction, planar) {
        (Direction::Capture, PlanarApi::SinglePlanar) => sys::V4L2_BUF_TYPE_VIDEO_CAPTURE,
        (Direction::Output, PlanarApi::SinglePlanar) => sys::V4L2_BUF_TYPE_VIDEO_OUTPUT,
        (Direction::Capture, PlanarApi::MultiPlanar) => sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
        (Direction::Output, PlanarApi::MultiPlanar) => sys::V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
    }
}

fn memory_mode(memory: MemoryKind) -> u32 {
    match memory {
        MemoryKind::Mmap => sys::V4L2_MEMORY_MMAP,
        MemoryKind::DmaBuf => sys::V4L2_MEMORY_DMABUF,
    }
}

fn field_to_sys(field: Field) -> u32 {
    match field {
        Field::Any => sys::V4L2_FIELD_ANY,
        Field::Progressive => sys::V4L2_FIELD_NONE,
        Field::InterlacedTopFirst => sys::V4L2_FIELD_INTERLACED_TB,
        Field::InterlacedBottomFirst => sys::V4L2_FIELD_INTERLACED_BT,
    }
}

fn field_from_sys(field: u32) -> Field {
    match field {
        sys::V4L2_FIELD_NONE => Field::Progressive,
        sys::V4L2_FIELD_INTERLACED_TB => Field::InterlacedTopFirst,
        sys::V4L2_FIELD_INTERLACED_BT => Field::InterlacedBottomFirst,
        _ => Field::Any,
    }
}

fn planar_of(format: &QueueFormat) -> PlanarApi {
    match format {
        QueueFormat::SinglePlanar(_) => PlanarApi::SinglePlanar,
        QueueFormat::MultiPlanar(_) => PlanarApi::MultiPlanar,
    }
}

fn fill_sys_format(raw: &mut sys::v4l2_format, format: &QueueFormat) {
    match format {
        QueueFormat::SinglePlanar(f) => {
            let pix = unsafe { &mut raw.fmt.pix };
            pix.width = f.width;
            pix.height = f.height;
            pix.pixelformat = f.pixel_format;
            pix.field = field_to_sys(f.field);
            pix.bytesperline = f.bytes_per_line;
            pix.sizeimage = f.size_image;
        }
        QueueFormat::MultiPlanar(f) => {
            // Copy out, mutate, write back: the struct is packed, so
            // field references are not allowed.
            let mut pix_mp = unsafe { raw.fmt.pix_mp };
            pix_mp.width = f.width;
            pix_mp.height = f.height;
            pix_mp.pixelformat = f.pixel_format;
            pix_mp.field = field_to_sys(f.field);
            pix_mp.num_planes = f.planes.len() as u8;
            for (i, plane) in f.planes.iter().enumerate().take(sys::VIDEO_MAX_PLANES) {
                pix_mp.plane_fmt[i].bytesperline = plane.bytes_per_line;
                pix_mp.plane_fmt[i].sizeimage = plane.size_image;
            }
            raw.fmt.pix_mp = pix_mp;
        }
    }
}

fn read_sys_format(raw: &sys::v4l2_format, format: &mut QueueFormat) {
    match format {
        QueueFormat::SinglePlanar(f) => {
            let pix = unsafe { raw.fmt.pix };
            f.width = pix.width;
            f.height = pix.height;
            f.pixel_format = pix.pixelformat;
            f.field = field_from_sys(pix.field);
            f.bytes_per_line = pix.bytesperline;
            f.size_image = pix.sizeimage;
        }
        QueueFormat::MultiPlanar(f) => {
            let pix_mp = unsafe { raw.fmt.pix_mp };
            f.width = pix_mp.width;
            f.height = pix_mp.height;
            f.pixel_format = pix_mp.pixelformat;
            f.field = field_from_sys(pix_mp.field);
            f.planes.clear();
            let count = (pix_mp.num_planes as usize).min(sys::VIDEO_MAX_PLANES);
            for i in 0..count {
                let plane = pix_mp.plane_fmt[i];
                f.planes.push(crate::device::PlaneFormat {
                    bytes_per_line: plane.bytesperline,
                    size_image: plane.sizeimage,
                });
            }
        }
    }
}

impl M2mDevice for V4l2M2m {
    fn capabilities(&self) -> Result<DeviceCaps, Error> {
        let mut cap: sys::v4l2_capability = unsafe { mem::zeroed() };
        unsafe { sys::vidioc_querycap(self.raw(), &mut cap) }.map_err(device_error)?;
        Ok(DeviceCaps::from_bits_truncate(cap.capabilities))
    }

    fn try_format(&self, direction: Direction, format: &mut QueueFormat) -> Result<(), Error> {
        let mut raw: sys::v4l2_format = unsafe { mem::zeroed() };
        raw.type_ = buf_type(direction, planar_of(format));

        // Current format first, so driver-chosen fields we do not manage
        // (colorspace and friends) survive the round trip.
        if let Err(e) = unsafe { sys::vidioc_g_fmt(self.raw(), &mut raw) } {
            error!(?direction, errno = %e, "get format failed");
        }
        fill_sys_format(&mut raw, format);

        unsafe { sys::vidioc_try_fmt(self.raw(), &mut raw) }.map_err(device_error)?;
        read_sys_format(&raw, format);
        Ok(())
    }

    fn commit_format(&self, direction: Direction, format: &mut QueueFormat) -> Result<(), Error> {
        let mut raw: sys::v4l2_format = unsafe { mem::zeroed() };
        raw.type_ = buf_type(direction, planar_of(format));

        if let Err(e) = unsafe { sys::vidioc_g_fmt(self.raw(), &mut raw) } {
            error!(?direction, errno = %e, "get format failed");
        }
        fill_sys_format(&mut raw, format);

        unsafe { sys::vidioc_s_fmt(self.raw(), &mut raw) }.map_err(device_error)?;
        read_sys_format(&raw, format);
        Ok(())
    }

    fn selection_bounds(&self, queue: QueueSpec) -> Result<Rect, Error> {
        let mut sel: sys::v4l2_selection = unsafe { mem::zeroed() };
        sel.type_ = buf_type(queue.direction, queue.planar);
        sel.target = match queue.direction {
            Direction::Output => sys::V4L2_SEL_TGT_CROP_BOUNDS,
            Direction::Capture => sys::V4L2_SEL_TGT_COMPOSE_BOUNDS,
        };
        unsafe { sys::vidioc_g_selection(self.raw(), &mut sel) }.map_err(device_error)?;
        Ok(Rect {
            left: sel.r.left,
            top: sel.r.top,
            width: sel.r.width,
            height: sel.r.height,
        })
    }

    fn set_selection(&self, queue: QueueSpec, rect: Rect) -> Result<Rect, Error> {
        let mut sel: sys::v4l2_selection = unsafe { mem::zeroed() };
        sel.type_ = buf_type(queue.direction, queue.planar);
        sel.target = match queue.direction {
            Direction::Output => sys::V4L2_SEL_TGT_CROP,
            Direction::Capture => sys::V4L2_SEL_TGT_COMPOSE,
        };
        sel.flags = sys::V4L2_SEL_FLAG_LE;
        sel.r = sys::v4l2_rect {
            left: rect.left,
            top: rect.top,
            width: rect.width,
            height: rect.height,
        };
        unsafe { sys::vidioc_s_selection(self.raw(), &mut sel) }.map_err(device_error)?;
        Ok(Rect {
            left: sel.r.left,
            top: sel.r.top,
            width: sel.r.width,
            height: sel.r.height,
        })
    }

    fn request_buffers(
        &self,
        queue: QueueSpec,
        memory: MemoryKind,
        count: u32,
    ) -> Result<u32, Error> {
        let mut req: sys::v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.count = count;
        req.type_ = buf_type(queue.direction, queue.planar);
        req.memory = memory_mode(memory);
        unsafe { sys::vidioc_reqbufs(self.raw(), &mut req) }.map_err(rejected)?;
        Ok(req.count)
    }

    fn query_buffer(
        &self,
        queue: QueueSpec,
        memory: MemoryKind,
        index: u32,
    ) -> Result<SlotInfo, Error> {
        let mut planes: [sys::v4l2_plane; sys::VIDEO_MAX_PLANES] = unsafe { mem::zeroed() };
        let mut buf: sys::v4l2_buffer = unsafe { mem::zeroed() };
        buf.index = index;
        buf.type_ = buf_type(queue.direction, queue.planar);
        buf.memory = memory_mode(memory);
        if queue.planar == PlanarApi::MultiPlanar {
            buf.length = sys::VIDEO_MAX_PLANES as u32;
            buf.m.planes = planes.as_mut_ptr();
        }

        unsafe { sys::vidioc_querybuf(self.raw(), &mut buf) }.map_err(rejected)?;

        let mut info = SlotInfo::default();
        match queue.planar {
            PlanarApi::SinglePlanar => {
                info.planes.push(PlaneLength { length: buf.length });
            }
            PlanarApi::MultiPlanar => {
                let count = (buf.length as usize).min(sys::VIDEO_MAX_PLANES);
                for plane in planes.iter().take(count) {
                    info.planes.push(PlaneLength {
                        length: plane.length,
                    });
                }
            }
        }
        Ok(info)
    }

    fn export_buffer(&self, queue: QueueSpec, index: u32, plane: u32) -> Result<OwnedFd, Error> {
        let mut exp: sys::v4l2_exportbuffer = unsafe { mem::zeroed() };
        exp.type_ = buf_type(queue.direction, queue.planar);
        exp.index = index;
        exp.plane = plane;
        unsafe { sys::vidioc_expbuf(self.raw(), &mut exp) }.map_err(rejected)?;
        // The kernel handed us a fresh descriptor; we own it from here.
        Ok(unsafe { OwnedFd::from_raw_fd(exp.fd) })
    }

    fn enqueue(&self, request: &EnqueueRequest<'_>) -> Result<(), Error> {
        let mut planes: [sys::v4l2_plane; sys::VIDEO_MAX_PLANES] = unsafe { mem::zeroed() };
        let mut buf: sys::v4l2_buffer = unsafe { mem::zeroed() };
        buf.index = request.index;
        buf.type_ = buf_type(request.queue.direction, request.queue.planar);
        buf.memory = memory_mode(request.memory);
        buf.field = field_to_sys(request.field);
        buf.timestamp = libc::timeval {
            tv_sec: request.timestamp.sec as libc::time_t,
            tv_usec: request.timestamp.usec as libc::suseconds_t,
        };

        match request.queue.planar {
            PlanarApi::SinglePlanar => {
                if let Some(plane) = request.planes.first() {
                    if let Some(fd) = plane.fd {
                        buf.m.fd = fd;
                    }
                    buf.length = plane.length;
                }
            }
            PlanarApi::MultiPlanar => {
                let count = request.planes.len().min(sys::VIDEO_MAX_PLANES);
                for (slot, plane) in planes.iter_mut().zip(request.planes).take(count) {
                    slot.length = plane.length;
                    if let Some(fd) = plane.fd {
                        slot.m.fd = fd;
                    }
                }
                buf.length = count as u32;
                buf.m.planes = planes.as_mut_ptr();
            }
        }

        unsafe { sys::vidioc_qbuf(self.raw(), &mut buf) }.map_err(device_error)?;
        Ok(())
    }

    fn dequeue(&self, queue: QueueSpec, memory: MemoryKind) -> Result<Completion, Error> {
        let mut planes: [sys::v4l2_plane; sys::VIDEO_MAX_PLANES] = unsafe { mem::zeroed() };
        let mut buf: sys::v4l2_buffer = unsafe { mem::zeroed() };
        buf.type_ = buf_type(queue.direction, queue.planar);
        buf.memory = memory_mode(memory);
        if queue.planar == PlanarApi::MultiPlanar {
            buf.length = sys::VIDEO_MAX_PLANES as u32;
            buf.m.planes = planes.as_mut_ptr();
        }

        match unsafe { sys::vidioc_dqbuf(self.raw(), &mut buf) } {
            Ok(_) => {}
            Err(Errno::EAGAIN) => return Err(Error::WouldBlock),
            Err(e) => {
                trace!(errno = %e, "dequeue failed");
                return Err(device_error(e));
            }
        }

        Ok(Completion {
            index: buf.index,
            timestamp: DeviceTimestamp {
                sec: buf.timestamp.tv_sec as i64,
                usec: buf.timestamp.tv_usec as i64,
            },
            error: buf.flags & sys::V4L2_BUF_FLAG_ERROR != 0,
        })
    }

    fn wait_ready(&self, direction: Direction, timeout: Option<Duration>) -> Result<bool, Error> {
        let events = match direction {
            Direction::Output => PollFlags::POLLOUT | PollFlags::POLLWRNORM,
            Direction::Capture => PollFlags::POLLIN | PollFlags::POLLRDNORM,
        };
        let poll_timeout = match timeout {
            None => PollTimeout::ZERO,
            Some(timeout) => PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX),
        };

        // Retry indefinitely on signal interruption; propagate anything
        // else.
        loop {
            let mut fds = [PollFd::new(self.fd.as_fd(), events)];
            match poll(&mut fds, poll_timeout) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                    if revents.contains(PollFlags::POLLERR) {
                        // No buffers queued yet looks like POLLERR on
                        // m2m nodes; report "not ready", not a fault.
                        return Ok(false);
                    }
                    return Ok(revents.intersects(events));
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(device_error(e)),
            }
        }
    }

    fn stream_on(&self, queue: QueueSpec) -> Result<(), Error> {
        let kind = buf_type(queue.direction, queue.planar) as libc::c_int;
        unsafe { sys::vidioc_streamon(self.raw(), &kind) }.map_err(device_error)?;
        Ok(())
    }

    fn stream_off(&self, queue: QueueSpec) -> Result<(), Error> {
        let kind = buf_type(queue.direction, queue.planar) as libc::c_int;
        unsafe { sys::vidioc_streamoff(self.raw(), &kind) }.map_err(device_error)?;
        Ok(())
    }
}
