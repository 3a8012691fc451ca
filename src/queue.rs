use std::os::fd::RawFd;
use std::time::Duration;

use arrayvec::ArrayVec;
use tracing::{debug, trace, warn};

use crate::buffer::{Buffer, PlaneInfo};
use crate::device::{Completion, EnqueuePlane, EnqueueRequest, M2mDevice, QueueFormat};
use crate::error::Error;
use crate::pts::DeviceTimestamp;
use crate::types::{Direction, Field, MemoryKind, QueueSpec, MAX_PLANES};

/// The buffer pool for one direction of the device.
///
/// Owns the buffer array and mediates every transition between "free"
/// and "enqueued". Output slots wrap caller-supplied DMABUF handles;
/// capture slots wrap device-allocated memory that is exported back out
/// as DMABUF handles.
#[derive(Debug)]
pub struct Queue<F> {
    spec: QueueSpec,
    memory: MemoryKind,
    depth: u32,
    format: Option<QueueFormat>,
    buffers: Vec<Buffer<F>>,
}

impl<F> Queue<F> {
    pub fn new(spec: QueueSpec, memory: MemoryKind, depth: u32) -> Self {
        Queue {
            spec,
            memory,
            depth,
            format: None,
            buffers: Vec::new(),
        }
    }

    pub fn spec(&self) -> QueueSpec {
        self.spec
    }

    pub fn memory(&self) -> MemoryKind {
        self.memory
    }

    /// The configured (pre-allocation) or granted (post-allocation)
    /// buffer count.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn format(&self) -> Option<&QueueFormat> {
        self.format.as_ref()
    }

    pub fn set_format(&mut self, format: QueueFormat) {
        self.format = Some(format);
    }

    pub fn buffer(&self, index: u32) -> Option<&Buffer<F>> {
        self.buffers.get(index as usize)
    }

    pub fn buffer_mut(&mut self, index: u32) -> Option<&mut Buffer<F>> {
        self.buffers.get_mut(index as usize)
    }

    /// Request and register buffer slots with the device.
    ///
    /// The device may grant fewer slots than asked for; the granted
    /// count becomes this queue's depth. Capture slots are submitted to
    /// the device and exported as DMABUF handles immediately, so the
    /// device has buffers to fill from the instant streaming starts. Any
    /// failure rolls back by closing every handle exported so far.
    pub fn allocate<D: M2mDevice>(&mut self, device: &D) -> Result<(), Error> {
        let format = self.format.clone().ok_or(Error::AllocationFailed)?;

        let granted = device
            .request_buffers(self.spec, self.memory, self.depth)
            .inspect_err(|e| warn!(?e, "buffer request rejected"))?;
        self.depth = granted;
        debug!(
            direction = ?self.spec.direction,
            granted, "allocated queue slots"
        );

        self.buffers = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            if let Err(e) = self.register_slot(device, &format, index) {
                self.buffers.clear();
                return Err(e);
            }
        }

        Ok(())
    }

    fn register_slot<D: M2mDevice>(
        &mut self,
        device: &D,
        format: &QueueFormat,
        index: u32,
    ) -> Result<(), Error> {
        let info = device.query_buffer(self.spec, self.memory, index)?;

        let mut buf = Buffer::new(index);
        for (plane, reported) in info.planes.iter().enumerate() {
            let bytes_per_line = match format {
                QueueFormat::SinglePlanar(f) => f.bytes_per_line,
                QueueFormat::MultiPlanar(f) => f
                    .planes
                    .get(plane)
                    .map(|p| p.bytes_per_line)
                    .unwrap_or(0),
            };
            buf.planes.push(PlaneInfo {
                bytes_per_line,
                length: reported.length,
            });
        }
        self.buffers.push(buf);

        if self.spec.direction == Direction::Capture {
            self.enqueue_slot(device, index, Field::Progressive, DeviceTimestamp::NONE, &[])?;

            let plane_count = self.buffers[index as usize].planes.len() as u32;
            for plane in 0..plane_count {
                let fd = device.export_buffer(self.spec, index, plane)?;
                let buf = &mut self.buffers[index as usize];
                buf.exported.push(fd);
            }
        }

        Ok(())
    }

    /// First non-enqueued slot, if any. All-busy is a normal condition
    /// under load, not an error.
    pub fn find_free(&self) -> Option<u32> {
        self.buffers
            .iter()
            .find(|b| !b.enqueued)
            .map(|b| b.index)
    }

    pub fn count_enqueued(&self) -> usize {
        self.buffers.iter().filter(|b| b.enqueued).count()
    }

    /// Submit one slot to the device. `fds` carries the caller's DMABUF
    /// handles for output slots and is empty for device-allocated
    /// capture slots.
    pub fn enqueue_slot<D: M2mDevice>(
        &mut self,
        device: &D,
        index: u32,
        field: Field,
        timestamp: DeviceTimestamp,
        fds: &[RawFd],
    ) -> Result<(), Error> {
        let buf = self.buffers.get_mut(index as usize).ok_or(Error::AllocationFailed)?;
        debug_assert!(!buf.enqueued, "slot {index} enqueued twice");

        let mut planes: ArrayVec<EnqueuePlane, MAX_PLANES> = ArrayVec::new();
        for (i, info) in buf.planes.iter().enumerate() {
            planes.push(EnqueuePlane {
                fd: fds.get(i).copied(),
                length: info.length,
            });
        }

        let request = EnqueueRequest {
            queue: self.spec,
            index,
            memory: self.memory,
            field,
            timestamp,
            planes: &planes,
        };
        device.enqueue(&request)?;

        buf.enqueued = true;
        trace!(direction = ?self.spec.direction, index, "enqueued slot");
        Ok(())
    }

    /// Wait for and reap one completion. The slot returns to the free
    /// pool; the caller decides what to do with the completion.
    pub fn dequeue<D: M2mDevice>(
        &mut self,
        device: &D,
        timeout: Option<Duration>,
    ) -> Result<Completion, Error> {
        if !device.wait_ready(self.spec.direction, timeout)? {
            return Err(Error::WouldBlock);
        }

        let completion = device.dequeue(self.spec, self.memory)?;
        if let Some(buf) = self.buffers.get_mut(completion.index as usize) {
            buf.enqueued = false;
        }
        trace!(
            direction = ?self.spec.direction,
            index = completion.index,
            "dequeued slot"
        );
        Ok(completion)
    }

    /// Opportunistically reclaim completed slots, releasing the input
    /// frame each one owned. Best-effort: stops at the first slot that
    /// is not ready.
    pub fn recycle<D: M2mDevice>(&mut self, device: &D) {
        loop {
            match self.dequeue(device, None) {
                Ok(completion) => {
                    if let Some(buf) = self.buffers.get_mut(completion.index as usize) {
                        buf.frame = None;
                    }
                }
                Err(e) => {
                    if !e.is_flow_control() {
                        trace!(?e, "recycle stopped");
                    }
                    return;
                }
            }
        }
    }

    /// Drop the input frames of every still-enqueued slot. Used at
    /// teardown, when the kernel queue is going away.
    pub fn release_queued_frames(&mut self) {
        for buf in &mut self.buffers {
            if buf.enqueued {
                buf.frame = None;
            }
        }
    }

    pub fn stream_on<D: M2mDevice>(&self, device: &D) -> Result<(), Error> {
        device.stream_on(self.spec)
    }

    pub fn stream_off<D: M2mDevice>(&self, device: &D) -> Result<(), Error> {
        device.stream_off(self.spec)
    }
}
