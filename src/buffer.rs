use std::os::fd::{AsRawFd, OwnedFd};

use arrayvec::ArrayVec;

use crate::types::{
    DmabufDesc, DmabufLayer, DmabufObject, DmabufPlane, FORMAT_MOD_LINEAR, FOURCC_YUV420,
    MAX_PLANES,
};

/// Stride and length of one plane of a buffer slot, as reported by the
/// device after registration.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaneInfo {
    pub bytes_per_line: u32,
    pub length: u32,
}

/// One slot of a queue's buffer pool.
///
/// A slot is owned by exactly one of: the free pool (`!enqueued`, no
/// outward handle), the kernel queue (`enqueued`), or a downstream
/// consumer holding the exported handle. The `enqueued` flag and the
/// handle-release guard are the only synchronization; there is no
/// separate lock.
#[derive(Debug)]
pub struct Buffer<F> {
    pub index: u32,
    pub enqueued: bool,
    pub planes: ArrayVec<PlaneInfo, MAX_PLANES>,
    /// DMABUF handles exported from device-allocated memory (capture
    /// slots only). Closed when the slot is torn down or allocation is
    /// rolled back.
    pub exported: ArrayVec<OwnedFd, MAX_PLANES>,
    /// The input frame this slot owns while enqueued on the output
    /// queue. Moved in on submission, dropped on dequeue or teardown.
    pub frame: Option<F>,
}

impl<F> Buffer<F> {
    pub fn new(index: u32) -> Self {
        Buffer {
            index,
            enqueued: false,
            planes: ArrayVec::new(),
            exported: ArrayVec::new(),
            frame: None,
        }
    }

    /// Describe this slot's exported memory as a zero-copy planar
    /// YUV 4:2:0 frame.
    ///
    /// A single contiguous allocation is expanded into three logical
    /// planes: pitches [bpl, bpl/2, bpl/2] and offsets
    /// [0, bpl*h, bpl*h + bpl*h/4], where `h` is the pre-padding
    /// (visible) height. Multiple allocations map one plane each.
    pub fn dmabuf_desc(&self, visible_height: u32) -> DmabufDesc {
        let mut desc = DmabufDesc::default();

        for (fd, info) in self.exported.iter().zip(&self.planes) {
            desc.objects.push(DmabufObject {
                fd: fd.as_raw_fd(),
                size: info.length as usize,
                format_modifier: FORMAT_MOD_LINEAR,
            });
        }

        let mut layer = DmabufLayer {
            format: FOURCC_YUV420,
            planes: ArrayVec::new(),
        };

        if desc.objects.len() > 1 {
            for (i, info) in self.planes.iter().enumerate().take(desc.objects.len()) {
                layer.planes.push(DmabufPlane {
                    object_index: i,
                    offset: 0,
                    pitch: info.bytes_per_line as usize,
                });
            }
        } else {
            let pitch = self
                .planes
                .first()
                .map(|p| p.bytes_per_line as usize)
                .unwrap_or(0);
            let luma = pitch * visible_height as usize;

            layer.planes.push(DmabufPlane {
                object_index: 0,
                offset: 0,
                pitch,
            });
            layer.planes.push(DmabufPlane {
                object_index: 0,
                offset: luma,
                pitch: pitch / 2,
            });
            layer.planes.push(DmabufPlane {
                object_index: 0,
                offset: luma + luma / 4,
                pitch: pitch / 2,
            });
        }

        desc.layers.push(layer);
        desc
    }
}
