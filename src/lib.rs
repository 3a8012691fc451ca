//! Hardware deinterlacing over memory-to-memory video devices.
//!
//! The crate drives a kernel memory-to-memory deinterlacer: interlaced
//! planar YUV 4:2:0 frames go in as DMABUF handles, progressive frames
//! come back out as DMABUF handles exported from device-allocated
//! buffers.
//!
//! [`DeintPump`] is the entry point. Implement [`SourceFrame`] for your
//! frame type, open a device (on Linux via
//! [`platform::linux::find_device`]), then alternate
//! [`push`](DeintPump::push) and [`pull`](DeintPump::pull) from one
//! driving thread. Output frames ([`DeintFrame`]) keep their backing
//! device buffer alive until dropped and may outlive the pump.

pub mod buffer;
pub mod device;
pub mod error;
pub mod frame;
pub mod platform;
pub mod pts;
pub mod pump;
pub mod queue;
pub mod session;
pub mod types;

pub use device::{Completion, DeviceCaps, M2mDevice, QueueFormat};
pub use error::Error;
pub use frame::{DeintFrame, SourceFrame};
pub use pump::{DeintPump, PushError};
pub use session::{probe_device, SessionConfig};
pub use types::{
    Direction, DmabufDesc, DmabufLayer, DmabufObject, DmabufPlane, Field, FieldOrder, MemoryKind,
    PlanarApi, QueueSpec, Ratio, Rect, Size,
};
