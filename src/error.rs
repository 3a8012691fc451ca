use thiserror::Error;

/// Top-level crate error.
///
/// `QueueFull`, `WouldBlock` and `EndOfStream` are flow-control signals,
/// not faults: the pump surfaces them so the caller can pace the stream,
/// and they are never logged as errors. Everything else is fatal to the
/// session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No device node exposes the memory-to-memory capability.
    #[error("no usable memory-to-memory device found")]
    NoDeviceFound,

    /// The device lacks streaming or memory-to-memory capability bits.
    #[error("device does not support streaming memory-to-memory operation")]
    UnsupportedDevice,

    /// The device rejected planar YUV 4:2:0 on one of its queues.
    #[error("device does not accept the required planar format")]
    FormatUnsupported,

    /// Buffer bookkeeping could not be allocated.
    #[error("buffer allocation failed")]
    AllocationFailed,

    /// The kernel rejected buffer setup (request/query/export).
    #[error("device rejected buffer setup (errno {0})")]
    DeviceRejected(i32),

    /// Every output buffer is in flight; hold the frame and retry after a
    /// completion has been reclaimed.
    #[error("all output buffers are in flight")]
    QueueFull,

    /// No completed buffer was ready within the wait bound.
    #[error("no completed buffer available")]
    WouldBlock,

    /// Upstream signalled end of stream; no further frames will be produced.
    #[error("end of stream")]
    EndOfStream,

    /// Opaque kernel failure, surfaced with the underlying errno
    /// (0 when no code is available).
    #[error("device error (errno {0})")]
    Device(i32),
}

impl Error {
    /// True for the recoverable backpressure signals the pump handles by
    /// pacing, as opposed to faults that end the session.
    pub fn is_flow_control(&self) -> bool {
        matches!(
            self,
            Error::QueueFull | Error::WouldBlock | Error::EndOfStream
        )
    }
}
