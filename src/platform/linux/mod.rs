//! Linux V4L2 backend.

pub mod device;
pub mod sys;

use std::fs;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::error::Error;
use crate::session::probe_device;
use crate::types::{PlanarApi, Size};

pub use device::V4l2M2m;

/// Scan `/dev` for video nodes and return the first one that probes as a
/// usable deinterlacer at the given geometry.
pub fn find_device(size: Size) -> Result<(V4l2M2m, PlanarApi), Error> {
    let entries = fs::read_dir("/dev").map_err(|e| {
        debug!(error = %e, "cannot enumerate /dev");
        Error::NoDeviceFound
    })?;

    let mut nodes: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("video"))
        })
        .collect();
    nodes.sort();

    for path in nodes {
        let device = match V4l2M2m::open(&path) {
            Ok(device) => device,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "open failed");
                continue;
            }
        };
        match probe_device(&device, size) {
            Ok(planar) => {
                info!(path = %path.display(), ?planar, "using device");
                return Ok((device, planar));
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "probe failed");
            }
        }
    }

    Err(Error::NoDeviceFound)
}
