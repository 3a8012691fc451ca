//! Reconciliation of device timestamps with the presentation clock.
//!
//! The device carries timestamps as a coarse (seconds, microseconds)
//! pair and has no way to say "no timestamp", so the exact pair
//! (1 000 000, 0) is reserved as a sentinel. Only that pair is written or
//! recognized as missing; a legitimate large timestamp with a non-zero
//! microsecond part passes through untouched.

pub const USEC_PER_SEC: i64 = 1_000_000;

const SENTINEL_SEC: i64 = 1_000_000;

/// A device-side timestamp, as carried in the kernel buffer metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTimestamp {
    pub sec: i64,
    pub usec: i64,
}

impl DeviceTimestamp {
    /// The reserved "no timestamp" pair.
    pub const NONE: DeviceTimestamp = DeviceTimestamp {
        sec: SENTINEL_SEC,
        usec: 0,
    };

    /// Encode a presentation timestamp in microseconds, or the sentinel.
    pub fn from_pts(pts: Option<i64>) -> Self {
        match pts {
            Some(pts) => DeviceTimestamp {
                sec: pts / USEC_PER_SEC,
                usec: pts % USEC_PER_SEC,
            },
            None => Self::NONE,
        }
    }

    /// Decode back to microseconds; `None` for the exact sentinel pair.
    pub fn to_pts(self) -> Option<i64> {
        if self.sec == SENTINEL_SEC && self.usec == 0 {
            None
        } else {
            Some(self.sec * USEC_PER_SEC + self.usec)
        }
    }
}

/// Choose the timestamp to emit for a dequeued frame.
///
/// The device value wins only when present and strictly greater than the
/// previously emitted timestamp; otherwise the next timestamp is
/// synthesized as `last + interval`. Emitted timestamps are therefore
/// strictly increasing even when the device drops or reorders timestamp
/// metadata.
pub fn next_pts(last: i64, device: Option<i64>, interval: i64) -> i64 {
    match device {
        Some(pts) if pts > last => pts,
        _ => last + interval,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_round_trips_as_missing() {
        assert_eq!(DeviceTimestamp::from_pts(None), DeviceTimestamp::NONE);
        assert_eq!(DeviceTimestamp::NONE.to_pts(), None);
    }

    #[test]
    fn only_the_exact_sentinel_pair_is_missing() {
        // Same second count, non-zero microseconds: a legitimate timestamp.
        let ts = DeviceTimestamp {
            sec: 1_000_000,
            usec: 1,
        };
        assert_eq!(ts.to_pts(), Some(1_000_000 * USEC_PER_SEC + 1));
    }

    #[test]
    fn pts_round_trips_through_the_pair() {
        for pts in [0, 1, 999_999, 1_000_000, 1_234_567_890] {
            assert_eq!(DeviceTimestamp::from_pts(Some(pts)).to_pts(), Some(pts));
        }
    }

    #[test]
    fn missing_device_pts_synthesizes_from_interval() {
        assert_eq!(next_pts(40_000, None, 20_000), 60_000);
    }

    #[test]
    fn non_increasing_device_pts_synthesizes() {
        assert_eq!(next_pts(40_000, Some(40_000), 20_000), 60_000);
        assert_eq!(next_pts(40_000, Some(10_000), 20_000), 60_000);
    }

    #[test]
    fn increasing_device_pts_passes_through() {
        assert_eq!(next_pts(40_000, Some(40_001), 20_000), 40_001);
    }

    #[test]
    fn any_input_sequence_yields_strictly_increasing_output() {
        let inputs = [
            None,
            Some(100),
            Some(100),
            Some(50),
            None,
            Some(1_000_000),
            Some(0),
        ];
        let mut last = 0;
        for input in inputs {
            let pts = next_pts(last, input, 20_000);
            assert!(pts > last, "{pts} not greater than {last}");
            last = pts;
        }
    }
}
