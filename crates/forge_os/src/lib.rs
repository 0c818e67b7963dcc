#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use forge_kernel_contracts::MonotonicTimeNs;

pub mod admission;
pub mod submitter;

pub use admission::{ImageCapGate, DEFAULT_IMAGE_CAP};
pub use submitter::{
    BuildSubmitter, BuildSubmitterConfig, BuildTicket, SubmitError, DEFAULT_BUILD_DEADLINE_SECS,
};

/// Wall-clock nanoseconds since the epoch, saturating at `u64::MAX`.
pub fn system_time_now_ns() -> MonotonicTimeNs {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(1);
    if nanos > u64::MAX as u128 {
        MonotonicTimeNs(u64::MAX)
    } else {
        MonotonicTimeNs(nanos as u64)
    }
}
