//! Monotonic nanosecond clock shared by the vsync machinery and composition.

use std::sync::OnceLock;
use std::time::Instant;

/// Nanoseconds on the service's monotonic timeline
pub type Nsecs = i64;

pub const NSECS_PER_MSEC: Nsecs = 1_000_000;
pub const NSECS_PER_SEC: Nsecs = 1_000_000_000;

fn anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

/// Current monotonic time. Starts near one second so that "time zero"
/// never collides with a real timestamp.
pub fn now_nanos() -> Nsecs {
    NSECS_PER_SEC + anchor().elapsed().as_nanos() as Nsecs
}

pub fn nanos_to_duration(ns: Nsecs) -> std::time::Duration {
    std::time::Duration::from_nanos(ns.max(0) as u64)
}
