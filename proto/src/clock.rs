//! Wall-clock helpers. Port rotation is keyed on whole unix minutes.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const ROTATION_SECS: u64 = 60;

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

/// Knock timestamps are unsigned 32-bit epoch seconds.
pub fn now_unix_u32() -> u32 {
    u32::try_from(now_unix()).unwrap_or(u32::MAX)
}

pub fn unix_minute(unix_secs: u64) -> u64 {
    unix_secs / ROTATION_SECS
}

/// Time left before the port sequence rotates.
pub fn until_next_rotation() -> Duration {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0));
    until_next_rotation_from(now)
}

pub fn until_next_rotation_from(since_epoch: Duration) -> Duration {
    let period = Duration::from_secs(ROTATION_SECS);
    let into_window = Duration::from_nanos(
        (since_epoch.as_nanos() % period.as_nanos()) as u64,
    );
    period - into_window
}
