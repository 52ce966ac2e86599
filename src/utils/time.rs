use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

pub(crate) fn get_duration_since_epoch() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

/// return microsecond
pub fn get_now_as_micros() -> u64 {
    get_duration_since_epoch().as_micros() as u64
}

/// return millisecond
pub fn timestamp_millis() -> u64 {
    get_duration_since_epoch().as_millis() as u64
}
