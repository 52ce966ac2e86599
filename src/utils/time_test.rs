use std::thread::sleep;

use crate::utils::time::get_duration_since_epoch;
use crate::utils::time::get_now_as_micros;
use crate::utils::time::timestamp_millis;

#[test]
fn test_timestamp_millis() {
    let t1 = timestamp_millis();
    sleep(std::time::Duration::from_millis(10));
    let t2 = timestamp_millis();

    // Ensure time is moving forward
    assert!(t2 > t1);
}

#[test]
fn test_get_duration_since_epoch() {
    let duration = get_duration_since_epoch();
    assert!(duration.as_secs() > 1609459200); // Greater than 2021-01-01
}

#[test]
fn test_micros_and_millis_agree() {
    let micros = get_now_as_micros();
    let millis = timestamp_millis();
    assert!(micros / 1000 <= millis);
    assert!(millis - micros / 1000 < 1000);
}
