use std::{thread, time::Duration};

use chrono::Local;

/// Current local time, for log line prefixes.
pub fn timestr() -> String {
    Local::now().format("%T%.3f").to_string()
}

pub fn sleep(millis: u64) {
    thread::sleep(Duration::from_millis(millis));
}

/// Generate a fresh node id: 16 lowercase hex characters from 8 random bytes.
pub fn generate_id() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}
