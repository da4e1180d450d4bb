#![allow(dead_code)]

pub mod decoder;
pub mod resampler;

use lazy_static::lazy_static;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

// -------------------------------------------------------------------------------------------------

/// dB value, which is treated as zero volume factor
const MINUS_INF_IN_DB: f32 = -200.0f32;

// -------------------------------------------------------------------------------------------------

/// Generates a unique usize number, by simply counting atomically upwards from 1.
pub fn unique_usize_id() -> usize {
    static ID_COUNTER: AtomicUsize = AtomicUsize::new(1);
    ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

// -------------------------------------------------------------------------------------------------

/// Convert a linear volume factor to dB.
pub fn linear_to_db(value: f32) -> f32 {
    lazy_static! {
        static ref LIN_TO_DB_FACTOR: f32 = 20.0f32 / 10.0f32.ln();
    }
    if value == 1.0 {
        return 0.0; // avoid rounding errors at exactly 0 dB
    } else if value > 1e-12f32 {
        return value.ln() * *LIN_TO_DB_FACTOR;
    }
    MINUS_INF_IN_DB
}

// -------------------------------------------------------------------------------------------------

/// Convert volume in dB to a linear volume factor.
pub fn db_to_linear(value: f32) -> f32 {
    lazy_static! {
        static ref DB_TO_LIN_FACTOR: f32 = 10.0f32.ln() / 20.0f32;
    }
    if value == 0.0f32 {
        return 1.0f32; // avoid rounding errors at exactly 0 dB
    } else if value > MINUS_INF_IN_DB {
        return (value * *DB_TO_LIN_FACTOR).exp();
    }
    0.0f32
}

// -------------------------------------------------------------------------------------------------

/// Round `value` up to the next multiple of `multiple`.
pub fn next_multiple(value: usize, multiple: usize) -> usize {
    if multiple == 0 || value % multiple == 0 {
        return value;
    }
    value + multiple - (value % multiple)
}

/// Round a sample count up to a whole number of memory pages.
pub fn page_aligned_samples(samples: usize) -> usize {
    // sample elements are 2 bytes wide, so half a page of them per page
    const PAGE_SIZE: usize = 4096;
    next_multiple(samples, PAGE_SIZE / 2)
}

// -------------------------------------------------------------------------------------------------

/// Seconds since the unix epoch, as used for all scheduling decisions.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Format a unix timestamp as `2024-12-31T23:59:59` UTC, as used for recording file names.
pub fn utc_fmt(timestamp: i64) -> String {
    match chrono::DateTime::from_timestamp(timestamp, 0) {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S").to_string(),
        None => String::from("1970-01-01T00:00:00"),
    }
}

/// Current local time with milliseconds, as used for health reports.
pub fn curr_time_fmt_ms() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

// -------------------------------------------------------------------------------------------------

/// A ureq agent with bounded connect/response timeouts for all REST and stream requests.
/// Receiving a streamed body stays unbounded.
pub fn http_agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_connect(Some(timeout))
        .timeout_recv_response(Some(timeout))
        .build()
        .into()
}

// -------------------------------------------------------------------------------------------------

/// An `f32` which can be shared across threads, stored as its raw bits.
/// Used for player volumes and RMS levels which the audio thread publishes or consumes.
#[derive(Debug)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    pub fn load(&self, ordering: Ordering) -> f32 {
        f32::from_bits(self.0.load(ordering))
    }

    pub fn store(&self, value: f32, ordering: Ordering) {
        self.0.store(value.to_bits(), ordering);
    }
}

// -------------------------------------------------------------------------------------------------
