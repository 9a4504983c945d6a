//! Freshness tracking for the most recent reading.
//!
//! A reading goes stale purely by elapsed time: there is no timer, the window
//! is evaluated lazily whenever the cache is read. A stale reading is kept,
//! never cleared, but it is not handed out.

use crate::reading::{Millis, Reading};
use thiserror::Error;

/// Why a cached value cannot be reported.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleValue {
    /// Nothing was received since startup
    #[error("no reading received yet")]
    NoReading,
    /// The last reading is older than the freshness window
    #[error("cached value is too old ({age_millis} ms)")]
    Expired { age_millis: Millis },
}

/// Shared freshness predicate: the window edge itself is already stale.
#[inline]
pub fn is_fresh(reading: &Reading, now_millis: Millis, window_millis: Millis) -> bool {
    reading.age_millis(now_millis) < window_millis
}

/// Holds the latest reading and answers whether it may still be reported.
#[derive(Debug)]
pub struct FreshnessCache {
    /// Maximum age of a reported reading
    window_millis: Millis,
    /// Most recently recorded reading
    latest: Option<Reading>,
}

impl FreshnessCache {
    pub fn new(window_millis: Millis) -> Self {
        FreshnessCache {
            window_millis,
            latest: None,
        }
    }

    /// Replace the stored reading unconditionally.
    pub fn record(&mut self, reading: Reading) {
        self.latest = Some(reading);
    }

    /// The latest reading if it is still fresh at `now_millis`.
    ///
    /// # Errors
    /// [`StaleValue::NoReading`] if nothing was recorded yet, otherwise
    /// [`StaleValue::Expired`] once the reading is `window` or more old.
    pub fn get(&self, now_millis: Millis) -> Result<&Reading, StaleValue> {
        match &self.latest {
            None => Err(StaleValue::NoReading),
            Some(reading) if is_fresh(reading, now_millis, self.window_millis) => Ok(reading),
            Some(reading) => Err(StaleValue::Expired {
                age_millis: reading.age_millis(now_millis),
            }),
        }
    }

    /// Whether a value read at `now_millis` would succeed.
    pub fn is_active(&self, now_millis: Millis) -> bool {
        self.get(now_millis).is_ok()
    }

    /// The latest reading regardless of its age.
    pub fn latest(&self) -> Option<&Reading> {
        self.latest.as_ref()
    }
}
