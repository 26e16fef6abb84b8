/*
    Copyright 2024 MydriaTech AB

    Licensed under the Apache License 2.0 with Free world makers exception
    1.0.0 (the "License"); you may not use this file except in compliance with
    the License. You should have obtained a copy of the License with the source
    or binary distribution in file named

        LICENSE-Apache-2.0-with-FWM-Exception-1.0.0

    Unless required by applicable law or agreed to in writing, software
    distributed under the License is distributed on an "AS IS" BASIS,
    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
    See the License for the specific language governing permissions and
    limitations under the License.
*/

//! Time utilities.
//!
//! The [Clock] trait exists so tests can observe `lastChecked` /
//! `lastStateChange` advancing deterministically instead of racing the wall
//! clock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};

/// Return elapsed milliseconds since Unix Epoch time.
pub fn now_as_millis() -> u64 {
    u64::try_from(now().as_millis()).unwrap()
}

/// Return elapsed seconds since Unix Epoch time.
pub fn now_as_secs() -> u64 {
    now().as_secs()
}

/// Return [Duration] since Unix Epoch time.
fn now() -> Duration {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
}

/// Source of timestamps, abstracted so tests can control the passage of time.
pub trait Clock: Send + Sync {
    /// Current time as an RFC 3339 timestamp.
    fn now(&self) -> DateTime<Utc>;
}

/// [Clock] backed by the OS wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// [Clock] double that only advances when explicitly told to. Used by tests
/// that assert on `lastStateChange` ordering without sleeping.
#[derive(Debug, Clone)]
pub struct FixedClock {
    millis: Arc<AtomicI64>,
}

impl FixedClock {
    /// Return a new instance starting at the given epoch milliseconds.
    pub fn new(start_millis: i64) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(start_millis)),
        }
    }

    /// Advance the clock by the given number of milliseconds.
    pub fn advance(&self, millis: i64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        let millis = self.millis.load(Ordering::SeqCst);
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_advances_monotonically() {
        let clock = FixedClock::new(1_000);
        let t0 = clock.now();
        clock.advance(500);
        let t1 = clock.now();
        assert!(t1 > t0);
    }
}
