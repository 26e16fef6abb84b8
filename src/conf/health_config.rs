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

//! Parsing of configuration for the periodic composite health probe.

use std::time::Duration;

use config::builder::BuilderState;
use config::ConfigBuilder;
use serde::{Deserialize, Serialize};

use super::AppConfigDefaults;

/// Configuration for the periodic health probe cycle.
#[derive(Debug, Deserialize, Serialize)]
pub struct HealthConfig {
    /// Seconds between the start of one probe cycle and the next.
    interval_secs: u64,
    /// Per-probe timeout in seconds.
    timeout_secs: u64,
}

impl AppConfigDefaults for HealthConfig {
    fn set_defaults<T: BuilderState>(
        config_builder: ConfigBuilder<T>,
        prefix: &str,
    ) -> ConfigBuilder<T> {
        config_builder
            .set_default(prefix.to_string() + "." + "interval_secs", "30")
            .unwrap()
            .set_default(prefix.to_string() + "." + "timeout_secs", "10")
            .unwrap()
    }
}

impl HealthConfig {
    /// Interval between probe cycles. Defaults to 30 seconds.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Per-probe timeout. Defaults to 10 seconds.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Interval in milliseconds, as surfaced on the `state` SSE event.
    pub fn interval_millis(&self) -> u64 {
        self.interval_secs * 1000
    }
}
