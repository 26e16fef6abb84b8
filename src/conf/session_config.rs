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

//! Session-cookie duration and development-mode toggle.
//!
//! Session cookie handling itself is out of scope for this crate; the
//! duration is parsed here because it is still a process-level option.

use std::time::Duration;

use config::builder::BuilderState;
use config::ConfigBuilder;
use serde::{Deserialize, Serialize};

use super::AppConfigDefaults;

/// Session and development-mode configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct SessionConfig {
    durationsecs: u64,
    devmode: bool,
}

impl AppConfigDefaults for SessionConfig {
    fn set_defaults<T: BuilderState>(
        config_builder: ConfigBuilder<T>,
        prefix: &str,
    ) -> ConfigBuilder<T> {
        config_builder
            .set_default(prefix.to_string() + "." + "durationsecs", "43200")
            .unwrap()
            .set_default(prefix.to_string() + "." + "devmode", "false")
            .unwrap()
    }
}

impl SessionConfig {
    /// Session cookie lifetime. Defaults to 12 hours.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.durationsecs)
    }

    /// Whether development mode is enabled (e.g. relaxed TLS requirements).
    pub fn dev_mode(&self) -> bool {
        self.devmode
    }
}
