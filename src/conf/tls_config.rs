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

//! Parsing of optional TLS material path overrides.
//!
//! mTLS termination itself is out of scope for this crate; what is in
//! scope is validating that the three paths are either all set or all
//! absent.

use config::builder::BuilderState;
use config::ConfigBuilder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::AppConfigDefaults;

/// Optional overrides for the CA/server/client certificate material used by
/// mTLS termination (performed outside this crate).
#[derive(Debug, Deserialize, Serialize)]
pub struct TlsConfig {
    cacertpath: Option<String>,
    certpath: Option<String>,
    keypath: Option<String>,
}

/// The three TLS material paths were not all set or all absent.
#[derive(Debug, Error)]
#[error("TLS material overrides must be supplied as a complete ca/cert/key triple, or not at all")]
pub struct TlsConfigError;

impl AppConfigDefaults for TlsConfig {
    fn set_defaults<T: BuilderState>(
        config_builder: ConfigBuilder<T>,
        prefix: &str,
    ) -> ConfigBuilder<T> {
        config_builder
            .set_default(prefix.to_string() + "." + "cacertpath", "")
            .unwrap()
            .set_default(prefix.to_string() + "." + "certpath", "")
            .unwrap()
            .set_default(prefix.to_string() + "." + "keypath", "")
            .unwrap()
    }
}

impl TlsConfig {
    /// Return the `(ca, cert, key)` override triple if all three were set,
    /// `None` if none were set, and an error if only some were set.
    pub fn material_override(&self) -> Result<Option<(String, String, String)>, TlsConfigError> {
        let present = [&self.cacertpath, &self.certpath, &self.keypath]
            .iter()
            .filter(|value| value.as_ref().is_some_and(|v| !v.is_empty()))
            .count();
        match present {
            0 => Ok(None),
            3 => Ok(Some((
                self.cacertpath.clone().unwrap(),
                self.certpath.clone().unwrap(),
                self.keypath.clone().unwrap(),
            ))),
            _ => Err(TlsConfigError),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(ca: &str, cert: &str, key: &str) -> TlsConfig {
        TlsConfig {
            cacertpath: (!ca.is_empty()).then(|| ca.to_owned()),
            certpath: (!cert.is_empty()).then(|| cert.to_owned()),
            keypath: (!key.is_empty()).then(|| key.to_owned()),
        }
    }

    #[test]
    fn all_absent_is_ok_none() {
        assert!(make("", "", "").material_override().unwrap().is_none());
    }

    #[test]
    fn all_present_is_ok_some() {
        assert!(make("a", "b", "c").material_override().unwrap().is_some());
    }

    #[test]
    fn partial_triple_is_an_error() {
        assert!(make("a", "", "").material_override().is_err());
        assert!(make("", "b", "c").material_override().is_err());
    }
}
