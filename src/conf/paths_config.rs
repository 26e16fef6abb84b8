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

//! Parsing of filesystem path configuration: the data directory, the
//! optional static-service YAML document and the optional history log.

use std::path::PathBuf;

use config::builder::BuilderState;
use config::ConfigBuilder;
use serde::{Deserialize, Serialize};

use super::AppConfigDefaults;

/// Filesystem paths used by the application for its persisted state.
#[derive(Debug, Deserialize, Serialize)]
pub struct PathsConfig {
    /// Root directory for persisted state, e.g. `<data-dir>/certs/...`.
    datadir: String,
    /// Path to the YAML configuration document. Empty means "no static
    /// configuration"; a missing file at a configured path is also valid
    /// (an empty configuration).
    configfile: Option<String>,
    /// Path to the append-only history JSONL file. Empty disables history.
    historyfile: Option<String>,
}

impl AppConfigDefaults for PathsConfig {
    fn set_defaults<T: BuilderState>(
        config_builder: ConfigBuilder<T>,
        prefix: &str,
    ) -> ConfigBuilder<T> {
        config_builder
            .set_default(prefix.to_string() + "." + "datadir", "/data")
            .unwrap()
            .set_default(prefix.to_string() + "." + "configfile", "")
            .unwrap()
            .set_default(prefix.to_string() + "." + "historyfile", "")
            .unwrap()
    }
}

impl PathsConfig {
    /// Root directory for persisted state.
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.datadir)
    }

    /// Path to the CA certificate used for mTLS, under the data directory.
    pub fn ca_cert_path(&self) -> PathBuf {
        self.data_dir().join("certs").join("ca.crt")
    }

    /// Path to the server certificate used for mTLS, under the data
    /// directory.
    pub fn server_cert_path(&self) -> PathBuf {
        self.data_dir().join("certs").join("server.crt")
    }

    /// Path to the server private key used for mTLS, under the data
    /// directory.
    pub fn server_key_path(&self) -> PathBuf {
        self.data_dir().join("certs").join("server.key")
    }

    /// Path to the YAML configuration document, if configured.
    pub fn config_file(&self) -> Option<PathBuf> {
        self.configfile
            .as_ref()
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
    }

    /// Path to the append-only history JSONL file, if configured.
    pub fn history_file(&self) -> Option<PathBuf> {
        self.historyfile
            .as_ref()
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
    }
}
