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

//! Command-line option parsing.
//!
//! Every field also reads its matching environment variable (`clap`'s `env`
//! feature), and `clap` itself already gives the command line precedence
//! over the environment for a single field. [CliArgs::apply_overrides] then
//! layers whichever value `clap` resolved on top of the file+defaults
//! [config::Config], giving the overall precedence: CLI > env > file >
//! defaults.
//!
//! Secrets are never accepted here; no field holds a credential.

use clap::Parser;
use config::builder::BuilderState;
use config::ConfigBuilder;

/// Homelab service-health dashboard: Kubernetes discovery, composite health
/// checks, and a live event stream.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct CliArgs {
    /// IP address to bind the HTTP transport to.
    #[arg(long, env = "API_ADDRESS")]
    pub api_address: Option<String>,

    /// IP port to bind the HTTP transport to.
    #[arg(long, env = "API_PORT")]
    pub api_port: Option<u16>,

    /// Path to a kubeconfig file. Omit to use in-cluster credentials.
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<String>,

    /// Seconds between the start of one health-probe cycle and the next.
    #[arg(long, env = "HEALTH_INTERVAL_SECS")]
    pub health_interval_secs: Option<u64>,

    /// Per-probe timeout in seconds.
    #[arg(long, env = "HEALTH_TIMEOUT_SECS")]
    pub health_timeout_secs: Option<u64>,

    /// Root directory for persisted state (certificates, history).
    #[arg(long, env = "DATA_DIR")]
    pub data_dir: Option<String>,

    /// Path to the static-service YAML configuration document.
    #[arg(long, env = "CONFIG_FILE")]
    pub config_file: Option<String>,

    /// Path to the append-only history JSONL file.
    #[arg(long, env = "HISTORY_FILE")]
    pub history_file: Option<String>,

    /// Log output format: `text` or `json`.
    #[arg(long, env = "LOG_FORMAT")]
    pub log_format: Option<String>,

    /// CA certificate path override (must be set together with `--cert-path`
    /// and `--key-path`, or not at all).
    #[arg(long, env = "TLS_CA_PATH")]
    pub tls_ca_path: Option<String>,

    /// Server certificate path override.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Server private key path override.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    /// Session cookie lifetime in seconds.
    #[arg(long, env = "SESSION_DURATION_SECS")]
    pub session_duration_secs: Option<u64>,

    /// Enable development mode (relaxed TLS requirements, verbose errors).
    #[arg(long, env = "DEV_MODE")]
    pub dev_mode: bool,
}

impl CliArgs {
    /// Parse from `std::env::args()`.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Layer every CLI/env-resolved option on top of a [ConfigBuilder] as a
    /// `set_override`, which takes precedence over every previously added
    /// source (defaults and the optional JSON file).
    pub fn apply_overrides<T: BuilderState>(
        &self,
        mut builder: ConfigBuilder<T>,
    ) -> ConfigBuilder<T> {
        macro_rules! apply {
            ($field:expr, $key:expr) => {
                if let Some(value) = &$field {
                    builder = builder.set_override($key, value.to_string()).unwrap();
                }
            };
        }
        apply!(self.api_address, "api.address");
        apply!(self.api_port, "api.port");
        apply!(self.kubeconfig, "kubernetes.kubeconfig");
        apply!(self.health_interval_secs, "health.interval_secs");
        apply!(self.health_timeout_secs, "health.timeout_secs");
        apply!(self.data_dir, "paths.datadir");
        apply!(self.config_file, "paths.configfile");
        apply!(self.history_file, "paths.historyfile");
        apply!(self.log_format, "logging.format");
        apply!(self.tls_ca_path, "tls.cacertpath");
        apply!(self.tls_cert_path, "tls.certpath");
        apply!(self.tls_key_path, "tls.keypath");
        apply!(self.session_duration_secs, "session.durationsecs");
        if self.dev_mode {
            builder = builder.set_override("session.devmode", true).unwrap();
        }
        builder
    }
}
