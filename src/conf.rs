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

//! Parsing of application configuration.

pub mod api_config;
pub mod cli;
pub mod health_config;
pub mod kubernetes_config;
pub mod limits_config;
pub mod logging_config;
pub mod paths_config;
pub mod session_config;
pub mod tls_config;

use config::builder::BuilderState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};

use self::api_config::ApiConfig;
use self::cli::CliArgs;
use self::health_config::HealthConfig;
use self::kubernetes_config::KubernetesConfig;
use self::limits_config::ResourceLimitsConfig;
use self::logging_config::LoggingConfig;
use self::paths_config::PathsConfig;
use self::session_config::SessionConfig;
use self::tls_config::TlsConfig;

/// Package name reported by Cargo at build time.
const CARGO_PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version reported by Cargo at build time.
const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Static trait for tracking implementations.
trait AppConfigDefaults {
    fn set_defaults<T: BuilderState>(
        config_builder: ConfigBuilder<T>,
        prefix: &str,
    ) -> ConfigBuilder<T>;
}

/**
Application configration root.

The application name defaults to the Rust package name, but can be overridden
with the environment variable `APP_NAME`.

Configuration is layered, highest precedence first:

1. Command-line flags (see [cli::CliArgs]).
2. Environment variable overrides, either in the form
   `{APPLICATION_NAME}_MODULE_CONFIGKEYWITHOUTSPACES` or (for options that
   also accept a dedicated CLI flag) the flag's own `env` name.
3. The file `{application name}.json` in the current working directory.
4. Built-in defaults.
 */
#[derive(Debug, Deserialize, Serialize)]
pub struct AppConfig {
    /// Configuration of the exposed REST API.
    pub api: ApiConfig,
    /// Discovery of labeled Kubernetes `Ingress`es and their backends.
    pub kubernetes: KubernetesConfig,
    /// Resource detection and configuration overrides.
    pub limits: ResourceLimitsConfig,
    /// Periodic composite health probe configuration.
    pub health: HealthConfig,
    /// Filesystem paths for persisted state.
    pub paths: PathsConfig,
    /// Optional TLS material path overrides.
    pub tls: TlsConfig,
    /// Log output format.
    pub logging: LoggingConfig,
    /// Session duration and development-mode toggle.
    pub session: SessionConfig,

    /// Lower case application name. Ignored when loading configuration.
    #[serde(skip_deserializing)]
    app_name: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AppConfig {
    /**
       The application name defaults to the Rust package name, but can be overridden
       with the environment variable `APP_NAME`.
    */
    pub fn read_app_name_lowercase() -> String {
        std::env::var("APP_NAME")
            .map_err(|e| {
                log::debug!(
                    "Environment variable APP_NAME: {e:?} -> Default app name '{}' will be used.",
                    CARGO_PKG_NAME.to_owned()
                );
            })
            .ok()
            .map(|value| value.to_lowercase())
            .unwrap_or(CARGO_PKG_NAME.to_owned())
    }

    /// Lower case application name.
    pub fn app_name_lowercase(&self) -> &str {
        &self.app_name
    }

    /// SemVer application version derived fromt the Rust package version.
    pub fn app_version(&self) -> &'static str {
        CARGO_PKG_VERSION
    }

    /**
       Creates a new instance pre-populated with defaults, an optional
       configuration file, environment variable overrides and, finally,
       command-line overrides.
    */
    pub fn new() -> Self {
        Self::from_cli(CliArgs::parse_args())
    }

    /// Like [Self::new], but takes already-parsed CLI arguments. Exists so
    /// tests can build an [AppConfig] without touching `std::env::args()`.
    pub fn from_cli(cli_args: CliArgs) -> Self {
        let app_name = Self::read_app_name_lowercase();
        let config_filename = app_name.to_owned() + ".json";
        let config_env_prefix = &app_name.to_uppercase();
        let mut config_builder = Config::builder();
        config_builder = ApiConfig::set_defaults(config_builder, "api");
        config_builder = KubernetesConfig::set_defaults(config_builder, "kubernetes");
        config_builder = ResourceLimitsConfig::set_defaults(config_builder, "limits");
        config_builder = HealthConfig::set_defaults(config_builder, "health");
        config_builder = PathsConfig::set_defaults(config_builder, "paths");
        config_builder = TlsConfig::set_defaults(config_builder, "tls");
        config_builder = LoggingConfig::set_defaults(config_builder, "logging");
        config_builder = SessionConfig::set_defaults(config_builder, "session");
        let conf_file = std::env::current_dir().unwrap().join(config_filename);
        if log::log_enabled!(log::Level::Debug) {
            log::debug!(
                "Will load '{}' configuration if present.",
                conf_file.display()
            );
        }
        config_builder = config_builder
            .add_source(File::with_name(conf_file.as_os_str().to_str().unwrap()).required(false))
            .add_source(
                Environment::with_prefix(config_env_prefix)
                    .separator("_")
                    .list_separator(","),
            );
        config_builder = cli_args.apply_overrides(config_builder);
        let config = config_builder.build().unwrap();
        let mut app_config: AppConfig = config.try_deserialize().unwrap();
        app_config.app_name = app_name;
        if log::log_enabled!(log::Level::Debug) {
            log::info!(
                "Running with configuration: {}",
                serde_json::to_string(&app_config).unwrap()
            );
        }
        app_config
    }
}
