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

#![warn(missing_docs)]

//! # Homelab service-health dashboard.
//!
//! Discovers network-exposed services from a Kubernetes cluster (and
//! optionally a static YAML configuration), continuously fuses readiness and
//! HTTP probe signals into a composite health status, and streams the
//! resulting state to subscribers over Server-Sent Events.
//!

pub mod conf;
mod endpoint_watcher;
mod event_broker;
mod history_sink;
mod ingress_watcher;
mod model;
mod pod_diagnostic;
mod probe_engine;
mod config_reconciler;
mod rest_api;
mod store;
mod time;

use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

use crate::conf::logging_config::LogFormat;
use crate::conf::{cli::CliArgs, AppConfig};
use crate::config_reconciler::ConfigReconciler;
use crate::endpoint_watcher::EndpointWatcher;
use crate::event_broker::EventBroker;
use crate::history_sink::{FileHistorySink, HistoryPrefill, HistorySink, NullHistorySink};
use crate::ingress_watcher::IngressWatcher;
use crate::pod_diagnostic::PodDiagnosticQuerier;
use crate::store::{ClockedStore, Store};
use crate::time::SystemClock;

/// Application entry point.
fn main() -> ExitCode {
    let cli_args = CliArgs::parse_args();
    let log_format = cli_args
        .log_format
        .as_deref()
        .and_then(|value| (value.eq_ignore_ascii_case("json")).then_some(LogFormat::Json))
        .unwrap_or(LogFormat::Text);
    if let Err(e) = init_logger(log_format) {
        log::error!("Failed to initialize configuration: {e:?}");
        return ExitCode::FAILURE;
    }
    let app_config = Arc::new(AppConfig::from_cli(cli_args));
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(app_config.limits.available_parallelism())
        .build()
        .unwrap()
        .block_on(run_async(app_config))
}

/// Write one log line as a single-object JSON document, matching the shape
/// of the `history` JSONL records: timestamp, level, target, message.
fn write_json_record(
    buf: &mut env_logger::fmt::Formatter,
    record: &log::Record,
) -> std::io::Result<()> {
    use std::io::Write;
    let line = serde_json::json!({
        "ts": chrono::Utc::now().to_rfc3339(),
        "level": record.level().as_str(),
        "target": record.target(),
        "message": record.args().to_string(),
    });
    writeln!(buf, "{line}")
}

/// Initialize the logging system and apply filters. `format` selects between
/// `env_logger`'s default human-readable text format and a single-JSON-object
/// line per record, driven by the `--log-format`/`LOG_FORMAT` process option
/// (CLI wins, since this runs before [AppConfig] itself is built).
fn init_logger(format: LogFormat) -> Result<(), log::SetLoggerError> {
    let env_prefex = AppConfig::read_app_name_lowercase().to_uppercase();
    let mut builder = env_logger::builder();
    builder
        // Set default log level
        .filter_level(log::LevelFilter::Debug)
        // Customize logging for dependencies
        .filter(Some("actix_server"), log::LevelFilter::Warn)
        .filter(Some("rustls::client"), log::LevelFilter::Info)
        .filter(Some("rustls::common_state"), log::LevelFilter::Info)
        .filter(Some("hyper_util::client"), log::LevelFilter::Info)
        .filter(Some("kube_client::client"), log::LevelFilter::Info)
        .filter(Some("tower::buffer::worker"), log::LevelFilter::Info)
        //.write_style(env_logger::fmt::WriteStyle::Never)
        .write_style(env_logger::fmt::WriteStyle::Auto)
        .target(env_logger::fmt::Target::Stdout)
        .is_test(false)
        .parse_env(
            env_logger::Env::new()
                .filter(env_prefex.to_owned() + "_LOG_LEVEL")
                .write_style(env_prefex.to_owned() + "_LOG_STYLE"),
        );
    if format == LogFormat::Json {
        builder.format(write_json_record);
    }
    builder.try_init()
}

/// Build a Kubernetes client, honoring an explicitly configured kubeconfig
/// path if one is set, falling back to in-cluster / default kubeconfig
/// resolution otherwise.
async fn build_kube_client(app_config: &AppConfig) -> Result<kube::Client, String> {
    let Some(kubeconfig_path) = app_config.kubernetes.kubeconfig_path() else {
        return kube::Client::try_default().await.map_err(|e| e.to_string());
    };
    let kubeconfig =
        kube::config::Kubeconfig::read_from(&kubeconfig_path).map_err(|e| e.to_string())?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &kube::config::KubeConfigOptions::default())
        .await
        .map_err(|e| e.to_string())?;
    kube::Client::try_from(config).map_err(|e| e.to_string())
}

/// Async code entry point.
async fn run_async(app_config: Arc<AppConfig>) -> ExitCode {
    // TLS termination itself is out of scope, but a partially supplied
    // ca/cert/key override triple is an operator mistake that should fail
    // startup loudly rather than silently ignore two thirds of it.
    if let Err(e) = app_config.tls.material_override() {
        log::error!("Invalid TLS material override configuration: {e}");
        return ExitCode::FAILURE;
    }

    // Make a quick check that we have a k8s context that we can use.
    let client = match build_kube_client(&app_config).await {
        Ok(client) => {
            match client.apiserver_version().await {
                Ok(info) => log::info!("Kubernetes API version: {info:?}"),
                Err(e) => log::warn!("Could not determine Kubernetes API version: {e:?}"),
            }
            client
        }
        Err(e) => {
            log::error!("Failed to access Kubernetes API. Is this container deployed? {e:?}");
            return ExitCode::FAILURE;
        }
    };

    let clock = Arc::new(SystemClock);
    let store = ClockedStore::new(Store::new(), clock);

    let history_prefill = Arc::new(
        app_config
            .paths
            .history_file()
            .map(|path| HistoryPrefill::load(&path))
            .unwrap_or_else(HistoryPrefill::empty),
    );
    let history_sink: Arc<dyn HistorySink> = match app_config.paths.history_file() {
        Some(path) => match FileHistorySink::open(path.clone()) {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                log::error!("Failed to open history file '{}': {e}", path.display());
                Arc::new(NullHistorySink)
            }
        },
        None => Arc::new(NullHistorySink),
    };

    let reconciler = ConfigReconciler::new(
        &app_config,
        store.clone(),
        Some(Arc::clone(&history_sink)),
        Arc::clone(&history_prefill),
    );
    reconciler.start();

    let pod_diagnostic = Arc::new(PodDiagnosticQuerier::new(client.clone()));
    let endpoint_watcher = EndpointWatcher::new(store.clone(), pod_diagnostic, client.clone());
    let ingress_watcher = IngressWatcher::new(
        Arc::clone(&app_config),
        store.clone(),
        endpoint_watcher,
        client,
        history_prefill,
    );

    let probe_engine = crate::probe_engine::ProbeEngine::new(store.clone(), Arc::clone(&reconciler));
    tokio::spawn(probe_engine.run());

    let broker = EventBroker::new(store.clone(), app_config.app_version());
    tokio::spawn(crate::history_sink::run_write_behind(
        Arc::clone(&broker),
        history_sink,
        app_config.health.interval_millis(),
    ));

    let http_server_future = rest_api::run_http_server(
        Arc::clone(&app_config),
        ingress_watcher,
        broker,
        reconciler,
    );
    let signals_future = block_until_signaled();
    tokio::select! {
        _ = http_server_future => {
            log::trace!("http_server_future finished");
        },
        _ = signals_future => {
            log::trace!("signals_future finished");
        },
    };
    ExitCode::SUCCESS
}

/// Block until SIGTERM or SIGINT is recieved.
async fn block_until_signaled() {
    let mut sigint = signal(SignalKind::interrupt()).unwrap();
    let mut sigterm = signal(SignalKind::terminate()).unwrap();
    tokio::select! {
        _ = sigterm.recv() => {
            log::debug!("SIGTERM recieved.")
        },
        _ = sigint.recv() => {
            log::debug!("SIGINT recieved.")
        },
    };
}
