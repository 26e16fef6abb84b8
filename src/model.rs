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

//! The central data model: [Service], its fused [ServiceStatus] and the
//! [Event]s the [crate::store::Store] emits when it changes.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Uniquely identifies a [Service]. Stable for the lifetime of the service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    /// Kubernetes namespace, or the string `"config"` for file-defined services.
    pub namespace: String,
    /// Service name, unique within `namespace`.
    pub name: String,
}

impl ServiceKey {
    /// Return a new key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Where a [Service] was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Discovered from a Kubernetes `Ingress`.
    Kubernetes,
    /// Declared in the static YAML configuration file.
    Config,
}

/// Raw probe outcome, before fusion with Kubernetes readiness signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Probe succeeded with an expected status code.
    Healthy,
    /// Probe failed: transport error, timeout, or unexpected status code.
    Unhealthy,
    /// Live-but-protected: Kubernetes-fronted, ready, but probe returned 401/403
    /// or Kubernetes readiness tempers an otherwise-unhealthy raw probe.
    Degraded,
    /// No probe has completed yet.
    #[serde(rename = "unknown")]
    Unknown,
}

/// Backend-container failure enrichment gathered by the pod diagnostic
/// querier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodDiagnostic {
    /// Most severe reason observed across not-ready pods, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Summed container restart count across not-ready pods.
    #[serde(rename = "restartCount")]
    pub restart_count: u32,
}

/// A network-exposed service tracked by the store.
///
/// `compositeStatus` is always derived (never assigned directly by callers),
/// and `lastStateChange` only advances when it actually changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    /// Service name, unique within `namespace`.
    pub name: String,
    /// Display name, possibly overridden by config; defaults to `name`.
    #[serde(rename = "displayName")]
    pub display_name: String,
    /// Display name as discovered, before any override was applied. `None`
    /// for config-sourced services, which have no "original" to restore.
    #[serde(rename = "originalDisplayName", skip_serializing_if = "Option::is_none")]
    pub original_display_name: Option<String>,
    /// Kubernetes namespace, or `"config"` for file-defined services.
    pub namespace: String,
    /// Display grouping; defaults to `namespace`.
    pub group: String,
    /// External URL (scheme + host) the service is reached at.
    pub url: String,
    /// Optional icon identifier/URL for the UI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Where this service was discovered.
    pub source: Source,

    /// Raw probe status; see [ServiceStatus].
    pub status: ServiceStatus,
    /// Fused status consumed by the UI. Always derived; see
    /// [composite_status].
    #[serde(rename = "compositeStatus")]
    pub composite_status: ServiceStatus,
    /// HTTP status code of the last probe, if any.
    #[serde(rename = "httpCode", skip_serializing_if = "Option::is_none")]
    pub http_code: Option<u16>,
    /// Wall-clock time of the last probe in milliseconds, if any.
    #[serde(rename = "responseTimeMs", skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    /// Last probe timestamp.
    #[serde(rename = "lastChecked", skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    /// Timestamp of the most recent `compositeStatus` change.
    #[serde(rename = "lastStateChange", skip_serializing_if = "Option::is_none")]
    pub last_state_change: Option<DateTime<Utc>>,
    /// First 80 characters of the last probe error, if any, with tabs and
    /// newlines stripped.
    #[serde(rename = "errorSnippet", skip_serializing_if = "Option::is_none")]
    pub error_snippet: Option<String>,

    /// Ready backend endpoint count, from EndpointSlice aggregation.
    #[serde(rename = "readyEndpoints", skip_serializing_if = "Option::is_none")]
    pub ready_endpoints: Option<u32>,
    /// Total backend endpoint count, from EndpointSlice aggregation.
    #[serde(rename = "totalEndpoints", skip_serializing_if = "Option::is_none")]
    pub total_endpoints: Option<u32>,
    /// True if the last probe was a 401/403 against a Kubernetes-sourced
    /// service.
    #[serde(rename = "authGuarded")]
    pub auth_guarded: bool,
    /// Container-failure enrichment for not-ready backend pods.
    #[serde(rename = "podDiagnostic", skip_serializing_if = "Option::is_none")]
    pub pod_diagnostic: Option<PodDiagnostic>,

    /// Explicit health-check URL, if different from `url`.
    #[serde(rename = "healthUrl", skip_serializing_if = "Option::is_none")]
    pub health_url: Option<String>,
    /// HTTP status codes considered healthy. Defaults to `{200}`.
    #[serde(rename = "expectedStatusCodes", skip_serializing_if = "Option::is_none")]
    pub expected_status_codes: Option<BTreeSet<u16>>,

    /// Backend Kubernetes `Service` reference, used by the endpoint watcher.
    /// Not part of the wire representation.
    #[serde(skip)]
    pub backend_service: Option<ServiceKey>,
}

impl Service {
    /// Key uniquely identifying this service.
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.namespace.clone(), self.name.clone())
    }

    /// Status codes considered healthy for this service.
    pub fn expected_status_codes(&self) -> BTreeSet<u16> {
        self.expected_status_codes
            .clone()
            .unwrap_or_else(|| BTreeSet::from([200]))
    }

    /// URL a probe should be issued against: `healthUrl` if set, else `url`.
    pub fn probe_url(&self) -> &str {
        self.health_url.as_deref().unwrap_or(&self.url)
    }

    /// Recompute [Service::composite_status] from the current fields and, if
    /// it changed, advance `lastStateChange` to `at`. Returns `true` if the
    /// composite status changed.
    ///
    /// This is the single place `composite_status` is ever written: callers
    /// must never assign it directly.
    pub fn recompute_composite_status(&mut self, at: DateTime<Utc>) -> bool {
        let next = composite_status(
            self.source,
            self.status,
            self.ready_endpoints,
            self.total_endpoints,
            self.auth_guarded,
        );
        if next != self.composite_status {
            self.composite_status = next;
            self.last_state_change = Some(at);
            true
        } else {
            false
        }
    }
}

/// The composite-status fusion rule. A pure function of raw probe outcome,
/// Kubernetes readiness and the auth-guarded heuristic — never assigned
/// directly by any component.
pub fn composite_status(
    source: Source,
    raw_status: ServiceStatus,
    ready_endpoints: Option<u32>,
    total_endpoints: Option<u32>,
    auth_guarded: bool,
) -> ServiceStatus {
    if source == Source::Config {
        return raw_status;
    }
    match raw_status {
        ServiceStatus::Healthy => ServiceStatus::Healthy,
        ServiceStatus::Unknown => ServiceStatus::Unknown,
        ServiceStatus::Unhealthy | ServiceStatus::Degraded => {
            let ready = ready_endpoints.unwrap_or(0);
            let total = total_endpoints.unwrap_or(0);
            if ready >= 1 {
                if auth_guarded {
                    ServiceStatus::Healthy
                } else {
                    ServiceStatus::Degraded
                }
            } else if total > 0 {
                ServiceStatus::Unhealthy
            } else {
                ServiceStatus::Unhealthy
            }
        }
    }
}

/// Change events emitted by the [crate::store::Store] and fanned out by the
/// [crate::event_broker::EventBroker].
#[derive(Debug, Clone)]
pub enum Event {
    /// A new service was added.
    Discovered(Service),
    /// An existing service changed.
    Updated(Service),
    /// A service was removed.
    Removed(ServiceKey),
    /// The cluster connectivity flag changed.
    K8sStatus {
        /// Whether the informer cache is currently connected/synced.
        connected: bool,
        /// When this connectivity state was observed.
        at: DateTime<Utc>,
    },
    /// The set of configuration validation errors changed.
    ConfigErrors(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_source_passes_through_raw_status() {
        assert_eq!(
            composite_status(Source::Config, ServiceStatus::Unhealthy, None, None, false),
            ServiceStatus::Unhealthy
        );
        assert_eq!(
            composite_status(Source::Config, ServiceStatus::Healthy, None, None, false),
            ServiceStatus::Healthy
        );
    }

    #[test]
    fn k8s_healthy_raw_is_always_healthy() {
        assert_eq!(
            composite_status(Source::Kubernetes, ServiceStatus::Healthy, Some(0), Some(3), false),
            ServiceStatus::Healthy
        );
    }

    #[test]
    fn k8s_unhealthy_with_ready_and_auth_guarded_is_healthy() {
        assert_eq!(
            composite_status(Source::Kubernetes, ServiceStatus::Unhealthy, Some(2), Some(3), true),
            ServiceStatus::Healthy
        );
    }

    #[test]
    fn k8s_unhealthy_with_ready_not_guarded_is_degraded() {
        assert_eq!(
            composite_status(Source::Kubernetes, ServiceStatus::Unhealthy, Some(2), Some(3), false),
            ServiceStatus::Degraded
        );
    }

    #[test]
    fn k8s_unhealthy_zero_ready_is_unhealthy() {
        assert_eq!(
            composite_status(Source::Kubernetes, ServiceStatus::Unhealthy, Some(0), Some(3), false),
            ServiceStatus::Unhealthy
        );
    }

    #[test]
    fn k8s_unhealthy_zero_total_is_unhealthy() {
        assert_eq!(
            composite_status(Source::Kubernetes, ServiceStatus::Unhealthy, None, None, false),
            ServiceStatus::Unhealthy
        );
    }

    #[test]
    fn k8s_unknown_pre_probe_is_unknown() {
        assert_eq!(
            composite_status(Source::Kubernetes, ServiceStatus::Unknown, None, None, false),
            ServiceStatus::Unknown
        );
    }

    #[test]
    fn recompute_advances_last_state_change_only_on_change() {
        let t0 = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let t1 = DateTime::parse_from_rfc3339("2026-01-01T00:00:01Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut svc = Service {
            name: "svc".into(),
            display_name: "svc".into(),
            original_display_name: None,
            namespace: "default".into(),
            group: "default".into(),
            url: "https://svc".into(),
            icon: None,
            source: Source::Config,
            status: ServiceStatus::Unknown,
            composite_status: ServiceStatus::Unknown,
            http_code: None,
            response_time_ms: None,
            last_checked: None,
            last_state_change: None,
            error_snippet: None,
            ready_endpoints: None,
            total_endpoints: None,
            auth_guarded: false,
            pod_diagnostic: None,
            health_url: None,
            expected_status_codes: None,
            backend_service: None,
        };
        assert!(svc.recompute_composite_status(t0));
        assert_eq!(svc.last_state_change, Some(t0));

        svc.status = ServiceStatus::Healthy;
        assert!(svc.recompute_composite_status(t1));
        assert_eq!(svc.last_state_change, Some(t1));

        // No change in raw status -> no change in composite -> lastStateChange frozen.
        let t2 = DateTime::parse_from_rfc3339("2026-01-01T00:00:02Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(!svc.recompute_composite_status(t2));
        assert_eq!(svc.last_state_change, Some(t1));
    }
}
