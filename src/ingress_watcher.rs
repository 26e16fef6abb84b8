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

//! Monitor configured namespaces in Kubernetes for labeled `Ingress`es.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::TryStreamExt;
use k8s_openapi::api::networking::v1::{Ingress, IngressSpec};
use kube::runtime::watcher::{Config, Event as WatchEvent};
use kube::Api;
use kube::ResourceExt;

use crate::conf::AppConfig;
use crate::endpoint_watcher::EndpointWatcher;
use crate::history_sink::HistoryPrefill;
use crate::model::{Service, ServiceKey, Source};
use crate::store::{new_service, ClockedStore};

/// An `Ingress` translated into the fields the store needs, or `None` if the
/// ingress has no usable host.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IngressDiscovery {
    host: String,
    scheme: &'static str,
    backend: Option<(String, String)>,
    icon: Option<String>,
}

/// Extract the routable host, scheme and backend service reference from an
/// `Ingress` spec. Returns `None` if no usable host is present (rule host
/// absent and no TLS host either).
fn extract_discovery(spec: &IngressSpec, annotation_prefix: &str, ingress: &Ingress) -> Option<IngressDiscovery> {
    let rules = spec.rules.as_ref();
    let rule_host = rules.and_then(|rules| rules.first()).and_then(|r| r.host.clone());
    let tls_hosts: Vec<&str> = spec
        .tls
        .as_ref()
        .into_iter()
        .flatten()
        .filter_map(|t| t.hosts.as_ref())
        .flatten()
        .map(String::as_str)
        .collect();
    let host = rule_host.or_else(|| tls_hosts.first().map(|h| h.to_string()))?;
    if host.is_empty() {
        return None;
    }
    let scheme = if tls_hosts.contains(&host.as_str()) {
        "https"
    } else {
        "http"
    };
    let backend = rules
        .into_iter()
        .flatten()
        .find(|r| r.http.is_some())
        .and_then(|r| r.http.as_ref())
        .and_then(|http| http.paths.first())
        .and_then(|path| path.backend.service.as_ref())
        .map(|svc| (ingress.namespace().unwrap_or_default(), svc.name.clone()));
    let icon = ingress
        .annotations()
        .iter()
        .find_map(|(k, v)| (k == &format!("{annotation_prefix}icon")).then(|| v.clone()));
    Some(IngressDiscovery {
        host,
        scheme,
        backend,
        icon,
    })
}

/// Leftmost DNS label of a host, used as the discovered display name.
fn leftmost_label(host: &str) -> String {
    host.split('.').next().unwrap_or(host).to_owned()
}

/// Watches configured namespaces for `Ingress`es matching the configured
/// label selector and translates them into [crate::model::Service]
/// discoveries in the [crate::store::Store].
pub struct IngressWatcher {
    app_config: Arc<AppConfig>,
    store: ClockedStore,
    endpoint_watcher: Arc<EndpointWatcher>,
    client: kube::Client,
    history_prefill: Arc<HistoryPrefill>,
    health_started: AtomicBool,
}

impl IngressWatcher {
    /// Return a new instance and start background monitoring of every
    /// configured namespace.
    pub fn new(
        app_config: Arc<AppConfig>,
        store: ClockedStore,
        endpoint_watcher: Arc<EndpointWatcher>,
        client: kube::Client,
        history_prefill: Arc<HistoryPrefill>,
    ) -> Arc<Self> {
        Arc::new(Self {
            app_config,
            store,
            endpoint_watcher,
            client,
            history_prefill,
            health_started: AtomicBool::new(false),
        })
        .start_background_monitoring()
    }

    /// True once the initial list of every configured namespace has
    /// completed at least once.
    pub fn is_health_started(self: &Arc<Self>) -> bool {
        self.health_started.load(Ordering::Relaxed)
    }

    fn start_background_monitoring(self: Arc<Self>) -> Arc<Self> {
        let namespaces = self.app_config.kubernetes.namespaces();
        if namespaces.is_empty() {
            let self_clone = Arc::clone(&self);
            tokio::spawn(async move { self_clone.watch_ingresses(None).await });
        } else {
            for namespace in namespaces {
                let self_clone = Arc::clone(&self);
                tokio::spawn(async move { self_clone.watch_ingresses(Some(namespace)).await });
            }
        }
        self
    }

    /// Watch all `Ingress` objects in `namespace` (or the client's default
    /// namespace) for changes, processing the pre-existing set first.
    async fn watch_ingresses(self: &Arc<Self>, namespace: Option<String>) {
        let label_selector = self.app_config.kubernetes.match_labels();
        let namespace = namespace.unwrap_or_else(|| self.client.default_namespace().to_owned());
        let api = Api::<Ingress>::namespaced(self.client.clone(), &namespace);
        let lp = kube::api::ListParams::default().labels(&label_selector);
        match api.list(&lp).await {
            Ok(object_list) => {
                for ingress in object_list {
                    self.handle_upsert(&ingress);
                }
                self.health_started.store(true, Ordering::Relaxed);
                self.store.set_k8s_connected(true);
            }
            Err(e) => {
                log::warn!("Canceling monitoring of namespace '{namespace}' due to error: {e}");
                self.store.set_k8s_connected(false);
                return;
            }
        }
        let stream = kube::runtime::watcher(api, Config::default().labels(&label_selector));
        stream
            .try_for_each(|event| async move {
                match event {
                    WatchEvent::Applied(ingress) => self.handle_upsert(&ingress),
                    WatchEvent::Deleted(ingress) => self.handle_delete(&ingress),
                    WatchEvent::Restarted(ingresses) => {
                        log::debug!("Ingress watch restarted with {} objects", ingresses.len());
                        for ingress in ingresses {
                            self.handle_upsert(&ingress);
                        }
                    }
                }
                Ok(())
            })
            .await
            .map_err(|e| {
                log::warn!("Canceling monitoring of namespace '{namespace}' due to error: {e}");
            })
            .ok();
        // The watch stream only ever terminates on error or shutdown; either
        // way this namespace's informer is no longer connected.
        self.store.set_k8s_connected(false);
    }

    fn handle_upsert(self: &Arc<Self>, ingress: &Ingress) {
        let Some(spec) = ingress.spec.as_ref() else {
            return;
        };
        let namespace = ingress.namespace().unwrap_or_default();
        let Some(name) = ingress.metadata.name.clone() else {
            return;
        };
        let annotation_prefix = self.app_config.kubernetes.annotation_prefix();
        let Some(discovery) = extract_discovery(spec, &annotation_prefix, ingress) else {
            log::warn!("Ingress '{namespace}/{name}' has no usable rule or TLS host; skipping.");
            return;
        };
        let key = ServiceKey::new(namespace.clone(), name.clone());
        let mut svc = new_service(&namespace, &name, Source::Kubernetes);
        svc.url = format!("{}://{}", discovery.scheme, discovery.host);
        let display = leftmost_label(&discovery.host);
        svc.original_display_name = Some(display.clone());
        svc.display_name = display;
        svc.icon = discovery.icon;
        self.store.add_or_update_ingress(svc);
        self.history_prefill.apply(&self.store, &key);

        match &discovery.backend {
            Some((backend_ns, backend_name)) => {
                self.endpoint_watcher
                    .watch(name.clone(), namespace, backend_ns.clone(), backend_name.clone());
            }
            None => {
                self.endpoint_watcher.unwatch(&name, &namespace);
            }
        }
    }

    fn handle_delete(self: &Arc<Self>, ingress: &Ingress) {
        let namespace = ingress.namespace().unwrap_or_default();
        let Some(name) = ingress.metadata.name.clone() else {
            return;
        };
        self.endpoint_watcher.unwatch(&name, &namespace);
        self.store.remove(&ServiceKey::new(namespace, name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule, IngressServiceBackend,
        IngressTLS,
    };

    fn rule_with_host(host: &str, backend_name: Option<&str>) -> IngressRule {
        IngressRule {
            host: Some(host.to_owned()),
            http: backend_name.map(|name| HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    path: Some("/".to_owned()),
                    path_type: "Prefix".to_owned(),
                    backend: IngressBackend {
                        service: Some(IngressServiceBackend {
                            name: name.to_owned(),
                            port: None,
                        }),
                        ..Default::default()
                    },
                }],
            }),
        }
    }

    fn ingress_with(spec: IngressSpec) -> Ingress {
        Ingress {
            metadata: Default::default(),
            spec: Some(spec),
            status: None,
        }
    }

    #[test]
    fn uses_rule_host_with_https_when_host_is_also_a_tls_host() {
        let spec = IngressSpec {
            rules: Some(vec![rule_with_host("my-app.example.com", Some("my-app-svc"))]),
            tls: Some(vec![IngressTLS {
                hosts: Some(vec!["my-app.example.com".to_owned()]),
                secret_name: None,
            }]),
            ..Default::default()
        };
        let ingress = ingress_with(spec.clone());
        let discovery = extract_discovery(&spec, "microfe/", &ingress).unwrap();
        assert_eq!(discovery.host, "my-app.example.com");
        assert_eq!(discovery.scheme, "https");
        assert_eq!(
            discovery.backend,
            Some((String::new(), "my-app-svc".to_owned()))
        );
    }

    #[test]
    fn falls_back_to_tls_host_when_rule_has_no_host() {
        let spec = IngressSpec {
            rules: Some(vec![IngressRule {
                host: None,
                http: None,
            }]),
            tls: Some(vec![IngressTLS {
                hosts: Some(vec!["tls-only.example.com".to_owned()]),
                secret_name: None,
            }]),
            ..Default::default()
        };
        let ingress = ingress_with(spec.clone());
        let discovery = extract_discovery(&spec, "microfe/", &ingress).unwrap();
        assert_eq!(discovery.host, "tls-only.example.com");
        assert_eq!(discovery.scheme, "https");
    }

    #[test]
    fn no_host_anywhere_yields_none() {
        let spec = IngressSpec {
            rules: Some(vec![IngressRule {
                host: None,
                http: None,
            }]),
            tls: None,
            ..Default::default()
        };
        let ingress = ingress_with(spec.clone());
        assert!(extract_discovery(&spec, "microfe/", &ingress).is_none());
    }

    #[test]
    fn plain_http_host_not_in_tls_list_is_http_scheme() {
        let spec = IngressSpec {
            rules: Some(vec![rule_with_host("plain.example.com", None)]),
            tls: None,
            ..Default::default()
        };
        let ingress = ingress_with(spec.clone());
        let discovery = extract_discovery(&spec, "microfe/", &ingress).unwrap();
        assert_eq!(discovery.scheme, "http");
        assert_eq!(discovery.backend, None);
    }

    #[test]
    fn leftmost_label_is_display_name() {
        assert_eq!(leftmost_label("my-app.example.com"), "my-app");
        assert_eq!(leftmost_label("single-label"), "single-label");
    }
}
