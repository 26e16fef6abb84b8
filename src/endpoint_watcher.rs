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

//! Cluster-wide `EndpointSlice` readiness aggregation, fanned out to every
//! interested `Ingress`.
//!
//! A single watcher over every `EndpointSlice` in the cluster, grouped by
//! the `kubernetes.io/service-name` label, dispatching readiness changes to
//! every `Ingress` whose backend matches. `kube::runtime::watcher` is used
//! directly here (rather than a reflector-backed store) because this
//! component needs explicit `Deleted` events to retire stale slices.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use futures::TryStreamExt;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::watcher::{Config, Event as WatchEvent};
use kube::{Api, ResourceExt};

use crate::model::ServiceKey;
use crate::pod_diagnostic::PodDiagnosticQuerier;
use crate::store::ClockedStore;

const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// `(namespace, service name)` of a backend `Service`.
type Backend = (String, String);

/// One endpoint's readiness and, if it targets a pod, the pod's name.
type SliceEndpoint = (bool, Option<String>);

fn endpoints_of(slice: &EndpointSlice) -> Vec<SliceEndpoint> {
    slice
        .endpoints
        .iter()
        .map(|ep| {
            let ready = ep.conditions.as_ref().and_then(|c| c.ready).unwrap_or(false);
            let pod_name = ep
                .target_ref
                .as_ref()
                .filter(|tr| tr.kind.as_deref() == Some("Pod"))
                .and_then(|tr| tr.name.clone());
            (ready, pod_name)
        })
        .collect()
}

fn backend_of(slice: &EndpointSlice) -> Option<Backend> {
    let namespace = slice.namespace()?;
    let service_name = slice.labels().get(SERVICE_NAME_LABEL)?.clone();
    Some((namespace, service_name))
}

/// Watches every `EndpointSlice` in the cluster and keeps readiness counts
/// on the services that reference them up to date.
pub struct EndpointWatcher {
    store: ClockedStore,
    pod_diagnostic: Arc<PodDiagnosticQuerier>,
    client: kube::Client,
    /// Backend -> ingresses that care about its readiness.
    interest: RwLock<HashMap<Backend, HashSet<ServiceKey>>>,
    /// Backend -> slice name -> that slice's endpoints, aggregated on read.
    slices: RwLock<HashMap<Backend, HashMap<String, Vec<SliceEndpoint>>>>,
}

impl EndpointWatcher {
    /// Return a new instance and start the cluster-wide watch in the
    /// background.
    pub fn new(store: ClockedStore, pod_diagnostic: Arc<PodDiagnosticQuerier>, client: kube::Client) -> Arc<Self> {
        let watcher = Arc::new(Self {
            store,
            pod_diagnostic,
            client,
            interest: RwLock::new(HashMap::new()),
            slices: RwLock::new(HashMap::new()),
        });
        let self_clone = Arc::clone(&watcher);
        tokio::spawn(async move { self_clone.watch_endpoint_slices().await });
        watcher
    }

    /// Register interest: `ingress` in namespace `ingress_namespace` wants
    /// readiness updates for `(backend_namespace, backend_name)`. Triggers an
    /// immediate recompute so the ingress picks up whatever is already known.
    pub fn watch(
        &self,
        ingress: String,
        ingress_namespace: String,
        backend_namespace: String,
        backend_name: String,
    ) {
        let ingress_key = ServiceKey::new(ingress_namespace, ingress);
        let backend = (backend_namespace, backend_name);
        self.interest
            .write()
            .unwrap()
            .entry(backend.clone())
            .or_default()
            .insert(ingress_key);
        self.recompute_and_dispatch(&backend);
    }

    /// Remove interest for `ingress`. When the last interested ingress for a
    /// backend is gone, its cached slice data is dropped too.
    pub fn unwatch(&self, ingress: &str, ingress_namespace: &str) {
        let ingress_key = ServiceKey::new(ingress_namespace.to_owned(), ingress.to_owned());
        let mut emptied = Vec::new();
        {
            let mut interest = self.interest.write().unwrap();
            interest.retain(|backend, ingresses| {
                ingresses.remove(&ingress_key);
                if ingresses.is_empty() {
                    emptied.push(backend.clone());
                    false
                } else {
                    true
                }
            });
        }
        if !emptied.is_empty() {
            let mut slices = self.slices.write().unwrap();
            for backend in emptied {
                slices.remove(&backend);
            }
        }
    }

    async fn watch_endpoint_slices(self: Arc<Self>) {
        let api = Api::<EndpointSlice>::all(self.client.clone());
        let stream = kube::runtime::watcher(api, Config::default());
        stream
            .try_for_each(|event| {
                let watcher = Arc::clone(&self);
                async move {
                    watcher.handle_event(event);
                    Ok(())
                }
            })
            .await
            .map_err(|e| log::warn!("Endpoint slice watch ended with error: {e}"))
            .ok();
    }

    fn handle_event(self: &Arc<Self>, event: WatchEvent<EndpointSlice>) {
        match event {
            WatchEvent::Applied(slice) => self.apply_slice(&slice),
            WatchEvent::Deleted(slice) => self.delete_slice(&slice),
            WatchEvent::Restarted(list) => {
                self.slices.write().unwrap().clear();
                for slice in &list {
                    self.apply_slice(slice);
                }
            }
        }
    }

    fn apply_slice(self: &Arc<Self>, slice: &EndpointSlice) {
        let Some(backend) = backend_of(slice) else {
            return;
        };
        let Some(slice_name) = slice.metadata.name.clone() else {
            return;
        };
        self.slices
            .write()
            .unwrap()
            .entry(backend.clone())
            .or_default()
            .insert(slice_name, endpoints_of(slice));
        self.recompute_and_dispatch(&backend);
    }

    fn delete_slice(self: &Arc<Self>, slice: &EndpointSlice) {
        let Some(backend) = backend_of(slice) else {
            return;
        };
        let Some(slice_name) = slice.metadata.name.clone() else {
            return;
        };
        if let Some(per_slice) = self.slices.write().unwrap().get_mut(&backend) {
            per_slice.remove(&slice_name);
        }
        self.recompute_and_dispatch(&backend);
    }

    /// Sum readiness across every cached slice of `backend`, push the result
    /// to every interested ingress, and kick off pod diagnostics for any
    /// not-ready pods.
    fn recompute_and_dispatch(self: &Arc<Self>, backend: &Backend) {
        let (ready, total, not_ready_pods) = {
            let slices = self.slices.read().unwrap();
            let mut ready = 0u32;
            let mut total = 0u32;
            let mut not_ready_pods = Vec::new();
            if let Some(per_slice) = slices.get(backend) {
                for endpoints in per_slice.values() {
                    for (is_ready, pod_name) in endpoints {
                        total += 1;
                        if *is_ready {
                            ready += 1;
                        } else if let Some(pod_name) = pod_name {
                            if !not_ready_pods.contains(pod_name) {
                                not_ready_pods.push(pod_name.clone());
                            }
                        }
                    }
                }
            }
            (ready, total, not_ready_pods)
        };

        let ingress_keys: Vec<ServiceKey> = self
            .interest
            .read()
            .unwrap()
            .get(backend)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        if ingress_keys.is_empty() {
            return;
        }

        let clear_pod_diagnostic = not_ready_pods.is_empty();
        for key in &ingress_keys {
            self.store.update(key, |svc| {
                svc.ready_endpoints = Some(ready);
                svc.total_endpoints = Some(total);
                if clear_pod_diagnostic {
                    svc.pod_diagnostic = None;
                }
            });
        }

        if !not_ready_pods.is_empty() {
            let pod_diagnostic = Arc::clone(&self.pod_diagnostic);
            let store = self.store.clone();
            let namespace = backend.0.clone();
            let ingress_keys = ingress_keys.clone();
            tokio::spawn(async move {
                if let Some(diagnostic) = pod_diagnostic.diagnose(&namespace, &not_ready_pods).await {
                    for key in &ingress_keys {
                        let diagnostic = diagnostic.clone();
                        store.update(key, |svc| svc.pod_diagnostic = Some(diagnostic));
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_readiness_across_multiple_slices_of_the_same_backend() {
        let mut by_slice: HashMap<String, Vec<SliceEndpoint>> = HashMap::new();
        by_slice.insert(
            "slice-a".to_owned(),
            vec![(true, Some("pod-1".to_owned())), (false, Some("pod-2".to_owned()))],
        );
        by_slice.insert("slice-b".to_owned(), vec![(true, Some("pod-3".to_owned()))]);

        let mut ready = 0u32;
        let mut total = 0u32;
        let mut not_ready = Vec::new();
        for endpoints in by_slice.values() {
            for (is_ready, pod_name) in endpoints {
                total += 1;
                if *is_ready {
                    ready += 1;
                } else if let Some(pod_name) = pod_name {
                    not_ready.push(pod_name.clone());
                }
            }
        }
        assert_eq!(ready, 2);
        assert_eq!(total, 3);
        assert_eq!(not_ready, vec!["pod-2".to_owned()]);
    }

    #[test]
    fn nil_ready_condition_counts_as_not_ready() {
        let endpoints: Vec<SliceEndpoint> = vec![(false, None)];
        let ready = endpoints.iter().filter(|(r, _)| *r).count();
        assert_eq!(ready, 0);
    }
}
