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

//! The authoritative in-memory service map.
//!
//! All mutation goes through [Store]; nothing else in this crate is allowed
//! to hold a reference into the map. Readers always get an owned copy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use crossbeam_skiplist::SkipMap;
use tokio::sync::mpsc;

use crate::model::{Event, Service, ServiceKey, ServiceStatus, Source};
use crate::time::Clock;

/// Default bound for a subscriber's event queue.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// A live registration returned by [Store::subscribe]. Dropping it
/// unregisters the subscriber; `cancel()` does the same thing explicitly.
pub struct Subscription {
    id: u64,
    store: Arc<StoreInner>,
    receiver: Option<mpsc::Receiver<Event>>,
}

impl Subscription {
    /// Receive the next event, or `None` once the store has dropped this
    /// subscriber (e.g. due to queue overflow).
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.as_mut()?.recv().await
    }

    /// Explicitly cancel this subscription.
    pub fn cancel(&mut self) {
        self.store.subscribers.remove(&self.id);
        self.receiver = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.store.subscribers.remove(&self.id);
    }
}

/// Snapshot of everything a newly attached subscriber (or the HTTP transport)
/// needs to render a full state view.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    /// All currently known services.
    pub services: Vec<Service>,
    /// Whether the Kubernetes informer caches are currently connected/synced.
    pub k8s_connected: bool,
    /// When `k8s_connected` last changed.
    pub k8s_last_event: Option<DateTime<Utc>>,
    /// Current configuration validation errors.
    pub config_errors: Vec<String>,
}

struct StoreData {
    services: HashMap<ServiceKey, Service>,
    k8s_connected: bool,
    k8s_last_event: Option<DateTime<Utc>>,
    config_errors: Vec<String>,
}

struct StoreInner {
    data: RwLock<StoreData>,
    subscribers: SkipMap<u64, mpsc::Sender<Event>>,
    next_subscriber_id: AtomicU64,
}

/// The authoritative map of services, keyed by `namespace/name`.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Return a new, empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                data: RwLock::new(StoreData {
                    services: HashMap::new(),
                    k8s_connected: false,
                    k8s_last_event: None,
                    config_errors: Vec::new(),
                }),
                subscribers: SkipMap::new(),
                next_subscriber_id: AtomicU64::new(0),
            }),
        }
    }

    /// Upsert a service discovered from an `Ingress`. Only identity,
    /// addressing and origin fields are caller-authoritative: probe results,
    /// Kubernetes readiness, pod diagnostics, and an already-overridden
    /// display name are preserved across the merge.
    ///
    /// Returns `true` if this was a new service (a `Discovered` event was
    /// emitted), `false` if an existing one was updated.
    pub fn add_or_update_ingress(
        &self,
        mut discovered: Service,
        clock: &dyn Clock,
    ) -> bool {
        debug_assert_eq!(discovered.source, Source::Kubernetes);
        let key = discovered.key();
        let mut data = self.inner.data.write().unwrap();
        let is_new = data.services.get(&key).is_none();
        let event = if let Some(existing) = data.services.get(&key) {
            // Preserve caller-opaque fields: probe results, readiness,
            // pod diagnostics, and an overridden display name.
            discovered.status = existing.status;
            discovered.http_code = existing.http_code;
            discovered.response_time_ms = existing.response_time_ms;
            discovered.last_checked = existing.last_checked;
            discovered.error_snippet = existing.error_snippet.clone();
            discovered.ready_endpoints = existing.ready_endpoints;
            discovered.total_endpoints = existing.total_endpoints;
            discovered.auth_guarded = existing.auth_guarded;
            discovered.pod_diagnostic = existing.pod_diagnostic.clone();
            discovered.expected_status_codes = existing.expected_status_codes.clone();
            discovered.health_url = existing.health_url.clone();
            discovered.icon = existing.icon.clone();
            let overridden = existing.original_display_name.as_deref() != Some(existing.display_name.as_str());
            if overridden {
                discovered.display_name = existing.display_name.clone();
            }
            discovered.composite_status = existing.composite_status;
            discovered.last_state_change = existing.last_state_change;
            discovered.recompute_composite_status(clock.now());
            Event::Updated(discovered.clone())
        } else {
            discovered.recompute_composite_status(clock.now());
            Event::Discovered(discovered.clone())
        };
        data.services.insert(key, discovered);
        drop(data);
        self.inner.broadcast(event);
        is_new
    }

    /// Upsert a service declared in the static YAML configuration.
    /// Identity and policy fields are fully caller-authoritative; probe
    /// results are preserved across re-application of the same definition.
    pub fn add_or_update_config(&self, mut incoming: Service, clock: &dyn Clock) -> bool {
        debug_assert_eq!(incoming.source, Source::Config);
        let key = incoming.key();
        let mut data = self.inner.data.write().unwrap();
        let is_new = data.services.get(&key).is_none();
        let event = if let Some(existing) = data.services.get(&key) {
            incoming.status = existing.status;
            incoming.http_code = existing.http_code;
            incoming.response_time_ms = existing.response_time_ms;
            incoming.last_checked = existing.last_checked;
            incoming.error_snippet = existing.error_snippet.clone();
            incoming.composite_status = existing.composite_status;
            incoming.last_state_change = existing.last_state_change;
            incoming.recompute_composite_status(clock.now());
            Event::Updated(incoming.clone())
        } else {
            incoming.recompute_composite_status(clock.now());
            Event::Discovered(incoming.clone())
        };
        data.services.insert(key, incoming);
        drop(data);
        self.inner.broadcast(event);
        is_new
    }

    /// Apply an arbitrary mutation to an existing service under the write
    /// lock, recompute `compositeStatus`, and emit `Updated` if the service
    /// exists. A no-op (no event) if the key is absent.
    pub fn update(
        &self,
        key: &ServiceKey,
        clock: &dyn Clock,
        mutator: impl FnOnce(&mut Service),
    ) {
        let mut data = self.inner.data.write().unwrap();
        let Some(service) = data.services.get_mut(key) else {
            return;
        };
        mutator(service);
        service.recompute_composite_status(clock.now());
        let event = Event::Updated(service.clone());
        drop(data);
        self.inner.broadcast(event);
    }

    /// Remove a service, emitting `Removed` if it existed.
    pub fn remove(&self, key: &ServiceKey) {
        let mut data = self.inner.data.write().unwrap();
        if data.services.remove(key).is_none() {
            return;
        }
        drop(data);
        self.inner.broadcast(Event::Removed(key.clone()));
    }

    /// Return a deep copy of a single service, if present.
    pub fn get(&self, key: &ServiceKey) -> Option<Service> {
        self.inner.data.read().unwrap().services.get(key).cloned()
    }

    /// Return a deep copy of the full state: services plus cluster-wide
    /// flags. Used both by the event broker's snapshot-on-subscribe and the
    /// HTTP health/status endpoints.
    pub fn snapshot(&self) -> StateSnapshot {
        let data = self.inner.data.read().unwrap();
        StateSnapshot {
            services: data.services.values().cloned().collect(),
            k8s_connected: data.k8s_connected,
            k8s_last_event: data.k8s_last_event,
            config_errors: data.config_errors.clone(),
        }
    }

    /// Update the cluster connectivity flag, emitting `K8sStatus` if it
    /// changed.
    pub fn set_k8s_connected(&self, connected: bool, at: DateTime<Utc>) {
        let mut data = self.inner.data.write().unwrap();
        if data.k8s_connected == connected {
            return;
        }
        data.k8s_connected = connected;
        data.k8s_last_event = Some(at);
        drop(data);
        self.inner.broadcast(Event::K8sStatus { connected, at });
    }

    /// Replace the full set of configuration validation errors, emitting
    /// `ConfigErrors` if it changed.
    pub fn set_config_errors(&self, errors: Vec<String>) {
        let mut data = self.inner.data.write().unwrap();
        if data.config_errors == errors {
            return;
        }
        data.config_errors = errors.clone();
        drop(data);
        self.inner.broadcast(Event::ConfigErrors(errors));
    }

    /// Register a new subscriber with a bounded queue. If the queue ever
    /// overflows, the subscriber is dropped (its receiver yields `None`);
    /// other subscribers and the store itself are unaffected.
    pub fn subscribe(&self, buf_capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(buf_capacity.max(1));
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.insert(id, tx);
        Subscription {
            id,
            store: Arc::clone(&self.inner),
            receiver: Some(rx),
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreInner {
    /// Fan an event out to every live subscriber. A subscriber whose queue is
    /// full is dropped rather than allowed to block the store.
    fn broadcast(&self, event: Event) {
        let mut dropped = Vec::new();
        for entry in self.subscribers.iter() {
            match entry.value().try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("Subscriber {} overflowed its queue; dropping it.", entry.key());
                    dropped.push(*entry.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dropped.push(*entry.key());
                }
            }
        }
        for id in dropped {
            self.subscribers.remove(&id);
        }
    }
}

/// Build a blank [Service] with the given identity, `status=Unknown` and no
/// probe history. Shared by the ingress watcher and the config reconciler so
/// every new service starts from the same defaults.
pub fn new_service(namespace: &str, name: &str, source: Source) -> Service {
    Service {
        name: name.to_owned(),
        display_name: name.to_owned(),
        original_display_name: None,
        namespace: namespace.to_owned(),
        group: namespace.to_owned(),
        url: String::new(),
        icon: None,
        source,
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
    }
}

/// Bundles a [Store] with the [Clock] used to timestamp its mutations.
///
/// Components depend on this instead of a bare [Store] so the clock is an
/// explicit, injected dependency rather than ambient global state, without
/// every call site having to thread a `&dyn Clock` through by hand.
#[derive(Clone)]
pub struct ClockedStore {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl ClockedStore {
    /// Return a new instance wrapping `store`, timestamped by `clock`.
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// See [Store::add_or_update_ingress].
    pub fn add_or_update_ingress(&self, discovered: Service) -> bool {
        self.store.add_or_update_ingress(discovered, self.clock.as_ref())
    }

    /// See [Store::add_or_update_config].
    pub fn add_or_update_config(&self, incoming: Service) -> bool {
        self.store.add_or_update_config(incoming, self.clock.as_ref())
    }

    /// See [Store::update].
    pub fn update(&self, key: &ServiceKey, mutator: impl FnOnce(&mut Service)) {
        self.store.update(key, self.clock.as_ref(), mutator)
    }

    /// See [Store::remove].
    pub fn remove(&self, key: &ServiceKey) {
        self.store.remove(key)
    }

    /// See [Store::get].
    pub fn get(&self, key: &ServiceKey) -> Option<Service> {
        self.store.get(key)
    }

    /// See [Store::snapshot].
    pub fn snapshot(&self) -> StateSnapshot {
        self.store.snapshot()
    }

    /// See [Store::set_k8s_connected]. Uses the wrapped clock for `at`.
    pub fn set_k8s_connected(&self, connected: bool) {
        self.store.set_k8s_connected(connected, self.clock.now());
    }

    /// See [Store::set_config_errors].
    pub fn set_config_errors(&self, errors: Vec<String>) {
        self.store.set_config_errors(errors)
    }

    /// See [Store::subscribe].
    pub fn subscribe(&self, buf_capacity: usize) -> Subscription {
        self.store.subscribe(buf_capacity)
    }

    /// The underlying clock, for components (like the probe engine) that
    /// need to stamp fields outside a `Store::update` mutator closure.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The wrapped [Store] itself.
    pub fn store(&self) -> &Store {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SystemClock;

    fn ingress_service(ns: &str, name: &str, host: &str) -> Service {
        let mut svc = new_service(ns, name, Source::Kubernetes);
        svc.url = format!("https://{host}");
        svc.original_display_name = Some(host.split('.').next().unwrap().to_owned());
        svc.display_name = svc.original_display_name.clone().unwrap();
        svc
    }

    #[test]
    fn add_or_update_emits_discovered_then_updated() {
        let store = Store::new();
        let clock = SystemClock;
        let mut sub = store.subscribe(8);

        let is_new = store.add_or_update_ingress(ingress_service("default", "my-app", "my-app.example.com"), &clock);
        assert!(is_new);
        let is_new = store.add_or_update_ingress(ingress_service("default", "my-app", "my-app.example.com"), &clock);
        assert!(!is_new);

        let ev1 = sub.receiver.as_mut().unwrap().try_recv().unwrap();
        assert!(matches!(ev1, Event::Discovered(_)));
        let ev2 = sub.receiver.as_mut().unwrap().try_recv().unwrap();
        assert!(matches!(ev2, Event::Updated(_)));
    }

    #[test]
    fn ingress_merge_never_clobbers_probe_fields() {
        let store = Store::new();
        let clock = SystemClock;
        let key = ServiceKey::new("default", "my-app");
        store.add_or_update_ingress(ingress_service("default", "my-app", "my-app.example.com"), &clock);
        store.update(&key, &clock, |svc| {
            svc.status = ServiceStatus::Healthy;
            svc.http_code = Some(200);
        });
        store.add_or_update_ingress(ingress_service("default", "my-app", "my-app.example.com"), &clock);
        let svc = store.get(&key).unwrap();
        assert_eq!(svc.status, ServiceStatus::Healthy);
        assert_eq!(svc.http_code, Some(200));
    }

    #[test]
    fn overridden_display_name_survives_ingress_resync() {
        let store = Store::new();
        let clock = SystemClock;
        let key = ServiceKey::new("default", "my-app");
        store.add_or_update_ingress(ingress_service("default", "my-app", "my-app.example.com"), &clock);
        store.update(&key, &clock, |svc| {
            svc.display_name = "My App".to_owned();
        });
        store.add_or_update_ingress(ingress_service("default", "my-app", "my-app.example.com"), &clock);
        let svc = store.get(&key).unwrap();
        assert_eq!(svc.display_name, "My App");
        assert_eq!(svc.original_display_name.as_deref(), Some("my-app"));
    }

    #[test]
    fn remove_emits_removed_and_drops_entry() {
        let store = Store::new();
        let clock = SystemClock;
        let key = ServiceKey::new("default", "my-app");
        store.add_or_update_ingress(ingress_service("default", "my-app", "my-app.example.com"), &clock);
        store.remove(&key);
        assert!(store.get(&key).is_none());
    }

    #[test]
    fn update_on_missing_key_is_noop() {
        let store = Store::new();
        let clock = SystemClock;
        let key = ServiceKey::new("default", "ghost");
        store.update(&key, &clock, |svc| svc.status = ServiceStatus::Healthy);
        assert!(store.get(&key).is_none());
    }

    #[tokio::test]
    async fn overflowing_subscriber_is_dropped_others_continue() {
        let store = Store::new();
        let clock = SystemClock;
        let mut slow = store.subscribe(1);
        let mut fast = store.subscribe(8);

        store.add_or_update_ingress(ingress_service("default", "a", "a.example.com"), &clock);
        store.add_or_update_ingress(ingress_service("default", "b", "b.example.com"), &clock);

        // The slow subscriber's queue (capacity 1) overflowed on the second
        // broadcast and should now be closed.
        assert!(slow.recv().await.is_some());
        assert!(slow.recv().await.is_none());

        assert!(fast.recv().await.is_some());
        assert!(fast.recv().await.is_some());
    }
}
