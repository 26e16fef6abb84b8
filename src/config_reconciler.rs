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

//! Loads, validates and applies the static-service YAML document, and keeps
//! it in sync with the filesystem.
//!
//! A missing or empty file is a valid empty configuration. A document that
//! fails to parse leaves the last-known-good configuration applied; parse
//! and per-entry validation errors are both surfaced through
//! [crate::store::Store::set_config_errors] rather than propagated.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Deserialize;

use crate::conf::AppConfig;
use crate::history_sink::{HistoryPrefill, HistorySink};
use crate::model::{ServiceKey, Source};
use crate::store::{new_service, ClockedStore};

/// One `services[i]` entry of the YAML document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
struct ServiceDef {
    #[serde(default)]
    name: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    group: String,
    #[serde(rename = "displayName", default)]
    display_name: Option<String>,
    #[serde(rename = "healthUrl", default)]
    health_url: Option<String>,
    #[serde(rename = "expectedStatusCodes", default)]
    expected_status_codes: Option<BTreeSet<u16>>,
    #[serde(default)]
    icon: Option<String>,
}

/// One `overrides[i]` entry of the YAML document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct OverrideDef {
    #[serde(rename = "match")]
    match_key: String,
    #[serde(rename = "displayName", default)]
    display_name: Option<String>,
    #[serde(rename = "healthUrl", default)]
    health_url: Option<String>,
    #[serde(rename = "expectedStatusCodes", default)]
    expected_status_codes: Option<BTreeSet<u16>>,
    #[serde(default)]
    icon: Option<String>,
}

/// One `groups.<name>` entry. Group is a derived, not-stored entity; this is parsed and validated for forward
/// compatibility but not otherwise consumed by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
struct GroupDef {
    #[serde(rename = "displayName", default)]
    #[allow(dead_code)]
    display_name: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    icon: Option<String>,
    #[serde(rename = "sortOrder", default)]
    #[allow(dead_code)]
    sort_order: Option<u32>,
}

/// The optional `health{interval, timeout}` section, overriding the
/// process-level defaults for as long as this document stays applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
struct HealthSection {
    #[serde(default)]
    interval: Option<u64>,
    #[serde(default)]
    timeout: Option<u64>,
}

/// The optional `history{retention}` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
struct HistorySection {
    #[serde(default)]
    retention: Option<usize>,
}

/// The full static-service configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    services: Vec<ServiceDef>,
    #[serde(default)]
    overrides: Vec<OverrideDef>,
    #[serde(default)]
    groups: HashMap<String, GroupDef>,
    #[serde(default)]
    health: Option<HealthSection>,
    #[serde(default)]
    history: Option<HistorySection>,
}

/// Strip entries that fail validation, returning the survivors plus one
/// human-readable error string per rejected entry. Each `services[i]`
/// requires a non-empty `name`, `url` and `group`; duplicate names are
/// rejected.
fn validate_services(raw: Vec<ServiceDef>) -> (Vec<ServiceDef>, Vec<String>) {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    let mut valid = Vec::new();
    for (index, def) in raw.into_iter().enumerate() {
        if def.name.trim().is_empty() || def.url.trim().is_empty() || def.group.trim().is_empty() {
            errors.push(format!(
                "services[{index}]: name, url and group are all required"
            ));
            continue;
        }
        if !seen.insert(def.name.clone()) {
            errors.push(format!(
                "services[{index}]: duplicate service name '{}'",
                def.name
            ));
            continue;
        }
        valid.push(def);
    }
    (valid, errors)
}

/// Strip overrides whose `match` isn't a `namespace/name` pair.
fn validate_overrides(raw: Vec<OverrideDef>) -> (Vec<(ServiceKey, OverrideDef)>, Vec<String>) {
    let mut errors = Vec::new();
    let mut valid = Vec::new();
    for (index, def) in raw.into_iter().enumerate() {
        match def.match_key.split_once('/') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                valid.push((ServiceKey::new(namespace, name), def));
            }
            _ => errors.push(format!(
                "overrides[{index}]: 'match' must be of the form 'namespace/name'"
            )),
        }
    }
    (valid, errors)
}

fn build_config_service(def: &ServiceDef) -> crate::model::Service {
    let mut svc = new_service("config", &def.name, Source::Config);
    svc.group = def.group.clone();
    svc.url = def.url.clone();
    svc.display_name = def.display_name.clone().unwrap_or_else(|| def.name.clone());
    svc.health_url = def.health_url.clone();
    svc.expected_status_codes = def.expected_status_codes.clone();
    svc.icon = def.icon.clone();
    svc
}

/// Fields captured from a Kubernetes-sourced service immediately before an
/// override is first applied to it, so the override can be cleanly removed
/// later.
#[derive(Debug, Clone, Default)]
struct OverrideSnapshot {
    health_url: Option<String>,
    expected_status_codes: Option<BTreeSet<u16>>,
    icon: Option<String>,
}

#[derive(Default)]
struct ReconcilerState {
    applied_services: HashMap<String, ServiceDef>,
    applied_overrides: HashMap<ServiceKey, OverrideDef>,
    override_snapshots: HashMap<ServiceKey, OverrideSnapshot>,
    groups: HashMap<String, GroupDef>,
}

/// Loads, validates, applies and re-watches the static-service YAML
/// document.
pub struct ConfigReconciler {
    store: ClockedStore,
    path: Option<PathBuf>,
    process_defaults: (Duration, Duration),
    health_override: RwLock<Option<(Duration, Duration)>>,
    retention: AtomicUsize,
    history_sink: Option<Arc<dyn HistorySink>>,
    history_prefill: Arc<HistoryPrefill>,
    state: Mutex<ReconcilerState>,
}

impl ConfigReconciler {
    /// Return a new instance. Call [Self::start] to perform the first load
    /// and, if a path is configured, begin watching it for changes.
    ///
    /// `history_sink` is notified of `history.retention` changes from the
    /// YAML document, if one is configured. `history_prefill` is applied to
    /// every config-defined service on first discovery.
    pub fn new(
        app_config: &AppConfig,
        store: ClockedStore,
        history_sink: Option<Arc<dyn HistorySink>>,
        history_prefill: Arc<HistoryPrefill>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            path: app_config.paths.config_file(),
            process_defaults: (app_config.health.interval(), app_config.health.timeout()),
            health_override: RwLock::new(None),
            retention: AtomicUsize::new(0),
            history_sink,
            history_prefill,
            state: Mutex::new(ReconcilerState::default()),
        })
    }

    /// Load the configuration once and, if a path is configured, spawn a
    /// background task that re-loads it on change.
    pub fn start(self: &Arc<Self>) {
        self.reload();
        if let Some(path) = self.path.clone() {
            Arc::clone(self).watch_file(path);
        }
    }

    /// The probe cycle interval currently in effect: the YAML `health`
    /// section's value if present, else the process-level default.
    pub fn interval(&self) -> Duration {
        self.health_override
            .read()
            .unwrap()
            .map(|(interval, _)| interval)
            .unwrap_or(self.process_defaults.0)
    }

    /// The per-probe timeout currently in effect.
    pub fn timeout(&self) -> Duration {
        self.health_override
            .read()
            .unwrap()
            .map(|(_, timeout)| timeout)
            .unwrap_or(self.process_defaults.1)
    }

    /// The history retention currently in effect, if the YAML `history`
    /// section set one.
    pub fn retention(&self) -> Option<usize> {
        let retention = self.retention.load(Ordering::Relaxed);
        (retention > 0).then_some(retention)
    }

    /// Re-read, validate and apply the configuration file from disk.
    fn reload(&self) {
        match self.read_file() {
            Ok(content) if content.trim().is_empty() => self.apply_document(ConfigDocument::default()),
            Ok(content) => match serde_yaml::from_str::<ConfigDocument>(&content) {
                Ok(doc) => self.apply_document(doc),
                Err(e) => {
                    log::warn!("Configuration document failed to parse, keeping last-known-good: {e}");
                    self.store.store().set_config_errors(vec![
                        "configuration file failed to parse; the previous configuration remains active"
                            .to_owned(),
                    ]);
                }
            },
            Err(message) => {
                log::warn!("{message}");
                self.store.store().set_config_errors(vec![message]);
            }
        }
    }

    /// Read the configured file, treating a missing file as an empty
    /// document. Error messages never include the filesystem path.
    fn read_file(&self) -> Result<String, String> {
        let Some(path) = &self.path else {
            return Ok(String::new());
        };
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(_) => Err("failed to read the configuration file".to_owned()),
        }
    }

    fn apply_document(&self, doc: ConfigDocument) {
        let (services, mut errors) = validate_services(doc.services);
        let (overrides, override_errors) = validate_overrides(doc.overrides);
        errors.extend(override_errors);
        self.store.store().set_config_errors(errors);

        if let Some(health) = doc.health {
            let interval = health
                .interval
                .map(Duration::from_secs)
                .unwrap_or(self.process_defaults.0);
            let timeout = health
                .timeout
                .map(Duration::from_secs)
                .unwrap_or(self.process_defaults.1);
            *self.health_override.write().unwrap() = Some((interval, timeout));
        } else {
            *self.health_override.write().unwrap() = None;
        }
        self.retention.store(
            doc.history.and_then(|h| h.retention).unwrap_or(0),
            Ordering::Relaxed,
        );
        if let Some(sink) = &self.history_sink {
            sink.set_retention(self.retention());
        }

        self.apply(services, overrides, doc.groups);
    }

    /// Reconcile custom services and overrides as idempotent sets: entries
    /// unchanged since the previous application emit no store mutation at
    /// all.
    fn apply(
        &self,
        services: Vec<ServiceDef>,
        overrides: Vec<(ServiceKey, OverrideDef)>,
        groups: HashMap<String, GroupDef>,
    ) {
        let mut state = self.state.lock().unwrap();

        let incoming_names: HashSet<&str> = services.iter().map(|s| s.name.as_str()).collect();
        let vanished: Vec<String> = state
            .applied_services
            .keys()
            .filter(|name| !incoming_names.contains(name.as_str()))
            .cloned()
            .collect();
        for name in vanished {
            self.store.remove(&ServiceKey::new("config", &name));
            state.applied_services.remove(&name);
        }
        for def in services {
            if state.applied_services.get(&def.name) == Some(&def) {
                continue;
            }
            self.store.add_or_update_config(build_config_service(&def));
            self.history_prefill
                .apply(&self.store, &ServiceKey::new("config", &def.name));
            state.applied_services.insert(def.name.clone(), def);
        }

        let incoming_keys: HashSet<ServiceKey> = overrides.iter().map(|(key, _)| key.clone()).collect();
        let removed: Vec<ServiceKey> = state
            .applied_overrides
            .keys()
            .filter(|key| !incoming_keys.contains(key))
            .cloned()
            .collect();
        for key in removed {
            self.restore_override(&key, &mut state);
        }
        for (key, def) in overrides {
            if state.applied_overrides.get(&key) == Some(&def) {
                continue;
            }
            self.apply_override(&key, &def, &mut state);
            state.applied_overrides.insert(key, def);
        }

        state.groups = groups;
    }

    fn apply_override(&self, key: &ServiceKey, def: &OverrideDef, state: &mut ReconcilerState) {
        if !state.override_snapshots.contains_key(key) {
            if let Some(existing) = self.store.get(key) {
                state.override_snapshots.insert(
                    key.clone(),
                    OverrideSnapshot {
                        health_url: existing.health_url,
                        expected_status_codes: existing.expected_status_codes,
                        icon: existing.icon,
                    },
                );
            }
        }
        let def = def.clone();
        self.store.update(key, move |svc| {
            if let Some(display_name) = def.display_name {
                svc.display_name = display_name;
            }
            if let Some(health_url) = def.health_url {
                svc.health_url = Some(health_url);
            }
            if let Some(codes) = def.expected_status_codes {
                svc.expected_status_codes = Some(codes);
            }
            if let Some(icon) = def.icon {
                svc.icon = Some(icon);
            }
        });
    }

    /// Restore the pre-override fields, including `displayName` (via the
    /// canonical `originalDisplayName`).
    fn restore_override(&self, key: &ServiceKey, state: &mut ReconcilerState) {
        state.applied_overrides.remove(key);
        let snapshot = state.override_snapshots.remove(key).unwrap_or_default();
        let Some(existing) = self.store.get(key) else {
            return;
        };
        let original_display_name = existing.original_display_name;
        self.store.update(key, move |svc| {
            if let Some(original) = original_display_name {
                svc.display_name = original;
            }
            svc.health_url = snapshot.health_url;
            svc.expected_status_codes = snapshot.expected_status_codes;
            svc.icon = snapshot.icon;
        });
    }

    /// Watch the configuration file for changes, debounced over a 1 s
    /// window, reloading on every settled burst of events.
    fn watch_file(self: Arc<Self>, path: PathBuf) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        std::thread::spawn(move || {
            use notify::Watcher;
            let (raw_tx, raw_rx) = std::sync::mpsc::channel();
            let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                if res.is_ok() {
                    let _ = raw_tx.send(());
                }
            }) {
                Ok(watcher) => watcher,
                Err(e) => {
                    log::warn!("Failed to start configuration file watcher: {e}");
                    return;
                }
            };
            if let Err(e) = watcher.watch(&path, notify::RecursiveMode::NonRecursive) {
                log::warn!("Failed to watch configuration file: {e}");
                return;
            }
            while raw_rx.recv().is_ok() {
                if tx.send(()).is_err() {
                    break;
                }
            }
        });
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                while tokio::time::timeout(Duration::from_secs(1), rx.recv())
                    .await
                    .is_ok_and(|v| v.is_some())
                {}
                self.reload();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::time::SystemClock;

    fn store() -> ClockedStore {
        ClockedStore::new(Store::new(), Arc::new(SystemClock))
    }

    fn reconciler(store: ClockedStore) -> Arc<ConfigReconciler> {
        Arc::new(ConfigReconciler {
            store,
            path: None,
            process_defaults: (Duration::from_secs(30), Duration::from_secs(10)),
            health_override: RwLock::new(None),
            retention: AtomicUsize::new(0),
            history_sink: None,
            history_prefill: Arc::new(HistoryPrefill::empty()),
            state: Mutex::new(ReconcilerState::default()),
        })
    }

    #[test]
    fn duplicate_service_names_are_rejected() {
        let defs = vec![
            ServiceDef {
                name: "truenas".into(),
                url: "https://truenas.local".into(),
                group: "storage".into(),
                ..Default::default()
            },
            ServiceDef {
                name: "truenas".into(),
                url: "https://other.local".into(),
                group: "storage".into(),
                ..Default::default()
            },
        ];
        let (valid, errors) = validate_services(defs);
        assert_eq!(valid.len(), 1);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let defs = vec![ServiceDef {
            name: "truenas".into(),
            url: String::new(),
            group: "storage".into(),
            ..Default::default()
        }];
        let (valid, errors) = validate_services(defs);
        assert!(valid.is_empty());
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn override_match_must_be_namespace_slash_name() {
        let defs = vec![
            OverrideDef {
                match_key: "default/my-app".into(),
                display_name: None,
                health_url: None,
                expected_status_codes: None,
                icon: None,
            },
            OverrideDef {
                match_key: "no-slash".into(),
                display_name: None,
                health_url: None,
                expected_status_codes: None,
                icon: None,
            },
        ];
        let (valid, errors) = validate_overrides(defs);
        assert_eq!(valid.len(), 1);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn applying_identical_config_twice_emits_no_second_event() {
        let st = store();
        let rec = reconciler(st.clone());
        let mut sub = st.subscribe(8);

        let doc = ConfigDocument {
            services: vec![ServiceDef {
                name: "truenas".into(),
                url: "https://truenas.local".into(),
                group: "storage".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        rec.apply_document(doc.clone());
        rec.apply_document(doc);

        assert!(sub.receiver.as_mut().unwrap().try_recv().is_ok());
        assert!(sub.receiver.as_mut().unwrap().try_recv().is_err());
    }

    #[test]
    fn vanished_config_service_is_removed() {
        let st = store();
        let rec = reconciler(st.clone());
        let doc = ConfigDocument {
            services: vec![ServiceDef {
                name: "truenas".into(),
                url: "https://truenas.local".into(),
                group: "storage".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        rec.apply_document(doc);
        assert!(st.get(&ServiceKey::new("config", "truenas")).is_some());

        rec.apply_document(ConfigDocument::default());
        assert!(st.get(&ServiceKey::new("config", "truenas")).is_none());
    }

    #[test]
    fn override_apply_then_removal_restores_original_display_name() {
        let st = store();
        let rec = reconciler(st.clone());
        let key = ServiceKey::new("default", "my-app");
        let mut svc = new_service("default", "my-app", Source::Kubernetes);
        svc.original_display_name = Some("my-app".to_owned());
        svc.display_name = "my-app".to_owned();
        st.add_or_update_ingress(svc);

        let with_override = ConfigDocument {
            overrides: vec![OverrideDef {
                match_key: "default/my-app".into(),
                display_name: Some("My App".into()),
                health_url: None,
                expected_status_codes: None,
                icon: None,
            }],
            ..Default::default()
        };
        rec.apply_document(with_override);
        assert_eq!(st.get(&key).unwrap().display_name, "My App");

        rec.apply_document(ConfigDocument::default());
        assert_eq!(st.get(&key).unwrap().display_name, "my-app");
    }

    #[test]
    fn parse_error_keeps_last_known_good_applied() {
        let st = store();
        let rec = reconciler(st.clone());
        let doc = ConfigDocument {
            services: vec![ServiceDef {
                name: "truenas".into(),
                url: "https://truenas.local".into(),
                group: "storage".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        rec.apply_document(doc);
        assert!(st.get(&ServiceKey::new("config", "truenas")).is_some());

        // A failed reload never calls apply_document; it only replaces
        // config_errors and leaves the prior application untouched.
        st.store().set_config_errors(vec!["boom".to_owned()]);
        assert!(st.get(&ServiceKey::new("config", "truenas")).is_some());
        assert_eq!(st.snapshot().config_errors, vec!["boom".to_owned()]);
    }

    #[test]
    fn empty_file_is_a_valid_empty_configuration() {
        let st = store();
        let rec = reconciler(st.clone());
        rec.apply_document(ConfigDocument::default());
        assert!(st.snapshot().services.is_empty());
        assert!(st.snapshot().config_errors.is_empty());
    }
}
