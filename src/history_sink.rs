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

//! Write-behind persistence of `compositeStatus` transitions, and a
//! startup-only prefill that avoids a flash of `unknown` for services with
//! known prior history.
//!
//! Out of scope: this is a single append-only JSONL file, not the
//! "history persistence" system itself, which this crate only feeds and
//! reads a startup snapshot from.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event_broker::{BrokerEvent, EventBroker};
use crate::model::{ServiceKey, ServiceStatus};
use crate::store::ClockedStore;

/// One JSONL record: a single `compositeStatus` transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HistoryRecord {
    ts: DateTime<Utc>,
    svc: String,
    prev: ServiceStatus,
    next: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ms: Option<u64>,
}

/// Where a [Service](crate::model::Service) transition gets persisted.
/// [NullHistorySink] is valid when no path is configured.
pub trait HistorySink: Send + Sync {
    /// Persist one transition, best-effort.
    fn record(
        &self,
        at: DateTime<Utc>,
        key: &ServiceKey,
        prev: ServiceStatus,
        next: ServiceStatus,
        http_code: Option<u16>,
        response_time_ms: Option<u64>,
    );

    /// Apply a new `history.retention` value from the YAML configuration
    /// document, if this sink enforces one. A no-op by default.
    fn set_retention(&self, _retention: Option<usize>) {}
}

/// No-op sink used when no history file path is configured.
pub struct NullHistorySink;

impl HistorySink for NullHistorySink {
    fn record(
        &self,
        _at: DateTime<Utc>,
        _key: &ServiceKey,
        _prev: ServiceStatus,
        _next: ServiceStatus,
        _http_code: Option<u16>,
        _response_time_ms: Option<u64>,
    ) {
    }
}

/// Appends one JSONL record per `compositeStatus` transition. Writes are
/// crash-safe append-only (open in append mode, write one line, flush) and
/// best-effort: a write error is logged and otherwise ignored.
pub struct FileHistorySink {
    path: PathBuf,
    file: Mutex<std::fs::File>,
    retention: AtomicUsize,
}

impl FileHistorySink {
    /// Open (creating if necessary) the history file at `path` for
    /// appending.
    pub fn open(path: PathBuf) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            retention: AtomicUsize::new(0),
        })
    }

    /// Trim the file down to the most recent `retention` lines, if a
    /// retention limit is configured and currently exceeded.
    fn enforce_retention(&self) {
        let retention = self.retention.load(Ordering::Relaxed);
        if retention == 0 {
            return;
        }
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return;
        };
        let lines: Vec<&str> = content.lines().collect();
        if lines.len() <= retention {
            return;
        }
        let trimmed = lines[lines.len() - retention..].join("\n") + "\n";
        if let Ok(mut file) = std::fs::OpenOptions::new().write(true).truncate(true).open(&self.path) {
            let _ = file.write_all(trimmed.as_bytes());
        }
        if let Ok(reopened) = std::fs::OpenOptions::new().append(true).open(&self.path) {
            *self.file.lock().unwrap() = reopened;
        }
    }
}

impl HistorySink for FileHistorySink {
    fn record(
        &self,
        at: DateTime<Utc>,
        key: &ServiceKey,
        prev: ServiceStatus,
        next: ServiceStatus,
        http_code: Option<u16>,
        response_time_ms: Option<u64>,
    ) {
        let record = HistoryRecord {
            ts: at,
            svc: key.to_string(),
            prev,
            next,
            code: http_code,
            ms: response_time_ms,
        };
        let Ok(line) = serde_json::to_string(&record) else {
            return;
        };
        {
            let mut file = self.file.lock().unwrap();
            if let Err(e) = writeln!(file, "{line}") {
                log::warn!("Failed to append history record: {e}");
                return;
            }
            let _ = file.flush();
        }
        self.enforce_retention();
    }

    fn set_retention(&self, retention: Option<usize>) {
        self.retention.store(retention.unwrap_or(0), Ordering::Relaxed);
    }
}

/// Drives [HistorySink::record] from the broker's event stream, tracking
/// the last-seen `compositeStatus` per key so a record is only written when
/// it actually changes.
pub async fn run_write_behind(broker: Arc<EventBroker>, sink: Arc<dyn HistorySink>, health_check_interval_ms: u64) {
    let mut sub = broker.subscribe(health_check_interval_ms);
    let clock = Arc::clone(broker.clock());
    let mut last_status: HashMap<ServiceKey, ServiceStatus> = HashMap::new();
    while let Some(event) = sub.recv().await {
        match event {
            BrokerEvent::State { snapshot, .. } => {
                for svc in snapshot.services {
                    last_status.insert(svc.key(), svc.composite_status);
                }
            }
            BrokerEvent::Discovered(svc) | BrokerEvent::Updated(svc) => {
                let key = svc.key();
                let prev = last_status
                    .get(&key)
                    .copied()
                    .unwrap_or(ServiceStatus::Unknown);
                if prev != svc.composite_status {
                    let at = svc.last_checked.unwrap_or_else(|| clock.now());
                    sink.record(
                        at,
                        &key,
                        prev,
                        svc.composite_status,
                        svc.http_code,
                        svc.response_time_ms,
                    );
                }
                last_status.insert(key, svc.composite_status);
            }
            BrokerEvent::Removed(key) => {
                last_status.remove(&key);
            }
            BrokerEvent::K8sStatus { .. } | BrokerEvent::ConfigErrors(_) | BrokerEvent::Keepalive => {}
        }
    }
}

/// One pending prefill entry: the last known `compositeStatus` for a
/// service key, read from history at startup.
#[derive(Debug, Clone, Copy)]
struct PendingEntry {
    next: ServiceStatus,
    ts: DateTime<Utc>,
}

/// Startup-only read of the history file: keeps the latest record per
/// service key so the ingress watcher and config reconciler can apply it
/// once, the first time they discover a matching key, to avoid a flash of
/// `unknown`.
pub struct HistoryPrefill {
    pending: Mutex<HashMap<ServiceKey, PendingEntry>>,
}

impl HistoryPrefill {
    /// Read `path`, keeping the latest record per key. A missing or
    /// unreadable file yields an empty prefill (this is a best-effort
    /// startup enrichment, not a required input).
    pub fn load(path: &Path) -> Self {
        let mut pending = HashMap::new();
        if let Ok(content) = std::fs::read_to_string(path) {
            for line in content.lines() {
                let Ok(record) = serde_json::from_str::<HistoryRecord>(line) else {
                    continue;
                };
                let Some((namespace, name)) = record.svc.split_once('/') else {
                    continue;
                };
                pending.insert(
                    ServiceKey::new(namespace, name),
                    PendingEntry {
                        next: record.next,
                        ts: record.ts,
                    },
                );
            }
        }
        Self {
            pending: Mutex::new(pending),
        }
    }

    /// An instance with nothing pending, for when no history file is
    /// configured.
    pub fn empty() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Apply the pending entry for `key`, if any, to the just-discovered
    /// service: set its raw `status` so the composite fusion rule produces
    /// the recorded `next` value immediately, then correct
    /// `lastStateChange` to the recorded transition time. Consumes the
    /// entry so it is only ever applied once.
    pub fn apply(&self, store: &ClockedStore, key: &ServiceKey) {
        let Some(entry) = self.pending.lock().unwrap().remove(key) else {
            return;
        };
        store.update(key, |svc| {
            svc.status = entry.next;
        });
        store.update(key, |svc| {
            svc.last_state_change = Some(entry.ts);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;
    use crate::store::{new_service, Store};
    use crate::time::SystemClock;

    #[test]
    fn prefill_applies_recorded_status_and_restores_timestamp() {
        let dir = std::env::temp_dir().join(format!("history-sink-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("history.jsonl");
        let record = HistoryRecord {
            ts: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            svc: "default/my-app".to_owned(),
            prev: ServiceStatus::Unknown,
            next: ServiceStatus::Healthy,
            code: Some(200),
            ms: Some(12),
        };
        std::fs::write(&path, serde_json::to_string(&record).unwrap() + "\n").unwrap();

        let prefill = HistoryPrefill::load(&path);
        let store = ClockedStore::new(Store::new(), Arc::new(SystemClock));
        let key = ServiceKey::new("default", "my-app");
        store.add_or_update_ingress(new_service("default", "my-app", Source::Kubernetes));
        prefill.apply(&store, &key);

        let svc = store.get(&key).unwrap();
        assert_eq!(svc.composite_status, ServiceStatus::Healthy);
        assert_eq!(
            svc.last_state_change,
            Some(
                DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                    .unwrap()
                    .with_timezone(&Utc)
            )
        );

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn prefill_is_consumed_once() {
        let dir = std::env::temp_dir().join(format!("history-sink-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("history.jsonl");
        let record = HistoryRecord {
            ts: Utc::now(),
            svc: "default/my-app".to_owned(),
            prev: ServiceStatus::Unknown,
            next: ServiceStatus::Healthy,
            code: None,
            ms: None,
        };
        std::fs::write(&path, serde_json::to_string(&record).unwrap() + "\n").unwrap();
        let prefill = HistoryPrefill::load(&path);
        let store = ClockedStore::new(Store::new(), Arc::new(SystemClock));
        let key = ServiceKey::new("default", "my-app");
        store.add_or_update_ingress(new_service("default", "my-app", Source::Kubernetes));
        prefill.apply(&store, &key);
        store.update(&key, |svc| svc.status = ServiceStatus::Unhealthy);
        prefill.apply(&store, &key); // second call: nothing pending anymore
        assert_eq!(store.get(&key).unwrap().status, ServiceStatus::Unhealthy);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn null_sink_is_a_no_op() {
        let sink = NullHistorySink;
        sink.record(Utc::now(), &ServiceKey::new("default", "a"), ServiceStatus::Unknown, ServiceStatus::Healthy, None, None);
    }
}
