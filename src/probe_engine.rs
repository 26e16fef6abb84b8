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

//! Periodic composite-health probing: the fusion core of the whole system.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config_reconciler::ConfigReconciler;
use crate::model::{Service, ServiceKey, ServiceStatus, Source};
use crate::store::ClockedStore;

/// Upper bound on concurrent in-flight probes, regardless of service count.
const MAX_CONCURRENT_PROBES: usize = 64;

fn error_snippet(message: &str) -> String {
    message.replace(['\t', '\n', '\r'], " ").chars().take(80).collect()
}

/// Size the per-cycle worker pool to the number of services being probed
/// this cycle, capped at [MAX_CONCURRENT_PROBES]. Never zero, so a cycle
/// with services can always make progress.
fn permit_count(service_count: usize) -> usize {
    service_count.clamp(1, MAX_CONCURRENT_PROBES)
}

/// Outcome of a single probe, ready to be applied to the store.
struct ProbeResult {
    status: ServiceStatus,
    http_code: Option<u16>,
    response_time_ms: u64,
    error_snippet: Option<String>,
    auth_guarded: bool,
}

async fn probe_one(client: &reqwest::Client, svc: &Service, timeout: Duration) -> ProbeResult {
    let url = svc.probe_url().to_owned();
    let expected = svc.expected_status_codes();
    let started = Instant::now();
    match client.get(&url).timeout(timeout).send().await {
        Ok(response) => {
            let code = response.status().as_u16();
            let response_time_ms = started.elapsed().as_millis() as u64;
            let status = if expected.contains(&code) {
                ServiceStatus::Healthy
            } else {
                ServiceStatus::Unhealthy
            };
            let auth_guarded = svc.source == Source::Kubernetes && matches!(code, 401 | 403);
            let error_snippet = (status == ServiceStatus::Unhealthy)
                .then(|| error_snippet(&format!("unexpected HTTP status {code}")));
            ProbeResult {
                status,
                http_code: Some(code),
                response_time_ms,
                error_snippet,
                auth_guarded,
            }
        }
        Err(e) => ProbeResult {
            status: ServiceStatus::Unhealthy,
            http_code: None,
            response_time_ms: started.elapsed().as_millis() as u64,
            error_snippet: Some(error_snippet(&e.to_string())),
            auth_guarded: false,
        },
    }
}

/// Runs the periodic probe cycle: one `reqwest::Client` shared across
/// cycles, a per-cycle semaphore sized to that cycle's service count, and a
/// cycle that never waits for stragglers genuinely still in flight from the
/// previous one.
pub struct ProbeEngine {
    store: ClockedStore,
    reconciler: Arc<ConfigReconciler>,
    client: reqwest::Client,
    in_flight: Mutex<HashSet<ServiceKey>>,
}

impl ProbeEngine {
    /// Return a new instance.
    pub fn new(store: ClockedStore, reconciler: Arc<ConfigReconciler>) -> Arc<Self> {
        Arc::new(Self {
            store,
            reconciler,
            client: reqwest::Client::new(),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Run probe cycles forever at `self.reconciler.interval()`, re-read each
    /// tick so a YAML `health.interval` change takes effect on the next
    /// cycle boundary.
    pub async fn run(self: Arc<Self>) {
        loop {
            let interval = self.reconciler.interval();
            tokio::time::sleep(interval).await;
            self.run_cycle();
        }
    }

    /// Kick off one probe cycle. The pool is sized to this cycle's service
    /// count (capped at [MAX_CONCURRENT_PROBES], per spec default "≤ number
    /// of services"); every service spawns a task that awaits a permit, so
    /// none are skipped for mere pool saturation. The only services skipped
    /// are ones whose *previous* cycle's probe hasn't completed yet.
    fn run_cycle(self: &Arc<Self>) {
        let snapshot = self.store.snapshot();
        let timeout = self.reconciler.timeout();
        let permits = permit_count(snapshot.services.len());
        let semaphore = Arc::new(tokio::sync::Semaphore::new(permits));
        for svc in snapshot.services {
            let key = svc.key();
            if !self.in_flight.lock().unwrap().insert(key.clone()) {
                log::warn!(
                    "Skipping probe of '{key}' this cycle: still in flight from the previous cycle"
                );
                continue;
            }
            let engine = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                engine.probe_and_apply(svc, timeout).await;
                engine.in_flight.lock().unwrap().remove(&key);
            });
        }
    }

    async fn probe_and_apply(self: &Arc<Self>, svc: Service, timeout: Duration) {
        let key = svc.key();
        let result = probe_one(&self.client, &svc, timeout).await;
        let at = self.store.clock().now();
        self.store.update(&key, move |svc| {
            svc.status = result.status;
            svc.http_code = result.http_code;
            svc.response_time_ms = Some(result.response_time_ms);
            svc.error_snippet = result.error_snippet;
            svc.auth_guarded = result.auth_guarded;
            svc.last_checked = Some(at);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_snippet_strips_control_characters_and_truncates() {
        let long = "a".repeat(100);
        let message = format!("line one\tline two\n{long}");
        let snippet = error_snippet(&message);
        assert_eq!(snippet.len(), 80);
        assert!(!snippet.contains('\t'));
        assert!(!snippet.contains('\n'));
    }

    #[test]
    fn permit_count_tracks_service_count_up_to_the_hard_cap() {
        assert_eq!(permit_count(0), 1);
        assert_eq!(permit_count(1), 1);
        assert_eq!(permit_count(5), 5);
        assert_eq!(permit_count(MAX_CONCURRENT_PROBES), MAX_CONCURRENT_PROBES);
        assert_eq!(permit_count(MAX_CONCURRENT_PROBES + 1000), MAX_CONCURRENT_PROBES);
    }

    #[test]
    fn in_flight_set_rejects_a_second_insert_of_the_same_key_until_removed() {
        let in_flight: Mutex<HashSet<ServiceKey>> = Mutex::new(HashSet::new());
        let key = ServiceKey::new("default", "my-app");
        assert!(in_flight.lock().unwrap().insert(key.clone()));
        // A straggler still in flight from the previous cycle is not
        // re-submitted: the second insert of the same key fails.
        assert!(!in_flight.lock().unwrap().insert(key.clone()));
        in_flight.lock().unwrap().remove(&key);
        // Once the prior probe completes and clears the key, it is eligible
        // to be probed again.
        assert!(in_flight.lock().unwrap().insert(key));
    }

    #[tokio::test]
    async fn unreachable_host_yields_unhealthy_with_error_snippet() {
        let client = reqwest::Client::new();
        let mut svc = crate::store::new_service("default", "unreachable", Source::Kubernetes);
        svc.url = "http://127.0.0.1:1".to_owned(); // port 0 reserved, nothing listens
        let result = probe_one(&client, &svc, Duration::from_millis(500)).await;
        assert_eq!(result.status, ServiceStatus::Unhealthy);
        assert!(result.http_code.is_none());
        assert!(result.error_snippet.is_some());
    }
}
