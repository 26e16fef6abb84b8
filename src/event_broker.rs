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

//! Multiplexes [crate::store::Store] change events to external subscribers,
//! attaching a full-state snapshot on subscribe and a keepalive when idle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::model::{Event, Service, ServiceKey};
use crate::store::{ClockedStore, StateSnapshot, DEFAULT_SUBSCRIBER_CAPACITY};
use crate::time::Clock;

/// How often an idle subscriber receives a benign keepalive marker.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Everything a broker subscriber can observe, in delivery order: always a
/// `State` first, then a FIFO-per-key stream of changes and keepalives.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// Full-state snapshot, delivered exactly once as the first event.
    State {
        /// Application version, as reported on the `state` SSE event.
        app_version: String,
        /// Deep snapshot of every known service plus cluster-wide flags.
        snapshot: StateSnapshot,
        /// Configured probe-cycle interval in milliseconds.
        health_check_interval_ms: u64,
    },
    /// A new service was discovered.
    Discovered(Service),
    /// An existing service changed.
    Updated(Service),
    /// A service was removed.
    Removed(ServiceKey),
    /// Cluster connectivity changed.
    K8sStatus {
        /// Whether the informer cache is currently connected/synced.
        connected: bool,
        /// When this connectivity state was observed, in milliseconds since
        /// the Unix epoch.
        at_millis: i64,
    },
    /// The set of configuration validation errors changed.
    ConfigErrors(Vec<String>),
    /// Benign idle marker; never carries information.
    Keepalive,
}

fn translate(event: Event) -> BrokerEvent {
    match event {
        Event::Discovered(svc) => BrokerEvent::Discovered(svc),
        Event::Updated(svc) => BrokerEvent::Updated(svc),
        Event::Removed(key) => BrokerEvent::Removed(key),
        Event::K8sStatus { connected, at } => BrokerEvent::K8sStatus {
            connected,
            at_millis: at.timestamp_millis(),
        },
        Event::ConfigErrors(errors) => BrokerEvent::ConfigErrors(errors),
    }
}

/// A live registration with the broker. Dropping it (or the background task
/// observing the underlying store subscription close) ends delivery.
pub struct BrokerSubscription {
    receiver: mpsc::Receiver<BrokerEvent>,
}

impl BrokerSubscription {
    /// Receive the next event, or `None` once the subscription has ended
    /// (e.g. the store dropped it for queue overflow).
    pub async fn recv(&mut self) -> Option<BrokerEvent> {
        self.receiver.recv().await
    }
}

/// Re-broadcasts [crate::store::Store] changes to external subscribers.
pub struct EventBroker {
    store: ClockedStore,
    app_version: String,
}

impl EventBroker {
    /// Return a new instance. `app_version` is surfaced verbatim on every
    /// `state` event.
    pub fn new(store: ClockedStore, app_version: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            store,
            app_version: app_version.into(),
        })
    }

    /// Register a new subscriber. A subscriber's first event is always
    /// `state`: the underlying store subscription is created *before* the
    /// snapshot is read, so any mutation racing with the snapshot is, at
    /// worst, double-observed (once in the snapshot, once as a subsequent
    /// change) rather than lost.
    pub fn subscribe(self: &Arc<Self>, health_check_interval_ms: u64) -> BrokerSubscription {
        let mut store_sub = self.store.subscribe(DEFAULT_SUBSCRIBER_CAPACITY);
        let snapshot = self.store.snapshot();
        let (tx, rx) = mpsc::channel(DEFAULT_SUBSCRIBER_CAPACITY);

        let _ = tx.try_send(BrokerEvent::State {
            app_version: self.app_version.clone(),
            snapshot,
            health_check_interval_ms,
        });

        tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    event = store_sub.recv() => {
                        let Some(event) = event else { break };
                        if tx.send(translate(event)).await.is_err() {
                            break;
                        }
                        keepalive.reset();
                    }
                    _ = keepalive.tick() => {
                        if tx.send(BrokerEvent::Keepalive).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        BrokerSubscription { receiver: rx }
    }

    /// The clock timestamping the underlying store's mutations, for
    /// consumers (like the history sink) that need to stamp a fallback
    /// timestamp outside a `Store::update` mutator.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        self.store.clock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ServiceStatus, Source};
    use crate::store::{new_service, Store};
    use crate::time::SystemClock;

    fn broker() -> (Arc<EventBroker>, ClockedStore) {
        let store = ClockedStore::new(Store::new(), Arc::new(SystemClock));
        (EventBroker::new(store.clone(), "1.2.3"), store)
    }

    #[tokio::test]
    async fn first_event_is_always_state() {
        let (broker, _store) = broker();
        let mut sub = broker.subscribe(30_000);
        let first = sub.recv().await.unwrap();
        assert!(matches!(first, BrokerEvent::State { .. }));
    }

    #[tokio::test]
    async fn subsequent_changes_are_delivered_in_order() {
        let (broker, store) = broker();
        let mut sub = broker.subscribe(30_000);
        assert!(matches!(sub.recv().await.unwrap(), BrokerEvent::State { .. }));

        store.add_or_update_ingress(new_service("default", "a", Source::Kubernetes));
        store.update(&ServiceKey::new("default", "a"), |svc| {
            svc.status = ServiceStatus::Healthy;
        });

        assert!(matches!(sub.recv().await.unwrap(), BrokerEvent::Discovered(_)));
        assert!(matches!(sub.recv().await.unwrap(), BrokerEvent::Updated(_)));
    }

    #[tokio::test]
    async fn state_snapshot_reflects_version_and_interval() {
        let (broker, _store) = broker();
        let mut sub = broker.subscribe(45_000);
        match sub.recv().await.unwrap() {
            BrokerEvent::State {
                app_version,
                health_check_interval_ms,
                ..
            } => {
                assert_eq!(app_version, "1.2.3");
                assert_eq!(health_check_interval_ms, 45_000);
            }
            other => panic!("expected State, got {other:?}"),
        }
    }
}
