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

//! The event stream API resource: the sole runtime API.

use actix_web::web::{Bytes, Data};
use actix_web::{get, Error, HttpResponse, Responder};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;

use crate::event_broker::BrokerEvent;
use crate::model::ServiceKey;

use super::AppState;

fn sse_frame(event: &str, payload: &impl Serialize) -> String {
    format!(
        "event: {event}\ndata: {}\n\n",
        serde_json::to_string(payload).unwrap_or_default()
    )
}

#[derive(Serialize)]
struct RemovedPayload<'a> {
    namespace: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
struct K8sStatusPayload {
    #[serde(rename = "k8sConnected")]
    k8s_connected: bool,
    #[serde(rename = "k8sLastEvent")]
    k8s_last_event: DateTime<Utc>,
}

#[derive(Serialize)]
struct StatePayload<'a> {
    #[serde(rename = "appVersion")]
    app_version: &'a str,
    services: Vec<crate::model::Service>,
    #[serde(rename = "k8sConnected")]
    k8s_connected: bool,
    #[serde(rename = "k8sLastEvent")]
    k8s_last_event: Option<DateTime<Utc>>,
    #[serde(rename = "healthCheckIntervalMs")]
    health_check_interval_ms: u64,
    #[serde(rename = "configErrors")]
    config_errors: &'a [String],
}

fn format_event(event: BrokerEvent) -> String {
    match event {
        BrokerEvent::State {
            app_version,
            snapshot,
            health_check_interval_ms,
        } => sse_frame(
            "state",
            &StatePayload {
                app_version: &app_version,
                k8s_connected: snapshot.k8s_connected,
                k8s_last_event: snapshot.k8s_last_event,
                health_check_interval_ms,
                config_errors: &snapshot.config_errors,
                services: snapshot.services,
            },
        ),
        BrokerEvent::Discovered(svc) => sse_frame("discovered", &svc),
        BrokerEvent::Updated(svc) => sse_frame("update", &svc),
        BrokerEvent::Removed(ServiceKey { namespace, name }) => sse_frame(
            "removed",
            &RemovedPayload {
                namespace: &namespace,
                name: &name,
            },
        ),
        BrokerEvent::K8sStatus { connected, at_millis } => sse_frame(
            "k8sStatus",
            &K8sStatusPayload {
                k8s_connected: connected,
                k8s_last_event: DateTime::from_timestamp_millis(at_millis).unwrap_or_else(Utc::now),
            },
        ),
        BrokerEvent::ConfigErrors(errors) => sse_frame("configErrors", &serde_json::json!({ "configErrors": errors })),
        BrokerEvent::Keepalive => ": keepalive\n\n".to_owned(),
    }
}

/// The live service-health event stream: a `state` snapshot followed by a
/// FIFO-per-key stream of changes, with a keepalive comment at least every
/// 15 s. Never compressed or buffered.
#[utoipa::path(responses((status = 200, description = "Server-Sent Events stream", content_type = "text/event-stream"),))]
#[get("/events")]
pub async fn events(app_state: Data<AppState>) -> impl Responder {
    let health_check_interval_ms = app_state.reconciler.interval().as_millis() as u64;
    let sub = app_state.broker.subscribe(health_check_interval_ms);
    let stream = futures::stream::unfold(sub, |mut sub| async move {
        sub.recv().await.map(|event| (event, sub))
    })
    .map(|event| Ok::<Bytes, Error>(Bytes::from(format_event(event))));

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .streaming(stream)
}
