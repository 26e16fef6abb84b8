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

//! Best-effort enrichment of not-ready backend pods with container-failure
//! diagnostics.

use std::time::Duration;

use k8s_openapi::api::core::v1::{ContainerState, ContainerStatus, Pod};
use kube::Api;

use crate::model::PodDiagnostic;

const PER_POD_TIMEOUT: Duration = Duration::from_secs(5);

/// Reasons ordered by severity, most severe first. Anything not in this list
/// ties-break by first-seen order among the observed pods.
const REASON_PRIORITY: &[&str] = &["CrashLoopBackOff", "OOMKilled", "ImagePullBackOff", "Error"];

fn reason_rank(reason: &str) -> usize {
    REASON_PRIORITY
        .iter()
        .position(|known| *known == reason)
        .unwrap_or(REASON_PRIORITY.len())
}

/// Container-failure reasons and restart count collected from a single pod's
/// container statuses.
struct PodContainerFacts {
    reasons: Vec<String>,
    restart_count: u32,
}

fn container_state_reason(state: &ContainerState) -> Option<String> {
    if let Some(waiting) = &state.waiting {
        return waiting.reason.clone();
    }
    if let Some(terminated) = &state.terminated {
        return terminated.reason.clone();
    }
    None
}

fn collect_container_facts(statuses: &[ContainerStatus]) -> PodContainerFacts {
    let mut reasons = Vec::new();
    let mut restart_count = 0u32;
    for status in statuses {
        restart_count += status.restart_count.max(0) as u32;
        if let Some(state) = &status.state {
            if let Some(reason) = container_state_reason(state) {
                if !reasons.contains(&reason) {
                    reasons.push(reason);
                }
            }
        }
    }
    PodContainerFacts {
        reasons,
        restart_count,
    }
}

fn facts_from_pod(pod: &Pod) -> PodContainerFacts {
    let status = pod.status.as_ref();
    let init = status
        .and_then(|s| s.init_container_statuses.as_deref())
        .unwrap_or(&[]);
    let main = status.and_then(|s| s.container_statuses.as_deref()).unwrap_or(&[]);
    let init_facts = collect_container_facts(init);
    let main_facts = collect_container_facts(main);
    let mut reasons = init_facts.reasons;
    for reason in main_facts.reasons {
        if !reasons.contains(&reason) {
            reasons.push(reason);
        }
    }
    PodContainerFacts {
        reasons,
        restart_count: init_facts.restart_count + main_facts.restart_count,
    }
}

/// Pick the most severe reason from the deduped, first-seen-ordered list
/// gathered across every diagnosed pod.
fn most_severe(reasons: &[String]) -> Option<String> {
    reasons
        .iter()
        .enumerate()
        .min_by_key(|(index, reason)| (reason_rank(reason), *index))
        .map(|(_, reason)| reason.clone())
}

/// Fetches and aggregates container-failure facts for a set of not-ready
/// pods. One instance is shared across the lifetime of the process.
pub struct PodDiagnosticQuerier {
    client: kube::Client,
}

impl PodDiagnosticQuerier {
    /// Return a new instance using `client` to reach the API server.
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    /// Fetch every named pod in `namespace` in parallel (best-effort, each
    /// bounded by [PER_POD_TIMEOUT]) and aggregate their container facts. A
    /// pod that fails to fetch or times out is logged and skipped.
    /// Returns `None` if no reason and no restarts were observed.
    pub async fn diagnose(&self, namespace: &str, pod_names: &[String]) -> Option<PodDiagnostic> {
        let api = Api::<Pod>::namespaced(self.client.clone(), namespace);
        let fetches = pod_names.iter().map(|name| {
            let api = api.clone();
            let name = name.clone();
            async move {
                match tokio::time::timeout(PER_POD_TIMEOUT, api.get(&name)).await {
                    Ok(Ok(pod)) => Some(facts_from_pod(&pod)),
                    Ok(Err(e)) => {
                        log::warn!("Failed to fetch pod '{namespace}/{name}' for diagnostics: {e}");
                        None
                    }
                    Err(_) => {
                        log::warn!("Timed out fetching pod '{namespace}/{name}' for diagnostics");
                        None
                    }
                }
            }
        });
        let results = futures::future::join_all(fetches).await;

        let mut reasons = Vec::new();
        let mut restart_count = 0u32;
        for facts in results.into_iter().flatten() {
            for reason in facts.reasons {
                if !reasons.contains(&reason) {
                    reasons.push(reason);
                }
            }
            restart_count += facts.restart_count;
        }
        let reason = most_severe(&reasons);
        if reason.is_none() && restart_count == 0 {
            return None;
        }
        Some(PodDiagnostic {
            reason,
            restart_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_loop_outranks_everything_else() {
        let reasons = vec![
            "Error".to_owned(),
            "OOMKilled".to_owned(),
            "CrashLoopBackOff".to_owned(),
        ];
        assert_eq!(most_severe(&reasons).as_deref(), Some("CrashLoopBackOff"));
    }

    #[test]
    fn unknown_reasons_tie_break_by_first_seen() {
        let reasons = vec!["SomeCustomReason".to_owned(), "AnotherCustomReason".to_owned()];
        assert_eq!(most_severe(&reasons).as_deref(), Some("SomeCustomReason"));
    }

    #[test]
    fn known_reason_beats_unknown_regardless_of_order() {
        let reasons = vec!["MysteryReason".to_owned(), "ImagePullBackOff".to_owned()];
        assert_eq!(most_severe(&reasons).as_deref(), Some("ImagePullBackOff"));
    }

    #[test]
    fn empty_reasons_yield_none() {
        assert_eq!(most_severe(&[]), None);
    }
}
