//! Pod watch client and pod condition helpers

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use tokio_util::sync::CancellationToken;

use super::{ResourceApi, WatchEventHandler, WatchHandle, WatchSubscription, Watcher};
use crate::Error;

// Kubernetes pod condition type constants
/// Pod condition: all init containers have completed
pub const CONDITION_INITIALIZED: &str = "Initialized";
/// Pod condition: the pod can serve requests
pub const CONDITION_READY: &str = "Ready";
/// Pod condition: all containers are ready
pub const CONDITION_CONTAINERS_READY: &str = "ContainersReady";
/// Pod condition: the pod has been bound to a node
pub const CONDITION_POD_SCHEDULED: &str = "PodScheduled";

/// Watches pods matching a label selector in one namespace
pub struct PodClient {
    subscription: WatchSubscription<Pod>,
}

impl PodClient {
    /// Create a pod client
    pub fn new(
        api: Arc<dyn ResourceApi<Pod>>,
        cluster_code: impl Into<String>,
        namespace: impl Into<String>,
        label_selector: impl Into<String>,
        handler: Arc<dyn WatchEventHandler<Pod>>,
    ) -> Self {
        Self {
            subscription: WatchSubscription::new(
                "Pods",
                api,
                handler,
                cluster_code,
                namespace,
                label_selector,
            ),
        }
    }

    /// The underlying subscription
    pub fn subscription(&self) -> &WatchSubscription<Pod> {
        &self.subscription
    }
}

#[async_trait]
impl Watcher for PodClient {
    async fn do_watch(&self, ctx: CancellationToken) -> Result<WatchHandle, Error> {
        self.subscription.do_watch(ctx).await
    }
}

/// Status value of a pod condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionStatus {
    /// The condition holds
    True,
    /// The condition does not hold
    False,
    /// The kubelet cannot tell (also used for unrecognized values)
    Unknown,
}

impl ConditionStatus {
    /// Parse a condition status string as reported by the API server
    pub fn parse(status: &str) -> Self {
        match status {
            "True" => Self::True,
            "False" => Self::False,
            _ => Self::Unknown,
        }
    }
}

/// Statuses of the four well-known pod conditions; `None` when a condition is absent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PodConditionStatuses {
    /// `Initialized`
    pub initialized: Option<ConditionStatus>,
    /// `Ready`
    pub ready: Option<ConditionStatus>,
    /// `ContainersReady`
    pub containers_ready: Option<ConditionStatus>,
    /// `PodScheduled`
    pub scheduled: Option<ConditionStatus>,
}

/// Extract the well-known condition statuses from a pod
///
/// Scans every condition without stopping early, so if a kind appears more
/// than once the last occurrence wins.
pub fn pod_condition_status(pod: &Pod) -> PodConditionStatuses {
    let mut statuses = PodConditionStatuses::default();
    let conditions = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();

    for condition in conditions {
        let status = Some(ConditionStatus::parse(&condition.status));
        match condition.type_.as_str() {
            CONDITION_INITIALIZED => statuses.initialized = status,
            CONDITION_READY => statuses.ready = status,
            CONDITION_CONTAINERS_READY => statuses.containers_ready = status,
            CONDITION_POD_SCHEDULED => statuses.scheduled = status,
            _ => {}
        }
    }

    statuses
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};

    fn pod_with_conditions(conditions: &[(&str, &str)]) -> Pod {
        Pod {
            status: Some(PodStatus {
                conditions: Some(
                    conditions
                        .iter()
                        .map(|(type_, status)| PodCondition {
                            type_: type_.to_string(),
                            status: status.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn only_ready_reported() {
        let pod = pod_with_conditions(&[("Ready", "True")]);
        let statuses = pod_condition_status(&pod);

        assert_eq!(statuses.ready, Some(ConditionStatus::True));
        assert_eq!(statuses.initialized, None);
        assert_eq!(statuses.containers_ready, None);
        assert_eq!(statuses.scheduled, None);
    }

    #[test]
    fn all_conditions_extracted_in_any_order() {
        let pod = pod_with_conditions(&[
            ("PodScheduled", "True"),
            ("ContainersReady", "False"),
            ("Initialized", "True"),
            ("Ready", "Unknown"),
        ]);

        assert_eq!(
            pod_condition_status(&pod),
            PodConditionStatuses {
                initialized: Some(ConditionStatus::True),
                ready: Some(ConditionStatus::Unknown),
                containers_ready: Some(ConditionStatus::False),
                scheduled: Some(ConditionStatus::True),
            }
        );
    }

    #[test]
    fn last_duplicate_wins() {
        let pod = pod_with_conditions(&[("Ready", "False"), ("Ready", "True")]);
        assert_eq!(pod_condition_status(&pod).ready, Some(ConditionStatus::True));
    }

    #[test]
    fn pod_without_status_has_no_conditions() {
        assert_eq!(
            pod_condition_status(&Pod::default()),
            PodConditionStatuses::default()
        );
    }

    #[test]
    fn unrelated_conditions_are_ignored() {
        let pod = pod_with_conditions(&[("DisruptionTarget", "True")]);
        assert_eq!(pod_condition_status(&pod), PodConditionStatuses::default());
    }

    #[test]
    fn unrecognized_status_reads_as_unknown() {
        assert_eq!(ConditionStatus::parse("maybe"), ConditionStatus::Unknown);
        assert_eq!(ConditionStatus::parse("False"), ConditionStatus::False);
    }
}
