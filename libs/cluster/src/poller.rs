//! Cluster-level waits on top of the generic [`Poller`].

use std::sync::Arc;
use std::time::Duration;

use cirrus_id::ClusterId;
use cirrus_reconcile::{CancelSignal, Poller, WaitError, WaitOutcome};

use crate::client::ClusterClient;
use crate::diff::has_pending_updates;
use crate::error::ClientError;
use crate::model::{ClusterSpec, ClusterState, ClusterStatus};

/// One read of a cluster during a wait.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Present(ClusterState),
    /// The service no longer knows the cluster.
    Gone,
}

impl Observation {
    pub fn state(&self) -> Option<&ClusterState> {
        match self {
            Self::Present(state) => Some(state),
            Self::Gone => None,
        }
    }

    pub fn into_state(self) -> Option<ClusterState> {
        match self {
            Self::Present(state) => Some(state),
            Self::Gone => None,
        }
    }

    pub fn status(&self) -> Option<ClusterStatus> {
        self.state().map(|s| s.status)
    }
}

/// Condition a wait is looking for.
#[derive(Debug, Clone)]
pub enum ClusterPredicate {
    /// Any successful read, including the cluster being gone.
    Observed,
    /// Accepting work, or a terminal status that will never get there.
    Ready,
    /// Ready with every in-place attribute group matching the spec.
    Converged(Box<ClusterSpec>),
    /// Termination protection observed off.
    ProtectionCleared,
    /// Terminated or no longer known to the service.
    Gone,
}

impl ClusterPredicate {
    pub fn ready() -> Self {
        Self::Ready
    }

    pub fn converged(spec: &ClusterSpec) -> Self {
        Self::Converged(Box::new(spec.clone()))
    }

    pub fn protection_cleared() -> Self {
        Self::ProtectionCleared
    }

    pub fn gone() -> Self {
        Self::Gone
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Observed => "observed",
            Self::Ready => "ready",
            Self::Converged(_) => "converged",
            Self::ProtectionCleared => "protection_cleared",
            Self::Gone => "gone",
        }
    }

    /// Whether a missing cluster counts as an observation rather than an
    /// error. Only refreshes and delete-class waits expect the cluster to be
    /// able to disappear.
    pub fn accepts_missing(&self) -> bool {
        matches!(self, Self::Observed | Self::ProtectionCleared | Self::Gone)
    }

    pub fn holds(&self, observation: &Observation) -> bool {
        let state = match observation {
            Observation::Gone => return self.accepts_missing(),
            Observation::Present(state) => state,
        };
        let status = state.status;
        match self {
            Self::Observed => true,
            Self::Ready => status.is_ready() || status.is_terminal(),
            Self::Converged(spec) => {
                status.is_terminal()
                    || (status.is_ready() && !has_pending_updates(&state.attributes, spec))
            }
            Self::ProtectionCleared => {
                status.is_terminal() || !state.attributes.termination_protection
            }
            Self::Gone => status.is_terminal(),
        }
    }
}

/// Polls one cluster through the remote client.
#[derive(Clone)]
pub struct ClusterPoller {
    client: Arc<dyn ClusterClient>,
    poller: Poller,
}

impl ClusterPoller {
    /// `poller` supplies the interval and backoff; each wait passes its own
    /// timeout.
    pub fn new(client: Arc<dyn ClusterClient>, poller: Poller) -> Self {
        Self { client, poller }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poller.poll_interval
    }

    /// Wait until `predicate` holds for cluster `id`, or `timeout` passes.
    pub async fn wait_for(
        &self,
        id: &ClusterId,
        predicate: &ClusterPredicate,
        timeout: Duration,
        cancel: &mut CancelSignal,
    ) -> Result<WaitOutcome<Observation>, WaitError<Observation, ClientError>> {
        let poller = Poller {
            timeout,
            ..self.poller.clone()
        };
        let accepts_missing = predicate.accepts_missing();
        let resource = format!("cluster {id} ({})", predicate.name());

        let read = || {
            let client = Arc::clone(&self.client);
            let id = id.clone();
            async move {
                match client.describe(&id).await {
                    Ok(state) => Ok(Observation::Present(state)),
                    Err(err) if accepts_missing && err.is_not_found() => Ok(Observation::Gone),
                    Err(err) => Err(err),
                }
            }
        };

        poller
            .wait_for(&resource, read, |obs| predicate.holds(obs), cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CallKind, MockClusterClient};
    use crate::error::ErrorKind;
    use crate::model::{FixedTopology, InstanceTopology, NetworkAttachment};

    fn spec() -> ClusterSpec {
        ClusterSpec::new(
            "emr-test",
            "emr-4.6.0",
            "EMR_DefaultRole",
            InstanceTopology::Fixed(FixedTopology {
                master_instance_type: "c4.large".into(),
                core_instance_type: "c4.large".into(),
                core_instance_count: 1,
            }),
            NetworkAttachment {
                subnet_id: "subnet-1".into(),
                instance_profile: "emr-profile".into(),
                ..Default::default()
            },
        )
    }

    fn poller(mock: &Arc<MockClusterClient>) -> ClusterPoller {
        ClusterPoller::new(
            mock.clone(),
            Poller::new(Duration::from_secs(60), Duration::from_secs(10)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_script() {
        let mock = Arc::new(MockClusterClient::new().with_create_script(vec![
            ClusterStatus::Starting,
            ClusterStatus::Bootstrapping,
            ClusterStatus::Waiting,
        ]));
        let id = mock.create(&spec()).await.unwrap();

        let outcome = poller(&mock)
            .wait_for(
                &id,
                &ClusterPredicate::ready(),
                Duration::from_secs(600),
                &mut CancelSignal::never(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.reads, 3);
        assert_eq!(outcome.value.status(), Some(ClusterStatus::Waiting));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_cluster_is_gone_only_for_delete_waits() {
        let mock = Arc::new(MockClusterClient::new());
        let id = ClusterId::parse("j-MISSING").unwrap();
        let poller = poller(&mock);

        let gone = poller
            .wait_for(
                &id,
                &ClusterPredicate::gone(),
                Duration::from_secs(60),
                &mut CancelSignal::never(),
            )
            .await
            .unwrap();
        assert_eq!(gone.value, Observation::Gone);

        let cleared = poller
            .wait_for(
                &id,
                &ClusterPredicate::protection_cleared(),
                Duration::from_secs(60),
                &mut CancelSignal::never(),
            )
            .await
            .unwrap();
        assert_eq!(cleared.value, Observation::Gone);

        let err = poller
            .wait_for(
                &id,
                &ClusterPredicate::ready(),
                Duration::from_secs(60),
                &mut CancelSignal::never(),
            )
            .await
            .unwrap_err();
        match err {
            WaitError::Failed { error, .. } => assert_eq!(error.kind, ErrorKind::NotFound),
            other => panic!("unexpected wait error: {other}"),
        }
        assert_eq!(mock.calls_of(CallKind::Describe).await.len(), 3);
    }

    #[test]
    fn test_converged_requires_in_place_groups() {
        let desired = {
            let mut s = spec();
            s.visible_to_all_users = false;
            s
        };
        let state = ClusterState {
            id: ClusterId::parse("j-1").unwrap(),
            status: ClusterStatus::Waiting,
            status_reason: None,
            attributes: spec(),
            master_public_dns: None,
            observed_at: chrono::Utc::now(),
        };
        let predicate = ClusterPredicate::converged(&desired);
        assert!(!predicate.holds(&Observation::Present(state.clone())));

        let mut updated = state;
        updated.attributes.visible_to_all_users = false;
        assert!(predicate.holds(&Observation::Present(updated)));
    }
}
