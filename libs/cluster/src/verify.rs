//! Post-condition checks against the remote service.
//!
//! Used after a reconciliation pass to confirm that the service agrees with
//! what the orchestrator reported: a destroyed cluster is really gone, a
//! ready cluster really matches its spec.

use cirrus_id::ClusterId;
use thiserror::Error;

use crate::client::ClusterClient;
use crate::diff::diff;
use crate::error::ClientError;
use crate::model::{BootstrapAction, ClusterSpec, ClusterState, ClusterStatus};

/// A failed post-condition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VerifyError {
    #[error("cluster {id} still exists ({status})")]
    StillExists { id: ClusterId, status: ClusterStatus },

    #[error("cluster {id} is {status}, expected WAITING")]
    NotReady { id: ClusterId, status: ClusterStatus },

    #[error("cluster {id} does not exist")]
    Missing { id: ClusterId },

    #[error("cluster {id} drifted from its spec: {}", .groups.join(", "))]
    Drift { id: ClusterId, groups: Vec<String> },

    #[error("bootstrap actions out of order: expected {expected:?}, got {actual:?}")]
    BootstrapOrder {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("describe failed: {0}")]
    Remote(#[from] ClientError),
}

/// Confirm that `id` is gone or terminated.
pub async fn verify_destroyed(client: &dyn ClusterClient, id: &ClusterId) -> Result<(), VerifyError> {
    match client.describe(id).await {
        Ok(state) if state.status.is_terminal() => Ok(()),
        Ok(state) => Err(VerifyError::StillExists {
            id: id.clone(),
            status: state.status,
        }),
        Err(error) if error.is_not_found() => Ok(()),
        Err(error) => Err(error.into()),
    }
}

/// Confirm that `id` exists and is ready, returning its state.
pub async fn verify_ready(
    client: &dyn ClusterClient,
    id: &ClusterId,
) -> Result<ClusterState, VerifyError> {
    let state = match client.describe(id).await {
        Ok(state) => state,
        Err(error) if error.is_not_found() => return Err(VerifyError::Missing { id: id.clone() }),
        Err(error) => return Err(error.into()),
    };
    if !state.status.is_ready() {
        return Err(VerifyError::NotReady {
            id: id.clone(),
            status: state.status,
        });
    }
    Ok(state)
}

/// Confirm that `id` is ready and shows no difference from `spec`.
pub async fn verify_matches(
    client: &dyn ClusterClient,
    id: &ClusterId,
    spec: &ClusterSpec,
) -> Result<ClusterState, VerifyError> {
    let state = verify_ready(client, id).await?;
    let changes = diff(Some(&state), spec);
    if !changes.is_empty() {
        let mut groups: Vec<String> = changes
            .changes()
            .iter()
            .map(|c| c.group.to_string())
            .collect();
        groups.dedup();
        return Err(VerifyError::Drift {
            id: id.clone(),
            groups,
        });
    }
    Ok(state)
}

/// Confirm the observed bootstrap actions are exactly `expected`, in order.
pub fn verify_bootstrap_order(
    state: &ClusterState,
    expected: &[BootstrapAction],
) -> Result<(), VerifyError> {
    if state.attributes.bootstrap_actions == expected {
        return Ok(());
    }
    let names = |actions: &[BootstrapAction]| -> Vec<String> {
        actions.iter().map(|a| a.name.clone()).collect()
    };
    Err(VerifyError::BootstrapOrder {
        expected: names(expected),
        actual: names(&state.attributes.bootstrap_actions),
    })
}
