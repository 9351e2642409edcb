//! In-memory cluster service for testing and development.
//!
//! Simulates the externally visible behaviour of the managed cluster service:
//! - status progresses one step per `describe`, following a script
//! - in-place updates can become visible only after a number of reads
//! - instance groups can come back in a different order than submitted
//! - live cluster names are unique (`Conflict` on duplicates)
//! - termination of a protected cluster is accepted and silently ignored
//!
//! Every call is recorded so tests can assert on call order.

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use cirrus_id::ClusterId;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{AttributeUpdate, ClusterClient};
use crate::error::{ClientError, ErrorKind};
use crate::model::{ClusterSpec, ClusterState, ClusterStatus, InstanceTopology};

/// Kind of remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Create,
    Describe,
    Update,
    Delete,
}

/// A recorded remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create { name: String },
    Describe { id: ClusterId },
    Update { id: ClusterId, update: AttributeUpdate },
    Delete { id: ClusterId },
}

impl Call {
    pub fn kind(&self) -> CallKind {
        match self {
            Self::Create { .. } => CallKind::Create,
            Self::Describe { .. } => CallKind::Describe,
            Self::Update { .. } => CallKind::Update,
            Self::Delete { .. } => CallKind::Delete,
        }
    }

    /// Returns true for calls that mutate remote state.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::Describe { .. })
    }
}

struct SimCluster {
    state: ClusterState,
    /// Statuses revealed one per describe.
    script: VecDeque<ClusterStatus>,
    /// Updates not yet visible: (describes remaining, update).
    pending: Vec<(u32, AttributeUpdate)>,
}

#[derive(Default)]
struct Inner {
    clusters: BTreeMap<ClusterId, SimCluster>,
    calls: Vec<Call>,
    faults: VecDeque<(CallKind, ClientError)>,
    next_id: u64,
}

impl Inner {
    fn take_fault(&mut self, kind: CallKind) -> Result<(), ClientError> {
        match self.faults.iter().position(|(k, _)| *k == kind) {
            Some(pos) => match self.faults.remove(pos) {
                Some((_, error)) => Err(error),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }
}

/// Mock cluster service.
pub struct MockClusterClient {
    inner: Mutex<Inner>,
    create_script: Vec<ClusterStatus>,
    delete_script: Vec<ClusterStatus>,
    failure_reason: String,
    update_delay: u32,
    reorder_groups: bool,
    forget_terminated: bool,
}

impl MockClusterClient {
    /// Create a mock service with the default status progressions.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            create_script: vec![
                ClusterStatus::Starting,
                ClusterStatus::Bootstrapping,
                ClusterStatus::Running,
                ClusterStatus::Waiting,
            ],
            delete_script: vec![ClusterStatus::Terminating, ClusterStatus::Terminated],
            failure_reason: "Terminated with errors.".to_string(),
            update_delay: 0,
            reorder_groups: false,
            forget_terminated: false,
        }
    }

    /// Statuses revealed by successive describes after a create.
    pub fn with_create_script(mut self, script: Vec<ClusterStatus>) -> Self {
        self.create_script = script;
        self
    }

    /// Statuses revealed by successive describes after a delete.
    pub fn with_delete_script(mut self, script: Vec<ClusterStatus>) -> Self {
        self.delete_script = script;
        self
    }

    /// Reason reported alongside `TERMINATED_WITH_ERRORS`.
    pub fn with_failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = reason.into();
        self
    }

    /// Make updates visible only on the n-th describe after they are issued.
    pub fn with_update_delay(mut self, describes: u32) -> Self {
        self.update_delay = describes;
        self
    }

    /// Report instance groups in reverse order on read.
    pub fn with_reordered_groups(mut self) -> Self {
        self.reorder_groups = true;
        self
    }

    /// Report terminated clusters as not found.
    pub fn forgetting_terminated(mut self) -> Self {
        self.forget_terminated = true;
        self
    }

    /// Fail the next call of the given kind with `error`.
    pub async fn fail_next(&self, kind: CallKind, error: ClientError) {
        self.inner.lock().await.faults.push_back((kind, error));
    }

    /// All calls received so far, in order.
    pub async fn calls(&self) -> Vec<Call> {
        self.inner.lock().await.calls.clone()
    }

    /// Calls of one kind received so far, in order.
    pub async fn calls_of(&self, kind: CallKind) -> Vec<Call> {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.kind() == kind)
            .cloned()
            .collect()
    }

    /// Updates received so far, in order.
    pub async fn updates(&self) -> Vec<AttributeUpdate> {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Update { update, .. } => Some(update.clone()),
                _ => None,
            })
            .collect()
    }

    /// Forget the recorded call log.
    pub async fn clear_calls(&self) {
        self.inner.lock().await.calls.clear();
    }

    /// Number of clusters the service knows about, in any status.
    pub async fn cluster_count(&self) -> usize {
        self.inner.lock().await.clusters.len()
    }

    /// Force a status change, as if it happened outside our control.
    pub async fn set_status(&self, id: &ClusterId, status: ClusterStatus, reason: Option<String>) {
        if let Some(cluster) = self.inner.lock().await.clusters.get_mut(id) {
            cluster.script.clear();
            cluster.state.status = status;
            cluster.state.status_reason = reason;
        }
    }

    /// Drop a cluster entirely, as if it were deleted out of band.
    pub async fn remove(&self, id: &ClusterId) {
        self.inner.lock().await.clusters.remove(id);
    }

    fn reveal(&self, cluster: &mut SimCluster) {
        if let Some(status) = cluster.script.pop_front() {
            cluster.state.status = status;
            cluster.state.status_reason = match status {
                ClusterStatus::TerminatedWithErrors => Some(self.failure_reason.clone()),
                ClusterStatus::Terminated => Some("Terminated by user request".to_string()),
                _ => None,
            };
        }

        let mut still_pending = Vec::new();
        for (remaining, update) in cluster.pending.drain(..) {
            if remaining <= 1 {
                apply_update(&mut cluster.state.attributes, &update);
            } else {
                still_pending.push((remaining - 1, update));
            }
        }
        cluster.pending = still_pending;
    }
}

impl Default for MockClusterClient {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_update(attributes: &mut ClusterSpec, update: &AttributeUpdate) {
    match update {
        AttributeUpdate::Tags { set, remove } => {
            for key in remove {
                attributes.tags.remove(key);
            }
            for (key, value) in set {
                attributes.tags.insert(key.clone(), value.clone());
            }
        }
        AttributeUpdate::InstanceGroupCounts { resizes } => {
            for resize in resizes {
                match &mut attributes.topology {
                    InstanceTopology::Fixed(fixed) => {
                        if resize.group.instance_type == fixed.core_instance_type {
                            fixed.core_instance_count = resize.to;
                        }
                    }
                    InstanceTopology::Groups(groups) => {
                        if let Some(group) = groups.iter_mut().find(|g| g.identity() == resize.group)
                        {
                            group.instance_count = resize.to;
                        }
                    }
                }
            }
        }
        AttributeUpdate::Visibility {
            visible_to_all_users,
        } => attributes.visible_to_all_users = *visible_to_all_users,
        AttributeUpdate::TerminationProtection { enabled } => {
            attributes.termination_protection = *enabled
        }
    }
}

#[async_trait]
impl ClusterClient for MockClusterClient {
    async fn create(&self, spec: &ClusterSpec) -> Result<ClusterId, ClientError> {
        let mut inner = self.inner.lock().await;
        inner.calls.push(Call::Create {
            name: spec.name.clone(),
        });
        inner.take_fault(CallKind::Create)?;

        let duplicate = inner
            .clusters
            .values()
            .any(|c| c.state.attributes.name == spec.name && !c.state.status.is_terminal());
        if duplicate {
            return Err(ClientError::new(
                ErrorKind::Conflict,
                "ClusterAlreadyExists",
                format!("a live cluster named {} already exists", spec.name),
            ));
        }

        inner.next_id += 1;
        let id = ClusterId::parse(&format!("j-{:013X}", inner.next_id))
            .map_err(|e| ClientError::new(ErrorKind::Fatal, "InternalFailure", e.to_string()))?;

        let mut attributes = spec.clone();
        attributes.depends_on.clear();

        let master_public_dns = format!("ip-10-0-0-{}.ec2.internal", inner.next_id % 250);

        info!(cluster_id = %id, name = %spec.name, "[MOCK] Creating cluster");

        inner.clusters.insert(
            id.clone(),
            SimCluster {
                state: ClusterState {
                    id: id.clone(),
                    status: ClusterStatus::Starting,
                    status_reason: None,
                    attributes,
                    master_public_dns: Some(master_public_dns),
                    observed_at: Utc::now(),
                },
                script: self.create_script.iter().copied().collect(),
                pending: Vec::new(),
            },
        );

        Ok(id)
    }

    async fn describe(&self, id: &ClusterId) -> Result<ClusterState, ClientError> {
        let mut inner = self.inner.lock().await;
        inner.calls.push(Call::Describe { id: id.clone() });
        inner.take_fault(CallKind::Describe)?;

        let Some(cluster) = inner.clusters.get_mut(id) else {
            return Err(ClientError::not_found(format!("cluster {id} does not exist")));
        };
        self.reveal(cluster);

        if self.forget_terminated && cluster.state.status.is_terminal() {
            inner.clusters.remove(id);
            return Err(ClientError::not_found(format!("cluster {id} does not exist")));
        }

        let mut state = cluster.state.clone();
        state.observed_at = Utc::now();
        if self.reorder_groups {
            if let InstanceTopology::Groups(groups) = &mut state.attributes.topology {
                groups.reverse();
            }
        }

        debug!(cluster_id = %id, status = %state.status, "[MOCK] Describing cluster");
        Ok(state)
    }

    async fn update(&self, id: &ClusterId, update: &AttributeUpdate) -> Result<(), ClientError> {
        let mut inner = self.inner.lock().await;
        inner.calls.push(Call::Update {
            id: id.clone(),
            update: update.clone(),
        });
        inner.take_fault(CallKind::Update)?;

        let Some(cluster) = inner.clusters.get_mut(id) else {
            return Err(ClientError::not_found(format!("cluster {id} does not exist")));
        };
        if cluster.state.status.is_terminal() {
            return Err(ClientError::new(
                ErrorKind::InvalidInput,
                "ValidationException",
                format!("cluster {id} is {}", cluster.state.status),
            ));
        }

        info!(cluster_id = %id, group = update.group_name(), "[MOCK] Updating cluster");
        if self.update_delay == 0 {
            apply_update(&mut cluster.state.attributes, update);
        } else {
            cluster.pending.push((self.update_delay, update.clone()));
        }
        Ok(())
    }

    async fn delete(&self, id: &ClusterId) -> Result<(), ClientError> {
        let mut inner = self.inner.lock().await;
        inner.calls.push(Call::Delete { id: id.clone() });
        inner.take_fault(CallKind::Delete)?;

        let Some(cluster) = inner.clusters.get_mut(id) else {
            return Err(ClientError::not_found(format!("cluster {id} does not exist")));
        };
        if cluster.state.status.is_terminal() {
            return Ok(());
        }
        if cluster.state.attributes.termination_protection {
            warn!(cluster_id = %id, "[MOCK] Ignoring termination of protected cluster");
            return Ok(());
        }

        info!(cluster_id = %id, "[MOCK] Terminating cluster");
        cluster.state.status = ClusterStatus::Terminating;
        cluster.script = self.delete_script.iter().copied().collect();
        Ok(())
    }
}
