//! Lifecycle orchestrator: drives one cluster through create, update,
//! replace and destroy.
//!
//! ```text
//! Pending → Creating → AwaitingReady → Ready
//! Ready → Updating → AwaitingReady → Ready
//! Ready → Deleting → AwaitingGone → Destroyed (→ Creating on replace)
//! any → Failed
//! ```
//!
//! Every remote mutation is issued at most once per pass. Transient read
//! failures are retried only inside poller waits, bounded by the wait's
//! deadline. A pass always ends in `Ready`, `Destroyed` or `Failed`.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cirrus_id::{ClusterId, ReconcileId};
use cirrus_reconcile::{unmet_dependencies, CancelSignal, WaitError};
use tracing::{debug, info, instrument, warn, Span};

use crate::client::{AttributeUpdate, ClusterClient};
use crate::config::ReconcilerConfig;
use crate::diff::{diff, ChangeSet};
use crate::error::{ClientError, FailureKind, Operation, ReconcileError};
use crate::model::{ClusterSpec, ClusterState, ClusterStatus};
use crate::poller::{ClusterPoller, ClusterPredicate, Observation};

/// Lifecycle phase of the managed cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Pending,
    Creating,
    AwaitingReady,
    Ready,
    Updating,
    Deleting,
    AwaitingGone,
    Destroyed,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::AwaitingReady => "awaiting_ready",
            Self::Ready => "ready",
            Self::Updating => "updating",
            Self::Deleting => "deleting",
            Self::AwaitingGone => "awaiting_gone",
            Self::Destroyed => "destroyed",
            Self::Failed => "failed",
        }
    }

    /// Phases a pass may end in.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Ready | Self::Destroyed | Self::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconciles a single cluster. Owns the cluster's last observed state.
pub struct LifecycleOrchestrator {
    client: Arc<dyn ClusterClient>,
    poller: ClusterPoller,
    config: ReconcilerConfig,
    cancel: CancelSignal,
    phase: Phase,
    history: Vec<Phase>,
    state: Option<ClusterState>,
    pass: ReconcileId,
}

impl LifecycleOrchestrator {
    pub fn new(client: Arc<dyn ClusterClient>, config: ReconcilerConfig) -> Self {
        let poller = ClusterPoller::new(Arc::clone(&client), config.poller());
        Self {
            client,
            poller,
            config,
            cancel: CancelSignal::never(),
            phase: Phase::Pending,
            history: vec![Phase::Pending],
            state: None,
            pass: ReconcileId::new(),
        }
    }

    /// Abort waits (and any not yet issued mutation) when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Seed from a persisted record, as if the cluster had been created by
    /// an earlier pass.
    pub fn adopt(&mut self, state: ClusterState) {
        let phase = if state.status.is_terminal() {
            Phase::Destroyed
        } else {
            Phase::Ready
        };
        info!(cluster_id = %state.id, status = %state.status, phase = %phase, "Adopted cluster");
        self.state = (phase == Phase::Ready).then_some(state);
        self.phase = phase;
        self.history = vec![phase];
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Phases visited by the most recent pass, starting with the phase it
    /// began in.
    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    /// Last observed state of the managed cluster.
    pub fn state(&self) -> Option<&ClusterState> {
        self.state.as_ref()
    }

    pub fn cluster_id(&self) -> Option<&ClusterId> {
        self.state.as_ref().map(|s| &s.id)
    }

    /// Id of the most recent pass.
    pub fn reconcile_id(&self) -> ReconcileId {
        self.pass
    }

    /// Converge the remote cluster toward `spec`.
    #[instrument(skip(self, spec), fields(cluster = %spec.name, reconcile_id = tracing::field::Empty))]
    pub async fn apply(&mut self, spec: &ClusterSpec) -> Result<ClusterState, ReconcileError> {
        self.begin_pass();

        if let Err(issues) = spec.validate() {
            return Err(self.fail(FailureKind::InvalidInput(issues), Operation::Validate, None));
        }

        let Some(known) = self.state.clone() else {
            return self.create(spec).await;
        };

        let current = match self.refresh(&known.id).await? {
            Some(state) if state.status.is_terminal() => {
                info!(
                    cluster_id = %state.id,
                    status = %state.status,
                    "Cluster terminated outside reconciliation, recreating"
                );
                self.state = None;
                return self.create(spec).await;
            }
            Some(state) => state,
            None => {
                let error = ClientError::not_found(format!("cluster {} no longer exists", known.id));
                return Err(self.fail(
                    FailureKind::Remote(error),
                    Operation::Refresh,
                    Some(known.id),
                ));
            }
        };

        let current = match current.status {
            ClusterStatus::Terminating => {
                self.transition(Phase::AwaitingGone);
                self.await_gone(&current.id).await?;
                self.transition(Phase::Destroyed);
                self.state = None;
                return self.create(spec).await;
            }
            status if !status.is_ready() => {
                self.transition(Phase::AwaitingReady);
                self.await_ready(&current.id).await?
            }
            _ => current,
        };

        let changes = diff(Some(&current), spec);
        if changes.is_empty() {
            debug!(cluster_id = %current.id, "No changes");
            if self.phase != Phase::Ready {
                self.transition(Phase::Ready);
            }
            return Ok(current);
        }
        if !changes.requires_replace() {
            return self.update(&current, spec, &changes).await;
        }

        info!(
            cluster_id = %current.id,
            reasons = ?changes.replace_reasons(),
            "Replacing cluster"
        );
        self.teardown(current).await?;
        self.create(spec).await
    }

    /// Like [`apply`](Self::apply), but fails without any remote call unless
    /// every id in `spec.depends_on` is in `completed`.
    pub async fn apply_after(
        &mut self,
        spec: &ClusterSpec,
        completed: &BTreeSet<String>,
    ) -> Result<ClusterState, ReconcileError> {
        let pending = unmet_dependencies(&spec.depends_on, completed);
        if pending.is_empty() {
            return self.apply(spec).await;
        }

        self.begin_pass();
        info!(cluster = %spec.name, pending = ?pending, "Dependencies not complete");
        let cluster_id = self.cluster_id().cloned();
        Err(self.fail(
            FailureKind::DependenciesPending(pending),
            Operation::CheckDependencies,
            cluster_id,
        ))
    }

    /// Terminate cluster `id`. A cluster that is already gone counts as
    /// destroyed.
    #[instrument(skip(self, id), fields(cluster_id = %id, reconcile_id = tracing::field::Empty))]
    pub async fn destroy(&mut self, id: &ClusterId) -> Result<(), ReconcileError> {
        self.begin_pass();

        match self.refresh(id).await? {
            Some(state) if !state.status.is_terminal() => self.teardown(state).await,
            Some(state) => {
                debug!(status = %state.status, "Cluster already terminated");
                self.finish_destroyed();
                Ok(())
            }
            None => {
                debug!("Cluster already gone");
                self.finish_destroyed();
                Ok(())
            }
        }
    }

    fn begin_pass(&mut self) {
        self.pass = ReconcileId::new();
        Span::current().record("reconcile_id", tracing::field::display(&self.pass));
        self.phase = if self.state.is_some() {
            Phase::Ready
        } else {
            Phase::Pending
        };
        self.history = vec![self.phase];
    }

    fn transition(&mut self, next: Phase) {
        debug!(from = %self.phase, to = %next, "Phase transition");
        self.phase = next;
        self.history.push(next);
    }

    fn finish_destroyed(&mut self) {
        self.state = None;
        self.transition(Phase::Destroyed);
    }

    fn fail(
        &mut self,
        kind: FailureKind,
        operation: Operation,
        cluster_id: Option<ClusterId>,
    ) -> ReconcileError {
        self.fail_with_state(kind, operation, cluster_id, None)
    }

    fn fail_with_state(
        &mut self,
        kind: FailureKind,
        operation: Operation,
        cluster_id: Option<ClusterId>,
        observed: Option<ClusterState>,
    ) -> ReconcileError {
        if let Some(state) = observed {
            self.state = Some(state);
        }
        self.transition(Phase::Failed);
        warn!(
            operation = %operation,
            cluster_id = cluster_id.as_ref().map(|id| id.as_str()),
            error = %kind,
            "Reconciliation failed"
        );
        ReconcileError {
            kind,
            operation,
            cluster_id,
            last_state: self.state.clone().map(Box::new),
            reconcile_id: self.pass,
        }
    }

    fn wait_failed(
        &mut self,
        error: WaitError<Observation, ClientError>,
        operation: Operation,
        id: &ClusterId,
    ) -> ReconcileError {
        let (kind, last) = match error {
            WaitError::Timeout {
                elapsed,
                reads,
                last,
            } => (FailureKind::Timeout { elapsed, reads }, last),
            WaitError::Cancelled { last } => (FailureKind::Cancelled, last),
            WaitError::Failed { error, last } => (FailureKind::Remote(error), last),
        };
        let observed = last.and_then(Observation::into_state);
        self.fail_with_state(kind, operation, Some(id.clone()), observed)
    }

    fn check_cancelled(
        &mut self,
        operation: Operation,
        id: Option<&ClusterId>,
    ) -> Result<(), ReconcileError> {
        if self.cancel.is_cancelled() {
            return Err(self.fail(FailureKind::Cancelled, operation, id.cloned()));
        }
        Ok(())
    }

    async fn wait(
        &mut self,
        id: &ClusterId,
        predicate: &ClusterPredicate,
        timeout: Duration,
        operation: Operation,
    ) -> Result<Observation, ReconcileError> {
        let result = self
            .poller
            .wait_for(id, predicate, timeout, &mut self.cancel)
            .await;
        match result {
            Ok(outcome) => {
                debug!(
                    cluster_id = %id,
                    predicate = predicate.name(),
                    reads = outcome.reads,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "Wait complete"
                );
                Ok(outcome.value)
            }
            Err(error) => Err(self.wait_failed(error, operation, id)),
        }
    }

    /// Read the current state, retrying transient failures. `None` when the
    /// cluster no longer exists.
    async fn refresh(&mut self, id: &ClusterId) -> Result<Option<ClusterState>, ReconcileError> {
        let observation = self
            .wait(
                id,
                &ClusterPredicate::Observed,
                self.config.update_timeout,
                Operation::Refresh,
            )
            .await?;
        let state = observation.into_state();
        if let Some(state) = &state {
            self.state = Some(state.clone());
        }
        Ok(state)
    }

    /// Wait for `id` to accept work. A terminal status is a failure.
    async fn await_ready(&mut self, id: &ClusterId) -> Result<ClusterState, ReconcileError> {
        let observation = self
            .wait(
                id,
                &ClusterPredicate::ready(),
                self.config.create_timeout,
                Operation::AwaitReady,
            )
            .await?;
        self.settle_ready(id, observation, Operation::AwaitReady)
    }

    fn settle_ready(
        &mut self,
        id: &ClusterId,
        observation: Observation,
        operation: Operation,
    ) -> Result<ClusterState, ReconcileError> {
        let Some(state) = observation.into_state() else {
            let error = ClientError::not_found(format!("cluster {id} disappeared"));
            return Err(self.fail(FailureKind::Remote(error), operation, Some(id.clone())));
        };

        if state.status.is_terminal() {
            let kind = FailureKind::RemoteTerminalFailure {
                status: state.status,
                reason: state.status_reason.clone(),
            };
            return Err(self.fail_with_state(kind, operation, Some(id.clone()), Some(state)));
        }

        self.state = Some(state.clone());
        self.transition(Phase::Ready);
        Ok(state)
    }

    async fn create(&mut self, spec: &ClusterSpec) -> Result<ClusterState, ReconcileError> {
        self.check_cancelled(Operation::Create, None)?;
        self.transition(Phase::Creating);

        let id = match self.client.create(spec).await {
            Ok(id) => id,
            Err(error) => {
                return Err(self.fail(FailureKind::Remote(error), Operation::Create, None));
            }
        };
        info!(cluster_id = %id, "Cluster creation started");

        self.transition(Phase::AwaitingReady);
        let state = self.await_ready(&id).await?;
        info!(
            cluster_id = %id,
            master_public_dns = state.master_public_dns.as_deref(),
            "Cluster ready"
        );
        Ok(state)
    }

    async fn update(
        &mut self,
        current: &ClusterState,
        spec: &ClusterSpec,
        changes: &ChangeSet,
    ) -> Result<ClusterState, ReconcileError> {
        let id = current.id.clone();
        self.check_cancelled(Operation::Update, Some(&id))?;
        self.transition(Phase::Updating);

        for update in changes.updates() {
            self.check_cancelled(Operation::Update, Some(&id))?;
            info!(cluster_id = %id, group = update.group_name(), "Updating attribute group");
            if let Err(error) = self.client.update(&id, &update).await {
                return Err(self.fail(FailureKind::Remote(error), Operation::Update, Some(id)));
            }
        }

        self.transition(Phase::AwaitingReady);
        let observation = self
            .wait(
                &id,
                &ClusterPredicate::converged(spec),
                self.config.update_timeout,
                Operation::Update,
            )
            .await?;
        self.settle_ready(&id, observation, Operation::Update)
    }

    /// Clear termination protection if needed, delete, and wait until gone.
    async fn teardown(&mut self, current: ClusterState) -> Result<(), ReconcileError> {
        let id = current.id.clone();
        self.check_cancelled(Operation::Delete, Some(&id))?;
        self.transition(Phase::Deleting);

        if current.attributes.termination_protection {
            info!(cluster_id = %id, "Clearing termination protection before delete");
            let clear = AttributeUpdate::TerminationProtection { enabled: false };
            match self.client.update(&id, &clear).await {
                Ok(()) => {}
                Err(error) if error.is_not_found() => {
                    self.finish_destroyed();
                    return Ok(());
                }
                Err(error) => {
                    return Err(self.fail(
                        FailureKind::Remote(error),
                        Operation::ClearTerminationProtection,
                        Some(id),
                    ));
                }
            }

            let observation = self
                .wait(
                    &id,
                    &ClusterPredicate::protection_cleared(),
                    self.config.update_timeout,
                    Operation::ClearTerminationProtection,
                )
                .await?;
            match observation.state() {
                Some(state) if !state.status.is_terminal() => {
                    self.state = Some(state.clone());
                }
                _ => {
                    self.finish_destroyed();
                    return Ok(());
                }
            }
            self.check_cancelled(Operation::Delete, Some(&id))?;
        }

        match self.client.delete(&id).await {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {
                debug!(cluster_id = %id, "Cluster vanished before delete");
                self.finish_destroyed();
                return Ok(());
            }
            Err(error) => {
                return Err(self.fail(FailureKind::Remote(error), Operation::Delete, Some(id)));
            }
        }

        self.transition(Phase::AwaitingGone);
        self.await_gone(&id).await?;
        info!(cluster_id = %id, "Cluster destroyed");
        self.finish_destroyed();
        Ok(())
    }

    async fn await_gone(&mut self, id: &ClusterId) -> Result<(), ReconcileError> {
        let observation = self
            .wait(
                id,
                &ClusterPredicate::gone(),
                self.config.delete_timeout,
                Operation::AwaitGone,
            )
            .await?;
        if let Some(state) = observation.state() {
            if state.status.is_terminal_failure() {
                warn!(
                    cluster_id = %id,
                    reason = state.status_reason.as_deref(),
                    "Cluster terminated with errors"
                );
            }
        }
        Ok(())
    }
}
