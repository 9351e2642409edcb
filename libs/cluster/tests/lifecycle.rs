//! Integration tests for the apply lifecycle: create, no-op, in-place update
//! and replace, driven against the mock cluster service under paused time.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cirrus_cluster::client::{Call, CallKind};
use cirrus_cluster::verify::{verify_bootstrap_order, verify_matches};
use cirrus_cluster::{
    AttributeUpdate, ClientError, ClusterClient, ClusterStatus, ErrorKind, FailureKind,
    InstanceTopology, MockClusterClient, Operation, Phase,
};
use cirrus_reconcile::{cancellation, CancelSignal, Poller, WaitError};
use common::{bootstrap_actions, groups_spec, orchestrator, test_config, test_spec};
use rstest::rstest;

#[tokio::test(start_paused = true)]
async fn test_create_then_reapply_is_noop() {
    let mock = Arc::new(MockClusterClient::new());
    let mut orch = orchestrator(&mock);
    let spec = test_spec("emr-noop");

    let created = orch.apply(&spec).await.unwrap();
    assert_eq!(created.status, ClusterStatus::Waiting);
    assert_eq!(orch.phase(), Phase::Ready);

    mock.clear_calls().await;
    let again = orch.apply(&spec).await.unwrap();
    assert_eq!(again.id, created.id);
    assert_eq!(orch.history(), &[Phase::Ready]);

    let calls = mock.calls().await;
    assert!(calls.iter().all(|c| !c.is_mutation()), "calls: {calls:?}");
    assert_eq!(mock.calls_of(CallKind::Describe).await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_order_preserved() {
    let mock = Arc::new(MockClusterClient::new());
    let mut orch = orchestrator(&mock);
    let mut spec = test_spec("emr-bootstrap");
    spec.bootstrap_actions = bootstrap_actions();

    let state = orch.apply(&spec).await.unwrap();
    verify_bootstrap_order(&state, &bootstrap_actions()).unwrap();

    let reread = mock.describe(&state.id).await.unwrap();
    let names: Vec<_> = reread
        .attributes
        .bootstrap_actions
        .iter()
        .map(|a| a.name.as_str())
        .collect();
    assert_eq!(names, vec!["runif", "test", "configure"]);
}

#[tokio::test(start_paused = true)]
async fn test_termination_protection_toggle() {
    let mock = Arc::new(MockClusterClient::new().with_update_delay(2));
    let mut orch = orchestrator(&mock);
    let mut spec = test_spec("emr-protect");
    orch.apply(&spec).await.unwrap();

    for enabled in [true, false, true] {
        spec.termination_protection = enabled;
        let state = orch.apply(&spec).await.unwrap();
        assert_eq!(state.attributes.termination_protection, enabled);
        assert_eq!(
            orch.history(),
            &[
                Phase::Ready,
                Phase::Updating,
                Phase::AwaitingReady,
                Phase::Ready
            ]
        );
    }

    let updates = mock.updates().await;
    assert_eq!(
        updates,
        vec![
            AttributeUpdate::TerminationProtection { enabled: true },
            AttributeUpdate::TerminationProtection { enabled: false },
            AttributeUpdate::TerminationProtection { enabled: true },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_tag_change_updates_in_place() {
    let mock = Arc::new(MockClusterClient::new());
    let mut orch = orchestrator(&mock);
    let mut spec = test_spec("emr-tags");
    let state = orch.apply(&spec).await.unwrap();

    spec.tags.remove("role");
    spec.tags.insert("zone".to_string(), "z".to_string());
    let updated = orch.apply(&spec).await.unwrap();
    assert_eq!(updated.id, state.id);
    assert_eq!(updated.attributes.tags, spec.tags);

    let updates = mock.updates().await;
    assert_eq!(updates.len(), 1);
    match &updates[0] {
        AttributeUpdate::Tags { set, remove } => {
            assert_eq!(set.len(), 1);
            assert_eq!(set.get("zone").map(String::as_str), Some("z"));
            assert_eq!(remove, &vec!["role".to_string()]);
        }
        other => panic!("unexpected update: {other:?}"),
    }
    assert!(mock.calls_of(CallKind::Delete).await.is_empty());
    verify_matches(mock.as_ref(), &state.id, &spec).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_updates_issued_in_fixed_order() {
    let mock = Arc::new(MockClusterClient::new());
    let mut orch = orchestrator(&mock);
    let mut spec = groups_spec("emr-order");
    orch.apply(&spec).await.unwrap();

    spec.termination_protection = true;
    spec.visible_to_all_users = false;
    spec.tags.insert("owner".to_string(), "data".to_string());
    if let InstanceTopology::Groups(groups) = &mut spec.topology {
        groups[1].instance_count = 5;
    }
    orch.apply(&spec).await.unwrap();

    let order: Vec<_> = mock
        .updates()
        .await
        .iter()
        .map(|u| u.group_name())
        .collect();
    assert_eq!(
        order,
        vec!["tags", "instance_groups", "visibility", "termination_protection"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_release_label_change_replaces() {
    let mock = Arc::new(MockClusterClient::new());
    let mut orch = orchestrator(&mock);
    let mut spec = test_spec("emr-replace");
    let original = orch.apply(&spec).await.unwrap();

    spec.release_label = "emr-5.0.0".to_string();
    spec.tags.insert("zone".to_string(), "z".to_string());
    spec.visible_to_all_users = false;
    let replaced = orch.apply(&spec).await.unwrap();

    assert_ne!(replaced.id, original.id);
    assert_eq!(replaced.attributes.release_label, "emr-5.0.0");
    assert_eq!(
        orch.history(),
        &[
            Phase::Ready,
            Phase::Deleting,
            Phase::AwaitingGone,
            Phase::Destroyed,
            Phase::Creating,
            Phase::AwaitingReady,
            Phase::Ready,
        ]
    );
    assert!(mock.updates().await.is_empty());
    assert_eq!(mock.calls_of(CallKind::Delete).await.len(), 1);
    assert_eq!(mock.calls_of(CallKind::Create).await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_replace_of_protected_cluster_clears_protection_first() {
    let mock = Arc::new(MockClusterClient::new());
    let mut orch = orchestrator(&mock);
    let mut spec = test_spec("emr-replace-protected");
    spec.termination_protection = true;
    orch.apply(&spec).await.unwrap();

    spec.release_label = "emr-5.0.0".to_string();
    let replaced = orch.apply(&spec).await.unwrap();
    assert!(replaced.attributes.termination_protection);

    let mutations: Vec<_> = mock
        .calls()
        .await
        .into_iter()
        .filter(Call::is_mutation)
        .map(|c| c.kind())
        .collect();
    assert_eq!(
        mutations,
        vec![
            CallKind::Create,
            CallKind::Update,
            CallKind::Delete,
            CallKind::Create
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_group_reordering_on_read_is_not_a_change() {
    let mock = Arc::new(MockClusterClient::new().with_reordered_groups());
    let mut orch = orchestrator(&mock);
    let spec = groups_spec("emr-reorder");
    orch.apply(&spec).await.unwrap();

    mock.clear_calls().await;
    orch.apply(&spec).await.unwrap();
    assert!(mock.calls().await.iter().all(|c| !c.is_mutation()));
}

#[tokio::test(start_paused = true)]
async fn test_poller_reads_until_waiting() {
    let mock = Arc::new(MockClusterClient::new().with_create_script(vec![
        ClusterStatus::Starting,
        ClusterStatus::Bootstrapping,
        ClusterStatus::Waiting,
    ]));
    let id = mock.create(&test_spec("emr-poll")).await.unwrap();
    let poller = Poller::new(Duration::from_secs(600), Duration::from_secs(10));

    let outcome = poller
        .wait_for(
            "cluster",
            || mock.describe(&id),
            |state| state.status == ClusterStatus::Waiting,
            &mut CancelSignal::never(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.reads, 3);
    assert_eq!(outcome.elapsed, Duration::from_secs(20));
}

#[tokio::test(start_paused = true)]
async fn test_poller_times_out_when_never_ready() {
    let mock = Arc::new(MockClusterClient::new().with_create_script(vec![
        ClusterStatus::Starting,
        ClusterStatus::Bootstrapping,
    ]));
    let id = mock.create(&test_spec("emr-stuck")).await.unwrap();
    let poller = Poller::new(Duration::from_secs(60), Duration::from_secs(10));

    let err = poller
        .wait_for(
            "cluster",
            || mock.describe(&id),
            |state| state.status == ClusterStatus::Waiting,
            &mut CancelSignal::never(),
        )
        .await
        .unwrap_err();
    match err {
        WaitError::Timeout { elapsed, last, .. } => {
            assert_eq!(elapsed, Duration::from_secs(60));
            assert_eq!(last.map(|s| s.status), Some(ClusterStatus::Bootstrapping));
        }
        other => panic!("expected timeout, got {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_create_timeout_carries_last_state() {
    let mock = Arc::new(
        MockClusterClient::new()
            .with_create_script(vec![ClusterStatus::Starting, ClusterStatus::Bootstrapping]),
    );
    let mut orch = orchestrator(&mock);

    let err = orch.apply(&test_spec("emr-slow")).await.unwrap_err();
    assert_eq!(err.operation, Operation::AwaitReady);
    assert!(matches!(err.kind, FailureKind::Timeout { .. }));
    assert_eq!(
        err.last_state().map(|s| s.status),
        Some(ClusterStatus::Bootstrapping)
    );
    assert!(err.cluster_id.is_some());
    assert_eq!(orch.phase(), Phase::Failed);
}

#[rstest]
#[case::empty_service_role("service_role")]
#[case::empty_subnet("network.subnet_id")]
#[case::no_master_group("topology.groups")]
#[tokio::test(start_paused = true)]
async fn test_invalid_spec_makes_no_remote_calls(#[case] field: &str) {
    let mock = Arc::new(MockClusterClient::new());
    let mut orch = orchestrator(&mock);
    let mut spec = groups_spec("emr-invalid");
    match field {
        "service_role" => spec.service_role = " ".to_string(),
        "network.subnet_id" => spec.network.subnet_id.clear(),
        _ => {
            if let InstanceTopology::Groups(groups) = &mut spec.topology {
                groups.remove(0);
            }
        }
    }

    let err = orch.apply(&spec).await.unwrap_err();
    match &err.kind {
        FailureKind::InvalidInput(issues) => assert!(issues.mentions(field), "{issues}"),
        other => panic!("expected invalid input, got {other}"),
    }
    assert_eq!(err.operation, Operation::Validate);
    assert!(mock.calls().await.is_empty());
    assert_eq!(orch.history(), &[Phase::Pending, Phase::Failed]);
}

#[tokio::test(start_paused = true)]
async fn test_create_conflict_is_not_retried() {
    let mock = Arc::new(MockClusterClient::new());
    let mut first = orchestrator(&mock);
    let mut second = orchestrator(&mock);
    let spec = test_spec("emr-duplicate");

    first.apply(&spec).await.unwrap();
    let err = second.apply(&spec).await.unwrap_err();

    assert!(err.kind.is_conflict());
    assert_eq!(err.operation, Operation::Create);
    assert!(err.cluster_id.is_none());
    assert_eq!(mock.calls_of(CallKind::Create).await.len(), 2);
    assert_eq!(mock.cluster_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_failure_during_create() {
    let mock = Arc::new(
        MockClusterClient::new()
            .with_create_script(vec![
                ClusterStatus::Starting,
                ClusterStatus::Bootstrapping,
                ClusterStatus::TerminatedWithErrors,
            ])
            .with_failure_reason("bootstrap action 2 returned a non-zero return code"),
    );
    let mut orch = orchestrator(&mock);

    let err = orch.apply(&test_spec("emr-broken")).await.unwrap_err();
    assert_eq!(
        err.kind,
        FailureKind::RemoteTerminalFailure {
            status: ClusterStatus::TerminatedWithErrors,
            reason: Some("bootstrap action 2 returned a non-zero return code".to_string()),
        }
    );
    assert_eq!(
        err.last_state().map(|s| s.status),
        Some(ClusterStatus::TerminatedWithErrors)
    );
    assert_eq!(mock.calls_of(CallKind::Create).await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_describe_errors_are_retried() {
    let mock = Arc::new(MockClusterClient::new());
    for _ in 0..2 {
        mock.fail_next(
            CallKind::Describe,
            ClientError::from_remote("ThrottlingException", Some(400), "Rate exceeded"),
        )
        .await;
    }
    let mut orch = orchestrator(&mock);

    let state = orch.apply(&test_spec("emr-throttled")).await.unwrap();
    assert_eq!(state.status, ClusterStatus::Waiting);
    assert_eq!(mock.calls_of(CallKind::Describe).await.len(), 6);
    assert_eq!(mock.calls_of(CallKind::Create).await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retries_do_not_extend_deadline() {
    let mock = Arc::new(MockClusterClient::new());
    for _ in 0..50 {
        mock.fail_next(
            CallKind::Describe,
            ClientError::new(ErrorKind::Transient, "ServiceUnavailable", "try again"),
        )
        .await;
    }
    let mut config = test_config();
    config.create_timeout = Duration::from_secs(25);
    let mut orch = cirrus_cluster::LifecycleOrchestrator::new(mock.clone(), config);

    let started = tokio::time::Instant::now();
    let err = orch.apply(&test_spec("emr-unavailable")).await.unwrap_err();
    match err.kind {
        FailureKind::Timeout { elapsed, .. } => assert!(elapsed <= Duration::from_secs(25)),
        other => panic!("expected timeout, got {other}"),
    }
    assert!(started.elapsed() <= Duration::from_secs(25));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_remote_calls() {
    let mock = Arc::new(MockClusterClient::new().with_create_script(vec![ClusterStatus::Starting]));
    let (handle, signal) = cancellation();
    let mut orch = orchestrator(&mock).with_cancel(signal);

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(15)).await;
        handle.cancel();
        handle
    });

    let err = orch.apply(&test_spec("emr-cancel")).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::Cancelled);
    assert_eq!(err.operation, Operation::AwaitReady);
    let handle = canceller.await.unwrap();

    let calls = mock.calls().await.len();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(mock.calls().await.len(), calls);

    // A later pass on the same orchestrator stays cancelled.
    let err = orch.apply(&test_spec("emr-cancel")).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::Cancelled);
    drop(handle);
}

#[tokio::test(start_paused = true)]
async fn test_cluster_terminated_out_of_band_is_recreated() {
    let mock = Arc::new(MockClusterClient::new());
    let mut orch = orchestrator(&mock);
    let spec = test_spec("emr-recreate");
    let first = orch.apply(&spec).await.unwrap();

    mock.set_status(
        &first.id,
        ClusterStatus::Terminated,
        Some("Terminated by user request".to_string()),
    )
    .await;
    let second = orch.apply(&spec).await.unwrap();
    assert_ne!(second.id, first.id);
    assert_eq!(second.status, ClusterStatus::Waiting);
}

#[tokio::test(start_paused = true)]
async fn test_cluster_missing_on_refresh_fails() {
    let mock = Arc::new(MockClusterClient::new());
    let mut orch = orchestrator(&mock);
    let spec = test_spec("emr-vanished");
    let state = orch.apply(&spec).await.unwrap();

    mock.remove(&state.id).await;
    let err = orch.apply(&spec).await.unwrap_err();
    assert!(err.kind.is_not_found());
    assert_eq!(err.operation, Operation::Refresh);
    assert_eq!(err.cluster_id.as_ref(), Some(&state.id));
    assert!(mock.calls_of(CallKind::Create).await.len() == 1);
}

#[tokio::test(start_paused = true)]
async fn test_update_failure_is_not_retried() {
    let mock = Arc::new(MockClusterClient::new());
    let mut orch = orchestrator(&mock);
    let mut spec = test_spec("emr-update-fails");
    orch.apply(&spec).await.unwrap();

    mock.fail_next(
        CallKind::Update,
        ClientError::from_remote("InternalFailure", Some(500), "boom"),
    )
    .await;
    spec.visible_to_all_users = false;
    let err = orch.apply(&spec).await.unwrap_err();
    assert_eq!(err.operation, Operation::Update);
    assert_eq!(err.kind.error_kind(), Some(ErrorKind::Transient));
    assert_eq!(mock.calls_of(CallKind::Update).await.len(), 1);
    assert!(err.last_state().is_some());
}
