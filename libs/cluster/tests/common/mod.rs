//! Shared fixtures for cluster integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use cirrus_cluster::{
    BootstrapAction, ClusterSpec, FixedTopology, InstanceGroupSpec, InstanceRole,
    InstanceTopology, LifecycleOrchestrator, MockClusterClient, NetworkAttachment,
    ReconcilerConfig,
};
use cirrus_reconcile::BackoffPolicy;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING: Once = Once::new();

/// Install a test subscriber once per binary, filtered by the test config's
/// log level unless `RUST_LOG` is set.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = test_config()
            .env_filter()
            .unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

pub fn test_config() -> ReconcilerConfig {
    ReconcilerConfig {
        create_timeout: Duration::from_secs(600),
        update_timeout: Duration::from_secs(300),
        delete_timeout: Duration::from_secs(300),
        poll_interval: Duration::from_secs(10),
        backoff: BackoffPolicy::fixed_ratio(Duration::from_secs(1), Duration::from_secs(30)),
        log_level: "debug".to_string(),
    }
}

pub fn network() -> NetworkAttachment {
    NetworkAttachment {
        subnet_id: "subnet-0a1b2c".to_string(),
        master_security_group: Some("sg-allow-all".to_string()),
        slave_security_group: Some("sg-allow-all".to_string()),
        service_access_security_group: None,
        instance_profile: "arn:aws:iam::123456789012:instance-profile/emr_profile".to_string(),
    }
}

/// A fixed-shape cluster with the tags used throughout the tests.
pub fn test_spec(name: &str) -> ClusterSpec {
    let mut spec = ClusterSpec::new(
        name,
        "emr-4.6.0",
        "arn:aws:iam::123456789012:role/iam_emr_default_role",
        InstanceTopology::Fixed(FixedTopology {
            master_instance_type: "c4.large".to_string(),
            core_instance_type: "c4.large".to_string(),
            core_instance_count: 1,
        }),
        network(),
    );
    spec.applications = vec!["Spark".to_string()];
    spec.tags.insert("role".to_string(), "rolename".to_string());
    spec.tags.insert("env".to_string(), "env".to_string());
    spec
}

/// A cluster described by explicit instance groups.
pub fn groups_spec(name: &str) -> ClusterSpec {
    let mut spec = test_spec(name);
    spec.topology = InstanceTopology::Groups(vec![
        InstanceGroupSpec::new(InstanceRole::Master, "c4.large", 1),
        InstanceGroupSpec::new(InstanceRole::Core, "c4.large", 2),
        InstanceGroupSpec::new(InstanceRole::Task, "m4.large", 2),
    ]);
    spec
}

pub fn bootstrap_actions() -> Vec<BootstrapAction> {
    vec![
        BootstrapAction::new(
            "runif",
            "s3://elasticmapreduce/bootstrap-actions/run-if",
            ["instance.isMaster=true", "echo running on master node"],
        ),
        BootstrapAction::new(
            "test",
            "s3://test-bucket/testscript.sh",
            ["1", "2", "3", "4", "5", "6", "7", "8", "9", "10"],
        ),
        BootstrapAction::new(
            "configure",
            "s3://test-bucket/configure.sh",
            Vec::<String>::new(),
        ),
    ]
}

pub fn orchestrator(mock: &Arc<MockClusterClient>) -> LifecycleOrchestrator {
    init_tracing();
    LifecycleOrchestrator::new(mock.clone(), test_config())
}
