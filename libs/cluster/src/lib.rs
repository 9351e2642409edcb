//! Cluster lifecycle reconciliation.
//!
//! Converges a long-lived remote compute cluster toward a declared
//! [`ClusterSpec`] through four remote calls (create, describe, update,
//! delete):
//!
//! - **Client** ([`client`]): the remote service contract, with error
//!   classification and an in-memory [`MockClusterClient`]
//! - **Differ** ([`diff`]): computes an ordered [`ChangeSet`] between the
//!   last observed state and the spec
//! - **Poller** ([`poller`]): cluster-level waits with typed predicates
//! - **Orchestrator** ([`orchestrator`]): the create / update / replace /
//!   destroy state machine
//! - **Verifier** ([`verify`]): post-condition checks for drift and destroy
//! - **Store** ([`store`]): durable per-cluster records in SQLite
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cirrus_cluster::{
//!     ClusterSpec, FixedTopology, InstanceTopology, LifecycleOrchestrator, MockClusterClient,
//!     NetworkAttachment, ReconcilerConfig,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let client = Arc::new(MockClusterClient::new());
//! let mut orchestrator = LifecycleOrchestrator::new(client, ReconcilerConfig::from_env()?);
//!
//! let spec = ClusterSpec::new(
//!     "analytics",
//!     "emr-5.0.0",
//!     "EMR_DefaultRole",
//!     InstanceTopology::Fixed(FixedTopology {
//!         master_instance_type: "c4.large".into(),
//!         core_instance_type: "c4.large".into(),
//!         core_instance_count: 2,
//!     }),
//!     NetworkAttachment {
//!         subnet_id: "subnet-0a1b".into(),
//!         instance_profile: "EMR_EC2_DefaultRole".into(),
//!         ..Default::default()
//!     },
//! );
//!
//! let state = orchestrator.apply(&spec).await?;
//! orchestrator.destroy(&state.id).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod diff;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod poller;
pub mod store;
pub mod verify;

pub use client::{AttributeUpdate, ClusterClient, GroupResize, MockClusterClient};
pub use config::ReconcilerConfig;
pub use diff::{diff, AttributeGroup, Change, ChangeOperation, ChangeSet, Strategy, TagChange};
pub use error::{ClientError, ErrorKind, FailureKind, Operation, ReconcileError};
pub use model::{
    BootstrapAction, ClusterSpec, ClusterState, ClusterStatus, EbsConfig, FixedTopology,
    GroupIdentity, InstanceGroupSpec, InstanceRole, InstanceTopology, NetworkAttachment,
    ScaleDownBehavior, ValidationErrors, ValidationIssue,
};
pub use orchestrator::{LifecycleOrchestrator, Phase};
pub use poller::{ClusterPoller, ClusterPredicate, Observation};
pub use store::{ClusterRecord, StateStore, StateStoreError};
pub use verify::VerifyError;

pub use cirrus_id::ClusterId;
