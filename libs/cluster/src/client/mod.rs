//! Remote cluster service interface.
//!
//! The client abstracts the four calls the orchestrator makes against the
//! managed cluster service. Implementations must perform exactly the one
//! remote mutation requested: no implicit retries and no implicit polling.
//!
//! A mock implementation is provided for testing and development.

mod mock;

use std::collections::BTreeMap;

use async_trait::async_trait;
use cirrus_id::ClusterId;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::model::{ClusterSpec, ClusterState, GroupIdentity};

pub use mock::{Call, CallKind, MockClusterClient};

/// New instance count for one group, matched by identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupResize {
    pub group: GroupIdentity,
    pub from: u32,
    pub to: u32,
}

/// An in-place modification of one attribute group.
///
/// Only attribute groups the service can change without re-creating the
/// cluster are representable here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "group", rename_all = "snake_case")]
pub enum AttributeUpdate {
    Tags {
        set: BTreeMap<String, String>,
        remove: Vec<String>,
    },
    InstanceGroupCounts {
        resizes: Vec<GroupResize>,
    },
    Visibility {
        visible_to_all_users: bool,
    },
    TerminationProtection {
        enabled: bool,
    },
}

impl AttributeUpdate {
    /// Short name of the attribute group, for logs and call records.
    pub fn group_name(&self) -> &'static str {
        match self {
            Self::Tags { .. } => "tags",
            Self::InstanceGroupCounts { .. } => "instance_groups",
            Self::Visibility { .. } => "visibility",
            Self::TerminationProtection { .. } => "termination_protection",
        }
    }
}

/// Remote cluster service interface.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Request creation of a cluster. Returns as soon as the service has
    /// accepted the request and issued an id.
    async fn create(&self, spec: &ClusterSpec) -> Result<ClusterId, ClientError>;

    /// Read the full current state of a cluster.
    async fn describe(&self, id: &ClusterId) -> Result<ClusterState, ClientError>;

    /// Apply one in-place attribute update.
    async fn update(&self, id: &ClusterId, update: &AttributeUpdate) -> Result<(), ClientError>;

    /// Request termination of a cluster.
    async fn delete(&self, id: &ClusterId) -> Result<(), ClientError>;
}
