//! Desired and observed cluster state.
//!
//! [`ClusterSpec`] is the desired state handed to the orchestrator by an
//! external configuration layer. [`ClusterState`] is the observed state as
//! last reported by the remote service; it mirrors the spec's attributes and
//! adds the remote id and lifecycle status.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cirrus_id::ClusterId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Instance topology
// =============================================================================

/// Role of an instance group within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceRole {
    Master,
    Core,
    Task,
}

impl InstanceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "MASTER",
            Self::Core => "CORE",
            Self::Task => "TASK",
        }
    }
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// EBS volumes attached to each instance of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EbsConfig {
    pub size_gb: u32,
    pub volume_type: String,
    pub volumes_per_instance: u32,
}

/// Identity of an instance group for diffing: remote APIs may reorder groups
/// on read, so groups are matched by role and type, never by position.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupIdentity {
    pub role: InstanceRole,
    pub instance_type: String,
}

impl fmt::Display for GroupIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.role, self.instance_type)
    }
}

/// One heterogeneous instance group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceGroupSpec {
    pub role: InstanceRole,
    pub instance_type: String,
    pub instance_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid_price: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ebs_config: Vec<EbsConfig>,
    /// Autoscaling policy document, passed through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaling_policy: Option<String>,
}

impl InstanceGroupSpec {
    pub fn new(role: InstanceRole, instance_type: impl Into<String>, instance_count: u32) -> Self {
        Self {
            role,
            instance_type: instance_type.into(),
            instance_count,
            bid_price: None,
            ebs_config: Vec::new(),
            autoscaling_policy: None,
        }
    }

    pub fn identity(&self) -> GroupIdentity {
        GroupIdentity {
            role: self.role,
            instance_type: self.instance_type.clone(),
        }
    }
}

/// A single master plus a homogeneous core fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedTopology {
    pub master_instance_type: String,
    pub core_instance_type: String,
    pub core_instance_count: u32,
}

/// Instance layout: exactly one of the two shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", content = "spec", rename_all = "snake_case")]
pub enum InstanceTopology {
    Fixed(FixedTopology),
    Groups(Vec<InstanceGroupSpec>),
}

impl InstanceTopology {
    pub fn shape(&self) -> &'static str {
        match self {
            Self::Fixed(_) => "fixed",
            Self::Groups(_) => "groups",
        }
    }

    /// Instance count per group identity.
    pub fn instance_counts(&self) -> BTreeMap<GroupIdentity, u32> {
        match self {
            Self::Fixed(fixed) => {
                let mut counts = BTreeMap::new();
                counts.insert(
                    GroupIdentity {
                        role: InstanceRole::Master,
                        instance_type: fixed.master_instance_type.clone(),
                    },
                    1,
                );
                counts.insert(
                    GroupIdentity {
                        role: InstanceRole::Core,
                        instance_type: fixed.core_instance_type.clone(),
                    },
                    fixed.core_instance_count,
                );
                counts
            }
            Self::Groups(groups) => groups
                .iter()
                .map(|g| (g.identity(), g.instance_count))
                .collect(),
        }
    }
}

// =============================================================================
// Other attribute groups
// =============================================================================

/// A script run on every node at creation time. Order is execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapAction {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl BootstrapAction {
    pub fn new<I, S>(name: impl Into<String>, path: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            path: path.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Network placement, referencing identifiers from the network and identity
/// providers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    pub subnet_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_security_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slave_security_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_access_security_group: Option<String>,
    pub instance_profile: String,
}

/// How instances are removed on scale-down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScaleDownBehavior {
    TerminateAtInstanceHour,
    TerminateAtTaskCompletion,
}

// =============================================================================
// ClusterSpec
// =============================================================================

/// Desired state of a cluster. Immutable within one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub name: String,
    pub release_label: String,
    #[serde(default)]
    pub applications: Vec<String>,
    pub topology: InstanceTopology,
    #[serde(default)]
    pub bootstrap_actions: Vec<BootstrapAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_configuration: Option<String>,
    pub service_role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaling_role: Option<String>,
    pub network: NetworkAttachment,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub termination_protection: bool,
    #[serde(default = "default_visible")]
    pub visible_to_all_users: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_ami_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ebs_root_volume_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_behavior: Option<ScaleDownBehavior>,
    #[serde(default = "default_keep_alive")]
    pub keep_job_flow_alive_when_no_steps: bool,
    /// Reference to an application configuration document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configurations: Option<String>,
    /// Ids of resources that must be complete before this cluster is created.
    /// Local only; never sent to or reported by the remote service.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

fn default_visible() -> bool {
    true
}

fn default_keep_alive() -> bool {
    true
}

impl ClusterSpec {
    /// Create a spec with the required fields; everything else takes the
    /// service defaults.
    pub fn new(
        name: impl Into<String>,
        release_label: impl Into<String>,
        service_role: impl Into<String>,
        topology: InstanceTopology,
        network: NetworkAttachment,
    ) -> Self {
        Self {
            name: name.into(),
            release_label: release_label.into(),
            applications: Vec::new(),
            topology,
            bootstrap_actions: Vec::new(),
            security_configuration: None,
            service_role: service_role.into(),
            autoscaling_role: None,
            network,
            tags: BTreeMap::new(),
            termination_protection: false,
            visible_to_all_users: true,
            log_uri: None,
            custom_ami_id: None,
            ebs_root_volume_size: None,
            scale_down_behavior: None,
            keep_job_flow_alive_when_no_steps: true,
            configurations: None,
            depends_on: Vec::new(),
        }
    }

    /// Check local invariants. Never touches the remote service.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut issues = Vec::new();

        require_non_empty(&mut issues, "name", &self.name);
        require_non_empty(&mut issues, "release_label", &self.release_label);
        require_non_empty(&mut issues, "service_role", &self.service_role);
        require_non_empty(&mut issues, "network.subnet_id", &self.network.subnet_id);
        require_non_empty(
            &mut issues,
            "network.instance_profile",
            &self.network.instance_profile,
        );

        match &self.topology {
            InstanceTopology::Fixed(fixed) => {
                require_non_empty(
                    &mut issues,
                    "topology.master_instance_type",
                    &fixed.master_instance_type,
                );
                require_non_empty(
                    &mut issues,
                    "topology.core_instance_type",
                    &fixed.core_instance_type,
                );
                if fixed.core_instance_count == 0 {
                    issues.push(ValidationIssue::new(
                        "topology.core_instance_count",
                        "must be at least 1",
                    ));
                }
            }
            InstanceTopology::Groups(groups) => validate_groups(&mut issues, groups),
        }

        let mut names = BTreeSet::new();
        for (i, action) in self.bootstrap_actions.iter().enumerate() {
            let field = format!("bootstrap_actions[{i}]");
            require_non_empty(&mut issues, &format!("{field}.name"), &action.name);
            require_non_empty(&mut issues, &format!("{field}.path"), &action.path);
            if !action.name.is_empty() && !names.insert(action.name.as_str()) {
                issues.push(ValidationIssue::new(
                    format!("{field}.name"),
                    format!("duplicate bootstrap action name {:?}", action.name),
                ));
            }
        }

        if self.tags.keys().any(|k| k.is_empty()) {
            issues.push(ValidationIssue::new("tags", "tag keys must not be empty"));
        }

        if self.ebs_root_volume_size == Some(0) {
            issues.push(ValidationIssue::new(
                "ebs_root_volume_size",
                "must be greater than 0",
            ));
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(issues))
        }
    }
}

fn validate_groups(issues: &mut Vec<ValidationIssue>, groups: &[InstanceGroupSpec]) {
    let masters = groups
        .iter()
        .filter(|g| g.role == InstanceRole::Master)
        .count();
    if masters != 1 {
        issues.push(ValidationIssue::new(
            "topology.groups",
            format!("exactly one MASTER group required, found {masters}"),
        ));
    }

    let mut seen = BTreeSet::new();
    for (i, group) in groups.iter().enumerate() {
        let field = format!("topology.groups[{i}]");
        require_non_empty(issues, &format!("{field}.instance_type"), &group.instance_type);
        if group.instance_count == 0 {
            issues.push(ValidationIssue::new(
                format!("{field}.instance_count"),
                "must be at least 1",
            ));
        }
        if !seen.insert(group.identity()) {
            issues.push(ValidationIssue::new(
                field,
                format!("duplicate instance group {}", group.identity()),
            ));
        }
    }
}

fn require_non_empty(issues: &mut Vec<ValidationIssue>, field: &str, value: &str) {
    if value.trim().is_empty() {
        issues.push(ValidationIssue::new(field, "must not be empty"));
    }
}

/// A single local validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every local validation failure found in a spec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid cluster spec: {}", render_issues(.0))]
pub struct ValidationErrors(pub Vec<ValidationIssue>);

impl ValidationErrors {
    pub fn issues(&self) -> &[ValidationIssue] {
        &self.0
    }

    /// Returns true if any issue concerns the given field (or a sub-field).
    pub fn mentions(&self, field: &str) -> bool {
        self.0.iter().any(|i| i.field.starts_with(field))
    }
}

fn render_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// =============================================================================
// Observed state
// =============================================================================

/// Remote lifecycle status of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Starting,
    Bootstrapping,
    Running,
    Waiting,
    Terminating,
    Terminated,
    TerminatedWithErrors,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Bootstrapping => "BOOTSTRAPPING",
            Self::Running => "RUNNING",
            Self::Waiting => "WAITING",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
            Self::TerminatedWithErrors => "TERMINATED_WITH_ERRORS",
        }
    }

    /// Ready and idle: terminal success for keep-alive clusters.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Waiting)
    }

    /// No further transitions will happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::TerminatedWithErrors)
    }

    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::TerminatedWithErrors)
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTING" => Ok(Self::Starting),
            "BOOTSTRAPPING" => Ok(Self::Bootstrapping),
            "RUNNING" => Ok(Self::Running),
            "WAITING" => Ok(Self::Waiting),
            "TERMINATING" => Ok(Self::Terminating),
            "TERMINATED" => Ok(Self::Terminated),
            "TERMINATED_WITH_ERRORS" => Ok(Self::TerminatedWithErrors),
            other => Err(format!("unknown cluster status {other:?}")),
        }
    }
}

/// Observed state of a cluster as last reported by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    pub id: ClusterId,
    pub status: ClusterStatus,
    /// Remote explanation of the latest status change, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    /// Attributes as reported by the service, in spec form.
    pub attributes: ClusterSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_public_dns: Option<String>,
    pub observed_at: DateTime<Utc>,
}
