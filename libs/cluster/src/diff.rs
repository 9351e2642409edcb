//! State differ: desired spec vs. last observed state.
//!
//! Attribute groups are compared independently:
//! - tags as sets of (key, value) pairs
//! - instance groups by (role, instance type) identity, never by position
//! - bootstrap actions as an ordered sequence
//!
//! A change to any group the service cannot modify in place forces a
//! `Replace` of the whole cluster. When a pass contains both replace-forcing
//! and in-place changes, the replace subsumes the updates and only the
//! replace reasons are reported.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::client::{AttributeUpdate, GroupResize};
use crate::model::{
    ClusterSpec, ClusterState, GroupIdentity, InstanceGroupSpec, InstanceRole, InstanceTopology,
};

/// Named subset of spec fields reconciled together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AttributeGroup {
    /// The cluster as a whole (first apply).
    Cluster,
    Name,
    ReleaseLabel,
    Applications,
    SecurityConfiguration,
    Network,
    IamRoles,
    /// Settings fixed at launch: logging, AMI, root volume, scale-down,
    /// keep-alive and application configuration.
    LaunchSettings,
    BootstrapActions,
    InstanceGroups,
    Tags,
    Visibility,
    TerminationProtection,
}

impl AttributeGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::Name => "name",
            Self::ReleaseLabel => "release_label",
            Self::Applications => "applications",
            Self::SecurityConfiguration => "security_configuration",
            Self::Network => "network",
            Self::IamRoles => "iam_roles",
            Self::LaunchSettings => "launch_settings",
            Self::BootstrapActions => "bootstrap_actions",
            Self::InstanceGroups => "instance_groups",
            Self::Tags => "tags",
            Self::Visibility => "visibility",
            Self::TerminationProtection => "termination_protection",
        }
    }

    /// Position in the in-place update sequence. Termination protection goes
    /// last: enabling it early and then being interrupted blocks deletes.
    fn update_rank(&self) -> u8 {
        match self {
            Self::Tags => 0,
            Self::InstanceGroups => 1,
            Self::Visibility => 2,
            Self::TerminationProtection => 3,
            _ => u8::MAX,
        }
    }
}

impl fmt::Display for AttributeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a change is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    Create,
    Replace,
    UpdateInPlace,
}

/// One tag-level difference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagChange {
    Added { key: String, value: String },
    Removed { key: String, value: String },
    Changed { key: String, old: String, new: String },
}

/// Old and new values of a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeDetail {
    /// No prior state exists.
    Create,
    /// A field that cannot change in place.
    Replace {
        field: String,
        old: String,
        new: String,
    },
    Tags(Vec<TagChange>),
    InstanceCounts(Vec<GroupResize>),
    Flag { old: bool, new: bool },
}

/// A single entry of a [`ChangeSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub group: AttributeGroup,
    pub detail: ChangeDetail,
}

impl Change {
    pub fn operation(&self) -> ChangeOperation {
        match self.detail {
            ChangeDetail::Create => ChangeOperation::Create,
            ChangeDetail::Replace { .. } => ChangeOperation::Replace,
            _ => ChangeOperation::UpdateInPlace,
        }
    }

    /// The remote update carrying out this change, for in-place changes.
    pub fn to_update(&self) -> Option<AttributeUpdate> {
        match (&self.group, &self.detail) {
            (AttributeGroup::Tags, ChangeDetail::Tags(changes)) => {
                let mut set = BTreeMap::new();
                let mut remove = Vec::new();
                for change in changes {
                    match change {
                        TagChange::Added { key, value } => {
                            set.insert(key.clone(), value.clone());
                        }
                        TagChange::Changed { key, new, .. } => {
                            set.insert(key.clone(), new.clone());
                        }
                        TagChange::Removed { key, .. } => remove.push(key.clone()),
                    }
                }
                Some(AttributeUpdate::Tags { set, remove })
            }
            (AttributeGroup::InstanceGroups, ChangeDetail::InstanceCounts(resizes)) => {
                Some(AttributeUpdate::InstanceGroupCounts {
                    resizes: resizes.clone(),
                })
            }
            (AttributeGroup::Visibility, ChangeDetail::Flag { new, .. }) => {
                Some(AttributeUpdate::Visibility {
                    visible_to_all_users: *new,
                })
            }
            (AttributeGroup::TerminationProtection, ChangeDetail::Flag { new, .. }) => {
                Some(AttributeUpdate::TerminationProtection { enabled: *new })
            }
            _ => None,
        }
    }
}

/// Overall strategy implied by a change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    NoOp,
    Create,
    Replace,
    UpdateInPlace,
}

/// Ordered set of changes produced by one diff. Consumed once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn strategy(&self) -> Strategy {
        let Some(first) = self.changes.first() else {
            return Strategy::NoOp;
        };
        match first.operation() {
            ChangeOperation::Create => Strategy::Create,
            ChangeOperation::Replace => Strategy::Replace,
            ChangeOperation::UpdateInPlace => Strategy::UpdateInPlace,
        }
    }

    pub fn requires_replace(&self) -> bool {
        self.strategy() == Strategy::Replace
    }

    /// Number of entries with the given operation.
    pub fn count(&self, operation: ChangeOperation) -> usize {
        self.changes
            .iter()
            .filter(|c| c.operation() == operation)
            .count()
    }

    pub fn get(&self, group: AttributeGroup) -> Option<&Change> {
        self.changes.iter().find(|c| c.group == group)
    }

    /// Tag-level differences, if tags changed.
    pub fn tag_changes(&self) -> &[TagChange] {
        match self.get(AttributeGroup::Tags).map(|c| &c.detail) {
            Some(ChangeDetail::Tags(changes)) => changes,
            _ => &[],
        }
    }

    /// Remote updates to issue, in application order. Empty unless the
    /// strategy is `UpdateInPlace`.
    pub fn updates(&self) -> Vec<AttributeUpdate> {
        if self.strategy() != Strategy::UpdateInPlace {
            return Vec::new();
        }
        self.changes.iter().filter_map(Change::to_update).collect()
    }

    /// Human-readable reasons for a replace.
    pub fn replace_reasons(&self) -> Vec<String> {
        self.changes
            .iter()
            .filter_map(|c| match &c.detail {
                ChangeDetail::Replace { field, .. } => Some(format!("{}.{}", c.group, field)),
                _ => None,
            })
            .collect()
    }
}

/// Compute the changes needed to move `previous` to `desired`.
pub fn diff(previous: Option<&ClusterState>, desired: &ClusterSpec) -> ChangeSet {
    let Some(previous) = previous else {
        return ChangeSet {
            changes: vec![Change {
                group: AttributeGroup::Cluster,
                detail: ChangeDetail::Create,
            }],
        };
    };

    let (replace, update) = compare(&previous.attributes, desired);
    if replace.is_empty() {
        ChangeSet { changes: update }
    } else {
        ChangeSet { changes: replace }
    }
}

/// Returns true while any in-place attribute group still differs, ignoring
/// replace-forcing differences.
pub fn has_pending_updates(observed: &ClusterSpec, desired: &ClusterSpec) -> bool {
    let (_, update) = compare(observed, desired);
    !update.is_empty()
}

fn compare(current: &ClusterSpec, desired: &ClusterSpec) -> (Vec<Change>, Vec<Change>) {
    let mut replace = Vec::new();
    let mut update = Vec::new();

    replace_if_changed(
        &mut replace,
        AttributeGroup::Name,
        "name",
        &current.name,
        &desired.name,
    );
    replace_if_changed(
        &mut replace,
        AttributeGroup::ReleaseLabel,
        "release_label",
        &current.release_label,
        &desired.release_label,
    );

    let current_apps = normalized_applications(&current.applications);
    let desired_apps = normalized_applications(&desired.applications);
    replace_if_changed(
        &mut replace,
        AttributeGroup::Applications,
        "applications",
        &current_apps,
        &desired_apps,
    );

    replace_if_changed(
        &mut replace,
        AttributeGroup::SecurityConfiguration,
        "security_configuration",
        &current.security_configuration,
        &desired.security_configuration,
    );

    let (cn, dn) = (&current.network, &desired.network);
    replace_if_changed(&mut replace, AttributeGroup::Network, "subnet_id", &cn.subnet_id, &dn.subnet_id);
    replace_if_changed(
        &mut replace,
        AttributeGroup::Network,
        "master_security_group",
        &cn.master_security_group,
        &dn.master_security_group,
    );
    replace_if_changed(
        &mut replace,
        AttributeGroup::Network,
        "slave_security_group",
        &cn.slave_security_group,
        &dn.slave_security_group,
    );
    replace_if_changed(
        &mut replace,
        AttributeGroup::Network,
        "service_access_security_group",
        &cn.service_access_security_group,
        &dn.service_access_security_group,
    );
    replace_if_changed(
        &mut replace,
        AttributeGroup::Network,
        "instance_profile",
        &cn.instance_profile,
        &dn.instance_profile,
    );

    replace_if_changed(
        &mut replace,
        AttributeGroup::IamRoles,
        "service_role",
        &current.service_role,
        &desired.service_role,
    );
    replace_if_changed(
        &mut replace,
        AttributeGroup::IamRoles,
        "autoscaling_role",
        &current.autoscaling_role,
        &desired.autoscaling_role,
    );

    let launch = AttributeGroup::LaunchSettings;
    replace_if_changed(&mut replace, launch, "log_uri", &current.log_uri, &desired.log_uri);
    replace_if_changed(
        &mut replace,
        launch,
        "custom_ami_id",
        &current.custom_ami_id,
        &desired.custom_ami_id,
    );
    replace_if_changed(
        &mut replace,
        launch,
        "ebs_root_volume_size",
        &current.ebs_root_volume_size,
        &desired.ebs_root_volume_size,
    );
    replace_if_changed(
        &mut replace,
        launch,
        "scale_down_behavior",
        &current.scale_down_behavior,
        &desired.scale_down_behavior,
    );
    replace_if_changed(
        &mut replace,
        launch,
        "keep_job_flow_alive_when_no_steps",
        &current.keep_job_flow_alive_when_no_steps,
        &desired.keep_job_flow_alive_when_no_steps,
    );
    replace_if_changed(
        &mut replace,
        launch,
        "configurations",
        &current.configurations,
        &desired.configurations,
    );

    // Bootstrap actions only run at creation: any reorder, insert or removal
    // needs a new cluster.
    if current.bootstrap_actions != desired.bootstrap_actions {
        let names = |actions: &[crate::model::BootstrapAction]| {
            actions.iter().map(|a| a.name.clone()).collect::<Vec<_>>()
        };
        replace.push(Change {
            group: AttributeGroup::BootstrapActions,
            detail: ChangeDetail::Replace {
                field: "sequence".to_string(),
                old: format!("{:?}", names(&current.bootstrap_actions)),
                new: format!("{:?}", names(&desired.bootstrap_actions)),
            },
        });
    }

    compare_topology(&mut replace, &mut update, &current.topology, &desired.topology);

    let tag_changes = diff_tags(&current.tags, &desired.tags);
    if !tag_changes.is_empty() {
        update.push(Change {
            group: AttributeGroup::Tags,
            detail: ChangeDetail::Tags(tag_changes),
        });
    }

    if current.visible_to_all_users != desired.visible_to_all_users {
        update.push(Change {
            group: AttributeGroup::Visibility,
            detail: ChangeDetail::Flag {
                old: current.visible_to_all_users,
                new: desired.visible_to_all_users,
            },
        });
    }

    if current.termination_protection != desired.termination_protection {
        update.push(Change {
            group: AttributeGroup::TerminationProtection,
            detail: ChangeDetail::Flag {
                old: current.termination_protection,
                new: desired.termination_protection,
            },
        });
    }

    update.sort_by_key(|c| c.group.update_rank());
    (replace, update)
}

fn replace_if_changed<T: PartialEq + fmt::Debug>(
    replace: &mut Vec<Change>,
    group: AttributeGroup,
    field: &str,
    old: &T,
    new: &T,
) {
    if old != new {
        replace.push(Change {
            group,
            detail: ChangeDetail::Replace {
                field: field.to_string(),
                old: format!("{old:?}"),
                new: format!("{new:?}"),
            },
        });
    }
}

/// Application names are case-insensitive and unordered.
fn normalized_applications(apps: &[String]) -> BTreeSet<String> {
    apps.iter().map(|a| a.to_ascii_lowercase()).collect()
}

/// Compare tag maps as sets of (key, value) pairs.
pub fn diff_tags(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> Vec<TagChange> {
    let mut changes = Vec::new();

    for (key, old_value) in old {
        match new.get(key) {
            None => changes.push(TagChange::Removed {
                key: key.clone(),
                value: old_value.clone(),
            }),
            Some(new_value) if new_value != old_value => changes.push(TagChange::Changed {
                key: key.clone(),
                old: old_value.clone(),
                new: new_value.clone(),
            }),
            Some(_) => {}
        }
    }

    for (key, value) in new {
        if !old.contains_key(key) {
            changes.push(TagChange::Added {
                key: key.clone(),
                value: value.clone(),
            });
        }
    }

    changes
}

fn compare_topology(
    replace: &mut Vec<Change>,
    update: &mut Vec<Change>,
    current: &InstanceTopology,
    desired: &InstanceTopology,
) {
    let group = AttributeGroup::InstanceGroups;

    match (current, desired) {
        (InstanceTopology::Fixed(cur), InstanceTopology::Fixed(des)) => {
            replace_if_changed(
                replace,
                group,
                "master_instance_type",
                &cur.master_instance_type,
                &des.master_instance_type,
            );
            replace_if_changed(
                replace,
                group,
                "core_instance_type",
                &cur.core_instance_type,
                &des.core_instance_type,
            );
            if cur.core_instance_type == des.core_instance_type
                && cur.core_instance_count != des.core_instance_count
            {
                update.push(Change {
                    group,
                    detail: ChangeDetail::InstanceCounts(vec![GroupResize {
                        group: GroupIdentity {
                            role: InstanceRole::Core,
                            instance_type: des.core_instance_type.clone(),
                        },
                        from: cur.core_instance_count,
                        to: des.core_instance_count,
                    }]),
                });
            }
        }
        (InstanceTopology::Groups(cur), InstanceTopology::Groups(des)) => {
            compare_groups(replace, update, cur, des);
        }
        (cur, des) => replace_if_changed(replace, group, "shape", &cur.shape(), &des.shape()),
    }
}

fn compare_groups(
    replace: &mut Vec<Change>,
    update: &mut Vec<Change>,
    current: &[InstanceGroupSpec],
    desired: &[InstanceGroupSpec],
) {
    let group = AttributeGroup::InstanceGroups;
    let cur = by_identity(current);
    let des = by_identity(desired);

    let cur_keys: Vec<String> = cur.keys().map(ToString::to_string).collect();
    let des_keys: Vec<String> = des.keys().map(ToString::to_string).collect();
    // Differing identities, or duplicates on the observed side.
    if cur_keys != des_keys || cur.len() != current.len() {
        replace.push(Change {
            group,
            detail: ChangeDetail::Replace {
                field: "membership".to_string(),
                old: format!("{:?}", identity_list(current)),
                new: format!("{:?}", identity_list(desired)),
            },
        });
        return;
    }

    let mut resizes = Vec::new();
    for (identity, wanted) in &des {
        let Some(observed) = cur.get(identity) else {
            continue;
        };
        let field = |name: &str| format!("{identity}.{name}");
        replace_if_changed(
            replace,
            group,
            &field("bid_price"),
            &observed.bid_price,
            &wanted.bid_price,
        );
        replace_if_changed(
            replace,
            group,
            &field("ebs_config"),
            &observed.ebs_config,
            &wanted.ebs_config,
        );
        replace_if_changed(
            replace,
            group,
            &field("autoscaling_policy"),
            &observed.autoscaling_policy,
            &wanted.autoscaling_policy,
        );
        if observed.instance_count != wanted.instance_count {
            resizes.push(GroupResize {
                group: identity.clone(),
                from: observed.instance_count,
                to: wanted.instance_count,
            });
        }
    }

    if !resizes.is_empty() {
        update.push(Change {
            group,
            detail: ChangeDetail::InstanceCounts(resizes),
        });
    }
}

fn by_identity(groups: &[InstanceGroupSpec]) -> BTreeMap<GroupIdentity, &InstanceGroupSpec> {
    groups.iter().map(|g| (g.identity(), g)).collect()
}

fn identity_list(groups: &[InstanceGroupSpec]) -> Vec<String> {
    groups.iter().map(|g| g.identity().to_string()).collect()
}
