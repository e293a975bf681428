//! Ownership tag convention
//!
//! The in-cluster cloud-controller-manager marks every AWS resource it creates
//! for a cluster with `kubernetes.io/cluster/<cluster-id>`. The tag value is
//! the resource lifecycle: `owned` means the cluster controls deletion,
//! `shared` means the resource is reused and must never be deleted.
//!
//! All functions here are pure and total: a missing key is simply "no claim".

use std::collections::BTreeMap;
use std::fmt;

/// Tag map of a cloud resource
pub type Tags = BTreeMap<String, String>;

/// Prefix of the per-cluster ownership key written by the cloud provider
pub const CLUSTER_TAG_PREFIX: &str = "kubernetes.io/cluster/";

/// Tag value marking a resource owned by the cluster
pub const LIFECYCLE_OWNED: &str = "owned";

/// Tag value marking a resource shared with other clusters or tooling
pub const LIFECYCLE_SHARED: &str = "shared";

/// Tag the cloud-controller-manager sets to the `namespace/name` of the Service
pub const SERVICE_NAME_TAG: &str = "kubernetes.io/service-name";

/// Tag EKS sets on the security groups it creates for a managed control plane
pub const EKS_CLUSTER_NAME_TAG: &str = "aws:eks:cluster-name";

/// Prefix of the tag CAPA sets on resources it provisioned itself
pub const CAPA_CLUSTER_TAG_PREFIX: &str = "sigs.k8s.io/cluster-api-provider-aws/cluster/";

/// Lifecycle value of an ownership tag
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceLifecycle {
    /// The cluster controls the resource's lifetime
    Owned,
    /// The resource is reused and must be left alone
    Shared,
    /// Any other value written by external tooling
    Other(String),
}

impl ResourceLifecycle {
    /// Parse a tag value. Matching is exact; `Owned` is not `owned`.
    pub fn parse(value: &str) -> Self {
        match value {
            LIFECYCLE_OWNED => Self::Owned,
            LIFECYCLE_SHARED => Self::Shared,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ResourceLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owned => f.write_str(LIFECYCLE_OWNED),
            Self::Shared => f.write_str(LIFECYCLE_SHARED),
            Self::Other(value) => f.write_str(value),
        }
    }
}

/// One cluster's ownership claim found on a resource
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterClaim {
    /// Cluster identifier taken from the tag key suffix
    pub cluster_id: String,
    /// Lifecycle taken from the tag value
    pub lifecycle: ResourceLifecycle,
}

/// Build the ownership tag key for a cluster
pub fn cluster_tag_key(cluster_id: &str) -> String {
    format!("{CLUSTER_TAG_PREFIX}{cluster_id}")
}

/// Build the tag key CAPA uses for resources it created for a cluster
pub fn capa_tag_key(cluster_id: &str) -> String {
    format!("{CAPA_CLUSTER_TAG_PREFIX}{cluster_id}")
}

/// All ownership claims carried by a tag map, in key order
pub fn cluster_claims(tags: &Tags) -> Vec<ClusterClaim> {
    tags.iter()
        .filter_map(|(key, value)| {
            let cluster_id = key.strip_prefix(CLUSTER_TAG_PREFIX)?;
            if cluster_id.is_empty() {
                return None;
            }
            Some(ClusterClaim {
                cluster_id: cluster_id.to_string(),
                lifecycle: ResourceLifecycle::parse(value),
            })
        })
        .collect()
}

/// Whether the tag map carries an ownership key for exactly this cluster
///
/// The lifecycle value is ignored; use [`is_owned`] for the ownership verdict.
pub fn is_tagged_for(tags: &Tags, cluster_id: &str) -> bool {
    !cluster_id.is_empty() && tags.contains_key(&cluster_tag_key(cluster_id))
}

/// Whether any ownership claim on the resource marks it as shared
pub fn is_shared(tags: &Tags) -> bool {
    cluster_claims(tags)
        .iter()
        .any(|claim| claim.lifecycle == ResourceLifecycle::Shared)
}

/// Whether the resource is owned by `cluster_id`
///
/// True iff the cluster's key is present with the `owned` value and no shared
/// marker exists anywhere on the resource.
pub fn is_owned(tags: &Tags, cluster_id: &str) -> bool {
    if cluster_id.is_empty() || is_shared(tags) {
        return false;
    }
    tags.get(&cluster_tag_key(cluster_id))
        .is_some_and(|value| value == LIFECYCLE_OWNED)
}
