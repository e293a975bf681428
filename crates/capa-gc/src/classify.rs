//! Ownership classification
//!
//! Decides, from tags alone, whether a discovered resource may be deleted on
//! behalf of a cluster. Only [`Ownership::Owned`] resources ever reach the
//! deleter. [`Ownership::Ambiguous`] is a policy outcome: the resource is left
//! alone and reported so an operator can resolve it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::resource::TrackedResource;
use crate::tags::{self, ResourceLifecycle};
use crate::tasks::GcTaskKind;

/// Why a resource is not a deletion candidate for the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotOwnedReason {
    /// No ownership key for this cluster
    NoClusterTag,
    /// Provisioned by CAPA itself and torn down through its own reconcilers
    ManagedByCapa,
    /// Load balancer or target group not created for a Service
    NotServiceResource,
    /// Security group created by EKS for the managed control plane
    CreatedByEks,
}

impl NotOwnedReason {
    /// Stable reason code
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoClusterTag => "no-cluster-tag",
            Self::ManagedByCapa => "managed-by-capa",
            Self::NotServiceResource => "not-service-resource",
            Self::CreatedByEks => "created-by-eks",
        }
    }
}

/// Why ownership could not be decided
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AmbiguousReason {
    /// A `shared` lifecycle marker is present
    SharedMarker,
    /// More than one cluster claims the resource
    MultipleClusters,
    /// The cluster's ownership key carries a value other than owned/shared
    UnknownLifecycle(String),
}

impl AmbiguousReason {
    /// Stable reason code
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SharedMarker => "shared-marker",
            Self::MultipleClusters => "multiple-clusters",
            Self::UnknownLifecycle(_) => "unknown-lifecycle",
        }
    }
}

impl fmt::Display for AmbiguousReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownLifecycle(value) => write!(f, "{}({value})", self.as_str()),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Classification verdict
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// Safe to delete on behalf of the cluster
    Owned,
    /// Not this cluster's to delete
    NotOwned(NotOwnedReason),
    /// Claimed by the cluster, but not exclusively
    Ambiguous(AmbiguousReason),
}

/// Classify a resource for `cluster_id`
///
/// Checks run in this order:
/// 1. no claim for the cluster ⇒ not owned
/// 2. CAPA, EKS and non-Service exclusions ⇒ not owned
/// 3. any shared marker, a second cluster claim, or an unrecognised
///    lifecycle ⇒ ambiguous
/// 4. otherwise owned
pub fn classify(resource: &TrackedResource, cluster_id: &str) -> Ownership {
    let resource_tags = &resource.tags;
    if !tags::is_tagged_for(resource_tags, cluster_id) {
        return Ownership::NotOwned(NotOwnedReason::NoClusterTag);
    }

    if let Some(reason) = exclusion(resource) {
        return Ownership::NotOwned(reason);
    }

    let claims = tags::cluster_claims(resource_tags);
    if claims
        .iter()
        .any(|claim| claim.lifecycle == ResourceLifecycle::Shared)
    {
        return Ownership::Ambiguous(AmbiguousReason::SharedMarker);
    }
    if claims.iter().any(|claim| claim.cluster_id != cluster_id) {
        return Ownership::Ambiguous(AmbiguousReason::MultipleClusters);
    }

    match claims
        .into_iter()
        .find(|claim| claim.cluster_id == cluster_id)
        .map(|claim| claim.lifecycle)
    {
        Some(ResourceLifecycle::Owned) => Ownership::Owned,
        Some(ResourceLifecycle::Other(value)) => {
            Ownership::Ambiguous(AmbiguousReason::UnknownLifecycle(value))
        }
        // shared was handled above; a missing claim was handled first
        Some(ResourceLifecycle::Shared) | None => {
            Ownership::Ambiguous(AmbiguousReason::SharedMarker)
        }
    }
}

fn exclusion(resource: &TrackedResource) -> Option<NotOwnedReason> {
    let resource_tags = &resource.tags;
    if resource_tags
        .keys()
        .any(|key| key.starts_with(tags::CAPA_CLUSTER_TAG_PREFIX))
    {
        return Some(NotOwnedReason::ManagedByCapa);
    }
    match resource.kind {
        GcTaskKind::LoadBalancer | GcTaskKind::TargetGroup
            if !resource_tags.contains_key(tags::SERVICE_NAME_TAG) =>
        {
            Some(NotOwnedReason::NotServiceResource)
        }
        GcTaskKind::SecurityGroup if resource_tags.contains_key(tags::EKS_CLUSTER_NAME_TAG) => {
            Some(NotOwnedReason::CreatedByEks)
        }
        _ => None,
    }
}

/// Candidates split by verdict
#[derive(Clone, Debug, Default)]
pub struct Classified {
    /// Resources cleared for deletion
    pub owned: Vec<TrackedResource>,
    /// Resources set aside, with the reason
    pub ambiguous: Vec<(TrackedResource, AmbiguousReason)>,
    /// Resources dropped as not belonging to the cluster
    pub not_owned: Vec<(TrackedResource, NotOwnedReason)>,
}

/// Classify every candidate
pub fn partition<I>(resources: I, cluster_id: &str) -> Classified
where
    I: IntoIterator<Item = TrackedResource>,
{
    let mut classified = Classified::default();
    for resource in resources {
        match classify(&resource, cluster_id) {
            Ownership::Owned => classified.owned.push(resource),
            Ownership::Ambiguous(reason) => classified.ambiguous.push((resource, reason)),
            Ownership::NotOwned(reason) => classified.not_owned.push((resource, reason)),
        }
    }
    classified
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::DiscoverySource;
    use crate::tags::Tags;
    use rstest::rstest;

    fn resource(kind: GcTaskKind, pairs: &[(&str, &str)]) -> TrackedResource {
        let tags: Tags = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TrackedResource::new(kind, "arn:aws:ec2:us-east-1:1:security-group/sg-1", tags, DiscoverySource::Poll)
    }

    const SVC: (&str, &str) = ("kubernetes.io/service-name", "default/web");

    #[test]
    fn owned_service_load_balancer() {
        let r = resource(
            GcTaskKind::LoadBalancer,
            &[("kubernetes.io/cluster/foo", "owned"), SVC],
        );
        assert_eq!(classify(&r, "foo"), Ownership::Owned);
    }

    #[test]
    fn shared_security_group_is_ambiguous() {
        let r = resource(
            GcTaskKind::SecurityGroup,
            &[("kubernetes.io/cluster/foo", "shared")],
        );
        assert_eq!(
            classify(&r, "foo"),
            Ownership::Ambiguous(AmbiguousReason::SharedMarker)
        );
    }

    #[rstest]
    #[case(&[("kubernetes.io/cluster/foo", "owned"), ("kubernetes.io/cluster/bar", "shared")], AmbiguousReason::SharedMarker)]
    #[case(&[("kubernetes.io/cluster/foo", "owned"), ("kubernetes.io/cluster/bar", "owned")], AmbiguousReason::MultipleClusters)]
    #[case(&[("kubernetes.io/cluster/foo", "Owned")], AmbiguousReason::UnknownLifecycle("Owned".into()))]
    #[case(&[("kubernetes.io/cluster/foo", "")], AmbiguousReason::UnknownLifecycle(String::new()))]
    fn ambiguous_security_groups(#[case] pairs: &[(&str, &str)], #[case] reason: AmbiguousReason) {
        let r = resource(GcTaskKind::SecurityGroup, pairs);
        assert_eq!(classify(&r, "foo"), Ownership::Ambiguous(reason));
    }

    #[rstest]
    #[case(GcTaskKind::SecurityGroup, &[("kubernetes.io/cluster/foo-bar", "owned")], NotOwnedReason::NoClusterTag)]
    #[case(GcTaskKind::SecurityGroup, &[], NotOwnedReason::NoClusterTag)]
    #[case(GcTaskKind::LoadBalancer, &[("kubernetes.io/cluster/foo", "owned")], NotOwnedReason::NotServiceResource)]
    #[case(GcTaskKind::TargetGroup, &[("kubernetes.io/cluster/foo", "owned")], NotOwnedReason::NotServiceResource)]
    #[case(
        GcTaskKind::SecurityGroup,
        &[("kubernetes.io/cluster/foo", "owned"), ("aws:eks:cluster-name", "foo")],
        NotOwnedReason::CreatedByEks
    )]
    #[case(
        GcTaskKind::SecurityGroup,
        &[("kubernetes.io/cluster/foo", "shared"), ("sigs.k8s.io/cluster-api-provider-aws/cluster/foo", "owned")],
        NotOwnedReason::ManagedByCapa
    )]
    fn not_owned(
        #[case] kind: GcTaskKind,
        #[case] pairs: &[(&str, &str)],
        #[case] reason: NotOwnedReason,
    ) {
        let r = resource(kind, pairs);
        assert_eq!(classify(&r, "foo"), Ownership::NotOwned(reason));
    }

    #[test]
    fn partition_splits_by_verdict() {
        let classified = partition(
            vec![
                resource(GcTaskKind::SecurityGroup, &[("kubernetes.io/cluster/foo", "owned")]),
                resource(GcTaskKind::SecurityGroup, &[("kubernetes.io/cluster/foo", "shared")]),
                resource(GcTaskKind::SecurityGroup, &[("kubernetes.io/cluster/bar", "owned")]),
            ],
            "foo",
        );
        assert_eq!(classified.owned.len(), 1);
        assert_eq!(classified.ambiguous.len(), 1);
        assert_eq!(classified.not_owned.len(), 1);
    }

    #[test]
    fn reason_codes_are_stable() {
        assert_eq!(
            AmbiguousReason::UnknownLifecycle("x".into()).to_string(),
            "unknown-lifecycle(x)"
        );
        assert_eq!(NotOwnedReason::CreatedByEks.as_str(), "created-by-eks");
    }
}
