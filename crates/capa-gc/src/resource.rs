//! Tracked cloud resources and ARN parsing

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tags::Tags;
use crate::tasks::GcTaskKind;

/// How a resource came to be a GC candidate
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoverySource {
    /// Found by a live, paginated API scan
    Poll,
    /// Found in the inventory built from lifecycle events
    Event,
}

/// A candidate resource observed by discovery
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedResource {
    /// Which GC task the resource belongs to
    pub kind: GcTaskKind,
    /// ARN of the resource
    pub provider_id: String,
    /// Tags as last observed
    pub tags: Tags,
    /// Provider IDs of resources this one points at: target groups a load
    /// balancer forwards to, security groups it attaches, groups referenced by
    /// a security group's rules
    #[serde(default)]
    pub references: BTreeSet<String>,
    /// Strategy that produced the observation
    pub discovered_via: DiscoverySource,
    /// When discovery first observed the resource
    pub first_seen_at: DateTime<Utc>,
}

impl TrackedResource {
    /// Create a resource observed now
    pub fn new(
        kind: GcTaskKind,
        provider_id: impl Into<String>,
        tags: Tags,
        discovered_via: DiscoverySource,
    ) -> Self {
        Self {
            kind,
            provider_id: provider_id.into(),
            tags,
            references: BTreeSet::new(),
            discovered_via,
            first_seen_at: Utc::now(),
        }
    }

    /// Attach the provider IDs this resource references
    pub fn with_references<I, S>(mut self, references: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.references = references.into_iter().map(Into::into).collect();
        self
    }

    /// Parsed ARN, when the provider ID is one
    pub fn arn(&self) -> Option<ResourceArn> {
        ResourceArn::parse(&self.provider_id)
    }
}

/// Flavor of an Elastic Load Balancing load balancer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadBalancerFlavor {
    /// Classic ELB, addressed by name
    Classic,
    /// Application load balancer (ELBv2)
    Application,
    /// Network load balancer (ELBv2)
    Network,
    /// Gateway load balancer (ELBv2)
    Gateway,
}

/// A parsed Amazon Resource Name
///
/// `arn:<partition>:<service>:<region>:<account>:<resource>`; the resource
/// part may itself contain `:` and `/`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceArn {
    /// Partition, usually `aws`
    pub partition: String,
    /// Service namespace, e.g. `elasticloadbalancing` or `ec2`
    pub service: String,
    /// Region code
    pub region: String,
    /// Owning account ID
    pub account: String,
    /// Resource type and identifier
    pub resource: String,
}

const ELB_SERVICE: &str = "elasticloadbalancing";
const EC2_SERVICE: &str = "ec2";
const LOAD_BALANCER_PREFIX: &str = "loadbalancer/";
const TARGET_GROUP_PREFIX: &str = "targetgroup/";
const SECURITY_GROUP_PREFIX: &str = "security-group/";

impl ResourceArn {
    /// Parse an ARN; returns `None` for anything that is not one
    pub fn parse(arn: &str) -> Option<Self> {
        let mut parts = arn.splitn(6, ':');
        if parts.next()? != "arn" {
            return None;
        }
        let partition = parts.next()?;
        let service = parts.next()?;
        let region = parts.next()?;
        let account = parts.next()?;
        let resource = parts.next()?;
        if partition.is_empty() || service.is_empty() || resource.is_empty() {
            return None;
        }
        Some(Self {
            partition: partition.to_string(),
            service: service.to_string(),
            region: region.to_string(),
            account: account.to_string(),
            resource: resource.to_string(),
        })
    }

    /// GC task the resource falls under, or `None` for unhandled types
    pub fn kind(&self) -> Option<GcTaskKind> {
        match self.service.as_str() {
            ELB_SERVICE if self.resource.starts_with(LOAD_BALANCER_PREFIX) => {
                Some(GcTaskKind::LoadBalancer)
            }
            ELB_SERVICE if self.resource.starts_with(TARGET_GROUP_PREFIX) => {
                Some(GcTaskKind::TargetGroup)
            }
            EC2_SERVICE if self.resource.starts_with(SECURITY_GROUP_PREFIX) => {
                Some(GcTaskKind::SecurityGroup)
            }
            _ => None,
        }
    }

    /// Load balancer flavor, for load balancer ARNs only
    pub fn load_balancer_flavor(&self) -> Option<LoadBalancerFlavor> {
        if self.kind() != Some(GcTaskKind::LoadBalancer) {
            return None;
        }
        let rest = &self.resource[LOAD_BALANCER_PREFIX.len()..];
        Some(if rest.starts_with("app/") {
            LoadBalancerFlavor::Application
        } else if rest.starts_with("net/") {
            LoadBalancerFlavor::Network
        } else if rest.starts_with("gwy/") {
            LoadBalancerFlavor::Gateway
        } else {
            LoadBalancerFlavor::Classic
        })
    }

    /// Short identifier: group ID, target group `name/hash`, or the load
    /// balancer name for classic ELBs
    pub fn resource_id(&self) -> &str {
        [LOAD_BALANCER_PREFIX, TARGET_GROUP_PREFIX, SECURITY_GROUP_PREFIX]
            .iter()
            .find_map(|prefix| self.resource.strip_prefix(prefix))
            .unwrap_or(&self.resource)
    }
}

impl fmt::Display for ResourceArn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "arn:{}:{}:{}:{}:{}",
            self.partition, self.service, self.region, self.account, self.resource
        )
    }
}
