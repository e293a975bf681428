//! GC task registry
//!
//! A cluster selects which kinds of externally created resources are garbage
//! collected through a comma-separated annotation on its infrastructure
//! object. Parsing fails closed: one unknown token rejects the whole value so
//! a typo can never silently narrow (or widen) what gets deleted.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Annotation listing the enabled GC tasks for a cluster
pub const GC_TASKS_ANNOTATION: &str = "aws.cluster.x-k8s.io/external-resource-tasks-gc";

/// Annotation switching GC on or off for a cluster (`"false"` opts out)
pub const GC_ENABLED_ANNOTATION: &str = "aws.cluster.x-k8s.io/external-resource-gc";

/// One category of resource eligible for tag-based discovery and deletion
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GcTaskKind {
    /// Classic, application and network load balancers
    LoadBalancer,
    /// ELBv2 target groups
    TargetGroup,
    /// EC2 security groups
    SecurityGroup,
}

impl GcTaskKind {
    /// Every kind, in deletion-relevant order
    pub const ALL: [GcTaskKind; 3] = [Self::LoadBalancer, Self::TargetGroup, Self::SecurityGroup];

    /// Annotation spelling of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoadBalancer => "load-balancer",
            Self::TargetGroup => "target-group",
            Self::SecurityGroup => "security-group",
        }
    }
}

impl fmt::Display for GcTaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GcTaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::validation(format!("unknown GC task {s:?}")))
    }
}

/// Set of enabled task kinds for one reconcile
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GcTaskSet(BTreeSet<GcTaskKind>);

impl GcTaskSet {
    /// Every kind enabled
    pub fn all() -> Self {
        Self(GcTaskKind::ALL.into_iter().collect())
    }

    /// Nothing enabled; GC is off for the cluster
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the kind is enabled
    pub fn contains(&self, kind: GcTaskKind) -> bool {
        self.0.contains(&kind)
    }

    /// Whether no kind is enabled
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of enabled kinds
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Enabled kinds in a stable order
    pub fn iter(&self) -> impl Iterator<Item = GcTaskKind> + '_ {
        self.0.iter().copied()
    }

    /// Render the set back into the annotation format
    pub fn to_annotation(&self) -> String {
        self.iter()
            .map(|kind| kind.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromIterator<GcTaskKind> for GcTaskSet {
    fn from_iter<I: IntoIterator<Item = GcTaskKind>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for GcTaskSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("<none>")
        } else {
            f.write_str(&self.to_annotation())
        }
    }
}

/// Parse the task annotation value
///
/// - `None` (annotation absent) enables every kind
/// - `Some("")` disables GC entirely
/// - otherwise every comma-separated, whitespace-trimmed token must name a
///   kind; the first unknown token fails the whole parse
pub fn parse(annotation: Option<&str>) -> Result<GcTaskSet> {
    let Some(value) = annotation else {
        return Ok(GcTaskSet::all());
    };
    if value.is_empty() {
        return Ok(GcTaskSet::empty());
    }

    value
        .split(',')
        .map(|token| {
            let token = token.trim();
            token.parse::<GcTaskKind>().map_err(|_| {
                Error::validation_for_field(
                    crate::error::UNKNOWN_CONTEXT,
                    GC_TASKS_ANNOTATION,
                    format!(
                        "unknown GC task {token:?}, expected one of: {}",
                        GcTaskSet::all().to_annotation()
                    ),
                )
            })
        })
        .collect()
}

/// Resolve the enabled task set from a cluster's annotations
///
/// The opt-out annotation wins over the task list: `external-resource-gc:
/// "false"` yields an empty set even when tasks are listed.
pub fn from_annotations(cluster: &str, annotations: &BTreeMap<String, String>) -> Result<GcTaskSet> {
    if !gc_enabled(annotations) {
        return Ok(GcTaskSet::empty());
    }
    parse(annotations.get(GC_TASKS_ANNOTATION).map(String::as_str)).map_err(|e| match e {
        Error::Validation { message, field, .. } => Error::Validation {
            cluster: cluster.to_string(),
            message,
            field,
        },
        other => other,
    })
}

/// Whether the cluster has not opted out of GC
pub fn gc_enabled(annotations: &BTreeMap<String, String>) -> bool {
    annotations
        .get(GC_ENABLED_ANNOTATION)
        .map_or(true, |value| value != "false")
}
