//! Dependency ordering of detach and delete steps
//!
//! Every owned resource contributes two steps: a preparation step that breaks
//! its inbound dependencies (detach listeners, deregister targets, revoke
//! referencing rules) and the delete itself. Steps are layered by longest
//! dependency path, so each [`ResourceBatch`] only depends on earlier ones and
//! its steps can run in parallel.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::resource::TrackedResource;
use crate::tasks::GcTaskKind;

/// What a step does to its resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepAction {
    /// Remove all listeners from a load balancer
    DetachListeners,
    /// Deregister all targets from a target group
    DeregisterTargets,
    /// Revoke every rule that references a security group
    RevokeReferences,
    /// Delete the resource
    Delete,
}

impl StepAction {
    /// Preparation step for a resource kind
    pub fn prepare(kind: GcTaskKind) -> Self {
        match kind {
            GcTaskKind::LoadBalancer => Self::DetachListeners,
            GcTaskKind::TargetGroup => Self::DeregisterTargets,
            GcTaskKind::SecurityGroup => Self::RevokeReferences,
        }
    }

    /// Stable label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DetachListeners => "detach-listeners",
            Self::DeregisterTargets => "deregister-targets",
            Self::RevokeReferences => "revoke-references",
            Self::Delete => "delete",
        }
    }
}

/// Identity of a step: action plus target resource
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepId {
    /// Action performed
    pub action: StepAction,
    /// Target resource
    pub provider_id: String,
}

impl StepId {
    /// Build a step identity
    pub fn new(action: StepAction, provider_id: impl Into<String>) -> Self {
        Self {
            action,
            provider_id: provider_id.into(),
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.action.as_str(), self.provider_id)
    }
}

/// One unit of work for the deleter
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcStep {
    /// Step identity
    pub id: StepId,
    /// Kind of the target resource
    pub kind: GcTaskKind,
    /// Steps that must have succeeded first
    pub prerequisites: BTreeSet<StepId>,
}

impl GcStep {
    fn new(action: StepAction, resource: &TrackedResource) -> Self {
        Self {
            id: StepId::new(action, resource.provider_id.clone()),
            kind: resource.kind,
            prerequisites: BTreeSet::new(),
        }
    }

    /// Action performed
    pub fn action(&self) -> StepAction {
        self.id.action
    }

    /// Target resource
    pub fn provider_id(&self) -> &str {
        &self.id.provider_id
    }
}

/// Steps that may run concurrently
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceBatch {
    /// Steps in a stable order
    pub steps: Vec<GcStep>,
}

impl ResourceBatch {
    /// Number of steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the batch has no steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Order the owned resources into batches
///
/// Rules:
/// - a load balancer's listeners are detached before it is deleted
/// - a target group is deleted after its targets are deregistered and after
///   the listeners of every load balancer forwarding to it are detached
/// - a security group is deleted after the rules referencing it are revoked
///   and after every load balancer attaching it is deleted
///
/// References to resources outside `resources` impose no ordering. Duplicate
/// provider IDs are collapsed.
pub fn order(resources: &[TrackedResource]) -> Vec<ResourceBatch> {
    let by_id: BTreeMap<&str, &TrackedResource> = resources
        .iter()
        .map(|r| (r.provider_id.as_str(), r))
        .collect();

    let mut steps: BTreeMap<StepId, GcStep> = BTreeMap::new();
    for resource in by_id.values() {
        let prepare = GcStep::new(StepAction::prepare(resource.kind), resource);
        let mut delete = GcStep::new(StepAction::Delete, resource);
        delete.prerequisites.insert(prepare.id.clone());
        steps.insert(prepare.id.clone(), prepare);
        steps.insert(delete.id.clone(), delete);
    }

    for lb in by_id
        .values()
        .filter(|r| r.kind == GcTaskKind::LoadBalancer)
    {
        for reference in &lb.references {
            let Some(target) = by_id.get(reference.as_str()) else {
                continue;
            };
            let (prerequisite, dependent) = match target.kind {
                GcTaskKind::TargetGroup => (StepAction::DetachListeners, &target.provider_id),
                GcTaskKind::SecurityGroup => (StepAction::Delete, &target.provider_id),
                GcTaskKind::LoadBalancer => continue,
            };
            if let Some(step) = steps.get_mut(&StepId::new(StepAction::Delete, dependent.clone())) {
                step.prerequisites
                    .insert(StepId::new(prerequisite, lb.provider_id.clone()));
            }
        }
    }

    let levels = layer(&steps);
    let depth = levels.values().copied().max().map_or(0, |max| max + 1);
    let mut batches = vec![ResourceBatch::default(); depth];
    for (id, step) in steps {
        if let Some(level) = levels.get(&id) {
            batches[*level].steps.push(step);
        }
    }
    batches
}

/// Longest-path level of every step
///
/// The edge rules above only point from preparation steps to deletes and from
/// load balancer deletes to security group deletes, so the graph is acyclic
/// and relaxation settles within `steps.len()` rounds.
fn layer(steps: &BTreeMap<StepId, GcStep>) -> BTreeMap<StepId, usize> {
    let mut levels: BTreeMap<StepId, usize> = steps.keys().map(|id| (id.clone(), 0)).collect();
    for _ in 0..steps.len() {
        let mut changed = false;
        for (id, step) in steps {
            let level = step
                .prerequisites
                .iter()
                .filter_map(|p| levels.get(p))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            if levels.get(id).is_some_and(|current| level > *current) {
                levels.insert(id.clone(), level);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    levels
}
