//! In-memory cloud for tests
//!
//! [`FakeCloud`] keeps a small resource graph and enforces the dependency
//! rules the real provider enforces: a target group cannot be deleted while a
//! load balancer listener forwards to it, and a security group cannot be
//! deleted while a load balancer attaches it or another group's rules
//! reference it. Violations are returned as `DependencyViolation` errors and
//! counted, so tests can assert that ordering avoided them entirely.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::cloud::{
    CloudApi, CloudError, PageRequest, ResourceDescription, ResourcePage, TagFilter,
};
use crate::tags::Tags;
use crate::tasks::GcTaskKind;

/// Cloud operation, for failure injection and call assertions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FakeOp {
    /// `list_tagged`
    List,
    /// `describe`
    Describe,
    /// `detach_listeners`
    DetachListeners,
    /// `deregister_targets`
    DeregisterTargets,
    /// `revoke_references`
    RevokeReferences,
    /// `delete`
    Delete,
}

/// One recorded call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeCall {
    /// Operation invoked
    pub op: FakeOp,
    /// Provider ID, or the kind for list calls
    pub target: String,
}

#[derive(Clone, Debug)]
struct FakeResource {
    kind: GcTaskKind,
    tags: Tags,
    references: BTreeSet<String>,
    listeners: bool,
}

#[derive(Clone, Debug)]
enum Failure {
    Always(CloudError),
    Times(u32, CloudError),
}

#[derive(Debug, Default)]
struct FakeState {
    resources: BTreeMap<String, FakeResource>,
    failures: HashMap<(FakeOp, String), Failure>,
    list_failures: HashMap<GcTaskKind, CloudError>,
    calls: Vec<FakeCall>,
    dependency_violations: usize,
}

impl FakeState {
    fn record(&mut self, op: FakeOp, target: &str) -> Result<(), CloudError> {
        self.calls.push(FakeCall {
            op,
            target: target.to_string(),
        });
        let key = (op, target.to_string());
        let (error, exhausted) = match self.failures.get_mut(&key) {
            Some(Failure::Always(e)) => (e.clone(), false),
            Some(Failure::Times(remaining, e)) => {
                *remaining = remaining.saturating_sub(1);
                (e.clone(), *remaining == 0)
            }
            None => return Ok(()),
        };
        if exhausted {
            self.failures.remove(&key);
        }
        Err(error)
    }

    fn existing(&self, id: &str, kind: GcTaskKind) -> Result<&FakeResource, CloudError> {
        self.resources
            .get(id)
            .filter(|r| r.kind == kind)
            .ok_or_else(|| CloudError::from_aws(not_found_code(kind), id.to_string()))
    }

    fn violation(&mut self, id: &str, holder: &str) -> CloudError {
        self.dependency_violations += 1;
        CloudError::from_aws(
            "DependencyViolation",
            format!("resource {id} has a dependent object {holder}"),
        )
    }
}

fn not_found_code(kind: GcTaskKind) -> &'static str {
    match kind {
        GcTaskKind::LoadBalancer => "LoadBalancerNotFound",
        GcTaskKind::TargetGroup => "TargetGroupNotFound",
        GcTaskKind::SecurityGroup => "InvalidGroup.NotFound",
    }
}

/// In-memory [`CloudApi`]
#[derive(Debug, Default)]
pub struct FakeCloud {
    state: Mutex<FakeState>,
}

impl FakeCloud {
    /// Create an empty cloud
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a resource; load balancers start with listeners
    pub fn insert<I, S>(&self, kind: GcTaskKind, provider_id: &str, tags: Tags, references: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().resources.insert(
            provider_id.to_string(),
            FakeResource {
                kind,
                tags,
                references: references.into_iter().map(Into::into).collect(),
                listeners: kind == GcTaskKind::LoadBalancer,
            },
        );
    }

    /// Replace a resource's tags
    pub fn set_tags(&self, provider_id: &str, tags: Tags) {
        if let Some(resource) = self.state.lock().resources.get_mut(provider_id) {
            resource.tags = tags;
        }
    }

    /// Remove a resource out of band
    pub fn remove(&self, provider_id: &str) {
        self.state.lock().resources.remove(provider_id);
    }

    /// Whether the resource exists
    pub fn contains(&self, provider_id: &str) -> bool {
        self.state.lock().resources.contains_key(provider_id)
    }

    /// Number of resources
    pub fn len(&self) -> usize {
        self.state.lock().resources.len()
    }

    /// Whether no resource exists
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail every call of `op` on the resource
    pub fn fail_always(&self, op: FakeOp, provider_id: &str, error: CloudError) {
        self.state
            .lock()
            .failures
            .insert((op, provider_id.to_string()), Failure::Always(error));
    }

    /// Fail the next `times` calls of `op` on the resource
    pub fn fail_times(&self, op: FakeOp, provider_id: &str, times: u32, error: CloudError) {
        if times == 0 {
            return;
        }
        self.state
            .lock()
            .failures
            .insert((op, provider_id.to_string()), Failure::Times(times, error));
    }

    /// Fail every list call for a kind
    pub fn fail_list(&self, kind: GcTaskKind, error: CloudError) {
        self.state.lock().list_failures.insert(kind, error);
    }

    /// Every call so far, in order
    pub fn calls(&self) -> Vec<FakeCall> {
        self.state.lock().calls.clone()
    }

    /// Number of calls of `op` on the resource
    pub fn call_count(&self, op: FakeOp, provider_id: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.op == op && c.target == provider_id)
            .count()
    }

    /// Whether `op` was called on the resource
    pub fn was_called(&self, op: FakeOp, provider_id: &str) -> bool {
        self.call_count(op, provider_id) > 0
    }

    /// Deletes rejected because a dependent still existed
    pub fn dependency_violations(&self) -> usize {
        self.state.lock().dependency_violations
    }
}

#[async_trait]
impl CloudApi for FakeCloud {
    async fn list_tagged(
        &self,
        kind: GcTaskKind,
        filter: &TagFilter,
        page: PageRequest,
    ) -> Result<ResourcePage, CloudError> {
        let mut state = self.state.lock();
        state.record(FakeOp::List, kind.as_str())?;
        if let Some(e) = state.list_failures.get(&kind) {
            return Err(e.clone());
        }

        let matching: Vec<ResourceDescription> = state
            .resources
            .iter()
            .filter(|(_, r)| r.kind == kind && filter.matches(&r.tags))
            .map(|(id, r)| ResourceDescription {
                provider_id: id.clone(),
                tags: r.tags.clone(),
                references: r.references.clone(),
            })
            .collect();

        let start = page
            .token
            .as_deref()
            .and_then(|t| t.parse::<usize>().ok())
            .unwrap_or(0)
            .min(matching.len());
        let size = page.page_size.max(1) as usize;
        let end = (start + size).min(matching.len());
        Ok(ResourcePage {
            items: matching[start..end].to_vec(),
            next_token: (end < matching.len()).then(|| end.to_string()),
        })
    }

    async fn describe(
        &self,
        kind: GcTaskKind,
        provider_id: &str,
    ) -> Result<Option<ResourceDescription>, CloudError> {
        let mut state = self.state.lock();
        state.record(FakeOp::Describe, provider_id)?;
        Ok(state
            .resources
            .get(provider_id)
            .filter(|r| r.kind == kind)
            .map(|r| ResourceDescription {
                provider_id: provider_id.to_string(),
                tags: r.tags.clone(),
                references: r.references.clone(),
            }))
    }

    async fn detach_listeners(&self, load_balancer_id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        state.record(FakeOp::DetachListeners, load_balancer_id)?;
        state.existing(load_balancer_id, GcTaskKind::LoadBalancer)?;
        if let Some(lb) = state.resources.get_mut(load_balancer_id) {
            lb.listeners = false;
        }
        Ok(())
    }

    async fn deregister_targets(&self, target_group_id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        state.record(FakeOp::DeregisterTargets, target_group_id)?;
        state.existing(target_group_id, GcTaskKind::TargetGroup)?;
        Ok(())
    }

    async fn revoke_references(&self, security_group_id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        state.record(FakeOp::RevokeReferences, security_group_id)?;
        state.existing(security_group_id, GcTaskKind::SecurityGroup)?;
        for resource in state.resources.values_mut() {
            if resource.kind == GcTaskKind::SecurityGroup {
                resource.references.remove(security_group_id);
            }
        }
        Ok(())
    }

    async fn delete(&self, kind: GcTaskKind, provider_id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        state.record(FakeOp::Delete, provider_id)?;
        state.existing(provider_id, kind)?;

        let holder = state
            .resources
            .iter()
            .find(|(id, r)| {
                id.as_str() != provider_id
                    && r.references.contains(provider_id)
                    && match (kind, r.kind) {
                        (GcTaskKind::TargetGroup, GcTaskKind::LoadBalancer) => r.listeners,
                        (GcTaskKind::SecurityGroup, GcTaskKind::LoadBalancer) => true,
                        (GcTaskKind::SecurityGroup, GcTaskKind::SecurityGroup) => true,
                        _ => false,
                    }
            })
            .map(|(id, _)| id.clone());
        if let Some(holder) = holder {
            return Err(state.violation(provider_id, &holder));
        }

        state.resources.remove(provider_id);
        Ok(())
    }
}
