//! Per-cluster garbage collection state machine
//!
//! The cluster lifecycle controller calls [`GcController::reconcile`] while a
//! cluster is being deleted and only proceeds with infrastructure teardown once
//! a run reports `completed`. A single run walks
//!
//! ```text
//! Idle → Discovering → Classifying → Deleting → Verifying → Completed
//!                                                         ↘ Requeue | Blocked
//! ```
//!
//! Nothing survives between runs except the event inventory (owned by the
//! event-driven discoverer). Each run gets its own [`Deleter`], so deletes
//! repeated within a run are free and deletes repeated across runs hit the
//! cloud's idempotent not-found path.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::classify::{self, AmbiguousReason, Ownership};
use crate::cloud::{CloudApi, CloudError, CloudErrorKind};
use crate::config::GcConfig;
use crate::delete::{DeletionOutcome, Deleter, StepReport};
use crate::discovery::{
    DiscoveryReport, DiscoveryStrategy, PollingDiscoverer, ResourceDiscoverer, StrategySelector,
};
use crate::metrics::RunTimer;
use crate::order::{self, StepAction, StepId};
use crate::resource::{DiscoverySource, TrackedResource};
use crate::retry::retry_if;
use crate::tasks::{self, GcTaskKind, GcTaskSet};
use crate::{Error, Result};

/// Stage of a GC run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GcState {
    /// Request received
    Idle,
    /// Listing candidates
    Discovering,
    /// Re-reading tags and deciding ownership
    Classifying,
    /// Running ordered detach and delete batches
    Deleting,
    /// Re-running discovery to confirm nothing is left
    Verifying,
    /// Nothing owned or ambiguous remains; teardown may proceed
    Completed,
    /// Leftovers remain; try again later
    Requeue,
    /// Leftovers remain and the attempt budget is spent
    Blocked,
}

impl GcState {
    /// Stable label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Discovering => "discovering",
            Self::Classifying => "classifying",
            Self::Deleting => "deleting",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Requeue => "requeue",
            Self::Blocked => "blocked",
        }
    }

    /// Whether the run ends in this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Requeue | Self::Blocked)
    }
}

impl fmt::Display for GcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reconcile request from the cluster lifecycle controller
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcRequest {
    /// Cluster identifier used in ownership tags
    pub cluster_id: String,
    /// Annotations of the cluster's infrastructure object
    pub annotations: BTreeMap<String, String>,
    /// Zero-based count of earlier reconciles for this deletion
    pub attempt: u32,
}

impl GcRequest {
    /// Request for a first attempt
    pub fn new(cluster_id: impl Into<String>, annotations: BTreeMap<String, String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            annotations,
            attempt: 0,
        }
    }

    /// Same request for a later attempt
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// Why a resource is still present after a run
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemainingReason {
    /// Ownership could not be decided
    Ambiguous(AmbiguousReason),
    /// A step for the resource failed
    StepFailed {
        /// Action that failed
        action: StepAction,
        /// Classification of the failure
        error: CloudErrorKind,
        /// Whether retrying later can help
        fatal: bool,
    },
    /// A step this resource depends on failed, so its steps were skipped
    PrerequisiteFailed(StepId),
    /// Fresh tags could not be read before deletion
    TagRefreshFailed(CloudErrorKind),
    /// Verification still found the resource
    StillPresent,
    /// The run was cancelled before the resource was handled
    Cancelled,
}

impl RemainingReason {
    /// Stable reason code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Ambiguous(reason) => reason.as_str(),
            Self::StepFailed { fatal: true, .. } => "step-failed-fatal",
            Self::StepFailed { .. } => "step-failed",
            Self::PrerequisiteFailed(_) => "prerequisite-failed",
            Self::TagRefreshFailed(_) => "tag-refresh-failed",
            Self::StillPresent => "still-present",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A resource left behind by a run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemainingResource {
    /// Kind of the resource
    pub kind: GcTaskKind,
    /// ARN of the resource
    pub provider_id: String,
    /// Why it is still there
    pub reason: RemainingReason,
}

/// A resource removed by a run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeletedResource {
    /// Kind of the resource
    pub kind: GcTaskKind,
    /// ARN of the resource
    pub provider_id: String,
    /// Whether it was already gone when the delete was issued
    pub already_gone: bool,
}

/// Outcome of one reconcile
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcRunResult {
    /// Cluster the run was for
    pub cluster_id: String,
    /// Kinds enabled for the run
    pub requested_tasks: GcTaskSet,
    /// Strategy used for discovery, when discovery ran
    pub strategy: Option<DiscoveryStrategy>,
    /// Resources removed in this run
    pub deleted: Vec<DeletedResource>,
    /// Resources still present, with the reason
    pub remaining: Vec<RemainingResource>,
    /// Failed steps
    pub failed: Vec<StepReport>,
    /// Kinds whose discovery failed, with the error message
    pub discovery_failed: BTreeMap<GcTaskKind, String>,
    /// Terminal state
    pub state: GcState,
    /// Whether teardown may proceed
    pub completed: bool,
    /// Whether the run was cut short by cancellation
    pub cancelled: bool,
}

impl GcRunResult {
    fn new(cluster_id: &str, requested_tasks: GcTaskSet) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            requested_tasks,
            strategy: None,
            deleted: Vec::new(),
            remaining: Vec::new(),
            failed: Vec::new(),
            discovery_failed: BTreeMap::new(),
            state: GcState::Idle,
            completed: false,
            cancelled: false,
        }
    }

    fn is_clean(&self) -> bool {
        !self.cancelled
            && self.remaining.is_empty()
            && self.discovery_failed.is_empty()
            && self.failed.iter().all(|r| !matches!(r.outcome, DeletionOutcome::Fatal(_)))
    }
}

/// Runs GC for clusters being deleted
pub struct GcController {
    cloud: Arc<dyn CloudApi>,
    config: GcConfig,
    selector: StrategySelector,
    polling: Arc<dyn ResourceDiscoverer>,
    event_driven: Option<Arc<dyn ResourceDiscoverer>>,
}

impl GcController {
    /// Create a controller that polls until an event-driven discoverer is
    /// registered and selected
    pub fn new(cloud: Arc<dyn CloudApi>, config: GcConfig) -> Self {
        let polling = Arc::new(PollingDiscoverer::new(
            cloud.clone(),
            config.discovery_retry.clone(),
            config.page_size,
        ));
        Self {
            selector: StrategySelector::new(config.discovery_strategy),
            cloud,
            config,
            polling,
            event_driven: None,
        }
    }

    /// Register a discoverer for its strategy, replacing any earlier one
    pub fn with_discoverer(mut self, discoverer: Arc<dyn ResourceDiscoverer>) -> Self {
        match discoverer.strategy() {
            DiscoveryStrategy::Polling => self.polling = discoverer,
            DiscoveryStrategy::EventDriven => self.event_driven = Some(discoverer),
        }
        self
    }

    /// Switch shared with whoever flips strategies at runtime
    pub fn selector(&self) -> StrategySelector {
        self.selector.clone()
    }

    /// Configuration in effect
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    fn discoverer(&self) -> &Arc<dyn ResourceDiscoverer> {
        match (self.selector.get(), &self.event_driven) {
            (DiscoveryStrategy::EventDriven, Some(discoverer)) => discoverer,
            (DiscoveryStrategy::EventDriven, None) => {
                warn!("event-driven discovery selected but not configured, polling instead");
                &self.polling
            }
            (DiscoveryStrategy::Polling, _) => &self.polling,
        }
    }

    /// Run one GC pass for a cluster
    ///
    /// Fails only when the annotations are invalid. Every other problem is
    /// reported in the result, which is `completed` only when nothing owned
    /// or ambiguous is left and every requested kind was discovered.
    #[instrument(skip(self, request, cancel), fields(cluster = %request.cluster_id, attempt = request.attempt))]
    pub async fn reconcile(
        &self,
        request: GcRequest,
        cancel: &CancellationToken,
    ) -> Result<GcRunResult> {
        let timer = RunTimer::start();
        let cluster_id = request.cluster_id.as_str();
        if cluster_id.is_empty() {
            return Err(Error::validation("cluster id must not be empty"));
        }

        let requested = tasks::from_annotations(cluster_id, &request.annotations)?;
        let mut result = GcRunResult::new(cluster_id, requested.clone());

        if requested.is_empty() {
            info!("garbage collection disabled for cluster");
            return Ok(self.finish(result, request.attempt, timer));
        }

        info!(tasks = %requested, "collecting external resources");
        let discoverer = self.discoverer();
        result.strategy = Some(discoverer.strategy());

        self.transition(&mut result, GcState::Discovering);
        let report = match discoverer.discover(cluster_id, &requested, cancel).await {
            Ok(report) => report,
            Err(Error::Cancelled { .. }) => {
                result.cancelled = true;
                return Ok(self.finish(result, request.attempt, timer));
            }
            Err(e) => return Err(e),
        };
        result.discovery_failed.extend(report.failed.clone());
        debug!(candidates = report.len(), fell_back = report.fell_back, "discovery finished");

        self.transition(&mut result, GcState::Classifying);
        let (candidates, absent) = self.refresh(report, &mut result, cancel).await;
        if cancel.is_cancelled() {
            result.cancelled = true;
            return Ok(self.finish(result, request.attempt, timer));
        }
        let classified = classify::partition(candidates, cluster_id);
        for (resource, reason) in &classified.ambiguous {
            warn!(
                provider_id = %resource.provider_id,
                kind = %resource.kind,
                reason = %reason,
                "ownership ambiguous, leaving resource in place"
            );
            result.remaining.push(RemainingResource {
                kind: resource.kind,
                provider_id: resource.provider_id.clone(),
                reason: RemainingReason::Ambiguous(reason.clone()),
            });
        }
        debug!(
            owned = classified.owned.len(),
            ambiguous = classified.ambiguous.len(),
            not_owned = classified.not_owned.len(),
            "classification finished"
        );

        self.transition(&mut result, GcState::Deleting);
        let mut gone = self.delete(&classified.owned, &mut result, cancel).await;
        gone.extend(absent);
        if !gone.is_empty() {
            discoverer.confirm_absent(&gone);
        }
        if result.cancelled {
            return Ok(self.finish(result, request.attempt, timer));
        }

        self.transition(&mut result, GcState::Verifying);
        self.verify(discoverer.as_ref(), &requested, &gone, &mut result, cancel)
            .await;

        Ok(self.finish(result, request.attempt, timer))
    }

    /// Re-read tags of event-sourced candidates
    ///
    /// Returns the candidates to classify and the provider IDs the fresh read
    /// found missing.
    async fn refresh(
        &self,
        report: DiscoveryReport,
        result: &mut GcRunResult,
        cancel: &CancellationToken,
    ) -> (Vec<TrackedResource>, BTreeSet<String>) {
        let (polled, cached): (Vec<_>, Vec<_>) = report
            .into_resources()
            .into_iter()
            .partition(|r| r.discovered_via == DiscoverySource::Poll);
        if cached.is_empty() {
            return (polled, BTreeSet::new());
        }

        let refreshed = stream::iter(cached)
            .map(|resource| async move {
                let fresh = retry_if(
                    &self.config.discovery_retry,
                    &format!("describe {}", resource.kind),
                    |e: &CloudError| e.kind == CloudErrorKind::Throttling,
                    || self.cloud.describe(resource.kind, &resource.provider_id),
                )
                .await;
                (resource, fresh)
            })
            .buffer_unordered(self.config.delete_concurrency.max(1))
            .collect::<Vec<_>>();

        let refreshed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return (polled, BTreeSet::new()),
            refreshed = refreshed => refreshed,
        };

        let mut candidates = polled;
        let mut absent = BTreeSet::new();
        for (mut resource, fresh) in refreshed {
            match fresh {
                Ok(Some(description)) => {
                    resource.tags = description.tags;
                    resource.references = description.references;
                    candidates.push(resource);
                }
                Ok(None) => {
                    debug!(provider_id = %resource.provider_id, "cached resource no longer exists");
                    absent.insert(resource.provider_id);
                }
                Err(e) => {
                    warn!(provider_id = %resource.provider_id, error = %e, "tag refresh failed");
                    result.remaining.push(RemainingResource {
                        kind: resource.kind,
                        provider_id: resource.provider_id,
                        reason: RemainingReason::TagRefreshFailed(e.kind),
                    });
                }
            }
        }
        (candidates, absent)
    }

    /// Run the ordered batches; returns the provider IDs removed in this run
    async fn delete(
        &self,
        owned: &[TrackedResource],
        result: &mut GcRunResult,
        cancel: &CancellationToken,
    ) -> BTreeSet<String> {
        let deleter = Deleter::new(
            self.cloud.clone(),
            self.config.delete_retry.clone(),
            self.config.account_id.clone(),
        );
        let batches = order::order(owned);
        let mut blocked: BTreeSet<StepId> = BTreeSet::new();
        let mut deleted = BTreeSet::new();

        for (index, batch) in batches.into_iter().enumerate() {
            let (runnable, skipped): (Vec<_>, Vec<_>) = batch
                .steps
                .into_iter()
                .partition(|step| step.prerequisites.is_disjoint(&blocked));

            for step in skipped {
                let failed_prerequisite = step
                    .prerequisites
                    .iter()
                    .find(|p| blocked.contains(*p))
                    .cloned();
                debug!(step = %step.id, "skipping step with failed prerequisite");
                blocked.insert(step.id.clone());
                if let Some(prerequisite) = failed_prerequisite {
                    push_remaining(
                        result,
                        step.kind,
                        step.provider_id(),
                        RemainingReason::PrerequisiteFailed(prerequisite),
                    );
                }
            }

            if runnable.is_empty() {
                continue;
            }
            debug!(batch = index, steps = runnable.len(), "running batch");

            let reports = stream::iter(runnable.iter())
                .map(|step| deleter.execute(step))
                .buffer_unordered(self.config.delete_concurrency.max(1))
                .collect::<Vec<_>>();

            let reports = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(batch = index, "cancelled while deleting");
                    result.cancelled = true;
                    for step in &runnable {
                        push_remaining(result, step.kind, step.provider_id(), RemainingReason::Cancelled);
                    }
                    return deleted;
                }
                reports = reports => reports,
            };

            for report in reports {
                match &report.outcome {
                    DeletionOutcome::Deleted | DeletionOutcome::NotFound => {
                        if report.step.action == StepAction::Delete {
                            deleted.insert(report.step.provider_id.clone());
                            result.deleted.push(DeletedResource {
                                kind: report.kind,
                                provider_id: report.step.provider_id.clone(),
                                already_gone: report.outcome == DeletionOutcome::NotFound,
                            });
                        }
                    }
                    DeletionOutcome::Retryable(e) | DeletionOutcome::Fatal(e) => {
                        blocked.insert(report.step.clone());
                        push_remaining(
                            result,
                            report.kind,
                            &report.step.provider_id,
                            RemainingReason::StepFailed {
                                action: report.step.action,
                                error: e.kind,
                                fatal: matches!(report.outcome, DeletionOutcome::Fatal(_)),
                            },
                        );
                        result.failed.push(report);
                    }
                }
            }
        }
        deleted
    }

    /// Re-discover and record anything still there that this run did not
    /// already explain
    ///
    /// `gone` holds the IDs this run deleted or found missing; a cached
    /// discoverer may still list them.
    async fn verify(
        &self,
        discoverer: &dyn ResourceDiscoverer,
        requested: &GcTaskSet,
        gone: &BTreeSet<String>,
        result: &mut GcRunResult,
        cancel: &CancellationToken,
    ) {
        let report = match discoverer.discover(&result.cluster_id, requested, cancel).await {
            Ok(report) => report,
            Err(Error::Cancelled { .. }) => {
                warn!("verification cancelled");
                result.cancelled = true;
                return;
            }
            Err(e) => {
                warn!(error = %e, "verification discovery failed");
                for kind in requested.iter() {
                    result
                        .discovery_failed
                        .entry(kind)
                        .or_insert_with(|| e.to_string());
                }
                return;
            }
        };
        result.discovery_failed.extend(report.failed.clone());

        let explained: BTreeSet<String> = result
            .remaining
            .iter()
            .map(|r| r.provider_id.clone())
            .collect();
        for resource in report.all() {
            if gone.contains(&resource.provider_id) || explained.contains(&resource.provider_id) {
                continue;
            }
            let reason = match classify::classify(resource, &result.cluster_id) {
                Ownership::Owned => RemainingReason::StillPresent,
                Ownership::Ambiguous(reason) => RemainingReason::Ambiguous(reason),
                Ownership::NotOwned(_) => continue,
            };
            push_remaining(result, resource.kind, &resource.provider_id, reason);
        }
    }

    fn transition(&self, result: &mut GcRunResult, next: GcState) {
        debug!(from = %result.state, to = %next, "state transition");
        result.state = next;
    }

    fn finish(&self, mut result: GcRunResult, attempt: u32, timer: RunTimer) -> GcRunResult {
        let next = if result.is_clean() {
            GcState::Completed
        } else if attempt.saturating_add(1) >= self.config.max_reconcile_attempts {
            GcState::Blocked
        } else {
            GcState::Requeue
        };
        self.transition(&mut result, next);
        result.completed = next == GcState::Completed;
        timer.complete(next.as_str());

        match next {
            GcState::Completed => info!(deleted = result.deleted.len(), "garbage collection complete"),
            GcState::Blocked => {
                for leftover in &result.remaining {
                    warn!(
                        kind = %leftover.kind,
                        provider_id = %leftover.provider_id,
                        reason = leftover.reason.code(),
                        "resource blocks cluster teardown"
                    );
                }
                warn!(
                    remaining = result.remaining.len(),
                    undiscovered = result.discovery_failed.len(),
                    "garbage collection blocked"
                );
            }
            _ => info!(
                deleted = result.deleted.len(),
                remaining = result.remaining.len(),
                undiscovered = result.discovery_failed.len(),
                cancelled = result.cancelled,
                "garbage collection incomplete, requeueing"
            ),
        }
        result
    }
}

/// Record a leftover once; the first reason recorded for a resource wins
fn push_remaining(
    result: &mut GcRunResult,
    kind: GcTaskKind,
    provider_id: &str,
    reason: RemainingReason,
) {
    if result.remaining.iter().any(|r| r.provider_id == provider_id) {
        return;
    }
    result.remaining.push(RemainingResource {
        kind,
        provider_id: provider_id.to_string(),
        reason,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::MockResourceDiscoverer;
    use crate::retry::RetryConfig;
    use crate::tags::Tags;
    use crate::tasks::GC_TASKS_ANNOTATION;
    use crate::testing::{FakeCloud, FakeOp};
    use std::time::Duration;

    // ==========================================================================
    // Helpers
    // ==========================================================================

    const LB: &str = "arn:aws:elasticloadbalancing:us-east-1:111122223333:loadbalancer/net/web/1";
    const TG: &str = "arn:aws:elasticloadbalancing:us-east-1:111122223333:targetgroup/web/2";
    const SG: &str = "arn:aws:ec2:us-east-1:111122223333:security-group/sg-3";
    const SHARED_SG: &str = "arn:aws:ec2:us-east-1:111122223333:security-group/sg-4";

    fn fast_config() -> GcConfig {
        let retry = RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
            max_elapsed: None,
        };
        GcConfig {
            discovery_retry: retry.clone(),
            delete_retry: retry,
            max_reconcile_attempts: 3,
            ..Default::default()
        }
    }

    fn owned(service: bool) -> Tags {
        let mut tags = Tags::new();
        tags.insert("kubernetes.io/cluster/foo".into(), "owned".into());
        if service {
            tags.insert("kubernetes.io/service-name".into(), "default/web".into());
        }
        tags
    }

    fn populated() -> Arc<FakeCloud> {
        let cloud = Arc::new(FakeCloud::new());
        cloud.insert(GcTaskKind::LoadBalancer, LB, owned(true), [TG, SG]);
        cloud.insert(GcTaskKind::TargetGroup, TG, owned(true), [] as [&str; 0]);
        cloud.insert(GcTaskKind::SecurityGroup, SG, owned(false), [] as [&str; 0]);
        cloud
    }

    fn annotations(value: Option<&str>) -> BTreeMap<String, String> {
        value
            .map(|v| (GC_TASKS_ANNOTATION.to_string(), v.to_string()))
            .into_iter()
            .collect()
    }

    // ==========================================================================
    // State machine
    // ==========================================================================

    #[tokio::test]
    async fn empty_annotation_completes_without_discovery() {
        let mut discoverer = MockResourceDiscoverer::new();
        discoverer
            .expect_strategy()
            .return_const(DiscoveryStrategy::Polling);
        discoverer.expect_discover().never();

        let controller = GcController::new(Arc::new(FakeCloud::new()), fast_config())
            .with_discoverer(Arc::new(discoverer));
        let result = controller
            .reconcile(GcRequest::new("foo", annotations(Some(""))), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.completed);
        assert_eq!(result.state, GcState::Completed);
        assert!(result.requested_tasks.is_empty());
        assert_eq!(result.strategy, None);
    }

    #[tokio::test]
    async fn invalid_annotation_is_rejected() {
        let controller = GcController::new(Arc::new(FakeCloud::new()), fast_config());
        let err = controller
            .reconcile(
                GcRequest::new("foo", annotations(Some("load-balancer,INVALID"))),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { ref cluster, .. } if cluster == "foo"));
    }

    #[tokio::test]
    async fn owned_resources_are_deleted_in_order() {
        let cloud = populated();
        let controller = GcController::new(cloud.clone(), fast_config());
        let result = controller
            .reconcile(GcRequest::new("foo", annotations(None)), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.completed, "{result:?}");
        assert_eq!(result.deleted.len(), 3);
        assert!(result.failed.is_empty());
        assert!(cloud.is_empty());
        assert_eq!(cloud.dependency_violations(), 0);
    }

    #[tokio::test]
    async fn shared_security_group_is_never_deleted() {
        let cloud = populated();
        let mut shared = Tags::new();
        shared.insert("kubernetes.io/cluster/foo".into(), "shared".into());
        cloud.insert(GcTaskKind::SecurityGroup, SHARED_SG, shared, [] as [&str; 0]);

        let controller = GcController::new(cloud.clone(), fast_config());
        let result = controller
            .reconcile(GcRequest::new("foo", annotations(None)), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!result.completed);
        assert_eq!(result.state, GcState::Requeue);
        assert!(cloud.contains(SHARED_SG));
        assert!(!cloud.was_called(FakeOp::Delete, SHARED_SG));
        assert_eq!(
            result.remaining,
            vec![RemainingResource {
                kind: GcTaskKind::SecurityGroup,
                provider_id: SHARED_SG.to_string(),
                reason: RemainingReason::Ambiguous(AmbiguousReason::SharedMarker),
            }]
        );
    }

    #[tokio::test]
    async fn exhausted_attempts_block() {
        let cloud = populated();
        cloud.fail_always(FakeOp::Delete, SG, CloudError::from_aws("DependencyViolation", "in use"));

        let controller = GcController::new(cloud.clone(), fast_config());
        let result = controller
            .reconcile(
                GcRequest::new("foo", annotations(None)).with_attempt(2),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.state, GcState::Blocked);
        assert!(!result.completed);
        assert_eq!(result.remaining.len(), 1);
        assert_eq!(result.remaining[0].provider_id, SG);
        assert_eq!(result.remaining[0].reason.code(), "step-failed");
    }

    #[tokio::test]
    async fn failed_detach_skips_dependent_deletes() {
        let cloud = populated();
        cloud.fail_always(
            FakeOp::DetachListeners,
            LB,
            CloudError::from_aws("UnauthorizedOperation", "denied"),
        );

        let controller = GcController::new(cloud.clone(), fast_config());
        let result = controller
            .reconcile(GcRequest::new("foo", annotations(None)), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!result.completed);
        assert!(cloud.contains(LB));
        assert!(cloud.contains(TG));
        assert!(cloud.contains(SG));
        assert!(!cloud.was_called(FakeOp::Delete, TG));
        let tg = result
            .remaining
            .iter()
            .find(|r| r.provider_id == TG)
            .unwrap();
        assert_eq!(
            tg.reason,
            RemainingReason::PrerequisiteFailed(StepId::new(StepAction::DetachListeners, LB))
        );
    }

    #[tokio::test]
    async fn discovery_failure_prevents_completion() {
        let cloud = Arc::new(FakeCloud::new());
        cloud.fail_list(GcTaskKind::TargetGroup, CloudError::from_aws("AccessDenied", "no"));

        let controller = GcController::new(cloud, fast_config());
        let result = controller
            .reconcile(GcRequest::new("foo", annotations(None)), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!result.completed);
        assert!(result.discovery_failed.contains_key(&GcTaskKind::TargetGroup));
    }

    #[tokio::test]
    async fn repeated_reconciles_converge() {
        let cloud = populated();
        cloud.fail_times(FakeOp::Delete, SG, 3, CloudError::from_aws("DependencyViolation", "in use"));

        let controller = GcController::new(cloud.clone(), fast_config());
        let mut attempt = 0;
        let result = loop {
            let result = controller
                .reconcile(
                    GcRequest::new("foo", annotations(None)).with_attempt(attempt),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
            if result.state != GcState::Requeue {
                break result;
            }
            attempt += 1;
        };

        assert!(result.completed);
        assert!(cloud.is_empty());
        assert!(attempt >= 1);
    }

    #[tokio::test]
    async fn cancelled_run_reports_partial_result() {
        let cloud = populated();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let controller = GcController::new(cloud.clone(), fast_config());
        let result = controller
            .reconcile(GcRequest::new("foo", annotations(None)), &cancel)
            .await
            .unwrap();

        assert!(result.cancelled);
        assert!(!result.completed);
        assert_eq!(result.state, GcState::Requeue);
        assert!(result.deleted.is_empty());
    }

    #[tokio::test]
    async fn selector_switch_takes_effect_on_next_reconcile() {
        let mut events = MockResourceDiscoverer::new();
        events
            .expect_strategy()
            .return_const(DiscoveryStrategy::EventDriven);
        events
            .expect_discover()
            .times(2)
            .returning(|_, _, _| Ok(DiscoveryReport::default()));

        let controller = GcController::new(Arc::new(FakeCloud::new()), fast_config())
            .with_discoverer(Arc::new(events));
        let selector = controller.selector();

        let first = controller
            .reconcile(GcRequest::new("foo", annotations(None)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.strategy, Some(DiscoveryStrategy::Polling));

        selector.set(DiscoveryStrategy::EventDriven);
        let second = controller
            .reconcile(GcRequest::new("foo", annotations(None)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.strategy, Some(DiscoveryStrategy::EventDriven));
        assert!(second.completed);
    }

    #[tokio::test]
    async fn cached_candidates_are_reclassified_with_fresh_tags() {
        let cloud = Arc::new(FakeCloud::new());
        let mut shared = Tags::new();
        shared.insert("kubernetes.io/cluster/foo".into(), "shared".into());
        cloud.insert(GcTaskKind::SecurityGroup, SG, shared, [] as [&str; 0]);

        let mut events = MockResourceDiscoverer::new();
        events
            .expect_strategy()
            .return_const(DiscoveryStrategy::EventDriven);
        events.expect_discover().returning(|_, _, _| {
            let stale = TrackedResource::new(
                GcTaskKind::SecurityGroup,
                SG,
                owned(false),
                DiscoverySource::Event,
            );
            Ok(DiscoveryReport {
                resources: [(GcTaskKind::SecurityGroup, vec![stale])].into_iter().collect(),
                ..Default::default()
            })
        });

        let config = GcConfig {
            discovery_strategy: DiscoveryStrategy::EventDriven,
            ..fast_config()
        };
        let controller = GcController::new(cloud.clone(), config).with_discoverer(Arc::new(events));
        let result = controller
            .reconcile(GcRequest::new("foo", annotations(Some("security-group"))), &CancellationToken::new())
            .await
            .unwrap();

        assert!(cloud.contains(SG));
        assert!(!cloud.was_called(FakeOp::Delete, SG));
        assert_eq!(
            result.remaining[0].reason,
            RemainingReason::Ambiguous(AmbiguousReason::SharedMarker)
        );
    }

    #[tokio::test]
    async fn verification_ignores_resources_deleted_this_run() {
        let cloud = Arc::new(FakeCloud::new());
        cloud.insert(GcTaskKind::SecurityGroup, SG, owned(false), [] as [&str; 0]);
        let mut events = MockResourceDiscoverer::new();
        events
            .expect_strategy()
            .return_const(DiscoveryStrategy::EventDriven);
        events
            .expect_confirm_absent()
            .withf(|ids| ids.contains(SG))
            .times(1)
            .return_const(());
        // the cache keeps listing the security group after it is gone
        events.expect_discover().returning(|_, _, _| {
            let cached = TrackedResource::new(
                GcTaskKind::SecurityGroup,
                SG,
                owned(false),
                DiscoverySource::Event,
            );
            Ok(DiscoveryReport {
                resources: [(GcTaskKind::SecurityGroup, vec![cached])].into_iter().collect(),
                ..Default::default()
            })
        });

        let config = GcConfig {
            discovery_strategy: DiscoveryStrategy::EventDriven,
            ..fast_config()
        };
        let controller = GcController::new(cloud.clone(), config).with_discoverer(Arc::new(events));
        let result = controller
            .reconcile(GcRequest::new("foo", annotations(Some("security-group"))), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.completed, "{result:?}");
        assert!(!cloud.contains(SG));
    }

    #[tokio::test]
    async fn cached_resource_missing_from_cloud_does_not_block() {
        // deleted out of band; its deletion event never reached the cache
        let cloud = Arc::new(FakeCloud::new());
        let mut events = MockResourceDiscoverer::new();
        events
            .expect_strategy()
            .return_const(DiscoveryStrategy::EventDriven);
        events.expect_discover().times(2).returning(|_, _, _| {
            let cached = TrackedResource::new(
                GcTaskKind::SecurityGroup,
                SG,
                owned(false),
                DiscoverySource::Event,
            );
            Ok(DiscoveryReport {
                resources: [(GcTaskKind::SecurityGroup, vec![cached])].into_iter().collect(),
                ..Default::default()
            })
        });
        events
            .expect_confirm_absent()
            .withf(|ids| ids.len() == 1 && ids.contains(SG))
            .times(1)
            .return_const(());

        let config = GcConfig {
            discovery_strategy: DiscoveryStrategy::EventDriven,
            ..fast_config()
        };
        let controller = GcController::new(cloud.clone(), config).with_discoverer(Arc::new(events));
        let result = controller
            .reconcile(GcRequest::new("foo", annotations(Some("security-group"))), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.completed, "{result:?}");
        assert!(result.remaining.is_empty());
        assert!(result.deleted.is_empty());
        assert!(!cloud.was_called(FakeOp::Delete, SG));
    }

    #[tokio::test]
    async fn failed_verification_prevents_completion() {
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let mut discoverer = MockResourceDiscoverer::new();
        discoverer
            .expect_strategy()
            .return_const(DiscoveryStrategy::Polling);
        discoverer.expect_discover().times(2).returning(move |_, _, _| {
            if calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                Ok(DiscoveryReport::default())
            } else {
                Err(Error::discovery(GcTaskKind::LoadBalancer, "inventory unavailable"))
            }
        });

        let controller = GcController::new(Arc::new(FakeCloud::new()), fast_config())
            .with_discoverer(Arc::new(discoverer));
        let result = controller
            .reconcile(GcRequest::new("foo", annotations(None)), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!result.completed);
        assert!(!result.cancelled);
        assert_eq!(result.state, GcState::Requeue);
        assert_eq!(result.discovery_failed.len(), 3);
    }
}
