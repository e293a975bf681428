//! Idempotent execution of detach and delete steps
//!
//! The [`Deleter`] runs one [`GcStep`] at a time against the cloud, retrying
//! throttling and dependency races with backoff. It remembers every step that
//! reached a successful terminal outcome during the run, so asking it to run
//! the same step again is answered without a second cloud call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cloud::{CloudApi, CloudError, CloudErrorKind};
use crate::metrics;
use crate::order::{GcStep, StepAction, StepId};
use crate::resource::ResourceArn;
use crate::retry::{retry_if, RetryConfig};
use crate::tasks::GcTaskKind;

/// Terminal result of one step
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeletionOutcome {
    /// The cloud accepted the call
    Deleted,
    /// The resource was already gone; counts as success
    NotFound,
    /// Retries ran out on an error that may clear later
    Retryable(CloudError),
    /// The error will not clear without intervention
    Fatal(CloudError),
}

impl DeletionOutcome {
    /// Whether dependent steps may proceed
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Deleted | Self::NotFound)
    }

    /// Error carried by a failed outcome
    pub fn error(&self) -> Option<&CloudError> {
        match self {
            Self::Retryable(e) | Self::Fatal(e) => Some(e),
            Self::Deleted | Self::NotFound => None,
        }
    }

    /// Stable label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deleted => "deleted",
            Self::NotFound => "not-found",
            Self::Retryable(_) => "retryable",
            Self::Fatal(_) => "fatal",
        }
    }
}

/// Retry bookkeeping for one step
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeletionAttempt {
    /// Cloud calls made for the step in this run
    pub attempts: u32,
    /// Classification of the last failure
    pub last_error: Option<CloudErrorKind>,
    /// Earliest time a later run should try again, for unfinished steps
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// What happened to one step
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepReport {
    /// Step identity
    pub step: StepId,
    /// Kind of the target resource
    pub kind: GcTaskKind,
    /// Terminal outcome
    pub outcome: DeletionOutcome,
    /// Retry bookkeeping
    pub attempt: DeletionAttempt,
    /// Answered from this run's memory of earlier successes
    pub cached: bool,
}

/// Executes steps for a single GC run
pub struct Deleter {
    cloud: Arc<dyn CloudApi>,
    retry: RetryConfig,
    account_id: Option<String>,
    finished: Mutex<HashMap<StepId, StepReport>>,
}

impl Deleter {
    /// Create a deleter with an empty run memory
    pub fn new(cloud: Arc<dyn CloudApi>, retry: RetryConfig, account_id: Option<String>) -> Self {
        Self {
            cloud,
            retry,
            account_id,
            finished: Mutex::new(HashMap::new()),
        }
    }

    /// Run one step to a terminal outcome
    pub async fn execute(&self, step: &GcStep) -> StepReport {
        if let Some(previous) = self.finished.lock().get(&step.id) {
            debug!(step = %step.id, "Step already finished in this run");
            return StepReport {
                cached: true,
                ..previous.clone()
            };
        }

        if let Some(err) = self.account_mismatch(step) {
            warn!(step = %step.id, error = %err, "Refusing to touch resource in another account");
            metrics::record_delete_error(step.kind, err.kind.as_str());
            return self.report(step, DeletionOutcome::Fatal(err.clone()), 0, Some(err.kind));
        }

        let calls = AtomicU32::new(0);
        let result = retry_if(
            &self.retry,
            &step.id.to_string(),
            CloudError::is_retryable,
            || {
                calls.fetch_add(1, Ordering::Relaxed);
                self.call(step)
            },
        )
        .await;
        let attempts = calls.load(Ordering::Relaxed);

        let report = match result {
            Ok(()) => {
                info!(step = %step.id, kind = %step.kind, attempts, "Step succeeded");
                if step.action() == StepAction::Delete {
                    metrics::record_deleted(step.kind);
                }
                self.report(step, DeletionOutcome::Deleted, attempts, None)
            }
            Err(e) if e.kind == CloudErrorKind::NotFound => {
                info!(step = %step.id, kind = %step.kind, "Resource already gone");
                self.report(step, DeletionOutcome::NotFound, attempts, None)
            }
            Err(e) => {
                metrics::record_delete_error(step.kind, e.kind.as_str());
                let kind = e.kind;
                let outcome = if kind.is_fatal() {
                    warn!(step = %step.id, error = %e, "Step failed permanently");
                    DeletionOutcome::Fatal(e)
                } else {
                    warn!(step = %step.id, error = %e, attempts, "Step still failing, deferring");
                    DeletionOutcome::Retryable(e)
                };
                self.report(step, outcome, attempts, Some(kind))
            }
        };

        if report.outcome.is_success() {
            self.finished.lock().insert(step.id.clone(), report.clone());
        }
        report
    }

    async fn call(&self, step: &GcStep) -> Result<(), CloudError> {
        let id = step.provider_id();
        match step.action() {
            StepAction::DetachListeners => self.cloud.detach_listeners(id).await,
            StepAction::DeregisterTargets => self.cloud.deregister_targets(id).await,
            StepAction::RevokeReferences => self.cloud.revoke_references(id).await,
            StepAction::Delete => self.cloud.delete(step.kind, id).await,
        }
    }

    fn account_mismatch(&self, step: &GcStep) -> Option<CloudError> {
        let expected = self.account_id.as_deref()?;
        let arn = ResourceArn::parse(step.provider_id())?;
        if arn.account.is_empty() || arn.account == expected {
            return None;
        }
        Some(CloudError::new(
            CloudErrorKind::AccountMismatch,
            format!("resource belongs to account {}, expected {expected}", arn.account),
        ))
    }

    fn report(
        &self,
        step: &GcStep,
        outcome: DeletionOutcome,
        attempts: u32,
        last_error: Option<CloudErrorKind>,
    ) -> StepReport {
        let next_retry_at = match &outcome {
            DeletionOutcome::Retryable(_) => {
                let delay = self.retry.delay_for(attempts.max(1));
                chrono::Duration::from_std(delay)
                    .ok()
                    .map(|delay| Utc::now() + delay)
            }
            _ => None,
        };
        StepReport {
            step: step.id.clone(),
            kind: step.kind,
            outcome,
            attempt: DeletionAttempt {
                attempts,
                last_error,
                next_retry_at,
            },
            cached: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MockCloudApi;
    use crate::order::order;
    use crate::resource::{DiscoverySource, TrackedResource};
    use crate::tags::Tags;
    use std::time::Duration;

    const SG: &str = "arn:aws:ec2:us-east-1:111122223333:security-group/sg-1";

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
            max_elapsed: None,
        }
    }

    fn delete_step(id: &str) -> GcStep {
        let resource = TrackedResource::new(GcTaskKind::SecurityGroup, id, Tags::new(), DiscoverySource::Poll);
        order(&[resource])
            .into_iter()
            .flat_map(|b| b.steps)
            .find(|s| s.action() == StepAction::Delete)
            .unwrap()
    }

    fn deleter(mock: MockCloudApi) -> Deleter {
        Deleter::new(Arc::new(mock), fast_retry(), Some("111122223333".into()))
    }

    #[tokio::test]
    async fn second_execute_makes_no_cloud_call() {
        let mut mock = MockCloudApi::new();
        mock.expect_delete().times(1).returning(|_, _| Ok(()));
        let deleter = deleter(mock);
        let step = delete_step(SG);

        let first = deleter.execute(&step).await;
        let second = deleter.execute(&step).await;

        assert_eq!(first.outcome, DeletionOutcome::Deleted);
        assert_eq!(second.outcome, DeletionOutcome::Deleted);
        assert!(second.cached);
    }

    #[tokio::test]
    async fn not_found_is_success() {
        let mut mock = MockCloudApi::new();
        mock.expect_delete()
            .times(1)
            .returning(|_, _| Err(CloudError::not_found("InvalidGroup.NotFound")));
        let report = deleter(mock).execute(&delete_step(SG)).await;
        assert_eq!(report.outcome, DeletionOutcome::NotFound);
        assert!(report.outcome.is_success());
    }

    #[tokio::test]
    async fn dependency_violation_is_retried_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut mock = MockCloudApi::new();
        mock.expect_delete().times(2).returning(move |_, _| {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(CloudError::from_aws("DependencyViolation", "in use"))
            } else {
                Ok(())
            }
        });
        let report = deleter(mock).execute(&delete_step(SG)).await;
        assert_eq!(report.outcome, DeletionOutcome::Deleted);
        assert_eq!(report.attempt.attempts, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_are_retryable_with_next_time() {
        let mut mock = MockCloudApi::new();
        mock.expect_delete()
            .times(3)
            .returning(|_, _| Err(CloudError::throttled("Throttling")));
        let report = deleter(mock).execute(&delete_step(SG)).await;
        assert!(matches!(report.outcome, DeletionOutcome::Retryable(_)));
        assert_eq!(report.attempt.attempts, 3);
        assert_eq!(report.attempt.last_error, Some(CloudErrorKind::Throttling));
        assert!(report.attempt.next_retry_at.is_some());
    }

    #[tokio::test]
    async fn permission_denied_stops_immediately() {
        let mut mock = MockCloudApi::new();
        mock.expect_delete()
            .times(1)
            .returning(|_, _| Err(CloudError::from_aws("UnauthorizedOperation", "no")));
        let deleter = deleter(mock);
        let step = delete_step(SG);
        let report = deleter.execute(&step).await;
        assert!(matches!(report.outcome, DeletionOutcome::Fatal(_)));
        assert_eq!(report.attempt.attempts, 1);
        assert!(report.attempt.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn foreign_account_is_never_called() {
        let mut mock = MockCloudApi::new();
        mock.expect_delete().never();
        let report = deleter(mock)
            .execute(&delete_step("arn:aws:ec2:us-east-1:999999999999:security-group/sg-1"))
            .await;
        match report.outcome {
            DeletionOutcome::Fatal(e) => assert_eq!(e.kind, CloudErrorKind::AccountMismatch),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(report.attempt.attempts, 0);
    }

    #[tokio::test]
    async fn preparation_steps_use_their_own_calls() {
        let mut mock = MockCloudApi::new();
        mock.expect_revoke_references()
            .withf(|id| id == SG)
            .times(1)
            .returning(|_| Ok(()));
        let resource = TrackedResource::new(GcTaskKind::SecurityGroup, SG, Tags::new(), DiscoverySource::Poll);
        let step = order(&[resource]).remove(0).steps.remove(0);
        assert_eq!(step.action(), StepAction::RevokeReferences);
        assert!(deleter(mock).execute(&step).await.outcome.is_success());
    }
}
