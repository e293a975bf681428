//! Polling discovery
//!
//! One worker per requested kind pages through the tag-filtered listing.
//! Throttling is retried with backoff; any other error abandons that kind for
//! this reconcile without affecting the others.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{DiscoveryReport, DiscoveryStrategy, ResourceDiscoverer};
use crate::cloud::{CloudApi, CloudError, CloudErrorKind, PageRequest, TagFilter};
use crate::metrics::DiscoveryTimer;
use crate::resource::{DiscoverySource, ResourceArn, TrackedResource};
use crate::retry::{retry_if, RetryConfig};
use crate::tags;
use crate::tasks::{GcTaskKind, GcTaskSet};
use crate::{Error, Result};

/// Upper bound on pages per kind, guarding against a provider that never
/// stops returning continuation tokens
const MAX_PAGES: usize = 10_000;

/// Discovers candidates with live list calls
#[derive(Clone)]
pub struct PollingDiscoverer {
    cloud: Arc<dyn CloudApi>,
    retry: RetryConfig,
    page_size: u32,
}

impl PollingDiscoverer {
    /// Create a polling discoverer
    pub fn new(cloud: Arc<dyn CloudApi>, retry: RetryConfig, page_size: u32) -> Self {
        Self {
            cloud,
            retry,
            page_size,
        }
    }

    /// Page through every `kind` resource tagged for `cluster_id`
    pub async fn discover_kind(
        &self,
        cluster_id: &str,
        kind: GcTaskKind,
    ) -> Result<Vec<TrackedResource>> {
        let timer = DiscoveryTimer::start(kind, DiscoveryStrategy::Polling.as_str());
        let filter = TagFilter::key(tags::cluster_tag_key(cluster_id));
        let operation = format!("list {kind}");

        let mut found = Vec::new();
        let mut seen = HashSet::new();
        let mut token: Option<String> = None;

        for page_number in 0..MAX_PAGES {
            let request = PageRequest {
                token: token.clone(),
                page_size: self.page_size,
            };
            let page = retry_if(
                &self.retry,
                &operation,
                |e: &CloudError| e.kind == CloudErrorKind::Throttling,
                || self.cloud.list_tagged(kind, &filter, request.clone()),
            )
            .await
            .map_err(|e| Error::discovery(kind, Error::cloud(&operation, e).to_string()))?;

            debug!(
                cluster = %cluster_id,
                kind = %kind,
                page = page_number,
                items = page.items.len(),
                "Listed page"
            );

            for item in page.items {
                if !filter.matches(&item.tags) || !belongs_to(kind, &item.provider_id) {
                    continue;
                }
                if !seen.insert(item.provider_id.clone()) {
                    continue;
                }
                found.push(
                    TrackedResource::new(kind, item.provider_id, item.tags, DiscoverySource::Poll)
                        .with_references(item.references),
                );
            }

            match page.next_token {
                Some(next) if token.as_deref() == Some(next.as_str()) => {
                    return Err(Error::discovery(
                        kind,
                        format!("provider repeated continuation token {next:?}"),
                    ));
                }
                Some(next) => token = Some(next),
                None => {
                    timer.complete();
                    return Ok(found);
                }
            }
        }

        Err(Error::discovery(
            kind,
            format!("listing did not finish within {MAX_PAGES} pages"),
        ))
    }
}

/// ARNs of other types (listeners, buckets, ...) are ignored; plain IDs are
/// taken at face value
fn belongs_to(kind: GcTaskKind, provider_id: &str) -> bool {
    match ResourceArn::parse(provider_id) {
        Some(arn) => arn.kind() == Some(kind),
        None => true,
    }
}

#[async_trait]
impl ResourceDiscoverer for PollingDiscoverer {
    async fn discover(
        &self,
        cluster_id: &str,
        tasks: &GcTaskSet,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryReport> {
        let workers = tasks.iter().map(|kind| async move {
            (kind, self.discover_kind(cluster_id, kind).await)
        });

        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled("discovering")),
            results = join_all(workers) => results,
        };

        let mut report = DiscoveryReport {
            resources: BTreeMap::new(),
            failed: BTreeMap::new(),
            fell_back: false,
        };
        for (kind, result) in results {
            match result {
                Ok(found) => {
                    report.resources.insert(kind, found);
                }
                Err(e) => {
                    warn!(cluster = %cluster_id, kind = %kind, error = %e, "Discovery failed");
                    report.failed.insert(kind, e.to_string());
                }
            }
        }
        Ok(report)
    }

    fn strategy(&self) -> DiscoveryStrategy {
        DiscoveryStrategy::Polling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{MockCloudApi, ResourceDescription, ResourcePage};
    use crate::tags::Tags;
    use std::time::Duration;

    const CLUSTER: &str = "foo";

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
            max_elapsed: None,
        }
    }

    fn item(id: &str, pairs: &[(&str, &str)]) -> ResourceDescription {
        ResourceDescription {
            provider_id: id.to_string(),
            tags: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<Tags>(),
            references: Default::default(),
        }
    }

    fn discoverer(mock: MockCloudApi) -> PollingDiscoverer {
        PollingDiscoverer::new(Arc::new(mock), fast_retry(), 2)
    }

    #[tokio::test]
    async fn pages_are_merged_and_rechecked() {
        let mut mock = MockCloudApi::new();
        mock.expect_list_tagged()
            .withf(|kind, filter, page| {
                *kind == GcTaskKind::SecurityGroup
                    && filter.key == "kubernetes.io/cluster/foo"
                    && page.token.is_none()
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(ResourcePage {
                    items: vec![
                        item("sg-1", &[("kubernetes.io/cluster/foo", "owned")]),
                        item("sg-2", &[("kubernetes.io/cluster/foo-bar", "owned")]),
                    ],
                    next_token: Some("p2".into()),
                })
            });
        mock.expect_list_tagged()
            .withf(|_, _, page| page.token.as_deref() == Some("p2"))
            .times(1)
            .returning(|_, _, _| {
                Ok(ResourcePage {
                    items: vec![
                        item("sg-3", &[("kubernetes.io/cluster/foo", "shared")]),
                        item("sg-1", &[("kubernetes.io/cluster/foo", "owned")]),
                    ],
                    next_token: None,
                })
            });

        let found = discoverer(mock)
            .discover_kind(CLUSTER, GcTaskKind::SecurityGroup)
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|r| r.provider_id.as_str()).collect();
        assert_eq!(ids, vec!["sg-1", "sg-3"]);
        assert!(found.iter().all(|r| r.discovered_via == DiscoverySource::Poll));
    }

    #[tokio::test]
    async fn throttling_is_retried() {
        let mut mock = MockCloudApi::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_list_tagged()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(CloudError::throttled("Throttling")));
        mock.expect_list_tagged()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| {
                Ok(ResourcePage {
                    items: vec![item("sg-1", &[("kubernetes.io/cluster/foo", "owned")])],
                    next_token: None,
                })
            });

        let found = discoverer(mock)
            .discover_kind(CLUSTER, GcTaskKind::SecurityGroup)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn failure_of_one_kind_spares_the_others() {
        let mut mock = MockCloudApi::new();
        mock.expect_list_tagged()
            .withf(|kind, _, _| *kind == GcTaskKind::LoadBalancer)
            .returning(|_, _, _| Err(CloudError::from_aws("AccessDenied", "nope")));
        mock.expect_list_tagged()
            .withf(|kind, _, _| *kind == GcTaskKind::SecurityGroup)
            .returning(|_, _, _| {
                Ok(ResourcePage {
                    items: vec![item("sg-1", &[("kubernetes.io/cluster/foo", "owned")])],
                    next_token: None,
                })
            });

        let tasks: GcTaskSet = [GcTaskKind::LoadBalancer, GcTaskKind::SecurityGroup]
            .into_iter()
            .collect();
        let report = discoverer(mock)
            .discover(CLUSTER, &tasks, &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.failed.contains_key(&GcTaskKind::LoadBalancer));
        assert_eq!(report.resources[&GcTaskKind::SecurityGroup].len(), 1);
        assert!(!report.resources.contains_key(&GcTaskKind::LoadBalancer));
    }

    #[tokio::test]
    async fn unhandled_arn_types_are_ignored() {
        let mut mock = MockCloudApi::new();
        mock.expect_list_tagged().returning(|_, _, _| {
            Ok(ResourcePage {
                items: vec![
                    item(
                        "arn:aws:elasticloadbalancing:eu-west-2:1:loadbalancer/app/web/1",
                        &[("kubernetes.io/cluster/foo", "owned")],
                    ),
                    item(
                        "arn:aws:elasticloadbalancing:eu-west-2:1:listener/app/web/1/2",
                        &[("kubernetes.io/cluster/foo", "owned")],
                    ),
                ],
                next_token: None,
            })
        });
        let found = discoverer(mock)
            .discover_kind(CLUSTER, GcTaskKind::LoadBalancer)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn repeated_token_aborts_the_kind() {
        let mut mock = MockCloudApi::new();
        mock.expect_list_tagged().returning(|_, _, _| {
            Ok(ResourcePage {
                items: vec![],
                next_token: Some("same".into()),
            })
        });
        let err = discoverer(mock)
            .discover_kind(CLUSTER, GcTaskKind::TargetGroup)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Discovery { kind: GcTaskKind::TargetGroup, .. }));
    }

    #[tokio::test]
    async fn cancellation_stops_discovery() {
        let mut mock = MockCloudApi::new();
        mock.expect_list_tagged()
            .returning(|_, _, _| Err(CloudError::throttled("Throttling")));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let polling = PollingDiscoverer::new(
            Arc::new(mock),
            RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_secs(60),
                ..fast_retry()
            },
            10,
        );
        let err = polling
            .discover(CLUSTER, &GcTaskSet::all(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
    }
}
