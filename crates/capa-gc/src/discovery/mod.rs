//! Resource discovery
//!
//! Both strategies answer the same question (which resources of the enabled
//! kinds carry this cluster's ownership key) and return the same
//! [`DiscoveryReport`]. They are conservative: a strategy may miss a resource
//! and leave it for the next reconcile, but it never reports one that does not
//! carry the cluster key.

pub mod events;
pub mod polling;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[cfg(test)]
use mockall::automock;

use crate::resource::TrackedResource;
use crate::tasks::{GcTaskKind, GcTaskSet};
use crate::Result;

pub use events::{
    ChannelEventSource, EventAction, EventApplied, EventDrivenDiscoverer, EventIngestor, EventSource,
    InventoryReader, ResourceEvent, ResyncHandle, ResyncSnapshot,
};
pub use polling::PollingDiscoverer;

/// Discovery strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryStrategy {
    /// Paginated tag-filtered list calls on every reconcile
    #[default]
    Polling,
    /// Lookups in an inventory maintained from lifecycle events
    EventDriven,
}

impl DiscoveryStrategy {
    /// Stable label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Polling => "polling",
            Self::EventDriven => "event-driven",
        }
    }
}

impl fmt::Display for DiscoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candidates found for one cluster
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Candidates per requested kind; kinds that failed are absent
    pub resources: BTreeMap<GcTaskKind, Vec<TrackedResource>>,
    /// Kinds whose discovery failed, with the error message
    pub failed: BTreeMap<GcTaskKind, String>,
    /// Whether an event-driven lookup was answered by polling
    pub fell_back: bool,
}

impl DiscoveryReport {
    /// Every candidate, in kind order
    pub fn all(&self) -> impl Iterator<Item = &TrackedResource> {
        self.resources.values().flatten()
    }

    /// Total number of candidates
    pub fn len(&self) -> usize {
        self.resources.values().map(Vec::len).sum()
    }

    /// Whether no candidate was found
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every candidate out of the report
    pub fn into_resources(self) -> Vec<TrackedResource> {
        self.resources.into_values().flatten().collect()
    }
}

/// Finds the candidate resources of a cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceDiscoverer: Send + Sync {
    /// Discover candidates of every kind in `tasks` tagged for `cluster_id`
    ///
    /// Per-kind failures are reported in [`DiscoveryReport::failed`]; the
    /// call itself only fails when cancelled.
    async fn discover(
        &self,
        cluster_id: &str,
        tasks: &GcTaskSet,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryReport>;

    /// Strategy this discoverer implements
    fn strategy(&self) -> DiscoveryStrategy;

    /// Record provider IDs a run confirmed gone
    ///
    /// Discoverers that serve from a cache drop them so later runs stop
    /// returning them when the matching deletion event never arrives.
    fn confirm_absent(&self, _provider_ids: &BTreeSet<String>) {}
}

/// Cluster-wide strategy switch, read at the start of every reconcile
///
/// Clones share the same switch.
#[derive(Clone, Debug, Default)]
pub struct StrategySelector(Arc<AtomicU8>);

impl StrategySelector {
    /// Create a switch set to `strategy`
    pub fn new(strategy: DiscoveryStrategy) -> Self {
        Self(Arc::new(AtomicU8::new(encode(strategy))))
    }

    /// Current strategy
    pub fn get(&self) -> DiscoveryStrategy {
        match self.0.load(Ordering::Acquire) {
            1 => DiscoveryStrategy::EventDriven,
            _ => DiscoveryStrategy::Polling,
        }
    }

    /// Switch strategy; takes effect on the next reconcile
    pub fn set(&self, strategy: DiscoveryStrategy) {
        self.0.store(encode(strategy), Ordering::Release);
    }
}

fn encode(strategy: DiscoveryStrategy) -> u8 {
    match strategy {
        DiscoveryStrategy::Polling => 0,
        DiscoveryStrategy::EventDriven => 1,
    }
}
