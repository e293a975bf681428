//! Event-driven discovery
//!
//! Resource lifecycle notifications (CloudTrail management events routed
//! through EventBridge and normalised by an input transformer) are folded
//! into an in-memory inventory keyed by provider ID. Discovery then becomes a
//! lookup instead of a scan.
//!
//! The inventory has exactly one writer, the [`EventIngestor`] task. It also
//! applies the [`ResyncSnapshot`]s that discovery sends back after a polling
//! fallback, so every mutation is serialised through one place. Readers take
//! the read side of a `parking_lot::RwLock` and never see a half-applied
//! update.
//!
//! Delivery is at least once and may be out of order:
//! - repeated creations are idempotent upserts
//! - when both the stored entry and the incoming event carry a provider
//!   sequence number, the higher sequence wins
//! - otherwise a deletion is authoritative: it always applies, and a
//!   tombstone discards any creation or tag update that arrives after it
//!
//! Freshness is tracked twice. Stream events advance a single stream clock.
//! A resync only vouches for the cluster and kinds it polled, so it records
//! its own per-cluster, per-kind mark and never makes the stream look alive.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::polling::PollingDiscoverer;
use super::{DiscoveryReport, DiscoveryStrategy, ResourceDiscoverer};
use crate::metrics;
use crate::resource::{DiscoverySource, TrackedResource};
use crate::tags::{self, Tags};
use crate::tasks::{GcTaskKind, GcTaskSet};
use crate::{Error, Result};

/// Capacity of the resync channel; snapshots beyond it are dropped and the
/// next fallback sends a fresh one
const RESYNC_BUFFER: usize = 16;

/// Lifecycle transition reported by an event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventAction {
    /// The resource was created
    Created,
    /// The resource's tags changed; `tags` holds the full new set
    TagsUpdated,
    /// The resource was deleted
    Deleted,
}

/// Normalised lifecycle notification
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEvent {
    /// Delivery identifier, used for logging only
    pub id: String,
    /// What happened
    pub action: EventAction,
    /// Kind of the resource
    pub kind: GcTaskKind,
    /// ARN of the resource
    pub provider_id: String,
    /// Tags after the change
    #[serde(default)]
    pub tags: Tags,
    /// Provider IDs the resource points at
    #[serde(default)]
    pub references: BTreeSet<String>,
    /// Provider-assigned, per-resource monotonic sequence number
    #[serde(default)]
    pub sequence: Option<u64>,
    /// When the provider recorded the change
    pub time: DateTime<Utc>,
}

impl ResourceEvent {
    /// Decode an event payload
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| {
            let id = serde_json::from_str::<serde_json::Value>(raw)
                .ok()
                .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string));
            match id {
                Some(id) => Error::event_for(id, e.to_string()),
                None => Error::event(e.to_string()),
            }
        })
    }
}

/// Fresh poll results handed back to the ingestor
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResyncSnapshot {
    /// Cluster the poll was for
    pub cluster_id: String,
    /// Kinds that were listed successfully
    pub kinds: Vec<GcTaskKind>,
    /// Everything the poll found for those kinds
    pub resources: Vec<TrackedResource>,
}

/// Result of applying one event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventApplied {
    /// The inventory changed
    Applied,
    /// A newer state was already recorded; the event was discarded
    Superseded,
}

#[derive(Clone, Debug)]
enum EntryState {
    Live(TrackedResource),
    Tombstone,
}

#[derive(Clone, Debug)]
struct Entry {
    state: EntryState,
    sequence: Option<u64>,
    recorded_at: Instant,
}

#[derive(Debug, Default)]
struct InventoryState {
    entries: HashMap<String, Entry>,
    last_event: Option<Instant>,
    resynced: HashMap<(String, GcTaskKind), Instant>,
}

impl InventoryState {
    fn live_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e.state, EntryState::Live(_)))
            .count()
    }

    fn apply(&mut self, event: ResourceEvent, now: Instant) -> EventApplied {
        self.last_event = Some(now);

        if let Some(existing) = self.entries.get(&event.provider_id) {
            let superseded = match (existing.sequence, event.sequence) {
                (Some(stored), Some(incoming)) => incoming <= stored,
                _ => {
                    matches!(existing.state, EntryState::Tombstone)
                        && event.action != EventAction::Deleted
                }
            };
            if superseded {
                return EventApplied::Superseded;
            }
        }

        let state = match event.action {
            EventAction::Deleted => EntryState::Tombstone,
            EventAction::Created | EventAction::TagsUpdated => {
                let mut resource = TrackedResource::new(
                    event.kind,
                    event.provider_id.clone(),
                    event.tags,
                    DiscoverySource::Event,
                )
                .with_references(event.references);
                if let Some(Entry {
                    state: EntryState::Live(previous),
                    ..
                }) = self.entries.get(&event.provider_id)
                {
                    resource.first_seen_at = previous.first_seen_at;
                }
                EntryState::Live(resource)
            }
        };

        self.entries.insert(
            event.provider_id,
            Entry {
                state,
                sequence: event.sequence,
                recorded_at: now,
            },
        );
        EventApplied::Applied
    }

    fn resync(&mut self, snapshot: ResyncSnapshot, now: Instant) {
        for kind in &snapshot.kinds {
            self.resynced
                .insert((snapshot.cluster_id.clone(), *kind), now);
        }

        let polled: BTreeSet<&str> = snapshot
            .resources
            .iter()
            .map(|r| r.provider_id.as_str())
            .collect();
        self.entries.retain(|id, entry| match &entry.state {
            EntryState::Live(resource) => {
                polled.contains(id.as_str())
                    || !snapshot.kinds.contains(&resource.kind)
                    || !tags::is_tagged_for(&resource.tags, &snapshot.cluster_id)
            }
            EntryState::Tombstone => true,
        });

        for resource in snapshot.resources {
            match self.entries.get(&resource.provider_id) {
                Some(Entry {
                    state: EntryState::Tombstone,
                    ..
                }) => continue,
                Some(Entry {
                    state: EntryState::Live(existing),
                    sequence,
                    ..
                }) => {
                    let first_seen_at = existing.first_seen_at;
                    let sequence = *sequence;
                    let mut resource = resource;
                    resource.discovered_via = DiscoverySource::Event;
                    resource.first_seen_at = first_seen_at;
                    self.entries.insert(
                        resource.provider_id.clone(),
                        Entry {
                            state: EntryState::Live(resource),
                            sequence,
                            recorded_at: now,
                        },
                    );
                }
                None => {
                    let mut resource = resource;
                    resource.discovered_via = DiscoverySource::Event;
                    self.entries.insert(
                        resource.provider_id.clone(),
                        Entry {
                            state: EntryState::Live(resource),
                            sequence: None,
                            recorded_at: now,
                        },
                    );
                }
            }
        }
    }

    /// Tombstone live entries a direct read found missing
    fn confirm_absent(&mut self, provider_ids: &BTreeSet<String>, now: Instant) -> usize {
        let mut confirmed = 0;
        for id in provider_ids {
            if let Some(entry) = self.entries.get_mut(id) {
                if matches!(entry.state, EntryState::Live(_)) {
                    entry.state = EntryState::Tombstone;
                    entry.recorded_at = now;
                    confirmed += 1;
                }
            }
        }
        confirmed
    }

    fn prune(&mut self, retention: Duration, now: Instant) -> usize {
        self.resynced
            .retain(|_, at| now.saturating_duration_since(*at) < retention);
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            !matches!(entry.state, EntryState::Tombstone)
                || now.saturating_duration_since(entry.recorded_at) < retention
        });
        before - self.entries.len()
    }
}

/// Shared inventory; mutated only through [`EventIngestor`]
#[derive(Debug, Default)]
struct Inventory {
    state: RwLock<InventoryState>,
}

/// Read-only view of the inventory
#[derive(Clone, Debug)]
pub struct InventoryReader {
    inventory: Arc<Inventory>,
}

impl InventoryReader {
    /// Live resources of `kinds` tagged for `cluster_id`
    pub fn lookup(
        &self,
        cluster_id: &str,
        kinds: &GcTaskSet,
    ) -> BTreeMap<GcTaskKind, Vec<TrackedResource>> {
        let state = self.inventory.state.read();
        let mut found: BTreeMap<GcTaskKind, Vec<TrackedResource>> =
            kinds.iter().map(|kind| (kind, Vec::new())).collect();
        for entry in state.entries.values() {
            let EntryState::Live(resource) = &entry.state else {
                continue;
            };
            if !tags::is_tagged_for(&resource.tags, cluster_id) {
                continue;
            }
            if let Some(bucket) = found.get_mut(&resource.kind) {
                bucket.push(resource.clone());
            }
        }
        for bucket in found.values_mut() {
            bucket.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        }
        found
    }

    /// Whether the event stream has delivered nothing within `threshold`, or
    /// ever
    ///
    /// Resyncs do not count; see [`InventoryReader::is_fresh_for`].
    pub fn is_stale(&self, threshold: Duration) -> bool {
        match self.inventory.state.read().last_event {
            Some(at) => at.elapsed() > threshold,
            None => true,
        }
    }

    /// Whether lookups for `cluster_id` and `kinds` can be trusted
    ///
    /// True while the stream is live, or when every kind was resynced for
    /// this cluster within `threshold`. A resync for another cluster says
    /// nothing about this one.
    pub fn is_fresh_for(&self, cluster_id: &str, kinds: &GcTaskSet, threshold: Duration) -> bool {
        let state = self.inventory.state.read();
        let fresh = |at: &Instant| at.elapsed() <= threshold;
        if state.last_event.as_ref().is_some_and(fresh) {
            return true;
        }
        kinds.iter().all(|kind| {
            state
                .resynced
                .get(&(cluster_id.to_string(), kind))
                .is_some_and(fresh)
        })
    }

    /// Whether a live entry exists for the provider ID
    pub fn contains(&self, provider_id: &str) -> bool {
        matches!(
            self.inventory.state.read().entries.get(provider_id),
            Some(Entry {
                state: EntryState::Live(_),
                ..
            })
        )
    }

    /// Number of live resources
    pub fn len(&self) -> usize {
        self.inventory.state.read().live_count()
    }

    /// Whether the inventory holds no live resource
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Corrections discovery hands back to the ingestor
#[derive(Clone, Debug, PartialEq, Eq)]
enum InventoryUpdate {
    Resync(ResyncSnapshot),
    Absent(BTreeSet<String>),
}

/// Sends corrections from discovery back to the ingestor
#[derive(Clone, Debug)]
pub struct ResyncHandle {
    tx: mpsc::Sender<InventoryUpdate>,
}

impl ResyncHandle {
    /// Queue a snapshot without waiting; a full queue drops it
    pub fn send(&self, snapshot: ResyncSnapshot) -> bool {
        self.queue(InventoryUpdate::Resync(snapshot))
    }

    /// Queue provider IDs a direct read found missing; a full queue drops them
    pub fn confirm_absent(&self, provider_ids: BTreeSet<String>) -> bool {
        self.queue(InventoryUpdate::Absent(provider_ids))
    }

    fn queue(&self, update: InventoryUpdate) -> bool {
        match self.tx.try_send(update) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Dropping inventory correction");
                false
            }
        }
    }
}

/// Stream of raw lifecycle notifications
#[async_trait]
pub trait EventSource: Send {
    /// Next payload, or `None` once the stream has ended
    async fn recv(&mut self) -> Option<String>;
}

/// [`EventSource`] fed through an in-process channel
pub struct ChannelEventSource {
    rx: mpsc::Receiver<String>,
}

impl ChannelEventSource {
    /// Create a source and the sender that feeds it
    pub fn new(buffer: usize) -> (mpsc::Sender<String>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// The inventory's single writer
pub struct EventIngestor<S> {
    source: S,
    inventory: Arc<Inventory>,
    resync_rx: mpsc::Receiver<InventoryUpdate>,
    tombstone_retention: Duration,
}

impl<S: EventSource> EventIngestor<S> {
    /// Create an ingestor with an empty inventory
    ///
    /// Returns the ingestor, a reader for discovery, and the handle discovery
    /// uses to send resync snapshots back.
    pub fn new(source: S, tombstone_retention: Duration) -> (Self, InventoryReader, ResyncHandle) {
        let inventory = Arc::new(Inventory::default());
        let (tx, resync_rx) = mpsc::channel(RESYNC_BUFFER);
        let ingestor = Self {
            source,
            inventory: inventory.clone(),
            resync_rx,
            tombstone_retention,
        };
        (ingestor, InventoryReader { inventory }, ResyncHandle { tx })
    }

    /// Decode and apply one payload
    pub fn ingest(&self, raw: &str) -> Result<EventApplied> {
        let event = match ResourceEvent::from_json(raw) {
            Ok(event) => event,
            Err(e) => {
                metrics::record_event("invalid");
                return Err(e);
            }
        };
        let event_id = event.id.clone();
        let provider_id = event.provider_id.clone();
        let action = event.action;

        let (applied, live) = {
            let mut state = self.inventory.state.write();
            let applied = state.apply(event, Instant::now());
            (applied, state.live_count())
        };

        match applied {
            EventApplied::Applied => {
                metrics::record_event("applied");
                debug!(event = %event_id, provider_id = %provider_id, ?action, "Applied event");
            }
            EventApplied::Superseded => {
                metrics::record_event("superseded");
                debug!(event = %event_id, provider_id = %provider_id, ?action, "Discarded superseded event");
            }
        }
        metrics::INVENTORY_SIZE.record(live as i64, &[]);
        Ok(applied)
    }

    /// Apply a resync snapshot
    pub fn apply_resync(&self, snapshot: ResyncSnapshot) {
        let cluster = snapshot.cluster_id.clone();
        let count = snapshot.resources.len();
        let live = {
            let mut state = self.inventory.state.write();
            state.resync(snapshot, Instant::now());
            state.live_count()
        };
        info!(cluster = %cluster, resources = count, "Inventory resynced from poll");
        metrics::INVENTORY_SIZE.record(live as i64, &[]);
    }

    /// Tombstone entries a direct read found missing
    ///
    /// Covers deletions whose event never arrived, so later lookups stop
    /// returning them.
    pub fn apply_absent(&self, provider_ids: &BTreeSet<String>) -> usize {
        let (confirmed, live) = {
            let mut state = self.inventory.state.write();
            let confirmed = state.confirm_absent(provider_ids, Instant::now());
            (confirmed, state.live_count())
        };
        if confirmed > 0 {
            info!(confirmed, "Dropped resources confirmed absent");
            metrics::INVENTORY_SIZE.record(live as i64, &[]);
        }
        confirmed
    }

    /// Drop tombstones older than the retention period
    pub fn prune(&self) -> usize {
        let pruned = self
            .inventory
            .state
            .write()
            .prune(self.tombstone_retention, Instant::now());
        if pruned > 0 {
            debug!(pruned, "Pruned tombstones");
        }
        pruned
    }

    /// Process events and resyncs until cancelled
    ///
    /// When the source ends the ingestor keeps applying resyncs, so discovery
    /// degrades to polling instead of serving an ever older inventory.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut prune = tokio::time::interval(self.tombstone_retention.max(Duration::from_secs(1)));
        let mut source_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Event ingestor stopping");
                    return;
                }
                payload = self.source.recv(), if source_open => match payload {
                    Some(raw) => {
                        if let Err(e) = self.ingest(&raw) {
                            warn!(error = %e, "Discarding undecodable event");
                        }
                    }
                    None => {
                        warn!("Event source closed; inventory will go stale");
                        source_open = false;
                    }
                },
                Some(update) = self.resync_rx.recv() => match update {
                    InventoryUpdate::Resync(snapshot) => self.apply_resync(snapshot),
                    InventoryUpdate::Absent(ids) => {
                        self.apply_absent(&ids);
                    }
                },
                _ = prune.tick() => {
                    self.prune();
                }
            }
        }
    }
}

/// Discovers candidates from the inventory, polling when it is stale
pub struct EventDrivenDiscoverer {
    inventory: InventoryReader,
    resync: ResyncHandle,
    fallback: PollingDiscoverer,
    staleness_threshold: Duration,
}

impl EventDrivenDiscoverer {
    /// Create a discoverer over an ingestor's inventory
    pub fn new(
        inventory: InventoryReader,
        resync: ResyncHandle,
        fallback: PollingDiscoverer,
        staleness_threshold: Duration,
    ) -> Self {
        Self {
            inventory,
            resync,
            fallback,
            staleness_threshold,
        }
    }
}

#[async_trait]
impl ResourceDiscoverer for EventDrivenDiscoverer {
    async fn discover(
        &self,
        cluster_id: &str,
        tasks: &GcTaskSet,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryReport> {
        if cancel.is_cancelled() {
            return Err(Error::cancelled("discovering"));
        }

        if self
            .inventory
            .is_fresh_for(cluster_id, tasks, self.staleness_threshold)
        {
            let timer_kinds: Vec<_> = tasks
                .iter()
                .map(|kind| metrics::DiscoveryTimer::start(kind, DiscoveryStrategy::EventDriven.as_str()))
                .collect();
            let resources = self.inventory.lookup(cluster_id, tasks);
            timer_kinds.into_iter().for_each(metrics::DiscoveryTimer::complete);
            return Ok(DiscoveryReport {
                resources,
                failed: BTreeMap::new(),
                fell_back: false,
            });
        }

        warn!(
            cluster = %cluster_id,
            threshold_secs = self.staleness_threshold.as_secs(),
            "Event inventory is stale, falling back to polling"
        );
        metrics::DISCOVERY_FALLBACKS.add(1, &[]);

        let mut report = self.fallback.discover(cluster_id, tasks, cancel).await?;
        report.fell_back = true;

        let kinds: Vec<_> = report.resources.keys().copied().collect();
        if !kinds.is_empty() {
            self.resync.send(ResyncSnapshot {
                cluster_id: cluster_id.to_string(),
                kinds,
                resources: report.all().cloned().collect(),
            });
        }
        Ok(report)
    }

    fn strategy(&self) -> DiscoveryStrategy {
        DiscoveryStrategy::EventDriven
    }

    fn confirm_absent(&self, provider_ids: &BTreeSet<String>) {
        if !provider_ids.is_empty() {
            self.resync.confirm_absent(provider_ids.clone());
        }
    }
}
