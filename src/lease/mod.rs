//! Lease tracking and recycling for CodeServers
//!
//! Every successful reconciliation emits a [`LeaseEvent`]. The [`LeaseTracker`]
//! task is the only owner of the lease registry: it applies events as they
//! arrive and, on a fixed tick, recycles every CodeServer whose lease has run
//! out by adding a `ServerRecycled` condition. The reconciler picks that
//! condition up on its next pass and tears the children down.
//!
//! Extensions are additive. An entry created at `t0` with lease `L` that
//! receives an extend event for `D` seconds expires once `now - t0 > L + D`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::controller::KubeClient;
use crate::crd::{CodeServer, Condition, ConditionType};
use crate::Error;

/// Reason recorded on the condition written when a lease runs out
pub const RECYCLED_REASON: &str = "the resource has expired.";

/// Namespace + name of a CodeServer
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// Namespace of the CodeServer
    pub namespace: String,
    /// Name of the CodeServer
    pub name: String,
}

impl ResourceKey {
    /// Create a key from its parts
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an existing CodeServer object
    pub fn from_resource(cs: &CodeServer) -> Result<Self, Error> {
        let name = cs.name_any();
        let namespace = cs
            .namespace()
            .ok_or_else(|| Error::validation(format!("CodeServer {} has no namespace", name)))?;
        Ok(Self { namespace, name })
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Lifecycle event sent by the reconciler after each successful pass
#[derive(Clone, Debug, PartialEq)]
pub struct LeaseEvent {
    /// CodeServer the event belongs to
    pub key: ResourceKey,
    /// Lease duration carried by the event
    pub lease_seconds: i64,
    /// When the event was produced
    pub timestamp: DateTime<Utc>,
    /// Whether the duration extends an existing lease
    pub extend: bool,
}

/// Registry entry for a single CodeServer
#[derive(Clone, Debug, PartialEq)]
pub struct LeaseEntry {
    /// CodeServer the lease belongs to
    pub key: ResourceKey,
    /// Accumulated lease in seconds
    pub lease_seconds: i64,
    /// Start of the lease; extensions never move it
    pub started_at: DateTime<Utc>,
    /// Extend flag of the event that created the entry
    pub extend: bool,
    /// Failed recycle attempts so far
    pub failed_attempts: u32,
}

impl LeaseEntry {
    fn from_event(event: LeaseEvent) -> Self {
        Self {
            key: event.key,
            lease_seconds: event.lease_seconds,
            started_at: event.timestamp,
            extend: event.extend,
            failed_attempts: 0,
        }
    }

    /// Point in time after which the lease counts as expired
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        chrono::Duration::try_seconds(self.lease_seconds)
            .and_then(|lease| self.started_at.checked_add_signed(lease))
    }

    /// True once strictly more than `lease_seconds` have elapsed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let elapsed_ms = now.signed_duration_since(self.started_at).num_milliseconds();
        elapsed_ms > self.lease_seconds.saturating_mul(1000)
    }
}

/// What applying an event did to the registry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// First event for this CodeServer; a new entry was created
    Inserted,
    /// Existing entry was extended to the given accumulated lease
    Extended {
        /// Accumulated lease after the extension
        lease_seconds: i64,
    },
    /// Existing entry left as it was (event without the extend flag)
    Unchanged,
}

/// Lease entries keyed by CodeServer
#[derive(Debug, Default)]
pub struct LeaseRegistry {
    entries: HashMap<ResourceKey, LeaseEntry>,
}

impl LeaseRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an event
    pub fn record(&mut self, event: LeaseEvent) -> LeaseOutcome {
        match self.entries.get_mut(&event.key) {
            Some(entry) if event.extend => {
                entry.lease_seconds = entry.lease_seconds.saturating_add(event.lease_seconds);
                LeaseOutcome::Extended {
                    lease_seconds: entry.lease_seconds,
                }
            }
            Some(_) => LeaseOutcome::Unchanged,
            None => {
                self.entries
                    .insert(event.key.clone(), LeaseEntry::from_event(event));
                LeaseOutcome::Inserted
            }
        }
    }

    /// Keys whose lease has expired at `now`, in stable order
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<ResourceKey> {
        let mut keys: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Look up an entry
    pub fn get(&self, key: &ResourceKey) -> Option<&LeaseEntry> {
        self.entries.get(key)
    }

    /// Remove an entry
    pub fn remove(&mut self, key: &ResourceKey) -> Option<LeaseEntry> {
        self.entries.remove(key)
    }

    /// Count a failed recycle attempt and return the new total
    pub fn record_failure(&mut self, key: &ResourceKey) -> u32 {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.failed_attempts = entry.failed_attempts.saturating_add(1);
                entry.failed_attempts
            }
            None => 0,
        }
    }

    /// Number of tracked leases
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no leases are tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Event channel
// =============================================================================

/// Producer half of the lease channel, cloned into the controller context
///
/// Sending never blocks: when the tracker falls behind and the buffer is full
/// the event is dropped with a warning. The next reconciliation of the same
/// CodeServer emits a fresh event.
#[derive(Clone, Debug)]
pub struct LeaseSender {
    tx: mpsc::Sender<LeaseEvent>,
}

impl LeaseSender {
    /// Queue an event for the tracker; returns false if it was dropped
    pub fn send(&self, event: LeaseEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(code_server = %event.key, "lease channel full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!(code_server = %event.key, "lease tracker stopped, dropping event");
                false
            }
        }
    }
}

/// Create a bounded lease channel
pub fn channel(capacity: usize) -> (LeaseSender, mpsc::Receiver<LeaseEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (LeaseSender { tx }, rx)
}

// =============================================================================
// Tracker
// =============================================================================

/// Tuning for the lease tracker
#[derive(Clone, Debug)]
pub struct TrackerConfig {
    /// Time between sweeps
    pub sweep_interval: Duration,
    /// Recycle attempts per entry before it is dropped
    pub max_recycle_attempts: u32,
    /// Buffer size of the lease channel
    pub channel_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(3),
            max_recycle_attempts: 3,
            channel_capacity: 1024,
        }
    }
}

/// Result of recycling a single CodeServer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecycleOutcome {
    /// ServerRecycled was written
    Recycled,
    /// The condition was already present; nothing written
    AlreadyRecycled,
    /// The CodeServer no longer exists
    Gone,
}

/// Background task owning the lease registry
pub struct LeaseTracker {
    kube: Arc<dyn KubeClient>,
    events: mpsc::Receiver<LeaseEvent>,
    registry: LeaseRegistry,
    config: TrackerConfig,
}

impl LeaseTracker {
    /// Create a tracker reading from `events`
    pub fn new(
        kube: Arc<dyn KubeClient>,
        events: mpsc::Receiver<LeaseEvent>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            kube,
            events,
            registry: LeaseRegistry::new(),
            config,
        }
    }

    /// Read-only view of the registry
    pub fn registry(&self) -> &LeaseRegistry {
        &self.registry
    }

    /// Run until every [`LeaseSender`] has been dropped
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = self.config.sweep_interval.as_millis() as u64,
            "lease tracker started"
        );

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => {
                        self.ingest(event);
                    }
                    None => {
                        info!("lease channel closed, stopping tracker");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.sweep(Utc::now()).await;
                }
            }
        }
    }

    /// Apply a single event to the registry
    pub fn ingest(&mut self, event: LeaseEvent) -> LeaseOutcome {
        let key = event.key.clone();
        let added = event.lease_seconds;
        let outcome = self.registry.record(event);
        match outcome {
            LeaseOutcome::Inserted => {
                if let Some(entry) = self.registry.get(&key) {
                    info!(
                        code_server = %key,
                        lease_seconds = entry.lease_seconds,
                        expires_at = ?entry.expires_at(),
                        "lease started"
                    );
                }
            }
            LeaseOutcome::Extended { lease_seconds } => {
                info!(
                    code_server = %key,
                    added_seconds = added,
                    lease_seconds,
                    "lease extended"
                );
            }
            LeaseOutcome::Unchanged => {
                debug!(code_server = %key, "lease already tracked, not extending");
            }
        }
        outcome
    }

    /// Recycle every expired entry; returns the keys removed from the registry
    pub async fn sweep(&mut self, now: DateTime<Utc>) -> Vec<ResourceKey> {
        let mut removed = Vec::new();

        for key in self.registry.expired(now) {
            match self.recycle(&key).await {
                Ok(outcome) => {
                    info!(code_server = %key, ?outcome, "lease expired");
                    self.registry.remove(&key);
                    removed.push(key);
                }
                Err(e) => {
                    let attempts = self.registry.record_failure(&key);
                    if attempts >= self.config.max_recycle_attempts {
                        error!(
                            code_server = %key,
                            error = %e,
                            attempts,
                            "failed to recycle expired lease, giving up"
                        );
                        self.registry.remove(&key);
                        removed.push(key);
                    } else {
                        warn!(
                            code_server = %key,
                            error = %e,
                            attempts,
                            "failed to recycle expired lease, will retry"
                        );
                    }
                }
            }
        }

        removed
    }

    async fn recycle(&self, key: &ResourceKey) -> Result<RecycleOutcome, Error> {
        let Some(mut cs) = self
            .kube
            .get_code_server(&key.namespace, &key.name)
            .await?
        else {
            return Ok(RecycleOutcome::Gone);
        };

        let mut status = cs.status.take().unwrap_or_default();
        if !status.add_if_absent(Condition::new(ConditionType::Recycled, RECYCLED_REASON)) {
            return Ok(RecycleOutcome::AlreadyRecycled);
        }
        cs.status = Some(status);
        self.kube.replace_code_server_status(&cs).await?;
        Ok(RecycleOutcome::Recycled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::MockKubeClient;
    use crate::crd::{CodeServerSpec, CodeServerStatus};
    use std::sync::Mutex;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn key() -> ResourceKey {
        ResourceKey::new("dev", "ide")
    }

    fn event(at: i64, lease: i64, extend: bool) -> LeaseEvent {
        LeaseEvent {
            key: key(),
            lease_seconds: lease,
            timestamp: t(at),
            extend,
        }
    }

    fn code_server() -> CodeServer {
        let mut cs = CodeServer::new(
            "ide",
            CodeServerSpec {
                image: "codeserver:v1".to_string(),
                name: None,
                recycle_after_seconds: Some(5),
                inactive_after_seconds: None,
                add: false,
                envs: vec![],
                runtime: Default::default(),
            },
        );
        cs.metadata.namespace = Some("dev".to_string());
        cs
    }

    fn kube_error() -> Error {
        Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "etcd timeout".to_string(),
            reason: "InternalError".to_string(),
            code: 500,
        }))
    }

    fn tracker(kube: MockKubeClient) -> (LeaseTracker, LeaseSender) {
        let (tx, rx) = channel(8);
        (
            LeaseTracker::new(Arc::new(kube), rx, TrackerConfig::default()),
            tx,
        )
    }

    mod registry {
        use super::*;

        #[test]
        fn test_first_event_inserts() {
            let mut registry = LeaseRegistry::new();
            assert_eq!(registry.record(event(0, 5, false)), LeaseOutcome::Inserted);

            let entry = registry.get(&key()).unwrap();
            assert_eq!(entry.lease_seconds, 5);
            assert_eq!(entry.started_at, t(0));
            assert_eq!(registry.len(), 1);
        }

        /// Story: an extension adds time without restarting the clock
        ///
        /// Three seconds into a five second lease the user asks for ten more.
        /// The lease becomes fifteen seconds measured from the original start.
        #[test]
        fn story_extension_is_additive() {
            let mut registry = LeaseRegistry::new();
            registry.record(event(0, 5, false));

            let outcome = registry.record(event(3, 10, true));

            assert_eq!(outcome, LeaseOutcome::Extended { lease_seconds: 15 });
            let entry = registry.get(&key()).unwrap();
            assert_eq!(entry.started_at, t(0));
            assert!(!entry.is_expired(t(13)));
            assert!(!entry.is_expired(t(15)));
            assert!(entry.is_expired(t(16)));
        }

        /// Story: repeated reconciles without the extend flag are harmless
        #[test]
        fn story_non_extending_event_is_a_no_op() {
            let mut registry = LeaseRegistry::new();
            registry.record(event(0, 5, false));

            assert_eq!(registry.record(event(2, 100, false)), LeaseOutcome::Unchanged);

            let entry = registry.get(&key()).unwrap();
            assert_eq!(entry.lease_seconds, 5);
            assert_eq!(entry.started_at, t(0));
        }

        #[test]
        fn test_expiry_is_strict() {
            let mut registry = LeaseRegistry::new();
            registry.record(event(0, 5, false));

            assert!(registry.expired(t(4)).is_empty());
            assert!(registry.expired(t(5)).is_empty());
            assert_eq!(registry.expired(t(6)), vec![key()]);
        }

        #[test]
        fn test_expired_keys_are_sorted() {
            let mut registry = LeaseRegistry::new();
            for name in ["zeta", "alpha", "mid"] {
                registry.record(LeaseEvent {
                    key: ResourceKey::new("dev", name),
                    lease_seconds: 1,
                    timestamp: t(0),
                    extend: false,
                });
            }

            let names: Vec<_> = registry
                .expired(t(10))
                .into_iter()
                .map(|k| k.name)
                .collect();
            assert_eq!(names, vec!["alpha", "mid", "zeta"]);
        }

        #[test]
        fn test_record_failure_counts_per_entry() {
            let mut registry = LeaseRegistry::new();
            registry.record(event(0, 5, false));

            assert_eq!(registry.record_failure(&key()), 1);
            assert_eq!(registry.record_failure(&key()), 2);
            assert_eq!(registry.record_failure(&ResourceKey::new("dev", "other")), 0);
        }

        #[test]
        fn test_key_display() {
            assert_eq!(key().to_string(), "dev/ide");
        }
    }

    mod sender {
        use super::*;

        #[tokio::test]
        async fn test_full_channel_drops_instead_of_blocking() {
            let (tx, mut rx) = channel(1);

            assert!(tx.send(event(0, 5, false)));
            assert!(!tx.send(event(1, 5, true)));

            assert_eq!(rx.recv().await, Some(event(0, 5, false)));
        }

        #[tokio::test]
        async fn test_closed_channel_reports_drop() {
            let (tx, rx) = channel(4);
            drop(rx);
            assert!(!tx.send(event(0, 5, false)));
        }
    }

    mod sweep {
        use super::*;

        /// Story: nothing happens while the lease is still running
        #[tokio::test]
        async fn story_sweep_before_expiry_does_nothing() {
            let kube = MockKubeClient::new();
            let (mut tracker, _tx) = tracker(kube);
            tracker.ingest(event(0, 5, false));

            let removed = tracker.sweep(t(5)).await;

            assert!(removed.is_empty());
            assert_eq!(tracker.registry().len(), 1);
        }

        /// Story: an expired lease marks the CodeServer Recycled
        #[tokio::test]
        async fn story_expired_lease_is_recycled() {
            let written = Arc::new(Mutex::new(Vec::<CodeServerStatus>::new()));
            let written_clone = written.clone();

            let mut kube = MockKubeClient::new();
            kube.expect_get_code_server()
                .returning(|_, _| Ok(Some(code_server())));
            kube.expect_replace_code_server_status()
                .times(1)
                .returning(move |cs| {
                    written_clone
                        .lock()
                        .unwrap()
                        .push(cs.status.clone().unwrap_or_default());
                    Ok(())
                });

            let (mut tracker, _tx) = tracker(kube);
            tracker.ingest(event(0, 5, false));

            let removed = tracker.sweep(t(6)).await;

            assert_eq!(removed, vec![key()]);
            assert!(tracker.registry().is_empty());
            let written = written.lock().unwrap();
            assert!(written[0].has_true(ConditionType::Recycled));
            assert_eq!(written[0].conditions[0].reason, RECYCLED_REASON);
        }

        #[tokio::test]
        async fn test_already_recycled_is_not_rewritten() {
            let mut kube = MockKubeClient::new();
            kube.expect_get_code_server().returning(|_, _| {
                let mut cs = code_server();
                cs.status = Some(
                    CodeServerStatus::default()
                        .condition(Condition::new(ConditionType::Recycled, RECYCLED_REASON)),
                );
                Ok(Some(cs))
            });
            kube.expect_replace_code_server_status().never();

            let (mut tracker, _tx) = tracker(kube);
            tracker.ingest(event(0, 5, false));

            assert_eq!(tracker.sweep(t(6)).await, vec![key()]);
        }

        /// Story: a CodeServer deleted by the user simply leaves the registry
        #[tokio::test]
        async fn story_deleted_code_server_is_forgotten() {
            let mut kube = MockKubeClient::new();
            kube.expect_get_code_server().returning(|_, _| Ok(None));
            kube.expect_replace_code_server_status().never();

            let (mut tracker, _tx) = tracker(kube);
            tracker.ingest(event(0, 5, false));

            assert_eq!(tracker.sweep(t(6)).await, vec![key()]);
            assert!(tracker.registry().is_empty());
        }

        /// Story: a flaky API server gets a bounded number of retries
        ///
        /// The entry stays in the registry after a failed fetch and is retried
        /// on later sweeps, then dropped once the attempt budget is spent.
        #[tokio::test]
        async fn story_fetch_failures_are_retried_then_dropped() {
            let mut kube = MockKubeClient::new();
            kube.expect_get_code_server()
                .times(3)
                .returning(|_, _| Err(kube_error()));

            let (mut tracker, _tx) = tracker(kube);
            tracker.ingest(event(0, 5, false));

            assert!(tracker.sweep(t(6)).await.is_empty());
            assert_eq!(tracker.registry().get(&key()).unwrap().failed_attempts, 1);
            assert!(tracker.sweep(t(9)).await.is_empty());
            assert_eq!(tracker.sweep(t(12)).await, vec![key()]);
            assert!(tracker.registry().is_empty());
        }

        #[tokio::test]
        async fn test_persist_failure_keeps_entry_for_next_sweep() {
            let mut kube = MockKubeClient::new();
            kube.expect_get_code_server()
                .returning(|_, _| Ok(Some(code_server())));
            let mut calls = 0;
            kube.expect_replace_code_server_status()
                .times(2)
                .returning(move |_| {
                    calls += 1;
                    if calls == 1 {
                        Err(Error::conflict("stale resourceVersion"))
                    } else {
                        Ok(())
                    }
                });

            let (mut tracker, _tx) = tracker(kube);
            tracker.ingest(event(0, 5, false));

            assert!(tracker.sweep(t(6)).await.is_empty());
            assert_eq!(tracker.sweep(t(9)).await, vec![key()]);
        }

        #[tokio::test]
        async fn test_one_failure_does_not_block_other_entries() {
            let mut kube = MockKubeClient::new();
            kube.expect_get_code_server().returning(|_, name| {
                if name == "broken" {
                    Err(kube_error())
                } else {
                    let mut cs = code_server();
                    cs.metadata.name = Some(name.to_string());
                    Ok(Some(cs))
                }
            });
            kube.expect_replace_code_server_status()
                .times(1)
                .returning(|_| Ok(()));

            let (mut tracker, _tx) = tracker(kube);
            for name in ["broken", "healthy"] {
                tracker.ingest(LeaseEvent {
                    key: ResourceKey::new("dev", name),
                    lease_seconds: 5,
                    timestamp: t(0),
                    extend: false,
                });
            }

            let removed = tracker.sweep(t(6)).await;

            assert_eq!(removed, vec![ResourceKey::new("dev", "healthy")]);
            assert!(tracker
                .registry()
                .get(&ResourceKey::new("dev", "broken"))
                .is_some());
        }
    }

    mod run_loop {
        use super::*;

        /// Story: the running tracker picks up events and recycles on its tick
        #[tokio::test]
        async fn story_run_loop_recycles_and_stops_when_senders_drop() {
            let (done_tx, mut done_rx) = mpsc::unbounded_channel::<CodeServer>();

            let mut kube = MockKubeClient::new();
            kube.expect_get_code_server()
                .returning(|_, _| Ok(Some(code_server())));
            kube.expect_replace_code_server_status()
                .returning(move |cs| {
                    let _ = done_tx.send(cs.clone());
                    Ok(())
                });

            let (tx, rx) = channel(8);
            let config = TrackerConfig {
                sweep_interval: Duration::from_millis(10),
                ..Default::default()
            };
            let handle = tokio::spawn(LeaseTracker::new(Arc::new(kube), rx, config).run());

            // Started a minute ago with a five second lease
            assert!(tx.send(LeaseEvent {
                key: key(),
                lease_seconds: 5,
                timestamp: Utc::now() - chrono::Duration::seconds(60),
                extend: false,
            }));

            let recycled = tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
                .await
                .expect("tracker should recycle within the timeout")
                .expect("status should be written");
            assert!(recycled.has_condition(ConditionType::Recycled));

            drop(tx);
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("tracker should stop once senders are gone")
                .unwrap();
        }
    }
}
