//! Usage registry: which volume usages this manager has staged or published.
//!
//! Each [`UsageKey`] maps to its own [`UsageRecord`] behind an async mutex.
//! The outer map lock is only held long enough to find or insert an entry,
//! so operations on different usages never wait on one another, while every
//! mutation of one usage (staging, reference counts, state transitions) is
//! totally ordered by that usage's lock.
//!
//! A failed stage is remembered on the record together with a generation
//! number. Callers that were already queued on the lock when it failed get
//! the same error back instead of staging again; later callers retry.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

use crate::context::{OpContext, Step};
use crate::error::{Result, VolumeError};
use crate::metrics;
use crate::types::UsageKey;

/// Lifecycle state of a usage on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageState {
    /// Nothing staged (or the plugin does not stage).
    Unstaged,
    /// Staged and available for publishing.
    Staged,
    /// Published to at least one allocation.
    Published,
    /// Last consumer unpublished; unstaging has not completed yet.
    Unpublished,
}

/// Per-usage bookkeeping. Only reachable through a held usage lock.
#[derive(Debug)]
pub struct UsageRecord {
    staging_path: Option<PathBuf>,
    state: UsageState,
    claims: HashSet<String>,
    removed: bool,
    stage_failures: Arc<AtomicU64>,
    last_stage_failure: Option<(u64, VolumeError)>,
}

impl UsageRecord {
    fn new(stage_failures: Arc<AtomicU64>) -> Self {
        Self {
            staging_path: None,
            state: UsageState::Unstaged,
            claims: HashSet::new(),
            removed: false,
            stage_failures,
            last_stage_failure: None,
        }
    }

    pub fn state(&self) -> UsageState {
        self.state
    }

    pub fn staging_path(&self) -> Option<&Path> {
        self.staging_path.as_deref()
    }

    pub fn ref_count(&self) -> usize {
        self.claims.len()
    }

    pub fn has_claim(&self, alloc_id: &str) -> bool {
        self.claims.contains(alloc_id)
    }

    /// Staged usages (published or not) can be published without staging again.
    pub fn is_staged(&self) -> bool {
        matches!(self.state, UsageState::Staged | UsageState::Published)
    }

    /// Nothing staged and nobody holding a claim.
    pub fn is_idle(&self) -> bool {
        self.state == UsageState::Unstaged && self.claims.is_empty()
    }

    pub fn mark_staged(&mut self, staging_path: PathBuf) {
        self.staging_path = Some(staging_path);
        self.state = UsageState::Staged;
        self.last_stage_failure = None;
    }

    /// Remember a failed stage for the callers queued behind this one.
    /// A caller giving up (cancelled or out of time) is not recorded.
    pub fn record_stage_failure(&mut self, error: &VolumeError) {
        if matches!(
            error,
            VolumeError::Cancelled { .. } | VolumeError::DeadlineExceeded { .. }
        ) {
            return;
        }
        let generation = self.stage_failures.fetch_add(1, Ordering::SeqCst) + 1;
        self.last_stage_failure = Some((generation, error.clone()));
    }

    /// The stage failure recorded after generation `seen`, if any.
    fn stage_failure_since(&self, seen: u64) -> Option<VolumeError> {
        match &self.last_stage_failure {
            Some((generation, error)) if *generation > seen => Some(error.clone()),
            _ => None,
        }
    }

    /// Add an allocation's claim; returns the resulting count.
    /// Claiming twice for the same allocation counts once.
    pub fn increment_ref(&mut self, alloc_id: &str) -> usize {
        self.claims.insert(alloc_id.to_string());
        self.claims.len()
    }

    /// Drop an allocation's claim; returns the post-decrement count.
    pub fn decrement_ref(&mut self, alloc_id: &str) -> usize {
        self.claims.remove(alloc_id);
        if self.claims.is_empty() && self.state == UsageState::Published {
            self.state = if self.staging_path.is_some() {
                UsageState::Staged
            } else {
                UsageState::Unstaged
            };
        }
        self.claims.len()
    }

    pub fn mark_published(&mut self) {
        self.state = UsageState::Published;
    }

    pub fn mark_unpublished(&mut self) {
        self.state = UsageState::Unpublished;
    }

    pub fn mark_unstaged(&mut self) {
        self.staging_path = None;
        self.state = UsageState::Unstaged;
    }
}

/// Exclusive handle on one usage's record.
pub type UsageGuard = OwnedMutexGuard<UsageRecord>;

#[derive(Debug, Clone)]
struct Entry {
    record: Arc<AsyncMutex<UsageRecord>>,
    stage_failures: Arc<AtomicU64>,
}

impl Entry {
    fn new() -> Self {
        let stage_failures = Arc::new(AtomicU64::new(0));
        Self {
            record: Arc::new(AsyncMutex::new(UsageRecord::new(stage_failures.clone()))),
            stage_failures,
        }
    }
}

/// Thread-safe map from usage key to record.
#[derive(Debug, Default)]
pub struct UsageRegistry {
    usages: Mutex<HashMap<UsageKey, Entry>>,
}

impl UsageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<UsageKey, Entry>> {
        self.usages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_or_create(&self, key: &UsageKey) -> Entry {
        let mut usages = self.entries();
        let entry = usages
            .entry(key.clone())
            .or_insert_with(|| {
                trace!(usage = %key, "Tracking new volume usage");
                Entry::new()
            })
            .clone();
        metrics::set_tracked_usages(usages.len());
        entry
    }

    fn get(&self, key: &UsageKey) -> Option<Entry> {
        self.entries().get(key).cloned()
    }

    /// Lock the record for `key`, creating it if absent.
    ///
    /// Concurrent callers for the same key queue on the same lock, so the
    /// first one to stage is observed by everyone after it. If that stage
    /// fails, callers that were waiting get its error. Waiting stops when
    /// `ctx` is cancelled or its deadline passes.
    pub async fn acquire(
        &self,
        key: &UsageKey,
        ctx: &OpContext,
        step: Step<'_>,
    ) -> Result<UsageGuard> {
        loop {
            let entry = self.get_or_create(key);
            let seen = entry.stage_failures.load(Ordering::SeqCst);
            let guard = ctx.run(step, entry.record.lock_owned()).await?;
            if let Some(error) = guard.stage_failure_since(seen) {
                return Err(error);
            }
            // Removed while we waited: start over on a fresh record
            if !guard.removed {
                return Ok(guard);
            }
        }
    }

    /// Lock the record for `key` if this manager tracks it, giving up when
    /// `ctx` is cancelled or expires.
    pub async fn acquire_existing(
        &self,
        key: &UsageKey,
        ctx: &OpContext,
        step: Step<'_>,
    ) -> Result<Option<UsageGuard>> {
        loop {
            let Some(entry) = self.get(key) else {
                return Ok(None);
            };
            let guard = ctx.run(step, entry.record.lock_owned()).await?;
            if !guard.removed {
                return Ok(Some(guard));
            }
        }
    }

    /// Lock the record for `key`, creating it if absent, without a way to
    /// give up. For committing work that has already reached the plugin.
    pub async fn lock_or_create(&self, key: &UsageKey) -> UsageGuard {
        loop {
            let guard = self.get_or_create(key).record.lock_owned().await;
            if !guard.removed {
                return guard;
            }
        }
    }

    async fn lock_existing(&self, key: &UsageKey) -> Option<UsageGuard> {
        loop {
            let guard = self.get(key)?.record.lock_owned().await;
            if !guard.removed {
                return Some(guard);
            }
        }
    }

    /// Forget a usage. The caller must hold its lock; waiters on the same
    /// record will retry against a fresh one.
    pub fn remove(&self, key: &UsageKey, record: &mut UsageGuard) {
        record.removed = true;
        let mut usages = self.entries();
        usages.remove(key);
        metrics::set_tracked_usages(usages.len());
        trace!(usage = %key, "Stopped tracking volume usage");
    }

    /// Number of tracked usages.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current state of a usage, `Unstaged` when untracked.
    pub async fn state(&self, key: &UsageKey) -> UsageState {
        match self.lock_existing(key).await {
            Some(record) => record.state(),
            None => UsageState::Unstaged,
        }
    }

    /// Current reference count of a usage, 0 when untracked.
    pub async fn ref_count(&self, key: &UsageKey) -> usize {
        match self.lock_existing(key).await {
            Some(record) => record.ref_count(),
            None => 0,
        }
    }
}
