//! The store proper: CAS key-value seam, the in-memory implementation and
//! the read/write protocol over AoR records.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use scscf_sip_core::Request;

use crate::aor::AoR;
use crate::error::{Result, StoreError};
use crate::notify;

/// Outcome of a compare-and-set on the key-value layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// Committed; carries the new token.
    Stored(u64),
    /// The token no longer matched; the caller must re-read and retry.
    Contention,
}

/// Outcome of [`RegStore::set_aor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Written {
        /// True when this write left the record with no live binding and
        /// the record had at least one when it was read.
        all_bindings_expired: bool,
    },
    Contention,
}

/// The key-value seam under the store.  Tokens are opaque, monotonic per
/// key, and `cas == 0` means "create only if absent".
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>>;
    async fn compare_and_set(&self, key: &str, value: Vec<u8>, cas: u64) -> Result<CasOutcome>;
}

/// Sink for outbound NOTIFY requests.  The store builds them; the SIP layer
/// owns delivery.
#[async_trait]
pub trait NotifySink: Send + Sync {
    async fn send_notify(&self, notify: Request);
}

/// Seam to the timer service that pops binding expiries back into the node.
///
/// Both calls are best-effort: a missed timer only delays reaping until the
/// next read-modify-write on the record.
#[async_trait]
pub trait TimerService: Send + Sync {
    /// Set or replace the expiry timer for a binding.  Returns the new
    /// timer id, or `None` when the service is unavailable.
    async fn set_timer(
        &self,
        aor: &str,
        binding_id: &str,
        old_id: Option<&str>,
        pop_at: u64,
    ) -> Option<String>;

    async fn cancel_timer(&self, id: &str);
}

/// A timer service that does nothing.  Single-node deployments rely on
/// reap-on-read instead of timer pops.
pub struct NoopTimerService;

#[async_trait]
impl TimerService for NoopTimerService {
    async fn set_timer(&self, _: &str, _: &str, _: Option<&str>, _: u64) -> Option<String> {
        None
    }

    async fn cancel_timer(&self, _: &str) {}
}

/// In-memory CAS key-value store backed by a concurrent map.
///
/// `set_failed(true)` makes every operation return a connection error,
/// which is how tests exercise the `store_error` paths.
#[derive(Default)]
pub struct MemoryKvStore {
    data: DashMap<String, (Vec<u8>, u64)>,
    next_cas: AtomicU64,
    failed: AtomicBool,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        MemoryKvStore {
            data: DashMap::new(),
            next_cas: AtomicU64::new(1),
            failed: AtomicBool::new(false),
        }
    }

    pub fn set_failed(&self, failed: bool) {
        self.failed.store(failed, Ordering::SeqCst);
    }

    fn check_connection(&self) -> Result<()> {
        if self.failed.load(Ordering::SeqCst) {
            Err(StoreError::Connection("simulated failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        self.check_connection()?;
        Ok(self.data.get(key).map(|e| e.value().clone()))
    }

    async fn compare_and_set(&self, key: &str, value: Vec<u8>, cas: u64) -> Result<CasOutcome> {
        self.check_connection()?;
        match self.data.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                if e.get().1 == cas {
                    let new_cas = self.next_cas.fetch_add(1, Ordering::SeqCst);
                    e.insert((value, new_cas));
                    Ok(CasOutcome::Stored(new_cas))
                } else {
                    Ok(CasOutcome::Contention)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                if cas == 0 {
                    let new_cas = self.next_cas.fetch_add(1, Ordering::SeqCst);
                    v.insert((value, new_cas));
                    Ok(CasOutcome::Stored(new_cas))
                } else {
                    Ok(CasOutcome::Contention)
                }
            }
        }
    }
}

/// The registration store over one key-value deployment, optionally backed
/// by a remote peer used to warm up empty local records.
pub struct RegStore {
    kv: Arc<dyn KvStore>,
    timers: Arc<dyn TimerService>,
    notify_sink: Arc<dyn NotifySink>,
    backup: Option<Arc<RegStore>>,
}

impl RegStore {
    pub fn new(
        kv: Arc<dyn KvStore>,
        timers: Arc<dyn TimerService>,
        notify_sink: Arc<dyn NotifySink>,
    ) -> Self {
        RegStore {
            kv,
            timers,
            notify_sink,
            backup: None,
        }
    }

    pub fn with_backup(mut self, backup: Arc<RegStore>) -> Self {
        self.backup = Some(backup);
        self
    }

    /// Read the record for `aor`.
    ///
    /// A missing record comes back empty with `cas == 0`; the first
    /// successful write establishes it.  Expired bindings are dropped from
    /// the returned view (the removal is committed, with its events, by the
    /// next write).  An empty local record is warmed up from the backup
    /// store when one is configured.
    pub async fn get_aor(&self, aor: &str) -> Result<AoR> {
        let mut record = self.read_record(aor).await?;

        if record.bindings.is_empty() && record.cas == 0 {
            if let Some(backup) = &self.backup {
                match backup.read_record(aor).await {
                    Ok(backup_record) if !backup_record.bindings.is_empty() => {
                        debug!(aor, "warming empty local record from backup store");
                        record.bindings = backup_record.bindings;
                        record.subscriptions = backup_record.subscriptions;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(aor, error = %e, "backup store read failed");
                    }
                }
            }
        }

        Ok(record)
    }

    /// One store's own view of a record, expired entries reaped.
    async fn read_record(&self, aor: &str) -> Result<AoR> {
        let mut record = match self.kv.get(aor).await? {
            Some((bytes, cas)) => {
                let mut record: AoR = serde_json::from_slice(&bytes)?;
                record.cas = cas;
                record
            }
            None => AoR::default(),
        };
        record.had_bindings_at_read = !record.bindings.is_empty();

        let now = now_secs();
        record.expire_bindings(now);
        record.expire_subscriptions(now);
        Ok(record)
    }

    /// Write the record back under its CAS token.
    ///
    /// On success the record's token is updated in place, expiry timers are
    /// rescheduled, and (when `send_notify` is set) a NOTIFY is emitted to
    /// every live subscription carrying the queued binding events.
    pub async fn set_aor(
        &self,
        aor: &str,
        record: &mut AoR,
        send_notify: bool,
    ) -> Result<SetOutcome> {
        let now = now_secs();

        let reaped = record.expire_bindings(now);
        record.expire_subscriptions(now);

        let all_bindings_expired = record.bindings.is_empty() && record.had_bindings_at_read;

        record.notify_cseq += 1;

        let bytes = serde_json::to_vec(&*record)?;
        match self.kv.compare_and_set(aor, bytes, record.cas).await? {
            CasOutcome::Contention => {
                // Undo the speculative increment so a retry starts clean.
                record.notify_cseq -= 1;
                debug!(aor, "CAS contention on AoR write");
                return Ok(SetOutcome::Contention);
            }
            CasOutcome::Stored(new_cas) => {
                record.cas = new_cas;
            }
        }

        for (_, binding) in &reaped {
            if !binding.timer_id.is_empty() {
                self.timers.cancel_timer(&binding.timer_id).await;
            }
        }
        self.reschedule_timers(aor, record).await;

        if send_notify && !record.pending_events.is_empty() {
            let events = std::mem::take(&mut record.pending_events);
            for (_, sub) in record.active_subscriptions(now) {
                let notify = notify::build_notify(
                    aor,
                    record,
                    sub,
                    &events,
                    now,
                    notify::ReginfoState::Partial,
                );
                self.notify_sink.send_notify(notify).await;
            }
        } else {
            record.pending_events.clear();
        }
        record.had_bindings_at_read = !record.bindings.is_empty();

        Ok(SetOutcome::Written {
            all_bindings_expired,
        })
    }

    /// Live subscriptions on `aor`.
    pub async fn list_subscriptions(&self, aor: &str) -> Result<Vec<crate::aor::Subscription>> {
        let record = self.get_aor(aor).await?;
        let now = now_secs();
        Ok(record
            .active_subscriptions(now)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn reschedule_timers(&self, aor: &str, record: &mut AoR) {
        // Timer updates are written back on the next CAS cycle; losing one
        // only costs an extra pop.
        let ids: Vec<String> = record.bindings.keys().cloned().collect();
        for id in ids {
            let (old_id, pop_at) = {
                let b = &record.bindings[&id];
                (
                    (!b.timer_id.is_empty()).then(|| b.timer_id.clone()),
                    b.expires,
                )
            };
            if let Some(new_id) = self
                .timers
                .set_timer(aor, &id, old_id.as_deref(), pop_at)
                .await
            {
                if let Some(b) = record.bindings.get_mut(&id) {
                    b.timer_id = new_id;
                }
            }
        }
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
