//! Dual-store reconciliation.
//!
//! One [`Reconciler`] per record type keeps a primary store (authoritative,
//! written synchronously) and an optional secondary store (replica, written
//! best-effort) converged.
//!
//! ```text
//!            init(template)
//!   primary ◀──────┬──────▶ secondary
//!     │  absent in both     → create template on both
//!     │  only on secondary  → copy to primary
//!     │  only on primary    → copy to secondary
//!     │  on both            → newer copy overwrites older (ties: no-op)
//!     ▼
//!   get()  reads primary only
//!   create() / update()  stamp, write primary (error returned),
//!                        then queue for the secondary
//!   replicate()          drain the queue into the secondary (errors logged)
//! ```
//!
//! Copies made by `init` are written verbatim: version and timestamp are
//! preserved so both stores end up byte-for-byte equivalent.  `init` runs
//! before a device starts and writes the secondary inline; afterwards the
//! secondary is only ever written from the replication task, so a slow
//! replica never holds up the caller.  The queue keeps the latest copy per
//! key.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::app::ports::{Arbitration, Clock, Record, RecordStore, StoreFuture};
use crate::config::DeviceConfig;
use crate::error::StoreError;
use crate::fsm::context::DeviceState;

// ---------------------------------------------------------------------------
// Record impls
// ---------------------------------------------------------------------------

impl Record for DeviceState {
    const ARBITRATION: Arbitration = Arbitration::UpdatedAt;
    const COLLECTION: &'static str = "states";

    fn key(&self) -> &str {
        &self.id
    }
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }
}

impl Record for DeviceConfig {
    const ARBITRATION: Arbitration = Arbitration::Version;
    const COLLECTION: &'static str = "configs";

    fn key(&self) -> &str {
        &self.id
    }
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }
}

/// Order two copies of a record by their arbitration field.
pub fn compare<R: Record>(a: &R, b: &R) -> Ordering {
    match R::ARBITRATION {
        Arbitration::Version => a.version().cmp(&b.version()),
        Arbitration::UpdatedAt => a.updated_at().cmp(&b.updated_at()),
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Records waiting for the secondary store.
struct Backlog<R> {
    pending: Mutex<BTreeMap<String, R>>,
    wake: Notify,
}

pub struct Reconciler<R: Record> {
    primary: Arc<dyn RecordStore<R>>,
    secondary: Option<Arc<dyn RecordStore<R>>>,
    secondary_timeout: Duration,
    clock: Arc<dyn Clock>,
    backlog: Arc<Backlog<R>>,
}

impl<R: Record> Clone for Reconciler<R> {
    fn clone(&self) -> Self {
        Self {
            primary: self.primary.clone(),
            secondary: self.secondary.clone(),
            secondary_timeout: self.secondary_timeout,
            clock: self.clock.clone(),
            backlog: self.backlog.clone(),
        }
    }
}

impl<R: Record> Reconciler<R> {
    pub fn new(
        primary: Arc<dyn RecordStore<R>>,
        secondary: Option<Arc<dyn RecordStore<R>>>,
        secondary_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            primary,
            secondary,
            secondary_timeout,
            clock,
            backlog: Arc::new(Backlog {
                pending: Mutex::new(BTreeMap::new()),
                wake: Notify::new(),
            }),
        }
    }

    /// Converge both stores and return the authoritative record.
    ///
    /// Errors only come from the primary store; the secondary is logged and
    /// skipped.
    pub async fn init(&self, template: R) -> Result<R, StoreError> {
        let key = template.key().to_owned();
        let (primary, secondary) = futures_lite::future::zip(
            self.primary.get(&key),
            self.secondary_op("read", &key, |s| s.get(&key)),
        )
        .await;
        let primary = primary?;
        let secondary = match secondary {
            Some(Ok(copy)) => copy,
            _ => None,
        };

        match (primary, secondary) {
            (None, None) => {
                info!("{}/{key}: absent from both stores, creating from template", R::COLLECTION);
                let mut record = template;
                self.stamp(&mut record);
                self.primary.create(&record).await?;
                self.write_secondary(&record).await;
                Ok(record)
            }
            (None, Some(copy)) => {
                info!("{}/{key}: restoring primary from {}", R::COLLECTION, self.secondary_label());
                self.primary.create(&copy).await?;
                Ok(copy)
            }
            (Some(record), None) => {
                if self.secondary.is_some() {
                    info!("{}/{key}: seeding {}", R::COLLECTION, self.secondary_label());
                    self.secondary_op("create", &key, |s| s.create(&record)).await;
                }
                Ok(record)
            }
            (Some(record), Some(copy)) => match compare(&record, &copy) {
                Ordering::Greater => {
                    info!("{}/{key}: primary is newer, updating replica", R::COLLECTION);
                    self.secondary_op("update", &key, |s| s.update(&record)).await;
                    Ok(record)
                }
                Ordering::Less => {
                    info!("{}/{key}: replica is newer, updating primary", R::COLLECTION);
                    self.primary.update(&copy).await?;
                    Ok(copy)
                }
                Ordering::Equal => {
                    debug!("{}/{key}: stores agree", R::COLLECTION);
                    Ok(record)
                }
            },
        }
    }

    /// Read from the primary store only.
    pub async fn get(&self, key: &str) -> Result<Option<R>, StoreError> {
        self.primary.get(key).await
    }

    /// Stamp and insert a new record.
    pub async fn create(&self, mut record: R) -> Result<R, StoreError> {
        self.stamp(&mut record);
        self.primary.create(&record).await?;
        self.enqueue(&record);
        Ok(record)
    }

    /// Stamp and overwrite an existing record.  The returned copy carries
    /// the new version and timestamp.
    pub async fn update(&self, record: &R) -> Result<R, StoreError> {
        let mut record = record.clone();
        self.stamp(&mut record);
        self.primary.update(&record).await?;
        self.enqueue(&record);
        Ok(record)
    }

    /// Records written to the primary but not yet offered to the secondary.
    pub fn backlog(&self) -> usize {
        self.lock_pending().len()
    }

    /// Offer every queued record to the secondary once.  Failures are
    /// logged and the record is dropped; a later write queues it again.
    pub async fn flush(&self) {
        let pending = std::mem::take(&mut *self.lock_pending());
        for record in pending.into_values() {
            self.write_secondary(&record).await;
        }
    }

    /// Replication task: drain the queue as records arrive until `cancel`
    /// fires, then flush what is left.
    pub async fn replicate(self, cancel: CancellationToken) {
        if self.secondary.is_none() {
            return;
        }
        loop {
            self.flush().await;
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = self.backlog.wake.notified() => {}
            }
        }
        self.flush().await;
        debug!("{}: replication stopped", R::COLLECTION);
    }

    fn enqueue(&self, record: &R) {
        if self.secondary.is_none() {
            return;
        }
        self.lock_pending()
            .insert(record.key().to_owned(), record.clone());
        self.backlog.wake.notify_one();
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, R>> {
        self.backlog
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Update the secondary copy, creating it when the replica never saw it.
    async fn write_secondary(&self, record: &R) {
        let key = record.key().to_owned();
        let replicated = self.secondary_op("update", &key, |s| s.update(record)).await;
        if let Some(Err(StoreError::NotFound(_))) = replicated {
            self.secondary_op("create", &key, |s| s.create(record)).await;
        }
    }

    fn stamp(&self, record: &mut R) {
        record.set_version(record.version() + 1);
        record.set_updated_at(self.clock.now());
    }

    fn secondary_label(&self) -> &str {
        self.secondary.as_ref().map_or("secondary", |s| s.label())
    }

    /// Run one bounded secondary-store operation.  Failures and timeouts
    /// are logged and folded into `None`; only `NotFound` on update is
    /// handed back so the caller can fall back to create.
    async fn secondary_op<'a, T, F>(
        &'a self,
        what: &str,
        key: &str,
        op: F,
    ) -> Option<Result<T, StoreError>>
    where
        F: FnOnce(&'a dyn RecordStore<R>) -> StoreFuture<'a, T>,
    {
        let store = self.secondary.as_deref()?;
        let result = match tokio::time::timeout(self.secondary_timeout, op(store)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable(format!(
                "timed out after {:?}",
                self.secondary_timeout
            ))),
        };
        match result {
            Ok(v) => Some(Ok(v)),
            Err(StoreError::NotFound(k)) if what == "update" => Some(Err(StoreError::NotFound(k))),
            Err(e) => {
                warn!(
                    "{}/{key}: {} {what} failed (ignored): {e}",
                    R::COLLECTION,
                    store.label()
                );
                None
            }
        }
    }
}
