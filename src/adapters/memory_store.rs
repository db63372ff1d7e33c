//! In-memory record store.
//!
//! Backs tests and the simulated process profile.  Failure injection lets
//! tests take either store down (`set_failing`) or make it hang
//! (`set_stalled`) without touching the reconciler.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::app::ports::{Record, RecordStore, StoreFuture};
use crate::error::StoreError;

pub struct MemoryStore<R> {
    label: String,
    records: Mutex<BTreeMap<String, R>>,
    failing: AtomicBool,
    stalled: AtomicBool,
    writes: AtomicUsize,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> MemoryStore<R> {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_owned(),
            records: Mutex::new(BTreeMap::new()),
            failing: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
            _record: PhantomData,
        }
    }

    /// Place a record directly, bypassing failure injection and counters.
    pub fn insert(&self, record: R) {
        self.lock().insert(record.key().to_owned(), record);
    }

    /// Read a record directly.
    pub fn peek(&self, key: &str) -> Option<R> {
        self.lock().get(key).cloned()
    }

    /// Successful `create`/`update` calls so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Every operation fails with `Unavailable` while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every operation hangs for an hour while set.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, R>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn gate(&self) -> Result<(), StoreError> {
        if self.stalled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{} is down", self.label)));
        }
        Ok(())
    }
}

impl<R: Record> RecordStore<R> for MemoryStore<R> {
    fn label(&self) -> &str {
        &self.label
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<R>> {
        Box::pin(async move {
            self.gate().await?;
            Ok(self.peek(key))
        })
    }

    fn create<'a>(&'a self, record: &'a R) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.gate().await?;
            let mut records = self.lock();
            if records.contains_key(record.key()) {
                return Err(StoreError::AlreadyExists(record.key().to_owned()));
            }
            records.insert(record.key().to_owned(), record.clone());
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn update<'a>(&'a self, record: &'a R) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.gate().await?;
            let mut records = self.lock();
            let Some(slot) = records.get_mut(record.key()) else {
                return Err(StoreError::NotFound(record.key().to_owned()));
            };
            *slot = record.clone();
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}
