//! Audit event sinks.
//!
//! - [`JsonlEventLog`]: one JSON object per line, appended to a file.
//! - [`MemoryEventLog`]: keeps events in memory for tests and dry runs.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::io::AsyncWriteExt;

use crate::app::events::{Event, EventType};
use crate::app::ports::{EventLog, StoreFuture};
use crate::error::StoreError;

pub struct JsonlEventLog {
    path: PathBuf,
    // Serialises appends so lines never interleave.
    guard: tokio::sync::Mutex<()>,
}

impl JsonlEventLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            guard: tokio::sync::Mutex::new(()),
        }
    }
}

impl EventLog for JsonlEventLog {
    fn append<'a>(&'a self, event: &'a Event) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut line =
                serde_json::to_vec(event).map_err(|e| StoreError::Codec(e.to_string()))?;
            line.push(b'\n');
            let _held = self.guard.lock().await;
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(&line).await?;
            file.flush().await?;
            Ok(())
        })
    }
}

#[derive(Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<Event>>,
    latency_ms: AtomicU64,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Delay every later append by `latency`, like a slow disk.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Types of every recorded event, in append order.
    pub fn types(&self) -> Vec<EventType> {
        self.events().iter().map(|e| e.event_type).collect()
    }
}

impl EventLog for MemoryEventLog {
    fn append<'a>(&'a self, event: &'a Event) -> StoreFuture<'a, ()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        Box::pin(async move {
            if latency > 0 {
                tokio::time::sleep(Duration::from_millis(latency)).await;
            }
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
            Ok(())
        })
    }
}
