//! File-backed record store.
//!
//! One file per record under `<root>/<collection>/<key>.<ext>`.  The primary
//! store uses the compact postcard encoding; the replica uses JSON so an
//! operator can inspect and hand-edit it.
//!
//! Writes go to a temporary sibling first and are renamed into place, so a
//! crash mid-write never leaves a torn record behind.

use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use log::debug;

use crate::app::ports::{Record, RecordStore, StoreFuture};
use crate::error::StoreError;

/// On-disk encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Postcard,
    Json,
}

impl Codec {
    fn extension(self) -> &'static str {
        match self {
            Self::Postcard => "bin",
            Self::Json => "json",
        }
    }

    fn encode<R: Record>(self, record: &R) -> Result<Vec<u8>, StoreError> {
        match self {
            Self::Postcard => {
                postcard::to_allocvec(record).map_err(|e| StoreError::Codec(e.to_string()))
            }
            Self::Json => {
                serde_json::to_vec_pretty(record).map_err(|e| StoreError::Codec(e.to_string()))
            }
        }
    }

    fn decode<R: Record>(self, bytes: &[u8]) -> Result<R, StoreError> {
        match self {
            Self::Postcard => {
                postcard::from_bytes(bytes).map_err(|e| StoreError::Codec(e.to_string()))
            }
            Self::Json => serde_json::from_slice(bytes).map_err(|e| StoreError::Codec(e.to_string())),
        }
    }
}

pub struct FileStore<R> {
    label: String,
    dir: PathBuf,
    codec: Codec,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> FileStore<R> {
    pub fn new(label: &str, root: &Path, codec: Codec) -> Self {
        Self {
            label: label.to_owned(),
            dir: root.join(R::COLLECTION),
            codec,
            _record: PhantomData,
        }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{}", self.codec.extension()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(self.path(key)).await?)
    }

    async fn write(&self, record: &R) -> Result<(), StoreError> {
        let bytes = self.codec.encode(record)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path(record.key());
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("{}: wrote {} ({} bytes)", self.label, path.display(), bytes.len());
        Ok(())
    }
}

impl<R: Record> RecordStore<R> for FileStore<R> {
    fn label(&self) -> &str {
        &self.label
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<R>> {
        Box::pin(async move {
            match tokio::fs::read(self.path(key)).await {
                Ok(bytes) => self.codec.decode(&bytes).map(Some),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn create<'a>(&'a self, record: &'a R) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if self.exists(record.key()).await? {
                return Err(StoreError::AlreadyExists(record.key().to_owned()));
            }
            self.write(record).await
        })
    }

    fn update<'a>(&'a self, record: &'a R) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if !self.exists(record.key()).await? {
                return Err(StoreError::NotFound(record.key().to_owned()));
            }
            self.write(record).await
        })
    }
}
