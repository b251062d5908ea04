use crate::sandbox::SandboxError;
use crate::storage::fs::FsStore;
use crate::storage::memory::MemStore;
use crate::util::config::Config;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

pub mod fs;
pub mod memory;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("bucket already exists")]
    BucketAlreadyExists,
    #[error("no such bucket")]
    NoSuchBucket,
    #[error("bucket is not empty")]
    BucketNotEmpty,
    #[error("no such key")]
    NoSuchKey,
    #[error("unknown storage backend: {0}")]
    InvalidBackend(String),
    #[error("sandbox resolution failed: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("storage io failure: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketEntry {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Backend-specific storage location descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageRoot {
    Directory(PathBuf),
    InMemory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Filesystem,
    Memory,
}

impl BackendKind {
    pub fn parse(value: &str) -> Result<Self, StorageError> {
        match value.trim().to_lowercase().as_str() {
            "filesystem" | "fs" => Ok(Self::Filesystem),
            "memory" | "mem" => Ok(Self::Memory),
            other => Err(StorageError::InvalidBackend(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Memory => "memory",
        }
    }
}

/// Facade over the active storage backend. Every S3 handler goes through
/// this enum; the backend is chosen once from configuration.
#[derive(Clone, Debug)]
pub enum Storage {
    Filesystem(FsStore),
    Memory(MemStore),
}

impl Storage {
    pub fn from_config(config: &Config) -> Result<Self, StorageError> {
        let kind = BackendKind::parse(&config.storage_backend)?;
        Ok(Self::select(kind, config))
    }

    pub fn select(kind: BackendKind, config: &Config) -> Self {
        match kind {
            BackendKind::Filesystem => Storage::Filesystem(FsStore::new(config.storage_root.clone())),
            BackendKind::Memory => Storage::Memory(MemStore::new()),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Storage::Filesystem(_) => BackendKind::Filesystem,
            Storage::Memory(_) => BackendKind::Memory,
        }
    }

    pub fn storage_root(&self) -> StorageRoot {
        match self {
            Storage::Filesystem(store) => StorageRoot::Directory(store.root().to_path_buf()),
            Storage::Memory(_) => StorageRoot::InMemory,
        }
    }

    pub async fn init(&self) -> Result<(), StorageError> {
        match self {
            Storage::Filesystem(store) => store.init().await,
            Storage::Memory(store) => store.init(),
        }
    }

    pub async fn clean_up(&self) -> Result<(), StorageError> {
        match self {
            Storage::Filesystem(store) => store.clean_up().await,
            Storage::Memory(store) => store.clean_up(),
        }
    }

    pub async fn list_buckets(&self) -> Result<Vec<BucketEntry>, StorageError> {
        match self {
            Storage::Filesystem(store) => store.list_buckets().await,
            Storage::Memory(store) => store.list_buckets(),
        }
    }

    pub async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        match self {
            Storage::Filesystem(store) => store.create_bucket(bucket).await,
            Storage::Memory(store) => store.create_bucket(bucket),
        }
    }

    pub async fn delete_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        match self {
            Storage::Filesystem(store) => store.delete_bucket(bucket).await,
            Storage::Memory(store) => store.delete_bucket(bucket),
        }
    }

    pub async fn list_objects(&self, bucket: &str) -> Result<Vec<ObjectEntry>, StorageError> {
        match self {
            Storage::Filesystem(store) => store.list_objects(bucket).await,
            Storage::Memory(store) => store.list_objects(bucket),
        }
    }

    pub async fn put_object(&self, bucket: &str, key: &str, bytes: Bytes) -> Result<(), StorageError> {
        match self {
            Storage::Filesystem(store) => store.put_object(bucket, key, &bytes).await,
            Storage::Memory(store) => store.put_object(bucket, key, bytes),
        }
    }

    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError> {
        match self {
            Storage::Filesystem(store) => store.get_object(bucket, key).await,
            Storage::Memory(store) => store.get_object(bucket, key),
        }
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        match self {
            Storage::Filesystem(store) => store.delete_object(bucket, key).await,
            Storage::Memory(store) => store.delete_object(bucket, key),
        }
    }
}
