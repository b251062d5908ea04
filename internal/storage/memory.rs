use crate::sandbox;
use crate::storage::{BucketEntry, ObjectEntry, StorageError};
use crate::util::time::now_utc;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, OnceLock};

#[derive(Clone, Debug, PartialEq)]
pub struct BucketMeta {
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ObjectRecord {
    pub bytes: Bytes,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

pub type BucketMap = Arc<DashMap<String, BucketMeta>>;
pub type ObjectMap = Arc<DashMap<(String, String), ObjectRecord>>;

/// The bucket/object container pair a memory-backed store operates on.
/// Handles are cheap clones; the sandbox registry hands out a private pair
/// per owner, everything else shares the process-wide pair.
#[derive(Clone, Debug)]
pub struct Containers {
    pub buckets: BucketMap,
    pub objects: ObjectMap,
}

impl PartialEq for Containers {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.buckets, &other.buckets) && Arc::ptr_eq(&self.objects, &other.objects)
    }
}

impl Containers {
    pub fn new() -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            objects: Arc::new(DashMap::new()),
        }
    }

    pub fn clear(&self) {
        self.buckets.clear();
        self.objects.clear();
    }
}

impl Default for Containers {
    fn default() -> Self {
        Self::new()
    }
}

static SHARED: OnceLock<Containers> = OnceLock::new();

fn shared_containers() -> &'static Containers {
    SHARED.get_or_init(Containers::new)
}

/// In-memory backend. Holds no state of its own: every call resolves the
/// container pair for the calling task, so concurrent tests each see their
/// own sandboxed store.
#[derive(Clone, Default, Debug)]
pub struct MemStore;

impl MemStore {
    pub fn new() -> Self {
        Self
    }

    fn containers(&self) -> Result<Containers, StorageError> {
        let registry = sandbox::registry();
        if registry.enabled() {
            let task = sandbox::current_task();
            registry.resolve(task).map_err(|err| {
                tracing::error!(task = %task, error = %err, "sandbox container resolution failed");
                StorageError::Sandbox(err)
            })
        } else {
            Ok(shared_containers().clone())
        }
    }

    pub fn init(&self) -> Result<(), StorageError> {
        // Sandboxed containers materialize lazily on first resolution; the
        // well-known pair is created here.
        if !sandbox::registry().enabled() {
            let _ = shared_containers();
        }
        Ok(())
    }

    pub fn clean_up(&self) -> Result<(), StorageError> {
        self.containers()?.clear();
        Ok(())
    }

    pub fn list_buckets(&self) -> Result<Vec<BucketEntry>, StorageError> {
        let containers = self.containers()?;
        let mut buckets: Vec<BucketEntry> = containers
            .buckets
            .iter()
            .map(|entry| BucketEntry {
                name: entry.key().clone(),
                created_at: entry.value().created_at,
            })
            .collect();
        buckets.sort_by(|left, right| left.name.cmp(&right.name));
        Ok(buckets)
    }

    pub fn create_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        let containers = self.containers()?;
        let result = match containers.buckets.entry(bucket.to_string()) {
            Entry::Occupied(_) => Err(StorageError::BucketAlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(BucketMeta {
                    created_at: now_utc(),
                });
                Ok(())
            }
        };
        result
    }

    pub fn delete_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        let containers = self.containers()?;
        if !containers.buckets.contains_key(bucket) {
            return Err(StorageError::NoSuchBucket);
        }
        let occupied = containers
            .objects
            .iter()
            .any(|entry| entry.key().0 == bucket);
        if occupied {
            return Err(StorageError::BucketNotEmpty);
        }
        containers.buckets.remove(bucket);
        Ok(())
    }

    pub fn list_objects(&self, bucket: &str) -> Result<Vec<ObjectEntry>, StorageError> {
        let containers = self.containers()?;
        if !containers.buckets.contains_key(bucket) {
            return Err(StorageError::NoSuchBucket);
        }
        let mut objects: Vec<ObjectEntry> = containers
            .objects
            .iter()
            .filter(|entry| entry.key().0 == bucket)
            .map(|entry| ObjectEntry {
                key: entry.key().1.clone(),
                size: entry.value().size,
                last_modified: entry.value().last_modified,
            })
            .collect();
        objects.sort_by(|left, right| left.key.cmp(&right.key));
        Ok(objects)
    }

    pub fn put_object(&self, bucket: &str, key: &str, bytes: Bytes) -> Result<(), StorageError> {
        let containers = self.containers()?;
        if !containers.buckets.contains_key(bucket) {
            return Err(StorageError::NoSuchBucket);
        }
        let record = ObjectRecord {
            size: bytes.len() as u64,
            bytes,
            last_modified: now_utc(),
        };
        containers
            .objects
            .insert((bucket.to_string(), key.to_string()), record);
        Ok(())
    }

    pub fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError> {
        let containers = self.containers()?;
        if !containers.buckets.contains_key(bucket) {
            return Err(StorageError::NoSuchBucket);
        }
        containers
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| entry.value().bytes.clone())
            .ok_or(StorageError::NoSuchKey)
    }

    pub fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let containers = self.containers()?;
        if !containers.buckets.contains_key(bucket) {
            return Err(StorageError::NoSuchBucket);
        }
        containers
            .objects
            .remove(&(bucket.to_string(), key.to_string()))
            .map(|_| ())
            .ok_or(StorageError::NoSuchKey)
    }
}
