use crate::storage::{BucketEntry, ObjectEntry, StorageError};
use crate::util::time::system_time_utc;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Filesystem backend: one directory per bucket under the storage root,
/// one file per object. Slashes in an object key map to subdirectories.
#[derive(Clone, Debug)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_path(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    pub async fn init(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|err| io_error("create storage root failed", err))
    }

    pub async fn clean_up(&self) -> Result<(), StorageError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(io_error("read storage root failed", err)),
        };
        while let Some(entry) = next_dir_entry(&mut entries).await? {
            let path = entry.path();
            let removed = if is_dir(&entry).await? {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };
            removed.map_err(|err| io_error("clean up failed", err))?;
        }
        Ok(())
    }

    pub async fn list_buckets(&self) -> Result<Vec<BucketEntry>, StorageError> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|err| io_error("read storage root failed", err))?;
        let mut buckets = Vec::new();
        while let Some(entry) = next_dir_entry(&mut entries).await? {
            if !is_dir(&entry).await? {
                continue;
            }
            let metadata = entry
                .metadata()
                .await
                .map_err(|err| io_error("read bucket metadata failed", err))?;
            buckets.push(BucketEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                created_at: system_time_utc(metadata.modified()),
            });
        }
        buckets.sort_by(|left, right| left.name.cmp(&right.name));
        Ok(buckets)
    }

    pub async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        match fs::create_dir(self.bucket_path(bucket)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(StorageError::BucketAlreadyExists)
            }
            Err(err) => Err(io_error("create bucket failed", err)),
        }
    }

    pub async fn delete_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        let path = self.bucket_path(bucket);
        let mut entries = match fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NoSuchBucket)
            }
            Err(err) => return Err(io_error("read bucket failed", err)),
        };
        if next_dir_entry(&mut entries).await?.is_some() {
            return Err(StorageError::BucketNotEmpty);
        }
        drop(entries);
        match fs::remove_dir(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StorageError::NoSuchBucket),
            // An object written between the emptiness check and the remove.
            Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => {
                Err(StorageError::BucketNotEmpty)
            }
            Err(err) => Err(io_error("remove bucket failed", err)),
        }
    }

    pub async fn list_objects(&self, bucket: &str) -> Result<Vec<ObjectEntry>, StorageError> {
        let base = self.bucket_path(bucket);
        match fs::metadata(&base).await {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => return Err(StorageError::NoSuchBucket),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NoSuchBucket)
            }
            Err(err) => return Err(io_error("read bucket failed", err)),
        }

        // Depth-first walk; only leaf files become objects.
        let mut objects = Vec::new();
        let mut pending = vec![base.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|err| io_error("read bucket failed", err))?;
            while let Some(entry) = next_dir_entry(&mut entries).await? {
                let path = entry.path();
                if is_dir(&entry).await? {
                    pending.push(path);
                    continue;
                }
                objects.push(object_entry(&base, &path, &entry).await?);
            }
        }
        objects.sort_by(|left, right| left.key.cmp(&right.key));
        Ok(objects)
    }

    pub async fn put_object(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let bucket_dir = self.bucket_path(bucket);
        match fs::metadata(&bucket_dir).await {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => return Err(StorageError::NoSuchBucket),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NoSuchBucket)
            }
            Err(err) => return Err(io_error("read bucket failed", err)),
        }
        let path = bucket_dir.join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| io_error("create object dirs failed", err))?;
        }
        fs::write(&path, bytes)
            .await
            .map_err(|err| io_error("write object failed", err))
    }

    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError> {
        match fs::read(self.bucket_path(bucket).join(key)).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StorageError::NoSuchKey),
            Err(err) => Err(io_error("read object failed", err)),
        }
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let bucket_dir = self.bucket_path(bucket);
        let path = bucket_dir.join(key);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(StorageError::NoSuchKey),
            Err(err) => return Err(io_error("remove object failed", err)),
        }
        prune_empty_dirs(&bucket_dir, path.parent()).await;
        Ok(())
    }
}

/// Removes directories left empty by an object delete, up to (but never
/// including) the bucket directory itself.
async fn prune_empty_dirs(bucket_dir: &Path, start: Option<&Path>) {
    let mut current = start;
    while let Some(dir) = current {
        if dir == bucket_dir || !dir.starts_with(bucket_dir) {
            break;
        }
        if fs::remove_dir(dir).await.is_err() {
            break;
        }
        current = dir.parent();
    }
}

async fn object_entry(
    base: &Path,
    path: &Path,
    entry: &fs::DirEntry,
) -> Result<ObjectEntry, StorageError> {
    let metadata = entry
        .metadata()
        .await
        .map_err(|err| io_error("read object metadata failed", err))?;
    let key = path
        .strip_prefix(base)
        .map_err(|err| StorageError::Io(format!("object path outside bucket: {err}")))?
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    Ok(ObjectEntry {
        key,
        size: metadata.len(),
        last_modified: system_time_utc(metadata.modified()),
    })
}

async fn next_dir_entry(entries: &mut fs::ReadDir) -> Result<Option<fs::DirEntry>, StorageError> {
    entries
        .next_entry()
        .await
        .map_err(|err| io_error("read dir entry failed", err))
}

async fn is_dir(entry: &fs::DirEntry) -> Result<bool, StorageError> {
    let file_type = entry
        .file_type()
        .await
        .map_err(|err| io_error("read file type failed", err))?;
    Ok(file_type.is_dir())
}

fn io_error(context: &str, err: std::io::Error) -> StorageError {
    StorageError::Io(format!("{context}: {err}"))
}
