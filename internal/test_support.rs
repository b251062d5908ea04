use crate::api::AppState;
use crate::util::config::Config;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

static SANDBOX_LOCK: Mutex<()> = Mutex::new(());

pub struct SandboxGuard {
    _guard: MutexGuard<'static, ()>,
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        crate::sandbox::registry().reset_mode();
    }
}

/// Serializes tests that touch the process-wide sandbox mode, clearing the
/// mode on both entry and exit.
pub fn sandbox_lock() -> SandboxGuard {
    let guard = SANDBOX_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    crate::sandbox::registry().reset_mode();
    SandboxGuard { _guard: guard }
}

pub fn base_config(storage_backend: &str, storage_root: PathBuf) -> Config {
    Config {
        storage_backend: storage_backend.to_string(),
        storage_root,
        sandbox_mode: "off".to_string(),
        s3_listen: "127.0.0.1:0".to_string(),
        metrics_listen: "127.0.0.1:0".to_string(),
        log_level: "info".to_string(),
    }
}

pub async fn new_temp_dir(label: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("ps3-{label}-{}", Uuid::new_v4()));
    tokio::fs::create_dir_all(&path)
        .await
        .expect("create temp dir");
    path
}

pub async fn fs_state() -> (AppState, PathBuf) {
    let dir = new_temp_dir("fs").await;
    let state = AppState::new(base_config("filesystem", dir.clone()))
        .await
        .expect("state");
    (state, dir)
}

pub async fn memory_state(sandbox_mode: &str) -> AppState {
    let mut config = base_config("memory", std::env::temp_dir());
    config.sandbox_mode = sandbox_mode.to_string();
    AppState::new(config).await.expect("state")
}
