use crate::storage::memory::Containers;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as Base64Url;
use base64::Engine;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::task_local;
use uuid::Uuid;

pub mod http;

const OWNER_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity of a logical task in the sandbox registry.
///
/// Spawned tasks the system controls (owner helpers, request handling) are
/// bound explicitly; everything else falls back to a per-thread identity,
/// which covers code driven from a runtime's root future. A plain
/// `#[tokio::test]` body stays on one thread for its whole life.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

task_local! {
    static CURRENT_TASK: TaskId;
}

thread_local! {
    static THREAD_TASK: TaskId = TaskId::next();
}

pub fn current_task() -> TaskId {
    CURRENT_TASK
        .try_with(|id| *id)
        .unwrap_or_else(|_| THREAD_TASK.with(|id| *id))
}

/// Runs a future under a fresh task identity.
pub async fn scope<F>(fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_TASK.scope(TaskId::next(), fut).await
}

pub(crate) fn scoped<F>(id: TaskId, fut: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    CURRENT_TASK.scope(id, fut)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxMode {
    Auto,
    Manual,
    Shared(TaskId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SandboxError {
    #[error("task is not registered in the sandbox")]
    NotFound,
    #[error("task already owns a sandbox")]
    AlreadyOwner,
    #[error("task is already allowed into a sandbox")]
    AlreadyAllowed,
    #[error("sandbox is already shared by this owner")]
    AlreadyShared,
    #[error("task does not own a sandbox")]
    NotOwner,
    #[error("invalid sandbox owner token")]
    InvalidToken,
    #[error("timed out waiting for sandbox owner")]
    Timeout,
}

struct OwnerRecord {
    token: Uuid,
    containers: Containers,
}

enum SandboxEntry {
    Owner(OwnerRecord),
    Allowed(TaskId),
}

struct OwnerTask {
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// Process-wide ownership table. Maps task identities to owner records
/// (holding the isolated container pair) or allowance records (pointing at
/// an owner). The reverse owner-to-allowances set is never materialized;
/// owner removal scans the table instead.
pub struct SandboxRegistry {
    entries: DashMap<TaskId, SandboxEntry>,
    tokens: DashMap<Uuid, TaskId>,
    owner_tasks: DashMap<TaskId, OwnerTask>,
    mode: RwLock<Option<SandboxMode>>,
}

static REGISTRY: OnceLock<SandboxRegistry> = OnceLock::new();

pub fn registry() -> &'static SandboxRegistry {
    REGISTRY.get_or_init(SandboxRegistry::new)
}

impl SandboxRegistry {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
            tokens: DashMap::new(),
            owner_tasks: DashMap::new(),
            mode: RwLock::new(None),
        }
    }

    /// Registers the current task as the owner of a fresh container pair.
    pub fn checkout(&self) -> Result<(), SandboxError> {
        self.checkout_task(current_task())
    }

    pub(crate) fn checkout_task(&self, task: TaskId) -> Result<(), SandboxError> {
        match self.entries.entry(task) {
            Entry::Occupied(entry) => Err(match entry.get() {
                SandboxEntry::Owner(_) => SandboxError::AlreadyOwner,
                SandboxEntry::Allowed(_) => SandboxError::AlreadyAllowed,
            }),
            Entry::Vacant(slot) => {
                let record = OwnerRecord {
                    token: Uuid::new_v4(),
                    containers: Containers::new(),
                };
                let token = record.token;
                // The record goes in fully formed so readers never observe
                // an owner without its container pair.
                slot.insert(SandboxEntry::Owner(record));
                self.tokens.insert(token, task);
                Ok(())
            }
        }
    }

    /// Returns the current task's sandbox. For an owner this removes every
    /// allowance pointing at it, destroys the containers, and drops the
    /// record; for anything else it is a no-op. Idempotent.
    pub fn checkin(&self) {
        self.checkin_task(current_task())
    }

    pub(crate) fn checkin_task(&self, task: TaskId) {
        let removed = self
            .entries
            .remove_if(&task, |_, entry| matches!(entry, SandboxEntry::Owner(_)));
        let Some((_, SandboxEntry::Owner(record))) = removed else {
            return;
        };
        self.entries
            .retain(|_, entry| !matches!(entry, SandboxEntry::Allowed(owner) if *owner == task));
        self.tokens.remove(&record.token);
        record.containers.clear();
    }

    /// Drops whatever record the task holds: owners get a full checkin,
    /// allowances are simply removed. Used when a request task retires.
    pub(crate) fn release_task(&self, task: TaskId) {
        self.checkin_task(task);
        self.entries
            .remove_if(&task, |_, entry| matches!(entry, SandboxEntry::Allowed(_)));
    }

    pub fn allow(&self, parent: TaskId, child: TaskId) -> Result<(), SandboxError> {
        if !self.is_owner(parent) {
            return Err(SandboxError::NotFound);
        }
        match self.entries.entry(child) {
            Entry::Occupied(entry) => Err(match entry.get() {
                SandboxEntry::Owner(_) => SandboxError::AlreadyOwner,
                SandboxEntry::Allowed(_) => SandboxError::AlreadyAllowed,
            }),
            Entry::Vacant(slot) => {
                slot.insert(SandboxEntry::Allowed(parent));
                Ok(())
            }
        }
    }

    /// Like `allow`, but overwrites whatever record the child currently
    /// holds. Long-lived handler tasks get rebound with this when they are
    /// reused across different test owners.
    pub fn force_allow(&self, parent: TaskId, child: TaskId) -> Result<(), SandboxError> {
        if !self.is_owner(parent) {
            return Err(SandboxError::NotFound);
        }
        self.checkin_task(child);
        self.entries.insert(child, SandboxEntry::Allowed(parent));
        Ok(())
    }

    pub fn mode(&self, mode: SandboxMode) -> Result<(), SandboxError> {
        if let SandboxMode::Shared(owner) = mode {
            match self.entries.get(&owner).map(|entry| {
                matches!(entry.value(), SandboxEntry::Owner(_))
            }) {
                None => return Err(SandboxError::NotFound),
                Some(false) => return Err(SandboxError::NotOwner),
                Some(true) => {}
            }
            if self.mode_value() == Some(mode) {
                return Err(SandboxError::AlreadyShared);
            }
        }
        self.set_mode(Some(mode));
        Ok(())
    }

    pub fn reset_mode(&self) {
        self.set_mode(None);
    }

    pub fn enabled(&self) -> bool {
        self.mode_value().is_some()
    }

    fn mode_value(&self) -> Option<SandboxMode> {
        *self.mode.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_mode(&self, mode: Option<SandboxMode>) {
        *self.mode.write().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    fn release_shared(&self, owner: TaskId) {
        let mut mode = self.mode.write().unwrap_or_else(PoisonError::into_inner);
        if *mode == Some(SandboxMode::Shared(owner)) {
            *mode = Some(SandboxMode::Auto);
        }
    }

    /// Spawns a helper task that checks out a sandbox and parks until the
    /// owner is stopped. The helper carries a drop guard, so the sandbox is
    /// also cleaned up if the task dies abnormally.
    pub async fn start_owner(&self, shared: bool) -> Result<TaskId, SandboxError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let stop = Arc::new(Notify::new());
        let stop_task = stop.clone();
        let task_id = TaskId::next();
        let handle = tokio::spawn(scoped(task_id, async move {
            let result = registry().checkout_task(task_id);
            let ok = result.is_ok();
            let _guard = ok.then(|| OwnerGuard(task_id));
            let _ = ready_tx.send(result);
            if ok {
                stop_task.notified().await;
            }
        }));
        match tokio::time::timeout(OWNER_READY_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                self.owner_tasks.insert(task_id, OwnerTask { stop, handle });
                if shared {
                    self.set_mode(Some(SandboxMode::Shared(task_id)));
                }
                Ok(task_id)
            }
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(SandboxError::NotFound),
            Err(_) => {
                handle.abort();
                Err(SandboxError::Timeout)
            }
        }
    }

    /// Tears down an owner started with `start_owner`. Safe to call twice;
    /// if the owner was the shared owner, the mode reverts to auto.
    pub fn stop_owner(&self, owner: TaskId) {
        if let Some((_, task)) = self.owner_tasks.remove(&owner) {
            task.stop.notify_one();
            task.handle.abort();
        }
        self.release_shared(owner);
        self.checkin_task(owner);
    }

    pub fn lookup_owner(&self, task: TaskId) -> Result<TaskId, SandboxError> {
        match self.entries.get(&task).map(|entry| match entry.value() {
            SandboxEntry::Owner(_) => task,
            SandboxEntry::Allowed(owner) => *owner,
        }) {
            Some(owner) => Ok(owner),
            None => Err(SandboxError::NotFound),
        }
    }

    /// Serializes an owner identity as a URL-safe token fit for an HTTP
    /// header. The token is the owner's interned UUID, so it round-trips
    /// through `decode_metadata` and cannot collide across test runs.
    pub fn encode_metadata(&self, task: TaskId) -> Result<String, SandboxError> {
        let entry = self.entries.get(&task).ok_or(SandboxError::NotFound)?;
        match entry.value() {
            SandboxEntry::Owner(record) => Ok(Base64Url.encode(record.token.as_bytes())),
            SandboxEntry::Allowed(_) => Err(SandboxError::NotOwner),
        }
    }

    pub fn decode_metadata(&self, value: &str) -> Result<TaskId, SandboxError> {
        let bytes = Base64Url
            .decode(value)
            .map_err(|_| SandboxError::InvalidToken)?;
        let token = Uuid::from_slice(&bytes).map_err(|_| SandboxError::InvalidToken)?;
        self.tokens
            .get(&token)
            .map(|entry| *entry.value())
            .ok_or(SandboxError::NotFound)
    }

    /// Resolves the container pair for a task: its own sandbox if it is an
    /// owner, its owner's if it is allowed, and otherwise whatever the
    /// process-wide mode dictates.
    pub fn resolve(&self, task: TaskId) -> Result<Containers, SandboxError> {
        if let Some(entry) = self.entries.get(&task) {
            match entry.value() {
                SandboxEntry::Owner(record) => return Ok(record.containers.clone()),
                SandboxEntry::Allowed(owner) => {
                    let owner = *owner;
                    drop(entry);
                    return self.owner_containers(owner).ok_or(SandboxError::NotFound);
                }
            }
        }
        match self.mode_value() {
            Some(SandboxMode::Auto) => match self.checkout_task(task) {
                Ok(()) | Err(SandboxError::AlreadyOwner) => {
                    self.owner_containers(task).ok_or(SandboxError::NotFound)
                }
                Err(SandboxError::AlreadyAllowed) => self.resolve(task),
                Err(err) => Err(err),
            },
            Some(SandboxMode::Manual) => Err(SandboxError::NotFound),
            Some(SandboxMode::Shared(owner)) => {
                self.owner_containers(owner).ok_or(SandboxError::NotFound)
            }
            None => Err(SandboxError::NotFound),
        }
    }

    fn owner_containers(&self, owner: TaskId) -> Option<Containers> {
        match self.entries.get(&owner)?.value() {
            SandboxEntry::Owner(record) => Some(record.containers.clone()),
            SandboxEntry::Allowed(_) => None,
        }
    }

    fn is_owner(&self, task: TaskId) -> bool {
        self.entries
            .get(&task)
            .map(|entry| matches!(entry.value(), SandboxEntry::Owner(_)))
            .unwrap_or(false)
    }
}

struct OwnerGuard(TaskId);

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        let registry = registry();
        registry.checkin_task(self.0);
        registry.owner_tasks.remove(&self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::{current_task, registry, scope, SandboxError, SandboxMode, TaskId};
    use crate::test_support;
    use std::sync::Arc;

    #[tokio::test]
    async fn checkout_registers_one_owner_per_task() {
        let task = TaskId::next();
        registry().checkout_task(task).expect("checkout");
        assert_eq!(
            registry().checkout_task(task),
            Err(SandboxError::AlreadyOwner)
        );
        assert_eq!(registry().lookup_owner(task), Ok(task));
        registry().checkin_task(task);
        assert_eq!(
            registry().lookup_owner(task),
            Err(SandboxError::NotFound)
        );
    }

    #[tokio::test]
    async fn checkin_is_idempotent_and_ignores_non_owners() {
        let task = TaskId::next();
        registry().checkin_task(task);
        registry().checkout_task(task).expect("checkout");
        registry().checkin_task(task);
        registry().checkin_task(task);
        assert_eq!(registry().lookup_owner(task), Err(SandboxError::NotFound));
    }

    #[tokio::test]
    async fn allowed_task_resolves_to_owner_containers() {
        let owner = TaskId::next();
        let child = TaskId::next();
        registry().checkout_task(owner).expect("checkout");
        registry().allow(owner, child).expect("allow");

        let owned = registry().resolve(owner).expect("owner containers");
        let allowed = registry().resolve(child).expect("allowed containers");
        assert!(Arc::ptr_eq(&owned.buckets, &allowed.buckets));
        assert!(Arc::ptr_eq(&owned.objects, &allowed.objects));
        assert_eq!(registry().lookup_owner(child), Ok(owner));

        registry().checkin_task(owner);
    }

    #[tokio::test]
    async fn allow_validates_both_sides() {
        let owner = TaskId::next();
        let other_owner = TaskId::next();
        let child = TaskId::next();

        assert_eq!(
            registry().allow(owner, child),
            Err(SandboxError::NotFound)
        );

        registry().checkout_task(owner).expect("checkout");
        registry().checkout_task(other_owner).expect("checkout");
        assert_eq!(
            registry().allow(owner, other_owner),
            Err(SandboxError::AlreadyOwner)
        );

        registry().allow(owner, child).expect("allow");
        assert_eq!(
            registry().allow(owner, child),
            Err(SandboxError::AlreadyAllowed)
        );
        assert_eq!(
            registry().allow(other_owner, child),
            Err(SandboxError::AlreadyAllowed)
        );

        registry().checkin_task(owner);
        registry().checkin_task(other_owner);
    }

    #[tokio::test]
    async fn force_allow_rebinds_between_owners() {
        let first = TaskId::next();
        let second = TaskId::next();
        let child = TaskId::next();
        registry().checkout_task(first).expect("checkout");
        registry().checkout_task(second).expect("checkout");
        registry().allow(first, child).expect("allow");

        registry().force_allow(second, child).expect("force allow");
        assert_eq!(registry().lookup_owner(child), Ok(second));

        registry().checkin_task(first);
        registry().checkin_task(second);
    }

    #[tokio::test]
    async fn force_allow_replaces_an_owner_record() {
        let owner = TaskId::next();
        let demoted = TaskId::next();
        registry().checkout_task(owner).expect("checkout");
        registry().checkout_task(demoted).expect("checkout");
        let token = registry().encode_metadata(demoted).expect("token");

        registry().force_allow(owner, demoted).expect("force allow");
        assert_eq!(registry().lookup_owner(demoted), Ok(owner));
        // The demoted owner's sandbox is gone, token included.
        assert_eq!(
            registry().decode_metadata(&token),
            Err(SandboxError::NotFound)
        );

        registry().checkin_task(owner);
    }

    #[tokio::test]
    async fn checkin_removes_all_allowances_for_the_owner() {
        let owner = TaskId::next();
        let first = TaskId::next();
        let second = TaskId::next();
        registry().checkout_task(owner).expect("checkout");
        registry().allow(owner, first).expect("allow");
        registry().allow(owner, second).expect("allow");

        registry().checkin_task(owner);
        assert_eq!(registry().lookup_owner(first), Err(SandboxError::NotFound));
        assert_eq!(registry().lookup_owner(second), Err(SandboxError::NotFound));
    }

    #[tokio::test]
    async fn metadata_round_trips_for_owners_only() {
        let owner = TaskId::next();
        let child = TaskId::next();
        registry().checkout_task(owner).expect("checkout");
        registry().allow(owner, child).expect("allow");

        let token = registry().encode_metadata(owner).expect("encode");
        assert_eq!(registry().decode_metadata(&token), Ok(owner));
        assert_eq!(
            registry().encode_metadata(child),
            Err(SandboxError::NotOwner)
        );
        assert_eq!(
            registry().encode_metadata(TaskId::next()),
            Err(SandboxError::NotFound)
        );
        assert_eq!(
            registry().decode_metadata("not base64!"),
            Err(SandboxError::InvalidToken)
        );

        registry().checkin_task(owner);
        assert_eq!(
            registry().decode_metadata(&token),
            Err(SandboxError::NotFound)
        );
    }

    #[tokio::test]
    async fn mode_transitions_and_shared_validation() {
        let _guard = test_support::sandbox_lock();
        let registry = registry();
        assert!(!registry.enabled());

        registry.mode(SandboxMode::Auto).expect("auto");
        assert!(registry.enabled());
        registry.mode(SandboxMode::Manual).expect("manual");

        let stranger = TaskId::next();
        assert_eq!(
            registry.mode(SandboxMode::Shared(stranger)),
            Err(SandboxError::NotFound)
        );

        let owner = TaskId::next();
        let child = TaskId::next();
        registry.checkout_task(owner).expect("checkout");
        registry.allow(owner, child).expect("allow");
        assert_eq!(
            registry.mode(SandboxMode::Shared(child)),
            Err(SandboxError::NotOwner)
        );

        registry.mode(SandboxMode::Shared(owner)).expect("shared");
        assert_eq!(
            registry.mode(SandboxMode::Shared(owner)),
            Err(SandboxError::AlreadyShared)
        );

        registry.reset_mode();
        assert!(!registry.enabled());
        registry.checkin_task(owner);
    }

    #[tokio::test]
    async fn resolution_follows_the_mode() {
        let _guard = test_support::sandbox_lock();
        let registry = registry();

        // Unset mode: unregistered tasks cannot resolve.
        assert_eq!(
            registry.resolve(TaskId::next()),
            Err(SandboxError::NotFound)
        );

        registry.mode(SandboxMode::Manual).expect("manual");
        assert_eq!(
            registry.resolve(TaskId::next()),
            Err(SandboxError::NotFound)
        );

        registry.mode(SandboxMode::Auto).expect("auto");
        let task = TaskId::next();
        let containers = registry.resolve(task).expect("auto containers");
        let again = registry.resolve(task).expect("same containers");
        assert!(Arc::ptr_eq(&containers.buckets, &again.buckets));
        registry.checkin_task(task);

        let owner = TaskId::next();
        registry.checkout_task(owner).expect("checkout");
        registry.mode(SandboxMode::Shared(owner)).expect("shared");
        let shared = registry.resolve(TaskId::next()).expect("shared containers");
        let owned = registry.resolve(owner).expect("owner containers");
        assert!(Arc::ptr_eq(&shared.buckets, &owned.buckets));

        // A dead shared owner fails loudly instead of handing out handles.
        registry.checkin_task(owner);
        assert_eq!(
            registry.resolve(TaskId::next()),
            Err(SandboxError::NotFound)
        );
    }

    #[tokio::test]
    async fn allowance_to_a_dead_owner_is_not_found() {
        let _guard = test_support::sandbox_lock();
        let registry = registry();
        registry.mode(SandboxMode::Manual).expect("manual");
        let owner = TaskId::next();
        let child = TaskId::next();
        registry.checkout_task(owner).expect("checkout");
        registry.allow(owner, child).expect("allow");

        // Remove the owner record directly, leaving the allowance dangling.
        registry.entries.remove(&owner);
        assert_eq!(registry.resolve(child), Err(SandboxError::NotFound));
        registry.entries.remove(&child);
    }

    #[tokio::test]
    async fn start_owner_checks_out_and_stop_owner_cleans_up() {
        let owner = registry().start_owner(false).await.expect("start");
        assert_eq!(registry().lookup_owner(owner), Ok(owner));
        let token = registry().encode_metadata(owner).expect("token");
        assert_eq!(registry().decode_metadata(&token), Ok(owner));

        registry().stop_owner(owner);
        assert_eq!(registry().lookup_owner(owner), Err(SandboxError::NotFound));
        assert!(!registry().owner_tasks.contains_key(&owner));

        // Duplicate stop is a no-op.
        registry().stop_owner(owner);
    }

    #[tokio::test]
    async fn shared_start_owner_sets_and_reverts_mode() {
        let _guard = test_support::sandbox_lock();
        let owner = registry().start_owner(true).await.expect("start");
        assert_eq!(
            registry().mode_value(),
            Some(SandboxMode::Shared(owner))
        );

        registry().stop_owner(owner);
        assert_eq!(registry().mode_value(), Some(SandboxMode::Auto));
    }

    #[tokio::test]
    async fn aborted_owner_task_still_cleans_up() {
        let owner = registry().start_owner(false).await.expect("start");
        let task = registry()
            .owner_tasks
            .remove(&owner)
            .map(|(_, task)| task)
            .expect("owner task");
        task.handle.abort();
        let _ = task.handle.await;
        assert_eq!(registry().lookup_owner(owner), Err(SandboxError::NotFound));
    }

    #[tokio::test]
    async fn scope_gives_spawned_work_a_private_identity() {
        let outer = current_task();
        let inner = scope(async { current_task() }).await;
        assert_ne!(outer, inner);
        // Outside any scope the identity is stable.
        assert_eq!(current_task(), outer);
    }
}
