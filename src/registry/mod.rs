//! Principal, image and accessor registry with asynchronous persistence.
//!
//! The [`Registry`] owns the three entity maps and the [`PortPool`]. Every
//! mutation performs its remote policy call with a provisional local entry
//! in place, rolls that entry back on failure, and on success queues a
//! change for the background flush loop. Durability lags the call by at
//! most one flush interval. A principal id with a create or delete still
//! outstanding is marked in flight and refuses other lifecycle calls.
//!
//! Lifecycle: [`Registry::start_sync`] spawns the flush loop,
//! [`Registry::stop`] drains it, and [`Registry::resume`] restarts it after
//! a handoff (for example around a process fork).

pub mod entities;
pub mod snapshot;
mod sync;

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::{AttguardConfig, IdentityConfig};
use crate::policy::{Endpoint, PolicyClient, PolicyError};
use crate::ports::{KernelError, PoolError, PortError, PortKernel, PortPool};

pub use entities::{AccessorObject, Image, Principal};
pub use snapshot::{Change, Collection, Snapshot, SnapshotError};

use sync::{SyncHandle, SyncState};

// ── Errors ──────────────────────────────────────────────────────

/// Registry operation failure.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Remote policy call failed.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// The entity is not known locally.
    #[error("{kind} {key} not found")]
    NotFound {
        /// Entity kind.
        kind: &'static str,
        /// Lookup key.
        key: String,
    },

    /// The entity already exists locally.
    #[error("{kind} {key} already exists")]
    AlreadyExists {
        /// Entity kind.
        kind: &'static str,
        /// Conflicting key.
        key: String,
    },

    /// A create or delete for the same key has not finished yet.
    #[error("{kind} {key} has an operation in flight")]
    Busy {
        /// Entity kind.
        kind: &'static str,
        /// Contended key.
        key: String,
    },

    /// Port allocation or OS reservation failed.
    #[error(transparent)]
    Ports(#[from] PoolError),

    /// Snapshot could not be read or written.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// Internal state lock was poisoned.
    #[error("registry state unavailable: {0}")]
    Unavailable(String),
}

impl RegistryError {
    /// Negative status code, distinct per failure class.
    pub fn code(&self) -> i32 {
        match self {
            Self::Unavailable(_) => -1,
            Self::Policy(PolicyError::Transport(_)) => -2,
            Self::Policy(PolicyError::Malformed(_)) => -3,
            Self::Policy(PolicyError::Status { .. }) => -4,
            Self::NotFound { .. } | Self::AlreadyExists { .. } | Self::Busy { .. } => -5,
            Self::Ports(PoolError::Ports(_)) => -6,
            Self::Ports(PoolError::Kernel(_)) => -7,
            Self::Snapshot(_) => -8,
        }
    }
}

impl From<PortError> for RegistryError {
    fn from(err: PortError) -> Self {
        Self::Ports(PoolError::Ports(err))
    }
}

impl From<KernelError> for RegistryError {
    fn from(err: KernelError) -> Self {
        Self::Ports(PoolError::Kernel(err))
    }
}

// ── Options ─────────────────────────────────────────────────────

/// Construction parameters.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Speaker name and host address.
    pub identity: IdentityConfig,
    /// Snapshot file.
    pub snapshot_path: PathBuf,
    /// Upper bound between flushes.
    pub flush_interval: Duration,
}

impl RegistryOptions {
    /// Take the relevant sections of the daemon config.
    pub fn from_config(config: &AttguardConfig) -> Self {
        Self {
            identity: config.identity.clone(),
            snapshot_path: config.persistence.snapshot_path.clone(),
            flush_interval: config.persistence.flush_interval(),
        }
    }
}

/// Outcome of [`Registry::from_disk`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Principals restored into the live map.
    pub principals: usize,
    /// Images restored.
    pub images: usize,
    /// Accessor objects restored.
    pub accessors: usize,
    /// Restored principals whose process no longer exists.
    pub orphaned: Vec<u64>,
    /// Principal keys whose range could not be re-taken.
    pub conflicts: Vec<String>,
    /// Entries that failed to parse.
    pub skipped: Vec<String>,
}

// ── Registry ────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Entities {
    principals: BTreeMap<u64, Principal>,
    images: BTreeMap<String, Image>,
    accessors: BTreeMap<String, AccessorObject>,
    /// Principal ids with a remote call outstanding.
    in_flight: BTreeSet<u64>,
}

/// Owner of all durable daemon state.
pub struct Registry {
    identity: IdentityConfig,
    pool: PortPool,
    policy: Arc<dyn PolicyClient>,
    entities: Mutex<Entities>,
    sync: Arc<SyncState>,
    task: Mutex<Option<SyncHandle>>,
}

impl Registry {
    /// Empty registry over the kernel's local port range. The flush loop
    /// is not started.
    ///
    /// # Errors
    ///
    /// Fails if the kernel cannot report a local range.
    pub fn new(
        options: RegistryOptions,
        kernel: Arc<dyn PortKernel>,
        policy: Arc<dyn PolicyClient>,
    ) -> Result<Self, RegistryError> {
        let pool = PortPool::from_kernel(kernel)?;
        Ok(Self {
            identity: options.identity,
            pool,
            policy,
            entities: Mutex::new(Entities::default()),
            sync: Arc::new(SyncState::new(options.snapshot_path, options.flush_interval)),
            task: Mutex::new(None),
        })
    }

    /// Rebuild a registry from its snapshot file.
    ///
    /// A missing or unreadable snapshot yields an empty registry. Each
    /// recovered principal re-takes its exact port range and re-affirms
    /// the OS reservation; a principal whose process has exited is still
    /// restored. The flush loop is not started.
    ///
    /// # Errors
    ///
    /// Only construction failures from [`Registry::new`].
    pub fn from_disk(
        options: RegistryOptions,
        kernel: Arc<dyn PortKernel>,
        policy: Arc<dyn PolicyClient>,
    ) -> Result<(Self, RecoveryReport), RegistryError> {
        let registry = Self::new(options, kernel, policy)?;
        let report = registry.recover();
        Ok((registry, report))
    }

    fn recover(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let path = self.sync.path.as_path();

        let snapshot = match Snapshot::load(path) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                info!(path = %path.display(), "no snapshot found, starting empty");
                return report;
            }
            Err(err) => {
                let backup = set_aside(path);
                warn!(path = %path.display(), backup = ?backup, error = %err, "snapshot unreadable, starting empty");
                return report;
            }
        };

        let mut entities = match self.entities.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        for (key, value) in &snapshot.principals {
            let principal = match Principal::from_entry(value) {
                Ok(p) => p,
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping unparsable principal");
                    report.skipped.push(key.clone());
                    continue;
                }
            };
            if let Err(err) = self.pool.claim(principal.id, principal.ports) {
                error!(
                    key = %key,
                    lo = principal.ports.lo,
                    hi = principal.ports.hi,
                    error = %err,
                    "port range conflict during recovery, operator attention required"
                );
                report.conflicts.push(key.clone());
                continue;
            }
            if !self.pool.kernel().process_alive(principal.id) {
                warn!(id = principal.id, "backing process is gone, range stays allocated until delete");
                report.orphaned.push(principal.id);
            }
            entities.principals.insert(principal.id, principal);
            report.principals = report.principals.saturating_add(1);
        }

        for (key, value) in &snapshot.images {
            match Image::from_entry(value) {
                Ok(image) => {
                    entities.images.insert(image.hash.clone(), image);
                    report.images = report.images.saturating_add(1);
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping unparsable image");
                    report.skipped.push(key.clone());
                }
            }
        }

        for (key, value) in &snapshot.accessors {
            match AccessorObject::from_entry(value) {
                Ok(object) => {
                    entities.accessors.insert(object.name.clone(), object);
                    report.accessors = report.accessors.saturating_add(1);
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping unparsable accessor");
                    report.skipped.push(key.clone());
                }
            }
        }
        drop(entities);

        // Unrestorable entries stay on disk for the operator.
        match self.sync.snapshot.lock() {
            Ok(mut doc) => *doc = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }

        info!(
            principals = report.principals,
            images = report.images,
            accessors = report.accessors,
            conflicts = report.conflicts.len(),
            "registry recovered"
        );
        report
    }

    // ── Principals ──────────────────────────────────────────────

    /// Allocate `n_ports` for principal `id` and register it remotely.
    ///
    /// On any failure everything acquired so far is released. The id stays
    /// taken while the registration is outstanding.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyExists`] for a known id, [`RegistryError::Ports`]
    /// when allocation fails, [`RegistryError::Policy`] when registration fails.
    pub async fn create_principal(
        &self,
        id: u64,
        image: &str,
        configs: &str,
        n_ports: u32,
    ) -> Result<Principal, RegistryError> {
        let mut principal = {
            let mut entities = self.lock()?;
            if entities.principals.contains_key(&id) {
                return Err(RegistryError::AlreadyExists {
                    kind: "principal",
                    key: entities::principal_key(id),
                });
            }
            let ports = self.pool.allocate_n_ports(id, n_ports)?;
            let principal = Principal {
                id,
                generation: 0,
                ip: self.identity.ip,
                ports,
                image: image.to_owned(),
                configs: configs.to_owned(),
                bearer: String::new(),
                speaker: u64::from(std::process::id()),
            };
            entities.principals.insert(id, principal.clone());
            entities.in_flight.insert(id);
            principal
        };

        let registered = self
            .policy
            .register_principal(&self.identity.speaker, &principal.claim())
            .await;

        let mut entities = self.settle(id);
        match registered {
            Ok(bearer) => {
                principal.bearer = bearer;
                if let Some(entry) = entities.principals.get_mut(&id) {
                    entry.bearer = principal.bearer.clone();
                }
                drop(entities);
                self.enqueue(Change::upsert(
                    Collection::Principals,
                    principal.key(),
                    principal.to_entry(),
                ));
                info!(id, lo = principal.ports.lo, hi = principal.ports.hi, "principal created");
                Ok(principal)
            }
            Err(err) => {
                entities.principals.remove(&id);
                drop(entities);
                if let Err(release) = self.pool.release(principal.ports) {
                    error!(id, error = %release, "failed to release ports after registration failure");
                }
                warn!(id, error = %err, "principal registration failed");
                Err(err.into())
            }
        }
    }

    /// Retract principal `id`, release its ports and forget it.
    ///
    /// The entry stays in place until the retraction succeeds, so a
    /// concurrent create for the same id is refused meanwhile.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] for an unknown id, [`RegistryError::Busy`]
    /// while another create or delete of `id` is outstanding, and
    /// [`RegistryError::Policy`] if the retraction fails, in which case the
    /// principal is kept.
    pub async fn delete_principal(&self, id: u64) -> Result<(), RegistryError> {
        let principal = {
            let mut entities = self.lock()?;
            let Some(principal) = entities.principals.get(&id).cloned() else {
                warn!(id, "delete of unknown principal");
                return Err(RegistryError::NotFound {
                    kind: "principal",
                    key: entities::principal_key(id),
                });
            };
            if !entities.in_flight.insert(id) {
                return Err(RegistryError::Busy {
                    kind: "principal",
                    key: entities::principal_key(id),
                });
            }
            principal
        };

        let retracted = self
            .policy
            .retract_principal(&self.identity.speaker, &principal.claim())
            .await;

        let mut entities = self.settle(id);
        if let Err(err) = retracted {
            warn!(id, error = %err, "principal retraction failed");
            return Err(err.into());
        }
        entities.principals.remove(&id);
        drop(entities);

        if let Err(err) = self.pool.release(principal.ports) {
            error!(id, error = %err, "port release failed after retraction");
        }
        self.enqueue(Change::delete(Collection::Principals, principal.key()));
        info!(id, "principal deleted");
        Ok(())
    }

    /// Whether principal `id` is known.
    pub fn has_principal(&self, id: u64) -> bool {
        self.lock()
            .map(|e| e.principals.contains_key(&id))
            .unwrap_or(false)
    }

    /// Copy of principal `id`.
    pub fn principal(&self, id: u64) -> Option<Principal> {
        self.lock().ok()?.principals.get(&id).cloned()
    }

    /// Copies of every principal, ordered by id.
    pub fn principals(&self) -> Vec<Principal> {
        self.lock()
            .map(|e| e.principals.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Principal owning `ip:port`.
    pub fn principal_at(&self, ip: Ipv4Addr, port: u32) -> Option<Principal> {
        self.lock()
            .ok()?
            .principals
            .values()
            .find(|p| p.owns(ip, port))
            .cloned()
    }

    // ── Images ──────────────────────────────────────────────────

    /// Register an image.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyExists`] for a known hash,
    /// [`RegistryError::Policy`] if registration fails.
    pub async fn create_image(
        &self,
        hash: &str,
        url: &str,
        revision: &str,
        configs: &str,
    ) -> Result<(), RegistryError> {
        let image = Image {
            hash: hash.to_owned(),
            url: url.to_owned(),
            revision: revision.to_owned(),
            configs: configs.to_owned(),
            endorsements: Default::default(),
        };
        {
            let mut entities = self.lock()?;
            if entities.images.contains_key(hash) {
                return Err(RegistryError::AlreadyExists {
                    kind: "image",
                    key: hash.to_owned(),
                });
            }
            entities.images.insert(hash.to_owned(), image.clone());
        }

        if let Err(err) = self
            .policy
            .register_image(&self.identity.speaker, &image.claim())
            .await
        {
            if let Ok(mut entities) = self.lock() {
                entities.images.remove(hash);
            }
            return Err(err.into());
        }

        self.enqueue(Change::upsert(Collection::Images, hash, image.to_entry()));
        Ok(())
    }

    /// Endorse a known image with `property`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] for an unknown hash,
    /// [`RegistryError::Policy`] if the endorsement fails.
    pub async fn endorse_image(&self, hash: &str, property: &str) -> Result<(), RegistryError> {
        let (configs, added) = {
            let mut entities = self.lock()?;
            let image = entities
                .images
                .get_mut(hash)
                .ok_or_else(|| RegistryError::NotFound {
                    kind: "image",
                    key: hash.to_owned(),
                })?;
            (image.configs.clone(), image.endorsements.insert(property.to_owned()))
        };

        if let Err(err) = self
            .policy
            .endorse_image(&self.identity.speaker, hash, &configs, property)
            .await
        {
            if added {
                if let Some(image) = self.lock()?.images.get_mut(hash) {
                    image.endorsements.remove(property);
                }
            }
            return Err(err.into());
        }

        if let Some(image) = self.image(hash) {
            self.enqueue(Change::upsert(Collection::Images, hash, image.to_entry()));
        }
        Ok(())
    }

    /// Whether image `hash` is known.
    pub fn has_image(&self, hash: &str) -> bool {
        self.lock()
            .map(|e| e.images.contains_key(hash))
            .unwrap_or(false)
    }

    /// Copy of image `hash`.
    pub fn image(&self, hash: &str) -> Option<Image> {
        self.lock().ok()?.images.get(hash).cloned()
    }

    // ── Accessors ───────────────────────────────────────────────

    /// Attach `requirement` to object `name`, creating it if needed.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Policy`] if the remote post fails.
    pub async fn post_object_acl(&self, name: &str, requirement: &str) -> Result<(), RegistryError> {
        let (created, added) = {
            let mut entities = self.lock()?;
            let created = !entities.accessors.contains_key(name);
            let object = entities
                .accessors
                .entry(name.to_owned())
                .or_insert_with(|| AccessorObject::new(name));
            (created, object.acls.insert(requirement.to_owned()))
        };

        if let Err(err) = self
            .policy
            .post_acl(&self.identity.speaker, name, requirement)
            .await
        {
            let mut entities = self.lock()?;
            if created {
                entities.accessors.remove(name);
            } else if added {
                if let Some(object) = entities.accessors.get_mut(name) {
                    object.acls.remove(requirement);
                }
            }
            return Err(err.into());
        }

        if let Some(object) = self.accessor(name) {
            self.enqueue(Change::upsert(Collection::Accessors, name, object.to_entry()));
        }
        Ok(())
    }

    /// Whether object `name` is known.
    pub fn has_accessor(&self, name: &str) -> bool {
        self.lock()
            .map(|e| e.accessors.contains_key(name))
            .unwrap_or(false)
    }

    /// Copy of object `name`.
    pub fn accessor(&self, name: &str) -> Option<AccessorObject> {
        self.lock().ok()?.accessors.get(name).cloned()
    }

    // ── Queries ─────────────────────────────────────────────────

    /// Ask whether the local principal at `ip:port` has `property`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if no principal owns the address.
    pub async fn attest_property(
        &self,
        ip: Ipv4Addr,
        port: u32,
        property: &str,
    ) -> Result<bool, RegistryError> {
        let principal = self.require_at(ip, port)?;
        let endpoint = Endpoint { ip, port };
        Ok(self
            .policy
            .has_property(&self.identity.speaker, endpoint, property, &principal.bearer)
            .await?)
    }

    /// Ask whether the local principal at `ip:port` may access `object`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if no principal owns the address.
    pub async fn check_access(
        &self,
        ip: Ipv4Addr,
        port: u32,
        object: &str,
    ) -> Result<bool, RegistryError> {
        let principal = self.require_at(ip, port)?;
        let endpoint = Endpoint { ip, port };
        Ok(self
            .policy
            .can_access(&self.identity.speaker, endpoint, object, &principal.bearer)
            .await?)
    }

    // ── Persistence ─────────────────────────────────────────────

    /// The port pool this registry allocates from.
    pub fn ports(&self) -> &PortPool {
        &self.pool
    }

    /// Snapshot file location.
    pub fn snapshot_path(&self) -> &Path {
        &self.sync.path
    }

    /// Copy of the in-memory document as of the last flush.
    pub fn snapshot(&self) -> Snapshot {
        match self.sync.snapshot.lock() {
            Ok(doc) => doc.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Number of changes waiting for the next flush.
    pub fn pending_changes(&self) -> usize {
        self.sync.queue.len()
    }

    /// Wake the flush loop now.
    pub fn flush_now(&self) {
        self.sync.queue.wake();
    }

    /// Flush on the calling task and return the number of changes written.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Snapshot`] if the document cannot be written.
    pub async fn flush(&self) -> Result<usize, RegistryError> {
        Ok(self.sync.flush().await?)
    }

    /// Spawn the flush loop if it is not already running.
    pub fn start_sync(&self) {
        let mut task = match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if task.is_none() {
            *task = Some(SyncHandle::spawn(Arc::clone(&self.sync)));
        }
    }

    /// Stop the flush loop after one last drain-and-write.
    pub async fn stop(&self) {
        let handle = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    /// Discard a flush task inherited across a handoff without waiting on
    /// it. Queued changes are kept.
    pub fn reset_state(&self) {
        let handle = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            warn!("discarding stale flush task");
            handle.abort();
        }
    }

    /// [`Registry::reset_state`] followed by [`Registry::start_sync`].
    pub fn resume(&self) {
        self.reset_state();
        self.start_sync();
    }

    /// Whether the flush loop is running.
    pub fn is_syncing(&self) -> bool {
        self.task.lock().map(|t| t.is_some()).unwrap_or(false)
    }

    fn enqueue(&self, change: Change) {
        self.sync.queue.push(change);
    }

    fn require_at(&self, ip: Ipv4Addr, port: u32) -> Result<Principal, RegistryError> {
        self.principal_at(ip, port)
            .ok_or_else(|| RegistryError::NotFound {
                kind: "principal",
                key: Endpoint { ip, port }.to_string(),
            })
    }

    /// Clear the in-flight mark for `id`, recovering a poisoned lock.
    fn settle(&self, id: u64) -> MutexGuard<'_, Entities> {
        let mut entities = match self.entities.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entities.in_flight.remove(&id);
        entities
    }

    fn lock(&self) -> Result<MutexGuard<'_, Entities>, RegistryError> {
        self.entities
            .lock()
            .map_err(|e| RegistryError::Unavailable(e.to_string()))
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if let Ok(task) = self.task.lock() {
            if let Some(handle) = task.as_ref() {
                handle.signal();
            }
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("identity", &self.identity)
            .field("pool", &self.pool)
            .field("path", &self.sync.path)
            .finish_non_exhaustive()
    }
}

fn set_aside(path: &Path) -> Option<PathBuf> {
    let mut backup = path.as_os_str().to_owned();
    backup.push(".corrupt");
    let backup = PathBuf::from(backup);
    std::fs::rename(path, &backup).ok().map(|()| backup)
}
