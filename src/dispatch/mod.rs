//! Command dispatch.
//!
//! The [`Dispatcher`] maps each [`Command`] to one handler. Handlers decode
//! their payload, apply ownership rules and make their policy call. Every
//! error is turned into a failure [`Response`] here; nothing escapes to the
//! session.
//!
//! CREATE and DELETE on one id are serialized by a per-id lock held
//! across the remote call. The generation table lock is only taken for
//! short in-memory steps, so checks and other ids never wait on a slow
//! policy call. A range being registered is held as a pending reservation
//! until the call settles. Explicit ranges on the daemon's own address that
//! fall inside the local pool are claimed from the pool like `nport` ones.

pub mod generations;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::AttguardConfig;
use crate::policy::{EndorseTarget, Endpoint, PolicyClient, PolicyError};
use crate::ports::{PoolError, PortError, PortRange};
use crate::protocol::{
    render_configs, AccessQuery, AddressQuery, Command, CommandType, CreatePrincipal,
    Credentials, EndorseImage, EndorseMembership, ImagePropertyQuery, LocalPrincipalQuery,
    PostAcl, PrincipalRecord, PrincipalRef, PropertyQuery, Response,
};
use crate::registry::{Principal, Registry, RegistryError};

pub use generations::{GenerationTable, LivePrincipal};

// ── Errors ──────────────────────────────────────────────────────

/// Why a command failed. Rendered into the status `info` text.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Payload absent, mistyped or missing a required value.
    #[error("malformed statement: {0}")]
    Malformed(String),

    /// No live principal matches.
    #[error("principal {0} not found")]
    NotFound(String),

    /// The principal exists but belongs to someone else.
    #[error("pid {caller} may not modify principal {id} registered by pid {owner}")]
    PermissionDenied {
        /// Caller pid.
        caller: u64,
        /// Principal id.
        id: u64,
        /// Registering pid.
        owner: u64,
    },

    /// Ports requested explicitly are already held.
    #[error("ports {range} on {ip} are held by {owner}")]
    PortsInUse {
        /// Host address.
        ip: Ipv4Addr,
        /// Requested range.
        range: PortRange,
        /// Current holder.
        owner: String,
    },

    /// An explicit range only partly overlaps the local pool.
    #[error("ports {range} straddle the local pool {pool}")]
    StraddlesPool {
        /// Requested range.
        range: PortRange,
        /// Pool span.
        pool: PortRange,
    },

    /// Recognised but unsupported command.
    #[error("{0} is not implemented")]
    NotImplemented(CommandType),

    /// Code outside the command set.
    #[error("unknown command type {0}")]
    UnknownType(u32),

    /// Pool allocation failed.
    #[error(transparent)]
    Ports(#[from] PoolError),

    /// Policy service call failed.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// Registry-backed operation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

// ── Dispatcher ──────────────────────────────────────────────────

/// Shared handler for every session.
pub struct Dispatcher {
    speaker: String,
    ip: Ipv4Addr,
    metadata_url: String,
    policy: Arc<dyn PolicyClient>,
    registry: Arc<Registry>,
    table: Mutex<GenerationTable>,
    id_locks: std::sync::Mutex<HashMap<u64, Arc<Mutex<()>>>>,
    next_generation: AtomicU64,
}

impl Dispatcher {
    /// Build a dispatcher speaking as the configured identity.
    ///
    /// Pool allocations for `nport` requests come from `registry`.
    pub fn new(
        config: &AttguardConfig,
        policy: Arc<dyn PolicyClient>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            speaker: config.identity.speaker.clone(),
            ip: config.identity.ip,
            metadata_url: config.policy.url.clone(),
            policy,
            registry,
            table: Mutex::new(GenerationTable::default()),
            id_locks: std::sync::Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Run one command to completion.
    pub async fn dispatch(&self, command: Command) -> Response {
        let Some(kind) = CommandType::from_code(command.kind) else {
            let err = DispatchError::UnknownType(command.kind);
            debug!(code = command.kind, "unknown command type");
            return Response::fail(err.to_string());
        };

        let result = match kind {
            CommandType::CreatePrincipal => self.create_principal(&command).await,
            CommandType::DeletePrincipal => self.delete_principal(&command).await,
            CommandType::EndorsePrincipal
            | CommandType::RevokePrincipalEndorsement
            | CommandType::Revoke => Err(DispatchError::NotImplemented(kind)),
            CommandType::Endorse => self.endorse(&command).await,
            CommandType::GetPrincipal => self.get_principal(&command).await,
            CommandType::GetLocalPrincipal => self.get_local_principal(&command).await,
            CommandType::GetMetadataConfig => Ok(Response::Metadata {
                url: self.metadata_url.clone(),
            }),
            CommandType::EndorseMembership => self.endorse_membership(&command).await,
            CommandType::EndorseAttesterImage => self.endorse_attester(&command).await,
            CommandType::EndorseImageProperty => self.endorse_image_property(&command).await,
            CommandType::EndorseSourceImage => self.endorse_source_image(&command).await,
            CommandType::EndorseBuilderImage => self.endorse_builder(&command).await,
            CommandType::CheckProperty => self.check_property(&command).await,
            CommandType::CheckAttestation => self.check_attestation(&command).await,
            CommandType::CheckAccess => self.check_access(&command, false).await,
            CommandType::PostAcl => self.post_acl(&command).await,
            CommandType::CheckWorkerAccess => self.check_access(&command, true).await,
            CommandType::CheckImageProperty => self.check_image_property(&command).await,
        };

        match result {
            Ok(response) => {
                debug!(%kind, pid = command.pid, "command handled");
                response
            }
            Err(err) => {
                debug!(%kind, pid = command.pid, error = %err, "command failed");
                Response::fail(err.to_string())
            }
        }
    }

    /// Whether any generation of `id` is live.
    pub async fn has_principal(&self, id: u64) -> bool {
        self.table.lock().await.contains(id)
    }

    /// Live generations of `id`, oldest first.
    pub async fn generations(&self, id: u64) -> Vec<Principal> {
        self.table.lock().await.generations(id)
    }

    // ── Principal lifecycle ─────────────────────────────────────

    async fn create_principal(&self, command: &Command) -> Result<Response, DispatchError> {
        let req: CreatePrincipal = payload(command)?;
        required("code.image", &req.code.image)?;
        let ip = match req.auth.ip.as_deref() {
            Some(raw) => parse_ip(raw)?,
            None => self.ip,
        };

        let _serial = self.serialize(req.id).await;

        let (ports, pooled) = match (req.auth.port_lo, req.auth.port_hi, req.auth.nport) {
            (Some(lo), Some(hi), _) => {
                let range = PortRange::try_new(lo, hi).ok_or_else(|| {
                    DispatchError::Malformed(format!("empty port range [{lo}, {hi})"))
                })?;
                (range, self.take_explicit(req.id, ip, range).await?)
            }
            (None, None, Some(n)) if n > 0 => {
                let range = self.registry.ports().allocate_n_ports(req.id, n)?;
                self.table.lock().await.reserve(req.id, ip, range);
                (range, true)
            }
            _ => {
                return Err(DispatchError::Malformed(
                    "auth needs port_lo and port_hi, or a positive nport".to_owned(),
                ))
            }
        };

        let mut principal = Principal {
            id: req.id,
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst),
            ip,
            ports,
            image: req.code.image,
            configs: render_configs(&req.code.configs),
            bearer: String::new(),
            speaker: command.pid,
        };

        let registered = self
            .policy
            .register_principal(&self.speaker, &principal.claim())
            .await;

        let mut table = self.table.lock().await;
        table.unreserve(req.id, ip, ports);
        match registered {
            Ok(bearer) => principal.bearer = bearer,
            Err(err) => {
                drop(table);
                if pooled {
                    self.release(ports);
                }
                return Err(err.into());
            }
        }

        info!(
            id = principal.id,
            gn = principal.generation,
            lo = ports.lo,
            hi = ports.hi,
            speaker = principal.speaker,
            pooled,
            "principal registered"
        );
        let record = record(&principal, true);
        table.insert(LivePrincipal { principal, pooled });
        Ok(Response::Principal { principal: record })
    }

    /// Reserve an explicit range. Returns whether it was claimed from the
    /// local pool and must be released there.
    async fn take_explicit(
        &self,
        id: u64,
        ip: Ipv4Addr,
        range: PortRange,
    ) -> Result<bool, DispatchError> {
        {
            let mut table = self.table.lock().await;
            if let Some(owner) = table.conflict(ip, range) {
                return Err(DispatchError::PortsInUse { ip, range, owner });
            }
            table.reserve(id, ip, range);
        }

        let claimed = if ip == self.ip {
            self.claim_local(id, ip, range)
        } else {
            Ok(false)
        };
        if claimed.is_err() {
            self.table.lock().await.unreserve(id, ip, range);
        }
        claimed
    }

    fn claim_local(&self, id: u64, ip: Ipv4Addr, range: PortRange) -> Result<bool, DispatchError> {
        let pool = self.registry.ports();
        let Some(span) = pool.bounds()? else {
            return Ok(false);
        };
        if !span.overlaps(&range) {
            return Ok(false);
        }
        if range.lo < span.lo || range.hi > span.hi {
            return Err(DispatchError::StraddlesPool { range, pool: span });
        }
        match pool.claim(id, range) {
            Ok(()) => Ok(true),
            Err(PoolError::Ports(PortError::RangeConflict { .. })) => Err(DispatchError::PortsInUse {
                ip,
                range,
                owner: "another pool allocation".to_owned(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_principal(&self, command: &Command) -> Result<Response, DispatchError> {
        let req: PrincipalRef = payload(command)?;
        let caller = command.credentials();

        let _serial = self.serialize(req.id).await;

        let latest = self
            .table
            .lock()
            .await
            .latest(req.id)
            .map(|live| live.principal.clone())
            .ok_or_else(|| DispatchError::NotFound(req.id.to_string()))?;

        if latest.speaker != caller.pid && !caller.is_root() {
            warn!(id = req.id, caller = caller.pid, owner = latest.speaker, "delete refused");
            return Err(DispatchError::PermissionDenied {
                caller: caller.pid,
                id: req.id,
                owner: latest.speaker,
            });
        }

        self.policy
            .retract_principal(&self.speaker, &latest.claim())
            .await?;

        let removed = self.table.lock().await.remove_all(req.id);
        for live in removed.iter().filter(|live| live.pooled) {
            self.release(live.principal.ports);
        }

        info!(id = req.id, generations = removed.len(), "principal deleted");
        Ok(Response::ok(format!("deleted {}", latest.name())))
    }

    async fn get_principal(&self, command: &Command) -> Result<Response, DispatchError> {
        let req: AddressQuery = payload(command)?;
        let ip = parse_ip(&req.ip)?;
        let table = self.table.lock().await;
        let live = table
            .find_at(ip, req.port)
            .ok_or_else(|| DispatchError::NotFound(format!("{ip}:{}", req.port)))?;
        let visible = owns_or_root(&live.principal, command.credentials());
        Ok(Response::Principal {
            principal: record(&live.principal, visible),
        })
    }

    async fn get_local_principal(&self, command: &Command) -> Result<Response, DispatchError> {
        let req: LocalPrincipalQuery = payload(command)?;
        let table = self.table.lock().await;
        let live = match req.gn {
            Some(gn) => table.get(req.id, gn),
            None => table.latest(req.id),
        }
        .ok_or_else(|| DispatchError::NotFound(req.id.to_string()))?;
        let visible = owns_or_root(&live.principal, command.credentials());
        Ok(Response::Principal {
            principal: record(&live.principal, visible),
        })
    }

    // ── Endorsements ────────────────────────────────────────────

    async fn endorse(&self, command: &Command) -> Result<Response, DispatchError> {
        let req: EndorseImage = payload(command)?;
        required("id", &req.id)?;
        required("property", &req.property)?;
        match req.kind {
            EndorseTarget::Image => {
                self.policy
                    .endorse_image(&self.speaker, &req.id, &req.config, &req.property)
                    .await?
            }
            EndorseTarget::Source => {
                self.policy
                    .endorse_source(&self.speaker, &req.id, &req.config, &req.property)
                    .await?
            }
        }
        Ok(Response::ok("endorsed"))
    }

    async fn endorse_membership(&self, command: &Command) -> Result<Response, DispatchError> {
        let req: EndorseMembership = payload(command)?;
        let endpoint = Endpoint {
            ip: parse_ip(&req.ip)?,
            port: req.port,
        };
        let first = req
            .endorsements
            .first()
            .ok_or_else(|| DispatchError::Malformed("endorsements is empty".to_owned()))?;
        required("endorsements[0].property", &first.property)?;
        self.policy
            .endorse_membership(&self.speaker, endpoint, &first.property, &req.config)
            .await?;
        Ok(Response::ok("membership endorsed"))
    }

    async fn endorse_attester(&self, command: &Command) -> Result<Response, DispatchError> {
        let req: EndorseImage = payload(command)?;
        required("id", &req.id)?;
        self.policy
            .endorse_attester(&self.speaker, req.kind, &req.id, &req.config)
            .await?;
        Ok(Response::ok("attester endorsed"))
    }

    async fn endorse_builder(&self, command: &Command) -> Result<Response, DispatchError> {
        let req: EndorseImage = payload(command)?;
        required("id", &req.id)?;
        self.policy
            .endorse_builder(&self.speaker, req.kind, &req.id, &req.config)
            .await?;
        Ok(Response::ok("builder endorsed"))
    }

    async fn endorse_image_property(&self, command: &Command) -> Result<Response, DispatchError> {
        let req: EndorseImage = payload(command)?;
        required("id", &req.id)?;
        required("property", &req.property)?;
        self.policy
            .endorse_image(&self.speaker, &req.id, &req.config, &req.property)
            .await?;
        Ok(Response::ok("image endorsed"))
    }

    async fn endorse_source_image(&self, command: &Command) -> Result<Response, DispatchError> {
        let req: EndorseImage = payload(command)?;
        required("id", &req.id)?;
        required("property", &req.property)?;
        self.policy
            .endorse_source(&self.speaker, &req.id, &req.config, &req.property)
            .await?;
        Ok(Response::ok("source endorsed"))
    }

    async fn post_acl(&self, command: &Command) -> Result<Response, DispatchError> {
        let req: PostAcl = payload(command)?;
        required("object", &req.object)?;
        required("requirement", &req.requirement)?;
        self.registry
            .post_object_acl(&req.object, &req.requirement)
            .await?;
        Ok(Response::ok("acl posted"))
    }

    // ── Checks ──────────────────────────────────────────────────

    async fn check_property(&self, command: &Command) -> Result<Response, DispatchError> {
        let req: PropertyQuery = payload(command)?;
        required("property", &req.property)?;
        let endpoint = Endpoint {
            ip: parse_ip(&req.ip)?,
            port: req.port,
        };
        let bearer = self.bearer_at(endpoint).await;
        let granted = self
            .policy
            .has_property(&self.speaker, endpoint, &req.property, &bearer)
            .await?;
        Ok(verdict(granted))
    }

    async fn check_attestation(&self, command: &Command) -> Result<Response, DispatchError> {
        let req: AddressQuery = payload(command)?;
        let endpoint = Endpoint {
            ip: parse_ip(&req.ip)?,
            port: req.port,
        };
        let bearer = self.bearer_at(endpoint).await;
        let message = self.policy.attest(&self.speaker, endpoint, &bearer).await?;
        Ok(Response::Attestation { message })
    }

    async fn check_access(&self, command: &Command, worker: bool) -> Result<Response, DispatchError> {
        let req: AccessQuery = payload(command)?;
        required("object", &req.object)?;
        let endpoint = Endpoint {
            ip: parse_ip(&req.ip)?,
            port: req.port,
        };
        let bearer = self.bearer_at(endpoint).await;
        let granted = if worker {
            self.policy
                .can_worker_access(&self.speaker, endpoint, &req.object, &bearer)
                .await?
        } else {
            self.policy
                .can_access(&self.speaker, endpoint, &req.object, &bearer)
                .await?
        };
        Ok(verdict(granted))
    }

    async fn check_image_property(&self, command: &Command) -> Result<Response, DispatchError> {
        let req: ImagePropertyQuery = payload(command)?;
        required("image", &req.image)?;
        required("property", &req.property)?;
        let granted = self
            .policy
            .image_has_property(&self.speaker, &req.image, &req.config, &req.property)
            .await?;
        Ok(verdict(granted))
    }

    // ── Helpers ─────────────────────────────────────────────────

    async fn bearer_at(&self, endpoint: Endpoint) -> String {
        self.table
            .lock()
            .await
            .find_at(endpoint.ip, endpoint.port)
            .map(|live| live.principal.bearer.clone())
            .unwrap_or_default()
    }

    /// Per-id lock for CREATE and DELETE. Locks nobody holds are pruned.
    async fn serialize(&self, id: u64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.id_locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(id).or_default())
        };
        lock.lock_owned().await
    }

    fn release(&self, ports: PortRange) {
        if let Err(err) = self.registry.ports().release(ports) {
            warn!(lo = ports.lo, hi = ports.hi, error = %err, "failed to return pooled ports");
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("speaker", &self.speaker)
            .field("ip", &self.ip)
            .finish_non_exhaustive()
    }
}

fn payload<T: DeserializeOwned>(command: &Command) -> Result<T, DispatchError> {
    match command.statement::<T>() {
        Some(Ok(value)) => Ok(value),
        Some(Err(err)) => Err(DispatchError::Malformed(err.to_string())),
        None => Err(DispatchError::Malformed("statement is missing".to_owned())),
    }
}

fn required(field: &str, value: &str) -> Result<(), DispatchError> {
    if value.trim().is_empty() {
        return Err(DispatchError::Malformed(format!("{field} is empty")));
    }
    Ok(())
}

fn parse_ip(raw: &str) -> Result<Ipv4Addr, DispatchError> {
    raw.trim()
        .parse()
        .map_err(|_| DispatchError::Malformed(format!("{raw:?} is not an IPv4 address")))
}

fn owns_or_root(principal: &Principal, caller: Credentials) -> bool {
    caller.is_root() || principal.speaker == caller.pid
}

fn record(principal: &Principal, with_bearer: bool) -> PrincipalRecord {
    PrincipalRecord {
        id: principal.id,
        gn: principal.generation,
        ip: principal.ip.to_string(),
        port_lo: principal.ports.lo,
        port_hi: principal.ports.hi,
        image: principal.image.clone(),
        configs: principal.configs.clone(),
        bearer: with_bearer.then(|| principal.bearer.clone()),
        speaker: principal.speaker,
    }
}

fn verdict(granted: bool) -> Response {
    Response::Status {
        success: granted,
        info: if granted { "granted" } else { "denied" }.to_owned(),
    }
}
