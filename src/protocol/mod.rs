//! Wire messages exchanged over the daemon socket.
//!
//! Bodies are self-describing JSON. A [`Command`] carries a numeric type
//! code and an untyped `statement`; handlers decode the statement into the
//! payload struct they expect. Unknown codes therefore still parse and get
//! a failure status instead of dropping the connection.

pub mod frame;

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::policy::EndorseTarget;

/// Config map key whose lone value is passed through verbatim.
pub const LEGACY_CONFIG_KEY: &str = "LEGACY_CONFIG_STRING";

// ── Errors ──────────────────────────────────────────────────────

/// Connection-level failures. All of them end the session.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Socket read or write failed.
    #[error("connection I/O: {0}")]
    Io(#[from] std::io::Error),

    /// Declared body length is above the configured limit.
    #[error("frame body of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Declared length.
        len: u32,
        /// Configured limit.
        max: u32,
    },

    /// Body does not decode as a message.
    #[error("undecodable message: {0}")]
    Decode(#[from] serde_json::Error),

    /// Peer credentials are missing or report pid 0.
    #[error("peer is not authenticated")]
    Unauthenticated,
}

// ── Command types ───────────────────────────────────────────────

/// Closed set of command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    /// Register a principal.
    CreatePrincipal,
    /// Remove a principal and all its generations.
    DeletePrincipal,
    /// Endorse a principal.
    EndorsePrincipal,
    /// Revoke a principal endorsement.
    RevokePrincipalEndorsement,
    /// Endorse an image or source with a property.
    Endorse,
    /// Revoke an endorsement.
    Revoke,
    /// Look up the principal owning an address.
    GetPrincipal,
    /// Look up a principal by id.
    GetLocalPrincipal,
    /// Report the policy service location.
    GetMetadataConfig,
    /// Add a worker to a membership set.
    EndorseMembership,
    /// Declare a trusted attester.
    EndorseAttesterImage,
    /// Endorse an image property.
    EndorseImageProperty,
    /// Record an image's source.
    EndorseSourceImage,
    /// Declare a trusted builder.
    EndorseBuilderImage,
    /// Ask whether a principal has a property.
    CheckProperty,
    /// Fetch a principal's attestation.
    CheckAttestation,
    /// Ask whether a principal may access an object.
    CheckAccess,
    /// Attach an ACL requirement to an object.
    PostAcl,
    /// Ask whether a worker may access an object.
    CheckWorkerAccess,
    /// Ask whether an image has a property.
    CheckImageProperty,
}

impl CommandType {
    /// Every command type, in code order.
    pub const ALL: [CommandType; 20] = [
        Self::CreatePrincipal,
        Self::DeletePrincipal,
        Self::EndorsePrincipal,
        Self::RevokePrincipalEndorsement,
        Self::Endorse,
        Self::Revoke,
        Self::GetPrincipal,
        Self::GetLocalPrincipal,
        Self::GetMetadataConfig,
        Self::EndorseMembership,
        Self::EndorseAttesterImage,
        Self::EndorseImageProperty,
        Self::EndorseSourceImage,
        Self::EndorseBuilderImage,
        Self::CheckProperty,
        Self::CheckAttestation,
        Self::CheckAccess,
        Self::PostAcl,
        Self::CheckWorkerAccess,
        Self::CheckImageProperty,
    ];

    /// Numeric wire code.
    pub fn code(self) -> u32 {
        match self {
            Self::CreatePrincipal => 0,
            Self::DeletePrincipal => 1,
            Self::EndorsePrincipal => 2,
            Self::RevokePrincipalEndorsement => 3,
            Self::Endorse => 4,
            Self::Revoke => 5,
            Self::GetPrincipal => 6,
            Self::GetLocalPrincipal => 20,
            Self::GetMetadataConfig => 21,
            Self::EndorseMembership => 50,
            Self::EndorseAttesterImage => 51,
            Self::EndorseImageProperty => 52,
            Self::EndorseSourceImage => 53,
            Self::EndorseBuilderImage => 54,
            Self::CheckProperty => 100,
            Self::CheckAttestation => 101,
            Self::CheckAccess => 102,
            Self::PostAcl => 103,
            Self::CheckWorkerAccess => 104,
            Self::CheckImageProperty => 105,
        }
    }

    /// Decode a wire code.
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreatePrincipal => "CREATE_PRINCIPAL",
            Self::DeletePrincipal => "DELETE_PRINCIPAL",
            Self::EndorsePrincipal => "ENDORSE_PRINCIPAL",
            Self::RevokePrincipalEndorsement => "REVOKE_PRINCIPAL_ENDORSEMENT",
            Self::Endorse => "ENDORSE",
            Self::Revoke => "REVOKE",
            Self::GetPrincipal => "GET_PRINCIPAL",
            Self::GetLocalPrincipal => "GET_LOCAL_PRINCIPAL",
            Self::GetMetadataConfig => "GET_METADATA_CONFIG",
            Self::EndorseMembership => "ENDORSE_MEMBERSHIP",
            Self::EndorseAttesterImage => "ENDORSE_ATTESTER_IMAGE",
            Self::EndorseImageProperty => "ENDORSE_IMAGE_PROPERTY",
            Self::EndorseSourceImage => "ENDORSE_SOURCE_IMAGE",
            Self::EndorseBuilderImage => "ENDORSE_BUILDER_IMAGE",
            Self::CheckProperty => "CHECK_PROPERTY",
            Self::CheckAttestation => "CHECK_ATTESTATION",
            Self::CheckAccess => "CHECK_ACCESS",
            Self::PostAcl => "POST_ACL",
            Self::CheckWorkerAccess => "CHECK_WORKER_ACCESS",
            Self::CheckImageProperty => "CHECK_IMAGE_PROPERTY",
        };
        f.write_str(name)
    }
}

// ── Envelopes ───────────────────────────────────────────────────

/// Kernel-reported identity of the connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Credentials {
    /// Process id.
    pub pid: u64,
    /// User id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
}

impl Credentials {
    /// Whether the caller runs as root.
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Inbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Client-chosen request id, echoed nowhere.
    #[serde(default)]
    pub id: u64,
    /// Command type code.
    #[serde(rename = "type")]
    pub kind: u32,
    /// Caller pid; overwritten by the session.
    #[serde(default)]
    pub pid: u64,
    /// Caller uid; overwritten by the session.
    #[serde(default)]
    pub uid: u32,
    /// Caller gid; overwritten by the session.
    #[serde(default)]
    pub gid: u32,
    /// Type-specific payload.
    #[serde(default)]
    pub statement: Option<Value>,
}

impl Command {
    /// Build a command with a typed payload.
    ///
    /// # Errors
    ///
    /// Fails if the payload cannot be represented as JSON.
    pub fn new(kind: CommandType, statement: &impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: 0,
            kind: kind.code(),
            pid: 0,
            uid: 0,
            gid: 0,
            statement: Some(serde_json::to_value(statement)?),
        })
    }

    /// Build a command with no payload.
    pub fn bare(kind: CommandType) -> Self {
        Self {
            id: 0,
            kind: kind.code(),
            pid: 0,
            uid: 0,
            gid: 0,
            statement: None,
        }
    }

    /// Overwrite the caller identity with kernel-reported values.
    pub fn stamp(&mut self, creds: Credentials) {
        self.pid = creds.pid;
        self.uid = creds.uid;
        self.gid = creds.gid;
    }

    /// Caller identity carried by this command.
    pub fn credentials(&self) -> Credentials {
        Credentials {
            pid: self.pid,
            uid: self.uid,
            gid: self.gid,
        }
    }

    /// Decode the payload. `None` when absent, `Err` when mistyped.
    pub fn statement<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.statement
            .as_ref()
            .map(|value| serde_json::from_value(value.clone()))
    }
}

/// Outbound reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Outcome flag plus a human-readable reason.
    Status {
        /// Whether the command succeeded.
        success: bool,
        /// Diagnostic text.
        info: String,
    },
    /// A principal record.
    Principal {
        /// The record.
        principal: PrincipalRecord,
    },
    /// Policy service location.
    Metadata {
        /// Base URL.
        url: String,
    },
    /// Attestation text from the policy service.
    Attestation {
        /// Raw message.
        message: String,
    },
}

impl Response {
    /// Successful status.
    pub fn ok(info: impl Into<String>) -> Self {
        Self::Status {
            success: true,
            info: info.into(),
        }
    }

    /// Failed status.
    pub fn fail(info: impl Into<String>) -> Self {
        Self::Status {
            success: false,
            info: info.into(),
        }
    }

    /// `true` for successful statuses and for every data-carrying reply.
    pub fn is_success(&self) -> bool {
        match self {
            Self::Status { success, .. } => *success,
            _ => true,
        }
    }
}

// ── Statements ──────────────────────────────────────────────────

/// Principal as returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalRecord {
    /// Principal id.
    pub id: u64,
    /// Generation.
    pub gn: u64,
    /// Host address.
    pub ip: String,
    /// First owned port.
    pub port_lo: u32,
    /// One past the last owned port.
    pub port_hi: u32,
    /// Image hash.
    pub image: String,
    /// Rendered configuration.
    pub configs: String,
    /// Bearer token; only shown to the owner or root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer: Option<String>,
    /// Registering pid.
    pub speaker: u64,
}

/// Address and port range for a new principal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSpec {
    /// IPv4 address; the daemon's own when absent.
    pub ip: Option<String>,
    /// Explicit range start.
    pub port_lo: Option<u32>,
    /// Explicit range end.
    pub port_hi: Option<u32>,
    /// Ask the daemon to allocate this many ports instead.
    pub nport: Option<u32>,
}

/// Code identity of a new principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSpec {
    /// Image hash.
    pub image: String,
    /// Configuration map.
    #[serde(default)]
    pub configs: BTreeMap<String, String>,
}

/// `CREATE_PRINCIPAL` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePrincipal {
    /// Principal id.
    pub id: u64,
    /// Address and ports.
    #[serde(default)]
    pub auth: AuthSpec,
    /// Code identity.
    pub code: CodeSpec,
}

/// `DELETE_PRINCIPAL` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalRef {
    /// Principal id.
    pub id: u64,
}

/// `GET_LOCAL_PRINCIPAL` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalPrincipalQuery {
    /// Principal id.
    pub id: u64,
    /// Specific generation; latest when absent.
    #[serde(default)]
    pub gn: Option<u64>,
}

/// `GET_PRINCIPAL` and `CHECK_ATTESTATION` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressQuery {
    /// IPv4 address.
    pub ip: String,
    /// Port.
    pub port: u32,
}

/// `CHECK_PROPERTY` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyQuery {
    /// IPv4 address.
    pub ip: String,
    /// Port.
    pub port: u32,
    /// Property to test.
    pub property: String,
}

/// `CHECK_ACCESS` and `CHECK_WORKER_ACCESS` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessQuery {
    /// IPv4 address.
    pub ip: String,
    /// Port.
    pub port: u32,
    /// Object being accessed.
    pub object: String,
}

/// `CHECK_IMAGE_PROPERTY` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePropertyQuery {
    /// Image hash.
    pub image: String,
    /// Configuration string.
    #[serde(default)]
    pub config: String,
    /// Property to test.
    pub property: String,
}

/// Payload of the image endorsement family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndorseImage {
    /// Image hash or source id.
    pub id: String,
    /// Configuration string.
    #[serde(default)]
    pub config: String,
    /// Whether `id` names an image or a source.
    #[serde(default)]
    pub kind: EndorseTarget,
    /// Endorsed property, or the source for `ENDORSE_SOURCE_IMAGE`.
    #[serde(default)]
    pub property: String,
}

/// One endorsement inside [`EndorseMembership`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endorsement {
    /// Membership property.
    pub property: String,
}

/// `ENDORSE_MEMBERSHIP` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndorseMembership {
    /// Worker address.
    pub ip: String,
    /// Worker port.
    pub port: u32,
    /// Configuration string.
    #[serde(default)]
    pub config: String,
    /// Endorsements; the first is applied.
    #[serde(default)]
    pub endorsements: Vec<Endorsement>,
}

/// `POST_ACL` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostAcl {
    /// Object name.
    pub object: String,
    /// Policy requirement.
    pub requirement: String,
}

/// Flatten a config map into the policy service's string form.
pub fn render_configs(configs: &BTreeMap<String, String>) -> String {
    if configs.len() == 1 {
        if let Some(value) = configs.get(LEGACY_CONFIG_KEY) {
            return value.clone();
        }
    }
    configs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
