//! Registry entities and their snapshot representation.
//!
//! Numbers are stored as strings in the snapshot. Principal ids are
//! rendered in hex, and read back from either hex or decimal.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::snapshot::SnapshotError;
use crate::policy::{ImageClaim, PrincipalClaim};
use crate::ports::PortRange;

/// A registered workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    /// Caller-supplied id, usually a process id.
    pub id: u64,
    /// Registration sequence number for this id.
    pub generation: u64,
    /// Host address.
    pub ip: Ipv4Addr,
    /// Exclusively owned ports.
    pub ports: PortRange,
    /// Image hash.
    pub image: String,
    /// Rendered configuration.
    pub configs: String,
    /// Credential issued by the policy service.
    pub bearer: String,
    /// Pid of the process that registered it.
    pub speaker: u64,
}

impl Principal {
    /// Name the policy service knows this principal by.
    pub fn name(&self) -> String {
        format!("{}:{}", self.id, self.generation)
    }

    /// Whether this principal owns `ip:port`.
    pub fn owns(&self, ip: Ipv4Addr, port: u32) -> bool {
        self.ip == ip && self.ports.contains(port)
    }

    /// Claim presented to the policy service.
    pub fn claim(&self) -> PrincipalClaim {
        PrincipalClaim {
            name: self.name(),
            ip: self.ip,
            ports: self.ports,
            image: self.image.clone(),
            configs: self.configs.clone(),
        }
    }

    /// Snapshot key: the id in hex.
    pub fn key(&self) -> String {
        principal_key(self.id)
    }

    /// Snapshot representation.
    pub fn to_entry(&self) -> Value {
        serde_json::json!({
            "id": principal_key(self.id),
            "gn": self.generation.to_string(),
            "ip": self.ip.to_string(),
            "lo": self.ports.lo.to_string(),
            "hi": self.ports.hi.to_string(),
            "image": self.image,
            "configs": self.configs,
            "bearer": self.bearer,
            "speaker": self.speaker.to_string(),
        })
    }

    /// Rebuild from a snapshot entry.
    ///
    /// # Errors
    ///
    /// [`SnapshotError::Field`] if a required field is missing or mistyped.
    pub fn from_entry(value: &Value) -> Result<Self, SnapshotError> {
        let entry: PrincipalEntry = serde_json::from_value(value.clone())
            .map_err(|e| SnapshotError::field("principal", e.to_string()))?;

        let id = parse_id(&entry.id)?;
        let lo = parse_number::<u32>("lo", &entry.lo)?;
        let hi = parse_number::<u32>("hi", &entry.hi)?;
        let ports = PortRange::try_new(lo, hi)
            .ok_or_else(|| SnapshotError::field("principal", format!("empty range [{lo}, {hi})")))?;
        let generation = match entry.gn {
            Some(gn) => parse_number::<u64>("gn", &gn)?,
            None => 0,
        };
        let speaker = match entry.speaker {
            Some(s) => parse_number::<u64>("speaker", &s)?,
            None => 0,
        };
        let ip = match entry.ip {
            Some(ip) => ip
                .parse()
                .map_err(|_| SnapshotError::field("principal", format!("bad ip {ip:?}")))?,
            None => Ipv4Addr::UNSPECIFIED,
        };

        Ok(Self {
            id,
            generation,
            ip,
            ports,
            image: entry.image,
            configs: entry.configs,
            bearer: entry.bearer,
            speaker,
        })
    }
}

/// An attestable code image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Content hash.
    pub hash: String,
    /// Origin URL.
    pub url: String,
    /// Source revision.
    pub revision: String,
    /// Free-form configuration.
    pub configs: String,
    /// Properties endorsed so far.
    #[serde(default)]
    pub endorsements: BTreeSet<String>,
}

impl Image {
    /// Claim presented to the policy service.
    pub fn claim(&self) -> ImageClaim {
        ImageClaim {
            hash: self.hash.clone(),
            url: self.url.clone(),
            revision: self.revision.clone(),
            configs: self.configs.clone(),
        }
    }

    /// Snapshot representation.
    pub fn to_entry(&self) -> Value {
        serde_json::json!({
            "hash": self.hash,
            "url": self.url,
            "revision": self.revision,
            "configs": self.configs,
            "endorsements": self.endorsements.iter().collect::<Vec<_>>(),
        })
    }

    /// Rebuild from a snapshot entry.
    ///
    /// # Errors
    ///
    /// [`SnapshotError::Field`] if a required field is missing or mistyped.
    pub fn from_entry(value: &Value) -> Result<Self, SnapshotError> {
        serde_json::from_value(value.clone()).map_err(|e| SnapshotError::field("image", e.to_string()))
    }
}

/// A named object guarded by access requirements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessorObject {
    /// Object name.
    pub name: String,
    /// Policy requirements; a set.
    pub acls: BTreeSet<String>,
}

impl AccessorObject {
    /// Object with no requirements yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            acls: BTreeSet::new(),
        }
    }

    /// Snapshot representation.
    pub fn to_entry(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "acls": self.acls.iter().collect::<Vec<_>>(),
        })
    }

    /// Rebuild from a snapshot entry.
    ///
    /// # Errors
    ///
    /// [`SnapshotError::Field`] if a required field is missing or mistyped.
    pub fn from_entry(value: &Value) -> Result<Self, SnapshotError> {
        serde_json::from_value(value.clone())
            .map_err(|e| SnapshotError::field("accessor", e.to_string()))
    }
}

/// Snapshot key for a principal id.
pub fn principal_key(id: u64) -> String {
    format!("{id:#x}")
}

/// Parse a principal id written in hex (`0x` prefix) or decimal.
///
/// # Errors
///
/// [`SnapshotError::Field`] if the text is neither.
pub fn parse_id(raw: &str) -> Result<u64, SnapshotError> {
    let trimmed = raw.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => trimmed.parse(),
    };
    parsed.map_err(|_| SnapshotError::field("principal", format!("bad id {raw:?}")))
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, SnapshotError> {
    raw.trim()
        .parse()
        .map_err(|_| SnapshotError::field("principal", format!("bad {name} {raw:?}")))
}

#[derive(Deserialize)]
struct PrincipalEntry {
    id: String,
    #[serde(default)]
    gn: Option<String>,
    #[serde(default)]
    ip: Option<String>,
    lo: String,
    hi: String,
    image: String,
    configs: String,
    bearer: String,
    #[serde(default)]
    speaker: Option<String>,
}
