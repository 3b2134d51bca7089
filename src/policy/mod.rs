//! Remote policy service abstraction.
//!
//! The daemon never evaluates properties or ACLs itself. It forwards claims
//! to a logic engine behind [`PolicyClient`] and interprets the boolean or
//! string answers.
//!
//! [`http::HttpPolicyClient`] is the shipped implementation.

use std::fmt;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ports::PortRange;

pub mod http;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure talking to the policy service.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// Network or HTTP client failure.
    #[error("policy request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// Response did not have the expected shape.
    #[error("malformed policy response: {0}")]
    Malformed(String),
    /// The service answered with a non-success status.
    #[error("policy service returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, collapsed and truncated.
        body: String,
    },
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

/// A principal as presented to the policy service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalClaim {
    /// Registered name, `"{id}:{generation}"` for dispatcher principals.
    pub name: String,
    /// Host address.
    pub ip: Ipv4Addr,
    /// Owned port range.
    pub ports: PortRange,
    /// Image hash.
    pub image: String,
    /// Rendered configuration string.
    pub configs: String,
}

impl PrincipalClaim {
    /// The `ip:lo-hi` subject string the service keys instances by.
    pub fn subject(&self) -> String {
        format!("{}:{}-{}", self.ip, self.ports.lo, self.ports.hi)
    }
}

/// An image registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageClaim {
    /// Content hash.
    pub hash: String,
    /// Where the image was fetched from.
    pub url: String,
    /// Source revision.
    pub revision: String,
    /// Free-form configuration.
    pub configs: String,
}

/// A single `ip:port` address a query is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Host address.
    pub ip: Ipv4Addr,
    /// Port inside the principal's range.
    pub port: u32,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// What an attester or builder endorsement applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndorseTarget {
    /// A built image.
    #[default]
    Image,
    /// A source tree.
    Source,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Operations the daemon needs from the policy service.
///
/// Calls are not assumed idempotent. Every method may fail with any
/// [`PolicyError`] variant.
#[async_trait]
pub trait PolicyClient: Send + Sync {
    /// Register a running principal; returns its bearer token.
    async fn register_principal(
        &self,
        speaker: &str,
        claim: &PrincipalClaim,
    ) -> Result<String, PolicyError>;

    /// Retract a registration made by [`PolicyClient::register_principal`].
    async fn retract_principal(
        &self,
        speaker: &str,
        claim: &PrincipalClaim,
    ) -> Result<(), PolicyError>;

    /// Register an image.
    async fn register_image(&self, speaker: &str, image: &ImageClaim) -> Result<(), PolicyError>;

    /// Attach an access requirement to an object.
    async fn post_acl(
        &self,
        speaker: &str,
        object: &str,
        requirement: &str,
    ) -> Result<(), PolicyError>;

    /// Endorse an image with a property.
    async fn endorse_image(
        &self,
        speaker: &str,
        image: &str,
        config: &str,
        property: &str,
    ) -> Result<(), PolicyError>;

    /// Record the source an image was built from.
    async fn endorse_source(
        &self,
        speaker: &str,
        image: &str,
        config: &str,
        source: &str,
    ) -> Result<(), PolicyError>;

    /// Declare an image or source a trusted attester.
    async fn endorse_attester(
        &self,
        speaker: &str,
        target: EndorseTarget,
        id: &str,
        config: &str,
    ) -> Result<(), PolicyError>;

    /// Declare an image or source a trusted builder.
    async fn endorse_builder(
        &self,
        speaker: &str,
        target: EndorseTarget,
        id: &str,
        config: &str,
    ) -> Result<(), PolicyError>;

    /// Add a worker endpoint to a membership set.
    async fn endorse_membership(
        &self,
        speaker: &str,
        endpoint: Endpoint,
        property: &str,
        config: &str,
    ) -> Result<(), PolicyError>;

    /// Whether the principal at `endpoint` has `property`.
    async fn has_property(
        &self,
        speaker: &str,
        endpoint: Endpoint,
        property: &str,
        bearer: &str,
    ) -> Result<bool, PolicyError>;

    /// Whether the principal at `endpoint` may access `object`.
    async fn can_access(
        &self,
        speaker: &str,
        endpoint: Endpoint,
        object: &str,
        bearer: &str,
    ) -> Result<bool, PolicyError>;

    /// Whether the worker at `endpoint` may access `object`.
    async fn can_worker_access(
        &self,
        speaker: &str,
        endpoint: Endpoint,
        object: &str,
        bearer: &str,
    ) -> Result<bool, PolicyError>;

    /// Everything the service believes about the principal at `endpoint`.
    async fn attest(
        &self,
        speaker: &str,
        endpoint: Endpoint,
        bearer: &str,
    ) -> Result<String, PolicyError>;

    /// Whether an image under `config` has `property`.
    async fn image_has_property(
        &self,
        speaker: &str,
        image: &str,
        config: &str,
        property: &str,
    ) -> Result<bool, PolicyError>;
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

/// Check the response status and return the body text.
///
/// # Errors
///
/// [`PolicyError::Transport`] if the body cannot be read,
/// [`PolicyError::Status`] on non-2xx.
pub async fn check_http_response(response: reqwest::Response) -> Result<String, PolicyError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(PolicyError::Status {
            status: status.as_u16(),
            body: sanitize_error_body(&body),
        });
    }
    Ok(body)
}

fn sanitize_error_body(raw: &str) -> String {
    const MAX_ERROR_BODY_CHARS: usize = 256;

    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = collapsed
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }
    collapsed
}
