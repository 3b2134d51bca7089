//! Policy client over the service's JSON-over-HTTP API.
//!
//! Every call is a `POST` to `<base>/<endpoint>` with
//! `{"principal", "otherValues", "bearerRef"?}` and answers with
//! `{"message"}`. Boolean queries are decided by a marker word in the
//! message.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::{
    check_http_response, EndorseTarget, Endpoint, ImageClaim, PolicyClient, PolicyError,
    PrincipalClaim,
};
use crate::config::PolicyConfig;

const HAS_PROPERTY: &str = "programHasProperty";
const APPROVE_ACCESS: &str = "approveAccess";
const HAS_SAFETY_PROPERTY: &str = "hasSafetyProperty";

// ---------------------------------------------------------------------------
// Wire types (pub for integration testing)
// ---------------------------------------------------------------------------

/// Request body shared by every endpoint.
#[doc(hidden)]
#[derive(Debug, Serialize)]
pub struct PolicyRequest<'a> {
    /// Identity the claim is made as.
    pub principal: &'a str,
    /// Positional arguments.
    #[serde(rename = "otherValues")]
    pub other_values: Vec<String>,
    /// Bearer token of the principal being asked about.
    #[serde(rename = "bearerRef", skip_serializing_if = "Option::is_none")]
    pub bearer_ref: Option<&'a str>,
}

/// Pull the `message` string out of a response body.
///
/// # Errors
///
/// [`PolicyError::Malformed`] if the body is not JSON or lacks a string
/// `message`.
pub fn parse_message(body: &str) -> Result<String, PolicyError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| PolicyError::Malformed(format!("response is not JSON: {e}")))?;
    value
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| PolicyError::Malformed("response has no string `message`".to_owned()))
}

/// The bearer token is quoted in single quotes inside the registration
/// message; take everything between the first and last quote.
///
/// # Errors
///
/// [`PolicyError::Malformed`] if the message has fewer than two quotes.
pub fn extract_bearer(message: &str) -> Result<String, PolicyError> {
    let malformed = || PolicyError::Malformed(format!("no quoted key in message: {message}"));
    let first = message.find('\'').ok_or_else(malformed)?;
    let last = message.rfind('\'').ok_or_else(malformed)?;
    if last == first {
        return Err(malformed());
    }
    let start = first.checked_add(1).ok_or_else(malformed)?;
    message
        .get(start..last)
        .map(str::to_owned)
        .ok_or_else(malformed)
}

/// Objects without a namespace are scoped to the posting speaker.
pub fn acl_object(speaker: &str, object: &str) -> String {
    if object.contains(':') {
        object.to_owned()
    } else {
        format!("{speaker}:{object}")
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// [`PolicyClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpPolicyClient {
    client: reqwest::Client,
    base: Url,
    iaas_identity: String,
    attest_identity: String,
}

impl HttpPolicyClient {
    /// Build a client from the `[policy]` config section.
    ///
    /// # Errors
    ///
    /// [`PolicyError::Malformed`] for an unparsable URL,
    /// [`PolicyError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: &PolicyConfig) -> Result<Self, PolicyError> {
        let mut raw = config.url.clone();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw)
            .map_err(|e| PolicyError::Malformed(format!("invalid policy url {raw:?}: {e}")))?;

        let mut builder = reqwest::Client::builder();
        if config.request_timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.request_timeout_secs));
        }

        Ok(Self {
            client: builder.build()?,
            base,
            iaas_identity: config.iaas_identity.clone(),
            attest_identity: config.attest_identity.clone(),
        })
    }

    /// Base URL requests are sent under.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    async fn call(
        &self,
        endpoint: &str,
        speaker: &str,
        other_values: Vec<String>,
        bearer_ref: Option<&str>,
    ) -> Result<String, PolicyError> {
        let url = self
            .base
            .join(endpoint)
            .map_err(|e| PolicyError::Malformed(format!("bad endpoint {endpoint}: {e}")))?;
        debug!(endpoint, speaker, "policy call");

        let response = self
            .client
            .post(url)
            .json(&PolicyRequest {
                principal: speaker,
                other_values,
                bearer_ref: bearer_ref.filter(|bearer| !bearer.is_empty()),
            })
            .send()
            .await?;

        let body = check_http_response(response).await?;
        parse_message(&body)
    }

    fn instance_values(claim: &PrincipalClaim) -> Vec<String> {
        vec![
            claim.name.clone(),
            claim.image.clone(),
            "image".to_owned(),
            claim.subject(),
            claim.configs.clone(),
        ]
    }
}

#[async_trait]
impl PolicyClient for HttpPolicyClient {
    async fn register_principal(
        &self,
        speaker: &str,
        claim: &PrincipalClaim,
    ) -> Result<String, PolicyError> {
        let message = self
            .call(
                "postInstanceSet",
                speaker,
                Self::instance_values(claim),
                None,
            )
            .await?;
        let key = extract_bearer(&message)?;
        self.call("updateSubjectSet", &claim.subject(), vec![key.clone()], None)
            .await?;
        Ok(key)
    }

    async fn retract_principal(
        &self,
        speaker: &str,
        claim: &PrincipalClaim,
    ) -> Result<(), PolicyError> {
        self.call(
            "retractInstanceSet",
            speaker,
            Self::instance_values(claim),
            None,
        )
        .await?;
        Ok(())
    }

    async fn register_image(&self, speaker: &str, image: &ImageClaim) -> Result<(), PolicyError> {
        self.call(
            "postAttesterImage",
            speaker,
            vec![image.hash.clone(), image.configs.clone()],
            None,
        )
        .await?;
        self.call(
            "postImageProperty",
            &self.iaas_identity,
            vec![
                image.hash.clone(),
                format!("{}#{}", image.url, image.revision),
                image.configs.clone(),
            ],
            None,
        )
        .await?;
        Ok(())
    }

    async fn post_acl(
        &self,
        speaker: &str,
        object: &str,
        requirement: &str,
    ) -> Result<(), PolicyError> {
        self.call(
            "postObjectAcl",
            speaker,
            vec![acl_object(speaker, object), requirement.to_owned()],
            None,
        )
        .await?;
        Ok(())
    }

    async fn endorse_image(
        &self,
        speaker: &str,
        image: &str,
        config: &str,
        property: &str,
    ) -> Result<(), PolicyError> {
        self.call(
            "postImageProperty",
            speaker,
            vec![image.to_owned(), config.to_owned(), property.to_owned()],
            None,
        )
        .await?;
        Ok(())
    }

    async fn endorse_source(
        &self,
        speaker: &str,
        image: &str,
        config: &str,
        source: &str,
    ) -> Result<(), PolicyError> {
        self.call(
            "postImageSource",
            speaker,
            vec![image.to_owned(), config.to_owned(), source.to_owned()],
            None,
        )
        .await?;
        Ok(())
    }

    async fn endorse_attester(
        &self,
        _speaker: &str,
        target: EndorseTarget,
        id: &str,
        config: &str,
    ) -> Result<(), PolicyError> {
        let endpoint = match target {
            EndorseTarget::Image => "postAttesterImage",
            EndorseTarget::Source => "postAttesterSource",
        };
        self.call(
            endpoint,
            &self.iaas_identity,
            vec![id.to_owned(), config.to_owned()],
            None,
        )
        .await?;
        Ok(())
    }

    async fn endorse_builder(
        &self,
        _speaker: &str,
        target: EndorseTarget,
        id: &str,
        config: &str,
    ) -> Result<(), PolicyError> {
        let endpoint = match target {
            EndorseTarget::Image => "postBuilderImage",
            EndorseTarget::Source => "postSourceImage",
        };
        self.call(
            endpoint,
            &self.iaas_identity,
            vec![id.to_owned(), config.to_owned()],
            None,
        )
        .await?;
        Ok(())
    }

    async fn endorse_membership(
        &self,
        speaker: &str,
        endpoint: Endpoint,
        property: &str,
        config: &str,
    ) -> Result<(), PolicyError> {
        self.call(
            "postWorkerSet",
            speaker,
            vec![property.to_owned(), endpoint.to_string(), config.to_owned()],
            None,
        )
        .await?;
        Ok(())
    }

    async fn has_property(
        &self,
        _speaker: &str,
        endpoint: Endpoint,
        property: &str,
        bearer: &str,
    ) -> Result<bool, PolicyError> {
        let message = self
            .call(
                "attestAppProperty",
                &self.attest_identity,
                vec![endpoint.to_string(), property.to_owned()],
                Some(bearer),
            )
            .await?;
        Ok(message.contains(HAS_PROPERTY))
    }

    async fn can_access(
        &self,
        _speaker: &str,
        endpoint: Endpoint,
        object: &str,
        bearer: &str,
    ) -> Result<bool, PolicyError> {
        let message = self
            .call(
                "appAccessesObject",
                &self.attest_identity,
                vec![endpoint.to_string(), object.to_owned()],
                Some(bearer),
            )
            .await?;
        Ok(message.contains(APPROVE_ACCESS))
    }

    async fn can_worker_access(
        &self,
        _speaker: &str,
        endpoint: Endpoint,
        object: &str,
        bearer: &str,
    ) -> Result<bool, PolicyError> {
        let message = self
            .call(
                "workerAccessesObject",
                &self.attest_identity,
                vec![endpoint.to_string(), object.to_owned()],
                Some(bearer),
            )
            .await?;
        Ok(message.contains(APPROVE_ACCESS))
    }

    async fn attest(
        &self,
        speaker: &str,
        endpoint: Endpoint,
        bearer: &str,
    ) -> Result<String, PolicyError> {
        self.call(
            "attestInstance",
            speaker,
            vec![endpoint.to_string()],
            Some(bearer),
        )
        .await
    }

    async fn image_has_property(
        &self,
        _speaker: &str,
        image: &str,
        config: &str,
        property: &str,
    ) -> Result<bool, PolicyError> {
        let message = self
            .call(
                "checkImgProperty",
                &self.attest_identity,
                vec![image.to_owned(), config.to_owned(), property.to_owned()],
                None,
            )
            .await?;
        Ok(message.contains(HAS_SAFETY_PROPERTY))
    }
}
