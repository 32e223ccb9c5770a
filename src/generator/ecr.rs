use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{Generator, SecretBundle};
use crate::aws::{
    AuthorizationTokenApi, AwsAuth, DefaultSessionProvider, EcrTokenApi, SessionProvider,
    SessionRequest,
};
use crate::error::GeneratorError;
use crate::settings::Settings;

/// Generator kind served by [`EcrAuthorizationTokenGenerator`]
pub const ECR_AUTHORIZATION_TOKEN_KIND: &str = "ECRAuthorizationToken";

pub const AUTHORIZATION_TOKEN_KEY: &str = "authorization_token";
pub const PROXY_ENDPOINT_KEY: &str = "proxy_endpoint";
pub const EXPIRES_AT_KEY: &str = "expires_at";

/// `ECRAuthorizationToken` resource; only `spec` is read
#[derive(Debug, Clone, Deserialize)]
pub struct EcrAuthorizationToken {
    pub spec: EcrAuthorizationTokenSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcrAuthorizationTokenSpec {
    /// Region of the registry
    pub region: String,

    /// IAM role to assume, for cross-account access
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AwsAuth>,
}

/// Issues ECR authorization tokens
///
/// Produces a bundle with `authorization_token`, `proxy_endpoint` and
/// `expires_at` (Unix seconds, UTC). Tokens are neither cached nor refreshed.
pub struct EcrAuthorizationTokenGenerator {
    sessions: Arc<dyn SessionProvider>,
    registry: Arc<dyn AuthorizationTokenApi>,
}

impl EcrAuthorizationTokenGenerator {
    pub fn new(
        sessions: Arc<dyn SessionProvider>,
        registry: Arc<dyn AuthorizationTokenApi>,
    ) -> Self {
        Self { sessions, registry }
    }

    /// Create a generator talking to AWS through the default session provider
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            Arc::new(DefaultSessionProvider::from_settings(settings)),
            Arc::new(EcrTokenApi::new()),
        )
    }
}

fn parse_spec(data: &[u8]) -> Result<EcrAuthorizationTokenSpec, serde_json::Error> {
    serde_json::from_slice::<EcrAuthorizationToken>(data).map(|res| res.spec)
}

#[async_trait]
impl Generator for EcrAuthorizationTokenGenerator {
    fn kind(&self) -> &str {
        ECR_AUTHORIZATION_TOKEN_KIND
    }

    async fn generate(
        &self,
        spec: Option<&[u8]>,
        kube: &kube::Client,
        namespace: &str,
    ) -> Result<SecretBundle, GeneratorError> {
        let data = spec.ok_or(GeneratorError::MissingSpec)?;
        let spec = parse_spec(data).map_err(GeneratorError::InvalidSpec)?;

        tracing::info!(
            namespace = %namespace,
            region = %spec.region,
            role = spec.role.as_deref().unwrap_or(""),
            "Generating ECR authorization token"
        );

        let session = self
            .sessions
            .acquire_session(SessionRequest {
                auth: spec.auth.as_ref(),
                role: spec.role.as_deref(),
                region: &spec.region,
                kube,
                namespace,
            })
            .await
            .map_err(GeneratorError::AuthFailure)?;

        let records = self
            .registry
            .get_authorization_token(&session)
            .await
            .map_err(GeneratorError::UpstreamFailure)?;

        let [record] = records.as_slice() else {
            return Err(GeneratorError::UnexpectedResponseShape {
                count: records.len(),
            });
        };

        tracing::debug!(
            proxy_endpoint = %record.proxy_endpoint,
            expires_at = %record.expires_at,
            "Received ECR authorization token"
        );

        Ok(SecretBundle::from([
            (
                AUTHORIZATION_TOKEN_KEY.to_string(),
                record.authorization_token.clone().into_bytes(),
            ),
            (
                PROXY_ENDPOINT_KEY.to_string(),
                record.proxy_endpoint.clone().into_bytes(),
            ),
            (
                EXPIRES_AT_KEY.to_string(),
                record.expires_at.timestamp().to_string().into_bytes(),
            ),
        ]))
    }
}
