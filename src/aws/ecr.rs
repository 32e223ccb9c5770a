use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_ecr::config::retry::RetryConfig;
use aws_sdk_ecr::Client as EcrClient;
use chrono::{DateTime, Utc};

use super::format_sdk_error;

/// A single authorization entry returned by ECR
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRecord {
    /// Base64 encoded `AWS:<password>` token
    pub authorization_token: String,
    /// Registry URL the token is valid for
    pub proxy_endpoint: String,
    pub expires_at: DateTime<Utc>,
}

/// Registry API used to issue authorization tokens
#[async_trait]
pub trait AuthorizationTokenApi: Send + Sync {
    /// Issue authorization tokens signed with the given session
    ///
    /// Exactly one outbound request is made per call.
    async fn get_authorization_token(&self, session: &SdkConfig)
        -> Result<Vec<AuthorizationRecord>>;
}

/// [`AuthorizationTokenApi`] backed by the AWS ECR SDK
#[derive(Debug, Clone, Default)]
pub struct EcrTokenApi;

impl EcrTokenApi {
    pub fn new() -> Self {
        Self
    }

    fn client(session: &SdkConfig) -> EcrClient {
        // Re-invocation policy belongs to the caller.
        let config = aws_sdk_ecr::config::Builder::from(session)
            .retry_config(RetryConfig::disabled())
            .build();
        EcrClient::from_conf(config)
    }
}

#[async_trait]
impl AuthorizationTokenApi for EcrTokenApi {
    async fn get_authorization_token(
        &self,
        session: &SdkConfig,
    ) -> Result<Vec<AuthorizationRecord>> {
        tracing::debug!(
            region = ?session.region(),
            "Requesting ECR authorization token"
        );

        let response = Self::client(session)
            .get_authorization_token()
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("{}", format_sdk_error(&e)))?;

        response
            .authorization_data()
            .iter()
            .map(|data| {
                let authorization_token = data
                    .authorization_token()
                    .filter(|t| !t.is_empty())
                    .context("No authorization token in response")?;
                let proxy_endpoint = data
                    .proxy_endpoint()
                    .filter(|e| !e.is_empty())
                    .context("No proxy endpoint in response")?;
                let expires_at = data
                    .expires_at()
                    .context("No expiry in response")?;
                let expires_at = DateTime::<Utc>::from_timestamp(expires_at.secs(), 0)
                    .context("Expiry timestamp out of range")?;

                Ok(AuthorizationRecord {
                    authorization_token: authorization_token.to_string(),
                    proxy_endpoint: proxy_endpoint.to_string(),
                    expires_at,
                })
            })
            .collect()
    }
}
