use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_sts::config::Credentials;
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::api::{Api, PostParams};
use std::sync::Arc;
use std::time::SystemTime;

use super::{
    format_sdk_error, AwsAuth, AwsAuthSecretRef, SecretKeySelector, ServiceAccountSelector,
};
use crate::settings::{AwsSettings, Settings};

/// Service account annotation naming the IAM role for web identity federation
pub const ROLE_ARN_ANNOTATION: &str = "eks.amazonaws.com/role-arn";

/// Everything needed to build an authenticated AWS session for one request
pub struct SessionRequest<'a> {
    pub auth: Option<&'a AwsAuth>,
    /// IAM role to assume on top of the base credentials
    pub role: Option<&'a str>,
    pub region: &'a str,
    pub kube: &'a kube::Client,
    /// Namespace used to resolve secrets and service accounts
    pub namespace: &'a str,
}

/// Acquires authenticated AWS sessions
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn acquire_session(&self, request: SessionRequest<'_>) -> Result<SdkConfig>;
}

/// Builds the STS client used for role assumption and web identity exchange
pub trait StsProvider: Send + Sync {
    fn client(&self, config: &SdkConfig) -> aws_sdk_sts::Client;
}

#[derive(Debug, Clone, Default)]
pub struct DefaultStsProvider;

impl StsProvider for DefaultStsProvider {
    fn client(&self, config: &SdkConfig) -> aws_sdk_sts::Client {
        aws_sdk_sts::Client::new(config)
    }
}

/// Issues Kubernetes service account tokens for web identity federation
#[async_trait]
pub trait JwtProvider: Send + Sync {
    async fn service_account_token(
        &self,
        kube: &kube::Client,
        namespace: &str,
        service_account: &str,
        audiences: &[String],
    ) -> Result<String>;
}

/// [`JwtProvider`] using the `token` subresource of the service account
#[derive(Debug, Clone)]
pub struct DefaultJwtProvider {
    expiration_seconds: i64,
}

impl DefaultJwtProvider {
    pub fn new(expiration_seconds: i64) -> Self {
        Self { expiration_seconds }
    }
}

#[async_trait]
impl JwtProvider for DefaultJwtProvider {
    async fn service_account_token(
        &self,
        kube: &kube::Client,
        namespace: &str,
        service_account: &str,
        audiences: &[String],
    ) -> Result<String> {
        let accounts: Api<ServiceAccount> = Api::namespaced(kube.clone(), namespace);

        let request = TokenRequest {
            spec: TokenRequestSpec {
                audiences: audiences.to_vec(),
                expiration_seconds: Some(self.expiration_seconds),
                ..Default::default()
            },
            ..Default::default()
        };

        let response: TokenRequest = accounts
            .create_subresource(
                "token",
                service_account,
                &PostParams::default(),
                serde_json::to_vec(&request).context("Failed to encode token request")?,
            )
            .await
            .with_context(|| {
                format!(
                    "Failed to request token for service account {}/{}",
                    namespace, service_account
                )
            })?;

        response
            .status
            .map(|s| s.token)
            .filter(|t| !t.is_empty())
            .context("Token request returned no token")
    }
}

/// Default session acquisition
///
/// Base credentials come from, in order of preference:
/// 1. a service account token exchanged via `AssumeRoleWithWebIdentity`
/// 2. static credentials stored in Kubernetes secrets
/// 3. the ambient default credential chain (env vars, instance profile, ...)
///
/// If a role is requested it is assumed on top of the base credentials.
/// Credential exchanges run eagerly so that failures surface here rather than
/// on the first signed request.
pub struct DefaultSessionProvider {
    sts: Arc<dyn StsProvider>,
    jwt: Arc<dyn JwtProvider>,
    role_session_name: String,
    default_audience: String,
}

impl DefaultSessionProvider {
    pub fn new(
        settings: &AwsSettings,
        sts: Arc<dyn StsProvider>,
        jwt: Arc<dyn JwtProvider>,
    ) -> Self {
        Self {
            sts,
            jwt,
            role_session_name: settings.role_session_name.clone(),
            default_audience: settings.default_audience.clone(),
        }
    }

    /// Create a provider using the default STS and JWT providers
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            &settings.aws,
            Arc::new(DefaultStsProvider),
            Arc::new(DefaultJwtProvider::new(
                settings.kubernetes.token_expiration_seconds,
            )),
        )
    }

    fn audiences(&self, service_account: &ServiceAccountSelector) -> Vec<String> {
        let mut audiences = vec![self.default_audience.clone()];
        audiences.extend(service_account.audiences.iter().cloned());
        audiences
    }

    async fn web_identity_credentials(
        &self,
        request: &SessionRequest<'_>,
        service_account: &ServiceAccountSelector,
    ) -> Result<Credentials> {
        let accounts: Api<ServiceAccount> =
            Api::namespaced(request.kube.clone(), request.namespace);
        let account = accounts.get(&service_account.name).await.with_context(|| {
            format!(
                "Failed to get service account {}/{}",
                request.namespace, service_account.name
            )
        })?;

        let role_arn = role_arn_annotation(&account)
            .with_context(|| {
                format!(
                    "Service account {}/{} has no {} annotation",
                    request.namespace, service_account.name, ROLE_ARN_ANNOTATION
                )
            })?
            .to_string();

        let token = self
            .jwt
            .service_account_token(
                request.kube,
                request.namespace,
                &service_account.name,
                &self.audiences(service_account),
            )
            .await?;

        tracing::debug!(
            namespace = %request.namespace,
            service_account = %service_account.name,
            role_arn = %role_arn,
            "Exchanging service account token for AWS credentials"
        );

        // AssumeRoleWithWebIdentity is unsigned; no base credentials needed.
        let anonymous = SdkConfig::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(request.region.to_string()))
            .build();

        let output = self
            .sts
            .client(&anonymous)
            .assume_role_with_web_identity()
            .role_arn(&role_arn)
            .role_session_name(&self.role_session_name)
            .web_identity_token(token)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to assume role '{}' with web identity: {}",
                    role_arn,
                    format_sdk_error(&e)
                )
            })?;

        let credentials = output
            .credentials()
            .context("No credentials returned from AssumeRoleWithWebIdentity")?;
        Ok(sts_credentials(credentials, "WebIdentity"))
    }

    async fn assume_role(&self, base: &SdkConfig, role_arn: &str) -> Result<Credentials> {
        tracing::debug!(role_arn = %role_arn, "Assuming IAM role");

        let output = self
            .sts
            .client(base)
            .assume_role()
            .role_arn(role_arn)
            .role_session_name(&self.role_session_name)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to assume role '{}': {}",
                    role_arn,
                    format_sdk_error(&e)
                )
            })?;

        let credentials = output
            .credentials()
            .context("No credentials returned from AssumeRole")?;
        Ok(sts_credentials(credentials, "AssumeRole"))
    }
}

#[async_trait]
impl SessionProvider for DefaultSessionProvider {
    async fn acquire_session(&self, request: SessionRequest<'_>) -> Result<SdkConfig> {
        let base_credentials = match request.auth {
            Some(AwsAuth { jwt: Some(jwt), .. }) => {
                let service_account = jwt
                    .service_account_ref
                    .as_ref()
                    .context("JWT auth requires a serviceAccountRef")?;
                Some(self.web_identity_credentials(&request, service_account).await?)
            }
            Some(AwsAuth {
                secret_ref: Some(secret_ref),
                ..
            }) => Some(
                credentials_from_secret_ref(request.kube, request.namespace, secret_ref).await?,
            ),
            _ => None,
        };

        let base = load_config(request.region, base_credentials).await;

        match request.role.filter(|r| !r.is_empty()) {
            Some(role_arn) => {
                let assumed = self.assume_role(&base, role_arn).await?;
                Ok(load_config(request.region, Some(assumed)).await)
            }
            None => Ok(base),
        }
    }
}

async fn load_config(region: &str, credentials: Option<Credentials>) -> SdkConfig {
    let loader =
        aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));
    match credentials {
        Some(credentials) => loader.credentials_provider(credentials).load().await,
        None => loader.load().await,
    }
}

fn sts_credentials(
    credentials: &aws_sdk_sts::types::Credentials,
    provider: &'static str,
) -> Credentials {
    Credentials::new(
        credentials.access_key_id(),
        credentials.secret_access_key(),
        Some(credentials.session_token().to_string()),
        SystemTime::try_from(credentials.expiration().clone()).ok(),
        provider,
    )
}

fn role_arn_annotation(account: &ServiceAccount) -> Option<&str> {
    account
        .metadata
        .annotations
        .as_ref()?
        .get(ROLE_ARN_ANNOTATION)
        .map(String::as_str)
        .filter(|arn| !arn.is_empty())
}

async fn credentials_from_secret_ref(
    kube: &kube::Client,
    namespace: &str,
    secret_ref: &AwsAuthSecretRef,
) -> Result<Credentials> {
    let secrets: Api<Secret> = Api::namespaced(kube.clone(), namespace);

    let access_key_id = secret_value(&secrets, &secret_ref.access_key_id_secret_ref).await?;
    let secret_access_key =
        secret_value(&secrets, &secret_ref.secret_access_key_secret_ref).await?;
    let session_token = match &secret_ref.session_token_secret_ref {
        Some(selector) => Some(secret_value(&secrets, selector).await?),
        None => None,
    };

    Ok(Credentials::new(
        access_key_id,
        secret_access_key,
        session_token,
        None,
        "KubernetesSecret",
    ))
}

async fn secret_value(secrets: &Api<Secret>, selector: &SecretKeySelector) -> Result<String> {
    let secret = secrets
        .get(&selector.name)
        .await
        .with_context(|| format!("Failed to get secret '{}'", selector.name))?;
    secret_key_value(&secret, selector)
}

fn secret_key_value(secret: &Secret, selector: &SecretKeySelector) -> Result<String> {
    let value = match secret.data.as_ref().and_then(|d| d.get(&selector.key)) {
        Some(bytes) => String::from_utf8(bytes.0.clone()).with_context(|| {
            format!(
                "Key '{}' of secret '{}' is not valid UTF-8",
                selector.key, selector.name
            )
        })?,
        None => secret
            .string_data
            .as_ref()
            .and_then(|d| d.get(&selector.key))
            .cloned()
            .with_context(|| {
                format!(
                    "Secret '{}' has no key '{}'",
                    selector.name, selector.key
                )
            })?,
    };

    if value.is_empty() {
        bail!(
            "Key '{}' of secret '{}' is empty",
            selector.key,
            selector.name
        );
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::AwsJwtAuth;
    use crate::test_support::mock_kube_client;
    use aws_sdk_sts::config::retry::RetryConfig;
    use k8s_openapi::ByteString;
    use kube::client::Body;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Builds STS clients aimed at a closed local port and counts them
    #[derive(Default)]
    struct RefusingSts {
        clients: AtomicUsize,
    }

    impl StsProvider for RefusingSts {
        fn client(&self, config: &SdkConfig) -> aws_sdk_sts::Client {
            self.clients.fetch_add(1, Ordering::SeqCst);
            let config = aws_sdk_sts::config::Builder::from(config)
                .endpoint_url("http://127.0.0.1:1")
                .retry_config(RetryConfig::disabled())
                .build();
            aws_sdk_sts::Client::from_conf(config)
        }
    }

    #[derive(Default)]
    struct RecordingJwt {
        requests: Mutex<Vec<(String, String, Vec<String>)>>,
    }

    #[async_trait]
    impl JwtProvider for RecordingJwt {
        async fn service_account_token(
            &self,
            _kube: &kube::Client,
            namespace: &str,
            service_account: &str,
            audiences: &[String],
        ) -> Result<String> {
            self.requests.lock().unwrap().push((
                namespace.to_string(),
                service_account.to_string(),
                audiences.to_vec(),
            ));
            Ok("header.payload.signature".to_string())
        }
    }

    fn session_provider(
        sts: Arc<RefusingSts>,
        jwt: Arc<RecordingJwt>,
    ) -> DefaultSessionProvider {
        DefaultSessionProvider::new(&AwsSettings::default(), sts, jwt)
    }

    fn json_response<T: serde::Serialize>(value: &T) -> http::Response<Body> {
        http::Response::builder()
            .body(Body::from(serde_json::to_vec(value).unwrap()))
            .unwrap()
    }

    fn service_account(name: &str, role_arn: Option<&str>) -> ServiceAccount {
        let mut account = ServiceAccount::default();
        account.metadata.name = Some(name.to_string());
        account.metadata.annotations = role_arn.map(|arn| {
            BTreeMap::from([(ROLE_ARN_ANNOTATION.to_string(), arn.to_string())])
        });
        account
    }

    fn secret_ref() -> AwsAuthSecretRef {
        AwsAuthSecretRef {
            access_key_id_secret_ref: selector("aws-creds", "access-key"),
            secret_access_key_secret_ref: selector("aws-creds", "secret-key"),
            session_token_secret_ref: None,
        }
    }

    fn jwt_auth(name: &str) -> AwsJwtAuth {
        AwsJwtAuth {
            service_account_ref: Some(ServiceAccountSelector {
                name: name.to_string(),
                audiences: vec!["ecr-generator".to_string()],
            }),
        }
    }

    fn selector(name: &str, key: &str) -> SecretKeySelector {
        SecretKeySelector {
            name: name.to_string(),
            key: key.to_string(),
        }
    }

    fn secret(name: &str, data: &[(&str, &str)]) -> Secret {
        let mut secret = Secret::default();
        secret.metadata.name = Some(name.to_string());
        secret.data = Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect::<BTreeMap<_, _>>(),
        );
        secret
    }

    fn provider() -> DefaultSessionProvider {
        DefaultSessionProvider::from_settings(&Settings::default())
    }

    #[test]
    fn test_secret_key_value_from_data() {
        let secret = secret("aws-creds", &[("access-key", "AKIAEXAMPLE")]);
        let value = secret_key_value(&secret, &selector("aws-creds", "access-key")).unwrap();
        assert_eq!(value, "AKIAEXAMPLE");
    }

    #[test]
    fn test_secret_key_value_from_string_data() {
        let mut secret = Secret::default();
        secret.string_data = Some(BTreeMap::from([(
            "secret-key".to_string(),
            "s3cr3t".to_string(),
        )]));
        let value = secret_key_value(&secret, &selector("aws-creds", "secret-key")).unwrap();
        assert_eq!(value, "s3cr3t");
    }

    #[test]
    fn test_secret_key_value_missing_key() {
        let secret = secret("aws-creds", &[("access-key", "AKIAEXAMPLE")]);
        let err = secret_key_value(&secret, &selector("aws-creds", "secret-key")).unwrap_err();
        assert!(err.to_string().contains("has no key 'secret-key'"));
    }

    #[test]
    fn test_secret_key_value_empty() {
        let secret = secret("aws-creds", &[("access-key", "")]);
        let err = secret_key_value(&secret, &selector("aws-creds", "access-key")).unwrap_err();
        assert!(err.to_string().contains("is empty"));
    }

    #[test]
    fn test_role_arn_annotation() {
        let mut account = ServiceAccount::default();
        assert!(role_arn_annotation(&account).is_none());

        account.metadata.annotations = Some(BTreeMap::from([(
            ROLE_ARN_ANNOTATION.to_string(),
            "arn:aws:iam::123456789012:role/ecr-puller".to_string(),
        )]));
        assert_eq!(
            role_arn_annotation(&account),
            Some("arn:aws:iam::123456789012:role/ecr-puller")
        );
    }

    #[test]
    fn test_audiences_prepend_default() {
        let sa = ServiceAccountSelector {
            name: "ecr-puller".to_string(),
            audiences: vec!["custom-audience".to_string()],
        };
        assert_eq!(
            provider().audiences(&sa),
            vec!["sts.amazonaws.com", "custom-audience"]
        );
    }

    #[tokio::test]
    async fn test_credentials_from_secret_ref() {
        let (kube, mut handle) = mock_kube_client();

        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("request expected");
            assert_eq!(request.method(), http::Method::GET);
            assert_eq!(
                request.uri().path(),
                "/api/v1/namespaces/team-a/secrets/aws-creds"
            );
            let body = serde_json::to_vec(&secret(
                "aws-creds",
                &[("access-key", "AKIAEXAMPLE"), ("secret-key", "s3cr3t")],
            ))
            .unwrap();
            send.send_response(http::Response::builder().body(Body::from(body)).unwrap());

            let (_, send) = handle.next_request().await.expect("request expected");
            let body = serde_json::to_vec(&secret(
                "aws-creds",
                &[("access-key", "AKIAEXAMPLE"), ("secret-key", "s3cr3t")],
            ))
            .unwrap();
            send.send_response(http::Response::builder().body(Body::from(body)).unwrap());
        });

        let secret_ref = AwsAuthSecretRef {
            access_key_id_secret_ref: selector("aws-creds", "access-key"),
            secret_access_key_secret_ref: selector("aws-creds", "secret-key"),
            session_token_secret_ref: None,
        };
        let credentials = credentials_from_secret_ref(&kube, "team-a", &secret_ref)
            .await
            .unwrap();
        server.await.unwrap();

        assert_eq!(credentials.access_key_id(), "AKIAEXAMPLE");
        assert_eq!(credentials.secret_access_key(), "s3cr3t");
        assert!(credentials.session_token().is_none());
    }

    #[tokio::test]
    async fn test_jwt_takes_precedence_over_secret_ref() {
        let (kube, mut handle) = mock_kube_client();
        let sts = Arc::new(RefusingSts::default());
        let jwt = Arc::new(RecordingJwt::default());

        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("request expected");
            assert_eq!(
                request.uri().path(),
                "/api/v1/namespaces/team-a/serviceaccounts/ecr-sa"
            );
            send.send_response(json_response(&service_account(
                "ecr-sa",
                Some("arn:aws:iam::123456789012:role/ecr-puller"),
            )));
        });

        let auth = AwsAuth {
            secret_ref: Some(secret_ref()),
            jwt: Some(jwt_auth("ecr-sa")),
        };
        let err = session_provider(sts.clone(), jwt.clone())
            .acquire_session(SessionRequest {
                auth: Some(&auth),
                role: None,
                region: "us-east-1",
                kube: &kube,
                namespace: "team-a",
            })
            .await
            .unwrap_err();
        server.await.unwrap();

        // The token exchange itself cannot reach STS here.
        assert!(err.to_string().contains("with web identity"));
        assert_eq!(
            *jwt.requests.lock().unwrap(),
            vec![(
                "team-a".to_string(),
                "ecr-sa".to_string(),
                vec!["sts.amazonaws.com".to_string(), "ecr-generator".to_string()],
            )]
        );
        assert_eq!(sts.clients.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_service_account_without_role_annotation() {
        let (kube, mut handle) = mock_kube_client();
        let sts = Arc::new(RefusingSts::default());
        let jwt = Arc::new(RecordingJwt::default());

        let server = tokio::spawn(async move {
            let (_, send) = handle.next_request().await.expect("request expected");
            send.send_response(json_response(&service_account("ecr-sa", None)));
        });

        let auth = AwsAuth {
            secret_ref: None,
            jwt: Some(jwt_auth("ecr-sa")),
        };
        let err = session_provider(sts.clone(), jwt.clone())
            .acquire_session(SessionRequest {
                auth: Some(&auth),
                role: None,
                region: "us-east-1",
                kube: &kube,
                namespace: "team-a",
            })
            .await
            .unwrap_err();
        server.await.unwrap();

        assert!(err
            .to_string()
            .contains("has no eks.amazonaws.com/role-arn annotation"));
        assert!(jwt.requests.lock().unwrap().is_empty());
        assert_eq!(sts.clients.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_jwt_requires_service_account_ref() {
        let (kube, handle) = mock_kube_client();
        // Any cluster request now fails instead of waiting for an answer.
        drop(handle);
        let sts = Arc::new(RefusingSts::default());
        let jwt = Arc::new(RecordingJwt::default());

        let auth = AwsAuth {
            secret_ref: Some(secret_ref()),
            jwt: Some(AwsJwtAuth {
                service_account_ref: None,
            }),
        };
        let err = session_provider(sts.clone(), jwt.clone())
            .acquire_session(SessionRequest {
                auth: Some(&auth),
                role: None,
                region: "us-east-1",
                kube: &kube,
                namespace: "team-a",
            })
            .await
            .unwrap_err();

        assert!(err
            .to_string()
            .contains("JWT auth requires a serviceAccountRef"));
        assert!(jwt.requests.lock().unwrap().is_empty());
        assert_eq!(sts.clients.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_secret_ref_used_without_jwt() {
        let (kube, mut handle) = mock_kube_client();
        let sts = Arc::new(RefusingSts::default());
        let jwt = Arc::new(RecordingJwt::default());

        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let (request, send) = handle.next_request().await.expect("request expected");
                assert_eq!(
                    request.uri().path(),
                    "/api/v1/namespaces/team-a/secrets/aws-creds"
                );
                send.send_response(json_response(&secret(
                    "aws-creds",
                    &[("access-key", "AKIAEXAMPLE"), ("secret-key", "s3cr3t")],
                )));
            }
        });

        let auth = AwsAuth {
            secret_ref: Some(secret_ref()),
            jwt: None,
        };
        let config = session_provider(sts.clone(), jwt.clone())
            .acquire_session(SessionRequest {
                auth: Some(&auth),
                role: Some(""),
                region: "eu-west-1",
                kube: &kube,
                namespace: "team-a",
            })
            .await
            .unwrap();
        server.await.unwrap();

        assert_eq!(config.region().unwrap().as_ref(), "eu-west-1");
        assert!(config.credentials_provider().is_some());
        assert!(jwt.requests.lock().unwrap().is_empty());
        assert_eq!(sts.clients.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_role_skips_sts() {
        let (kube, handle) = mock_kube_client();
        drop(handle);
        let sts = Arc::new(RefusingSts::default());
        let jwt = Arc::new(RecordingJwt::default());

        let config = session_provider(sts.clone(), jwt.clone())
            .acquire_session(SessionRequest {
                auth: None,
                role: Some(""),
                region: "us-east-1",
                kube: &kube,
                namespace: "team-a",
            })
            .await
            .unwrap();

        assert_eq!(config.region().unwrap().as_ref(), "us-east-1");
        assert_eq!(sts.clients.load(Ordering::SeqCst), 0);
        assert!(jwt.requests.lock().unwrap().is_empty());
    }
}
