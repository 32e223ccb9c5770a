use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::GeneratorError;

pub mod ecr;
pub mod registry;

pub use ecr::EcrAuthorizationTokenGenerator;
pub use registry::GeneratorRegistry;

/// Secret material produced by a generator, keyed by secret data key.
pub type SecretBundle = HashMap<String, Vec<u8>>;

/// Credential generation strategy
///
/// Implementations are stateless with respect to a single request: every call
/// to [`Generator::generate`] produces a fresh bundle derived only from its
/// arguments. Dropping the returned future cancels any outstanding upstream
/// calls.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generator kind identifier used for dispatch (e.g. "ECRAuthorizationToken")
    fn kind(&self) -> &str;

    /// Generate a secret bundle
    ///
    /// # Arguments
    /// * `spec` - Raw JSON configuration object, `None` if the request carried none
    /// * `kube` - Cluster client used to resolve identity objects
    /// * `namespace` - Namespace in which referenced identity objects live
    async fn generate(
        &self,
        spec: Option<&[u8]>,
        kube: &kube::Client,
        namespace: &str,
    ) -> Result<SecretBundle, GeneratorError>;
}
