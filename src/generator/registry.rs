use super::{Generator, SecretBundle};
use crate::error::GeneratorError;
use std::collections::HashMap;
use std::sync::Arc;

/// Lookup table from generator kind to implementation
///
/// Built once at startup and handed to whatever dispatches generation requests.
pub struct GeneratorRegistry {
    generators: HashMap<String, Arc<dyn Generator>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self {
            generators: HashMap::new(),
        }
    }

    /// Register a generator under its kind identifier
    ///
    /// Registering a second generator for the same kind replaces the first.
    pub fn register(&mut self, generator: Arc<dyn Generator>) {
        let kind = generator.kind().to_string();
        tracing::debug!(kind = %kind, "Registered generator");
        self.generators.insert(kind, generator);
    }

    /// Get generator by kind
    pub fn get(&self, kind: &str) -> Option<Arc<dyn Generator>> {
        self.generators.get(kind).cloned()
    }

    /// List all registered kinds, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.generators.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Dispatch a request to the generator registered for `kind`
    pub async fn generate(
        &self,
        kind: &str,
        spec: Option<&[u8]>,
        kube: &kube::Client,
        namespace: &str,
    ) -> Result<SecretBundle, GeneratorError> {
        let generator = self
            .get(kind)
            .ok_or_else(|| GeneratorError::UnknownKind(kind.to_string()))?;

        generator.generate(spec, kube, namespace).await.map_err(|e| {
            tracing::error!(kind = %kind, namespace = %namespace, error = ?e, "Generator failed");
            e
        })
    }
}

impl Default for GeneratorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
