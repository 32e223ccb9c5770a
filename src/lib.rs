//! Secret generators for a Kubernetes secrets operator.
//!
//! The only generator shipped here is [`EcrAuthorizationTokenGenerator`], which
//! exchanges AWS credentials for a short-lived ECR registry token. Generators
//! are looked up by kind through an explicit [`GeneratorRegistry`].

pub mod aws;
pub mod error;
pub mod generator;
pub mod settings;

pub use error::{GeneratorError, GeneratorErrorKind};
pub use generator::{EcrAuthorizationTokenGenerator, Generator, GeneratorRegistry, SecretBundle};

use std::sync::Arc;

/// Build the registry of every generator this crate provides
pub fn default_registry(settings: &settings::Settings) -> GeneratorRegistry {
    let mut registry = GeneratorRegistry::new();
    registry.register(Arc::new(EcrAuthorizationTokenGenerator::from_settings(
        settings,
    )));
    registry
}
