use thiserror::Error;

/// Error returned by a [`Generator`](crate::generator::Generator).
///
/// Every variant is terminal for the call. Wrapped causes stay reachable
/// through [`std::error::Error::source`] so the caller can log the full chain.
#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("no config spec provided")]
    MissingSpec,

    #[error("unable to parse spec: {0}")]
    InvalidSpec(#[source] serde_json::Error),

    #[error("unable to create aws session: {0:#}")]
    AuthFailure(#[source] anyhow::Error),

    #[error("unable to get authorization token: {0:#}")]
    UpstreamFailure(#[source] anyhow::Error),

    #[error("unexpected number of authorization tokens. expected 1, found {count}")]
    UnexpectedResponseShape { count: usize },

    #[error("no generator registered for kind '{0}'")]
    UnknownKind(String),
}

/// Fieldless discriminant of [`GeneratorError`] for programmatic branching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeneratorErrorKind {
    MissingSpec,
    InvalidSpec,
    AuthFailure,
    UpstreamFailure,
    UnexpectedResponseShape,
    UnknownKind,
}

impl GeneratorError {
    pub fn kind(&self) -> GeneratorErrorKind {
        match self {
            Self::MissingSpec => GeneratorErrorKind::MissingSpec,
            Self::InvalidSpec(_) => GeneratorErrorKind::InvalidSpec,
            Self::AuthFailure(_) => GeneratorErrorKind::AuthFailure,
            Self::UpstreamFailure(_) => GeneratorErrorKind::UpstreamFailure,
            Self::UnexpectedResponseShape { .. } => GeneratorErrorKind::UnexpectedResponseShape,
            Self::UnknownKind(_) => GeneratorErrorKind::UnknownKind,
        }
    }
}
