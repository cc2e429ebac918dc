use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::artifact::Artifact;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationErrorKind {
    Transient,
    /// The service answered, but not with something report-shaped.
    InvalidOutput,
    Permanent,
}

impl GenerationErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GenerationErrorKind::Transient => "transient",
            GenerationErrorKind::InvalidOutput => "invalid_output",
            GenerationErrorKind::Permanent => "permanent",
        }
    }
}

impl core::fmt::Display for GenerationErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("generation failed ({kind}): {message}")]
pub struct GenerationError {
    pub kind: GenerationErrorKind,
    pub message: String,
}

impl GenerationError {
    pub fn new(kind: GenerationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(GenerationErrorKind::Transient, message)
    }

    pub fn invalid_output(message: impl Into<String>) -> Self {
        Self::new(GenerationErrorKind::InvalidOutput, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(GenerationErrorKind::Permanent, message)
    }
}

/// Everything the generator sees for one job.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub identity: &'a str,
    pub artifacts: &'a [Artifact],
    pub skills: &'a [String],
    pub guidance: Option<&'a str>,
}

/// Produces a report payload from fetched artifacts.
///
/// The returned JSON is untrusted; callers validate it against the report
/// schema before persisting anything.
#[async_trait]
pub trait AnalysisGenerator: Send + Sync + 'static {
    async fn generate(
        &self,
        request: GenerationRequest<'_>,
    ) -> Result<serde_json::Value, GenerationError>;
}

#[async_trait]
impl<T> AnalysisGenerator for Arc<T>
where
    T: AnalysisGenerator + ?Sized,
{
    async fn generate(
        &self,
        request: GenerationRequest<'_>,
    ) -> Result<serde_json::Value, GenerationError> {
        (**self).generate(request).await
    }
}
