use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::artifact::{Artifact, ItemFilters};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Upstream throttled us; `retry_after` may carry the reset hint.
    RateLimited,
    /// The identity does not exist upstream.
    NotFound,
    /// Timeouts, connection resets, 5xx.
    Transient,
    /// Anything retrying cannot fix.
    Permanent,
}

impl FetchErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchErrorKind::RateLimited => "rate_limited",
            FetchErrorKind::NotFound => "not_found",
            FetchErrorKind::Transient => "transient",
            FetchErrorKind::Permanent => "permanent",
        }
    }
}

impl core::fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("fetch failed ({kind}): {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(FetchErrorKind::RateLimited, message)
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::NotFound, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Permanent, message)
    }
}

/// Source of artifacts for an identity.
///
/// Implementations return at most `max_items` artifacts, most relevant first.
/// Any internal retrying (e.g. waiting out a rate-limit window) is the
/// implementation's business; what it cannot absorb it must surface as a
/// classified `FetchError`.
#[async_trait]
pub trait DataFetcher: Send + Sync + 'static {
    async fn fetch(
        &self,
        identity: &str,
        max_items: usize,
        filters: &ItemFilters,
    ) -> Result<Vec<Artifact>, FetchError>;
}

#[async_trait]
impl<T> DataFetcher for Arc<T>
where
    T: DataFetcher + ?Sized,
{
    async fn fetch(
        &self,
        identity: &str,
        max_items: usize,
        filters: &ItemFilters,
    ) -> Result<Vec<Artifact>, FetchError> {
        (**self).fetch(identity, max_items, filters).await
    }
}
