//! `gitgauge-analysis`
//!
//! **Responsibility:** boundary to the two external collaborators of the
//! pipeline.
//!
//! - `DataFetcher` turns an identity plus constraints into ranked artifacts.
//! - `AnalysisGenerator` turns artifacts plus requirements into an untyped
//!   report payload. Validation against the report schema happens in the
//!   caller, never here.
//!
//! Both traits surface failures as classified errors so the orchestrator can
//! apply its retry policy. Local implementations (`FixtureFetcher`,
//! `HeuristicGenerator`) make the system runnable without network access.

pub mod artifact;
pub mod fetcher;
pub mod fixture;
pub mod generator;
pub mod heuristic;

pub use artifact::{Artifact, ArtifactFile, ItemFilters};
pub use fetcher::{DataFetcher, FetchError, FetchErrorKind};
pub use fixture::{FixtureFetcher, rank_artifacts};
pub use generator::{AnalysisGenerator, GenerationError, GenerationErrorKind, GenerationRequest};
pub use heuristic::HeuristicGenerator;
