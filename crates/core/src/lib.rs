//! `gitgauge-core`: job domain building blocks.
//!
//! This crate contains **pure domain** types (no infrastructure concerns): the
//! job record and its state machine, the analysis request snapshot, and the
//! report schema the pipeline must produce.

pub mod error;
pub mod id;
pub mod input;
pub mod job;
pub mod report;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use input::{JobInput, NewJob};
pub use job::{ErrorKind, Job, JobError, JobPatch, JobStatus, JobSummary, PipelineStage};
pub use report::{
    Candidate, CodeQuality, CommitHabits, Decision, Difficulty, InterviewQuestion,
    OverallAssessment, Report, ReportViolation, RiskFlag, Severity, SkillMatch,
};
