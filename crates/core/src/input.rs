//! Analysis request snapshot.
//!
//! `NewJob` is what a caller submits; `JobInput` is the validated, immutable
//! copy stored on the job record. The pipeline only ever reads `JobInput`.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

pub const DEFAULT_REPO_LIMIT: u32 = 10;
pub const DEFAULT_MAX_FILES_PER_REPO: u32 = 5;
pub const MAX_REPO_LIMIT: u32 = 50;
pub const MAX_FILES_PER_REPO: u32 = 50;
pub const MAX_SKILLS: usize = 20;
pub const MAX_GUIDANCE_CHARS: usize = 2000;

const MAX_IDENTITY_LEN: usize = 39;

/// Unvalidated creation request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub github_username: String,
    pub skills: Vec<String>,
    #[serde(default)]
    pub repo_limit: Option<u32>,
    #[serde(default)]
    pub max_files_per_repo: Option<u32>,
    #[serde(default)]
    pub languages: Option<Vec<String>>,
    #[serde(default)]
    pub notes_for_ai: Option<String>,
}

impl NewJob {
    pub fn new(github_username: impl Into<String>, skills: Vec<String>) -> Self {
        Self {
            github_username: github_username.into(),
            skills,
            ..Default::default()
        }
    }
}

/// Immutable request snapshot captured at job creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInput {
    github_username: String,
    skills: Vec<String>,
    repo_limit: u32,
    max_files_per_repo: u32,
    languages: Vec<String>,
    notes_for_ai: Option<String>,
}

impl JobInput {
    /// Validate a creation request and normalize it into a snapshot.
    pub fn new(request: NewJob) -> DomainResult<Self> {
        let github_username = validate_identity(&request.github_username)?;
        let skills = normalize_list(request.skills, "skills")?;
        if skills.is_empty() {
            return Err(DomainError::validation("skills must contain at least one entry"));
        }
        if skills.len() > MAX_SKILLS {
            return Err(DomainError::validation(format!(
                "skills may contain at most {MAX_SKILLS} entries"
            )));
        }

        let repo_limit = bounded(request.repo_limit, DEFAULT_REPO_LIMIT, MAX_REPO_LIMIT, "repo_limit")?;
        let max_files_per_repo = bounded(
            request.max_files_per_repo,
            DEFAULT_MAX_FILES_PER_REPO,
            MAX_FILES_PER_REPO,
            "max_files_per_repo",
        )?;
        let languages = normalize_list(request.languages.unwrap_or_default(), "languages")?;

        let notes_for_ai = match request.notes_for_ai.map(|n| n.trim().to_string()) {
            Some(n) if n.is_empty() => None,
            Some(n) if n.chars().count() > MAX_GUIDANCE_CHARS => {
                return Err(DomainError::validation(format!(
                    "notes_for_ai may be at most {MAX_GUIDANCE_CHARS} characters"
                )));
            }
            other => other,
        };

        Ok(Self {
            github_username,
            skills,
            repo_limit,
            max_files_per_repo,
            languages,
            notes_for_ai,
        })
    }

    pub fn github_username(&self) -> &str {
        &self.github_username
    }

    pub fn skills(&self) -> &[String] {
        &self.skills
    }

    pub fn repo_limit(&self) -> u32 {
        self.repo_limit
    }

    pub fn max_files_per_repo(&self) -> u32 {
        self.max_files_per_repo
    }

    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    pub fn notes_for_ai(&self) -> Option<&str> {
        self.notes_for_ai.as_deref()
    }
}

/// GitHub logins: 1-39 chars, ASCII alphanumerics or single hyphens, no hyphen at either end.
fn validate_identity(raw: &str) -> DomainResult<String> {
    let identity = raw.trim();
    if identity.is_empty() {
        return Err(DomainError::validation("github_username is required"));
    }
    if identity.len() > MAX_IDENTITY_LEN {
        return Err(DomainError::validation(format!(
            "github_username may be at most {MAX_IDENTITY_LEN} characters"
        )));
    }
    if !identity.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(DomainError::validation(
            "github_username may only contain ASCII letters, digits and '-'",
        ));
    }
    if identity.starts_with('-') || identity.ends_with('-') || identity.contains("--") {
        return Err(DomainError::validation(
            "github_username may not start or end with '-' or contain '--'",
        ));
    }
    Ok(identity.to_string())
}

/// Trim entries, reject blanks, drop case-insensitive duplicates (first spelling wins).
fn normalize_list(values: Vec<String>, field: &str) -> DomainResult<Vec<String>> {
    let mut out: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation(format!("{field} may not contain blank entries")));
        }
        if !out.iter().any(|existing| existing.eq_ignore_ascii_case(trimmed)) {
            out.push(trimmed.to_string());
        }
    }
    Ok(out)
}

fn bounded(value: Option<u32>, default: u32, max: u32, field: &str) -> DomainResult<u32> {
    match value {
        None => Ok(default),
        Some(v) if (1..=max).contains(&v) => Ok(v),
        Some(v) => Err(DomainError::validation(format!(
            "{field} must be between 1 and {max} (got {v})"
        ))),
    }
}
