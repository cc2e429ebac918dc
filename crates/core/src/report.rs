//! Assessment report schema.
//!
//! Generator output arrives as untyped JSON. `Report::from_value` is the
//! boundary check: anything that does not deserialize into these types or
//! breaks a field constraint is a `ReportViolation`, which the pipeline treats
//! as `invalid_output`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_STRENGTH: u8 = 1;
pub const MAX_STRENGTH: u8 = 5;

const NO_EVIDENCE: &str = "No evidence found";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReportViolation {
    /// The payload did not have the report shape at all.
    #[error("malformed report: {0}")]
    Malformed(String),

    /// The payload parsed but a field is out of range or empty.
    #[error("invalid report field `{field}`: {message}")]
    Constraint { field: String, message: String },
}

impl ReportViolation {
    fn constraint(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Constraint {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Beginner,
    Intermediate,
    Advanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    StrongYes,
    Yes,
    Maybe,
    No,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub github_username: String,
    pub summary_of_work: String,
    #[serde(default)]
    pub notable_repos: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillMatch {
    pub skill: String,
    pub strength: u8,
    #[serde(default)]
    pub evidence_snippets: Vec<String>,
    #[serde(default)]
    pub repos_referenced: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeQuality {
    pub style: String,
    pub readability: String,
    pub testing: String,
    pub documentation: String,
    pub security: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitHabits {
    pub frequency: String,
    pub message_quality: String,
    pub collaboration_signals: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterviewQuestion {
    pub question: String,
    pub rationale: String,
    pub difficulty: Difficulty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFlag {
    pub flag: String,
    pub description: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverallAssessment {
    pub decision_hint: Decision,
    pub justification: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub candidate: Candidate,
    pub skills_match: Vec<SkillMatch>,
    pub code_quality: CodeQuality,
    pub commit_habits: CommitHabits,
    #[serde(default)]
    pub interview_questions: Vec<InterviewQuestion>,
    #[serde(default)]
    pub risk_flags: Vec<RiskFlag>,
    pub overall_assessment: OverallAssessment,
}

impl Report {
    /// Parse and validate an untyped generator payload.
    pub fn from_value(value: serde_json::Value) -> Result<Report, ReportViolation> {
        let report: Report =
            serde_json::from_value(value).map_err(|e| ReportViolation::Malformed(e.to_string()))?;
        report.validate()?;
        Ok(report)
    }

    /// Check field-level constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ReportViolation> {
        if self.skills_match.is_empty() {
            return Err(ReportViolation::constraint("skills_match", "must not be empty"));
        }
        for (i, m) in self.skills_match.iter().enumerate() {
            non_empty(&format!("skills_match[{i}].skill"), &m.skill)?;
            if !(MIN_STRENGTH..=MAX_STRENGTH).contains(&m.strength) {
                return Err(ReportViolation::constraint(
                    format!("skills_match[{i}].strength"),
                    format!("must be between {MIN_STRENGTH} and {MAX_STRENGTH}, got {}", m.strength),
                ));
            }
        }

        non_empty("candidate.summary_of_work", &self.candidate.summary_of_work)?;

        let q = &self.code_quality;
        non_empty("code_quality.style", &q.style)?;
        non_empty("code_quality.readability", &q.readability)?;
        non_empty("code_quality.testing", &q.testing)?;
        non_empty("code_quality.documentation", &q.documentation)?;
        non_empty("code_quality.security", &q.security)?;

        let c = &self.commit_habits;
        non_empty("commit_habits.frequency", &c.frequency)?;
        non_empty("commit_habits.message_quality", &c.message_quality)?;
        non_empty("commit_habits.collaboration_signals", &c.collaboration_signals)?;

        for (i, q) in self.interview_questions.iter().enumerate() {
            non_empty(&format!("interview_questions[{i}].question"), &q.question)?;
        }
        for (i, r) in self.risk_flags.iter().enumerate() {
            non_empty(&format!("risk_flags[{i}].flag"), &r.flag)?;
        }
        non_empty(
            "overall_assessment.justification",
            &self.overall_assessment.justification,
        )?;
        Ok(())
    }

    /// Align a validated report with the job it belongs to.
    ///
    /// The candidate identity always comes from the job, every requested
    /// skill gets an entry (strength 1 when the generator skipped it) and an
    /// empty question list is given one default question.
    pub fn normalized(mut self, identity: &str, skills: &[String]) -> Report {
        self.candidate.github_username = identity.to_string();

        for skill in skills {
            let present = self
                .skills_match
                .iter()
                .any(|m| m.skill.eq_ignore_ascii_case(skill));
            if !present {
                self.skills_match.push(SkillMatch {
                    skill: skill.clone(),
                    strength: MIN_STRENGTH,
                    evidence_snippets: vec![NO_EVIDENCE.to_string()],
                    repos_referenced: Vec::new(),
                });
            }
        }

        if self.interview_questions.is_empty() {
            let topic = skills.first().map(String::as_str).unwrap_or("their work");
            self.interview_questions.push(InterviewQuestion {
                question: format!("Walk us through a project where you used {topic}."),
                rationale: "Establishes hands-on depth with the primary requested skill.".to_string(),
                difficulty: Difficulty::Intermediate,
            });
        }
        self
    }
}

fn non_empty(field: &str, value: &str) -> Result<(), ReportViolation> {
    if value.trim().is_empty() {
        return Err(ReportViolation::constraint(field, "must not be empty"));
    }
    Ok(())
}
