//! Deterministic rule-based `AnalysisGenerator`.
//!
//! Model:
//! - Skill strength from artifact evidence: language match +2, name +1 and
//!   description +1 each counted independently, clamped to 1-5.
//! - Qualitative ratings from README coverage, sampled test files and
//!   engagement counters.
//! - Decision tier from mean skill strength.
//!
//! Output is serialized through the typed report so it always passes schema
//! validation.

use std::collections::BTreeMap;

use async_trait::async_trait;

use gitgauge_core::report::{MAX_STRENGTH, MIN_STRENGTH};
use gitgauge_core::{
    Candidate, CodeQuality, CommitHabits, Decision, Difficulty, InterviewQuestion, OverallAssessment,
    Report, RiskFlag, Severity, SkillMatch,
};

use crate::artifact::Artifact;
use crate::generator::{AnalysisGenerator, GenerationError, GenerationRequest};

const MAX_EVIDENCE: usize = 3;
const MAX_NOTABLE: usize = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicGenerator;

impl HeuristicGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, request: GenerationRequest<'_>) -> Report {
        let artifacts = request.artifacts;
        let skills_match: Vec<SkillMatch> = request
            .skills
            .iter()
            .map(|skill| skill_match(skill, artifacts))
            .collect();

        let mean_strength = if skills_match.is_empty() {
            0.0
        } else {
            skills_match.iter().map(|m| f64::from(m.strength)).sum::<f64>() / skills_match.len() as f64
        };
        let decision = decision_for(mean_strength, artifacts.len());

        Report {
            candidate: Candidate {
                github_username: request.identity.to_string(),
                summary_of_work: summary(request.identity, artifacts),
                notable_repos: artifacts.iter().take(MAX_NOTABLE).map(|a| a.full_name.clone()).collect(),
            },
            code_quality: code_quality(artifacts),
            commit_habits: commit_habits(artifacts),
            interview_questions: interview_questions(&skills_match, artifacts),
            risk_flags: risk_flags(&skills_match, artifacts),
            overall_assessment: OverallAssessment {
                decision_hint: decision,
                justification: format!(
                    "Mean skill strength {mean_strength:.1}/5 across {} requested skill(s), based on {} repositories.",
                    skills_match.len(),
                    artifacts.len()
                ),
            },
            skills_match,
        }
    }
}

#[async_trait]
impl AnalysisGenerator for HeuristicGenerator {
    async fn generate(
        &self,
        request: GenerationRequest<'_>,
    ) -> Result<serde_json::Value, GenerationError> {
        serde_json::to_value(self.analyze(request))
            .map_err(|e| GenerationError::permanent(format!("serializing report: {e}")))
    }
}

fn skill_match(skill: &str, artifacts: &[Artifact]) -> SkillMatch {
    let needle = skill.to_lowercase();
    let mut strength: u32 = 0;
    let mut evidence = Vec::new();
    let mut repos: Vec<String> = Vec::new();

    for a in artifacts {
        let mut hit = false;
        if a.has_language(skill) {
            strength = strength.saturating_add(2);
            evidence.push(format!("Found {skill} code in {}", a.name));
            hit = true;
        }
        if a.name.to_lowercase().contains(&needle) {
            strength = strength.saturating_add(1);
            evidence.push(format!("Repository name {} suggests {skill} work", a.name));
            hit = true;
        }
        if a.description.as_deref().is_some_and(|d| d.to_lowercase().contains(&needle)) {
            strength = strength.saturating_add(1);
            evidence.push(format!("{} description mentions {skill}", a.name));
            hit = true;
        }
        if hit && !repos.contains(&a.full_name) {
            repos.push(a.full_name.clone());
        }
    }

    evidence.truncate(MAX_EVIDENCE);
    repos.truncate(MAX_EVIDENCE);
    SkillMatch {
        skill: skill.to_string(),
        strength: strength.clamp(u32::from(MIN_STRENGTH), u32::from(MAX_STRENGTH)) as u8,
        evidence_snippets: evidence,
        repos_referenced: repos,
    }
}

fn decision_for(mean_strength: f64, repo_count: usize) -> Decision {
    if mean_strength >= 4.0 && repo_count >= 2 {
        Decision::StrongYes
    } else if mean_strength >= 3.0 {
        Decision::Yes
    } else if mean_strength >= 2.0 {
        Decision::Maybe
    } else {
        Decision::No
    }
}

fn summary(identity: &str, artifacts: &[Artifact]) -> String {
    let mut bytes: BTreeMap<&str, u64> = BTreeMap::new();
    for a in artifacts {
        for (lang, b) in &a.languages {
            let total = bytes.entry(lang.as_str()).or_default();
            *total = total.saturating_add(*b);
        }
    }
    match bytes.into_iter().max_by_key(|(_, b)| *b) {
        Some((lang, _)) => format!(
            "{identity} has {} relevant repositories, mostly written in {lang}.",
            artifacts.len()
        ),
        None => format!("{identity} has {} relevant repositories.", artifacts.len()),
    }
}

fn readme_coverage(artifacts: &[Artifact]) -> (usize, usize) {
    (artifacts.iter().filter(|a| a.has_readme()).count(), artifacts.len())
}

fn code_quality(artifacts: &[Artifact]) -> CodeQuality {
    let (with_readme, total) = readme_coverage(artifacts);
    let documentation = if total > 0 && with_readme == total {
        "Strong: every sampled repository has a README"
    } else if with_readme * 2 >= total && total > 0 {
        "Adequate: most sampled repositories have a README"
    } else {
        "Limited: few sampled repositories have a README"
    };

    let has_tests = artifacts
        .iter()
        .flat_map(|a| &a.files)
        .any(|f| f.path.to_lowercase().contains("test"));
    let testing = if has_tests {
        "Tests present in sampled files"
    } else {
        "No tests seen in sampled files"
    };

    CodeQuality {
        style: "Adequate".to_string(),
        readability: "Medium".to_string(),
        testing: testing.to_string(),
        documentation: documentation.to_string(),
        security: "Not assessed from samples".to_string(),
    }
}

fn commit_habits(artifacts: &[Artifact]) -> CommitHabits {
    let frequency = if artifacts.len() >= 3 { "Regular" } else { "Occasional" };
    let forks = artifacts.iter().fold(0u64, |acc, a| acc.saturating_add(a.forks));
    let stars = artifacts.iter().fold(0u64, |acc, a| acc.saturating_add(a.stars));
    let collaboration = if forks > 0 {
        format!("Work has been forked {forks} time(s) and starred {stars} time(s)")
    } else if stars > 0 {
        format!("Starred {stars} time(s), no forks")
    } else {
        "No visible collaboration signals".to_string()
    };
    CommitHabits {
        frequency: frequency.to_string(),
        message_quality: "Not assessed from samples".to_string(),
        collaboration_signals: collaboration,
    }
}

fn interview_questions(skills: &[SkillMatch], artifacts: &[Artifact]) -> Vec<InterviewQuestion> {
    let mut ranked: Vec<&SkillMatch> = skills.iter().collect();
    ranked.sort_by(|a, b| b.strength.cmp(&a.strength));

    let mut questions: Vec<InterviewQuestion> = ranked
        .iter()
        .take(2)
        .map(|m| {
            let question = match m.repos_referenced.first() {
                Some(repo) => format!("Walk us through a design decision you made using {} in {repo}.", m.skill),
                None => format!("Describe a project where you used {} outside of public repositories.", m.skill),
            };
            let difficulty = match m.strength {
                4..=5 => Difficulty::Advanced,
                2..=3 => Difficulty::Intermediate,
                _ => Difficulty::Beginner,
            };
            InterviewQuestion {
                question,
                rationale: format!("Probes depth behind a {}/5 {} rating.", m.strength, m.skill),
                difficulty,
            }
        })
        .collect();

    if let Some(first) = artifacts.first() {
        questions.push(InterviewQuestion {
            question: format!("What would you change about {} if you rebuilt it today?", first.name),
            rationale: "Checks the ability to critique their own most relevant work.".to_string(),
            difficulty: Difficulty::Intermediate,
        });
    }
    questions
}

fn risk_flags(skills: &[SkillMatch], artifacts: &[Artifact]) -> Vec<RiskFlag> {
    let mut flags = Vec::new();

    let engagement = artifacts
        .iter()
        .fold(0u64, |acc, a| acc.saturating_add(a.stars).saturating_add(a.forks));
    if engagement == 0 {
        flags.push(RiskFlag {
            flag: "low_engagement".to_string(),
            description: "None of the relevant repositories have stars or forks.".to_string(),
            severity: Severity::Low,
        });
    }

    let (with_readme, total) = readme_coverage(artifacts);
    if with_readme * 2 < total {
        flags.push(RiskFlag {
            flag: "missing_documentation".to_string(),
            description: format!("{} of {total} repositories have no README.", total - with_readme),
            severity: Severity::Medium,
        });
    }

    for m in skills.iter().filter(|m| m.repos_referenced.is_empty()) {
        flags.push(RiskFlag {
            flag: "skill_gap".to_string(),
            description: format!("No public evidence of {}.", m.skill),
            severity: Severity::Medium,
        });
    }
    flags
}
