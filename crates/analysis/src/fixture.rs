//! File-backed `DataFetcher`.
//!
//! Reads `{dir}/{identity}.json` (`{"repos": [...]}`) and ranks the
//! repositories by how well they match the requested skills.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::artifact::{Artifact, ItemFilters};
use crate::fetcher::{DataFetcher, FetchError};

const LANGUAGE_WEIGHT: u32 = 3;
const NAME_WEIGHT: u32 = 2;
const DESCRIPTION_WEIGHT: u32 = 1;
const README_WEIGHT: u32 = 1;

#[derive(Debug, Deserialize)]
struct FixtureProfile {
    #[serde(default)]
    repos: Vec<Artifact>,
}

#[derive(Debug, Clone)]
pub struct FixtureFetcher {
    dir: PathBuf,
}

impl FixtureFetcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn profile_path(&self, identity: &str) -> Result<PathBuf, FetchError> {
        if identity.is_empty() || identity.contains(['/', '\\', '.']) {
            return Err(FetchError::not_found(format!("no profile for `{identity}`")));
        }
        Ok(self.dir.join(format!("{identity}.json")))
    }
}

#[async_trait]
impl DataFetcher for FixtureFetcher {
    #[instrument(skip(self, filters), fields(dir = %self.dir.display()), err)]
    async fn fetch(
        &self,
        identity: &str,
        max_items: usize,
        filters: &ItemFilters,
    ) -> Result<Vec<Artifact>, FetchError> {
        let path = self.profile_path(identity)?;
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => FetchError::not_found(format!("no profile for `{identity}`")),
            _ => FetchError::transient(format!("reading {}: {e}", path.display())),
        })?;
        let profile: FixtureProfile = serde_json::from_str(&raw)
            .map_err(|e| FetchError::permanent(format!("parsing {}: {e}", path.display())))?;

        let total = profile.repos.len();
        let ranked = rank_artifacts(profile.repos, max_items, filters);
        debug!(total, kept = ranked.len(), "ranked fixture repositories");
        Ok(ranked)
    }
}

/// Score, filter, sort and truncate artifacts for the requested skills.
///
/// Per skill: language +3, name +2, description +1, README +1. Artifacts that
/// match nothing are dropped; ties keep their input order.
pub fn rank_artifacts(artifacts: Vec<Artifact>, max_items: usize, filters: &ItemFilters) -> Vec<Artifact> {
    let mut ranked: Vec<Artifact> = artifacts
        .into_iter()
        .filter(|a| {
            filters.languages.is_empty() || filters.languages.iter().any(|l| a.has_language(l))
        })
        .map(|mut a| {
            let (score, matched) = relevance(&a, &filters.skills);
            a.score = score;
            a.matched_skills = matched;
            a
        })
        .filter(|a| a.score > 0)
        .collect();

    ranked.sort_by(|a, b| b.score.cmp(&a.score));
    ranked.truncate(max_items);
    for artifact in &mut ranked {
        artifact.files.truncate(filters.max_files_per_item);
    }
    ranked
}

fn relevance(artifact: &Artifact, skills: &[String]) -> (u32, Vec<String>) {
    let name = artifact.name.to_lowercase();
    let description = artifact.description.as_deref().unwrap_or_default().to_lowercase();
    let readme = artifact.readme_preview.as_deref().unwrap_or_default().to_lowercase();

    let mut score = 0;
    let mut matched = Vec::new();
    for skill in skills {
        let needle = skill.to_lowercase();
        let before = score;
        if artifact.has_language(skill) {
            score += LANGUAGE_WEIGHT;
        }
        if name.contains(&needle) {
            score += NAME_WEIGHT;
        }
        if description.contains(&needle) {
            score += DESCRIPTION_WEIGHT;
        }
        if readme.contains(&needle) {
            score += README_WEIGHT;
        }
        if score > before {
            matched.push(skill.clone());
        }
    }
    (score, matched)
}
