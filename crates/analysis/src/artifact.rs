use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gitgauge_core::JobInput;

/// One fetched unit of external work (a repository and a sample of its files).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub full_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    /// Bytes of code per language.
    #[serde(default)]
    pub languages: BTreeMap<String, u64>,
    #[serde(default)]
    pub stars: u64,
    #[serde(default)]
    pub forks: u64,
    #[serde(default)]
    pub size_kb: u64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub readme_preview: Option<String>,
    #[serde(default)]
    pub files: Vec<ArtifactFile>,

    /// Relevance score assigned by the fetcher.
    #[serde(default)]
    pub score: u32,
    /// Requested skills this artifact matched.
    #[serde(default)]
    pub matched_skills: Vec<String>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, owner: &str) -> Self {
        let name = name.into();
        Self {
            full_name: format!("{owner}/{name}"),
            name,
            description: None,
            html_url: None,
            languages: BTreeMap::new(),
            stars: 0,
            forks: 0,
            size_kb: 0,
            created_at: None,
            updated_at: None,
            readme_preview: None,
            files: Vec::new(),
            score: 0,
            matched_skills: Vec::new(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>, bytes: u64) -> Self {
        self.languages.insert(language.into(), bytes);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_readme(mut self, readme: impl Into<String>) -> Self {
        self.readme_preview = Some(readme.into());
        self
    }

    pub fn with_file(mut self, path: impl Into<String>, snippet: impl Into<String>) -> Self {
        self.files.push(ArtifactFile {
            path: path.into(),
            language: None,
            snippet: snippet.into(),
        });
        self
    }

    /// Language with the most bytes, if any.
    pub fn primary_language(&self) -> Option<&str> {
        self.languages
            .iter()
            .max_by_key(|(_, bytes)| **bytes)
            .map(|(lang, _)| lang.as_str())
    }

    pub fn has_language(&self, language: &str) -> bool {
        self.languages.keys().any(|l| l.eq_ignore_ascii_case(language))
    }

    pub fn has_readme(&self) -> bool {
        self.readme_preview.as_deref().is_some_and(|r| !r.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    pub path: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub snippet: String,
}

/// Constraints passed to the fetcher alongside the item budget.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemFilters {
    pub skills: Vec<String>,
    /// Only keep artifacts using one of these languages (empty = no filter).
    pub languages: Vec<String>,
    pub max_files_per_item: usize,
}

impl From<&JobInput> for ItemFilters {
    fn from(input: &JobInput) -> Self {
        Self {
            skills: input.skills().to_vec(),
            languages: input.languages().to_vec(),
            max_files_per_item: input.max_files_per_repo() as usize,
        }
    }
}
