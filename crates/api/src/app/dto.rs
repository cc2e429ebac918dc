use serde::Deserialize;

use gitgauge_core::NewJob;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub github_username: String,
    pub skills: Vec<String>,
    pub repo_limit: Option<u32>,
    pub max_files_per_repo: Option<u32>,
    pub languages: Option<Vec<String>>,
    pub notes_for_ai: Option<String>,
}

impl From<CreateJobRequest> for NewJob {
    fn from(body: CreateJobRequest) -> Self {
        NewJob {
            github_username: body.github_username,
            skills: body.skills,
            repo_limit: body.repo_limit,
            max_files_per_repo: body.max_files_per_repo,
            languages: body.languages,
            notes_for_ai: body.notes_for_ai,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

// -------------------------
// JSON mapping helpers
// -------------------------

pub fn job_to_json(job: gitgauge_core::Job) -> serde_json::Value {
    serde_json::json!({
        "job_id": job.id.to_string(),
        "status": job.status,
        "stage": job.stage,
        "attempt_count": job.attempt_count,
        "input": job.input,
        "report": job.report,
        "sources": job.sources,
        "error": job.error,
        "created_at": job.created_at,
        "updated_at": job.updated_at,
        "generated_at": job.generated_at,
    })
}
