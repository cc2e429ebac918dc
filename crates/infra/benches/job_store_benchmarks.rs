use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use gitgauge_core::{
    Candidate, CodeQuality, CommitHabits, Decision, JobInput, JobPatch, JobStatus, NewJob,
    OverallAssessment, PipelineStage, Report, SkillMatch,
};
use gitgauge_infra::jobs::{InMemoryJobStore, JobStore};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("tokio runtime")
}

fn input() -> JobInput {
    JobInput::new(NewJob::new("octocat", vec!["Rust".into(), "Python".into()])).expect("valid input")
}

fn report() -> Report {
    Report {
        candidate: Candidate {
            github_username: "octocat".into(),
            summary_of_work: "Tooling and services".into(),
            notable_repos: vec!["pytools".into()],
        },
        skills_match: vec![SkillMatch {
            skill: "Rust".into(),
            strength: 4,
            evidence_snippets: vec!["async services".into()],
            repos_referenced: vec!["pytools".into()],
        }],
        code_quality: CodeQuality {
            style: "consistent".into(),
            readability: "good".into(),
            testing: "some".into(),
            documentation: "README present".into(),
            security: "no issues seen".into(),
        },
        commit_habits: CommitHabits {
            frequency: "weekly".into(),
            message_quality: "descriptive".into(),
            collaboration_signals: "reviews PRs".into(),
        },
        interview_questions: Vec::new(),
        risk_flags: Vec::new(),
        overall_assessment: OverallAssessment {
            decision_hint: Decision::Yes,
            justification: "solid".into(),
        },
    }
}

/// Full happy-path lifecycle: create, claim, advance stage, complete.
fn bench_job_lifecycle(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("job_lifecycle");
    group.throughput(Throughput::Elements(1));

    group.bench_function("create_claim_complete", |b| {
        let store = InMemoryJobStore::new();
        let report = report();
        b.iter(|| {
            rt.block_on(async {
                let job = store.create(input()).await.expect("create");
                store
                    .transition(
                        job.id,
                        JobStatus::Queued,
                        JobStatus::Running,
                        JobPatch::new().with_attempt(1).with_stage(PipelineStage::Fetching).fenced(0),
                    )
                    .await
                    .expect("claim");
                store
                    .transition(
                        job.id,
                        JobStatus::Running,
                        JobStatus::Running,
                        JobPatch::new().with_stage(PipelineStage::Generating).fenced(1),
                    )
                    .await
                    .expect("stage");
                let done = store
                    .transition(
                        job.id,
                        JobStatus::Running,
                        JobStatus::Completed,
                        JobPatch::complete(report.clone(), Utc::now()).fenced(1),
                    )
                    .await
                    .expect("complete");
                black_box(done)
            })
        });
    });

    group.finish();
}

/// Losing claims against an already-running job (duplicate deliveries).
fn bench_conflicting_claims(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("conflicting_claims");

    let store = InMemoryJobStore::new();
    let id = rt.block_on(async {
        let job = store.create(input()).await.expect("create");
        store
            .transition(job.id, JobStatus::Queued, JobStatus::Running, JobPatch::new().with_attempt(1))
            .await
            .expect("claim");
        job.id
    });

    group.bench_function("rejected_claim", |b| {
        b.iter(|| {
            rt.block_on(async {
                let err = store
                    .transition(id, JobStatus::Queued, JobStatus::Running, JobPatch::new().with_attempt(1))
                    .await
                    .unwrap_err();
                black_box(err)
            })
        });
    });

    group.finish();
}

/// Newest-first listing over stores of increasing size.
fn bench_list(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("list_newest_first");

    for size in [100usize, 1_000, 10_000] {
        let store = InMemoryJobStore::new();
        rt.block_on(async {
            for _ in 0..size {
                store.create(input()).await.expect("create");
            }
        });

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| rt.block_on(async { black_box(store.list(20, 0).await.expect("list")) }));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_job_lifecycle, bench_conflicting_claims, bench_list);
criterion_main!(benches);
