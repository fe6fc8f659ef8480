use crate::auth::Identity;
use crate::error::{Error, Result};
use crate::models::run::{self, RunResult, RunStatus};
use crate::models::{Fields, Kind, Record};
use crate::registry::Server;
use async_channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// A queued run waiting for a worker.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Job {
    pub run: Uuid,
}

/// Everything a grader gets to look at for one run.
#[derive(Clone, Debug)]
pub struct GradeJob {
    pub run: Uuid,
    pub test: Record,
    pub test_files: Vec<Record>,
    pub submission: Record,
    pub submission_files: Vec<Record>,
}

#[derive(Error, Debug)]
pub enum GradeFault {
    #[error("submission has no files")]
    NoFiles,
    #[error("{0}")]
    Other(String),
}

/// Executes a submission against a test. Runs on the blocking pool.
pub trait Grader: Send + Sync {
    fn grade(&self, job: &GradeJob) -> std::result::Result<RunResult, GradeFault>;
}

/// Accepts any submission that carries files, awarding the test's `maxscore`.
#[derive(Debug, Default)]
pub struct AcceptanceGrader;

impl Grader for AcceptanceGrader {
    fn grade(&self, job: &GradeJob) -> std::result::Result<RunResult, GradeFault> {
        if job.submission_files.is_empty() {
            return Err(GradeFault::NoFiles);
        }
        let score = match job.test.fields.get("maxscore") {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
            _ => 0.0,
        };
        Ok(RunResult {
            score,
            retcode: 0,
            output: format!("accepted {} file(s)", job.submission_files.len()),
        })
    }
}

/// Hands runs to background workers.
#[derive(Clone, Debug)]
pub struct RunDispatcher {
    job_sender: Sender<Job>,
}

impl RunDispatcher {
    /// Spawns `workers` tasks on the current tokio runtime.
    pub fn start(server: Server, grader: Arc<dyn Grader>, workers: usize) -> Self {
        let (job_sender, job_receiver) = async_channel::unbounded();
        for worker in 0..workers.max(1) {
            tokio::spawn(work(
                worker,
                server.clone(),
                grader.clone(),
                job_receiver.clone(),
            ));
        }
        RunDispatcher { job_sender }
    }

    /// Persists a pending run of `submission` against the test named in
    /// `fields` and queues it. Returns without waiting for grading.
    pub fn submit(
        &self,
        server: &Server,
        owner: &Identity,
        submission: Uuid,
        fields: &Fields,
    ) -> Result<Record> {
        Server::validate_fields(Kind::Run, fields, true)?;
        let test_id = fields
            .get("test")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| Error::malformed("run 'test' must be a test identifier"))?;

        let sub = server.get(Kind::Submission, submission)?;
        let test = server.get(Kind::Test, test_id)?;
        if test.field_uuid("assignment") != sub.field_uuid("assignment") {
            return Err(Error::malformed(format!(
                "test {} doesn't belong to the assignment of submission {}",
                test_id, submission
            )));
        }

        let record = Record::new(Some(owner.id), run::pending_fields(submission, test_id));
        let record = server.insert(Kind::Run, record, Some(submission))?;
        info!("Queued run {} of submission {}", record.id, submission);

        if self.job_sender.try_send(Job { run: record.id }).is_err() {
            error!("Run queue is closed, failing run {}", record.id);
            let result = RunResult {
                score: 0.0,
                retcode: -1,
                output: "grading queue unavailable".into(),
            };
            server.advance_run(record.id, RunStatus::Failed, Some(&result))?;
        }
        Ok(record)
    }
}

fn load_job(server: &Server, run: &Record) -> std::result::Result<GradeJob, String> {
    let fetch = |kind: Kind, id: Option<Uuid>| -> std::result::Result<Record, String> {
        let id = id.ok_or_else(|| format!("run has no {}", kind))?;
        server
            .try_get(kind, id)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("{} {} no longer exists", kind, id))
    };
    let files_of = |kind: Kind, id: Uuid| -> std::result::Result<Vec<Record>, String> {
        let ids = server
            .store()
            .members(kind.namespace(), id, "files")
            .map_err(|e| e.to_string())?;
        let mut files = Vec::new();
        for id in ids {
            if let Some(file) = server.try_get(Kind::File, id).map_err(|e| e.to_string())? {
                files.push(file);
            }
        }
        Ok(files)
    };

    let test = fetch(Kind::Test, run.field_uuid("test"))?;
    let submission = fetch(Kind::Submission, run.field_uuid("submission"))?;
    Ok(GradeJob {
        run: run.id,
        test_files: files_of(Kind::Test, test.id)?,
        submission_files: files_of(Kind::Submission, submission.id)?,
        test,
        submission,
    })
}

async fn grade(server: &Server, grader: &Arc<dyn Grader>, run: &Record) -> (RunStatus, RunResult) {
    let failed = |output: String| {
        (
            RunStatus::Failed,
            RunResult {
                score: 0.0,
                retcode: -1,
                output,
            },
        )
    };

    let job = match load_job(server, run) {
        Ok(job) => job,
        Err(reason) => return failed(reason),
    };
    let grader = grader.clone();
    match tokio::task::spawn_blocking(move || grader.grade(&job)).await {
        Ok(Ok(result)) => (RunStatus::Complete, result),
        Ok(Err(fault)) => failed(fault.to_string()),
        Err(e) => failed(format!("grader crashed: {}", e)),
    }
}

async fn work(worker: usize, server: Server, grader: Arc<dyn Grader>, job_receiver: Receiver<Job>) {
    debug!("Run worker {} started", worker);
    while let Ok(job) = job_receiver.recv().await {
        match server.advance_run(job.run, RunStatus::Running, None) {
            Ok(Some(true)) => {}
            Ok(Some(false)) => {
                warn!("Run {} was already started, skipping", job.run);
                continue;
            }
            Ok(None) => {
                debug!("Run {} was deleted before it started", job.run);
                continue;
            }
            Err(e) => {
                error!("Couldn't start run {}: {}", job.run, e);
                continue;
            }
        }
        info!("Worker {} grading run {}", worker, job.run);

        let run = match server.try_get(Kind::Run, job.run) {
            Ok(Some(run)) => run,
            Ok(None) => continue,
            Err(e) => {
                error!("Couldn't load run {}: {}", job.run, e);
                continue;
            }
        };
        let (status, result) = grade(&server, &grader, &run).await;
        match server.advance_run(job.run, status, Some(&result)) {
            Ok(Some(true)) => info!("Run {} {}: {}", job.run, status, result.output),
            Ok(_) => debug!("Run {} vanished while grading", job.run),
            Err(e) => error!("Couldn't record result of run {}: {}", job.run, e),
        }
    }
    debug!("Run worker {} stopped", worker);
}
