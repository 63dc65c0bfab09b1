//! Training orchestrator: turns ledger feedback into a new, inactive model
//! version.
//!
//! Job lifecycle: `pending -> running -> completed | failed | cancelled`.
//! [`create_job`] validates preconditions and inserts a pending row; the
//! partial unique index `idx_tj_single_live` guarantees one live job per
//! preference even across processes. [`run_job`] does the work on its own
//! connection and holds no transaction while fitting, so scoring and
//! feedback keep going. Cancellation is cooperative: the worker checks an
//! in-process flag and the job row between epochs.

use crate::AffinityError;
use crate::config::TrainingConfig;
use crate::ledger;
use crate::model::{self, Fit, Hyperparams, Sample, Trainer};
use crate::registry::{self, TrainingMetrics, VersionStatus};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

/// Job-row progress is written every this many epochs.
const PROGRESS_EVERY: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AffinityError> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(AffinityError::Invalid(format!("unknown job status {other:?}"))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingJob {
    pub id: i64,
    pub preference_id: i64,
    pub model_version_id: Option<i64>,
    pub status: JobStatus,
    pub hyperparams: Hyperparams,
    pub processed_samples: i64,
    pub total_samples: i64,
    pub error: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

const JOB_COLUMNS: &str = "id, preference_id, model_version_id, status, hyperparams,
    processed_samples, total_samples, error, created_at, started_at, completed_at";

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<(TrainingJob, String, String)> {
    Ok((
        TrainingJob {
            id: row.get(0)?,
            preference_id: row.get(1)?,
            model_version_id: row.get(2)?,
            status: JobStatus::Pending,
            hyperparams: Hyperparams {
                epochs: 0,
                learning_rate: 0.0,
                l2: 0.0,
                holdout_fraction: 0.0,
                seed: None,
            },
            processed_samples: row.get(5)?,
            total_samples: row.get(6)?,
            error: row.get(7)?,
            created_at: row.get(8)?,
            started_at: row.get(9)?,
            completed_at: row.get(10)?,
        },
        row.get(3)?,
        row.get(4)?,
    ))
}

fn finish(raw: (TrainingJob, String, String)) -> Result<TrainingJob, AffinityError> {
    let (mut job, status, hyperparams) = raw;
    job.status = JobStatus::parse(&status)?;
    job.hyperparams = serde_json::from_str(&hyperparams)?;
    Ok(job)
}

pub fn get_job(conn: &Connection, job_id: i64) -> Result<TrainingJob, AffinityError> {
    let raw = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM training_jobs WHERE id = ?1"),
            [job_id],
            row_to_job,
        )
        .optional()?
        .ok_or_else(|| AffinityError::NotFound(format!("training job {job_id}")))?;
    finish(raw)
}

/// Jobs newest first, optionally for one preference.
pub fn list_jobs(
    conn: &Connection,
    preference_id: Option<i64>,
) -> Result<Vec<TrainingJob>, AffinityError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {JOB_COLUMNS} FROM training_jobs
         WHERE ?1 IS NULL OR preference_id = ?1
         ORDER BY id DESC"
    ))?;
    let rows: Vec<(TrainingJob, String, String)> = stmt
        .query_map([preference_id], row_to_job)?
        .collect::<Result<_, _>>()?;
    rows.into_iter().map(finish).collect()
}

fn live_job(conn: &Connection, preference_id: i64) -> Result<Option<i64>, AffinityError> {
    Ok(conn
        .query_row(
            "SELECT id FROM training_jobs
             WHERE preference_id = ?1 AND status IN ('pending', 'running')",
            [preference_id],
            |r| r.get(0),
        )
        .optional()?)
}

/// Check preconditions and enqueue a pending job.
///
/// Fails with `InsufficientTrainingData` before touching the registry, and
/// with `TrainingAlreadyInProgress` while another job for the preference is
/// pending or running.
pub fn create_job(
    conn: &Connection,
    preference_id: i64,
    config: &TrainingConfig,
) -> Result<TrainingJob, AffinityError> {
    // existence check, so an unknown preference is NotFound rather than "insufficient"
    conn.query_row(
        "SELECT id FROM preferences WHERE id = ?1",
        [preference_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()?
    .ok_or_else(|| AffinityError::NotFound(format!("preference {preference_id}")))?;

    let have = ledger::count_labeled(conn, preference_id)?;
    if have < config.min_samples {
        return Err(AffinityError::InsufficientTrainingData {
            have,
            need: config.min_samples,
        });
    }

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    if let Some(job_id) = live_job(&tx, preference_id)? {
        return Err(AffinityError::TrainingAlreadyInProgress {
            preference_id,
            job_id,
        });
    }
    let hp = serde_json::to_string(&Hyperparams::from(config))?;
    tx.execute(
        "INSERT INTO training_jobs (preference_id, status, hyperparams, total_samples)
         VALUES (?1, 'pending', ?2, ?3)",
        params![preference_id, hp, have],
    )?;
    let job_id = tx.last_insert_rowid();
    tx.commit()?;

    log::info!("preference {preference_id}: queued training job {job_id} ({have} samples)");
    get_job(conn, job_id)
}

/// Request cancellation. Pending jobs end immediately. A running job's
/// pending version is failed at once, so a worker that died mid-fit leaves
/// no version stuck in `training`; a live worker notices at its next epoch.
pub fn cancel_job(conn: &Connection, job_id: i64) -> Result<TrainingJob, AffinityError> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let updated = tx.execute(
        "UPDATE training_jobs SET status = 'cancelled', completed_at = unixepoch('now')
         WHERE id = ?1 AND status IN ('pending', 'running')",
        [job_id],
    )?;
    let job = get_job(&tx, job_id)?;
    if updated == 0 && job.status != JobStatus::Cancelled {
        return Err(AffinityError::Invalid(format!(
            "job {job_id} already {}",
            job.status.as_str()
        )));
    }
    if updated > 0
        && let Some(version_id) = job.model_version_id
        && registry::get_version(&tx, version_id)?.status == VersionStatus::Training
    {
        registry::mark_failed(&tx, version_id, "cancelled")?;
    }
    tx.commit()?;
    log::info!("job {job_id}: cancellation requested");
    Ok(job)
}

fn job_status(conn: &Connection, job_id: i64) -> Result<JobStatus, AffinityError> {
    let s: String = conn.query_row(
        "SELECT status FROM training_jobs WHERE id = ?1",
        [job_id],
        |r| r.get(0),
    )?;
    JobStatus::parse(&s)
}

/// Shuffle and split into (train, validation). Both sides are non-empty for
/// two or more samples.
pub fn split(
    mut samples: Vec<Sample>,
    holdout_fraction: f64,
    seed: Option<u64>,
) -> (Vec<Sample>, Vec<Sample>) {
    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };
    samples.shuffle(&mut rng);

    let n = samples.len();
    if n < 2 {
        return (samples, Vec::new());
    }
    let holdout = ((n as f64 * holdout_fraction).round() as usize).clamp(1, n - 1);
    let validation = samples.split_off(n - holdout);
    (samples, validation)
}

fn finish_job(
    conn: &Connection,
    job_id: i64,
    status: JobStatus,
    error: Option<&str>,
) -> Result<(), AffinityError> {
    conn.execute(
        "UPDATE training_jobs SET status = ?1, error = ?2, completed_at = unixepoch('now')
         WHERE id = ?3",
        params![status.as_str(), error, job_id],
    )?;
    Ok(())
}

/// Execute a pending job to completion on `conn`.
///
/// Returns the job in its terminal state. A training failure is recorded on
/// the job and its version and is not an `Err`; errors are reserved for
/// storage problems.
pub fn run_job(
    conn: &Connection,
    job_id: i64,
    trainer: &dyn Trainer,
    cancel: &AtomicBool,
) -> Result<TrainingJob, AffinityError> {
    let job = get_job(conn, job_id)?;
    let claimed = conn.execute(
        "UPDATE training_jobs SET status = 'running', started_at = unixepoch('now')
         WHERE id = ?1 AND status = 'pending'",
        [job_id],
    )?;
    if claimed == 0 {
        log::info!("job {job_id}: not pending ({}), skipping", job.status.as_str());
        return get_job(conn, job_id);
    }

    let version = registry::create_pending_version(conn, job_id, trainer.family())?;
    let samples = ledger::labeled_samples(conn, job.preference_id)?;
    let total = samples.len() as i64;
    let positives = samples.iter().filter(|s| s.target >= 0.5).count() as i64;
    conn.execute(
        "UPDATE training_jobs SET total_samples = ?1 WHERE id = ?2",
        params![total, job_id],
    )?;

    let hp = job.hyperparams.clone();
    let (train, validation) = split(samples, hp.holdout_fraction, hp.seed);
    log::info!(
        "job {job_id}: training v{} on {} samples ({} held out)",
        version.version_number,
        train.len(),
        validation.len()
    );

    let mut poll_error: Option<AffinityError> = None;
    let fit = trainer.fit(&train, &hp, &mut |epoch, processed| {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        if epoch % PROGRESS_EVERY == 0 || epoch == hp.epochs {
            let polled = conn
                .execute(
                    "UPDATE training_jobs SET processed_samples = ?1 WHERE id = ?2",
                    params![processed, job_id],
                )
                .map_err(AffinityError::from)
                .and_then(|_| job_status(conn, job_id));
            match polled {
                Ok(JobStatus::Running) => {}
                Ok(_) => return false,
                Err(e) => {
                    poll_error = Some(e);
                    return false;
                }
            }
        }
        true
    });

    if let Some(e) = poll_error {
        let reason = format!("progress update failed: {e}");
        registry::mark_failed(conn, version.id, &reason)?;
        finish_job(conn, job_id, JobStatus::Failed, Some(&reason))?;
        return Err(e);
    }

    match fit {
        Ok(Fit::Done(head)) => {
            let metrics = TrainingMetrics {
                sample_count: total,
                positives,
                negatives: total - positives,
                train_accuracy: model::accuracy(head.as_ref(), &train),
                validation_accuracy: model::accuracy(head.as_ref(), &validation),
            };
            let blob = head.to_blob()?;

            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            if job_status(&tx, job_id)? != JobStatus::Running {
                // cancelled between the last poll and now
                registry::mark_failed(&tx, version.id, "cancelled")?;
                tx.commit()?;
                log::info!("job {job_id}: cancelled after fitting, version discarded");
                return get_job(conn, job_id);
            }
            registry::mark_ready(&tx, version.id, &blob, &metrics)?;
            tx.execute(
                "UPDATE training_jobs SET status = 'completed', processed_samples = ?1,
                    completed_at = unixepoch('now')
                 WHERE id = ?2",
                params![total, job_id],
            )?;
            tx.commit()?;
            log::info!(
                "job {job_id}: version {} ready, validation accuracy {:.3}",
                version.id,
                metrics.validation_accuracy
            );
        }
        Ok(Fit::Cancelled) => {
            let tx = conn.unchecked_transaction()?;
            registry::mark_failed(&tx, version.id, "cancelled")?;
            finish_job(&tx, job_id, JobStatus::Cancelled, None)?;
            tx.commit()?;
            log::info!("job {job_id}: cancelled");
        }
        Err(e) => {
            let reason = match e {
                AffinityError::TrainingFailed(reason) => reason,
                other => other.to_string(),
            };
            let tx = conn.unchecked_transaction()?;
            registry::mark_failed(&tx, version.id, &reason)?;
            finish_job(&tx, job_id, JobStatus::Failed, Some(&reason))?;
            tx.commit()?;
        }
    }
    get_job(conn, job_id)
}

/// A job running on a background thread.
pub struct TrainingHandle {
    pub job: TrainingJob,
    cancel: Arc<AtomicBool>,
    thread: JoinHandle<Result<TrainingJob, AffinityError>>,
}

impl TrainingHandle {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Block until the worker ends and return the job's terminal state.
    pub fn wait(self) -> Result<TrainingJob, AffinityError> {
        self.thread
            .join()
            .map_err(|_| AffinityError::TrainingFailed("training worker panicked".into()))?
    }
}

/// Run `job` on a dedicated thread with its own database connection.
pub fn spawn_job(
    db_path: &Path,
    job: TrainingJob,
    trainer: Arc<dyn Trainer>,
) -> Result<TrainingHandle, AffinityError> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    let path: PathBuf = db_path.to_path_buf();
    let job_id = job.id;

    let thread = std::thread::Builder::new()
        .name(format!("affinity-train-{job_id}"))
        .spawn(move || {
            let conn = crate::db::open_db(&path)?;
            run_job(&conn, job_id, trainer.as_ref(), &flag)
        })?;

    Ok(TrainingHandle {
        job,
        cancel,
        thread,
    })
}
