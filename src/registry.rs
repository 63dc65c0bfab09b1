//! Model version registry.
//!
//! Lifecycle per version: `training -> ready -> active -> retired`, with
//! `retired -> active` as rollback and any non-active state `-> failed`.
//! Exactly one version per preference is `active` once its baseline exists;
//! the partial unique index `idx_mv_single_active` backs this up in storage
//! and [`activate`] swaps inside one IMMEDIATE transaction.

use crate::AffinityError;
use crate::ledger::{Feedback, FeedbackTransition};
use crate::model::{self, BASELINE_FAMILY, ScoringHead};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Training,
    Ready,
    Active,
    Retired,
    Failed,
}

impl VersionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VersionStatus::Training => "training",
            VersionStatus::Ready => "ready",
            VersionStatus::Active => "active",
            VersionStatus::Retired => "retired",
            VersionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AffinityError> {
        match s {
            "training" => Ok(VersionStatus::Training),
            "ready" => Ok(VersionStatus::Ready),
            "active" => Ok(VersionStatus::Active),
            "retired" => Ok(VersionStatus::Retired),
            "failed" => Ok(VersionStatus::Failed),
            other => Err(AffinityError::Invalid(format!(
                "unknown version status {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelVersion {
    pub id: i64,
    pub preference_id: i64,
    pub version_number: i64,
    pub family: String,
    pub status: VersionStatus,
    pub total_predictions: i64,
    pub likes: i64,
    pub dislikes: i64,
    pub super_likes: i64,
    pub sample_count: i64,
    pub train_accuracy: Option<f64>,
    pub validation_accuracy: Option<f64>,
    pub metadata: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub created_at: i64,
    pub trained_at: Option<i64>,
    pub activated_at: Option<i64>,
}

/// Measurements recorded when a version finishes training.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingMetrics {
    pub sample_count: i64,
    pub positives: i64,
    pub negatives: i64,
    pub train_accuracy: f64,
    pub validation_accuracy: f64,
}

/// Immutable view of the active version, taken once per scoring call.
#[derive(Debug, Clone)]
pub struct ActiveModel {
    pub version: ModelVersion,
    pub head: Option<Arc<dyn ScoringHead>>,
}

const VERSION_COLUMNS: &str = "id, preference_id, version_number, family, status,
    total_predictions, likes, dislikes, super_likes, sample_count,
    train_accuracy, validation_accuracy, metadata, failure_reason,
    created_at, trained_at, activated_at";

fn row_to_version(row: &rusqlite::Row) -> rusqlite::Result<ModelVersion> {
    let status: String = row.get(4)?;
    let status = VersionStatus::parse(&status).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.to_string().into())
    })?;
    let metadata: Option<String> = row.get(12)?;
    Ok(ModelVersion {
        id: row.get(0)?,
        preference_id: row.get(1)?,
        version_number: row.get(2)?,
        family: row.get(3)?,
        status,
        total_predictions: row.get(5)?,
        likes: row.get(6)?,
        dislikes: row.get(7)?,
        super_likes: row.get(8)?,
        sample_count: row.get(9)?,
        train_accuracy: row.get(10)?,
        validation_accuracy: row.get(11)?,
        metadata: metadata.and_then(|s| serde_json::from_str(&s).ok()),
        failure_reason: row.get(13)?,
        created_at: row.get(14)?,
        trained_at: row.get(15)?,
        activated_at: row.get(16)?,
    })
}

pub fn get_version(conn: &Connection, version_id: i64) -> Result<ModelVersion, AffinityError> {
    conn.query_row(
        &format!("SELECT {VERSION_COLUMNS} FROM model_versions WHERE id = ?1"),
        [version_id],
        row_to_version,
    )
    .optional()?
    .ok_or(AffinityError::UnknownVersion(version_id))
}

pub fn list_versions(
    conn: &Connection,
    preference_id: i64,
) -> Result<Vec<ModelVersion>, AffinityError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {VERSION_COLUMNS} FROM model_versions
         WHERE preference_id = ?1 ORDER BY version_number"
    ))?;
    let rows = stmt
        .query_map([preference_id], row_to_version)?
        .collect::<Result<_, _>>()?;
    Ok(rows)
}

/// Register version 1 (the zero-shot baseline) as active. Idempotent: returns
/// the existing baseline when the preference already has versions.
pub fn register_baseline(conn: &Connection, preference_id: i64) -> Result<i64, AffinityError> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM model_versions WHERE preference_id = ?1 AND version_number = 1",
            [preference_id],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }

    conn.execute(
        "INSERT INTO model_versions
            (preference_id, version_number, family, params, status, activated_at)
         VALUES (?1, 1, ?2, NULL, 'active', unixepoch('now'))",
        params![preference_id, BASELINE_FAMILY],
    )?;
    let id = conn.last_insert_rowid();
    log::info!("preference {preference_id}: registered baseline version {id}");
    Ok(id)
}

/// Register baselines for every preference that has no versions yet.
pub fn ensure_baselines(conn: &Connection) -> Result<usize, AffinityError> {
    let missing: Vec<i64> = conn
        .prepare(
            "SELECT p.id FROM preferences p
             WHERE NOT EXISTS (SELECT 1 FROM model_versions v WHERE v.preference_id = p.id)",
        )?
        .query_map([], |r| r.get(0))?
        .collect::<Result<_, _>>()?;
    for id in &missing {
        register_baseline(conn, *id)?;
    }
    Ok(missing.len())
}

/// Create a `training` version owned by `job_id`.
pub fn create_pending_version(
    conn: &Connection,
    job_id: i64,
    family: &str,
) -> Result<ModelVersion, AffinityError> {
    let preference_id: i64 = conn
        .query_row(
            "SELECT preference_id FROM training_jobs WHERE id = ?1",
            [job_id],
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| AffinityError::NotFound(format!("training job {job_id}")))?;

    let tx = conn.unchecked_transaction()?;
    let next: i64 = tx.query_row(
        "SELECT COALESCE(MAX(version_number), 0) + 1 FROM model_versions WHERE preference_id = ?1",
        [preference_id],
        |r| r.get(0),
    )?;
    tx.execute(
        "INSERT INTO model_versions (preference_id, version_number, family, status)
         VALUES (?1, ?2, ?3, 'training')",
        params![preference_id, next, family],
    )?;
    let version_id = tx.last_insert_rowid();
    tx.execute(
        "UPDATE training_jobs SET model_version_id = ?1 WHERE id = ?2",
        params![version_id, job_id],
    )?;
    tx.commit()?;

    log::debug!("job {job_id}: pending version {version_id} (v{next})");
    get_version(conn, version_id)
}

/// Store trained parameters and move `training -> ready`.
pub fn mark_ready(
    conn: &Connection,
    version_id: i64,
    params_blob: &[u8],
    metrics: &TrainingMetrics,
) -> Result<ModelVersion, AffinityError> {
    let metadata = serde_json::to_string(metrics)?;
    let updated = conn.execute(
        "UPDATE model_versions SET
            status = 'ready', params = ?1, sample_count = ?2,
            train_accuracy = ?3, validation_accuracy = ?4, metadata = ?5,
            trained_at = unixepoch('now')
         WHERE id = ?6 AND status = 'training'",
        params![
            params_blob,
            metrics.sample_count,
            metrics.train_accuracy,
            metrics.validation_accuracy,
            metadata,
            version_id,
        ],
    )?;
    if updated == 0 {
        let current = get_version(conn, version_id)?;
        return Err(AffinityError::Invalid(format!(
            "version {version_id} is {}, only training versions can become ready",
            current.status.as_str()
        )));
    }
    get_version(conn, version_id)
}

/// Move a non-active version to `failed` with a reason.
pub fn mark_failed(conn: &Connection, version_id: i64, reason: &str) -> Result<(), AffinityError> {
    let updated = conn.execute(
        "UPDATE model_versions SET status = 'failed', failure_reason = ?1
         WHERE id = ?2 AND status != 'active'",
        params![reason, version_id],
    )?;
    if updated == 0 {
        // distinguish unknown from active
        get_version(conn, version_id)?;
        return Err(AffinityError::Invalid(format!(
            "version {version_id} is active and cannot be failed"
        )));
    }
    log::warn!("version {version_id} failed: {reason}");
    Ok(())
}

/// Make `version_id` the single active version of its preference.
///
/// The previous active version becomes `retired` in the same IMMEDIATE
/// transaction, so readers never observe zero or two active versions.
pub fn activate(conn: &Connection, version_id: i64) -> Result<ModelVersion, AffinityError> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let target = get_version(&tx, version_id)?;

    match target.status {
        VersionStatus::Active => return Ok(target),
        VersionStatus::Ready | VersionStatus::Retired => {}
        other => {
            return Err(AffinityError::VersionNotReady {
                version_id,
                status: other.as_str().to_string(),
            });
        }
    }

    // Load the head before swapping so a corrupt blob can never become active.
    let blob: Option<Vec<u8>> = tx.query_row(
        "SELECT params FROM model_versions WHERE id = ?1",
        [version_id],
        |r| r.get(0),
    )?;
    model::load_head(&target.family, blob.as_deref())?;

    let retired = tx.execute(
        "UPDATE model_versions SET status = 'retired'
         WHERE preference_id = ?1 AND status = 'active'",
        [target.preference_id],
    )?;
    tx.execute(
        "UPDATE model_versions SET status = 'active', activated_at = unixepoch('now')
         WHERE id = ?1",
        [version_id],
    )?;
    tx.commit()?;

    log::info!(
        "preference {}: activated version {} (v{}), retired {retired}",
        target.preference_id,
        version_id,
        target.version_number
    );
    get_version(conn, version_id)
}

/// Snapshot the active version and its loaded head.
pub fn active_model(conn: &Connection, preference_id: i64) -> Result<ActiveModel, AffinityError> {
    let version = conn
        .query_row(
            &format!(
                "SELECT {VERSION_COLUMNS} FROM model_versions
                 WHERE preference_id = ?1 AND status = 'active'"
            ),
            [preference_id],
            row_to_version,
        )
        .optional()?
        .ok_or_else(|| {
            AffinityError::NotFound(format!("active model version for preference {preference_id}"))
        })?;

    let blob: Option<Vec<u8>> = conn.query_row(
        "SELECT params FROM model_versions WHERE id = ?1",
        [version.id],
        |r| r.get(0),
    )?;
    let head = model::load_head(&version.family, blob.as_deref())?;
    Ok(ActiveModel { version, head })
}

/// Count one scoring call against the version that produced it.
pub fn record_prediction(conn: &Connection, version_id: Option<i64>) -> Result<(), AffinityError> {
    let Some(id) = version_id else {
        return Ok(());
    };
    conn.execute(
        "UPDATE model_versions SET total_predictions = total_predictions + 1 WHERE id = ?1",
        [id],
    )?;
    Ok(())
}

fn counter_column(label: Feedback) -> &'static str {
    match label {
        Feedback::Like => "likes",
        Feedback::Dislike => "dislikes",
        Feedback::SuperLike => "super_likes",
    }
}

fn bump(conn: &Connection, version_id: i64, label: Feedback, delta: i64) -> Result<(), AffinityError> {
    let column = counter_column(label);
    conn.execute(
        &format!("UPDATE model_versions SET {column} = MAX({column} + ?1, 0) WHERE id = ?2"),
        params![delta, version_id],
    )?;
    Ok(())
}

/// Apply the counter effect of a feedback change on one result.
///
/// The previous label's effect is reversed before the new one is applied,
/// so relabeling never double-counts. No-op for results that predate
/// versioning (`version_id` is `None`).
pub fn record_feedback(
    conn: &Connection,
    version_id: Option<i64>,
    label: Option<Feedback>,
    previous: Option<Feedback>,
) -> Result<(), AffinityError> {
    let Some(id) = version_id else {
        return Ok(());
    };
    match FeedbackTransition::between(previous, label) {
        FeedbackTransition::Unchanged => {}
        FeedbackTransition::Labeled(new) => bump(conn, id, new, 1)?,
        FeedbackTransition::Relabeled { from, to } => {
            bump(conn, id, from, -1)?;
            bump(conn, id, to, 1)?;
        }
        FeedbackTransition::Cleared(old) => bump(conn, id, old, -1)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_db;
    use crate::model::{LOGISTIC_FAMILY, LogisticHead};

    fn setup() -> (Connection, i64) {
        let conn = open_memory_db().unwrap();
        conn.execute("INSERT INTO preferences (name) VALUES ('p')", [])
            .unwrap();
        let pref = conn.last_insert_rowid();
        register_baseline(&conn, pref).unwrap();
        (conn, pref)
    }

    fn new_job(conn: &Connection, pref: i64) -> i64 {
        conn.execute(
            "INSERT INTO training_jobs (preference_id, status, hyperparams) VALUES (?1, 'running', '{}')",
            [pref],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    #[test]
    fn unknown_status_surfaces_as_conversion_error() {
        let (conn, pref) = setup();
        let baseline = list_versions(&conn, pref).unwrap()[0].id;
        conn.execute_batch("PRAGMA ignore_check_constraints = ON").unwrap();
        conn.execute(
            "UPDATE model_versions SET status = 'archived' WHERE id = ?1",
            [baseline],
        )
        .unwrap();

        match get_version(&conn, baseline) {
            Err(AffinityError::Database(rusqlite::Error::FromSqlConversionFailure(
                col, _, err,
            ))) => {
                assert_eq!(col, 4);
                assert!(err.to_string().contains("archived"), "{err}");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(list_versions(&conn, pref).is_err());
    }

    fn metrics() -> TrainingMetrics {
        TrainingMetrics {
            sample_count: 60,
            positives: 30,
            negatives: 30,
            train_accuracy: 0.9,
            validation_accuracy: 0.8,
        }
    }

    fn ready_version(conn: &Connection, pref: i64) -> ModelVersion {
        let job = new_job(conn, pref);
        let pending = create_pending_version(conn, job, LOGISTIC_FAMILY).unwrap();
        conn.execute(
            "UPDATE training_jobs SET status = 'completed' WHERE id = ?1",
            [job],
        )
        .unwrap();
        let blob = LogisticHead {
            weights: vec![1.0, 0.0],
            bias: 0.0,
        }
        .to_blob()
        .unwrap();
        mark_ready(conn, pending.id, &blob, &metrics()).unwrap()
    }

    fn active_count(conn: &Connection, pref: i64) -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM model_versions WHERE preference_id = ?1 AND status = 'active'",
            [pref],
            |r| r.get(0),
        )
        .unwrap()
    }

    #[test]
    fn baseline_is_idempotent_and_active() {
        let (conn, pref) = setup();
        let first = register_baseline(&conn, pref).unwrap();
        let second = register_baseline(&conn, pref).unwrap();
        assert_eq!(first, second);

        let active = active_model(&conn, pref).unwrap();
        assert_eq!(active.version.version_number, 1);
        assert_eq!(active.version.family, BASELINE_FAMILY);
        assert!(active.head.is_none());
    }

    #[test]
    fn ensure_baselines_fills_gaps() {
        let conn = open_memory_db().unwrap();
        conn.execute("INSERT INTO preferences (name) VALUES ('a'), ('b')", [])
            .unwrap();
        assert_eq!(ensure_baselines(&conn).unwrap(), 2);
        assert_eq!(ensure_baselines(&conn).unwrap(), 0);
    }

    #[test]
    fn pending_then_ready_numbers_monotonically() {
        let (conn, pref) = setup();
        let v = ready_version(&conn, pref);
        assert_eq!(v.version_number, 2);
        assert_eq!(v.status, VersionStatus::Ready);
        assert_eq!(v.sample_count, 60);
        assert_eq!(v.validation_accuracy, Some(0.8));
        assert!(v.trained_at.is_some());
        assert_eq!(ready_version(&conn, pref).version_number, 3);
    }

    #[test]
    fn activation_swaps_atomically_and_rolls_back() {
        let (conn, pref) = setup();
        let baseline = active_model(&conn, pref).unwrap().version;
        let v2 = ready_version(&conn, pref);

        let activated = activate(&conn, v2.id).unwrap();
        assert_eq!(activated.status, VersionStatus::Active);
        assert_eq!(active_count(&conn, pref), 1);
        assert_eq!(
            get_version(&conn, baseline.id).unwrap().status,
            VersionStatus::Retired
        );
        assert!(active_model(&conn, pref).unwrap().head.is_some());

        // rollback to the retired baseline
        activate(&conn, baseline.id).unwrap();
        assert_eq!(active_count(&conn, pref), 1);
        assert_eq!(
            get_version(&conn, v2.id).unwrap().status,
            VersionStatus::Retired
        );
    }

    #[test]
    fn activating_active_is_noop() {
        let (conn, pref) = setup();
        let baseline = active_model(&conn, pref).unwrap().version;
        let again = activate(&conn, baseline.id).unwrap();
        assert_eq!(again.status, VersionStatus::Active);
        assert_eq!(active_count(&conn, pref), 1);
    }

    #[test]
    fn activation_errors() {
        let (conn, pref) = setup();
        assert!(matches!(
            activate(&conn, 999),
            Err(AffinityError::UnknownVersion(999))
        ));

        let job = new_job(&conn, pref);
        let pending = create_pending_version(&conn, job, LOGISTIC_FAMILY).unwrap();
        match activate(&conn, pending.id) {
            Err(AffinityError::VersionNotReady { status, .. }) => assert_eq!(status, "training"),
            other => panic!("unexpected {other:?}"),
        }

        mark_failed(&conn, pending.id, "boom").unwrap();
        assert!(matches!(
            activate(&conn, pending.id),
            Err(AffinityError::VersionNotReady { .. })
        ));
        assert_eq!(active_count(&conn, pref), 1);
    }

    #[test]
    fn active_version_cannot_fail() {
        let (conn, pref) = setup();
        let baseline = active_model(&conn, pref).unwrap().version;
        assert!(mark_failed(&conn, baseline.id, "nope").is_err());
    }

    #[test]
    fn mark_ready_twice_rejected() {
        let (conn, pref) = setup();
        let v = ready_version(&conn, pref);
        assert!(mark_ready(&conn, v.id, b"{}", &metrics()).is_err());
    }

    #[test]
    fn feedback_counters_compensate() {
        let (conn, pref) = setup();
        let id = active_model(&conn, pref).unwrap().version.id;

        record_feedback(&conn, Some(id), Some(Feedback::Like), None).unwrap();
        record_feedback(&conn, Some(id), Some(Feedback::Like), Some(Feedback::Like)).unwrap();
        let v = get_version(&conn, id).unwrap();
        assert_eq!((v.likes, v.dislikes), (1, 0));

        record_feedback(&conn, Some(id), Some(Feedback::Dislike), Some(Feedback::Like)).unwrap();
        let v = get_version(&conn, id).unwrap();
        assert_eq!((v.likes, v.dislikes), (0, 1));

        record_feedback(&conn, Some(id), None, Some(Feedback::Dislike)).unwrap();
        let v = get_version(&conn, id).unwrap();
        assert_eq!((v.likes, v.dislikes, v.super_likes), (0, 0, 0));

        // legacy results without a version are ignored
        record_feedback(&conn, None, Some(Feedback::SuperLike), None).unwrap();
    }

    #[test]
    fn predictions_counted() {
        let (conn, pref) = setup();
        let id = active_model(&conn, pref).unwrap().version.id;
        record_prediction(&conn, Some(id)).unwrap();
        record_prediction(&conn, Some(id)).unwrap();
        record_prediction(&conn, None).unwrap();
        assert_eq!(get_version(&conn, id).unwrap().total_predictions, 2);
    }
}
