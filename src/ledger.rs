//! Classification ledger: one row per scoring call, plus the feedback the
//! user later attaches to it.
//!
//! Rows are append-only except for the feedback pair (label, timestamp).
//! Every feedback write goes through [`FeedbackTransition`] so the producing
//! model version's counters stay consistent under relabels and deletes.

use crate::AffinityError;
use crate::model::Sample;
use crate::registry;
use crate::score::{ComponentScores, Recommendation, ScoreOutcome};
use crate::vector;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

pub const MAX_HISTORY_LIMIT: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Feedback {
    Like,
    Dislike,
    SuperLike,
}

impl Feedback {
    pub fn as_str(self) -> &'static str {
        match self {
            Feedback::Like => "like",
            Feedback::Dislike => "dislike",
            Feedback::SuperLike => "super_like",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AffinityError> {
        match s {
            "like" => Ok(Feedback::Like),
            "dislike" => Ok(Feedback::Dislike),
            "super_like" | "superlike" => Ok(Feedback::SuperLike),
            other => Err(AffinityError::Invalid(format!(
                "unknown feedback label {other:?} (like, dislike, super_like)"
            ))),
        }
    }

    /// Binary training target: liked or not.
    pub fn target(self) -> f32 {
        match self {
            Feedback::Like | Feedback::SuperLike => 1.0,
            Feedback::Dislike => 0.0,
        }
    }
}

/// Feedback state change on a single result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackTransition {
    Unchanged,
    Labeled(Feedback),
    Relabeled { from: Feedback, to: Feedback },
    Cleared(Feedback),
}

impl FeedbackTransition {
    pub fn between(previous: Option<Feedback>, next: Option<Feedback>) -> Self {
        match (previous, next) {
            (None, None) => FeedbackTransition::Unchanged,
            (None, Some(to)) => FeedbackTransition::Labeled(to),
            (Some(from), None) => FeedbackTransition::Cleared(from),
            (Some(from), Some(to)) if from == to => FeedbackTransition::Unchanged,
            (Some(from), Some(to)) => FeedbackTransition::Relabeled { from, to },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub id: i64,
    pub preference_id: i64,
    pub artifact: String,
    pub components: ComponentScores,
    pub confidence: f32,
    pub is_match: bool,
    pub recommendation: Recommendation,
    pub reasons: Vec<String>,
    pub name: Option<String>,
    pub age: Option<u32>,
    pub bio: Option<String>,
    pub model_version_id: Option<i64>,
    pub feedback: Option<Feedback>,
    pub feedback_at: Option<i64>,
    pub has_embedding: bool,
    pub created_at: i64,
}

/// Provenance and extracted fields persisted alongside a score.
#[derive(Debug, Clone, Default)]
pub struct NewResult<'a> {
    pub preference_id: i64,
    pub artifact: &'a str,
    pub name: Option<&'a str>,
    pub age: Option<u32>,
    pub bio: Option<&'a str>,
    pub embedding: Option<&'a [f32]>,
    pub model_version_id: Option<i64>,
}

const RESULT_COLUMNS: &str = "id, preference_id, artifact, physical_score, personality_score,
    interest_score, confidence, is_match, recommendation, reasons, name, age, bio,
    model_version_id, feedback, feedback_at, embedding IS NOT NULL, created_at";

struct RawResult {
    result: ClassificationResult,
    recommendation: String,
    reasons: String,
    feedback: Option<String>,
}

fn row_to_raw(row: &rusqlite::Row) -> rusqlite::Result<RawResult> {
    let age: Option<i64> = row.get(11)?;
    Ok(RawResult {
        result: ClassificationResult {
            id: row.get(0)?,
            preference_id: row.get(1)?,
            artifact: row.get(2)?,
            components: ComponentScores {
                physical: row.get::<_, f64>(3)? as f32,
                personality: row.get::<_, f64>(4)? as f32,
                interests: row.get::<_, f64>(5)? as f32,
            },
            confidence: row.get::<_, f64>(6)? as f32,
            is_match: row.get(7)?,
            recommendation: Recommendation::Pass,
            reasons: Vec::new(),
            name: row.get(10)?,
            age: age.and_then(|a| u32::try_from(a).ok()),
            bio: row.get(12)?,
            model_version_id: row.get(13)?,
            feedback: None,
            feedback_at: row.get(15)?,
            has_embedding: row.get(16)?,
            created_at: row.get(17)?,
        },
        recommendation: row.get(8)?,
        reasons: row.get(9)?,
        feedback: row.get(14)?,
    })
}

impl RawResult {
    fn finish(self) -> Result<ClassificationResult, AffinityError> {
        let mut result = self.result;
        result.recommendation = Recommendation::parse(&self.recommendation)?;
        result.reasons = serde_json::from_str(&self.reasons)?;
        result.feedback = self.feedback.as_deref().map(Feedback::parse).transpose()?;
        Ok(result)
    }
}

/// Persist one scoring outcome and count it against its model version.
pub fn append(
    conn: &Connection,
    entry: &NewResult,
    outcome: &ScoreOutcome,
) -> Result<ClassificationResult, AffinityError> {
    let reasons = serde_json::to_string(&outcome.reasons)?;
    let embedding = entry.embedding.map(vector::encode);
    let dims = entry.embedding.map(|e| e.len() as i64);

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO classification_results
            (preference_id, artifact, physical_score, personality_score, interest_score,
             confidence, is_match, recommendation, reasons, name, age, bio,
             model_version_id, embedding, embedding_dims)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            entry.preference_id,
            entry.artifact,
            outcome.components.physical as f64,
            outcome.components.personality as f64,
            outcome.components.interests as f64,
            outcome.confidence as f64,
            outcome.is_match,
            outcome.recommendation.as_str(),
            reasons,
            entry.name,
            entry.age.map(i64::from),
            entry.bio,
            entry.model_version_id,
            embedding,
            dims,
        ],
    )?;
    let id = tx.last_insert_rowid();
    registry::record_prediction(&tx, entry.model_version_id)?;
    tx.commit()?;

    log::debug!(
        "result {id}: {} confidence {:.3} ({})",
        entry.artifact,
        outcome.confidence,
        outcome.recommendation.as_str()
    );
    get(conn, id)
}

pub fn get(conn: &Connection, id: i64) -> Result<ClassificationResult, AffinityError> {
    conn.query_row(
        &format!("SELECT {RESULT_COLUMNS} FROM classification_results WHERE id = ?1"),
        [id],
        row_to_raw,
    )
    .optional()?
    .ok_or_else(|| AffinityError::NotFound(format!("classification result {id}")))?
    .finish()
}

/// Set, change or clear (`label = None`) the feedback on a result.
///
/// Idempotent: repeating the current label changes nothing, including the
/// timestamp. Counter compensation and the row update share a transaction.
fn set_feedback(
    conn: &Connection,
    id: i64,
    label: Option<Feedback>,
) -> Result<ClassificationResult, AffinityError> {
    let tx = conn.unchecked_transaction()?;
    let current = get(&tx, id)?;
    let transition = FeedbackTransition::between(current.feedback, label);
    if transition == FeedbackTransition::Unchanged {
        return Ok(current);
    }

    registry::record_feedback(&tx, current.model_version_id, label, current.feedback)?;
    tx.execute(
        "UPDATE classification_results
         SET feedback = ?1, feedback_at = CASE WHEN ?1 IS NULL THEN NULL ELSE unixepoch('now') END
         WHERE id = ?2",
        params![label.map(Feedback::as_str), id],
    )?;
    tx.commit()?;

    log::info!("result {id}: feedback {transition:?}");
    get(conn, id)
}

pub fn submit_feedback(
    conn: &Connection,
    id: i64,
    label: Feedback,
) -> Result<ClassificationResult, AffinityError> {
    set_feedback(conn, id, Some(label))
}

pub fn remove_feedback(conn: &Connection, id: i64) -> Result<ClassificationResult, AffinityError> {
    set_feedback(conn, id, None)
}

/// Hard delete. Feedback counters are reversed first; prediction counts stay.
pub fn delete_result(conn: &Connection, id: i64) -> Result<(), AffinityError> {
    let tx = conn.unchecked_transaction()?;
    let current = get(&tx, id)?;
    registry::record_feedback(&tx, current.model_version_id, None, current.feedback)?;
    tx.execute("DELETE FROM classification_results WHERE id = ?1", [id])?;
    tx.commit()?;
    log::info!("result {id}: deleted");
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub preference_id: Option<i64>,
    pub matches_only: bool,
    pub labeled_only: bool,
    pub limit: i64,
    pub offset: i64,
}

/// Most recent results first. `limit` is clamped to 1..=100.
pub fn history(
    conn: &Connection,
    filter: &HistoryFilter,
) -> Result<Vec<ClassificationResult>, AffinityError> {
    let mut sql = format!("SELECT {RESULT_COLUMNS} FROM classification_results WHERE 1 = 1");
    if filter.preference_id.is_some() {
        sql.push_str(" AND preference_id = ?3");
    }
    if filter.matches_only {
        sql.push_str(" AND is_match = 1");
    }
    if filter.labeled_only {
        sql.push_str(" AND feedback IS NOT NULL");
    }
    sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2");

    let limit = filter.limit.clamp(1, MAX_HISTORY_LIMIT);
    let offset = filter.offset.max(0);
    let mut stmt = conn.prepare(&sql)?;
    let raw: Vec<RawResult> = match filter.preference_id {
        Some(pref) => stmt
            .query_map(params![limit, offset, pref], row_to_raw)?
            .collect::<Result<_, _>>()?,
        None => stmt
            .query_map(params![limit, offset], row_to_raw)?
            .collect::<Result<_, _>>()?,
    };
    raw.into_iter().map(RawResult::finish).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerStats {
    pub total: i64,
    pub matches: i64,
    pub match_rate: f64,
    pub average_confidence: f64,
    pub labeled: i64,
    pub likes: i64,
    pub dislikes: i64,
    pub super_likes: i64,
}

pub fn stats(conn: &Connection, preference_id: Option<i64>) -> Result<LedgerStats, AffinityError> {
    let mut s = conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(is_match), 0),
                COALESCE(AVG(confidence), 0.0),
                COUNT(feedback),
                COALESCE(SUM(feedback = 'like'), 0),
                COALESCE(SUM(feedback = 'dislike'), 0),
                COALESCE(SUM(feedback = 'super_like'), 0)
         FROM classification_results
         WHERE ?1 IS NULL OR preference_id = ?1",
        [preference_id],
        |r| {
            Ok(LedgerStats {
                total: r.get(0)?,
                matches: r.get(1)?,
                match_rate: 0.0,
                average_confidence: r.get(2)?,
                labeled: r.get(3)?,
                likes: r.get(4)?,
                dislikes: r.get(5)?,
                super_likes: r.get(6)?,
            })
        },
    )?;
    if s.total > 0 {
        s.match_rate = s.matches as f64 / s.total as f64;
    }
    Ok(s)
}

/// Labeled results that carry a stored vector, i.e. usable for training.
pub fn count_labeled(conn: &Connection, preference_id: i64) -> Result<i64, AffinityError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM classification_results
         WHERE preference_id = ?1 AND feedback IS NOT NULL AND embedding IS NOT NULL",
        [preference_id],
        |r| r.get(0),
    )?)
}

/// Training set: every labeled result with a stored vector, oldest first.
pub fn labeled_samples(conn: &Connection, preference_id: i64) -> Result<Vec<Sample>, AffinityError> {
    let mut stmt = conn.prepare(
        "SELECT feedback, embedding FROM classification_results
         WHERE preference_id = ?1 AND feedback IS NOT NULL AND embedding IS NOT NULL
         ORDER BY id",
    )?;
    let rows: Vec<(String, Vec<u8>)> = stmt
        .query_map([preference_id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<Result<_, _>>()?;

    rows.into_iter()
        .map(|(label, blob)| {
            Ok(Sample {
                vector: vector::decode(&blob)?,
                target: Feedback::parse(&label)?.target(),
            })
        })
        .collect()
}
