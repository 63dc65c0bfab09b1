pub mod cli;
pub mod commands;
pub mod config;
pub mod db;
pub mod engine;
pub mod extract;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod preferences;
pub mod registry;
pub mod schema;
pub mod score;
pub mod training;
pub mod vector;

#[derive(Debug)]
pub enum AffinityError {
    Database(rusqlite::Error),
    Io(std::io::Error),
    Json(serde_json::Error),
    Config(String),
    /// Caller supplied something structurally invalid (bad weights, unknown label).
    Invalid(String),
    NotFound(String),
    /// Upstream feature/OCR extraction failed; nothing was persisted.
    Extraction(String),
    SignalShapeMismatch { expected: usize, found: usize },
    InsufficientTrainingData { have: i64, need: i64 },
    TrainingAlreadyInProgress { preference_id: i64, job_id: i64 },
    UnknownVersion(i64),
    VersionNotReady { version_id: i64, status: String },
    TrainingFailed(String),
}

impl std::fmt::Display for AffinityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AffinityError::Database(e) => write!(f, "database: {e}"),
            AffinityError::Io(e) => write!(f, "io: {e}"),
            AffinityError::Json(e) => write!(f, "json: {e}"),
            AffinityError::Config(msg) => write!(f, "config: {msg}"),
            AffinityError::Invalid(msg) => write!(f, "invalid: {msg}"),
            AffinityError::NotFound(what) => write!(f, "not found: {what}"),
            AffinityError::Extraction(msg) => write!(f, "extraction failed: {msg}"),
            AffinityError::SignalShapeMismatch { expected, found } => write!(
                f,
                "signal shape mismatch: expected {expected}-dim vector, got {found}"
            ),
            AffinityError::InsufficientTrainingData { have, need } => write!(
                f,
                "insufficient training data: {have} labeled results, need {need}"
            ),
            AffinityError::TrainingAlreadyInProgress {
                preference_id,
                job_id,
            } => write!(
                f,
                "training already in progress for preference {preference_id} (job {job_id})"
            ),
            AffinityError::UnknownVersion(id) => write!(f, "unknown model version {id}"),
            AffinityError::VersionNotReady { version_id, status } => write!(
                f,
                "model version {version_id} is {status}, only ready or retired versions can be activated"
            ),
            AffinityError::TrainingFailed(reason) => write!(f, "training failed: {reason}"),
        }
    }
}

impl std::error::Error for AffinityError {}

impl From<rusqlite::Error> for AffinityError {
    fn from(e: rusqlite::Error) -> Self {
        AffinityError::Database(e)
    }
}

impl From<std::io::Error> for AffinityError {
    fn from(e: std::io::Error) -> Self {
        AffinityError::Io(e)
    }
}

impl From<serde_json::Error> for AffinityError {
    fn from(e: serde_json::Error) -> Self {
        AffinityError::Json(e)
    }
}

impl From<rusqlite_migration::Error> for AffinityError {
    fn from(e: rusqlite_migration::Error) -> Self {
        match e {
            rusqlite_migration::Error::RusqliteError { query: _, err } => {
                AffinityError::Database(err)
            }
            other => AffinityError::Config(format!("migration: {other}")),
        }
    }
}

pub fn schema_migrations() -> &'static rusqlite_migration::Migrations<'static> {
    &schema::MIGRATIONS
}

