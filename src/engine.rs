//! Service facade over the ledger, registry and orchestrator.
//!
//! One [`Engine`] owns a shared connection handle and the external
//! collaborators. Scoring runs outside the connection lock on a snapshot of
//! the preference and active model; only the snapshot read and the final
//! append take the lock. Training runs on its own thread and connection.

use crate::AffinityError;
use crate::config::AffinityConfig;
use crate::extract::{FeatureExtractor, TextRecognizer, parse_profile_fields};
use crate::ledger::{self, ClassificationResult, Feedback, NewResult};
use crate::model::Trainer;
use crate::preferences;
use crate::preferences::PreferenceConfig;
use crate::registry::{self, ActiveModel, ModelVersion};
use crate::score::{self, CandidateSignals, Rules};
use crate::training::{self, TrainingHandle, TrainingJob};
use crate::vector;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

type DbHandle = Arc<Mutex<Connection>>;

/// A candidate as delivered by the capture layer, before extraction.
#[derive(Debug, Clone, Default)]
pub struct CandidateInput {
    pub artifact: String,
    pub images: Vec<PathBuf>,
    /// Bio text if already known; otherwise read by OCR from the first image.
    pub bio: Option<String>,
    pub name: Option<String>,
    pub age: Option<u32>,
}

/// Provenance fields stored with a result but never scored.
#[derive(Debug, Clone, Default)]
pub struct Provenance {
    pub artifact: String,
    pub name: Option<String>,
}

pub struct Engine {
    db_path: PathBuf,
    db: DbHandle,
    config: AffinityConfig,
    extractor: Arc<dyn FeatureExtractor>,
    recognizer: Arc<dyn TextRecognizer>,
    trainer: Arc<dyn Trainer>,
}

fn lock_err<T>(_: std::sync::PoisonError<T>) -> AffinityError {
    AffinityError::Config("database handle poisoned by a panicked caller".into())
}

/// Read the preference and its active model inside one deferred
/// transaction, so both come from the same committed state even while
/// other processes replace the preference or activate a version.
fn read_snapshot(
    conn: &Connection,
    preference_id: i64,
) -> Result<(PreferenceConfig, ActiveModel), AffinityError> {
    let tx = conn.unchecked_transaction()?;
    let prefs = preferences::load_preference(&tx, preference_id)?;
    let active = registry::active_model(&tx, preference_id)?;
    tx.commit()?;
    Ok((prefs, active))
}

impl Engine {
    /// Open (and migrate) the database and make sure every preference has
    /// its baseline version.
    pub fn open(
        db_path: &Path,
        config: AffinityConfig,
        extractor: Arc<dyn FeatureExtractor>,
        recognizer: Arc<dyn TextRecognizer>,
        trainer: Arc<dyn Trainer>,
    ) -> Result<Self, AffinityError> {
        let conn = crate::db::open_db(db_path)?;
        let registered = registry::ensure_baselines(&conn)?;
        if registered > 0 {
            log::info!("registered {registered} baseline version(s)");
        }
        Ok(Self {
            db_path: db_path.to_path_buf(),
            db: Arc::new(Mutex::new(conn)),
            config,
            extractor,
            recognizer,
            trainer,
        })
    }

    pub fn config(&self) -> &AffinityConfig {
        &self.config
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, AffinityError> {
        self.db.lock().map_err(lock_err)
    }

    /// Run `f` with the shared connection held.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, AffinityError>,
    ) -> Result<T, AffinityError> {
        let db = self.conn()?;
        f(&db)
    }

    /// Score already-extracted signals and append the result.
    pub fn classify(
        &self,
        signals: &CandidateSignals,
        provenance: &Provenance,
        preference_id: i64,
    ) -> Result<ClassificationResult, AffinityError> {
        let (prefs, active) = read_snapshot(&*self.conn()?, preference_id)?;
        let rules = Rules::compile(&prefs)?;

        let outcome = score::score_with(
            signals,
            &prefs,
            &rules,
            active.head.as_deref(),
            &self.config.scoring,
        )?;
        let embedding = vector::centroid(&signals.image_vectors);
        let bio = (!signals.bio.is_empty()).then_some(signals.bio.as_str());

        let db = self.conn()?;
        ledger::append(
            &db,
            &NewResult {
                preference_id,
                artifact: &provenance.artifact,
                name: provenance.name.as_deref(),
                age: signals.age,
                bio,
                embedding: embedding.as_deref(),
                model_version_id: Some(active.version.id),
            },
            &outcome,
        )
    }

    /// Extract signals from raw images, then [`classify`](Self::classify).
    /// Any extraction failure aborts before anything is written.
    pub fn classify_input(
        &self,
        input: &CandidateInput,
        preference_id: i64,
    ) -> Result<ClassificationResult, AffinityError> {
        let image_vectors = input
            .images
            .iter()
            .map(|p| self.extractor.image_vector(p))
            .collect::<Result<Vec<_>, _>>()?;

        let bio = match (&input.bio, input.images.first()) {
            (Some(bio), _) => bio.clone(),
            (None, Some(first)) => self.recognizer.bio_text(first)?,
            (None, None) => String::new(),
        };

        let parsed = parse_profile_fields(&bio);
        let text_vector = if bio.trim().is_empty() {
            None
        } else {
            self.extractor.text_vector(&bio)?
        };

        let signals = CandidateSignals {
            image_vectors,
            text_vector,
            age: input.age.or(parsed.age),
            bio,
        };
        let provenance = Provenance {
            artifact: input.artifact.clone(),
            name: input.name.clone().or(parsed.name),
        };
        self.classify(&signals, &provenance, preference_id)
    }

    pub fn submit_feedback(
        &self,
        result_id: i64,
        label: Feedback,
    ) -> Result<ClassificationResult, AffinityError> {
        ledger::submit_feedback(&*self.conn()?, result_id, label)
    }

    pub fn remove_feedback(&self, result_id: i64) -> Result<ClassificationResult, AffinityError> {
        ledger::remove_feedback(&*self.conn()?, result_id)
    }

    pub fn delete_result(&self, result_id: i64) -> Result<(), AffinityError> {
        ledger::delete_result(&*self.conn()?, result_id)
    }

    /// Queue a job and start it on a background worker.
    pub fn start_training(&self, preference_id: i64) -> Result<TrainingHandle, AffinityError> {
        let job = training::create_job(&*self.conn()?, preference_id, &self.config.training)?;
        training::spawn_job(&self.db_path, job, Arc::clone(&self.trainer))
    }

    /// Queue and run a job on the calling thread's own connection.
    pub fn train_blocking(&self, preference_id: i64) -> Result<TrainingJob, AffinityError> {
        let job = training::create_job(&*self.conn()?, preference_id, &self.config.training)?;
        let worker = crate::db::open_db(&self.db_path)?;
        let flag = std::sync::atomic::AtomicBool::new(false);
        training::run_job(&worker, job.id, self.trainer.as_ref(), &flag)
    }

    pub fn cancel_training(&self, job_id: i64) -> Result<TrainingJob, AffinityError> {
        training::cancel_job(&*self.conn()?, job_id)
    }

    pub fn activate_version(&self, version_id: i64) -> Result<ModelVersion, AffinityError> {
        registry::activate(&*self.conn()?, version_id)
    }

    pub fn list_versions(&self, preference_id: i64) -> Result<Vec<ModelVersion>, AffinityError> {
        registry::list_versions(&*self.conn()?, preference_id)
    }
}
