use rusqlite_migration::{M, Migrations};
use std::sync::LazyLock;

pub static MIGRATIONS: LazyLock<Migrations<'static>> = LazyLock::new(|| {
    Migrations::new(vec![
        M::up(
            "
CREATE TABLE preferences (
    id                  INTEGER PRIMARY KEY,
    name                TEXT NOT NULL,
    physical_weight     REAL NOT NULL DEFAULT 0.6,
    personality_weight  REAL NOT NULL DEFAULT 0.3,
    interest_weight     REAL NOT NULL DEFAULT 0.1,
    min_score           REAL NOT NULL DEFAULT 0.6,
    exceptional_score   REAL NOT NULL DEFAULT 0.85,
    age_min             INTEGER NOT NULL DEFAULT 25,
    age_max             INTEGER NOT NULL DEFAULT 35,
    created_at          INTEGER NOT NULL DEFAULT (unixepoch('now')),
    updated_at          INTEGER NOT NULL DEFAULT (unixepoch('now'))
);

CREATE TABLE preference_keywords (
    id              INTEGER PRIMARY KEY,
    preference_id   INTEGER NOT NULL REFERENCES preferences(id) ON DELETE CASCADE,
    keyword         TEXT NOT NULL,
    kind            TEXT NOT NULL CHECK (kind IN ('positive', 'negative', 'required'))
);

CREATE TABLE preference_traits (
    id                  INTEGER PRIMARY KEY,
    preference_id       INTEGER NOT NULL REFERENCES preferences(id) ON DELETE CASCADE,
    trait_name          TEXT NOT NULL,
    description_vector  BLOB
);

CREATE TABLE preference_interests (
    id              INTEGER PRIMARY KEY,
    preference_id   INTEGER NOT NULL REFERENCES preferences(id) ON DELETE CASCADE,
    interest        TEXT NOT NULL,
    is_dealbreaker  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE reference_signals (
    id              INTEGER PRIMARY KEY,
    preference_id   INTEGER NOT NULL REFERENCES preferences(id) ON DELETE CASCADE,
    polarity        TEXT NOT NULL CHECK (polarity IN ('positive', 'negative')),
    dims            INTEGER NOT NULL,
    vector          BLOB NOT NULL,
    label           TEXT,
    category        TEXT NOT NULL DEFAULT 'general',
    created_at      INTEGER NOT NULL DEFAULT (unixepoch('now'))
);

CREATE TABLE classification_results (
    id                  INTEGER PRIMARY KEY,
    preference_id       INTEGER NOT NULL REFERENCES preferences(id),
    artifact            TEXT NOT NULL,
    physical_score      REAL NOT NULL,
    personality_score   REAL NOT NULL,
    interest_score      REAL NOT NULL,
    confidence          REAL NOT NULL,
    is_match            INTEGER NOT NULL,
    recommendation      TEXT NOT NULL,
    reasons             TEXT NOT NULL,
    name                TEXT,
    age                 INTEGER,
    bio                 TEXT,
    created_at          INTEGER NOT NULL DEFAULT (unixepoch('now'))
);

CREATE INDEX idx_kw_pref ON preference_keywords(preference_id, kind);
CREATE INDEX idx_traits_pref ON preference_traits(preference_id);
CREATE INDEX idx_interests_pref ON preference_interests(preference_id);
CREATE INDEX idx_refs_pref ON reference_signals(preference_id);
CREATE INDEX idx_results_pref ON classification_results(preference_id, created_at);
",
        ),
        M::up(
            "
CREATE TABLE model_versions (
    id                  INTEGER PRIMARY KEY,
    preference_id       INTEGER NOT NULL REFERENCES preferences(id),
    version_number      INTEGER NOT NULL,
    family              TEXT NOT NULL,
    params              BLOB,
    status              TEXT NOT NULL
        CHECK (status IN ('training', 'ready', 'active', 'retired', 'failed')),
    total_predictions   INTEGER NOT NULL DEFAULT 0,
    likes               INTEGER NOT NULL DEFAULT 0,
    dislikes            INTEGER NOT NULL DEFAULT 0,
    super_likes         INTEGER NOT NULL DEFAULT 0,
    sample_count        INTEGER NOT NULL DEFAULT 0,
    train_accuracy      REAL,
    validation_accuracy REAL,
    metadata            TEXT,
    failure_reason      TEXT,
    created_at          INTEGER NOT NULL DEFAULT (unixepoch('now')),
    trained_at          INTEGER,
    activated_at        INTEGER,
    UNIQUE (preference_id, version_number)
);
CREATE UNIQUE INDEX idx_mv_single_active ON model_versions(preference_id)
    WHERE status = 'active';

CREATE TABLE training_jobs (
    id                  INTEGER PRIMARY KEY,
    preference_id       INTEGER NOT NULL REFERENCES preferences(id),
    model_version_id    INTEGER UNIQUE REFERENCES model_versions(id),
    status              TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'running', 'completed', 'failed', 'cancelled')),
    hyperparams         TEXT NOT NULL,
    processed_samples   INTEGER NOT NULL DEFAULT 0,
    total_samples       INTEGER NOT NULL DEFAULT 0,
    error               TEXT,
    created_at          INTEGER NOT NULL DEFAULT (unixepoch('now')),
    started_at          INTEGER,
    completed_at        INTEGER
);
CREATE UNIQUE INDEX idx_tj_single_live ON training_jobs(preference_id)
    WHERE status IN ('pending', 'running');
CREATE INDEX idx_tj_pref ON training_jobs(preference_id, created_at);

ALTER TABLE classification_results ADD COLUMN model_version_id INTEGER REFERENCES model_versions(id);
ALTER TABLE classification_results ADD COLUMN feedback TEXT
    CHECK (feedback IS NULL OR feedback IN ('like', 'dislike', 'super_like'));
ALTER TABLE classification_results ADD COLUMN feedback_at INTEGER;
CREATE INDEX idx_results_feedback ON classification_results(preference_id, feedback)
    WHERE feedback IS NOT NULL;
",
        ),
        M::up(
            "
ALTER TABLE classification_results ADD COLUMN embedding BLOB;
ALTER TABLE classification_results ADD COLUMN embedding_dims INTEGER;
",
        ),
    ])
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_valid() {
        assert!(MIGRATIONS.validate().is_ok());
    }

    #[test]
    fn migrations_apply_to_memory_db() {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        MIGRATIONS.to_latest(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        for table in [
            "preferences",
            "preference_keywords",
            "preference_traits",
            "preference_interests",
            "reference_signals",
            "classification_results",
            "model_versions",
            "training_jobs",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn second_active_version_rejected_by_index() {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        MIGRATIONS.to_latest(&mut conn).unwrap();
        conn.execute("INSERT INTO preferences (name) VALUES ('p')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO model_versions (preference_id, version_number, family, status)
             VALUES (1, 1, 'baseline', 'active')",
            [],
        )
        .unwrap();
        let second = conn.execute(
            "INSERT INTO model_versions (preference_id, version_number, family, status)
             VALUES (1, 2, 'logistic', 'active')",
            [],
        );
        assert!(second.is_err());
    }
}
