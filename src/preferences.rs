//! Preference configurations and their reference signal sets.
//!
//! A configuration is loaded as one immutable [`PreferenceConfig`] snapshot
//! per scoring call, so edits made while a call is in flight never affect
//! that call and nothing is ever rescored retroactively.

use crate::AffinityError;
use crate::vector;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeywordKind {
    Positive,
    Negative,
    Required,
}

impl KeywordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            KeywordKind::Positive => "positive",
            KeywordKind::Negative => "negative",
            KeywordKind::Required => "required",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    Positive,
    Negative,
}

impl Polarity {
    pub fn as_str(self) -> &'static str {
        match self {
            Polarity::Positive => "positive",
            Polarity::Negative => "negative",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AffinityError> {
        match s {
            "positive" => Ok(Polarity::Positive),
            "negative" => Ok(Polarity::Negative),
            other => Err(AffinityError::Invalid(format!("unknown polarity {other:?}"))),
        }
    }
}

/// Channel importance. Not required to sum to 1; the engine normalises.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    #[serde(default = "default_physical_weight")]
    pub physical: f32,
    #[serde(default = "default_personality_weight")]
    pub personality: f32,
    #[serde(default = "default_interest_weight")]
    pub interests: f32,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            physical: default_physical_weight(),
            personality: default_personality_weight(),
            interests: default_interest_weight(),
        }
    }
}

fn default_physical_weight() -> f32 {
    0.6
}

fn default_personality_weight() -> f32 {
    0.3
}

fn default_interest_weight() -> f32 {
    0.1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeRange {
    pub min: u32,
    pub max: u32,
}

impl Default for AgeRange {
    fn default() -> Self {
        Self { min: 25, max: 35 }
    }
}

impl AgeRange {
    pub fn contains(&self, age: u32) -> bool {
        (self.min..=self.max).contains(&age)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraitPreference {
    pub name: String,
    /// Text-encoder vector of the trait description, for cross-modal matching.
    pub description_vector: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceSignal {
    pub id: i64,
    pub polarity: Polarity,
    pub vector: Vec<f32>,
    pub label: Option<String>,
    pub category: String,
}

/// Full snapshot of one preference configuration, references included.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreferenceConfig {
    pub id: i64,
    pub name: String,
    pub weights: Weights,
    pub min_score: f32,
    pub exceptional_score: f32,
    pub age: AgeRange,
    pub positive_keywords: Vec<String>,
    pub negative_keywords: Vec<String>,
    pub required_keywords: Vec<String>,
    pub traits: Vec<TraitPreference>,
    pub shared_interests: Vec<String>,
    pub dealbreaker_interests: Vec<String>,
    pub references: Vec<ReferenceSignal>,
    pub updated_at: i64,
}

impl PreferenceConfig {
    /// Dimensionality of the reference set, `None` when it is empty.
    pub fn reference_dims(&self) -> Option<usize> {
        self.references.first().map(|r| r.vector.len())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeywordLists {
    #[serde(default)]
    pub positive: Vec<String>,
    #[serde(default)]
    pub negative: Vec<String>,
    #[serde(default)]
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterestLists {
    #[serde(default)]
    pub shared: Vec<String>,
    #[serde(default)]
    pub dealbreakers: Vec<String>,
}

/// Editable document form of a preference configuration (TOML or JSON).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceDoc {
    pub name: String,
    #[serde(default)]
    pub weights: Weights,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    #[serde(default = "default_exceptional_score")]
    pub exceptional_score: f32,
    #[serde(default)]
    pub age: AgeRange,
    #[serde(default)]
    pub keywords: KeywordLists,
    #[serde(default)]
    pub traits: Vec<String>,
    /// Optional description vectors keyed by trait name.
    #[serde(default)]
    pub trait_vectors: HashMap<String, Vec<f32>>,
    #[serde(default)]
    pub interests: InterestLists,
}

fn default_min_score() -> f32 {
    0.6
}

fn default_exceptional_score() -> f32 {
    0.85
}

impl PreferenceDoc {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            weights: Weights::default(),
            min_score: default_min_score(),
            exceptional_score: default_exceptional_score(),
            age: AgeRange::default(),
            keywords: KeywordLists::default(),
            traits: Vec::new(),
            trait_vectors: HashMap::new(),
            interests: InterestLists::default(),
        }
    }

    pub fn validate(&self) -> Result<(), AffinityError> {
        let w = &self.weights;
        for (label, value) in [
            ("physical", w.physical),
            ("personality", w.personality),
            ("interests", w.interests),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(AffinityError::Invalid(format!(
                    "{label} weight must be a non-negative number, got {value}"
                )));
            }
        }
        if w.physical + w.personality + w.interests <= 0.0 {
            return Err(AffinityError::Invalid("weights must not all be zero".into()));
        }
        if !(0.0..=1.0).contains(&self.min_score) || !(0.0..=1.0).contains(&self.exceptional_score)
        {
            return Err(AffinityError::Invalid(
                "min_score and exceptional_score must be in [0, 1]".into(),
            ));
        }
        if self.min_score > self.exceptional_score {
            return Err(AffinityError::Invalid(format!(
                "min_score {} exceeds exceptional_score {}",
                self.min_score, self.exceptional_score
            )));
        }
        if self.age.min > self.age.max {
            return Err(AffinityError::Invalid(format!(
                "age range [{}, {}] is empty",
                self.age.min, self.age.max
            )));
        }

        let shared: HashSet<String> = self
            .interests
            .shared
            .iter()
            .map(|s| s.to_lowercase())
            .collect();
        if let Some(clash) = self
            .interests
            .dealbreakers
            .iter()
            .find(|d| shared.contains(&d.to_lowercase()))
        {
            return Err(AffinityError::Invalid(format!(
                "interest {clash:?} is both shared and a dealbreaker"
            )));
        }

        for (name, v) in &self.trait_vectors {
            if !self.traits.iter().any(|t| t == name) {
                return Err(AffinityError::Invalid(format!(
                    "trait vector given for unlisted trait {name:?}"
                )));
            }
            vector::check_finite(&format!("trait vector {name:?}"), v)?;
        }
        Ok(())
    }
}

/// Insert a preference configuration and register its baseline model version.
pub fn create_preference(conn: &Connection, doc: &PreferenceDoc) -> Result<i64, AffinityError> {
    doc.validate()?;
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO preferences
            (name, physical_weight, personality_weight, interest_weight,
             min_score, exceptional_score, age_min, age_max)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            doc.name,
            doc.weights.physical,
            doc.weights.personality,
            doc.weights.interests,
            doc.min_score,
            doc.exceptional_score,
            doc.age.min,
            doc.age.max,
        ],
    )?;
    let id = tx.last_insert_rowid();
    write_lists(&tx, id, doc)?;
    crate::registry::register_baseline(&tx, id)?;
    tx.commit()?;

    log::info!("created preference {id} ({})", doc.name);
    Ok(id)
}

/// Replace every editable field. References and history are untouched.
pub fn replace_preference(
    conn: &Connection,
    id: i64,
    doc: &PreferenceDoc,
) -> Result<(), AffinityError> {
    doc.validate()?;
    let tx = conn.unchecked_transaction()?;
    let updated = tx.execute(
        "UPDATE preferences SET
            name = ?1, physical_weight = ?2, personality_weight = ?3, interest_weight = ?4,
            min_score = ?5, exceptional_score = ?6, age_min = ?7, age_max = ?8,
            updated_at = unixepoch('now')
         WHERE id = ?9",
        params![
            doc.name,
            doc.weights.physical,
            doc.weights.personality,
            doc.weights.interests,
            doc.min_score,
            doc.exceptional_score,
            doc.age.min,
            doc.age.max,
            id,
        ],
    )?;
    if updated == 0 {
        return Err(AffinityError::NotFound(format!("preference {id}")));
    }
    for table in ["preference_keywords", "preference_traits", "preference_interests"] {
        tx.execute(
            &format!("DELETE FROM {table} WHERE preference_id = ?1"),
            [id],
        )?;
    }
    write_lists(&tx, id, doc)?;
    tx.commit()?;
    Ok(())
}

fn write_lists(conn: &Connection, id: i64, doc: &PreferenceDoc) -> Result<(), AffinityError> {
    let mut kw = conn.prepare_cached(
        "INSERT INTO preference_keywords (preference_id, keyword, kind) VALUES (?1, ?2, ?3)",
    )?;
    for (kind, words) in [
        (KeywordKind::Positive, &doc.keywords.positive),
        (KeywordKind::Negative, &doc.keywords.negative),
        (KeywordKind::Required, &doc.keywords.required),
    ] {
        for word in words {
            kw.execute(params![id, word, kind.as_str()])?;
        }
    }

    let mut tr = conn.prepare_cached(
        "INSERT INTO preference_traits (preference_id, trait_name, description_vector)
         VALUES (?1, ?2, ?3)",
    )?;
    for name in &doc.traits {
        let blob = doc.trait_vectors.get(name).map(|v| vector::encode(v));
        tr.execute(params![id, name, blob])?;
    }

    let mut it = conn.prepare_cached(
        "INSERT INTO preference_interests (preference_id, interest, is_dealbreaker)
         VALUES (?1, ?2, ?3)",
    )?;
    for interest in &doc.interests.shared {
        it.execute(params![id, interest, false])?;
    }
    for interest in &doc.interests.dealbreakers {
        it.execute(params![id, interest, true])?;
    }
    Ok(())
}

/// Load the full snapshot of a preference configuration.
pub fn load_preference(conn: &Connection, id: i64) -> Result<PreferenceConfig, AffinityError> {
    let base = conn
        .query_row(
            "SELECT name, physical_weight, personality_weight, interest_weight,
                    min_score, exceptional_score, age_min, age_max, updated_at
             FROM preferences WHERE id = ?1",
            [id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    Weights {
                        physical: r.get(1)?,
                        personality: r.get(2)?,
                        interests: r.get(3)?,
                    },
                    r.get::<_, f32>(4)?,
                    r.get::<_, f32>(5)?,
                    AgeRange {
                        min: r.get(6)?,
                        max: r.get(7)?,
                    },
                    r.get::<_, i64>(8)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| AffinityError::NotFound(format!("preference {id}")))?;
    let (name, weights, min_score, exceptional_score, age, updated_at) = base;

    let mut positive_keywords = Vec::new();
    let mut negative_keywords = Vec::new();
    let mut required_keywords = Vec::new();
    let mut stmt = conn.prepare(
        "SELECT keyword, kind FROM preference_keywords WHERE preference_id = ?1 ORDER BY id",
    )?;
    let rows: Vec<(String, String)> = stmt
        .query_map([id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<Result<_, _>>()?;
    for (word, kind) in rows {
        match kind.as_str() {
            "positive" => positive_keywords.push(word),
            "negative" => negative_keywords.push(word),
            _ => required_keywords.push(word),
        }
    }

    let mut stmt = conn.prepare(
        "SELECT trait_name, description_vector FROM preference_traits
         WHERE preference_id = ?1 ORDER BY id",
    )?;
    let raw_traits: Vec<(String, Option<Vec<u8>>)> = stmt
        .query_map([id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<Result<_, _>>()?;
    let traits = raw_traits
        .into_iter()
        .map(|(name, blob)| {
            Ok(TraitPreference {
                name,
                description_vector: blob.as_deref().map(vector::decode).transpose()?,
            })
        })
        .collect::<Result<Vec<_>, AffinityError>>()?;

    let mut shared_interests = Vec::new();
    let mut dealbreaker_interests = Vec::new();
    let mut stmt = conn.prepare(
        "SELECT interest, is_dealbreaker FROM preference_interests
         WHERE preference_id = ?1 ORDER BY id",
    )?;
    let rows: Vec<(String, bool)> = stmt
        .query_map([id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<Result<_, _>>()?;
    for (interest, dealbreaker) in rows {
        if dealbreaker {
            dealbreaker_interests.push(interest);
        } else {
            shared_interests.push(interest);
        }
    }

    Ok(PreferenceConfig {
        id,
        name,
        weights,
        min_score,
        exceptional_score,
        age,
        positive_keywords,
        negative_keywords,
        required_keywords,
        traits,
        shared_interests,
        dealbreaker_interests,
        references: list_references(conn, id)?,
        updated_at,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct PreferenceSummary {
    pub id: i64,
    pub name: String,
    pub references: i64,
    pub updated_at: i64,
}

pub fn list_preferences(conn: &Connection) -> Result<Vec<PreferenceSummary>, AffinityError> {
    let mut stmt = conn.prepare(
        "SELECT p.id, p.name, p.updated_at,
                (SELECT COUNT(*) FROM reference_signals r WHERE r.preference_id = p.id)
         FROM preferences p ORDER BY p.id",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(PreferenceSummary {
                id: r.get(0)?,
                name: r.get(1)?,
                updated_at: r.get(2)?,
                references: r.get(3)?,
            })
        })?
        .collect::<Result<_, _>>()?;
    Ok(rows)
}

/// Add a reference vector. Its dimensionality must match the existing set.
pub fn add_reference(
    conn: &Connection,
    preference_id: i64,
    polarity: Polarity,
    raw: &[f32],
    label: Option<&str>,
    category: Option<&str>,
) -> Result<i64, AffinityError> {
    if raw.is_empty() {
        return Err(AffinityError::Invalid("reference vector is empty".into()));
    }
    vector::check_finite("reference vector", raw)?;
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM preferences WHERE id = ?1)",
        [preference_id],
        |r| r.get(0),
    )?;
    if !exists {
        return Err(AffinityError::NotFound(format!("preference {preference_id}")));
    }

    let existing_dims: Option<usize> = conn
        .query_row(
            "SELECT dims FROM reference_signals WHERE preference_id = ?1 LIMIT 1",
            [preference_id],
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .map(|d| d as usize);
    if let Some(expected) = existing_dims
        && expected != raw.len()
    {
        return Err(AffinityError::SignalShapeMismatch {
            expected,
            found: raw.len(),
        });
    }

    let normalized = vector::normalize(raw);
    conn.execute(
        "INSERT INTO reference_signals (preference_id, polarity, dims, vector, label, category)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            preference_id,
            polarity.as_str(),
            normalized.len() as i64,
            vector::encode(&normalized),
            label,
            category.unwrap_or("general"),
        ],
    )?;
    let id = conn.last_insert_rowid();
    log::debug!(
        "preference {preference_id}: added {} reference {id}",
        polarity.as_str()
    );
    Ok(id)
}

pub fn remove_reference(conn: &Connection, reference_id: i64) -> Result<(), AffinityError> {
    let deleted = conn.execute("DELETE FROM reference_signals WHERE id = ?1", [reference_id])?;
    if deleted == 0 {
        return Err(AffinityError::NotFound(format!("reference {reference_id}")));
    }
    Ok(())
}

pub fn list_references(
    conn: &Connection,
    preference_id: i64,
) -> Result<Vec<ReferenceSignal>, AffinityError> {
    let mut stmt = conn.prepare(
        "SELECT id, polarity, vector, label, category FROM reference_signals
         WHERE preference_id = ?1 ORDER BY id",
    )?;
    let rows: Vec<(i64, String, Vec<u8>, Option<String>, String)> = stmt
        .query_map([preference_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })?
        .collect::<Result<_, _>>()?;

    rows.into_iter()
        .map(|(id, polarity, blob, label, category)| {
            Ok(ReferenceSignal {
                id,
                polarity: Polarity::parse(&polarity)?,
                vector: vector::decode(&blob)?,
                label,
                category,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_db;

    fn sample_doc() -> PreferenceDoc {
        let mut doc = PreferenceDoc::named("weekend");
        doc.keywords.negative = vec!["smoker".into()];
        doc.keywords.required = vec!["dog".into()];
        doc.traits = vec!["adventurous".into(), "kind".into()];
        doc.trait_vectors
            .insert("kind".into(), vec![0.0, 1.0, 0.0]);
        doc.interests.shared = vec!["hiking".into(), "yoga".into()];
        doc.interests.dealbreakers = vec!["smoking".into()];
        doc
    }

    #[test]
    fn create_and_load_round_trips_lists() {
        let conn = open_memory_db().unwrap();
        let id = create_preference(&conn, &sample_doc()).unwrap();
        let pref = load_preference(&conn, id).unwrap();

        assert_eq!(pref.name, "weekend");
        assert_eq!(pref.weights, Weights::default());
        assert_eq!(pref.negative_keywords, vec!["smoker"]);
        assert_eq!(pref.required_keywords, vec!["dog"]);
        assert!(pref.positive_keywords.is_empty());
        assert_eq!(pref.traits.len(), 2);
        assert_eq!(pref.traits[0].description_vector, None);
        assert_eq!(pref.traits[1].description_vector, Some(vec![0.0, 1.0, 0.0]));
        assert_eq!(pref.shared_interests, vec!["hiking", "yoga"]);
        assert_eq!(pref.dealbreaker_interests, vec!["smoking"]);
        assert_eq!(pref.age, AgeRange { min: 25, max: 35 });
    }

    #[test]
    fn create_registers_active_baseline() {
        let conn = open_memory_db().unwrap();
        let id = create_preference(&conn, &sample_doc()).unwrap();
        let status: String = conn
            .query_row(
                "SELECT status FROM model_versions WHERE preference_id = ?1 AND version_number = 1",
                [id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(status, "active");
    }

    #[test]
    fn overlapping_interest_lists_rejected() {
        let mut doc = sample_doc();
        doc.interests.dealbreakers.push("Hiking".into());
        assert!(matches!(doc.validate(), Err(AffinityError::Invalid(_))));
    }

    #[test]
    fn threshold_order_enforced() {
        let mut doc = sample_doc();
        doc.min_score = 0.9;
        doc.exceptional_score = 0.8;
        assert!(doc.validate().is_err());
    }

    #[test]
    fn negative_weight_rejected() {
        let mut doc = sample_doc();
        doc.weights.interests = -0.1;
        assert!(doc.validate().is_err());
    }

    #[test]
    fn replace_swaps_lists() {
        let conn = open_memory_db().unwrap();
        let id = create_preference(&conn, &sample_doc()).unwrap();
        let mut doc = PreferenceDoc::named("renamed");
        doc.interests.shared = vec!["climbing".into()];
        replace_preference(&conn, id, &doc).unwrap();

        let pref = load_preference(&conn, id).unwrap();
        assert_eq!(pref.name, "renamed");
        assert_eq!(pref.shared_interests, vec!["climbing"]);
        assert!(pref.dealbreaker_interests.is_empty());
        assert!(pref.traits.is_empty());
    }

    #[test]
    fn replace_unknown_is_not_found() {
        let conn = open_memory_db().unwrap();
        let result = replace_preference(&conn, 42, &PreferenceDoc::named("x"));
        assert!(matches!(result, Err(AffinityError::NotFound(_))));
    }

    #[test]
    fn references_normalized_and_shape_checked() {
        let conn = open_memory_db().unwrap();
        let id = create_preference(&conn, &sample_doc()).unwrap();
        add_reference(&conn, id, Polarity::Positive, &[3.0, 4.0], Some("beach"), None).unwrap();

        let refs = list_references(&conn, id).unwrap();
        assert_eq!(refs.len(), 1);
        assert!((refs[0].vector[0] - 0.6).abs() < 1e-6);
        assert!((refs[0].vector[1] - 0.8).abs() < 1e-6);
        assert_eq!(refs[0].category, "general");

        let mismatch = add_reference(&conn, id, Polarity::Negative, &[1.0, 0.0, 0.0], None, None);
        assert!(matches!(
            mismatch,
            Err(AffinityError::SignalShapeMismatch {
                expected: 2,
                found: 3
            })
        ));
    }

    #[test]
    fn non_finite_vectors_rejected() {
        let conn = open_memory_db().unwrap();
        let id = create_preference(&conn, &sample_doc()).unwrap();
        let nan = add_reference(&conn, id, Polarity::Positive, &[f32::NAN, 0.0], None, None);
        assert!(matches!(nan, Err(AffinityError::Invalid(_))));
        assert!(list_references(&conn, id).unwrap().is_empty());

        let mut doc = sample_doc();
        doc.trait_vectors
            .insert("kind".into(), vec![0.0, f32::INFINITY, 0.0]);
        assert!(matches!(doc.validate(), Err(AffinityError::Invalid(_))));
    }

    #[test]
    fn references_are_scoped_per_preference() {
        let conn = open_memory_db().unwrap();
        let a = create_preference(&conn, &PreferenceDoc::named("a")).unwrap();
        let b = create_preference(&conn, &PreferenceDoc::named("b")).unwrap();
        add_reference(&conn, a, Polarity::Positive, &[1.0, 0.0], None, None).unwrap();
        // different dimensionality is fine in another configuration
        add_reference(&conn, b, Polarity::Positive, &[1.0, 0.0, 0.0], None, None).unwrap();

        assert_eq!(load_preference(&conn, a).unwrap().reference_dims(), Some(2));
        assert_eq!(load_preference(&conn, b).unwrap().reference_dims(), Some(3));
    }

    #[test]
    fn remove_reference_unknown_is_not_found() {
        let conn = open_memory_db().unwrap();
        assert!(matches!(
            remove_reference(&conn, 9),
            Err(AffinityError::NotFound(_))
        ));
    }

    #[test]
    fn doc_parses_from_toml() {
        let doc: PreferenceDoc = toml::from_str(
            r#"
name = "default"
min_score = 0.6

[weights]
physical = 0.6
personality = 0.3
interests = 0.1

[interests]
shared = ["hiking", "yoga"]
dealbreakers = ["smoking"]
"#,
        )
        .unwrap();
        assert_eq!(doc.interests.shared.len(), 2);
        assert!((doc.exceptional_score - 0.85).abs() < 1e-6);
        assert!(doc.validate().is_ok());
    }
}
