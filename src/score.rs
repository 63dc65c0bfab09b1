//! Compatibility scoring.
//!
//! [`score`] is a pure function of the candidate's signals, one preference
//! snapshot, and the active version's learned head (if any). Three channels
//! are scored independently and combined by normalised weights:
//!
//! - physical: cosine similarity of candidate photos to the reference set,
//!   optionally blended with the learned head
//! - personality: keyword rules plus valued traits found in the bio
//! - interests: shared interests, with dealbreakers as a hard channel veto
//!
//! A veto zeroes only its own channel. It still enters the weighted sum as 0
//! and its reason is always listed first.

use crate::AffinityError;
use crate::config::ScoringConfig;
use crate::model::ScoringHead;
use crate::preferences::{Polarity, PreferenceConfig};
use crate::vector::{check_dims, check_finite, cosine, normalize};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const NEUTRAL: f32 = 0.5;
const MAX_WEIGHT: f32 = 0.7;
const MEAN_WEIGHT: f32 = 0.3;
const NEGATIVE_PENALTY: f32 = 0.3;
const TRAIT_BONUS: f32 = 0.1;
const INTEREST_BONUS: f32 = 0.1;
const POSITIVE_KEYWORD_BONUS: f32 = 0.08;
const MISSING_REQUIRED_FACTOR: f32 = 0.5;
const STRONG_OVERALL: f32 = 0.70;

/// Everything known about one candidate at scoring time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateSignals {
    #[serde(default)]
    pub image_vectors: Vec<Vec<f32>>,
    /// Encoder vector of the bio text, in the same space as image vectors.
    #[serde(default)]
    pub text_vector: Option<Vec<f32>>,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub age: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub physical: f32,
    pub personality: f32,
    pub interests: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Pass,
    Like,
    SuperLike,
}

impl Recommendation {
    pub fn as_str(self) -> &'static str {
        match self {
            Recommendation::Pass => "pass",
            Recommendation::Like => "like",
            Recommendation::SuperLike => "super_like",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AffinityError> {
        match s {
            "pass" => Ok(Recommendation::Pass),
            "like" => Ok(Recommendation::Like),
            "super_like" => Ok(Recommendation::SuperLike),
            other => Err(AffinityError::Invalid(format!(
                "unknown recommendation {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreOutcome {
    pub confidence: f32,
    pub components: ComponentScores,
    pub reasons: Vec<String>,
    pub is_match: bool,
    pub recommendation: Recommendation,
}

/// Case-insensitive whole-phrase matcher. The phrase must be bounded by a
/// non-word character or an end of the text on both sides, so phrases that
/// begin or end in symbols (`c++`, `C#`) match like plain words.
#[derive(Debug, Clone)]
struct Phrase {
    text: String,
    re: Option<Regex>,
}

impl Phrase {
    fn compile(raw: &str) -> Result<Self, AffinityError> {
        let trimmed = raw.trim();
        let re = if trimmed.is_empty() {
            None
        } else {
            let pattern = format!(r"(?i)(?:^|\W){}(?:\W|$)", regex::escape(trimmed));
            Some(Regex::new(&pattern).map_err(|e| {
                AffinityError::Invalid(format!("cannot match phrase {trimmed:?}: {e}"))
            })?)
        };
        Ok(Self {
            text: raw.to_string(),
            re,
        })
    }

    fn found_in(&self, text: &str) -> bool {
        self.re.as_ref().is_some_and(|re| re.is_match(text))
    }
}

fn compile_all(list: &[String]) -> Result<Vec<Phrase>, AffinityError> {
    list.iter().map(|p| Phrase::compile(p)).collect()
}

/// Keyword, trait and interest matchers compiled from one preference
/// snapshot. Build once per snapshot and reuse across [`score_with`] calls.
#[derive(Debug, Clone)]
pub struct Rules {
    negative: Vec<Phrase>,
    required: Vec<Phrase>,
    positive: Vec<Phrase>,
    /// Parallel to `PreferenceConfig::traits`.
    traits: Vec<Phrase>,
    shared: Vec<Phrase>,
    dealbreakers: Vec<Phrase>,
}

impl Rules {
    pub fn compile(prefs: &PreferenceConfig) -> Result<Self, AffinityError> {
        Ok(Self {
            negative: compile_all(&prefs.negative_keywords)?,
            required: compile_all(&prefs.required_keywords)?,
            positive: compile_all(&prefs.positive_keywords)?,
            traits: prefs
                .traits
                .iter()
                .map(|t| Phrase::compile(&t.name))
                .collect::<Result<_, _>>()?,
            shared: compile_all(&prefs.shared_interests)?,
            dealbreakers: compile_all(&prefs.dealbreaker_interests)?,
        })
    }
}

struct Channel {
    score: f32,
    veto: Option<String>,
    reasons: Vec<String>,
}

fn validate_shapes(
    signals: &CandidateSignals,
    prefs: &PreferenceConfig,
    head: Option<&dyn ScoringHead>,
) -> Result<(), AffinityError> {
    let expected = prefs
        .reference_dims()
        .or_else(|| signals.image_vectors.first().map(Vec::len))
        .or_else(|| signals.text_vector.as_ref().map(Vec::len));
    for v in &signals.image_vectors {
        check_finite("image vector", v)?;
    }
    if let Some(text) = &signals.text_vector {
        check_finite("text vector", text)?;
    }
    let Some(expected) = expected else {
        return Ok(());
    };

    check_dims(&signals.image_vectors, expected)?;
    if let Some(text) = &signals.text_vector {
        check_dims(std::iter::once(text), expected)?;
    }
    if let Some(head) = head
        && !signals.image_vectors.is_empty()
        && head.dims() != expected
    {
        return Err(AffinityError::SignalShapeMismatch {
            expected: head.dims(),
            found: expected,
        });
    }
    Ok(())
}

fn physical_channel(
    signals: &CandidateSignals,
    prefs: &PreferenceConfig,
    head: Option<&dyn ScoringHead>,
    params: &ScoringConfig,
) -> Channel {
    if signals.image_vectors.is_empty() {
        return Channel {
            score: NEUTRAL,
            veto: None,
            reasons: vec!["no photos to compare".into()],
        };
    }

    let mut positive = Vec::new();
    let mut negative = Vec::new();
    for v in &signals.image_vectors {
        for r in &prefs.references {
            let sim = cosine(v, &r.vector);
            match r.polarity {
                Polarity::Positive => positive.push(sim),
                Polarity::Negative => negative.push(sim),
            }
        }
    }

    let mut evidence = !prefs.references.is_empty();
    let mut score = if positive.is_empty() {
        NEUTRAL
    } else {
        let max = positive.iter().copied().fold(f32::MIN, f32::max);
        let mean = positive.iter().sum::<f32>() / positive.len() as f32;
        MAX_WEIGHT * max + MEAN_WEIGHT * mean
    };
    if !negative.is_empty() {
        let mean_neg = negative.iter().sum::<f32>() / negative.len() as f32;
        score -= NEGATIVE_PENALTY * mean_neg.max(0.0);
    }
    score = score.clamp(0.0, 1.0);

    if let Some(head) = head {
        let learned = signals
            .image_vectors
            .iter()
            .map(|v| head.predict(&normalize(v)))
            .fold(0.0f32, f32::max);
        let blend = params.learned_blend;
        score = ((1.0 - blend) * score + blend * learned).clamp(0.0, 1.0);
        evidence = true;
    }

    let mut reasons = Vec::new();
    if !evidence {
        reasons.push("no reference images for comparison".into());
    } else if score >= 0.75 {
        reasons.push("strong visual similarity".into());
    } else if score >= 0.5 {
        reasons.push("moderate visual compatibility".into());
    } else if score < 0.35 {
        reasons.push("visual mismatch".into());
    }

    Channel {
        score,
        veto: None,
        reasons,
    }
}

fn trait_matches_vector(
    description: &[f32],
    signals: &CandidateSignals,
    threshold: f32,
) -> Result<bool, AffinityError> {
    let candidates = signals.text_vector.iter().chain(&signals.image_vectors);
    for v in candidates {
        if v.len() != description.len() {
            return Err(AffinityError::SignalShapeMismatch {
                expected: description.len(),
                found: v.len(),
            });
        }
        if cosine(description, v) >= threshold {
            return Ok(true);
        }
    }
    Ok(false)
}

fn personality_channel(
    signals: &CandidateSignals,
    prefs: &PreferenceConfig,
    rules: &Rules,
    params: &ScoringConfig,
) -> Result<Channel, AffinityError> {
    let bio = signals.bio.as_str();

    if let Some(word) = rules.negative.iter().find(|k| k.found_in(bio)) {
        return Ok(Channel {
            score: 0.0,
            veto: Some(format!("dealbreaker keyword \"{}\" in bio", word.text)),
            reasons: Vec::new(),
        });
    }

    let mut score = NEUTRAL;
    let mut reasons = Vec::new();
    let mut penalties = Vec::new();

    for word in &rules.required {
        if !word.found_in(bio) {
            score *= MISSING_REQUIRED_FACTOR;
            penalties.push(format!("required keyword \"{}\" missing", word.text));
        }
    }

    for (t, phrase) in prefs.traits.iter().zip(&rules.traits) {
        let matched = phrase.found_in(bio)
            || match &t.description_vector {
                Some(desc) => trait_matches_vector(desc, signals, params.trait_similarity)?,
                None => false,
            };
        if matched {
            score += TRAIT_BONUS;
            reasons.push(format!("valued trait: {}", t.name));
        }
    }

    for word in &rules.positive {
        if word.found_in(bio) {
            score += POSITIVE_KEYWORD_BONUS;
            reasons.push(format!("mentions \"{}\"", word.text));
        }
    }

    reasons.extend(penalties);
    Ok(Channel {
        score: score.clamp(0.0, 1.0),
        veto: None,
        reasons,
    })
}

fn interest_channel(signals: &CandidateSignals, rules: &Rules) -> Channel {
    let bio = signals.bio.as_str();

    if let Some(interest) = rules.dealbreakers.iter().find(|i| i.found_in(bio)) {
        return Channel {
            score: 0.0,
            veto: Some(format!("dealbreaker interest: {}", interest.text)),
            reasons: Vec::new(),
        };
    }

    let mut score = NEUTRAL;
    let mut reasons = Vec::new();
    for interest in &rules.shared {
        if interest.found_in(bio) {
            score += INTEREST_BONUS;
            reasons.push(format!("shares interest: {}", interest.text));
        }
    }

    Channel {
        score: score.min(1.0),
        veto: None,
        reasons,
    }
}

/// Score one candidate against a preference snapshot.
///
/// Fails with [`AffinityError::SignalShapeMismatch`] when any candidate
/// vector disagrees in length with the reference set or the learned head,
/// and with [`AffinityError::Invalid`] when one carries NaN or infinity.
pub fn score(
    signals: &CandidateSignals,
    prefs: &PreferenceConfig,
    head: Option<&dyn ScoringHead>,
    params: &ScoringConfig,
) -> Result<ScoreOutcome, AffinityError> {
    let rules = Rules::compile(prefs)?;
    score_with(signals, prefs, &rules, head, params)
}

/// [`score`] with matchers already compiled from `prefs`.
pub fn score_with(
    signals: &CandidateSignals,
    prefs: &PreferenceConfig,
    rules: &Rules,
    head: Option<&dyn ScoringHead>,
    params: &ScoringConfig,
) -> Result<ScoreOutcome, AffinityError> {
    validate_shapes(signals, prefs, head)?;

    let physical = physical_channel(signals, prefs, head, params);
    let personality = personality_channel(signals, prefs, rules, params)?;
    let interests = interest_channel(signals, rules);

    let w = &prefs.weights;
    let total = w.physical + w.personality + w.interests;
    let confidence = if total > 0.0 {
        ((physical.score * w.physical
            + personality.score * w.personality
            + interests.score * w.interests)
            / total)
            .clamp(0.0, 1.0)
    } else {
        NEUTRAL
    };

    let is_match = confidence >= prefs.min_score;
    let recommendation = if is_match && confidence >= prefs.exceptional_score {
        Recommendation::SuperLike
    } else if is_match {
        Recommendation::Like
    } else {
        Recommendation::Pass
    };

    let mut reasons: Vec<String> = [&personality.veto, &interests.veto]
        .into_iter()
        .flatten()
        .cloned()
        .collect();
    if confidence >= prefs.exceptional_score {
        reasons.push("exceptional match across all criteria".into());
    } else if confidence >= STRONG_OVERALL {
        reasons.push("strong overall compatibility".into());
    }
    reasons.extend(physical.reasons);
    reasons.extend(personality.reasons);
    reasons.extend(interests.reasons);

    if let Some(age) = signals.age {
        let (lo, hi) = (prefs.age.min, prefs.age.max);
        if prefs.age.contains(age) {
            reasons.push(format!("age {age} is within preferred range [{lo},{hi}]"));
        } else {
            reasons.push(format!("age {age} is outside preferred range [{lo},{hi}]"));
        }
    }

    if reasons.is_empty() {
        reasons.push("neutral compatibility, no strong signals either way".into());
    }

    Ok(ScoreOutcome {
        confidence,
        components: ComponentScores {
            physical: physical.score,
            personality: personality.score,
            interests: interests.score,
        },
        reasons,
        is_match,
        recommendation,
    })
}
