//! Model families: the learned heads a model version may carry, and the
//! trainers that produce them.
//!
//! A version's parameter blob is opaque to storage. [`load_head`] is the only
//! place that interprets it, keyed by the version's family string, so a new
//! learning algorithm only needs a new family arm and a [`Trainer`] impl.

use crate::AffinityError;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;

pub const BASELINE_FAMILY: &str = "baseline";
pub const LOGISTIC_FAMILY: &str = "logistic";

/// A learned scorer over candidate feature vectors.
pub trait ScoringHead: Send + Sync + Debug {
    fn family(&self) -> &'static str;
    fn dims(&self) -> usize;
    /// Probability in [0, 1] that a candidate with this vector is liked.
    fn predict(&self, v: &[f32]) -> f32;
    fn to_blob(&self) -> Result<Vec<u8>, AffinityError>;
}

/// Training hyperparameters, stored as JSON on the training job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparams {
    pub epochs: u32,
    pub learning_rate: f64,
    pub l2: f64,
    pub holdout_fraction: f64,
    pub seed: Option<u64>,
}

impl From<&crate::config::TrainingConfig> for Hyperparams {
    fn from(c: &crate::config::TrainingConfig) -> Self {
        Self {
            epochs: c.epochs,
            learning_rate: c.learning_rate,
            l2: c.l2,
            holdout_fraction: c.holdout_fraction,
            seed: c.seed,
        }
    }
}

/// One labeled training example: liked (1.0) or not (0.0).
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub vector: Vec<f32>,
    pub target: f32,
}

pub enum Fit {
    Done(Box<dyn ScoringHead>),
    Cancelled,
}

/// Fits a [`ScoringHead`] from labeled samples.
///
/// `progress` is called after every epoch with the epoch number and the
/// cumulative sample count; returning `false` stops training with
/// [`Fit::Cancelled`].
pub trait Trainer: Send + Sync {
    fn family(&self) -> &'static str;
    fn fit(
        &self,
        samples: &[Sample],
        hp: &Hyperparams,
        progress: &mut dyn FnMut(u32, i64) -> bool,
    ) -> Result<Fit, AffinityError>;
}

/// Interpret a stored parameter blob. Baseline versions carry no head.
pub fn load_head(
    family: &str,
    blob: Option<&[u8]>,
) -> Result<Option<Arc<dyn ScoringHead>>, AffinityError> {
    match family {
        BASELINE_FAMILY => Ok(None),
        LOGISTIC_FAMILY => {
            let blob = blob.ok_or_else(|| {
                AffinityError::Config("logistic model version has no parameters".into())
            })?;
            let head: LogisticHead = serde_json::from_slice(blob)?;
            if head.weights.is_empty() {
                return Err(AffinityError::Config("logistic head has no weights".into()));
            }
            Ok(Some(Arc::new(head)))
        }
        other => Err(AffinityError::Config(format!("unknown model family {other:?}"))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticHead {
    pub weights: Vec<f32>,
    pub bias: f32,
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

impl LogisticHead {
    fn logit(&self, v: &[f32]) -> f64 {
        let dot: f64 = self
            .weights
            .iter()
            .zip(v)
            .map(|(w, x)| *w as f64 * *x as f64)
            .sum();
        dot + self.bias as f64
    }
}

impl ScoringHead for LogisticHead {
    fn family(&self) -> &'static str {
        LOGISTIC_FAMILY
    }

    fn dims(&self) -> usize {
        self.weights.len()
    }

    fn predict(&self, v: &[f32]) -> f32 {
        sigmoid(self.logit(v)).clamp(0.0, 1.0) as f32
    }

    fn to_blob(&self) -> Result<Vec<u8>, AffinityError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Full-batch gradient descent on L2-regularised log loss.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogisticTrainer;

impl Trainer for LogisticTrainer {
    fn family(&self) -> &'static str {
        LOGISTIC_FAMILY
    }

    fn fit(
        &self,
        samples: &[Sample],
        hp: &Hyperparams,
        progress: &mut dyn FnMut(u32, i64) -> bool,
    ) -> Result<Fit, AffinityError> {
        let first = samples
            .first()
            .ok_or_else(|| AffinityError::TrainingFailed("no samples".into()))?;
        let dims = first.vector.len();
        crate::vector::check_dims(samples.iter().map(|s| &s.vector), dims)?;

        let positives = samples.iter().filter(|s| s.target >= 0.5).count();
        if positives == 0 || positives == samples.len() {
            return Err(AffinityError::TrainingFailed(format!(
                "degenerate dataset: all {} samples share one label",
                samples.len()
            )));
        }

        let n = samples.len() as f64;
        let mut weights = vec![0.0f64; dims];
        let mut bias = 0.0f64;
        let mut grad = vec![0.0f64; dims];

        for epoch in 1..=hp.epochs {
            grad.iter_mut().for_each(|g| *g = 0.0);
            let mut grad_bias = 0.0;

            for s in samples {
                let z: f64 = weights
                    .iter()
                    .zip(&s.vector)
                    .map(|(w, x)| w * *x as f64)
                    .sum::<f64>()
                    + bias;
                let err = sigmoid(z) - s.target as f64;
                for (g, x) in grad.iter_mut().zip(&s.vector) {
                    *g += err * *x as f64;
                }
                grad_bias += err;
            }

            for (w, g) in weights.iter_mut().zip(&grad) {
                *w -= hp.learning_rate * (g / n + hp.l2 * *w);
            }
            bias -= hp.learning_rate * grad_bias / n;

            if !progress(epoch, epoch as i64 * samples.len() as i64) {
                return Ok(Fit::Cancelled);
            }
        }

        if weights.iter().any(|w| !w.is_finite()) || !bias.is_finite() {
            return Err(AffinityError::TrainingFailed(
                "weights diverged; lower the learning rate".into(),
            ));
        }

        Ok(Fit::Done(Box::new(LogisticHead {
            weights: weights.into_iter().map(|w| w as f32).collect(),
            bias: bias as f32,
        })))
    }
}

/// Share of samples whose thresholded prediction matches the label.
pub fn accuracy(head: &dyn ScoringHead, samples: &[Sample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let correct = samples
        .iter()
        .filter(|s| (head.predict(&s.vector) >= 0.5) == (s.target >= 0.5))
        .count();
    correct as f64 / samples.len() as f64
}
