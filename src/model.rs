//! Pretrained classifier used to score micro-batches.
//!
//! The artifact is a small JSON document holding a logistic regression:
//!
//! ```json
//! { "name": "logreg", "features": ["step", "amount"], "coefficients": [0.1, 0.002],
//!   "intercept": -4.0, "threshold": 0.5 }
//! ```

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::error::{ModelError, ScoringError};
use crate::types::{FeatureColumn, FeatureVector};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: u8,
    /// Probability of the positive (fraud) class.
    pub probability: f64,
}

/// Stateless batch scorer. Implementations must not hold mutable state so a
/// single instance can be shared across batches without locking.
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    /// Columns, in order, that every feature vector must carry.
    fn feature_columns(&self) -> &[FeatureColumn];

    /// Score a whole batch in one call. The output has one entry per input row.
    fn predict_batch(&self, batch: &[FeatureVector]) -> Vec<Result<Prediction, ScoringError>>;
}

#[derive(Debug, Deserialize)]
struct Artifact {
    #[serde(default = "default_name")]
    name: String,
    features: Vec<String>,
    coefficients: Vec<f64>,
    intercept: f64,
    #[serde(default = "default_threshold")]
    threshold: f64,
}

fn default_name() -> String {
    "logistic_regression".to_string()
}

fn default_threshold() -> f64 {
    0.5
}

#[derive(Debug, Clone)]
pub struct LogisticRegression {
    name: String,
    columns: Vec<FeatureColumn>,
    coefficients: Vec<f64>,
    intercept: f64,
    threshold: f64,
}

impl LogisticRegression {
    pub fn new(
        columns: Vec<FeatureColumn>,
        coefficients: Vec<f64>,
        intercept: f64,
        threshold: f64,
    ) -> Result<Self, ModelError> {
        if columns.len() != coefficients.len() {
            return Err(ModelError::Shape { features: columns.len(), coefficients: coefficients.len() });
        }
        Ok(Self { name: default_name(), columns, coefficients, intercept, threshold })
    }

    /// Load the artifact from disk. Called once at startup.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let model = Self::from_json(&raw)?;
        info!(
            model = %model.name,
            path = %path.display(),
            features = model.columns.len(),
            threshold = model.threshold,
            "Model loaded"
        );
        Ok(model)
    }

    pub fn from_json(raw: &str) -> Result<Self, ModelError> {
        let artifact: Artifact = serde_json::from_str(raw)?;
        let columns = artifact
            .features
            .iter()
            .map(|f| FeatureColumn::from_name(f).ok_or_else(|| ModelError::UnknownFeature(f.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        let mut model = Self::new(columns, artifact.coefficients, artifact.intercept, artifact.threshold)?;
        model.name = artifact.name;
        Ok(model)
    }

    fn score_one(&self, row: &FeatureVector) -> Result<Prediction, ScoringError> {
        if row.len() != self.coefficients.len() {
            return Err(ScoringError::FeatureLength { expected: self.coefficients.len(), found: row.len() });
        }
        if let Some(index) = row.as_slice().iter().position(|v| !v.is_finite()) {
            return Err(ScoringError::NonFinite { index });
        }

        let margin = self.intercept
            + row.as_slice().iter().zip(&self.coefficients).map(|(x, w)| x * w).sum::<f64>();
        let probability = 1.0 / (1.0 + (-margin).exp());
        let label = if probability >= self.threshold { 1 } else { 0 };
        Ok(Prediction { label, probability })
    }
}

impl Classifier for LogisticRegression {
    fn name(&self) -> &str {
        &self.name
    }

    fn feature_columns(&self) -> &[FeatureColumn] {
        &self.columns
    }

    fn predict_batch(&self, batch: &[FeatureVector]) -> Vec<Result<Prediction, ScoringError>> {
        batch.iter().map(|row| self.score_one(row)).collect()
    }
}
