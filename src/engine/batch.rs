use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::ScoringError;
use crate::model::Classifier;
use crate::types::{AggregateByKey, FeatureVector, ScoredTransaction, Transaction};

/// Result of parsing, featurizing and scoring one window.
#[derive(Debug, Clone)]
pub struct ScoredBatch {
    pub seq: u64,
    pub window_start: DateTime<Utc>,
    pub lines_received: usize,
    pub parse_failures: usize,
    pub scoring_failures: usize,
    /// Scored rows in arrival order.
    pub rows: Vec<ScoredTransaction>,
    /// Amount summed by location over `rows`.
    pub aggregate: AggregateByKey,
}

impl ScoredBatch {
    pub fn empty(seq: u64, window_start: DateTime<Utc>) -> Self {
        Self {
            seq,
            window_start,
            lines_received: 0,
            parse_failures: 0,
            scoring_failures: 0,
            rows: Vec::new(),
            aggregate: AggregateByKey::new(),
        }
    }
}

pub fn aggregate_amount_by_location(rows: &[ScoredTransaction]) -> AggregateByKey {
    let mut totals = AggregateByKey::new();
    for row in rows {
        *totals.entry(row.transaction.location.clone()).or_insert(0.0) += row.transaction.amount;
    }
    totals
}

/// Parse every line, featurize the survivors in the model's column order and
/// score them with a single call. Bad lines and bad rows are counted, never
/// fatal.
pub fn score_lines(
    seq: u64,
    window_start: DateTime<Utc>,
    lines: &[String],
    model: &dyn Classifier,
) -> ScoredBatch {
    let mut parse_failures = 0;
    let mut parsed: Vec<Transaction> = Vec::with_capacity(lines.len());
    for line in lines {
        match Transaction::parse(line) {
            Ok(tx) => parsed.push(tx),
            Err(e) => {
                parse_failures += 1;
                debug!(batch = seq, error = %e, "Dropped malformed line");
            }
        }
    }

    let columns = model.feature_columns();
    let features: Vec<FeatureVector> = parsed.iter().map(|tx| tx.features(columns)).collect();
    let mut predictions = if features.is_empty() { Vec::new() } else { model.predict_batch(&features) };
    if predictions.len() != parsed.len() {
        warn!(
            batch = seq,
            model = model.name(),
            expected = parsed.len(),
            got = predictions.len(),
            "Model returned the wrong number of predictions"
        );
        predictions.resize_with(parsed.len(), || Err(ScoringError::Missing));
    }

    let mut scoring_failures = 0;
    let mut rows = Vec::with_capacity(parsed.len());
    for (transaction, prediction) in parsed.into_iter().zip(predictions) {
        match prediction {
            Ok(p) => rows.push(ScoredTransaction { transaction, label: p.label, probability: p.probability }),
            Err(e) => {
                scoring_failures += 1;
                debug!(batch = seq, id = %transaction.id, error = %e, "Row excluded from scoring");
            }
        }
    }

    let aggregate = aggregate_amount_by_location(&rows);
    ScoredBatch {
        seq,
        window_start,
        lines_received: lines.len(),
        parse_failures,
        scoring_failures,
        rows,
        aggregate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogisticRegression;
    use crate::types::DEFAULT_FEATURES;

    fn model() -> LogisticRegression {
        LogisticRegression::new(DEFAULT_FEATURES.to_vec(), vec![0.0; 8], 0.0, 0.5).unwrap()
    }

    #[test]
    fn aggregates_per_window_by_location() {
        let lines = vec![
            "1,PAYMENT,100.5,A,500,399.5,B,0,100,0,0,51.5,-0.12,loc1,tx1,ent1".to_string(),
            "2,PAYMENT,50.0,A,399.5,349.5,B,100,150,0,0,51.5,-0.12,loc1,tx2,ent1".to_string(),
            "2,CASH_OUT,10,C,10,0,D,0,10,1,0,53.4,-2.2,loc2,tx3,ent2".to_string(),
        ];
        let batch = score_lines(0, Utc::now(), &lines, &model());
        assert_eq!(batch.rows.len(), 3);
        assert_eq!(batch.aggregate.get("loc1"), Some(&150.5));
        assert_eq!(batch.aggregate.get("loc2"), Some(&10.0));
        let ids: Vec<_> = batch.rows.iter().map(|r| r.transaction.id.as_str()).collect();
        assert_eq!(ids, ["tx1", "tx2", "tx3"]);
    }

    #[test]
    fn counts_parse_failures() {
        let lines = vec![
            "garbage".to_string(),
            "1,PAYMENT,NaN,A,500,399.5,B,0,100,0,0,51.5,-0.12,loc1,tx1,ent1".to_string(),
            "1,PAYMENT,5,A,500,495,B,0,5,0,0,51.5,-0.12,loc1,tx2,ent1".to_string(),
        ];
        let batch = score_lines(3, Utc::now(), &lines, &model());
        assert_eq!(batch.lines_received, 3);
        assert_eq!(batch.parse_failures, 2);
        assert_eq!(batch.scoring_failures, 0);
        assert_eq!(batch.rows.len(), batch.lines_received - batch.parse_failures - batch.scoring_failures);
        assert_eq!(batch.aggregate.get("loc1"), Some(&5.0));
    }

    #[test]
    fn empty_input_scores_nothing() {
        let batch = score_lines(9, Utc::now(), &[], &model());
        assert!(batch.rows.is_empty());
        assert!(batch.aggregate.is_empty());
        assert_eq!(batch.seq, 9);
    }
}
