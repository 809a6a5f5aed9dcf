use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::ParseError;

// ── Wire schema ──

/// Number of comma-separated fields in a wire record.
pub const ARITY: usize = 16;

pub const COLUMNS: [&str; ARITY] = [
    "step",
    "type",
    "amount",
    "nameOrig",
    "oldbalanceOrg",
    "newbalanceOrig",
    "nameDest",
    "oldbalanceDest",
    "newbalanceDest",
    "isFraud",
    "isFlaggedFraud",
    "gps_latitude",
    "gps_longitude",
    "location",
    "id",
    "entity",
];

/// Numeric columns a model may consume, named as in the recorded data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FeatureColumn {
    Step,
    Amount,
    OldBalanceOrig,
    NewBalanceOrig,
    OldBalanceDest,
    NewBalanceDest,
    Latitude,
    Longitude,
}

pub const DEFAULT_FEATURES: [FeatureColumn; 8] = [
    FeatureColumn::Step,
    FeatureColumn::Amount,
    FeatureColumn::OldBalanceOrig,
    FeatureColumn::NewBalanceOrig,
    FeatureColumn::OldBalanceDest,
    FeatureColumn::NewBalanceDest,
    FeatureColumn::Latitude,
    FeatureColumn::Longitude,
];

impl FeatureColumn {
    pub fn name(&self) -> &'static str {
        match self {
            FeatureColumn::Step => "step",
            FeatureColumn::Amount => "amount",
            FeatureColumn::OldBalanceOrig => "oldbalanceOrg",
            FeatureColumn::NewBalanceOrig => "newbalanceOrig",
            FeatureColumn::OldBalanceDest => "oldbalanceDest",
            FeatureColumn::NewBalanceDest => "newbalanceDest",
            FeatureColumn::Latitude => "gps_latitude",
            FeatureColumn::Longitude => "gps_longitude",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        DEFAULT_FEATURES.iter().copied().find(|c| c.name() == name)
    }
}

// ── Records ──

/// A validated wire record. Numeric columns are coerced once at parse time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub step: f64,
    #[serde(rename = "type")]
    pub kind: String,
    pub amount: f64,
    pub name_orig: String,
    pub old_balance_orig: f64,
    pub new_balance_orig: f64,
    pub name_dest: String,
    pub old_balance_dest: f64,
    pub new_balance_dest: f64,
    pub is_fraud: i64,
    pub is_flagged_fraud: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub location: String,
    pub id: String,
    pub entity: String,
}

/// Finite numbers only: `NaN` and `inf` would not survive a re-parse intact.
fn number(fields: &[&str], idx: usize) -> Result<f64, ParseError> {
    let raw = fields[idx].trim();
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ParseError::InvalidNumber { column: COLUMNS[idx], value: raw.to_string() }),
    }
}

fn flag(fields: &[&str], idx: usize) -> Result<i64, ParseError> {
    Ok(number(fields, idx)?.round() as i64)
}

impl Transaction {
    /// Parse one wire line. A trailing `\r` is tolerated.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != ARITY {
            return Err(ParseError::Arity { expected: ARITY, found: fields.len() });
        }

        Ok(Self {
            step: number(&fields, 0)?,
            kind: fields[1].to_string(),
            amount: number(&fields, 2)?,
            name_orig: fields[3].to_string(),
            old_balance_orig: number(&fields, 4)?,
            new_balance_orig: number(&fields, 5)?,
            name_dest: fields[6].to_string(),
            old_balance_dest: number(&fields, 7)?,
            new_balance_dest: number(&fields, 8)?,
            is_fraud: flag(&fields, 9)?,
            is_flagged_fraud: flag(&fields, 10)?,
            latitude: number(&fields, 11)?,
            longitude: number(&fields, 12)?,
            location: fields[13].to_string(),
            id: fields[14].to_string(),
            entity: fields[15].to_string(),
        })
    }

    /// Render back to the wire format, without the trailing newline.
    pub fn to_line(&self) -> String {
        self.to_string()
    }

    pub fn value(&self, column: FeatureColumn) -> f64 {
        match column {
            FeatureColumn::Step => self.step,
            FeatureColumn::Amount => self.amount,
            FeatureColumn::OldBalanceOrig => self.old_balance_orig,
            FeatureColumn::NewBalanceOrig => self.new_balance_orig,
            FeatureColumn::OldBalanceDest => self.old_balance_dest,
            FeatureColumn::NewBalanceDest => self.new_balance_dest,
            FeatureColumn::Latitude => self.latitude,
            FeatureColumn::Longitude => self.longitude,
        }
    }

    pub fn features(&self, columns: &[FeatureColumn]) -> FeatureVector {
        FeatureVector(columns.iter().map(|c| self.value(*c)).collect())
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            self.step,
            self.kind,
            self.amount,
            self.name_orig,
            self.old_balance_orig,
            self.new_balance_orig,
            self.name_dest,
            self.old_balance_dest,
            self.new_balance_dest,
            self.is_fraud,
            self.is_flagged_fraud,
            self.latitude,
            self.longitude,
            self.location,
            self.id,
            self.entity,
        )
    }
}

impl FromStr for Transaction {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Transaction::parse(s)
    }
}

/// Ordered numeric projection handed to the classifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector(pub Vec<f64>);

impl FeatureVector {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredTransaction {
    #[serde(flatten)]
    pub transaction: Transaction,
    pub label: u8,
    pub probability: f64,
}

/// Grouping key -> summed amount for one window.
pub type AggregateByKey = BTreeMap<String, f64>;

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = "1,PAYMENT,100.5,A,500,399.5,B,0,100,0,0,51.5,-0.12,loc1,tx1,ent1";

    #[test]
    fn parses_reference_line() {
        let tx = Transaction::parse(LINE).unwrap();
        assert_eq!(tx.kind, "PAYMENT");
        assert_eq!(tx.location, "loc1");
        assert_eq!(tx.id, "tx1");
        assert_eq!(tx.entity, "ent1");
        assert_eq!(
            tx.features(&DEFAULT_FEATURES).0,
            vec![1.0, 100.5, 500.0, 399.5, 0.0, 100.0, 51.5, -0.12]
        );
    }

    #[test]
    fn serialize_then_reparse_is_identity() {
        let tx = Transaction::parse(LINE).unwrap();
        assert_eq!(tx.to_line(), LINE);
        assert_eq!(Transaction::parse(&tx.to_line()).unwrap(), tx);

        let messy = "2.0,TRANSFER, 7.25 ,C1,10,2.75,M9,0.0,7.25,0.6,0,40.4,-3.7,Madrid,tx9,3\r";
        let first = Transaction::parse(messy).unwrap();
        let again = Transaction::parse(&first.to_line()).unwrap();
        assert_eq!(first, again);
        assert_eq!(first.to_line(), again.to_line());
        assert_eq!(first.is_fraud, 1);
    }

    #[test]
    fn rejects_wrong_arity() {
        let err = Transaction::parse("1,PAYMENT,100.5").unwrap_err();
        assert_eq!(err, ParseError::Arity { expected: 16, found: 3 });
        assert!(Transaction::parse(&format!("{LINE},extra")).is_err());
    }

    #[test]
    fn rejects_non_numeric_amount() {
        let line = LINE.replace("100.5", "lots");
        match Transaction::parse(&line) {
            Err(ParseError::InvalidNumber { column, .. }) => assert_eq!(column, "amount"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_non_finite_numbers() {
        for (from, to, column) in [("100.5", "NaN", "amount"), ("51.5", "inf", "gps_latitude"), ("-0.12", "-infinity", "gps_longitude")] {
            match Transaction::parse(&LINE.replace(from, to)) {
                Err(ParseError::InvalidNumber { column: c, value }) => {
                    assert_eq!(c, column);
                    assert_eq!(value, to);
                }
                other => panic!("{to} in {column}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn feature_names_resolve() {
        for c in DEFAULT_FEATURES {
            assert_eq!(FeatureColumn::from_name(c.name()), Some(c));
        }
        assert_eq!(FeatureColumn::from_name("location"), None);
    }
}
