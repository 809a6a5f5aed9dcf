//! Synthetic per-entity transaction series, laid out like the recorded data:
//! an index column first, the wire columns, then a trailing `elapsed` column.

use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::info;

use crate::error::ReplayError;
use crate::types::{Transaction, COLUMNS};

pub const CITIES: &[(&str, f64, f64)] = &[
    ("London", 51.5073509, -0.1277583),
    ("Manchester", 53.4807593, -2.2426305),
    ("Birmingham", 52.4862347, -1.8904133),
    ("Leeds", 53.8007554, -1.5490774),
    ("Bristol", 51.4545168, -2.5879100),
];

const NORMAL_KINDS: &[&str] = &["PAYMENT", "DEBIT", "CASH_IN", "PAYMENT", "CASH_OUT"];
const FRAUD_KINDS: &[&str] = &["TRANSFER", "CASH_OUT"];

pub struct SeriesGenerator {
    entity: u32,
    city: usize,
    lat: f64,
    lon: f64,
    balance: f64,
    step: u64,
    elapsed: f64,
    tx_seq: u64,
    pub fraud_rate: f64,
}

impl SeriesGenerator {
    pub fn new(entity: u32, fraud_rate: f64) -> Self {
        let city = (entity as usize).saturating_sub(1) % CITIES.len();
        let (_, lat, lon) = CITIES[city];
        let mut rng = rand::thread_rng();
        Self {
            entity,
            city,
            lat,
            lon,
            balance: rng.gen_range(1_000.0..50_000.0),
            step: 1,
            elapsed: 0.0,
            tx_seq: 0,
            fraud_rate: if fraud_rate.is_nan() { 0.0 } else { fraud_rate.clamp(0.0, 1.0) },
        }
    }

    /// Next transaction plus seconds elapsed since the first one.
    pub fn next_row(&mut self) -> (Transaction, f64) {
        let mut rng = rand::thread_rng();
        let fraud = rng.gen_bool(self.fraud_rate);

        // Small random walk; fraud jumps well away from the usual city.
        if fraud {
            self.lat += rng.gen_range(-1.5..1.5);
            self.lon += rng.gen_range(-1.5..1.5);
        } else {
            self.lat += rng.gen_range(-0.002..0.002);
            self.lon += rng.gen_range(-0.002..0.002);
        }

        let (kind, amount) = if fraud {
            let kind = FRAUD_KINDS[rng.gen_range(0..FRAUD_KINDS.len())];
            (kind, (self.balance * rng.gen_range(0.8..1.0)).max(1.0))
        } else {
            let kind = NORMAL_KINDS[rng.gen_range(0..NORMAL_KINDS.len())];
            (kind, rng.gen_range(1.0..500.0_f64).min(self.balance.max(1.0)))
        };
        let amount = (amount * 100.0).round() / 100.0;

        let old_balance = self.balance;
        let new_balance = if kind == "CASH_IN" { old_balance + amount } else { (old_balance - amount).max(0.0) };
        self.balance = new_balance;

        let dest_old = (rng.gen_range(0.0..10_000.0_f64) * 100.0).round() / 100.0;
        self.tx_seq += 1;
        self.elapsed += rng.gen_range(0.5..30.0);
        if self.tx_seq % 10 == 0 {
            self.step += 1;
        }

        let tx = Transaction {
            step: self.step as f64,
            kind: kind.to_string(),
            amount,
            name_orig: format!("C{:09}", self.entity),
            old_balance_orig: old_balance,
            new_balance_orig: new_balance,
            name_dest: format!("M{:09}", rng.gen_range(0..1_000_000_000u32)),
            old_balance_dest: dest_old,
            new_balance_dest: dest_old + amount,
            is_fraud: fraud as i64,
            is_flagged_fraud: (fraud && amount > 200_000.0) as i64,
            latitude: self.lat,
            longitude: self.lon,
            location: CITIES[self.city].0.to_string(),
            id: format!("e{}-{:06}", self.entity, self.tx_seq),
            entity: self.entity.to_string(),
        };
        (tx, self.elapsed)
    }
}

/// Write `rows` rows for each entity `1..=entities` as `transactions_{n}.csv`
/// under `dir`. Returns the paths in entity order.
pub fn write_series(dir: &Path, entities: u32, rows: usize, fraud_rate: f64) -> Result<Vec<PathBuf>, ReplayError> {
    fs::create_dir_all(dir)?;
    let mut paths = Vec::with_capacity(entities as usize);

    for entity in 1..=entities {
        let path = dir.join(format!("transactions_{entity}.csv"));
        let mut writer = csv::Writer::from_path(&path)?;

        let mut header = vec![""];
        header.extend(COLUMNS);
        header.push("elapsed");
        writer.write_record(&header)?;

        let mut generator = SeriesGenerator::new(entity, fraud_rate);
        for index in 0..rows {
            let (tx, elapsed) = generator.next_row();
            let mut record = vec![index.to_string()];
            record.extend(tx.to_line().split(',').map(str::to_string));
            record.push(format!("{elapsed:.3}"));
            writer.write_record(&record)?;
        }
        writer.flush()?;

        info!(entity, rows, path = %path.display(), "Series written");
        paths.push(path);
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::load_series;
    use crate::types::ARITY;

    #[test]
    fn rows_parse_back_as_transactions() {
        let mut generator = SeriesGenerator::new(2, 0.5);
        let mut last_elapsed = 0.0;
        for _ in 0..200 {
            let (tx, elapsed) = generator.next_row();
            assert!(elapsed > last_elapsed);
            last_elapsed = elapsed;
            assert!(tx.amount >= 0.0);
            assert_eq!(tx.location, "Manchester");
            assert_eq!(tx.entity, "2");
            let parsed = Transaction::parse(&tx.to_line()).unwrap();
            assert_eq!(parsed.id, tx.id);
            assert_eq!(parsed.is_fraud, tx.is_fraud);
        }
    }

    #[test]
    fn fraud_rate_extremes() {
        let mut clean = SeriesGenerator::new(1, 0.0);
        assert!((0..100).all(|_| clean.next_row().0.is_fraud == 0));
        let mut dirty = SeriesGenerator::new(1, 1.0);
        assert!((0..100).all(|_| dirty.next_row().0.is_fraud == 1));
    }

    #[test]
    fn written_series_replay_as_wire_lines() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_series(dir.path(), 3, 25, 0.1).unwrap();
        assert_eq!(paths.len(), 3);
        assert!(paths[2].ends_with("transactions_3.csv"));

        let mut series = load_series(dir.path(), &[1, 3]).unwrap();
        assert_eq!(series[0].len(), 25);
        for s in &mut series {
            let line = s.next_line().unwrap().unwrap();
            assert_eq!(line.split(',').count(), ARITY);
            let tx = Transaction::parse(&line).unwrap();
            assert_eq!(tx.entity, s.entity.to_string());
        }
    }
}
