//! Replay producer: streams recorded per-entity series through the gateway.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use csv::StringRecord;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::ReplayError;
use crate::gateway::Gateway;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SerializeError {
    #[error("row has {0} columns, need at least 3")]
    TooFewColumns(usize),
    #[error("column {0} contains a delimiter or line break")]
    Delimiter(usize),
}

/// Drop the first and last raw columns and join the rest with commas.
pub fn serialize_record(record: &StringRecord) -> Result<String, SerializeError> {
    if record.len() < 3 {
        return Err(SerializeError::TooFewColumns(record.len()));
    }
    let inner: Vec<&str> = record.iter().skip(1).take(record.len() - 2).collect();
    if let Some(idx) = inner.iter().position(|f| f.contains([',', '\n', '\r'])) {
        return Err(SerializeError::Delimiter(idx + 1));
    }
    Ok(inner.join(","))
}

/// Last run of ASCII digits in the file stem, e.g. `transactions_12.csv` -> 12.
pub fn sequence_number(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let end = stem.rfind(|c: char| c.is_ascii_digit())? + 1;
    let start = stem[..end].rfind(|c: char| !c.is_ascii_digit()).map(|i| i + 1).unwrap_or(0);
    stem[start..end].parse().ok()
}

/// `*.csv` files in `dir`, ordered by embedded sequence number (files
/// without one sort last, by name).
pub fn list_series_files(dir: &Path) -> Result<Vec<PathBuf>, ReplayError> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("csv"))
        .collect();
    files.sort_by(|a, b| {
        let key = |p: &PathBuf| (sequence_number(p).unwrap_or(u64::MAX), p.file_name().map(|n| n.to_owned()));
        key(a).cmp(&key(b))
    });
    Ok(files)
}

fn read_records(path: &Path) -> Result<Vec<StringRecord>, ReplayError> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).flexible(true).from_path(path)?;
    let mut records = Vec::new();
    for (i, record) in reader.records().enumerate() {
        match record {
            Ok(r) => records.push(r),
            Err(e) => warn!(path = %path.display(), row = i, error = %e, "Skipping unreadable row"),
        }
    }
    Ok(records)
}

/// One entity's recorded rows, replayed in a loop.
#[derive(Debug, Clone)]
pub struct EntitySeries {
    pub entity: u32,
    pub source: PathBuf,
    records: Vec<StringRecord>,
    cursor: usize,
}

impl EntitySeries {
    pub fn new(entity: u32, source: PathBuf, records: Vec<StringRecord>) -> Self {
        Self { entity, source, records, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Next row in wire format. Wraps to the first row after the last.
    pub fn next_line(&mut self) -> Option<Result<String, SerializeError>> {
        if self.records.is_empty() {
            return None;
        }
        let record = &self.records[self.cursor];
        self.cursor = (self.cursor + 1) % self.records.len();
        Some(serialize_record(record))
    }
}

/// Load the series for `entities`. Entity ids are 1-based positions in the
/// sequence-ordered file list; the result follows the order of `entities`.
pub fn load_series(dir: &Path, entities: &[u32]) -> Result<Vec<EntitySeries>, ReplayError> {
    let files = list_series_files(dir)?;
    let mut series = Vec::with_capacity(entities.len());
    for &entity in entities {
        let Some(path) = (entity as usize).checked_sub(1).and_then(|i| files.get(i)) else {
            warn!(entity, dir = %dir.display(), available = files.len(), "No series for entity");
            continue;
        };
        let records = read_records(path)?;
        info!(entity, path = %path.display(), rows = records.len(), "Series loaded");
        series.push(EntitySeries::new(entity, path.clone(), records));
    }
    if series.is_empty() {
        return Err(ReplayError::NoSeries(entities.to_vec()));
    }
    Ok(series)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayStats {
    pub ticks: u64,
    pub lines_written: u64,
    pub serialize_failures: u64,
    pub write_failures: u64,
    pub connections: u64,
}

pub struct Replayer {
    series: Vec<EntitySeries>,
    period: Duration,
    stats: ReplayStats,
}

impl Replayer {
    /// `frequency` is in ticks per second; non-positive values fall back to 1.
    pub fn new(series: Vec<EntitySeries>, frequency: f64) -> Self {
        let frequency = if frequency.is_finite() && frequency > 0.0 { frequency } else { 1.0 };
        Self { series, period: Duration::from_secs_f64(1.0 / frequency), stats: ReplayStats::default() }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn stats(&self) -> &ReplayStats {
        &self.stats
    }

    /// Write one row per entity, round-robin. Failures are per entity.
    pub async fn tick(&mut self, gateway: &mut Gateway) {
        self.stats.ticks += 1;
        for series in &mut self.series {
            let line = match series.next_line() {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    self.stats.serialize_failures += 1;
                    warn!(entity = series.entity, error = %e, "Skipping row");
                    continue;
                }
                None => continue,
            };
            match gateway.write(&line).await {
                Ok(()) => self.stats.lines_written += 1,
                Err(e) => {
                    self.stats.write_failures += 1;
                    warn!(entity = series.entity, error = %e, "Write failed");
                }
            }
        }
    }

    /// Accept a connection, then tick until shutdown. A lost connection is
    /// replaced by the next one that arrives.
    pub async fn run(mut self, mut gateway: Gateway, mut shutdown: watch::Receiver<bool>) -> ReplayStats {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(entities = self.series.len(), period_ms = self.period.as_millis() as u64, "Replay starting");

        loop {
            if *shutdown.borrow() {
                break;
            }
            if !gateway.is_connected() {
                tokio::select! {
                    res = gateway.accept() => match res {
                        Ok(_) => {
                            self.stats.connections += 1;
                            ticker.reset();
                        }
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
            tokio::select! {
                _ = ticker.tick() => self.tick(&mut gateway).await,
                _ = shutdown.changed() => break,
            }
        }

        gateway.close().await;
        debug!(stats = ?self.stats, "Replay stopped");
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_from_names() {
        assert_eq!(sequence_number(Path::new("data/transactions_12.csv")), Some(12));
        assert_eq!(sequence_number(Path::new("journey3_v.csv")), Some(3));
        assert_eq!(sequence_number(Path::new("7.csv")), Some(7));
        assert_eq!(sequence_number(Path::new("journey.csv")), None);
    }

    #[test]
    fn serialization_skips_first_and_last_columns() {
        let record = StringRecord::from(vec!["0", "1", "PAYMENT", "9.5", "tail"]);
        assert_eq!(serialize_record(&record).unwrap(), "1,PAYMENT,9.5");
        assert_eq!(serialize_record(&StringRecord::from(vec!["a", "b"])), Err(SerializeError::TooFewColumns(2)));
        let bad = StringRecord::from(vec!["0", "x,y", "z", "tail"]);
        assert_eq!(serialize_record(&bad), Err(SerializeError::Delimiter(1)));
    }

    #[test]
    fn series_wraps_at_end() {
        let records = vec![
            StringRecord::from(vec!["0", "a", "end"]),
            StringRecord::from(vec!["1", "b", "end"]),
        ];
        let mut series = EntitySeries::new(1, PathBuf::from("s.csv"), records);
        let seen: Vec<String> = (0..5).map(|_| series.next_line().unwrap().unwrap()).collect();
        assert_eq!(seen, ["a", "b", "a", "b", "a"]);
        assert!(EntitySeries::new(2, PathBuf::new(), Vec::new()).next_line().is_none());
    }

    #[test]
    fn files_sorted_by_sequence_and_selected_by_position() {
        let dir = tempfile::tempdir().unwrap();
        for (name, marker) in [("t_10.csv", "ten"), ("t_2.csv", "two"), ("t_1.csv", "one")] {
            fs::write(dir.path().join(name), format!("idx,value,extra\n0,{marker},x\n")).unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let files = list_series_files(dir.path()).unwrap();
        let names: Vec<_> = files.iter().map(|p| p.file_name().unwrap().to_str().unwrap().to_string()).collect();
        assert_eq!(names, ["t_1.csv", "t_2.csv", "t_10.csv"]);

        let mut series = load_series(dir.path(), &[3, 1, 9]).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].entity, 3);
        assert_eq!(series[0].next_line().unwrap().unwrap(), "ten");
        assert_eq!(series[1].next_line().unwrap().unwrap(), "one");

        assert!(matches!(load_series(dir.path(), &[42]), Err(ReplayError::NoSeries(_))));
    }

    #[tokio::test]
    async fn bad_row_skips_only_its_entity() {
        use crate::gateway::LineStream;

        let series = |entity: u32, row: Vec<&str>| EntitySeries::new(entity, PathBuf::new(), vec![StringRecord::from(row)]);
        let mut replayer = Replayer::new(
            vec![series(1, vec!["0", "first", "end"]), series(2, vec!["0", "end"]), series(3, vec!["0", "third", "end"])],
            10.0,
        );

        let mut gateway = Gateway::bind("127.0.0.1:0").await.unwrap();
        let addr = gateway.local_addr().unwrap();
        let (stream, accepted) = tokio::join!(LineStream::connect(addr), gateway.accept());
        let mut stream = stream.unwrap();
        accepted.unwrap();

        replayer.tick(&mut gateway).await;
        let stats = replayer.stats();
        assert_eq!(stats.ticks, 1);
        assert_eq!(stats.serialize_failures, 1);
        assert_eq!(stats.lines_written, 2);
        assert_eq!(stats.write_failures, 0);

        let timeout = Duration::from_secs(2);
        assert_eq!(stream.next_line(timeout).await.unwrap().as_deref(), Some("first"));
        assert_eq!(stream.next_line(timeout).await.unwrap().as_deref(), Some("third"));
    }

    #[tokio::test]
    async fn tick_without_connection_counts_write_failures() {
        let rows = |v: &str| vec![StringRecord::from(vec!["0", v, "end"])];
        let mut replayer = Replayer::new(
            vec![EntitySeries::new(1, PathBuf::new(), rows("a")), EntitySeries::new(2, PathBuf::new(), rows("b"))],
            1.0,
        );
        let mut gateway = Gateway::bind("127.0.0.1:0").await.unwrap();
        replayer.tick(&mut gateway).await;
        assert_eq!(replayer.stats().write_failures, 2);
        assert_eq!(replayer.stats().lines_written, 0);
    }

    #[test]
    fn frequency_sets_tick_period() {
        assert_eq!(Replayer::new(Vec::new(), 2.0).period(), Duration::from_millis(500));
        assert_eq!(Replayer::new(Vec::new(), 0.0).period(), Duration::from_secs(1));
    }
}
