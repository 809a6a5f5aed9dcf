use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::engine::ScoredBatch;
use crate::error::PublishError;
use crate::types::{AggregateByKey, ScoredTransaction};

pub const SAFE_COLOR: &str = "rgb(0, 204, 0)";
pub const ALERT_COLOR: &str = "rgb(255, 0, 0)";
const ALERT_PROBABILITY: f64 = 0.01;
const HASH_DIGITS: usize = 9;

// ── Payloads ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapEvent {
    pub id: String,
    pub entity: String,
    pub lat: f64,
    pub lon: f64,
    pub label: u8,
    pub probability: f64,
    pub text: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub batch: u64,
    pub window_start: DateTime<Utc>,
    pub totals: AggregateByKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkMessage {
    Map(MapEvent),
    Aggregate(AggregateSnapshot),
}

// ── Coloring ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ColorStrategy {
    /// Safe color below probability 0.01, alert color otherwise.
    #[default]
    ThresholdRamp,
    /// Stable color derived from the entity id.
    Entity,
}

impl ColorStrategy {
    pub fn color_for(&self, row: &ScoredTransaction) -> String {
        match self {
            ColorStrategy::ThresholdRamp => threshold_color(row.probability).to_string(),
            ColorStrategy::Entity => {
                let (r, g, b) = entity_rgb(&row.transaction.entity);
                format!("rgb({r}, {g}, {b})")
            }
        }
    }
}

pub fn threshold_color(probability: f64) -> &'static str {
    if probability < ALERT_PROBABILITY {
        SAFE_COLOR
    } else {
        ALERT_COLOR
    }
}

/// FNV-1a, so colors stay the same across processes and toolchains.
fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// Hash the entity id to a digit string, take the last nine digits in three
/// groups of three and reduce each modulo 255. Short digit strings are
/// left-padded with zeros.
pub fn entity_rgb(entity: &str) -> (u8, u8, u8) {
    digits_rgb(&fnv1a(entity).to_string())
}

fn digits_rgb(digits: &str) -> (u8, u8, u8) {
    let digits = format!("{:0>width$}", digits, width = HASH_DIGITS);
    let tail = &digits[digits.len() - HASH_DIGITS..];
    let part = |range: std::ops::Range<usize>| -> u8 {
        // three ascii digits always parse
        (tail[range].parse::<u32>().unwrap_or(0) % 255) as u8
    };
    (part(0..3), part(3..6), part(6..9))
}

pub fn describe(row: &ScoredTransaction) -> String {
    format!(
        "{} {}\n\t{}\n\tAmount: {}\n\tType: {}",
        row.transaction.id, row.label, row.probability, row.transaction.amount, row.transaction.kind
    )
}

pub fn map_event(row: &ScoredTransaction, strategy: ColorStrategy) -> MapEvent {
    MapEvent {
        id: row.transaction.id.clone(),
        entity: row.transaction.entity.clone(),
        lat: row.transaction.latitude,
        lon: row.transaction.longitude,
        label: row.label,
        probability: row.probability,
        text: describe(row),
        color: strategy.color_for(row),
    }
}

// ── Channels ──

/// An append-only output channel. Writes are synchronous and best-effort.
pub trait SinkChannel: Send + Sync {
    fn name(&self) -> &str;

    fn write(&self, message: &SinkMessage) -> Result<(), PublishError>;

    fn close(&self) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Fans JSON payloads out to live dashboard subscribers.
pub struct BroadcastChannel {
    name: String,
    tx: broadcast::Sender<String>,
}

impl BroadcastChannel {
    pub fn new(name: &str, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { name: name.to_string(), tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<String> {
        self.tx.clone()
    }
}

impl SinkChannel for BroadcastChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&self, message: &SinkMessage) -> Result<(), PublishError> {
        let json = serde_json::to_string(message)?;
        if self.tx.send(json).is_err() {
            debug!(channel = %self.name, "No subscribers, payload dropped");
        }
        Ok(())
    }
}

/// Appends one JSON document per line to a file.
pub struct JsonLinesChannel {
    name: String,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl JsonLinesChannel {
    pub fn open<P: AsRef<Path>>(name: &str, path: P) -> Result<Self, PublishError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { name: name.to_string(), writer: Mutex::new(Some(BufWriter::new(file))) })
    }
}

impl SinkChannel for JsonLinesChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&self, message: &SinkMessage) -> Result<(), PublishError> {
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let writer = guard.as_mut().ok_or(PublishError::Closed("json-lines"))?;
        serde_json::to_writer(&mut *writer, message)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn close(&self) -> Result<(), PublishError> {
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut writer) = guard.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Keeps every payload in memory. Can be told to fail to simulate an
/// unreachable sink.
#[derive(Default)]
pub struct MemoryChannel {
    name: String,
    messages: Mutex<Vec<SinkMessage>>,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl MemoryChannel {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<SinkMessage> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn map_events(&self) -> Vec<MapEvent> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                SinkMessage::Map(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    pub fn snapshots(&self) -> Vec<AggregateSnapshot> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                SinkMessage::Aggregate(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl SinkChannel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&self, message: &SinkMessage) -> Result<(), PublishError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PublishError::Closed("memory"));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "sink unreachable",
            )));
        }
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).push(message.clone());
        Ok(())
    }

    fn close(&self) -> Result<(), PublishError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ── Publisher ──

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub map_writes: usize,
    pub aggregate_writes: usize,
    pub failures: usize,
}

/// Fans a scored batch out to the map and aggregate channels. Failures are
/// logged and counted; nothing is retried.
pub struct Publisher {
    map: Arc<dyn SinkChannel>,
    aggregate: Arc<dyn SinkChannel>,
    color: ColorStrategy,
}

impl Publisher {
    pub fn new(map: Arc<dyn SinkChannel>, aggregate: Arc<dyn SinkChannel>, color: ColorStrategy) -> Self {
        Self { map, aggregate, color }
    }

    pub fn publish(&self, batch: &ScoredBatch) -> PublishOutcome {
        let mut outcome = PublishOutcome::default();

        for row in &batch.rows {
            let event = SinkMessage::Map(map_event(row, self.color));
            match self.map.write(&event) {
                Ok(()) => outcome.map_writes += 1,
                Err(e) => {
                    outcome.failures += 1;
                    warn!(channel = %self.map.name(), batch = batch.seq, id = %row.transaction.id, error = %e, "Map publish failed");
                }
            }
        }

        if !batch.aggregate.is_empty() {
            let snapshot = SinkMessage::Aggregate(AggregateSnapshot {
                batch: batch.seq,
                window_start: batch.window_start,
                totals: batch.aggregate.clone(),
            });
            match self.aggregate.write(&snapshot) {
                Ok(()) => outcome.aggregate_writes += 1,
                Err(e) => {
                    outcome.failures += 1;
                    warn!(channel = %self.aggregate.name(), batch = batch.seq, error = %e, "Aggregate publish failed");
                }
            }
        }

        outcome
    }

    pub fn close(&self) {
        for channel in [&self.map, &self.aggregate] {
            if let Err(e) = channel.close() {
                warn!(channel = %channel.name(), error = %e, "Sink close failed");
            }
        }
    }
}
