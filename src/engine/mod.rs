//! Micro-batch stream engine.
//!
//! Four tasks cooperate:
//!
//! - the gateway reader pushes lines into a bounded queue (optional, tests
//!   feed the queue directly);
//! - the collector drains that queue into the open [`Window`];
//! - the timer rotates the window every interval and queues the closed
//!   [`Batch`] (at most one pending);
//! - the processor scores and publishes batches one at a time, in order.

mod batch;
mod ingest;
mod window;

pub use batch::{aggregate_amount_by_location, score_lines, ScoredBatch};
pub use window::{Batch, BatchState, Window, WindowBuffer};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, OverflowPolicy, ShutdownPolicy};
use crate::latency::{LatencyStats, LatencyTracker};
use crate::model::Classifier;
use crate::sink::Publisher;

// ── Counters ──

#[derive(Default)]
pub struct EngineStats {
    pub lines_received: AtomicU64,
    pub lines_dropped: AtomicU64,
    pub parse_failures: AtomicU64,
    pub scoring_failures: AtomicU64,
    pub rows_published: AtomicU64,
    pub batches_published: AtomicU64,
    pub batches_dropped: AtomicU64,
    pub publish_failures: AtomicU64,
    latency: Mutex<LatencyTracker>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub lines_received: u64,
    pub lines_dropped: u64,
    pub parse_failures: u64,
    pub scoring_failures: u64,
    pub rows_published: u64,
    pub batches_published: u64,
    pub batches_dropped: u64,
    pub publish_failures: u64,
    pub scoring_latency: LatencyStats,
    pub publish_latency: LatencyStats,
}

impl EngineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let latency = self.latency.lock().unwrap_or_else(|e| e.into_inner());
        StatsSnapshot {
            lines_received: self.lines_received.load(Ordering::Relaxed),
            lines_dropped: self.lines_dropped.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            scoring_failures: self.scoring_failures.load(Ordering::Relaxed),
            rows_published: self.rows_published.load(Ordering::Relaxed),
            batches_published: self.batches_published.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            scoring_latency: latency.scoring_stats(),
            publish_latency: latency.publish_stats(),
        }
    }

    fn drop_batch(&self, batch: &mut Batch) {
        if let Err(e) = batch.advance(BatchState::Discarded) {
            error!(error = %e, "Batch state violation");
        }
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
        self.lines_dropped.fetch_add(batch.len() as u64, Ordering::Relaxed);
    }
}

/// Per-batch outcome, emitted after the batch reaches its final state.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub seq: u64,
    pub window_start: chrono::DateTime<Utc>,
    pub state: BatchState,
    pub lines_received: usize,
    pub parse_failures: usize,
    pub scoring_failures: usize,
    pub rows_published: usize,
    pub map_writes: usize,
    pub aggregate_writes: usize,
    pub publish_failures: usize,
    pub elapsed_us: u64,
}

// ── Engine ──

pub struct Engine {
    config: EngineConfig,
    model: Arc<dyn Classifier>,
    publisher: Arc<Publisher>,
    stats: Arc<EngineStats>,
    reports: Option<mpsc::Sender<BatchReport>>,
}

pub struct EngineHandle {
    shutdown: watch::Sender<bool>,
    stats: Arc<EngineStats>,
    reader: Option<JoinHandle<()>>,
    timer: JoinHandle<()>,
    processor: JoinHandle<()>,
}

impl Engine {
    pub fn new(config: EngineConfig, model: Arc<dyn Classifier>, publisher: Arc<Publisher>) -> Self {
        Self { config, model, publisher, stats: Arc::new(EngineStats::default()), reports: None }
    }

    /// Emit a [`BatchReport`] per batch. Reports are dropped when `tx` is full.
    pub fn with_reports(mut self, tx: mpsc::Sender<BatchReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    /// Run with lines arriving on `lines`.
    pub fn spawn(self, lines: mpsc::Receiver<String>) -> EngineHandle {
        self.spawn_inner(lines, None)
    }

    /// Connect to the gateway at `addr` and run on what it sends.
    pub fn spawn_from_gateway(self, addr: SocketAddr) -> EngineHandle {
        let (tx, rx) = mpsc::channel(self.config.line_capacity.max(1));
        self.spawn_inner(rx, Some((addr, tx)))
    }

    fn spawn_inner(self, lines: mpsc::Receiver<String>, gateway: Option<(SocketAddr, mpsc::Sender<String>)>) -> EngineHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let buffer = Arc::new(WindowBuffer::new(Utc::now()));
        let (batch_tx, batch_rx) = mpsc::channel::<Batch>(1);

        info!(
            window_ms = self.config.window_ms,
            overflow = ?self.config.overflow,
            on_shutdown = ?self.config.on_shutdown,
            model = self.model.name(),
            "Engine starting"
        );

        let reader = gateway.map(|(addr, tx)| {
            tokio::spawn(ingest::read_gateway(
                addr,
                tx,
                self.config.read_timeout(),
                self.config.reconnect_delay(),
                shutdown_rx.clone(),
            ))
        });

        let collector = tokio::spawn(collect(lines, Arc::clone(&buffer), Arc::clone(&self.stats), shutdown_rx.clone()));

        let timer = tokio::spawn(close_windows(
            buffer,
            batch_tx,
            collector,
            self.config.clone(),
            Arc::clone(&self.stats),
            shutdown_rx,
        ));

        let processor = tokio::spawn(process(
            batch_rx,
            self.model,
            self.publisher,
            Arc::clone(&self.stats),
            self.config.batch_timeout(),
            self.reports,
        ));

        EngineHandle { shutdown, stats: self.stats, reader, timer, processor }
    }
}

impl EngineHandle {
    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    /// Stop reading, settle the open window per the shutdown policy, finish
    /// every queued batch and release the sinks.
    pub async fn stop(self) -> StatsSnapshot {
        let _ = self.shutdown.send(true);
        if let Some(reader) = self.reader {
            if let Err(e) = reader.await {
                error!(error = %e, "Gateway reader task failed");
            }
        }
        if let Err(e) = self.timer.await {
            error!(error = %e, "Window timer task failed");
        }
        if let Err(e) = self.processor.await {
            error!(error = %e, "Batch processor task failed");
        }
        let snapshot = self.stats.snapshot();
        info!(
            lines = snapshot.lines_received,
            rows = snapshot.rows_published,
            batches = snapshot.batches_published,
            dropped = snapshot.batches_dropped,
            "Engine stopped"
        );
        snapshot
    }
}

// ── Tasks ──

async fn collect(
    mut lines: mpsc::Receiver<String>,
    buffer: Arc<WindowBuffer>,
    stats: Arc<EngineStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) => {
                    stats.lines_received.fetch_add(1, Ordering::Relaxed);
                    buffer.push(line);
                }
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }

    // Stop accepting, then keep what was already queued.
    lines.close();
    while let Some(line) = lines.recv().await {
        stats.lines_received.fetch_add(1, Ordering::Relaxed);
        buffer.push(line);
    }
}

async fn close_windows(
    buffer: Arc<WindowBuffer>,
    batches: mpsc::Sender<Batch>,
    collector: JoinHandle<()>,
    config: EngineConfig,
    stats: Arc<EngineStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let window = config.window();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + window, window);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => close_and_enqueue(&buffer, &batches, config.overflow, &stats).await,
            _ = shutdown.changed() => break,
        }
    }

    if let Err(e) = collector.await {
        error!(error = %e, "Line collector task failed");
    }

    let mut last = Batch::close(buffer.rotate(Utc::now()));
    match config.on_shutdown {
        ShutdownPolicy::Drain => {
            debug!(batch = last.seq(), lines = last.len(), "Draining open window");
            if let Err(mpsc::error::SendError(mut batch)) = batches.send(last).await {
                stats.drop_batch(&mut batch);
            }
        }
        ShutdownPolicy::Drop => {
            if !last.is_empty() {
                warn!(batch = last.seq(), lines = last.len(), "Dropping open window on shutdown");
            }
            stats.drop_batch(&mut last);
        }
    }
}

/// Close the open window and queue it. Under backpressure the queue slot is
/// taken first, so the open window keeps collecting while a batch is pending.
async fn close_and_enqueue(buffer: &WindowBuffer, batches: &mpsc::Sender<Batch>, policy: OverflowPolicy, stats: &EngineStats) {
    match policy {
        OverflowPolicy::Backpressure => {
            let permit = batches.reserve().await;
            let mut batch = Batch::close(buffer.rotate(Utc::now()));
            debug!(batch = batch.seq(), lines = batch.len(), "Window closed");
            match permit {
                Ok(permit) => permit.send(batch),
                Err(_) => stats.drop_batch(&mut batch),
            }
        }
        OverflowPolicy::DropNewest => {
            let batch = Batch::close(buffer.rotate(Utc::now()));
            debug!(batch = batch.seq(), lines = batch.len(), "Window closed");
            match batches.try_send(batch) {
                Ok(()) => {}
                Err(TrySendError::Full(mut batch)) => {
                    warn!(batch = batch.seq(), lines = batch.len(), "Engine behind, dropping closed window");
                    stats.drop_batch(&mut batch);
                }
                Err(TrySendError::Closed(mut batch)) => stats.drop_batch(&mut batch),
            }
        }
    }
}

async fn process(
    mut batches: mpsc::Receiver<Batch>,
    model: Arc<dyn Classifier>,
    publisher: Arc<Publisher>,
    stats: Arc<EngineStats>,
    limit: Duration,
    reports: Option<mpsc::Sender<BatchReport>>,
) {
    while let Some(mut batch) = batches.recv().await {
        let started = Instant::now();
        if let Err(e) = batch.advance(BatchState::Processing) {
            error!(error = %e, "Batch state violation");
            continue;
        }

        let seq = batch.seq();
        let window_start = batch.window_start();
        let lines = batch.take_lines();
        let received = lines.len();

        let scored = if lines.is_empty() {
            Ok(ScoredBatch::empty(seq, window_start))
        } else {
            let model = Arc::clone(&model);
            let mut job = tokio::task::spawn_blocking(move || score_lines(seq, window_start, &lines, model.as_ref()));
            match tokio::time::timeout(limit, &mut job).await {
                Ok(Ok(scored)) => Ok(scored),
                Ok(Err(e)) => Err(format!("scoring task failed: {e}")),
                Err(_) => {
                    // The model call cannot be cancelled. Wait it out and discard
                    // its output so the next batch never scores alongside it.
                    if let Err(e) = job.await {
                        error!(batch = seq, error = %e, "Scoring task failed after timeout");
                    }
                    Err(format!("scoring exceeded {limit:?}"))
                }
            }
        };

        let mut report = BatchReport {
            seq,
            window_start,
            state: BatchState::Discarded,
            lines_received: received,
            parse_failures: 0,
            scoring_failures: 0,
            rows_published: 0,
            map_writes: 0,
            aggregate_writes: 0,
            publish_failures: 0,
            elapsed_us: 0,
        };

        match scored {
            Ok(scored) => {
                let scoring_elapsed = started.elapsed();
                let outcome = publisher.publish(&scored);
                if let Err(e) = batch.advance(BatchState::Published) {
                    error!(error = %e, "Batch state violation");
                }

                stats.parse_failures.fetch_add(scored.parse_failures as u64, Ordering::Relaxed);
                stats.scoring_failures.fetch_add(scored.scoring_failures as u64, Ordering::Relaxed);
                stats.rows_published.fetch_add(scored.rows.len() as u64, Ordering::Relaxed);
                stats.publish_failures.fetch_add(outcome.failures as u64, Ordering::Relaxed);
                stats.batches_published.fetch_add(1, Ordering::Relaxed);
                {
                    let mut latency = stats.latency.lock().unwrap_or_else(|e| e.into_inner());
                    latency.record_scoring(scoring_elapsed);
                    latency.record_publish(batch.closed_at().elapsed());
                }

                debug!(
                    batch = seq,
                    lines = received,
                    rows = scored.rows.len(),
                    parse_failures = scored.parse_failures,
                    scoring_failures = scored.scoring_failures,
                    "Batch published"
                );

                report.state = BatchState::Published;
                report.parse_failures = scored.parse_failures;
                report.scoring_failures = scored.scoring_failures;
                report.rows_published = scored.rows.len();
                report.map_writes = outcome.map_writes;
                report.aggregate_writes = outcome.aggregate_writes;
                report.publish_failures = outcome.failures;

                if let Err(e) = batch.advance(BatchState::Discarded) {
                    error!(error = %e, "Batch state violation");
                }
            }
            Err(reason) => {
                warn!(batch = seq, lines = received, %reason, "Batch discarded before publish");
                if let Err(e) = batch.advance(BatchState::Discarded) {
                    error!(error = %e, "Batch state violation");
                }
                stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
                stats.lines_dropped.fetch_add(received as u64, Ordering::Relaxed);
            }
        }

        report.elapsed_us = started.elapsed().as_micros() as u64;
        if let Some(tx) = &reports {
            let _ = tx.try_send(report);
        }
    }

    publisher.close();
}
