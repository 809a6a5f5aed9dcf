//! Wires the replay producer, gateway, engine and sinks into one running
//! pipeline and tears it down again in order.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{PipelineConfig, SinkConfig};
use crate::engine::{BatchReport, Engine, EngineHandle, EngineStats, StatsSnapshot};
use crate::error::{PipelineError, PublishError};
use crate::gateway::Gateway;
use crate::model::Classifier;
use crate::producer::{load_series, ReplayStats, Replayer};
use crate::sink::{BroadcastChannel, JsonLinesChannel, Publisher, SinkChannel, SinkMessage};

const REPORT_CAPACITY: usize = 64;

// ── Sinks ──

pub struct SinkSet {
    pub map: Arc<dyn SinkChannel>,
    pub aggregate: Arc<dyn SinkChannel>,
}

/// Live JSON feeds for dashboard subscribers.
#[derive(Clone)]
pub struct Feeds {
    pub map: broadcast::Sender<String>,
    pub aggregate: broadcast::Sender<String>,
}

impl Feeds {
    pub fn subscribe_map(&self) -> broadcast::Receiver<String> {
        self.map.subscribe()
    }

    pub fn subscribe_aggregate(&self) -> broadcast::Receiver<String> {
        self.aggregate.subscribe()
    }
}

/// Writes every message to each inner channel. Reports the first failure
/// after trying all of them.
struct Tee {
    name: String,
    channels: Vec<Arc<dyn SinkChannel>>,
}

impl SinkChannel for Tee {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&self, message: &SinkMessage) -> Result<(), PublishError> {
        let mut first_err = None;
        for channel in &self.channels {
            if let Err(e) = channel.write(message) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn close(&self) -> Result<(), PublishError> {
        let mut first_err = None;
        for channel in &self.channels {
            if let Err(e) = channel.close() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

fn with_file(name: &str, live: Arc<dyn SinkChannel>, file: Option<&std::path::Path>) -> Result<Arc<dyn SinkChannel>, PublishError> {
    match file {
        Some(path) => {
            let file: Arc<dyn SinkChannel> = Arc::new(JsonLinesChannel::open(name, path)?);
            info!(channel = name, path = %path.display(), "Appending sink output to file");
            Ok(Arc::new(Tee { name: name.to_string(), channels: vec![live, file] }))
        }
        None => Ok(live),
    }
}

/// Broadcast-backed map and aggregate channels, each also appended to a
/// JSON-lines file when one is configured.
pub fn build_sinks(config: &SinkConfig) -> Result<(SinkSet, Feeds), PublishError> {
    let capacity = config.broadcast_capacity.max(1);
    let map = BroadcastChannel::new("map", capacity);
    let aggregate = BroadcastChannel::new("aggregate", capacity);
    let feeds = Feeds { map: map.sender(), aggregate: aggregate.sender() };

    let sinks = SinkSet {
        map: with_file("map", Arc::new(map), config.map_file.as_deref())?,
        aggregate: with_file("aggregate", Arc::new(aggregate), config.aggregate_file.as_deref())?,
    };
    Ok((sinks, feeds))
}

// ── Lifecycle ──

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub replay: ReplayStats,
    pub engine: StatsSnapshot,
}

pub struct PipelineHandle {
    gateway_addr: SocketAddr,
    producer_shutdown: watch::Sender<bool>,
    producer: JoinHandle<ReplayStats>,
    engine: EngineHandle,
    reports: Option<mpsc::Receiver<BatchReport>>,
}

/// Load the selected series, bind the gateway, start the producer and point
/// the engine at it. A gateway that cannot bind is fatal.
pub async fn start(
    config: PipelineConfig,
    model: Arc<dyn Classifier>,
    sinks: SinkSet,
) -> Result<PipelineHandle, PipelineError> {
    let series = load_series(&config.replay.data_dir, &config.replay.entities)?;
    let gateway = Gateway::bind(&config.gateway_addr).await?;
    let gateway_addr = gateway.local_addr()?;

    let (producer_shutdown, shutdown_rx) = watch::channel(false);
    let replayer = Replayer::new(series, config.replay.frequency);
    let producer = tokio::spawn(replayer.run(gateway, shutdown_rx));

    let publisher = Arc::new(Publisher::new(sinks.map, sinks.aggregate, config.sinks.color));
    let (report_tx, report_rx) = mpsc::channel(REPORT_CAPACITY);
    let engine = Engine::new(config.engine, model, publisher).with_reports(report_tx).spawn_from_gateway(gateway_addr);

    info!(%gateway_addr, entities = ?config.replay.entities, "Pipeline started");
    Ok(PipelineHandle { gateway_addr, producer_shutdown, producer, engine, reports: Some(report_rx) })
}

impl PipelineHandle {
    pub fn gateway_addr(&self) -> SocketAddr {
        self.gateway_addr
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        self.engine.stats()
    }

    /// Per-batch reports. Only the first call gets the receiver.
    pub fn take_reports(&mut self) -> Option<mpsc::Receiver<BatchReport>> {
        self.reports.take()
    }

    /// Stop the producer first, then settle and stop the engine.
    pub async fn stop(self) -> Result<PipelineReport, PipelineError> {
        let _ = self.producer_shutdown.send(true);
        let replay = match self.producer.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "Producer task failed, stopping engine");
                self.engine.stop().await;
                return Err(PipelineError::Join(e));
            }
        };
        let engine = self.engine.stop().await;
        info!(lines_written = replay.lines_written, rows = engine.rows_published, "Pipeline stopped");
        Ok(PipelineReport { replay, engine })
    }
}
