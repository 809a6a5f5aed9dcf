use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::sink::ColorStrategy;

/// What to do with a closed window when one batch is already queued behind
/// the batch being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Hold the window timer until the queue has room. Nothing is lost; later
    /// windows stretch while the engine catches up.
    #[default]
    Backpressure,
    /// Discard the newly closed window and count its lines as dropped.
    DropNewest,
}

/// What to do with the open window on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ShutdownPolicy {
    /// Close the open window early and publish it.
    #[default]
    Drain,
    /// Discard whatever the open window holds.
    Drop,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub window_ms: u64,
    pub overflow: OverflowPolicy,
    pub on_shutdown: ShutdownPolicy,
    /// Upper bound for parse + featurize + score of one batch.
    pub batch_timeout_ms: u64,
    /// A gateway connection silent for this long is dropped and reopened.
    pub read_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    /// Capacity of the line queue between the socket reader and the window.
    pub line_capacity: usize,
}

impl EngineConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms.max(1))
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms.max(1))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_ms: 2_000,
            overflow: OverflowPolicy::Backpressure,
            on_shutdown: ShutdownPolicy::Drain,
            batch_timeout_ms: 10_000,
            read_timeout_ms: 30_000,
            reconnect_delay_ms: 250,
            line_capacity: 8_192,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub data_dir: PathBuf,
    pub entities: Vec<u32>,
    /// Ticks per second. Each tick writes one row per selected entity.
    pub frequency: f64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self { data_dir: PathBuf::from("data/transactions"), entities: vec![1], frequency: 1.0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub color: ColorStrategy,
    pub map_file: Option<PathBuf>,
    pub aggregate_file: Option<PathBuf>,
    pub broadcast_capacity: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self { color: ColorStrategy::ThresholdRamp, map_file: None, aggregate_file: None, broadcast_capacity: 1_024 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub gateway_addr: String,
    pub model_path: PathBuf,
    pub engine: EngineConfig,
    pub replay: ReplayConfig,
    pub sinks: SinkConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            gateway_addr: "127.0.0.1:5900".to_string(),
            model_path: PathBuf::from("data/models/logistic_regression.json"),
            engine: EngineConfig::default(),
            replay: ReplayConfig::default(),
            sinks: SinkConfig::default(),
        }
    }
}

/// Parse a replay speed such as `"2x"`, `"0.5"` or `" 1.5X "` into ticks per second.
pub fn parse_speed(raw: &str) -> Result<f64, String> {
    let trimmed = raw.trim().trim_end_matches(['x', 'X']);
    let speed: f64 = trimmed.parse().map_err(|_| format!("invalid speed {raw:?}"))?;
    if !speed.is_finite() || speed <= 0.0 {
        return Err(format!("speed must be a positive number, got {raw:?}"));
    }
    Ok(speed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_notation() {
        assert_eq!(parse_speed("2x"), Ok(2.0));
        assert_eq!(parse_speed(" 0.5 "), Ok(0.5));
        assert_eq!(parse_speed("1.5X"), Ok(1.5));
        assert!(parse_speed("0x").is_err());
        assert!(parse_speed("fast").is_err());
        assert!(parse_speed("-1").is_err());
    }

    #[test]
    fn defaults_match_replay_demo() {
        let config = PipelineConfig::default();
        assert_eq!(config.gateway_addr, "127.0.0.1:5900");
        assert_eq!(config.engine.window(), Duration::from_secs(2));
        assert_eq!(config.engine.overflow, OverflowPolicy::Backpressure);
        assert_eq!(config.engine.on_shutdown, ShutdownPolicy::Drain);
        assert_eq!(config.sinks.color, ColorStrategy::ThresholdRamp);
    }

    #[test]
    fn deserializes_partial_config() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"engine": {"window_ms": 500, "overflow": "drop-newest"}, "replay": {"entities": [2, 3]}}"#,
        )
        .unwrap();
        assert_eq!(config.engine.window_ms, 500);
        assert_eq!(config.engine.overflow, OverflowPolicy::DropNewest);
        assert_eq!(config.engine.batch_timeout_ms, 10_000);
        assert_eq!(config.replay.entities, vec![2, 3]);
        assert_eq!(config.replay.frequency, 1.0);
    }
}
