use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use fraud_replay_stream::config::{parse_speed, EngineConfig, OverflowPolicy, PipelineConfig, ReplayConfig, ShutdownPolicy, SinkConfig};
use fraud_replay_stream::engine::BatchState;
use fraud_replay_stream::generator;
use fraud_replay_stream::model::{Classifier, LogisticRegression};
use fraud_replay_stream::pipeline;
use fraud_replay_stream::sink::ColorStrategy;
use fraud_replay_stream::tui;
use fraud_replay_stream::web;

#[derive(Parser)]
#[command(name = "fraud-replay-stream", about = "Replay recorded transactions and score them in micro-batches")]
struct Cli {
    /// Run mode: tui, web, headless, or generate
    #[arg(long, default_value = "tui")]
    mode: String,

    /// Web server port (web mode only)
    #[arg(long, default_value = "3000")]
    port: u16,

    /// Address the replay gateway listens on
    #[arg(long, default_value = "127.0.0.1:5900")]
    gateway: String,

    /// Micro-batch window in milliseconds
    #[arg(long, default_value = "2000")]
    window_ms: u64,

    /// Replay speed, e.g. 2x or 0.5
    #[arg(long, default_value = "1x", value_parser = parse_speed)]
    speed: f64,

    /// Entity ids to replay, comma separated (1-based file position)
    #[arg(long, value_delimiter = ',', default_value = "1")]
    entities: Vec<u32>,

    /// Directory holding the per-entity series CSV files
    #[arg(long, default_value = "data/transactions")]
    data_dir: PathBuf,

    /// Model artifact
    #[arg(long, default_value = "data/models/logistic_regression.json")]
    model: PathBuf,

    /// Map marker coloring
    #[arg(long, value_enum, default_value_t = ColorStrategy::ThresholdRamp)]
    color: ColorStrategy,

    /// What to do with a closed window while another is still queued
    #[arg(long, value_enum, default_value_t = OverflowPolicy::Backpressure)]
    overflow: OverflowPolicy,

    /// What to do with the open window on shutdown
    #[arg(long, value_enum, default_value_t = ShutdownPolicy::Drain)]
    on_shutdown: ShutdownPolicy,

    /// Upper bound for scoring one batch, in milliseconds
    #[arg(long, default_value = "10000")]
    batch_timeout_ms: u64,

    /// Reconnect to the gateway after this long without data, in milliseconds
    #[arg(long, default_value = "30000")]
    read_timeout_ms: u64,

    /// Also append map events to this JSON-lines file
    #[arg(long)]
    map_out: Option<PathBuf>,

    /// Also append aggregate snapshots to this JSON-lines file
    #[arg(long)]
    aggregate_out: Option<PathBuf>,

    /// Run duration in seconds (0 = infinite)
    #[arg(long, default_value = "0")]
    duration: u64,

    /// Rows per entity (generate mode only)
    #[arg(long, default_value = "500")]
    rows: usize,

    /// Fraud injection rate 0.0-1.0 (generate mode only)
    #[arg(long, default_value = "0.05")]
    fraud_rate: f64,
}

impl Cli {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            gateway_addr: self.gateway.clone(),
            model_path: self.model.clone(),
            engine: EngineConfig {
                window_ms: self.window_ms,
                overflow: self.overflow,
                on_shutdown: self.on_shutdown,
                batch_timeout_ms: self.batch_timeout_ms,
                read_timeout_ms: self.read_timeout_ms,
                ..EngineConfig::default()
            },
            replay: ReplayConfig {
                data_dir: self.data_dir.clone(),
                entities: self.entities.clone(),
                frequency: self.speed,
            },
            sinks: SinkConfig {
                color: self.color,
                map_file: self.map_out.clone(),
                aggregate_file: self.aggregate_out.clone(),
                ..SinkConfig::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // The terminal view owns stdout; keep logs quiet there unless asked.
    let default_filter = if cli.mode == "tui" { "fraud_replay_stream=error" } else { "fraud_replay_stream=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_target(false)
        .init();

    if cli.mode == "generate" {
        let entities = cli.entities.iter().copied().max().unwrap_or(1);
        let paths = generator::write_series(&cli.data_dir, entities, cli.rows, cli.fraud_rate)?;
        println!("Wrote {} series to {}", paths.len(), cli.data_dir.display());
        return Ok(());
    }

    let config = cli.pipeline_config();
    let model: Arc<dyn Classifier> = match LogisticRegression::load(&config.model_path) {
        Ok(model) => Arc::new(model),
        Err(e) => {
            error!(path = %config.model_path.display(), error = %e, "Model load failed");
            return Err(e.into());
        }
    };

    let result = match cli.mode.as_str() {
        "tui" => tui::run(config, model, cli.duration).await,
        "web" => web::run(cli.port, config, model, cli.duration).await,
        "headless" => run_headless(config, model, cli.duration).await,
        other => {
            eprintln!("Unknown mode: {other}. Use --mode tui|web|headless|generate");
            Ok(())
        }
    };
    if let Err(e) = &result {
        error!(error = %e, "Pipeline failed");
    }
    result
}

async fn run_headless(
    config: PipelineConfig,
    model: Arc<dyn Classifier>,
    duration_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("=== fraud-replay-stream (headless) ===");
    println!(
        "Entities: {:?}, Speed: {}x, Window: {}ms, Duration: {}s",
        config.replay.entities,
        config.replay.frequency,
        config.engine.window_ms,
        if duration_secs == 0 { "infinite".to_string() } else { duration_secs.to_string() }
    );
    println!();

    let (sinks, _feeds) = pipeline::build_sinks(&config.sinks)?;
    let mut handle = pipeline::start(config, model, sinks).await?;
    let mut reports = handle.take_reports().ok_or("batch reports already taken")?;

    let run_duration = if duration_secs == 0 { Duration::from_secs(86_400 * 365) } else { Duration::from_secs(duration_secs) };
    let start = Instant::now();
    let deadline = tokio::time::sleep(run_duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            report = reports.recv() => match report {
                Some(r) => {
                    let tag = if r.state == BatchState::Published { "BATCH" } else { " DROP" };
                    println!(
                        "  {tag} #{:<5} | lines={:<5} rows={:<5} parse_err={} score_err={} map={} agg={} publish_err={} | {}us",
                        r.seq, r.lines_received, r.rows_published, r.parse_failures, r.scoring_failures,
                        r.map_writes, r.aggregate_writes, r.publish_failures, r.elapsed_us
                    );
                }
                None => break,
            },
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let report = handle.stop().await?;
    let engine = &report.engine;
    let replay = &report.replay;

    println!();
    println!("=== Results ===");
    println!("  Run time:           {}s", start.elapsed().as_secs());
    println!("  Ticks:              {}", replay.ticks);
    println!("  Lines written:      {}", replay.lines_written);
    println!("  Replay failures:    serialize={} write={}", replay.serialize_failures, replay.write_failures);
    println!("  Lines received:     {}", engine.lines_received);
    println!("  Parse failures:     {}", engine.parse_failures);
    println!("  Scoring failures:   {}", engine.scoring_failures);
    println!("  Rows published:     {}", engine.rows_published);
    println!("  Batches:            published={} dropped={}", engine.batches_published, engine.batches_dropped);
    println!("  Publish failures:   {}", engine.publish_failures);
    println!();

    let scoring = &engine.scoring_latency;
    let publish = &engine.publish_latency;
    println!("  Latency (microseconds):");
    println!("    Scoring: p50={} p95={} p99={} min={} max={}", scoring.p50_us, scoring.p95_us, scoring.p99_us, scoring.min_us, scoring.max_us);
    println!("    Publish: p50={} p95={} p99={} min={} max={}", publish.p50_us, publish.p95_us, publish.p99_us, publish.min_us, publish.max_us);

    Ok(())
}
