use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::engine::{EngineStats, StatsSnapshot};
use crate::model::Classifier;
use crate::pipeline::{self, Feeds};

#[derive(Serialize)]
struct StatsResponse {
    uptime_secs: u64,
    #[serde(flatten)]
    engine: StatsSnapshot,
}

struct AppState {
    feeds: Feeds,
    stats: Arc<EngineStats>,
    started: Instant,
}

pub fn router(feeds: Feeds, stats: Arc<EngineStats>) -> Router {
    let state = Arc::new(AppState { feeds, stats, started: Instant::now() });
    Router::new()
        .route("/ws/map", get(map_ws))
        .route("/ws/aggregate", get(aggregate_ws))
        .route("/stats", get(stats_handler))
        .fallback_service(ServeDir::new("static"))
        .with_state(state)
}

pub async fn run(
    port: u16,
    config: PipelineConfig,
    model: Arc<dyn Classifier>,
    duration: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let (sinks, feeds) = pipeline::build_sinks(&config.sinks)?;
    let handle = pipeline::start(config, model, sinks).await?;
    let app = router(feeds, handle.stats());

    let addr = format!("0.0.0.0:{port}");
    println!("Dashboard at http://localhost:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(duration)).await?;

    let report = handle.stop().await?;
    info!(
        lines_written = report.replay.lines_written,
        rows = report.engine.rows_published,
        batches = report.engine.batches_published,
        "Dashboard stopped"
    );
    Ok(())
}

/// Resolves on Ctrl-C, or after `duration` seconds when non-zero.
async fn shutdown_signal(duration: u64) {
    let timer = async {
        if duration == 0 {
            std::future::pending::<()>().await
        } else {
            tokio::time::sleep(Duration::from_secs(duration)).await
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = timer => info!(duration, "Run duration elapsed"),
    }
}

async fn map_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let rx = state.feeds.subscribe_map();
    ws.on_upgrade(move |socket| forward(socket, rx, "map"))
}

async fn aggregate_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let rx = state.feeds.subscribe_aggregate();
    ws.on_upgrade(move |socket| forward(socket, rx, "aggregate"))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse { uptime_secs: state.started.elapsed().as_secs(), engine: state.stats.snapshot() })
}

/// Push every feed payload to the client until either side goes away.
async fn forward(socket: WebSocket, mut rx: broadcast::Receiver<String>, feed: &'static str) {
    let (mut sender, mut receiver) = socket.split();
    debug!(feed, "Dashboard client connected");

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(feed, skipped, "Dashboard client lagging"),
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sender.close().await;
    debug!(feed, "Dashboard client disconnected");
}
