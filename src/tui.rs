use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table};
use ratatui::Terminal;
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::config::PipelineConfig;
use crate::engine::{EngineStats, StatsSnapshot};
use crate::model::Classifier;
use crate::pipeline;
use crate::sink::{AggregateSnapshot, MapEvent, SinkMessage};

const MAX_EVENTS: usize = 200;

struct App {
    events: VecDeque<MapEvent>,
    aggregate: Option<AggregateSnapshot>,
    stats: StatsSnapshot,
    alerts: u64,
    skipped: u64,
    uptime: Instant,
    should_quit: bool,
    scroll_offset: usize,
}

impl App {
    fn new() -> Self {
        Self {
            events: VecDeque::with_capacity(MAX_EVENTS),
            aggregate: None,
            stats: StatsSnapshot::default(),
            alerts: 0,
            skipped: 0,
            uptime: Instant::now(),
            should_quit: false,
            scroll_offset: 0,
        }
    }

    /// Apply one feed payload. Returns false if it could not be decoded.
    fn apply(&mut self, json: &str) -> bool {
        match serde_json::from_str::<SinkMessage>(json) {
            Ok(SinkMessage::Map(event)) => {
                if event.label == 1 {
                    self.alerts += 1;
                }
                if self.events.len() >= MAX_EVENTS {
                    self.events.pop_front();
                }
                self.events.push_back(event);
                true
            }
            Ok(SinkMessage::Aggregate(snapshot)) => {
                self.aggregate = Some(snapshot);
                true
            }
            Err(_) => false,
        }
    }

    fn drain(&mut self, rx: &mut broadcast::Receiver<String>) {
        loop {
            match rx.try_recv() {
                Ok(json) => {
                    if !self.apply(&json) {
                        self.skipped += 1;
                    }
                }
                Err(TryRecvError::Lagged(n)) => self.skipped += n,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }
}

pub async fn run(
    config: PipelineConfig,
    model: Arc<dyn Classifier>,
    duration: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let (sinks, feeds) = pipeline::build_sinks(&config.sinks)?;
    let mut map_rx = feeds.subscribe_map();
    let mut aggregate_rx = feeds.subscribe_aggregate();
    let handle = pipeline::start(config, model, sinks).await?;

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run_app(&mut terminal, handle.stats(), &mut map_rx, &mut aggregate_rx, duration).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    handle.stop().await?;
    result
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    stats: Arc<EngineStats>,
    map_rx: &mut broadcast::Receiver<String>,
    aggregate_rx: &mut broadcast::Receiver<String>,
    duration: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut app = App::new();
    let run_duration = if duration == 0 { Duration::MAX } else { Duration::from_secs(duration) };

    while !app.should_quit && app.uptime.elapsed() < run_duration {
        app.drain(map_rx);
        app.drain(aggregate_rx);
        app.stats = stats.snapshot();
        terminal.draw(|f| draw(f, &app))?;

        // crossterm polling blocks, keep it off the runtime threads
        let key = tokio::task::spawn_blocking(|| -> io::Result<Option<Event>> {
            if event::poll(Duration::from_millis(150))? {
                event::read().map(Some)
            } else {
                Ok(None)
            }
        })
        .await??;

        if let Some(Event::Key(key)) = key {
            if key.kind == KeyEventKind::Press {
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => app.should_quit = true,
                    KeyCode::Up => app.scroll_offset = app.scroll_offset.saturating_sub(1),
                    KeyCode::Down => app.scroll_offset = app.scroll_offset.saturating_add(1),
                    _ => {}
                }
            }
        }
    }

    Ok(())
}

fn draw(f: &mut ratatui::Frame, app: &App) {
    let size = f.area();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),  // header
            Constraint::Min(10),   // scored rows
            Constraint::Length(9), // aggregate + latency
        ])
        .split(size);

    draw_header(f, app, chunks[0]);
    draw_event_feed(f, app, chunks[1]);
    draw_aggregate_and_latency(f, app, chunks[2]);
}

fn draw_header(f: &mut ratatui::Frame, app: &App, area: Rect) {
    let elapsed = app.uptime.elapsed().as_secs();
    let header = vec![
        Span::styled(" fraud-replay-stream ", Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
        Span::raw(" | "),
        Span::styled(format!("Fraud: {}", app.alerts), Style::default().fg(Color::Red)),
        Span::raw(" | "),
        Span::styled(format!("Lines: {}", app.stats.lines_received), Style::default().fg(Color::Green)),
        Span::raw(" | "),
        Span::styled(format!("Batches: {}", app.stats.batches_published), Style::default().fg(Color::Blue)),
        Span::raw(" | "),
        Span::styled(
            format!("Dropped: {}", app.stats.batches_dropped + app.skipped),
            Style::default().fg(Color::Yellow),
        ),
        Span::raw(" | "),
        Span::raw(format!("Uptime: {}s", elapsed)),
        Span::raw(" | "),
        Span::styled("q=quit  Up/Down=scroll", Style::default().fg(Color::DarkGray)),
    ];
    let p = Paragraph::new(Line::from(header))
        .block(Block::default().borders(Borders::ALL).title(" Replay "));
    f.render_widget(p, area);
}

/// Parse `rgb(r, g, b)` into a terminal color.
fn terminal_color(css: &str) -> Color {
    let inner = css.trim().trim_start_matches("rgb(").trim_end_matches(')');
    let parts: Vec<u8> = inner.split(',').filter_map(|p| p.trim().parse().ok()).collect();
    match parts.as_slice() {
        &[r, g, b] => Color::Rgb(r, g, b),
        _ => Color::White,
    }
}

fn draw_event_feed(f: &mut ratatui::Frame, app: &App, area: Rect) {
    let max_visible = (area.height as usize).saturating_sub(3);
    let total = app.events.len();

    let rows: Vec<Row> = app
        .events
        .iter()
        .rev()
        .skip(app.scroll_offset)
        .take(max_visible)
        .map(|event| {
            let color = terminal_color(&event.color);
            let (label, weight) = if event.label == 1 {
                ("FRAUD", Modifier::BOLD)
            } else {
                ("  ok ", Modifier::empty())
            };
            Row::new(vec![
                Cell::from(Span::styled(label, Style::default().fg(color).add_modifier(weight))),
                Cell::from(format!("{:<14}", event.id)),
                Cell::from(format!("{:<6}", event.entity)),
                Cell::from(format!("{:.4}", event.probability)),
                Cell::from(format!("{:>9.4},{:>9.4}", event.lat, event.lon)),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(6),
            Constraint::Length(15),
            Constraint::Length(7),
            Constraint::Length(8),
            Constraint::Min(20),
        ],
    )
    .header(
        Row::new(vec!["LABEL", "ID", "ENTITY", "P", "POSITION"])
            .style(Style::default().add_modifier(Modifier::BOLD).fg(Color::White)),
    )
    .block(Block::default().borders(Borders::ALL).title(format!(" Scored Rows ({}) ", total)));

    f.render_widget(table, area);
}

fn draw_aggregate_and_latency(f: &mut ratatui::Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    // Latest aggregate snapshot
    let (title, agg_rows) = match &app.aggregate {
        Some(snapshot) => (
            format!(" Amount by Location (batch {}) ", snapshot.batch),
            snapshot
                .totals
                .iter()
                .map(|(location, total)| {
                    Row::new(vec![
                        Cell::from(Span::styled(
                            format!("{:<16}", location),
                            Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
                        )),
                        Cell::from(format!("{:.2}", total)),
                    ])
                })
                .collect::<Vec<_>>(),
        ),
        None => (" Amount by Location ".to_string(), Vec::new()),
    };
    let agg_table = Table::new(agg_rows, [Constraint::Length(17), Constraint::Min(12)])
        .block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(agg_table, chunks[0]);

    // Latency panel
    let scoring = &app.stats.scoring_latency;
    let publish = &app.stats.publish_latency;
    let latency_text = vec![
        Line::from(vec![
            Span::styled("  Score:   ", Style::default().fg(Color::Green)),
            Span::raw(format!("p50={:<8} p95={:<8} p99={:<8}", scoring.p50_us, scoring.p95_us, scoring.p99_us)),
        ]),
        Line::from(vec![
            Span::styled("  Publish: ", Style::default().fg(Color::Cyan)),
            Span::raw(format!("p50={:<8} p95={:<8} p99={:<8}", publish.p50_us, publish.p95_us, publish.p99_us)),
        ]),
        Line::from(""),
        Line::from(vec![
            Span::styled("  Parse failures: ", Style::default().fg(Color::DarkGray)),
            Span::raw(app.stats.parse_failures.to_string()),
            Span::styled("  Scoring failures: ", Style::default().fg(Color::DarkGray)),
            Span::raw(app.stats.scoring_failures.to_string()),
        ]),
        Line::from(vec![
            Span::styled("  Publish failures: ", Style::default().fg(Color::DarkGray)),
            Span::raw(app.stats.publish_failures.to_string()),
        ]),
    ];
    let latency_widget = Paragraph::new(latency_text)
        .block(Block::default().borders(Borders::ALL).title(" Latency (us) "));
    f.render_widget(latency_widget, chunks[1]);
}
