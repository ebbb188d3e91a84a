//! Pattern Replay - feed recorded state changes through the pattern engine
//!
//! Reads newline-delimited JSON state events from a file (or stdin), learns
//! from them in event-time order and prints the resulting suggestions.

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use pattern_engine::stats::StatsSnapshot;
use pattern_engine::{
    Collaborators, EngineConfig, JsonPatternStore, PatternEngine, PatternStatus, PatternStore,
    RawStateEvent, ScenePattern, Suggestion,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Summary printed at the end of a replay
#[derive(Serialize)]
struct ReplayReport {
    stats: StatsSnapshot,
    suggestions: Vec<Suggestion>,
    scenes: Vec<ScenePattern>,
}

/// Event-time schedule for one batch pass
struct Cadence {
    every: Option<Duration>,
    next: Option<DateTime<Utc>>,
}

impl Cadence {
    fn new(every_secs: u64) -> Self {
        Self {
            every: (every_secs > 0).then(|| Duration::seconds(every_secs as i64)),
            next: None,
        }
    }

    /// Latest pass time due at or before `now`. Passes read everything
    /// since their previous run, so missed ticks collapse into one.
    fn due(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let every = self.every?;
        let mut next = *self.next.get_or_insert(now + every);
        let mut due = None;
        while next <= now {
            due = Some(next);
            next += every;
        }
        self.next = Some(next);
        due
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pattern_replay=info,pattern_engine=info".into()),
        )
        .init();

    let config_path = std::env::var("PATTERN_CONFIG").ok().map(PathBuf::from);
    let config = EngineConfig::load(config_path.as_deref()).context("loading configuration")?;

    let store_path = config.runtime.data_dir.join("patterns.json");
    let store = Arc::new(
        JsonPatternStore::open(&store_path)
            .await
            .with_context(|| format!("opening pattern store {}", store_path.display()))?,
    );
    tracing::info!("Using pattern store at {}", store_path.display());

    let engine = PatternEngine::new(config, store.clone(), Collaborators::default())?;

    let input = std::env::args().nth(1);
    let last_event = match &input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {path}"))?;
            tracing::info!("Replaying events from {}", path);
            replay(&engine, BufReader::new(file)).await?
        }
        None => {
            tracing::info!("Replaying events from stdin");
            replay(&engine, BufReader::new(tokio::io::stdin())).await?
        }
    };

    let now = last_event.unwrap_or_else(Utc::now);
    let decayed = engine.decay_checkpoint(now).await?;
    tracing::debug!("Decay checkpoint touched {} rows", decayed);
    store.flush().await?;

    let report = ReplayReport {
        stats: engine.stats(),
        suggestions: engine
            .suggestions_at(engine.config().confidence.suggestion_threshold, now)
            .await?,
        scenes: store.list_scenes(Some(PatternStatus::Suggested)).await?,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    tracing::info!(
        "Replay finished: {} received, {} accepted, {} suggestions",
        report.stats.received,
        report.stats.accepted,
        report.suggestions.len()
    );
    Ok(())
}

/// Ingest every line, running batch passes as event time moves past their
/// cadence. Returns the time of the last event seen.
async fn replay<R>(engine: &PatternEngine, reader: R) -> anyhow::Result<Option<DateTime<Utc>>>
where
    R: AsyncBufRead + Unpin,
{
    let runtime = &engine.config().runtime;
    let mut correlation = Cadence::new(runtime.correlation_interval_secs);
    let mut scenes = Cadence::new(runtime.scene_interval_secs);
    let cancel = CancellationToken::new();

    let mut last_event: Option<DateTime<Utc>> = None;
    let mut lines = reader.lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let raw: RawStateEvent = match serde_json::from_str(&line) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Skipping line {}: {}", line_no, e);
                continue;
            }
        };

        if let Some(at) = raw.occurred_at {
            if let Some(due) = correlation.due(at) {
                // Pass failures are logged and broadcast by the engine
                let _ = engine.run_correlation_pass(due, &cancel).await;
            }
            if let Some(due) = scenes.due(at) {
                let _ = engine.run_scene_pass(due, &cancel).await;
            }
            last_event = Some(last_event.map_or(at, |last| last.max(at)));
        }
        engine.ingest(raw).await;
    }

    if let Some(end) = last_event {
        let _ = engine.run_correlation_pass(end, &cancel).await;
        // No more input: let the last scene group close
        let settle = Duration::seconds(engine.config().scenes.window_secs as i64);
        let _ = engine.run_scene_pass(end + settle, &cancel).await;
    }
    Ok(last_event)
}
