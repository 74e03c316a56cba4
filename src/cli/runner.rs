//! CLI execution runner.
//!
//! Streams events into the processor, then drains and shuts it down.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::counting::{CountingEvent, CountingProcessor};

use super::bootstrap::CliContext;
use super::output::{print_summary, run_event_loop};

/// Counts of input lines handled by a replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub submitted: usize,
    pub skipped: usize,
}

/// Replay the configured event source and print the summary.
pub async fn run(ctx: CliContext) -> Result<()> {
    let CliContext {
        processor,
        store,
        event_rx,
        args,
    } = ctx;

    let output = tokio::spawn(run_event_loop(event_rx, args.json, args.quiet));

    let result = match args.events_path() {
        Some(path) => replay_file(&processor, path, args.pace).await,
        None => replay_stdin(&processor, args.pace).await,
    };

    let result = match result {
        Ok(stats) if !args.no_drain => processor.drain().await.map(|_| stats).map_err(Into::into),
        other => other,
    };

    // The output loop ends once the stopped worker drops its observer
    if let Err(e) = processor.shutdown().await {
        tracing::warn!("Processor shutdown error: {}", e);
    }

    let tally = match output.await {
        Ok(Ok(tally)) => tally,
        Ok(Err(e)) => {
            tracing::warn!("Output handler error: {}", e);
            Default::default()
        }
        Err(e) => {
            tracing::warn!("Output handler panicked: {}", e);
            Default::default()
        }
    };

    let stats = result?;
    if args.verbose {
        eprintln!(
            "[cli] {} events submitted, {} lines skipped",
            stats.submitted, stats.skipped
        );
    }
    print_summary(&store, tally, args.json)
}

async fn replay_file(
    processor: &CountingProcessor,
    path: &Path,
    pace: bool,
) -> Result<ReplayStats> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open events file: {}", path.display()))?;
    replay(processor, BufReader::new(file), pace).await
}

async fn replay_stdin(processor: &CountingProcessor, pace: bool) -> Result<ReplayStats> {
    if atty::is(atty::Stream::Stdin) {
        anyhow::bail!("No events file given and stdin is a terminal; pipe NDJSON events in");
    }
    replay(processor, BufReader::new(tokio::io::stdin()), pace).await
}

/// Submit every event read from `reader`.
///
/// Blank lines and `#` comments are skipped; malformed lines are logged and
/// skipped. With `pace`, the gaps between event timestamps are slept.
pub async fn replay<R>(processor: &CountingProcessor, reader: R, pace: bool) -> Result<ReplayStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = ReplayStats::default();
    let mut last_time: Option<DateTime<Utc>> = None;
    let mut lines = reader.lines();
    let mut line_number = 0usize;

    while let Some(line) = lines.next_line().await.context("Failed to read events")? {
        line_number += 1;
        let event = match parse_line(&line) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("Skipping line {}: {}", line_number, e);
                stats.skipped += 1;
                continue;
            }
        };

        if pace {
            if let Some(gap) = last_time.and_then(|last| (event.time - last).to_std().ok()) {
                tokio::time::sleep(gap).await;
            }
            last_time = Some(event.time);
        }

        processor.submit(event).await?;
        stats.submitted += 1;
    }

    Ok(stats)
}

/// Parse one NDJSON line. `None` for blank lines and comments.
fn parse_line(line: &str) -> Result<Option<CountingEvent>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let event = serde_json::from_str(line).context("Invalid counting event")?;
    Ok(Some(event))
}
