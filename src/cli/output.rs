//! CLI output handling - processor event loop.
//!
//! Renders each `ProcessorEvent` as text (completions on stdout, problems on
//! stderr) or as JSON lines, until the processor stops.

use std::io::{self, Write};

use anyhow::Result;
use tokio::sync::mpsc;

use crate::counting::{MemoryStore, ProcessorEvent};

/// Totals reported by the event loop once the processor has stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventTally {
    pub completed: usize,
    pub rejected: usize,
    pub persist_failed: usize,
}

/// Run the event loop until the processor drops its observer.
pub async fn run_event_loop(
    mut event_rx: mpsc::UnboundedReceiver<ProcessorEvent>,
    json_mode: bool,
    quiet_mode: bool,
) -> Result<EventTally> {
    let mut tally = EventTally::default();

    while let Some(event) = event_rx.recv().await {
        match &event {
            ProcessorEvent::Completed { .. } => tally.completed += 1,
            ProcessorEvent::Rejected { .. } => tally.rejected += 1,
            ProcessorEvent::PersistFailed { .. } => tally.persist_failed += 1,
        }

        if quiet_mode {
            continue;
        }
        if json_mode {
            println!("{}", serde_json::to_string(&event)?);
            io::stdout().flush()?;
        } else {
            match &event {
                ProcessorEvent::Completed { .. } => println!("{}", format_event(&event)),
                _ => eprintln!("{}", format_event(&event)),
            }
        }
    }

    Ok(tally)
}

/// One-line text rendering of a processor event.
pub fn format_event(event: &ProcessorEvent) -> String {
    match event {
        ProcessorEvent::Completed {
            transition,
            completion,
            intent,
        } => {
            let mut line = format!(
                "[{}] lane {}: count {} (+{})",
                transition.name(),
                completion.lane_id,
                completion.updates.count,
                completion.updates.change
            );
            if let Some(occupancy) = &intent.occupancy {
                line.push_str(&format!(
                    ", lot {} {:+}",
                    occupancy.parking_lot_id, occupancy.amount
                ));
            }
            line
        }
        ProcessorEvent::Rejected {
            sensor_id,
            lane_id: Some(lane_id),
            error,
        } => format!("[rejected] sensor {} on lane {}: {}", sensor_id, lane_id, error),
        ProcessorEvent::Rejected {
            sensor_id, error, ..
        } => format!("[rejected] sensor {}: {}", sensor_id, error),
        ProcessorEvent::PersistFailed { lane_id, error } => {
            format!("[persist-failed] lane {}: {}", lane_id, error)
        }
    }
}

/// Print final lane counts and lot occupancy.
pub fn print_summary(store: &MemoryStore, tally: EventTally, json_mode: bool) -> Result<()> {
    let lanes = store.lanes();
    let lots = store.parking_lots();

    if json_mode {
        let summary = serde_json::json!({
            "type": "summary",
            "completed": tally.completed,
            "rejected": tally.rejected,
            "persist_failed": tally.persist_failed,
            "lanes": lanes
                .iter()
                .map(|lane| serde_json::json!({ "id": lane.id, "count": lane.count }))
                .collect::<Vec<_>>(),
            "parking_lots": lots
                .iter()
                .map(|lot| serde_json::json!({
                    "id": lot.id,
                    "count": lot.count,
                    "display_count": lot.display_count(),
                    "total_spaces": lot.total_spaces,
                }))
                .collect::<Vec<_>>(),
        });
        println!("{}", summary);
        io::stdout().flush()?;
        return Ok(());
    }

    println!(
        "\n{} completions, {} rejected, {} persist failures",
        tally.completed, tally.rejected, tally.persist_failed
    );
    for lane in &lanes {
        let name = lane.name.as_deref().unwrap_or(&lane.id);
        println!("lane {:<20} {:>8}", name, lane.count);
    }
    for lot in &lots {
        let name = lot.name.as_deref().unwrap_or(&lot.id);
        println!(
            "lot  {:<20} {:>8} / {} (raw {})",
            name,
            lot.display_count(),
            lot.total_spaces,
            lot.count
        );
    }
    Ok(())
}
