//! Replay: save and load generated events for offline refits.

use crate::{detector_sim::SimulatedEvent, scenarios::Scenario};
use fwd_core::Event;
use serde::{Deserialize, Serialize};
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// A recorded scenario run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplayLog {
    /// Scenario the events were generated with
    pub scenario: Scenario,
    /// Events in generation order, with truth
    pub events: Vec<SimulatedEvent>,
}

impl ReplayLog {
    /// Detector-level events without truth.
    pub fn detector_events(&self) -> Vec<Event> {
        self.events.iter().map(|e| e.event.clone()).collect()
    }
}

/// Save a replay log to a JSON file.
pub fn save_replay(log: &ReplayLog, path: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::create(path)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, log)?;
    Ok(())
}

/// Load a replay log from a JSON file.
pub fn load_replay(path: &Path) -> anyhow::Result<ReplayLog> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let log: ReplayLog = serde_json::from_reader(reader)?;
    Ok(log)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
