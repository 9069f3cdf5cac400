use std::io::{self, Write};

use serde::Serialize;
use tracing::info;

use crate::layers::InitOutcome;
use crate::ledger::LedgerEntry;
use crate::pipeline::{ProgressEvent, ProgressSink, RunSummary, UnitState};

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_summary(summary: &RunSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_status(entries: &[LedgerEntry]) -> io::Result<()> {
        Self::print_json(&entries)
    }

    pub fn print_init(outcomes: &[InitOutcome]) -> io::Result<()> {
        Self::print_json(&outcomes)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Progress sink that reports terminal unit states through `tracing`.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn event(&self, event: ProgressEvent) {
        if !event.state.is_terminal() {
            return;
        }
        let elapsed_ms = event.elapsed.map(|elapsed| elapsed.as_millis() as u64);
        match &event.state {
            UnitState::Failed { reason, retryable } => info!(
                unit = %event.unit,
                elapsed_ms,
                retryable,
                reason = reason.as_str(),
                "unit finished: failed"
            ),
            state => info!(unit = %event.unit, elapsed_ms, state = state.name(), "unit finished"),
        }
    }
}
