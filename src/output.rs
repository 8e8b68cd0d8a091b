use std::io::{self, Write};

use serde::Serialize;

use crate::app::{ExtractResult, HarvestResult, ProgressEvent, ProgressSink};
use crate::zarr::WalkOutcome;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_harvest(result: &HarvestResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_extract(result: &ExtractResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_walk(outcome: &WalkOutcome) -> io::Result<()> {
        Self::print_json(outcome)
    }

    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Forwards progress events to the log.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => tracing::info!(
                elapsed_secs = elapsed.as_secs_f64(),
                "{}",
                event.message
            ),
            None => tracing::info!("{}", event.message),
        }
    }
}
