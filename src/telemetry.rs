//! Persisted run log: one record per granted step, CSV export.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::coordinator::SimTime;

/// Schema v1 column header for the run log export.
pub const RUN_LOG_HEADER: &str = "time,generation_kw,storage_command_kw,soc,voltage_pu,stale";

/// One granted step of a completed run.
///
/// `generation_kw` and `voltage_pu` are the values the storage controller
/// observed at that step, so replaying the log through the controller
/// reproduces `storage_command_kw` and `soc` exactly.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub time: SimTime,
    pub generation_kw: f32,
    /// Positive = discharge, negative = charge.
    pub storage_command_kw: f32,
    pub soc: f32,
    /// Absent when the run monitored no feedback voltage.
    pub voltage_pu: Option<f32>,
    /// True when the grid solve failed and the previous voltage stood in.
    pub stale: bool,
}

impl fmt::Display for StepRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "t={:>7.1} | pv={:>8.2} kW  ess={:>8.2} kW  soc={:>5.1}% | v={}{}",
            self.time,
            self.generation_kw,
            self.storage_command_kw,
            self.soc * 100.0,
            match self.voltage_pu {
                Some(v) => format!("{v:.4} pu"),
                None => "-".to_string(),
            },
            if self.stale { " (stale)" } else { "" },
        )
    }
}

/// Writes the run log as CSV to any writer.
///
/// Produces deterministic output for identical inputs.
///
/// # Errors
///
/// Returns an `io::Error` if writing fails.
pub fn write_run_log(records: &[StepRecord], writer: impl Write) -> io::Result<()> {
    let mut wtr = csv::WriterBuilder::new().from_writer(writer);

    wtr.write_record(RUN_LOG_HEADER.split(','))?;
    for r in records {
        wtr.write_record(&[
            format!("{:.1}", r.time),
            format!("{:.4}", r.generation_kw),
            format!("{:.4}", r.storage_command_kw),
            format!("{:.6}", r.soc),
            r.voltage_pu.map(|v| format!("{v:.6}")).unwrap_or_default(),
            r.stale.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Exports the run log to a CSV file at the given path.
///
/// # Errors
///
/// Returns an `io::Error` if file creation or writing fails.
pub fn export_run_log(records: &[StepRecord], path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    write_run_log(records, BufWriter::new(file))
}
