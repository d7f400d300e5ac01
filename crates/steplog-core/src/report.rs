//! End-of-event summaries written to the diagnostic channel.

use serde::{Deserialize, Serialize};
use steplog_types::VolumeId;
use tracing::info;

/// What a flush did with the event's data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlushOutcome<R> {
    /// Summary mode: the counters were condensed into a report and logged.
    Reported(R),
    /// Stream mode: the records were handed to the persistence sink.
    Persisted {
        /// Number of step or field records handed over.
        records: usize,
    },
}

impl<R> FlushOutcome<R> {
    /// The report, if this flush produced one.
    pub fn report(self) -> Option<R> {
        match self {
            Self::Reported(report) => Some(report),
            Self::Persisted { .. } => None,
        }
    }

    /// Number of records handed to the sink, zero for a report.
    pub const fn persisted_records(&self) -> usize {
        match self {
            Self::Reported(_) => 0,
            Self::Persisted { records } => *records,
        }
    }
}

/// Number of secondaries produced by one process in one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessCount {
    /// Process name.
    pub process: String,
    /// Secondaries produced by it.
    pub count: u64,
}

/// Per-volume line of a [`StepSummaryReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSummary {
    /// Volume identifier.
    pub volume: VolumeId,
    /// Volume name seen during the event.
    pub name: String,
    /// Steps taken in the volume.
    pub steps: u64,
    /// Hits registered in the volume.
    pub hits: u64,
    /// Secondaries produced in the volume.
    pub secondaries: u64,
    /// Secondaries broken down by production process, largest first.
    pub processes: Vec<ProcessCount>,
}

/// Summary-mode report for one event's steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSummaryReport {
    /// Zero-based event number.
    pub event: u64,
    /// Steps recorded in the event.
    pub steps: u64,
    /// Distinct tracks transported.
    pub distinct_tracks: usize,
    /// Distinct particle types transported.
    pub distinct_particles: usize,
    /// Per-volume breakdown ordered by volume identifier.
    pub volumes: Vec<VolumeSummary>,
}

impl StepSummaryReport {
    /// Sum of the per-volume step counts.
    pub fn volume_step_total(&self) -> u64 {
        self.volumes
            .iter()
            .fold(0_u64, |acc, v| acc.saturating_add(v.steps))
    }

    /// Write the report to the log.
    pub fn log(&self) {
        info!(
            event = self.event,
            steps = self.steps,
            tracks = self.distinct_tracks,
            particles = self.distinct_particles,
            "step summary"
        );
        for volume in &self.volumes {
            let processes = volume
                .processes
                .iter()
                .map(|p| format!("{}:{}", p.process, p.count))
                .collect::<Vec<_>>()
                .join(" ");
            info!(
                event = self.event,
                volume = %volume.name,
                steps = volume.steps,
                secondaries = volume.secondaries,
                hits = volume.hits,
                processes = %processes,
                "volume summary"
            );
        }
        info!(event = self.event, "end of event");
    }
}

/// Per-volume line of a [`FieldSummaryReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldVolumeSummary {
    /// Volume identifier.
    pub volume: VolumeId,
    /// Volume name seen during the event.
    pub name: String,
    /// Field queries evaluated in the volume.
    pub queries: u64,
}

/// Summary-mode report for one event's field queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSummaryReport {
    /// Zero-based event number.
    pub event: u64,
    /// Field queries recorded in the event.
    pub queries: u64,
    /// Per-volume breakdown ordered by volume identifier.
    pub volumes: Vec<FieldVolumeSummary>,
}

impl FieldSummaryReport {
    /// Write the report to the log.
    pub fn log(&self) {
        info!(event = self.event, queries = self.queries, "field summary");
        for volume in &self.volumes {
            info!(
                event = self.event,
                volume = %volume.name,
                queries = volume.queries,
                "field volume summary"
            );
        }
    }
}
