//! Offline replay of a persisted Stream-mode run.
//!
//! A Stream-mode run writes, per event, a steps record (with the lookup
//! tables of that event) followed by a field-queries record. Replaying
//! feeds those events through the same analyses a LiveAnalysis run would
//! have used, so a run can be captured once and analysed many times with
//! different filters.

use std::path::Path;

use steplog_analysis::analysis::{AnalysisError, AnalysisManager};
use steplog_analysis::output::BucketSink;
use steplog_analysis::statistics::StepStatistics;
use steplog_core::config::AnalysisConfig;
use steplog_core::persist::{self, PersistError, PersistedRecord};
use tracing::{info, warn};

/// Errors raised while replaying a stream.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// The stream file could not be read.
    #[error("failed to load stream: {source}")]
    Load {
        /// The underlying persistence error.
        #[from]
        source: PersistError,
    },

    /// The analyses failed.
    #[error("analysis failed: {source}")]
    Analysis {
        /// The underlying analysis error.
        #[from]
        source: AnalysisError,
    },
}

/// Totals of one replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Events analysed.
    pub events: u64,
    /// Steps analysed.
    pub steps: u64,
    /// Field queries analysed.
    pub queries: u64,
    /// Records skipped because they could not be paired with an event.
    pub skipped: u64,
    /// Bucket sets written.
    pub written: usize,
}

/// Load a JSON-lines stream and replay it.
pub fn replay_file(
    path: &Path,
    config: &AnalysisConfig,
    sink: &mut dyn BucketSink,
) -> Result<ReplaySummary, ReplayError> {
    let records = persist::read_records(path)?;
    info!(path = %path.display(), records = records.len(), "stream loaded");
    replay(records, config, sink)
}

/// Replay persisted records through the step statistics and write the result.
///
/// Stops early once `config.target_events` events have been analysed.
pub fn replay(
    records: Vec<PersistedRecord>,
    config: &AnalysisConfig,
    sink: &mut dyn BucketSink,
) -> Result<ReplaySummary, ReplayError> {
    let mut manager = AnalysisManager::new();
    manager.register(Box::new(StepStatistics::from_config(config)))?;

    let mut summary = ReplaySummary::default();
    let mut records = records.into_iter().peekable();
    while let Some(record) = records.next() {
        let (header, steps, lookups) = match record {
            PersistedRecord::Steps {
                header,
                steps,
                lookups,
            } => (header, steps, lookups),
            PersistedRecord::Fields { header, .. } => {
                warn!(event = header.event, "field record without steps, skipped");
                summary.skipped = summary.skipped.saturating_add(1);
                continue;
            }
        };

        let paired = matches!(
            records.peek(),
            Some(PersistedRecord::Fields { header: next, .. })
                if next.run_id == header.run_id && next.event == header.event
        );
        let queries = match records.next_if(|_| paired) {
            Some(PersistedRecord::Fields { queries, .. }) => queries,
            _ => Vec::new(),
        };

        summary.events = manager.analyze_event(&steps, &queries, &lookups)?;
        summary.steps = summary.steps.saturating_add(count(steps.len()));
        summary.queries = summary.queries.saturating_add(count(queries.len()));

        if config
            .target_events
            .is_some_and(|target| summary.events >= target)
        {
            info!(events = summary.events, "target event count reached");
            break;
        }
    }

    manager.finalize_events()?;
    summary.written = manager.write(sink)?;
    manager.terminate();
    info!(
        events = summary.events,
        steps = summary.steps,
        queries = summary.queries,
        skipped = summary.skipped,
        "replay complete"
    );
    Ok(summary)
}

fn count(len: usize) -> u64 {
    u64::try_from(len).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use steplog_analysis::output::MemoryBucketSink;
    use steplog_core::lookup::LookupTables;
    use steplog_core::persist::{MemorySink, PersistRequest, RecordSink};
    use steplog_types::{FieldQueryEvent, StepEvent, StepObservation, ThreeVector, TrackId, VolumeId};

    use super::*;

    fn persisted_event(sink: &mut MemorySink, event: u64, volume: u32) {
        let mut lookups = LookupTables::new();
        lookups.record_pdg(TrackId(1), 22);
        let obs = StepObservation::new(VolumeId(volume), TrackId(1)).as_new_track();
        let steps = vec![StepEvent::from_observation(0, &obs, 10)];
        let query = FieldQueryEvent {
            id: 0,
            step_ref: Some(0),
            position: ThreeVector::default(),
            magnitude: 0.5,
        };
        sink.persist(PersistRequest::Steps {
            event,
            steps: &steps,
            lookups: &lookups,
        })
        .unwrap();
        sink.persist(PersistRequest::Fields {
            event,
            queries: &[query],
        })
        .unwrap();
    }

    #[test]
    fn replay_pairs_steps_with_their_queries() {
        let mut stream = MemorySink::new();
        persisted_event(&mut stream, 0, 1);
        persisted_event(&mut stream, 1, 1);

        let mut out = MemoryBucketSink::new();
        let summary = replay(stream.records().to_vec(), &AnalysisConfig::default(), &mut out).unwrap();

        assert_eq!(summary.events, 2);
        assert_eq!(summary.steps, 2);
        assert_eq!(summary.queries, 2);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.written, 1);
        let set = out.set("step_statistics").unwrap();
        assert_eq!(set.events, 2);
        assert_eq!(set.category("steps_per_particle").unwrap().get("gamma"), 2.0);
    }

    #[test]
    fn orphan_field_records_are_skipped() {
        let mut stream = MemorySink::new();
        persisted_event(&mut stream, 0, 1);
        let mut records = stream.records().to_vec();
        records.swap(0, 1);

        let mut out = MemoryBucketSink::new();
        let summary = replay(records, &AnalysisConfig::default(), &mut out).unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.events, 1);
        assert_eq!(summary.queries, 0);
    }

    #[test]
    fn replay_stops_at_target() {
        let mut stream = MemorySink::new();
        for event in 0..5 {
            persisted_event(&mut stream, event, 1);
        }
        let config = AnalysisConfig {
            target_events: Some(3),
            ..AnalysisConfig::default()
        };
        let mut out = MemoryBucketSink::new();
        let summary = replay(stream.records().to_vec(), &config, &mut out).unwrap();
        assert_eq!(summary.events, 3);
    }
}
