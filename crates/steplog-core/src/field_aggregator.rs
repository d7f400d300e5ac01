//! Per-event accumulation of magnetic-field queries.
//!
//! Mirrors [`StepAggregator`](crate::step_aggregator::StepAggregator): in
//! Summary mode only a per-volume query count is kept, otherwise every
//! query is retained with a reference to the step that was being
//! transported when it ran.

use std::collections::HashMap;

use steplog_types::{FieldObservation, FieldQueryEvent, VolumeId};
use tracing::debug;

use crate::config::RunMode;
use crate::geometry::GeometryCatalog;
use crate::lookup::LookupTables;
use crate::persist::{PersistError, PersistRequest, RecordSink};
use crate::report::{FieldSummaryReport, FieldVolumeSummary, FlushOutcome};

/// Accumulates the field queries of one event at a time.
#[derive(Debug)]
pub struct FieldAggregator {
    mode: RunMode,
    catalog: GeometryCatalog,
    event: u64,
    recorded: u64,
    queries: Vec<FieldQueryEvent>,
    volume_queries: HashMap<VolumeId, u64>,
    volume_names: HashMap<VolumeId, String>,
}

impl FieldAggregator {
    /// Create an aggregator for the given mode.
    pub fn new(mode: RunMode, catalog: GeometryCatalog) -> Self {
        Self {
            mode,
            catalog,
            event: 0,
            recorded: 0,
            queries: Vec::new(),
            volume_queries: HashMap::new(),
            volume_names: HashMap::new(),
        }
    }

    /// Zero-based number of the event currently accumulating.
    pub const fn event(&self) -> u64 {
        self.event
    }

    /// Queries recorded in the current event.
    pub const fn recorded(&self) -> u64 {
        self.recorded
    }

    /// The retained queries of the current event (empty in Summary mode).
    pub fn queries(&self) -> &[FieldQueryEvent] {
        &self.queries
    }

    /// Record one field query and return its identifier.
    ///
    /// `step_ref` is the sequence number of the step in flight, if any.
    pub fn record_field_query(
        &mut self,
        obs: &FieldObservation,
        step_ref: Option<u64>,
        lookups: &mut LookupTables,
    ) -> u64 {
        let id = self.recorded;
        self.recorded = self.recorded.saturating_add(1);

        if let Some(name) = obs.volume_name.as_deref() {
            lookups.register_volume(obs.volume_id, name, None, &self.catalog);
        }

        if self.mode.retains_steps() {
            self.queries
                .push(FieldQueryEvent::from_observation(id, step_ref, obs));
        } else {
            let count = self.volume_queries.entry(obs.volume_id).or_insert(0);
            *count = count.saturating_add(1);
            if !self.volume_names.contains_key(&obs.volume_id) {
                let name = obs
                    .volume_name
                    .clone()
                    .unwrap_or_else(|| lookups.volume_label(obs.volume_id).to_owned());
                self.volume_names.insert(obs.volume_id, name);
            }
        }
        id
    }

    /// End the event: report or persist, then clear.
    pub fn flush(
        &mut self,
        sink: &mut dyn RecordSink,
        lookups: &LookupTables,
    ) -> Result<FlushOutcome<FieldSummaryReport>, PersistError> {
        if !self.mode.retains_steps() {
            let report = self.summarize(lookups);
            report.log();
            self.clear();
            return Ok(FlushOutcome::Reported(report));
        }

        let records = self.queries.len();
        let result = sink.persist(PersistRequest::Fields {
            event: self.event,
            queries: &self.queries,
        });
        self.clear();
        result?;
        Ok(FlushOutcome::Persisted { records })
    }

    /// Reset all per-event state and advance to the next event.
    pub fn clear(&mut self) {
        debug!(event = self.event, queries = self.recorded, "field aggregator cleared");
        self.event = self.event.saturating_add(1);
        self.recorded = 0;
        self.queries.clear();
        self.volume_queries.clear();
        self.volume_names.clear();
    }

    fn summarize(&self, lookups: &LookupTables) -> FieldSummaryReport {
        let mut volumes: Vec<FieldVolumeSummary> = self
            .volume_queries
            .iter()
            .map(|(volume, queries)| FieldVolumeSummary {
                volume: *volume,
                name: self
                    .volume_names
                    .get(volume)
                    .cloned()
                    .unwrap_or_else(|| lookups.volume_label(*volume).to_owned()),
                queries: *queries,
            })
            .collect();
        volumes.sort_by_key(|v| v.volume);
        FieldSummaryReport {
            event: self.event,
            queries: self.recorded,
            volumes,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use steplog_types::{Parentage, StepObservation, ThreeVector, TrackId};

    use super::*;
    use crate::persist::MemorySink;
    use crate::step_aggregator::StepAggregator;

    fn query(volume: u32) -> FieldObservation {
        FieldObservation {
            volume_id: VolumeId(volume),
            volume_name: Some(format!("vol{volume}")),
            position: ThreeVector::new(0.0, 0.0, 1.0),
            field: ThreeVector::new(0.0, 0.0, 0.5),
        }
    }

    #[test]
    fn stream_queries_reference_steps() {
        let mut agg = FieldAggregator::new(RunMode::Stream, GeometryCatalog::new());
        let mut lookups = LookupTables::new();
        agg.record_field_query(&query(1), None, &mut lookups);
        agg.record_field_query(&query(1), Some(4), &mut lookups);
        assert_eq!(agg.queries().len(), 2);
        assert_eq!(agg.queries()[0].step_ref, None);
        assert_eq!(agg.queries()[1].step_ref, Some(4));
        assert_eq!(agg.queries()[1].id, 1);
    }

    #[test]
    fn query_before_first_step_keeps_step_medium() {
        let catalog = GeometryCatalog::new().with_module("vol3", "TPC");
        let mut fields = FieldAggregator::new(RunMode::Stream, catalog.clone());
        let mut steps = StepAggregator::new(RunMode::Stream, catalog);
        let mut lookups = LookupTables::new();

        fields.record_field_query(&query(3), None, &mut lookups);
        assert_eq!(lookups.medium_name(VolumeId(3)), None);

        let obs = StepObservation::new(VolumeId(3), TrackId(1))
            .with_names("vol3", Some("Ne".to_owned()))
            .with_particle(11, Parentage::Primary);
        steps.record_step(&obs, &mut lookups);

        assert_eq!(lookups.medium_name(VolumeId(3)), Some("Ne"));
        assert_eq!(lookups.module_label(VolumeId(3)), "TPC");
        assert_eq!(lookups.anomaly_count(), 0);
    }

    #[test]
    fn summary_counts_per_volume() {
        let mut agg = FieldAggregator::new(RunMode::Summary, GeometryCatalog::new());
        let mut lookups = LookupTables::new();
        for volume in [2, 2, 3] {
            agg.record_field_query(&query(volume), None, &mut lookups);
        }
        let report = agg
            .flush(&mut MemorySink::new(), &lookups)
            .unwrap()
            .report()
            .unwrap();
        assert_eq!(report.queries, 3);
        assert_eq!(report.volumes[0].queries, 2);
        assert_eq!(report.volumes[1].name, "vol3");
        assert_eq!(agg.recorded(), 0);
    }

    #[test]
    fn stream_flush_persists_and_clears() {
        let mut agg = FieldAggregator::new(RunMode::Stream, GeometryCatalog::new());
        let mut lookups = LookupTables::new();
        let mut sink = MemorySink::new();
        agg.record_field_query(&query(1), Some(0), &mut lookups);
        let outcome = agg.flush(&mut sink, &lookups).unwrap();
        assert_eq!(outcome, FlushOutcome::Persisted { records: 1 });
        assert!(agg.queries().is_empty());
        assert_eq!(agg.event(), 1);
        assert_eq!(lookups.volume_name(VolumeId(1)), Some("vol1"));
    }
}
