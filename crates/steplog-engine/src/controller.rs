//! Run controller: the mode-aware driver of one capture run.
//!
//! The controller owns the lookup tables, both aggregators and, in
//! [`RunMode::LiveAnalysis`], the analysis manager. The host calls it once
//! per step, field query and hit, and once at the end of every event.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized -> Ready -> [Accumulating <-> Flushed]* -> Finalized
//!                                  \
//!                                   -> Failed (protocol violation)
//! ```
//!
//! In LiveAnalysis mode the run is finalized as soon as the configured
//! target event count has been analysed; otherwise at [`shutdown`].
//!
//! [`shutdown`]: RunController::shutdown

use steplog_analysis::analysis::{AnalysisError, AnalysisManager, StepAnalysis};
use steplog_analysis::output::BucketSink;
use steplog_analysis::statistics::StepStatistics;
use steplog_core::config::{RunMode, SteplogConfig};
use steplog_core::field_aggregator::FieldAggregator;
use steplog_core::geometry::{GeometryCatalog, GeometryError};
use steplog_core::lookup::LookupTables;
use steplog_core::persist::{PersistError, RecordSink};
use steplog_core::report::{FieldSummaryReport, FlushOutcome, StepSummaryReport};
use steplog_core::step_aggregator::{AggregatorError, HitOutcome, StepAggregator};
use steplog_types::{FieldObservation, StepObservation};
use tracing::{debug, error, info, warn};

/// Where the controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// Created, aggregators not built yet.
    Uninitialized,
    /// Initialized, no event data yet.
    Ready,
    /// The current event has data.
    Accumulating,
    /// The last event was flushed; the next one has no data yet.
    Flushed,
    /// The run is complete. Nothing more is accepted.
    Finalized,
    /// A protocol violation stopped the run.
    Failed,
}

impl RunPhase {
    /// Whether event data and event boundaries are accepted.
    pub const fn accepts_events(self) -> bool {
        matches!(self, Self::Ready | Self::Accumulating | Self::Flushed)
    }
}

/// Errors returned by the [`RunController`].
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// The operation is not valid in the current phase.
    #[error("{operation} is not allowed in phase {phase:?}")]
    InvalidPhase {
        /// The rejected operation.
        operation: &'static str,
        /// The phase the controller was in.
        phase: RunPhase,
    },

    /// Geometry metadata could not be loaded.
    #[error("geometry error: {source}")]
    Geometry {
        /// The underlying geometry error.
        #[from]
        source: GeometryError,
    },

    /// The event source violated the recording protocol.
    #[error("aggregator error: {source}")]
    Aggregator {
        /// The underlying aggregator error.
        #[from]
        source: AggregatorError,
    },

    /// Persisting an event failed.
    #[error("persistence error: {source}")]
    Persist {
        /// The underlying persistence error.
        #[from]
        source: PersistError,
    },

    /// The analysis manager failed.
    #[error("analysis error: {source}")]
    Analysis {
        /// The underlying analysis error.
        #[from]
        source: AnalysisError,
    },
}

/// What [`RunController::end_event`] did with the finished event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// Summary mode: both reports were logged.
    Summarized {
        /// Zero-based event number.
        event: u64,
        /// Step report.
        steps: StepSummaryReport,
        /// Field-query report.
        fields: FieldSummaryReport,
    },
    /// Stream mode: records were handed to the record sink.
    Persisted {
        /// Zero-based event number.
        event: u64,
        /// Steps persisted.
        steps: usize,
        /// Field queries persisted.
        queries: usize,
    },
    /// LiveAnalysis mode: the event was folded into the analyses.
    Analysed {
        /// Zero-based event number.
        event: u64,
        /// Events analysed so far.
        analysed: u64,
        /// The target was reached and the analyses were written.
        finalized: bool,
    },
}

/// Returned by [`RunController::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Events ended during the run.
    pub events: u64,
    /// Phase the run ended in.
    pub phase: RunPhase,
    /// A partially recorded event was flushed at shutdown.
    pub flushed_partial_event: bool,
}

#[derive(Debug)]
struct Pipeline {
    steps: StepAggregator,
    fields: FieldAggregator,
    analyses: Option<AnalysisManager>,
}

/// Drives one capture run in a fixed [`RunMode`].
///
/// `R` receives Stream-mode records, `B` receives the finalized buckets of
/// a LiveAnalysis run.
#[derive(Debug)]
pub struct RunController<R, B> {
    config: SteplogConfig,
    phase: RunPhase,
    lookups: LookupTables,
    pipeline: Option<Pipeline>,
    records: R,
    buckets: B,
    events: u64,
    closed: bool,
}

impl<R: RecordSink, B: BucketSink> RunController<R, B> {
    /// Create an uninitialized controller.
    pub fn new(config: SteplogConfig, records: R, buckets: B) -> Self {
        Self {
            config,
            phase: RunPhase::Uninitialized,
            lookups: LookupTables::new(),
            pipeline: None,
            records,
            buckets,
            events: 0,
            closed: false,
        }
    }

    /// Current phase.
    pub const fn phase(&self) -> RunPhase {
        self.phase
    }

    /// The mode fixed at construction.
    pub const fn mode(&self) -> RunMode {
        self.config.mode
    }

    /// The run configuration.
    pub const fn config(&self) -> &SteplogConfig {
        &self.config
    }

    /// The run's lookup tables.
    pub const fn lookups(&self) -> &LookupTables {
        &self.lookups
    }

    /// The record sink.
    pub const fn records(&self) -> &R {
        &self.records
    }

    /// The bucket sink.
    pub const fn buckets(&self) -> &B {
        &self.buckets
    }

    /// Events ended so far.
    pub const fn events(&self) -> u64 {
        self.events
    }

    /// Give the sinks back.
    pub fn into_sinks(self) -> (R, B) {
        (self.records, self.buckets)
    }

    /// Build the aggregators and, in LiveAnalysis mode, the analyses.
    pub fn init(&mut self) -> Result<(), ControllerError> {
        if self.phase != RunPhase::Uninitialized {
            return Err(self.invalid("init"));
        }
        let catalog = match GeometryCatalog::from_config(&self.config.geometry) {
            Ok(catalog) => catalog,
            Err(err) => {
                error!(error = %err, "geometry metadata unavailable");
                self.phase = RunPhase::Failed;
                return Err(err.into());
            }
        };

        let mode = self.config.mode;
        let analyses = if mode == RunMode::LiveAnalysis {
            let mut manager = AnalysisManager::new();
            manager.register(Box::new(StepStatistics::from_config(&self.config.analysis)))?;
            Some(manager)
        } else {
            None
        };
        self.pipeline = Some(Pipeline {
            steps: StepAggregator::new(mode, catalog.clone()),
            fields: FieldAggregator::new(mode, catalog),
            analyses,
        });
        self.phase = RunPhase::Ready;
        info!(
            mode = ?mode,
            target_events = ?self.config.analysis.target_events,
            "run controller ready"
        );
        Ok(())
    }

    /// Add an analysis next to the built-in statistics.
    ///
    /// Only valid in LiveAnalysis mode, before the first event.
    pub fn register_analysis(
        &mut self,
        analysis: Box<dyn StepAnalysis>,
    ) -> Result<(), ControllerError> {
        let phase = self.phase;
        let manager = match (phase, self.pipeline.as_mut()) {
            (RunPhase::Ready, Some(pipeline)) => pipeline.analyses.as_mut(),
            _ => None,
        };
        let Some(manager) = manager else {
            return Err(ControllerError::InvalidPhase {
                operation: "register_analysis",
                phase,
            });
        };
        manager.register(analysis)?;
        Ok(())
    }

    /// Record one step. Returns its sequence number within the event.
    pub fn record_step(&mut self, obs: &StepObservation) -> Result<u64, ControllerError> {
        let pipeline = active(&mut self.pipeline, self.phase, "record_step")?;
        let seq = pipeline.steps.record_step(obs, &mut self.lookups);
        self.phase = RunPhase::Accumulating;
        Ok(seq)
    }

    /// Record one field query, linked to the step currently in flight.
    pub fn record_field_query(&mut self, obs: &FieldObservation) -> Result<u64, ControllerError> {
        let pipeline = active(&mut self.pipeline, self.phase, "record_field_query")?;
        let step_ref = pipeline.steps.latest_sequence();
        let id = pipeline
            .fields
            .record_field_query(obs, step_ref, &mut self.lookups);
        self.phase = RunPhase::Accumulating;
        Ok(id)
    }

    /// Attach a detector hit to a step (the latest one without `seq`).
    ///
    /// A hit before any step of the event fails the run.
    pub fn record_hit(
        &mut self,
        detector: u32,
        seq: Option<u64>,
    ) -> Result<HitOutcome, ControllerError> {
        let pipeline = active(&mut self.pipeline, self.phase, "record_hit")?;
        match pipeline.steps.record_hit(detector, seq) {
            Ok(outcome) => {
                self.phase = RunPhase::Accumulating;
                Ok(outcome)
            }
            Err(err) => {
                error!(error = %err, "event protocol violated, run failed");
                self.phase = RunPhase::Failed;
                Err(err.into())
            }
        }
    }

    /// End the current event.
    ///
    /// Summary and Stream mode flush the aggregators; LiveAnalysis hands
    /// the event to the analyses and finalizes them once the target event
    /// count is reached. Per-event state is cleared in every mode, also
    /// when the flush fails.
    pub fn end_event(&mut self) -> Result<EventOutcome, ControllerError> {
        let pipeline = active(&mut self.pipeline, self.phase, "end_event")?;
        let event = pipeline.steps.event();
        let result = match self.config.mode {
            RunMode::Summary | RunMode::Stream => {
                flush_aggregators(pipeline, &mut self.records, &mut self.lookups, event)
            }
            RunMode::LiveAnalysis => analyse_event(pipeline, &mut self.lookups).map(|analysed| {
                EventOutcome::Analysed {
                    event,
                    analysed,
                    finalized: false,
                }
            }),
        };
        self.events = self.events.saturating_add(1);
        self.phase = RunPhase::Flushed;
        let mut outcome = result?;

        if let EventOutcome::Analysed {
            analysed,
            finalized,
            ..
        } = &mut outcome
        {
            if self
                .config
                .analysis
                .target_events
                .is_some_and(|target| *analysed >= target)
            {
                info!(analysed = *analysed, "target event count reached");
                self.finalize_analyses()?;
                *finalized = true;
            }
        }
        debug!(event, outcome = ?outcome, "event ended");
        Ok(outcome)
    }

    /// Tear the run down.
    ///
    /// Buffered Summary or Stream data of an unfinished event is flushed,
    /// the record sink is finished, and analyses that never reached their
    /// target are finalized and written. A partial LiveAnalysis event is
    /// dropped.
    pub fn shutdown(&mut self) -> Result<RunSummary, ControllerError> {
        if self.closed {
            return Err(self.invalid("shutdown"));
        }
        self.closed = true;

        let mut flushed_partial_event = false;
        if self.phase == RunPhase::Accumulating {
            if self.config.mode == RunMode::LiveAnalysis {
                warn!("dropping partially recorded event at shutdown");
            } else {
                info!("flushing buffered event at shutdown");
                self.end_event()?;
                flushed_partial_event = true;
            }
        }

        self.records.finish()?;

        if self.phase.accepts_events() {
            self.finalize_analyses()?;
            self.phase = RunPhase::Finalized;
        }
        info!(events = self.events, phase = ?self.phase, "run shut down");
        Ok(RunSummary {
            events: self.events,
            phase: self.phase,
            flushed_partial_event,
        })
    }

    fn finalize_analyses(&mut self) -> Result<(), ControllerError> {
        let Some(manager) = self
            .pipeline
            .as_mut()
            .and_then(|pipeline| pipeline.analyses.as_mut())
        else {
            return Ok(());
        };
        if manager.is_finalized() {
            return Ok(());
        }
        let result = manager
            .finalize_events()
            .and_then(|()| manager.write(&mut self.buckets));
        let events = manager.event_count();
        manager.terminate();
        match result {
            Ok(written) => {
                info!(events, written, "analyses finalized and written");
                self.phase = RunPhase::Finalized;
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "writing analyses failed");
                self.phase = RunPhase::Failed;
                Err(err.into())
            }
        }
    }

    const fn invalid(&self, operation: &'static str) -> ControllerError {
        ControllerError::InvalidPhase {
            operation,
            phase: self.phase,
        }
    }
}

/// The pipeline, if the phase accepts event data.
fn active<'p>(
    pipeline: &'p mut Option<Pipeline>,
    phase: RunPhase,
    operation: &'static str,
) -> Result<&'p mut Pipeline, ControllerError> {
    match pipeline {
        Some(pipeline) if phase.accepts_events() => Ok(pipeline),
        _ => Err(ControllerError::InvalidPhase { operation, phase }),
    }
}

fn flush_aggregators(
    pipeline: &mut Pipeline,
    records: &mut dyn RecordSink,
    lookups: &mut LookupTables,
    event: u64,
) -> Result<EventOutcome, ControllerError> {
    // Both aggregators flush, and so clear, before either error is reported.
    let steps = pipeline.steps.flush(records, lookups);
    let fields = pipeline.fields.flush(records, lookups);
    let (steps, fields) = (steps?, fields?);
    match (steps, fields) {
        (FlushOutcome::Reported(steps), FlushOutcome::Reported(fields)) => {
            Ok(EventOutcome::Summarized {
                event,
                steps,
                fields,
            })
        }
        (steps, fields) => Ok(EventOutcome::Persisted {
            event,
            steps: steps.persisted_records(),
            queries: fields.persisted_records(),
        }),
    }
}

fn analyse_event(pipeline: &mut Pipeline, lookups: &mut LookupTables) -> Result<u64, ControllerError> {
    let result = match pipeline.analyses.as_mut() {
        Some(manager) => manager.analyze_event(
            pipeline.steps.steps(),
            pipeline.fields.queries(),
            lookups,
        ),
        None => Ok(0),
    };
    pipeline.steps.clear_all(lookups);
    pipeline.fields.clear();
    Ok(result?)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::float_cmp
)]
mod tests {
    use steplog_analysis::output::MemoryBucketSink;
    use steplog_analysis::statistics::StatisticsOptions;
    use steplog_core::persist::{MemorySink, PersistedRecord};
    use steplog_types::{Parentage, ThreeVector, TrackId, VolumeId};

    use super::*;

    type TestController = RunController<MemorySink, MemoryBucketSink>;

    fn controller(yaml: &str) -> TestController {
        let config = SteplogConfig::parse_yaml(yaml).unwrap();
        let mut controller = RunController::new(config, MemorySink::new(), MemoryBucketSink::new());
        controller.init().unwrap();
        controller
    }

    fn step(track: u32, volume: u32) -> StepObservation {
        StepObservation::new(VolumeId(volume), TrackId(track))
            .with_names(format!("vol{volume}"), None)
            .with_particle(11, Parentage::Primary)
            .with_energy(1.0)
    }

    fn field(volume: u32) -> FieldObservation {
        FieldObservation {
            volume_id: VolumeId(volume),
            volume_name: None,
            position: ThreeVector::new(0.0, 0.0, 0.0),
            field: ThreeVector::new(0.0, 0.0, 0.5),
        }
    }

    #[test]
    fn operations_before_init_are_rejected() {
        let mut controller: TestController = RunController::new(
            SteplogConfig::default(),
            MemorySink::new(),
            MemoryBucketSink::new(),
        );
        assert!(matches!(
            controller.record_step(&step(1, 1)),
            Err(ControllerError::InvalidPhase {
                operation: "record_step",
                phase: RunPhase::Uninitialized
            })
        ));
        controller.init().unwrap();
        assert!(matches!(
            controller.init(),
            Err(ControllerError::InvalidPhase { .. })
        ));
    }

    #[test]
    fn phases_follow_event_boundaries() {
        let mut controller = controller("");
        assert_eq!(controller.phase(), RunPhase::Ready);
        controller.record_step(&step(1, 1)).unwrap();
        assert_eq!(controller.phase(), RunPhase::Accumulating);
        controller.end_event().unwrap();
        assert_eq!(controller.phase(), RunPhase::Flushed);
        assert_eq!(controller.events(), 1);
    }

    #[test]
    fn summary_mode_reports_each_event() {
        let mut controller = controller("mode: summary");
        controller.record_step(&step(1, 3)).unwrap();
        controller.record_step(&step(1, 3)).unwrap();
        controller.record_field_query(&field(3)).unwrap();
        let EventOutcome::Summarized { event, steps, fields } = controller.end_event().unwrap()
        else {
            panic!("expected a summary");
        };
        assert_eq!(event, 0);
        assert_eq!(steps.steps, 2);
        assert_eq!(steps.volume_step_total(), 2);
        assert_eq!(fields.event, 0);
        assert!(controller.records().records().is_empty());
    }

    #[test]
    fn stream_mode_persists_steps_and_linked_queries() {
        let mut controller = controller("mode: stream");
        controller.record_step(&step(1, 1)).unwrap();
        controller.record_step(&step(1, 2)).unwrap();
        controller.record_field_query(&field(2)).unwrap();
        controller.record_hit(7, None).unwrap();

        let outcome = controller.end_event().unwrap();
        assert_eq!(
            outcome,
            EventOutcome::Persisted {
                event: 0,
                steps: 2,
                queries: 1
            }
        );

        let records = controller.records().records();
        assert_eq!(records.len(), 2);
        let PersistedRecord::Steps { steps, .. } = &records[0] else {
            panic!("steps first");
        };
        assert_eq!(steps[1].detector_hit, Some(7));
        let PersistedRecord::Fields { queries, .. } = &records[1] else {
            panic!("fields second");
        };
        assert_eq!(queries[0].step_ref, Some(1));
        // Track-keyed lookups are per event.
        assert_eq!(controller.lookups().pdg(TrackId(1)), None);
        assert_eq!(controller.lookups().volume_name(VolumeId(2)), Some("vol2"));
    }

    #[test]
    fn hit_before_any_step_fails_the_run() {
        let mut controller = controller("mode: stream");
        assert!(matches!(
            controller.record_hit(1, None),
            Err(ControllerError::Aggregator { .. })
        ));
        assert_eq!(controller.phase(), RunPhase::Failed);
        assert!(matches!(
            controller.record_step(&step(1, 1)),
            Err(ControllerError::InvalidPhase { .. })
        ));
    }

    #[test]
    fn live_analysis_finalizes_once_at_target() {
        let mut controller = controller("mode: live_analysis\nanalysis:\n  target_events: 2\n");
        for expected in 1..=2_u64 {
            controller.record_step(&step(1, 1).as_new_track()).unwrap();
            let outcome = controller.end_event().unwrap();
            let EventOutcome::Analysed {
                analysed,
                finalized,
                ..
            } = outcome
            else {
                panic!("expected analysis");
            };
            assert_eq!(analysed, expected);
            assert_eq!(finalized, expected == 2);
        }
        assert_eq!(controller.phase(), RunPhase::Finalized);
        assert_eq!(controller.buckets().sets().len(), 1);
        assert_eq!(controller.buckets().sets()[0].events, 2);
        assert!(matches!(
            controller.end_event(),
            Err(ControllerError::InvalidPhase { .. })
        ));

        let summary = controller.shutdown().unwrap();
        assert_eq!(summary.phase, RunPhase::Finalized);
        assert_eq!(controller.buckets().sets().len(), 1);
    }

    #[test]
    fn shutdown_flushes_buffered_stream_data() {
        let mut controller = controller("mode: stream");
        controller.record_step(&step(1, 1)).unwrap();
        let summary = controller.shutdown().unwrap();
        assert!(summary.flushed_partial_event);
        assert_eq!(summary.events, 1);
        assert_eq!(controller.records().records().len(), 2);
        assert!(controller.records().is_finished());
        assert!(matches!(
            controller.shutdown(),
            Err(ControllerError::InvalidPhase { .. })
        ));
    }

    #[test]
    fn shutdown_writes_untargeted_analyses() {
        let mut controller = controller("mode: live_analysis");
        controller.record_step(&step(1, 1).as_new_track()).unwrap();
        controller.end_event().unwrap();
        controller.record_step(&step(2, 1).as_new_track()).unwrap();

        let summary = controller.shutdown().unwrap();
        assert!(!summary.flushed_partial_event);
        let set = controller.buckets().set("step_statistics").unwrap();
        assert_eq!(set.events, 1);
    }

    #[test]
    fn malformed_filter_runs_unfiltered() {
        let mut controller = controller(
            "mode: live_analysis\nanalysis:\n  target_events: 1\n  filter:\n    min_energy: 5.0\n    max_energy: 1.0\n",
        );
        controller.record_step(&step(1, 1).as_new_track()).unwrap();
        controller.end_event().unwrap();
        let set = controller.buckets().set("step_statistics").unwrap();
        assert_eq!(set.category("steps_per_volume").unwrap().get("vol1"), 1.0);
    }

    #[test]
    fn extra_analyses_register_only_when_ready() {
        let mut stream = controller("mode: stream");
        let analysis = Box::new(StepStatistics::new(StatisticsOptions::default(), None));
        assert!(matches!(
            stream.register_analysis(analysis),
            Err(ControllerError::InvalidPhase { .. })
        ));

        let mut live = controller("mode: live_analysis");
        let duplicate = Box::new(StepStatistics::new(StatisticsOptions::default(), None));
        assert!(matches!(
            live.register_analysis(duplicate),
            Err(ControllerError::Analysis { .. })
        ));
    }
}
