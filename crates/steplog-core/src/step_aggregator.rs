//! Per-event accumulation of steps.
//!
//! The aggregator runs on the simulation hot path: every call does a
//! constant amount of table and map work. In [`RunMode::Summary`] it keeps
//! only per-volume counters; otherwise it keeps the ordered list of
//! [`StepEvent`]s. Either way it enriches the [`LookupTables`] with what
//! the observation reveals about its volume and track.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use steplog_types::{ProcessCode, StepEvent, StepObservation, TrackId, VolumeId};
use tracing::{debug, warn};

use crate::config::RunMode;
use crate::geometry::GeometryCatalog;
use crate::lookup::LookupTables;
use crate::persist::{PersistError, PersistRequest, RecordSink};
use crate::report::{FlushOutcome, ProcessCount, StepSummaryReport, VolumeSummary};

/// Errors raised by the step aggregator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregatorError {
    /// A hit arrived before any step of the current event.
    #[error("hit for detector {detector} recorded before any step in event {event}")]
    EmptyStream {
        /// Detector that reported the hit.
        detector: u32,
        /// Zero-based event number.
        event: u64,
    },
}

/// What [`StepAggregator::record_hit`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitOutcome {
    /// The step with this sequence number now carries the hit.
    Marked {
        /// Sequence number of the marked step.
        seq: u64,
    },
    /// The hit counter of this volume was incremented.
    Counted {
        /// Volume of the most recent step.
        volume: VolumeId,
    },
    /// The referenced step does not exist; the hit was dropped.
    Skipped {
        /// Sequence number that could not be found.
        seq: u64,
    },
}

/// Per-volume counters kept in Summary mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct VolumeCounters {
    steps: u64,
    hits: u64,
    secondaries: u64,
}

/// Accumulates the steps of one event at a time.
#[derive(Debug)]
pub struct StepAggregator {
    mode: RunMode,
    catalog: GeometryCatalog,
    event: u64,
    recorded: u64,
    last_step_at: Option<Instant>,
    current_volume: Option<VolumeId>,
    steps: Vec<StepEvent>,
    volumes: HashMap<VolumeId, VolumeCounters>,
    processes: HashMap<(VolumeId, ProcessCode), u64>,
    volume_names: HashMap<VolumeId, String>,
    tracks: HashSet<TrackId>,
    particles: HashSet<i32>,
}

impl StepAggregator {
    /// Create an aggregator for the given mode.
    pub fn new(mode: RunMode, catalog: GeometryCatalog) -> Self {
        Self {
            mode,
            catalog,
            event: 0,
            recorded: 0,
            last_step_at: None,
            current_volume: None,
            steps: Vec::new(),
            volumes: HashMap::new(),
            processes: HashMap::new(),
            volume_names: HashMap::new(),
            tracks: HashSet::new(),
            particles: HashSet::new(),
        }
    }

    /// The mode fixed at construction.
    pub const fn mode(&self) -> RunMode {
        self.mode
    }

    /// Zero-based number of the event currently accumulating.
    pub const fn event(&self) -> u64 {
        self.event
    }

    /// Steps recorded in the current event.
    pub const fn recorded(&self) -> u64 {
        self.recorded
    }

    /// The retained steps of the current event (empty in Summary mode).
    pub fn steps(&self) -> &[StepEvent] {
        &self.steps
    }

    /// Sequence number of the most recent step, if any.
    pub const fn latest_sequence(&self) -> Option<u64> {
        self.recorded.checked_sub(1)
    }

    /// Record one step and return its sequence number.
    pub fn record_step(&mut self, obs: &StepObservation, lookups: &mut LookupTables) -> u64 {
        let seq = self.recorded;
        self.recorded = self.recorded.saturating_add(1);

        let now = Instant::now();
        let elapsed_ns = obs.elapsed_ns.unwrap_or_else(|| {
            self.last_step_at.map_or(0, |prev| {
                u64::try_from(now.duration_since(prev).as_nanos()).unwrap_or(u64::MAX)
            })
        });
        self.last_step_at = Some(now);
        self.current_volume = Some(obs.volume_id);

        self.enrich(obs, lookups);

        if self.mode.retains_steps() {
            self.steps
                .push(StepEvent::from_observation(seq, obs, elapsed_ns));
        } else {
            self.count(obs, lookups);
        }
        seq
    }

    /// Attach a detector hit to a step.
    ///
    /// Without `seq` the most recent step is marked. In Summary mode the
    /// current volume's hit counter is incremented instead.
    pub fn record_hit(
        &mut self,
        detector: u32,
        seq: Option<u64>,
    ) -> Result<HitOutcome, AggregatorError> {
        let Some(latest) = self.latest_sequence() else {
            return Err(AggregatorError::EmptyStream {
                detector,
                event: self.event,
            });
        };

        if !self.mode.retains_steps() {
            return Ok(self.count_hit(latest));
        }

        let target = seq.unwrap_or(latest);
        let slot = usize::try_from(target)
            .ok()
            .and_then(|idx| self.steps.get_mut(idx));
        match slot {
            Some(step) => {
                step.detector_hit = Some(detector);
                Ok(HitOutcome::Marked { seq: target })
            }
            None => {
                warn!(detector, seq = target, "hit references unknown step, skipped");
                Ok(HitOutcome::Skipped { seq: target })
            }
        }
    }

    /// End the event: report or persist, then clear.
    ///
    /// In Summary mode the counters are logged and returned as a report.
    /// Otherwise the steps and lookups go to `sink`. In both cases the
    /// aggregator and the per-track lookups are cleared, even when the sink
    /// fails, so track ids reused by the next event start from empty slots.
    pub fn flush(
        &mut self,
        sink: &mut dyn RecordSink,
        lookups: &mut LookupTables,
    ) -> Result<FlushOutcome<StepSummaryReport>, PersistError> {
        if !self.mode.retains_steps() {
            let report = self.summarize(lookups);
            report.log();
            self.clear_all(lookups);
            return Ok(FlushOutcome::Reported(report));
        }

        let records = self.steps.len();
        let result = sink.persist(PersistRequest::Steps {
            event: self.event,
            steps: &self.steps,
            lookups: &*lookups,
        });
        self.clear_all(lookups);
        result?;
        Ok(FlushOutcome::Persisted { records })
    }

    /// Reset all per-event state and advance to the next event.
    ///
    /// Lookup tables are not touched.
    pub fn clear(&mut self) {
        debug!(event = self.event, steps = self.recorded, "step aggregator cleared");
        self.event = self.event.saturating_add(1);
        self.recorded = 0;
        self.last_step_at = None;
        self.current_volume = None;
        self.steps.clear();
        self.volumes.clear();
        self.processes.clear();
        self.volume_names.clear();
        self.tracks.clear();
        self.particles.clear();
    }

    /// Clear the event and the per-track lookups once they have been reported,
    /// persisted or analysed.
    pub fn clear_all(&mut self, lookups: &mut LookupTables) {
        lookups.clear_per_track_fields();
        self.clear();
    }

    fn count_hit(&mut self, latest: u64) -> HitOutcome {
        let Some(volume) = self.current_volume else {
            return HitOutcome::Skipped { seq: latest };
        };
        let counters = self.volumes.entry(volume).or_default();
        counters.hits = counters.hits.saturating_add(1);
        HitOutcome::Counted { volume }
    }

    fn enrich(&self, obs: &StepObservation, lookups: &mut LookupTables) {
        if let Some(name) = obs.volume_name.as_deref() {
            lookups.register_volume(
                obs.volume_id,
                name,
                obs.medium_name.as_deref(),
                &self.catalog,
            );
        }
        let track = obs.track_id;
        lookups.record_pdg(track, obs.pdg);
        lookups.record_parent(track, obs.parent);
        lookups.increment_step_count(track);
        lookups.record_start_energy(track, obs.energy);
        lookups.record_origin(track, obs.volume_id);
        if obs.crossed_boundary {
            lookups.set_crossed_boundary(track, true);
        }
        if !obs.secondary_processes.is_empty() {
            lookups.set_produced_secondary(track, true);
        }
    }

    fn count(&mut self, obs: &StepObservation, lookups: &LookupTables) {
        let volume = obs.volume_id;
        self.tracks.insert(obs.track_id);
        self.particles.insert(obs.pdg);

        let counters = self.volumes.entry(volume).or_default();
        counters.steps = counters.steps.saturating_add(1);
        counters.secondaries = counters
            .secondaries
            .saturating_add(u64::from(obs.n_secondaries()));

        for process in &obs.secondary_processes {
            let count = self.processes.entry((volume, *process)).or_insert(0);
            *count = count.saturating_add(1);
        }

        if !self.volume_names.contains_key(&volume) {
            let name = obs
                .volume_name
                .clone()
                .unwrap_or_else(|| lookups.volume_label(volume).to_owned());
            self.volume_names.insert(volume, name);
        }
    }

    fn summarize(&self, lookups: &LookupTables) -> StepSummaryReport {
        let mut by_volume: BTreeMap<VolumeId, Vec<ProcessCount>> = BTreeMap::new();
        for ((volume, process), count) in &self.processes {
            by_volume.entry(*volume).or_default().push(ProcessCount {
                process: process.name().to_owned(),
                count: *count,
            });
        }

        let mut volumes: Vec<VolumeSummary> = self
            .volumes
            .iter()
            .map(|(volume, counters)| {
                let mut processes = by_volume.remove(volume).unwrap_or_default();
                processes.sort_by(|a, b| b.count.cmp(&a.count).then(a.process.cmp(&b.process)));
                VolumeSummary {
                    volume: *volume,
                    name: self
                        .volume_names
                        .get(volume)
                        .cloned()
                        .unwrap_or_else(|| lookups.volume_label(*volume).to_owned()),
                    steps: counters.steps,
                    hits: counters.hits,
                    secondaries: counters.secondaries,
                    processes,
                }
            })
            .collect();
        volumes.sort_by_key(|v| v.volume);

        StepSummaryReport {
            event: self.event,
            steps: self.recorded,
            distinct_tracks: self.tracks.len(),
            distinct_particles: self.particles.len(),
            volumes,
        }
    }
}
