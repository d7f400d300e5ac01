//! Step statistics: the track-lifecycle analysis.
//!
//! Each event is walked once, in sequence order. Besides plain per-step
//! counters, the pass keeps a small cursor of state that carries across
//! steps of the same event:
//!
//! - the previous step's volume and module, for transition buckets;
//! - the last accepted track, to detect the first step of a track;
//! - the progress of the current track: whether it left the module it
//!   started in, how many steps it took before that, and (for secondaries)
//!   the context needed to classify it once it ends.
//!
//! A track is considered ended when the next new track starts. A
//! secondary that never left its origin module is "produced and killed"
//! there; otherwise it "survived". The last secondary of an event has no
//! successor, so it is classified at the end of the event unless
//! [`StatisticsOptions::classify_final_track`] is off.
//!
//! Steps rejected by the filter update no bucket, but their volume and
//! module still become the "previous" reference for the next accepted
//! step.

use std::borrow::Cow;

use steplog_core::config::AnalysisConfig;
use steplog_core::lookup::LookupTables;
use steplog_types::{FieldQueryEvent, StepEvent, TrackId, UNKNOWN_LABEL};
use tracing::debug;

use crate::analysis::StepAnalysis;
use crate::bucket::{
    Bucket, BucketSet, CategoryBucket, CategoryHistogram, CoOccurrenceBucket, Histogram1D,
    Histogram2D, RankedBucket, UniformAxis,
};
use crate::filter::{filter_from_config, StepFilter};

/// Name under which [`StepStatistics`] registers and writes its output.
pub const STEP_STATISTICS: &str = "step_statistics";

const POSITION_AXIS: UniformAxis = UniformAxis::new(30, -3000.0, 3000.0);
const LOG_ENERGY_AXIS: UniformAxis = UniformAxis::new(400, -10.0, 4.0);
const MOMENTUM_AXIS: UniformAxis = UniformAxis::new(400, -0.2, 0.2);
const TERMINAL_ENERGY_AXIS: UniformAxis = UniformAxis::new(40, 0.0, 1.0);
const OCCUPANCY_Z_AXIS: UniformAxis = UniformAxis::new(200, -3000.0, 3000.0);
const OCCUPANCY_R_AXIS: UniformAxis = UniformAxis::new(200, 0.0, 3000.0);
const OCCUPANCY_XY_AXIS: UniformAxis = UniformAxis::new(200, -3000.0, 3000.0);

/// Tunables for [`StepStatistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatisticsOptions {
    /// Number of labels kept in the sorted top-N buckets.
    pub top_n: usize,
    /// Classify the pending secondary at the end of each event.
    pub classify_final_track: bool,
    /// Keep every accepted step for output.
    pub retain_raw_steps: bool,
}

impl Default for StatisticsOptions {
    fn default() -> Self {
        Self {
            top_n: 30,
            classify_final_track: true,
            retain_raw_steps: false,
        }
    }
}

impl From<&AnalysisConfig> for StatisticsOptions {
    fn from(config: &AnalysisConfig) -> Self {
        Self {
            top_n: config.top_volumes,
            classify_final_track: config.classify_final_track,
            retain_raw_steps: config.retain_raw_steps,
        }
    }
}

// ---------------------------------------------------------------------------
// Bucket groups
// ---------------------------------------------------------------------------

/// Position, energy and momentum distributions of a set of steps.
#[derive(Debug, Clone)]
struct SpatialSet {
    x: Histogram1D,
    y: Histogram1D,
    z: Histogram1D,
    log_energy: Histogram1D,
    px: Histogram1D,
    py: Histogram1D,
    pz: Histogram1D,
}

impl SpatialSet {
    fn new() -> Self {
        Self {
            x: Histogram1D::new(POSITION_AXIS),
            y: Histogram1D::new(POSITION_AXIS),
            z: Histogram1D::new(POSITION_AXIS),
            log_energy: Histogram1D::new(LOG_ENERGY_AXIS),
            px: Histogram1D::new(MOMENTUM_AXIS),
            py: Histogram1D::new(MOMENTUM_AXIS),
            pz: Histogram1D::new(MOMENTUM_AXIS),
        }
    }

    fn fill(&mut self, step: &StepEvent) {
        self.x.fill(f64::from(step.position.x));
        self.y.fill(f64::from(step.position.y));
        self.z.fill(f64::from(step.position.z));
        self.log_energy.fill(log_energy(step.energy));
        self.px.fill(f64::from(step.momentum.x));
        self.py.fill(f64::from(step.momentum.y));
        self.pz.fill(f64::from(step.momentum.z));
    }

    fn export(&self, prefix: &str, set: &mut BucketSet) {
        for (suffix, hist) in [
            ("x", &self.x),
            ("y", &self.y),
            ("z", &self.z),
            ("log_energy", &self.log_energy),
            ("px", &self.px),
            ("py", &self.py),
            ("pz", &self.pz),
        ] {
            set.insert(&format!("{prefix}_{suffix}"), Bucket::Numeric(hist.clone()));
        }
    }
}

/// Bucket pair for a classification outcome (killed or survived).
#[derive(Debug, Clone)]
struct OutcomeBuckets {
    per_module: CategoryBucket,
    particle_vs_module: CoOccurrenceBucket,
    energy_vs_module: CategoryHistogram,
}

impl OutcomeBuckets {
    fn new() -> Self {
        Self {
            per_module: CategoryBucket::new(),
            particle_vs_module: CoOccurrenceBucket::new("module", "particle"),
            energy_vs_module: CategoryHistogram::new(TERMINAL_ENERGY_AXIS),
        }
    }

    fn fill(&mut self, secondary: &SecondaryContext<'_>) {
        self.per_module.fill(secondary.origin_module, 1.0);
        self.particle_vs_module
            .fill(secondary.origin_module, &secondary.particle, 1.0);
        self.energy_vs_module.fill(
            secondary.origin_module,
            f64::from(secondary.terminal_energy),
        );
    }

    fn compress(&mut self) {
        self.per_module.compress();
        self.particle_vs_module.compress();
        self.energy_vs_module.compress();
    }

    fn export(&self, outcome: &str, set: &mut BucketSet) {
        set.insert(
            &format!("produced_and_{outcome}_per_module"),
            Bucket::Category(self.per_module.clone()),
        );
        set.insert(
            &format!("produced_and_{outcome}_particle_vs_module"),
            Bucket::CoOccurrence(self.particle_vs_module.clone()),
        );
        set.insert(
            &format!("produced_and_{outcome}_energy_vs_module"),
            Bucket::CategoryNumeric(self.energy_vs_module.clone()),
        );
    }
}

/// Transition buckets at one granularity (volume or module).
#[derive(Debug, Clone)]
struct TransitionBuckets {
    traversed_before: CategoryBucket,
    versus_origin: CoOccurrenceBucket,
    versus_current: CoOccurrenceBucket,
}

impl TransitionBuckets {
    fn new() -> Self {
        Self {
            traversed_before: CategoryBucket::new(),
            versus_origin: CoOccurrenceBucket::new("origins", "traversed before"),
            versus_current: CoOccurrenceBucket::new("traversed before", "current"),
        }
    }

    fn fill(&mut self, origin: &str, previous: &str, current: &str) {
        self.traversed_before.fill(previous, 1.0);
        self.versus_origin.fill(origin, previous, 1.0);
        self.versus_current.fill(previous, current, 1.0);
    }

    fn compress(&mut self) {
        self.traversed_before.compress();
        self.versus_origin.compress();
        self.versus_current.compress();
    }

    fn export(&self, granularity: &str, set: &mut BucketSet) {
        set.insert(
            &format!("traversed_before_per_{granularity}"),
            Bucket::Category(self.traversed_before.clone()),
        );
        set.insert(
            &format!("traversed_before_vs_origin_per_{granularity}"),
            Bucket::CoOccurrence(self.versus_origin.clone()),
        );
        set.insert(
            &format!("traversed_before_vs_current_per_{granularity}"),
            Bucket::CoOccurrence(self.versus_current.clone()),
        );
    }
}

/// Everything [`StepStatistics`] accumulates across events.
#[derive(Debug, Clone)]
struct StatisticsBuckets {
    steps_per_module: CategoryBucket,
    steps_per_volume: CategoryBucket,
    steps_per_particle: CategoryBucket,
    hits_per_module: CategoryBucket,
    hits_per_volume: CategoryBucket,
    secondaries_per_module: CategoryBucket,
    secondaries_per_volume: CategoryBucket,
    secondaries_per_particle: CategoryBucket,
    origins_per_module: CategoryBucket,
    origins_per_volume: CategoryBucket,
    secondary_origins_per_module: CategoryBucket,
    secondary_origins_per_volume: CategoryBucket,
    track_energy_spectrum: Histogram1D,
    track_particle_spectrum: CategoryBucket,
    track_production_process: CategoryBucket,
    time_per_module: CategoryBucket,
    time_per_particle: CategoryBucket,
    steps_only_inside_per_module: CategoryBucket,
    particle_vs_module: CoOccurrenceBucket,
    rz_occupancy: Histogram2D,
    xy_occupancy: Histogram2D,
    volume_transitions: TransitionBuckets,
    module_transitions: TransitionBuckets,
    killed: OutcomeBuckets,
    survived: OutcomeBuckets,
    step_distributions: SpatialSet,
    hit_distributions: SpatialSet,
    steps_per_volume_top: RankedBucket,
    origins_per_volume_top: RankedBucket,
    track_particle_spectrum_top: RankedBucket,
}

impl StatisticsBuckets {
    fn new() -> Self {
        Self {
            steps_per_module: CategoryBucket::new(),
            steps_per_volume: CategoryBucket::new(),
            steps_per_particle: CategoryBucket::new(),
            hits_per_module: CategoryBucket::new(),
            hits_per_volume: CategoryBucket::new(),
            secondaries_per_module: CategoryBucket::new(),
            secondaries_per_volume: CategoryBucket::new(),
            secondaries_per_particle: CategoryBucket::new(),
            origins_per_module: CategoryBucket::new(),
            origins_per_volume: CategoryBucket::new(),
            secondary_origins_per_module: CategoryBucket::new(),
            secondary_origins_per_volume: CategoryBucket::new(),
            track_energy_spectrum: Histogram1D::new(LOG_ENERGY_AXIS),
            track_particle_spectrum: CategoryBucket::new(),
            track_production_process: CategoryBucket::new(),
            time_per_module: CategoryBucket::new(),
            time_per_particle: CategoryBucket::new(),
            steps_only_inside_per_module: CategoryBucket::new(),
            particle_vs_module: CoOccurrenceBucket::new("module", "particle"),
            rz_occupancy: Histogram2D::new(OCCUPANCY_Z_AXIS, OCCUPANCY_R_AXIS),
            xy_occupancy: Histogram2D::new(OCCUPANCY_XY_AXIS, OCCUPANCY_XY_AXIS),
            volume_transitions: TransitionBuckets::new(),
            module_transitions: TransitionBuckets::new(),
            killed: OutcomeBuckets::new(),
            survived: OutcomeBuckets::new(),
            step_distributions: SpatialSet::new(),
            hit_distributions: SpatialSet::new(),
            steps_per_volume_top: RankedBucket::default(),
            origins_per_volume_top: RankedBucket::default(),
            track_particle_spectrum_top: RankedBucket::default(),
        }
    }

    /// Close a secondary's lifecycle.
    #[allow(clippy::cast_precision_loss)]
    fn classify(&mut self, progress: &TrackProgress<'_>) {
        let Some(secondary) = &progress.secondary else {
            return;
        };
        if progress.changed_module {
            self.survived.fill(secondary);
        } else {
            self.killed.fill(secondary);
            self.steps_only_inside_per_module
                .fill(secondary.origin_module, progress.steps_inside as f64);
        }
    }

    fn finalize(&mut self, top_n: usize) {
        self.steps_per_volume_top = self.steps_per_volume.top(top_n);
        self.origins_per_volume_top = self.origins_per_volume.top(top_n);
        self.track_particle_spectrum_top = self.track_particle_spectrum.top(top_n);

        for bucket in [
            &mut self.steps_per_module,
            &mut self.steps_per_volume,
            &mut self.steps_per_particle,
            &mut self.hits_per_module,
            &mut self.hits_per_volume,
            &mut self.secondaries_per_module,
            &mut self.secondaries_per_volume,
            &mut self.secondaries_per_particle,
            &mut self.origins_per_module,
            &mut self.origins_per_volume,
            &mut self.secondary_origins_per_module,
            &mut self.secondary_origins_per_volume,
            &mut self.track_particle_spectrum,
            &mut self.track_production_process,
            &mut self.time_per_module,
            &mut self.time_per_particle,
            &mut self.steps_only_inside_per_module,
        ] {
            bucket.compress();
        }
        self.particle_vs_module.compress();
        self.volume_transitions.compress();
        self.module_transitions.compress();
        self.killed.compress();
        self.survived.compress();
    }

    fn export(&self) -> BucketSet {
        let mut set = BucketSet::new(STEP_STATISTICS);
        for (name, bucket) in [
            ("steps_per_module", &self.steps_per_module),
            ("steps_per_volume", &self.steps_per_volume),
            ("steps_per_particle", &self.steps_per_particle),
            ("hits_per_module", &self.hits_per_module),
            ("hits_per_volume", &self.hits_per_volume),
            ("secondaries_per_module", &self.secondaries_per_module),
            ("secondaries_per_volume", &self.secondaries_per_volume),
            ("secondaries_per_particle", &self.secondaries_per_particle),
            ("origins_per_module", &self.origins_per_module),
            ("origins_per_volume", &self.origins_per_volume),
            ("secondary_origins_per_module", &self.secondary_origins_per_module),
            ("secondary_origins_per_volume", &self.secondary_origins_per_volume),
            ("track_particle_spectrum", &self.track_particle_spectrum),
            ("track_production_process", &self.track_production_process),
            ("time_per_module", &self.time_per_module),
            ("time_per_particle", &self.time_per_particle),
            ("steps_only_inside_per_module", &self.steps_only_inside_per_module),
        ] {
            set.insert(name, Bucket::Category(bucket.clone()));
        }
        for (name, ranked) in [
            ("steps_per_volume_top", &self.steps_per_volume_top),
            ("origins_per_volume_top", &self.origins_per_volume_top),
            ("track_particle_spectrum_top", &self.track_particle_spectrum_top),
        ] {
            set.insert(name, Bucket::Ranked(ranked.clone()));
        }
        set.insert(
            "track_energy_spectrum",
            Bucket::Numeric(self.track_energy_spectrum.clone()),
        );
        set.insert("rz_occupancy", Bucket::Grid(self.rz_occupancy.clone()));
        set.insert("xy_occupancy", Bucket::Grid(self.xy_occupancy.clone()));
        set.insert(
            "particle_vs_module",
            Bucket::CoOccurrence(self.particle_vs_module.clone()),
        );
        self.volume_transitions.export("volume", &mut set);
        self.module_transitions.export("module", &mut set);
        self.killed.export("killed", &mut set);
        self.survived.export("survived", &mut set);
        self.step_distributions.export("steps", &mut set);
        self.hit_distributions.export("hits", &mut set);
        set
    }
}

// ---------------------------------------------------------------------------
// Per-event cursor
// ---------------------------------------------------------------------------

/// What is needed to classify a secondary once it ends.
#[derive(Debug, Clone)]
struct SecondaryContext<'l> {
    origin_module: &'l str,
    particle: Cow<'static, str>,
    terminal_energy: f32,
}

/// Lifecycle state of the track currently being walked.
#[derive(Debug, Clone)]
struct TrackProgress<'l> {
    track: TrackId,
    changed_module: bool,
    steps_inside: u64,
    secondary: Option<SecondaryContext<'l>>,
}

/// Resolved labels of one step.
struct StepLabels<'l> {
    volume: &'l str,
    module: &'l str,
    particle: Cow<'static, str>,
    origin_volume: &'l str,
    origin_module: &'l str,
}

impl<'l> StepLabels<'l> {
    fn resolve(step: &StepEvent, lookups: &'l LookupTables) -> Self {
        let origin = lookups.origin_volume(step.track_id);
        Self {
            volume: lookups.volume_label(step.volume_id),
            module: lookups.module_label(step.volume_id),
            particle: lookups.particle_label(step.track_id),
            origin_volume: origin.map_or(UNKNOWN_LABEL, |v| lookups.volume_label(v)),
            origin_module: origin.map_or(UNKNOWN_LABEL, |v| lookups.module_label(v)),
        }
    }
}

fn log_energy(energy: f32) -> f64 {
    f64::from(energy).log10()
}

// ---------------------------------------------------------------------------
// StepStatistics
// ---------------------------------------------------------------------------

/// Per-module, per-volume and per-particle statistics with track lifecycle
/// bookkeeping.
pub struct StepStatistics {
    options: StatisticsOptions,
    filter: Option<Box<dyn StepFilter>>,
    buckets: StatisticsBuckets,
    retained: Vec<StepEvent>,
    rejected: u64,
    finalized: bool,
}

impl std::fmt::Debug for StepStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepStatistics")
            .field("options", &self.options)
            .field("filtered", &self.filter.is_some())
            .field("retained", &self.retained.len())
            .field("rejected", &self.rejected)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

impl StepStatistics {
    /// Create the analysis. The filter, if any, is fixed for the whole run.
    pub fn new(options: StatisticsOptions, filter: Option<Box<dyn StepFilter>>) -> Self {
        Self {
            options,
            filter,
            buckets: StatisticsBuckets::new(),
            retained: Vec::new(),
            rejected: 0,
            finalized: false,
        }
    }

    /// Build from the analysis configuration, compiling its filter if any.
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self::new(
            StatisticsOptions::from(config),
            filter_from_config(config.filter.as_ref()),
        )
    }

    /// Steps rejected by the filter so far.
    pub const fn rejected_steps(&self) -> u64 {
        self.rejected
    }

    fn walk_event(&mut self, steps: &[StepEvent], lookups: &LookupTables) {
        let filter = self.filter.as_deref();
        let buckets = &mut self.buckets;

        let mut previous_volume: Option<&str> = None;
        let mut previous_module: Option<&str> = None;
        let mut last_track: Option<TrackId> = None;
        let mut progress: Option<TrackProgress<'_>> = None;

        for step in steps {
            let labels = StepLabels::resolve(step, lookups);

            if let Some(filter) = filter {
                let pdg = lookups.pdg(step.track_id);
                if !filter.accept(step, labels.volume, labels.module, pdg, lookups) {
                    self.rejected = self.rejected.saturating_add(1);
                    previous_volume = Some(labels.volume);
                    previous_module = Some(labels.module);
                    continue;
                }
            }

            let first_seen = last_track != Some(step.track_id);
            last_track = Some(step.track_id);
            let new_track = first_seen && step.flags.new_track;
            if new_track {
                previous_volume = Some(labels.volume);
                previous_module = Some(labels.module);
            }

            if first_seen {
                buckets
                    .track_energy_spectrum
                    .fill(log_energy(step.energy));
                buckets.track_particle_spectrum.fill(&labels.particle, 1.0);
                buckets
                    .track_production_process
                    .fill(step.prod_process.name(), 1.0);
                buckets.origins_per_module.fill(labels.origin_module, 1.0);
                buckets.origins_per_volume.fill(labels.origin_volume, 1.0);
                if step.parent.is_secondary() {
                    buckets
                        .secondary_origins_per_module
                        .fill(labels.origin_module, 1.0);
                    buckets
                        .secondary_origins_per_volume
                        .fill(labels.origin_volume, 1.0);
                }
            }

            // A module change implies a volume change, so the module check nests.
            if let Some(previous) = previous_volume {
                if previous != labels.volume || new_track {
                    buckets
                        .volume_transitions
                        .fill(labels.origin_volume, previous, labels.volume);
                    if let Some(previous) = previous_module {
                        if previous != labels.module || new_track {
                            buckets.module_transitions.fill(
                                labels.origin_module,
                                previous,
                                labels.module,
                            );
                        }
                    }
                }
            }

            if new_track {
                if let Some(ended) = progress.take() {
                    buckets.classify(&ended);
                }
                progress = Some(TrackProgress {
                    track: step.track_id,
                    changed_module: false,
                    steps_inside: 0,
                    secondary: step.parent.is_secondary().then(|| SecondaryContext {
                        origin_module: labels.module,
                        particle: labels.particle.clone(),
                        terminal_energy: step.energy,
                    }),
                });
            }
            if let Some(current) = progress.as_mut().filter(|p| p.track == step.track_id) {
                if previous_module.is_some_and(|previous| previous != labels.module) {
                    current.changed_module = true;
                }
                if !current.changed_module {
                    current.steps_inside = current.steps_inside.saturating_add(1);
                }
                if let Some(secondary) = current.secondary.as_mut() {
                    secondary.terminal_energy = step.energy;
                }
            }

            previous_volume = Some(labels.volume);
            previous_module = Some(labels.module);

            Self::fill_step(buckets, step, &labels);
            if self.options.retain_raw_steps {
                self.retained.push(step.clone());
            }
        }

        if self.options.classify_final_track {
            if let Some(ended) = progress.take() {
                buckets.classify(&ended);
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn fill_step(buckets: &mut StatisticsBuckets, step: &StepEvent, labels: &StepLabels<'_>) {
        let secondaries = f64::from(step.n_secondaries);
        let elapsed_us = step.elapsed_ns as f64 / 1000.0;

        buckets.steps_per_module.fill(labels.module, 1.0);
        buckets.steps_per_volume.fill(labels.volume, 1.0);
        buckets.steps_per_particle.fill(&labels.particle, 1.0);
        buckets.secondaries_per_module.fill(labels.module, secondaries);
        buckets.secondaries_per_volume.fill(labels.volume, secondaries);
        buckets
            .secondaries_per_particle
            .fill(&labels.particle, secondaries);
        buckets.time_per_module.fill(labels.module, elapsed_us);
        buckets.time_per_particle.fill(&labels.particle, elapsed_us);

        let position = step.position;
        buckets
            .rz_occupancy
            .fill(f64::from(position.z), f64::from(position.radial()));
        buckets
            .xy_occupancy
            .fill(f64::from(position.x), f64::from(position.y));
        buckets.step_distributions.fill(step);

        if step.has_hit() {
            buckets.hits_per_module.fill(labels.module, 1.0);
            buckets.hits_per_volume.fill(labels.volume, 1.0);
            buckets.hit_distributions.fill(step);
        }

        buckets
            .particle_vs_module
            .fill(labels.module, &labels.particle, 1.0);
    }
}

impl StepAnalysis for StepStatistics {
    fn name(&self) -> &str {
        STEP_STATISTICS
    }

    fn initialize(&mut self) {
        debug!(
            filtered = self.filter.is_some(),
            top_n = self.options.top_n,
            "step statistics initialized"
        );
    }

    fn analyze(&mut self, steps: &[StepEvent], _queries: &[FieldQueryEvent], lookups: &LookupTables) {
        self.walk_event(steps, lookups);
    }

    fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.buckets.finalize(self.options.top_n);
        self.finalized = true;
        debug!(
            rejected = self.rejected,
            retained = self.retained.len(),
            "step statistics finalized"
        );
    }

    fn buckets(&self) -> BucketSet {
        self.buckets.export()
    }

    fn retained_steps(&self) -> &[StepEvent] {
        &self.retained
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use steplog_core::geometry::GeometryCatalog;
    use steplog_types::{Parentage, StepObservation, VolumeId};

    use super::*;

    /// Builds events and the lookups the aggregator would have produced.
    struct EventBuilder {
        catalog: GeometryCatalog,
        lookups: LookupTables,
        steps: Vec<StepEvent>,
    }

    impl EventBuilder {
        fn new(catalog: GeometryCatalog) -> Self {
            Self {
                catalog,
                lookups: LookupTables::new(),
                steps: Vec::new(),
            }
        }

        fn step(&mut self, obs: StepObservation) -> &mut Self {
            if let Some(name) = obs.volume_name.as_deref() {
                self.lookups
                    .register_volume(obs.volume_id, name, None, &self.catalog);
            }
            self.lookups.record_pdg(obs.track_id, obs.pdg);
            self.lookups.record_parent(obs.track_id, obs.parent);
            self.lookups.record_origin(obs.track_id, obs.volume_id);
            let seq = u64::try_from(self.steps.len()).unwrap();
            self.steps.push(StepEvent::from_observation(seq, &obs, 1000));
            self
        }
    }

    fn obs(track: u32, volume: u32) -> StepObservation {
        StepObservation::new(VolumeId(volume), TrackId(track))
            .with_names(format!("vol{volume}"), None)
            .with_particle(11, Parentage::Primary)
            .with_energy(0.5)
    }

    fn secondary(track: u32, volume: u32, parent: u32) -> StepObservation {
        obs(track, volume)
            .with_particle(22, Parentage::Secondary(TrackId(parent)))
            .as_new_track()
    }

    fn run(builder: &EventBuilder, options: StatisticsOptions) -> BucketSet {
        let mut stats = StepStatistics::new(options, None);
        stats.analyze(&builder.steps, &[], &builder.lookups);
        stats.finalize();
        stats.buckets()
    }

    #[test]
    fn scenario_counts_steps_transitions_and_origins() {
        let mut event = EventBuilder::new(GeometryCatalog::new());
        event
            .step(obs(1, 10).as_new_track())
            .step(obs(1, 10))
            .step(obs(1, 20))
            .step(secondary(2, 20, 1));

        let set = run(&event, StatisticsOptions::default());

        let per_volume = set.category("steps_per_volume").unwrap();
        assert_eq!(per_volume.get("vol10"), 2.0);
        assert_eq!(per_volume.get("vol20"), 2.0);

        // New tracks count as origin-to-origin transitions.
        let traversed = set.category("traversed_before_per_volume").unwrap();
        assert_eq!(traversed.get("vol10"), 2.0);
        assert_eq!(traversed.get("vol20"), 1.0);
        assert_eq!(traversed.len(), 2);

        let transitions = set
            .co_occurrence("traversed_before_vs_current_per_volume")
            .unwrap();
        assert_eq!(transitions.get("vol10", "vol10"), 1.0);
        assert_eq!(transitions.get("vol10", "vol20"), 1.0);
        assert_eq!(transitions.get("vol20", "vol20"), 1.0);
        assert_eq!(transitions.get("vol20", "vol10"), 0.0);

        let versus_origin = set
            .co_occurrence("traversed_before_vs_origin_per_volume")
            .unwrap();
        assert_eq!(versus_origin.get("vol10", "vol10"), 2.0);
        assert_eq!(versus_origin.get("vol20", "vol20"), 1.0);

        // Without a module map every volume is in the unknown module, so only
        // the two new tracks register module transitions.
        assert_eq!(
            set.category("traversed_before_per_module")
                .unwrap()
                .get(UNKNOWN_LABEL),
            2.0
        );

        let origins = set.category("origins_per_volume").unwrap();
        assert_eq!(origins.get("vol10"), 1.0);
        assert_eq!(origins.get("vol20"), 1.0);
        let spectrum = set.category("track_particle_spectrum").unwrap();
        assert_eq!(spectrum.get("e-"), 1.0);
        assert_eq!(spectrum.get("gamma"), 1.0);

        let secondary_origins = set.category("secondary_origins_per_volume").unwrap();
        assert_eq!(secondary_origins.get("vol20"), 1.0);
        assert_eq!(secondary_origins.len(), 1);
    }

    #[test]
    fn filtered_step_still_becomes_previous_volume() {
        let mut event = EventBuilder::new(GeometryCatalog::new());
        event.step(obs(1, 1)).step(obs(1, 2)).step(obs(1, 3));
        let reject_vol2 = |step: &StepEvent, _: &str, _: &str, _: Option<i32>, _: &LookupTables| {
            step.volume_id != VolumeId(2)
        };

        let mut stats = StepStatistics::new(StatisticsOptions::default(), Some(Box::new(reject_vol2)));
        stats.analyze(&event.steps, &[], &event.lookups);
        stats.finalize();
        let set = stats.buckets();

        let traversed = set.category("traversed_before_per_volume").unwrap();
        assert_eq!(traversed.get("vol2"), 1.0);
        assert!(!traversed.contains("vol1"));
        let vs_current = set
            .co_occurrence("traversed_before_vs_current_per_volume")
            .unwrap();
        assert_eq!(vs_current.get("vol2", "vol3"), 1.0);
        assert!(!vs_current.contains("vol1", "vol3"));

        let per_volume = set.category("steps_per_volume").unwrap();
        assert!(!per_volume.contains("vol2"));
        assert_eq!(per_volume.total(), 2.0);
        assert_eq!(stats.rejected_steps(), 1);
    }

    #[test]
    fn secondary_staying_in_module_is_killed() {
        let catalog = GeometryCatalog::new()
            .with_module("vol20", "TPC")
            .with_module("vol21", "TPC")
            .with_module("vol30", "TRD");
        let mut event = EventBuilder::new(catalog);
        event
            .step(obs(1, 20).as_new_track())
            .step(secondary(2, 20, 1))
            .step(obs(2, 21).with_particle(22, Parentage::Secondary(TrackId(1))))
            .step(secondary(3, 30, 1));

        let set = run(
            &event,
            StatisticsOptions {
                classify_final_track: false,
                ..StatisticsOptions::default()
            },
        );

        let killed = set.category("produced_and_killed_per_module").unwrap();
        assert_eq!(killed.get("TPC"), 1.0);
        assert_eq!(killed.len(), 1);
        assert_eq!(
            set.category("steps_only_inside_per_module")
                .unwrap()
                .get("TPC"),
            2.0
        );
        assert_eq!(
            set.co_occurrence("produced_and_killed_particle_vs_module")
                .unwrap()
                .get("TPC", "gamma"),
            1.0
        );
        assert!(set
            .category("produced_and_survived_per_module")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn secondary_leaving_module_survives() {
        let catalog = GeometryCatalog::new()
            .with_module("vol20", "TPC")
            .with_module("vol30", "TRD");
        let mut event = EventBuilder::new(catalog);
        event
            .step(obs(1, 20).as_new_track())
            .step(secondary(2, 20, 1))
            .step(obs(2, 30).with_particle(22, Parentage::Secondary(TrackId(1))))
            .step(obs(3, 30).as_new_track());

        let set = run(&event, StatisticsOptions::default());

        let survived = set.category("produced_and_survived_per_module").unwrap();
        assert_eq!(survived.get("TPC"), 1.0);
        assert!(set
            .category("produced_and_killed_per_module")
            .unwrap()
            .is_empty());
        let energy = set
            .category_numeric("produced_and_survived_energy_vs_module")
            .unwrap();
        assert_eq!(energy.row("TPC").unwrap().entries(), 1);
    }

    #[test]
    fn final_secondary_classification_is_configurable() {
        let catalog = GeometryCatalog::new().with_module("vol20", "TPC");
        let mut event = EventBuilder::new(catalog);
        event
            .step(obs(1, 20).as_new_track())
            .step(secondary(2, 20, 1));

        let classified = run(&event, StatisticsOptions::default());
        assert_eq!(
            classified
                .category("produced_and_killed_per_module")
                .unwrap()
                .get("TPC"),
            1.0
        );

        let gap = run(
            &event,
            StatisticsOptions {
                classify_final_track: false,
                ..StatisticsOptions::default()
            },
        );
        assert!(gap
            .category("produced_and_killed_per_module")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn unresolved_ids_use_unknown_label() {
        let mut event = EventBuilder::new(GeometryCatalog::new());
        event.step(StepObservation::new(VolumeId(5), TrackId(9)).as_new_track());
        event.lookups.clear_per_track_fields();

        let set = run(&event, StatisticsOptions::default());
        assert_eq!(
            set.category("steps_per_volume").unwrap().get(UNKNOWN_LABEL),
            1.0
        );
        assert_eq!(
            set.category("steps_per_particle")
                .unwrap()
                .get(UNKNOWN_LABEL),
            1.0
        );
    }

    #[test]
    fn hits_fill_hit_buckets() {
        let mut event = EventBuilder::new(GeometryCatalog::new());
        event.step(obs(1, 4).as_new_track()).step(obs(1, 4));
        if let Some(step) = event.steps.last_mut() {
            step.detector_hit = Some(1);
        }

        let set = run(&event, StatisticsOptions::default());
        assert_eq!(set.category("hits_per_volume").unwrap().get("vol4"), 1.0);
        assert_eq!(set.numeric("hits_x").unwrap().entries(), 1);
        assert_eq!(set.numeric("steps_x").unwrap().entries(), 2);
    }

    #[test]
    fn retained_steps_are_kept_on_request() {
        let mut event = EventBuilder::new(GeometryCatalog::new());
        event.step(obs(1, 4).as_new_track());
        let mut stats = StepStatistics::new(
            StatisticsOptions {
                retain_raw_steps: true,
                ..StatisticsOptions::default()
            },
            None,
        );
        stats.analyze(&event.steps, &[], &event.lookups);
        assert_eq!(stats.retained_steps().len(), 1);
    }

    #[test]
    fn finalize_builds_top_lists_and_compresses() {
        let mut event = EventBuilder::new(GeometryCatalog::new());
        event
            .step(obs(1, 1).as_new_track())
            .step(obs(1, 2))
            .step(obs(1, 2))
            .step(obs(1, 3))
            .step(obs(1, 3))
            .step(obs(1, 3));

        let set = run(
            &event,
            StatisticsOptions {
                top_n: 2,
                ..StatisticsOptions::default()
            },
        );
        let top = set.ranked("steps_per_volume_top").unwrap();
        assert_eq!(top.labels().collect::<Vec<_>>(), vec!["vol3", "vol2"]);
        // Secondaries were filled with zero weight, so compression empties them.
        assert!(set.category("secondaries_per_volume").unwrap().is_empty());
    }

    #[test]
    fn from_config_honours_filter_and_options() {
        let config = AnalysisConfig {
            top_volumes: 5,
            retain_raw_steps: true,
            filter: Some(steplog_core::config::FilterConfig {
                volumes: vec!["vol1".to_owned()],
                ..steplog_core::config::FilterConfig::default()
            }),
            ..AnalysisConfig::default()
        };
        let mut event = EventBuilder::new(GeometryCatalog::new());
        event.step(obs(1, 1).as_new_track()).step(obs(1, 2));

        let mut stats = StepStatistics::from_config(&config);
        stats.analyze(&event.steps, &[], &event.lookups);
        assert_eq!(stats.rejected_steps(), 1);
        assert_eq!(stats.retained_steps().len(), 1);
        assert_eq!(stats.name(), STEP_STATISTICS);
    }
}
