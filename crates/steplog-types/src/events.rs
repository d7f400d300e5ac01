//! Step and field-query records.
//!
//! The interception adapter hands the engine a [`StepObservation`] or a
//! [`FieldObservation`] describing what it saw. The aggregators stamp
//! sequence numbers onto those and store immutable [`StepEvent`] and
//! [`FieldQueryEvent`] records. The only post-creation mutation is the
//! detector-hit marker on a [`StepEvent`].

use serde::{Deserialize, Serialize};

use crate::enums::{Parentage, ProcessCode};
use crate::ids::{CopyNo, TrackId, VolumeId};

// ---------------------------------------------------------------------------
// ThreeVector
// ---------------------------------------------------------------------------

/// A Cartesian triple used for positions, momenta and field vectors.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ThreeVector {
    /// X component.
    pub x: f32,
    /// Y component.
    pub y: f32,
    /// Z component.
    pub z: f32,
}

impl ThreeVector {
    /// Build a vector from its components.
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Euclidean length.
    pub fn magnitude(self) -> f32 {
        self.z.hypot(self.radial())
    }

    /// Distance from the beam (z) axis.
    pub fn radial(self) -> f32 {
        self.x.hypot(self.y)
    }
}

// ---------------------------------------------------------------------------
// StepFlags
// ---------------------------------------------------------------------------

/// Boolean state reported by the host for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct StepFlags {
    /// The track stopped during this step.
    pub stopped: bool,
    /// The track entered the current volume with this step.
    pub entered: bool,
    /// The track exited the current volume with this step.
    pub exited: bool,
    /// The host flags this as the first step of a track.
    pub new_track: bool,
    /// The step lies in a sensitive region of the detector.
    pub in_sensitive_region: bool,
}

// ---------------------------------------------------------------------------
// StepObservation
// ---------------------------------------------------------------------------

/// Everything the interception adapter knows about one step.
///
/// Built with [`StepObservation::new`] plus the `with_*` setters, then
/// handed to the step aggregator which turns it into a [`StepEvent`] and
/// feeds the lookup tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepObservation {
    /// Volume the step happened in.
    pub volume_id: VolumeId,
    /// Copy number of the volume placement.
    pub copy_no: CopyNo,
    /// Volume name, if the adapter resolved it.
    pub volume_name: Option<String>,
    /// Medium name, if the adapter resolved it.
    pub medium_name: Option<String>,
    /// Track being transported.
    pub track_id: TrackId,
    /// PDG code of the track's particle.
    pub pdg: i32,
    /// Parent of the track.
    pub parent: Parentage,
    /// Position at the end of the step.
    pub position: ThreeVector,
    /// Momentum at the end of the step.
    pub momentum: ThreeVector,
    /// Total energy at the end of the step.
    pub energy: f32,
    /// Length of the step.
    pub step_length: f32,
    /// Maximum allowed step length.
    pub max_step: f32,
    /// Production processes of the secondaries created in this step.
    pub secondary_processes: Vec<ProcessCode>,
    /// Process that produced the current track.
    pub prod_process: ProcessCode,
    /// Number of processes active during the step.
    pub active_processes: u32,
    /// Host-reported state flags.
    pub flags: StepFlags,
    /// The track crossed a geometry boundary with this step.
    pub crossed_boundary: bool,
    /// Pre-measured time since the previous step, if the adapter has one.
    pub elapsed_ns: Option<u64>,
}

impl StepObservation {
    /// Start an observation for a track in a volume; everything else zeroed.
    pub const fn new(volume_id: VolumeId, track_id: TrackId) -> Self {
        Self {
            volume_id,
            copy_no: 0,
            volume_name: None,
            medium_name: None,
            track_id,
            pdg: 0,
            parent: Parentage::Primary,
            position: ThreeVector::new(0.0, 0.0, 0.0),
            momentum: ThreeVector::new(0.0, 0.0, 0.0),
            energy: 0.0,
            step_length: 0.0,
            max_step: 0.0,
            secondary_processes: Vec::new(),
            prod_process: ProcessCode::UNSET,
            active_processes: 0,
            flags: StepFlags {
                stopped: false,
                entered: false,
                exited: false,
                new_track: false,
                in_sensitive_region: false,
            },
            crossed_boundary: false,
            elapsed_ns: None,
        }
    }

    /// Set the copy number.
    #[must_use]
    pub const fn with_copy_no(mut self, copy_no: CopyNo) -> Self {
        self.copy_no = copy_no;
        self
    }

    /// Set the volume and medium names.
    #[must_use]
    pub fn with_names(mut self, volume: impl Into<String>, medium: Option<String>) -> Self {
        self.volume_name = Some(volume.into());
        self.medium_name = medium;
        self
    }

    /// Set the particle type and parentage.
    #[must_use]
    pub const fn with_particle(mut self, pdg: i32, parent: Parentage) -> Self {
        self.pdg = pdg;
        self.parent = parent;
        self
    }

    /// Set position and momentum.
    #[must_use]
    pub const fn with_kinematics(mut self, position: ThreeVector, momentum: ThreeVector) -> Self {
        self.position = position;
        self.momentum = momentum;
        self
    }

    /// Set energy.
    #[must_use]
    pub const fn with_energy(mut self, energy: f32) -> Self {
        self.energy = energy;
        self
    }

    /// Set step length and step limit.
    #[must_use]
    pub const fn with_step(mut self, length: f32, max_step: f32) -> Self {
        self.step_length = length;
        self.max_step = max_step;
        self
    }

    /// Set the production codes of the secondaries made in this step.
    #[must_use]
    pub fn with_secondaries(mut self, processes: Vec<ProcessCode>) -> Self {
        self.secondary_processes = processes;
        self
    }

    /// Set the production process of the track and the active-process count.
    #[must_use]
    pub const fn with_process(mut self, prod_process: ProcessCode, active: u32) -> Self {
        self.prod_process = prod_process;
        self.active_processes = active;
        self
    }

    /// Mark the step as the first of a new track.
    #[must_use]
    pub const fn as_new_track(mut self) -> Self {
        self.flags.new_track = true;
        self
    }

    /// Replace all host flags.
    #[must_use]
    pub const fn with_flags(mut self, flags: StepFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Record whether the step crossed a boundary.
    #[must_use]
    pub const fn with_boundary_crossing(mut self, crossed: bool) -> Self {
        self.crossed_boundary = crossed;
        self
    }

    /// Supply a pre-measured elapsed time.
    #[must_use]
    pub const fn with_elapsed_ns(mut self, elapsed_ns: u64) -> Self {
        self.elapsed_ns = Some(elapsed_ns);
        self
    }

    /// Number of secondaries produced in this step.
    pub fn n_secondaries(&self) -> u32 {
        u32::try_from(self.secondary_processes.len()).unwrap_or(u32::MAX)
    }
}

// ---------------------------------------------------------------------------
// StepEvent
// ---------------------------------------------------------------------------

/// Immutable record of a single step, keyed by its sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    /// Position of the step within its event, starting at 0.
    pub seq: u64,
    /// Volume the step happened in.
    pub volume_id: VolumeId,
    /// Copy number of the volume placement.
    pub copy_no: CopyNo,
    /// Track being transported.
    pub track_id: TrackId,
    /// Parent of the track.
    pub parent: Parentage,
    /// Position at the end of the step.
    pub position: ThreeVector,
    /// Momentum at the end of the step.
    pub momentum: ThreeVector,
    /// Total energy at the end of the step.
    pub energy: f32,
    /// Length of the step.
    pub step_length: f32,
    /// Maximum allowed step length.
    pub max_step: f32,
    /// Number of secondaries created in this step.
    pub n_secondaries: u32,
    /// Process that produced the current track.
    pub prod_process: ProcessCode,
    /// Number of processes active during the step.
    pub active_processes: u32,
    /// Time elapsed since the previous step of the event.
    pub elapsed_ns: u64,
    /// Host-reported state flags.
    pub flags: StepFlags,
    /// Detector that registered a hit for this step, if any.
    pub detector_hit: Option<u32>,
}

impl StepEvent {
    /// Build the record for `obs` with the given sequence number and timing.
    pub fn from_observation(seq: u64, obs: &StepObservation, elapsed_ns: u64) -> Self {
        Self {
            seq,
            volume_id: obs.volume_id,
            copy_no: obs.copy_no,
            track_id: obs.track_id,
            parent: obs.parent,
            position: obs.position,
            momentum: obs.momentum,
            energy: obs.energy,
            step_length: obs.step_length,
            max_step: obs.max_step,
            n_secondaries: obs.n_secondaries(),
            prod_process: obs.prod_process,
            active_processes: obs.active_processes,
            elapsed_ns,
            flags: obs.flags,
            detector_hit: None,
        }
    }

    /// Whether a detector registered a hit for this step.
    pub const fn has_hit(&self) -> bool {
        self.detector_hit.is_some()
    }
}

// ---------------------------------------------------------------------------
// Field queries
// ---------------------------------------------------------------------------

/// What the adapter saw for one magnetic-field evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldObservation {
    /// Volume the query position lies in.
    pub volume_id: VolumeId,
    /// Volume name, if the adapter resolved it.
    pub volume_name: Option<String>,
    /// Query position.
    pub position: ThreeVector,
    /// Field vector returned by the field map.
    pub field: ThreeVector,
}

/// Immutable record of one magnetic-field evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldQueryEvent {
    /// Position of the query within its event, starting at 0.
    pub id: u64,
    /// Sequence number of the step being transported when the query ran.
    pub step_ref: Option<u64>,
    /// Query position.
    pub position: ThreeVector,
    /// Field magnitude `|B|`.
    pub magnitude: f32,
}

impl FieldQueryEvent {
    /// Build the record for `obs`.
    pub fn from_observation(id: u64, step_ref: Option<u64>, obs: &FieldObservation) -> Self {
        Self {
            id,
            step_ref,
            position: obs.position,
            magnitude: obs.field.magnitude(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn builder_populates_observation() {
        let obs = StepObservation::new(VolumeId(4), TrackId(2))
            .with_particle(22, Parentage::Secondary(TrackId(1)))
            .with_energy(0.5)
            .with_secondaries(vec![ProcessCode::COMPTON, ProcessCode::COMPTON])
            .as_new_track();
        assert_eq!(obs.pdg, 22);
        assert_eq!(obs.n_secondaries(), 2);
        assert!(obs.flags.new_track);
        assert_eq!(obs.parent.parent(), Some(TrackId(1)));
    }

    #[test]
    fn step_event_copies_observation() {
        let obs = StepObservation::new(VolumeId(4), TrackId(2))
            .with_copy_no(3)
            .with_kinematics(ThreeVector::new(1.0, 2.0, 3.0), ThreeVector::new(0.1, 0.0, 0.0))
            .with_secondaries(vec![ProcessCode::DECAY]);
        let event = StepEvent::from_observation(7, &obs, 1500);
        assert_eq!(event.seq, 7);
        assert_eq!(event.copy_no, 3);
        assert_eq!(event.n_secondaries, 1);
        assert_eq!(event.elapsed_ns, 1500);
        assert_eq!(event.position.z, 3.0);
        assert!(!event.has_hit());
    }

    #[test]
    fn field_query_uses_field_magnitude() {
        let obs = FieldObservation {
            volume_id: VolumeId(1),
            volume_name: None,
            position: ThreeVector::new(10.0, 0.0, 0.0),
            field: ThreeVector::new(0.0, 3.0, 4.0),
        };
        let query = FieldQueryEvent::from_observation(0, Some(5), &obs);
        assert!((query.magnitude - 5.0).abs() < 1e-6);
        assert_eq!(query.step_ref, Some(5));
    }

    #[test]
    fn step_event_survives_json() {
        let obs = StepObservation::new(VolumeId(9), TrackId(1)).with_energy(2.5);
        let mut event = StepEvent::from_observation(0, &obs, 0);
        event.detector_hit = Some(3);
        let json = serde_json::to_string(&event).unwrap();
        let back: StepEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
