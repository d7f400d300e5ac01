//! Index-keyed lookup tables shared by the aggregators and analyses.
//!
//! Volume and track identifiers are handed out by the transport host as
//! small non-negative integers with no known upper bound. Each table is a
//! [`SparseTable`]: a vector of optional slots that grows to `index + 1` on
//! the first write past its end. An empty slot is the "unset" sentinel.
//! Offsets at or above [`DENSE_SLOT_LIMIT`] go to an ordered side map, so
//! memory stays bounded by the dense limit plus the number of large ids.
//!
//! Name, PDG, parent and origin tables follow first-writer-wins: a later
//! write with a different value is logged once, counted as an anomaly, and
//! discarded. The step counter folds with `+=`. Volume-keyed tables persist
//! for the whole run; track-keyed tables are cleared between events by
//! [`LookupTables::clear_per_track_fields`].

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use steplog_types::{particle, Parentage, TrackId, VolumeId, UNKNOWN_LABEL};
use tracing::warn;

use crate::geometry::GeometryCatalog;

// ---------------------------------------------------------------------------
// SparseTable
// ---------------------------------------------------------------------------

/// Result of [`SparseTable::insert_or_verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// The slot was empty and now holds the value.
    Inserted,
    /// The slot already held an identical value.
    Unchanged,
    /// The slot held a different value, which was kept.
    Conflict,
}

/// Offsets below this are stored densely; larger ones in a side map.
pub const DENSE_SLOT_LIMIT: usize = 1 << 20;

/// A growable table of optional values addressed by integer offset.
///
/// The dense part grows to `index + 1`, never past [`DENSE_SLOT_LIMIT`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct SparseTable<T> {
    slots: Vec<Option<T>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    overflow: BTreeMap<usize, Option<T>>,
}

impl<T> Default for SparseTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SparseTable<T> {
    /// Create an empty table.
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            overflow: BTreeMap::new(),
        }
    }

    /// Number of addressable slots (set or not).
    pub fn capacity(&self) -> usize {
        self.slots.len().saturating_add(self.overflow.len())
    }

    /// Whether no slot holds a value.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none) && self.overflow.values().all(Option::is_none)
    }

    /// Value at `index`, or `None` when unset or out of range.
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= DENSE_SLOT_LIMIT {
            return self.overflow.get(&index).and_then(Option::as_ref);
        }
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Overwrite the value at `index`, growing the table if needed.
    pub fn set(&mut self, index: usize, value: T) {
        if let Some(slot) = self.slot_mut(index) {
            *slot = Some(value);
        }
    }

    /// Write `value` only if the slot is unset. Returns whether it was written.
    pub fn set_if_unset(&mut self, index: usize, value: T) -> bool {
        match self.slot_mut(index) {
            Some(slot) if slot.is_none() => {
                *slot = Some(value);
                true
            }
            _ => false,
        }
    }

    /// Mutable access to the value at `index`, inserting `init` if unset.
    pub fn get_or_insert(&mut self, index: usize, init: T) -> Option<&mut T> {
        self.slot_mut(index).map(|slot| slot.get_or_insert(init))
    }

    /// Unset every slot and release the storage.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.overflow.clear();
    }

    /// Iterate over set slots as `(index, value)`, in offset order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        let dense = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|value| (index, value)));
        let sparse = self
            .overflow
            .iter()
            .filter_map(|(index, slot)| slot.as_ref().map(|value| (*index, value)));
        dense.chain(sparse)
    }

    fn slot_mut(&mut self, index: usize) -> Option<&mut Option<T>> {
        if index >= DENSE_SLOT_LIMIT {
            return Some(self.overflow.entry(index).or_insert_with(|| None));
        }
        if index >= self.slots.len() {
            self.slots.resize_with(index.saturating_add(1), || None);
        }
        self.slots.get_mut(index)
    }
}

impl<T: PartialEq> SparseTable<T> {
    /// First write sets the value; later writes are compared, never applied.
    pub fn insert_or_verify(&mut self, index: usize, value: T) -> Consistency {
        match self.slot_mut(index) {
            Some(slot) => match slot {
                None => {
                    *slot = Some(value);
                    Consistency::Inserted
                }
                Some(existing) if *existing == value => Consistency::Unchanged,
                Some(_) => Consistency::Conflict,
            },
            None => Consistency::Unchanged,
        }
    }
}

/// Verify a write and report a conflict exactly once.
fn verify<T: PartialEq + Debug>(
    table: &mut SparseTable<T>,
    field: &'static str,
    key: u32,
    value: T,
    anomalies: &mut u64,
) -> Consistency {
    let index = usize::try_from(key).unwrap_or(usize::MAX);
    if let Some(kept) = table.get(index).filter(|kept| **kept != value) {
        *anomalies = anomalies.saturating_add(1);
        warn!(
            field,
            key,
            kept = ?kept,
            rejected = ?value,
            "conflicting lookup write ignored"
        );
        return Consistency::Conflict;
    }
    table.insert_or_verify(index, value)
}

// ---------------------------------------------------------------------------
// LookupTables
// ---------------------------------------------------------------------------

/// All ID-to-metadata tables for one run.
///
/// Written by the aggregators while steps arrive, read by the analyses
/// when an event is handed over.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LookupTables {
    /// Volume names.
    pub volume_names: SparseTable<String>,
    /// Module names, derived from the volume name through the geometry catalog.
    pub module_names: SparseTable<String>,
    /// Medium names.
    pub medium_names: SparseTable<String>,
    /// Volumes in which hits are expected.
    pub sensitive: SparseTable<bool>,
    /// Particle type of each track.
    pub pdg: SparseTable<i32>,
    /// Parent of each track.
    pub parent: SparseTable<Parentage>,
    /// Steps observed per track.
    pub step_counts: SparseTable<u64>,
    /// Energy at the first observed step of each track.
    pub start_energy: SparseTable<f32>,
    /// Whether each track ever crossed a boundary.
    pub crossed_boundary: SparseTable<bool>,
    /// Whether each track ever produced a secondary.
    pub produced_secondary: SparseTable<bool>,
    /// Volume where each track was first observed.
    pub origin: SparseTable<VolumeId>,
    #[serde(skip)]
    anomalies: u64,
}

impl LookupTables {
    /// Create empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    // -- volume-keyed writes -------------------------------------------------

    /// Record a volume's name and medium, resolving module and sensitivity.
    ///
    /// Every supplied value is verified on every call, so a medium first
    /// seen after a name-only registration (a field query) is still kept.
    /// Module and sensitivity derive from the retained name.
    pub fn register_volume(
        &mut self,
        volume: VolumeId,
        name: &str,
        medium: Option<&str>,
        catalog: &GeometryCatalog,
    ) {
        let key = volume.into_inner();
        verify(
            &mut self.volume_names,
            "volume_name",
            key,
            name.to_owned(),
            &mut self.anomalies,
        );
        if let Some(medium) = medium {
            verify(
                &mut self.medium_names,
                "medium_name",
                key,
                medium.to_owned(),
                &mut self.anomalies,
            );
        }

        let kept = self.volume_name(volume).unwrap_or(name);
        let sensitive = catalog.is_sensitive(kept);
        let module = catalog
            .module_of(kept)
            .filter(|module| self.module_name(volume) != Some(*module));
        if let Some(module) = module {
            verify(
                &mut self.module_names,
                "module_name",
                key,
                module.to_owned(),
                &mut self.anomalies,
            );
        }
        if sensitive && !self.is_sensitive(volume) {
            self.sensitive.set(volume.index(), true);
        }
    }

    /// Mark a volume as sensitive or not.
    pub fn set_sensitive(&mut self, volume: VolumeId, sensitive: bool) {
        self.sensitive.set(volume.index(), sensitive);
    }

    // -- track-keyed writes --------------------------------------------------

    /// Record a track's particle type.
    pub fn record_pdg(&mut self, track: TrackId, pdg: i32) -> Consistency {
        verify(&mut self.pdg, "pdg", track.into_inner(), pdg, &mut self.anomalies)
    }

    /// Record a track's parent.
    pub fn record_parent(&mut self, track: TrackId, parent: Parentage) -> Consistency {
        verify(
            &mut self.parent,
            "parent",
            track.into_inner(),
            parent,
            &mut self.anomalies,
        )
    }

    /// Add one step to a track's counter.
    pub fn increment_step_count(&mut self, track: TrackId) {
        if let Some(count) = self.step_counts.get_or_insert(track.index(), 0) {
            *count = count.saturating_add(1);
        }
    }

    /// Record the energy at a track's first step. Later calls are ignored.
    pub fn record_start_energy(&mut self, track: TrackId, energy: f32) {
        self.start_energy.set_if_unset(track.index(), energy);
    }

    /// Record the volume where a track was first seen. Later calls are ignored.
    pub fn record_origin(&mut self, track: TrackId, volume: VolumeId) {
        self.origin.set_if_unset(track.index(), volume);
    }

    /// Set whether a track crossed a boundary.
    pub fn set_crossed_boundary(&mut self, track: TrackId, crossed: bool) {
        self.crossed_boundary.set(track.index(), crossed);
    }

    /// Set whether a track produced a secondary.
    pub fn set_produced_secondary(&mut self, track: TrackId, produced: bool) {
        self.produced_secondary.set(track.index(), produced);
    }

    // -- reads ---------------------------------------------------------------

    /// Name of a volume.
    pub fn volume_name(&self, volume: VolumeId) -> Option<&str> {
        self.volume_names.get(volume.index()).map(String::as_str)
    }

    /// Module a volume belongs to.
    pub fn module_name(&self, volume: VolumeId) -> Option<&str> {
        self.module_names.get(volume.index()).map(String::as_str)
    }

    /// Medium of a volume.
    pub fn medium_name(&self, volume: VolumeId) -> Option<&str> {
        self.medium_names.get(volume.index()).map(String::as_str)
    }

    /// Whether hits are expected in a volume.
    pub fn is_sensitive(&self, volume: VolumeId) -> bool {
        self.sensitive.get(volume.index()).copied().unwrap_or(false)
    }

    /// Particle type of a track.
    pub fn pdg(&self, track: TrackId) -> Option<i32> {
        self.pdg.get(track.index()).copied()
    }

    /// Parent of a track.
    pub fn parent(&self, track: TrackId) -> Option<Parentage> {
        self.parent.get(track.index()).copied()
    }

    /// Steps recorded for a track so far in this event.
    pub fn step_count(&self, track: TrackId) -> u64 {
        self.step_counts.get(track.index()).copied().unwrap_or(0)
    }

    /// Energy at a track's first step.
    pub fn start_energy(&self, track: TrackId) -> Option<f32> {
        self.start_energy.get(track.index()).copied()
    }

    /// Whether a track crossed a boundary.
    pub fn crossed_boundary(&self, track: TrackId) -> bool {
        self.crossed_boundary
            .get(track.index())
            .copied()
            .unwrap_or(false)
    }

    /// Whether a track produced a secondary.
    pub fn produced_secondary(&self, track: TrackId) -> bool {
        self.produced_secondary
            .get(track.index())
            .copied()
            .unwrap_or(false)
    }

    /// Volume where a track was first observed.
    pub fn origin_volume(&self, track: TrackId) -> Option<VolumeId> {
        self.origin.get(track.index()).copied()
    }

    /// Module where a track was first observed.
    pub fn origin_module(&self, track: TrackId) -> Option<&str> {
        self.origin_volume(track)
            .and_then(|volume| self.module_name(volume))
    }

    // -- labels --------------------------------------------------------------

    /// Volume name or the unknown sentinel.
    pub fn volume_label(&self, volume: VolumeId) -> &str {
        self.volume_name(volume).unwrap_or(UNKNOWN_LABEL)
    }

    /// Module name or the unknown sentinel.
    pub fn module_label(&self, volume: VolumeId) -> &str {
        self.module_name(volume).unwrap_or(UNKNOWN_LABEL)
    }

    /// Particle name of a track, its PDG number, or the unknown sentinel.
    pub fn particle_label(&self, track: TrackId) -> Cow<'static, str> {
        self.pdg(track)
            .map_or(Cow::Borrowed(UNKNOWN_LABEL), particle::particle_label)
    }

    // -- lifecycle -----------------------------------------------------------

    /// Reset every track-keyed table. Volume tables are untouched.
    pub fn clear_per_track_fields(&mut self) {
        self.pdg.clear();
        self.parent.clear();
        self.step_counts.clear();
        self.start_energy.clear();
        self.crossed_boundary.clear();
        self.produced_secondary.clear();
        self.origin.clear();
    }

    /// Number of conflicting writes seen since the tables were created.
    pub const fn anomaly_count(&self) -> u64 {
        self.anomalies
    }
}
