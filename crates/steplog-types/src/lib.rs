//! Shared type definitions for the steplog capture engine.
//!
//! Everything that crosses a crate boundary lives here: the integer
//! identifiers assigned by the transport host, the production-process and
//! particle catalogues used for labelling, and the immutable event records
//! produced once per step and once per magnetic-field query.
//!
//! # Modules
//!
//! - [`ids`] -- Index newtypes ([`VolumeId`], [`TrackId`]) used as direct
//!   offsets into sparse lookup tables.
//! - [`enums`] -- [`Parentage`] and the [`ProcessCode`] catalogue.
//! - [`particle`] -- PDG code to particle-name resolution.
//! - [`events`] -- Adapter observations and the records built from them.

pub mod enums;
pub mod events;
pub mod ids;
pub mod particle;

pub use enums::{Parentage, ProcessCode};
pub use events::{
    FieldObservation, FieldQueryEvent, StepEvent, StepFlags, StepObservation, ThreeVector,
};
pub use ids::{CopyNo, TrackId, VolumeId};

/// Label used wherever an identifier cannot be resolved to a name.
///
/// Resolution misses are a data-quality signal, not an error: the label is
/// carried through every bucket as its own visible category.
pub const UNKNOWN_LABEL: &str = "unknown";
