//! Capture engine for the steplog step logger.
//!
//! This crate owns everything that runs on the simulation hot path: the
//! index-keyed lookup tables, the step and field aggregators, the
//! end-of-event reports, the persistence seam used in Stream mode, and the
//! typed configuration.
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `steplog-config.yaml` into
//!   strongly-typed structs, including [`RunMode`].
//! - [`geometry`] -- Volume-to-module map and sensitive volumes.
//! - [`lookup`] -- [`SparseTable`] and the per-run [`LookupTables`].
//! - [`step_aggregator`] -- Per-event step accumulation.
//! - [`field_aggregator`] -- Per-event field-query accumulation.
//! - [`report`] -- Summary-mode reports and flush outcomes.
//! - [`persist`] -- [`RecordSink`] trait, JSON-lines sink and reader.
//!
//! [`RunMode`]: config::RunMode
//! [`SparseTable`]: lookup::SparseTable
//! [`LookupTables`]: lookup::LookupTables
//! [`RecordSink`]: persist::RecordSink

pub mod config;
pub mod field_aggregator;
pub mod geometry;
pub mod lookup;
pub mod persist;
pub mod report;
pub mod step_aggregator;
