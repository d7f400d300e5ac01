//! Live analysis for steplog.
//!
//! In `LiveAnalysis` mode every finished event is handed to the registered
//! analyses instead of being persisted. Analyses fold the event into named
//! buckets that accumulate across the whole run; once the configured number
//! of events is reached the buckets are finalized and written out.
//!
//! # Modules
//!
//! - [`analysis`] -- [`StepAnalysis`] trait and the [`AnalysisManager`].
//! - [`bucket`] -- Category, histogram and co-occurrence accumulators.
//! - [`filter`] -- [`StepFilter`] predicates and declarative filters.
//! - [`output`] -- [`BucketSink`] trait and the JSON file sink.
//! - [`statistics`] -- [`StepStatistics`], the track-lifecycle analysis.
//!
//! [`StepAnalysis`]: analysis::StepAnalysis
//! [`AnalysisManager`]: analysis::AnalysisManager
//! [`StepFilter`]: filter::StepFilter
//! [`BucketSink`]: output::BucketSink
//! [`StepStatistics`]: statistics::StepStatistics

pub mod analysis;
pub mod bucket;
pub mod filter;
pub mod output;
pub mod statistics;
