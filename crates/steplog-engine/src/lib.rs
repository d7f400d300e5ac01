//! Run orchestration for steplog.
//!
//! - [`controller`] -- [`RunController`], the per-run state machine the
//!   host drives step by step and event by event.
//! - [`replay`] -- Re-run the analyses over a persisted Stream-mode run.
//!
//! [`RunController`]: controller::RunController

pub mod controller;
pub mod replay;
