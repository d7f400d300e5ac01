//! The [`StepAnalysis`] trait and the [`AnalysisManager`] that drives it.
//!
//! The manager owns every registered analysis, hands each finished event
//! to all of them in registration order, and at the end of the run
//! finalizes them, writes their buckets to a [`BucketSink`] and tears them
//! down. Each of those end-of-run steps happens at most once.

use steplog_core::lookup::LookupTables;
use steplog_types::{FieldQueryEvent, StepEvent};
use tracing::{debug, info};

use crate::bucket::BucketSet;
use crate::output::{BucketSink, OutputError};

/// Errors raised by the analysis manager.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// An analysis with this name is already registered.
    #[error("analysis {name} is already registered")]
    DuplicateName {
        /// The clashing name.
        name: String,
    },

    /// The operation needs analyses that are still accumulating.
    #[error("analyses are already finalized")]
    AlreadyFinalized,

    /// The operation needs finalized analyses.
    #[error("analyses are not finalized yet")]
    NotFinalized,

    /// The manager has been terminated.
    #[error("analysis manager is terminated")]
    Terminated,

    /// Writing buckets failed.
    #[error("failed to write analysis output: {source}")]
    Output {
        /// The underlying output error.
        #[from]
        source: OutputError,
    },
}

/// A consumer of finished events.
pub trait StepAnalysis {
    /// Unique name, used for output file names.
    fn name(&self) -> &str;

    /// Prepare for the first event. Called once, at registration.
    fn initialize(&mut self) {}

    /// Fold one event into the analysis' buckets.
    fn analyze(&mut self, steps: &[StepEvent], queries: &[FieldQueryEvent], lookups: &LookupTables);

    /// Post-process the buckets after the last event.
    fn finalize(&mut self);

    /// Snapshot of the buckets.
    fn buckets(&self) -> BucketSet;

    /// Accepted steps kept for output, if the analysis keeps any.
    fn retained_steps(&self) -> &[StepEvent] {
        &[]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerState {
    Collecting,
    Finalized,
    Terminated,
}

/// Owns the registered analyses and counts processed events.
pub struct AnalysisManager {
    analyses: Vec<Box<dyn StepAnalysis>>,
    events: u64,
    state: ManagerState,
}

impl Default for AnalysisManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AnalysisManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisManager")
            .field("analyses", &self.names())
            .field("events", &self.events)
            .field("state", &self.state)
            .finish()
    }
}

impl AnalysisManager {
    /// Create a manager with no analyses.
    pub const fn new() -> Self {
        Self {
            analyses: Vec::new(),
            events: 0,
            state: ManagerState::Collecting,
        }
    }

    /// Register and initialize an analysis.
    pub fn register(&mut self, mut analysis: Box<dyn StepAnalysis>) -> Result<(), AnalysisError> {
        self.require_collecting()?;
        if self.analyses.iter().any(|a| a.name() == analysis.name()) {
            return Err(AnalysisError::DuplicateName {
                name: analysis.name().to_owned(),
            });
        }
        analysis.initialize();
        info!(analysis = analysis.name(), "analysis registered");
        self.analyses.push(analysis);
        Ok(())
    }

    /// Names of the registered analyses.
    pub fn names(&self) -> Vec<&str> {
        self.analyses.iter().map(|a| a.name()).collect()
    }

    /// Events processed so far.
    pub const fn event_count(&self) -> u64 {
        self.events
    }

    /// Whether [`finalize_events`](Self::finalize_events) has run.
    pub fn is_finalized(&self) -> bool {
        self.state != ManagerState::Collecting
    }

    /// Hand one finished event to every analysis. Returns the new event count.
    pub fn analyze_event(
        &mut self,
        steps: &[StepEvent],
        queries: &[FieldQueryEvent],
        lookups: &LookupTables,
    ) -> Result<u64, AnalysisError> {
        self.require_collecting()?;
        for analysis in &mut self.analyses {
            analysis.analyze(steps, queries, lookups);
        }
        self.events = self.events.saturating_add(1);
        debug!(
            event = self.events,
            steps = steps.len(),
            queries = queries.len(),
            "event analysed"
        );
        Ok(self.events)
    }

    /// Finalize every analysis.
    pub fn finalize_events(&mut self) -> Result<(), AnalysisError> {
        self.require_collecting()?;
        for analysis in &mut self.analyses {
            analysis.finalize();
        }
        self.state = ManagerState::Finalized;
        info!(events = self.events, "analyses finalized");
        Ok(())
    }

    /// Snapshots of every analysis' buckets, stamped with the event count.
    pub fn bucket_sets(&self) -> Vec<BucketSet> {
        self.analyses
            .iter()
            .map(|analysis| {
                let mut set = analysis.buckets();
                set.events = self.events;
                set
            })
            .collect()
    }

    /// Write every analysis' buckets. Returns the number of sets written.
    pub fn write(&self, sink: &mut dyn BucketSink) -> Result<usize, AnalysisError> {
        match self.state {
            ManagerState::Collecting => return Err(AnalysisError::NotFinalized),
            ManagerState::Terminated => return Err(AnalysisError::Terminated),
            ManagerState::Finalized => {}
        }
        for analysis in &self.analyses {
            let mut set = analysis.buckets();
            set.events = self.events;
            sink.write(&set, analysis.retained_steps())?;
        }
        Ok(self.analyses.len())
    }

    /// Drop every analysis. The manager accepts nothing afterwards.
    pub fn terminate(&mut self) {
        info!(analyses = self.analyses.len(), "analysis manager terminated");
        self.analyses.clear();
        self.state = ManagerState::Terminated;
    }

    fn require_collecting(&self) -> Result<(), AnalysisError> {
        match self.state {
            ManagerState::Collecting => Ok(()),
            ManagerState::Finalized => Err(AnalysisError::AlreadyFinalized),
            ManagerState::Terminated => Err(AnalysisError::Terminated),
        }
    }
}
