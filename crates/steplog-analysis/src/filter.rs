//! Step filter predicates.
//!
//! An analysis can be given at most one [`StepFilter`] when it is built.
//! Any closure with the right signature is a filter; configuration files
//! describe one declaratively with a [`FilterConfig`], which
//! [`CompiledFilter::compile`] validates and turns into a predicate.

use std::collections::BTreeSet;

use steplog_core::config::FilterConfig;
use steplog_core::lookup::LookupTables;
use steplog_types::StepEvent;
use tracing::{info, warn};

/// Errors in a declarative filter description.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FilterError {
    /// The description sets no criterion at all.
    #[error("filter sets no criterion")]
    Empty,

    /// The energy bounds are reversed.
    #[error("energy window is empty: min {min} > max {max}")]
    InvalidEnergyWindow {
        /// Lower bound.
        min: f32,
        /// Upper bound.
        max: f32,
    },

    /// An energy bound is NaN or infinite.
    #[error("energy bound is not finite")]
    NonFiniteEnergy,

    /// A module or volume name is blank.
    #[error("blank {field} name in filter")]
    BlankName {
        /// Which list held the blank name.
        field: &'static str,
    },
}

/// Decides whether a step takes part in an analysis.
///
/// Arguments are the step, its resolved volume and module labels, its
/// particle type if known, and the lookup tables.
pub trait StepFilter {
    /// Return `true` to accept the step.
    fn accept(
        &self,
        step: &StepEvent,
        volume: &str,
        module: &str,
        pdg: Option<i32>,
        lookups: &LookupTables,
    ) -> bool;
}

impl<F> StepFilter for F
where
    F: Fn(&StepEvent, &str, &str, Option<i32>, &LookupTables) -> bool,
{
    fn accept(
        &self,
        step: &StepEvent,
        volume: &str,
        module: &str,
        pdg: Option<i32>,
        lookups: &LookupTables,
    ) -> bool {
        self(step, volume, module, pdg, lookups)
    }
}

/// Validated form of a [`FilterConfig`].
///
/// Empty sets mean "no restriction"; every populated criterion must hold.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    modules: BTreeSet<String>,
    volumes: BTreeSet<String>,
    pdg_codes: BTreeSet<i32>,
    min_energy: Option<f32>,
    max_energy: Option<f32>,
    sensitive_only: bool,
}

impl CompiledFilter {
    /// Validate a declarative filter.
    pub fn compile(config: &FilterConfig) -> Result<Self, FilterError> {
        let criteria = !config.modules.is_empty()
            || !config.volumes.is_empty()
            || !config.pdg_codes.is_empty()
            || config.min_energy.is_some()
            || config.max_energy.is_some()
            || config.sensitive_only;
        if !criteria {
            return Err(FilterError::Empty);
        }
        if config.modules.iter().any(|m| m.trim().is_empty()) {
            return Err(FilterError::BlankName { field: "module" });
        }
        if config.volumes.iter().any(|v| v.trim().is_empty()) {
            return Err(FilterError::BlankName { field: "volume" });
        }
        let bounds = [config.min_energy, config.max_energy];
        if bounds.iter().flatten().any(|e| !e.is_finite()) {
            return Err(FilterError::NonFiniteEnergy);
        }
        if let (Some(min), Some(max)) = (config.min_energy, config.max_energy) {
            if min > max {
                return Err(FilterError::InvalidEnergyWindow { min, max });
            }
        }

        Ok(Self {
            modules: config.modules.iter().cloned().collect(),
            volumes: config.volumes.iter().cloned().collect(),
            pdg_codes: config.pdg_codes.iter().copied().collect(),
            min_energy: config.min_energy,
            max_energy: config.max_energy,
            sensitive_only: config.sensitive_only,
        })
    }
}

impl StepFilter for CompiledFilter {
    fn accept(
        &self,
        step: &StepEvent,
        volume: &str,
        module: &str,
        pdg: Option<i32>,
        lookups: &LookupTables,
    ) -> bool {
        if !self.modules.is_empty() && !self.modules.contains(module) {
            return false;
        }
        if !self.volumes.is_empty() && !self.volumes.contains(volume) {
            return false;
        }
        if !self.pdg_codes.is_empty() && !pdg.is_some_and(|p| self.pdg_codes.contains(&p)) {
            return false;
        }
        if self.min_energy.is_some_and(|min| step.energy < min) {
            return false;
        }
        if self.max_energy.is_some_and(|max| step.energy > max) {
            return false;
        }
        !self.sensitive_only || lookups.is_sensitive(step.volume_id)
    }
}

/// Compile the configured filter, if any.
///
/// A malformed description is logged and treated as absent so that event
/// capture never depends on the optional analysis path.
pub fn filter_from_config(config: Option<&FilterConfig>) -> Option<Box<dyn StepFilter>> {
    let config = config?;
    match CompiledFilter::compile(config) {
        Ok(filter) => {
            info!(?filter, "step filter installed");
            Some(Box::new(filter))
        }
        Err(err) => {
            warn!(error = %err, "ignoring malformed step filter, analysing all steps");
            None
        }
    }
}
