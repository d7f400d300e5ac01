//! Enumeration-like types attached to steps.

use serde::{Deserialize, Serialize};

use crate::ids::TrackId;
use crate::UNKNOWN_LABEL;

// ---------------------------------------------------------------------------
// Parentage
// ---------------------------------------------------------------------------

/// Where a track came from.
///
/// Hosts encode this as a signed parent ID with `-1` meaning "primary";
/// [`Parentage::from_signed`] performs that translation once at the
/// adapter boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Parentage {
    /// Injected by the event generator, no parent track.
    #[default]
    Primary,
    /// Produced as a secondary during a step of the given track.
    Secondary(TrackId),
}

impl Parentage {
    /// Translate a host-side parent ID (negative = primary).
    pub fn from_signed(parent: i64) -> Self {
        TrackId::from_signed(parent).map_or(Self::Primary, Self::Secondary)
    }

    /// Return the parent track, if any.
    pub const fn parent(self) -> Option<TrackId> {
        match self {
            Self::Primary => None,
            Self::Secondary(track) => Some(track),
        }
    }

    /// Whether the track is a secondary.
    pub const fn is_secondary(self) -> bool {
        matches!(self, Self::Secondary(_))
    }
}

// ---------------------------------------------------------------------------
// Production processes
// ---------------------------------------------------------------------------

/// Names of the production processes, indexed by process code.
const PROCESS_NAMES: [&str; 50] = [
    "Primary particle emission",
    "Multiple scattering",
    "Coulomb scattering",
    "Energy loss",
    "Lorentz force",
    "Decay",
    "Pair production",
    "Compton scattering",
    "Photoelectric effect",
    "Bremstrahlung",
    "Delta ray",
    "Positron annihilation",
    "Positron annihilation at rest",
    "Positron annihilation in flight",
    "Hadronic interaction",
    "Evaporation",
    "Nuclear fission",
    "Nuclear absorption",
    "Antiproton annihilation",
    "Antineutron annihilation",
    "Neutron capture",
    "Hadronic elastic",
    "Hadronic incoherent elastic",
    "Hadronic coherent elastic",
    "Hadronic inelastic",
    "Photon inelastic",
    "Muon nuclear interaction",
    "Electron nuclear interaction",
    "Positron nuclear interaction",
    "Photo nuclear interaction",
    "Time of flight limit",
    "Nuclear photofission",
    "Rayleigh effect",
    "No active process",
    "Energy threshold",
    "Light absorption",
    "Light detection",
    "Light scattering",
    "Light wavelength shift",
    "Maximum allowed step",
    "Cerenkov production",
    "Cerenkov feed back photon",
    "Cerenkov photon reflection",
    "Cerenkov photon refraction",
    "Synchrotron radiation",
    "Scintillation",
    "Transition radiation",
    "Transportation",
    "User defined process",
    "No mechanism",
];

/// Code of the physics process that produced a track or secondary.
///
/// Codes follow the host's process enumeration. Codes outside the known
/// range (including the host's `-1`) still round-trip; they simply resolve
/// to [`UNKNOWN_LABEL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessCode(pub i32);

impl ProcessCode {
    /// Primary particle emission.
    pub const PRIMARY: Self = Self(0);
    /// Decay.
    pub const DECAY: Self = Self(5);
    /// Compton scattering.
    pub const COMPTON: Self = Self(7);
    /// Hadronic interaction.
    pub const HADRONIC: Self = Self(14);
    /// The host did not report a process.
    pub const UNSET: Self = Self(-1);

    /// Human-readable process name, or [`UNKNOWN_LABEL`].
    pub fn name(self) -> &'static str {
        usize::try_from(self.0)
            .ok()
            .and_then(|idx| PROCESS_NAMES.get(idx).copied())
            .unwrap_or(UNKNOWN_LABEL)
    }
}

impl Default for ProcessCode {
    fn default() -> Self {
        Self::UNSET
    }
}

impl core::fmt::Display for ProcessCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_parent_translation() {
        assert_eq!(Parentage::from_signed(-1), Parentage::Primary);
        assert_eq!(
            Parentage::from_signed(3),
            Parentage::Secondary(TrackId(3))
        );
        assert!(Parentage::from_signed(3).is_secondary());
        assert_eq!(Parentage::Primary.parent(), None);
    }

    #[test]
    fn process_names_resolve() {
        assert_eq!(ProcessCode::PRIMARY.name(), "Primary particle emission");
        assert_eq!(ProcessCode::DECAY.name(), "Decay");
        assert_eq!(ProcessCode::HADRONIC.name(), "Hadronic interaction");
    }

    #[test]
    fn out_of_range_process_is_unknown() {
        assert_eq!(ProcessCode::UNSET.name(), UNKNOWN_LABEL);
        assert_eq!(ProcessCode(500).name(), UNKNOWN_LABEL);
    }
}
