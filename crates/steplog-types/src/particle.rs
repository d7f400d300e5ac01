//! PDG particle code resolution.
//!
//! Only the species that routinely show up in detector transport are
//! named. Anything else (nuclei, exotic resonances) is labelled by its
//! numeric code so it still forms a distinct bucket category.

use std::borrow::Cow;

/// Known PDG codes and their conventional names.
const PARTICLES: &[(i32, &str)] = &[
    (11, "e-"),
    (-11, "e+"),
    (12, "nu_e"),
    (-12, "nu_e_bar"),
    (13, "mu-"),
    (-13, "mu+"),
    (14, "nu_mu"),
    (-14, "nu_mu_bar"),
    (22, "gamma"),
    (50_000_050, "opticalphoton"),
    (111, "pi0"),
    (211, "pi+"),
    (-211, "pi-"),
    (130, "K0_L"),
    (310, "K0_S"),
    (321, "K+"),
    (-321, "K-"),
    (2112, "neutron"),
    (-2112, "antineutron"),
    (2212, "proton"),
    (-2212, "antiproton"),
    (3122, "Lambda0"),
    (-3122, "Lambda0_bar"),
    (1_000_010_020, "deuteron"),
    (1_000_010_030, "triton"),
    (1_000_020_040, "alpha"),
];

/// Return the conventional name of a PDG code, if it is a known species.
pub fn particle_name(pdg: i32) -> Option<&'static str> {
    PARTICLES
        .iter()
        .find(|(code, _)| *code == pdg)
        .map(|(_, name)| *name)
}

/// Return a bucket label for a PDG code: the name if known, the number otherwise.
pub fn particle_label(pdg: i32) -> Cow<'static, str> {
    particle_name(pdg).map_or_else(|| Cow::Owned(pdg.to_string()), Cow::Borrowed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_species_have_names() {
        assert_eq!(particle_name(22), Some("gamma"));
        assert_eq!(particle_name(-211), Some("pi-"));
        assert_eq!(particle_label(2212), "proton");
    }

    #[test]
    fn unknown_species_fall_back_to_code() {
        assert_eq!(particle_name(1_000_060_120), None);
        assert_eq!(particle_label(1_000_060_120), "1000060120");
    }
}
