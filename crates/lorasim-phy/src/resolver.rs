//! Collision resolution: does a locked signal survive what else was on air?
//!
//! Four policies are available, selected per receiver with
//! [`InterferenceModel`]. All of them look only at other signals on the
//! focal signal's frequency and never compare a signal with itself.

use crate::airtime::sf_index;
use crate::interference::{dbm_to_watts, overlap, overlap_window, InterferenceLedger, SignalEvent, SignalId};
use lorasim_common::CollisionWindow;
use serde::{Deserialize, Serialize};

/// Thermal noise floor used by the SINR diagnostic, in dBm.
pub const NOISE_FLOOR_DBM: f64 = -123.0;

/// Minimum SINR in dB for a signal of the row SF to survive interference
/// from the column SF (rows and columns are SF7..SF12).
pub const COLLISION_SNIR_DB: [[f64; 6]; 6] = [
    [6.0, -16.0, -18.0, -19.0, -19.0, -20.0],
    [-24.0, 6.0, -20.0, -22.0, -22.0, -22.0],
    [-27.0, -27.0, 6.0, -23.0, -25.0, -25.0],
    [-30.0, -30.0, -30.0, 6.0, -26.0, -28.0],
    [-33.0, -33.0, -33.0, -33.0, 6.0, -29.0],
    [-36.0, -36.0, -36.0, -36.0, -36.0, 6.0],
];

/// Isolation threshold for a focal SF against an interferer SF.
pub fn collision_snir_db(focal_sf: u8, interferer_sf: u8) -> f64 {
    COLLISION_SNIR_DB[sf_index(focal_sf)][sf_index(interferer_sf)]
}

/// Collision policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterferenceModel {
    /// Any same-SF overlap destroys.
    #[default]
    PureAloha,
    /// Strongest same-SF interferer must be weaker by at least `delta`.
    PowerLevel,
    /// Same-SF interference energy compared against the signal energy.
    CumulativeEnergy,
    /// Cross-SF isolation matrix with capture effect.
    Cochannel,
}

/// Verdict for one reception.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResolutionOutcome {
    /// Whether the frame is lost.
    pub destroyed: bool,
    /// Spreading factor blamed for the loss.
    pub destroying_sf: Option<u8>,
    /// Overlap with the dominant interferer, when destroyed.
    pub collision: Option<CollisionWindow>,
    /// Some relevant interferer overlapped the focal preamble of a
    /// destroyed frame. Always `false` for survivors.
    pub on_preamble: bool,
    /// A destroyed verdict was reversed by the capture effect.
    pub capture_effect: bool,
    /// Number of overlapping interferers the policy considered.
    pub interferers: usize,
    /// Ratio the verdict was based on, in dB. Power margin for
    /// `PowerLevel`, total SNIR for `CumulativeEnergy`, own-SF SNIR for
    /// `Cochannel`. `None` for `PureAloha` or without interferers.
    pub snir_db: Option<f64>,
}

/// A configured collision policy.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct InterferenceResolver {
    /// Policy.
    #[serde(default)]
    pub model: InterferenceModel,
    /// Threshold in dB used by `PowerLevel` and `CumulativeEnergy`.
    #[serde(default)]
    pub delta_db: f64,
}

impl InterferenceResolver {
    /// Create a resolver.
    pub fn new(model: InterferenceModel, delta_db: f64) -> Self {
        InterferenceResolver { model, delta_db }
    }

    /// Decide the fate of signal `focal`, which must be in `ledger`.
    pub fn resolve(&self, ledger: &InterferenceLedger, focal: SignalId) -> ResolutionOutcome {
        let Some(focal) = ledger.get(focal).copied() else {
            panic!("resolving {:?}, which is not in the ledger", focal);
        };
        match self.model {
            InterferenceModel::PureAloha => self.pure_aloha(ledger, &focal),
            InterferenceModel::PowerLevel => self.power_level(ledger, &focal),
            InterferenceModel::CumulativeEnergy => self.cumulative_energy(ledger, &focal),
            InterferenceModel::Cochannel => self.cochannel(ledger, &focal),
        }
    }

    fn pure_aloha(&self, ledger: &InterferenceLedger, focal: &SignalEvent) -> ResolutionOutcome {
        let interferers = same_sf_overlapping(ledger, focal);
        let destroyed = !interferers.is_empty();
        ResolutionOutcome {
            destroyed,
            destroying_sf: destroyed.then_some(focal.spreading_factor),
            collision: if destroyed { dominant_window(focal, &interferers) } else { None },
            on_preamble: destroyed && touches_preamble(focal, &interferers),
            interferers: interferers.len(),
            ..Default::default()
        }
    }

    fn power_level(&self, ledger: &InterferenceLedger, focal: &SignalEvent) -> ResolutionOutcome {
        let interferers = same_sf_overlapping(ledger, focal);
        let Some(max_i) = interferers
            .iter()
            .map(|e| e.rx_power_dbm)
            .max_by(|a, b| a.total_cmp(b))
        else {
            return ResolutionOutcome::default();
        };

        let margin = focal.rx_power_dbm - max_i;
        let survives = focal.rx_power_dbm > max_i && margin.abs() >= self.delta_db;
        ResolutionOutcome {
            destroyed: !survives,
            destroying_sf: (!survives).then_some(focal.spreading_factor),
            collision: if survives { None } else { dominant_window(focal, &interferers) },
            on_preamble: !survives && touches_preamble(focal, &interferers),
            interferers: interferers.len(),
            snir_db: Some(margin),
            ..Default::default()
        }
    }

    fn cumulative_energy(&self, ledger: &InterferenceLedger, focal: &SignalEvent) -> ResolutionOutcome {
        let interferers = same_sf_overlapping(ledger, focal);
        if interferers.is_empty() {
            return ResolutionOutcome::default();
        }
        let interference: f64 = interferers.iter().map(|e| interference_energy(focal, e)).sum();
        let snir = snir_db(signal_energy(focal), interference);
        let survives = snir >= self.delta_db;
        ResolutionOutcome {
            destroyed: !survives,
            destroying_sf: (!survives).then_some(focal.spreading_factor),
            collision: if survives { None } else { dominant_window(focal, &interferers) },
            on_preamble: !survives && touches_preamble(focal, &interferers),
            interferers: interferers.len(),
            snir_db: Some(snir),
            ..Default::default()
        }
    }

    fn cochannel(&self, ledger: &InterferenceLedger, focal: &SignalEvent) -> ResolutionOutcome {
        let interferers: Vec<&SignalEvent> = ledger
            .same_channel(focal)
            .filter(|e| overlap(focal, e) > lorasim_common::SimTime::ZERO)
            .collect();
        if interferers.is_empty() {
            return ResolutionOutcome::default();
        }

        let mut buckets = [0.0f64; 6];
        for e in &interferers {
            buckets[sf_index(e.spreading_factor)] += interference_energy(focal, e);
        }
        let first = interferers.iter().all(|e| focal.start < e.start);
        let on_preamble = touches_preamble(focal, &interferers);
        let signal = signal_energy(focal);

        // Worst margin below threshold decides which SF is blamed.
        let mut destroying: Option<(u8, f64)> = None;
        for (idx, &energy) in buckets.iter().enumerate() {
            if energy <= 0.0 {
                continue;
            }
            let sf = idx as u8 + 7;
            let margin = snir_db(signal, energy) - collision_snir_db(focal.spreading_factor, sf);
            if margin < 0.0 && destroying.map_or(true, |(_, worst)| margin < worst) {
                destroying = Some((sf, margin));
            }
        }

        let own = snir_db(signal, buckets[sf_index(focal.spreading_factor)]);
        let own_clear = own >= collision_snir_db(focal.spreading_factor, focal.spreading_factor);
        let capture_effect = destroying.is_some() && first && !on_preamble && own_clear;
        let destroying_sf = if capture_effect { None } else { destroying.map(|(sf, _)| sf) };

        let collision = destroying_sf.and_then(|sf| {
            let culprits: Vec<&SignalEvent> =
                interferers.iter().copied().filter(|e| e.spreading_factor == sf).collect();
            dominant_window(focal, &culprits)
        });

        ResolutionOutcome {
            destroyed: destroying_sf.is_some(),
            destroying_sf,
            collision,
            on_preamble: destroying_sf.is_some() && on_preamble,
            capture_effect,
            interferers: interferers.len(),
            snir_db: Some(own),
        }
    }

    /// SINR of `focal` against same-SF energy plus the noise floor.
    ///
    /// Diagnostic only, never used for a verdict.
    pub fn sinr_db(&self, ledger: &InterferenceLedger, focal: SignalId) -> f64 {
        let Some(focal) = ledger.get(focal).copied() else {
            panic!("SINR for {:?}, which is not in the ledger", focal);
        };
        let same_sf: f64 = same_sf_overlapping(ledger, &focal)
            .iter()
            .map(|e| interference_energy(&focal, e))
            .sum();
        10.0 * (signal_energy(&focal) / (same_sf + dbm_to_watts(NOISE_FLOOR_DBM))).log10()
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn same_sf_overlapping<'a>(ledger: &'a InterferenceLedger, focal: &'a SignalEvent) -> Vec<&'a SignalEvent> {
    ledger
        .same_channel(focal)
        .filter(|e| e.spreading_factor == focal.spreading_factor)
        .filter(|e| overlap(focal, e) > lorasim_common::SimTime::ZERO)
        .collect()
}

fn signal_energy(focal: &SignalEvent) -> f64 {
    focal.energy_j(focal.duration().as_secs_f64())
}

fn interference_energy(focal: &SignalEvent, interferer: &SignalEvent) -> f64 {
    interferer.energy_j(overlap(focal, interferer).as_secs_f64())
}

fn snir_db(signal: f64, interference: f64) -> f64 {
    10.0 * (signal / interference).log10()
}

fn touches_preamble(focal: &SignalEvent, interferers: &[&SignalEvent]) -> bool {
    let preamble_end = focal.preamble_end();
    interferers
        .iter()
        .any(|e| overlap_window(focal, e).is_some_and(|w| w.start < preamble_end))
}

/// Window of the interferer that put the most energy into the focal signal.
/// Ties go to the one that started first.
fn dominant_window(focal: &SignalEvent, interferers: &[&SignalEvent]) -> Option<CollisionWindow> {
    let mut best: Option<(&SignalEvent, f64)> = None;
    for &e in interferers {
        let energy = interference_energy(focal, e);
        let better = match best {
            None => true,
            Some((b, be)) => energy > be || (energy == be && e.start < b.start),
        };
        if better {
            best = Some((e, energy));
        }
    }
    best.and_then(|(e, _)| overlap_window(focal, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interference::test_support::*;
    use lorasim_common::SimTime;

    fn resolver(model: InterferenceModel, delta_db: f64) -> InterferenceResolver {
        InterferenceResolver::new(model, delta_db)
    }

    // ---------------------------------------------------------------- ALOHA

    #[test]
    fn test_aloha_destroys_both_on_same_sf_overlap() {
        let mut ledger = InterferenceLedger::new();
        let a = add_ms(&mut ledger, 1, 0, 1000, 7, -90.0);
        let b = add_ms(&mut ledger, 2, 50, 1000, 7, -60.0);
        let r = resolver(InterferenceModel::PureAloha, 0.0);

        let ra = r.resolve(&ledger, a.id);
        let rb = r.resolve(&ledger, b.id);
        assert!(ra.destroyed && rb.destroyed);
        assert_eq!(ra.destroying_sf, Some(7));
        assert_eq!(
            ra.collision,
            Some(CollisionWindow {
                start: SimTime::from_millis(50),
                end: SimTime::from_millis(1000),
            })
        );
        assert_eq!(rb.interferers, 1);
    }

    #[test]
    fn test_aloha_ignores_other_sf_and_disjoint() {
        let mut ledger = InterferenceLedger::new();
        let a = add_ms(&mut ledger, 1, 0, 1000, 7, -90.0);
        add_ms(&mut ledger, 2, 50, 1000, 12, -60.0);
        add_ms(&mut ledger, 3, 1000, 500, 7, -60.0);
        let out = resolver(InterferenceModel::PureAloha, 0.0).resolve(&ledger, a.id);
        assert!(!out.destroyed);
        assert_eq!(out.collision, None);
        assert_eq!(out.interferers, 0);
    }

    #[test]
    fn test_alone_in_ledger_survives_every_model() {
        let mut ledger = InterferenceLedger::new();
        let a = add_ms(&mut ledger, 1, 0, 1000, 9, -120.0);
        for model in [
            InterferenceModel::PureAloha,
            InterferenceModel::PowerLevel,
            InterferenceModel::CumulativeEnergy,
            InterferenceModel::Cochannel,
        ] {
            assert!(!resolver(model, 6.0).resolve(&ledger, a.id).destroyed, "{:?}", model);
        }
    }

    #[test]
    #[should_panic]
    fn test_resolving_unknown_signal_panics() {
        let ledger = InterferenceLedger::new();
        resolver(InterferenceModel::PureAloha, 0.0).resolve(&ledger, SignalId(3));
    }

    // ---------------------------------------------------------- Power level

    #[test]
    fn test_power_level_flips_once_across_delta() {
        let delta = 6.0;
        let r = resolver(InterferenceModel::PowerLevel, delta);
        let mut flips = 0;
        let mut previous: Option<bool> = None;
        // Focal from 10 dB below to 12 dB above an interferer at -100 dBm.
        for step in 0..=44 {
            let focal_power = -110.0 + step as f64 * 0.5;
            let mut ledger = InterferenceLedger::new();
            let f = add_ms(&mut ledger, 1, 0, 1000, 8, focal_power);
            add_ms(&mut ledger, 2, 100, 1000, 8, -100.0);
            let destroyed = r.resolve(&ledger, f.id).destroyed;
            let expected = !(focal_power > -100.0 && (focal_power + 100.0).abs() >= delta);
            assert_eq!(destroyed, expected, "focal {} dBm", focal_power);
            if let Some(p) = previous {
                if p != destroyed {
                    flips += 1;
                    assert!(p && !destroyed);
                }
            }
            previous = Some(destroyed);
        }
        assert_eq!(flips, 1);
    }

    #[test]
    fn test_power_level_equal_power_is_destroyed_even_with_zero_delta() {
        let mut ledger = InterferenceLedger::new();
        let f = add_ms(&mut ledger, 1, 0, 1000, 7, -100.0);
        add_ms(&mut ledger, 2, 0, 1000, 7, -100.0);
        let out = resolver(InterferenceModel::PowerLevel, 0.0).resolve(&ledger, f.id);
        assert!(out.destroyed);
        assert_eq!(out.snir_db, Some(0.0));
    }

    #[test]
    fn test_power_level_uses_strongest_interferer() {
        let mut ledger = InterferenceLedger::new();
        let f = add_ms(&mut ledger, 1, 0, 1000, 7, -90.0);
        add_ms(&mut ledger, 2, 100, 100, 7, -120.0);
        let strong = add_ms(&mut ledger, 3, 600, 1000, 7, -93.0);
        let out = resolver(InterferenceModel::PowerLevel, 6.0).resolve(&ledger, f.id);
        assert!(out.destroyed);
        assert_eq!(out.collision, overlap_window(&f, &strong));
    }

    // ----------------------------------------------------- Cumulative energy

    #[test]
    fn test_cumulative_energy_ignores_non_overlapping_interferers() {
        let r = resolver(InterferenceModel::CumulativeEnergy, 0.0);

        let mut single = InterferenceLedger::new();
        let f1 = add_ms(&mut single, 1, 1000, 1000, 9, -100.0);
        add_ms(&mut single, 2, 1500, 200, 9, -95.0);
        let alone = r.resolve(&single, f1.id).snir_db.unwrap();

        let mut crowded = InterferenceLedger::new();
        let f2 = add_ms(&mut crowded, 1, 1000, 1000, 9, -100.0);
        add_ms(&mut crowded, 2, 1500, 200, 9, -95.0);
        // Same SF, same channel, but before, touching or after the focal signal.
        add_ms(&mut crowded, 3, 0, 900, 9, -60.0);
        add_ms(&mut crowded, 4, 2000, 500, 9, -60.0);
        add_ms(&mut crowded, 5, 0, 1000, 9, -60.0);
        let with_others = r.resolve(&crowded, f2.id).snir_db.unwrap();

        assert_eq!(alone, with_others);
        // 1 s of -100 dBm against 0.2 s of -95 dBm.
        let expected = 10.0 * ((1.0 * dbm_to_watts(-100.0)) / (0.2 * dbm_to_watts(-95.0))).log10();
        assert!((alone - expected).abs() < 1e-9);
    }

    #[test]
    fn test_cumulative_energy_threshold() {
        let mut ledger = InterferenceLedger::new();
        let f = add_ms(&mut ledger, 1, 0, 1000, 7, -100.0);
        add_ms(&mut ledger, 2, 500, 1000, 7, -100.0);
        // Half the focal duration at equal power: SNIR = 10 log10(2) ~ 3.01 dB.
        let survive = resolver(InterferenceModel::CumulativeEnergy, 3.0).resolve(&ledger, f.id);
        assert!(!survive.destroyed);
        let lose = resolver(InterferenceModel::CumulativeEnergy, 3.1).resolve(&ledger, f.id);
        assert!(lose.destroyed);
        assert_eq!(lose.destroying_sf, Some(7));
    }

    // --------------------------------------------------------------- Cochannel

    #[test]
    fn test_collision_matrix_is_asymmetric_and_indexed_focal_first() {
        assert_eq!(collision_snir_db(7, 12), -20.0);
        assert_eq!(collision_snir_db(12, 7), -36.0);
        assert_ne!(collision_snir_db(8, 7), collision_snir_db(7, 8));
        for sf in 7..=12 {
            assert_eq!(collision_snir_db(sf, sf), 6.0);
        }
    }

    /// Focal SF7, interferer SF12 fully overlapping at a power that sits
    /// between the two thresholds: SF7 needs -20 dB, SF12 only -36 dB.
    #[test]
    fn test_cochannel_uses_focal_row() {
        let r = resolver(InterferenceModel::Cochannel, 0.0);
        let mut ledger = InterferenceLedger::new();
        let sf7 = add_ms(&mut ledger, 1, 0, 1000, 7, -130.0);
        let sf12 = add_ms(&mut ledger, 2, 0, 1000, 12, -105.0);

        // SF7 sees -25 dB against SF12: below -20, destroyed.
        let out7 = r.resolve(&ledger, sf7.id);
        assert!(out7.destroyed);
        assert_eq!(out7.destroying_sf, Some(12));

        // SF12 sees +25 dB against SF7: fine.
        let out12 = r.resolve(&ledger, sf12.id);
        assert!(!out12.destroyed);
    }

    #[test]
    fn test_cochannel_row_sf12_tolerates_more() {
        let r = resolver(InterferenceModel::Cochannel, 0.0);
        let mut ledger = InterferenceLedger::new();
        let sf12 = add_ms(&mut ledger, 1, 0, 1000, 12, -130.0);
        add_ms(&mut ledger, 2, 0, 1000, 7, -100.0);
        // -30 dB: above the SF12 row threshold of -36 dB.
        assert!(!r.resolve(&ledger, sf12.id).destroyed);
    }

    #[test]
    fn test_capture_effect_for_first_clean_preamble() {
        let r = resolver(InterferenceModel::Cochannel, 0.0);
        let mut ledger = InterferenceLedger::new();
        // Focal SF7 starts first; an SF8 interferer arrives after the preamble
        // and is strong enough to break SF7/SF8 isolation (-16 dB).
        let focal = add_ms(&mut ledger, 1, 0, 1000, 7, -120.0);
        add_ms(&mut ledger, 2, 100, 2000, 8, -100.0);

        let out = r.resolve(&ledger, focal.id);
        assert!(out.capture_effect);
        assert!(!out.destroyed);
        assert_eq!(out.destroying_sf, None);
        assert_eq!(out.collision, None);
    }

    #[test]
    fn test_no_capture_when_interferer_started_first() {
        let r = resolver(InterferenceModel::Cochannel, 0.0);
        let mut ledger = InterferenceLedger::new();
        add_ms(&mut ledger, 2, 0, 2000, 8, -100.0);
        let focal = add_ms(&mut ledger, 1, 100, 1000, 7, -120.0);

        let out = r.resolve(&ledger, focal.id);
        assert!(out.destroyed);
        assert!(!out.capture_effect);
        assert_eq!(out.destroying_sf, Some(8));
    }

    #[test]
    fn test_no_capture_when_preamble_is_hit() {
        let r = resolver(InterferenceModel::Cochannel, 0.0);
        let mut ledger = InterferenceLedger::new();
        // SF7 preamble lasts 12.544 ms; the interferer lands at 5 ms.
        let focal = add_ms(&mut ledger, 1, 0, 1000, 7, -120.0);
        add_ms(&mut ledger, 2, 5, 2000, 8, -100.0);

        let out = r.resolve(&ledger, focal.id);
        assert!(out.on_preamble);
        assert!(out.destroyed);
        assert!(!out.capture_effect);
    }

    #[test]
    fn test_survivor_never_reports_preamble_hit() {
        let mut ledger = InterferenceLedger::new();
        // The weak interferer lands inside the SF7 preamble (12.544 ms).
        let focal = add_ms(&mut ledger, 1, 0, 1000, 7, -60.0);
        let weak = add_ms(&mut ledger, 2, 5, 1000, 7, -100.0);

        let power = resolver(InterferenceModel::PowerLevel, 6.0);
        let out = power.resolve(&ledger, focal.id);
        assert!(!out.destroyed);
        assert!(!out.on_preamble);
        // The weak one is destroyed and was hit on its preamble by the strong one.
        let out = power.resolve(&ledger, weak.id);
        assert!(out.destroyed);
        assert!(out.on_preamble);

        let energy = resolver(InterferenceModel::CumulativeEnergy, 6.0);
        let out = energy.resolve(&ledger, focal.id);
        assert!(!out.destroyed);
        assert!(!out.on_preamble);

        let aloha = resolver(InterferenceModel::PureAloha, 0.0);
        let out = aloha.resolve(&ledger, focal.id);
        assert!(out.destroyed);
        assert!(out.on_preamble);
    }

    #[test]
    fn test_no_capture_when_own_sf_snir_fails() {
        let r = resolver(InterferenceModel::Cochannel, 0.0);
        let mut ledger = InterferenceLedger::new();
        let focal = add_ms(&mut ledger, 1, 0, 1000, 7, -120.0);
        add_ms(&mut ledger, 2, 100, 2000, 7, -100.0);

        let out = r.resolve(&ledger, focal.id);
        assert!(out.destroyed);
        assert!(!out.capture_effect);
        assert_eq!(out.destroying_sf, Some(7));
    }

    #[test]
    fn test_cochannel_blames_worst_margin() {
        let r = resolver(InterferenceModel::Cochannel, 0.0);
        let mut ledger = InterferenceLedger::new();
        add_ms(&mut ledger, 2, 0, 2000, 8, -105.0);
        let focal = add_ms(&mut ledger, 1, 10, 1000, 7, -120.0);
        let sf9 = add_ms(&mut ledger, 3, 20, 2000, 9, -90.0);

        let out = r.resolve(&ledger, focal.id);
        assert!(out.destroyed);
        // SF8: -15 vs -16 (margin +1, fine); SF9: -30 vs -18 (margin -12).
        assert_eq!(out.destroying_sf, Some(9));
        assert_eq!(out.collision, overlap_window(&focal, &sf9));
        assert_eq!(out.interferers, 2);
    }

    #[test]
    fn test_sinr_diagnostic() {
        let r = resolver(InterferenceModel::PureAloha, 0.0);
        let mut ledger = InterferenceLedger::new();
        let f = add_ms(&mut ledger, 1, 0, 1000, 7, -110.0);
        let expected = 10.0 * (dbm_to_watts(-110.0) / dbm_to_watts(NOISE_FLOOR_DBM)).log10();
        assert!((r.sinr_db(&ledger, f.id) - expected).abs() < 1e-9);

        // Other-SF energy does not count.
        add_ms(&mut ledger, 2, 0, 1000, 9, -80.0);
        assert!((r.sinr_db(&ledger, f.id) - expected).abs() < 1e-9);
    }
}
