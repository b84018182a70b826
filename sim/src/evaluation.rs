//! Fit performance against truth: pT resolution, charge assignment, efficiency.

use crate::particle::Particle;
use fwd_core::FitResult;
use serde::{Deserialize, Serialize};

/// Accumulated performance statistics.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FitPerformance {
    /// Number of events evaluated
    pub n_events: u64,
    /// Truth particles seen
    pub n_particles: u64,
    /// Fits evaluated (one per candidate)
    pub n_fits: u64,
    /// Fits that converged
    pub n_converged: u64,
    /// Converged fits with the right charge sign
    pub n_charge_correct: u64,
    /// Sum of (pT_fit − pT_true) / pT_true over converged fits
    pub sum_rel_pt: f64,
    /// Sum of squares of the same
    pub sum_sq_rel_pt: f64,
}

impl FitPerformance {
    /// Fraction of truth particles with a converged fit.
    pub fn efficiency(&self) -> f64 {
        if self.n_particles == 0 {
            return 0.0;
        }
        self.n_converged as f64 / self.n_particles as f64
    }

    pub fn charge_purity(&self) -> f64 {
        if self.n_converged == 0 {
            return 0.0;
        }
        self.n_charge_correct as f64 / self.n_converged as f64
    }

    /// Mean relative pT bias.
    pub fn pt_bias(&self) -> f64 {
        if self.n_converged == 0 {
            return 0.0;
        }
        self.sum_rel_pt / self.n_converged as f64
    }

    /// RMS of the relative pT error.
    pub fn pt_resolution(&self) -> f64 {
        if self.n_converged == 0 {
            return 0.0;
        }
        (self.sum_sq_rel_pt / self.n_converged as f64).sqrt()
    }

    /// Accumulate one event. Fits are matched to truth by candidate id.
    pub fn accumulate(&mut self, truth: &[Particle], fits: &[FitResult]) {
        self.n_events += 1;
        self.n_particles += truth.len() as u64;
        for fit in fits {
            self.n_fits += 1;
            if !fit.converged {
                continue;
            }
            let Some(particle) = truth.iter().find(|p| p.id == fit.candidate.0) else {
                continue;
            };
            self.n_converged += 1;
            if fit.charge == particle.charge {
                self.n_charge_correct += 1;
            }
            let true_pt = particle.pt();
            if true_pt > 0.0 {
                let rel = (fit.pt() - true_pt) / true_pt;
                self.sum_rel_pt += rel;
                self.sum_sq_rel_pt += rel * rel;
            }
        }
    }

    pub fn merge(&mut self, other: &FitPerformance) {
        self.n_events += other.n_events;
        self.n_particles += other.n_particles;
        self.n_fits += other.n_fits;
        self.n_converged += other.n_converged;
        self.n_charge_correct += other.n_charge_correct;
        self.sum_rel_pt += other.sum_rel_pt;
        self.sum_sq_rel_pt += other.sum_sq_rel_pt;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_performance_is_zero() {
        let p = FitPerformance::default();
        assert_eq!(p.efficiency(), 0.0);
        assert_eq!(p.pt_resolution(), 0.0);
        assert_eq!(p.charge_purity(), 0.0);
    }

    #[test]
    fn merge_adds_counts() {
        let mut a = FitPerformance {
            n_events: 1,
            n_particles: 2,
            n_converged: 2,
            n_charge_correct: 1,
            sum_sq_rel_pt: 0.02,
            ..Default::default()
        };
        let b = a.clone();
        a.merge(&b);
        assert_eq!(a.n_particles, 4);
        assert_eq!(a.charge_purity(), 0.5);
        assert_eq!(a.efficiency(), 1.0);
        assert!((a.pt_resolution() - 0.1).abs() < 1e-12);
    }
}
