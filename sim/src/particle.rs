//! Truth particles and the particle gun.
//!
//! Each particle has a production vertex, a momentum (GeV) and a charge. The
//! gun draws pT and η uniformly, φ uniformly over the full circle, and the
//! vertex z from a Gaussian. All draws come from one seeded ChaCha8 stream.

use fwd_core::types::{pt_eta_phi, TrackState};
use nalgebra::Vector3;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

/// Charge assignment of generated particles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeSpec {
    Positive,
    Negative,
    /// Either sign with equal probability
    Random,
}

/// Gun settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GunSpec {
    /// Particles per event
    pub multiplicity: usize,
    /// pT range (GeV)
    pub pt_range: (f64, f64),
    /// Pseudorapidity range; the forward acceptance is roughly 2.5..4.0
    pub eta_range: (f64, f64),
    pub charge: ChargeSpec,
    /// Vertex z spread (cm)
    pub vertex_sigma_z: f64,
}

impl Default for GunSpec {
    fn default() -> Self {
        Self {
            multiplicity: 1,
            pt_range: (0.2, 5.0),
            eta_range: (2.5, 4.0),
            charge: ChargeSpec::Random,
            vertex_sigma_z: 0.0,
        }
    }
}

/// A generated particle with its ground truth.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    /// Unique within the event; also the candidate id
    pub id: u64,
    pub vertex: Vector3<f64>,
    pub momentum: Vector3<f64>,
    pub charge: i8,
}

impl Particle {
    pub fn pt(&self) -> f64 {
        pt_eta_phi(&self.momentum).0
    }

    pub fn eta(&self) -> f64 {
        pt_eta_phi(&self.momentum).1
    }

    /// Track state at the production vertex; `None` for backward particles.
    pub fn initial_state(&self) -> Option<TrackState> {
        TrackState::from_momentum(self.vertex, self.momentum, f64::from(self.charge))
    }
}

/// Momentum with transverse momentum `pt`, pseudorapidity `eta` and azimuth `phi`.
pub fn momentum_from(pt: f64, eta: f64, phi: f64) -> Vector3<f64> {
    Vector3::new(pt * phi.cos(), pt * phi.sin(), pt * eta.sinh())
}

pub struct ParticleGun {
    spec: GunSpec,
    rng: ChaCha8Rng,
}

impl ParticleGun {
    pub fn new(spec: GunSpec, seed: u64) -> Self {
        Self {
            spec,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn spec(&self) -> &GunSpec {
        &self.spec
    }

    /// Particles of one event, all sharing one vertex.
    pub fn shoot(&mut self) -> Vec<Particle> {
        let z = match Normal::new(0.0, self.spec.vertex_sigma_z) {
            Ok(n) if self.spec.vertex_sigma_z > 0.0 => n.sample(&mut self.rng),
            _ => 0.0,
        };
        let vertex = Vector3::new(0.0, 0.0, z);

        (0..self.spec.multiplicity)
            .map(|i| {
                let pt = uniform(&mut self.rng, self.spec.pt_range);
                let eta = uniform(&mut self.rng, self.spec.eta_range);
                let phi = self.rng.gen::<f64>() * TAU;
                let charge = match self.spec.charge {
                    ChargeSpec::Positive => 1,
                    ChargeSpec::Negative => -1,
                    ChargeSpec::Random => {
                        if self.rng.gen_bool(0.5) {
                            1
                        } else {
                            -1
                        }
                    }
                };
                Particle {
                    id: i as u64,
                    vertex,
                    momentum: momentum_from(pt, eta, phi),
                    charge,
                }
            })
            .collect()
    }
}

fn uniform(rng: &mut ChaCha8Rng, (lo, hi): (f64, f64)) -> f64 {
    if hi > lo {
        rng.gen_range(lo..hi)
    } else {
        lo
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
