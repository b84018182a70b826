//! Multiple scattering in detector planes (Highland formula).

use crate::config::MaterialConfig;
use crate::types::{PlaneKey, StateCov, StateVec, Subsystem};

#[derive(Clone, Debug)]
pub struct MaterialModel {
    config: MaterialConfig,
}

impl MaterialModel {
    pub fn new(config: MaterialConfig) -> Self {
        Self { config }
    }

    /// Thickness in radiation lengths of the plane behind `key`; zero for
    /// virtual planes or when material effects are off.
    pub fn thickness(&self, key: Option<&PlaneKey>) -> f64 {
        match key {
            Some(k) if self.config.enabled => match k.layer.subsystem {
                Subsystem::Fst => self.config.fst_x_over_x0,
                Subsystem::Ftt => self.config.ftt_x_over_x0,
            },
            _ => 0.0,
        }
    }

    /// RMS projected scattering angle after crossing `x_over_x0` at normal incidence.
    pub fn theta0(&self, state: &StateVec, x_over_x0: f64) -> f64 {
        let qop = state[4];
        if x_over_x0 <= 0.0 || qop == 0.0 {
            return 0.0;
        }
        let (tx, ty) = (state[2], state[3]);
        let path = x_over_x0 * (1.0 + tx * tx + ty * ty).sqrt();
        let p = 1.0 / qop.abs();
        let m = self.config.particle_mass;
        let beta = p / (p * p + m * m).sqrt();
        0.0136 / (beta * p) * path.sqrt() * (1.0 + 0.038 * path.ln())
    }

    /// Slope noise added to the covariance when crossing the plane.
    pub fn noise(&self, state: &StateVec, x_over_x0: f64) -> StateCov {
        let mut q = StateCov::zeros();
        let theta0 = self.theta0(state, x_over_x0);
        if theta0 <= 0.0 {
            return q;
        }
        let (tx, ty) = (state[2], state[3]);
        let n2 = 1.0 + tx * tx + ty * ty;
        let t2 = theta0 * theta0;
        q[(2, 2)] = t2 * (1.0 + tx * tx) * n2;
        q[(3, 3)] = t2 * (1.0 + ty * ty) * n2;
        q[(2, 3)] = t2 * tx * ty * n2;
        q[(3, 2)] = q[(2, 3)];
        q
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
