//! Extended Kalman filter on the 5-parameter track state.
//!
//! # Design choices
//! - Prediction transports the state with the RK4 [`Propagator`] and the
//!   covariance with the finite-difference Jacobian: P' = J·(P + Q)·Jᵀ, where
//!   Q is the scattering noise of the plane being left.
//! - Measurements are 2D (u, v) on a plane. For a state on the plane the
//!   projection is linear in (x, y), so H is exact.
//! - The update uses the Joseph form for the covariance.

use crate::error::{FwdError, Result};
use crate::material::MaterialModel;
use crate::plane::PlanePose;
use crate::propagation::{on_plane, Propagator};
use crate::types::{Jacobian, StateCov, TrackState};
use nalgebra::{Matrix2, Matrix5x2, Vector2};

/// Relative asymmetry tolerated in a covariance matrix.
const SYMMETRY_TOLERANCE: f64 = 1e-6;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Predict + update on detector planes.
pub trait KalmanFilter {
    /// Transport state and covariance from `from` (if the state lies on a
    /// plane) onto `to`, adding the scattering of `x_over_x0` at the start.
    fn predict(
        &self,
        state: &TrackState,
        cov: &StateCov,
        from: Option<&PlanePose>,
        to: &PlanePose,
        x_over_x0: f64,
    ) -> Result<Prediction>;

    /// Update a state lying on `plane` with the local measurement `z` of
    /// covariance `r`.
    fn update(
        &self,
        state: &TrackState,
        cov: &StateCov,
        plane: &PlanePose,
        z: &Vector2<f64>,
        r: &Matrix2<f64>,
    ) -> Result<KfUpdateResult>;
}

#[derive(Clone, Debug)]
pub struct Prediction {
    pub state: TrackState,
    pub cov: StateCov,
    pub jacobian: Jacobian,
}

/// Result of a KF update step.
#[derive(Clone, Debug)]
pub struct KfUpdateResult {
    pub state: TrackState,
    pub cov: StateCov,
    /// Innovation ν = z − h(x)
    pub innovation: Vector2<f64>,
    /// Innovation covariance S = H·P·Hᵀ + R
    pub innovation_cov: Matrix2<f64>,
    pub kalman_gain: Matrix5x2<f64>,
    /// Predicted-residual χ² = νᵀ·S⁻¹·ν
    pub chi2: f64,
}

// ---------------------------------------------------------------------------
// Track filter
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct TrackKalmanFilter {
    pub propagator: Propagator,
    pub material: MaterialModel,
}

impl TrackKalmanFilter {
    pub fn new(propagator: Propagator, material: MaterialModel) -> Self {
        Self {
            propagator,
            material,
        }
    }
}

impl KalmanFilter for TrackKalmanFilter {
    fn predict(
        &self,
        state: &TrackState,
        cov: &StateCov,
        from: Option<&PlanePose>,
        to: &PlanePose,
        x_over_x0: f64,
    ) -> Result<Prediction> {
        let (end, jac) = self.propagator.propagate_with_jacobian(state, from, to)?;
        let noisy = cov + self.material.noise(&state.params, x_over_x0);
        let predicted = jac * noisy * jac.transpose();
        Ok(Prediction {
            state: end,
            cov: symmetrize(&predicted),
            jacobian: jac,
        })
    }

    fn update(
        &self,
        state: &TrackState,
        cov: &StateCov,
        plane: &PlanePose,
        z: &Vector2<f64>,
        r: &Matrix2<f64>,
    ) -> Result<KfUpdateResult> {
        let h = plane
            .measurement_matrix()
            .ok_or_else(|| FwdError::Propagation("measurement plane contains the beam axis".into()))?;

        // Innovation: ν = z − h(x)
        let innovation = z - plane.to_local(&state.position());

        // Innovation covariance: S = H·P·Hᵀ + R
        let s = h * cov * h.transpose() + r;
        let s_inv = s
            .try_inverse()
            .ok_or_else(|| FwdError::Propagation("innovation covariance is singular".into()))?;

        // Kalman gain: K = P·Hᵀ·S⁻¹
        let k = cov * h.transpose() * s_inv;

        let params = state.params + k * innovation;
        let new_state = on_plane(params, plane)?;

        // Joseph form P' = (I−KH)·P·(I−KH)ᵀ + K·R·Kᵀ
        let i_kh = StateCov::identity() - k * h;
        let new_cov = i_kh * cov * i_kh.transpose() + k * r * k.transpose();

        let chi2 = (innovation.transpose() * s_inv * innovation)[(0, 0)];

        Ok(KfUpdateResult {
            state: new_state,
            cov: symmetrize(&new_cov),
            innovation,
            innovation_cov: s,
            kalman_gain: k,
            chi2,
        })
    }
}

fn symmetrize(m: &StateCov) -> StateCov {
    (m + m.transpose()) * 0.5
}

/// Finite, symmetric, with a strictly positive diagonal.
pub fn covariance_is_valid(cov: &StateCov) -> bool {
    if cov.iter().any(|v| !v.is_finite()) {
        return false;
    }
    if (0..5).any(|i| cov[(i, i)] <= 0.0) {
        return false;
    }
    (0..5).all(|i| {
        (0..i).all(|j| {
            let scale = (cov[(i, i)] * cov[(j, j)]).sqrt();
            (cov[(i, j)] - cov[(j, i)]).abs() <= SYMMETRY_TOLERANCE * scale
        })
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
