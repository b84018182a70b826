//! Track propagation through a magnetic field.
//!
//! # State
//! (x, y, tx, ty, q/p) at z, with tx = dx/dz and ty = dy/dz.
//!
//! # Equations of motion
//! With N = √(1 + tx² + ty²) and κ = 2.99792458e-4 GeV/(kG·cm):
//! ```text
//! dtx/dz = κ·(q/p)·N·( tx·ty·Bx − (1 + tx²)·By + ty·Bz)
//! dty/dz = κ·(q/p)·N·((1 + ty²)·Bx − tx·ty·By − tx·Bz)
//! ```
//! integrated with fourth-order Runge-Kutta. Steps may be negative.
//!
//! Planes are reached by Newton iteration on the plane equation; the
//! transport Jacobian comes from central finite differences.

use crate::error::{FwdError, Result};
use crate::field::MagneticField;
use crate::plane::PlanePose;
use crate::types::{Jacobian, StateVec, TrackState};
use nalgebra::Vector3;
use std::sync::Arc;

/// Speed of light in GeV / (kGauss · cm).
pub const KAPPA: f64 = 2.99792458e-4;

/// Finite-difference steps for (x, y, tx, ty, q/p).
const JACOBIAN_STEPS: [f64; 5] = [1e-4, 1e-4, 1e-6, 1e-6, 1e-6];

const MAX_NEWTON_ITERATIONS: usize = 20;
const NEWTON_TOLERANCE_CM: f64 = 1e-8;
/// |(tx, ty, 1)·n| below this: track runs parallel to the plane.
const MIN_DIRECTION_DOT_NORMAL: f64 = 1e-9;
const MAX_SLOPE: f64 = 1e3;

#[derive(Clone)]
pub struct Propagator {
    field: Arc<dyn MagneticField>,
    max_step: f64,
}

impl Propagator {
    pub fn new(field: Arc<dyn MagneticField>, max_step: f64) -> Self {
        Self { field, max_step }
    }

    pub fn field(&self) -> &dyn MagneticField {
        self.field.as_ref()
    }

    /// d(state)/dz.
    fn derivative(&self, z: f64, s: &StateVec) -> StateVec {
        let (tx, ty, qop) = (s[2], s[3], s[4]);
        let b = self.field.field(&Vector3::new(s[0], s[1], z));
        let k = KAPPA * qop * (1.0 + tx * tx + ty * ty).sqrt();
        StateVec::new(
            tx,
            ty,
            k * (tx * ty * b.x - (1.0 + tx * tx) * b.y + ty * b.z),
            k * ((1.0 + ty * ty) * b.x - tx * ty * b.y - tx * b.z),
            0.0,
        )
    }

    fn rk4_step(&self, z: f64, s: &StateVec, h: f64) -> StateVec {
        let k1 = self.derivative(z, s);
        let k2 = self.derivative(z + h / 2.0, &(s + k1 * (h / 2.0)));
        let k3 = self.derivative(z + h / 2.0, &(s + k2 * (h / 2.0)));
        let k4 = self.derivative(z + h, &(s + k3 * h));
        s + (k1 + k2 * 2.0 + k3 * 2.0 + k4) * (h / 6.0)
    }

    /// Propagate to a fixed z.
    pub fn propagate_to_z(&self, state: &TrackState, z: f64) -> Result<TrackState> {
        if !z.is_finite() {
            return Err(FwdError::Propagation(format!("target z {z} is not finite")));
        }
        let dz = z - state.z;
        if dz == 0.0 {
            return Ok(*state);
        }
        let n_steps = (dz.abs() / self.max_step).ceil().max(1.0) as usize;
        let h = dz / n_steps as f64;

        let mut params = state.params;
        let mut current_z = state.z;
        for _ in 0..n_steps {
            params = self.rk4_step(current_z, &params, h);
            current_z += h;
            if params.iter().any(|v| !v.is_finite()) {
                return Err(FwdError::Propagation(format!("non-finite state near z = {current_z:.3}")));
            }
            if params[2].abs() > MAX_SLOPE || params[3].abs() > MAX_SLOPE {
                return Err(FwdError::Propagation(format!("track turned over near z = {current_z:.3}")));
            }
        }
        Ok(TrackState::new(z, params))
    }

    /// Propagate onto a plane; the returned state lies on it.
    pub fn propagate_to_plane(&self, state: &TrackState, plane: &PlanePose) -> Result<TrackState> {
        let n = plane.normal();
        let mut current = *state;
        for _ in 0..MAX_NEWTON_ITERATIONS {
            let d = Vector3::new(current.params[2], current.params[3], 1.0);
            let dn = d.dot(&n);
            if dn.abs() < MIN_DIRECTION_DOT_NORMAL || !dn.is_finite() {
                return Err(FwdError::Propagation("track parallel to target plane".into()));
            }
            let f = plane.distance(&current.position());
            if !f.is_finite() {
                return Err(FwdError::Propagation("non-finite distance to plane".into()));
            }
            if f.abs() < NEWTON_TOLERANCE_CM {
                return Ok(current);
            }
            current = self.propagate_to_z(&current, current.z - f / dn)?;
        }
        Err(FwdError::Propagation(format!(
            "plane intersection did not converge in {MAX_NEWTON_ITERATIONS} iterations"
        )))
    }

    /// Propagate onto `to` and return the transport Jacobian d(end)/d(start).
    /// When `from` is given the start parameters are taken as living on that
    /// plane, so perturbing x or y moves z along it.
    pub fn propagate_with_jacobian(
        &self,
        state: &TrackState,
        from: Option<&PlanePose>,
        to: &PlanePose,
    ) -> Result<(TrackState, Jacobian)> {
        let end = self.propagate_to_plane(state, to)?;
        let mut jac = Jacobian::zeros();
        for (col, step) in JACOBIAN_STEPS.iter().enumerate() {
            let shifted = |sign: f64| -> Result<TrackState> {
                let mut s = *state;
                s.params[col] += sign * step;
                if let Some(plane) = from {
                    if let Some(z) = plane.z_at(s.params[0], s.params[1]) {
                        s.z = z;
                    }
                }
                self.propagate_to_plane(&s, to)
            };
            let plus = shifted(1.0)?;
            let minus = shifted(-1.0)?;
            jac.set_column(col, &((plus.params - minus.params) / (2.0 * step)));
        }
        Ok((end, jac))
    }
}

/// Place `params` on `plane`: z follows (x, y) through the plane equation.
pub fn on_plane(params: StateVec, plane: &PlanePose) -> Result<TrackState> {
    plane
        .z_at(params[0], params[1])
        .map(|z| TrackState::new(z, params))
        .ok_or_else(|| FwdError::Propagation("plane contains the beam axis".into()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{ConstantField, ZeroField};
    use approx::assert_relative_eq;

    fn solenoid() -> Propagator {
        Propagator::new(Arc::new(ConstantField(Vector3::new(0.0, 0.0, 5.0))), 10.0)
    }

    #[test]
    fn straight_line_in_zero_field() {
        let p = Propagator::new(Arc::new(ZeroField), 10.0);
        let s = TrackState::new(0.0, StateVec::new(1.0, -2.0, 0.1, 0.05, 0.5));
        let end = p.propagate_to_z(&s, 300.0).unwrap();
        assert_relative_eq!(end.params[0], 31.0, epsilon = 1e-10);
        assert_relative_eq!(end.params[1], 13.0, epsilon = 1e-10);
        assert_relative_eq!(end.params[2], 0.1, epsilon = 1e-12);
    }

    #[test]
    fn helix_matches_analytic_solution() {
        // In a uniform Bz the transverse direction rotates by κ·B·(q/p)·N per unit z.
        let p = solenoid();
        let (tx, ty, qop) = (0.1, 0.0, 0.5);
        let s = TrackState::new(0.0, StateVec::new(0.0, 0.0, tx, ty, qop));
        let end = p.propagate_to_z(&s, 300.0).unwrap();

        let pt_over_pz = tx;
        let omega = -KAPPA * 5.0 * qop * (1.0f64 + tx * tx).sqrt();
        let phi = omega * 300.0;
        assert_relative_eq!(end.params[2], pt_over_pz * phi.cos(), epsilon = 1e-9);
        assert_relative_eq!(end.params[3], pt_over_pz * phi.sin(), epsilon = 1e-9);
        assert_relative_eq!(end.params[0], pt_over_pz * phi.sin() / omega, epsilon = 1e-7);
        assert_relative_eq!(end.params[1], pt_over_pz * (1.0 - phi.cos()) / omega, epsilon = 1e-7);
    }

    #[test]
    fn backward_propagation_retraces() {
        let p = solenoid();
        let s = TrackState::new(150.0, StateVec::new(3.0, 4.0, 0.05, -0.08, -0.7));
        let there = p.propagate_to_z(&s, 340.0).unwrap();
        let back = p.propagate_to_z(&there, 150.0).unwrap();
        assert_relative_eq!(back.params, s.params, epsilon = 1e-9);
    }

    #[test]
    fn lands_on_tilted_plane() {
        let p = solenoid();
        let plane = PlanePose::perpendicular_to(Vector3::new(10.0, 5.0, 300.0), &Vector3::new(0.2, 0.1, 1.0));
        let s = TrackState::new(0.0, StateVec::new(0.0, 0.0, 0.03, 0.02, 0.5));
        let end = p.propagate_to_plane(&s, &plane).unwrap();
        assert_relative_eq!(plane.distance(&end.position()), 0.0, epsilon = 1e-7);
    }

    #[test]
    fn parallel_plane_fails() {
        let p = Propagator::new(Arc::new(ZeroField), 10.0);
        let plane = PlanePose::new(Vector3::new(100.0, 0.0, 0.0), Vector3::y(), Vector3::z());
        let s = TrackState::new(0.0, StateVec::new(0.0, 0.0, 0.0, 0.0, 0.5));
        assert!(matches!(p.propagate_to_plane(&s, &plane), Err(FwdError::Propagation(_))));
    }

    #[test]
    fn jacobian_of_straight_line_is_analytic() {
        let p = Propagator::new(Arc::new(ZeroField), 10.0);
        let s = TrackState::new(100.0, StateVec::new(1.0, 1.0, 0.1, 0.2, 0.5));
        let (_, j) = p.propagate_with_jacobian(&s, None, &PlanePose::nominal(150.0)).unwrap();
        let mut expected = Jacobian::identity();
        expected[(0, 2)] = 50.0;
        expected[(1, 3)] = 50.0;
        assert_relative_eq!(j, expected, epsilon = 1e-6);
    }
}
