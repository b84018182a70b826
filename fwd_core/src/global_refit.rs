//! Global re-fit: track parameters and silicon plane offsets together.
//!
//! Gauss-Newton over the five track parameters at the reference z plus one
//! in-plane offset (du, dv) per silicon plane on the track. The predicted
//! measurement on a silicon plane is `h(track) + (du, dv)`; offsets carry a
//! Gaussian prior of width `sigma_align` centred on zero. Scattering is not
//! modelled here, the Kalman fit supplies the starting point.

use crate::config::RefitConfig;
use crate::error::{FwdError, Result};
use crate::fitter::{FitResult, FitStage, Residual, TrajectoryFitter};
use crate::types::{PlaneKey, StateCov, Subsystem, TrackState};
use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector, Vector2};
use tracing::debug;

pub struct GlobalRefitter<'a> {
    fitter: &'a TrajectoryFitter<'a>,
    config: RefitConfig,
}

/// One linearisation of the problem.
struct NormalEquations {
    normal: DMatrix<f64>,
    rhs: DVector<f64>,
    chi2: f64,
    residuals: Vec<Residual>,
}

impl<'a> GlobalRefitter<'a> {
    pub fn new(fitter: &'a TrajectoryFitter<'a>, config: &RefitConfig) -> Self {
        Self {
            fitter,
            config: config.clone(),
        }
    }

    /// Re-fit a converged result. Errors leave the caller's result untouched.
    pub fn refit(&self, base: &FitResult) -> Result<FitResult> {
        let start = base.state.ok_or(FwdError::FitNotConverged)?;
        if self.config.sigma_align.is_nan() || self.config.sigma_align <= 0.0 {
            return Err(FwdError::Config(format!(
                "sigma_align must be positive, got {}",
                self.config.sigma_align
            )));
        }

        let mut keys: Vec<PlaneKey> = Vec::new();
        for key in base.points.iter().filter_map(|p| p.key()) {
            if key.layer.subsystem == Subsystem::Fst && !keys.contains(&key) {
                keys.push(key);
            }
        }

        let z0 = start.z;
        let mut params = start.params;
        let mut offsets = DVector::<f64>::zeros(2 * keys.len());

        for iteration in 1..=self.config.max_global_iterations {
            let state = TrackState::new(z0, params);
            let eq = self.linearize(base, &state, &keys, &offsets)?;
            let chol = Cholesky::new(eq.normal)
                .ok_or_else(|| FwdError::Propagation("global normal matrix is not positive definite".into()))?;
            let delta = chol.solve(&eq.rhs);

            for i in 0..5 {
                params[i] += delta[i];
            }
            for i in 0..offsets.len() {
                offsets[i] += delta[5 + i];
            }

            let step = delta.amax();
            if !step.is_finite() {
                return Err(FwdError::Propagation("global refit diverged".into()));
            }
            if step < self.config.global_tolerance {
                let inverse = chol.inverse();
                let state = TrackState::new(z0, params);
                debug!(
                    candidate = %base.candidate,
                    iteration,
                    chi2 = eq.chi2,
                    planes = keys.len(),
                    "global refit converged"
                );

                let mut result = base.clone();
                result.stage = FitStage::GlobalRefit;
                result.state = Some(state);
                result.covariance = StateCov::from_fn(|i, j| inverse[(i, j)]);
                result.momentum = state.momentum();
                result.charge = state.charge();
                result.chi2 = eq.chi2;
                result.residuals = eq.residuals;
                result.alignment_offsets = keys
                    .iter()
                    .enumerate()
                    .map(|(s, k)| (*k, Vector2::new(offsets[2 * s], offsets[2 * s + 1])))
                    .collect();
                return Ok(result);
            }
        }
        Err(FwdError::FitNotConverged)
    }

    fn linearize(
        &self,
        base: &FitResult,
        state: &TrackState,
        keys: &[PlaneKey],
        offsets: &DVector<f64>,
    ) -> Result<NormalEquations> {
        let n = 5 + offsets.len();
        let mut normal = DMatrix::<f64>::zeros(n, n);
        let mut rhs = DVector::<f64>::zeros(n);
        let mut chi2 = 0.0;
        let mut residuals = Vec::with_capacity(base.points.len());

        for point in &base.points {
            let m = point.realize(state);
            let (end, jac) = self.fitter.propagator().propagate_with_jacobian(state, None, &m.plane)?;
            let h = m
                .plane
                .measurement_matrix()
                .ok_or_else(|| FwdError::Propagation("measurement plane contains the beam axis".into()))?;
            let hj = h * jac;
            let slot = m.key.and_then(|k| keys.iter().position(|x| *x == k));

            let mut predicted = m.plane.to_local(&end.position());
            if let Some(s) = slot {
                predicted += Vector2::new(offsets[2 * s], offsets[2 * s + 1]);
            }
            let r = m.value - predicted;
            let w = m
                .cov
                .try_inverse()
                .ok_or_else(|| FwdError::Propagation("singular measurement covariance".into()))?;

            let mut a = DMatrix::<f64>::zeros(2, n);
            for row in 0..2 {
                for col in 0..5 {
                    a[(row, col)] = hj[(row, col)];
                }
            }
            if let Some(s) = slot {
                a[(0, 5 + 2 * s)] = 1.0;
                a[(1, 6 + 2 * s)] = 1.0;
            }
            let wd = DMatrix::from_fn(2, 2, |i, j| w[(i, j)]);
            let rd = DVector::from_column_slice(r.as_slice());
            let at_w = a.transpose() * wd;
            normal += &at_w * &a;
            rhs += at_w * rd;
            chi2 += (r.transpose() * w * r)[(0, 0)];
            residuals.push(Residual {
                key: m.key,
                value: r,
            });
        }

        let prior = 1.0 / (self.config.sigma_align * self.config.sigma_align);
        for i in 0..offsets.len() {
            normal[(5 + i, 5 + i)] += prior;
            rhs[5 + i] -= prior * offsets[i];
            chi2 += prior * offsets[i] * offsets[i];
        }

        Ok(NormalEquations {
            normal,
            rhs,
            chi2,
            residuals,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::diagnostics::NoopObserver;
    use crate::field::build_field;
    use crate::refine::RefinementFitter;
    use crate::test_support::{fst_hits, ftt_candidate, nominal_registry, truth_state};
    use crate::types::Hit;
    use approx::assert_abs_diff_eq;
    use nalgebra::Vector3;

    fn config() -> TrackerConfig {
        let mut config = TrackerConfig::default();
        config.refit.sigma_align = 1.0;
        config
    }

    #[test]
    fn recovers_injected_plane_offset() {
        let config = config();
        let registry = nominal_registry();
        let field = build_field(&config.field).unwrap();
        let fitter = TrajectoryFitter::new(&registry, &config, field.clone(), &NoopObserver);

        let truth = truth_state(Vector3::zeros(), Vector3::new(1.0, 0.5, 9.0), 1.0);
        let candidate = ftt_candidate(&registry, field.clone(), &truth, 1e-3);
        let mut extra = fst_hits(&registry, field, &truth, 1e-3);
        assert!(extra.iter().all(Option::is_some));

        // Shift the middle disk hit by 0.05 cm along its plane's u axis.
        let shifted: &mut Hit = extra[1].as_mut().unwrap();
        let key = registry.plane_for_hit(shifted).unwrap();
        let u = registry.get(&key).unwrap().u;
        shifted.position += u * 0.05;

        let base = fitter.fit_trajectory(&candidate, None, None);
        assert!(base.converged);
        let refined = RefinementFitter::new(&fitter, &config.refit).refine_with_extra_hits(&base, &extra, None);
        assert_eq!(refined.stage, FitStage::Refined);

        let global = GlobalRefitter::new(&fitter, &config.refit).refit(&refined).unwrap();
        assert_eq!(global.stage, FitStage::GlobalRefit);
        assert_eq!(global.alignment_offsets.len(), 3);
        for (k, offset) in &global.alignment_offsets {
            let expected = if *k == key { 0.05 } else { 0.0 };
            assert_abs_diff_eq!(offset.x, expected, epsilon = 2e-3);
            assert_abs_diff_eq!(offset.y, 0.0, epsilon = 2e-3);
        }
        assert!((global.pt() - truth.momentum().xy().norm()).abs() < 0.02);
        assert!(global.chi2 < 1.0, "chi2 = {}", global.chi2);
    }

    #[test]
    fn tracker_only_result_has_no_offsets() {
        let config = config();
        let registry = nominal_registry();
        let field = build_field(&config.field).unwrap();
        let fitter = TrajectoryFitter::new(&registry, &config, field.clone(), &NoopObserver);
        let truth = truth_state(Vector3::zeros(), Vector3::new(-0.7, 0.7, 8.0), -1.0);
        let base = fitter.fit_trajectory(&ftt_candidate(&registry, field, &truth, 1e-3), None, None);

        let global = GlobalRefitter::new(&fitter, &config.refit).refit(&base).unwrap();
        assert!(global.alignment_offsets.is_empty());
        let state = global.state.unwrap();
        let expected = fitter.propagator().propagate_to_z(&truth, state.z).unwrap();
        assert_abs_diff_eq!(state.params[0], expected.params[0], epsilon = 1e-3);
        assert_abs_diff_eq!(state.params[2], expected.params[2], epsilon = 1e-4);
    }

    #[test]
    fn tolerance_bounds_the_parameter_step() {
        let mut config = config();
        let registry = nominal_registry();
        let field = build_field(&config.field).unwrap();
        let fitter = TrajectoryFitter::new(&registry, &config, field.clone(), &NoopObserver);
        let truth = truth_state(Vector3::zeros(), Vector3::new(0.4, -0.9, 9.0), 1.0);
        let base = fitter.fit_trajectory(&ftt_candidate(&registry, field, &truth, 1e-3), None, None);
        assert!(base.converged);

        // Any step passes a loose bound, so the first iteration already converges.
        config.refit.global_tolerance = 1e9;
        let global = GlobalRefitter::new(&fitter, &config.refit).refit(&base).unwrap();
        assert_eq!(global.stage, FitStage::GlobalRefit);

        // No step is ever below zero.
        config.refit.global_tolerance = 0.0;
        config.refit.max_global_iterations = 3;
        assert_eq!(
            GlobalRefitter::new(&fitter, &config.refit).refit(&base).unwrap_err(),
            FwdError::FitNotConverged
        );
    }

    #[test]
    fn unconverged_input_is_rejected() {
        let config = config();
        let registry = nominal_registry();
        let field = build_field(&config.field).unwrap();
        let fitter = TrajectoryFitter::new(&registry, &config, field.clone(), &NoopObserver);
        let truth = truth_state(Vector3::zeros(), Vector3::new(0.5, 0.0, 8.0), 1.0);
        let mut candidate = ftt_candidate(&registry, field, &truth, 1e-3);
        candidate.hits.truncate(2);
        let base = fitter.fit_trajectory(&candidate, None, None);
        assert_eq!(
            GlobalRefitter::new(&fitter, &config.refit).refit(&base).unwrap_err(),
            FwdError::FitNotConverged
        );
    }
}
