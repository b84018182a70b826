//! Refinement: refit a converged track with extra silicon hits and the vertex.
//!
//! Point order of the refit is vertex, extra hits, then the original points.
//! The refit starts from the base result's momentum; anything that goes wrong
//! returns the base result unchanged. The optional global re-fit runs on top
//! and is best-effort.

use crate::config::RefitConfig;
use crate::diagnostics::events;
use crate::error::FwdError;
use crate::fitter::{FitResult, FitStage, TrajectoryFitter};
use crate::global_refit::GlobalRefitter;
use crate::measurement::TrackPoint;
use crate::types::{Hit, TrackState};
use nalgebra::Vector3;
use std::time::Instant;
use tracing::{debug, warn};

pub struct RefinementFitter<'a> {
    fitter: &'a TrajectoryFitter<'a>,
    config: RefitConfig,
}

impl<'a> RefinementFitter<'a> {
    pub fn new(fitter: &'a TrajectoryFitter<'a>, config: &RefitConfig) -> Self {
        Self {
            fitter,
            config: config.clone(),
        }
    }

    /// Refit `base` with `extra` hits (one optional hit per silicon disk).
    pub fn refine_with_extra_hits(
        &self,
        base: &FitResult,
        extra: &[Option<Hit>],
        vertex: Option<Vector3<f64>>,
    ) -> FitResult {
        let Some(reference) = base.state.filter(|_| base.converged) else {
            return base.clone();
        };
        let start = Instant::now();

        let vertex_point = self.fitter.vertex_point(base.candidate, vertex);
        let mut added = Vec::new();
        for hit in extra.iter().flatten() {
            match TrackPoint::from_hit(hit, self.fitter.registry(), self.fitter.z_tolerance()) {
                Ok(point) => added.push(point),
                Err(FwdError::UnknownPlane(key)) => {
                    warn!(candidate = %base.candidate, plane = %key, "extra hit on unknown plane, skipped")
                }
                Err(e) => warn!(candidate = %base.candidate, error = %e, "extra hit skipped"),
            }
        }
        if added.is_empty() && vertex_point.is_none() {
            return base.clone();
        }

        let with_vertex = vertex_point.is_some();
        let points: Vec<TrackPoint> = vertex_point
            .into_iter()
            .chain(added)
            .chain(base.points.iter().filter(|p| !p.is_vertex()).cloned())
            .collect();
        let required = self.fitter.config().min_layers + usize::from(with_vertex);
        if points.len() < required {
            debug!(candidate = %base.candidate, points = points.len(), required, "too few points to refine");
            return base.clone();
        }

        let (origin, momentum) = start_point(self.fitter, &points[0], &reference, base.momentum);
        let mut refined = self.fitter.fit_points(base.candidate, points, origin, momentum, start);
        if !refined.converged {
            warn!(
                candidate = %base.candidate,
                error = %refined.failure.as_ref().map_or_else(String::new, |e| e.to_string()),
                "refit did not converge, keeping base fit"
            );
            return base.clone();
        }
        refined.stage = FitStage::Refined;
        refined.seed = base.seed.clone();
        debug!(
            candidate = %base.candidate,
            chi2 = refined.chi2,
            ndf = refined.ndf,
            pt = refined.pt(),
            "refined with silicon"
        );

        if !self.config.global_refit {
            return refined;
        }
        match GlobalRefitter::new(self.fitter, &self.config).refit(&refined) {
            Ok(global) => global,
            Err(e) => {
                warn!(candidate = %base.candidate, error = %e, "global refit failed, keeping refined fit");
                self.fitter.observer().record(events::GLOBAL_REFIT_FAILED, 1.0);
                refined
            }
        }
    }
}

/// Base state carried back to the first point of the refit; the raw point
/// position and base momentum when that propagation fails.
fn start_point(
    fitter: &TrajectoryFitter<'_>,
    first: &TrackPoint,
    reference: &TrackState,
    momentum: Vector3<f64>,
) -> (Vector3<f64>, Vector3<f64>) {
    let plane = first.realize(reference).plane;
    match fitter.propagator().propagate_to_plane(reference, &plane) {
        Ok(state) if state.qop() != 0.0 => (state.position(), state.momentum()),
        _ => (first.position(), momentum),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::diagnostics::{HistogramObserver, NoopObserver};
    use crate::field::build_field;
    use crate::test_support::{fst_hits, ftt_candidate, nominal_registry, truth_state};
    use crate::types::{LayerId, Subsystem};

    fn setup(config: &TrackerConfig) -> (crate::registry::PlaneRegistry, std::sync::Arc<dyn crate::field::MagneticField>) {
        (nominal_registry(), build_field(&config.field).unwrap())
    }

    #[test]
    fn nothing_to_add_returns_base() {
        let config = TrackerConfig::default();
        let (registry, field) = setup(&config);
        let fitter = TrajectoryFitter::new(&registry, &config, field.clone(), &NoopObserver);
        let truth = truth_state(Vector3::zeros(), Vector3::new(0.8, 0.3, 7.0), 1.0);
        let base = fitter.fit_trajectory(&ftt_candidate(&registry, field, &truth, 1e-3), None, None);

        let refined = RefinementFitter::new(&fitter, &config.refit).refine_with_extra_hits(&base, &[None, None, None], None);
        assert_eq!(refined.stage, FitStage::Initial);
        assert_eq!(refined.state, base.state);
        assert_eq!(refined.chi2, base.chi2);
    }

    #[test]
    fn too_few_points_returns_base_unchanged() {
        let config = TrackerConfig::default();
        let (registry, field) = setup(&config);
        let fitter = TrajectoryFitter::new(&registry, &config, field.clone(), &NoopObserver);
        let truth = truth_state(Vector3::zeros(), Vector3::new(0.9, 0.2, 8.0), 1.0);
        let base = fitter.fit_trajectory(&ftt_candidate(&registry, field.clone(), &truth, 1e-3), None, None);
        assert!(base.converged);

        // Four tracker hits plus one disk fall short of six required points.
        let mut strict = config.clone();
        strict.fitter.min_layers = 6;
        let strict_fitter = TrajectoryFitter::new(&registry, &strict, field.clone(), &NoopObserver);
        let mut extra = fst_hits(&registry, field, &truth, 1e-3);
        extra[1] = None;
        extra[2] = None;
        assert!(extra[0].is_some());

        let refined = RefinementFitter::new(&strict_fitter, &strict.refit).refine_with_extra_hits(&base, &extra, None);
        assert_eq!(refined.stage, FitStage::Initial);
        assert_eq!(refined.n_hits, 4);
        assert_eq!(refined.state, base.state);
        assert_eq!(refined.chi2, base.chi2);
        assert_eq!(refined.points.len(), base.points.len());
    }

    #[test]
    fn unconverged_base_is_returned_unchanged() {
        let config = TrackerConfig::default();
        let (registry, field) = setup(&config);
        let fitter = TrajectoryFitter::new(&registry, &config, field.clone(), &NoopObserver);
        let truth = truth_state(Vector3::zeros(), Vector3::new(0.8, 0.3, 7.0), 1.0);
        let mut candidate = ftt_candidate(&registry, field.clone(), &truth, 1e-3);
        candidate.hits.truncate(2);
        let base = fitter.fit_trajectory(&candidate, None, None);
        let extra = fst_hits(&registry, field, &truth, 1e-3);

        let refined = RefinementFitter::new(&fitter, &config.refit).refine_with_extra_hits(&base, &extra, None);
        assert!(!refined.converged);
        assert!(refined.points.is_empty());
        assert_eq!(refined.failure, base.failure);
    }

    #[test]
    fn silicon_hits_join_the_fit() {
        let config = TrackerConfig::default();
        let (registry, field) = setup(&config);
        let fitter = TrajectoryFitter::new(&registry, &config, field.clone(), &NoopObserver);
        let truth = truth_state(Vector3::zeros(), Vector3::new(1.2, -0.4, 10.0), -1.0);
        let base = fitter.fit_trajectory(&ftt_candidate(&registry, field.clone(), &truth, 1e-3), None, None);
        assert!(base.converged);

        let extra = fst_hits(&registry, field, &truth, 1e-3);
        let refined = RefinementFitter::new(&fitter, &config.refit).refine_with_extra_hits(&base, &extra, None);
        assert!(refined.converged, "{:?}", refined.failure);
        assert_eq!(refined.stage, FitStage::Refined);
        assert_eq!(refined.n_hits, 7);
        assert_eq!(refined.ndf, 9);
        assert_eq!(refined.points[0].key().unwrap().layer, LayerId::fst(0));
        assert!(refined.state.unwrap().z < 160.0);
        assert_eq!(refined.charge, -1);
        assert!((refined.pt() - 1.2649).abs() < 0.03, "pt = {}", refined.pt());
        // Seed is carried over from the initial fit.
        assert_eq!(refined.seed, base.seed);
    }

    #[test]
    fn missing_disks_and_unknown_planes_are_skipped() {
        let config = TrackerConfig::default();
        let (registry, field) = setup(&config);
        let fitter = TrajectoryFitter::new(&registry, &config, field.clone(), &NoopObserver);
        let truth = truth_state(Vector3::zeros(), Vector3::new(0.5, 0.5, 6.0), 1.0);
        let base = fitter.fit_trajectory(&ftt_candidate(&registry, field.clone(), &truth, 1e-3), None, None);

        let mut extra = fst_hits(&registry, field, &truth, 1e-3);
        extra[0] = None;
        if let Some(hit) = extra[2].as_mut() {
            hit.layer = LayerId::fst(5);
        }
        let refined = RefinementFitter::new(&fitter, &config.refit).refine_with_extra_hits(&base, &extra, None);
        assert!(refined.converged);
        let silicon = refined
            .points
            .iter()
            .filter(|p| p.key().is_some_and(|k| k.layer.subsystem == Subsystem::Fst))
            .count();
        assert_eq!(silicon, 1);
        assert_eq!(refined.n_hits, 5);
    }

    #[test]
    fn vertex_only_refinement() {
        let mut config = TrackerConfig::default();
        config.vertex.include_in_fit = true;
        config.vertex.sigma_xy = 0.01;
        config.vertex.sigma_z = 0.01;
        let (registry, field) = setup(&config);
        let fitter = TrajectoryFitter::new(&registry, &config, field.clone(), &NoopObserver);
        let truth = truth_state(Vector3::zeros(), Vector3::new(1.0, 0.0, 8.0), 1.0);
        let base = fitter.fit_trajectory(&ftt_candidate(&registry, field, &truth, 1e-3), None, None);
        assert!(base.converged);

        let refined = RefinementFitter::new(&fitter, &config.refit).refine_with_extra_hits(&base, &[], None);
        assert_eq!(refined.stage, FitStage::Refined);
        assert!(refined.points[0].is_vertex());
        assert_eq!(refined.points.iter().filter(|p| p.is_vertex()).count(), 1);
    }

    #[test]
    fn failed_global_refit_keeps_refined_result() {
        let mut config = TrackerConfig::default();
        config.refit.global_refit = true;
        config.refit.max_global_iterations = 0;
        let (registry, field) = setup(&config);
        let observer = HistogramObserver::new();
        let fitter = TrajectoryFitter::new(&registry, &config, field.clone(), &observer);
        let truth = truth_state(Vector3::zeros(), Vector3::new(1.0, 1.0, 9.0), 1.0);
        let base = fitter.fit_trajectory(&ftt_candidate(&registry, field.clone(), &truth, 1e-3), None, None);

        let extra = fst_hits(&registry, field, &truth, 1e-3);
        let refined = RefinementFitter::new(&fitter, &config.refit).refine_with_extra_hits(&base, &extra, None);
        assert!(refined.converged);
        assert_eq!(refined.stage, FitStage::Refined);
        assert!(refined.alignment_offsets.is_empty());
        assert_eq!(observer.get(events::GLOBAL_REFIT_FAILED).unwrap().count, 1);
    }

    #[test]
    fn global_refit_runs_when_enabled() {
        let mut config = TrackerConfig::default();
        config.refit.global_refit = true;
        let (registry, field) = setup(&config);
        let fitter = TrajectoryFitter::new(&registry, &config, field.clone(), &NoopObserver);
        let truth = truth_state(Vector3::zeros(), Vector3::new(-1.0, 1.0, 9.0), 1.0);
        let base = fitter.fit_trajectory(&ftt_candidate(&registry, field.clone(), &truth, 1e-3), None, None);

        let extra = fst_hits(&registry, field, &truth, 1e-3);
        let result = RefinementFitter::new(&fitter, &config.refit).refine_with_extra_hits(&base, &extra, None);
        assert_eq!(result.stage, FitStage::GlobalRefit);
        assert_eq!(result.alignment_offsets.len(), 3);
    }
}
