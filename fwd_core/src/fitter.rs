//! Iterative two-hypothesis trajectory fit.
//!
//! # Per hypothesis
//! 1. Start from the seed state with q/p = ±1/|p| and an inflated diagonal
//!    covariance.
//! 2. Forward Kalman pass over all points, then a backward pass starting
//!    from the forward end state with the covariance inflated again.
//! 3. The backward-filtered state at the first point becomes the reference
//!    state and seeds the next iteration. χ² is the sum of the predicted
//!    residual χ² of the backward pass.
//! 4. Stop once |Δχ²| is below the absolute or relative tolerance (never
//!    before `min_iterations`), or give up after `max_iterations`.
//!
//! The two hypotheses are fitted independently; the converged one with the
//! lowest χ² is the cardinal result (ties go to the positive hypothesis).

use crate::config::{FitterConfig, TrackerConfig, VertexConfig};
use crate::diagnostics::{events, FitObserver};
use crate::error::{FwdError, Result};
use crate::field::MagneticField;
use crate::kf::{covariance_is_valid, KalmanFilter, TrackKalmanFilter};
use crate::material::MaterialModel;
use crate::measurement::TrackPoint;
use crate::plane::PlanePose;
use crate::propagation::Propagator;
use crate::registry::PlaneRegistry;
use crate::seed::{Seed, SeedEstimator};
use crate::types::{
    pt_eta_phi, Candidate, CandidateId, ChargeHypothesis, PlaneKey, StateCov, StateVec, TrackState,
};
use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Smallest |q/p| used to size the seed q/p uncertainty.
const MIN_QOP_SCALE: f64 = 1e-3;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStage {
    Initial,
    Refined,
    GlobalRefit,
}

/// Outcome of one charge hypothesis.
#[derive(Clone, Debug)]
pub struct HypothesisFit {
    pub hypothesis: ChargeHypothesis,
    pub converged: bool,
    pub iterations: usize,
    /// χ² of the last completed iteration
    pub chi2: Option<f64>,
    pub state: Option<TrackState>,
    pub cov: Option<StateCov>,
    pub failure: Option<FwdError>,
}

/// Measured minus predicted local position at one trajectory point.
#[derive(Clone, Debug, PartialEq)]
pub struct Residual {
    pub key: Option<PlaneKey>,
    pub value: Vector2<f64>,
}

/// Local position of a fitted track on a plane.
#[derive(Clone, Debug)]
pub struct Projection {
    pub key: PlaneKey,
    pub local: Vector2<f64>,
    pub state: TrackState,
    /// Local position covariance, when a state covariance was supplied
    pub cov: Option<Matrix2<f64>>,
}

#[derive(Clone, Debug)]
pub struct FitResult {
    pub candidate: CandidateId,
    pub stage: FitStage,
    pub converged: bool,
    /// Reference state at the first trajectory point; `None` unless converged
    pub state: Option<TrackState>,
    pub covariance: StateCov,
    /// Zero unless converged
    pub momentum: Vector3<f64>,
    pub charge: i8,
    pub chi2: f64,
    pub ndf: i32,
    /// Detector hits used (the vertex is not counted)
    pub n_hits: usize,
    pub duration: Duration,
    pub cardinal: Option<ChargeHypothesis>,
    pub hypotheses: Vec<HypothesisFit>,
    pub seed: Option<Seed>,
    pub points: Vec<TrackPoint>,
    pub residuals: Vec<Residual>,
    /// Fitted (du, dv) per silicon plane, global re-fit only
    pub alignment_offsets: Vec<(PlaneKey, Vector2<f64>)>,
    pub failure: Option<FwdError>,
}

impl FitResult {
    /// Result of a fit that stopped before any hypothesis ran.
    fn aborted(candidate: CandidateId, error: FwdError, duration: Duration) -> Self {
        Self {
            candidate,
            stage: FitStage::Initial,
            converged: false,
            state: None,
            covariance: StateCov::zeros(),
            momentum: Vector3::zeros(),
            charge: 0,
            chi2: 0.0,
            ndf: 0,
            n_hits: 0,
            duration,
            cardinal: None,
            hypotheses: Vec::new(),
            seed: None,
            points: Vec::new(),
            residuals: Vec::new(),
            alignment_offsets: Vec::new(),
            failure: Some(error),
        }
    }

    pub fn pt(&self) -> f64 {
        pt_eta_phi(&self.momentum).0
    }

    pub fn eta(&self) -> f64 {
        pt_eta_phi(&self.momentum).1
    }

    pub fn phi(&self) -> f64 {
        pt_eta_phi(&self.momentum).2
    }

    pub fn chi2_per_ndf(&self) -> f64 {
        if self.ndf > 0 {
            self.chi2 / self.ndf as f64
        } else {
            0.0
        }
    }
}

// ---------------------------------------------------------------------------
// Fitter
// ---------------------------------------------------------------------------

/// One forward + backward pass.
struct Pass {
    state: TrackState,
    cov: StateCov,
    plane: PlanePose,
    chi2: f64,
}

pub struct TrajectoryFitter<'a> {
    registry: &'a PlaneRegistry,
    kalman: TrackKalmanFilter,
    seeds: SeedEstimator,
    config: FitterConfig,
    vertex: VertexConfig,
    z_tolerance: f64,
    observer: &'a dyn FitObserver,
}

impl<'a> TrajectoryFitter<'a> {
    pub fn new(
        registry: &'a PlaneRegistry,
        config: &TrackerConfig,
        field: Arc<dyn MagneticField>,
        observer: &'a dyn FitObserver,
    ) -> Self {
        let propagator = Propagator::new(field, config.field.max_step_cm);
        Self {
            registry,
            kalman: TrackKalmanFilter::new(propagator, MaterialModel::new(config.material.clone())),
            seeds: SeedEstimator::new(config.seed.clone()),
            config: config.fitter.clone(),
            vertex: config.vertex.clone(),
            z_tolerance: config.geometry.z_mismatch_tolerance,
            observer,
        }
    }

    pub fn registry(&self) -> &'a PlaneRegistry {
        self.registry
    }

    pub fn propagator(&self) -> &Propagator {
        &self.kalman.propagator
    }

    pub fn observer(&self) -> &'a dyn FitObserver {
        self.observer
    }

    pub fn config(&self) -> &FitterConfig {
        &self.config
    }

    pub fn z_tolerance(&self) -> f64 {
        self.z_tolerance
    }

    /// The vertex as a trajectory point, if the vertex is part of the fit.
    /// Smearing is reproducible per candidate.
    pub fn vertex_point(&self, candidate: CandidateId, vertex: Option<Vector3<f64>>) -> Option<TrackPoint> {
        if !self.vertex.include_in_fit {
            return None;
        }
        let (sxy, sz) = (self.vertex.sigma_xy, self.vertex.sigma_z);
        let mut position = vertex.unwrap_or_else(|| Vector3::from(self.vertex.position));
        if self.vertex.smear {
            match (Normal::new(0.0, sxy), Normal::new(0.0, sz)) {
                (Ok(nxy), Ok(nz)) => {
                    let mut rng = ChaCha8Rng::seed_from_u64(self.vertex.random_seed.wrapping_add(candidate.0));
                    position += Vector3::new(nxy.sample(&mut rng), nxy.sample(&mut rng), nz.sample(&mut rng));
                }
                _ => warn!(sigma_xy = sxy, sigma_z = sz, "invalid vertex resolution, not smearing"),
            }
        }
        let cov = Matrix3::from_diagonal(&Vector3::new(sxy * sxy, sxy * sxy, sz * sz));
        Some(TrackPoint::vertex(position, cov))
    }

    /// Fit one candidate: seed, both hypotheses, cardinal selection.
    pub fn fit_trajectory(
        &self,
        candidate: &Candidate,
        vertex: Option<Vector3<f64>>,
        seed_momentum: Option<Vector3<f64>>,
    ) -> FitResult {
        let start = Instant::now();
        self.observer.record(events::FIT_TOTAL, 1.0);

        let hits = candidate.ordered_hits();
        let seed = match self.seeds.estimate(&hits) {
            Ok(seed) => seed,
            Err(e) => return self.abort(candidate.id, e, start),
        };
        self.observer.record(events::SEED_CURVATURE, seed.curvature);
        self.observer.record(events::SEED_PT, seed.pt);
        self.observer.record(events::SEED_ETA, seed.eta);

        let n_layers = candidate.n_layers();
        if n_layers < self.config.min_layers {
            let e = FwdError::InsufficientHits {
                required: self.config.min_layers,
                found: n_layers,
            };
            return self.abort(candidate.id, e, start);
        }

        let vertex_point = self.vertex_point(candidate.id, vertex);
        let origin = vertex_point.as_ref().map_or(seed.position, TrackPoint::position);
        let mut points: Vec<TrackPoint> = vertex_point.into_iter().collect();
        for hit in &hits {
            match TrackPoint::from_hit(hit, self.registry, self.z_tolerance) {
                Ok(p) => points.push(p),
                Err(e) => return self.abort(candidate.id, e, start),
            }
        }

        let momentum = seed_momentum.unwrap_or(seed.momentum);
        let mut result = self.fit_points(candidate.id, points, origin, momentum, start);
        self.report(&result, &seed);
        result.seed = Some(seed);
        result
    }

    fn abort(&self, candidate: CandidateId, error: FwdError, start: Instant) -> FitResult {
        debug!(%candidate, %error, "fit not attempted");
        let duration = start.elapsed();
        self.observer.record(events::FIT_FAIL, 1.0);
        self.observer.record(events::FIT_FAILED_DURATION_MS, duration.as_secs_f64() * 1e3);
        FitResult::aborted(candidate, error, duration)
    }

    fn report(&self, result: &FitResult, seed: &Seed) {
        let ms = result.duration.as_secs_f64() * 1e3;
        if result.converged {
            self.observer.record(events::FIT_PASS, 1.0);
            self.observer.record(events::FIT_GOOD_CARDINAL, 1.0);
            self.observer.record(events::FIT_DURATION_MS, ms);
            self.observer.record(events::DELTA_SEED_PT, result.pt() - seed.pt);
            self.observer.record(events::DELTA_SEED_ETA, result.eta() - seed.eta);
            self.observer.record(events::DELTA_SEED_PHI, result.phi() - seed.phi);
        } else {
            self.observer.record(events::FIT_FAIL, 1.0);
            self.observer.record(events::FIT_FAILED_DURATION_MS, ms);
        }
        let raised = result
            .hypotheses
            .iter()
            .any(|h| matches!(&h.failure, Some(e) if *e != FwdError::FitNotConverged));
        if raised {
            self.observer.record(events::FIT_EXCEPTION, 1.0);
        }
    }

    /// Fit an explicit point list starting at `origin` with `momentum`.
    pub(crate) fn fit_points(
        &self,
        candidate: CandidateId,
        points: Vec<TrackPoint>,
        origin: Vector3<f64>,
        momentum: Vector3<f64>,
        start: Instant,
    ) -> FitResult {
        let n_hits = points.iter().filter(|p| !p.is_vertex()).count();
        let ndf = (points.iter().map(TrackPoint::dim).sum::<usize>() as i32) - 5;

        let (positive, negative) = rayon::join(
            || self.fit_hypothesis(&points, origin, momentum, ChargeHypothesis::Positive),
            || self.fit_hypothesis(&points, origin, momentum, ChargeHypothesis::Negative),
        );
        let hypotheses = vec![positive, negative];
        let (best, converged) = select_cardinal(&hypotheses);
        let cardinal = &hypotheses[best];

        let mut result = FitResult::aborted(candidate, FwdError::FitNotConverged, Duration::ZERO);
        result.n_hits = n_hits;
        result.ndf = ndf;
        result.cardinal = Some(cardinal.hypothesis);
        result.chi2 = cardinal.chi2.unwrap_or(0.0);

        match (converged, cardinal.state, cardinal.cov) {
            (true, Some(state), Some(cov)) => {
                result.converged = true;
                result.failure = None;
                result.state = Some(state);
                result.covariance = cov;
                result.momentum = state.momentum();
                result.charge = state.charge();
                result.residuals = self.residuals(&points, &state);
            }
            _ => {
                result.failure = cardinal.failure.clone().or(Some(FwdError::FitNotConverged));
            }
        }
        result.hypotheses = hypotheses;
        result.points = points;
        result.duration = start.elapsed();

        debug!(
            %candidate,
            converged = result.converged,
            chi2 = result.chi2,
            ndf = result.ndf,
            cardinal = %cardinal_label(result.cardinal),
            pt = result.pt(),
            "trajectory fit finished"
        );
        result
    }

    fn seed_covariance(&self, state: &TrackState) -> StateCov {
        let c = &self.config;
        let sq = c.seed_sigma_qop_rel * state.qop().abs().max(MIN_QOP_SCALE);
        let diag = StateVec::new(
            c.seed_sigma_position.powi(2),
            c.seed_sigma_position.powi(2),
            c.seed_sigma_slope.powi(2),
            c.seed_sigma_slope.powi(2),
            sq * sq,
        );
        StateCov::from_diagonal(&diag) * c.cov_inflation
    }

    fn fit_hypothesis(
        &self,
        points: &[TrackPoint],
        origin: Vector3<f64>,
        momentum: Vector3<f64>,
        hypothesis: ChargeHypothesis,
    ) -> HypothesisFit {
        let mut fit = HypothesisFit {
            hypothesis,
            converged: false,
            iterations: 0,
            chi2: None,
            state: None,
            cov: None,
            failure: None,
        };
        let Some(initial) = TrackState::from_momentum(origin, momentum, hypothesis.sign()) else {
            fit.failure = Some(FwdError::Propagation("seed momentum does not point forward".into()));
            return fit;
        };

        let mut reference = initial;
        let mut reference_plane: Option<PlanePose> = None;
        for iteration in 1..=self.config.max_iterations {
            fit.iterations = iteration;
            let pass = match self.kalman_passes(points, &reference, reference_plane.as_ref()) {
                Ok(pass) => pass,
                Err(e) => {
                    trace!(%hypothesis, iteration, error = %e, "hypothesis aborted");
                    fit.failure = Some(e);
                    return fit;
                }
            };
            if !covariance_is_valid(&pass.cov) {
                fit.failure = Some(FwdError::Propagation("fitted covariance is not valid".into()));
                return fit;
            }
            trace!(%hypothesis, iteration, chi2 = pass.chi2, qop = pass.state.qop(), "pass done");

            let settled = fit.chi2.is_some_and(|previous| {
                let delta = (pass.chi2 - previous).abs();
                delta < self.config.delta_chi2_abs || delta < self.config.delta_chi2_rel * pass.chi2
            });
            fit.chi2 = Some(pass.chi2);
            fit.state = Some(pass.state);
            fit.cov = Some(pass.cov);
            reference = pass.state;
            reference_plane = Some(pass.plane);

            if settled && iteration >= self.config.min_iterations {
                fit.converged = true;
                return fit;
            }
        }
        fit.failure = Some(FwdError::FitNotConverged);
        fit
    }

    fn kalman_passes(
        &self,
        points: &[TrackPoint],
        start: &TrackState,
        start_plane: Option<&PlanePose>,
    ) -> Result<Pass> {
        let first = points.first().ok_or(FwdError::InsufficientHits {
            required: self.config.min_layers,
            found: 0,
        })?;
        let inflated = self.seed_covariance(start);

        // Forward
        let mut state = *start;
        let mut cov = inflated;
        let mut plane = start_plane.copied();
        let mut key: Option<PlaneKey> = None;
        for point in points {
            (state, cov, plane, key) = self.step(point, &state, &cov, plane.as_ref(), key.as_ref())?.0;
        }

        // Backward, from the forward end state with a fresh covariance
        let mut cov = self.seed_covariance(&state);
        let mut key: Option<PlaneKey> = None;
        let mut chi2 = 0.0;
        for point in points.iter().rev() {
            let (next, point_chi2) = self.step(point, &state, &cov, plane.as_ref(), key.as_ref())?;
            (state, cov, plane, key) = next;
            chi2 += point_chi2;
        }

        let plane = plane.unwrap_or_else(|| first.realize(&state).plane);
        Ok(Pass {
            state,
            cov,
            plane,
            chi2,
        })
    }

    /// Predict onto the point's plane and update with it.
    #[allow(clippy::type_complexity)]
    fn step(
        &self,
        point: &TrackPoint,
        state: &TrackState,
        cov: &StateCov,
        from: Option<&PlanePose>,
        from_key: Option<&PlaneKey>,
    ) -> Result<((TrackState, StateCov, Option<PlanePose>, Option<PlaneKey>), f64)> {
        let m = point.realize(state);
        let thickness = self.kalman.material.thickness(from_key);
        let pred = self.kalman.predict(state, cov, from, &m.plane, thickness)?;
        let upd = self.kalman.update(&pred.state, &pred.cov, &m.plane, &m.value, &m.cov)?;
        Ok(((upd.state, upd.cov, Some(m.plane), m.key), upd.chi2))
    }

    /// Residuals of every point with respect to `reference`.
    pub fn residuals(&self, points: &[TrackPoint], reference: &TrackState) -> Vec<Residual> {
        points
            .iter()
            .filter_map(|point| {
                let m = point.realize(reference);
                let at = self.kalman.propagator.propagate_to_plane(reference, &m.plane).ok()?;
                Some(Residual {
                    key: m.key,
                    value: m.value - m.plane.to_local(&at.position()),
                })
            })
            .collect()
    }

    /// Extrapolate `state` onto a registered plane.
    pub fn project_to_plane(
        &self,
        key: &PlaneKey,
        state: &TrackState,
        cov: Option<&StateCov>,
    ) -> Result<Projection> {
        let plane = self.registry.get(key)?;
        let (end, jac) = self.kalman.propagator.propagate_with_jacobian(state, None, plane)?;
        let local = plane.to_local(&end.position());
        let cov = match cov {
            Some(c) => {
                let h = plane
                    .measurement_matrix()
                    .ok_or_else(|| FwdError::Propagation("plane contains the beam axis".into()))?;
                Some(h * jac * c * jac.transpose() * h.transpose())
            }
            None => None,
        };
        Ok(Projection {
            key: *key,
            local,
            state: end,
            cov,
        })
    }
}

/// Index of the cardinal hypothesis and whether it converged.
fn select_cardinal(hypotheses: &[HypothesisFit]) -> (usize, bool) {
    let lowest = |converged_only: bool| {
        hypotheses
            .iter()
            .enumerate()
            .filter(|(_, h)| !converged_only || h.converged)
            .filter_map(|(i, h)| h.chi2.map(|c| (i, c)))
            .fold(None, |best: Option<(usize, f64)>, (i, c)| match best {
                Some((_, b)) if b <= c => best,
                _ => Some((i, c)),
            })
            .map(|(i, _)| i)
    };
    match lowest(true) {
        Some(i) => (i, true),
        None => (lowest(false).unwrap_or(0), false),
    }
}

fn cardinal_label(h: Option<ChargeHypothesis>) -> String {
    h.map_or_else(|| "none".to_string(), |h| h.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
