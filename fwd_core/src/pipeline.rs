//! Event pipeline: the full fit cycle for one event.
//!
//! # Processing steps per event
//! 1. Fit every candidate (both charge hypotheses), candidates in parallel
//! 2. Refine converged fits with their silicon hits and the vertex
//! 3. Tally per-event statistics and per-track summaries

use crate::{
    config::{RefitConfig, TrackerConfig},
    diagnostics::FitObserver,
    field::MagneticField,
    fitter::{FitResult, FitStage, TrajectoryFitter},
    refine::RefinementFitter,
    registry::PlaneRegistry,
    types::{Candidate, ChargeHypothesis, Hit},
};
use nalgebra::Vector3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc, time::Instant};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// A track candidate plus the silicon hits proposed for it, one slot per disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventCandidate {
    pub candidate: Candidate,
    pub silicon_hits: Vec<Option<Hit>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    /// Primary vertex, if known
    pub vertex: Option<Vector3<f64>>,
    pub candidates: Vec<EventCandidate>,
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Counters over fitted candidates.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EventStats {
    pub total: usize,
    pub converged: usize,
    pub refined: usize,
    pub refined_converged: usize,
    pub global_refit: usize,
    pub global_refit_failed: usize,
    /// Failed initial fits by error kind
    pub failures: BTreeMap<String, usize>,
}

impl EventStats {
    fn tally(&mut self, initial: &FitResult, last: &FitResult, global_enabled: bool) {
        self.total += 1;
        if initial.converged {
            self.converged += 1;
        } else if let Some(e) = &initial.failure {
            *self.failures.entry(e.kind().to_string()).or_default() += 1;
        }
        if last.stage != FitStage::Initial {
            self.refined += 1;
            if last.converged {
                self.refined_converged += 1;
            }
        }
        match last.stage {
            FitStage::GlobalRefit => self.global_refit += 1,
            FitStage::Refined if global_enabled => self.global_refit_failed += 1,
            _ => {}
        }
    }

    pub fn merge(&mut self, other: &EventStats) {
        self.total += other.total;
        self.converged += other.converged;
        self.refined += other.refined;
        self.refined_converged += other.refined_converged;
        self.global_refit += other.global_refit;
        self.global_refit_failed += other.global_refit_failed;
        for (kind, n) in &other.failures {
            *self.failures.entry(kind.clone()).or_default() += n;
        }
    }
}

/// Flat per-track record for reports.
#[derive(Clone, Debug, Serialize)]
pub struct TrackSummary {
    pub candidate: u64,
    pub converged: bool,
    pub stage: FitStage,
    pub cardinal: Option<ChargeHypothesis>,
    pub charge: i8,
    pub pt: f64,
    pub eta: f64,
    pub phi: f64,
    pub chi2: f64,
    pub ndf: i32,
    pub n_hits: usize,
    pub failure: Option<String>,
}

impl From<&FitResult> for TrackSummary {
    fn from(r: &FitResult) -> Self {
        Self {
            candidate: r.candidate.0,
            converged: r.converged,
            stage: r.stage,
            cardinal: r.cardinal,
            charge: r.charge,
            pt: r.pt(),
            eta: r.eta(),
            phi: r.phi(),
            chi2: r.chi2,
            ndf: r.ndf,
            n_hits: r.n_hits,
            failure: r.failure.as_ref().map(|e| e.to_string()),
        }
    }
}

/// Outputs of one event.
#[derive(Clone, Debug)]
pub struct EventOutput {
    pub event: u64,
    /// Final result per candidate, in input order
    pub fits: Vec<FitResult>,
    pub stats: EventStats,
    /// Timings in microseconds
    pub timing_fit_us: u64,
    pub timing_refine_us: u64,
    pub total_time_us: u64,
}

impl EventOutput {
    pub fn summaries(&self) -> Vec<TrackSummary> {
        self.fits.iter().map(TrackSummary::from).collect()
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct EventFitter<'a> {
    fitter: TrajectoryFitter<'a>,
    refit: RefitConfig,
}

impl<'a> EventFitter<'a> {
    pub fn new(
        registry: &'a PlaneRegistry,
        config: &TrackerConfig,
        field: Arc<dyn MagneticField>,
        observer: &'a dyn FitObserver,
    ) -> Self {
        Self {
            fitter: TrajectoryFitter::new(registry, config, field, observer),
            refit: config.refit.clone(),
        }
    }

    pub fn fitter(&self) -> &TrajectoryFitter<'a> {
        &self.fitter
    }

    pub fn process_event(&self, event: &Event) -> EventOutput {
        let start_total = Instant::now();

        // ----------------------------------------------------------------
        // Step 1: Initial fits (parallel over candidates)
        // ----------------------------------------------------------------
        let t0 = Instant::now();
        let initial: Vec<FitResult> = event
            .candidates
            .par_iter()
            .map(|c| self.fitter.fit_trajectory(&c.candidate, event.vertex, None))
            .collect();
        let timing_fit_us = t0.elapsed().as_micros() as u64;

        // ----------------------------------------------------------------
        // Step 2: Silicon refinement
        // ----------------------------------------------------------------
        let t0 = Instant::now();
        let refined: Option<Vec<FitResult>> = self.refit.refine_with_silicon.then(|| {
            let refiner = RefinementFitter::new(&self.fitter, &self.refit);
            initial
                .par_iter()
                .zip(event.candidates.par_iter())
                .map(|(fit, c)| refiner.refine_with_extra_hits(fit, &c.silicon_hits, event.vertex))
                .collect()
        });
        let timing_refine_us = t0.elapsed().as_micros() as u64;

        // ----------------------------------------------------------------
        // Step 3: Statistics
        // ----------------------------------------------------------------
        let mut stats = EventStats::default();
        let fits = match refined {
            Some(refined) => {
                for (a, b) in initial.iter().zip(&refined) {
                    stats.tally(a, b, self.refit.global_refit);
                }
                refined
            }
            None => {
                for a in &initial {
                    stats.tally(a, a, false);
                }
                initial
            }
        };

        debug!(
            event = event.id,
            candidates = stats.total,
            converged = stats.converged,
            refined = stats.refined,
            fit_us = timing_fit_us,
            refine_us = timing_refine_us,
            "event fitted"
        );

        EventOutput {
            event: event.id,
            fits,
            stats,
            timing_fit_us,
            timing_refine_us,
            total_time_us: start_total.elapsed().as_micros() as u64,
        }
    }

    /// Process events in order and return the outputs plus merged statistics.
    pub fn process_events(&self, events: &[Event]) -> (Vec<EventOutput>, EventStats) {
        let outputs: Vec<EventOutput> = events.iter().map(|e| self.process_event(e)).collect();
        let mut total = EventStats::default();
        for out in &outputs {
            total.merge(&out.stats);
        }
        info!(
            events = outputs.len(),
            candidates = total.total,
            converged = total.converged,
            refined_converged = total.refined_converged,
            "run finished"
        );
        (outputs, total)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{events, HistogramObserver, NoopObserver};
    use crate::field::build_field;
    use crate::test_support::{fst_hits, ftt_candidate, nominal_registry, truth_state};
    use crate::types::CandidateId;

    fn make_event(registry: &PlaneRegistry, field: Arc<dyn MagneticField>) -> Event {
        let momenta = [
            (Vector3::new(1.0, 0.2, 9.0), 1.0),
            (Vector3::new(-0.6, 0.8, 7.0), -1.0),
            (Vector3::new(0.3, -1.5, 12.0), 1.0),
        ];
        let mut candidates: Vec<EventCandidate> = momenta
            .iter()
            .enumerate()
            .map(|(i, (p, q))| {
                let truth = truth_state(Vector3::zeros(), *p, *q);
                let mut candidate = ftt_candidate(registry, field.clone(), &truth, 1e-3);
                candidate.id = CandidateId(i as u64);
                EventCandidate {
                    candidate,
                    silicon_hits: fst_hits(registry, field.clone(), &truth, 1e-3),
                }
            })
            .collect();
        // A candidate with too few layers.
        let mut short = candidates[0].clone();
        short.candidate.id = CandidateId(9);
        short.candidate.hits.truncate(2);
        candidates.push(short);
        Event {
            id: 42,
            vertex: Some(Vector3::zeros()),
            candidates,
        }
    }

    #[test]
    fn event_fit_and_refine() {
        let config = TrackerConfig::default();
        let registry = nominal_registry();
        let field = build_field(&config.field).unwrap();
        let observer = HistogramObserver::new();
        let pipeline = EventFitter::new(&registry, &config, field.clone(), &observer);

        let out = pipeline.process_event(&make_event(&registry, field));
        assert_eq!(out.event, 42);
        assert_eq!(out.fits.len(), 4);
        assert_eq!(out.stats.total, 4);
        assert_eq!(out.stats.converged, 3);
        assert_eq!(out.stats.refined, 3);
        assert_eq!(out.stats.refined_converged, 3);
        assert_eq!(out.stats.failures.get("insufficient_hits"), Some(&1));
        assert_eq!(out.fits[3].candidate, CandidateId(9));
        assert!(!out.fits[3].converged);
        assert!(out.fits[..3].iter().all(|f| f.stage == FitStage::Refined && f.n_hits == 7));
        assert_eq!(observer.get(events::FIT_TOTAL).unwrap().count, 4);

        let summaries = out.summaries();
        assert_eq!(summaries[1].charge, -1);
        assert!(serde_json::to_string(&summaries).unwrap().contains("\"stage\":\"Refined\""));
    }

    #[test]
    fn refinement_can_be_disabled() {
        let mut config = TrackerConfig::default();
        config.refit.refine_with_silicon = false;
        let registry = nominal_registry();
        let field = build_field(&config.field).unwrap();
        let pipeline = EventFitter::new(&registry, &config, field.clone(), &NoopObserver);
        let out = pipeline.process_event(&make_event(&registry, field));
        assert_eq!(out.stats.refined, 0);
        assert!(out.fits.iter().all(|f| f.stage == FitStage::Initial));
    }

    #[test]
    fn parallel_matches_sequential() {
        let config = TrackerConfig::default();
        let registry = nominal_registry();
        let field = build_field(&config.field).unwrap();
        let pipeline = EventFitter::new(&registry, &config, field.clone(), &NoopObserver);
        let event = make_event(&registry, field);
        let out = pipeline.process_event(&event);
        for (c, fit) in event.candidates.iter().zip(&out.fits) {
            let base = pipeline.fitter().fit_trajectory(&c.candidate, event.vertex, None);
            let single = RefinementFitter::new(pipeline.fitter(), &config.refit).refine_with_extra_hits(
                &base,
                &c.silicon_hits,
                event.vertex,
            );
            assert_eq!(single.state, fit.state);
            assert_eq!(single.chi2, fit.chi2);
        }
    }

    #[test]
    fn stats_merge() {
        let mut a = EventStats {
            total: 2,
            converged: 1,
            ..Default::default()
        };
        a.failures.insert("propagation".into(), 1);
        let mut b = a.clone();
        b.global_refit = 1;
        a.merge(&b);
        assert_eq!(a.total, 4);
        assert_eq!(a.global_refit, 1);
        assert_eq!(a.failures["propagation"], 2);
    }
}
