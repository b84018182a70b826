//! Detector response simulator.
//!
//! Traces truth particles through the plane registry with the core
//! propagator and produces:
//! - one tracker hit per station and up to one silicon hit per disk
//! - Gaussian smearing in the plane-local (u, v) frame
//! - a per-hit detection efficiency
//! - optional multiple-scattering kicks after each plane
//! - a smeared ("noise") event vertex

use crate::particle::Particle;
use fwd_core::alignment::{nominal_sensor_at, raw_sensor_id};
use fwd_core::config::MaterialConfig;
use fwd_core::field::MagneticField;
use fwd_core::material::MaterialModel;
use fwd_core::plane::PlanePose;
use fwd_core::propagation::Propagator;
use fwd_core::types::Subsystem;
use fwd_core::{Candidate, CandidateId, Event, EventCandidate, Hit, LayerId, PlaneKey, PlaneRegistry, SensorId, TrackState};
use nalgebra::{Matrix3, Vector2, Vector3};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

/// Resolution and efficiency settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectorParams {
    /// Tracker station resolution in u and v (cm)
    pub ftt_sigma: f64,
    /// Silicon resolution across strips (cm)
    pub fst_sigma_u: f64,
    /// Silicon resolution along strips (cm)
    pub fst_sigma_v: f64,
    /// Probability that a crossing produces a hit
    pub efficiency: f64,
    /// Apply scattering kicks when crossing planes
    pub multiple_scattering: bool,
    pub material: MaterialConfig,
    /// Transverse / longitudinal smearing of the reported vertex (cm)
    pub vertex_sigma_xy: f64,
    pub vertex_sigma_z: f64,
    /// Propagation step (cm)
    pub max_step: f64,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            ftt_sigma: 0.02,
            fst_sigma_u: 0.003,
            fst_sigma_v: 0.03,
            efficiency: 1.0,
            multiple_scattering: true,
            material: MaterialConfig::default(),
            vertex_sigma_xy: 0.01,
            vertex_sigma_z: 0.05,
            max_step: 10.0,
        }
    }
}

/// A simulated event plus the particles it came from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulatedEvent {
    pub event: Event,
    pub truth: Vec<Particle>,
}

/// Generates detector hits from truth particles.
pub struct DetectorSimulator<'a> {
    registry: &'a PlaneRegistry,
    propagator: Propagator,
    material: MaterialModel,
    pub params: DetectorParams,
    rng: ChaCha8Rng,
}

/// One plane crossing on the way out.
struct Crossing {
    layer: LayerId,
    key: PlaneKey,
    plane: PlanePose,
}

impl<'a> DetectorSimulator<'a> {
    pub fn new(registry: &'a PlaneRegistry, field: Arc<dyn MagneticField>, params: DetectorParams, seed: u64) -> Self {
        Self {
            registry,
            propagator: Propagator::new(field, params.max_step),
            material: MaterialModel::new(params.material.clone()),
            params,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Build event `id` from `particles`. Particles that leave no tracker hit
    /// at all produce no candidate.
    pub fn simulate_event(&mut self, id: u64, particles: &[Particle]) -> SimulatedEvent {
        let mut candidates = Vec::with_capacity(particles.len());
        for particle in particles {
            match self.trace(particle) {
                Some(c) if !c.candidate.hits.is_empty() => candidates.push(c),
                _ => trace!(event = id, particle = particle.id, "particle left no tracker hits"),
            }
        }

        let vertex = particles.first().map(|p| self.smear_vertex(p.vertex));
        debug!(event = id, particles = particles.len(), candidates = candidates.len(), "event simulated");

        SimulatedEvent {
            event: Event {
                id,
                vertex,
                candidates,
            },
            truth: particles.to_vec(),
        }
    }

    fn smear_vertex(&mut self, v: Vector3<f64>) -> Vector3<f64> {
        let dx = gauss(&mut self.rng, self.params.vertex_sigma_xy);
        let dy = gauss(&mut self.rng, self.params.vertex_sigma_xy);
        let dz = gauss(&mut self.rng, self.params.vertex_sigma_z);
        v + Vector3::new(dx, dy, dz)
    }

    /// Silicon disks then tracker stations, inner to outer.
    fn crossings(&self, state: &TrackState) -> Vec<Crossing> {
        let mut out = Vec::new();
        for layer in self.registry.silicon_disks() {
            let Some(z) = self.registry.layer_z(layer) else {
                continue;
            };
            let Ok(near) = self.propagator.propagate_to_z(state, z) else {
                continue;
            };
            let Some(global) = nominal_sensor_at(layer.index as usize, near.params[0], near.params[1]) else {
                continue;
            };
            let key = PlaneKey::new(layer, SensorId(global as u16));
            if let Ok(plane) = self.registry.get(&key) {
                out.push(Crossing {
                    layer,
                    key,
                    plane: *plane,
                });
            }
        }
        for layer in self.registry.tracker_layers() {
            let key = PlaneKey::new(layer, SensorId(0));
            if let Ok(plane) = self.registry.get(&key) {
                out.push(Crossing {
                    layer,
                    key,
                    plane: *plane,
                });
            }
        }
        out
    }

    fn trace(&mut self, particle: &Particle) -> Option<EventCandidate> {
        let mut state = particle.initial_state()?;
        let crossings = self.crossings(&state);
        let n_disks = self.registry.silicon_disks().len();

        let mut tracker_hits = Vec::new();
        let mut silicon_hits: Vec<Option<Hit>> = vec![None; n_disks];
        for crossing in crossings {
            let Ok(at) = self.propagator.propagate_to_plane(&state, &crossing.plane) else {
                break;
            };
            state = at;

            if self.rng.gen::<f64>() < self.params.efficiency {
                match crossing.layer.subsystem {
                    Subsystem::Fst => {
                        let global = crossing.key.sensor.0 as usize;
                        let raw = raw_sensor_id(global, self.registry.misaligned())?;
                        let hit = self.smeared_hit(&crossing, raw, &state, self.params.fst_sigma_u, self.params.fst_sigma_v);
                        if let Some(slot) = silicon_hits.get_mut(crossing.layer.index as usize) {
                            *slot = Some(hit);
                        }
                    }
                    Subsystem::Ftt => {
                        let sigma = self.params.ftt_sigma;
                        tracker_hits.push(self.smeared_hit(&crossing, 0, &state, sigma, sigma));
                    }
                }
            }

            if self.params.multiple_scattering {
                self.scatter(&mut state, &crossing.key);
            }
        }

        Some(EventCandidate {
            candidate: Candidate::new(CandidateId(particle.id), tracker_hits),
            silicon_hits,
        })
    }

    /// Hit smeared in the plane frame; its covariance is the (u, v) resolution
    /// rotated to global with a small thickness term along the normal.
    fn smeared_hit(&mut self, crossing: &Crossing, raw: u32, state: &TrackState, su: f64, sv: f64) -> Hit {
        let plane = &crossing.plane;
        let local = plane.to_local(&state.position())
            + Vector2::new(gauss(&mut self.rng, su), gauss(&mut self.rng, sv));
        let position = plane.to_global(&local);

        let (u, v, n) = (plane.u, plane.v, plane.normal());
        let sn = 1e-3;
        let cov: Matrix3<f64> =
            u * u.transpose() * (su * su) + v * v.transpose() * (sv * sv) + n * n.transpose() * (sn * sn);
        Hit {
            position,
            cov,
            layer: crossing.layer,
            raw_sensor: raw,
        }
    }

    fn scatter(&mut self, state: &mut TrackState, key: &PlaneKey) {
        let thickness = self.material.thickness(Some(key));
        let q = self.material.noise(&state.params, thickness);
        let (s2, s3) = (q[(2, 2)].sqrt(), q[(3, 3)].sqrt());
        state.params[2] += gauss(&mut self.rng, s2);
        state.params[3] += gauss(&mut self.rng, s3);
    }
}

fn gauss(rng: &mut ChaCha8Rng, sigma: f64) -> f64 {
    match Normal::new(0.0, sigma) {
        Ok(n) if sigma > 0.0 => n.sample(rng),
        _ => 0.0,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
