//! `sim` — Synthetic forward events: particle gun, detector response, scenarios, replay.

pub mod detector_sim;
pub mod evaluation;
pub mod particle;
pub mod replay;
pub mod scenarios;

pub use detector_sim::{DetectorParams, DetectorSimulator, SimulatedEvent};
pub use evaluation::FitPerformance;
pub use particle::{ChargeSpec, GunSpec, Particle, ParticleGun};
pub use replay::{load_replay, save_replay, ReplayLog};
pub use scenarios::{Scenario, ScenarioKind};
