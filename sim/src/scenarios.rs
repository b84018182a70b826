//! Scenario definitions.
//!
//! Each scenario is a named particle gun, detector response and field.
//! All scenarios are deterministic given the same seed.

use crate::{
    detector_sim::{DetectorParams, DetectorSimulator, SimulatedEvent},
    particle::{ChargeSpec, GunSpec, ParticleGun},
};
use fwd_core::config::{FieldConfig, MaterialConfig};
use fwd_core::field::build_field;
use fwd_core::{PlaneRegistry, Result, TrackerConfig};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const MUON_MASS: f64 = 0.105_658;
pub const PION_MASS: f64 = 0.139_570;

/// Which pre-defined scenario to load.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
pub enum ScenarioKind {
    /// One muon per event, 1–5 GeV pT
    SingleMuon,
    /// Five soft pions per event
    Pions,
    /// 40 particles per event, vertex spread along the beam
    HighMultiplicity,
    /// Zero field, no material: straight tracks
    Straight,
}

/// A fully configured simulation scenario.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub seed: u64,
    pub n_events: u64,
    pub gun: GunSpec,
    pub detector: DetectorParams,
    /// Field used for simulation and fitting
    pub field: FieldConfig,
    /// Whether the fit models scattering
    pub material_in_fit: bool,
}

impl Scenario {
    /// Build the named scenario. Uses `seed` for repeatability.
    pub fn build(kind: ScenarioKind, seed: u64) -> Self {
        match kind {
            ScenarioKind::SingleMuon => Self::single_muon(seed),
            ScenarioKind::Pions => Self::pions(seed),
            ScenarioKind::HighMultiplicity => Self::high_multiplicity(seed),
            ScenarioKind::Straight => Self::straight(seed),
        }
    }

    fn single_muon(seed: u64) -> Self {
        Scenario {
            name: "single_muon".into(),
            seed,
            n_events: 100,
            gun: GunSpec {
                multiplicity: 1,
                pt_range: (1.0, 5.0),
                eta_range: (2.5, 4.0),
                charge: ChargeSpec::Random,
                vertex_sigma_z: 0.0,
            },
            detector: DetectorParams {
                material: material(MUON_MASS),
                ..Default::default()
            },
            field: FieldConfig::default(),
            material_in_fit: true,
        }
    }

    fn pions(seed: u64) -> Self {
        Scenario {
            name: "pions".into(),
            seed,
            n_events: 50,
            gun: GunSpec {
                multiplicity: 5,
                pt_range: (0.2, 2.0),
                eta_range: (2.5, 4.0),
                charge: ChargeSpec::Random,
                vertex_sigma_z: 5.0,
            },
            detector: DetectorParams {
                efficiency: 0.98,
                material: material(PION_MASS),
                ..Default::default()
            },
            field: FieldConfig::default(),
            material_in_fit: true,
        }
    }

    fn high_multiplicity(seed: u64) -> Self {
        Scenario {
            name: "high_multiplicity".into(),
            seed,
            n_events: 20,
            gun: GunSpec {
                multiplicity: 40,
                pt_range: (0.2, 3.0),
                eta_range: (2.5, 4.0),
                charge: ChargeSpec::Random,
                vertex_sigma_z: 30.0,
            },
            detector: DetectorParams {
                efficiency: 0.95,
                material: material(PION_MASS),
                ..Default::default()
            },
            field: FieldConfig::default(),
            material_in_fit: true,
        }
    }

    fn straight(seed: u64) -> Self {
        Scenario {
            name: "straight".into(),
            seed,
            n_events: 50,
            gun: GunSpec {
                multiplicity: 1,
                pt_range: (1.0, 2.0),
                eta_range: (2.5, 4.0),
                charge: ChargeSpec::Positive,
                vertex_sigma_z: 0.0,
            },
            detector: DetectorParams {
                multiple_scattering: false,
                ..Default::default()
            },
            field: FieldConfig {
                constant_b: false,
                zero_b: true,
                ..Default::default()
            },
            material_in_fit: false,
        }
    }

    /// Align the fit configuration with the simulated conditions.
    pub fn apply_to(&self, config: &mut TrackerConfig) {
        config.field = self.field.clone();
        config.material.enabled = self.material_in_fit;
        if self.material_in_fit {
            config.material.particle_mass = self.detector.material.particle_mass;
        }
    }

    /// Generate all events of the scenario against `registry`.
    pub fn generate(&self, registry: &PlaneRegistry) -> Result<Vec<SimulatedEvent>> {
        let field = build_field(&self.field)?;
        let mut gun = ParticleGun::new(self.gun.clone(), self.seed);
        let mut detector = DetectorSimulator::new(registry, field, self.detector.clone(), self.seed.wrapping_add(1));
        let events: Vec<SimulatedEvent> = (0..self.n_events)
            .map(|id| {
                let particles = gun.shoot();
                detector.simulate_event(id, &particles)
            })
            .collect();
        info!(
            scenario = %self.name,
            seed = self.seed,
            events = events.len(),
            candidates = events.iter().map(|e| e.event.candidates.len()).sum::<usize>(),
            "scenario generated"
        );
        Ok(events)
    }
}

fn material(mass: f64) -> MaterialConfig {
    MaterialConfig {
        particle_mass: mass,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
