//! Shared fixtures for unit tests: identity geometry and exact hits traced
//! with the library propagator.

use crate::alignment::{nominal_sensor_at, raw_sensor_id};
use crate::calibration::{NominalGeometry, SurveyTables};
use crate::config::GeometryConfig;
use crate::field::MagneticField;
use crate::propagation::Propagator;
use crate::registry::PlaneRegistry;
use crate::types::{Candidate, CandidateId, Hit, PlaneKey, SensorId, TrackState};
use nalgebra::Vector3;
use std::sync::Arc;

pub fn nominal_registry() -> PlaneRegistry {
    PlaneRegistry::build(&SurveyTables::identity(), &NominalGeometry::default(), &GeometryConfig::default()).registry
}

pub fn truth_state(position: Vector3<f64>, momentum: Vector3<f64>, charge: f64) -> TrackState {
    TrackState::from_momentum(position, momentum, charge).unwrap()
}

/// One exact hit per tracker station.
pub fn ftt_candidate(
    registry: &PlaneRegistry,
    field: Arc<dyn MagneticField>,
    truth: &TrackState,
    sigma: f64,
) -> Candidate {
    let propagator = Propagator::new(field, 10.0);
    let hits = registry
        .tracker_layers()
        .into_iter()
        .map(|layer| {
            let plane = registry.get(&PlaneKey::new(layer, SensorId(0))).unwrap();
            let at = propagator.propagate_to_plane(truth, plane).unwrap();
            Hit::with_sigma(layer, 0, at.position(), sigma, sigma)
        })
        .collect();
    Candidate::new(CandidateId(1), hits)
}

/// One exact hit per silicon disk, on the nominal sensor the track crosses.
pub fn fst_hits(
    registry: &PlaneRegistry,
    field: Arc<dyn MagneticField>,
    truth: &TrackState,
    sigma: f64,
) -> Vec<Option<Hit>> {
    let propagator = Propagator::new(field, 10.0);
    registry
        .silicon_disks()
        .into_iter()
        .map(|layer| {
            let z = registry.layer_z(layer)?;
            let near = propagator.propagate_to_z(truth, z).ok()?.position();
            let global = nominal_sensor_at(layer.index as usize, near.x, near.y)?;
            let plane = registry.get(&PlaneKey::new(layer, SensorId(global as u16))).ok()?;
            let at = propagator.propagate_to_plane(truth, plane).ok()?;
            let raw = raw_sensor_id(global, registry.misaligned())?;
            Some(Hit::with_sigma(layer, raw, at.position(), sigma, sigma))
        })
        .collect()
}
