//! Fundamental types used across the entire workspace.
//!
//! Units: centimetres, GeV, kGauss. Track states are parametrised in z.

use nalgebra::{Matrix3, Matrix5, Vector3, Vector5};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ---------------------------------------------------------------------------
// Track parameters: (x, y, tx = dx/dz, ty = dy/dz, q/p) at a given z.
// ---------------------------------------------------------------------------

/// 5-parameter track state vector: [x, y, tx, ty, q/p]
pub type StateVec = Vector5<f64>;

/// 5×5 track parameter covariance
pub type StateCov = Matrix5<f64>;

/// Transport Jacobian between two surfaces
pub type Jacobian = Matrix5<f64>;

// ---------------------------------------------------------------------------
// Identifier types
// ---------------------------------------------------------------------------

/// Detector subsystem. Ordered by distance from the interaction point.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Subsystem {
    /// Silicon disks (wedge/sensor segmented)
    Fst,
    /// Tracker stations (one nominal plane per layer)
    Ftt,
}

/// One detector layer: a silicon disk or a tracker station.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct LayerId {
    pub subsystem: Subsystem,
    pub index: u8,
}

impl LayerId {
    pub fn fst(disk: u8) -> Self {
        Self {
            subsystem: Subsystem::Fst,
            index: disk,
        }
    }

    pub fn ftt(station: u8) -> Self {
        Self {
            subsystem: Subsystem::Ftt,
            index: station,
        }
    }
}

/// Global sensor index. `0..108` for silicon, always 0 for tracker layers.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SensorId(pub u16);

/// Key of one registered detector plane.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PlaneKey {
    pub layer: LayerId,
    pub sensor: SensorId,
}

impl PlaneKey {
    pub fn new(layer: LayerId, sensor: SensorId) -> Self {
        Self { layer, sensor }
    }
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct CandidateId(pub u64);

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.subsystem {
            Subsystem::Fst => write!(f, "FST{}", self.index),
            Subsystem::Ftt => write!(f, "FTT{}", self.index),
        }
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

impl fmt::Display for PlaneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.layer, self.sensor)
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Hits and candidates
// ---------------------------------------------------------------------------

/// A measured space point on one detector layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hit {
    /// Global position (cm)
    pub position: Vector3<f64>,
    /// Position covariance (cm²)
    pub cov: Matrix3<f64>,
    pub layer: LayerId,
    /// Raw readout sensor id, mapped to a [`SensorId`] by the plane registry
    pub raw_sensor: u32,
}

impl Hit {
    /// Hit with independent transverse and longitudinal resolutions.
    pub fn with_sigma(
        layer: LayerId,
        raw_sensor: u32,
        position: Vector3<f64>,
        sigma_xy: f64,
        sigma_z: f64,
    ) -> Self {
        let cov = Matrix3::from_diagonal(&Vector3::new(
            sigma_xy * sigma_xy,
            sigma_xy * sigma_xy,
            sigma_z * sigma_z,
        ));
        Self {
            position,
            cov,
            layer,
            raw_sensor,
        }
    }
}

/// Hits believed to belong to one trajectory. `new` sorts them by layer;
/// deserialized or hand-built candidates may not be.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,
    pub hits: Vec<Hit>,
}

impl Candidate {
    /// Build a candidate; hits are sorted by layer (inner to outer).
    pub fn new(id: CandidateId, mut hits: Vec<Hit>) -> Self {
        hits.sort_by_key(|h| h.layer);
        Self { id, hits }
    }

    /// Number of distinct layers carrying a hit.
    pub fn n_layers(&self) -> usize {
        self.hits.iter().map(|h| h.layer).collect::<BTreeSet<LayerId>>().len()
    }

    /// Hits in layer order, whatever order `hits` holds them in.
    pub fn ordered_hits(&self) -> Vec<Hit> {
        let mut hits = self.hits.clone();
        hits.sort_by_key(|h| h.layer);
        hits
    }
}

// ---------------------------------------------------------------------------
// Track state
// ---------------------------------------------------------------------------

/// Track parameters at a fixed z.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackState {
    pub z: f64,
    pub params: StateVec,
}

impl TrackState {
    pub fn new(z: f64, params: StateVec) -> Self {
        Self { z, params }
    }

    /// State of a particle at `position` with `momentum` (GeV) and `charge`.
    /// Returns `None` for particles not moving forward in z.
    pub fn from_momentum(position: Vector3<f64>, momentum: Vector3<f64>, charge: f64) -> Option<Self> {
        let p = momentum.norm();
        if momentum.z <= 0.0 || p <= 0.0 || !p.is_finite() {
            return None;
        }
        Some(Self {
            z: position.z,
            params: StateVec::new(
                position.x,
                position.y,
                momentum.x / momentum.z,
                momentum.y / momentum.z,
                charge / p,
            ),
        })
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.params[0], self.params[1], self.z)
    }

    /// Unit direction of flight.
    pub fn direction(&self) -> Vector3<f64> {
        Vector3::new(self.params[2], self.params[3], 1.0).normalize()
    }

    pub fn qop(&self) -> f64 {
        self.params[4]
    }

    /// Momentum vector (GeV). Zero for q/p = 0.
    pub fn momentum(&self) -> Vector3<f64> {
        let qop = self.qop();
        if qop == 0.0 {
            return Vector3::zeros();
        }
        self.direction() / qop.abs()
    }

    /// Sign of q/p.
    pub fn charge(&self) -> i8 {
        if self.qop() > 0.0 {
            1
        } else if self.qop() < 0.0 {
            -1
        } else {
            0
        }
    }
}

/// Kinematic summary of a momentum vector.
pub fn pt_eta_phi(momentum: &Vector3<f64>) -> (f64, f64, f64) {
    let pt = momentum.x.hypot(momentum.y);
    let theta = pt.atan2(momentum.z);
    let eta = -(theta / 2.0).tan().ln();
    (pt, eta, momentum.y.atan2(momentum.x))
}

// ---------------------------------------------------------------------------
// Charge hypotheses
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChargeHypothesis {
    Positive,
    Negative,
}

impl ChargeHypothesis {
    pub const BOTH: [ChargeHypothesis; 2] = [ChargeHypothesis::Positive, ChargeHypothesis::Negative];

    pub fn sign(self) -> f64 {
        match self {
            ChargeHypothesis::Positive => 1.0,
            ChargeHypothesis::Negative => -1.0,
        }
    }
}

impl fmt::Display for ChargeHypothesis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChargeHypothesis::Positive => write!(f, "+"),
            ChargeHypothesis::Negative => write!(f, "-"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
