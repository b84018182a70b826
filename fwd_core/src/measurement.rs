//! Trajectory points: what the fitter updates with.
//!
//! A hit becomes a planar measurement in the local (u, v) frame of its
//! plane, with the 3×3 hit covariance projected onto the plane. The vertex is
//! a space point; it is realised on a virtual plane through the vertex,
//! perpendicular to the track direction at the time of the update.

use crate::error::Result;
use crate::plane::PlanePose;
use crate::registry::PlaneRegistry;
use crate::types::{Hit, PlaneKey, TrackState};
use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};
use tracing::warn;

#[derive(Clone, Debug, PartialEq)]
pub enum TrackPoint {
    Planar {
        key: PlaneKey,
        plane: PlanePose,
        /// Measured (u, v)
        local: Vector2<f64>,
        cov: Matrix2<f64>,
        /// Original global hit position
        position: Vector3<f64>,
    },
    Vertex {
        position: Vector3<f64>,
        cov: Matrix3<f64>,
    },
}

/// A measurement bound to a concrete plane.
#[derive(Clone, Copy, Debug)]
pub struct Realized {
    pub plane: PlanePose,
    pub key: Option<PlaneKey>,
    pub value: Vector2<f64>,
    pub cov: Matrix2<f64>,
}

impl TrackPoint {
    /// Planar measurement of `hit` on its registered plane.
    pub fn from_hit(hit: &Hit, registry: &PlaneRegistry, z_tolerance: f64) -> Result<Self> {
        let key = registry.plane_for_hit(hit)?;
        let plane = *registry.get(&key)?;
        if let Some(z) = plane.z_at(hit.position.x, hit.position.y) {
            let dz = hit.position.z - z;
            if dz.abs() > z_tolerance {
                warn!(plane = %key, hit_z = hit.position.z, plane_z = z, "hit z does not match its plane");
            }
        }
        Ok(TrackPoint::Planar {
            key,
            plane,
            local: plane.to_local(&hit.position),
            cov: plane.project_cov(&hit.cov),
            position: hit.position,
        })
    }

    pub fn vertex(position: Vector3<f64>, cov: Matrix3<f64>) -> Self {
        TrackPoint::Vertex { position, cov }
    }

    pub fn is_vertex(&self) -> bool {
        matches!(self, TrackPoint::Vertex { .. })
    }

    pub fn key(&self) -> Option<PlaneKey> {
        match self {
            TrackPoint::Planar { key, .. } => Some(*key),
            TrackPoint::Vertex { .. } => None,
        }
    }

    pub fn position(&self) -> Vector3<f64> {
        match self {
            TrackPoint::Planar { position, .. } | TrackPoint::Vertex { position, .. } => *position,
        }
    }

    /// Measurement dimension.
    pub fn dim(&self) -> usize {
        2
    }

    /// Bind to a plane; the vertex plane depends on the current `state` direction.
    pub fn realize(&self, state: &TrackState) -> Realized {
        match self {
            TrackPoint::Planar {
                key,
                plane,
                local,
                cov,
                ..
            } => Realized {
                plane: *plane,
                key: Some(*key),
                value: *local,
                cov: *cov,
            },
            TrackPoint::Vertex { position, cov } => {
                let plane = PlanePose::perpendicular_to(*position, &state.direction());
                Realized {
                    plane,
                    key: None,
                    value: Vector2::zeros(),
                    cov: plane.project_cov(cov),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{NominalGeometry, SurveyTables};
    use crate::config::GeometryConfig;
    use crate::types::{LayerId, StateVec};
    use approx::assert_relative_eq;

    #[test]
    fn tracker_hit_in_plane_frame() {
        let reg = PlaneRegistry::build(&SurveyTables::identity(), &NominalGeometry::default(), &GeometryConfig::default()).registry;
        let hit = Hit::with_sigma(LayerId::ftt(1), 0, Vector3::new(12.0, -3.0, 303.7), 0.02, 0.5);
        let p = TrackPoint::from_hit(&hit, &reg, 0.05).unwrap();
        let r = p.realize(&TrackState::new(0.0, StateVec::zeros()));
        assert_relative_eq!(r.value, Vector2::new(12.0, -3.0), epsilon = 1e-12);
        assert_relative_eq!(r.cov, Matrix2::new(4e-4, 0.0, 0.0, 4e-4), epsilon = 1e-15);
    }

    #[test]
    fn vertex_plane_follows_track_direction() {
        let v = TrackPoint::vertex(Vector3::new(0.1, 0.2, 5.0), Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, 900.0)));
        let state = TrackState::new(0.0, StateVec::new(0.0, 0.0, 0.1, 0.0, 1.0));
        let r = v.realize(&state);
        assert_relative_eq!(r.plane.normal(), state.direction(), epsilon = 1e-12);
        assert_relative_eq!(r.plane.origin, Vector3::new(0.1, 0.2, 5.0));
        // The long z resolution leaks into the tilted u axis.
        assert!(r.cov[(0, 0)] > 1.0);
        assert_relative_eq!(r.cov[(1, 1)], 1.0, epsilon = 1e-12);
    }
}
