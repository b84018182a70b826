//! Detector planes: an origin and two in-plane directions.

use nalgebra::{Matrix2, Matrix2x5, Matrix3, Matrix3x2, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Normal components below this make a plane unusable for z-parametrised tracks.
const MIN_NORMAL_Z: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanePose {
    pub origin: Vector3<f64>,
    pub u: Vector3<f64>,
    pub v: Vector3<f64>,
}

impl PlanePose {
    pub fn new(origin: Vector3<f64>, u: Vector3<f64>, v: Vector3<f64>) -> Self {
        Self { origin, u, v }
    }

    /// Plane at `z` perpendicular to the beam, axes along global x and y.
    pub fn nominal(z: f64) -> Self {
        Self {
            origin: Vector3::new(0.0, 0.0, z),
            u: Vector3::x(),
            v: Vector3::y(),
        }
    }

    /// Plane through `point` perpendicular to `direction`.
    pub fn perpendicular_to(point: Vector3<f64>, direction: &Vector3<f64>) -> Self {
        let n = direction.normalize();
        let u = Vector3::y().cross(&n).normalize();
        let v = n.cross(&u);
        Self { origin: point, u, v }
    }

    /// Unit normal u × v.
    pub fn normal(&self) -> Vector3<f64> {
        self.u.cross(&self.v).normalize()
    }

    /// z of the plane at transverse position (x, y), `None` for planes containing the z axis.
    pub fn z_at(&self, x: f64, y: f64) -> Option<f64> {
        let n = self.normal();
        if n.z.abs() < MIN_NORMAL_Z {
            return None;
        }
        Some(self.origin.z - (n.x * (x - self.origin.x) + n.y * (y - self.origin.y)) / n.z)
    }

    /// Signed distance of `point` from the plane along the normal.
    pub fn distance(&self, point: &Vector3<f64>) -> f64 {
        (point - self.origin).dot(&self.normal())
    }

    /// Local coordinates (u, v) of a global point.
    pub fn to_local(&self, point: &Vector3<f64>) -> Vector2<f64> {
        let d = point - self.origin;
        Vector2::new(d.dot(&self.u), d.dot(&self.v))
    }

    pub fn to_global(&self, local: &Vector2<f64>) -> Vector3<f64> {
        self.origin + self.u * local.x + self.v * local.y
    }

    /// 3×2 matrix with columns u and v.
    pub fn basis(&self) -> Matrix3x2<f64> {
        Matrix3x2::from_columns(&[self.u, self.v])
    }

    /// Global 3×3 covariance seen in local coordinates: Bᵀ C B.
    pub fn project_cov(&self, cov: &Matrix3<f64>) -> Matrix2<f64> {
        let b = self.basis();
        b.transpose() * cov * b
    }

    /// Measurement matrix of (u, v) with respect to (x, y, tx, ty, q/p) for a
    /// state lying on this plane. z follows (x, y) through the plane equation,
    /// so the projection is linear in x and y.
    pub fn measurement_matrix(&self) -> Option<Matrix2x5<f64>> {
        let n = self.normal();
        if n.z.abs() < MIN_NORMAL_Z {
            return None;
        }
        let dzdx = -n.x / n.z;
        let dzdy = -n.y / n.z;
        let mut h = Matrix2x5::zeros();
        for (row, axis) in [self.u, self.v].iter().enumerate() {
            h[(row, 0)] = axis.x + axis.z * dzdx;
            h[(row, 1)] = axis.y + axis.z * dzdy;
        }
        Some(h)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
