//! Magnetic field models (kGauss).

use crate::config::{FieldConfig, FieldMode};
use crate::error::{FwdError, Result};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub trait MagneticField: Send + Sync {
    fn field(&self, position: &Vector3<f64>) -> Vector3<f64>;
}

#[derive(Clone, Copy, Debug)]
pub struct ConstantField(pub Vector3<f64>);

impl MagneticField for ConstantField {
    fn field(&self, _position: &Vector3<f64>) -> Vector3<f64> {
        self.0
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ZeroField;

impl MagneticField for ZeroField {
    fn field(&self, _position: &Vector3<f64>) -> Vector3<f64> {
        Vector3::zeros()
    }
}

// ---------------------------------------------------------------------------
// Axisymmetric field map
// ---------------------------------------------------------------------------

/// Field tabulated on a regular (r, z) grid, values stored `ir * nz + iz`.
/// Bilinear interpolation inside the grid, zero outside.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldMap {
    pub r_min: f64,
    pub r_max: f64,
    pub z_min: f64,
    pub z_max: f64,
    pub nr: usize,
    pub nz: usize,
    pub br: Vec<f64>,
    pub bz: Vec<f64>,
}

impl FieldMap {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let map: FieldMap = serde_json::from_str(text)?;
        map.validate()?;
        Ok(map)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| FwdError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.nr < 2 || self.nz < 2 {
            return Err(FwdError::Config("field map needs at least 2×2 nodes".into()));
        }
        if !(self.r_max > self.r_min && self.z_max > self.z_min) {
            return Err(FwdError::Config("field map has an empty range".into()));
        }
        let n = self.nr * self.nz;
        if self.br.len() != n || self.bz.len() != n {
            return Err(FwdError::Config(format!(
                "field map expects {n} values per component, found {} and {}",
                self.br.len(),
                self.bz.len()
            )));
        }
        Ok(())
    }

    /// (B_r, B_z) at cylindrical (r, z), `None` outside the grid.
    fn interpolate(&self, r: f64, z: f64) -> Option<(f64, f64)> {
        if r < self.r_min || r > self.r_max || z < self.z_min || z > self.z_max {
            return None;
        }
        let dr = (self.r_max - self.r_min) / (self.nr - 1) as f64;
        let dz = (self.z_max - self.z_min) / (self.nz - 1) as f64;
        let fr = (r - self.r_min) / dr;
        let fz = (z - self.z_min) / dz;
        let ir = (fr.floor() as usize).min(self.nr - 2);
        let iz = (fz.floor() as usize).min(self.nz - 2);
        let wr = fr - ir as f64;
        let wz = fz - iz as f64;

        let at = |grid: &[f64], i: usize, j: usize| grid[i * self.nz + j];
        let bilinear = |grid: &[f64]| {
            at(grid, ir, iz) * (1.0 - wr) * (1.0 - wz)
                + at(grid, ir + 1, iz) * wr * (1.0 - wz)
                + at(grid, ir, iz + 1) * (1.0 - wr) * wz
                + at(grid, ir + 1, iz + 1) * wr * wz
        };
        Some((bilinear(&self.br), bilinear(&self.bz)))
    }
}

impl MagneticField for FieldMap {
    fn field(&self, position: &Vector3<f64>) -> Vector3<f64> {
        let r = position.x.hypot(position.y);
        match self.interpolate(r, position.z) {
            Some((br, bz)) if r > 0.0 => {
                Vector3::new(br * position.x / r, br * position.y / r, bz)
            }
            Some((_, bz)) => Vector3::new(0.0, 0.0, bz),
            None => Vector3::zeros(),
        }
    }
}

/// Field model selected by the configuration.
pub fn build_field(config: &FieldConfig) -> Result<Arc<dyn MagneticField>> {
    let field: Arc<dyn MagneticField> = match config.mode()? {
        FieldMode::Constant(b) => {
            info!(bx = b[0], by = b[1], bz = b[2], "using constant field");
            Arc::new(ConstantField(Vector3::from(b)))
        }
        FieldMode::Zero => {
            info!("using zero field");
            Arc::new(ZeroField)
        }
        FieldMode::Map(path) => {
            let map = FieldMap::from_file(&path)?;
            info!(path = %path.display(), nr = map.nr, nz = map.nz, "loaded field map");
            Arc::new(map)
        }
    };
    Ok(field)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp() -> FieldMap {
        // B_z grows linearly in z, B_r linearly in r.
        let (nr, nz) = (3, 5);
        let mut br = Vec::new();
        let mut bz = Vec::new();
        for ir in 0..nr {
            for iz in 0..nz {
                br.push(ir as f64 * 0.1);
                bz.push(5.0 - iz as f64 * 0.5);
            }
        }
        FieldMap {
            r_min: 0.0,
            r_max: 100.0,
            z_min: 0.0,
            z_max: 400.0,
            nr,
            nz,
            br,
            bz,
        }
    }

    #[test]
    fn bilinear_interpolation_is_exact_for_linear_fields() {
        let map = ramp();
        let b = map.field(&Vector3::new(30.0, 40.0, 150.0));
        // r = 50 → B_r = 0.1; z = 150 → B_z = 5 − 0.5·1.5
        assert_relative_eq!(b.z, 4.25, epsilon = 1e-12);
        assert_relative_eq!(b.x, 0.1 * 30.0 / 50.0, epsilon = 1e-12);
        assert_relative_eq!(b.y, 0.1 * 40.0 / 50.0, epsilon = 1e-12);
    }

    #[test]
    fn outside_grid_is_zero() {
        let map = ramp();
        assert_eq!(map.field(&Vector3::new(0.0, 0.0, 500.0)), Vector3::zeros());
        assert_eq!(map.field(&Vector3::new(200.0, 0.0, 100.0)), Vector3::zeros());
    }

    #[test]
    fn map_json_validated() {
        let mut map = ramp();
        map.bz.pop();
        let json = serde_json::to_string(&map).unwrap();
        assert!(matches!(FieldMap::from_json_str(&json), Err(FwdError::Config(_))));
    }

    #[test]
    fn config_selects_model() {
        let f = build_field(&FieldConfig::default()).unwrap();
        assert_relative_eq!(f.field(&Vector3::new(1.0, 2.0, 3.0)).z, 5.0);
        let zero = FieldConfig {
            constant_b: false,
            zero_b: true,
            ..Default::default()
        };
        assert_eq!(build_field(&zero).unwrap().field(&Vector3::zeros()), Vector3::zeros());
    }
}
