//! Tracker configuration.
//!
//! Every section has a `Default` and is `#[serde(default)]`, so a TOML file
//! only needs to name the values it changes:
//!
//! ```toml
//! generate_histograms = true
//!
//! [field]
//! constant_b = false
//! field_map = "maps/forward_field.json"
//!
//! [fitter]
//! max_iterations = 6
//! ```

use crate::calibration::AlignmentLink;
use crate::error::{FwdError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for one reconstruction pass.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub field: FieldConfig,
    pub fitter: FitterConfig,
    pub material: MaterialConfig,
    pub seed: SeedConfig,
    pub vertex: VertexConfig,
    pub refit: RefitConfig,
    pub geometry: GeometryConfig,
    /// Accumulate diagnostic histograms through a [`crate::diagnostics::HistogramObserver`]
    pub generate_histograms: bool,
}

impl TrackerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: TrackerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| FwdError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Reject combinations that cannot be run.
    pub fn validate(&self) -> Result<()> {
        self.field.mode()?;
        if self.fitter.min_iterations > self.fitter.max_iterations {
            return Err(FwdError::Config(format!(
                "min_iterations ({}) exceeds max_iterations ({})",
                self.fitter.min_iterations, self.fitter.max_iterations
            )));
        }
        if self.field.max_step_cm <= 0.0 {
            return Err(FwdError::Config("field.max_step_cm must be positive".into()));
        }
        if self.fitter.min_layers < 3 {
            return Err(FwdError::Config("fitter.min_layers must be at least 3".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Field
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldConfig {
    /// Uniform field of `constant_value`; takes precedence over everything else
    pub constant_b: bool,
    /// No field at all; takes precedence over the field map
    pub zero_b: bool,
    /// Field vector for the constant mode (kGauss)
    pub constant_value: [f64; 3],
    /// JSON field map used when neither toggle is set
    pub field_map: Option<PathBuf>,
    /// Maximum Runge-Kutta step (cm)
    pub max_step_cm: f64,
}

impl Default for FieldConfig {
    fn default() -> Self {
        Self {
            constant_b: true,
            zero_b: false,
            constant_value: [0.0, 0.0, 5.0],
            field_map: None,
            max_step_cm: 10.0,
        }
    }
}

/// The field model selected by a [`FieldConfig`].
#[derive(Clone, Debug, PartialEq)]
pub enum FieldMode {
    Constant([f64; 3]),
    Zero,
    Map(PathBuf),
}

impl FieldConfig {
    pub fn mode(&self) -> Result<FieldMode> {
        if self.constant_b {
            Ok(FieldMode::Constant(self.constant_value))
        } else if self.zero_b {
            Ok(FieldMode::Zero)
        } else {
            self.field_map
                .clone()
                .map(FieldMode::Map)
                .ok_or_else(|| FwdError::Config("field map selected but no field_map path given".into()))
        }
    }
}

// ---------------------------------------------------------------------------
// Fitter
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FitterConfig {
    pub max_iterations: usize,
    pub min_iterations: usize,
    /// Converged when |Δχ²| falls below this
    pub delta_chi2_abs: f64,
    /// ... or below this fraction of χ²
    pub delta_chi2_rel: f64,
    /// Minimum number of trajectory points for a full fit; defaults to the
    /// number of tracker stations
    pub min_layers: usize,
    /// Seed uncertainties before inflation
    pub seed_sigma_position: f64,
    pub seed_sigma_slope: f64,
    /// Relative q/p uncertainty of the seed
    pub seed_sigma_qop_rel: f64,
    /// Factor applied to the seed covariance at the start of every pass
    pub cov_inflation: f64,
}

impl Default for FitterConfig {
    fn default() -> Self {
        Self {
            max_iterations: 4,
            min_iterations: 0,
            delta_chi2_abs: 1e-3,
            delta_chi2_rel: 0.2,
            min_layers: 4,
            seed_sigma_position: 1.0,
            seed_sigma_slope: 0.01,
            seed_sigma_qop_rel: 0.5,
            cov_inflation: 1000.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Material
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterialConfig {
    /// Add multiple-scattering noise at every detector plane
    pub enabled: bool,
    /// Particle mass hypothesis (GeV)
    pub particle_mass: f64,
    /// Thickness of one silicon sensor plane in radiation lengths
    pub fst_x_over_x0: f64,
    /// Thickness of one tracker station in radiation lengths
    pub ftt_x_over_x0: f64,
}

impl Default for MaterialConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            particle_mass: 0.13957,
            fst_x_over_x0: 0.004,
            ftt_x_over_x0: 0.01,
        }
    }
}

// ---------------------------------------------------------------------------
// Seed
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedConfig {
    /// Circle radii (cm) at or below this are treated as outliers
    pub min_curvature: f64,
    /// Radius used when no partition survives
    pub default_curvature: f64,
    /// Field strength entering pT = R·K·field_scale (kGauss)
    pub field_scale: f64,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            min_curvature: 10.0,
            default_curvature: 10.0,
            field_scale: 5.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Vertex
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VertexConfig {
    /// Add the primary vertex as the first trajectory point
    pub include_in_fit: bool,
    /// Smear the vertex with the configured resolutions
    pub smear: bool,
    pub sigma_xy: f64,
    pub sigma_z: f64,
    /// Vertex used when the caller supplies none (cm)
    pub position: [f64; 3],
    /// Base seed for vertex smearing; combined with the candidate id
    pub random_seed: u64,
}

impl Default for VertexConfig {
    fn default() -> Self {
        Self {
            include_in_fit: false,
            smear: false,
            sigma_xy: 1.0,
            sigma_z: 30.0,
            position: [0.0, 0.0, 0.0],
            random_seed: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Refinement
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RefitConfig {
    /// Refine converged fits with the silicon hits of the event
    pub refine_with_silicon: bool,
    /// Run the simultaneous track + alignment fit after refinement
    pub global_refit: bool,
    /// Prior width of the per-plane alignment offsets (cm)
    pub sigma_align: f64,
    pub max_global_iterations: usize,
    /// Converged once the largest Gauss-Newton parameter step drops below this
    pub global_tolerance: f64,
}

impl Default for RefitConfig {
    fn default() -> Self {
        Self {
            refine_with_silicon: true,
            global_refit: false,
            sigma_align: 0.01,
            max_global_iterations: 10,
            global_tolerance: 1e-4,
        }
    }
}

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    /// Raw sensor ids already are global indices (no module/sensor remapping)
    pub misaligned: bool,
    /// Nominal silicon disk z (cm)
    pub fst_z: Vec<f64>,
    /// Fallback tracker station z when the geometry service has none (cm)
    pub ftt_z: Vec<f64>,
    /// Links that fall back to identity when their whole table is absent
    pub identity_default_links: Vec<AlignmentLink>,
    /// Tracker hits further than this from their plane are reported (cm)
    pub z_mismatch_tolerance: f64,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            misaligned: false,
            fst_z: vec![151.750, 165.248, 178.781],
            ftt_z: vec![280.90, 303.70, 326.60, 349.40],
            identity_default_links: Vec::new(),
            z_mismatch_tolerance: 0.05,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
