//! Calibration and geometry inputs.
//!
//! The survey tables are indexed by row and hold one rigid transform each.
//! [`SurveyTables`] is the in-memory store (loadable from JSON); any other
//! backend only has to implement [`CalibrationStore`].

use crate::error::{FwdError, Result};
use crate::types::Subsystem;
use nalgebra::{Matrix3, Matrix4, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::warn;

// ---------------------------------------------------------------------------
// Links of the alignment chain
// ---------------------------------------------------------------------------

/// One link of the chain sensor → wedge → half-shell → disk frame → global.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum AlignmentLink {
    /// Whole silicon system in the global frame
    #[serde(rename = "fstOnTpc")]
    Parent,
    /// Half-shell in the silicon frame
    #[serde(rename = "hssOnFst")]
    Carrier,
    /// Wedge on its half-shell
    #[serde(rename = "fstWedgeOnHss")]
    Wedge,
    /// Sensor on its wedge
    #[serde(rename = "fstSensorOnWedge")]
    Sensor,
}

impl AlignmentLink {
    pub const ALL: [AlignmentLink; 4] = [
        AlignmentLink::Parent,
        AlignmentLink::Carrier,
        AlignmentLink::Wedge,
        AlignmentLink::Sensor,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            AlignmentLink::Parent => "fstOnTpc",
            AlignmentLink::Carrier => "hssOnFst",
            AlignmentLink::Wedge => "fstWedgeOnHss",
            AlignmentLink::Sensor => "fstSensorOnWedge",
        }
    }

    /// Number of rows a complete table carries.
    pub fn row_count(self) -> usize {
        match self {
            AlignmentLink::Parent => 1,
            AlignmentLink::Carrier => 2,
            AlignmentLink::Wedge => 36,
            AlignmentLink::Sensor => 108,
        }
    }
}

impl fmt::Display for AlignmentLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

// ---------------------------------------------------------------------------
// Survey rows and rigid transforms
// ---------------------------------------------------------------------------

/// One row of a survey table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SurveyRow {
    pub id: i32,
    /// Row-major rotation
    pub rotation: [[f64; 3]; 3],
    /// Translation (cm)
    pub translation: [f64; 3],
    #[serde(default)]
    pub sigma_rotation: [f64; 3],
    #[serde(default)]
    pub sigma_translation: [f64; 3],
    #[serde(default)]
    pub comment: String,
}

impl SurveyRow {
    pub fn identity(id: i32) -> Self {
        Self {
            id,
            rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            translation: [0.0; 3],
            sigma_rotation: [0.0; 3],
            sigma_translation: [0.0; 3],
            comment: "identity".into(),
        }
    }
}

/// Rotation + translation. Orthonormality is not enforced.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RigidTransform {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl RigidTransform {
    pub fn identity() -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Rotation about z by `angle` radians.
    pub fn rot_z(angle: f64) -> Self {
        let (s, c) = angle.sin_cos();
        Self {
            rotation: Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0),
            translation: Vector3::zeros(),
        }
    }

    /// Parse a survey row; fails with a reason when any entry is not finite.
    pub fn from_row(row: &SurveyRow) -> std::result::Result<Self, String> {
        let mut flat = row.rotation.iter().flatten().chain(row.translation.iter());
        if let Some(bad) = flat.find(|v| !v.is_finite()) {
            return Err(format!("row {} has non-finite entry {bad}", row.id));
        }
        let r = &row.rotation;
        Ok(Self {
            rotation: Matrix3::new(
                r[0][0], r[0][1], r[0][2], r[1][0], r[1][1], r[1][2], r[2][0], r[2][1], r[2][2],
            ),
            translation: Vector3::from(row.translation),
        })
    }

    pub fn to_homogeneous(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }
}

// ---------------------------------------------------------------------------
// Calibration store
// ---------------------------------------------------------------------------

/// Read access to the survey tables.
pub trait CalibrationStore: Send + Sync {
    /// Whether the table exists at all (possibly with missing rows).
    fn has_table(&self, link: AlignmentLink) -> bool;

    fn row(&self, link: AlignmentLink, index: usize) -> Option<&SurveyRow>;
}

/// In-memory survey tables keyed by link.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurveyTables {
    tables: BTreeMap<AlignmentLink, Vec<SurveyRow>>,
}

impl SurveyTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete tables holding identity rows only: the nominal geometry.
    pub fn identity() -> Self {
        let mut tables = Self::new();
        for link in AlignmentLink::ALL {
            let rows = (0..link.row_count()).map(|i| SurveyRow::identity(i as i32)).collect();
            tables.insert_table(link, rows);
        }
        tables
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let tables: SurveyTables = serde_json::from_str(text)?;
        for link in AlignmentLink::ALL {
            if let Some(rows) = tables.tables.get(&link) {
                if rows.len() < link.row_count() {
                    warn!(
                        table = link.table_name(),
                        rows = rows.len(),
                        expected = link.row_count(),
                        "survey table is incomplete"
                    );
                }
            }
        }
        Ok(tables)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| FwdError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn insert_table(&mut self, link: AlignmentLink, rows: Vec<SurveyRow>) {
        self.tables.insert(link, rows);
    }

    pub fn remove_table(&mut self, link: AlignmentLink) -> Option<Vec<SurveyRow>> {
        self.tables.remove(&link)
    }

    /// Mutable access to one row, for corrections and tests.
    pub fn row_mut(&mut self, link: AlignmentLink, index: usize) -> Option<&mut SurveyRow> {
        self.tables.get_mut(&link).and_then(|rows| rows.get_mut(index))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl CalibrationStore for SurveyTables {
    fn has_table(&self, link: AlignmentLink) -> bool {
        self.tables.contains_key(&link)
    }

    fn row(&self, link: AlignmentLink, index: usize) -> Option<&SurveyRow> {
        self.tables.get(&link).and_then(|rows| rows.get(index))
    }
}

// ---------------------------------------------------------------------------
// Geometry service
// ---------------------------------------------------------------------------

/// Nominal layer positions. A value below 1.0 cm means "not available".
pub trait GeometryService: Send + Sync {
    fn nominal_z(&self, subsystem: Subsystem, layer: usize) -> f64;
}

/// Geometry service backed by fixed lists.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NominalGeometry {
    pub fst_z: Vec<f64>,
    pub ftt_z: Vec<f64>,
}

impl Default for NominalGeometry {
    fn default() -> Self {
        Self {
            fst_z: vec![151.750, 165.248, 178.781],
            ftt_z: vec![280.90, 303.70, 326.60, 349.40],
        }
    }
}

impl GeometryService for NominalGeometry {
    fn nominal_z(&self, subsystem: Subsystem, layer: usize) -> f64 {
        let list = match subsystem {
            Subsystem::Fst => &self.fst_z,
            Subsystem::Ftt => &self.ftt_z,
        };
        list.get(layer).copied().unwrap_or(0.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
