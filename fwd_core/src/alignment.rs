//! Silicon alignment: survey chain → absolute sensor plane poses.
//!
//! # Chain
//! `M = T_parent · T_carrier[h] · T_wedge[w] · T_sensor[is] · R_z(angle(w))`
//!
//! For global sensor index `is ∈ [0, 108)`:
//! half `h = (is/18) mod 2`, disk `d = is/36`, wedge `w = is/3`, slot `s = is mod 3`.
//! Slot 0 is the inner sensor of a wedge, slots 1 and 2 the outer pair.
//!
//! The plane origin is `M·0` shifted to the nominal sensor z; the axes are
//! `M·x̂ − M·0` and `M·ŷ − M·0`.

use crate::calibration::{AlignmentLink, CalibrationStore, RigidTransform};
use crate::error::{FwdError, Result};
use crate::plane::PlanePose;
use nalgebra::{Matrix4, Vector3, Vector4};
use std::f64::consts::PI;

pub const N_DISKS: usize = 3;
pub const WEDGES_PER_DISK: usize = 12;
pub const SENSORS_PER_WEDGE: usize = 3;
pub const SENSORS_PER_DISK: usize = WEDGES_PER_DISK * SENSORS_PER_WEDGE;
pub const N_SENSORS: usize = N_DISKS * SENSORS_PER_DISK;

/// Readout module → mechanical wedge position, per disk.
pub const MODULE_MAP: [[usize; WEDGES_PER_DISK]; N_DISKS] = [
    [1, 6, 0, 11, 5, 10, 4, 9, 3, 8, 2, 7],
    [6, 0, 11, 5, 10, 4, 9, 3, 8, 2, 7, 1],
    [1, 6, 0, 11, 5, 10, 4, 9, 3, 8, 2, 7],
];

/// Readout sensor → slot within the wedge.
pub const SENSOR_MAP: [usize; SENSORS_PER_WEDGE] = [2, 0, 1];

/// Nominal sensor z (cm), indexed by [`SensorIndex::z_index`].
pub const DEFAULT_SENSOR_Z: [f64; 12] = [
    150.008101, 151.403100, 153.491899, 152.096900, 166.989901, 165.594901, 163.506101,
    164.901101, 177.039106, 178.434106, 180.522905, 179.127906,
];

/// Decomposition of a global sensor index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SensorIndex {
    pub global: usize,
    pub half: usize,
    pub disk: usize,
    pub wedge: usize,
    pub slot: usize,
}

impl SensorIndex {
    pub fn new(global: usize) -> Option<Self> {
        (global < N_SENSORS).then_some(Self {
            global,
            half: (global / 18) % 2,
            disk: global / SENSORS_PER_DISK,
            wedge: global / SENSORS_PER_WEDGE,
            slot: global % SENSORS_PER_WEDGE,
        })
    }

    /// Index into [`DEFAULT_SENSOR_Z`].
    pub fn z_index(&self) -> usize {
        let outer = usize::from(self.slot != 0);
        self.disk * 4 + 2 * (self.wedge % 2) + outer
    }

    pub fn nominal_z(&self) -> f64 {
        DEFAULT_SENSOR_Z[self.z_index()]
    }

    /// Rotation of the wedge about the beam: 30° pitch, 75° phase.
    pub fn wedge_angle(&self) -> f64 {
        PI * 5.0 / 12.0 - self.wedge as f64 * PI / 6.0
    }
}

/// Global sensor index of a readout id on `disk`.
pub fn global_sensor_index(disk: usize, raw: u32, misaligned: bool) -> Option<usize> {
    let raw = raw as usize;
    if misaligned {
        return (raw < N_SENSORS).then_some(raw);
    }
    let modules = MODULE_MAP.get(disk)?;
    let module = modules[(raw / SENSORS_PER_WEDGE) % WEDGES_PER_DISK];
    let slot = SENSOR_MAP[raw % SENSORS_PER_WEDGE];
    Some(disk * SENSORS_PER_DISK + module * SENSORS_PER_WEDGE + slot)
}

/// Disk-local readout id that maps onto `global`; inverse of [`global_sensor_index`].
pub fn raw_sensor_id(global: usize, misaligned: bool) -> Option<u32> {
    let idx = SensorIndex::new(global)?;
    if misaligned {
        return Some(global as u32);
    }
    let wedge_in_disk = idx.wedge % WEDGES_PER_DISK;
    let module = MODULE_MAP[idx.disk].iter().position(|&m| m == wedge_in_disk)?;
    let sensor = SENSOR_MAP.iter().position(|&s| s == idx.slot)?;
    Some((module * SENSORS_PER_WEDGE + sensor) as u32)
}

/// Inner sensors cover r below this (cm); outer pairs above.
pub const INNER_SENSOR_RADIUS: f64 = 16.0;

/// Global index of the nominal sensor covering transverse point `(x, y)` on
/// `disk`: the wedge whose axis is closest in φ, then the inner sensor or the
/// outer sensor on the matching side of the wedge axis.
pub fn nominal_sensor_at(disk: usize, x: f64, y: f64) -> Option<usize> {
    if disk >= N_DISKS {
        return None;
    }
    let phi = y.atan2(x);
    let offset = |wedge: usize| {
        let d = phi - SensorIndex::new(disk * SENSORS_PER_DISK + wedge * SENSORS_PER_WEDGE)
            .map(|i| i.wedge_angle())
            .unwrap_or_default();
        d.sin().atan2(d.cos())
    };
    let wedge = (0..WEDGES_PER_DISK).min_by(|a, b| offset(*a).abs().total_cmp(&offset(*b).abs()))?;
    let slot = if x.hypot(y) < INNER_SENSOR_RADIUS {
        0
    } else if offset(wedge) < 0.0 {
        1
    } else {
        2
    };
    Some(disk * SENSORS_PER_DISK + wedge * SENSORS_PER_WEDGE + slot)
}

/// A resolved sensor plane with its homogeneous transform and inverse.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResolvedPlane {
    pub pose: PlanePose,
    /// Sensor-local → global, including the nominal z offset
    pub transform: Matrix4<f64>,
    /// Global → sensor-local
    pub inverse: Matrix4<f64>,
}

/// Composes survey transforms into sensor planes.
pub struct AlignmentResolver<'a> {
    store: &'a dyn CalibrationStore,
    identity_default: &'a [AlignmentLink],
}

impl<'a> AlignmentResolver<'a> {
    pub fn new(store: &'a dyn CalibrationStore, identity_default: &'a [AlignmentLink]) -> Self {
        Self {
            store,
            identity_default,
        }
    }

    fn link(&self, link: AlignmentLink, row: usize, sensor: usize) -> Result<RigidTransform> {
        if !self.store.has_table(link) {
            if self.identity_default.contains(&link) {
                return Ok(RigidTransform::identity());
            }
            return Err(FwdError::Calibration {
                link,
                sensor,
                reason: "table absent".into(),
            });
        }
        let entry = self.store.row(link, row).ok_or_else(|| FwdError::Calibration {
            link,
            sensor,
            reason: format!("row {row} missing"),
        })?;
        RigidTransform::from_row(entry).map_err(|reason| FwdError::Calibration {
            link,
            sensor,
            reason,
        })
    }

    /// Composite transform `M` of one sensor, without the nominal z offset.
    pub fn chain(&self, sensor: usize) -> Result<Matrix4<f64>> {
        let idx = SensorIndex::new(sensor).ok_or_else(|| FwdError::Calibration {
            link: AlignmentLink::Sensor,
            sensor,
            reason: format!("sensor index out of range (max {})", N_SENSORS - 1),
        })?;
        let parent = self.link(AlignmentLink::Parent, 0, sensor)?;
        let carrier = self.link(AlignmentLink::Carrier, idx.half, sensor)?;
        let wedge = self.link(AlignmentLink::Wedge, idx.wedge, sensor)?;
        let local = self.link(AlignmentLink::Sensor, idx.global, sensor)?;
        Ok(parent.to_homogeneous()
            * carrier.to_homogeneous()
            * wedge.to_homogeneous()
            * local.to_homogeneous()
            * RigidTransform::rot_z(idx.wedge_angle()).to_homogeneous())
    }

    /// Plane pose of one sensor plus the transform pair used for local mapping.
    pub fn resolve_plane(&self, sensor: usize) -> Result<ResolvedPlane> {
        let chain = self.chain(sensor)?;
        let z = SensorIndex::new(sensor).map(|i| i.nominal_z()).unwrap_or_default();

        let mut shift = Matrix4::identity();
        shift[(2, 3)] = z;
        let transform = shift * chain;
        let inverse = transform.try_inverse().ok_or_else(|| FwdError::Calibration {
            link: AlignmentLink::Sensor,
            sensor,
            reason: "composite transform is singular".into(),
        })?;

        let apply = |p: Vector4<f64>| -> Vector3<f64> { (chain * p).xyz() };
        let o = apply(Vector4::new(0.0, 0.0, 0.0, 1.0));
        let u = apply(Vector4::new(1.0, 0.0, 0.0, 1.0)) - o;
        let v = apply(Vector4::new(0.0, 1.0, 0.0, 1.0)) - o;
        let pose = PlanePose::new(Vector3::new(0.0, 0.0, z) + o, u, v);

        Ok(ResolvedPlane {
            pose,
            transform,
            inverse,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::SurveyTables;
    use approx::assert_relative_eq;
    use std::collections::HashSet;

    fn surveyed() -> SurveyTables {
        let mut t = SurveyTables::identity();
        let row = t.row_mut(AlignmentLink::Wedge, 7).unwrap();
        let (s, c) = 0.002f64.sin_cos();
        row.rotation = [[c, -s, 0.0], [s, c, 0.0], [0.0, 0.0, 1.0]];
        row.translation = [0.03, -0.01, 0.2];
        t.row_mut(AlignmentLink::Carrier, 1).unwrap().translation = [0.0, 0.05, 0.0];
        t
    }

    #[test]
    fn index_decomposition() {
        let i = SensorIndex::new(41).unwrap();
        assert_eq!((i.half, i.disk, i.wedge, i.slot), (0, 1, 13, 2));
        assert_eq!(i.z_index(), 4 + 2 + 1);
        assert!(SensorIndex::new(108).is_none());
        assert_eq!(SensorIndex::new(18).unwrap().half, 1);
    }

    #[test]
    fn module_map_is_a_bijection_per_disk() {
        for disk in 0..N_DISKS {
            let globals: HashSet<usize> = (0..SENSORS_PER_DISK as u32)
                .map(|raw| global_sensor_index(disk, raw, false).unwrap())
                .collect();
            assert_eq!(globals.len(), SENSORS_PER_DISK);
            assert!(globals.iter().all(|g| g / SENSORS_PER_DISK == disk));
        }
    }

    #[test]
    fn raw_id_inverts_mapping() {
        for g in 0..N_SENSORS {
            let raw = raw_sensor_id(g, false).unwrap();
            assert_eq!(global_sensor_index(g / SENSORS_PER_DISK, raw, false), Some(g));
            assert_eq!(global_sensor_index(0, raw_sensor_id(g, true).unwrap(), true), Some(g));
        }
    }

    #[test]
    fn known_mapping_entries() {
        // raw 0 on disk 0: module 1, sensor map 2
        assert_eq!(global_sensor_index(0, 0, false), Some(5));
        // raw 4 on disk 1: module index 1 → wedge 0, sensor map 0
        assert_eq!(global_sensor_index(1, 4, false), Some(36));
    }

    #[test]
    fn nominal_sensor_lookup() {
        // Wedge 0 sits at 75°, wedge 3 at -15°.
        let a = 75f64.to_radians();
        assert_eq!(nominal_sensor_at(0, 10.0 * a.cos(), 10.0 * a.sin()), Some(0));
        let b = (-15f64 + 5.0).to_radians();
        assert_eq!(nominal_sensor_at(2, 20.0 * b.cos(), 20.0 * b.sin()), Some(72 + 9 + 2));
        let c = (-15f64 - 5.0).to_radians();
        assert_eq!(nominal_sensor_at(1, 20.0 * c.cos(), 20.0 * c.sin()), Some(36 + 9 + 1));
        assert_eq!(nominal_sensor_at(3, 1.0, 1.0), None);
    }

    #[test]
    fn resolve_is_deterministic() {
        let t = surveyed();
        let r = AlignmentResolver::new(&t, &[]);
        for s in [0, 21, 22, 107] {
            assert_eq!(r.resolve_plane(s).unwrap(), r.resolve_plane(s).unwrap());
        }
    }

    #[test]
    fn transform_times_inverse_is_identity() {
        let t = surveyed();
        let r = AlignmentResolver::new(&t, &[]);
        for s in 0..N_SENSORS {
            let p = r.resolve_plane(s).unwrap();
            assert_relative_eq!(p.transform * p.inverse, Matrix4::identity(), epsilon = 1e-9);
        }
    }

    #[test]
    fn identity_survey_gives_rotated_nominal_planes() {
        let t = SurveyTables::identity();
        let r = AlignmentResolver::new(&t, &[]);
        let p = r.resolve_plane(3).unwrap();
        let angle = PI * 5.0 / 12.0 - PI / 6.0;
        assert_relative_eq!(p.pose.origin, Vector3::new(0.0, 0.0, DEFAULT_SENSOR_Z[2]), epsilon = 1e-12);
        assert_relative_eq!(p.pose.u, Vector3::new(angle.cos(), angle.sin(), 0.0), epsilon = 1e-12);
        assert_relative_eq!(p.pose.v, Vector3::new(-angle.sin(), angle.cos(), 0.0), epsilon = 1e-12);
    }

    #[test]
    fn missing_row_names_link_and_sensor() {
        let mut t = SurveyTables::identity();
        t.insert_table(AlignmentLink::Wedge, vec![crate::calibration::SurveyRow::identity(0)]);
        let r = AlignmentResolver::new(&t, &[]);
        assert!(r.resolve_plane(1).is_ok());
        match r.resolve_plane(40) {
            Err(FwdError::Calibration { link, sensor, .. }) => {
                assert_eq!(link, AlignmentLink::Wedge);
                assert_eq!(sensor, 40);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn identity_default_only_for_absent_designated_tables() {
        let mut t = SurveyTables::identity();
        t.remove_table(AlignmentLink::Parent);
        assert!(AlignmentResolver::new(&t, &[]).resolve_plane(0).is_err());
        let allowed = [AlignmentLink::Parent];
        assert!(AlignmentResolver::new(&t, &allowed).resolve_plane(0).is_ok());

        // A present but short table is still an error.
        t.insert_table(AlignmentLink::Carrier, Vec::new());
        let allowed = [AlignmentLink::Parent, AlignmentLink::Carrier];
        assert!(AlignmentResolver::new(&t, &allowed).resolve_plane(0).is_err());
    }
}
