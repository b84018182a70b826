//! Plane registry: every detector plane of one alignment epoch.
//!
//! Built once before fitting; read-only (and `Send + Sync`) afterwards.
//! Silicon planes are keyed by (disk, global sensor index), tracker stations
//! by (station, sensor 0).

use crate::alignment::{global_sensor_index, AlignmentResolver, N_SENSORS, SENSORS_PER_DISK};
use crate::calibration::{CalibrationStore, GeometryService};
use crate::config::GeometryConfig;
use crate::error::{FwdError, Result};
use crate::plane::PlanePose;
use crate::types::{Hit, LayerId, PlaneKey, SensorId, Subsystem};
use nalgebra::{Matrix4, Vector3, Vector4};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Geometry service values below this are treated as missing.
const MISSING_Z: f64 = 1.0;

#[derive(Clone, Debug)]
struct PlaneEntry {
    pose: PlanePose,
    inverse: Matrix4<f64>,
}

/// Outcome of [`PlaneRegistry::build`].
#[derive(Debug)]
pub struct RegistryBuild {
    pub registry: PlaneRegistry,
    /// One entry per sensor that could not be resolved
    pub failures: Vec<FwdError>,
}

#[derive(Clone, Debug)]
pub struct PlaneRegistry {
    planes: BTreeMap<PlaneKey, PlaneEntry>,
    layer_z: BTreeMap<LayerId, f64>,
    misaligned: bool,
}

impl PlaneRegistry {
    /// Resolve all silicon sensors and register one plane per tracker station.
    /// Sensors that fail to resolve are reported and left out.
    pub fn build(
        store: &dyn CalibrationStore,
        geometry: &dyn GeometryService,
        config: &GeometryConfig,
    ) -> RegistryBuild {
        let resolver = AlignmentResolver::new(store, &config.identity_default_links);
        let mut planes = BTreeMap::new();
        let mut layer_z = BTreeMap::new();
        let mut failures = Vec::new();

        for sensor in 0..N_SENSORS {
            match resolver.resolve_plane(sensor) {
                Ok(resolved) => {
                    let key = PlaneKey::new(
                        LayerId::fst((sensor / SENSORS_PER_DISK) as u8),
                        SensorId(sensor as u16),
                    );
                    planes.insert(
                        key,
                        PlaneEntry {
                            pose: resolved.pose,
                            inverse: resolved.inverse,
                        },
                    );
                }
                Err(e) => {
                    warn!(sensor, error = %e, "skipping silicon sensor");
                    failures.push(e);
                }
            }
        }

        for (disk, fallback) in config.fst_z.iter().enumerate() {
            let z = nominal_or_fallback(geometry, Subsystem::Fst, disk, *fallback);
            layer_z.insert(LayerId::fst(disk as u8), z);
        }

        for (station, fallback) in config.ftt_z.iter().enumerate() {
            let z = nominal_or_fallback(geometry, Subsystem::Ftt, station, *fallback);
            let layer = LayerId::ftt(station as u8);
            let pose = PlanePose::nominal(z);
            let mut inverse = Matrix4::identity();
            inverse[(2, 3)] = -z;
            planes.insert(PlaneKey::new(layer, SensorId(0)), PlaneEntry { pose, inverse });
            layer_z.insert(layer, z);
        }

        info!(
            planes = planes.len(),
            failed = failures.len(),
            misaligned = config.misaligned,
            "plane registry built"
        );

        RegistryBuild {
            registry: Self {
                planes,
                layer_z,
                misaligned: config.misaligned,
            },
            failures,
        }
    }

    pub fn get(&self, key: &PlaneKey) -> Result<&PlanePose> {
        self.planes
            .get(key)
            .map(|e| &e.pose)
            .ok_or(FwdError::UnknownPlane(*key))
    }

    /// Global → sensor-local homogeneous transform.
    pub fn get_inverse(&self, key: &PlaneKey) -> Result<&Matrix4<f64>> {
        self.planes
            .get(key)
            .map(|e| &e.inverse)
            .ok_or(FwdError::UnknownPlane(*key))
    }

    /// Plane a hit was measured on.
    pub fn plane_for_hit(&self, hit: &Hit) -> Result<PlaneKey> {
        let key = match hit.layer.subsystem {
            Subsystem::Fst => {
                let disk = hit.layer.index as usize;
                let unknown = PlaneKey::new(hit.layer, SensorId(hit.raw_sensor.min(u16::MAX as u32) as u16));
                let global = global_sensor_index(disk, hit.raw_sensor, self.misaligned)
                    .ok_or(FwdError::UnknownPlane(unknown))?;
                if global / SENSORS_PER_DISK != disk {
                    return Err(FwdError::UnknownPlane(unknown));
                }
                PlaneKey::new(hit.layer, SensorId(global as u16))
            }
            Subsystem::Ftt => PlaneKey::new(hit.layer, SensorId(0)),
        };
        if self.planes.contains_key(&key) {
            Ok(key)
        } else {
            Err(FwdError::UnknownPlane(key))
        }
    }

    /// A global point in the sensor frame of `key`.
    pub fn to_sensor_local(&self, key: &PlaneKey, world: &Vector3<f64>) -> Result<Vector3<f64>> {
        let inv = self.get_inverse(key)?;
        Ok((inv * Vector4::new(world.x, world.y, world.z, 1.0)).xyz())
    }

    /// Nominal z of a layer (geometry service, or the configured fallback).
    pub fn layer_z(&self, layer: LayerId) -> Option<f64> {
        self.layer_z.get(&layer).copied()
    }

    pub fn misaligned(&self) -> bool {
        self.misaligned
    }

    pub fn len(&self) -> usize {
        self.planes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.planes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PlaneKey, &PlanePose)> {
        self.planes.iter().map(|(k, e)| (k, &e.pose))
    }

    /// Registered tracker stations, inner to outer.
    pub fn tracker_layers(&self) -> Vec<LayerId> {
        self.layer_z
            .keys()
            .filter(|l| l.subsystem == Subsystem::Ftt)
            .copied()
            .collect()
    }

    pub fn silicon_disks(&self) -> Vec<LayerId> {
        self.layer_z
            .keys()
            .filter(|l| l.subsystem == Subsystem::Fst)
            .copied()
            .collect()
    }
}

fn nominal_or_fallback(geometry: &dyn GeometryService, subsystem: Subsystem, layer: usize, fallback: f64) -> f64 {
    let z = geometry.nominal_z(subsystem, layer);
    if z < MISSING_Z {
        warn!(?subsystem, layer, fallback, "no nominal z from geometry service, using default");
        fallback
    } else {
        z
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
