//! Analytic seed: transverse circle fits through three-hit partitions.
//!
//! The four outermost layers carrying hits are labelled L0..L3 (L3
//! outermost). Circles through {L3,L2,L1}, {L3,L2,L0}, {L3,L1,L0} and
//! {L2,L1,L0} give up to four radii; radii above the outlier threshold are
//! averaged and converted to pT = R·K·field_scale.

use crate::config::SeedConfig;
use crate::error::{FwdError, Result};
use crate::types::{Hit, LayerId};
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// pT per (cm · kGauss).
pub const PT_CONSTANT: f64 = 2.9979e-4;

/// Layer labels of each partition, indices into [L0, L1, L2, L3].
const PARTITIONS: [[usize; 3]; 4] = [[3, 2, 1], [3, 2, 0], [3, 1, 0], [2, 1, 0]];

/// Radii below this are degenerate.
const MIN_RADIUS: f64 = 1e-9;

const MIN_SIN_THETA: f64 = 1e-6;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Seed {
    /// Innermost hit (smallest z)
    pub position: Vector3<f64>,
    /// Momentum with the seed pT along the seed direction (GeV)
    pub momentum: Vector3<f64>,
    /// Circle radius used for pT (cm)
    pub curvature: f64,
    pub pt: f64,
    pub eta: f64,
    pub phi: f64,
    /// Radius of each partition in the order above, `None` when skipped or degenerate
    pub partition_radii: [Option<f64>; 4],
}

/// Radius of the circle through three transverse points: abc / (4·area).
pub fn circle_radius(a: &Vector2<f64>, b: &Vector2<f64>, c: &Vector2<f64>) -> Option<f64> {
    let ab = (b - a).norm();
    let bc = (c - b).norm();
    let ca = (a - c).norm();
    let cross = (b - a).perp(&(c - a));
    let area = 0.5 * cross.abs();
    let r = ab * bc * ca / (4.0 * area);
    (r.is_finite() && r > MIN_RADIUS).then_some(r)
}

#[derive(Clone, Debug, Default)]
pub struct SeedEstimator {
    config: SeedConfig,
}

impl SeedEstimator {
    pub fn new(config: SeedConfig) -> Self {
        Self { config }
    }

    pub fn estimate(&self, hits: &[Hit]) -> Result<Seed> {
        if hits.len() < 3 {
            return Err(FwdError::InsufficientHits {
                required: 3,
                found: hits.len(),
            });
        }

        // Outermost hit per layer, outermost four layers.
        let mut ordered: Vec<&Hit> = hits.iter().collect();
        ordered.sort_by(|a, b| a.layer.cmp(&b.layer));
        let mut per_layer: Vec<&Hit> = Vec::new();
        let mut last: Option<LayerId> = None;
        for hit in ordered.iter().rev() {
            if last != Some(hit.layer) {
                per_layer.push(*hit);
                last = Some(hit.layer);
            }
            if per_layer.len() == 4 {
                break;
            }
        }
        if per_layer.len() < 3 {
            return Err(FwdError::InsufficientHits {
                required: 3,
                found: per_layer.len(),
            });
        }
        // per_layer is outer → inner; label so that index 3 is outermost.
        let mut labelled: [Option<Vector2<f64>>; 4] = [None; 4];
        for (i, hit) in per_layer.iter().enumerate() {
            labelled[3 - i] = Some(hit.position.xy());
        }

        let mut partition_radii = [None; 4];
        for (slot, partition) in PARTITIONS.iter().enumerate() {
            if let [Some(a), Some(b), Some(c)] = partition.map(|i| labelled[i]) {
                partition_radii[slot] = circle_radius(&a, &b, &c);
            }
        }

        let accepted: Vec<f64> = partition_radii
            .iter()
            .flatten()
            .copied()
            .filter(|r| *r > self.config.min_curvature)
            .collect();
        let curvature = if accepted.is_empty() {
            self.config.default_curvature
        } else {
            accepted.iter().sum::<f64>() / accepted.len() as f64
        };
        let pt = curvature * PT_CONSTANT * self.config.field_scale;

        // Direction from the two hits farthest from the origin, inner → outer.
        let mut by_distance: Vec<&Hit> = hits.iter().collect();
        by_distance.sort_by(|a, b| a.position.norm().total_cmp(&b.position.norm()));
        let outer = by_distance[by_distance.len() - 1];
        let inner = by_distance[by_distance.len() - 2];
        let d = outer.position - inner.position;
        let theta = d.xy().norm().atan2(d.z);
        let phi = d.y.atan2(d.x);
        let eta = -(theta / 2.0).tan().ln();

        let p = pt / theta.sin().max(MIN_SIN_THETA);
        let momentum = Vector3::new(
            p * theta.sin() * phi.cos(),
            p * theta.sin() * phi.sin(),
            p * theta.cos(),
        );

        let position = hits
            .iter()
            .min_by(|a, b| a.position.z.total_cmp(&b.position.z))
            .map(|h| h.position)
            .unwrap_or_default();

        debug!(curvature, pt, eta, phi, accepted = accepted.len(), "seed estimated");

        Ok(Seed {
            position,
            momentum,
            curvature,
            pt,
            eta,
            phi,
            partition_radii,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn hits_on_circle(radius: f64, centre: Vector2<f64>, angles: &[f64], z0: f64) -> Vec<Hit> {
        angles
            .iter()
            .enumerate()
            .map(|(i, a)| {
                let p = centre + Vector2::new(a.cos(), a.sin()) * radius;
                Hit::with_sigma(LayerId::ftt(i as u8), 0, Vector3::new(p.x, p.y, z0 + 25.0 * i as f64), 0.01, 0.01)
            })
            .collect()
    }

    #[test]
    fn circle_through_three_points() {
        let r = circle_radius(&Vector2::new(1.0, 0.0), &Vector2::new(0.0, 1.0), &Vector2::new(-1.0, 0.0)).unwrap();
        assert_relative_eq!(r, 1.0, epsilon = 1e-12);
        assert!(circle_radius(&Vector2::new(0.0, 0.0), &Vector2::new(1.0, 1.0), &Vector2::new(2.0, 2.0)).is_none());
    }

    #[test]
    fn all_partitions_recover_radius() {
        let hits = hits_on_circle(250.0, Vector2::new(-240.0, 10.0), &[0.05, 0.1, 0.16, 0.23], 280.0);
        let seed = SeedEstimator::default().estimate(&hits).unwrap();
        for r in seed.partition_radii {
            assert_relative_eq!(r.unwrap(), 250.0, epsilon = 1e-6);
        }
        assert_relative_eq!(seed.curvature, 250.0, epsilon = 1e-6);
        assert_relative_eq!(seed.pt, 250.0 * PT_CONSTANT * 5.0, epsilon = 1e-9);
        assert_relative_eq!(seed.momentum.xy().norm(), seed.pt, epsilon = 1e-12);
        assert_relative_eq!(seed.position.z, 280.0);
    }

    #[test]
    fn three_layers_use_one_partition() {
        let hits = hits_on_circle(80.0, Vector2::new(0.0, -70.0), &[1.2, 1.4, 1.6], 280.0);
        let seed = SeedEstimator::default().estimate(&hits).unwrap();
        assert_relative_eq!(seed.partition_radii[0].unwrap(), 80.0, epsilon = 1e-9);
        assert!(seed.partition_radii[1..].iter().all(Option::is_none));
    }

    #[test]
    fn small_radii_fall_back_to_default() {
        let hits = hits_on_circle(5.0, Vector2::new(0.0, 0.0), &[0.0, 1.0, 2.0, 3.0], 280.0);
        let config = SeedConfig {
            default_curvature: 42.0,
            ..Default::default()
        };
        let seed = SeedEstimator::new(config).estimate(&hits).unwrap();
        assert_relative_eq!(seed.curvature, 42.0);
    }

    #[test]
    fn fewer_than_three_hits() {
        let hits = hits_on_circle(100.0, Vector2::zeros(), &[0.0, 0.1], 280.0);
        assert_eq!(
            SeedEstimator::default().estimate(&hits),
            Err(FwdError::InsufficientHits { required: 3, found: 2 })
        );
    }

    #[test]
    fn direction_from_outermost_pair() {
        let mk = |layer: u8, p: [f64; 3]| Hit::with_sigma(LayerId::ftt(layer), 0, Vector3::from(p), 0.01, 0.01);
        let hits = vec![
            mk(0, [10.0, 0.0, 280.0]),
            mk(1, [11.0, 0.0, 300.0]),
            mk(2, [12.0, 0.0, 320.0]),
            mk(3, [13.0, 0.0, 340.0]),
        ];
        let seed = SeedEstimator::default().estimate(&hits).unwrap();
        assert_relative_eq!(seed.phi, 0.0);
        assert_relative_eq!(seed.momentum.x / seed.momentum.z, 1.0 / 20.0, epsilon = 1e-12);
    }
}
