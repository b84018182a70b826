//! `fwd_core` — Forward-region track fitting.
//!
//! # Module layout
//! - [`types`]        — Fundamental types (IDs, hits, candidates, track state)
//! - [`config`]       — Tracker configuration (TOML)
//! - [`calibration`]  — Survey tables and the calibration/geometry seams
//! - [`alignment`]    — Survey chain → silicon sensor planes
//! - [`plane`]        — Plane poses and local frames
//! - [`registry`]     — All detector planes of one alignment epoch
//! - [`field`]        — Magnetic field models
//! - [`propagation`]  — RK4 transport and Jacobians
//! - [`material`]     — Multiple scattering noise
//! - [`measurement`]  — Hits and the vertex as trajectory points
//! - [`seed`]         — Circle-fit momentum seed
//! - [`kf`]           — Kalman filter (predict / update)
//! - [`fitter`]       — Two-hypothesis iterative trajectory fit
//! - [`refine`]       — Refit with silicon hits and the vertex
//! - [`global_refit`] — Track + plane offset re-fit
//! - [`pipeline`]     — Per-event orchestration
//! - [`diagnostics`]  — Fit observers and histogram summaries

pub mod alignment;
pub mod calibration;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod field;
pub mod fitter;
pub mod global_refit;
pub mod kf;
pub mod material;
pub mod measurement;
pub mod pipeline;
pub mod plane;
pub mod propagation;
pub mod refine;
pub mod registry;
pub mod seed;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::TrackerConfig;
pub use error::{FwdError, Result};
pub use fitter::{FitResult, FitStage, TrajectoryFitter};
pub use pipeline::{Event, EventCandidate, EventFitter, EventOutput, EventStats, TrackSummary};
pub use refine::RefinementFitter;
pub use registry::PlaneRegistry;
pub use types::{Candidate, CandidateId, ChargeHypothesis, Hit, LayerId, PlaneKey, SensorId, TrackState};
