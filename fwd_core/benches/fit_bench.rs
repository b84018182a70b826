use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fwd_core::calibration::{NominalGeometry, SurveyTables};
use fwd_core::diagnostics::NoopObserver;
use fwd_core::field::build_field;
use fwd_core::propagation::Propagator;
use fwd_core::{
    Candidate, CandidateId, Event, EventCandidate, EventFitter, Hit, PlaneKey, PlaneRegistry, SensorId, TrackState,
    TrackerConfig,
};
use nalgebra::Vector3;

fn make_event(registry: &PlaneRegistry, propagator: &Propagator, n: usize) -> Event {
    let candidates = (0..n)
        .map(|i| {
            let angle = i as f64 * std::f64::consts::TAU / n as f64;
            let momentum = Vector3::new(angle.cos(), angle.sin(), 10.0);
            let charge = if i % 2 == 0 { 1.0 } else { -1.0 };
            let truth = TrackState::from_momentum(Vector3::zeros(), momentum, charge).unwrap();
            let hits = registry
                .tracker_layers()
                .into_iter()
                .map(|layer| {
                    let plane = registry.get(&PlaneKey::new(layer, SensorId(0))).unwrap();
                    let at = propagator.propagate_to_plane(&truth, plane).unwrap();
                    Hit::with_sigma(layer, 0, at.position(), 0.01, 0.01)
                })
                .collect();
            EventCandidate {
                candidate: Candidate::new(CandidateId(i as u64), hits),
                silicon_hits: Vec::new(),
            }
        })
        .collect();
    Event {
        id: 0,
        vertex: None,
        candidates,
    }
}

fn bench_pipeline(c: &mut Criterion) {
    let config = TrackerConfig::default();
    let registry =
        PlaneRegistry::build(&SurveyTables::identity(), &NominalGeometry::default(), &config.geometry).registry;
    let field = build_field(&config.field).unwrap();
    let propagator = Propagator::new(field.clone(), config.field.max_step_cm);
    let pipeline = EventFitter::new(&registry, &config, field, &NoopObserver);

    let mut group = c.benchmark_group("pipeline");
    for n in [1, 10, 100] {
        let event = make_event(&registry, &propagator, n);
        group.bench_function(format!("{n}_candidates"), |b| {
            b.iter(|| black_box(pipeline.process_event(&event)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pipeline);
criterion_main!(benches);
