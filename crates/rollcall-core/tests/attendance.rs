use chrono::{NaiveDate, NaiveDateTime};
use rollcall_core::{
    Config, DateRange, FeatureVector, MemoryStorage, ObserveDecision, RecordOutcome,
    ResolutionPipeline,
};
use std::sync::Arc;

const DIM: usize = 128;

/// Unit vector along `axis`, scaled.
fn axis(axis: usize, scale: f32) -> FeatureVector {
    let mut v = vec![0.0f32; DIM];
    v[axis] = scale;
    FeatureVector::new(v)
}

fn offset(base: &FeatureVector, axis: usize, delta: f32) -> FeatureVector {
    let mut v = base.as_slice().to_vec();
    v[axis] += delta;
    FeatureVector::new(v)
}

fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 9, day)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
}

fn pipeline() -> ResolutionPipeline {
    ResolutionPipeline::open(&Config::default(), Arc::new(MemoryStorage::new())).unwrap()
}

#[test]
fn alice_scenario() {
    let p = pipeline();
    let (v1, v2, v3) = (axis(0, 1.0), axis(1, 1.0), axis(2, 1.0));
    let alice = p
        .identities()
        .enroll("alice", vec![v1, v2.clone(), v3], None)
        .unwrap();

    let probe = offset(&v2, 5, 0.1);
    let first = p.observe_at(&probe, at(2, 9, 0)).unwrap();
    assert_eq!(first.decision, ObserveDecision::Marked);
    assert_eq!(first.identity.as_ref(), Some(&alice));
    assert!((first.distance - 0.1).abs() < 1e-5);
    assert!((first.confidence.unwrap() - 0.75).abs() < 1e-4);

    let second = p.observe_at(&probe, at(2, 9, 5)).unwrap();
    assert_eq!(second.decision, ObserveDecision::AlreadyMarked);
    assert_eq!(second.occurrence_count, Some(2));

    let events: Vec<_> = p
        .ledger()
        .query(DateRange::day(at(2, 0, 0).date()))
        .collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].display_name, "alice");
    assert_eq!(events[0].occurrence_count, 2);
}

#[test]
fn exact_reference_resolves_with_zero_distance() {
    let p = pipeline();
    let a = p
        .identities()
        .enroll("a", vec![axis(0, 1.0), axis(1, 1.0)], None)
        .unwrap();
    p.identities()
        .enroll("b", vec![axis(2, 1.0), axis(3, 1.0)], None)
        .unwrap();

    let obs = p.observe_at(&axis(1, 1.0), at(2, 9, 0)).unwrap();
    assert_eq!(obs.identity, Some(a));
    assert_eq!(obs.distance, 0.0);
    assert_eq!(obs.confidence, Some(1.0));
}

#[test]
fn far_probe_is_unknown() {
    let p = pipeline();
    for i in 0..10 {
        p.identities()
            .enroll(&format!("person {i}"), vec![axis(i, 1.0)], None)
            .unwrap();
    }
    let obs = p.observe_at(&axis(50, 1.0), at(2, 9, 0)).unwrap();
    assert_eq!(obs.decision, ObserveDecision::Unknown);
    assert!(p.ledger().is_empty());
}

#[test]
fn repeated_observations_collapse_to_one_event() {
    let p = pipeline();
    let alice = p.identities().enroll("alice", vec![axis(0, 1.0)], None).unwrap();

    let times = [at(3, 12, 0), at(3, 8, 15), at(3, 17, 45), at(3, 10, 0)];
    for t in times {
        p.observe_at(&axis(0, 1.0), t).unwrap();
    }

    let event = p.ledger().get(&alice, at(3, 0, 0).date()).unwrap();
    assert_eq!(event.occurrence_count, times.len() as u32);
    assert_eq!(event.first_seen, at(3, 8, 15));
    assert_eq!(event.last_seen, at(3, 17, 45));
    assert_eq!(p.ledger().len(), 1);
}

#[test]
fn different_days_make_distinct_events() {
    let p = pipeline();
    let alice = p.identities().enroll("alice", vec![axis(0, 1.0)], None).unwrap();
    p.observe_at(&axis(0, 1.0), at(3, 9, 0)).unwrap();
    let next = p.observe_at(&axis(0, 1.0), at(4, 9, 0)).unwrap();
    assert_eq!(next.decision, ObserveDecision::Marked);

    let range = DateRange::new(at(3, 0, 0).date(), at(4, 0, 0).date()).unwrap();
    assert_eq!(p.ledger().history(&alice, range).len(), 2);
}

#[test]
fn concurrent_observations_yield_one_event() {
    const K: usize = 32;
    let p = pipeline();
    let alice = p.identities().enroll("alice", vec![axis(0, 1.0)], None).unwrap();
    let bob = p.identities().enroll("bob", vec![axis(1, 1.0)], None).unwrap();

    let decisions: Vec<ObserveDecision> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..K)
            .map(|i| {
                let p = &p;
                s.spawn(move || {
                    let probe = if i % 2 == 0 { axis(0, 1.0) } else { axis(1, 1.0) };
                    p.observe_at(&probe, at(5, 9, i as u32)).unwrap().decision
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let marked = decisions
        .iter()
        .filter(|d| **d == ObserveDecision::Marked)
        .count();
    assert_eq!(marked, 2, "exactly one Marked per identity");

    let day = at(5, 0, 0).date();
    assert_eq!(p.ledger().len(), 2);
    assert_eq!(p.ledger().get(&alice, day).unwrap().occurrence_count, (K / 2) as u32);
    assert_eq!(p.ledger().get(&bob, day).unwrap().occurrence_count, (K / 2) as u32);
}

#[test]
fn concurrent_record_same_key() {
    const K: usize = 64;
    let p = pipeline();
    let alice = p.identities().enroll("alice", vec![axis(0, 1.0)], None).unwrap();
    let ledger = p.ledger().clone();

    let outcomes: Vec<RecordOutcome> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..K)
            .map(|_| {
                let ledger = &ledger;
                let alice = &alice;
                s.spawn(move || ledger.record(alice, "alice", at(6, 9, 0)).unwrap().outcome)
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(
        outcomes.iter().filter(|o| **o == RecordOutcome::Created).count(),
        1
    );
    let event = ledger.get(&alice, at(6, 0, 0).date()).unwrap();
    assert_eq!(event.occurrence_count, K as u32);
}

#[test]
fn enrollment_during_observation_is_consistent() {
    let p = pipeline();
    p.identities().enroll("anchor", vec![axis(0, 1.0)], None).unwrap();

    std::thread::scope(|s| {
        s.spawn(|| {
            for i in 1..40 {
                p.identities()
                    .enroll(&format!("p{i}"), vec![axis(i, 1.0), axis(i, 0.9)], None)
                    .unwrap();
            }
        });
        s.spawn(|| {
            for m in 0..40 {
                let obs = p.observe_at(&axis(0, 1.0), at(7, 9, m)).unwrap();
                assert_ne!(obs.decision, ObserveDecision::Unknown);
            }
        });
    });

    assert_eq!(p.identities().len(), 40);
    assert_eq!(
        p.ledger().query(DateRange::day(at(7, 0, 0).date())).count(),
        1
    );
}

#[test]
fn removing_identity_keeps_history() {
    let p = pipeline();
    let alice = p.identities().enroll("alice", vec![axis(0, 1.0)], None).unwrap();
    p.observe_at(&axis(0, 1.0), at(8, 9, 0)).unwrap();
    p.identities().remove(&alice).unwrap();

    let events: Vec<_> = p.ledger().query(DateRange::day(at(8, 0, 0).date())).collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].identity_id, alice);
    assert_eq!(events[0].display_name, "alice");

    let obs = p.observe_at(&axis(0, 1.0), at(8, 10, 0)).unwrap();
    assert_eq!(obs.decision, ObserveDecision::Unknown);
}
