mod helpers;

use chrono::Duration;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use helpers::{faulty_system, memory_at, now, seed, test_config, test_system, test_system_with};
use tiermem::backend::{RelationalStore, VectorFilter, VectorStore};
use tiermem::error::BackendKind;
use tiermem::memory::types::Tier;

fn tier_of(system: &tiermem::system::TierMem, id: &str) -> Tier {
    system.store.get(id).unwrap().unwrap().tier
}

#[test]
fn aged_memories_migrate_and_a_second_cycle_is_a_noop() {
    let stack = faulty_system();
    let system = &stack.system;
    let t0 = now();

    let aged: Vec<_> = (0..3)
        .map(|i| memory_at(&format!("aged working note {i}"), Tier::Working, 0.3, t0 - Duration::hours(2)))
        .collect();
    let fresh = memory_at("fresh working note", Tier::Working, 0.3, t0 - Duration::minutes(5));
    let aged_ids: Vec<String> = aged.iter().map(|m| m.id.clone()).collect();
    let fresh_id = fresh.id.clone();
    seed(system, aged.into_iter().chain([fresh]).collect());

    let first = system.store.migrate_at(t0, &CancellationToken::new());
    assert!(!first.cancelled);
    let working = first.step(Tier::Working).unwrap();
    assert_eq!(working.migrated, 3);
    assert_eq!(working.failed, 0);
    assert_eq!(first.step(Tier::Session).unwrap().migrated, 0);

    for id in &aged_ids {
        assert_eq!(tier_of(system, id), Tier::Session);
    }
    assert_eq!(tier_of(system, &fresh_id), Tier::Working);

    // Placement is mirrored in the vector backend
    let in_session = stack
        .vector
        .get_all(Some(&VectorFilter::tier(Tier::Session)), None)
        .unwrap();
    assert_eq!(in_session.len(), 3);

    let second = system.store.migrate_at(t0, &CancellationToken::new());
    assert_eq!(second.total_migrated(), 0);
    assert_eq!(second.total_considered(), 0);
}

#[test]
fn old_memories_cascade_to_long_term_in_one_cycle() {
    let system = test_system();
    let t0 = now();
    let old = memory_at("two day old scratch", Tier::Working, 0.2, t0 - Duration::days(2));
    let id = old.id.clone();
    seed(&system, vec![old]);

    let report = system.store.migrate_at(t0, &CancellationToken::new());
    assert_eq!(report.step(Tier::Working).unwrap().migrated, 1);
    assert_eq!(report.step(Tier::Session).unwrap().migrated, 1);
    assert_eq!(tier_of(&system, &id), Tier::LongTerm);

    // Tiers never move backwards
    let later = system
        .store
        .migrate_at(t0 + Duration::days(400), &CancellationToken::new());
    assert_eq!(later.total_migrated(), 0);
    assert_eq!(tier_of(&system, &id), Tier::LongTerm);
}

#[test]
fn important_memories_stay_despite_age() {
    let system = test_system();
    let t0 = now();
    let keep = memory_at("critical production runbook", Tier::Working, 0.9, t0 - Duration::hours(3));
    let move_on = memory_at("idle chatter", Tier::Working, 0.1, t0 - Duration::hours(3));
    let (keep_id, move_id) = (keep.id.clone(), move_on.id.clone());
    seed(&system, vec![keep, move_on]);

    system.store.migrate_at(t0, &CancellationToken::new());
    assert_eq!(tier_of(&system, &keep_id), Tier::Working);
    assert_eq!(tier_of(&system, &move_id), Tier::Session);
}

#[test]
fn access_floor_keeps_frequently_read_memories_eligible() {
    let mut config = test_config();
    config.tiers.working.min_access_count = 3;
    let system = test_system_with(config);
    let t0 = now();

    // Important, but rarely read: the access floor still moves it
    let rarely_read = memory_at("important but rarely read", Tier::Working, 0.9, t0 - Duration::hours(2));
    let id = rarely_read.id.clone();
    seed(&system, vec![rarely_read]);

    system.store.migrate_at(t0, &CancellationToken::new());
    assert_eq!(tier_of(&system, &id), Tier::Session);
}

#[test]
fn over_capacity_tier_evicts_least_recently_accessed() {
    let mut config = test_config();
    config.tiers.working.max_size = 3;
    let system = test_system_with(config);
    let t0 = now();

    let memories: Vec<_> = (0..5)
        .map(|i| {
            memory_at(
                &format!("recent note {i}"),
                Tier::Working,
                0.9,
                t0 - Duration::minutes(50 - i * 10),
            )
        })
        .collect();
    let ids: Vec<String> = memories.iter().map(|m| m.id.clone()).collect();
    seed(&system, memories);

    let report = system.store.migrate_at(t0, &CancellationToken::new());
    let working = report.step(Tier::Working).unwrap();
    assert_eq!(working.over_cap, 2);
    assert_eq!(working.migrated, 2);

    // The two least recently accessed went to session, regardless of importance
    assert_eq!(tier_of(&system, &ids[0]), Tier::Session);
    assert_eq!(tier_of(&system, &ids[1]), Tier::Session);
    for id in &ids[2..] {
        assert_eq!(tier_of(&system, id), Tier::Working);
    }
}

#[test]
fn failed_items_are_recorded_and_left_in_place() {
    let stack = faulty_system();
    let system = &stack.system;
    let t0 = now();
    let memories: Vec<_> = (0..2)
        .map(|i| memory_at(&format!("stuck note {i}"), Tier::Working, 0.2, t0 - Duration::hours(2)))
        .collect();
    let ids: Vec<String> = memories.iter().map(|m| m.id.clone()).collect();
    seed(system, memories);

    stack.vector_faults.fail("update_metadata");
    let report = system.store.migrate_at(t0, &CancellationToken::new());
    let working = report.step(Tier::Working).unwrap();
    assert_eq!(working.considered, 2);
    assert_eq!(working.migrated, 0);
    assert_eq!(working.failed, 2);
    assert!(working
        .errors
        .iter()
        .all(|e| e.backend == Some(BackendKind::Vector)));
    for id in &ids {
        assert_eq!(tier_of(system, id), Tier::Working);
    }

    stack.vector_faults.clear();
    let retry = system.store.migrate_at(t0, &CancellationToken::new());
    assert_eq!(retry.step(Tier::Working).unwrap().migrated, 2);
}

#[test]
fn missing_vector_copy_is_rewritten_during_migration() {
    let stack = faulty_system();
    let system = &stack.system;
    let t0 = now();
    let memory = memory_at("vector copy lost", Tier::Working, 0.2, t0 - Duration::hours(2));
    let id = memory.id.clone();
    seed(system, vec![memory]);
    stack.vector.delete(&id).unwrap();

    let report = system.store.migrate_at(t0, &CancellationToken::new());
    assert_eq!(report.step(Tier::Working).unwrap().migrated, 1);
    let session = stack
        .vector
        .get_all(Some(&VectorFilter::tier(Tier::Session)), None)
        .unwrap();
    assert_eq!(session.len(), 1);
    assert_eq!(session[0].id, id);
}

#[test]
fn cancelled_cycle_returns_partial_report() {
    let system = test_system();
    let t0 = now();
    seed(
        &system,
        vec![memory_at("aged", Tier::Working, 0.2, t0 - Duration::hours(2))],
    );

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = system.store.migrate_at(t0, &cancel);
    assert!(report.cancelled);
    assert_eq!(report.total_migrated(), 0);
    assert_eq!(report.steps.len(), 1);
}

#[test]
fn long_term_over_capacity_is_reported_not_migrated() {
    let mut config = test_config();
    config.tiers.long_term.max_size = 1;
    let system = test_system_with(config);
    let t0 = now();
    seed(
        &system,
        (0..3)
            .map(|i| memory_at(&format!("durable fact {i}"), Tier::LongTerm, 0.5, t0 - Duration::days(500)))
            .collect(),
    );

    let report = system.store.migrate_at(t0, &CancellationToken::new());
    assert_eq!(report.long_term_over_cap, Some(3));
    assert_eq!(report.total_migrated(), 0);
    assert_eq!(
        system.store.count_by_tier().unwrap().get(&Tier::LongTerm),
        Some(&3)
    );
}

#[test]
fn consolidation_keeps_a_tier_moved_during_the_merge() {
    let stack = faulty_system();
    let system = &stack.system;
    let t0 = now();
    let mut survivor = memory_at("retry the flaky upload step twice", Tier::Working, 0.6, t0 - Duration::hours(1));
    survivor.access_count = 2;
    let mut other = memory_at("retry the flaky upload step", Tier::Working, 0.3, t0 - Duration::hours(1));
    other.access_count = 1;
    let (survivor_id, other_id) = (survivor.id.clone(), other.id.clone());
    seed(system, vec![survivor, other]);

    // A migration and a read land between the consolidation's read and its merge
    let inner = Arc::clone(&stack.relational);
    let id = survivor_id.clone();
    stack.relational_faults.on_call("merge_stats", move || {
        assert!(inner.set_tier(&id, Tier::Working, Tier::Session).unwrap());
        inner.record_access(&id, t0).unwrap();
    });

    let outcome = system
        .store
        .consolidate(&[survivor_id.clone(), other_id.clone()])
        .unwrap();
    assert_eq!(outcome.survivor.id, survivor_id);
    assert_eq!(outcome.removed, vec![other_id]);

    let merged = system.store.get(&survivor_id).unwrap().unwrap();
    assert_eq!(merged.tier, Tier::Session);
    assert_eq!(merged.access_count, 4);
    assert!((merged.importance - 0.6).abs() < 1e-9);
    assert_eq!(merged.last_accessed_at, t0);
}
