//! Rebinds per-contact tangential history and duration across a
//! contact-list regeneration, using the mapping kT published alongside
//! the new contact list.
//!
//! Uses `TempVectorPool` slots 2..6 exclusively, never the hot-path slots
//! 0..2 that a worker's own per-cycle bookkeeping occupies.

use crate::arrays::{ContactArrays, MemTracker, TempVectorPool, NULL_MAPPING};
use crate::config::Verbosity;

const NEW_HISTORY_SLOT: usize = 2;
const NEW_DURATION_SLOT: usize = 3;
const SENTRY_REACHED_SLOT: usize = 4;
const SENTRY_ALIVE_SLOT: usize = 5;

/// Outcome of one migration pass, surfaced for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub n_carried_over: usize,
    pub n_newly_born: usize,
    pub n_lost: usize,
}

/// Rebuilds `contacts.history` / `contacts.duration` in place so that entry
/// `i` of the *new* contact list carries forward the history of whatever
/// contact occupied `mapping[i]` in the *old* list, or starts fresh
/// (`[0,0,0]`, `0.0`) when `mapping[i] == NULL_MAPPING` (newly-born
/// contact). `old_len` is the contact count before this cycle's
/// regeneration; `mapping.len()` is always the new count.
///
/// A contact present in the old list but reached by no entry of `mapping`
/// has genuinely dropped out (bodies separated, or left the domain) and its
/// history is simply discarded — this is never an error, but when a sentry
/// pass is requested it is reported so an async, history-bearing run can
/// log a drop count in its step metrics.
pub fn migrate(
    contacts: &mut ContactArrays,
    mapping: &[u32],
    old_len: usize,
    pool: &TempVectorPool,
    tracker: &MemTracker,
    run_sentry: bool,
    verbosity: Verbosity,
) -> MigrationReport {
    let new_len = mapping.len();

    let old_history = std::mem::take(&mut contacts.history);
    let old_duration = std::mem::take(&mut contacts.duration);
    debug_assert!(old_history.len() >= old_len);
    debug_assert!(old_duration.len() >= old_len);

    pool.write_f64x3(NEW_HISTORY_SLOT, &vec![[0.0; 3]; new_len]);
    pool.write_f64(NEW_DURATION_SLOT, &vec![0.0; new_len]);

    let mut new_history = pool.read_f64x3(NEW_HISTORY_SLOT, new_len);
    let mut new_duration = pool.read_f64(NEW_DURATION_SLOT, new_len);

    let mut reached = vec![false; old_len];
    let mut n_carried_over = 0usize;
    let mut n_newly_born = 0usize;

    for (new_idx, &old_idx) in mapping.iter().enumerate() {
        if old_idx == NULL_MAPPING {
            n_newly_born += 1;
            continue;
        }
        let old_idx = old_idx as usize;
        new_history[new_idx] = old_history[old_idx];
        new_duration[new_idx] = old_duration[old_idx];
        reached[old_idx] = true;
        n_carried_over += 1;
    }

    pool.write_f64x3(NEW_HISTORY_SLOT, &new_history);
    pool.write_f64(NEW_DURATION_SLOT, &new_duration);
    contacts.history = pool.read_f64x3(NEW_HISTORY_SLOT, new_len);
    contacts.duration = pool.read_f64(NEW_DURATION_SLOT, new_len);
    tracker.add((new_len as i64 - old_len as i64) * (24 + 8));

    let n_lost = if run_sentry {
        let alive: Vec<bool> = old_duration.iter().take(old_len).map(|&d| d > 0.0).collect();
        pool.write_bool(SENTRY_REACHED_SLOT, &reached);
        pool.write_bool(SENTRY_ALIVE_SLOT, &alive);
        let reached_back = pool.read_bool(SENTRY_REACHED_SLOT, old_len);
        let alive_back = pool.read_bool(SENTRY_ALIVE_SLOT, old_len);
        let lost = reached_back
            .iter()
            .zip(alive_back.iter())
            .filter(|&(&r, &a)| !r && a)
            .count();
        if lost > 0 && verbosity >= Verbosity::StepMetric {
            tracing::warn!(lost, old_len, new_len, "contacts dropped without reaching new list");
        }
        lost
    } else {
        old_len.saturating_sub(n_carried_over)
    };

    MigrationReport {
        n_carried_over,
        n_newly_born,
        n_lost,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::ContactType;

    fn seeded(n: usize) -> ContactArrays {
        let tracker = MemTracker::default();
        let mut c = ContactArrays::default();
        c.grow_to(n, &tracker);
        for i in 0..n {
            c.id_a[i] = i as u32;
            c.id_b[i] = (i + 100) as u32;
            c.contact_type[i] = ContactType::SphereSphere;
            c.history[i] = [i as f64, 0.0, 0.0];
            c.duration[i] = i as f64 * 0.1;
        }
        c
    }

    #[test]
    fn carries_history_through_stable_mapping() {
        let mut contacts = seeded(3);
        let pool = TempVectorPool::default();
        let tracker = MemTracker::default();
        let mapping = vec![0u32, 1, 2];
        let report = migrate(&mut contacts, &mapping, 3, &pool, &tracker, false, Verbosity::Debug);
        assert_eq!(report.n_carried_over, 3);
        assert_eq!(report.n_newly_born, 0);
        assert_eq!(contacts.history[2], [2.0, 0.0, 0.0]);
    }

    #[test]
    fn newly_born_contact_starts_with_zero_history() {
        let mut contacts = seeded(2);
        let pool = TempVectorPool::default();
        let tracker = MemTracker::default();
        let mapping = vec![0u32, NULL_MAPPING, 1];
        let report = migrate(&mut contacts, &mapping, 2, &pool, &tracker, false, Verbosity::Debug);
        assert_eq!(report.n_newly_born, 1);
        assert_eq!(contacts.history[1], [0.0, 0.0, 0.0]);
        assert_eq!(contacts.duration[1], 0.0);
        assert_eq!(contacts.history[2], [1.0, 0.0, 0.0]);
    }

    #[test]
    fn sentry_pass_detects_dropped_contact() {
        let mut contacts = seeded(3);
        let pool = TempVectorPool::default();
        let tracker = MemTracker::default();
        // Old index 1 is never referenced by the new mapping.
        let mapping = vec![0u32, 2];
        let report = migrate(&mut contacts, &mapping, 3, &pool, &tracker, true, Verbosity::StepMetric);
        assert_eq!(report.n_lost, 1);
    }

    #[test]
    fn sentry_does_not_count_already_dead_dropped_contact_as_lost() {
        let mut contacts = seeded(3);
        let pool = TempVectorPool::default();
        let tracker = MemTracker::default();
        // Old index 0 has duration 0.0 (seeded() sets duration[i] = i * 0.1)
        // and is never referenced by the new mapping: it was never alive,
        // so its absence is not a drop.
        let mapping = vec![1u32, 2];
        let report = migrate(&mut contacts, &mapping, 3, &pool, &tracker, true, Verbosity::StepMetric);
        assert_eq!(report.n_lost, 0);
    }

    #[test]
    fn shrinking_list_reports_lost_without_sentry() {
        let mut contacts = seeded(4);
        let pool = TempVectorPool::default();
        let tracker = MemTracker::default();
        let mapping = vec![0u32, 1];
        let report = migrate(&mut contacts, &mapping, 4, &pool, &tracker, false, Verbosity::Debug);
        assert_eq!(report.n_lost, 2);
    }
}
