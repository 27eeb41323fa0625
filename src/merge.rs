/// Merge rules for pending writes on the same key
///
/// Every accumulated value is combined with the next write through one of
/// these functions. They are pure and total: counters saturate at the i64
/// bounds instead of wrapping, and member insertion keeps the first
/// occurrence position.

use indexmap::IndexSet;

/// Combine two pending counter deltas (INCRBY)
pub fn merge_counter(pending: i64, delta: i64) -> i64 {
    pending.saturating_add(delta)
}

/// Combine two pending hash-field deltas (HINCRBY)
///
/// Same arithmetic as counters; kept separate so the two command kinds can
/// diverge without touching call sites.
pub fn merge_hash_field(pending: i64, delta: i64) -> i64 {
    merge_counter(pending, delta)
}

/// Union a member into a pending member set (SADD)
///
/// Returns true when the member was not already pending.
pub fn merge_member(pending: &mut IndexSet<String>, member: &str) -> bool {
    if pending.contains(member) {
        return false;
    }
    pending.insert(member.to_string())
}
