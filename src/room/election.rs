//! Deterministic host election.
//!
//! Every peer must converge on the same successor from the same snapshot, so
//! the total order is `(join_order ascending, stable_hash(device_id)
//! ascending)` with a fixed hash function and no per-process state.

use super::model::{Member, Role, Snapshot};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over the device-id bytes. Only used as an election tiebreaker; the
/// exact function matters solely in that every peer computes the same one.
pub fn stable_hash(device_id: &str) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in device_id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Elect a host among `members`: lowest `(join_order, stable_hash)` wins.
pub fn elect(members: &[Member]) -> Option<&Member> {
    members
        .iter()
        .min_by_key(|m| (m.join_order, stable_hash(&m.device_id)))
}

/// Build the snapshot a successor coordinator is seeded with.
///
/// Prunes `lost_host` from the member list, promotes `new_host` (which must
/// be one of the survivors), and rebuilds the identity lookups. Returns
/// `None` when no survivors remain or `new_host` is not among them.
pub fn migrate_snapshot(snapshot: &Snapshot, lost_host: &str, new_host: &str) -> Option<Snapshot> {
    let mut migrated = snapshot.clone();
    migrated.room.members.retain(|m| m.device_id != lost_host);
    if migrated.room.members.is_empty() || !migrated.room.is_member(new_host) {
        return None;
    }
    migrated.room.host_device_id = new_host.to_string();
    for member in &mut migrated.room.members {
        member.role = if member.device_id == new_host {
            Role::Host
        } else {
            Role::Member
        };
    }
    migrated.rebuild_lookups();
    Some(migrated)
}

/// Run the full succession: prune the lost host, then elect.
///
/// Returns the winner's device id together with the migrated snapshot that
/// seeds the winner's coordinator.
pub fn plan_succession(snapshot: &Snapshot, lost_host: &str) -> Option<(String, Snapshot)> {
    let survivors: Vec<Member> = snapshot
        .room
        .members
        .iter()
        .filter(|m| m.device_id != lost_host)
        .cloned()
        .collect();
    let winner = elect(&survivors)?.device_id.clone();
    let migrated = migrate_snapshot(snapshot, lost_host, &winner)?;
    Some((winner, migrated))
}
