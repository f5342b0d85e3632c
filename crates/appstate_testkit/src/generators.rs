//! Property-based test generators using proptest.

use appstate_crypto::{IndexMac, ValueMac, SYNC_KEY_SIZE};
use appstate_protocol::{action_names, Mutation, MutationIndex, SyncAction, SyncActionValue};
use proptest::prelude::*;

/// Strategy for user JIDs from a small pool, so indices collide often.
pub fn jid_strategy() -> impl Strategy<Value = String> {
    (0u8..8).prop_map(|n| format!("1555000{n:04}@s.whatsapp.net"))
}

/// Strategy for chat-level actions with their action names.
pub fn action_strategy() -> impl Strategy<Value = (&'static str, SyncAction)> {
    prop_oneof![
        any::<bool>()
            .prop_map(|archived| (action_names::ARCHIVE, SyncAction::Archive { archived })),
        any::<bool>().prop_map(|pinned| (action_names::PIN, SyncAction::Pin { pinned })),
        (any::<bool>(), proptest::option::of(any::<i64>())).prop_map(|(muted, end)| (
            action_names::MUTE,
            SyncAction::Mute {
                muted,
                mute_end_timestamp: end,
            }
        )),
        any::<bool>().prop_map(|read| (action_names::MARK_READ, SyncAction::MarkRead { read })),
    ]
}

/// Strategy for SET and REMOVE mutations with timestamps in `1..1000`.
pub fn mutation_strategy() -> impl Strategy<Value = Mutation> {
    (jid_strategy(), action_strategy(), 1u64..1000, any::<bool>()).prop_map(
        |(jid, (name, action), timestamp, is_set)| {
            let index = MutationIndex::new(name, [jid]);
            if is_set {
                Mutation::set(index, SyncActionValue::new(timestamp, action), 2)
            } else {
                Mutation::remove(index, timestamp, 2)
            }
        },
    )
}

/// Strategy for SET-only mutation batches.
pub fn set_batch_strategy(max_len: usize) -> impl Strategy<Value = Vec<Mutation>> {
    prop::collection::vec(
        (jid_strategy(), action_strategy(), 1u64..1000).prop_map(
            |(jid, (name, action), timestamp)| {
                Mutation::set(
                    MutationIndex::new(name, [jid]),
                    SyncActionValue::new(timestamp, action),
                    2,
                )
            },
        ),
        1..=max_len.max(1),
    )
}

/// Strategy for raw `(index_mac, value_mac)` hash entries.
pub fn mac_entry_strategy() -> impl Strategy<Value = (IndexMac, ValueMac)> {
    (prop::array::uniform32(any::<u8>()), prop::array::uniform16(any::<u8>()))
}

/// Strategy for sync key material.
pub fn sync_key_bytes_strategy() -> impl Strategy<Value = [u8; SYNC_KEY_SIZE]> {
    prop::array::uniform32(any::<u8>())
}
