//! Keys, mutations and logging setup shared by tests.

use appstate_crypto::SyncKey;
use appstate_protocol::{action_names, KeyId, Mutation, MutationIndex, SyncAction, SyncActionValue};

/// Deterministic sync key: ID `[seed]`, bytes `[seed; 32]`, timestamp `seed`.
pub fn sync_key(seed: u8) -> SyncKey {
    SyncKey::new(KeyId::new([seed]), &[seed; 32], u64::from(seed)).expect("32-byte key is valid")
}

/// Archives a chat.
pub fn archive(jid: &str, timestamp: u64) -> Mutation {
    Mutation::set(
        MutationIndex::new(action_names::ARCHIVE, [jid]),
        SyncActionValue::new(timestamp, SyncAction::Archive { archived: true }),
        3,
    )
}

/// Pins or unpins a chat.
pub fn pin(jid: &str, pinned: bool, timestamp: u64) -> Mutation {
    Mutation::set(
        MutationIndex::new(action_names::PIN, [jid]),
        SyncActionValue::new(timestamp, SyncAction::Pin { pinned }),
        5,
    )
}

/// Stars a message.
pub fn star(jid: &str, message_id: &str, timestamp: u64) -> Mutation {
    Mutation::set(
        MutationIndex::new(action_names::STAR, [jid, message_id, "1", "0"]),
        SyncActionValue::new(timestamp, SyncAction::Star { starred: true }),
        2,
    )
}

/// Mutes a chat until `until`.
pub fn mute(jid: &str, until: i64, timestamp: u64) -> Mutation {
    Mutation::set(
        MutationIndex::new(action_names::MUTE, [jid]),
        SyncActionValue::new(
            timestamp,
            SyncAction::Mute {
                muted: true,
                mute_end_timestamp: Some(until),
            },
        ),
        2,
    )
}

/// Removes whatever `mutation` set.
pub fn remove(mutation: &Mutation, timestamp: u64) -> Mutation {
    Mutation::remove(mutation.index.clone(), timestamp, mutation.version)
}

/// Installs a test-friendly `tracing` subscriber, honoring `RUST_LOG`.
///
/// Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_deterministic() {
        assert_eq!(sync_key(3).as_bytes(), sync_key(3).as_bytes());
        assert_eq!(sync_key(3).id(), &KeyId::new([3]));
        assert_ne!(sync_key(3).as_bytes(), sync_key(4).as_bytes());
    }

    #[test]
    fn remove_targets_same_index() {
        let set = pin("a@s.whatsapp.net", true, 10);
        let removal = remove(&set, 11);
        assert_eq!(removal.index, set.index);
        assert_eq!(removal.timestamp(), 11);
        init_tracing();
        init_tracing();
    }
}
