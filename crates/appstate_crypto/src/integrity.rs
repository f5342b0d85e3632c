//! Collection-level MACs over snapshots and patches.

use crate::error::{CryptoError, CryptoResult};
use crate::keys::DerivedKeys;
use crate::lthash::LtHash;
use crate::mutation::{hmac_sha256, TrustedMutation, UntrustedMutation};
use appstate_protocol::PatchType;
use hmac::Mac;

/// Size of snapshot and patch MACs in bytes.
pub const COLLECTION_MAC_SIZE: usize = 32;

fn collection_mac(
    key: &[u8],
    hash: &LtHash,
    version: u64,
    patch_type: PatchType,
) -> [u8; COLLECTION_MAC_SIZE] {
    hmac_sha256(
        key,
        &[hash.as_bytes(), &version.to_be_bytes(), patch_type.as_str().as_bytes()],
    )
    .finalize()
    .into_bytes()
    .into()
}

/// MAC of a snapshot: `HMAC-SHA256(snapshotMacKey, hash || version || name)`.
pub fn snapshot_mac(
    keys: &DerivedKeys,
    hash: &LtHash,
    version: u64,
    patch_type: PatchType,
) -> [u8; COLLECTION_MAC_SIZE] {
    collection_mac(keys.snapshot_mac_key(), hash, version, patch_type)
}

/// MAC of a patch: `HMAC-SHA256(patchMacKey, hash || version || name)`.
pub fn patch_mac(
    keys: &DerivedKeys,
    hash: &LtHash,
    version: u64,
    patch_type: PatchType,
) -> [u8; COLLECTION_MAC_SIZE] {
    collection_mac(keys.patch_mac_key(), hash, version, patch_type)
}

fn verify(
    key: &[u8],
    hash: &LtHash,
    version: u64,
    patch_type: PatchType,
    expected: &[u8],
    what: &str,
) -> CryptoResult<()> {
    hmac_sha256(
        key,
        &[hash.as_bytes(), &version.to_be_bytes(), patch_type.as_str().as_bytes()],
    )
    .verify_slice(expected)
    .map_err(|_| {
        CryptoError::integrity_violation(format!("{what} MAC mismatch for {patch_type} v{version}"))
    })
}

/// Checks collection MACs and promotes mutations to [`TrustedMutation`].
///
/// Verification is on unless the store explicitly opts out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityVerifier {
    verify_macs: bool,
}

impl IntegrityVerifier {
    /// Creates a verifier that checks every MAC.
    pub fn new() -> Self {
        Self { verify_macs: true }
    }

    /// Creates a verifier honoring a store-level skip flag.
    pub fn with_skip(skip_mac_verification: bool) -> Self {
        Self {
            verify_macs: !skip_mac_verification,
        }
    }

    /// Returns true if MACs are checked.
    pub fn verifies(&self) -> bool {
        self.verify_macs
    }

    /// Verifies a snapshot MAC over the recomputed hash.
    ///
    /// # Errors
    ///
    /// Returns `IntegrityViolation` on mismatch; nothing is promoted.
    pub fn verify_snapshot(
        &self,
        keys: &DerivedKeys,
        patch_type: PatchType,
        version: u64,
        hash: &LtHash,
        expected_mac: &[u8],
        mutations: Vec<UntrustedMutation>,
    ) -> CryptoResult<Vec<TrustedMutation>> {
        if self.verify_macs {
            verify(keys.snapshot_mac_key(), hash, version, patch_type, expected_mac, "snapshot")?;
        } else {
            tracing::debug!(%patch_type, version, "snapshot MAC verification skipped");
        }
        Ok(mutations.into_iter().map(UntrustedMutation::into_trusted).collect())
    }

    /// Verifies a patch MAC over the hash after applying the patch.
    ///
    /// # Errors
    ///
    /// Returns `IntegrityViolation` on mismatch; nothing is promoted.
    pub fn verify_patch(
        &self,
        keys: &DerivedKeys,
        patch_type: PatchType,
        version: u64,
        hash: &LtHash,
        expected_mac: &[u8],
        mutations: Vec<UntrustedMutation>,
    ) -> CryptoResult<Vec<TrustedMutation>> {
        if self.verify_macs {
            verify(keys.patch_mac_key(), hash, version, patch_type, expected_mac, "patch")?;
        } else {
            tracing::debug!(%patch_type, version, "patch MAC verification skipped");
        }
        Ok(mutations.into_iter().map(UntrustedMutation::into_trusted).collect())
    }
}

impl Default for IntegrityVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::derive_keys;
    use crate::lthash::{apply_batch, ValueMac};
    use crate::mutation::{decrypt_mutation, encrypt_mutation};
    use appstate_protocol::{
        action_names, KeyId, Mutation, MutationIndex, SyncAction, SyncActionValue,
    };

    fn untrusted(keys: &DerivedKeys, jid: &str) -> UntrustedMutation {
        let mutation = Mutation::set(
            MutationIndex::new(action_names::STAR, [jid, "msg", "1", "0"]),
            SyncActionValue::new(10, SyncAction::Star { starred: true }),
            2,
        );
        let encrypted = encrypt_mutation(&mutation, &KeyId::new([9]), keys, 4).unwrap();
        decrypt_mutation(&encrypted.record, keys).unwrap()
    }

    fn hash_of(mutations: &[UntrustedMutation]) -> LtHash {
        apply_batch(
            &LtHash::EMPTY,
            mutations
                .iter()
                .map(|m| (m.mutation().operation, m.index_mac(), m.value_mac())),
            |_| None::<ValueMac>,
        )
        .hash
    }

    #[test]
    fn snapshot_mac_verifies_and_promotes() {
        let keys = derive_keys(&[1; 32]).unwrap();
        let mutations = vec![untrusted(&keys, "a"), untrusted(&keys, "b")];
        let hash = hash_of(&mutations);
        let mac = snapshot_mac(&keys, &hash, 45, PatchType::Regular);

        let trusted = IntegrityVerifier::new()
            .verify_snapshot(&keys, PatchType::Regular, 45, &hash, &mac, mutations.clone())
            .unwrap();
        assert_eq!(trusted.len(), 2);
        assert_eq!(trusted[0].mutation(), mutations[0].mutation());
    }

    #[test]
    fn mac_binds_version_and_name() {
        let keys = derive_keys(&[1; 32]).unwrap();
        let hash = LtHash::EMPTY;
        let mac = patch_mac(&keys, &hash, 7, PatchType::Regular);
        let verifier = IntegrityVerifier::new();

        assert!(verifier
            .verify_patch(&keys, PatchType::Regular, 7, &hash, &mac, vec![])
            .is_ok());
        assert!(verifier
            .verify_patch(&keys, PatchType::Regular, 8, &hash, &mac, vec![])
            .is_err());
        assert!(verifier
            .verify_patch(&keys, PatchType::RegularLow, 7, &hash, &mac, vec![])
            .is_err());
        // Snapshot and patch MACs use different keys.
        assert!(verifier
            .verify_snapshot(&keys, PatchType::Regular, 7, &hash, &mac, vec![])
            .is_err());
    }

    #[test]
    fn flipped_bit_is_integrity_violation() {
        let keys = derive_keys(&[2; 32]).unwrap();
        let mutations = vec![untrusted(&keys, "a")];
        let hash = hash_of(&mutations);
        let mut mac = patch_mac(&keys, &hash, 3, PatchType::Regular);
        mac[0] ^= 0x01;

        let err = IntegrityVerifier::new()
            .verify_patch(&keys, PatchType::Regular, 3, &hash, &mac, mutations)
            .unwrap_err();
        assert!(err.is_integrity_violation());
    }

    #[test]
    fn skip_flag_promotes_without_checking() {
        let keys = derive_keys(&[2; 32]).unwrap();
        let mutations = vec![untrusted(&keys, "a")];
        let verifier = IntegrityVerifier::with_skip(true);
        assert!(!verifier.verifies());

        let trusted = verifier
            .verify_patch(&keys, PatchType::Regular, 3, &LtHash::EMPTY, &[0u8; 32], mutations)
            .unwrap();
        assert_eq!(trusted.len(), 1);
    }
}
