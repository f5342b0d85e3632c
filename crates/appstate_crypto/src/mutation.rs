//! Encryption and authentication of individual mutation records.
//!
//! Value blob layout: `nonce (12 bytes) || AES-256-GCM ciphertext || value MAC (16 bytes)`.
//! The GCM associated data is the index MAC, binding the value to its index.

use crate::error::{CryptoError, CryptoResult};
use crate::keys::DerivedKeys;
use crate::lthash::{IndexMac, ValueMac, INDEX_MAC_SIZE, VALUE_MAC_SIZE};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use appstate_protocol::{KeyId, Mutation, MutationRecord, Operation, SyncActionData};
use hmac::{Hmac, Mac};
use rand::{Rng, RngCore};
use sha2::{Sha256, Sha512};
use zeroize::Zeroizing;

/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

pub(crate) fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> HmacSha256 {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    for part in parts {
        mac.update(part);
    }
    mac
}

fn value_mac_state(
    keys: &DerivedKeys,
    operation: Operation,
    key_id: &KeyId,
    content: &[u8],
) -> HmacSha512 {
    let mut mac = <HmacSha512 as Mac>::new_from_slice(keys.value_mac_key())
        .expect("HMAC can take key of any size");
    mac.update(&[operation.to_code()]);
    mac.update(key_id.as_bytes());
    mac.update(content);
    mac.update(&(key_id.as_bytes().len() as u64 + 1).to_be_bytes());
    mac
}

/// Computes the index MAC of a plaintext index.
pub fn index_mac(keys: &DerivedKeys, index: &[u8]) -> IndexMac {
    hmac_sha256(keys.index_key(), &[index]).finalize().into_bytes().into()
}

/// A mutation that decrypted and passed its per-record MAC checks but whose
/// collection-level hash has not been verified yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UntrustedMutation {
    mutation: Mutation,
    index_mac: IndexMac,
    value_mac: ValueMac,
    key_id: KeyId,
}

impl UntrustedMutation {
    /// The decoded mutation.
    pub fn mutation(&self) -> &Mutation {
        &self.mutation
    }

    /// Index MAC supplied by the server and checked against the index.
    pub fn index_mac(&self) -> &IndexMac {
        &self.index_mac
    }

    /// Value MAC of the encrypted value.
    pub fn value_mac(&self) -> &ValueMac {
        &self.value_mac
    }

    /// Key the record was encrypted with.
    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    pub(crate) fn into_trusted(self) -> TrustedMutation {
        TrustedMutation {
            mutation: self.mutation,
            index_mac: self.index_mac,
            value_mac: self.value_mac,
            key_id: self.key_id,
        }
    }
}

/// A mutation whose collection-level MAC has been verified.
///
/// Only [`IntegrityVerifier`](crate::IntegrityVerifier) creates these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedMutation {
    mutation: Mutation,
    index_mac: IndexMac,
    value_mac: ValueMac,
    key_id: KeyId,
}

impl TrustedMutation {
    /// The decoded mutation.
    pub fn mutation(&self) -> &Mutation {
        &self.mutation
    }

    /// Index MAC.
    pub fn index_mac(&self) -> &IndexMac {
        &self.index_mac
    }

    /// Value MAC.
    pub fn value_mac(&self) -> &ValueMac {
        &self.value_mac
    }

    /// Key the record was encrypted with.
    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    /// Consumes self, returning the mutation.
    pub fn into_mutation(self) -> Mutation {
        self.mutation
    }
}

impl AsRef<Mutation> for TrustedMutation {
    fn as_ref(&self) -> &Mutation {
        &self.mutation
    }
}

/// An encrypted mutation ready to embed in a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMutation {
    /// The wire record.
    pub record: MutationRecord,
    /// Index MAC (also inside `record`).
    pub index_mac: IndexMac,
    /// Value MAC (tail of `record.value_blob`).
    pub value_mac: ValueMac,
}

/// Encrypts a mutation for pushing.
///
/// Adds between 0 and `max_padding` random padding bytes to the payload.
pub fn encrypt_mutation(
    mutation: &Mutation,
    key_id: &KeyId,
    keys: &DerivedKeys,
    max_padding: usize,
) -> CryptoResult<EncryptedMutation> {
    let mut rng = rand::thread_rng();
    let mut padding = vec![0u8; rng.gen_range(0..=max_padding)];
    rng.fill_bytes(&mut padding);

    let plaintext = Zeroizing::new(mutation.to_action_data(padding).encode()?);
    let index_mac = index_mac(keys, &mutation.index.to_bytes());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rng.fill_bytes(&mut nonce_bytes);
    let cipher = Aes256Gcm::new(GenericArray::from_slice(keys.value_encryption_key()));
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext.as_slice(),
                aad: &index_mac,
            },
        )
        .map_err(|_| CryptoError::encryption_failed("value encryption failed"))?;

    let mut value_blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len() + VALUE_MAC_SIZE);
    value_blob.extend_from_slice(&nonce_bytes);
    value_blob.extend(ciphertext);

    let full = value_mac_state(keys, mutation.operation, key_id, &value_blob)
        .finalize()
        .into_bytes();
    let mut value_mac = [0u8; VALUE_MAC_SIZE];
    value_mac.copy_from_slice(&full[..VALUE_MAC_SIZE]);
    value_blob.extend_from_slice(&value_mac);

    Ok(EncryptedMutation {
        record: MutationRecord {
            operation: mutation.operation,
            index_mac: index_mac.to_vec(),
            value_blob,
            key_id: key_id.clone(),
        },
        index_mac,
        value_mac,
    })
}

/// Splits the index and value MACs out of a wire record without decrypting.
///
/// These are the record's LT-hash contribution, so a record whose payload
/// cannot be decrypted still hashes correctly.
pub fn record_macs(record: &MutationRecord) -> CryptoResult<(IndexMac, ValueMac)> {
    let index_mac: IndexMac = record
        .index_mac
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::malformed(format!("index MAC must be {INDEX_MAC_SIZE} bytes")))?;

    if record.value_blob.len() < NONCE_SIZE + TAG_SIZE + VALUE_MAC_SIZE {
        return Err(CryptoError::malformed("value blob too short"));
    }
    let mut value_mac = [0u8; VALUE_MAC_SIZE];
    value_mac.copy_from_slice(&record.value_blob[record.value_blob.len() - VALUE_MAC_SIZE..]);
    Ok((index_mac, value_mac))
}

/// Decrypts and authenticates one wire record.
///
/// The value MAC is checked before any decryption is attempted, and the
/// decoded index must hash to the server-supplied index MAC.
pub fn decrypt_mutation(
    record: &MutationRecord,
    keys: &DerivedKeys,
) -> CryptoResult<UntrustedMutation> {
    let (index_mac, value_mac) = record_macs(record)?;
    let content = &record.value_blob[..record.value_blob.len() - VALUE_MAC_SIZE];

    value_mac_state(keys, record.operation, &record.key_id, content)
        .verify_truncated_left(&value_mac)
        .map_err(|_| CryptoError::integrity_violation("value MAC mismatch"))?;

    let (nonce, ciphertext) = content.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(GenericArray::from_slice(keys.value_encryption_key()));
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &index_mac,
                },
            )
            .map_err(|_| CryptoError::integrity_violation("value decryption failed"))?,
    );

    let data = SyncActionData::decode(&plaintext)?;

    hmac_sha256(keys.index_key(), &[data.index.as_slice()])
        .verify_slice(&index_mac)
        .map_err(|_| CryptoError::integrity_violation("index MAC does not match decoded index"))?;

    let mutation = Mutation::from_action_data(record.operation, data)?;

    Ok(UntrustedMutation {
        mutation,
        index_mac,
        value_mac,
        key_id: record.key_id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::derive_keys;
    use appstate_protocol::{action_names, MutationIndex, SyncAction, SyncActionValue};
    use proptest::prelude::*;

    fn keys(seed: u8) -> DerivedKeys {
        derive_keys(&[seed; 32]).unwrap()
    }

    fn archive(jid: &str, archived: bool, timestamp: u64) -> Mutation {
        Mutation::set(
            MutationIndex::new(action_names::ARCHIVE, [jid]),
            SyncActionValue::new(timestamp, SyncAction::Archive { archived }),
            3,
        )
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let keys = keys(1);
        let key_id = KeyId::new([0, 1]);
        let mutation = archive("a@s.whatsapp.net", true, 1000);

        let encrypted = encrypt_mutation(&mutation, &key_id, &keys, 16).unwrap();
        assert_eq!(encrypted.record.key_id, key_id);
        assert_eq!(encrypted.record.index_mac, encrypted.index_mac.to_vec());

        let decrypted = decrypt_mutation(&encrypted.record, &keys).unwrap();
        assert_eq!(decrypted.mutation(), &mutation);
        assert_eq!(decrypted.index_mac(), &encrypted.index_mac);
        assert_eq!(decrypted.value_mac(), &encrypted.value_mac);
    }

    #[test]
    fn index_mac_is_stable_across_encryptions() {
        let keys = keys(1);
        let key_id = KeyId::new([1]);
        let a = encrypt_mutation(&archive("x", true, 1), &key_id, &keys, 8).unwrap();
        let b = encrypt_mutation(&archive("x", false, 2), &key_id, &keys, 8).unwrap();
        assert_eq!(a.index_mac, b.index_mac);
        assert_ne!(a.record.value_blob, b.record.value_blob);
    }

    #[test]
    fn tampered_value_fails_before_decrypting() {
        let keys = keys(2);
        let mut encrypted =
            encrypt_mutation(&archive("x", true, 1), &KeyId::new([1]), &keys, 0).unwrap();
        encrypted.record.value_blob[NONCE_SIZE] ^= 0x01;

        let err = decrypt_mutation(&encrypted.record, &keys).unwrap_err();
        assert_eq!(err, CryptoError::integrity_violation("value MAC mismatch"));
    }

    #[test]
    fn flipped_operation_fails_value_mac() {
        let keys = keys(2);
        let mut encrypted =
            encrypt_mutation(&archive("x", true, 1), &KeyId::new([1]), &keys, 0).unwrap();
        encrypted.record.operation = Operation::Remove;
        assert!(decrypt_mutation(&encrypted.record, &keys)
            .unwrap_err()
            .is_integrity_violation());
    }

    #[test]
    fn swapped_index_mac_is_rejected() {
        let keys = keys(3);
        let key_id = KeyId::new([1]);
        let a = encrypt_mutation(&archive("a", true, 1), &key_id, &keys, 0).unwrap();
        let b = encrypt_mutation(&archive("b", true, 1), &key_id, &keys, 0).unwrap();

        let mut forged = a.record.clone();
        forged.index_mac = b.record.index_mac.clone();
        assert!(decrypt_mutation(&forged, &keys).unwrap_err().is_integrity_violation());
    }

    #[test]
    fn wrong_keys_are_rejected() {
        let encrypted =
            encrypt_mutation(&archive("x", true, 1), &KeyId::new([1]), &keys(4), 0).unwrap();
        assert!(decrypt_mutation(&encrypted.record, &keys(5))
            .unwrap_err()
            .is_integrity_violation());
    }

    #[test]
    fn record_macs_match_encryption() {
        let keys = keys(1);
        let encrypted =
            encrypt_mutation(&archive("x", true, 1), &KeyId::new([1]), &keys, 4).unwrap();
        let (index_mac, value_mac) = record_macs(&encrypted.record).unwrap();
        assert_eq!(index_mac, encrypted.index_mac);
        assert_eq!(value_mac, encrypted.value_mac);
    }

    #[test]
    fn short_blob_is_malformed() {
        let record = MutationRecord {
            operation: Operation::Set,
            index_mac: vec![0; 32],
            value_blob: vec![0; 20],
            key_id: KeyId::new([1]),
        };
        assert!(matches!(
            decrypt_mutation(&record, &keys(1)),
            Err(CryptoError::MalformedRecord { .. })
        ));

        let record = MutationRecord {
            index_mac: vec![0; 31],
            ..record
        };
        assert!(matches!(
            decrypt_mutation(&record, &keys(1)),
            Err(CryptoError::MalformedRecord { .. })
        ));
    }

    fn arb_mutation() -> impl Strategy<Value = Mutation> {
        (
            "[a-z0-9]{1,20}",
            any::<bool>(),
            any::<u64>(),
            any::<bool>(),
            0u32..10,
        )
            .prop_map(|(jid, flag, timestamp, remove, version)| {
                let index = MutationIndex::new(action_names::PIN, [jid]);
                if remove {
                    Mutation::remove(index, timestamp, version)
                } else {
                    Mutation::set(
                        index,
                        SyncActionValue::new(timestamp, SyncAction::Pin { pinned: flag }),
                        version,
                    )
                }
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn decrypt_inverts_encrypt(
            mutation in arb_mutation(),
            key in prop::array::uniform32(any::<u8>()),
            key_id in prop::collection::vec(any::<u8>(), 1..8),
            max_padding in 0usize..32,
        ) {
            let keys = derive_keys(&key).unwrap();
            let key_id = KeyId::new(key_id);
            let encrypted = encrypt_mutation(&mutation, &key_id, &keys, max_padding).unwrap();
            let decrypted = decrypt_mutation(&encrypted.record, &keys).unwrap();
            prop_assert_eq!(decrypted.mutation(), &mutation);
            prop_assert_eq!(decrypted.key_id(), &key_id);
        }
    }
}
