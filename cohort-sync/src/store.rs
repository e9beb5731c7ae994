// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persisted share state.
//!
//! For each private share the store keeps the serialized graph, the team
//! keyring sealed with a key derived from the local device's signing secret,
//! and the application document ids. The whole store packs into one CBOR
//! blob suitable for any key-value backend.
use std::collections::BTreeMap;

use cohort_auth::team::Keyring;
use cohort_auth::{LocalDevice, Team};
use cohort_core::cbor;
use cohort_core::crypto::aead::{AeadNonce, aead_decrypt, aead_encrypt};
use cohort_core::crypto::Rng;
use cohort_core::Hash;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coordinator::ShareId;

/// A keyring encrypted with the local device's storage key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SealedKeyring {
    #[serde(with = "serde_bytes")]
    nonce: [u8; 24],
    #[serde(with = "serde_bytes")]
    ciphertext: Vec<u8>,
}

/// Everything persisted for one share.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShareRecord {
    #[serde(with = "serde_bytes")]
    pub graph: Vec<u8>,
    pub sealed_keyring: Option<SealedKeyring>,
    pub document_ids: Vec<String>,
}

/// The keyed store of all shares known to this device.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShareStore {
    records: BTreeMap<ShareId, ShareRecord>,
}

impl ShareStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a team share: its graph plus its keyring sealed to the device.
    pub fn insert_team(
        &mut self,
        share_id: impl Into<ShareId>,
        team: &Team,
        device: &LocalDevice,
        document_ids: Vec<String>,
        rng: &Rng,
    ) -> Result<(), ShareStoreError> {
        let graph = team.save().map_err(|err| ShareStoreError::Team(err.to_string()))?;
        let sealed_keyring = Some(seal_keyring(team.keyring(), device, rng)?);
        self.records.insert(
            share_id.into(),
            ShareRecord {
                graph,
                sealed_keyring,
                document_ids,
            },
        );
        Ok(())
    }

    pub fn record(&self, share_id: &str) -> Option<&ShareRecord> {
        self.records.get(share_id)
    }

    pub fn remove(&mut self, share_id: &str) -> Option<ShareRecord> {
        self.records.remove(share_id)
    }

    pub fn share_ids(&self) -> impl Iterator<Item = &ShareId> {
        self.records.keys()
    }

    /// Unseal the keyring stored for a share.
    pub fn open_keyring(
        &self,
        share_id: &str,
        device: &LocalDevice,
    ) -> Result<Keyring, ShareStoreError> {
        let record = self
            .records
            .get(share_id)
            .ok_or_else(|| ShareStoreError::UnknownShare(share_id.to_string()))?;
        let sealed = record
            .sealed_keyring
            .as_ref()
            .ok_or_else(|| ShareStoreError::UnknownShare(share_id.to_string()))?;
        let plaintext = aead_decrypt(
            &storage_key(device),
            &sealed.ciphertext,
            sealed.nonce,
            None,
        )
        .map_err(|_| ShareStoreError::WrongDevice)?;
        Ok(cbor::decode(&plaintext)?)
    }

    /// Pack the whole store into one blob.
    pub fn save(&self) -> Result<Vec<u8>, ShareStoreError> {
        Ok(cbor::encode(self)?)
    }

    pub fn load(bytes: &[u8]) -> Result<Self, ShareStoreError> {
        Ok(cbor::decode(bytes)?)
    }
}

fn seal_keyring(
    keyring: &Keyring,
    device: &LocalDevice,
    rng: &Rng,
) -> Result<SealedKeyring, ShareStoreError> {
    let plaintext = cbor::encode(keyring)?;
    let nonce: AeadNonce = rng
        .random_array()
        .map_err(|err| ShareStoreError::Team(err.to_string()))?;
    let ciphertext = aead_encrypt(&storage_key(device), &plaintext, nonce, None)
        .map_err(|_| ShareStoreError::WrongDevice)?;
    Ok(SealedKeyring { nonce, ciphertext })
}

/// Symmetric storage key bound to the device's signing secret.
fn storage_key(device: &LocalDevice) -> [u8; 32] {
    *Hash::derive("cohort device storage key", &device.keys.signing.to_bytes()).as_bytes()
}

#[derive(Debug, Error)]
pub enum ShareStoreError {
    #[error("no share stored under id \"{0}\"")]
    UnknownShare(String),

    #[error("keyring was sealed by a different device")]
    WrongDevice,

    #[error("team error: {0}")]
    Team(String),

    #[error(transparent)]
    Encode(#[from] cbor::EncodeError),

    #[error(transparent)]
    Decode(#[from] cbor::DecodeError),
}

#[cfg(test)]
mod tests {
    use cohort_auth::Team;
    use cohort_auth::test_utils::context_for;
    use cohort_core::crypto::Rng;

    use super::{ShareStore, ShareStoreError};

    #[test]
    fn store_round_trip() {
        let context = context_for("alice");
        let device = context.device.clone();
        let rng = Rng::from_seed([1; 32]);
        let mut team = Team::create("spies", context, rng).unwrap();
        team.add_role("managers").unwrap();

        let rng = Rng::from_seed([2; 32]);
        let mut store = ShareStore::new();
        store
            .insert_team("share-1", &team, &device, vec!["doc-1".to_string()], &rng)
            .unwrap();

        let bytes = store.save().unwrap();
        let loaded = ShareStore::load(&bytes).unwrap();

        let record = loaded.record("share-1").unwrap();
        assert_eq!(record.document_ids, vec!["doc-1".to_string()]);

        // The graph round-trips into a working team.
        let restored = Team::load(
            &record.graph,
            context_for("alice"),
            Rng::from_seed([3; 32]),
        )
        .unwrap();
        assert!(restored.state().has_role("managers"));

        // The keyring opens only for the sealing device.
        let keyring = loaded.open_keyring("share-1", &device).unwrap();
        assert_eq!(keyring.len(), team.keyring().len());

        let other_device = context_for("bob").device;
        assert!(matches!(
            loaded.open_keyring("share-1", &other_device),
            Err(ShareStoreError::WrongDevice)
        ));
    }
}
