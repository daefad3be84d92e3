//! Encrypted-at-rest persistence for the note store.
//!
//! One vault file per wallet address. AES-256-GCM with a key derived from
//! the same wallet signature that derives the identity, so unlocking the
//! wallet is the only way to read the file. Plaintext never touches disk:
//! writes go to a temp file first and rename into place.

use std::fs;
use std::path::{Path, PathBuf};

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use alloy::primitives::Address;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::PersistError;
use crate::field::keccak256;
use crate::identity::Identity;
use crate::store::{Persistence, StoreSnapshot};

const VAULT_VERSION: u32 = 1;
const KEY_DOMAIN: &[u8] = b"zdoge/vault/v1";

#[derive(Serialize, Deserialize)]
struct VaultEnvelope {
    version: u32,
    /// base64, 12 bytes
    nonce: String,
    /// base64 AES-256-GCM output
    ciphertext: String,
}

pub struct Vault {
    path: PathBuf,
    key: Zeroizing<[u8; 32]>,
}

impl Vault {
    /// Open (or create the directory for) the vault of one wallet.
    /// `secret` is the raw identity signature.
    pub fn open(data_dir: &Path, wallet: Address, secret: &[u8]) -> Result<Self, PersistError> {
        fs::create_dir_all(data_dir)?;
        let mut material = Vec::with_capacity(KEY_DOMAIN.len() + secret.len());
        material.extend_from_slice(KEY_DOMAIN);
        material.extend_from_slice(secret);
        let key = Zeroizing::new(keccak256(&material));
        let path = data_dir.join(format!("{wallet:#x}.vault"));
        Ok(Vault { path, key })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cipher(&self) -> Result<Aes256Gcm, PersistError> {
        Aes256Gcm::new_from_slice(self.key.as_slice())
            .map_err(|e| PersistError::Crypto(e.to_string()))
    }
}

impl Persistence for Vault {
    fn load(&self) -> Result<Option<StoreSnapshot>, PersistError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let envelope: VaultEnvelope = serde_json::from_str(&raw)?;
        if envelope.version != VAULT_VERSION {
            return Err(PersistError::UnsupportedVersion(envelope.version));
        }
        let nonce = BASE64
            .decode(&envelope.nonce)
            .map_err(|e| PersistError::Crypto(format!("nonce: {e}")))?;
        let ciphertext = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|e| PersistError::Crypto(format!("ciphertext: {e}")))?;
        if nonce.len() != 12 {
            return Err(PersistError::Crypto("nonce must be 12 bytes".into()));
        }
        let plaintext = self
            .cipher()?
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| PersistError::Crypto("vault decryption failed".into()))?;
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    fn save(&self, snapshot: &StoreSnapshot) -> Result<(), PersistError> {
        let plaintext = Zeroizing::new(serde_json::to_vec(snapshot)?);
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| PersistError::Crypto("vault encryption failed".into()))?;
        let envelope = VaultEnvelope {
            version: VAULT_VERSION,
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
        };
        let tmp = self.path.with_extension("vault.tmp");
        fs::write(&tmp, serde_json::to_string(&envelope)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Explicit backup export/import (plaintext JSON at the boundary; the user
// decides where it goes)
// ---------------------------------------------------------------------------

const BACKUP_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
pub struct WalletBackup {
    pub version: u32,
    pub identity: Identity,
    pub snapshot: StoreSnapshot,
}

pub fn export_backup(identity: &Identity, snapshot: StoreSnapshot) -> Result<String, PersistError> {
    let backup = WalletBackup {
        version: BACKUP_VERSION,
        identity: identity.clone(),
        snapshot,
    };
    Ok(serde_json::to_string_pretty(&backup)?)
}

pub fn import_backup(raw: &str) -> Result<WalletBackup, PersistError> {
    let backup: WalletBackup = serde_json::from_str(raw)?;
    if backup.version != BACKUP_VERSION {
        return Err(PersistError::UnsupportedVersion(backup.version));
    }
    Ok(backup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::note::{Note, TokenInfo};
    use crate::store::{NoteStore, SNAPSHOT_VERSION};
    use alloy::primitives::U256;
    use ark_bn254::Fr;
    use rand::rngs::OsRng as StdOsRng;

    fn wallet() -> Address {
        "0x00000000000000000000000000000000000000aa".parse().unwrap()
    }

    #[test]
    fn round_trip_through_the_vault() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(dir.path(), wallet(), &[0x71u8; 65]).unwrap();
        assert!(vault.load().unwrap().is_none());

        let mut snapshot = StoreSnapshot::default();
        snapshot.notes.push(Note::new(
            U256::from(5u64),
            &TokenInfo::native(),
            Fr::from(7u64),
            &mut StdOsRng,
        ));
        vault.save(&snapshot).unwrap();

        let loaded = vault.load().unwrap().unwrap();
        assert_eq!(loaded.version, SNAPSHOT_VERSION);
        assert_eq!(loaded.notes.len(), 1);
        assert_eq!(loaded.notes[0].amount, U256::from(5u64));
    }

    #[test]
    fn file_on_disk_is_not_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(dir.path(), wallet(), &[0x72u8; 65]).unwrap();
        let mut snapshot = StoreSnapshot::default();
        snapshot.notes.push(Note::new(
            U256::from(5u64),
            &TokenInfo::native(),
            Fr::from(7u64),
            &mut StdOsRng,
        ));
        vault.save(&snapshot).unwrap();

        let raw = std::fs::read_to_string(vault.path()).unwrap();
        // the envelope is JSON but the payload must not leak note fields
        assert!(raw.contains("ciphertext"));
        assert!(!raw.contains("owner_pubkey"));
        assert!(!raw.contains("blinding"));
    }

    #[test]
    fn wrong_signature_cannot_open_the_vault() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(dir.path(), wallet(), &[0x73u8; 65]).unwrap();
        vault.save(&StoreSnapshot::default()).unwrap();

        let intruder = Vault::open(dir.path(), wallet(), &[0x74u8; 65]).unwrap();
        assert!(matches!(
            intruder.load(),
            Err(PersistError::Crypto(_))
        ));
    }

    #[test]
    fn vaults_are_per_wallet_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = Vault::open(dir.path(), wallet(), &[0x75u8; 65]).unwrap();
        let other: Address = "0x00000000000000000000000000000000000000bb".parse().unwrap();
        let b = Vault::open(dir.path(), other, &[0x75u8; 65]).unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn store_runs_on_top_of_the_vault() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(dir.path(), wallet(), &[0x76u8; 65]).unwrap();
        let mut store = NoteStore::open(Box::new(vault)).unwrap();
        let note = Note::new(
            U256::from(9u64),
            &TokenInfo::native(),
            Fr::from(3u64),
            &mut StdOsRng,
        );
        let c = note.commitment();
        store.add_pending(note).unwrap();
        store.confirm(c, 0, Fr::from(1u64)).unwrap();
        drop(store);

        let vault = Vault::open(dir.path(), wallet(), &[0x76u8; 65]).unwrap();
        let reopened = NoteStore::open(Box::new(vault)).unwrap();
        assert_eq!(reopened.notes().len(), 1);
        assert_eq!(reopened.note(c).unwrap().leaf_index, Some(0));
    }

    #[test]
    fn backup_export_import_round_trip() {
        let identity = Identity::from_signature(&[0x77u8; 65]).unwrap();
        let mut snapshot = StoreSnapshot::default();
        snapshot.notes.push(Note::new(
            U256::from(11u64),
            &TokenInfo::native(),
            identity.address_pubkey,
            &mut StdOsRng,
        ));
        let exported = export_backup(&identity, snapshot).unwrap();
        let imported = import_backup(&exported).unwrap();
        assert_eq!(imported.identity.address_pubkey, identity.address_pubkey);
        assert_eq!(imported.snapshot.notes.len(), 1);
    }
}
