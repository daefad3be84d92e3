//! Deterministic identity derivation and the shielded address codec.
//!
//! The whole identity hangs off one wallet signature over a canonical
//! message, so any front-end that can ask the wallet to sign recovers the
//! same keys. Three MiMC domain tags keep the spending key, the viewing
//! key and the address pubkey in separate derivation branches.

use std::fmt;
use std::str::FromStr;

use alloy::primitives::Address;
use ark_bn254::Fr;
use crypto_box::{PublicKey as EncryptionPubkey, SecretKey as EncryptionSecret};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{AddressError, IdentityError};
use crate::field::{fr_bytes_canonical, fr_from_bytes, fr_hex, fr_to_bytes, keccak256, mimc_sponge, tags};

/// Prefix of the shielded address wire format.
pub const ADDRESS_PREFIX: &str = "zdoge:";

const ADDRESS_VERSION: u8 = 1;
/// version + address pubkey + encryption pubkey + checksum
const ADDRESS_PAYLOAD_LEN: usize = 1 + 32 + 32 + 4;

/// The canonical message the wallet signs to unlock a shielded identity.
pub fn identity_message(chain_id: u64, pool_address: Address) -> String {
    format!("Shielded Pool Identity v1 | {chain_id} | {pool_address:#x}")
}

/// Viewing and spending material for one wallet. Derived once per unlock,
/// dropped on wallet change.
#[derive(Clone, Serialize, Deserialize)]
pub struct Identity {
    #[serde(with = "fr_hex")]
    spending_key: Fr,
    #[serde(with = "fr_hex")]
    viewing_key: Fr,
    #[serde(with = "fr_hex")]
    pub address_pubkey: Fr,
}

impl Identity {
    /// Derive from the raw wallet signature over [`identity_message`].
    pub fn from_signature(signature: &[u8]) -> Result<Self, IdentityError> {
        if signature.len() < 32 {
            return Err(IdentityError::BadSignature);
        }
        let secret = Zeroizing::new(keccak256(signature));
        let secret_fr = fr_from_bytes(secret.as_slice());
        let t = tags();
        let spending_key = mimc_sponge(&[secret_fr], t.spending);
        let viewing_key = mimc_sponge(&[secret_fr], t.viewing);
        let address_pubkey = mimc_sponge(&[spending_key], t.address);
        Ok(Identity {
            spending_key,
            viewing_key,
            address_pubkey,
        })
    }

    pub(crate) fn spending_key(&self) -> Fr {
        self.spending_key
    }

    pub(crate) fn viewing_key(&self) -> Fr {
        self.viewing_key
    }

    /// X25519 secret for memo decryption, bound to the viewing key.
    pub fn encryption_secret(&self) -> EncryptionSecret {
        EncryptionSecret::from(fr_to_bytes(&self.viewing_key))
    }

    /// The long-term receive address, reused across all receives.
    pub fn address(&self) -> ShieldedAddress {
        ShieldedAddress {
            address_pubkey: self.address_pubkey,
            encryption_pubkey: self.encryption_secret().public_key(),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never print key material
        f.debug_struct("Identity")
            .field("address_pubkey", &self.address_pubkey.to_string())
            .finish_non_exhaustive()
    }
}

/// A shielded receive address: the owner pubkey plus the memo encryption
/// pubkey, carried as `zdoge:<base58>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShieldedAddress {
    pub address_pubkey: Fr,
    pub encryption_pubkey: EncryptionPubkey,
}

impl fmt::Display for ShieldedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut payload = Vec::with_capacity(ADDRESS_PAYLOAD_LEN);
        payload.push(ADDRESS_VERSION);
        payload.extend_from_slice(&fr_to_bytes(&self.address_pubkey));
        payload.extend_from_slice(self.encryption_pubkey.as_bytes());
        let check = keccak256(&payload);
        payload.extend_from_slice(&check[..4]);
        write!(f, "{ADDRESS_PREFIX}{}", bs58::encode(payload).into_string())
    }
}

impl FromStr for ShieldedAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s.strip_prefix(ADDRESS_PREFIX).ok_or(AddressError::BadPrefix)?;
        let payload = bs58::decode(encoded)
            .into_vec()
            .map_err(|_| AddressError::BadEncoding)?;
        if payload.len() != ADDRESS_PAYLOAD_LEN {
            return Err(AddressError::BadLength);
        }
        let (body, check) = payload.split_at(ADDRESS_PAYLOAD_LEN - 4);
        if keccak256(body)[..4] != check[..] {
            return Err(AddressError::BadChecksum);
        }
        if body[0] != ADDRESS_VERSION {
            return Err(AddressError::UnsupportedVersion(body[0]));
        }
        let mut pk = [0u8; 32];
        pk.copy_from_slice(&body[1..33]);
        if !fr_bytes_canonical(&pk) {
            return Err(AddressError::NotInField);
        }
        let mut epk = [0u8; 32];
        epk.copy_from_slice(&body[33..65]);
        Ok(ShieldedAddress {
            address_pubkey: fr_from_bytes(&pk),
            encryption_pubkey: EncryptionPubkey::from(epk),
        })
    }
}
