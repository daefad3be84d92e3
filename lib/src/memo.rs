//! Encrypted note memos.
//!
//! Every transfer output carries a memo that lets the recipient rebuild the
//! note from chain events alone: an ephemeral X25519 agreement against the
//! address's encryption pubkey, then XSalsa20-Poly1305 over the note
//! payload. A 4-byte magic prefix inside the plaintext lets the scanner
//! drop foreign memos without parsing anything.

use alloy::primitives::{Address, U256};
use ark_bn254::Fr;
use crypto_box::{
    aead::{Aead, AeadCore, OsRng},
    PublicKey, SalsaBox, SecretKey,
};

use crate::error::MemoError;
use crate::field::{fr_bytes_canonical, fr_from_bytes, fr_to_bytes};
use crate::identity::{Identity, ShieldedAddress};
use crate::note::Note;

/// Plaintext magic; trial decryption bails when it is absent.
pub const MEMO_MAGIC: [u8; 4] = *b"ZDGM";

const EPHEMERAL_LEN: usize = 32;
const NONCE_LEN: usize = 24;
/// magic + amount + token + blinding + owner pubkey
const PLAINTEXT_LEN: usize = 4 + 32 + 20 + 32 + 32;
const TAG_LEN: usize = 16;

/// Total wire size of a well-formed memo.
pub const MEMO_LEN: usize = EPHEMERAL_LEN + NONCE_LEN + PLAINTEXT_LEN + TAG_LEN;

/// What the recipient needs to reconstruct a note.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoPayload {
    pub amount: U256,
    pub token_address: Address,
    pub blinding: Fr,
    pub owner_pubkey: Fr,
}

impl MemoPayload {
    pub fn from_note(note: &Note) -> Self {
        MemoPayload {
            amount: note.amount,
            token_address: note.token_address_or_native(),
            blinding: note.blinding,
            owner_pubkey: note.owner_pubkey,
        }
    }

    /// The commitment this payload claims to open.
    pub fn commitment(&self) -> Fr {
        crate::field::commit(
            self.owner_pubkey,
            self.amount,
            self.token_address,
            self.blinding,
        )
    }

    /// Materialize the note this payload describes. The leaf index comes
    /// from the event that carried the memo, not from the payload.
    pub fn to_note(&self, token: &crate::note::TokenInfo) -> Note {
        Note {
            amount: self.amount,
            token_address: Some(self.token_address),
            token_symbol: token.symbol.clone(),
            token_decimals: token.decimals,
            owner_pubkey: self.owner_pubkey,
            blinding: self.blinding,
            leaf_index: None,
            created_at: chrono::Utc::now(),
        }
    }
}

/// Encrypt a note payload to a shielded address.
/// Wire layout: ephemeral pubkey (32) || nonce (24) || ciphertext.
pub fn encrypt_to(address: &ShieldedAddress, payload: &MemoPayload) -> Result<Vec<u8>, MemoError> {
    let ephemeral = SecretKey::generate(&mut OsRng);
    let sealer = SalsaBox::new(&address.encryption_pubkey, &ephemeral);
    let nonce = SalsaBox::generate_nonce(&mut OsRng);

    let mut plaintext = Vec::with_capacity(PLAINTEXT_LEN);
    plaintext.extend_from_slice(&MEMO_MAGIC);
    plaintext.extend_from_slice(&payload.amount.to_be_bytes::<32>());
    plaintext.extend_from_slice(payload.token_address.as_slice());
    plaintext.extend_from_slice(&fr_to_bytes(&payload.blinding));
    plaintext.extend_from_slice(&fr_to_bytes(&payload.owner_pubkey));

    let ciphertext = sealer
        .encrypt(&nonce, plaintext.as_slice())
        .map_err(|_| MemoError::Encrypt)?;

    let mut wire = Vec::with_capacity(MEMO_LEN);
    wire.extend_from_slice(ephemeral.public_key().as_bytes());
    wire.extend_from_slice(&nonce);
    wire.extend_from_slice(&ciphertext);
    Ok(wire)
}

/// Trial-decrypt a memo with this identity's viewing material.
/// Returns `None` for anything not addressed to the viewer: wrong size,
/// failed AEAD, missing magic, or a payload outside the field.
pub fn try_decrypt(identity: &Identity, wire: &[u8]) -> Option<MemoPayload> {
    if wire.len() != MEMO_LEN {
        return None;
    }
    let mut eph = [0u8; EPHEMERAL_LEN];
    eph.copy_from_slice(&wire[..EPHEMERAL_LEN]);
    let nonce_bytes = &wire[EPHEMERAL_LEN..EPHEMERAL_LEN + NONCE_LEN];
    let ciphertext = &wire[EPHEMERAL_LEN + NONCE_LEN..];

    let opener = SalsaBox::new(&PublicKey::from(eph), &identity.encryption_secret());
    let plaintext = opener
        .decrypt(crypto_box::Nonce::from_slice(nonce_bytes), ciphertext)
        .ok()?;
    if plaintext.len() != PLAINTEXT_LEN || plaintext[..4] != MEMO_MAGIC {
        return None;
    }

    let amount = U256::from_be_slice(&plaintext[4..36]);
    let token_address = Address::from_slice(&plaintext[36..56]);
    let mut blinding = [0u8; 32];
    blinding.copy_from_slice(&plaintext[56..88]);
    let mut owner = [0u8; 32];
    owner.copy_from_slice(&plaintext[88..120]);
    if !fr_bytes_canonical(&blinding) || !fr_bytes_canonical(&owner) {
        return None;
    }

    Some(MemoPayload {
        amount,
        token_address,
        blinding: fr_from_bytes(&blinding),
        owner_pubkey: fr_from_bytes(&owner),
    })
}
