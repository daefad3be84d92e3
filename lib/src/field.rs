//! BN254 scalar arithmetic and the MiMC-sponge hash.
//!
//! Everything that ends up inside a proof is an `Fr` — commitments,
//! nullifiers, Merkle nodes, keys. The MiMC variant here is the 220-round
//! Feistel sponge with exponent 5 whose round constants are derived from an
//! iterated keccak256 chain seeded with `"mimcsponge"`. This must stay
//! byte-identical to the hasher the deployed circuits and the on-chain
//! contract use; the test vectors at the bottom freeze it.

use std::sync::OnceLock;

use alloy::primitives::{Address, U256};
use ark_bn254::Fr;
use ark_ff::{AdditiveGroup, BigInteger, Field, PrimeField};
use tiny_keccak::{Hasher, Keccak};

/// Number of Feistel rounds in the sponge permutation.
const MIMC_ROUNDS: usize = 220;

/// Seed of the round-constant keccak chain.
const MIMC_SEED: &[u8] = b"mimcsponge";

/// Compute keccak256. Matches Solidity's keccak256() opcode.
/// Note: tiny_keccak::Keccak is the original Keccak-256 (NOT SHA3-256).
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Interpret big-endian bytes as a field element, reduced mod p.
pub fn fr_from_bytes(bytes: &[u8]) -> Fr {
    Fr::from_be_bytes_mod_order(bytes)
}

/// Canonical big-endian 32-byte serialization of a field element.
pub fn fr_to_bytes(x: &Fr) -> [u8; 32] {
    let raw = x.into_bigint().to_bytes_be();
    let mut out = [0u8; 32];
    out[32 - raw.len()..].copy_from_slice(&raw);
    out
}

/// Reduce a uint256 amount into the field.
pub fn fr_from_u256(v: U256) -> Fr {
    fr_from_bytes(&v.to_be_bytes::<32>())
}

/// Embed a 20-byte address into the field (zero-extended on the left).
pub fn fr_from_address(a: Address) -> Fr {
    fr_from_bytes(a.as_slice())
}

pub fn fr_to_u256(x: &Fr) -> U256 {
    U256::from_be_bytes(fr_to_bytes(x))
}

/// True iff `bytes` is the canonical encoding of a field element,
/// i.e. strictly below the BN254 scalar modulus.
pub fn fr_bytes_canonical(bytes: &[u8; 32]) -> bool {
    let modulus = Fr::MODULUS.to_bytes_be();
    bytes[..] < modulus[..]
}

/// Serde helpers for `Fr` as 0x-prefixed big-endian hex.
pub mod fr_hex {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    use super::{fr_bytes_canonical, fr_from_bytes, fr_to_bytes, Fr};

    pub fn serialize<S: Serializer>(x: &Fr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{}", hex::encode(fr_to_bytes(x))))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Fr, D::Error> {
        let s = String::deserialize(d)?;
        let raw = hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(D::Error::custom)?;
        if raw.len() != 32 {
            return Err(D::Error::custom("expected 32 bytes"));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&raw);
        if !fr_bytes_canonical(&bytes) {
            return Err(D::Error::custom("value not in field"));
        }
        Ok(fr_from_bytes(&bytes))
    }
}

/// An `Fr` that serializes as 0x-hex. For snapshot fields where
/// `#[serde(with = "fr_hex")]` does not reach (options, collections).
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FrHex(#[serde(with = "fr_hex")] pub Fr);

impl From<Fr> for FrHex {
    fn from(x: Fr) -> Self {
        FrHex(x)
    }
}

// ---------------------------------------------------------------------------
// MiMC sponge
// ---------------------------------------------------------------------------

/// Round constants: cts[0] = cts[219] = 0, the rest are the keccak chain
/// over the seed, each reduced into the field.
fn round_constants() -> &'static [Fr; MIMC_ROUNDS] {
    static CTS: OnceLock<[Fr; MIMC_ROUNDS]> = OnceLock::new();
    CTS.get_or_init(|| {
        let mut cts = [Fr::ZERO; MIMC_ROUNDS];
        let mut c = keccak256(MIMC_SEED);
        for ct in cts.iter_mut().take(MIMC_ROUNDS - 1).skip(1) {
            c = keccak256(&c);
            *ct = fr_from_bytes(&c);
        }
        cts
    })
}

/// One Feistel permutation: 220 rounds of x -> x^5, no swap on the last.
fn feistel(mut xl: Fr, mut xr: Fr, k: Fr) -> (Fr, Fr) {
    let cts = round_constants();
    for (i, c) in cts.iter().enumerate() {
        let t = xl + k + c;
        let t2 = t.square();
        let t5 = t2.square() * t;
        if i < MIMC_ROUNDS - 1 {
            let next_l = xr + t5;
            xr = xl;
            xl = next_l;
        } else {
            xr += t5;
        }
    }
    (xl, xr)
}

/// MiMC sponge over any number of inputs with an explicit key.
/// The key is how the commitment / nullifier / identity domains are kept
/// apart from plain Merkle hashing (key 0).
pub fn mimc_sponge(inputs: &[Fr], key: Fr) -> Fr {
    let mut left = Fr::ZERO;
    let mut right = Fr::ZERO;
    for x in inputs {
        left += x;
        let (l, r) = feistel(left, right, key);
        left = l;
        right = r;
    }
    left
}

/// Two-input hash used for Merkle tree nodes.
pub fn mimc2(a: Fr, b: Fr) -> Fr {
    mimc_sponge(&[a, b], Fr::ZERO)
}

/// k-input hash with the neutral key.
pub fn mimck(inputs: &[Fr]) -> Fr {
    mimc_sponge(inputs, Fr::ZERO)
}

// ---------------------------------------------------------------------------
// Domain tags
// ---------------------------------------------------------------------------

pub(crate) struct DomainTags {
    pub commitment: Fr,
    pub nullifier: Fr,
    pub spending: Fr,
    pub viewing: Fr,
    pub address: Fr,
}

fn tag(label: &[u8]) -> Fr {
    fr_from_bytes(&keccak256(label))
}

pub(crate) fn tags() -> &'static DomainTags {
    static TAGS: OnceLock<DomainTags> = OnceLock::new();
    TAGS.get_or_init(|| DomainTags {
        commitment: tag(b"zdoge/commitment/v1"),
        nullifier: tag(b"zdoge/nullifier/v1"),
        spending: tag(b"zdoge/spending-key/v1"),
        viewing: tag(b"zdoge/viewing-key/v1"),
        address: tag(b"zdoge/address/v1"),
    })
}

/// Note commitment: sponge over (owner, amount, token, blinding) keyed with
/// the commitment domain tag. The input order is fixed by the circuits.
pub fn commit(owner_pubkey: Fr, amount: U256, token: Address, blinding: Fr) -> Fr {
    mimc_sponge(
        &[owner_pubkey, fr_from_u256(amount), fr_from_address(token), blinding],
        tags().commitment,
    )
}

/// Nullifier for spending leaf `leaf_index` holding `commitment`.
/// Distinct leaf indices of one commitment nullify independently.
pub fn nullify(commitment: Fr, leaf_index: u32, spending_key: Fr) -> Fr {
    mimc_sponge(
        &[commitment, Fr::from(leaf_index as u64), spending_key],
        tags().nullifier,
    )
}
