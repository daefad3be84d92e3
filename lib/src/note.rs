//! The shielded UTXO and its serializations.

use alloy::primitives::{Address, U256};
use ark_bn254::Fr;
use ark_std::UniformRand;
use chrono::{DateTime, Utc};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::error::NoteError;
use crate::field::{commit, fr_bytes_canonical, fr_from_bytes, fr_hex, fr_to_bytes, keccak256};

/// Magic prefix of the shareable note string.
pub const NOTE_PREFIX: &str = "zdoge-note-v1-";

const NOTE_WIRE_VERSION: u8 = 1;

/// Display metadata for a pool token. The zero address is the chain's
/// native coin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub address: Address,
    pub symbol: String,
    pub decimals: u8,
}

impl TokenInfo {
    pub fn native() -> Self {
        TokenInfo {
            address: Address::ZERO,
            symbol: "DOGE".to_string(),
            decimals: 18,
        }
    }

    pub fn is_native(&self) -> bool {
        self.address == Address::ZERO
    }
}

fn legacy_symbol() -> String {
    // records predating address tagging are DOGE by definition
    "DOGE".to_string()
}

fn default_decimals() -> u8 {
    18
}

fn default_created_at() -> DateTime<Utc> {
    Utc::now()
}

/// A shielded note. The secret fields are `blinding` and (implicitly) the
/// spending key behind `owner_pubkey`; everything else is recoverable from
/// chain state plus the memo.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    /// Token base units. Must stay below the field modulus.
    pub amount: U256,
    /// `None` only on legacy persisted records, treated as native DOGE.
    #[serde(default)]
    pub token_address: Option<Address>,
    #[serde(default = "legacy_symbol")]
    pub token_symbol: String,
    #[serde(default = "default_decimals")]
    pub token_decimals: u8,
    #[serde(with = "fr_hex")]
    pub owner_pubkey: Fr,
    #[serde(with = "fr_hex")]
    pub blinding: Fr,
    /// Set once the commitment is inserted on-chain; immutable afterwards.
    #[serde(default)]
    pub leaf_index: Option<u32>,
    #[serde(default = "default_created_at")]
    pub created_at: DateTime<Utc>,
}

impl Note {
    /// Create a fresh note with a random blinding factor.
    pub fn new<R: RngCore + CryptoRng>(
        amount: U256,
        token: &TokenInfo,
        owner_pubkey: Fr,
        rng: &mut R,
    ) -> Self {
        Note {
            amount,
            token_address: Some(token.address),
            token_symbol: token.symbol.clone(),
            token_decimals: token.decimals,
            owner_pubkey,
            blinding: Fr::rand(rng),
            leaf_index: None,
            created_at: Utc::now(),
        }
    }

    /// The conventional zero note used when a transfer or swap has no
    /// change: amount zero, fresh blinding, owned by the sender. Inserted
    /// on-chain like any output but never spendable.
    pub fn zero_change<R: RngCore + CryptoRng>(
        token: &TokenInfo,
        owner_pubkey: Fr,
        rng: &mut R,
    ) -> Self {
        Note::new(U256::ZERO, token, owner_pubkey, rng)
    }

    /// Effective token address, folding legacy records into native.
    pub fn token_address_or_native(&self) -> Address {
        self.token_address.unwrap_or(Address::ZERO)
    }

    pub fn commitment(&self) -> Fr {
        commit(
            self.owner_pubkey,
            self.amount,
            self.token_address_or_native(),
            self.blinding,
        )
    }

    /// Spendable iff confirmed on-chain and carrying value.
    pub fn is_spendable(&self) -> bool {
        self.leaf_index.is_some() && self.amount > U256::ZERO
    }

    /// Token identity match: by address when the record carries one,
    /// otherwise by symbol (legacy records default to DOGE).
    pub fn matches_token(&self, token: &TokenInfo) -> bool {
        match self.token_address {
            Some(addr) => addr == token.address,
            None => self.token_symbol == token.symbol,
        }
    }

    // -- shareable string -------------------------------------------------

    /// Encode as `zdoge-note-v1-<base58 payload>`: version byte, then each
    /// field length-prefixed, then a 4-byte keccak checksum.
    pub fn to_shareable_string(&self) -> String {
        let mut payload = vec![NOTE_WIRE_VERSION];
        push_field(&mut payload, &self.amount.to_be_bytes::<32>());
        push_field(&mut payload, self.token_address_or_native().as_slice());
        push_field(&mut payload, &fr_to_bytes(&self.blinding));
        push_field(&mut payload, &fr_to_bytes(&self.owner_pubkey));
        let check = keccak256(&payload);
        payload.extend_from_slice(&check[..4]);
        format!("{NOTE_PREFIX}{}", bs58::encode(payload).into_string())
    }

    /// Decode a shareable string. Display metadata is not on the wire; the
    /// caller resolves symbol/decimals from its token registry.
    pub fn from_shareable_string(s: &str) -> Result<Note, NoteError> {
        let encoded = s.strip_prefix(NOTE_PREFIX).ok_or(NoteError::BadPrefix)?;
        let payload = bs58::decode(encoded)
            .into_vec()
            .map_err(|_| NoteError::BadEncoding)?;
        if payload.len() < 5 {
            return Err(NoteError::Truncated);
        }
        let (body, check) = payload.split_at(payload.len() - 4);
        if keccak256(body)[..4] != check[..] {
            return Err(NoteError::BadChecksum);
        }
        let version = body[0];
        if version != NOTE_WIRE_VERSION {
            return Err(NoteError::UnsupportedVersion(version));
        }
        let mut cursor = &body[1..];
        let amount_bytes = take_field(&mut cursor, 32)?;
        let token_bytes = take_field(&mut cursor, 20)?;
        let blinding_bytes = take_field(&mut cursor, 32)?;
        let owner_bytes = take_field(&mut cursor, 32)?;
        if !cursor.is_empty() {
            return Err(NoteError::Truncated);
        }

        let mut b32 = [0u8; 32];
        b32.copy_from_slice(blinding_bytes);
        let mut o32 = [0u8; 32];
        o32.copy_from_slice(owner_bytes);
        if !fr_bytes_canonical(&b32) || !fr_bytes_canonical(&o32) {
            return Err(NoteError::BadEncoding);
        }

        let token_address = Address::from_slice(token_bytes);
        let native = token_address == Address::ZERO;
        Ok(Note {
            amount: U256::from_be_slice(amount_bytes),
            token_address: Some(token_address),
            token_symbol: if native { "DOGE".into() } else { "ERC20".into() },
            token_decimals: 18,
            owner_pubkey: fr_from_bytes(owner_bytes),
            blinding: fr_from_bytes(blinding_bytes),
            leaf_index: None,
            created_at: Utc::now(),
        })
    }
}

fn push_field(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
}

fn take_field<'a>(cursor: &mut &'a [u8], expected: usize) -> Result<&'a [u8], NoteError> {
    if cursor.is_empty() {
        return Err(NoteError::Truncated);
    }
    let len = cursor[0] as usize;
    if len != expected || cursor.len() < 1 + len {
        return Err(NoteError::Truncated);
    }
    let (field, rest) = cursor[1..].split_at(len);
    *cursor = rest;
    Ok(field)
}

// ---------------------------------------------------------------------------
// Decimal amount strings, integer arithmetic only
// ---------------------------------------------------------------------------

/// Parse a decimal token amount like "0.7" into base units.
pub fn parse_amount(s: &str, decimals: u8) -> Result<U256, NoteError> {
    let s = s.trim();
    if s.is_empty() || s == "." {
        return Err(NoteError::BadAmount(s.to_string()));
    }
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if frac.len() > decimals as usize {
        return Err(NoteError::BadAmount(format!(
            "{s}: more than {decimals} decimal places"
        )));
    }
    let parse_digits = |d: &str| -> Result<U256, NoteError> {
        if d.is_empty() {
            return Ok(U256::ZERO);
        }
        if !d.bytes().all(|b| b.is_ascii_digit()) {
            return Err(NoteError::BadAmount(s.to_string()));
        }
        d.parse::<U256>()
            .map_err(|_| NoteError::BadAmount(s.to_string()))
    };
    let scale = U256::from(10u64).pow(U256::from(decimals as u64));
    let frac_scale = U256::from(10u64).pow(U256::from((decimals as usize - frac.len()) as u64));
    let frac_value = parse_digits(frac)?;
    let value = parse_digits(whole)?
        .checked_mul(scale)
        .and_then(|w| w.checked_add(frac_value * frac_scale))
        .ok_or_else(|| NoteError::BadAmount(format!("{s}: overflow")))?;
    Ok(value)
}

/// Format base units as a decimal string, trimming trailing zeros.
pub fn format_amount(v: U256, decimals: u8) -> String {
    let scale = U256::from(10u64).pow(U256::from(decimals as u64));
    let whole = v / scale;
    let frac = v % scale;
    if frac.is_zero() {
        return whole.to_string();
    }
    let frac = format!("{:0>width$}", frac.to_string(), width = decimals as usize);
    format!("{whole}.{}", frac.trim_end_matches('0'))
}
