//! Per-circuit witness assembly.
//!
//! Each builder gathers the public and private signals its Groth16 circuit
//! expects — serialized as the decimal-string input map the prover consumes
//! — together with the parameters the relayer (or the user's own wallet,
//! for shields) needs to construct the on-chain call. Builders are pure:
//! they read the tree and identity, they never mutate the store. State
//! commits happen in the engine after the relayer accepts and the receipt
//! confirms.

use alloy::primitives::{Address, U256};
use ark_bn254::Fr;
use rand::{CryptoRng, RngCore};
use serde_json::{json, Value};

use crate::error::MemoError;
use crate::field::{fr_from_address, nullify};
use crate::identity::{Identity, ShieldedAddress};
use crate::memo::{encrypt_to, MemoPayload};
use crate::merkle::MerklePath;
use crate::note::{Note, TokenInfo};
use crate::planner::SpendPlan;

/// How many progressively older roots a builder may fall back to before
/// surfacing `ProveError::StaleRoot`.
pub const MAX_ROOT_FALLBACKS: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Circuit {
    Shield,
    Transfer,
    Unshield,
    Swap,
}

impl Circuit {
    pub fn name(&self) -> &'static str {
        match self {
            Circuit::Shield => "shield",
            Circuit::Transfer => "transfer",
            Circuit::Unshield => "unshield",
            Circuit::Swap => "swap",
        }
    }
}

/// The prover-facing input map: circuit signal name → decimal string (or
/// array of decimal strings for Merkle paths).
#[derive(Clone, Debug)]
pub struct CircuitInputs {
    pub circuit: Circuit,
    signals: serde_json::Map<String, Value>,
}

impl CircuitInputs {
    fn new(circuit: Circuit) -> Self {
        CircuitInputs {
            circuit,
            signals: serde_json::Map::new(),
        }
    }

    fn put_fr(&mut self, name: &str, value: Fr) {
        self.signals.insert(name.into(), json!(value.to_string()));
    }

    fn put_u256(&mut self, name: &str, value: U256) {
        self.signals.insert(name.into(), json!(value.to_string()));
    }

    fn put_path(&mut self, path: &MerklePath) {
        let elements: Vec<String> = path.siblings.iter().map(|s| s.to_string()).collect();
        let indices: Vec<String> = path
            .path_bits
            .iter()
            .map(|b| if *b { "1".to_string() } else { "0".to_string() })
            .collect();
        self.signals.insert("pathElements".into(), json!(elements));
        self.signals.insert("pathIndices".into(), json!(indices));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.signals.get(name)
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.signals.clone()).to_string()
    }
}

// ---------------------------------------------------------------------------
// Shield
// ---------------------------------------------------------------------------

/// The wallet-submitted transaction for a shield.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxRequest {
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct ShieldWitness {
    pub note: Note,
    pub commitment: Fr,
    pub inputs: CircuitInputs,
}

// ---------------------------------------------------------------------------
// Transfer
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct TransferWitness {
    pub root: Fr,
    pub nullifier: Fr,
    /// Fixed ordering: (recipient, change), matching submission order.
    pub out_commitments: [Fr; 2],
    pub fee: U256,
    pub relayer: Address,
    pub memos: [Vec<u8>; 2],
    pub spent_commitment: Fr,
    pub recipient_note: Note,
    pub change_note: Note,
    pub inputs: CircuitInputs,
}

// ---------------------------------------------------------------------------
// Unshield
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct UnshieldWitness {
    pub root: Fr,
    pub nullifier: Fr,
    pub recipient: Address,
    pub token: Address,
    /// What the public recipient receives; the fee goes to the relayer.
    pub net_amount: U256,
    pub fee: U256,
    pub spent_commitment: Fr,
    /// `None` on a full withdrawal; the call then carries the zero word.
    pub change_note: Option<Note>,
    pub inputs: CircuitInputs,
}

impl UnshieldWitness {
    pub fn change_commitment(&self) -> Option<Fr> {
        self.change_note.as_ref().map(|n| n.commitment())
    }
}

// ---------------------------------------------------------------------------
// Swap
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct SwapWitness {
    pub root: Fr,
    pub nullifier: Fr,
    pub token_in: Address,
    pub token_out: Address,
    pub amount_in: U256,
    pub min_out: U256,
    /// (output in token_out, change in token_in) — both self-owned.
    pub out_commitments: [Fr; 2],
    pub spent_commitment: Fr,
    pub out_note: Note,
    pub change_note: Note,
    pub inputs: CircuitInputs,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles witnesses for one identity. Stateless apart from the borrow.
pub struct WitnessBuilder<'a> {
    identity: &'a Identity,
}

impl<'a> WitnessBuilder<'a> {
    pub fn new(identity: &'a Identity) -> Self {
        WitnessBuilder { identity }
    }

    /// Shield: no Merkle statement, just knowledge of the commitment
    /// opening. The deposit transaction itself is built by the adapters.
    pub fn shield<R: RngCore + CryptoRng>(
        &self,
        token: &TokenInfo,
        amount: U256,
        rng: &mut R,
    ) -> ShieldWitness {
        let note = Note::new(amount, token, self.identity.address_pubkey, rng);
        let commitment = note.commitment();

        let mut inputs = CircuitInputs::new(Circuit::Shield);
        inputs.put_fr("commitment", commitment);
        inputs.put_u256("depositAmount", amount);
        inputs.put_fr("tokenAddress", fr_from_address(token.address));
        inputs.put_fr("ownerPubkey", note.owner_pubkey);
        inputs.put_fr("blinding", note.blinding);

        ShieldWitness {
            note,
            commitment,
            inputs,
        }
    }

    /// Transfer: one input note, two outputs (recipient, self-change),
    /// both with encrypted memos. The change memo is addressed to the
    /// sender so a restore from chain data alone recovers it.
    #[allow(clippy::too_many_arguments)]
    pub fn transfer<R: RngCore + CryptoRng>(
        &self,
        plan: &SpendPlan,
        recipient: &ShieldedAddress,
        token: &TokenInfo,
        amount: U256,
        path: MerklePath,
        relayer: Address,
        rng: &mut R,
    ) -> Result<TransferWitness, MemoError> {
        let input = &plan.note;
        let leaf_index = path.leaf_index;
        let spent_commitment = input.commitment();
        let nullifier = nullify(spent_commitment, leaf_index, self.identity.spending_key());

        let recipient_note = Note::new(amount, token, recipient.address_pubkey, rng);
        let change_note = if plan.change.is_zero() {
            Note::zero_change(token, self.identity.address_pubkey, rng)
        } else {
            Note::new(plan.change, token, self.identity.address_pubkey, rng)
        };

        let self_address = self.identity.address();
        let memos = [
            encrypt_to(recipient, &MemoPayload::from_note(&recipient_note))?,
            encrypt_to(&self_address, &MemoPayload::from_note(&change_note))?,
        ];

        let out_commitments = [recipient_note.commitment(), change_note.commitment()];

        let mut inputs = CircuitInputs::new(Circuit::Transfer);
        inputs.put_fr("root", path.root);
        inputs.put_fr("nullifier", nullifier);
        inputs.put_fr("outCommitment1", out_commitments[0]);
        inputs.put_fr("outCommitment2", out_commitments[1]);
        inputs.put_u256("fee", plan.fee);
        inputs.put_fr("relayer", fr_from_address(relayer));
        inputs.put_u256("inAmount", input.amount);
        inputs.put_fr("inBlinding", input.blinding);
        inputs.put_fr("ownerPubkey", input.owner_pubkey);
        inputs.put_fr("spendingKey", self.identity.spending_key());
        inputs.put_fr("tokenAddress", fr_from_address(token.address));
        inputs.put_fr("leafIndex", Fr::from(leaf_index as u64));
        inputs.put_path(&path);
        inputs.put_u256("outAmount1", recipient_note.amount);
        inputs.put_fr("outBlinding1", recipient_note.blinding);
        inputs.put_fr("outOwner1", recipient_note.owner_pubkey);
        inputs.put_u256("outAmount2", change_note.amount);
        inputs.put_fr("outBlinding2", change_note.blinding);
        inputs.put_fr("outOwner2", change_note.owner_pubkey);

        Ok(TransferWitness {
            root: path.root,
            nullifier,
            out_commitments,
            fee: plan.fee,
            relayer,
            memos,
            spent_commitment,
            recipient_note,
            change_note,
            inputs,
        })
    }

    /// Unshield: one input note, a public recipient, optional self-change.
    pub fn unshield<R: RngCore + CryptoRng>(
        &self,
        plan: &SpendPlan,
        recipient: Address,
        token: &TokenInfo,
        amount: U256,
        path: MerklePath,
        rng: &mut R,
    ) -> UnshieldWitness {
        let input = &plan.note;
        let leaf_index = path.leaf_index;
        let spent_commitment = input.commitment();
        let nullifier = nullify(spent_commitment, leaf_index, self.identity.spending_key());

        let change_note = if plan.change.is_zero() {
            None
        } else {
            Some(Note::new(
                plan.change,
                token,
                self.identity.address_pubkey,
                rng,
            ))
        };
        let change_commitment = change_note
            .as_ref()
            .map(|n| n.commitment())
            .unwrap_or(Fr::from(0u64));

        let mut inputs = CircuitInputs::new(Circuit::Unshield);
        inputs.put_fr("root", path.root);
        inputs.put_fr("nullifier", nullifier);
        inputs.put_fr("recipient", fr_from_address(recipient));
        inputs.put_fr("tokenAddress", fr_from_address(token.address));
        inputs.put_u256("netAmount", amount);
        inputs.put_u256("fee", plan.fee);
        inputs.put_fr("changeCommitment", change_commitment);
        inputs.put_u256("inAmount", input.amount);
        inputs.put_fr("inBlinding", input.blinding);
        inputs.put_fr("ownerPubkey", input.owner_pubkey);
        inputs.put_fr("spendingKey", self.identity.spending_key());
        inputs.put_fr("leafIndex", Fr::from(leaf_index as u64));
        inputs.put_path(&path);
        if let Some(ref change) = change_note {
            inputs.put_u256("changeAmount", change.amount);
            inputs.put_fr("changeBlinding", change.blinding);
        } else {
            inputs.put_u256("changeAmount", U256::ZERO);
            inputs.put_fr("changeBlinding", Fr::from(0u64));
        }

        UnshieldWitness {
            root: path.root,
            nullifier,
            recipient,
            token: token.address,
            net_amount: amount,
            fee: plan.fee,
            spent_commitment,
            change_note,
            inputs,
        }
    }

    /// Swap inside the pool: burn a note of `token_in`, mint an output of
    /// `token_out` plus change in `token_in`. Both outputs stay with the
    /// swapper, so no memos ride this path.
    #[allow(clippy::too_many_arguments)]
    pub fn swap<R: RngCore + CryptoRng>(
        &self,
        plan: &SpendPlan,
        token_in: &TokenInfo,
        token_out: &TokenInfo,
        amount_in: U256,
        min_out: U256,
        path: MerklePath,
        rng: &mut R,
    ) -> SwapWitness {
        let input = &plan.note;
        let leaf_index = path.leaf_index;
        let spent_commitment = input.commitment();
        let nullifier = nullify(spent_commitment, leaf_index, self.identity.spending_key());

        // the out-amount is settled on-chain; min_out is what the circuit
        // pins, so the output note is created at min_out and topped up by
        // discovery if settlement beats it
        let out_note = Note::new(min_out, token_out, self.identity.address_pubkey, rng);
        let change_note = if plan.change.is_zero() {
            Note::zero_change(token_in, self.identity.address_pubkey, rng)
        } else {
            Note::new(plan.change, token_in, self.identity.address_pubkey, rng)
        };
        let out_commitments = [out_note.commitment(), change_note.commitment()];

        let mut inputs = CircuitInputs::new(Circuit::Swap);
        inputs.put_fr("root", path.root);
        inputs.put_fr("nullifier", nullifier);
        inputs.put_fr("tokenIn", fr_from_address(token_in.address));
        inputs.put_fr("tokenOut", fr_from_address(token_out.address));
        inputs.put_u256("amountIn", amount_in);
        inputs.put_u256("minOut", min_out);
        inputs.put_fr("outCommitment1", out_commitments[0]);
        inputs.put_fr("outCommitment2", out_commitments[1]);
        inputs.put_u256("inAmount", input.amount);
        inputs.put_fr("inBlinding", input.blinding);
        inputs.put_fr("ownerPubkey", input.owner_pubkey);
        inputs.put_fr("spendingKey", self.identity.spending_key());
        inputs.put_fr("leafIndex", Fr::from(leaf_index as u64));
        inputs.put_path(&path);
        inputs.put_u256("outAmount1", out_note.amount);
        inputs.put_fr("outBlinding1", out_note.blinding);
        inputs.put_u256("outAmount2", change_note.amount);
        inputs.put_fr("outBlinding2", change_note.blinding);

        SwapWitness {
            root: path.root,
            nullifier,
            token_in: token_in.address,
            token_out: token_out.address,
            amount_in,
            min_out,
            out_commitments,
            spent_commitment,
            out_note,
            change_note,
            inputs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::commit;
    use crate::memo::try_decrypt;
    use crate::merkle::PoolTree;
    use crate::planner::{plan_spend, Plan, RelayerQuote};
    use rand::rngs::OsRng;

    fn units(x: &str) -> U256 {
        crate::note::parse_amount(x, 18).unwrap()
    }

    struct Fixture {
        identity: Identity,
        tree: PoolTree,
        note: Note,
    }

    fn fixture(amount: &str) -> Fixture {
        let identity = Identity::from_signature(&[0x61u8; 65]).unwrap();
        let mut note = Note::new(
            units(amount),
            &TokenInfo::native(),
            identity.address_pubkey,
            &mut OsRng,
        );
        let mut tree = PoolTree::new();
        let (idx, _) = tree.insert(note.commitment()).unwrap();
        note.leaf_index = Some(idx);
        Fixture {
            identity,
            tree,
            note,
        }
    }

    fn single_plan(fx: &Fixture, amount: &str, quote: &RelayerQuote) -> SpendPlan {
        match plan_spend(&[fx.note.clone()], units(amount), quote).unwrap() {
            Plan::Single(plan) => plan,
            other => panic!("expected single plan, got {other:?}"),
        }
    }

    fn quote() -> RelayerQuote {
        RelayerQuote {
            fee_ppm: 3000,
            min_fee: units("0.01"),
            relayer: "0x4444444444444444444444444444444444444444".parse().unwrap(),
        }
    }

    #[test]
    fn transfer_witness_is_consistent() {
        let fx = fixture("100");
        let q = quote();
        let plan = single_plan(&fx, "30", &q);
        let recipient = Identity::from_signature(&[0x62u8; 65]).unwrap();
        let path = fx.tree.path(0).unwrap();
        let builder = WitnessBuilder::new(&fx.identity);

        let w = builder
            .transfer(
                &plan,
                &recipient.address(),
                &TokenInfo::native(),
                units("30"),
                path,
                q.relayer,
                &mut OsRng,
            )
            .unwrap();

        assert_eq!(w.fee, units("0.09"));
        assert_eq!(w.recipient_note.amount, units("30"));
        assert_eq!(w.change_note.amount, units("69.91"));
        assert_eq!(w.out_commitments[0], w.recipient_note.commitment());
        assert_eq!(w.out_commitments[1], w.change_note.commitment());
        assert_eq!(
            w.nullifier,
            nullify(fx.note.commitment(), 0, fx.identity.spending_key())
        );

        // recipient can open memo 1, sender can open memo 2
        let opened = try_decrypt(&recipient, &w.memos[0]).unwrap();
        assert_eq!(opened.amount, units("30"));
        assert_eq!(opened.commitment(), w.out_commitments[0]);
        let change = try_decrypt(&fx.identity, &w.memos[1]).unwrap();
        assert_eq!(change.commitment(), w.out_commitments[1]);

        // signal map carries the path and the public signals
        assert!(w.inputs.get("pathElements").is_some());
        assert_eq!(
            w.inputs.get("root").unwrap().as_str().unwrap(),
            w.root.to_string()
        );
    }

    #[test]
    fn transfer_zero_change_uses_the_zero_note() {
        let fx = fixture("10");
        let q = RelayerQuote {
            fee_ppm: 0,
            min_fee: units("0.1"),
            relayer: Address::ZERO,
        };
        let plan = single_plan(&fx, "9.9", &q);
        assert!(plan.change.is_zero());
        let recipient = Identity::from_signature(&[0x63u8; 65]).unwrap();
        let path = fx.tree.path(0).unwrap();
        let w = WitnessBuilder::new(&fx.identity)
            .transfer(
                &plan,
                &recipient.address(),
                &TokenInfo::native(),
                units("9.9"),
                path,
                Address::ZERO,
                &mut OsRng,
            )
            .unwrap();
        assert_eq!(w.change_note.amount, U256::ZERO);
        assert!(!w.change_note.is_spendable());
        // still a real commitment, still submitted
        assert_ne!(w.out_commitments[1], Fr::from(0u64));
    }

    #[test]
    fn unshield_witness_full_and_partial() {
        let fx = fixture("10");
        let q = RelayerQuote {
            fee_ppm: 0,
            min_fee: units("0.1"),
            relayer: Address::ZERO,
        };
        let recipient: Address = "0xAB00000000000000000000000000000000000001".parse().unwrap();
        let builder = WitnessBuilder::new(&fx.identity);

        // full: request max sendable, no change
        let plan = single_plan(&fx, "9.9", &q);
        let w = builder.unshield(
            &plan,
            recipient,
            &TokenInfo::native(),
            units("9.9"),
            fx.tree.path(0).unwrap(),
            &mut OsRng,
        );
        assert_eq!(w.net_amount, units("9.9"));
        assert_eq!(w.fee, units("0.1"));
        assert!(w.change_note.is_none());
        assert_eq!(w.change_commitment(), None);

        // partial: change note credited back to the sender
        let plan = single_plan(&fx, "4", &q);
        let w = builder.unshield(
            &plan,
            recipient,
            &TokenInfo::native(),
            units("4"),
            fx.tree.path(0).unwrap(),
            &mut OsRng,
        );
        let change = w.change_note.as_ref().unwrap();
        assert_eq!(change.amount, units("5.9"));
        assert_eq!(change.owner_pubkey, fx.identity.address_pubkey);
        assert_eq!(w.change_commitment().unwrap(), change.commitment());
    }

    #[test]
    fn swap_witness_orders_outputs_out_then_change() {
        let fx = fixture("50");
        let q = quote();
        let plan = single_plan(&fx, "20", &q);
        let usdc = TokenInfo {
            address: "0x5555555555555555555555555555555555555555".parse().unwrap(),
            symbol: "USDC".into(),
            decimals: 18,
        };
        let w = WitnessBuilder::new(&fx.identity).swap(
            &plan,
            &TokenInfo::native(),
            &usdc,
            units("20"),
            units("19.5"),
            fx.tree.path(0).unwrap(),
            &mut OsRng,
        );
        assert_eq!(w.out_note.token_address, Some(usdc.address));
        assert_eq!(w.change_note.token_address, Some(Address::ZERO));
        assert_eq!(w.out_commitments[0], w.out_note.commitment());
        assert_eq!(w.out_commitments[1], w.change_note.commitment());
        // both outputs are self-owned
        assert_eq!(w.out_note.owner_pubkey, fx.identity.address_pubkey);
        assert_eq!(w.change_note.owner_pubkey, fx.identity.address_pubkey);
    }

    #[test]
    fn shield_witness_commitment_opens_correctly() {
        let identity = Identity::from_signature(&[0x64u8; 65]).unwrap();
        let w = WitnessBuilder::new(&identity).shield(&TokenInfo::native(), units("10"), &mut OsRng);
        assert_eq!(
            w.commitment,
            commit(
                identity.address_pubkey,
                units("10"),
                Address::ZERO,
                w.note.blinding
            )
        );
        assert_eq!(w.note.leaf_index, None);
        assert_eq!(w.inputs.circuit, Circuit::Shield);
        let parsed: serde_json::Value = serde_json::from_str(&w.inputs.to_json()).unwrap();
        assert_eq!(
            parsed.get("commitment").unwrap().as_str().unwrap(),
            w.commitment.to_string()
        );
    }
}
