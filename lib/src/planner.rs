//! Note selection and fee arithmetic.
//!
//! One note per transaction is a circuit constraint, so planning is mostly
//! about which single note to burn: the smallest one that still covers the
//! requested amount plus the relayer fee. When no such note exists but the
//! combined balance would cover the request, the planner hands back an
//! ordered consolidation sequence instead and lets the host execute it.
//!
//! All arithmetic is U256; the fee rate arrives as integer parts-per-million.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::error::PlanError;
use crate::note::Note;

pub const PPM_SCALE: u64 = 1_000_000;

/// An advisory fee quote. The fee embedded in a proof must match what the
/// relayer will submit, so quotes are refreshed before each plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayerQuote {
    /// Proportional fee in parts-per-million of the sent amount.
    pub fee_ppm: u64,
    /// Floor fee in token base units.
    pub min_fee: U256,
    pub relayer: Address,
}

impl RelayerQuote {
    /// fee(x) = max(min_fee, x * fee_ppm / 10^6), integer domain.
    pub fn fee(&self, amount: U256) -> U256 {
        let proportional = amount * U256::from(self.fee_ppm) / U256::from(PPM_SCALE);
        if proportional > self.min_fee {
            proportional
        } else {
            self.min_fee
        }
    }
}

/// A single-note spend: the chosen input, the fee on the requested amount,
/// and the change that returns to the sender.
#[derive(Clone, Debug)]
pub struct SpendPlan {
    pub note: Note,
    pub fee: U256,
    pub change: U256,
}

/// An ordered sequence of full single-note unshields.
#[derive(Clone, Debug)]
pub struct ConsolidatePlan {
    /// Eligible notes in leaf-index order; each is withdrawn in full.
    pub notes: Vec<Note>,
    /// Per-note fee, aligned with `notes`.
    pub fees: Vec<U256>,
    /// Σ (amount − fee(amount)) over the sequence.
    pub net_total: U256,
}

#[derive(Clone, Debug)]
pub enum Plan {
    Single(SpendPlan),
    Consolidate(ConsolidatePlan),
}

/// Pick the note (or sequence) covering `amount` net of fees.
///
/// `notes` is the spendable set for one token; anything unconfirmed or
/// zero-valued must already be filtered out by the store.
pub fn plan_spend(notes: &[Note], amount: U256, quote: &RelayerQuote) -> Result<Plan, PlanError> {
    if amount.is_zero() {
        return Err(PlanError::AmountBelowMinimum);
    }

    let needed = amount + quote.fee(amount);
    let mut by_amount: Vec<&Note> = notes.iter().collect();
    by_amount.sort_by_key(|n| n.amount);

    if let Some(note) = by_amount.iter().find(|n| n.amount >= needed) {
        return Ok(Plan::Single(SpendPlan {
            note: (*note).clone(),
            fee: quote.fee(amount),
            change: note.amount - needed,
        }));
    }

    // No single note covers it. See whether draining everything would.
    let consolidation = consolidation_of(notes, quote);
    if !consolidation.notes.is_empty() && consolidation.net_total >= amount {
        return Ok(Plan::Consolidate(consolidation));
    }

    let gross: U256 = notes.iter().fold(U256::ZERO, |acc, n| acc + n.amount);
    if consolidation.notes.is_empty() && !notes.is_empty() && gross >= amount {
        return Err(PlanError::NoteDustOnly);
    }
    Err(PlanError::InsufficientBalance {
        requested: amount.to_string(),
        available: consolidation.net_total.to_string(),
    })
}

/// The consolidation sequence for a token: every non-dust spendable note,
/// in leaf-index order. Dust (amount ≤ min_fee) cannot pay its own floor
/// fee and is left behind.
pub fn consolidation_of(notes: &[Note], quote: &RelayerQuote) -> ConsolidatePlan {
    let mut eligible: Vec<&Note> = notes
        .iter()
        .filter(|n| n.amount > quote.min_fee)
        .collect();
    eligible.sort_by_key(|n| n.leaf_index);

    let fees: Vec<U256> = eligible.iter().map(|n| quote.fee(n.amount)).collect();
    let net_total = eligible
        .iter()
        .zip(&fees)
        .fold(U256::ZERO, |acc, (n, fee)| acc + (n.amount - *fee));
    ConsolidatePlan {
        notes: eligible.into_iter().cloned().collect(),
        fees,
        net_total,
    }
}

/// Largest net amount a single transaction can move for this token.
pub fn max_sendable(notes: &[Note], quote: &RelayerQuote) -> U256 {
    notes
        .iter()
        .map(|n| n.amount)
        .max()
        .map(|largest| largest.saturating_sub(quote.fee(largest)))
        .unwrap_or(U256::ZERO)
}

/// Net total achievable by consolidating, for the host's UX.
pub fn max_cumulative(notes: &[Note], quote: &RelayerQuote) -> U256 {
    consolidation_of(notes, quote).net_total
}
