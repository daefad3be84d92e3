//! Off-chain privacy engine for the zdoge multi-token shielded pool.
//!
//! Users deposit public tokens to mint notes (hidden UTXOs), spend them
//! privately inside the pool, and rediscover incoming notes by scanning
//! chain events. This crate is everything a front-end needs to do that
//! correctly: identity derivation, the commitment/nullifier algebra, the
//! local Merkle mirror, the note store, memo encryption, spend planning,
//! witness assembly for the four Groth16 circuits, the discovery loop,
//! and the thin adapters around the chain, the relayer, and the wallet.
//!
//! The proving system, the pool contract, and the relayer server are
//! external collaborators; the engine only speaks their interfaces.

pub mod chain;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod field;
pub mod identity;
pub mod memo;
pub mod merkle;
pub mod note;
pub mod planner;
pub mod prover;
pub mod relayer;
pub mod store;
pub mod vault;
pub mod wallet;
pub mod witness;

pub use ark_bn254::Fr;

pub use chain::{
    ChainClient, LeafInsertion, PoolClient, ShieldEvent, SwapEvent, TransferEvent, UnshieldEvent,
};
pub use discovery::{DiscoveryConfig, DiscoveryHandle, Notifier, WalletEvent};
pub use engine::{
    EngineConfig, ShieldRequest, SwapOutcome, TransferOutcome, UnshieldOutcome, WalletEngine,
};
pub use error::{EngineError, ErrorKind};
pub use identity::{identity_message, Identity, ShieldedAddress};
pub use memo::{encrypt_to, try_decrypt, MemoPayload};
pub use merkle::{verify_path, MerklePath, PoolTree, ROOT_HISTORY_SIZE, TREE_DEPTH};
pub use note::{format_amount, parse_amount, Note, TokenInfo};
pub use planner::{max_cumulative, max_sendable, plan_spend, Plan, RelayerQuote, SpendPlan};
pub use prover::{HttpProver, Prover};
pub use relayer::{Relay, RelayerClient, SwapReceipt, TransferReceipt, UnshieldReceipt};
pub use store::{NoteStore, Persistence, StoreSnapshot};
pub use vault::{export_backup, import_backup, Vault};
pub use wallet::{LocalWallet, WalletConnector};
pub use witness::{Circuit, CircuitInputs, TxRequest, WitnessBuilder};
