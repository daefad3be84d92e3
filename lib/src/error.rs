//! Error taxonomy for the engine.
//!
//! Transient failures (relayer 5xx, RPC hiccups) are retried inside the
//! component that saw them; everything surfaced out of `WalletEngine` is
//! permanent from the caller's point of view and tagged with the operation
//! it belongs to. Funds are safe across every variant: nothing leaves the
//! pool without a proof the contract accepted.

use ark_bn254::Fr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    /// The wallet signature was shorter than 32 bytes.
    #[error("signature too short to derive an identity")]
    BadSignature,
}

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("shielded address must start with `zdoge:`")]
    BadPrefix,
    #[error("shielded address payload is not valid base58")]
    BadEncoding,
    #[error("shielded address payload has the wrong length")]
    BadLength,
    #[error("shielded address checksum mismatch")]
    BadChecksum,
    #[error("unsupported shielded address version {0}")]
    UnsupportedVersion(u8),
    #[error("shielded address pubkey is not a field element")]
    NotInField,
}

#[derive(Debug, Error)]
pub enum NoteError {
    #[error("shareable note must start with `zdoge-note-v1-`")]
    BadPrefix,
    #[error("shareable note payload is not valid base58")]
    BadEncoding,
    #[error("unsupported note format version {0}")]
    UnsupportedVersion(u8),
    #[error("shareable note payload truncated")]
    Truncated,
    #[error("shareable note checksum mismatch")]
    BadChecksum,
    #[error("invalid amount: {0}")]
    BadAmount(String),
}

#[derive(Debug, Error)]
pub enum MerkleError {
    #[error("merkle tree is full")]
    Full,
    #[error("leaf {0} was never inserted locally")]
    Unknown(u32),
    #[error("root {0} is outside the known-roots window")]
    UnknownRoot(Fr),
    #[error("local tree desynced from chain: local root {local}, chain root {chain}")]
    Desync { local: Fr, chain: Fr },
    #[error("leaf stream gap: expected index {expected}, got {got}")]
    Gap { expected: u32, got: u32 },
    #[error("replayed leaf {index} disagrees with the local commitment")]
    LeafMismatch { index: u32 },
}

/// Failures of the persistence capability backing the note store.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] serde_json::Error),
    #[error("vault cipher failure: {0}")]
    Crypto(String),
    #[error("unsupported vault version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The mutation was rolled back; in-memory state matches the last save.
    #[error("persistence failed, mutation rolled back: {0}")]
    Persistence(#[from] PersistError),
    #[error("unknown note")]
    UnknownNote,
    #[error("note invariant violated: {0}")]
    InvariantViolation(String),
}

#[derive(Debug, Error)]
pub enum MemoError {
    #[error("memo encryption failed")]
    Encrypt,
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("no spendable note covers {requested} plus fees (available {available})")]
    InsufficientBalance { requested: String, available: String },
    #[error("requested amount must be positive")]
    AmountBelowMinimum,
    #[error("all notes are dust: none can pay its own minimum fee")]
    NoteDustOnly,
}

#[derive(Debug, Error)]
pub enum ProveError {
    /// Every root in the fallback window was rejected by the relayer.
    #[error("proof rejected on all recent roots; resync required")]
    StaleRoot,
    #[error("prover failed: {0}")]
    Prover(String),
}

#[derive(Debug, Error)]
pub enum RelayerError {
    #[error("relayer is not accepting transactions")]
    Unavailable,
    /// 4xx from the relayer: the request itself is wrong, do not retry.
    #[error("relayer rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// The submitted root fell out of the pool's history.
    #[error("relayer does not know the submitted root")]
    RootNotFound,
    /// The input note's nullifier is already on-chain.
    #[error("nullifier already spent")]
    AlreadySpent,
    /// 5xx or transport failure, still failing after the retry budget.
    #[error("relayer unreachable after retries: {0}")]
    Transport(String),
    #[error("relayer returned a malformed response: {0}")]
    BadResponse(String),
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("transaction {0} was dropped or reverted")]
    TxFailed(String),
}

/// Engine-level error: the taxonomy the host maps to its own UX.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Note(#[from] NoteError),
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Memo(#[from] MemoError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Prove(#[from] ProveError),
    #[error(transparent)]
    Relayer(#[from] RelayerError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Persist(#[from] PersistError),

    /// No single note covers the request but a consolidation sequence would.
    #[error("no single note covers the request; consolidate {notes} notes (net {net_total})")]
    NeedsConsolidation { notes: usize, net_total: String },

    /// A cryptographic invariant failed; the engine is read-only until resync.
    #[error("cryptographic invariant failure: {0}; engine is read-only until resync")]
    Invariant(String),

    /// Mutating call while poisoned.
    #[error("engine is in read-only mode: {reason}")]
    ReadOnly { reason: String },

    #[error("invalid recipient: {0}")]
    BadRecipient(String),

    /// Tag wrapper naming the operation an inner error belongs to.
    #[error("{op} failed: {source}")]
    Operation {
        op: &'static str,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Attach the name of the operation this error surfaced from.
    pub fn in_op(self, op: &'static str) -> Self {
        match self {
            EngineError::Operation { .. } => self,
            other => EngineError::Operation {
                op,
                source: Box::new(other),
            },
        }
    }

    /// Shielded funds are never at risk from a client-side failure: spending
    /// requires a proof the pool contract has accepted.
    pub fn funds_safe(&self) -> bool {
        true
    }

    pub fn operation(&self) -> Option<&'static str> {
        match self {
            EngineError::Operation { op, .. } => Some(op),
            _ => None,
        }
    }
}

/// Used by hosts (and the CLI) to bucket errors for display and exit codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    UserInput,
    Balance,
    Network,
    Persistence,
    Invariant,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Identity(_)
            | EngineError::Address(_)
            | EngineError::Note(_)
            | EngineError::BadRecipient(_)
            | EngineError::Plan(PlanError::AmountBelowMinimum) => ErrorKind::UserInput,
            EngineError::Plan(_) | EngineError::NeedsConsolidation { .. } => ErrorKind::Balance,
            EngineError::Relayer(_) | EngineError::Chain(_) | EngineError::Prove(_) => {
                ErrorKind::Network
            }
            EngineError::Store(StoreError::Persistence(_)) | EngineError::Persist(_) => {
                ErrorKind::Persistence
            }
            EngineError::Merkle(_)
            | EngineError::Store(_)
            | EngineError::Memo(_)
            | EngineError::Invariant(_)
            | EngineError::ReadOnly { .. } => ErrorKind::Invariant,
            EngineError::Operation { source, .. } => source.kind(),
        }
    }
}
