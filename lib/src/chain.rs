//! Pool contract bindings and the chain-facing adapter.
//!
//! Inline sol! bindings, no ABI files. The adapter exposes exactly what the
//! engine and the discovery loop need: typed event queries, the contract
//! views, receipt waits with a deadline, and the merged leaf-insertion
//! stream used to mirror the on-chain tree.

use std::time::Duration;

use alloy::{
    consensus::Transaction as _,
    network::TransactionBuilder,
    primitives::{Address, B256, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::types::TransactionRequest as AlloyTxRequest,
    sol,
    sol_types::SolCall,
};
use ark_bn254::Fr;
use async_trait::async_trait;

use crate::error::ChainError;
use crate::field::{fr_from_bytes, fr_to_bytes};
use crate::witness::TxRequest;

/// Overall deadline applied to every network wait.
pub const NETWORK_DEADLINE: Duration = Duration::from_secs(30);

sol! {
    #[sol(rpc)]
    interface IShieldedPool {
        function shieldNative(bytes32 commitment) external payable;
        function shieldToken(address token, uint256 amount, bytes32 commitment) external;
        function transfer(bytes calldata proof, bytes32 root, bytes32 nullifierHash, bytes32 outCommitment1, bytes32 outCommitment2, bytes calldata encryptedMemo1, bytes calldata encryptedMemo2, uint256 fee) external;
        function unshield(bytes calldata proof, bytes32 root, bytes32 nullifierHash, address recipient, address token, uint256 netAmount, uint256 fee, bytes32 changeCommitment) external;
        function swap(bytes calldata proof, bytes32 root, bytes32 nullifierHash, address tokenIn, address tokenOut, uint256 amountIn, uint256 minOut, bytes32 outCommitment1, bytes32 outCommitment2) external;
        function getLastRoot() external view returns (bytes32);
        function nextLeafIndex() external view returns (uint32);
        function isKnownRoot(bytes32 root) external view returns (bool);
        function isSpent(bytes32 nullifier) external view returns (bool);

        event Shield(bytes32 indexed commitment, uint32 indexed leafIndex, address indexed token, uint256 amount, uint256 timestamp);
        event Transfer(bytes32 indexed nullifierHash, bytes32 outCommitment1, bytes32 outCommitment2, bytes encryptedMemo1, bytes encryptedMemo2, uint32 leafIndex1, uint32 leafIndex2, uint256 fee, uint256 timestamp);
        event Unshield(bytes32 indexed nullifierHash, address indexed recipient, address indexed token, uint256 amount, address relayer, uint256 fee, uint256 timestamp);
        event Swap(bytes32 indexed nullifierHash, address indexed tokenIn, address indexed tokenOut, uint256 amountIn, uint256 minOut, bytes32 outCommitment1, bytes32 outCommitment2, uint32 leafIndex1, uint32 leafIndex2, uint256 timestamp);
    }

    #[sol(rpc)]
    interface IERC20 {
        function approve(address spender, uint256 amount) external returns (bool);
        function balanceOf(address account) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
    }
}

// ---------------------------------------------------------------------------
// Decoded events
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct ShieldEvent {
    pub commitment: Fr,
    pub leaf_index: u32,
    pub token: Address,
    pub amount: U256,
    pub tx_hash: B256,
    pub block: u64,
    pub log_index: u64,
}

#[derive(Clone, Debug)]
pub struct TransferEvent {
    pub nullifier: Fr,
    pub commitments: [Fr; 2],
    pub memos: [Vec<u8>; 2],
    pub leaf_indices: [u32; 2],
    pub fee: U256,
    pub tx_hash: B256,
    pub block: u64,
    pub log_index: u64,
}

#[derive(Clone, Debug)]
pub struct UnshieldEvent {
    pub nullifier: Fr,
    pub recipient: Address,
    pub token: Address,
    pub amount: U256,
    pub relayer: Address,
    pub fee: U256,
    /// Recovered from the unshield call data; `None` on full withdrawals.
    pub change_commitment: Option<Fr>,
    pub tx_hash: B256,
    pub block: u64,
    pub log_index: u64,
}

#[derive(Clone, Debug)]
pub struct SwapEvent {
    pub nullifier: Fr,
    pub token_in: Address,
    pub token_out: Address,
    pub amount_in: U256,
    pub commitments: [Fr; 2],
    pub leaf_indices: [u32; 2],
    pub tx_hash: B256,
    pub block: u64,
    pub log_index: u64,
}

/// One commitment landing in the tree, in replay order.
#[derive(Clone, Debug)]
pub struct LeafInsertion {
    /// The index the event claims, when it carries one. Unshield change
    /// leaves carry none and take the next free index on replay.
    pub leaf_index: Option<u32>,
    pub commitment: Fr,
    pub tx_hash: B256,
    pub block: u64,
    pub log_index: u64,
}

// ---------------------------------------------------------------------------
// Adapter trait
// ---------------------------------------------------------------------------

/// Everything the engine and the discovery loop read from the chain.
/// Implemented by the alloy-backed [`ChainClient`] and by the in-memory
/// pool in the test crate.
#[async_trait]
pub trait PoolClient: Send + Sync {
    async fn latest_block(&self) -> Result<u64, ChainError>;
    async fn pool_root(&self) -> Result<Fr, ChainError>;
    async fn next_leaf_index(&self) -> Result<u32, ChainError>;
    async fn is_spent(&self, nullifier: Fr) -> Result<bool, ChainError>;
    async fn get_balance(&self, address: Address) -> Result<U256, ChainError>;

    async fn shield_events(&self, from: u64, to: u64) -> Result<Vec<ShieldEvent>, ChainError>;
    async fn transfer_events(&self, from: u64, to: u64) -> Result<Vec<TransferEvent>, ChainError>;
    async fn unshield_events(&self, from: u64, to: u64) -> Result<Vec<UnshieldEvent>, ChainError>;
    async fn swap_events(&self, from: u64, to: u64) -> Result<Vec<SwapEvent>, ChainError>;

    /// Wait until a transaction has the given number of confirmations.
    async fn wait_for_receipt(&self, tx_hash: B256, confirmations: u64) -> Result<(), ChainError>;

    /// All leaf insertions in `[from, to]`, sorted by (block, log index),
    /// transfer/swap pairs kept in submission order.
    async fn leaf_insertions(&self, from: u64, to: u64) -> Result<Vec<LeafInsertion>, ChainError> {
        let mut leaves: Vec<LeafInsertion> = Vec::new();

        for ev in self.shield_events(from, to).await? {
            leaves.push(LeafInsertion {
                leaf_index: Some(ev.leaf_index),
                commitment: ev.commitment,
                tx_hash: ev.tx_hash,
                block: ev.block,
                log_index: ev.log_index,
            });
        }
        for ev in self.transfer_events(from, to).await? {
            for (slot, (c, i)) in ev
                .commitments
                .iter()
                .zip(ev.leaf_indices.iter())
                .enumerate()
            {
                leaves.push(LeafInsertion {
                    leaf_index: Some(*i),
                    commitment: *c,
                    tx_hash: ev.tx_hash,
                    block: ev.block,
                    // order the pair within the log
                    log_index: ev.log_index * 2 + slot as u64,
                });
            }
        }
        for ev in self.swap_events(from, to).await? {
            for (slot, (c, i)) in ev
                .commitments
                .iter()
                .zip(ev.leaf_indices.iter())
                .enumerate()
            {
                leaves.push(LeafInsertion {
                    leaf_index: Some(*i),
                    commitment: *c,
                    tx_hash: ev.tx_hash,
                    block: ev.block,
                    log_index: ev.log_index * 2 + slot as u64,
                });
            }
        }
        for ev in self.unshield_events(from, to).await? {
            if let Some(change) = ev.change_commitment {
                leaves.push(LeafInsertion {
                    leaf_index: None,
                    commitment: change,
                    tx_hash: ev.tx_hash,
                    block: ev.block,
                    log_index: ev.log_index * 2,
                });
            }
        }

        leaves.sort_by_key(|l| (l.block, l.log_index));
        Ok(leaves)
    }
}

// ---------------------------------------------------------------------------
// Shield call encoding (checked encoder; selectors pinned in tests)
// ---------------------------------------------------------------------------

/// The wallet-submitted shield transaction for the native coin.
pub fn shield_native_request(pool: Address, commitment: Fr, amount: U256) -> TxRequest {
    let call = IShieldedPool::shieldNativeCall {
        commitment: fr_to_bytes(&commitment).into(),
    };
    TxRequest {
        to: pool,
        value: amount,
        data: call.abi_encode(),
    }
}

/// The wallet-submitted shield transaction for an ERC20 token.
/// The pool pulls the tokens, so an allowance must exist first.
pub fn shield_token_request(pool: Address, token: Address, amount: U256, commitment: Fr) -> TxRequest {
    let call = IShieldedPool::shieldTokenCall {
        token,
        amount,
        commitment: fr_to_bytes(&commitment).into(),
    };
    TxRequest {
        to: pool,
        value: U256::ZERO,
        data: call.abi_encode(),
    }
}

/// ERC20 approve for the pool, the shield-token prerequisite.
pub fn approve_request(pool: Address, token: Address, amount: U256) -> TxRequest {
    let call = IERC20::approveCall {
        spender: pool,
        amount,
    };
    TxRequest {
        to: token,
        value: U256::ZERO,
        data: call.abi_encode(),
    }
}

// ---------------------------------------------------------------------------
// Alloy-backed implementation
// ---------------------------------------------------------------------------

pub struct ChainClient {
    provider: DynProvider,
    pool: Address,
}

impl ChainClient {
    /// Read-only connection; shields go through the wallet capability.
    pub fn connect(rpc_url: &str, pool: Address) -> Result<Self, ChainError> {
        let url = rpc_url
            .parse()
            .map_err(|e| ChainError::Rpc(format!("bad rpc url: {e}")))?;
        let provider = ProviderBuilder::new().connect_http(url).erased();
        Ok(ChainClient { provider, pool })
    }

    pub fn with_provider(provider: DynProvider, pool: Address) -> Self {
        ChainClient { provider, pool }
    }

    pub fn pool_address(&self) -> Address {
        self.pool
    }

    /// Check the current allowance towards the pool.
    pub async fn allowance(&self, token: Address, owner: Address) -> Result<U256, ChainError> {
        let erc20 = IERC20::new(token, &self.provider);
        with_deadline("allowance", erc20.allowance(owner, self.pool).call()).await
    }

    /// Recover the change commitment an unshield inserted, by decoding the
    /// transaction's call data with the checked decoder.
    async fn unshield_change(&self, tx_hash: B256) -> Result<Option<Fr>, ChainError> {
        let tx = with_deadline(
            "get_transaction",
            self.provider.get_transaction_by_hash(tx_hash),
        )
        .await?;
        let Some(tx) = tx else {
            return Ok(None);
        };
        let input = tx.input();
        if input.len() < 4 || input[..4] != IShieldedPool::unshieldCall::SELECTOR {
            return Ok(None);
        }
        let call = IShieldedPool::unshieldCall::abi_decode_raw(&input[4..])
            .map_err(|e| ChainError::Rpc(format!("undecodable unshield calldata: {e}")))?;
        let change: [u8; 32] = call.changeCommitment.into();
        if change == [0u8; 32] {
            Ok(None)
        } else {
            Ok(Some(fr_from_bytes(&change)))
        }
    }
}

async fn with_deadline<T, E: std::fmt::Display>(
    what: &'static str,
    fut: impl std::future::IntoFuture<Output = Result<T, E>>,
) -> Result<T, ChainError> {
    match tokio::time::timeout(NETWORK_DEADLINE, fut.into_future()).await {
        Err(_) => Err(ChainError::Timeout(what)),
        Ok(Err(e)) => Err(ChainError::Rpc(format!("{what}: {e}"))),
        Ok(Ok(v)) => Ok(v),
    }
}

fn b256_fr(b: &alloy::primitives::FixedBytes<32>) -> Fr {
    fr_from_bytes(b.as_slice())
}

#[async_trait]
impl PoolClient for ChainClient {
    async fn latest_block(&self) -> Result<u64, ChainError> {
        with_deadline("get_block_number", self.provider.get_block_number()).await
    }

    async fn pool_root(&self) -> Result<Fr, ChainError> {
        let pool = IShieldedPool::new(self.pool, &self.provider);
        let root = with_deadline("getLastRoot", pool.getLastRoot().call()).await?;
        Ok(b256_fr(&root))
    }

    async fn next_leaf_index(&self) -> Result<u32, ChainError> {
        let pool = IShieldedPool::new(self.pool, &self.provider);
        with_deadline("nextLeafIndex", pool.nextLeafIndex().call()).await
    }

    async fn is_spent(&self, nullifier: Fr) -> Result<bool, ChainError> {
        let pool = IShieldedPool::new(self.pool, &self.provider);
        with_deadline(
            "isSpent",
            pool.isSpent(fr_to_bytes(&nullifier).into()).call(),
        )
        .await
    }

    async fn get_balance(&self, address: Address) -> Result<U256, ChainError> {
        with_deadline("get_balance", self.provider.get_balance(address)).await
    }

    async fn shield_events(&self, from: u64, to: u64) -> Result<Vec<ShieldEvent>, ChainError> {
        let pool = IShieldedPool::new(self.pool, &self.provider);
        let logs = with_deadline(
            "shield logs",
            pool.Shield_filter().from_block(from).to_block(to).query(),
        )
        .await?;
        Ok(logs
            .into_iter()
            .map(|(event, log)| ShieldEvent {
                commitment: b256_fr(&event.commitment),
                leaf_index: event.leafIndex,
                token: event.token,
                amount: event.amount,
                tx_hash: log.transaction_hash.unwrap_or_default(),
                block: log.block_number.unwrap_or(0),
                log_index: log.log_index.unwrap_or(0),
            })
            .collect())
    }

    async fn transfer_events(&self, from: u64, to: u64) -> Result<Vec<TransferEvent>, ChainError> {
        let pool = IShieldedPool::new(self.pool, &self.provider);
        let logs = with_deadline(
            "transfer logs",
            pool.Transfer_filter().from_block(from).to_block(to).query(),
        )
        .await?;
        Ok(logs
            .into_iter()
            .map(|(event, log)| TransferEvent {
                nullifier: b256_fr(&event.nullifierHash),
                commitments: [b256_fr(&event.outCommitment1), b256_fr(&event.outCommitment2)],
                memos: [
                    event.encryptedMemo1.to_vec(),
                    event.encryptedMemo2.to_vec(),
                ],
                leaf_indices: [event.leafIndex1, event.leafIndex2],
                fee: event.fee,
                tx_hash: log.transaction_hash.unwrap_or_default(),
                block: log.block_number.unwrap_or(0),
                log_index: log.log_index.unwrap_or(0),
            })
            .collect())
    }

    async fn unshield_events(&self, from: u64, to: u64) -> Result<Vec<UnshieldEvent>, ChainError> {
        let pool = IShieldedPool::new(self.pool, &self.provider);
        let logs = with_deadline(
            "unshield logs",
            pool.Unshield_filter().from_block(from).to_block(to).query(),
        )
        .await?;
        let mut events = Vec::with_capacity(logs.len());
        for (event, log) in logs {
            let tx_hash = log.transaction_hash.unwrap_or_default();
            let change_commitment = self.unshield_change(tx_hash).await?;
            events.push(UnshieldEvent {
                nullifier: b256_fr(&event.nullifierHash),
                recipient: event.recipient,
                token: event.token,
                amount: event.amount,
                relayer: event.relayer,
                fee: event.fee,
                change_commitment,
                tx_hash,
                block: log.block_number.unwrap_or(0),
                log_index: log.log_index.unwrap_or(0),
            });
        }
        Ok(events)
    }

    async fn swap_events(&self, from: u64, to: u64) -> Result<Vec<SwapEvent>, ChainError> {
        let pool = IShieldedPool::new(self.pool, &self.provider);
        let logs = with_deadline(
            "swap logs",
            pool.Swap_filter().from_block(from).to_block(to).query(),
        )
        .await?;
        Ok(logs
            .into_iter()
            .map(|(event, log)| SwapEvent {
                nullifier: b256_fr(&event.nullifierHash),
                token_in: event.tokenIn,
                token_out: event.tokenOut,
                amount_in: event.amountIn,
                commitments: [b256_fr(&event.outCommitment1), b256_fr(&event.outCommitment2)],
                leaf_indices: [event.leafIndex1, event.leafIndex2],
                tx_hash: log.transaction_hash.unwrap_or_default(),
                block: log.block_number.unwrap_or(0),
                log_index: log.log_index.unwrap_or(0),
            })
            .collect())
    }

    async fn wait_for_receipt(&self, tx_hash: B256, confirmations: u64) -> Result<(), ChainError> {
        let deadline = tokio::time::Instant::now() + NETWORK_DEADLINE;
        loop {
            let receipt = self
                .provider
                .get_transaction_receipt(tx_hash)
                .await
                .map_err(|e| ChainError::Rpc(format!("get_transaction_receipt: {e}")))?;
            if let Some(receipt) = receipt {
                if !receipt.status() {
                    return Err(ChainError::TxFailed(format!("{tx_hash:#x}")));
                }
                let mined_in = receipt.block_number.unwrap_or(0);
                let head = self
                    .provider
                    .get_block_number()
                    .await
                    .map_err(|e| ChainError::Rpc(format!("get_block_number: {e}")))?;
                if head + 1 >= mined_in + confirmations {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ChainError::Timeout("wait_for_receipt"));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

/// Submit a [`TxRequest`] through an alloy provider that carries a signer.
/// Used by the CLI's wallet implementation.
pub async fn submit_tx_request(
    provider: &DynProvider,
    request: &TxRequest,
) -> Result<B256, ChainError> {
    let tx = AlloyTxRequest::default()
        .with_to(request.to)
        .with_value(request.value)
        .with_input(request.data.clone());
    let pending = provider
        .send_transaction(tx)
        .await
        .map_err(|e| ChainError::Rpc(format!("send_transaction: {e}")))?;
    Ok(*pending.tx_hash())
}
