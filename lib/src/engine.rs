//! The wallet engine: one explicit value owning the whole shielded state
//! for one unlocked wallet.
//!
//! Constructed on unlock, dropped on lock or wallet change — there are no
//! module-level singletons. The store and the tree each sit behind their
//! own mutex; neither lock is ever held across a suspension point, and the
//! two are never held together.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use alloy::primitives::{Address, B256, U256};
use ark_bn254::Fr;
use rand::rngs::OsRng;
use tracing::{debug, info, warn};

use crate::chain::{approve_request, shield_native_request, shield_token_request, PoolClient};
use crate::discovery::{Discovery, DiscoveryConfig, DiscoveryHandle, Notifier, WalletEvent};
use crate::error::{EngineError, PlanError, ProveError, RelayerError};
use crate::identity::{identity_message, Identity, ShieldedAddress};
use crate::merkle::{MerklePath, PoolTree};
use crate::note::{Note, TokenInfo};
use crate::planner::{max_cumulative, max_sendable, plan_spend, Plan, SpendPlan};
use crate::prover::Prover;
use crate::relayer::Relay;
use crate::store::NoteStore;
use crate::vault::{export_backup, import_backup, Vault};
use crate::wallet::WalletConnector;
use crate::witness::{TxRequest, WitnessBuilder, MAX_ROOT_FALLBACKS};

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub chain_id: u64,
    pub pool_address: Address,
    pub deploy_block: u64,
    /// Receipt confirmations required before state commits.
    pub confirmations: u64,
    pub data_dir: PathBuf,
    /// Token registry for display metadata resolution.
    pub tokens: Vec<TokenInfo>,
    pub discovery: DiscoveryConfig,
}

/// A prepared shield: the caller submits via its wallet.
#[derive(Clone, Debug)]
pub struct ShieldRequest {
    pub note: Note,
    /// ERC20 prerequisite; `None` for the native coin or a live allowance.
    pub approve: Option<TxRequest>,
    pub tx: TxRequest,
}

#[derive(Clone, Debug)]
pub struct TransferOutcome {
    pub tx_hash: B256,
    pub fee: U256,
    pub change: U256,
}

#[derive(Clone, Debug)]
pub struct UnshieldOutcome {
    pub tx_hash: B256,
    pub net_amount: U256,
    pub fee: U256,
}

#[derive(Clone, Debug)]
pub struct SwapOutcome {
    pub tx_hash: B256,
    pub min_out: U256,
    pub change: U256,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct WalletEngine {
    identity: Arc<Identity>,
    wallet: Arc<dyn WalletConnector>,
    chain: Arc<dyn PoolClient>,
    relayer: Arc<dyn Relay>,
    prover: Arc<dyn Prover>,
    notifier: Arc<dyn Notifier>,
    store: Arc<Mutex<NoteStore>>,
    tree: Arc<Mutex<PoolTree>>,
    config: EngineConfig,
    poisoned: Arc<AtomicBool>,
}

impl WalletEngine {
    /// Unlock: sign the canonical message, derive the identity, open the
    /// vault, and reconcile the local tree from chain history.
    pub async fn init(
        wallet: Arc<dyn WalletConnector>,
        chain: Arc<dyn PoolClient>,
        relayer: Arc<dyn Relay>,
        prover: Arc<dyn Prover>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let message = identity_message(config.chain_id, config.pool_address);
        let signature = wallet.sign_message(&message).await?;
        let identity = Arc::new(Identity::from_signature(&signature)?);
        info!(address = %identity.address(), "identity derived");

        let vault = Vault::open(&config.data_dir, wallet.address(), &signature)?;
        let store = Arc::new(Mutex::new(NoteStore::open(Box::new(vault))?));
        let tree = Arc::new(Mutex::new(PoolTree::new()));

        let engine = WalletEngine {
            identity,
            wallet,
            chain,
            relayer,
            prover,
            notifier,
            store,
            tree,
            config,
            poisoned: Arc::new(AtomicBool::new(false)),
        };
        engine.sync_tree().await.map_err(|e| e.in_op("init"))?;
        Ok(engine)
    }

    fn discovery(&self) -> Arc<Discovery> {
        let mut config = self.config.discovery.clone();
        config.deploy_block = self.config.deploy_block;
        config.recipient_watch = self.wallet.address();
        Arc::new(Discovery {
            identity: self.identity.clone(),
            store: self.store.clone(),
            tree: self.tree.clone(),
            chain: self.chain.clone(),
            notifier: self.notifier.clone(),
            tokens: self.config.tokens.clone(),
            config,
            poisoned: self.poisoned.clone(),
        })
    }

    /// Replay all leaf insertions from the deployment block and verify the
    /// mirror against the pool root.
    async fn sync_tree(&self) -> Result<(), EngineError> {
        let discovery = self.discovery();
        let head = self.chain.latest_block().await?;
        let step = self.config.discovery.batch_blocks.max(1);
        let mut cursor = self.config.deploy_block;
        while cursor <= head {
            let to = (cursor + step - 1).min(head);
            discovery.apply_leaves(cursor, to, to == head).await?;
            cursor = to + 1;
        }
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(EngineError::Invariant(
                "merkle reconciliation failed during sync".into(),
            ));
        }
        debug!(leaves = lock(&self.tree).leaf_count(), "tree synced");
        Ok(())
    }

    /// Launch the background monitors. The returned handle stops them.
    pub fn start_discovery(&self) -> DiscoveryHandle {
        self.discovery().spawn()
    }

    fn ensure_writable(&self) -> Result<(), EngineError> {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(EngineError::ReadOnly {
                reason: "cryptographic invariant failure; run resync".into(),
            });
        }
        Ok(())
    }

    /// Drop the local tree and rebuild it from chain history. The only way
    /// out of read-only mode.
    pub async fn resync(&self) -> Result<(), EngineError> {
        {
            let mut tree = lock(&self.tree);
            *tree = PoolTree::new();
        }
        self.poisoned.store(false, Ordering::SeqCst);
        match self.sync_tree().await {
            Ok(()) => {
                self.notifier.notify(WalletEvent::StateChanged);
                Ok(())
            }
            Err(e) => {
                self.poisoned.store(true, Ordering::SeqCst);
                Err(e.in_op("resync"))
            }
        }
    }

    // -- reads ------------------------------------------------------------

    pub fn address(&self) -> ShieldedAddress {
        self.identity.address()
    }

    pub fn notes(&self) -> Vec<Note> {
        lock(&self.store).notes()
    }

    pub fn balance(&self, token: &TokenInfo) -> U256 {
        lock(&self.store).balance(token)
    }

    /// (single-transaction max, consolidation max) for one token.
    pub async fn spending_limits(&self, token: &TokenInfo) -> Result<(U256, U256), EngineError> {
        let quote = self.relayer.quote(token).await?;
        let notes = lock(&self.store).spendable_notes(token);
        Ok((max_sendable(&notes, &quote), max_cumulative(&notes, &quote)))
    }

    pub fn backup(&self) -> Result<String, EngineError> {
        let snapshot = lock(&self.store).snapshot();
        Ok(export_backup(&self.identity, snapshot)?)
    }

    pub fn restore(&self, raw: &str) -> Result<(), EngineError> {
        let backup = import_backup(raw)?;
        if backup.identity.address_pubkey != self.identity.address_pubkey {
            return Err(EngineError::Invariant(
                "backup belongs to a different wallet identity".into(),
            ));
        }
        lock(&self.store).restore(backup.snapshot)?;
        self.notifier.notify(WalletEvent::StateChanged);
        Ok(())
    }

    // -- shield -----------------------------------------------------------

    /// Build the shield note and transactions without submitting, for
    /// hosts that drive their own wallet UI.
    pub fn prepare_shield(&self, token: &TokenInfo, amount: U256) -> Result<ShieldRequest, EngineError> {
        self.ensure_writable()?;
        if amount.is_zero() {
            return Err(EngineError::Plan(PlanError::AmountBelowMinimum).in_op("shield"));
        }
        let witness = WitnessBuilder::new(&self.identity).shield(token, amount, &mut OsRng);
        let pool = self.config.pool_address;
        let (approve, tx) = if token.is_native() {
            (None, shield_native_request(pool, witness.commitment, amount))
        } else {
            (
                Some(approve_request(pool, token.address, amount)),
                shield_token_request(pool, token.address, amount, witness.commitment),
            )
        };
        Ok(ShieldRequest {
            note: witness.note,
            approve,
            tx,
        })
    }

    /// Shield through the wallet capability: submit, wait for the receipt,
    /// record the note as pending. Discovery fills in the leaf index.
    pub async fn shield(&self, token: &TokenInfo, amount: U256) -> Result<(Note, B256), EngineError> {
        let prepared = self.prepare_shield(token, amount)?;
        let run = async {
            if let Some(approve) = &prepared.approve {
                let tx_hash = self.wallet.send_transaction(approve).await?;
                self.chain
                    .wait_for_receipt(tx_hash, self.config.confirmations)
                    .await?;
            }
            let tx_hash = self.wallet.send_transaction(&prepared.tx).await?;
            self.chain
                .wait_for_receipt(tx_hash, self.config.confirmations)
                .await?;
            lock(&self.store).add_pending(prepared.note.clone())?;
            self.notifier.notify(WalletEvent::StateChanged);
            info!(%tx_hash, amount = %amount, token = %token.symbol, "shielded");
            Ok((prepared.note.clone(), tx_hash))
        };
        run.await.map_err(|e: EngineError| e.in_op("shield"))
    }

    // -- spends -----------------------------------------------------------

    /// Pick the plan for one spend, converting a consolidation answer into
    /// the suggestion error the host surfaces.
    async fn single_plan(
        &self,
        token: &TokenInfo,
        amount: U256,
    ) -> Result<(SpendPlan, crate::planner::RelayerQuote), EngineError> {
        let quote = self.relayer.quote(token).await?;
        let notes = lock(&self.store).spendable_notes(token);
        match plan_spend(&notes, amount, &quote)? {
            Plan::Single(plan) => Ok((plan, quote)),
            Plan::Consolidate(plan) => Err(EngineError::NeedsConsolidation {
                notes: plan.notes.len(),
                net_total: plan.net_total.to_string(),
            }),
        }
    }

    fn leaf_of(plan: &SpendPlan) -> Result<u32, EngineError> {
        plan.note.leaf_index.ok_or_else(|| {
            EngineError::Invariant("planner selected a note without a leaf index".into())
        })
    }

    /// Shared relay loop: walk progressively older roots while the relayer
    /// rejects them, evict the input on a double-spend report.
    async fn relay_with_root_ladder<W, T, Fut>(
        &self,
        spent_commitment: Fr,
        leaf_index: u32,
        mut build: impl FnMut(MerklePath) -> Result<W, EngineError>,
        mut relay: impl FnMut(W, Vec<u8>) -> Fut,
    ) -> Result<(W, T), EngineError>
    where
        W: Clone + WitnessLike,
        Fut: std::future::Future<Output = Result<T, RelayerError>>,
    {
        let mut attempt = 0;
        loop {
            let path = {
                let tree = lock(&self.tree);
                match tree.path_at_offset(leaf_index, attempt) {
                    Ok(path) => path,
                    Err(_) if attempt > 0 => return Err(ProveError::StaleRoot.into()),
                    Err(e) => return Err(e.into()),
                }
            };
            let witness = build(path)?;
            let proof = self.prover.prove(witness.inputs()).await?;
            match relay(witness.clone(), proof).await {
                Ok(receipt) => return Ok((witness, receipt)),
                Err(RelayerError::RootNotFound) if attempt + 1 < MAX_ROOT_FALLBACKS => {
                    warn!(attempt, "relayer rejected root, retrying one older");
                    attempt += 1;
                }
                Err(RelayerError::RootNotFound) => return Err(ProveError::StaleRoot.into()),
                Err(RelayerError::AlreadySpent) => {
                    // the chain says this note is gone; drop it and move on
                    warn!("input nullifier already spent; evicting note");
                    let nullifier = crate::field::nullify(
                        spent_commitment,
                        leaf_index,
                        self.identity.spending_key(),
                    );
                    if let Err(e) = lock(&self.store).evict(spent_commitment, nullifier) {
                        warn!(error = %e, "eviction failed");
                    }
                    self.notifier.notify(WalletEvent::StateChanged);
                    return Err(RelayerError::AlreadySpent.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Private transfer inside the pool.
    pub async fn transfer(
        &self,
        recipient: &ShieldedAddress,
        token: &TokenInfo,
        amount: U256,
    ) -> Result<TransferOutcome, EngineError> {
        self.ensure_writable()?;
        let run = async {
            let (plan, quote) = self.single_plan(token, amount).await?;
            let leaf_index = Self::leaf_of(&plan)?;
            let spent_commitment = plan.note.commitment();
            let pool = self.config.pool_address;

            let builder = WitnessBuilder::new(&self.identity);
            let relayer = self.relayer.clone();
            let (witness, receipt) = self
                .relay_with_root_ladder(
                    spent_commitment,
                    leaf_index,
                    |path| {
                        builder
                            .transfer(&plan, recipient, token, amount, path, quote.relayer, &mut OsRng)
                            .map_err(EngineError::from)
                    },
                    move |witness, proof| {
                        let relayer = relayer.clone();
                        async move { relayer.relay_transfer(pool, &proof, &witness).await }
                    },
                )
                .await?;

            self.chain
                .wait_for_receipt(receipt.tx_hash, self.config.confirmations)
                .await?;

            // receipt confirmed: commit the spent-mark and the change note
            {
                let mut store = lock(&self.store);
                store.mark_spent(spent_commitment, witness.nullifier)?;
                store.add_pending(witness.change_note.clone())?;
            }
            self.insert_confirmed_outputs(
                &witness.out_commitments,
                [receipt.leaf_index1, receipt.leaf_index2],
            );
            self.notifier.notify(WalletEvent::StateChanged);
            info!(tx = %receipt.tx_hash, "transfer relayed");
            Ok(TransferOutcome {
                tx_hash: receipt.tx_hash,
                fee: witness.fee,
                change: witness.change_note.amount,
            })
        };
        run.await.map_err(|e: EngineError| e.in_op("transfer"))
    }

    /// Withdraw to a public address through the relayer.
    pub async fn unshield(
        &self,
        recipient: Address,
        token: &TokenInfo,
        amount: U256,
    ) -> Result<UnshieldOutcome, EngineError> {
        self.ensure_writable()?;
        let run = async {
            let (plan, _quote) = self.single_plan(token, amount).await?;
            self.unshield_with_plan(plan, recipient, token, amount).await
        };
        run.await.map_err(|e: EngineError| e.in_op("unshield"))
    }

    async fn unshield_with_plan(
        &self,
        plan: SpendPlan,
        recipient: Address,
        token: &TokenInfo,
        amount: U256,
    ) -> Result<UnshieldOutcome, EngineError> {
        let leaf_index = Self::leaf_of(&plan)?;
        let spent_commitment = plan.note.commitment();
        let pool = self.config.pool_address;

        let builder = WitnessBuilder::new(&self.identity);
        let relayer = self.relayer.clone();
        let (witness, receipt) = self
            .relay_with_root_ladder(
                spent_commitment,
                leaf_index,
                |path| Ok(builder.unshield(&plan, recipient, token, amount, path, &mut OsRng)),
                move |witness, proof| {
                    let relayer = relayer.clone();
                    async move { relayer.relay_unshield(pool, &proof, &witness).await }
                },
            )
            .await?;

        self.chain
            .wait_for_receipt(receipt.tx_hash, self.config.confirmations)
            .await?;

        {
            let mut store = lock(&self.store);
            store.mark_spent(spent_commitment, witness.nullifier)?;
            if let Some(change) = &witness.change_note {
                // pending until discovery observes the change leaf
                store.add_pending(change.clone())?;
            }
        }
        self.notifier.notify(WalletEvent::StateChanged);
        info!(tx = %receipt.tx_hash, net = %witness.net_amount, "unshield relayed");
        Ok(UnshieldOutcome {
            tx_hash: receipt.tx_hash,
            net_amount: witness.net_amount,
            fee: witness.fee,
        })
    }

    /// In-pool swap through the relayer.
    pub async fn swap(
        &self,
        token_in: &TokenInfo,
        token_out: &TokenInfo,
        amount_in: U256,
        min_out: U256,
    ) -> Result<SwapOutcome, EngineError> {
        self.ensure_writable()?;
        let run = async {
            if min_out.is_zero() {
                return Err(EngineError::Plan(PlanError::AmountBelowMinimum));
            }
            let (plan, _quote) = self.single_plan(token_in, amount_in).await?;
            let leaf_index = Self::leaf_of(&plan)?;
            let spent_commitment = plan.note.commitment();
            let pool = self.config.pool_address;

            let builder = WitnessBuilder::new(&self.identity);
            let relayer = self.relayer.clone();
            let (witness, receipt) = self
                .relay_with_root_ladder(
                    spent_commitment,
                    leaf_index,
                    |path| {
                        Ok(builder.swap(
                            &plan, token_in, token_out, amount_in, min_out, path, &mut OsRng,
                        ))
                    },
                    move |witness, proof| {
                        let relayer = relayer.clone();
                        async move { relayer.relay_swap(pool, &proof, &witness).await }
                    },
                )
                .await?;

            self.chain
                .wait_for_receipt(receipt.tx_hash, self.config.confirmations)
                .await?;

            {
                let mut store = lock(&self.store);
                store.mark_spent(spent_commitment, witness.nullifier)?;
                store.add_pending(witness.out_note.clone())?;
                store.add_pending(witness.change_note.clone())?;
            }
            self.insert_confirmed_outputs(
                &witness.out_commitments,
                [receipt.leaf_index1, receipt.leaf_index2],
            );
            self.notifier.notify(WalletEvent::StateChanged);
            info!(tx = %receipt.tx_hash, "swap relayed");
            Ok(SwapOutcome {
                tx_hash: receipt.tx_hash,
                min_out: witness.min_out,
                change: witness.change_note.amount,
            })
        };
        run.await.map_err(|e: EngineError| e.in_op("swap"))
    }

    /// Execute the consolidation sequence for a token: one full unshield
    /// per eligible note, in order. Already-spent notes are evicted and
    /// skipped; any other failure stops the sequence.
    pub async fn consolidate(
        &self,
        token: &TokenInfo,
        recipient: Address,
    ) -> Result<Vec<B256>, EngineError> {
        self.ensure_writable()?;
        let run = async {
            let quote = self.relayer.quote(token).await?;
            let notes = lock(&self.store).spendable_notes(token);
            let plan = crate::planner::consolidation_of(&notes, &quote);
            if plan.notes.is_empty() {
                return Err(if notes.is_empty() {
                    EngineError::Plan(PlanError::InsufficientBalance {
                        requested: "consolidation".into(),
                        available: "0".into(),
                    })
                } else {
                    EngineError::Plan(PlanError::NoteDustOnly)
                });
            }

            let mut tx_hashes = Vec::with_capacity(plan.notes.len());
            for (note, fee) in plan.notes.into_iter().zip(plan.fees) {
                let net = note.amount - fee;
                let spend = SpendPlan {
                    note,
                    fee,
                    change: U256::ZERO,
                };
                match self.unshield_with_plan(spend, recipient, token, net).await {
                    Ok(outcome) => tx_hashes.push(outcome.tx_hash),
                    Err(EngineError::Relayer(RelayerError::AlreadySpent)) => continue,
                    Err(e) => return Err(e),
                }
            }
            Ok(tx_hashes)
        };
        run.await.map_err(|e: EngineError| e.in_op("consolidate"))
    }

    /// Optimistically mirror freshly confirmed outputs into the local tree
    /// and confirm our own notes at their assigned indices. The leaf
    /// monitor replays the same events later; the replay is idempotent.
    fn insert_confirmed_outputs(&self, commitments: &[Fr; 2], leaf_indices: [u32; 2]) {
        {
            let mut tree = lock(&self.tree);
            if tree.leaf_count() == leaf_indices[0] {
                for commitment in commitments {
                    if let Err(e) = tree.insert(*commitment) {
                        warn!(error = %e, "optimistic insert failed");
                        return;
                    }
                }
            }
        }
        let root = lock(&self.tree).root();
        let mut store = lock(&self.store);
        for (commitment, index) in commitments.iter().zip(leaf_indices) {
            let ours = store
                .note(*commitment)
                .map(|n| n.leaf_index.is_none())
                .unwrap_or(false);
            if ours {
                if let Err(e) = store.confirm(*commitment, index, root) {
                    warn!(error = %e, "confirm after relay failed");
                }
            }
        }
    }
}

/// The slice of a witness the shared relay loop needs.
trait WitnessLike {
    fn inputs(&self) -> &crate::witness::CircuitInputs;
}

impl WitnessLike for crate::witness::TransferWitness {
    fn inputs(&self) -> &crate::witness::CircuitInputs {
        &self.inputs
    }
}

impl WitnessLike for crate::witness::UnshieldWitness {
    fn inputs(&self) -> &crate::witness::CircuitInputs {
        &self.inputs
    }
}

impl WitnessLike for crate::witness::SwapWitness {
    fn inputs(&self) -> &crate::witness::CircuitInputs {
        &self.inputs
    }
}
