//! Background discovery: event polling, memo scanning, notification
//! batching.
//!
//! Three monitors run concurrently. The leaf monitor replays every
//! commitment insertion into the local tree and confirms our own pending
//! notes. The income monitor trial-decrypts transfer memos and credits
//! notes sent to this identity. The settlement monitor watches unshields
//! addressed to our public wallet. Discovered notes funnel into a
//! deadline-driven batcher whose window is longer than one poll, so income
//! observed across two polls still lands in one notification. Stopping the
//! loop flushes the pending batch; nothing is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use ark_bn254::Fr;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chain::{PoolClient, TransferEvent};
use crate::error::ChainError;
use crate::field::FrHex;
use crate::identity::Identity;
use crate::memo::try_decrypt;
use crate::merkle::PoolTree;
use crate::note::{Note, TokenInfo};
use crate::store::{NoteStore, SeenKey};

/// Host-facing notification sink. No global event bus: the host passes
/// this in and decides what display means.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: WalletEvent);
}

#[derive(Clone, Debug)]
pub enum WalletEvent {
    /// Something about the note set changed; balances need re-reading.
    StateChanged,
    /// Incoming notes for one token, coalesced over the batch window.
    NotesDiscovered { token: TokenInfo, notes: Vec<Note> },
    /// An unshield to our public wallet settled.
    UnshieldSettled {
        recipient: Address,
        token: Address,
        amount: U256,
        tx_hash: B256,
    },
    /// The local tree no longer matches the chain; the engine went
    /// read-only.
    Desync { local: Fr, chain: Fr },
}

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    pub poll_interval: Duration,
    /// Strictly larger than one poll so cross-poll arrivals coalesce.
    pub batch_window: Duration,
    pub max_backoff: Duration,
    /// Initial block span per `get_logs`; halved when the RPC balks.
    pub batch_blocks: u64,
    /// First block worth scanning (pool deployment).
    pub deploy_block: u64,
    /// Public wallet address watched for unshield settlements.
    pub recipient_watch: Address,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            poll_interval: Duration::from_secs(5),
            batch_window: Duration::from_secs(8),
            max_backoff: Duration::from_secs(30),
            batch_blocks: 2_000,
            deploy_block: 0,
            recipient_watch: Address::ZERO,
        }
    }
}

/// Stop handle for the whole loop. Stopping flushes the pending batch.
pub struct DiscoveryHandle {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl DiscoveryHandle {
    /// Signal the loop to stop. Tasks observe the signal and drain on
    /// their own; the pending batch flushes before the batcher exits.
    pub fn stop(self) {
        let _ = self.stop.send(true);
    }

    /// Stop and wait for every task to drain.
    pub async fn stop_and_join(self) {
        let _ = self.stop.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Exponential backoff with the RPC batch-halving rule.
struct Backoff {
    failures: u32,
    max: Duration,
}

impl Backoff {
    fn new(max: Duration) -> Self {
        Backoff { failures: 0, max }
    }

    fn on_failure(&mut self, batch_blocks: &mut u64) -> Duration {
        self.failures += 1;
        *batch_blocks = (*batch_blocks / 2).max(1);
        let exp = Duration::from_millis(500).saturating_mul(1u32 << self.failures.min(10));
        exp.min(self.max)
    }

    fn on_success(&mut self) {
        self.failures = 0;
    }
}

/// A note credited by the scanner, on its way to the batcher.
#[derive(Clone, Debug)]
pub struct Discovered {
    pub note: Note,
    pub tx_hash: B256,
}

/// Shared wiring the monitors run against.
pub struct Discovery {
    pub identity: Arc<Identity>,
    pub store: Arc<Mutex<NoteStore>>,
    pub tree: Arc<Mutex<PoolTree>>,
    pub chain: Arc<dyn PoolClient>,
    pub notifier: Arc<dyn Notifier>,
    pub tokens: Vec<TokenInfo>,
    pub config: DiscoveryConfig,
    /// Set on invariant failure; the engine checks it before mutating.
    pub poisoned: Arc<AtomicBool>,
}

impl Discovery {
    fn resolve_token(&self, address: Address) -> TokenInfo {
        if address == Address::ZERO {
            return TokenInfo::native();
        }
        self.tokens
            .iter()
            .find(|t| t.address == address)
            .cloned()
            .unwrap_or(TokenInfo {
                address,
                symbol: "ERC20".into(),
                decimals: 18,
            })
    }

    /// Advance the local tree with a batch of leaf insertions. When
    /// `verify` is set (the batch reaches the chain head) the mirror is
    /// checked against the on-chain root. Our own pending notes are
    /// confirmed as their commitments land.
    pub async fn apply_leaves(&self, from: u64, to: u64, verify: bool) -> Result<(), ChainError> {
        let insertions = self.chain.leaf_insertions(from, to).await?;
        if insertions.is_empty() && !verify {
            return Ok(());
        }

        let replay_result = {
            let mut tree = lock(&self.tree);
            // unshield change leaves carry no index on the event; in the
            // sorted stream they take the next slot, exactly as the
            // contract assigned it
            let mut next = tree.leaf_count();
            let mut replay: Vec<(u32, Fr)> = Vec::with_capacity(insertions.len());
            for ins in &insertions {
                let index = ins.leaf_index.unwrap_or(next);
                replay.push((index, ins.commitment));
                next = next.max(index + 1);
            }
            tree.replay(replay.iter().copied())
                .map(|()| (replay, tree.root(), tree.leaf_count()))
                .map_err(|e| (e, tree.root()))
        };

        let (replay, root, leaf_count) = match replay_result {
            Ok(ok) => ok,
            Err((e, local)) => {
                warn!(error = %e, "merkle replay failed");
                self.poisoned.store(true, Ordering::SeqCst);
                let chain = self.chain.pool_root().await.unwrap_or(local);
                self.notifier.notify(WalletEvent::Desync { local, chain });
                return Ok(());
            }
        };

        if verify {
            let chain_root = self.chain.pool_root().await?;
            if root != chain_root {
                // only a real desync if the pool has not simply moved on
                // past the window we just scanned
                let chain_next = self.chain.next_leaf_index().await?;
                if chain_next == leaf_count {
                    warn!(local = %root, chain = %chain_root, "merkle reconciliation failed");
                    self.poisoned.store(true, Ordering::SeqCst);
                    self.notifier.notify(WalletEvent::Desync {
                        local: root,
                        chain: chain_root,
                    });
                    return Ok(());
                }
            }
        }

        // confirm any of our own pending notes, tree lock released
        let mut changed = false;
        {
            let mut store = lock(&self.store);
            for (index, commitment) in replay {
                let pending = store
                    .note(commitment)
                    .map(|n| n.leaf_index.is_none())
                    .unwrap_or(false);
                if pending {
                    debug!(leaf = index, "confirmed own commitment");
                    match store.confirm(commitment, index, root) {
                        Ok(()) => changed = true,
                        Err(e) => warn!(error = %e, "confirm failed"),
                    }
                }
            }
        }
        if changed {
            self.notifier.notify(WalletEvent::StateChanged);
        }
        Ok(())
    }

    /// Scan one transfer event's memos for notes addressed to us. Returns
    /// the notes credited by this event (already stored and confirmed).
    pub fn scan_transfer(&self, event: &TransferEvent) -> Vec<Discovered> {
        let mut found = Vec::new();
        for (slot, memo) in event.memos.iter().enumerate() {
            let Some(payload) = try_decrypt(&self.identity, memo) else {
                continue;
            };
            let commitment = event.commitments[slot];
            if payload.commitment() != commitment {
                // decrypts but contradicts the chain: someone is feeding
                // us a malformed memo, or our hasher diverged
                warn!(slot, "memo payload does not open the on-chain commitment");
                self.poisoned.store(true, Ordering::SeqCst);
                continue;
            }
            let token = self.resolve_token(payload.token_address);
            let mut note = payload.to_note(&token);

            let key = SeenKey {
                commitment: FrHex(commitment),
                tx_hash: event.tx_hash,
            };
            // root read first; the tree and store locks are never nested
            let root = lock(&self.tree).root();
            let mut store = lock(&self.store);
            let already_seen = store.seen_contains(&key);
            if let Err(e) = store.add_pending(note.clone()) {
                warn!(error = %e, "failed to store discovered note");
                continue;
            }
            if let Err(e) = store.confirm(commitment, event.leaf_indices[slot], root) {
                warn!(error = %e, "failed to confirm discovered note");
            }
            note.leaf_index = Some(event.leaf_indices[slot]);
            if already_seen {
                continue;
            }
            if let Err(e) = store.record_seen(key) {
                warn!(error = %e, "failed to persist dedup key");
            }
            found.push(Discovered {
                note,
                tx_hash: event.tx_hash,
            });
        }
        found
    }

    /// Spawn the monitors and the batcher; returns the stop handle.
    pub fn spawn(self: Arc<Self>) -> DiscoveryHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (batch_tx, batch_rx) = mpsc::unbounded_channel::<Discovered>();

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(leaf_monitor(self.clone(), stop_rx.clone())));
        tasks.push(tokio::spawn(income_monitor(
            self.clone(),
            batch_tx,
            stop_rx.clone(),
        )));
        tasks.push(tokio::spawn(settlement_monitor(
            self.clone(),
            stop_rx.clone(),
        )));
        tasks.push(tokio::spawn(batcher(self, batch_rx, stop_rx)));

        DiscoveryHandle {
            stop: stop_tx,
            tasks,
        }
    }
}

async fn wait_or_stop(stop: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => false,
        _ = stop.changed() => *stop.borrow(),
    }
}

/// Monitor 1: advance the Merkle mirror with every commitment insertion.
async fn leaf_monitor(discovery: Arc<Discovery>, mut stop: watch::Receiver<bool>) {
    let mut cursor = discovery.config.deploy_block;
    let mut batch_blocks = discovery.config.batch_blocks;
    let mut backoff = Backoff::new(discovery.config.max_backoff);
    info!(from_block = cursor, "leaf monitor started");

    loop {
        let head = match discovery.chain.latest_block().await {
            Ok(head) => head,
            Err(e) => {
                let delay = backoff.on_failure(&mut batch_blocks);
                warn!(error = %e, ?delay, "latest_block failed");
                if wait_or_stop(&mut stop, delay).await {
                    return;
                }
                continue;
            }
        };
        while cursor <= head {
            let to = (cursor + batch_blocks - 1).min(head);
            match discovery.apply_leaves(cursor, to, to == head).await {
                Ok(()) => {
                    backoff.on_success();
                    cursor = to + 1;
                }
                Err(e) => {
                    let delay = backoff.on_failure(&mut batch_blocks);
                    warn!(error = %e, ?delay, batch_blocks, "leaf batch failed, shrinking");
                    if wait_or_stop(&mut stop, delay).await {
                        return;
                    }
                }
            }
            if *stop.borrow() {
                return;
            }
        }
        if wait_or_stop(&mut stop, discovery.config.poll_interval).await {
            return;
        }
    }
}

/// Monitor 2: the income channel — memo trial decryption over transfers.
async fn income_monitor(
    discovery: Arc<Discovery>,
    batch_tx: mpsc::UnboundedSender<Discovered>,
    mut stop: watch::Receiver<bool>,
) {
    let mut cursor = discovery.config.deploy_block;
    let mut batch_blocks = discovery.config.batch_blocks;
    let mut backoff = Backoff::new(discovery.config.max_backoff);
    info!(from_block = cursor, "income monitor started");

    loop {
        let head = match discovery.chain.latest_block().await {
            Ok(head) => head,
            Err(_) => {
                let delay = backoff.on_failure(&mut batch_blocks);
                if wait_or_stop(&mut stop, delay).await {
                    return;
                }
                continue;
            }
        };
        while cursor <= head {
            let to = (cursor + batch_blocks - 1).min(head);
            match discovery.chain.transfer_events(cursor, to).await {
                Ok(mut events) => {
                    backoff.on_success();
                    // per-monitor ordering: leaf-index order
                    events.sort_by_key(|e| e.leaf_indices[0]);
                    for event in &events {
                        for discovered in discovery.scan_transfer(event) {
                            if batch_tx.send(discovered).is_err() {
                                return;
                            }
                        }
                    }
                    cursor = to + 1;
                }
                Err(e) => {
                    let delay = backoff.on_failure(&mut batch_blocks);
                    warn!(error = %e, ?delay, "transfer batch failed, shrinking");
                    if wait_or_stop(&mut stop, delay).await {
                        return;
                    }
                }
            }
            if *stop.borrow() {
                return;
            }
        }
        if wait_or_stop(&mut stop, discovery.config.poll_interval).await {
            return;
        }
    }
}

/// Monitor 3: unshields settling to our public wallet.
async fn settlement_monitor(discovery: Arc<Discovery>, mut stop: watch::Receiver<bool>) {
    let watch_addr = discovery.config.recipient_watch;
    if watch_addr == Address::ZERO {
        return;
    }
    let mut cursor = discovery.config.deploy_block;
    let mut batch_blocks = discovery.config.batch_blocks;
    let mut backoff = Backoff::new(discovery.config.max_backoff);
    info!(recipient = %watch_addr, "settlement monitor started");

    loop {
        let head = match discovery.chain.latest_block().await {
            Ok(head) => head,
            Err(_) => {
                let delay = backoff.on_failure(&mut batch_blocks);
                if wait_or_stop(&mut stop, delay).await {
                    return;
                }
                continue;
            }
        };
        while cursor <= head {
            let to = (cursor + batch_blocks - 1).min(head);
            match discovery.chain.unshield_events(cursor, to).await {
                Ok(events) => {
                    backoff.on_success();
                    for event in events.iter().filter(|e| e.recipient == watch_addr) {
                        let key = SeenKey {
                            commitment: FrHex(event.nullifier),
                            tx_hash: event.tx_hash,
                        };
                        let mut store = lock(&discovery.store);
                        if store.seen_contains(&key) {
                            continue;
                        }
                        if let Err(e) = store.record_seen(key) {
                            warn!(error = %e, "failed to persist dedup key");
                        }
                        drop(store);
                        discovery.notifier.notify(WalletEvent::UnshieldSettled {
                            recipient: event.recipient,
                            token: event.token,
                            amount: event.amount,
                            tx_hash: event.tx_hash,
                        });
                    }
                    cursor = to + 1;
                }
                Err(e) => {
                    let delay = backoff.on_failure(&mut batch_blocks);
                    warn!(error = %e, ?delay, "unshield batch failed, shrinking");
                    if wait_or_stop(&mut stop, delay).await {
                        return;
                    }
                }
            }
            if *stop.borrow() {
                return;
            }
        }
        if wait_or_stop(&mut stop, discovery.config.poll_interval).await {
            return;
        }
    }
}

/// The batcher: collects discovered notes, flushes one notification per
/// token when the window closes — or immediately on stop.
async fn batcher(
    discovery: Arc<Discovery>,
    mut rx: mpsc::UnboundedReceiver<Discovered>,
    mut stop: watch::Receiver<bool>,
) {
    let window = discovery.config.batch_window;
    let mut pending: Vec<Discovered> = Vec::new();

    loop {
        if pending.is_empty() {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(item) => pending.push(item),
                    None => break,
                },
                _ = stop.changed() => {
                    if *stop.borrow() { break; }
                }
            }
        } else {
            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    item = rx.recv() => match item {
                        Some(item) => pending.push(item),
                        None => { flush(&discovery, &mut pending); return; }
                    },
                    _ = &mut deadline => {
                        flush(&discovery, &mut pending);
                        break;
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            // cancellation flushes; no notification is lost
                            flush(&discovery, &mut pending);
                            return;
                        }
                    }
                }
            }
        }
        if *stop.borrow() {
            flush(&discovery, &mut pending);
            return;
        }
    }
    flush(&discovery, &mut pending);
}

fn flush(discovery: &Discovery, pending: &mut Vec<Discovered>) {
    if pending.is_empty() {
        return;
    }
    info!(count = pending.len(), "flushing discovery batch");
    // coalesce per token, observation order preserved within a group
    let mut groups: Vec<(TokenInfo, Vec<Note>)> = Vec::new();
    for item in pending.drain(..) {
        let token = discovery.resolve_token(item.note.token_address_or_native());
        match groups.iter_mut().find(|(t, _)| t.address == token.address) {
            Some((_, notes)) => notes.push(item.note),
            None => groups.push((token, vec![item.note])),
        }
    }
    for (token, notes) in groups {
        discovery
            .notifier
            .notify(WalletEvent::NotesDiscovered { token, notes });
    }
    discovery.notifier.notify(WalletEvent::StateChanged);
}
