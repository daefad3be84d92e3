//! Cross-component scenarios against an in-memory pool.
//!
//! The mock pool plays the contract (tree, nullifier set, event log), the
//! mock relayer applies state transitions the way the real one would, and
//! the engine under test is the real thing: planner, witness builders,
//! store, vault, discovery.

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use alloy::primitives::{Address, B256, U256};
    use async_trait::async_trait;

    use zdoge_lib::chain::{PoolClient, ShieldEvent, SwapEvent, TransferEvent, UnshieldEvent};
    use zdoge_lib::error::{ChainError, EngineError, ProveError, RelayerError};
    use zdoge_lib::field::{fr_from_bytes, fr_to_bytes, keccak256};
    use zdoge_lib::relayer::{Relay, SwapReceipt, TransferReceipt, UnshieldReceipt};
    use zdoge_lib::witness::{CircuitInputs, SwapWitness, TransferWitness, UnshieldWitness};
    use zdoge_lib::{
        parse_amount, DiscoveryConfig, EngineConfig, Fr, Notifier, PoolTree, Prover, RelayerQuote,
        TokenInfo, TxRequest, WalletConnector, WalletEngine, WalletEvent,
    };

    fn units(x: &str) -> U256 {
        parse_amount(x, 18).unwrap()
    }

    fn usdc() -> TokenInfo {
        TokenInfo {
            address: "0x2222222222222222222222222222222222222222".parse().unwrap(),
            symbol: "USDC".into(),
            decimals: 18,
        }
    }

    // -- mock pool ------------------------------------------------------

    struct PoolState {
        tree: PoolTree,
        nullifiers: HashSet<[u8; 32]>,
        shields: Vec<ShieldEvent>,
        transfers: Vec<TransferEvent>,
        unshields: Vec<UnshieldEvent>,
        swaps: Vec<SwapEvent>,
        balances: HashMap<Address, U256>,
        block: u64,
        tx_counter: u64,
    }

    impl PoolState {
        fn next_tx(&mut self) -> B256 {
            self.block += 1;
            self.tx_counter += 1;
            B256::from(U256::from(self.tx_counter))
        }
    }

    #[derive(Clone)]
    struct MockPool {
        state: Arc<Mutex<PoolState>>,
    }

    impl MockPool {
        fn new() -> Self {
            MockPool {
                state: Arc::new(Mutex::new(PoolState {
                    tree: PoolTree::new(),
                    nullifiers: HashSet::new(),
                    shields: Vec::new(),
                    transfers: Vec::new(),
                    unshields: Vec::new(),
                    swaps: Vec::new(),
                    balances: HashMap::new(),
                    block: 1,
                    tx_counter: 0,
                })),
            }
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
            self.state.lock().unwrap()
        }

        fn apply_shield(&self, commitment: Fr, token: Address, amount: U256) -> B256 {
            let mut state = self.lock();
            let (leaf_index, _) = state.tree.insert(commitment).unwrap();
            let tx_hash = state.next_tx();
            let block = state.block;
            state.shields.push(ShieldEvent {
                commitment,
                leaf_index,
                token,
                amount,
                tx_hash,
                block,
                log_index: 0,
            });
            tx_hash
        }

        fn public_balance(&self, address: Address) -> U256 {
            self.lock().balances.get(&address).copied().unwrap_or_default()
        }

        fn nullifier_count(&self) -> usize {
            self.lock().nullifiers.len()
        }
    }

    #[async_trait]
    impl PoolClient for MockPool {
        async fn latest_block(&self) -> Result<u64, ChainError> {
            Ok(self.lock().block)
        }

        async fn pool_root(&self) -> Result<Fr, ChainError> {
            Ok(self.lock().tree.root())
        }

        async fn next_leaf_index(&self) -> Result<u32, ChainError> {
            Ok(self.lock().tree.leaf_count())
        }

        async fn is_spent(&self, nullifier: Fr) -> Result<bool, ChainError> {
            Ok(self.lock().nullifiers.contains(&fr_to_bytes(&nullifier)))
        }

        async fn get_balance(&self, address: Address) -> Result<U256, ChainError> {
            Ok(self.public_balance(address))
        }

        async fn shield_events(&self, from: u64, to: u64) -> Result<Vec<ShieldEvent>, ChainError> {
            Ok(self
                .lock()
                .shields
                .iter()
                .filter(|e| e.block >= from && e.block <= to)
                .cloned()
                .collect())
        }

        async fn transfer_events(
            &self,
            from: u64,
            to: u64,
        ) -> Result<Vec<TransferEvent>, ChainError> {
            Ok(self
                .lock()
                .transfers
                .iter()
                .filter(|e| e.block >= from && e.block <= to)
                .cloned()
                .collect())
        }

        async fn unshield_events(
            &self,
            from: u64,
            to: u64,
        ) -> Result<Vec<UnshieldEvent>, ChainError> {
            Ok(self
                .lock()
                .unshields
                .iter()
                .filter(|e| e.block >= from && e.block <= to)
                .cloned()
                .collect())
        }

        async fn swap_events(&self, from: u64, to: u64) -> Result<Vec<SwapEvent>, ChainError> {
            Ok(self
                .lock()
                .swaps
                .iter()
                .filter(|e| e.block >= from && e.block <= to)
                .cloned()
                .collect())
        }

        async fn wait_for_receipt(
            &self,
            _tx_hash: B256,
            _confirmations: u64,
        ) -> Result<(), ChainError> {
            Ok(())
        }
    }

    // -- mock relayer ---------------------------------------------------

    #[derive(Clone)]
    struct MockRelay {
        pool: MockPool,
        quote: RelayerQuote,
        /// Reject this many submissions with RootNotFound first.
        reject_roots: Arc<AtomicUsize>,
        /// Report AlreadySpent this many times first.
        reject_spent: Arc<AtomicUsize>,
    }

    impl MockRelay {
        fn new(pool: &MockPool, fee_ppm: u64, min_fee: &str) -> Self {
            MockRelay {
                pool: pool.clone(),
                quote: RelayerQuote {
                    fee_ppm,
                    min_fee: units(min_fee),
                    relayer: "0x9999999999999999999999999999999999999999".parse().unwrap(),
                },
                reject_roots: Arc::new(AtomicUsize::new(0)),
                reject_spent: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn injected_failure(&self) -> Option<RelayerError> {
            if self.reject_roots.load(Ordering::SeqCst) > 0 {
                self.reject_roots.fetch_sub(1, Ordering::SeqCst);
                return Some(RelayerError::RootNotFound);
            }
            if self.reject_spent.load(Ordering::SeqCst) > 0 {
                self.reject_spent.fetch_sub(1, Ordering::SeqCst);
                return Some(RelayerError::AlreadySpent);
            }
            None
        }

        fn check_and_spend(
            state: &mut PoolState,
            root: Fr,
            nullifier: Fr,
        ) -> Result<(), RelayerError> {
            if !state.tree.is_known_root(root) {
                return Err(RelayerError::RootNotFound);
            }
            let key = fr_to_bytes(&nullifier);
            if state.nullifiers.contains(&key) {
                return Err(RelayerError::AlreadySpent);
            }
            state.nullifiers.insert(key);
            Ok(())
        }
    }

    #[async_trait]
    impl Relay for MockRelay {
        async fn quote(&self, _token: &TokenInfo) -> Result<RelayerQuote, RelayerError> {
            Ok(self.quote.clone())
        }

        async fn relay_transfer(
            &self,
            _pool: Address,
            _proof: &[u8],
            witness: &TransferWitness,
        ) -> Result<TransferReceipt, RelayerError> {
            if let Some(err) = self.injected_failure() {
                return Err(err);
            }
            let mut state = self.pool.lock();
            Self::check_and_spend(&mut state, witness.root, witness.nullifier)?;
            let (leaf1, _) = state.tree.insert(witness.out_commitments[0]).unwrap();
            let (leaf2, _) = state.tree.insert(witness.out_commitments[1]).unwrap();
            let tx_hash = state.next_tx();
            let block = state.block;
            state.transfers.push(TransferEvent {
                nullifier: witness.nullifier,
                commitments: witness.out_commitments,
                memos: witness.memos.clone(),
                leaf_indices: [leaf1, leaf2],
                fee: witness.fee,
                tx_hash,
                block,
                log_index: 0,
            });
            Ok(TransferReceipt {
                tx_hash,
                leaf_index1: leaf1,
                leaf_index2: leaf2,
            })
        }

        async fn relay_unshield(
            &self,
            _pool: Address,
            _proof: &[u8],
            witness: &UnshieldWitness,
        ) -> Result<UnshieldReceipt, RelayerError> {
            if let Some(err) = self.injected_failure() {
                return Err(err);
            }
            let mut state = self.pool.lock();
            Self::check_and_spend(&mut state, witness.root, witness.nullifier)?;
            let change_commitment = witness.change_commitment();
            if let Some(change) = change_commitment {
                state.tree.insert(change).unwrap();
            }
            *state.balances.entry(witness.recipient).or_default() += witness.net_amount;
            let tx_hash = state.next_tx();
            let block = state.block;
            state.unshields.push(UnshieldEvent {
                nullifier: witness.nullifier,
                recipient: witness.recipient,
                token: witness.token,
                amount: witness.net_amount,
                relayer: self.quote.relayer,
                fee: witness.fee,
                change_commitment,
                tx_hash,
                block,
                log_index: 0,
            });
            Ok(UnshieldReceipt {
                tx_hash,
                amount_received: witness.net_amount.to_string(),
                fee: witness.fee.to_string(),
            })
        }

        async fn relay_swap(
            &self,
            _pool: Address,
            _proof: &[u8],
            witness: &SwapWitness,
        ) -> Result<SwapReceipt, RelayerError> {
            if let Some(err) = self.injected_failure() {
                return Err(err);
            }
            let mut state = self.pool.lock();
            Self::check_and_spend(&mut state, witness.root, witness.nullifier)?;
            let (leaf1, _) = state.tree.insert(witness.out_commitments[0]).unwrap();
            let (leaf2, _) = state.tree.insert(witness.out_commitments[1]).unwrap();
            let tx_hash = state.next_tx();
            let block = state.block;
            state.swaps.push(SwapEvent {
                nullifier: witness.nullifier,
                token_in: witness.token_in,
                token_out: witness.token_out,
                amount_in: witness.amount_in,
                commitments: witness.out_commitments,
                leaf_indices: [leaf1, leaf2],
                tx_hash,
                block,
                log_index: 0,
            });
            Ok(SwapReceipt {
                tx_hash,
                leaf_index1: leaf1,
                leaf_index2: leaf2,
            })
        }

        async fn is_spent(&self, _pool: Address, nullifier: Fr) -> Result<bool, RelayerError> {
            Ok(self.pool.lock().nullifiers.contains(&fr_to_bytes(&nullifier)))
        }
    }

    // -- mock wallet ----------------------------------------------------

    struct MockWallet {
        seed: u8,
        address: Address,
        pool: MockPool,
    }

    impl MockWallet {
        fn new(seed: u8, pool: &MockPool) -> Self {
            let mut addr = [0u8; 20];
            addr[19] = seed;
            MockWallet {
                seed,
                address: Address::from(addr),
                pool: pool.clone(),
            }
        }
    }

    #[async_trait]
    impl WalletConnector for MockWallet {
        fn address(&self) -> Address {
            self.address
        }

        async fn sign_message(&self, message: &str) -> Result<Vec<u8>, ChainError> {
            // deterministic pseudo-signature: same wallet and message give
            // the same identity across restarts
            let mut seeded = vec![self.seed];
            seeded.extend_from_slice(message.as_bytes());
            let a = keccak256(&seeded);
            let b = keccak256(&a);
            let mut signature = Vec::with_capacity(65);
            signature.extend_from_slice(&a);
            signature.extend_from_slice(&b);
            signature.push(27);
            Ok(signature)
        }

        async fn send_transaction(&self, request: &TxRequest) -> Result<B256, ChainError> {
            let data = &request.data;
            if data.len() >= 4 {
                match [data[0], data[1], data[2], data[3]] {
                    // shieldNative(bytes32)
                    [0xb1, 0x3d, 0x48, 0xf2] => {
                        let commitment = fr_from_bytes(&data[4..36]);
                        return Ok(self
                            .pool
                            .apply_shield(commitment, Address::ZERO, request.value));
                    }
                    // shieldToken(address,uint256,bytes32)
                    [0xc5, 0x6b, 0xda, 0xd8] => {
                        let token = Address::from_slice(&data[16..36]);
                        let amount = U256::from_be_slice(&data[36..68]);
                        let commitment = fr_from_bytes(&data[68..100]);
                        return Ok(self.pool.apply_shield(commitment, token, amount));
                    }
                    // approve(address,uint256): accepted, nothing to mirror
                    [0x09, 0x5e, 0xa7, 0xb3] => {
                        return Ok(B256::ZERO);
                    }
                    _ => {}
                }
            }
            Err(ChainError::Rpc("unexpected transaction".into()))
        }
    }

    // -- stub prover and collecting notifier ----------------------------

    struct StubProver;

    #[async_trait]
    impl Prover for StubProver {
        async fn prove(&self, _inputs: &CircuitInputs) -> Result<Vec<u8>, ProveError> {
            Ok(vec![0xAA; 128])
        }
    }

    #[derive(Clone, Default)]
    struct CollectingNotifier {
        events: Arc<Mutex<Vec<WalletEvent>>>,
    }

    impl Notifier for CollectingNotifier {
        fn notify(&self, event: WalletEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl CollectingNotifier {
        fn discovered_batches(&self) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| matches!(e, WalletEvent::NotesDiscovered { .. }))
                .count()
        }

        fn settled_count(&self) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| matches!(e, WalletEvent::UnshieldSettled { .. }))
                .count()
        }
    }

    // -- engine wiring --------------------------------------------------

    const POOL_ADDR: &str = "0x7777777777777777777777777777777777777777";

    fn scratch_dir(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("zdoge-{tag}-{}", std::process::id()))
    }

    async fn make_engine(
        seed: u8,
        pool: &MockPool,
        relay: &MockRelay,
        notifier: Arc<CollectingNotifier>,
        dir: &Path,
    ) -> WalletEngine {
        let config = EngineConfig {
            chain_id: 2000,
            pool_address: POOL_ADDR.parse().unwrap(),
            deploy_block: 0,
            confirmations: 1,
            data_dir: dir.join(format!("wallet-{seed}")),
            tokens: vec![TokenInfo::native(), usdc()],
            discovery: DiscoveryConfig::default(),
        };
        WalletEngine::init(
            Arc::new(MockWallet::new(seed, pool)),
            Arc::new(pool.clone()),
            Arc::new(relay.clone()),
            Arc::new(StubProver),
            notifier,
            config,
        )
        .await
        .unwrap()
    }

    /// Run the discovery loop long enough for one full pass, then stop.
    /// Stopping flushes the notification batch.
    async fn run_discovery_once(engine: &WalletEngine) {
        let handle = engine.start_discovery();
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.stop_and_join().await;
    }

    // -- scenarios ------------------------------------------------------

    #[tokio::test]
    async fn shield_then_unshield_doge() {
        let dir = scratch_dir("unshield");
        let pool = MockPool::new();
        let relay = MockRelay::new(&pool, 0, "0.1");
        let notifier = Arc::new(CollectingNotifier::default());
        let engine = make_engine(1, &pool, &relay, notifier.clone(), &dir).await;
        let doge = TokenInfo::native();

        // shield 10 DOGE; the leaf confirms on resync
        let (note, _tx) = engine.shield(&doge, units("10")).await.unwrap();
        assert_eq!(note.leaf_index, None);
        engine.resync().await.unwrap();
        assert_eq!(engine.balance(&doge), units("10"));
        assert_eq!(engine.notes()[0].leaf_index, Some(0));

        // unshield the maximum to a public address
        let recipient: Address = "0xab00000000000000000000000000000000000001".parse().unwrap();
        let (max_single, _) = engine.spending_limits(&doge).await.unwrap();
        assert_eq!(max_single, units("9.9"));
        let outcome = engine.unshield(recipient, &doge, max_single).await.unwrap();
        assert_eq!(outcome.net_amount, units("9.9"));
        assert_eq!(outcome.fee, units("0.1"));

        // the note is gone, the nullifier is on-chain, the recipient is paid
        assert!(engine.notes().is_empty());
        assert_eq!(engine.balance(&doge), U256::ZERO);
        assert_eq!(pool.nullifier_count(), 1);
        assert_eq!(pool.public_balance(recipient), units("9.9"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn transfer_with_change_usdc() {
        let dir = scratch_dir("xfer");
        let pool = MockPool::new();
        let relay = MockRelay::new(&pool, 3000, "0.01"); // 0.3%
        let sender = make_engine(
            2,
            &pool,
            &relay,
            Arc::new(CollectingNotifier::default()),
            &dir,
        )
        .await;
        let receiver_events = Arc::new(CollectingNotifier::default());
        let receiver = make_engine(3, &pool, &relay, receiver_events.clone(), &dir).await;
        let token = usdc();

        sender.shield(&token, units("100")).await.unwrap();
        sender.resync().await.unwrap();

        let outcome = sender
            .transfer(&receiver.address(), &token, units("30"))
            .await
            .unwrap();
        assert_eq!(outcome.fee, units("0.09"));
        assert_eq!(outcome.change, units("69.91"));

        // sender keeps exactly the change note, already spendable
        let notes = sender.notes();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].amount, units("69.91"));
        assert!(notes[0].leaf_index.is_some());
        assert_eq!(sender.balance(&token), units("69.91"));

        // the receiver discovers the 30 through the background loop
        run_discovery_once(&receiver).await;
        assert_eq!(receiver.balance(&token), units("30"));
        assert_eq!(receiver_events.discovered_batches(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn consolidation_three_fives() {
        let dir = scratch_dir("consol");
        let pool = MockPool::new();
        let relay = MockRelay::new(&pool, 0, "0.1");
        let engine = make_engine(
            4,
            &pool,
            &relay,
            Arc::new(CollectingNotifier::default()),
            &dir,
        )
        .await;
        let doge = TokenInfo::native();

        for _ in 0..3 {
            engine.shield(&doge, units("5")).await.unwrap();
        }
        engine.resync().await.unwrap();
        assert_eq!(engine.balance(&doge), units("15"));

        // no single note covers 14 + fee → consolidation suggestion
        let recipient: Address = "0xab00000000000000000000000000000000000002".parse().unwrap();
        let err = engine
            .unshield(recipient, &doge, units("14"))
            .await
            .unwrap_err();
        match err {
            EngineError::Operation { source, .. } => {
                assert!(matches!(*source, EngineError::NeedsConsolidation { .. }));
            }
            other => panic!("expected consolidation suggestion, got {other}"),
        }

        // executing it drains all three notes, one transaction each
        let tx_hashes = engine.consolidate(&doge, recipient).await.unwrap();
        assert_eq!(tx_hashes.len(), 3);
        assert!(engine.notes().is_empty());
        assert_eq!(pool.public_balance(recipient), units("14.7"));
        assert_eq!(pool.nullifier_count(), 3);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn discovery_replay_is_idempotent() {
        let dir = scratch_dir("replay");
        let pool = MockPool::new();
        let relay = MockRelay::new(&pool, 0, "0.01");
        let sender = make_engine(
            5,
            &pool,
            &relay,
            Arc::new(CollectingNotifier::default()),
            &dir,
        )
        .await;
        let receiver_events = Arc::new(CollectingNotifier::default());
        let receiver = make_engine(6, &pool, &relay, receiver_events.clone(), &dir).await;
        let doge = TokenInfo::native();

        sender.shield(&doge, units("10")).await.unwrap();
        sender.resync().await.unwrap();
        sender
            .transfer(&receiver.address(), &doge, units("3"))
            .await
            .unwrap();

        // first pass discovers the note
        run_discovery_once(&receiver).await;
        let balance_after_first = receiver.balance(&doge);
        assert_eq!(balance_after_first, units("3"));
        assert_eq!(receiver_events.discovered_batches(), 1);
        let notes_after_first = receiver.notes();

        // a fresh loop re-reads the same history: same state, no second
        // notification (the dedup set survived in the vault)
        run_discovery_once(&receiver).await;
        assert_eq!(receiver.balance(&doge), balance_after_first);
        assert_eq!(receiver.notes(), notes_after_first);
        assert_eq!(receiver_events.discovered_batches(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn swap_creates_both_outputs() {
        let dir = scratch_dir("swap");
        let pool = MockPool::new();
        let relay = MockRelay::new(&pool, 0, "0.1");
        let engine = make_engine(
            7,
            &pool,
            &relay,
            Arc::new(CollectingNotifier::default()),
            &dir,
        )
        .await;
        let doge = TokenInfo::native();
        let token = usdc();

        engine.shield(&doge, units("50")).await.unwrap();
        engine.resync().await.unwrap();

        let outcome = engine
            .swap(&doge, &token, units("20"), units("19.5"))
            .await
            .unwrap();
        assert_eq!(outcome.min_out, units("19.5"));

        // output in USDC plus change in DOGE, both already confirmed
        assert_eq!(engine.balance(&token), units("19.5"));
        assert_eq!(engine.balance(&doge), outcome.change);
        assert!(engine.notes().iter().all(|n| n.leaf_index.is_some()));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn stale_root_walks_the_ladder() {
        let dir = scratch_dir("ladder");
        let pool = MockPool::new();
        let relay = MockRelay::new(&pool, 0, "0.1");
        let engine = make_engine(
            8,
            &pool,
            &relay,
            Arc::new(CollectingNotifier::default()),
            &dir,
        )
        .await;
        let doge = TokenInfo::native();

        // two leaves so one fallback step still has the note in range
        engine.shield(&doge, units("10")).await.unwrap();
        engine.shield(&doge, units("1")).await.unwrap();
        engine.resync().await.unwrap();

        // first submission bounces with "root not found", the retry lands
        // against the previous root
        relay.reject_roots.store(1, Ordering::SeqCst);
        let recipient: Address = "0xab00000000000000000000000000000000000003".parse().unwrap();
        let outcome = engine
            .unshield(recipient, &doge, units("9.9"))
            .await
            .unwrap();
        assert_eq!(outcome.net_amount, units("9.9"));

        // an unbounded stream of rejections surfaces as a stale root
        relay.reject_roots.store(usize::MAX, Ordering::SeqCst);
        let err = engine
            .unshield(recipient, &doge, units("0.5"))
            .await
            .unwrap_err();
        match err {
            EngineError::Operation { source, .. } => {
                assert!(matches!(*source, EngineError::Prove(ProveError::StaleRoot)));
            }
            other => panic!("expected stale root, got {other}"),
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn already_spent_evicts_the_note() {
        let dir = scratch_dir("spent");
        let pool = MockPool::new();
        let relay = MockRelay::new(&pool, 0, "0.1");
        let engine = make_engine(
            9,
            &pool,
            &relay,
            Arc::new(CollectingNotifier::default()),
            &dir,
        )
        .await;
        let doge = TokenInfo::native();

        engine.shield(&doge, units("10")).await.unwrap();
        engine.resync().await.unwrap();
        assert_eq!(engine.notes().len(), 1);

        // the relayer reports the nullifier as already spent: the note is
        // useless whatever our records say, so it is evicted
        relay.reject_spent.store(1, Ordering::SeqCst);
        let recipient: Address = "0xab00000000000000000000000000000000000004".parse().unwrap();
        let err = engine
            .unshield(recipient, &doge, units("9.9"))
            .await
            .unwrap_err();
        match err {
            EngineError::Operation { source, .. } => {
                assert!(matches!(
                    *source,
                    EngineError::Relayer(RelayerError::AlreadySpent)
                ));
            }
            other => panic!("expected already-spent, got {other}"),
        }
        assert!(engine.notes().is_empty());
        assert_eq!(engine.balance(&doge), U256::ZERO);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn unshield_settlement_notification() {
        let dir = scratch_dir("settle");
        let pool = MockPool::new();
        let relay = MockRelay::new(&pool, 0, "0.1");
        let notifier = Arc::new(CollectingNotifier::default());
        let engine = make_engine(10, &pool, &relay, notifier.clone(), &dir).await;
        let doge = TokenInfo::native();

        engine.shield(&doge, units("10")).await.unwrap();
        engine.resync().await.unwrap();

        // unshield to our own public wallet and watch for the settlement
        let own = MockWallet::new(10, &pool).address();
        engine.unshield(own, &doge, units("9.9")).await.unwrap();

        run_discovery_once(&engine).await;
        assert_eq!(notifier.settled_count(), 1);

        // replaying history does not re-notify
        run_discovery_once(&engine).await;
        assert_eq!(notifier.settled_count(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn backup_restores_into_a_fresh_vault() {
        let dir = scratch_dir("backup");
        let pool = MockPool::new();
        let relay = MockRelay::new(&pool, 0, "0.1");
        let engine = make_engine(
            11,
            &pool,
            &relay,
            Arc::new(CollectingNotifier::default()),
            &dir,
        )
        .await;
        let doge = TokenInfo::native();

        engine.shield(&doge, units("7")).await.unwrap();
        engine.resync().await.unwrap();
        let backup = engine.backup().unwrap();

        // same wallet, blank data dir: restore brings the notes back
        let dir2 = scratch_dir("backup2");
        let engine2 = make_engine(
            11,
            &pool,
            &relay,
            Arc::new(CollectingNotifier::default()),
            &dir2,
        )
        .await;
        assert_eq!(engine2.balance(&doge), U256::ZERO);
        engine2.restore(&backup).unwrap();
        assert_eq!(engine2.balance(&doge), units("7"));
        std::fs::remove_dir_all(&dir).ok();
        std::fs::remove_dir_all(&dir2).ok();
    }

    #[tokio::test]
    async fn consolidation_liveness() {
        // after consolidation the user has no spendable notes left and the
        // public side holds the net total
        let dir = scratch_dir("live");
        let pool = MockPool::new();
        let relay = MockRelay::new(&pool, 0, "0.1");
        let engine = make_engine(
            12,
            &pool,
            &relay,
            Arc::new(CollectingNotifier::default()),
            &dir,
        )
        .await;
        let doge = TokenInfo::native();

        for amount in ["2", "3", "4"] {
            engine.shield(&doge, units(amount)).await.unwrap();
        }
        engine.resync().await.unwrap();

        let recipient: Address = "0xab00000000000000000000000000000000000006".parse().unwrap();
        engine.consolidate(&doge, recipient).await.unwrap();
        assert!(engine.notes().is_empty());
        // 1.9 + 2.9 + 3.9
        assert_eq!(pool.public_balance(recipient), units("8.7"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
