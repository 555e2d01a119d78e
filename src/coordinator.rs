//! Coordinator: owns every component and wires the pipeline
//! mempool -> decoder -> engines -> validator -> builder -> submitter ->
//! store, with the oracle and gas tracker feeding all stages and the risk
//! governor gating submission. Components talk over bounded channels; a
//! watch channel fans out shutdown.

use alloy::primitives::U256;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::arbitrage_engine::{ArbitrageConfig, ArbitrageEngine};
use crate::bundle_builder::{BuildContext, BuilderConfig, BundleBuilder};
use crate::chain_adapter::{AdapterEvent, ChainAdapter};
use crate::config::{native_decimals, BotConfig};
use crate::constants::{PRECOMPUTE_RESERVE_DELTA_BPS, WSOL_MINT, WS_RECONNECT_CEILING_MS};
use crate::copy_engine::{CopyEngine, CopyEngineConfig};
use crate::error::{BotError, BotResult};
use crate::evm_client::EvmClient;
use crate::gas_tracker::GasTracker;
use crate::mempool_monitor::MempoolMonitor;
use crate::opportunity_core::{AdmitOutcome, OpportunityCore, OpportunityThresholds};
use crate::pool_registry::{v2_pair_address, PoolRegistry};
use crate::price_oracle::{PriceOracle, PriceQuote};
use crate::relay_client::RelayClient;
use crate::relay_submitter::{RelaySubmitter, SubmitOutcome};
use crate::risk_governor::{RiskGovernor, RiskLimits};
use crate::route_engine::RouteEngine;
use crate::sandwich_engine::{SandwichConfig, SandwichEngine, SandwichPlan};
use crate::slippage_validator::{SlippageValidator, ValidatorConfig};
use crate::solana_client::SolanaClient;
use crate::store::{persist_risk_events, Store};
use crate::tx_decoder::{DecodeOutcome, TxDecoder};
use crate::types::{
    ChainId, Opportunity, OpportunityStatus, Pool, PoolKey, PoolState, Protocol, RelayKind,
    StrategyKind, TokenRef, TradeIntent,
};
use crate::wallet::WalletManager;

/// Priority tokens for route precomputation: the wrapped native token of
/// each enabled chain.
fn priority_tokens(chains: &[ChainId]) -> HashMap<ChainId, Vec<String>> {
    let mut map = HashMap::new();
    for chain in chains {
        let tokens = match chain {
            ChainId::Ethereum => vec!["0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2".to_string()],
            ChainId::Bsc => vec!["0xbb4cdb9cbd36b01bd1cbaebf2de08d9173bc095c".to_string()],
            ChainId::Solana => vec![WSOL_MINT.to_string()],
        };
        map.insert(*chain, tokens);
    }
    map
}

pub struct Coordinator {
    config: BotConfig,
    chains: Vec<ChainId>,
    adapters: HashMap<ChainId, Arc<ChainAdapter>>,
    registry: Arc<PoolRegistry>,
    route_engine: Arc<RouteEngine>,
    oracle: Arc<PriceOracle>,
    gas_tracker: Arc<GasTracker>,
    monitor: Arc<MempoolMonitor>,
    decoder: Arc<TxDecoder>,
    validator: Arc<SlippageValidator>,
    opportunity_core: Arc<OpportunityCore>,
    arbitrage: Option<Arc<ArbitrageEngine>>,
    sandwich: Option<Arc<SandwichEngine>>,
    copy: Option<Arc<CopyEngine>>,
    builder: Arc<BundleBuilder>,
    submitter: Arc<RelaySubmitter>,
    governor: Arc<RiskGovernor>,
    store: Store,
    wallet: Arc<WalletManager>,
}

impl Coordinator {
    /// Build every component from validated configuration. Network is not
    /// touched until `run`.
    pub fn new(config: BotConfig) -> BotResult<Self> {
        let chains = config.enabled_chains()?;

        let mut key_sources = HashMap::new();
        for chain in &chains {
            key_sources.insert(*chain, config.key_source(*chain)?.clone());
        }
        let wallet = Arc::new(WalletManager::from_sources(&key_sources)?);

        let mut adapters = HashMap::new();
        for chain in &chains {
            let rpc = config.rpc_endpoint(*chain)?;
            let ws = config.ws_endpoint(*chain)?;
            let adapter = match chain {
                ChainId::Solana => ChainAdapter::Solana(SolanaClient::new(rpc, ws)?),
                evm => ChainAdapter::Evm(EvmClient::new(*evm, rpc, ws)?),
            };
            adapters.insert(*chain, Arc::new(adapter));
        }

        let registry = Arc::new(PoolRegistry::new());
        let route_engine = Arc::new(RouteEngine::new(
            registry.clone(),
            priority_tokens(&chains),
        ));
        let oracle = Arc::new(PriceOracle::new(
            &config.price,
            config.performance.price_cache_ttl_ms,
        )?);
        let gas_tracker = Arc::new(GasTracker::new(
            Duration::from_millis(WS_RECONNECT_CEILING_MS),
            config.performance.gas_predict_horizon_ms,
        ));
        let decoder = Arc::new(TxDecoder::new());

        let target_wallets: HashSet<String> = config
            .copy
            .target_wallets
            .iter()
            .map(|w| w.to_ascii_lowercase())
            .collect();
        let min_value: HashMap<ChainId, u128> = chains
            .iter()
            .map(|c| (*c, 10u128.pow(native_decimals(*c) as u32 - 2)))
            .collect();
        let monitor = Arc::new(MempoolMonitor::new(
            decoder.clone(),
            target_wallets.clone(),
            min_value,
            4_096,
        ));

        let validator = Arc::new(SlippageValidator::new(ValidatorConfig {
            max_price_impact_bps: config.trading.max_slippage_bps,
            oracle_deviation_band_bps: config.trading.oracle_deviation_band_bps,
            min_pool_depth: U256::from(1_000u64),
        }));

        let mut thresholds = HashMap::new();
        for strategy in [
            StrategyKind::Arbitrage,
            StrategyKind::Sandwich,
            StrategyKind::Copy,
        ] {
            thresholds.insert(
                strategy,
                OpportunityThresholds {
                    min_profit_bps: config.trading.min_profit_bps,
                    min_confidence: config.trading.min_confidence,
                },
            );
        }
        let opportunity_core = Arc::new(OpportunityCore::new(
            thresholds,
            Duration::from_millis(config.performance.precompute_interval_ms * 4),
        ));

        // Risk limits in each chain's native units.
        let mut max_position = HashMap::new();
        let mut max_daily_loss = HashMap::new();
        for chain in &chains {
            max_position.insert(*chain, config.max_position_size_wei(*chain)?);
            max_daily_loss.insert(*chain, config.max_daily_loss_wei(*chain)?);
        }
        let governor = Arc::new(RiskGovernor::new(RiskLimits::with_defaults(
            max_position.clone(),
            max_daily_loss,
            config.risk.max_concurrent_bundles,
        )));

        let arbitrage = config.arbitrage.enabled.then(|| {
            Arc::new(ArbitrageEngine::new(ArbitrageConfig {
                max_position: smallest_cap(&max_position),
                max_tip_pct_of_profit: config.trading.max_tip_pct_of_profit,
            }))
        });
        let sandwich = config.sandwich.enabled.then(|| {
            Arc::new(SandwichEngine::new(SandwichConfig {
                max_position: smallest_cap(&max_position),
                max_tip_pct_of_profit: config.trading.max_tip_pct_of_profit,
                min_victim_amount: U256::from(10_000u64),
                default_victim_tolerance_bps: 100,
            }))
        });
        let copy = config.copy.enabled.then(|| {
            Arc::new(CopyEngine::new(CopyEngineConfig {
                target_wallets,
                mirror_bps: (config.copy.mirror_pct * 100.0) as u32,
                max_position: smallest_cap(&max_position),
            }))
        });

        let builder = Arc::new(BundleBuilder::new(
            wallet.clone(),
            BuilderConfig {
                max_tip_pct_of_profit: config.trading.max_tip_pct_of_profit,
                public_fallback: config.relays.public_fallback,
            },
        ));

        let mut relay_endpoints = HashMap::new();
        relay_endpoints.insert(
            RelayKind::Flashbots,
            config
                .relays
                .flashbots_endpoint
                .clone()
                .unwrap_or_else(|| crate::constants::FLASHBOTS_DEFAULT_ENDPOINT.to_string()),
        );
        relay_endpoints.insert(
            RelayKind::Jito,
            config
                .relays
                .jito_block_engine
                .clone()
                .unwrap_or_else(|| crate::constants::JITO_DEFAULT_BLOCK_ENGINE.to_string()),
        );
        relay_endpoints.insert(
            RelayKind::Bloxroute,
            config
                .relays
                .bloxroute_endpoint
                .clone()
                .unwrap_or_else(|| crate::constants::BLOXROUTE_DEFAULT_ENDPOINT.to_string()),
        );
        if let Some(endpoint) = &config.relays.nodereal_endpoint {
            relay_endpoints.insert(RelayKind::Nodereal, endpoint.clone());
        }
        let relay_client = Arc::new(RelayClient::new(relay_endpoints, wallet.clone())?);
        let submitter = Arc::new(RelaySubmitter::new(relay_client, governor.clone()));

        let store = Store::open(
            &config.persistence.db_path,
            config.persistence.backup_dir.as_deref(),
            config
                .persistence
                .encryption_enabled
                .then(|| std::env::var(crate::wallet::MASTER_PASSWORD_ENV))
                .transpose()
                .map_err(|_| {
                    BotError::Config(format!(
                        "encryption enabled but {} not set",
                        crate::wallet::MASTER_PASSWORD_ENV
                    ))
                })?,
        )?;

        // Durable kill semantics: re-apply unacknowledged kills.
        for scope in store.active_kill_scopes()? {
            warn!("restoring persisted kill for {}", scope.as_str());
            governor.restore_kill(&scope);
        }

        Ok(Self {
            config,
            chains,
            adapters,
            registry,
            route_engine,
            oracle,
            gas_tracker,
            monitor,
            decoder,
            validator,
            opportunity_core,
            arbitrage,
            sandwich,
            copy,
            builder,
            submitter,
            governor,
            store,
            wallet,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Run until the shutdown signal flips. Spawns the subscription tasks,
    /// the decode workers, and the periodic timers, then serves the event
    /// loop on this task.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> BotResult<()> {
        let (event_tx, mut event_rx) = mpsc::channel::<AdapterEvent>(4_096);
        let (intent_tx, mut intent_rx) = mpsc::channel::<TradeIntent>(1_024);

        let mut tasks = Vec::new();
        for (chain, adapter) in &self.adapters {
            info!("▶️ starting {chain} subscriptions");
            tasks.push(adapter.spawn_subscriptions(event_tx.clone()));
        }
        self.route_engine.precompute();
        crate::route_engine::log_engine_ready(&self.route_engine);

        // Decoder worker pool: CPU-bound decode off the event loop.
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(8);
        for _ in 0..workers {
            let monitor = self.monitor.clone();
            let decoder = self.decoder.clone();
            let intent_tx = intent_tx.clone();
            let mut worker_shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    if *worker_shutdown.borrow() {
                        return;
                    }
                    let Some(tx) = monitor.pop_next() else {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(5)) => continue,
                            _ = worker_shutdown.changed() => return,
                        }
                    };
                    match decoder.decode(&tx) {
                        DecodeOutcome::Decoded(intent) => {
                            if intent_tx.send(intent).await.is_err() {
                                return;
                            }
                        }
                        DecodeOutcome::Ignored => {}
                        DecodeOutcome::Undecodable { reason, .. } => {
                            debug!("undecodable tx {}: {reason}", tx.hash);
                        }
                    }
                }
            }));
        }

        // Periodic timers.
        let mut precompute = tokio::time::interval(Duration::from_millis(
            self.config.performance.precompute_interval_ms,
        ));
        let mut gas_poll = tokio::time::interval(Duration::from_secs(3));
        let mut pool_refresh = tokio::time::interval(Duration::from_secs(2));
        let mut sweep = tokio::time::interval(Duration::from_millis(500));
        let mut housekeeping = tokio::time::interval(Duration::from_secs(3600));

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                Some(event) = event_rx.recv() => {
                    self.handle_adapter_event(event).await;
                }
                Some(intent) = intent_rx.recv() => {
                    if let Err(e) = self.handle_intent(intent).await {
                        debug!("intent handling failed: {e}");
                    }
                }
                _ = precompute.tick() => {
                    self.route_engine.precompute();
                    if let Err(e) = self.evaluate_arbitrage_cycles().await {
                        debug!("cycle evaluation failed: {e}");
                    }
                }
                _ = gas_poll.tick() => {
                    for (chain, adapter) in &self.adapters {
                        match adapter.get_fee_data().await {
                            Ok(fee) => self.gas_tracker.record(&fee),
                            Err(e) => debug!("fee poll failed on {chain}: {e}"),
                        }
                    }
                }
                _ = pool_refresh.tick() => {
                    self.refresh_evm_pools().await;
                }
                _ = sweep.tick() => {
                    for id in self.opportunity_core.expire_sweep() {
                        let _ = self.store.update_opportunity_status(
                            id,
                            OpportunityStatus::Expired,
                            None,
                        );
                    }
                    self.flush_risk_events();
                }
                _ = housekeeping.tick() => {
                    if let Err(e) = self.store.prune_telemetry() {
                        warn!("telemetry prune failed: {e}");
                    }
                    if let Err(e) = self.store.backup() {
                        warn!("backup failed: {e}");
                    }
                    self.opportunity_core.prune_terminal(Duration::from_secs(3600));
                }
            }
        }

        info!("⏹️ coordinator draining: stopping intake, flushing store");
        for task in &tasks {
            task.abort();
        }
        self.flush_risk_events();
        Ok(())
    }

    async fn handle_adapter_event(&self, event: AdapterEvent) {
        match event {
            AdapterEvent::PendingTx(tx) => {
                self.monitor.offer(tx);
            }
            AdapterEvent::NewBlock(header) => {
                self.registry.on_new_head(header.chain, header.number);
                if let Some(base_fee) = header.base_fee_per_gas {
                    self.gas_tracker.record_base_fee(header.chain, base_fee);
                }
            }
            AdapterEvent::Reorg {
                from_height,
                to_height,
            } => {
                warn!("🔀 reorg observed {from_height}..={to_height}; pools re-marked");
                // Reserves observed inside the reorged range are suspect;
                // the staleness sweep on the next head refreshes them.
            }
            AdapterEvent::Resync { height } => {
                info!("🔁 resync checkpoint at height {height}");
            }
        }
    }

    /// A decoded trade intent: victim candidate for the sandwich engine and
    /// copy signal for the copy engine.
    async fn handle_intent(&self, intent: TradeIntent) -> BotResult<()> {
        let started = Instant::now();
        self.ensure_pools_for_intent(&intent);
        let snapshot = self.registry.snapshot();
        let oracle_quotes = self.oracle_quotes_for_intent(&intent).await;
        let decimals = self.token_decimals(&snapshot);

        if let Some(copy) = &self.copy {
            if copy.is_target(&intent.sender) {
                if let Some(opportunity) =
                    copy.mirror_intent(&intent, &snapshot, &self.validator, &oracle_quotes, &decimals)?
                {
                    self.drive_opportunity(opportunity, None, None).await?;
                }
                return Ok(());
            }
        }

        if let Some(sandwich) = &self.sandwich {
            let fee = self
                .gas_tracker
                .optimize(intent.chain, crate::types::SpeedTarget::Urgent)
                .unwrap_or(crate::chain_adapter::FeeData {
                    chain: intent.chain,
                    base_fee: 0,
                    priority_fee: 0,
                    observed_at: chrono::Utc::now(),
                });
            let native_usd = self.native_usd(intent.chain, &oracle_quotes);
            if let Some((opportunity, plan)) = sandwich.analyze_intent(
                &intent,
                &snapshot,
                &self.validator,
                &oracle_quotes,
                &decimals,
                &fee,
                native_usd,
            )? {
                let victim_raw = intent_victim_raw(&intent);
                self.drive_opportunity(opportunity, Some(plan), victim_raw)
                    .await?;
            }
        }

        let elapsed = started.elapsed().as_secs_f64() * 1_000.0;
        let _ = self
            .store
            .record_telemetry(&[], &[], &[("intent".into(), intent.chain, elapsed)]);
        Ok(())
    }

    /// Evaluate precomputed cycles for every enabled chain.
    async fn evaluate_arbitrage_cycles(&self) -> BotResult<()> {
        let Some(arbitrage) = &self.arbitrage else {
            return Ok(());
        };
        let snapshot = self.registry.snapshot();
        let decimals = self.token_decimals(&snapshot);
        for chain in &self.chains {
            let bases = priority_tokens(&[*chain]);
            let Some(bases) = bases.get(chain) else {
                continue;
            };
            let Ok(fee) = self
                .gas_tracker
                .optimize(*chain, crate::types::SpeedTarget::Fast)
            else {
                continue;
            };
            for base in bases {
                for route in self.route_engine.precomputed_cycles(*chain, base) {
                    let oracle_quotes = self.oracle_quotes_for_route(&route).await;
                    let native_usd = self.native_usd(*chain, &oracle_quotes);
                    let head = self.registry.head_height(*chain).unwrap_or(0);
                    if let Some(opportunity) = arbitrage.evaluate_cycle(
                        &route,
                        &snapshot,
                        &self.validator,
                        &oracle_quotes,
                        &decimals,
                        &fee,
                        native_usd,
                        U256::ZERO,
                        head,
                    )? {
                        self.drive_opportunity(opportunity, None, None).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Admission through settlement for one opportunity.
    async fn drive_opportunity(
        &self,
        opportunity: Opportunity,
        plan: Option<SandwichPlan>,
        victim_raw: Option<Vec<u8>>,
    ) -> BotResult<()> {
        let (outcome, id) = self.opportunity_core.admit(opportunity.clone());
        let Some(id) = id else {
            if outcome != AdmitOutcome::DuplicateFingerprint {
                debug!("opportunity not admitted: {outcome:?}");
            }
            return Ok(());
        };
        self.store.record_opportunity(&opportunity)?;

        // The engines validated against their own snapshot; mark Validated
        // and move to execution.
        self.opportunity_core
            .transition(id, OpportunityStatus::Validated)?;
        self.store
            .update_opportunity_status(id, OpportunityStatus::Validated, None)?;

        let chain = opportunity.chain;
        let adapter = self
            .adapters
            .get(&chain)
            .ok_or_else(|| BotError::Fatal(format!("no adapter for {chain}")))?
            .clone();

        // Build context: fees, target and signer state, all inside the
        // strategy's latency budget.
        let budget = Duration::from_millis(self.config.performance.latency_budget_ms.max(10));
        let fee = self
            .gas_tracker
            .optimize(chain, speed_for(opportunity.strategy))?;
        let (head, chain_nonce, recent_blockhash) = tokio::time::timeout(budget, async {
            let head = adapter.current_height().await?;
            let pair = match adapter.as_ref() {
                ChainAdapter::Evm(_) => {
                    let account = adapter.query_account(&self.wallet.address(chain)?).await?;
                    (account.nonce, None)
                }
                ChainAdapter::Solana(client) => (None, Some(client.latest_blockhash().await?)),
            };
            Ok::<_, BotError>((head, pair.0, pair.1))
        })
        .await
        .map_err(|_| BotError::Timeout(budget))??;
        let target = head + 1;
        let ctx = BuildContext {
            fee,
            target_block_or_slot: target,
            chain_nonce,
            recent_blockhash,
        };

        let mut bundle = match self
            .builder
            .build(&opportunity, plan.as_ref(), victim_raw.as_deref(), &ctx)
        {
            Ok(bundle) => bundle,
            Err(e) => {
                self.opportunity_core
                    .transition(id, OpportunityStatus::Rejected)?;
                self.store.update_opportunity_status(
                    id,
                    OpportunityStatus::Rejected,
                    Some("build_failed"),
                )?;
                return Err(e);
            }
        };
        self.opportunity_core.link_bundle(id, bundle.id)?;
        self.opportunity_core
            .transition(id, OpportunityStatus::Executing)?;
        self.store
            .update_opportunity_status(id, OpportunityStatus::Executing, None)?;
        self.store.record_execution(&bundle)?;

        let entry_token = opportunity
            .route
            .hops
            .first()
            .map(|h| h.token_in.clone())
            .unwrap_or_default();
        let result = self
            .submitter
            .execute(
                &mut bundle,
                opportunity.required_capital,
                &entry_token,
                adapter.as_ref(),
            )
            .await;
        self.store.record_execution(&bundle)?;

        match result {
            Ok(SubmitOutcome::Included { height, .. }) => {
                self.opportunity_core
                    .transition(id, OpportunityStatus::Landed)?;
                self.store
                    .update_opportunity_status(id, OpportunityStatus::Landed, None)?;
                // Realized profit refines later from fills; the expected
                // value stands in until then.
                let realized = bundle
                    .simulated_profit_native
                    .unwrap_or_else(|| expected_as_i128(&opportunity));
                bundle.actual_profit_native = Some(realized);
                self.store.settle_execution(
                    bundle.id,
                    realized,
                    opportunity.expected_profit_usd,
                    0,
                )?;
                self.governor.record_outcome(
                    chain,
                    opportunity.strategy,
                    &entry_token,
                    opportunity.required_capital,
                    realized,
                    true,
                );
                info!(
                    "🏁 {} opportunity {id} landed at {height} (+{realized} native)",
                    opportunity.strategy
                );
            }
            Ok(SubmitOutcome::Expired) => {
                self.opportunity_core
                    .transition(id, OpportunityStatus::Expired)?;
                self.store
                    .update_opportunity_status(id, OpportunityStatus::Expired, None)?;
                self.governor.record_outcome(
                    chain,
                    opportunity.strategy,
                    &entry_token,
                    opportunity.required_capital,
                    0,
                    false,
                );
            }
            Ok(SubmitOutcome::Failed { reason }) | Err(BotError::Submission(reason)) => {
                self.fail_opportunity(id, &opportunity, &entry_token, &reason)?;
            }
            Err(BotError::RiskBlocked(reason)) => {
                self.opportunity_core
                    .transition(id, OpportunityStatus::Rejected)?;
                self.store.update_opportunity_status(
                    id,
                    OpportunityStatus::Rejected,
                    Some("risk_blocked"),
                )?;
                debug!("opportunity {id} risk-blocked: {reason}");
            }
            Err(BotError::Simulation(reason)) => {
                self.fail_opportunity(id, &opportunity, &entry_token, &reason)?;
            }
            Err(e) => {
                self.fail_opportunity(id, &opportunity, &entry_token, &e.to_string())?;
            }
        }
        self.flush_risk_events();
        Ok(())
    }

    fn fail_opportunity(
        &self,
        id: uuid::Uuid,
        opportunity: &Opportunity,
        entry_token: &str,
        reason: &str,
    ) -> BotResult<()> {
        self.opportunity_core
            .transition(id, OpportunityStatus::Rejected)?;
        self.store
            .update_opportunity_status(id, OpportunityStatus::Rejected, Some(reason))?;
        self.governor.record_outcome(
            opportunity.chain,
            opportunity.strategy,
            entry_token,
            opportunity.required_capital,
            0,
            false,
        );
        Ok(())
    }

    /// Persist any pending risk events; kill events must hit disk before
    /// further submission work proceeds.
    fn flush_risk_events(&self) {
        let events = self.governor.take_events();
        if events.is_empty() {
            return;
        }
        if let Err(e) = persist_risk_events(&self.store, &events) {
            // A failing risk write halts new submissions by policy.
            error!("risk event persistence failed: {e}");
            self.governor
                .emergency_kill(crate::types::RiskScope::Global, "risk event write failure");
        }
    }

    /// Pool discovery on first reference: derive the CREATE2 pair address
    /// for every path window of a v2 intent and register unknown pools as
    /// stale placeholders; the scheduled refresher fills their state.
    fn ensure_pools_for_intent(&self, intent: &TradeIntent) {
        if !intent.chain.is_evm() || intent.protocol != Protocol::UniswapV2 {
            return;
        }
        for window in intent.path.windows(2) {
            let Ok(pair) = v2_pair_address(intent.chain, &window[0], &window[1]) else {
                continue;
            };
            let Ok(key) = PoolKey::new(intent.chain, Protocol::UniswapV2, &pair) else {
                continue;
            };
            if self.registry.get(&key).is_some() {
                continue;
            }
            let (first, second) = if window[0] <= window[1] {
                (&window[0], &window[1])
            } else {
                (&window[1], &window[0])
            };
            let (Ok(token_a), Ok(token_b)) = (
                TokenRef::new(intent.chain, first, 18),
                TokenRef::new(intent.chain, second, 18),
            ) else {
                continue;
            };
            debug!("🆕 discovered pool {key} from {}", intent.source_tx_hash);
            self.registry.upsert(Pool {
                key,
                token_a,
                token_b,
                fee_bps: 30,
                state: PoolState::V2 {
                    reserve_a: U256::ZERO,
                    reserve_b: U256::ZERO,
                },
                last_observed_block: 0,
                stale: true,
            });
        }
    }

    /// Scheduled pool refresher: re-read reserves of lagging v2 pools and
    /// force an off-cycle route precompute when a pool moved past the
    /// reserve-delta threshold.
    async fn refresh_evm_pools(&self) {
        const MAX_REFRESH_PER_TICK: usize = 32;
        let snapshot = self.registry.snapshot();
        let mut max_delta = 0u32;
        let mut refreshed = 0usize;
        for pool in snapshot.values() {
            if refreshed >= MAX_REFRESH_PER_TICK {
                break;
            }
            if !pool.key.chain.is_evm() || pool.key.protocol != Protocol::UniswapV2 {
                continue;
            }
            let head = self.registry.head_height(pool.key.chain).unwrap_or(0);
            let lag = head.saturating_sub(pool.last_observed_block);
            if !pool.stale && lag <= pool.key.chain.stale_threshold_blocks() / 2 {
                continue;
            }
            let Some(adapter) = self.adapters.get(&pool.key.chain) else {
                continue;
            };
            let ChainAdapter::Evm(client) = adapter.as_ref() else {
                continue;
            };
            match client.v2_pool_state(&pool.key.address).await {
                Ok(observation) => {
                    refreshed += 1;
                    let a_is_token0 = pool.token_a.address == observation.token0;
                    let (reserve_a, reserve_b) = if a_is_token0 {
                        (observation.reserve0, observation.reserve1)
                    } else {
                        (observation.reserve1, observation.reserve0)
                    };
                    let delta = if pool.last_observed_block == 0 {
                        // First fill: also resolve real token decimals.
                        let dec_a = client.erc20_decimals(&pool.token_a.address).await;
                        let dec_b = client.erc20_decimals(&pool.token_b.address).await;
                        let mut filled = pool.clone();
                        filled.token_a.decimals = dec_a;
                        filled.token_b.decimals = dec_b;
                        filled.state = PoolState::V2 {
                            reserve_a,
                            reserve_b,
                        };
                        filled.last_observed_block = observation.block;
                        filled.stale = false;
                        self.registry.upsert(filled)
                    } else {
                        self.registry.update_state(
                            &pool.key,
                            PoolState::V2 {
                                reserve_a,
                                reserve_b,
                            },
                            observation.block,
                        )
                    };
                    max_delta = max_delta.max(delta);
                }
                Err(e) => debug!("pool refresh failed for {}: {e}", pool.key),
            }
        }
        if max_delta >= PRECOMPUTE_RESERVE_DELTA_BPS {
            debug!("🧭 reserve delta {max_delta} bps triggered off-cycle precompute");
            self.route_engine.precompute();
        }
    }

    async fn oracle_quotes_for_intent(&self, intent: &TradeIntent) -> HashMap<String, PriceQuote> {
        self.oracle.get_batch(&intent.path).await
    }

    async fn oracle_quotes_for_route(
        &self,
        route: &crate::types::Route,
    ) -> HashMap<String, PriceQuote> {
        let mut tokens: Vec<String> = Vec::new();
        for hop in &route.hops {
            for token in [&hop.token_in, &hop.token_out] {
                if !tokens.contains(token) {
                    tokens.push(token.clone());
                }
            }
        }
        self.oracle.get_batch(&tokens).await
    }

    fn token_decimals(
        &self,
        snapshot: &crate::pool_registry::PoolSnapshot,
    ) -> HashMap<String, u8> {
        let mut decimals = HashMap::new();
        for pool in snapshot.values() {
            decimals.insert(pool.token_a.address.clone(), pool.token_a.decimals);
            decimals.insert(pool.token_b.address.clone(), pool.token_b.decimals);
        }
        decimals
    }

    fn native_usd(&self, chain: ChainId, quotes: &HashMap<String, PriceQuote>) -> f64 {
        let wrapped = match chain {
            ChainId::Ethereum => "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2",
            ChainId::Bsc => "0xbb4cdb9cbd36b01bd1cbaebf2de08d9173bc095c",
            ChainId::Solana => WSOL_MINT,
        };
        quotes.get(wrapped).map(|q| q.price_usd).unwrap_or(0.0)
    }
}

fn smallest_cap(caps: &HashMap<ChainId, U256>) -> U256 {
    caps.values().copied().min().unwrap_or(U256::ZERO)
}

fn speed_for(strategy: StrategyKind) -> crate::types::SpeedTarget {
    match strategy {
        StrategyKind::Sandwich => crate::types::SpeedTarget::Urgent,
        StrategyKind::Arbitrage => crate::types::SpeedTarget::Fast,
        StrategyKind::Copy => crate::types::SpeedTarget::Standard,
    }
}

fn expected_as_i128(opportunity: &Opportunity) -> i128 {
    i128::try_from(opportunity.expected_profit_native).unwrap_or(i128::MAX)
}

/// The victim's raw bytes ride on the intent when the feed delivered them
/// (Solana always; EVM when the node exposes raw transactions). Without
/// them the sandwich path fails closed at build time.
fn intent_victim_raw(intent: &TradeIntent) -> Option<Vec<u8>> {
    intent.source_raw.clone()
}
