//! Trident: shared execution core for multi-strategy on-chain trading.
//!
//! This library provides:
//! - Mempool ingestion and protocol decoding across Ethereum, BSC and Solana
//! - A precomputed route/opportunity engine with sub-millisecond fast-path
//!   lookups
//! - Slippage validation on exact AMM math with multi-oracle cross-checks
//! - Atomic bundle construction and privileged relay submission (Flashbots,
//!   Jito, BloxRoute/NodeReal) with landing monitoring
//! - A risk governor with durable kill-switch state and an embedded
//!   transactional store for opportunities, executions and telemetry

pub mod amm_math;
pub mod arbitrage_engine;
pub mod bundle_builder;
pub mod chain_adapter;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod copy_engine;
pub mod error;
pub mod evm_client;
pub mod gas_tracker;
pub mod mempool_monitor;
pub mod opportunity_core;
pub mod pool_registry;
pub mod price_oracle;
pub mod relay_client;
pub mod relay_submitter;
pub mod retry;
pub mod risk_governor;
pub mod route_engine;
pub mod sandwich_engine;
pub mod slippage_validator;
pub mod solana_client;
pub mod store;
pub mod tx_decoder;
pub mod types;
pub mod wallet;

// Re-export main types for convenience
pub use arbitrage_engine::{ArbitrageConfig, ArbitrageEngine, ArbitrageStats};
pub use bundle_builder::{BuildContext, BuilderConfig, BundleBuilder, NonceManager};
pub use chain_adapter::{
    AccountInfo, AdapterEvent, BlockHeader, ChainAdapter, FeeData, PendingTx, SimulationOutcome,
};
pub use config::{BotConfig, PrivateKeySource};
pub use coordinator::Coordinator;
pub use copy_engine::{CopyEngine, CopyEngineConfig, CopyEngineStats};
pub use error::{BotError, BotResult};
pub use gas_tracker::{GasEstimate, GasPrediction, GasTracker};
pub use mempool_monitor::{MempoolMonitor, MonitorStats, Offered};
pub use opportunity_core::{AdmitOutcome, OpportunityCore, OpportunityThresholds};
pub use pool_registry::{PoolRegistry, PoolSnapshot};
pub use price_oracle::{PriceOracle, PriceQuote};
pub use relay_client::RelayClient;
pub use relay_submitter::{RelaySubmitter, SubmitOutcome, SubmitterStats};
pub use risk_governor::{RiskDecision, RiskGovernor, RiskLimits};
pub use route_engine::RouteEngine;
pub use sandwich_engine::{SandwichConfig, SandwichEngine, SandwichPlan, SandwichStats};
pub use slippage_validator::{RejectReason, SlippageValidator, ValidationResult, ValidatorConfig};
pub use store::{Store, TodayStats};
pub use tx_decoder::{DecodeOutcome, TxDecoder};
pub use types::{
    Bundle, BundleStatus, ChainId, Opportunity, OpportunityStatus, Pool, PoolKey, PoolState,
    Protocol, RelayKind, RiskEvent, RiskScope, RiskSeverity, Route, RouteHop, SpeedTarget,
    StrategyKind, TokenRef, TradeIntent,
};
pub use wallet::WalletManager;
