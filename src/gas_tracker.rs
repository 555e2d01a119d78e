//! Real-time gas/priority-fee tracking with short-horizon prediction.
//!
//! Each chain owns a ring buffer of fee observations fed by the block
//! subscription (streaming path) and by periodic `get_fee_data` polls (the
//! fallback source). `predict` fits a linear trend over the ring and returns
//! a confidence interval; `optimize` maps a speed target onto the predicted
//! fee.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::chain_adapter::FeeData;
use crate::constants::GAS_RING_CAPACITY;
use crate::error::{BotError, BotResult};
use crate::types::{ChainId, SpeedTarget};

#[derive(Debug, Clone, Copy)]
struct GasObservation {
    base_fee: u128,
    priority_fee: u128,
    at: Instant,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct GasEstimate {
    pub chain: ChainId,
    pub base_fee: u128,
    pub priority_fee: u128,
    /// Set when every source has gone quiet past the staleness bound.
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct GasPrediction {
    pub chain: ChainId,
    pub horizon_ms: u64,
    pub expected_total_fee: u128,
    pub low: u128,
    pub high: u128,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GasTrackerStats {
    pub observations: u64,
    pub predictions: u64,
    pub stale_reads: u64,
}

struct Ring {
    buf: VecDeque<GasObservation>,
    last_update: Instant,
}

impl Ring {
    fn new() -> Self {
        Self {
            buf: VecDeque::with_capacity(GAS_RING_CAPACITY),
            last_update: Instant::now(),
        }
    }

    fn push(&mut self, obs: GasObservation) {
        if self.buf.len() == GAS_RING_CAPACITY {
            self.buf.pop_front();
        }
        self.buf.push_back(obs);
        self.last_update = obs.at;
    }
}

pub struct GasTracker {
    rings: RwLock<HashMap<ChainId, Ring>>,
    staleness: Duration,
    predict_horizon_ms: u64,
    stats: RwLock<GasTrackerStats>,
}

impl GasTracker {
    pub fn new(staleness: Duration, predict_horizon_ms: u64) -> Self {
        Self {
            rings: RwLock::new(HashMap::new()),
            staleness,
            predict_horizon_ms,
            stats: RwLock::new(GasTrackerStats::default()),
        }
    }

    /// Feed an observation from either the streaming or the polling source.
    pub fn record(&self, fee: &FeeData) {
        let mut rings = self.rings.write();
        let ring = rings.entry(fee.chain).or_insert_with(Ring::new);
        ring.push(GasObservation {
            base_fee: fee.base_fee,
            priority_fee: fee.priority_fee,
            at: Instant::now(),
        });
        self.stats.write().observations += 1;
    }

    /// Base-fee-only update from a block header (EVM streaming path).
    pub fn record_base_fee(&self, chain: ChainId, base_fee: u128) {
        let mut rings = self.rings.write();
        let ring = rings.entry(chain).or_insert_with(Ring::new);
        let priority = ring.buf.back().map(|o| o.priority_fee).unwrap_or(0);
        ring.push(GasObservation {
            base_fee,
            priority_fee: priority,
            at: Instant::now(),
        });
        self.stats.write().observations += 1;
    }

    /// Latest fee view. When all sources are down the last value is returned
    /// tagged stale; with no observations at all, errors.
    pub fn current(&self, chain: ChainId) -> BotResult<GasEstimate> {
        let rings = self.rings.read();
        let ring = rings
            .get(&chain)
            .ok_or_else(|| BotError::Protocol(format!("no gas observations for {chain}")))?;
        let last = ring
            .buf
            .back()
            .ok_or_else(|| BotError::Protocol(format!("no gas observations for {chain}")))?;
        let stale = ring.last_update.elapsed() > self.staleness;
        if stale {
            self.stats.write().stale_reads += 1;
        }
        Ok(GasEstimate {
            chain,
            base_fee: last.base_fee,
            priority_fee: last.priority_fee,
            stale,
        })
    }

    /// Linear trend over the ring projected `horizon_ms` forward. Fails on a
    /// stale or near-empty ring; prediction from dead data is worse than no
    /// prediction.
    pub fn predict(&self, chain: ChainId, horizon_ms: u64) -> BotResult<GasPrediction> {
        let rings = self.rings.read();
        let ring = rings
            .get(&chain)
            .ok_or_else(|| BotError::Protocol(format!("no gas observations for {chain}")))?;
        if ring.last_update.elapsed() > self.staleness {
            return Err(BotError::TransientNetwork(format!(
                "gas feed for {chain} is stale"
            )));
        }
        if ring.buf.len() < 3 {
            return Err(BotError::Protocol(format!(
                "not enough gas observations for {chain} ({})",
                ring.buf.len()
            )));
        }
        self.stats.write().predictions += 1;

        let now = Instant::now();
        // Least-squares fit of total fee against seconds-before-now.
        let points: Vec<(f64, f64)> = ring
            .buf
            .iter()
            .map(|o| {
                let x = -(now.duration_since(o.at).as_secs_f64());
                let y = (o.base_fee + o.priority_fee) as f64;
                (x, y)
            })
            .collect();
        let n = points.len() as f64;
        let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
        let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
        let sum_xy: f64 = points.iter().map(|(x, y)| x * y).sum();
        let sum_xx: f64 = points.iter().map(|(x, _)| x * x).sum();
        let denom = n * sum_xx - sum_x * sum_x;
        let (slope, intercept) = if denom.abs() < f64::EPSILON {
            (0.0, sum_y / n)
        } else {
            let slope = (n * sum_xy - sum_x * sum_y) / denom;
            (slope, (sum_y - slope * sum_x) / n)
        };

        let horizon_s = horizon_ms as f64 / 1_000.0;
        let projected = (intercept + slope * horizon_s).max(0.0);

        // Residual spread drives the interval and the confidence score.
        let residual_var: f64 = points
            .iter()
            .map(|(x, y)| {
                let fit = intercept + slope * x;
                (y - fit) * (y - fit)
            })
            .sum::<f64>()
            / n;
        let sigma = residual_var.sqrt();
        let mean = sum_y / n;
        let confidence = if mean > f64::EPSILON {
            (1.0 - (sigma / mean)).clamp(0.0, 1.0)
        } else {
            0.0
        };

        debug!(
            "⛽ {chain} gas predict: {projected:.0} ±{sigma:.0} over {horizon_ms}ms (conf {confidence:.2})"
        );
        Ok(GasPrediction {
            chain,
            horizon_ms,
            expected_total_fee: projected as u128,
            low: (projected - 2.0 * sigma).max(0.0) as u128,
            high: (projected + 2.0 * sigma) as u128,
            confidence,
        })
    }

    /// Fee for a speed target: predicted base plus a scaled priority fee.
    /// Falls back to the last observation when prediction is unavailable.
    pub fn optimize(&self, chain: ChainId, speed: SpeedTarget) -> BotResult<FeeData> {
        let current = self.current(chain)?;
        let horizon = self.predict_horizon_ms.max(chain.block_time_ms());
        let predicted_base = match self.predict(chain, horizon) {
            Ok(prediction) => {
                // Conservative side of the interval: never underbid base fee.
                prediction.high.saturating_sub(current.priority_fee)
            }
            Err(_) => current.base_fee,
        }
        .max(current.base_fee);

        let multiplier_bps: u128 = match speed {
            SpeedTarget::Slow => 8_000,
            SpeedTarget::Standard => 10_000,
            SpeedTarget::Fast => 13_000,
            SpeedTarget::Urgent => 20_000,
        };
        let priority = (current.priority_fee.max(1) * multiplier_bps) / 10_000;
        Ok(FeeData {
            chain,
            base_fee: predicted_base,
            priority_fee: priority,
            observed_at: chrono::Utc::now(),
        })
    }

    pub fn stats(&self) -> GasTrackerStats {
        self.stats.read().clone()
    }
}
