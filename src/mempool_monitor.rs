//! Mempool monitor: filters the raw pending-transaction firehose down to
//! the traffic the strategies care about and feeds the decoder pool through
//! a bounded, priority-ordered buffer. Overflow drops the lowest-priority-fee
//! transaction first and counts the drop; nothing here ever blocks the
//! websocket read loop.

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::num::NonZeroUsize;
use tracing::debug;

use crate::chain_adapter::PendingTx;
use crate::constants::INTENT_DEDUPE_WINDOW;
use crate::tx_decoder::TxDecoder;
use crate::types::ChainId;

/// What happened to an offered pending transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Offered {
    Queued,
    FilteredOut,
    Duplicate,
    /// Queued, but the buffer was full and this hash was evicted to make
    /// room (always the lowest priority fee in the buffer).
    QueuedEvicting(String),
    /// Below every queued transaction's priority fee while full.
    RejectedFull,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorStats {
    pub seen: u64,
    pub filtered_out: u64,
    pub duplicates: u64,
    pub queued: u64,
    pub dropped_backpressure: u64,
}

struct PriorityTx(PendingTx);

impl PartialEq for PriorityTx {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority_fee == other.0.priority_fee
    }
}
impl Eq for PriorityTx {}
impl PartialOrd for PriorityTx {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PriorityTx {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.priority_fee.cmp(&other.0.priority_fee)
    }
}

pub struct MempoolMonitor {
    decoder: std::sync::Arc<TxDecoder>,
    /// Copy-trading targets bypass the router allowlist.
    target_wallets: HashSet<String>,
    /// Minimum attached native value per chain; zero-value transactions pass
    /// (token-in swaps carry no native value, they are sized post-decode).
    min_value: HashMap<ChainId, u128>,
    buffer: Mutex<BinaryHeap<PriorityTx>>,
    capacity: usize,
    dedupe: Mutex<LruCache<(ChainId, String), ()>>,
    stats: Mutex<MonitorStats>,
}

impl MempoolMonitor {
    pub fn new(
        decoder: std::sync::Arc<TxDecoder>,
        target_wallets: HashSet<String>,
        min_value: HashMap<ChainId, u128>,
        capacity: usize,
    ) -> Self {
        Self {
            decoder,
            target_wallets,
            min_value,
            buffer: Mutex::new(BinaryHeap::with_capacity(capacity)),
            capacity,
            dedupe: Mutex::new(LruCache::new(
                NonZeroUsize::new(INTENT_DEDUPE_WINDOW).expect("nonzero window"),
            )),
            stats: Mutex::new(MonitorStats::default()),
        }
    }

    /// Offer one pending transaction from a chain subscription.
    pub fn offer(&self, tx: PendingTx) -> Offered {
        self.stats.lock().seen += 1;

        if !self.passes_filters(&tx) {
            self.stats.lock().filtered_out += 1;
            return Offered::FilteredOut;
        }

        {
            let mut dedupe = self.dedupe.lock();
            let key = (tx.chain, tx.hash.clone());
            if dedupe.contains(&key) {
                self.stats.lock().duplicates += 1;
                return Offered::Duplicate;
            }
            dedupe.put(key, ());
        }

        let mut buffer = self.buffer.lock();
        if buffer.len() < self.capacity {
            buffer.push(PriorityTx(tx));
            self.stats.lock().queued += 1;
            return Offered::Queued;
        }

        // Full: evict the lowest-priority-fee entry if the newcomer beats it.
        let lowest_fee = buffer
            .iter()
            .map(|p| p.0.priority_fee)
            .min()
            .unwrap_or(0);
        if tx.priority_fee <= lowest_fee {
            self.stats.lock().dropped_backpressure += 1;
            debug!(
                "⛔ mempool buffer full; rejecting {} (fee {} <= floor {lowest_fee})",
                tx.hash, tx.priority_fee
            );
            return Offered::RejectedFull;
        }
        let mut entries: Vec<PriorityTx> = std::mem::take(&mut *buffer).into_vec();
        let victim_index = entries
            .iter()
            .enumerate()
            .min_by_key(|(_, p)| p.0.priority_fee)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let evicted = entries.swap_remove(victim_index);
        entries.push(PriorityTx(tx));
        *buffer = entries.into_iter().collect();
        let mut stats = self.stats.lock();
        stats.queued += 1;
        stats.dropped_backpressure += 1;
        Offered::QueuedEvicting(evicted.0.hash)
    }

    /// Highest-priority pending transaction, if any. The decode pump calls
    /// this and forwards into the bounded decoder channel.
    pub fn pop_next(&self) -> Option<PendingTx> {
        self.buffer.lock().pop().map(|p| p.0)
    }

    pub fn queue_len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn stats(&self) -> MonitorStats {
        self.stats.lock().clone()
    }

    fn passes_filters(&self, tx: &PendingTx) -> bool {
        // Copy targets always pass; their trades are the signal.
        if self.target_wallets.contains(&tx.from) {
            return true;
        }
        // DEX router / program allowlist.
        let router_ok = tx
            .to
            .as_deref()
            .map(|to| self.decoder.is_known_router(tx.chain, to))
            .unwrap_or(false);
        if !router_ok {
            return false;
        }
        // Chain-level minimum attached value (native-in swaps only).
        if tx.value > 0 {
            if let Some(min) = self.min_value.get(&tx.chain) {
                if tx.value < *min {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::UNISWAP_V2_ROUTER;
    use chrono::Utc;
    use std::sync::Arc;

    fn tx(hash: &str, to: Option<&str>, value: u128, priority_fee: u128) -> PendingTx {
        PendingTx {
            chain: ChainId::Ethereum,
            hash: hash.to_string(),
            from: "0x1111111111111111111111111111111111111111".into(),
            to: to.map(|s| s.to_string()),
            input: vec![0x38, 0xed, 0x17, 0x39],
            value,
            priority_fee,
            raw: None,
            observed_at: Utc::now(),
        }
    }

    fn monitor(capacity: usize) -> MempoolMonitor {
        MempoolMonitor::new(
            Arc::new(TxDecoder::new()),
            HashSet::new(),
            HashMap::from([(ChainId::Ethereum, 100_000u128)]),
            capacity,
        )
    }

    #[test]
    fn test_router_allowlist_filter() {
        let m = monitor(16);
        assert_eq!(
            m.offer(tx("0x1", Some(UNISWAP_V2_ROUTER), 0, 10)),
            Offered::Queued
        );
        assert_eq!(
            m.offer(tx("0x2", Some("0xdeaddeaddeaddeaddeaddeaddeaddeaddeaddead"), 0, 10)),
            Offered::FilteredOut
        );
        assert_eq!(m.offer(tx("0x3", None, 0, 10)), Offered::FilteredOut);
    }

    #[test]
    fn test_target_wallet_bypasses_allowlist() {
        let m = MempoolMonitor::new(
            Arc::new(TxDecoder::new()),
            HashSet::from(["0x1111111111111111111111111111111111111111".to_string()]),
            HashMap::new(),
            16,
        );
        // Unknown router, but the sender is a copy target.
        assert_eq!(
            m.offer(tx("0x1", Some("0xdeaddeaddeaddeaddeaddeaddeaddeaddeaddead"), 0, 10)),
            Offered::Queued
        );
    }

    #[test]
    fn test_min_value_filter() {
        let m = monitor(16);
        assert_eq!(
            m.offer(tx("0x1", Some(UNISWAP_V2_ROUTER), 50_000, 10)),
            Offered::FilteredOut
        );
        assert_eq!(
            m.offer(tx("0x2", Some(UNISWAP_V2_ROUTER), 200_000, 10)),
            Offered::Queued
        );
    }

    #[test]
    fn test_dedupe_by_chain_and_hash() {
        let m = monitor(16);
        assert_eq!(m.offer(tx("0xaa", Some(UNISWAP_V2_ROUTER), 0, 10)), Offered::Queued);
        assert_eq!(
            m.offer(tx("0xaa", Some(UNISWAP_V2_ROUTER), 0, 10)),
            Offered::Duplicate
        );
        assert_eq!(m.stats().duplicates, 1);
    }

    #[test]
    fn test_overflow_drops_lowest_priority_fee() {
        let m = monitor(2);
        m.offer(tx("0xlow", Some(UNISWAP_V2_ROUTER), 0, 1));
        m.offer(tx("0xmid", Some(UNISWAP_V2_ROUTER), 0, 50));
        // Higher fee evicts the lowest.
        match m.offer(tx("0xhigh", Some(UNISWAP_V2_ROUTER), 0, 100)) {
            Offered::QueuedEvicting(hash) => assert_eq!(hash, "0xlow"),
            other => panic!("expected eviction, got {other:?}"),
        }
        // Lower fee than everything queued bounces off.
        assert_eq!(
            m.offer(tx("0xworse", Some(UNISWAP_V2_ROUTER), 0, 1)),
            Offered::RejectedFull
        );
        assert_eq!(m.stats().dropped_backpressure, 2);
        // Drain order is highest fee first.
        assert_eq!(m.pop_next().unwrap().hash, "0xhigh");
        assert_eq!(m.pop_next().unwrap().hash, "0xmid");
        assert!(m.pop_next().is_none());
    }
}
