//! Multi-source token price oracle with confidence scoring and caching.
//!
//! Quotes from configured providers are weighted by source priority and
//! recency; outliers beyond the configured band from the weighted median are
//! dropped; confidence is (1 - normalized MAD) * freshness decay. The cache
//! is write-through and a fully-degraded oracle serves the last cached value
//! flagged stale rather than nothing.

use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::{PriceConfig, PriceProviderConfig};
use crate::constants::{duration_from_ms, PRICE_FETCH_TIMEOUT_MS};
use crate::error::{BotError, BotResult};

type DirectLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Aggregated oracle answer for one token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceQuote {
    pub token: String,
    pub price_usd: f64,
    pub confidence: f64,
    pub age_ms: u64,
    pub sources: Vec<String>,
    pub stale: bool,
}

/// One provider's fresh quote before aggregation.
#[derive(Debug, Clone)]
pub struct SourceQuote {
    pub source: String,
    pub weight: f64,
    pub price_usd: f64,
}

/// Response shapes we know how to parse. Closed set, matched on the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Coingecko,
    Dexscreener,
    /// `{"price_usd": <number>}` style internal endpoints.
    Generic,
}

impl ProviderKind {
    fn infer(name: &str) -> Self {
        match name {
            n if n.contains("coingecko") => ProviderKind::Coingecko,
            n if n.contains("dexscreener") => ProviderKind::Dexscreener,
            _ => ProviderKind::Generic,
        }
    }

    fn parse_price(&self, token: &str, payload: &Value) -> Option<f64> {
        match self {
            ProviderKind::Coingecko => payload.get(token)?.get("usd")?.as_f64(),
            ProviderKind::Dexscreener => payload
                .get("pairs")?
                .as_array()?
                .first()?
                .get("priceUsd")?
                .as_str()?
                .parse()
                .ok(),
            ProviderKind::Generic => payload.get("price_usd")?.as_f64(),
        }
    }
}

struct Provider {
    name: String,
    url: String,
    weight: f64,
    kind: ProviderKind,
    limiter: DirectLimiter,
}

#[derive(Debug, Clone)]
struct CachedPrice {
    quote: PriceQuote,
    fetched_at: Instant,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OracleStats {
    pub fetches: u64,
    pub cache_hits: u64,
    pub provider_failures: u64,
    pub outliers_dropped: u64,
    pub stale_serves: u64,
}

pub struct PriceOracle {
    providers: Vec<Provider>,
    cache: RwLock<HashMap<String, CachedPrice>>,
    cache_ttl: Duration,
    outlier_band_bps: u32,
    http: reqwest::Client,
    stats: RwLock<OracleStats>,
}

impl PriceOracle {
    pub fn new(config: &PriceConfig, cache_ttl_ms: u64) -> BotResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(duration_from_ms(PRICE_FETCH_TIMEOUT_MS))
            .gzip(true)
            .build()
            .map_err(|e| BotError::Config(format!("price http client: {e}")))?;
        let providers = config
            .providers
            .iter()
            .map(Provider::from_config)
            .collect();
        Ok(Self {
            providers,
            cache: RwLock::new(HashMap::new()),
            cache_ttl: duration_from_ms(cache_ttl_ms),
            outlier_band_bps: config.outlier_band_bps,
            http,
            stats: RwLock::new(OracleStats::default()),
        })
    }

    /// Price for one token. Serves fresh cache when possible, otherwise fans
    /// out to every provider and aggregates. With all providers down the last
    /// cached value is returned flagged stale; with no cache either, fails
    /// with the no-sources error.
    pub async fn get_price(&self, token: &str) -> BotResult<PriceQuote> {
        if let Some(cached) = self.fresh_cached(token) {
            self.stats.write().cache_hits += 1;
            return Ok(cached);
        }
        self.stats.write().fetches += 1;

        let quotes = self.fetch_all(token).await;
        if quotes.is_empty() {
            // Degraded: any cached value beats silence, flagged stale.
            if let Some(entry) = self.cache.read().get(token).cloned() {
                let mut quote = entry.quote.clone();
                quote.stale = true;
                quote.age_ms = entry.fetched_at.elapsed().as_millis() as u64;
                quote.confidence *= 0.5;
                self.stats.write().stale_serves += 1;
                warn!("💸 all price sources down for {token}; serving stale cache");
                return Ok(quote);
            }
            return Err(BotError::TransientNetwork(format!(
                "NoSources: every price provider failed for {token}"
            )));
        }

        let (dropped, quote) = aggregate_quotes(token, quotes, self.outlier_band_bps);
        self.stats.write().outliers_dropped += dropped as u64;
        // Write-through cache.
        self.cache.write().insert(
            token.to_string(),
            CachedPrice {
                quote: quote.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(quote)
    }

    /// Concurrent batch lookup with bounded fanout.
    pub async fn get_batch(&self, tokens: &[String]) -> HashMap<String, PriceQuote> {
        use futures::StreamExt;
        let mut fetches: Vec<
            std::pin::Pin<Box<dyn std::future::Future<Output = (String, BotResult<PriceQuote>)> + Send + '_>>,
        > = Vec::new();
        for t in tokens {
            fetches.push(Box::pin(async move { (t.clone(), self.get_price(t).await) }));
        }
        let results: Vec<(String, BotResult<PriceQuote>)> = futures::stream::iter(fetches)
            .buffer_unordered(8)
            .collect()
            .await;
        results
            .into_iter()
            .filter_map(|(token, result)| match result {
                Ok(quote) => Some((token, quote)),
                Err(e) => {
                    debug!("batch price miss for {token}: {e}");
                    None
                }
            })
            .collect()
    }

    /// Drop a token's cache entry (soft invalidation on staleness signals).
    pub fn invalidate(&self, token: &str) {
        self.cache.write().remove(token);
    }

    pub fn stats(&self) -> OracleStats {
        self.stats.read().clone()
    }

    fn fresh_cached(&self, token: &str) -> Option<PriceQuote> {
        let cache = self.cache.read();
        let entry = cache.get(token)?;
        if entry.fetched_at.elapsed() <= self.cache_ttl {
            let mut quote = entry.quote.clone();
            quote.age_ms = entry.fetched_at.elapsed().as_millis() as u64;
            Some(quote)
        } else {
            None
        }
    }

    async fn fetch_all(&self, token: &str) -> Vec<SourceQuote> {
        use futures::StreamExt;
        let mut fetches: Vec<
            std::pin::Pin<Box<dyn std::future::Future<Output = Option<SourceQuote>> + Send + '_>>,
        > = Vec::new();
        for p in &self.providers {
            fetches.push(Box::pin(self.fetch_one(p, token)));
        }
        let results: Vec<Option<SourceQuote>> = futures::stream::iter(fetches)
            .buffer_unordered(self.providers.len().max(1))
            .collect()
            .await;
        results.into_iter().flatten().collect()
    }

    async fn fetch_one(&self, provider: &Provider, token: &str) -> Option<SourceQuote> {
        // Per-provider rate limit, bounded by the fetch deadline rather than
        // waiting indefinitely for a slot.
        let permit = tokio::time::timeout(
            duration_from_ms(PRICE_FETCH_TIMEOUT_MS),
            provider.limiter.until_ready(),
        )
        .await;
        if permit.is_err() {
            debug!("price provider {} rate-limited past deadline", provider.name);
            return None;
        }
        let url = provider.request_url(token);
        match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                let payload: Value = response.json().await.ok()?;
                match provider.kind.parse_price(token, &payload) {
                    Some(price) if price.is_finite() && price > 0.0 => Some(SourceQuote {
                        source: provider.name.clone(),
                        weight: provider.weight,
                        price_usd: price,
                    }),
                    _ => {
                        self.stats.write().provider_failures += 1;
                        None
                    }
                }
            }
            Ok(response) => {
                debug!(
                    "price provider {} returned {}",
                    provider.name,
                    response.status()
                );
                self.stats.write().provider_failures += 1;
                None
            }
            Err(e) => {
                debug!("price provider {} failed: {e}", provider.name);
                self.stats.write().provider_failures += 1;
                None
            }
        }
    }
}

impl Provider {
    fn from_config(config: &PriceProviderConfig) -> Self {
        let per_sec = NonZeroU32::new(config.rate_limit_per_sec.max(1)).unwrap_or(nonzero!(1u32));
        Self {
            name: config.name.clone(),
            url: config.url.clone(),
            weight: config.weight,
            kind: ProviderKind::infer(&config.name),
            limiter: RateLimiter::direct(Quota::per_second(per_sec)),
        }
    }

    fn request_url(&self, token: &str) -> String {
        match self.kind {
            ProviderKind::Coingecko => {
                format!("{}?ids={token}&vs_currencies=usd", self.url)
            }
            ProviderKind::Dexscreener | ProviderKind::Generic => {
                format!("{}/{token}", self.url.trim_end_matches('/'))
            }
        }
    }
}

/// Weighted median of (price, weight) pairs.
fn weighted_median(quotes: &[SourceQuote]) -> f64 {
    let mut sorted: Vec<&SourceQuote> = quotes.iter().collect();
    sorted.sort_by(|a, b| a.price_usd.total_cmp(&b.price_usd));
    let total: f64 = sorted.iter().map(|q| q.weight).sum();
    let mut cumulative = 0.0;
    for quote in &sorted {
        cumulative += quote.weight;
        if cumulative >= total / 2.0 {
            return quote.price_usd;
        }
    }
    sorted.last().map(|q| q.price_usd).unwrap_or(0.0)
}

/// Aggregate provider quotes: drop outliers beyond the band from the weighted
/// median, then score confidence from the surviving spread. Returns the count
/// of dropped outliers alongside the final quote.
pub fn aggregate_quotes(
    token: &str,
    quotes: Vec<SourceQuote>,
    outlier_band_bps: u32,
) -> (usize, PriceQuote) {
    let median = weighted_median(&quotes);
    let band = median * outlier_band_bps as f64 / 10_000.0;
    let (kept, dropped): (Vec<SourceQuote>, Vec<SourceQuote>) = quotes
        .into_iter()
        .partition(|q| (q.price_usd - median).abs() <= band);
    // If the band dropped everything (pathological spread), fall back to the
    // single quote nearest the median rather than answering nothing.
    let mut dropped_count = dropped.len();
    let kept = if kept.is_empty() {
        dropped_count = dropped_count.saturating_sub(1);
        dropped
            .iter()
            .min_by(|a, b| {
                (a.price_usd - median)
                    .abs()
                    .total_cmp(&(b.price_usd - median).abs())
            })
            .cloned()
            .into_iter()
            .collect()
    } else {
        kept
    };

    let final_median = weighted_median(&kept);
    let mut deviations: Vec<f64> = kept
        .iter()
        .map(|q| (q.price_usd - final_median).abs())
        .collect();
    deviations.sort_by(|a, b| a.total_cmp(b));
    let mad = deviations.get(deviations.len() / 2).copied().unwrap_or(0.0);
    let normalized_mad = if final_median.abs() > f64::EPSILON {
        (mad / final_median).min(1.0)
    } else {
        1.0
    };
    // Fresh fetch: freshness decay is 1.0 here; stale serves decay separately.
    let confidence = ((1.0 - normalized_mad) * single_source_penalty(kept.len())).clamp(0.05, 1.0);

    (
        dropped_count,
        PriceQuote {
            token: token.to_string(),
            price_usd: final_median,
            confidence,
            age_ms: 0,
            sources: kept.into_iter().map(|q| q.source).collect(),
            stale: false,
        },
    )
}

/// Mild haircut when only one source answered; one source still keeps the
/// token tradable per the degradation requirement.
fn single_source_penalty(source_count: usize) -> f64 {
    match source_count {
        0 => 0.0,
        1 => 0.7,
        2 => 0.9,
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(source: &str, weight: f64, price: f64) -> SourceQuote {
        SourceQuote {
            source: source.to_string(),
            weight,
            price_usd: price,
        }
    }

    #[test]
    fn test_weighted_median_prefers_heavy_sources() {
        let quotes = vec![
            quote("a", 0.1, 100.0),
            quote("b", 5.0, 200.0),
            quote("c", 0.1, 300.0),
        ];
        assert_eq!(weighted_median(&quotes), 200.0);
    }

    #[test]
    fn test_aggregate_drops_outliers() {
        let quotes = vec![
            quote("a", 1.0, 2000.0),
            quote("b", 1.0, 2004.0),
            quote("c", 1.0, 3500.0), // manipulated pool, 75% off
        ];
        let (dropped, result) = aggregate_quotes("weth", quotes, 500);
        assert_eq!(dropped, 1);
        assert_eq!(result.sources.len(), 2);
        assert!(result.price_usd < 2100.0);
        assert!(result.confidence > 0.8);
    }

    #[test]
    fn test_single_surviving_source_keeps_token_available() {
        // Degradation requirement: N-1 of N sources failing still yields a
        // usable quote with positive confidence.
        let quotes = vec![quote("only", 1.0, 150.0)];
        let (_, result) = aggregate_quotes("sol", quotes, 500);
        assert_eq!(result.sources.len(), 1);
        assert!(result.confidence > 0.0);
        assert_eq!(result.price_usd, 150.0);
        assert!(!result.stale);
    }

    #[test]
    fn test_confidence_degrades_with_spread() {
        let tight = vec![
            quote("a", 1.0, 100.0),
            quote("b", 1.0, 100.2),
            quote("c", 1.0, 99.9),
        ];
        let loose = vec![
            quote("a", 1.0, 100.0),
            quote("b", 1.0, 104.0),
            quote("c", 1.0, 96.5),
        ];
        let (_, tight_result) = aggregate_quotes("x", tight, 1_000);
        let (_, loose_result) = aggregate_quotes("x", loose, 1_000);
        assert!(tight_result.confidence > loose_result.confidence);
    }

    #[test]
    fn test_provider_kind_parsing() {
        let coingecko_payload: Value =
            serde_json::from_str(r#"{"weth": {"usd": 2001.5}}"#).unwrap();
        assert_eq!(
            ProviderKind::Coingecko.parse_price("weth", &coingecko_payload),
            Some(2001.5)
        );
        let dex_payload: Value =
            serde_json::from_str(r#"{"pairs": [{"priceUsd": "2002.25"}]}"#).unwrap();
        assert_eq!(
            ProviderKind::Dexscreener.parse_price("weth", &dex_payload),
            Some(2002.25)
        );
        let generic: Value = serde_json::from_str(r#"{"price_usd": 3.5}"#).unwrap();
        assert_eq!(ProviderKind::Generic.parse_price("x", &generic), Some(3.5));
        assert_eq!(ProviderKind::Generic.parse_price("x", &dex_payload), None);
    }
}
