//! Durable store: a single embedded SQLite database holding opportunities,
//! executions, fills, risk events and rolling telemetry. Writes go through
//! batched transactions; reads use prepared statements. Schema versions are
//! recorded in `PRAGMA user_version` and migrate forward-only; a store newer
//! than the code refuses to open. Optional at-rest encryption covers the
//! route snapshot column and backups; plaintext never crosses the storage
//! boundary when it is on.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::constants::TELEMETRY_RETENTION_HOURS;
use crate::error::{BotError, BotResult};
use crate::price_oracle::PriceQuote;
use crate::types::{
    Bundle, ChainId, Opportunity, OpportunityStatus, RiskEvent, RiskScope, RiskSeverity,
    StrategyKind,
};
use crate::wallet::{open_entry, seal_entry, KeystoreEntry};

/// Schema version the code expects; migrations run every version from the
/// store's current one up to this.
const SCHEMA_VERSION: u32 = 1;

/// Daily aggregates for operator logs and the risk governor's PnL view.
#[derive(Debug, Clone, Default)]
pub struct TodayStats {
    pub opportunities: i64,
    pub landed: i64,
    pub expired: i64,
    pub rejected: i64,
    pub realized_profit_usd: f64,
}

#[derive(Debug, Clone)]
pub struct FillRecord {
    pub leg_index: u32,
    pub tx_hash: String,
    pub amount_in: String,
    pub amount_out: String,
    pub token_in: String,
    pub token_out: String,
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    encryption_password: Option<String>,
    backup_dir: Option<PathBuf>,
}

impl Store {
    /// Open (or create) the store, run forward-only migrations, and fail
    /// with `SchemaIncompatible` when the store is ahead of the code.
    pub fn open(
        db_path: &str,
        backup_dir: Option<&str>,
        encryption_password: Option<String>,
    ) -> BotResult<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BotError::Config(format!("create data dir: {e}")))?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let found: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if found > SCHEMA_VERSION {
            return Err(BotError::SchemaIncompatible {
                found,
                expected: SCHEMA_VERSION,
            });
        }
        if found < SCHEMA_VERSION {
            // v0 -> v1 is the base schema; later versions append migration
            // steps here, never rewrite earlier ones.
            conn.execute_batch(include_str!("../schema.sql"))?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            info!("🗄️ store migrated {found} -> {SCHEMA_VERSION} at {db_path}");
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            encryption_password,
            backup_dir: backup_dir.map(PathBuf::from),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    // -- opportunities ------------------------------------------------------

    pub fn record_opportunity(&self, opportunity: &Opportunity) -> BotResult<()> {
        let route_json = serde_json::to_string(&opportunity.route)
            .map_err(|e| BotError::Fatal(format!("route serialize: {e}")))?;
        let route_column = self.seal_column(&route_json)?;
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO opportunities (
                opportunity_id, fingerprint, strategy, chain, status, created_at,
                expected_profit_native, expected_profit_usd, confidence, route_snapshot_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                opportunity.id.to_string(),
                opportunity.fingerprint,
                opportunity.strategy.as_str(),
                opportunity.chain.name(),
                opportunity.status.as_str(),
                opportunity.created_at.to_rfc3339(),
                opportunity.expected_profit_native.to_string(),
                opportunity.expected_profit_usd,
                opportunity.confidence,
                route_column,
            ],
        )?;
        Ok(())
    }

    pub fn update_opportunity_status(
        &self,
        id: Uuid,
        status: OpportunityStatus,
        rejection_reason: Option<&str>,
    ) -> BotResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE opportunities SET status = ?2, rejection_reason = ?3
             WHERE opportunity_id = ?1",
            params![id.to_string(), status.as_str(), rejection_reason],
        )?;
        Ok(())
    }

    pub fn opportunity_status(&self, id: Uuid) -> BotResult<Option<String>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare_cached("SELECT status FROM opportunities WHERE opportunity_id = ?1")?;
        let mut rows = stmt.query(params![id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    // -- executions and fills ----------------------------------------------

    /// Record a bundle's lifecycle row. Called on every status change; the
    /// row is keyed by the bundle id.
    pub fn record_execution(&self, bundle: &Bundle) -> BotResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO executions (
                execution_id, opportunity_id, bundle_id, relay, status,
                target_block_or_slot, tip_native, submitted_at, landed_at,
                realized_profit_native, realized_profit_usd, gas_native
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                bundle.id.to_string(),
                bundle.opportunity_id.to_string(),
                bundle.id.to_string(),
                bundle.relay.as_str(),
                bundle.status.as_str(),
                bundle.target_block_or_slot as i64,
                bundle.tip_native.to_string(),
                bundle.created_at.to_rfc3339(),
                matches!(bundle.status, crate::types::BundleStatus::Included)
                    .then(|| Utc::now().to_rfc3339()),
                bundle.actual_profit_native.map(|p| p.to_string()),
                Option::<f64>::None,
                Option::<String>::None,
            ],
        )?;
        Ok(())
    }

    pub fn settle_execution(
        &self,
        bundle_id: Uuid,
        realized_profit_native: i128,
        realized_profit_usd: f64,
        gas_native: u128,
    ) -> BotResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE executions SET
                realized_profit_native = ?2,
                realized_profit_usd = ?3,
                gas_native = ?4,
                landed_at = COALESCE(landed_at, ?5)
             WHERE execution_id = ?1",
            params![
                bundle_id.to_string(),
                realized_profit_native.to_string(),
                realized_profit_usd,
                gas_native.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Batched fill insert inside one transaction.
    pub fn record_fills(&self, bundle_id: Uuid, fills: &[FillRecord]) -> BotResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO fills (
                    execution_id, leg_index, tx_hash, amount_in, amount_out, token_in, token_out
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for fill in fills {
                stmt.execute(params![
                    bundle_id.to_string(),
                    fill.leg_index,
                    fill.tx_hash,
                    fill.amount_in,
                    fill.amount_out,
                    fill.token_in,
                    fill.token_out,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // -- risk events --------------------------------------------------------

    pub fn record_risk_event(&self, event: &RiskEvent) -> BotResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO risk_events (severity, scope, reason, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event.severity.as_str(),
                event.scope.as_str(),
                event.reason,
                event.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Unacknowledged kill scopes, re-applied to the governor at startup.
    pub fn active_kill_scopes(&self) -> BotResult<Vec<RiskScope>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT scope FROM risk_events
             WHERE severity = 'kill' AND acknowledged = 0
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut scopes = Vec::new();
        for row in rows {
            if let Some(scope) = parse_scope(&row?) {
                scopes.push(scope);
            }
        }
        Ok(scopes)
    }

    /// Operator acknowledgment clears persisted kills; the reset itself is
    /// recorded as a fresh Info event by the governor.
    pub fn acknowledge_kills(&self, scope: &RiskScope) -> BotResult<usize> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE risk_events SET acknowledged = 1
             WHERE severity = 'kill' AND acknowledged = 0 AND scope = ?1",
            params![scope.as_str()],
        )?;
        Ok(changed)
    }

    // -- telemetry ----------------------------------------------------------

    /// Batched telemetry write: gas, price and latency samples in one
    /// transaction to keep the write path off the hot loops.
    pub fn record_telemetry(
        &self,
        gas: &[(ChainId, u128, u128)],
        prices: &[PriceQuote],
        latencies: &[(String, ChainId, f64)],
    ) -> BotResult<()> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut gas_stmt = tx.prepare_cached(
                "INSERT INTO gas_samples (chain, base_fee, priority_fee, observed_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (chain, base, priority) in gas {
                gas_stmt.execute(params![
                    chain.name(),
                    base.to_string(),
                    priority.to_string(),
                    now
                ])?;
            }
            let mut price_stmt = tx.prepare_cached(
                "INSERT INTO price_samples (token, price_usd, confidence, source_count, observed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for quote in prices {
                price_stmt.execute(params![
                    quote.token,
                    quote.price_usd,
                    quote.confidence,
                    quote.sources.len() as i64,
                    now
                ])?;
            }
            let mut latency_stmt = tx.prepare_cached(
                "INSERT INTO latency_samples (stage, chain, elapsed_ms, observed_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (stage, chain, elapsed) in latencies {
                latency_stmt.execute(params![stage, chain.name(), elapsed, now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Prune telemetry beyond the retention bound. Runs on a timer.
    pub fn prune_telemetry(&self) -> BotResult<usize> {
        let cutoff = (Utc::now() - ChronoDuration::hours(TELEMETRY_RETENTION_HOURS)).to_rfc3339();
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut removed = 0;
        for table in ["gas_samples", "price_samples", "latency_samples"] {
            removed += tx.execute(
                &format!("DELETE FROM {table} WHERE observed_at < ?1"),
                params![cutoff],
            )?;
        }
        tx.commit()?;
        if removed > 0 {
            info!("🧹 pruned {removed} telemetry rows older than {TELEMETRY_RETENTION_HOURS}h");
        }
        Ok(removed)
    }

    // -- aggregates ---------------------------------------------------------

    pub fn today_stats(&self) -> BotResult<TodayStats> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT
                COUNT(*),
                SUM(CASE WHEN status = 'landed' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'expired' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'rejected' THEN 1 ELSE 0 END)
             FROM opportunities
             WHERE DATE(created_at) = DATE('now')",
        )?;
        let (opportunities, landed, expired, rejected) = stmt.query_row([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                row.get::<_, Option<i64>>(3)?.unwrap_or(0),
            ))
        })?;
        let realized_profit_usd: f64 = conn.query_row(
            "SELECT COALESCE(SUM(realized_profit_usd), 0.0) FROM executions
             WHERE DATE(submitted_at) = DATE('now')",
            [],
            |row| row.get(0),
        )?;
        Ok(TodayStats {
            opportunities,
            landed,
            expired,
            rejected,
            realized_profit_usd,
        })
    }

    pub fn count_rows(&self, table: &str) -> BotResult<i64> {
        // Closed set of table names; never interpolate external input here.
        const TABLES: [&str; 7] = [
            "opportunities",
            "executions",
            "fills",
            "risk_events",
            "gas_samples",
            "price_samples",
            "latency_samples",
        ];
        if !TABLES.contains(&table) {
            return Err(BotError::Fatal(format!("unknown table {table}")));
        }
        let conn = self.lock();
        Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })?)
    }

    // -- backups ------------------------------------------------------------

    /// Serialize the live database and write it (encrypted when enabled) to
    /// the backup directory, filename carrying the UTC timestamp.
    pub fn backup(&self) -> BotResult<Option<PathBuf>> {
        let Some(dir) = &self.backup_dir else {
            return Ok(None);
        };
        std::fs::create_dir_all(dir)
            .map_err(|e| BotError::Config(format!("create backup dir: {e}")))?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let conn = self.lock();
        let serialized: Vec<u8> = {
            // VACUUM INTO a temp file and read it back; keeps WAL safe.
            let tmp = dir.join(format!("trident-backup-{stamp}.tmp"));
            conn.execute("VACUUM INTO ?1", params![tmp.to_string_lossy().to_string()])?;
            let bytes = std::fs::read(&tmp)
                .map_err(|e| BotError::Config(format!("read backup tmp: {e}")))?;
            std::fs::remove_file(&tmp).ok();
            bytes
        };
        drop(conn);

        let path = if let Some(password) = &self.encryption_password {
            let sealed = seal_entry(
                "backup",
                ChainId::Ethereum,
                &base64::encode(&serialized),
                password,
            )?;
            let path = dir.join(format!("trident-backup-{stamp}.db.enc"));
            std::fs::write(
                &path,
                serde_json::to_vec(&sealed)
                    .map_err(|e| BotError::Fatal(format!("backup serialize: {e}")))?,
            )
            .map_err(|e| BotError::Config(format!("write backup: {e}")))?;
            path
        } else {
            let path = dir.join(format!("trident-backup-{stamp}.db"));
            std::fs::write(&path, &serialized)
                .map_err(|e| BotError::Config(format!("write backup: {e}")))?;
            path
        };
        info!("💾 backup written: {}", path.display());
        Ok(Some(path))
    }

    /// Decrypt an encrypted backup file back to raw SQLite bytes.
    pub fn decrypt_backup(path: &Path, password: &str) -> BotResult<Vec<u8>> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BotError::Config(format!("read backup: {e}")))?;
        let entry: KeystoreEntry = serde_json::from_str(&raw)
            .map_err(|e| BotError::Config(format!("backup parse: {e}")))?;
        let b64 = open_entry(&entry, password)?;
        base64::decode(b64).map_err(|e| BotError::Fatal(format!("backup decode: {e}")))
    }

    /// Column-level encryption for sensitive payloads.
    fn seal_column(&self, plaintext: &str) -> BotResult<String> {
        match &self.encryption_password {
            Some(password) => {
                let entry = seal_entry("column", ChainId::Ethereum, plaintext, password)?;
                serde_json::to_string(&entry)
                    .map_err(|e| BotError::Fatal(format!("column seal: {e}")))
            }
            None => Ok(plaintext.to_string()),
        }
    }

    pub fn open_column(&self, stored: &str) -> BotResult<String> {
        match &self.encryption_password {
            Some(password) => {
                let entry: KeystoreEntry = serde_json::from_str(stored)
                    .map_err(|e| BotError::Fatal(format!("column parse: {e}")))?;
                open_entry(&entry, password)
            }
            None => Ok(stored.to_string()),
        }
    }

    pub fn route_snapshot(&self, id: Uuid) -> BotResult<Option<String>> {
        let stored: Option<String> = {
            let conn = self.lock();
            let mut stmt = conn.prepare_cached(
                "SELECT route_snapshot_json FROM opportunities WHERE opportunity_id = ?1",
            )?;
            let mut rows = stmt.query(params![id.to_string()])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };
        stored.map(|s| self.open_column(&s)).transpose()
    }
}

fn parse_scope(raw: &str) -> Option<RiskScope> {
    if raw == "global" {
        return Some(RiskScope::Global);
    }
    if let Some(strategy) = raw.strip_prefix("strategy:") {
        let kind = match strategy {
            "arbitrage" => StrategyKind::Arbitrage,
            "sandwich" => StrategyKind::Sandwich,
            "copy" => StrategyKind::Copy,
            _ => return None,
        };
        return Some(RiskScope::Strategy(kind));
    }
    if let Some(chain) = raw.strip_prefix("chain:") {
        return chain.parse::<ChainId>().ok().map(RiskScope::Chain);
    }
    raw.strip_prefix("token:")
        .map(|t| RiskScope::Token(t.to_string()))
}

/// Record a risk event and confirm the write before returning; kill events
/// must be durable before the process reacts to them.
pub fn persist_risk_events(store: &Store, events: &[RiskEvent]) -> BotResult<()> {
    for event in events {
        store.record_risk_event(event)?;
        if event.severity == RiskSeverity::Kill {
            warn!("💀 durable kill recorded: {} ({})", event.reason, event.scope.as_str());
        }
    }
    Ok(())
}
