//! Wallet trading-skill scoring over the 30-day PnL window.
//!
//! Five bounded features, weighted into a 0–100 composite:
//! diminishing-returns PnL, win rate, breadth of profitable tokens, a
//! consistency gate, and the fraction of traded tokens old enough to not
//! look like fresh rugs. The feature breakdown is persisted alongside the
//! score for explainability.

use anyhow::Result;
use common::config::Scoring;
use common::db::AsyncDb;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

const DAY_SECS: i64 = 86_400;

#[derive(Debug, Clone, Copy)]
pub struct ScoreParams {
    pub pnl_weight: f64,
    pub win_rate_weight: f64,
    pub profitable_tokens_weight: f64,
    pub consistency_weight: f64,
    pub avoid_rug_weight: f64,
    pub profitable_token_target: u32,
    pub consistency_token_target: u32,
    pub avoid_rug_min_age_days: u32,
}

impl Default for ScoreParams {
    fn default() -> Self {
        Self {
            pnl_weight: 0.30,
            win_rate_weight: 0.30,
            profitable_tokens_weight: 0.20,
            consistency_weight: 0.10,
            avoid_rug_weight: 0.10,
            profitable_token_target: 10,
            consistency_token_target: 3,
            avoid_rug_min_age_days: 7,
        }
    }
}

impl From<&Scoring> for ScoreParams {
    fn from(cfg: &Scoring) -> Self {
        Self {
            pnl_weight: cfg.pnl_weight,
            win_rate_weight: cfg.win_rate_weight,
            profitable_tokens_weight: cfg.profitable_tokens_weight,
            consistency_weight: cfg.consistency_weight,
            avoid_rug_weight: cfg.avoid_rug_weight,
            profitable_token_target: cfg.profitable_token_target,
            consistency_token_target: cfg.consistency_token_target,
            avoid_rug_min_age_days: cfg.avoid_rug_min_age_days,
        }
    }
}

/// Per-wallet rollup of `wallet_token_pnl` rows (30-day window).
#[derive(Debug, Clone, Default)]
pub struct WalletAggregate {
    pub pnl_usd: f64,
    pub win_trades: u32,
    pub loss_trades: u32,
    pub profitable_tokens: u32,
    pub tokens: HashSet<String>,
}

/// Feature breakdown persisted as `features_json`.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreFeatures {
    pub pnl_usd_30d: f64,
    pub pnl_score: f64,
    pub win_rate: f64,
    pub profitable_tokens: u32,
    pub profitable_score: f64,
    pub consistency_score: f64,
    pub avoid_rug_score: f64,
}

fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

/// Diminishing returns: log10-scaled, $100k ≈ 1.0; negative PnL floors at 0.
pub fn pnl_score(total_pnl_usd: f64) -> f64 {
    clamp01((1.0 + total_pnl_usd.max(0.0)).log10() / 5.0)
}

pub fn win_rate(win_trades: u32, loss_trades: u32) -> f64 {
    let total = win_trades + loss_trades;
    if total == 0 {
        return 0.0;
    }
    f64::from(win_trades) / f64::from(total)
}

pub fn profitable_score(profitable_tokens: u32, target: u32) -> f64 {
    if target == 0 {
        return 0.0;
    }
    clamp01(f64::from(profitable_tokens) / f64::from(target))
}

pub fn consistency_score(profitable_tokens: u32, target: u32) -> f64 {
    if profitable_tokens >= target {
        1.0
    } else {
        0.0
    }
}

/// Fraction of the wallet's traded tokens whose first observation is at
/// least `min_age_days` old; 0 when the wallet has no tracked tokens.
pub fn avoid_rug_score(
    tokens: &HashSet<String>,
    first_seen: &HashMap<String, i64>,
    now: i64,
    min_age_days: u32,
) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }
    let min_age = i64::from(min_age_days) * DAY_SECS;
    let safe = tokens
        .iter()
        .filter(|token| {
            first_seen
                .get(*token)
                .copied()
                .filter(|ts| *ts > 0)
                .is_some_and(|ts| now - ts >= min_age)
        })
        .count();
    safe as f64 / tokens.len() as f64
}

/// Weighted composite as a 0–100 integer. Bounded by construction; the clamp
/// guards misconfigured weights.
pub fn compute_score(
    params: &ScoreParams,
    aggregate: &WalletAggregate,
    first_seen: &HashMap<String, i64>,
    now: i64,
) -> (i64, ScoreFeatures) {
    let pnl = pnl_score(aggregate.pnl_usd);
    let wr = win_rate(aggregate.win_trades, aggregate.loss_trades);
    let profitable = profitable_score(aggregate.profitable_tokens, params.profitable_token_target);
    let consistency =
        consistency_score(aggregate.profitable_tokens, params.consistency_token_target);
    let avoid_rug = avoid_rug_score(
        &aggregate.tokens,
        first_seen,
        now,
        params.avoid_rug_min_age_days,
    );

    let weighted = params.pnl_weight * pnl
        + params.win_rate_weight * wr
        + params.profitable_tokens_weight * profitable
        + params.consistency_weight * consistency
        + params.avoid_rug_weight * avoid_rug;

    let score = (weighted * 100.0).round().clamp(0.0, 100.0) as i64;
    let features = ScoreFeatures {
        pnl_usd_30d: aggregate.pnl_usd,
        pnl_score: pnl,
        win_rate: wr,
        profitable_tokens: aggregate.profitable_tokens,
        profitable_score: profitable,
        consistency_score: consistency,
        avoid_rug_score: avoid_rug,
    };
    (score, features)
}

/// Aggregate `wallet_token_pnl` per wallet and upsert 30d `wallet_scores`.
pub async fn update_wallet_scores(
    db: &AsyncDb,
    params: ScoreParams,
    chain_id: u64,
    now: i64,
) -> Result<u64> {
    let cid = chain_id as i64;

    db.call_named("scoring.update", move |conn| {
        let mut wallets: HashMap<String, WalletAggregate> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT wallet, token, realized_pnl_usd_30d, win_trades_30d, loss_trades_30d
                 FROM wallet_token_pnl WHERE chain_id = ?1",
            )?;
            let rows = stmt.query_map([cid], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?;

            for row in rows {
                let (wallet, token, pnl_usd, wins, losses) = row?;
                let entry = wallets.entry(wallet).or_default();
                entry.pnl_usd += pnl_usd;
                entry.win_trades += wins.max(0) as u32;
                entry.loss_trades += losses.max(0) as u32;
                if pnl_usd > 0.0 {
                    entry.profitable_tokens += 1;
                }
                entry.tokens.insert(token);
            }
        }

        if wallets.is_empty() {
            return Ok(0);
        }

        // Token age from the earliest observed transfer.
        let mut first_seen: HashMap<String, i64> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT token, MIN(timestamp) FROM token_transfers
                 WHERE chain_id = ?1 GROUP BY token",
            )?;
            let rows = stmt.query_map([cid], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (token, ts) = row?;
                first_seen.insert(token, ts);
            }
        }

        let tx = conn.transaction()?;
        let mut upserted = 0_u64;
        for (wallet, aggregate) in &wallets {
            let (score, features) = compute_score(&params, aggregate, &first_seen, now);
            let features_json = serde_json::to_string(&features).unwrap_or_else(|_| "{}".to_string());

            tx.execute(
                "INSERT INTO wallet_scores (chain_id, wallet, window, score, features_json, updated_at)
                 VALUES (?1, ?2, '30d', ?3, ?4, datetime('now'))
                 ON CONFLICT(chain_id, wallet, window) DO UPDATE SET
                    score = excluded.score,
                    features_json = excluded.features_json,
                    updated_at = excluded.updated_at",
                rusqlite::params![cid, wallet, score, features_json],
            )?;
            upserted += 1;
        }
        tx.commit()?;

        Ok(upserted)
    })
    .await
}
