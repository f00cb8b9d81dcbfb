//! Realized PnL via FIFO lot accounting.
//!
//! Only swaps with exactly one stablecoin leg participate: a stable→token
//! swap opens a lot (amount, USD cost, timestamp); a token→stable swap
//! consumes lots in acquisition order, prorating cost and proceeds by the
//! consumed fraction. A sale with no open lots has no trackable cost basis
//! and contributes nothing. Computed over all history and over the trailing
//! 30 days; both land in `wallet_token_pnl`.

use alloy::primitives::U256;
use anyhow::Result;
use common::config::ChainConfig;
use common::db::AsyncDb;
use std::collections::{HashMap, HashSet, VecDeque};

const DAY_SECS: i64 = 86_400;
pub const PNL_WINDOW_SECS: i64 = 30 * DAY_SECS;

#[derive(Debug, Clone)]
pub struct PnlSwap {
    pub trader: Option<String>,
    pub token_in: String,
    pub token_out: String,
    pub amount_in_raw: U256,
    pub amount_out_raw: U256,
    pub amount_in_dec: String,
    pub amount_out_dec: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PnlStats {
    pub realized_pnl_usd: f64,
    pub win_trades: u32,
    pub loss_trades: u32,
    pub hold_seconds_sum: f64,
    pub hold_count: f64,
}

impl PnlStats {
    pub fn avg_hold_seconds(&self) -> i64 {
        if self.hold_count > 0.0 {
            (self.hold_seconds_sum / self.hold_count).round() as i64
        } else {
            0
        }
    }
}

struct Lot {
    amount_raw: U256,
    cost_usd: f64,
    timestamp: i64,
}

fn u256_f64(value: U256) -> f64 {
    value.to_string().parse().unwrap_or(f64::MAX)
}

/// Walk swaps in timestamp order and produce per-`(wallet, token)` realized
/// PnL. `swaps` must already be ordered oldest-first.
pub fn compute_pnl_stats(
    swaps: &[PnlSwap],
    stablecoins: &HashSet<String>,
) -> HashMap<(String, String), PnlStats> {
    let mut lots: HashMap<(String, String), VecDeque<Lot>> = HashMap::new();
    let mut stats: HashMap<(String, String), PnlStats> = HashMap::new();

    for swap in swaps {
        let Some(trader) = swap.trader.clone() else {
            continue;
        };
        let in_stable = stablecoins.contains(&swap.token_in);
        let out_stable = stablecoins.contains(&swap.token_out);

        if in_stable && !out_stable {
            // Opens a lot: bought token_out for USD.
            let Ok(cost_usd) = swap.amount_in_dec.parse::<f64>() else {
                continue;
            };
            if !cost_usd.is_finite() || cost_usd <= 0.0 {
                continue;
            }
            lots.entry((trader, swap.token_out.clone()))
                .or_default()
                .push_back(Lot {
                    amount_raw: swap.amount_out_raw,
                    cost_usd,
                    timestamp: swap.timestamp,
                });
            continue;
        }

        if out_stable && !in_stable {
            // Consumes lots: sold token_in for USD.
            let Ok(proceeds_usd) = swap.amount_out_dec.parse::<f64>() else {
                continue;
            };
            let Ok(sold_dec) = swap.amount_in_dec.parse::<f64>() else {
                continue;
            };
            if !proceeds_usd.is_finite() || !sold_dec.is_finite() || sold_dec <= 0.0 {
                continue;
            }

            let key = (trader, swap.token_in.clone());
            let Some(queue) = lots.get_mut(&key) else {
                continue;
            };
            if queue.is_empty() {
                continue;
            }

            let sold_raw = u256_f64(swap.amount_in_raw);
            let mut remaining = swap.amount_in_raw;
            let mut realized = 0.0;
            let mut hold_seconds_sum = 0.0;
            let mut hold_count = 0.0;

            while remaining > U256::ZERO {
                let Some(lot) = queue.front_mut() else {
                    break;
                };
                let take = remaining.min(lot.amount_raw);
                let take_ratio = u256_f64(take) / u256_f64(lot.amount_raw);
                let proceeds_ratio = u256_f64(take) / sold_raw;

                let cost_portion = lot.cost_usd * take_ratio;
                let proceeds_portion = proceeds_usd * proceeds_ratio;
                realized += proceeds_portion - cost_portion;
                hold_seconds_sum += (swap.timestamp - lot.timestamp) as f64 * take_ratio;
                hold_count += take_ratio;

                remaining -= take;
                lot.amount_raw -= take;
                lot.cost_usd -= cost_portion;
                if lot.amount_raw == U256::ZERO {
                    queue.pop_front();
                }
            }

            let stat = stats.entry(key).or_default();
            stat.realized_pnl_usd += realized;
            if realized >= 0.0 {
                stat.win_trades += 1;
            } else {
                stat.loss_trades += 1;
            }
            stat.hold_seconds_sum += hold_seconds_sum;
            stat.hold_count += hold_count;
        }
    }

    stats
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Recompute realized PnL for every wallet on a chain and upsert
/// `wallet_token_pnl` (all-time and trailing 30 days relative to `now`).
pub async fn update_wallet_pnl(db: &AsyncDb, chain: &ChainConfig, now: i64) -> Result<u64> {
    let stablecoins = chain.stablecoin_set();
    let cid = chain.chain_id as i64;

    db.call_named("pnl.update", move |conn| {
        let mut swaps: Vec<PnlSwap> = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT trader, token_in, token_out, amount_in_raw, amount_out_raw,
                        amount_in_dec, amount_out_dec, timestamp
                 FROM swaps
                 WHERE chain_id = ?1
                 ORDER BY timestamp ASC, block_number ASC, log_index ASC",
            )?;
            let rows = stmt.query_map([cid], |row| {
                Ok(PnlSwap {
                    trader: row.get(0)?,
                    token_in: row.get(1)?,
                    token_out: row.get(2)?,
                    amount_in_raw: row
                        .get::<_, String>(3)?
                        .parse::<U256>()
                        .unwrap_or(U256::ZERO),
                    amount_out_raw: row
                        .get::<_, String>(4)?
                        .parse::<U256>()
                        .unwrap_or(U256::ZERO),
                    amount_in_dec: row.get(5)?,
                    amount_out_dec: row.get(6)?,
                    timestamp: row.get(7)?,
                })
            })?;
            for row in rows {
                let swap = row?;
                // Only stable-legged swaps participate in cost basis.
                if stablecoins.contains(&swap.token_in) || stablecoins.contains(&swap.token_out) {
                    swaps.push(swap);
                }
            }
        }

        let since = now - PNL_WINDOW_SECS;
        let recent: Vec<PnlSwap> = swaps
            .iter()
            .filter(|s| s.timestamp >= since)
            .cloned()
            .collect();

        let all_stats = compute_pnl_stats(&swaps, &stablecoins);
        let recent_stats = compute_pnl_stats(&recent, &stablecoins);

        let mut keys: HashSet<(String, String)> = all_stats.keys().cloned().collect();
        keys.extend(recent_stats.keys().cloned());

        let tx = conn.transaction()?;
        let mut upserted = 0_u64;
        for key in keys {
            let all = all_stats.get(&key).cloned().unwrap_or_default();
            let recent = recent_stats.get(&key).cloned().unwrap_or_default();
            let (wallet, token) = key;

            tx.execute(
                "INSERT INTO wallet_token_pnl (chain_id, wallet, token, realized_pnl_usd_30d, realized_pnl_usd_all, win_trades_30d, loss_trades_30d, avg_hold_seconds_30d)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(chain_id, wallet, token) DO UPDATE SET
                    realized_pnl_usd_30d = excluded.realized_pnl_usd_30d,
                    realized_pnl_usd_all = excluded.realized_pnl_usd_all,
                    win_trades_30d = excluded.win_trades_30d,
                    loss_trades_30d = excluded.loss_trades_30d,
                    avg_hold_seconds_30d = excluded.avg_hold_seconds_30d",
                rusqlite::params![
                    cid,
                    wallet,
                    token,
                    round4(recent.realized_pnl_usd),
                    round4(all.realized_pnl_usd),
                    recent.win_trades,
                    recent.loss_trades,
                    recent.avg_hold_seconds(),
                ],
            )?;
            upserted += 1;
        }
        tx.commit()?;

        Ok(upserted)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    const STABLE: &str = "0xstable";
    const TOKEN: &str = "0xtoken";
    const WALLET: &str = "0xwallet";

    fn stables() -> HashSet<String> {
        [STABLE.to_string()].into_iter().collect()
    }

    fn buy(usd: f64, token_amount: u64, timestamp: i64) -> PnlSwap {
        PnlSwap {
            trader: Some(WALLET.to_string()),
            token_in: STABLE.to_string(),
            token_out: TOKEN.to_string(),
            amount_in_raw: U256::from((usd * 1e6) as u64),
            amount_out_raw: U256::from(token_amount),
            amount_in_dec: format!("{usd}"),
            amount_out_dec: format!("{token_amount}"),
            timestamp,
        }
    }

    fn sell(token_amount: u64, usd: f64, timestamp: i64) -> PnlSwap {
        PnlSwap {
            trader: Some(WALLET.to_string()),
            token_in: TOKEN.to_string(),
            token_out: STABLE.to_string(),
            amount_in_raw: U256::from(token_amount),
            amount_out_raw: U256::from((usd * 1e6) as u64),
            amount_in_dec: format!("{token_amount}"),
            amount_out_dec: format!("{usd}"),
            timestamp,
        }
    }

    fn key() -> (String, String) {
        (WALLET.to_string(), TOKEN.to_string())
    }

    #[test]
    fn test_buy_then_profitable_sell() {
        // Buy 100 TOKEN for 100 USDC, sell all 100 for 150 USDC.
        let swaps = vec![buy(100.0, 100, 1000), sell(100, 150.0, 2000)];
        let stats = compute_pnl_stats(&swaps, &stables());

        let s = stats.get(&key()).unwrap();
        assert!((s.realized_pnl_usd - 50.0).abs() < 1e-9);
        assert_eq!(s.win_trades, 1);
        assert_eq!(s.loss_trades, 0);
        assert_eq!(s.avg_hold_seconds(), 1000);
    }

    #[test]
    fn test_sale_without_lots_contributes_nothing() {
        let swaps = vec![
            buy(100.0, 100, 1000),
            sell(100, 150.0, 2000),
            // Lots exhausted: this sale has no trackable cost basis.
            sell(50, 75.0, 3000),
        ];
        let stats = compute_pnl_stats(&swaps, &stables());

        let s = stats.get(&key()).unwrap();
        assert!((s.realized_pnl_usd - 50.0).abs() < 1e-9);
        assert_eq!(s.win_trades, 1);
        assert_eq!(s.loss_trades, 0);
    }

    #[test]
    fn test_partial_lot_consumption_prorates_cost() {
        let swaps = vec![
            buy(100.0, 100, 1000),
            // Sell half for 75: cost portion 50, realized +25.
            sell(50, 75.0, 2000),
            // Sell the rest for 40: cost portion 50, realized -10.
            sell(50, 40.0, 3000),
        ];
        let stats = compute_pnl_stats(&swaps, &stables());

        let s = stats.get(&key()).unwrap();
        assert!((s.realized_pnl_usd - 15.0).abs() < 1e-9);
        assert_eq!(s.win_trades, 1);
        assert_eq!(s.loss_trades, 1);
    }

    #[test]
    fn test_fifo_consumes_oldest_lot_first() {
        let swaps = vec![
            buy(100.0, 100, 1000), // lot 1: $1/token
            buy(200.0, 100, 2000), // lot 2: $2/token
            // Sell 150 for 300: lot1 fully (cost 100, proceeds 200 -> +100),
            // half of lot2 (cost 100, proceeds 100 -> 0).
            sell(150, 300.0, 3000),
        ];
        let stats = compute_pnl_stats(&swaps, &stables());

        let s = stats.get(&key()).unwrap();
        assert!((s.realized_pnl_usd - 100.0).abs() < 1e-9);
        assert_eq!(s.win_trades, 1);
    }

    #[test]
    fn test_hold_duration_weighted_by_consumed_fraction() {
        let swaps = vec![
            buy(100.0, 100, 0),
            buy(100.0, 100, 1000),
            // Consumes all of lot1 (held 2000s) and all of lot2 (held 1000s).
            sell(200, 300.0, 2000),
        ];
        let stats = compute_pnl_stats(&swaps, &stables());

        let s = stats.get(&key()).unwrap();
        // Two fully consumed lots: (2000*1 + 1000*1) / 2.
        assert_eq!(s.avg_hold_seconds(), 1500);
    }

    #[test]
    fn test_stable_to_stable_swaps_are_ignored() {
        let swaps = vec![PnlSwap {
            trader: Some(WALLET.to_string()),
            token_in: STABLE.to_string(),
            token_out: STABLE.to_string(),
            amount_in_raw: U256::from(100u64),
            amount_out_raw: U256::from(100u64),
            amount_in_dec: "100".to_string(),
            amount_out_dec: "100".to_string(),
            timestamp: 1000,
        }];
        let stats = compute_pnl_stats(&swaps, &stables());
        assert!(stats.is_empty());
    }

    #[test]
    fn test_swaps_without_trader_are_ignored() {
        let mut swap = buy(100.0, 100, 1000);
        swap.trader = None;
        let stats = compute_pnl_stats(&[swap, sell(100, 200.0, 2000)], &stables());
        // The buy never opened a lot, so the sale finds nothing.
        assert!(stats.is_empty());
    }

    async fn seed_swap(db: &AsyncDb, s: &PnlSwap, log_index: i64) {
        let s = s.clone();
        db.call(move |conn| {
            conn.execute(
                "INSERT INTO swaps (chain_id, tx_hash, log_index, block_number, dex, pool, trader, token_in, token_out, amount_in_raw, amount_out_raw, amount_in_dec, amount_out_dec, usd_value, priced, timestamp)
                 VALUES (1, '0xtx', ?1, 100, 'uniswap-v2', '0xpool', ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, 0, ?9)",
                rusqlite::params![
                    log_index,
                    s.trader,
                    s.token_in,
                    s.token_out,
                    s.amount_in_raw.to_string(),
                    s.amount_out_raw.to_string(),
                    s.amount_in_dec,
                    s.amount_out_dec,
                    s.timestamp
                ],
            )?;
            Ok(())
        })
        .await
        .unwrap();
    }

    fn test_chain() -> ChainConfig {
        ChainConfig {
            chain_id: 1,
            name: "Testnet".to_string(),
            short_name: "test".to_string(),
            native_symbol: "ETH".to_string(),
            rpc_urls: vec![],
            stablecoins: vec![STABLE.to_string()],
            confirmations: 5,
        }
    }

    #[tokio::test]
    async fn test_update_wallet_pnl_separates_windows() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let now = 100 * DAY_SECS;

        // Old round trip (+50) outside the 30d window.
        seed_swap(&db, &buy(100.0, 100, 10 * DAY_SECS), 0).await;
        seed_swap(&db, &sell(100, 150.0, 11 * DAY_SECS), 1).await;
        // Recent round trip (-20) inside the window.
        seed_swap(&db, &buy(100.0, 100, 90 * DAY_SECS), 2).await;
        seed_swap(&db, &sell(100, 80.0, 91 * DAY_SECS), 3).await;

        let upserted = update_wallet_pnl(&db, &test_chain(), now).await.unwrap();
        assert_eq!(upserted, 1);

        let (pnl_30d, pnl_all, wins, losses): (f64, f64, i64, i64) = db
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT realized_pnl_usd_30d, realized_pnl_usd_all, win_trades_30d, loss_trades_30d
                     FROM wallet_token_pnl WHERE chain_id = 1 AND wallet = ?1 AND token = ?2",
                    rusqlite::params![WALLET, TOKEN],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
                )?)
            })
            .await
            .unwrap();

        assert!((pnl_all - 30.0).abs() < 1e-6, "all-time = +50 - 20");
        assert!((pnl_30d - (-20.0)).abs() < 1e-6, "window sees only the loss");
        assert_eq!(wins, 0);
        assert_eq!(losses, 1);
    }
}
