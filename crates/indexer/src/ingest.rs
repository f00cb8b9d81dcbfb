//! Per-chain sequential block walker.
//!
//! For each block: fetch the block with transactions and the three log
//! families, decode and classify everything in memory, then commit the
//! block's rows in a single SQLite transaction. A stored hash that differs
//! from the fetched one is a reorg: all dependent rows for that height are
//! deleted inside the same transaction before the new rows go in. Because
//! every RPC read happens before the write phase, a transport failure aborts
//! the block with nothing committed and the next poll retries the range.

use crate::abi::{self, addr_hex, b256_hex, erc20, v2, v3};
use crate::chain_client::ChainClient;
use crate::metadata::MetadataCache;
use alloy::primitives::utils::format_units;
use alloy::primitives::{I256, U256};
use alloy::sol_types::SolEvent;
use anyhow::{Context, Result};
use common::config::ChainConfig;
use common::db::AsyncDb;
use common::rpc::RpcLog;
use common::types::Dex;
use rusqlite::OptionalExtension;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub blocks: u64,
    pub transfers: u64,
    pub swaps: u64,
    pub reorgs: u64,
}

struct TxRow {
    hash: String,
    from: String,
    to: Option<String>,
    value_wei: String,
}

struct LogRow {
    tx_hash: String,
    log_index: i64,
    address: String,
    topic0: Option<String>,
    topics_json: String,
    data: String,
}

struct TokenRow {
    address: String,
    symbol: String,
    decimals: u8,
    name: String,
    first_seen_block: i64,
    first_seen_at: i64,
}

struct TransferRow {
    tx_hash: String,
    log_index: i64,
    token: String,
    from: String,
    to: String,
    amount_raw: String,
    amount_dec: String,
}

struct SwapRow {
    tx_hash: String,
    log_index: i64,
    dex: &'static str,
    pool: String,
    trader: Option<String>,
    token_in: String,
    token_out: String,
    amount_in_raw: String,
    amount_out_raw: String,
    amount_in_dec: String,
    amount_out_dec: String,
    usd_value: Option<f64>,
    priced: bool,
}

fn units(value: U256, decimals: u8) -> String {
    format_units(value, decimals).unwrap_or_else(|_| value.to_string())
}

/// Stablecoin-leg pricing: USD value is the decimal amount of the stable leg,
/// accepted only when it parses to a finite positive number.
fn price_leg(amount_dec: &str) -> (Option<f64>, bool) {
    match amount_dec.parse::<f64>() {
        Ok(v) if v.is_finite() && v > 0.0 => (Some(v), true),
        _ => (None, false),
    }
}

fn raw_log_row(log: &RpcLog) -> LogRow {
    let topics: Vec<String> = log.topics.iter().map(|t| b256_hex(*t)).collect();
    LogRow {
        tx_hash: b256_hex(log.transaction_hash),
        log_index: log.log_index.to::<u64>() as i64,
        address: addr_hex(log.address),
        topic0: topics.first().cloned(),
        topics_json: serde_json::to_string(&topics).unwrap_or_else(|_| "[]".to_string()),
        data: log.data.to_string(),
    }
}

/// Ingest an inclusive block range for one chain, strictly in order.
pub async fn ingest_range<C: ChainClient + Sync>(
    db: &AsyncDb,
    client: &C,
    cache: &MetadataCache,
    chain: &ChainConfig,
    from_block: u64,
    to_block: u64,
) -> Result<IngestStats> {
    let stablecoins = chain.stablecoin_set();
    let mut stats = IngestStats::default();

    for number in from_block..=to_block {
        ingest_block(db, client, cache, chain, &stablecoins, number, &mut stats)
            .await
            .with_context(|| format!("chain {} block {number}", chain.chain_id))?;
    }

    Ok(stats)
}

#[allow(clippy::too_many_lines)] // fetch/decode phase + the block transaction
async fn ingest_block<C: ChainClient + Sync>(
    db: &AsyncDb,
    client: &C,
    cache: &MetadataCache,
    chain: &ChainConfig,
    stablecoins: &HashSet<String>,
    number: u64,
    stats: &mut IngestStats,
) -> Result<()> {
    // ── Fetch phase: every RPC read happens before any write ──
    let Some(block) = client.block_with_txs(number).await? else {
        tracing::warn!(chain = %chain.short_name, number, "block not available; skipping");
        return Ok(());
    };

    let transfer_logs = client
        .logs_by_topic(number, number, erc20::Transfer::SIGNATURE_HASH)
        .await?;
    let v2_logs = client
        .logs_by_topic(number, number, v2::Swap::SIGNATURE_HASH)
        .await?;
    let v3_logs = client
        .logs_by_topic(number, number, v3::Swap::SIGNATURE_HASH)
        .await?;

    let block_hash = b256_hex(block.hash);
    let parent_hash = b256_hex(block.parent_hash);
    let timestamp = block.timestamp.to::<u64>() as i64;

    let mut tx_senders: HashMap<String, String> = HashMap::new();
    let mut tx_rows = Vec::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        let hash = b256_hex(tx.hash);
        let from = addr_hex(tx.from);
        tx_senders.insert(hash.clone(), from.clone());
        tx_rows.push(TxRow {
            hash,
            from,
            to: tx.to.map(addr_hex),
            value_wei: tx.value.to_string(),
        });
    }

    let log_rows: Vec<LogRow> = transfer_logs
        .iter()
        .chain(&v2_logs)
        .chain(&v3_logs)
        .map(raw_log_row)
        .collect();

    // Per-block memo on top of the shared cache so each token is resolved
    // once per block.
    let mut token_rows: HashMap<String, TokenRow> = HashMap::new();

    // ── Decode phase ──
    let mut transfer_rows = Vec::new();
    for log in &transfer_logs {
        let Ok(event) = erc20::Transfer::decode_log_data(&abi::log_data(log)) else {
            metrics::counter!("indexer_log_decode_skips_total", "kind" => "transfer").increment(1);
            continue;
        };
        let token = addr_hex(log.address);
        let decimals = resolve_token(
            cache,
            client,
            chain,
            &mut token_rows,
            &token,
            number,
            timestamp,
        )
        .await;

        transfer_rows.push(TransferRow {
            tx_hash: b256_hex(log.transaction_hash),
            log_index: log.log_index.to::<u64>() as i64,
            token,
            from: addr_hex(event.from),
            to: addr_hex(event.to),
            amount_raw: event.value.to_string(),
            amount_dec: units(event.value, decimals),
        });
    }

    let mut swap_rows = Vec::new();
    for log in &v2_logs {
        let Ok(event) = v2::Swap::decode_log_data(&abi::log_data(log)) else {
            metrics::counter!("indexer_log_decode_skips_total", "kind" => "swap_v2").increment(1);
            continue;
        };
        let pool = addr_hex(log.address);
        let pair = cache.pair_tokens(client, chain.chain_id, &pool).await?;

        // Exactly one in-leg and the opposite out-leg must be nonzero.
        let (token_in, token_out, amount_in, amount_out) =
            if event.amount0In > U256::ZERO && event.amount1Out > U256::ZERO {
                (pair.token0, pair.token1, event.amount0In, event.amount1Out)
            } else if event.amount1In > U256::ZERO && event.amount0Out > U256::ZERO {
                (pair.token1, pair.token0, event.amount1In, event.amount0Out)
            } else {
                metrics::counter!("indexer_malformed_swaps_total", "dex" => Dex::UniswapV2.as_str())
                    .increment(1);
                continue;
            };

        swap_rows.push(
            build_swap(
                cache,
                client,
                chain,
                stablecoins,
                &mut token_rows,
                &tx_senders,
                log,
                Dex::UniswapV2,
                pool,
                token_in,
                token_out,
                amount_in,
                amount_out,
                number,
                timestamp,
            )
            .await,
        );
    }

    for log in &v3_logs {
        let Ok(event) = v3::Swap::decode_log_data(&abi::log_data(log)) else {
            metrics::counter!("indexer_log_decode_skips_total", "kind" => "swap_v3").increment(1);
            continue;
        };
        let pool = addr_hex(log.address);
        let tokens = cache.pool_tokens(client, chain.chain_id, &pool).await?;

        // Amounts are signed: positive flows into the pool, negative out.
        let (token_in, token_out, amount_in, amount_out) =
            if event.amount0 > I256::ZERO && event.amount1 < I256::ZERO {
                (
                    tokens.token0,
                    tokens.token1,
                    event.amount0.unsigned_abs(),
                    event.amount1.unsigned_abs(),
                )
            } else if event.amount1 > I256::ZERO && event.amount0 < I256::ZERO {
                (
                    tokens.token1,
                    tokens.token0,
                    event.amount1.unsigned_abs(),
                    event.amount0.unsigned_abs(),
                )
            } else {
                metrics::counter!("indexer_malformed_swaps_total", "dex" => Dex::UniswapV3.as_str())
                    .increment(1);
                continue;
            };

        swap_rows.push(
            build_swap(
                cache,
                client,
                chain,
                stablecoins,
                &mut token_rows,
                &tx_senders,
                log,
                Dex::UniswapV3,
                pool,
                token_in,
                token_out,
                amount_in,
                amount_out,
                number,
                timestamp,
            )
            .await,
        );
    }

    stats.blocks += 1;
    stats.transfers += transfer_rows.len() as u64;
    stats.swaps += swap_rows.len() as u64;

    // ── Commit phase: one transaction per block ──
    let chain_id = chain.chain_id as i64;
    let number_i = number as i64;
    let token_rows: Vec<TokenRow> = token_rows.into_values().collect();

    let reorged = db
        .call_named("ingest.block", move |conn| {
            let tx = conn.transaction()?;

            let existing: Option<String> = tx
                .query_row(
                    "SELECT hash FROM blocks WHERE chain_id = ?1 AND number = ?2",
                    rusqlite::params![chain_id, number_i],
                    |row| row.get(0),
                )
                .optional()?;
            let reorged = matches!(&existing, Some(h) if *h != block_hash);

            if reorged {
                // Dependency order: derived rows first, the block last.
                for table in ["token_transfers", "swaps", "logs", "transactions"] {
                    tx.execute(
                        &format!("DELETE FROM {table} WHERE chain_id = ?1 AND block_number = ?2"),
                        rusqlite::params![chain_id, number_i],
                    )?;
                }
                tx.execute(
                    "DELETE FROM blocks WHERE chain_id = ?1 AND number = ?2",
                    rusqlite::params![chain_id, number_i],
                )?;
            }

            tx.execute(
                "INSERT INTO blocks (chain_id, number, hash, parent_hash, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(chain_id, number) DO UPDATE SET
                    hash = excluded.hash,
                    parent_hash = excluded.parent_hash,
                    timestamp = excluded.timestamp",
                rusqlite::params![chain_id, number_i, block_hash, parent_hash, timestamp],
            )?;

            for t in &tx_rows {
                tx.execute(
                    "INSERT INTO transactions (chain_id, hash, block_number, from_addr, to_addr, value_wei)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(chain_id, hash) DO UPDATE SET
                        block_number = excluded.block_number,
                        from_addr = excluded.from_addr,
                        to_addr = excluded.to_addr,
                        value_wei = excluded.value_wei",
                    rusqlite::params![chain_id, t.hash, number_i, t.from, t.to, t.value_wei],
                )?;
            }

            for l in &log_rows {
                tx.execute(
                    "INSERT INTO logs (chain_id, tx_hash, log_index, block_number, address, topic0, topics_json, data)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(chain_id, tx_hash, log_index) DO UPDATE SET
                        block_number = excluded.block_number,
                        address = excluded.address,
                        topic0 = excluded.topic0,
                        topics_json = excluded.topics_json,
                        data = excluded.data",
                    rusqlite::params![
                        chain_id,
                        l.tx_hash,
                        l.log_index,
                        number_i,
                        l.address,
                        l.topic0,
                        l.topics_json,
                        l.data
                    ],
                )?;
            }

            for tok in &token_rows {
                // decimals/symbol are never retroactively invalidated; first
                // seen markers keep their earliest values.
                tx.execute(
                    "INSERT INTO tokens (chain_id, address, symbol, decimals, name, first_seen_block, first_seen_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(chain_id, address) DO UPDATE SET
                        symbol = excluded.symbol,
                        decimals = excluded.decimals,
                        name = excluded.name,
                        first_seen_block = COALESCE(tokens.first_seen_block, excluded.first_seen_block),
                        first_seen_at = COALESCE(tokens.first_seen_at, excluded.first_seen_at)",
                    rusqlite::params![
                        chain_id,
                        tok.address,
                        tok.symbol,
                        tok.decimals,
                        tok.name,
                        tok.first_seen_block,
                        tok.first_seen_at
                    ],
                )?;
            }

            for tr in &transfer_rows {
                tx.execute(
                    "INSERT INTO token_transfers (chain_id, tx_hash, log_index, block_number, token, from_addr, to_addr, amount_raw, amount_dec, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(chain_id, tx_hash, log_index) DO UPDATE SET
                        block_number = excluded.block_number,
                        token = excluded.token,
                        from_addr = excluded.from_addr,
                        to_addr = excluded.to_addr,
                        amount_raw = excluded.amount_raw,
                        amount_dec = excluded.amount_dec,
                        timestamp = excluded.timestamp",
                    rusqlite::params![
                        chain_id,
                        tr.tx_hash,
                        tr.log_index,
                        number_i,
                        tr.token,
                        tr.from,
                        tr.to,
                        tr.amount_raw,
                        tr.amount_dec,
                        timestamp
                    ],
                )?;
            }

            for s in &swap_rows {
                tx.execute(
                    "INSERT INTO swaps (chain_id, tx_hash, log_index, block_number, dex, pool, trader, token_in, token_out, amount_in_raw, amount_out_raw, amount_in_dec, amount_out_dec, usd_value, priced, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                     ON CONFLICT(chain_id, tx_hash, log_index) DO UPDATE SET
                        block_number = excluded.block_number,
                        dex = excluded.dex,
                        pool = excluded.pool,
                        trader = excluded.trader,
                        token_in = excluded.token_in,
                        token_out = excluded.token_out,
                        amount_in_raw = excluded.amount_in_raw,
                        amount_out_raw = excluded.amount_out_raw,
                        amount_in_dec = excluded.amount_in_dec,
                        amount_out_dec = excluded.amount_out_dec,
                        usd_value = excluded.usd_value,
                        priced = excluded.priced,
                        timestamp = excluded.timestamp",
                    rusqlite::params![
                        chain_id,
                        s.tx_hash,
                        s.log_index,
                        number_i,
                        s.dex,
                        s.pool,
                        s.trader,
                        s.token_in,
                        s.token_out,
                        s.amount_in_raw,
                        s.amount_out_raw,
                        s.amount_in_dec,
                        s.amount_out_dec,
                        s.usd_value,
                        s.priced,
                        timestamp
                    ],
                )?;
            }

            tx.commit()?;
            Ok(reorged)
        })
        .await?;

    if reorged {
        stats.reorgs += 1;
        metrics::counter!("indexer_reorgs_total", "chain" => chain.short_name.clone()).increment(1);
        tracing::info!(chain = %chain.short_name, number, "reorg recovered: block rows replaced");
    }
    metrics::counter!("indexer_blocks_ingested_total", "chain" => chain.short_name.clone())
        .increment(1);

    Ok(())
}

/// Ensure a token row exists in the per-block memo; returns its decimals.
async fn resolve_token<C: ChainClient + Sync>(
    cache: &MetadataCache,
    client: &C,
    chain: &ChainConfig,
    token_rows: &mut HashMap<String, TokenRow>,
    token: &str,
    number: u64,
    timestamp: i64,
) -> u8 {
    if let Some(row) = token_rows.get(token) {
        return row.decimals;
    }
    let meta = cache.token_meta(client, chain.chain_id, token).await;
    let decimals = meta.decimals;
    token_rows.insert(
        token.to_string(),
        TokenRow {
            address: token.to_string(),
            symbol: meta.symbol,
            decimals: meta.decimals,
            name: meta.name,
            first_seen_block: number as i64,
            first_seen_at: timestamp,
        },
    );
    decimals
}

#[allow(clippy::too_many_arguments)]
async fn build_swap<C: ChainClient + Sync>(
    cache: &MetadataCache,
    client: &C,
    chain: &ChainConfig,
    stablecoins: &HashSet<String>,
    token_rows: &mut HashMap<String, TokenRow>,
    tx_senders: &HashMap<String, String>,
    log: &RpcLog,
    dex: Dex,
    pool: String,
    token_in: String,
    token_out: String,
    amount_in: U256,
    amount_out: U256,
    number: u64,
    timestamp: i64,
) -> SwapRow {
    let dec_in = resolve_token(cache, client, chain, token_rows, &token_in, number, timestamp).await;
    let dec_out =
        resolve_token(cache, client, chain, token_rows, &token_out, number, timestamp).await;

    let amount_in_dec = units(amount_in, dec_in);
    let amount_out_dec = units(amount_out, dec_out);

    let (usd_value, priced) = if stablecoins.contains(&token_in) {
        price_leg(&amount_in_dec)
    } else if stablecoins.contains(&token_out) {
        price_leg(&amount_out_dec)
    } else {
        (None, false)
    };

    let tx_hash = b256_hex(log.transaction_hash);
    SwapRow {
        trader: tx_senders.get(&tx_hash).cloned(),
        tx_hash,
        log_index: log.log_index.to::<u64>() as i64,
        dex: dex.as_str(),
        pool,
        token_in,
        token_out,
        amount_in_raw: amount_in.to_string(),
        amount_out_raw: amount_out.to_string(),
        amount_in_dec,
        amount_out_dec,
        usd_value,
        priced,
    }
}

/// Highest ingested block for a chain; 0 for a fresh database.
pub async fn last_processed_block(db: &AsyncDb, chain_id: u64) -> Result<u64> {
    let cid = chain_id as i64;
    db.call(move |conn| {
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(number) FROM blocks WHERE chain_id = ?1",
            [cid],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0) as u64)
    })
    .await
}
