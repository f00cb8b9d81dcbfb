//! Wallet position maintenance from transfer deltas.
//!
//! `update_wallet_positions` folds every transfer in a block range into the
//! stored balances: debit the sender, credit the receiver. It is an
//! incremental accumulator, NOT idempotent — applying the same range twice
//! double-counts. The worker owns exactly-once application through the
//! `analytics_cursor` table (see `jobs::run_analytics_once`).

use alloy::primitives::utils::format_units;
use alloy::primitives::I256;
use anyhow::Result;
use common::db::AsyncDb;
use rusqlite::OptionalExtension;
use std::collections::{BTreeMap, HashMap};

fn signed_units(value: I256, decimals: u8) -> String {
    format_units(value, decimals).unwrap_or_else(|_| value.to_string())
}

/// Apply transfer deltas for `(from_block, to_block)` inclusive. Returns the
/// number of positions written.
pub async fn update_wallet_positions(
    db: &AsyncDb,
    chain_id: u64,
    from_block: u64,
    to_block: u64,
) -> Result<u64> {
    let cid = chain_id as i64;
    let from = from_block as i64;
    let to = to_block as i64;

    db.call_named("positions.update", move |conn| {
        let tx = conn.transaction()?;

        let mut deltas: BTreeMap<(String, String), I256> = BTreeMap::new();
        {
            let mut stmt = tx.prepare(
                "SELECT token, from_addr, to_addr, amount_raw
                 FROM token_transfers
                 WHERE chain_id = ?1 AND block_number BETWEEN ?2 AND ?3",
            )?;
            let rows = stmt.query_map(rusqlite::params![cid, from, to], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            for row in rows {
                let (token, from_addr, to_addr, amount_raw) = row?;
                // Amounts above I256::MAX cannot be represented signed; clamp.
                let amount = I256::from_dec_str(&amount_raw).unwrap_or(I256::MAX);
                let debit = deltas.entry((from_addr, token.clone())).or_insert(I256::ZERO);
                *debit = debit.saturating_sub(amount);
                let credit = deltas.entry((to_addr, token)).or_insert(I256::ZERO);
                *credit = credit.saturating_add(amount);
            }
        }

        let mut decimals_map: HashMap<String, u8> = HashMap::new();
        {
            let mut stmt =
                tx.prepare("SELECT address, decimals FROM tokens WHERE chain_id = ?1")?;
            let rows = stmt.query_map([cid], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (address, decimals) = row?;
                decimals_map.insert(address, decimals.clamp(0, 255) as u8);
            }
        }

        let mut touched = 0_u64;
        for ((wallet, token), delta) in deltas {
            if delta == I256::ZERO {
                continue;
            }

            let current: Option<String> = tx
                .query_row(
                    "SELECT balance_raw FROM wallet_positions
                     WHERE chain_id = ?1 AND wallet = ?2 AND token = ?3",
                    rusqlite::params![cid, wallet, token],
                    |row| row.get(0),
                )
                .optional()?;
            let current = current
                .and_then(|s| I256::from_dec_str(&s).ok())
                .unwrap_or(I256::ZERO);

            let next = current.saturating_add(delta);
            let decimals = decimals_map.get(&token).copied().unwrap_or(18);
            let next_dec = signed_units(next, decimals);

            tx.execute(
                "INSERT INTO wallet_positions (chain_id, wallet, token, balance_raw, balance_dec, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))
                 ON CONFLICT(chain_id, wallet, token) DO UPDATE SET
                    balance_raw = excluded.balance_raw,
                    balance_dec = excluded.balance_dec,
                    updated_at = excluded.updated_at",
                rusqlite::params![cid, wallet, token, next.to_string(), next_dec],
            )?;
            touched += 1;
        }

        tx.commit()?;
        Ok(touched)
    })
    .await
}

/// Last block whose transfers have been folded into positions; 0 if none.
pub async fn analytics_cursor(db: &AsyncDb, chain_id: u64) -> Result<u64> {
    let cid = chain_id as i64;
    db.call(move |conn| {
        let last: Option<i64> = conn
            .query_row(
                "SELECT last_block FROM analytics_cursor WHERE chain_id = ?1",
                [cid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(last.unwrap_or(0) as u64)
    })
    .await
}

pub async fn set_analytics_cursor(db: &AsyncDb, chain_id: u64, last_block: u64) -> Result<()> {
    let cid = chain_id as i64;
    let last = last_block as i64;
    db.call(move |conn| {
        conn.execute(
            "INSERT INTO analytics_cursor (chain_id, last_block, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(chain_id) DO UPDATE SET
                last_block = excluded.last_block,
                updated_at = excluded.updated_at",
            rusqlite::params![cid, last],
        )?;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed_token(db: &AsyncDb, address: &str, decimals: i64) {
        let address = address.to_string();
        db.call(move |conn| {
            conn.execute(
                "INSERT INTO tokens (chain_id, address, symbol, decimals, name)
                 VALUES (1, ?1, 'TKN', ?2, 'Token')",
                rusqlite::params![address, decimals],
            )?;
            Ok(())
        })
        .await
        .unwrap();
    }

    async fn seed_transfer(
        db: &AsyncDb,
        block: i64,
        log_index: i64,
        token: &str,
        from: &str,
        to: &str,
        amount_raw: &str,
    ) {
        let (token, from, to, amount) = (
            token.to_string(),
            from.to_string(),
            to.to_string(),
            amount_raw.to_string(),
        );
        db.call(move |conn| {
            conn.execute(
                "INSERT INTO token_transfers (chain_id, tx_hash, log_index, block_number, token, from_addr, to_addr, amount_raw, amount_dec, timestamp)
                 VALUES (1, '0xtx', ?1, ?2, ?3, ?4, ?5, ?6, '0', 1700000000)",
                rusqlite::params![log_index, block, token, from, to, amount],
            )?;
            Ok(())
        })
        .await
        .unwrap();
    }

    async fn balance(db: &AsyncDb, wallet: &str, token: &str) -> Option<(String, String)> {
        let (wallet, token) = (wallet.to_string(), token.to_string());
        db.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT balance_raw, balance_dec FROM wallet_positions
                     WHERE chain_id = 1 AND wallet = ?1 AND token = ?2",
                    rusqlite::params![wallet, token],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?)
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_transfer_debits_sender_and_credits_receiver() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        seed_token(&db, "0xtoken", 18).await;
        seed_transfer(
            &db,
            100,
            0,
            "0xtoken",
            "0xalice",
            "0xbob",
            "1000000000000000000",
        )
        .await;

        let touched = update_wallet_positions(&db, 1, 100, 100).await.unwrap();
        assert_eq!(touched, 2);

        let (bob_raw, bob_dec) = balance(&db, "0xbob", "0xtoken").await.unwrap();
        assert_eq!(bob_raw, "1000000000000000000");
        assert!((bob_dec.parse::<f64>().unwrap() - 1.0).abs() < 1e-12);

        let (alice_raw, _) = balance(&db, "0xalice", "0xtoken").await.unwrap();
        assert_eq!(alice_raw, "-1000000000000000000");
    }

    #[tokio::test]
    async fn test_deltas_within_range_net_out() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        seed_token(&db, "0xtoken", 6).await;
        // bob receives 300 then sends 100 back within the same range.
        seed_transfer(&db, 100, 0, "0xtoken", "0xalice", "0xbob", "300000000").await;
        seed_transfer(&db, 101, 1, "0xtoken", "0xbob", "0xalice", "100000000").await;

        update_wallet_positions(&db, 1, 100, 101).await.unwrap();

        let (bob_raw, bob_dec) = balance(&db, "0xbob", "0xtoken").await.unwrap();
        assert_eq!(bob_raw, "200000000");
        assert!((bob_dec.parse::<f64>().unwrap() - 200.0).abs() < 1e-9);

        // alice nets to -200.
        let (alice_raw, _) = balance(&db, "0xalice", "0xtoken").await.unwrap();
        assert_eq!(alice_raw, "-200000000");
    }

    #[tokio::test]
    async fn test_reapplying_a_range_double_counts() {
        // The accumulator contract: exactly-once application is the caller's
        // job via the analytics cursor.
        let db = AsyncDb::open(":memory:").await.unwrap();
        seed_token(&db, "0xtoken", 6).await;
        seed_transfer(&db, 100, 0, "0xtoken", "0xalice", "0xbob", "1000000").await;

        update_wallet_positions(&db, 1, 100, 100).await.unwrap();
        update_wallet_positions(&db, 1, 100, 100).await.unwrap();

        let (bob_raw, _) = balance(&db, "0xbob", "0xtoken").await.unwrap();
        assert_eq!(bob_raw, "2000000");
    }

    #[tokio::test]
    async fn test_transfers_outside_range_ignored() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        seed_token(&db, "0xtoken", 6).await;
        seed_transfer(&db, 99, 0, "0xtoken", "0xalice", "0xbob", "1000000").await;
        seed_transfer(&db, 100, 1, "0xtoken", "0xalice", "0xbob", "2000000").await;

        update_wallet_positions(&db, 1, 100, 100).await.unwrap();

        let (bob_raw, _) = balance(&db, "0xbob", "0xtoken").await.unwrap();
        assert_eq!(bob_raw, "2000000");
    }

    #[tokio::test]
    async fn test_unknown_token_defaults_to_18_decimals() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        // No tokens row seeded.
        seed_transfer(
            &db,
            100,
            0,
            "0xmystery",
            "0xalice",
            "0xbob",
            "1000000000000000000",
        )
        .await;

        update_wallet_positions(&db, 1, 100, 100).await.unwrap();

        let (_, bob_dec) = balance(&db, "0xbob", "0xmystery").await.unwrap();
        assert!((bob_dec.parse::<f64>().unwrap() - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_analytics_cursor_roundtrip() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        assert_eq!(analytics_cursor(&db, 1).await.unwrap(), 0);

        set_analytics_cursor(&db, 1, 123).await.unwrap();
        assert_eq!(analytics_cursor(&db, 1).await.unwrap(), 123);

        set_analytics_cursor(&db, 1, 456).await.unwrap();
        assert_eq!(analytics_cursor(&db, 1).await.unwrap(), 456);
        // Per-chain rows.
        assert_eq!(analytics_cursor(&db, 8453).await.unwrap(), 0);
    }
}
