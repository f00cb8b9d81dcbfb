//! Job orchestration: the per-chain poll job, the ingest+analytics worker
//! unit, and job-status tracking in the `job_status` table.
//!
//! Backfill and live tail are the same unit of work (an `IngestTask` block
//! range) — the poll loop enqueues it repeatedly, the CLI backfill command
//! runs it inline once.

use crate::chain_client::ChainClient;
use crate::ingest::{self, IngestStats};
use crate::metadata::MetadataCache;
use crate::queue::{IngestQueue, IngestTask};
use crate::scoring::ScoreParams;
use crate::{pnl, positions, scoring};
use anyhow::Result;
use common::config::ChainConfig;
use common::db::AsyncDb;
use std::time::Instant;

pub struct JobTracker {
    db: AsyncDb,
    job_name: String,
    start_time: Instant,
}

impl JobTracker {
    pub async fn start(db: &AsyncDb, job_name: &str) -> Result<Self> {
        let name = job_name.to_string();
        db.call_named("job_tracker.start", move |conn| {
            conn.execute(
                "INSERT INTO job_status (job_name, status, last_run_at, updated_at)
                 VALUES (?1, 'running', datetime('now'), datetime('now'))
                 ON CONFLICT(job_name) DO UPDATE SET
                    status = 'running',
                    last_run_at = datetime('now'),
                    updated_at = datetime('now'),
                    last_error = NULL,
                    duration_ms = NULL",
                rusqlite::params![name],
            )?;
            Ok(())
        })
        .await?;

        Ok(Self {
            db: db.clone(),
            job_name: job_name.to_string(),
            start_time: Instant::now(),
        })
    }

    pub async fn success(self, metadata: Option<serde_json::Value>) -> Result<()> {
        let duration_ms = self.start_time.elapsed().as_millis() as i64;
        let name = self.job_name.clone();
        let meta_str = metadata.map(|v| v.to_string());

        self.db
            .call_named("job_tracker.success", move |conn| {
                conn.execute(
                    "UPDATE job_status SET
                        status = 'idle',
                        duration_ms = ?2,
                        metadata = ?3,
                        updated_at = datetime('now')
                     WHERE job_name = ?1",
                    rusqlite::params![name, duration_ms, meta_str],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn fail(self, error: &anyhow::Error) -> Result<()> {
        let duration_ms = self.start_time.elapsed().as_millis() as i64;
        let name = self.job_name;
        let error_msg = error.to_string();

        self.db
            .call_named("job_tracker.fail", move |conn| {
                conn.execute(
                    "UPDATE job_status SET
                        status = 'failed',
                        duration_ms = ?2,
                        last_error = ?3,
                        updated_at = datetime('now')
                     WHERE job_name = ?1",
                    rusqlite::params![name, duration_ms, error_msg],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

/// Compare `head − confirmations` against the last processed block and
/// enqueue the next range (capped at `blocks_per_batch`). Returns the task
/// if one was enqueued.
pub async fn run_chain_poll_once<C: ChainClient + Sync>(
    db: &AsyncDb,
    client: &C,
    chain: &ChainConfig,
    blocks_per_batch: u64,
    queue: &IngestQueue,
) -> Result<Option<IngestTask>> {
    let head = client.head_number().await?;
    let target = head.saturating_sub(chain.confirmations);
    let last = ingest::last_processed_block(db, chain.chain_id).await?;

    metrics::gauge!("indexer_chain_head", "chain" => chain.short_name.clone()).set(head as f64);
    metrics::gauge!("indexer_chain_last_processed", "chain" => chain.short_name.clone())
        .set(last as f64);
    metrics::gauge!("indexer_ingest_lag_blocks", "chain" => chain.short_name.clone())
        .set(target.saturating_sub(last) as f64);

    if target == 0 || target <= last {
        return Ok(None);
    }

    // A fresh database starts at the confirmed tip; walking forward from
    // genesis would never catch up.
    let batch = blocks_per_batch.max(1);
    let from_block = if last == 0 {
        target.saturating_sub(batch - 1).max(1)
    } else {
        last + 1
    };
    let to_block = target.min(from_block + batch - 1);

    let task = IngestTask {
        chain_id: chain.chain_id,
        from_block,
        to_block,
    };
    if queue.try_enqueue(task) {
        Ok(Some(task))
    } else {
        // Backpressure: the worker is behind; the next tick recomputes.
        tracing::debug!(chain = %chain.short_name, "ingest queue full; tick dropped");
        Ok(None)
    }
}

/// One worker unit: ingest the range, then fold the analytics chain forward.
/// Status lands in `job_status` either way.
pub async fn run_ingest_task<C: ChainClient + Sync>(
    db: &AsyncDb,
    client: &C,
    cache: &MetadataCache,
    chain: &ChainConfig,
    params: ScoreParams,
    task: IngestTask,
) -> Result<IngestStats> {
    let tracker = JobTracker::start(db, &format!("ingest_{}", chain.short_name)).await?;

    let result = run_ingest_task_inner(db, client, cache, chain, params, task).await;
    match result {
        Ok(stats) => {
            tracker
                .success(Some(serde_json::json!({
                    "from_block": task.from_block,
                    "to_block": task.to_block,
                    "blocks": stats.blocks,
                    "transfers": stats.transfers,
                    "swaps": stats.swaps,
                    "reorgs": stats.reorgs,
                })))
                .await?;
            Ok(stats)
        }
        Err(err) => {
            tracker.fail(&err).await?;
            Err(err)
        }
    }
}

async fn run_ingest_task_inner<C: ChainClient + Sync>(
    db: &AsyncDb,
    client: &C,
    cache: &MetadataCache,
    chain: &ChainConfig,
    params: ScoreParams,
    task: IngestTask,
) -> Result<IngestStats> {
    let stats = ingest::ingest_range(db, client, cache, chain, task.from_block, task.to_block).await?;
    run_analytics_once(
        db,
        chain,
        params,
        task.to_block,
        chrono::Utc::now().timestamp(),
    )
    .await?;
    Ok(stats)
}

/// Derived-state chain: positions for the not-yet-applied block span (the
/// analytics cursor makes this exactly-once), then PnL, then scores.
pub async fn run_analytics_once(
    db: &AsyncDb,
    chain: &ChainConfig,
    params: ScoreParams,
    upto_block: u64,
    now: i64,
) -> Result<()> {
    let cursor = positions::analytics_cursor(db, chain.chain_id).await?;
    if upto_block > cursor {
        positions::update_wallet_positions(db, chain.chain_id, cursor + 1, upto_block).await?;
        positions::set_analytics_cursor(db, chain.chain_id, upto_block).await?;
    }

    pnl::update_wallet_pnl(db, chain, now).await?;
    scoring::update_wallet_scores(db, params, chain.chain_id, now).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::tests::{test_chain, FakeChain, TOKEN, TRADER};
    use alloy::primitives::{Address, U256};
    use rusqlite::OptionalExtension;

    #[tokio::test]
    async fn test_poll_respects_confirmation_depth_and_batch_cap() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let chain = test_chain(); // confirmations = 5
        let (queue, mut rx) = IngestQueue::new(4);

        let fake = FakeChain {
            head: 1000,
            ..FakeChain::default()
        };

        // Fresh database: start at the confirmed tip, one batch deep.
        let task = run_chain_poll_once(&db, &fake, &chain, 50, &queue)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.to_block, 995);
        assert_eq!(task.from_block, 946);
        assert_eq!(rx.recv().await.unwrap(), task);
    }

    #[tokio::test]
    async fn test_poll_continues_after_last_processed() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let chain = test_chain();
        let (queue, _rx) = IngestQueue::new(4);

        db.call(|conn| {
            conn.execute(
                "INSERT INTO blocks (chain_id, number, hash, parent_hash, timestamp)
                 VALUES (1, 990, '0xaa', '0x99', 0)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let fake = FakeChain {
            head: 1000,
            ..FakeChain::default()
        };

        let task = run_chain_poll_once(&db, &fake, &chain, 50, &queue)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.from_block, 991);
        assert_eq!(task.to_block, 995);
    }

    #[tokio::test]
    async fn test_poll_noop_when_caught_up() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let chain = test_chain();
        let (queue, _rx) = IngestQueue::new(4);

        db.call(|conn| {
            conn.execute(
                "INSERT INTO blocks (chain_id, number, hash, parent_hash, timestamp)
                 VALUES (1, 995, '0xaa', '0x99', 0)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let fake = FakeChain {
            head: 1000,
            ..FakeChain::default()
        };

        let task = run_chain_poll_once(&db, &fake, &chain, 50, &queue)
            .await
            .unwrap();
        assert!(task.is_none());
    }

    #[tokio::test]
    async fn test_poll_drops_tick_when_queue_full() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let chain = test_chain();
        let (queue, _rx) = IngestQueue::new(1);
        assert!(queue.try_enqueue(IngestTask {
            chain_id: 1,
            from_block: 1,
            to_block: 10
        }));

        let fake = FakeChain {
            head: 1000,
            ..FakeChain::default()
        };

        let task = run_chain_poll_once(&db, &fake, &chain, 50, &queue)
            .await
            .unwrap();
        assert!(task.is_none(), "full queue must drop the tick, not block");
    }

    #[tokio::test]
    async fn test_analytics_cursor_makes_position_updates_exactly_once() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let chain = test_chain();

        db.call(|conn| {
            conn.execute(
                "INSERT INTO tokens (chain_id, address, symbol, decimals, name)
                 VALUES (1, '0xtoken', 'TKN', 6, 'Token')",
                [],
            )?;
            conn.execute(
                "INSERT INTO token_transfers (chain_id, tx_hash, log_index, block_number, token, from_addr, to_addr, amount_raw, amount_dec, timestamp)
                 VALUES (1, '0xtx', 0, 100, '0xtoken', '0xalice', '0xbob', '1000000', '1', 1700000000)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let params = ScoreParams::default();
        run_analytics_once(&db, &chain, params, 100, 1_700_000_100).await.unwrap();
        // Same upto twice: the cursor prevents re-applying the deltas.
        run_analytics_once(&db, &chain, params, 100, 1_700_000_100).await.unwrap();

        let balance: String = db
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT balance_raw FROM wallet_positions WHERE chain_id = 1 AND wallet = '0xbob' AND token = '0xtoken'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(balance, "1000000");
        assert_eq!(positions::analytics_cursor(&db, 1).await.unwrap(), 100);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_ingest_task_drives_full_pipeline() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let cache = MetadataCache::new(64);
        let chain = test_chain();

        let mut fake = FakeChain::default();
        fake.add_block(100, 0x01, vec![FakeChain::tx(0x10, TRADER)]);
        fake.transfer_log(
            100,
            0x10,
            0,
            TOKEN,
            Address::repeat_byte(0x02),
            TRADER,
            U256::from(1_000_000u64),
        );

        let task = IngestTask {
            chain_id: 1,
            from_block: 100,
            to_block: 100,
        };
        let stats = run_ingest_task(&db, &fake, &cache, &chain, ScoreParams::default(), task)
            .await
            .unwrap();
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.transfers, 1);

        // Positions were folded forward and the cursor advanced.
        let wallet = crate::abi::addr_hex(TRADER);
        let token = crate::abi::addr_hex(TOKEN);
        let position: Option<String> = db
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT balance_raw FROM wallet_positions
                         WHERE chain_id = 1 AND wallet = ?1 AND token = ?2",
                        rusqlite::params![wallet, token],
                        |r| r.get(0),
                    )
                    .optional()?)
            })
            .await
            .unwrap();
        assert_eq!(position, Some("1000000".to_string()));
        assert_eq!(positions::analytics_cursor(&db, 1).await.unwrap(), 100);

        // Job status recorded.
        let status: String = db
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT status FROM job_status WHERE job_name = 'ingest_test'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(status, "idle");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_ingest_task_records_failure() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let cache = MetadataCache::new(64);
        let chain = test_chain();

        let fake = FakeChain {
            fail_rpc: true,
            ..FakeChain::default()
        };
        let task = IngestTask {
            chain_id: 1,
            from_block: 100,
            to_block: 100,
        };
        let result = run_ingest_task(&db, &fake, &cache, &chain, ScoreParams::default(), task).await;
        assert!(result.is_err());

        let (status, last_error): (String, Option<String>) = db
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT status, last_error FROM job_status WHERE job_name = 'ingest_test'",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(status, "failed");
        assert!(last_error.is_some());
    }
}
