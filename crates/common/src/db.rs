use anyhow::Result;
use rusqlite::Connection;

pub struct Database {
    pub conn: Connection,
}

/// Async database wrapper around `tokio_rusqlite::Connection`.
///
/// Runs all SQLite operations on a dedicated background thread via
/// `tokio_rusqlite`, keeping the Tokio runtime cooperative. Clone is
/// cheap (shared mpsc sender to the background thread).
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
}

impl AsyncDb {
    /// Open a database at `path`, set PRAGMAs (WAL, foreign keys, busy_timeout),
    /// and run migrations — all on the background thread.
    pub async fn open(path: &str) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path).await?;

        // Startup migrations take a write lock and can race with concurrent
        // readers (sqlite3 admin sessions, deploy checks). Hard-failing on
        // `database is locked` would crash-loop under systemd, so retry with
        // backoff until the lock clears.
        //
        // A short per-attempt busy_timeout lets the backoff live in Rust.
        let mut backoff = std::time::Duration::from_secs(1);
        let max_backoff = std::time::Duration::from_secs(30);
        let max_total_wait = std::time::Duration::from_secs(10 * 60);
        let start = std::time::Instant::now();

        loop {
            let res = conn
                .call(|conn| -> std::result::Result<(), rusqlite::Error> {
                    conn.busy_timeout(std::time::Duration::from_secs(1))?;
                    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
                    conn.execute_batch(SCHEMA)?;
                    // Normal runtime operations get the longer busy_timeout back.
                    conn.busy_timeout(std::time::Duration::from_secs(30))?;
                    Ok(())
                })
                .await;

            match res {
                Ok(()) => break,
                Err(tokio_rusqlite::Error::Error(err)) => {
                    let is_locked = matches!(
                        err,
                        rusqlite::Error::SqliteFailure(
                            rusqlite::ffi::Error {
                                code: rusqlite::ffi::ErrorCode::DatabaseBusy
                                    | rusqlite::ffi::ErrorCode::DatabaseLocked,
                                ..
                            },
                            _,
                        )
                    );
                    if !is_locked {
                        return Err(
                            anyhow::Error::from(err).context("AsyncDb::open: migration failed")
                        );
                    }

                    if start.elapsed() >= max_total_wait {
                        return Err(anyhow::Error::from(err).context(
                            "AsyncDb::open: migration failed (database stayed locked too long)",
                        ));
                    }

                    tracing::warn!(
                        wait_for = ?backoff,
                        "AsyncDb::open: database is locked; retrying migrations"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
                Err(other) => return Err(anyhow::anyhow!("AsyncDb::open: {other}")),
            }
        }

        Ok(Self { conn })
    }

    /// Run a closure on the background SQLite thread and return the result.
    ///
    /// The closure receives `&mut rusqlite::Connection` and can perform
    /// arbitrary sync SQLite operations (including multi-statement
    /// transactions). The result is sent back via oneshot channel.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn.call(move |conn| function(conn)).await.map_err(
            |e: tokio_rusqlite::Error<anyhow::Error>| match e {
                tokio_rusqlite::Error::ConnectionClosed => {
                    anyhow::anyhow!("database connection closed")
                }
                tokio_rusqlite::Error::Close((_, err)) => {
                    anyhow::anyhow!("database close error: {err}")
                }
                tokio_rusqlite::Error::Error(err) => err,
                other => anyhow::anyhow!("database error: {other}"),
            },
        )
    }

    /// Like [`Self::call`], but records Prometheus metrics for DB latency and errors.
    ///
    /// Measures the full wall-clock time of the operation, including queueing
    /// on the dedicated SQLite thread and execution of all SQL in the closure.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let start = std::time::Instant::now();
        let res = self.call(function).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;

        match &res {
            Ok(_) => {
                metrics::histogram!(
                    "indexer_db_query_latency_ms",
                    "op" => op,
                    "status" => "ok"
                )
                .record(ms);
            }
            Err(_) => {
                metrics::histogram!(
                    "indexer_db_query_latency_ms",
                    "op" => op,
                    "status" => "err"
                )
                .record(ms);
                metrics::counter!("indexer_db_query_errors_total", "op" => op).increment(1);
            }
        }

        res
    }
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        // busy_timeout via the rusqlite API — makes SQLite retry for up to 30s
        // when the database is locked by another connection (live indexer +
        // CLI inspection commands share the file).
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    pub fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }
}

// Raw on-chain rows (blocks/transactions/logs/token_transfers/swaps/tokens)
// are owned by the ingestor; wallet_positions and wallet_token_pnl by the
// PnL engine; wallet_scores by the scoring engine. Every natural key carries
// chain_id, and every write is an upsert on that key so re-ingesting a range
// is a no-op. Raw integer token amounts exceed i64 and are stored as decimal
// TEXT.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS blocks (
    chain_id INTEGER NOT NULL,
    number INTEGER NOT NULL,
    hash TEXT NOT NULL,
    parent_hash TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    PRIMARY KEY (chain_id, number)
);

CREATE TABLE IF NOT EXISTS transactions (
    chain_id INTEGER NOT NULL,
    hash TEXT NOT NULL,
    block_number INTEGER NOT NULL,
    from_addr TEXT NOT NULL,
    to_addr TEXT,                      -- NULL for contract creations
    value_wei TEXT NOT NULL,
    PRIMARY KEY (chain_id, hash)
);

CREATE TABLE IF NOT EXISTS logs (
    chain_id INTEGER NOT NULL,
    tx_hash TEXT NOT NULL,
    log_index INTEGER NOT NULL,
    block_number INTEGER NOT NULL,
    address TEXT NOT NULL,
    topic0 TEXT,
    topics_json TEXT NOT NULL,         -- JSON array of 0x-prefixed topics
    data TEXT NOT NULL,
    PRIMARY KEY (chain_id, tx_hash, log_index)
);

CREATE TABLE IF NOT EXISTS token_transfers (
    chain_id INTEGER NOT NULL,
    tx_hash TEXT NOT NULL,
    log_index INTEGER NOT NULL,
    block_number INTEGER NOT NULL,
    token TEXT NOT NULL,
    from_addr TEXT NOT NULL,
    to_addr TEXT NOT NULL,
    amount_raw TEXT NOT NULL,
    amount_dec TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    PRIMARY KEY (chain_id, tx_hash, log_index)
);

CREATE TABLE IF NOT EXISTS swaps (
    chain_id INTEGER NOT NULL,
    tx_hash TEXT NOT NULL,
    log_index INTEGER NOT NULL,
    block_number INTEGER NOT NULL,
    dex TEXT NOT NULL,                 -- uniswap-v2, uniswap-v3
    pool TEXT NOT NULL,
    trader TEXT,                       -- tx sender; NULL if tx unknown
    token_in TEXT NOT NULL,
    token_out TEXT NOT NULL,
    amount_in_raw TEXT NOT NULL,
    amount_out_raw TEXT NOT NULL,
    amount_in_dec TEXT NOT NULL,
    amount_out_dec TEXT NOT NULL,
    usd_value REAL,                    -- stablecoin-leg inference; NULL if unpriced
    priced INTEGER NOT NULL DEFAULT 0,
    timestamp INTEGER NOT NULL,
    PRIMARY KEY (chain_id, tx_hash, log_index)
);

CREATE TABLE IF NOT EXISTS tokens (
    chain_id INTEGER NOT NULL,
    address TEXT NOT NULL,
    symbol TEXT NOT NULL,
    decimals INTEGER NOT NULL,
    name TEXT NOT NULL,
    first_seen_block INTEGER,
    first_seen_at INTEGER,
    verified INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (chain_id, address)
);

CREATE TABLE IF NOT EXISTS wallet_positions (
    chain_id INTEGER NOT NULL,
    wallet TEXT NOT NULL,
    token TEXT NOT NULL,
    balance_raw TEXT NOT NULL,
    balance_dec TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (chain_id, wallet, token)
);

CREATE TABLE IF NOT EXISTS wallet_token_pnl (
    chain_id INTEGER NOT NULL,
    wallet TEXT NOT NULL,
    token TEXT NOT NULL,
    realized_pnl_usd_30d REAL NOT NULL DEFAULT 0.0,
    realized_pnl_usd_all REAL NOT NULL DEFAULT 0.0,
    win_trades_30d INTEGER NOT NULL DEFAULT 0,
    loss_trades_30d INTEGER NOT NULL DEFAULT 0,
    avg_hold_seconds_30d INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (chain_id, wallet, token)
);

CREATE TABLE IF NOT EXISTS wallet_scores (
    chain_id INTEGER NOT NULL,
    wallet TEXT NOT NULL,
    window TEXT NOT NULL,              -- '30d'
    score INTEGER NOT NULL,            -- 0..100
    features_json TEXT NOT NULL,       -- feature breakdown for explainability
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (chain_id, wallet, window)
);

-- Last block whose transfers have been folded into wallet_positions.
-- The position engine is an incremental accumulator; this cursor is the
-- block-range bookkeeping that keeps it exactly-once.
CREATE TABLE IF NOT EXISTS analytics_cursor (
    chain_id INTEGER PRIMARY KEY,
    last_block INTEGER NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS job_status (
    job_name TEXT PRIMARY KEY,
    status TEXT NOT NULL,              -- running, idle, failed
    last_run_at TEXT,
    duration_ms INTEGER,
    last_error TEXT,
    metadata TEXT,                     -- JSON with progress info
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_transactions_block ON transactions(chain_id, block_number);
CREATE INDEX IF NOT EXISTS idx_logs_block ON logs(chain_id, block_number);
CREATE INDEX IF NOT EXISTS idx_token_transfers_block ON token_transfers(chain_id, block_number);
CREATE INDEX IF NOT EXISTS idx_token_transfers_token_ts ON token_transfers(chain_id, token, timestamp);
CREATE INDEX IF NOT EXISTS idx_token_transfers_from ON token_transfers(chain_id, from_addr);
CREATE INDEX IF NOT EXISTS idx_token_transfers_to ON token_transfers(chain_id, to_addr);
CREATE INDEX IF NOT EXISTS idx_swaps_block ON swaps(chain_id, block_number);
CREATE INDEX IF NOT EXISTS idx_swaps_ts ON swaps(chain_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_swaps_trader ON swaps(chain_id, trader);
CREATE INDEX IF NOT EXISTS idx_swaps_priced_ts ON swaps(chain_id, priced, timestamp);
CREATE INDEX IF NOT EXISTS idx_wallet_scores_window_score ON wallet_scores(chain_id, window, score DESC);
CREATE INDEX IF NOT EXISTS idx_wallet_token_pnl_wallet ON wallet_token_pnl(chain_id, wallet);
"#;
