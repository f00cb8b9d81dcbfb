use anyhow::Result;
use common::config::Config;
use common::db::Database;
use rusqlite::OptionalExtension;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run,
    Backfill {
        chain: String,
        from_block: u64,
        to_block: u64,
    },
    Tokens {
        chain: String,
    },
    Scores {
        chain: String,
    },
    Feed {
        chain: String,
    },
    Clusters {
        chain: String,
    },
}

pub fn parse_args<I>(mut args: I) -> std::result::Result<Command, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let _ = args.next();

    let Some(cmd) = args.next() else {
        return Ok(Command::Run);
    };

    match cmd.as_str() {
        "run" => Ok(Command::Run),
        "backfill" => {
            let usage = "usage: indexer backfill <chain> <from_block> <to_block>";
            let chain = args.next().ok_or_else(|| usage.to_string())?;
            let from_block = args
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| usage.to_string())?;
            let to_block = args
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| usage.to_string())?;
            if from_block > to_block {
                return Err("backfill: from_block must be <= to_block".to_string());
            }
            Ok(Command::Backfill {
                chain,
                from_block,
                to_block,
            })
        }
        "tokens" => {
            let chain = args
                .next()
                .ok_or_else(|| "usage: indexer tokens <chain>".to_string())?;
            Ok(Command::Tokens { chain })
        }
        "scores" => {
            let chain = args
                .next()
                .ok_or_else(|| "usage: indexer scores <chain>".to_string())?;
            Ok(Command::Scores { chain })
        }
        "feed" => {
            let chain = args
                .next()
                .ok_or_else(|| "usage: indexer feed <chain>".to_string())?;
            Ok(Command::Feed { chain })
        }
        "clusters" => {
            let chain = args
                .next()
                .ok_or_else(|| "usage: indexer clusters <chain>".to_string())?;
            Ok(Command::Clusters { chain })
        }
        other => Err(format!("unknown command: {other}")),
    }
}

pub fn resolve_chain_id(config: &Config, name: &str) -> Result<u64> {
    config
        .chain_by_name(name)
        .map(|c| c.chain_id)
        .ok_or_else(|| anyhow::anyhow!("unknown chain: {name}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenListRow {
    pub address: String,
    pub symbol: String,
    pub decimals: i64,
    pub first_seen_block: Option<i64>,
    pub verified: bool,
}

pub fn query_tokens(db: &Database, chain_id: u64) -> Result<Vec<TokenListRow>> {
    let mut stmt = db.conn.prepare(
        "SELECT address, symbol, decimals, first_seen_block, verified
         FROM tokens
         WHERE chain_id = ?1
         ORDER BY first_seen_block DESC
         LIMIT 50",
    )?;
    let rows = stmt.query_map([chain_id as i64], |row| {
        Ok(TokenListRow {
            address: row.get(0)?,
            symbol: row.get(1)?,
            decimals: row.get(2)?,
            first_seen_block: row.get(3)?,
            verified: row.get::<_, i64>(4)? != 0,
        })
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreRow {
    pub wallet: String,
    pub score: i64,
    pub features_json: String,
}

pub fn query_top_scores(db: &Database, chain_id: u64) -> Result<Vec<ScoreRow>> {
    let mut stmt = db.conn.prepare(
        "SELECT wallet, score, features_json
         FROM wallet_scores
         WHERE chain_id = ?1 AND window = '30d'
         ORDER BY score DESC
         LIMIT 20",
    )?;
    let rows = stmt.query_map([chain_id as i64], |row| {
        Ok(ScoreRow {
            wallet: row.get(0)?,
            score: row.get(1)?,
            features_json: row.get(2)?,
        })
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

fn show_tokens(db: &Database, chain_id: u64) -> Result<()> {
    println!("Tokens (newest first):");
    for t in query_tokens(db, chain_id)? {
        println!(
            "{}  {:<12} decimals={:<3} first_seen_block={:?} verified={}",
            t.address, t.symbol, t.decimals, t.first_seen_block, t.verified
        );
    }
    Ok(())
}

fn show_scores(db: &Database, chain_id: u64) -> Result<()> {
    println!("Top wallets (30d window):");
    for s in query_top_scores(db, chain_id)? {
        println!("{:>3}  {}  {}", s.score, s.wallet, s.features_json);
    }

    let ingested: Option<i64> = db
        .conn
        .query_row(
            "SELECT MAX(number) FROM blocks WHERE chain_id = ?1",
            [chain_id as i64],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    println!("last ingested block: {ingested:?}");
    Ok(())
}

/// Sync inspection commands. Backfill/feed/clusters need the async runtime
/// and are dispatched from main.
pub fn run_command(db: &Database, config: &Config, cmd: &Command) -> Result<()> {
    match cmd {
        Command::Tokens { chain } => show_tokens(db, resolve_chain_id(config, chain)?),
        Command::Scores { chain } => show_scores(db, resolve_chain_id(config, chain)?),
        _ => Ok(()),
    }
}
