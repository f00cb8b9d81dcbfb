//! Near-real-time smart-money views over priced swaps.
//!
//! Both views join recent priced swaps against `wallet_scores` at or above a
//! minimum score, classify each swap as a buy (stable in) or sell (stable
//! out), and drop anything where both or neither leg is a stablecoin.
//! Clusters group by `(chain, token, 180s bucket)` with buy/sell USD sums,
//! distinct wallets, and two fixed-width-bucket sparklines; the feed is a
//! flat reverse-chronological page with a `(timestamp, log_index)` cursor.
//! Cluster queries are served through a short-TTL in-process cache.

use anyhow::Result;
use common::config::Config;
use common::db::AsyncDb;
use common::types::SwapSide;
use rusqlite::types::Value;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const CLUSTER_BUCKET_SECS: i64 = 180;
const PRICE_SPARK_WINDOW_SECS: i64 = 3600;
const FLOW_SPARK_WINDOW_SECS: i64 = 1800;
const SPARK_BUCKET_SECS: i64 = 300;
const CLUSTER_SCAN_LIMIT: u32 = 2000;
const CLUSTER_SWAPS_SHOWN: usize = 20;
const TOP_WALLETS_SHOWN: usize = 3;

#[derive(Debug, Clone)]
pub struct SmartMoneyFilter {
    /// Empty means all configured chains.
    pub chain_ids: Vec<u64>,
    pub window_secs: i64,
    pub min_score: i64,
    pub min_usd: f64,
    /// Empty means all DEXes.
    pub dexes: Vec<String>,
    /// Free-text match against token address/symbol/name or wallet address.
    pub search: String,
    pub hide_stable: bool,
    /// Restrict to tokens first seen within 24h.
    pub only_new: bool,
    pub only_verified: bool,
    pub group_by_token: bool,
}

impl Default for SmartMoneyFilter {
    fn default() -> Self {
        Self {
            chain_ids: Vec::new(),
            window_secs: 300,
            min_score: 75,
            min_usd: 500.0,
            dexes: Vec::new(),
            search: String::new(),
            hide_stable: true,
            only_new: false,
            only_verified: false,
            group_by_token: true,
        }
    }
}

impl SmartMoneyFilter {
    fn cache_key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{}:{}",
            self.chain_ids
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("."),
            self.window_secs,
            self.min_score,
            self.min_usd,
            self.dexes.join("."),
            self.hide_stable,
            self.only_new,
            self.only_verified,
            self.group_by_token,
            self.search
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedItem {
    pub chain_id: u64,
    pub tx_hash: String,
    pub log_index: i64,
    pub side: SwapSide,
    pub usd_value: f64,
    pub wallet: String,
    pub wallet_short: String,
    pub score: i64,
    pub token: String,
    pub token_symbol: String,
    pub token_name: String,
    pub token_age_hours: Option<i64>,
    pub verified: bool,
    pub route: String,
    pub dex: String,
    pub timestamp: i64,
    pub amount_in: String,
    pub amount_out: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedPage {
    pub items: Vec<FeedItem>,
    /// `(timestamp, log_index)` of the last scanned row; pass back to continue.
    pub next_cursor: Option<(i64, i64)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterSwap {
    pub tx_hash: String,
    pub log_index: i64,
    pub wallet: String,
    pub wallet_short: String,
    pub score: i64,
    pub side: SwapSide,
    pub usd_value: f64,
    pub dex: String,
    pub token_in: String,
    pub token_out: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterWallet {
    pub address: String,
    pub score: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterItem {
    pub id: String,
    pub chain_id: u64,
    pub token: String,
    pub symbol: String,
    pub name: String,
    pub verified: bool,
    pub token_age_hours: Option<i64>,
    pub first_seen_at: Option<i64>,
    pub buy_usd: f64,
    pub sell_usd: f64,
    pub net_usd: f64,
    pub wallet_count: usize,
    pub top_wallets: Vec<ClusterWallet>,
    pub price_spark: Vec<Option<f64>>,
    pub flow_spark: Vec<Option<f64>>,
    pub swaps: Vec<ClusterSwap>,
}

pub fn bucket_time(timestamp: i64, bucket_secs: i64) -> i64 {
    timestamp.div_euclid(bucket_secs) * bucket_secs
}

pub fn bucket_index(timestamp: i64, window_start: i64, bucket_secs: i64) -> i64 {
    (timestamp - window_start).div_euclid(bucket_secs)
}

fn is_ascii_printable(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| (0x20..=0x7E).contains(&b))
}

/// Labels straight from contract storage can be empty or full of control
/// bytes; render those as "Unknown".
pub fn normalize_token_label(value: Option<&str>) -> String {
    match value {
        Some(v) if is_ascii_printable(v) && !v.trim().is_empty() => v.trim().to_string(),
        _ => "Unknown".to_string(),
    }
}

pub fn short_address(address: &str) -> String {
    if address.len() < 10 {
        return address.to_string();
    }
    format!("{}...{}", &address[..6], &address[address.len() - 4..])
}

#[derive(Debug, Clone, Copy)]
enum SparkAgg {
    Mean,
    Sum,
}

/// Fixed-width bucket series over `[now - window, now]`; buckets with no
/// points render as `None`, not zero.
fn compute_sparkline(
    points: &[(i64, f64)],
    window_secs: i64,
    bucket_secs: i64,
    now: i64,
    agg: SparkAgg,
) -> Vec<Option<f64>> {
    let buckets = ((window_secs + bucket_secs - 1) / bucket_secs) as usize;
    let start = now - window_secs;
    let mut sums = vec![0.0_f64; buckets];
    let mut counts = vec![0_u32; buckets];

    for (ts, value) in points {
        if *ts < start {
            continue;
        }
        let index = bucket_index(*ts, start, bucket_secs);
        if index < 0 || index as usize >= buckets {
            continue;
        }
        sums[index as usize] += value;
        counts[index as usize] += 1;
    }

    sums.iter()
        .zip(&counts)
        .map(|(sum, count)| {
            if *count == 0 {
                None
            } else {
                match agg {
                    SparkAgg::Mean => Some(sum / f64::from(*count)),
                    SparkAgg::Sum => Some(*sum),
                }
            }
        })
        .collect()
}

struct ScoredSwap {
    chain_id: i64,
    tx_hash: String,
    log_index: i64,
    token_in: String,
    token_out: String,
    amount_in_dec: String,
    amount_out_dec: String,
    usd_value: Option<f64>,
    dex: String,
    trader: String,
    timestamp: i64,
    score: i64,
}

struct TokenInfo {
    symbol: String,
    name: String,
    verified: bool,
    first_seen_at: Option<i64>,
}

fn load_scored_swaps(
    conn: &Connection,
    filter: &SmartMoneyFilter,
    cursor: Option<(i64, i64)>,
    limit: u32,
    now: i64,
) -> Result<Vec<ScoredSwap>> {
    let since = now - filter.window_secs;

    let mut sql = String::from(
        "SELECT s.chain_id, s.tx_hash, s.log_index, s.token_in, s.token_out,
                s.amount_in_dec, s.amount_out_dec, s.usd_value, s.dex, s.trader, s.timestamp,
                ws.score
         FROM swaps s
         INNER JOIN wallet_scores ws
            ON ws.chain_id = s.chain_id
            AND ws.wallet = s.trader
            AND ws.window = '30d'
            AND ws.score >= ?",
    );
    let mut params: Vec<Value> = vec![Value::Integer(filter.min_score)];

    let chain_marks = vec!["?"; filter.chain_ids.len().max(1)].join(",");
    sql.push_str(&format!(" WHERE s.chain_id IN ({chain_marks})"));
    if filter.chain_ids.is_empty() {
        params.push(Value::Integer(-1));
    } else {
        for id in &filter.chain_ids {
            params.push(Value::Integer(*id as i64));
        }
    }

    sql.push_str(
        " AND s.priced = 1 AND s.trader IS NOT NULL AND s.usd_value >= ? AND s.timestamp >= ?",
    );
    params.push(Value::Real(filter.min_usd));
    params.push(Value::Integer(since));

    if !filter.dexes.is_empty() {
        let dex_marks = vec!["?"; filter.dexes.len()].join(",");
        sql.push_str(&format!(" AND s.dex IN ({dex_marks})"));
        for dex in &filter.dexes {
            params.push(Value::Text(dex.clone()));
        }
    }

    if let Some((ts, log_index)) = cursor {
        sql.push_str(" AND (s.timestamp < ? OR (s.timestamp = ? AND s.log_index < ?))");
        params.push(Value::Integer(ts));
        params.push(Value::Integer(ts));
        params.push(Value::Integer(log_index));
    }

    sql.push_str(" ORDER BY s.timestamp DESC, s.log_index DESC LIMIT ?");
    params.push(Value::Integer(i64::from(limit)));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params), |row| {
            Ok(ScoredSwap {
                chain_id: row.get(0)?,
                tx_hash: row.get(1)?,
                log_index: row.get(2)?,
                token_in: row.get(3)?,
                token_out: row.get(4)?,
                amount_in_dec: row.get(5)?,
                amount_out_dec: row.get(6)?,
                usd_value: row.get(7)?,
                dex: row.get(8)?,
                trader: row.get(9)?,
                timestamp: row.get(10)?,
                score: row.get(11)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_token_info(conn: &Connection, chain_id: i64, address: &str) -> Option<TokenInfo> {
    conn.query_row(
        "SELECT symbol, name, verified, first_seen_at FROM tokens
         WHERE chain_id = ?1 AND address = ?2",
        rusqlite::params![chain_id, address],
        |row| {
            Ok(TokenInfo {
                symbol: row.get(0)?,
                name: row.get(1)?,
                verified: row.get::<_, i64>(2)? != 0,
                first_seen_at: row.get(3)?,
            })
        },
    )
    .ok()
}

fn classify(stables: &HashSet<String>, token_in: &str, token_out: &str) -> Option<(SwapSide, String)> {
    let in_stable = stables.contains(token_in);
    let out_stable = stables.contains(token_out);
    if in_stable && !out_stable {
        Some((SwapSide::Buy, token_out.to_string()))
    } else if out_stable && !in_stable {
        Some((SwapSide::Sell, token_in.to_string()))
    } else {
        // Both or neither leg is a stablecoin: direction is undefined.
        None
    }
}

struct Classified {
    side: SwapSide,
    token: String,
    usd_value: f64,
    info: Option<TokenInfo>,
}

/// Shared classification + filter chain for both views. `None` means the
/// swap is excluded under this filter.
fn classify_and_filter(
    conn: &Connection,
    stablecoins: &HashMap<u64, HashSet<String>>,
    filter: &SmartMoneyFilter,
    swap: &ScoredSwap,
    now: i64,
) -> Option<Classified> {
    let usd_value = swap.usd_value?;
    if !usd_value.is_finite() || usd_value <= 0.0 {
        return None;
    }

    let empty = HashSet::new();
    let stables = stablecoins.get(&(swap.chain_id as u64)).unwrap_or(&empty);
    if filter.hide_stable && stables.contains(&swap.token_in) && stables.contains(&swap.token_out) {
        return None;
    }
    let (side, token) = classify(stables, &swap.token_in, &swap.token_out)?;

    let info = load_token_info(conn, swap.chain_id, &token);
    if filter.only_verified && !info.as_ref().is_some_and(|t| t.verified) {
        return None;
    }
    if filter.only_new {
        let first_seen = info.as_ref().and_then(|t| t.first_seen_at);
        match first_seen {
            Some(ts) if now - ts <= 86_400 => {}
            _ => return None,
        }
    }

    if !filter.search.is_empty() {
        let needle = filter.search.to_lowercase();
        let symbol = normalize_token_label(info.as_ref().map(|t| t.symbol.as_str()));
        let name = normalize_token_label(info.as_ref().map(|t| t.name.as_str()));
        let matches = token.contains(&needle)
            || symbol.to_lowercase().contains(&needle)
            || name.to_lowercase().contains(&needle)
            || swap.trader.contains(&needle);
        if !matches {
            return None;
        }
    }

    Some(Classified {
        side,
        token,
        usd_value,
        info,
    })
}

fn token_age_hours(first_seen_at: Option<i64>, now: i64) -> Option<i64> {
    first_seen_at.map(|ts| ((now - ts).max(0)) / 3600)
}

/// Feed view: flat reverse-chronological page.
pub fn feed_page(
    conn: &Connection,
    stablecoins: &HashMap<u64, HashSet<String>>,
    filter: &SmartMoneyFilter,
    cursor: Option<(i64, i64)>,
    page_limit: u32,
    now: i64,
) -> Result<FeedPage> {
    let swaps = load_scored_swaps(conn, filter, cursor, page_limit, now)?;
    let next_cursor = swaps.last().map(|s| (s.timestamp, s.log_index));

    let items = swaps
        .iter()
        .filter_map(|swap| {
            let c = classify_and_filter(conn, stablecoins, filter, swap, now)?;
            Some(FeedItem {
                chain_id: swap.chain_id as u64,
                tx_hash: swap.tx_hash.clone(),
                log_index: swap.log_index,
                side: c.side,
                usd_value: c.usd_value,
                wallet: swap.trader.clone(),
                wallet_short: short_address(&swap.trader),
                score: swap.score,
                token: c.token,
                token_symbol: normalize_token_label(c.info.as_ref().map(|t| t.symbol.as_str())),
                token_name: normalize_token_label(c.info.as_ref().map(|t| t.name.as_str())),
                token_age_hours: token_age_hours(
                    c.info.as_ref().and_then(|t| t.first_seen_at),
                    now,
                ),
                verified: c.info.as_ref().is_some_and(|t| t.verified),
                route: format!("{} -> {}", swap.token_in, swap.token_out),
                dex: swap.dex.clone(),
                timestamp: swap.timestamp,
                amount_in: swap.amount_in_dec.clone(),
                amount_out: swap.amount_out_dec.clone(),
            })
        })
        .collect();

    Ok(FeedPage { items, next_cursor })
}

struct ClusterBuilder {
    chain_id: i64,
    token: String,
    bucket: i64,
    swaps: Vec<ClusterSwap>,
    buy_usd: f64,
    sell_usd: f64,
    wallets: HashMap<String, i64>,
    price_points: Vec<(i64, f64)>,
    flow_points: Vec<(i64, f64)>,
}

/// Cluster view: grouped by `(chain, token, 180s bucket)`, or one cluster
/// per swap when grouping is disabled.
pub fn clusters_at(
    conn: &Connection,
    stablecoins: &HashMap<u64, HashSet<String>>,
    filter: &SmartMoneyFilter,
    now: i64,
) -> Result<Vec<ClusterItem>> {
    let swaps = load_scored_swaps(conn, filter, None, CLUSTER_SCAN_LIMIT, now)?;

    let mut order: Vec<String> = Vec::new();
    let mut builders: HashMap<String, ClusterBuilder> = HashMap::new();

    for swap in &swaps {
        let Some(c) = classify_and_filter(conn, stablecoins, filter, swap, now) else {
            continue;
        };

        let bucket = bucket_time(swap.timestamp, CLUSTER_BUCKET_SECS);
        let key = if filter.group_by_token {
            format!("{}:{}:{bucket}:g", swap.chain_id, c.token)
        } else {
            format!("{}:{}:{}:s", swap.chain_id, swap.tx_hash, swap.log_index)
        };

        let builder = builders.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            ClusterBuilder {
                chain_id: swap.chain_id,
                token: c.token.clone(),
                bucket: if filter.group_by_token {
                    bucket
                } else {
                    swap.timestamp
                },
                swaps: Vec::new(),
                buy_usd: 0.0,
                sell_usd: 0.0,
                wallets: HashMap::new(),
                price_points: Vec::new(),
                flow_points: Vec::new(),
            }
        });

        builder.swaps.push(ClusterSwap {
            tx_hash: swap.tx_hash.clone(),
            log_index: swap.log_index,
            wallet: swap.trader.clone(),
            wallet_short: short_address(&swap.trader),
            score: swap.score,
            side: c.side,
            usd_value: c.usd_value,
            dex: swap.dex.clone(),
            token_in: swap.token_in.clone(),
            token_out: swap.token_out.clone(),
            timestamp: swap.timestamp,
        });

        match c.side {
            SwapSide::Buy => builder.buy_usd += c.usd_value,
            SwapSide::Sell => builder.sell_usd += c.usd_value,
        }
        builder.wallets.entry(swap.trader.clone()).or_insert(swap.score);

        // Price point: USD per unit of the non-stable leg.
        let amount = match c.side {
            SwapSide::Buy => swap.amount_out_dec.parse::<f64>(),
            SwapSide::Sell => swap.amount_in_dec.parse::<f64>(),
        };
        if let Ok(amount) = amount {
            if amount.is_finite() && amount > 0.0 {
                builder
                    .price_points
                    .push((swap.timestamp, c.usd_value / amount));
            }
        }
        let signed = match c.side {
            SwapSide::Buy => c.usd_value,
            SwapSide::Sell => -c.usd_value,
        };
        builder.flow_points.push((swap.timestamp, signed));
    }

    let items = order
        .into_iter()
        .filter_map(|key| builders.remove(&key))
        .map(|mut builder| {
            let info = load_token_info(conn, builder.chain_id, &builder.token);

            let mut top_wallets: Vec<ClusterWallet> = builder
                .wallets
                .iter()
                .map(|(address, score)| ClusterWallet {
                    address: address.clone(),
                    score: *score,
                })
                .collect();
            top_wallets.sort_by(|a, b| b.score.cmp(&a.score).then(a.address.cmp(&b.address)));
            top_wallets.truncate(TOP_WALLETS_SHOWN);

            let price_spark = compute_sparkline(
                &builder.price_points,
                PRICE_SPARK_WINDOW_SECS,
                SPARK_BUCKET_SECS,
                now,
                SparkAgg::Mean,
            );
            let flow_spark = compute_sparkline(
                &builder.flow_points,
                FLOW_SPARK_WINDOW_SECS,
                SPARK_BUCKET_SECS,
                now,
                SparkAgg::Sum,
            );

            builder.swaps.sort_by(|a, b| {
                b.timestamp
                    .cmp(&a.timestamp)
                    .then(b.log_index.cmp(&a.log_index))
            });
            builder.swaps.truncate(CLUSTER_SWAPS_SHOWN);

            let first_seen_at = info.as_ref().and_then(|t| t.first_seen_at);
            ClusterItem {
                id: format!("{}:{}:{}", builder.chain_id, builder.token, builder.bucket),
                chain_id: builder.chain_id as u64,
                token: builder.token,
                symbol: normalize_token_label(info.as_ref().map(|t| t.symbol.as_str())),
                name: normalize_token_label(info.as_ref().map(|t| t.name.as_str())),
                verified: info.as_ref().is_some_and(|t| t.verified),
                token_age_hours: token_age_hours(first_seen_at, now),
                first_seen_at,
                buy_usd: builder.buy_usd,
                sell_usd: builder.sell_usd,
                net_usd: builder.buy_usd - builder.sell_usd,
                wallet_count: builder.wallets.len(),
                top_wallets,
                price_spark,
                flow_spark,
                swaps: builder.swaps,
            }
        })
        .collect();

    Ok(items)
}

/// Async aggregator handle over the shared database, with the short-TTL
/// response cache for cluster queries.
pub struct SmartMoney {
    db: AsyncDb,
    stablecoins: HashMap<u64, HashSet<String>>,
    all_chain_ids: Vec<u64>,
    page_limit: u32,
    ttl: Duration,
    clusters_cache: Mutex<HashMap<String, (Instant, Arc<Vec<ClusterItem>>)>>,
}

impl SmartMoney {
    pub fn new(db: AsyncDb, config: &Config) -> Self {
        let stablecoins = config
            .chains()
            .iter()
            .map(|c| (c.chain_id, c.stablecoin_set()))
            .collect();
        let all_chain_ids = config.chains().iter().map(|c| c.chain_id).collect();
        Self {
            db,
            stablecoins,
            all_chain_ids,
            page_limit: config.smart_money.feed_page_limit,
            ttl: Duration::from_secs(config.smart_money.cache_ttl_secs),
            clusters_cache: Mutex::new(HashMap::new()),
        }
    }

    fn resolve(&self, filter: &SmartMoneyFilter) -> SmartMoneyFilter {
        let mut filter = filter.clone();
        if filter.chain_ids.is_empty() {
            filter.chain_ids = self.all_chain_ids.clone();
        }
        filter.search = filter.search.trim().to_lowercase();
        filter
    }

    pub async fn clusters(&self, filter: &SmartMoneyFilter) -> Result<Arc<Vec<ClusterItem>>> {
        let filter = self.resolve(filter);
        let key = filter.cache_key();

        if let Ok(cache) = self.clusters_cache.lock() {
            if let Some((at, items)) = cache.get(&key) {
                if at.elapsed() < self.ttl {
                    return Ok(items.clone());
                }
            }
        }

        let now = chrono::Utc::now().timestamp();
        let stablecoins = self.stablecoins.clone();
        let items = self
            .db
            .call_named("smart_money.clusters", move |conn| {
                clusters_at(conn, &stablecoins, &filter, now)
            })
            .await?;

        let items = Arc::new(items);
        if let Ok(mut cache) = self.clusters_cache.lock() {
            cache.retain(|_, (at, _)| at.elapsed() < self.ttl);
            cache.insert(key, (Instant::now(), items.clone()));
        }
        Ok(items)
    }

    pub async fn feed(
        &self,
        filter: &SmartMoneyFilter,
        cursor: Option<(i64, i64)>,
    ) -> Result<FeedPage> {
        let filter = self.resolve(filter);
        let now = chrono::Utc::now().timestamp();
        let stablecoins = self.stablecoins.clone();
        let page_limit = self.page_limit;
        self.db
            .call_named("smart_money.feed", move |conn| {
                feed_page(conn, &stablecoins, &filter, cursor, page_limit, now)
            })
            .await
    }
}
