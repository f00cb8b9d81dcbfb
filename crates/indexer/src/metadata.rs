//! Token and pair/pool metadata resolution with a bounded in-process cache.
//!
//! Token metadata never fails: a batched Multicall3 read is attempted first
//! (tolerating per-call failure), then each field individually, and remaining
//! gaps fall back to `"TOKEN"`/18/symbol. Pair/pool constituents DO propagate
//! transport errors — a swap log cannot be classified without them, and the
//! ingestor aborts the block pre-commit so the range is retried.

use crate::abi::{addr_hex, erc20, multicall3, v2};
use crate::chain_client::ChainClient;
use alloy::primitives::Address;
use alloy::sol_types::SolCall;
use common::rpc::RpcError;
use common::types::{PairTokens, TokenMeta};
use std::collections::HashMap;
use std::sync::Mutex;

/// Recency-evicting map: each hit bumps a logical clock; inserting past
/// capacity evicts the entry with the oldest clock value.
struct BoundedMap<V> {
    capacity: usize,
    tick: u64,
    entries: HashMap<String, (u64, V)>,
}

impl<V: Clone> BoundedMap<V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<V> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(key).map(|slot| {
            slot.0 = tick;
            slot.1.clone()
        })
    }

    fn insert(&mut self, key: String, value: V) {
        self.tick += 1;
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, (tick, _))| *tick)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(key, (self.tick, value));
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct MetadataCache {
    tokens: Mutex<BoundedMap<TokenMeta>>,
    pairs: Mutex<BoundedMap<PairTokens>>,
    pools: Mutex<BoundedMap<PairTokens>>,
}

fn cache_key(chain_id: u64, address: &str) -> String {
    format!("{chain_id}:{}", address.to_lowercase())
}

impl MetadataCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            tokens: Mutex::new(BoundedMap::new(capacity)),
            pairs: Mutex::new(BoundedMap::new(capacity)),
            pools: Mutex::new(BoundedMap::new(capacity)),
        }
    }

    /// Resolve ERC-20 symbol/decimals/name. Infallible; gaps degrade to
    /// placeholder values.
    pub async fn token_meta<C: ChainClient + Sync>(
        &self,
        client: &C,
        chain_id: u64,
        address: &str,
    ) -> TokenMeta {
        let key = cache_key(chain_id, address);
        if let Ok(mut cache) = self.tokens.lock() {
            if let Some(hit) = cache.get(&key) {
                return hit;
            }
        }

        let meta = fetch_token_meta(client, address).await;
        if let Ok(mut cache) = self.tokens.lock() {
            cache.insert(key, meta.clone());
        }
        meta
    }

    /// Constituent tokens of a Uniswap-V2-style pair.
    pub async fn pair_tokens<C: ChainClient + Sync>(
        &self,
        client: &C,
        chain_id: u64,
        pair: &str,
    ) -> Result<PairTokens, RpcError> {
        Self::constituents(&self.pairs, client, chain_id, pair).await
    }

    /// Constituent tokens of a Uniswap-V3-style pool (same ABI surface,
    /// cached separately).
    pub async fn pool_tokens<C: ChainClient + Sync>(
        &self,
        client: &C,
        chain_id: u64,
        pool: &str,
    ) -> Result<PairTokens, RpcError> {
        Self::constituents(&self.pools, client, chain_id, pool).await
    }

    async fn constituents<C: ChainClient + Sync>(
        slot: &Mutex<BoundedMap<PairTokens>>,
        client: &C,
        chain_id: u64,
        contract: &str,
    ) -> Result<PairTokens, RpcError> {
        let key = cache_key(chain_id, contract);
        if let Ok(mut cache) = slot.lock() {
            if let Some(hit) = cache.get(&key) {
                return Ok(hit);
            }
        }

        let target: Address = contract
            .parse()
            .map_err(|_| RpcError::Decode(format!("bad pair/pool address {contract}")))?;

        let ret0 = client
            .eth_call(target, v2::token0Call {}.abi_encode().into())
            .await?;
        let token0 = v2::token0Call::abi_decode_returns(&ret0)
            .map_err(|e| RpcError::Decode(format!("token0: {e}")))?;

        let ret1 = client
            .eth_call(target, v2::token1Call {}.abi_encode().into())
            .await?;
        let token1 = v2::token1Call::abi_decode_returns(&ret1)
            .map_err(|e| RpcError::Decode(format!("token1: {e}")))?;

        let tokens = PairTokens {
            token0: addr_hex(token0),
            token1: addr_hex(token1),
        };
        if let Ok(mut cache) = slot.lock() {
            cache.insert(key, tokens.clone());
        }
        Ok(tokens)
    }

    #[cfg(test)]
    fn token_entries(&self) -> usize {
        self.tokens.lock().map(|c| c.len()).unwrap_or(0)
    }
}

async fn fetch_token_meta<C: ChainClient + Sync>(client: &C, address: &str) -> TokenMeta {
    let Ok(target) = address.parse::<Address>() else {
        return TokenMeta::placeholder();
    };

    match multicall_meta(client, target).await {
        Ok(meta) => meta,
        Err(err) => {
            metrics::counter!("indexer_metadata_multicall_fallbacks_total").increment(1);
            tracing::debug!(token = %address, error = %err, "multicall failed; per-field metadata reads");
            per_field_meta(client, target).await
        }
    }
}

async fn multicall_meta<C: ChainClient + Sync>(
    client: &C,
    target: Address,
) -> Result<TokenMeta, RpcError> {
    let mc: Address = multicall3::ADDRESS
        .parse()
        .expect("multicall3 address constant is valid");

    let calls = vec![
        multicall3::Call3 {
            target,
            allowFailure: true,
            callData: erc20::symbolCall {}.abi_encode().into(),
        },
        multicall3::Call3 {
            target,
            allowFailure: true,
            callData: erc20::decimalsCall {}.abi_encode().into(),
        },
        multicall3::Call3 {
            target,
            allowFailure: true,
            callData: erc20::nameCall {}.abi_encode().into(),
        },
    ];

    let ret = client
        .eth_call(mc, multicall3::aggregate3Call { calls }.abi_encode().into())
        .await?;
    let results = multicall3::aggregate3Call::abi_decode_returns(&ret)
        .map_err(|e| RpcError::Decode(format!("aggregate3: {e}")))?;

    let symbol = results
        .first()
        .filter(|r| r.success)
        .and_then(|r| erc20::symbolCall::abi_decode_returns(&r.returnData).ok())
        .unwrap_or_else(|| "TOKEN".to_string());
    let decimals = results
        .get(1)
        .filter(|r| r.success)
        .and_then(|r| erc20::decimalsCall::abi_decode_returns(&r.returnData).ok())
        .unwrap_or(18);
    let name = results
        .get(2)
        .filter(|r| r.success)
        .and_then(|r| erc20::nameCall::abi_decode_returns(&r.returnData).ok())
        .unwrap_or_else(|| symbol.clone());

    Ok(TokenMeta {
        symbol,
        decimals,
        name,
    })
}

async fn per_field_meta<C: ChainClient + Sync>(client: &C, target: Address) -> TokenMeta {
    let symbol = match client
        .eth_call(target, erc20::symbolCall {}.abi_encode().into())
        .await
    {
        Ok(ret) => erc20::symbolCall::abi_decode_returns(&ret).ok(),
        Err(_) => None,
    }
    .unwrap_or_else(|| "TOKEN".to_string());

    let decimals = match client
        .eth_call(target, erc20::decimalsCall {}.abi_encode().into())
        .await
    {
        Ok(ret) => erc20::decimalsCall::abi_decode_returns(&ret).ok(),
        Err(_) => None,
    }
    .unwrap_or(18);

    let name = match client
        .eth_call(target, erc20::nameCall {}.abi_encode().into())
        .await
    {
        Ok(ret) => erc20::nameCall::abi_decode_returns(&ret).ok(),
        Err(_) => None,
    }
    .unwrap_or_else(|| symbol.clone());

    TokenMeta {
        symbol,
        decimals,
        name,
    }
}
