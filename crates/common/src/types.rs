use serde::{Deserialize, Serialize};

/// Resolved ERC-20 metadata. Resolution never fails — gaps degrade to
/// placeholder values (`"TOKEN"` / 18 decimals) instead of aborting ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMeta {
    pub symbol: String,
    pub decimals: u8,
    pub name: String,
}

impl TokenMeta {
    pub fn placeholder() -> Self {
        Self {
            symbol: "TOKEN".to_string(),
            decimals: 18,
            name: "TOKEN".to_string(),
        }
    }
}

/// Constituent tokens of an AMM pair/pool contract, lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairTokens {
    pub token0: String,
    pub token1: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dex {
    UniswapV2,
    UniswapV3,
}

impl Dex {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UniswapV2 => "uniswap-v2",
            Self::UniswapV3 => "uniswap-v3",
        }
    }
}

/// Side of a priced swap from the trader's perspective: stablecoin-in is a
/// buy of the other leg, stablecoin-out is a sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapSide {
    Buy,
    Sell,
}

impl SwapSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}
