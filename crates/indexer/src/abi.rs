//! Event and call definitions for the three log families the ingestor walks,
//! plus the minimal metadata ABI surface (ERC-20 meta reads, pair/pool
//! constituents, Multicall3 batching).

use alloy::primitives::LogData;
use common::rpc::RpcLog;

pub mod erc20 {
    use alloy::sol;

    sol! {
        #[derive(Debug)]
        event Transfer(address indexed from, address indexed to, uint256 value);

        function symbol() external view returns (string);
        function decimals() external view returns (uint8);
        function name() external view returns (string);
    }
}

pub mod v2 {
    use alloy::sol;

    sol! {
        #[derive(Debug)]
        event Swap(
            address indexed sender,
            uint256 amount0In,
            uint256 amount1In,
            uint256 amount0Out,
            uint256 amount1Out,
            address indexed to
        );

        function token0() external view returns (address);
        function token1() external view returns (address);
    }
}

pub mod v3 {
    use alloy::sol;

    sol! {
        #[derive(Debug)]
        event Swap(
            address indexed sender,
            address indexed recipient,
            int256 amount0,
            int256 amount1,
            uint160 sqrtPriceX96,
            uint128 liquidity,
            int24 tick
        );

        function token0() external view returns (address);
        function token1() external view returns (address);
    }
}

pub mod multicall3 {
    use alloy::sol;

    /// Canonical Multicall3 deployment, same address on every chain we index.
    pub const ADDRESS: &str = "0xca11bde05977b3631167028862be2a173976ca11";

    sol! {
        #[derive(Debug)]
        struct Call3 {
            address target;
            bool allowFailure;
            bytes callData;
        }

        #[derive(Debug)]
        struct Result {
            bool success;
            bytes returnData;
        }

        function aggregate3(Call3[] calldata calls) external payable returns (Result[] memory returnData);
    }
}

/// Repackage a fetched log's topics+data for `SolEvent::decode_log_data`.
pub fn log_data(log: &RpcLog) -> LogData {
    LogData::new_unchecked(log.topics.clone(), log.data.clone())
}

/// Lowercased 0x-prefixed rendering. Addresses Display as EIP-55 checksummed;
/// persisted rows and cache keys are always lowercase.
pub fn addr_hex(address: alloy::primitives::Address) -> String {
    format!("0x{}", alloy::primitives::hex::encode(address))
}

pub fn b256_hex(hash: alloy::primitives::B256) -> String {
    format!("0x{}", alloy::primitives::hex::encode(hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Address;
    use alloy::sol_types::SolEvent;

    #[test]
    fn test_addr_hex_is_lowercase() {
        let addr: Address = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"
            .parse()
            .unwrap();
        assert_eq!(addr_hex(addr), "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
    }

    #[test]
    fn test_topic0_constants_match_canonical_signatures() {
        assert_eq!(
            format!("{}", erc20::Transfer::SIGNATURE_HASH),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
        assert_eq!(
            format!("{}", v2::Swap::SIGNATURE_HASH),
            "0xd78ad95fa46c994b6551d0da85fc275fe613ce37657fb8d5e3d130840159d822"
        );
        assert_eq!(
            format!("{}", v3::Swap::SIGNATURE_HASH),
            "0xc42079f94a6350d7e6235f29174924f928cc2ac818eb64fed8004e115fbcca67"
        );
    }

    #[test]
    fn test_event_signatures() {
        assert_eq!(erc20::Transfer::SIGNATURE, "Transfer(address,address,uint256)");
        assert_eq!(
            v2::Swap::SIGNATURE,
            "Swap(address,uint256,uint256,uint256,uint256,address)"
        );
        assert_eq!(
            v3::Swap::SIGNATURE,
            "Swap(address,address,int256,int256,uint160,uint128,int24)"
        );
    }
}
