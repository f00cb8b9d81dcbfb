//! Trait seam between the pipeline and the JSON-RPC transport, so ingestion
//! and metadata resolution are testable against fakes.

use alloy::primitives::{Address, Bytes, B256};
use common::rpc::{EvmRpcClient, RpcBlock, RpcError, RpcLog};

pub trait ChainClient {
    /// Current head block number (`eth_blockNumber`).
    fn head_number(&self) -> impl std::future::Future<Output = Result<u64, RpcError>> + Send;

    /// Block at `number` with full transaction objects; `None` if the node
    /// does not have it.
    fn block_with_txs(
        &self,
        number: u64,
    ) -> impl std::future::Future<Output = Result<Option<RpcBlock>, RpcError>> + Send;

    /// Logs matching `topic0` over an inclusive block range.
    fn logs_by_topic(
        &self,
        from_block: u64,
        to_block: u64,
        topic0: B256,
    ) -> impl std::future::Future<Output = Result<Vec<RpcLog>, RpcError>> + Send;

    /// Read-only contract call against latest state.
    fn eth_call(
        &self,
        to: Address,
        data: Bytes,
    ) -> impl std::future::Future<Output = Result<Bytes, RpcError>> + Send;
}

impl ChainClient for EvmRpcClient {
    async fn head_number(&self) -> Result<u64, RpcError> {
        self.block_number().await
    }

    async fn block_with_txs(&self, number: u64) -> Result<Option<RpcBlock>, RpcError> {
        self.block_by_number(number).await
    }

    async fn logs_by_topic(
        &self,
        from_block: u64,
        to_block: u64,
        topic0: B256,
    ) -> Result<Vec<RpcLog>, RpcError> {
        EvmRpcClient::logs_by_topic(self, from_block, to_block, topic0).await
    }

    async fn eth_call(&self, to: Address, data: Bytes) -> Result<Bytes, RpcError> {
        self.call(to, &data).await
    }
}
