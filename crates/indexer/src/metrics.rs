use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

pub fn describe() {
    describe_counter!(
        "indexer_blocks_ingested_total",
        "Blocks walked and committed, per chain."
    );
    describe_counter!(
        "indexer_reorgs_total",
        "Chain reorganizations recovered (block rows replaced)."
    );
    describe_counter!(
        "indexer_log_decode_skips_total",
        "Logs whose shape did not match the expected event despite topic0."
    );
    describe_counter!(
        "indexer_malformed_swaps_total",
        "Swap logs with ambiguous or zero-amount legs, skipped."
    );
    describe_counter!(
        "indexer_metadata_multicall_fallbacks_total",
        "Token metadata reads that fell back to per-field eth_call."
    );
    describe_counter!(
        "indexer_db_query_errors_total",
        "Failed database operations by op label."
    );
    describe_histogram!(
        "indexer_db_query_latency_ms",
        "Wall-clock latency of database operations."
    );
    describe_gauge!("indexer_chain_head", "Chain head as last observed, per chain.");
    describe_gauge!(
        "indexer_chain_last_processed",
        "Highest ingested block, per chain."
    );
    describe_gauge!(
        "indexer_ingest_lag_blocks",
        "Confirmed-head minus last processed block, per chain."
    );
}

pub fn install_prometheus(port: u16) -> Result<PrometheusHandle> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    Ok(PrometheusBuilder::new()
        .with_http_listener(addr)
        .install_recorder()?)
}
