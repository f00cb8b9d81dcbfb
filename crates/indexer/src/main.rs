use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

mod abi;
mod chain_client;
mod cli;
mod ingest;
mod jobs;
mod metadata;
mod metrics;
mod pnl;
mod positions;
mod queue;
mod scheduler;
mod scoring;
mod smart_money;

use common::rpc::EvmRpcClient;
use metadata::MetadataCache;
use queue::IngestQueue;
use scoring::ScoreParams;
use smart_money::{SmartMoney, SmartMoneyFilter};

fn inspection_filter(
    config: &common::config::Config,
    chain: &str,
) -> Result<SmartMoneyFilter> {
    let chain_id = cli::resolve_chain_id(config, chain)?;
    Ok(SmartMoneyFilter {
        chain_ids: vec![chain_id],
        window_secs: 3600,
        min_score: config.smart_money.min_score,
        min_usd: config.smart_money.min_usd,
        ..SmartMoneyFilter::default()
    })
}

#[allow(clippy::too_many_lines)] // per-chain wiring and worker loops
#[tokio::main]
async fn main() -> Result<()> {
    let config = common::config::Config::load().context("loading config/default.toml")?;

    let (dispatch, _otel_guard) =
        common::observability::build_dispatch("indexer", &config.general.log_level);
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    let cmd = cli::parse_args(std::env::args()).map_err(anyhow::Error::msg)?;

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Read-only inspection commands use the sync Database and exit.
    if matches!(cmd, cli::Command::Tokens { .. } | cli::Command::Scores { .. }) {
        let db = common::db::Database::open(&config.database.path)?;
        db.run_migrations()?;
        cli::run_command(&db, &config, &cmd)?;
        return Ok(());
    }

    let db = common::db::AsyncDb::open(&config.database.path).await?;
    let cfg = Arc::new(config);

    match cmd {
        cli::Command::Feed { chain } => {
            let filter = inspection_filter(&cfg, &chain)?;
            let service = SmartMoney::new(db, &cfg);
            let page = service.feed(&filter, None).await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
            return Ok(());
        }
        cli::Command::Clusters { chain } => {
            let filter = inspection_filter(&cfg, &chain)?;
            let service = SmartMoney::new(db, &cfg);
            let items = service.clusters(&filter).await?;
            println!("{}", serde_json::to_string_pretty(items.as_ref())?);
            return Ok(());
        }
        cli::Command::Backfill {
            chain,
            from_block,
            to_block,
        } => {
            // Inline execution path: same unit of work as the live tail,
            // without the queue.
            let chain = cfg
                .chain_by_name(&chain)
                .with_context(|| format!("unknown chain: {chain}"))?
                .clone();
            let rpc_url = chain.rpc_url()?;
            let client = EvmRpcClient::new(
                &rpc_url,
                Duration::from_secs(cfg.ingestion.rpc_timeout_secs),
            )?;
            let cache = MetadataCache::new(cfg.ingestion.metadata_cache_capacity);
            let params = ScoreParams::from(&cfg.scoring);

            tracing::info!(chain = %chain.short_name, from_block, to_block, "backfill starting");
            let task = queue::IngestTask {
                chain_id: chain.chain_id,
                from_block,
                to_block,
            };
            let stats = jobs::run_ingest_task(&db, &client, &cache, &chain, params, task).await?;
            println!(
                "backfill done: blocks={} transfers={} swaps={} reorgs={}",
                stats.blocks, stats.transfers, stats.swaps, stats.reorgs
            );
            return Ok(());
        }
        cli::Command::Run => {}
        cli::Command::Tokens { .. } | cli::Command::Scores { .. } => unreachable!(),
    }

    // ── Live mode ──
    tracing::info!("smart-money indexer starting");

    metrics::install_prometheus(cfg.observability.prometheus_port)?;
    metrics::describe();

    let cache = Arc::new(MetadataCache::new(cfg.ingestion.metadata_cache_capacity));
    let params = ScoreParams::from(&cfg.scoring);
    let mut scheduler_jobs = Vec::new();

    // One poll loop + one sequential worker per chain; chains never block
    // each other.
    for chain in cfg.chains().iter().cloned() {
        let rpc_url = chain
            .rpc_url()
            .with_context(|| format!("chain {}", chain.name))?;
        let client = Arc::new(EvmRpcClient::new(
            &rpc_url,
            Duration::from_secs(cfg.ingestion.rpc_timeout_secs),
        )?);
        let (ingest_queue, mut task_rx) = IngestQueue::new(cfg.ingestion.queue_depth);
        let (tick_tx, mut tick_rx) = tokio::sync::mpsc::channel::<()>(8);

        scheduler_jobs.push(scheduler::JobSpec {
            name: format!("poll_{}", chain.short_name),
            interval: Duration::from_secs(cfg.ingestion.poll_interval_secs),
            tick: tick_tx,
            run_immediately: true,
        });

        tokio::spawn({
            let db = db.clone();
            let client = client.clone();
            let chain = chain.clone();
            let blocks_per_batch = cfg.ingestion.blocks_per_batch;
            async move {
                while tick_rx.recv().await.is_some() {
                    let span = tracing::info_span!("job_run", job = "chain_poll", chain = %chain.short_name);
                    match jobs::run_chain_poll_once(
                        &db,
                        client.as_ref(),
                        &chain,
                        blocks_per_batch,
                        &ingest_queue,
                    )
                    .instrument(span)
                    .await
                    {
                        Ok(Some(task)) => tracing::info!(
                            from_block = task.from_block,
                            to_block = task.to_block,
                            "range enqueued"
                        ),
                        Ok(None) => tracing::debug!("caught up"),
                        Err(e) => tracing::error!(error = %e, "chain poll failed"),
                    }
                }
            }
        });

        tokio::spawn({
            let db = db.clone();
            let cache = cache.clone();
            let chain = chain.clone();
            async move {
                while let Some(task) = task_rx.recv().await {
                    let span = tracing::info_span!("job_run", job = "ingest", chain = %chain.short_name);
                    match jobs::run_ingest_task(
                        &db,
                        client.as_ref(),
                        cache.as_ref(),
                        &chain,
                        params,
                        task,
                    )
                    .instrument(span)
                    .await
                    {
                        Ok(stats) => tracing::info!(
                            from_block = task.from_block,
                            to_block = task.to_block,
                            blocks = stats.blocks,
                            transfers = stats.transfers,
                            swaps = stats.swaps,
                            reorgs = stats.reorgs,
                            "ingest task done"
                        ),
                        Err(e) => tracing::error!(
                            error = %e,
                            from_block = task.from_block,
                            to_block = task.to_block,
                            "ingest task failed; range retried on next poll"
                        ),
                    }
                }
            }
        });
    }

    let _scheduler_handles = scheduler::start(scheduler_jobs);
    tracing::info!(chains = cfg.chains().len(), "poll loops and workers running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down (force exit in 5s)");

    // Give spawned tasks a moment to finish, then force exit.
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        tracing::warn!("force exit after timeout");
        std::process::exit(0);
    });

    Ok(())
}
