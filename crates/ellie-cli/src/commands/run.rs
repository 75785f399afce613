use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ellie_config::EllieConfig;
use ellie_core::Result;
use ellie_workers::{
    BackfillWorker, DedupWorker, IngestionWorker, LlmDedupReviewer, LlmSynthesizer, LlmTaxonomyClassifier,
    SynthesisWorker, TaxonomyWorker, Worker, extractor_from_config, spawn_worker,
};

use super::{build_embedder, build_gateway, open_store};

/// Every enabled worker paired with its poll interval.
fn build_workers(config: &EllieConfig) -> Result<Vec<(Arc<dyn Worker>, Duration)>> {
    let store = open_store(config)?;
    let gateway = build_gateway(config);
    let embedder = build_embedder(config)?;
    let secs = Duration::from_secs;

    let mut workers: Vec<(Arc<dyn Worker>, Duration)> = Vec::new();
    if config.ingestion.enabled {
        let extractor = extractor_from_config(&config.ingestion, Some(gateway.clone()))?;
        let worker = IngestionWorker::new(store.clone(), extractor, config.ingestion.clone())?;
        workers.push((Arc::new(worker), secs(config.ingestion.poll_interval_secs)));
    }
    if config.dedup.enabled {
        let worker = DedupWorker::new(
            store.clone(),
            Arc::new(LlmDedupReviewer::new(gateway.clone())),
            config.dedup.clone(),
        )
        .with_embedder(embedder.clone());
        workers.push((Arc::new(worker), secs(config.dedup.poll_interval_secs)));
    }
    if config.taxonomy.enabled {
        let worker = TaxonomyWorker::new(
            store.clone(),
            Arc::new(LlmTaxonomyClassifier::new(gateway.clone())),
            config.taxonomy.clone(),
        );
        workers.push((Arc::new(worker), secs(config.taxonomy.poll_interval_secs)));
    }
    if config.synthesis.enabled {
        let worker = SynthesisWorker::new(
            store.clone(),
            Arc::new(LlmSynthesizer::new(gateway.clone())),
            config.synthesis.clone(),
        )
        .with_embedder(embedder.clone());
        workers.push((Arc::new(worker), secs(config.synthesis.poll_interval_secs)));
    }
    if config.backfill.enabled {
        let worker = BackfillWorker::new(store.clone(), embedder.clone(), config.backfill.batch_size);
        workers.push((Arc::new(worker), secs(config.backfill.poll_interval_secs)));
    }
    Ok(workers)
}

pub(super) async fn cmd_run(config: EllieConfig, once: bool) -> Result<()> {
    let workers = build_workers(&config)?;
    if workers.is_empty() {
        warn!("every worker is disabled, nothing to run");
        return Ok(());
    }

    println!("Ellie v{}", env!("CARGO_PKG_VERSION"));
    println!("   Store: {}", config.store.db_path.display());
    println!("   Model: {}", config.llm.model);
    println!(
        "   Workers: {}",
        workers.iter().map(|(w, _)| w.name()).collect::<Vec<_>>().join(", ")
    );

    if once {
        for (worker, _) in &workers {
            let processed = worker.run_once().await?;
            println!("   {}: {processed} processed", worker.name());
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let handles: Vec<_> = workers
        .into_iter()
        .map(|(worker, poll)| {
            let name = worker.name();
            (name, spawn_worker(worker, poll, cancel.clone()))
        })
        .collect();

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, stopping workers");
    cancel.cancel();

    let mut failed = None;
    for (name, handle) in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(worker = name, error = %e, "worker stopped with an error");
                failed.get_or_insert(e);
            }
            Err(e) => error!(worker = name, error = %e, "worker task panicked"),
        }
    }
    match failed {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
