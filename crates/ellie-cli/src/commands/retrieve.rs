use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use ellie_config::EllieConfig;
use ellie_core::Result;
use ellie_retrieval::{JsonlLogScanner, ProactiveInjector, RetrievalCascade, RetrievalPlanner, RetrievalRequest};
use ellie_tuning::load_applied;

use super::{build_embedder, open_store};

pub(super) async fn cmd_retrieve(
    config: EllieConfig,
    org: Uuid,
    query: String,
    room: Option<Uuid>,
    project: Option<Uuid>,
    limit: usize,
    json: bool,
) -> Result<()> {
    let store = open_store(&config)?;
    let mut cascade =
        RetrievalCascade::new(store).with_limits(config.retrieval.default_limit, config.retrieval.snippet_chars);
    if let Some(ref dir) = config.retrieval.log_dir {
        cascade = cascade.with_scanner(Arc::new(JsonlLogScanner::new(dir.clone())));
    }

    let outcome = cascade
        .retrieve(&RetrievalRequest {
            org_id: org,
            room_id: room,
            project_id: project,
            query,
            limit,
        })
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }
    if outcome.no_information {
        println!("No information found.");
        return Ok(());
    }
    println!("Tier {} ({} results)", outcome.tier_used.number(), outcome.items.len());
    for item in &outcome.items {
        println!("  [{}] {}", item.source, item.snippet);
    }
    Ok(())
}

pub(super) async fn cmd_plan(config: EllieConfig, org: Uuid, query: String, json: bool) -> Result<()> {
    let store = open_store(&config)?;
    let plan = RetrievalPlanner::new(store).plan(org, &query).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }
    println!("Strategy v{} ({} steps)", plan.strategy_version, plan.steps.len());
    for (i, step) in plan.steps.iter().enumerate() {
        println!("  {}. {:?} \"{}\" ({})", i + 1, step.scope, step.query, step.reason);
    }
    Ok(())
}

pub(super) async fn cmd_inject(
    config: EllieConfig,
    org: Uuid,
    room: Uuid,
    project: Option<Uuid>,
    message: String,
    lexical: bool,
    json: bool,
) -> Result<()> {
    let store = open_store(&config)?;
    // Knobs applied by the tuner win over the config file.
    let tuning = load_applied(&config.tuner.applied_config_path)?.unwrap_or_else(|| config.retrieval.tuning.clone());

    let mut injector = ProactiveInjector::new(store.clone(), store, tuning)
        .with_cooldown(Duration::from_secs(config.injection.cooldown_secs))
        .with_candidate_limit(config.injection.candidate_limit);
    if !lexical {
        injector = injector.with_embedder(build_embedder(&config)?);
    }

    let bundle = injector.inject(org, room, project, &message, Utc::now()).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&bundle)?);
    } else if bundle.is_empty() {
        println!("Nothing worth injecting.");
    } else {
        println!("{}", bundle.text);
    }
    Ok(())
}
