mod allocation;
mod bus;
mod collaborators;
mod config;
mod core;
mod evolution;
mod feedback;
mod ledger;
mod persistence;
mod report;
mod sentiment;

use crate::allocation::actor::AllocationActor;
use crate::allocation::engine::AllocationEngine;
use crate::collaborators::http::HttpCollaborators;
use crate::evolution::actor::EvolutionActor;
use crate::feedback::actor::FeedbackActor;
use crate::feedback::threshold::ThresholdController;
use crate::ledger::actor::LedgerActor;
use crate::report::actor::ReportActor;
use crate::sentiment::actor::SentimentActor;
use crate::bus::types::Bus;
use crate::config::config::AppCfg;
use crate::core::types::{Actor, Asset};
use crate::persistence::database::Database;
use anyhow::{Context, Result};
use reqwest::Client;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    dotenv::dotenv().ok();

    let cfg = AppCfg::load("config.yml")?;

    // Root span for the supervisor/main thread
    let span = info_span!(
        "Supervisor",
        pid = %std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
    );

    // logs below are inside "Supervisor"
    let _enter = span.enter();

    info!("Starting up");

    if let Some(listen) = &cfg.metrics.listen {
        let addr: std::net::SocketAddr = listen.parse().context("metrics.listen")?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing metrics exporter")?;
        info!("Metrics exporter listening on {}", addr);
    }

    info!("Connecting to database");
    let db = Database::new(&cfg.database.url, cfg.database.max_connections).await?;

    info!("Initializing shared pub/sub Bus");
    let bus = Bus::new();
    let shutdown = CancellationToken::new();

    info!("Initializing Client");
    let client = Client::builder()
        .user_agent(cfg.http.user_agent.clone())
        .pool_idle_timeout(cfg.http.pool_idle_timeout)
        .pool_max_idle_per_host(cfg.http.pool_max_idle_per_host)
        .timeout(cfg.http.timeout)
        .build()
        .expect("client");

    let collaborators = Arc::new(HttpCollaborators::new(cfg.collaborators.clone(), client));

    for sector in &cfg.sectors {
        info!(
            "Sector {} ({}) with {} assets",
            sector.id,
            sector.name,
            sector.assets.len()
        );
    }
    let universe: HashMap<String, Vec<Asset>> = cfg
        .sectors
        .iter()
        .map(|s| (s.id.clone(), s.universe()))
        .collect();
    let sector_ids: Vec<String> = cfg.sectors.iter().map(|s| s.id.clone()).collect();
    let start_capital =
        Decimal::from_f64(cfg.allocation.start_capital).unwrap_or(Decimal::ZERO);

    let engine = AllocationEngine::new(cfg.allocation.clone(), universe)
        .map_err(|e| anyhow::anyhow!("allocation universe: {e}"))?;

    // Resume the threshold from its persisted head so lineage survives
    // restarts.
    let controller = match db.load_latest_threshold().await {
        Ok(Some((value, version))) => {
            info!("Resuming confidence threshold {:.3} (v{})", value, version);
            ThresholdController::resume(cfg.feedback.clone(), value, version)
        }
        Ok(None) => ThresholdController::new(cfg.feedback.clone()),
        Err(e) => {
            error!("Failed to load threshold head: {}", e);
            ThresholdController::new(cfg.feedback.clone())
        }
    };
    let initial_threshold = controller.value();

    info!("Building actors");
    let sentiment = SentimentActor::new(
        bus.clone(),
        shutdown.clone(),
        collaborators.clone(),
        cfg.scoring.clone(),
        sector_ids,
        db.clone(),
    );
    let allocation = AllocationActor::new(
        bus.clone(),
        shutdown.clone(),
        engine,
        collaborators.clone(),
        db.clone(),
        cfg.feedback.evaluation_horizon,
        initial_threshold,
    );
    let ledger = LedgerActor::new(
        bus.clone(),
        shutdown.clone(),
        cfg.ledger.clone(),
        collaborators.clone(),
        db.clone(),
        start_capital,
    );
    let feedback = FeedbackActor::new(
        bus.clone(),
        shutdown.clone(),
        cfg.feedback.clone(),
        collaborators.clone(),
        db.clone(),
        controller,
    );
    let evolution = EvolutionActor::new(
        bus.clone(),
        shutdown.clone(),
        cfg.evolution.clone(),
        collaborators.clone(),
        collaborators.clone(),
        db.clone(),
    );
    let report = ReportActor::new(
        bus.clone(),
        shutdown.clone(),
        cfg.report.clone(),
        initial_threshold,
    );

    info!("Spawning actors");
    let mut actors = tokio::task::JoinSet::new();

    actors.spawn(ledger.run().instrument(info_span!("Ledger")));
    actors.spawn(allocation.run().instrument(info_span!("Allocation")));
    actors.spawn(sentiment.run().instrument(info_span!("Sentiment")));
    actors.spawn(feedback.run().instrument(info_span!("Feedback")));
    actors.spawn(evolution.run().instrument(info_span!("Evolution")));
    actors.spawn(report.run().instrument(info_span!("Report")));

    info!("Waiting for actors");

    tokio::select! {
        _ = async {
             while let Some(res) = actors.join_next().await {
                 match res {
                    Ok(Ok(()))  => info!("Actor exited cleanly"),
                    Ok(Err(e))  => error!(?e, "Actor returned error"),
                    Err(panic)  => error!(?panic, "Actor panicked/cancelled"),
                }
            }
        } => {  }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down supervisor loop");
            shutdown.cancel();
        }
    }

    info!("Waiting for graceful shutdown of actors");
    while let Some(res) = actors.join_next().await {
        match res {
            Ok(Ok(())) => info!("Actor exited cleanly"),
            Ok(Err(e)) => error!(?e, "Actor returned error"),
            Err(panic) => error!(?panic, "Actor panicked/cancelled"),
        }
    }

    info!("Supervisor exit");
    Ok(())
}
