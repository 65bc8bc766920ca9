use std::sync::Arc;
use std::time::Duration;

use actix_request_identifier::{IdReuse, RequestIdentifier};
use actix_web::web::Data;
use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_actix_web::TracingLogger;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

use crate::accrual::client::HttpAccrualClient;
use crate::accrual::poller::{drain_errors, AccrualPoller, ErrorSink, Shutdown};
use crate::accrual::queue::AccrualQueue;
use crate::accrual::sweep::run_sweeper;
use crate::config::Config;
use crate::database::connect::{create_db_connection_pool, run_migrations};
use crate::database::store::PgStore;
use crate::ledger::memory::MemoryStore;
use crate::state::AppState;

mod accrual;
mod auth;
mod config;
mod database;
mod error;
mod ledger;
mod luhn;
mod models;
mod money;
mod responses;
mod routes;
mod schema;
mod state;

const ERROR_SINK_CAPACITY: usize = 256;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::parse();

    // setup tracing and use bunyan formatter
    let max_level = config.log_level;
    let formatting_layer = BunyanFormattingLayer::new("gophermart".into(), std::io::stdout);
    let subscriber = Registry::default()
        .with(filter_fn(move |metadata| *metadata.level() <= max_level))
        .with(JsonStorageLayer)
        .with(formatting_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    let queue = Arc::new(AccrualQueue::new(config.queue_capacity, config.queue_overflow));
    let state = if config.in_memory {
        warn!("using the in-memory store, nothing survives a restart");
        AppState::new(MemoryStore::new(), queue.clone(), bcrypt::DEFAULT_COST)
    } else {
        let uri = config.database_uri.as_deref().context("DATABASE_URI is not set")?;
        let db = create_db_connection_pool(uri)?;
        run_migrations(&db)?;
        AppState::new(PgStore::new(db), queue.clone(), bcrypt::DEFAULT_COST)
    };

    let client = HttpAccrualClient::new(&config.accrual_system_address, config.accrual_timeout())
        .context("cannot build the accrual service client")?;
    let (errors, error_rx) = ErrorSink::new(ERROR_SINK_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let poller = Arc::new(AccrualPoller::new(
        queue.clone(),
        Arc::new(client),
        state.orders.clone(),
        state.balances.clone(),
        config.retry_policy(),
        errors,
    ));
    let error_drain = actix_web::rt::spawn(drain_errors(error_rx));
    let workers: Vec<_> = (0..config.poller_workers.max(1))
        .map(|worker| actix_web::rt::spawn(poller.clone().run(worker, Shutdown::new(shutdown_rx.clone()))))
        .collect();
    drop(poller);
    let sweeper = actix_web::rt::spawn(run_sweeper(
        state.orders.clone(),
        state.balances.clone(),
        queue.clone(),
        config.sweep_interval(),
        Shutdown::new(shutdown_rx),
    ));

    let state = Data::new(state);
    let server = actix_web::HttpServer::new(move || {
        actix_web::App::new()
            .wrap(RequestIdentifier::with_uuid().use_incoming_id(IdReuse::UseIncoming))
            .wrap(TracingLogger::default())
            .app_data(state.clone())
            .configure(routes::configure)
    })
    .shutdown_timeout(config.shutdown_grace_secs)
    .bind(config.address.as_str())
    .with_context(|| format!("cannot listen on {}", config.address))?;

    info!(address = %config.address, accrual = %config.accrual_system_address, "gophermart started");
    server.run().await?;

    // the http server is down, stop the background work
    info!("shutting down accrual workers");
    let _ = shutdown_tx.send(true);
    queue.close();
    let grace = config.shutdown_grace();
    if tokio::time::timeout(grace, futures::future::join_all(workers)).await.is_err() {
        warn!(grace_secs = grace.as_secs(), "accrual workers did not stop in time, their orders stay PROCESSING");
    }
    if tokio::time::timeout(Duration::from_secs(1), sweeper).await.is_err() {
        warn!("recovery sweeper did not stop in time");
    }
    // every sender is gone once the workers are
    let _ = tokio::time::timeout(Duration::from_secs(1), error_drain).await;
    info!("gophermart stopped");
    Ok(())
}
