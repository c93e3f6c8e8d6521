use clap::Parser;
use fleet_director::store::MemoryStore;
use fleet_director::{relay, Cli, Director};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Cli::parse().into_config()?);

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let relay = relay::connect(&config.relay)?;
    let store = Arc::new(MemoryStore::new());
    let (director, receiver) = Director::new(config.clone(), relay, store);
    let director = Arc::new(director);

    info!("Fleet director starting");
    info!("  Relay: {} {}", director.relay_name(), config.relay.url);
    info!(
        "  Policy: reset profiles at enrollment={}, push on new build={}, sign={}",
        config.policy.reset_profiles_at_enrollment,
        config.policy.push_on_new_build,
        config.policy.sign_profiles
    );
    info!(
        "  Reconcile every {:?}, {} checkin workers",
        config.reconcile.interval, config.queue.workers
    );

    let mut tasks = director.spawn_workers(receiver);

    let reconciler = director.reconciler();
    tasks.push(tokio::spawn(async move {
        reconciler.run().await;
    }));

    tokio::signal::ctrl_c().await?;
    warn!("Shutting down");

    for task in &tasks {
        task.abort();
    }
    join_all(tasks).await;

    info!("Fleet director stopped");
    Ok(())
}
