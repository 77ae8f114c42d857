use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use skynet_claims::SqliteClaims;
use skynet_core::CrondConfig;
use tokio::sync::watch;
use tracing::{error, info, warn};

mod command;
mod setup;

#[derive(Parser, Debug)]
#[command(
    name = "skynet-crond",
    version,
    about = "Cron daemon that runs each occurrence once across a fleet"
)]
struct Args {
    /// Config file (default: $SKYNET_CRON_CONFIG, then ~/.skynet/crond.toml)
    #[arg(long, short)]
    config: Option<String>,

    /// Validate the config and every job spec, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skynet_crond=info,skynet_scheduler=info".into()),
        )
        .init();

    let args = Args::parse();

    // load config: --config > SKYNET_CRON_CONFIG env > ~/.skynet/crond.toml
    let config = CrondConfig::load(args.config.as_deref()).inspect_err(|e| {
        error!(code = e.code(), "{e}");
    })?;
    let crond = setup::build(&config)?;

    if args.check {
        for job in crond.cron.jobs() {
            println!("{}\t{}", job.key(), job.spec());
        }
        info!(jobs = crond.cron.jobs().len(), "config ok");
        return Ok(());
    }
    if config.jobs.is_empty() {
        warn!("no jobs configured");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(claims) = crond.sqlite.clone() {
        let every = Duration::from_secs(config.claims.ttl_secs);
        tokio::spawn(purge_expired_claims(claims, every, shutdown_rx.clone()));
    }

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for ctrl-c; running until killed");
                // Keep the sender alive: dropping it would stop the cron.
                std::future::pending::<()>().await;
            }
        }
    });

    crond.cron.run(shutdown_rx).await;

    let stats = crond.cron.statistics();
    info!(statistics = %serde_json::to_string(&stats)?, "skynet-crond stopped");
    Ok(())
}

/// Delete expired reservations every `every` until shutdown.
async fn purge_expired_claims(
    claims: Arc<SqliteClaims>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = claims.purge_expired() {
                    warn!(error = %e, "claim purge failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
