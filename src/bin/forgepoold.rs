//! forgepoold - the pool server daemon
//!
//! Composition root: loads configuration, wires the subsystems, and runs
//! the listener until interrupted. Storage and the upstream node are
//! pluggable collaborators; without external ones this binary runs against
//! the in-memory repository and a manually seeded template, which is enough
//! to bring miners up against a development chain.

use anyhow::Context;
use clap::Parser;
use forgepool::template::provider::ManualTemplateProvider;
use forgepool::template::BlockTemplate;
use forgepool::utils::{current_timestamp, init_logging};
use forgepool::{MemoryRepository, PoolConfig, PoolContext, PoolServer, ScryptParams, ScryptVariant};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "forgepoold", about = "Stratum mining pool server")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "forgepool.toml")]
    config: PathBuf,

    /// Override the configured stratum port
    #[arg(long)]
    port: Option<u16>,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log.as_deref());

    let mut config = if args.config.exists() {
        PoolConfig::load(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        warn!(path = %args.config.display(), "config file not found, using defaults");
        PoolConfig::default()
    };
    if let Some(port) = args.port {
        config.stratum.stratum_port = port;
    }

    let engine = Arc::new(
        ScryptVariant::new(ScryptParams {
            n: config.algorithm.scrypt_n,
            r: config.algorithm.scrypt_r,
            p: config.algorithm.scrypt_p,
        })
        .context("algorithm parameters")?,
    );

    let repository = Arc::new(MemoryRepository::new());
    let provider = Arc::new(ManualTemplateProvider::new());

    let context = PoolContext::new(
        config.clone(),
        engine,
        Arc::clone(&repository) as Arc<dyn forgepool::ShareRepository>,
        Arc::clone(&provider) as Arc<dyn forgepool::TemplateProvider>,
    );

    let cancel = CancellationToken::new();

    let distributor_task = tokio::spawn(
        Arc::clone(&context.distributor).run(cancel.child_token()),
    );
    let pump_task = tokio::spawn(forgepool::server::run_template_pump(
        Arc::clone(&context.store),
        Arc::clone(&context.distributor),
        Arc::clone(&provider) as Arc<dyn forgepool::TemplateProvider>,
        cancel.child_token(),
    ));

    // Seed one development template so connecting miners receive work;
    // a node-backed provider replaces this in production deployments.
    provider.push(dev_template());

    let server = PoolServer::new(Arc::clone(&context));
    let server_cancel = cancel.child_token();
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run(server_cancel).await {
            warn!(error = %e, "listener exited with error");
        }
    });

    info!(port = context.config.stratum.stratum_port, "forgepoold running, ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown requested");

    // Cancelling the root token closes every session; v2 miners are sent a
    // Reconnect push on the way out so they retry the endpoint.
    cancel.cancel();
    let _ = server_task.await;
    context.batch.stop().await;
    let _ = distributor_task.await;
    let _ = pump_task.await;

    let stats = context.batch.statistics();
    info!(
        received = stats.received,
        valid = stats.valid,
        invalid = stats.invalid,
        stale = stats.stale,
        dropped = stats.dropped,
        blocks = stats.blocks,
        "final share statistics"
    );
    Ok(())
}

/// Easiest-possible regtest-style template for standalone runs.
fn dev_template() -> BlockTemplate {
    BlockTemplate::new(
        0x2000_0000,
        [0u8; 32],
        current_timestamp() as u32,
        0x207f_ffff,
        1,
        50_0000_0000,
        b"dev-coinbase-prefix".to_vec(),
        b"dev-coinbase-suffix".to_vec(),
        vec![],
        vec![],
    )
}
