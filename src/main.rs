use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use paged_kv_cache::cache::manager::new_shared_manager;
use paged_kv_cache::config::{Cli, Config};
use paged_kv_cache::logging;
use paged_kv_cache::metrics::CacheMetrics;
use paged_kv_cache::server::admin_api::{build_router, AppState};
use paged_kv_cache::simulation::{Simulation, SimulationEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    info!("paged-kv-cache v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&cli.config)?;
    let cache = &config.cache;

    info!(
        block_size = cache.block_size,
        layers = cache.num_layers,
        kv_heads = cache.num_kv_heads,
        head_dim = cache.head_dim,
        cache_dtype = %cache.cache_dtype,
        storage_dtype = %cache.storage_dtype(),
        layout = %cache.layout,
        "Configuration loaded"
    );

    let block_bytes = cache.kv_block_bytes();
    info!(
        block_bytes,
        device_blocks = cache.num_device_blocks,
        host_blocks = cache.num_host_blocks,
        device_tokens = cache.num_device_blocks * cache.block_size,
        host_tokens = cache.num_host_blocks * cache.block_size,
        device_bytes = block_bytes * cache.num_device_blocks,
        "KV cache capacity"
    );

    let metrics = Arc::new(CacheMetrics::new()?);
    let manager = new_shared_manager(cache, config.eviction.clone(), metrics.clone())?;

    if cli.steps > 0 {
        let simulation = Simulation::new(
            manager.clone(),
            config.simulation.clone(),
            cache.native_dtype,
            cache.max_seq_len,
        );
        let mut events = simulation.spawn(cli.steps);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SimulationEvent::Step { step, running } => debug!(step, running, "Step"),
                    SimulationEvent::Done(stats) => info!(?stats, "Simulation finished"),
                    SimulationEvent::Error(e) => warn!("Simulation aborted: {e}"),
                }
            }
        });
    }

    let state = Arc::new(AppState {
        manager,
        metrics,
        start_time: Instant::now(),
    });
    let app = build_router(state);

    let listen_addr = cli.listen.unwrap_or(config.server.listen);
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
