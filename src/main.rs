use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

use slotd::cache_log::LogBackend;
use slotd::clock::SystemClock;
use slotd::config::Config;
use slotd::engine::Engine;
use slotd::request;
use slotd::store::{Fixture, MemoryBusySource, MemoryConfigStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let config = Config::from_env();
    slotd::observability::init(config.metrics_port);

    let (config_store, busy) = match &config.fixture {
        Some(path) => {
            let fixture = Fixture::load(path)?;
            info!("loaded fixture {}", path.display());
            fixture.into_sources()
        }
        None => (MemoryConfigStore::new(), MemoryBusySource::new()),
    };

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;
    let log_path = config.data_dir.join("availability.log");
    let backend = LogBackend::open(&log_path, config.compact_threshold)?;

    let engine = Engine::new(
        &config,
        Arc::new(config_store),
        Arc::new(busy),
        Arc::new(backend),
        Arc::new(SystemClock),
    )?;

    info!("slotd ready");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  window_days: {}", config.window_days);
    info!("  cache_ttl_secs: {}", config.cache_ttl_secs);
    info!("  timezone: {}", config.reference_timezone);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));
    let cached = engine.cached_slot_counts().await?;
    info!("  cached entries: {} ({} slots)", cached.len(), cached.iter().map(|(_, _, n)| n).sum::<u64>());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let response = request::handle_line(&engine, &line).await;
                let mut out = serde_json::to_vec(&response)?;
                out.push(b'\n');
                stdout.write_all(&out).await?;
                stdout.flush().await?;
            }
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    info!("slotd stopped");
    Ok(())
}
