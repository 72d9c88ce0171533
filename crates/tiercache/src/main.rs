use std::env;
use std::time::Duration;

use serde_json::json;
use tiercache::cache::keys;
use tiercache::config::loader::load_config;
use tiercache::{CacheLayer, observability};

/// Smoke-test a deployment: load settings, connect, do a read-through twice
/// and print what the cache saw.
#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    observability::init_tracing();

    let config_path = env::args()
        .skip_while(|a| a != "--config")
        .nth(1)
        .or_else(|| env::var("TIERCACHE_CONFIG").ok());

    let settings = match load_config(config_path.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };
    observability::init_tracing_from(&settings.logging);
    tiercache::metrics::init_metrics();

    let cache = match CacheLayer::new(settings) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Cache initialization failed: {e}");
            std::process::exit(2);
        }
    };
    if let Err(e) = cache.init().await {
        eprintln!("Cache initialization failed: {e}");
        std::process::exit(2);
    }

    let key = keys::task(0);
    for attempt in 1..=2 {
        let loaded = cache
            .get_with(
                &key,
                || async {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    Ok(Some(json!({"id": 0, "title": "probe", "completed": false})))
                },
                Some(Duration::from_secs(30)),
            )
            .await;
        match loaded {
            Ok(value) => tracing::info!(attempt, value = ?value, "probe read"),
            Err(e) => tracing::error!(attempt, error = %e, "probe read failed"),
        }
    }
    cache.delete(&key).await;

    match serde_json::to_string_pretty(&cache.get_stats()) {
        Ok(stats) => println!("{stats}"),
        Err(e) => eprintln!("Failed to render stats: {e}"),
    }
    if let Some(rendered) = tiercache::metrics::render_metrics() {
        println!("{rendered}");
    }

    cache.close().await;
}
