use anyhow::Context;
use axum::{routing::get, Router};
use sensor_ingestor::cache::RedisLatestValueStore;
use sensor_ingestor::config::Config;
use sensor_ingestor::db::{self, PgHistoryStore};
use sensor_ingestor::metrics;
use sensor_ingestor::mqtt::MqttConsumer;
use sensor_ingestor::rest;
use sensor_ingestor::service::SensorDataService;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!("Fatal: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    info!("Starting sensor ingestor");
    info!("MQTT broker: {}:{}", config.mqtt.host, config.mqtt.port);
    info!("MQTT topic: {} ({:?})", config.mqtt_topic, config.mqtt_qos);
    info!("HTTP port: {}", config.http_port);
    info!("Database: {}", config.database_display());

    metrics::init_metrics().context("failed to register metrics")?;

    let pool = db::make_pool(&config.database_url)
        .await
        .context("failed to initialize history store")?;
    let history = Arc::new(PgHistoryStore::new(pool));

    let latest = Arc::new(
        RedisLatestValueStore::connect(
            &config.redis_addr,
            config.redis_password.as_deref(),
            config.redis_db,
        )
        .await
        .context("failed to initialize latest-value store")?,
    );

    let service = Arc::new(SensorDataService::new(
        history.clone(),
        latest.clone(),
        config.store_timeout,
    ));

    let consumer = MqttConsumer::new(config.mqtt.clone(), service.clone());
    let subscription = tokio::select! {
        subscription = consumer.subscribe(&config.mqtt_topic, config.mqtt_qos) => {
            subscription.context("failed to subscribe to MQTT topic")?
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal before MQTT broker was reachable");
            drop(service);
            drop(latest);
            history.close().await;
            return Ok(());
        }
    };

    let app = rest::instrument(
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .merge(rest::create_router(service.clone())),
    );

    let http_addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", http_addr))?;
    info!("HTTP server listening on {}", http_addr);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let mut server_handle = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        if let Err(e) = server.await {
            error!("HTTP server error: {}", e);
        }
    });

    let server_stopped = tokio::select! {
        _ = &mut server_handle => {
            error!("HTTP server terminated");
            true
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            false
        }
    };

    // Stop intake, drain, then release resources.
    info!("Shutting down HTTP server");
    let _ = shutdown_tx.send(true);
    if !server_stopped
        && tokio::time::timeout(config.shutdown_timeout, &mut server_handle)
            .await
            .is_err()
    {
        warn!(
            "HTTP server did not drain within {:?}, aborting in-flight requests",
            config.shutdown_timeout
        );
        server_handle.abort();
    }

    subscription.shutdown(config.shutdown_timeout).await;

    drop(service);
    drop(latest);
    info!("Redis connection released");
    history.close().await;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

async fn health_handler() -> &'static str {
    "ok"
}
