use arturo_broker::RedisBrokerGateway;
use arturo_persistence::PostgresJournal;
use std::env;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config_path = env::var("ARTURO_CONFIG").unwrap_or_else(|_| "/etc/arturo/controller.toml".to_owned());
    let config = arturo_controller::config::load_config_from_path(Path::new(&config_path))
        .unwrap_or_else(|error| panic!("failed to load config from '{config_path}': {error}"));

    info!(broker = %config.broker.url, "connecting to broker");
    let broker = RedisBrokerGateway::connect(&config.broker.url)
        .await
        .expect("failed to connect to broker");

    info!("connecting to persistence database");
    let pool = arturo_persistence::create_pool(&config.persistence.database_url).await;
    arturo_persistence::run_migrations(&pool).await;
    info!("migrations applied");

    let journal = PostgresJournal::new(pool);
    let app = arturo_controller::App::new(&config, Arc::new(broker), Arc::new(journal));

    let cancel = CancellationToken::new();
    let handles = app.spawn_background_tasks(cancel.clone());
    info!(instance_id = %config.instance_id, "controller running");

    shutdown_signal().await;
    arturo_controller::shutdown(cancel, handles).await;
    info!("controller shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
