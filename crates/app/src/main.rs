use std::sync::Arc;

use engine::{BillPaymentSaga, SimulatedGateway};
use migration::{Migrator, MigratorTrait};

mod settings;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let settings = settings::Settings::new()?;
    let mut tasks = tokio::task::JoinSet::new();

    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "billpay={level},server={level},engine={level}",
            level = settings.app.level
        ))
        .init();

    let db = connect(&settings.database).await?;
    let saga = Arc::new(
        BillPaymentSaga::builder()
            .database(db)
            .gateway(Arc::new(SimulatedGateway::new(settings.gateway)))
            .config(settings.saga)
            .build()
            .await?,
    );

    let workers = saga.start_workers()?;
    let compensation = saga.spawn_compensation_listener();
    let reconciler = saga.spawn_reconciler();

    if let Some(server) = settings.server {
        let saga = Arc::clone(&saga);
        tasks.spawn(async move {
            tracing::info!("Found server settings...");
            let bind = server.bind.unwrap_or_else(|| "127.0.0.1".to_string());
            let addr = format!("{}:{}", bind, server.port);
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(err) => {
                    tracing::error!("failed to bind server listener: {err}");
                    return;
                }
            };
            if let Err(err) = server::run_with_listener(saga, listener).await {
                tracing::error!("server failed: {err}");
            }
        });
    } else {
        tracing::warn!("no server settings, running job workers only");
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::error!("failed to listen for shutdown signal: {err}");
            }
            tracing::info!("shutting down");
        }
        Some(_) = tasks.join_next(), if !tasks.is_empty() => {
            tracing::warn!("server stopped");
        }
    }

    tasks.shutdown().await;
    reconciler.abort();
    compensation.abort();
    workers.shutdown();

    Ok(())
}

async fn connect(
    config: &settings::Database,
) -> Result<sea_orm::DatabaseConnection, Box<dyn std::error::Error + Send + Sync>> {
    let database = sea_orm::Database::connect(config.url()).await?;
    Migrator::up(&database, None).await?;
    Ok(database)
}
