//! Demo entry point: runs one user through the invitation lifecycle.

use projections::SessionFactory;
use sqlx::postgres::PgPoolOptions;
use store::{CommitStore, InMemoryStore, PostgresStore};
use user_lifecycle::{AppError, Config, StoreBackend, UserService, registry, telemetry};

async fn run<S: CommitStore>(store: S) -> Result<(), AppError> {
    let service = UserService::new(SessionFactory::new(store, registry()?));

    let id = service.invite("jane@acme.inc", "Jane").await?;
    service.accept(id).await?;
    service.rename(id, "Jane Doe").await?;

    match service.user(id).await? {
        Some(user) => tracing::info!(
            %id,
            name = user.name(),
            email = user.email(),
            active = user.is_active(),
            "user projected"
        ),
        None => tracing::warn!(%id, "no user document"),
    }

    let report = service.rebuild().await?;
    tracing::info!(?report, "rebuild complete");

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // 1. Configuration, tracing and metrics
    let config = Config::from_env();
    telemetry::init_tracing(&config)?;
    let metrics_handle = telemetry::init_metrics()?;

    tracing::info!(backend = ?config.store_backend, "starting");

    // 2. Pick a store and run the lifecycle
    match config.store_backend {
        StoreBackend::Memory => run(InMemoryStore::new()).await?,
        StoreBackend::Postgres => {
            let url = config.database_url.as_deref().ok_or_else(|| {
                AppError::Config("DATABASE_URL is required for the postgres backend".to_string())
            })?;
            let pool = PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .connect(url)
                .await?;
            let store = PostgresStore::new(pool);
            store.run_migrations().await?;
            run(store).await?;
        }
    }

    // 3. Dump the metrics collected during the run
    println!("{}", metrics_handle.render());

    Ok(())
}
