use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use modular_service::bootstrap;
use modular_service::config::Config;
use modular_service::storage::{FileStore, Store};
use modular_service::AppContext;

// Logging has to exist before configuration parsing so that load-time
// diagnostics land somewhere, so the log-related keys are read directly.
fn init_tracing() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level =
            std::env::var("MODULAR_API_SERVER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        tracing_subscriber::EnvFilter::new(level)
    });
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    match std::env::var("MODULAR_API_LOG_PATH") {
        Ok(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .init();
        }
        Err(_) => registry.init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing()?;

    let config = Config::from_env()?;
    let store: Arc<dyn Store> = Arc::new(FileStore::open(config.data_path.clone()).await?);
    let context = AppContext::build(config, store).await?;

    let outcome =
        bootstrap::init(&context.policies, &context.groups, &context.users).await?;
    if let Some(password) = outcome.admin_password {
        // surfaced exactly once, never persisted in the clear
        println!("Autogenerated admin password: {password}");
    }

    modular_service::serve(context).await
}
