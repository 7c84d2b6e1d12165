//! Qualipharm storefront - pharmacy e-commerce backend

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use qualipharm_store::api::{build_app, AppState};
use qualipharm_store::config::{load_app_config, AppConfig, StoreBackend};
use qualipharm_store::domain::aggregates::{Profile, ProfileDraft, Role};
use qualipharm_store::publisher::EventPublisher;
use qualipharm_store::store::{MemoryStore, PgStore, Store};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_app_config().context("invalid configuration")?;
    let store = connect_store(&config).await?;

    let nats = match config.nats_url.as_deref() {
        Some(url) => match async_nats::connect(url).await {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!(error = %e, %url, "NATS unavailable, domain events will only be logged");
                None
            }
        },
        None => None,
    };

    if let Some(email) = config.seed_super_admin_email.as_deref() {
        seed_super_admin(store.as_ref(), email).await?;
    }

    let bind_addr = config.bind_addr;
    let app = build_app(AppState::new(store, config, EventPublisher::new(nats)));

    tracing::info!(%bind_addr, "qualipharm-store listening");
    axum::serve(tokio::net::TcpListener::bind(bind_addr).await?, app).await?;
    Ok(())
}

async fn connect_store(config: &AppConfig) -> Result<Arc<dyn Store>> {
    match config.backend {
        StoreBackend::Postgres => {
            let url = config.database_url.as_deref().context("DATABASE_URL is required for the postgres backend")?;
            let pool = PgPoolOptions::new().max_connections(config.db_max_connections).connect(url).await?;
            let store = PgStore::new(pool);
            store.migrate().await?;
            tracing::info!(max_connections = config.db_max_connections, "connected to postgres");
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!("using the in-memory store, data is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn seed_super_admin(store: &dyn Store, email: &str) -> Result<()> {
    if store.find_profile_by_email(email).await?.is_some() {
        return Ok(());
    }
    let admin = Profile::register(ProfileDraft {
        email: email.to_string(),
        first_name: "Super".to_string(),
        last_name: "Admin".to_string(),
        role: Role::SuperAdmin,
        ..Default::default()
    })?;
    store.create_profile(&admin).await?;
    tracing::info!(profile_id = %admin.id, %email, "seeded super admin");
    Ok(())
}
