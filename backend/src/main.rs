use axum::{routing::get, Json, Router};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod automations;
mod config;
mod database;
mod error;
mod handlers;

pub use error::{ApiError, ApiResult, AppError};

use automations::{
    scheduler::{spawn_resume_worker, TokioRunScheduler},
    store::{MemoryStore, PgStore},
    templates::StoreTemplateRenderer,
    AutomationEngine, DurableStore, ScheduleRunner,
};
use automations::pipeline::HttpSendPipeline;

pub struct AppState {
    pub engine: Arc<AutomationEngine>,
    pub db_pool: Option<sqlx::PgPool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;

    let (store, db_pool): (Arc<dyn DurableStore>, Option<sqlx::PgPool>) =
        match &config.database_url {
            Some(url) => {
                let pool = database::create_pool(url).await?;
                database::migrate(&pool).await?;
                (Arc::new(PgStore::new(pool.clone())), Some(pool))
            }
            None => {
                tracing::warn!("DATABASE_URL not set, run state will not survive a restart");
                (Arc::new(MemoryStore::new()), None)
            }
        };

    let pipeline = Arc::new(HttpSendPipeline::new(
        &config.pipeline.base_url,
        config.pipeline.timeout(),
    )?);
    let renderer = Arc::new(StoreTemplateRenderer::new(store.clone()));
    let (run_scheduler, resume_rx) = TokioRunScheduler::new();

    let engine = Arc::new(AutomationEngine::new(
        store.clone(),
        pipeline.clone(),
        pipeline,
        renderer,
        Arc::new(run_scheduler),
    ));

    spawn_resume_worker(engine.clone(), resume_rx);
    let _schedules = ScheduleRunner::new(engine.clone(), store).start().await?;

    let app_state = Arc::new(AppState { engine, db_pool });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(|| async { "Relay Automation Engine v1.0.0" }))
        .route("/health", get(health_check))
        .nest("/api/v1", handlers::automation_routes())
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> Json<serde_json::Value> {
    let database = match &state.db_pool {
        Some(pool) => {
            if database::health_check(pool).await {
                "ok"
            } else {
                "unavailable"
            }
        }
        None => "in-memory",
    };
    Json(serde_json::json!({ "status": "ok", "database": database }))
}
