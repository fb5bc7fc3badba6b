pub mod catalog;
pub mod config;
pub mod errors;
pub mod geo;
pub mod http;
pub mod jobs;
pub mod normalize;
pub mod ranking;
pub mod regions;

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::catalog::CatalogClient;
use crate::geo::{GeoResolver, Geocoder};
use crate::jobs::JobService;
use crate::ranking::{EngineOptions, RecommendationEngine};

pub use crate::config::AppConfig;
pub use crate::errors::{AppError, AppResult};
pub use crate::http::{build_router, AppState};

impl AppState {
    /// Wires the resolver, engine, catalog client and worker pool from `config`.
    /// Must be called from within a tokio runtime.
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        let resolver = Arc::new(GeoResolver::from_config(&config)?);
        info!(
            provider = resolver.provider_tag().as_str(),
            capacity = config.geo_cache_capacity,
            "geo resolver ready"
        );
        let geocoder: Arc<dyn Geocoder> = resolver;
        let engine =
            RecommendationEngine::new(geocoder.clone(), EngineOptions::from_config(&config));
        let catalog = Arc::new(CatalogClient::from_config(&config)?);
        let jobs = JobService::start(
            engine,
            catalog,
            config.catalog_page_limit,
            config.worker_count,
        );

        Ok(Self {
            config,
            geocoder,
            jobs,
        })
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,comparables=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
