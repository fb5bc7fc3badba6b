use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_PROPERTIES_API_BASE_URL: &str = "https://api.iic2173grupo4.tech";
const DEFAULT_GOOGLE_GEOCODE_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";
const DEFAULT_MAPBOX_GEOCODE_URL: &str = "https://api.mapbox.com/geocoding/v5/mapbox.places";
const DEFAULT_NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org/search";
const DEFAULT_GEO_CACHE_CAPACITY: usize = 10_000;
const DEFAULT_OUTBOUND_TIMEOUT_SECS: u64 = 10;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub google_maps_api_key: Option<SecretString>,
    pub mapbox_token: Option<SecretString>,
    pub geocoder_user_agent: String,
    pub google_geocode_url: String,
    pub mapbox_geocode_url: String,
    pub nominatim_url: String,
    pub geocode_timeout_secs: u64,
    pub geo_cache_capacity: usize,
    pub nominatim_min_interval_ms: u64,
    pub properties_api_base_url: String,
    pub catalog_page_limit: u32,
    pub auth0_domain: Option<String>,
    pub auth0_client_id: Option<String>,
    pub auth0_client_secret: Option<SecretString>,
    pub auth0_audience: Option<String>,
    pub auth0_token_url: Option<String>,
    pub worker_count: usize,
    pub global_fallback_on_missing_comuna: bool,
    pub global_pool_size: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub geocode_provider: &'static str,
    pub geocode_timeout_secs: u64,
    pub geo_cache_capacity: usize,
    pub nominatim_min_interval_ms: u64,
    pub properties_api_base_url: String,
    pub catalog_page_limit: u32,
    pub has_catalog_credentials: bool,
    pub worker_count: usize,
    pub global_fallback_on_missing_comuna: bool,
    pub global_pool_size: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string()),
            google_maps_api_key: parse_secret("GOOGLE_MAPS_API_KEY"),
            mapbox_token: parse_secret("MAPBOX_TOKEN"),
            geocoder_user_agent: env::var("GEOCODER_UA")
                .unwrap_or_else(|_| format!("comparables/{}", env!("CARGO_PKG_VERSION"))),
            google_geocode_url: parse_string("GOOGLE_GEOCODE_URL", DEFAULT_GOOGLE_GEOCODE_URL),
            mapbox_geocode_url: parse_string("MAPBOX_GEOCODE_URL", DEFAULT_MAPBOX_GEOCODE_URL),
            nominatim_url: parse_string("NOMINATIM_URL", DEFAULT_NOMINATIM_URL),
            geocode_timeout_secs: parse_u64("GEOCODE_TIMEOUT_SECS", DEFAULT_OUTBOUND_TIMEOUT_SECS)
                .max(1),
            geo_cache_capacity: parse_usize("GEO_CACHE_CAPACITY", DEFAULT_GEO_CACHE_CAPACITY)
                .max(1),
            nominatim_min_interval_ms: parse_u64("NOMINATIM_MIN_INTERVAL_MS", 1_000),
            properties_api_base_url: parse_string(
                "PROPERTIES_API_BASE_URL",
                DEFAULT_PROPERTIES_API_BASE_URL,
            ),
            catalog_page_limit: parse_u32("CATALOG_PAGE_LIMIT", 500).max(1),
            auth0_domain: parse_optional("AUTH0_DOMAIN"),
            auth0_client_id: parse_optional("AUTH0_CLIENT_ID"),
            auth0_client_secret: parse_secret("AUTH0_CLIENT_SECRET"),
            auth0_audience: parse_optional("AUTH0_AUDIENCE"),
            auth0_token_url: parse_optional("AUTH0_TOKEN_URL"),
            worker_count: parse_usize("RECO_WORKERS", 4).max(1),
            global_fallback_on_missing_comuna: parse_bool(
                "RECO_GLOBAL_FALLBACK_ON_MISSING_COMUNA",
                false,
            ),
            global_pool_size: parse_usize("RECO_GLOBAL_POOL_SIZE", 20).max(1),
        }
    }

    /// Token endpoint for the client-credentials exchange, when one is configured.
    pub fn token_url(&self) -> Option<String> {
        self.auth0_token_url.clone().or_else(|| {
            self.auth0_domain
                .as_ref()
                .map(|domain| format!("https://{}/oauth/token", domain.trim_end_matches('/')))
        })
    }

    pub fn has_catalog_credentials(&self) -> bool {
        self.token_url().is_some()
            && self.auth0_client_id.is_some()
            && self.auth0_client_secret.is_some()
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        let geocode_provider = if self.google_maps_api_key.is_some() {
            "google"
        } else if self.mapbox_token.is_some() {
            "mapbox"
        } else {
            "nominatim"
        };
        PublicAppConfig {
            geocode_provider,
            geocode_timeout_secs: self.geocode_timeout_secs,
            geo_cache_capacity: self.geo_cache_capacity,
            nominatim_min_interval_ms: self.nominatim_min_interval_ms,
            properties_api_base_url: self.properties_api_base_url.clone(),
            catalog_page_limit: self.catalog_page_limit,
            has_catalog_credentials: self.has_catalog_credentials(),
            worker_count: self.worker_count,
            global_fallback_on_missing_comuna: self.global_fallback_on_missing_comuna,
            global_pool_size: self.global_pool_size,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_secret(key: &str) -> Option<SecretString> {
    parse_optional(key).map(SecretString::from)
}

fn parse_string(key: &str, default: &str) -> String {
    parse_optional(key).unwrap_or_else(|| default.to_string())
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

impl Default for AppConfig {
    /// Built-in defaults with no credentials, independent of the environment.
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            google_maps_api_key: None,
            mapbox_token: None,
            geocoder_user_agent: format!("comparables/{}", env!("CARGO_PKG_VERSION")),
            google_geocode_url: DEFAULT_GOOGLE_GEOCODE_URL.to_string(),
            mapbox_geocode_url: DEFAULT_MAPBOX_GEOCODE_URL.to_string(),
            nominatim_url: DEFAULT_NOMINATIM_URL.to_string(),
            geocode_timeout_secs: DEFAULT_OUTBOUND_TIMEOUT_SECS,
            geo_cache_capacity: DEFAULT_GEO_CACHE_CAPACITY,
            nominatim_min_interval_ms: 1_000,
            properties_api_base_url: DEFAULT_PROPERTIES_API_BASE_URL.to_string(),
            catalog_page_limit: 500,
            auth0_domain: None,
            auth0_client_id: None,
            auth0_client_secret: None,
            auth0_audience: None,
            auth0_token_url: None,
            worker_count: 4,
            global_fallback_on_missing_comuna: false,
            global_pool_size: 20,
        }
    }
}
