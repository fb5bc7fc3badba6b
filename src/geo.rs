use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use reqwest::{Client, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const COUNTRY_CODE: &str = "cl";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderTag {
    Google,
    Mapbox,
    Nominatim,
}

impl ProviderTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderTag::Google => "google",
            ProviderTag::Mapbox => "mapbox",
            ProviderTag::Nominatim => "nominatim",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoResult {
    pub lat: f64,
    pub lon: f64,
    pub provider: ProviderTag,
}

impl GeoResult {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates {
            lat: self.lat,
            lon: self.lon,
        }
    }
}

/// Anything that can turn an address into coordinates without failing.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> Option<GeoResult>;
}

#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    fn tag(&self) -> ProviderTag;

    /// Whether calls must go through the shared one-request-per-interval limiter.
    fn throttled(&self) -> bool {
        false
    }

    async fn lookup(&self, address: &str) -> AppResult<Option<GeoResult>>;
}

/// Address resolver with a bounded cache and a limiter for the free provider.
///
/// One instance is created per process and shared by handle; the cache and the
/// limiter are the only mutable state and both are guarded by short critical
/// sections.
pub struct GeoResolver {
    provider: Arc<dyn GeocodeProvider>,
    cache: Mutex<LruCache<String, GeoResult>>,
    rate_limiter: Option<RateLimiter>,
}

impl GeoResolver {
    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let timeout = Duration::from_secs(config.geocode_timeout_secs);
        let provider: Arc<dyn GeocodeProvider> =
            match (config.google_maps_api_key.clone(), config.mapbox_token.clone()) {
                (Some(key), _) => Arc::new(GoogleGeocoder::new(
                    &config.google_geocode_url,
                    key,
                    timeout,
                )?),
                (None, Some(token)) => Arc::new(MapboxGeocoder::new(
                    &config.mapbox_geocode_url,
                    token,
                    timeout,
                )?),
                (None, None) => Arc::new(NominatimGeocoder::new(
                    &config.nominatim_url,
                    &config.geocoder_user_agent,
                    timeout,
                )?),
            };
        debug!(provider = provider.tag().as_str(), "geocoding provider selected");
        Ok(Self::with_provider(
            provider,
            config.geo_cache_capacity,
            Duration::from_millis(config.nominatim_min_interval_ms),
        ))
    }

    pub fn with_provider(
        provider: Arc<dyn GeocodeProvider>,
        cache_capacity: usize,
        min_interval: Duration,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        let rate_limiter = provider.throttled().then(|| RateLimiter::new(min_interval));
        Self {
            provider,
            cache: Mutex::new(LruCache::new(capacity)),
            rate_limiter,
        }
    }

    pub fn provider_tag(&self) -> ProviderTag {
        self.provider.tag()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }

    pub async fn geocode(&self, address: &str) -> Option<GeoResult> {
        let key = cache_key(address);
        if key.is_empty() {
            return None;
        }

        if let Some(hit) = self.cache.lock().get(&key).copied() {
            trace!(address = key, "geocode cache hit");
            return Some(hit);
        }

        if let Some(limiter) = &self.rate_limiter {
            limiter.wait().await;
        }

        let result = match self.provider.lookup(address.trim()).await {
            Ok(Some(result)) => result,
            Ok(None) => {
                debug!(address = key, provider = self.provider.tag().as_str(), "no match");
                return None;
            }
            Err(err) => {
                warn!(
                    ?err,
                    address = key,
                    provider = self.provider.tag().as_str(),
                    "geocoding failed"
                );
                return None;
            }
        };

        let mut cache = self.cache.lock();
        if !cache.contains(&key) {
            cache.put(key, result);
        }
        Some(result)
    }
}

#[async_trait]
impl Geocoder for GeoResolver {
    async fn geocode(&self, address: &str) -> Option<GeoResult> {
        GeoResolver::geocode(self, address).await
    }
}

/// Normalized form of an address used as the cache key.
pub fn cache_key(address: &str) -> String {
    address
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Spaces calls at least `min_interval` apart.
///
/// Each caller reserves the next free slot under a short lock and then sleeps
/// outside of it, so waiters queue in arrival order without holding the lock
/// for the whole interval.
struct RateLimiter {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    fn reserve(&self) -> Instant {
        let mut next = self.next_slot.lock();
        let now = Instant::now();
        let slot = match *next {
            Some(reserved) if reserved > now => reserved,
            _ => now,
        };
        *next = Some(slot + self.min_interval);
        slot
    }

    async fn wait(&self) {
        let slot = self.reserve();
        if slot > Instant::now() {
            trace!(delay = ?(slot - Instant::now()), "throttling geocoding request");
            sleep_until(slot).await;
        }
    }
}

fn http_client(timeout: Duration, user_agent: Option<&str>) -> AppResult<Client> {
    let mut builder = Client::builder().timeout(timeout);
    if let Some(agent) = user_agent {
        builder = builder.user_agent(agent.to_string());
    }
    Ok(builder.build()?)
}

fn parse_endpoint(raw: &str) -> AppResult<Url> {
    Url::parse(raw)
        .map_err(|err| AppError::Config(format!("invalid geocoding endpoint {raw}: {err}")))
}

pub struct GoogleGeocoder {
    http: Client,
    endpoint: Url,
    api_key: SecretString,
}

impl GoogleGeocoder {
    pub fn new(endpoint: &str, api_key: SecretString, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            http: http_client(timeout, None)?,
            endpoint: parse_endpoint(endpoint)?,
            api_key,
        })
    }
}

#[async_trait]
impl GeocodeProvider for GoogleGeocoder {
    fn tag(&self) -> ProviderTag {
        ProviderTag::Google
    }

    async fn lookup(&self, address: &str) -> AppResult<Option<GeoResult>> {
        #[derive(Deserialize)]
        struct Response {
            status: Option<String>,
            #[serde(default)]
            results: Vec<ResponseResult>,
        }

        #[derive(Deserialize)]
        struct ResponseResult {
            geometry: ResponseGeometry,
        }

        #[derive(Deserialize)]
        struct ResponseGeometry {
            location: ResponseLocation,
        }

        #[derive(Deserialize)]
        struct ResponseLocation {
            lat: f64,
            lng: f64,
        }

        let response = self
            .http
            .get(self.endpoint.clone())
            .query(&[
                ("address", address),
                ("key", self.api_key.expose_secret()),
                ("region", COUNTRY_CODE),
            ])
            .send()
            .await?
            .error_for_status()?;

        let parsed: Response = response.json().await?;
        if parsed.status.as_deref() != Some("OK") {
            return Ok(None);
        }
        Ok(parsed.results.into_iter().next().map(|first| GeoResult {
            lat: first.geometry.location.lat,
            lon: first.geometry.location.lng,
            provider: ProviderTag::Google,
        }))
    }
}

pub struct MapboxGeocoder {
    http: Client,
    endpoint: Url,
    token: SecretString,
}

impl MapboxGeocoder {
    pub fn new(endpoint: &str, token: SecretString, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            http: http_client(timeout, None)?,
            endpoint: parse_endpoint(endpoint)?,
            token,
        })
    }

    fn place_url(&self, address: &str) -> AppResult<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::Config("mapbox endpoint cannot take a path".into()))?
            .pop_if_empty()
            .push(&format!("{address}.json"));
        Ok(url)
    }
}

#[async_trait]
impl GeocodeProvider for MapboxGeocoder {
    fn tag(&self) -> ProviderTag {
        ProviderTag::Mapbox
    }

    async fn lookup(&self, address: &str) -> AppResult<Option<GeoResult>> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            features: Vec<Feature>,
        }

        #[derive(Deserialize)]
        struct Feature {
            center: [f64; 2],
        }

        let response = self
            .http
            .get(self.place_url(address)?)
            .query(&[
                ("access_token", self.token.expose_secret()),
                ("limit", "1"),
                ("country", COUNTRY_CODE),
            ])
            .send()
            .await?
            .error_for_status()?;

        let parsed: Response = response.json().await?;
        // center is [lon, lat]
        Ok(parsed.features.into_iter().next().map(|feature| GeoResult {
            lat: feature.center[1],
            lon: feature.center[0],
            provider: ProviderTag::Mapbox,
        }))
    }
}

pub struct NominatimGeocoder {
    http: Client,
    endpoint: Url,
}

impl NominatimGeocoder {
    pub fn new(endpoint: &str, user_agent: &str, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            http: http_client(timeout, Some(user_agent))?,
            endpoint: parse_endpoint(endpoint)?,
        })
    }
}

#[async_trait]
impl GeocodeProvider for NominatimGeocoder {
    fn tag(&self) -> ProviderTag {
        ProviderTag::Nominatim
    }

    fn throttled(&self) -> bool {
        true
    }

    async fn lookup(&self, address: &str) -> AppResult<Option<GeoResult>> {
        #[derive(Deserialize)]
        struct Place {
            lat: String,
            lon: String,
        }

        let response = self
            .http
            .get(self.endpoint.clone())
            .query(&[
                ("q", address),
                ("format", "jsonv2"),
                ("countrycodes", COUNTRY_CODE),
                ("addressdetails", "1"),
                ("limit", "1"),
            ])
            .send()
            .await?
            .error_for_status()?;

        let places: Vec<Place> = response.json().await?;
        let Some(first) = places.into_iter().next() else {
            return Ok(None);
        };
        let lat = first
            .lat
            .parse::<f64>()
            .map_err(|err| AppError::Parse(format!("nominatim lat {:?}: {err}", first.lat)))?;
        let lon = first
            .lon
            .parse::<f64>()
            .map_err(|err| AppError::Parse(format!("nominatim lon {:?}: {err}", first.lon)))?;
        Ok(Some(GeoResult {
            lat,
            lon,
            provider: ProviderTag::Nominatim,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use httptest::matchers::{all_of, contains, request, url_decoded};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};
    use serde_json::json;

    use super::*;

    struct CountingProvider {
        throttled: bool,
        calls: AtomicUsize,
        started: Mutex<Vec<Instant>>,
        response: Option<GeoResult>,
        fail: bool,
    }

    impl CountingProvider {
        fn new(throttled: bool) -> Self {
            Self {
                throttled,
                calls: AtomicUsize::new(0),
                started: Mutex::new(Vec::new()),
                response: Some(GeoResult {
                    lat: -33.45,
                    lon: -70.66,
                    provider: ProviderTag::Nominatim,
                }),
                fail: false,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GeocodeProvider for CountingProvider {
        fn tag(&self) -> ProviderTag {
            ProviderTag::Nominatim
        }

        fn throttled(&self) -> bool {
            self.throttled
        }

        async fn lookup(&self, _address: &str) -> AppResult<Option<GeoResult>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.lock().push(Instant::now());
            if self.fail {
                return Err(AppError::Upstream("provider down".into()));
            }
            Ok(self.response)
        }
    }

    #[tokio::test]
    async fn cache_hit_skips_provider_regardless_of_casing() {
        let provider = Arc::new(CountingProvider::new(false));
        let resolver = GeoResolver::with_provider(provider.clone(), 8, Duration::from_millis(0));

        let first = resolver.geocode("Fray Montalva 360, Las Condes").await;
        let second = resolver.geocode("  fray montalva 360,   LAS CONDES ").await;

        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(provider.calls(), 1);
        assert_eq!(resolver.cached_len(), 1);
    }

    #[tokio::test]
    async fn empty_address_never_reaches_provider() {
        let provider = Arc::new(CountingProvider::new(false));
        let resolver = GeoResolver::with_provider(provider.clone(), 8, Duration::from_millis(0));

        assert_eq!(resolver.geocode("   ").await, None);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn provider_failures_degrade_to_absent_and_are_not_cached() {
        let mut failing = CountingProvider::new(false);
        failing.fail = true;
        let provider = Arc::new(failing);
        let resolver = GeoResolver::with_provider(provider.clone(), 8, Duration::from_millis(0));

        assert_eq!(resolver.geocode("Macul").await, None);
        assert_eq!(resolver.geocode("Macul").await, None);
        assert_eq!(provider.calls(), 2);
        assert_eq!(resolver.cached_len(), 0);
    }

    #[tokio::test]
    async fn lru_bound_evicts_oldest_entry() {
        let provider = Arc::new(CountingProvider::new(false));
        let resolver = GeoResolver::with_provider(provider.clone(), 2, Duration::from_millis(0));

        resolver.geocode("a").await;
        resolver.geocode("b").await;
        resolver.geocode("c").await;
        assert_eq!(resolver.cached_len(), 2);

        resolver.geocode("a").await;
        assert_eq!(provider.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_calls_are_spaced_by_interval() {
        let provider = Arc::new(CountingProvider::new(true));
        let resolver = GeoResolver::with_provider(provider.clone(), 8, Duration::from_secs(1));

        resolver.geocode("Providencia").await;
        resolver.geocode("Vitacura").await;

        let started = provider.started.lock().clone();
        assert_eq!(started.len(), 2);
        assert!(started[1] - started[0] >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_throttled_callers_queue_in_slots() {
        let provider = Arc::new(CountingProvider::new(true));
        let resolver = Arc::new(GeoResolver::with_provider(
            provider.clone(),
            8,
            Duration::from_millis(200),
        ));

        let calls = ["La Reina", "Macul", "Peñalolén"].map(|address| {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.geocode(address).await })
        });
        for call in calls {
            assert!(call.await.unwrap().is_some());
        }

        let mut started = provider.started.lock().clone();
        started.sort();
        assert_eq!(started.len(), 3);
        for pair in started.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(200));
        }
    }

    #[test]
    fn selects_provider_by_static_priority() {
        let mut config = AppConfig::default();
        assert_eq!(
            GeoResolver::from_config(&config).unwrap().provider_tag(),
            ProviderTag::Nominatim
        );

        config.mapbox_token = Some(SecretString::from("token".to_string()));
        assert_eq!(
            GeoResolver::from_config(&config).unwrap().provider_tag(),
            ProviderTag::Mapbox
        );

        config.google_maps_api_key = Some(SecretString::from("key".to_string()));
        assert_eq!(
            GeoResolver::from_config(&config).unwrap().provider_tag(),
            ProviderTag::Google
        );
    }

    #[tokio::test]
    async fn google_provider_reads_first_result() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/geocode/json"),
                request::query(url_decoded(contains(("region", "cl")))),
                request::query(url_decoded(contains(("key", "g-key")))),
            ])
            .respond_with(json_encoded(json!({
                "status": "OK",
                "results": [{ "geometry": { "location": { "lat": -33.44, "lng": -70.61 } } }]
            }))),
        );

        let provider = GoogleGeocoder::new(
            &server.url("/geocode/json").to_string(),
            SecretString::from("g-key".to_string()),
            Duration::from_secs(10),
        )
        .unwrap();
        let result = provider.lookup("Providencia").await.unwrap().unwrap();
        assert_eq!(result.coordinates(), Coordinates { lat: -33.44, lon: -70.61 });
        assert_eq!(result.provider, ProviderTag::Google);
    }

    #[tokio::test]
    async fn google_zero_results_is_absent() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/geocode/json"))
                .respond_with(json_encoded(json!({ "status": "ZERO_RESULTS", "results": [] }))),
        );

        let provider = GoogleGeocoder::new(
            &server.url("/geocode/json").to_string(),
            SecretString::from("g-key".to_string()),
            Duration::from_secs(10),
        )
        .unwrap();
        assert_eq!(provider.lookup("nowhere").await.unwrap(), None);
    }

    #[tokio::test]
    async fn mapbox_center_is_lon_lat() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method("GET"),
                request::path("/geocoding/v5/mapbox.places/Las%20Condes.json"),
            ])
            .respond_with(json_encoded(json!({
                "features": [{ "center": [-70.55, -33.41] }]
            }))),
        );

        let provider = MapboxGeocoder::new(
            &server.url("/geocoding/v5/mapbox.places").to_string(),
            SecretString::from("m-token".to_string()),
            Duration::from_secs(10),
        )
        .unwrap();
        let result = provider.lookup("Las Condes").await.unwrap().unwrap();
        assert_eq!(result.lat, -33.41);
        assert_eq!(result.lon, -70.55);
        assert_eq!(result.provider, ProviderTag::Mapbox);
    }

    #[tokio::test]
    async fn nominatim_parses_string_coordinates() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/search"),
                request::query(url_decoded(contains(("q", "Ñuñoa")))),
            ])
            .respond_with(json_encoded(json!([{ "lat": "-33.4569", "lon": "-70.5975" }]))),
        );

        let provider = NominatimGeocoder::new(
            &server.url("/search").to_string(),
            "comparables-tests",
            Duration::from_secs(10),
        )
        .unwrap();
        assert!(provider.throttled());
        let result = provider.lookup("Ñuñoa").await.unwrap().unwrap();
        assert_eq!(result.lat, -33.4569);
        assert_eq!(result.lon, -70.5975);
    }

    #[tokio::test]
    async fn http_errors_resolve_to_absent() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/search"))
                .times(1)
                .respond_with(status_code(503)),
        );

        let provider = Arc::new(
            NominatimGeocoder::new(
                &server.url("/search").to_string(),
                "comparables-tests",
                Duration::from_secs(10),
            )
            .unwrap(),
        );
        let resolver = GeoResolver::with_provider(provider, 8, Duration::from_millis(0));
        assert_eq!(resolver.geocode("Santiago").await, None);
    }
}
