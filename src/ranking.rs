use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::config::AppConfig;
use crate::geo::{cache_key, Coordinates, Geocoder};
use crate::normalize::{normalize_value, NormalizedProperty, PropertyId};

pub const MAX_RECOMMENDATIONS: usize = 3;
pub const EARTH_RADIUS_KM: f64 = 6371.0088;

/// What to do when the base property has no recognisable comuna.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingComunaPolicy {
    /// Return `no_matches` without looking at the catalog.
    FailClosed,
    /// Skip the comuna tiers and go straight to the global tier.
    GlobalFallback,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub missing_comuna: MissingComunaPolicy,
    pub global_pool_size: usize,
}

impl EngineOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            missing_comuna: if config.global_fallback_on_missing_comuna {
                MissingComunaPolicy::GlobalFallback
            } else {
                MissingComunaPolicy::FailClosed
            },
            global_pool_size: config.global_pool_size.max(1),
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            missing_comuna: MissingComunaPolicy::FailClosed,
            global_pool_size: 20,
        }
    }
}

/// One rung of the fallback ladder, from most to least constrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Strict,
    ComunaBedrooms,
    ComunaOnly,
    Global,
}

pub const TIER_LADDER: [Tier; 4] = [
    Tier::Strict,
    Tier::ComunaBedrooms,
    Tier::ComunaOnly,
    Tier::Global,
];

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Strict => "strict",
            Tier::ComunaBedrooms => "comuna_bedrooms",
            Tier::ComunaOnly => "comuna_only",
            Tier::Global => "global",
        }
    }

    pub fn admits(&self, base: &NormalizedProperty, candidate: &NormalizedProperty) -> bool {
        match self {
            Tier::Strict => strict_rejection(base, candidate).is_none(),
            Tier::ComunaBedrooms => {
                same_comuna(base, candidate) && same_bedrooms(base, candidate)
            }
            Tier::ComunaOnly => same_comuna(base, candidate),
            Tier::Global => true,
        }
    }

    fn build_pool<'a>(
        &self,
        base: &NormalizedProperty,
        candidates: &'a [NormalizedProperty],
        options: &EngineOptions,
    ) -> Vec<&'a NormalizedProperty> {
        let mut pool: Vec<_> = candidates
            .iter()
            .filter(|candidate| self.admits(base, candidate))
            .collect();
        if *self == Tier::Global {
            pool.sort_by(|a, b| price_key(a).total_cmp(&price_key(b)));
            pool.truncate(options.global_pool_size);
        }
        pool
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    SameId,
    NoComuna,
    DifferentComuna,
    DifferentBedrooms,
    PriceTooHigh,
}

fn strict_rejection(
    base: &NormalizedProperty,
    candidate: &NormalizedProperty,
) -> Option<Rejection> {
    if let (Some(base_id), Some(candidate_id)) = (&base.id, &candidate.id) {
        if base_id == candidate_id {
            return Some(Rejection::SameId);
        }
    }
    if candidate.comuna.is_none() {
        return Some(Rejection::NoComuna);
    }
    if !same_comuna(base, candidate) {
        return Some(Rejection::DifferentComuna);
    }
    if !same_bedrooms(base, candidate) {
        return Some(Rejection::DifferentBedrooms);
    }
    if let Some(limit) = base.price {
        if !candidate.price.is_some_and(|price| price <= limit) {
            return Some(Rejection::PriceTooHigh);
        }
    }
    None
}

fn same_comuna(base: &NormalizedProperty, candidate: &NormalizedProperty) -> bool {
    match (&base.comuna, &candidate.comuna) {
        (Some(base), Some(candidate)) => base == candidate,
        _ => false,
    }
}

fn same_bedrooms(base: &NormalizedProperty, candidate: &NormalizedProperty) -> bool {
    base.bedrooms
        .map_or(true, |bedrooms| candidate.bedrooms == Some(bedrooms))
}

fn price_key(property: &NormalizedProperty) -> f64 {
    property.price.unwrap_or(f64::INFINITY)
}

#[derive(Debug, Default)]
struct FilterStats {
    total: usize,
    skipped: usize,
    same_id: usize,
    no_comuna: usize,
    different_comuna: usize,
    different_bedrooms: usize,
    price_too_high: usize,
    passed: usize,
}

impl FilterStats {
    fn observe(&mut self, rejection: Option<Rejection>) {
        match rejection {
            None => self.passed += 1,
            Some(Rejection::SameId) => self.same_id += 1,
            Some(Rejection::NoComuna) => self.no_comuna += 1,
            Some(Rejection::DifferentComuna) => self.different_comuna += 1,
            Some(Rejection::DifferentBedrooms) => self.different_bedrooms += 1,
            Some(Rejection::PriceTooHigh) => self.price_too_high += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationMessage {
    Ok,
    NoMatches,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationEntry {
    pub id: Option<PropertyId>,
    pub title: Option<String>,
    pub price: Option<f64>,
    pub comuna: Option<String>,
    pub bedrooms: Option<u32>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub distance_km: Option<f64>,
    pub url: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub message: RecommendationMessage,
    pub recommendations: Vec<RecommendationEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
}

impl Recommendation {
    pub fn no_matches() -> Self {
        Self {
            message: RecommendationMessage::NoMatches,
            recommendations: Vec::new(),
            tier: None,
        }
    }

    fn from_entries(mut entries: Vec<RecommendationEntry>, tier: Tier) -> Self {
        entries.truncate(MAX_RECOMMENDATIONS);
        if entries.is_empty() {
            return Self::no_matches();
        }
        Self {
            message: RecommendationMessage::Ok,
            recommendations: entries,
            tier: Some(tier),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.recommendations.is_empty()
    }
}

/// Great-circle distance in kilometres.
pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let d_phi = (b.lat - a.lat).to_radians();
    let d_lambda = (b.lon - a.lon).to_radians();
    let h = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

struct Scored<'a> {
    property: &'a NormalizedProperty,
    coordinates: Option<Coordinates>,
    distance_km: Option<f64>,
}

impl Scored<'_> {
    fn into_entry(self) -> RecommendationEntry {
        let raw = &self.property.raw;
        RecommendationEntry {
            id: self.property.id.clone(),
            title: raw.title(),
            price: self.property.price,
            comuna: self.property.comuna.clone(),
            bedrooms: self.property.bedrooms,
            lat: self.coordinates.map(|c| c.lat),
            lon: self.coordinates.map(|c| c.lon),
            distance_km: self.distance_km,
            url: raw.url(),
            image: raw.image(),
        }
    }
}

/// Stateless ranking over a catalog snapshot. The only shared state it touches
/// lives behind the geocoder handle.
#[derive(Clone)]
pub struct RecommendationEngine {
    geocoder: Arc<dyn Geocoder>,
    options: EngineOptions,
}

impl RecommendationEngine {
    pub fn new(geocoder: Arc<dyn Geocoder>, options: EngineOptions) -> Self {
        Self { geocoder, options }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Ranks raw catalog records against `base`. Records that are not objects
    /// are skipped; the rest are normalized before filtering.
    pub async fn rank(&self, base: &NormalizedProperty, catalog: Vec<Value>) -> Recommendation {
        let total = catalog.len();
        let candidates: Vec<NormalizedProperty> = catalog
            .into_iter()
            .enumerate()
            .filter_map(|(index, value)| match normalize_value(value) {
                Ok(candidate) => Some(candidate),
                Err(err) => {
                    warn!(?err, index, "skipping malformed catalog record");
                    None
                }
            })
            .collect();
        let skipped = total - candidates.len();
        self.rank_normalized(base, &candidates, skipped).await
    }

    pub async fn rank_normalized(
        &self,
        base: &NormalizedProperty,
        candidates: &[NormalizedProperty],
        skipped: usize,
    ) -> Recommendation {
        if base.comuna.is_none() && self.options.missing_comuna == MissingComunaPolicy::FailClosed {
            info!("base property has no recognisable comuna; returning no matches");
            return Recommendation::no_matches();
        }

        let mut stats = FilterStats {
            total: candidates.len() + skipped,
            skipped,
            ..FilterStats::default()
        };
        if base.comuna.is_some() {
            for candidate in candidates {
                let rejection = strict_rejection(base, candidate);
                trace!(candidate = ?candidate.id, ?rejection, "strict filter");
                stats.observe(rejection);
            }
        }
        debug!(
            comuna = ?base.comuna,
            bedrooms = ?base.bedrooms,
            price = ?base.price,
            coordinates = ?base.coordinates,
            ?stats,
            "filtered catalog"
        );

        let Some((tier, pool)) = TIER_LADDER.iter().find_map(|tier| {
            let pool = tier.build_pool(base, candidates, &self.options);
            (!pool.is_empty()).then_some((*tier, pool))
        }) else {
            info!(total = stats.total, "no tier produced candidates");
            return Recommendation::no_matches();
        };

        info!(tier = tier.as_str(), pool = pool.len(), "candidate pool selected");
        let ranked = self.order_pool(base, pool).await;
        Recommendation::from_entries(ranked.into_iter().map(Scored::into_entry).collect(), tier)
    }

    async fn order_pool<'a>(
        &self,
        base: &NormalizedProperty,
        pool: Vec<&'a NormalizedProperty>,
    ) -> Vec<Scored<'a>> {
        let base_coordinates = match base.coordinates {
            Some(coordinates) if pool.len() > MAX_RECOMMENDATIONS => coordinates,
            _ => return by_price(pool),
        };

        // Candidates sharing a location text resolve through a single lookup.
        let mut pending: HashMap<String, String> = HashMap::new();
        for candidate in pool.iter().filter(|candidate| candidate.coordinates.is_none()) {
            if let Some(text) = candidate.location_text() {
                pending.entry(cache_key(&text)).or_insert(text);
            }
        }
        let lookups = pending.into_iter().map(|(key, text)| async move {
            let found = self
                .geocoder
                .geocode(&text)
                .await
                .map(|result| result.coordinates());
            (key, found)
        });
        let geocoded: HashMap<String, Option<Coordinates>> =
            join_all(lookups).await.into_iter().collect();
        let resolved = pool.iter().map(|candidate| {
            candidate.coordinates.or_else(|| {
                let text = candidate.location_text()?;
                geocoded.get(&cache_key(&text)).copied().flatten()
            })
        });

        let mut located: Vec<Scored<'a>> = pool
            .iter()
            .zip(resolved)
            .filter_map(|(candidate, coordinates)| {
                let coordinates = coordinates?;
                let distance = haversine_km(base_coordinates, coordinates);
                distance.is_finite().then_some(Scored {
                    property: *candidate,
                    coordinates: Some(coordinates),
                    distance_km: Some(distance),
                })
            })
            .collect();

        if located.is_empty() {
            debug!("no candidate could be located; ordering by price");
            return by_price(pool);
        }

        located.sort_by(|a, b| {
            let by_distance = a
                .distance_km
                .unwrap_or(f64::INFINITY)
                .total_cmp(&b.distance_km.unwrap_or(f64::INFINITY));
            match by_distance {
                Ordering::Equal => price_key(a.property).total_cmp(&price_key(b.property)),
                other => other,
            }
        });
        located.truncate(MAX_RECOMMENDATIONS);
        located
    }
}

fn by_price(mut pool: Vec<&NormalizedProperty>) -> Vec<Scored<'_>> {
    pool.sort_by(|a, b| price_key(a).total_cmp(&price_key(b)));
    pool.into_iter()
        .take(MAX_RECOMMENDATIONS)
        .map(|property| Scored {
            property,
            coordinates: property.coordinates,
            distance_km: None,
        })
        .collect()
}
