use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{AppError, AppResult};
use crate::geo::Coordinates;
use crate::regions::resolve_region;

/// Keys that only appear in requester submissions (and the job payload built from them).
const SUBMISSION_KEYS: &[&str] = &["comuna", "dormitorios", "precio", "titulo", "property_id"];

/// Catalog listing as served by the internal properties API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Listing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bedrooms: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub img: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Property submitted by a requester, using the Spanish field names of the public API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Submission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub titulo: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comuna: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direccion: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dormitorios: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precio: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub img: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The upstream record shapes the pipeline knows how to canonicalize.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RawProperty {
    Listing(Listing),
    Submission(Submission),
}

impl RawProperty {
    pub fn from_value(value: Value) -> AppResult<Self> {
        let Value::Object(map) = value else {
            return Err(AppError::Parse(format!(
                "property record must be an object, got {}",
                kind_of(&value)
            )));
        };

        let is_submission = SUBMISSION_KEYS.iter().any(|key| map.contains_key(*key));
        let value = Value::Object(map);
        if is_submission {
            Ok(Self::Submission(serde_json::from_value(value)?))
        } else {
            Ok(Self::Listing(serde_json::from_value(value)?))
        }
    }

    fn id(&self) -> Option<&Value> {
        match self {
            Self::Listing(listing) => listing.id.as_ref(),
            Self::Submission(sub) => sub.property_id.as_ref().or(sub.id.as_ref()),
        }
    }

    fn bedrooms(&self) -> Option<&Value> {
        match self {
            Self::Listing(listing) => listing.bedrooms.as_ref(),
            Self::Submission(sub) => sub.dormitorios.as_ref(),
        }
    }

    fn price(&self) -> Option<&Value> {
        match self {
            Self::Listing(listing) => listing.price.as_ref(),
            Self::Submission(sub) => sub.precio.as_ref().or(sub.price.as_ref()),
        }
    }

    fn lat_lon(&self) -> (Option<&Value>, Option<&Value>) {
        match self {
            Self::Listing(listing) => (listing.lat.as_ref(), listing.lon.as_ref()),
            Self::Submission(sub) => (sub.lat.as_ref(), sub.lon.as_ref()),
        }
    }

    /// Explicit location, display name and address, in that priority order.
    fn location_fields(&self) -> [Option<&Value>; 3] {
        match self {
            Self::Listing(listing) => [
                listing.location.as_ref(),
                listing.name.as_ref(),
                listing.address.as_ref(),
            ],
            Self::Submission(sub) => [
                sub.comuna.as_ref(),
                sub.titulo.as_ref(),
                sub.direccion.as_ref(),
            ],
        }
    }

    pub fn title(&self) -> Option<String> {
        match self {
            Self::Listing(listing) => listing.name.as_ref().and_then(value_text),
            Self::Submission(sub) => sub.titulo.as_ref().and_then(value_text),
        }
    }

    pub fn url(&self) -> Option<String> {
        match self {
            Self::Listing(listing) => listing.url.as_ref().and_then(value_text),
            Self::Submission(sub) => sub.url.as_ref().and_then(value_text),
        }
    }

    pub fn image(&self) -> Option<String> {
        match self {
            Self::Listing(listing) => listing
                .img
                .as_ref()
                .or(listing.image.as_ref())
                .and_then(value_text),
            Self::Submission(sub) => sub.img.as_ref().and_then(value_text),
        }
    }

    pub fn extra(&self) -> &Map<String, Value> {
        match self {
            Self::Listing(listing) => &listing.extra,
            Self::Submission(sub) => &sub.extra,
        }
    }
}

/// Opaque identifier, compared by its textual form so `7` and `"7"` are the same property.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyId(String);

impl PropertyId {
    pub fn from_value(value: &Value) -> Option<Self> {
        value_text(value).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical property. Every field is either a typed value or absent; absent
/// bedrooms is not the same as zero bedrooms.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedProperty {
    pub id: Option<PropertyId>,
    pub comuna: Option<String>,
    pub bedrooms: Option<u32>,
    pub price: Option<f64>,
    pub coordinates: Option<Coordinates>,
    #[serde(skip)]
    pub raw: Arc<RawProperty>,
}

impl NormalizedProperty {
    pub fn location_text(&self) -> Option<String> {
        resolve_location_text(&self.raw)
    }

    pub fn with_coordinates(mut self, coordinates: Coordinates) -> Self {
        self.coordinates = Some(coordinates);
        self
    }
}

pub fn normalize(raw: RawProperty) -> NormalizedProperty {
    let id = raw.id().and_then(PropertyId::from_value);
    let comuna = resolve_location_text(&raw).and_then(|text| resolve_comuna(&text));
    let bedrooms = raw.bedrooms().and_then(parse_bedrooms);
    let price = raw.price().and_then(parse_price);
    let (lat, lon) = raw.lat_lon();
    let coordinates = match (lat.and_then(parse_latitude), lon.and_then(parse_longitude)) {
        (Some(lat), Some(lon)) => Some(Coordinates { lat, lon }),
        _ => None,
    };

    NormalizedProperty {
        id,
        comuna,
        bedrooms,
        price,
        coordinates,
        raw: Arc::new(raw),
    }
}

pub fn normalize_value(value: Value) -> AppResult<NormalizedProperty> {
    RawProperty::from_value(value).map(normalize)
}

/// First contiguous run of ASCII digits in the textual form of `raw`.
pub fn parse_bedrooms(raw: &Value) -> Option<u32> {
    let text = match raw {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        _ => return None,
    };
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

pub fn parse_price(raw: &Value) -> Option<f64> {
    let value = match raw {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    value.filter(|v| v.is_finite())
}

fn parse_latitude(raw: &Value) -> Option<f64> {
    parse_price(raw).filter(|lat| (-90.0..=90.0).contains(lat))
}

fn parse_longitude(raw: &Value) -> Option<f64> {
    parse_price(raw).filter(|lon| (-180.0..=180.0).contains(lon))
}

pub fn resolve_location_text(record: &RawProperty) -> Option<String> {
    record
        .location_fields()
        .into_iter()
        .flatten()
        .find_map(value_text)
}

pub fn resolve_comuna(text: &str) -> Option<String> {
    resolve_region(text).map(str::to_string)
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
