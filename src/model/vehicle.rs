use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// A record as it arrives from an untrusted source, before normalization.
pub type RawRecord = Map<String, Value>;

/// A numeric attribute. Inputs that could not be coerced to a number keep
/// their original text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Numeric {
    Number(Number),
    Text(String),
}

impl Numeric {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Numeric::Number(n) => n.as_f64(),
            Numeric::Text(_) => None,
        }
    }
}

impl From<i64> for Numeric {
    fn from(n: i64) -> Self {
        Numeric::Number(n.into())
    }
}

// Catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleRecord {
    pub id: String,
    pub slug: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Numeric>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<Numeric>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mileage: Option<Numeric>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transmission: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drivetrain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wheel_diameter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<Numeric>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
    /// Remote URLs or `data:` images, cover first.
    #[serde(default)]
    pub gallery: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identification_code: Option<String>,
    /// Fields this version does not know about, kept as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VehicleRecord {
    /// The record's JSON object form, used when merging partial updates.
    pub fn to_raw(&self) -> RawRecord {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    pub fn cover_image(&self) -> Option<&str> {
        self.gallery.first().map(String::as_str)
    }
}
