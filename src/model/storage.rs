use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::vehicle::{RawRecord, VehicleRecord};
use crate::normalize::{self, ShapeError};

/// Schema tag written into the local envelope. Payloads under any other tag
/// are ignored on read.
pub const SCHEMA_VERSION: &str = "2";

// Storage model
#[derive(Debug, Serialize, Deserialize)]
pub struct StoredCatalog {
    pub version: String,
    pub cars: Vec<VehicleRecord>,
}

/// What was found under the catalog key.
#[derive(Debug, PartialEq)]
pub enum StoredPayload {
    /// Bare array, written before the envelope existed.
    Legacy(Vec<RawRecord>),
    Current(Vec<RawRecord>),
    Unrecognized(Option<String>),
}

impl StoredPayload {
    pub fn decode(payload: &str) -> Result<StoredPayload, ShapeError> {
        let value: Value =
            serde_json::from_str(payload).map_err(|e| ShapeError::Json(e.to_string()))?;
        if value.is_array() {
            return Ok(StoredPayload::Legacy(normalize::parse_collection(value)?));
        }
        if !value.is_object() {
            return Err(ShapeError::NotACollection(normalize::kind_of(&value)));
        }
        let version = match value.get("version") {
            Some(Value::String(v)) => Some(v.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        match version {
            Some(ref v) if v == SCHEMA_VERSION => {
                Ok(StoredPayload::Current(normalize::parse_collection(value)?))
            }
            other => Ok(StoredPayload::Unrecognized(other)),
        }
    }
}

pub fn encode(cars: &[VehicleRecord]) -> serde_json::Result<String> {
    let envelope = StoredCatalog {
        version: SCHEMA_VERSION.to_owned(),
        cars: cars.to_vec(),
    };
    serde_json::to_string(&envelope)
}
