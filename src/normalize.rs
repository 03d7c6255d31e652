//! Validation and migration applied wherever catalog data crosses a trust
//! boundary: bundled defaults, local storage, the remote mirror and imports.

use std::collections::HashSet;

use itertools::Itertools;
use serde_json::{Number, Value};
use thiserror::Error;

use crate::model::vehicle::{Numeric, RawRecord, VehicleRecord};

/// Extra letters allowed in slugs besides `a-z` and `0-9`.
const SLUG_LETTERS: &str = "ąčęėįšųūž";
const SLUG_SENTINELS: [&str; 2] = ["undefined", "null"];
const LEGACY_CODE_FIELDS: [&str; 2] = ["sdk", "vin"];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ShapeError {
    #[error("payload is not valid JSON: {0}")]
    Json(String),
    #[error("expected an array of cars or an object with a `cars` array, found {0}")]
    NotACollection(&'static str),
    #[error("entry {index} is {found}, expected an object")]
    EntryNotObject { index: usize, found: &'static str },
}

pub(crate) fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Accepts a bare array of records or an object carrying a `cars` array.
pub fn parse_collection(value: Value) -> Result<Vec<RawRecord>, ShapeError> {
    let entries = match value {
        Value::Array(entries) => entries,
        Value::Object(mut map) => match map.remove("cars") {
            Some(Value::Array(entries)) => entries,
            Some(other) => return Err(ShapeError::NotACollection(kind_of(&other))),
            None => return Err(ShapeError::NotACollection("an object without `cars`")),
        },
        other => return Err(ShapeError::NotACollection(kind_of(&other))),
    };
    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| match entry {
            Value::Object(map) => Ok(map),
            other => Err(ShapeError::EntryNotObject {
                index,
                found: kind_of(&other),
            }),
        })
        .collect()
}

pub fn parse_collection_str(payload: &str) -> Result<Vec<RawRecord>, ShapeError> {
    let value = serde_json::from_str(payload).map_err(|e| ShapeError::Json(e.to_string()))?;
    parse_collection(value)
}

fn is_slug_char(c: char) -> bool {
    c.is_ascii_lowercase()
        || c.is_ascii_digit()
        || c.is_whitespace()
        || c == '-'
        || SLUG_LETTERS.contains(c)
}

/// Folds text into a URL-safe slug: lowercase, whitelist-filtered,
/// whitespace runs joined by single hyphens.
pub fn slugify(text: &str) -> String {
    let folded: String = text.to_lowercase().chars().filter(|c| is_slug_char(*c)).collect();
    folded.split_whitespace().join("-")
}

pub(crate) fn timestamp_slug() -> String {
    format!("auto-{}", chrono::Utc::now().timestamp_millis())
}

fn ensure_unique_slug(base: String, assigned: &mut HashSet<String>) -> String {
    let base = if base.is_empty() { timestamp_slug() } else { base };
    let mut candidate = base.clone();
    let mut counter = 1;
    while assigned.contains(&candidate) {
        candidate = format!("{}-{}", base, counter);
        counter += 1;
    }
    assigned.insert(candidate.clone());
    candidate
}

/// Strings and numbers both read as text; blanks and everything else as absent.
pub(crate) fn text_value(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn take_text(raw: &mut RawRecord, key: &str) -> Option<String> {
    text_value(raw.remove(key).as_ref())
}

/// Entries are kept as text; only `null` entries are dropped.
fn string_list(value: Option<Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Null => None,
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                other => Some(other.to_string()),
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Parses the digits out of a formatted string such as `"15 000 €"`.
pub fn coerce_number(text: &str) -> Option<Number> {
    let digits: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if digits.is_empty() {
        return None;
    }
    if let Ok(n) = digits.parse::<i64>() {
        return Some(n.into());
    }
    digits.parse::<f64>().ok().and_then(Number::from_f64)
}

fn take_numeric(raw: &mut RawRecord, key: &str, coerce: bool) -> Option<Numeric> {
    match raw.remove(key) {
        Some(Value::Number(n)) => Some(Numeric::Number(n)),
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) if coerce => Some(match coerce_number(&s) {
            Some(n) => Numeric::Number(n),
            None => Numeric::Text(s),
        }),
        Some(Value::String(s)) => Some(Numeric::Text(s)),
        _ => None,
    }
}

/// A usable explicit slug, folded. Blank and sentinel values count as absent.
pub(crate) fn explicit_slug(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => {
            Some(slugify(s)).filter(|slug| !slug.is_empty() && !SLUG_SENTINELS.contains(&slug.as_str()))
        }
        _ => None,
    }
}

fn slug_candidate(raw: &RawRecord, title: &str) -> String {
    let derived = [
        Some(title.to_owned()),
        text_value(raw.get("name")),
        text_value(raw.get("id")),
    ];
    explicit_slug(raw.get("slug"))
        .into_iter()
        .chain(derived.iter().flatten().map(|source| slugify(source)))
        .find(|slug| !slug.is_empty())
        .unwrap_or_else(timestamp_slug)
}

/// Normalizes one record. `assigned` holds the slugs already handed out in
/// the current pass and receives this record's slug.
pub fn normalize_record(mut raw: RawRecord, assigned: &mut HashSet<String>) -> VehicleRecord {
    let title = take_text(&mut raw, "title")
        .or_else(|| text_value(raw.get("name")))
        .unwrap_or_default();

    let slug = ensure_unique_slug(slug_candidate(&raw, &title), assigned);
    raw.remove("slug");
    let id = take_text(&mut raw, "id").unwrap_or_else(|| slug.clone());

    let mut identification_code = take_text(&mut raw, "identificationCode");
    for alias in LEGACY_CODE_FIELDS.iter() {
        let legacy = take_text(&mut raw, alias);
        if identification_code.is_none() {
            identification_code = legacy;
        }
    }

    VehicleRecord {
        id,
        slug,
        title,
        price: take_numeric(&mut raw, "price", true),
        year: take_numeric(&mut raw, "year", true),
        mileage: take_numeric(&mut raw, "mileage", true),
        fuel: take_text(&mut raw, "fuel"),
        transmission: take_text(&mut raw, "transmission"),
        drivetrain: take_text(&mut raw, "drivetrain"),
        wheel_diameter: take_text(&mut raw, "wheelDiameter"),
        power: take_numeric(&mut raw, "power", false),
        body: take_text(&mut raw, "body"),
        color: take_text(&mut raw, "color"),
        description: take_text(&mut raw, "description"),
        features: string_list(raw.remove("features")),
        gallery: string_list(raw.remove("gallery")),
        identification_code,
        extra: raw,
    }
}

pub fn normalize_collection(records: Vec<RawRecord>) -> Vec<VehicleRecord> {
    let mut assigned = HashSet::new();
    records
        .into_iter()
        .map(|raw| normalize_record(raw, &mut assigned))
        .collect()
}

/// Runs already-typed records through normalization again, e.g. after a merge.
pub fn renormalize(records: &[VehicleRecord]) -> Vec<VehicleRecord> {
    normalize_collection(records.iter().map(VehicleRecord::to_raw).collect())
}

pub fn to_values(records: &[VehicleRecord]) -> Vec<Value> {
    records.iter().map(|r| Value::Object(r.to_raw())).collect()
}

pub(crate) fn raw_from_json(value: Value) -> Option<RawRecord> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}
