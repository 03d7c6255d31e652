use std::cmp::Ordering;
use std::str::FromStr;

use crate::model::{Numeric, VehicleRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Order the cars were listed in.
    Listing,
    PriceAsc,
    PriceDesc,
    YearDesc,
    MileageAsc,
}

impl Default for SortOrder {
    fn default() -> Self {
        SortOrder::Listing
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "listing" => Ok(SortOrder::Listing),
            "price" | "price-asc" => Ok(SortOrder::PriceAsc),
            "price-desc" => Ok(SortOrder::PriceDesc),
            "year" | "newest" => Ok(SortOrder::YearDesc),
            "mileage" => Ok(SortOrder::MileageAsc),
            other => Err(format!(
                "unknown sort order {:?}, expected listing, price, price-desc, newest or mileage",
                other
            )),
        }
    }
}

/// Filters for browsing the catalog. Unset fields match everything; a range
/// filter excludes cars that have no numeric value for that field.
#[derive(Debug, Clone, Default)]
pub struct CatalogQuery {
    pub text: Option<String>,
    pub fuel: Option<String>,
    pub transmission: Option<String>,
    pub body: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub min_year: Option<f64>,
    pub max_year: Option<f64>,
    pub max_mileage: Option<f64>,
    pub sort: SortOrder,
    pub limit: Option<usize>,
}

fn same_text(wanted: &Option<String>, actual: &Option<String>) -> bool {
    match wanted {
        None => true,
        Some(wanted) => actual
            .as_deref()
            .map_or(false, |actual| actual.trim().to_lowercase() == wanted.trim().to_lowercase()),
    }
}

fn in_range(value: &Option<Numeric>, min: Option<f64>, max: Option<f64>) -> bool {
    if min.is_none() && max.is_none() {
        return true;
    }
    match value.as_ref().and_then(Numeric::as_f64) {
        None => false,
        Some(v) => min.map_or(true, |min| v >= min) && max.map_or(true, |max| v <= max),
    }
}

fn contains_text(car: &VehicleRecord, needle: &str) -> bool {
    let needle = needle.to_lowercase();
    let found = |s: &str| s.to_lowercase().contains(&needle);
    found(car.title.as_str())
        || car.description.as_deref().map_or(false, found)
        || car.features.iter().any(|f| found(f.as_str()))
}

/// Missing values sort after present ones regardless of direction.
fn compare_numeric(a: &Option<Numeric>, b: &Option<Numeric>, descending: bool) -> Ordering {
    let a = a.as_ref().and_then(Numeric::as_f64);
    let b = b.as_ref().and_then(Numeric::as_f64);
    match (a, b) {
        (Some(a), Some(b)) => {
            let ord = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
            if descending {
                ord.reverse()
            } else {
                ord
            }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

impl CatalogQuery {
    pub fn matches(&self, car: &VehicleRecord) -> bool {
        let text = match self.text.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => contains_text(car, t),
            _ => true,
        };
        text && same_text(&self.fuel, &car.fuel)
            && same_text(&self.transmission, &car.transmission)
            && same_text(&self.body, &car.body)
            && in_range(&car.price, self.min_price, self.max_price)
            && in_range(&car.year, self.min_year, self.max_year)
            && in_range(&car.mileage, None, self.max_mileage)
    }

    pub fn apply(&self, cars: &[VehicleRecord]) -> Vec<VehicleRecord> {
        let mut found: Vec<VehicleRecord> =
            cars.iter().filter(|car| self.matches(car)).cloned().collect();
        match self.sort {
            SortOrder::Listing => {}
            SortOrder::PriceAsc => found.sort_by(|a, b| compare_numeric(&a.price, &b.price, false)),
            SortOrder::PriceDesc => found.sort_by(|a, b| compare_numeric(&a.price, &b.price, true)),
            SortOrder::YearDesc => found.sort_by(|a, b| compare_numeric(&a.year, &b.year, true)),
            SortOrder::MileageAsc => {
                found.sort_by(|a, b| compare_numeric(&a.mileage, &b.mileage, false))
            }
        }
        if let Some(limit) = self.limit {
            found.truncate(limit);
        }
        found
    }
}
