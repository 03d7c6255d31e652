use itertools::Itertools;

use crate::model::{Numeric, VehicleRecord};

pub const PLACEHOLDER_IMAGE: &str = "https://placehold.co/600x400?text=Car+Catalog";
pub const NOT_SPECIFIED: &str = "not specified";

fn group_digits(digits: &str) -> String {
    let chars: Vec<char> = digits.chars().collect();
    chars
        .rchunks(3)
        .rev()
        .map(|chunk| chunk.iter().collect::<String>())
        .join(" ")
}

/// Formats a number with space-grouped thousands and up to three decimals,
/// e.g. `15 000` or `1 234,5`.
pub fn format_number(value: Option<&Numeric>) -> String {
    let n = match value {
        None => return NOT_SPECIFIED.to_owned(),
        Some(Numeric::Text(text)) => return text.clone(),
        Some(Numeric::Number(n)) => n,
    };
    let f = match n.as_f64() {
        Some(f) if f.is_finite() => f,
        _ => return n.to_string(),
    };
    let rounded = format!("{:.3}", f.abs());
    let (int_part, frac_part) = match rounded.split_once('.') {
        Some((i, f)) => (i.to_owned(), f.trim_end_matches('0').to_owned()),
        None => (rounded.clone(), String::new()),
    };
    let sign = if f < 0.0 && (int_part != "0" || !frac_part.is_empty()) { "-" } else { "" };
    if frac_part.is_empty() {
        format!("{}{}", sign, group_digits(&int_part))
    } else {
        format!("{}{},{}", sign, group_digits(&int_part), frac_part)
    }
}

pub fn format_price(value: Option<&Numeric>) -> String {
    match value {
        Some(Numeric::Number(_)) => format!("{} €", format_number(value)),
        _ => format_number(value),
    }
}

pub fn cover_image(car: &VehicleRecord) -> &str {
    car.cover_image().unwrap_or(PLACEHOLDER_IMAGE)
}

/// One-line listing summary: title, price, year, mileage and drivetrain facts.
pub fn summary_line(car: &VehicleRecord) -> String {
    let text = |value: &Option<String>| value.clone().unwrap_or_else(|| NOT_SPECIFIED.to_owned());
    let year = match &car.year {
        Some(year) => format_number(Some(year)).replace(' ', ""),
        None => NOT_SPECIFIED.to_owned(),
    };
    [
        car.title.clone(),
        format_price(car.price.as_ref()),
        year,
        format!("{} km", format_number(car.mileage.as_ref())),
        text(&car.fuel),
        text(&car.transmission),
        text(&car.body),
    ]
    .iter()
    .join(" | ")
}
