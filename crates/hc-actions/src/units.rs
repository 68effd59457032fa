//! Unit conversion table
//!
//! Units in one family convert linearly through a base unit:
//! `base = value * scale + offset`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Temperature,
    Fraction,
    Pressure,
    Length,
    Volume,
    Time,
}

/// `(family, scale, offset)` of a unit name
fn lookup(unit: &str) -> Option<(Family, f64, f64)> {
    let unit = unit.trim().to_ascii_lowercase();
    let entry = match unit.as_str() {
        "k" | "kelvin" => (Family::Temperature, 1.0, 0.0),
        "c" | "°c" | "celsius" => (Family::Temperature, 1.0, 273.15),
        "f" | "°f" | "fahrenheit" => (Family::Temperature, 5.0 / 9.0, 459.67 * 5.0 / 9.0),

        "decimal" | "fraction" => (Family::Fraction, 1.0, 0.0),
        "percent" | "%" => (Family::Fraction, 0.01, 0.0),
        "ppm" => (Family::Fraction, 1e-6, 0.0),

        "pa" => (Family::Pressure, 1.0, 0.0),
        "hpa" | "mbar" => (Family::Pressure, 100.0, 0.0),
        "kpa" => (Family::Pressure, 1000.0, 0.0),
        "bar" => (Family::Pressure, 100_000.0, 0.0),
        "psi" => (Family::Pressure, 6894.757, 0.0),

        "m" => (Family::Length, 1.0, 0.0),
        "cm" => (Family::Length, 0.01, 0.0),
        "mm" => (Family::Length, 0.001, 0.0),
        "ft" => (Family::Length, 0.3048, 0.0),
        "in" => (Family::Length, 0.0254, 0.0),

        "l" => (Family::Volume, 1.0, 0.0),
        "ml" => (Family::Volume, 0.001, 0.0),
        "gal" => (Family::Volume, 3.785_411_784, 0.0),

        "s" => (Family::Time, 1.0, 0.0),
        "min" => (Family::Time, 60.0, 0.0),
        "h" => (Family::Time, 3600.0, 0.0),
        _ => return None,
    };
    Some(entry)
}

/// Convert `value` from one unit to another in the same family
pub fn convert(value: f64, from: &str, to: &str) -> Option<f64> {
    let (from_family, from_scale, from_offset) = lookup(from)?;
    let (to_family, to_scale, to_offset) = lookup(to)?;
    if from_family != to_family {
        return None;
    }
    let base = value * from_scale + from_offset;
    Some((base - to_offset) / to_scale)
}
