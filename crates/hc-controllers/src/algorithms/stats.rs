//! Statistics and psychrometrics for derived measurements

use hc_config::Statistic;

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut nums = values.to_vec();
    nums.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mid = nums.len() / 2;
    if nums.len() % 2 == 0 {
        Some((nums[mid - 1] + nums[mid]) / 2.0)
    } else {
        Some(nums[mid])
    }
}

/// Population standard deviation
pub fn standard_deviation(values: &[f64]) -> Option<f64> {
    let mean = mean(values)?;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}

/// One statistic of a non-empty sample
pub fn compute(statistic: Statistic, values: &[f64]) -> Option<f64> {
    match statistic {
        Statistic::Mean => mean(values),
        Statistic::Median => median(values),
        Statistic::Minimum => values.iter().copied().reduce(f64::min),
        Statistic::Maximum => values.iter().copied().reduce(f64::max),
        Statistic::StandardDeviation => standard_deviation(values),
    }
}

/// Saturation vapour pressure over water in kPa (Tetens)
pub fn saturation_vapor_pressure(temperature_c: f64) -> f64 {
    0.61078 * (17.27 * temperature_c / (temperature_c + 237.3)).exp()
}

/// Vapour-pressure deficit in kPa
///
/// Humidity outside 0-100 % is rejected.
pub fn vapor_pressure_deficit(temperature_c: f64, humidity_percent: f64) -> Option<f64> {
    if !(0.0..=100.0).contains(&humidity_percent) {
        return None;
    }
    Some(saturation_vapor_pressure(temperature_c) * (1.0 - humidity_percent / 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistics() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(compute(Statistic::Mean, &values), Some(5.0));
        assert_eq!(compute(Statistic::Median, &values), Some(4.5));
        assert_eq!(compute(Statistic::Minimum, &values), Some(2.0));
        assert_eq!(compute(Statistic::Maximum, &values), Some(9.0));
        assert_eq!(compute(Statistic::StandardDeviation, &values), Some(2.0));
        assert_eq!(compute(Statistic::Mean, &[]), None);
    }

    #[test]
    fn test_vpd() {
        // 25 C saturates at ~3.17 kPa
        let vpd = vapor_pressure_deficit(25.0, 50.0).unwrap();
        assert!((vpd - 1.584).abs() < 0.01, "{}", vpd);
        assert_eq!(vapor_pressure_deficit(25.0, 100.0), Some(0.0));
        assert_eq!(vapor_pressure_deficit(25.0, 120.0), None);
    }
}
