//! Hysteresis switching

/// Where a measurement sits relative to `setpoint ± hysteresis`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Below,
    Within,
    Above,
}

/// Classify a measurement; the band edges count as within
pub fn band(measurement: f64, setpoint: f64, hysteresis: f64) -> Band {
    if measurement < setpoint - hysteresis {
        Band::Below
    } else if measurement > setpoint + hysteresis {
        Band::Above
    } else {
        Band::Within
    }
}

/// Desired on/off state of a raise (`raise == true`) or lower output
///
/// `None` inside the band: keep whatever the output is doing.
pub fn switch(band: Band, raise: bool) -> Option<bool> {
    match (band, raise) {
        (Band::Within, _) => None,
        (Band::Below, true) | (Band::Above, false) => Some(true),
        (Band::Above, true) | (Band::Below, false) => Some(false),
    }
}

/// Duty cycles of a PWM bang-bang loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PwmDuties {
    pub increase: f64,
    pub maintain: f64,
    pub decrease: f64,
}

impl PwmDuties {
    /// Duty for a band: `increase` while short of the setpoint, `decrease`
    /// once past it
    pub fn select(&self, band: Band, raise: bool) -> f64 {
        match (band, raise) {
            (Band::Within, _) => self.maintain,
            (Band::Below, true) | (Band::Above, false) => self.increase,
            (Band::Above, true) | (Band::Below, false) => self.decrease,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_switching() {
        assert_eq!(switch(band(47.0, 50.0, 2.0), true), Some(true));
        assert_eq!(switch(band(53.0, 50.0, 2.0), true), Some(false));
        assert_eq!(switch(band(50.0, 50.0, 2.0), true), None);
        assert_eq!(switch(band(48.0, 50.0, 2.0), true), None);
    }

    #[test]
    fn test_lower_mirrors_raise() {
        assert_eq!(switch(band(53.0, 50.0, 2.0), false), Some(true));
        assert_eq!(switch(band(47.0, 50.0, 2.0), false), Some(false));
    }

    #[test]
    fn test_pwm_selection() {
        let duties = PwmDuties {
            increase: 80.0,
            maintain: 40.0,
            decrease: 10.0,
        };
        assert_eq!(duties.select(Band::Below, true), 80.0);
        assert_eq!(duties.select(Band::Within, true), 40.0);
        assert_eq!(duties.select(Band::Above, true), 10.0);
        assert_eq!(duties.select(Band::Above, false), 80.0);
    }
}
