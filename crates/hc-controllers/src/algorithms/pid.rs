//! Positional PID with a clamped integrator

use hc_config::PidOptions;
use hc_core::PidSetting;
use serde::Serialize;

/// Contribution of each term to one update
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PidTerms {
    pub error: f64,
    pub p: f64,
    pub i: f64,
    pub d: f64,
    pub control: f64,
}

/// Gains, limits and memory of one PID loop
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PidState {
    pub setpoint: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub integrator_min: f64,
    pub integrator_max: f64,
    pub integrator: f64,
    pub last_error: Option<f64>,
}

impl PidState {
    pub fn new(setpoint: f64, kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            setpoint,
            kp,
            ki,
            kd,
            integrator_min: f64::NEG_INFINITY,
            integrator_max: f64::INFINITY,
            integrator: 0.0,
            last_error: None,
        }
    }

    pub fn with_integrator_limits(mut self, min: f64, max: f64) -> Self {
        self.integrator_min = min;
        self.integrator_max = max;
        self
    }

    pub fn from_options(options: &PidOptions) -> Self {
        Self::new(options.setpoint, options.kp, options.ki, options.kd)
            .with_integrator_limits(options.integrator_min, options.integrator_max)
    }

    /// Advance the loop by `dt` seconds with a new measurement
    ///
    /// The derivative term is zero on the first update and whenever `dt`
    /// is not positive.
    pub fn update(&mut self, measurement: f64, dt: f64) -> PidTerms {
        let error = self.setpoint - measurement;

        if dt > 0.0 {
            self.integrator =
                (self.integrator + error * dt).clamp(self.integrator_min, self.integrator_max);
        }

        let derivative = match self.last_error {
            Some(last) if dt > 0.0 => (error - last) / dt,
            _ => 0.0,
        };
        self.last_error = Some(error);

        let p = self.kp * error;
        let i = self.ki * self.integrator;
        let d = self.kd * derivative;
        PidTerms {
            error,
            p,
            i,
            d,
            control: p + i + d,
        }
    }

    /// Apply a live change; direction changes are handled by the caller
    pub fn apply(&mut self, setting: PidSetting) -> Result<(), String> {
        match setting {
            PidSetting::Setpoint(v) => self.setpoint = v,
            PidSetting::Kp(v) => self.kp = v,
            PidSetting::Ki(v) => self.ki = v,
            PidSetting::Kd(v) => self.kd = v,
            PidSetting::IntegratorMin(v) => {
                if v > self.integrator_max {
                    return Err("integrator_min must not exceed integrator_max".to_string());
                }
                self.integrator_min = v;
            }
            PidSetting::IntegratorMax(v) => {
                if v < self.integrator_min {
                    return Err("integrator_max must not be below integrator_min".to_string());
                }
                self.integrator_max = v;
            }
            PidSetting::Direction(_) => return Err("direction is not a PID gain".to_string()),
        }
        self.integrator = self
            .integrator
            .clamp(self.integrator_min, self.integrator_max);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proportional_only_is_memoryless() {
        let mut pid = PidState::new(50.0, 1.0, 0.0, 0.0);
        assert_eq!(pid.update(40.0, 10.0).control, 10.0);
        assert_eq!(pid.update(40.0, 10.0).control, 10.0);
    }

    #[test]
    fn test_integrator_accumulates_and_clamps() {
        let mut pid = PidState::new(10.0, 0.0, 1.0, 0.0).with_integrator_limits(-5.0, 5.0);
        assert_eq!(pid.update(8.0, 1.0).control, 2.0);
        assert_eq!(pid.update(8.0, 1.0).control, 4.0);
        assert_eq!(pid.update(8.0, 1.0).control, 5.0);
        assert_eq!(pid.integrator, 5.0);
    }

    #[test]
    fn test_derivative_zero_on_first_update() {
        let mut pid = PidState::new(0.0, 0.0, 0.0, 2.0);
        assert_eq!(pid.update(1.0, 1.0).d, 0.0);
        // error goes -1 -> -3 over 2 s
        assert_eq!(pid.update(3.0, 2.0).d, -2.0);
    }

    #[test]
    fn test_apply_keeps_limits_consistent() {
        let mut pid = PidState::new(0.0, 0.0, 1.0, 0.0).with_integrator_limits(-10.0, 10.0);
        pid.update(-8.0, 1.0);
        pid.apply(PidSetting::IntegratorMax(4.0)).unwrap();
        assert_eq!(pid.integrator, 4.0);
        assert!(pid.apply(PidSetting::IntegratorMin(6.0)).is_err());
        pid.apply(PidSetting::Setpoint(21.5)).unwrap();
        assert_eq!(pid.setpoint, 21.5);
    }
}
