//! Relay-feedback PID autotuning
//!
//! The output is switched between `initial ± step` whenever the process
//! crosses the setpoint (outside the noise band). The induced oscillation's
//! amplitude and period give the ultimate gain `Ku` and period `Pu`, from
//! which the classic tuning rules derive PID gains.

use serde::Serialize;
use std::collections::VecDeque;
use std::f64::consts::PI;

/// Induced amplitude must settle within this fraction to succeed
const PEAK_AMPLITUDE_TOLERANCE: f64 = 0.05;

/// Give up after this many peaks without convergence
const MAX_PEAKS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AutotuneState {
    Idle,
    RelayStepUp,
    RelayStepDown,
    Succeeded,
    Failed,
}

/// Gains derived from `Ku`/`Pu` by one tuning rule
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TunedGains {
    pub rule: &'static str,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

/// `(name, kp divisor, ki divisor, kd divisor)`
const TUNING_RULES: [(&str, f64, f64, f64); 6] = [
    ("ziegler_nichols", 34.0, 40.0, 160.0),
    ("tyreus_luyben", 44.0, 9.0, 126.0),
    ("ciancone_marlin", 66.0, 88.0, 162.0),
    ("pessen_integral", 28.0, 50.0, 133.0),
    ("some_overshoot", 60.0, 40.0, 60.0),
    ("no_overshoot", 100.0, 40.0, 60.0),
];

#[derive(Debug, Clone, Serialize)]
pub struct Autotuner {
    setpoint: f64,
    out_step: f64,
    initial_output: f64,
    noiseband: f64,
    timeout: f64,
    #[serde(skip)]
    inputs: VecDeque<f64>,
    window: usize,
    state: AutotuneState,
    output: f64,
    peak_type: i8,
    peak_count: usize,
    peaks: Vec<f64>,
    peak_times: Vec<f64>,
    started: f64,
    induced_amplitude: f64,
    ku: f64,
    pu: f64,
}

impl Autotuner {
    /// `window` is the number of samples used for peak detection
    pub fn new(
        setpoint: f64,
        out_step: f64,
        initial_output: f64,
        noiseband: f64,
        window: usize,
        timeout: f64,
    ) -> Self {
        let window = window.max(1);
        Self {
            setpoint,
            out_step,
            initial_output,
            noiseband,
            timeout,
            inputs: VecDeque::with_capacity(window),
            window,
            state: AutotuneState::Idle,
            output: 0.0,
            peak_type: 0,
            peak_count: 0,
            peaks: Vec::new(),
            peak_times: Vec::new(),
            started: 0.0,
            induced_amplitude: 0.0,
            ku: 0.0,
            pu: 0.0,
        }
    }

    pub fn state(&self) -> AutotuneState {
        self.state
    }

    /// Relay output to apply, in percent
    pub fn output(&self) -> f64 {
        self.output
    }

    pub fn peak_count(&self) -> usize {
        self.peak_count
    }

    pub fn ku(&self) -> f64 {
        self.ku
    }

    pub fn pu(&self) -> f64 {
        self.pu
    }

    /// Feed one sample taken at `now` seconds; returns `true` once the run
    /// has finished, successfully or not
    pub fn run(&mut self, input: f64, now: f64) -> bool {
        match self.state {
            AutotuneState::Idle | AutotuneState::Succeeded | AutotuneState::Failed => {
                self.init(now);
            }
            _ if now - self.started > self.timeout => {
                self.state = AutotuneState::Failed;
                self.output = 0.0;
                return true;
            }
            _ => {}
        }

        if self.state == AutotuneState::RelayStepUp && input > self.setpoint + self.noiseband {
            self.state = AutotuneState::RelayStepDown;
        } else if self.state == AutotuneState::RelayStepDown
            && input < self.setpoint - self.noiseband
        {
            self.state = AutotuneState::RelayStepUp;
        }

        self.output = match self.state {
            AutotuneState::RelayStepUp => self.initial_output + self.out_step,
            _ => self.initial_output - self.out_step,
        }
        .clamp(0.0, 100.0);

        let is_max = self.inputs.iter().all(|v| input >= *v);
        let is_min = self.inputs.iter().all(|v| input <= *v);
        if self.inputs.len() == self.window {
            self.inputs.pop_front();
        }
        self.inputs.push_back(input);
        if self.inputs.len() < self.window {
            return false;
        }

        let mut inflection = false;
        if is_max {
            inflection = self.peak_type == -1;
            self.peak_type = 1;
        } else if is_min {
            inflection = self.peak_type == 1;
            self.peak_type = -1;
        }

        if inflection {
            self.peak_count += 1;
            self.peaks.push(input);
            self.peak_times.push(now);
        }

        if inflection && self.peak_count > 4 {
            self.check_convergence();
        }

        if self.peak_count >= MAX_PEAKS {
            self.output = 0.0;
            self.state = AutotuneState::Failed;
            return true;
        }

        if self.state == AutotuneState::Succeeded {
            self.output = 0.0;
            self.ku = 4.0 * self.out_step / (self.induced_amplitude * PI);
            // peak_times[0] is the start, so [1] and [3] are a full period apart
            let first = self.peak_times[3] - self.peak_times[1];
            let second = self.peak_times[4] - self.peak_times[2];
            self.pu = 0.5 * (first + second);
            return true;
        }
        false
    }

    /// Gains for every tuning rule; empty unless the run succeeded
    pub fn gains(&self) -> Vec<TunedGains> {
        if self.state != AutotuneState::Succeeded || self.pu <= 0.0 {
            return Vec::new();
        }
        TUNING_RULES
            .iter()
            .map(|&(rule, p_div, i_div, d_div)| {
                let kp = self.ku / p_div;
                TunedGains {
                    rule,
                    kp,
                    ki: kp / (self.pu / i_div),
                    kd: kp * (self.pu / d_div),
                }
            })
            .collect()
    }

    fn init(&mut self, now: f64) {
        self.peak_type = 0;
        self.peak_count = 0;
        self.output = 0.0;
        self.induced_amplitude = 0.0;
        self.ku = 0.0;
        self.pu = 0.0;
        self.inputs.clear();
        self.peaks.clear();
        self.peak_times.clear();
        self.peak_times.push(now);
        self.started = now;
        self.state = AutotuneState::RelayStepUp;
    }

    fn check_convergence(&mut self) {
        let n = self.peaks.len();
        let mut abs_max = self.peaks[n - 2];
        let mut abs_min = self.peaks[n - 2];
        let mut amplitude = 0.0;
        for i in 0..n - 2 {
            amplitude += (self.peaks[i] - self.peaks[i + 1]).abs();
            abs_max = abs_max.max(self.peaks[i]);
            abs_min = abs_min.min(self.peaks[i]);
        }
        amplitude /= 6.0;
        self.induced_amplitude = amplitude;

        if amplitude <= 0.0 {
            return;
        }
        let deviation = (0.5 * (abs_max - abs_min) - amplitude) / amplitude;
        if deviation.abs() < PEAK_AMPLITUDE_TOLERANCE {
            self.state = AutotuneState::Succeeded;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Triangle wave between 40 and 60 with a 20 s period
    fn triangle(t: u32) -> f64 {
        let m = (t % 20) as f64;
        60.0 - 2.0 * (m - 10.0).abs()
    }

    #[test]
    fn test_steady_oscillation_succeeds() {
        let mut tuner = Autotuner::new(50.0, 20.0, 50.0, 0.5, 4, 3600.0);
        let mut finished_at = None;
        for t in 0..400 {
            if tuner.run(triangle(t), t as f64) {
                finished_at = Some(t);
                break;
            }
        }

        assert!(finished_at.is_some());
        assert_eq!(tuner.state(), AutotuneState::Succeeded);
        assert_eq!(tuner.pu(), 20.0);
        assert!(tuner.ku() > 0.0);
        assert_eq!(tuner.output(), 0.0);

        let gains = tuner.gains();
        assert_eq!(gains.len(), TUNING_RULES.len());
        let zn = gains.iter().find(|g| g.rule == "ziegler_nichols").unwrap();
        assert!((zn.kp - tuner.ku() / 34.0).abs() < 1e-12);
    }

    #[test]
    fn test_relay_follows_setpoint_crossings() {
        let mut tuner = Autotuner::new(50.0, 20.0, 50.0, 0.5, 4, 3600.0);
        tuner.run(45.0, 0.0);
        assert_eq!(tuner.state(), AutotuneState::RelayStepUp);
        assert_eq!(tuner.output(), 70.0);
        tuner.run(50.4, 1.0);
        assert_eq!(tuner.state(), AutotuneState::RelayStepUp);
        tuner.run(50.6, 2.0);
        assert_eq!(tuner.state(), AutotuneState::RelayStepDown);
        assert_eq!(tuner.output(), 30.0);
    }

    #[test]
    fn test_timeout_fails() {
        let mut tuner = Autotuner::new(50.0, 20.0, 50.0, 0.5, 4, 10.0);
        assert!(!tuner.run(45.0, 0.0));
        assert!(tuner.run(45.0, 11.0));
        assert_eq!(tuner.state(), AutotuneState::Failed);
        assert!(tuner.gains().is_empty());
    }
}
