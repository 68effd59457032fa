//! Controllers stepped by hand against in-memory outputs and store

use chrono::Utc;
use hc_actions::ActionPipeline;
use hc_config::{DaemonConfig, SharedConfig};
use hc_controllers::{build_controller, Controller, ControllerEnv, StepOutcome, Tick};
use hc_core::{Context, Measurement, OutputMode, OutputState};
use hc_event_bus::EventBus;
use hc_measurement_store::{MeasurementStore, MemoryMeasurementStore};
use hc_output::{MemoryDriver, OutputArbiter};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    config: DaemonConfig,
    pipeline: Arc<ActionPipeline>,
    arbiter: Arc<OutputArbiter>,
    driver: Arc<MemoryDriver>,
    store: Arc<MemoryMeasurementStore>,
}

impl Harness {
    fn new(yaml: &str) -> Self {
        let yaml = format!(
            "outputs:\n  - {{ id: heater, driver: {{ type: memory, channels: 2 }} }}\n{}",
            yaml
        );
        let config = DaemonConfig::from_yaml_str(&yaml).unwrap();

        let bus = Arc::new(EventBus::new());
        let driver = Arc::new(MemoryDriver::new(2));
        let arbiter = Arc::new(OutputArbiter::new().with_event_bus(bus.clone()));
        arbiter.register("heater", driver.clone());
        let store = Arc::new(MemoryMeasurementStore::new());
        let pipeline = ActionPipeline::new(
            Arc::new(SharedConfig::new(config.clone())),
            store.clone(),
            arbiter.clone(),
            bus,
        );

        Self {
            config,
            pipeline: Arc::new(pipeline),
            arbiter,
            driver,
            store,
        }
    }

    async fn controller(&self, id: &str) -> (Box<dyn Controller>, ControllerEnv) {
        let config = self.config.controller(id).unwrap();
        let mut controller = build_controller(config).unwrap();
        let env = ControllerEnv::new(config, self.pipeline.clone());
        controller.initialize(&env).await.unwrap();
        (controller, env)
    }

    async fn measure(&self, device_id: &str, channel: u32, value: f64) {
        self.store
            .write(Measurement::new(device_id, channel, "temperature", "C", value, Utc::now()))
            .await
            .unwrap();
    }

    async fn last(&self, device_id: &str, channel: u32) -> Option<Measurement> {
        self.store
            .read_last(device_id, channel, None, Duration::from_secs(60))
            .await
            .unwrap()
    }
}

fn tick() -> Tick {
    Tick::new(Context::new())
}

const BANG_BANG: &str = r#"
controllers:
  - id: heat
    period: 10
    options:
      type: bang_bang
      measurement: { device_id: probe }
      setpoint: 50
      hysteresis: 2
      raise: { output_id: heater }
"#;

#[tokio::test]
async fn test_bang_bang_switches_outside_band_only() {
    let h = Harness::new(BANG_BANG);
    let (mut controller, env) = h.controller("heat").await;

    h.measure("probe", 0, 47.0).await;
    controller.step(&env, &tick()).await.unwrap();
    assert_eq!(h.arbiter.state("heater", 0).await.unwrap(), OutputState::On);

    h.measure("probe", 0, 53.0).await;
    controller.step(&env, &tick()).await.unwrap();
    assert_eq!(h.arbiter.state("heater", 0).await.unwrap(), OutputState::Off);

    h.measure("probe", 0, 50.0).await;
    controller.step(&env, &tick()).await.unwrap();
    assert_eq!(h.driver.history().len(), 2);
}

#[tokio::test]
async fn test_bang_bang_stale_measurement_leaves_output() {
    let h = Harness::new(BANG_BANG);
    let (mut controller, env) = h.controller("heat").await;

    h.store
        .write(Measurement::new(
            "probe",
            0,
            "temperature",
            "C",
            10.0,
            Utc::now() - chrono::Duration::seconds(600),
        ))
        .await
        .unwrap();
    let outcome = controller.step(&env, &tick()).await.unwrap();

    assert_eq!(outcome, StepOutcome::Continue);
    assert!(h.driver.history().is_empty());
}

#[tokio::test]
async fn test_bang_bang_held_does_not_command() {
    let h = Harness::new(BANG_BANG);
    let (mut controller, env) = h.controller("heat").await;

    h.measure("probe", 0, 40.0).await;
    controller.step(&env, &tick().held(true)).await.unwrap();
    assert!(h.driver.history().is_empty());

    controller.stop(&env, &Context::new()).await.unwrap();
    assert_eq!(h.arbiter.state("heater", 0).await.unwrap(), OutputState::Off);
}

#[tokio::test]
async fn test_pid_proportional_pwm() {
    let h = Harness::new(
        r#"
controllers:
  - id: pid
    period: 10
    options:
      type: pid
      measurement: { device_id: probe }
      setpoint: 20
      kp: 1
      raise: { output_id: heater, mode: pwm }
"#,
    );
    let (mut controller, env) = h.controller("pid").await;

    let first = tick();
    let mut second = tick();
    second.instant = first.instant + Duration::from_secs(10);

    h.measure("probe", 0, 10.0).await;
    controller.step(&env, &first).await.unwrap();
    controller.step(&env, &second).await.unwrap();

    let history = h.driver.history();
    assert_eq!(history.len(), 2);
    for (_, command) in history {
        assert_eq!(command.mode, OutputMode::Pwm);
        assert_eq!(command.amount, 10.0);
    }

    controller.stop(&env, &Context::new()).await.unwrap();
    let status = h.arbiter.status("heater", 0).await.unwrap().unwrap();
    assert_eq!(status.state, OutputState::Off);
    assert_eq!(status.requested_by, "pid");
}

#[tokio::test]
async fn test_pid_duration_capped_at_period() {
    let h = Harness::new(
        r#"
controllers:
  - id: pid
    period: 30
    options:
      type: pid
      measurement: { device_id: probe }
      setpoint: 100
      kp: 1
      raise: { output_id: heater, mode: duration, min_on: 2 }
"#,
    );
    let (mut controller, env) = h.controller("pid").await;

    h.measure("probe", 0, 0.0).await;
    controller.step(&env, &tick()).await.unwrap();
    let status = h.arbiter.status("heater", 0).await.unwrap().unwrap();
    assert_eq!(status.mode, OutputMode::Duration);
    assert_eq!(status.amount, 30.0);

    // Below min_on turns the output off
    h.measure("probe", 0, 99.0).await;
    let mut later = tick();
    later.instant += Duration::from_secs(30);
    controller.step(&env, &later).await.unwrap();
    assert_eq!(h.arbiter.state("heater", 0).await.unwrap(), OutputState::Off);
}

#[tokio::test]
async fn test_difference_and_vpd() {
    let h = Harness::new(
        r#"
controllers:
  - id: delta
    options:
      type: difference
      minuend: { device_id: inside }
      subtrahend: { device_id: outside }
      absolute: true
  - id: vpd
    options:
      type: vpd
      temperature: { device_id: inside }
      humidity: { device_id: inside, channel: 1 }
"#,
    );
    h.measure("inside", 0, 25.0).await;
    h.measure("outside", 0, 31.5).await;
    h.measure("inside", 1, 50.0).await;

    let (mut delta, env) = h.controller("delta").await;
    delta.step(&env, &tick()).await.unwrap();
    let point = h.last("delta", 0).await.unwrap();
    assert_eq!(point.value, 6.5);
    assert_eq!(point.kind, "difference");

    let (mut vpd, env) = h.controller("vpd").await;
    vpd.step(&env, &tick()).await.unwrap();
    let point = h.last("vpd", 0).await.unwrap();
    assert_eq!(point.unit, "kPa");
    assert!((point.value - 1.584).abs() < 0.01);
}

#[tokio::test]
async fn test_statistics_channels_follow_configured_order() {
    let h = Harness::new(
        r#"
controllers:
  - id: stats
    options:
      type: statistics
      measurements: [{ device_id: a }, { device_id: b }]
      statistics: [maximum, mean]
"#,
    );
    h.measure("a", 0, 20.0).await;
    h.measure("b", 0, 24.0).await;

    let (mut stats, env) = h.controller("stats").await;
    stats.step(&env, &tick()).await.unwrap();

    assert_eq!(h.last("stats", 0).await.unwrap().value, 24.0);
    assert_eq!(h.last("stats", 1).await.unwrap().value, 22.0);
    assert_eq!(h.last("stats", 1).await.unwrap().unit, "C");
}

#[tokio::test]
async fn test_verification_rejects_disagreement() {
    let h = Harness::new(
        r#"
controllers:
  - id: verified
    options:
      type: verification
      measurements: [{ device_id: a }, { device_id: b }]
      max_difference: 1
"#,
    );
    h.measure("a", 0, 20.0).await;
    h.measure("b", 0, 23.0).await;
    let (mut controller, env) = h.controller("verified").await;
    controller.step(&env, &tick()).await.unwrap();
    assert!(h.last("verified", 0).await.is_none());

    h.measure("b", 0, 20.5).await;
    controller.step(&env, &tick()).await.unwrap();
    assert_eq!(h.last("verified", 0).await.unwrap().value, 20.0);
}

#[tokio::test]
async fn test_input_runs_chain_before_storing() {
    let h = Harness::new(
        r#"
controllers:
  - id: sensor
    options:
      type: input
      sensor: { type: static, values: [{ channel: 0, kind: temperature, unit: C, value: 20 }] }
actions:
  - { id: calibrate, owner: sensor, action: { type: measurement_equation, equation: "x + 1.5" } }
"#,
    );
    let (mut controller, env) = h.controller("sensor").await;

    controller.step(&env, &tick()).await.unwrap();
    assert_eq!(h.last("sensor", 0).await.unwrap().value, 21.5);

    let forced = controller
        .force_measurements(&env, &Context::new())
        .await
        .unwrap();
    assert_eq!(forced.len(), 1);
    assert_eq!(forced[0].device_id, "sensor");
}

#[tokio::test]
async fn test_conditional_runs_chain_when_true() {
    let h = Harness::new(
        r#"
controllers:
  - id: too_hot
    options:
      type: conditional
      conditions: [{ id: temp, measurement: { device_id: probe } }]
      expression: "temp is not none and temp > 30"
actions:
  - { id: cool, owner: too_hot, action: { type: output_on, output_id: heater, channel: 1 } }
"#,
    );
    let (mut controller, env) = h.controller("too_hot").await;

    controller.step(&env, &tick()).await.unwrap();
    assert!(h.driver.history().is_empty());

    h.measure("probe", 0, 28.0).await;
    controller.step(&env, &tick()).await.unwrap();
    assert!(h.driver.history().is_empty());

    h.measure("probe", 0, 31.0).await;
    controller.step(&env, &tick()).await.unwrap();
    assert_eq!(h.arbiter.state("heater", 1).await.unwrap(), OutputState::On);
}

#[tokio::test]
async fn test_output_state_trigger_fires_on_transition() {
    let h = Harness::new(
        r#"
controllers:
  - id: on_heat
    options: { type: output_state, output_id: heater, state: on }
actions:
  - { id: mirror, owner: on_heat, action: { type: output_on, output_id: heater, channel: 1 } }
"#,
    );
    let (mut controller, env) = h.controller("on_heat").await;

    controller.step(&env, &tick()).await.unwrap();
    assert!(h.driver.history().is_empty());

    h.arbiter
        .command(hc_core::OutputCommand::on("heater", 0))
        .await
        .unwrap();
    controller.step(&env, &tick()).await.unwrap();
    assert_eq!(h.arbiter.state("heater", 1).await.unwrap(), OutputState::On);
    assert_eq!(controller.detail()["fired"], 1);

    // Already on: no second transition
    h.arbiter
        .command(hc_core::OutputCommand::on("heater", 0))
        .await
        .unwrap();
    controller.step(&env, &tick()).await.unwrap();
    assert_eq!(controller.detail()["fired"], 1);
}

#[tokio::test]
async fn test_duration_timer_fires_first_step_then_every_duration() {
    let h = Harness::new(
        r#"
controllers:
  - id: every_minute
    period: 1
    options: { type: timer_duration, duration: 60 }
actions:
  - { id: note, owner: every_minute, action: { type: log_message, message: tick } }
"#,
    );
    let (mut controller, env) = h.controller("every_minute").await;

    let start = tick();
    controller.step(&env, &start).await.unwrap();
    let mut soon = tick();
    soon.instant = start.instant + Duration::from_secs(30);
    controller.step(&env, &soon).await.unwrap();
    let mut later = tick();
    later.instant = start.instant + Duration::from_secs(60);
    controller.step(&env, &later).await.unwrap();

    assert_eq!(controller.detail()["fired"], 2);
}
