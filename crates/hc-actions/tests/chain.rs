//! Action chain behavior against in-memory outputs and store

use async_trait::async_trait;
use hc_actions::{
    ActionContext, ActionPipeline, Notification, NotificationKind, NotificationSink,
    NotificationSinks, SinkError,
};
use hc_config::{DaemonConfig, SharedConfig};
use hc_core::{
    ControllerStatus, DaemonHandle, HandleError, HandleResult, Measurement, OutputState,
    PidSetting,
};
use hc_event_bus::EventBus;
use hc_measurement_store::{MeasurementStore, MemoryMeasurementStore};
use hc_output::{MemoryDriver, OutputArbiter};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const OUTPUTS_AND_CONTROLLERS: &str = r#"
outputs:
  - { id: fan, driver: { type: memory, channels: 2 } }
controllers:
  - { id: cond_hot, options: { type: timer_duration, duration: 60 } }
  - { id: pid_tent, options: { type: timer_duration, duration: 60 } }
"#;

struct Harness {
    pipeline: Arc<ActionPipeline>,
    arbiter: Arc<OutputArbiter>,
    driver: Arc<MemoryDriver>,
    store: Arc<MemoryMeasurementStore>,
    bus: Arc<EventBus>,
}

fn harness(actions: &str) -> Harness {
    harness_with(actions, NotificationSinks::with_defaults())
}

fn harness_with(actions: &str, sinks: NotificationSinks) -> Harness {
    let yaml = format!("{}actions:\n{}", OUTPUTS_AND_CONTROLLERS, actions);
    let config = DaemonConfig::from_yaml_str(&yaml).unwrap();

    let bus = Arc::new(EventBus::new());
    let driver = Arc::new(MemoryDriver::new(2));
    let arbiter = Arc::new(OutputArbiter::new().with_event_bus(bus.clone()));
    arbiter.register("fan", driver.clone());
    let store = Arc::new(MemoryMeasurementStore::new());

    let pipeline = ActionPipeline::new(
        Arc::new(SharedConfig::new(config)),
        store.clone(),
        arbiter.clone(),
        bus.clone(),
    )
    .with_sinks(sinks);

    Harness {
        pipeline: Arc::new(pipeline),
        arbiter,
        driver,
        store,
        bus,
    }
}

#[derive(Default)]
struct RecordingDaemon {
    calls: Mutex<Vec<String>>,
}

impl RecordingDaemon {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DaemonHandle for RecordingDaemon {
    async fn controller_activate(&self, controller_id: &str) -> HandleResult<()> {
        self.record(format!("activate {}", controller_id));
        Ok(())
    }

    async fn controller_deactivate(&self, controller_id: &str) -> HandleResult<()> {
        self.record(format!("deactivate {}", controller_id));
        Ok(())
    }

    async fn controller_pause(&self, controller_id: &str) -> HandleResult<()> {
        self.record(format!("pause {}", controller_id));
        Ok(())
    }

    async fn controller_hold(&self, controller_id: &str) -> HandleResult<()> {
        self.record(format!("hold {}", controller_id));
        Ok(())
    }

    async fn controller_resume(&self, controller_id: &str) -> HandleResult<()> {
        self.record(format!("resume {}", controller_id));
        Ok(())
    }

    async fn pid_set(&self, controller_id: &str, setting: PidSetting) -> HandleResult<()> {
        self.record(format!("set {} {:?}", controller_id, setting));
        Ok(())
    }

    async fn input_force_measurements(&self, controller_id: &str) -> HandleResult<Vec<Measurement>> {
        self.record(format!("force {}", controller_id));
        Ok(Vec::new())
    }

    fn controller_status(&self, controller_id: &str) -> HandleResult<ControllerStatus> {
        Err(HandleError::Failed(format!("no status for {}", controller_id)))
    }
}

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, notification: Notification) -> Result<(), SinkError> {
        self.sent.lock().unwrap().push(notification);
        Ok(())
    }
}

#[tokio::test]
async fn test_failing_action_does_not_stop_chain() {
    let h = harness(
        r#"
  - { id: a1, owner: cond_hot, action: { type: output_on, output_id: fan } }
  - id: a2
    owner: cond_hot
    action: { type: read_measurement, measurement: { device_id: tent_sensor }, max_age: 60 }
  - { id: a3, owner: cond_hot, action: { type: log_message, message: "third ran" } }
"#,
    );

    let ctx = h
        .pipeline
        .run_all_actions("cond_hot", ActionContext::new("cond_hot"))
        .await;

    assert_eq!(h.arbiter.state("fan", 0).await.unwrap(), OutputState::On);
    let first = ctx.message.find("output fan/0 on");
    let failure = ctx.message.find("[Action a2] error");
    assert!(first.is_some() && failure.is_some(), "{}", ctx.message);
    assert!(first < failure, "{}", ctx.message);
    assert!(ctx.message.ends_with("third ran"), "{}", ctx.message);
    assert_eq!(ctx.value["measurement"], serde_json::Value::Null);
}

#[tokio::test]
async fn test_read_measurement_feeds_value_map() {
    let h = harness(
        r#"
  - id: read
    owner: cond_hot
    action: { type: read_measurement, measurement: { device_id: tent_sensor, channel: 1 }, key: humidity }
"#,
    );
    h.store
        .write(Measurement::new(
            "tent_sensor",
            1,
            "humidity",
            "%",
            64.0,
            chrono::Utc::now(),
        ))
        .await
        .unwrap();

    let ctx = h
        .pipeline
        .run_all_actions("cond_hot", ActionContext::new("cond_hot"))
        .await;
    assert_eq!(ctx.value["humidity"], 64.0);
}

#[tokio::test]
async fn test_overrides_replace_configured_values() {
    let h = harness(
        r#"
  - { id: run_fan, owner: cond_hot, action: { type: output_duration, output_id: fan, duration: 30 } }
"#,
    );

    let ctx = ActionContext::new("cond_hot")
        .with_value("duration", 5)
        .with_value("channel", 1);
    h.pipeline.run_action("run_fan", ctx).await;

    let status = h.arbiter.status("fan", 1).await.unwrap().unwrap();
    assert_eq!(status.state, OutputState::On);
    assert_eq!(status.amount, 5.0);
    assert!(h.arbiter.status("fan", 0).await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_override_is_an_action_error() {
    let h = harness(
        r#"
  - { id: pwm, owner: cond_hot, action: { type: output_pwm, output_id: fan, duty_cycle: 40 } }
"#,
    );

    let ctx = ActionContext::new("cond_hot").with_value("duty_cycle", "lots");
    let ctx = h.pipeline.run_action("pwm", ctx).await;

    assert!(ctx.message.contains("invalid override 'duty_cycle'"));
    assert!(h.driver.history().is_empty());
}

#[tokio::test]
async fn test_controller_actions_go_through_daemon() {
    let h = harness(
        r#"
  - { id: sp, owner: cond_hot, action: { type: pid_set_setpoint, controller_id: pid_tent, setpoint: 24 } }
  - { id: hold, owner: cond_hot, action: { type: pid_hold, controller_id: pid_tent } }
"#,
    );
    let daemon = Arc::new(RecordingDaemon::default());
    let weak: std::sync::Weak<dyn DaemonHandle> = {
        let as_dyn: Arc<dyn DaemonHandle> = daemon.clone();
        Arc::downgrade(&as_dyn)
    };
    let pipeline = Arc::try_unwrap(h.pipeline)
        .ok()
        .unwrap()
        .with_daemon(weak);

    let ctx = ActionContext::new("cond_hot").with_value("setpoint", 26.5);
    pipeline.run_all_actions("cond_hot", ctx).await;

    assert_eq!(
        daemon.calls(),
        vec![
            "set pid_tent Setpoint(26.5)".to_string(),
            "hold pid_tent".to_string()
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_notifications_are_rate_limited() {
    let sink = Arc::new(RecordingSink::default());
    let sinks = NotificationSinks::new();
    sinks.register(NotificationKind::Webhook, sink.clone());
    let h = harness_with(
        r#"
  - id: alert
    owner: cond_hot
    wait: true
    min_interval: 600
    action: { type: webhook, url: "http://localhost/hook" }
"#,
        sinks,
    );

    let first = h
        .pipeline
        .run_action("alert", ActionContext::new("cond_hot").with_message("too hot"))
        .await;
    let second = h
        .pipeline
        .run_action("alert", ActionContext::new("cond_hot"))
        .await;
    tokio::time::advance(Duration::from_secs(601)).await;
    h.pipeline
        .run_action("alert", ActionContext::new("cond_hot"))
        .await;

    assert!(first.message.contains("webhook sent"));
    assert!(second.message.contains("skipped"));
    let sent = sink.sent.lock().unwrap();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].body, "too hot");
    assert_eq!(sent[0].target, "http://localhost/hook");
}

#[tokio::test]
async fn test_missing_sink_is_reported() {
    let h = harness_with(
        r#"
  - { id: mail, owner: cond_hot, action: { type: send_email, to: grower@example.test, subject: hot } }
"#,
        NotificationSinks::new(),
    );
    let ctx = h
        .pipeline
        .run_action("mail", ActionContext::new("cond_hot"))
        .await;
    assert!(ctx.message.contains("no email sink configured"));
}

#[tokio::test]
async fn test_queued_side_effect_completes_before_shutdown() {
    let sink = Arc::new(RecordingSink::default());
    let sinks = NotificationSinks::new();
    sinks.register(NotificationKind::Mqtt, sink.clone());
    let h = harness_with(
        r#"
  - { id: pub, owner: cond_hot, action: { type: mqtt_publish, topic: tent/alerts, payload: "fan on" } }
"#,
        sinks,
    );

    let ctx = h
        .pipeline
        .run_action("pub", ActionContext::new("cond_hot"))
        .await;
    assert!(ctx.message.contains("mqtt queued"));

    assert_eq!(h.pipeline.shutdown(Duration::from_secs(5)).await, 0);
    let sent = sink.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].body, "fan on");
}

#[tokio::test(start_paused = true)]
async fn test_ramp_with_wait_finishes_before_next_action() {
    let h = harness(
        r#"
  - id: ramp
    owner: cond_hot
    wait: true
    action: { type: output_ramp_pwm, output_id: fan, start_duty: 0, end_duty: 30, increment: 10, step_duration: 1 }
  - { id: after, owner: cond_hot, action: { type: log_message, message: done } }
"#,
    );

    let ctx = h
        .pipeline
        .run_all_actions("cond_hot", ActionContext::new("cond_hot"))
        .await;

    let duties: Vec<f64> = h.driver.history().iter().map(|(_, c)| c.amount).collect();
    assert_eq!(duties, vec![0.0, 10.0, 20.0, 30.0]);
    assert!(ctx.message.contains("ramped 0% to 30%"), "{}", ctx.message);
    assert!(ctx.message.ends_with("done"));
}

#[tokio::test]
async fn test_fire_event_inline() {
    let h = harness(
        r#"
  - id: ev
    owner: cond_hot
    wait: true
    action: { type: fire_event, event_type: tent_alert, data: { level: 2 } }
"#,
    );
    let mut rx = h.bus.subscribe("tent_alert");

    h.pipeline
        .run_action("ev", ActionContext::new("cond_hot").with_message("hot"))
        .await;

    let event = rx.try_recv().unwrap();
    assert_eq!(event.data["level"], 2);
    assert_eq!(event.data["owner_id"], "cond_hot");
    assert_eq!(event.data["message"], "hot");
    assert_eq!(event.context.origin(), "cond_hot");
}
