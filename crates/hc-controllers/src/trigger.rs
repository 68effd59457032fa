//! Trigger controllers: run their action chain on time or output events

use crate::controller::{Controller, ControllerEnv, StepOutcome, Tick};
use crate::ControllerResult;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime, NaiveTime};
use hc_config::{
    secs, OutputStateTriggerOptions, TimerDailyTimePointOptions, TimerDailyTimeSpanOptions,
    TimerDurationOptions,
};
use hc_core::events::OutputChangedData;
use hc_core::OutputState;
use hc_event_bus::TypedEventReceiver;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::Instant;
use tracing::{info, warn};

async fn fire(env: &ControllerEnv, tick: &Tick, message: String) {
    info!(controller_id = %env.controller_id, "{}", message);
    env.run_actions(env.action_context(&tick.context).with_message(message))
        .await;
}

/// Fires on the first step, then every `duration`
pub struct DurationTimerTrigger {
    duration: Duration,
    next_fire: Option<Instant>,
    fired: u64,
}

impl DurationTimerTrigger {
    pub fn new(options: TimerDurationOptions) -> Self {
        Self {
            duration: secs(options.duration),
            next_fire: None,
            fired: 0,
        }
    }

    fn due(&self, now: Instant) -> bool {
        self.next_fire.map_or(true, |next| now >= next)
    }
}

#[async_trait]
impl Controller for DurationTimerTrigger {
    async fn step(&mut self, env: &ControllerEnv, tick: &Tick) -> ControllerResult<StepOutcome> {
        if tick.paused || !self.due(tick.instant) {
            return Ok(StepOutcome::Continue);
        }
        self.next_fire = Some(tick.instant + self.duration);
        if tick.held {
            return Ok(StepOutcome::Continue);
        }

        self.fired += 1;
        fire(
            env,
            tick,
            format!("Timer {} fired ({:?} interval)", env.controller_id, self.duration),
        )
        .await;
        Ok(StepOutcome::Continue)
    }

    fn detail(&self) -> serde_json::Value {
        serde_json::json!({ "fired": self.fired })
    }
}

/// Whether local time `time` lies in `(last, now]`
fn crossed(last: NaiveDateTime, now: NaiveDateTime, time: NaiveTime) -> bool {
    let mut candidate = now.date().and_time(time);
    if candidate > now {
        candidate -= ChronoDuration::days(1);
    }
    last < candidate && candidate <= now
}

/// Whether `now` is within `[start, end)`, wrapping midnight when `end < start`
///
/// An empty span (`start == end`) never matches.
fn in_span(now: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        start <= now && now < end
    } else {
        now >= start || now < end
    }
}

/// Fires once a day when local time passes `time`
pub struct DailyTimePointTrigger {
    time: NaiveTime,
    last_seen: Option<NaiveDateTime>,
}

impl DailyTimePointTrigger {
    pub fn new(options: TimerDailyTimePointOptions) -> Self {
        Self {
            time: options.time,
            last_seen: None,
        }
    }
}

#[async_trait]
impl Controller for DailyTimePointTrigger {
    async fn step(&mut self, env: &ControllerEnv, tick: &Tick) -> ControllerResult<StepOutcome> {
        let now = tick.now.with_timezone(&Local).naive_local();
        let last = self.last_seen.replace(now);
        // A pause that spans the time point skips that day
        if tick.paused || tick.held {
            return Ok(StepOutcome::Continue);
        }

        if let Some(last) = last {
            if crossed(last, now, self.time) {
                fire(
                    env,
                    tick,
                    format!("Daily timer {} reached {}", env.controller_id, self.time),
                )
                .await;
            }
        }
        Ok(StepOutcome::Continue)
    }

    fn detail(&self) -> serde_json::Value {
        serde_json::json!({ "time": self.time.to_string() })
    }
}

/// Fires on every step while local time is within the span
pub struct DailyTimeSpanTrigger {
    start: NaiveTime,
    end: NaiveTime,
    inside: bool,
}

impl DailyTimeSpanTrigger {
    pub fn new(options: TimerDailyTimeSpanOptions) -> Self {
        Self {
            start: options.start,
            end: options.end,
            inside: false,
        }
    }
}

#[async_trait]
impl Controller for DailyTimeSpanTrigger {
    async fn step(&mut self, env: &ControllerEnv, tick: &Tick) -> ControllerResult<StepOutcome> {
        if tick.paused {
            return Ok(StepOutcome::Continue);
        }

        let now = tick.now.with_timezone(&Local).time();
        self.inside = in_span(now, self.start, self.end);
        if self.inside && !tick.held {
            fire(
                env,
                tick,
                format!(
                    "Time span {} active ({} - {})",
                    env.controller_id, self.start, self.end
                ),
            )
            .await;
        }
        Ok(StepOutcome::Continue)
    }

    fn detail(&self) -> serde_json::Value {
        serde_json::json!({ "inside": self.inside })
    }
}

/// Fires when an output channel changes to the configured state
///
/// Changes are observed through output events; the first known state is
/// taken from the arbiter so an output already in the target state does
/// not fire on activation.
pub struct OutputStateTrigger {
    options: OutputStateTriggerOptions,
    events: Option<TypedEventReceiver<OutputChangedData>>,
    last_state: OutputState,
    fired: u64,
}

impl OutputStateTrigger {
    pub fn new(options: OutputStateTriggerOptions) -> Self {
        Self {
            options,
            events: None,
            last_state: OutputState::Unknown,
            fired: 0,
        }
    }

    /// Drain queued events, returning how many transitions into the target state occurred
    async fn drain(&mut self, env: &ControllerEnv) -> ControllerResult<u32> {
        let Some(events) = self.events.as_mut() else {
            return Ok(0);
        };

        let mut transitions = 0;
        loop {
            match events.try_recv() {
                Ok(Some(event)) => {
                    let data = event.data;
                    if data.output_id != self.options.output_id
                        || data.channel != self.options.channel
                    {
                        continue;
                    }
                    let state = data.status.state;
                    if state == self.options.state && self.last_state != state {
                        transitions += 1;
                    }
                    self.last_state = state;
                }
                Ok(None) => break,
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(
                        controller_id = %env.controller_id,
                        skipped,
                        "Output events lagged, re-reading state"
                    );
                    let state = env
                        .arbiter
                        .state(&self.options.output_id, self.options.channel)
                        .await?;
                    if state == self.options.state && self.last_state != state {
                        transitions += 1;
                    }
                    self.last_state = state;
                }
                Err(_) => {
                    self.events = None;
                    break;
                }
            }
        }
        Ok(transitions)
    }
}

#[async_trait]
impl Controller for OutputStateTrigger {
    async fn initialize(&mut self, env: &ControllerEnv) -> ControllerResult<()> {
        self.events = Some(env.event_bus.subscribe_typed::<OutputChangedData>());
        self.last_state = env
            .arbiter
            .state(&self.options.output_id, self.options.channel)
            .await?;
        Ok(())
    }

    async fn step(&mut self, env: &ControllerEnv, tick: &Tick) -> ControllerResult<StepOutcome> {
        let transitions = self.drain(env).await?;
        if transitions == 0 || tick.paused || tick.held {
            return Ok(StepOutcome::Continue);
        }

        self.fired += u64::from(transitions);
        for _ in 0..transitions {
            fire(
                env,
                tick,
                format!(
                    "Output {}/{} turned {}",
                    self.options.output_id, self.options.channel, self.options.state
                ),
            )
            .await;
        }
        Ok(StepOutcome::Continue)
    }

    fn detail(&self) -> serde_json::Value {
        serde_json::json!({
            "last_state": self.last_state,
            "fired": self.fired,
        })
    }
}
