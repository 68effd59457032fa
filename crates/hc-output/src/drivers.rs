//! Built-in output drivers

use crate::{DriverError, OutputDriver};
use async_trait::async_trait;
use hc_core::{OutputCommand, OutputMode, OutputState};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, trace};

const HISTORY_LIMIT: usize = 1024;

#[derive(Default)]
struct MemoryChannel {
    state: OutputState,
    in_flight: u32,
    max_in_flight: u32,
    fail_with: Option<String>,
}

/// Driver that keeps channel state in memory
///
/// Used for virtual outputs and in tests. Every applied command is kept in a
/// bounded history.
pub struct MemoryDriver {
    channels: Mutex<Vec<MemoryChannel>>,
    history: Mutex<VecDeque<(u32, OutputCommand)>>,
    latency: Duration,
}

impl MemoryDriver {
    pub fn new(channel_count: u32) -> Self {
        let channels = (0..channel_count)
            .map(|_| MemoryChannel {
                state: OutputState::Off,
                ..Default::default()
            })
            .collect();
        Self {
            channels: Mutex::new(channels),
            history: Mutex::new(VecDeque::new()),
            latency: Duration::ZERO,
        }
    }

    /// Simulate a device that takes `latency` to apply each command
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make every later `set` on `channel` fail with `message`
    pub fn fail_channel(&self, channel: u32, message: impl Into<String>) {
        if let Some(ch) = self.lock_channels().get_mut(channel as usize) {
            ch.fail_with = Some(message.into());
        }
    }

    /// Undo [`fail_channel`](Self::fail_channel)
    pub fn heal_channel(&self, channel: u32) {
        if let Some(ch) = self.lock_channels().get_mut(channel as usize) {
            ch.fail_with = None;
        }
    }

    /// Applied commands, oldest first
    pub fn history(&self) -> Vec<(u32, OutputCommand)> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Highest number of overlapping `set` calls seen on `channel`
    pub fn max_in_flight(&self, channel: u32) -> u32 {
        self.lock_channels()
            .get(channel as usize)
            .map(|ch| ch.max_in_flight)
            .unwrap_or(0)
    }

    fn lock_channels(&self) -> std::sync::MutexGuard<'_, Vec<MemoryChannel>> {
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl OutputDriver for MemoryDriver {
    fn channel_count(&self) -> u32 {
        self.lock_channels().len() as u32
    }

    async fn set(&self, channel: u32, command: &OutputCommand) -> Result<(), DriverError> {
        {
            let mut channels = self.lock_channels();
            let ch = channels
                .get_mut(channel as usize)
                .ok_or_else(|| DriverError(format!("no channel {}", channel)))?;
            if let Some(message) = &ch.fail_with {
                return Err(DriverError(message.clone()));
            }
            ch.in_flight += 1;
            ch.max_in_flight = ch.max_in_flight.max(ch.in_flight);
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        {
            let mut channels = self.lock_channels();
            if let Some(ch) = channels.get_mut(channel as usize) {
                ch.in_flight -= 1;
                ch.state = command.state;
            }
        }

        if let Ok(mut history) = self.history.lock() {
            history.push_back((channel, command.clone()));
            while history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }
        trace!(channel, state = %command.state, amount = command.amount, "Memory output set");
        Ok(())
    }

    async fn get_state(&self, channel: u32) -> OutputState {
        self.lock_channels()
            .get(channel as usize)
            .map(|ch| ch.state)
            .unwrap_or(OutputState::Unknown)
    }
}

/// Shell command templates for a [`CommandDriver`]
///
/// Placeholders `{channel}`, `{duration}`, `{duty_cycle}`, `{value}` and
/// `{volume}` are replaced before the command runs.
#[derive(Debug, Clone, Default)]
pub struct CommandTemplates {
    pub on: String,
    pub off: String,
    pub pwm: Option<String>,
    pub value: Option<String>,
    pub volume: Option<String>,
}

impl CommandTemplates {
    fn render(&self, channel: u32, command: &OutputCommand) -> Result<String, DriverError> {
        let template = match (command.state, command.mode) {
            (OutputState::Off, OutputMode::Pwm) => self.pwm.as_ref().unwrap_or(&self.off),
            (OutputState::Off, _) => &self.off,
            (_, OutputMode::Duration) => &self.on,
            (_, OutputMode::Pwm) => self
                .pwm
                .as_ref()
                .ok_or_else(|| DriverError("no pwm command configured".to_string()))?,
            (_, OutputMode::Value) => self
                .value
                .as_ref()
                .ok_or_else(|| DriverError("no value command configured".to_string()))?,
            (_, OutputMode::Volume) => self
                .volume
                .as_ref()
                .ok_or_else(|| DriverError("no volume command configured".to_string()))?,
        };

        let amount = command.amount.to_string();
        Ok(template
            .replace("{channel}", &channel.to_string())
            .replace("{duration}", &amount)
            .replace("{duty_cycle}", &amount)
            .replace("{value}", &amount)
            .replace("{volume}", &amount))
    }
}

/// Driver that runs a shell command per state change
pub struct CommandDriver {
    templates: CommandTemplates,
    channel_count: u32,
    timeout: Duration,
    states: Mutex<Vec<OutputState>>,
}

impl CommandDriver {
    pub fn new(templates: CommandTemplates, channel_count: u32) -> Self {
        Self {
            templates,
            channel_count,
            timeout: Duration::from_secs(30),
            states: Mutex::new(vec![OutputState::Unknown; channel_count as usize]),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl OutputDriver for CommandDriver {
    fn channel_count(&self) -> u32 {
        self.channel_count
    }

    async fn set(&self, channel: u32, command: &OutputCommand) -> Result<(), DriverError> {
        let line = self.templates.render(channel, command)?;
        debug!(channel, command = %line, "Running output command");

        let run = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&line)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| DriverError(format!("command timed out after {:?}", self.timeout)))?
            .map_err(|e| DriverError(format!("failed to spawn command: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DriverError(format!(
                "command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        if let Ok(mut states) = self.states.lock() {
            if let Some(state) = states.get_mut(channel as usize) {
                *state = command.state;
            }
        }
        Ok(())
    }

    async fn get_state(&self, channel: u32) -> OutputState {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(channel as usize).copied())
            .unwrap_or(OutputState::Unknown)
    }
}
