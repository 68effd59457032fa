use crate::conditional::ConditionalController;
use crate::controller::Controller;
use crate::derived::{
    DifferenceController, RedundancyController, StatisticsController, VerificationController,
    VpdController,
};
use crate::function::{AutotuneController, BangBangController, BangBangPwmController};
use crate::input::{sensor_for, InputController};
use crate::pid::PidController;
use crate::trigger::{
    DailyTimePointTrigger, DailyTimeSpanTrigger, DurationTimerTrigger, OutputStateTrigger,
};
use crate::{ControllerError, ControllerResult};
use hc_config::{ControllerConfig, ControllerOptions};

/// Build the controller for a configuration
pub fn build_controller(config: &ControllerConfig) -> ControllerResult<Box<dyn Controller>> {
    if !(config.period.is_finite() && config.period > 0.0) {
        return Err(ControllerError::Config(format!(
            "controller {} has period {}",
            config.id, config.period
        )));
    }

    let controller: Box<dyn Controller> = match &config.options {
        ControllerOptions::Input(o) => Box::new(InputController::new(sensor_for(&o.sensor))),
        ControllerOptions::Pid(o) => Box::new(PidController::new(o.clone())),
        ControllerOptions::BangBang(o) => Box::new(BangBangController::new(o.clone())),
        ControllerOptions::BangBangPwm(o) => Box::new(BangBangPwmController::new(o.clone())),
        ControllerOptions::Autotune(o) => {
            Box::new(AutotuneController::new(o.clone(), config.period))
        }
        ControllerOptions::Statistics(o) => Box::new(StatisticsController::new(o.clone())),
        ControllerOptions::Difference(o) => Box::new(DifferenceController::new(o.clone())),
        ControllerOptions::Redundancy(o) => Box::new(RedundancyController::new(o.clone())),
        ControllerOptions::Verification(o) => Box::new(VerificationController::new(o.clone())),
        ControllerOptions::Vpd(o) => Box::new(VpdController::new(o.clone())),
        ControllerOptions::Conditional(o) => Box::new(ConditionalController::new(o.clone())),
        ControllerOptions::TimerDuration(o) => Box::new(DurationTimerTrigger::new(o.clone())),
        ControllerOptions::TimerDailyTimePoint(o) => {
            Box::new(DailyTimePointTrigger::new(o.clone()))
        }
        ControllerOptions::TimerDailyTimeSpan(o) => Box::new(DailyTimeSpanTrigger::new(o.clone())),
        ControllerOptions::OutputState(o) => Box::new(OutputStateTrigger::new(o.clone())),
    };
    Ok(controller)
}
