//! Concurrency behaviour of the output arbiter

use hc_core::{Context, OutputCommand, OutputMode, OutputState};
use hc_output::{MemoryDriver, OutputArbiter, OutputDriver, RampOutcome, RampSpec};
use std::sync::Arc;
use std::time::Duration;

fn setup(latency: Duration) -> (Arc<OutputArbiter>, Arc<MemoryDriver>) {
    let arbiter = Arc::new(OutputArbiter::new());
    let driver = Arc::new(MemoryDriver::new(2).with_latency(latency));
    arbiter.register("fan", driver.clone());
    (arbiter, driver)
}

#[tokio::test]
async fn concurrent_commands_on_one_channel_never_overlap() {
    let (arbiter, driver) = setup(Duration::from_millis(5));

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let arbiter = arbiter.clone();
            tokio::spawn(async move {
                let duty = (i * 10) as f64;
                arbiter
                    .command(OutputCommand::pwm("fan", 0, duty))
                    .await
                    .unwrap()
            })
        })
        .collect();
    futures::future::join_all(tasks).await;

    assert_eq!(driver.max_in_flight(0), 1);
    assert_eq!(driver.history().len(), 8);

    // The recorded status is the command that reached the driver last
    let (_, last) = driver.history().pop().unwrap();
    let status = arbiter.status("fan", 0).await.unwrap().unwrap();
    assert_eq!(status.amount, last.amount);
}

#[tokio::test]
async fn channels_proceed_independently() {
    let (arbiter, driver) = setup(Duration::from_millis(20));

    let a = {
        let arbiter = arbiter.clone();
        tokio::spawn(async move { arbiter.command(OutputCommand::on("fan", 0)).await })
    };
    let b = {
        let arbiter = arbiter.clone();
        tokio::spawn(async move { arbiter.command(OutputCommand::on("fan", 1)).await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    assert_eq!(driver.get_state(0).await, OutputState::On);
    assert_eq!(driver.get_state(1).await, OutputState::On);
}

#[tokio::test(start_paused = true)]
async fn ramp_completes_at_end_duty() {
    let (arbiter, driver) = setup(Duration::ZERO);

    let ramp = arbiter
        .ramp(
            "fan",
            0,
            RampSpec {
                start_duty: 20.0,
                end_duty: 50.0,
                increment: 10.0,
                step_interval: Duration::from_secs(1),
            },
            Context::with_origin("pid_fan"),
        )
        .await
        .unwrap();

    assert_eq!(ramp.wait().await, RampOutcome::Completed);
    let duties: Vec<f64> = driver.history().iter().map(|(_, c)| c.amount).collect();
    assert_eq!(duties, vec![20.0, 30.0, 40.0, 50.0]);

    let status = arbiter.status("fan", 0).await.unwrap().unwrap();
    assert_eq!(status.requested_by, "pid_fan");
}

#[tokio::test(start_paused = true)]
async fn stop_command_preempts_ramp() {
    let (arbiter, driver) = setup(Duration::ZERO);

    let ramp = arbiter
        .ramp(
            "fan",
            0,
            RampSpec {
                start_duty: 0.0,
                end_duty: 100.0,
                increment: 5.0,
                step_interval: Duration::from_secs(1),
            },
            Context::with_origin("pid_fan"),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    arbiter
        .command(OutputCommand::off("fan", 0).with_context(Context::with_origin("stop")))
        .await
        .unwrap();

    let outcome = ramp.wait().await;
    assert!(matches!(outcome, RampOutcome::Preempted { last_duty: Some(d) } if d == 10.0));

    // Nothing from the ramp lands after the stop
    let (_, last) = driver.history().pop().unwrap();
    assert_eq!(last.state, OutputState::Off);
    assert_eq!(last.mode, OutputMode::Duration);
    assert_eq!(arbiter.state("fan", 0).await.unwrap(), OutputState::Off);
}

#[tokio::test]
async fn driver_failure_leaves_status_unchanged() {
    let (arbiter, driver) = setup(Duration::ZERO);
    arbiter.command(OutputCommand::on("fan", 1)).await.unwrap();

    driver.fail_channel(1, "bus timeout");
    let err = arbiter.command(OutputCommand::off("fan", 1)).await.unwrap_err();
    assert!(err.to_string().contains("bus timeout"));
    assert_eq!(arbiter.state("fan", 1).await.unwrap(), OutputState::On);
}

#[tokio::test(start_paused = true)]
async fn rejected_command_keeps_duration_timer() {
    let (arbiter, driver) = setup(Duration::ZERO);
    arbiter
        .command(OutputCommand::duration("fan", 0, 5.0))
        .await
        .unwrap();

    driver.fail_channel(0, "relay stuck");
    assert!(arbiter
        .command(OutputCommand::pwm("fan", 0, 30.0))
        .await
        .is_err());
    driver.heal_channel(0);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(arbiter.state("fan", 0).await.unwrap(), OutputState::Off);
    assert_eq!(driver.get_state(0).await, OutputState::Off);
}

#[tokio::test(start_paused = true)]
async fn rejected_ramp_start_keeps_duration_timer() {
    let (arbiter, driver) = setup(Duration::ZERO);
    arbiter
        .command(OutputCommand::duration("fan", 1, 5.0))
        .await
        .unwrap();

    driver.fail_channel(1, "relay stuck");
    let spec = RampSpec {
        start_duty: 0.0,
        end_duty: 50.0,
        increment: 10.0,
        step_interval: Duration::from_secs(1),
    };
    assert!(arbiter
        .ramp("fan", 1, spec, Context::with_origin("pid_fan"))
        .await
        .is_err());
    driver.heal_channel(1);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(arbiter.state("fan", 1).await.unwrap(), OutputState::Off);
}

#[tokio::test(start_paused = true)]
async fn last_successful_command_owns_the_timer() {
    let (arbiter, driver) = setup(Duration::ZERO);
    arbiter
        .command(OutputCommand::duration("fan", 0, 3.0))
        .await
        .unwrap();
    arbiter
        .command(OutputCommand::duration("fan", 0, 10.0))
        .await
        .unwrap();

    // The first timer is stale once the second command lands
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(arbiter.state("fan", 0).await.unwrap(), OutputState::On);

    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(arbiter.state("fan", 0).await.unwrap(), OutputState::Off);
    assert_eq!(driver.history().len(), 3);
}
