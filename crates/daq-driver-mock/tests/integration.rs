//! Positioners driving simulated devices end to end.
//!
//! Every test runs on a paused Tokio clock; device dynamics and positioner
//! timers advance together and deterministically.

use daq_driver_mock::*;
use daq_positioner::{
    load_config_str, MoveOptions, MoveState, PositionerBuilder, PositionerError, StopReason,
};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_temperature_settles_before_done() {
    let tc = MockTemperatureController::builder()
        .initial(300.0)
        .time_constant(Duration::from_secs(1))
        .build()
        .unwrap();
    let cryostat = PositionerBuilder::from_config(&tc.positioner_config("cryostat"), &tc.points())
        .unwrap()
        .build()
        .unwrap();

    let status = cryostat
        .move_to(
            200.0,
            MoveOptions::default()
                .tolerance(0.05)
                .settle_time(Duration::from_secs(2)),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(status.state(), MoveState::Pending);

    status.wait(Some(Duration::from_secs(60))).await.unwrap();
    assert!(cryostat.done());
    assert!((cryostat.position().unwrap() - 200.0).abs() <= 0.05);
    // ln(100 / 0.05) time constants to enter tolerance, then the settle time.
    assert!(status.elapsed() >= Duration::from_millis(9_500));
}

#[tokio::test(start_paused = true)]
async fn test_amplifier_heartbeat_does_not_complete_move() {
    let amp = MockAmplifier::new().unwrap();
    let gain = PositionerBuilder::from_config(&amp.positioner_config("gain"), &amp.points())
        .unwrap()
        .build()
        .unwrap();

    let status = gain.move_to(20.0, MoveOptions::default()).unwrap();

    // Several heartbeats of the old gain arrive before the latency expires.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(status.state(), MoveState::Pending);
    assert!(!gain.done());

    status.wait(None).await.unwrap();
    assert!(status.elapsed() >= Duration::from_millis(250));
    assert_eq!(gain.position(), Some(20.0));

    // Heartbeats after completion leave the resolved move untouched.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(status.state(), MoveState::Done);
    assert_eq!(gain.active_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_motor_waits_for_done_flag() {
    let motor = MockSoftMotor::builder().velocity(10.0).build().unwrap();
    let axis = PositionerBuilder::from_config(&motor.positioner_config("axis"), &motor.points())
        .unwrap()
        .build()
        .unwrap();

    let status = axis.move_to(5.0, MoveOptions::default()).unwrap();
    status.wait(Some(Duration::from_secs(5))).await.unwrap();

    assert!(status.elapsed() >= Duration::from_millis(480));
    assert_eq!(axis.position(), Some(5.0));
    assert!(!motor.is_moving());
    assert!(axis.done());
}

#[tokio::test(start_paused = true)]
async fn test_motor_stop_resolves_stopped() {
    let motor = MockSoftMotor::builder().velocity(10.0).build().unwrap();
    let axis = PositionerBuilder::from_config(&motor.positioner_config("axis"), &motor.points())
        .unwrap()
        .build()
        .unwrap();

    let status = axis.move_to(5.0, MoveOptions::default()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    axis.stop().unwrap();

    let result = status.wait(Some(Duration::from_secs(1))).await;
    assert_eq!(result, Err(PositionerError::Stopped(StopReason::Requested)));
    assert_eq!(status.state(), MoveState::Stopped);
    assert!(!axis.done());

    let halted = axis.position().unwrap();
    assert!(halted > 0.0 && halted < 5.0, "halted = {halted}");
}

#[tokio::test(start_paused = true)]
async fn test_motor_new_move_supersedes_old() {
    let motor = MockSoftMotor::builder().velocity(10.0).build().unwrap();
    let axis = PositionerBuilder::from_config(&motor.positioner_config("axis"), &motor.points())
        .unwrap()
        .build()
        .unwrap();

    let first = axis.move_to(5.0, MoveOptions::default()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = axis.move_to(-1.0, MoveOptions::default()).unwrap();

    assert_eq!(
        first.wait(None).await,
        Err(PositionerError::Stopped(StopReason::Superseded))
    );
    second.wait(Some(Duration::from_secs(2))).await.unwrap();
    assert_eq!(axis.position(), Some(-1.0));
    assert_eq!(axis.generation(), second.generation());
}

#[tokio::test(start_paused = true)]
async fn test_injected_write_failure_fails_move() {
    let errors = ErrorConfig::scenario(ErrorScenario::FailAfterN {
        operation: "set_temperature",
        count: 1,
    });
    let tc = MockTemperatureController::builder()
        .mode(MockMode::Instant)
        .errors(errors.clone())
        .build()
        .unwrap();
    let cryostat = PositionerBuilder::from_config(&tc.positioner_config("cryostat"), &tc.points())
        .unwrap()
        .build()
        .unwrap();

    cryostat
        .move_to(77.0, MoveOptions::default())
        .unwrap()
        .wait(None)
        .await
        .unwrap();
    assert!(cryostat.done());

    let status = cryostat.move_to(4.2, MoveOptions::default()).unwrap();
    match status.wait(None).await {
        Err(PositionerError::WriteFailed { address, .. }) => assert_eq!(address, "TC1:SP"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(status.state(), MoveState::Failed);
    assert!(!cryostat.done());
    assert_eq!(tc.temperature(), Some(77.0));

    errors.reset();
    cryostat
        .move_to(4.2, MoveOptions::default())
        .unwrap()
        .wait(None)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_positioner_from_toml_binds_mock_points() {
    let motor = MockSoftMotor::builder()
        .prefix("SAMPLE:Y")
        .velocity(20.0)
        .build()
        .unwrap();
    let config = load_config_str(
        r#"
        name = "sample_y"
        setpoint_point = "SAMPLE:Y.VAL"
        readback_points = ["SAMPLE:Y.RBV"]
        done_point = "SAMPLE:Y.DMOV"
        stop_point = "SAMPLE:Y.STOP"
        tolerance = 0.01
        timeout = "2s"
        "#,
    )
    .unwrap();
    let axis = PositionerBuilder::from_config(&config, &motor.points())
        .unwrap()
        .build()
        .unwrap();

    let status = axis.move_to(-2.0, MoveOptions::default()).unwrap();
    status.wait(None).await.unwrap();
    assert_eq!(axis.position(), Some(-2.0));

    let unknown = load_config_str(
        r#"
        name = "sample_z"
        setpoint_point = "SAMPLE:Z.VAL"
        readback_points = ["SAMPLE:Z.RBV"]
        "#,
    )
    .unwrap();
    assert!(matches!(
        PositionerBuilder::from_config(&unknown, &motor.points()),
        Err(PositionerError::Configuration(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_motor_timeout_when_too_slow() {
    let motor = MockSoftMotor::builder().velocity(1.0).build().unwrap();
    let axis = PositionerBuilder::from_config(&motor.positioner_config("axis"), &motor.points())
        .unwrap()
        .build()
        .unwrap();

    let status = axis
        .move_to(50.0, MoveOptions::default().timeout(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(
        status.wait(None).await,
        Err(PositionerError::TimedOut {
            timeout: Duration::from_secs(2)
        })
    );
    assert!(motor.is_moving());
    motor.shutdown();
}
