//! End-to-end controller behavior against a simulated Huanyang drive

mod support;

use std::sync::Arc;
use std::time::Duration;

use spindlesrv::protocol::huanyang::rpm_to_frequency;
use spindlesrv::{Huanyang, MachineContext, MachineState, SpindleState, VfdController};
use support::{test_config, SimulatedDrive};

async fn start(drive: &SimulatedDrive) -> (VfdController, Arc<MachineState>) {
    let machine = Arc::new(MachineState::new());
    let controller = VfdController::try_init(
        &test_config(),
        Huanyang::new(),
        drive.boxed(),
        machine.clone(),
    )
    .await
    .unwrap();
    (controller, machine)
}

/// Paused-clock dwell check with a millisecond of timer slack
fn assert_dwell(elapsed: Duration, expected_ms: u64) {
    let expected = Duration::from_millis(expected_ms);
    assert!(
        elapsed >= expected && elapsed <= expected + Duration::from_millis(1),
        "dwell {:?}, expected {:?}",
        elapsed,
        expected
    );
}

async fn run_for(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn test_spindle_reaches_commanded_state() {
    let drive = SimulatedDrive::new(0x01);
    let (controller, machine) = start(&drive).await;
    assert!(controller.is_enabled());
    assert!(drive.is_open());

    controller.set_state(SpindleState::Clockwise, 12000).await;
    run_for(2000).await;

    assert!(drive.is_running());
    assert!(!drive.is_reverse());
    assert_eq!(drive.frequency(), 20000);
    assert!(controller.is_healthy());
    assert!(!machine.is_alarmed());
    assert_eq!(machine.spindle_speed(), 12000);

    let status = controller.last_status().unwrap();
    assert_eq!(status.configured_state, SpindleState::Clockwise);
    assert_eq!(status.actual_state, SpindleState::Clockwise);
    assert_eq!(status.configured_rpm, 12000);

    controller.stop().await;
    run_for(2000).await;
    assert!(!drive.is_running());
    assert!(!machine.is_alarmed());
}

#[tokio::test(start_paused = true)]
async fn test_reverse_and_speed_change() {
    let drive = SimulatedDrive::new(0x01);
    let (controller, machine) = start(&drive).await;

    controller
        .set_state(SpindleState::CounterClockwise, 10000)
        .await;
    run_for(1000).await;
    assert!(drive.is_running());
    assert!(drive.is_reverse());
    assert_eq!(drive.frequency(), rpm_to_frequency(10000));

    // Rounded frequency reads back within tolerance: no alarm
    assert_eq!(controller.set_rpm(18000), 18000);
    run_for(1000).await;
    assert_eq!(drive.frequency(), 30000);
    assert!(!machine.is_alarmed());
}

#[tokio::test(start_paused = true)]
async fn test_latest_command_wins() {
    let drive = SimulatedDrive::new(0x01);
    let (controller, machine) = start(&drive).await;

    controller.set_state(SpindleState::Clockwise, 12000).await;
    controller.set_rpm(15000);
    controller.set_rpm(9000);
    run_for(1000).await;

    assert_eq!(drive.frequency(), rpm_to_frequency(9000));
    assert_eq!(controller.last_status().unwrap().configured_rpm, 9000);
    assert!(!machine.is_alarmed());
}

#[tokio::test(start_paused = true)]
async fn test_drive_ignoring_commands_raises_alarm() {
    let drive = SimulatedDrive::new(0x01);
    drive.set_ignore_commands(true);
    let (controller, machine) = start(&drive).await;

    controller.set_state(SpindleState::Clockwise, 12000).await;
    run_for(1000).await;

    assert!(machine.is_alarmed());
    assert_eq!(machine.reset_count(), 1);
    assert!(!drive.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_alarm_keeps_commanding_stop() {
    let drive = SimulatedDrive::new(0x01);
    let (controller, machine) = start(&drive).await;

    controller.set_state(SpindleState::Clockwise, 12000).await;
    run_for(1000).await;
    assert!(drive.is_running());

    machine.raise_spindle_control_alarm();
    run_for(1000).await;

    assert!(!drive.is_running());
    assert_eq!(drive.frequency(), 0);
    assert_eq!(controller.get_state(), SpindleState::Disabled);
    assert_eq!(machine.spindle_speed(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cleared_alarm_does_not_restart_spindle() {
    let drive = SimulatedDrive::new(0x01);
    let (controller, machine) = start(&drive).await;

    controller.set_state(SpindleState::Clockwise, 12000).await;
    run_for(1000).await;
    machine.raise_spindle_control_alarm();
    run_for(500).await;
    assert!(!drive.is_running());

    machine.clear_alarm();
    run_for(1000).await;

    assert!(!drive.is_running());
    assert_eq!(drive.frequency(), 0);
    assert!(!machine.is_alarmed());
    assert_eq!(machine.reset_count(), 1);

    // A fresh command spins it up again
    controller.set_state(SpindleState::Clockwise, 12000).await;
    run_for(1000).await;
    assert!(drive.is_running());
    assert!(!machine.is_alarmed());
}

#[tokio::test(start_paused = true)]
async fn test_mismatch_alarm_cleared_without_second_reset() {
    let drive = SimulatedDrive::new(0x01);
    drive.set_ignore_commands(true);
    let (controller, machine) = start(&drive).await;

    controller.set_state(SpindleState::Clockwise, 12000).await;
    run_for(1000).await;
    assert!(machine.is_alarmed());
    assert_eq!(controller.get_state(), SpindleState::Disabled);

    drive.set_ignore_commands(false);
    machine.clear_alarm();
    run_for(2000).await;

    assert!(!machine.is_alarmed());
    assert_eq!(machine.reset_count(), 1);
    assert!(!drive.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_lost_port_is_reopened_and_stop_delivered() {
    let drive = SimulatedDrive::new(0x01);
    let (controller, machine) = start(&drive).await;

    controller.set_state(SpindleState::Clockwise, 12000).await;
    run_for(1000).await;
    assert!(drive.is_running());

    drive.disconnect();
    controller.stop().await;
    run_for(1000).await;

    assert!(drive.is_open());
    assert!(!drive.is_running());
    assert!(controller.is_healthy());
    assert!(!machine.is_alarmed());
}

#[tokio::test(start_paused = true)]
async fn test_forced_stop_reaches_drive_once_port_returns() {
    let drive = SimulatedDrive::new(0x01);
    let (controller, machine) = start(&drive).await;

    controller.set_state(SpindleState::Clockwise, 12000).await;
    run_for(1000).await;

    drive.set_open_failure(true);
    drive.disconnect();
    run_for(2000).await;
    assert!(!controller.is_healthy());
    assert!(machine.is_alarmed());
    // Unreachable, still turning
    assert!(drive.is_running());

    drive.set_open_failure(false);
    run_for(2000).await;
    assert!(drive.is_open());
    assert!(!drive.is_running());
    assert_eq!(drive.frequency(), 0);
    assert!(controller.is_healthy());
    assert_eq!(machine.reset_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_silent_drive_when_idle_is_unhealthy_without_alarm() {
    let drive = SimulatedDrive::new(0x01);
    drive.set_silent(true);
    let (controller, machine) = start(&drive).await;

    run_for(1000).await;
    assert!(!controller.is_healthy());
    assert!(!machine.is_alarmed());
    assert!(controller.last_status().is_none());

    drive.set_silent(false);
    run_for(1000).await;
    assert!(controller.is_healthy());
    assert!(!machine.is_alarmed());
}

#[tokio::test(start_paused = true)]
async fn test_spin_request_over_dead_link_raises_alarm() {
    let drive = SimulatedDrive::new(0x01);
    drive.set_silent(true);
    let (controller, machine) = start(&drive).await;
    run_for(500).await;

    controller.set_state(SpindleState::Clockwise, 12000).await;
    run_for(1000).await;

    assert!(machine.is_alarmed());
    assert!(!drive.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_wrong_address_is_unhealthy() {
    let drive = SimulatedDrive::new(0x02);
    let (controller, machine) = start(&drive).await;

    run_for(1000).await;
    assert!(!controller.is_healthy());
    assert!(!machine.is_alarmed());
    assert!(drive.frame_count() > 0);
}

#[tokio::test(start_paused = true)]
async fn test_drop_stops_polling() {
    let drive = SimulatedDrive::new(0x01);
    let (controller, _machine) = start(&drive).await;
    run_for(500).await;
    assert!(controller.poll_count() > 0);

    drop(controller);
    run_for(100).await;
    let frames = drive.frame_count();
    run_for(1000).await;
    assert_eq!(drive.frame_count(), frames);
}

#[tokio::test(start_paused = true)]
async fn test_dwell_uses_configured_delays() {
    let drive = SimulatedDrive::new(0x01);
    let machine = Arc::new(MachineState::new());
    let mut config = test_config();
    config.spindle.spinup_delay_ms = 3000;
    config.spindle.spindown_delay_ms = 1500;
    let controller = VfdController::try_init(&config, Huanyang::new(), drive.boxed(), machine)
        .await
        .unwrap();

    let start = tokio::time::Instant::now();
    controller.set_state(SpindleState::Clockwise, 12000).await;
    assert_dwell(start.elapsed(), 3000);
    // Spindle is up by the time the dwell ends
    assert!(drive.is_running());

    let start = tokio::time::Instant::now();
    controller
        .set_state(SpindleState::CounterClockwise, 12000)
        .await;
    assert_dwell(start.elapsed(), 3000);

    let start = tokio::time::Instant::now();
    controller.stop().await;
    assert_dwell(start.elapsed(), 1500);
}
