mod common;

use common::{RecordingHost, Timeline};
use resin_host::config::MotionConfig;
use resin_host::motion::{Axis, IdleStatus, JobSignal, MotionError, MotionPort};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

fn port() -> (MotionPort, Arc<RecordingHost>, Timeline) {
    let timeline = Timeline::default();
    let host = Arc::new(RecordingHost::new(timeline.clone()));
    let port = MotionPort::new(host.clone(), &MotionConfig::default());
    (port, host, timeline)
}

#[tokio::test(start_paused = true)]
async fn test_absolute_moves_are_clamped_and_cached() {
    let (mut port, _host, timeline) = port();

    let status = assert_ok!(port.move_absolute(Axis::X, 200.0, 1500.0).await);
    assert_eq!(status, IdleStatus::Confirmed);
    assert_eq!(port.state().current_x, 125.0);

    assert_ok!(port.move_absolute(Axis::Z, -2.0, 150.0).await);
    assert_eq!(port.state().current_z, 0.0);

    assert_ok!(port.move_absolute(Axis::Z, 12.3456, 150.0).await);
    assert_eq!(
        timeline.without_flushes(),
        vec!["G90\nG1 X125.0 F1500", "G90\nG0 Z0.000 F150", "G90\nG0 Z12.346 F150"]
    );
    assert_eq!(timeline.count("M400"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failed_move_leaves_cache_unchanged() {
    let (mut port, host, timeline) = port();
    assert_ok!(port.move_absolute(Axis::Z, 10.0, 150.0).await);

    host.fail_when("Z20");
    let err = assert_err!(port.move_absolute(Axis::Z, 20.0, 150.0).await);
    match err {
        MotionError::Command { command, .. } => assert_eq!(command, "G90 | G0 Z20.000 F150"),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(port.state().current_z, 10.0);
    // No queue flush after a rejected move
    assert_eq!(timeline.count("M400"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_feed_rate_checked_before_sending() {
    let (mut port, _host, timeline) = port();
    assert!(matches!(
        port.move_absolute(Axis::X, 50.0, 0.0).await,
        Err(MotionError::InvalidFeedRate { axis: Axis::X, .. })
    ));
    assert!(timeline.entries().is_empty());

    assert_ok!(port.move_absolute(Axis::Z, 5.0, 99999.0).await);
    assert_eq!(timeline.entries()[0], "G90\nG0 Z5.000 F1200");
}

#[tokio::test(start_paused = true)]
async fn test_wait_idle_degrades_after_failed_attempts() {
    let (mut port, host, timeline) = port();
    host.fail_when("M400");

    let started = Instant::now();
    let status = assert_ok!(port.move_absolute(Axis::X, 125.0, 1500.0).await);
    let elapsed = started.elapsed();

    assert_eq!(status, IdleStatus::Degraded);
    assert_eq!(timeline.count("M400"), 3);
    // 2 x 1s backoff + 2s fallback + 5s expected travel
    assert!(elapsed >= Duration::from_secs(9), "elapsed {:?}", elapsed);
    assert_eq!(port.state().current_x, 125.0);
}

#[tokio::test(start_paused = true)]
async fn test_wait_idle_recovers_within_attempts() {
    let (port, host, timeline) = port();
    host.fail_next("M400", 2);

    let started = Instant::now();
    assert_eq!(port.wait_idle(Duration::from_secs(10)).await, IdleStatus::Confirmed);
    assert_eq!(timeline.count("M400"), 3);
    // 2 x 1s backoff + 0.5s settle
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(2500) && elapsed < Duration::from_millis(2600));
}

#[tokio::test(start_paused = true)]
async fn test_home_sets_origin() {
    let (mut port, host, _timeline) = port();
    assert_ok!(port.move_absolute(Axis::X, 60.0, 1500.0).await);
    assert!(!port.state().x_homed);

    assert_ok!(port.home(Axis::X).await);
    assert!(port.state().x_homed);
    assert_eq!(port.state().current_x, 0.0);

    host.fail_when("G28 Z");
    let err = assert_err!(port.home(Axis::Z).await);
    assert!(matches!(err, MotionError::Homing { axis: Axis::Z, .. }));
    assert!(!port.state().z_homed);
}

#[tokio::test(start_paused = true)]
async fn test_move_relative_limits_and_clears_homed() {
    let (mut port, _host, timeline) = port();
    assert_ok!(port.home(Axis::Z).await);
    assert_ok!(port.move_absolute(Axis::Z, 78.0, 150.0).await);

    assert_ok!(port.move_relative(Axis::Z, 5.0, 300.0).await);
    assert_eq!(port.state().current_z, 80.0);
    assert!(!port.state().z_homed);
    assert!(timeline.entries().contains(&"G91\nG1 Z2.000 F300\nG90".to_string()));

    // Already at the limit: nothing is sent
    let before = timeline.entries().len();
    assert_eq!(assert_ok!(port.move_relative(Axis::Z, 1.0, 300.0).await), IdleStatus::Confirmed);
    assert_eq!(timeline.entries().len(), before);
}

#[tokio::test(start_paused = true)]
async fn test_quick_stop_clears_homed_flags() {
    let (mut port, _host, timeline) = port();
    assert_ok!(port.home(Axis::Z).await);
    assert_ok!(port.home(Axis::X).await);

    assert_ok!(port.quick_stop().await);
    assert!(!port.state().z_homed);
    assert!(!port.state().x_homed);
    assert_eq!(timeline.entries().last().map(String::as_str), Some("M410"));
    assert_eq!(timeline.count("emergency_stop"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_emergency_paths() {
    let (mut port, _host, timeline) = port();
    assert_ok!(port.home(Axis::Z).await);

    let handle = port.emergency_handle();
    assert_ok!(handle.trigger().await);
    assert_eq!(timeline.count("emergency_stop"), 1);

    assert_ok!(port.emergency_shutdown().await);
    assert_eq!(timeline.count("emergency_stop"), 2);
    assert!(!port.state().z_homed);
}

#[tokio::test(start_paused = true)]
async fn test_job_signals_and_dwell() {
    let (port, _host, timeline) = port();
    assert_ok!(port.signal_job(JobSignal::Paused).await);
    assert_ok!(port.signal_job(JobSignal::Resumed).await);
    assert_ok!(port.signal_job(JobSignal::Cancelled).await);
    assert_ok!(port.dwell(500).await);
    assert_ok!(port.dwell(0).await);

    assert_eq!(
        timeline.entries(),
        vec![
            "SET_IDLE_TIMEOUT TIMEOUT=86400",
            "SET_IDLE_TIMEOUT TIMEOUT=600",
            "SET_IDLE_TIMEOUT TIMEOUT=600",
            "G4 P500",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_empty_signal_script_is_skipped() {
    let timeline = Timeline::default();
    let host = Arc::new(RecordingHost::new(timeline.clone()));
    let mut config = MotionConfig::default();
    config.job_signals.finished = String::new();
    let port = MotionPort::new(host, &config);

    assert_ok!(port.signal_job(JobSignal::Finished).await);
    assert!(timeline.entries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_connect_and_sync_position() {
    let (mut port, host, timeline) = port();
    assert_ok!(port.connect().await);
    assert_eq!(timeline.entries(), vec!["connect"]);

    *host.position.lock().unwrap() = [42.0, 0.0, 7.5, 0.0];
    let state = assert_ok!(port.sync_position().await);
    assert_eq!(state.current_x, 42.0);
    assert_eq!(state.current_z, 7.5);
    assert_eq!(port.state().current_z, 7.5);

    host.fail_when("connect");
    assert!(matches!(port.connect().await, Err(MotionError::Connectivity(_))));
}
