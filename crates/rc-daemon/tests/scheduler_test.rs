mod common;

use chrono::TimeDelta;
use common::{at, day_window, eventually, hm, FakeEngine};
use rc_core::clock::ManualClock;
use rc_core::types::ScheduleWindow;
use rc_daemon::scheduler::{
    OverrideMode, SchedulerSettings, TickOutcome, WindowScheduler, WindowUpdate,
};
use rc_engine::engine::EngineControl;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn scheduler(
    engine: &Arc<FakeEngine>,
    clock: &Arc<ManualClock>,
    window: ScheduleWindow,
) -> WindowScheduler {
    WindowScheduler::new(
        engine.clone(),
        clock.clone(),
        window,
        SchedulerSettings {
            tick: Duration::from_secs(3600),
            transition_delay: Duration::ZERO,
        },
    )
}

#[tokio::test]
async fn follows_the_window() {
    let engine = FakeEngine::new();
    let clock = Arc::new(ManualClock::new(at(3, 7, 59)));
    let s = scheduler(&engine, &clock, day_window());

    assert_eq!(s.tick().await, TickOutcome::InSync);
    clock.set(at(3, 8, 0));
    assert_eq!(s.tick().await, TickOutcome::Transitioned { running: true });
    assert!(engine.is_running());
    assert_eq!(s.tick().await, TickOutcome::InSync);

    clock.set(at(3, 22, 0));
    assert_eq!(s.tick().await, TickOutcome::Transitioned { running: false });
    assert!(!engine.is_running());
    assert_eq!(engine.starts.load(Ordering::SeqCst), 1);
    assert_eq!(engine.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn forced_run_survives_window_close_until_next_open() {
    let engine = FakeEngine::new();
    let clock = Arc::new(ManualClock::new(at(3, 21, 0)));
    let s = scheduler(&engine, &clock, day_window());
    engine.start().await;

    let pause = s.pause_until_next_window_start();
    assert_eq!(pause.mode, OverrideMode::ForceRun);
    // The window is open at 21:00, so it next opens tomorrow.
    assert_eq!(pause.until, at(4, 8, 0));

    clock.set(at(3, 23, 0));
    assert_eq!(s.tick().await, TickOutcome::Overridden(OverrideMode::ForceRun));
    assert!(engine.is_running());

    clock.set(at(4, 8, 0));
    assert_eq!(s.tick().await, TickOutcome::InSync);
    assert!(s.current_override().is_none());
    assert!(engine.is_running());
}

#[tokio::test]
async fn forced_stop_holds_until_tomorrow() {
    let engine = FakeEngine::new();
    let clock = Arc::new(ManualClock::new(at(3, 10, 0)));
    let s = scheduler(&engine, &clock, day_window());
    assert_eq!(s.tick().await, TickOutcome::Transitioned { running: true });

    let pause = s.pause_until_tomorrow();
    assert_eq!(pause.until, at(4, 8, 0));
    engine.stop().await;

    clock.set(at(3, 15, 0));
    assert_eq!(s.tick().await, TickOutcome::Overridden(OverrideMode::SuppressRun));
    assert!(!engine.is_running());

    clock.set(at(4, 8, 1));
    assert_eq!(s.tick().await, TickOutcome::Transitioned { running: true });
    assert!(s.current_override().is_none());
}

#[tokio::test]
async fn manual_only_and_disabled_windows_never_act() {
    let engine = FakeEngine::new();
    let clock = Arc::new(ManualClock::new(at(3, 10, 0)));

    let manual = scheduler(&engine, &clock, ScheduleWindow::new(hm(8, 0), hm(8, 0), true));
    assert_eq!(manual.tick().await, TickOutcome::Inactive);

    let disabled = scheduler(&engine, &clock, ScheduleWindow::new(hm(8, 0), hm(22, 0), false));
    assert_eq!(disabled.tick().await, TickOutcome::Inactive);
    assert_eq!(engine.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn overnight_window_wraps_midnight() {
    let engine = FakeEngine::new();
    let clock = Arc::new(ManualClock::new(at(3, 23, 30)));
    let s = scheduler(&engine, &clock, ScheduleWindow::new(hm(22, 0), hm(6, 0), true));

    assert_eq!(s.tick().await, TickOutcome::Transitioned { running: true });
    clock.set(at(4, 5, 59));
    assert_eq!(s.tick().await, TickOutcome::InSync);
    clock.set(at(4, 6, 0));
    assert_eq!(s.tick().await, TickOutcome::Transitioned { running: false });
}

#[tokio::test]
async fn update_window_clears_override_and_reevaluates() {
    let engine = FakeEngine::new();
    let clock = Arc::new(ManualClock::new(at(3, 23, 0)));
    let s = scheduler(&engine, &clock, day_window());
    s.pause_until_next_window_start();
    assert!(s.current_override().is_some());

    let window = s
        .update_window(WindowUpdate {
            end: Some(hm(23, 30)),
            ..Default::default()
        })
        .await;
    assert_eq!(window.end, hm(23, 30));
    assert!(s.current_override().is_none());
    // 23:00 is now inside the window.
    assert!(engine.is_running());
}

#[tokio::test]
async fn disabling_a_running_schedule_stops_the_engine() {
    let engine = FakeEngine::new();
    let clock = Arc::new(ManualClock::new(at(3, 10, 0)));
    let s = scheduler(&engine, &clock, day_window());
    s.tick().await;
    assert!(engine.is_running());

    let window = s
        .update_window(WindowUpdate {
            enabled: Some(false),
            ..Default::default()
        })
        .await;
    assert!(!window.enabled);
    assert!(!engine.is_running());
    assert!(!s.status().enabled);
}

#[tokio::test]
async fn concurrent_tick_reports_busy() {
    let engine = FakeEngine::new();
    *engine.start_delay.lock().unwrap() = Duration::from_millis(200);
    let clock = Arc::new(ManualClock::new(at(3, 10, 0)));
    let s = scheduler(&engine, &clock, day_window());

    let first = {
        let s = s.clone();
        tokio::spawn(async move { s.tick().await })
    };
    let probe = s.clone();
    assert!(eventually(Duration::from_secs(1), || probe.status().transitioning).await);
    assert_eq!(s.tick().await, TickOutcome::Busy);

    assert_eq!(first.await.unwrap(), TickOutcome::Transitioned { running: true });
    assert_eq!(engine.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn timer_ticks_immediately_and_stops() {
    let engine = FakeEngine::new();
    let clock = Arc::new(ManualClock::new(at(3, 10, 0)));
    let s = scheduler(&engine, &clock, day_window());

    s.start();
    s.start();
    assert!(s.timer_running());
    let probe = engine.clone();
    assert!(eventually(Duration::from_secs(1), || probe.is_running()).await);

    s.stop().await;
    assert!(!s.timer_running());
    // Stopping the timer leaves the engine alone.
    assert!(engine.is_running());
    assert_eq!(engine.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn override_expiry_is_checked_against_the_clock() {
    let engine = FakeEngine::new();
    let clock = Arc::new(ManualClock::new(at(3, 7, 0)));
    let s = scheduler(&engine, &clock, day_window());
    // Before the window opens today, the next start is today.
    assert_eq!(s.pause_until_next_window_start().until, at(3, 8, 0));

    clock.advance(TimeDelta::minutes(59));
    assert!(matches!(s.tick().await, TickOutcome::Overridden(_)));
    clock.advance(TimeDelta::minutes(1));
    assert_eq!(s.tick().await, TickOutcome::Transitioned { running: true });
}
