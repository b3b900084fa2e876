//! Daily time-window control of one engine.
//!
//! A [`WindowScheduler`] ticks on an interval and starts or stops its engine
//! so that it runs inside the configured window and rests outside it. Manual
//! actions that contradict the window are protected by a temporary
//! [`ScheduleOverride`] until the window next opens.

use chrono::{NaiveDateTime, NaiveTime};
use rc_core::clock::Clock;
use rc_core::config::ScheduleConfig;
use rc_core::types::ScheduleWindow;
use rc_engine::engine::EngineControl;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideMode {
    /// Keep the engine running although the window is closed.
    ForceRun,
    /// Keep the engine stopped although the window is open.
    SuppressRun,
}

/// A manual decision that ticks must not undo before `until`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleOverride {
    pub mode: OverrideMode,
    pub until: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub tick: Duration,
    /// Pause between stopping and starting the engine.
    pub transition_delay: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(30),
            transition_delay: Duration::from_millis(3000),
        }
    }
}

impl From<&ScheduleConfig> for SchedulerSettings {
    fn from(config: &ScheduleConfig) -> Self {
        Self {
            tick: Duration::from_secs(config.tick_secs),
            transition_delay: Duration::from_millis(config.transition_delay_ms),
        }
    }
}

/// Partial window change; `None` keeps the current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowUpdate {
    pub start: Option<NaiveTime>,
    pub end: Option<NaiveTime>,
    pub enabled: Option<bool>,
}

impl WindowUpdate {
    pub fn apply(&self, window: &mut ScheduleWindow) {
        if let Some(start) = self.start {
            window.start = start;
        }
        if let Some(end) = self.end {
            window.end = end;
        }
        if let Some(enabled) = self.enabled {
            window.enabled = enabled;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub enabled: bool,
    pub window: ScheduleWindow,
    pub in_window: bool,
    pub timer_running: bool,
    pub transitioning: bool,
    pub override_mode: Option<OverrideMode>,
    pub override_until: Option<NaiveDateTime>,
}

/// What a single tick decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Schedule disabled or manual-only.
    Inactive,
    Overridden(OverrideMode),
    /// Another transition was in progress.
    Busy,
    InSync,
    Transitioned { running: bool },
}

// ---------------------------------------------------------------------------
// WindowScheduler
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct WindowScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    engine: Arc<dyn EngineControl>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    window: Mutex<ScheduleWindow>,
    pause: Mutex<Option<ScheduleOverride>>,
    /// Held for the whole of a stop-delay-start sequence.
    transition: tokio::sync::Mutex<()>,
    timer: Mutex<Option<Timer>>,
}

struct Timer {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl WindowScheduler {
    pub fn new(
        engine: Arc<dyn EngineControl>,
        clock: Arc<dyn Clock>,
        window: ScheduleWindow,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                clock,
                settings,
                window: Mutex::new(window),
                pause: Mutex::new(None),
                transition: tokio::sync::Mutex::new(()),
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn window(&self) -> ScheduleWindow {
        *lock(&self.inner.window)
    }

    pub fn current_override(&self) -> Option<ScheduleOverride> {
        *lock(&self.inner.pause)
    }

    /// Start the tick timer. The first tick runs immediately. No-op when the
    /// timer is already running.
    pub fn start(&self) {
        let mut timer = lock(&self.inner.timer);
        if timer.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_timer(self.inner.clone(), stop_rx));
        *timer = Some(Timer { stop_tx, handle });
        debug!(tick_secs = self.inner.settings.tick.as_secs(), "schedule timer started");
    }

    /// Stop the tick timer. A tick already in progress runs to completion
    /// first. The engine itself is left alone.
    pub async fn stop(&self) {
        let Some(timer) = lock(&self.inner.timer).take() else {
            return;
        };
        timer.stop_tx.send_replace(true);
        if let Err(e) = timer.handle.await {
            warn!(error = %e, "schedule timer panicked");
        }
        debug!("schedule timer stopped");
    }

    pub fn timer_running(&self) -> bool {
        lock(&self.inner.timer).is_some()
    }

    /// Evaluate the window once.
    pub async fn tick(&self) -> TickOutcome {
        self.inner.tick(false).await
    }

    pub fn is_currently_in_window(&self) -> bool {
        let now = self.inner.clock.now_local();
        self.window().contains(now.time())
    }

    /// Keep the engine running until the window next opens.
    pub fn pause_until_next_window_start(&self) -> ScheduleOverride {
        self.set_override(OverrideMode::ForceRun)
    }

    /// Keep the engine stopped until the window next opens, which for a
    /// window that is open right now means tomorrow.
    pub fn pause_until_tomorrow(&self) -> ScheduleOverride {
        self.set_override(OverrideMode::SuppressRun)
    }

    fn set_override(&self, mode: OverrideMode) -> ScheduleOverride {
        let now = self.inner.clock.now_local();
        let pause = ScheduleOverride {
            mode,
            until: self.window().next_start_after(now),
        };
        *lock(&self.inner.pause) = Some(pause);
        info!(?mode, until = %pause.until, "schedule override installed");
        pause
    }

    /// Apply a window change.
    ///
    /// Any override is dropped first. Disabling a schedule that was enabled
    /// stops a running engine; every other change is evaluated right away.
    pub async fn update_window(&self, update: WindowUpdate) -> ScheduleWindow {
        let (was_enabled, window) = {
            let mut window = lock(&self.inner.window);
            let was_enabled = window.enabled;
            update.apply(&mut window);
            (was_enabled, *window)
        };
        *lock(&self.inner.pause) = None;
        info!(
            start = %window.start.format("%H:%M"),
            end = %window.end.format("%H:%M"),
            enabled = window.enabled,
            "schedule window updated"
        );

        if was_enabled && !window.enabled && self.inner.engine.is_running() {
            let _guard = self.inner.transition.lock().await;
            self.inner.transition_to(false).await;
        } else {
            self.inner.tick(true).await;
        }
        window
    }

    pub fn status(&self) -> SchedulerStatus {
        let window = self.window();
        let pause = self.current_override();
        SchedulerStatus {
            enabled: window.enabled,
            window,
            in_window: self.is_currently_in_window(),
            timer_running: self.timer_running(),
            transitioning: self.inner.transition.try_lock().is_err(),
            override_mode: pause.map(|p| p.mode),
            override_until: pause.map(|p| p.until),
        }
    }
}

impl Inner {
    async fn tick(&self, ignore_override: bool) -> TickOutcome {
        let window = *lock(&self.window);
        if !window.is_active() {
            return TickOutcome::Inactive;
        }
        let now = self.clock.now_local();

        {
            let mut pause = lock(&self.pause);
            if let Some(current) = *pause {
                if now >= current.until {
                    info!(mode = ?current.mode, "schedule override expired");
                    *pause = None;
                } else if !ignore_override {
                    return TickOutcome::Overridden(current.mode);
                }
            }
        }

        let target = window.contains(now.time());
        if target == self.engine.is_running() {
            return TickOutcome::InSync;
        }
        let Ok(_guard) = self.transition.try_lock() else {
            debug!("transition in progress, tick skipped");
            return TickOutcome::Busy;
        };
        self.transition_to(target).await;
        TickOutcome::Transitioned { running: target }
    }

    /// Stop, wait, then start when `run` is set. Callers hold `transition`.
    async fn transition_to(&self, run: bool) {
        if self.engine.is_running() {
            self.engine.stop().await;
        }
        if !self.settings.transition_delay.is_zero() {
            tokio::time::sleep(self.settings.transition_delay).await;
        }
        if run {
            self.engine.start().await;
        }
        info!(running = run, "schedule transition complete");
    }
}

async fn run_timer(inner: Arc<Inner>, mut stop_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(inner.settings.tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = stop_rx.wait_for(|stopped| *stopped) => break,
            _ = interval.tick() => {}
        }
        let outcome = inner.tick(false).await;
        debug!(?outcome, "schedule tick");
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
