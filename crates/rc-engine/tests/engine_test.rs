mod common;

use common::{eventually, FakeConnector, FakePlatform};
use rc_core::config::PlatformConfig;
use rc_core::types::{Credentials, Rollcall};
use rc_engine::engine::{
    AccountEvent, AutoSignEngine, DispatchOutcome, EngineContext, EngineControl, EngineSettings,
};
use rc_engine::state_machine::EngineState;
use rc_telemetry::account_log::RecordingNotifier;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Harness {
    engine: AutoSignEngine,
    platform: Arc<FakePlatform>,
    connector: Arc<FakeConnector>,
    notifier: Arc<RecordingNotifier>,
    events: flume::Receiver<AccountEvent>,
    account_id: Uuid,
}

fn cookie() -> Credentials {
    Credentials::Cookie {
        username: "3200100001".into(),
        cookie: "session=abc".into(),
    }
}

fn password() -> Credentials {
    Credentials::Password {
        username: "3200100001".into(),
        password: "hunter2".into(),
    }
}

fn harness(platform: Arc<FakePlatform>, credentials: Credentials, cooldown: Duration) -> Harness {
    let connector = FakeConnector::new(platform.clone());
    let (tx, rx) = flume::unbounded();
    let (logger, notifier) = common::logger();
    let account_id = Uuid::new_v4();
    let engine = AutoSignEngine::new(
        account_id,
        credentials,
        EngineContext {
            connector: connector.clone(),
            platform: PlatformConfig::default(),
            beacons: common::beacons(),
            events: tx,
        },
        EngineSettings {
            cooldown,
            preferred_beacon: Some("ZJGD1".into()),
            ..Default::default()
        },
        logger,
    );
    Harness {
        engine,
        platform,
        connector,
        notifier,
        events: rx,
        account_id,
    }
}

fn rollcall(value: serde_json::Value) -> Rollcall {
    serde_json::from_value(value).unwrap()
}

#[tokio::test]
async fn start_poll_and_stop() {
    let platform = FakePlatform::new().with_device(120.089136, 30.302331);
    platform.set_rollcalls(json!([{ "rollcall_id": 7, "is_radar": true, "status": "absent" }]));
    let h = harness(platform, cookie(), Duration::from_millis(20));

    h.engine.start().await;
    assert_eq!(h.engine.state(), EngineState::Running);
    assert!(h.engine.is_running());

    let platform = h.platform.clone();
    assert!(eventually(Duration::from_secs(2), || platform.radar_call_count() >= 1).await);

    h.engine.stop().await;
    assert_eq!(h.engine.state(), EngineState::Stopped);
    assert!(!h.engine.status().running);
    assert!(h.engine.status().requests >= 1);
    assert_eq!(h.notifier.count_containing("signed at preferred location"), h.platform.radar_call_count());

    // Nothing runs after stop returned.
    let fetches = h.platform.fetches.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(h.platform.fetches.load(Ordering::SeqCst), fetches);
}

#[tokio::test]
async fn start_is_idempotent() {
    let h = harness(FakePlatform::new(), cookie(), Duration::from_millis(20));

    h.engine.start().await;
    h.engine.start().await;
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.state(), EngineState::Running);

    h.engine.stop().await;
    h.engine.stop().await;
    assert_eq!(h.engine.state(), EngineState::Stopped);
    let stops = h
        .engine
        .history()
        .iter()
        .filter(|(_, _, to)| *to == EngineState::Stopped)
        .count();
    assert_eq!(stops, 1);
}

#[tokio::test]
async fn duplicate_numeric_dispatch_is_skipped() {
    let platform = FakePlatform::new().with_number_delay(Duration::from_millis(150));
    let h = harness(platform, cookie(), Duration::from_secs(30));
    h.engine.start().await;

    let numeric = json!({ "rollcall_id": 31, "is_number": true, "status": "absent" });
    assert_eq!(h.engine.dispatch(rollcall(numeric.clone())).await, DispatchOutcome::Numeric);
    assert_eq!(h.engine.dispatch(rollcall(numeric)).await, DispatchOutcome::Duplicate);
    assert!(h.engine.in_flight().contains(31));

    let platform = h.platform.clone();
    assert!(eventually(Duration::from_secs(2), || platform.number_calls.load(Ordering::SeqCst) == 200).await);

    // Stop waits for the running batch, then the search gives up.
    h.engine.stop().await;
    assert!(h.engine.in_flight().is_empty());
    assert_eq!(h.platform.number_calls.load(Ordering::SeqCst), 200);
}

#[tokio::test]
async fn on_call_rollcall_is_not_answered() {
    let h = harness(FakePlatform::new(), cookie(), Duration::from_millis(20));
    h.engine.start().await;

    let done = rollcall(json!({ "rollcall_id": 8, "is_radar": true, "status_name": "on_call_fine" }));
    assert_eq!(h.engine.dispatch(done).await, DispatchOutcome::AlreadyOnCall);

    let other = rollcall(json!({ "rollcall_id": 9, "status": "absent" }));
    assert_eq!(h.engine.dispatch(other).await, DispatchOutcome::Ignored);

    h.engine.stop().await;
    assert_eq!(h.platform.radar_call_count(), 0);
}

#[tokio::test]
async fn cookie_expiry_halts_engine() {
    let h = harness(FakePlatform::new(), cookie(), Duration::from_millis(20));
    h.engine.start().await;
    h.platform.expired.store(true, Ordering::SeqCst);

    let engine = h.engine.clone();
    assert!(eventually(Duration::from_secs(2), || engine.state() == EngineState::Stopped).await);

    match h.events.recv_async().await.unwrap() {
        AccountEvent::AuthExpired {
            account_id,
            instance,
            ..
        } => {
            assert_eq!(account_id, h.account_id);
            assert_eq!(instance, h.engine.instance());
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(h.notifier.count_containing("cannot be renewed"), 1);
    // Cookie sessions are never rebuilt behind the owner's back.
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 1);

    h.engine.stop().await;
    assert_eq!(h.notifier.count_containing("cannot be renewed"), 1);
}

#[tokio::test]
async fn password_session_recovers() {
    let platform = FakePlatform::new();
    platform.expire_next_fetch.store(true, Ordering::SeqCst);
    let h = harness(platform, password(), Duration::from_millis(20));
    h.engine.start().await;

    let platform = h.platform.clone();
    assert!(eventually(Duration::from_secs(2), || platform.fetches.load(Ordering::SeqCst) >= 2).await);

    assert!(matches!(h.events.recv_async().await.unwrap(), AccountEvent::AuthExpired { .. }));
    assert_eq!(
        h.events.recv_async().await.unwrap(),
        AccountEvent::AuthRecovered {
            account_id: h.account_id,
            instance: h.engine.instance(),
        }
    );
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 2);
    assert_eq!(h.engine.state(), EngineState::Running);

    h.engine.stop().await;
}

#[tokio::test]
async fn connect_failure_keeps_engine_stopped() {
    let h = harness(FakePlatform::new(), cookie(), Duration::from_millis(20));
    h.connector.fail.store(true, Ordering::SeqCst);

    h.engine.start().await;
    assert_eq!(h.engine.state(), EngineState::Stopped);
    h.engine.start().await;
    assert_eq!(h.engine.state(), EngineState::Stopped);

    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 2);
    assert_eq!(h.notifier.count_containing("Session unavailable"), 1);
    // A transport failure is not an auth expiry.
    assert!(h.events.try_recv().is_err());

    h.connector.fail.store(false, Ordering::SeqCst);
    h.engine.start().await;
    assert_eq!(h.engine.state(), EngineState::Running);
    h.engine.stop().await;
}

#[tokio::test]
async fn stop_interrupts_cooldown() {
    let h = harness(FakePlatform::new(), cookie(), Duration::from_secs(60));
    h.engine.start().await;

    let platform = h.platform.clone();
    assert!(eventually(Duration::from_secs(2), || platform.fetches.load(Ordering::SeqCst) >= 1).await);

    let started = tokio::time::Instant::now();
    h.engine.stop().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(h.engine.state(), EngineState::Stopped);
}

#[test]
fn status_saturates_huge_cooldown() {
    let h = harness(FakePlatform::new(), cookie(), Duration::MAX);
    let status = h.engine.status();
    assert_eq!(status.cooldown_ms, u64::MAX);
    assert!(!status.running);

    let h = harness(FakePlatform::new(), cookie(), Duration::from_millis(4000));
    assert_eq!(h.engine.status().cooldown_ms, 4000);
}
