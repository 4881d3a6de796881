//! Tests for running sessions through the controller

mod common;

use common::*;
use gonio_lib::orchestrator::{Controller, ControllerHandle, Notice};
use gonio_lib::protocol::{IntensityConversion, ScanConfig};
use gonio_lib::session::{SessionConfig, SessionEvent, SessionOutcome, SessionState};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn config(name: &str) -> SessionConfig {
    let scan = ScanConfig {
        res_theta: 10.0,
        res_phi: 90.0,
        dps_theta: 0.5,
        dps_phi: 0.5,
    };
    SessionConfig::measure(scan, IntensityConversion::default())
        .named(name)
        .with_ack_timeout(Duration::from_millis(100))
}

async fn wait_finished(controller: &mut ControllerHandle) -> SessionOutcome {
    loop {
        match controller.next_notice().await {
            Some(Notice::Finished(outcome)) => return *outcome,
            Some(_) => {}
            None => panic!("Controller exited before the session finished"),
        }
    }
}

async fn wait_state(controller: &mut ControllerHandle, wanted: SessionState) {
    loop {
        match controller.next_notice().await {
            Some(Notice::Session(SessionEvent::State(state))) if state == wanted => return,
            Some(Notice::Finished(_)) | None => panic!("Session ended before reaching {}", wanted),
            Some(_) => {}
        }
    }
}

#[tokio::test]
async fn test_sessions_run_one_after_another() {
    init_tracing();
    let created = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&created);
    let (mut controller, task) = Controller::spawn(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        ScriptedChannel::new().chunk("ACK,DATA,10,0,5.0,END,")
    });

    assert!(controller.start(config("first")).await);
    let first = wait_finished(&mut controller).await;
    assert_eq!(first.name, "first");
    assert_eq!(first.samples.len(), 1);

    assert!(controller.start(config("second")).await);
    let second = wait_finished(&mut controller).await;
    assert_eq!(second.name, "second");
    assert!(second.ended_normally());

    assert_eq!(created.load(Ordering::SeqCst), 2, "Each session gets a fresh channel");

    controller.shutdown().await;
    task.await.unwrap();
}

#[tokio::test]
async fn test_start_while_running_is_rejected() {
    let (mut controller, task) =
        Controller::spawn(|| ScriptedChannel::new().chunk("ACK,").reply("STOP,", "ACK,"));

    controller.start(config("long")).await;
    wait_state(&mut controller, SessionState::Streaming).await;

    controller.start(config("other")).await;
    loop {
        match controller.next_notice().await {
            Some(Notice::Busy(name)) => {
                assert_eq!(name, "other");
                break;
            }
            Some(Notice::Finished(_)) | None => panic!("Expected the second start to be rejected"),
            Some(_) => {}
        }
    }

    controller.stop().await;
    let outcome = wait_finished(&mut controller).await;
    assert_eq!(outcome.name, "long");
    assert!(outcome.stopped_by_user);
    assert!(outcome.errors.is_empty());

    controller.shutdown().await;
    task.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_and_joins_the_session() {
    let (mut controller, task) = Controller::spawn(|| ScriptedChannel::new().chunk("ACK,DATA,10,0,5.0,"));

    controller.start(config("interrupted")).await;
    wait_state(&mut controller, SessionState::Streaming).await;
    controller.shutdown().await;

    let outcome = wait_finished(&mut controller).await;
    assert!(outcome.stopped_by_user);
    assert_eq!(outcome.final_state, SessionState::Done);

    task.await.unwrap();
    assert!(controller.next_notice().await.is_none());
}
