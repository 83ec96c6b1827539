//! Integration tests for connection-loss handling: the reconnect cycle,
//! subscription re-establishment, and QoS >= 1 re-delivery.

use mqtt_session::config::{ReconnectConfig, SessionConfig};
use mqtt_session::session::{Session, SessionEvent, SessionHandle, SessionState};
use mqtt_session::testing::{test_connection_config, test_session_config, MockTransport};
use mqtt_session::transport::QosLevel;
use std::time::Duration;
use tokio::sync::broadcast;

async fn wait_for_state<F>(handle: &SessionHandle, pred: F)
where
    F: Fn(&SessionState) -> bool,
{
    let mut rx = handle.watch_state();
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let current = rx.borrow().clone();
            if pred(&current) {
                return;
            }
            rx.changed().await.expect("state channel closed");
        }
    })
    .await
    .expect("timed out waiting for session state");
}

async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<SessionEvent>,
    pred: F,
) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event channel error: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

async fn connect_and_wait(handle: &SessionHandle) {
    handle.connect(test_connection_config()).await.unwrap();
    wait_for_state(handle, |s| *s == SessionState::Connected).await;
}

#[tokio::test]
async fn test_connection_lost_walks_through_reconnecting_states() {
    let (adapter, control) = MockTransport::new();
    let session = Session::spawn(test_session_config(), adapter);
    let handle = session.handle();
    let mut events = handle.events();

    connect_and_wait(&handle).await;
    control.drop_connection("cable pulled").await;

    // Connected -> Reconnecting -> Connecting -> Connected, with the loss
    // reported on the way.
    let event = wait_for_event(&mut events, |e| {
        matches!(e, SessionEvent::ConnectionLost { .. })
    })
    .await;
    match event {
        SessionEvent::ConnectionLost { reason } => assert_eq!(reason, "cable pulled"),
        _ => unreachable!(),
    }

    wait_for_event(&mut events, |e| {
        matches!(
            e,
            SessionEvent::ConnectionStateChanged(SessionState::Reconnecting(1))
        )
    })
    .await;
    wait_for_event(&mut events, |e| {
        matches!(
            e,
            SessionEvent::ConnectionStateChanged(SessionState::Connecting)
        )
    })
    .await;
    wait_for_state(&handle, |s| *s == SessionState::Connected).await;

    assert_eq!(control.opened().await.len(), 2);

    session.shutdown().await;
}

#[tokio::test]
async fn test_granted_subscriptions_rerequested_once_in_order() {
    let (adapter, control) = MockTransport::new();
    let session = Session::spawn(test_session_config(), adapter);
    let handle = session.handle();
    let mut events = handle.events();

    handle.subscribe("home/+", QosLevel::AtLeastOnce).await.unwrap();
    handle.subscribe("office/#", QosLevel::AtMostOnce).await.unwrap();
    connect_and_wait(&handle).await;

    for _ in 0..2 {
        wait_for_event(&mut events, |e| {
            matches!(e, SessionEvent::SubscriptionConfirmed { .. })
        })
        .await;
    }
    control.clear_history().await;

    control.drop_connection("broker restarted").await;
    wait_for_state(&handle, |s| *s == SessionState::Connected).await;

    for _ in 0..2 {
        wait_for_event(&mut events, |e| {
            matches!(e, SessionEvent::SubscriptionConfirmed { .. })
        })
        .await;
    }

    // Every previously granted subscription was re-requested exactly
    // once, in original insertion order.
    assert_eq!(
        control.subscribed().await,
        vec![
            ("home/+".to_string(), QosLevel::AtLeastOnce),
            ("office/#".to_string(), QosLevel::AtMostOnce),
        ]
    );

    session.shutdown().await;
}

#[tokio::test]
async fn test_qos1_message_redelivered_exactly_once_after_reconnect() {
    let (adapter, control) = MockTransport::new();
    let session = Session::spawn(test_session_config(), adapter);
    let handle = session.handle();
    let mut events = handle.events();

    connect_and_wait(&handle).await;

    // The hand-off fails, so the QoS 1 entry stays unconfirmed in the
    // in-flight set.
    control.fail_sends(true);
    handle
        .publish("alerts/door", "open", QosLevel::AtLeastOnce)
        .await
        .unwrap();
    wait_for_event(&mut events, |e| {
        matches!(e, SessionEvent::PublishFailed { .. })
    })
    .await;
    assert!(control.sent().await.is_empty());

    // Connection drops before any confirmation; the next successful
    // reconnect re-sends the message.
    control.fail_sends(false);
    control.drop_connection("cable pulled").await;
    wait_for_state(&handle, |s| *s == SessionState::Connected).await;

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if !control.sent().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("unconfirmed message was not re-sent");

    // Exactly once: no duplicate beyond the single re-send.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let sent = control.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "alerts/door");
    assert_eq!(sent[0].2, QosLevel::AtLeastOnce);

    session.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_settles_into_failed_after_max_attempts() {
    let (adapter, control) = MockTransport::new();
    let session = Session::spawn(test_session_config(), adapter);
    let handle = session.handle();
    let mut events = handle.events();

    connect_and_wait(&handle).await;

    control.fail_opens(true);
    control.drop_connection("cable pulled").await;

    wait_for_state(&handle, |s| matches!(s, SessionState::Failed(_))).await;
    match handle.state() {
        SessionState::Failed(reason) => {
            assert!(reason.contains("exhausted after 3"), "reason: {reason}")
        }
        other => panic!("expected failed state, got {other:?}"),
    }

    // The terminal error was surfaced as an event too.
    wait_for_event(&mut events, |e| {
        matches!(e, SessionEvent::ConnectionFailed { reason } if reason.contains("exhausted"))
    })
    .await;

    session.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_recovers_after_transient_failures() {
    let (adapter, control) = MockTransport::new();
    let config = SessionConfig {
        reconnect: ReconnectConfig {
            max_attempts: Some(5),
            base_delay_ms: 10,
            max_delay_ms: 40,
        },
        ..test_session_config()
    };
    let session = Session::spawn(config, adapter);
    let handle = session.handle();

    connect_and_wait(&handle).await;

    control.fail_opens(true);
    control.drop_connection("cable pulled").await;

    // Let the first attempt fail, then heal the network.
    wait_for_state(&handle, |s| matches!(s, SessionState::Reconnecting(n) if *n >= 2)).await;
    control.fail_opens(false);

    wait_for_state(&handle, |s| *s == SessionState::Connected).await;

    session.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_during_backoff_cancels_cycle() {
    let (adapter, control) = MockTransport::new();
    let config = SessionConfig {
        reconnect: ReconnectConfig {
            max_attempts: Some(3),
            // Long enough that the test reliably catches the backoff wait.
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
        },
        ..test_session_config()
    };
    let session = Session::spawn(config, adapter);
    let handle = session.handle();

    connect_and_wait(&handle).await;
    control.drop_connection("cable pulled").await;
    wait_for_state(&handle, |s| matches!(s, SessionState::Reconnecting(_))).await;

    handle.disconnect().await.unwrap();
    wait_for_state(&handle, |s| *s == SessionState::Disconnected).await;

    // Only the original connect reached the transport.
    assert_eq!(control.opened().await.len(), 1);

    session.shutdown().await;
}

#[tokio::test]
async fn test_failed_subscribe_retried_on_next_reconnect_not_inline() {
    let (adapter, control) = MockTransport::new();
    let session = Session::spawn(test_session_config(), adapter);
    let handle = session.handle();
    let mut events = handle.events();

    connect_and_wait(&handle).await;

    control.fail_subscribes(true);
    handle.subscribe("restricted/#", QosLevel::AtMostOnce).await.unwrap();

    let event = wait_for_event(&mut events, |e| {
        matches!(e, SessionEvent::SubscriptionFailed { .. })
    })
    .await;
    match event {
        SessionEvent::SubscriptionFailed { filter, .. } => assert_eq!(filter, "restricted/#"),
        _ => unreachable!(),
    }

    // Not retried while still connected.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(control.subscribed().await.is_empty());

    // The desired entry survived, so the next reconnect retries it.
    control.fail_subscribes(false);
    control.drop_connection("cable pulled").await;
    wait_for_event(&mut events, |e| {
        matches!(e, SessionEvent::SubscriptionConfirmed { filter } if filter == "restricted/#")
    })
    .await;
    assert_eq!(
        control.subscribed().await,
        vec![("restricted/#".to_string(), QosLevel::AtMostOnce)]
    );

    session.shutdown().await;
}
