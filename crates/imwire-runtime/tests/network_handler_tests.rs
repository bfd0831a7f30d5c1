//! Network Handler Integration Tests
//!
//! Drives the engine against the scripted mock server under paused tokio
//! time: login, failover, reconnect with backoff, exhaustion, heartbeat
//! supervision, send policies and inbound routing.

use std::sync::Arc;
use std::time::Duration;

use imwire_core::{
    CodecConfig, ConnectionEvent, ConnectionState, EngineConfig, Endpoint, ImwireError,
    MessageElement, MessageEncoder, ProtocolConfig, SendFailure, SsoPacket, StateChange,
};
use imwire_runtime::{
    EngineEvent, MockServer, MockTransport, NetworkHandler, NetworkHandlerBuilder, SendPolicy,
    StateSnapshot, TokenAuthenticator,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;

// ----------------------------------------------------------------------------
// Test Configuration
// ----------------------------------------------------------------------------

const TEST_TIMEOUT: Duration = Duration::from_secs(60);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn endpoint(n: u8) -> Endpoint {
    Endpoint::new(format!("10.0.0.{}", n), 8080)
}

fn builder(server: &MockServer, servers: Vec<Endpoint>) -> NetworkHandlerBuilder {
    let login = ProtocolConfig::default().login_command;
    NetworkHandlerBuilder::new(MockTransport::new(server.clone()))
        .with_config(EngineConfig::testing(servers))
        .with_authenticator(TokenAuthenticator::new(login, b"session-token".to_vec()))
}

async fn started(server: &MockServer, servers: Vec<Endpoint>) -> NetworkHandler {
    init_logging();
    let handler = builder(server, servers).build_and_start().await.unwrap();
    handler.await_ready(TEST_TIMEOUT).await.unwrap();
    handler
}

async fn next_event<T, F>(events: &mut broadcast::Receiver<EngineEvent>, mut pick: F) -> T
where
    F: FnMut(EngineEvent) -> Option<T>,
{
    timeout(TEST_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("event not observed")
}

async fn next_transition(
    events: &mut broadcast::Receiver<EngineEvent>,
    to: ConnectionState,
) -> StateChange {
    next_event(events, |event| match event {
        EngineEvent::StateChanged(change) if change.current == to => Some(change),
        _ => None,
    })
    .await
}

async fn wait_for<F>(handler: &NetworkHandler, predicate: F) -> Arc<StateSnapshot>
where
    F: Fn(&StateSnapshot) -> bool,
{
    let mut updates = handler.watch_state();
    timeout(TEST_TIMEOUT, async {
        loop {
            let snapshot = Arc::clone(&updates.borrow_and_update());
            if predicate(&snapshot) {
                return snapshot;
            }
            updates.changed().await.expect("driver gone");
        }
    })
    .await
    .expect("state not reached")
}

// ----------------------------------------------------------------------------
// Connect and Login
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_start_reaches_ok_through_login() {
    init_logging();
    let server = MockServer::new();
    let handler = builder(&server, vec![endpoint(1)]).build().unwrap();
    let mut events = handler.subscribe();
    handler.start().unwrap();

    let mut path = Vec::new();
    loop {
        let change = next_event(&mut events, |event| match event {
            EngineEvent::StateChanged(change) => Some(change),
            _ => None,
        })
        .await;
        path.push((change.previous, change.current));
        if change.current == ConnectionState::Ok {
            break;
        }
    }
    assert_eq!(
        path,
        vec![
            (ConnectionState::Initialized, ConnectionState::Connecting),
            (ConnectionState::Connecting, ConnectionState::Loading),
            (ConnectionState::Loading, ConnectionState::Ok),
        ]
    );

    let snapshot = handler.snapshot();
    assert!(snapshot.is_ready());
    assert_eq!(snapshot.endpoint, Some(endpoint(1)));
    assert_eq!(snapshot.session, 1);
    assert_eq!(snapshot.attempts, 0);

    let logins = server.received_command(&ProtocolConfig::default().login_command);
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0].body, b"session-token".to_vec());
    assert_eq!(handler.server_list().last_connected_ip(), "10.0.0.1");

    handler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_rejected_login_backs_off_and_retries() {
    let server = MockServer::new();
    server.set_login_result(5);
    let handler = builder(&server, vec![endpoint(1)]).build().unwrap();
    let mut events = handler.subscribe();
    handler.start().unwrap();

    let closed = next_transition(&mut events, ConnectionState::Closed).await;
    assert_eq!(closed.previous, ConnectionState::Loading);
    assert_eq!(closed.reason, ConnectionEvent::HandshakeFailed);
    assert_eq!(handler.snapshot().attempts, 1);

    server.set_login_result(0);
    handler.await_ready(TEST_TIMEOUT).await.unwrap();
    assert_eq!(handler.snapshot().session, 2);
    assert_eq!(handler.snapshot().attempts, 0);

    handler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_login_times_out() {
    let server = MockServer::new();
    server.set_login_silent();
    let handler = builder(&server, vec![endpoint(1)]).build().unwrap();
    let mut events = handler.subscribe();
    handler.start().unwrap();

    let closed = next_transition(&mut events, ConnectionState::Closed).await;
    assert_eq!(closed.reason, ConnectionEvent::HandshakeFailed);
    assert!(!server.is_connected());

    handler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failover_skips_refused_endpoint() {
    let server = MockServer::new();
    server.refuse(&endpoint(1));
    let handler = started(&server, vec![endpoint(1), endpoint(2)]).await;

    assert_eq!(handler.snapshot().endpoint, Some(endpoint(2)));
    assert_eq!(server.connects(), vec![endpoint(1), endpoint(2)]);

    let servers = handler.server_list();
    assert_eq!(servers.status(&endpoint(1)).unwrap().consecutive_failures, 1);
    assert_eq!(servers.last_connected_ip(), "10.0.0.2");

    handler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failover_after_rejected_login() {
    let server = MockServer::new();
    server.set_login_result_for(&endpoint(1), 5);
    let handler = started(&server, vec![endpoint(1), endpoint(2)]).await;

    assert_eq!(handler.snapshot().endpoint, Some(endpoint(2)));
    assert_eq!(server.connects(), vec![endpoint(1), endpoint(2)]);
    assert_eq!(
        handler
            .server_list()
            .status(&endpoint(1))
            .unwrap()
            .consecutive_failures,
        1
    );

    handler.shutdown().await;
}

// ----------------------------------------------------------------------------
// Reconnection
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_dropped_connection_reconnects() {
    let server = MockServer::new();
    let handler = started(&server, vec![endpoint(1)]).await;
    let mut events = handler.subscribe();

    assert!(server.drop_connection());
    let closed = next_transition(&mut events, ConnectionState::Closed).await;
    assert_eq!(closed.previous, ConnectionState::Ok);
    assert_eq!(closed.reason, ConnectionEvent::TransportError);

    let servers = handler.server_list();
    assert_eq!(servers.last_connected(), Some(&endpoint(1)));
    assert_eq!(servers.last_disconnected(), Some(&endpoint(1)));
    assert_eq!(servers.last_connected_ip(), servers.last_disconnected_ip());

    next_transition(&mut events, ConnectionState::Ok).await;
    let snapshot = handler.snapshot();
    assert_eq!(snapshot.session, 2);
    assert_eq!(snapshot.attempts, 0);
    assert_eq!(server.connects().len(), 2);

    handler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_requires_start() {
    let server = MockServer::new();
    server.set_refuse_all(true);
    let handler = builder(&server, vec![endpoint(1)]).build().unwrap();
    let mut events = handler.subscribe();
    handler.start().unwrap();

    let (attempts, last_endpoint) = next_event(&mut events, |event| match event {
        EngineEvent::NetworkUnreachable {
            attempts,
            last_endpoint,
        } => Some((attempts, last_endpoint)),
        _ => None,
    })
    .await;
    assert_eq!(attempts, 3);
    assert_eq!(last_endpoint, Some(endpoint(1)));

    let snapshot = handler.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Closed);
    assert!(snapshot.exhausted);
    assert!(matches!(
        handler.await_ready(Duration::from_secs(1)).await,
        Err(ImwireError::ReconnectExhausted { attempts: 3 })
    ));

    let packet = SsoPacket::new(0, "Status.Ping", Vec::new());
    let fail_fast = handler.send(&packet, SendPolicy::FailFast).await;
    assert!(matches!(
        fail_fast,
        Err(ImwireError::NotConnected { exhausted: true, .. })
    ));
    let waiting = handler
        .send(&packet, SendPolicy::WaitFor(Duration::from_secs(5)))
        .await;
    assert!(matches!(
        waiting,
        Err(ImwireError::NotConnected { exhausted: true, .. })
    ));

    // resume is not enough once exhausted
    handler.resume().unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(handler.state(), ConnectionState::Closed);
    assert_eq!(server.connects().len(), 3);

    server.set_refuse_all(false);
    handler.start().unwrap();
    handler.await_ready(TEST_TIMEOUT).await.unwrap();
    assert!(!handler.snapshot().exhausted);

    handler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_close_does_not_reconnect() {
    let server = MockServer::new();
    let handler = started(&server, vec![endpoint(1)]).await;
    let mut events = handler.subscribe();

    handler.close("user logout").unwrap();
    let closing = next_transition(&mut events, ConnectionState::Closing).await;
    assert_eq!(closing.reason, ConnectionEvent::Close);
    assert_eq!(closing.detail.as_deref(), Some("user logout"));
    let closed = next_transition(&mut events, ConnectionState::Closed).await;
    assert_eq!(closed.reason, ConnectionEvent::CloseCompleted);
    assert_eq!(closed.detail.as_deref(), Some("user logout"));
    assert_eq!(handler.snapshot().detail.as_deref(), Some("user logout"));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(handler.state(), ConnectionState::Closed);
    assert_eq!(server.connects().len(), 1);
    assert!(!server.is_connected());
    assert_eq!(handler.server_list().last_disconnected(), Some(&endpoint(1)));

    handler.resume().unwrap();
    handler.await_ready(TEST_TIMEOUT).await.unwrap();
    assert_eq!(handler.snapshot().session, 2);
    assert_eq!(handler.snapshot().detail, None);

    handler.shutdown().await;
}

// ----------------------------------------------------------------------------
// Heartbeat
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_healthy_heartbeat_keeps_connection() {
    let server = MockServer::new();
    let handler = started(&server, vec![endpoint(1)]).await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(handler.state(), ConnectionState::Ok);
    assert_eq!(handler.snapshot().session, 1);

    let probes = server.received_command(&ProtocolConfig::default().heartbeat_command);
    assert!(probes.len() >= 5, "only {} probes", probes.len());

    handler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_missed_heartbeats_close_and_reconnect() {
    let server = MockServer::new();
    let handler = started(&server, vec![endpoint(1)]).await;
    let mut events = handler.subscribe();

    server.set_heartbeat_replies(false);
    let closed = next_transition(&mut events, ConnectionState::Closed).await;
    assert_eq!(closed.previous, ConnectionState::Ok);
    assert_eq!(closed.reason, ConnectionEvent::HeartbeatTimeout);

    server.set_heartbeat_replies(true);
    next_transition(&mut events, ConnectionState::Ok).await;
    assert_eq!(handler.snapshot().session, 2);

    handler.shutdown().await;
}

// ----------------------------------------------------------------------------
// Sending
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_send_policy_while_connecting() {
    let server = MockServer::new();
    server.set_connect_delay(Some(Duration::from_secs(1)));
    let config = EngineConfig::testing(vec![endpoint(1)])
        .with_timeouts(Duration::from_secs(5), Duration::from_secs(1));
    let handler = NetworkHandlerBuilder::new(MockTransport::new(server.clone()))
        .with_config(config)
        .build_and_start()
        .await
        .unwrap();
    wait_for(&handler, |s| s.state == ConnectionState::Connecting).await;

    let packet = SsoPacket::new(0, "Status.Notify", b"hello".to_vec());
    let error = handler
        .send(&packet, SendPolicy::FailFast)
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        ImwireError::NotConnected {
            state: ConnectionState::Connecting,
            exhausted: false
        }
    ));

    handler
        .send(&packet, SendPolicy::WaitFor(Duration::from_secs(2)))
        .await
        .unwrap();
    let sent = server.received_command("Status.Notify");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].body, b"hello".to_vec());

    handler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_times_out() {
    let server = MockServer::new();
    server.set_connect_delay(Some(Duration::from_secs(3)));
    let config = EngineConfig::testing(vec![endpoint(1)])
        .with_timeouts(Duration::from_secs(10), Duration::from_secs(1));
    let handler = NetworkHandlerBuilder::new(MockTransport::new(server))
        .with_config(config)
        .build_and_start()
        .await
        .unwrap();

    let packet = SsoPacket::new(0, "Status.Notify", Vec::new());
    let error = handler
        .send(&packet, SendPolicy::WaitFor(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        ImwireError::ConnectionTimeout {
            state: ConnectionState::Connecting,
            ..
        }
    ));

    handler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_send_message_maps_result_codes() {
    let server = MockServer::new();
    let handler = started(&server, vec![endpoint(1)]).await;
    let chain = vec![MessageElement::text("hello"), MessageElement::face(14)];

    handler
        .send_message(42, &chain, SendPolicy::FailFast)
        .await
        .unwrap();
    let sent = server.received_command(&ProtocolConfig::default().message_send_command);
    assert_eq!(sent.len(), 1);
    assert_eq!(&sent[0].body[..8], &42u64.to_be_bytes());

    server.set_send_result(2);
    let muted = handler.send_message(42, &chain, SendPolicy::FailFast).await;
    assert!(matches!(muted, Err(ImwireError::Send(SendFailure::Muted))));

    server.set_send_result(3);
    let limited = handler.send_message(42, &chain, SendPolicy::FailFast).await;
    assert!(matches!(
        limited,
        Err(ImwireError::Send(SendFailure::RateLimited))
    ));

    server.set_send_result(1);
    let too_large = handler.send_message(42, &chain, SendPolicy::FailFast).await;
    assert!(matches!(
        too_large,
        Err(ImwireError::Send(SendFailure::MessageTooLarge { limit: 4096, .. }))
    ));

    server.set_send_result(77);
    let rejected = handler.send_message(42, &chain, SendPolicy::FailFast).await;
    assert!(matches!(
        rejected,
        Err(ImwireError::Send(SendFailure::Rejected { code: 77 }))
    ));

    // the connection survives rejected messages
    assert_eq!(handler.state(), ConnectionState::Ok);
    handler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_oversized_text_is_refused_before_sending() {
    let server = MockServer::new();
    let handler = started(&server, vec![endpoint(1)]).await;

    let chain = vec![MessageElement::text("x".repeat(70_000))];
    let error = handler
        .send_message(42, &chain, SendPolicy::FailFast)
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        ImwireError::Send(SendFailure::MessageTooLarge { size: 70_000, limit: 4096 })
    ));
    let sent = server.received_command(&ProtocolConfig::default().message_send_command);
    assert!(sent.is_empty());

    handler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_oversized_frame_fails_only_its_caller() {
    init_logging();
    let server = MockServer::new();
    let mut config = EngineConfig::testing(vec![endpoint(1)]);
    config.codec.max_frame_size = 128;
    let login = ProtocolConfig::default().login_command;
    let handler = NetworkHandlerBuilder::new(MockTransport::new(server.clone()))
        .with_config(config)
        .with_authenticator(TokenAuthenticator::new(login, b"session-token".to_vec()))
        .build_and_start()
        .await
        .unwrap();
    handler.await_ready(TEST_TIMEOUT).await.unwrap();
    let session = handler.snapshot().session;

    let packet = SsoPacket::new(0, "Status.Notify", vec![7; 200]);
    let error = handler
        .send(&packet, SendPolicy::FailFast)
        .await
        .unwrap_err();
    assert!(matches!(error, ImwireError::Codec(_)));

    let snapshot = handler.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Ok);
    assert_eq!(snapshot.session, session);
    assert!(server.is_connected());
    assert!(server.received_command("Status.Notify").is_empty());

    handler
        .send(&SsoPacket::new(0, "Status.Notify", vec![7; 16]), SendPolicy::FailFast)
        .await
        .unwrap();
    assert_eq!(server.received_command("Status.Notify").len(), 1);

    handler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_request_times_out() {
    let server = MockServer::new();
    let handler = started(&server, vec![endpoint(1)]).await;

    let error = handler
        .request("Status.Unanswered", Vec::new(), SendPolicy::FailFast)
        .await
        .unwrap_err();
    match error {
        ImwireError::ResponseTimeout {
            command, waited, ..
        } => {
            assert_eq!(command, "Status.Unanswered");
            assert_eq!(waited, handler.config().request_timeout);
        }
        other => panic!("unexpected error: {}", other),
    }

    handler.shutdown().await;
}

// ----------------------------------------------------------------------------
// Inbound Routing
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_incoming_message_is_decoded() {
    let server = MockServer::new();
    let handler = started(&server, vec![endpoint(1)]).await;
    let mut events = handler.subscribe();

    let encoder = MessageEncoder::new(&CodecConfig::default());
    let mut body = 1234u64.to_be_bytes().to_vec();
    body.extend(
        encoder
            .encode(&[MessageElement::text("hi"), MessageElement::at(7, "@bob")])
            .unwrap(),
    );
    let command = ProtocolConfig::default().message_commands[0].clone();
    assert!(server.push(SsoPacket::new(0, command.clone(), body)));

    let message = next_event(&mut events, |event| match event {
        EngineEvent::Message(message) => Some(message),
        _ => None,
    })
    .await;
    assert_eq!(message.command, command);
    assert_eq!(message.sender, 1234);
    assert_eq!(
        message.elements,
        vec![MessageElement::text("hi"), MessageElement::at(7, "@bob")]
    );
    assert!(message.flags.is_some());

    handler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_redirect_replaces_server_list() {
    let server = MockServer::new();
    let handler = started(&server, vec![endpoint(1)]).await;
    let mut events = handler.subscribe();

    let redirect = ProtocolConfig::default().redirect_command;
    let body = b"10.0.0.7:8080\n\nnot-an-endpoint\n10.0.0.8:8080\n".to_vec();
    assert!(server.push(SsoPacket::new(0, redirect, body)));

    let endpoints = next_event(&mut events, |event| match event {
        EngineEvent::ServersUpdated { endpoints } => Some(endpoints),
        _ => None,
    })
    .await;
    assert_eq!(endpoints, vec![endpoint(7), endpoint(8)]);
    assert_eq!(handler.server_list().endpoints(), &[endpoint(7), endpoint(8)]);

    // the live connection is unaffected
    assert_eq!(handler.state(), ConnectionState::Ok);
    handler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unsolicited_packet_is_published() {
    let server = MockServer::new();
    let handler = started(&server, vec![endpoint(1)]).await;
    let mut events = handler.subscribe();

    assert!(server.push(SsoPacket::new(0, "OnlinePush.Notify", vec![1, 2, 3])));
    let packet = next_event(&mut events, |event| match event {
        EngineEvent::Packet(packet) => Some(packet),
        _ => None,
    })
    .await;
    assert_eq!(packet.command, "OnlinePush.Notify");
    assert_eq!(packet.body, vec![1, 2, 3]);

    handler.shutdown().await;
}

// ----------------------------------------------------------------------------
// Lifecycle
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_shutdown_wakes_waiters() {
    let server = MockServer::new();
    server.set_connect_delay(Some(Duration::from_secs(30)));
    let config = EngineConfig::testing(vec![endpoint(1)])
        .with_timeouts(Duration::from_secs(60), Duration::from_secs(1));
    let handler = NetworkHandlerBuilder::new(MockTransport::new(server))
        .with_config(config)
        .build_and_start()
        .await
        .unwrap();

    let waiter = {
        let handler = handler.clone();
        tokio::spawn(async move { handler.await_ready(Duration::from_secs(120)).await })
    };
    wait_for(&handler, |s| s.state == ConnectionState::Connecting).await;

    handler.shutdown().await;
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(ImwireError::Cancelled)));

    let snapshot = handler.snapshot();
    assert!(snapshot.terminated);
    assert_eq!(snapshot.state, ConnectionState::Closed);
    assert_eq!(snapshot.reason, Some(ConnectionEvent::Cancel));

    assert!(matches!(handler.start(), Err(ImwireError::Cancelled)));
    let packet = SsoPacket::new(0, "Status.Ping", Vec::new());
    assert!(matches!(
        handler.send(&packet, SendPolicy::FailFast).await,
        Err(ImwireError::Cancelled)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_dropping_last_handle_cancels() {
    let server = MockServer::new();
    let handler = started(&server, vec![endpoint(1)]).await;
    let mut events = handler.subscribe();

    drop(handler);
    let closed = next_transition(&mut events, ConnectionState::Closed).await;
    assert_eq!(closed.reason, ConnectionEvent::Cancel);
    assert!(!server.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_from_ok_releases_transport() {
    let server = MockServer::new();
    let handler = started(&server, vec![endpoint(1)]).await;
    assert!(server.is_connected());

    handler.shutdown().await;
    let snapshot = handler.snapshot();
    assert!(snapshot.terminated);
    assert_eq!(snapshot.reason, Some(ConnectionEvent::Cancel));
    assert!(!server.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_abort_releases_transport() {
    let server = MockServer::new();
    let handler = started(&server, vec![endpoint(1)]).await;
    assert!(server.is_connected());

    handler.abort();
    let snapshot = wait_for(&handler, |s| s.terminated).await;
    assert_eq!(snapshot.state, ConnectionState::Closed);
    assert_eq!(snapshot.reason, Some(ConnectionEvent::Cancel));
    assert!(!server.is_connected());
    assert!(matches!(handler.start(), Err(ImwireError::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_snapshot_reads_are_consistent() {
    let server = MockServer::new();
    let handler = started(&server, vec![endpoint(1)]).await;

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let handler = handler.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    let snapshot = handler.snapshot();
                    if snapshot.state == ConnectionState::Ok {
                        assert!(snapshot.endpoint.is_some());
                        assert_eq!(snapshot.attempts, 0);
                    }
                    if snapshot.exhausted {
                        assert_eq!(snapshot.state, ConnectionState::Closed);
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    for _ in 0..3 {
        let session = handler.snapshot().session;
        server.drop_connection();
        wait_for(&handler, |s| s.is_ready() && s.session > session).await;
    }
    for result in futures::future::join_all(readers).await {
        result.unwrap();
    }

    handler.shutdown().await;
}
