//! Integration tests for the broker facade: pairing, relay, correlation,
//! and housekeeping, driven without a network.

use std::time::Duration;

use tether_protocol::{CorrelationId, Envelope, MessageKind, Role};
use tether_relay::{Attachment, Broker, Dispatch, RelayError};
use tether_session::{
    ChallengeToken, CloseReason, CredentialCapability, CredentialError,
    KeyRef, Nonce, SessionConfig, SessionError, SessionState, TransformOp,
};
use tether_transport::ConnectionId;
use tokio::sync::mpsc::UnboundedReceiver;

// =========================================================================
// Mock credentials
// =========================================================================

/// Issues `challenge:<callback>`, accepts `signed:<challenge>`, and tags
/// transformed payloads so tests can see the transform happened.
#[derive(Default)]
struct MockCredentials {
    fail_transform: bool,
}

impl CredentialCapability for MockCredentials {
    async fn issue_challenge(&self, callback: &str) -> Result<ChallengeToken, CredentialError> {
        Ok(ChallengeToken::new(format!("challenge:{callback}")))
    }

    async fn validate_response(
        &self,
        response: &str,
        challenge: &ChallengeToken,
    ) -> Result<KeyRef, CredentialError> {
        if response == format!("signed:{}", challenge.as_str()) {
            Ok(KeyRef::new("agent-key"))
        } else {
            Err(CredentialError::Rejected("signature mismatch".into()))
        }
    }

    async fn transform(
        &self,
        op: TransformOp,
        payload: &str,
        key: &KeyRef,
    ) -> Result<String, CredentialError> {
        if self.fail_transform {
            return Err(CredentialError::Unavailable("keystore offline".into()));
        }
        Ok(format!("{op:?}[{key}]({payload})"))
    }
}

// =========================================================================
// Helpers
// =========================================================================

const PUBLIC_URL: &str = "ws://broker.test/";

fn broker_with(credentials: MockCredentials, config: SessionConfig) -> Broker<MockCredentials> {
    Broker::new(credentials, config, PUBLIC_URL)
}

fn broker() -> Broker<MockCredentials> {
    broker_with(MockCredentials::default(), SessionConfig::default())
}

fn frame(json: &str) -> Vec<u8> {
    json.as_bytes().to_vec()
}

fn next_envelope(rx: &mut UnboundedReceiver<Vec<u8>>) -> Envelope {
    let bytes = rx.try_recv().expect("expected a queued frame");
    serde_json::from_slice(&bytes).expect("frame should be an envelope")
}

fn session_error(result: Result<Dispatch, RelayError>) -> SessionError {
    match result {
        Err(RelayError::Session(e)) => e,
        other => panic!("expected a session error, got {other:?}"),
    }
}

struct Paired {
    nonce: Nonce,
    frontend: Attachment,
    agent: Attachment,
}

/// Creates a session, attaches both peers, authenticates the agent, and
/// drains the handshake frames from both queues.
async fn established(broker: &Broker<MockCredentials>) -> Paired {
    let ticket = broker.create_session().await.unwrap();
    let nonce = Nonce::from_raw(ticket.nonce);

    let mut frontend = broker
        .on_connect(nonce.clone(), Role::Frontend, ConnectionId::new(1))
        .unwrap();
    let mut agent = broker
        .on_connect(nonce.clone(), Role::Agent, ConnectionId::new(2))
        .unwrap();

    let auth_request = next_envelope(&mut agent.outbound);
    let response = format!(
        r#"{{"kind":"authResponse","payload":"signed:{}"}}"#,
        auth_request.payload
    );
    let dispatch = broker
        .on_message(&agent.handle, response.as_bytes())
        .await
        .unwrap();
    assert!(matches!(dispatch, Dispatch::Authenticated));

    assert_eq!(next_envelope(&mut agent.outbound).kind, MessageKind::Authenticated);
    assert_eq!(next_envelope(&mut frontend.outbound).kind, MessageKind::Authenticated);
    assert!(agent.outbound.try_recv().is_err());
    assert!(frontend.outbound.try_recv().is_err());

    Paired {
        nonce,
        frontend,
        agent,
    }
}

// =========================================================================
// Creation and pairing
// =========================================================================

#[tokio::test]
async fn test_create_session_ticket_addresses_and_challenge() {
    let broker = broker();
    let ticket = broker.create_session().await.unwrap();

    assert_eq!(ticket.nonce.len(), 64);
    assert_eq!(
        ticket.agent_join_address,
        format!("ws://broker.test/agent/{}", ticket.nonce)
    );
    assert_eq!(
        ticket.frontend_join_address,
        format!("ws://broker.test/frontend/{}", ticket.nonce)
    );
    assert_eq!(
        ticket.challenge,
        format!("challenge:{}", ticket.agent_join_address)
    );

    let snap = broker.session(&Nonce::from_raw(ticket.nonce)).unwrap();
    assert_eq!(snap.state, SessionState::Created);
}

#[tokio::test]
async fn test_agent_pairing_reaches_established() {
    let broker = broker();
    let ticket = broker.create_session().await.unwrap();
    let nonce = Nonce::from_raw(ticket.nonce.clone());

    let mut agent = broker
        .on_connect(nonce.clone(), Role::Agent, ConnectionId::new(7))
        .unwrap();
    assert_eq!(
        broker.session(&nonce).unwrap().state,
        SessionState::AgentAuthenticating
    );

    let auth_request = next_envelope(&mut agent.outbound);
    assert_eq!(auth_request.kind, MessageKind::AuthRequest);
    assert_eq!(auth_request.payload, ticket.challenge);

    let response = format!(
        r#"{{"kind":"authResponse","payload":"signed:{}"}}"#,
        ticket.challenge
    );
    let dispatch = broker
        .on_message(&agent.handle, response.as_bytes())
        .await
        .unwrap();

    assert!(matches!(dispatch, Dispatch::Authenticated));
    let snap = broker.session(&nonce).unwrap();
    assert_eq!(snap.state, SessionState::Established);
    assert_eq!(snap.agent_key.unwrap().as_str(), "agent-key");
}

#[tokio::test]
async fn test_connect_with_bogus_nonce_is_not_found() {
    let broker = broker();
    let err = broker
        .on_connect(Nonce::from_raw("bogus"), Role::Frontend, ConnectionId::new(1))
        .unwrap_err();

    assert!(matches!(err, RelayError::Session(SessionError::NotFound(_))));
    assert_eq!(err.code(), 404);
}

#[tokio::test]
async fn test_three_bad_responses_close_and_fourth_is_session_closed() {
    let broker = broker();
    let ticket = broker.create_session().await.unwrap();
    let nonce = Nonce::from_raw(ticket.nonce);
    let mut agent = broker
        .on_connect(nonce.clone(), Role::Agent, ConnectionId::new(1))
        .unwrap();
    let bad = frame(r#"{"kind":"authResponse","payload":"forged"}"#);

    for _ in 0..3 {
        let err = session_error(broker.on_message(&agent.handle, &bad).await);
        assert!(matches!(err, SessionError::InvalidToken(_)));
        assert_eq!(err.code(), 401);
    }
    assert_eq!(broker.session(&nonce).unwrap().state, SessionState::Closed);

    let err = session_error(broker.on_message(&agent.handle, &bad).await);
    assert!(matches!(err, SessionError::SessionClosed(_)));
    assert_eq!(err.code(), 410);

    // authRequest, then the close notice, then the queue ends.
    assert_eq!(next_envelope(&mut agent.outbound).kind, MessageKind::AuthRequest);
    let close = next_envelope(&mut agent.outbound);
    assert_eq!(close.kind, MessageKind::Close);
    assert_eq!(close.payload, CloseReason::AuthFailed.to_string());
    assert!(agent.outbound.recv().await.is_none());
}

#[tokio::test]
async fn test_agent_non_envelope_before_auth_is_bad_request() {
    let broker = broker();
    let ticket = broker.create_session().await.unwrap();
    let agent = broker
        .on_connect(Nonce::from_raw(ticket.nonce), Role::Agent, ConnectionId::new(1))
        .unwrap();

    let err = broker.on_message(&agent.handle, b"not json").await.unwrap_err();

    assert!(matches!(err, RelayError::Protocol(_)));
    assert_eq!(err.code(), 400);
}

#[tokio::test]
async fn test_frontend_message_before_established_is_unauthorized() {
    let broker = broker();
    let ticket = broker.create_session().await.unwrap();
    let frontend = broker
        .on_connect(Nonce::from_raw(ticket.nonce), Role::Frontend, ConnectionId::new(1))
        .unwrap();

    let err = session_error(broker.on_message(&frontend.handle, b"hello").await);
    assert!(matches!(err, SessionError::Unauthorized(_)));
    assert_eq!(err.code(), 403);
}

#[tokio::test]
async fn test_second_frontend_is_rejected() {
    let broker = broker();
    let paired = established(&broker).await;

    let err = broker
        .on_connect(paired.nonce.clone(), Role::Frontend, ConnectionId::new(9))
        .unwrap_err();
    assert!(matches!(
        err,
        RelayError::Session(SessionError::PeerAlreadyAttached(Role::Frontend))
    ));
    assert_eq!(err.code(), 409);
}

#[tokio::test]
async fn test_late_frontend_is_told_session_is_authenticated() {
    let broker = broker();
    let ticket = broker.create_session().await.unwrap();
    let nonce = Nonce::from_raw(ticket.nonce);
    let agent = broker
        .on_connect(nonce.clone(), Role::Agent, ConnectionId::new(1))
        .unwrap();
    let response = format!(
        r#"{{"kind":"authResponse","payload":"signed:{}"}}"#,
        ticket.challenge
    );
    broker
        .on_message(&agent.handle, response.as_bytes())
        .await
        .unwrap();

    let mut frontend = broker
        .on_connect(nonce, Role::Frontend, ConnectionId::new(2))
        .unwrap();

    assert_eq!(next_envelope(&mut frontend.outbound).kind, MessageKind::Authenticated);
    assert!(frontend.outbound.try_recv().is_err(), "told exactly once");
}

// =========================================================================
// Pass-through
// =========================================================================

#[tokio::test]
async fn test_pass_through_preserves_bytes_and_order() {
    let broker = broker();
    let mut paired = established(&broker).await;
    let frames: Vec<Vec<u8>> = vec![
        b"\x00\x01not-json".to_vec(),
        frame("hello"),
        frame(r#"{"kind":"message","payload":"p"}"#),
        frame(r#"{ "payload" : "spacing kept" }"#),
    ];

    for f in &frames {
        let dispatch = broker.on_message(&paired.frontend.handle, f).await.unwrap();
        assert!(matches!(dispatch, Dispatch::Forwarded));
    }

    for expected in &frames {
        assert_eq!(&paired.agent.outbound.try_recv().unwrap(), expected);
    }
}

#[tokio::test]
async fn test_unsolicited_push_from_agent_is_forwarded_verbatim() {
    let broker = broker();
    let mut paired = established(&broker).await;
    let push = frame(r#"{"correlationId":"zzz","payload":"push"}"#);

    let dispatch = broker.on_message(&paired.agent.handle, &push).await.unwrap();

    assert!(matches!(dispatch, Dispatch::Forwarded));
    assert_eq!(paired.frontend.outbound.try_recv().unwrap(), push);
}

#[tokio::test]
async fn test_message_with_counterpart_gone_is_dropped() {
    let config = SessionConfig {
        frontend_reconnect_grace: Duration::from_secs(30),
        ..SessionConfig::default()
    };
    let broker = broker_with(MockCredentials::default(), config);
    let paired = established(&broker).await;

    assert_eq!(broker.on_disconnect(&paired.frontend.handle), None);
    let dispatch = broker
        .on_message(&paired.agent.handle, b"anyone there?")
        .await
        .unwrap();

    assert!(matches!(dispatch, Dispatch::Dropped));
}

// =========================================================================
// Correlated requests
// =========================================================================

#[tokio::test]
async fn test_encrypt_request_is_transformed_forwarded_and_resolved() {
    let broker = broker();
    let mut paired = established(&broker).await;

    let dispatch = broker
        .on_message(
            &paired.frontend.handle,
            br#"{"correlationId":"abc","kind":"encrypt","payload":"X"}"#,
        )
        .await
        .unwrap();
    let Dispatch::Awaiting(pending) = dispatch else {
        panic!("expected Awaiting");
    };
    assert_eq!(pending.id().as_str(), "abc");

    let forwarded = next_envelope(&mut paired.agent.outbound);
    assert_eq!(forwarded.correlation_id, Some(CorrelationId::new("abc")));
    assert_eq!(forwarded.kind, MessageKind::Encrypt);
    assert_eq!(forwarded.payload, "Encrypt[agent-key](X)");

    let dispatch = broker
        .on_message(&paired.agent.handle, br#"{"correlationId":"abc","payload":"Y"}"#)
        .await
        .unwrap();
    assert!(matches!(dispatch, Dispatch::Resolved(ref id) if id.as_str() == "abc"));

    assert_eq!(pending.wait().await, Ok("Y".to_string()));
    assert!(broker.session(&paired.nonce).unwrap().pending.is_empty());
    // The reply went to the waiting caller, not through to the frontend.
    assert!(paired.frontend.outbound.try_recv().is_err());
}

#[tokio::test]
async fn test_requester_cannot_resolve_its_own_request() {
    let broker = broker();
    let mut paired = established(&broker).await;

    let dispatch = broker
        .on_message(
            &paired.frontend.handle,
            br#"{"correlationId":"abc","kind":"encrypt","payload":"X"}"#,
        )
        .await
        .unwrap();
    let Dispatch::Awaiting(pending) = dispatch else {
        panic!("expected Awaiting");
    };
    let _request = next_envelope(&mut paired.agent.outbound);

    let forged = frame(r#"{"correlationId":"abc","payload":"FORGED"}"#);
    let dispatch = broker
        .on_message(&paired.frontend.handle, &forged)
        .await
        .unwrap();

    // Treated as a push to the agent; the request is still waiting.
    assert!(matches!(dispatch, Dispatch::Forwarded));
    assert_eq!(paired.agent.outbound.try_recv().unwrap(), forged);
    assert_eq!(
        broker.session(&paired.nonce).unwrap().pending,
        vec![CorrelationId::new("abc")]
    );

    broker
        .on_message(&paired.agent.handle, br#"{"correlationId":"abc","payload":"Y"}"#)
        .await
        .unwrap();
    assert_eq!(pending.wait().await, Ok("Y".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_request_times_out_and_is_removed() {
    let broker = broker();
    let paired = established(&broker).await;

    let dispatch = broker
        .on_message(
            &paired.frontend.handle,
            br#"{"correlationId":"abc","kind":"encrypt","payload":"X"}"#,
        )
        .await
        .unwrap();
    let Dispatch::Awaiting(pending) = dispatch else {
        panic!("expected Awaiting");
    };
    assert_eq!(
        broker.session(&paired.nonce).unwrap().pending,
        vec![CorrelationId::new("abc")]
    );

    let result = pending.wait().await;

    assert_eq!(result, Err(SessionError::Timeout(CorrelationId::new("abc"))));
    assert!(broker.session(&paired.nonce).unwrap().pending.is_empty());
}

#[tokio::test]
async fn test_request_without_id_gets_one_assigned() {
    let broker = broker();
    let mut paired = established(&broker).await;

    let dispatch = broker
        .on_message(&paired.frontend.handle, br#"{"kind":"request","payload":"ping"}"#)
        .await
        .unwrap();
    let Dispatch::Awaiting(pending) = dispatch else {
        panic!("expected Awaiting");
    };

    let forwarded = next_envelope(&mut paired.agent.outbound);
    assert_eq!(forwarded.correlation_id.as_ref(), Some(pending.id()));
    // `request` is relayed without a transform.
    assert_eq!(forwarded.payload, "ping");
}

#[tokio::test]
async fn test_transform_failure_reaches_caller_without_pending_entry() {
    let broker = broker_with(
        MockCredentials {
            fail_transform: true,
        },
        SessionConfig::default(),
    );
    let mut paired = established(&broker).await;

    let err = session_error(
        broker
            .on_message(
                &paired.frontend.handle,
                br#"{"correlationId":"abc","kind":"decrypt","payload":"X"}"#,
            )
            .await,
    );

    assert!(matches!(err, SessionError::Capability(_)));
    assert_eq!(err.code(), 502);
    assert!(broker.session(&paired.nonce).unwrap().pending.is_empty());
    assert!(paired.agent.outbound.try_recv().is_err());
}

#[tokio::test]
async fn test_duplicate_correlation_id_is_conflict() {
    let broker = broker();
    let paired = established(&broker).await;
    let request = br#"{"correlationId":"abc","kind":"encrypt","payload":"X"}"#;

    let _first = broker.on_message(&paired.frontend.handle, request).await.unwrap();
    let err = session_error(broker.on_message(&paired.frontend.handle, request).await);

    assert_eq!(err, SessionError::DuplicateCorrelationId(CorrelationId::new("abc")));
    assert_eq!(err.code(), 409);
}

#[tokio::test]
async fn test_responses_resolve_by_id_not_arrival_order() {
    let broker = broker();
    let mut paired = established(&broker).await;

    let mut pending = Vec::new();
    for id in ["one", "two"] {
        let json = format!(r#"{{"correlationId":"{id}","kind":"request","payload":"{id}"}}"#);
        match broker.on_message(&paired.frontend.handle, json.as_bytes()).await {
            Ok(Dispatch::Awaiting(p)) => pending.push(p),
            other => panic!("expected Awaiting, got {other:?}"),
        }
    }
    // Requests reach the agent in submission order.
    assert_eq!(next_envelope(&mut paired.agent.outbound).payload, "one");
    assert_eq!(next_envelope(&mut paired.agent.outbound).payload, "two");

    for id in ["two", "one"] {
        let json = format!(r#"{{"correlationId":"{id}","kind":"response","payload":"re:{id}"}}"#);
        broker
            .on_message(&paired.agent.handle, json.as_bytes())
            .await
            .unwrap();
    }

    let second = pending.pop().unwrap();
    let first = pending.pop().unwrap();
    assert_eq!(first.wait().await, Ok("re:one".to_string()));
    assert_eq!(second.wait().await, Ok("re:two".to_string()));
}

#[tokio::test]
async fn test_in_process_request_round_trip() {
    let broker = broker();
    let Paired {
        nonce,
        agent: Attachment {
            handle: agent_handle,
            outbound: mut agent_rx,
        },
        ..
    } = established(&broker).await;

    let caller = broker.request(
        &nonce,
        Role::Frontend,
        MessageKind::Decrypt,
        Some(CorrelationId::new("rpc-1")),
        "cipher",
    );
    let agent_side = async {
        let bytes = agent_rx.recv().await.unwrap();
        let forwarded: Envelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(forwarded.payload, "Decrypt[agent-key](cipher)");
        broker
            .on_message(
                &agent_handle,
                br#"{"correlationId":"rpc-1","kind":"response","payload":"plain"}"#,
            )
            .await
            .unwrap();
    };

    let (result, ()) = tokio::join!(caller, agent_side);
    assert_eq!(result.unwrap(), "plain");
}

// =========================================================================
// Teardown
// =========================================================================

#[tokio::test]
async fn test_explicit_close_cancels_pending_and_notifies_peers() {
    let broker = broker();
    let mut paired = established(&broker).await;
    let Ok(Dispatch::Awaiting(pending)) = broker
        .on_message(
            &paired.frontend.handle,
            br#"{"correlationId":"abc","kind":"request","payload":"X"}"#,
        )
        .await
    else {
        panic!("expected Awaiting");
    };
    let _forwarded = next_envelope(&mut paired.agent.outbound);

    let dispatch = broker
        .on_message(&paired.agent.handle, br#"{"kind":"close"}"#)
        .await
        .unwrap();

    assert!(matches!(dispatch, Dispatch::Closed));
    assert_eq!(
        pending.wait().await,
        Err(SessionError::Cancelled(CorrelationId::new("abc")))
    );
    for rx in [&mut paired.frontend.outbound, &mut paired.agent.outbound] {
        assert_eq!(next_envelope(rx).kind, MessageKind::Close);
        assert!(rx.recv().await.is_none());
    }
}

#[tokio::test]
async fn test_agent_disconnect_closes_session() {
    let broker = broker();
    let mut paired = established(&broker).await;

    let reason = broker.on_disconnect(&paired.agent.handle);

    assert_eq!(reason, Some(CloseReason::AgentDisconnected));
    assert_eq!(broker.session(&paired.nonce).unwrap().state, SessionState::Closed);
    let notice = next_envelope(&mut paired.frontend.outbound);
    assert_eq!(notice.kind, MessageKind::Close);
    assert_eq!(notice.payload, "agent disconnected");
}

#[tokio::test]
async fn test_send_reaches_only_the_current_connection() {
    let broker = broker();
    let mut paired = established(&broker).await;

    assert!(broker.send(&paired.frontend.handle, b"direct".to_vec()));
    assert_eq!(paired.frontend.outbound.try_recv().unwrap(), b"direct");

    broker.close(&paired.nonce).unwrap();
    assert!(!broker.send(&paired.frontend.handle, b"late".to_vec()));
}

#[tokio::test(start_paused = true)]
async fn test_sweep_closes_idle_then_purges_tombstone() {
    let config = SessionConfig {
        idle_timeout: Duration::from_secs(60),
        closed_linger: Duration::from_secs(30),
        ..SessionConfig::default()
    };
    let broker = broker_with(MockCredentials::default(), config);
    let ticket = broker.create_session().await.unwrap();
    let nonce = Nonce::from_raw(ticket.nonce);

    tokio::time::advance(Duration::from_secs(61)).await;
    let report = broker.sweep();
    assert_eq!(report.closed, vec![(nonce.clone(), CloseReason::Idle)]);
    assert_eq!(report.purged, 0);
    assert_eq!(broker.session(&nonce).unwrap().state, SessionState::Closed);

    tokio::time::advance(Duration::from_secs(31)).await;
    let report = broker.sweep();
    assert_eq!(report.purged, 1);
    assert!(matches!(broker.session(&nonce), Err(SessionError::NotFound(_))));
}

#[tokio::test]
async fn test_shutdown_drains_every_session() {
    let broker = broker();
    let paired = established(&broker).await;
    broker.create_session().await.unwrap();
    let Ok(Dispatch::Awaiting(pending)) = broker
        .on_message(
            &paired.frontend.handle,
            br#"{"correlationId":"abc","kind":"request","payload":"X"}"#,
        )
        .await
    else {
        panic!("expected Awaiting");
    };

    assert_eq!(broker.shutdown(), 2);
    assert!(broker.store().is_empty());
    assert_eq!(
        pending.wait().await,
        Err(SessionError::Cancelled(CorrelationId::new("abc")))
    );
}
