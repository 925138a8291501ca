//! Security Integration Tests
//!
//! These tests exercise the authentication, signing, and encryption code paths
//! against a scripted peer and a toy mechanism:
//!
//! 1. **Token exchange**
//!    - One-leg contexts complete with the bind
//!    - Two-leg contexts finish with auth3
//!    - Three-leg contexts take an alter-context leg
//!
//! 2. **Per-fragment protection**
//!    - Connect and call levels
//!    - Packet integrity (signing) and privacy (sealing)
//!    - Header signing negotiation
//!
//! 3. **Context sharing**
//!    - Sub-connections inherit or override the security context

mod common;

use common::*;
use dcerpc::verification::SEC_VT_CLIENT_SUPPORTS_HEADER_SIGNING;
use dcerpc::{
    AuthLevel, AuthType, BindOptions, ClientConn, Conn, PacketFlags, RawOperation, RpcError,
    SecurityOptions, VerificationCommand, VerifyOptions,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Bind the test interface with `security` over a fresh peer
async fn secure_client(
    config: PeerConfig,
    security: SecurityOptions,
) -> (Arc<MockPeer>, Conn, ClientConn) {
    let peer = MockPeer::new(config);
    let dialer = MockDialer::new(peer.clone());
    let conn = dcerpc::dial("ncacn_ip_tcp:srv[1025]", dial_options(dialer))
        .await
        .unwrap();
    let client = conn
        .bind(BindOptions::new(test_interface()).with_security(security))
        .await
        .unwrap();
    (peer, conn, client)
}

fn tokens(peer: &MockPeer) -> Vec<String> {
    peer.stats()
        .tokens
        .lock()
        .iter()
        .map(|t| String::from_utf8_lossy(t).into_owned())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_level_one_leg() {
    init_logging();

    let mechanism = Arc::new(MockMechanism::new(AuthType::Ntlm, 1));
    let (peer, _conn, client) = secure_client(
        PeerConfig::default(),
        security_options(mechanism.clone(), AuthLevel::Connect),
    )
    .await;

    assert_eq!(tokens(&peer), vec!["LEG1"]);
    assert_eq!(peer.stats().auth3s.load(Ordering::SeqCst), 0);
    assert!(client.security().await.unwrap().is_established());

    let mut op = RawOperation::new(opnum::ECHO, &b"connect level"[..]);
    client.invoke(&mut op).await.unwrap();
    assert_eq!(op.response().as_ref(), b"connect level");

    // authenticated once, nothing protected per fragment
    assert!(peer.stats().auth_lengths.lock().iter().all(|len| *len == 0));
    assert_eq!(mechanism.wraps(), 0);
    assert_eq!(mechanism.unwraps(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_leg_context_finishes_with_auth3() {
    init_logging();

    let mechanism = Arc::new(MockMechanism::new(AuthType::Ntlm, 2));
    let (peer, _conn, client) = secure_client(
        PeerConfig::default(),
        security_options(mechanism.clone(), AuthLevel::PktIntegrity),
    )
    .await;

    let payload = pattern(100);
    let mut op = RawOperation::new(opnum::ECHO, payload.clone());
    client.invoke(&mut op).await.unwrap();
    assert_eq!(op.into_response(), payload);

    // auth3 has no reply; the answered call orders it
    let stats = peer.stats();
    assert_eq!(tokens(&peer), vec!["LEG1", "LEG2"]);
    assert_eq!(stats.auth3s.load(Ordering::SeqCst), 1);
    assert_eq!(stats.alter_contexts.load(Ordering::SeqCst), 0);

    assert!(stats.auth_lengths.lock().iter().all(|len| *len == 16));
    assert_eq!(mechanism.wraps(), 1);
    assert_eq!(mechanism.unwraps(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_three_leg_context_uses_alter_context() {
    init_logging();

    let mechanism = Arc::new(MockMechanism::new(AuthType::GssNegotiate, 3));
    let (peer, _conn, client) = secure_client(
        PeerConfig::default(),
        security_options(mechanism, AuthLevel::PktIntegrity),
    )
    .await;

    let stats = peer.stats();
    assert_eq!(tokens(&peer), vec!["LEG1", "LEG2"]);
    assert_eq!(stats.alter_contexts.load(Ordering::SeqCst), 1);
    assert_eq!(stats.auth3s.load(Ordering::SeqCst), 0);

    let security = client.security().await.unwrap();
    assert!(security.is_established());
    assert_eq!(security.auth_type(), AuthType::GssNegotiate);

    let mut op = RawOperation::new(opnum::CHECKSUM, pattern(5000));
    client.invoke(&mut op).await.unwrap();
    assert_eq!(
        op.response().as_ref(),
        &compute_checksum(&pattern(5000)).to_le_bytes()[..]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_call_level_protects_first_fragment_only() {
    init_logging();

    let mechanism = Arc::new(MockMechanism::new(AuthType::Ntlm, 2));
    let (peer, _conn, client) = secure_client(
        PeerConfig::default(),
        security_options(mechanism.clone(), AuthLevel::Call),
    )
    .await;

    let payload = pattern(10_000);
    let mut op = RawOperation::new(opnum::ECHO, payload.clone());
    client.invoke(&mut op).await.unwrap();
    assert_eq!(op.into_response(), payload);

    let lengths = peer.stats().auth_lengths.lock().clone();
    assert_eq!(lengths.len(), 3);
    assert_eq!(lengths[0], 16);
    assert!(lengths[1..].iter().all(|len| *len == 0));
    assert_eq!(mechanism.wraps(), 1);
    assert_eq!(mechanism.unwraps(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_privacy_round_trip() {
    init_logging();

    let mechanism = Arc::new(MockMechanism::new(AuthType::Ntlm, 2));
    let (peer, _conn, client) = secure_client(
        PeerConfig::default().with_max_frag(2048),
        security_options(mechanism.clone(), AuthLevel::PktPrivacy),
    )
    .await;

    let payload = pattern(30_000);
    let mut op = RawOperation::new(opnum::ECHO, payload.clone());
    client.invoke(&mut op).await.unwrap();
    assert_eq!(op.into_response(), payload);

    let mut op = RawOperation::new(opnum::GENERATE, generate(12_345));
    client.invoke(&mut op).await.unwrap();
    assert_eq!(op.into_response(), pattern(12_345));

    let stats = peer.stats();
    assert!(stats.auth_lengths.lock().iter().all(|len| *len == 16));
    assert!(stats.fragment_sizes.lock().iter().all(|size| *size <= 2048));
    assert_eq!(
        mechanism.wraps(),
        stats.request_fragments.load(Ordering::SeqCst)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_header_sign_negotiation() {
    init_logging();

    // requested and echoed
    let (peer, _conn, client) = secure_client(
        PeerConfig::default(),
        security_options(
            Arc::new(MockMechanism::new(AuthType::Ntlm, 2)),
            AuthLevel::PktIntegrity,
        ),
    )
    .await;
    let flags = peer.stats().bind_flags.lock()[0].1;
    assert!(flags.contains(PacketFlags::SUPPORT_HEADER_SIGN));
    assert!(client.security().await.unwrap().header_sign());

    // requested, not echoed
    let (_peer, _conn, client) = secure_client(
        PeerConfig::default().with_header_sign(false),
        security_options(
            Arc::new(MockMechanism::new(AuthType::Ntlm, 2)),
            AuthLevel::PktIntegrity,
        ),
    )
    .await;
    assert!(!client.security().await.unwrap().header_sign());

    // not requested
    let (peer, _conn, client) = secure_client(
        PeerConfig::default(),
        security_options(
            Arc::new(MockMechanism::new(AuthType::Ntlm, 2)),
            AuthLevel::PktIntegrity,
        )
        .with_header_sign(false),
    )
    .await;
    let flags = peer.stats().bind_flags.lock()[0].1;
    assert!(!flags.contains(PacketFlags::SUPPORT_HEADER_SIGN));
    assert!(!client.security().await.unwrap().header_sign());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_verification_trailer_reports_header_signing() {
    init_logging();

    let peer = MockPeer::new(PeerConfig::default());
    let dialer = MockDialer::new(peer.clone());
    let conn = dcerpc::dial("ncacn_ip_tcp:srv[1025]", dial_options(dialer))
        .await
        .unwrap();
    let client = conn
        .bind(
            BindOptions::new(test_interface())
                .with_security(security_options(
                    Arc::new(MockMechanism::new(AuthType::Ntlm, 2)),
                    AuthLevel::PktPrivacy,
                ))
                .with_verify(VerifyOptions::all()),
        )
        .await
        .unwrap();

    let payload = pattern(64);
    let mut op = RawOperation::new(opnum::ECHO, payload.clone());
    client.invoke(&mut op).await.unwrap();
    assert_eq!(op.into_response(), payload);

    let trailers = peer.stats().trailers.lock().clone();
    assert_eq!(trailers.len(), 1);
    assert_eq!(
        trailers[0].commands[0],
        VerificationCommand::Bitmask1(SEC_VT_CLIENT_SUPPORTS_HEADER_SIGNING)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sub_connections_share_or_override_security() {
    init_logging();

    let (peer, _conn, client) = secure_client(
        PeerConfig::default(),
        security_options(
            Arc::new(MockMechanism::new(AuthType::Ntlm, 2)),
            AuthLevel::PktIntegrity,
        ),
    )
    .await;
    let stats = peer.stats();

    // no override: the established context is reused without new legs
    let shared = client
        .sub_conn(BindOptions::new(second_interface()))
        .await
        .unwrap();
    assert!(Arc::ptr_eq(
        &client.security().await.unwrap(),
        &shared.security().await.unwrap()
    ));
    assert_eq!(tokens(&peer).len(), 2);

    // override: a fresh context with its own token exchange
    let sealed = client
        .sub_conn(
            BindOptions::new(second_interface()).with_security(security_options(
                Arc::new(MockMechanism::new(AuthType::Ntlm, 2)),
                AuthLevel::PktPrivacy,
            )),
        )
        .await
        .unwrap();
    let sealed_security = sealed.security().await.unwrap();
    assert_ne!(
        sealed_security.context_id(),
        client.security().await.unwrap().context_id()
    );
    assert_eq!(sealed_security.level(), AuthLevel::PktPrivacy);

    for handle in [&client, &shared, &sealed] {
        let mut op = RawOperation::new(opnum::ECHO, &b"per context"[..]);
        handle.invoke(&mut op).await.unwrap();
        assert_eq!(op.response().as_ref(), b"per context");
    }
    assert_eq!(tokens(&peer).len(), 4);
    assert_eq!(stats.auth3s.load(Ordering::SeqCst), 2);
    assert_eq!(stats.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_protected_level_requires_mechanism() {
    init_logging();

    let peer = MockPeer::new(PeerConfig::default());
    let dialer = MockDialer::new(peer.clone());
    let conn = dcerpc::dial("ncacn_ip_tcp:srv[1025]", dial_options(dialer.clone()))
        .await
        .unwrap();

    let err = conn
        .bind(
            BindOptions::new(test_interface())
                .with_security(SecurityOptions::new().with_level(AuthLevel::PktIntegrity)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::InvalidConfig(_)), "got {:?}", err);
    assert!(dialer.dialed().is_empty());
}
