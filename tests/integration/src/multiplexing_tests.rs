//! Multiplexing Tests - Concurrent Calls on One Transport
//!
//! - Out-of-order responses matched to their calls by call id
//! - Serialized calls when concurrent multiplexing is not negotiated
//! - Faults, timeouts and abandoned calls stay local to their call
//! - A server shutdown breaks every later call on the transport

mod common;

use async_trait::async_trait;
use common::*;
use dcerpc::{
    CallOptions, Operation, RawOperation, RequestWriter, ResponseReader, RpcError,
};
use futures::future::join_all;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_complete_out_of_order() {
    init_logging();

    let (peer, _dialer, _conn, client) =
        bound_client(PeerConfig::default(), |opts| opts.with_multiplexing(true)).await;
    assert!(client.transport().negotiated().multiplexing);

    const CALLS: u32 = 8;
    let start = Instant::now();
    let results = join_all((0..CALLS).map(|i| {
        let client = client.clone();
        async move {
            // later calls answer first
            let payload = format!("call-{}", i);
            let body = delayed((CALLS - i) * 40, payload.as_bytes());
            let mut op = RawOperation::new(opnum::DELAYED_ECHO, body.clone());
            client.invoke(&mut op).await.map(|_| (body, op.into_response()))
        }
    }))
    .await;

    for result in results {
        let (sent, received) = result.unwrap();
        assert_eq!(sent, received);
    }
    println!("{} concurrent calls in {:?}", CALLS, start.elapsed());

    let stats = peer.stats();
    assert!(stats.max_in_flight.load(Ordering::SeqCst) > 1);
    assert_eq!(stats.requests.load(Ordering::SeqCst), CALLS as usize);

    let events = stats.events.lock().clone();
    let starts: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            Event::RequestStart(id) => Some(*id),
            _ => None,
        })
        .collect();
    let ends: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            Event::ResponseEnd(id) => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(starts.len(), ends.len());
    assert_ne!(starts, ends, "responses should not follow request order");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_calls_are_serialized_without_multiplexing() {
    init_logging();

    let (peer, _dialer, _conn, client) = bound_client(PeerConfig::default(), |opts| opts).await;
    assert!(!client.transport().negotiated().multiplexing);

    let results = join_all((0..4u32).map(|i| {
        let client = client.clone();
        async move {
            let body = delayed(20, &i.to_le_bytes());
            let mut op = RawOperation::new(opnum::DELAYED_ECHO, body.clone());
            client.invoke(&mut op).await.map(|_| (body, op.into_response()))
        }
    }))
    .await;
    for result in results {
        let (sent, received) = result.unwrap();
        assert_eq!(sent, received);
    }

    let stats = peer.stats();
    assert_eq!(stats.max_in_flight.load(Ordering::SeqCst), 1);

    // every request starts only after the previous response finished
    let events = stats.events.lock().clone();
    assert_eq!(events.len(), 8);
    for pair in events.chunks(2) {
        match pair {
            [Event::RequestStart(a), Event::ResponseEnd(b)] => assert_eq!(a, b),
            other => panic!("interleaved calls: {:?}", other),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fault_is_isolated_to_its_call() {
    init_logging();

    let (_peer, _dialer, _conn, client) =
        bound_client(PeerConfig::default(), |opts| opts.with_multiplexing(true)).await;

    let faulting = {
        let client = client.clone();
        async move {
            let mut op = RawOperation::new(opnum::FAULT, &b"boom"[..]);
            client.invoke(&mut op).await
        }
    };
    let echoing = {
        let client = client.clone();
        async move {
            let mut op = RawOperation::new(opnum::DELAYED_ECHO, delayed(30, b"fine"));
            client.invoke(&mut op).await.map(|_| op.into_response())
        }
    };
    let (fault, echo) = tokio::join!(faulting, echoing);

    match fault.unwrap_err() {
        RpcError::Fault { status, name } => {
            assert_eq!(status, NCA_S_OP_RNG_ERROR);
            assert_eq!(name, "nca_s_op_rng_error");
        }
        other => panic!("expected fault, got {:?}", other),
    }
    assert_eq!(echo.unwrap(), delayed(30, b"fine"));
    assert!(!client.transport().is_closed());

    let mut op = RawOperation::new(opnum::ECHO, &b"after fault"[..]);
    client.invoke(&mut op).await.unwrap();
    assert_eq!(op.response().as_ref(), b"after fault");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_breaks_transport() {
    init_logging();

    let (_peer, _dialer, _conn, client) = bound_client(PeerConfig::default(), |opts| opts).await;

    let mut op = RawOperation::new(opnum::SHUTDOWN, &b""[..]);
    let err = client.invoke(&mut op).await.unwrap_err();
    assert!(matches!(err, RpcError::ServerTerminated), "got {:?}", err);
    assert!(client.transport().is_closed());
    assert!(client.is_closed());

    let mut op = RawOperation::new(opnum::ECHO, &b"too late"[..]);
    let err = client.invoke(&mut op).await.unwrap_err();
    assert!(matches!(err, RpcError::TransportBroken(_)), "got {:?}", err);
    assert!(err.is_fatal());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_call_timeout_keeps_transport() {
    init_logging();

    let (_peer, _dialer, _conn, client) = bound_client(PeerConfig::default(), |opts| opts).await;

    let mut op = RawOperation::new(opnum::HANG, &b"never answered"[..]);
    let err = client
        .invoke_with(
            &mut op,
            &CallOptions::new().with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout));

    // the abandoned call no longer holds the sender
    let mut op = RawOperation::new(opnum::ECHO, &b"next"[..]);
    client.invoke(&mut op).await.unwrap();
    assert_eq!(op.response().as_ref(), b"next");
}

/// Writes two fragments' worth of body and then stalls forever
struct StallingOperation {
    len: usize,
}

#[async_trait]
impl Operation for StallingOperation {
    fn opnum(&self) -> u16 {
        opnum::ECHO
    }

    async fn marshal_request(&self, w: &mut RequestWriter<'_>) -> dcerpc::Result<()> {
        w.write_all(&pattern(self.len)).await?;
        futures::future::pending::<()>().await;
        Ok(())
    }

    async fn unmarshal_response(&mut self, _r: &mut ResponseReader<'_>) -> dcerpc::Result<()> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abandoned_request_sends_orphaned() {
    init_logging();

    let (peer, _dialer, _conn, client) = bound_client(PeerConfig::default(), |opts| opts).await;
    let max_frag = client.transport().negotiated().max_xmit_frag as usize;

    let mut op = StallingOperation { len: max_frag * 2 };
    let err = client
        .invoke_with(
            &mut op,
            &CallOptions::new().with_timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout));

    let stats = peer.stats();
    let deadline = Instant::now() + Duration::from_secs(2);
    while stats.orphaned.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stats.orphaned.load(Ordering::SeqCst), 1);
    assert!(stats.request_fragments.load(Ordering::SeqCst) >= 1);
    assert_eq!(stats.requests.load(Ordering::SeqCst), 0);

    let mut op = RawOperation::new(opnum::ECHO, &b"after orphan"[..]);
    client.invoke(&mut op).await.unwrap();
    assert_eq!(op.response().as_ref(), b"after orphan");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_many_tasks_share_one_transport() {
    init_logging();

    let (peer, _dialer, _conn, client) =
        bound_client(PeerConfig::default(), |opts| opts.with_multiplexing(true)).await;

    const TASKS: usize = 32;
    let handles: Vec<_> = (0..TASKS)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                let body = pattern(100 + i * 37);
                let mut op = RawOperation::new(opnum::CHECKSUM, body.clone());
                client.invoke(&mut op).await?;
                let expected = compute_checksum(&body).to_le_bytes();
                assert_eq!(op.response().as_ref(), &expected[..]);
                Ok::<_, RpcError>(())
            })
        })
        .collect();

    for handle in join_all(handles).await {
        handle.unwrap().unwrap();
    }
    assert_eq!(peer.stats().requests.load(Ordering::SeqCst), TASKS);
    assert_eq!(peer.stats().connections.load(Ordering::SeqCst), 1);
}
