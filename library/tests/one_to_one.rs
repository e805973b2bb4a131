//! End-to-end: two call clients negotiating through a real signaling
//! server instance, with a scripted media backend standing in for the
//! host platform.

use std::net::TcpListener;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use videocall_client::{
    CallClient, CallEvent, ClientConfig, ClientId, EndReason, IceCandidate, MediaBackend,
    MediaConfig, MediaError, MediaSession, StreamHandle,
};
use videocall_signaling_server::router::create_router;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Media backend that behaves like a cooperative platform: capture always
/// succeeds and the remote stream surfaces as soon as descriptions are
/// exchanged.
struct FakeMedia {
    counter: Arc<AtomicU64>,
}

impl FakeMedia {
    fn new() -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl MediaBackend for FakeMedia {
    type Session = FakeSession;

    fn open(&mut self, _config: &MediaConfig) -> Result<FakeSession, MediaError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        Ok(FakeSession {
            local: StreamHandle::new(n * 2),
            remote: StreamHandle::new(n * 2 + 1),
            remote_tx,
            remote_rx: Some(remote_rx),
        })
    }
}

struct FakeSession {
    local: StreamHandle,
    remote: StreamHandle,
    remote_tx: mpsc::UnboundedSender<StreamHandle>,
    remote_rx: Option<mpsc::UnboundedReceiver<StreamHandle>>,
}

impl FakeSession {
    fn surface_remote_stream(&self) {
        let _ = self.remote_tx.send(self.remote);
    }
}

impl MediaSession for FakeSession {
    fn local_stream(&self) -> StreamHandle {
        self.local
    }

    fn create_offer(&mut self) -> Result<String, MediaError> {
        Ok("fake offer".to_owned())
    }

    fn create_answer(&mut self, _offer: &str) -> Result<String, MediaError> {
        self.surface_remote_stream();
        Ok("fake answer".to_owned())
    }

    fn apply_remote_answer(&mut self, _answer: &str) -> Result<(), MediaError> {
        self.surface_remote_stream();
        Ok(())
    }

    fn add_remote_candidate(&mut self, _candidate: &IceCandidate) -> Result<(), MediaError> {
        Ok(())
    }

    fn take_remote_streams(&mut self) -> mpsc::UnboundedReceiver<StreamHandle> {
        self.remote_rx.take().expect("remote streams already taken")
    }

    fn close(&mut self) {}
}

fn start_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind random port");
    listener.set_nonblocking(true).unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = axum::Server::from_tcp(listener)
        .unwrap()
        .serve(create_router().into_make_service());
    tokio::spawn(server);

    format!("ws://127.0.0.1:{}/one-to-one", port)
}

async fn connect(url: &str, name: &str) -> CallClient {
    connect_with(url, name, ClientConfig::default()).await
}

async fn connect_with(url: &str, name: &str, config: ClientConfig) -> CallClient {
    let mut client = CallClient::connect(
        url,
        Some(ClientId::from(name)),
        FakeMedia::new(),
        config,
    )
    .await
    .expect("failed to connect");

    match next_event(&mut client).await {
        CallEvent::IdAssigned(id) => assert_eq!(id.as_str(), name),
        other => panic!("expected IdAssigned, got {other:?}"),
    }
    client
}

async fn next_event(client: &mut CallClient) -> CallEvent {
    timeout(EVENT_TIMEOUT, client.next_event())
        .await
        .expect("timed out waiting for a call event")
        .expect("client stopped unexpectedly")
}

#[tokio::test]
async fn two_clients_complete_a_call_and_hang_up() {
    let url = start_server();
    let mut alice = connect(&url, "alice").await;
    let mut bob = connect(&url, "bob").await;

    bob.place_call(ClientId::from("alice"), MediaConfig::audio_and_video())
        .unwrap();
    assert!(matches!(next_event(&mut bob).await, CallEvent::LocalStream(_)));

    match next_event(&mut alice).await {
        CallEvent::IncomingRequest { from } => assert_eq!(from.as_str(), "bob"),
        other => panic!("expected IncomingRequest, got {other:?}"),
    }

    alice.accept_call(MediaConfig::audio_and_video()).unwrap();
    assert!(matches!(next_event(&mut alice).await, CallEvent::LocalStream(_)));
    assert!(matches!(next_event(&mut alice).await, CallEvent::PeerStream(_)));
    assert!(matches!(next_event(&mut bob).await, CallEvent::PeerStream(_)));

    bob.end_call().unwrap();
    assert_eq!(
        next_event(&mut bob).await,
        CallEvent::CallEnded {
            peer: ClientId::from("alice"),
            reason: EndReason::Hangup,
        }
    );
    assert_eq!(
        next_event(&mut alice).await,
        CallEvent::CallEnded {
            peer: ClientId::from("bob"),
            reason: EndReason::PeerHangup,
        }
    );
}

#[tokio::test]
async fn calling_an_unregistered_peer_times_out_and_frees_the_endpoint() {
    let url = start_server();
    let mut alice = connect_with(
        &url,
        "alice",
        ClientConfig {
            negotiation_timeout: Duration::from_millis(300),
        },
    )
    .await;

    alice
        .place_call(ClientId::from("bob"), MediaConfig::audio_only())
        .unwrap();
    assert!(matches!(next_event(&mut alice).await, CallEvent::LocalStream(_)));
    assert_eq!(
        next_event(&mut alice).await,
        CallEvent::CallEnded {
            peer: ClientId::from("bob"),
            reason: EndReason::NegotiationTimeout,
        }
    );

    // back to idle: a later inbound call still rings
    let bob = connect(&url, "bob").await;
    bob.place_call(ClientId::from("alice"), MediaConfig::audio_only())
        .unwrap();
    match next_event(&mut alice).await {
        CallEvent::IncomingRequest { from } => assert_eq!(from.as_str(), "bob"),
        other => panic!("expected IncomingRequest, got {other:?}"),
    }
}

#[tokio::test]
async fn rejecting_a_call_leaves_both_sides_callable() {
    let url = start_server();
    let mut alice = connect(&url, "alice").await;
    let mut bob = connect(&url, "bob").await;

    bob.place_call(ClientId::from("alice"), MediaConfig::audio_only())
        .unwrap();
    assert!(matches!(next_event(&mut bob).await, CallEvent::LocalStream(_)));
    assert!(matches!(
        next_event(&mut alice).await,
        CallEvent::IncomingRequest { .. }
    ));

    alice.reject_call().unwrap();
    assert_eq!(
        next_event(&mut alice).await,
        CallEvent::CallEnded {
            peer: ClientId::from("bob"),
            reason: EndReason::Hangup,
        }
    );
    assert_eq!(
        next_event(&mut bob).await,
        CallEvent::CallEnded {
            peer: ClientId::from("alice"),
            reason: EndReason::PeerHangup,
        }
    );

    // the rejected caller can ring again
    bob.place_call(ClientId::from("alice"), MediaConfig::audio_only())
        .unwrap();
    assert!(matches!(
        next_event(&mut alice).await,
        CallEvent::IncomingRequest { .. }
    ));
}

#[tokio::test]
async fn dropping_a_client_mid_call_ends_the_call_for_the_peer() {
    let url = start_server();
    let mut alice = connect(&url, "alice").await;
    let mut bob = connect(&url, "bob").await;

    bob.place_call(ClientId::from("alice"), MediaConfig::audio_and_video())
        .unwrap();
    assert!(matches!(next_event(&mut bob).await, CallEvent::LocalStream(_)));
    assert!(matches!(
        next_event(&mut alice).await,
        CallEvent::IncomingRequest { .. }
    ));
    alice.accept_call(MediaConfig::audio_and_video()).unwrap();
    assert!(matches!(next_event(&mut alice).await, CallEvent::LocalStream(_)));
    assert!(matches!(next_event(&mut alice).await, CallEvent::PeerStream(_)));
    assert!(matches!(next_event(&mut bob).await, CallEvent::PeerStream(_)));

    drop(bob);

    assert_eq!(
        next_event(&mut alice).await,
        CallEvent::CallEnded {
            peer: ClientId::from("bob"),
            reason: EndReason::PeerHangup,
        }
    );
    // exactly once
    assert!(timeout(Duration::from_millis(300), alice.next_event())
        .await
        .is_err());
}
