//! Boundary to the host platform's media subsystem.
//!
//! The platform owns capture devices, negotiation payload generation and
//! the actual peer-to-peer media channel; this crate only sequences it.
//! Implement [`MediaBackend`] to plug a platform in.

use tokio::sync::mpsc;
use videocall_protocol::IceCandidate;

/// Opaque token for a platform media stream (local capture or remote
/// render). The backend owns the mapping from token to the real stream;
/// the application resolves tokens through the same backend it supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(u64);

impl StreamHandle {
    /// Wrap a backend-chosen token
    #[must_use]
    pub const fn new(inner: u64) -> Self {
        Self(inner)
    }

    /// Acquire the underlying token
    #[must_use]
    pub const fn into_inner(self) -> u64 {
        self.0
    }
}

/// What to capture for a call. Always passed explicitly, never ambient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConfig {
    /// Capture a microphone track
    pub audio: bool,
    /// Capture a camera track
    pub video: bool,
}

impl MediaConfig {
    /// Voice call configuration
    #[must_use]
    pub const fn audio_only() -> Self {
        Self { audio: true, video: false }
    }

    /// Video call configuration
    #[must_use]
    pub const fn audio_and_video() -> Self {
        Self { audio: true, video: true }
    }
}

/// Errors reported by the host media subsystem.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MediaError {
    /// Local capture was denied or no device is available. Fatal to the
    /// call attempt.
    #[error("local media acquisition failed: {0}")]
    AcquisitionFailed(String),

    /// The backend rejected a negotiation step.
    #[error("media backend error: {0}")]
    Backend(String),
}

/// Entry point into the host media subsystem. One backend serves many
/// sequential calls; each call gets its own [`MediaSession`].
pub trait MediaBackend: Send + 'static {
    /// Per-call session type
    type Session: MediaSession;

    /// Acquire a local media stream per `config` and set up a fresh
    /// peer-to-peer session around it. Failing here means
    /// [`MediaError::AcquisitionFailed`] and the call must not proceed.
    fn open(&mut self, config: &MediaConfig) -> Result<Self::Session, MediaError>;
}

/// One call's slice of the host media subsystem.
///
/// All methods are invoked from a single task, one event at a time; the
/// backend never sees concurrent calls for the same session.
pub trait MediaSession: Send + 'static {
    /// Handle of the local stream acquired at open time
    fn local_stream(&self) -> StreamHandle;

    /// Produce the opaque negotiation offer describing this endpoint
    fn create_offer(&mut self) -> Result<String, MediaError>;

    /// Apply the peer's offer as the remote description and produce the
    /// matching answer
    fn create_answer(&mut self, offer: &str) -> Result<String, MediaError>;

    /// Apply the peer's answer as the remote description
    fn apply_remote_answer(&mut self, answer: &str) -> Result<(), MediaError>;

    /// Feed one of the peer's network candidates to the platform. Only
    /// called after a remote description has been applied; earlier
    /// arrivals are buffered by the caller.
    fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), MediaError>;

    /// Receiver surfacing remote media streams as the platform reports
    /// them, asynchronously after negotiation succeeds. Called once per
    /// session.
    fn take_remote_streams(&mut self) -> mpsc::UnboundedReceiver<StreamHandle>;

    /// Release capture devices and the media channel. Idempotent.
    fn close(&mut self);
}

/// Scripted in-memory backend used by the state-machine tests.
#[cfg(test)]
pub(crate) mod mock {
    use std::sync::{Arc, Mutex};

    use super::{
        IceCandidate, MediaBackend, MediaConfig, MediaError, MediaSession, StreamHandle,
    };
    use tokio::sync::mpsc;

    /// Everything the mock session was asked to do, for assertions.
    #[derive(Debug, Default)]
    pub struct MediaLog {
        pub offers_created: usize,
        pub answers_created: Vec<String>,
        pub answers_applied: Vec<String>,
        pub candidates_applied: Vec<IceCandidate>,
        pub closed: usize,
    }

    pub struct MockBackend {
        pub fail_acquisition: bool,
        pub log: Arc<Mutex<MediaLog>>,
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self {
                fail_acquisition: false,
                log: Arc::new(Mutex::new(MediaLog::default())),
            }
        }

        pub fn failing() -> Self {
            Self {
                fail_acquisition: true,
                log: Arc::new(Mutex::new(MediaLog::default())),
            }
        }
    }

    impl MediaBackend for MockBackend {
        type Session = MockSession;

        fn open(&mut self, _config: &MediaConfig) -> Result<MockSession, MediaError> {
            if self.fail_acquisition {
                return Err(MediaError::AcquisitionFailed("permission denied".to_owned()));
            }
            let (remote_tx, remote_rx) = mpsc::unbounded_channel();
            Ok(MockSession {
                log: Arc::clone(&self.log),
                remote_tx,
                remote_rx: Some(remote_rx),
            })
        }
    }

    pub struct MockSession {
        pub log: Arc<Mutex<MediaLog>>,
        pub remote_tx: mpsc::UnboundedSender<StreamHandle>,
        remote_rx: Option<mpsc::UnboundedReceiver<StreamHandle>>,
    }

    impl MediaSession for MockSession {
        fn local_stream(&self) -> StreamHandle {
            StreamHandle::new(1)
        }

        fn create_offer(&mut self) -> Result<String, MediaError> {
            let mut log = self.log.lock().unwrap();
            log.offers_created += 1;
            Ok("mock offer".to_owned())
        }

        fn create_answer(&mut self, offer: &str) -> Result<String, MediaError> {
            let mut log = self.log.lock().unwrap();
            log.answers_created.push(offer.to_owned());
            Ok(format!("answer to [{offer}]"))
        }

        fn apply_remote_answer(&mut self, answer: &str) -> Result<(), MediaError> {
            self.log.lock().unwrap().answers_applied.push(answer.to_owned());
            Ok(())
        }

        fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), MediaError> {
            self.log.lock().unwrap().candidates_applied.push(candidate.clone());
            Ok(())
        }

        fn take_remote_streams(&mut self) -> mpsc::UnboundedReceiver<StreamHandle> {
            self.remote_rx.take().expect("remote streams already taken")
        }

        fn close(&mut self) {
            self.log.lock().unwrap().closed += 1;
        }
    }

    pub fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 UDP 2122252543 192.0.2.1 54321 typ host"),
            sdp_mid: Some("0".to_owned()),
            sdp_m_line_index: Some(n),
        }
    }
}
