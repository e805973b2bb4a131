//! Negotiation wrapper for a single call session.
//!
//! A [`PeerSession`] owns one call's negotiation handshake on top of the
//! host media subsystem: the initiator creates and sends the offer, the
//! responder answers it, and network candidates flow both ways. Candidates
//! may legitimately arrive before the matching offer or answer, so they are
//! buffered until a remote description exists and applied in arrival order.

use log::{debug, warn};
use tokio::sync::mpsc;
use videocall_protocol::{ClientId, IceCandidate, SignalMessage};

use crate::error::{Error, Result};
use crate::media::{MediaBackend, MediaConfig, MediaSession, StreamHandle};

/// Which side of the handshake this endpoint is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Placed the call, creates and sends the offer
    Initiator,
    /// Accepted the call, awaits the offer and answers it
    Responder,
}

/// Where the handshake currently stands. Only ever advances; a transition
/// backwards is discarded. `OfferSent` belongs to the initiator and
/// `OfferReceived` to the responder, one session only ever visits one of
/// the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NegotiationState {
    /// Local capture succeeded, nothing exchanged yet
    LocalStreamAcquired,
    /// Initiator sent its offer and awaits the answer
    OfferSent,
    /// Responder received the peer's offer
    OfferReceived,
    /// Both descriptions are in place
    AnswerExchanged,
    /// Network candidates are being applied
    CandidatesExchanging,
    /// The platform surfaced a remote media stream; the call is live
    Connected,
    /// Torn down, all resources released
    Ended,
}

/// One in-progress or being-negotiated call session.
///
/// Created when a call is placed or accepted, destroyed exactly once on
/// teardown regardless of which trigger fired first (hang-up, rejection,
/// timeout, transport loss).
pub struct PeerSession<S: MediaSession> {
    role: Role,
    peer: ClientId,
    state: NegotiationState,
    media: S,
    local_stream: StreamHandle,
    pending_candidates: Vec<IceCandidate>,
    remote_description_set: bool,
    signal_tx: mpsc::UnboundedSender<SignalMessage>,
}

impl<S: MediaSession> PeerSession<S> {
    /// Acquire a local media stream and, as initiator, immediately create
    /// and send the offer. On acquisition failure no session exists and
    /// nothing has been sent to the peer.
    pub fn start<B>(
        backend: &mut B,
        role: Role,
        peer: ClientId,
        config: &MediaConfig,
        signal_tx: mpsc::UnboundedSender<SignalMessage>,
    ) -> Result<Self>
    where
        B: MediaBackend<Session = S>,
    {
        let media = backend.open(config)?;
        let local_stream = media.local_stream();
        debug!("local stream acquired for call with {} as {:?}", peer, role);

        let mut session = Self {
            role,
            peer,
            state: NegotiationState::LocalStreamAcquired,
            media,
            local_stream,
            pending_candidates: Vec::new(),
            remote_description_set: false,
            signal_tx,
        };

        if role == Role::Initiator {
            let offer = match session.media.create_offer() {
                Ok(offer) => offer,
                Err(e) => {
                    session.media.close();
                    return Err(e.into());
                }
            };
            if let Err(e) = session.send(SignalMessage::SdpOffer(session.peer.clone(), offer)) {
                session.media.close();
                return Err(e);
            }
            session.advance(NegotiationState::OfferSent);
        }

        Ok(session)
    }

    /// The peer this session is negotiating with.
    #[must_use]
    pub fn peer(&self) -> &ClientId {
        &self.peer
    }

    #[must_use]
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Handle of the local capture stream.
    #[must_use]
    pub fn local_stream(&self) -> StreamHandle {
        self.local_stream
    }

    /// Receiver of remote media streams surfaced by the platform. Take it
    /// once, right after [`PeerSession::start`].
    pub fn remote_streams(&mut self) -> mpsc::UnboundedReceiver<StreamHandle> {
        self.media.take_remote_streams()
    }

    /// Responder side: apply the peer's offer and send back an answer.
    /// An offer on the initiator side or a repeated offer is dropped.
    pub fn handle_offer(&mut self, offer: &str) -> Result<()> {
        if self.role != Role::Responder {
            warn!("initiator received an offer from {}, ignoring", self.peer);
            return Ok(());
        }
        if self.remote_description_set {
            warn!("offer already received from {}, ignoring the second one", self.peer);
            return Ok(());
        }

        self.advance(NegotiationState::OfferReceived);
        let answer = self.media.create_answer(offer)?;
        self.remote_description_set = true;
        self.send(SignalMessage::SdpAnswer(self.peer.clone(), answer))?;
        self.advance(NegotiationState::AnswerExchanged);
        self.flush_pending_candidates()
    }

    /// Initiator side: apply the peer's answer as the remote description.
    pub fn handle_answer(&mut self, answer: &str) -> Result<()> {
        if self.role != Role::Initiator {
            warn!("responder received an answer from {}, ignoring", self.peer);
            return Ok(());
        }
        if self.remote_description_set {
            warn!("answer already received from {}, ignoring the second one", self.peer);
            return Ok(());
        }

        self.media.apply_remote_answer(answer)?;
        self.remote_description_set = true;
        self.advance(NegotiationState::AnswerExchanged);
        self.flush_pending_candidates()
    }

    /// Apply a network candidate, or buffer it until a remote description
    /// exists. No ordering is required between candidate and answer
    /// delivery.
    pub fn handle_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if !self.remote_description_set {
            debug!("buffering candidate from {} until the remote description is set", self.peer);
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        self.media.add_remote_candidate(&candidate)?;
        self.advance(NegotiationState::CandidatesExchanging);
        Ok(())
    }

    /// The platform surfaced a remote media stream: the call is live.
    pub fn handle_remote_stream(&mut self) {
        self.advance(NegotiationState::Connected);
    }

    /// Release the local media stream, discard the session state and, on
    /// the first call only, notify the peer with a call-end message. Safe
    /// to call repeatedly and before negotiation ever completed.
    pub fn stop(&mut self, notify_peer: bool) {
        if self.state == NegotiationState::Ended {
            return;
        }
        self.media.close();
        self.pending_candidates.clear();
        if notify_peer {
            // best effort, the signaling connection may already be gone
            let _ = self
                .signal_tx
                .send(SignalMessage::CallEnd(self.peer.clone()));
        }
        self.advance(NegotiationState::Ended);
    }

    fn flush_pending_candidates(&mut self) -> Result<()> {
        if self.pending_candidates.is_empty() {
            return Ok(());
        }
        for candidate in std::mem::take(&mut self.pending_candidates) {
            self.media.add_remote_candidate(&candidate)?;
        }
        self.advance(NegotiationState::CandidatesExchanging);
        Ok(())
    }

    fn send(&self, message: SignalMessage) -> Result<()> {
        self.signal_tx
            .send(message)
            .map_err(|_| Error::SignalingClosed)
    }

    fn advance(&mut self, next: NegotiationState) {
        if next > self.state {
            debug!("negotiation with {}: {:?} -> {:?}", self.peer, self.state, next);
            self.state = next;
        } else if next != self.state {
            debug!(
                "negotiation with {}: discarding backward transition {:?} -> {:?}",
                self.peer, self.state, next
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::{candidate, MockBackend};

    type Session = PeerSession<crate::media::mock::MockSession>;

    fn start(
        role: Role,
        backend: &mut MockBackend,
    ) -> (Session, mpsc::UnboundedReceiver<SignalMessage>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let session = PeerSession::start(
            backend,
            role,
            ClientId::from("bob"),
            &MediaConfig::audio_and_video(),
            signal_tx,
        )
        .unwrap();
        (session, signal_rx)
    }

    #[tokio::test]
    async fn initiator_sends_the_offer_right_after_capture() {
        let mut backend = MockBackend::new();
        let (session, mut signal_rx) = start(Role::Initiator, &mut backend);

        assert_eq!(session.state(), NegotiationState::OfferSent);
        match signal_rx.try_recv().unwrap() {
            SignalMessage::SdpOffer(to, offer) => {
                assert_eq!(to.as_str(), "bob");
                assert_eq!(offer, "mock offer");
            }
            other => panic!("expected SdpOffer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn responder_sends_no_answer_before_an_offer_exists() {
        let mut backend = MockBackend::new();
        let (mut session, mut signal_rx) = start(Role::Responder, &mut backend);

        assert_eq!(session.state(), NegotiationState::LocalStreamAcquired);
        assert!(signal_rx.try_recv().is_err());

        session.handle_offer("their offer").unwrap();
        match signal_rx.try_recv().unwrap() {
            SignalMessage::SdpAnswer(to, answer) => {
                assert_eq!(to.as_str(), "bob");
                assert_eq!(answer, "answer to [their offer]");
            }
            other => panic!("expected SdpAnswer, got {other:?}"),
        }
        assert_eq!(session.state(), NegotiationState::AnswerExchanged);
    }

    #[tokio::test]
    async fn a_second_offer_is_dropped() {
        let mut backend = MockBackend::new();
        let (mut session, _signal_rx) = start(Role::Responder, &mut backend);

        session.handle_offer("first").unwrap();
        session.handle_offer("second").unwrap();

        assert_eq!(backend.log.lock().unwrap().answers_created, vec!["first".to_owned()]);
    }

    #[tokio::test]
    async fn candidates_before_the_answer_are_buffered_then_applied_in_order() {
        let mut backend = MockBackend::new();
        let (mut session, _signal_rx) = start(Role::Initiator, &mut backend);

        session.handle_candidate(candidate(0)).unwrap();
        session.handle_candidate(candidate(1)).unwrap();
        assert!(backend.log.lock().unwrap().candidates_applied.is_empty());

        session.handle_answer("their answer").unwrap();

        let log = backend.log.lock().unwrap();
        assert_eq!(log.answers_applied, vec!["their answer".to_owned()]);
        assert_eq!(log.candidates_applied, vec![candidate(0), candidate(1)]);
        drop(log);
        assert_eq!(session.state(), NegotiationState::CandidatesExchanging);

        // and late candidates are applied directly
        session.handle_candidate(candidate(2)).unwrap();
        assert_eq!(backend.log.lock().unwrap().candidates_applied.len(), 3);
    }

    #[tokio::test]
    async fn stop_twice_releases_media_once_and_sends_one_call_end() {
        let mut backend = MockBackend::new();
        let (mut session, mut signal_rx) = start(Role::Initiator, &mut backend);
        let _ = signal_rx.try_recv(); // the offer

        session.stop(true);
        session.stop(true);

        assert_eq!(backend.log.lock().unwrap().closed, 1);
        assert!(matches!(signal_rx.try_recv(), Ok(SignalMessage::CallEnd(_))));
        assert!(signal_rx.try_recv().is_err());
        assert_eq!(session.state(), NegotiationState::Ended);
    }

    #[tokio::test]
    async fn stop_before_any_negotiation_is_safe() {
        let mut backend = MockBackend::new();
        let (mut session, mut signal_rx) = start(Role::Responder, &mut backend);

        session.stop(false);

        assert_eq!(backend.log.lock().unwrap().closed, 1);
        assert!(signal_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn acquisition_failure_sends_nothing_to_the_peer() {
        let mut backend = MockBackend::failing();
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();

        let result = PeerSession::start(
            &mut backend,
            Role::Initiator,
            ClientId::from("bob"),
            &MediaConfig::audio_only(),
            signal_tx,
        );

        assert!(matches!(result, Err(Error::Media(_))));
        assert!(signal_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn remote_stream_marks_the_session_connected() {
        let mut backend = MockBackend::new();
        let (mut session, _signal_rx) = start(Role::Initiator, &mut backend);

        session.handle_answer("their answer").unwrap();
        session.handle_remote_stream();

        assert_eq!(session.state(), NegotiationState::Connected);
        // connected never reverts to an earlier negotiation phase
        session.handle_candidate(candidate(7)).unwrap();
        assert_eq!(session.state(), NegotiationState::Connected);
    }
}
