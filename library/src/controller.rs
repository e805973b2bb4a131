//! Per-endpoint call state machine.
//!
//! A [`CallController`] decides whether the local endpoint is idle, ringing
//! or in a call, and mediates between inbound signaling events and the
//! [`PeerSession`] negotiation wrapper. All methods are invoked from a
//! single task, one event at a time; races between user intent and peer
//! messages resolve in arrival order.

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use videocall_protocol::{ClientId, IceCandidate, SignalMessage};

use crate::error::{Error, Result};
use crate::media::{MediaBackend, MediaConfig, StreamHandle};
use crate::negotiation::{NegotiationState, PeerSession, Role};

/// Where the local endpoint stands, one active call session at most.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    /// No call in progress
    Idle,
    /// A call was placed and the peer has not answered yet
    RingingOutbound {
        /// Identifier being called
        peer: ClientId,
    },
    /// A peer is ringing us and the user has not decided yet
    RingingInbound {
        /// Identifier of the requester
        from: ClientId,
    },
    /// Call accepted or answered, session negotiating or live
    InCall {
        /// Identifier of the other endpoint
        peer: ClientId,
    },
}

/// Why a call session went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The local user ended or rejected the call
    Hangup,
    /// The peer ended or rejected the call, or its connection dropped
    PeerHangup,
    /// No negotiation progress within the configured bound; the peer is
    /// treated as unreachable
    NegotiationTimeout,
    /// The host platform could not acquire or drive local media
    MediaFailed,
    /// The connection to the signaling server was lost
    ConnectionLost,
}

/// State changes surfaced to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// The server confirmed our identifier (initial claim, guest
    /// assignment, or rename)
    IdAssigned(ClientId),
    /// Our identifier claim or rename collided with a connected endpoint
    IdTaken(ClientId),
    /// A peer wants to call us; answer with accept or reject
    IncomingRequest {
        /// Identifier of the requester
        from: ClientId,
    },
    /// Local capture is live; a UI would show the self-view now
    LocalStream(StreamHandle),
    /// The peer's media arrived; the call is audibly/visually live
    PeerStream(StreamHandle),
    /// The current call session is gone, the endpoint is idle again
    CallEnded {
        /// The other endpoint of the finished session
        peer: ClientId,
        /// What triggered the teardown
        reason: EndReason,
    },
}

/// The application-level call state machine for one local endpoint.
pub struct CallController<B: MediaBackend> {
    backend: B,
    state: CallState,
    session: Option<PeerSession<B::Session>>,
    /// Offer that arrived while still ringing inbound; fed to the session
    /// once the user accepts, so an answer never precedes an offer.
    pending_offer: Option<String>,
    deadline: Option<Instant>,
    /// Bumped whenever a session is created or destroyed; platform events
    /// tagged with an older generation refer to a torn-down session and
    /// are discarded.
    generation: u64,
    negotiation_timeout: Duration,
    signal_tx: mpsc::UnboundedSender<SignalMessage>,
    event_tx: mpsc::UnboundedSender<CallEvent>,
}

impl<B: MediaBackend> CallController<B> {
    pub fn new(
        backend: B,
        negotiation_timeout: Duration,
        signal_tx: mpsc::UnboundedSender<SignalMessage>,
        event_tx: mpsc::UnboundedSender<CallEvent>,
    ) -> Self {
        Self {
            backend,
            state: CallState::Idle,
            session: None,
            pending_offer: None,
            deadline: None,
            generation: 0,
            negotiation_timeout,
            signal_tx,
            event_tx,
        }
    }

    #[must_use]
    pub fn state(&self) -> &CallState {
        &self.state
    }

    /// Deadline by which the peer must have produced negotiation progress,
    /// while one is armed. The driving task turns its expiry into
    /// [`CallController::on_deadline`].
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Place a call to `peer`. Valid from idle only. Returns the session
    /// generation and the receiver of remote media streams for the driving
    /// task to poll.
    ///
    /// # Errors
    /// [`Error::InvalidState`] outside idle; [`Error::Media`] if local
    /// capture fails, in which case the peer is un-rung and the endpoint
    /// stays idle.
    pub fn place_call(
        &mut self,
        peer: ClientId,
        config: &MediaConfig,
    ) -> Result<(u64, mpsc::UnboundedReceiver<StreamHandle>)> {
        if self.state != CallState::Idle {
            return Err(Error::InvalidState("a call is already in progress"));
        }

        // ring first so the request precedes the offer on the wire
        self.send(SignalMessage::CallRequest(peer.clone()))?;
        let session = PeerSession::start(
            &mut self.backend,
            Role::Initiator,
            peer.clone(),
            config,
            self.signal_tx.clone(),
        );
        let mut session = match session {
            Ok(session) => session,
            Err(e) => {
                // un-ring the peer rather than leaving it to ring forever
                let _ = self.send(SignalMessage::CallEnd(peer.clone()));
                self.emit(CallEvent::CallEnded {
                    peer,
                    reason: EndReason::MediaFailed,
                });
                return Err(e);
            }
        };

        info!("placed call to {}", peer);
        self.emit(CallEvent::LocalStream(session.local_stream()));
        let remote_streams = session.remote_streams();
        self.session = Some(session);
        self.state = CallState::RingingOutbound { peer };
        self.deadline = Some(Instant::now() + self.negotiation_timeout);
        self.generation += 1;
        Ok((self.generation, remote_streams))
    }

    /// Accept the currently ringing inbound call. Valid from
    /// ringing-inbound only.
    ///
    /// # Errors
    /// [`Error::InvalidState`] when nothing is ringing; [`Error::Media`]
    /// if local capture fails, in which case the requester is notified and
    /// the endpoint returns to idle.
    pub fn accept_call(
        &mut self,
        config: &MediaConfig,
    ) -> Result<(u64, mpsc::UnboundedReceiver<StreamHandle>)> {
        let from = match &self.state {
            CallState::RingingInbound { from } => from.clone(),
            _ => return Err(Error::InvalidState("no inbound call is ringing")),
        };

        let session = PeerSession::start(
            &mut self.backend,
            Role::Responder,
            from.clone(),
            config,
            self.signal_tx.clone(),
        );
        let mut session = match session {
            Ok(session) => session,
            Err(e) => {
                // the ringing caller must not wait out its full timeout
                let _ = self.send(SignalMessage::CallEnd(from.clone()));
                self.pending_offer = None;
                self.state = CallState::Idle;
                self.emit(CallEvent::CallEnded {
                    peer: from,
                    reason: EndReason::MediaFailed,
                });
                return Err(e);
            }
        };

        info!("accepted call from {}", from);
        self.emit(CallEvent::LocalStream(session.local_stream()));
        let remote_streams = session.remote_streams();
        self.session = Some(session);
        self.state = CallState::InCall { peer: from.clone() };
        self.generation += 1;
        let generation = self.generation;

        match self.pending_offer.take() {
            // the caller's offer arrived while we were still ringing
            Some(offer) => {
                self.session_offer(&offer)?;
                self.clear_deadline_if_negotiated();
            }
            // offer still in flight, bound the wait for it
            None => self.deadline = Some(Instant::now() + self.negotiation_timeout),
        }

        Ok((generation, remote_streams))
    }

    /// Reject the currently ringing inbound call without touching media.
    ///
    /// # Errors
    /// [`Error::InvalidState`] when nothing is ringing.
    pub fn reject_call(&mut self) -> Result<()> {
        let from = match &self.state {
            CallState::RingingInbound { from } => from.clone(),
            _ => return Err(Error::InvalidState("no inbound call is ringing")),
        };

        info!("rejected call from {}", from);
        let _ = self.send(SignalMessage::CallEnd(from.clone()));
        self.pending_offer = None;
        self.state = CallState::Idle;
        self.emit(CallEvent::CallEnded {
            peer: from,
            reason: EndReason::Hangup,
        });
        Ok(())
    }

    /// End whatever call activity is in progress. Safe to call repeatedly
    /// and while negotiation is still in flight; from idle it is a no-op.
    pub fn end_call(&mut self) {
        match self.state.clone() {
            CallState::Idle => {}
            CallState::RingingInbound { .. } => {
                // ending while ringing is a rejection
                let _ = self.reject_call();
            }
            CallState::RingingOutbound { peer } | CallState::InCall { peer } => {
                self.teardown(true, Some((peer, EndReason::Hangup)));
            }
        }
    }

    /// Ask the server to change our rendezvous identifier; the outcome
    /// arrives as [`CallEvent::IdAssigned`] or [`CallEvent::IdTaken`].
    ///
    /// # Errors
    /// [`Error::SignalingClosed`] if the connection is gone.
    pub fn rename(&mut self, id: ClientId) -> Result<()> {
        self.send(SignalMessage::Rename(id))
    }

    /// Apply one message delivered by the signaling server.
    pub fn handle_signal(&mut self, message: SignalMessage) {
        match message {
            SignalMessage::IdAssigned(id) => self.emit(CallEvent::IdAssigned(id)),
            SignalMessage::IdTaken(id) => self.emit(CallEvent::IdTaken(id)),
            SignalMessage::CallRequest(from) => self.incoming_request(from),
            SignalMessage::SdpOffer(from, offer) => self.incoming_offer(&from, offer),
            SignalMessage::SdpAnswer(from, answer) => self.incoming_answer(&from, &answer),
            SignalMessage::IceCandidate(from, candidate) => {
                self.incoming_candidate(&from, candidate);
            }
            SignalMessage::CallEnd(from) => self.peer_ended(&from),
            SignalMessage::Init(_) | SignalMessage::Rename(_) => {
                warn!("server delivered a client-only message, ignoring");
            }
        }
    }

    /// A remote media stream surfaced by the platform for the session of
    /// the given generation.
    pub fn on_remote_stream(&mut self, generation: u64, stream: StreamHandle) {
        if generation != self.generation || self.session.is_none() {
            debug!("discarding remote stream for a torn-down session");
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.handle_remote_stream();
        }
        self.deadline = None;
        self.emit(CallEvent::PeerStream(stream));
    }

    /// The armed negotiation deadline expired: the peer is unreachable.
    pub fn on_deadline(&mut self) {
        if self.deadline.take().is_none() {
            return;
        }
        let peer = match self.state.clone() {
            CallState::RingingOutbound { peer } | CallState::InCall { peer } => peer,
            _ => return,
        };
        warn!("negotiation with {} timed out", peer);
        self.teardown(true, Some((peer, EndReason::NegotiationTimeout)));
    }

    /// The signaling connection dropped; any call activity is over.
    pub fn connection_lost(&mut self) {
        match self.state.clone() {
            CallState::Idle => {}
            CallState::RingingInbound { from } => {
                self.pending_offer = None;
                self.state = CallState::Idle;
                self.emit(CallEvent::CallEnded {
                    peer: from,
                    reason: EndReason::ConnectionLost,
                });
            }
            CallState::RingingOutbound { peer } | CallState::InCall { peer } => {
                self.teardown(false, Some((peer, EndReason::ConnectionLost)));
            }
        }
    }

    fn incoming_request(&mut self, from: ClientId) {
        if self.state != CallState::Idle {
            // no call waiting: a request while busy is silently dropped and
            // the busy caller's own timeout cleans up on their side
            debug!("ignoring call request from {} while {:?}", from, self.state);
            return;
        }
        info!("incoming call request from {}", from);
        self.state = CallState::RingingInbound { from: from.clone() };
        self.emit(CallEvent::IncomingRequest { from });
    }

    fn incoming_offer(&mut self, from: &ClientId, offer: String) {
        match &self.state {
            CallState::RingingInbound { from: ringing } if ringing == from => {
                // hold it until the user accepts
                self.pending_offer = Some(offer);
            }
            _ if self.session_peer() == Some(from) => {
                match self.session_offer(&offer) {
                    // descriptions are exchanged, the wait for media is the
                    // platform's business now
                    Ok(()) => self.clear_deadline_if_negotiated(),
                    Err(e) => warn!("failed to apply offer from {}: {}", from, e),
                }
            }
            _ => debug!("discarding offer from {} without a matching session", from),
        }
    }

    fn incoming_answer(&mut self, from: &ClientId, answer: &str) {
        if self.session_peer() != Some(from) {
            debug!("discarding answer from {} without a matching session", from);
            return;
        }
        let result = self
            .session
            .as_mut()
            .map_or(Ok(()), |session| session.handle_answer(answer));
        match result {
            Ok(()) => {
                self.clear_deadline_if_negotiated();
                if let CallState::RingingOutbound { peer } = self.state.clone() {
                    info!("{} answered, call is in progress", peer);
                    self.state = CallState::InCall { peer };
                }
            }
            Err(e) => {
                warn!("failed to apply answer from {}: {}", from, e);
                self.fail_session(EndReason::MediaFailed);
            }
        }
    }

    fn incoming_candidate(&mut self, from: &ClientId, candidate: IceCandidate) {
        if self.session_peer() != Some(from) {
            debug!("discarding candidate from {} without a matching session", from);
            return;
        }
        let result = self
            .session
            .as_mut()
            .map_or(Ok(()), |session| session.handle_candidate(candidate));
        if let Err(e) = result {
            warn!("failed to apply candidate from {}: {}", from, e);
            self.fail_session(EndReason::MediaFailed);
        }
    }

    fn peer_ended(&mut self, from: &ClientId) {
        match self.state.clone() {
            CallState::RingingInbound { from: ringing } if ringing == *from => {
                // the caller gave up before we decided
                self.pending_offer = None;
                self.state = CallState::Idle;
                self.emit(CallEvent::CallEnded {
                    peer: ringing,
                    reason: EndReason::PeerHangup,
                });
            }
            CallState::RingingOutbound { peer } | CallState::InCall { peer } if peer == *from => {
                // same teardown as a local hang-up, but without echoing a
                // call-end back at the peer
                self.teardown(false, Some((peer, EndReason::PeerHangup)));
            }
            _ => debug!("discarding call end from {} without a matching session", from),
        }
    }

    /// Apply an offer to the active session, tearing the call down on a
    /// media failure.
    fn session_offer(&mut self, offer: &str) -> Result<()> {
        let result = self
            .session
            .as_mut()
            .map_or(Ok(()), |session| session.handle_offer(offer));
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("failed to apply offer: {}", e);
                self.fail_session(EndReason::MediaFailed);
                Err(e)
            }
        }
    }

    fn fail_session(&mut self, reason: EndReason) {
        let peer = match self.state.clone() {
            CallState::RingingOutbound { peer } | CallState::InCall { peer } => peer,
            _ => return,
        };
        self.teardown(true, Some((peer, reason)));
    }

    /// Single teardown path shared by hang-up, rejection by the peer,
    /// timeout, media failure and transport loss. Destroys the session
    /// exactly once no matter how many triggers fire.
    fn teardown(&mut self, notify_peer: bool, ended: Option<(ClientId, EndReason)>) {
        if let Some(mut session) = self.session.take() {
            session.stop(notify_peer);
        }
        self.pending_offer = None;
        self.deadline = None;
        self.generation += 1;
        self.state = CallState::Idle;
        if let Some((peer, reason)) = ended {
            self.emit(CallEvent::CallEnded { peer, reason });
        }
    }

    /// The armed deadline bounds the wait for the peer's description only.
    /// Disarm it once both descriptions are in place, and not on handshake
    /// messages the session ignored (a stray offer at the initiator must
    /// not disarm the wait for the real answer).
    fn clear_deadline_if_negotiated(&mut self) {
        let negotiated = self
            .session
            .as_ref()
            .map_or(false, |session| {
                session.state() >= NegotiationState::AnswerExchanged
            });
        if negotiated {
            self.deadline = None;
        }
    }

    fn session_peer(&self) -> Option<&ClientId> {
        self.session.as_ref().map(PeerSession::peer)
    }

    fn send(&self, message: SignalMessage) -> Result<()> {
        self.signal_tx
            .send(message)
            .map_err(|_| Error::SignalingClosed)
    }

    fn emit(&self, event: CallEvent) {
        // the application may have stopped listening, which is its choice
        let _ = self.event_tx.send(event);
    }
}
