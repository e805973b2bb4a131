/*!
Client side of one-to-one audio/video call signaling.

# Overview

Two endpoints discover each other through short rendezvous identifiers held
by a signaling server and then negotiate a direct peer-to-peer media
session. This crate owns everything between the user's intent ("call bob",
"accept", "hang up") and the host platform's media subsystem:

- [`PeerSession`](negotiation::PeerSession) wraps one call's negotiation
  handshake: local stream acquisition, offer/answer exchange and candidate
  buffering, with an idempotent teardown.
- [`CallController`](controller::CallController) is the per-endpoint state
  machine arbitrating idle/ringing/in-call transitions under races such as
  simultaneous requests, rejection and mid-negotiation hang-ups.
- [`CallClient`](client::CallClient) connects the controller to a signaling
  server over WebSocket and serializes all call events onto one task.

The media subsystem itself (capture, encoding, the peer-to-peer transport)
is provided by the host platform behind the [`media::MediaBackend`] trait;
this crate only orchestrates it.
*/

// clippy WARN level lints
#![warn(
    clippy::cargo,
    clippy::pedantic,
    clippy::dbg_macro,
    clippy::unwrap_used,
    clippy::map_err_ignore,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::unreachable
)]
// clippy DENY level lints, they always have a quick fix that should be preferred
#![deny(
    clippy::wildcard_imports,
    clippy::rc_buffer,
    clippy::rc_mutex,
    clippy::str_to_string,
    clippy::string_add,
    clippy::string_to_string
)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod controller;
mod error;
pub mod media;
pub mod negotiation;

pub use client::{CallClient, ClientConfig};
pub use controller::{CallController, CallEvent, CallState, EndReason};
pub use error::{Error, Result};
pub use media::{MediaBackend, MediaConfig, MediaError, MediaSession, StreamHandle};
pub use negotiation::{NegotiationState, PeerSession, Role};
pub use videocall_protocol::{ClientId, IceCandidate, SignalMessage};
