/*!
Helper crate that declares the signaling vocabulary shared between the
`videocall-client` library and the `videocall-signaling-server`.
*/

#![warn(missing_docs)]

use std::convert::Infallible;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Short-lived rendezvous name of one endpoint connected to the signaling
/// server. Either claimed by the endpoint on `init` (e.g. a display name)
/// or generated by the server for guests.
///
/// Identifiers are unique among currently connected endpoints only, never
/// across time.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, Hash)]
pub struct ClientId(String);

impl ClientId {
    /// Wrap a `String` into a `ClientId`
    #[must_use]
    pub const fn new(inner: String) -> Self {
        Self(inner)
    }

    /// Return reference to the underlying string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Acquire the underlying type
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl FromStr for ClientId {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl From<&str> for ClientId {
    fn from(val: &str) -> Self {
        Self(val.to_owned())
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque connectivity-path descriptor exchanged between two endpoints
/// trying to find a working direct network path. Passed through the
/// signaling server without interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// The candidate line itself
    pub candidate: String,
    /// Media stream identification tag the candidate belongs to
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to
    pub sdp_m_line_index: Option<u16>,
}

/// Messages exchanged between endpoints and the signaling server to set up,
/// negotiate and tear down a one-to-one call.
///
/// For every relayed variant the carried [`ClientId`] means "to" when sent
/// by a client and is rewritten to the sender's id ("from") by the server
/// before delivery, so the recipient always learns who the message came
/// from. The server forwards payloads verbatim and keeps no call state
/// beyond the pairing needed for disconnect notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SignalMessage {
    /// Client claims the given identifier, or asks for a generated one
    Init(Option<ClientId>),
    /// Server confirms registration under this identifier
    IdAssigned(ClientId),
    /// Claim or rename collided with a connected endpoint; the sender keeps
    /// whatever identifier it had before (possibly none)
    IdTaken(ClientId),
    /// Client atomically replaces its current identifier with a new one
    Rename(ClientId),

    /// Ring the identified peer / notification that a peer is ringing you
    CallRequest(ClientId),
    /// Negotiation offer that gets passed to the other endpoint unmodified
    SdpOffer(ClientId, String),
    /// Negotiation answer that gets passed to the other endpoint unmodified
    SdpAnswer(ClientId, String),
    /// Proposed network candidate passed to the other endpoint unmodified
    IceCandidate(ClientId, IceCandidate),
    /// Hang-up, reject, or a server-synthesized notice that the peer's
    /// connection dropped
    CallEnd(ClientId),
}
