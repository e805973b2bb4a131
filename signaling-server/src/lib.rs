/*!
Signaling server for one-to-one audio/video calls.

Connected endpoints claim a short rendezvous identifier (or get one
assigned), then exchange call requests, negotiation payloads and network
candidates addressed by identifier. The server resolves identifiers to live
connections and forwards blindly; all call state lives at the two endpoints.
*/

pub mod directory;
pub mod relay;
pub mod router;
