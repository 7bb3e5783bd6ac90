//! Core types and traits for Tunnel Link.
//!
//! This crate provides the protocol primitives shared by the host and the
//! worker: the envelope codec, channel status, and the transport trait.
//! Applications define their own [`Message`] types; this crate provides the
//! framing.

mod envelope;
mod frame;
pub mod protocol;
mod status;
mod transport;

pub use envelope::{CodecError, Envelope, Message, decode, encode};
pub use frame::{Frame, Handshake};
pub use status::{ChannelStatus, LifecycleState, Observer, StatusCell, StatusLog};
pub use transport::{PendingResponse, Responder, StartOptions, Transport, TransportError};
