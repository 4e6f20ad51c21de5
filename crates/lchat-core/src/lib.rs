//! # lchat-core
//!
//! Shared types for the chat client: the [`Message`] value, the
//! [`TransportError`] taxonomy and the [`HubTransport`] seam a concrete
//! hub connection plugs into.

#![deny(unsafe_code)]

pub mod errors;
pub mod message;
pub mod transport;

pub use errors::TransportError;
pub use message::{Message, MessageKind};
pub use transport::{EventSender, HubTransport, TransportEvent, TransportFactory, RECEIVE_METHOD, SEND_METHOD};
