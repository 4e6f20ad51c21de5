//! Chat hub client: SignalR WebSocket transport and the [`ChatService`]
//! that turns it into a single stream of chat messages.

#![deny(unsafe_code)]

pub mod hub;
pub mod mock;
pub mod negotiate;
pub mod protocol;
pub mod service;

pub use hub::{HubConfig, HubConnection, HubConnectionFactory};
pub use mock::{MockTransport, MockTransportFactory};
pub use service::ChatService;
