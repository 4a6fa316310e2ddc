//! Client management module.
//!
//! Owns the live automation clients, one per profile at most.
//! - `whatsapp_client`: the capability traits the rest of the crate drives
//! - `client_supervisor`: creation, lookup and teardown of handles
//! - `bridge_client`: the child-process implementation used in production
//! - `types`: handles, specs, events and counters

pub mod bridge_client;
pub mod client_supervisor;
#[cfg(test)]
pub mod mock_client;
pub mod types;
pub mod whatsapp_client;

pub use bridge_client::{BridgeConfig, BridgeFactory};
pub use client_supervisor::ClientSupervisor;
pub use types::{session_key_for, ClientEvent, ClientHandle, ClientParts, ClientSpec, ClientStats};
pub use whatsapp_client::{ClientFactory, WhatsAppClient};
