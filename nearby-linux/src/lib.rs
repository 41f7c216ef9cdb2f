//! Nearby for Linux: relay hub, link client, LAN discovery and the group runtime that ties them
//! to the `nearby-core` formation controller.

pub mod client;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod events;
pub mod hub;
pub mod runtime;

pub use client::LinkClient;
pub use config::Config;
pub use discovery::{Discovery, DiscoveryEvent, LanDiscovery};
pub use error::LinkError;
pub use events::{GroupEvent, Responder};
pub use hub::{HubConfig, RelayHub};
pub use runtime::{GroupHandle, GroupRuntime, LinkFailure};
