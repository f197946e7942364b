//! Portway bridge: legacy binary TCP clients to a JSON-over-HTTPS API.
//!
//! Clients hold long-lived TCP sessions speaking the framed protocol from
//! `portway-proto`. Work units land in a staging table — written by inbound
//! `request` frames or by an external producer — and the polling driver
//! drains that table through a bounded worker pool. Each worker calls the
//! upstream API and routes the reply back to the originating client through
//! the connection registry, keyed by the client's ephemeral source port.

pub mod config;
pub mod error;
pub mod pool;
pub mod poller;
pub mod processor;
pub mod registry;
pub mod server;
pub mod transform;
pub mod upstream;

pub use config::BridgeConfig;
pub use error::BridgeError;
