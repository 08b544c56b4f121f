//! Multi-tenant WhatsApp gateway core.
//!
//! Each named instance owns one socket session to the protocol layer. The
//! registry keeps the live runtimes, every protocol event fans out to an
//! in-process realtime hub and to HTTP webhooks, and pluggable traits
//! ([`socket::SocketFactory`], [`repository::Repository`],
//! [`auth::AuthStateStore`]) keep the transport and persistence swappable.

pub mod auth;
pub mod config;
pub mod error;
pub mod hub;
pub mod instance;
pub mod qr;
pub mod registry;
pub mod repository;
pub mod socket;
pub mod token;
pub mod types;
pub mod webhook;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use instance::{ConnectionState, ConnectionStatus, InstanceRuntime, SendOptions};
pub use registry::InstanceRegistry;
pub use types::events::{EventEnvelope, EventKind};
pub use types::jid::Jid;
