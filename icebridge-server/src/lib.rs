//! # icebridge-server
//!
//! Ice server for icebridge.
//!
//! This crate provides:
//! - TCP listener with per-connection tasks and a connection limit
//! - Optional TLS with client certificate verification
//! - Servant routing by identity and facet, with the built-in `ice_*` operations
//! - YAML and environment configuration

pub mod config;
pub mod error;
pub mod router;
pub mod server;
pub mod stream;
pub mod tls;

pub use config::{Config, ConfigError, ConnectionConfig, NetworkConfig, TlsConfig};
pub use error::ServerError;
pub use router::{Router, Servant, OBJECT_TYPE_ID};
pub use server::{Server, ServerConfig, ServerStats};
