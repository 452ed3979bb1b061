//! Unified error types for Palisade

use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid regex for rule {name}: {source}")]
    Rule {
        name: String,
        source: regex::Error,
    },

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("Upstream request timeout")]
    UpstreamTimeout,

    #[error("Failed to persist configuration: {0}")]
    Persist(std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
