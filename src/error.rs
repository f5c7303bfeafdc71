//! Error types for cluster-dns.

use thiserror::Error;

/// Errors that can occur in the DNS server.
///
/// Query resolution never produces one of these: every query outcome is a
/// response code plus records. These cover startup, configuration and the
/// watch feed.
#[derive(Debug, Error)]
pub enum DnsError {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Kubernetes client error
    #[error("Kubernetes client error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// Failed to parse address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// A watched object is missing a field the index needs
    #[error("Invalid {kind} object: {reason}")]
    InvalidObject {
        /// Object kind (Service, Endpoints, Pod).
        kind: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}
