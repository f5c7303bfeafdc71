//! Cluster DNS - An authoritative DNS server for Kubernetes service discovery.
//!
//! This crate answers DNS queries for cluster names (services, endpoints,
//! pods and their reverse mappings) from an in-memory index of the cluster
//! that is kept current by Kubernetes watches.
//!
//! ## Features
//!
//! - A/AAAA for cluster-IP and headless services, and for individual endpoints
//! - SRV for named service ports, CNAME for ExternalName services
//! - PTR for cluster IPs and endpoint addresses
//! - Static deny rules that short-circuit before any cluster lookup
//! - Deterministic truncation to the transport size limit
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         cluster-dns                             │
//! │                                                                 │
//! │  ┌──────────────────┐    ┌──────────────────┐                   │
//! │  │ Kubernetes watch │───▶│  Cluster index   │                   │
//! │  │ (svc, ep, pods)  │    │   (in-memory)    │                   │
//! │  └──────────────────┘    └────────┬─────────┘                   │
//! │                                   │ reads                       │
//! │                                   ▼                             │
//! │  ┌──────────────┐   ┌──────────────────┐   ┌──────────────────┐ │
//! │  │ Name parser  │──▶│ Resolution engine│──▶│Response assembler│ │
//! │  └──────────────┘   └──────────────────┘   └────────┬─────────┘ │
//! │         ▲                                           │           │
//! │         │            Hickory DNS server             ▼           │
//! │         └────────────────── UDP/TCP :53 ◀───────────┘           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## DNS Resolution
//!
//! ```text
//! svc-1-a.test-1.svc.cluster.local
//!   → parse: Service { namespace: test-1, service: svc-1-a }
//!   → lookup service; cluster IP → one A record
//!   → headless → one record per ready endpoint address
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use cluster_dns::{Config, DnsServer};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config: Config = load_config();
//!     let server = DnsServer::new(config).unwrap();
//!
//!     let cancel = CancellationToken::new();
//!     server.run(cancel).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod index;
pub mod metrics;
pub mod model;
pub mod name;
pub mod response;
pub mod server;
pub mod telemetry;
pub mod watch;

// Re-export main types
pub use config::{Config, DnsConfig, EngineConfig, SoaConfig, TelemetryConfig};
pub use engine::{Resolution, Resolver};
pub use error::DnsError;
pub use handler::Handler;
pub use index::{ClusterIndex, ClusterLookup};
pub use server::DnsServer;
