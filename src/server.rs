//! DNS server setup and lifecycle management.

use hickory_server::ServerFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, EngineConfig};
use crate::engine::Resolver;
use crate::error::DnsError;
use crate::handler::Handler;
use crate::index::{ClusterIndex, ClusterLookup};
use crate::watch::ClusterWatcher;

/// Interval for emitting state metrics.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// Idle timeout for TCP connections.
const TCP_TIMEOUT: Duration = Duration::from_secs(30);

/// Periodically emit state metrics.
async fn metrics_loop(index: ClusterIndex, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(METRICS_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                index.emit_metrics();
                debug!(
                    services = index.services_count(),
                    endpoints = index.endpoints_count(),
                    pods = index.pods_count(),
                    generation = index.generation(),
                    "emitted state metrics"
                );
            }
            _ = cancel.cancelled() => {
                debug!("metrics loop shutting down");
                return;
            }
        }
    }
}

/// Wait until the index has completed its initial list, for at most
/// `timeout`. Returns false on timeout or cancellation.
async fn wait_for_sync(index: &ClusterIndex, timeout: Duration, cancel: &CancellationToken) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if index.is_ready() {
            return true;
        }
        if cancel.is_cancelled() || tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            _ = cancel.cancelled() => return false,
        }
    }
}

/// Kubernetes-backed authoritative DNS server.
pub struct DnsServer {
    config: Config,
    engine: Arc<EngineConfig>,
    index: ClusterIndex,
}

impl DnsServer {
    /// Create a new DNS server, validating the configuration.
    pub fn new(config: Config) -> Result<Self, DnsError> {
        let engine = EngineConfig::from_dns_config(&config.dns)?;
        Ok(Self {
            config,
            engine: Arc::new(engine),
            index: ClusterIndex::new(),
        })
    }

    /// Get a reference to the cluster index.
    pub fn index(&self) -> &ClusterIndex {
        &self.index
    }

    /// Build the request handler serving from this server's index.
    pub fn handler(&self) -> Handler {
        let cluster: Arc<dyn ClusterLookup> = Arc::new(self.index.clone());
        Handler::new(Resolver::new(self.engine.clone(), cluster))
    }

    /// Run the DNS server until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), DnsError> {
        let dns = &self.config.dns;
        info!(
            listen_addr = %dns.listen_addr,
            zones = ?dns.zones,
            pods = ?dns.pods,
            "Starting cluster-dns server"
        );

        let client = kube::Client::try_default().await?;
        let watcher = ClusterWatcher::new(
            client,
            self.index.clone(),
            self.config.kubernetes.clone(),
        );
        let watch_cancel = cancel.clone();
        let watch_handle = tokio::spawn(async move {
            if let Err(e) = watcher.run(watch_cancel).await {
                error!("Watcher error: {}", e);
            }
        });

        // Serve anyway after the timeout; names not yet synced are NXDOMAIN.
        let sync_timeout = Duration::from_secs(dns.sync_timeout_secs);
        info!(timeout = ?sync_timeout, "Waiting for initial cluster sync...");
        if wait_for_sync(&self.index, sync_timeout, &cancel).await {
            info!(
                services = self.index.services_count(),
                endpoints = self.index.endpoints_count(),
                pods = self.index.pods_count(),
                "Initial cluster sync complete"
            );
        } else if cancel.is_cancelled() {
            info!("Shutdown requested before cluster sync completed");
            let _ = watch_handle.await;
            return Ok(());
        } else {
            warn!("Initial cluster sync timed out, serving with partial state");
        }

        let mut server = ServerFuture::new(self.handler());

        let udp_socket = UdpSocket::bind(dns.listen_addr).await?;
        info!(addr = %dns.listen_addr, "DNS UDP listening");
        server.register_socket(udp_socket);

        let tcp_listener = TcpListener::bind(dns.listen_addr).await?;
        info!(addr = %dns.listen_addr, "DNS TCP listening");
        server.register_listener(tcp_listener, TCP_TIMEOUT);

        info!("DNS server ready to serve queries");

        let metrics_handle = tokio::spawn(metrics_loop(self.index.clone(), cancel.clone()));
        self.index.emit_metrics();

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("DNS server shutdown requested");
            }
            result = server.block_until_done() => {
                if let Err(e) = result {
                    error!("DNS server error: {}", e);
                }
            }
        }

        // Stop the watches and metrics loop even if the server exited on its own.
        cancel.cancel();
        let _ = metrics_handle.await;

        info!("Waiting for watches to stop...");
        let _ = watch_handle.await;

        info!("DNS server stopped");
        Ok(())
    }
}
