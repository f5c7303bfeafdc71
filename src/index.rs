//! In-memory cluster state index fed by Kubernetes watches.
//!
//! Holds Services, Endpoints and Pods keyed by namespace/name, plus derived
//! lookups by IP. Objects are stored behind `Arc` so a reader either sees the
//! previous version of an object or the next one, never a mix.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use crate::metrics;
use crate::model::{Endpoints, ObjectKey, Pod, Service, ServiceKind, ServicePort};

/// Kinds of object the index tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// core/v1 Service.
    Service,
    /// core/v1 Endpoints.
    Endpoints,
    /// core/v1 Pod.
    Pod,
}

impl ObjectKind {
    /// Lowercase name used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Service => "services",
            ObjectKind::Endpoints => "endpoints",
            ObjectKind::Pod => "pods",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ready address backing a service, with the ports it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyEndpoint {
    /// Address.
    pub ip: IpAddr,
    /// Endpoint hostname, if one was assigned.
    pub hostname: Option<String>,
    /// Ports served on this address.
    pub ports: Vec<ServicePort>,
}

impl ReadyEndpoint {
    /// The label naming this endpoint under its service: the hostname if
    /// set, otherwise the dash-encoded IP.
    pub fn label(&self) -> String {
        match &self.hostname {
            Some(hostname) => hostname.clone(),
            None => dash_encode(&self.ip),
        }
    }
}

/// Ready addresses of a service split by family, in stable order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadyAddresses {
    /// IPv4 endpoints.
    pub v4: Vec<ReadyEndpoint>,
    /// IPv6 endpoints.
    pub v6: Vec<ReadyEndpoint>,
}

impl ReadyAddresses {
    /// True if there is no ready address of either family.
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// All endpoints, IPv4 first.
    pub fn iter(&self) -> impl Iterator<Item = &ReadyEndpoint> {
        self.v4.iter().chain(self.v6.iter())
    }

    fn push(&mut self, endpoint: ReadyEndpoint) {
        let family = if endpoint.ip.is_ipv4() {
            &mut self.v4
        } else {
            &mut self.v6
        };
        match family.iter_mut().find(|e| e.ip == endpoint.ip) {
            Some(existing) => {
                for port in endpoint.ports {
                    if !existing.ports.contains(&port) {
                        existing.ports.push(port);
                    }
                }
                if existing.hostname.is_none() {
                    existing.hostname = endpoint.hostname;
                }
            }
            None => family.push(endpoint),
        }
    }
}

/// A ready endpoint found by reverse lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointMatch {
    /// Service the endpoint belongs to.
    pub service: ObjectKey,
    /// The endpoint itself.
    pub endpoint: ReadyEndpoint,
}

/// Encode an IP as a DNS label: `172.17.0.1` → `172-17-0-1`,
/// `1234:abcd::1` → `1234-abcd--1`.
///
/// IPv6 addresses whose text form embeds a dotted IPv4 tail are written out
/// in full, so the label always decodes back to the same address.
pub fn dash_encode(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string().replace('.', "-"),
        IpAddr::V6(v6) => {
            let text = v6.to_string();
            if text.contains('.') {
                v6.segments()
                    .iter()
                    .map(|s| format!("{s:x}"))
                    .collect::<Vec<_>>()
                    .join("-")
            } else {
                text.replace(':', "-")
            }
        }
    }
}

/// Read-only view of cluster state used by the resolution engine.
pub trait ClusterLookup: Send + Sync {
    /// True once every watched kind has completed its initial list.
    fn is_ready(&self) -> bool;

    /// Find a service by namespace and name.
    fn lookup_service(&self, namespace: &str, name: &str) -> Option<Arc<Service>>;

    /// Find the Endpoints object of a service.
    fn lookup_endpoints(&self, namespace: &str, name: &str) -> Option<Arc<Endpoints>>;

    /// Find a pod by one of its IPs, preferring ready pods.
    fn lookup_pod_by_ip(&self, ip: IpAddr) -> Option<Arc<Pod>>;

    /// Ready addresses of a service. Uses the Endpoints object when present,
    /// otherwise ready pods selected by a headless service.
    fn list_ready_addresses(&self, namespace: &str, name: &str) -> ReadyAddresses;

    /// Find the service owning a cluster IP.
    fn lookup_service_by_ip(&self, ip: IpAddr) -> Option<Arc<Service>>;

    /// Find a ready endpoint address.
    fn lookup_endpoint_by_ip(&self, ip: IpAddr) -> Option<EndpointMatch>;

    /// True if any service exists in the namespace.
    fn has_namespace(&self, namespace: &str) -> bool;
}

/// Thread-safe in-memory cluster state.
#[derive(Debug, Clone, Default)]
pub struct ClusterIndex {
    inner: Arc<RwLock<IndexInner>>,
}

#[derive(Debug, Default)]
struct IndexInner {
    services: HashMap<ObjectKey, Arc<Service>>,

    endpoints: HashMap<ObjectKey, Arc<Endpoints>>,

    /// Ordered so a namespace's pods can be scanned by name.
    pods: BTreeMap<ObjectKey, Arc<Pod>>,

    /// cluster IP -> owning service
    service_by_ip: HashMap<IpAddr, ObjectKey>,

    /// ready endpoint IP -> services listing it
    endpoints_by_ip: HashMap<IpAddr, BTreeSet<ObjectKey>>,

    /// pod IP -> pods holding it (IPs are reused after pods terminate)
    pods_by_ip: HashMap<IpAddr, BTreeSet<ObjectKey>>,

    /// namespace -> number of services in it
    namespaces: HashMap<String, usize>,

    /// Incremented on every applied change.
    generation: u64,

    services_ready: bool,
    endpoints_ready: bool,
    pods_ready: bool,
}

impl IndexInner {
    fn bump(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    fn insert_service(&mut self, service: Service) {
        let key = service.key();
        self.detach_service(&key);
        if let ServiceKind::ClusterIp(ips) = &service.kind {
            for ip in ips {
                self.service_by_ip.insert(*ip, key.clone());
            }
        }
        *self.namespaces.entry(key.namespace.clone()).or_default() += 1;
        self.services.insert(key, Arc::new(service));
    }

    fn detach_service(&mut self, key: &ObjectKey) -> Option<Arc<Service>> {
        let old = self.services.remove(key)?;
        if let ServiceKind::ClusterIp(ips) = &old.kind {
            for ip in ips {
                if self.service_by_ip.get(ip) == Some(key) {
                    self.service_by_ip.remove(ip);
                }
            }
        }
        if let Some(count) = self.namespaces.get_mut(&key.namespace) {
            *count -= 1;
            if *count == 0 {
                self.namespaces.remove(&key.namespace);
            }
        }
        Some(old)
    }

    fn insert_endpoints(&mut self, endpoints: Endpoints) {
        let key = endpoints.key();
        self.detach_endpoints(&key);
        for subset in &endpoints.subsets {
            for addr in &subset.addresses {
                self.endpoints_by_ip
                    .entry(addr.ip)
                    .or_default()
                    .insert(key.clone());
            }
        }
        self.endpoints.insert(key, Arc::new(endpoints));
    }

    fn detach_endpoints(&mut self, key: &ObjectKey) -> Option<Arc<Endpoints>> {
        let old = self.endpoints.remove(key)?;
        for subset in &old.subsets {
            for addr in &subset.addresses {
                remove_from_set(&mut self.endpoints_by_ip, &addr.ip, key);
            }
        }
        Some(old)
    }

    fn insert_pod(&mut self, pod: Pod) {
        let key = pod.key();
        self.detach_pod(&key);
        for ip in &pod.ips {
            self.pods_by_ip.entry(*ip).or_default().insert(key.clone());
        }
        self.pods.insert(key, Arc::new(pod));
    }

    fn detach_pod(&mut self, key: &ObjectKey) -> Option<Arc<Pod>> {
        let old = self.pods.remove(key)?;
        for ip in &old.ips {
            remove_from_set(&mut self.pods_by_ip, ip, key);
        }
        Some(old)
    }

    fn ready_addresses(&self, key: &ObjectKey) -> ReadyAddresses {
        let mut ready = ReadyAddresses::default();

        if let Some(endpoints) = self.endpoints.get(key) {
            for subset in &endpoints.subsets {
                for addr in &subset.addresses {
                    ready.push(ReadyEndpoint {
                        ip: addr.ip,
                        hostname: addr.hostname.clone(),
                        ports: subset.ports.clone(),
                    });
                }
            }
            return ready;
        }

        // Headless services selecting pods directly, without an Endpoints object.
        let Some(service) = self.services.get(key) else {
            return ready;
        };
        if !service.is_headless() || service.selector.is_empty() {
            return ready;
        }
        for pod in self.pods_in_namespace(&key.namespace) {
            if pod.ready && pod.matches_selector(&service.selector) {
                for ip in &pod.ips {
                    ready.push(ReadyEndpoint {
                        ip: *ip,
                        hostname: None,
                        ports: service.ports.clone(),
                    });
                }
            }
        }
        ready
    }

    fn pods_in_namespace<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = &'a Arc<Pod>> {
        self.pods
            .range(ObjectKey::new(namespace, "")..)
            .take_while(move |(key, _)| key.namespace == namespace)
            .map(|(_, pod)| pod)
    }
}

fn remove_from_set(map: &mut HashMap<IpAddr, BTreeSet<ObjectKey>>, ip: &IpAddr, key: &ObjectKey) {
    if let Some(keys) = map.get_mut(ip) {
        keys.remove(key);
        if keys.is_empty() {
            map.remove(ip);
        }
    }
}

impl ClusterIndex {
    /// Create a new empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a service.
    pub fn upsert_service(&self, service: Service) {
        let mut inner = self.inner.write();
        debug!(service = %service.key(), kind = ?service.kind, "upserting service");
        inner.insert_service(service);
        inner.bump();
    }

    /// Remove a service by key.
    pub fn remove_service(&self, key: &ObjectKey) {
        let mut inner = self.inner.write();
        if inner.detach_service(key).is_some() {
            debug!(service = %key, "removed service");
            inner.bump();
        }
    }

    /// Insert or update an Endpoints object.
    pub fn upsert_endpoints(&self, endpoints: Endpoints) {
        let mut inner = self.inner.write();
        debug!(
            endpoints = %endpoints.key(),
            subsets = endpoints.subsets.len(),
            "upserting endpoints"
        );
        inner.insert_endpoints(endpoints);
        inner.bump();
    }

    /// Remove an Endpoints object by key.
    pub fn remove_endpoints(&self, key: &ObjectKey) {
        let mut inner = self.inner.write();
        if inner.detach_endpoints(key).is_some() {
            debug!(endpoints = %key, "removed endpoints");
            inner.bump();
        }
    }

    /// Insert or update a pod.
    pub fn upsert_pod(&self, pod: Pod) {
        let mut inner = self.inner.write();
        debug!(pod = %pod.key(), ready = pod.ready, ips = ?pod.ips, "upserting pod");
        inner.insert_pod(pod);
        inner.bump();
    }

    /// Remove a pod by key.
    pub fn remove_pod(&self, key: &ObjectKey) {
        let mut inner = self.inner.write();
        if inner.detach_pod(key).is_some() {
            debug!(pod = %key, "removed pod");
            inner.bump();
        }
    }

    /// Replace every service with `services` in one step (watch relist).
    pub fn replace_services(&self, services: Vec<Service>) {
        let mut inner = self.inner.write();
        inner.services.clear();
        inner.service_by_ip.clear();
        inner.namespaces.clear();
        for service in services {
            inner.insert_service(service);
        }
        inner.bump();
        debug!(services = inner.services.len(), "replaced services");
    }

    /// Replace every Endpoints object in one step (watch relist).
    pub fn replace_endpoints(&self, endpoints: Vec<Endpoints>) {
        let mut inner = self.inner.write();
        inner.endpoints.clear();
        inner.endpoints_by_ip.clear();
        for ep in endpoints {
            inner.insert_endpoints(ep);
        }
        inner.bump();
        debug!(endpoints = inner.endpoints.len(), "replaced endpoints");
    }

    /// Replace every pod in one step (watch relist).
    pub fn replace_pods(&self, pods: Vec<Pod>) {
        let mut inner = self.inner.write();
        inner.pods.clear();
        inner.pods_by_ip.clear();
        for pod in pods {
            inner.insert_pod(pod);
        }
        inner.bump();
        debug!(pods = inner.pods.len(), "replaced pods");
    }

    /// Mark a kind as having completed its initial list.
    pub fn mark_ready(&self, kind: ObjectKind) {
        let mut inner = self.inner.write();
        match kind {
            ObjectKind::Service => inner.services_ready = true,
            ObjectKind::Endpoints => inner.endpoints_ready = true,
            ObjectKind::Pod => inner.pods_ready = true,
        }
        debug!(
            kind = %kind,
            services_ready = inner.services_ready,
            endpoints_ready = inner.endpoints_ready,
            pods_ready = inner.pods_ready,
            "initial list complete"
        );
    }

    /// Addresses that exist but are not ready. For diagnostics only; these
    /// are never used to answer queries.
    pub fn list_not_ready_addresses(&self, namespace: &str, name: &str) -> Vec<IpAddr> {
        let inner = self.inner.read();
        let key = ObjectKey::new(namespace, name);
        inner
            .endpoints
            .get(&key)
            .map(|ep| {
                ep.subsets
                    .iter()
                    .flat_map(|s| s.not_ready_addresses.iter().map(|a| a.ip))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Change counter, incremented on every applied event.
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    /// Get count of services.
    pub fn services_count(&self) -> usize {
        self.inner.read().services.len()
    }

    /// Get count of Endpoints objects.
    pub fn endpoints_count(&self) -> usize {
        self.inner.read().endpoints.len()
    }

    /// Get count of pods.
    pub fn pods_count(&self) -> usize {
        self.inner.read().pods.len()
    }

    /// Emit current state metrics.
    pub fn emit_metrics(&self) {
        let inner = self.inner.read();
        let ready_pods = inner.pods.values().filter(|p| p.ready).count();

        metrics::record_state_counts(
            inner.services.len(),
            inner.endpoints.len(),
            inner.pods.len(),
        );
        metrics::record_ready_pods(ready_pods);
        metrics::record_ready_state(
            inner.services_ready,
            inner.endpoints_ready,
            inner.pods_ready,
        );
        metrics::record_generation(inner.generation);
    }
}

impl ClusterLookup for ClusterIndex {
    fn is_ready(&self) -> bool {
        let inner = self.inner.read();
        inner.services_ready && inner.endpoints_ready && inner.pods_ready
    }

    fn lookup_service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        let inner = self.inner.read();
        inner.services.get(&ObjectKey::new(namespace, name)).cloned()
    }

    fn lookup_endpoints(&self, namespace: &str, name: &str) -> Option<Arc<Endpoints>> {
        let inner = self.inner.read();
        inner.endpoints.get(&ObjectKey::new(namespace, name)).cloned()
    }

    fn lookup_pod_by_ip(&self, ip: IpAddr) -> Option<Arc<Pod>> {
        let inner = self.inner.read();
        let keys = inner.pods_by_ip.get(&ip)?;
        let mut pods = keys.iter().filter_map(|k| inner.pods.get(k));
        let first = pods.next()?;
        if first.ready {
            return Some(first.clone());
        }
        pods.find(|p| p.ready).or(Some(first)).cloned()
    }

    fn list_ready_addresses(&self, namespace: &str, name: &str) -> ReadyAddresses {
        let inner = self.inner.read();
        inner.ready_addresses(&ObjectKey::new(namespace, name))
    }

    fn lookup_service_by_ip(&self, ip: IpAddr) -> Option<Arc<Service>> {
        let inner = self.inner.read();
        let key = inner.service_by_ip.get(&ip)?;
        inner.services.get(key).cloned()
    }

    fn lookup_endpoint_by_ip(&self, ip: IpAddr) -> Option<EndpointMatch> {
        let inner = self.inner.read();
        let key = inner.endpoints_by_ip.get(&ip)?.iter().next()?;
        let endpoint = inner
            .ready_addresses(key)
            .iter()
            .find(|e| e.ip == ip)
            .cloned()?;
        Some(EndpointMatch {
            service: key.clone(),
            endpoint,
        })
    }

    fn has_namespace(&self, namespace: &str) -> bool {
        self.inner.read().namespaces.contains_key(namespace)
    }
}
