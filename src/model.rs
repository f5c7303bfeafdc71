//! Cluster objects as the index stores them.
//!
//! These are narrow projections of the Kubernetes `Service`, `Endpoints` and
//! `Pod` kinds holding only what name synthesis needs. Conversions from the
//! `k8s-openapi` types reject objects missing identity or carrying
//! unparseable addresses, so the index never holds a half-converted object.

use k8s_openapi::api::core::v1 as core;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use crate::error::DnsError;

/// Identity of a namespaced object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace.
    pub namespace: String,
    /// Object name.
    pub name: String,
}

impl ObjectKey {
    /// Build a key from borrowed parts.
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// How a Service is addressed. The modes are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceKind {
    /// Virtual IPs, at most one per address family.
    ClusterIp(Vec<IpAddr>),
    /// No virtual IP; names resolve to the backing addresses.
    Headless,
    /// Alias to an external DNS name.
    ExternalName(String),
}

/// Transport protocol of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortProtocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
    /// SCTP.
    Sctp,
}

impl PortProtocol {
    fn parse(protocol: Option<&str>) -> Self {
        match protocol {
            Some(p) if p.eq_ignore_ascii_case("udp") => PortProtocol::Udp,
            Some(p) if p.eq_ignore_ascii_case("sctp") => PortProtocol::Sctp,
            _ => PortProtocol::Tcp,
        }
    }

    /// The lowercase label used in `_port._proto` SRV names.
    pub fn label(&self) -> &'static str {
        match self {
            PortProtocol::Tcp => "tcp",
            PortProtocol::Udp => "udp",
            PortProtocol::Sctp => "sctp",
        }
    }
}

/// A named port on a Service or Endpoints subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePort {
    /// Port name (empty when the object has a single unnamed port).
    pub name: String,
    /// Port number.
    pub port: u16,
    /// Protocol.
    pub protocol: PortProtocol,
}

/// A Service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
    /// Addressing mode.
    pub kind: ServiceKind,
    /// Declared ports.
    pub ports: Vec<ServicePort>,
    /// Pod selector; empty when the service has none.
    pub selector: BTreeMap<String, String>,
}

impl Service {
    /// Index key of this service.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    /// True if the service has no cluster IP.
    pub fn is_headless(&self) -> bool {
        matches!(self.kind, ServiceKind::Headless)
    }
}

/// One address of an Endpoints subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddress {
    /// Address.
    pub ip: IpAddr,
    /// Hostname assigned to the endpoint (e.g. StatefulSet pods).
    pub hostname: Option<String>,
    /// Name of the pod backing this address, if it is a pod.
    pub target_pod: Option<String>,
}

/// A group of addresses sharing the same ports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSubset {
    /// Addresses ready to serve.
    pub addresses: Vec<EndpointAddress>,
    /// Addresses that exist but fail readiness.
    pub not_ready_addresses: Vec<EndpointAddress>,
    /// Ports exposed by the addresses.
    pub ports: Vec<ServicePort>,
}

/// The Endpoints object backing a Service of the same name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Namespace.
    pub namespace: String,
    /// Name (matches the Service).
    pub name: String,
    /// Address subsets in API order.
    pub subsets: Vec<EndpointSubset>,
}

impl Endpoints {
    /// Index key of this object.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }
}

/// A Pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pod {
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
    /// Pod IPs, primary first.
    pub ips: Vec<IpAddr>,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// True when the Ready condition is True and the pod has not terminated.
    pub ready: bool,
}

impl Pod {
    /// Index key of this pod.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    /// True if every selector entry is present in the pod's labels.
    pub fn matches_selector(&self, selector: &BTreeMap<String, String>) -> bool {
        !selector.is_empty()
            && selector
                .iter()
                .all(|(k, v)| self.labels.get(k).is_some_and(|label| label == v))
    }
}

fn object_key(kind: &'static str, meta: &ObjectMeta) -> Result<ObjectKey, DnsError> {
    let name = meta.name.as_deref().ok_or_else(|| DnsError::InvalidObject {
        kind,
        reason: "missing metadata.name".to_string(),
    })?;
    let namespace = meta
        .namespace
        .as_deref()
        .ok_or_else(|| DnsError::InvalidObject {
            kind,
            reason: format!("{name}: missing metadata.namespace"),
        })?;
    Ok(ObjectKey::new(namespace, name))
}

fn parse_ip(s: &str) -> Result<IpAddr, DnsError> {
    s.parse()
        .map_err(|_| DnsError::InvalidAddress(s.to_string()))
}

fn convert_port(name: Option<&str>, port: i32, protocol: Option<&str>) -> Option<ServicePort> {
    Some(ServicePort {
        name: name.unwrap_or_default().to_string(),
        port: u16::try_from(port).ok()?,
        protocol: PortProtocol::parse(protocol),
    })
}

impl TryFrom<&core::Service> for Service {
    type Error = DnsError;

    fn try_from(svc: &core::Service) -> Result<Self, Self::Error> {
        let key = object_key("Service", &svc.metadata)?;
        let spec = svc.spec.as_ref().ok_or_else(|| DnsError::InvalidObject {
            kind: "Service",
            reason: format!("{key}: missing spec"),
        })?;

        let kind = if spec.type_.as_deref() == Some("ExternalName") {
            let target = spec.external_name.clone().ok_or_else(|| DnsError::InvalidObject {
                kind: "Service",
                reason: format!("{key}: ExternalName service without externalName"),
            })?;
            ServiceKind::ExternalName(target)
        } else {
            let cluster_ips: Vec<&str> = match &spec.cluster_ips {
                Some(ips) if !ips.is_empty() => ips.iter().map(String::as_str).collect(),
                _ => spec.cluster_ip.as_deref().into_iter().collect(),
            };
            if cluster_ips.iter().any(|ip| *ip == "None") {
                ServiceKind::Headless
            } else {
                let ips = cluster_ips
                    .into_iter()
                    .filter(|ip| !ip.is_empty())
                    .map(parse_ip)
                    .collect::<Result<Vec<_>, _>>()?;
                ServiceKind::ClusterIp(ips)
            }
        };

        let ports = spec
            .ports
            .iter()
            .flatten()
            .filter_map(|p| convert_port(p.name.as_deref(), p.port, p.protocol.as_deref()))
            .collect();

        Ok(Service {
            namespace: key.namespace,
            name: key.name,
            kind,
            ports,
            selector: spec.selector.clone().unwrap_or_default(),
        })
    }
}

fn convert_address(addr: &core::EndpointAddress) -> Result<EndpointAddress, DnsError> {
    let target_pod = addr
        .target_ref
        .as_ref()
        .filter(|r| r.kind.as_deref() == Some("Pod"))
        .and_then(|r| r.name.clone());
    Ok(EndpointAddress {
        ip: parse_ip(&addr.ip)?,
        hostname: addr.hostname.clone().filter(|h| !h.is_empty()),
        target_pod,
    })
}

impl TryFrom<&core::Endpoints> for Endpoints {
    type Error = DnsError;

    fn try_from(ep: &core::Endpoints) -> Result<Self, Self::Error> {
        let key = object_key("Endpoints", &ep.metadata)?;

        let mut subsets = Vec::new();
        for subset in ep.subsets.iter().flatten() {
            let addresses = subset
                .addresses
                .iter()
                .flatten()
                .map(convert_address)
                .collect::<Result<Vec<_>, _>>()?;
            let not_ready_addresses = subset
                .not_ready_addresses
                .iter()
                .flatten()
                .map(convert_address)
                .collect::<Result<Vec<_>, _>>()?;
            let ports = subset
                .ports
                .iter()
                .flatten()
                .filter_map(|p| convert_port(p.name.as_deref(), p.port, p.protocol.as_deref()))
                .collect();
            subsets.push(EndpointSubset {
                addresses,
                not_ready_addresses,
                ports,
            });
        }

        Ok(Endpoints {
            namespace: key.namespace,
            name: key.name,
            subsets,
        })
    }
}

impl TryFrom<&core::Pod> for Pod {
    type Error = DnsError;

    fn try_from(pod: &core::Pod) -> Result<Self, Self::Error> {
        let key = object_key("Pod", &pod.metadata)?;
        let status = pod.status.as_ref();

        let mut ips = Vec::new();
        if let Some(primary) = status.and_then(|s| s.pod_ip.as_deref()) {
            if !primary.is_empty() {
                ips.push(parse_ip(primary)?);
            }
        }
        for pod_ip in status.and_then(|s| s.pod_ips.as_ref()).into_iter().flatten() {
            let ip: Option<String> = pod_ip.ip.clone().into();
            if let Some(ip) = ip.filter(|ip| !ip.is_empty()) {
                let ip = parse_ip(&ip)?;
                if !ips.contains(&ip) {
                    ips.push(ip);
                }
            }
        }

        let terminated = matches!(
            status.and_then(|s| s.phase.as_deref()),
            Some("Succeeded") | Some("Failed")
        );
        let ready_condition = status
            .and_then(|s| s.conditions.as_ref())
            .into_iter()
            .flatten()
            .any(|c| c.type_ == "Ready" && c.status == "True");

        Ok(Pod {
            namespace: key.namespace,
            name: key.name,
            ips,
            labels: pod.metadata.labels.clone().unwrap_or_default(),
            ready: ready_condition && !terminated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        EndpointPort, EndpointSubset as K8sSubset, ObjectReference, PodCondition, PodStatus,
        ServicePort as K8sServicePort, ServiceSpec,
    };

    fn meta(namespace: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }
    }

    fn k8s_service(spec: ServiceSpec) -> core::Service {
        core::Service {
            metadata: meta("test-1", "svc"),
            spec: Some(spec),
            ..Default::default()
        }
    }

    #[test]
    fn test_cluster_ip_service() {
        let svc = k8s_service(ServiceSpec {
            cluster_ip: Some("10.96.0.100".to_string()),
            ports: Some(vec![K8sServicePort {
                name: Some("http".to_string()),
                port: 80,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        });

        let svc = Service::try_from(&svc).unwrap();
        assert_eq!(
            svc.kind,
            ServiceKind::ClusterIp(vec!["10.96.0.100".parse().unwrap()])
        );
        assert_eq!(svc.ports[0].name, "http");
        assert_eq!(svc.ports[0].port, 80);
        assert_eq!(svc.ports[0].protocol, PortProtocol::Tcp);
        assert_eq!(svc.key(), ObjectKey::new("test-1", "svc"));
    }

    #[test]
    fn test_dual_stack_cluster_ips_preferred() {
        let svc = k8s_service(ServiceSpec {
            cluster_ip: Some("10.96.0.100".to_string()),
            cluster_ips: Some(vec!["10.96.0.100".to_string(), "fd00::100".to_string()]),
            ..Default::default()
        });

        let svc = Service::try_from(&svc).unwrap();
        assert_eq!(
            svc.kind,
            ServiceKind::ClusterIp(vec![
                "10.96.0.100".parse().unwrap(),
                "fd00::100".parse().unwrap()
            ])
        );
    }

    #[test]
    fn test_headless_service() {
        let svc = k8s_service(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
            ..Default::default()
        });

        let svc = Service::try_from(&svc).unwrap();
        assert!(svc.is_headless());
        assert_eq!(svc.selector.get("app").map(String::as_str), Some("web"));
    }

    #[test]
    fn test_external_name_service() {
        let svc = k8s_service(ServiceSpec {
            type_: Some("ExternalName".to_string()),
            external_name: Some("db.example.com".to_string()),
            ..Default::default()
        });

        let svc = Service::try_from(&svc).unwrap();
        assert_eq!(
            svc.kind,
            ServiceKind::ExternalName("db.example.com".to_string())
        );
    }

    #[test]
    fn test_service_without_namespace_rejected() {
        let svc = core::Service {
            metadata: ObjectMeta {
                name: Some("svc".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec::default()),
            ..Default::default()
        };
        assert!(matches!(
            Service::try_from(&svc),
            Err(DnsError::InvalidObject { kind: "Service", .. })
        ));
    }

    #[test]
    fn test_service_invalid_cluster_ip_rejected() {
        let svc = k8s_service(ServiceSpec {
            cluster_ip: Some("not-an-ip".to_string()),
            ..Default::default()
        });
        assert!(matches!(
            Service::try_from(&svc),
            Err(DnsError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_endpoints_conversion_keeps_readiness_split() {
        let ep = core::Endpoints {
            metadata: meta("test-1", "headless-svc"),
            subsets: Some(vec![K8sSubset {
                addresses: Some(vec![core::EndpointAddress {
                    ip: "172.17.0.254".to_string(),
                    hostname: Some("web-0".to_string()),
                    target_ref: Some(ObjectReference {
                        kind: Some("Pod".to_string()),
                        name: Some("web-0".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                not_ready_addresses: Some(vec![core::EndpointAddress {
                    ip: "172.17.0.9".to_string(),
                    ..Default::default()
                }]),
                ports: Some(vec![EndpointPort {
                    name: Some("dns".to_string()),
                    port: 53,
                    protocol: Some("UDP".to_string()),
                    ..Default::default()
                }]),
            }]),
        };

        let ep = Endpoints::try_from(&ep).unwrap();
        let subset = &ep.subsets[0];
        assert_eq!(subset.addresses.len(), 1);
        assert_eq!(subset.addresses[0].hostname.as_deref(), Some("web-0"));
        assert_eq!(subset.addresses[0].target_pod.as_deref(), Some("web-0"));
        assert_eq!(subset.not_ready_addresses.len(), 1);
        assert_eq!(subset.ports[0].protocol, PortProtocol::Udp);
    }

    #[test]
    fn test_pod_readiness() {
        let pod = core::Pod {
            metadata: ObjectMeta {
                labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
                ..meta("test-1", "web-0")
            },
            status: Some(PodStatus {
                pod_ip: Some("172.17.0.10".to_string()),
                phase: Some("Running".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let pod = Pod::try_from(&pod).unwrap();
        assert!(pod.ready);
        assert_eq!(pod.ips, vec!["172.17.0.10".parse::<IpAddr>().unwrap()]);
        assert!(pod.matches_selector(&BTreeMap::from([(
            "app".to_string(),
            "web".to_string()
        )])));
        assert!(!pod.matches_selector(&BTreeMap::new()));
    }

    #[test]
    fn test_terminated_pod_not_ready() {
        let pod = core::Pod {
            metadata: meta("test-1", "job-1"),
            status: Some(PodStatus {
                pod_ip: Some("172.17.0.11".to_string()),
                phase: Some("Succeeded".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert!(!Pod::try_from(&pod).unwrap().ready);
    }
}
