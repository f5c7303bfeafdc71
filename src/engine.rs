//! Resolution engine: maps a query to an answer set or a negative answer.
//!
//! [`Resolver::resolve`] is a pure function of the query, the cluster state
//! it reads through [`ClusterLookup`], and the immutable [`EngineConfig`].
//! It never fails: every outcome is a response code plus records.

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::domain::Label;
use hickory_proto::rr::{Name, RecordType};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::config::{EngineConfig, PodMode};
use crate::index::{ClusterLookup, ReadyAddresses, ReadyEndpoint};
use crate::metrics::QueryResult;
use crate::model::{Service, ServiceKind, ServicePort};
use crate::name::{self, NameError, ParsedName, QueryShape};

/// Record data synthesized by the engine, before TTL and wire conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerData {
    /// IPv4 address.
    A(Ipv4Addr),
    /// IPv6 address.
    Aaaa(Ipv6Addr),
    /// Alias.
    Cname(Name),
    /// Nameserver.
    Ns(Name),
    /// Reverse pointer.
    Ptr(Name),
    /// Service location.
    Srv {
        /// Priority.
        priority: u16,
        /// Relative weight among equal priorities.
        weight: u16,
        /// Port.
        port: u16,
        /// Target host.
        target: Name,
    },
    /// Text.
    Txt(String),
    /// The zone's SOA, built from configuration.
    Soa,
}

/// A synthesized record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    /// Owner name.
    pub name: Name,
    /// Record data.
    pub data: AnswerData,
}

impl Answer {
    fn address(name: &Name, ip: IpAddr) -> Self {
        let data = match ip {
            IpAddr::V4(v4) => AnswerData::A(v4),
            IpAddr::V6(v6) => AnswerData::Aaaa(v6),
        };
        Self {
            name: name.clone(),
            data,
        }
    }
}

/// Outcome of resolving one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Response code.
    pub rcode: ResponseCode,
    /// Answer section.
    pub answers: Vec<Answer>,
    /// Additional section (glue).
    pub additionals: Vec<Answer>,
    /// Zone whose SOA belongs in the authority section.
    pub soa: Option<Name>,
    /// Zone the name belongs to; `None` for names we are not authoritative
    /// for.
    pub zone: Option<Name>,
    /// Classification for metrics and logs.
    pub result: QueryResult,
}

impl Resolution {
    fn answered(zone: &Name, answers: Vec<Answer>, additionals: Vec<Answer>) -> Self {
        if answers.is_empty() {
            return Self::no_data(zone);
        }
        Self {
            rcode: ResponseCode::NoError,
            answers,
            additionals,
            soa: None,
            zone: Some(zone.clone()),
            result: QueryResult::Success,
        }
    }

    fn no_data(zone: &Name) -> Self {
        Self {
            rcode: ResponseCode::NoError,
            answers: Vec::new(),
            additionals: Vec::new(),
            soa: Some(zone.clone()),
            zone: Some(zone.clone()),
            result: QueryResult::NoData,
        }
    }

    fn nx_domain(zone: &Name, result: QueryResult) -> Self {
        Self {
            rcode: ResponseCode::NXDomain,
            answers: Vec::new(),
            additionals: Vec::new(),
            soa: Some(zone.clone()),
            zone: Some(zone.clone()),
            result,
        }
    }

    fn out_of_zone() -> Self {
        Self {
            rcode: ResponseCode::NXDomain,
            answers: Vec::new(),
            additionals: Vec::new(),
            soa: None,
            zone: None,
            result: QueryResult::OutOfZone,
        }
    }

    fn blocked(rcode: ResponseCode) -> Self {
        Self {
            rcode,
            answers: Vec::new(),
            additionals: Vec::new(),
            soa: None,
            zone: None,
            result: QueryResult::Blocked,
        }
    }

    /// True if the answer comes from one of our zones.
    pub fn is_authoritative(&self) -> bool {
        self.zone.is_some()
    }
}

/// Kubernetes service discovery resolver.
#[derive(Clone)]
pub struct Resolver {
    config: Arc<EngineConfig>,
    cluster: Arc<dyn ClusterLookup>,
}

impl Resolver {
    /// Create a resolver over the given configuration and cluster view.
    pub fn new(config: Arc<EngineConfig>, cluster: Arc<dyn ClusterLookup>) -> Self {
        Self { config, cluster }
    }

    /// Engine configuration.
    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// Resolve one query.
    pub fn resolve(&self, name: &Name, rtype: RecordType) -> Resolution {
        // Static overrides never consult the cluster.
        if let Some((_, rcode)) = self.config.deny.iter().find(|(p, _)| p.matches(name)) {
            debug!(%name, %rcode, "name matched deny rule");
            return Resolution::blocked(*rcode);
        }

        let ParsedName { zone, shape } = match name::parse(name, &self.config.zones) {
            Ok(parsed) => parsed,
            Err(NameError::OutsideZones) => {
                trace!(%name, "name outside configured zones");
                return Resolution::out_of_zone();
            }
            Err(NameError::Malformed { zone }) => {
                debug!(%name, %zone, "malformed name");
                return Resolution::nx_domain(&zone, QueryResult::Malformed);
            }
        };

        trace!(%name, ?rtype, ?shape, "resolving");

        match shape {
            QueryShape::Apex => self.resolve_apex(name, &zone, rtype),
            QueryShape::DnsVersion => self.resolve_version(name, &zone, rtype),
            QueryShape::Service { namespace, service } => {
                self.resolve_service(name, &zone, &namespace, &service, rtype)
            }
            QueryShape::Endpoint {
                namespace,
                service,
                endpoint,
            } => self.resolve_endpoint(name, &zone, &namespace, &service, &endpoint, rtype),
            QueryShape::ServicePort {
                namespace,
                service,
                port,
                protocol,
            } => self.resolve_service_port(name, &zone, &namespace, &service, &port, &protocol, rtype),
            QueryShape::Pod { namespace, ip } => self.resolve_pod(name, &zone, &namespace, ip, rtype),
            QueryShape::Intermediate { namespace } => match namespace {
                Some(ns) if !self.cluster.has_namespace(&ns) => self.absent(&zone),
                _ => Resolution::no_data(&zone),
            },
            QueryShape::Reverse { ip } => self.resolve_reverse(name, &zone, ip, rtype),
        }
    }

    /// Negative answer for a name that does not exist (or not yet).
    fn absent(&self, zone: &Name) -> Resolution {
        let result = if self.cluster.is_ready() {
            QueryResult::NxDomain
        } else {
            QueryResult::NotReady
        };
        Resolution::nx_domain(zone, result)
    }

    fn resolve_apex(&self, name: &Name, zone: &Name, rtype: RecordType) -> Resolution {
        match rtype {
            RecordType::NS => {
                let ns = self.config.nameserver.clone();
                let additionals = [RecordType::A, RecordType::AAAA]
                    .into_iter()
                    .flat_map(|glue_type| self.resolve(&ns, glue_type).answers)
                    .filter(|a| matches!(a.data, AnswerData::A(_) | AnswerData::Aaaa(_)))
                    .collect();
                let answer = Answer {
                    name: name.clone(),
                    data: AnswerData::Ns(ns),
                };
                Resolution::answered(zone, vec![answer], additionals)
            }
            RecordType::SOA => {
                let answer = Answer {
                    name: zone.clone(),
                    data: AnswerData::Soa,
                };
                Resolution::answered(zone, vec![answer], Vec::new())
            }
            _ => Resolution::no_data(zone),
        }
    }

    fn resolve_version(&self, name: &Name, zone: &Name, rtype: RecordType) -> Resolution {
        if rtype != RecordType::TXT {
            return Resolution::no_data(zone);
        }
        let answer = Answer {
            name: name.clone(),
            data: AnswerData::Txt(self.config.version.clone()),
        };
        Resolution::answered(zone, vec![answer], Vec::new())
    }

    fn resolve_service(
        &self,
        name: &Name,
        zone: &Name,
        namespace: &str,
        service_name: &str,
        rtype: RecordType,
    ) -> Resolution {
        let Some(service) = self.cluster.lookup_service(namespace, service_name) else {
            debug!(%name, "service not found");
            return self.absent(zone);
        };

        match &service.kind {
            ServiceKind::ExternalName(target) => external_name(name, zone, target, rtype),
            ServiceKind::ClusterIp(ips) => {
                let answers = match rtype {
                    RecordType::A | RecordType::AAAA => ips
                        .iter()
                        .find(|ip| matches_family(ip, rtype))
                        .map(|ip| vec![Answer::address(name, *ip)])
                        .unwrap_or_default(),
                    RecordType::SRV => {
                        let ports: Vec<&ServicePort> = service.ports.iter().collect();
                        return self.cluster_ip_srv(name, zone, &service, &ports);
                    }
                    _ => Vec::new(),
                };
                Resolution::answered(zone, answers, Vec::new())
            }
            ServiceKind::Headless => {
                let ready = self.cluster.list_ready_addresses(namespace, service_name);
                if ready.is_empty() {
                    debug!(%name, "headless service has no ready addresses");
                    return self.absent(zone);
                }
                match rtype {
                    RecordType::A | RecordType::AAAA => {
                        let answers = family(&ready, rtype)
                            .iter()
                            .map(|e| Answer::address(name, e.ip))
                            .collect();
                        Resolution::answered(zone, answers, Vec::new())
                    }
                    RecordType::SRV => {
                        let pairs: Vec<(&ReadyEndpoint, &ServicePort)> = ready
                            .iter()
                            .flat_map(|e| e.ports.iter().map(move |p| (e, p)))
                            .collect();
                        self.headless_srv(name, zone, &service, &pairs)
                    }
                    _ => Resolution::no_data(zone),
                }
            }
        }
    }

    fn resolve_endpoint(
        &self,
        name: &Name,
        zone: &Name,
        namespace: &str,
        service_name: &str,
        token: &str,
        rtype: RecordType,
    ) -> Resolution {
        if self.cluster.lookup_service(namespace, service_name).is_none() {
            debug!(%name, "service not found");
            return self.absent(zone);
        }

        let ready = self.cluster.list_ready_addresses(namespace, service_name);
        let token_ip = name::decode_dashed_ip(token);
        // An endpoint with a hostname is named by it alone.
        let Some(endpoint) = ready.iter().find(|e| match &e.hostname {
            Some(hostname) => hostname == token,
            None => Some(e.ip) == token_ip,
        }) else {
            debug!(%name, "no ready endpoint matches");
            return self.absent(zone);
        };

        let answers = if matches_family(&endpoint.ip, rtype) {
            vec![Answer::address(name, endpoint.ip)]
        } else {
            Vec::new()
        };
        Resolution::answered(zone, answers, Vec::new())
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_service_port(
        &self,
        name: &Name,
        zone: &Name,
        namespace: &str,
        service_name: &str,
        port: &str,
        protocol: &str,
        rtype: RecordType,
    ) -> Resolution {
        let Some(service) = self.cluster.lookup_service(namespace, service_name) else {
            return self.absent(zone);
        };
        let port_matches = |p: &ServicePort| p.name == port && p.protocol.label() == protocol;

        let resolution = match &service.kind {
            ServiceKind::ExternalName(_) => return self.absent(zone),
            ServiceKind::ClusterIp(_) => {
                let ports: Vec<&ServicePort> =
                    service.ports.iter().filter(|p| port_matches(p)).collect();
                self.cluster_ip_srv(name, zone, &service, &ports)
            }
            ServiceKind::Headless => {
                let ready = self.cluster.list_ready_addresses(namespace, service_name);
                let pairs: Vec<(&ReadyEndpoint, &ServicePort)> = ready
                    .iter()
                    .flat_map(|e| e.ports.iter().map(move |p| (e, p)))
                    .filter(|(_, p)| port_matches(p))
                    .collect();
                self.headless_srv(name, zone, &service, &pairs)
            }
        };

        if resolution.answers.is_empty() {
            return self.absent(zone);
        }
        if rtype != RecordType::SRV {
            return Resolution::no_data(zone);
        }
        resolution
    }

    fn cluster_ip_srv(
        &self,
        name: &Name,
        zone: &Name,
        service: &Service,
        ports: &[&ServicePort],
    ) -> Resolution {
        let Some(target) = service_name(zone, service) else {
            return Resolution::no_data(zone);
        };
        let weight = srv_weight(ports.len());
        let answers = ports
            .iter()
            .map(|p| Answer {
                name: name.clone(),
                data: AnswerData::Srv {
                    priority: 0,
                    weight,
                    port: p.port,
                    target: target.clone(),
                },
            })
            .collect();
        let additionals = match &service.kind {
            ServiceKind::ClusterIp(ips) => ips.iter().map(|ip| Answer::address(&target, *ip)).collect(),
            _ => Vec::new(),
        };
        Resolution::answered(zone, answers, additionals)
    }

    fn headless_srv(
        &self,
        name: &Name,
        zone: &Name,
        service: &Service,
        pairs: &[(&ReadyEndpoint, &ServicePort)],
    ) -> Resolution {
        let Some(service_fqdn) = service_name(zone, service) else {
            return Resolution::no_data(zone);
        };
        let weight = srv_weight(pairs.len());
        let mut answers = Vec::with_capacity(pairs.len());
        let mut additionals: Vec<Answer> = Vec::new();

        for (endpoint, port) in pairs {
            let Some(target) = child(&endpoint.label(), &service_fqdn) else {
                continue;
            };
            let glue = Answer::address(&target, endpoint.ip);
            if !additionals.contains(&glue) {
                additionals.push(glue);
            }
            answers.push(Answer {
                name: name.clone(),
                data: AnswerData::Srv {
                    priority: 0,
                    weight,
                    port: port.port,
                    target,
                },
            });
        }
        Resolution::answered(zone, answers, additionals)
    }

    fn resolve_pod(
        &self,
        name: &Name,
        zone: &Name,
        namespace: &str,
        ip: IpAddr,
        rtype: RecordType,
    ) -> Resolution {
        match self.config.pods {
            PodMode::Disabled => return Resolution::nx_domain(zone, QueryResult::NxDomain),
            PodMode::Insecure => {}
            PodMode::Verified => {
                let found = self
                    .cluster
                    .lookup_pod_by_ip(ip)
                    .is_some_and(|pod| pod.namespace == namespace);
                if !found {
                    debug!(%name, "no pod with that address in namespace");
                    return self.absent(zone);
                }
            }
        }

        let answers = if matches_family(&ip, rtype) {
            vec![Answer::address(name, ip)]
        } else {
            Vec::new()
        };
        Resolution::answered(zone, answers, Vec::new())
    }

    fn resolve_reverse(&self, name: &Name, zone: &Name, ip: IpAddr, rtype: RecordType) -> Resolution {
        let primary = &self.config.primary_zone;

        let target = if let Some(service) = self.cluster.lookup_service_by_ip(ip) {
            service_name(primary, &service)
        } else if let Some(found) = self.cluster.lookup_endpoint_by_ip(ip) {
            let relative = format!(
                "{}.{}.{}.svc",
                found.endpoint.label(),
                found.service.name,
                found.service.namespace
            );
            child(&relative, primary)
        } else {
            None
        };

        let Some(target) = target else {
            debug!(%name, %ip, "no service or endpoint for address");
            return self.absent(zone);
        };

        if rtype != RecordType::PTR {
            return Resolution::no_data(zone);
        }
        let answer = Answer {
            name: name.clone(),
            data: AnswerData::Ptr(target),
        };
        Resolution::answered(zone, vec![answer], Vec::new())
    }
}

fn external_name(name: &Name, zone: &Name, target: &str, rtype: RecordType) -> Resolution {
    if !matches!(rtype, RecordType::A | RecordType::AAAA | RecordType::CNAME) {
        return Resolution::no_data(zone);
    }
    let Ok(mut target) = Name::from_ascii(target) else {
        debug!(%name, target, "external name is not a valid DNS name");
        return Resolution::no_data(zone);
    };
    target.set_fqdn(true);
    let answer = Answer {
        name: name.clone(),
        data: AnswerData::Cname(target),
    };
    Resolution::answered(zone, vec![answer], Vec::new())
}

fn service_name(zone: &Name, service: &Service) -> Option<Name> {
    child(&format!("{}.{}.svc", service.name, service.namespace), zone)
}

/// `relative` (one or more labels) under `parent`. Labels are taken as raw
/// bytes: dash-encoded IPv6 labels such as `--1` are not valid hostnames.
fn child(relative: &str, parent: &Name) -> Option<Name> {
    let labels = relative
        .split('.')
        .map(|label| Label::from_raw_bytes(label.as_bytes()))
        .chain(parent.iter().map(Label::from_raw_bytes))
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    Name::from_labels(labels).ok()
}

fn matches_family(ip: &IpAddr, rtype: RecordType) -> bool {
    match rtype {
        RecordType::A => ip.is_ipv4(),
        RecordType::AAAA => ip.is_ipv6(),
        _ => false,
    }
}

fn family(ready: &ReadyAddresses, rtype: RecordType) -> &[ReadyEndpoint] {
    match rtype {
        RecordType::A => &ready.v4,
        RecordType::AAAA => &ready.v6,
        _ => &[],
    }
}

fn srv_weight(count: usize) -> u16 {
    (100 / count.max(1)).max(1) as u16
}
