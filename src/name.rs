//! Classification of query names into the shapes the engine answers.
//!
//! The parser runs once per query: it finds the most specific configured
//! zone, strips it, and matches the remaining labels against the closed set
//! of [`QueryShape`]s. The engine then matches exhaustively on the result.

use hickory_proto::rr::Name;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::config::ZoneSettings;

/// Reserved label serving the version TXT record.
pub const DNS_VERSION_LABEL: &str = "dns-version";

const SERVICE_LABEL: &str = "svc";
const POD_LABEL: &str = "pod";
const MAX_LABEL_LEN: usize = 63;

/// A query name classified under a zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    /// The configured zone the name falls under.
    pub zone: Name,
    /// What the name asks for.
    pub shape: QueryShape,
}

/// Supported name shapes, relative to a zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryShape {
    /// `<zone>`
    Apex,
    /// `dns-version.<zone>`
    DnsVersion,
    /// `service.namespace.svc.<zone>`
    Service {
        /// Namespace label.
        namespace: String,
        /// Service label.
        service: String,
    },
    /// `endpoint.service.namespace.svc.<zone>`
    Endpoint {
        /// Namespace label.
        namespace: String,
        /// Service label.
        service: String,
        /// Endpoint hostname or dash-encoded IP.
        endpoint: String,
    },
    /// `_port._proto.service.namespace.svc.<zone>`
    ServicePort {
        /// Namespace label.
        namespace: String,
        /// Service label.
        service: String,
        /// Port name, without the leading underscore.
        port: String,
        /// Protocol, without the leading underscore.
        protocol: String,
    },
    /// `a-b-c-d.namespace.pod.<zone>`
    Pod {
        /// Namespace label.
        namespace: String,
        /// Decoded IP.
        ip: IpAddr,
    },
    /// Empty non-terminals: `svc.<zone>`, `ns.svc.<zone>`, `pod.<zone>`,
    /// `ns.pod.<zone>`, and partial reverse names.
    Intermediate {
        /// Namespace label, when the name has one.
        namespace: Option<String>,
    },
    /// A complete `in-addr.arpa.` or `ip6.arpa.` name.
    Reverse {
        /// Decoded IP.
        ip: IpAddr,
    },
}

/// Why a name could not be classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    /// No configured zone contains the name.
    OutsideZones,
    /// The name is inside `zone` but matches no supported shape.
    Malformed {
        /// Zone the name falls under.
        zone: Name,
    },
}

/// Find the most specific zone containing `name`. Zones must be ordered
/// most specific first.
pub fn find_zone<'a>(name: &Name, zones: &'a [ZoneSettings]) -> Option<&'a ZoneSettings> {
    zones.iter().find(|z| z.name.zone_of(name))
}

/// Classify `name` against the configured zones.
pub fn parse(name: &Name, zones: &[ZoneSettings]) -> Result<ParsedName, NameError> {
    let zone = find_zone(name, zones).ok_or(NameError::OutsideZones)?;
    let malformed = || NameError::Malformed {
        zone: zone.name.clone(),
    };

    let shape = if zone.reverse {
        parse_reverse(name, &zone.name).ok_or_else(malformed)?
    } else {
        let labels = relative_labels(name, &zone.name).ok_or_else(malformed)?;
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
        parse_forward(&labels).ok_or_else(malformed)?
    };

    Ok(ParsedName {
        zone: zone.name.clone(),
        shape,
    })
}

/// Lowercased labels of `name` left of `zone`, or `None` if a label is not
/// valid UTF-8.
fn relative_labels(name: &Name, zone: &Name) -> Option<Vec<String>> {
    let count = name.num_labels().saturating_sub(zone.num_labels()) as usize;
    name.iter()
        .take(count)
        .map(|label| std::str::from_utf8(label).ok().map(str::to_ascii_lowercase))
        .collect()
}

fn parse_forward(labels: &[&str]) -> Option<QueryShape> {
    let shape = match labels {
        [] => QueryShape::Apex,
        [DNS_VERSION_LABEL] => QueryShape::DnsVersion,
        [SERVICE_LABEL] | [POD_LABEL] => QueryShape::Intermediate { namespace: None },
        [namespace, SERVICE_LABEL] | [namespace, POD_LABEL] => {
            is_dns1123_label(namespace).then_some(())?;
            QueryShape::Intermediate {
                namespace: Some(namespace.to_string()),
            }
        }
        [service, namespace, SERVICE_LABEL] => {
            (is_dns1035_label(service) && is_dns1123_label(namespace)).then_some(())?;
            QueryShape::Service {
                namespace: namespace.to_string(),
                service: service.to_string(),
            }
        }
        [endpoint, service, namespace, SERVICE_LABEL] => {
            (is_endpoint_label(endpoint)
                && is_dns1035_label(service)
                && is_dns1123_label(namespace))
            .then_some(())?;
            QueryShape::Endpoint {
                namespace: namespace.to_string(),
                service: service.to_string(),
                endpoint: endpoint.to_string(),
            }
        }
        [port, protocol, service, namespace, SERVICE_LABEL] => {
            let port = port.strip_prefix('_').filter(|p| is_dns1123_label(p))?;
            let protocol = protocol.strip_prefix('_').filter(|p| is_dns1123_label(p))?;
            (is_dns1035_label(service) && is_dns1123_label(namespace)).then_some(())?;
            QueryShape::ServicePort {
                namespace: namespace.to_string(),
                service: service.to_string(),
                port: port.to_string(),
                protocol: protocol.to_string(),
            }
        }
        [ip, namespace, POD_LABEL] => {
            is_dns1123_label(namespace).then_some(())?;
            QueryShape::Pod {
                namespace: namespace.to_string(),
                ip: decode_dashed_ip(ip)?,
            }
        }
        _ => return None,
    };
    Some(shape)
}

/// Parse a reverse-mapping name. Names shorter than a full address are
/// intermediate; the zone apex is `Apex`.
fn parse_reverse(name: &Name, zone: &Name) -> Option<QueryShape> {
    if name.num_labels() == zone.num_labels() {
        return Some(QueryShape::Apex);
    }

    let labels: Vec<&str> = name
        .iter()
        .map(std::str::from_utf8)
        .collect::<Result<_, _>>()
        .ok()?;
    let (suffix, digits) = labels.split_last_chunk::<2>().map(|(d, s)| (s, d))?;
    let family = (
        suffix[0].to_ascii_lowercase(),
        suffix[1].to_ascii_lowercase(),
    );

    match (family.0.as_str(), family.1.as_str()) {
        ("in-addr", "arpa") => {
            let octets = digits
                .iter()
                .rev()
                .map(|d| d.parse::<u8>().ok())
                .collect::<Option<Vec<u8>>>()?;
            match octets.len() {
                4 => Some(QueryShape::Reverse {
                    ip: IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3])),
                }),
                0..=3 => Some(QueryShape::Intermediate { namespace: None }),
                _ => None,
            }
        }
        ("ip6", "arpa") => {
            let nibbles = digits
                .iter()
                .rev()
                .map(|d| match d.len() {
                    1 => u8::from_str_radix(d, 16).ok(),
                    _ => None,
                })
                .collect::<Option<Vec<u8>>>()?;
            match nibbles.len() {
                32 => {
                    let value = nibbles
                        .iter()
                        .fold(0u128, |acc, nibble| (acc << 4) | u128::from(*nibble));
                    Some(QueryShape::Reverse {
                        ip: IpAddr::V6(Ipv6Addr::from(value)),
                    })
                }
                0..=31 => Some(QueryShape::Intermediate { namespace: None }),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Decode a dash-encoded IP label: `172-17-0-222` or `1234-abcd--1`.
pub fn decode_dashed_ip(label: &str) -> Option<IpAddr> {
    if let Ok(v4) = label.replace('-', ".").parse::<Ipv4Addr>() {
        return Some(IpAddr::V4(v4));
    }
    label
        .replace('-', ":")
        .parse::<Ipv6Addr>()
        .ok()
        .map(IpAddr::V6)
}

/// RFC 1123 label: lowercase alphanumerics and '-', starting and ending
/// alphanumeric.
pub fn is_dns1123_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= MAX_LABEL_LEN
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0] != b'-'
        && bytes[bytes.len() - 1] != b'-'
}

/// RFC 1035 label: an RFC 1123 label that starts with a letter.
pub fn is_dns1035_label(label: &str) -> bool {
    is_dns1123_label(label) && label.as_bytes()[0].is_ascii_lowercase()
}

fn is_endpoint_label(label: &str) -> bool {
    is_dns1123_label(label) || (label.len() <= MAX_LABEL_LEN && decode_dashed_ip(label).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(s: &str) -> Name {
        Name::from_ascii(s).unwrap()
    }

    /// Name built from raw labels, for labels `from_ascii` refuses.
    fn raw(s: &str) -> Name {
        Name::from_labels(s.trim_end_matches('.').split('.').map(str::as_bytes)).unwrap()
    }

    fn zones() -> Vec<ZoneSettings> {
        vec![
            ZoneSettings {
                name: n("cluster.local."),
                ttl: 30,
                reverse: false,
            },
            ZoneSettings {
                name: n("in-addr.arpa."),
                ttl: 30,
                reverse: true,
            },
            ZoneSettings {
                name: n("ip6.arpa."),
                ttl: 30,
                reverse: true,
            },
        ]
    }

    fn shape(s: &str) -> QueryShape {
        parse(&n(s), &zones()).unwrap().shape
    }

    fn malformed(s: &str) -> bool {
        matches!(parse(&n(s), &zones()), Err(NameError::Malformed { .. }))
    }

    #[test]
    fn test_service_name() {
        assert_eq!(
            shape("svc-1-a.test-1.svc.cluster.local."),
            QueryShape::Service {
                namespace: "test-1".to_string(),
                service: "svc-1-a".to_string(),
            }
        );
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(
            shape("SVC-1-A.Test-1.SVC.Cluster.Local."),
            QueryShape::Service {
                namespace: "test-1".to_string(),
                service: "svc-1-a".to_string(),
            }
        );
    }

    #[test]
    fn test_endpoint_name() {
        assert_eq!(
            shape("172-17-0-222.new-svc.test-1.svc.cluster.local."),
            QueryShape::Endpoint {
                namespace: "test-1".to_string(),
                service: "new-svc".to_string(),
                endpoint: "172-17-0-222".to_string(),
            }
        );
        // Dash-encoded IPv6 may begin with a dash.
        assert_eq!(
            parse(&raw("--1.new-svc.test-1.svc.cluster.local."), &zones())
                .unwrap()
                .shape,
            QueryShape::Endpoint {
                namespace: "test-1".to_string(),
                service: "new-svc".to_string(),
                endpoint: "--1".to_string(),
            }
        );
    }

    #[test]
    fn test_srv_name() {
        assert_eq!(
            shape("_http._tcp.svc-1-a.test-1.svc.cluster.local."),
            QueryShape::ServicePort {
                namespace: "test-1".to_string(),
                service: "svc-1-a".to_string(),
                port: "http".to_string(),
                protocol: "tcp".to_string(),
            }
        );
        assert!(malformed("http._tcp.svc-1-a.test-1.svc.cluster.local."));
    }

    #[test]
    fn test_pod_name() {
        assert_eq!(
            shape("172-17-0-10.test-1.pod.cluster.local."),
            QueryShape::Pod {
                namespace: "test-1".to_string(),
                ip: "172.17.0.10".parse().unwrap(),
            }
        );
        assert!(malformed("not-an-ip.test-1.pod.cluster.local."));
    }

    #[test]
    fn test_apex_and_reserved() {
        assert_eq!(shape("cluster.local."), QueryShape::Apex);
        assert_eq!(shape("dns-version.cluster.local."), QueryShape::DnsVersion);
    }

    #[test]
    fn test_intermediate_names() {
        assert_eq!(
            shape("svc.cluster.local."),
            QueryShape::Intermediate { namespace: None }
        );
        assert_eq!(
            shape("test-1.svc.cluster.local."),
            QueryShape::Intermediate {
                namespace: Some("test-1".to_string())
            }
        );
        assert_eq!(
            shape("test-1.pod.cluster.local."),
            QueryShape::Intermediate {
                namespace: Some("test-1".to_string())
            }
        );
    }

    #[test]
    fn test_outside_zones() {
        assert_eq!(
            parse(&n("example.com."), &zones()),
            Err(NameError::OutsideZones)
        );
    }

    #[test]
    fn test_malformed_names() {
        // Too many labels.
        assert!(malformed("a.b.c.d.e.f.svc.cluster.local."));
        // Unknown second-level label.
        assert!(malformed("foo.test-1.bar.cluster.local."));
        // Service names must start with a letter.
        assert!(malformed("1svc.test-1.svc.cluster.local."));
        // Underscores are not valid in namespaces.
        assert!(malformed("svc.test_1.svc.cluster.local."));
        // Malformed names remember their zone.
        assert_eq!(
            parse(&n("a.b.c.d.e.f.svc.cluster.local."), &zones()),
            Err(NameError::Malformed {
                zone: n("cluster.local.")
            })
        );
    }

    #[test]
    fn test_reverse_v4() {
        assert_eq!(
            shape("100.0.96.10.in-addr.arpa."),
            QueryShape::Reverse {
                ip: "10.96.0.100".parse().unwrap()
            }
        );
        assert_eq!(
            shape("96.10.in-addr.arpa."),
            QueryShape::Intermediate { namespace: None }
        );
        assert_eq!(shape("in-addr.arpa."), QueryShape::Apex);
        assert!(malformed("300.0.96.10.in-addr.arpa."));
    }

    #[test]
    fn test_reverse_v6() {
        let name = "1.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.d.c.b.a.4.3.2.1.ip6.arpa.";
        assert_eq!(
            shape(name),
            QueryShape::Reverse {
                ip: "1234:abcd::1".parse().unwrap()
            }
        );
        assert!(malformed("10.0.0.0.ip6.arpa."));
    }

    #[test]
    fn test_most_specific_zone_wins() {
        let mut zones = zones();
        zones.insert(
            0,
            ZoneSettings {
                name: n("svc.cluster.local."),
                ttl: 5,
                reverse: false,
            },
        );
        let parsed = parse(&n("dns-version.svc.cluster.local."), &zones).unwrap();
        assert_eq!(parsed.zone, n("svc.cluster.local."));
        assert_eq!(parsed.shape, QueryShape::DnsVersion);
    }

    #[test]
    fn test_decode_dashed_ip() {
        assert_eq!(
            decode_dashed_ip("172-17-0-222"),
            Some("172.17.0.222".parse().unwrap())
        );
        assert_eq!(
            decode_dashed_ip("1234-abcd--1"),
            Some("1234:abcd::1".parse().unwrap())
        );
        assert_eq!(decode_dashed_ip("web-0"), None);
        assert_eq!(decode_dashed_ip("172-17-0"), None);
    }

    #[test]
    fn test_label_rules() {
        assert!(is_dns1123_label("test-1"));
        assert!(is_dns1123_label("1test"));
        assert!(!is_dns1123_label("-test"));
        assert!(!is_dns1123_label("test-"));
        assert!(!is_dns1123_label(""));
        assert!(!is_dns1123_label(&"a".repeat(64)));
        assert!(is_dns1035_label("svc-1-a"));
        assert!(!is_dns1035_label("1svc"));
    }
}
