//! Configuration types for cluster-dns.
//!
//! [`Config`] is the serde view loaded from disk and the environment.
//! [`EngineConfig`] is the validated, immutable value handed to the
//! resolution engine; building it is where configuration errors surface.

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::Name;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::DnsError;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// DNS server configuration.
    pub dns: DnsConfig,

    /// Kubernetes watch configuration.
    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// DNS server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Address for DNS server to listen on (UDP and TCP).
    pub listen_addr: SocketAddr,

    /// Zones this server is authoritative for (e.g. "cluster.local",
    /// "in-addr.arpa", "ip6.arpa"). The first forward zone is the primary
    /// zone used to qualify relative names.
    #[serde(default = "default_zones")]
    pub zones: Vec<String>,

    /// TTL for synthesized records in seconds.
    #[serde(default = "default_ttl")]
    pub ttl: u32,

    /// Per-zone TTL overrides, keyed by zone name.
    #[serde(default)]
    pub zone_ttls: HashMap<String, u32>,

    /// SOA record configuration.
    #[serde(default)]
    pub soa: SoaConfig,

    /// Authoritative nameserver returned for apex NS queries. Relative names
    /// are qualified with the primary zone.
    #[serde(default = "default_nameserver")]
    pub nameserver: String,

    /// Value of the TXT record served at `dns-version.<zone>`.
    #[serde(default = "default_version")]
    pub version: String,

    /// Static overrides applied before any cluster lookup.
    #[serde(default)]
    pub deny: Vec<DenyRule>,

    /// How `<ip>.<namespace>.pod.<zone>` names are answered.
    #[serde(default)]
    pub pods: PodMode,

    /// How long the server waits for the initial watch sync before serving
    /// anyway.
    #[serde(default = "default_sync_timeout_secs")]
    pub sync_timeout_secs: u64,
}

/// A static override: queries for matching names get `rcode` without any
/// cluster lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenyRule {
    /// Exact name (`blocked.example.com`) or suffix pattern
    /// (`*.example.com`, matching strict subdomains only).
    pub name: String,

    /// Response code to force.
    #[serde(default)]
    pub rcode: ForcedRcode,
}

/// Response codes a deny rule may force.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ForcedRcode {
    /// NXDOMAIN.
    #[default]
    NxDomain,
    /// REFUSED.
    Refused,
    /// SERVFAIL.
    ServFail,
    /// NOERROR with no records.
    NoError,
}

impl From<ForcedRcode> for ResponseCode {
    fn from(rcode: ForcedRcode) -> Self {
        match rcode {
            ForcedRcode::NxDomain => ResponseCode::NXDomain,
            ForcedRcode::Refused => ResponseCode::Refused,
            ForcedRcode::ServFail => ResponseCode::ServFail,
            ForcedRcode::NoError => ResponseCode::NoError,
        }
    }
}

/// Pod record handling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodMode {
    /// Pod names are never answered.
    #[default]
    Disabled,
    /// The IP encoded in the name is returned without checking the cluster.
    Insecure,
    /// Answered only when a pod in that namespace has the encoded IP.
    Verified,
}

/// Kubernetes watch configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// Label selector restricting which Services and Endpoints are indexed.
    #[serde(default)]
    pub label_selector: Option<String>,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "cluster_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// SOA (Start of Authority) record configuration.
///
/// `mname` and `rname` are qualified with the zone being answered when they
/// are relative (no trailing dot).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoaConfig {
    /// Primary nameserver hostname.
    #[serde(default = "default_mname")]
    pub mname: String,

    /// Admin mailbox in DNS format (e.g., "hostmaster").
    #[serde(default = "default_rname")]
    pub rname: String,

    /// Zone serial. Defaults to the process start time in seconds.
    #[serde(default)]
    pub serial: Option<u32>,

    /// Refresh interval in seconds.
    #[serde(default = "default_refresh")]
    pub refresh: u32,

    /// Retry interval in seconds.
    #[serde(default = "default_retry")]
    pub retry: u32,

    /// Expire time in seconds.
    #[serde(default = "default_expire")]
    pub expire: u32,

    /// Minimum (negative caching) TTL in seconds.
    #[serde(default = "default_minimum")]
    pub minimum: u32,
}

fn default_zones() -> Vec<String> {
    vec!["cluster.local".to_string()]
}

fn default_ttl() -> u32 {
    30
}

fn default_nameserver() -> String {
    "kube-dns.kube-system.svc".to_string()
}

fn default_version() -> String {
    "1.1.0".to_string()
}

fn default_sync_timeout_secs() -> u64 {
    5
}

fn default_mname() -> String {
    "ns.dns".to_string()
}

fn default_rname() -> String {
    "hostmaster".to_string()
}

fn default_refresh() -> u32 {
    7200
}

fn default_retry() -> u32 {
    1800
}

fn default_expire() -> u32 {
    86400
}

fn default_minimum() -> u32 {
    30
}

impl Default for SoaConfig {
    fn default() -> Self {
        Self {
            mname: default_mname(),
            rname: default_rname(),
            serial: None,
            refresh: default_refresh(),
            retry: default_retry(),
            expire: default_expire(),
            minimum: default_minimum(),
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 53)),
            zones: default_zones(),
            ttl: default_ttl(),
            zone_ttls: HashMap::new(),
            soa: SoaConfig::default(),
            nameserver: default_nameserver(),
            version: default_version(),
            deny: Vec::new(),
            pods: PodMode::default(),
            sync_timeout_secs: default_sync_timeout_secs(),
        }
    }
}

/// A configured zone with its resolved TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneSettings {
    /// Fully qualified zone apex.
    pub name: Name,
    /// TTL applied to every record answered from this zone.
    pub ttl: u32,
    /// True for `in-addr.arpa.` / `ip6.arpa.` style reverse zones.
    pub reverse: bool,
}

/// Static name matcher built from a [`DenyRule`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamePattern {
    /// Matches exactly this name.
    Exact(Name),
    /// Matches strict subdomains of this name.
    Suffix(Name),
}

impl NamePattern {
    /// Returns true if `name` is matched by this pattern (case-insensitive).
    pub fn matches(&self, name: &Name) -> bool {
        match self {
            NamePattern::Exact(exact) => exact == name,
            NamePattern::Suffix(suffix) => {
                name.num_labels() > suffix.num_labels() && suffix.zone_of(name)
            }
        }
    }
}

/// Validated SOA parameters. Names are kept unqualified when relative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoaSettings {
    /// Primary nameserver, possibly relative.
    pub mname: Name,
    /// Admin mailbox, possibly relative.
    pub rname: Name,
    /// Zone serial.
    pub serial: u32,
    /// Refresh interval in seconds.
    pub refresh: u32,
    /// Retry interval in seconds.
    pub retry: u32,
    /// Expire time in seconds.
    pub expire: u32,
    /// Minimum TTL in seconds.
    pub minimum: u32,
}

/// Immutable configuration for the resolution engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Configured zones, most specific first.
    pub zones: Vec<ZoneSettings>,
    /// First configured forward zone; qualifies relative names and names
    /// returned in PTR answers.
    pub primary_zone: Name,
    /// SOA parameters.
    pub soa: SoaSettings,
    /// Fully qualified apex NS target.
    pub nameserver: Name,
    /// Value served at `dns-version.<zone>`.
    pub version: String,
    /// Static overrides with their forced response code.
    pub deny: Vec<(NamePattern, ResponseCode)>,
    /// Pod record handling.
    pub pods: PodMode,
}

impl EngineConfig {
    /// Validate a [`DnsConfig`] into an engine configuration.
    pub fn from_dns_config(config: &DnsConfig) -> Result<Self, DnsError> {
        if config.zones.is_empty() {
            return Err(DnsError::Config("at least one zone is required".into()));
        }

        let mut zones = Vec::with_capacity(config.zones.len());
        for zone in &config.zones {
            let name = parse_fqdn(zone)?;
            if zones.iter().any(|z: &ZoneSettings| z.name == name) {
                return Err(DnsError::Config(format!("duplicate zone {zone:?}")));
            }
            let ttl = zone_ttl(config, &name);
            let reverse = is_reverse_zone(&name);
            zones.push(ZoneSettings { name, ttl, reverse });
        }

        let primary = zones
            .iter()
            .find(|z| !z.reverse)
            .map(|z| z.name.clone())
            .ok_or_else(|| DnsError::Config("at least one forward zone is required".into()))?;

        // Longest zone first so the most specific suffix wins.
        zones.sort_by(|a, b| b.name.num_labels().cmp(&a.name.num_labels()));

        for zone_name in config.zone_ttls.keys() {
            let name = parse_fqdn(zone_name)?;
            if !zones.iter().any(|z| z.name == name) {
                return Err(DnsError::Config(format!(
                    "TTL override for unconfigured zone {zone_name:?}"
                )));
            }
        }

        let soa = SoaSettings {
            mname: parse_name(&config.soa.mname)?,
            rname: parse_name(&config.soa.rname)?,
            serial: config.soa.serial.unwrap_or_else(default_serial),
            refresh: config.soa.refresh,
            retry: config.soa.retry,
            expire: config.soa.expire,
            minimum: config.soa.minimum,
        };

        let nameserver = qualify(&parse_name(&config.nameserver)?, &primary)?;

        let deny = config
            .deny
            .iter()
            .map(|rule| Ok((parse_pattern(&rule.name)?, <ResponseCode as From<ForcedRcode>>::from(rule.rcode))))
            .collect::<Result<Vec<_>, DnsError>>()?;

        Ok(Self {
            zones,
            primary_zone: primary,
            soa,
            nameserver,
            version: config.version.clone(),
            deny,
            pods: config.pods,
        })
    }
}

/// Qualify a possibly relative name with `zone`.
pub fn qualify(name: &Name, zone: &Name) -> Result<Name, DnsError> {
    if name.is_fqdn() {
        Ok(name.clone())
    } else {
        Ok(name.clone().append_domain(zone)?)
    }
}

fn zone_ttl(config: &DnsConfig, zone: &Name) -> u32 {
    config
        .zone_ttls
        .iter()
        .find(|(key, _)| parse_fqdn(key).is_ok_and(|key| &key == zone))
        .map(|(_, ttl)| *ttl)
        .unwrap_or(config.ttl)
}

fn is_reverse_zone(zone: &Name) -> bool {
    let in_addr = Name::from_ascii("in-addr.arpa.").map(|n| n.zone_of(zone));
    let ip6 = Name::from_ascii("ip6.arpa.").map(|n| n.zone_of(zone));
    in_addr.unwrap_or(false) || ip6.unwrap_or(false)
}

fn parse_name(s: &str) -> Result<Name, DnsError> {
    Name::from_ascii(s).map_err(|e| DnsError::Config(format!("invalid name {s:?}: {e}")))
}

fn parse_fqdn(s: &str) -> Result<Name, DnsError> {
    let mut name = parse_name(s)?;
    name.set_fqdn(true);
    Ok(name)
}

fn parse_pattern(s: &str) -> Result<NamePattern, DnsError> {
    match s.strip_prefix("*.") {
        Some(suffix) => Ok(NamePattern::Suffix(parse_fqdn(suffix)?)),
        None => Ok(NamePattern::Exact(parse_fqdn(s)?)),
    }
}

fn default_serial() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(1)
}
