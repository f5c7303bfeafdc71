//! Shared test infrastructure for handler integration tests.

#![allow(dead_code)]

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder, BinEncoder};
use hickory_server::authority::{MessageRequest, MessageResponse};
use hickory_server::proto::rr::Record;
use hickory_server::proto::xfer::Protocol;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use k8s_openapi::api::core::v1 as core;
use serde::Deserialize;

use cluster_dns::config::{DnsConfig, SoaConfig};
use cluster_dns::index::{ClusterIndex, ClusterLookup, ObjectKind};
use cluster_dns::model::{Endpoints, Pod, Service};
use cluster_dns::{EngineConfig, Handler, Resolver};

// --- Constants ---

pub const ZONE: &str = "cluster.local.";
pub const TTL: u32 = 303;
pub const SERIAL: u32 = 1502313310;

/// The cluster every integration test starts from.
pub const CLUSTER: &str = r#"
apiVersion: v1
kind: Service
metadata:
  name: svc-1-a
  namespace: test-1
spec:
  clusterIP: 10.96.0.100
  ports:
    - name: http
      port: 80
      protocol: TCP
    - name: https
      port: 443
      protocol: TCP
---
apiVersion: v1
kind: Endpoints
metadata:
  name: svc-1-a
  namespace: test-1
subsets:
  - addresses:
      - ip: 172.17.0.4
      - ip: 172.17.0.5
    ports:
      - name: http
        port: 80
        protocol: TCP
---
apiVersion: v1
kind: Service
metadata:
  name: headless-svc
  namespace: test-1
spec:
  clusterIP: None
  ports:
    - name: http
      port: 80
      protocol: TCP
---
apiVersion: v1
kind: Endpoints
metadata:
  name: headless-svc
  namespace: test-1
subsets:
  - addresses:
      - ip: 172.17.0.254
      - ip: 172.17.0.255
      - ip: "1234:abcd::1"
      - ip: "1234:abcd::2"
    ports:
      - name: http
        port: 80
        protocol: TCP
---
apiVersion: v1
kind: Service
metadata:
  name: svc-unready
  namespace: test-1
spec:
  clusterIP: None
---
apiVersion: v1
kind: Endpoints
metadata:
  name: svc-unready
  namespace: test-1
subsets:
  - notReadyAddresses:
      - ip: 172.17.0.9
    ports:
      - port: 80
        protocol: TCP
---
apiVersion: v1
kind: Service
metadata:
  name: web
  namespace: test-1
spec:
  clusterIP: None
  selector:
    app: web
---
apiVersion: v1
kind: Endpoints
metadata:
  name: web
  namespace: test-1
subsets:
  - addresses:
      - ip: 172.17.0.30
        hostname: web-0
        targetRef:
          kind: Pod
          name: web-0
          namespace: test-1
---
apiVersion: v1
kind: Service
metadata:
  name: ext
  namespace: test-1
spec:
  type: ExternalName
  externalName: db.example.com
---
apiVersion: v1
kind: Service
metadata:
  name: kube-dns
  namespace: kube-system
spec:
  clusterIP: 10.96.0.10
  ports:
    - name: dns
      port: 53
      protocol: UDP
---
apiVersion: v1
kind: Pod
metadata:
  name: client
  namespace: test-1
status:
  phase: Running
  podIP: 172.17.0.50
  conditions:
    - type: Ready
      status: "True"
"#;

/// Objects created after startup.
pub const NEW_OBJECTS: &str = r#"
apiVersion: v1
kind: Service
metadata:
  name: new-svc
  namespace: test-1
spec:
  clusterIP: 10.96.0.222
  ports:
    - name: http
      port: 80
      protocol: TCP
---
apiVersion: v1
kind: Endpoints
metadata:
  name: new-svc
  namespace: test-1
subsets:
  - addresses:
      - ip: 172.17.0.222
    ports:
      - port: 80
        name: http
        protocol: TCP
"#;

// --- TestResponseHandler ---

/// Captures the serialized DNS response for inspection in tests.
///
/// The response is serialized via `MessageResponse::destructive_emit()` and
/// stored as raw wire-format bytes, which can then be parsed with
/// `Message::from_vec()`.
#[derive(Clone)]
pub struct TestResponseHandler {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl TestResponseHandler {
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::with_capacity(512))),
        }
    }

    /// Size of the captured response on the wire.
    pub fn wire_len(&self) -> usize {
        self.buf.lock().unwrap().len()
    }

    /// Parse the captured wire bytes into a `Message` for assertions.
    pub fn into_message(self) -> Message {
        let buf = self.buf.lock().unwrap();
        assert!(!buf.is_empty(), "no response was captured");
        Message::from_vec(&buf).expect("failed to parse captured DNS response")
    }
}

#[async_trait]
impl ResponseHandler for TestResponseHandler {
    async fn send_response<'a>(
        &mut self,
        response: MessageResponse<
            '_,
            'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
        >,
    ) -> io::Result<ResponseInfo> {
        let mut buf = self.buf.lock().unwrap();
        buf.clear();
        let mut encoder = BinEncoder::new(&mut *buf);
        encoder.set_max_size(u16::MAX);
        let info = response
            .destructive_emit(&mut encoder)
            .map_err(io::Error::other)?;
        Ok(info)
    }
}

// --- Cluster builders ---

/// Apply every object in a multi-document YAML string to `index`.
pub fn apply_yaml(index: &ClusterIndex, yaml: &str) {
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = serde_yaml::Value::deserialize(document).expect("invalid YAML document");
        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .expect("object without kind")
            .to_string();
        match kind.as_str() {
            "Service" => {
                let svc: core::Service = serde_yaml::from_value(value).unwrap();
                index.upsert_service(Service::try_from(&svc).unwrap());
            }
            "Endpoints" => {
                let ep: core::Endpoints = serde_yaml::from_value(value).unwrap();
                index.upsert_endpoints(Endpoints::try_from(&ep).unwrap());
            }
            "Pod" => {
                let pod: core::Pod = serde_yaml::from_value(value).unwrap();
                index.upsert_pod(Pod::try_from(&pod).unwrap());
            }
            other => panic!("unsupported kind {other}"),
        }
    }
}

/// The fixture cluster, fully synced.
pub fn fixture_index() -> ClusterIndex {
    let index = ClusterIndex::new();
    apply_yaml(&index, CLUSTER);
    mark_synced(&index);
    index
}

pub fn mark_synced(index: &ClusterIndex) {
    index.mark_ready(ObjectKind::Service);
    index.mark_ready(ObjectKind::Endpoints);
    index.mark_ready(ObjectKind::Pod);
}

// --- Config builders ---

pub fn test_dns_config() -> DnsConfig {
    DnsConfig {
        listen_addr: "127.0.0.1:5353".parse().unwrap(),
        zones: vec![
            "cluster.local".to_string(),
            "in-addr.arpa".to_string(),
            "ip6.arpa".to_string(),
        ],
        ttl: TTL,
        soa: SoaConfig {
            serial: Some(SERIAL),
            ..SoaConfig::default()
        },
        ..DnsConfig::default()
    }
}

pub fn build_handler(config: DnsConfig, index: &ClusterIndex) -> Handler {
    let engine = EngineConfig::from_dns_config(&config).expect("invalid test config");
    let cluster: Arc<dyn ClusterLookup> = Arc::new(index.clone());
    Handler::new(Resolver::new(Arc::new(engine), cluster))
}

// --- Query/Request construction ---

/// Build wire-format bytes for a DNS query, optionally advertising an EDNS
/// payload size.
pub fn build_query_bytes(name: &str, record_type: RecordType, id: u16, edns: Option<u16>) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    let mut query = Query::new();
    query.set_name(Name::from_ascii(name).unwrap());
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);
    msg.add_query(query);
    if let Some(payload) = edns {
        let mut edns = Edns::new();
        edns.set_max_payload(payload);
        msg.set_edns(edns);
    }
    msg.to_vec().unwrap()
}

/// Parse wire bytes into a MessageRequest.
pub fn parse_message_request(bytes: &[u8]) -> MessageRequest {
    let mut decoder = BinDecoder::new(bytes);
    MessageRequest::read(&mut decoder).expect("failed to parse MessageRequest")
}

pub fn client_addr() -> SocketAddr {
    "10.0.0.1:12345".parse().unwrap()
}

/// Build a full `Request` as received over `protocol`.
pub fn build_request(
    name: &str,
    record_type: RecordType,
    protocol: Protocol,
    edns: Option<u16>,
    id: u16,
) -> Request {
    let bytes = build_query_bytes(name, record_type, id, edns);
    let msg = parse_message_request(&bytes);
    Request::new(msg, client_addr(), protocol)
}

// --- Response helpers ---

/// Execute a UDP query without EDNS through the handler.
pub async fn execute_query(handler: &Handler, name: &str, record_type: RecordType) -> Message {
    execute_request(handler, build_request(name, record_type, Protocol::Udp, None, 1))
        .await
        .0
}

/// Execute a request through the handler, returning the response and its
/// wire size.
pub async fn execute_request(handler: &Handler, request: Request) -> (Message, usize) {
    let response = TestResponseHandler::new();
    handler.handle_request(&request, response.clone()).await;
    let len = response.wire_len();
    (response.into_message(), len)
}

/// Extract A and AAAA addresses from a record section, in order.
pub fn addresses(records: &[Record]) -> Vec<IpAddr> {
    records
        .iter()
        .filter_map(|r| match r.data() {
            RData::A(a) => Some(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

pub fn ips(addrs: &[&str]) -> Vec<IpAddr> {
    addrs.iter().map(|a| a.parse().unwrap()).collect()
}

pub fn name(s: &str) -> Name {
    Name::from_ascii(s).unwrap()
}

/// Assert response code.
pub fn assert_response_code(msg: &Message, expected: ResponseCode) {
    assert_eq!(
        msg.response_code(),
        expected,
        "expected {:?}, got {:?}",
        expected,
        msg.response_code()
    );
}

/// Assert a negative answer carrying the SOA of `zone`.
pub fn assert_negative_with_soa(msg: &Message, rcode: ResponseCode, zone: &str) {
    assert_response_code(msg, rcode);
    assert!(msg.answers().is_empty(), "unexpected answers: {:?}", msg.answers());
    assert_eq!(msg.name_servers().len(), 1, "expected exactly one SOA");
    let soa = &msg.name_servers()[0];
    assert_eq!(soa.record_type(), RecordType::SOA);
    assert_eq!(soa.name(), &name(zone));
}
