//! Response assembly: turns a [`Resolution`] into wire records that fit the
//! transport.

use hickory_proto::op::{Edns, Message, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CNAME, NS, PTR, SOA, SRV, TXT};
use hickory_proto::rr::{DNSClass, Name, RData, Record};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};
use hickory_proto::xfer::Protocol;
use hickory_proto::ProtoError;
use std::sync::Arc;

use crate::config::{qualify, EngineConfig};
use crate::engine::{Answer, AnswerData, Resolution};
use crate::error::DnsError;

/// Limit for UDP responses without EDNS.
pub const UDP_MAX_SIZE: u16 = 512;

/// Largest response the given transport can carry.
pub fn max_response_size(protocol: Protocol, edns: Option<&Edns>) -> u16 {
    match protocol {
        Protocol::Udp => edns
            .map(|e| e.max_payload().max(UDP_MAX_SIZE))
            .unwrap_or(UDP_MAX_SIZE),
        _ => u16::MAX,
    }
}

/// Records ready to be emitted, with the header flags they require.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledResponse {
    /// Response code, unchanged from the resolution.
    pub rcode: ResponseCode,
    /// AA flag.
    pub authoritative: bool,
    /// TC flag.
    pub truncated: bool,
    /// Answer section.
    pub answers: Vec<Record>,
    /// Authority section (the zone SOA for negative answers).
    pub authority: Vec<Record>,
    /// Additional section.
    pub additionals: Vec<Record>,
}

/// Converts engine answers into hickory records.
#[derive(Debug, Clone)]
pub struct Assembler {
    config: Arc<EngineConfig>,
}

impl Assembler {
    /// Create an assembler using the zone TTLs and SOA from `config`.
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    /// Build the response for `query`, truncated to `max_size` bytes.
    ///
    /// If everything fits nothing is dropped. Otherwise the longest prefix of
    /// answers that fits is kept, authority and additionals are dropped and
    /// the TC flag is set.
    pub fn assemble(
        &self,
        query: &Query,
        resolution: &Resolution,
        edns: bool,
        max_size: u16,
    ) -> Result<AssembledResponse, DnsError> {
        let ttl = self.ttl_for(resolution.zone.as_ref());

        let answers = resolution
            .answers
            .iter()
            .map(|a| self.to_record(a, ttl))
            .collect::<Result<Vec<_>, _>>()?;
        let additionals = resolution
            .additionals
            .iter()
            .map(|a| self.to_record(a, ttl))
            .collect::<Result<Vec<_>, _>>()?;
        let authority = match &resolution.soa {
            Some(zone) => vec![self.soa_record(zone, ttl)?],
            None => Vec::new(),
        };

        let mut response = AssembledResponse {
            rcode: resolution.rcode,
            authoritative: resolution.is_authoritative(),
            truncated: false,
            answers,
            authority,
            additionals,
        };

        let limit = usize::from(max_size);
        if message_len(query, &response, response.answers.len(), edns)? <= limit {
            return Ok(response);
        }

        response.authority.clear();
        response.additionals.clear();
        response.truncated = true;

        // Longest answer prefix that fits, by bisection over its length.
        let (mut fits, mut overflows) = (0, response.answers.len());
        while overflows - fits > 1 {
            let mid = fits + (overflows - fits) / 2;
            if message_len(query, &response, mid, edns)? <= limit {
                fits = mid;
            } else {
                overflows = mid;
            }
        }
        response.answers.truncate(fits);
        Ok(response)
    }

    fn ttl_for(&self, zone: Option<&Name>) -> u32 {
        zone.and_then(|zone| self.config.zones.iter().find(|z| &z.name == zone))
            .map(|z| z.ttl)
            .unwrap_or_default()
    }

    fn to_record(&self, answer: &Answer, ttl: u32) -> Result<Record, DnsError> {
        let rdata = match &answer.data {
            AnswerData::A(ip) => RData::A(A::from(*ip)),
            AnswerData::Aaaa(ip) => RData::AAAA(AAAA::from(*ip)),
            AnswerData::Cname(target) => RData::CNAME(CNAME(target.clone())),
            AnswerData::Ns(target) => RData::NS(NS(target.clone())),
            AnswerData::Ptr(target) => RData::PTR(PTR(target.clone())),
            AnswerData::Srv {
                priority,
                weight,
                port,
                target,
            } => RData::SRV(SRV::new(*priority, *weight, *port, target.clone())),
            AnswerData::Txt(text) => RData::TXT(TXT::new(vec![text.clone()])),
            AnswerData::Soa => return self.soa_record(&answer.name, ttl),
        };
        Ok(record(answer.name.clone(), ttl, rdata))
    }

    /// SOA for `zone`. Relative mname/rname are qualified with the zone.
    fn soa_record(&self, zone: &Name, ttl: u32) -> Result<Record, DnsError> {
        let soa = &self.config.soa;
        let rdata = SOA::new(
            qualify(&soa.mname, zone)?,
            qualify(&soa.rname, zone)?,
            soa.serial,
            soa.refresh as i32,
            soa.retry as i32,
            soa.expire as i32,
            soa.minimum,
        );
        Ok(record(zone.clone(), ttl, RData::SOA(rdata)))
    }
}

fn record(name: Name, ttl: u32, rdata: RData) -> Record {
    let mut record = Record::from_rdata(name, ttl, rdata);
    record.set_dns_class(DNSClass::IN);
    record
}

/// Wire size of the response carrying the first `answers` answers, with
/// names compressed the way the server will emit them.
fn message_len(
    query: &Query,
    response: &AssembledResponse,
    answers: usize,
    edns: bool,
) -> Result<usize, ProtoError> {
    let mut message = Message::new();
    message.add_query(query.clone());
    message.add_answers(response.answers[..answers].iter().cloned());
    message.add_name_servers(response.authority.iter().cloned());
    message.add_additionals(response.additionals.iter().cloned());
    if edns {
        message.set_edns(Edns::new());
    }

    let mut buf = Vec::with_capacity(512);
    let mut encoder = BinEncoder::new(&mut buf);
    message.emit(&mut encoder)?;
    Ok(buf.len())
}
