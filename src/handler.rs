//! hickory [`RequestHandler`] serving queries from the resolution engine.
//!
//! The handler owns the request/response plumbing: it rejects requests the
//! engine cannot answer, runs parse → resolve → assemble for the single
//! question, and emits the result. Glue records, NXDOMAIN without SOA and
//! explicit truncation do not fit hickory's `Catalog`/`Authority` model, so
//! the handler writes the message itself.

use hickory_proto::op::{Edns, Header, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, Record};
use hickory_server::authority::{MessageResponse, MessageResponseBuilder};
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use tracing::{debug, error, warn};

use crate::engine::Resolver;
use crate::metrics::{self, QueryResult, Timer};
use crate::response::{max_response_size, Assembler};

/// Serves DNS queries for the configured zones.
#[derive(Clone)]
pub struct Handler {
    resolver: Resolver,
    assembler: Assembler,
}

impl Handler {
    /// Create a handler answering through `resolver`.
    pub fn new(resolver: Resolver) -> Self {
        let assembler = Assembler::new(resolver.config().clone());
        Self {
            resolver,
            assembler,
        }
    }

    async fn lookup<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        let timer = Timer::start();

        let query = match request.request_info() {
            Ok(info) => info.query,
            Err(e) => {
                debug!(id = request.id(), error = %e, "rejecting request without a single question");
                metrics::record_query("unknown", QueryResult::Error, timer.elapsed());
                return send_error(request, response_handle, ResponseCode::FormErr).await;
            }
        };

        let name = Name::from(query.name().clone());
        let rtype = query.query_type();
        let rtype_str = rtype.to_string();

        if query.query_class() != DNSClass::IN {
            debug!(%name, class = ?query.query_class(), "unsupported query class");
            metrics::record_query(&rtype_str, QueryResult::Error, timer.elapsed());
            return send_error(request, response_handle, ResponseCode::NotImp).await;
        }

        let resolution = self.resolver.resolve(&name, rtype);

        let edns = response_edns(request);
        let max_size = max_response_size(request.protocol(), request.edns());
        let mut question = Query::query(name.clone(), rtype);
        question.set_query_class(query.query_class());

        let response = match self
            .assembler
            .assemble(&question, &resolution, edns.is_some(), max_size)
        {
            Ok(response) => response,
            Err(e) => {
                error!(%name, ?rtype, error = %e, "failed to assemble response");
                metrics::record_query(&rtype_str, QueryResult::Error, timer.elapsed());
                return send_error(request, response_handle, ResponseCode::ServFail).await;
            }
        };

        debug!(
            %name,
            ?rtype,
            rcode = %response.rcode,
            answers = response.answers.len(),
            truncated = response.truncated,
            result = resolution.result.as_str(),
            "query answered"
        );
        if resolution.result == QueryResult::Success {
            metrics::record_answers_returned(response.answers.len());
        }
        if response.truncated {
            metrics::record_truncated(&rtype_str);
        }
        metrics::record_query(&rtype_str, resolution.result, timer.elapsed());

        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(response.authoritative);
        header.set_recursion_available(false);
        header.set_truncated(response.truncated);
        header.set_response_code(response.rcode);

        let mut builder = MessageResponseBuilder::from_message_request(request);
        if let Some(edns) = edns {
            builder.edns(edns);
        }
        let message = builder.build(
            header,
            response.answers.iter(),
            std::iter::empty(),
            response.authority.iter(),
            response.additionals.iter(),
        );
        send_response(message, response_handle).await
    }
}

#[async_trait::async_trait]
impl RequestHandler for Handler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        match request.message_type() {
            MessageType::Query => match request.op_code() {
                OpCode::Query => self.lookup(request, response_handle).await,
                _ => {
                    warn!("unimplemented op_code: {:?}", request.op_code());
                    send_error(request, response_handle, ResponseCode::NotImp).await
                }
            },
            MessageType::Response => {
                warn!("got a response as a request from id: {}", request.id());
                send_error(request, response_handle, ResponseCode::FormErr).await
            }
        }
    }
}

/// Sends an error response back to the client.
async fn send_error<R: ResponseHandler>(
    request: &Request,
    response_handle: R,
    code: ResponseCode,
) -> ResponseInfo {
    let response =
        MessageResponseBuilder::from_message_request(request).error_msg(request.header(), code);

    send_response(response, response_handle).await
}

/// Sends the response to the [ResponseHandler] and handles any errors.
async fn send_response<'a, R: ResponseHandler>(
    response: MessageResponse<
        '_,
        'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
    >,
    mut response_handle: R,
) -> ResponseInfo {
    match response_handle.send_response(response).await {
        Ok(info) => info,
        Err(e) => {
            error!("failed to send response: {}", e);
            let mut header = Header::new();
            header.set_response_code(ResponseCode::ServFail);
            header.into()
        }
    }
}

/// Response EDNS mirroring the request's, if it had one.
fn response_edns(request: &Request) -> Option<Edns> {
    let req_edns = request.edns()?;
    let mut resp_edns = Edns::new();
    resp_edns.set_max_payload(req_edns.max_payload().max(512));
    resp_edns.set_version(req_edns.version());
    resp_edns.set_dnssec_ok(req_edns.flags().dnssec_ok);
    Some(resp_edns)
}
