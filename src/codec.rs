use bytes::Bytes;
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};
use thiserror::Error;

/// Classic DNS-over-UDP size limit without EDNS.
pub const UDP_MIN_PAYLOAD: usize = 512;
/// Payload advertised to upstreams and accepted from clients (DNS flag day 2020).
pub const EDNS_PAYLOAD: u16 = 1232;
pub const TCP_MAX_MESSAGE: usize = u16::MAX as usize;

#[derive(Debug, Error)]
#[error("malformed query: {reason}")]
pub struct DecodeError {
    /// Transaction id, when the header was readable.
    pub id: Option<u16>,
    /// Rcode to answer with: FORMERR, or NOTIMP for opcodes we do not serve.
    pub rcode: ResponseCode,
    pub reason: String,
}

impl DecodeError {
    fn malformed(id: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            id,
            rcode: ResponseCode::FormErr,
            reason: reason.into(),
        }
    }
}

/// A client query after decoding; only the first question is served.
#[derive(Debug, Clone)]
pub struct ClientQuery {
    pub id: u16,
    pub query: Query,
    /// Lower-cased name without the trailing dot, used for keys and rules.
    pub qname: String,
    pub recursion_desired: bool,
    pub edns_payload: Option<u16>,
}

impl ClientQuery {
    pub fn qtype(&self) -> RecordType {
        self.query.query_type()
    }

    /// Largest response the client accepts over UDP.
    pub fn udp_limit(&self) -> usize {
        self.edns_payload
            .map(|p| (p as usize).clamp(UDP_MIN_PAYLOAD, EDNS_PAYLOAD as usize))
            .unwrap_or(UDP_MIN_PAYLOAD)
    }
}

/// Decoded answer sections with their rcode. The record TTLs are whatever
/// the producer put there: advertised (upstream) or effective (cache).
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub rcode: ResponseCode,
    pub answers: Vec<Record>,
    pub authority: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl Answer {
    pub fn empty(rcode: ResponseCode) -> Self {
        Self {
            rcode,
            answers: Vec::new(),
            authority: Vec::new(),
            additionals: Vec::new(),
        }
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut Record> {
        self.answers
            .iter_mut()
            .chain(self.authority.iter_mut())
            .chain(self.additionals.iter_mut())
    }

    /// SERVFAIL/REFUSED/NOTIMP: well formed but not a usable resolution.
    pub fn is_server_error(&self) -> bool {
        matches!(
            self.rcode,
            ResponseCode::ServFail | ResponseCode::Refused | ResponseCode::NotImp
        )
    }

    pub fn cap_ttls(&mut self, cap: u32) {
        for r in self.records_mut() {
            if r.ttl() > cap {
                r.set_ttl(cap);
            }
        }
    }
}

pub fn normalize_name(name: &Name) -> String {
    let mut s = name.to_lowercase().to_ascii();
    if s.len() > 1 && s.ends_with('.') {
        s.pop();
    }
    s
}

pub fn decode_query(packet: &[u8]) -> Result<ClientQuery, DecodeError> {
    let header_id = (packet.len() >= 2).then(|| u16::from_be_bytes([packet[0], packet[1]]));
    let msg = Message::from_bytes(packet).map_err(|e| DecodeError::malformed(header_id, e.to_string()))?;
    if msg.message_type() != MessageType::Query {
        return Err(DecodeError::malformed(Some(msg.id()), "not a query"));
    }
    if msg.op_code() != OpCode::Query {
        return Err(DecodeError {
            id: Some(msg.id()),
            rcode: ResponseCode::NotImp,
            reason: format!("unsupported opcode {:?}", msg.op_code()),
        });
    }
    let query = msg
        .queries()
        .first()
        .cloned()
        .ok_or_else(|| DecodeError::malformed(Some(msg.id()), "empty question"))?;
    Ok(ClientQuery {
        id: msg.id(),
        qname: normalize_name(query.name()),
        query,
        recursion_desired: msg.recursion_desired(),
        edns_payload: msg.extensions().as_ref().map(|e| e.max_payload()),
    })
}

/// Query sent to an upstream; the transport rewrites the id per exchange.
pub fn build_upstream_query(query: &Query) -> anyhow::Result<Bytes> {
    let mut msg = Message::new();
    msg.set_id(0);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(query.name().clone(), query.query_type()));
    let mut edns = Edns::new();
    edns.set_max_payload(EDNS_PAYLOAD);
    msg.set_edns(edns);
    emit(&msg)
}

/// Parses an upstream reply and checks that it answers `query`.
pub fn parse_upstream_response(raw: &[u8], query: &Query) -> Result<Answer, String> {
    let msg = Message::from_bytes(raw).map_err(|e| e.to_string())?;
    if msg.message_type() != MessageType::Response {
        return Err("message is not a response".into());
    }
    if let Some(q) = msg.queries().first() {
        if q.query_type() != query.query_type() || normalize_name(q.name()) != normalize_name(query.name()) {
            return Err(format!("question mismatch: got {} {}", q.name(), q.query_type()));
        }
    }
    Ok(Answer {
        rcode: msg.response_code(),
        answers: msg.answers().to_vec(),
        authority: msg.name_servers().to_vec(),
        additionals: msg.additionals().to_vec(),
    })
}

/// TC bit of a raw DNS header.
pub fn is_truncated(raw: &[u8]) -> bool {
    raw.len() >= 3 && raw[2] & 0x02 != 0
}

/// Encodes `answer` for `query`; responses larger than `max_size` are
/// replaced by a header-only truncated reply.
pub fn encode_response(query: &ClientQuery, answer: &Answer, max_size: usize) -> anyhow::Result<Bytes> {
    let mut msg = response_header(query.id, query.recursion_desired, answer.rcode);
    msg.add_query(query.query.clone());
    msg.add_answers(answer.answers.iter().cloned());
    msg.add_name_servers(answer.authority.iter().cloned());
    msg.add_additionals(answer.additionals.iter().cloned());
    if query.edns_payload.is_some() {
        let mut edns = Edns::new();
        edns.set_max_payload(EDNS_PAYLOAD);
        msg.set_edns(edns);
    }
    let out = emit(&msg)?;
    if out.len() <= max_size {
        return Ok(out);
    }

    let mut truncated = response_header(query.id, query.recursion_desired, answer.rcode);
    truncated.set_truncated(true);
    truncated.add_query(query.query.clone());
    emit(&truncated)
}

/// Error reply for a query that could not be decoded; only the id is echoed.
pub fn encode_error(id: u16, rcode: ResponseCode) -> anyhow::Result<Bytes> {
    emit(&response_header(id, false, rcode))
}

/// Wire form of an answer without a question, used for cache persistence.
pub fn encode_answer(answer: &Answer) -> anyhow::Result<Vec<u8>> {
    let mut msg = response_header(0, true, answer.rcode);
    msg.add_answers(answer.answers.iter().cloned());
    msg.add_name_servers(answer.authority.iter().cloned());
    msg.add_additionals(answer.additionals.iter().cloned());
    Ok(emit(&msg)?.to_vec())
}

pub fn decode_answer(raw: &[u8]) -> anyhow::Result<Answer> {
    let msg = Message::from_bytes(raw)?;
    Ok(Answer {
        rcode: msg.response_code(),
        answers: msg.answers().to_vec(),
        authority: msg.name_servers().to_vec(),
        additionals: msg.additionals().to_vec(),
    })
}

fn response_header(id: u16, recursion_desired: bool, rcode: ResponseCode) -> Message {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(recursion_desired);
    msg.set_recursion_available(true);
    msg.set_authoritative(false);
    msg.set_response_code(rcode);
    msg
}

fn emit(msg: &Message) -> anyhow::Result<Bytes> {
    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder)?;
    }
    Ok(Bytes::from(out))
}
