//! DNS question normalization and response construction.

use std::net::IpAddr;

use hickory_proto::op::{Edns, Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::opt::{EdnsCode, EdnsOption};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};

use crate::error::Result;

/// TTL given to answers synthesized from the hosts table or an IP literal.
pub const SYNTHESIZED_TTL: u32 = 300;

/// Payload size every DNS client accepts over UDP.
pub const MIN_UDP_PAYLOAD: usize = 512;

/// UDP payload size advertised in the OPT records this server builds.
pub const EDNS_PAYLOAD: u16 = 1232;

/// The question being dispatched, normalized for matching and caching.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Question {
    /// Lower-cased name without the trailing dot (`""` for the root).
    pub name: String,
    pub qtype: RecordType,
    pub qclass: DNSClass,
}

impl Question {
    /// Take the first question of a request, if it has one.
    pub fn from_message(message: &Message) -> Option<Self> {
        message.queries().first().map(Self::from_query)
    }

    pub fn from_query(query: &Query) -> Self {
        Self {
            name: normalize_name(query.name()),
            qtype: query.query_type(),
            qclass: query.query_class(),
        }
    }

    /// Build a question directly from a textual name.
    pub fn new(name: &str, qtype: RecordType) -> Self {
        Self {
            name: normalize_str(name),
            qtype,
            qclass: DNSClass::IN,
        }
    }

    /// The name parsed as an IP address, when it is one.
    pub fn ip_literal(&self) -> Option<IpAddr> {
        self.name.parse().ok()
    }
}

/// Join the raw labels of `name`, lower-cased, without a trailing dot.
///
/// Works from raw label bytes so that names which are really address
/// literals (`fe80::1`) survive untouched.
pub fn normalize_name(name: &Name) -> String {
    let labels: Vec<String> = name
        .iter()
        .map(|label| String::from_utf8_lossy(label).to_ascii_lowercase())
        .collect();
    labels.join(".")
}

/// Lower-case a textual name and drop its trailing dot.
pub fn normalize_str(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Start a response to `request`: same id and query section, no records.
pub fn response_to(request: &Message, rcode: ResponseCode) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(rcode);
    response.add_queries(request.queries().iter().cloned());
    if let Some(edns) = reply_edns(request) {
        response.set_edns(edns);
    }
    response
}

/// The OPT record answering `request`.
///
/// `None` when the request had no OPT. Otherwise a fresh record that carries
/// over only the DO bit and the client's own subnet option, so nothing an
/// upstream attached reaches the client.
pub fn reply_edns(request: &Message) -> Option<Edns> {
    let asked = request.extensions().as_ref()?;
    let mut edns = Edns::new();
    edns.set_max_payload(EDNS_PAYLOAD).set_dnssec_ok(asked.dnssec_ok());
    if let Some(subnet @ EdnsOption::Subnet(_)) = asked.option(EdnsCode::Subnet) {
        edns.options_mut().insert(subnet.clone());
    }
    Some(edns)
}

/// Answer `request` with the given addresses, one A/AAAA record each.
pub fn address_response(request: &Message, addresses: &[IpAddr], ttl: u32) -> Message {
    let mut response = response_to(request, ResponseCode::NoError);
    let Some(query) = request.queries().first() else {
        return response;
    };

    for addr in addresses {
        let rdata = match addr {
            IpAddr::V4(v4) => RData::A(A(*v4)),
            IpAddr::V6(v6) => RData::AAAA(AAAA(*v6)),
        };
        response.add_answer(Record::from_rdata(query.name().clone(), ttl, rdata));
    }
    response
}

/// Re-target a stored or upstream response at `request`.
///
/// The upstream's OPT record is replaced by one built from the request.
pub fn adopt(mut response: Message, request: &Message) -> Message {
    response
        .set_id(request.id())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true);
    *response.extensions_mut() = reply_edns(request);
    response
}

/// Whether the answer section carries any record.
pub fn has_answers(message: &Message) -> bool {
    !message.answers().is_empty()
}

/// Addresses carried by A/AAAA records in the answer section.
pub fn answer_addresses(message: &Message) -> impl Iterator<Item = IpAddr> + '_ {
    message.answers().iter().filter_map(|record| match record.data() {
        Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
        Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
        _ => None,
    })
}

/// Minimum TTL across all resource records, `None` if there are none.
pub fn min_ttl(message: &Message) -> Option<u32> {
    message
        .answers()
        .iter()
        .chain(message.name_servers())
        .chain(message.additionals())
        .map(Record::ttl)
        .min()
}

/// Apply `f` to the TTL of every resource record.
pub fn rewrite_ttls(message: &mut Message, f: impl Fn(u32) -> u32) {
    let update = |mut records: Vec<Record>| {
        for record in &mut records {
            let ttl = f(record.ttl());
            record.set_ttl(ttl);
        }
        records
    };

    let answers = update(message.take_answers());
    message.insert_answers(answers);
    let authority = update(message.take_name_servers());
    message.insert_name_servers(authority);
    let additionals = update(message.take_additionals());
    message.insert_additionals(additionals);
}

/// Encode a response for a UDP client that accepts `max_payload` bytes.
///
/// Oversized responses are cut down to header and question with TC set so the
/// client retries over TCP.
pub fn encode_for_udp(response: &Message, max_payload: usize) -> Result<Vec<u8>> {
    let bytes = response.to_vec()?;
    if bytes.len() <= max_payload.max(MIN_UDP_PAYLOAD) {
        return Ok(bytes);
    }

    let mut truncated = response.clone();
    truncated.take_answers();
    truncated.take_name_servers();
    truncated.take_additionals();
    truncated.set_truncated(true);
    Ok(truncated.to_vec()?)
}
