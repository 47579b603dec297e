use bitstream_io::{BigEndian, BitReader, BitWriter};

use super::{
    ParseError,
    common::PacketComponent,
    enums::{DNSResourceClass, DNSResourceType, ResponseCode},
    header::DNSHeader,
    question::DNSQuestion,
    resource::DNSResource,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DNSPacket {
    pub header: DNSHeader,
    pub questions: Vec<DNSQuestion>,
    pub answers: Vec<DNSResource>,
    pub authorities: Vec<DNSResource>,
    pub resources: Vec<DNSResource>,
}

impl DNSPacket {
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        let mut reader = BitReader::<_, BigEndian>::new(buf);
        let mut packet = DNSPacket::default();

        packet.header.read_with_buffer(&mut reader, buf)?;

        for _ in 0..packet.header.qdcount {
            let mut question = DNSQuestion::default();
            question.read_with_buffer(&mut reader, buf)?;
            packet.questions.push(question);
        }

        for _ in 0..packet.header.ancount {
            let mut answer = DNSResource::default();
            answer.read_with_buffer(&mut reader, buf)?;
            packet.answers.push(answer);
        }

        for _ in 0..packet.header.nscount {
            let mut authority = DNSResource::default();
            authority.read_with_buffer(&mut reader, buf)?;
            packet.authorities.push(authority);
        }

        for _ in 0..packet.header.arcount {
            let mut additional = DNSResource::default();
            additional.read_with_buffer(&mut reader, buf)?;
            packet.resources.push(additional);
        }

        Ok(packet)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, ParseError> {
        let mut buf = Vec::with_capacity(512);
        let mut writer = BitWriter::<_, BigEndian>::new(&mut buf);

        let mut header = self.header.clone();
        header.qdcount = self.questions.len() as u16;
        header.ancount = self.answers.len() as u16;
        header.nscount = self.authorities.len() as u16;
        header.arcount = self.resources.len() as u16;
        header.write(&mut writer)?;

        for question in &self.questions {
            question.write(&mut writer)?;
        }
        for answer in &self.answers {
            answer.write(&mut writer)?;
        }
        for authority in &self.authorities {
            authority.write(&mut writer)?;
        }
        for additional in &self.resources {
            additional.write(&mut writer)?;
        }

        Ok(buf)
    }

    /// Build a reply carrying only the request's question and the given
    /// response code. Used for FORMERR and SERVFAIL.
    pub fn reply_with_rcode(request: &DNSPacket, rcode: ResponseCode) -> Self {
        let mut reply = DNSPacket {
            header: request.header.clone(),
            questions: request.questions.clone(),
            answers: Vec::new(),
            authorities: Vec::new(),
            resources: Vec::new(),
        };
        reply.header.qr = true;
        reply.header.aa = false;
        reply.header.tc = false;
        reply.header.ra = true;
        reply.header.rcode = rcode.to_u8();
        reply
    }

    /// Build a fresh query packet for a background refresh.
    pub fn new_query(
        id: u16,
        qname: &str,
        qtype: DNSResourceType,
        qclass: DNSResourceClass,
    ) -> Self {
        let labels: Vec<String> = qname
            .split('.')
            .filter(|l| !l.is_empty())
            .map(|l| l.to_string())
            .collect();
        let mut packet = DNSPacket::default();
        packet.header.id = id;
        packet.header.rd = true;
        packet.questions.push(DNSQuestion {
            labels,
            qtype,
            qclass,
        });
        packet
    }

    /// TC-flagged copy with all record sections removed, keeping the
    /// question so the client can retry over TCP.
    pub fn truncated(&self) -> Self {
        let mut response = DNSPacket {
            header: self.header.clone(),
            questions: self.questions.clone(),
            answers: Vec::new(),
            authorities: Vec::new(),
            resources: Vec::new(),
        };
        response.header.tc = true;
        response
    }

    /// Minimum TTL across answer records, if any.
    pub fn min_answer_ttl(&self) -> Option<u32> {
        self.answers.iter().map(|r| r.ttl).min()
    }

    /// MINIMUM field of the first SOA record in the authority section.
    pub fn authority_soa_minimum(&self) -> Option<u32> {
        self.authorities.iter().find_map(|r| r.soa_minimum())
    }
}

/// Transaction ID of a raw wire message.
pub fn wire_txid(wire: &[u8]) -> Option<u16> {
    if wire.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([wire[0], wire[1]]))
}

/// Overwrite the transaction ID of a raw wire message in place. The cached
/// wire keeps the upstream's ID; this is the only mutation applied to
/// outbound responses.
pub fn set_wire_txid(wire: &mut [u8], id: u16) {
    if wire.len() >= 2 {
        let bytes = id.to_be_bytes();
        wire[0] = bytes[0];
        wire[1] = bytes[1];
    }
}
