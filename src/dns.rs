//! DNS message parsing and construction.
//!
//! Only what routing needs: the header, the question section, failure
//! replies and enough of the answer section to tell when a zone
//! transfer is finished. Everything else is relayed as opaque bytes.

use std::io;

use thiserror::Error;

pub const HEADER_LEN: usize = 12;

pub const TYPE_SOA: u16 = 6;
pub const TYPE_IXFR: u16 = 251;
pub const TYPE_AXFR: u16 = 252;

pub const RCODE_FORMERR: u8 = 1;
pub const RCODE_SERVFAIL: u8 = 2;

/// Upper bound on compression pointers followed while reading one name.
const MAX_POINTER_JUMPS: usize = 16;

/// A question section entry. Names are lowercased and fully qualified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// Why an inbound message could not be turned into a [`Request`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Shorter than a header; there is nothing to reply to.
    #[error("message shorter than a DNS header")]
    Truncated,

    /// The QR bit is set. Responses are never answered.
    #[error("message is a response")]
    NotAQuery,

    /// Header is intact but the question section is not.
    #[error("malformed question section")]
    Malformed,
}

/// Kind of zone transfer a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Axfr,
    Ixfr,
}

/// A parsed inbound query or transfer request.
///
/// Keeps the original bytes so the message can be forwarded verbatim.
#[derive(Debug, Clone)]
pub struct Request {
    bytes: Vec<u8>,
    questions: Vec<Question>,
    first_question_end: usize,
}

impl Request {
    /// Parse a DNS message (without the TCP length prefix).
    pub fn parse(bytes: Vec<u8>) -> Result<Self, ParseError> {
        if bytes.len() < HEADER_LEN {
            return Err(ParseError::Truncated);
        }
        if bytes[2] & 0x80 != 0 {
            return Err(ParseError::NotAQuery);
        }

        let qdcount = u16::from_be_bytes([bytes[4], bytes[5]]);
        let mut questions = Vec::with_capacity(qdcount as usize);
        let mut pos = HEADER_LEN;
        let mut first_question_end = HEADER_LEN;

        for _ in 0..qdcount {
            let (name, next) = read_name(&bytes, pos).ok_or(ParseError::Malformed)?;
            let qtype = read_u16(&bytes, next).ok_or(ParseError::Malformed)?;
            let qclass = read_u16(&bytes, next + 2).ok_or(ParseError::Malformed)?;
            pos = next + 4;
            if questions.is_empty() {
                first_question_end = pos;
            }
            questions.push(Question {
                name,
                qtype,
                qclass,
            });
        }

        Ok(Self {
            bytes,
            questions,
            first_question_end,
        })
    }

    pub fn id(&self) -> u16 {
        u16::from_be_bytes([self.bytes[0], self.bytes[1]])
    }

    /// The message as received.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    /// Subject name used for authorization and routing.
    pub fn subject(&self) -> Option<&str> {
        self.questions.first().map(|q| q.name.as_str())
    }

    /// Whether any question asks for a zone transfer.
    pub fn is_transfer(&self) -> bool {
        self.transfer_kind().is_some()
    }

    /// The transfer kind requested, AXFR taking precedence over IXFR.
    pub fn transfer_kind(&self) -> Option<TransferKind> {
        let mut kind = None;
        for q in &self.questions {
            match q.qtype {
                TYPE_AXFR => return Some(TransferKind::Axfr),
                TYPE_IXFR => kind = Some(TransferKind::Ixfr),
                _ => {}
            }
        }
        kind
    }

    /// The generic failure reply: SERVFAIL echoing the first question.
    pub fn failure_response(&self) -> Vec<u8> {
        let qdcount = if self.questions.is_empty() { 0 } else { 1 };
        let mut response = reply_header(&self.bytes, RCODE_SERVFAIL, qdcount);
        response.extend_from_slice(&self.bytes[HEADER_LEN..self.first_question_end]);
        response
    }
}

/// FORMERR reply for a message whose header parsed but whose body did not.
///
/// Returns `None` when there is no complete header to answer.
pub fn format_error_response(message: &[u8]) -> Option<Vec<u8>> {
    if message.len() < HEADER_LEN {
        return None;
    }
    Some(reply_header(message, RCODE_FORMERR, 0))
}

/// Reply header mirroring the ID, opcode, RD and CD bits of `request`.
fn reply_header(request: &[u8], rcode: u8, qdcount: u16) -> Vec<u8> {
    let mut header = Vec::with_capacity(512);
    header.extend_from_slice(&request[..2]);
    header.push(0x80 | (request[2] & 0x78) | (request[2] & 0x01));
    header.push((request[3] & 0x10) | (rcode & 0x0F));
    header.extend_from_slice(&qdcount.to_be_bytes());
    header.extend_from_slice(&[0x00; 6]); // ANCOUNT, NSCOUNT, ARCOUNT
    header
}

/// Encode a single-question query. Used by tooling and tests.
pub fn encode_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut data = Vec::with_capacity(512);

    data.extend_from_slice(&id.to_be_bytes());
    data.extend_from_slice(&[0x01, 0x00]); // Flags: standard query, RD
    data.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
    data.extend_from_slice(&[0x00; 6]);

    encode_name(&mut data, name);
    data.extend_from_slice(&qtype.to_be_bytes());
    data.extend_from_slice(&[0x00, 0x01]); // Class: IN

    data
}

/// Append `name` in uncompressed wire format.
pub fn encode_name(buf: &mut Vec<u8>, name: &str) {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
}

fn read_u16(msg: &[u8], pos: usize) -> Option<u16> {
    let bytes = msg.get(pos..pos + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(msg: &[u8], pos: usize) -> Option<u32> {
    let bytes = msg.get(pos..pos + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a possibly compressed name starting at `pos`.
///
/// Returns the lowercased presentation form and the offset just past
/// the name at its original location.
fn read_name(msg: &[u8], start: usize) -> Option<(String, usize)> {
    let mut name = String::new();
    let mut pos = start;
    let mut end = None;
    let mut jumps = 0;

    loop {
        let len = *msg.get(pos)? as usize;
        match len & 0xC0 {
            0x00 if len == 0 => {
                pos += 1;
                break;
            }
            0x00 => {
                let label = msg.get(pos + 1..pos + 1 + len)?;
                push_label(&mut name, label);
                pos += 1 + len;
            }
            0xC0 => {
                let low = *msg.get(pos + 1)? as usize;
                if end.is_none() {
                    end = Some(pos + 2);
                }
                jumps += 1;
                if jumps > MAX_POINTER_JUMPS {
                    return None;
                }
                pos = ((len & 0x3F) << 8) | low;
            }
            _ => return None,
        }
    }

    if name.is_empty() {
        name.push('.');
    }
    Some((name, end.unwrap_or(pos)))
}

fn push_label(name: &mut String, label: &[u8]) {
    for &b in label {
        match b {
            b'.' | b'\\' => {
                name.push('\\');
                name.push(b as char);
            }
            b if b.is_ascii_graphic() => name.push(b.to_ascii_lowercase() as char),
            b => name.push_str(&format!("\\{:03}", b)),
        }
    }
    name.push('.');
}

/// Offset just past the name at `pos`, without decoding it.
fn skip_name(msg: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *msg.get(pos)? as usize;
        match len & 0xC0 {
            0x00 if len == 0 => return Some(pos + 1),
            0x00 => pos += 1 + len,
            0xC0 => return Some(pos + 2),
            _ => return None,
        }
    }
}

/// Follows a zone transfer response stream and reports when it ends.
///
/// AXFR ends with the SOA that closes the zone. IXFR ends after a lone
/// SOA ("up to date"), after the second SOA with the current serial for
/// an AXFR-style reply, or after the third for an incremental reply.
#[derive(Debug)]
pub struct TransferTracker {
    kind: TransferKind,
    envelopes: usize,
    records: usize,
    serial: u32,
    serial_hits: usize,
    incremental: bool,
}

impl TransferTracker {
    pub fn new(kind: TransferKind) -> Self {
        Self {
            kind,
            envelopes: 0,
            records: 0,
            serial: 0,
            serial_hits: 0,
            incremental: false,
        }
    }

    /// Inspect the next envelope. Returns `Ok(true)` once the transfer is complete.
    pub fn observe(&mut self, message: &[u8]) -> io::Result<bool> {
        if message.len() < HEADER_LEN {
            return Err(invalid("transfer envelope shorter than a header"));
        }
        let rcode = message[3] & 0x0F;
        if rcode != 0 {
            return Err(invalid(format!("upstream answered with rcode {}", rcode)));
        }

        let qdcount = u16::from_be_bytes([message[4], message[5]]);
        let ancount = u16::from_be_bytes([message[6], message[7]]) as usize;
        let first_envelope = self.envelopes == 0;
        self.envelopes += 1;

        let mut pos = HEADER_LEN;
        for _ in 0..qdcount {
            pos = skip_name(message, pos).ok_or_else(|| invalid("malformed question"))? + 4;
        }

        for _ in 0..ancount {
            let (rtype, rdata, next) =
                read_record(message, pos).ok_or_else(|| invalid("malformed record"))?;
            pos = next;

            if self.advance(message, rtype, rdata)? {
                return Ok(true);
            }
        }

        if self.kind == TransferKind::Ixfr && first_envelope && ancount == 1 {
            return Ok(true);
        }
        Ok(false)
    }

    fn advance(&mut self, message: &[u8], rtype: u16, rdata: usize) -> io::Result<bool> {
        let index = self.records;
        self.records += 1;

        let serial = if rtype == TYPE_SOA {
            Some(soa_serial(message, rdata).ok_or_else(|| invalid("malformed SOA"))?)
        } else {
            None
        };

        if index == 0 {
            self.serial = serial.ok_or_else(|| invalid("transfer does not start with SOA"))?;
            self.serial_hits = 1;
            return Ok(false);
        }

        match self.kind {
            TransferKind::Axfr => Ok(serial.is_some()),
            TransferKind::Ixfr => {
                if index == 1 {
                    self.incremental = serial.is_some();
                }
                if serial == Some(self.serial) {
                    self.serial_hits += 1;
                }
                let needed = if self.incremental { 3 } else { 2 };
                Ok(self.serial_hits >= needed)
            }
        }
    }
}

/// Returns the record type, the RDATA offset and the offset past the record.
fn read_record(msg: &[u8], pos: usize) -> Option<(u16, usize, usize)> {
    let pos = skip_name(msg, pos)?;
    let rtype = read_u16(msg, pos)?;
    let rdlength = read_u16(msg, pos + 8)? as usize;
    let rdata = pos + 10;
    let end = rdata + rdlength;
    if end > msg.len() {
        return None;
    }
    Some((rtype, rdata, end))
}

fn soa_serial(msg: &[u8], rdata: usize) -> Option<u32> {
    let pos = skip_name(msg, rdata)?;
    let pos = skip_name(msg, pos)?;
    read_u32(msg, pos)
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}
