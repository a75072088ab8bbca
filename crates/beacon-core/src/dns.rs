//! Minimal DNS message codec.
//!
//! Beacon speaks ordinary DNS over UDP, unicast and multicast, but only ever
//! uses A, SRV, and TXT records. This codec packs and parses exactly that
//! subset: a header, questions, and answer/additional records. Authority
//! records and unknown record types are skipped on parse, never errors —
//! byzantine packets arrive routinely and must not poison the node.
//!
//! Name parsing follows compression pointers (responses from stock DNS
//! libraries use them); packing always emits uncompressed names.

use std::net::Ipv4Addr;

use thiserror::Error;

/// The INTERNET class. The only class Beacon emits or accepts.
pub const CLASS_IN: u16 = 1;

const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_AUTHORITATIVE: u16 = 0x0400;

/// Hard ceiling on records parsed per section, to bound work on hostile
/// packets. Real Beacon messages carry at most a few dozen records.
const MAX_SECTION_RECORDS: u16 = 128;
const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;
const MAX_POINTER_JUMPS: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DnsError {
    #[error("message truncated")]
    Truncated,
    #[error("label exceeds 63 bytes")]
    LabelTooLong,
    #[error("name exceeds 255 bytes")]
    NameTooLong,
    #[error("bad compression pointer")]
    BadPointer,
    #[error("section record count exceeds {MAX_SECTION_RECORDS}")]
    OversizedSection,
    #[error("txt string exceeds 255 bytes")]
    TxtStringTooLong,
}

/// The record types Beacon understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Txt,
    Srv,
}

impl RecordType {
    pub fn to_u16(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Txt => 16,
            RecordType::Srv => 33,
        }
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(RecordType::A),
            16 => Some(RecordType::Txt),
            33 => Some(RecordType::Srv),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub rtype: RecordType,
}

/// Typed record payload. SRV targets are plain names; Beacon writes
/// dotted-quad hosts into them and receivers re-parse them as addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Srv { port: u16, target: String },
    Txt(Vec<Vec<u8>>),
}

impl RecordData {
    pub fn rtype(&self) -> RecordType {
        match self {
            RecordData::A(_) => RecordType::A,
            RecordData::Srv { .. } => RecordType::Srv,
            RecordData::Txt(_) => RecordType::Txt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub ttl: u32,
    pub data: RecordData,
}

/// One DNS message: header flags plus the three sections Beacon uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub response: bool,
    pub authoritative: bool,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl Message {
    /// An empty reply to `request`: same transaction id, QR and AA set.
    pub fn reply_to(request: &Message) -> Self {
        Self {
            id: request.id,
            response: true,
            authoritative: true,
            ..Default::default()
        }
    }

    pub fn pack(&self) -> Result<Vec<u8>, DnsError> {
        let mut out = Vec::with_capacity(128);
        let mut flags = 0u16;
        if self.response {
            flags |= FLAG_RESPONSE;
        }
        if self.authoritative {
            flags |= FLAG_AUTHORITATIVE;
        }
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&flags.to_be_bytes());
        out.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&(self.additionals.len() as u16).to_be_bytes());

        for question in &self.questions {
            pack_name(&mut out, &question.name)?;
            out.extend_from_slice(&question.rtype.to_u16().to_be_bytes());
            out.extend_from_slice(&CLASS_IN.to_be_bytes());
        }
        for record in self.answers.iter().chain(self.additionals.iter()) {
            pack_record(&mut out, record)?;
        }
        Ok(out)
    }

    pub fn unpack(bytes: &[u8]) -> Result<Self, DnsError> {
        let (id, off) = read_u16(bytes, 0)?;
        let (flags, off) = read_u16(bytes, off)?;
        let (qdcount, off) = read_u16(bytes, off)?;
        let (ancount, off) = read_u16(bytes, off)?;
        let (nscount, off) = read_u16(bytes, off)?;
        let (arcount, mut off) = read_u16(bytes, off)?;

        for count in [qdcount, ancount, nscount, arcount] {
            if count > MAX_SECTION_RECORDS {
                return Err(DnsError::OversizedSection);
            }
        }

        let mut msg = Message {
            id,
            response: flags & FLAG_RESPONSE != 0,
            authoritative: flags & FLAG_AUTHORITATIVE != 0,
            ..Default::default()
        };

        for _ in 0..qdcount {
            let (name, next) = read_name(bytes, off)?;
            let (rtype, next) = read_u16(bytes, next)?;
            let (class, next) = read_u16(bytes, next)?;
            off = next;
            // Unknown types and foreign classes are dropped, not fatal.
            // The top class bit is mDNS unicast-response/cache-flush.
            if class & 0x7fff != CLASS_IN {
                continue;
            }
            if let Some(rtype) = RecordType::from_u16(rtype) {
                msg.questions.push(Question { name, rtype });
            }
        }
        for _ in 0..ancount {
            let (record, next) = read_record(bytes, off)?;
            off = next;
            if let Some(record) = record {
                msg.answers.push(record);
            }
        }
        for _ in 0..nscount {
            let (_, next) = read_record(bytes, off)?;
            off = next;
        }
        for _ in 0..arcount {
            let (record, next) = read_record(bytes, off)?;
            off = next;
            if let Some(record) = record {
                msg.additionals.push(record);
            }
        }
        Ok(msg)
    }
}

fn pack_name(out: &mut Vec<u8>, name: &str) -> Result<(), DnsError> {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.len() > MAX_NAME_LEN {
        return Err(DnsError::NameTooLong);
    }
    for label in name.split('.') {
        if label.is_empty() {
            continue;
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(DnsError::LabelTooLong);
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Ok(())
}

fn pack_record(out: &mut Vec<u8>, record: &Record) -> Result<(), DnsError> {
    pack_name(out, &record.name)?;
    out.extend_from_slice(&record.data.rtype().to_u16().to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());
    out.extend_from_slice(&record.ttl.to_be_bytes());

    let len_at = out.len();
    out.extend_from_slice(&0u16.to_be_bytes());
    match &record.data {
        RecordData::A(addr) => out.extend_from_slice(&addr.octets()),
        RecordData::Srv { port, target } => {
            out.extend_from_slice(&0u16.to_be_bytes()); // priority
            out.extend_from_slice(&0u16.to_be_bytes()); // weight
            out.extend_from_slice(&port.to_be_bytes());
            pack_name(out, target)?;
        }
        RecordData::Txt(strings) => {
            for string in strings {
                if string.len() > 255 {
                    return Err(DnsError::TxtStringTooLong);
                }
                out.push(string.len() as u8);
                out.extend_from_slice(string);
            }
        }
    }
    let rdlen = (out.len() - len_at - 2) as u16;
    out[len_at..len_at + 2].copy_from_slice(&rdlen.to_be_bytes());
    Ok(())
}

fn read_u16(bytes: &[u8], off: usize) -> Result<(u16, usize), DnsError> {
    let slice = bytes.get(off..off + 2).ok_or(DnsError::Truncated)?;
    Ok((u16::from_be_bytes([slice[0], slice[1]]), off + 2))
}

fn read_u32(bytes: &[u8], off: usize) -> Result<(u32, usize), DnsError> {
    let slice = bytes.get(off..off + 4).ok_or(DnsError::Truncated)?;
    Ok((
        u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]),
        off + 4,
    ))
}

/// Parse a possibly-compressed name starting at `off`. Returns the name and
/// the offset just past it in the original record stream.
fn read_name(bytes: &[u8], mut off: usize) -> Result<(String, usize), DnsError> {
    let mut name = String::new();
    let mut resume = None;
    let mut jumps = 0;
    loop {
        let len = *bytes.get(off).ok_or(DnsError::Truncated)? as usize;
        if len == 0 {
            off += 1;
            break;
        }
        if len & 0xc0 == 0xc0 {
            let low = *bytes.get(off + 1).ok_or(DnsError::Truncated)? as usize;
            let target = ((len & 0x3f) << 8) | low;
            if resume.is_none() {
                resume = Some(off + 2);
            }
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS || target >= bytes.len() {
                return Err(DnsError::BadPointer);
            }
            off = target;
            continue;
        }
        if len > MAX_LABEL_LEN {
            return Err(DnsError::LabelTooLong);
        }
        let label = bytes
            .get(off + 1..off + 1 + len)
            .ok_or(DnsError::Truncated)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        if name.len() > MAX_NAME_LEN {
            return Err(DnsError::NameTooLong);
        }
        off += 1 + len;
    }
    Ok((name, resume.unwrap_or(off)))
}

/// Parse one resource record. `Ok(None)` means the record was structurally
/// sound but of a type, class, or shape Beacon does not care about.
fn read_record(bytes: &[u8], off: usize) -> Result<(Option<Record>, usize), DnsError> {
    let (name, off) = read_name(bytes, off)?;
    let (rtype, off) = read_u16(bytes, off)?;
    let (class, off) = read_u16(bytes, off)?;
    let (ttl, off) = read_u32(bytes, off)?;
    let (rdlen, off) = read_u16(bytes, off)?;
    let end = off + rdlen as usize;
    let rdata = bytes.get(off..end).ok_or(DnsError::Truncated)?;

    if class & 0x7fff != CLASS_IN {
        return Ok((None, end));
    }
    let data = match RecordType::from_u16(rtype) {
        Some(RecordType::A) => rdata
            .get(..4)
            .map(|a| RecordData::A(Ipv4Addr::new(a[0], a[1], a[2], a[3]))),
        Some(RecordType::Srv) => {
            if rdata.len() < 6 {
                None
            } else {
                let port = u16::from_be_bytes([rdata[4], rdata[5]]);
                // Target may use compression pointers into the full message.
                read_name(bytes, off + 6)
                    .ok()
                    .map(|(target, _)| RecordData::Srv { port, target })
            }
        }
        Some(RecordType::Txt) => read_txt_strings(rdata),
        None => None,
    };
    Ok((data.map(|data| Record { name, ttl, data }), end))
}

fn read_txt_strings(rdata: &[u8]) -> Option<RecordData> {
    let mut strings = Vec::new();
    let mut off = 0;
    while off < rdata.len() {
        let len = rdata[off] as usize;
        let string = rdata.get(off + 1..off + 1 + len)?;
        strings.push(string.to_vec());
        off += 1 + len;
    }
    Some(RecordData::Txt(strings))
}
