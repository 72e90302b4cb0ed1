//! Basic types for zonedns

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::DnsError;

/// Record type identifier. `Unknown` carries types the engine passes through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType { A, NS, CNAME, SOA, PTR, MX, TXT, AAAA, SRV, OPT, ANY, Unknown(u16) }

impl RecordType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Self::A, 2 => Self::NS, 5 => Self::CNAME, 6 => Self::SOA, 12 => Self::PTR,
            15 => Self::MX, 16 => Self::TXT, 28 => Self::AAAA, 33 => Self::SRV, 41 => Self::OPT,
            255 => Self::ANY, other => Self::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::A => 1, Self::NS => 2, Self::CNAME => 5, Self::SOA => 6, Self::PTR => 12,
            Self::MX => 15, Self::TXT => 16, Self::AAAA => 28, Self::SRV => 33, Self::OPT => 41,
            Self::ANY => 255, Self::Unknown(other) => other,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => f.write_str("A"), Self::NS => f.write_str("NS"),
            Self::CNAME => f.write_str("CNAME"), Self::SOA => f.write_str("SOA"),
            Self::PTR => f.write_str("PTR"), Self::MX => f.write_str("MX"),
            Self::TXT => f.write_str("TXT"), Self::AAAA => f.write_str("AAAA"),
            Self::SRV => f.write_str("SRV"), Self::OPT => f.write_str("OPT"),
            Self::ANY => f.write_str("ANY"),
            Self::Unknown(v) => write!(f, "TYPE{}", v),
        }
    }
}

impl FromStr for RecordType {
    type Err = DnsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let parsed = match upper.as_str() {
            "A" => Self::A, "NS" => Self::NS, "CNAME" => Self::CNAME, "SOA" => Self::SOA,
            "PTR" => Self::PTR, "MX" => Self::MX, "TXT" => Self::TXT, "AAAA" => Self::AAAA,
            "SRV" => Self::SRV, "OPT" => Self::OPT, "ANY" | "*" => Self::ANY,
            other => match other.strip_prefix("TYPE").and_then(|n| n.parse::<u16>().ok()) {
                Some(v) => Self::from_u16(v),
                None => return Err(DnsError::InvalidRecord(format!("unknown record type '{}'", s))),
            },
        };
        Ok(parsed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordClass { IN, CH, HS, ANY, Other(u16) }

impl RecordClass {
    pub fn from_u16(value: u16) -> Self {
        match value { 1 => Self::IN, 3 => Self::CH, 4 => Self::HS, 255 => Self::ANY, other => Self::Other(other) }
    }

    pub fn to_u16(self) -> u16 {
        match self { Self::IN => 1, Self::CH => 3, Self::HS => 4, Self::ANY => 255, Self::Other(v) => v }
    }
}

impl Default for RecordClass {
    fn default() -> Self { Self::IN }
}

impl fmt::Display for RecordClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IN => f.write_str("IN"), Self::CH => f.write_str("CH"),
            Self::HS => f.write_str("HS"), Self::ANY => f.write_str("ANY"),
            Self::Other(v) => write!(f, "CLASS{}", v),
        }
    }
}

/// Typed record payload. The variant decides the record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    AAAA(Ipv6Addr),
    CNAME(String),
    NS(String),
    PTR(String),
    MX { preference: u16, exchange: String },
    TXT(Vec<String>),
    SOA { mname: String, rname: String, serial: u32, refresh: u32, retry: u32, expire: u32, minimum: u32 },
    SRV { priority: u16, weight: u16, port: u16, target: String },
    Opaque { rtype: u16, data: Vec<u8> },
}

impl RData {
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::A(_) => RecordType::A,
            Self::AAAA(_) => RecordType::AAAA,
            Self::CNAME(_) => RecordType::CNAME,
            Self::NS(_) => RecordType::NS,
            Self::PTR(_) => RecordType::PTR,
            Self::MX { .. } => RecordType::MX,
            Self::TXT(_) => RecordType::TXT,
            Self::SOA { .. } => RecordType::SOA,
            Self::SRV { .. } => RecordType::SRV,
            Self::Opaque { rtype, .. } => RecordType::from_u16(*rtype),
        }
    }

    /// Parses presentation-format arguments, e.g. `["10", "mail.example.com"]` for MX.
    pub fn parse(rtype: RecordType, args: &[String]) -> Result<Self, DnsError> {
        let invalid = || DnsError::InvalidRecord(format!("bad {} data: {:?}", rtype, args));
        let arg = |i: usize| args.get(i).map(String::as_str).ok_or_else(invalid);
        let num = |i: usize| -> Result<u32, DnsError> { arg(i)?.parse().map_err(|_| invalid()) };
        let short = |i: usize| -> Result<u16, DnsError> { arg(i)?.parse().map_err(|_| invalid()) };

        let data = match rtype {
            RecordType::A => Self::A(arg(0)?.parse().map_err(|_| invalid())?),
            RecordType::AAAA => Self::AAAA(arg(0)?.parse().map_err(|_| invalid())?),
            RecordType::CNAME => Self::CNAME(arg(0)?.to_string()),
            RecordType::NS => Self::NS(arg(0)?.to_string()),
            RecordType::PTR => Self::PTR(arg(0)?.to_string()),
            RecordType::MX => Self::MX { preference: short(0)?, exchange: arg(1)?.to_string() },
            RecordType::TXT => {
                if args.is_empty() { return Err(invalid()); }
                Self::TXT(args.to_vec())
            }
            RecordType::SOA => Self::SOA {
                mname: arg(0)?.to_string(), rname: arg(1)?.to_string(),
                serial: num(2)?, refresh: num(3)?, retry: num(4)?, expire: num(5)?, minimum: num(6)?,
            },
            RecordType::SRV => Self::SRV {
                priority: short(0)?, weight: short(1)?, port: short(2)?, target: arg(3)?.to_string(),
            },
            _ => return Err(invalid()),
        };
        Ok(data)
    }
}

impl fmt::Display for RData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A(addr) => write!(f, "{}", addr),
            Self::AAAA(addr) => write!(f, "{}", addr),
            Self::CNAME(name) | Self::NS(name) | Self::PTR(name) => f.write_str(name),
            Self::MX { preference, exchange } => write!(f, "{} {}", preference, exchange),
            Self::TXT(parts) => write!(f, "\"{}\"", parts.join("\" \"")),
            Self::SOA { mname, rname, serial, refresh, retry, expire, minimum } => write!(
                f, "{} {} {} {} {} {} {}", mname, rname, serial, refresh, retry, expire, minimum
            ),
            Self::SRV { priority, weight, port, target } => write!(f, "{} {} {} {}", priority, weight, port, target),
            Self::Opaque { data, .. } => write!(f, "\\# {}", data.len()),
        }
    }
}

/// A resource record (an "answer").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub class: RecordClass,
    pub ttl: u32,
    pub data: RData,
}

impl Record {
    pub fn new(name: impl Into<String>, ttl: u32, data: RData) -> Self {
        Self { name: name.into(), class: RecordClass::IN, ttl, data }
    }

    pub fn record_type(&self) -> RecordType { self.data.record_type() }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question { pub name: String, pub qtype: RecordType, pub qclass: RecordClass }

impl Question {
    pub fn new(name: impl Into<String>, qtype: RecordType) -> Self {
        Self { name: name.into(), qtype, qclass: RecordClass::IN }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageKind { #[default] Query, Response }

/// Response codes carried in the low nibble of the flags word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Rcode { NoError = 0, FormErr = 1, ServFail = 2, NxDomain = 3, NotImp = 4, Refused = 5 }

impl Rcode {
    pub fn from_flags(flags: u16) -> u16 { flags & flags::RCODE_MASK }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NOERROR" => Some(Self::NoError), "FORMERR" => Some(Self::FormErr),
            "SERVFAIL" => Some(Self::ServFail), "NXDOMAIN" => Some(Self::NxDomain),
            "NOTIMP" => Some(Self::NotImp), "REFUSED" => Some(Self::Refused),
            _ => None,
        }
    }
}

pub fn rcode_to_str(rcode: u16) -> &'static str {
    match rcode { 0 => "NOERROR", 1 => "FORMERR", 2 => "SERVFAIL", 3 => "NXDOMAIN", 4 => "NOTIMP", 5 => "REFUSED", _ => "UNKNOWN" }
}

/// Header flag bits. The QR bit lives in [`MessageKind`], never in the flags word.
pub mod flags {
    pub const QR: u16 = 0x8000;
    pub const AUTHORITATIVE_ANSWER: u16 = 0x0400;
    pub const TRUNCATED_RESPONSE: u16 = 0x0200;
    pub const RECURSION_DESIRED: u16 = 0x0100;
    pub const RECURSION_AVAILABLE: u16 = 0x0080;
    pub const AUTHENTIC_DATA: u16 = 0x0020;
    pub const CHECKING_DISABLED: u16 = 0x0010;
    pub const RCODE_MASK: u16 = 0x000F;
}

/// A DNS message as seen by handlers and serializers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub kind: MessageKind,
    pub flags: u16,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl Message {
    pub fn query(id: u16, question: Question) -> Self {
        Self { id, flags: flags::RECURSION_DESIRED, questions: vec![question], ..Default::default() }
    }

    pub fn rcode(&self) -> u16 { Rcode::from_flags(self.flags) }

    pub fn is_truncated(&self) -> bool { self.flags & flags::TRUNCATED_RESPONSE != 0 }

    /// Bare response carrying only an id and an rcode, for answers produced outside a handler chain.
    pub fn error_response(id: u16, rcode: Rcode) -> Self {
        Self { id, kind: MessageKind::Response, flags: rcode as u16, ..Default::default() }
    }
}
