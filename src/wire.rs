//! RFC 1035 message encoding and decoding.
//!
//! Names are written uncompressed; compression pointers are followed on decode.

use crate::error::DnsError;
use crate::types::{flags, Message, MessageKind, Question, RData, Record, RecordClass, RecordType};

pub const HEADER_LEN: usize = 12;
const MAX_POINTER_JUMPS: usize = 64;
const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;

pub fn encode(msg: &Message) -> Result<Vec<u8>, DnsError> {
    let mut buf = Vec::with_capacity(512);
    let qr = if msg.kind == MessageKind::Response { flags::QR } else { 0 };

    buf.extend_from_slice(&msg.id.to_be_bytes());
    buf.extend_from_slice(&((msg.flags & !flags::QR) | qr).to_be_bytes());
    for count in [msg.questions.len(), msg.answers.len(), msg.authorities.len(), msg.additionals.len()] {
        let count = u16::try_from(count).map_err(|_| DnsError::Encode("section has more than 65535 entries".into()))?;
        buf.extend_from_slice(&count.to_be_bytes());
    }

    for q in &msg.questions {
        write_name(&mut buf, &q.name)?;
        buf.extend_from_slice(&q.qtype.to_u16().to_be_bytes());
        buf.extend_from_slice(&q.qclass.to_u16().to_be_bytes());
    }
    for record in msg.answers.iter().chain(&msg.authorities).chain(&msg.additionals) {
        write_record(&mut buf, record)?;
    }
    Ok(buf)
}

/// Exact number of bytes [`encode`] would produce.
pub fn encoded_len(msg: &Message) -> Result<usize, DnsError> {
    encode(msg).map(|b| b.len())
}

pub fn decode(data: &[u8]) -> Result<Message, DnsError> {
    if data.len() < HEADER_LEN {
        return Err(DnsError::malformed(format!("message is {} bytes, shorter than a header", data.len())));
    }
    let mut r = Reader { buf: data, pos: 0 };
    let id = r.u16()?;
    let raw_flags = r.u16()?;
    let qdcount = r.u16()?;
    let ancount = r.u16()?;
    let nscount = r.u16()?;
    let arcount = r.u16()?;

    let mut msg = Message {
        id,
        kind: if raw_flags & flags::QR != 0 { MessageKind::Response } else { MessageKind::Query },
        flags: raw_flags & !flags::QR,
        ..Default::default()
    };

    for _ in 0..qdcount {
        let name = r.name()?;
        let qtype = RecordType::from_u16(r.u16()?);
        let qclass = RecordClass::from_u16(r.u16()?);
        msg.questions.push(Question { name, qtype, qclass });
    }
    for _ in 0..ancount { msg.answers.push(r.record()?); }
    for _ in 0..nscount { msg.authorities.push(r.record()?); }
    for _ in 0..arcount { msg.additionals.push(r.record()?); }
    Ok(msg)
}

/// Reads the transaction id of a buffer that may not decode as a whole.
pub fn peek_id(data: &[u8]) -> Option<u16> {
    if data.len() < 2 { return None; }
    Some(u16::from_be_bytes([data[0], data[1]]))
}

fn write_name(buf: &mut Vec<u8>, name: &str) -> Result<(), DnsError> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    let start = buf.len();
    if !trimmed.is_empty() {
        for label in trimmed.split('.') {
            if label.is_empty() || label.len() > MAX_LABEL_LEN {
                return Err(DnsError::Encode(format!("invalid label in name '{}'", name)));
            }
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
    }
    buf.push(0);
    if buf.len() - start > MAX_NAME_LEN {
        return Err(DnsError::Encode(format!("name '{}' exceeds 255 bytes", name)));
    }
    Ok(())
}

fn write_record(buf: &mut Vec<u8>, record: &Record) -> Result<(), DnsError> {
    write_name(buf, &record.name)?;
    buf.extend_from_slice(&record.record_type().to_u16().to_be_bytes());
    buf.extend_from_slice(&record.class.to_u16().to_be_bytes());
    buf.extend_from_slice(&record.ttl.to_be_bytes());

    let len_at = buf.len();
    buf.extend_from_slice(&[0, 0]);
    match &record.data {
        RData::A(addr) => buf.extend_from_slice(&addr.octets()),
        RData::AAAA(addr) => buf.extend_from_slice(&addr.octets()),
        RData::CNAME(name) | RData::NS(name) | RData::PTR(name) => write_name(buf, name)?,
        RData::MX { preference, exchange } => {
            buf.extend_from_slice(&preference.to_be_bytes());
            write_name(buf, exchange)?;
        }
        RData::TXT(parts) => {
            for part in parts {
                let bytes = part.as_bytes();
                if bytes.is_empty() {
                    buf.push(0);
                    continue;
                }
                for chunk in bytes.chunks(255) {
                    buf.push(chunk.len() as u8);
                    buf.extend_from_slice(chunk);
                }
            }
        }
        RData::SOA { mname, rname, serial, refresh, retry, expire, minimum } => {
            write_name(buf, mname)?;
            write_name(buf, rname)?;
            for v in [serial, refresh, retry, expire, minimum] {
                buf.extend_from_slice(&v.to_be_bytes());
            }
        }
        RData::SRV { priority, weight, port, target } => {
            buf.extend_from_slice(&priority.to_be_bytes());
            buf.extend_from_slice(&weight.to_be_bytes());
            buf.extend_from_slice(&port.to_be_bytes());
            write_name(buf, target)?;
        }
        RData::Opaque { data, .. } => buf.extend_from_slice(data),
    }

    let rdlen = u16::try_from(buf.len() - len_at - 2)
        .map_err(|_| DnsError::Encode(format!("rdata of '{}' exceeds 65535 bytes", record.name)))?;
    buf[len_at..len_at + 2].copy_from_slice(&rdlen.to_be_bytes());
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DnsError> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len())
            .ok_or_else(|| DnsError::malformed(format!("unexpected end of message at offset {}", self.pos)))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DnsError> { Ok(self.take(1)?[0]) }

    fn u16(&mut self) -> Result<u16, DnsError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DnsError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn name(&mut self) -> Result<String, DnsError> {
        let mut labels: Vec<String> = Vec::new();
        let mut pos = self.pos;
        let mut resume_at = None;
        let mut jumps = 0;
        let mut total = 0usize;

        loop {
            let len = *self.buf.get(pos).ok_or_else(|| DnsError::malformed("name runs past end of message"))? as usize;
            match len & 0xC0 {
                0x00 => {
                    pos += 1;
                    if len == 0 { break; }
                    let label = self.buf.get(pos..pos + len).ok_or_else(|| DnsError::malformed("label runs past end of message"))?;
                    total += len + 1;
                    if total > MAX_NAME_LEN {
                        return Err(DnsError::malformed("name exceeds 255 bytes"));
                    }
                    labels.push(String::from_utf8_lossy(label).into_owned());
                    pos += len;
                }
                0xC0 => {
                    let low = *self.buf.get(pos + 1).ok_or_else(|| DnsError::malformed("truncated compression pointer"))? as usize;
                    if resume_at.is_none() { resume_at = Some(pos + 2); }
                    jumps += 1;
                    if jumps > MAX_POINTER_JUMPS {
                        return Err(DnsError::malformed("compression pointer loop"));
                    }
                    pos = ((len & 0x3F) << 8) | low;
                }
                _ => return Err(DnsError::malformed(format!("unsupported label type {:#04x}", len))),
            }
        }

        self.pos = resume_at.unwrap_or(pos);
        Ok(labels.join("."))
    }

    fn record(&mut self) -> Result<Record, DnsError> {
        let name = self.name()?;
        let rtype = self.u16()?;
        let class = RecordClass::from_u16(self.u16()?);
        let ttl = self.u32()?;
        let rdlen = self.u16()? as usize;
        let rdata_start = self.pos;
        let rdata_end = rdata_start + rdlen;
        if rdata_end > self.buf.len() {
            return Err(DnsError::malformed(format!("rdata of '{}' runs past end of message", name)));
        }

        let data = match RecordType::from_u16(rtype) {
            RecordType::A => {
                let b = self.take(rdlen)?;
                let octets: [u8; 4] = b.try_into().map_err(|_| DnsError::malformed("A record rdata is not 4 bytes"))?;
                RData::A(octets.into())
            }
            RecordType::AAAA => {
                let b = self.take(rdlen)?;
                let octets: [u8; 16] = b.try_into().map_err(|_| DnsError::malformed("AAAA record rdata is not 16 bytes"))?;
                RData::AAAA(octets.into())
            }
            RecordType::CNAME => RData::CNAME(self.name()?),
            RecordType::NS => RData::NS(self.name()?),
            RecordType::PTR => RData::PTR(self.name()?),
            RecordType::MX => {
                let preference = self.u16()?;
                RData::MX { preference, exchange: self.name()? }
            }
            RecordType::TXT => {
                let mut parts = Vec::new();
                while self.pos < rdata_end {
                    let len = self.u8()? as usize;
                    parts.push(String::from_utf8_lossy(self.take(len)?).into_owned());
                }
                RData::TXT(parts)
            }
            RecordType::SOA => RData::SOA {
                mname: self.name()?,
                rname: self.name()?,
                serial: self.u32()?,
                refresh: self.u32()?,
                retry: self.u32()?,
                expire: self.u32()?,
                minimum: self.u32()?,
            },
            RecordType::SRV => RData::SRV {
                priority: self.u16()?,
                weight: self.u16()?,
                port: self.u16()?,
                target: self.name()?,
            },
            _ => RData::Opaque { rtype, data: self.take(rdlen)?.to_vec() },
        };

        if self.pos != rdata_end {
            return Err(DnsError::malformed(format!("rdata length mismatch for '{}'", name)));
        }
        Ok(Record { name, class, ttl, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Rcode;
    use std::net::Ipv4Addr;

    #[test]
    fn decodes_handwritten_query() {
        // id 0x1234, RD, one question: example.com A IN
        let mut bytes = vec![0x12, 0x34, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        bytes.extend_from_slice(b"\x07example\x03com\x00");
        bytes.extend_from_slice(&[0, 1, 0, 1]);

        let msg = decode(&bytes).unwrap();
        assert_eq!(msg.id, 0x1234);
        assert_eq!(msg.kind, MessageKind::Query);
        assert_eq!(msg.flags, flags::RECURSION_DESIRED);
        assert_eq!(msg.questions, vec![Question::new("example.com", RecordType::A)]);
        assert_eq!(encode(&msg).unwrap(), bytes);
    }

    #[test]
    fn follows_compression_pointers() {
        let mut bytes = vec![0, 1, 0x81, 0x80, 0, 1, 0, 1, 0, 0, 0, 0];
        bytes.extend_from_slice(b"\x07example\x03com\x00");
        bytes.extend_from_slice(&[0, 1, 0, 1]);
        // answer name is a pointer to offset 12
        bytes.extend_from_slice(&[0xC0, 0x0C, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4, 10, 0, 0, 1]);

        let msg = decode(&bytes).unwrap();
        assert_eq!(msg.kind, MessageKind::Response);
        assert_eq!(msg.answers.len(), 1);
        assert_eq!(msg.answers[0].name, "example.com");
        assert_eq!(msg.answers[0].data, RData::A(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn rejects_pointer_loops_and_short_input() {
        let mut bytes = vec![0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        bytes.extend_from_slice(&[0xC0, 0x0C, 0, 1, 0, 1]);
        assert!(matches!(decode(&bytes), Err(DnsError::Malformed(_))));
        assert!(matches!(decode(&[0, 1, 2]), Err(DnsError::Malformed(_))));
    }

    #[test]
    fn long_txt_is_split_into_character_strings() {
        let mut msg = Message::error_response(7, Rcode::NoError);
        msg.answers.push(Record::new("t.example", 30, RData::TXT(vec!["x".repeat(300)])));
        let bytes = encode(&msg).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(back.answers[0].data, RData::TXT(vec!["x".repeat(255), "x".repeat(45)]));
    }

    #[test]
    fn refuses_oversized_labels() {
        let msg = Message::query(1, Question::new(format!("{}.com", "a".repeat(64)), RecordType::A));
        assert!(matches!(encode(&msg), Err(DnsError::Encode(_))));
    }
}
