//! DNS wire format model and codec (RFC 1035).
//!
//! 手写的报文编解码，不依赖 DNS 库：解析端支持压缩指针（限制跳转次数防御
//! 恶意循环包），编码端支持标准压缩和"压缩指针变异"两种布局，后者只用于
//! 发往上游的转发套接字。

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::CoreError;

pub const HEADER_LEN: usize = 12;

pub const QTYPE_A: u16 = 1;
pub const QTYPE_AAAA: u16 = 28;
pub const QTYPE_TSIG: u16 = 250;
pub const QCLASS_IN: u16 = 1;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;
pub const RCODE_REFUSED: u8 = 5;

const MAX_POINTER_JUMPS: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderFlags {
    pub qr: bool,
    pub opcode: u8,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub rcode: u8,
}

impl HeaderFlags {
    pub fn from_bits(bits: u16) -> Self {
        Self {
            qr: bits & 0x8000 != 0,
            opcode: ((bits >> 11) & 0x0F) as u8,
            aa: bits & 0x0400 != 0,
            tc: bits & 0x0200 != 0,
            rd: bits & 0x0100 != 0,
            ra: bits & 0x0080 != 0,
            rcode: (bits & 0x000F) as u8,
        }
    }

    pub fn to_bits(self) -> u16 {
        let mut bits = 0u16;
        if self.qr {
            bits |= 0x8000;
        }
        bits |= (self.opcode as u16 & 0x0F) << 11;
        if self.aa {
            bits |= 0x0400;
        }
        if self.tc {
            bits |= 0x0200;
        }
        if self.rd {
            bits |= 0x0100;
        }
        if self.ra {
            bits |= 0x0080;
        }
        bits | (self.rcode as u16 & 0x000F)
    }
}

/// One entry of the question section. `name` keeps the casing the client
/// sent; comparisons and cache keys go through [`Question::key_name`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl Question {
    pub fn key_name(&self) -> String {
        self.name.to_ascii_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Other { rtype: u16, data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: RData,
}

impl Record {
    pub fn a(name: impl Into<String>, ttl: u32, addr: Ipv4Addr) -> Self {
        Self { name: name.into(), rclass: QCLASS_IN, ttl, rdata: RData::A(addr) }
    }

    pub fn aaaa(name: impl Into<String>, ttl: u32, addr: Ipv6Addr) -> Self {
        Self { name: name.into(), rclass: QCLASS_IN, ttl, rdata: RData::Aaaa(addr) }
    }

    pub fn from_ip(name: impl Into<String>, ttl: u32, ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self::a(name, ttl, v4),
            IpAddr::V6(v6) => Self::aaaa(name, ttl, v6),
        }
    }

    pub fn rtype(&self) -> u16 {
        match &self.rdata {
            RData::A(_) => QTYPE_A,
            RData::Aaaa(_) => QTYPE_AAAA,
            RData::Other { rtype, .. } => *rtype,
        }
    }

    fn rdata_bytes(&self) -> Vec<u8> {
        match &self.rdata {
            RData::A(addr) => addr.octets().to_vec(),
            RData::Aaaa(addr) => addr.octets().to_vec(),
            RData::Other { data, .. } => data.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsMessage {
    pub id: u16,
    pub flags: HeaderFlags,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authority: Vec<Record>,
    pub additional: Vec<Record>,
}

impl DnsMessage {
    pub fn is_query(&self) -> bool {
        !self.flags.qr
    }

    /// Minimum TTL across answer records, 0 when there is no answer.
    pub fn min_answer_ttl(&self) -> u32 {
        self.answers.iter().map(|r| r.ttl).min().unwrap_or(0)
    }

    /// TSIG metadata rides in the additional section and is passed through
    /// opaquely; replies served from cache must carry the *requester's*
    /// TSIG, not the one stored with the entry.
    pub fn replace_tsig(&mut self, request: &DnsMessage) {
        self.additional.retain(|r| r.rtype() != QTYPE_TSIG);
        self.additional
            .extend(request.additional.iter().filter(|r| r.rtype() == QTYPE_TSIG).cloned());
    }

    /// Turn this query into a direct answer carrying `records`.
    pub fn into_answer(mut self, records: Vec<Record>, rcode: u8) -> DnsMessage {
        self.flags.qr = true;
        self.flags.ra = true;
        self.flags.rcode = rcode;
        self.answers = records;
        self.authority.clear();
        self
    }

    pub fn parse(buf: &[u8]) -> Result<DnsMessage, CoreError> {
        if buf.len() < HEADER_LEN {
            return Err(CoreError::Parse("buffer shorter than header"));
        }
        let id = u16::from_be_bytes([buf[0], buf[1]]);
        let flags = HeaderFlags::from_bits(u16::from_be_bytes([buf[2], buf[3]]));
        let qdcount = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        let ancount = u16::from_be_bytes([buf[6], buf[7]]) as usize;
        let nscount = u16::from_be_bytes([buf[8], buf[9]]) as usize;
        let arcount = u16::from_be_bytes([buf[10], buf[11]]) as usize;

        // 没有 question 的查询对本核心毫无意义，按解析错误丢弃
        if !flags.qr && qdcount == 0 {
            return Err(CoreError::Parse("query without question"));
        }

        let mut off = HEADER_LEN;
        let mut questions = Vec::with_capacity(qdcount);
        for _ in 0..qdcount {
            let (name, next) = read_name(buf, off)?;
            if buf.len() < next + 4 {
                return Err(CoreError::Parse("question past end of buffer"));
            }
            let qtype = u16::from_be_bytes([buf[next], buf[next + 1]]);
            let qclass = u16::from_be_bytes([buf[next + 2], buf[next + 3]]);
            questions.push(Question { name, qtype, qclass });
            off = next + 4;
        }

        let (answers, off) = read_records(buf, off, ancount)?;
        let (authority, off) = read_records(buf, off, nscount)?;
        let (additional, _off) = read_records(buf, off, arcount)?;

        Ok(DnsMessage { id, flags, questions, answers, authority, additional })
    }

    /// Standard encoding. Record names equal to the first question compress
    /// to a pointer at offset 12, everything else is written literally.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(512);
        self.write_header(&mut out);
        for q in &self.questions {
            write_name(&mut out, &q.name);
            out.extend_from_slice(&q.qtype.to_be_bytes());
            out.extend_from_slice(&q.qclass.to_be_bytes());
        }
        for section in [&self.answers, &self.authority, &self.additional] {
            for r in section {
                self.write_record_name(&mut out, &r.name);
                self.write_record_body(&mut out, r);
            }
        }
        out
    }

    /// Compression-pointer-mutated encoding, for outbound queries only.
    ///
    /// 布局：问题名只写第一个 label，后面跟一枚前向压缩指针，剩余的 label
    /// 序列放在 QCLASS 之后。只在偏移 12 处按顺序读 label 的深包检测设备会
    /// 在指针处断掉，而任何按 RFC 1035 跟随指针的解析器得到的名字不变。
    /// 带其它区段或单 label 名字的报文退回标准编码。
    pub fn encode_mutated(&self) -> Vec<u8> {
        if self.questions.len() != 1
            || !self.answers.is_empty()
            || !self.authority.is_empty()
            || !self.additional.is_empty()
        {
            return self.encode();
        }
        let q = &self.questions[0];
        let labels: Vec<&str> = q.name.split('.').filter(|l| !l.is_empty()).collect();
        if labels.len() < 2 {
            return self.encode();
        }

        let mut out = Vec::with_capacity(512);
        self.write_header(&mut out);
        out.push(labels[0].len() as u8);
        out.extend_from_slice(labels[0].as_bytes());
        let pointer_pos = out.len();
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&q.qtype.to_be_bytes());
        out.extend_from_slice(&q.qclass.to_be_bytes());

        let tail = out.len() as u16;
        out[pointer_pos] = 0xC0 | (tail >> 8) as u8;
        out[pointer_pos + 1] = (tail & 0xFF) as u8;
        for label in &labels[1..] {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out
    }

    fn write_header(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.flags.to_bits().to_be_bytes());
        out.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.authority.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.additional.len() as u16).to_be_bytes());
    }

    fn write_record_name(&self, out: &mut Vec<u8>, name: &str) {
        match self.questions.first() {
            Some(q) if q.name.eq_ignore_ascii_case(name) => {
                out.extend_from_slice(&[0xC0, HEADER_LEN as u8]);
            }
            _ => write_name(out, name),
        }
    }

    fn write_record_body(&self, out: &mut Vec<u8>, r: &Record) {
        out.extend_from_slice(&r.rtype().to_be_bytes());
        out.extend_from_slice(&r.rclass.to_be_bytes());
        out.extend_from_slice(&r.ttl.to_be_bytes());
        let rdata = r.rdata_bytes();
        out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        out.extend_from_slice(&rdata);
    }
}

fn write_name(out: &mut Vec<u8>, name: &str) {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
}

/// Read a possibly-compressed name starting at `start`. Returns the name and
/// the offset just past its encoding at the original position.
fn read_name(buf: &[u8], start: usize) -> Result<(String, usize), CoreError> {
    let mut labels: Vec<String> = Vec::with_capacity(6);
    let mut pos = start;
    let mut end: Option<usize> = None;
    let mut jumps = 0usize;
    loop {
        if pos >= buf.len() {
            return Err(CoreError::Parse("name runs past end of buffer"));
        }
        let len = buf[pos];
        if len & 0xC0 == 0xC0 {
            if pos + 1 >= buf.len() {
                return Err(CoreError::Parse("truncated compression pointer"));
            }
            // 指针可以指向报文里的任何位置（含前向，见 encode_mutated），
            // 只用跳转次数上限防住环
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return Err(CoreError::Parse("compression pointer loop"));
            }
            let ptr = (((len & 0x3F) as usize) << 8) | buf[pos + 1] as usize;
            if ptr >= buf.len() {
                return Err(CoreError::Parse("compression pointer past end"));
            }
            if end.is_none() {
                end = Some(pos + 2);
            }
            pos = ptr;
        } else if len == 0 {
            if end.is_none() {
                end = Some(pos + 1);
            }
            break;
        } else if len > 63 {
            return Err(CoreError::Parse("invalid label length"));
        } else {
            let l = len as usize;
            if pos + 1 + l > buf.len() {
                return Err(CoreError::Parse("label runs past end of buffer"));
            }
            let label = std::str::from_utf8(&buf[pos + 1..pos + 1 + l])
                .map_err(|_| CoreError::Parse("label is not utf-8"))?;
            labels.push(label.to_string());
            pos += 1 + l;
        }
    }
    Ok((labels.join("."), end.expect("end is set before loop exit")))
}

fn read_records(buf: &[u8], mut off: usize, count: usize) -> Result<(Vec<Record>, usize), CoreError> {
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let (name, next) = read_name(buf, off)?;
        if buf.len() < next + 10 {
            return Err(CoreError::Parse("record header past end of buffer"));
        }
        let rtype = u16::from_be_bytes([buf[next], buf[next + 1]]);
        let rclass = u16::from_be_bytes([buf[next + 2], buf[next + 3]]);
        let ttl = u32::from_be_bytes([buf[next + 4], buf[next + 5], buf[next + 6], buf[next + 7]]);
        let rdlen = u16::from_be_bytes([buf[next + 8], buf[next + 9]]) as usize;
        let data_start = next + 10;
        if buf.len() < data_start + rdlen {
            return Err(CoreError::Parse("rdata runs past end of buffer"));
        }
        let data = &buf[data_start..data_start + rdlen];
        let rdata = match (rtype, rdlen) {
            (QTYPE_A, 4) => RData::A(Ipv4Addr::new(data[0], data[1], data[2], data[3])),
            (QTYPE_AAAA, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(data);
                RData::Aaaa(Ipv6Addr::from(octets))
            }
            _ => RData::Other { rtype, data: data.to_vec() },
        };
        records.push(Record { name, rclass, ttl, rdata });
        off = data_start + rdlen;
    }
    Ok((records, off))
}

pub fn qtype_str(qtype: u16) -> &'static str {
    match qtype {
        1 => "A",
        2 => "NS",
        5 => "CNAME",
        6 => "SOA",
        12 => "PTR",
        15 => "MX",
        16 => "TXT",
        28 => "AAAA",
        33 => "SRV",
        250 => "TSIG",
        255 => "ANY",
        _ => "OTHER",
    }
}
