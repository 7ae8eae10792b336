use crate::bail;
use crate::io::{DNSReadExt, SeekExt};
use crate::types::Record;
use crate::types::*;
use byteorder::{ReadBytesExt, BE};
use num_traits::FromPrimitive;
use rand::Rng;
use std::io;
use std::io::BufRead;
use std::io::Cursor;
use std::io::Read;
use std::net::IpAddr;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

#[derive(Copy, Clone, PartialEq)]
enum RecordSection {
    Answers,
    Authorities,
    Additionals,
}

/// A helper class to hold state while the parsing is happening.
pub(crate) struct MessageParser<'a> {
    cur: Cursor<&'a [u8]>,

    m: Message,
}

impl<'a> MessageParser<'a> {
    fn new(buf: &[u8]) -> MessageParser {
        MessageParser {
            cur: Cursor::new(buf),
            m: Message {
                id: 0,
                ..Message::default()
            },
        }
    }

    /// Consume the [`MessageParser`] and returned the resulting Message.
    fn parse(mut self) -> io::Result<Message> {
        self.m.id = self.cur.read_u16::<BE>()?;

        let b = self.cur.read_u8()?;
        self.m.qr = QR::from_bool(0b1000_0000 & b != 0);
        let opcode = (0b0111_1000 & b) >> 3;
        self.m.aa = (0b0000_0100 & b) != 0;
        self.m.tc = (0b0000_0010 & b) != 0;
        self.m.rd = (0b0000_0001 & b) != 0;

        self.m.opcode = match FromPrimitive::from_u8(opcode) {
            Some(t) => t,
            None => bail!(InvalidData, "invalid Opcode({})", opcode),
        };

        let b = self.cur.read_u8()?;
        self.m.ra = (0b1000_0000 & b) != 0;
        self.m.z = (0b0100_0000 & b) != 0; // Unused
        self.m.ad = (0b0010_0000 & b) != 0;
        self.m.cd = (0b0001_0000 & b) != 0;
        let rcode = 0b0000_1111 & b;

        self.m.rcode = match FromPrimitive::from_u8(rcode) {
            Some(t) => t,
            None => bail!(InvalidData, "invalid RCode({})", rcode),
        };

        let qd_count = self.cur.read_u16::<BE>()?;
        let an_count = self.cur.read_u16::<BE>()?;
        let ns_count = self.cur.read_u16::<BE>()?;
        let ar_count = self.cur.read_u16::<BE>()?;

        self.read_questions(qd_count)?;
        self.read_records(an_count, RecordSection::Answers)?;
        self.read_records(ns_count, RecordSection::Authorities)?;
        self.read_records(ar_count, RecordSection::Additionals)?;

        if self.cur.remaining()? > 0 {
            bail!(
                Other,
                "finished parsing with {} bytes left over",
                self.cur.remaining()?
            );
        }

        Ok(self.m)
    }

    fn read_questions(&mut self, count: u16) -> io::Result<()> {
        self.m.questions.reserve_exact(count.into());

        for _ in 0..count {
            let name = self.cur.read_qname()?;
            let r#type = self.cur.read_type()?;
            let class = self.cur.read_class()?;

            self.m.questions.push(Question {
                name,
                r#type,
                class,
            });
        }

        Ok(())
    }

    fn read_records(&mut self, count: u16, section: RecordSection) -> io::Result<()> {
        for _ in 0..count {
            let name = self.cur.read_qname()?;
            let type_value = self.cur.read_u16::<BE>()?;

            if section == RecordSection::Additionals && type_value == Type::OPT as u16 {
                let ext = Extension::parse(&mut self.cur, &name)?;

                // The first OPT is authoritative; any further ones have
                // already been consumed and are dropped.
                if self.m.extension.is_none() {
                    self.m.extension = Some(ext);
                } else {
                    log::debug!("duplicate EDNS(0) extension dropped");
                }
                continue;
            }

            let r#type = match FromPrimitive::from_u16(type_value) {
                Some(t) => t,
                None => {
                    // A resolver may hand back record types we can't
                    // re-encode. Skip them instead of failing the message.
                    let _class = self.cur.read_u16::<BE>()?;
                    let _ttl = self.cur.read_u32::<BE>()?;
                    let rd_len = self.cur.read_u16::<BE>()?;
                    self.cur.consume(rd_len.into());
                    log::debug!("skipped record '{}' of unknown Type({})", name, type_value);
                    continue;
                }
            };

            let class = self.cur.read_class()?;
            let record = Record::parse(&mut self.cur, name, r#type, class)?;

            let records = match section {
                RecordSection::Answers => &mut self.m.answers,
                RecordSection::Authorities => &mut self.m.authoritys,
                RecordSection::Additionals => &mut self.m.additionals,
            };
            records.push(record);
        }

        Ok(())
    }
}

/// Defaults to a [`Message`] with sensibles values for querying.
impl Default for Message {
    fn default() -> Self {
        Message {
            id: Message::random_id(),
            rd: true,
            tc: false,
            aa: false,
            opcode: Opcode::Query,
            qr: QR::Query,
            rcode: Rcode::NoError,
            cd: false,
            ad: false,
            z: false,
            ra: false,

            questions: Vec::default(),
            answers: Vec::default(),
            authoritys: Vec::default(),
            additionals: Vec::default(),
            extension: None,
        }
    }
}

impl Message {
    /// Returns a random u16 suitable for the [`Message`] id field.
    pub fn random_id() -> u16 {
        rand::thread_rng().gen()
    }

    /// Decodes the supplied buffer and returns a [`Message`].
    pub fn from_slice(buf: &[u8]) -> io::Result<Message> {
        MessageParser::new(buf).parse()
    }

    /// Takes a unicode domain, converts to ascii, and back to unicode.
    /// This has the effective of normalising it, so its easier to compare
    /// what was queried, and what was returned.
    fn normalise_domain(domain: &str) -> io::Result<String> {
        let ascii = match idna::domain_to_ascii(domain) {
            Ok(ascii) => ascii,
            Err(e) => bail!(InvalidInput, "invalid dns name '{0}': {1:?}", domain, e),
        };
        let (mut unicode, result) = idna::domain_to_unicode(&ascii);
        match result {
            Ok(_) => {
                if !unicode.ends_with('.') {
                    unicode.push('.')
                }
                Ok(unicode)
            }
            Err(e) => bail!(InvalidInput, "invalid dns name '{0}': {1:?}", domain, e),
        }
    }

    /// Adds a question to the message.
    pub fn add_question(&mut self, domain: &str, r#type: Type, class: Class) -> io::Result<()> {
        let domain = Message::normalise_domain(domain)?;

        self.questions.push(Question {
            name: domain,
            r#type,
            class,
        });

        Ok(())
    }

    /// Adds a EDNS(0) extension record, as defined by [rfc6891](https://datatracker.ietf.org/doc/html/rfc6891).
    pub fn add_extension(&mut self, ext: Extension) {
        self.extension = Some(ext);
    }

    /// The UDP payload size negotiated by the message's OPT record, or the
    /// classical 512 byte limit without one.
    pub fn udp_payload_size(&self) -> u16 {
        match &self.extension {
            Some(e) => e.payload_size,
            None => MIN_PAYLOAD_SIZE,
        }
    }

    /// Builds the skeleton of a reply to this query: id, opcode, RD and CD
    /// copied, RA mirroring RD, the question section copied by value, and
    /// the rcode pessimistically set to SERVFAIL until a real answer
    /// replaces it.
    pub fn prepare_reply(&self) -> Message {
        Message {
            id: self.id,
            qr: QR::Response,
            opcode: self.opcode,
            rd: self.rd,
            ra: self.rd,
            cd: self.cd,
            rcode: Rcode::ServFail,
            aa: false,
            tc: false,
            ad: false,
            z: false,
            questions: self.questions.clone(),
            answers: Vec::default(),
            authoritys: Vec::default(),
            additionals: Vec::default(),
            extension: None,
        }
    }

    /// Ages every record by `age`, saturating at zero. The OPT pseudo
    /// record holds no TTL and is unaffected.
    pub fn decay_ttls(&mut self, age: Duration) {
        for record in self
            .answers
            .iter_mut()
            .chain(self.authoritys.iter_mut())
            .chain(self.additionals.iter_mut())
        {
            record.ttl = if record.ttl > age {
                // Round to the nearest whole second.
                Duration::from_secs((record.ttl - age + Duration::from_millis(500)).as_secs())
            } else {
                Duration::ZERO
            };
        }
    }

    /// Encodes this DNS [`Message`] as a [`Vec<u8>`] ready to be sent, as defined by [rfc1035].
    ///
    /// [rfc1035]: https://datatracker.ietf.org/doc/html/rfc1035
    pub fn to_vec(&self) -> io::Result<Vec<u8>> {
        let mut req = Vec::<u8>::with_capacity(512);

        req.extend_from_slice(&self.id.to_be_bytes());

        let mut b = 0_u8;
        b |= if self.qr.to_bool() { 0b1000_0000 } else { 0 };
        b |= ((self.opcode as u8) << 3) & 0b0111_1000;
        b |= if self.aa { 0b0000_0100 } else { 0 };
        b |= if self.tc { 0b0000_0010 } else { 0 };
        b |= if self.rd { 0b0000_0001 } else { 0 };
        req.push(b);

        let mut b = 0_u8;
        b |= if self.ra { 0b1000_0000 } else { 0 };
        b |= if self.z { 0b0100_0000 } else { 0 };
        b |= if self.ad { 0b0010_0000 } else { 0 };
        b |= if self.cd { 0b0001_0000 } else { 0 };
        b |= (self.rcode as u8) & 0b0000_1111;

        req.push(b);

        let ar_count = self.additionals.len() as u16 + self.extension.is_some() as u16;

        req.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        req.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        req.extend_from_slice(&(self.authoritys.len() as u16).to_be_bytes());
        req.extend_from_slice(&ar_count.to_be_bytes());

        for question in &self.questions {
            write_qname(&mut req, &question.name)?;

            req.extend_from_slice(&(question.r#type as u16).to_be_bytes());
            req.extend_from_slice(&(question.class as u16).to_be_bytes());
        }

        for record in self
            .answers
            .iter()
            .chain(self.authoritys.iter())
            .chain(self.additionals.iter())
        {
            record.write(&mut req)?;
        }

        if let Some(e) = &self.extension {
            e.write(&mut req)?
        }

        Ok(req)
    }
}

impl Record {
    pub(crate) fn parse(
        cur: &mut Cursor<&[u8]>,
        name: String,
        r#type: Type,
        class: Class,
    ) -> io::Result<Record> {
        let ttl = cur.read_u32::<BE>()?;
        let rd_len = cur.read_u16::<BE>()?;

        let rdata_start = cur.position();
        let resource = crate::resource::Resource::parse(cur, r#type, class, rd_len)?;
        if cur.position() != rdata_start + rd_len as u64 {
            bail!(
                InvalidData,
                "record '{}' RDATA length ({}) does not match the bytes consumed",
                name,
                rd_len
            );
        }

        Ok(Record {
            name,
            class,
            ttl: Duration::from_secs(ttl.into()),
            resource,
        })
    }

    pub(crate) fn write(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        write_qname(buf, &self.name)?;
        buf.extend_from_slice(&(self.r#type() as u16).to_be_bytes());
        buf.extend_from_slice(&(self.class as u16).to_be_bytes());
        buf.extend_from_slice(&self.ttl_secs().to_be_bytes());
        self.resource.write(buf)
    }
}

/// Writes a Unicode domain name into the supplied [`Vec<u8>`].
///
/// Used for writing out a encoded ASCII domain name into a DNS message.
// Compression is never applied; the truncation path keeps UDP replies legal.
pub(crate) fn write_qname(buf: &mut Vec<u8>, domain: &str) -> io::Result<()> {
    // Decode this label into the original unicode.
    let domain = match idna::domain_to_ascii(domain) {
        Err(e) => {
            bail!(InvalidData, "invalid dns name '{0}': {1:?}", domain, e);
        }
        Ok(domain) => domain,
    };

    if !domain.is_empty() && domain != "." {
        for label in domain.split_terminator('.') {
            if label.is_empty() {
                bail!(InvalidData, "empty label in domain name '{}'", domain);
            }

            if label.len() > 63 {
                bail!(InvalidData, "label '{0}' longer than 63 characters", label);
            }

            // Write the length.
            buf.push(label.len() as u8);

            // Then the actual label.
            buf.extend_from_slice(label.as_bytes());
        }
    }

    buf.push(0);

    Ok(())
}

impl Extension {
    /// Parses the body of an OPT record, the owner name and type having
    /// already been consumed by the message parser.
    pub(crate) fn parse(cur: &mut Cursor<&[u8]>, domain: &str) -> io::Result<Extension> {
        if domain != "." {
            bail!(
                InvalidData,
                "expected root domain for EDNS(0) extension, got '{}'",
                domain
            );
        }

        let payload_size = cur.read_u16::<BE>()?;
        let extend_rcode = cur.read_u8()?;

        let version = cur.read_u8()?;
        let b = cur.read_u8()?;
        let dnssec_ok = b & 0b1000_0000 == 0b1000_0000;

        let _z = cur.read_u8()?;

        let rd_len = cur.read_u16::<BE>()?;
        let mut remaining = rd_len as usize;

        let mut options = Vec::new();
        while remaining > 0 {
            if remaining < 4 {
                bail!(InvalidData, "truncated EDNS(0) option header");
            }
            let code = cur.read_u16::<BE>()?;
            let opt_len = cur.read_u16::<BE>()? as usize;
            remaining -= 4;

            if opt_len > remaining {
                bail!(InvalidData, "EDNS(0) option length overruns the record");
            }
            let mut data = vec![0; opt_len];
            cur.read_exact(&mut data)?;
            remaining -= opt_len;

            options.push(match code {
                EDNS0_SUBNET => match ClientSubnet::from_wire(&data) {
                    Ok(subnet) => EdnsOption::ClientSubnet(subnet),
                    Err(e) => bail!(InvalidData, "invalid Client Subnet option: {}", e),
                },
                _ => EdnsOption::Unknown { code, data },
            });
        }

        Ok(Extension {
            payload_size,
            extend_rcode,
            version,
            dnssec_ok,
            options,
        })
    }

    pub(crate) fn write(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        buf.push(0); // A single "." domain name
        buf.extend_from_slice(&(Type::OPT as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload_size.to_be_bytes());

        buf.push(self.extend_rcode);
        buf.push(self.version);

        let mut b = 0_u8;
        b |= if self.dnssec_ok { 0b1000_0000 } else { 0 };

        // 16 bits of flags.
        buf.push(b);
        buf.push(0);

        // Patch the RDLEN once the options are written.
        let len_at = buf.len();
        buf.extend_from_slice(&[0, 0]);

        for option in &self.options {
            match option {
                EdnsOption::ClientSubnet(subnet) => {
                    let data = subnet.to_wire();
                    buf.extend_from_slice(&EDNS0_SUBNET.to_be_bytes());
                    buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
                    buf.extend_from_slice(&data);
                }
                EdnsOption::Unknown { code, data } => {
                    buf.extend_from_slice(&code.to_be_bytes());
                    buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
                    buf.extend_from_slice(data);
                }
            }
        }

        let rd_len = buf.len() - len_at - 2;
        buf[len_at..len_at + 2].copy_from_slice(&(rd_len as u16).to_be_bytes());

        Ok(())
    }
}

impl ClientSubnet {
    /// Decodes the option payload: family, netmask, scope, then the
    /// leftmost `ceil(netmask / 8)` bytes of the address.
    fn from_wire(data: &[u8]) -> Result<ClientSubnet, String> {
        if data.len() < 4 {
            return Err("option too short".to_string());
        }
        let family = u16::from_be_bytes([data[0], data[1]]);
        let source_netmask = data[2];
        let source_scope = data[3];
        let addr = &data[4..];

        let address = match family {
            1 => {
                if addr.len() > 4 {
                    return Err("IPv4 address too long".to_string());
                }
                let mut octets = [0_u8; 4];
                octets[..addr.len()].copy_from_slice(addr);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            2 => {
                if addr.len() > 16 {
                    return Err("IPv6 address too long".to_string());
                }
                let mut octets = [0_u8; 16];
                octets[..addr.len()].copy_from_slice(addr);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return Err(format!("unknown address family {}", family)),
        };

        Ok(ClientSubnet {
            family,
            source_netmask,
            source_scope,
            address,
        })
    }

    /// Encodes the option payload. Only the significant bytes of the
    /// address are sent.
    fn to_wire(&self) -> Vec<u8> {
        let addr_len = ((self.source_netmask as usize) + 7) / 8;

        let mut data = Vec::with_capacity(4 + addr_len);
        data.extend_from_slice(&self.family.to_be_bytes());
        data.push(self.source_netmask);
        data.push(self.source_scope);
        match self.address {
            IpAddr::V4(ip) => data.extend_from_slice(&ip.octets()[..addr_len.min(4)]),
            IpAddr::V6(ip) => data.extend_from_slice(&ip.octets()[..addr_len.min(16)]),
        }

        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Resource, MX, SOA, TXT};
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn sample_response() -> Message {
        let mut m = Message {
            id: 0x1234,
            qr: QR::Response,
            ra: true,
            ..Message::default()
        };
        m.add_question("example.com", Type::A, Class::Internet).unwrap();
        m.answers.push(Record {
            name: "example.com.".to_string(),
            class: Class::Internet,
            ttl: Duration::from_secs(300),
            resource: Resource::A(Ipv4Addr::new(93, 184, 216, 34)),
        });
        m.answers.push(Record {
            name: "example.com.".to_string(),
            class: Class::Internet,
            ttl: Duration::from_secs(60),
            resource: Resource::TXT(TXT(vec![b"v=spf1 -all".to_vec()])),
        });
        m.authoritys.push(Record {
            name: "example.com.".to_string(),
            class: Class::Internet,
            ttl: Duration::from_secs(3600),
            resource: Resource::SOA(SOA {
                mname: "ns1.example.com.".to_string(),
                rname: "hostmaster.example.com.".to_string(),
                serial: 2021120801,
                refresh: Duration::from_secs(7200),
                retry: Duration::from_secs(900),
                expire: Duration::from_secs(1209600),
                minimum: Duration::from_secs(86400),
            }),
        });
        m.additionals.push(Record {
            name: "mail.example.com.".to_string(),
            class: Class::Internet,
            ttl: Duration::from_secs(120),
            resource: Resource::MX(MX {
                preference: 10,
                exchange: "mx.example.com.".to_string(),
            }),
        });
        m
    }

    #[test]
    fn test_round_trip() {
        let m = sample_response();

        let buf = m.to_vec().expect("failed to encode");
        let decoded = Message::from_slice(&buf).expect("failed to decode");

        assert_eq!(m, decoded);
    }

    #[test]
    fn test_extension_round_trip() {
        let mut m = Message::default();
        m.add_question("example.com", Type::AAAA, Class::Internet)
            .unwrap();

        let mut ext = Extension {
            payload_size: 4096,
            dnssec_ok: true,
            ..Extension::default()
        };
        ext.add_client_subnet(ClientSubnet::new(
            IpAddr::from_str("203.0.113.99").unwrap(),
            24,
        ));
        m.add_extension(ext);

        let buf = m.to_vec().expect("failed to encode");
        let decoded = Message::from_slice(&buf).expect("failed to decode");

        let ext = decoded.extension.expect("extension missing");
        assert_eq!(ext.payload_size, 4096);
        assert!(ext.dnssec_ok);

        let subnet = ext.client_subnet().expect("client subnet missing");
        assert_eq!(subnet.family, 1);
        assert_eq!(subnet.source_netmask, 24);
        assert_eq!(subnet.source_scope, 0);
        // The host byte was masked away before encoding.
        assert_eq!(subnet.address, IpAddr::from_str("203.0.113.0").unwrap());
    }

    #[test]
    fn test_prepare_reply() {
        let mut query = Message::default();
        query.cd = true;
        query
            .add_question("example.com", Type::A, Class::Internet)
            .unwrap();

        let reply = query.prepare_reply();

        assert_eq!(reply.id, query.id);
        assert_eq!(reply.qr, QR::Response);
        assert_eq!(reply.rcode, Rcode::ServFail);
        assert_eq!(reply.rd, query.rd);
        assert_eq!(reply.ra, query.rd);
        assert!(reply.cd);
        assert_eq!(reply.questions, query.questions);
        assert!(reply.answers.is_empty());
    }

    #[test]
    fn test_decay_ttls() {
        let mut m = sample_response();
        m.decay_ttls(Duration::from_secs(90));

        // 300 - 90, 60 -> floor of zero, 3600 - 90, 120 - 90.
        assert_eq!(m.answers[0].ttl, Duration::from_secs(210));
        assert_eq!(m.answers[1].ttl, Duration::ZERO);
        assert_eq!(m.authoritys[0].ttl, Duration::from_secs(3510));
        assert_eq!(m.additionals[0].ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_parses_a_captured_response() {
        // A response to `example.com A` whose answer owner is a
        // compression pointer back into the question.
        let buf = hex::decode(
            "abcd81800001000100000000\
             076578616d706c6503636f6d0000010001\
             c00c000100010000012c00045db8d822",
        )
        .unwrap();

        let m = Message::from_slice(&buf).expect("failed to decode");

        assert_eq!(m.id, 0xabcd);
        assert_eq!(m.qr, QR::Response);
        assert!(m.rd);
        assert!(m.ra);
        assert_eq!(m.rcode, Rcode::NoError);
        assert_eq!(m.questions[0].name, "example.com.");
        assert_eq!(m.questions[0].r#type, Type::A);
        assert_eq!(
            m.answers[0],
            Record {
                name: "example.com.".to_string(),
                class: Class::Internet,
                ttl: Duration::from_secs(300),
                resource: Resource::A(Ipv4Addr::new(93, 184, 216, 34)),
            }
        );
    }

    #[test]
    fn test_skips_unknown_record_types() {
        // A response with a single answer of type 65280 (private use).
        let mut buf = Vec::new();
        buf.extend_from_slice(&0xbeef_u16.to_be_bytes()); // id
        buf.extend_from_slice(&[0x80, 0x00]); // qr=1
        buf.extend_from_slice(&0_u16.to_be_bytes()); // qd
        buf.extend_from_slice(&1_u16.to_be_bytes()); // an
        buf.extend_from_slice(&0_u16.to_be_bytes()); // ns
        buf.extend_from_slice(&0_u16.to_be_bytes()); // ar
        buf.push(0); // root owner
        buf.extend_from_slice(&0xff00_u16.to_be_bytes()); // type 65280
        buf.extend_from_slice(&1_u16.to_be_bytes()); // class IN
        buf.extend_from_slice(&0_u32.to_be_bytes()); // ttl
        buf.extend_from_slice(&2_u16.to_be_bytes()); // rd_len
        buf.extend_from_slice(&[0xde, 0xad]);

        let m = Message::from_slice(&buf).expect("failed to decode");
        assert!(m.answers.is_empty());
    }
}
