use crate::bail;
use crate::io::DNSReadExt;
use crate::types::{Class, Type};
use byteorder::{ReadBytesExt, BE};
use std::io;
use std::io::Cursor;
use std::io::Read;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

/// Recource Record Definitions.
///
/// The set covers what recursive resolvers commonly return. Anything else is
/// skipped by the message parser rather than carried opaquely.
// This should be kept in sync with Type.
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Debug, PartialEq)]
pub enum Resource {
    A(Ipv4Addr),
    AAAA(AAAA),

    CNAME(String),
    NS(String),
    PTR(String),

    TXT(TXT),

    MX(MX),
    SOA(SOA),
    SRV(SRV),

    OPT,

    ANY, // Not a valid Record Type, but is a Type
}

// An alias keeps the variant names lined up with the mnemonics.
pub type AAAA = Ipv6Addr;

/// One or more text segments, each at most 255 bytes on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct TXT(pub Vec<Vec<u8>>);

/// Mail exchange record. See [rfc1035].
///
/// [rfc1035]: https://datatracker.ietf.org/doc/html/rfc1035
#[derive(Clone, Debug, PartialEq)]
pub struct MX {
    /// The preference given to this RR among others at the same owner.
    /// Lower values are preferred.
    pub preference: u16,

    /// A host willing to act as a mail exchange for the owner name.
    pub exchange: String,
}

/// Start of authority record. See [rfc1035].
///
/// [rfc1035]: https://datatracker.ietf.org/doc/html/rfc1035
#[derive(Clone, Debug, PartialEq)]
pub struct SOA {
    /// The name server that was the original or primary source of data for this zone.
    pub mname: String,

    /// The mailbox of the person responsible for this zone.
    pub rname: String,

    pub serial: u32,
    pub refresh: Duration,
    pub retry: Duration,
    pub expire: Duration,
    pub minimum: Duration,
}

/// Server selection record. See [rfc2782].
///
/// [rfc2782]: https://datatracker.ietf.org/doc/html/rfc2782
#[derive(Clone, Debug, PartialEq)]
pub struct SRV {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub name: String,
}

impl Resource {
    pub fn r#type(&self) -> Type {
        match self {
            Resource::A(_) => Type::A,
            Resource::AAAA(_) => Type::AAAA,
            Resource::CNAME(_) => Type::CNAME,
            Resource::NS(_) => Type::NS,
            Resource::PTR(_) => Type::PTR,
            Resource::TXT(_) => Type::TXT,
            Resource::MX(_) => Type::MX,
            Resource::SOA(_) => Type::SOA,
            Resource::SRV(_) => Type::SRV,
            Resource::OPT => Type::OPT,
            Resource::ANY => Type::ANY,
        }
    }

    /// Reads `rd_len` bytes of RDATA from the cursor. The cursor (not a
    /// sub-slice) is required because domain names inside RDATA may contain
    /// compression pointers into the rest of the message.
    pub(crate) fn parse(
        cur: &mut Cursor<&[u8]>,
        r#type: Type,
        class: Class,
        rd_len: u16,
    ) -> io::Result<Resource> {
        let resource = match r#type {
            Type::A => {
                if class != Class::Internet {
                    bail!(InvalidData, "unsupported A record class '{}'", class);
                }
                if rd_len != 4 {
                    bail!(InvalidData, "invalid A record length ({}) expected 4", rd_len);
                }
                let mut ip = [0; 4];
                cur.read_exact(&mut ip)?;
                Resource::A(Ipv4Addr::from(ip))
            }

            Type::AAAA => {
                if class != Class::Internet {
                    bail!(InvalidData, "unsupported AAAA record class '{}'", class);
                }
                if rd_len != 16 {
                    bail!(
                        InvalidData,
                        "invalid AAAA record length ({}) expected 16",
                        rd_len
                    );
                }
                let mut ip = [0; 16];
                cur.read_exact(&mut ip)?;
                Resource::AAAA(Ipv6Addr::from(ip))
            }

            Type::CNAME => Resource::CNAME(cur.read_qname()?),
            Type::NS => Resource::NS(cur.read_qname()?),
            Type::PTR => Resource::PTR(cur.read_qname()?),

            Type::TXT => {
                let mut txts = Vec::new();
                let mut remaining = rd_len as usize;
                while remaining > 0 {
                    let len = cur.read_u8()? as usize;
                    remaining -= 1;
                    if len > remaining {
                        bail!(InvalidData, "TXT record too short");
                    }
                    let mut txt = vec![0; len];
                    cur.read_exact(&mut txt)?;
                    remaining -= len;
                    txts.push(txt);
                }
                Resource::TXT(TXT(txts))
            }

            Type::MX => Resource::MX(MX {
                preference: cur.read_u16::<BE>()?,
                exchange: cur.read_qname()?,
            }),

            Type::SOA => Resource::SOA(SOA {
                mname: cur.read_qname()?,
                rname: cur.read_qname()?,
                serial: cur.read_u32::<BE>()?,
                refresh: Duration::from_secs(cur.read_u32::<BE>()?.into()),
                retry: Duration::from_secs(cur.read_u32::<BE>()?.into()),
                expire: Duration::from_secs(cur.read_u32::<BE>()?.into()),
                minimum: Duration::from_secs(cur.read_u32::<BE>()?.into()),
            }),

            Type::SRV => Resource::SRV(SRV {
                priority: cur.read_u16::<BE>()?,
                weight: cur.read_u16::<BE>()?,
                port: cur.read_u16::<BE>()?,
                name: cur.read_qname()?,
            }),

            // OPT is handled by the message parser, and the pseudo types
            // never appear as answer records.
            Type::Reserved | Type::OPT | Type::IXFR | Type::AXFR | Type::ANY => {
                bail!(InvalidData, "record type '{}' has no RDATA form", r#type)
            }
        };

        Ok(resource)
    }

    /// Appends the RDATA, prefixed with its two byte length, to `buf`.
    pub(crate) fn write(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        // Reserve the length field and patch it once the RDATA is known.
        let len_at = buf.len();
        buf.extend_from_slice(&[0, 0]);

        match self {
            Resource::A(ip) => buf.extend_from_slice(&ip.octets()),
            Resource::AAAA(ip) => buf.extend_from_slice(&ip.octets()),

            Resource::CNAME(name) | Resource::NS(name) | Resource::PTR(name) => {
                crate::dns::write_qname(buf, name)?
            }

            Resource::TXT(TXT(txts)) => {
                for txt in txts {
                    if txt.len() > 255 {
                        bail!(InvalidData, "TXT segment longer than 255 bytes");
                    }
                    buf.push(txt.len() as u8);
                    buf.extend_from_slice(txt);
                }
            }

            Resource::MX(mx) => {
                buf.extend_from_slice(&mx.preference.to_be_bytes());
                crate::dns::write_qname(buf, &mx.exchange)?;
            }

            Resource::SOA(soa) => {
                crate::dns::write_qname(buf, &soa.mname)?;
                crate::dns::write_qname(buf, &soa.rname)?;
                buf.extend_from_slice(&soa.serial.to_be_bytes());
                buf.extend_from_slice(&(soa.refresh.as_secs() as u32).to_be_bytes());
                buf.extend_from_slice(&(soa.retry.as_secs() as u32).to_be_bytes());
                buf.extend_from_slice(&(soa.expire.as_secs() as u32).to_be_bytes());
                buf.extend_from_slice(&(soa.minimum.as_secs() as u32).to_be_bytes());
            }

            Resource::SRV(srv) => {
                buf.extend_from_slice(&srv.priority.to_be_bytes());
                buf.extend_from_slice(&srv.weight.to_be_bytes());
                buf.extend_from_slice(&srv.port.to_be_bytes());
                crate::dns::write_qname(buf, &srv.name)?;
            }

            Resource::OPT | Resource::ANY => {
                bail!(InvalidData, "record type '{}' has no RDATA form", self.r#type())
            }
        }

        let rd_len = buf.len() - len_at - 2;
        if rd_len > u16::MAX as usize {
            bail!(InvalidData, "RDATA longer than 65535 bytes");
        }
        buf[len_at..len_at + 2].copy_from_slice(&(rd_len as u16).to_be_bytes());

        Ok(())
    }
}
