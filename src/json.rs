//! The Google JSON representation of a DNS message, and the symmetric
//! conversion between it and [`Message`].
//!
//! Marshalling annotates every record with an absolute expiry so HTTP caches
//! can reason about the response; unmarshalling recomputes TTLs from those
//! annotations, so a reply that sat in a cache comes back correspondingly
//! aged.

use crate::from_str::FromStrError;
use crate::resource::Resource;
use crate::types::*;
use crate::util;
use chrono::{DateTime, Utc};
use num_traits::FromPrimitive;
use serde::{Deserialize, Deserializer, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// A DNS message in the JSON wire format.
///
/// See <https://developers.google.com/speed/public-dns/docs/doh/json>
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct MessageJson {
    /// Standard DNS response code, 12 bits with the extended rcode fused in.
    #[serde(rename = "Status")]
    pub status: u32,

    /// Whether the response is truncated
    #[serde(rename = "TC")]
    pub tc: bool,

    /// Recursion desired
    #[serde(rename = "RD")]
    pub rd: bool,

    /// Recursion available
    #[serde(rename = "RA")]
    pub ra: bool,

    /// Whether all response data was validated with DNSSEC
    #[serde(rename = "AD")]
    pub ad: bool,

    /// Whether the client asked to disable DNSSEC
    #[serde(rename = "CD")]
    pub cd: bool,

    // Some resolvers send a bare object rather than a one element list.
    #[serde(rename = "Question", default, deserialize_with = "one_or_many")]
    pub question: Vec<QuestionJson>,

    #[serde(rename = "Answer", default, skip_serializing_if = "Vec::is_empty")]
    pub answer: Vec<RecordJson>,

    #[serde(rename = "Authority", default, skip_serializing_if = "Vec::is_empty")]
    pub authority: Vec<RecordJson>,

    #[serde(rename = "Additional", default, skip_serializing_if = "Vec::is_empty")]
    pub additional: Vec<RecordJson>,

    #[serde(rename = "Comment", default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Client subnet as "address/scope".
    #[serde(
        rename = "edns_client_subnet",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub edns_client_subnet: Option<String>,

    /// True once any non-OPT record contributed a TTL.
    #[serde(skip)]
    pub have_ttl: bool,

    /// The smallest TTL seen across all record sections.
    #[serde(skip)]
    pub least_ttl: u32,

    /// The expiry corresponding to [`Self::least_ttl`].
    #[serde(skip)]
    pub earliest_expires: Option<DateTime<Utc>>,
}

/// Basically a [`Question`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct QuestionJson {
    /// FQDN with trailing dot
    pub name: String,

    /// Standard DNS RR type
    #[serde(rename = "type")]
    pub r#type: u16,
}

/// Basically a [`Record`] with its resource in presentation form.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RecordJson {
    pub name: String,

    #[serde(rename = "type")]
    pub r#type: u16,

    /// Record's time-to-live in seconds
    #[serde(rename = "TTL")]
    pub ttl: u32,

    /// TTL as an absolute RFC 1123 time
    #[serde(rename = "Expires", default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,

    /// Presentation-format record data, without the leading
    /// name/TTL/class/type columns.
    pub data: String,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<QuestionJson>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<QuestionJson>),
        One(QuestionJson),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(questions) => questions,
        OneOrMany::One(question) => vec![question],
    })
}

/// Formats an HTTP-date / RFC 1123 timestamp, e.g.
/// `Mon, 02 Jan 2006 15:04:05 GMT`.
pub fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parses an HTTP-date / RFC 1123 timestamp.
pub fn parse_http_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(s)
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

/// The body served with JSON-format errors, e.g.
/// `{"Status":2,"Comment":"upstream timed out"}`.
pub fn error_body(comment: &str) -> String {
    serde_json::json!({
        "Status": Rcode::ServFail as u32,
        "Comment": comment,
    })
    .to_string()
}

/// Converts a DNS message to its JSON representation.
pub fn marshal(msg: &Message) -> MessageJson {
    let now = Utc::now();

    let mut resp = MessageJson {
        status: msg.rcode as u32,
        tc: msg.tc,
        rd: msg.rd,
        ra: msg.ra,
        ad: msg.ad,
        cd: msg.cd,
        ..MessageJson::default()
    };

    for question in &msg.questions {
        resp.question.push(QuestionJson {
            name: question.name.clone(),
            r#type: question.r#type as u16,
        });
    }

    for record in &msg.answers {
        let (json, expires) = marshal_record(record, now);
        resp.note_ttl(&json, expires);
        resp.answer.push(json);
    }
    for record in &msg.authoritys {
        let (json, expires) = marshal_record(record, now);
        resp.note_ttl(&json, expires);
        resp.authority.push(json);
    }
    for record in &msg.additionals {
        let (json, expires) = marshal_record(record, now);
        resp.note_ttl(&json, expires);
        resp.additional.push(json);
    }

    if let Some(ext) = &msg.extension {
        // Fuse the extended rcode into the 12 bit Status.
        resp.status = ((ext.extend_rcode as u32) << 4) | (resp.status & 0xf);

        if let Some(subnet) = ext.client_subnet() {
            let address = util::mask_ip(subnet.address, subnet.source_scope);
            resp.edns_client_subnet = Some(format!("{}/{}", address, subnet.source_scope));
        }
    }

    resp
}

impl MessageJson {
    fn note_ttl(&mut self, record: &RecordJson, expires: DateTime<Utc>) {
        if !self.have_ttl || record.ttl < self.least_ttl {
            self.have_ttl = true;
            self.least_ttl = record.ttl;
            self.earliest_expires = Some(expires);
        }
    }
}

fn marshal_record(record: &Record, now: DateTime<Utc>) -> (RecordJson, DateTime<Utc>) {
    let ttl = record.ttl_secs();
    let expires = now + chrono::Duration::seconds(ttl as i64);

    (
        RecordJson {
            name: record.name.clone(),
            r#type: record.r#type() as u16,
            ttl,
            expires: Some(http_date(expires)),
            data: record.resource.to_string(),
        },
        expires,
    )
}

#[derive(Error, Debug)]
pub enum UnmarshalError {
    #[error("record name contains illegal characters: {0:?}")]
    BadName(String),

    #[error("record data contains newline: {0:?}")]
    BadData(String),

    #[error("unknown record type: {0}")]
    UnknownType(u16),

    #[error("invalid record data: {0}")]
    BadResource(#[from] FromStrError),

    #[error("invalid client subnet: {0:?}")]
    BadClientSubnet(String),
}

/// Converts a JSON representation back into a DNS reply.
///
/// `reply` is the skeleton produced by [`Message::prepare_reply`];
/// `udp_size` the payload size to advertise (clamped to at least 512); and
/// `ecs_netmask` the request-side netmask, with 255 meaning "not supplied"
/// so a family default applies.
///
/// Records that fail validation are logged and dropped, never surfaced as a
/// protocol error.
pub fn unmarshal(
    reply: &Message,
    resp: &MessageJson,
    udp_size: u16,
    ecs_netmask: u8,
) -> Message {
    let now = Utc::now();

    let mut out = reply.clone();
    out.tc = resp.tc;
    out.ad = resp.ad;
    out.cd = resp.cd;
    out.rcode = Rcode::ServFail;

    for record in &resp.answer {
        match unmarshal_record(record, now) {
            Ok(record) => out.answers.push(record),
            Err(e) => log::warn!("dropping answer record: {}", e),
        }
    }
    for record in &resp.authority {
        match unmarshal_record(record, now) {
            Ok(record) => out.authoritys.push(record),
            Err(e) => log::warn!("dropping authority record: {}", e),
        }
    }
    for record in &resp.additional {
        match unmarshal_record(record, now) {
            Ok(record) => out.additionals.push(record),
            Err(e) => log::warn!("dropping additional record: {}", e),
        }
    }

    let mut ext = Extension {
        payload_size: udp_size.max(MIN_PAYLOAD_SIZE),
        extend_rcode: ((resp.status & 0xff0) >> 4) as u8,
        version: 0,
        dnssec_ok: false,
        options: Vec::new(),
    };

    if let Some(subnet) = &resp.edns_client_subnet {
        match parse_subnet_scope(subnet, ecs_netmask) {
            Ok(subnet) => ext.add_client_subnet(subnet),
            Err(e) => log::warn!("{}", e),
        }
    }
    out.extension = Some(ext);

    match FromPrimitive::from_u32(resp.status & 0xf) {
        Some(rcode) => out.rcode = rcode,
        None => log::warn!("unassigned rcode {} mapped to SERVFAIL", resp.status & 0xf),
    }

    out
}

// Parses the response-side "address/scope" string into a Client Subnet
// option, reusing the request's netmask (or the family default for 255).
fn parse_subnet_scope(subnet: &str, netmask: u8) -> Result<ClientSubnet, UnmarshalError> {
    let (addr, scope) = subnet
        .split_once('/')
        .ok_or_else(|| UnmarshalError::BadClientSubnet(subnet.to_string()))?;

    let address: IpAddr = addr
        .parse()
        .map_err(|_| UnmarshalError::BadClientSubnet(subnet.to_string()))?;
    let source_scope: u8 = scope
        .parse()
        .map_err(|_| UnmarshalError::BadClientSubnet(subnet.to_string()))?;

    let source_netmask = if netmask == 255 {
        match address {
            IpAddr::V4(_) => 24,
            IpAddr::V6(_) => 56,
        }
    } else {
        netmask
    };

    let mut subnet = ClientSubnet::new(address, source_netmask);
    subnet.source_scope = source_scope;
    Ok(subnet)
}

fn unmarshal_record(record: &RecordJson, now: DateTime<Utc>) -> Result<Record, UnmarshalError> {
    if record
        .name
        .contains(&['\t', '\r', '\n', ' ', '"', '(', ')', ';', '\\'][..])
    {
        return Err(UnmarshalError::BadName(record.name.clone()));
    }

    let mut ttl = record.ttl;
    if let Some(expires) = record.expires.as_deref().filter(|e| !e.is_empty()) {
        if let Some(expires) = parse_http_date(expires) {
            // Recompute the TTL from the absolute expiry, saturating into
            // the 32 bit range.
            ttl = (expires - now).num_seconds().clamp(0, u32::MAX as i64) as u32;
        }
    }

    let r#type: Type = FromPrimitive::from_u16(record.r#type)
        .ok_or(UnmarshalError::UnknownType(record.r#type))?;

    if record.data.contains(&['\r', '\n'][..]) {
        return Err(UnmarshalError::BadData(record.data.clone()));
    }

    let resource = Resource::from_str(r#type, &record.data)?;

    Ok(Record {
        name: record.name.clone(),
        class: Class::Internet,
        ttl: Duration::from_secs(ttl.into()),
        resource,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn sample_reply() -> Message {
        let mut query = Message::default();
        query.cd = true;
        query
            .add_question("example.com", Type::A, Class::Internet)
            .unwrap();

        let mut reply = query.prepare_reply();
        reply.rcode = Rcode::NoError;
        reply.ra = true;
        reply.answers.push(Record {
            name: "example.com.".to_string(),
            class: Class::Internet,
            ttl: Duration::from_secs(300),
            resource: Resource::A(Ipv4Addr::new(93, 184, 216, 34)),
        });
        reply.answers.push(Record {
            name: "example.com.".to_string(),
            class: Class::Internet,
            ttl: Duration::from_secs(60),
            resource: Resource::AAAA("2606:2800:220:1::1".parse().unwrap()),
        });
        reply
    }

    #[test]
    fn test_marshal_tracks_least_ttl() {
        let reply = sample_reply();
        let json = marshal(&reply);

        assert!(json.have_ttl);
        assert_eq!(json.least_ttl, 60);
        assert!(json.earliest_expires.is_some());
        assert_eq!(json.status, 0);
        assert_eq!(json.question.len(), 1);
        assert_eq!(json.answer.len(), 2);
        assert_eq!(json.answer[0].data, "93.184.216.34");
    }

    #[test]
    fn test_round_trip_preserves_the_message() {
        let reply = sample_reply();
        let json = marshal(&reply);

        // Over the wire and back.
        let text = serde_json::to_string(&json).unwrap();
        let json: MessageJson = serde_json::from_str(&text).unwrap();

        let skeleton = reply.prepare_reply();
        let rebuilt = unmarshal(&skeleton, &json, 4096, 255);

        assert_eq!(rebuilt.id, reply.id);
        assert_eq!(rebuilt.questions, reply.questions);
        assert_eq!(rebuilt.rcode, Rcode::NoError);
        assert!(rebuilt.cd);
        assert_eq!(rebuilt.answers.len(), 2);
        for (rebuilt, original) in rebuilt.answers.iter().zip(reply.answers.iter()) {
            assert_eq!(rebuilt.name, original.name);
            assert_eq!(rebuilt.resource, original.resource);
            // TTLs travel as an absolute expiry, so allow one second of
            // clock movement.
            let drift = if rebuilt.ttl > original.ttl {
                rebuilt.ttl - original.ttl
            } else {
                original.ttl - rebuilt.ttl
            };
            assert!(drift <= Duration::from_secs(1), "TTL drifted by {:?}", drift);
        }
        assert_eq!(rebuilt.extension.unwrap().payload_size, 4096);
    }

    #[test]
    fn test_status_fuses_the_extended_rcode() {
        let mut reply = sample_reply();
        reply.add_extension(Extension {
            extend_rcode: 1, // BADVERS = 16 = (1 << 4) | 0
            ..Extension::default()
        });

        let json = marshal(&reply);
        assert_eq!(json.status, 16);

        let skeleton = reply.prepare_reply();
        let rebuilt = unmarshal(&skeleton, &json, 512, 255);
        assert_eq!(rebuilt.rcode, Rcode::NoError);
        assert_eq!(rebuilt.extension.unwrap().extend_rcode, 1);
    }

    #[test]
    fn test_marshal_renders_client_subnet_at_scope() {
        let mut reply = sample_reply();
        let mut ext = Extension::default();
        let mut subnet = ClientSubnet::new(IpAddr::from_str("203.0.113.99").unwrap(), 24);
        subnet.source_scope = 20;
        ext.add_client_subnet(subnet);
        reply.add_extension(ext);

        let json = marshal(&reply);
        assert_eq!(json.edns_client_subnet.as_deref(), Some("203.0.112.0/20"));
    }

    #[test]
    fn test_unmarshal_drops_bad_records() {
        let json: MessageJson = serde_json::from_str(
            r#"{
              "Status": 0, "TC": false, "RD": true, "RA": true, "AD": false, "CD": false,
              "Question": [{"name": "example.com.", "type": 1}],
              "Answer": [
                {"name": "bad name.example.com.", "type": 1, "TTL": 10, "data": "192.0.2.1"},
                {"name": "example.com.", "type": 1, "TTL": 10, "data": "not-an-ip"},
                {"name": "example.com.", "type": 1, "TTL": 10, "data": "192.0.2.2"}
              ]
            }"#,
        )
        .unwrap();

        let mut query = Message::default();
        query
            .add_question("example.com", Type::A, Class::Internet)
            .unwrap();
        let reply = unmarshal(&query.prepare_reply(), &json, 512, 255);

        assert_eq!(reply.answers.len(), 1);
        assert_eq!(
            reply.answers[0].resource,
            Resource::A(Ipv4Addr::new(192, 0, 2, 2))
        );
    }

    #[test]
    fn test_parses_question_as_object_or_array() {
        let object: MessageJson = serde_json::from_str(
            r#"{"Status":0,"TC":false,"RD":true,"RA":true,"AD":false,"CD":false,
                "Question":{"name":"example.com.","type":28}}"#,
        )
        .unwrap();
        assert_eq!(object.question.len(), 1);
        assert_eq!(object.question[0].r#type, 28);

        let array: MessageJson = serde_json::from_str(
            r#"{"Status":0,"TC":false,"RD":true,"RA":true,"AD":false,"CD":false,
                "Question":[{"name":"example.com.","type":28}]}"#,
        )
        .unwrap();
        assert_eq!(array.question.len(), 1);
    }

    #[test]
    fn test_expires_recomputes_the_ttl() {
        let expires = http_date(Utc::now() + chrono::Duration::seconds(120));
        let record = RecordJson {
            name: "example.com.".to_string(),
            r#type: 1,
            ttl: 999,
            expires: Some(expires),
            data: "192.0.2.1".to_string(),
        };

        let record = unmarshal_record(&record, Utc::now()).unwrap();
        let ttl = record.ttl.as_secs();
        assert!((119..=120).contains(&ttl), "ttl was {}", ttl);
    }

    #[test]
    fn test_expired_records_saturate_to_zero() {
        let expires = http_date(Utc::now() - chrono::Duration::seconds(120));
        let record = RecordJson {
            name: "example.com.".to_string(),
            r#type: 1,
            ttl: 999,
            expires: Some(expires),
            data: "192.0.2.1".to_string(),
        };

        let record = unmarshal_record(&record, Utc::now()).unwrap();
        assert_eq!(record.ttl, Duration::ZERO);
    }
}
