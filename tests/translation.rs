// End-to-end exercises of the translation pipeline's pure core: a DNS
// reply survives the trip through either HTTPS representation.

use dohproxy::json;
use dohproxy::resource::{Resource, TXT};
use dohproxy::types::*;
use pretty_assertions::assert_eq;
use std::net::Ipv4Addr;
use std::time::Duration;

fn query(name: &str, r#type: Type) -> Message {
    let mut query = Message::default();
    query.add_question(name, r#type, Class::Internet).unwrap();
    query.add_extension(Extension {
        payload_size: 4096,
        ..Extension::default()
    });
    query
}

fn answered_reply(query: &Message) -> Message {
    let mut reply = query.prepare_reply();
    reply.rcode = Rcode::NoError;
    reply.ra = true;
    reply.answers.push(Record {
        name: query.questions[0].name.clone(),
        class: Class::Internet,
        ttl: Duration::from_secs(300),
        resource: Resource::A(Ipv4Addr::new(93, 184, 216, 34)),
    });
    reply.answers.push(Record {
        name: query.questions[0].name.clone(),
        class: Class::Internet,
        ttl: Duration::from_secs(3600),
        resource: Resource::TXT(TXT(vec![b"v=spf1 -all".to_vec()])),
    });
    reply
}

#[test]
fn wire_format_round_trip() {
    let query = query("example.com", Type::A);
    let reply = answered_reply(&query);

    let wire = reply.to_vec().unwrap();
    let decoded = Message::from_slice(&wire).unwrap();

    assert_eq!(decoded, reply);
}

#[test]
fn json_round_trip_preserves_the_reply() {
    let query = query("example.com", Type::A);
    let reply = answered_reply(&query);

    // Across the JSON representation, serialized and back.
    let marshalled = json::marshal(&reply);
    let text = serde_json::to_string(&marshalled).unwrap();
    let parsed: json::MessageJson = serde_json::from_str(&text).unwrap();
    let rebuilt = json::unmarshal(&query.prepare_reply(), &parsed, 4096, 255);

    assert_eq!(rebuilt.id, reply.id);
    assert_eq!(rebuilt.questions, reply.questions);
    assert_eq!(rebuilt.rcode, reply.rcode);
    assert_eq!(rebuilt.tc, reply.tc);
    assert_eq!(rebuilt.rd, reply.rd);
    assert_eq!(rebuilt.ra, reply.ra);
    assert_eq!(rebuilt.ad, reply.ad);
    assert_eq!(rebuilt.cd, reply.cd);

    assert_eq!(rebuilt.answers.len(), reply.answers.len());
    for (rebuilt, original) in rebuilt.answers.iter().zip(reply.answers.iter()) {
        assert_eq!(rebuilt.name, original.name);
        assert_eq!(rebuilt.class, original.class);
        assert_eq!(rebuilt.resource, original.resource);

        // TTLs travel as absolute expiries; allow a second of clock skew.
        let drift = if rebuilt.ttl > original.ttl {
            rebuilt.ttl - original.ttl
        } else {
            original.ttl - rebuilt.ttl
        };
        assert!(drift <= Duration::from_secs(1));
    }

    // The rebuilt reply also survives the binary wire format.
    let wire = rebuilt.to_vec().unwrap();
    assert_eq!(Message::from_slice(&wire).unwrap(), rebuilt);
}

#[test]
fn json_round_trip_keeps_international_names() {
    let query = query("www.例え.テスト", Type::A);
    assert_eq!(query.questions[0].name, "www.例え.テスト.");

    let reply = query.prepare_reply();
    let marshalled = json::marshal(&reply);
    let rebuilt = json::unmarshal(&query.prepare_reply(), &marshalled, 512, 255);

    assert_eq!(rebuilt.questions[0].name, "www.例え.テスト.");

    // The punycoded form goes over the wire and comes back as unicode.
    let wire = rebuilt.to_vec().unwrap();
    let decoded = Message::from_slice(&wire).unwrap();
    assert_eq!(decoded.questions[0].name, "www.例え.テスト.");
}

#[test]
fn ttl_reconciliation_matches_the_http_age() {
    let query = query("example.com", Type::A);
    let mut reply = answered_reply(&query);

    // Thirty seconds sitting in an HTTP cache.
    reply.decay_ttls(Duration::from_secs(30));

    assert_eq!(reply.answers[0].ttl, Duration::from_secs(270));
    assert_eq!(reply.answers[1].ttl, Duration::from_secs(3570));
}
