//! Wire-format stability of messages.

use std::time::Duration;

use agentmesh::protocol::{validate, Message, MessageBuilder, Part, Priority};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        any::<f64>()
            .prop_filter("finite", |f| f.is_finite())
            .prop_map(Value::from),
        "[a-z0-9 ]{0,12}".prop_map(Value::from),
        Just(Value::Null),
    ]
}

fn data_object() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-z_]{1,8}", scalar(), 0..6).prop_map(|fields| {
        let map: Map<String, Value> = fields.into_iter().collect();
        Value::Object(map)
    })
}

fn part() -> impl Strategy<Value = Part> {
    prop_oneof![
        "\\PC{1,40}".prop_map(Part::text),
        data_object().prop_map(Part::data),
        ("[a-z]{1,10}", proptest::option::of(1u64..1 << 40)).prop_map(|(name, size)| Part::File {
            uri: format!("file:///shared/{}.pdf", name),
            name: Some(format!("{}.pdf", name)),
            mime_type: Some("application/pdf".to_string()),
            size,
        }),
        prop::collection::vec(any::<u8>(), 1..64)
            .prop_map(|bytes| Part::binary(bytes, Some("application/octet-stream".into()))),
    ]
}

fn priority() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Low),
        Just(Priority::Normal),
        Just(Priority::High),
        Just(Priority::Urgent),
    ]
}

fn message() -> impl Strategy<Value = Message> {
    (
        "[a-z]{1,8}",
        prop::collection::btree_set("[a-z]{1,8}", 1..4),
        prop::collection::vec(part(), 1..5),
        priority(),
        proptest::option::of("[a-z0-9-]{4,16}"),
        proptest::option::of(1u64..86_400_000),
    )
        .prop_map(|(sender, recipients, parts, priority, correlation, ttl)| {
            let mut builder = MessageBuilder::from(sender)
                .to_many(recipients)
                .priority(priority);
            for part in parts {
                builder = builder.part(part);
            }
            if let Some(id) = correlation {
                builder = builder.correlation_id(id);
            }
            if let Some(ms) = ttl {
                builder = builder.ttl(Duration::from_millis(ms));
            }
            builder.build().unwrap()
        })
}

proptest! {
    #[test]
    fn prop_message_roundtrip(msg in message()) {
        let bytes = msg.serialize().unwrap();
        let back = Message::deserialize(&bytes).unwrap();
        prop_assert_eq!(&back, &msg);
        // Canonical: serializing again yields identical bytes.
        prop_assert_eq!(back.serialize().unwrap(), bytes);
    }
}

#[test]
fn test_wire_field_names() {
    let msg = MessageBuilder::from("planner")
        .to("risk")
        .correlation_id("chain-1")
        .text("assess")
        .data(json!({"region": "north"}))
        .build()
        .unwrap();
    let wire: Value = serde_json::from_slice(&msg.serialize().unwrap()).unwrap();
    let obj = wire.as_object().unwrap();
    for field in [
        "id",
        "correlationId",
        "sender",
        "recipients",
        "parts",
        "createdAt",
        "expiresAt",
        "priority",
    ] {
        assert!(obj.contains_key(field), "missing {}", field);
    }
    assert_eq!(wire["parts"][0], json!({"kind": "text", "text": "assess"}));
    assert_eq!(wire["parts"][1]["kind"], "data");
}

#[test]
fn test_oversized_message_rejected() {
    let msg = MessageBuilder::from("planner")
        .to("risk")
        .part(Part::binary(vec![7u8; 4096], None))
        .build()
        .unwrap();
    assert!(validate(&msg, 1024).is_err());
    assert!(validate(&msg, 1 << 20).is_ok());
}

#[test]
fn test_unknown_fields_rejected() {
    let err = Message::deserialize(br#"{"id":"m","sender":"a","recipients":["b"],"parts":[],"createdAt":0,"expiresAt":null,"correlationId":null,"bogus":1}"#)
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
}
