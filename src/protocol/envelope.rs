//! Message envelopes with correlation IDs for tracking agent communication.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use super::part::Part;
use super::types::{generate_id, now_ms, AgentId, Priority};
use crate::error::{Error, Result};

/// Default ceiling on a serialized message (10 MiB).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

/// Addressed, correlated container of one or more parts.
///
/// Immutable once dispatched: the router only ever borrows it. Recipients are a
/// sorted set and data parts use sorted maps, so serialization is canonical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Message {
    pub id: String,
    /// Shared by every message of a request/response chain.
    pub correlation_id: Option<String>,
    pub sender: AgentId,
    pub recipients: BTreeSet<AgentId>,
    pub parts: Vec<Part>,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds.
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub priority: Priority,
    /// Recipients are chosen by the router rather than listed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub broadcast: bool,
    /// Id of the message this one answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl Message {
    /// Create a message from one agent to another.
    pub fn new(sender: impl Into<AgentId>, recipient: impl Into<AgentId>, parts: Vec<Part>) -> Self {
        let mut recipients = BTreeSet::new();
        recipients.insert(recipient.into());
        Self {
            id: generate_id(),
            correlation_id: None,
            sender: sender.into(),
            recipients,
            parts,
            created_at: now_ms(),
            expires_at: None,
            priority: Priority::Normal,
            broadcast: false,
            reply_to: None,
        }
    }

    /// Create a broadcast message; the router picks recipients.
    pub fn broadcast(sender: impl Into<AgentId>, parts: Vec<Part>) -> Self {
        Self {
            id: generate_id(),
            correlation_id: None,
            sender: sender.into(),
            recipients: BTreeSet::new(),
            parts,
            created_at: now_ms(),
            expires_at: None,
            priority: Priority::Normal,
            broadcast: true,
            reply_to: None,
        }
    }

    /// Build a reply addressed to this message's sender.
    pub fn reply(&self, sender: impl Into<AgentId>, parts: Vec<Part>) -> Self {
        let mut recipients = BTreeSet::new();
        recipients.insert(self.sender.clone());
        Self {
            id: generate_id(),
            correlation_id: Some(
                self.correlation_id
                    .clone()
                    .unwrap_or_else(|| self.id.clone()),
            ),
            sender: sender.into(),
            recipients,
            parts,
            created_at: now_ms(),
            expires_at: None,
            priority: self.priority,
            broadcast: false,
            reply_to: Some(self.id.clone()),
        }
    }

    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at.map_or(false, |expires| now >= expires)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ms())
    }

    /// Time left before expiry, if the message expires at all.
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.expires_at
            .map(|expires| Duration::from_millis((expires - now_ms()).max(0) as u64))
    }

    pub fn is_for(&self, agent_id: &str) -> bool {
        self.recipients.contains(agent_id)
    }

    /// Validate against the default size ceiling.
    pub fn validate(&self) -> Result<()> {
        validate(self, DEFAULT_MAX_MESSAGE_BYTES)
    }

    /// Canonical JSON bytes.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse wire JSON. Malformed input is a validation error.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::validation(format!("malformed message: {}", e)))
    }
}

/// Structural and size validation of a message.
pub fn validate(message: &Message, max_bytes: usize) -> Result<()> {
    if message.id.is_empty() {
        return Err(Error::validation("message id is empty"));
    }
    if message.sender.is_empty() {
        return Err(Error::validation("message sender is empty"));
    }
    if message.recipients.is_empty() && !message.broadcast {
        return Err(Error::validation(
            "message has no recipients and is not flagged broadcast",
        ));
    }
    if message.recipients.iter().any(|r| r.is_empty()) {
        return Err(Error::validation("message has an empty recipient id"));
    }
    if message.parts.is_empty() {
        return Err(Error::validation("message has no parts"));
    }
    for (index, part) in message.parts.iter().enumerate() {
        part.validate().map_err(|e| match e {
            Error::Validation { reason } => {
                Error::validation(format!("part {} ({}): {}", index, part.kind(), reason))
            }
            other => other,
        })?;
    }
    if let Some(expires) = message.expires_at {
        if expires <= message.created_at {
            return Err(Error::validation("expires_at must be after created_at"));
        }
    }
    if message.is_reply() && message.correlation_id.is_none() {
        return Err(Error::validation("reply message is missing correlation_id"));
    }

    let size = serde_json::to_vec(message)?.len();
    if size > max_bytes {
        return Err(Error::validation(format!(
            "serialized message is {} bytes, limit is {}",
            size, max_bytes
        )));
    }
    Ok(())
}

/// Builder for creating messages with fluent API.
pub struct MessageBuilder {
    sender: AgentId,
    recipients: BTreeSet<AgentId>,
    broadcast: bool,
    parts: Vec<Part>,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    ttl: Option<Duration>,
    priority: Priority,
}

impl MessageBuilder {
    /// Start building a message from an agent.
    pub fn from(sender: impl Into<AgentId>) -> Self {
        Self {
            sender: sender.into(),
            recipients: BTreeSet::new(),
            broadcast: false,
            parts: Vec::new(),
            correlation_id: None,
            reply_to: None,
            ttl: None,
            priority: Priority::Normal,
        }
    }

    /// Address to a single agent.
    pub fn to(mut self, agent_id: impl Into<AgentId>) -> Self {
        self.recipients.insert(agent_id.into());
        self
    }

    /// Address to multiple agents.
    pub fn to_many<I, S>(mut self, agent_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AgentId>,
    {
        self.recipients.extend(agent_ids.into_iter().map(Into::into));
        self
    }

    /// Let the router choose recipients.
    pub fn broadcast(mut self) -> Self {
        self.broadcast = true;
        self
    }

    pub fn part(mut self, part: Part) -> Self {
        self.parts.push(part);
        self
    }

    pub fn text(self, text: impl Into<String>) -> Self {
        self.part(Part::text(text))
    }

    pub fn data(self, data: serde_json::Value) -> Self {
        self.part(Part::data(data))
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn reply_to(mut self, id: impl Into<String>) -> Self {
        self.reply_to = Some(id.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Build and validate the message.
    pub fn build(self) -> Result<Message> {
        let now = now_ms();
        let message = Message {
            id: generate_id(),
            correlation_id: self.correlation_id,
            sender: self.sender,
            recipients: self.recipients,
            parts: self.parts,
            created_at: now,
            expires_at: self.ttl.map(|ttl| now + ttl.as_millis() as i64),
            priority: self.priority,
            broadcast: self.broadcast,
            reply_to: self.reply_to,
        };
        message.validate()?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> Message {
        MessageBuilder::from("planner")
            .to("risk")
            .text("assess region eu-west")
            .data(json!({"region": "eu-west", "horizon_days": 30}))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder() {
        let message = MessageBuilder::from("planner")
            .to("risk")
            .text("go")
            .ttl(Duration::from_secs(60))
            .priority(Priority::High)
            .build()
            .unwrap();

        assert_eq!(message.sender, "planner");
        assert!(message.is_for("risk"));
        assert_eq!(message.priority, Priority::High);
        assert!(message.expires_at.unwrap() > message.created_at);
        assert!(!message.is_expired());
    }

    #[test]
    fn test_wire_field_names() {
        let v = serde_json::to_value(request()).unwrap();
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
            assert!(v.get(field).is_some(), "missing {}", field);
        }
        assert_eq!(v["parts"][1]["kind"], "data");
        assert!(v.get("broadcast").is_none());
    }

    #[test]
    fn test_round_trip_is_byte_stable() {
        let message = request();
        let bytes = message.serialize().unwrap();
        let decoded = Message::deserialize(&bytes).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.serialize().unwrap(), bytes);
    }

    #[test]
    fn test_canonical_key_order() {
        let a = br#"{"id":"m1","correlationId":null,"sender":"s","recipients":["b","a"],"parts":[{"kind":"data","data":{"z":1,"a":2}}],"createdAt":1,"expiresAt":null,"priority":"normal"}"#;
        let b = br#"{"priority":"normal","expiresAt":null,"createdAt":1,"parts":[{"data":{"a":2,"z":1},"kind":"data"}],"recipients":["a","b"],"sender":"s","correlationId":null,"id":"m1"}"#;
        let ma = Message::deserialize(a).unwrap();
        let mb = Message::deserialize(b).unwrap();
        assert_eq!(ma.serialize().unwrap(), mb.serialize().unwrap());
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let raw = br#"{"id":"m1","correlationId":null,"sender":"s","recipients":["a"],"parts":[{"kind":"text","text":"x"}],"createdAt":1,"expiresAt":null,"priority":"normal","extra":true}"#;
        assert!(matches!(Message::deserialize(raw), Err(Error::Validation { .. })));
    }

    #[test]
    fn test_unknown_part_fields_are_rejected() {
        let raw = br#"{"id":"m1","correlationId":null,"sender":"s","recipients":["a"],"parts":[{"kind":"text","text":"x","confidence":0.9}],"createdAt":1,"expiresAt":null,"priority":"normal"}"#;
        assert!(matches!(Message::deserialize(raw), Err(Error::Validation { .. })));
    }

    #[test]
    fn test_float_data_round_trips_exactly() {
        let value = 1.0715660391465826e-75_f64;
        let msg = MessageBuilder::from("planner")
            .to("risk")
            .data(serde_json::json!({ "v": value }))
            .build()
            .unwrap();
        let back = Message::deserialize(&msg.serialize().unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_recipients_required_unless_broadcast() {
        let err = MessageBuilder::from("planner").text("hi").build().unwrap_err();
        assert_eq!(err.kind(), "validation");

        let message = MessageBuilder::from("planner").broadcast().text("hi").build();
        assert!(message.is_ok());
    }

    #[test]
    fn test_expiry_must_follow_creation() {
        let mut message = request();
        message.expires_at = Some(message.created_at);
        assert!(message.validate().is_err());
    }

    #[test]
    fn test_reply_carries_correlation() {
        let original = request();
        let reply = original.reply("risk", vec![Part::text("done")]);
        assert_eq!(reply.correlation_id.as_deref(), Some(original.id.as_str()));
        assert_eq!(reply.reply_to.as_deref(), Some(original.id.as_str()));
        assert!(reply.is_for("planner"));
        assert!(reply.validate().is_ok());

        let mut orphan = reply.clone();
        orphan.correlation_id = None;
        assert!(orphan.validate().is_err());
    }

    #[test]
    fn test_size_limit() {
        let message = MessageBuilder::from("planner")
            .to("risk")
            .text("x".repeat(2048))
            .build()
            .unwrap();
        assert!(validate(&message, 1024).is_err());
        assert!(validate(&message, 4096).is_ok());
    }

    #[test]
    fn test_invalid_part_reports_index() {
        let mut message = request();
        message.parts.push(Part::file("no-scheme"));
        match message.validate() {
            Err(Error::Validation { reason }) => assert!(reason.starts_with("part 2 (file)")),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
