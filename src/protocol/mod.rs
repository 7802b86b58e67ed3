//! Agent communication protocol.
//!
//! - Typed parts (text, data, file, binary)
//! - Message envelopes with correlation IDs and canonical JSON encoding
//! - Per-agent FIFO mailboxes for in-process delivery

pub mod envelope;
pub mod mailbox;
pub mod part;
pub mod types;

pub use envelope::{validate, Message, MessageBuilder, DEFAULT_MAX_MESSAGE_BYTES};
pub use mailbox::{AgentMailbox, MailboxStats, MailboxStore};
pub use part::Part;
pub use types::{generate_id, now_ms, AgentId, Priority};
