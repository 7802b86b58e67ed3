//! Agent mailboxes for in-process delivery.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use super::envelope::Message;
use super::types::{now_ms, AgentId};

/// Maximum messages per mailbox before the oldest are dropped.
pub const MAX_MAILBOX_SIZE: usize = 1000;

#[derive(Debug, Clone)]
struct Delivered {
    message: Message,
    delivered_at: i64,
}

/// A single agent's inbox. Strict FIFO in delivery order.
#[derive(Debug, Clone)]
pub struct AgentMailbox {
    pub agent_id: AgentId,
    inbox: VecDeque<Delivered>,
    pub total_received: u64,
    pub last_activity: i64,
}

impl AgentMailbox {
    pub fn new(agent_id: impl Into<AgentId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            inbox: VecDeque::new(),
            total_received: 0,
            last_activity: now_ms(),
        }
    }

    pub fn deliver(&mut self, message: Message) {
        let now = now_ms();
        self.inbox.push_back(Delivered {
            message,
            delivered_at: now,
        });
        self.total_received += 1;
        self.last_activity = now;

        while self.inbox.len() > MAX_MAILBOX_SIZE {
            if let Some(dropped) = self.inbox.pop_front() {
                tracing::warn!(
                    agent_id = %self.agent_id,
                    message_id = %dropped.message.id,
                    "Mailbox full, dropping oldest message"
                );
            }
        }
    }

    pub fn pop(&mut self) -> Option<Message> {
        let next = self.inbox.pop_front().map(|d| d.message);
        if next.is_some() {
            self.last_activity = now_ms();
        }
        next
    }

    pub fn drain(&mut self) -> Vec<Message> {
        self.last_activity = now_ms();
        self.inbox.drain(..).map(|d| d.message).collect()
    }

    pub fn peek(&self) -> Option<&Message> {
        self.inbox.front().map(|d| &d.message)
    }

    pub fn len(&self) -> usize {
        self.inbox.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inbox.is_empty()
    }

    /// Drop messages that expired or outlived the retention window.
    pub fn purge_expired(&mut self, now: i64, retention_ms: u64) -> usize {
        let before = self.inbox.len();
        self.inbox.retain(|d| {
            !d.message.is_expired_at(now) && now - d.delivered_at < retention_ms as i64
        });
        before - self.inbox.len()
    }

    pub fn stats(&self) -> MailboxStats {
        MailboxStats {
            agent_id: self.agent_id.clone(),
            queued: self.inbox.len(),
            total_received: self.total_received,
            last_activity: self.last_activity,
        }
    }
}

/// Mailbox statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxStats {
    pub agent_id: AgentId,
    pub queued: usize,
    pub total_received: u64,
    pub last_activity: i64,
}

#[derive(Debug)]
struct Slot {
    mailbox: Mutex<AgentMailbox>,
    notify: Notify,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, AgentMailbox> {
        self.mailbox.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// All local mailboxes, one slot per agent.
#[derive(Debug, Default)]
pub struct MailboxStore {
    slots: Mutex<HashMap<AgentId, Arc<Slot>>>,
}

impl MailboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the agent's mailbox if it does not exist yet.
    pub fn open(&self, agent_id: &str) {
        self.slot(agent_id);
    }

    fn slot(&self, agent_id: &str) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry(agent_id.to_string())
            .or_insert_with(|| {
                Arc::new(Slot {
                    mailbox: Mutex::new(AgentMailbox::new(agent_id)),
                    notify: Notify::new(),
                })
            })
            .clone()
    }

    fn existing(&self, agent_id: &str) -> Option<Arc<Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .cloned()
    }

    pub fn deliver(&self, agent_id: &str, message: Message) {
        let slot = self.slot(agent_id);
        slot.lock().deliver(message);
        slot.notify.notify_one();
    }

    /// Take the oldest message, if any.
    pub fn try_recv(&self, agent_id: &str) -> Option<Message> {
        self.existing(agent_id)?.lock().pop()
    }

    /// Wait up to `timeout` for the next message. Agents without a mailbox
    /// get `None` straight away.
    pub async fn recv(&self, agent_id: &str, timeout: Duration) -> Option<Message> {
        let slot = self.existing(agent_id)?;
        let wait = async {
            loop {
                let notified = slot.notify.notified();
                let popped = slot.lock().pop();
                if let Some(message) = popped {
                    return message;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.ok()
    }

    pub fn drain(&self, agent_id: &str) -> Vec<Message> {
        self.existing(agent_id)
            .map_or_else(Vec::new, |slot| slot.lock().drain())
    }

    pub fn len(&self, agent_id: &str) -> usize {
        self.existing(agent_id).map_or(0, |slot| slot.lock().len())
    }

    /// Forget an agent's mailbox entirely.
    pub fn remove(&self, agent_id: &str) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(agent_id).map_or(0, |slot| slot.lock().len())
    }

    /// Drop mailboxes of agents `keep` rejects. Returns the messages dropped.
    pub fn retain_agents<F>(&self, keep: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let mut dropped = 0;
        slots.retain(|agent_id, slot| {
            let kept = keep(agent_id);
            if !kept {
                dropped += slot.lock().len();
            }
            kept
        });
        dropped
    }

    pub fn all_stats(&self) -> Vec<MailboxStats> {
        let slots: Vec<Arc<Slot>> = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.values().cloned().collect()
        };
        slots.iter().map(|s| s.lock().stats()).collect()
    }

    pub fn purge_all_expired(&self, retention_ms: u64) -> usize {
        let now = now_ms();
        let slots: Vec<Arc<Slot>> = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.values().cloned().collect()
        };
        slots
            .iter()
            .map(|s| s.lock().purge_expired(now, retention_ms))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Part;

    fn msg(body: &str) -> Message {
        Message::new("planner", "risk", vec![Part::text(body)])
    }

    #[test]
    fn test_fifo_order() {
        let store = MailboxStore::new();
        for i in 0..5 {
            store.deliver("risk", msg(&format!("m{}", i)));
        }
        let bodies: Vec<String> = store
            .drain("risk")
            .iter()
            .map(|m| m.parts[0].as_text().unwrap().to_string())
            .collect();
        assert_eq!(bodies, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn test_purge_expired() {
        let mut mailbox = AgentMailbox::new("risk");
        let mut expired = msg("old");
        expired.expires_at = Some(expired.created_at + 1);
        mailbox.deliver(expired);
        mailbox.deliver(msg("fresh"));

        let purged = mailbox.purge_expired(now_ms() + 10, 60_000);
        assert_eq!(purged, 1);
        assert_eq!(mailbox.peek().unwrap().parts[0].as_text(), Some("fresh"));
    }

    #[test]
    fn test_bounded_size() {
        let mut mailbox = AgentMailbox::new("risk");
        for i in 0..(MAX_MAILBOX_SIZE + 5) {
            mailbox.deliver(msg(&format!("m{}", i)));
        }
        assert_eq!(mailbox.len(), MAX_MAILBOX_SIZE);
        assert_eq!(mailbox.peek().unwrap().parts[0].as_text(), Some("m5"));
    }

    #[tokio::test]
    async fn test_recv_waits_for_delivery() {
        let store = Arc::new(MailboxStore::new());
        store.open("risk");
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.recv("risk", Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.deliver("risk", msg("wake"));
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.parts[0].as_text(), Some("wake"));
    }

    #[tokio::test]
    async fn test_recv_times_out() {
        let store = MailboxStore::new();
        store.open("idle");
        assert!(store.recv("idle", Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_reads_do_not_create_mailboxes() {
        let store = MailboxStore::new();
        assert_eq!(store.len("ghost"), 0);
        assert!(store.try_recv("ghost").is_none());
        assert!(store.drain("ghost").is_empty());
        assert!(store.recv("ghost", Duration::from_secs(5)).await.is_none());
        assert!(store.all_stats().is_empty());
    }

    #[test]
    fn test_retain_agents_drops_unknown_mailboxes() {
        let store = MailboxStore::new();
        store.deliver("risk", msg("a"));
        store.deliver("gone", msg("b"));
        store.deliver("gone", msg("c"));

        assert_eq!(store.retain_agents(|id| id == "risk"), 2);
        assert_eq!(store.len("risk"), 1);
        let agents: Vec<String> = store.all_stats().into_iter().map(|s| s.agent_id).collect();
        assert_eq!(agents, vec!["risk".to_string()]);
    }
}
