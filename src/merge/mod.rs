//! Merging of REST-sourced and push-delivered sequences.
//!
//! The chat pane shows one time-ordered sequence assembled from two feeds
//! that overlap: REST snapshots and push events. The merge engine guarantees
//! exactly-once perceived delivery — an optimistic local entry is replaced,
//! not duplicated, by its server echo, and a push echo of a message already
//! present in a snapshot is discarded.

use chrono::{DateTime, Utc};

use crate::model::{AgentStep, ChatMessage, MessageRole};

/// Window within which a server echo replaces an optimistic placeholder.
pub const OPTIMISTIC_WINDOW_SECS: i64 = 5;

/// Tighter window for discarding near-duplicates by (content, sender, role).
pub const NEAR_DUP_WINDOW_SECS: i64 = 2;

fn within(a: DateTime<Utc>, b: DateTime<Utc>, secs: i64) -> bool {
    (a - b).num_seconds().abs() <= secs
}

// ── Message merge ────────────────────────────────────────────────────

/// Combines message feeds into a single sequence ordered by timestamp
/// ascending, ties broken by arrival order.
#[derive(Debug, Default)]
pub struct MessageMergeEngine {
    messages: Vec<ChatMessage>,
}

impl MessageMergeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Merge one push-delivered (or locally originated) message.
    pub fn merge_incoming(&mut self, msg: ChatMessage) {
        // 1. Exact id already present: no-op.
        if self.messages.iter().any(|m| m.id == msg.id) {
            return;
        }

        // 2. A user message may be the server echo of an optimistic
        //    placeholder: replace it in place rather than appending.
        if msg.role == MessageRole::User && !msg.is_optimistic() {
            if let Some(pos) = self.messages.iter().position(|m| {
                m.is_optimistic()
                    && m.role == msg.role
                    && m.content == msg.content
                    && within(m.timestamp, msg.timestamp, OPTIMISTIC_WINDOW_SECS)
            }) {
                self.messages[pos] = msg;
                self.sort();
                return;
            }
        }

        // 3. Near-duplicate by (content, sender, role) within the tight
        //    window: discard.
        if self.messages.iter().any(|m| {
            m.content == msg.content
                && m.sender == msg.sender
                && m.role == msg.role
                && within(m.timestamp, msg.timestamp, NEAR_DUP_WINDOW_SECS)
        }) {
            return;
        }

        // 4. Append and re-sort.
        self.messages.push(msg);
        self.sort();
    }

    /// Merge a freshly fetched REST snapshot.
    ///
    /// Snapshots may lag the push feed, so prior entries are never
    /// discarded: each snapshot entry runs through the incoming merge, which
    /// already collapses id duplicates, echoes of optimistic placeholders,
    /// and near-duplicates.
    pub fn merge_snapshot(&mut self, snapshot: Vec<ChatMessage>) {
        for msg in snapshot {
            self.merge_incoming(msg);
        }
    }

    /// Remove an entry by id. Used to roll back an optimistic append whose
    /// transmit failed and will therefore never be echoed.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.id != id);
        self.messages.len() != before
    }

    fn sort(&mut self) {
        // Vec::sort_by is stable, so arrival order survives timestamp ties.
        self.messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    }
}

// ── Agent step log ───────────────────────────────────────────────────

/// Append-only agent dialogue log, ordered by (timestamp, seq).
#[derive(Debug, Default)]
pub struct StepLog {
    steps: Vec<AgentStep>,
}

impl StepLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> &[AgentStep] {
        &self.steps
    }

    pub fn merge(&mut self, step: AgentStep) {
        if self.steps.iter().any(|s| s.id == step.id) {
            return;
        }
        self.steps.push(step);
        self.sort();
    }

    pub fn merge_snapshot(&mut self, snapshot: Vec<AgentStep>) {
        for step in snapshot {
            if !self.steps.iter().any(|s| s.id == step.id) {
                self.steps.push(step);
            }
        }
        self.sort();
    }

    fn sort(&mut self) {
        self.steps.sort_by(|a, b| (a.timestamp, a.seq).cmp(&(b.timestamp, b.seq)));
    }
}
