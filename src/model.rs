//! Domain types shared across the sync client.
//!
//! Everything here is read from the server and merged client-side; the only
//! client-originated objects are optimistic [`ChatMessage`]s, which carry a
//! `local-` prefixed temporary id until their authoritative echo arrives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix used for ids of messages created locally before server confirmation.
pub const LOCAL_ID_PREFIX: &str = "local-";

// ── Job lifecycle ────────────────────────────────────────────────────

/// Server-side job lifecycle phases, in pipeline order.
///
/// The derived `Ord` follows the pipeline ordering, which the progress
/// projector relies on. `Failed` sorts last but is reachable from any
/// non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Collecting,
    Queued,
    Planning,
    PrdReady,
    Ticketing,
    TicketsReady,
    Building,
    BuildDone,
    Done,
    Failed,
}

impl JobPhase {
    /// Parse a server status string. Returns `None` for unknown values so
    /// callers can keep their previous phase instead of guessing.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "collecting" => Some(Self::Collecting),
            "queued" => Some(Self::Queued),
            "planning" => Some(Self::Planning),
            "prd_ready" => Some(Self::PrdReady),
            "ticketing" => Some(Self::Ticketing),
            "tickets_ready" => Some(Self::TicketsReady),
            "building" => Some(Self::Building),
            "build_done" => Some(Self::BuildDone),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the job still accepts operator chat input.
    pub fn accepts_input(&self) -> bool {
        matches!(self, Self::Collecting | Self::Queued)
    }

    /// Whether the job has reached a terminal phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::BuildDone | Self::Done | Self::Failed)
    }
}

/// REST-sourced job record. The sync client never mutates this directly;
/// local state is merged atop it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: String,
    #[serde(default)]
    pub prompt: String,
    /// Raw lifecycle status string; fold through [`JobPhase::parse`].
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Optionally embedded by the job endpoint.
    #[serde(default)]
    pub messages: Option<Vec<ChatMessage>>,
    #[serde(default)]
    pub steps: Option<Vec<AgentStep>>,
}

impl JobSnapshot {
    pub fn phase(&self) -> Option<JobPhase> {
        JobPhase::parse(&self.status)
    }
}

// ── Chat messages ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Agent,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: MessageRole,
    #[serde(default)]
    pub sender: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Create an optimistic entry for content originated locally. It carries
    /// a temporary id and is replaced in place once the server echoes it.
    pub fn optimistic(role: MessageRole, sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4()),
            role,
            sender: sender.into(),
            content: content.into(),
            metadata: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn is_optimistic(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }
}

// ── Agent steps ──────────────────────────────────────────────────────

/// One entry of the agent dialogue log. Append-only per job; `seq` is the
/// server-assigned order number used as a tie-break on timestamp collisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    pub id: String,
    pub agent: String,
    pub message: String,
    #[serde(default)]
    pub seq: i64,
    pub timestamp: DateTime<Utc>,
}

// ── Tickets ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketKind {
    Epic,
    Story,
    Task,
}

impl Default for TicketKind {
    fn default() -> Self {
        Self::Task
    }
}

/// Normalized ticket status buckets. Servers send free-form strings; fold
/// them through [`TicketStatus::normalize`] before bucketing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Todo,
    InProgress,
    Done,
}

impl TicketStatus {
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "in-progress" | "in_progress" | "in progress" | "working" => Self::InProgress,
            "done" | "completed" | "finished" => Self::Done,
            _ => Self::Todo,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketRecord {
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: TicketKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Raw status string as sent by the server.
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TicketRecord {
    pub fn status_bucket(&self) -> TicketStatus {
        TicketStatus::normalize(&self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_parse_known_values() {
        assert_eq!(JobPhase::parse("collecting"), Some(JobPhase::Collecting));
        assert_eq!(JobPhase::parse("prd_ready"), Some(JobPhase::PrdReady));
        assert_eq!(JobPhase::parse("build_done"), Some(JobPhase::BuildDone));
        assert_eq!(JobPhase::parse("failed"), Some(JobPhase::Failed));
    }

    #[test]
    fn test_phase_parse_unknown_returns_none() {
        assert_eq!(JobPhase::parse("deploying"), None);
        assert_eq!(JobPhase::parse(""), None);
    }

    #[test]
    fn test_phase_ordering_follows_pipeline() {
        assert!(JobPhase::Collecting < JobPhase::Queued);
        assert!(JobPhase::Queued < JobPhase::Planning);
        assert!(JobPhase::TicketsReady < JobPhase::Building);
        assert!(JobPhase::Building < JobPhase::Done);
    }

    #[test]
    fn test_phase_accepts_input() {
        assert!(JobPhase::Collecting.accepts_input());
        assert!(JobPhase::Queued.accepts_input());
        assert!(!JobPhase::Building.accepts_input());
        assert!(!JobPhase::Failed.accepts_input());
    }

    #[test]
    fn test_optimistic_message_has_local_id() {
        let msg = ChatMessage::optimistic(MessageRole::User, "user", "hello");
        assert!(msg.is_optimistic());
        assert!(msg.id.starts_with(LOCAL_ID_PREFIX));
    }

    #[test]
    fn test_authoritative_message_is_not_optimistic() {
        let json = r#"{"id":"m-1","role":"agent","sender":"planner","content":"hi","timestamp":"2024-01-01T00:00:00Z"}"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert!(!msg.is_optimistic());
        assert_eq!(msg.role, MessageRole::Agent);
    }

    #[test]
    fn test_ticket_status_normalize_variants() {
        assert_eq!(TicketStatus::normalize("in-progress"), TicketStatus::InProgress);
        assert_eq!(TicketStatus::normalize("in_progress"), TicketStatus::InProgress);
        assert_eq!(TicketStatus::normalize("in progress"), TicketStatus::InProgress);
        assert_eq!(TicketStatus::normalize("Working"), TicketStatus::InProgress);
        assert_eq!(TicketStatus::normalize("done"), TicketStatus::Done);
        assert_eq!(TicketStatus::normalize("COMPLETED"), TicketStatus::Done);
        assert_eq!(TicketStatus::normalize("finished"), TicketStatus::Done);
    }

    #[test]
    fn test_ticket_status_normalize_unknown_is_todo() {
        assert_eq!(TicketStatus::normalize(""), TicketStatus::Todo);
        assert_eq!(TicketStatus::normalize("blocked"), TicketStatus::Todo);
        assert_eq!(TicketStatus::normalize("todo"), TicketStatus::Todo);
    }

    #[test]
    fn test_ticket_record_deserializes_with_defaults() {
        let json = r#"{"id":"t-1","title":"Set up CI"}"#;
        let rec: TicketRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.kind, TicketKind::Task);
        assert_eq!(rec.status_bucket(), TicketStatus::Todo);
        assert!(rec.parent_id.is_none());
        assert!(rec.depends_on.is_empty());
    }

    #[test]
    fn test_job_snapshot_phase_accessor() {
        let json = r#"{"id":"j-1","status":"building"}"#;
        let job: JobSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(job.phase(), Some(JobPhase::Building));

        let json = r#"{"id":"j-2","status":"something_new"}"#;
        let job: JobSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(job.phase(), None);
    }
}
