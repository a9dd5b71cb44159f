//! Push-channel envelope types and tolerant decoding.
//!
//! Every discrete push event is an envelope with a `kind` discriminant.
//! Decoding is forward compatible: unknown kinds and undecodable payloads
//! are logged and dropped, never surfaced as errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::MessageRole;

// ── Inbound envelopes ────────────────────────────────────────────────

/// One push-delivered event, classified by its `kind` tag.
///
/// Every field is optional on the wire unless the server contract requires
/// it; unknown fields are ignored by serde.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Envelope {
    /// Job lifecycle phase change. `message` carries error text on failure.
    JobStatus {
        status: String,
        #[serde(default)]
        message: Option<String>,
    },

    /// A chat-pane message from the pipeline.
    #[serde(rename_all = "camelCase")]
    StageUpdate {
        role: MessageRole,
        content: String,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        sender: Option<String>,
        #[serde(default)]
        metadata: serde_json::Value,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },

    /// One order-numbered entry of the agent dialogue log.
    #[serde(rename_all = "camelCase")]
    AgentDialogue {
        agent: String,
        message: String,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        seq: i64,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Planning artifact complete. Does not imply job completion.
    PrdReady { spec: String },

    /// Upsert of a single ticket; absent fields leave prior values intact.
    #[serde(rename_all = "camelCase")]
    TicketUpdate {
        ticket_id: String,
        title: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        status: Option<String>,
        #[serde(default, rename = "type")]
        kind: Option<crate::model::TicketKind>,
        #[serde(default)]
        assigned_to: Option<String>,
        #[serde(default)]
        parent_id: Option<String>,
    },

    /// The backlog was regenerated upstream; refetch the full ticket set.
    TicketReset,

    /// Advisory operational notice; severity in `metadata.level`.
    Control {
        message: String,
        #[serde(default)]
        metadata: serde_json::Value,
    },

    /// Application-level error, surfaced to the user verbatim. Does not by
    /// itself close the connection.
    Error { message: String },

    /// Server-added kind this client does not know about yet.
    #[serde(other)]
    Unknown,
}

/// Decode a raw text frame into an envelope.
///
/// Returns `None` for malformed payloads and unknown kinds so the caller
/// can simply skip them; neither may affect other envelopes.
pub fn decode(text: &str) -> Option<Envelope> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "dropping undecodable envelope");
            return None;
        }
    };
    let kind = value
        .get("kind")
        .and_then(|k| k.as_str())
        .unwrap_or("<missing>")
        .to_string();
    match serde_json::from_value::<Envelope>(value) {
        Ok(Envelope::Unknown) => {
            debug!(kind, "ignoring unknown envelope kind");
            None
        }
        Ok(env) => Some(env),
        Err(e) => {
            warn!(kind, error = %e, "dropping malformed envelope");
            None
        }
    }
}

// ── Outbound envelopes ───────────────────────────────────────────────

/// Client-originated envelopes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ClientEnvelope {
    /// Operator chat input, accepted only while the job is collecting.
    Chat { content: String },
}

// ── Close-code classification ────────────────────────────────────────

/// How a socket closure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseClass {
    /// Intentional closure; terminal, no retry.
    Clean,
    /// Credential rejected; terminal, surfaced for re-authentication.
    Auth,
    /// Anything else; retried with backoff.
    Transient,
}

impl CloseClass {
    pub fn classify(code: u16) -> Self {
        match code {
            1000 | 1001 => Self::Clean,
            // 1008 is the policy-violation code our gateway uses for expired
            // tokens; 44xx are its explicit auth codes.
            1008 | 4401 | 4403 => Self::Auth,
            _ => Self::Transient,
        }
    }
}
