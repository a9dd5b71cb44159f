//! Per-job synchronization state machine.
//!
//! One [`JobSync`] owns everything for a single job: the push connection,
//! the merged message/step sequences, the ticket set, and the derived
//! progress. Events are consumed strictly one at a time off the connection
//! channel, so no handler can reorder or batch them in ways that change the
//! observable merge outcome. Observers receive immutable [`JobView`]
//! snapshots over a watch channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::connection::{self, ConnEvent, ConnectionHandle, ConnectionState};
use crate::errors::SyncError;
use crate::merge::{MessageMergeEngine, StepLog};
use crate::model::{AgentStep, ChatMessage, JobPhase, MessageRole};
use crate::progress::{Progress, project};
use crate::protocol::{ClientEnvelope, Envelope};
use crate::rest::RestClient;
use crate::tickets::{TicketNode, TicketPatch, TicketReconciler};

/// Advisory notices are bounded so a chatty server cannot grow the view
/// without limit.
const MAX_NOTICES: usize = 50;

// ── Observable snapshot ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

impl NoticeLevel {
    fn from_metadata(metadata: &serde_json::Value) -> Self {
        match metadata.get("level").and_then(|v| v.as_str()) {
            Some("warn") | Some("warning") => Self::Warning,
            Some("error") => Self::Error,
            _ => Self::Info,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Immutable snapshot of everything a renderer needs for one job.
#[derive(Debug, Clone)]
pub struct JobView {
    pub job_id: String,
    pub prompt: String,
    pub phase: Option<JobPhase>,
    pub progress: Progress,
    pub connection: ConnectionState,
    pub messages: Vec<ChatMessage>,
    pub steps: Vec<AgentStep>,
    pub tickets: Vec<TicketNode>,
    /// Bumped on every ticket reset; a change means discontinuity, not diff.
    pub ticket_generation: u64,
    pub prd: Option<String>,
    pub last_error: Option<String>,
    pub notices: Vec<Notice>,
}

// ── Internal state ───────────────────────────────────────────────────

enum Followup {
    ResyncTickets,
}

struct JobState {
    job_id: String,
    prompt: String,
    phase: Option<JobPhase>,
    last_percent: Option<u8>,
    connection: ConnectionState,
    merge: MessageMergeEngine,
    steps: StepLog,
    tickets: TicketReconciler,
    prd: Option<String>,
    last_error: Option<String>,
    notices: VecDeque<Notice>,
}

impl JobState {
    fn new(job_id: String) -> Self {
        Self {
            job_id,
            prompt: String::new(),
            phase: None,
            last_percent: None,
            connection: ConnectionState::Idle,
            merge: MessageMergeEngine::new(),
            steps: StepLog::new(),
            tickets: TicketReconciler::new(),
            prd: None,
            last_error: None,
            notices: VecDeque::new(),
        }
    }

    /// Route one envelope to its reducer. Pure routing: exactly one
    /// destination per kind, no business logic beyond construction.
    fn apply_envelope(&mut self, envelope: Envelope) -> Option<Followup> {
        match envelope {
            Envelope::JobStatus { status, message } => {
                match JobPhase::parse(&status) {
                    Some(phase) => self.phase = Some(phase),
                    // Unknown phase strings keep the prior phase.
                    None => warn!(status, "ignoring unknown job phase"),
                }
                if let Some(text) = message {
                    self.last_error = Some(text);
                }
                None
            }
            Envelope::StageUpdate { role, content, id, sender, metadata, timestamp } => {
                let sender = sender.unwrap_or_else(|| default_sender(role).to_string());
                self.merge.merge_incoming(ChatMessage {
                    id: id.unwrap_or_else(fresh_id),
                    role,
                    sender,
                    content,
                    metadata,
                    timestamp: timestamp.unwrap_or_else(Utc::now),
                });
                None
            }
            Envelope::AgentDialogue { agent, message, id, seq, timestamp } => {
                self.steps.merge(AgentStep {
                    id: id.unwrap_or_else(fresh_id),
                    agent,
                    message,
                    seq,
                    timestamp: timestamp.unwrap_or_else(Utc::now),
                });
                None
            }
            Envelope::PrdReady { spec } => {
                self.prd = Some(spec);
                None
            }
            Envelope::TicketUpdate {
                ticket_id,
                title,
                description,
                status,
                kind,
                assigned_to,
                parent_id,
            } => {
                self.tickets.upsert(TicketPatch {
                    id: ticket_id,
                    title: Some(title),
                    description,
                    status,
                    kind,
                    assignee: assigned_to,
                    parent_id,
                });
                None
            }
            Envelope::TicketReset => Some(Followup::ResyncTickets),
            Envelope::Control { message, metadata } => {
                self.push_notice(NoticeLevel::from_metadata(&metadata), message);
                None
            }
            Envelope::Error { message } => {
                // Surface inline in the dialogue as well as on the view.
                self.last_error = Some(message.clone());
                self.merge.merge_incoming(ChatMessage {
                    id: fresh_id(),
                    role: MessageRole::System,
                    sender: "system".to_string(),
                    content: message,
                    metadata: serde_json::Value::Null,
                    timestamp: Utc::now(),
                });
                None
            }
            Envelope::Unknown => {
                debug!("unknown envelope reached the reducer; dropping");
                None
            }
        }
    }

    fn push_notice(&mut self, level: NoticeLevel, message: String) {
        self.notices.push_back(Notice { level, message, timestamp: Utc::now() });
        while self.notices.len() > MAX_NOTICES {
            self.notices.pop_front();
        }
    }

    /// Snapshot the current state, refreshing the progress memo.
    fn view(&mut self) -> JobView {
        let progress = match self.phase {
            Some(phase) => project(
                phase,
                self.last_error.as_deref(),
                self.tickets.records(),
                self.last_percent,
            ),
            None => Progress { percent: 0, phase: "Waiting for job".to_string() },
        };
        if self.phase != Some(JobPhase::Failed) {
            self.last_percent = Some(progress.percent);
        }
        JobView {
            job_id: self.job_id.clone(),
            prompt: self.prompt.clone(),
            phase: self.phase,
            progress,
            connection: self.connection,
            messages: self.merge.messages().to_vec(),
            steps: self.steps.steps().to_vec(),
            tickets: self.tickets.tree(),
            ticket_generation: self.tickets.generation(),
            prd: self.prd.clone(),
            last_error: self.last_error.clone(),
            notices: self.notices.iter().cloned().collect(),
        }
    }
}

fn fresh_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_sender(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Agent => "agent",
        MessageRole::System => "system",
    }
}

// ── Public handle ────────────────────────────────────────────────────

enum Command {
    SendChat { content: String, reply: oneshot::Sender<Result<(), SyncError>> },
}

/// Handle to a running per-job synchronizer.
pub struct JobSync {
    job_id: String,
    handle: ConnectionHandle,
    cmd_tx: mpsc::Sender<Command>,
    view_rx: watch::Receiver<JobView>,
    epoch: Arc<AtomicU64>,
}

impl JobSync {
    /// Start synchronizing a job: fetch the initial REST snapshot, open the
    /// push channel, and keep the view current until [`shutdown`].
    ///
    /// [`shutdown`]: JobSync::shutdown
    pub fn spawn(cfg: &SyncConfig, job_id: impl Into<String>) -> Result<Self, SyncError> {
        let job_id = job_id.into();
        let ws_url = cfg.ws_url(&job_id).map_err(|e| SyncError::BadEndpoint(e.to_string()))?;
        let rest = RestClient::new(cfg);

        let (handle, events) = connection::open(ws_url, cfg.backoff.clone());
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let mut initial = JobState::new(job_id.clone());
        let (view_tx, view_rx) = watch::channel(initial.view());
        let epoch = Arc::new(AtomicU64::new(0));

        tokio::spawn(run_actor(
            initial,
            rest,
            handle.clone(),
            events,
            cmd_rx,
            view_tx,
            epoch.clone(),
        ));

        Ok(Self { job_id, handle, cmd_tx, view_rx, epoch })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Watch receiver for view snapshots; await `.changed()` to follow.
    pub fn subscribe(&self) -> watch::Receiver<JobView> {
        self.view_rx.clone()
    }

    /// Current snapshot.
    pub fn view(&self) -> JobView {
        self.view_rx.borrow().clone()
    }

    /// Send operator chat input. The message is rendered optimistically and
    /// replaced by its server echo. Rejected locally when disconnected or
    /// when the job no longer accepts input.
    pub async fn send_chat(&self, content: impl Into<String>) -> Result<(), SyncError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SendChat { content: content.into(), reply: reply_tx })
            .await
            .map_err(|_| SyncError::NotConnected)?;
        reply_rx.await.map_err(|_| SyncError::NotConnected)?
    }

    /// Tear down: close the socket cleanly and invalidate any in-flight
    /// resynchronization so it cannot mutate stale state.
    pub fn shutdown(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.handle.close();
    }
}

impl Drop for JobSync {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Actor loop ───────────────────────────────────────────────────────

async fn run_actor(
    mut state: JobState,
    rest: RestClient,
    handle: ConnectionHandle,
    mut events: mpsc::Receiver<ConnEvent>,
    mut cmd_rx: mpsc::Receiver<Command>,
    view_tx: watch::Sender<JobView>,
    epoch: Arc<AtomicU64>,
) {
    // Initial population mirrors the reconnect resync path.
    full_resync(&rest, &mut state, &epoch).await;
    let _ = view_tx.send_replace(state.view());

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::SendChat { content, reply }) => {
                    let result = send_chat(&mut state, &handle, content).await;
                    let _ = reply.send(result);
                    let _ = view_tx.send_replace(state.view());
                }
                None => break, // JobSync dropped; connection close() already ran
            },
            event = events.recv() => match event {
                Some(event) => {
                    handle_event(&mut state, &rest, &epoch, event).await;
                    let _ = view_tx.send_replace(state.view());
                }
                None => break, // connection task finished after a terminal state
            },
        }
    }
}

async fn handle_event(
    state: &mut JobState,
    rest: &RestClient,
    epoch: &Arc<AtomicU64>,
    event: ConnEvent,
) {
    match event {
        ConnEvent::State(s) => state.connection = s,
        ConnEvent::Opened { resync } => {
            state.connection = ConnectionState::Open;
            if resync {
                // Close the gap that occurred while disconnected before
                // trusting further push events.
                full_resync(rest, state, epoch).await;
            }
        }
        ConnEvent::Envelope(envelope) => {
            if let Some(Followup::ResyncTickets) = state.apply_envelope(envelope) {
                resync_tickets(rest, state, epoch).await;
            }
        }
        ConnEvent::Fatal(err) => {
            state.last_error = Some(err.to_string());
            state.push_notice(NoticeLevel::Error, err.to_string());
        }
    }
}

async fn send_chat(
    state: &mut JobState,
    handle: &ConnectionHandle,
    content: String,
) -> Result<(), SyncError> {
    if state.connection != ConnectionState::Open {
        return Err(SyncError::NotConnected);
    }
    if let Some(phase) = state.phase {
        if !phase.accepts_input() {
            return Err(SyncError::InputClosed);
        }
    }
    let local = ChatMessage::optimistic(MessageRole::User, "user", content.clone());
    let local_id = local.id.clone();
    state.merge.merge_incoming(local);
    // A failed handoff means no echo will ever arrive; drop the placeholder
    // instead of leaving a phantom entry in the view.
    if let Err(e) = handle.send(&ClientEnvelope::Chat { content }).await {
        state.merge.remove(&local_id);
        return Err(e);
    }
    Ok(())
}

/// Refetch job, messages, steps, and tickets; apply only if the epoch is
/// unchanged (a teardown that raced this fetch must make it a no-op).
async fn full_resync(rest: &RestClient, state: &mut JobState, epoch: &Arc<AtomicU64>) {
    let before = epoch.load(Ordering::SeqCst);
    let job_id = state.job_id.clone();

    let job = rest.job(&job_id).await;
    let messages = rest.messages(&job_id).await;
    let steps = rest.steps(&job_id).await;
    let tickets = rest.tickets(&job_id).await;

    if epoch.load(Ordering::SeqCst) != before {
        debug!(job_id, "discarding stale resynchronization");
        return;
    }

    match job {
        Ok(snapshot) => {
            state.prompt = snapshot.prompt;
            match JobPhase::parse(&snapshot.status) {
                Some(phase) => state.phase = Some(phase),
                None => warn!(status = %snapshot.status, "job snapshot has unknown phase"),
            }
            if snapshot.error.is_some() {
                state.last_error = snapshot.error;
            }
            if let Some(embedded) = snapshot.messages {
                state.merge.merge_snapshot(embedded);
            }
            if let Some(embedded) = snapshot.steps {
                state.steps.merge_snapshot(embedded);
            }
        }
        Err(e) => warn!(job_id, error = %e, "job snapshot fetch failed"),
    }
    match messages {
        Ok(list) => state.merge.merge_snapshot(list),
        Err(e) => debug!(job_id, error = %e, "message snapshot fetch failed"),
    }
    match steps {
        Ok(list) => state.steps.merge_snapshot(list),
        Err(e) => debug!(job_id, error = %e, "step snapshot fetch failed"),
    }
    match tickets {
        Ok(list) => state.tickets.reset(list),
        Err(e) => debug!(job_id, error = %e, "ticket snapshot fetch failed"),
    }
}

async fn resync_tickets(rest: &RestClient, state: &mut JobState, epoch: &Arc<AtomicU64>) {
    let before = epoch.load(Ordering::SeqCst);
    let fetched = rest.tickets(&state.job_id).await;
    if epoch.load(Ordering::SeqCst) != before {
        debug!(job_id = %state.job_id, "discarding stale ticket resynchronization");
        return;
    }
    match fetched {
        Ok(list) => state.tickets.reset(list),
        Err(e) => warn!(job_id = %state.job_id, error = %e, "ticket resynchronization failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TicketKind, TicketRecord};

    fn state() -> JobState {
        JobState::new("j-1".to_string())
    }

    fn ticket(id: &str, kind: TicketKind, status: &str) -> TicketRecord {
        TicketRecord {
            id: id.to_string(),
            kind,
            title: String::new(),
            description: String::new(),
            status: status.to_string(),
            assignee: None,
            parent_id: None,
            depends_on: Vec::new(),
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_job_status_updates_phase() {
        let mut s = state();
        s.apply_envelope(Envelope::JobStatus { status: "building".into(), message: None });
        assert_eq!(s.phase, Some(JobPhase::Building));
    }

    #[test]
    fn test_unknown_phase_keeps_prior() {
        let mut s = state();
        s.apply_envelope(Envelope::JobStatus { status: "planning".into(), message: None });
        s.apply_envelope(Envelope::JobStatus { status: "hyperdrive".into(), message: None });
        assert_eq!(s.phase, Some(JobPhase::Planning));
    }

    #[test]
    fn test_job_status_carries_error_text() {
        let mut s = state();
        s.apply_envelope(Envelope::JobStatus {
            status: "failed".into(),
            message: Some("planner crashed".into()),
        });
        assert_eq!(s.phase, Some(JobPhase::Failed));
        assert_eq!(s.last_error.as_deref(), Some("planner crashed"));
    }

    #[test]
    fn test_stage_update_appends_message_with_defaults() {
        let mut s = state();
        s.apply_envelope(Envelope::StageUpdate {
            role: MessageRole::Agent,
            content: "analyzing prompt".into(),
            id: None,
            sender: None,
            metadata: serde_json::Value::Null,
            timestamp: None,
        });
        assert_eq!(s.merge.messages().len(), 1);
        assert_eq!(s.merge.messages()[0].sender, "agent");
        assert!(!s.merge.messages()[0].is_optimistic());
    }

    #[test]
    fn test_error_envelope_sets_error_and_appends_system_message() {
        let mut s = state();
        s.apply_envelope(Envelope::Error { message: "disk full".into() });
        assert_eq!(s.last_error.as_deref(), Some("disk full"));
        assert_eq!(s.merge.messages().len(), 1);
        assert_eq!(s.merge.messages()[0].role, MessageRole::System);
    }

    #[test]
    fn test_ticket_reset_requests_followup() {
        let mut s = state();
        let followup = s.apply_envelope(Envelope::TicketReset);
        assert!(matches!(followup, Some(Followup::ResyncTickets)));
    }

    #[test]
    fn test_ticket_update_upserts() {
        let mut s = state();
        s.apply_envelope(Envelope::TicketUpdate {
            ticket_id: "t-1".into(),
            title: "Wire auth".into(),
            description: None,
            status: Some("in_progress".into()),
            kind: Some(TicketKind::Story),
            assigned_to: None,
            parent_id: None,
        });
        assert_eq!(s.tickets.records().len(), 1);
        assert_eq!(s.tickets.records()[0].title, "Wire auth");
    }

    #[test]
    fn test_control_notices_are_bounded() {
        let mut s = state();
        for i in 0..(MAX_NOTICES + 10) {
            s.apply_envelope(Envelope::Control {
                message: format!("notice {i}"),
                metadata: serde_json::Value::Null,
            });
        }
        assert_eq!(s.notices.len(), MAX_NOTICES);
        assert_eq!(s.notices.back().unwrap().message, format!("notice {}", MAX_NOTICES + 9));
    }

    #[test]
    fn test_notice_level_parsed_from_metadata() {
        let mut s = state();
        s.apply_envelope(Envelope::Control {
            message: "queue saturated".into(),
            metadata: serde_json::json!({"level": "warning"}),
        });
        assert_eq!(s.notices.back().unwrap().level, NoticeLevel::Warning);
    }

    #[test]
    fn test_prd_ready_records_artifact_without_phase_change() {
        let mut s = state();
        s.apply_envelope(Envelope::JobStatus { status: "planning".into(), message: None });
        s.apply_envelope(Envelope::PrdReady { spec: "# PRD".into() });
        assert_eq!(s.prd.as_deref(), Some("# PRD"));
        assert_eq!(s.phase, Some(JobPhase::Planning));
    }

    #[test]
    fn test_failure_keeps_last_in_progress_percent() {
        let mut s = state();
        s.tickets.reset(vec![
            ticket("s-1", TicketKind::Story, "done"),
            ticket("s-2", TicketKind::Story, "todo"),
        ]);
        s.apply_envelope(Envelope::JobStatus { status: "building".into(), message: None });
        let before = s.view();
        assert_eq!(before.progress.percent, 85);

        s.apply_envelope(Envelope::JobStatus { status: "failed".into(), message: None });
        let after = s.view();
        assert_eq!(after.progress.percent, 85);
    }

    #[tokio::test]
    async fn test_failed_transmit_rolls_back_optimistic_entry() {
        use crate::connection::BackoffPolicy;
        use std::time::Duration;

        // Exhaust the manager immediately so its handle rejects sends.
        let url = url::Url::parse("ws://127.0.0.1:1/ws/jobs/j-1?token=t").unwrap();
        let policy = BackoffPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
            max_attempts: 0,
        };
        let (handle, mut events) = connection::open(url, policy);
        while events.recv().await.is_some() {}

        let mut s = state();
        s.connection = ConnectionState::Open;
        let err = send_chat(&mut s, &handle, "hello".into()).await.unwrap_err();
        assert!(matches!(err, SyncError::NotConnected));
        assert!(s.merge.messages().is_empty());
    }

    #[test]
    fn test_view_waiting_before_any_status() {
        let mut s = state();
        let view = s.view();
        assert_eq!(view.progress.percent, 0);
        assert!(view.phase.is_none());
        assert_eq!(view.connection, ConnectionState::Idle);
    }
}
