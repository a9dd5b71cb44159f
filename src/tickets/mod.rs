//! Authoritative ticket set per job, with defensive tree derivation.
//!
//! Records arrive flat (REST snapshot or push upserts) and are projected
//! into epics-with-children on demand. Tree construction never drops a
//! record and never recurses: a ticket whose parent cannot be resolved, or
//! points at itself, becomes an orphan root.

use std::collections::HashSet;

use crate::model::{TicketKind, TicketRecord, TicketStatus};

/// Partial update for a single ticket, as carried by `ticketUpdate`
/// envelopes. Absent fields leave the prior record's values intact.
#[derive(Debug, Clone, Default)]
pub struct TicketPatch {
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    pub kind: Option<TicketKind>,
    pub assignee: Option<String>,
    pub parent_id: Option<String>,
}

/// One root of the derived ticket tree.
#[derive(Debug, Clone)]
pub struct TicketNode {
    pub ticket: TicketRecord,
    pub children: Vec<TicketRecord>,
}

/// Maintains the working ticket set for a job.
#[derive(Debug, Default)]
pub struct TicketReconciler {
    tickets: Vec<TicketRecord>,
    generation: u64,
}

impl TicketReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[TicketRecord] {
        &self.tickets
    }

    /// Bumped on every reset so consumers can treat it as a discontinuity.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Apply a partial update, merging onto the prior record when present
    /// and appending a fresh record otherwise.
    pub fn upsert(&mut self, patch: TicketPatch) {
        if let Some(existing) = self.tickets.iter_mut().find(|t| t.id == patch.id) {
            if let Some(title) = patch.title {
                existing.title = title;
            }
            if let Some(description) = patch.description {
                existing.description = description;
            }
            if let Some(status) = patch.status {
                existing.status = status;
            }
            if let Some(kind) = patch.kind {
                existing.kind = kind;
            }
            if let Some(assignee) = patch.assignee {
                existing.assignee = Some(assignee);
            }
            if let Some(parent_id) = patch.parent_id {
                existing.parent_id = Some(parent_id);
            }
        } else {
            self.tickets.push(TicketRecord {
                id: patch.id,
                kind: patch.kind.unwrap_or_default(),
                title: patch.title.unwrap_or_default(),
                description: patch.description.unwrap_or_default(),
                status: patch.status.unwrap_or_default(),
                assignee: patch.assignee,
                parent_id: patch.parent_id,
                depends_on: Vec::new(),
                created_at: None,
                updated_at: None,
            });
        }
    }

    /// Replace the entire working set atomically.
    pub fn reset(&mut self, records: Vec<TicketRecord>) {
        self.tickets = records;
        self.generation += 1;
    }

    /// Derive the hierarchical view: epics with their resolved children
    /// first, then orphan roots for everything unresolvable.
    pub fn tree(&self) -> Vec<TicketNode> {
        let epic_ids: HashSet<&str> = self
            .tickets
            .iter()
            .filter(|t| t.kind == TicketKind::Epic)
            .map(|t| t.id.as_str())
            .collect();

        let resolves_to_epic = |t: &TicketRecord| -> bool {
            match t.parent_id.as_deref() {
                // Self-reference is never a valid parent.
                Some(p) if p != t.id => epic_ids.contains(p),
                _ => false,
            }
        };

        let mut roots: Vec<TicketNode> = self
            .tickets
            .iter()
            .filter(|t| t.kind == TicketKind::Epic)
            .map(|epic| TicketNode {
                ticket: epic.clone(),
                children: self
                    .tickets
                    .iter()
                    .filter(|t| {
                        t.kind != TicketKind::Epic
                            && resolves_to_epic(t)
                            && t.parent_id.as_deref() == Some(epic.id.as_str())
                    })
                    .cloned()
                    .collect(),
            })
            .collect();

        // Orphans: non-epics whose parent is absent, self-referential, or
        // not a known epic. They are roots, never dropped.
        roots.extend(
            self.tickets
                .iter()
                .filter(|t| t.kind != TicketKind::Epic && !resolves_to_epic(t))
                .map(|t| TicketNode { ticket: t.clone(), children: Vec::new() }),
        );

        roots
    }

    /// (done, total) over non-epic records, statuses folded first.
    pub fn counts(&self) -> (usize, usize) {
        let non_epics: Vec<&TicketRecord> =
            self.tickets.iter().filter(|t| t.kind != TicketKind::Epic).collect();
        let done = non_epics
            .iter()
            .filter(|t| t.status_bucket() == TicketStatus::Done)
            .count();
        (done, non_epics.len())
    }
}
