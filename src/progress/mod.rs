//! Projection of the job lifecycle (plus ticket completion) into a bounded
//! progress value with a human phase description.
//!
//! `project` is a pure function of its inputs; the caller memoizes the last
//! in-progress percent so a failure can report partial completion instead of
//! erasing evidence of completed work.

use crate::model::{JobPhase, TicketKind, TicketRecord, TicketStatus};

/// Baseline percent for the building phase; ticket completion interpolates
/// between this and 100.
const BUILDING_BASELINE: u8 = 70;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Always within 0..=100.
    pub percent: u8,
    pub phase: String,
}

fn baseline(phase: JobPhase) -> u8 {
    match phase {
        JobPhase::Collecting => 5,
        JobPhase::Queued => 10,
        JobPhase::Planning => 25,
        JobPhase::PrdReady => 40,
        JobPhase::Ticketing => 55,
        JobPhase::TicketsReady => 65,
        JobPhase::Building => BUILDING_BASELINE,
        JobPhase::BuildDone | JobPhase::Done => 100,
        JobPhase::Failed => 0,
    }
}

fn label(phase: JobPhase) -> &'static str {
    match phase {
        JobPhase::Collecting => "Collecting requirements",
        JobPhase::Queued => "Queued",
        JobPhase::Planning => "Planning",
        JobPhase::PrdReady => "Plan ready",
        JobPhase::Ticketing => "Writing tickets",
        JobPhase::TicketsReady => "Tickets ready",
        JobPhase::Building => "Building",
        JobPhase::BuildDone | JobPhase::Done => "Done",
        JobPhase::Failed => "Failed",
    }
}

/// Project a lifecycle phase and the current ticket set into progress.
///
/// `prior_percent` is the last percent projected for a non-failed phase;
/// a failed job reports it (or 0 if no work had started).
pub fn project(
    phase: JobPhase,
    error: Option<&str>,
    tickets: &[TicketRecord],
    prior_percent: Option<u8>,
) -> Progress {
    let percent = match phase {
        JobPhase::Failed => prior_percent.unwrap_or(0),
        JobPhase::Building => {
            let non_epics: Vec<&TicketRecord> =
                tickets.iter().filter(|t| t.kind != TicketKind::Epic).collect();
            if non_epics.is_empty() {
                BUILDING_BASELINE
            } else {
                let done = non_epics
                    .iter()
                    .filter(|t| t.status_bucket() == TicketStatus::Done)
                    .count();
                let span = u32::from(100 - BUILDING_BASELINE);
                let interpolated = (done as u32 * span) / non_epics.len() as u32;
                BUILDING_BASELINE + interpolated as u8
            }
        }
        other => baseline(other),
    };

    let phase_text = match (phase, error) {
        (JobPhase::Failed, Some(err)) if !err.is_empty() => format!("{}: {}", label(phase), err),
        _ => label(phase).to_string(),
    };

    Progress { percent: percent.min(100), phase: phase_text }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn test_baselines_increase_across_phase_ordering() {
        let phases = [
            JobPhase::Collecting,
            JobPhase::Queued,
            JobPhase::Planning,
            JobPhase::PrdReady,
            JobPhase::Ticketing,
            JobPhase::TicketsReady,
            JobPhase::Building,
            JobPhase::Done,
        ];
        let percents: Vec<u8> =
            phases.iter().map(|p| project(*p, None, &[], None).percent).collect();
        for pair in percents.windows(2) {
            assert!(pair[0] < pair[1], "expected {} < {}", pair[0], pair[1]);
        }
        assert!(*percents.last().unwrap() <= 100);
    }

    #[test]
    fn test_building_without_tickets_holds_baseline() {
        let p = project(JobPhase::Building, None, &[], None);
        assert_eq!(p.percent, 70);
        assert_eq!(p.phase, "Building");
    }

    #[test]
    fn test_building_interpolates_over_non_epic_tickets() {
        let tickets = vec![
            ticket("e-1", TicketKind::Epic, "done"), // excluded from the ratio
            ticket("s-1", TicketKind::Story, "done"),
            ticket("s-2", TicketKind::Story, "todo"),
            ticket("s-3", TicketKind::Task, "todo"),
        ];
        let p = project(JobPhase::Building, None, &tickets, None);
        assert_eq!(p.percent, 80); // 70 + 1/3 of 30
    }

    #[test]
    fn test_building_all_done_reaches_100() {
        let tickets = vec![
            ticket("s-1", TicketKind::Story, "done"),
            ticket("s-2", TicketKind::Story, "completed"),
        ];
        let p = project(JobPhase::Building, None, &tickets, None);
        assert_eq!(p.percent, 100);
    }

    #[test]
    fn test_progress_monotonic_as_tickets_complete() {
        // Building with [todo,todo,todo], then two flips to done: the
        // reported percent must only move forward.
        let before = vec![
            ticket("s-1", TicketKind::Story, "todo"),
            ticket("s-2", TicketKind::Story, "todo"),
            ticket("s-3", TicketKind::Story, "todo"),
        ];
        let after = vec![
            ticket("s-1", TicketKind::Story, "done"),
            ticket("s-2", TicketKind::Story, "done"),
            ticket("s-3", TicketKind::Story, "todo"),
        ];
        let p0 = project(JobPhase::Building, None, &before, None);
        let p1 = project(JobPhase::Building, None, &after, None);
        assert!(p1.percent > p0.percent);
        assert!(p1.percent <= 100);
    }

    #[test]
    fn test_failed_before_any_work_reports_zero() {
        let p = project(JobPhase::Failed, Some("planner crashed"), &[], None);
        assert_eq!(p.percent, 0);
        assert_eq!(p.phase, "Failed: planner crashed");
    }

    #[test]
    fn test_failed_keeps_prior_percent() {
        let p = project(JobPhase::Failed, None, &[], Some(80));
        assert_eq!(p.percent, 80);
        assert_eq!(p.phase, "Failed");
    }

    #[test]
    fn test_terminal_phases_report_100() {
        assert_eq!(project(JobPhase::BuildDone, None, &[], None).percent, 100);
        assert_eq!(project(JobPhase::Done, None, &[], None).percent, 100);
    }

    #[test]
    fn test_projection_is_deterministic() {
        let tickets = vec![ticket("s-1", TicketKind::Story, "done")];
        let a = project(JobPhase::Building, None, &tickets, Some(42));
        let b = project(JobPhase::Building, None, &tickets, Some(42));
        assert_eq!(a, b);
    }
}
