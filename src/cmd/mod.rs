//! Terminal subcommands. All rendering happens here; the sync core only
//! hands out immutable view snapshots.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use pulse::config::SyncConfig;
use pulse::connection::ConnectionState;
use pulse::model::{MessageRole, TicketStatus};
use pulse::progress::project;
use pulse::rest::RestClient;
use pulse::sync::{JobSync, JobView, NoticeLevel};
use pulse::tickets::TicketNode;

/// Follow a job live until it reaches a terminal phase or the connection
/// gives up.
pub async fn watch(cfg: &SyncConfig, job_id: &str) -> Result<()> {
    let sync = JobSync::spawn(cfg, job_id).context("could not start job synchronization")?;
    let mut rx = sync.subscribe();

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos:>3}% {msg}")
            .expect("static template"),
    );

    let mut seen_messages = 0usize;
    let mut seen_steps = 0usize;
    let mut seen_notices = 0usize;

    loop {
        let view = rx.borrow_and_update().clone();

        bar.set_position(u64::from(view.progress.percent));
        bar.set_message(format!("{} [{}]", view.progress.phase, view.connection));

        for msg in view.messages.iter().skip(seen_messages) {
            let who = match msg.role {
                MessageRole::User => style(msg.sender.as_str()).green().bold(),
                MessageRole::Agent => style(msg.sender.as_str()).cyan().bold(),
                MessageRole::System => style(msg.sender.as_str()).yellow().bold(),
            };
            bar.println(format!("{who}: {}", msg.content));
        }
        seen_messages = view.messages.len();

        for step in view.steps.iter().skip(seen_steps) {
            bar.println(format!("  {} {}", style(&step.agent).dim(), style(&step.message).dim()));
        }
        seen_steps = view.steps.len();

        for notice in view.notices.iter().skip(seen_notices) {
            let tag = match notice.level {
                NoticeLevel::Info => style("notice").dim(),
                NoticeLevel::Warning => style("warning").yellow(),
                NoticeLevel::Error => style("error").red(),
            };
            bar.println(format!("[{tag}] {}", notice.message));
        }
        seen_notices = view.notices.len();

        let done = view.phase.is_some_and(|p| p.is_terminal())
            || matches!(
                view.connection,
                ConnectionState::ClosedClean
                    | ConnectionState::ClosedError
                    | ConnectionState::Exhausted
            );
        if done {
            bar.finish_with_message(view.progress.phase.clone());
            if let Some(err) = &view.last_error {
                eprintln!("{} {err}", style("Error:").red().bold());
            }
            break;
        }

        if rx.changed().await.is_err() {
            bar.abandon();
            break;
        }
    }

    sync.shutdown();
    Ok(())
}

/// One-shot snapshot: job phase, projected progress, ticket tree.
pub async fn status(cfg: &SyncConfig, job_id: &str) -> Result<()> {
    let rest = RestClient::new(cfg);
    let job = rest.job(job_id).await?;
    let tickets = rest.tickets(job_id).await.unwrap_or_default();

    let progress = match job.phase() {
        Some(phase) => project(phase, job.error.as_deref(), &tickets, None),
        None => bail!("server reported unknown job status '{}'", job.status),
    };

    println!("{} {}", style("Job:").bold(), job.id);
    if !job.prompt.is_empty() {
        println!("{} {}", style("Prompt:").bold(), job.prompt);
    }
    println!("{} {} ({}%)", style("Phase:").bold(), progress.phase, progress.percent);
    if let Some(err) = &job.error {
        println!("{} {err}", style("Error:").red().bold());
    }

    if !tickets.is_empty() {
        let mut reconciler = pulse::tickets::TicketReconciler::new();
        reconciler.reset(tickets);
        let (done, total) = reconciler.counts();
        println!("{} {done}/{total} done", style("Tickets:").bold());
        for node in reconciler.tree() {
            print_node(&node);
        }
    }
    Ok(())
}

fn print_node(node: &TicketNode) {
    println!("  {} {}", status_icon(&node.ticket.status), node.ticket.title);
    for child in &node.children {
        println!("    {} {}", status_icon(&child.status), child.title);
    }
}

fn status_icon(raw: &str) -> console::StyledObject<&'static str> {
    match TicketStatus::normalize(raw) {
        TicketStatus::Done => style("✔").green(),
        TicketStatus::InProgress => style("▸").yellow(),
        TicketStatus::Todo => style("·").dim(),
    }
}

/// Send one operator message, waiting briefly for the connection to open.
pub async fn send(cfg: &SyncConfig, job_id: &str, message: &str) -> Result<()> {
    let sync = JobSync::spawn(cfg, job_id).context("could not start job synchronization")?;
    let mut rx = sync.subscribe();

    let opened = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let view: JobView = rx.borrow_and_update().clone();
            match view.connection {
                ConnectionState::Open => return true,
                ConnectionState::ClosedError
                | ConnectionState::ClosedClean
                | ConnectionState::Exhausted => return false,
                _ => {}
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    })
    .await
    .unwrap_or(false);

    if !opened {
        bail!("could not open the job stream");
    }

    sync.send_chat(message).await?;
    println!("{} {message}", style("Sent:").green().bold());
    sync.shutdown();
    Ok(())
}
