use crate::infra::{demo_draw, InMemoryDrawRepository, LoggingNotificationPublisher};
use chrono::{Local, NaiveDate, Utc};
use clap::Args;
use std::collections::HashSet;
use std::sync::Arc;
use suite_draw::error::AppError;
use suite_draw::workflows::draw::{
    DrawAggregate, DrawError, DrawLifecycle, DrawPhase, EligibleGroup, GroupRegistry,
    NotificationDispatcher, PruneTarget, ReminderKind, SuiteSelection,
};

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Reporting date (YYYY-MM-DD). Defaults to today; deadlines are set from it.
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) today: Option<NaiveDate>,
}

pub(crate) fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let today = args.today.unwrap_or_else(|| Local::now().date_naive());
    let repository = Arc::new(InMemoryDrawRepository::default());
    let lifecycle = DrawLifecycle::new(repository.clone());

    let draft = lifecycle.open_draw(demo_draw(today))?;
    let draw_id = draft.id().clone();
    println!("== Suite draw demo ==");
    println!("Draw: {} ({})", draft.draw.name, draw_id);
    println!(
        "Applicants: {} | Groups: {} | Suites: {}",
        draft.applicants.len(),
        draft.groups.len(),
        draft.suites.len()
    );

    let activated = lifecycle.activate(&draw_id)?;
    println!(
        "\n[{}] invitations queued: {}",
        activated.phase, activated.notifications
    );

    let reminder = lifecycle.queue_reminder(&draw_id, ReminderKind::Intent, today, Utc::now())?;
    println!("Intent reminder queued for {} applicant(s)", reminder.recipients);

    let formation = lifecycle.proceed_to_group_formation(&draw_id)?;
    println!("\n[{}]", formation.phase);
    for demand in lifecycle.oversubscription(&draw_id)? {
        println!(
            "  size {}: {} group(s) for {} suite(s), excess {}",
            demand.size, demand.groups, demand.suites, demand.excess
        );
    }
    let pruned = lifecycle.prune(&draw_id, PruneTarget::Oversubscribed)?;
    println!("  {}", pruned.message);
    for group in &pruned.removed {
        println!("  - removed {group}");
    }

    let lottery = lifecycle.start_lottery(&draw_id)?;
    println!("\n[{}] units awaiting a number: {}", lottery.phase, lottery.roster.len());
    let total = lottery.roster.len();
    for (index, entry) in lottery.roster.into_iter().enumerate() {
        let number = (total - index) as i64;
        let assignment = lifecycle.assign_lottery_number(&draw_id, number, entry.owner)?;
        println!(
            "  #{:<3} {} (size {})",
            assignment.number,
            join(&entry.groups),
            entry.size
        );
    }

    let selection = lifecycle.start_selection(&draw_id)?;
    println!(
        "\n[{}] lottery results queued: {}",
        selection.phase, selection.lottery_results
    );

    let mut heads = selection.eligible;
    while let Some(head) = heads.first().cloned() {
        let aggregate = lifecycle.draw(&draw_id)?;
        let selections = choose_suites(&aggregate, &head)?;
        let picked = lifecycle.pick_suites(&draw_id, &head.group_id, &selections)?;
        for choice in &selections {
            println!(
                "  #{:<3} {} -> {}",
                head.lottery_number, choice.group_id, choice.suite_id
            );
        }
        heads = picked.next;
        if picked.phase == DrawPhase::Results {
            println!("\n[{}]", picked.phase);
        }
    }

    let stored = lifecycle.draw(&draw_id)?;
    let registry = GroupRegistry::new(&stored);
    let unhoused: Vec<_> = stored
        .groups
        .iter()
        .filter(|group| !registry.is_housed(&group.id))
        .map(|group| group.id.to_string())
        .collect();
    if !unhoused.is_empty() {
        println!("Groups without a suite: {}", unhoused.join(", "));
    }

    let publisher = Arc::new(LoggingNotificationPublisher::default());
    let dispatcher = NotificationDispatcher::new(repository, publisher.clone(), 50);
    let mut delivered = 0;
    loop {
        let report = dispatcher.dispatch_pending().map_err(DrawError::from)?;
        delivered += report.delivered;
        if report.delivered == 0 {
            break;
        }
    }

    println!("\nNotifications delivered: {delivered}");
    for (kind, count) in publisher.delivered_by_kind() {
        println!("  {kind}: {count}");
    }

    Ok(())
}

/// Gives every group in the unit the first free suite of its size.
fn choose_suites(
    aggregate: &DrawAggregate,
    head: &EligibleGroup,
) -> Result<Vec<SuiteSelection>, DrawError> {
    let registry = GroupRegistry::new(aggregate);
    let mut claimed = HashSet::new();
    let mut selections = Vec::with_capacity(head.members.len());
    for group_id in &head.members {
        let size = registry
            .group(group_id)
            .map(|group| group.size)
            .ok_or_else(|| DrawError::Conflict(format!("Group {group_id} left the draw.")))?;
        let suite = aggregate
            .suites
            .iter()
            .find(|suite| suite.size == size && suite.group.is_none() && !claimed.contains(&suite.id))
            .ok_or_else(|| DrawError::Conflict(format!("No free suite of size {size}.")))?;
        claimed.insert(suite.id.clone());
        selections.push(SuiteSelection {
            group_id: group_id.clone(),
            suite_id: suite.id.clone(),
        });
    }
    Ok(selections)
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" + ")
}
